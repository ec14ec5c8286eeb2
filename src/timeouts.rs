//! Timeout configuration for grid client operations.
//!
//! Centralizes deadlines for unary requests, event-stream establishment,
//! subscription acknowledgements, and WebSocket keepalive.

use std::time::Duration;

/// Timeout configuration for grid client operations.
///
/// # Examples
///
/// ```rust
/// use gridlink::GridLinkTimeouts;
/// use std::time::Duration;
///
/// // Defaults (recommended for most deployments)
/// let timeouts = GridLinkTimeouts::default();
///
/// // Custom deadlines for high-latency links
/// let timeouts = GridLinkTimeouts::builder()
///     .connection_timeout(Duration::from_secs(30))
///     .request_timeout(Duration::from_secs(120))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct GridLinkTimeouts {
    /// Timeout for establishing connections (TCP + TLS handshake).
    /// Default: 10 seconds
    pub connection_timeout: Duration,

    /// Deadline for a unary request, from send to response.
    /// Set to zero for no deadline.
    /// Default: 60 seconds
    pub request_timeout: Duration,

    /// Timeout for an event-stream subscription acknowledgement.
    /// Default: 5 seconds
    pub subscribe_timeout: Duration,

    /// Keep-alive ping interval for the event stream.
    /// Set to zero to disable keep-alive pings.
    /// Default: 10 seconds
    pub keepalive_interval: Duration,

    /// Maximum wait for a Pong after a keepalive Ping; past the window
    /// the stream is treated as dead. Set to zero to disable.
    /// Default: 5 seconds
    pub pong_timeout: Duration,
}

impl Default for GridLinkTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            subscribe_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(5),
        }
    }
}

impl GridLinkTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> GridLinkTimeoutsBuilder {
        GridLinkTimeoutsBuilder::new()
    }

    /// Timeouts optimized for local development.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(5),
        }
    }

    /// Timeouts optimized for high-latency or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(180),
            subscribe_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }

    /// Check whether a duration represents "no deadline" (zero or
    /// absurdly large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365)
    }
}

/// Builder for [`GridLinkTimeouts`] configurations.
#[derive(Debug, Clone)]
pub struct GridLinkTimeoutsBuilder {
    timeouts: GridLinkTimeouts,
}

impl GridLinkTimeoutsBuilder {
    fn new() -> Self {
        Self { timeouts: GridLinkTimeouts::default() }
    }

    /// Set the connection timeout (TCP + TLS handshake).
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set the unary request deadline. Zero means no deadline.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request_timeout = timeout;
        self
    }

    /// Set the subscription acknowledgement timeout.
    pub fn subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.subscribe_timeout = timeout;
        self
    }

    /// Set the keepalive ping interval. Zero disables pings.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.timeouts.keepalive_interval = interval;
        self
    }

    /// Set the pong timeout. Zero disables the check.
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.pong_timeout = timeout;
        self
    }

    /// Build the timeout configuration.
    pub fn build(self) -> GridLinkTimeouts {
        self.timeouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = GridLinkTimeouts::default();
        assert_eq!(timeouts.request_timeout, Duration::from_secs(60));
        assert_eq!(timeouts.connection_timeout, Duration::from_secs(10));
        assert_eq!(timeouts.subscribe_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_builder() {
        let timeouts = GridLinkTimeouts::builder()
            .connection_timeout(Duration::from_secs(60))
            .request_timeout(Duration::from_secs(120))
            .build();

        assert_eq!(timeouts.connection_timeout, Duration::from_secs(60));
        assert_eq!(timeouts.request_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_is_no_timeout() {
        assert!(GridLinkTimeouts::is_no_timeout(Duration::ZERO));
        assert!(!GridLinkTimeouts::is_no_timeout(Duration::from_secs(1)));
    }
}
