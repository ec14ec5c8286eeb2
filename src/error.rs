//! Error types for gridlink client operations.
//!
//! A single error enum covers every failure surface: transport faults,
//! deadline expiry, codec failures, configuration problems, and errors
//! propagated from the grid itself.

use std::fmt;

/// Result type alias using [`GridLinkError`]
pub type Result<T> = std::result::Result<T, GridLinkError>;

/// Errors that can occur during gridlink operations.
///
/// # Examples
///
/// ```rust,no_run
/// use gridlink::{GridLinkError, Session};
///
/// # async fn example() -> gridlink::Result<()> {
/// let session = Session::builder()
///     .address("localhost:1408")
///     .build()?;
///
/// let orders = session.map::<String, String>("orders")?;
/// match orders.get(&"o-1".to_string()).await {
///     Ok(value) => println!("value: {:?}", value),
///     Err(GridLinkError::Transport(msg)) => eprintln!("grid unreachable: {}", msg),
///     Err(e) => eprintln!("other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub enum GridLinkError {
    /// Network or channel-level failures
    Transport(String),

    /// The request deadline elapsed before the grid responded
    Timeout(String),

    /// The codec rejected an input value, or could not decode a payload
    BadValue(String),

    /// Invalid session configuration (address, TLS material)
    BadConfig(String),

    /// The session has been closed; no further operations are accepted
    SessionClosed,

    /// The named map has been released or destroyed
    CacheNotActive(String),

    /// The event stream ended before an outstanding request was acknowledged
    StreamClosed(String),

    /// Error propagated from the grid
    Server {
        /// Server error code
        code: String,
        /// Error message from the grid
        message: String,
    },

    /// JSON serialization/deserialization errors on the wire
    Serialization(String),
}

impl fmt::Display for GridLinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Transport error: {}", msg),
            Self::Timeout(msg) => write!(f, "Timeout: {}", msg),
            Self::BadValue(msg) => write!(f, "Bad value: {}", msg),
            Self::BadConfig(msg) => write!(f, "Configuration error: {}", msg),
            Self::SessionClosed => write!(f, "Session is closed"),
            Self::CacheNotActive(name) => write!(f, "Cache '{}' is no longer active", name),
            Self::StreamClosed(msg) => write!(f, "Event stream closed: {}", msg),
            Self::Server { code, message } => write!(f, "Server error ({}): {}", code, message),
            Self::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for GridLinkError {}

impl From<reqwest::Error> for GridLinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Transport(format!("Connection failed: {}", err))
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GridLinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GridLinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GridLinkError::Transport("connection refused".to_string());
        assert_eq!(err.to_string(), "Transport error: connection refused");

        let err = GridLinkError::Server {
            code: "INTERNAL".to_string(),
            message: "partition unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "Server error (INTERNAL): partition unavailable");

        let err = GridLinkError::SessionClosed;
        assert_eq!(err.to_string(), "Session is closed");

        let err = GridLinkError::CacheNotActive("orders".to_string());
        assert_eq!(err.to_string(), "Cache 'orders' is no longer active");
    }
}
