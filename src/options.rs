//! Session configuration options.
//!
//! Options are collected by the [`SessionBuilder`](crate::SessionBuilder)
//! and validated once when the session is constructed; after that they
//! are immutable.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{GridLinkError, Result};

/// Default grid endpoint.
pub const DEFAULT_ADDRESS: &str = "localhost:1408";

/// Default codec format.
pub const DEFAULT_FORMAT: &str = "json";

/// Default unary request deadline in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MILLIS: i64 = 60_000;

/// Session-level configuration.
///
/// # Example
///
/// ```rust
/// use gridlink::SessionOptions;
///
/// let options = SessionOptions::default()
///     .with_address("grid.internal:1408")
///     .with_request_timeout_millis(30_000);
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Grid endpoint as `host:port`.
    #[serde(default = "default_address")]
    pub address: String,

    /// Unary request deadline in milliseconds. Zero or negative means
    /// unbounded.
    #[serde(default = "default_request_timeout_millis")]
    pub request_timeout_millis: i64,

    /// Codec format tag used for maps opened without an explicit codec.
    #[serde(default = "default_format")]
    pub format: String,

    /// Transport security options.
    #[serde(default)]
    pub tls: TlsOptions,
}

fn default_address() -> String {
    DEFAULT_ADDRESS.to_string()
}

fn default_request_timeout_millis() -> i64 {
    DEFAULT_REQUEST_TIMEOUT_MILLIS
}

fn default_format() -> String {
    DEFAULT_FORMAT.to_string()
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            address: default_address(),
            request_timeout_millis: default_request_timeout_millis(),
            format: default_format(),
            tls: TlsOptions::default(),
        }
    }
}

impl SessionOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the grid endpoint (`host:port`).
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the unary request deadline in milliseconds. Zero or negative
    /// means unbounded.
    pub fn with_request_timeout_millis(mut self, millis: i64) -> Self {
        self.request_timeout_millis = millis;
        self
    }

    /// Set the default codec format tag.
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    /// Set the TLS options.
    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Validate the options.
    ///
    /// Checks the address shape and, when TLS is enabled, that all three
    /// PEM paths are configured and readable.
    pub fn validate(&self) -> Result<()> {
        let address_re = Regex::new(r"^\S+:\d{1,5}$").expect("address pattern is valid");
        if !address_re.is_match(&self.address) {
            return Err(GridLinkError::BadConfig(format!(
                "Invalid address '{}': expected host:port",
                self.address
            )));
        }
        self.tls.validate()
    }
}

/// Transport security options.
///
/// When `enabled` is true, all three PEM paths must point at readable
/// files; the session fails to build otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Enable TLS on both the unary channel and the event stream.
    #[serde(default)]
    pub enabled: bool,

    /// Path to the CA certificate bundle (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<String>,

    /// Path to the client certificate (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert_path: Option<String>,

    /// Path to the client private key (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_path: Option<String>,
}

impl TlsOptions {
    /// Create disabled TLS options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable TLS.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the CA certificate path.
    pub fn with_ca_cert_path(mut self, path: impl Into<String>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    /// Set the client certificate path.
    pub fn with_client_cert_path(mut self, path: impl Into<String>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    /// Set the client private key path.
    pub fn with_client_key_path(mut self, path: impl Into<String>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    /// Validate that the enabled configuration is complete and the
    /// referenced files are readable.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        for (label, path) in [
            ("tls.ca_cert_path", &self.ca_cert_path),
            ("tls.client_cert_path", &self.client_cert_path),
            ("tls.client_key_path", &self.client_key_path),
        ] {
            let path = path.as_deref().ok_or_else(|| {
                GridLinkError::BadConfig(format!(
                    "tls.enabled=true but {} is not configured",
                    label
                ))
            })?;
            std::fs::metadata(path).map_err(|e| {
                GridLinkError::BadConfig(format!("Failed reading {} '{}': {}", label, path, e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SessionOptions::default();
        assert_eq!(options.address, "localhost:1408");
        assert_eq!(options.request_timeout_millis, 60_000);
        assert_eq!(options.format, "json");
        assert!(!options.tls.enabled);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_address_validation() {
        assert!(SessionOptions::new().with_address("grid:1408").validate().is_ok());
        assert!(SessionOptions::new().with_address("10.0.0.1:65535").validate().is_ok());

        for bad in ["", "nohost", "no port:", "host:notaport", "ho st:1408", "host:123456"] {
            let err = SessionOptions::new().with_address(bad).validate().unwrap_err();
            assert!(matches!(err, GridLinkError::BadConfig(_)), "address '{}' should fail", bad);
        }
    }

    #[test]
    fn test_tls_requires_all_paths() {
        let options = SessionOptions::new().with_tls(
            TlsOptions::new()
                .with_enabled(true)
                .with_client_cert_path("/tmp/cert.pem")
                .with_client_key_path("/tmp/key.pem"),
        );
        let err = options.validate().unwrap_err();
        match err {
            GridLinkError::BadConfig(msg) => assert!(msg.contains("ca_cert_path")),
            other => panic!("expected BadConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_tls_requires_readable_files() {
        let options = SessionOptions::new().with_tls(
            TlsOptions::new()
                .with_enabled(true)
                .with_ca_cert_path("/definitely/not/here/ca.pem")
                .with_client_cert_path("/definitely/not/here/cert.pem")
                .with_client_key_path("/definitely/not/here/key.pem"),
        );
        assert!(matches!(options.validate(), Err(GridLinkError::BadConfig(_))));
    }

    #[test]
    fn test_deserialization_with_defaults() {
        let options: SessionOptions = serde_json::from_str(r#"{"address": "grid:1234"}"#).unwrap();
        assert_eq!(options.address, "grid:1234");
        assert_eq!(options.format, "json");
        assert_eq!(options.request_timeout_millis, 60_000);
    }
}
