//! Authentication provider for the grid client.
//!
//! Handles bearer tokens and HTTP Basic Auth, attaching the appropriate
//! Authorization header to unary requests and to the event-stream
//! upgrade request.

use base64::{engine::general_purpose, Engine as _};

use crate::error::{GridLinkError, Result};

/// Authentication credentials for the grid.
///
/// # Examples
///
/// ```rust
/// use gridlink::AuthProvider;
///
/// // HTTP Basic Auth
/// let auth = AuthProvider::basic("alice".to_string(), "secret".to_string());
///
/// // Bearer token
/// let auth = AuthProvider::token("eyJhbGc...".to_string());
///
/// // No authentication
/// let auth = AuthProvider::none();
/// ```
#[derive(Debug, Clone)]
pub enum AuthProvider {
    /// HTTP Basic Auth (username, password)
    Basic(String, String),

    /// Bearer token authentication
    Token(String),

    /// No authentication
    None,
}

impl AuthProvider {
    /// Create HTTP Basic Auth credentials.
    pub fn basic(username: String, password: String) -> Self {
        Self::Basic(username, password)
    }

    /// Create bearer-token credentials.
    pub fn token(token: String) -> Self {
        Self::Token(token)
    }

    /// No authentication.
    pub fn none() -> Self {
        Self::None
    }

    /// Render the Authorization header value, if any.
    ///
    /// - Basic: `Basic <base64(username:password)>` per RFC 7617
    /// - Token: `Bearer <token>`
    /// - None: no header
    pub(crate) fn header_value(&self) -> Option<String> {
        match self {
            Self::Basic(username, password) => {
                let credentials = format!("{}:{}", username, password);
                let encoded = general_purpose::STANDARD.encode(credentials.as_bytes());
                Some(format!("Basic {}", encoded))
            }
            Self::Token(token) => Some(format!("Bearer {}", token)),
            Self::None => None,
        }
    }

    /// Attach authentication headers to an HTTP request builder.
    pub(crate) fn apply_to_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.header_value() {
            Some(value) => request.header(reqwest::header::AUTHORIZATION, value),
            None => request,
        }
    }

    /// Attach authentication headers to a WebSocket upgrade request.
    pub(crate) fn apply_to_ws_request(
        &self,
        request: &mut tokio_tungstenite::tungstenite::http::Request<()>,
    ) -> Result<()> {
        use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};

        if let Some(value) = self.header_value() {
            let header_value = HeaderValue::from_str(&value).map_err(|e| {
                GridLinkError::BadConfig(format!("Invalid Authorization header value: {}", e))
            })?;
            request.headers_mut().insert(AUTHORIZATION, header_value);
        }
        Ok(())
    }
}
