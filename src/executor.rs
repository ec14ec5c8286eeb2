//! Unary request execution over the session's shared HTTP channel.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::auth::AuthProvider;
use crate::error::{GridLinkError, Result};
use crate::models::{CacheRequest, CacheResponse, ResponseStatus};
use crate::timeouts::GridLinkTimeouts;

/// Executes unary cache requests against the grid endpoint.
///
/// One executor is shared by every named map of a session; it borrows
/// the session's pooled HTTP client. Requests are never retried — retry
/// is an application policy, and the grid contract guarantees nothing
/// about idempotence of mutating operations.
#[derive(Clone)]
pub(crate) struct RequestExecutor {
    http_client: reqwest::Client,
    url: String,
    auth: AuthProvider,
    request_timeout: Option<Duration>,
}

impl RequestExecutor {
    pub(crate) fn new(
        http_client: reqwest::Client,
        base_url: &str,
        auth: AuthProvider,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            http_client,
            url: format!("{}/v1/cache", base_url),
            auth,
            request_timeout,
        }
    }

    /// Send one request and decode the response envelope.
    pub(crate) async fn execute(&self, request: &CacheRequest) -> Result<CacheResponse> {
        let started = Instant::now();
        debug!(
            "[gridlink] Sending {} request to {} (cache={})",
            operation_name(request),
            self.url,
            request.cache
        );

        let builder = self.auth.apply_to_request(self.http_client.post(&self.url).json(request));

        let send = builder.send();
        let response = match self.request_timeout {
            Some(deadline) if !GridLinkTimeouts::is_no_timeout(deadline) => {
                match tokio::time::timeout(deadline, send).await {
                    Ok(result) => result?,
                    Err(_) => {
                        warn!(
                            "[gridlink] Request deadline elapsed after {:?} (cache={})",
                            deadline, request.cache
                        );
                        return Err(GridLinkError::Timeout(format!(
                            "request deadline elapsed ({:?})",
                            deadline
                        )));
                    }
                }
            }
            _ => send.await?,
        };

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());

            // The grid reports structured errors in the response envelope
            // even on non-2xx statuses; fall back to the raw body.
            let (code, message) = match serde_json::from_str::<CacheResponse>(&error_text) {
                Ok(envelope) => match envelope.error {
                    Some(detail) => (detail.code, detail.message),
                    None => (status.as_u16().to_string(), error_text),
                },
                Err(_) => (status.as_u16().to_string(), error_text),
            };

            warn!(
                "[gridlink] Server error: status={} code={} duration_ms={}",
                status,
                code,
                started.elapsed().as_millis()
            );
            return Err(GridLinkError::Server { code, message });
        }

        let envelope: CacheResponse = response.json().await?;
        if envelope.status == ResponseStatus::Error {
            let detail = envelope.error.unwrap_or_else(|| crate::models::ErrorDetail {
                code: "unknown".to_string(),
                message: "grid reported an error without detail".to_string(),
                details: None,
            });
            return Err(GridLinkError::Server { code: detail.code, message: detail.message });
        }

        debug!(
            "[gridlink] {} completed in {}ms (cache={})",
            operation_name(request),
            started.elapsed().as_millis(),
            request.cache
        );
        Ok(envelope)
    }
}

fn operation_name(request: &CacheRequest) -> &'static str {
    use crate::models::CacheOp::*;
    match request.op {
        Get { .. } => "get",
        GetAll { .. } => "get_all",
        Put { .. } => "put",
        PutIfAbsent { .. } => "put_if_absent",
        PutAll { .. } => "put_all",
        Remove { .. } => "remove",
        RemoveMapping { .. } => "remove_mapping",
        Replace { .. } => "replace",
        ReplaceMapping { .. } => "replace_mapping",
        ContainsKey { .. } => "contains_key",
        ContainsValue { .. } => "contains_value",
        ContainsEntry { .. } => "contains_entry",
        Size => "size",
        IsEmpty => "is_empty",
        Clear => "clear",
        Truncate => "truncate",
        Query { .. } => "query",
        Invoke { .. } => "invoke",
        InvokeAll { .. } => "invoke_all",
        AddIndex { .. } => "add_index",
        RemoveIndex { .. } => "remove_index",
        Destroy => "destroy",
    }
}
