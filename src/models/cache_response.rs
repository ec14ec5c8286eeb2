use serde::{Deserialize, Serialize};

use super::cache_entry::CacheEntry;
use super::error_detail::ErrorDetail;
use super::query_page::QueryPage;
use super::response_status::ResponseStatus;

/// Envelope for every unary cache response.
///
/// Exactly one of the result fields is populated, matching the request's
/// operation; an empty or absent `value` decodes as a null result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheResponse {
    /// Correlation id echoed from the request.
    pub id: String,

    /// Overall status.
    pub status: ResponseStatus,

    /// Single-value result (get, put, remove, replace, invoke).
    /// Absent or empty means null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<super::payload::Payload>,

    /// Boolean result (contains*, mapping ops, is_empty).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<bool>,

    /// Numeric result (size).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,

    /// Entry-valued result (get_all, invoke_all).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<CacheEntry>>,

    /// Query page result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<QueryPage>,

    /// Error detail when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}
