//! Wire types for the gridlink client.
//!
//! Defines the request and response envelopes for unary cache
//! operations and the message set of the duplex event stream.

pub mod cache_entry;
pub mod cache_request;
pub mod cache_response;
pub mod error_detail;
pub mod payload;
pub mod query_page;
pub mod response_status;
pub mod stream_message;


pub use cache_entry::CacheEntry;
pub use cache_request::{CacheOp, CacheRequest, QueryKind};
pub use cache_response::CacheResponse;
pub use error_detail::ErrorDetail;
pub use payload::Payload;
pub use query_page::{QueryItem, QueryPage};
pub use response_status::ResponseStatus;
pub use stream_message::{MapEventKind, StreamRequest, StreamResponse};
