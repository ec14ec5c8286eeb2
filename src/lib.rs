//! gridlink — client library for a remote, partitioned, in-memory
//! key-value grid.
//!
//! Applications open a [`Session`] against a grid endpoint, obtain one
//! or more [`NamedMap`] handles, and perform entry-level operations
//! (read, write, conditional mutate, remove, pattern query) plus
//! change-notification subscriptions scoped to individual keys or to
//! server-side [`Filter`] predicates. Handles:
//!
//! - One shared request channel per session, one duplex event stream
//!   per named map
//! - Collapsing many application listeners onto the minimum number of
//!   server subscriptions, including lite/non-lite transitions
//! - A composable, serializer-neutral filter and extractor algebra
//! - Ordered, idempotent session teardown
//!
//! # Example
//!
//! ```rust,no_run
//! use gridlink::{Filters, MapListener, Session};
//!
//! # async fn example() -> gridlink::Result<()> {
//! let session = Session::builder()
//!     .address("localhost:1408")
//!     .build()?;
//!
//! let orders = session.map::<String, String>("orders")?;
//! orders.put("o-1".to_string(), "pending".to_string()).await?;
//!
//! let listener = MapListener::new()
//!     .on_updated(|event| println!("order changed: {:?}", event.key));
//! let shipped = Filters::equal("state", "shipped")?;
//! orders.add_filter_listener(&listener, &shipped, false).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod codec;
mod dispatcher;
pub mod error;
mod executor;
pub mod extractor;
pub mod filter;
pub mod listener;
pub mod map;
pub mod models;
pub mod options;
pub mod processor;
mod request;
pub mod session;
pub mod timeouts;
mod tls;

pub use auth::AuthProvider;
pub use codec::{Codec, JsonCodec};
pub use error::{GridLinkError, Result};
pub use extractor::{Extractors, ValueExtractor};
pub use filter::{event_mask, Filter, Filters, IntoExtractor};
pub use listener::{MapEvent, MapLifecycleListener, MapListener};
pub use map::NamedMap;
pub use models::MapEventKind;
pub use options::{SessionOptions, TlsOptions};
pub use processor::{Processor, Processors};
pub use session::{Session, SessionBuilder, SessionEventHandlers};
pub use timeouts::GridLinkTimeouts;
