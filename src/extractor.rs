//! Value extractors: server-interpretable projections over stored entries.
//!
//! An extractor describes how the grid should reach an attribute of an
//! entry's value — identity, a single named attribute, or a chain of
//! attributes composed left-to-right. Extractors are referenced by
//! filters, indices, and entry processors; they are immutable once
//! constructed and serialize to an `@class`-tagged tree.

use serde::{Deserialize, Serialize};

/// An immutable extractor tree node.
///
/// Build instances through [`Extractors`]; the enum is public so filters
/// and processors can embed extractor trees directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "@class")]
pub enum ValueExtractor {
    /// Returns the entry value itself.
    #[serde(rename = "IdentityExtractor")]
    Identity,

    /// Projects the attribute reachable by `name` on the entry value.
    /// An empty name is equivalent to identity.
    #[serde(rename = "UniversalExtractor")]
    Universal {
        /// Attribute name.
        name: String,
    },

    /// Composes child extractors left-to-right.
    #[serde(rename = "ChainedExtractor")]
    Chained {
        /// Extractors applied in order.
        extractors: Vec<ValueExtractor>,
    },
}

/// Factory for [`ValueExtractor`] trees.
///
/// # Examples
///
/// ```rust
/// use gridlink::Extractors;
///
/// // Single attribute
/// let age = Extractors::extract("age");
///
/// // Dot-separated paths compose left-to-right
/// let city = Extractors::extract("address.city");
/// ```
pub struct Extractors;

impl Extractors {
    /// The identity extractor.
    pub fn identity() -> ValueExtractor {
        ValueExtractor::Identity
    }

    /// Extract the attribute reachable by `name`.
    ///
    /// A name without `.` builds a universal extractor; a name containing
    /// `.` builds a chain of universal extractors, one per path segment.
    pub fn extract(name: impl Into<String>) -> ValueExtractor {
        let name = name.into();
        if name.contains('.') {
            Self::chained(name.split('.'))
        } else {
            ValueExtractor::Universal { name }
        }
    }

    /// Chain the given attribute names left-to-right.
    pub fn chained<I, S>(names: I) -> ValueExtractor
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ValueExtractor::Chained {
            extractors: names
                .into_iter()
                .map(|name| ValueExtractor::Universal { name: name.into() })
                .collect(),
        }
    }
}
