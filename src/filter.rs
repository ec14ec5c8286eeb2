//! Filter algebra: server-interpretable predicates over grid entries.
//!
//! Filters are immutable trees. Each node carries an `@class` type tag
//! the grid recognizes; the client only builds and serializes trees, it
//! never evaluates them. Leaves are created through [`Filters`];
//! combinators on [`Filter`] produce new trees without mutating their
//! inputs.
//!
//! Wire-form rules the factories enforce:
//!
//! - `is_null` / `is_not_null` reduce to equality against JSON null.
//! - `between` wraps the AND of its lower/upper comparisons, chosen by
//!   the inclusion flags.
//! - Set-valued arguments are materialized into sorted sequences so the
//!   serialized form is stable no matter how the caller's set iterates.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{GridLinkError, Result};
use crate::extractor::{Extractors, ValueExtractor};

/// Event mask bits recognized by the map-event filter.
pub mod event_mask {
    /// Entry inserted.
    pub const INSERTED: u32 = 0x01;
    /// Entry updated.
    pub const UPDATED: u32 = 0x02;
    /// Entry deleted.
    pub const DELETED: u32 = 0x04;
    /// Update moved the entry into the filtered set.
    pub const UPDATED_ENTERED: u32 = 0x08;
    /// Update moved the entry out of the filtered set.
    pub const UPDATED_LEFT: u32 = 0x10;
    /// Update kept the entry within the filtered set.
    pub const UPDATED_WITHIN: u32 = 0x20;

    /// Default mask when a map-event filter is built from an inner
    /// filter alone.
    pub const DEFAULT: u32 = INSERTED | DELETED | UPDATED_ENTERED | UPDATED_LEFT;
}

/// An immutable filter tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@class")]
pub enum Filter {
    /// Matches every entry.
    #[serde(rename = "AlwaysFilter")]
    Always,

    /// Matches no entry.
    #[serde(rename = "NeverFilter")]
    Never,

    /// Matches entries that exist.
    #[serde(rename = "PresentFilter")]
    Present,

    /// Logical conjunction of child filters.
    #[serde(rename = "AndFilter")]
    And {
        /// Child filters, all of which must match.
        filters: Vec<Filter>,
    },

    /// Logical disjunction of child filters.
    #[serde(rename = "OrFilter")]
    Or {
        /// Child filters, any of which may match.
        filters: Vec<Filter>,
    },

    /// Exclusive disjunction of child filters.
    #[serde(rename = "XorFilter")]
    Xor {
        /// Child filters, exactly one of which must match.
        filters: Vec<Filter>,
    },

    /// Negation of a child filter.
    #[serde(rename = "NotFilter")]
    Not {
        /// The negated filter.
        filter: Box<Filter>,
    },

    /// Extracted value equals the literal.
    #[serde(rename = "EqualsFilter")]
    Equals {
        /// Projection applied to the entry value.
        extractor: ValueExtractor,
        /// Comparison literal.
        value: JsonValue,
    },

    /// Extracted value differs from the literal.
    #[serde(rename = "NotEqualsFilter")]
    NotEquals {
        /// Projection applied to the entry value.
        extractor: ValueExtractor,
        /// Comparison literal.
        value: JsonValue,
    },

    /// Extracted value is strictly greater than the literal.
    #[serde(rename = "GreaterFilter")]
    Greater {
        /// Projection applied to the entry value.
        extractor: ValueExtractor,
        /// Comparison literal.
        value: JsonValue,
    },

    /// Extracted value is greater than or equal to the literal.
    #[serde(rename = "GreaterEqualsFilter")]
    GreaterEquals {
        /// Projection applied to the entry value.
        extractor: ValueExtractor,
        /// Comparison literal.
        value: JsonValue,
    },

    /// Extracted value is strictly less than the literal.
    #[serde(rename = "LessFilter")]
    Less {
        /// Projection applied to the entry value.
        extractor: ValueExtractor,
        /// Comparison literal.
        value: JsonValue,
    },

    /// Extracted value is less than or equal to the literal.
    #[serde(rename = "LessEqualsFilter")]
    LessEquals {
        /// Projection applied to the entry value.
        extractor: ValueExtractor,
        /// Comparison literal.
        value: JsonValue,
    },

    /// Extracted value lies in a range; wraps the AND of the two
    /// boundary comparisons.
    #[serde(rename = "BetweenFilter")]
    Between {
        /// The lower and upper boundary comparisons.
        filters: Vec<Filter>,
    },

    /// Extracted value is a member of the literal sequence.
    #[serde(rename = "InFilter")]
    In {
        /// Projection applied to the entry value.
        extractor: ValueExtractor,
        /// Membership literals, in stable order.
        values: Vec<JsonValue>,
    },

    /// Extracted collection contains the literal.
    #[serde(rename = "ContainsFilter")]
    Contains {
        /// Projection applied to the entry value.
        extractor: ValueExtractor,
        /// Element literal.
        value: JsonValue,
    },

    /// Extracted collection contains all of the literals.
    #[serde(rename = "ContainsAllFilter")]
    ContainsAll {
        /// Projection applied to the entry value.
        extractor: ValueExtractor,
        /// Element literals, in stable order.
        values: Vec<JsonValue>,
    },

    /// Extracted collection contains any of the literals.
    #[serde(rename = "ContainsAnyFilter")]
    ContainsAny {
        /// Projection applied to the entry value.
        extractor: ValueExtractor,
        /// Element literals, in stable order.
        values: Vec<JsonValue>,
    },

    /// SQL LIKE match over the extracted value.
    #[serde(rename = "LikeFilter")]
    Like {
        /// Projection applied to the entry value.
        extractor: ValueExtractor,
        /// LIKE pattern (`%` and `_` wildcards).
        pattern: String,
        /// Case-insensitive matching.
        ignore_case: bool,
    },

    /// Regular-expression match over the extracted value.
    #[serde(rename = "RegexFilter")]
    Regex {
        /// Projection applied to the entry value.
        extractor: ValueExtractor,
        /// Regular expression, evaluated server-side.
        pattern: String,
    },

    /// Opaque server-side predicate descriptor.
    #[serde(rename = "PredicateFilter")]
    Predicate {
        /// Predicate descriptor the grid interprets.
        predicate: JsonValue,
    },

    /// Restricts which event kinds a subscription observes, optionally
    /// qualified by an inner entry filter.
    #[serde(rename = "MapEventFilter")]
    MapEvent {
        /// Bitwise OR of [`event_mask`] bits.
        mask: u32,
        /// Optional entry filter the event's values must satisfy.
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<Box<Filter>>,
    },

    /// Restricts a query to the partition owning `host_key`. By contract
    /// only valid at the outermost position of a query; the grid rejects
    /// violations.
    #[serde(rename = "KeyAssociatedFilter")]
    KeyAssociated {
        /// Wrapped filter.
        filter: Box<Filter>,
        /// Key whose partition scopes the query.
        host_key: JsonValue,
    },

    /// Restricts a query to the given key set. Outermost-position
    /// contract as for [`Filter::KeyAssociated`].
    #[serde(rename = "InKeySetFilter")]
    InKeySet {
        /// Wrapped filter.
        filter: Box<Filter>,
        /// Keys the query is restricted to, in stable order.
        keys: Vec<JsonValue>,
    },
}

impl Filter {
    /// `self AND other`.
    pub fn and(self, other: Filter) -> Filter {
        Filter::And { filters: vec![self, other] }
    }

    /// `self OR other`.
    pub fn or(self, other: Filter) -> Filter {
        Filter::Or { filters: vec![self, other] }
    }

    /// `self XOR other`.
    pub fn xor(self, other: Filter) -> Filter {
        Filter::Xor { filters: vec![self, other] }
    }

    /// `NOT self`.
    pub fn not(self) -> Filter {
        Filter::Not { filter: Box::new(self) }
    }
}

/// Anything that can stand in for an extractor in the [`Filters`]
/// factories: an extractor tree, or an attribute name/path string.
pub trait IntoExtractor {
    /// Convert into an extractor tree.
    fn into_extractor(self) -> ValueExtractor;
}

impl IntoExtractor for ValueExtractor {
    fn into_extractor(self) -> ValueExtractor {
        self
    }
}

impl IntoExtractor for &str {
    fn into_extractor(self) -> ValueExtractor {
        Extractors::extract(self)
    }
}

impl IntoExtractor for String {
    fn into_extractor(self) -> ValueExtractor {
        Extractors::extract(self)
    }
}

/// Factory for [`Filter`] trees.
///
/// Factories that take comparison literals serialize them eagerly and
/// fail with [`GridLinkError::BadValue`] on unserializable inputs, so a
/// bad literal never reaches the wire.
///
/// # Examples
///
/// ```rust
/// use gridlink::Filters;
///
/// let adults = Filters::greater_equal("age", 18).unwrap();
/// let local = Filters::equal("address.country", "NL").unwrap();
/// let both = adults.and(local);
/// ```
pub struct Filters;

impl Filters {
    /// Matches every entry.
    pub fn always() -> Filter {
        Filter::Always
    }

    /// Matches no entry.
    pub fn never() -> Filter {
        Filter::Never
    }

    /// Matches entries that exist.
    pub fn present() -> Filter {
        Filter::Present
    }

    /// Extracted value equals `value`.
    pub fn equal<E: IntoExtractor, V: Serialize>(extractor: E, value: V) -> Result<Filter> {
        Ok(Filter::Equals {
            extractor: extractor.into_extractor(),
            value: to_literal(value)?,
        })
    }

    /// Extracted value differs from `value`.
    pub fn not_equal<E: IntoExtractor, V: Serialize>(extractor: E, value: V) -> Result<Filter> {
        Ok(Filter::NotEquals {
            extractor: extractor.into_extractor(),
            value: to_literal(value)?,
        })
    }

    /// Extracted value is null. Reduces to equality against null.
    pub fn is_null<E: IntoExtractor>(extractor: E) -> Filter {
        Filter::Equals {
            extractor: extractor.into_extractor(),
            value: JsonValue::Null,
        }
    }

    /// Extracted value is not null. Reduces to inequality against null.
    pub fn is_not_null<E: IntoExtractor>(extractor: E) -> Filter {
        Filter::NotEquals {
            extractor: extractor.into_extractor(),
            value: JsonValue::Null,
        }
    }

    /// Extracted value is strictly greater than `value`.
    pub fn greater<E: IntoExtractor, V: Serialize>(extractor: E, value: V) -> Result<Filter> {
        Ok(Filter::Greater {
            extractor: extractor.into_extractor(),
            value: to_literal(value)?,
        })
    }

    /// Extracted value is greater than or equal to `value`.
    pub fn greater_equal<E: IntoExtractor, V: Serialize>(extractor: E, value: V) -> Result<Filter> {
        Ok(Filter::GreaterEquals {
            extractor: extractor.into_extractor(),
            value: to_literal(value)?,
        })
    }

    /// Extracted value is strictly less than `value`.
    pub fn less<E: IntoExtractor, V: Serialize>(extractor: E, value: V) -> Result<Filter> {
        Ok(Filter::Less {
            extractor: extractor.into_extractor(),
            value: to_literal(value)?,
        })
    }

    /// Extracted value is less than or equal to `value`.
    pub fn less_equal<E: IntoExtractor, V: Serialize>(extractor: E, value: V) -> Result<Filter> {
        Ok(Filter::LessEquals {
            extractor: extractor.into_extractor(),
            value: to_literal(value)?,
        })
    }

    /// Extracted value lies between `from` and `to`, with per-boundary
    /// inclusion flags.
    pub fn between<E, V>(
        extractor: E,
        from: V,
        to: V,
        include_lower: bool,
        include_upper: bool,
    ) -> Result<Filter>
    where
        E: IntoExtractor,
        V: Serialize,
    {
        let extractor = extractor.into_extractor();
        let from = to_literal(from)?;
        let to = to_literal(to)?;

        let lower = if include_lower {
            Filter::GreaterEquals { extractor: extractor.clone(), value: from }
        } else {
            Filter::Greater { extractor: extractor.clone(), value: from }
        };
        let upper = if include_upper {
            Filter::LessEquals { extractor, value: to }
        } else {
            Filter::Less { extractor, value: to }
        };

        Ok(Filter::Between { filters: vec![lower, upper] })
    }

    /// Extracted value is a member of `values`.
    pub fn in_set<E, I, V>(extractor: E, values: I) -> Result<Filter>
    where
        E: IntoExtractor,
        I: IntoIterator<Item = V>,
        V: Serialize,
    {
        Ok(Filter::In {
            extractor: extractor.into_extractor(),
            values: to_stable_sequence(values)?,
        })
    }

    /// Extracted collection contains `value`.
    pub fn contains<E: IntoExtractor, V: Serialize>(extractor: E, value: V) -> Result<Filter> {
        Ok(Filter::Contains {
            extractor: extractor.into_extractor(),
            value: to_literal(value)?,
        })
    }

    /// Extracted collection contains all of `values`.
    pub fn contains_all<E, I, V>(extractor: E, values: I) -> Result<Filter>
    where
        E: IntoExtractor,
        I: IntoIterator<Item = V>,
        V: Serialize,
    {
        Ok(Filter::ContainsAll {
            extractor: extractor.into_extractor(),
            values: to_stable_sequence(values)?,
        })
    }

    /// Extracted collection contains any of `values`.
    pub fn contains_any<E, I, V>(extractor: E, values: I) -> Result<Filter>
    where
        E: IntoExtractor,
        I: IntoIterator<Item = V>,
        V: Serialize,
    {
        Ok(Filter::ContainsAny {
            extractor: extractor.into_extractor(),
            values: to_stable_sequence(values)?,
        })
    }

    /// SQL LIKE match over the extracted value.
    pub fn like<E: IntoExtractor>(
        extractor: E,
        pattern: impl Into<String>,
        ignore_case: bool,
    ) -> Filter {
        Filter::Like {
            extractor: extractor.into_extractor(),
            pattern: pattern.into(),
            ignore_case,
        }
    }

    /// Regular-expression match over the extracted value.
    pub fn regex<E: IntoExtractor>(extractor: E, pattern: impl Into<String>) -> Filter {
        Filter::Regex {
            extractor: extractor.into_extractor(),
            pattern: pattern.into(),
        }
    }

    /// Opaque server-side predicate descriptor.
    pub fn predicate<P: Serialize>(predicate: P) -> Result<Filter> {
        Ok(Filter::Predicate { predicate: to_literal(predicate)? })
    }

    /// Map-event filter with an explicit mask and optional inner filter.
    pub fn event(mask: u32, filter: Option<Filter>) -> Filter {
        Filter::MapEvent { mask, filter: filter.map(Box::new) }
    }

    /// Map-event filter from an inner filter alone; the mask defaults to
    /// `INSERTED | DELETED | UPDATED_ENTERED | UPDATED_LEFT`.
    pub fn event_for(filter: Filter) -> Filter {
        Filter::MapEvent {
            mask: event_mask::DEFAULT,
            filter: Some(Box::new(filter)),
        }
    }

    /// Restrict a query to the partition owning `host_key`. Only valid
    /// at the outermost position; enforced server-side.
    pub fn key_associated_with<V: Serialize>(filter: Filter, host_key: V) -> Result<Filter> {
        Ok(Filter::KeyAssociated {
            filter: Box::new(filter),
            host_key: to_literal(host_key)?,
        })
    }

    /// Restrict a query to the given keys. Only valid at the outermost
    /// position; enforced server-side.
    pub fn for_keys<I, V>(filter: Filter, keys: I) -> Result<Filter>
    where
        I: IntoIterator<Item = V>,
        V: Serialize,
    {
        Ok(Filter::InKeySet {
            filter: Box::new(filter),
            keys: to_stable_sequence(keys)?,
        })
    }
}

fn to_literal<V: Serialize>(value: V) -> Result<JsonValue> {
    serde_json::to_value(value).map_err(|e| GridLinkError::BadValue(e.to_string()))
}

/// Materialize a set-valued argument into a sequence with a stable
/// order, so two equal sets always serialize to identical bytes.
fn to_stable_sequence<I, V>(values: I) -> Result<Vec<JsonValue>>
where
    I: IntoIterator<Item = V>,
    V: Serialize,
{
    let mut sequence = values
        .into_iter()
        .map(to_literal)
        .collect::<Result<Vec<_>>>()?;
    sequence.sort_by_cached_key(|v| v.to_string());
    sequence.dedup();
    Ok(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_between_wire_form() {
        let filter = Filters::between("age", 18, 65, true, false).unwrap();
        assert_eq!(
            serde_json::to_value(&filter).unwrap(),
            json!({
                "@class": "BetweenFilter",
                "filters": [
                    {
                        "@class": "GreaterEqualsFilter",
                        "extractor": {"@class": "UniversalExtractor", "name": "age"},
                        "value": 18,
                    },
                    {
                        "@class": "LessFilter",
                        "extractor": {"@class": "UniversalExtractor", "name": "age"},
                        "value": 65,
                    },
                ],
            })
        );
    }

    #[test]
    fn test_between_inclusion_flags() {
        let filter = Filters::between("n", 1, 5, false, true).unwrap();
        match filter {
            Filter::Between { filters } => {
                assert!(matches!(filters[0], Filter::Greater { .. }));
                assert!(matches!(filters[1], Filter::LessEquals { .. }));
            }
            other => panic!("expected BetweenFilter, got {:?}", other),
        }
    }

    #[test]
    fn test_null_filters_reduce_to_equality() {
        assert_eq!(
            Filters::is_null("name"),
            Filters::equal("name", JsonValue::Null).unwrap()
        );
        assert_eq!(
            Filters::is_not_null("name"),
            Filters::not_equal("name", JsonValue::Null).unwrap()
        );
    }

    #[test]
    fn test_set_arguments_serialize_stably() {
        let a: HashSet<i32> = [3, 1, 2].into_iter().collect();
        let b: HashSet<i32> = [2, 3, 1].into_iter().collect();
        let fa = Filters::in_set("n", a).unwrap();
        let fb = Filters::in_set("n", b).unwrap();
        assert_eq!(
            serde_json::to_vec(&fa).unwrap(),
            serde_json::to_vec(&fb).unwrap()
        );
    }

    #[test]
    fn test_equivalent_factory_calls_byte_identical() {
        let a = Filters::between("x", 1, 5, true, true).unwrap();
        let b = Filters::between("x", 1, 5, true, true).unwrap();
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());

        // Structurally built trees are not normalized into each other:
        // an explicit AND keeps its own tag.
        let and = Filters::greater_equal("x", 1)
            .unwrap()
            .and(Filters::less_equal("x", 5).unwrap());
        assert_ne!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&and).unwrap());
    }

    #[test]
    fn test_event_filter_default_mask() {
        let inner = Filters::always();
        match Filters::event_for(inner) {
            Filter::MapEvent { mask, filter } => {
                assert_eq!(
                    mask,
                    event_mask::INSERTED
                        | event_mask::DELETED
                        | event_mask::UPDATED_ENTERED
                        | event_mask::UPDATED_LEFT
                );
                assert!(filter.is_some());
            }
            other => panic!("expected MapEventFilter, got {:?}", other),
        }
    }

    #[test]
    fn test_in_key_set_tag_is_unqualified() {
        let filter = Filters::for_keys(Filters::always(), ["a", "b"]).unwrap();
        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(value["@class"], "InKeySetFilter");
    }

    #[test]
    fn test_combinators() {
        let f = Filters::always().and(Filters::never()).not();
        assert_eq!(
            serde_json::to_value(&f).unwrap(),
            json!({
                "@class": "NotFilter",
                "filter": {
                    "@class": "AndFilter",
                    "filters": [{"@class": "AlwaysFilter"}, {"@class": "NeverFilter"}],
                },
            })
        );
    }

    #[test]
    fn test_bad_literal_short_circuits() {
        // JSON object keys must be strings; a tuple-keyed map cannot be
        // represented and must fail before any request is built.
        let mut bad = std::collections::BTreeMap::new();
        bad.insert((1, 2), "x");
        let err = Filters::equal("x", bad).unwrap_err();
        assert!(matches!(err, GridLinkError::BadValue(_)));
    }
}
