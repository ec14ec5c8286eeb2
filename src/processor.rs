//! Entry-processor descriptors.
//!
//! A processor is a server-side computation the client constructs but
//! never executes: the descriptor is serialized like any other payload
//! and shipped with `invoke` / `invoke_all`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::extractor::ValueExtractor;
use crate::filter::IntoExtractor;

/// An opaque entry-processor descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@class")]
pub enum Processor {
    /// Extracts an attribute from the targeted entry's value.
    #[serde(rename = "ExtractorProcessor")]
    Extract {
        /// Projection applied server-side.
        extractor: ValueExtractor,
    },

    /// Runs a named script registered on the grid.
    #[serde(rename = "ScriptProcessor")]
    Script {
        /// Script name.
        name: String,
        /// Script arguments.
        args: Vec<JsonValue>,
    },

    /// Runs child processors in order against the same entry.
    #[serde(rename = "CompositeProcessor")]
    Composite {
        /// Processors applied in order.
        processors: Vec<Processor>,
    },
}

/// Factory for [`Processor`] descriptors.
pub struct Processors;

impl Processors {
    /// Extract an attribute from the targeted entry.
    pub fn extract<E: IntoExtractor>(extractor: E) -> Processor {
        Processor::Extract { extractor: extractor.into_extractor() }
    }

    /// Run a named server-side script with the given arguments.
    pub fn script<I, V>(name: impl Into<String>, args: I) -> Result<Processor>
    where
        I: IntoIterator<Item = V>,
        V: Serialize,
    {
        let args = args
            .into_iter()
            .map(|a| serde_json::to_value(a).map_err(|e| crate::error::GridLinkError::BadValue(e.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Processor::Script { name: name.into(), args })
    }

    /// Compose processors, applied in order.
    pub fn composite(processors: Vec<Processor>) -> Processor {
        Processor::Composite { processors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_wire_form() {
        let processor = Processors::extract("age");
        assert_eq!(
            serde_json::to_value(&processor).unwrap(),
            json!({
                "@class": "ExtractorProcessor",
                "extractor": {"@class": "UniversalExtractor", "name": "age"},
            })
        );
    }

    #[test]
    fn test_script_args() {
        let processor = Processors::script("touch", [json!(1), json!("x")]).unwrap();
        match processor {
            Processor::Script { name, args } => {
                assert_eq!(name, "touch");
                assert_eq!(args, vec![json!(1), json!("x")]);
            }
            other => panic!("expected ScriptProcessor, got {:?}", other),
        }
    }
}
