use serde::{Deserialize, Serialize};

use super::payload::Payload;

/// One page of a streamed query result.
///
/// The grid streams query results in pages; a page carries its items
/// plus the cursor for the next page. A page with `complete == true` is
/// the terminal marker and carries no cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPage {
    /// Items in this page.
    pub items: Vec<QueryItem>,

    /// Cursor for the next page; absent on the terminal page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,

    /// True when this is the last page.
    #[serde(default)]
    pub complete: bool,
}

/// One item of a query page. Which fields are present depends on the
/// query kind: keys-queries set `key`, values-queries set `value`,
/// entries-queries set both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryItem {
    /// Encoded key, when the query projects keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Payload>,

    /// Encoded value, when the query projects values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Payload>,
}
