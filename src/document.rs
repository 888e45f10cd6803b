//! Document model.
//!
//! A [`Document`] is an immutable snapshot of one record inside a collection.
//! The server attaches an etag (optimistic-concurrency token), timestamps, and
//! opaque sort metadata used to keep subscription datasets ordered without the
//! client understanding the active ordering's value semantics.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A snapshot of a single document within a collection.
///
/// `value` of `None` means the document is deleted (a tombstone); tombstones
/// also carry no etag. `sort_keys` is aligned with the subscription's active
/// ordering, one opaque token per ordering descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Document id, unique within the collection.
    pub id: String,

    /// Collection the document belongs to.
    #[serde(skip)]
    pub collection_id: String,

    /// Document body; `None` for deleted documents.
    #[serde(rename = "body", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Map<String, Value>>,

    /// Opaque per-version token; absent for deleted or not-yet-acked documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    /// Server-issued creation timestamp (Unix milliseconds).
    #[serde(rename = "crt-ts", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,

    /// Server-issued last-modification timestamp (Unix milliseconds).
    #[serde(rename = "mod-ts", default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,

    /// Opaque server-issued sort tiebreaker.
    #[serde(rename = "crt", default, skip_serializing_if = "Option::is_none")]
    pub sort_value: Option<String>,

    /// Opaque per-key sort tokens aligned with the active ordering.
    #[serde(rename = "skey", default, skip_serializing_if = "Vec::is_empty")]
    pub sort_keys: Vec<String>,
}

impl Document {
    /// True when this snapshot represents a deleted document.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

// Equality is (id, collection, etag, deep-equal value). Timestamps and sort
// metadata are delivery details and do not participate.
impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.collection_id == other.collection_id
            && self.etag == other.etag
            && self.value == other.value
    }
}

impl Eq for Document {}
