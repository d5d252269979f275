use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Top-level fields of a stored document.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// A document read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document key within its collection.
    pub id: String,

    /// The document body.
    pub fields: Fields,

    /// Monotonic per-document revision, bumped on every write.
    pub version: i64,

    /// When the document was last written.
    pub update_time: DateTime<Utc>,
}

impl Document {
    /// Returns a field by name.
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }
}
