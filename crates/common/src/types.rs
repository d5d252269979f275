use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a persisted entity.
///
/// Document stores key their records by string, so the identifier wraps a
/// `String` rather than a UUID. Newly generated identifiers are UUIDv4 in
/// simple (hyphenless) form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Creates a new random entity ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wraps an existing identifier.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if no identifier has been assigned yet.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

/// Typed reference to the entity that owns another entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    /// The owner's identifier.
    pub id: EntityId,

    /// The kind of owner (e.g., "album").
    pub kind: String,
}

impl ParentRef {
    pub fn new(id: impl Into<EntityId>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_new_creates_unique_ids() {
        let id1 = EntityId::new();
        let id2 = EntityId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 32);
    }

    #[test]
    fn entity_id_default_is_empty() {
        assert!(EntityId::default().is_empty());
        assert!(!EntityId::new().is_empty());
    }

    #[test]
    fn entity_id_serializes_as_plain_string() {
        let id = EntityId::from("img-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"img-1\"");
    }

    #[test]
    fn parent_ref_holds_kind() {
        let parent = ParentRef::new("album-1", "album");
        assert_eq!(parent.id.as_str(), "album-1");
        assert_eq!(parent.kind, "album");
    }
}
