//! Entity and key traits.
//!
//! Identity is declared at compile time: every entity exposes its table
//! (or collection) name, the name of its identity field, and an accessor
//! for the key value. No runtime discovery.

use std::fmt::Display;

use serde::{de::DeserializeOwned, Serialize};

/// Marker for types usable as an entity's primary key. Blanket-implemented;
/// `String`, `i64`, `uuid::Uuid` and similar all qualify.
pub trait EntityKey:
    Clone + Display + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> EntityKey for K where
    K: Clone + Display + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Field names an entity uses for soft deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftDeleteFields {
    /// Boolean marker column.
    pub flag: &'static str,
    /// Deletion timestamp column (RFC 3339 text).
    pub deleted_at: &'static str,
    /// Actor column.
    pub deleted_by: &'static str,
}

impl Default for SoftDeleteFields {
    fn default() -> Self {
        Self {
            flag: "is_deleted",
            deleted_at: "deleted_at",
            deleted_by: "deleted_by",
        }
    }
}

/// A storable record with exactly one identity field.
///
/// Field names produced by the entity's `Serialize` impl are the storage
/// field names; `id_field` must match one of them.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {
    type Key: EntityKey;

    /// Table name (relational) or collection name (document).
    fn table() -> &'static str;

    /// Name of the identity field as it serializes.
    fn id_field() -> &'static str {
        "id"
    }

    /// Current key value.
    fn id(&self) -> Self::Key;

    /// Declare soft-delete marker fields to make `soft_delete` available
    /// and to route `delete_by_id` through the marker instead of a
    /// physical delete.
    fn soft_delete_fields() -> Option<SoftDeleteFields> {
        None
    }

    /// Name used for cache scoping and log context.
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Note {
        id: String,
        title: String,
    }

    impl Entity for Note {
        type Key = String;

        fn table() -> &'static str {
            "notes"
        }

        fn id(&self) -> String {
            self.id.clone()
        }
    }

    #[test]
    fn defaults() {
        assert_eq!(Note::id_field(), "id");
        assert!(Note::soft_delete_fields().is_none());
        assert!(Note::type_name().ends_with("Note"));
    }

    #[test]
    fn key_accessor_returns_value() {
        let n = Note {
            id: "n-1".into(),
            title: "t".into(),
        };
        assert_eq!(n.id(), "n-1");
    }
}
