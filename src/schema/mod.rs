//! Schema representation shared by all adapters.
//!
//! Every backend's introspection emits the same canonical document shape,
//! which the searcher embeds and retrieves by similarity.

mod searcher;

pub use searcher::{ScoredDocument, SchemaSearcher, SchemaSource};

use serde::{Deserialize, Serialize};

/// Canonical schema fragment emitted by adapter introspection.
///
/// `id` is a stable key such as `table:orders`, `collection:users`, or
/// `dimension:country`; `content` is the human-readable description that
/// gets embedded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaDocument {
    /// Stable string key, unique within a backend's introspection output.
    pub id: String,

    /// Human-readable description with field listings, types, sample
    /// values, and counts.
    pub content: String,

    /// Source backend tag ("postgres", "mongodb", "qdrant", ...).
    pub db_type: String,
}

impl SchemaDocument {
    /// Creates a new schema document.
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        db_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            db_type: db_type.into(),
        }
    }
}
