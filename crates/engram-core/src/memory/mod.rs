//! Memory module - core types and data structures
//!
//! The data model is built around:
//! - [`Memory`] records with embedded edge and contradiction arrays
//! - Session-scoped [`Episode`] narratives
//! - Denormalized [`Entity`] records extracted from memory text

mod record;

pub use record::{
    Contradiction, ContradictionResolution, EdgeKind, GraphEdge, Memory, MemoryLayer, MemoryType,
    PendingEdge, PendingStatus, MAX_TAGS, MAX_TAG_LENGTH, MAX_TEXT_LENGTH,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// EPISODES
// ============================================================================

/// A session-scoped narrative summarizing a group of memories
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Owning agent namespace
    pub agent_id: String,
    /// Session the episode belongs to
    pub session_id: String,
    /// Short title
    pub title: String,
    /// Narrative summary
    pub narrative: String,
    /// Participants mentioned in the session
    pub participants: Vec<String>,
    /// Most frequent topics
    pub dominant_topics: Vec<String>,
    /// Memory ids the episode was built from; same agent only
    pub fact_ids: Vec<String>,
    /// Narrative embedding; persisted as a binary column, never serialized
    #[serde(skip)]
    pub embedding: Vec<f32>,
    /// Liveness in [0, 1]
    pub strength: f64,
    /// Episodes always live in the episodic layer
    pub layer: MemoryLayer,
    /// Session start
    pub started_at: DateTime<Utc>,
    /// Session end
    pub ended_at: DateTime<Utc>,
}

// ============================================================================
// ENTITIES
// ============================================================================

/// A denormalized named entity extracted from memory text
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Owning agent namespace
    pub agent_id: String,
    /// Unique slug per agent, used as the `MENTIONS_ENTITY` edge target
    pub slug: String,
    /// Display name
    pub name: String,
    /// Coarse kind label (person, tool, project, term, ...)
    pub kind: String,
    /// Number of distinct memories mentioning the entity
    pub mention_count: u64,
    /// Ids of the memories mentioning the entity
    pub memory_ids: Vec<String>,
}

impl Entity {
    /// Build a slug from a display name: lowercase, non-alphanumerics to `-`
    pub fn slugify(name: &str) -> String {
        let mut slug = String::with_capacity(name.len());
        let mut last_dash = true;
        for c in name.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
                last_dash = false;
            } else if !last_dash {
                slug.push('-');
                last_dash = true;
            }
        }
        while slug.ends_with('-') {
            slug.pop();
        }
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(Entity::slugify("PostgreSQL"), "postgresql");
        assert_eq!(Entity::slugify("San Francisco"), "san-francisco");
        assert_eq!(Entity::slugify("  weird -- name  "), "weird-name");
        assert_eq!(Entity::slugify("---"), "");
    }
}
