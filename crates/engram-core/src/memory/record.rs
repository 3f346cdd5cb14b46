//! Memory record - The fundamental unit of agent memory
//!
//! Each memory carries:
//! - Text content, tags, and opaque metadata
//! - A 1024-dimension L2-normalized embedding
//! - Lifecycle state (layer, confidence, strength, reinforcement timestamps)
//! - Embedded graph edges and contradiction links (id-based adjacency)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// LIMITS
// ============================================================================

/// Maximum memory text length in characters
pub const MAX_TEXT_LENGTH: usize = 50_000;

/// Maximum number of tags per memory
pub const MAX_TAGS: usize = 50;

/// Maximum length of a single tag in characters
pub const MAX_TAG_LENGTH: usize = 100;

// ============================================================================
// MEMORY TYPES
// ============================================================================

/// Semantic category of a memory
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// A stated user preference
    Preference,
    /// A recorded decision
    Decision,
    /// A discrete fact
    #[default]
    Fact,
    /// Something the agent observed
    Observation,
    /// A subjective opinion
    Opinion,
    /// A session-scoped episode
    Episode,
}

impl MemoryType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Preference => "preference",
            MemoryType::Decision => "decision",
            MemoryType::Fact => "fact",
            MemoryType::Observation => "observation",
            MemoryType::Opinion => "opinion",
            MemoryType::Episode => "episode",
        }
    }

    /// Parse from string name, defaulting to `Fact`
    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "preference" => MemoryType::Preference,
            "decision" => MemoryType::Decision,
            "fact" => MemoryType::Fact,
            "observation" => MemoryType::Observation,
            "opinion" => MemoryType::Opinion,
            "episode" => MemoryType::Episode,
            _ => MemoryType::Fact,
        }
    }

    /// Initial confidence assigned to a freshly ingested memory of this type
    pub fn initial_confidence(&self) -> f64 {
        match self {
            MemoryType::Preference => 0.80,
            MemoryType::Decision => 0.90,
            MemoryType::Fact => 0.60,
            MemoryType::Observation => 0.50,
            MemoryType::Opinion => 0.40,
            MemoryType::Episode => 0.60,
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// MEMORY LAYERS
// ============================================================================

/// Lifecycle tier governing how fast a memory's strength decays
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLayer {
    /// Short-lived scratch memory
    Working,
    /// Session-level memory, the default
    #[default]
    Episodic,
    /// Consolidated long-term knowledge
    Semantic,
    /// Cold storage for faded memories
    Archival,
}

impl MemoryLayer {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryLayer::Working => "working",
            MemoryLayer::Episodic => "episodic",
            MemoryLayer::Semantic => "semantic",
            MemoryLayer::Archival => "archival",
        }
    }

    /// Parse from string name, defaulting to `Episodic`
    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "working" => MemoryLayer::Working,
            "episodic" => MemoryLayer::Episodic,
            "semantic" => MemoryLayer::Semantic,
            "archival" => MemoryLayer::Archival,
            _ => MemoryLayer::Episodic,
        }
    }

    /// Exponential decay rate per day for this layer
    pub fn daily_decay_rate(&self) -> f64 {
        match self {
            MemoryLayer::Working => 0.050,
            MemoryLayer::Episodic => 0.015,
            MemoryLayer::Semantic => 0.003,
            MemoryLayer::Archival => 0.001,
        }
    }
}

impl std::fmt::Display for MemoryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// GRAPH EDGES
// ============================================================================

/// Type of a directed relation between memories
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    Precedes,
    Causes,
    Supports,
    Contradicts,
    DerivesFrom,
    Supersedes,
    /// Target is an entity slug, not a memory id
    MentionsEntity,
    CoOccurs,
    ContextOf,
}

impl EdgeKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Precedes => "PRECEDES",
            EdgeKind::Causes => "CAUSES",
            EdgeKind::Supports => "SUPPORTS",
            EdgeKind::Contradicts => "CONTRADICTS",
            EdgeKind::DerivesFrom => "DERIVES_FROM",
            EdgeKind::Supersedes => "SUPERSEDES",
            EdgeKind::MentionsEntity => "MENTIONS_ENTITY",
            EdgeKind::CoOccurs => "CO_OCCURS",
            EdgeKind::ContextOf => "CONTEXT_OF",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PRECEDES" => Some(EdgeKind::Precedes),
            "CAUSES" => Some(EdgeKind::Causes),
            "SUPPORTS" => Some(EdgeKind::Supports),
            "CONTRADICTS" => Some(EdgeKind::Contradicts),
            "DERIVES_FROM" => Some(EdgeKind::DerivesFrom),
            "SUPERSEDES" => Some(EdgeKind::Supersedes),
            "MENTIONS_ENTITY" => Some(EdgeKind::MentionsEntity),
            "CO_OCCURS" => Some(EdgeKind::CoOccurs),
            "CONTEXT_OF" => Some(EdgeKind::ContextOf),
            _ => None,
        }
    }

    /// Whether applying this edge A→B must also produce the mirror edge B→A
    pub fn is_symmetric(&self) -> bool {
        matches!(self, EdgeKind::CoOccurs | EdgeKind::Contradicts)
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A directed, weighted edge embedded on its source memory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    /// Relation type
    #[serde(rename = "type")]
    pub edge_type: EdgeKind,
    /// Target memory id, or entity slug for `MENTIONS_ENTITY`
    pub target_id: String,
    /// Relation weight in [0, 1]
    pub weight: f64,
    /// When the edge was created
    pub created_at: DateTime<Utc>,
    /// Optional edge metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl GraphEdge {
    /// Create a new edge with clamped weight
    pub fn new(edge_type: EdgeKind, target_id: impl Into<String>, weight: f64) -> Self {
        Self {
            edge_type,
            target_id: target_id.into(),
            weight: weight.clamp(0.0, 1.0),
            created_at: Utc::now(),
            metadata: None,
        }
    }
}

// ============================================================================
// PENDING EDGES
// ============================================================================

/// Review status of a proposed edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Approved => "approved",
            PendingStatus::Rejected => "rejected",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "approved" => PendingStatus::Approved,
            "rejected" => PendingStatus::Rejected,
            _ => PendingStatus::Pending,
        }
    }
}

/// A proposed edge awaiting review before it is applied to the graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEdge {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Source memory id
    pub source_id: String,
    /// Target memory id
    pub target_id: String,
    /// Relation type
    #[serde(rename = "type")]
    pub edge_type: EdgeKind,
    /// Relation weight in [0, 1]
    pub weight: f64,
    /// Proposal confidence in [0, 1]
    pub probability: f64,
    /// Review status
    pub status: PendingStatus,
    /// Why the edge was proposed
    pub reason: String,
    /// When the proposal was created
    pub created_at: DateTime<Utc>,
    /// Optional edge metadata, carried onto the applied edge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl PendingEdge {
    /// Create a new pending proposal
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        edge_type: EdgeKind,
        weight: f64,
        probability: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            edge_type,
            weight: weight.clamp(0.0, 1.0),
            probability: probability.clamp(0.0, 1.0),
            status: PendingStatus::Pending,
            reason: reason.into(),
            created_at: Utc::now(),
            metadata: None,
        }
    }
}

// ============================================================================
// CONTRADICTIONS
// ============================================================================

/// How a detected contradiction was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ContradictionResolution {
    #[default]
    Unresolved,
    Superseded,
    ContextDependent,
    Temporal,
}

impl ContradictionResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContradictionResolution::Unresolved => "unresolved",
            ContradictionResolution::Superseded => "superseded",
            ContradictionResolution::ContextDependent => "context-dependent",
            ContradictionResolution::Temporal => "temporal",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "superseded" => ContradictionResolution::Superseded,
            "context-dependent" => ContradictionResolution::ContextDependent,
            "temporal" => ContradictionResolution::Temporal,
            _ => ContradictionResolution::Unresolved,
        }
    }
}

/// A symmetric contradiction link embedded on both memories involved
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contradiction {
    /// The other memory in the conflict
    pub target_memory_id: String,
    /// When the conflict was detected
    pub detected_at: DateTime<Utc>,
    /// Resolution state
    pub resolution: ContradictionResolution,
    /// When the conflict was resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Free-form note recorded at resolution time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_note: Option<String>,
}

impl Contradiction {
    /// Create an unresolved contradiction link
    pub fn unresolved(target_memory_id: impl Into<String>) -> Self {
        Self {
            target_memory_id: target_memory_id.into(),
            detected_at: Utc::now(),
            resolution: ContradictionResolution::Unresolved,
            resolved_at: None,
            resolution_note: None,
        }
    }
}

// ============================================================================
// MEMORY
// ============================================================================

/// A single memory: text, embedding, lifecycle state, and graph adjacency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    /// Unique identifier (UUID v4), immutable once assigned
    pub id: String,
    /// Owning agent namespace
    pub agent_id: String,
    /// Optional project scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Optional session scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The memory text
    pub text: String,
    /// Tags for filtering
    pub tags: Vec<String>,
    /// Opaque caller-supplied metadata
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// 1024-dimension L2-normalized embedding. Never serialized; the store
    /// persists it as a binary column and the API always projects it out.
    #[serde(skip)]
    pub embedding: Vec<f32>,
    /// Semantic category
    pub memory_type: MemoryType,
    /// Lifecycle tier
    pub layer: MemoryLayer,
    /// Belief that the memory is accurate, clamped to [0.02, 0.98]
    pub confidence: f64,
    /// Liveness in [0, 1]; decays over time, reset by reinforcement
    pub strength: f64,
    /// Outbound graph edges (id-based adjacency)
    pub edges: Vec<GraphEdge>,
    /// Contradiction links
    pub contradictions: Vec<Contradiction>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
    /// Last reinforcement timestamp; decay is measured from here
    pub last_reinforced_at: DateTime<Utc>,
    /// When decay was last applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_decayed_at: Option<DateTime<Utc>>,
    /// Hard-deletion deadline, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Memory {
    /// Create a new memory with lifecycle defaults for its type
    pub fn new(agent_id: impl Into<String>, text: impl Into<String>) -> Self {
        let now = Utc::now();
        let memory_type = MemoryType::default();
        Self {
            id: String::new(),
            agent_id: agent_id.into(),
            project_id: None,
            session_id: None,
            text: text.into(),
            tags: vec![],
            metadata: serde_json::Map::new(),
            embedding: vec![],
            memory_type,
            layer: MemoryLayer::default(),
            confidence: memory_type.initial_confidence(),
            strength: 1.0,
            edges: vec![],
            contradictions: vec![],
            created_at: now,
            updated_at: now,
            last_reinforced_at: now,
            last_decayed_at: None,
            expires_at: None,
        }
    }

    /// Set the semantic type and reset confidence to the type's initial value
    pub fn with_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self.confidence = memory_type.initial_confidence();
        self
    }

    /// Whether the memory is past its hard-deletion deadline
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    /// Whether the memory is opted out of contradiction checking
    pub fn is_read_only(&self) -> bool {
        self.metadata
            .get("readOnly")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_type_roundtrip() {
        for memory_type in [
            MemoryType::Preference,
            MemoryType::Decision,
            MemoryType::Fact,
            MemoryType::Observation,
            MemoryType::Opinion,
            MemoryType::Episode,
        ] {
            assert_eq!(MemoryType::parse_name(memory_type.as_str()), memory_type);
        }
        assert_eq!(MemoryType::parse_name("garbage"), MemoryType::Fact);
    }

    #[test]
    fn test_initial_confidence_by_type() {
        assert_eq!(MemoryType::Preference.initial_confidence(), 0.80);
        assert_eq!(MemoryType::Decision.initial_confidence(), 0.90);
        assert_eq!(MemoryType::Fact.initial_confidence(), 0.60);
        assert_eq!(MemoryType::Observation.initial_confidence(), 0.50);
        assert_eq!(MemoryType::Opinion.initial_confidence(), 0.40);
        assert_eq!(MemoryType::Episode.initial_confidence(), 0.60);
    }

    #[test]
    fn test_layer_decay_rates() {
        assert!(MemoryLayer::Working.daily_decay_rate() > MemoryLayer::Episodic.daily_decay_rate());
        assert!(
            MemoryLayer::Episodic.daily_decay_rate() > MemoryLayer::Semantic.daily_decay_rate()
        );
        assert!(
            MemoryLayer::Semantic.daily_decay_rate() > MemoryLayer::Archival.daily_decay_rate()
        );
    }

    #[test]
    fn test_edge_kind_symmetry() {
        assert!(EdgeKind::CoOccurs.is_symmetric());
        assert!(EdgeKind::Contradicts.is_symmetric());
        assert!(!EdgeKind::Supports.is_symmetric());
        assert!(!EdgeKind::MentionsEntity.is_symmetric());
    }

    #[test]
    fn test_edge_kind_parse() {
        assert_eq!(EdgeKind::parse_name("CO_OCCURS"), Some(EdgeKind::CoOccurs));
        assert_eq!(
            EdgeKind::parse_name("derives_from"),
            Some(EdgeKind::DerivesFrom)
        );
        assert_eq!(EdgeKind::parse_name("NOPE"), None);
    }

    #[test]
    fn test_edge_serde_uses_type_field() {
        let edge = GraphEdge::new(EdgeKind::CoOccurs, "m-1", 0.5);
        let json = serde_json::to_value(&edge).unwrap();
        assert_eq!(json["type"], "CO_OCCURS");
        assert_eq!(json["targetId"], "m-1");
    }

    #[test]
    fn test_memory_defaults() {
        let memory = Memory::new("agent1", "the sky is blue");
        assert_eq!(memory.memory_type, MemoryType::Fact);
        assert_eq!(memory.layer, MemoryLayer::Episodic);
        assert_eq!(memory.confidence, 0.60);
        assert_eq!(memory.strength, 1.0);
        assert!(!memory.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_memory_embedding_never_serialized() {
        let mut memory = Memory::new("agent1", "text");
        memory.embedding = vec![0.1; 8];
        let json = serde_json::to_value(&memory).unwrap();
        assert!(json.get("embedding").is_none());
    }

    #[test]
    fn test_read_only_metadata_flag() {
        let mut memory = Memory::new("agent1", "text");
        assert!(!memory.is_read_only());
        memory
            .metadata
            .insert("readOnly".to_string(), serde_json::Value::Bool(true));
        assert!(memory.is_read_only());
    }

    #[test]
    fn test_contradiction_resolution_roundtrip() {
        for resolution in [
            ContradictionResolution::Unresolved,
            ContradictionResolution::Superseded,
            ContradictionResolution::ContextDependent,
            ContradictionResolution::Temporal,
        ] {
            assert_eq!(
                ContradictionResolution::parse_name(resolution.as_str()),
                resolution
            );
        }
    }
}
