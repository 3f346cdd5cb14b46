//! # Engram Core
//!
//! Long-running memory engine for AI agents. Memories arrive as short
//! natural-language statements, embed into 1024-dimension vectors, and come
//! back out by semantic similarity. On top of the store sit the four systems
//! that make the memories behave like memories:
//!
//! - **Semantic recall**: vector-search-first retrieval with a bounded
//!   in-memory cosine fallback when no index is available
//! - **Temporal decay**: per-layer exponential strength decay
//!   (working/episodic/semantic/archival) with confidence updates on
//!   reinforcement and contradiction, driven daily by a scheduler
//! - **Reflection**: a nine-stage, job-tracked pipeline that distills
//!   session transcripts into deduplicated, classified, linked memories
//! - **Memory graph**: typed weighted edges with a pending-review queue,
//!   symmetric-relation mirroring, and bounded BFS traversal
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use engram_core::{DaemonDefaults, EmbeddingClient, MemoryService, MemoryStore, RememberRequest};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new(None)?);
//! let embedder = Arc::new(EmbeddingClient::mock());
//! let service = Arc::new(MemoryService::new(store, embedder, DaemonDefaults::default())?);
//!
//! service.remember(&RememberRequest::new("agent1", "I prefer dark mode"))?;
//! let hits = service.recall("agent1", "I prefer dark mode", 5, &[], None, None)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `vector-search` (default): HNSW index via USearch; without it every
//!   recall takes the in-memory fallback path
//! - `bundled-sqlite` (default): compile SQLite into the binary

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod api;
pub mod contradiction;
pub mod embeddings;
pub mod graph;
pub mod lifecycle;
pub mod memory;
pub mod projection;
pub mod recall;
pub mod reflection;
pub mod scheduler;
pub mod settings;
pub mod storage;
pub mod usage;

#[cfg(feature = "vector-search")]
#[cfg_attr(docsrs, doc(cfg(feature = "vector-search")))]
pub mod search;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Data model
pub use memory::{
    Contradiction, ContradictionResolution, EdgeKind, Entity, Episode, GraphEdge, Memory,
    MemoryLayer, MemoryType, PendingEdge, PendingStatus,
};

// Embeddings
pub use embeddings::{
    cosine_similarity, mock_embedding, EmbeddingClient, EmbeddingError, InputHint, UsageSignal,
    EMBEDDING_DIMENSIONS,
};

// Storage
pub use storage::{
    Cursor, MemoryFilter, MemoryPage, MemoryPatch, MemoryStore, Projection, SortOrder, StoreError,
    UsageBucket, UsageGroupBy,
};

// Recall
pub use recall::{
    RecallEngine, RecallError, RecallHit, RecallMethod, RecallQuery, RecallResponse,
    FALLBACK_SCAN_CAP,
};

// Lifecycle
pub use lifecycle::{
    bootstrap_eligible, classify_strength, decayed_strength, reinforce, DecayPassSummary,
    LifecycleEngine, StrengthBand,
};

// Contradictions
pub use contradiction::{classify_pair, ConflictKind, ContradictionDetector, DetectedConflict};

// Graph
pub use graph::{
    ConnectedNode, Direction, GraphError, GraphService, NodeSummary, Traversal, TraverseOptions,
};

// Reflection
pub use reflection::{
    JobStatus, ReflectJob, ReflectionExecutor, StageRecord, StageStatus, STAGE_NAMES,
};

// Scheduler
pub use scheduler::{DecayScheduler, SchedulerConfig, SchedulerError};

// Usage tracking
pub use usage::{
    price_per_million, push_context, OperationTotals, UsageContext, UsageEvent, UsageTracker,
};

// Settings
pub use settings::{
    resolve as resolve_settings, DaemonDefaults, LlmProviderConfig, ResolvedPipelineSettings,
    SemanticLevel, SettingsDoc, StageToggles, GLOBAL_AGENT_ID,
};

// Public API surface
pub use api::{
    MemoryService, RecallResults, RememberRequest, RememberResponse, RestoreItem, RestoreResponse,
    ServiceError,
};

// Vector search (when feature enabled)
#[cfg(feature = "vector-search")]
pub use search::{VectorIndex, VectorSearchError, MEMORY_VECTOR_INDEX};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        DaemonDefaults, EmbeddingClient, Memory, MemoryLayer, MemoryService, MemoryStore,
        MemoryType, RecallQuery, RememberRequest, ServiceError, SettingsDoc,
    };
}
