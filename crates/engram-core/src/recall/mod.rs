//! Recall Engine
//!
//! Vector-search-first retrieval with a bounded in-memory cosine fallback.
//! The engine embeds the query (LRU-cached), builds the agent/project/tag
//! pre-filter, and takes the HNSW path when an index is available; otherwise
//! it streams the newest pre-filtered memories (hard cap 10,000) through a
//! bounded min-heap keyed by score.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::embeddings::{cosine_similarity, EmbeddingClient, EmbeddingError, InputHint};
use crate::memory::Memory;
use crate::storage::{MemoryFilter, MemoryStore, Projection, StoreError};

#[cfg(feature = "vector-search")]
use crate::search::VectorIndex;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Hard cap on documents scanned by the fallback path (OOM guard)
pub const FALLBACK_SCAN_CAP: usize = 10_000;

/// Maximum recall limit
pub const MAX_RECALL_LIMIT: usize = 100;

/// Query-embedding cache capacity
const QUERY_CACHE_CAPACITY: usize = 100;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Recall error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RecallError {
    /// Query embedding failed
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    /// Store read failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// QUERY & RESULT TYPES
// ============================================================================

/// A recall request
#[derive(Debug, Clone)]
pub struct RecallQuery {
    pub agent_id: String,
    pub query: String,
    /// At most [`MAX_RECALL_LIMIT`]
    pub limit: usize,
    /// All-of tag filter
    pub tags: Vec<String>,
    pub project_id: Option<String>,
    /// Drop hits scoring below this after scoring
    pub min_score: Option<f32>,
}

impl RecallQuery {
    pub fn new(agent_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            query: query.into(),
            limit: 10,
            tags: vec![],
            project_id: None,
            min_score: None,
        }
    }
}

/// One recall hit. The embedding is always projected out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallHit {
    pub id: String,
    pub text: String,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub score: f32,
}

/// Which path produced the results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallMethod {
    VectorSearch,
    InMemory,
}

impl RecallMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecallMethod::VectorSearch => "vector_search",
            RecallMethod::InMemory => "in_memory",
        }
    }
}

/// Recall results plus the path that produced them
#[derive(Debug, Clone)]
pub struct RecallResponse {
    pub results: Vec<RecallHit>,
    pub method: RecallMethod,
}

// ============================================================================
// BOUNDED HEAP
// ============================================================================

struct ScoredCandidate {
    score: f32,
    created_at: DateTime<Utc>,
    memory: Memory,
}

impl PartialEq for ScoredCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for ScoredCandidate {}

impl PartialOrd for ScoredCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher createdAt wins on equal score
        self.score
            .total_cmp(&other.score)
            .then(self.created_at.cmp(&other.created_at))
    }
}

// ============================================================================
// RECALL ENGINE
// ============================================================================

/// Retrieval over an agent's memories
pub struct RecallEngine {
    store: Arc<MemoryStore>,
    embedder: Arc<EmbeddingClient>,
    #[cfg(feature = "vector-search")]
    index: Option<Mutex<VectorIndex>>,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl RecallEngine {
    /// Create an engine without a vector index; every recall falls back
    pub fn new(store: Arc<MemoryStore>, embedder: Arc<EmbeddingClient>) -> Self {
        Self {
            store,
            embedder,
            #[cfg(feature = "vector-search")]
            index: None,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    /// Create an engine with an HNSW index, loading every stored embedding
    /// into it
    #[cfg(feature = "vector-search")]
    pub fn with_index(
        store: Arc<MemoryStore>,
        embedder: Arc<EmbeddingClient>,
    ) -> crate::storage::Result<Self> {
        let mut engine = Self::new(store, embedder);
        match VectorIndex::new() {
            Ok(index) => {
                engine.index = Some(Mutex::new(index));
                engine.rebuild_index()?;
            }
            Err(e) => {
                tracing::warn!("Vector index unavailable, recalls will fall back: {}", e);
            }
        }
        Ok(engine)
    }

    /// Reload the index from stored embeddings
    #[cfg(feature = "vector-search")]
    pub fn rebuild_index(&self) -> crate::storage::Result<()> {
        let Some(index) = &self.index else {
            return Ok(());
        };
        let mut pairs: Vec<(String, Vec<f32>)> = Vec::new();
        self.store.scan_where(
            &MemoryFilter::default(),
            Projection::Full,
            usize::MAX,
            |memory| {
                if !memory.embedding.is_empty() {
                    pairs.push((memory.id, memory.embedding));
                }
                true
            },
        )?;

        if let Ok(mut index) = index.lock() {
            for (id, vector) in pairs {
                if let Err(e) = index.add(&id, &vector) {
                    tracing::warn!("Failed to index embedding for {}: {}", id, e);
                }
            }
        }
        Ok(())
    }

    /// Register a memory's embedding with the index (no-op without one)
    pub fn index_add(&self, id: &str, embedding: &[f32]) {
        #[cfg(feature = "vector-search")]
        if let Some(index) = &self.index {
            if let Ok(mut index) = index.lock() {
                if let Err(e) = index.add(id, embedding) {
                    tracing::warn!("Failed to index embedding for {}: {}", id, e);
                }
            }
        }
        #[cfg(not(feature = "vector-search"))]
        let _ = (id, embedding);
    }

    /// Drop a memory from the index (no-op without one)
    pub fn index_remove(&self, id: &str) {
        #[cfg(feature = "vector-search")]
        if let Some(index) = &self.index {
            if let Ok(mut index) = index.lock() {
                if let Err(e) = index.remove(id) {
                    tracing::warn!("Failed to unindex {}: {}", id, e);
                }
            }
        }
        #[cfg(not(feature = "vector-search"))]
        let _ = id;
    }

    /// Embed a query with the query hint, memoized per query text
    pub fn embed_query(&self, query: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(vector) = cache.get(query) {
                return Ok(vector.clone());
            }
        }
        let vector = self.embedder.embed_one(query, Some(InputHint::Query))?;
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.put(query.to_string(), vector.clone());
        }
        Ok(vector)
    }

    /// Run a recall query
    pub fn recall(&self, query: &RecallQuery) -> Result<RecallResponse, RecallError> {
        let limit = query.limit.clamp(1, MAX_RECALL_LIMIT);
        let query_vector = self.embed_query(&query.query)?;

        let filter = MemoryFilter {
            agent_id: query.agent_id.clone(),
            project_id: query.project_id.clone(),
            tags: query.tags.clone(),
            ..Default::default()
        };

        #[cfg(feature = "vector-search")]
        if let Some(hits) = self.vector_path(&query_vector, &filter, limit)? {
            return Ok(RecallResponse {
                results: finalize(hits, query.min_score, limit),
                method: RecallMethod::VectorSearch,
            });
        }

        let hits = self.fallback_path(&query_vector, &filter, limit)?;
        Ok(RecallResponse {
            results: finalize(hits, query.min_score, limit),
            method: RecallMethod::InMemory,
        })
    }

    /// HNSW candidate search plus store-side pre-filter application.
    /// Returns `None` when the path is unavailable and the caller must fall
    /// back.
    #[cfg(feature = "vector-search")]
    fn vector_path(
        &self,
        query_vector: &[f32],
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Option<Vec<ScoredCandidate>>, RecallError> {
        let Some(index) = &self.index else {
            return Ok(None);
        };
        let num_candidates = (limit * 10).max(100);
        let candidates = {
            let Ok(index) = index.lock() else {
                return Ok(None);
            };
            if index.is_empty() {
                return Ok(None);
            }
            match index.search(query_vector, num_candidates) {
                Ok(candidates) => candidates,
                Err(e) => {
                    tracing::warn!("Vector search failed, falling back: {}", e);
                    return Ok(None);
                }
            }
        };

        let mut hits = Vec::with_capacity(limit);
        for (id, score) in candidates {
            if hits.len() >= limit {
                break;
            }
            let Some(memory) = self.store.get_by_id(&id)? else {
                continue;
            };
            if !matches_filter(&memory, filter) {
                continue;
            }
            hits.push(ScoredCandidate {
                score,
                created_at: memory.created_at,
                memory,
            });
        }
        Ok(Some(hits))
    }

    /// Stream pre-filtered memories newest first (capped) through a bounded
    /// heap of size `limit`
    fn fallback_path(
        &self,
        query_vector: &[f32],
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredCandidate>, RecallError> {
        let mut heap: BinaryHeap<std::cmp::Reverse<ScoredCandidate>> =
            BinaryHeap::with_capacity(limit + 1);

        self.store
            .scan_where(filter, Projection::Full, FALLBACK_SCAN_CAP, |memory| {
                if memory.embedding.is_empty() {
                    return true;
                }
                let Ok(score) = cosine_similarity(query_vector, &memory.embedding) else {
                    return true;
                };
                heap.push(std::cmp::Reverse(ScoredCandidate {
                    score,
                    created_at: memory.created_at,
                    memory,
                }));
                if heap.len() > limit {
                    heap.pop();
                }
                true
            })?;

        Ok(heap.into_iter().map(|r| r.0).collect())
    }
}

fn matches_filter(memory: &Memory, filter: &MemoryFilter) -> bool {
    if memory.agent_id != filter.agent_id {
        return false;
    }
    if let Some(project_id) = &filter.project_id {
        if memory.project_id.as_deref() != Some(project_id.as_str()) {
            return false;
        }
    }
    filter
        .tags
        .iter()
        .all(|tag| memory.tags.iter().any(|t| t == tag))
}

fn finalize(mut hits: Vec<ScoredCandidate>, min_score: Option<f32>, limit: usize) -> Vec<RecallHit> {
    hits.sort_by(|a, b| b.cmp(a));
    hits.truncate(limit);
    hits.into_iter()
        .filter(|hit| min_score.is_none_or(|min| hit.score >= min))
        .map(|hit| RecallHit {
            id: hit.memory.id,
            text: hit.memory.text,
            tags: hit.memory.tags,
            metadata: hit.memory.metadata,
            created_at: hit.created_at,
            score: hit.score,
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
