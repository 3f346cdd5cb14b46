//! Memory service
//!
//! The concrete operation surface: one struct carrying the store, the
//! embedding client, and every engine, with an explicit handle instead of
//! process-wide singletons. Request handlers (HTTP, tests, tools) call these
//! methods and see only [`ServiceError`](super::ServiceError).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::LazyLock;

use chrono::{Duration, Utc};
use uuid::Uuid;

use super::{
    DateRange, DeletedResponse, ExportResponse, ListMemoriesResponse, ProjectionPoint,
    ProjectionResponse, RecallResults, RememberRequest, RememberResponse, RestoreItem,
    RestoreResponse, Result, ServiceError, TimelineDay, TimelineResponse, TriggerReflectResponse,
    WordEntry, WordcloudResponse,
};
use crate::contradiction::ContradictionDetector;
use crate::embeddings::{EmbeddingClient, InputHint};
use crate::graph::{
    BatchOutcome, Direction, GraphService, Traversal, TraverseOptions, MAX_TRAVERSAL_DEPTH,
};
use crate::lifecycle::LifecycleEngine;
use crate::memory::{
    Contradiction, EdgeKind, GraphEdge, Memory, MemoryType, PendingEdge, MAX_TAGS, MAX_TAG_LENGTH,
    MAX_TEXT_LENGTH,
};
use crate::projection;
use crate::recall::{RecallEngine, RecallQuery, MAX_RECALL_LIMIT};
use crate::reflection::{ReflectJob, ReflectionExecutor};
use crate::settings::{resolve, DaemonDefaults, ResolvedPipelineSettings, SettingsDoc, GLOBAL_AGENT_ID};
use crate::storage::{
    Cursor, MemoryFilter, MemoryPatch, MemoryStore, Projection, SortOrder, StoreError, UsageBucket,
    UsageGroupBy,
};
use crate::usage::{push_context, OperationTotals, UsageContext, UsageTracker};

// ============================================================================
// LIMITS
// ============================================================================

/// Maximum page size for listings
const MAX_LIST_LIMIT: usize = 100;

/// Maximum days in a timeline request
const MAX_TIMELINE_DAYS: i64 = 365;

/// Maximum entries for wordcloud and projection requests
const MAX_SAMPLE_LIMIT: usize = 500;

/// Texts embedded together during restore
const RESTORE_BATCH: usize = 10;

// ============================================================================
// SERVICE
// ============================================================================

/// The assembled memory service
pub struct MemoryService {
    store: Arc<MemoryStore>,
    embedder: Arc<EmbeddingClient>,
    recall: Arc<RecallEngine>,
    lifecycle: Arc<LifecycleEngine>,
    detector: Arc<ContradictionDetector>,
    graph: GraphService,
    usage: Arc<UsageTracker>,
    reflection: Arc<ReflectionExecutor>,
    defaults: DaemonDefaults,
}

impl MemoryService {
    /// Wire every component onto one store and embedding client
    pub fn new(
        store: Arc<MemoryStore>,
        embedder: Arc<EmbeddingClient>,
        defaults: DaemonDefaults,
    ) -> Result<Self> {
        #[cfg(feature = "vector-search")]
        let recall = Arc::new(
            RecallEngine::with_index(store.clone(), embedder.clone())
                .map_err(ServiceError::from)?,
        );
        #[cfg(not(feature = "vector-search"))]
        let recall = Arc::new(RecallEngine::new(store.clone(), embedder.clone()));

        let lifecycle = Arc::new(LifecycleEngine::new(store.clone()));
        let detector = Arc::new(ContradictionDetector::new(store.clone()));
        let usage = Arc::new(UsageTracker::new(store.clone()));
        usage.install(&embedder);

        let reflection = Arc::new(ReflectionExecutor::new(
            store.clone(),
            embedder.clone(),
            recall.clone(),
            lifecycle.clone(),
            detector.clone(),
            defaults.clone(),
        ));

        Ok(Self {
            graph: GraphService::new(store.clone()),
            store,
            embedder,
            recall,
            lifecycle,
            detector,
            usage,
            reflection,
            defaults,
        })
    }

    /// The lifecycle engine, for wiring the scheduler
    pub fn lifecycle(&self) -> Arc<LifecycleEngine> {
        self.lifecycle.clone()
    }

    /// The usage tracker
    pub fn usage_tracker(&self) -> Arc<UsageTracker> {
        self.usage.clone()
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Ingest one memory: embed, contradiction-check, insert
    pub fn remember(&self, request: &RememberRequest) -> Result<RememberResponse> {
        validate_agent_id(&request.agent_id)?;
        validate_text(&request.text)?;
        validate_tags(&request.tags)?;
        if let Some(ttl) = request.ttl_seconds {
            if ttl <= 0 {
                return Err(ServiceError::Validation(
                    "ttlSeconds must be positive".to_string(),
                ));
            }
        }

        let _usage = push_context(
            UsageContext::operation("remember").with_agent(&request.agent_id),
        );
        let embedding = self
            .embedder
            .embed_one(&request.text, Some(InputHint::Document))?;

        // Contradiction failures are non-fatal for ingest
        let read_only = request
            .metadata
            .get("readOnly")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let conflicts = if ContradictionDetector::should_check(
            &request.text,
            &request.tags,
            read_only,
        ) {
            match self
                .detector
                .detect(&request.agent_id, &request.text, &embedding)
            {
                Ok(conflicts) => conflicts,
                Err(e) => {
                    tracing::warn!("Contradiction detection failed, ingesting anyway: {}", e);
                    vec![]
                }
            }
        } else {
            vec![]
        };

        let mut memory = Memory::new(&request.agent_id, &request.text);
        if let Some(type_name) = &request.memory_type {
            memory = memory.with_type(MemoryType::parse_name(type_name));
        }
        memory.tags = request.tags.clone();
        memory.metadata = request.metadata.clone();
        memory.project_id = request.project_id.clone();
        memory.session_id = request.session_id.clone();
        memory.embedding = embedding;
        memory.expires_at = request
            .ttl_seconds
            .map(|ttl| Utc::now() + Duration::seconds(ttl));
        memory.contradictions = conflicts
            .iter()
            .map(|c| Contradiction::unresolved(&c.target_id))
            .collect();

        let stored = with_retry(|| self.store.insert(memory.clone()))?;
        self.recall.index_add(&stored.id, &stored.embedding);

        // Mirror the link onto the other side of each conflict
        for conflict in &conflicts {
            let patch = MemoryPatch {
                push_contradictions: vec![Contradiction::unresolved(&stored.id)],
                ..Default::default()
            };
            if let Err(e) = self.store.update(&conflict.target_id, &patch) {
                tracing::warn!(
                    "Could not mirror contradiction onto {}: {}",
                    conflict.target_id,
                    e
                );
            }
        }

        Ok(RememberResponse {
            id: stored.id,
            text: stored.text,
            tags: stored.tags,
            ttl: request.ttl_seconds,
            contradictions: conflicts.len(),
        })
    }

    /// Delete one memory by id
    pub fn forget(&self, id: &str) -> Result<DeletedResponse> {
        if Uuid::parse_str(id).is_err() {
            return Err(ServiceError::Validation(format!("invalid id: {}", id)));
        }
        let deleted = with_retry(|| self.store.delete(id))?;
        if !deleted {
            return Err(ServiceError::NotFound(format!("memory {}", id)));
        }
        self.recall.index_remove(id);
        Ok(DeletedResponse { deleted: 1 })
    }

    /// Delete every memory owned by an agent
    pub fn clear(&self, agent_id: &str) -> Result<DeletedResponse> {
        validate_agent_id(agent_id)?;
        let deleted = with_retry(|| self.store.delete_where(agent_id, None))?;
        Ok(DeletedResponse { deleted })
    }

    /// Delete an agent's memories created before a bound
    pub fn purge(
        &self,
        agent_id: &str,
        older_than: chrono::DateTime<Utc>,
    ) -> Result<DeletedResponse> {
        validate_agent_id(agent_id)?;
        let deleted = with_retry(|| self.store.delete_where(agent_id, Some(older_than)))?;
        Ok(DeletedResponse { deleted })
    }

    /// Bulk re-ingest. Texts embed in batches of 10; a failing batch is
    /// recorded and skipped, never fatal for the rest.
    pub fn restore(
        &self,
        agent_id: &str,
        project_id: Option<&str>,
        items: &[RestoreItem],
    ) -> Result<RestoreResponse> {
        validate_agent_id(agent_id)?;
        let _usage = push_context(UsageContext::operation("restore").with_agent(agent_id));

        let mut inserted = 0usize;
        let mut errors: Vec<String> = Vec::new();

        for (batch_index, batch) in items.chunks(RESTORE_BATCH).enumerate() {
            let texts: Vec<String> = batch.iter().map(|item| item.text.clone()).collect();
            let vectors = match self.embedder.embed(&texts, Some(InputHint::Document)) {
                Ok(vectors) => vectors,
                Err(e) => {
                    errors.push(format!(
                        "batch {}: embedding failed: {}",
                        batch_index, e
                    ));
                    continue;
                }
            };

            for (item, vector) in batch.iter().zip(vectors) {
                let mut memory = Memory::new(agent_id, &item.text);
                if let Some(type_name) = &item.memory_type {
                    memory = memory.with_type(MemoryType::parse_name(type_name));
                }
                memory.tags = item.tags.clone();
                memory.metadata = item.metadata.clone();
                memory.project_id = project_id.map(str::to_string);
                memory.embedding = vector;
                if let Some(created_at) = item.created_at {
                    memory.created_at = created_at;
                    memory.updated_at = created_at;
                    memory.last_reinforced_at = created_at;
                }
                match self.store.insert(memory) {
                    Ok(stored) => {
                        self.recall.index_add(&stored.id, &stored.embedding);
                        inserted += 1;
                    }
                    Err(e) => errors.push(format!("\"{}\": {}", truncate(&item.text, 40), e)),
                }
            }
        }

        Ok(RestoreResponse {
            total_received: items.len(),
            total_inserted: inserted,
            errors,
        })
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Semantic recall
    pub fn recall(
        &self,
        agent_id: &str,
        query: &str,
        limit: usize,
        tags: &[String],
        project_id: Option<&str>,
        min_score: Option<f32>,
    ) -> Result<RecallResults> {
        validate_agent_id(agent_id)?;
        if query.is_empty() {
            return Err(ServiceError::Validation("query must be non-empty".into()));
        }
        let _usage = push_context(UsageContext::operation("recall").with_agent(agent_id));

        let request = RecallQuery {
            agent_id: agent_id.to_string(),
            query: query.to_string(),
            limit: limit.clamp(1, MAX_RECALL_LIMIT),
            tags: tags.to_vec(),
            project_id: project_id.map(str::to_string),
            min_score,
        };
        let response = self.recall.recall(&request)?;
        Ok(RecallResults {
            count: response.results.len(),
            results: response.results,
            method: response.method,
        })
    }

    /// Cursor-paged listing, newest first by default
    pub fn list_memories(
        &self,
        agent_id: &str,
        cursor: Option<&str>,
        sort: SortOrder,
        limit: usize,
        tags: &[String],
    ) -> Result<ListMemoriesResponse> {
        validate_agent_id(agent_id)?;
        let cursor = cursor
            .map(|s| {
                Cursor::decode(s)
                    .ok_or_else(|| ServiceError::Validation(format!("invalid cursor: {}", s)))
            })
            .transpose()?;

        let filter = MemoryFilter {
            agent_id: agent_id.to_string(),
            tags: tags.to_vec(),
            ..Default::default()
        };
        let page = self.store.find(
            &filter,
            sort,
            cursor.as_ref(),
            limit.clamp(1, MAX_LIST_LIMIT),
        )?;
        Ok(ListMemoriesResponse {
            memories: page.memories,
            has_more: page.has_more,
            next_cursor: page.next_cursor.map(|c| c.encode()),
        })
    }

    /// Export every memory for an agent, embeddings projected out
    pub fn export(&self, agent_id: &str, project_id: Option<&str>) -> Result<ExportResponse> {
        validate_agent_id(agent_id)?;
        let filter = MemoryFilter {
            agent_id: agent_id.to_string(),
            project_id: project_id.map(str::to_string),
            ..Default::default()
        };
        let mut memories = Vec::new();
        self.store
            .scan_where(&filter, Projection::NoEmbedding, usize::MAX, |memory| {
                memories.push(memory);
                true
            })?;
        Ok(ExportResponse {
            count: memories.len(),
            exported_at: Utc::now(),
            memories,
        })
    }

    /// Creation counts bucketed by UTC calendar day
    pub fn timeline(&self, agent_id: &str, days: i64) -> Result<TimelineResponse> {
        validate_agent_id(agent_id)?;
        if !(1..=MAX_TIMELINE_DAYS).contains(&days) {
            return Err(ServiceError::Validation(format!(
                "days must be 1..={}",
                MAX_TIMELINE_DAYS
            )));
        }

        let now = Utc::now();
        let since = now - Duration::days(days - 1);
        let since_midnight = since
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default()
            .and_utc();
        let counts: HashMap<String, u64> = self
            .store
            .timeline_counts(agent_id, since_midnight)?
            .into_iter()
            .collect();

        let mut buckets = Vec::with_capacity(days as usize);
        let mut total = 0u64;
        for offset in 0..days {
            let date = (since + Duration::days(offset)).format("%Y-%m-%d").to_string();
            let count = counts.get(&date).copied().unwrap_or(0);
            total += count;
            buckets.push(TimelineDay { date, count });
        }

        Ok(TimelineResponse {
            date_range: DateRange {
                from: buckets.first().map(|d| d.date.clone()).unwrap_or_default(),
                to: buckets.last().map(|d| d.date.clone()).unwrap_or_default(),
            },
            days: buckets,
            total,
        })
    }

    /// Token frequencies over an agent's memory text
    pub fn wordcloud(
        &self,
        agent_id: &str,
        limit: usize,
        min_count: u64,
    ) -> Result<WordcloudResponse> {
        validate_agent_id(agent_id)?;
        let limit = limit.clamp(1, MAX_SAMPLE_LIMIT);
        let min_count = min_count.max(1);

        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut total_memories = 0u64;
        let mut total_tokens = 0u64;
        self.store.scan_where(
            &MemoryFilter::agent(agent_id),
            Projection::TextOnly,
            usize::MAX,
            |memory| {
                total_memories += 1;
                for token in tokenize(&memory.text) {
                    total_tokens += 1;
                    *counts.entry(token).or_default() += 1;
                }
                true
            },
        )?;

        let total_unique_words = counts.len() as u64;
        let mut ranked: Vec<(String, u64)> = counts
            .into_iter()
            .filter(|(_, count)| *count >= min_count)
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(limit);

        let words = ranked
            .into_iter()
            .map(|(text, count)| WordEntry {
                frequency: if total_tokens > 0 {
                    count as f64 / total_tokens as f64
                } else {
                    0.0
                },
                text,
                count,
            })
            .collect();

        Ok(WordcloudResponse {
            words,
            total_memories,
            total_unique_words,
        })
    }

    /// Project the newest embeddings to 2 or 3 dimensions
    pub fn embeddings_projection(
        &self,
        agent_id: &str,
        limit: usize,
        dimensions: usize,
    ) -> Result<ProjectionResponse> {
        validate_agent_id(agent_id)?;
        if !(2..=3).contains(&dimensions) {
            return Err(ServiceError::Validation(
                "dimensions must be 2 or 3".to_string(),
            ));
        }
        let limit = limit.clamp(1, MAX_SAMPLE_LIMIT);

        let mut ids: Vec<String> = Vec::new();
        let mut vectors: Vec<Vec<f32>> = Vec::new();
        self.store.scan_where(
            &MemoryFilter::agent(agent_id),
            Projection::Full,
            limit,
            |memory| {
                if !memory.embedding.is_empty() {
                    ids.push(memory.id);
                    vectors.push(memory.embedding);
                }
                true
            },
        )?;

        let projection = projection::project(&vectors, dimensions);
        let points = ids
            .into_iter()
            .zip(projection.points)
            .map(|(id, coords)| ProjectionPoint {
                id,
                x: coords.first().copied().unwrap_or(0.0),
                y: coords.get(1).copied().unwrap_or(0.0),
                z: (dimensions == 3).then(|| coords.get(2).copied().unwrap_or(0.0)),
            })
            .collect();

        Ok(ProjectionResponse {
            points,
            variance_explained: projection.variance_explained,
        })
    }

    /// Resolve a recorded contradiction on both memories. A `superseded`
    /// resolution also applies the supersede confidence rule to the target
    /// (the statement being replaced).
    pub fn resolve_contradiction(
        &self,
        memory_id: &str,
        target_memory_id: &str,
        resolution: crate::memory::ContradictionResolution,
        note: Option<String>,
    ) -> Result<()> {
        let memory = self
            .store
            .get_by_id(memory_id)?
            .ok_or_else(|| ServiceError::NotFound(format!("memory {}", memory_id)))?;
        if !memory
            .contradictions
            .iter()
            .any(|c| c.target_memory_id == target_memory_id)
        {
            return Err(ServiceError::NotFound(format!(
                "no contradiction between {} and {}",
                memory_id, target_memory_id
            )));
        }

        let patch = MemoryPatch {
            resolve_contradiction: Some(crate::storage::ContradictionUpdate {
                target_memory_id: target_memory_id.to_string(),
                resolution,
                note: note.clone(),
            }),
            ..Default::default()
        };
        self.store.update(memory_id, &patch)?;

        // The link is symmetric; resolve the mirror entry too
        let mirror = MemoryPatch {
            resolve_contradiction: Some(crate::storage::ContradictionUpdate {
                target_memory_id: memory_id.to_string(),
                resolution,
                note,
            }),
            ..Default::default()
        };
        self.store.update(target_memory_id, &mirror)?;

        if resolution == crate::memory::ContradictionResolution::Superseded {
            self.lifecycle.supersede_memory(target_memory_id)?;
        }
        Ok(())
    }

    // ========================================================================
    // GRAPH
    // ========================================================================

    /// List pending edge proposals
    pub fn list_pending_edges(
        &self,
        edge_type: Option<&str>,
        min_probability: Option<f64>,
        limit: usize,
    ) -> Result<Vec<PendingEdge>> {
        let kind = edge_type.map(parse_edge_kind).transpose()?;
        Ok(self.graph.list_pending(kind, min_probability, limit)?)
    }

    /// Approve one pending edge
    pub fn approve_pending_edge(&self, id: &str) -> Result<GraphEdge> {
        Ok(self.graph.approve(id)?)
    }

    /// Reject one pending edge
    pub fn reject_pending_edge(&self, id: &str) -> Result<()> {
        Ok(self.graph.reject(id)?)
    }

    /// Approve a batch of pending edges
    pub fn approve_batch(&self, ids: &[String]) -> BatchOutcome {
        self.graph.approve_batch(ids)
    }

    /// Create an edge directly, bypassing review
    pub fn create_edge(
        &self,
        source_id: &str,
        target_id: &str,
        edge_type: &str,
        weight: f64,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<GraphEdge> {
        let kind = parse_edge_kind(edge_type)?;
        Ok(self
            .graph
            .create_direct(source_id, target_id, kind, weight, metadata)?)
    }

    /// Bounded graph traversal
    pub fn traverse(
        &self,
        start_id: &str,
        direction: &str,
        max_depth: usize,
        edge_types: &[String],
    ) -> Result<Traversal> {
        let direction = match direction {
            "outbound" => Direction::Outbound,
            "inbound" => Direction::Inbound,
            "both" => Direction::Both,
            other => {
                return Err(ServiceError::Validation(format!(
                    "invalid direction: {}",
                    other
                )))
            }
        };
        let edge_types = edge_types
            .iter()
            .map(|t| parse_edge_kind(t))
            .collect::<Result<Vec<_>>>()?;
        let options = TraverseOptions {
            direction,
            max_depth: max_depth.clamp(1, MAX_TRAVERSAL_DEPTH),
            edge_types,
        };
        Ok(self.graph.traverse(start_id, &options)?)
    }

    /// Fetch one memory as a graph node, embedding projected out
    pub fn get_node(&self, id: &str) -> Result<Memory> {
        Ok(self.graph.get_node(id)?)
    }

    // ========================================================================
    // REFLECTION
    // ========================================================================

    /// Start an asynchronous reflection job
    pub fn trigger_reflect(
        self: &Arc<Self>,
        agent_id: &str,
        session_id: Option<&str>,
        transcript: Option<&str>,
    ) -> Result<TriggerReflectResponse> {
        validate_agent_id(agent_id)?;
        let job_id = self
            .reflection
            .trigger(agent_id, session_id, transcript)?;
        Ok(TriggerReflectResponse { job_id })
    }

    /// Fetch a reflection job
    pub fn get_job(&self, job_id: &str) -> Result<ReflectJob> {
        Ok(self.reflection.get_job(job_id)?)
    }

    /// List an agent's reflection jobs
    pub fn list_jobs(&self, agent_id: &str, limit: usize) -> Result<Vec<ReflectJob>> {
        validate_agent_id(agent_id)?;
        Ok(self
            .reflection
            .list_jobs(agent_id, limit.clamp(1, MAX_LIST_LIMIT))?)
    }

    /// Request cancellation of a queued or running job
    pub fn cancel_job(&self, job_id: &str) -> Result<()> {
        if self.reflection.cancel(job_id) {
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!("job {}", job_id)))
        }
    }

    // ========================================================================
    // SETTINGS & USAGE
    // ========================================================================

    /// Stored settings for an agent (or `_global`); a default document when
    /// none is stored
    pub fn get_settings(&self, agent_id: &str) -> Result<SettingsDoc> {
        validate_agent_id(agent_id)?;
        Ok(self
            .store
            .get_settings_doc(agent_id)?
            .unwrap_or_else(|| SettingsDoc {
                agent_id: agent_id.to_string(),
                ..Default::default()
            }))
    }

    /// Insert or replace a settings document
    pub fn upsert_settings(&self, doc: &SettingsDoc) -> Result<()> {
        validate_agent_id(&doc.agent_id)?;
        Ok(self.store.upsert_settings_doc(doc)?)
    }

    /// Delete a settings document
    pub fn delete_settings(&self, agent_id: &str) -> Result<DeletedResponse> {
        validate_agent_id(agent_id)?;
        let deleted = self.store.delete_settings_doc(agent_id)?;
        Ok(DeletedResponse {
            deleted: deleted as u64,
        })
    }

    /// Settings as a running pipeline would see them right now
    pub fn effective_settings(&self, agent_id: &str) -> Result<ResolvedPipelineSettings> {
        validate_agent_id(agent_id)?;
        let agent_doc = self.store.get_settings_doc(agent_id)?;
        let global_doc = self.store.get_settings_doc(GLOBAL_AGENT_ID)?;
        Ok(resolve(
            agent_doc.as_ref(),
            global_doc.as_ref(),
            &self.defaults,
        ))
    }

    /// In-memory usage totals by operation since startup
    pub fn usage_totals(&self) -> HashMap<String, OperationTotals> {
        self.usage.running_totals()
    }

    /// Persisted usage summary over a window
    pub fn usage_summary(
        &self,
        since: Option<chrono::DateTime<Utc>>,
        until: Option<chrono::DateTime<Utc>>,
        group_by: &str,
    ) -> Result<Vec<UsageBucket>> {
        let group_by = match group_by {
            "operation" => UsageGroupBy::Operation,
            "agent" => UsageGroupBy::Agent,
            "stage" => UsageGroupBy::Stage,
            "day" => UsageGroupBy::Day,
            other => {
                return Err(ServiceError::Validation(format!(
                    "invalid groupBy: {}",
                    other
                )))
            }
        };
        Ok(self.store.summarize_usage(since, until, group_by)?)
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Retry a store write once on transient busy/locked errors
fn with_retry<T>(mut f: impl FnMut() -> std::result::Result<T, StoreError>) -> std::result::Result<T, StoreError> {
    match f() {
        Err(e) if e.is_transient() => {
            tracing::warn!("Transient store error, retrying once: {}", e);
            f()
        }
        other => other,
    }
}

fn validate_agent_id(agent_id: &str) -> Result<()> {
    if agent_id.is_empty() {
        return Err(ServiceError::Validation("agentId must be non-empty".into()));
    }
    Ok(())
}

fn validate_text(text: &str) -> Result<()> {
    let chars = text.chars().count();
    if chars == 0 || chars > MAX_TEXT_LENGTH {
        return Err(ServiceError::Validation(format!(
            "text length must be 1..={} characters",
            MAX_TEXT_LENGTH
        )));
    }
    Ok(())
}

fn validate_tags(tags: &[String]) -> Result<()> {
    if tags.len() > MAX_TAGS {
        return Err(ServiceError::Validation(format!(
            "at most {} tags allowed",
            MAX_TAGS
        )));
    }
    if tags
        .iter()
        .any(|t| t.is_empty() || t.chars().count() > MAX_TAG_LENGTH)
    {
        return Err(ServiceError::Validation(format!(
            "tags must be 1..={} characters",
            MAX_TAG_LENGTH
        )));
    }
    Ok(())
}

fn parse_edge_kind(s: &str) -> Result<EdgeKind> {
    EdgeKind::parse_name(s)
        .ok_or_else(|| ServiceError::Validation(format!("invalid edge type: {}", s)))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ============================================================================
// WORDCLOUD TOKENIZATION
// ============================================================================

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "about", "after", "all", "also", "and", "any", "are", "because", "been", "before",
        "being", "between", "both", "but", "can", "could", "did", "does", "down", "during",
        "each", "few", "for", "from", "further", "had", "has", "have", "having", "her", "here",
        "hers", "him", "his", "how", "into", "its", "just", "like", "more", "most", "nor",
        "not", "now", "off", "once", "only", "other", "our", "out", "over", "own", "same",
        "she", "should", "some", "such", "than", "that", "the", "their", "them", "then",
        "there", "these", "they", "this", "those", "through", "too", "under", "until", "very",
        "was", "were", "what", "when", "where", "which", "while", "who", "why", "will", "with",
        "would", "you", "your",
    ]
    .into_iter()
    .collect()
});

/// Split on non-`[a-zA-Z0-9'-]`, lowercase, drop short tokens, pure digits,
/// and stop words
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '\'' || c == '-'))
        .map(str::to_lowercase)
        .filter(|token| token.chars().count() > 2)
        .filter(|token| !token.chars().all(|c| c.is_ascii_digit()))
        .filter(|token| !STOP_WORDS.contains(token.as_str()))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service() -> (Arc<MemoryService>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new(Some(dir.path().join("test.db"))).unwrap());
        let embedder = Arc::new(EmbeddingClient::mock());
        let service =
            Arc::new(MemoryService::new(store, embedder, DaemonDefaults::default()).unwrap());
        (service, dir)
    }

    #[test]
    fn test_remember_validation() {
        let (service, _dir) = service();

        let empty_agent = RememberRequest::new("", "text long enough");
        assert_eq!(
            service.remember(&empty_agent).unwrap_err().kind(),
            "ValidationError"
        );

        let empty_text = RememberRequest::new("agent1", "");
        assert_eq!(
            service.remember(&empty_text).unwrap_err().kind(),
            "ValidationError"
        );

        let mut bad_ttl = RememberRequest::new("agent1", "some text");
        bad_ttl.ttl_seconds = Some(0);
        assert_eq!(
            service.remember(&bad_ttl).unwrap_err().kind(),
            "ValidationError"
        );

        let mut bad_tags = RememberRequest::new("agent1", "some text");
        bad_tags.tags = vec!["x".repeat(101)];
        assert_eq!(
            service.remember(&bad_tags).unwrap_err().kind(),
            "ValidationError"
        );
    }

    #[test]
    fn test_remember_then_recall_roundtrip() {
        let (service, _dir) = service();
        let response = service
            .remember(&RememberRequest::new("agent1", "I prefer dark mode").with_tags(&["preference"]))
            .unwrap();
        assert!(!response.id.is_empty());
        service
            .remember(&RememberRequest::new("agent1", "deploys happen on Tuesday"))
            .unwrap();

        // Identical query text scores as an exact match
        let results = service
            .recall("agent1", "I prefer dark mode", 1, &[], None, None)
            .unwrap();
        assert_eq!(results.count, 1);
        assert_eq!(results.results[0].text, "I prefer dark mode");
        assert!(results.results[0].score >= 0.95);

        // A sub-phrase still ranks the right memory first
        let results = service
            .recall("agent1", "dark mode", 1, &[], None, None)
            .unwrap();
        assert_eq!(results.results[0].text, "I prefer dark mode");
    }

    #[test]
    fn test_recall_agent_isolation() {
        let (service, _dir) = service();
        service
            .remember(&RememberRequest::new("agent1", "something private"))
            .unwrap();
        let results = service
            .recall("agent2", "something private", 10, &[], None, None)
            .unwrap();
        assert_eq!(results.count, 0);
    }

    #[test]
    fn test_opposite_preferences_contradict_symmetrically() {
        let (service, _dir) = service();
        let first = service
            .remember(
                &RememberRequest::new("agent1", "I prefer tabs over spaces")
                    .with_tags(&["preference"]),
            )
            .unwrap();
        let second = service
            .remember(
                &RememberRequest::new("agent1", "I prefer spaces over tabs")
                    .with_tags(&["preference"]),
            )
            .unwrap();
        assert_eq!(second.contradictions, 1);

        let first_node = service.get_node(&first.id).unwrap();
        let second_node = service.get_node(&second.id).unwrap();
        assert_eq!(first_node.contradictions.len(), 1);
        assert_eq!(second_node.contradictions.len(), 1);
        assert_eq!(first_node.contradictions[0].target_memory_id, second.id);
        assert_eq!(second_node.contradictions[0].target_memory_id, first.id);
        assert_eq!(
            first_node.contradictions[0].resolution,
            crate::memory::ContradictionResolution::Unresolved
        );
    }

    #[test]
    fn test_resolve_contradiction_supersedes_the_target() {
        let (service, _dir) = service();
        let old = service
            .remember(
                &RememberRequest::new("agent1", "I prefer tabs over spaces")
                    .with_tags(&["preference"]),
            )
            .unwrap();
        let new = service
            .remember(
                &RememberRequest::new("agent1", "I prefer spaces over tabs")
                    .with_tags(&["preference"]),
            )
            .unwrap();
        assert_eq!(new.contradictions, 1);
        let old_confidence = service.get_node(&old.id).unwrap().confidence;

        service
            .resolve_contradiction(
                &new.id,
                &old.id,
                crate::memory::ContradictionResolution::Superseded,
                Some("newer statement wins".to_string()),
            )
            .unwrap();

        let old_node = service.get_node(&old.id).unwrap();
        let new_node = service.get_node(&new.id).unwrap();
        assert_eq!(
            old_node.contradictions[0].resolution,
            crate::memory::ContradictionResolution::Superseded
        );
        assert_eq!(
            new_node.contradictions[0].resolution,
            crate::memory::ContradictionResolution::Superseded
        );
        assert!(old_node.contradictions[0].resolved_at.is_some());
        // 60% of the prior confidence, floored
        assert!((old_node.confidence - (old_confidence * 0.60).max(0.02)).abs() < 1e-9);

        assert_eq!(
            service
                .resolve_contradiction(&new.id, "missing", Default::default(), None)
                .unwrap_err()
                .kind(),
            "NotFound"
        );
    }

    #[test]
    fn test_forget_then_recall_excludes_memory() {
        let (service, _dir) = service();
        let stored = service
            .remember(&RememberRequest::new("agent1", "forget me soon"))
            .unwrap();
        let deleted = service.forget(&stored.id).unwrap();
        assert_eq!(deleted.deleted, 1);

        let results = service
            .recall("agent1", "forget me soon", 10, &[], None, None)
            .unwrap();
        assert!(results.results.iter().all(|hit| hit.id != stored.id));

        assert_eq!(service.forget(&stored.id).unwrap_err().kind(), "NotFound");
        assert_eq!(
            service.forget("not-a-uuid").unwrap_err().kind(),
            "ValidationError"
        );
    }

    #[test]
    fn test_clear_and_purge() {
        let (service, _dir) = service();
        service
            .remember(&RememberRequest::new("agent1", "first memory"))
            .unwrap();
        service
            .remember(&RememberRequest::new("agent1", "second memory"))
            .unwrap();
        service
            .remember(&RememberRequest::new("agent2", "unrelated memory"))
            .unwrap();

        let purged = service
            .purge("agent1", Utc::now() + Duration::seconds(1))
            .unwrap();
        assert_eq!(purged.deleted, 2);
        let cleared = service.clear("agent2").unwrap();
        assert_eq!(cleared.deleted, 1);
    }

    #[test]
    fn test_restore_batches_and_partial_failures() {
        let (service, _dir) = service();
        let mut items: Vec<RestoreItem> = (0..12)
            .map(|i| RestoreItem {
                text: format!("restored memory number {}", i),
                tags: vec!["restored".to_string()],
                metadata: serde_json::Map::new(),
                memory_type: None,
                created_at: None,
            })
            .collect();
        // One invalid item: empty text fails the embed batch it is in
        items[5].text = String::new();

        let response = service.restore("agent1", Some("proj"), &items).unwrap();
        assert_eq!(response.total_received, 12);
        // The bad batch (items 0..10 include the empty text) failed wholesale,
        // the rest inserted
        assert_eq!(response.total_inserted, 2);
        assert_eq!(response.errors.len(), 1);

        let listed = service
            .list_memories("agent1", None, SortOrder::Desc, 100, &[])
            .unwrap();
        assert_eq!(listed.memories.len(), 2);
        assert!(listed
            .memories
            .iter()
            .all(|m| m.project_id.as_deref() == Some("proj")));
    }

    #[test]
    fn test_list_memories_cursor_walk() {
        let (service, _dir) = service();
        for i in 0..5 {
            service
                .remember(&RememberRequest::new("agent1", format!("entry {}", i)))
                .unwrap();
        }

        let first_page = service
            .list_memories("agent1", None, SortOrder::Desc, 2, &[])
            .unwrap();
        assert_eq!(first_page.memories.len(), 2);
        assert!(first_page.has_more);

        let second_page = service
            .list_memories(
                "agent1",
                first_page.next_cursor.as_deref(),
                SortOrder::Desc,
                2,
                &[],
            )
            .unwrap();
        assert_eq!(second_page.memories.len(), 2);
        let first_ids: HashSet<String> =
            first_page.memories.iter().map(|m| m.id.clone()).collect();
        assert!(second_page
            .memories
            .iter()
            .all(|m| !first_ids.contains(&m.id)));

        assert_eq!(
            service
                .list_memories("agent1", Some("garbage"), SortOrder::Desc, 2, &[])
                .unwrap_err()
                .kind(),
            "ValidationError"
        );
    }

    #[test]
    fn test_export_projects_out_embeddings() {
        let (service, _dir) = service();
        service
            .remember(&RememberRequest::new("agent1", "exported memory"))
            .unwrap();
        let export = service.export("agent1", None).unwrap();
        assert_eq!(export.count, 1);
        let json = serde_json::to_value(&export).unwrap();
        assert!(json["memories"][0].get("embedding").is_none());
        assert_eq!(json["memories"][0]["text"], "exported memory");
    }

    #[test]
    fn test_timeline_dense_days() {
        let (service, _dir) = service();
        service
            .remember(&RememberRequest::new("agent1", "today's memory"))
            .unwrap();
        let timeline = service.timeline("agent1", 7).unwrap();
        assert_eq!(timeline.days.len(), 7);
        assert_eq!(timeline.total, 1);
        assert_eq!(timeline.days.last().unwrap().count, 1);
        assert_eq!(timeline.date_range.to, timeline.days.last().unwrap().date);

        assert_eq!(
            service.timeline("agent1", 0).unwrap_err().kind(),
            "ValidationError"
        );
        assert_eq!(
            service.timeline("agent1", 400).unwrap_err().kind(),
            "ValidationError"
        );
    }

    #[test]
    fn test_wordcloud_counts_and_filters() {
        let (service, _dir) = service();
        service
            .remember(&RememberRequest::new(
                "agent1",
                "database migrations and database backups",
            ))
            .unwrap();
        service
            .remember(&RememberRequest::new("agent1", "database tuning 123 it"))
            .unwrap();

        let cloud = service.wordcloud("agent1", 10, 1).unwrap();
        assert_eq!(cloud.total_memories, 2);
        let top = &cloud.words[0];
        assert_eq!(top.text, "database");
        assert_eq!(top.count, 3);
        // Stop words, short tokens, and digits never appear
        assert!(cloud.words.iter().all(|w| w.text != "and"));
        assert!(cloud.words.iter().all(|w| w.text != "it"));
        assert!(cloud.words.iter().all(|w| w.text != "123"));

        let strict = service.wordcloud("agent1", 10, 2).unwrap();
        assert_eq!(strict.words.len(), 1);
    }

    #[test]
    fn test_projection_endpoint() {
        let (service, _dir) = service();
        for i in 0..4 {
            service
                .remember(&RememberRequest::new("agent1", format!("point {}", i)))
                .unwrap();
        }
        let response = service.embeddings_projection("agent1", 100, 2).unwrap();
        assert_eq!(response.points.len(), 4);
        assert!(response.variance_explained.is_none());
        assert!(response.points.iter().all(|p| p.z.is_none()));

        let response = service.embeddings_projection("agent1", 100, 3).unwrap();
        assert!(response.variance_explained.is_some());
        assert!(response.points.iter().all(|p| p.z.is_some()));

        assert_eq!(
            service
                .embeddings_projection("agent1", 100, 5)
                .unwrap_err()
                .kind(),
            "ValidationError"
        );
    }

    #[test]
    fn test_graph_operations_via_service() {
        let (service, _dir) = service();
        let a = service
            .remember(&RememberRequest::new("agent1", "graph node a"))
            .unwrap();
        let b = service
            .remember(&RememberRequest::new("agent1", "graph node b"))
            .unwrap();

        service
            .create_edge(&a.id, &b.id, "CO_OCCURS", 0.8, None)
            .unwrap();
        assert_eq!(
            service
                .create_edge(&a.id, &b.id, "NOT_A_TYPE", 0.8, None)
                .unwrap_err()
                .kind(),
            "ValidationError"
        );

        let traversal = service.traverse(&a.id, "both", 2, &[]).unwrap();
        assert_eq!(traversal.connected.len(), 1);
        assert_eq!(
            service
                .traverse(&a.id, "sideways", 2, &[])
                .unwrap_err()
                .kind(),
            "ValidationError"
        );

        let node = service.get_node(&b.id).unwrap();
        assert_eq!(node.edges.len(), 1);
    }

    #[test]
    fn test_reflect_flow_via_service() {
        let (service, _dir) = service();
        let response = service
            .trigger_reflect(
                "agentX",
                Some("s1"),
                Some("user: The deploy pipeline finished in nine minutes today."),
            )
            .unwrap();
        let job = service.get_job(&response.job_id).unwrap();
        assert_eq!(job.stages.len(), 9);

        let jobs = service.list_jobs("agentX", 10).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(service.get_job("missing").unwrap_err().kind(), "NotFound");
    }

    #[test]
    fn test_settings_roundtrip_and_resolution() {
        let (service, _dir) = service();
        let doc = SettingsDoc {
            agent_id: "agent1".to_string(),
            semantic_level: Some(crate::settings::SemanticLevel::Enhanced),
            ..Default::default()
        };
        service.upsert_settings(&doc).unwrap();

        let fetched = service.get_settings("agent1").unwrap();
        assert_eq!(
            fetched.semantic_level,
            Some(crate::settings::SemanticLevel::Enhanced)
        );

        let effective = service.effective_settings("agent1").unwrap();
        assert!(effective.stages.classify);
        assert!(!effective.stages.graph_link);

        service.delete_settings("agent1").unwrap();
        let defaulted = service.get_settings("agent1").unwrap();
        assert_eq!(defaulted.semantic_level, None);
    }

    #[test]
    fn test_usage_attribution_through_operations() {
        let (service, _dir) = service();
        service
            .remember(&RememberRequest::new("agent1", "memory to embed"))
            .unwrap();
        service
            .recall("agent1", "memory to embed", 5, &[], None, None)
            .unwrap();

        let totals = service.usage_totals();
        assert!(totals.contains_key("remember"));
        assert!(totals.contains_key("recall"));

        let summary = service.usage_summary(None, None, "operation").unwrap();
        let keys: Vec<&str> = summary.iter().map(|b| b.key.as_str()).collect();
        assert!(keys.contains(&"remember"));
        assert_eq!(
            service
                .usage_summary(None, None, "bogus")
                .unwrap_err()
                .kind(),
            "ValidationError"
        );
    }

    #[test]
    fn test_tokenize() {
        let tokens = tokenize("The quick-fix worked; 42 alarms didn't re-fire");
        assert!(tokens.contains(&"quick-fix".to_string()));
        assert!(tokens.contains(&"didn't".to_string()));
        assert!(!tokens.iter().any(|t| t == "the"));
        assert!(!tokens.iter().any(|t| t == "42"));
    }
}
