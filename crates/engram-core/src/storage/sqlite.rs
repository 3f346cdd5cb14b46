//! SQLite Storage Implementation
//!
//! Authoritative storage for memories and their satellites: pending edges,
//! episodes, entities, reflection jobs, usage events, and settings documents.
//!
//! Uses separate reader/writer connections for interior mutability. All
//! methods take `&self` (not `&mut self`), making the store `Send + Sync` so
//! callers can share an `Arc<MemoryStore>` across workers.

use chrono::{DateTime, SecondsFormat, Utc};
use directories::ProjectDirs;
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

use crate::embeddings::{embedding_from_bytes, embedding_to_bytes};
use crate::memory::{
    Contradiction, ContradictionResolution, EdgeKind, Entity, Episode, GraphEdge, Memory,
    MemoryLayer, MemoryType, PendingEdge, PendingStatus, MAX_TAGS, MAX_TAG_LENGTH,
    MAX_TEXT_LENGTH,
};
use crate::reflection::ReflectJob;
use crate::settings::SettingsDoc;
use crate::usage::UsageEvent;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Document violates a write-time limit
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

impl StoreError {
    /// Whether the error is a transient SQLite condition worth one retry
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// QUERY TYPES
// ============================================================================

/// Filter over the memory collection
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    /// Owning agent, the only tenancy boundary. Empty matches every agent;
    /// only maintenance scans use that.
    pub agent_id: String,
    /// Optional project scope
    pub project_id: Option<String>,
    /// All-of tag containment
    pub tags: Vec<String>,
    /// Inclusive lower creation bound
    pub created_after: Option<DateTime<Utc>>,
    /// Exclusive upper creation bound
    pub created_before: Option<DateTime<Utc>>,
}

impl MemoryFilter {
    /// Filter on an agent alone
    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Default::default()
        }
    }
}

/// Sort direction for paged listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Composite pagination cursor over `(createdAt, id)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

impl Cursor {
    /// Encode as `<rfc3339>|<id>`
    pub fn encode(&self) -> String {
        format!("{}|{}", fmt_ts(self.created_at), self.id)
    }

    /// Decode from `<rfc3339>|<id>`
    pub fn decode(s: &str) -> Option<Self> {
        let (ts, id) = s.split_once('|')?;
        let created_at = parse_ts(ts).ok()?;
        if id.is_empty() {
            return None;
        }
        Some(Self {
            created_at,
            id: id.to_string(),
        })
    }
}

/// One page of a memory listing
#[derive(Debug, Clone)]
pub struct MemoryPage {
    pub memories: Vec<Memory>,
    pub has_more: bool,
    pub next_cursor: Option<Cursor>,
}

/// Column projection for reads. `TextOnly` skips metadata, edges, and the
/// embedding so large scans stay cheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Projection {
    /// Every column including the embedding
    Full,
    /// Every column except the embedding
    #[default]
    NoEmbedding,
    /// Only id, agent, text, tags, and creation time
    TextOnly,
}

/// A set of field updates applied atomically to one memory
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub text: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    pub embedding: Option<Vec<f32>>,
    pub memory_type: Option<MemoryType>,
    pub layer: Option<MemoryLayer>,
    pub confidence: Option<f64>,
    pub strength: Option<f64>,
    pub last_reinforced_at: Option<DateTime<Utc>>,
    pub last_decayed_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the deadline, `Some(Some(_))` sets it
    pub expires_at: Option<Option<DateTime<Utc>>>,
    /// Array-append to `edges`
    pub push_edges: Vec<GraphEdge>,
    /// Array-append to `contradictions`
    pub push_contradictions: Vec<Contradiction>,
    /// Positional contradiction resolution keyed by `targetMemoryId`
    pub resolve_contradiction: Option<ContradictionUpdate>,
}

/// Resolution applied to the contradiction entry matching `target_memory_id`
#[derive(Debug, Clone)]
pub struct ContradictionUpdate {
    pub target_memory_id: String,
    pub resolution: ContradictionResolution,
    pub note: Option<String>,
}

/// Grouping key for usage summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageGroupBy {
    Operation,
    Agent,
    Stage,
    Day,
}

/// One row of a usage summary
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBucket {
    pub key: String,
    pub events: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
}

// ============================================================================
// TIMESTAMP HELPERS
// ============================================================================

/// Fixed-width RFC 3339 (microseconds, Z suffix) so stored timestamps sort
/// lexicographically in chronological order
pub fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored RFC 3339 timestamp
pub fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
}

fn ts_col(row: &Row<'_>, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(name)?;
    parse_ts(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn opt_ts_col(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(name)?;
    match s {
        None => Ok(None),
        Some(s) => parse_ts(&s).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        }),
    }
}

// ============================================================================
// COLUMN SETS
// ============================================================================

const FULL_COLUMNS: &str = "id, agent_id, project_id, session_id, text, tags, metadata, \
     embedding, memory_type, layer, confidence, strength, edges, contradictions, \
     created_at, updated_at, last_reinforced_at, last_decayed_at, expires_at";

const NO_EMBEDDING_COLUMNS: &str = "id, agent_id, project_id, session_id, text, tags, metadata, \
     memory_type, layer, confidence, strength, edges, contradictions, \
     created_at, updated_at, last_reinforced_at, last_decayed_at, expires_at";

const TEXT_ONLY_COLUMNS: &str = "id, agent_id, text, tags, created_at";

fn columns_for(projection: Projection) -> &'static str {
    match projection {
        Projection::Full => FULL_COLUMNS,
        Projection::NoEmbedding => NO_EMBEDDING_COLUMNS,
        Projection::TextOnly => TEXT_ONLY_COLUMNS,
    }
}

fn read_memory(row: &Row<'_>, projection: Projection) -> rusqlite::Result<Memory> {
    let tags_json: String = row.get("tags")?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();

    if projection == Projection::TextOnly {
        let mut memory = Memory::new(row.get::<_, String>("agent_id")?, row.get::<_, String>("text")?);
        memory.id = row.get("id")?;
        memory.tags = tags;
        memory.created_at = ts_col(row, "created_at")?;
        return Ok(memory);
    }

    let metadata_json: String = row.get("metadata")?;
    let edges_json: String = row.get("edges")?;
    let contradictions_json: String = row.get("contradictions")?;
    let memory_type: String = row.get("memory_type")?;
    let layer: String = row.get("layer")?;

    let embedding = if projection == Projection::Full {
        let bytes: Option<Vec<u8>> = row.get("embedding")?;
        bytes
            .as_deref()
            .and_then(embedding_from_bytes)
            .unwrap_or_default()
    } else {
        vec![]
    };

    Ok(Memory {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        project_id: row.get("project_id")?,
        session_id: row.get("session_id")?,
        text: row.get("text")?,
        tags,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        embedding,
        memory_type: MemoryType::parse_name(&memory_type),
        layer: MemoryLayer::parse_name(&layer),
        confidence: row.get("confidence")?,
        strength: row.get("strength")?,
        edges: serde_json::from_str(&edges_json).unwrap_or_default(),
        contradictions: serde_json::from_str(&contradictions_json).unwrap_or_default(),
        created_at: ts_col(row, "created_at")?,
        updated_at: ts_col(row, "updated_at")?,
        last_reinforced_at: ts_col(row, "last_reinforced_at")?,
        last_decayed_at: opt_ts_col(row, "last_decayed_at")?,
        expires_at: opt_ts_col(row, "expires_at")?,
    })
}

fn read_pending_edge(row: &Row<'_>) -> rusqlite::Result<PendingEdge> {
    let edge_type: String = row.get("edge_type")?;
    let status: String = row.get("status")?;
    let metadata_json: Option<String> = row.get("metadata")?;
    Ok(PendingEdge {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        target_id: row.get("target_id")?,
        edge_type: EdgeKind::parse_name(&edge_type).unwrap_or(EdgeKind::CoOccurs),
        weight: row.get("weight")?,
        probability: row.get("probability")?,
        status: PendingStatus::parse_name(&status),
        reason: row.get("reason")?,
        created_at: ts_col(row, "created_at")?,
        metadata: metadata_json.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed memory store
pub struct MemoryStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl MemoryStore {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) a store at the given path, or at the default
    /// platform data directory when `None`
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("io", "engram", "core").ok_or_else(|| {
                    StoreError::Init("Could not determine project directories".to_string())
                })?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("engram.db")
            }
        };

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StoreError::Init("Writer lock poisoned".to_string()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StoreError::Init("Reader lock poisoned".to_string()))
    }

    // ========================================================================
    // MEMORIES
    // ========================================================================

    fn validate_memory(memory: &Memory) -> Result<()> {
        if memory.agent_id.is_empty() {
            return Err(StoreError::InvalidDocument("agentId is required".into()));
        }
        if memory.text.is_empty() || memory.text.chars().count() > MAX_TEXT_LENGTH {
            return Err(StoreError::InvalidDocument(format!(
                "text length must be 1..={} characters",
                MAX_TEXT_LENGTH
            )));
        }
        if memory.tags.len() > MAX_TAGS {
            return Err(StoreError::InvalidDocument(format!(
                "at most {} tags allowed",
                MAX_TAGS
            )));
        }
        if memory
            .tags
            .iter()
            .any(|t| t.is_empty() || t.chars().count() > MAX_TAG_LENGTH)
        {
            return Err(StoreError::InvalidDocument(format!(
                "tags must be 1..={} characters",
                MAX_TAG_LENGTH
            )));
        }
        Ok(())
    }

    /// Insert a memory, assigning an id when absent. Returns the stored record.
    pub fn insert(&self, mut memory: Memory) -> Result<Memory> {
        Self::validate_memory(&memory)?;
        if memory.id.is_empty() {
            memory.id = Uuid::new_v4().to_string();
        }
        memory.confidence = memory.confidence.clamp(0.02, 0.98);
        memory.strength = memory.strength.clamp(0.0, 1.0);
        if memory.updated_at < memory.created_at {
            memory.updated_at = memory.created_at;
        }

        let tags_json = serde_json::to_string(&memory.tags)?;
        let metadata_json = serde_json::to_string(&memory.metadata)?;
        let edges_json = serde_json::to_string(&memory.edges)?;
        let contradictions_json = serde_json::to_string(&memory.contradictions)?;
        let embedding_bytes = if memory.embedding.is_empty() {
            None
        } else {
            Some(embedding_to_bytes(&memory.embedding))
        };

        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO memories (
                id, agent_id, project_id, session_id, text, tags, metadata,
                embedding, memory_type, layer, confidence, strength,
                edges, contradictions,
                created_at, updated_at, last_reinforced_at, last_decayed_at, expires_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                ?8, ?9, ?10, ?11, ?12,
                ?13, ?14,
                ?15, ?16, ?17, ?18, ?19
            )",
            params![
                memory.id,
                memory.agent_id,
                memory.project_id,
                memory.session_id,
                memory.text,
                tags_json,
                metadata_json,
                embedding_bytes,
                memory.memory_type.as_str(),
                memory.layer.as_str(),
                memory.confidence,
                memory.strength,
                edges_json,
                contradictions_json,
                fmt_ts(memory.created_at),
                fmt_ts(memory.updated_at),
                fmt_ts(memory.last_reinforced_at),
                memory.last_decayed_at.map(fmt_ts),
                memory.expires_at.map(fmt_ts),
            ],
        )?;
        writer.execute(
            "INSERT INTO memory_fts (id, text, tags) VALUES (?1, ?2, ?3)",
            params![memory.id, memory.text, memory.tags.join(" ")],
        )?;

        Ok(memory)
    }

    /// Fetch a memory by id, embedding included
    pub fn get_by_id(&self, id: &str) -> Result<Option<Memory>> {
        let reader = self.reader()?;
        let sql = format!("SELECT {} FROM memories WHERE id = ?1", FULL_COLUMNS);
        let memory = reader
            .query_row(&sql, params![id], |row| read_memory(row, Projection::Full))
            .optional()?;
        Ok(memory)
    }

    fn push_filter_clauses(
        filter: &MemoryFilter,
        sql: &mut String,
        bind: &mut Vec<Box<dyn ToSql>>,
    ) {
        sql.push_str(" WHERE 1 = 1");
        if !filter.agent_id.is_empty() {
            sql.push_str(" AND agent_id = ?");
            bind.push(Box::new(filter.agent_id.clone()));
        }
        if let Some(project_id) = &filter.project_id {
            sql.push_str(" AND project_id = ?");
            bind.push(Box::new(project_id.clone()));
        }
        for tag in &filter.tags {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM json_each(memories.tags) WHERE json_each.value = ?)",
            );
            bind.push(Box::new(tag.clone()));
        }
        if let Some(after) = filter.created_after {
            sql.push_str(" AND created_at >= ?");
            bind.push(Box::new(fmt_ts(after)));
        }
        if let Some(before) = filter.created_before {
            sql.push_str(" AND created_at < ?");
            bind.push(Box::new(fmt_ts(before)));
        }
    }

    /// Cursor-paged listing sorted by `(created_at, id)`
    pub fn find(
        &self,
        filter: &MemoryFilter,
        sort: SortOrder,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<MemoryPage> {
        let limit = limit.max(1);
        let mut sql = format!("SELECT {} FROM memories", NO_EMBEDDING_COLUMNS);
        let mut bind: Vec<Box<dyn ToSql>> = Vec::new();
        Self::push_filter_clauses(filter, &mut sql, &mut bind);

        if let Some(cursor) = cursor {
            match sort {
                SortOrder::Desc => sql.push_str(" AND (created_at, id) < (?, ?)"),
                SortOrder::Asc => sql.push_str(" AND (created_at, id) > (?, ?)"),
            }
            bind.push(Box::new(fmt_ts(cursor.created_at)));
            bind.push(Box::new(cursor.id.clone()));
        }

        match sort {
            SortOrder::Desc => sql.push_str(" ORDER BY created_at DESC, id DESC"),
            SortOrder::Asc => sql.push_str(" ORDER BY created_at ASC, id ASC"),
        }
        sql.push_str(" LIMIT ?");
        bind.push(Box::new((limit + 1) as i64));

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let mut memories: Vec<Memory> = stmt
            .query_map(params_from_iter(bind.iter().map(|b| b.as_ref())), |row| {
                read_memory(row, Projection::NoEmbedding)
            })?
            .collect::<rusqlite::Result<_>>()?;

        let has_more = memories.len() > limit;
        memories.truncate(limit);
        let next_cursor = if has_more {
            memories.last().map(|m| Cursor {
                created_at: m.created_at,
                id: m.id.clone(),
            })
        } else {
            None
        };

        Ok(MemoryPage {
            memories,
            has_more,
            next_cursor,
        })
    }

    /// Count memories matching a filter
    pub fn count_where(&self, filter: &MemoryFilter) -> Result<u64> {
        let mut sql = "SELECT COUNT(*) FROM memories".to_string();
        let mut bind: Vec<Box<dyn ToSql>> = Vec::new();
        Self::push_filter_clauses(filter, &mut sql, &mut bind);

        let reader = self.reader()?;
        let count: i64 = reader.query_row(
            &sql,
            params_from_iter(bind.iter().map(|b| b.as_ref())),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Stream memories matching a filter, newest first, decoding one row at a
    /// time. The visitor returns `false` to stop early. At most `cap` rows are
    /// visited; the number visited is returned.
    pub fn scan_where(
        &self,
        filter: &MemoryFilter,
        projection: Projection,
        cap: usize,
        mut visit: impl FnMut(Memory) -> bool,
    ) -> Result<usize> {
        let mut sql = format!("SELECT {} FROM memories", columns_for(projection));
        let mut bind: Vec<Box<dyn ToSql>> = Vec::new();
        Self::push_filter_clauses(filter, &mut sql, &mut bind);
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        bind.push(Box::new(cap as i64));

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind.iter().map(|b| b.as_ref())))?;
        let mut visited = 0usize;
        while let Some(row) = rows.next()? {
            let memory = read_memory(row, projection)?;
            visited += 1;
            if !visit(memory) {
                break;
            }
        }
        Ok(visited)
    }

    /// Apply a patch to one memory. Returns `false` when the id is unknown.
    pub fn update(&self, id: &str, patch: &MemoryPatch) -> Result<bool> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let sql = format!("SELECT {} FROM memories WHERE id = ?1", FULL_COLUMNS);
        let existing = tx
            .query_row(&sql, params![id], |row| read_memory(row, Projection::Full))
            .optional()?;
        let Some(mut memory) = existing else {
            return Ok(false);
        };

        if let Some(text) = &patch.text {
            memory.text = text.clone();
        }
        if let Some(tags) = &patch.tags {
            memory.tags = tags.clone();
        }
        if let Some(metadata) = &patch.metadata {
            memory.metadata = metadata.clone();
        }
        if let Some(embedding) = &patch.embedding {
            memory.embedding = embedding.clone();
        }
        if let Some(memory_type) = patch.memory_type {
            memory.memory_type = memory_type;
        }
        if let Some(layer) = patch.layer {
            memory.layer = layer;
        }
        if let Some(confidence) = patch.confidence {
            memory.confidence = confidence.clamp(0.02, 0.98);
        }
        if let Some(strength) = patch.strength {
            memory.strength = strength.clamp(0.0, 1.0);
        }
        if let Some(t) = patch.last_reinforced_at {
            memory.last_reinforced_at = t;
        }
        if let Some(t) = patch.last_decayed_at {
            memory.last_decayed_at = Some(t);
        }
        if let Some(expires) = patch.expires_at {
            memory.expires_at = expires;
        }
        memory.edges.extend(patch.push_edges.iter().cloned());
        memory
            .contradictions
            .extend(patch.push_contradictions.iter().cloned());
        if let Some(update) = &patch.resolve_contradiction {
            let now = Utc::now();
            for contradiction in memory
                .contradictions
                .iter_mut()
                .filter(|c| c.target_memory_id == update.target_memory_id)
            {
                contradiction.resolution = update.resolution;
                contradiction.resolved_at = Some(now);
                contradiction.resolution_note = update.note.clone();
            }
        }
        memory.updated_at = Utc::now();
        Self::validate_memory(&memory)?;

        let embedding_bytes = if memory.embedding.is_empty() {
            None
        } else {
            Some(embedding_to_bytes(&memory.embedding))
        };
        tx.execute(
            "UPDATE memories SET
                text = ?2, tags = ?3, metadata = ?4, embedding = ?5,
                memory_type = ?6, layer = ?7, confidence = ?8, strength = ?9,
                edges = ?10, contradictions = ?11, updated_at = ?12,
                last_reinforced_at = ?13, last_decayed_at = ?14, expires_at = ?15
             WHERE id = ?1",
            params![
                id,
                memory.text,
                serde_json::to_string(&memory.tags)?,
                serde_json::to_string(&memory.metadata)?,
                embedding_bytes,
                memory.memory_type.as_str(),
                memory.layer.as_str(),
                memory.confidence,
                memory.strength,
                serde_json::to_string(&memory.edges)?,
                serde_json::to_string(&memory.contradictions)?,
                fmt_ts(memory.updated_at),
                fmt_ts(memory.last_reinforced_at),
                memory.last_decayed_at.map(fmt_ts),
                memory.expires_at.map(fmt_ts),
            ],
        )?;
        if patch.text.is_some() || patch.tags.is_some() {
            tx.execute("DELETE FROM memory_fts WHERE id = ?1", params![id])?;
            tx.execute(
                "INSERT INTO memory_fts (id, text, tags) VALUES (?1, ?2, ?3)",
                params![id, memory.text, memory.tags.join(" ")],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Delete one memory. Returns `false` when the id is unknown.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        let deleted = tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        tx.execute("DELETE FROM memory_fts WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// Delete an agent's memories, optionally only those created before a
    /// bound. Returns the number deleted.
    pub fn delete_where(
        &self,
        agent_id: &str,
        created_before: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        let deleted = match created_before {
            Some(bound) => {
                tx.execute(
                    "DELETE FROM memory_fts WHERE id IN
                        (SELECT id FROM memories WHERE agent_id = ?1 AND created_at < ?2)",
                    params![agent_id, fmt_ts(bound)],
                )?;
                tx.execute(
                    "DELETE FROM memories WHERE agent_id = ?1 AND created_at < ?2",
                    params![agent_id, fmt_ts(bound)],
                )?
            }
            None => {
                tx.execute(
                    "DELETE FROM memory_fts WHERE id IN
                        (SELECT id FROM memories WHERE agent_id = ?1)",
                    params![agent_id],
                )?;
                tx.execute("DELETE FROM memories WHERE agent_id = ?1", params![agent_id])?
            }
        };
        tx.commit()?;
        Ok(deleted as u64)
    }

    /// Hard-delete memories whose `expires_at` deadline has passed
    pub fn delete_expired(&self, now: DateTime<Utc>, agent_id: Option<&str>) -> Result<u64> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        let deleted = match agent_id {
            Some(agent) => {
                tx.execute(
                    "DELETE FROM memory_fts WHERE id IN
                        (SELECT id FROM memories
                          WHERE agent_id = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2)",
                    params![agent, fmt_ts(now)],
                )?;
                tx.execute(
                    "DELETE FROM memories
                      WHERE agent_id = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                    params![agent, fmt_ts(now)],
                )?
            }
            None => {
                tx.execute(
                    "DELETE FROM memory_fts WHERE id IN
                        (SELECT id FROM memories
                          WHERE expires_at IS NOT NULL AND expires_at <= ?1)",
                    params![fmt_ts(now)],
                )?;
                tx.execute(
                    "DELETE FROM memories WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                    params![fmt_ts(now)],
                )?
            }
        };
        tx.commit()?;
        Ok(deleted as u64)
    }

    /// Memories whose edge array targets the given id (inbound adjacency),
    /// in stored order
    pub fn find_edge_sources(&self, target_id: &str) -> Result<Vec<Memory>> {
        let sql = format!(
            "SELECT {} FROM memories
              WHERE EXISTS (
                SELECT 1 FROM json_each(memories.edges)
                 WHERE json_extract(json_each.value, '$.targetId') = ?1)
              ORDER BY created_at ASC, id ASC",
            NO_EMBEDDING_COLUMNS
        );
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let memories = stmt
            .query_map(params![target_id], |row| {
                read_memory(row, Projection::NoEmbedding)
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(memories)
    }

    /// Full-text search over text and tags (FTS5)
    pub fn full_text_search(
        &self,
        agent_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let fts_query = sanitize_fts_query(query);
        if fts_query.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT {} FROM memories m
              JOIN memory_fts f ON f.id = m.id
             WHERE f.memory_fts MATCH ?1 AND m.agent_id = ?2
             ORDER BY f.rank LIMIT ?3",
            NO_EMBEDDING_COLUMNS
                .split(", ")
                .map(|c| format!("m.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let memories = stmt
            .query_map(params![fts_query, agent_id, limit as i64], |row| {
                read_memory(row, Projection::NoEmbedding)
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(memories)
    }

    /// Per-UTC-day creation counts for an agent since a bound
    pub fn timeline_counts(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, u64)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT substr(created_at, 1, 10) AS day, COUNT(*)
               FROM memories
              WHERE agent_id = ?1 AND created_at >= ?2
              GROUP BY day ORDER BY day ASC",
        )?;
        let counts = stmt
            .query_map(params![agent_id, fmt_ts(since)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(counts)
    }

    // ========================================================================
    // EDGE APPLICATION (atomic over source, mirror, and pending row)
    // ========================================================================

    /// Append `edge` to the source memory's edge array, optionally append the
    /// mirror edge to the target, and optionally delete a pending-edge row.
    /// All writes commit in one transaction.
    pub fn apply_edge(
        &self,
        source_id: &str,
        edge: &GraphEdge,
        mirror: Option<(&str, &GraphEdge)>,
        delete_pending_id: Option<&str>,
    ) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        Self::append_edge_in_tx(&tx, source_id, edge)?;
        if let Some((target_id, mirror_edge)) = mirror {
            Self::append_edge_in_tx(&tx, target_id, mirror_edge)?;
        }
        if let Some(pending_id) = delete_pending_id {
            tx.execute(
                "DELETE FROM pending_edges WHERE id = ?1",
                params![pending_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn append_edge_in_tx(
        tx: &rusqlite::Transaction<'_>,
        memory_id: &str,
        edge: &GraphEdge,
    ) -> Result<()> {
        let edges_json: String = tx
            .query_row(
                "SELECT edges FROM memories WHERE id = ?1",
                params![memory_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("memory {}", memory_id)))?;
        let mut edges: Vec<GraphEdge> = serde_json::from_str(&edges_json).unwrap_or_default();
        edges.push(edge.clone());
        tx.execute(
            "UPDATE memories SET edges = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                memory_id,
                serde_json::to_string(&edges)?,
                fmt_ts(Utc::now())
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // PENDING EDGES
    // ========================================================================

    /// Insert a pending edge proposal
    pub fn insert_pending_edge(&self, edge: &PendingEdge) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO pending_edges
                (id, source_id, target_id, edge_type, weight, probability,
                 status, reason, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                edge.id,
                edge.source_id,
                edge.target_id,
                edge.edge_type.as_str(),
                edge.weight,
                edge.probability,
                edge.status.as_str(),
                edge.reason,
                edge.metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                fmt_ts(edge.created_at),
            ],
        )?;
        Ok(())
    }

    /// Fetch a pending edge by id
    pub fn get_pending_edge(&self, id: &str) -> Result<Option<PendingEdge>> {
        let reader = self.reader()?;
        let edge = reader
            .query_row(
                "SELECT id, source_id, target_id, edge_type, weight, probability,
                        status, reason, metadata, created_at
                   FROM pending_edges WHERE id = ?1",
                params![id],
                read_pending_edge,
            )
            .optional()?;
        Ok(edge)
    }

    /// Delete a pending edge. Returns `false` when the id is unknown.
    pub fn delete_pending_edge(&self, id: &str) -> Result<bool> {
        let writer = self.writer()?;
        let deleted = writer.execute("DELETE FROM pending_edges WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// List pending proposals sorted by `(probability desc, createdAt desc)`
    pub fn list_pending_edges(
        &self,
        edge_type: Option<EdgeKind>,
        min_probability: Option<f64>,
        limit: usize,
    ) -> Result<Vec<PendingEdge>> {
        let mut sql = "SELECT id, source_id, target_id, edge_type, weight, probability,
                              status, reason, metadata, created_at
                         FROM pending_edges WHERE status = 'pending'"
            .to_string();
        let mut bind: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(kind) = edge_type {
            sql.push_str(" AND edge_type = ?");
            bind.push(Box::new(kind.as_str()));
        }
        if let Some(min_probability) = min_probability {
            sql.push_str(" AND probability >= ?");
            bind.push(Box::new(min_probability));
        }
        sql.push_str(" ORDER BY probability DESC, created_at DESC LIMIT ?");
        bind.push(Box::new(limit as i64));

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let edges = stmt
            .query_map(
                params_from_iter(bind.iter().map(|b| b.as_ref())),
                read_pending_edge,
            )?
            .collect::<rusqlite::Result<_>>()?;
        Ok(edges)
    }

    // ========================================================================
    // EPISODES
    // ========================================================================

    /// Insert or replace an episode keyed by `(agent, session)`
    pub fn upsert_episode(&self, episode: &Episode) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO episodes
                (id, agent_id, session_id, title, narrative, participants,
                 dominant_topics, fact_ids, embedding, strength, layer,
                 started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                narrative = excluded.narrative,
                participants = excluded.participants,
                dominant_topics = excluded.dominant_topics,
                fact_ids = excluded.fact_ids,
                embedding = excluded.embedding,
                strength = excluded.strength,
                ended_at = excluded.ended_at",
            params![
                episode.id,
                episode.agent_id,
                episode.session_id,
                episode.title,
                episode.narrative,
                serde_json::to_string(&episode.participants)?,
                serde_json::to_string(&episode.dominant_topics)?,
                serde_json::to_string(&episode.fact_ids)?,
                if episode.embedding.is_empty() {
                    None
                } else {
                    Some(embedding_to_bytes(&episode.embedding))
                },
                episode.strength,
                episode.layer.as_str(),
                fmt_ts(episode.started_at),
                fmt_ts(episode.ended_at),
            ],
        )?;
        Ok(())
    }

    /// Fetch the episode recorded for an agent session
    pub fn get_episode(&self, agent_id: &str, session_id: &str) -> Result<Option<Episode>> {
        let reader = self.reader()?;
        let episode = reader
            .query_row(
                "SELECT id, agent_id, session_id, title, narrative, participants,
                        dominant_topics, fact_ids, embedding, strength, layer,
                        started_at, ended_at
                   FROM episodes WHERE agent_id = ?1 AND session_id = ?2",
                params![agent_id, session_id],
                |row| {
                    let participants: String = row.get("participants")?;
                    let topics: String = row.get("dominant_topics")?;
                    let fact_ids: String = row.get("fact_ids")?;
                    let layer: String = row.get("layer")?;
                    let embedding: Option<Vec<u8>> = row.get("embedding")?;
                    Ok(Episode {
                        id: row.get("id")?,
                        agent_id: row.get("agent_id")?,
                        session_id: row.get("session_id")?,
                        title: row.get("title")?,
                        narrative: row.get("narrative")?,
                        participants: serde_json::from_str(&participants).unwrap_or_default(),
                        dominant_topics: serde_json::from_str(&topics).unwrap_or_default(),
                        fact_ids: serde_json::from_str(&fact_ids).unwrap_or_default(),
                        embedding: embedding
                            .as_deref()
                            .and_then(embedding_from_bytes)
                            .unwrap_or_default(),
                        strength: row.get("strength")?,
                        layer: MemoryLayer::parse_name(&layer),
                        started_at: ts_col(row, "started_at")?,
                        ended_at: ts_col(row, "ended_at")?,
                    })
                },
            )
            .optional()?;
        Ok(episode)
    }

    // ========================================================================
    // ENTITIES
    // ========================================================================

    /// Record an entity mention. Memory ids are set-unioned and the mention
    /// count is derived from them, so replays do not double-count.
    pub fn upsert_entity_mention(
        &self,
        agent_id: &str,
        slug: &str,
        name: &str,
        kind: &str,
        memory_id: &str,
    ) -> Result<Entity> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT memory_ids FROM entities WHERE agent_id = ?1 AND slug = ?2",
                params![agent_id, slug],
                |row| row.get(0),
            )
            .optional()?;

        let mut memory_ids: Vec<String> = existing
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        if !memory_ids.iter().any(|m| m == memory_id) {
            memory_ids.push(memory_id.to_string());
        }
        let mention_count = memory_ids.len() as u64;

        tx.execute(
            "INSERT INTO entities (agent_id, slug, name, kind, mention_count, memory_ids)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(agent_id, slug) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                mention_count = excluded.mention_count,
                memory_ids = excluded.memory_ids",
            params![
                agent_id,
                slug,
                name,
                kind,
                mention_count as i64,
                serde_json::to_string(&memory_ids)?,
            ],
        )?;
        tx.commit()?;

        Ok(Entity {
            agent_id: agent_id.to_string(),
            slug: slug.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            mention_count,
            memory_ids,
        })
    }

    /// Fetch an entity by slug
    pub fn get_entity(&self, agent_id: &str, slug: &str) -> Result<Option<Entity>> {
        let reader = self.reader()?;
        let entity = reader
            .query_row(
                "SELECT agent_id, slug, name, kind, mention_count, memory_ids
                   FROM entities WHERE agent_id = ?1 AND slug = ?2",
                params![agent_id, slug],
                |row| {
                    let memory_ids: String = row.get("memory_ids")?;
                    Ok(Entity {
                        agent_id: row.get("agent_id")?,
                        slug: row.get("slug")?,
                        name: row.get("name")?,
                        kind: row.get("kind")?,
                        mention_count: row.get::<_, i64>("mention_count")? as u64,
                        memory_ids: serde_json::from_str(&memory_ids).unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(entity)
    }

    // ========================================================================
    // REFLECTION JOBS
    // ========================================================================

    /// Insert a new job row
    pub fn insert_job(&self, job: &ReflectJob) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO reflect_jobs
                (id, agent_id, session_id, status, created_at, started_at, completed_at, stages)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.id,
                job.agent_id,
                job.session_id,
                job.status.as_str(),
                fmt_ts(job.created_at),
                job.started_at.map(fmt_ts),
                job.completed_at.map(fmt_ts),
                serde_json::to_string(&job.stages)?,
            ],
        )?;
        Ok(())
    }

    /// Overwrite a job's mutable fields (status, timestamps, stages)
    pub fn save_job(&self, job: &ReflectJob) -> Result<()> {
        let writer = self.writer()?;
        let updated = writer.execute(
            "UPDATE reflect_jobs SET
                status = ?2, started_at = ?3, completed_at = ?4, stages = ?5
             WHERE id = ?1",
            params![
                job.id,
                job.status.as_str(),
                job.started_at.map(fmt_ts),
                job.completed_at.map(fmt_ts),
                serde_json::to_string(&job.stages)?,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    /// Fetch a job by id
    pub fn get_job(&self, id: &str) -> Result<Option<ReflectJob>> {
        let reader = self.reader()?;
        let job = reader
            .query_row(
                "SELECT id, agent_id, session_id, status, created_at,
                        started_at, completed_at, stages
                   FROM reflect_jobs WHERE id = ?1",
                params![id],
                Self::read_job,
            )
            .optional()?;
        Ok(job)
    }

    /// List an agent's jobs, newest first
    pub fn list_jobs(&self, agent_id: &str, limit: usize) -> Result<Vec<ReflectJob>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, agent_id, session_id, status, created_at,
                    started_at, completed_at, stages
               FROM reflect_jobs WHERE agent_id = ?1
              ORDER BY created_at DESC LIMIT ?2",
        )?;
        let jobs = stmt
            .query_map(params![agent_id, limit as i64], Self::read_job)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(jobs)
    }

    fn read_job(row: &Row<'_>) -> rusqlite::Result<ReflectJob> {
        let status: String = row.get("status")?;
        let stages: String = row.get("stages")?;
        Ok(ReflectJob {
            id: row.get("id")?,
            agent_id: row.get("agent_id")?,
            session_id: row.get("session_id")?,
            status: crate::reflection::JobStatus::parse_name(&status),
            created_at: ts_col(row, "created_at")?,
            started_at: opt_ts_col(row, "started_at")?,
            completed_at: opt_ts_col(row, "completed_at")?,
            stages: serde_json::from_str(&stages).unwrap_or_default(),
        })
    }

    // ========================================================================
    // USAGE EVENTS (append-only)
    // ========================================================================

    /// Append a usage event. Nothing in the store mutates or deletes these.
    pub fn append_usage_event(&self, event: &UsageEvent) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO usage_events
                (timestamp, operation, agent_id, model, provider, total_tokens,
                 input_texts, input_type, estimated_cost_usd,
                 pipeline_job_id, pipeline_stage, memory_id, is_mock)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                fmt_ts(event.timestamp),
                event.operation,
                event.agent_id,
                event.model,
                event.provider,
                event.total_tokens as i64,
                event.input_texts as i64,
                event.input_type,
                event.estimated_cost_usd,
                event.pipeline_job_id,
                event.pipeline_stage,
                event.memory_id,
                event.is_mock as i64,
            ],
        )?;
        Ok(())
    }

    /// Summarize usage events in a window, grouped by the requested key
    pub fn summarize_usage(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        group_by: UsageGroupBy,
    ) -> Result<Vec<UsageBucket>> {
        let key_expr = match group_by {
            UsageGroupBy::Operation => "operation",
            UsageGroupBy::Agent => "COALESCE(agent_id, '(none)')",
            UsageGroupBy::Stage => "COALESCE(pipeline_stage, '(none)')",
            UsageGroupBy::Day => "substr(timestamp, 1, 10)",
        };
        let mut sql = format!(
            "SELECT {} AS bucket, COUNT(*), SUM(total_tokens), SUM(estimated_cost_usd)
               FROM usage_events WHERE 1 = 1",
            key_expr
        );
        let mut bind: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(since) = since {
            sql.push_str(" AND timestamp >= ?");
            bind.push(Box::new(fmt_ts(since)));
        }
        if let Some(until) = until {
            sql.push_str(" AND timestamp < ?");
            bind.push(Box::new(fmt_ts(until)));
        }
        sql.push_str(" GROUP BY bucket ORDER BY SUM(total_tokens) DESC");

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let buckets = stmt
            .query_map(params_from_iter(bind.iter().map(|b| b.as_ref())), |row| {
                Ok(UsageBucket {
                    key: row.get(0)?,
                    events: row.get::<_, i64>(1)? as u64,
                    total_tokens: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
                    estimated_cost_usd: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(buckets)
    }

    // ========================================================================
    // SETTINGS DOCUMENTS
    // ========================================================================

    /// Fetch the settings document for an agent (or the `_global` sentinel)
    pub fn get_settings_doc(&self, agent_id: &str) -> Result<Option<SettingsDoc>> {
        let reader = self.reader()?;
        let doc: Option<String> = reader
            .query_row(
                "SELECT doc FROM settings WHERE agent_id = ?1",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(doc.and_then(|d| serde_json::from_str(&d).ok()))
    }

    /// Insert or replace a settings document
    pub fn upsert_settings_doc(&self, doc: &SettingsDoc) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO settings (agent_id, doc, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(agent_id) DO UPDATE SET
                doc = excluded.doc, updated_at = excluded.updated_at",
            params![
                doc.agent_id,
                serde_json::to_string(doc)?,
                fmt_ts(Utc::now())
            ],
        )?;
        Ok(())
    }

    /// Delete a settings document. Returns `false` when absent.
    pub fn delete_settings_doc(&self, agent_id: &str) -> Result<bool> {
        let writer = self.writer()?;
        let deleted = writer.execute("DELETE FROM settings WHERE agent_id = ?1", params![agent_id])?;
        Ok(deleted > 0)
    }
}

/// Quote every token so FTS5 operators in user input stay inert
fn sanitize_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "")))
        .filter(|t| t.len() > 2)
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// TESTS
// ============================================================================
