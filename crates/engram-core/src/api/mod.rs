//! Public API surface
//!
//! Operation-level contracts consumed by external request handlers. Every
//! operation validates at entry and translates component failures into
//! exactly one [`ServiceError`] kind; internal stack traces never cross this
//! boundary.

mod service;

pub use service::MemoryService;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embeddings::EmbeddingError;
use crate::graph::GraphError;
use crate::recall::{RecallError, RecallHit, RecallMethod};
use crate::storage::StoreError;

// ============================================================================
// ERROR TAXONOMY
// ============================================================================

/// The single error surface of the service
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable kind label
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "ValidationError",
            ServiceError::NotFound(_) => "NotFound",
            ServiceError::Conflict(_) => "Conflict",
            ServiceError::Unauthorized(_) => "Unauthorized",
            ServiceError::Unavailable(_) => "Unavailable",
            ServiceError::Timeout(_) => "Timeout",
            ServiceError::Internal(_) => "Internal",
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::NotFound(m) => ServiceError::NotFound(m.clone()),
            StoreError::InvalidDocument(m) => ServiceError::Validation(m.clone()),
            _ if e.is_transient() => ServiceError::Unavailable(e.to_string()),
            _ => ServiceError::Internal(e.to_string()),
        }
    }
}

impl From<EmbeddingError> for ServiceError {
    fn from(e: EmbeddingError) -> Self {
        match &e {
            EmbeddingError::InvalidInput(m) => ServiceError::Validation(m.clone()),
            EmbeddingError::Provider { status: 401 | 403, .. } => {
                ServiceError::Unauthorized(e.to_string())
            }
            EmbeddingError::Http(m) if m.contains("timed out") => {
                ServiceError::Timeout(e.to_string())
            }
            EmbeddingError::Http(_)
            | EmbeddingError::Provider { .. }
            | EmbeddingError::NotConfigured(_) => ServiceError::Unavailable(e.to_string()),
            _ => ServiceError::Internal(e.to_string()),
        }
    }
}

impl From<RecallError> for ServiceError {
    fn from(e: RecallError) -> Self {
        match e {
            RecallError::Embedding(e) => e.into(),
            RecallError::Store(e) => e.into(),
        }
    }
}

impl From<GraphError> for ServiceError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::NotFound(m) => ServiceError::NotFound(m),
            GraphError::Invalid(m) => ServiceError::Validation(m),
            GraphError::Store(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

// ============================================================================
// REQUEST / RESPONSE SHAPES
// ============================================================================

/// `remember` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RememberRequest {
    pub agent_id: String,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Optional explicit type; defaults to `fact`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,
}

impl RememberRequest {
    pub fn new(agent_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            text: text.into(),
            tags: vec![],
            metadata: serde_json::Map::new(),
            ttl_seconds: None,
            project_id: None,
            session_id: None,
            memory_type: None,
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// `remember` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RememberResponse {
    pub id: String,
    pub text: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    /// Conflicts recorded during ingest
    pub contradictions: usize,
}

/// `forget`/`clear`/`purge` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletedResponse {
    pub deleted: u64,
}

/// One memory offered to `restore`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreItem {
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// `restore` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResponse {
    pub total_received: usize,
    pub total_inserted: usize,
    pub errors: Vec<String>,
}

/// `recall` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallResults {
    pub results: Vec<RecallHit>,
    pub count: usize,
    pub method: RecallMethod,
}

/// `listMemories` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMemoriesResponse {
    pub memories: Vec<crate::memory::Memory>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `export` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResponse {
    pub count: usize,
    pub exported_at: DateTime<Utc>,
    pub memories: Vec<crate::memory::Memory>,
}

/// One day bucket of the timeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineDay {
    pub date: String,
    pub count: u64,
}

/// `timeline` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineResponse {
    pub days: Vec<TimelineDay>,
    pub total: u64,
    pub date_range: DateRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateRange {
    pub from: String,
    pub to: String,
}

/// One wordcloud entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordEntry {
    pub text: String,
    pub count: u64,
    pub frequency: f64,
}

/// `wordcloud` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordcloudResponse {
    pub words: Vec<WordEntry>,
    pub total_memories: u64,
    pub total_unique_words: u64,
}

/// One projected memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionPoint {
    pub id: String,
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

/// `embeddingsProjection` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionResponse {
    pub points: Vec<ProjectionPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance_explained: Option<Vec<f64>>,
}

/// `triggerReflect` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerReflectResponse {
    pub job_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(ServiceError::Validation(String::new()).kind(), "ValidationError");
        assert_eq!(ServiceError::NotFound(String::new()).kind(), "NotFound");
        assert_eq!(ServiceError::Unavailable(String::new()).kind(), "Unavailable");
        assert_eq!(ServiceError::Timeout(String::new()).kind(), "Timeout");
    }

    #[test]
    fn test_store_error_mapping() {
        let e: ServiceError = StoreError::NotFound("memory x".into()).into();
        assert_eq!(e.kind(), "NotFound");
        let e: ServiceError = StoreError::InvalidDocument("too many tags".into()).into();
        assert_eq!(e.kind(), "ValidationError");
        let e: ServiceError = StoreError::Init("boom".into()).into();
        assert_eq!(e.kind(), "Internal");
    }

    #[test]
    fn test_embedding_error_mapping() {
        let e: ServiceError = EmbeddingError::Provider {
            status: 403,
            message: "forbidden".into(),
        }
        .into();
        assert_eq!(e.kind(), "Unauthorized");
        let e: ServiceError = EmbeddingError::Provider {
            status: 500,
            message: "oops".into(),
        }
        .into();
        assert_eq!(e.kind(), "Unavailable");
        let e: ServiceError = EmbeddingError::Http("operation timed out".into()).into();
        assert_eq!(e.kind(), "Timeout");
        let e: ServiceError = EmbeddingError::InvalidInput("empty".into()).into();
        assert_eq!(e.kind(), "ValidationError");
    }
}
