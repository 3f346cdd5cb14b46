//! Reflection Pipeline
//!
//! A nine-stage, job-tracked pipeline that turns a session transcript into
//! durable memories: extract candidate atoms, deduplicate against the agent's
//! store, check for conflicts, classify and insert, update confidence, run
//! decay, flag layer promotions, propose graph links, and update entities.
//!
//! Every run is persisted as a [`ReflectJob`] with per-stage status, stats,
//! and error. A failing stage halts the job; completed stages keep their
//! stats either way.

mod executor;
mod stages;

pub use executor::ReflectionExecutor;
pub use stages::{StageContext, StageError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// STAGE NAMES
// ============================================================================

/// The nine stages, in execution order
pub const STAGE_NAMES: [&str; 9] = [
    "extract",
    "deduplicate",
    "conflict-check",
    "classify",
    "confidence-update",
    "decay-pass",
    "layer-promote",
    "graph-link",
    "entity-update",
];

// ============================================================================
// STATUS ENUMS
// ============================================================================

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }
}

/// Per-stage status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Complete => "complete",
            StageStatus::Failed => "failed",
        }
    }
}

// ============================================================================
// JOB RECORDS
// ============================================================================

/// Durable record of one stage execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub stage: String,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub stats: serde_json::Value,
}

impl StageRecord {
    fn pending(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            stats: serde_json::Value::Null,
        }
    }
}

/// Durable record of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectJob {
    pub id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageRecord>,
}

impl ReflectJob {
    /// Create a pending job with all nine stages pending
    pub fn new(agent_id: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            session_id,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            stages: STAGE_NAMES.iter().map(|s| StageRecord::pending(s)).collect(),
        }
    }
}
