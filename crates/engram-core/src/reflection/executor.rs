//! Reflection job executor
//!
//! Creates durable jobs, snapshots settings at start, and advances each job
//! through the nine stages on a blocking worker. One worker advances a job;
//! jobs for the same agent may run concurrently. A failing stage marks the
//! job failed and later stages never run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::contradiction::ContradictionDetector;
use crate::embeddings::EmbeddingClient;
use crate::lifecycle::LifecycleEngine;
use crate::recall::RecallEngine;
use crate::settings::{resolve, DaemonDefaults, ResolvedPipelineSettings, GLOBAL_AGENT_ID};
use crate::storage::{MemoryStore, Result as StoreResult, StoreError};
use crate::usage::{push_context, UsageContext};

use super::stages::{run_stage, PipelineState, StageContext};
use super::{JobStatus, ReflectJob, StageStatus, STAGE_NAMES};

/// Runs reflection jobs against the store
pub struct ReflectionExecutor {
    store: Arc<MemoryStore>,
    embedder: Arc<EmbeddingClient>,
    recall: Arc<RecallEngine>,
    lifecycle: Arc<LifecycleEngine>,
    detector: Arc<ContradictionDetector>,
    defaults: DaemonDefaults,
    /// Transcripts for jobs that have not started yet
    transcripts: Mutex<HashMap<String, String>>,
    /// Cancellation flags for queued and running jobs
    cancels: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl ReflectionExecutor {
    pub fn new(
        store: Arc<MemoryStore>,
        embedder: Arc<EmbeddingClient>,
        recall: Arc<RecallEngine>,
        lifecycle: Arc<LifecycleEngine>,
        detector: Arc<ContradictionDetector>,
        defaults: DaemonDefaults,
    ) -> Self {
        Self {
            store,
            embedder,
            recall,
            lifecycle,
            detector,
            defaults,
            transcripts: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Create a job and schedule it. Returns the job id immediately; the run
    /// happens on a blocking worker when a runtime is available, inline
    /// otherwise.
    pub fn trigger(
        self: &Arc<Self>,
        agent_id: &str,
        session_id: Option<&str>,
        transcript: Option<&str>,
    ) -> StoreResult<String> {
        let job = ReflectJob::new(agent_id, session_id.map(str::to_string));
        let job_id = job.id.clone();
        self.store.insert_job(&job)?;

        if let Some(transcript) = transcript {
            if let Ok(mut transcripts) = self.transcripts.lock() {
                transcripts.insert(job_id.clone(), transcript.to_string());
            }
        }
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.insert(job_id.clone(), Arc::new(AtomicBool::new(false)));
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let executor = Arc::clone(self);
                let id = job_id.clone();
                handle.spawn_blocking(move || executor.run_job(&id));
            }
            Err(_) => {
                self.run_job(&job_id);
            }
        }
        Ok(job_id)
    }

    /// Request cancellation; the job fails at its next stage boundary
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.cancels.lock() {
            Ok(cancels) => match cancels.get(job_id) {
                Some(flag) => {
                    flag.store(true, Ordering::SeqCst);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Advance a pending job through all stages. Public so tests (and the
    /// inline fallback) can run jobs synchronously.
    pub fn run_job(&self, job_id: &str) {
        let mut job = match self.store.get_job(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job = %job_id, "Job vanished before execution");
                return;
            }
            Err(e) => {
                tracing::warn!(job = %job_id, "Could not load job: {}", e);
                return;
            }
        };
        // Stages 1-3 and 8 are single-fire: a job id never re-executes
        if job.status != JobStatus::Pending {
            tracing::debug!(job = %job_id, status = %job.status.as_str(), "Job already advanced");
            return;
        }

        let transcript = self
            .transcripts
            .lock()
            .ok()
            .and_then(|mut t| t.remove(job_id));
        let cancel = self
            .cancels
            .lock()
            .ok()
            .and_then(|c| c.get(job_id).cloned())
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

        // Snapshot settings at job start; live edits do not affect this run
        let settings = self.snapshot_settings(&job.agent_id);

        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        if let Err(e) = self.store.save_job(&job) {
            tracing::warn!(job = %job_id, "Could not mark job running: {}", e);
            return;
        }

        let mut ctx = StageContext {
            agent_id: &job.agent_id,
            session_id: job.session_id.as_deref(),
            job_id: &job.id,
            transcript: transcript.as_deref(),
            settings: &settings,
            store: &self.store,
            embedder: &self.embedder,
            recall: &self.recall,
            lifecycle: &self.lifecycle,
            detector: &self.detector,
            cancel: &cancel,
            state: PipelineState::default(),
        };

        let mut failed = false;
        for (index, stage_name) in STAGE_NAMES.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                job.stages[index].status = StageStatus::Failed;
                job.stages[index].error = Some("cancelled".to_string());
                failed = true;
                break;
            }

            job.stages[index].status = StageStatus::Running;
            job.stages[index].started_at = Some(Utc::now());
            let _ = self.store.save_job(&job);

            let _usage = push_context(
                UsageContext::operation("reflect")
                    .with_agent(&job.agent_id)
                    .with_stage(&job.id, *stage_name),
            );

            match run_stage(index, &mut ctx) {
                Ok(stats) => {
                    job.stages[index].status = StageStatus::Complete;
                    job.stages[index].completed_at = Some(Utc::now());
                    job.stages[index].stats = stats;
                    let _ = self.store.save_job(&job);
                }
                Err(e) => {
                    tracing::warn!(job = %job.id, stage = %stage_name, "Stage failed: {}", e);
                    job.stages[index].status = StageStatus::Failed;
                    job.stages[index].completed_at = Some(Utc::now());
                    job.stages[index].error = Some(e.to_string());
                    failed = true;
                    break;
                }
            }
        }

        job.status = if failed {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        job.completed_at = Some(Utc::now());
        if let Err(e) = self.store.save_job(&job) {
            tracing::warn!(job = %job.id, "Could not persist job completion: {}", e);
        }

        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.remove(job_id);
        }
    }

    /// Fetch a job by id
    pub fn get_job(&self, job_id: &str) -> StoreResult<ReflectJob> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job_id)))
    }

    /// List an agent's jobs, newest first
    pub fn list_jobs(&self, agent_id: &str, limit: usize) -> StoreResult<Vec<ReflectJob>> {
        self.store.list_jobs(agent_id, limit)
    }

    fn snapshot_settings(&self, agent_id: &str) -> ResolvedPipelineSettings {
        let agent_doc = self.store.get_settings_doc(agent_id).unwrap_or_else(|e| {
            tracing::warn!("Could not load agent settings: {}", e);
            None
        });
        let global_doc = self.store.get_settings_doc(GLOBAL_AGENT_ID).unwrap_or_else(|e| {
            tracing::warn!("Could not load global settings: {}", e);
            None
        });
        resolve(agent_doc.as_ref(), global_doc.as_ref(), &self.defaults)
    }
}

// ============================================================================
// TESTS
// ============================================================================
