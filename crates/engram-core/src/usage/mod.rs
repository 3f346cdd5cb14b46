//! Usage Tracker
//!
//! Attributes embedding token spend to the operation that caused it. Callers
//! push a context frame before an embedding call and let the guard pop it;
//! the tracker turns each usage signal into an append-only [`UsageEvent`]
//! with an estimated USD cost, persisted fire-and-forget.
//!
//! The context stack is thread-local (one stack per worker) so frames pushed
//! on one worker never leak into another's events. Running totals are shared.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embeddings::{EmbeddingClient, UsageSignal};
use crate::storage::MemoryStore;

// ============================================================================
// PRICE TABLE
// ============================================================================

/// USD per one million tokens, by model
const PRICE_TABLE: &[(&str, f64)] = &[
    ("voyage-4", 0.10),
    ("voyage-4-lite", 0.02),
    ("voyage-4-large", 0.12),
    ("voyage-3", 0.06),
    ("voyage-3-lite", 0.02),
    ("voyage-code-3", 0.10),
];

/// Price for models missing from the table
const DEFAULT_PRICE_PER_MILLION: f64 = 0.10;

/// USD per one million tokens for a model
pub fn price_per_million(model: &str) -> f64 {
    PRICE_TABLE
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, price)| *price)
        .unwrap_or(DEFAULT_PRICE_PER_MILLION)
}

// ============================================================================
// USAGE EVENT
// ============================================================================

/// Append-only time-series record of one embedding call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub model: String,
    pub provider: String,
    pub total_tokens: u64,
    pub input_texts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    pub estimated_cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<String>,
    pub is_mock: bool,
}

impl UsageEvent {
    /// Bare event with cost computed from the price table
    pub fn new(
        operation: &str,
        model: &str,
        provider: &str,
        total_tokens: u64,
        input_texts: u64,
        is_mock: bool,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            agent_id: None,
            model: model.to_string(),
            provider: provider.to_string(),
            total_tokens,
            input_texts,
            input_type: None,
            estimated_cost_usd: total_tokens as f64 * price_per_million(model) / 1e6,
            pipeline_job_id: None,
            pipeline_stage: None,
            memory_id: None,
            is_mock,
        }
    }
}

// ============================================================================
// CONTEXT FRAMES
// ============================================================================

/// What the current worker is doing, attributed onto emitted events
#[derive(Debug, Clone, Default)]
pub struct UsageContext {
    pub operation: String,
    pub agent_id: Option<String>,
    pub pipeline_job_id: Option<String>,
    pub pipeline_stage: Option<String>,
    pub memory_id: Option<String>,
}

impl UsageContext {
    pub fn operation(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_stage(
        mut self,
        job_id: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        self.pipeline_job_id = Some(job_id.into());
        self.pipeline_stage = Some(stage.into());
        self
    }
}

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<UsageContext>> = const { RefCell::new(Vec::new()) };
}

/// Pops its frame when dropped, so the pop runs on every exit path
pub struct ContextGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Push a context frame onto this worker's stack
pub fn push_context(context: UsageContext) -> ContextGuard {
    CONTEXT_STACK.with(|stack| stack.borrow_mut().push(context));
    ContextGuard {
        _not_send: std::marker::PhantomData,
    }
}

/// Peek the current frame; `operation=unknown` when the stack is empty
pub fn current_context() -> UsageContext {
    CONTEXT_STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .cloned()
            .unwrap_or_else(|| UsageContext::operation("unknown"))
    })
}

// ============================================================================
// RUNNING TOTALS
// ============================================================================

/// In-memory totals for one operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationTotals {
    pub events: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
}

// ============================================================================
// USAGE TRACKER
// ============================================================================

/// Captures usage signals into events and running totals
pub struct UsageTracker {
    store: Arc<MemoryStore>,
    totals: Mutex<HashMap<String, OperationTotals>>,
    write_failures: AtomicU64,
}

impl UsageTracker {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            totals: Mutex::new(HashMap::new()),
            write_failures: AtomicU64::new(0),
        }
    }

    /// Register this tracker as the embedding client's usage listener
    pub fn install(self: &Arc<Self>, client: &EmbeddingClient) {
        let tracker = Arc::clone(self);
        let provider = client.provider().to_string();
        client.on_usage(move |signal| tracker.record(signal, &provider));
    }

    /// Turn a usage signal into an event under the current context frame.
    /// Persistence failures are logged and counted, never thrown.
    pub fn record(&self, signal: &UsageSignal, provider: &str) {
        let context = current_context();
        let mut event = UsageEvent::new(
            &context.operation,
            &signal.model,
            provider,
            signal.total_tokens,
            signal.input_texts as u64,
            signal.is_mock,
        );
        event.agent_id = context.agent_id;
        event.pipeline_job_id = context.pipeline_job_id;
        event.pipeline_stage = context.pipeline_stage;
        event.memory_id = context.memory_id;
        event.input_type = signal.input_type.map(|h| h.as_str().to_string());

        if let Ok(mut totals) = self.totals.lock() {
            let entry = totals.entry(event.operation.clone()).or_default();
            entry.events += 1;
            entry.total_tokens += event.total_tokens;
            entry.estimated_cost_usd += event.estimated_cost_usd;
        }

        if let Err(e) = self.store.append_usage_event(&event) {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Failed to persist usage event: {}", e);
        }
    }

    /// Snapshot of the in-memory totals by operation
    pub fn running_totals(&self) -> HashMap<String, OperationTotals> {
        self.totals
            .lock()
            .map(|totals| totals.clone())
            .unwrap_or_default()
    }

    /// Number of events that failed to persist since startup
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::InputHint;
    use crate::storage::UsageGroupBy;
    use tempfile::TempDir;

    fn tracker() -> (Arc<UsageTracker>, Arc<MemoryStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new(Some(dir.path().join("test.db"))).unwrap());
        (Arc::new(UsageTracker::new(store.clone())), store, dir)
    }

    #[test]
    fn test_price_table() {
        assert_eq!(price_per_million("voyage-4"), 0.10);
        assert_eq!(price_per_million("voyage-4-lite"), 0.02);
        assert_eq!(price_per_million("voyage-4-large"), 0.12);
        assert_eq!(price_per_million("voyage-3"), 0.06);
        assert_eq!(price_per_million("voyage-3-lite"), 0.02);
        assert_eq!(price_per_million("voyage-code-3"), 0.10);
        assert_eq!(price_per_million("never-heard-of-it"), 0.10);
    }

    #[test]
    fn test_cost_estimate() {
        let event = UsageEvent::new("remember", "voyage-4", "voyageai", 2_000_000, 3, false);
        assert!((event.estimated_cost_usd - 0.20).abs() < 1e-9);
    }

    #[test]
    fn test_context_stack_push_pop() {
        assert_eq!(current_context().operation, "unknown");
        {
            let _outer = push_context(UsageContext::operation("remember").with_agent("agent1"));
            assert_eq!(current_context().operation, "remember");
            {
                let _inner = push_context(UsageContext::operation("recall"));
                assert_eq!(current_context().operation, "recall");
            }
            assert_eq!(current_context().operation, "remember");
            assert_eq!(current_context().agent_id.as_deref(), Some("agent1"));
        }
        assert_eq!(current_context().operation, "unknown");
    }

    #[test]
    fn test_record_attributes_context_and_persists() {
        let (tracker, store, _dir) = tracker();
        let _guard = push_context(
            UsageContext::operation("reflect")
                .with_agent("agent1")
                .with_stage("job-1", "extract"),
        );
        let signal = UsageSignal {
            total_tokens: 120,
            model: "voyage-4-lite".to_string(),
            input_texts: 4,
            input_type: Some(InputHint::Document),
            is_mock: true,
        };
        tracker.record(&signal, "voyageai");

        let totals = tracker.running_totals();
        assert_eq!(totals["reflect"].events, 1);
        assert_eq!(totals["reflect"].total_tokens, 120);

        let buckets = store
            .summarize_usage(None, None, UsageGroupBy::Stage)
            .unwrap();
        assert_eq!(buckets[0].key, "extract");
        assert_eq!(buckets[0].total_tokens, 120);
        assert_eq!(tracker.write_failures(), 0);
    }

    #[test]
    fn test_empty_stack_defaults_to_unknown() {
        let (tracker, store, _dir) = tracker();
        let signal = UsageSignal {
            total_tokens: 10,
            model: "mock-1024".to_string(),
            input_texts: 1,
            input_type: None,
            is_mock: true,
        };
        tracker.record(&signal, "mock");
        let buckets = store
            .summarize_usage(None, None, UsageGroupBy::Operation)
            .unwrap();
        assert_eq!(buckets[0].key, "unknown");
    }

    #[test]
    fn test_installed_listener_routes_through_tracker() {
        let (tracker, store, _dir) = tracker();
        let client = EmbeddingClient::mock();
        tracker.install(&client);

        let _guard = push_context(UsageContext::operation("remember"));
        client
            .embed(&["some text".to_string()], Some(InputHint::Document))
            .unwrap();

        assert_eq!(tracker.running_totals()["remember"].events, 1);
        let buckets = store
            .summarize_usage(None, None, UsageGroupBy::Operation)
            .unwrap();
        assert_eq!(buckets[0].key, "remember");
    }
}
