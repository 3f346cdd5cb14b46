//! Lifecycle Engine
//!
//! Confidence updates, per-layer exponential strength decay, strength
//! classification, and the scheduled decay pass that applies all of it
//! across the store.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::MemoryLayer;
use crate::storage::{MemoryFilter, MemoryPatch, MemoryStore, Projection};

// ============================================================================
// CONFIDENCE RULES
// ============================================================================

/// Lower confidence bound
pub const CONFIDENCE_FLOOR: f64 = 0.02;

/// Upper confidence bound
pub const CONFIDENCE_CEILING: f64 = 0.98;

fn clamp_confidence(c: f64) -> f64 {
    c.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING)
}

/// Reinforcement: move 15% of the remaining headroom
pub fn reinforce(confidence: f64) -> f64 {
    clamp_confidence(confidence + (1.0 - confidence) * 0.15)
}

/// Strong contradiction: lose 25%
pub fn contradict_strong(confidence: f64) -> f64 {
    clamp_confidence(confidence - confidence * 0.25)
}

/// Weak contradiction: lose 8%
pub fn contradict_weak(confidence: f64) -> f64 {
    clamp_confidence(confidence - confidence * 0.08)
}

/// Superseded on conflict resolution: keep 60%, floored
pub fn supersede(confidence: f64) -> f64 {
    clamp_confidence((confidence * 0.60).max(CONFIDENCE_FLOOR))
}

// ============================================================================
// TEMPORAL DECAY
// ============================================================================

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Strength after exponential decay from `last_reinforced_at` to `now`.
/// Idempotent at a fixed `now`: the result depends only on the reinforcement
/// timestamp, never on how many times decay already ran.
pub fn decayed_strength(
    strength: f64,
    layer: MemoryLayer,
    last_reinforced_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let elapsed = (now - last_reinforced_at).num_milliseconds() as f64 / 1000.0;
    if elapsed <= 0.0 {
        return strength.clamp(0.0, 1.0);
    }
    let delta_days = elapsed / SECONDS_PER_DAY;
    (strength * (-layer.daily_decay_rate() * delta_days).exp()).clamp(0.0, 1.0)
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Strength band after classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrengthBand {
    Vivid,
    Fading,
    Dim,
    ArchivalCandidate,
    ExpirationCandidate,
}

impl StrengthBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrengthBand::Vivid => "vivid",
            StrengthBand::Fading => "fading",
            StrengthBand::Dim => "dim",
            StrengthBand::ArchivalCandidate => "archival_candidate",
            StrengthBand::ExpirationCandidate => "expiration_candidate",
        }
    }
}

/// Classify a strength value into its band
pub fn classify_strength(strength: f64) -> StrengthBand {
    if strength >= 0.80 {
        StrengthBand::Vivid
    } else if strength >= 0.50 {
        StrengthBand::Fading
    } else if strength >= 0.25 {
        StrengthBand::Dim
    } else if strength >= 0.10 {
        StrengthBand::ArchivalCandidate
    } else {
        StrengthBand::ExpirationCandidate
    }
}

/// Whether a memory is strong enough to seed bootstrap context
pub fn bootstrap_eligible(strength: f64) -> bool {
    strength >= 0.80
}

// ============================================================================
// DECAY PASS
// ============================================================================

/// Counters from one decay pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecayPassSummary {
    pub total_memories: u64,
    pub decayed: u64,
    pub archival_candidates: u64,
    pub expiration_candidates: u64,
    /// Rows hard-deleted because `expiresAt` passed
    pub expired_deleted: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

/// Applies confidence and decay rules against the store
pub struct LifecycleEngine {
    store: Arc<MemoryStore>,
}

impl LifecycleEngine {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Reinforce one memory: confidence rule, strength reset to 1.0, and a
    /// fresh reinforcement timestamp
    pub fn reinforce_memory(&self, id: &str) -> crate::storage::Result<bool> {
        let Some(memory) = self.store.get_by_id(id)? else {
            return Ok(false);
        };
        let patch = MemoryPatch {
            confidence: Some(reinforce(memory.confidence)),
            strength: Some(1.0),
            last_reinforced_at: Some(Utc::now()),
            ..Default::default()
        };
        self.store.update(id, &patch)
    }

    /// Apply a contradiction confidence hit, strong or weak
    pub fn weaken_memory(&self, id: &str, strong: bool) -> crate::storage::Result<bool> {
        let Some(memory) = self.store.get_by_id(id)? else {
            return Ok(false);
        };
        let confidence = if strong {
            contradict_strong(memory.confidence)
        } else {
            contradict_weak(memory.confidence)
        };
        let patch = MemoryPatch {
            confidence: Some(confidence),
            ..Default::default()
        };
        self.store.update(id, &patch)
    }

    /// Apply the superseded confidence rule
    pub fn supersede_memory(&self, id: &str) -> crate::storage::Result<bool> {
        let Some(memory) = self.store.get_by_id(id)? else {
            return Ok(false);
        };
        let patch = MemoryPatch {
            confidence: Some(supersede(memory.confidence)),
            ..Default::default()
        };
        self.store.update(id, &patch)
    }

    /// Run a decay pass over all memories, optionally scoped to one agent.
    ///
    /// Individual failures are counted and the pass continues. The TTL sweep
    /// runs first so expired rows never get a pointless decay write.
    pub fn run_decay_pass(&self, agent_id: Option<&str>) -> DecayPassSummary {
        let started = Instant::now();
        let now = Utc::now();
        let mut summary = DecayPassSummary::default();

        match self.store.delete_expired(now, agent_id) {
            Ok(deleted) => summary.expired_deleted = deleted,
            Err(e) => {
                tracing::warn!("TTL sweep failed: {}", e);
                summary.errors += 1;
            }
        }

        let agents = match agent_id {
            Some(agent) => vec![agent.to_string()],
            None => match self.list_agents() {
                Ok(agents) => agents,
                Err(e) => {
                    tracing::warn!("Could not enumerate agents for decay: {}", e);
                    summary.errors += 1;
                    vec![]
                }
            },
        };

        for agent in agents {
            // Collect lifecycle fields first, then write; holding the reader
            // while issuing writes would serialize on nothing useful.
            let mut rows: Vec<(String, f64, MemoryLayer, DateTime<Utc>)> = Vec::new();
            let scanned = self.store.scan_where(
                &MemoryFilter::agent(&agent),
                Projection::NoEmbedding,
                usize::MAX,
                |memory| {
                    rows.push((
                        memory.id,
                        memory.strength,
                        memory.layer,
                        memory.last_reinforced_at,
                    ));
                    true
                },
            );
            if let Err(e) = scanned {
                tracing::warn!(agent = %agent, "Decay scan failed: {}", e);
                summary.errors += 1;
                continue;
            }

            for (id, strength, layer, last_reinforced_at) in rows {
                summary.total_memories += 1;
                let next = decayed_strength(strength, layer, last_reinforced_at, now);
                let patch = MemoryPatch {
                    strength: Some(next),
                    last_decayed_at: Some(now),
                    ..Default::default()
                };
                match self.store.update(&id, &patch) {
                    Ok(true) => summary.decayed += 1,
                    Ok(false) => {} // deleted concurrently; nothing to count
                    Err(e) => {
                        tracing::warn!(memory = %id, "Decay update failed: {}", e);
                        summary.errors += 1;
                        continue;
                    }
                }
                match classify_strength(next) {
                    StrengthBand::ArchivalCandidate => summary.archival_candidates += 1,
                    StrengthBand::ExpirationCandidate => summary.expiration_candidates += 1,
                    _ => {}
                }
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        summary
    }

    fn list_agents(&self) -> crate::storage::Result<Vec<String>> {
        // Distinct agents seen in the store; small result set in practice
        let mut agents = std::collections::BTreeSet::new();
        self.store.scan_where(
            &MemoryFilter::default(),
            Projection::TextOnly,
            usize::MAX,
            |memory| {
                agents.insert(memory.agent_id);
                true
            },
        )?;
        Ok(agents.into_iter().collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================
