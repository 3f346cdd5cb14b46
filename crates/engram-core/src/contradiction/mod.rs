//! Contradiction Detector
//!
//! Heuristic conflict detection at ingest time. Similarity candidates come
//! from a bounded same-agent scan; each candidate pair runs through three
//! regex classifiers (direct negation, opposite preference, temporal
//! mismatch). Detection records the symmetric link on both memories but never
//! changes confidence; that happens later when conflicts are resolved.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::embeddings::cosine_similarity;
use crate::storage::{MemoryFilter, MemoryStore, Projection};

// ============================================================================
// THRESHOLDS
// ============================================================================

/// Maximum same-agent memories scanned per detection
pub const CANDIDATE_SCAN_CAP: usize = 1_000;

/// Cosine similarity floor for a candidate pair
pub const SIMILARITY_THRESHOLD: f32 = 0.75;

/// Candidates kept after similarity ranking
pub const MAX_CANDIDATES: usize = 10;

/// Minimum classifier probability before a conflict is recorded
pub const RECORD_THRESHOLD: f64 = 0.70;

// ============================================================================
// PATTERNS
// ============================================================================

static NEGATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(not|no|never|don't|doesn't|didn't|isn't|aren't|wasn't|weren't|won't|can't|cannot|shouldn't|wouldn't)\b")
        .expect("negation pattern")
});

static PREFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(prefer|like|favorite|always use|best)\b").expect("preference pattern")
});

static PAST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(used to|previously|before|was|were|had)\b").expect("past pattern")
});

static PRESENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(now|currently|is|are|have|use)\b").expect("present pattern")
});

// ============================================================================
// TYPES
// ============================================================================

/// Conflict category produced by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// One statement negates the other
    Direct,
    /// Both state a preference with little shared vocabulary
    ContextDependent,
    /// One statement is about the past, the other about the present
    Temporal,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::Direct => "direct",
            ConflictKind::ContextDependent => "context-dependent",
            ConflictKind::Temporal => "temporal",
        }
    }
}

/// A conflict found between the incoming text and an existing memory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedConflict {
    /// The existing memory involved
    pub target_id: String,
    /// Classifier probability in [0, 1]
    pub probability: f64,
    /// Conflict category
    pub kind: ConflictKind,
    /// Cosine similarity that surfaced the candidate
    pub similarity: f32,
}

// ============================================================================
// CLASSIFIER
// ============================================================================

/// Lowercased token overlap of two texts, computed over adjacent token
/// pairs. Adjacency keeps reordered objects apart: "tabs over spaces" and
/// "spaces over tabs" share every word but almost no pair.
fn token_overlap(a: &str, b: &str) -> f64 {
    let pairs = |s: &str| -> HashSet<(String, String)> {
        let tokens: Vec<String> = s
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        tokens
            .windows(2)
            .map(|w| (w[0].clone(), w[1].clone()))
            .collect()
    };
    let set_a = pairs(a);
    let set_b = pairs(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

/// Classify a text pair. Returns the matched category and its probability,
/// or `None` when no heuristic fires.
pub fn classify_pair(a: &str, b: &str) -> Option<(f64, ConflictKind)> {
    // Direct negation: exactly one side negates
    let negated_a = NEGATION_RE.is_match(a);
    let negated_b = NEGATION_RE.is_match(b);
    if negated_a != negated_b {
        return Some((0.75, ConflictKind::Direct));
    }

    // Opposite preference: both state a preference about different things
    if PREFERENCE_RE.is_match(a) && PREFERENCE_RE.is_match(b) && token_overlap(a, b) < 0.3 {
        return Some((0.70, ConflictKind::ContextDependent));
    }

    // Temporal mismatch: one past, one present
    let past_a = PAST_RE.is_match(a);
    let past_b = PAST_RE.is_match(b);
    let present_a = PRESENT_RE.is_match(a);
    let present_b = PRESENT_RE.is_match(b);
    if (past_a && present_b && !past_b) || (past_b && present_a && !past_a) {
        return Some((0.65, ConflictKind::Temporal));
    }

    None
}

// ============================================================================
// DETECTOR
// ============================================================================

/// Runs candidate search plus the heuristic classifier against the store
pub struct ContradictionDetector {
    store: Arc<MemoryStore>,
}

impl ContradictionDetector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Gate: only contention-shaped memories are worth checking
    pub fn should_check(text: &str, tags: &[String], read_only: bool) -> bool {
        text.chars().count() > 10 && !tags.is_empty() && !read_only
    }

    /// Find conflicts between new text and the agent's existing memories.
    /// Only conflicts at or above [`RECORD_THRESHOLD`] are returned.
    pub fn detect(
        &self,
        agent_id: &str,
        text: &str,
        embedding: &[f32],
    ) -> crate::storage::Result<Vec<DetectedConflict>> {
        // Similarity candidates from a bounded scan, newest first
        let mut candidates: Vec<(String, String, f32)> = Vec::new();
        self.store.scan_where(
            &MemoryFilter::agent(agent_id),
            Projection::Full,
            CANDIDATE_SCAN_CAP,
            |memory| {
                if memory.embedding.is_empty() {
                    return true;
                }
                if let Ok(score) = cosine_similarity(embedding, &memory.embedding) {
                    if score >= SIMILARITY_THRESHOLD {
                        candidates.push((memory.id, memory.text, score));
                    }
                }
                true
            },
        )?;

        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(MAX_CANDIDATES);

        let mut conflicts = Vec::new();
        for (target_id, target_text, similarity) in candidates {
            if let Some((probability, kind)) = classify_pair(text, &target_text) {
                if probability >= RECORD_THRESHOLD {
                    conflicts.push(DetectedConflict {
                        target_id,
                        probability,
                        kind,
                        similarity,
                    });
                }
            }
        }
        Ok(conflicts)
    }
}

// ============================================================================
// TESTS
// ============================================================================
