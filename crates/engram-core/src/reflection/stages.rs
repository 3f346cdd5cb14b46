//! Pipeline stages
//!
//! Each stage is a function over a shared [`StageContext`] returning its
//! stats. Stages 1-3 and 8 produce new state and are single-fire at the job
//! level; stages 4-7 and 9 are written so a re-run cannot double-count
//! (absolute writes, set-union entity records, skip-if-present guards).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;

use crate::contradiction::{ContradictionDetector, DetectedConflict};
use crate::embeddings::{EmbeddingClient, EmbeddingError, InputHint};
use crate::graph::GraphError;
use crate::lifecycle::{classify_strength, LifecycleEngine, StrengthBand};
use crate::memory::{
    Contradiction, EdgeKind, Entity, Episode, GraphEdge, Memory, MemoryLayer, MemoryType,
    PendingEdge,
};
use crate::recall::{RecallEngine, RecallError, RecallQuery};
use crate::settings::ResolvedPipelineSettings;
use crate::storage::{MemoryFilter, MemoryPatch, MemoryStore, Projection, StoreError};

// ============================================================================
// TUNABLES
// ============================================================================

/// Maximum atoms extracted per transcript
const MAX_ATOMS: usize = 50;

/// Similarity at or above which an atom is a duplicate of an existing memory
const DEDUP_THRESHOLD: f32 = 0.92;

/// Detector probability at or above which a conflict counts as strong
const STRONG_CONFLICT_THRESHOLD: f64 = 0.80;

/// Similar memories linked per new atom
const GRAPH_LINK_TOP_K: usize = 5;

// ============================================================================
// ERROR TYPE
// ============================================================================

/// Stage failure; never propagates past the stage boundary
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Recall(#[from] RecallError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

// ============================================================================
// CONTEXT
// ============================================================================

/// A candidate memory produced by extraction, carried through the stages
#[derive(Debug, Clone)]
pub struct Atom {
    pub text: String,
    pub embedding: Vec<f32>,
    /// Existing memory this atom duplicates, with the match score
    pub duplicate_of: Option<(String, f32)>,
    pub conflicts: Vec<DetectedConflict>,
    pub memory_type: MemoryType,
    /// Set once the atom is inserted
    pub memory_id: Option<String>,
}

/// Working state shared by the stages of one job
#[derive(Debug, Default)]
pub struct PipelineState {
    pub atoms: Vec<Atom>,
    /// Guard so confidence updates apply at most once per job
    pub confidence_applied: bool,
}

/// Everything a stage needs: identifiers, the settings snapshot, engine
/// handles, the cancellation flag, and the cross-stage working state
pub struct StageContext<'a> {
    pub agent_id: &'a str,
    pub session_id: Option<&'a str>,
    pub job_id: &'a str,
    pub transcript: Option<&'a str>,
    pub settings: &'a ResolvedPipelineSettings,
    pub store: &'a MemoryStore,
    pub embedder: &'a EmbeddingClient,
    pub recall: &'a RecallEngine,
    pub lifecycle: &'a LifecycleEngine,
    pub detector: &'a ContradictionDetector,
    pub cancel: &'a AtomicBool,
    pub state: PipelineState,
}

/// Dispatch a stage by its position in the declared order
pub fn run_stage(index: usize, ctx: &mut StageContext<'_>) -> Result<serde_json::Value, StageError> {
    match index {
        0 => extract(ctx),
        1 => deduplicate(ctx),
        2 => conflict_check(ctx),
        3 => classify(ctx),
        4 => confidence_update(ctx),
        5 => decay_pass(ctx),
        6 => layer_promote(ctx),
        7 => graph_link(ctx),
        8 => entity_update(ctx),
        _ => Ok(serde_json::Value::Null),
    }
}

// ============================================================================
// STAGE 1: EXTRACT
// ============================================================================

static SPEAKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(user|assistant|system|human|agent)\s*[:>]\s*").unwrap());

fn extract(ctx: &mut StageContext<'_>) -> Result<serde_json::Value, StageError> {
    let transcript = ctx.transcript.unwrap_or("");
    if ctx.settings.stages.extract && !ctx.settings.llm.endpoint.is_empty() {
        tracing::debug!(job = %ctx.job_id, "LLM extraction configured; heuristics still drive this run");
    }

    let mut participants: HashSet<String> = HashSet::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut atoms: Vec<Atom> = Vec::new();

    for line in transcript.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(m) = SPEAKER_RE.find(trimmed) {
            participants.insert(
                trimmed[..m.end()]
                    .trim_end_matches([':', '>', ' '])
                    .to_lowercase(),
            );
        }
        let content = SPEAKER_RE.replace(trimmed, "");
        for sentence in content.split_inclusive(['.', '!', '?']) {
            if atoms.len() >= MAX_ATOMS {
                break;
            }
            let sentence = sentence.trim().trim_end_matches(['.', '!']);
            let chars = sentence.chars().count();
            if !(10..=300).contains(&chars) {
                continue;
            }
            // Questions are not statements of fact
            if sentence.ends_with('?') {
                continue;
            }
            if sentence.split_whitespace().count() < 3 {
                continue;
            }
            let key = sentence.to_lowercase();
            if !seen.insert(key) {
                continue;
            }
            atoms.push(Atom {
                text: sentence.to_string(),
                embedding: vec![],
                duplicate_of: None,
                conflicts: vec![],
                memory_type: MemoryType::Fact,
                memory_id: None,
            });
        }
    }

    // Record the session as an episode while the transcript is at hand
    if let Some(session_id) = ctx.session_id {
        if !transcript.is_empty() {
            let episode = build_episode(ctx, session_id, transcript, &atoms, &participants)?;
            ctx.store.upsert_episode(&episode)?;
        }
    }

    let stats = json!({
        "atoms": atoms.len(),
        "transcriptChars": transcript.chars().count(),
        "participants": participants.len(),
    });
    ctx.state.atoms = atoms;
    Ok(stats)
}

fn build_episode(
    ctx: &StageContext<'_>,
    session_id: &str,
    transcript: &str,
    atoms: &[Atom],
    participants: &HashSet<String>,
) -> Result<Episode, StageError> {
    let title = atoms
        .first()
        .map(|a| truncate_chars(&a.text, 80))
        .unwrap_or_else(|| format!("Session {}", session_id));
    let narrative = truncate_chars(transcript, 500);
    let embedding = ctx
        .embedder
        .embed_one(&narrative, Some(InputHint::Document))?;
    let now = chrono::Utc::now();
    Ok(Episode {
        id: format!("{}::{}", ctx.agent_id, session_id),
        agent_id: ctx.agent_id.to_string(),
        session_id: session_id.to_string(),
        title,
        narrative,
        participants: participants.iter().cloned().collect(),
        dominant_topics: dominant_topics(transcript, 3),
        fact_ids: vec![],
        embedding,
        strength: 1.0,
        layer: MemoryLayer::Episodic,
        started_at: now,
        ended_at: now,
    })
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn dominant_topics(text: &str, top: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 4)
    {
        *counts.entry(token.to_string()).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().take(top).map(|(t, _)| t).collect()
}

// ============================================================================
// STAGE 2: DEDUPLICATE
// ============================================================================

fn deduplicate(ctx: &mut StageContext<'_>) -> Result<serde_json::Value, StageError> {
    let input = ctx.state.atoms.len();
    let mut duplicates = 0usize;

    for atom in &mut ctx.state.atoms {
        let mut query = RecallQuery::new(ctx.agent_id, &atom.text);
        query.limit = 5;
        query.min_score = Some(DEDUP_THRESHOLD);
        let response = ctx.recall.recall(&query)?;
        if let Some(best) = response.results.first() {
            atom.duplicate_of = Some((best.id.clone(), best.score));
            duplicates += 1;
        }
    }

    Ok(json!({
        "input": input,
        "duplicates": duplicates,
        "survivors": input - duplicates,
    }))
}

// ============================================================================
// STAGE 3: CONFLICT-CHECK
// ============================================================================

fn conflict_check(ctx: &mut StageContext<'_>) -> Result<serde_json::Value, StageError> {
    // Embed survivors once with the document hint; later stages reuse these
    let survivor_texts: Vec<String> = ctx
        .state
        .atoms
        .iter()
        .filter(|a| a.duplicate_of.is_none())
        .map(|a| a.text.clone())
        .collect();
    if !survivor_texts.is_empty() {
        let vectors = ctx
            .embedder
            .embed(&survivor_texts, Some(InputHint::Document))?;
        let mut vectors = vectors.into_iter();
        for atom in ctx
            .state
            .atoms
            .iter_mut()
            .filter(|a| a.duplicate_of.is_none())
        {
            if let Some(vector) = vectors.next() {
                atom.embedding = vector;
            }
        }
    }

    let mut checked = 0usize;
    let mut pairs: Vec<serde_json::Value> = Vec::new();
    for (index, atom) in ctx.state.atoms.iter_mut().enumerate() {
        if atom.duplicate_of.is_some() || atom.embedding.is_empty() {
            continue;
        }
        checked += 1;
        let conflicts = ctx
            .detector
            .detect(ctx.agent_id, &atom.text, &atom.embedding)?;
        for conflict in &conflicts {
            pairs.push(json!({
                "atom": index,
                "targetId": conflict.target_id,
                "kind": conflict.kind.as_str(),
                "probability": conflict.probability,
            }));
        }
        atom.conflicts = conflicts;
    }

    Ok(json!({
        "checked": checked,
        "conflicts": pairs.len(),
        "pairs": pairs,
    }))
}

// ============================================================================
// STAGE 4: CLASSIFY
// ============================================================================

static PREFERENCE_HINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(prefer|like|favorite|always use|best)\b").unwrap());
static DECISION_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(decided|decision|chose|chosen|will use|going with|settled on)\b").unwrap()
});
static OPINION_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(i think|i believe|in my opinion|probably|arguably)\b").unwrap()
});
static OBSERVATION_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(noticed|observed|saw that|seems|appears|looks like)\b").unwrap()
});

/// Heuristic memory-type assignment for an extracted atom
pub fn classify_atom_type(text: &str) -> MemoryType {
    if DECISION_HINT_RE.is_match(text) {
        MemoryType::Decision
    } else if PREFERENCE_HINT_RE.is_match(text) {
        MemoryType::Preference
    } else if OPINION_HINT_RE.is_match(text) {
        MemoryType::Opinion
    } else if OBSERVATION_HINT_RE.is_match(text) {
        MemoryType::Observation
    } else {
        MemoryType::Fact
    }
}

fn classify(ctx: &mut StageContext<'_>) -> Result<serde_json::Value, StageError> {
    if ctx.settings.stages.classify && !ctx.settings.llm.endpoint.is_empty() {
        tracing::debug!(job = %ctx.job_id, "LLM classification configured; heuristics still drive this run");
    }

    let mut inserted = 0usize;
    let mut by_type: HashMap<&'static str, usize> = HashMap::new();
    let agent_id = ctx.agent_id.to_string();
    let session_id = ctx.session_id.map(str::to_string);

    for atom in &mut ctx.state.atoms {
        if atom.duplicate_of.is_some() || atom.memory_id.is_some() {
            continue;
        }
        atom.memory_type = classify_atom_type(&atom.text);

        let mut memory = Memory::new(&agent_id, &atom.text).with_type(atom.memory_type);
        memory.session_id = session_id.clone();
        memory.tags = vec!["reflection".to_string()];
        memory.metadata.insert(
            "jobId".to_string(),
            serde_json::Value::String(ctx.job_id.to_string()),
        );
        memory.embedding = atom.embedding.clone();
        memory.contradictions = atom
            .conflicts
            .iter()
            .map(|c| Contradiction::unresolved(&c.target_id))
            .collect();

        let stored = ctx.store.insert(memory)?;
        ctx.recall.index_add(&stored.id, &stored.embedding);

        // The link is symmetric: the existing memory records it too
        for conflict in &atom.conflicts {
            let patch = MemoryPatch {
                push_contradictions: vec![Contradiction::unresolved(&stored.id)],
                ..Default::default()
            };
            ctx.store.update(&conflict.target_id, &patch)?;
        }

        *by_type.entry(atom.memory_type.as_str()).or_default() += 1;
        atom.memory_id = Some(stored.id);
        inserted += 1;
    }

    // Fill the episode's fact list now that atoms have ids
    if let Some(session_id) = ctx.session_id {
        if let Some(mut episode) = ctx.store.get_episode(ctx.agent_id, session_id)? {
            episode.fact_ids = ctx
                .state
                .atoms
                .iter()
                .filter_map(|a| a.memory_id.clone())
                .collect();
            ctx.store.upsert_episode(&episode)?;
        }
    }

    Ok(json!({
        "inserted": inserted,
        "byType": by_type,
    }))
}

// ============================================================================
// STAGE 5: CONFIDENCE-UPDATE
// ============================================================================

fn confidence_update(ctx: &mut StageContext<'_>) -> Result<serde_json::Value, StageError> {
    if ctx.state.confidence_applied {
        return Ok(json!({
            "reinforced": 0, "weakenedStrong": 0, "weakenedWeak": 0, "skipped": true,
        }));
    }

    let mut reinforced = 0usize;
    let mut weakened_strong = 0usize;
    let mut weakened_weak = 0usize;

    // One update per distinct target, strongest conflict wins
    let mut reinforce_targets: HashSet<String> = HashSet::new();
    let mut conflict_targets: HashMap<String, f64> = HashMap::new();
    for atom in &ctx.state.atoms {
        if let Some((id, score)) = &atom.duplicate_of {
            if *score >= DEDUP_THRESHOLD {
                reinforce_targets.insert(id.clone());
            }
        }
        for conflict in &atom.conflicts {
            let entry = conflict_targets
                .entry(conflict.target_id.clone())
                .or_insert(0.0);
            *entry = entry.max(conflict.probability);
        }
    }

    for id in reinforce_targets {
        if ctx.lifecycle.reinforce_memory(&id)? {
            reinforced += 1;
        }
    }
    for (id, probability) in conflict_targets {
        let strong = probability >= STRONG_CONFLICT_THRESHOLD;
        if ctx.lifecycle.weaken_memory(&id, strong)? {
            if strong {
                weakened_strong += 1;
            } else {
                weakened_weak += 1;
            }
        }
    }

    ctx.state.confidence_applied = true;
    Ok(json!({
        "reinforced": reinforced,
        "weakenedStrong": weakened_strong,
        "weakenedWeak": weakened_weak,
    }))
}

// ============================================================================
// STAGE 6: DECAY-PASS
// ============================================================================

fn decay_pass(ctx: &mut StageContext<'_>) -> Result<serde_json::Value, StageError> {
    let summary = ctx.lifecycle.run_decay_pass(Some(ctx.agent_id));
    Ok(serde_json::to_value(summary).unwrap_or(serde_json::Value::Null))
}

// ============================================================================
// STAGE 7: LAYER-PROMOTE
// ============================================================================

fn layer_promote(ctx: &mut StageContext<'_>) -> Result<serde_json::Value, StageError> {
    let mut candidates: Vec<String> = Vec::new();
    ctx.store.scan_where(
        &MemoryFilter::agent(ctx.agent_id),
        Projection::NoEmbedding,
        usize::MAX,
        |memory| {
            if memory.layer == MemoryLayer::Semantic
                && classify_strength(memory.strength) == StrengthBand::ExpirationCandidate
            {
                candidates.push(memory.id);
            }
            true
        },
    )?;

    let mut promoted = 0usize;
    if ctx.settings.auto_promote_layers {
        for id in &candidates {
            let patch = MemoryPatch {
                layer: Some(MemoryLayer::Archival),
                ..Default::default()
            };
            if ctx.store.update(id, &patch)? {
                promoted += 1;
            }
        }
    }

    Ok(json!({
        "candidates": candidates.len(),
        "candidateIds": candidates,
        "promoted": promoted,
    }))
}

// ============================================================================
// STAGE 8: GRAPH-LINK
// ============================================================================

fn graph_link(ctx: &mut StageContext<'_>) -> Result<serde_json::Value, StageError> {
    let new_ids: HashSet<String> = ctx
        .state
        .atoms
        .iter()
        .filter_map(|a| a.memory_id.clone())
        .collect();

    let mut proposed = 0usize;
    for atom in &ctx.state.atoms {
        let Some(memory_id) = &atom.memory_id else {
            continue;
        };
        let mut query = RecallQuery::new(ctx.agent_id, &atom.text);
        query.limit = GRAPH_LINK_TOP_K + new_ids.len().min(10);
        let response = ctx.recall.recall(&query)?;

        for hit in response
            .results
            .iter()
            .filter(|hit| !new_ids.contains(&hit.id))
            .take(GRAPH_LINK_TOP_K)
        {
            let kind = if hit.score >= 0.9 {
                EdgeKind::DerivesFrom
            } else if hit.score >= 0.8 {
                EdgeKind::Supports
            } else {
                EdgeKind::CoOccurs
            };
            let pending = PendingEdge::new(
                memory_id,
                &hit.id,
                kind,
                hit.score as f64,
                hit.score as f64,
                format!("similar to new memory ({:.2})", hit.score),
            );
            ctx.store.insert_pending_edge(&pending)?;
            proposed += 1;
        }
    }

    Ok(json!({ "proposed": proposed }))
}

// ============================================================================
// STAGE 9: ENTITY-UPDATE
// ============================================================================

static ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][A-Za-z0-9]{2,}\b").unwrap());

static ENTITY_STOPSET: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "The", "This", "That", "These", "Those", "There", "Then", "They", "She", "His", "Her",
        "And", "But", "For", "Not", "With", "From", "When", "Where", "What", "Which", "While",
        "After", "Before", "Because", "Also", "Our", "Your", "You", "However",
    ]
    .into_iter()
    .collect()
});

/// Capitalized terms that look like named entities
pub fn extract_entities(text: &str) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    let mut entities = Vec::new();
    for m in ENTITY_RE.find_iter(text) {
        let name = m.as_str();
        if ENTITY_STOPSET.contains(name) {
            continue;
        }
        let slug = Entity::slugify(name);
        if slug.is_empty() || !seen.insert(slug.clone()) {
            continue;
        }
        entities.push((slug, name.to_string()));
    }
    entities
}

fn entity_update(ctx: &mut StageContext<'_>) -> Result<serde_json::Value, StageError> {
    let mut entities_touched = HashSet::new();
    let mut edges_added = 0usize;

    let atoms: Vec<(String, String)> = ctx
        .state
        .atoms
        .iter()
        .filter_map(|a| a.memory_id.clone().map(|id| (id, a.text.clone())))
        .collect();

    for (memory_id, text) in atoms {
        for (slug, name) in extract_entities(&text) {
            let kind = if name.chars().all(|c| c.is_ascii_uppercase()) {
                "acronym"
            } else {
                "term"
            };
            ctx.store
                .upsert_entity_mention(ctx.agent_id, &slug, &name, kind, &memory_id)?;
            entities_touched.insert(slug.clone());

            // Direct edge, no review step; skip when already present
            let Some(memory) = ctx.store.get_by_id(&memory_id)? else {
                continue;
            };
            let already = memory.edges.iter().any(|e| {
                e.edge_type == EdgeKind::MentionsEntity && e.target_id == slug
            });
            if !already {
                let edge = GraphEdge::new(EdgeKind::MentionsEntity, &slug, 1.0);
                ctx.store.apply_edge(&memory_id, &edge, None, None)?;
                edges_added += 1;
            }
        }
    }

    Ok(json!({
        "entities": entities_touched.len(),
        "edgesAdded": edges_added,
    }))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_atom_type() {
        assert_eq!(
            classify_atom_type("I prefer dark mode for editors"),
            MemoryType::Preference
        );
        assert_eq!(
            classify_atom_type("We decided to ship on Friday"),
            MemoryType::Decision
        );
        assert_eq!(
            classify_atom_type("I think the cache is too small"),
            MemoryType::Opinion
        );
        assert_eq!(
            classify_atom_type("It seems the tests are flaky"),
            MemoryType::Observation
        );
        assert_eq!(
            classify_atom_type("The database runs on port 5432"),
            MemoryType::Fact
        );
    }

    #[test]
    fn test_extract_entities() {
        let entities = extract_entities("We moved the API from Postgres to DynamoDB last week");
        let slugs: Vec<&str> = entities.iter().map(|(s, _)| s.as_str()).collect();
        assert!(slugs.contains(&"api"));
        assert!(slugs.contains(&"postgres"));
        assert!(slugs.contains(&"dynamodb"));
        // Sentence-leading stopwords never become entities
        assert!(!slugs.contains(&"we"));
    }

    #[test]
    fn test_extract_entities_dedupes() {
        let entities = extract_entities("Postgres talks to Postgres");
        assert_eq!(entities.len(), 1);
    }

    #[test]
    fn test_dominant_topics() {
        let topics = dominant_topics(
            "caching caching caching database database metrics",
            2,
        );
        assert_eq!(topics, vec!["caching", "database"]);
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo");
        assert_eq!(truncate_chars("short", 100), "short");
    }
}
