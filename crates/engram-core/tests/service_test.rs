//! End-to-end service scenarios over a temporary store with mock embeddings.

use std::sync::Arc;

use chrono::{Duration, Utc};
use engram_core::reflection::{JobStatus, StageStatus};
use engram_core::{
    classify_strength, decayed_strength, DaemonDefaults, EmbeddingClient, Memory, MemoryLayer,
    MemoryService, MemoryStore, RememberRequest, StrengthBand,
};
use tempfile::TempDir;

fn service() -> (Arc<MemoryService>, Arc<MemoryStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new(Some(dir.path().join("e2e.db"))).unwrap());
    let embedder = Arc::new(EmbeddingClient::mock());
    let service = Arc::new(
        MemoryService::new(store.clone(), embedder, DaemonDefaults::default()).unwrap(),
    );
    (service, store, dir)
}

#[test]
fn ingest_then_recall_returns_the_memory() {
    let (service, _store, _dir) = service();
    service
        .remember(&RememberRequest::new("agent1", "I prefer dark mode").with_tags(&["preference"]))
        .unwrap();

    let results = service
        .recall("agent1", "I prefer dark mode", 1, &[], None, None)
        .unwrap();
    assert_eq!(results.count, 1);
    assert_eq!(results.results[0].text, "I prefer dark mode");
    assert!(results.results[0].score >= 0.95);
    assert!(matches!(
        results.method,
        engram_core::RecallMethod::VectorSearch | engram_core::RecallMethod::InMemory
    ));
}

#[test]
fn tag_filter_limits_recall_to_matching_memories() {
    let (service, _store, _dir) = service();
    service
        .remember(&RememberRequest::new("agent1", "frontend layout decision").with_tags(&["ui"]))
        .unwrap();
    service
        .remember(&RememberRequest::new("agent1", "database index decision").with_tags(&["db"]))
        .unwrap();

    let results = service
        .recall("agent1", "anything", 10, &["ui".to_string()], None, None)
        .unwrap();
    assert_eq!(results.count, 1);
    assert_eq!(results.results[0].tags, vec!["ui"]);
}

#[test]
fn opposite_preferences_are_linked_as_contradictions() {
    let (service, _store, _dir) = service();
    let first = service
        .remember(
            &RememberRequest::new("agent1", "I prefer tabs over spaces").with_tags(&["preference"]),
        )
        .unwrap();
    let second = service
        .remember(
            &RememberRequest::new("agent1", "I prefer spaces over tabs").with_tags(&["preference"]),
        )
        .unwrap();

    let first_node = service.get_node(&first.id).unwrap();
    let second_node = service.get_node(&second.id).unwrap();
    assert_eq!(first_node.contradictions.len(), 1);
    assert_eq!(second_node.contradictions.len(), 1);
    assert_eq!(first_node.contradictions[0].target_memory_id, second.id);
    assert_eq!(second_node.contradictions[0].target_memory_id, first.id);
}

#[test]
fn year_old_episodic_memory_becomes_an_expiration_candidate() {
    let reinforced = Utc::now() - Duration::days(365);
    let strength = decayed_strength(1.0, MemoryLayer::Episodic, reinforced, Utc::now());
    assert!((strength - 0.00426).abs() < 0.0005);
    assert_eq!(classify_strength(strength), StrengthBand::ExpirationCandidate);
}

#[test]
fn traversal_covers_forward_and_reverse_reachability() {
    let (service, _store, _dir) = service();
    let a = service.remember(&RememberRequest::new("agent1", "node a")).unwrap();
    let b = service.remember(&RememberRequest::new("agent1", "node b")).unwrap();
    let c = service.remember(&RememberRequest::new("agent1", "node c")).unwrap();
    let d = service.remember(&RememberRequest::new("agent1", "node d")).unwrap();

    service.create_edge(&a.id, &b.id, "PRECEDES", 1.0, None).unwrap();
    service.create_edge(&a.id, &d.id, "SUPPORTS", 1.0, None).unwrap();
    service.create_edge(&b.id, &c.id, "PRECEDES", 1.0, None).unwrap();

    let outbound = service.traverse(&a.id, "outbound", 2, &[]).unwrap();
    let ids: Vec<&str> = outbound.connected.iter().map(|n| n.memory.id.as_str()).collect();
    assert_eq!(outbound.center_node.id, a.id);
    assert_eq!(ids.len(), 3);
    assert!(ids.contains(&b.id.as_str()));
    assert!(ids.contains(&c.id.as_str()));
    assert!(ids.contains(&d.id.as_str()));
    assert!(outbound.connected.iter().all(|n| n.depth <= 2 && n.depth >= 1));

    let inbound = service.traverse(&c.id, "inbound", 2, &[]).unwrap();
    let ids: Vec<&str> = inbound.connected.iter().map(|n| n.memory.id.as_str()).collect();
    assert!(ids.contains(&a.id.as_str()));
    assert!(ids.contains(&b.id.as_str()));
}

#[test]
fn reflection_job_runs_all_nine_stages() {
    let (service, _store, _dir) = service();
    let transcript = "user: I prefer dark mode in every editor I use.\n\
                      user: We decided to ship the importer on Friday.\n\
                      user: The staging database runs Postgres fifteen.";
    let response = service
        .trigger_reflect("agentX", Some("s1"), Some(transcript))
        .unwrap();

    let job = service.get_job(&response.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stages.len(), 9);
    assert!(job.stages.iter().all(|s| s.status == StageStatus::Complete));

    // The distilled memories are recallable afterwards
    let results = service
        .recall("agentX", "I prefer dark mode in every editor I use", 3, &[], None, None)
        .unwrap();
    assert!(results.count >= 1);
}

#[test]
fn reflection_with_empty_transcript_completes_with_zero_counts() {
    let (service, _store, _dir) = service();
    let response = service.trigger_reflect("agentX", Some("s1"), Some("")).unwrap();
    let job = service.get_job(&response.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.stages.iter().all(|s| s.status == StageStatus::Complete));
    assert_eq!(job.stages[0].stats["atoms"], 0);
    assert_eq!(job.stages[3].stats["inserted"], 0);
}

#[test]
fn forget_removes_the_memory_from_recall() {
    let (service, _store, _dir) = service();
    let kept = service
        .remember(&RememberRequest::new("agent1", "memory that stays"))
        .unwrap();
    let dropped = service
        .remember(&RememberRequest::new("agent1", "memory that goes away"))
        .unwrap();

    service.forget(&dropped.id).unwrap();
    let results = service
        .recall("agent1", "memory that goes away", 10, &[], None, None)
        .unwrap();
    assert!(results.results.iter().all(|hit| hit.id != dropped.id));
    assert!(results.results.iter().any(|hit| hit.id == kept.id));
}

#[test]
fn confidence_stays_clamped_under_repeated_updates() {
    use engram_core::lifecycle::{contradict_strong, reinforce};
    let mut up = 0.5;
    let mut down = 0.5;
    for _ in 0..1000 {
        up = reinforce(up);
        down = contradict_strong(down);
        assert!((0.02..=0.98).contains(&up));
        assert!((0.02..=0.98).contains(&down));
    }
}

#[test]
fn ttl_expired_memory_is_deleted_by_the_decay_pass() {
    let (service, store, _dir) = service();
    let mut request = RememberRequest::new("agent1", "short-lived note");
    request.ttl_seconds = Some(1);
    let stored = service.remember(&request).unwrap();

    // Move the deadline into the past, then sweep
    let patch = engram_core::MemoryPatch {
        expires_at: Some(Some(Utc::now() - Duration::seconds(5))),
        ..Default::default()
    };
    store.update(&stored.id, &patch).unwrap();

    let summary = service.lifecycle().run_decay_pass(Some("agent1"));
    assert_eq!(summary.expired_deleted, 1);
    assert!(store.get_by_id(&stored.id).unwrap().is_none());
}

#[test]
fn memories_do_not_cross_agents() {
    let (service, _store, _dir) = service();
    let mine = service
        .remember(&RememberRequest::new("agent-a", "a private fact of agent a"))
        .unwrap();

    let results = service
        .recall("agent-b", "a private fact of agent a", 10, &[], None, None)
        .unwrap();
    assert!(results.results.iter().all(|hit| hit.id != mine.id));

    let exported = service.export("agent-b", None).unwrap();
    assert_eq!(exported.count, 0);

    let memory = Memory::new("agent-a", "x");
    assert_eq!(memory.agent_id, "agent-a");
}
