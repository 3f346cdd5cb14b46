//! Graph Service
//!
//! Typed, weighted directed edges between memories. Proposed edges sit in a
//! review queue until approved; symmetric relations (`CO_OCCURS`,
//! `CONTRADICTS`) apply in both directions atomically. Traversal is
//! breadth-first over the embedded adjacency arrays, bounded by depth,
//! direction, and edge type.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::{EdgeKind, GraphEdge, Memory, MemoryLayer, MemoryType, PendingEdge};
use crate::storage::{MemoryStore, StoreError};

// ============================================================================
// LIMITS
// ============================================================================

/// Maximum pending edges returned per listing
pub const MAX_PENDING_LIMIT: usize = 200;

/// Maximum traversal depth
pub const MAX_TRAVERSAL_DEPTH: usize = 5;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Graph error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),
    /// Request outside accepted bounds
    #[error("Invalid request: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;

// ============================================================================
// TRAVERSAL TYPES
// ============================================================================

/// Which edges to follow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Outbound,
    Inbound,
    Both,
}

/// Traversal request
#[derive(Debug, Clone)]
pub struct TraverseOptions {
    pub direction: Direction,
    /// At most [`MAX_TRAVERSAL_DEPTH`]
    pub max_depth: usize,
    /// Follow only these edge types when non-empty
    pub edge_types: Vec<EdgeKind>,
}

impl Default for TraverseOptions {
    fn default() -> Self {
        Self {
            direction: Direction::Outbound,
            max_depth: 2,
            edge_types: vec![],
        }
    }
}

/// Compact memory view used in graph responses; never carries the embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub id: String,
    pub text: String,
    pub tags: Vec<String>,
    pub memory_type: MemoryType,
    pub layer: MemoryLayer,
    pub confidence: f64,
    pub strength: f64,
    pub created_at: DateTime<Utc>,
}

impl From<&Memory> for NodeSummary {
    fn from(memory: &Memory) -> Self {
        Self {
            id: memory.id.clone(),
            text: memory.text.clone(),
            tags: memory.tags.clone(),
            memory_type: memory.memory_type,
            layer: memory.layer,
            confidence: memory.confidence,
            strength: memory.strength,
            created_at: memory.created_at,
        }
    }
}

/// One node reached during traversal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedNode {
    pub memory: NodeSummary,
    /// Edge type that reached the node
    pub relationship: EdgeKind,
    /// Hops from the center; the center itself is depth 0
    pub depth: usize,
    /// Ids from the center to this node, inclusive
    pub path: Vec<String>,
}

/// Traversal result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Traversal {
    pub center_node: NodeSummary,
    pub connected: Vec<ConnectedNode>,
}

/// Per-id outcome of a batch approval
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub approved: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub id: String,
    pub error: String,
}

// ============================================================================
// GRAPH SERVICE
// ============================================================================

/// Pending-edge review queue and graph traversal over the store
pub struct GraphService {
    store: Arc<MemoryStore>,
}

impl GraphService {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Queue a proposed edge for review
    pub fn propose(&self, edge: &PendingEdge) -> Result<()> {
        self.store.insert_pending_edge(edge)?;
        Ok(())
    }

    /// List pending proposals sorted by `(probability desc, createdAt desc)`
    pub fn list_pending(
        &self,
        edge_type: Option<EdgeKind>,
        min_probability: Option<f64>,
        limit: usize,
    ) -> Result<Vec<PendingEdge>> {
        let limit = limit.clamp(1, MAX_PENDING_LIMIT);
        Ok(self
            .store
            .list_pending_edges(edge_type, min_probability, limit)?)
    }

    /// Approve a pending edge: append it to the source memory, mirror it on
    /// the target for symmetric types, and delete the proposal. All three
    /// writes are atomic.
    pub fn approve(&self, pending_id: &str) -> Result<GraphEdge> {
        let pending = self
            .store
            .get_pending_edge(pending_id)?
            .ok_or_else(|| GraphError::NotFound(format!("pending edge {}", pending_id)))?;

        if self.store.get_by_id(&pending.source_id)?.is_none() {
            return Err(GraphError::NotFound(format!(
                "memory {}",
                pending.source_id
            )));
        }
        if self.store.get_by_id(&pending.target_id)?.is_none() {
            return Err(GraphError::NotFound(format!(
                "memory {}",
                pending.target_id
            )));
        }

        let mut edge = GraphEdge::new(pending.edge_type, &pending.target_id, pending.weight);
        edge.metadata = pending.metadata.clone();

        let mirror = pending.edge_type.is_symmetric().then(|| {
            let mut mirror = GraphEdge::new(pending.edge_type, &pending.source_id, pending.weight);
            mirror.metadata = pending.metadata.clone();
            mirror
        });

        self.store.apply_edge(
            &pending.source_id,
            &edge,
            mirror
                .as_ref()
                .map(|m| (pending.target_id.as_str(), m)),
            Some(pending_id),
        )?;
        Ok(edge)
    }

    /// Reject a pending edge; no memory is touched
    pub fn reject(&self, pending_id: &str) -> Result<()> {
        if !self.store.delete_pending_edge(pending_id)? {
            return Err(GraphError::NotFound(format!(
                "pending edge {}",
                pending_id
            )));
        }
        Ok(())
    }

    /// Approve a batch of pending edges, one at a time; failures do not stop
    /// the rest
    pub fn approve_batch(&self, pending_ids: &[String]) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            approved: vec![],
            failed: vec![],
        };
        for id in pending_ids {
            match self.approve(id) {
                Ok(_) => outcome.approved.push(id.clone()),
                Err(e) => outcome.failed.push(BatchFailure {
                    id: id.clone(),
                    error: e.to_string(),
                }),
            }
        }
        outcome
    }

    /// Create an edge directly, skipping the review queue. Both memories must
    /// exist; symmetric types mirror onto the target.
    pub fn create_direct(
        &self,
        source_id: &str,
        target_id: &str,
        edge_type: EdgeKind,
        weight: f64,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<GraphEdge> {
        if self.store.get_by_id(source_id)?.is_none() {
            return Err(GraphError::NotFound(format!("memory {}", source_id)));
        }
        if self.store.get_by_id(target_id)?.is_none() {
            return Err(GraphError::NotFound(format!("memory {}", target_id)));
        }

        let mut edge = GraphEdge::new(edge_type, target_id, weight);
        edge.metadata = metadata.clone();
        let mirror = edge_type.is_symmetric().then(|| {
            let mut mirror = GraphEdge::new(edge_type, source_id, weight);
            mirror.metadata = metadata;
            mirror
        });

        self.store.apply_edge(
            source_id,
            &edge,
            mirror.as_ref().map(|m| (target_id, m)),
            None,
        )?;
        Ok(edge)
    }

    /// Fetch one memory as a graph node
    pub fn get_node(&self, id: &str) -> Result<Memory> {
        let mut memory = self
            .store
            .get_by_id(id)?
            .ok_or_else(|| GraphError::NotFound(format!("memory {}", id)))?;
        memory.embedding.clear();
        Ok(memory)
    }

    /// Bounded breadth-first traversal from a memory
    pub fn traverse(&self, start_id: &str, options: &TraverseOptions) -> Result<Traversal> {
        let max_depth = options.max_depth.min(MAX_TRAVERSAL_DEPTH);
        let center = self
            .store
            .get_by_id(start_id)?
            .ok_or_else(|| GraphError::NotFound(format!("memory {}", start_id)))?;

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(center.id.clone());
        let mut connected: Vec<ConnectedNode> = Vec::new();
        let mut queue: VecDeque<(Memory, usize, Vec<String>)> = VecDeque::new();
        queue.push_back((center.clone(), 0, vec![center.id.clone()]));

        while let Some((node, depth, path)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }

            // Neighbors in stored-edge order; inbound sources follow
            let mut neighbors: Vec<(String, EdgeKind)> = Vec::new();
            if options.direction != Direction::Inbound {
                for edge in &node.edges {
                    if !self.follows(edge.edge_type, options) {
                        continue;
                    }
                    // Entity slugs and other non-memory targets are skipped
                    // during traversal
                    if edge.edge_type == EdgeKind::MentionsEntity {
                        continue;
                    }
                    neighbors.push((edge.target_id.clone(), edge.edge_type));
                }
            }
            if options.direction != Direction::Outbound {
                for source in self.store.find_edge_sources(&node.id)? {
                    for edge in source.edges.iter().filter(|e| e.target_id == node.id) {
                        if !self.follows(edge.edge_type, options) {
                            continue;
                        }
                        neighbors.push((source.id.clone(), edge.edge_type));
                    }
                }
            }

            for (neighbor_id, relationship) in neighbors {
                if visited.contains(&neighbor_id) {
                    continue;
                }
                // Non-memory targets (deleted ids, foreign references) are
                // skipped, not errors
                let Some(neighbor) = self.store.get_by_id(&neighbor_id)? else {
                    continue;
                };
                visited.insert(neighbor_id);

                let mut neighbor_path = path.clone();
                neighbor_path.push(neighbor.id.clone());
                connected.push(ConnectedNode {
                    memory: NodeSummary::from(&neighbor),
                    relationship,
                    depth: depth + 1,
                    path: neighbor_path.clone(),
                });
                queue.push_back((neighbor, depth + 1, neighbor_path));
            }
        }

        Ok(Traversal {
            center_node: NodeSummary::from(&center),
            connected,
        })
    }

    fn follows(&self, kind: EdgeKind, options: &TraverseOptions) -> bool {
        options.edge_types.is_empty() || options.edge_types.contains(&kind)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::mock_embedding;
    use tempfile::TempDir;

    fn service() -> (GraphService, Arc<MemoryStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new(Some(dir.path().join("test.db"))).unwrap());
        (GraphService::new(store.clone()), store, dir)
    }

    fn put(store: &MemoryStore, agent: &str, text: &str) -> String {
        let mut memory = Memory::new(agent, text);
        memory.embedding = mock_embedding(text);
        store.insert(memory).unwrap().id
    }

    #[test]
    fn test_approve_symmetric_edge_mirrors() {
        let (graph, store, _dir) = service();
        let a = put(&store, "agent1", "memory a");
        let b = put(&store, "agent1", "memory b");

        let pending = PendingEdge::new(&a, &b, EdgeKind::CoOccurs, 0.7, 0.9, "co-mention");
        graph.propose(&pending).unwrap();
        graph.approve(&pending.id).unwrap();

        let a_mem = store.get_by_id(&a).unwrap().unwrap();
        let b_mem = store.get_by_id(&b).unwrap().unwrap();
        assert_eq!(a_mem.edges.len(), 1);
        assert_eq!(b_mem.edges.len(), 1);
        assert_eq!(a_mem.edges[0].target_id, b);
        assert_eq!(b_mem.edges[0].target_id, a);
        assert_eq!(a_mem.edges[0].weight, b_mem.edges[0].weight);
        assert!(store.get_pending_edge(&pending.id).unwrap().is_none());
    }

    #[test]
    fn test_approve_directed_edge_does_not_mirror() {
        let (graph, store, _dir) = service();
        let a = put(&store, "agent1", "cause");
        let b = put(&store, "agent1", "effect");

        let pending = PendingEdge::new(&a, &b, EdgeKind::Causes, 0.8, 0.8, "causal");
        graph.propose(&pending).unwrap();
        graph.approve(&pending.id).unwrap();

        assert_eq!(store.get_by_id(&a).unwrap().unwrap().edges.len(), 1);
        assert!(store.get_by_id(&b).unwrap().unwrap().edges.is_empty());
    }

    #[test]
    fn test_reject_leaves_memories_unchanged() {
        let (graph, store, _dir) = service();
        let a = put(&store, "agent1", "memory a");
        let b = put(&store, "agent1", "memory b");

        let pending = PendingEdge::new(&a, &b, EdgeKind::CoOccurs, 0.7, 0.9, "co-mention");
        graph.propose(&pending).unwrap();
        graph.reject(&pending.id).unwrap();

        assert!(store.get_by_id(&a).unwrap().unwrap().edges.is_empty());
        assert!(store.get_by_id(&b).unwrap().unwrap().edges.is_empty());
        assert!(matches!(
            graph.reject(&pending.id),
            Err(GraphError::NotFound(_))
        ));
    }

    #[test]
    fn test_approve_missing_memory_fails() {
        let (graph, store, _dir) = service();
        let a = put(&store, "agent1", "memory a");
        let pending = PendingEdge::new(&a, "missing", EdgeKind::Supports, 0.5, 0.6, "r");
        graph.propose(&pending).unwrap();
        assert!(matches!(
            graph.approve(&pending.id),
            Err(GraphError::NotFound(_))
        ));
        // The proposal stays queued for operator cleanup
        assert!(store.get_pending_edge(&pending.id).unwrap().is_some());
    }

    #[test]
    fn test_approve_batch_mixed() {
        let (graph, store, _dir) = service();
        let a = put(&store, "agent1", "memory a");
        let b = put(&store, "agent1", "memory b");
        let good = PendingEdge::new(&a, &b, EdgeKind::Supports, 0.5, 0.8, "ok");
        graph.propose(&good).unwrap();

        let outcome =
            graph.approve_batch(&[good.id.clone(), "missing-pending".to_string()]);
        assert_eq!(outcome.approved, vec![good.id]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].id, "missing-pending");
    }

    #[test]
    fn test_create_direct_requires_both_memories() {
        let (graph, store, _dir) = service();
        let a = put(&store, "agent1", "memory a");
        assert!(matches!(
            graph.create_direct(&a, "missing", EdgeKind::Supports, 0.5, None),
            Err(GraphError::NotFound(_))
        ));

        let b = put(&store, "agent1", "memory b");
        graph
            .create_direct(&a, &b, EdgeKind::Contradicts, 0.9, None)
            .unwrap();
        // Symmetric type mirrors even without the queue
        assert_eq!(store.get_by_id(&b).unwrap().unwrap().edges.len(), 1);
    }

    /// A→B, A→D, B→C; outbound from A at depth 2 reaches B, C, D
    #[test]
    fn test_traverse_outbound() {
        let (graph, store, _dir) = service();
        let a = put(&store, "agent1", "a");
        let b = put(&store, "agent1", "b");
        let c = put(&store, "agent1", "c");
        let d = put(&store, "agent1", "d");
        graph.create_direct(&a, &b, EdgeKind::Precedes, 1.0, None).unwrap();
        graph.create_direct(&a, &d, EdgeKind::Supports, 1.0, None).unwrap();
        graph.create_direct(&b, &c, EdgeKind::Precedes, 1.0, None).unwrap();

        let traversal = graph
            .traverse(
                &a,
                &TraverseOptions {
                    direction: Direction::Outbound,
                    max_depth: 2,
                    edge_types: vec![],
                },
            )
            .unwrap();

        assert_eq!(traversal.center_node.id, a);
        let ids: HashSet<&str> = traversal.connected.iter().map(|n| n.memory.id.as_str()).collect();
        assert_eq!(ids, HashSet::from([b.as_str(), c.as_str(), d.as_str()]));

        let c_node = traversal.connected.iter().find(|n| n.memory.id == c).unwrap();
        assert_eq!(c_node.depth, 2);
        assert_eq!(c_node.path, vec![a.clone(), b.clone(), c.clone()]);
    }

    #[test]
    fn test_traverse_inbound() {
        let (graph, store, _dir) = service();
        let a = put(&store, "agent1", "a");
        let b = put(&store, "agent1", "b");
        let c = put(&store, "agent1", "c");
        graph.create_direct(&a, &b, EdgeKind::Precedes, 1.0, None).unwrap();
        graph.create_direct(&b, &c, EdgeKind::Precedes, 1.0, None).unwrap();

        let traversal = graph
            .traverse(
                &c,
                &TraverseOptions {
                    direction: Direction::Inbound,
                    max_depth: 2,
                    edge_types: vec![],
                },
            )
            .unwrap();
        let ids: HashSet<&str> = traversal.connected.iter().map(|n| n.memory.id.as_str()).collect();
        assert_eq!(ids, HashSet::from([a.as_str(), b.as_str()]));
    }

    #[test]
    fn test_traverse_depth_bound() {
        let (graph, store, _dir) = service();
        let a = put(&store, "agent1", "a");
        let b = put(&store, "agent1", "b");
        let c = put(&store, "agent1", "c");
        graph.create_direct(&a, &b, EdgeKind::Precedes, 1.0, None).unwrap();
        graph.create_direct(&b, &c, EdgeKind::Precedes, 1.0, None).unwrap();

        let traversal = graph
            .traverse(
                &a,
                &TraverseOptions {
                    direction: Direction::Outbound,
                    max_depth: 1,
                    edge_types: vec![],
                },
            )
            .unwrap();
        assert_eq!(traversal.connected.len(), 1);
        assert!(traversal.connected.iter().all(|n| n.depth <= 1));
    }

    #[test]
    fn test_traverse_edge_type_filter() {
        let (graph, store, _dir) = service();
        let a = put(&store, "agent1", "a");
        let b = put(&store, "agent1", "b");
        let c = put(&store, "agent1", "c");
        graph.create_direct(&a, &b, EdgeKind::Supports, 1.0, None).unwrap();
        graph.create_direct(&a, &c, EdgeKind::Causes, 1.0, None).unwrap();

        let traversal = graph
            .traverse(
                &a,
                &TraverseOptions {
                    direction: Direction::Outbound,
                    max_depth: 2,
                    edge_types: vec![EdgeKind::Causes],
                },
            )
            .unwrap();
        assert_eq!(traversal.connected.len(), 1);
        assert_eq!(traversal.connected[0].memory.id, c);
    }

    #[test]
    fn test_traverse_skips_entity_targets_and_cycles() {
        let (graph, store, _dir) = service();
        let a = put(&store, "agent1", "a");
        let b = put(&store, "agent1", "b");
        // Cycle a <-> b plus an entity edge
        graph.create_direct(&a, &b, EdgeKind::CoOccurs, 1.0, None).unwrap();
        let entity_edge = GraphEdge::new(EdgeKind::MentionsEntity, "postgres", 1.0);
        store.apply_edge(&a, &entity_edge, None, None).unwrap();

        let traversal = graph
            .traverse(
                &a,
                &TraverseOptions {
                    direction: Direction::Both,
                    max_depth: 5,
                    edge_types: vec![],
                },
            )
            .unwrap();
        // Only b; the cycle terminates and the entity slug is not a node
        assert_eq!(traversal.connected.len(), 1);
        assert_eq!(traversal.connected[0].memory.id, b);
    }
}
