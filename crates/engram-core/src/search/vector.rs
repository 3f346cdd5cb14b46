//! HNSW Vector Index
//!
//! USearch-backed approximate nearest neighbor index over the 1024-dimension
//! embedding space, cosine metric. The index holds every agent's vectors;
//! callers over-fetch candidates and apply agent/project/tag pre-filters
//! against the store.

use std::collections::HashMap;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::embeddings::EMBEDDING_DIMENSIONS;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Logical index name exposed to operators
pub const MEMORY_VECTOR_INDEX: &str = "memory_vector_index";

/// HNSW connectivity parameter
pub const DEFAULT_CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
pub const DEFAULT_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector index error type
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum VectorSearchError {
    /// Failed to create the index
    #[error("Index creation failed: {0}")]
    IndexCreation(String),
    /// Failed to add a vector
    #[error("Failed to add vector: {0}")]
    IndexAdd(String),
    /// Failed to search
    #[error("Search failed: {0}")]
    IndexSearch(String),
    /// Dimension mismatch
    #[error("Invalid dimensions: expected {0}, got {1}")]
    InvalidDimensions(usize, usize),
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the vector index
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    pub dimensions: usize,
    pub connectivity: usize,
    pub expansion_add: usize,
    pub expansion_search: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            dimensions: EMBEDDING_DIMENSIONS,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
        }
    }
}

// ============================================================================
// VECTOR INDEX
// ============================================================================

/// HNSW index keyed by memory id
pub struct VectorIndex {
    index: Index,
    config: VectorIndexConfig,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

impl VectorIndex {
    /// Create an index with default configuration
    pub fn new() -> Result<Self, VectorSearchError> {
        Self::with_config(VectorIndexConfig::default())
    }

    /// Create an index with custom configuration
    pub fn with_config(config: VectorIndexConfig) -> Result<Self, VectorSearchError> {
        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        };
        let index =
            Index::new(&options).map_err(|e| VectorSearchError::IndexCreation(e.to_string()))?;
        Ok(Self {
            index,
            config,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        })
    }

    /// Number of vectors in the index
    pub fn len(&self) -> usize {
        self.index.size()
    }

    /// Whether the index holds no vectors
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add or replace a vector keyed by memory id
    pub fn add(&mut self, key: &str, vector: &[f32]) -> Result<(), VectorSearchError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions(
                self.config.dimensions,
                vector.len(),
            ));
        }

        if let Some(&existing) = self.key_to_id.get(key) {
            self.index
                .remove(existing)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            self.reserve(self.index.size() + 1)?;
            self.index
                .add(existing, vector)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            return Ok(());
        }

        let id = self.next_id;
        self.next_id += 1;
        self.reserve(self.index.size() + 1)?;
        self.index
            .add(id, vector)
            .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
        self.key_to_id.insert(key.to_string(), id);
        self.id_to_key.insert(id, key.to_string());
        Ok(())
    }

    /// Remove a vector. Returns `false` when the key is unknown.
    pub fn remove(&mut self, key: &str) -> Result<bool, VectorSearchError> {
        let Some(id) = self.key_to_id.remove(key) else {
            return Ok(false);
        };
        self.id_to_key.remove(&id);
        self.index
            .remove(id)
            .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
        Ok(true)
    }

    /// Nearest neighbors as `(memory id, cosine similarity)` pairs,
    /// best first
    pub fn search(
        &self,
        vector: &[f32],
        count: usize,
    ) -> Result<Vec<(String, f32)>, VectorSearchError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions(
                self.config.dimensions,
                vector.len(),
            ));
        }
        let matches = self
            .index
            .search(vector, count)
            .map_err(|e| VectorSearchError::IndexSearch(e.to_string()))?;

        Ok(matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter_map(|(key, distance)| {
                self.id_to_key
                    .get(key)
                    // USearch reports cosine distance; similarity = 1 - d
                    .map(|id| (id.clone(), 1.0 - distance))
            })
            .collect())
    }

    fn reserve(&self, capacity: usize) -> Result<(), VectorSearchError> {
        self.index.reserve(capacity).map_err(|e| {
            VectorSearchError::IndexCreation(format!("Failed to reserve capacity: {}", e))
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::mock_embedding;

    #[test]
    fn test_add_search_remove() {
        let mut index = VectorIndex::new().unwrap();
        assert!(index.is_empty());

        index.add("m-1", &mock_embedding("dark mode")).unwrap();
        index.add("m-2", &mock_embedding("light mode")).unwrap();
        assert_eq!(index.len(), 2);

        let hits = index.search(&mock_embedding("dark mode"), 2).unwrap();
        assert_eq!(hits[0].0, "m-1");
        assert!(hits[0].1 > 0.999);

        assert!(index.remove("m-1").unwrap());
        assert!(!index.remove("m-1").unwrap());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_add_replaces_existing_key() {
        let mut index = VectorIndex::new().unwrap();
        index.add("m-1", &mock_embedding("first")).unwrap();
        index.add("m-1", &mock_embedding("second")).unwrap();
        assert_eq!(index.len(), 1);

        let hits = index.search(&mock_embedding("second"), 1).unwrap();
        assert_eq!(hits[0].0, "m-1");
        assert!(hits[0].1 > 0.999);
    }

    #[test]
    fn test_dimension_checks() {
        let mut index = VectorIndex::new().unwrap();
        assert!(matches!(
            index.add("m-1", &[0.5; 8]),
            Err(VectorSearchError::InvalidDimensions(_, 8))
        ));
        assert!(matches!(
            index.search(&[0.5; 8], 1),
            Err(VectorSearchError::InvalidDimensions(_, 8))
        ));
    }
}
