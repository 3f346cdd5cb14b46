//! Vector search
//!
//! HNSW index over memory embeddings. Compiled in by the `vector-search`
//! feature; without it the recall engine always takes the in-memory cosine
//! fallback.

#[cfg(feature = "vector-search")]
mod vector;

#[cfg(feature = "vector-search")]
pub use vector::{VectorIndex, VectorIndexConfig, VectorSearchError, MEMORY_VECTOR_INDEX};
