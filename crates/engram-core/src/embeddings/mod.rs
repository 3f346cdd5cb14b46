//! Embedding generation and vector math
//!
//! One client, two modes:
//! - **Mock**: deterministic text-seeded vectors, no I/O. The default in
//!   tests and the fallback when no provider key is configured.
//! - **Live**: a remote embeddings provider over HTTP (30 s timeout).

mod client;

pub use client::{
    cosine_similarity, embedding_from_bytes, embedding_to_bytes, mock_embedding, EmbeddingClient,
    EmbeddingError, InputHint, UsageSignal, EMBEDDING_DIMENSIONS,
};
