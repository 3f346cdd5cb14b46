//! Embedding client
//!
//! Produces 1024-dimension L2-normalized vectors for memory text and recall
//! queries. Every call emits a [`UsageSignal`] to registered listeners so the
//! usage tracker can attribute token spend to the operation that caused it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Embedding vector dimensions
pub const EMBEDDING_DIMENSIONS: usize = 1024;

/// Live-mode request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Models tried manually by operators when the provider rejects the
/// configured model with 403
const FALLBACK_MODELS: &[&str] = &["voyage-4-lite", "voyage-3-lite"];

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding error type
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    /// Vector lengths differ
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    /// Empty or otherwise unusable input
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Transport-level failure reaching the provider
    #[error("embedding request failed: {0}")]
    Http(String),
    /// Provider returned a non-success status
    #[error("embedding provider returned {status}: {message}")]
    Provider { status: u16, message: String },
    /// Live mode requested without an endpoint/key
    #[error("embedding client not configured: {0}")]
    NotConfigured(String),
}

// ============================================================================
// INPUT HINT
// ============================================================================

/// Provider-side hint distinguishing stored documents from search queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputHint {
    Document,
    Query,
}

impl InputHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputHint::Document => "document",
            InputHint::Query => "query",
        }
    }
}

// ============================================================================
// USAGE SIGNAL
// ============================================================================

/// Emitted after every embedding call, mock or live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSignal {
    /// Tokens consumed (provider-reported in live mode, estimated in mock)
    pub total_tokens: u64,
    /// Model that produced the vectors
    pub model: String,
    /// Number of input texts in the call
    pub input_texts: usize,
    /// Hint passed with the call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_type: Option<InputHint>,
    /// Whether the call was served by the mock
    pub is_mock: bool,
}

type UsageListener = Arc<dyn Fn(&UsageSignal) + Send + Sync>;

// ============================================================================
// WIRE TYPES (live mode)
// ============================================================================

#[derive(Serialize)]
struct EmbedRequest<'a> {
    input: &'a [String],
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_type: Option<&'static str>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedItem>,
    #[serde(default)]
    usage: EmbedUsage,
}

#[derive(Deserialize)]
struct EmbedItem {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize, Default)]
struct EmbedUsage {
    #[serde(default)]
    total_tokens: u64,
}

// ============================================================================
// EMBEDDING CLIENT
// ============================================================================

enum Mode {
    Mock,
    Live {
        endpoint: String,
        api_key: String,
        http: reqwest::blocking::Client,
    },
}

/// Client for generating memory and query embeddings
///
/// Shared read-only across workers; all methods take `&self`.
pub struct EmbeddingClient {
    mode: Mode,
    model: String,
    provider: String,
    listeners: Mutex<Vec<UsageListener>>,
}

impl EmbeddingClient {
    /// Create a mock client. Never performs network I/O.
    pub fn mock() -> Self {
        Self {
            mode: Mode::Mock,
            model: "mock-1024".to_string(),
            provider: "mock".to_string(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Create a live client for the given provider endpoint
    pub fn live(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model_override: Option<String>,
    ) -> Result<Self, EmbeddingError> {
        let endpoint = endpoint.into();
        let api_key = api_key.into();
        if endpoint.is_empty() {
            return Err(EmbeddingError::NotConfigured("empty endpoint".to_string()));
        }
        if api_key.is_empty() {
            return Err(EmbeddingError::NotConfigured("empty api key".to_string()));
        }

        let model = model_override.unwrap_or_else(|| Self::model_for_endpoint(&endpoint).to_string());
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EmbeddingError::Http(e.to_string()))?;

        Ok(Self {
            provider: Self::provider_for_endpoint(&endpoint).to_string(),
            mode: Mode::Live {
                endpoint,
                api_key,
                http,
            },
            model,
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Build a client from the process environment.
    ///
    /// `ENGRAM_EMBEDDINGS=mock` forces the mock; otherwise live mode is used
    /// when both `ENGRAM_EMBEDDINGS_ENDPOINT` and `ENGRAM_EMBEDDINGS_API_KEY`
    /// are set, falling back to mock when they are not.
    pub fn from_env() -> Self {
        if std::env::var("ENGRAM_EMBEDDINGS").as_deref() == Ok("mock") {
            return Self::mock();
        }
        let endpoint = std::env::var("ENGRAM_EMBEDDINGS_ENDPOINT").ok();
        let api_key = std::env::var("ENGRAM_EMBEDDINGS_API_KEY").ok();
        let model = std::env::var("ENGRAM_EMBEDDINGS_MODEL").ok();
        match (endpoint, api_key) {
            (Some(endpoint), Some(api_key)) => {
                Self::live(endpoint, api_key, model).unwrap_or_else(|e| {
                    tracing::warn!("Live embedding config rejected ({}), using mock", e);
                    Self::mock()
                })
            }
            _ => Self::mock(),
        }
    }

    /// Default model for a provider endpoint
    pub fn model_for_endpoint(endpoint: &str) -> &'static str {
        if endpoint.contains("ai.mongodb.com") {
            "voyage-4-lite"
        } else {
            // api.voyageai.com and unknown endpoints
            "voyage-4"
        }
    }

    fn provider_for_endpoint(endpoint: &str) -> &'static str {
        if endpoint.contains("ai.mongodb.com") {
            "mongodb"
        } else {
            "voyageai"
        }
    }

    /// Whether the client is in mock mode
    pub fn is_mock(&self) -> bool {
        matches!(self.mode, Mode::Mock)
    }

    /// Model name used for embedding calls
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Provider label used in usage events
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Register a usage listener. Listeners run synchronously on the calling
    /// thread after each embed call and can never fail the call.
    pub fn on_usage(&self, listener: impl Fn(&UsageSignal) + Send + Sync + 'static) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Arc::new(listener));
        }
    }

    fn emit_usage(&self, signal: UsageSignal) {
        let listeners = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(&signal);
        }
    }

    /// Embed a batch of texts. Output order always matches input order.
    pub fn embed(
        &self,
        texts: &[String],
        hint: Option<InputHint>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if texts.iter().any(|t| t.is_empty()) {
            return Err(EmbeddingError::InvalidInput(
                "texts must be non-empty".to_string(),
            ));
        }

        let (vectors, total_tokens) = match &self.mode {
            Mode::Mock => {
                let vectors: Vec<Vec<f32>> = texts.iter().map(|t| mock_embedding(t)).collect();
                // ~4 chars per token, same estimate the provider billing uses
                let tokens: u64 = texts.iter().map(|t| (t.len() as u64).div_ceil(4)).sum();
                (vectors, tokens)
            }
            Mode::Live {
                endpoint,
                api_key,
                http,
            } => self.embed_live(endpoint, api_key, http, texts, hint)?,
        };

        self.emit_usage(UsageSignal {
            total_tokens,
            model: self.model.clone(),
            input_texts: texts.len(),
            input_type: hint,
            is_mock: self.is_mock(),
        });

        Ok(vectors)
    }

    fn embed_live(
        &self,
        endpoint: &str,
        api_key: &str,
        http: &reqwest::blocking::Client,
        texts: &[String],
        hint: Option<InputHint>,
    ) -> Result<(Vec<Vec<f32>>, u64), EmbeddingError> {
        let url = format!("{}/v1/embeddings", endpoint.trim_end_matches('/'));
        let request = EmbedRequest {
            input: texts,
            model: &self.model,
            input_type: hint.map(|h| h.as_str()),
        };

        let response = http
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .map_err(|e| EmbeddingError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            if status.as_u16() == 403 {
                tracing::warn!(
                    model = %self.model,
                    "Provider rejected model with 403; models available on restricted keys: {:?}",
                    FALLBACK_MODELS
                );
            }
            return Err(EmbeddingError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let body: EmbedResponse = response
            .json()
            .map_err(|e| EmbeddingError::Http(format!("bad response body: {}", e)))?;

        // Providers may return items out of order; restore input order by index.
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        for item in body.data {
            if item.embedding.len() != EMBEDDING_DIMENSIONS {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: EMBEDDING_DIMENSIONS,
                    got: item.embedding.len(),
                });
            }
            if item.index < vectors.len() {
                vectors[item.index] = Some(item.embedding);
            }
        }
        let vectors: Vec<Vec<f32>> = vectors
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                v.ok_or_else(|| {
                    EmbeddingError::Http(format!("provider response missing vector {}", i))
                })
            })
            .collect::<Result<_, _>>()?;

        Ok((vectors, body.usage.total_tokens))
    }

    /// Embed a single text
    pub fn embed_one(
        &self,
        text: &str,
        hint: Option<InputHint>,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string()), hint)?;
        vectors.pop().ok_or_else(|| {
            EmbeddingError::Http("provider returned no vectors".to_string())
        })
    }
}

// ============================================================================
// MOCK EMBEDDINGS
// ============================================================================

/// Seed a text the way a JS string hash does: `h = 31*h + code`, wrapping
/// at 32 bits. Kept byte-compatible so fixtures stay deterministic across
/// implementations.
fn text_seed(text: &str) -> i32 {
    let mut hash: i32 = 0;
    for c in text.chars() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(c as i32);
    }
    hash
}

/// The seeded pseudo-random sequence: `frac(sin(seed + i) * 10000)` mapped
/// to [-1, 1]
fn seeded_sequence(seed: f64) -> Vec<f32> {
    (0..EMBEDDING_DIMENSIONS)
        .map(|i| {
            let x = (seed + i as f64).sin() * 10000.0;
            let frac = x - x.floor();
            (frac * 2.0 - 1.0) as f32
        })
        .collect()
}

/// Deterministic mock embedding.
///
/// Each lowercased token hashes into a seed for the sin sequence; the text
/// vector is the L2-normalized sum of its token vectors. Composing per token
/// keeps the mock useful for retrieval tests: texts sharing vocabulary score
/// high, reordered phrases score 1, and unrelated texts stay near 0.
pub fn mock_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIMENSIONS];
    let mut tokens = 0usize;
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        tokens += 1;
        let component = seeded_sequence(text_seed(token) as f64);
        for (v, c) in vector.iter_mut().zip(component) {
            *v += c;
        }
    }
    if tokens == 0 {
        vector = seeded_sequence(text_seed(text) as f64);
    }
    l2_normalize(&mut vector);
    vector
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

// ============================================================================
// VECTOR MATH & ENCODING
// ============================================================================

/// Cosine similarity between two vectors.
///
/// Fails when lengths differ; returns 0 when either norm is 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, EmbeddingError> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }

    let mut dot_product = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 {
        Ok(dot_product / denominator)
    } else {
        Ok(0.0)
    }
}

/// Encode a vector as little-endian f32 bytes for storage
pub fn embedding_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a vector from little-endian f32 bytes
pub fn embedding_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_mock_embedding_deterministic() {
        let a = mock_embedding("I prefer dark mode");
        let b = mock_embedding("I prefer dark mode");
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIMENSIONS);
    }

    #[test]
    fn test_mock_embedding_normalized() {
        let v = mock_embedding("anything at all");
        let norm = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "norm was {}", norm);
    }

    #[test]
    fn test_mock_embedding_distinct_texts() {
        let a = mock_embedding("tabs");
        let b = mock_embedding("completely unrelated topic");
        let sim = cosine_similarity(&a, &b).unwrap();
        assert!(sim < 0.5);
    }

    #[test]
    fn test_mock_embedding_shared_vocabulary_scores_high() {
        let a = mock_embedding("I prefer tabs over spaces");
        let b = mock_embedding("I prefer spaces over tabs");
        // Same token set, different order: identical mock vectors
        let sim = cosine_similarity(&a, &b).unwrap();
        assert!(sim > 0.999);

        let c = mock_embedding("dark mode");
        let d = mock_embedding("I prefer dark mode");
        let partial = cosine_similarity(&c, &d).unwrap();
        assert!(partial > 0.5 && partial < 0.95);
    }

    #[test]
    fn test_cosine_identical() {
        let v = mock_embedding("same");
        let sim = cosine_similarity(&v, &v).unwrap();
        assert!((sim - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_dimension_mismatch() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!(matches!(
            cosine_similarity(&a, &b),
            Err(EmbeddingError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_cosine_zero_norm() {
        let a = vec![0.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn test_embed_emits_usage_signal() {
        let client = EmbeddingClient::mock();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        client.on_usage(move |signal| {
            assert!(signal.is_mock);
            assert_eq!(signal.input_texts, 2);
            assert!(signal.total_tokens > 0);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let texts = vec!["first text".to_string(), "second text".to_string()];
        let vectors = client.embed(&texts, Some(InputHint::Document)).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_embed_rejects_empty_text() {
        let client = EmbeddingClient::mock();
        let texts = vec!["ok".to_string(), String::new()];
        assert!(matches!(
            client.embed(&texts, None),
            Err(EmbeddingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_model_for_endpoint() {
        assert_eq!(
            EmbeddingClient::model_for_endpoint("https://api.voyageai.com"),
            "voyage-4"
        );
        assert_eq!(
            EmbeddingClient::model_for_endpoint("https://ai.mongodb.com"),
            "voyage-4-lite"
        );
    }

    #[test]
    fn test_embedding_bytes_roundtrip() {
        let original = mock_embedding("roundtrip");
        let bytes = embedding_to_bytes(&original);
        let restored = embedding_from_bytes(&bytes).unwrap();
        assert_eq!(original, restored);
        assert!(embedding_from_bytes(&bytes[..5]).is_none());
    }
}
