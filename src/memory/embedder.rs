//! Embedding fingerprints for context memory recall.

use crate::ollama::{LlmClient, OllamaError};

/// Dimension of nomic-embed-text vectors.
pub const EMBEDDING_DIM: usize = 768;

/// Longer documents are truncated before embedding; the opening of a
/// document carries the letterhead, subject, and date that matter for
/// similarity.
const MAX_EMBED_CHARS: usize = 4000;

/// Text → fingerprint vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, OllamaError>;
    fn dimension(&self) -> usize;
}

/// Embedder backed by Ollama's embeddings endpoint.
pub struct OllamaEmbedder {
    client: std::sync::Arc<dyn LlmClient>,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(client: std::sync::Arc<dyn LlmClient>, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

impl Embedder for OllamaEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, OllamaError> {
        let truncated = truncate_chars(text, MAX_EMBED_CHARS);
        self.client.embed(&self.model, truncated)
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Truncate on a char boundary without allocating.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Deterministic embedder for tests — same text, same unit vector.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self {
            dimension: EMBEDDING_DIM,
        }
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder for MockEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, OllamaError> {
        Ok(deterministic_vector(text, self.dimension))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Hash-derived unit vector, stable across runs.
fn deterministic_vector(text: &str, dim: usize) -> Vec<f32> {
    let bytes = text.as_bytes();
    let mut vec = vec![0.0f32; dim];

    for (i, slot) in vec.iter_mut().enumerate() {
        let byte_idx = i % bytes.len().max(1);
        *slot = (bytes.get(byte_idx).copied().unwrap_or(0) as f32 + i as f32) / 255.0;
    }

    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in &mut vec {
            *val /= norm;
        }
    }
    vec
}
