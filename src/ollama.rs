//! Ollama HTTP boundary — the single client for all model inference.
//!
//! **Design**:
//! - `OllamaClient` wraps blocking reqwest; all inference, embedding, and
//!   model-management calls go through it.
//! - `LlmClient` is the seam the pipeline depends on; tests substitute
//!   `MockLlmClient` with scripted responses and failure injection.
//! - `keep_alive: "0"` on a generate request unloads the model immediately
//!   after the call; the model arbiter uses this for explicit eviction.

use serde::{Deserialize, Serialize};

/// Errors from the Ollama boundary.
#[derive(Debug, thiserror::Error)]
pub enum OllamaError {
    #[error("Cannot reach Ollama at {0} — is it running?")]
    Connection(String),

    #[error("Ollama request timed out after {0}s")]
    Timeout(u64),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Ollama returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Failed to parse Ollama response: {0}")]
    ResponseParsing(String),

    #[error("Model ran out of memory: {0}")]
    OutOfMemory(String),
}

impl OllamaError {
    /// Does this error indicate accelerator memory exhaustion?
    ///
    /// Ollama reports OOM as a 500 with a recognizable body rather than a
    /// dedicated status code.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            Self::OutOfMemory(_) => true,
            Self::Server { body, .. } => err_body_is_oom(body),
            _ => false,
        }
    }
}

fn err_body_is_oom(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("out of memory")
        || lower.contains("cuda error")
        || lower.contains("insufficient memory")
}

// ═══════════════════════════════════════════════════════════
// Wire types
// ═══════════════════════════════════════════════════════════

/// Per-request knobs for /api/generate.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Base64-encoded images for vision models.
    pub images: Vec<String>,
    /// Ollama keep_alive (e.g. "5m", "0" to unload after the call).
    pub keep_alive: Option<String>,
    /// Context window override.
    pub num_ctx: Option<u32>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateModelOptions>,
}

#[derive(Serialize)]
struct GenerateModelOptions {
    num_ctx: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TaggedModel>,
}

#[derive(Deserialize)]
struct TaggedModel {
    name: String,
}

/// One entry from /api/ps — a model currently loaded by Ollama.
#[derive(Debug, Clone, Deserialize)]
pub struct RunningModel {
    pub name: String,
    /// Total resident size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Bytes resident on the accelerator (0 = fully on CPU).
    #[serde(default)]
    pub size_vram: u64,
}

#[derive(Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<RunningModel>,
}

// ═══════════════════════════════════════════════════════════
// LlmClient trait
// ═══════════════════════════════════════════════════════════

/// The inference operations the pipeline depends on.
pub trait LlmClient: Send + Sync {
    fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
        options: &GenerateOptions,
    ) -> Result<String, OllamaError>;

    fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, OllamaError>;

    fn list_models(&self) -> Result<Vec<String>, OllamaError>;

    /// Models currently resident in Ollama (from /api/ps).
    fn list_running(&self) -> Result<Vec<RunningModel>, OllamaError>;

    /// Ask Ollama to drop a model from memory now.
    fn unload(&self, model: &str) -> Result<(), OllamaError>;
}

// A shared client can back several collaborators at once.
impl<T: LlmClient + ?Sized> LlmClient for std::sync::Arc<T> {
    fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
        options: &GenerateOptions,
    ) -> Result<String, OllamaError> {
        (**self).generate(model, prompt, system, options)
    }

    fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, OllamaError> {
        (**self).embed(model, text)
    }

    fn list_models(&self) -> Result<Vec<String>, OllamaError> {
        (**self).list_models()
    }

    fn list_running(&self) -> Result<Vec<RunningModel>, OllamaError> {
        (**self).list_running()
    }

    fn unload(&self, model: &str) -> Result<(), OllamaError> {
        (**self).unload(model)
    }
}

// ═══════════════════════════════════════════════════════════
// OllamaClient
// ═══════════════════════════════════════════════════════════

/// Blocking HTTP client for a local Ollama instance.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
        }
    }

    /// Standard local instance with a 5-minute timeout (vision calls are slow).
    pub fn default_local() -> Self {
        Self::new("http://localhost:11434", 300)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_transport(&self, e: reqwest::Error) -> OllamaError {
        if e.is_connect() {
            OllamaError::Connection(self.base_url.clone())
        } else if e.is_timeout() {
            OllamaError::Timeout(self.timeout_secs)
        } else {
            OllamaError::HttpClient(e.to_string())
        }
    }

    fn check_status(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, OllamaError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        let err = OllamaError::Server {
            status: status.as_u16(),
            body,
        };
        match err {
            OllamaError::Server { body, .. } if err_body_is_oom(&body) => {
                Err(OllamaError::OutOfMemory(body))
            }
            other => Err(other),
        }
    }
}

impl LlmClient for OllamaClient {
    fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
        options: &GenerateOptions,
    ) -> Result<String, OllamaError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model,
            prompt,
            system,
            stream: false,
            images: options.images.clone(),
            keep_alive: options.keep_alive.clone(),
            options: options.num_ctx.map(|num_ctx| GenerateModelOptions { num_ctx }),
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| self.map_transport(e))?;
        let response = Self::check_status(response)?;

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| OllamaError::ResponseParsing(e.to_string()))?;
        Ok(parsed.response)
    }

    fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, OllamaError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let body = EmbeddingsRequest { model, prompt: text };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| self.map_transport(e))?;
        let response = Self::check_status(response)?;

        let parsed: EmbeddingsResponse = response
            .json()
            .map_err(|e| OllamaError::ResponseParsing(e.to_string()))?;
        Ok(parsed.embedding)
    }

    fn list_models(&self) -> Result<Vec<String>, OllamaError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| self.map_transport(e))?;
        let response = Self::check_status(response)?;

        let parsed: TagsResponse = response
            .json()
            .map_err(|e| OllamaError::ResponseParsing(e.to_string()))?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    fn list_running(&self) -> Result<Vec<RunningModel>, OllamaError> {
        let url = format!("{}/api/ps", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| self.map_transport(e))?;
        let response = Self::check_status(response)?;

        let parsed: PsResponse = response
            .json()
            .map_err(|e| OllamaError::ResponseParsing(e.to_string()))?;
        Ok(parsed.models)
    }

    fn unload(&self, model: &str) -> Result<(), OllamaError> {
        // An empty generate with keep_alive 0 makes Ollama release the model.
        let options = GenerateOptions {
            keep_alive: Some("0".to_string()),
            ..Default::default()
        };
        self.generate(model, "", "", &options)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// MockLlmClient
// ═══════════════════════════════════════════════════════════

/// Scriptable client for tests: queued responses, failure injection, and a
/// log of every request made.
pub struct MockLlmClient {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<String, OllamaError>>>,
    fallback_response: String,
    embedding_dim: usize,
    running: Vec<RunningModel>,
    pub requests: std::sync::Mutex<Vec<MockRequest>>,
}

/// Record of one call made against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRequest {
    Generate { model: String, image_count: usize },
    Embed { model: String },
    Unload { model: String },
}

impl MockLlmClient {
    pub fn new(fallback_response: &str) -> Self {
        Self {
            responses: std::sync::Mutex::new(std::collections::VecDeque::new()),
            fallback_response: fallback_response.to_string(),
            embedding_dim: 768,
            running: Vec::new(),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Queue a one-shot response (consumed before the fallback is used).
    pub fn push_response(self, response: Result<String, OllamaError>) -> Self {
        self.responses.lock().unwrap().push_back(response);
        self
    }

    pub fn with_running(mut self, running: Vec<RunningModel>) -> Self {
        self.running = running;
        self
    }

    pub fn generate_calls(&self) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| matches!(r, MockRequest::Generate { .. }))
            .count()
    }
}

impl LlmClient for MockLlmClient {
    fn generate(
        &self,
        model: &str,
        _prompt: &str,
        _system: &str,
        options: &GenerateOptions,
    ) -> Result<String, OllamaError> {
        self.requests.lock().unwrap().push(MockRequest::Generate {
            model: model.to_string(),
            image_count: options.images.len(),
        });
        if let Some(scripted) = self.responses.lock().unwrap().pop_front() {
            return scripted;
        }
        Ok(self.fallback_response.clone())
    }

    fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, OllamaError> {
        self.requests.lock().unwrap().push(MockRequest::Embed {
            model: model.to_string(),
        });
        // Deterministic per-text vector so recall tests are stable.
        let mut v = vec![0.0f32; self.embedding_dim];
        for (i, slot) in v.iter_mut().enumerate() {
            let b = text.as_bytes().get(i % text.len().max(1)).copied().unwrap_or(0);
            *slot = (b as f32 + i as f32) / 255.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for val in &mut v {
                *val /= norm;
            }
        }
        Ok(v)
    }

    fn list_models(&self) -> Result<Vec<String>, OllamaError> {
        Ok(vec!["qwen2.5vl:7b".into(), "qwen3:8b".into(), "nomic-embed-text".into()])
    }

    fn list_running(&self) -> Result<Vec<RunningModel>, OllamaError> {
        Ok(self.running.clone())
    }

    fn unload(&self, model: &str) -> Result<(), OllamaError> {
        self.requests.lock().unwrap().push(MockRequest::Unload {
            model: model.to_string(),
        });
        Ok(())
    }
}
