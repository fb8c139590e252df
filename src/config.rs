//! Runtime configuration — immutable once constructed.
//!
//! **Design**: the daemon receives a fully-formed `AppConfig` at startup and
//! never mutates it. Parsing config files is deliberately out of scope here;
//! whatever launches the daemon owns that concern. `PathLayout::ensure()`
//! creates the working directory tree before any pipeline work starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

/// Application-level constants
pub const APP_NAME: &str = "docflow";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tracing filter when RUST_LOG is not set.
pub fn default_log_filter() -> String {
    "docflow=info".to_string()
}

/// Two observations with identical size+mtime at least this far apart
/// mark a file as stable.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// Interval for the periodic input-directory rescan.
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(10);

/// How many prior decisions to recall as precedent for a new document.
pub const DEFAULT_RECALL_K: usize = 3;

// ═══════════════════════════════════════════════════════════
// Directory layout
// ═══════════════════════════════════════════════════════════

/// Working directory tree of the daemon, all rooted under one base dir.
#[derive(Debug, Clone)]
pub struct PathLayout {
    /// Watched inbox — documents land here.
    pub input: PathBuf,
    /// Dated backups: `backup/<YYYY-MM-DD>/<name>`.
    pub backup: PathBuf,
    /// Staging area for in-flight documents (out of the watcher's sight).
    pub processing: PathBuf,
    /// Final archive: `output/<year>/<category>/<name>`.
    pub output: PathBuf,
    /// Documents that failed integrity or relocation checks.
    pub quarantine: PathBuf,
    /// Local model artifacts.
    pub models: PathBuf,
    /// Daemon log files.
    pub logs: PathBuf,
}

impl PathLayout {
    /// Build the standard layout under a single base directory.
    pub fn under(base: &Path) -> Self {
        Self {
            input: base.join("input"),
            backup: base.join("backup"),
            processing: base.join("processing"),
            output: base.join("output"),
            quarantine: base.join("quarantine"),
            models: base.join("models"),
            logs: base.join("logs"),
        }
    }

    /// Create every directory in the layout. Idempotent.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            &self.input,
            &self.backup,
            &self.processing,
            &self.output,
            &self.quarantine,
            &self.models,
            &self.logs,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Model roster
// ═══════════════════════════════════════════════════════════

/// Which family of work a model serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// Page-image → markdown extraction.
    Vision,
    /// Filing decisions from extracted text.
    Reasoning,
    /// Text → fingerprint vectors (CPU-resident, long-lived).
    Embedding,
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vision => write!(f, "vision"),
            Self::Reasoning => write!(f, "reasoning"),
            Self::Embedding => write!(f, "embedding"),
        }
    }
}

/// Identity and memory footprint of one model in the roster.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSpec {
    pub family: ModelFamily,
    /// Ollama model tag, e.g. `qwen2.5vl:7b`.
    pub id: String,
    /// Estimated resident footprint in bytes, used for budget accounting.
    pub footprint_bytes: u64,
}

impl ModelSpec {
    pub fn new(family: ModelFamily, id: &str, footprint_bytes: u64) -> Self {
        Self {
            family,
            id: id.to_string(),
            footprint_bytes,
        }
    }
}

/// One spec per family.
#[derive(Debug, Clone)]
pub struct ModelRoster {
    pub vision: ModelSpec,
    pub reasoning: ModelSpec,
    pub embedding: ModelSpec,
}

impl ModelRoster {
    pub fn spec(&self, family: ModelFamily) -> &ModelSpec {
        match family {
            ModelFamily::Vision => &self.vision,
            ModelFamily::Reasoning => &self.reasoning,
            ModelFamily::Embedding => &self.embedding,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// AppConfig
// ═══════════════════════════════════════════════════════════

/// Complete daemon configuration, supplied at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub paths: PathLayout,
    /// Lowercase extensions accepted by the ingestion queue (no dot).
    pub accepted_extensions: Vec<String>,
    /// Minimum gap between the two stability observations.
    pub debounce: Duration,
    /// Periodic input rescan interval.
    pub rescan_interval: Duration,
    /// Accelerator memory budget in bytes.
    pub memory_budget_bytes: u64,
    pub roster: ModelRoster,
    /// Category vocabulary offered to the reasoning model.
    pub categories: Vec<String>,
    /// How many prior decisions to recall per document.
    pub recall_k: usize,
    /// Ollama base URL.
    pub ollama_url: String,
}

impl AppConfig {
    /// Sensible defaults rooted under `base`, overridable field by field.
    pub fn with_base(base: &Path) -> Self {
        Self {
            paths: PathLayout::under(base),
            accepted_extensions: vec!["pdf".to_string()],
            debounce: DEFAULT_DEBOUNCE,
            rescan_interval: DEFAULT_RESCAN_INTERVAL,
            memory_budget_bytes: 8 * 1024 * 1024 * 1024,
            roster: ModelRoster {
                vision: ModelSpec::new(ModelFamily::Vision, "qwen2.5vl:7b", 6_500_000_000),
                reasoning: ModelSpec::new(ModelFamily::Reasoning, "qwen3:8b", 5_500_000_000),
                embedding: ModelSpec::new(ModelFamily::Embedding, "nomic-embed-text", 300_000_000),
            },
            categories: vec![
                "Insurance".to_string(),
                "Taxes".to_string(),
                "Medical".to_string(),
                "Contracts".to_string(),
                "Invoices".to_string(),
                "Correspondence".to_string(),
            ],
            recall_k: DEFAULT_RECALL_K,
            ollama_url: ollama_url_from_env(),
        }
    }

    /// Is `path` a candidate document by extension?
    pub fn accepts_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let lower = e.to_ascii_lowercase();
                self.accepted_extensions.iter().any(|a| *a == lower)
            })
            .unwrap_or(false)
    }
}

/// Ollama endpoint, overridable via OLLAMA_HOST.
pub fn ollama_url_from_env() -> String {
    std::env::var("OLLAMA_HOST")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            if v.starts_with("http://") || v.starts_with("https://") {
                v
            } else {
                format!("http://{v}")
            }
        })
        .unwrap_or_else(|| "http://localhost:11434".to_string())
}
