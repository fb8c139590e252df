//! Document processing pipeline.
//!
//! Each document moves through a fixed stage sequence:
//! `Queued → BackingUp → Verifying → Extracting → Recalling → Deciding →
//! Relocating → Done`, with `Quarantined` as the failure terminal. Terminal
//! states are final; a quarantined document is never retried automatically.

pub mod backup;
pub mod decide;
pub mod extract;
pub mod parser;
pub mod relocate;
pub mod render;
pub mod runner;

use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use self::backup::BackupError;
use self::decide::DecideError;
use self::extract::ExtractError;
use self::relocate::RelocateError;

// ---------------------------------------------------------------------------
// Job model
// ---------------------------------------------------------------------------

/// Pipeline stage of one document job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    BackingUp,
    Verifying,
    Extracting,
    Recalling,
    Deciding,
    Relocating,
    Done,
    Quarantined,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::BackingUp => "backing_up",
            Self::Verifying => "verifying",
            Self::Extracting => "extracting",
            Self::Recalling => "recalling",
            Self::Deciding => "deciding",
            Self::Relocating => "relocating",
            Self::Done => "done",
            Self::Quarantined => "quarantined",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Quarantined)
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One document making its way through the pipeline.
#[derive(Debug, Clone)]
pub struct DocumentJob {
    pub id: Uuid,
    /// Where the document arrived in the inbox.
    pub source_path: PathBuf,
    /// Where the document currently lives (inbox, then `processing/`).
    pub current_path: PathBuf,
    pub original_name: String,
    pub stage: JobStage,
    /// ISO 8601 enqueue time.
    pub started_at: String,
}

impl DocumentJob {
    pub fn new(source_path: PathBuf) -> Self {
        let original_name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        Self {
            id: Uuid::new_v4(),
            current_path: source_path.clone(),
            source_path,
            original_name,
            stage: JobStage::Queued,
            started_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Why a job ended in quarantine.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Checksum mismatch or unreadable source/backup.
    #[error("Integrity failure: {0}")]
    Integrity(#[from] BackupError),

    /// Model memory or load failure that survived its one retry.
    #[error("Resource failure: {0}")]
    Resource(#[from] crate::arbiter::ArbiterError),

    /// Vision extraction failed (beyond the one OOM retry).
    #[error("Extraction failure: {0}")]
    Extraction(#[from] ExtractError),

    /// Reasoning-stage failure that is not absorbed by the fallback
    /// decision (e.g. the model service is unreachable).
    #[error("Decision failure: {0}")]
    Decision(#[from] DecideError),

    /// Embedding or context-memory failure during recall.
    #[error("Recall failure: {0}")]
    Memory(#[from] crate::memory::MemoryError),

    /// Archive placement failed.
    #[error("Relocation failure: {0}")]
    Relocation(#[from] RelocateError),

    /// Shutdown requested; the job was aborted at a stage boundary.
    #[error("Cancelled at stage {stage}")]
    Cancelled { stage: JobStage },
}

impl JobError {
    /// Short machine-readable tag used in status events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Integrity(_) => "integrity",
            Self::Resource(_) => "resource",
            Self::Extraction(_) => "extraction",
            Self::Decision(_) => "decision",
            Self::Memory(_) => "recall",
            Self::Relocation(_) => "relocation",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}
