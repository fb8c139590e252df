//! Pipeline orchestration — one document from inbox to archive.
//!
//! **Design**: the runner is a synchronous consumer of the ingest queue. Each
//! document walks the fixed stage sequence; every transition is announced on
//! the event bus, cancellation is checked at each stage boundary, and any
//! failure sends the document (wherever it currently lives) to quarantine
//! with its backup intact — except a cancellation before the backup stage,
//! which leaves the untouched file in the inbox. The context memory grows
//! only on `Done`.
//!
//! Model access is scoped tightly: the vision guard is held for extraction
//! only, the reasoning guard for the decision only, so the arbiter can swap
//! families between stages of consecutive jobs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::arbiter::{ModelArbiter, OllamaBackend};
use crate::config::{AppConfig, ModelFamily};
use crate::events::{EventBus, StatusEvent};
use crate::memory::embedder::{Embedder, OllamaEmbedder};
use crate::memory::{format_precedents, ContextMemory, MemoryEntry, MemoryError};
use crate::ollama::{LlmClient, OllamaClient};
use crate::pipeline::backup;
use crate::pipeline::decide::{Decision, DecisionEngine, DecisionOrigin};
use crate::pipeline::extract::{ExtractError, ExtractedText, OllamaVisionExtractor, VisionExtractor};
use crate::pipeline::relocate;
use crate::pipeline::render::{PdfiumRenderer, RenderError};
use crate::pipeline::{DocumentJob, JobError, JobStage};
use crate::watcher::IngestQueue;

/// Request timeout for inference calls; vision pages can take minutes.
const OLLAMA_TIMEOUT_SECS: u64 = 300;

/// Drives documents through the processing stages.
pub struct JobRunner {
    config: Arc<AppConfig>,
    arbiter: Arc<ModelArbiter>,
    extractor: Box<dyn VisionExtractor>,
    engine: DecisionEngine,
    embedder: Box<dyn Embedder>,
    memory: Arc<ContextMemory>,
    events: Arc<EventBus>,
    shutdown: Arc<AtomicBool>,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AppConfig>,
        arbiter: Arc<ModelArbiter>,
        extractor: Box<dyn VisionExtractor>,
        engine: DecisionEngine,
        embedder: Box<dyn Embedder>,
        memory: Arc<ContextMemory>,
        events: Arc<EventBus>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            arbiter,
            extractor,
            engine,
            embedder,
            memory,
            events,
            shutdown,
        }
    }

    /// Consume the ingest queue until it shuts down.
    ///
    /// Documents dequeued after the shutdown flag is set are skipped and
    /// left in the inbox; a later run picks them up again.
    pub fn run(&self, queue: &IngestQueue) {
        tracing::info!("Pipeline runner started");
        while let Some(event) = queue.dequeue() {
            if self.shutdown.load(Ordering::SeqCst) {
                queue.mark_complete(&event.path);
                continue;
            }
            let path = event.path.clone();
            self.run_one(event.path);
            queue.mark_complete(&path);
        }
        tracing::info!("Pipeline runner stopped");
    }

    /// Process one document to a terminal stage.
    pub fn run_one(&self, source_path: PathBuf) -> JobStage {
        let mut job = DocumentJob::new(source_path);
        tracing::info!(job_id = %job.id, file = %job.original_name, "Job started");
        self.events.publish(StatusEvent::now(
            job.id,
            JobStage::Queued.as_str(),
            job.original_name.clone(),
        ));

        match self.process(&mut job) {
            Ok(final_path) => {
                job.stage = JobStage::Done;
                tracing::info!(
                    job_id = %job.id,
                    to = %final_path.display(),
                    "Job done"
                );
                self.events.publish(StatusEvent::now(
                    job.id,
                    JobStage::Done.as_str(),
                    final_path.display().to_string(),
                ));
                JobStage::Done
            }
            Err(err) => {
                tracing::error!(
                    job_id = %job.id,
                    kind = err.kind(),
                    error = %err,
                    "Job failed"
                );
                self.quarantine(&mut job, &err);
                JobStage::Quarantined
            }
        }
    }

    // ── Stage machine ───────────────────────────────────────

    fn process(&self, job: &mut DocumentJob) -> Result<PathBuf, JobError> {
        self.check_cancelled(JobStage::BackingUp)?;
        self.transition(job, JobStage::BackingUp, job.original_name.clone());
        let backup_path = backup::back_up(&job.source_path, &self.config.paths.backup)?;

        self.check_cancelled(JobStage::Verifying)?;
        self.transition(job, JobStage::Verifying, backup_path.display().to_string());
        let verified = backup::verify(&job.source_path, &backup_path)?;
        tracing::debug!(job_id = %job.id, sha256 = %verified.sha256, "Backup verified");

        // Stage out of the inbox so the watcher never re-observes it.
        let staged = backup::unique_path(&self.config.paths.processing, &job.original_name);
        relocate::move_file(&job.source_path, &staged)?;
        job.current_path = staged.clone();

        self.check_cancelled(JobStage::Extracting)?;
        self.transition(job, JobStage::Extracting, job.original_name.clone());
        let extracted = self.extract_with_retry(&staged)?;

        self.check_cancelled(JobStage::Recalling)?;
        self.transition(
            job,
            JobStage::Recalling,
            format!("{} chars over {} pages", extracted.text.len(), extracted.page_count),
        );
        let fingerprint = self.fingerprint(&extracted)?;
        let recalled = self.memory.query(&fingerprint, self.config.recall_k)?;
        let precedents = format_precedents(&recalled);

        self.check_cancelled(JobStage::Deciding)?;
        self.transition(job, JobStage::Deciding, format!("{} precedents", recalled.len()));
        let decision = self.decide(&extracted, &precedents, &job.original_name)?;

        self.check_cancelled(JobStage::Relocating)?;
        let origin = match decision.origin {
            DecisionOrigin::Parsed => "parsed",
            DecisionOrigin::Fallback => "fallback",
        };
        self.transition(
            job,
            JobStage::Relocating,
            format!("{}/{} ({origin})", decision.category, decision.filename),
        );
        let final_path = relocate::place_in_archive(&staged, &decision, &self.config.paths.output)?;
        job.current_path = final_path.clone();

        self.remember(job, &decision, fingerprint, &final_path);
        Ok(final_path)
    }

    /// Extract with the vision guard held; accelerator OOM gets one retry
    /// after a reclaim pass.
    fn extract_with_retry(&self, staged: &Path) -> Result<ExtractedText, JobError> {
        let pdf_bytes = std::fs::read(staged).map_err(ExtractError::Read)?;

        let guard = self.arbiter.acquire(ModelFamily::Vision)?;
        match self.extractor.extract(&pdf_bytes, guard.model_id()) {
            Ok(extracted) => Ok(extracted),
            Err(ExtractError::OutOfMemory { page }) => {
                tracing::warn!(
                    page,
                    "Vision extraction hit accelerator OOM — reclaiming and retrying once"
                );
                drop(guard);
                self.arbiter.reclaim()?;
                let guard = self.arbiter.acquire(ModelFamily::Vision)?;
                Ok(self.extractor.extract(&pdf_bytes, guard.model_id())?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn fingerprint(&self, extracted: &ExtractedText) -> Result<Vec<f32>, JobError> {
        let _guard = self.arbiter.acquire(ModelFamily::Embedding)?;
        Ok(self
            .embedder
            .embed(&extracted.text)
            .map_err(MemoryError::Embedding)?)
    }

    fn decide(
        &self,
        extracted: &ExtractedText,
        precedents: &str,
        original_name: &str,
    ) -> Result<Decision, JobError> {
        let guard = self.arbiter.acquire(ModelFamily::Reasoning)?;
        Ok(self.engine.decide(
            guard.model_id(),
            &extracted.text,
            precedents,
            &self.config.categories,
            original_name,
        )?)
    }

    /// Record the completed decision. The document is already archived, so a
    /// memory write failure is logged rather than failing the job.
    fn remember(
        &self,
        job: &DocumentJob,
        decision: &Decision,
        fingerprint: Vec<f32>,
        final_path: &Path,
    ) {
        let filed_as = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| decision.filename.clone());
        let entry = MemoryEntry {
            id: job.id,
            fingerprint,
            source_name: job.original_name.clone(),
            summary: decision.summary.clone(),
            category: decision.category.clone(),
            filed_as,
            recorded_at: chrono::Utc::now().to_rfc3339(),
        };
        if let Err(e) = self.memory.append(entry) {
            tracing::error!(job_id = %job.id, error = %e, "Failed to record filing decision");
        }
    }

    fn quarantine(&self, job: &mut DocumentJob, err: &JobError) {
        // Cancelled before the backup stage means the file is still pristine
        // in the inbox with no backup; leave it for the next run.
        let pristine = matches!(
            err,
            JobError::Cancelled {
                stage: JobStage::BackingUp
            }
        );
        if !pristine && job.current_path.exists() {
            if let Err(qe) =
                relocate::move_to_quarantine(&job.current_path, &self.config.paths.quarantine)
            {
                tracing::error!(
                    job_id = %job.id,
                    path = %job.current_path.display(),
                    error = %qe,
                    "Failed to move document to quarantine"
                );
            }
        }
        job.stage = JobStage::Quarantined;
        self.events.publish(StatusEvent::now(
            job.id,
            JobStage::Quarantined.as_str(),
            format!("{}: {err}", err.kind()),
        ));
    }

    fn transition(&self, job: &mut DocumentJob, stage: JobStage, detail: impl Into<String>) {
        job.stage = stage;
        let detail = detail.into();
        tracing::debug!(job_id = %job.id, stage = %stage, detail = %detail, "Stage transition");
        self.events.publish(StatusEvent::now(job.id, stage.as_str(), detail));
    }

    fn check_cancelled(&self, stage: JobStage) -> Result<(), JobError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(JobError::Cancelled { stage });
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Production wiring
// ═══════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("PDF renderer unavailable: {0}")]
    Render(#[from] RenderError),

    #[error("Context memory unavailable: {0}")]
    Memory(#[from] MemoryError),
}

/// Assemble a runner against a live Ollama instance and the real renderer.
pub fn build_runner(
    config: Arc<AppConfig>,
    events: Arc<EventBus>,
    shutdown: Arc<AtomicBool>,
    budget_bytes: u64,
) -> Result<JobRunner, BuildError> {
    let client: Arc<dyn LlmClient> =
        Arc::new(OllamaClient::new(&config.ollama_url, OLLAMA_TIMEOUT_SECS));
    let backend = OllamaBackend::new(Box::new(OllamaClient::new(
        &config.ollama_url,
        OLLAMA_TIMEOUT_SECS,
    )));
    let arbiter = Arc::new(ModelArbiter::new(
        Box::new(backend),
        config.roster.clone(),
        budget_bytes,
    ));

    let renderer = PdfiumRenderer::new()?;
    let extractor = Box::new(OllamaVisionExtractor::new(
        Arc::clone(&client),
        Box::new(renderer),
    ));
    let engine = DecisionEngine::new(Arc::clone(&client));
    let embedder = Box::new(OllamaEmbedder::new(
        Arc::clone(&client),
        &config.roster.embedding.id,
    ));
    let memory = Arc::new(ContextMemory::open(
        &config.paths.logs.join("memory.jsonl"),
    )?);

    Ok(JobRunner::new(
        config, arbiter, extractor, engine, embedder, memory, events, shutdown,
    ))
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
