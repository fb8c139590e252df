//! Model lifecycle arbiter — exclusive, budgeted access to inference models.
//!
//! **Why this exists**: the vision and reasoning models each fill most of the
//! accelerator on modest hardware. Loading one while the other is resident
//! thrashes or OOMs, so residency is swap-managed: at most one of the two is
//! loaded at any instant, and switching families always unloads the old model
//! before loading the new one. The embedding model is small and CPU-resident;
//! it loads once and stays out of the swap policy.
//!
//! **Design**:
//! - `acquire(family)` blocks while another caller holds a guard, evicts the
//!   other family's resident if needed, loads on a cold start, and returns an
//!   RAII `ModelGuard`. Dropping the guard releases the family but leaves the
//!   model warm for the next acquire.
//! - `MemoryBudget` is mutated only under the arbiter's lock; every load and
//!   evict is logged with its reason and memory delta.
//! - `ModelBackend` is the seam to Ollama; tests use `MockBackend` to record
//!   the exact load/unload sequence and to inject failures.

use std::sync::{Condvar, Mutex};

use serde::Serialize;

use crate::config::{ModelFamily, ModelRoster, ModelSpec};
use crate::ollama::{GenerateOptions, LlmClient, OllamaError};

/// Context window used when a load is retried in degraded mode.
const DEGRADED_NUM_CTX: u32 = 2048;

/// How long Ollama keeps a warmed model resident between calls.
const KEEP_ALIVE: &str = "10m";

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ArbiterError {
    /// The model alone exceeds the budget. No eviction can fix this.
    #[error("Model {model} needs {needed_bytes} bytes but the budget is {budget_bytes} bytes")]
    InsufficientMemory {
        model: String,
        needed_bytes: u64,
        budget_bytes: u64,
    },

    /// Load failed twice (normal, then degraded).
    #[error("Failed to load model {model}: {source}")]
    LoadFailed {
        model: String,
        #[source]
        source: OllamaError,
    },

    #[error("Internal lock error")]
    LockPoisoned,
}

// ═══════════════════════════════════════════════════════════
// Memory budget
// ═══════════════════════════════════════════════════════════

/// Accelerator memory accounting, owned by the arbiter.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryBudget {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl MemoryBudget {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            used_bytes: 0,
        }
    }

    pub fn available_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

// ═══════════════════════════════════════════════════════════
// Backend seam
// ═══════════════════════════════════════════════════════════

/// Loading and unloading of actual model weights.
pub trait ModelBackend: Send + Sync {
    /// Make the model resident. `degraded` requests a reduced-memory load.
    fn load(&self, spec: &ModelSpec, degraded: bool) -> Result<(), OllamaError>;

    /// Drop the model from memory.
    fn unload(&self, spec: &ModelSpec) -> Result<(), OllamaError>;
}

/// Ollama-backed model loading.
///
/// A load is a warm-up generate with a keep-alive; an unload is the
/// keep-alive-zero call that makes Ollama release the weights.
pub struct OllamaBackend {
    client: Box<dyn LlmClient>,
}

impl OllamaBackend {
    pub fn new(client: Box<dyn LlmClient>) -> Self {
        Self { client }
    }
}

impl ModelBackend for OllamaBackend {
    fn load(&self, spec: &ModelSpec, degraded: bool) -> Result<(), OllamaError> {
        // Embed-only models reject /api/generate; their warm-up must go
        // through the embeddings endpoint.
        if spec.family == ModelFamily::Embedding {
            self.client.embed(&spec.id, "ping")?;
            return Ok(());
        }

        let options = GenerateOptions {
            keep_alive: Some(KEEP_ALIVE.to_string()),
            num_ctx: degraded.then_some(DEGRADED_NUM_CTX),
            ..Default::default()
        };
        // Empty prompt: loads the weights without producing output.
        self.client.generate(&spec.id, "", "", &options)?;
        Ok(())
    }

    fn unload(&self, spec: &ModelSpec) -> Result<(), OllamaError> {
        self.client.unload(&spec.id)
    }
}

// ═══════════════════════════════════════════════════════════
// Arbiter
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Resident {
    family: ModelFamily,
    footprint_bytes: u64,
    degraded: bool,
}

#[derive(Debug)]
struct ArbiterState {
    budget: MemoryBudget,
    /// The swap-managed resident (vision or reasoning), if any.
    resident: Option<Resident>,
    /// Family currently held by a guard (vision or reasoning).
    in_use: Option<ModelFamily>,
    embedding_loaded: bool,
    embedding_in_use: bool,
}

/// Serialized view of the arbiter for observability.
#[derive(Debug, Clone, Serialize)]
pub struct ArbiterSnapshot {
    pub budget: MemoryBudget,
    pub resident: Option<ModelFamily>,
    pub in_use: Option<ModelFamily>,
    pub embedding_loaded: bool,
}

pub struct ModelArbiter {
    state: Mutex<ArbiterState>,
    cond: Condvar,
    backend: Box<dyn ModelBackend>,
    roster: ModelRoster,
}

impl ModelArbiter {
    pub fn new(backend: Box<dyn ModelBackend>, roster: ModelRoster, budget_bytes: u64) -> Self {
        Self {
            state: Mutex::new(ArbiterState {
                budget: MemoryBudget::new(budget_bytes),
                resident: None,
                in_use: None,
                embedding_loaded: false,
                embedding_in_use: false,
            }),
            cond: Condvar::new(),
            backend,
            roster,
        }
    }

    /// Acquire exclusive access to a model family. Blocks until available.
    ///
    /// For vision/reasoning this enforces the swap policy: the other
    /// family's resident is evicted before this family is loaded, and the
    /// two footprints never overlap. The embedding family loads once and
    /// bypasses the swap policy entirely.
    pub fn acquire(&self, family: ModelFamily) -> Result<ModelGuard<'_>, ArbiterError> {
        match family {
            ModelFamily::Embedding => self.acquire_embedding(),
            _ => self.acquire_swapped(family),
        }
    }

    /// Evict the idle resident so a retry starts from a clean slate.
    ///
    /// Used by the OOM recovery path: drop the guard, reclaim, re-acquire.
    /// A resident still held by a guard is left alone.
    pub fn reclaim(&self) -> Result<(), ArbiterError> {
        let mut state = self.state.lock().map_err(|_| ArbiterError::LockPoisoned)?;
        if state.in_use.is_some() {
            tracing::debug!("Reclaim skipped — a model guard is still held");
            return Ok(());
        }
        if let Some(resident) = state.resident.take() {
            self.evict_locked(&mut state, resident, "memory reclaim");
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Result<ArbiterSnapshot, ArbiterError> {
        let state = self.state.lock().map_err(|_| ArbiterError::LockPoisoned)?;
        Ok(ArbiterSnapshot {
            budget: state.budget.clone(),
            resident: state.resident.as_ref().map(|r| r.family),
            in_use: state.in_use,
            embedding_loaded: state.embedding_loaded,
        })
    }

    // ── Internal ────────────────────────────────────────────

    fn acquire_swapped(&self, family: ModelFamily) -> Result<ModelGuard<'_>, ArbiterError> {
        let spec = self.roster.spec(family).clone();

        let mut state = self.state.lock().map_err(|_| ArbiterError::LockPoisoned)?;
        while state.in_use.is_some() {
            state = self
                .cond
                .wait(state)
                .map_err(|_| ArbiterError::LockPoisoned)?;
        }

        let warm = state
            .resident
            .as_ref()
            .filter(|r| r.family == family)
            .map(|r| r.degraded);

        let degraded = match warm {
            Some(degraded) => {
                // Warm hit — the model is already resident.
                tracing::debug!(model = %spec.id, family = %family, "Model already resident");
                degraded
            }
            None => {
                if let Some(old) = state.resident.take() {
                    self.evict_locked(&mut state, old, "family swap");
                }
                self.load_locked(&mut state, &spec)?
            }
        };

        state.in_use = Some(family);
        Ok(ModelGuard {
            arbiter: self,
            family,
            model_id: spec.id,
            degraded,
        })
    }

    fn acquire_embedding(&self) -> Result<ModelGuard<'_>, ArbiterError> {
        let spec = self.roster.spec(ModelFamily::Embedding).clone();

        let mut state = self.state.lock().map_err(|_| ArbiterError::LockPoisoned)?;
        while state.embedding_in_use {
            state = self
                .cond
                .wait(state)
                .map_err(|_| ArbiterError::LockPoisoned)?;
        }

        if !state.embedding_loaded {
            // CPU-resident: loads once, never evicted, not budget-accounted.
            self.backend.load(&spec, false).map_err(|source| {
                ArbiterError::LoadFailed {
                    model: spec.id.clone(),
                    source,
                }
            })?;
            state.embedding_loaded = true;
            tracing::info!(model = %spec.id, family = %ModelFamily::Embedding, "Embedding model loaded (long-lived)");
        }

        state.embedding_in_use = true;
        Ok(ModelGuard {
            arbiter: self,
            family: ModelFamily::Embedding,
            model_id: spec.id,
            degraded: false,
        })
    }

    /// Load `spec` into the (empty) accelerator slot. Returns whether the
    /// load ended up degraded. Caller must hold the state lock with no
    /// swap-managed resident present.
    fn load_locked(&self, state: &mut ArbiterState, spec: &ModelSpec) -> Result<bool, ArbiterError> {
        if spec.footprint_bytes > state.budget.total_bytes {
            return Err(ArbiterError::InsufficientMemory {
                model: spec.id.clone(),
                needed_bytes: spec.footprint_bytes,
                budget_bytes: state.budget.total_bytes,
            });
        }

        let degraded = match self.backend.load(spec, false) {
            Ok(()) => false,
            Err(first) => {
                tracing::warn!(
                    model = %spec.id,
                    error = %first,
                    "Model load failed — retrying in degraded mode"
                );
                self.backend
                    .load(spec, true)
                    .map_err(|source| ArbiterError::LoadFailed {
                        model: spec.id.clone(),
                        source,
                    })?;
                true
            }
        };

        state.budget.used_bytes += spec.footprint_bytes;
        state.resident = Some(Resident {
            family: spec.family,
            footprint_bytes: spec.footprint_bytes,
            degraded,
        });
        tracing::info!(
            model = %spec.id,
            family = %spec.family,
            degraded,
            delta_mb = spec.footprint_bytes / 1_000_000,
            used_mb = state.budget.used_bytes / 1_000_000,
            total_mb = state.budget.total_bytes / 1_000_000,
            "Model loaded"
        );
        Ok(degraded)
    }

    /// Unload `resident` and release its budget share. Caller must hold the
    /// state lock and must already have cleared `state.resident`.
    fn evict_locked(&self, state: &mut ArbiterState, resident: Resident, reason: &str) {
        let spec = self.roster.spec(resident.family);
        if let Err(e) = self.backend.unload(spec) {
            // The budget is released regardless; Ollama drops idle models
            // on its own if the explicit unload did not reach it.
            tracing::warn!(model = %spec.id, error = %e, "Model unload request failed");
        }
        state.budget.used_bytes = state
            .budget
            .used_bytes
            .saturating_sub(resident.footprint_bytes);
        tracing::info!(
            model = %spec.id,
            family = %resident.family,
            reason,
            delta_mb = resident.footprint_bytes / 1_000_000,
            used_mb = state.budget.used_bytes / 1_000_000,
            total_mb = state.budget.total_bytes / 1_000_000,
            "Model evicted"
        );
    }

    fn release(&self, family: ModelFamily) {
        if let Ok(mut state) = self.state.lock() {
            match family {
                ModelFamily::Embedding => state.embedding_in_use = false,
                _ => state.in_use = None,
            }
        }
        self.cond.notify_all();
    }
}

// ═══════════════════════════════════════════════════════════
// ModelGuard — RAII access token
// ═══════════════════════════════════════════════════════════

/// Exclusive access to one model family for the duration of one operation.
///
/// Dropping the guard releases the family; the model itself stays warm
/// until the swap policy evicts it.
pub struct ModelGuard<'a> {
    arbiter: &'a ModelArbiter,
    family: ModelFamily,
    model_id: String,
    degraded: bool,
}

impl ModelGuard<'_> {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    /// Was the model loaded in degraded (reduced-memory) mode?
    pub fn degraded(&self) -> bool {
        self.degraded
    }
}

impl Drop for ModelGuard<'_> {
    fn drop(&mut self) {
        self.arbiter.release(self.family);
    }
}

// Manual impl: the arbiter back-reference has no useful Debug output.
impl std::fmt::Debug for ModelGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelGuard")
            .field("family", &self.family)
            .field("model_id", &self.model_id)
            .field("degraded", &self.degraded)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
