//! Accelerator detection and memory-budget defaults.
//!
//! Queries Ollama `/api/ps` to determine whether models run on the GPU or
//! the CPU. This drives the default memory budget and the degraded-load
//! parameters. Conservative: assumes CPU-only when detection fails.

use serde::{Deserialize, Serialize};

use crate::ollama::LlmClient;

/// Default budget when a GPU is visible but its size is unknown.
const DEFAULT_GPU_BUDGET: u64 = 8 * 1024 * 1024 * 1024;

/// Default budget for pure-CPU inference (system RAM share).
const DEFAULT_CPU_BUDGET: u64 = 12 * 1024 * 1024 * 1024;

/// Accelerator availability classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accelerator {
    /// Model layers resident in VRAM.
    Gpu,
    /// No VRAM allocated — pure CPU inference.
    CpuOnly,
}

impl std::fmt::Display for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gpu => write!(f, "GPU"),
            Self::CpuOnly => write!(f, "CPU only"),
        }
    }
}

/// Hardware profile detected from Ollama's running models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub accelerator: Accelerator,
    /// VRAM allocated to loaded models (bytes). 0 = CPU-only.
    pub vram_bytes: u64,
    /// Total size of loaded models (bytes).
    pub total_model_bytes: u64,
    /// ISO 8601 timestamp when detection occurred.
    pub detected_at: String,
}

impl HardwareProfile {
    /// Conservative fallback when detection fails.
    pub fn cpu_fallback() -> Self {
        Self {
            accelerator: Accelerator::CpuOnly,
            vram_bytes: 0,
            total_model_bytes: 0,
            detected_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Default accelerator memory budget for this profile.
    ///
    /// A visible GPU gets the VRAM actually observed (floored at the GPU
    /// default, since /api/ps only reports what is loaded right now).
    pub fn default_budget_bytes(&self) -> u64 {
        match self.accelerator {
            Accelerator::Gpu => self.vram_bytes.max(DEFAULT_GPU_BUDGET),
            Accelerator::CpuOnly => DEFAULT_CPU_BUDGET,
        }
    }
}

/// Detect the hardware profile by querying Ollama `/api/ps`.
pub fn detect_hardware(client: &dyn LlmClient) -> HardwareProfile {
    let _span = tracing::info_span!("hardware_detect").entered();

    match client.list_running() {
        Ok(models) if !models.is_empty() => {
            let total_size: u64 = models.iter().map(|m| m.size).sum();
            let total_vram: u64 = models.iter().map(|m| m.size_vram).sum();

            let profile = HardwareProfile {
                accelerator: if total_vram > 0 {
                    Accelerator::Gpu
                } else {
                    Accelerator::CpuOnly
                },
                vram_bytes: total_vram,
                total_model_bytes: total_size,
                detected_at: chrono::Utc::now().to_rfc3339(),
            };

            tracing::info!(
                accelerator = %profile.accelerator,
                vram_mb = total_vram / 1_000_000,
                total_mb = total_size / 1_000_000,
                models = models.len(),
                "Hardware profile detected"
            );
            profile
        }
        Ok(_) => {
            tracing::info!("No models loaded in Ollama — assuming CPU");
            HardwareProfile::cpu_fallback()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Hardware detection failed — assuming CPU");
            HardwareProfile::cpu_fallback()
        }
    }
}
