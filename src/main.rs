//! Daemon entry point: wiring, lifecycle, and shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use docflow::config::{self, AppConfig};
use docflow::events::EventBus;
use docflow::hardware;
use docflow::ollama::OllamaClient;
use docflow::pipeline::runner::build_runner;
use docflow::watcher::{watch_input, IngestQueue};

/// Short timeout for the startup hardware probe.
const PROBE_TIMEOUT_SECS: u64 = 30;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Fatal error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let base = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let config = Arc::new(AppConfig::with_base(&base));
    config.paths.ensure()?;
    tracing::info!(
        name = config::APP_NAME,
        version = config::APP_VERSION,
        base = %base.display(),
        ollama = %config.ollama_url,
        "Starting"
    );

    // The accelerator profile caps the configured budget; a CPU-only box
    // must not pretend it has VRAM to swap models in.
    let probe = OllamaClient::new(&config.ollama_url, PROBE_TIMEOUT_SECS);
    let profile = hardware::detect_hardware(&probe);
    let budget_bytes = config
        .memory_budget_bytes
        .min(profile.default_budget_bytes());
    tracing::info!(
        accelerator = %profile.accelerator,
        budget_mb = budget_bytes / 1_000_000,
        "Memory budget set"
    );

    let events = Arc::new(EventBus::new());
    let status_rx = events.subscribe();
    std::thread::spawn(move || {
        for event in status_rx {
            tracing::info!(
                job_id = %event.job_id,
                stage = %event.stage,
                detail = %event.detail,
                "Status"
            );
        }
    });

    let stop = Arc::new(AtomicBool::new(false));
    let queue = Arc::new(IngestQueue::new());
    let runner = build_runner(
        Arc::clone(&config),
        Arc::clone(&events),
        Arc::clone(&stop),
        budget_bytes,
    )?;

    let watcher_handle = {
        let (config, queue, stop) = (Arc::clone(&config), Arc::clone(&queue), Arc::clone(&stop));
        std::thread::spawn(move || watch_input(config, queue, stop))
    };

    let runner_handle = {
        let queue = Arc::clone(&queue);
        tokio::task::spawn_blocking(move || runner.run(&queue))
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested — finishing in-flight work");
    stop.store(true, Ordering::SeqCst);
    queue.shutdown();

    runner_handle.await?;
    watcher_handle
        .join()
        .map_err(|_| "watcher thread panicked")?;

    tracing::info!("Stopped");
    Ok(())
}
