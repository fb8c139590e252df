//! File ingestion — filesystem watching, stability detection, FIFO queue.
//!
//! **Why this exists**: documents arrive in the inbox by copy, scan, or
//! network transfer, all of which write incrementally. Acting on a file
//! mid-write corrupts the pipeline's backup, so a path becomes eligible only
//! after two consecutive observations, separated by the debounce interval,
//! report identical size and mtime.
//!
//! **Design**:
//! - `StabilityTracker` is a pure state machine (`Unseen → Seen → Stable`),
//!   testable without a filesystem. Observations are driven by notify events
//!   and a periodic rescan; the rescan also catches missed notifications.
//! - `IngestQueue` is an unbounded FIFO with a blocking `dequeue` and a
//!   shutdown sentinel. A path is enqueued at most once while it is queued
//!   or in flight; `mark_complete` re-arms it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

use notify::{RecursiveMode, Watcher};

use crate::config::AppConfig;

/// How long the watcher loop sleeps between wake-ups.
const POLL_TICK: Duration = Duration::from_millis(500);

// ═══════════════════════════════════════════════════════════
// Ingestion events
// ═══════════════════════════════════════════════════════════

/// A stable document ready for processing. Immutable; consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionEvent {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

// ═══════════════════════════════════════════════════════════
// Stability tracking
// ═══════════════════════════════════════════════════════════

/// Verdict for one observation of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    /// First sighting, changed since last sighting, or debounce not yet met.
    Pending,
    /// Two consecutive identical observations, debounce interval apart.
    Stable,
}

#[derive(Debug, Clone)]
struct Observation {
    size: u64,
    modified: SystemTime,
    observed_at: Instant,
}

/// Per-path stability state machine.
///
/// Pure bookkeeping: callers supply observations and the clock, which keeps
/// this testable without touching a filesystem. A burst of change
/// notifications cannot short-circuit stability because the verdict depends
/// on observation timestamps, not on call counts.
pub struct StabilityTracker {
    debounce: Duration,
    seen: HashMap<PathBuf, Observation>,
}

impl StabilityTracker {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            seen: HashMap::new(),
        }
    }

    /// Record one observation of `path` and judge its stability.
    ///
    /// A `Stable` verdict clears the path's state; if the file reappears or
    /// changes later it starts over as unseen.
    pub fn observe(
        &mut self,
        path: &Path,
        size: u64,
        modified: SystemTime,
        now: Instant,
    ) -> Stability {
        match self.seen.get(path) {
            Some(prev)
                if prev.size == size
                    && prev.modified == modified
                    && now.duration_since(prev.observed_at) >= self.debounce =>
            {
                self.seen.remove(path);
                Stability::Stable
            }
            Some(prev) if prev.size == size && prev.modified == modified => {
                // Unchanged but too soon — keep the original timestamp so the
                // debounce clock keeps running.
                Stability::Pending
            }
            _ => {
                self.seen.insert(
                    path.to_path_buf(),
                    Observation {
                        size,
                        modified,
                        observed_at: now,
                    },
                );
                Stability::Pending
            }
        }
    }

    /// Forget a path (deleted or moved away mid-write).
    pub fn forget(&mut self, path: &Path) {
        self.seen.remove(path);
    }

    pub fn tracked_count(&self) -> usize {
        self.seen.len()
    }
}

// ═══════════════════════════════════════════════════════════
// Ingest queue
// ═══════════════════════════════════════════════════════════

struct QueueState {
    queue: VecDeque<IngestionEvent>,
    /// Paths queued or in flight — duplicates are suppressed.
    tracked: HashSet<PathBuf>,
    shutdown: bool,
}

/// Unbounded FIFO of stable documents with duplicate suppression.
pub struct IngestQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl IngestQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                tracked: HashSet::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Push a stable document. Returns false if the path is already queued
    /// or in flight, or if the queue is shut down.
    pub fn enqueue(&self, event: IngestionEvent) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.shutdown || !state.tracked.insert(event.path.clone()) {
            return false;
        }
        tracing::debug!(path = %event.path.display(), "Document queued for processing");
        state.queue.push_back(event);
        self.cond.notify_one();
        true
    }

    /// Pop the oldest document, blocking until one arrives.
    ///
    /// Returns `None` once the queue is shut down and drained.
    pub fn dequeue(&self) -> Option<IngestionEvent> {
        let mut state = self.state.lock().ok()?;
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some(event);
            }
            if state.shutdown {
                return None;
            }
            state = self.cond.wait(state).ok()?;
        }
    }

    /// Re-arm a path after its job reached a terminal state.
    pub fn mark_complete(&self, path: &Path) {
        if let Ok(mut state) = self.state.lock() {
            state.tracked.remove(path);
        }
    }

    /// Stop accepting documents and wake all blocked consumers.
    pub fn shutdown(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.shutdown = true;
        }
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IngestQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════
// Watcher thread
// ═══════════════════════════════════════════════════════════

/// Should this directory entry be considered at all?
///
/// Temp artifacts from editors and transfer tools (leading `.` or `~`,
/// trailing `~`) never stabilize meaningfully and are skipped outright.
fn is_candidate(config: &AppConfig, path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || name.starts_with('~') || name.ends_with('~') {
        return false;
    }
    config.accepts_extension(path)
}

/// Recursively collect candidate files under `dir`.
fn scan_dir(config: &AppConfig, dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_dir(config, &path, out);
        } else if is_candidate(config, &path) {
            out.push(path);
        }
    }
}

/// Watch the input directory until `stop` is set.
///
/// Combines notify events with a periodic rescan; both feed the same
/// stability tracker, so the two sources cannot double-enqueue.
pub fn watch_input(config: Arc<AppConfig>, queue: Arc<IngestQueue>, stop: Arc<AtomicBool>) {
    let (tx, rx) = std::sync::mpsc::channel::<PathBuf>();

    let mut watcher = match notify::recommended_watcher(
        move |result: Result<notify::Event, notify::Error>| match result {
            Ok(event) => {
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Watcher backend error"),
        },
    ) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create filesystem watcher — rescan only");
            rescan_only(&config, &queue, &stop);
            return;
        }
    };

    if let Err(e) = watcher.watch(&config.paths.input, RecursiveMode::Recursive) {
        tracing::error!(
            path = %config.paths.input.display(),
            error = %e,
            "Failed to watch input directory — rescan only"
        );
        rescan_only(&config, &queue, &stop);
        return;
    }

    tracing::info!(path = %config.paths.input.display(), "Watching input directory");

    let mut tracker = StabilityTracker::new(config.debounce);
    let mut last_rescan: Option<Instant> = None;

    while !stop.load(Ordering::SeqCst) {
        let mut candidates: HashSet<PathBuf> = HashSet::new();

        // Drain notify events accumulated since the last tick.
        match rx.recv_timeout(POLL_TICK) {
            Ok(path) => {
                candidates.insert(path);
                while let Ok(path) = rx.try_recv() {
                    candidates.insert(path);
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        if last_rescan.map_or(true, |t| now.duration_since(t) >= config.rescan_interval) {
            last_rescan = Some(now);
            let mut found = Vec::new();
            scan_dir(&config, &config.paths.input, &mut found);
            candidates.extend(found);
        }

        for path in candidates {
            observe_candidate(&config, &queue, &mut tracker, &path, now);
        }
    }

    tracing::info!("Watcher stopped");
}

/// Degraded mode when the notify backend is unavailable.
fn rescan_only(config: &AppConfig, queue: &IngestQueue, stop: &AtomicBool) {
    let mut tracker = StabilityTracker::new(config.debounce);
    while !stop.load(Ordering::SeqCst) {
        let mut found = Vec::new();
        scan_dir(config, &config.paths.input, &mut found);
        let now = Instant::now();
        for path in found {
            observe_candidate(config, queue, &mut tracker, &path, now);
        }
        std::thread::sleep(POLL_TICK);
    }
}

fn observe_candidate(
    config: &AppConfig,
    queue: &IngestQueue,
    tracker: &mut StabilityTracker,
    path: &Path,
    now: Instant,
) {
    if !is_candidate(config, path) {
        return;
    }
    let Ok(meta) = std::fs::metadata(path) else {
        // Deleted or moved between sighting and stat.
        tracker.forget(path);
        return;
    };
    if !meta.is_file() {
        return;
    }
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    if tracker.observe(path, meta.len(), modified, now) == Stability::Stable {
        queue.enqueue(IngestionEvent {
            path: path.to_path_buf(),
            size: meta.len(),
            modified,
        });
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(100);

    fn event(path: &str) -> IngestionEvent {
        IngestionEvent {
            path: PathBuf::from(path),
            size: 1024,
            modified: SystemTime::UNIX_EPOCH,
        }
    }

    // ── StabilityTracker ────────────────────────────────────

    #[test]
    fn first_observation_is_pending() {
        let mut tracker = StabilityTracker::new(DEBOUNCE);
        let verdict = tracker.observe(
            Path::new("a.pdf"),
            100,
            SystemTime::UNIX_EPOCH,
            Instant::now(),
        );
        assert_eq!(verdict, Stability::Pending);
        assert_eq!(tracker.tracked_count(), 1);
    }

    #[test]
    fn identical_observation_after_debounce_is_stable() {
        let mut tracker = StabilityTracker::new(DEBOUNCE);
        let t0 = Instant::now();
        let mtime = SystemTime::UNIX_EPOCH;

        assert_eq!(
            tracker.observe(Path::new("a.pdf"), 100, mtime, t0),
            Stability::Pending
        );
        assert_eq!(
            tracker.observe(Path::new("a.pdf"), 100, mtime, t0 + DEBOUNCE),
            Stability::Stable
        );
        // State cleared after the stable verdict.
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[test]
    fn identical_observation_before_debounce_stays_pending() {
        let mut tracker = StabilityTracker::new(DEBOUNCE);
        let t0 = Instant::now();
        let mtime = SystemTime::UNIX_EPOCH;

        tracker.observe(Path::new("a.pdf"), 100, mtime, t0);
        assert_eq!(
            tracker.observe(Path::new("a.pdf"), 100, mtime, t0 + DEBOUNCE / 2),
            Stability::Pending
        );
        // The debounce clock was not reset by the early observation.
        assert_eq!(
            tracker.observe(Path::new("a.pdf"), 100, mtime, t0 + DEBOUNCE),
            Stability::Stable
        );
    }

    #[test]
    fn size_change_restarts_the_clock() {
        let mut tracker = StabilityTracker::new(DEBOUNCE);
        let t0 = Instant::now();
        let mtime = SystemTime::UNIX_EPOCH;

        tracker.observe(Path::new("a.pdf"), 100, mtime, t0);
        // Still being written.
        assert_eq!(
            tracker.observe(Path::new("a.pdf"), 200, mtime, t0 + DEBOUNCE),
            Stability::Pending
        );
        // Old timestamp no longer counts.
        assert_eq!(
            tracker.observe(Path::new("a.pdf"), 200, mtime, t0 + DEBOUNCE + DEBOUNCE / 2),
            Stability::Pending
        );
        assert_eq!(
            tracker.observe(Path::new("a.pdf"), 200, mtime, t0 + DEBOUNCE * 2),
            Stability::Stable
        );
    }

    #[test]
    fn mtime_change_restarts_the_clock() {
        let mut tracker = StabilityTracker::new(DEBOUNCE);
        let t0 = Instant::now();

        tracker.observe(Path::new("a.pdf"), 100, SystemTime::UNIX_EPOCH, t0);
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(60);
        assert_eq!(
            tracker.observe(Path::new("a.pdf"), 100, later, t0 + DEBOUNCE),
            Stability::Pending
        );
    }

    #[test]
    fn forget_clears_state() {
        let mut tracker = StabilityTracker::new(DEBOUNCE);
        tracker.observe(
            Path::new("a.pdf"),
            100,
            SystemTime::UNIX_EPOCH,
            Instant::now(),
        );
        tracker.forget(Path::new("a.pdf"));
        assert_eq!(tracker.tracked_count(), 0);
    }

    // ── IngestQueue ─────────────────────────────────────────

    #[test]
    fn dequeue_preserves_fifo_order() {
        let queue = IngestQueue::new();
        assert!(queue.enqueue(event("first.pdf")));
        assert!(queue.enqueue(event("second.pdf")));

        assert_eq!(queue.dequeue().unwrap().path, PathBuf::from("first.pdf"));
        assert_eq!(queue.dequeue().unwrap().path, PathBuf::from("second.pdf"));
    }

    #[test]
    fn duplicate_paths_are_suppressed_until_complete() {
        let queue = IngestQueue::new();
        assert!(queue.enqueue(event("a.pdf")));
        assert!(!queue.enqueue(event("a.pdf")));

        // Still suppressed while in flight (dequeued but not complete).
        let taken = queue.dequeue().unwrap();
        assert!(!queue.enqueue(event("a.pdf")));

        queue.mark_complete(&taken.path);
        assert!(queue.enqueue(event("a.pdf")));
    }

    #[test]
    fn shutdown_yields_none_after_drain() {
        let queue = IngestQueue::new();
        queue.enqueue(event("a.pdf"));
        queue.shutdown();

        // Queued work is still handed out, then the sentinel.
        assert!(queue.dequeue().is_some());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn enqueue_after_shutdown_is_rejected() {
        let queue = IngestQueue::new();
        queue.shutdown();
        assert!(!queue.enqueue(event("a.pdf")));
    }

    #[test]
    fn dequeue_blocks_until_enqueue() {
        let queue = Arc::new(IngestQueue::new());
        let queue2 = Arc::clone(&queue);

        let handle = std::thread::spawn(move || queue2.dequeue());

        std::thread::sleep(Duration::from_millis(50));
        queue.enqueue(event("late.pdf"));

        let got = handle.join().unwrap().unwrap();
        assert_eq!(got.path, PathBuf::from("late.pdf"));
    }

    #[test]
    fn shutdown_wakes_blocked_consumers() {
        let queue = Arc::new(IngestQueue::new());
        let queue2 = Arc::clone(&queue);

        let handle = std::thread::spawn(move || queue2.dequeue());
        std::thread::sleep(Duration::from_millis(50));
        queue.shutdown();

        assert!(handle.join().unwrap().is_none());
    }

    // ── Candidate filtering + end-to-end watch ──────────────

    #[test]
    fn candidate_filter_skips_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AppConfig::with_base(tmp.path());

        assert!(is_candidate(&config, Path::new("scan.pdf")));
        assert!(!is_candidate(&config, Path::new(".hidden.pdf")));
        assert!(!is_candidate(&config, Path::new("~lock.pdf")));
        assert!(!is_candidate(&config, Path::new("backup.pdf~")));
        assert!(!is_candidate(&config, Path::new("notes.txt")));
    }

    #[test]
    fn scan_dir_finds_nested_candidates() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AppConfig::with_base(tmp.path());
        config.paths.ensure().unwrap();

        let nested = config.paths.input.join("2025/march");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("scan.pdf"), b"pdf").unwrap();
        std::fs::write(nested.join(".partial.pdf"), b"pdf").unwrap();
        std::fs::write(config.paths.input.join("readme.txt"), b"txt").unwrap();

        let mut found = Vec::new();
        scan_dir(&config, &config.paths.input, &mut found);
        assert_eq!(found, vec![nested.join("scan.pdf")]);
    }

    #[test]
    fn watch_input_enqueues_stable_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = AppConfig::with_base(tmp.path());
        config.debounce = Duration::from_millis(10);
        config.rescan_interval = Duration::from_millis(50);
        config.paths.ensure().unwrap();
        std::fs::write(config.paths.input.join("scan.pdf"), b"%PDF-1.4").unwrap();

        let config = Arc::new(config);
        let queue = Arc::new(IngestQueue::new());
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let (config, queue, stop) = (Arc::clone(&config), Arc::clone(&queue), Arc::clone(&stop));
            std::thread::spawn(move || watch_input(config, queue, stop))
        };

        let event = queue.dequeue().expect("stable file should be enqueued");
        assert!(event.path.ends_with("scan.pdf"));
        assert_eq!(event.size, 8);

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
