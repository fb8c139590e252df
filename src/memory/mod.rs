//! Context memory — append-only log of past filing decisions.
//!
//! **Why this exists**: the reasoning model files new documents more
//! consistently when it sees how similar documents were filed before.
//! Every completed job appends one entry; `query` recalls the closest
//! precedents by cosine similarity over embedding fingerprints.
//!
//! **Design**: entries live in memory under a Mutex and are persisted as
//! one JSON line each. Startup replays the log; nothing is ever rewritten
//! or deleted, so a crash can at worst lose the line being written.

pub mod embedder;

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Memory log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Memory log line is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Embedding failed: {0}")]
    Embedding(#[from] crate::ollama::OllamaError),

    #[error("Internal lock error")]
    LockPoisoned,
}

/// One remembered filing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    /// Embedding of the document's extracted text.
    pub fingerprint: Vec<f32>,
    /// Original file name as it arrived in the inbox.
    pub source_name: String,
    pub summary: String,
    /// Category the document was filed under.
    pub category: String,
    /// Final archive file name.
    pub filed_as: String,
    /// ISO 8601 completion time.
    pub recorded_at: String,
}

/// A recalled entry with its similarity score.
#[derive(Debug, Clone)]
pub struct RecalledEntry {
    pub entry: MemoryEntry,
    pub score: f32,
}

/// Append-only decision memory with cosine-similarity recall.
pub struct ContextMemory {
    entries: Mutex<Vec<MemoryEntry>>,
    log_path: PathBuf,
}

impl ContextMemory {
    /// Open the memory at `log_path`, replaying any existing log.
    ///
    /// Unreadable lines are skipped with a warning rather than poisoning
    /// the whole store.
    pub fn open(log_path: &Path) -> Result<Self, MemoryError> {
        let mut entries = Vec::new();

        if log_path.exists() {
            let file = std::fs::File::open(log_path)?;
            for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<MemoryEntry>(&line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        tracing::warn!(
                            line = lineno + 1,
                            error = %e,
                            "Skipping corrupt memory log line"
                        );
                    }
                }
            }
            tracing::info!(
                entries = entries.len(),
                path = %log_path.display(),
                "Context memory loaded"
            );
        }

        Ok(Self {
            entries: Mutex::new(entries),
            log_path: log_path.to_path_buf(),
        })
    }

    /// Append one entry: in-memory insert plus one JSONL line.
    pub fn append(&self, entry: MemoryEntry) -> Result<(), MemoryError> {
        let line = serde_json::to_string(&entry)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{line}")?;

        let mut entries = self.entries.lock().map_err(|_| MemoryError::LockPoisoned)?;
        entries.push(entry);
        Ok(())
    }

    /// Recall the `k` most similar entries, best first.
    ///
    /// Idempotent: querying never mutates the store. Entries whose
    /// fingerprint dimension does not match the probe are skipped with a
    /// warning. Returns at most `min(k, len)` hits.
    pub fn query(&self, fingerprint: &[f32], k: usize) -> Result<Vec<RecalledEntry>, MemoryError> {
        let entries = self.entries.lock().map_err(|_| MemoryError::LockPoisoned)?;

        let mut scored: Vec<RecalledEntry> = entries
            .iter()
            .filter_map(|entry| {
                if entry.fingerprint.len() != fingerprint.len() {
                    tracing::warn!(
                        entry_id = %entry.id,
                        entry_dim = entry.fingerprint.len(),
                        probe_dim = fingerprint.len(),
                        "Skipping entry with mismatched fingerprint dimension"
                    );
                    return None;
                }
                Some(RecalledEntry {
                    entry: entry.clone(),
                    score: cosine_similarity(fingerprint, &entry.fingerprint),
                })
            })
            .collect();

        // Descending score; ties broken by recording order for determinism.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.recorded_at.cmp(&b.entry.recorded_at))
        });
        scored.truncate(k);
        Ok(scored)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cosine similarity between equal-length vectors.
///
/// Zero-norm inputs score 0 rather than NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Render recalled precedents for inclusion in a reasoning prompt.
pub fn format_precedents(recalled: &[RecalledEntry]) -> String {
    if recalled.is_empty() {
        return "No prior filing decisions available.".to_string();
    }
    let mut out = String::new();
    for r in recalled {
        out.push_str(&format!(
            "- \"{}\" was filed as {}/{} ({})\n",
            r.entry.source_name, r.entry.category, r.entry.filed_as, r.entry.summary
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(source: &str, fingerprint: Vec<f32>, recorded_at: &str) -> MemoryEntry {
        MemoryEntry {
            id: Uuid::new_v4(),
            fingerprint,
            source_name: source.to_string(),
            summary: format!("Summary of {source}"),
            category: "Invoices".to_string(),
            filed_as: format!("2025-03-01_{source}"),
            recorded_at: recorded_at.to_string(),
        }
    }

    fn open_temp() -> (ContextMemory, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let memory = ContextMemory::open(&tmp.path().join("memory.jsonl")).unwrap();
        (memory, tmp)
    }

    #[test]
    fn open_without_log_starts_empty() {
        let (memory, _tmp) = open_temp();
        assert!(memory.is_empty());
        assert!(memory.query(&[1.0, 0.0], 3).unwrap().is_empty());
    }

    #[test]
    fn append_then_query_recalls_entry() {
        let (memory, _tmp) = open_temp();
        memory.append(entry("invoice.pdf", vec![1.0, 0.0], "t1")).unwrap();

        let hits = memory.query(&[1.0, 0.0], 3).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.source_name, "invoice.pdf");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn query_orders_by_similarity_descending() {
        let (memory, _tmp) = open_temp();
        memory.append(entry("far.pdf", vec![0.0, 1.0], "t1")).unwrap();
        memory.append(entry("near.pdf", vec![1.0, 0.1], "t2")).unwrap();
        memory.append(entry("exact.pdf", vec![1.0, 0.0], "t3")).unwrap();

        let hits = memory.query(&[1.0, 0.0], 3).unwrap();
        assert_eq!(hits[0].entry.source_name, "exact.pdf");
        assert_eq!(hits[1].entry.source_name, "near.pdf");
        assert_eq!(hits[2].entry.source_name, "far.pdf");
    }

    #[test]
    fn hits_never_exceed_store_size() {
        let (memory, _tmp) = open_temp();
        memory.append(entry("only.pdf", vec![1.0, 0.0], "t1")).unwrap();

        let hits = memory.query(&[1.0, 0.0], 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn query_is_idempotent() {
        let (memory, _tmp) = open_temp();
        memory.append(entry("a.pdf", vec![1.0, 0.0], "t1")).unwrap();

        let first = memory.query(&[1.0, 0.0], 3).unwrap();
        let second = memory.query(&[1.0, 0.0], 3).unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].entry.id, second[0].entry.id);
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn mismatched_dimension_entries_are_skipped() {
        let (memory, _tmp) = open_temp();
        memory.append(entry("old.pdf", vec![1.0, 0.0, 0.0], "t1")).unwrap();
        memory.append(entry("new.pdf", vec![1.0, 0.0], "t2")).unwrap();

        let hits = memory.query(&[1.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.source_name, "new.pdf");
    }

    #[test]
    fn log_replay_restores_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("memory.jsonl");

        {
            let memory = ContextMemory::open(&log).unwrap();
            memory.append(entry("a.pdf", vec![1.0, 0.0], "t1")).unwrap();
            memory.append(entry("b.pdf", vec![0.0, 1.0], "t2")).unwrap();
        }

        let reopened = ContextMemory::open(&log).unwrap();
        assert_eq!(reopened.len(), 2);
        let hits = reopened.query(&[0.0, 1.0], 1).unwrap();
        assert_eq!(hits[0].entry.source_name, "b.pdf");
    }

    #[test]
    fn corrupt_log_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("memory.jsonl");

        {
            let memory = ContextMemory::open(&log).unwrap();
            memory.append(entry("good.pdf", vec![1.0], "t1")).unwrap();
        }
        let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(file, "{{not json").unwrap();
        drop(file);

        let reopened = ContextMemory::open(&log).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn cosine_handles_zero_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn precedent_formatting() {
        assert_eq!(
            format_precedents(&[]),
            "No prior filing decisions available."
        );

        let recalled = vec![RecalledEntry {
            entry: entry("invoice.pdf", vec![1.0], "t1"),
            score: 0.9,
        }];
        let text = format_precedents(&recalled);
        assert!(text.contains("invoice.pdf"));
        assert!(text.contains("Invoices/2025-03-01_invoice.pdf"));
    }
}
