//! Final placement of processed documents.
//!
//! The archive layout is `output/<year>/<category>/<filename>`. Placement is
//! an atomic rename where the filesystem allows it; cross-device moves fall
//! back to copy-then-remove. Name collisions get a numeric suffix — the
//! archive never overwrites.

use std::path::{Path, PathBuf};

use crate::pipeline::backup::unique_path;
use crate::pipeline::decide::Decision;

#[derive(Debug, thiserror::Error)]
pub enum RelocateError {
    #[error("Relocation I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RelocateError + '_ {
    move |source| RelocateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Year folder for a decision: the filename's own `YYYY-` prefix when the
/// model dated the document, otherwise the processing year.
fn archive_year(filename: &str) -> String {
    let prefix: String = filename.chars().take(4).collect();
    if prefix.len() == 4
        && prefix.chars().all(|c| c.is_ascii_digit())
        && filename.as_bytes().get(4) == Some(&b'-')
    {
        prefix
    } else {
        chrono::Local::now().format("%Y").to_string()
    }
}

/// Move a processed document into the archive. Returns the final path.
pub fn place_in_archive(
    staged: &Path,
    decision: &Decision,
    output_root: &Path,
) -> Result<PathBuf, RelocateError> {
    let target_dir = output_root
        .join(archive_year(&decision.filename))
        .join(&decision.category);
    std::fs::create_dir_all(&target_dir).map_err(io_err(&target_dir))?;

    let target = unique_path(&target_dir, &decision.filename);
    move_file(staged, &target)?;

    tracing::info!(
        from = %staged.display(),
        to = %target.display(),
        category = %decision.category,
        "Document archived"
    );
    Ok(target)
}

/// Move a failed document to quarantine. The backup is left untouched.
pub fn move_to_quarantine(source: &Path, quarantine: &Path) -> Result<PathBuf, RelocateError> {
    std::fs::create_dir_all(quarantine).map_err(io_err(quarantine))?;
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let target = unique_path(quarantine, &name);
    move_file(source, &target)?;
    tracing::warn!(
        from = %source.display(),
        to = %target.display(),
        "Document quarantined"
    );
    Ok(target)
}

/// Rename, falling back to copy-then-remove when source and target are on
/// different filesystems.
pub fn move_file(from: &Path, to: &Path) -> Result<(), RelocateError> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
            std::fs::copy(from, to).map_err(io_err(to))?;
            std::fs::remove_file(from).map_err(io_err(from))?;
            Ok(())
        }
        Err(e) => Err(RelocateError::Io {
            path: from.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(unix)]
fn libc_exdev() -> i32 {
    18 // EXDEV
}

#[cfg(windows)]
fn libc_exdev() -> i32 {
    17 // ERROR_NOT_SAME_DEVICE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::decide::{Decision, DecisionOrigin};

    fn decision(filename: &str, category: &str) -> Decision {
        Decision {
            filename: filename.to_string(),
            category: category.to_string(),
            summary: "test".to_string(),
            confidence: 0.9,
            origin: DecisionOrigin::Parsed,
        }
    }

    #[test]
    fn dated_filename_chooses_its_own_year() {
        assert_eq!(archive_year("2023-11-02_Tax.pdf"), "2023");
        let this_year = chrono::Local::now().format("%Y").to_string();
        assert_eq!(archive_year("undated.pdf"), this_year);
        assert_eq!(archive_year("20231102_Tax.pdf"), this_year);
        assert_eq!(archive_year("a.pdf"), this_year);
    }

    #[test]
    fn archive_path_is_year_category_filename() {
        let tmp = tempfile::tempdir().unwrap();
        let staged = tmp.path().join("staged.pdf");
        std::fs::write(&staged, b"content").unwrap();
        let output = tmp.path().join("output");

        let target = place_in_archive(&staged, &decision("2024-05-01_Policy.pdf", "Insurance"), &output).unwrap();

        assert_eq!(target, output.join("2024/Insurance/2024-05-01_Policy.pdf"));
        assert!(target.exists());
        assert!(!staged.exists(), "staged copy must be moved, not copied");
    }

    #[test]
    fn collisions_are_suffixed_not_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("output");
        let d = decision("2024-05-01_Policy.pdf", "Insurance");

        let staged1 = tmp.path().join("one.pdf");
        std::fs::write(&staged1, b"first").unwrap();
        let first = place_in_archive(&staged1, &d, &output).unwrap();

        let staged2 = tmp.path().join("two.pdf");
        std::fs::write(&staged2, b"second").unwrap();
        let second = place_in_archive(&staged2, &d, &output).unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"first");
        assert_eq!(std::fs::read(&second).unwrap(), b"second");
    }

    #[test]
    fn quarantine_move_preserves_content() {
        let tmp = tempfile::tempdir().unwrap();
        let staged = tmp.path().join("bad.pdf");
        std::fs::write(&staged, b"suspicious").unwrap();
        let quarantine = tmp.path().join("quarantine");

        let target = move_to_quarantine(&staged, &quarantine).unwrap();
        assert!(target.starts_with(&quarantine));
        assert_eq!(std::fs::read(&target).unwrap(), b"suspicious");
        assert!(!staged.exists());
    }

    #[test]
    fn missing_source_is_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = place_in_archive(
            &tmp.path().join("gone.pdf"),
            &decision("a.pdf", "Taxes"),
            &tmp.path().join("output"),
        )
        .unwrap_err();
        assert!(matches!(err, RelocateError::Io { .. }));
    }
}
