//! Backup and integrity verification.
//!
//! The backup is made before anything else touches the document: a
//! byte-for-byte copy into `backup/<date>/<original name>`, then a streaming
//! SHA-256 of both files. A job never proceeds past verification without a
//! checksum-verified backup, and the backup outlives the job regardless of
//! how the job ends.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Streaming hash chunk size.
const HASH_CHUNK_BYTES: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Backup I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checksum mismatch: source {source_hash} != backup {backup_hash}")]
    ChecksumMismatch {
        source_hash: String,
        backup_hash: String,
    },
}

/// A verified backup of one document.
#[derive(Debug, Clone)]
pub struct VerifiedBackup {
    pub backup_path: PathBuf,
    /// Hex SHA-256 of the source at backup time.
    pub sha256: String,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BackupError + '_ {
    move |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Hex-encoded streaming SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String, BackupError> {
    let mut file = std::fs::File::open(path).map_err(io_err(path))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_CHUNK_BYTES];
    loop {
        let n = file.read(&mut buf).map_err(io_err(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Copy `source` into `backup_root/<date>/` without overwriting anything.
///
/// Name collisions within a day get a numeric suffix.
pub fn back_up(source: &Path, backup_root: &Path) -> Result<PathBuf, BackupError> {
    let day_dir = backup_root.join(chrono::Local::now().format("%Y-%m-%d").to_string());
    std::fs::create_dir_all(&day_dir).map_err(io_err(&day_dir))?;

    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let target = unique_path(&day_dir, &name);

    std::fs::copy(source, &target).map_err(io_err(source))?;
    tracing::info!(
        source = %source.display(),
        backup = %target.display(),
        "Backup written"
    );
    Ok(target)
}

/// Compare source and backup checksums.
pub fn verify(source: &Path, backup_path: &Path) -> Result<VerifiedBackup, BackupError> {
    let source_hash = sha256_file(source)?;
    let backup_hash = sha256_file(backup_path)?;
    if source_hash != backup_hash {
        return Err(BackupError::ChecksumMismatch {
            source_hash,
            backup_hash,
        });
    }
    Ok(VerifiedBackup {
        backup_path: backup_path.to_path_buf(),
        sha256: source_hash,
    })
}

/// First free path for `name` in `dir`: `name`, `name (1)`, `name (2)`, …
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, Some(e)),
        _ => (name, None),
    };
    for i in 1u32.. {
        let candidate = match ext {
            Some(ext) => dir.join(format!("{stem} ({i}).{ext}")),
            None => dir.join(format!("{stem} ({i})")),
        };
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("u32 suffix space exhausted")
}
