//! Pre-overwrite backups and content checksums for source files.
//!
//! Backups live under `.mender/backups/`, mirroring the source's relative
//! directory, and are written with create-new semantics so an existing backup
//! is never replaced.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::core::path::{ensure_within, relative_key};
use crate::io::state_store::write_atomic;

/// An immutable snapshot of a source file taken before it was overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupHandle {
    /// The file that was backed up.
    pub original: PathBuf,
    /// Where the snapshot lives.
    pub path: PathBuf,
    /// Root-relative snapshot path.
    pub key: String,
    pub created_at: DateTime<Utc>,
    /// SHA-256 of the snapshot content.
    pub checksum: String,
}

/// SHA-256 hex digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 hex digest of the file at `path`.
pub fn checksum(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(sha256_hex(&contents))
}

#[derive(Debug, Clone)]
pub struct FileVersioning {
    root: PathBuf,
    backups_dir: PathBuf,
}

impl FileVersioning {
    pub fn new(root: impl Into<PathBuf>, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backups_dir: backups_dir.into(),
        }
    }

    /// Snapshot `path` before it is overwritten.
    ///
    /// Any failure is returned; the caller must not overwrite without a handle.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn backup(&self, path: &Path) -> Result<BackupHandle> {
        let original = ensure_within(&self.root, path)?;
        let contents =
            fs::read(&original).with_context(|| format!("read {}", original.display()))?;

        let rel = relative_key(&self.root, &original);
        let rel_dir = Path::new(&rel).parent().unwrap_or(Path::new(""));
        let dir = ensure_within(&self.root, &self.backups_dir.join(rel_dir))?;
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

        let created_at = Utc::now();
        let target = dir.join(backup_file_name(&original, created_at));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .with_context(|| format!("create backup {}", target.display()))?;
        file.write_all(&contents)
            .with_context(|| format!("write backup {}", target.display()))?;
        file.sync_all()
            .with_context(|| format!("sync backup {}", target.display()))?;

        let handle = BackupHandle {
            original,
            key: relative_key(&self.root, &target),
            path: target,
            created_at,
            checksum: sha256_hex(&contents),
        };
        info!(backup = %handle.key, "source backed up");
        Ok(handle)
    }

    /// Atomically replace a source file inside the project root.
    pub fn write_source(&self, path: &Path, contents: &str) -> Result<()> {
        let target = ensure_within(&self.root, path)?;
        if target.starts_with(&self.backups_dir) {
            bail!("refusing to overwrite backup {}", target.display());
        }
        debug!(path = %target.display(), bytes = contents.len(), "writing source");
        write_atomic(&target, contents.as_bytes())
    }

    /// Put a backup's content back in place of its original.
    ///
    /// The current content is itself backed up first; the returned handle is
    /// that new snapshot. Fails if the backup no longer matches its checksum.
    pub fn restore(&self, handle: &BackupHandle) -> Result<BackupHandle> {
        let contents =
            fs::read(&handle.path).with_context(|| format!("read {}", handle.path.display()))?;
        if sha256_hex(&contents) != handle.checksum {
            bail!("backup {} does not match its checksum", handle.path.display());
        }
        let displaced = self.backup(&handle.original)?;
        let target = ensure_within(&self.root, &handle.original)?;
        write_atomic(&target, &contents)?;
        info!(source = %target.display(), backup = %handle.key, "source restored");
        Ok(displaced)
    }
}

fn backup_file_name(original: &Path, created_at: DateTime<Utc>) -> String {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "source".to_string());
    let stamp = created_at.format("%Y%m%d_%H%M%S_%3f");
    let suffix: String = thread_rng()
        .sample_iter(Alphanumeric)
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    match original.extension() {
        Some(ext) => format!("{stem}.{stamp}.{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{stamp}.{suffix}"),
    }
}
