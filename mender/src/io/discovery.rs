//! Test unit discovery under the configured test directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::core::path::{ensure_within, relative_key, source_name_for_test};
use crate::io::config::MenderConfig;

/// One discoverable test file and the source file it exercises.
///
/// Enumerated fresh every cycle; the per-cycle state machine and its report
/// carry the unit's outcome and attempt counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestUnit {
    /// Absolute test file path.
    pub path: PathBuf,
    /// Absolute source file path.
    pub source: PathBuf,
    /// Root-relative test path, `/`-separated.
    pub key: String,
    /// Root-relative source path, `/`-separated.
    pub source_key: String,
}

/// List test units in `root/test_dir`, sorted by file name.
///
/// Only regular files named `<test_prefix>*<test_extension>` directly inside the
/// test directory are units. A missing test directory yields no units; a
/// test directory path that is not a directory is an error.
pub fn discover_units(root: &Path, cfg: &MenderConfig) -> Result<Vec<TestUnit>> {
    let test_dir = ensure_within(root, &cfg.test_dir)?;
    let source_dir = ensure_within(root, &cfg.source_dir)?;
    if !test_dir.exists() {
        warn!(dir = %test_dir.display(), "test directory missing");
        return Ok(Vec::new());
    }
    if !test_dir.is_dir() {
        bail!("test directory {} is not a directory", test_dir.display());
    }

    let mut names = Vec::new();
    for entry in
        fs::read_dir(&test_dir).with_context(|| format!("read {}", test_dir.display()))?
    {
        let entry = entry.context("read test dir entry")?;
        if !entry.file_type().context("stat test dir entry")?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&cfg.test_prefix) && name.ends_with(&cfg.test_extension) {
            names.push(name);
        }
    }
    names.sort();

    let mut units = Vec::with_capacity(names.len());
    for name in names {
        let Some(source_name) = source_name_for_test(&name, &cfg.test_prefix) else {
            debug!(name, "skipping test without a source name");
            continue;
        };
        let path = test_dir.join(&name);
        let source = ensure_within(root, &source_dir.join(source_name))?;
        units.push(TestUnit {
            key: relative_key(root, &path),
            source_key: relative_key(root, &source),
            path,
            source,
        });
    }
    debug!(count = units.len(), "discovered test units");
    Ok(units)
}
