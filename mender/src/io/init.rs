//! Canonical `.mender/` layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use super::config::{MenderConfig, load_config, write_config};

/// All canonical paths within `.mender/` for a project root.
#[derive(Debug, Clone)]
pub struct MenderPaths {
    pub root: PathBuf,
    pub mender_dir: PathBuf,
    pub state_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub cycles_dir: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
}

impl MenderPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mender_dir = root.join(".mender");
        let state_dir = mender_dir.join("state");
        Self {
            root: root.clone(),
            mender_dir: mender_dir.clone(),
            state_dir: state_dir.clone(),
            backups_dir: mender_dir.join("backups"),
            cycles_dir: mender_dir.join("cycles"),
            config_path: mender_dir.join("config.toml"),
            state_path: state_dir.join("pipeline_state.json"),
        }
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing config with defaults.
    pub force: bool,
}

/// Create `.mender/` scaffolding and the configured test/source directories.
///
/// An existing config is kept unless `force` is set. The state file is never
/// touched here; it is created by the first saved cycle.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<MenderPaths> {
    let paths = MenderPaths::new(root);
    for dir in [&paths.state_dir, &paths.backups_dir, &paths.cycles_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }

    let cfg = if options.force || !paths.config_path.exists() {
        let cfg = MenderConfig::default();
        write_config(&paths.config_path, &cfg)?;
        info!(path = %paths.config_path.display(), "wrote default config");
        cfg
    } else {
        load_config(&paths.config_path)?
    };

    for dir in [&cfg.source_dir, &cfg.test_dir] {
        let dir = root.join(dir);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    }
    Ok(paths)
}
