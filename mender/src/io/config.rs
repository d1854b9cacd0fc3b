//! Orchestrator configuration stored under `.mender/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::core::backoff::BackoffConfig;
use crate::error::MenderError;
use crate::retry::RetryPolicy;

/// Orchestrator configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults so a
/// partial file is always valid input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MenderConfig {
    /// Directory holding test files, relative to the project root.
    pub test_dir: PathBuf,
    /// Directory holding the source files tests exercise, relative to the project root.
    pub source_dir: PathBuf,
    /// Test file name prefix; the remainder names the source file.
    pub test_prefix: String,
    /// Test file extension, including the dot.
    pub test_extension: String,
    /// Command that runs one test file; the file path is appended.
    pub test_command: Vec<String>,
    /// Hard wall-clock limit for a single test execution.
    pub test_timeout_secs: u64,
    /// Captured stdout/stderr per stream beyond this many bytes is discarded.
    pub output_limit_bytes: usize,
    /// Oracle calls allowed per failing unit per cycle.
    pub max_repair_attempts: u32,
    /// Units processed concurrently within a cycle.
    pub workers: usize,
    /// Sleep between cycles in continuous mode.
    pub interval_secs: u64,
    pub retry: RetryConfig,
    pub oracle: OracleConfig,
}

/// Transport retry settings shared by test spawning and oracle calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter amplitude as a fraction of the delay (0.5 = ±50%).
    pub jitter_fraction: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OracleKind {
    /// Repair disabled; failing units are recorded and left alone.
    None,
    /// Spawn `command`, JSON request on stdin, JSON result on stdout.
    Command,
    /// POST JSON to `endpoint`.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    pub kind: OracleKind,
    pub command: Vec<String>,
    pub endpoint: Option<String>,
    /// Environment variable holding a bearer token for `http`.
    pub api_key_env: Option<String>,
    /// Per-call limit (process lifetime or HTTP request).
    pub timeout_secs: u64,
    /// Transport attempts per repair attempt, including the first.
    pub max_attempts: u32,
    /// Diagnostic text sent to the oracle is cut to this many bytes.
    pub diagnostic_limit_bytes: usize,
}

impl Default for MenderConfig {
    fn default() -> Self {
        Self {
            test_dir: PathBuf::from("src/tests"),
            source_dir: PathBuf::from("src"),
            test_prefix: "test_".to_string(),
            test_extension: ".py".to_string(),
            test_command: vec!["python3".to_string()],
            test_timeout_secs: 300,
            output_limit_bytes: 100_000,
            max_repair_attempts: 2,
            workers: 1,
            interval_secs: 3600,
            retry: RetryConfig::default(),
            oracle: OracleConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter_fraction: 0.5,
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            kind: OracleKind::None,
            command: Vec::new(),
            endpoint: None,
            api_key_env: None,
            timeout_secs: 120,
            max_attempts: 3,
            diagnostic_limit_bytes: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_fraction: self.jitter_fraction,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff(),
        }
    }
}

impl MenderConfig {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Retry policy for oracle transport failures.
    pub fn oracle_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.oracle.max_attempts,
            backoff: self.retry.backoff(),
        }
    }

    pub fn validate(&self) -> Result<(), MenderError> {
        let fail = |msg: &str| Err(MenderError::Config(msg.to_string()));
        if self.test_timeout_secs == 0 {
            return fail("test_timeout_secs must be > 0");
        }
        if self.output_limit_bytes == 0 {
            return fail("output_limit_bytes must be > 0");
        }
        if self.max_repair_attempts == 0 {
            return fail("max_repair_attempts must be > 0");
        }
        if self.workers == 0 {
            return fail("workers must be > 0");
        }
        if self.test_prefix.is_empty() {
            return fail("test_prefix must be non-empty");
        }
        if self.test_command.is_empty() || self.test_command[0].trim().is_empty() {
            return fail("test_command must be a non-empty array");
        }
        for (name, dir) in [("test_dir", &self.test_dir), ("source_dir", &self.source_dir)] {
            if dir.is_absolute()
                || dir
                    .components()
                    .any(|c| c == std::path::Component::ParentDir)
            {
                return Err(MenderError::Config(format!(
                    "{name} must be relative and stay inside the project root"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be > 0");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return fail("retry.max_delay_ms must be >= retry.base_delay_ms");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return fail("retry.jitter_fraction must be within [0, 1]");
        }
        if self.oracle.max_attempts == 0 {
            return fail("oracle.max_attempts must be > 0");
        }
        if self.oracle.timeout_secs == 0 {
            return fail("oracle.timeout_secs must be > 0");
        }
        match self.oracle.kind {
            OracleKind::None => {}
            OracleKind::Command => {
                if self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty() {
                    return fail("oracle.command must be a non-empty array when kind = \"command\"");
                }
            }
            OracleKind::Http => {
                let Some(endpoint) = self
                    .oracle
                    .endpoint
                    .as_deref()
                    .filter(|e| !e.trim().is_empty())
                else {
                    return fail("oracle.endpoint is required when kind = \"http\"");
                };
                if let Err(err) = Url::parse(endpoint) {
                    return Err(MenderError::Config(format!(
                        "oracle.endpoint {endpoint:?} is not a valid URL: {err}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `MenderConfig::default()`. Parse and
/// validation failures are [`MenderError::Config`].
pub fn load_config(path: &Path) -> Result<MenderConfig> {
    if !path.exists() {
        let cfg = MenderConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: MenderConfig = toml::from_str(&contents)
        .map_err(|err| MenderError::Config(format!("parse {}: {err}", path.display())))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &MenderConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
