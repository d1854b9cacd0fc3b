//! Repair oracle abstraction.
//!
//! The oracle is a black box: given the failing source and the test
//! diagnostics it may return a candidate replacement. A candidate is only a
//! proposal; the repair machine decides correctness by re-running the test.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::io::config::{MenderConfig, OracleKind};
use crate::io::http_oracle::HttpOracle;
use crate::io::process::run_command_with_timeout;
use crate::retry::{RetryExhausted, RetryPolicy, Sleeper, retry_with_backoff};

/// What the oracle is asked to fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRequest {
    /// Root-relative path of the source file.
    pub path: String,
    pub source: String,
    pub diagnostic: String,
}

/// The oracle's answer. `success` with no `new_source` counts as no candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairResult {
    pub success: bool,
    #[serde(default)]
    pub new_source: Option<String>,
    #[serde(default)]
    pub rationale: String,
}

impl RepairResult {
    /// The replacement source, if this result actually proposes one.
    pub fn candidate(&self) -> Option<&str> {
        if self.success {
            self.new_source.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    /// Network, auth, overload or process failures; retried with backoff.
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    /// The oracle answered with something unusable; not retried.
    #[error("oracle response malformed: {0}")]
    Malformed(String),
}

impl OracleError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OracleError::Unavailable(_))
    }
}

/// A code-repair capability.
pub trait RepairOracle: Send + Sync {
    fn repair(&self, request: &RepairRequest) -> Result<RepairResult, OracleError>;
}

/// Call the oracle, retrying transport failures within `policy`.
pub fn repair_with_retry<O, S, R>(
    oracle: &O,
    request: &RepairRequest,
    policy: &RetryPolicy,
    sleeper: &S,
    rng: &mut R,
) -> Result<RepairResult, RetryExhausted<OracleError>>
where
    O: RepairOracle + ?Sized,
    S: Sleeper + ?Sized,
    R: Rng + ?Sized,
{
    retry_with_backoff(policy, sleeper, rng, OracleError::is_retryable, |attempt| {
        debug!(attempt, path = %request.path, "calling repair oracle");
        oracle.repair(request)
    })
}

/// Cut `text` to at most `limit` bytes on a char boundary, keeping the tail.
pub fn bound_diagnostic(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... {start} bytes elided]\n{}", &text[start..])
}

/// Spawns an external fixer: JSON [`RepairRequest`] on stdin, JSON
/// [`RepairResult`] on stdout.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    pub workdir: PathBuf,
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl RepairOracle for CommandOracle {
    #[instrument(skip_all, fields(path = %request.path))]
    fn repair(&self, request: &RepairRequest) -> Result<RepairResult, OracleError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| OracleError::Unavailable("oracle command is empty".to_string()))?;
        let payload = serde_json::to_vec(request)
            .map_err(|err| OracleError::Malformed(format!("serialize request: {err}")))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);

        let output =
            run_command_with_timeout(cmd, Some(&payload), self.timeout, self.output_limit_bytes)
                .map_err(|err| OracleError::Unavailable(format!("{err:#}")))?;
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "oracle command timed out");
            return Err(OracleError::Unavailable(format!(
                "oracle command timed out after {:?}",
                self.timeout
            )));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "oracle command failed");
            return Err(OracleError::Unavailable(format!(
                "oracle command exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if output.stdout_truncated > 0 {
            return Err(OracleError::Malformed(format!(
                "oracle output exceeded {} bytes",
                self.output_limit_bytes
            )));
        }
        let result: RepairResult = serde_json::from_slice(&output.stdout)
            .map_err(|err| OracleError::Malformed(format!("parse oracle output: {err}")))?;
        info!(success = result.success, "oracle answered");
        Ok(result)
    }
}

/// Build the oracle described by `cfg`, or `None` when repair is disabled.
///
/// An HTTP oracle whose credential variable is unset disables repair with a
/// warning instead of failing startup.
pub fn oracle_from_config(
    cfg: &MenderConfig,
    root: &std::path::Path,
) -> Result<Option<Arc<dyn RepairOracle>>> {
    let timeout = Duration::from_secs(cfg.oracle.timeout_secs);
    match cfg.oracle.kind {
        OracleKind::None => Ok(None),
        OracleKind::Command => Ok(Some(Arc::new(CommandOracle {
            workdir: root.to_path_buf(),
            command: cfg.oracle.command.clone(),
            timeout,
            // Candidates are whole source files; give them room.
            output_limit_bytes: cfg.output_limit_bytes.max(1_000_000),
        }))),
        OracleKind::Http => {
            let endpoint = cfg
                .oracle
                .endpoint
                .as_deref()
                .ok_or_else(|| anyhow!("oracle.endpoint is required"))?;
            let api_key = match &cfg.oracle.api_key_env {
                Some(var) => match std::env::var(var) {
                    Ok(value) if !value.trim().is_empty() => Some(value),
                    _ => {
                        warn!(var, "oracle credential not set, repair disabled");
                        return Ok(None);
                    }
                },
                None => None,
            };
            let oracle = HttpOracle::new(endpoint, api_key, timeout).context("build http oracle")?;
            Ok(Some(Arc::new(oracle)))
        }
    }
}
