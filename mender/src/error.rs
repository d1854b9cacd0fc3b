//! Typed failures the orchestrator must tell apart.
//!
//! Plumbing uses `anyhow::Result`; these variants travel inside `anyhow::Error`
//! and are recovered with `downcast_ref` where the handling differs.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MenderError {
    /// Retryable infrastructure failure (process spawn, pipe I/O).
    #[error("transient infrastructure failure: {0}")]
    TransientInfra(String),

    /// The repair oracle exhausted its transport retries.
    #[error("repair oracle unavailable after {attempts} attempt(s): {message}")]
    RepairUnavailable { attempts: u32, message: String },

    /// The durable state record exists but cannot be parsed.
    #[error("pipeline state {} is corrupt: {message}", path.display())]
    StateCorruption { path: PathBuf, message: String },

    /// The durable state record could not be committed; continuing is unsafe.
    #[error("failed to persist pipeline state {}: {message}", path.display())]
    FatalStateWrite { path: PathBuf, message: String },

    /// Configuration is missing required values or is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MenderError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, MenderError::FatalStateWrite { .. })
    }
}

/// True when `err` (or anything in its chain) is a fatal store failure.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<MenderError>()
            .is_some_and(MenderError::is_fatal)
    })
}

/// True when `err` (or anything in its chain) is a configuration error.
pub fn is_config_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<MenderError>(),
            Some(MenderError::Config(_))
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn fatal_detection_survives_context() {
        let err: anyhow::Result<()> = Err(MenderError::FatalStateWrite {
            path: PathBuf::from("state.json"),
            message: "disk full".to_string(),
        }
        .into());
        let err = err.context("save after unit").unwrap_err();
        assert!(is_fatal(&err));
        assert!(!is_config_error(&err));
    }

    #[test]
    fn config_errors_are_not_fatal() {
        let err = anyhow::Error::new(MenderError::Config("workers must be > 0".to_string()));
        assert!(is_config_error(&err));
        assert!(!is_fatal(&err));
    }

    #[test]
    fn unavailable_oracle_is_neither_fatal_nor_config() {
        let err = anyhow::Error::new(MenderError::RepairUnavailable {
            attempts: 3,
            message: "503 service unavailable".to_string(),
        });
        assert!(!is_fatal(&err));
        assert!(!is_config_error(&err));
        assert_eq!(
            err.to_string(),
            "repair oracle unavailable after 3 attempt(s): 503 service unavailable"
        );
    }
}
