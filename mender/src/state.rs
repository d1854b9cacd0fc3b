//! Durable pipeline state (`.mender/state/pipeline_state.json`).
//!
//! Every struct defaults field-by-field so older or newer records still load:
//! missing fields take zero values and unknown fields are ignored.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{Drift, UnitReport};

/// Current on-disk record format.
pub const STATE_VERSION: u32 = 1;

/// Aggregate counters across all cycles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub test_passes: u64,
    pub test_failures: u64,
    /// Subset of `test_failures` that were wall-clock timeouts.
    pub test_timeouts: u64,
    pub repair_successes: u64,
    pub repair_failures: u64,
    /// Running mean over every counted test execution.
    pub avg_test_time_secs: f64,
}

impl Metrics {
    pub fn test_runs(&self) -> u64 {
        self.test_passes + self.test_failures
    }
}

/// Inspectable record of the most recent cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// False when shutdown or a fatal error stopped the cycle early.
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub units: Vec<UnitReport>,
    #[serde(default)]
    pub drift: Vec<Drift>,
}

impl CycleSummary {
    pub fn new(cycle: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle,
            started_at,
            finished_at: None,
            complete: false,
            units: Vec::new(),
            drift: Vec::new(),
        }
    }
}

/// The single mutable pipeline record. Only the cycle orchestrator mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineState {
    pub version: u32,
    /// Completed cycles.
    pub cycle_count: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub total_repairs: u64,
    pub total_errors: u64,
    /// Last-known-good SHA-256 per source file (root-relative path).
    pub code_checksums: BTreeMap<String, String>,
    /// Root-relative path of the most recent backup.
    pub last_backup: Option<String>,
    pub metrics: Metrics,
    pub last_cycle: Option<CycleSummary>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            cycle_count: 0,
            last_run: None,
            total_repairs: 0,
            total_errors: 0,
            code_checksums: BTreeMap::new(),
            last_backup: None,
            metrics: Metrics::default(),
            last_cycle: None,
        }
    }
}

impl PipelineState {
    /// Human-readable one-line summary used in logs and `status`.
    pub fn headline(&self) -> String {
        format!(
            "cycles={} repairs={} errors={} passes={} failures={}",
            self.cycle_count,
            self.total_repairs,
            self.total_errors,
            self.metrics.test_passes,
            self.metrics.test_failures
        )
    }
}
