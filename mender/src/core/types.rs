//! Shared deterministic types for the repair engine.
//!
//! These types define stable contracts between core components and the
//! persisted cycle summaries. They must not depend on I/O.

use serde::{Deserialize, Serialize};

/// Outcome classification of a single test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    /// Assertion or behavioral failure; routed to repair.
    Failed,
    /// Killed after exceeding the wall-clock limit; routed to repair.
    TimedOut,
}

impl TestStatus {
    pub fn is_pass(self) -> bool {
        self == TestStatus::Passed
    }
}

/// Per-unit, per-cycle state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Running,
    Passed,
    Failed,
    Repairing,
    FailedPermanent,
}

impl UnitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitState::Passed | UnitState::FailedPermanent)
    }
}

/// Why a unit ended the cycle in `FailedPermanent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Every repair attempt was spent without a passing re-run.
    AttemptsExhausted,
    /// The oracle exhausted its transport retries.
    RepairUnavailable,
    /// No oracle is configured.
    RepairDisabled,
    /// The source file the test exercises does not exist.
    SourceMissing,
    /// The pre-overwrite backup could not be written.
    BackupFailed,
    /// The test process could not be started within the retry ceiling.
    InfraUnavailable,
    /// Shutdown was requested before the unit finished.
    Interrupted,
}

impl FailureReason {
    /// Whether the failure counts against `repair_failures`.
    pub fn counts_as_repair_failure(self) -> bool {
        matches!(
            self,
            FailureReason::AttemptsExhausted | FailureReason::RepairUnavailable
        )
    }
}

/// A single recorded test execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub status: TestStatus,
    pub duration_secs: f64,
}

/// Final result of driving one unit through the machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    /// Test file, relative to the project root.
    pub path: String,
    /// Source file the test exercises, relative to the project root.
    pub source: String,
    pub state: UnitState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// True when a candidate from the oracle made the test pass.
    #[serde(default)]
    pub repaired: bool,
    /// Oracle calls charged against the attempt ceiling.
    #[serde(default)]
    pub repair_attempts: u32,
    /// Every test execution in order (initial run, then re-verifications).
    #[serde(default)]
    pub runs: Vec<TestRun>,
    /// Backups created while repairing, oldest first.
    #[serde(default)]
    pub backups: Vec<String>,
    /// Source checksum after a passing run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Infrastructure errors absorbed while processing; each counts toward `total_errors`.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl UnitReport {
    pub fn new(path: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            state: UnitState::Pending,
            reason: None,
            repaired: false,
            repair_attempts: 0,
            runs: Vec::new(),
            backups: Vec::new(),
            checksum: None,
            errors: Vec::new(),
        }
    }

    pub fn last_status(&self) -> Option<TestStatus> {
        self.runs.last().map(|run| run.status)
    }
}

/// A source file whose content differs from the last recorded good checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drift {
    pub path: String,
    pub expected: String,
    /// `None` when the file no longer exists.
    pub actual: Option<String>,
}
