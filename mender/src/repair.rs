//! Drive one test unit through run, repair and verification.
//!
//! [`process_unit`] never fails: every outcome, including infrastructure
//! trouble, ends up in the returned [`UnitReport`]. Source files are only
//! overwritten after a successful backup, and a unit that ends permanently
//! failed has its original source put back.

use std::fs;

use rand::Rng;
use tracing::{debug, error, info, instrument, warn};

use crate::core::machine::{TransitionError, UnitEvent, UnitMachine};
use crate::core::types::{FailureReason, TestRun, UnitReport, UnitState};
use crate::cycle::Pipeline;
use crate::error::MenderError;
use crate::io::discovery::TestUnit;
use crate::io::events::PipelineEvent;
use crate::io::oracle::{OracleError, RepairRequest, bound_diagnostic, repair_with_retry};
use crate::io::test_runner::{TestOutcome, run_test_with_retry};
use crate::io::versioning::{BackupHandle, checksum};

/// Why the driver stopped early.
enum Halt {
    Abandon(FailureReason),
    Illegal(TransitionError),
}

impl From<TransitionError> for Halt {
    fn from(err: TransitionError) -> Self {
        Halt::Illegal(err)
    }
}

/// Run `unit`'s test and, if it fails, attempt bounded repair.
#[instrument(skip_all, fields(unit = %unit.key))]
pub fn process_unit<R: Rng + ?Sized>(
    pipeline: &Pipeline,
    unit: &TestUnit,
    rng: &mut R,
) -> UnitReport {
    let mut driver = UnitDriver {
        pipeline,
        unit,
        rng,
        machine: UnitMachine::new(pipeline.config.max_repair_attempts),
        report: UnitReport::new(&unit.key, &unit.source_key),
        first_backup: None,
    };
    let result = driver.drive();
    driver.finish(result)
}

struct UnitDriver<'a, R: Rng + ?Sized> {
    pipeline: &'a Pipeline,
    unit: &'a TestUnit,
    rng: &'a mut R,
    machine: UnitMachine,
    report: UnitReport,
    /// Snapshot of the source as it was before the first candidate was written.
    first_backup: Option<BackupHandle>,
}

impl<R: Rng + ?Sized> UnitDriver<'_, R> {
    fn drive(&mut self) -> Result<(), Halt> {
        self.machine.apply(UnitEvent::Run)?;
        let outcome = self.run_test()?;
        if self.machine.apply(UnitEvent::Tested(outcome.status))? == UnitState::Passed {
            self.record_checksum();
            return Ok(());
        }
        debug!(status = ?outcome.status, "test failed");

        let Some(oracle) = self.pipeline.oracle.clone() else {
            info!("repair disabled, leaving unit failed");
            return Err(Halt::Abandon(FailureReason::RepairDisabled));
        };
        if !self.unit.source.is_file() {
            warn!(source = %self.unit.source_key, "source file missing");
            return Err(Halt::Abandon(FailureReason::SourceMissing));
        }

        let limit = self.pipeline.config.oracle.diagnostic_limit_bytes;
        let policy = self.pipeline.config.oracle_policy();
        let mut diagnostic = outcome.output;
        loop {
            if self.pipeline.shutdown.is_requested() {
                return Err(Halt::Abandon(FailureReason::Interrupted));
            }
            if self.machine.apply(UnitEvent::Repair)? == UnitState::FailedPermanent {
                return Ok(());
            }
            let attempt = self.machine.attempts();
            self.report.repair_attempts = attempt;

            let source = fs::read_to_string(&self.unit.source).map_err(|err| {
                self.report
                    .errors
                    .push(format!("read {}: {err}", self.unit.source_key));
                Halt::Abandon(FailureReason::SourceMissing)
            })?;
            let request = RepairRequest {
                path: self.unit.source_key.clone(),
                source,
                diagnostic: bound_diagnostic(&diagnostic, limit),
            };
            info!(attempt, "requesting repair");
            let result = match repair_with_retry(
                oracle.as_ref(),
                &request,
                &policy,
                &self.pipeline.shutdown,
                &mut *self.rng,
            ) {
                Ok(result) => result,
                Err(exhausted) if exhausted.interrupted => {
                    return Err(Halt::Abandon(FailureReason::Interrupted));
                }
                Err(exhausted) => match exhausted.last {
                    OracleError::Unavailable(message) => {
                        let err = MenderError::RepairUnavailable {
                            attempts: exhausted.attempts,
                            message,
                        };
                        warn!(%err, "giving up on repair");
                        return Err(Halt::Abandon(FailureReason::RepairUnavailable));
                    }
                    OracleError::Malformed(message) => {
                        warn!(attempt, %message, "oracle answer unusable");
                        self.machine.apply(UnitEvent::NoCandidate)?;
                        continue;
                    }
                },
            };
            let Some(candidate) = result.candidate() else {
                info!(attempt, rationale = %result.rationale, "oracle offered no candidate");
                self.machine.apply(UnitEvent::NoCandidate)?;
                continue;
            };

            self.apply_candidate(candidate)?;
            self.machine.apply(UnitEvent::Run)?;
            let outcome = self.run_test()?;
            if self.machine.apply(UnitEvent::Tested(outcome.status))? == UnitState::Passed {
                self.report.repaired = true;
                self.record_checksum();
                info!(attempt, "candidate verified");
                self.pipeline.sink.emit(&PipelineEvent::RepairSucceeded {
                    unit: self.unit.key.clone(),
                    attempts: attempt,
                });
                return Ok(());
            }
            info!(attempt, status = ?outcome.status, "candidate rejected by test");
            diagnostic = outcome.output;
        }
    }

    /// Back up the current source, then overwrite it with `candidate`.
    fn apply_candidate(&mut self, candidate: &str) -> Result<(), Halt> {
        let handle = match self.pipeline.versioning.backup(&self.unit.source) {
            Ok(handle) => handle,
            Err(err) => {
                error!(err = %format!("{err:#}"), "backup failed, not applying candidate");
                self.report.errors.push(format!("backup: {err:#}"));
                return Err(Halt::Abandon(FailureReason::BackupFailed));
            }
        };
        self.report.backups.push(handle.key.clone());
        if self.first_backup.is_none() {
            self.first_backup = Some(handle);
        }
        if let Err(err) = self.pipeline.versioning.write_source(&self.unit.source, candidate) {
            error!(err = %format!("{err:#}"), "writing candidate failed");
            self.report.errors.push(format!("write source: {err:#}"));
            return Err(Halt::Abandon(FailureReason::InfraUnavailable));
        }
        Ok(())
    }

    fn run_test(&mut self) -> Result<TestOutcome, Halt> {
        let config = &self.pipeline.config;
        match run_test_with_retry(
            self.pipeline.runner.as_ref(),
            self.unit,
            config.test_timeout(),
            &config.retry.policy(),
            &self.pipeline.shutdown,
            &mut *self.rng,
        ) {
            Ok(outcome) => {
                self.report.runs.push(TestRun {
                    status: outcome.status,
                    duration_secs: outcome.duration.as_secs_f64(),
                });
                Ok(outcome)
            }
            Err(exhausted) if exhausted.interrupted => {
                Err(Halt::Abandon(FailureReason::Interrupted))
            }
            Err(exhausted) => {
                error!(
                    attempts = exhausted.attempts,
                    err = %format!("{:#}", exhausted.last),
                    "test could not be run"
                );
                self.report
                    .errors
                    .push(format!("run {}: {:#}", self.unit.key, exhausted.last));
                Err(Halt::Abandon(FailureReason::InfraUnavailable))
            }
        }
    }

    fn record_checksum(&mut self) {
        match checksum(&self.unit.source) {
            Ok(sum) => self.report.checksum = Some(sum),
            Err(err) => debug!(err = %format!("{err:#}"), "no checksum for passing unit"),
        }
    }

    fn finish(mut self, result: Result<(), Halt>) -> UnitReport {
        match result {
            Ok(()) => {}
            Err(Halt::Abandon(reason)) => {
                if let Err(err) = self.machine.apply(UnitEvent::Abandon(reason)) {
                    error!(%err, "cannot abandon unit");
                }
            }
            Err(Halt::Illegal(err)) => {
                error!(%err, "unit state machine rejected a transition");
                self.report.errors.push(err.to_string());
                let _ = self
                    .machine
                    .apply(UnitEvent::Abandon(FailureReason::InfraUnavailable));
            }
        }
        self.report.state = self.machine.state();
        self.report.reason = self.machine.reason();

        if self.report.state == UnitState::FailedPermanent {
            self.restore_original();
            let reason = self.report.reason.unwrap_or(FailureReason::InfraUnavailable);
            // An interrupted unit is retried next cycle; nothing to notify.
            if reason != FailureReason::Interrupted {
                self.pipeline.sink.emit(&PipelineEvent::FailedPermanent {
                    unit: self.unit.key.clone(),
                    reason,
                    attempts: self.report.repair_attempts,
                });
            }
        }
        self.report
    }

    /// Put the pre-repair source back if any candidate was written.
    fn restore_original(&mut self) {
        let Some(handle) = self.first_backup.take() else {
            return;
        };
        match self.pipeline.versioning.restore(&handle) {
            Ok(displaced) => {
                info!(backup = %handle.key, "original source restored");
                self.report.backups.push(displaced.key);
            }
            Err(err) => {
                error!(err = %format!("{err:#}"), "restoring original source failed");
                self.report.errors.push(format!("restore: {err:#}"));
            }
        }
    }
}
