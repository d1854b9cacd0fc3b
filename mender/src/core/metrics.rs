//! Folding unit reports into the aggregate pipeline record.

use crate::core::types::{TestStatus, UnitReport, UnitState};
use crate::state::{Metrics, PipelineState};

/// Count one test execution and update the running mean duration.
pub fn record_run(metrics: &mut Metrics, status: TestStatus, duration_secs: f64) {
    match status {
        TestStatus::Passed => metrics.test_passes += 1,
        TestStatus::Failed => metrics.test_failures += 1,
        TestStatus::TimedOut => {
            metrics.test_failures += 1;
            metrics.test_timeouts += 1;
        }
    }
    let total = metrics.test_runs() as f64;
    metrics.avg_test_time_secs += (duration_secs - metrics.avg_test_time_secs) / total;
}

/// Apply a finished unit to `state`. Counters only ever grow.
pub fn record_unit(state: &mut PipelineState, report: &UnitReport) {
    for run in &report.runs {
        record_run(&mut state.metrics, run.status, run.duration_secs);
    }
    if report.repaired {
        state.total_repairs += 1;
        state.metrics.repair_successes += 1;
    }
    if report.state == UnitState::FailedPermanent
        && report
            .reason
            .is_some_and(|reason| reason.counts_as_repair_failure())
    {
        state.metrics.repair_failures += 1;
    }
    state.total_errors += report.errors.len() as u64;
    if let Some(backup) = report.backups.last() {
        state.last_backup = Some(backup.clone());
    }
    if report.state == UnitState::Passed
        && let Some(checksum) = &report.checksum
    {
        state
            .code_checksums
            .insert(report.source.clone(), checksum.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FailureReason, TestRun};

    fn run(status: TestStatus, secs: f64) -> TestRun {
        TestRun {
            status,
            duration_secs: secs,
        }
    }

    #[test]
    fn running_mean_matches_arithmetic_mean() {
        let mut metrics = Metrics::default();
        record_run(&mut metrics, TestStatus::Passed, 1.0);
        record_run(&mut metrics, TestStatus::Failed, 2.0);
        record_run(&mut metrics, TestStatus::TimedOut, 6.0);
        assert_eq!(metrics.test_passes, 1);
        assert_eq!(metrics.test_failures, 2);
        assert_eq!(metrics.test_timeouts, 1);
        assert!((metrics.avg_test_time_secs - 3.0).abs() < 1e-9);
    }

    #[test]
    fn repaired_unit_updates_counters_and_checksum() {
        let mut state = PipelineState::default();
        let mut report = UnitReport::new("tests/test_a.py", "src/a.py");
        report.state = UnitState::Passed;
        report.repaired = true;
        report.repair_attempts = 1;
        report.runs = vec![run(TestStatus::Failed, 0.5), run(TestStatus::Passed, 0.5)];
        report.backups = vec![".mender/backups/src/a.1.py".to_string()];
        report.checksum = Some("abc".to_string());

        record_unit(&mut state, &report);

        assert_eq!(state.total_repairs, 1);
        assert_eq!(state.metrics.repair_successes, 1);
        assert_eq!(state.metrics.repair_failures, 0);
        assert_eq!(state.metrics.test_passes, 1);
        assert_eq!(state.metrics.test_failures, 1);
        assert_eq!(
            state.last_backup.as_deref(),
            Some(".mender/backups/src/a.1.py")
        );
        assert_eq!(
            state.code_checksums.get("src/a.py").map(String::as_str),
            Some("abc")
        );
    }

    #[test]
    fn disabled_repair_is_not_a_repair_failure() {
        let mut state = PipelineState::default();
        let mut report = UnitReport::new("tests/test_b.py", "src/b.py");
        report.state = UnitState::FailedPermanent;
        report.reason = Some(FailureReason::RepairDisabled);
        report.runs = vec![run(TestStatus::Failed, 0.1)];

        record_unit(&mut state, &report);
        assert_eq!(state.metrics.repair_failures, 0);
        assert!(state.code_checksums.is_empty());

        report.reason = Some(FailureReason::AttemptsExhausted);
        record_unit(&mut state, &report);
        assert_eq!(state.metrics.repair_failures, 1);
    }

    #[test]
    fn absorbed_errors_accumulate() {
        let mut state = PipelineState::default();
        let mut report = UnitReport::new("tests/test_c.py", "src/c.py");
        report.state = UnitState::FailedPermanent;
        report.reason = Some(FailureReason::InfraUnavailable);
        report.errors = vec!["spawn failed".to_string()];
        record_unit(&mut state, &report);
        record_unit(&mut state, &report);
        assert_eq!(state.total_errors, 2);
    }
}
