//! `mender status`: read-only view of the pipeline record.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::types::UnitState;
use crate::io::init::MenderPaths;
use crate::io::state_store::{FileStateStore, StateStore};
use crate::state::PipelineState;

/// Load the state record without repairing or quarantining it.
pub fn load_status(root: &Path) -> Result<PipelineState> {
    let paths = MenderPaths::new(root);
    FileStateStore::new(&paths.state_path)
        .load()
        .with_context(|| format!("load {}", paths.state_path.display()))
}

/// Pretty JSON of the full record.
pub fn render_json(state: &PipelineState) -> Result<String> {
    serde_json::to_string_pretty(state).context("serialize pipeline state")
}

/// Human-readable summary: totals, metrics and the last cycle's units.
pub fn render_summary(state: &PipelineState) -> String {
    let rule = "=".repeat(60);
    let last_run = state
        .last_run
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    let m = &state.metrics;
    let mut lines = vec![
        rule.clone(),
        "PIPELINE SUMMARY".to_string(),
        rule.clone(),
        format!("Total cycles:      {}", state.cycle_count),
        format!("Total repairs:     {}", state.total_repairs),
        format!("Total errors:      {}", state.total_errors),
        format!("Last run:          {last_run}"),
    ];
    if let Some(backup) = &state.last_backup {
        lines.push(format!("Last backup:       {backup}"));
    }
    lines.extend([
        String::new(),
        "Metrics:".to_string(),
        format!("  test_passes:        {}", m.test_passes),
        format!("  test_failures:      {}", m.test_failures),
        format!("  test_timeouts:      {}", m.test_timeouts),
        format!("  repair_successes:   {}", m.repair_successes),
        format!("  repair_failures:    {}", m.repair_failures),
        format!("  avg_test_time_secs: {:.3}", m.avg_test_time_secs),
    ]);

    if let Some(cycle) = &state.last_cycle {
        let status = if cycle.complete { "complete" } else { "incomplete" };
        lines.push(String::new());
        lines.push(format!("Last cycle #{} ({status}):", cycle.cycle));
        for unit in &cycle.units {
            let mut line = format!("  {:<16} {}", state_label(unit.state), unit.path);
            if let Some(reason) = unit.reason {
                line.push_str(&format!(" ({reason:?})"));
            }
            if unit.repaired {
                line.push_str(" [repaired]");
            }
            lines.push(line);
        }
        for drift in &cycle.drift {
            lines.push(format!("  drift            {}", drift.path));
        }
    }
    lines.push(rule);
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn state_label(state: UnitState) -> &'static str {
    match state {
        UnitState::Pending => "pending",
        UnitState::Running => "running",
        UnitState::Passed => "passed",
        UnitState::Failed => "failed",
        UnitState::Repairing => "repairing",
        UnitState::FailedPermanent => "failed_permanent",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FailureReason, UnitReport};
    use crate::state::CycleSummary;
    use chrono::Utc;

    #[test]
    fn fresh_root_reports_empty_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = load_status(temp.path()).expect("status");
        assert_eq!(state, PipelineState::default());
        assert!(render_summary(&state).contains("Last run:          never"));
    }

    #[test]
    fn summary_lists_last_cycle_units() {
        let mut state = PipelineState::default();
        let mut cycle = CycleSummary::new(4, Utc::now());
        cycle.complete = true;
        let mut repaired = UnitReport::new("src/tests/test_b.py", "src/b.py");
        repaired.state = UnitState::Passed;
        repaired.repaired = true;
        let mut failed = UnitReport::new("src/tests/test_c.py", "src/c.py");
        failed.state = UnitState::FailedPermanent;
        failed.reason = Some(FailureReason::AttemptsExhausted);
        cycle.units = vec![repaired, failed];
        state.last_cycle = Some(cycle);

        let text = render_summary(&state);
        assert!(text.contains("Last cycle #4 (complete)"));
        assert!(text.contains("src/tests/test_b.py [repaired]"));
        assert!(text.contains("failed_permanent src/tests/test_c.py (AttemptsExhausted)"));
    }

    #[test]
    fn json_output_parses_back() {
        let state = PipelineState::default();
        let json = render_json(&state).expect("json");
        let parsed: PipelineState = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, state);
    }
}
