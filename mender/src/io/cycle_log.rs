//! Per-cycle audit records under `.mender/cycles/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::io::state_store::write_atomic;
use crate::state::CycleSummary;

/// Path of the report for `cycle`, zero-padded so listings sort by cycle.
pub fn cycle_report_path(cycles_dir: &Path, cycle: u64) -> PathBuf {
    cycles_dir.join(format!("{cycle:06}.json"))
}

/// Write `summary` as pretty JSON. Rewrites the same cycle's report if it exists.
pub fn write_cycle_report(cycles_dir: &Path, summary: &CycleSummary) -> Result<PathBuf> {
    let path = cycle_report_path(cycles_dir, summary.cycle);
    let mut buf = serde_json::to_string_pretty(summary).context("serialize cycle report")?;
    buf.push('\n');
    write_atomic(&path, buf.as_bytes())
        .with_context(|| format!("write cycle report {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn report_is_written_and_parsable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let summary = CycleSummary::new(12, Utc::now());
        let path = write_cycle_report(&temp.path().join("cycles"), &summary).expect("write");
        assert!(path.ends_with("000012.json"));
        let parsed: CycleSummary =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(parsed, summary);
    }
}
