//! Durable storage for [`PipelineState`].
//!
//! The file store commits with temp file + fsync + rename, so a reader sees
//! either the previous record or the new one, never a partial write.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::MenderError;
use crate::state::PipelineState;

/// Injected persistence for the pipeline record. The orchestrator is its only writer.
pub trait StateStore {
    /// Read the record. Absent means fresh state; unparsable is
    /// [`MenderError::StateCorruption`].
    fn load(&self) -> Result<PipelineState>;

    /// Durably commit `state`. Failure is [`MenderError::FatalStateWrite`].
    fn save(&self, state: &PipelineState) -> Result<()>;

    /// Move a corrupt record aside, returning where it went (if anywhere).
    fn quarantine(&self) -> Result<Option<PathBuf>>;
}

/// JSON file store at `.mender/state/pipeline_state.json`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<PipelineState> {
        debug!(path = %self.path.display(), "loading pipeline state");
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no pipeline state yet, starting fresh");
                return Ok(PipelineState::default());
            }
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                return Err(MenderError::StateCorruption {
                    path: self.path.clone(),
                    message: err.to_string(),
                }
                .into());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };
        let state: PipelineState =
            serde_json::from_str(&contents).map_err(|err| MenderError::StateCorruption {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        debug!(cycle_count = state.cycle_count, "pipeline state loaded");
        Ok(state)
    }

    fn save(&self, state: &PipelineState) -> Result<()> {
        debug!(path = %self.path.display(), cycle_count = state.cycle_count, "saving pipeline state");
        let mut buf = serde_json::to_string_pretty(state).context("serialize pipeline state")?;
        buf.push('\n');
        write_atomic(&self.path, buf.as_bytes()).map_err(|err| {
            MenderError::FatalStateWrite {
                path: self.path.clone(),
                message: format!("{err:#}"),
            }
            .into()
        })
    }

    fn quarantine(&self) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%.3f");
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pipeline_state.json".to_string());
        let mut target = self.path.with_file_name(format!("{file_name}.corrupt-{stamp}"));
        let mut n = 1;
        while target.exists() {
            target = self
                .path
                .with_file_name(format!("{file_name}.corrupt-{stamp}-{n}"));
            n += 1;
        }
        fs::rename(&self.path, &target).with_context(|| {
            format!("quarantine {} -> {}", self.path.display(), target.display())
        })?;
        Ok(Some(target))
    }
}

/// Load state, quarantining a corrupt record and continuing with a fresh one.
pub fn load_or_recover<S: StateStore + ?Sized>(store: &S) -> Result<PipelineState> {
    match store.load() {
        Ok(state) => Ok(state),
        Err(err)
            if matches!(
                err.downcast_ref::<MenderError>(),
                Some(MenderError::StateCorruption { .. })
            ) =>
        {
            let moved = store.quarantine().context("quarantine corrupt pipeline state")?;
            warn!(err = %err, quarantined = ?moved, "pipeline state corrupt, starting fresh");
            Ok(PipelineState::default())
        }
        Err(err) => Err(err),
    }
}

/// Write `contents` to `path` via a synced temp file and rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("create temp file {}", tmp_path.display()))?;
        file.write_all(contents)
            .with_context(|| format!("write temp file {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync temp file {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    sync_dir(parent);
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    // Persists the rename itself; best effort since some filesystems refuse it.
    if let Err(err) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), err = %err, "directory sync skipped");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{TestRun, TestStatus, UnitReport, UnitState};
    use crate::state::{CycleSummary, Metrics};

    fn populated_state() -> PipelineState {
        let mut unit = UnitReport::new("src/tests/test_a.py", "src/a.py");
        unit.state = UnitState::Passed;
        unit.runs.push(TestRun {
            status: TestStatus::Passed,
            duration_secs: 0.25,
        });
        let mut summary = CycleSummary::new(4, Utc::now());
        summary.finished_at = Some(Utc::now());
        summary.complete = true;
        summary.units.push(unit);

        PipelineState {
            cycle_count: 4,
            last_run: Some(Utc::now()),
            total_repairs: 2,
            total_errors: 1,
            code_checksums: [("src/a.py".to_string(), "deadbeef".to_string())].into(),
            last_backup: Some(".mender/backups/src/a.py".to_string()),
            metrics: Metrics {
                test_passes: 7,
                test_failures: 3,
                test_timeouts: 1,
                repair_successes: 2,
                repair_failures: 1,
                avg_test_time_secs: 0.5,
            },
            last_cycle: Some(summary),
            ..PipelineState::default()
        }
    }

    #[test]
    fn state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(temp.path().join("state/pipeline_state.json"));
        let state = populated_state();
        store.save(&state).expect("save");
        assert_eq!(store.load().expect("load"), state);
    }

    #[test]
    fn missing_file_is_fresh_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(temp.path().join("pipeline_state.json"));
        assert_eq!(store.load().expect("load"), PipelineState::default());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pipeline_state.json");
        let store = FileStateStore::new(&path);
        store.save(&PipelineState::default()).expect("save");
        store.save(&populated_state()).expect("save again");
        let names: Vec<String> = fs::read_dir(temp.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["pipeline_state.json".to_string()]);
    }

    #[test]
    fn stale_temp_file_does_not_affect_reads() {
        // A crash between temp write and rename leaves the old record intact.
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pipeline_state.json");
        let store = FileStateStore::new(&path);
        let state = populated_state();
        store.save(&state).expect("save");
        fs::write(temp.path().join(".pipeline_state.json.tmp"), "{\"cycle_cou").expect("write");
        assert_eq!(store.load().expect("load"), state);
        store.save(&PipelineState::default()).expect("save over stale temp");
        assert_eq!(store.load().expect("load"), PipelineState::default());
    }

    #[test]
    fn unknown_and_missing_fields_are_tolerated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pipeline_state.json");
        fs::write(
            &path,
            r#"{"cycle_count": 9, "future_field": {"x": 1}, "metrics": {"test_passes": 3}}"#,
        )
        .expect("write");
        let state = FileStateStore::new(&path).load().expect("load");
        assert_eq!(state.cycle_count, 9);
        assert_eq!(state.metrics.test_passes, 3);
        assert_eq!(state.total_repairs, 0);
    }

    #[test]
    fn corrupt_file_is_reported_then_quarantined() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pipeline_state.json");
        fs::write(&path, "{ not json").expect("write");
        let store = FileStateStore::new(&path);

        let err = store.load().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MenderError>(),
            Some(MenderError::StateCorruption { .. })
        ));

        let state = load_or_recover(&store).expect("recover");
        assert_eq!(state, PipelineState::default());
        assert!(!path.exists());
        let quarantined: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .map(|e| e.expect("entry").path())
            .filter(|p| p.to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(fs::read_to_string(&quarantined[0]).expect("read"), "{ not json");
    }

    #[test]
    fn unwritable_location_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("state");
        fs::write(&blocker, "not a directory").expect("write");
        let store = FileStateStore::new(blocker.join("pipeline_state.json"));
        let err = store.save(&PipelineState::default()).unwrap_err();
        assert!(crate::error::is_fatal(&err));
    }
}
