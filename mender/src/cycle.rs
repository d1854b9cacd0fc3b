//! One orchestration cycle over every discovered test unit.
//!
//! Workers only run tests and talk to the oracle. Their reports travel over a
//! channel to the calling thread, which is the single writer of
//! [`PipelineState`] and commits it after each unit.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::drift::detect_drift;
use crate::core::metrics::record_unit;
use crate::core::types::{FailureReason, UnitReport, UnitState};
use crate::io::config::{MenderConfig, load_config};
use crate::io::cycle_log::write_cycle_report;
use crate::io::discovery::{TestUnit, discover_units};
use crate::io::events::{EventSink, LogSink, PipelineEvent};
use crate::io::init::MenderPaths;
use crate::io::oracle::{RepairOracle, oracle_from_config};
use crate::io::state_store::StateStore;
use crate::io::test_runner::{CommandTestRunner, TestRunner};
use crate::io::versioning::{FileVersioning, checksum};
use crate::repair::process_unit;
use crate::shutdown::Shutdown;
use crate::state::{CycleSummary, PipelineState};

/// Everything a cycle needs besides the state record.
pub struct Pipeline {
    pub config: MenderConfig,
    pub paths: MenderPaths,
    pub runner: Arc<dyn TestRunner>,
    /// `None` disables repair.
    pub oracle: Option<Arc<dyn RepairOracle>>,
    pub sink: Arc<dyn EventSink>,
    pub versioning: FileVersioning,
    pub shutdown: Shutdown,
}

impl Pipeline {
    pub fn new(config: MenderConfig, paths: MenderPaths, runner: Arc<dyn TestRunner>) -> Self {
        let versioning = FileVersioning::new(&paths.root, &paths.backups_dir);
        Self {
            config,
            paths,
            runner,
            oracle: None,
            sink: Arc::new(LogSink),
            versioning,
            shutdown: Shutdown::new(),
        }
    }

    /// Build the production pipeline for `root` from `.mender/config.toml`.
    pub fn from_root(root: &Path, shutdown: Shutdown) -> Result<Self> {
        let paths = MenderPaths::new(root);
        let config = load_config(&paths.config_path)
            .with_context(|| format!("load {}", paths.config_path.display()))?;
        let runner = Arc::new(CommandTestRunner {
            root: paths.root.clone(),
            command: config.test_command.clone(),
            output_limit_bytes: config.output_limit_bytes,
        });
        let oracle = oracle_from_config(&config, &paths.root)?;
        if oracle.is_none() {
            info!("no repair oracle configured, failing units will not be repaired");
        }
        let mut pipeline = Self::new(config, paths, runner).with_shutdown(shutdown);
        pipeline.oracle = oracle;
        Ok(pipeline)
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn RepairOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Run one cycle, committing `state` through `store` after every unit.
///
/// Per-unit failures are recorded, never returned. Errors come from discovery
/// (non-fatal to a scheduler) or from the store, which carry
/// [`crate::error::MenderError::FatalStateWrite`].
///
/// When shutdown interrupts the cycle the summary is saved with
/// `complete = false` and `cycle_count` is left alone.
#[instrument(skip_all, fields(cycle = state.cycle_count + 1))]
pub fn run_cycle<S: StateStore + ?Sized>(
    pipeline: &Pipeline,
    store: &S,
    state: &mut PipelineState,
) -> Result<CycleSummary> {
    let mut summary = CycleSummary::new(state.cycle_count + 1, Utc::now());
    let units = discover_units(&pipeline.paths.root, &pipeline.config)
        .context("discover test units")?;

    summary.drift = detect_drift(
        &state.code_checksums,
        &current_checksums(&pipeline.paths.root, &state.code_checksums),
    );
    if !summary.drift.is_empty() {
        pipeline.sink.emit(&PipelineEvent::DriftDetected {
            drift: summary.drift.clone(),
        });
    }
    info!(
        units = units.len(),
        workers = pipeline.config.workers,
        "cycle started"
    );

    process_units(pipeline, &units, |report| {
        debug!(unit = %report.path, state = ?report.state, "unit finished");
        record_unit(state, &report);
        summary.units.push(report);
        state.last_cycle = Some(summary.clone());
        store
            .save(state)
            .with_context(|| format!("save state after unit {}", summary.units.len()))
    })?;

    summary.finished_at = Some(Utc::now());
    summary.complete = summary.units.len() == units.len()
        && !summary
            .units
            .iter()
            .any(|unit| unit.reason == Some(FailureReason::Interrupted));
    if summary.complete {
        state.cycle_count += 1;
        state.last_run = summary.finished_at;
    } else {
        warn!(
            finished = summary.units.len(),
            total = units.len(),
            "cycle interrupted"
        );
    }
    state.last_cycle = Some(summary.clone());
    store.save(state).context("save state at end of cycle")?;

    if let Err(err) = write_cycle_report(&pipeline.paths.cycles_dir, &summary) {
        warn!(err = %format!("{err:#}"), "cycle report not written");
    }
    let passed = count(&summary.units, UnitState::Passed);
    pipeline.sink.emit(&PipelineEvent::CycleFinished {
        cycle: summary.cycle,
        complete: summary.complete,
        passed,
        failed: summary.units.len() - passed,
    });
    Ok(summary)
}

/// Fan units out to `config.workers` threads and feed reports to `apply`.
///
/// `apply` runs on the calling thread. Once it fails, no further unit is
/// started; reports from units already in flight are discarded. A single
/// worker runs inline so nothing is in flight when `apply` fails.
fn process_units<F>(pipeline: &Pipeline, units: &[TestUnit], mut apply: F) -> Result<()>
where
    F: FnMut(UnitReport) -> Result<()>,
{
    let workers = pipeline.config.workers.clamp(1, units.len().max(1));
    if workers == 1 {
        let mut rng = rand::thread_rng();
        for unit in units {
            if pipeline.shutdown.is_requested() {
                break;
            }
            apply(process_unit(pipeline, unit, &mut rng))?;
        }
        return Ok(());
    }
    let next = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        let (tx, rx) = mpsc::channel::<UnitReport>();
        for _ in 0..workers {
            let tx = tx.clone();
            let next = &next;
            let stop = &stop;
            scope.spawn(move || {
                let mut rng = rand::thread_rng();
                loop {
                    if stop.load(Ordering::SeqCst) || pipeline.shutdown.is_requested() {
                        break;
                    }
                    let Some(unit) = units.get(next.fetch_add(1, Ordering::SeqCst)) else {
                        break;
                    };
                    if tx.send(process_unit(pipeline, unit, &mut rng)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut result = Ok(());
        for report in rx {
            if result.is_err() {
                continue;
            }
            if let Err(err) = apply(report) {
                stop.store(true, Ordering::SeqCst);
                result = Err(err);
            }
        }
        result
    })
}

/// Current checksums for every recorded source; unreadable files are absent.
fn current_checksums(
    root: &Path,
    recorded: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    recorded
        .keys()
        .filter_map(|key| checksum(&root.join(key)).ok().map(|sum| (key.clone(), sum)))
        .collect()
}

fn count(units: &[UnitReport], state: UnitState) -> usize {
    units.iter().filter(|unit| unit.state == state).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TestStatus;
    use crate::io::events::RecordingSink;
    use crate::io::state_store::FileStateStore;
    use crate::test_support::{
        MemoryStateStore, ScriptedOracle, ScriptedTestRunner, TestProject, fast_config,
    };

    #[test]
    fn empty_project_completes_a_cycle() {
        let project = TestProject::new(fast_config());
        let pipeline = project.pipeline(Arc::new(ScriptedTestRunner::new()));
        let store = MemoryStateStore::default();
        let mut state = PipelineState::default();

        let summary = run_cycle(&pipeline, &store, &mut state).expect("cycle");
        assert!(summary.complete);
        assert_eq!(state.cycle_count, 1);
        assert!(state.last_run.is_some());
        assert_eq!(store.saved().expect("saved").cycle_count, 1);
        assert!(project.paths.cycles_dir.join("000001.json").is_file());
    }

    #[test]
    fn state_is_saved_after_every_unit() {
        let project = TestProject::new(fast_config());
        let a = project.add_unit("a", "a = 1\n");
        let b = project.add_unit("b", "b = 1\n");
        let runner = Arc::new(ScriptedTestRunner::new());
        runner.push(&a.key, TestStatus::Passed);
        runner.push(&b.key, TestStatus::Failed);
        let pipeline = project.pipeline(runner);
        let store = MemoryStateStore::default();
        let mut state = PipelineState::default();

        run_cycle(&pipeline, &store, &mut state).expect("cycle");
        // One save per unit plus the closing save.
        assert_eq!(store.save_count(), 3);
        assert_eq!(state.metrics.test_passes, 1);
        assert_eq!(state.metrics.test_failures, 1);
        assert_eq!(state.metrics.repair_failures, 0);
        assert!(state.code_checksums.contains_key(&a.source_key));
        assert!(!state.code_checksums.contains_key(&b.source_key));
    }

    #[test]
    fn store_failure_stops_the_cycle() {
        let project = TestProject::new(fast_config());
        let a = project.add_unit("a", "a = 1\n");
        let b = project.add_unit("b", "b = 1\n");
        let runner = Arc::new(ScriptedTestRunner::new());
        runner.push(&a.key, TestStatus::Passed);
        runner.push(&b.key, TestStatus::Passed);
        let pipeline = project.pipeline(runner.clone());
        let store = MemoryStateStore::failing();
        let mut state = PipelineState::default();

        let err = run_cycle(&pipeline, &store, &mut state).unwrap_err();
        assert!(crate::error::is_fatal(&err));
        assert_eq!(state.cycle_count, 0);
        assert_eq!(runner.runs(&b.key), 0);
    }

    #[test]
    fn shutdown_leaves_the_cycle_incomplete() {
        let project = TestProject::new(fast_config());
        project.add_unit("a", "a = 1\n");
        let pipeline = project.pipeline(Arc::new(ScriptedTestRunner::new()));
        pipeline.shutdown.request();
        let store = MemoryStateStore::default();
        let mut state = PipelineState::default();

        let summary = run_cycle(&pipeline, &store, &mut state).expect("cycle");
        assert!(!summary.complete);
        assert!(summary.units.is_empty());
        assert_eq!(state.cycle_count, 0);
        let saved = store.saved().expect("saved");
        assert_eq!(saved.last_cycle.map(|cycle| cycle.complete), Some(false));
    }

    #[test]
    fn shutdown_mid_repair_restores_source_and_saves_incomplete_cycle() {
        let project = TestProject::new(fast_config());
        let a = project.add_unit("a", "a = 0\n");
        let b = project.add_unit("b", "b = 1\n");
        let runner = Arc::new(ScriptedTestRunner::new());
        runner.push(&a.key, TestStatus::Failed);
        runner.push(&a.key, TestStatus::Failed);
        runner.push(&b.key, TestStatus::Passed);
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_candidate("a = 'guess'\n");
        let sink = Arc::new(RecordingSink::default());
        let pipeline = project
            .pipeline(runner.clone())
            .with_oracle(oracle)
            .with_sink(sink.clone());
        runner.shutdown_during(&a.key, 2, &pipeline.shutdown);
        let store = MemoryStateStore::with_state(PipelineState {
            cycle_count: 7,
            ..PipelineState::default()
        });
        let mut state = store.saved().expect("seeded");

        let summary = run_cycle(&pipeline, &store, &mut state).expect("cycle");
        assert!(!summary.complete);
        assert_eq!(summary.units.len(), 1);
        assert_eq!(summary.units[0].reason, Some(FailureReason::Interrupted));
        assert_eq!(project.read(&a.source), "a = 0\n");
        assert_eq!(runner.runs(&b.key), 0);

        let saved = store.saved().expect("saved");
        assert_eq!(saved.cycle_count, 7);
        assert!(saved.last_run.is_none());
        assert_eq!(saved.last_cycle.map(|cycle| cycle.complete), Some(false));
        assert_eq!(saved.metrics.repair_failures, 0);
        assert!(matches!(
            sink.events().as_slice(),
            [PipelineEvent::CycleFinished { complete: false, .. }]
        ));
    }

    #[test]
    fn drift_is_detected_for_changed_sources() {
        let project = TestProject::new(fast_config());
        let a = project.add_unit("a", "a = 1\n");
        let runner = Arc::new(ScriptedTestRunner::new());
        runner.push(&a.key, TestStatus::Passed);
        runner.push(&a.key, TestStatus::Passed);
        let pipeline = project.pipeline(runner);
        let store = FileStateStore::new(&project.paths.state_path);
        let mut state = PipelineState::default();

        let first = run_cycle(&pipeline, &store, &mut state).expect("first cycle");
        assert!(first.drift.is_empty());
        std::fs::write(&a.source, "a = 2\n").expect("edit source");
        let second = run_cycle(&pipeline, &store, &mut state).expect("second cycle");
        assert_eq!(second.drift.len(), 1);
        assert_eq!(second.drift[0].path, a.source_key);
        assert_eq!(state.cycle_count, 2);
    }

    #[test]
    fn workers_process_every_unit_once() {
        let mut config = fast_config();
        config.workers = 3;
        let project = TestProject::new(config);
        let runner = Arc::new(ScriptedTestRunner::new());
        let oracle = Arc::new(ScriptedOracle::new());
        let units: Vec<_> = (0..6)
            .map(|n| project.add_unit(&format!("u{n}"), "x = 0\n"))
            .collect();
        for unit in &units {
            runner.push(&unit.key, TestStatus::Passed);
        }
        let pipeline = project.pipeline(runner.clone()).with_oracle(oracle.clone());
        let store = MemoryStateStore::default();
        let mut state = PipelineState::default();

        let summary = run_cycle(&pipeline, &store, &mut state).expect("cycle");
        assert_eq!(summary.units.len(), 6);
        assert!(units.iter().all(|unit| runner.runs(&unit.key) == 1));
        assert_eq!(state.metrics.test_passes, 6);
        assert_eq!(oracle.calls(), 0);
    }
}
