//! Test-only doubles: scripted test runner and oracle, an in-memory state
//! store, and a throwaway project directory.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::types::TestStatus;
use crate::cycle::Pipeline;
use crate::error::MenderError;
use crate::io::config::{MenderConfig, write_config};
use crate::io::discovery::TestUnit;
use crate::io::init::{InitOptions, MenderPaths, init_project};
use crate::io::oracle::{OracleError, RepairOracle, RepairRequest, RepairResult};
use crate::io::state_store::StateStore;
use crate::io::test_runner::{TestOutcome, TestRunner};
use crate::shutdown::Shutdown;
use crate::state::PipelineState;

/// Defaults with millisecond backoff so retry paths run quickly.
pub fn fast_config() -> MenderConfig {
    let mut config = MenderConfig::default();
    config.test_timeout_secs = 5;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.retry.jitter_fraction = 0.0;
    config.oracle.max_attempts = 3;
    config
}

#[derive(Debug, Clone)]
enum ScriptedRun {
    Status(TestStatus),
    /// Fails to start; carries [`MenderError::TransientInfra`].
    InfraError(String),
}

/// Replays queued outcomes per unit key. An empty queue is a non-retryable error.
#[derive(Debug, Default)]
pub struct ScriptedTestRunner {
    queue: Mutex<HashMap<String, VecDeque<ScriptedRun>>>,
    runs: Mutex<HashMap<String, usize>>,
    shutdown_on: Mutex<Option<(String, usize, Shutdown)>>,
}

impl ScriptedTestRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, key: &str, status: TestStatus) {
        self.enqueue(key, ScriptedRun::Status(status));
    }

    pub fn push_infra_error(&self, key: &str, message: &str) {
        self.enqueue(key, ScriptedRun::InfraError(message.to_string()));
    }

    /// Request `shutdown` while `key` is on its `run`-th call (1-based).
    pub fn shutdown_during(&self, key: &str, run: usize, shutdown: &Shutdown) {
        *self.shutdown_on.lock().expect("shutdown lock") =
            Some((key.to_string(), run, shutdown.clone()));
    }

    /// Calls made for `key`, including ones that failed to start.
    pub fn runs(&self, key: &str) -> usize {
        self.runs
            .lock()
            .expect("runs lock")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn enqueue(&self, key: &str, run: ScriptedRun) {
        self.queue
            .lock()
            .expect("queue lock")
            .entry(key.to_string())
            .or_default()
            .push_back(run);
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, unit: &TestUnit, _timeout: Duration) -> Result<TestOutcome> {
        let run = {
            let mut runs = self.runs.lock().expect("runs lock");
            let count = runs.entry(unit.key.clone()).or_default();
            *count += 1;
            *count
        };
        let trigger = self.shutdown_on.lock().expect("shutdown lock");
        if let Some((_, _, shutdown)) = trigger
            .as_ref()
            .filter(|(key, at, _)| *key == unit.key && *at == run)
        {
            shutdown.request();
        }
        drop(trigger);
        let next = self
            .queue
            .lock()
            .expect("queue lock")
            .get_mut(&unit.key)
            .and_then(VecDeque::pop_front);
        match next {
            Some(ScriptedRun::Status(status)) => Ok(TestOutcome {
                status,
                output: match status {
                    TestStatus::Passed => "ok\n".to_string(),
                    TestStatus::Failed => format!("AssertionError in {}\n", unit.key),
                    TestStatus::TimedOut => "\nTimeout after 5s\n".to_string(),
                },
                duration: Duration::from_millis(10),
            }),
            Some(ScriptedRun::InfraError(message)) => {
                Err(MenderError::TransientInfra(message).into())
            }
            None => Err(anyhow!("no scripted outcome for {}", unit.key)),
        }
    }
}

/// Replays queued oracle answers and records every request.
///
/// An empty queue answers with no candidate.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    answers: Mutex<VecDeque<Result<RepairResult, OracleError>>>,
    requests: Mutex<Vec<RepairRequest>>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_candidate(&self, source: &str) {
        self.push(Ok(RepairResult {
            success: true,
            new_source: Some(source.to_string()),
            rationale: "scripted fix".to_string(),
        }));
    }

    pub fn push_no_candidate(&self) {
        self.push(Ok(no_candidate()));
    }

    pub fn push_error(&self, err: OracleError) {
        self.push(Err(err));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RepairRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    fn push(&self, answer: Result<RepairResult, OracleError>) {
        self.answers.lock().expect("answers lock").push_back(answer);
    }
}

impl RepairOracle for ScriptedOracle {
    fn repair(&self, request: &RepairRequest) -> Result<RepairResult, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        self.answers
            .lock()
            .expect("answers lock")
            .pop_front()
            .unwrap_or_else(|| Ok(no_candidate()))
    }
}

fn no_candidate() -> RepairResult {
    RepairResult {
        success: false,
        new_source: None,
        rationale: "no idea".to_string(),
    }
}

/// In-memory [`StateStore`]; `failing()` rejects every save as fatal.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<PipelineState>>,
    saves: AtomicUsize,
    fail_saves: bool,
}

impl MemoryStateStore {
    pub fn with_state(state: PipelineState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    /// Last committed record.
    pub fn saved(&self) -> Option<PipelineState> {
        self.state.lock().expect("state lock").clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<PipelineState> {
        Ok(self.saved().unwrap_or_default())
    }

    fn save(&self, state: &PipelineState) -> Result<()> {
        if self.fail_saves {
            return Err(MenderError::FatalStateWrite {
                path: PathBuf::from("memory"),
                message: "scripted save failure".to_string(),
            }
            .into());
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().expect("state lock") = Some(state.clone());
        Ok(())
    }

    fn quarantine(&self) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Temporary project root with an initialized `.mender/` and `config`.
pub struct TestProject {
    _temp: tempfile::TempDir,
    pub paths: MenderPaths,
    pub config: MenderConfig,
}

impl TestProject {
    pub fn new(config: MenderConfig) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions { force: false }).expect("init");
        write_config(&paths.config_path, &config).expect("write config");
        for dir in [&config.source_dir, &config.test_dir] {
            fs::create_dir_all(temp.path().join(dir)).expect("create project dir");
        }
        Self {
            _temp: temp,
            paths,
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    /// Write `src/<name><ext>` with `source` and an empty matching test file.
    pub fn add_unit(&self, name: &str, source: &str) -> TestUnit {
        let ext = &self.config.test_extension;
        let source_name = format!("{name}{ext}");
        let source_path = self.root().join(&self.config.source_dir).join(&source_name);
        let test_name = format!("{}{name}{ext}", self.config.test_prefix);
        let test_path = self.root().join(&self.config.test_dir).join(&test_name);
        fs::write(&source_path, source).expect("write source");
        fs::write(&test_path, "").expect("write test");
        TestUnit {
            key: relative(&self.config.test_dir, &test_name),
            source_key: relative(&self.config.source_dir, &source_name),
            path: test_path,
            source: source_path,
        }
    }

    pub fn read(&self, path: &Path) -> String {
        fs::read_to_string(path).expect("read file")
    }

    pub fn pipeline(&self, runner: Arc<dyn TestRunner>) -> Pipeline {
        Pipeline::new(self.config.clone(), self.paths.clone(), runner)
    }
}

fn relative(dir: &Path, name: &str) -> String {
    let mut key = dir.to_string_lossy().replace('\\', "/");
    key.push('/');
    key.push_str(name);
    key
}
