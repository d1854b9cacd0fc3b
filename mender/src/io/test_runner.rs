//! Test execution adapter.
//!
//! The [`TestRunner`] trait decouples the repair machine from how tests are
//! launched. Tests of the orchestrator use scripted runners.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rand::Rng;
use tracing::{info, instrument, warn};

use crate::core::types::TestStatus;
use crate::error::MenderError;
use crate::io::discovery::TestUnit;
use crate::io::process::run_command_with_timeout;
use crate::retry::{RetryExhausted, RetryPolicy, Sleeper, retry_with_backoff};

/// Result of one test execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub status: TestStatus,
    /// Combined stdout and stderr; for timeouts, ends with the timeout diagnostic.
    pub output: String,
    pub duration: Duration,
}

/// Runs one test unit in isolation.
///
/// `Ok` carries every test verdict, including timeouts. `Err` is reserved for
/// infrastructure failures such as a process that cannot be spawned; those
/// should carry [`MenderError::TransientInfra`] to be retried.
pub trait TestRunner: Send + Sync {
    fn run(&self, unit: &TestUnit, timeout: Duration) -> Result<TestOutcome>;
}

/// Runs `command... <test path>` as a child process from the project root.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    pub root: PathBuf,
    pub command: Vec<String>,
    pub output_limit_bytes: usize,
}

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(unit = %unit.key))]
    fn run(&self, unit: &TestUnit, timeout: Duration) -> Result<TestOutcome> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("test command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).arg(&unit.path).current_dir(&self.root);

        info!("running test");
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .with_context(|| format!("run test {}", unit.key))?;

        let mut text = output.combined();
        let status = if output.timed_out {
            text.push_str(&format!("\nTimeout after {}s\n", timeout.as_secs_f64()));
            warn!(timeout_secs = timeout.as_secs_f64(), "test timed out");
            TestStatus::TimedOut
        } else if output.status.success() {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        };
        info!(?status, elapsed_ms = output.elapsed.as_millis() as u64, "test finished");
        Ok(TestOutcome {
            status,
            output: text,
            duration: output.elapsed,
        })
    }
}

/// True when `err` carries a retryable infrastructure failure.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<MenderError>(),
            Some(MenderError::TransientInfra(_))
        )
    })
}

/// Run a test, retrying only transient infrastructure failures.
pub fn run_test_with_retry<T, S, R>(
    runner: &T,
    unit: &TestUnit,
    timeout: Duration,
    policy: &RetryPolicy,
    sleeper: &S,
    rng: &mut R,
) -> Result<TestOutcome, RetryExhausted<anyhow::Error>>
where
    T: TestRunner + ?Sized,
    S: Sleeper + ?Sized,
    R: Rng + ?Sized,
{
    retry_with_backoff(policy, sleeper, rng, is_transient, |_| {
        runner.run(unit, timeout)
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::backoff::BackoffConfig;
    use crate::shutdown::Shutdown;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::fs;
    use std::time::Instant;

    fn unit_with_script(dir: &std::path::Path, body: &str) -> TestUnit {
        let path = dir.join("test_unit.sh");
        fs::write(&path, body).expect("write script");
        TestUnit {
            path,
            source: dir.join("unit.sh"),
            key: "test_unit.sh".to_string(),
            source_key: "unit.sh".to_string(),
        }
    }

    fn runner(root: &std::path::Path, command: &[&str]) -> CommandTestRunner {
        CommandTestRunner {
            root: root.to_path_buf(),
            command: command.iter().map(|s| s.to_string()).collect(),
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn passing_script_is_passed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let unit = unit_with_script(temp.path(), "echo ok\n");
        let outcome = runner(temp.path(), &["sh"])
            .run(&unit, Duration::from_secs(10))
            .expect("run");
        assert_eq!(outcome.status, TestStatus::Passed);
        assert!(outcome.output.contains("ok"));
    }

    #[test]
    fn failing_script_keeps_diagnostics() {
        let temp = tempfile::tempdir().expect("tempdir");
        let unit = unit_with_script(temp.path(), "echo 'AssertionError: 1 != 2' 1>&2\nexit 1\n");
        let outcome = runner(temp.path(), &["sh"])
            .run(&unit, Duration::from_secs(10))
            .expect("run");
        assert_eq!(outcome.status, TestStatus::Failed);
        assert!(outcome.output.contains("AssertionError"));
    }

    #[test]
    fn hanging_script_is_stopped_and_reported_as_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let unit = unit_with_script(temp.path(), "sleep 30\n");
        let started = Instant::now();
        let outcome = runner(temp.path(), &["sh"])
            .run(&unit, Duration::from_millis(300))
            .expect("run");
        assert_eq!(outcome.status, TestStatus::TimedOut);
        assert!(outcome.output.contains("Timeout after"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_interpreter_is_retried_then_surfaces() {
        let temp = tempfile::tempdir().expect("tempdir");
        let unit = unit_with_script(temp.path(), "true\n");
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter_fraction: 0.0,
            },
        };
        let mut rng = StdRng::seed_from_u64(0);
        let err = run_test_with_retry(
            &runner(temp.path(), &["/no/such/interpreter"]),
            &unit,
            Duration::from_secs(1),
            &policy,
            &Shutdown::new(),
            &mut rng,
        )
        .unwrap_err();
        assert_eq!(err.attempts, 2);
        assert!(is_transient(&err.last));
    }
}
