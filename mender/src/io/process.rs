//! Child process execution with a hard wall-clock limit and bounded capture.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::MenderError;

/// How long to keep draining pipes after a timed-out child was killed.
const KILL_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Stdout followed by stderr, lossily decoded, with truncation notices.
    pub fn combined(&self) -> String {
        let mut buf = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            buf.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        buf
    }
}

/// Run `cmd` with a timeout, capturing stdout/stderr without risking pipe deadlocks.
///
/// Output is drained on reader threads while the child runs; bytes beyond
/// `output_limit_bytes` per stream are discarded. On timeout the child is killed
/// and reaped, and the result has `timed_out = true`.
///
/// On unix the child leads its own process group and the whole group is killed
/// on timeout, so grandchildren (e.g. a test spawned through `sh -c`) do not
/// outlive the limit. If something still holds the pipes open, draining gives
/// up after a short grace period.
///
/// Spawn failures are reported as [`MenderError::TransientInfra`] so callers can
/// retry them.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = ?cmd.get_program(), "spawning child process");
    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|err| {
        warn!(err = %err, "failed to spawn command");
        MenderError::TransientInfra(format!("spawn {:?}: {err}", cmd.get_program()))
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_rx = spawn_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_reader(stderr, output_limit_bytes);

    if let Some(input) = stdin {
        let child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        spawn_writer(child_stdin, input.to_vec());
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
            timed_out = true;
            kill_process_group(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };
    let elapsed = started.elapsed();

    let grace = timed_out.then_some(KILL_DRAIN_GRACE);
    let (stdout, stdout_truncated) = collect_output(&stdout_rx, grace).context("collect stdout")?;
    let (stderr, stderr_truncated) = collect_output(&stderr_rx, grace).context("collect stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

/// Feed `input` to the child off the waiting thread.
///
/// A child that never reads stdin blocks the writer once the pipe fills; the
/// writer then ends with a broken pipe when the child is killed or exits.
fn spawn_writer(mut child_stdin: ChildStdin, input: Vec<u8>) {
    thread::spawn(move || {
        if let Err(err) = child_stdin.write_all(&input) {
            debug!(err = %err, "child closed stdin early");
        }
    });
}

type StreamResult = Result<(Vec<u8>, usize)>;

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<StreamResult> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver may have given up after a kill; nothing to do then.
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

fn collect_output(rx: &Receiver<StreamResult>, grace: Option<Duration>) -> StreamResult {
    match grace {
        None => rx
            .recv()
            .map_err(|_| anyhow!("output reader thread panicked"))?,
        Some(grace) => match rx.recv_timeout(grace) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!("pipes still open after kill, abandoning output");
                Ok((Vec::new(), 0))
            }
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
        },
    }
}

fn kill_process_group(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        // The child leads the group created at spawn.
        #[allow(clippy::cast_possible_wrap)]
        let group = Pid::from_raw(child.id() as i32);
        match killpg(group, Signal::SIGKILL) {
            Ok(()) => return Ok(()),
            Err(errno) => debug!(%errno, "group kill failed, falling back"),
        }
    }
    match child.kill() {
        Ok(()) => Ok(()),
        // Already exited between the timeout and the kill.
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(err) => Err(err).context("kill command"),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams() {
        let output = run_command_with_timeout(
            sh("echo out; echo err 1>&2; exit 3"),
            None,
            Duration::from_secs(10),
            1000,
        )
        .expect("run");
        assert!(!output.success());
        assert_eq!(output.status.code(), Some(3));
        let combined = output.combined();
        assert!(combined.contains("out"));
        assert!(combined.contains("err"));
    }

    #[test]
    fn truncates_beyond_limit() {
        let output = run_command_with_timeout(
            sh("printf '0123456789'"),
            None,
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.combined().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn feeds_stdin() {
        let output = run_command_with_timeout(
            Command::new("cat"),
            Some(b"hello"),
            Duration::from_secs(10),
            1000,
        )
        .expect("run");
        assert!(output.success());
        assert_eq!(output.stdout, b"hello");
    }

    #[test]
    fn kills_on_timeout() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 30"),
            None,
            Duration::from_millis(200),
            1000,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn timeout_holds_when_child_ignores_large_stdin() {
        let input = vec![b'x'; 1 << 20];
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 30"),
            Some(&input),
            Duration::from_millis(300),
            1000,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn timeout_kills_background_grandchildren() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pid_file = temp.path().join("pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let output = run_command_with_timeout(sh(&script), None, Duration::from_millis(300), 1000)
            .expect("run");
        assert!(output.timed_out);

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        let deadline = Instant::now() + Duration::from_secs(5);
        while is_running(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!is_running(pid), "grandchild {pid} survived the timeout");
    }

    /// Alive and not a zombie awaiting its new parent.
    fn is_running(pid: i32) -> bool {
        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[test]
    fn spawn_failure_is_transient_infra() {
        let err = run_command_with_timeout(
            Command::new("/definitely/not/a/real/binary"),
            None,
            Duration::from_secs(1),
            1000,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MenderError>(),
            Some(MenderError::TransientInfra(_))
        ));
    }
}
