//! Subprocess supervision.
//!
//! Runs one external command with a hard wall-clock timeout, capturing
//! exit code, elapsed time, and full output in every outcome. Two
//! observation modes: heartbeat (periodic liveness log for long silent
//! jobs) and live-log (line-by-line forwarding of stdout/stderr as they
//! arrive). Completion is the join of process exit AND both stream
//! drains, so trailing output flushed just before exit is never lost.
//!
//! The runner has no knowledge of training; it accepts arbitrary
//! commands.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How the runner observes a process while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observe {
    /// Periodic "still running" log lines only.
    Heartbeat,
    /// Forward every output line as it arrives, tagged with `label`.
    LiveLog { label: String },
}

impl Observe {
    fn label(&self) -> &str {
        match self {
            Observe::Heartbeat => "",
            Observe::LiveLog { label } => label,
        }
    }
}

/// One command to supervise.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Text written to the child's stdin before waiting; the pipe is
    /// closed afterwards so the child sees EOF.
    pub stdin: Option<String>,
    pub timeout: Duration,
    /// Grace between SIGTERM and SIGKILL when terminating.
    pub kill_grace: Duration,
    pub heartbeat: Duration,
    pub observe: Observe,
    /// Human-readable phase name used in log lines.
    pub phase: String,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: cwd.into(),
            env: Vec::new(),
            stdin: None,
            timeout: Duration::from_secs(1800),
            kill_grace: Duration::from_secs(5),
            heartbeat: Duration::from_secs(10),
            observe: Observe::Heartbeat,
            phase: "process".to_string(),
        }
    }
}

/// How the supervised process ended. Timeout and cancellation are
/// distinct kinds, never conflated with a clean nonzero exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited zero.
    Clean,
    /// Exited nonzero (or was signalled by someone else).
    Failed,
    /// Hit the wall-clock limit and was forcibly terminated.
    TimedOut,
    /// Terminated because the caller's cancellation token fired.
    Cancelled,
}

/// Captured result of a supervised run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub kind: ExitKind,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.kind == ExitKind::Clean
    }
}

enum StreamKind {
    Stdout,
    Stderr,
}

/// Read a child stream to EOF, line-buffered, optionally forwarding each
/// line to the log as it arrives. Returns the full capture.
async fn drain<R>(reader: Option<R>, live: Option<(String, StreamKind)>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };

    let mut lines = BufReader::new(reader).lines();
    let mut captured = String::new();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                match &live {
                    Some((label, StreamKind::Stdout)) => info!("[{label}] {line}"),
                    Some((label, StreamKind::Stderr)) => info!("[{label}:err] {line}"),
                    None => {}
                }
                captured.push_str(&line);
                captured.push('\n');
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "error reading child output");
                break;
            }
        }
    }

    captured
}

/// Terminate the child's whole process group: SIGTERM, wait out the
/// grace period, then SIGKILL. Descendants spawned by the child are in
/// the same group and die with it.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM to process group failed, will SIGKILL");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
            let _ = child.kill().await;
        }
    }
}

/// Supervise one command to completion, timeout, or cancellation.
///
/// Returns `Err` only when the process cannot be spawned at all; every
/// runtime outcome (including timeout) is a `RunOutcome`.
pub async fn run(spec: &CommandSpec, cancel: &CancellationToken) -> Result<RunOutcome> {
    let start = Instant::now();

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    // Put the child in its own process group so termination reaches its
    // descendants too.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "failed to spawn '{}' in {} -- is it installed and on PATH?",
            spec.program,
            spec.cwd.display()
        )
    })?;
    let pid = child.id();

    // Start draining before touching stdin, so a child that talks while
    // we write cannot fill a pipe and deadlock.
    let live = matches!(spec.observe, Observe::LiveLog { .. });
    let label = spec.observe.label().to_string();
    let out_task = tokio::spawn(drain(
        child.stdout.take(),
        live.then(|| (label.clone(), StreamKind::Stdout)),
    ));
    let err_task = tokio::spawn(drain(
        child.stderr.take(),
        live.then(|| (label.clone(), StreamKind::Stderr)),
    ));

    if let Some(text) = &spec.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                warn!(error = %e, phase = %spec.phase, "failed to write child stdin");
            }
            // Dropping stdin closes the pipe; the child sees EOF.
        }
    }

    let deadline = tokio::time::sleep(spec.timeout);
    tokio::pin!(deadline);
    let mut heartbeat =
        tokio::time::interval_at(tokio::time::Instant::now() + spec.heartbeat, spec.heartbeat);

    let (kind, exit_code) = loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.with_context(|| {
                    format!("failed to wait on '{}'", spec.program)
                })?;
                let kind = if status.success() { ExitKind::Clean } else { ExitKind::Failed };
                break (kind, status.code());
            }
            _ = &mut deadline => {
                warn!(
                    phase = %spec.phase,
                    limit_secs = spec.timeout.as_secs(),
                    pid,
                    "timed out, terminating"
                );
                terminate(&mut child, spec.kill_grace).await;
                break (ExitKind::TimedOut, None);
            }
            _ = cancel.cancelled() => {
                info!(phase = %spec.phase, pid, "cancelled, terminating");
                terminate(&mut child, spec.kill_grace).await;
                break (ExitKind::Cancelled, None);
            }
            _ = heartbeat.tick() => {
                info!(
                    phase = %spec.phase,
                    elapsed_secs = start.elapsed().as_secs(),
                    limit_secs = spec.timeout.as_secs(),
                    pid,
                    "still running"
                );
            }
        }
    };

    // Both drains must finish before the run counts as complete. After
    // group termination the pipes hit EOF, so these joins are bounded.
    let stdout = out_task.await.unwrap_or_default();
    let stderr = err_task.await.unwrap_or_default();

    Ok(RunOutcome {
        kind,
        exit_code,
        stdout,
        stderr,
        elapsed: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, cwd: &std::path::Path) -> CommandSpec {
        CommandSpec::new("sh", vec!["-c".to_string(), script.to_string()], cwd)
    }

    #[tokio::test]
    async fn clean_exit_captures_output() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = sh("echo hello; echo oops >&2", tmp.path());
        let outcome = run(&spec, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.kind, ExitKind::Clean);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "hello\n");
        assert_eq!(outcome.stderr, "oops\n");
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed_not_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = sh("exit 3", tmp.path());
        let outcome = run(&spec, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.kind, ExitKind::Failed);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn timeout_kills_within_bounded_grace() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = sh("sleep 60", tmp.path());
        spec.timeout = Duration::from_millis(200);
        spec.kill_grace = Duration::from_millis(500);

        let started = Instant::now();
        let outcome = run(&spec, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.kind, ExitKind::TimedOut);
        assert_eq!(outcome.exit_code, None, "killed process has no exit code");
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "kill must not hang, took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn timeout_still_captures_prior_output() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = sh("echo before; sleep 60", tmp.path());
        spec.timeout = Duration::from_millis(300);
        spec.kill_grace = Duration::from_millis(500);

        let outcome = run(&spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.kind, ExitKind::TimedOut);
        assert_eq!(outcome.stdout, "before\n");
    }

    #[tokio::test]
    async fn cancellation_is_distinct_from_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = sh("sleep 60", tmp.path());
        spec.timeout = Duration::from_secs(120);
        spec.kill_grace = Duration::from_millis(500);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let outcome = run(&spec, &cancel).await.unwrap();
        assert_eq!(outcome.kind, ExitKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn lines_arrive_exactly_once_in_order_per_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let script = "for i in $(seq 1 50); do echo out_$i; echo err_$i >&2; done";
        let mut spec = sh(script, tmp.path());
        spec.observe = Observe::LiveLog {
            label: "train".to_string(),
        };
        let outcome = run(&spec, &CancellationToken::new()).await.unwrap();

        let expected_out: String = (1..=50).map(|i| format!("out_{i}\n")).collect();
        let expected_err: String = (1..=50).map(|i| format!("err_{i}\n")).collect();
        assert_eq!(outcome.stdout, expected_out);
        assert_eq!(outcome.stderr, expected_err);
    }

    #[tokio::test]
    async fn trailing_output_before_exit_is_not_lost() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = sh("printf 'last line without newline'", tmp.path());
        let outcome = run(&spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.stdout, "last line without newline\n");
    }

    #[tokio::test]
    async fn stdin_is_delivered_and_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = sh("cat", tmp.path());
        spec.stdin = Some("prompt text\n".to_string());
        let outcome = run(&spec, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.kind, ExitKind::Clean);
        assert_eq!(outcome.stdout, "prompt text\n");
    }

    #[tokio::test]
    async fn env_vars_are_injected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = sh("echo $MLOOP_TEST_VAR", tmp.path());
        spec.env.push(("MLOOP_TEST_VAR".to_string(), "abc123".to_string()));
        let outcome = run(&spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.stdout, "abc123\n");
    }

    #[tokio::test]
    async fn nonexistent_program_returns_spawn_error() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("mloop_no_such_binary_xyz", vec![], tmp.path());
        let result = run(&spec, &CancellationToken::new()).await;
        assert!(result.is_err());
        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("failed to spawn"), "got: {msg}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_descendants_too() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("grandchild_alive");
        // The inner sleep is a grandchild; after the group kill it must
        // not survive to write the marker.
        let script = format!("(sleep 2 && touch {}) & sleep 60", marker.display());
        let mut spec = sh(&script, tmp.path());
        spec.timeout = Duration::from_millis(200);
        spec.kill_grace = Duration::from_millis(500);

        let outcome = run(&spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.kind, ExitKind::TimedOut);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(
            !marker.exists(),
            "grandchild outlived the process-group kill"
        );
    }
}
