//! Process execution behind a narrow interface.
//!
//! The dispatcher only sees [`ProcessRunner`]. [`OsProcessRunner`] is the
//! implementation for the host platform: every task runs in its own process
//! group with a cleared environment, and termination signals go to the whole
//! group so no grandchild outlives its task.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::{StatePipes, StateReader};
use crate::types::{
    ProcessExit, ProcessOutcome, ProcessSpec, MAX_STATE_BYTES, MAX_STDERR_BYTES, MAX_STDOUT_BYTES,
};

/// Starts a process, waits for it under a timeout, and captures its output.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `spec` to completion. Never fails: spawn errors, timeouts and
    /// cancellation are all described by the returned outcome.
    async fn run(&self, spec: ProcessSpec, cancel: CancellationToken) -> ProcessOutcome;
}

/// Runs tasks as OS processes via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessRunner;

/// Why we stopped a process ourselves.
#[derive(Debug, Clone, Copy)]
enum StopReason {
    Timeout,
    Cancelled,
}

enum Ended {
    Exited(std::io::Result<std::process::ExitStatus>),
    Stopped(StopReason),
}

#[async_trait]
impl ProcessRunner for OsProcessRunner {
    async fn run(&self, spec: ProcessSpec, cancel: CancellationToken) -> ProcessOutcome {
        let started_at = Utc::now();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .env_clear()
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let state_pipes = match StatePipes::open() {
            Ok(pipes) => {
                pipes.install(&mut command);
                Some(pipes)
            }
            Err(e) => {
                warn!(program = %spec.program.display(), error = %e, "state channel unavailable");
                None
            }
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %spec.program.display(), error = %e, "spawn failed");
                return ProcessOutcome::spawn_failed(
                    format!("cannot start {}: {e}", spec.program.display()),
                    started_at,
                );
            }
        };
        let pid = child.id();
        debug!(program = %spec.program.display(), pid, "process started");

        // Feed stdin from its own task so a child that never reads cannot
        // stall us; dropping the pipe closes it.
        if let (Some(mut pipe), Some(payload)) = (child.stdin.take(), spec.stdin) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&payload).await {
                    debug!(error = %e, "stdin closed before the payload was written");
                }
            });
        }

        let state_reader = state_pipes.and_then(|pipes| match pipes.start(spec.state) {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!(pid, error = %e, "state channel could not be started");
                None
            }
        });

        let capture = Capture::start(child.stdout.take(), child.stderr.take(), state_reader);

        let ended = tokio::select! {
            status = child.wait() => Ended::Exited(status),
            _ = tokio::time::sleep(spec.timeout) => Ended::Stopped(StopReason::Timeout),
            _ = cancel.cancelled() => Ended::Stopped(StopReason::Cancelled),
        };

        let exit = match ended {
            Ended::Exited(Ok(status)) => exit_from_status(status),
            Ended::Exited(Err(e)) => {
                warn!(pid, error = %e, "wait failed; killing process group");
                terminate(&mut child, pid, Signal::Kill);
                let _ = child.wait().await;
                ProcessExit::Signaled(KILL_SIGNAL)
            }
            Ended::Stopped(reason) => {
                info!(pid, ?reason, grace_ms = spec.kill_grace.as_millis() as u64, "stopping process");
                let forced = stop(&mut child, pid, spec.kill_grace).await;
                match reason {
                    StopReason::Timeout => ProcessExit::TimedOut { forced },
                    StopReason::Cancelled => ProcessExit::Cancelled { forced },
                }
            }
        };

        let captured = capture.finish(pid, spec.kill_grace).await;
        if captured.stdout_omitted > 0 {
            warn!(pid, omitted = captured.stdout_omitted, "stdout exceeded its limit");
        }

        ProcessOutcome {
            exit,
            stdout: captured.stdout,
            stdout_omitted: captured.stdout_omitted,
            stderr: captured.stderr,
            state: captured.state,
            started_at,
            finished_at: Utc::now(),
            pid,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
const KILL_SIGNAL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const KILL_SIGNAL: i32 = 9;

/// SIGTERM, wait up to `grace`, then SIGKILL. Returns true if SIGKILL was needed.
async fn stop(child: &mut Child, pid: Option<u32>, grace: Duration) -> bool {
    terminate(child, pid, Signal::Term);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {
            // The leader is gone; make sure the rest of its group follows.
            signal_group(pid, Signal::Kill);
            false
        }
        Err(_elapsed) => {
            terminate(child, pid, Signal::Kill);
            let _ = child.wait().await;
            true
        }
    }
}

fn terminate(child: &mut Child, pid: Option<u32>, signal: Signal) {
    #[cfg(unix)]
    {
        let _ = child;
        signal_group(pid, signal);
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        let _ = child.start_kill();
    }
}

fn signal_group(pid: Option<u32>, signal: Signal) {
    #[cfg(unix)]
    {
        let Some(raw_pid) = pid else { return };
        let signal = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // Safety: the child was spawned as leader of its own process group,
        // so the negated pid addresses exactly that group.
        unsafe {
            libc::kill(-(raw_pid as libc::pid_t), signal);
        }
    }
    #[cfg(not(unix))]
    let _ = (pid, signal);
}

fn exit_from_status(status: std::process::ExitStatus) -> ProcessExit {
    if let Some(code) = status.code() {
        return ProcessExit::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ProcessExit::Signaled(signal);
        }
    }
    ProcessExit::Exited(-1)
}

/// Output of one process, pumped from all of its pipes by a single task.
struct Capture {
    pump: JoinHandle<()>,
    stdout: Buffer,
    stderr: Buffer,
    state: Option<Buffer>,
}

/// What [`Capture::finish`] hands back.
struct Captured {
    stdout: Vec<u8>,
    stdout_omitted: u64,
    stderr: Vec<u8>,
    state: Option<Vec<u8>>,
}

type Buffer = Arc<Mutex<Bounded>>;

impl Capture {
    fn start(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>, state: Option<StateReader>) -> Self {
        let out: Buffer = Arc::new(Mutex::new(Bounded::new(MAX_STDOUT_BYTES, 0)));
        let err: Buffer = Arc::new(Mutex::new(Bounded::new(MAX_STDERR_BYTES, MAX_STDERR_BYTES)));
        let state_buffer: Option<Buffer> = state
            .is_some()
            .then(|| Arc::new(Mutex::new(Bounded::new(MAX_STATE_BYTES, 0))));
        let task = tokio::spawn({
            let (out, err) = (Arc::clone(&out), Arc::clone(&err));
            let state_buffer = state_buffer.clone();
            async move {
                let state_pump = async move {
                    if let (Some(reader), Some(buffer)) = (state, state_buffer) {
                        drain_pipe(Some(reader), buffer).await;
                    }
                };
                tokio::join!(drain_pipe(stdout, out), drain_pipe(stderr, err), state_pump);
            }
        });
        Self {
            pump: task,
            stdout: out,
            stderr: err,
            state: state_buffer,
        }
    }

    /// Wait for every pipe to close. Leftover group members may still hold
    /// them open after the leader exited; those are killed after `grace`.
    async fn finish(mut self, pid: Option<u32>, grace: Duration) -> Captured {
        if tokio::time::timeout(grace, &mut self.pump).await.is_err() {
            debug!(pid, "output pipes still open after exit; killing process group");
            signal_group(pid, Signal::Kill);
            if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut self.pump).await.is_err() {
                // Held by something outside the group; keep what we have.
                self.pump.abort();
            }
        }

        let (stdout, stdout_omitted) = take(&self.stdout).into_parts("stdout");
        let (stderr, _) = take(&self.stderr).into_parts("stderr");
        let state = self.state.as_ref().and_then(|buffer| {
            let (state, omitted) = take(buffer).into_parts("state");
            if omitted > 0 {
                warn!(pid, omitted, "task state exceeded its limit and was discarded");
                None
            } else {
                Some(state)
            }
        });
        Captured {
            stdout,
            stdout_omitted,
            stderr,
            state,
        }
    }
}

/// How long to keep reading after the group was killed.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Pipe contents held in memory: the first `head_limit` bytes, then a
/// rolling window of the last `tail_limit` bytes. Everything in between is
/// counted and dropped while reading.
#[derive(Debug)]
struct Bounded {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    head_limit: usize,
    tail_limit: usize,
    omitted: u64,
}

impl Bounded {
    fn new(head_limit: usize, tail_limit: usize) -> Self {
        Self {
            head: Vec::new(),
            tail: VecDeque::new(),
            head_limit,
            tail_limit,
            omitted: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let room = self.head_limit.saturating_sub(self.head.len());
        let (head, rest) = bytes.split_at(room.min(bytes.len()));
        self.head.extend_from_slice(head);
        if rest.is_empty() {
            return;
        }
        self.tail.extend(rest);
        let excess = self.tail.len().saturating_sub(self.tail_limit);
        if excess > 0 {
            self.tail.drain(..excess);
            self.omitted += excess as u64;
        }
    }

    /// The kept bytes, with a marker where the middle was dropped, and the
    /// number of bytes dropped.
    fn into_parts(self, stream: &str) -> (Vec<u8>, u64) {
        let mut bytes = self.head;
        if self.omitted > 0 && !self.tail.is_empty() {
            bytes.extend_from_slice(format!("\n[... {} bytes of {stream} omitted ...]\n", self.omitted).as_bytes());
        }
        bytes.extend(self.tail);
        (bytes, self.omitted)
    }
}

async fn drain_pipe<R>(stream: Option<R>, buffer: Buffer)
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else { return };
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => lock(&buffer).push(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
}

fn lock(buffer: &Buffer) -> std::sync::MutexGuard<'_, Bounded> {
    buffer.lock().unwrap_or_else(|e| e.into_inner())
}

fn take(buffer: &Buffer) -> Bounded {
    let mut guard = lock(buffer);
    let empty = Bounded::new(guard.head_limit, guard.tail_limit);
    std::mem::replace(&mut *guard, empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Instant;

    fn spec(program: &str, args: &[&str]) -> ProcessSpec {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string());
        ProcessSpec {
            program: PathBuf::from(program),
            args: args.iter().map(|s| s.to_string()).collect(),
            env,
            cwd: None,
            stdin: None,
            state: Vec::new(),
            timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(2),
        }
    }

    async fn run(spec: ProcessSpec) -> ProcessOutcome {
        OsProcessRunner.run(spec, CancellationToken::new()).await
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let outcome = run(spec("/bin/sh", &["-c", "echo hello; echo oops >&2; exit 3"])).await;
        assert_eq!(outcome.exit, ProcessExit::Exited(3));
        assert_eq!(outcome.stdout_text(), "hello\n");
        assert_eq!(outcome.stderr_text(), "oops\n");
        assert!(outcome.pid.is_some());
        assert!(outcome.finished_at >= outcome.started_at);
    }

    #[tokio::test]
    async fn payload_arrives_on_stdin() {
        let mut s = spec("/bin/cat", &[]);
        s.stdin = Some(b"{\"k\":1}".to_vec());
        let outcome = run(s).await;
        assert_eq!(outcome.exit, ProcessExit::Exited(0));
        assert_eq!(outcome.stdout_text(), "{\"k\":1}");
    }

    #[tokio::test]
    async fn stdin_is_closed_without_payload() {
        // `cat` would block forever on an open stdin.
        let mut s = spec("/bin/cat", &[]);
        s.timeout = Duration::from_secs(3);
        let outcome = run(s).await;
        assert_eq!(outcome.exit, ProcessExit::Exited(0));
        assert!(outcome.stdout.is_empty());
    }

    #[tokio::test]
    async fn state_flows_through_fd_3_and_fd_4() {
        let script = r#"read -r previous <&3; echo "seen:$previous"; echo "next-$previous" >&4"#;
        let outcome = run(spec("/bin/sh", &["-c", script]).with_state(b"7\n".to_vec())).await;
        assert_eq!(outcome.exit, ProcessExit::Exited(0));
        assert_eq!(outcome.stdout_text(), "seen:7\n");
        assert_eq!(outcome.state.as_deref(), Some(&b"next-7\n"[..]));
    }

    #[tokio::test]
    async fn task_ignoring_state_commits_empty_state() {
        let outcome = run(spec("/bin/sh", &["-c", "true"]).with_state(b"kept".to_vec())).await;
        assert_eq!(outcome.exit, ProcessExit::Exited(0));
        assert_eq!(outcome.state, Some(Vec::new()));
    }

    #[tokio::test]
    async fn noisy_stderr_is_bounded_while_reading() {
        let script = r#"head -c 4194304 /dev/zero | tr '\0' x >&2; echo end >&2"#;
        let outcome = run(spec("/bin/sh", &["-c", script])).await;
        assert_eq!(outcome.exit, ProcessExit::Exited(0));
        assert!(outcome.stderr.len() < 2 * MAX_STDERR_BYTES + 64, "{}", outcome.stderr.len());
        let text = outcome.stderr_text();
        assert!(text.contains("bytes of stderr omitted"));
        assert!(text.ends_with("end\n"));
    }

    #[test]
    fn bounded_keeps_head_and_tail() {
        let mut buffer = Bounded::new(4, 3);
        buffer.push(b"abcdef");
        buffer.push(b"ghij");
        let (bytes, omitted) = buffer.into_parts("stderr");
        assert_eq!(omitted, 3);
        assert_eq!(bytes, b"abcd\n[... 3 bytes of stderr omitted ...]\nhij".to_vec());

        let mut head_only = Bounded::new(4, 0);
        head_only.push(b"abcdef");
        assert_eq!(head_only.into_parts("stdout"), (b"abcd".to_vec(), 2));
    }

    #[tokio::test]
    async fn environment_is_not_inherited() {
        std::env::set_var("CADENCE_RUNNER_LEAK_CHECK", "1");
        let outcome = run(spec("/bin/sh", &["-c", "env"]).with_env("ONLY_THIS", "yes")).await;
        let text = outcome.stdout_text();
        assert!(text.contains("ONLY_THIS=yes"));
        assert!(!text.contains("CADENCE_RUNNER_LEAK_CHECK"));
    }

    #[tokio::test]
    async fn timeout_terminates_gracefully() {
        let mut s = spec("/bin/sleep", &["30"]);
        s.timeout = Duration::from_millis(300);
        let started = Instant::now();
        let outcome = run(s).await;
        assert_eq!(outcome.exit, ProcessExit::TimedOut { forced: false });
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn ignored_sigterm_escalates_to_sigkill() {
        let mut s = spec("/bin/sh", &["-c", "trap '' TERM; sleep 30"]);
        s.timeout = Duration::from_millis(300);
        s.kill_grace = Duration::from_millis(300);
        let started = Instant::now();
        let outcome = run(s).await;
        assert_eq!(outcome.exit, ProcessExit::TimedOut { forced: true });
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_stops_process() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let outcome = OsProcessRunner.run(spec("/bin/sleep", &["30"]), token).await;
        assert_eq!(outcome.exit, ProcessExit::Cancelled { forced: false });
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let outcome = run(spec("/nonexistent/program", &[])).await;
        assert!(matches!(outcome.exit, ProcessExit::SpawnFailed(_)));
        assert!(outcome.pid.is_none());
    }

    #[tokio::test]
    async fn uncaught_signal_is_reported() {
        let outcome = run(spec("/bin/sh", &["-c", "kill -KILL $$"])).await;
        assert_eq!(outcome.exit, ProcessExit::Signaled(libc::SIGKILL));
    }

    #[tokio::test]
    async fn background_grandchild_does_not_hold_us() {
        let mut s = spec("/bin/sh", &["-c", "sleep 30 & echo started"]);
        s.kill_grace = Duration::from_millis(300);
        let started = Instant::now();
        let outcome = run(s).await;
        assert_eq!(outcome.exit, ProcessExit::Exited(0));
        assert_eq!(outcome.stdout_text(), "started\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
