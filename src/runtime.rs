//! Container runtime adapter
//!
//! Drives the container runtime through its CLI (`inspect`, `start`, `stop`,
//! `logs --follow`). Nothing here returns an error to the caller: every
//! failure is logged and reported as `false`.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Buffered lines between the log readers and the pattern scanner
const LOG_LINE_BUFFER: usize = 256;

/// Lifecycle operations on a single container
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the container is running. Any failure counts as not running.
    async fn is_running(&self, container: &str) -> bool;

    /// Start the container. Succeeds immediately if it is already running.
    async fn start(&self, container: &str) -> bool;

    /// Stop the container
    async fn stop(&self, container: &str) -> bool;

    /// Wait until a line of new container output contains one of `patterns`.
    ///
    /// Returns `false` when `timeout` elapses, the output stream ends, or the
    /// log stream cannot be read.
    async fn wait_ready(&self, container: &str, timeout: Duration, patterns: &[String]) -> bool;
}

pub type SharedRuntime = Arc<dyn ContainerRuntime>;

/// First pattern contained in `line`, if any
pub fn match_ready_pattern<'a>(line: &str, patterns: &'a [String]) -> Option<&'a str> {
    patterns
        .iter()
        .find(|p| !p.is_empty() && line.contains(p.as_str()))
        .map(String::as_str)
}

/// Captured result of a finished runtime command
struct CommandOutput {
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// How the readiness scan ended
#[derive(Debug, PartialEq)]
enum ReadyScan {
    Matched(String),
    TimedOut,
    StreamClosed,
}

/// [`ContainerRuntime`] backed by a Docker-compatible CLI
#[derive(Debug, Clone)]
pub struct CliRuntime {
    program: String,
    base_args: Vec<String>,
}

impl CliRuntime {
    /// Build from a command line such as `docker` or `sudo podman`
    pub fn from_command_line(command_line: &str) -> anyhow::Result<Self> {
        let mut words = shell_words::split(command_line)
            .map_err(|e| anyhow::anyhow!("Invalid runtime command '{}': {}", command_line, e))?;
        if words.is_empty() {
            anyhow::bail!("Runtime command must not be empty");
        }
        let program = words.remove(0);
        Ok(Self {
            program,
            base_args: words,
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args);
        cmd.stdin(Stdio::null());
        cmd
    }

    async fn run(&self, args: &[&str]) -> CommandOutput {
        let result = self
            .command()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(output) => CommandOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Err(e) => {
                error!(
                    program = %self.program,
                    args = ?args,
                    error = %e,
                    "Failed to execute runtime command"
                );
                CommandOutput {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: e.to_string(),
                }
            }
        }
    }

    /// Read new output until a pattern matches, the deadline passes, or both
    /// output streams close
    async fn scan_for_ready(
        child: &mut Child,
        deadline: Instant,
        patterns: &[String],
    ) -> std::io::Result<ReadyScan> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("log follower has no stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("log follower has no stderr"))?;

        // Both streams feed one channel, which closes once both readers end
        let (tx, mut rx) = mpsc::channel(LOG_LINE_BUFFER);
        let readers = [forward_lines(stdout, tx.clone()), forward_lines(stderr, tx)];

        let scan = loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => break ReadyScan::TimedOut,
                Ok(None) => break ReadyScan::StreamClosed,
                Ok(Some(line)) => {
                    if let Some(pattern) = match_ready_pattern(&line, patterns) {
                        break ReadyScan::Matched(pattern.to_string());
                    }
                }
            }
        };

        for reader in readers {
            reader.abort();
        }
        Ok(scan)
    }
}

/// Forward lines from a child pipe into `tx` until EOF or the receiver drops
fn forward_lines<R>(pipe: R, tx: mpsc::Sender<String>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Kill the log follower's process group, then reap the follower itself
async fn terminate(child: &mut Child, container: &str) {
    // A wrapped runtime (`sudo podman`, `sh script`) forks the real follower
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        if unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) } != 0 {
            debug!(container, error = %std::io::Error::last_os_error(), "Log follower group already gone");
        }
    }

    if let Err(e) = child.kill().await {
        debug!(container, error = %e, "Log follower already exited");
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn is_running(&self, container: &str) -> bool {
        let output = self
            .run(&["inspect", "-f", "{{.State.Running}}", container])
            .await;
        if !output.success() {
            warn!(
                container,
                exit_code = ?output.exit_code,
                stderr = %output.stderr.trim(),
                "Could not check container status"
            );
            return false;
        }
        output.stdout.trim().eq_ignore_ascii_case("true")
    }

    async fn start(&self, container: &str) -> bool {
        info!(container, "Starting container");

        if self.is_running(container).await {
            info!(container, "Container is already running");
            return true;
        }

        let output = self.run(&["start", container]).await;
        if output.success() {
            info!(container, "Started container");
            true
        } else {
            error!(
                container,
                exit_code = ?output.exit_code,
                stderr = %output.stderr.trim(),
                "Failed to start container"
            );
            false
        }
    }

    async fn stop(&self, container: &str) -> bool {
        let output = self.run(&["stop", container]).await;
        if output.success() {
            info!(container, "Stopped container");
            true
        } else {
            error!(
                container,
                exit_code = ?output.exit_code,
                stderr = %output.stderr.trim(),
                "Failed to stop container"
            );
            false
        }
    }

    async fn wait_ready(&self, container: &str, timeout: Duration, patterns: &[String]) -> bool {
        info!(container, timeout_secs = timeout.as_secs(), "Waiting for container to become ready");
        let deadline = Instant::now() + timeout;

        // --tail=0 skips output emitted before the wait began
        let mut cmd = self.command();
        cmd.args(["logs", "--follow", "--tail=0", container])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let spawned = cmd.spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!(container, error = %e, "Failed to follow container logs");
                return false;
            }
        };

        let scan = Self::scan_for_ready(&mut child, deadline, patterns).await;
        terminate(&mut child, container).await;

        match scan {
            Ok(ReadyScan::Matched(pattern)) => {
                info!(container, pattern = %pattern, "Container is ready");
                true
            }
            Ok(ReadyScan::TimedOut) => {
                warn!(container, timeout_secs = timeout.as_secs(), "Timeout waiting for container");
                false
            }
            Ok(ReadyScan::StreamClosed) => {
                warn!(container, "Container log stream ended before it became ready");
                false
            }
            Err(e) => {
                error!(container, error = %e, "Error reading container logs");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scriptable in-memory runtime for engine tests

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        IsRunning(String),
        Start(String),
        Stop(String),
        WaitReady(String),
    }

    #[derive(Default)]
    pub struct FakeRuntime {
        running: Mutex<HashSet<String>>,
        calls: Mutex<Vec<Call>>,
        start_fails: Mutex<HashSet<String>>,
        stop_fails: Mutex<HashSet<String>>,
        ready: Mutex<HashMap<String, bool>>,
        start_delay: Mutex<Duration>,
        inspect_delay: Mutex<Duration>,
        panic_on_wait: Mutex<bool>,
    }

    impl FakeRuntime {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn set_running(&self, container: &str, running: bool) {
            let mut set = self.running.lock();
            if running {
                set.insert(container.to_string());
            } else {
                set.remove(container);
            }
        }

        pub fn fail_start(&self, container: &str) {
            self.start_fails.lock().insert(container.to_string());
        }

        pub fn fail_stop(&self, container: &str) {
            self.stop_fails.lock().insert(container.to_string());
        }

        pub fn set_ready(&self, container: &str, ready: bool) {
            self.ready.lock().insert(container.to_string(), ready);
        }

        pub fn set_start_delay(&self, delay: Duration) {
            *self.start_delay.lock() = delay;
        }

        pub fn set_inspect_delay(&self, delay: Duration) {
            *self.inspect_delay.lock() = delay;
        }

        pub fn panic_on_wait(&self) {
            *self.panic_on_wait.lock() = true;
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        pub fn count(&self, call: &Call) -> usize {
            self.calls.lock().iter().filter(|c| *c == call).count()
        }

        fn record(&self, call: Call) {
            self.calls.lock().push(call);
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn is_running(&self, container: &str) -> bool {
            self.record(Call::IsRunning(container.to_string()));
            let delay = *self.inspect_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.running.lock().contains(container)
        }

        async fn start(&self, container: &str) -> bool {
            self.record(Call::Start(container.to_string()));
            let delay = *self.start_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.start_fails.lock().contains(container) {
                return false;
            }
            self.set_running(container, true);
            true
        }

        async fn stop(&self, container: &str) -> bool {
            self.record(Call::Stop(container.to_string()));
            if self.stop_fails.lock().contains(container) {
                return false;
            }
            self.set_running(container, false);
            true
        }

        async fn wait_ready(&self, container: &str, _timeout: Duration, _patterns: &[String]) -> bool {
            self.record(Call::WaitReady(container.to_string()));
            if *self.panic_on_wait.lock() {
                panic!("log stream exploded for {}", container);
            }
            self.ready.lock().get(container).copied().unwrap_or(true)
        }
    }
}
