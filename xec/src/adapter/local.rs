//! # Local Adapter
//!
//! Executes commands as child processes of the current machine via
//! `tokio::process::Command` (§4.1). Grounded on the teacher's shell-pool spawn and
//! timeout handling, simplified here to a single spawn per command rather than a
//! pooled warm-shell protocol — this crate's Process Handle already amortizes
//! repeated invocations through its own cache, so a persistent shell protocol would
//! duplicate that layer.

use std::process::Stdio;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as TokioCommand;

use crate::adapter::Adapter;
use crate::command::{Command, Stdin};
use crate::error::Error;
use crate::interpolate::escape_shell_argument;
use crate::options::AdapterDefaults;
use crate::outcome::Outcome;

/// Runs commands directly on the host.
#[derive(Debug, Clone)]
pub struct LocalAdapter {
    defaults: AdapterDefaults,
    shell_program: String,
}

impl LocalAdapter {
    pub fn new(defaults: AdapterDefaults) -> Self {
        Self {
            defaults,
            shell_program: default_shell(),
        }
    }

    /// Overrides the shell binary used when `command.shell()` is `true` (defaults
    /// to `sh` on Unix, `cmd` on Windows).
    pub fn with_shell_program(mut self, shell: impl Into<String>) -> Self {
        self.shell_program = shell.into();
        self
    }

    fn build_tokio_command(&self, command: &Command) -> TokioCommand {
        let mut tokio_cmd = if command.shell() {
            let mut line = command.program().to_string();
            for arg in command.args() {
                line.push(' ');
                line.push_str(&escape_shell_argument(arg));
            }
            let mut c = TokioCommand::new(&self.shell_program);
            c.arg("-c").arg(line);
            c
        } else {
            let mut c = TokioCommand::new(command.program());
            c.args(command.args());
            c
        };

        if let Some(cwd) = command.cwd() {
            tokio_cmd.current_dir(cwd);
        }
        if !command.env().is_empty() {
            tokio_cmd.envs(command.env().iter());
        }
        tokio_cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        tokio_cmd
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new(AdapterDefaults::default())
    }
}

enum Race {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
    BufferOverflow,
}

/// Reads `pipe` into a growing buffer, chunk by chunk, reporting an overflow on
/// `overflow` as soon as the accumulated length exceeds `max_buffer` rather than
/// only after the child exits — so a runaway producer with no timeout set is still
/// killed promptly (§4.3).
async fn read_capped(
    mut pipe: impl tokio::io::AsyncRead + Unpin,
    max_buffer: usize,
    overflow: tokio::sync::mpsc::Sender<()>,
) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > max_buffer {
                    let _ = overflow.send(()).await;
                    break;
                }
            }
        }
    }
    buf
}

async fn cancelled(token: &Option<tokio_util::sync::CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn timed_out(timeout: Option<std::time::Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

fn default_shell() -> String {
    if cfg!(windows) {
        "cmd".to_string()
    } else {
        "sh".to_string()
    }
}

/// Sends a polite termination signal, gives the child `grace` to exit on its own,
/// then force-kills it. Grounded on the shell-pool pattern of sending `SIGTERM`
/// before `SIGKILL` on the daemon's owned children.
async fn terminate_gracefully(
    child: &mut tokio::process::Child,
    grace: std::time::Duration,
) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    tokio::select! {
        status = child.wait() => return status,
        _ = tokio::time::sleep(grace) => {}
    }

    let _ = child.start_kill();
    child.wait().await
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    fn validate_config(&self, _command: &Command) -> Result<(), Error> {
        Ok(())
    }

    async fn execute(&self, command: &Command) -> Result<Outcome, Error> {
        let started_at = SystemTime::now();
        let start = Instant::now();
        let command_line = command.display_line();

        let mut tokio_cmd = self.build_tokio_command(command);

        let mut child = match tokio_cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let exit_code = if err.kind() == std::io::ErrorKind::NotFound {
                    127
                } else {
                    126
                };
                return Ok(Outcome {
                    stdout: Vec::new(),
                    stderr: err.to_string().into_bytes(),
                    exit_code: Some(exit_code),
                    signal: None,
                    command_line,
                    duration: start.elapsed(),
                    started_at,
                    finished_at: SystemTime::now(),
                    adapter: self.name().to_string(),
                    host: None,
                    container: None,
                    pod: None,
                });
            }
        };

        if let Some(Stdin::Bytes(bytes)) = command.stdin()
            && let Some(mut stdin) = child.stdin.take()
        {
            let bytes = bytes.clone();
            let _ = stdin.write_all(&bytes).await;
            drop(stdin);
        } else {
            drop(child.stdin.take());
        }

        let timeout = command.timeout().or(self.defaults.timeout);
        let max_buffer = self.defaults.max_buffer;

        // Read stdout/stderr on their own tasks so a timeout can kill the child
        // without losing the `Child` handle inside `wait_with_output`'s future.
        // Each task checks its own accumulated length against `max_buffer` on every
        // chunk and reports an overflow over `overflow_tx` as soon as it happens,
        // rather than waiting for the child to exit first.
        let stdout_pipe = child.stdout.take().expect("stdout was piped");
        let stderr_pipe = child.stderr.take().expect("stderr was piped");
        let (overflow_tx, mut overflow_rx) = tokio::sync::mpsc::channel::<()>(2);
        let stdout_task = tokio::spawn(read_capped(stdout_pipe, max_buffer, overflow_tx.clone()));
        let stderr_task = tokio::spawn(read_capped(stderr_pipe, max_buffer, overflow_tx));

        let cancellation = command.cancellation().cloned();

        let race = tokio::select! {
            biased;
            status = child.wait() => Race::Exited(status),
            _ = cancelled(&cancellation) => Race::Cancelled,
            _ = timed_out(timeout), if timeout.is_some() => Race::TimedOut,
            _ = overflow_rx.recv() => Race::BufferOverflow,
        };

        let status = match race {
            Race::Exited(status) => status.map_err(|err| Error::AdapterFailure {
                adapter: self.name().to_string(),
                operation: "execute".to_string(),
                reason: err.to_string(),
            })?,
            Race::TimedOut => {
                // §4.4: graceful terminate first, forceful kill only after the grace
                // period elapses, so a child that handles SIGTERM gets a chance to
                // clean up before it is reaped.
                let _ = terminate_gracefully(&mut child, self.defaults.graceful_timeout).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(Error::Timeout {
                    command: command_line,
                    timeout_ms: timeout.expect("TimedOut only wins when a timeout is set").as_millis() as u64,
                });
            }
            Race::Cancelled => {
                // Per §4.8, cancellation resolves the handle with a signal-bearing
                // Result rather than an error — the caller's exit status (with
                // whatever signal killed it) surfaces below like any other exit.
                terminate_gracefully(&mut child, self.defaults.graceful_timeout)
                    .await
                    .map_err(|err| Error::AdapterFailure {
                        adapter: self.name().to_string(),
                        operation: "execute".to_string(),
                        reason: err.to_string(),
                    })?
            }
            Race::BufferOverflow => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(Error::BufferOverflow {
                    command: command_line,
                    limit: max_buffer,
                });
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if stdout.len() > max_buffer || stderr.len() > max_buffer {
            return Err(Error::BufferOverflow {
                command: command_line,
                limit: max_buffer,
            });
        }

        let signal = signal_name(&status);

        Ok(Outcome {
            stdout,
            stderr,
            exit_code: status.code(),
            signal,
            command_line,
            duration: start.elapsed(),
            started_at,
            finished_at: SystemTime::now(),
            adapter: self.name().to_string(),
            host: None,
            container: None,
            pod: None,
        })
    }

    async fn dispose(&self) {
        // No pooled resources to release.
    }
}

#[cfg(unix)]
fn signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| format!("SIG{sig}"))
}

#[cfg(not(unix))]
fn signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::command::CommandBuilder;

    #[tokio::test]
    async fn runs_a_simple_command() {
        let adapter = LocalAdapter::default();
        let cmd = CommandBuilder::new("echo").arg("hello").build().unwrap();
        let outcome = adapter.execute(&cmd).await.unwrap();
        assert!(outcome.ok());
        assert_eq!(outcome.text(), "hello");
    }

    #[tokio::test]
    async fn reports_nonzero_exit_as_non_ok_outcome() {
        let adapter = LocalAdapter::default();
        let cmd = CommandBuilder::new("sh")
            .arg("-c")
            .arg("exit 3")
            .shell(false)
            .build()
            .unwrap();
        let outcome = adapter.execute(&cmd).await.unwrap();
        assert!(!outcome.ok());
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn missing_program_yields_exit_127() {
        let adapter = LocalAdapter::default();
        let cmd = CommandBuilder::new("definitely-not-a-real-binary-xyz")
            .shell(false)
            .build()
            .unwrap();
        let outcome = adapter.execute(&cmd).await.unwrap();
        assert_eq!(outcome.exit_code, Some(127));
    }

    #[tokio::test]
    async fn times_out_long_running_commands() {
        let adapter = LocalAdapter::default();
        let cmd = CommandBuilder::new("sleep")
            .arg("5")
            .shell(false)
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let err = adapter.execute(&cmd).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn pipes_stdin_through_to_the_child() {
        let adapter = LocalAdapter::default();
        let cmd = CommandBuilder::new("cat")
            .shell(false)
            .stdin("hi there")
            .build()
            .unwrap();
        let outcome = adapter.execute(&cmd).await.unwrap();
        assert_eq!(outcome.text(), "hi there");
    }

    #[tokio::test]
    async fn cancellation_kills_the_child_and_reports_its_signal() {
        let adapter = LocalAdapter::default();
        let token = tokio_util::sync::CancellationToken::new();
        let cmd = CommandBuilder::new("sleep")
            .arg("5")
            .shell(false)
            .cancellation(token.clone())
            .build()
            .unwrap();

        let cancel_soon = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_soon.cancel();
        });

        let outcome = adapter.execute(&cmd).await.unwrap();
        assert!(!outcome.ok());
        assert!(outcome.signal.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_force_kills_a_child_that_ignores_sigterm() {
        let mut defaults = crate::options::AdapterDefaults::default();
        defaults.graceful_timeout = Duration::from_millis(100);
        let adapter = LocalAdapter::new(defaults);
        let cmd = CommandBuilder::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 5")
            .shell(false)
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        let started = Instant::now();
        let err = adapter.execute(&cmd).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        // Grace elapses (~100ms) before SIGKILL reaps the child; well under sleep's 5s.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unbounded_output_with_no_timeout_is_killed_on_buffer_overflow() {
        let mut defaults = crate::options::AdapterDefaults::default();
        defaults.max_buffer = 64;
        let adapter = LocalAdapter::new(defaults);
        // Produces output forever; with no timeout set, only the live max_buffer
        // check can stop this from hanging.
        let cmd = CommandBuilder::new("sh")
            .arg("-c")
            .arg("yes | head -c 1000000")
            .shell(false)
            .build()
            .unwrap();

        let started = Instant::now();
        let err = tokio::time::timeout(Duration::from_secs(5), adapter.execute(&cmd))
            .await
            .expect("buffer overflow should abort well before the test timeout");
        assert!(matches!(err.unwrap_err(), Error::BufferOverflow { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
