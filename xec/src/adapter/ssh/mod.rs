//! # SSH Adapter
//!
//! Runs commands over a pooled SSH session channel (§4.2), and exposes local-to-remote
//! port tunnels built on the same pool.

mod connect;
mod handler;
pub mod pool;
pub mod tunnel;

pub use handler::XecSshHandler;
pub use pool::{SshConnectionPool, SshPoolConfig, SshPoolMetrics};
pub use tunnel::Tunnel;

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use russh::ChannelMsg;

use crate::adapter::Adapter;
use crate::command::{Command, Stdin};
use crate::error::Error;
use crate::interpolate::escape_shell_argument;
use crate::options::{AdapterDefaults, AdapterOptions, SshOptions};
use crate::outcome::Outcome;

/// Executes commands over pooled SSH sessions.
pub struct SshAdapter {
    pool: Arc<SshConnectionPool>,
    defaults: AdapterDefaults,
}

impl std::fmt::Debug for SshAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshAdapter").finish_non_exhaustive()
    }
}

impl SshAdapter {
    pub fn new(pool: Arc<SshConnectionPool>, defaults: AdapterDefaults) -> Self {
        Self { pool, defaults }
    }

    pub fn pool(&self) -> &Arc<SshConnectionPool> {
        &self.pool
    }

    fn options_of(command: &Command) -> Result<&SshOptions, Error> {
        match command.adapter_options() {
            AdapterOptions::Ssh(opts) => Ok(opts),
            _ => Err(Error::AdapterFailure {
                adapter: "ssh".to_string(),
                operation: "execute".to_string(),
                reason: "command is missing SshOptions".to_string(),
            }),
        }
    }

    /// Builds the string sent as the `exec` channel request's command (§4.3:
    /// "honour ... the `shell` flag (invoke via shell interpreter if true, else
    /// direct exec)"). Mirrors the branch every other adapter makes on this flag
    /// (`local.rs::build_tokio_command`, `container.rs::exec_in`,
    /// `k8s.rs::build_remote_argv`): when `shell()` is `false` and there is no
    /// cwd/env override that needs a shell to apply it, the program and arguments
    /// are sent unquoted and space-joined so the remote side execs them directly
    /// instead of handing them to `sh -c`. A `cwd`/`env` override (or `shell()` ==
    /// `true`) still needs `cd ... && KEY=val ... program args`, which only a shell
    /// can interpret, so that path keeps POSIX-quoting every token.
    fn build_remote_command_line(command: &Command) -> String {
        if !command.shell() && command.cwd().is_none() && command.env().is_empty() {
            let mut line = command.program().to_string();
            for arg in command.args() {
                line.push(' ');
                line.push_str(arg);
            }
            return line;
        }

        let mut line = String::new();
        if let Some(cwd) = command.cwd() {
            line.push_str("cd ");
            line.push_str(&escape_shell_argument(&cwd.display().to_string()));
            line.push_str(" && ");
        }
        for (key, value) in command.env() {
            line.push_str(key);
            line.push('=');
            line.push_str(&escape_shell_argument(value));
            line.push(' ');
        }
        line.push_str(command.program());
        for arg in command.args() {
            line.push(' ');
            line.push_str(&escape_shell_argument(arg));
        }
        line
    }
}

#[async_trait]
impl Adapter for SshAdapter {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn validate_config(&self, command: &Command) -> Result<(), Error> {
        Self::options_of(command).map(|_| ())
    }

    async fn execute(&self, command: &Command) -> Result<Outcome, Error> {
        let options = Self::options_of(command)?;
        let started_at = SystemTime::now();
        let start = Instant::now();
        let command_line = command.display_line();

        let handle = self.pool.acquire(options).await?;

        let exec_result = run_over_channel(&handle, command, &self.defaults).await;

        match exec_result {
            Ok((stdout, stderr, exit_code, signal)) => {
                self.pool.release(options, handle).await;
                Ok(Outcome {
                    stdout,
                    stderr,
                    exit_code,
                    signal,
                    command_line,
                    duration: start.elapsed(),
                    started_at,
                    finished_at: SystemTime::now(),
                    adapter: self.name().to_string(),
                    host: Some(options.host.clone()),
                    container: None,
                    pod: None,
                })
            }
            Err(err) => {
                self.pool.discard(options, handle).await;
                Err(err)
            }
        }
    }

    async fn dispose(&self) {
        self.pool.shutdown().await;
    }
}

async fn run_over_channel(
    handle: &russh::client::Handle<XecSshHandler>,
    command: &Command,
    defaults: &AdapterDefaults,
) -> Result<(Vec<u8>, Vec<u8>, Option<i32>, Option<String>), Error> {
    let command_line_for_errors = command.display_line();
    let mut channel = handle.channel_open_session().await.map_err(|err| Error::Connection {
        host: "ssh".to_string(),
        cause: err.to_string(),
        source: Some(Box::new(err)),
    })?;

    let remote_line = SshAdapter::build_remote_command_line(command);
    channel
        .exec(true, remote_line.as_bytes())
        .await
        .map_err(|err| Error::AdapterFailure {
            adapter: "ssh".to_string(),
            operation: "exec".to_string(),
            reason: err.to_string(),
        })?;

    if let Some(Stdin::Bytes(bytes)) = command.stdin() {
        channel.data(bytes.as_slice()).await.map_err(|err| Error::AdapterFailure {
            adapter: "ssh".to_string(),
            operation: "stdin".to_string(),
            reason: err.to_string(),
        })?;
    }
    channel.eof().await.map_err(|err| Error::AdapterFailure {
        adapter: "ssh".to_string(),
        operation: "stdin".to_string(),
        reason: err.to_string(),
    })?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;
    let mut signal = None;
    let timeout = command.timeout().or(defaults.timeout);
    let max_buffer = defaults.max_buffer;

    let read_loop = async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExtendedData { .. } => {}
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status as i32),
                ChannelMsg::ExitSignal { signal_name, .. } => signal = Some(format!("{signal_name:?}")),
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
            if stdout.len() > max_buffer || stderr.len() > max_buffer {
                return Err(Error::BufferOverflow {
                    command: command_line_for_errors.clone(),
                    limit: max_buffer,
                });
            }
        }
        Ok(())
    };

    match timeout {
        Some(duration) => tokio::time::timeout(duration, read_loop).await.map_err(|_| Error::Timeout {
            command: command_line_for_errors.clone(),
            timeout_ms: duration.as_millis() as u64,
        })??,
        None => read_loop.await?,
    }

    Ok((stdout, stderr, exit_code, signal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBuilder;

    #[test]
    fn shell_false_with_no_overrides_sends_argv_unquoted() {
        let command = CommandBuilder::new("echo")
            .arg("hello world")
            .shell(false)
            .build()
            .unwrap();
        assert_eq!(SshAdapter::build_remote_command_line(&command), "echo hello world");
    }

    #[test]
    fn shell_true_still_quotes_arguments() {
        let command = CommandBuilder::new("echo")
            .arg("hello; rm -rf /")
            .shell(true)
            .build()
            .unwrap();
        let line = SshAdapter::build_remote_command_line(&command);
        assert_eq!(line, "echo 'hello; rm -rf /'");
    }

    #[test]
    fn shell_false_with_cwd_override_still_needs_a_shell() {
        let command = CommandBuilder::new("echo")
            .arg("hi")
            .shell(false)
            .cwd("/tmp")
            .build()
            .unwrap();
        let line = SshAdapter::build_remote_command_line(&command);
        assert_eq!(line, "cd /tmp && echo hi");
    }

    #[test]
    fn shell_false_with_env_override_still_needs_a_shell() {
        let command = CommandBuilder::new("echo")
            .arg("hi")
            .shell(false)
            .env("FOO", "bar")
            .build()
            .unwrap();
        let line = SshAdapter::build_remote_command_line(&command);
        assert_eq!(line, "FOO=bar echo hi");
    }
}
