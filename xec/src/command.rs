//! # Command Record
//!
//! An immutable description of a program invocation: what to run, with what
//! arguments, where, with what environment, and against which execution context
//! (§3 "Command"). Commands are built through [`CommandBuilder`] and never mutated
//! afterward — every modifier on [`crate::handle::ProcessHandle`] derives a new plan
//! rather than reaching back to change a `Command` in place.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::options::{AdapterOptions, AdapterTarget};

/// Either an in-memory byte payload or a streamed byte source to feed a child's
/// stdin (§3: "an optional standard-input payload (either a byte buffer or a
/// readable byte source)").
pub enum Stdin {
    Bytes(Vec<u8>),
    Stream(Pin<Box<dyn AsyncRead + Send>>),
}

impl std::fmt::Debug for Stdin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stdin::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Stdin::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Vec<u8>> for Stdin {
    fn from(bytes: Vec<u8>) -> Self {
        Stdin::Bytes(bytes)
    }
}

impl From<&str> for Stdin {
    fn from(s: &str) -> Self {
        Stdin::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Stdin {
    fn from(s: String) -> Self {
        Stdin::Bytes(s.into_bytes())
    }
}

/// An immutable request to run a program. See module docs.
#[derive(Debug)]
pub struct Command {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) stdin: Option<Stdin>,
    pub(crate) timeout: Option<Duration>,
    /// `None` means "leave it to the engine's `shell` config" — resolved by
    /// `Engine::apply_defaults` before a command ever reaches an adapter.
    pub(crate) shell: Option<bool>,
    pub(crate) target: AdapterTarget,
    pub(crate) adapter_options: AdapterOptions,
    pub(crate) cancellation: Option<CancellationToken>,
}

impl Command {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&std::path::Path> {
        self.cwd.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether to run through a shell. Defaults to `true` if left unset by both
    /// the command and the owning engine's configuration.
    pub fn shell(&self) -> bool {
        self.shell.unwrap_or(true)
    }

    pub fn target(&self) -> AdapterTarget {
        self.target
    }

    pub fn adapter_options(&self) -> &AdapterOptions {
        &self.adapter_options
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub fn stdin(&self) -> Option<&Stdin> {
        self.stdin.as_ref()
    }

    /// The full program + arguments, space-joined, as it would be logged. Used to
    /// populate `Outcome::command_line` and error messages.
    pub fn display_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    /// Clones every field except `stdin`, which a byte buffer or stream can only be
    /// consumed once and so is never copyable. Used where a `Command` must be
    /// re-issued more than once against a fresh input (pipe downstream targets,
    /// retry attempts after the first).
    pub(crate) fn clone_static(&self) -> Command {
        Command {
            program: self.program.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            stdin: None,
            timeout: self.timeout,
            shell: self.shell,
            target: self.target,
            adapter_options: self.adapter_options.clone(),
            cancellation: self.cancellation.clone(),
        }
    }

    /// Replaces `stdin` with an in-memory byte buffer. Used by the pipe composer to
    /// feed a downstream command the upstream's captured stdout.
    pub(crate) fn set_stdin_bytes(&mut self, bytes: Vec<u8>) {
        self.stdin = Some(Stdin::Bytes(bytes));
    }

    /// The canonical cache key tuple described in §3: program+args (order
    /// preserved), sorted env, cwd, and a signature for the target adapter.
    pub fn canonical_key(&self) -> String {
        let env_part = self
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let cwd_part = self
            .cwd
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        format!(
            "{}|{}|{}|{}|{}",
            self.target,
            self.display_line(),
            cwd_part,
            env_part,
            self.shell()
        )
    }

    pub fn builder(program: impl Into<String>) -> CommandBuilder {
        CommandBuilder::new(program)
    }
}

/// Constructs a [`Command`]. The only way to produce one — `Command` itself
/// exposes no mutators once built.
#[derive(Debug)]
pub struct CommandBuilder {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    stdin: Option<Stdin>,
    timeout: Option<Duration>,
    shell: Option<bool>,
    target: AdapterTarget,
    adapter_options: AdapterOptions,
    cancellation: Option<CancellationToken>,
}

impl CommandBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            stdin: None,
            timeout: None,
            shell: None,
            target: AdapterTarget::Auto,
            adapter_options: AdapterOptions::None,
            cancellation: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    pub fn stdin(mut self, stdin: impl Into<Stdin>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn target(mut self, target: AdapterTarget) -> Self {
        self.target = target;
        self
    }

    pub fn adapter_options(mut self, options: AdapterOptions) -> Self {
        self.adapter_options = options;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Validates and freezes the builder into a [`Command`].
    ///
    /// # Errors
    /// Returns [`Error::AdapterFailure`] if `program` is empty or `timeout` is
    /// zero, per §3's invariants.
    pub fn build(self) -> Result<Command, Error> {
        if self.program.trim().is_empty() {
            return Err(Error::AdapterFailure {
                adapter: self.target.to_string(),
                operation: "build".to_string(),
                reason: "program must not be empty".to_string(),
            });
        }
        if let Some(timeout) = self.timeout
            && timeout.is_zero()
        {
            return Err(Error::AdapterFailure {
                adapter: self.target.to_string(),
                operation: "build".to_string(),
                reason: "timeout must be greater than zero".to_string(),
            });
        }
        Ok(Command {
            program: self.program,
            args: self.args,
            cwd: self.cwd,
            env: self.env,
            stdin: self.stdin,
            timeout: self.timeout,
            shell: self.shell,
            target: self.target,
            adapter_options: self.adapter_options,
            cancellation: self.cancellation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_program() {
        let err = CommandBuilder::new("   ").build().unwrap_err();
        assert!(matches!(err, Error::AdapterFailure { .. }));
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = CommandBuilder::new("echo")
            .timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::AdapterFailure { .. }));
    }

    #[test]
    fn builds_with_defaults() {
        let cmd = CommandBuilder::new("echo").arg("hi").build().unwrap();
        assert_eq!(cmd.program(), "echo");
        assert_eq!(cmd.args(), ["hi"]);
        assert!(cmd.shell());
        assert_eq!(cmd.target(), AdapterTarget::Auto);
    }

    #[test]
    fn canonical_key_is_order_preserving_for_args_and_sorted_for_env() {
        let cmd = CommandBuilder::new("echo")
            .arg("a")
            .arg("b")
            .env("Z", "1")
            .env("A", "2")
            .build()
            .unwrap();
        let key = cmd.canonical_key();
        // BTreeMap already yields sorted env; args preserve insertion order.
        assert!(key.contains("echo a b"));
        assert!(key.find("A=2").unwrap() < key.find("Z=1").unwrap());
    }
}
