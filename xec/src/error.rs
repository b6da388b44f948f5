//! # Error Taxonomy
//!
//! One enum per failure *kind* named in the engine's error model, not per adapter.
//! Every execution path — local, SSH, container, Kubernetes — funnels its failures
//! through these variants so callers can match on `Error` without caring which
//! adapter produced it.

use std::time::Duration;

use crate::command::Command;
use crate::outcome::Outcome;

/// The engine's unified error type.
///
/// `nothrow()` on a [`crate::handle::ProcessHandle`] converts any of these into a
/// non-ok [`Outcome`] instead of propagating them; everywhere else they surface as
/// `Err(Error)`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The child exited with a non-zero code or was killed by a fatal signal.
    #[error("command failed: {command} (exit {})", ExitDisplay(*exit_code, signal.clone()))]
    CommandFailure {
        command: String,
        exit_code: Option<i32>,
        signal: Option<String>,
        stdout_excerpt: String,
        stderr_excerpt: String,
        duration: Duration,
    },

    /// The command's deadline elapsed before it finished.
    #[error("command timed out after {timeout_ms}ms: {command}")]
    Timeout { command: String, timeout_ms: u64 },

    /// An SSH transport, authentication, or reconnect-exhaustion failure.
    #[error("ssh connection to {host} failed: {cause}")]
    Connection {
        host: String,
        cause: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The container runtime reported an error performing an operation.
    #[error("container operation '{operation}' failed for {container}: {cause}")]
    ContainerOperation {
        container: String,
        operation: String,
        cause: String,
    },

    /// A generic adapter-level failure: misconfiguration or an unsupported operation.
    #[error("adapter '{adapter}' cannot perform '{operation}': {reason}")]
    AdapterFailure {
        adapter: String,
        operation: String,
        reason: String,
    },

    /// A template value could not be serialized into a shell token (e.g. a cyclic
    /// object reachable only via `serde_json::Value` is not representable here, but
    /// non-finite floats and other unserializable scalars land here too).
    #[error("cannot interpolate value: {reason}")]
    Interpolation { reason: String },

    /// Captured output exceeded the adapter's configured `max_buffer`.
    #[error("output exceeded max_buffer ({limit} bytes) for: {command}")]
    BufferOverflow { command: String, limit: usize },

    /// The caller's signal, an owning engine's dispose, or a losing `parallel`
    /// branch cancelled this execution before it produced a result.
    #[error("cancelled: {command}")]
    Cancelled { command: String },

    /// A container's healthcheck did not report healthy before its deadline.
    #[error("container {container} did not become healthy within {timeout_ms}ms")]
    HealthcheckTimeout { container: String, timeout_ms: u64 },
}

struct ExitDisplay(Option<i32>, Option<String>);

impl std::fmt::Display for ExitDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.0, &self.1) {
            (Some(code), _) => write!(f, "{code}"),
            (None, Some(sig)) => write!(f, "killed by {sig}"),
            (None, None) => write!(f, "unknown"),
        }
    }
}

impl Error {
    /// Builds a [`Error::CommandFailure`] from a finished [`Outcome`], truncating
    /// stdout/stderr to a short excerpt the way `§7` specifies for user-visible
    /// messages. `sanitize` mirrors `EngineConfig::sanitize_commands`.
    pub fn from_outcome(command: &Command, outcome: &Outcome, sanitize: bool) -> Self {
        const EXCERPT_LEN: usize = 2048;
        Error::CommandFailure {
            command: outcome.command_line.clone(),
            exit_code: outcome.exit_code,
            signal: outcome.signal.clone(),
            stdout_excerpt: excerpt(&outcome.stdout, EXCERPT_LEN),
            stderr_excerpt: excerpt(&outcome.stderr, EXCERPT_LEN),
            duration: outcome.duration,
        }
        .tap_sanitize(command, sanitize)
    }

    /// Returns the sanitized command line when `sanitize` is set, per §6. This is
    /// applied lazily at message-construction time rather than stored redacted, so
    /// a caller inspecting raw fields still sees the real command.
    fn tap_sanitize(self, command: &Command, sanitize: bool) -> Self {
        if !sanitize {
            return self;
        }
        match self {
            Error::CommandFailure {
                exit_code,
                signal,
                stdout_excerpt,
                stderr_excerpt,
                duration,
                ..
            } => Error::CommandFailure {
                command: sanitize_command_line(command.program(), command.args(), 32),
                exit_code,
                signal,
                stdout_excerpt,
                stderr_excerpt,
                duration,
            },
            other => other,
        }
    }

    pub fn is_retryable_default(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::Connection { .. }
                | Error::BufferOverflow { .. }
                | Error::CommandFailure { .. }
                | Error::HealthcheckTimeout { .. }
        )
    }

    /// Reconstructs the non-ok [`Outcome`] a `CommandFailure` was built from, for
    /// `nothrow()` (§7: suppressible only for this variant — every other kind
    /// passes through unchanged).
    pub fn into_nothrow_outcome(self) -> Result<Outcome, Error> {
        match self {
            Error::CommandFailure {
                command,
                exit_code,
                signal,
                stdout_excerpt,
                stderr_excerpt,
                duration,
            } => {
                let now = std::time::SystemTime::now();
                Ok(Outcome {
                    stdout: stdout_excerpt.into_bytes(),
                    stderr: stderr_excerpt.into_bytes(),
                    exit_code,
                    signal,
                    command_line: command,
                    duration,
                    started_at: now.checked_sub(duration).unwrap_or(now),
                    finished_at: now,
                    adapter: String::new(),
                    host: None,
                    container: None,
                    pod: None,
                })
            }
            other => Err(other),
        }
    }
}

fn excerpt(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max {
        text.into_owned()
    } else {
        format!("{}… ({} bytes truncated)", &text[..max], text.len() - max)
    }
}

/// Known sensitive-argument programs redacted in error messages when
/// `XEC_SANITIZE_COMMANDS=true` (§6).
pub const SANITIZED_PROGRAMS: &[&str] = &[
    "cat", "ls", "rm", "cp", "mv", "chmod", "chown", "find", "grep",
];

/// Truncates an overlong argument list to `"<program> … (N arguments)"` and/or
/// redacts arguments of a sensitive program, as configured by
/// `XEC_SANITIZE_COMMANDS`. `max_args` bounds how many arguments are kept before
/// truncation kicks in.
pub fn sanitize_command_line(program: &str, args: &[String], max_args: usize) -> String {
    if SANITIZED_PROGRAMS.contains(&program) {
        return format!("{program} <redacted {} arguments>", args.len());
    }
    if args.len() > max_args {
        return format!("{program} … ({} arguments)", args.len());
    }
    let mut parts = vec![program.to_string()];
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

/// Reads `XEC_SANITIZE_COMMANDS` once. Disabled automatically under `cfg(test)`
/// so assertions on raw command strings remain stable, matching §6's "Disabled
/// automatically in test environments."
pub fn sanitize_commands_enabled() -> bool {
    if cfg!(test) {
        return false;
    }
    std::env::var("XEC_SANITIZE_COMMANDS")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_known_sensitive_programs() {
        let line = sanitize_command_line("rm", &["-rf".into(), "/tmp/x".into()], 10);
        assert_eq!(line, "rm <redacted 2 arguments>");
    }

    #[test]
    fn truncates_long_argument_lists() {
        let args: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        let line = sanitize_command_line("echo", &args, 5);
        assert_eq!(line, "echo … (20 arguments)");
    }

    #[test]
    fn leaves_short_non_sensitive_commands_alone() {
        let line = sanitize_command_line("git", &["status".into()], 10);
        assert_eq!(line, "git status");
    }

    #[test]
    fn test_env_disabled_by_default_in_tests() {
        assert!(!sanitize_commands_enabled());
    }
}
