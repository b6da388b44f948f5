//! # Outcome
//!
//! The terminal state of an executed [`crate::command::Command`] (§3 "Result" in the
//! language-independent naming — renamed here since `Result` already means something
//! in Rust). Produced once per execution and shared read-only across every observer
//! of a [`crate::handle::ProcessHandle`].

use std::time::{Duration, SystemTime};

/// Everything observed about one finished command execution.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    /// The program + arguments as displayed in logs and error messages.
    pub command_line: String,
    pub duration: Duration,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    /// Name of the adapter that produced this outcome ("local", "ssh", ...).
    pub adapter: String,
    pub host: Option<String>,
    pub container: Option<String>,
    pub pod: Option<String>,
}

impl Outcome {
    /// `true` when the process exited with code 0 and was not killed by a signal.
    pub fn ok(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }

    /// A short description of why the outcome is not ok, or `None` if it is.
    pub fn cause(&self) -> Option<String> {
        if self.ok() {
            return None;
        }
        Some(match (&self.exit_code, &self.signal) {
            (_, Some(sig)) => format!("killed by {sig}"),
            (Some(code), None) => format!("exited with code {code}"),
            (None, None) => "did not produce an exit status".to_string(),
        })
    }

    /// Stdout decoded as UTF-8 (lossily replacing invalid sequences) with exactly
    /// one trailing newline stripped — `"\r\n"` or `"\n"`, whichever is present
    /// (§3, §8: "`.text()` equals `stdout` with one trailing newline stripped").
    pub fn text(&self) -> String {
        let text = String::from_utf8_lossy(&self.stdout).into_owned();
        match text.strip_suffix("\r\n").or_else(|| text.strip_suffix('\n')) {
            Some(stripped) => stripped.to_string(),
            None => text,
        }
    }

    /// Stdout parsed as JSON.
    ///
    /// # Errors
    /// Propagates `serde_json`'s parse error if stdout is not valid JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.stdout)
    }

    /// Stdout split into non-empty trimmed lines.
    pub fn lines(&self) -> Vec<String> {
        self.text()
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Stderr decoded as UTF-8, lossily replacing invalid sequences.
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Raw stdout bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.stdout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_outcome(exit_code: Option<i32>, signal: Option<String>) -> Outcome {
        let now = SystemTime::UNIX_EPOCH;
        Outcome {
            stdout: b"line one\nline two\n".to_vec(),
            stderr: Vec::new(),
            exit_code,
            signal,
            command_line: "echo hi".to_string(),
            duration: Duration::from_millis(5),
            started_at: now,
            finished_at: now,
            adapter: "local".to_string(),
            host: None,
            container: None,
            pod: None,
        }
    }

    #[test]
    fn ok_requires_zero_exit_and_no_signal() {
        assert!(base_outcome(Some(0), None).ok());
        assert!(!base_outcome(Some(1), None).ok());
        assert!(!base_outcome(None, Some("SIGKILL".into())).ok());
    }

    #[test]
    fn cause_describes_failure_reason() {
        assert_eq!(base_outcome(Some(0), None).cause(), None);
        assert_eq!(
            base_outcome(Some(2), None).cause(),
            Some("exited with code 2".to_string())
        );
        assert_eq!(
            base_outcome(None, Some("SIGKILL".into())).cause(),
            Some("killed by SIGKILL".to_string())
        );
    }

    #[test]
    fn text_strips_exactly_one_trailing_newline() {
        let mut outcome = base_outcome(Some(0), None);
        outcome.stdout = b"hello\n".to_vec();
        assert_eq!(outcome.text(), "hello");

        outcome.stdout = b"hello\r\n".to_vec();
        assert_eq!(outcome.text(), "hello");

        outcome.stdout = b"hello\n\n".to_vec();
        assert_eq!(outcome.text(), "hello\n");

        outcome.stdout = b"hello".to_vec();
        assert_eq!(outcome.text(), "hello");
    }

    #[test]
    fn lines_skips_blank_lines() {
        let outcome = base_outcome(Some(0), None);
        assert_eq!(outcome.lines(), vec!["line one", "line two"]);
    }

    #[test]
    fn json_parses_stdout() {
        let mut outcome = base_outcome(Some(0), None);
        outcome.stdout = br#"{"a":1}"#.to_vec();
        let value: serde_json::Value = outcome.json().unwrap();
        assert_eq!(value["a"], 1);
    }
}
