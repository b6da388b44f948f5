//! # Pipe Composer
//!
//! Chains the captured stdout of one execution into a downstream command, byte
//! transform, sink, or line callback (§4.9). Grounded on the pack's
//! `callback_system` broadcast style for the sink/line variants, and on the
//! adapters' own buffered-capture model for commands: since every [`crate::adapter`]
//! returns a fully materialized [`crate::outcome::Outcome`] rather than a live byte
//! stream, a pipe stage here runs strictly after its upstream has finished rather
//! than overlapping byte-for-byte. This still satisfies §5's ordering guarantee
//! (downstream never sees upstream bytes out of order, and never starts before
//! upstream produced them) — it is simply not low-latency streaming, which would
//! require restructuring every adapter's capture loop around the pipe composer
//! instead of the other way around.

use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;

use crate::command::Command;
use crate::error::Error;
use crate::outcome::Outcome;

/// Tunables for one pipe stage (§4.9 and §9 Open Question #1).
#[derive(Clone)]
pub struct PipeOptions {
    /// When the upstream execution errors, the downstream is skipped and the
    /// upstream error propagates (default `true`, per §4.9's default). Set `false`
    /// (or apply `.nothrow()` upstream) to run the downstream against whatever
    /// output the failed upstream produced.
    pub throw_on_error: bool,
    /// §9 Open Question #1: stderr does not participate in piping by default.
    /// Setting this merges upstream stderr into the bytes handed downstream
    /// (appended after stdout, unordered relative to it).
    pub include_stderr: bool,
    /// Line separator used by [`Stage::Lines`] and [`grep`]/line-mode utilities.
    pub line_separator: String,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            throw_on_error: true,
            include_stderr: false,
            line_separator: "\n".to_string(),
        }
    }
}

impl PipeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throw_on_error(mut self, value: bool) -> Self {
        self.throw_on_error = value;
        self
    }

    pub fn include_stderr(mut self, value: bool) -> Self {
        self.include_stderr = value;
        self
    }

    pub fn line_separator(mut self, sep: impl Into<String>) -> Self {
        self.line_separator = sep.into();
        self
    }
}

type ByteTransform = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;
type ByteSink = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;
type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One step of a pipeline, built by [`crate::handle::ProcessHandle::pipe`] or the
/// utility constructors below.
pub enum Stage {
    ToCommand(Command, PipeOptions),
    Transform(ByteTransform),
    Sink(ByteSink),
    Lines(String, LineCallback),
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::ToCommand(cmd, opts) => f
                .debug_struct("ToCommand")
                .field("command", &cmd.display_line())
                .field("throw_on_error", &opts.throw_on_error)
                .finish(),
            Stage::Transform(_) => f.write_str("Transform(..)"),
            Stage::Sink(_) => f.write_str("Sink(..)"),
            Stage::Lines(sep, _) => f.debug_tuple("Lines").field(sep).finish(),
        }
    }
}

/// Builds a [`Stage::Transform`] that uppercases captured stdout.
pub fn to_uppercase() -> Stage {
    Stage::Transform(Arc::new(|bytes| String::from_utf8_lossy(&bytes).to_uppercase().into_bytes()))
}

/// Builds a [`Stage::Transform`] that keeps only lines matching `pattern`
/// (a plain substring or, if it fails to parse as one, a regular expression).
pub fn grep(pattern: impl Into<String>) -> Stage {
    let pattern = pattern.into();
    let regex = Regex::new(&pattern).ok();
    Stage::Transform(Arc::new(move |bytes| {
        let text = String::from_utf8_lossy(&bytes);
        let kept: Vec<&str> = text
            .lines()
            .filter(|line| match &regex {
                Some(re) => re.is_match(line),
                None => line.contains(&pattern),
            })
            .collect();
        let mut out = kept.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out.into_bytes()
    }))
}

/// Builds a [`Stage::Transform`] replacing every match of `pattern` (a regular
/// expression) with `replacement`.
pub fn replace(pattern: &str, replacement: impl Into<String>) -> Result<Stage, Error> {
    let regex = Regex::new(pattern).map_err(|err| Error::Interpolation {
        reason: format!("invalid pipe replace pattern: {err}"),
    })?;
    let replacement = replacement.into();
    Ok(Stage::Transform(Arc::new(move |bytes| {
        let text = String::from_utf8_lossy(&bytes);
        regex.replace_all(&text, replacement.as_str()).into_owned().into_bytes()
    })))
}

/// Builds a [`Stage::Sink`] that duplicates upstream bytes into every sink stage in
/// `destinations` (run concurrently) while still passing the bytes through
/// unchanged to whatever stage follows `tee` in the pipeline.
pub fn tee(destinations: Vec<Stage>) -> Stage {
    let destinations = Arc::new(destinations);
    Stage::Sink(Arc::new(move |bytes: Vec<u8>| {
        let destinations = destinations.clone();
        Box::pin(async move {
            let futures = destinations.iter().map(|stage| apply_side_effect(stage, bytes.clone()));
            futures::future::join_all(futures).await;
        })
    }))
}

async fn apply_side_effect(stage: &Stage, bytes: Vec<u8>) {
    match stage {
        Stage::Sink(sink) => sink(bytes).await,
        Stage::Lines(sep, callback) => {
            for line in split_lines(&bytes, sep) {
                callback(&line);
            }
        }
        Stage::Transform(_) | Stage::ToCommand(..) => {
            tracing::warn!("tee destination must be a sink or line callback; ignoring");
        }
    }
}

fn split_lines(bytes: &[u8], separator: &str) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    text.split(separator).filter(|l| !l.is_empty()).map(str::to_string).collect()
}

/// Runs one pipeline stage against the result of the previous stage (or the
/// original upstream execution), producing the `Outcome` the next stage (or the
/// caller) observes.
pub(crate) async fn run_stage(
    upstream: Result<Outcome, Error>,
    stage: &Stage,
    executor: &(dyn Fn(Command) -> BoxFuture<'static, Result<Outcome, Error>> + Send + Sync),
) -> Result<Outcome, Error> {
    match stage {
        Stage::ToCommand(downstream, opts) => {
            let upstream_outcome = match upstream {
                Ok(outcome) => outcome,
                Err(err) if opts.throw_on_error => return Err(err),
                Err(_) => return run_downstream(downstream.clone_static(), Vec::new(), executor).await,
            };
            let mut stdin = upstream_outcome.stdout.clone();
            if opts.include_stderr {
                stdin.extend_from_slice(&upstream_outcome.stderr);
            }
            run_downstream(downstream.clone_static(), stdin, executor).await
        }
        Stage::Transform(transform) => {
            let mut outcome = upstream?;
            outcome.stdout = transform(outcome.stdout);
            Ok(outcome)
        }
        Stage::Sink(sink) => {
            let outcome = upstream?;
            sink(outcome.stdout.clone()).await;
            Ok(outcome)
        }
        Stage::Lines(sep, callback) => {
            let outcome = upstream?;
            for line in split_lines(&outcome.stdout, sep) {
                callback(&line);
            }
            Ok(outcome)
        }
    }
}

async fn run_downstream(
    mut downstream: Command,
    stdin: Vec<u8>,
    executor: &(dyn Fn(Command) -> BoxFuture<'static, Result<Outcome, Error>> + Send + Sync),
) -> Result<Outcome, Error> {
    downstream.set_stdin_bytes(stdin);
    executor(downstream).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grep_keeps_only_matching_lines() {
        let Stage::Transform(transform) = grep("error") else {
            panic!("expected a transform stage")
        };
        let out = transform(b"ok\nerror: boom\nok again\n".to_vec());
        assert_eq!(String::from_utf8(out).unwrap(), "error: boom\n");
    }

    #[test]
    fn to_uppercase_transforms_bytes() {
        let Stage::Transform(transform) = to_uppercase() else {
            panic!("expected a transform stage")
        };
        assert_eq!(transform(b"hi".to_vec()), b"HI".to_vec());
    }

    #[test]
    fn replace_substitutes_matches() {
        let Stage::Transform(transform) = replace(r"\d+", "N").unwrap() else {
            panic!("expected a transform stage")
        };
        assert_eq!(transform(b"v1 v22".to_vec()), b"vN vN".to_vec());
    }

    #[test]
    fn replace_rejects_invalid_regex() {
        assert!(replace("(", "x").is_err());
    }
}
