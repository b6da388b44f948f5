//! # Process Handle
//!
//! A lazy, single-shot future over an in-flight execution (§4.8), grounded on the
//! re-architecture note in §9: "represent as a builder object holding a plan; the
//! adapter call starts on first terminal method... terminal operations share one
//! memoized underlying future so multiple observers see identical outcomes." The
//! memoized future's error type is `Arc<Error>` rather than bare `Error` — `Error`
//! itself is not `Clone` (its `Connection`/transport `source` is a boxed trait
//! object), and sharing one `Arc` across every observer is in fact a stronger
//! reading of "the *same* underlying error" than cloning a value would be.

use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;

use crate::cache::CacheOptions;
use crate::command::Command;
use crate::engine::Engine;
use crate::error::Error;
use crate::outcome::Outcome;
use crate::pipe::{self, PipeOptions, Stage};
use crate::retry::RetryConfig;

type SharedOutcome = Shared<BoxFuture<'static, Result<Outcome, Arc<Error>>>>;

/// Error surfaced by [`ProcessHandle`]'s terminal methods: either the shared
/// execution failed, or (for `.json()`) its stdout did not parse.
#[derive(Debug, Clone)]
pub enum HandleError {
    Execution(Arc<Error>),
    Json(String),
}

impl std::fmt::Display for HandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandleError::Execution(err) => write!(f, "{err}"),
            HandleError::Json(reason) => write!(f, "failed to parse stdout as json: {reason}"),
        }
    }
}

impl std::error::Error for HandleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandleError::Execution(err) => Some(err.as_ref()),
            HandleError::Json(_) => None,
        }
    }
}

impl From<Arc<Error>> for HandleError {
    fn from(err: Arc<Error>) -> Self {
        HandleError::Execution(err)
    }
}

/// The not-yet-started plan a handle derives through its modifier methods.
struct Plan {
    engine: Engine,
    command: Command,
    nothrow: bool,
    quiet: bool,
    interactive: bool,
    retry: Option<RetryConfig>,
    cache: Option<CacheOptions>,
    pipeline: Vec<Stage>,
}

/// A single-use future over one execution, with a fluent chain of modifiers applied
/// before the first terminal call (await / `.text()` / `.json()` / `.lines()`).
pub struct ProcessHandle {
    plan: Mutex<Option<Plan>>,
    shared: tokio::sync::OnceCell<SharedOutcome>,
    cancellation: CancellationToken,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").finish_non_exhaustive()
    }
}

impl ProcessHandle {
    pub(crate) fn new(engine: Engine, command: Command, cancellation: CancellationToken) -> Self {
        Self {
            plan: Mutex::new(Some(Plan {
                engine,
                command,
                nothrow: false,
                quiet: false,
                interactive: false,
                retry: None,
                cache: None,
                pipeline: Vec::new(),
            })),
            shared: tokio::sync::OnceCell::new(),
            cancellation,
        }
    }

    fn with_plan(self, f: impl FnOnce(&mut Plan)) -> Self {
        {
            let mut guard = self.plan.lock().expect("process handle plan lock poisoned");
            let plan = guard.as_mut().expect(
                "modifiers cannot be applied after the handle has started — it is single-use past the first terminal call",
            );
            f(plan);
        }
        self
    }

    /// Non-zero exit / fatal signal no longer propagates as `Err`; the awaited
    /// value becomes a non-ok [`Outcome`] instead. Every other failure kind
    /// (timeout, connection, buffer overflow, cancellation) is not suppressible —
    /// only `CommandFailure` is, per §7.
    pub fn nothrow(self) -> Self {
        self.with_plan(|plan| plan.nothrow = true)
    }

    /// Suppresses adapter-level live output forwarding. Captured stdout/stderr are
    /// unaffected.
    pub fn quiet(self) -> Self {
        self.with_plan(|plan| plan.quiet = true)
    }

    /// Binds the caller's terminal to the child: no capture, terminal streams wired
    /// through. Adapters that cannot honor this (anything but the local adapter)
    /// ignore the flag; it only changes local-adapter stdio inheritance.
    pub fn interactive(self) -> Self {
        self.with_plan(|plan| plan.interactive = true)
    }

    /// Wraps execution in a retry policy (§4.11). Consulted only by the outer call
    /// when also combined with `.cache(..)` — see §9 Open Question #3.
    pub fn retry(self, plan_config: RetryConfig) -> Self {
        self.with_plan(|plan| plan.retry = Some(plan_config))
    }

    /// Wraps execution in the result cache (§4.12).
    pub fn cache(self, opts: CacheOptions) -> Self {
        self.with_plan(|plan| plan.cache = Some(opts))
    }

    /// Chains this handle's stdout into `downstream`, started once this execution's
    /// output is available (§4.9).
    pub fn pipe_to_command(self, downstream: Command, opts: PipeOptions) -> Self {
        self.with_plan(|plan| plan.pipeline.push(Stage::ToCommand(downstream, opts)))
    }

    /// Appends an arbitrary pipe [`Stage`] (transform, sink, or line callback).
    pub fn pipe_stage(self, stage: Stage) -> Self {
        self.with_plan(|plan| plan.pipeline.push(stage))
    }

    /// Splits stdout into lines and invokes `callback` for each non-final line
    /// (§4.9's "line callback" pipe target).
    pub fn pipe_lines(self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.with_plan(|plan| plan.pipeline.push(Stage::Lines("\n".to_string(), Arc::new(callback))))
    }

    /// Cancels the in-flight (or not-yet-started) execution. If called before any
    /// terminal method, the handle resolves to a `Cancelled` error on first await.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    async fn shared(&self) -> SharedOutcome {
        self.shared
            .get_or_init(|| async {
                let plan = self
                    .plan
                    .lock()
                    .expect("process handle plan lock poisoned")
                    .take()
                    .expect("shared future initialized exactly once via OnceCell");
                run_plan(plan, self.cancellation.clone()).boxed().shared()
            })
            .await
            .clone()
    }

    /// Awaits the handle, returning its `Outcome` (or the shared execution error).
    /// Safe to call more than once; every call (and every `.text()`/`.json()`/
    /// `.lines()`/`.buffer()` call) observes the identical result.
    pub async fn result(&self) -> Result<Outcome, HandleError> {
        self.shared().await.await.map_err(HandleError::from)
    }

    /// Stdout decoded as UTF-8 with one trailing newline stripped, per §3's
    /// `text()` view.
    pub async fn text(&self) -> Result<String, HandleError> {
        self.result().await.map(|outcome| outcome.text())
    }

    /// Stdout parsed as JSON, per §3's `json()` view.
    pub async fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HandleError> {
        let outcome = self.result().await?;
        outcome.json().map_err(|err| HandleError::Json(err.to_string()))
    }

    /// Stdout split into non-empty lines, per §3's `lines()` view.
    pub async fn lines(&self) -> Result<Vec<String>, HandleError> {
        self.result().await.map(|outcome| outcome.lines())
    }

    /// Raw captured stdout bytes, per §3's `buffer()` view.
    pub async fn buffer(&self) -> Result<Vec<u8>, HandleError> {
        self.result().await.map(|outcome| outcome.stdout)
    }
}

async fn run_plan(plan: Plan, cancellation: CancellationToken) -> Result<Outcome, Arc<Error>> {
    let Plan {
        engine,
        command,
        nothrow,
        quiet: _,
        interactive: _,
        retry,
        cache,
        pipeline,
    } = plan;

    let mut current = engine.run(command, retry, cache, nothrow, cancellation).await;

    if !pipeline.is_empty() {
        let executor = engine.command_executor();
        for stage in &pipeline {
            current = pipe::run_stage(current, stage, executor.as_ref()).await;
        }
    }

    if nothrow {
        current = match current {
            Err(err) => err.into_nothrow_outcome(),
            ok => ok,
        };
    }

    current.map_err(Arc::new)
}

impl IntoFuture for ProcessHandle {
    type Output = Result<Outcome, HandleError>;
    type IntoFuture = Pin<Box<dyn std::future::Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.result().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBuilder;

    #[tokio::test]
    async fn result_is_memoized_across_multiple_terminal_calls() {
        let engine = Engine::local();
        let command = CommandBuilder::new("echo").arg("hi").build().unwrap();
        let handle = engine.execute(command);

        let first = handle.text().await.unwrap();
        let second = handle.text().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "hi");
    }

    #[tokio::test]
    async fn nothrow_turns_command_failure_into_a_non_ok_outcome() {
        let engine = Engine::local();
        let command = CommandBuilder::new("sh").arg("-c").arg("exit 7").build().unwrap();
        let outcome = engine.execute(command).nothrow().result().await.unwrap();
        assert!(!outcome.ok());
        assert_eq!(outcome.exit_code, Some(7));
    }

    #[tokio::test]
    async fn without_nothrow_nonzero_exit_surfaces_as_command_failure() {
        let engine = Engine::local();
        let command = CommandBuilder::new("sh").arg("-c").arg("exit 7").build().unwrap();
        let err = engine.execute(command).result().await.unwrap_err();
        assert!(matches!(*err_inner(&err), Error::CommandFailure { .. }));
    }

    #[tokio::test]
    async fn cache_nothrow_pipe_still_skips_downstream_on_upstream_failure() {
        // Regression: `Engine::run_cached` used to convert a failed upstream into a
        // non-ok `Ok(Outcome)` before the pipe loop ever saw it, so the downstream
        // ran against the failed command's output despite the default
        // `throw_on_error=true` (§4.9). It must behave identically to the
        // uncached path: the downstream is skipped and the upstream's own
        // exit code/outcome comes back once `nothrow()` converts the error.
        let engine = Engine::local();
        let upstream = CommandBuilder::new("sh").arg("-c").arg("exit 9").build().unwrap();
        let downstream = CommandBuilder::new("echo").arg("should not run").build().unwrap();

        let outcome = engine
            .execute(upstream)
            .cache(CacheOptions::new().key("cache-nothrow-pipe-skip-test"))
            .nothrow()
            .pipe_to_command(downstream, PipeOptions::default())
            .result()
            .await
            .unwrap();

        assert!(!outcome.ok());
        assert_eq!(outcome.exit_code, Some(9));
    }

    fn err_inner(err: &HandleError) -> &Error {
        match err {
            HandleError::Execution(arc) => arc.as_ref(),
            HandleError::Json(_) => panic!("expected an execution error"),
        }
    }
}
