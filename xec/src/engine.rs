//! # Engine
//!
//! The adapter registry, event bus, result cache, and configuration behind every
//! [`crate::handle::ProcessHandle`] (§4.13). Grounded on the teacher's
//! `ahma_common`-style shared-state service object: one long-lived instance per
//! adapter kind behind an `Arc`, with cheap, copy-on-write derivation for
//! per-call configuration overrides.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::adapter::Adapter;
use crate::adapter::local::LocalAdapter;
use crate::cache::{CacheOptions, ResultCache};
use crate::command::{Command, CommandBuilder};
use crate::config::EngineConfig;
use crate::error::Error;
use crate::events::{Event, EventBus, EventSubscriber};
use crate::handle::ProcessHandle;
use crate::interpolate::{self, Value};
use crate::options::{AdapterOptions, AdapterTarget};
use crate::outcome::Outcome;
use crate::parallel::{self, ParallelOptions, Settled};
use crate::retry::RetryConfig;

#[cfg(feature = "ssh")]
use crate::adapter::ssh::{SshAdapter, pool::{SshConnectionPool, SshPoolConfig}};
#[cfg(feature = "ssh")]
use crate::options::SshOptions;

#[cfg(feature = "container")]
use crate::adapter::container::ContainerAdapter;
#[cfg(feature = "container")]
use crate::options::ContainerOptions;

#[cfg(feature = "k8s")]
use crate::adapter::k8s::K8sAdapter;
#[cfg(feature = "k8s")]
use crate::options::K8sOptions;

struct EngineState {
    local: Arc<LocalAdapter>,
    #[cfg(feature = "ssh")]
    ssh_pool: Arc<SshConnectionPool>,
    #[cfg(feature = "ssh")]
    ssh: OnceCell<Arc<SshAdapter>>,
    #[cfg(feature = "container")]
    container: OnceCell<Arc<ContainerAdapter>>,
    #[cfg(feature = "k8s")]
    k8s: OnceCell<Arc<K8sAdapter>>,
    events: Arc<EventBus>,
    cache: ResultCache,
    /// Every handle's cancellation token, so `dispose()` can reach in-flight
    /// executions without holding a strong reference to the handle itself.
    live_handles: Mutex<Vec<CancellationToken>>,
    temp_paths: Mutex<Vec<PathBuf>>,
    disposed: AtomicBool,
}

impl EngineState {
    fn new() -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        let state = Arc::new(Self {
            local: Arc::new(LocalAdapter::default()),
            #[cfg(feature = "ssh")]
            ssh_pool: Arc::new(SshConnectionPool::new(SshPoolConfig::default(), events.clone())),
            #[cfg(feature = "ssh")]
            ssh: OnceCell::new(),
            #[cfg(feature = "container")]
            container: OnceCell::new(),
            #[cfg(feature = "k8s")]
            k8s: OnceCell::new(),
            events,
            cache: ResultCache::new(),
            live_handles: Mutex::new(Vec::new()),
            temp_paths: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });
        #[cfg(feature = "ssh")]
        {
            let pool = state.ssh_pool.clone();
            tokio::spawn(async move { pool.start_heartbeat().await });
        }
        state
    }
}

/// Entry point into the engine: builds and dispatches [`Command`]s as
/// [`ProcessHandle`]s. Cheap to clone — every clone shares the same adapter
/// registry, event bus, and cache.
#[derive(Clone)]
pub struct Engine {
    state: Arc<EngineState>,
    config: EngineConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("default_target", &self.config.default_target)
            .finish_non_exhaustive()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::local()
    }
}

impl Engine {
    /// An engine whose commands default to running on this machine.
    pub fn local() -> Self {
        Self {
            state: EngineState::new(),
            config: EngineConfig::default(),
        }
    }

    /// An engine bound to one SSH destination; commands with no adapter options
    /// of their own inherit `options`.
    #[cfg(feature = "ssh")]
    pub fn ssh(options: SshOptions) -> Self {
        let mut engine = Self::local();
        engine.config.default_target = AdapterTarget::Ssh;
        engine.config.default_adapter_options = AdapterOptions::Ssh(options);
        engine
    }

    /// An engine bound to the local container runtime.
    #[cfg(feature = "container")]
    pub fn docker(options: ContainerOptions) -> Self {
        let mut engine = Self::local();
        engine.config.default_target = AdapterTarget::Container;
        engine.config.default_adapter_options = AdapterOptions::Container(options);
        engine
    }

    /// An engine bound to one Kubernetes namespace. The pod (and optionally
    /// container) a given command runs against is still supplied per-command via
    /// `AdapterOptions::K8s`, unless the command leaves it unset, in which case
    /// this namespace (with an empty pod) is merged in as a weak default.
    #[cfg(feature = "k8s")]
    pub fn k8s(namespace: impl Into<String>) -> Self {
        let mut engine = Self::local();
        engine.config.default_target = AdapterTarget::K8s;
        engine.config.default_adapter_options = AdapterOptions::K8s(K8sOptions::new(namespace, String::new()));
        engine
    }

    /// Runs `docker`-prefixed commands against a remote host's container runtime
    /// over SSH. Unlike `docker()`, this does not speak the Docker Engine API —
    /// the SSH tunnel only forwards TCP endpoints, and the remote daemon's socket
    /// is typically a Unix socket — so this is realized as the SSH adapter with
    /// `options` as its default connection, exactly like `ssh()`. Callers build
    /// commands whose program is `docker` (or a `docker compose` subcommand); they
    /// run remotely via the ordinary SSH exec path.
    #[cfg(feature = "ssh")]
    pub fn remote_docker(options: SshOptions) -> Self {
        Self::ssh(options)
    }

    /// Derives a new engine sharing this one's adapters, event bus, and cache,
    /// with `f` applied to a clone of its configuration.
    pub fn with(&self, f: impl FnOnce(EngineConfig) -> EngineConfig) -> Self {
        Self {
            state: self.state.clone(),
            config: f(self.config.clone()),
        }
    }

    pub fn env(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(|cfg| cfg.env(key, value))
    }

    pub fn cd(&self, cwd: impl Into<PathBuf>) -> Self {
        self.with(|cfg| cfg.cwd(cwd))
    }

    pub fn timeout(&self, timeout: std::time::Duration) -> Self {
        self.with(|cfg| cfg.timeout(timeout))
    }

    pub fn retry(&self, plan: RetryConfig) -> Self {
        self.with(|cfg| cfg.retry(plan))
    }

    pub fn shell(&self, enabled: bool) -> Self {
        self.with(|cfg| cfg.shell(enabled))
    }

    /// Replaces the whole configuration wholesale.
    pub fn defaults(&self, config: EngineConfig) -> Self {
        Self {
            state: self.state.clone(),
            config,
        }
    }

    /// Starts a new handle for `command`. Nothing runs until the handle's first
    /// terminal method or await.
    pub fn execute(&self, command: Command) -> ProcessHandle {
        let cancellation = command.cancellation().cloned().unwrap_or_default();
        self.track_handle(cancellation.clone());
        ProcessHandle::new(self.clone(), command, cancellation)
    }

    /// Interpolates `fragments`/`values` into a single shell-safe command line and
    /// executes it (§4.2, §6 `engine.tag`).
    pub fn tag(&self, fragments: &[&str], values: &[Value]) -> Result<ProcessHandle, Error> {
        let line = interpolate::interpolate(fragments, values)?;
        let command = CommandBuilder::new(line).shell(true).build()?;
        Ok(self.execute(command))
    }

    fn track_handle(&self, token: CancellationToken) {
        if let Ok(mut handles) = self.state.live_handles.try_lock() {
            handles.retain(|t| !t.is_cancelled());
            handles.push(token);
        }
    }

    /// Runs `command` once against its resolved adapter, applying engine-level
    /// defaults first. A non-ok [`Outcome`] (non-zero exit, fatal signal) is
    /// converted to `Err(Error::CommandFailure)` here — retry and `nothrow()` both
    /// operate on that `Err`, the latter converting it back at the very end.
    pub(crate) async fn dispatch(&self, command: Command) -> Result<Outcome, Error> {
        if self.state.disposed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled {
                command: command.display_line(),
            });
        }
        let command = self.apply_defaults(command);
        let adapter = self.resolve_adapter(&command).await?;
        let command_line = command.display_line();

        self.state
            .events
            .publish(Event::CommandStart {
                command_line: command_line.clone(),
                adapter: adapter.name().to_string(),
            })
            .await;

        match adapter.execute(&command).await {
            Ok(outcome) if !outcome.ok() => {
                self.state
                    .events
                    .publish(Event::CommandComplete {
                        command_line: command_line.clone(),
                        adapter: adapter.name().to_string(),
                        duration: outcome.duration,
                        ok: false,
                    })
                    .await;
                Err(Error::from_outcome(&command, &outcome, self.config.sanitize_commands))
            }
            Ok(outcome) => {
                self.state
                    .events
                    .publish(Event::CommandComplete {
                        command_line,
                        adapter: adapter.name().to_string(),
                        duration: outcome.duration,
                        ok: true,
                    })
                    .await;
                Ok(outcome)
            }
            Err(err) => {
                self.state
                    .events
                    .publish(Event::CommandError {
                        command_line,
                        adapter: adapter.name().to_string(),
                        reason: err.to_string(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    /// Runs `command`, optionally wrapped in retry and/or the result cache, racing
    /// it against `cancellation`. Cache is consulted only once, around the whole
    /// retry loop (§9 Open Question #3); `invalidateOn` only fires after success
    /// (§9 Open Question #2).
    pub(crate) async fn run(
        &self,
        command: Command,
        retry: Option<RetryConfig>,
        cache: Option<CacheOptions>,
        nothrow: bool,
        cancellation: CancellationToken,
    ) -> Result<Outcome, Error> {
        match cache {
            Some(opts) => self.run_cached(command, retry, opts, nothrow, cancellation).await,
            None => self.run_retryable(command, retry, cancellation).await,
        }
    }

    /// §4.12: a non-ok result is only cached when the handle also carries
    /// `nothrow()` — otherwise a failure is just an `Err` and was never a `Result`
    /// to store. What this method *caches* and what it *returns* are not the same
    /// value, though: it always hands the caller back the unconverted `Result`,
    /// exactly like the uncached path (`run_retryable`) does, so any attached pipe
    /// stage still sees a real `Err` and short-circuits per `PipeOptions::throw_on_error`
    /// (§4.9) regardless of whether `.cache(..)` is also attached. `nothrow()`'s
    /// Err-to-Outcome conversion happens exactly once, uniformly, in
    /// `ProcessHandle::run_plan` after the pipe loop has run.
    async fn run_cached(
        &self,
        command: Command,
        retry: Option<RetryConfig>,
        opts: CacheOptions,
        nothrow: bool,
        cancellation: CancellationToken,
    ) -> Result<Outcome, Error> {
        let key = opts.key.clone().unwrap_or_else(|| command.canonical_key());

        match self.state.cache.lookup(&key).await {
            crate::cache::Lookup::Hit(outcome) => {
                self.state.events.publish(Event::CacheHit { key }).await;
                Ok(outcome)
            }
            crate::cache::Lookup::Miss => {
                self.state.events.publish(Event::CacheMiss { key: key.clone() }).await;
                let result = self.run_retryable(command, retry, cancellation).await;

                match result {
                    Ok(outcome) => {
                        self.state.cache.store(&key, outcome.clone(), opts.ttl);
                        self.state.events.publish(Event::CacheStore { key: key.clone() }).await;
                        if outcome.ok() && !opts.invalidate_on.is_empty() {
                            self.state.cache.invalidate(&opts.invalidate_on);
                        }
                        Ok(outcome)
                    }
                    // Peek at the would-be nothrow Outcome only to decide whether to
                    // cache it; the original `Err` — reconstructed losslessly from
                    // that same Outcome — is still what gets returned.
                    Err(err) if nothrow => match err.into_nothrow_outcome() {
                        Ok(outcome) => {
                            self.state.cache.store(&key, outcome.clone(), opts.ttl);
                            self.state.events.publish(Event::CacheStore { key: key.clone() }).await;
                            Err(Error::CommandFailure {
                                command: outcome.command_line.clone(),
                                exit_code: outcome.exit_code,
                                signal: outcome.signal.clone(),
                                stdout_excerpt: String::from_utf8_lossy(&outcome.stdout).into_owned(),
                                stderr_excerpt: String::from_utf8_lossy(&outcome.stderr).into_owned(),
                                duration: outcome.duration,
                            })
                        }
                        Err(other) => {
                            self.state.cache.miss_without_store(&key);
                            Err(other)
                        }
                    },
                    Err(err) => {
                        self.state.cache.miss_without_store(&key);
                        Err(err)
                    }
                }
            }
        }
    }

    async fn run_retryable(
        &self,
        command: Command,
        retry: Option<RetryConfig>,
        cancellation: CancellationToken,
    ) -> Result<Outcome, Error> {
        let Some(retry_cfg) = retry.or_else(|| self.config.default_retry.clone()) else {
            return self.dispatch_cancellable(command, cancellation).await;
        };

        // `Command` is not `Clone` (its `Stdin` may be a one-shot stream), so the
        // first attempt consumes the original and every retry re-issues a
        // `clone_static()` copy — a retried attempt never replays streamed stdin.
        let template = command.clone_static();
        let first = Mutex::new(Some(command));
        let engine = self.clone();
        let cancellation = cancellation.clone();

        crate::retry::retry(&retry_cfg, move || {
            let engine = engine.clone();
            let cancellation = cancellation.clone();
            let attempt = {
                let mut first = first.try_lock().expect("retry attempts run sequentially");
                first.take().unwrap_or_else(|| template.clone_static())
            };
            async move { engine.dispatch_cancellable(attempt, cancellation).await }
        })
        .await
    }

    async fn dispatch_cancellable(&self, command: Command, cancellation: CancellationToken) -> Result<Outcome, Error> {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(Error::Cancelled {
                command: command.display_line(),
            }),
            result = self.dispatch(command) => result,
        }
    }

    /// A boxed dispatcher usable where a plain `Fn(Command) -> Future` is needed
    /// (the pipe composer's downstream executor).
    pub(crate) fn command_executor(
        &self,
    ) -> Arc<dyn Fn(Command) -> futures::future::BoxFuture<'static, Result<Outcome, Error>> + Send + Sync> {
        let engine = self.clone();
        Arc::new(move |command: Command| {
            let engine = engine.clone();
            Box::pin(async move { engine.dispatch(command).await })
        })
    }

    fn apply_defaults(&self, command: Command) -> Command {
        let mut env: BTreeMap<String, String> = self.config.env.clone();
        env.extend(command.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let cwd = command.cwd.clone().or_else(|| self.config.cwd.clone());
        let timeout = command.timeout.or(self.config.timeout);
        let shell = command.shell.or(Some(self.config.shell));
        let target = match command.target {
            AdapterTarget::Auto => self.config.default_target,
            other => other,
        };
        let adapter_options = match &command.adapter_options {
            AdapterOptions::None => self.config.default_adapter_options.clone(),
            other => other.clone(),
        };

        Command {
            program: command.program,
            args: command.args,
            cwd,
            env,
            stdin: command.stdin,
            timeout,
            shell,
            target,
            adapter_options,
            cancellation: command.cancellation,
        }
    }

    async fn resolve_adapter(&self, command: &Command) -> Result<Arc<dyn Adapter>, Error> {
        match command.target() {
            AdapterTarget::Local | AdapterTarget::Auto => Ok(self.state.local.clone() as Arc<dyn Adapter>),
            #[cfg(feature = "ssh")]
            AdapterTarget::Ssh => {
                let adapter = self
                    .state
                    .ssh
                    .get_or_init(|| async {
                        Arc::new(SshAdapter::new(self.state.ssh_pool.clone(), self.config.adapter_defaults()))
                    })
                    .await;
                Ok(adapter.clone())
            }
            #[cfg(not(feature = "ssh"))]
            AdapterTarget::Ssh => Err(Error::AdapterFailure {
                adapter: "ssh".to_string(),
                operation: "resolve".to_string(),
                reason: "built without the `ssh` feature".to_string(),
            }),
            #[cfg(feature = "container")]
            AdapterTarget::Container => {
                let adapter = self
                    .state
                    .container
                    .get_or_try_init(|| async {
                        ContainerAdapter::connect_local_defaults(self.config.adapter_defaults()).map(Arc::new)
                    })
                    .await?;
                Ok(adapter.clone())
            }
            #[cfg(not(feature = "container"))]
            AdapterTarget::Container => Err(Error::AdapterFailure {
                adapter: "container".to_string(),
                operation: "resolve".to_string(),
                reason: "built without the `container` feature".to_string(),
            }),
            #[cfg(feature = "k8s")]
            AdapterTarget::K8s => {
                let adapter = self
                    .state
                    .k8s
                    .get_or_try_init(|| async { K8sAdapter::infer(self.config.adapter_defaults()).await.map(Arc::new) })
                    .await?;
                Ok(adapter.clone())
            }
            #[cfg(not(feature = "k8s"))]
            AdapterTarget::K8s => Err(Error::AdapterFailure {
                adapter: "k8s".to_string(),
                operation: "resolve".to_string(),
                reason: "built without the `k8s` feature".to_string(),
            }),
        }
    }

    // -- Parallel combinator (§4.10) -----------------------------------------

    /// Runs every command concurrently, failing fast and cancelling the rest on
    /// the first error.
    pub async fn parallel_all(&self, commands: Vec<Command>, options: ParallelOptions) -> Result<Vec<Outcome>, Error> {
        let engine = self.clone();
        parallel::all(
            commands,
            move |command, cancellation| {
                let engine = engine.clone();
                async move { engine.dispatch_cancellable(command, cancellation).await }
            },
            options,
        )
        .await
    }

    /// Runs every command concurrently to completion regardless of individual
    /// failures.
    pub async fn parallel_settled(&self, commands: Vec<Command>, options: ParallelOptions) -> Settled<Outcome> {
        let engine = self.clone();
        parallel::settled(
            commands,
            move |command| {
                let engine = engine.clone();
                async move { engine.dispatch(command).await }
            },
            options,
        )
        .await
    }

    /// Resolves with the first command to settle and cancels the rest.
    pub async fn parallel_race(&self, commands: Vec<Command>) -> Result<Outcome, Error> {
        let engine = self.clone();
        parallel::race(commands, move |command, cancellation| {
            let engine = engine.clone();
            async move { engine.dispatch_cancellable(command, cancellation).await }
        })
        .await
    }

    /// `parallel_all` under another name, matching `engine.batch(xs, {concurrency})`.
    pub async fn batch(&self, commands: Vec<Command>, concurrency: Option<usize>) -> Result<Vec<Outcome>, Error> {
        let mut options = ParallelOptions::new();
        if let Some(n) = concurrency {
            options = options.max_concurrency(n);
        }
        self.parallel_all(commands, options).await
    }

    // -- PATH lookups (§9 supplemental) --------------------------------------

    /// Resolves `program` against `PATH` (and, on Windows, `PATHEXT`), returning
    /// the first existing, executable match.
    pub async fn which(&self, program: &str) -> Option<PathBuf> {
        crate::which::which(program).await
    }

    pub async fn is_command_available(&self, program: &str) -> bool {
        self.which(program).await.is_some()
    }

    // -- Tracked temp resources (§6) ------------------------------------------

    /// Creates a tracked temp file. It is deleted on `dispose()` if the caller
    /// never removes it first.
    pub async fn temp_file(&self) -> Result<PathBuf, Error> {
        let file = tempfile::NamedTempFile::new().map_err(|err| Error::AdapterFailure {
            adapter: "engine".to_string(),
            operation: "temp_file".to_string(),
            reason: err.to_string(),
        })?;
        let path = file.into_temp_path().keep().map_err(|err| Error::AdapterFailure {
            adapter: "engine".to_string(),
            operation: "temp_file".to_string(),
            reason: err.to_string(),
        })?;
        self.state.temp_paths.lock().await.push(path.clone());
        self.state
            .events
            .publish(Event::TempCreate {
                path: path.display().to_string(),
            })
            .await;
        Ok(path)
    }

    /// Creates a tracked temp directory. Deleted (recursively) on `dispose()` if
    /// the caller never removes it first.
    pub async fn temp_dir(&self) -> Result<PathBuf, Error> {
        let dir = tempfile::TempDir::new().map_err(|err| Error::AdapterFailure {
            adapter: "engine".to_string(),
            operation: "temp_dir".to_string(),
            reason: err.to_string(),
        })?;
        let path = dir.keep();
        self.state.temp_paths.lock().await.push(path.clone());
        self.state
            .events
            .publish(Event::TempCreate {
                path: path.display().to_string(),
            })
            .await;
        Ok(path)
    }

    // -- Events -----------------------------------------------------------------

    pub fn on(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.state.events.subscribe(subscriber);
    }

    // -- Lifecycle ----------------------------------------------------------------

    /// Cancels every tracked handle, disposes every constructed adapter, and
    /// removes tracked temp paths. Idempotent; safe to call more than once.
    pub async fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        for token in self.state.live_handles.lock().await.drain(..) {
            token.cancel();
        }

        self.state.local.dispose().await;
        #[cfg(feature = "ssh")]
        if let Some(adapter) = self.state.ssh.get() {
            adapter.dispose().await;
        }
        #[cfg(feature = "ssh")]
        self.state.ssh_pool.shutdown().await;
        #[cfg(feature = "container")]
        if let Some(adapter) = self.state.container.get() {
            adapter.dispose().await;
        }
        #[cfg(feature = "k8s")]
        if let Some(adapter) = self.state.k8s.get() {
            adapter.dispose().await;
        }

        for path in self.state.temp_paths.lock().await.drain(..) {
            let removed = if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            if let Err(err) = removed {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove tracked temp path on dispose");
            }
            self.state
                .events
                .publish(Event::TempCleanup {
                    path: path.display().to_string(),
                })
                .await;
        }
    }
}
