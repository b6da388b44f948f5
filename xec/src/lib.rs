//! # xec
//!
//! A unified command-execution engine. One [`Command`] description runs against
//! any of four execution contexts — the local machine, a pooled SSH session, a
//! container, or a Kubernetes pod — behind a single [`Engine`] and the
//! [`ProcessHandle`] future it hands back from `execute()`.
//!
//! ```no_run
//! use xec::{Engine, CommandBuilder};
//!
//! # async fn run() -> Result<(), xec::Error> {
//! let engine = Engine::local();
//! let command = CommandBuilder::new("echo").arg("hello").build()?;
//! let output = engine.execute(command).text().await.unwrap();
//! assert_eq!(output, "hello");
//! # Ok(())
//! # }
//! ```
//!
//! Cross-cutting concerns — retry, caching, piping, parallel combinators,
//! PATH lookup, and tracked temp resources — are modifiers on [`Engine`] and
//! [`ProcessHandle`] rather than separate entry points, so the same `Command`
//! composes with any of them regardless of which adapter it targets.

mod adapter;
mod cache;
mod command;
mod config;
mod engine;
mod error;
mod events;
mod handle;
mod interpolate;
mod logging;
mod outcome;
mod parallel;
mod pipe;
mod retry;
mod which;

pub use adapter::Adapter;
pub use cache::{CacheOptions, CacheStats, Lookup, ResultCache};
pub use command::{Command, CommandBuilder, Stdin};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, SANITIZED_PROGRAMS, sanitize_command_line, sanitize_commands_enabled};
pub use events::{ChannelEventSubscriber, Event, EventBus, EventSubscriber, LoggingEventSubscriber};
pub use handle::{HandleError, ProcessHandle};
pub use interpolate::{Value, escape_shell_argument, format_option_flag, interpolate, raw};
pub use logging::{init, init_to_file, init_to_file_with, init_with};
pub use outcome::Outcome;
pub use parallel::{ParallelOptions, Settled};
pub use pipe::{PipeOptions, Stage, grep, replace, tee, to_uppercase};
pub use retry::{RetryConfig, RetryObserver, RetryPolicy, RetryPredicate, retry};

pub use options::{
    AdapterDefaults, AdapterOptions, AdapterTarget, ContainerOptions, ContainerTarget, EphemeralSpec, Healthcheck,
    K8sOptions, RestartPolicy,
};

#[cfg(feature = "ssh")]
pub use adapter::ssh::{SshAdapter, SshConnectionPool, SshPoolConfig, SshPoolMetrics, Tunnel};
#[cfg(feature = "ssh")]
pub use options::SshOptions;

#[cfg(feature = "container")]
pub use adapter::container::{ContainerAdapter, ContainerLogOptions};

#[cfg(feature = "k8s")]
pub use adapter::k8s::{K8sAdapter, K8sLogOptions, PodTunnel};

pub mod options;
