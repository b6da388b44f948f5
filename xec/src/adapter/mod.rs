//! # Adapter Contract
//!
//! An [`Adapter`] executes a [`Command`] against one concrete context — the local
//! machine, a pooled SSH connection, a container, or a Kubernetes pod (§4). Every
//! adapter implements the same three-method contract so the engine can dispatch on
//! [`crate::options::AdapterTarget`] without knowing which transport is underneath.

pub mod local;

#[cfg(feature = "ssh")]
pub mod ssh;

#[cfg(feature = "container")]
pub mod container;

#[cfg(feature = "k8s")]
pub mod k8s;

use async_trait::async_trait;

use crate::command::Command;
use crate::error::Error;
use crate::outcome::Outcome;

/// A concrete execution context for [`Command`]s.
///
/// Implementors must be safe to hold behind an `Arc` and call concurrently; the
/// engine keeps one long-lived instance per adapter kind rather than constructing a
/// fresh adapter per command.
#[async_trait]
pub trait Adapter: Send + Sync + std::fmt::Debug {
    /// Human-readable name used in [`Outcome::adapter`] and log output ("local",
    /// "ssh", "container", "k8s").
    fn name(&self) -> &'static str;

    /// Runs `command` to completion (or until its timeout/cancellation fires) and
    /// returns the resulting [`Outcome`].
    ///
    /// # Errors
    /// Returns `Err` for adapter-level failures (misconfiguration, transport
    /// failure, timeout, cancellation). A non-zero exit code is *not* an error here
    /// — it is reported as a non-ok [`Outcome`]; callers decide whether to convert
    /// it via [`Error::from_outcome`].
    async fn execute(&self, command: &Command) -> Result<Outcome, Error>;

    /// Validates that `command`'s adapter-specific options are well-formed for this
    /// adapter before any process or connection is created.
    fn validate_config(&self, command: &Command) -> Result<(), Error>;

    /// Releases any resources this adapter holds (pooled connections, spawned
    /// ephemeral containers, background tasks). Idempotent — safe to call more than
    /// once, and must not panic even if some of its teardown steps fail.
    async fn dispose(&self);
}
