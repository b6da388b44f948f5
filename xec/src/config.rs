//! # Engine Configuration
//!
//! `EngineConfig` is the copy-on-write slice of state behind [`crate::engine::Engine`]'s
//! derivation methods (§4.13: `with`, `env`, `cd`, `timeout`, `retry`, `shell`,
//! `defaults`). Each derivation clones the config, tweaks one field, and hands it to a
//! new `Engine` that still shares the parent's adapter registry, event bus, and cache.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::options::{AdapterOptions, AdapterTarget};
use crate::retry::RetryConfig;

/// Engine-wide defaults merged onto every [`crate::command::Command`] that leaves the
/// corresponding field unset, plus the knobs §4.13 lists for the engine itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub timeout: Option<Duration>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub shell: bool,
    pub max_buffer: usize,
    pub graceful_timeout: Duration,
    /// Adapter a `Command` with `target: Auto` resolves to.
    pub default_target: AdapterTarget,
    /// Adapter-specific options applied when a `Command` carries none of its own —
    /// set by `Engine::ssh`/`docker`/`k8s` so callers don't repeat connection details
    /// on every command built against an adapter-bound engine.
    pub default_adapter_options: AdapterOptions,
    /// Applied to every `execute()` call unless a handle's own `.retry(..)` overrides it.
    pub default_retry: Option<RetryConfig>,
    /// Read once at `Engine` construction per §6; not re-read per call.
    pub sanitize_commands: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            env: BTreeMap::new(),
            cwd: None,
            shell: true,
            max_buffer: 10 * 1024 * 1024,
            graceful_timeout: Duration::from_secs(5),
            default_target: AdapterTarget::Local,
            default_adapter_options: AdapterOptions::None,
            default_retry: None,
            sanitize_commands: crate::error::sanitize_commands_enabled(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
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

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    pub fn max_buffer(mut self, bytes: usize) -> Self {
        self.max_buffer = bytes;
        self
    }

    pub fn default_target(mut self, target: AdapterTarget) -> Self {
        self.default_target = target;
        self
    }

    pub fn default_adapter_options(mut self, options: AdapterOptions) -> Self {
        self.default_adapter_options = options;
        self
    }

    pub fn retry(mut self, plan: RetryConfig) -> Self {
        self.default_retry = Some(plan);
        self
    }

    /// The per-adapter execution defaults threaded through `Adapter::execute`.
    pub fn adapter_defaults(&self) -> crate::options::AdapterDefaults {
        crate::options::AdapterDefaults {
            timeout: self.timeout,
            max_buffer: self.max_buffer,
            graceful_timeout: self.graceful_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_target_is_local() {
        assert_eq!(EngineConfig::new().default_target, AdapterTarget::Local);
    }

    #[test]
    fn builder_methods_compose() {
        let cfg = EngineConfig::new()
            .timeout(Duration::from_secs(1))
            .env("A", "1")
            .cwd("/tmp")
            .max_buffer(1024);
        assert_eq!(cfg.timeout, Some(Duration::from_secs(1)));
        assert_eq!(cfg.env.get("A"), Some(&"1".to_string()));
        assert_eq!(cfg.max_buffer, 1024);
    }
}
