//! # Adapter-specific Command Options
//!
//! A [`Command`](crate::command::Command) carries a tag naming its target adapter
//! plus a payload of adapter-specific options (§3, "adapter-specific options (a
//! tagged variant, see §4)"). Keeping these option records in one module — rather
//! than scattered across each adapter file — lets `Command` depend on them without
//! pulling in the adapters themselves (avoids `command.rs` depending on `bollard`,
//! `kube`, or `russh` directly).

use std::collections::BTreeMap;
use std::time::Duration;

/// Which execution context a [`Command`](crate::command::Command) targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterTarget {
    Local,
    Ssh,
    Container,
    K8s,
    /// Resolved to the engine's configured default adapter at execution time.
    Auto,
}

impl std::fmt::Display for AdapterTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AdapterTarget::Local => "local",
            AdapterTarget::Ssh => "ssh",
            AdapterTarget::Container => "container",
            AdapterTarget::K8s => "k8s",
            AdapterTarget::Auto => "auto",
        };
        f.write_str(name)
    }
}

/// Adapter-specific option payload, tagged by the adapter it applies to.
#[derive(Debug, Clone, Default)]
pub enum AdapterOptions {
    #[default]
    None,
    Ssh(SshOptions),
    Container(ContainerOptions),
    K8s(K8sOptions),
}

/// Identifies the pooled SSH transport a command should run over, plus any
/// per-command overrides of the pool's connection defaults.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub user: String,
    pub host: String,
    pub port: u16,
    /// Path to a private key file; `None` falls back to agent/default-key auth.
    pub identity_file: Option<std::path::PathBuf>,
    pub password: Option<String>,
    pub strict_host_key_checking: bool,
}

impl SshOptions {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port: 22,
            identity_file: None,
            password: None,
            strict_host_key_checking: true,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn identity_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// The `(user, host, port)` triple the connection pool keys entries by (§3).
    pub fn triple(&self) -> (String, String, u16) {
        (self.user.clone(), self.host.clone(), self.port)
    }
}

/// How a container command should be executed: against an already-running
/// container, or against one spun up just for this command and torn down after
/// (§4.6's "attach to existing" vs "ephemeral").
#[derive(Debug, Clone)]
pub enum ContainerTarget {
    Existing { name_or_id: String },
    Ephemeral(EphemeralSpec),
}

/// A container-level healthcheck, mirroring `docker run --health-cmd` et al.
#[derive(Debug, Clone)]
pub struct Healthcheck {
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

impl Healthcheck {
    pub fn cmd(test: Vec<String>) -> Self {
        Self {
            test,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            retries: 3,
        }
    }
}

/// Mirrors Docker's restart policy names (§4.6 "optional ... restart policy").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

impl RestartPolicy {
    pub(crate) fn as_docker_name(self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::UnlessStopped => "unless-stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EphemeralSpec {
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<(String, String)>,
    pub ports: Vec<(u16, u16)>,
    pub labels: BTreeMap<String, String>,
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub privileged: bool,
    pub network: Option<String>,
    pub healthcheck: Option<Healthcheck>,
    pub restart_policy: Option<RestartPolicy>,
}

impl EphemeralSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            env: BTreeMap::new(),
            volumes: Vec::new(),
            ports: Vec::new(),
            labels: BTreeMap::new(),
            user: None,
            workdir: None,
            privileged: false,
            network: None,
            healthcheck: None,
            restart_policy: None,
        }
    }

    pub fn healthcheck(mut self, healthcheck: Healthcheck) -> Self {
        self.healthcheck = Some(healthcheck);
        self
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = Some(policy);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ContainerOptions {
    pub target: ContainerTarget,
    /// User to execute as inside the container (`exec -u`), independent of any
    /// ephemeral spec's `user`.
    pub exec_user: Option<String>,
}

impl ContainerOptions {
    pub fn existing(name_or_id: impl Into<String>) -> Self {
        Self {
            target: ContainerTarget::Existing {
                name_or_id: name_or_id.into(),
            },
            exec_user: None,
        }
    }

    pub fn ephemeral(spec: EphemeralSpec) -> Self {
        Self {
            target: ContainerTarget::Ephemeral(spec),
            exec_user: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct K8sOptions {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
}

impl K8sOptions {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: None,
        }
    }

    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }
}

/// Engine-wide defaults an adapter falls back to when a [`Command`](crate::command::Command)
/// leaves a field unset. Distinct from [`crate::config::EngineConfig`] in that these
/// are the per-adapter slice of that config, passed down to `execute`.
#[derive(Debug, Clone)]
pub struct AdapterDefaults {
    pub timeout: Option<Duration>,
    pub max_buffer: usize,
    pub graceful_timeout: Duration,
}

impl Default for AdapterDefaults {
    fn default() -> Self {
        Self {
            timeout: None,
            max_buffer: 10 * 1024 * 1024,
            graceful_timeout: Duration::from_secs(5),
        }
    }
}
