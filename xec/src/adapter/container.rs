//! # Container Adapter
//!
//! Executes commands inside a Docker Engine-API container via `bollard` (§4.3):
//! either attached to an already-running container, or inside one spun up just for
//! the command and torn down afterward. Grounded on the Process-vs-Docker backend
//! split found in the pack's CLI end-to-end test harness, adapted from "launch a
//! long-lived validator" to "run one command and report its outcome."

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateBody, HealthConfig, HostConfig, PortBinding, RestartPolicy as DockerRestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::adapter::Adapter;
use crate::command::{Command, Stdin};
use crate::error::Error;
use crate::options::{AdapterDefaults, AdapterOptions, ContainerOptions, ContainerTarget, RestartPolicy};
use crate::outcome::Outcome;

/// Executes commands against Docker-managed containers.
pub struct ContainerAdapter {
    docker: Docker,
    defaults: AdapterDefaults,
}

impl std::fmt::Debug for ContainerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerAdapter").finish_non_exhaustive()
    }
}

impl ContainerAdapter {
    /// Connects using the platform-default Docker socket/named pipe.
    ///
    /// # Errors
    /// Returns [`Error::AdapterFailure`] if the local Docker daemon socket cannot be
    /// opened.
    pub fn connect_local_defaults(defaults: AdapterDefaults) -> Result<Self, Error> {
        let docker = Docker::connect_with_local_defaults().map_err(|err| Error::AdapterFailure {
            adapter: "container".to_string(),
            operation: "connect".to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self { docker, defaults })
    }

    pub fn with_client(docker: Docker, defaults: AdapterDefaults) -> Self {
        Self { docker, defaults }
    }

    fn options_of(command: &Command) -> Result<&ContainerOptions, Error> {
        match command.adapter_options() {
            AdapterOptions::Container(opts) => Ok(opts),
            _ => Err(Error::AdapterFailure {
                adapter: "container".to_string(),
                operation: "execute".to_string(),
                reason: "command is missing ContainerOptions".to_string(),
            }),
        }
    }

    /// Creates and starts an ephemeral container, returning its id.
    async fn spin_up(&self, spec: &crate::options::EphemeralSpec) -> Result<String, Error> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let binds: Vec<String> = spec
            .volumes
            .iter()
            .map(|(host, container)| format!("{host}:{container}"))
            .collect();
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .ports
            .iter()
            .map(|(host, container)| {
                (
                    format!("{container}/tcp"),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(host.to_string()),
                    }]),
                )
            })
            .collect();

        let host_config = HostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            network_mode: spec.network.clone(),
            privileged: Some(spec.privileged),
            restart_policy: spec.restart_policy.map(|policy| DockerRestartPolicy {
                name: Some(docker_restart_policy_name(policy)),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let healthcheck = spec.healthcheck.as_ref().map(|hc| HealthConfig {
            test: Some(hc.test.clone()),
            interval: Some(hc.interval.as_nanos() as i64),
            timeout: Some(hc.timeout.as_nanos() as i64),
            retries: Some(hc.retries as i64),
            start_period: None,
            start_interval: None,
        });

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: (!env.is_empty()).then_some(env),
            user: spec.user.clone(),
            working_dir: spec.workdir.clone(),
            labels: (!spec.labels.is_empty()).then(|| spec.labels.clone().into_iter().collect()),
            host_config: Some(host_config),
            healthcheck,
            tty: Some(false),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions>, body)
            .await
            .map_err(|err| Error::ContainerOperation {
                container: spec.image.clone(),
                operation: "create".to_string(),
                cause: err.to_string(),
            })?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .map_err(|err| Error::ContainerOperation {
                container: created.id.clone(),
                operation: "start".to_string(),
                cause: err.to_string(),
            })?;

        Ok(created.id)
    }

    async fn tear_down(&self, container_id: &str) {
        let _ = self
            .docker
            .stop_container(container_id, None::<StopContainerOptions>)
            .await;
        let _ = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }

    async fn exec_in(&self, container_id: &str, command: &Command) -> Result<Outcome, Error> {
        let started_at = SystemTime::now();
        let start = Instant::now();
        let command_line = command.display_line();

        let exec_user = match command.adapter_options() {
            AdapterOptions::Container(opts) => opts.exec_user.clone(),
            _ => None,
        };

        let cmd: Vec<String> = if command.shell() {
            let mut line = command.program().to_string();
            for arg in command.args() {
                line.push(' ');
                line.push_str(&crate::interpolate::escape_shell_argument(arg));
            }
            vec!["sh".to_string(), "-c".to_string(), line]
        } else {
            let mut cmd = vec![command.program().to_string()];
            cmd.extend(command.args().iter().cloned());
            cmd
        };

        let env: Vec<String> = command
            .env()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let stdin_bytes = match command.stdin() {
            Some(Stdin::Bytes(bytes)) => Some(bytes.clone()),
            _ => None,
        };

        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: (!env.is_empty()).then_some(env),
                    working_dir: command.cwd().map(|p| p.display().to_string()),
                    user: exec_user,
                    attach_stdin: Some(stdin_bytes.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| Error::ContainerOperation {
                container: container_id.to_string(),
                operation: "exec create".to_string(),
                cause: err.to_string(),
            })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let max_buffer = self.defaults.max_buffer;

        let read_fut = async {
            match self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|err| Error::ContainerOperation {
                    container: container_id.to_string(),
                    operation: "exec start".to_string(),
                    cause: err.to_string(),
                })? {
                StartExecResults::Attached { mut output, mut input } => {
                    if let Some(bytes) = &stdin_bytes {
                        let _ = input.write_all(bytes).await;
                        let _ = input.shutdown().await;
                    }
                    drop(input);
                    while let Some(chunk) = output.next().await {
                        let chunk = chunk.map_err(|err| Error::ContainerOperation {
                            container: container_id.to_string(),
                            operation: "exec stream".to_string(),
                            cause: err.to_string(),
                        })?;
                        match chunk {
                            bollard::container::LogOutput::StdOut { message } => {
                                stdout.extend_from_slice(&message)
                            }
                            bollard::container::LogOutput::StdErr { message } => {
                                stderr.extend_from_slice(&message)
                            }
                            _ => {}
                        }
                        if stdout.len() > max_buffer || stderr.len() > max_buffer {
                            return Err(Error::BufferOverflow {
                                command: command_line.clone(),
                                limit: max_buffer,
                            });
                        }
                    }
                    Ok(())
                }
                StartExecResults::Detached => Ok(()),
            }
        };

        match command.timeout().or(self.defaults.timeout) {
            Some(duration) => {
                tokio::time::timeout(duration, read_fut)
                    .await
                    .map_err(|_| Error::Timeout {
                        command: command_line.clone(),
                        timeout_ms: duration.as_millis() as u64,
                    })??
            }
            None => read_fut.await?,
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|err| Error::ContainerOperation {
                container: container_id.to_string(),
                operation: "exec inspect".to_string(),
                cause: err.to_string(),
            })?;

        Ok(Outcome {
            stdout,
            stderr,
            exit_code: inspect.exit_code.map(|c| c as i32),
            signal: None,
            command_line,
            duration: start.elapsed(),
            started_at,
            finished_at: SystemTime::now(),
            adapter: "container".to_string(),
            host: None,
            container: Some(container_id.to_string()),
            pod: None,
        })
    }

    /// Returns the container's primary network IP address, or `None` if it has not
    /// been assigned one (e.g. `network_mode: "host"`).
    pub async fn get_ip_address(&self, container_id: &str) -> Result<Option<String>, Error> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| Error::ContainerOperation {
                container: container_id.to_string(),
                operation: "inspect".to_string(),
                cause: err.to_string(),
            })?;
        Ok(inspect
            .network_settings
            .and_then(|ns| ns.ip_address)
            .filter(|ip| !ip.is_empty()))
    }

    /// Fetches logs once, concatenating stdout/stderr chunks as they were written
    /// (§4.6 `logs`).
    pub async fn logs(&self, container_id: &str, opts: &ContainerLogOptions) -> Result<String, Error> {
        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions {
                follow: false,
                stdout: opts.stdout,
                stderr: opts.stderr,
                tail: opts.tail.clone().unwrap_or_else(|| "all".to_string()),
                since: opts.since.unwrap_or(0),
                timestamps: opts.timestamps,
                ..Default::default()
            }),
        );
        let mut buf = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| Error::ContainerOperation {
                container: container_id.to_string(),
                operation: "logs".to_string(),
                cause: err.to_string(),
            })?;
            buf.push_str(&log_output_text(&chunk));
        }
        Ok(buf)
    }

    /// Streams logs (optionally following new output) to `sink`, one call per
    /// chunk, until the container stops producing output or `follow` is false and
    /// the backlog is exhausted (§4.6 `streamLogs`).
    pub async fn stream_logs(
        &self,
        container_id: &str,
        opts: &ContainerLogOptions,
        mut sink: impl FnMut(&str) + Send,
    ) -> Result<(), Error> {
        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions {
                follow: opts.follow,
                stdout: opts.stdout,
                stderr: opts.stderr,
                tail: opts.tail.clone().unwrap_or_else(|| "all".to_string()),
                since: opts.since.unwrap_or(0),
                timestamps: opts.timestamps,
                ..Default::default()
            }),
        );
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| Error::ContainerOperation {
                container: container_id.to_string(),
                operation: "streamLogs".to_string(),
                cause: err.to_string(),
            })?;
            sink(&log_output_text(&chunk));
        }
        Ok(())
    }

    /// Uploads a local file or directory into the container at `remote_path`, via
    /// Docker's tar-archive upload endpoint (§4.6 `copyTo`).
    pub async fn copy_to(&self, container_id: &str, local_path: &Path, remote_path: &str) -> Result<(), Error> {
        let archive = build_tar_archive(local_path).await?;
        self.docker
            .upload_to_container(
                container_id,
                Some(UploadToContainerOptions {
                    path: remote_path.to_string(),
                    ..Default::default()
                }),
                bytes::Bytes::from(archive),
            )
            .await
            .map_err(|err| Error::ContainerOperation {
                container: container_id.to_string(),
                operation: "copyTo".to_string(),
                cause: err.to_string(),
            })
    }

    /// Downloads `remote_path` out of the container as a tar archive and unpacks it
    /// into `local_path` (§4.6 `copyFrom`).
    pub async fn copy_from(&self, container_id: &str, remote_path: &str, local_path: &Path) -> Result<(), Error> {
        let mut stream = self.docker.download_from_container(
            container_id,
            Some(DownloadFromContainerOptions {
                path: remote_path.to_string(),
            }),
        );
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| Error::ContainerOperation {
                container: container_id.to_string(),
                operation: "copyFrom".to_string(),
                cause: err.to_string(),
            })?;
            archive.extend_from_slice(&chunk);
        }
        unpack_tar_archive(archive, local_path).await
    }

    /// Full container inspect payload, as raw JSON (§4.6 `inspect`).
    pub async fn inspect(&self, container_id: &str) -> Result<serde_json::Value, Error> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| Error::ContainerOperation {
                container: container_id.to_string(),
                operation: "inspect".to_string(),
                cause: err.to_string(),
            })?;
        serde_json::to_value(inspect).map_err(|err| Error::ContainerOperation {
            container: container_id.to_string(),
            operation: "inspect".to_string(),
            cause: err.to_string(),
        })
    }

    /// One-shot resource usage snapshot (§4.6 `stats`).
    pub async fn stats(&self, container_id: &str) -> Result<serde_json::Value, Error> {
        let mut stream = self.docker.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        let first = stream.next().await.ok_or_else(|| Error::ContainerOperation {
            container: container_id.to_string(),
            operation: "stats".to_string(),
            cause: "no stats reported".to_string(),
        })?;
        let stats = first.map_err(|err| Error::ContainerOperation {
            container: container_id.to_string(),
            operation: "stats".to_string(),
            cause: err.to_string(),
        })?;
        serde_json::to_value(stats).map_err(|err| Error::ContainerOperation {
            container: container_id.to_string(),
            operation: "stats".to_string(),
            cause: err.to_string(),
        })
    }

    /// Stops a running container (§4.6 `stop`).
    pub async fn stop(&self, container_id: &str) -> Result<(), Error> {
        self.docker
            .stop_container(container_id, None::<StopContainerOptions>)
            .await
            .map_err(|err| Error::ContainerOperation {
                container: container_id.to_string(),
                operation: "stop".to_string(),
                cause: err.to_string(),
            })
    }

    /// Removes a container, optionally forcing removal of a still-running one
    /// (§4.6 `remove`).
    pub async fn remove(&self, container_id: &str, force: bool) -> Result<(), Error> {
        self.docker
            .remove_container(container_id, Some(RemoveContainerOptions { force, ..Default::default() }))
            .await
            .map_err(|err| Error::ContainerOperation {
                container: container_id.to_string(),
                operation: "remove".to_string(),
                cause: err.to_string(),
            })
    }

    /// Restarts a container (§4.6 `restart`).
    pub async fn restart(&self, container_id: &str) -> Result<(), Error> {
        self.docker
            .restart_container(container_id, None::<RestartContainerOptions>)
            .await
            .map_err(|err| Error::ContainerOperation {
                container: container_id.to_string(),
                operation: "restart".to_string(),
                cause: err.to_string(),
            })
    }

    /// Polls `inspect` until the container's healthcheck reports `healthy`, or
    /// `timeout` elapses (§4.6 `waitForHealthy`). Containers with no configured
    /// healthcheck resolve immediately once running.
    pub async fn wait_for_healthy(&self, container_id: &str, timeout: Duration) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let inspect = self
                .docker
                .inspect_container(container_id, None::<InspectContainerOptions>)
                .await
                .map_err(|err| Error::ContainerOperation {
                    container: container_id.to_string(),
                    operation: "waitForHealthy".to_string(),
                    cause: err.to_string(),
                })?;

            let status = inspect
                .state
                .as_ref()
                .and_then(|state| state.health.as_ref())
                .and_then(|health| health.status);
            match status {
                Some(bollard::models::HealthStatusEnum::HEALTHY) | None => return Ok(()),
                Some(bollard::models::HealthStatusEnum::UNHEALTHY) => {
                    return Err(Error::ContainerOperation {
                        container: container_id.to_string(),
                        operation: "waitForHealthy".to_string(),
                        cause: "container reported unhealthy".to_string(),
                    });
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::HealthcheckTimeout {
                    container: container_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

fn docker_restart_policy_name(policy: RestartPolicy) -> RestartPolicyNameEnum {
    match policy {
        RestartPolicy::No => RestartPolicyNameEnum::NO,
        RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
        RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
        RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
    }
}

fn log_output_text(chunk: &LogOutput) -> String {
    match chunk {
        LogOutput::StdOut { message } | LogOutput::StdErr { message } | LogOutput::Console { message } => {
            String::from_utf8_lossy(message).into_owned()
        }
        LogOutput::StdIn { .. } => String::new(),
    }
}

async fn build_tar_archive(local_path: &Path) -> Result<Vec<u8>, Error> {
    let local_path = local_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let file_name = local_path
            .file_name()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "local path has no file name"))?;
        let mut builder = tar::Builder::new(Vec::new());
        if local_path.is_dir() {
            builder.append_dir_all(file_name, &local_path)?;
        } else {
            builder.append_path_with_name(&local_path, file_name)?;
        }
        builder.into_inner()
    })
    .await
    .map_err(|err| Error::ContainerOperation {
        container: local_path_label(&local_path),
        operation: "copyTo".to_string(),
        cause: err.to_string(),
    })?
    .map_err(|err| Error::ContainerOperation {
        container: local_path_label(&local_path),
        operation: "copyTo".to_string(),
        cause: err.to_string(),
    })
}

async fn unpack_tar_archive(archive: Vec<u8>, local_path: &Path) -> Result<(), Error> {
    let local_path = local_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::create_dir_all(&local_path)?;
        let mut unpacker = tar::Archive::new(std::io::Cursor::new(archive));
        unpacker.unpack(&local_path)
    })
    .await
    .map_err(|err| Error::ContainerOperation {
        container: local_path_label(&local_path),
        operation: "copyFrom".to_string(),
        cause: err.to_string(),
    })?
    .map_err(|err| Error::ContainerOperation {
        container: local_path_label(&local_path),
        operation: "copyFrom".to_string(),
        cause: err.to_string(),
    })
}

fn local_path_label(path: &Path) -> String {
    path.display().to_string()
}

/// Options for [`ContainerAdapter::logs`]/[`ContainerAdapter::stream_logs`],
/// mirroring `docker logs` flags (§4.6).
#[derive(Debug, Clone, Default)]
pub struct ContainerLogOptions {
    pub follow: bool,
    pub tail: Option<String>,
    pub since: Option<i64>,
    pub timestamps: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl ContainerLogOptions {
    pub fn new() -> Self {
        Self {
            stdout: true,
            stderr: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policy_maps_onto_docker_names() {
        assert_eq!(docker_restart_policy_name(RestartPolicy::No), RestartPolicyNameEnum::NO);
        assert_eq!(docker_restart_policy_name(RestartPolicy::Always), RestartPolicyNameEnum::ALWAYS);
        assert_eq!(
            docker_restart_policy_name(RestartPolicy::OnFailure),
            RestartPolicyNameEnum::ON_FAILURE
        );
        assert_eq!(
            docker_restart_policy_name(RestartPolicy::UnlessStopped),
            RestartPolicyNameEnum::UNLESS_STOPPED
        );
    }

    #[test]
    fn log_output_text_extracts_message_bytes() {
        let chunk = LogOutput::StdOut { message: bytes::Bytes::from_static(b"hello") };
        assert_eq!(log_output_text(&chunk), "hello");
    }

    #[test]
    fn default_log_options_capture_both_streams() {
        let opts = ContainerLogOptions::new();
        assert!(opts.stdout);
        assert!(opts.stderr);
        assert!(!opts.follow);
    }
}

#[async_trait]
impl Adapter for ContainerAdapter {
    fn name(&self) -> &'static str {
        "container"
    }

    fn validate_config(&self, command: &Command) -> Result<(), Error> {
        Self::options_of(command).map(|_| ())
    }

    async fn execute(&self, command: &Command) -> Result<Outcome, Error> {
        let options = Self::options_of(command)?;

        match &options.target {
            ContainerTarget::Existing { name_or_id } => self.exec_in(name_or_id, command).await,
            ContainerTarget::Ephemeral(spec) => {
                let container_id = self.spin_up(spec).await?;
                let result = self.exec_in(&container_id, command).await;
                self.tear_down(&container_id).await;
                result
            }
        }
    }

    async fn dispose(&self) {
        // No pooled resources; ephemeral containers are torn down per-call.
    }
}
