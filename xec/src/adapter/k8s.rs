//! # Kubernetes Pod Adapter
//!
//! Executes commands inside a pod via the pod `exec` streaming subresource (§4.7),
//! grounded on the pack's kube-client bootstrap (`Config::infer`, `Client::try_from`)
//! for cluster discovery, adapted from batch-Job execution to a single synchronous
//! `exec` call so it fits the same `Adapter` shape as the other three adapters.
//! `logs`, `portForward`, and `copyTo`/`copyFrom` are exposed as extra methods
//! beyond the trait, the same way the container adapter exposes `get_ip_address`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, LogParams};
use kube::{Client, Config};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::Adapter;
use crate::command::{Command, Stdin};
use crate::error::Error;
use crate::interpolate::escape_shell_argument;
use crate::options::{AdapterDefaults, AdapterOptions, K8sOptions};
use crate::outcome::Outcome;

/// Executes commands inside Kubernetes pods via the exec subresource.
pub struct K8sAdapter {
    client: Client,
    defaults: AdapterDefaults,
}

impl std::fmt::Debug for K8sAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("K8sAdapter").finish_non_exhaustive()
    }
}

impl K8sAdapter {
    /// Builds a client from the ambient context: in-cluster service account when
    /// running inside a pod, otherwise the local kubeconfig.
    ///
    /// # Errors
    /// Returns [`Error::Connection`] if no usable configuration can be inferred.
    pub async fn infer(defaults: AdapterDefaults) -> Result<Self, Error> {
        let config = Config::infer().await.map_err(|err| Error::Connection {
            host: "kubernetes".to_string(),
            cause: err.to_string(),
            source: None,
        })?;
        let client = Client::try_from(config).map_err(|err| Error::Connection {
            host: "kubernetes".to_string(),
            cause: err.to_string(),
            source: Some(Box::new(err)),
        })?;
        Ok(Self { client, defaults })
    }

    pub fn with_client(client: Client, defaults: AdapterDefaults) -> Self {
        Self { client, defaults }
    }

    fn options_of(command: &Command) -> Result<&K8sOptions, Error> {
        match command.adapter_options() {
            AdapterOptions::K8s(opts) => Ok(opts),
            _ => Err(Error::AdapterFailure {
                adapter: "k8s".to_string(),
                operation: "execute".to_string(),
                reason: "command is missing K8sOptions".to_string(),
            }),
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn exec_in(&self, options: &K8sOptions, command: &Command) -> Result<Outcome, Error> {
        let started_at = SystemTime::now();
        let start = Instant::now();
        let command_line = command.display_line();

        let stdin_bytes = match command.stdin() {
            Some(Stdin::Bytes(bytes)) => Some(bytes.clone()),
            _ => None,
        };

        let mut ap = AttachParams::default().stdout(true).stderr(true);
        if stdin_bytes.is_some() {
            ap = ap.stdin(true);
        }
        if let Some(container) = &options.container {
            ap = ap.container(container);
        }

        let argv = build_remote_argv(command);
        let mut attached = self
            .pods(&options.namespace)
            .exec(&options.pod, argv, &ap)
            .await
            .map_err(|err| Error::AdapterFailure {
                adapter: "k8s".to_string(),
                operation: "exec".to_string(),
                reason: err.to_string(),
            })?;

        if let (Some(bytes), Some(mut writer)) = (stdin_bytes, attached.stdin()) {
            let _ = writer.write_all(&bytes).await;
            let _ = writer.shutdown().await;
        }

        let mut stdout_reader = attached.stdout();
        let mut stderr_reader = attached.stderr();
        let status_fut = attached.take_status();
        let max_buffer = self.defaults.max_buffer;
        let command_line_for_errors = command_line.clone();

        let drain_fut = async {
            let stdout_fut = async {
                match stdout_reader.take() {
                    Some(reader) => drain(reader, max_buffer, &command_line_for_errors).await,
                    None => Ok(Vec::new()),
                }
            };
            let stderr_fut = async {
                match stderr_reader.take() {
                    Some(reader) => drain(reader, max_buffer, &command_line_for_errors).await,
                    None => Ok(Vec::new()),
                }
            };
            tokio::try_join!(stdout_fut, stderr_fut)
        };

        let (stdout, stderr) = match command.timeout().or(self.defaults.timeout) {
            Some(duration) => tokio::time::timeout(duration, drain_fut)
                .await
                .map_err(|_| Error::Timeout {
                    command: command_line.clone(),
                    timeout_ms: duration.as_millis() as u64,
                })??,
            None => drain_fut.await?,
        };

        let status = match status_fut {
            Some(fut) => fut.await,
            None => None,
        };
        let exit_code = status.as_ref().and_then(exit_code_from_status);

        let _ = attached.join().await;

        Ok(Outcome {
            stdout,
            stderr,
            exit_code,
            signal: None,
            command_line,
            duration: start.elapsed(),
            started_at,
            finished_at: SystemTime::now(),
            adapter: "k8s".to_string(),
            host: None,
            container: None,
            pod: Some(options.pod.clone()),
        })
    }

    /// Fetches pod logs once (no follow).
    pub async fn logs(&self, options: &K8sOptions, opts: &K8sLogOptions) -> Result<String, Error> {
        let mut lp = LogParams {
            follow: false,
            timestamps: opts.timestamps,
            since_seconds: opts.since_seconds,
            tail_lines: opts.tail_lines,
            ..Default::default()
        };
        lp.container = opts.container.clone().or_else(|| options.container.clone());
        self.pods(&options.namespace)
            .logs(&options.pod, &lp)
            .await
            .map_err(|err| Error::AdapterFailure {
                adapter: "k8s".to_string(),
                operation: "logs".to_string(),
                reason: err.to_string(),
            })
    }

    /// Streams pod logs to `sink`, one call per line, following new output when
    /// `opts.follow` is set, until the backlog is exhausted or the returned
    /// [`PodLogStream`]'s `stop()` is called (§4.7: "a streaming variant whose
    /// handle exposes `stop()`"), mirroring `ContainerAdapter::stream_logs`.
    pub async fn stream_logs(
        &self,
        options: &K8sOptions,
        opts: &K8sLogOptions,
        mut sink: impl FnMut(&str) + Send + 'static,
    ) -> Result<PodLogStream, Error> {
        let mut lp = LogParams {
            follow: opts.follow,
            timestamps: opts.timestamps,
            since_seconds: opts.since_seconds,
            tail_lines: opts.tail_lines,
            ..Default::default()
        };
        lp.container = opts.container.clone().or_else(|| options.container.clone());

        let stream = self
            .pods(&options.namespace)
            .log_stream(&options.pod, &lp)
            .await
            .map_err(|err| Error::AdapterFailure {
                adapter: "k8s".to_string(),
                operation: "streamLogs".to_string(),
                reason: err.to_string(),
            })?;

        let cancellation = CancellationToken::new();
        let task_cancellation = cancellation.clone();
        let task = tokio::spawn(async move {
            let mut lines = stream.lines();
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancellation.cancelled() => break,
                    next = lines.next_line() => match next {
                        Ok(Some(line)) => sink(&line),
                        Ok(None) => break,
                        Err(err) => {
                            tracing::debug!("pod log stream ended: {err}");
                            break;
                        }
                    },
                }
            }
        });

        Ok(PodLogStream { cancellation, task })
    }

    /// Opens a local TCP listener tunneling into `remote_port` on the pod. A local
    /// port of `0` asks the OS to assign an ephemeral one (`portForwardDynamic`).
    pub async fn port_forward(
        &self,
        options: &K8sOptions,
        remote_port: u16,
        local_port: u16,
    ) -> Result<PodTunnel, Error> {
        PodTunnel::open(self.pods(&options.namespace), options.pod.clone(), remote_port, local_port).await
    }

    /// Streams a local file or directory into the pod by piping a tar archive into
    /// `tar x` on the remote side. Directories recurse; permissions are preserved by
    /// the tar format itself.
    pub async fn copy_to(&self, options: &K8sOptions, local_path: &Path, remote_path: &str) -> Result<(), Error> {
        let archive = build_tar_archive(local_path).await?;
        let (remote_dir, _) = split_remote_path(remote_path);

        let mut ap = AttachParams::default().stdin(true).stdout(true).stderr(true);
        if let Some(container) = &options.container {
            ap = ap.container(container);
        }
        let argv = vec![
            "tar".to_string(),
            "xf".to_string(),
            "-".to_string(),
            "-C".to_string(),
            remote_dir,
        ];
        let mut attached = self
            .pods(&options.namespace)
            .exec(&options.pod, argv, &ap)
            .await
            .map_err(|err| Error::AdapterFailure {
                adapter: "k8s".to_string(),
                operation: "copyTo".to_string(),
                reason: err.to_string(),
            })?;

        if let Some(mut writer) = attached.stdin() {
            writer.write_all(&archive).await.map_err(|err| Error::AdapterFailure {
                adapter: "k8s".to_string(),
                operation: "copyTo".to_string(),
                reason: err.to_string(),
            })?;
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = attached.stderr() {
            let _ = drain(reader, self.defaults.max_buffer, remote_path).await;
        }
        attached.join().await.map_err(|err| Error::AdapterFailure {
            adapter: "k8s".to_string(),
            operation: "copyTo".to_string(),
            reason: err.to_string(),
        })
    }

    /// Streams a remote file or directory out of the pod via `tar c` and unpacks it
    /// into `local_path`.
    pub async fn copy_from(&self, options: &K8sOptions, remote_path: &str, local_path: &Path) -> Result<(), Error> {
        let (remote_dir, remote_name) = split_remote_path(remote_path);

        let mut ap = AttachParams::default().stdout(true).stderr(true);
        if let Some(container) = &options.container {
            ap = ap.container(container);
        }
        let argv = vec![
            "tar".to_string(),
            "cf".to_string(),
            "-".to_string(),
            "-C".to_string(),
            remote_dir,
            remote_name,
        ];
        let mut attached = self
            .pods(&options.namespace)
            .exec(&options.pod, argv, &ap)
            .await
            .map_err(|err| Error::AdapterFailure {
                adapter: "k8s".to_string(),
                operation: "copyFrom".to_string(),
                reason: err.to_string(),
            })?;

        let archive = match attached.stdout() {
            Some(reader) => drain(reader, self.defaults.max_buffer, remote_path).await?,
            None => Vec::new(),
        };
        attached.join().await.map_err(|err| Error::AdapterFailure {
            adapter: "k8s".to_string(),
            operation: "copyFrom".to_string(),
            reason: err.to_string(),
        })?;

        unpack_tar_archive(archive, local_path).await
    }
}

#[async_trait]
impl Adapter for K8sAdapter {
    fn name(&self) -> &'static str {
        "k8s"
    }

    fn validate_config(&self, command: &Command) -> Result<(), Error> {
        Self::options_of(command).map(|_| ())
    }

    async fn execute(&self, command: &Command) -> Result<Outcome, Error> {
        let options = Self::options_of(command)?;
        self.exec_in(options, command).await
    }

    async fn dispose(&self) {
        // One client per context/namespace; no pooled connections to release.
    }
}

/// Options for [`K8sAdapter::logs`]/[`K8sAdapter::stream_logs`], mirroring
/// `kubectl logs` flags.
#[derive(Debug, Clone, Default)]
pub struct K8sLogOptions {
    pub container: Option<String>,
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
    pub timestamps: bool,
    /// Only meaningful to [`K8sAdapter::stream_logs`] — [`K8sAdapter::logs`] always
    /// fetches a single snapshot regardless of this flag (§4.7).
    pub follow: bool,
}

/// A live follow-mode log stream opened via [`K8sAdapter::stream_logs`].
pub struct PodLogStream {
    cancellation: CancellationToken,
    task: JoinHandle<()>,
}

impl PodLogStream {
    /// Stops following new log output and waits for the background task to exit.
    pub async fn stop(self) {
        self.cancellation.cancel();
        let _ = self.task.await;
    }
}

/// A live local-to-pod port forward opened via the pod `portforward` subresource.
pub struct PodTunnel {
    local_addr: SocketAddr,
    cancellation: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl PodTunnel {
    async fn open(pods: Api<Pod>, pod: String, remote_port: u16, local_port: u16) -> Result<Self, Error> {
        let listener = TcpListener::bind(("127.0.0.1", local_port))
            .await
            .map_err(|err| Error::AdapterFailure {
                adapter: "k8s".to_string(),
                operation: "portForward".to_string(),
                reason: format!("failed to bind local listener: {err}"),
            })?;
        let local_addr = listener.local_addr().map_err(|err| Error::AdapterFailure {
            adapter: "k8s".to_string(),
            operation: "portForward".to_string(),
            reason: err.to_string(),
        })?;

        let cancellation = CancellationToken::new();
        let task_cancellation = cancellation.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancellation.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _peer)) = accepted else { continue };
                        tokio::spawn(forward_one(pods.clone(), pod.clone(), remote_port, stream));
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            cancellation,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn close(self) {
        self.cancellation.cancel();
        let _ = self.accept_task.await;
    }
}

async fn forward_one(pods: Api<Pod>, pod: String, remote_port: u16, mut local_stream: tokio::net::TcpStream) {
    let mut forwarder = match pods.portforward(&pod, &[remote_port]).await {
        Ok(forwarder) => forwarder,
        Err(err) => {
            tracing::warn!("failed to open pod port-forward: {err}");
            return;
        }
    };
    let Some(mut remote_stream) = forwarder.take_stream(remote_port) else {
        tracing::warn!("pod port-forward did not yield a stream for port {remote_port}");
        return;
    };
    if let Err(err) = tokio::io::copy_bidirectional(&mut local_stream, &mut remote_stream).await {
        tracing::debug!("pod tunnel stream closed: {err}");
    }
    let _ = remote_stream.shutdown().await;
}

fn build_remote_argv(command: &Command) -> Vec<String> {
    if command.shell() || command.cwd().is_some() || !command.env().is_empty() {
        vec!["sh".to_string(), "-c".to_string(), build_remote_command_line(command)]
    } else {
        let mut argv = vec![command.program().to_string()];
        argv.extend(command.args().iter().cloned());
        argv
    }
}

fn build_remote_command_line(command: &Command) -> String {
    let mut line = String::new();
    if let Some(cwd) = command.cwd() {
        line.push_str("cd ");
        line.push_str(&escape_shell_argument(&cwd.display().to_string()));
        line.push_str(" && ");
    }
    for (key, value) in command.env() {
        line.push_str(key);
        line.push('=');
        line.push_str(&escape_shell_argument(value));
        line.push(' ');
    }
    line.push_str(command.program());
    for arg in command.args() {
        line.push(' ');
        line.push_str(&escape_shell_argument(arg));
    }
    line
}

fn exit_code_from_status(status: &Status) -> Option<i32> {
    if status.status.as_deref() == Some("Success") {
        return Some(0);
    }
    status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| causes.iter().find(|cause| cause.reason.as_deref() == Some("ExitCode")))
        .and_then(|cause| cause.message.as_ref())
        .and_then(|message| message.parse::<i32>().ok())
}

async fn drain(
    mut reader: impl AsyncRead + Unpin,
    max_buffer: usize,
    command_line: &str,
) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await.map_err(|err| Error::AdapterFailure {
            adapter: "k8s".to_string(),
            operation: "exec read".to_string(),
            reason: err.to_string(),
        })?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > max_buffer {
            return Err(Error::BufferOverflow {
                command: command_line.to_string(),
                limit: max_buffer,
            });
        }
    }
    Ok(buf)
}

/// `path:name/` or `path:name` split on the last `/`, since the remote side is
/// always a Linux pod regardless of the host platform running this adapter.
fn split_remote_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(idx) => (trimmed[..idx].to_string(), trimmed[idx + 1..].to_string()),
        None => (".".to_string(), trimmed.to_string()),
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
    .map_err(|err| Error::AdapterFailure {
        adapter: "k8s".to_string(),
        operation: "copyTo".to_string(),
        reason: err.to_string(),
    })?
    .map_err(|err| Error::AdapterFailure {
        adapter: "k8s".to_string(),
        operation: "copyTo".to_string(),
        reason: err.to_string(),
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
    .map_err(|err| Error::AdapterFailure {
        adapter: "k8s".to_string(),
        operation: "copyFrom".to_string(),
        reason: err.to_string(),
    })?
    .map_err(|err| Error::AdapterFailure {
        adapter: "k8s".to_string(),
        operation: "copyFrom".to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_remote_path_into_dir_and_name() {
        assert_eq!(split_remote_path("/var/log/app.log"), ("/var/log".to_string(), "app.log".to_string()));
        assert_eq!(split_remote_path("/app.log"), ("/".to_string(), "app.log".to_string()));
        assert_eq!(split_remote_path("app.log"), (".".to_string(), "app.log".to_string()));
        assert_eq!(split_remote_path("/data/"), ("/".to_string(), "data".to_string()));
    }

    #[test]
    fn exit_code_reads_success_as_zero() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(&status), Some(0));
    }

    #[test]
    fn log_options_default_to_no_follow() {
        let opts = K8sLogOptions::default();
        assert!(!opts.follow);
    }

    #[test]
    fn exit_code_reads_failure_cause() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};
        let status = Status {
            status: Some("Failure".to_string()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_string()),
                    message: Some("17".to_string()),
                    field: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(&status), Some(17));
    }
}
