//! # SSH Tunnels
//!
//! A local TCP listener that forwards each accepted connection over a `direct-tcpip`
//! SSH channel to `remote_host:remote_port` (§4.2), grounded on the `direct-tcpip`
//! channel pattern used by the other example pack's SSH-tunneled HTTP middleware.
//! The pooled connection backing a tunnel is pinned (held out of the pool) for as
//! long as the tunnel is open.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::options::SshOptions;

use super::pool::SshConnectionPool;

/// A live local-to-remote port forward.
pub struct Tunnel {
    local_addr: SocketAddr,
    cancellation: CancellationToken,
    accept_task: JoinHandle<()>,
    forwards: Arc<Mutex<JoinSet<()>>>,
}

impl Tunnel {
    /// Opens a listener on `local_port` (0 for an OS-assigned ephemeral port) that
    /// forwards each connection to `remote_host:remote_port` through a session
    /// acquired from `pool`.
    ///
    /// # Errors
    /// Returns [`Error::Connection`] if the local listener cannot bind or the
    /// initial SSH session cannot be established.
    pub async fn open(
        pool: Arc<SshConnectionPool>,
        options: SshOptions,
        remote_host: String,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(("127.0.0.1", local_port))
            .await
            .map_err(|err| Error::Connection {
                host: options.host.clone(),
                cause: format!("failed to bind local tunnel listener: {err}"),
                source: None,
            })?;
        let local_addr = listener.local_addr().map_err(|err| Error::Connection {
            host: options.host.clone(),
            cause: err.to_string(),
            source: None,
        })?;

        // Pin one connection for the lifetime of the tunnel rather than acquiring a
        // fresh one per accepted stream, since channels multiplex over one session.
        let handle = pool.acquire(&options).await?;

        let cancellation = CancellationToken::new();
        let task_cancellation = cancellation.clone();
        let task_pool = pool.clone();
        let task_options = options.clone();
        let forwards = Arc::new(Mutex::new(JoinSet::new()));
        let task_forwards = forwards.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancellation.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _peer)) = accepted else { continue };
                        let handle = handle.clone();
                        let remote_host = remote_host.clone();
                        task_forwards
                            .lock()
                            .await
                            .spawn(forward_one(handle, stream, remote_host, remote_port));
                    }
                }
            }
            task_pool.release(&task_options, handle).await;
        });

        Ok(Self {
            local_addr,
            cancellation,
            accept_task,
            forwards,
        })
    }

    /// The local address accepted connections should be sent to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections and releases the pinned session back to the
    /// pool. In-flight forwarded streams are allowed to drain before this returns.
    pub async fn close(self) {
        self.cancellation.cancel();
        let _ = self.accept_task.await;
        let mut forwards = self.forwards.lock().await;
        while forwards.join_next().await.is_some() {}
    }
}

async fn forward_one(
    handle: Arc<russh::client::Handle<super::handler::XecSshHandler>>,
    mut local_stream: tokio::net::TcpStream,
    remote_host: String,
    remote_port: u16,
) {
    let channel = match handle
        .channel_open_direct_tcpip(&remote_host, remote_port as u32, "127.0.0.1", 0)
        .await
    {
        Ok(channel) => channel,
        Err(err) => {
            tracing::warn!("failed to open direct-tcpip channel: {err}");
            return;
        }
    };

    let mut remote_stream = channel.into_stream();
    if let Err(err) = tokio::io::copy_bidirectional(&mut local_stream, &mut remote_stream).await {
        tracing::debug!("tunnel stream closed: {err}");
    }
    let _ = remote_stream.shutdown().await;
}
