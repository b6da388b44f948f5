//! # SSH Connection Pool
//!
//! Pools authenticated `russh` client handles keyed by `(user, host, port)` (§4.2),
//! grounded on the teacher's `ShellPoolManager`: a per-key collection of reusable
//! entries, idle eviction, and usage metrics, adapted here from pooled shell
//! processes to pooled SSH sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use russh::client::Handle;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::events::{Event, EventBus};
use crate::options::SshOptions;

use super::handler::XecSshHandler;

type ConnectionKey = (String, String, u16);

/// An idle pooled connection. It keeps holding the [`Semaphore`] permit it was
/// dialed under for as long as it sits here — the permit is only released (freeing
/// a slot under `max_connections`) once the entry is checked out and discarded, or
/// evicted by the idle sweep — never merely by sitting idle.
struct Entry {
    handle: Arc<Handle<XecSshHandler>>,
    last_used: Instant,
    permit: OwnedSemaphorePermit,
    /// The credentials this entry was dialed with, kept so the heartbeat sweep can
    /// re-dial on a failed probe without the caller having to re-supply them.
    options: SshOptions,
    /// Outcome of the most recent heartbeat probe (§3 Connection Pool Entry: "the
    /// last heartbeat result"). `None` until the first heartbeat sweep reaches it.
    last_heartbeat: Option<bool>,
}

/// A connection currently checked out by a caller, tracked by the identity of its
/// `Arc` allocation so [`SshConnectionPool::release`]/[`SshConnectionPool::discard`]
/// can find the permit that was acquired (or carried over from an idle [`Entry`])
/// for it.
struct CheckedOut {
    key: ConnectionKey,
    permit: OwnedSemaphorePermit,
}

fn identity(handle: &Arc<Handle<XecSshHandler>>) -> usize {
    Arc::as_ptr(handle) as usize
}

/// The heartbeat's low-cost no-op: open a session channel and close it immediately,
/// without ever running a command over it. Any transport-level failure here means
/// the underlying connection is dead.
async fn probe(handle: &Handle<XecSshHandler>) -> Result<(), Error> {
    let mut channel = handle.channel_open_session().await.map_err(|err| Error::Connection {
        host: "ssh".to_string(),
        cause: err.to_string(),
        source: Some(Box::new(err)),
    })?;
    channel.close().await.map_err(|err| Error::Connection {
        host: "ssh".to_string(),
        cause: err.to_string(),
        source: Some(Box::new(err)),
    })
}

/// Tunable behavior for [`SshConnectionPool`].
#[derive(Debug, Clone)]
pub struct SshPoolConfig {
    /// Total live entries (idle + in-use) allowed per `(user, host, port)` triple.
    pub max_connections: usize,
    pub idle_timeout: Duration,
    /// Periodic no-op sent through idle entries to detect dead transports.
    pub keep_alive: bool,
    pub keep_alive_interval: Duration,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for SshPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            idle_timeout: Duration::from_secs(300),
            keep_alive: true,
            keep_alive_interval: Duration::from_secs(30),
            auto_reconnect: true,
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

/// Point-in-time usage snapshot, mirroring the `ssh:pool-metrics` event payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshPoolMetrics {
    pub active: usize,
    pub idle: usize,
    pub total: usize,
    pub connections_created: u64,
    pub reuse_count: u64,
}

/// Pools pooled+authenticated SSH sessions across every adapter call targeting the
/// same `(user, host, port)`.
pub struct SshConnectionPool {
    entries: Mutex<HashMap<ConnectionKey, VecDeque<Entry>>>,
    /// Connections currently checked out, keyed by the identity of their `Arc`
    /// allocation so each one's permit can be found again on `release`/`discard`.
    checked_out: Mutex<HashMap<usize, CheckedOut>>,
    /// Caps total (idle + in-use) entries per triple; acquire waits FIFO for a
    /// permit once the cap is reached rather than growing past it (§4.5, §8).
    limiters: Mutex<HashMap<ConnectionKey, Arc<Semaphore>>>,
    config: SshPoolConfig,
    events: Arc<EventBus>,
    connections_created: AtomicU64,
    reuse_count: AtomicU64,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SshConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnectionPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SshConnectionPool {
    pub fn new(config: SshPoolConfig, events: Arc<EventBus>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            checked_out: Mutex::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
            config,
            events,
            connections_created: AtomicU64::new(0),
            reuse_count: AtomicU64::new(0),
            heartbeat: Mutex::new(None),
        }
    }

    /// Starts the background heartbeat/eviction sweep if `keep_alive` is enabled and
    /// it is not already running. Idempotent. The sweep fires every
    /// `keep_alive_interval`: first evicting idle entries past `idle_timeout`
    /// (emitting `ssh:pool-cleanup`), then sending a low-cost no-op probe through
    /// every remaining idle entry (§4.5 "Heartbeat") and publishing a
    /// `ssh:pool-metrics` snapshot.
    pub async fn start_heartbeat(self: &Arc<Self>) {
        if !self.config.keep_alive {
            return;
        }
        let mut guard = self.heartbeat.lock().await;
        if guard.is_some() {
            return;
        }
        let pool = self.clone();
        let interval = self.config.keep_alive_interval;
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                pool.sweep_all().await;
                pool.heartbeat_all().await;
                let metrics = pool.metrics().await;
                pool.events
                    .publish(Event::SshPoolMetrics {
                        active: metrics.active,
                        idle: metrics.idle,
                    })
                    .await;
            }
        }));
    }

    /// Probes every idle entry across every key with a cheap open-then-close
    /// session channel. A failed probe triggers a re-dial (bounded by
    /// `max_reconnect_attempts`/`reconnect_delay`, reusing [`Self::dial_with_retry`])
    /// when `auto_reconnect` is set; exhausting that budget — or a disabled
    /// `auto_reconnect` — evicts the entry, freeing its connection slot.
    async fn heartbeat_all(&self) {
        let keys: Vec<ConnectionKey> = self.entries.lock().await.keys().cloned().collect();
        for key in keys {
            self.heartbeat_key(&key).await;
        }
    }

    async fn heartbeat_key(&self, key: &ConnectionKey) {
        let idle = {
            let mut entries = self.entries.lock().await;
            entries.remove(key).unwrap_or_default()
        };

        let mut surviving = VecDeque::with_capacity(idle.len());
        for mut entry in idle {
            match probe(&entry.handle).await {
                Ok(()) => {
                    entry.last_heartbeat = Some(true);
                    surviving.push_back(entry);
                }
                Err(err) => {
                    tracing::warn!(host = %entry.options.host, "ssh heartbeat failed: {err}");
                    if self.config.auto_reconnect {
                        match self.dial_with_retry(&entry.options).await {
                            Ok(handle) => surviving.push_back(Entry {
                                handle,
                                last_used: Instant::now(),
                                permit: entry.permit,
                                options: entry.options,
                                last_heartbeat: Some(true),
                            }),
                            // `dial_with_retry` already published `ssh:disconnect` on
                            // exhaustion; dropping `entry` here (and its permit) is
                            // the eviction.
                            Err(_) => drop(entry),
                        }
                    } else {
                        self.events
                            .publish(Event::SshDisconnect {
                                host: entry.options.host.clone(),
                            })
                            .await;
                        drop(entry);
                    }
                }
            }
        }
        if !surviving.is_empty() {
            self.entries.lock().await.insert(key.clone(), surviving);
        }
    }

    /// Acquires a handle for `options`, reusing a pooled idle entry when one exists
    /// and is still healthy, otherwise dialing (and retrying) a fresh connection.
    /// Blocks (FIFO) once `max_connections` live entries for this triple are already
    /// outstanding.
    pub async fn acquire(&self, options: &SshOptions) -> Result<Arc<Handle<XecSshHandler>>, Error> {
        let key = options.triple();
        self.sweep_idle(&key).await;

        let reused = {
            let mut entries = self.entries.lock().await;
            entries.get_mut(&key).and_then(VecDeque::pop_front)
        };

        let (handle, permit) = if let Some(entry) = reused {
            if entry.handle.is_closed() {
                // The permit this entry held is dropped here along with `entry`,
                // freeing a slot; dialing below acquires a fresh one.
                drop(entry);
                let limiter = self.limiter_for(&key).await;
                let permit = limiter.acquire_owned().await.map_err(|_| Error::Connection {
                    host: options.host.clone(),
                    cause: "connection limiter closed".to_string(),
                    source: None,
                })?;
                (self.dial_with_retry(options).await?, permit)
            } else {
                self.reuse_count.fetch_add(1, Ordering::Relaxed);
                (entry.handle, entry.permit)
            }
        } else {
            let limiter = self.limiter_for(&key).await;
            let permit = limiter.acquire_owned().await.map_err(|_| Error::Connection {
                host: options.host.clone(),
                cause: "connection limiter closed".to_string(),
                source: None,
            })?;
            (self.dial_with_retry(options).await?, permit)
        };

        self.checked_out.lock().await.insert(
            identity(&handle),
            CheckedOut {
                key,
                permit,
            },
        );
        Ok(handle)
    }

    /// Returns a handle to the pool for reuse by a later call with the same key.
    pub async fn release(&self, options: &SshOptions, handle: Arc<Handle<XecSshHandler>>) {
        let checked_out = self.checked_out.lock().await.remove(&identity(&handle));
        let Some(checked_out) = checked_out else { return };
        if handle.is_closed() {
            // Dropping `checked_out.permit` here frees the slot.
            return;
        }
        let key = options.triple();
        debug_assert_eq!(checked_out.key, key);
        self.entries.lock().await.entry(key).or_default().push_back(Entry {
            handle,
            last_used: Instant::now(),
            permit: checked_out.permit,
            options: options.clone(),
            last_heartbeat: None,
        });
    }

    /// Drops a handle without returning it to the pool, e.g. after a protocol error
    /// that suggests the session is no longer trustworthy. Releases the handle's
    /// permit, freeing a slot under `max_connections`.
    pub async fn discard(&self, _options: &SshOptions, handle: Arc<Handle<XecSshHandler>>) {
        self.checked_out.lock().await.remove(&identity(&handle));
    }

    async fn limiter_for(&self, key: &ConnectionKey) -> Arc<Semaphore> {
        self.limiters
            .lock()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_connections.max(1))))
            .clone()
    }

    async fn dial_with_retry(&self, options: &SshOptions) -> Result<Arc<Handle<XecSshHandler>>, Error> {
        let mut last_err = None;
        let attempts = if self.config.auto_reconnect {
            self.config.max_reconnect_attempts.max(1)
        } else {
            1
        };
        for attempt in 0..attempts {
            match super::connect::connect(options).await {
                Ok(handle) => {
                    self.connections_created.fetch_add(1, Ordering::Relaxed);
                    self.events
                        .publish(Event::SshConnect { host: options.host.clone() })
                        .await;
                    return Ok(Arc::new(handle));
                }
                Err(err) => {
                    tracing::warn!(
                        host = %options.host,
                        attempt,
                        "ssh connection attempt failed: {err}"
                    );
                    if attempt > 0 {
                        self.events
                            .publish(Event::SshReconnect {
                                host: options.host.clone(),
                                attempt,
                            })
                            .await;
                    }
                    last_err = Some(err);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.config.reconnect_delay * (attempt + 1)).await;
                    }
                }
            }
        }
        self.events
            .publish(Event::SshDisconnect { host: options.host.clone() })
            .await;
        Err(last_err.unwrap_or_else(|| Error::Connection {
            host: options.host.clone(),
            cause: "exhausted reconnect attempts".to_string(),
            source: None,
        }))
    }

    async fn sweep_idle(&self, key: &ConnectionKey) {
        let mut entries = self.entries.lock().await;
        if let Some(queue) = entries.get_mut(key) {
            let timeout = self.config.idle_timeout;
            queue.retain(|e| e.last_used.elapsed() < timeout && !e.handle.is_closed());
        }
    }

    /// Sweeps every key's idle queue, evicting stale or closed entries and emitting
    /// `ssh:pool-cleanup` per key with at least one eviction.
    async fn sweep_all(&self) {
        let timeout = self.config.idle_timeout;
        let keys: Vec<ConnectionKey> = self.entries.lock().await.keys().cloned().collect();
        for key in keys {
            let evicted = {
                let mut entries = self.entries.lock().await;
                let Some(queue) = entries.get_mut(&key) else { continue };
                let before = queue.len();
                queue.retain(|e| e.last_used.elapsed() < timeout && !e.handle.is_closed());
                before - queue.len()
            };
            if evicted > 0 {
                self.events
                    .publish(Event::SshPoolCleanup {
                        host: key.1.clone(),
                        evicted,
                    })
                    .await;
            }
        }
    }

    pub async fn metrics(&self) -> SshPoolMetrics {
        let entries = self.entries.lock().await;
        let idle: usize = entries.values().map(VecDeque::len).sum();
        let active: usize = self.checked_out.lock().await.len();
        SshPoolMetrics {
            active,
            idle,
            total: active + idle,
            connections_created: self.connections_created.load(Ordering::Relaxed),
            reuse_count: self.reuse_count.load(Ordering::Relaxed),
        }
    }

    /// Closes every pooled connection and stops the heartbeat sweep. Best-effort:
    /// individual disconnect failures are logged, not propagated.
    pub async fn shutdown(&self) {
        if let Some(task) = self.heartbeat.lock().await.take() {
            task.abort();
        }
        let mut entries = self.entries.lock().await;
        for (key, queue) in entries.drain() {
            for entry in queue {
                if let Err(err) = entry
                    .handle
                    .disconnect(russh::Disconnect::ByApplication, "", "en")
                    .await
                {
                    tracing::debug!(?key, "error disconnecting pooled ssh session: {err}");
                }
            }
        }
    }
}
