//! Backend Client Pool
//!
//! Owns up to `MaxConnections` persistent backend clients and leases them to
//! dispatch loops. A dispatch loop keeps its lease for the connection's
//! lifetime, which is what preserves per-connection ordering: all of one
//! client connection's traffic rides one backend socket.
//!
//! Leases returned to the pool are retained up to `MaxIdleConnections`; a
//! retained client idle beyond the staleness threshold is reaped at the next
//! `get()` and replaced by a fresh dial.

use crate::backend::client::{self, ClientHandle};
use crate::config::{defaults, Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    /// All clients leased and none came back within the wait bound.
    #[error("no clients available from pool")]
    Unavailable,
    /// The pool is shutting down.
    #[error("pool closing")]
    Closing,
}

#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub addr: Addr,
    pub max_connections: usize,
    pub max_idle_connections: usize,
    /// Capacity of each client's request intake channel.
    pub request_buffer: usize,
    pub op_timeout: Duration,
    pub max_idle: Duration,
}

impl PoolConfig {
    pub(crate) fn normalized(mut self) -> Self {
        if self.max_connections == 0 {
            self.max_connections = defaults::MAX_CONNECTIONS;
        }
        if self.max_idle_connections == 0 {
            self.max_idle_connections = defaults::MAX_IDLE_CONNECTIONS;
        }
        if self.request_buffer == 0 {
            self.request_buffer = defaults::REQUEST_BUFFER_SIZE;
        }
        if self.op_timeout.is_zero() {
            self.op_timeout = defaults::CONNECT_TIMEOUT;
        }
        if self.max_idle.is_zero() {
            self.max_idle = defaults::MAX_IDLE;
        }
        self
    }
}

pub(crate) struct Pool {
    cfg: Mutex<PoolConfig>,
    free: Mutex<Vec<ClientHandle>>,
    leases: Arc<Semaphore>,
    shutdown: Mutex<watch::Sender<bool>>,
    next_id: AtomicU64,
    exiting: AtomicBool,
}

impl Pool {
    pub fn new(cfg: PoolConfig) -> Self {
        let cfg = cfg.normalized();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            leases: Arc::new(Semaphore::new(cfg.max_connections)),
            cfg: Mutex::new(cfg),
            free: Mutex::new(Vec::new()),
            shutdown: Mutex::new(shutdown_tx),
            next_id: AtomicU64::new(1),
            exiting: AtomicBool::new(false),
        }
    }

    /// Leases a client, reaping stale retained ones on the way. Bounded
    /// wait: callers get `Unavailable` instead of queueing forever.
    pub async fn get(&self) -> Result<ClientHandle, PoolError> {
        if self.exiting.load(Ordering::Relaxed) {
            return Err(PoolError::Closing);
        }

        let wait = self.cfg.lock().unwrap().op_timeout;
        let permit = match timeout(wait, Arc::clone(&self.leases).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => return Err(PoolError::Unavailable),
        };
        // Ownership of the slot travels with the handle; the permit comes
        // back in put() or discard().
        permit.forget();

        let max_idle = self.cfg.lock().unwrap().max_idle;
        loop {
            let handle = self.free.lock().unwrap().pop();
            match handle {
                Some(handle) if handle.last_used.elapsed() > max_idle => {
                    debug!(client = handle.id, "Reaping stale pooled client");
                    drop(handle);
                }
                Some(handle) => return Ok(handle),
                None => break,
            }
        }

        Ok(self.spawn_client())
    }

    /// Returns a lease. Idle retention is bounded; surplus clients drop.
    pub fn put(&self, mut handle: ClientHandle) {
        let retain = {
            let cfg = self.cfg.lock().unwrap();
            !self.exiting.load(Ordering::Relaxed) && cfg.max_idle_connections > 0
        };

        if retain {
            handle.last_used = Instant::now();
            let mut free = self.free.lock().unwrap();
            let cap = self.cfg.lock().unwrap().max_idle_connections;
            if free.len() < cap {
                free.push(handle);
            }
        }

        self.leases.add_permits(1);
    }

    /// Drops a lease without retaining it (broken client).
    pub fn discard(&self, handle: ClientHandle) {
        drop(handle);
        self.leases.add_permits(1);
    }

    /// In-place config update; client count and timeouts apply to future
    /// leases and dials.
    pub fn reload(&self, cfg: PoolConfig) {
        let cfg = cfg.normalized();
        let mut current = self.cfg.lock().unwrap();
        if cfg.max_connections > current.max_connections {
            self.leases
                .add_permits(cfg.max_connections - current.max_connections);
        } else if cfg.max_connections < current.max_connections {
            // Shrink by eating permits as they come back.
            let surplus = current.max_connections - cfg.max_connections;
            let leases = Arc::clone(&self.leases);
            tokio::spawn(async move {
                for _ in 0..surplus {
                    if let Ok(p) = leases.acquire().await {
                        p.forget();
                    }
                }
            });
        }
        *current = cfg;
    }

    /// Tears every client down and rebuilds the shutdown signal; used when
    /// the backend URL changed.
    pub fn reset(&self, cfg: PoolConfig) {
        info!(backend = %cfg.addr, "Pool reset");
        self.shutdown.lock().unwrap().send_replace(true);
        self.free.lock().unwrap().clear();

        let (shutdown_tx, _) = watch::channel(false);
        *self.shutdown.lock().unwrap() = shutdown_tx;
        *self.cfg.lock().unwrap() = cfg.normalized();
    }

    /// Stops every client; the pool refuses leases from here on.
    pub fn exit(&self) {
        self.exiting.store(true, Ordering::Relaxed);
        self.shutdown.lock().unwrap().send_replace(true);
        self.free.lock().unwrap().clear();
    }

    fn spawn_client(&self) -> ClientHandle {
        let cfg = self.cfg.lock().unwrap().clone();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shutdown_rx = self.shutdown.lock().unwrap().subscribe();
        debug!(client = id, backend = %cfg.addr, "Spawning backend client");
        client::spawn(id, cfg.addr, cfg.op_timeout, cfg.request_buffer, shutdown_rx)
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
