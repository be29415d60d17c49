//! Queue Relay
//!
//! A frontend that turns a small command vocabulary into [`Record`]s and
//! feeds them to a batching [`Spooler`]:
//!
//! - `SET k v` adds a field, `SADD k v` appends to a list field, `HMSET key
//!   f v [f v ...]` fills a nested map
//! - `MULTI` opens a transaction accumulating those into one record;
//!   `EXEC` submits it
//! - `RAWSET bytes` submits an opaque record untouched
//! - `PING` answers locally
//!
//! Replies are always canned: in smart mode submission is fire-and-forget
//! (`-ERR channel full` when the intake is saturated, connection stays
//! open); in sync mode the submission goes through the spooler's
//! confirmation path and the flush outcome decides the reply.

use crate::config::{defaults, Mode, RelayerConfig};
use crate::conn::{Conn, ConnError};
use crate::listener::Listener;
use crate::protocol::{reply, Request, RequestParser};
use crate::record::Record;
use crate::relay::DoneSignal;
use crate::spool::{BatchSink, SpoolConfig, Spooler, SubmitError};
use anyhow::Result;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct QueueRelay<S: BatchSink> {
    inner: Arc<Inner<S>>,
}

struct Inner<S: BatchSink> {
    config: RwLock<Arc<RelayerConfig>>,
    spool: Spooler<S>,
    exiting: AtomicBool,
    shutdown: tokio::sync::watch::Sender<bool>,
    done: DoneSignal,
    bound: Mutex<Option<SocketAddr>>,
}

fn spool_config(cfg: &RelayerConfig) -> SpoolConfig {
    SpoolConfig {
        buffer: cfg.buffer,
        max_records: cfg.max_records,
        max_workers: cfg.max_connections,
        ..Default::default()
    }
}

impl<S: BatchSink> QueueRelay<S> {
    pub fn new(cfg: RelayerConfig, sink: S, done: mpsc::Sender<()>) -> Self {
        let spool = Spooler::new(sink, spool_config(&cfg));
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(Arc::new(cfg)),
                spool,
                exiting: AtomicBool::new(false),
                shutdown,
                done: DoneSignal::new(done),
                bound: Mutex::new(None),
            }),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let cfg = Arc::clone(&self.inner.config.read().unwrap());
        let listener = Listener::bind(&cfg.listen_addr()).await?;
        *self.inner.bound.lock().unwrap() = listener.local_addr();

        info!(listen = %cfg.listen, "Starting queue relay");

        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    res = listener.accept() => match res {
                        Ok((stream, _)) => {
                            let inner = Arc::clone(&inner);
                            tokio::spawn(async move {
                                if let Err(e) = serve_client(inner, stream).await {
                                    debug!(error = %e, "Queue connection closed");
                                }
                            });
                        }
                        Err(e) => {
                            if inner.exiting.load(Ordering::Relaxed) {
                                break;
                            }
                            warn!(error = %e, "Accept failed");
                        }
                    },
                }
            }
        });

        Ok(())
    }

    pub fn reload(&self, cfg: RelayerConfig) {
        info!(listen = %cfg.listen, "Reload");
        self.inner.spool.reload(spool_config(&cfg));
        *self.inner.config.write().unwrap() = Arc::new(cfg);
    }

    /// Stops accepting, drains the spooler, signals done.
    pub async fn exit(&self) {
        self.inner.exiting.store(true, Ordering::Relaxed);
        let _ = self.inner.shutdown.send(true);
        self.inner.spool.exit().await;
        self.inner.done.fire();
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound.lock().unwrap()
    }
}

async fn serve_client<S: BatchSink>(
    inner: Arc<Inner<S>>,
    stream: Box<dyn crate::conn::Stream>,
) -> Result<(), ConnError> {
    let mut conn = Conn::new(
        stream,
        defaults::LOCAL_READ_TIMEOUT,
        defaults::WRITE_TIMEOUT,
    );
    let mut parser = RequestParser::new();

    // Open transaction, if any.
    let mut multi: Option<Record> = None;

    loop {
        let req = match conn.next_request(&mut parser, true).await {
            Ok(req) => req,
            Err(ConnError::Disconnected) => {
                if multi.is_some() {
                    warn!("Queue relay: MULTI closed before ending with EXEC");
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if inner.exiting.load(Ordering::Relaxed) {
            let _ = conn.write(reply::CLOSING).await;
            return Ok(());
        }

        match &req.command[..] {
            b"PING" => conn.write(reply::PONG).await?,

            b"QUIT" => {
                conn.write(reply::OK).await?;
                return Ok(());
            }

            b"MULTI" => {
                multi = Some(Record::new());
                conn.write(reply::OK).await?;
            }

            b"EXEC" => match multi.take() {
                Some(record) => submit(&inner, &mut conn, record).await?,
                None => conn.write(reply::BAD_COMMAND).await?,
            },

            b"RAWSET" => {
                if multi.is_some() || req.items.len() != 2 {
                    conn.write(reply::KO).await?;
                    continue;
                }
                let Some(body) = req.items[1].as_bytes() else {
                    conn.write(reply::KO).await?;
                    continue;
                };
                let record = Record::raw(Bytes::copy_from_slice(body));
                submit(&inner, &mut conn, record).await?;
            }

            b"SET" => match string_pair(&req, 1) {
                Some((k, v)) => match &mut multi {
                    Some(record) => {
                        record.add(&k, v);
                        conn.write(reply::OK).await?;
                    }
                    None => {
                        let mut record = Record::new();
                        record.add(&k, v);
                        submit(&inner, &mut conn, record).await?;
                    }
                },
                None => conn.write(reply::BAD_COMMAND).await?,
            },

            b"SADD" => match string_pair(&req, 1) {
                Some((k, v)) => match &mut multi {
                    Some(record) => {
                        record.sadd(&k, v);
                        conn.write(reply::OK).await?;
                    }
                    None => {
                        let mut record = Record::new();
                        record.sadd(&k, v);
                        submit(&inner, &mut conn, record).await?;
                    }
                },
                None => conn.write(reply::BAD_COMMAND).await?,
            },

            b"HMSET" => {
                // HMSET key field value [field value ...]
                if req.items.len() < 4 || req.items.len() % 2 != 0 {
                    conn.write(reply::BAD_COMMAND).await?;
                    continue;
                }
                let Some(key) = req.items[1].as_str().map(str::to_string) else {
                    conn.write(reply::BAD_COMMAND).await?;
                    continue;
                };

                let mut fresh = Record::new();
                let target = multi.as_mut().unwrap_or(&mut fresh);
                for pair in req.items[2..].chunks(2) {
                    if let (Some(f), Some(v)) = (pair[0].as_str(), pair[1].as_str()) {
                        target.mhset(&key, f, v);
                    }
                }

                if multi.is_some() {
                    conn.write(reply::OK).await?;
                } else {
                    submit(&inner, &mut conn, fresh).await?;
                }
            }

            _ => conn.write(reply::BAD_COMMAND).await?,
        }
    }
}

/// Routes one record to the spooler per the relay mode, answering the
/// client. Full intake is an error reply, never unbounded blocking.
async fn submit<S: BatchSink>(
    inner: &Arc<Inner<S>>,
    conn: &mut Conn,
    record: Record,
) -> Result<(), ConnError> {
    let mode = inner.config.read().unwrap().mode;

    if mode == Mode::Sync {
        if inner.spool.submit_sync(record).await {
            conn.write(reply::OK).await?;
        } else {
            conn.write(reply::KO).await?;
        }
        return Ok(());
    }

    match inner.spool.submit(record) {
        Ok(()) => conn.write(reply::OK).await?,
        Err(SubmitError::Full) => {
            warn!("Queue relay intake full");
            conn.write(reply::CHANNEL_FULL).await?;
        }
        Err(SubmitError::Closed) => conn.write(reply::KO).await?,
    }
    Ok(())
}

/// Extracts two consecutive string items starting at `at`.
fn string_pair(req: &Request, at: usize) -> Option<(String, String)> {
    if req.items.len() != at + 2 {
        return None;
    }
    let k = req.items[at].as_str()?.to_string();
    let v = req.items[at + 1].as_str()?.to_string();
    Some((k, v))
}
