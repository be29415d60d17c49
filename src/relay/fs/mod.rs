//! Filesystem Archive Relay
//!
//! Speaks a three-command protocol on its listener:
//!
//! - `SET project key [timestamp] value` archives a payload. In sync mode
//!   the file is written on the dispatch path and the reply reports the
//!   outcome; otherwise the message is routed to its shard and the derived
//!   path is echoed immediately.
//! - `GET project key [timestamp]` reads a payload back, walking the
//!   sharded, unsharded, and remote-store locations in that order.
//! - `PING` answers locally.
//!
//! Anything else is `-ERR bad command` with the connection kept open.

pub mod msg;
pub(crate) mod shard;
pub(crate) mod writer;

use crate::bufpool::BufferPool;
use crate::config::{defaults, Mode, RelayerConfig};
use crate::conn::{Conn, ConnError};
use crate::listener::Listener;
use crate::protocol::{reply, Request, RequestParser, RespValue};
use crate::relay::DoneSignal;
use anyhow::Result;
use bytes::BytesMut;
use msg::{ArchiveConfig, Msg, RemoteStore};
use shard::{RouteError, ShardRouter};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

pub struct FsRelay {
    inner: Arc<Inner>,
}

struct Inner {
    config: StdRwLock<Arc<RelayerConfig>>,
    archive: StdRwLock<Arc<ArchiveConfig>>,
    router: RwLock<ShardRouter>,
    pool: Arc<BufferPool>,
    remote: Option<Box<dyn RemoteStore>>,
    exiting: AtomicBool,
    shutdown: watch::Sender<bool>,
    done: DoneSignal,
    bound: Mutex<Option<SocketAddr>>,
}

fn archive_config(cfg: &RelayerConfig) -> ArchiveConfig {
    // Zero or negative disables sharding: everything rides one shard.
    let shards = if cfg.shards > 0 { cfg.shards as u32 } else { 0 };
    let base = if cfg.path.is_empty() {
        defaults::FS_PATH.to_string()
    } else {
        cfg.path.clone()
    };
    ArchiveConfig {
        base,
        shards,
        compress: cfg.compress,
    }
}

fn buffer_of(cfg: &RelayerConfig) -> usize {
    if cfg.buffer == 0 {
        defaults::FS_BUFFER
    } else {
        cfg.buffer
    }
}

fn writers_of(cfg: &RelayerConfig) -> usize {
    if cfg.writers == 0 {
        defaults::FS_WRITERS_PER_SHARD
    } else {
        cfg.writers
    }
}

impl FsRelay {
    /// Builds the relay and its shard router. `remote` is the optional
    /// object-store fallback for reads.
    pub async fn new(
        cfg: RelayerConfig,
        remote: Option<Box<dyn RemoteStore>>,
        done: mpsc::Sender<()>,
    ) -> Self {
        let archive = archive_config(&cfg);
        let pool = Arc::new(BufferPool::new());
        let router =
            ShardRouter::new(archive.clone(), buffer_of(&cfg), writers_of(&cfg), &pool).await;
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config: StdRwLock::new(Arc::new(cfg)),
                archive: StdRwLock::new(Arc::new(archive)),
                router: RwLock::new(router),
                pool,
                remote,
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

        let archive = Arc::clone(&self.inner.archive.read().unwrap());
        info!(
            listen = %cfg.listen,
            path = %archive.base,
            shards = archive.shards,
            "Starting fs relay"
        );

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
                                    debug!(error = %e, "Fs connection closed");
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

    /// Swaps the config; writer counts adjust live, path/shard/compress
    /// changes apply to subsequent messages.
    pub async fn reload(&self, cfg: RelayerConfig) {
        info!(listen = %cfg.listen, "Reload");
        let archive = archive_config(&cfg);
        self.inner
            .router
            .write()
            .await
            .reload(writers_of(&cfg), &self.inner.pool)
            .await;
        *self.inner.archive.write().unwrap() = Arc::new(archive);
        *self.inner.config.write().unwrap() = Arc::new(cfg);
    }

    /// Stops accepting, drains the shards, signals done.
    pub async fn exit(&self) {
        self.inner.exiting.store(true, Ordering::Relaxed);
        let _ = self.inner.shutdown.send(true);
        self.inner.router.write().await.exit().await;
        self.inner.done.fire();
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound.lock().unwrap()
    }
}

async fn serve_client(
    inner: Arc<Inner>,
    stream: Box<dyn crate::conn::Stream>,
) -> Result<(), ConnError> {
    let mut conn = Conn::new(
        stream,
        defaults::LOCAL_READ_TIMEOUT,
        defaults::WRITE_TIMEOUT,
    );
    let mut parser = RequestParser::new();

    loop {
        let req = match conn.next_request(&mut parser, true).await {
            Ok(req) => req,
            Err(ConnError::Disconnected) => return Ok(()),
            Err(e) => return Err(e),
        };

        match &req.command[..] {
            b"PING" => conn.write(reply::OK).await?,
            b"SET" => handle_set(&inner, &mut conn, &req).await?,
            b"GET" => handle_get(&inner, &mut conn, &req).await?,
            _ => conn.write(reply::BAD_COMMAND).await?,
        }
    }
}

/// `SET project key [timestamp] value`
async fn handle_set(inner: &Arc<Inner>, conn: &mut Conn, req: &Request) -> Result<(), ConnError> {
    let Some(msg) = parse_msg(inner, req, true) else {
        return Ok(conn.write(reply::BAD_SET).await?);
    };

    let archive = Arc::clone(&inner.archive.read().unwrap());
    let path = msg.full_path(&archive);

    if inner.exiting.load(Ordering::Relaxed) {
        inner.pool.put(msg.body);
        return Ok(conn.write(reply::CLOSING).await?);
    }

    let mode = inner.config.read().unwrap().mode;
    if mode == Mode::Sync {
        // Write on the dispatch path; the client learns the real outcome.
        let res = writer::write_msg(&archive, &msg).await;
        inner.pool.put(msg.body);
        return match res {
            Ok(()) => Ok(conn.write(&bulk(&path)).await?),
            Err(e) => {
                warn!(error = %e, "Archive sync write failed");
                Ok(conn.write(&error_reply(&e)).await?)
            }
        };
    }

    match inner.router.read().await.route(msg) {
        Ok(()) => conn.write(&bulk(&path)).await?,
        Err((msg, RouteError::Full)) => {
            warn!("Archive shard intake full");
            inner.pool.put(msg.body);
            conn.write(reply::CHANNEL_FULL).await?;
        }
        Err((msg, RouteError::Closed)) => {
            inner.pool.put(msg.body);
            conn.write(reply::CLOSING).await?;
        }
    }
    Ok(())
}

/// `GET project key [timestamp]`
async fn handle_get(inner: &Arc<Inner>, conn: &mut Conn, req: &Request) -> Result<(), ConnError> {
    let Some(msg) = parse_msg(inner, req, false) else {
        return Ok(conn.write(reply::BAD_GET).await?);
    };

    let archive = Arc::clone(&inner.archive.read().unwrap());
    let remote = inner.remote.as_deref();
    let res = msg.read(&archive, remote).await;
    inner.pool.put(msg.body);

    match res {
        Ok(content) => {
            let frame = RespValue::bulk_string(content).serialize();
            conn.write(&frame).await?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            conn.write(reply::NOT_FOUND).await?;
        }
        Err(e) => {
            warn!(error = %e, "Archive read failed");
            conn.write(&error_reply(&e)).await?;
        }
    }
    Ok(())
}

/// Builds a `Msg` from a SET (arity 4-5, value present) or GET (arity 3-4)
/// request. Returns `None` on any syntax problem.
fn parse_msg(inner: &Arc<Inner>, req: &Request, with_value: bool) -> Option<Msg> {
    let (min, max) = if with_value { (4, 5) } else { (3, 4) };
    if req.items.len() < min || req.items.len() > max {
        return None;
    }

    let project = req.items[1].as_str()?.to_string();
    let key = req.items[2].as_str()?.to_string();

    let explicit_ts = req.items.len() == max;
    let timestamp = if explicit_ts {
        let unix = req.items[3].as_integer()?;
        OffsetDateTime::from_unix_timestamp(unix).ok()?
    } else {
        OffsetDateTime::now_utc()
    };

    let mut body = inner.pool.get();
    if with_value {
        let value_at = if explicit_ts { 4 } else { 3 };
        body.extend_from_slice(req.items[value_at].as_bytes()?);
    }

    Some(Msg::new(project, key, timestamp, body))
}

fn bulk(s: &str) -> Vec<u8> {
    RespValue::bulk_string(BytesMut::from(s.as_bytes()).freeze()).serialize()
}

fn error_reply(e: &io::Error) -> Vec<u8> {
    RespValue::error(format!("ERR {}", e)).serialize()
}
