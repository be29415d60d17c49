//! Shard Router
//!
//! Routes each message to a shard by `CRC32(key) mod S`. Every shard owns
//! its own bounded intake channel and its own writer set, so hot keys only
//! back up their shard. With sharding disabled a single shard carries
//! everything.
//!
//! Reload adjusts the writer count per shard in place: growing spawns,
//! shrinking stops the surplus. Exit waits for the intakes to drain before
//! stopping the writers.

use super::msg::{ArchiveConfig, Msg};
use super::writer;
use crate::bufpool::BufferPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Ceiling on writers per shard, whatever the config asks for.
const SHARD_LIMIT_WRITERS: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum RouteError {
    #[error("shard intake full")]
    Full,
    #[error("shard closed")]
    Closed,
}

struct WriterHandle {
    stop: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

struct Shard {
    index: u32,
    tx: mpsc::Sender<Msg>,
    rx: writer::SharedRx,
    writers: Vec<WriterHandle>,
}

impl Shard {
    fn new(index: u32, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        Self {
            index,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            writers: Vec::new(),
        }
    }

    fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    async fn set_writers(
        &mut self,
        count: usize,
        cfg: &ArchiveConfig,
        pool: &Arc<BufferPool>,
    ) {
        let count = count.clamp(1, SHARD_LIMIT_WRITERS);
        let current = self.writers.len();

        if current < count {
            for _ in current..count {
                let (stop_tx, stop_rx) = oneshot::channel();
                let join = tokio::spawn(writer::run(
                    self.index,
                    cfg.clone(),
                    Arc::clone(&self.rx),
                    Arc::clone(pool),
                    stop_rx,
                ));
                self.writers.push(WriterHandle {
                    stop: stop_tx,
                    join,
                });
            }
        } else {
            for handle in self.writers.drain(count..) {
                let _ = handle.stop.send(());
                let _ = handle.join.await;
            }
        }
        debug!(shard = self.index, writers = self.writers.len(), "Shard writers adjusted");
    }

    async fn stop(&mut self) {
        for handle in self.writers.drain(..) {
            let _ = handle.stop.send(());
            let _ = handle.join.await;
        }
    }
}

pub(crate) struct ShardRouter {
    cfg: ArchiveConfig,
    shards: Vec<Shard>,
}

impl ShardRouter {
    /// Builds the shard set and spawns `writers` writer tasks per shard.
    pub async fn new(
        cfg: ArchiveConfig,
        buffer: usize,
        writers: usize,
        pool: &Arc<BufferPool>,
    ) -> Self {
        let count = cfg.shards.max(1);
        let mut shards = Vec::with_capacity(count as usize);
        for index in 0..count {
            let mut shard = Shard::new(index, buffer);
            shard.set_writers(writers, &cfg, pool).await;
            shards.push(shard);
        }
        Self { cfg, shards }
    }

    /// Non-blocking delivery to the owning shard.
    pub fn route(&self, msg: Msg) -> Result<(), (Msg, RouteError)> {
        let index = if self.cfg.shards == 0 {
            0
        } else {
            msg.shard_index(self.cfg.shards) as usize
        };
        match self.shards[index].tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => Err((msg, RouteError::Full)),
            Err(mpsc::error::TrySendError::Closed(msg)) => Err((msg, RouteError::Closed)),
        }
    }

    /// Applies a new per-shard writer count.
    pub async fn reload(&mut self, writers: usize, pool: &Arc<BufferPool>) {
        let cfg = self.cfg.clone();
        for shard in &mut self.shards {
            shard.set_writers(writers, &cfg, pool).await;
        }
    }

    /// Waits for the intakes to drain (bounded), then stops every writer.
    pub async fn exit(&mut self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let queued: usize = self.shards.iter().map(Shard::queued).sum();
            if queued == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(queued, "Shard router exiting with messages still queued");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for shard in &mut self.shards {
            shard.stop().await;
        }
        debug!("Shard router drained");
    }

    #[cfg(test)]
    pub(crate) fn queued_total(&self) -> usize {
        self.shards.iter().map(Shard::queued).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use time::OffsetDateTime;

    fn temp_base(tag: &str) -> String {
        let dir =
            std::env::temp_dir().join(format!("flashrelay-shard-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.display().to_string()
    }

    fn msg(key: &str, body: &[u8]) -> Msg {
        Msg::new(
            "p".to_string(),
            key.to_string(),
            OffsetDateTime::from_unix_timestamp(1469189015).unwrap(),
            BytesMut::from(body),
        )
    }

    #[tokio::test]
    async fn test_route_writes_to_sharded_path() {
        let cfg = ArchiveConfig {
            base: temp_base("route"),
            shards: 4,
            compress: false,
        };
        let pool = Arc::new(BufferPool::new());
        let mut router = ShardRouter::new(cfg.clone(), 64, 2, &pool).await;

        let m = msg("k", b"v");
        let expected = m.full_path(&cfg);
        router.route(m).unwrap();

        // Writers pick it up asynchronously.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !std::path::Path::new(&expected).exists() {
            assert!(tokio::time::Instant::now() < deadline, "file never written");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(std::fs::read(&expected).unwrap(), b"v");

        router.exit().await;
        assert_eq!(router.queued_total(), 0);
    }

    #[tokio::test]
    async fn test_full_shard_reports_backpressure() {
        let cfg = ArchiveConfig {
            base: temp_base("full"),
            shards: 0,
            compress: false,
        };
        let pool = Arc::new(BufferPool::new());
        let mut router = ShardRouter::new(cfg, 1, 1, &pool).await;

        // Stop the writers so nothing drains, then overfill.
        for shard in &mut router.shards {
            shard.stop().await;
        }

        let mut saw_full = false;
        for i in 0..4 {
            if let Err((_, e)) = router.route(msg(&format!("k{}", i), b"v")) {
                assert_eq!(e, RouteError::Full);
                saw_full = true;
                break;
            }
        }
        assert!(saw_full);
    }

    #[tokio::test]
    async fn test_exit_drains_queue() {
        let cfg = ArchiveConfig {
            base: temp_base("drain"),
            shards: 2,
            compress: false,
        };
        let pool = Arc::new(BufferPool::new());
        let mut router = ShardRouter::new(cfg, 64, 1, &pool).await;

        for i in 0..20 {
            router.route(msg(&format!("k{}", i), b"v")).unwrap();
        }
        router.exit().await;
        assert_eq!(router.queued_total(), 0, "intakes must be empty at done");
    }
}
