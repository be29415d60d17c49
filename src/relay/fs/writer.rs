//! Shard Writers
//!
//! Writer tasks drain a shard's intake channel and persist each message as
//! one file, gzip-compressed when the archive is configured that way. The
//! message body buffer goes back to the pool after the write.

use super::msg::{ArchiveConfig, Msg};
use crate::bufpool::BufferPool;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error};

pub(crate) type SharedRx = Arc<Mutex<mpsc::Receiver<Msg>>>;

/// One writer task. Stops on signal or when the shard channel closes,
/// finishing the write in progress either way.
pub(crate) async fn run(
    shard: u32,
    cfg: ArchiveConfig,
    intake: SharedRx,
    pool: Arc<BufferPool>,
    mut stop: oneshot::Receiver<()>,
) {
    debug!(shard, "Archive writer ready");
    loop {
        tokio::select! {
            biased;

            _ = &mut stop => {
                debug!(shard, "Archive writer stopped");
                return;
            }

            msg = recv(&intake) => {
                let Some(msg) = msg else { return };
                if let Err(e) = write_msg(&cfg, &msg).await {
                    error!(shard, key = %msg.key, error = %e, "Archive write failed");
                }
                pool.put(msg.body);
            }
        }
    }
}

async fn recv(shared: &SharedRx) -> Option<Msg> {
    shared.lock().await.recv().await
}

/// Persists one message at its derived path. Shared with the sync dispatch
/// path, which writes inline and reports the outcome to the client.
pub(crate) async fn write_msg(cfg: &ArchiveConfig, msg: &Msg) -> io::Result<()> {
    let dir = msg.dir(cfg);
    tokio::fs::create_dir_all(&dir).await?;

    let path = format!("{}/{}", dir, msg.filename(cfg.compress));

    if cfg.compress {
        let mut encoder = GzEncoder::new(Vec::with_capacity(msg.body.len() / 2), Compression::default());
        encoder.write_all(&msg.body)?;
        let compressed = encoder.finish()?;
        tokio::fs::write(&path, compressed).await?;
    } else {
        tokio::fs::write(&path, &msg.body[..]).await?;
    }

    Ok(())
}
