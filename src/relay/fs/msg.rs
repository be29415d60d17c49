//! Archive Messages and Path Derivation
//!
//! A [`Msg`] is one archived payload: project, key, timestamp, body. Its
//! storage path is fully deterministic:
//!
//! ```text
//! {base}/{project}/YYYY/MM/DD/HH/MM[/{shard:02x}]/{key}.{log|log.gz}
//! ```
//!
//! The shard component is `CRC32(key) mod shards`, present only when
//! sharding is enabled. Reads walk a fallback chain: the sharded path
//! first, then the unsharded layout older archives used, finally the
//! remote object store when one is configured.

use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use std::future::Future;
use std::io::{self, Read};
use std::pin::Pin;
use time::OffsetDateTime;
use tracing::debug;

pub const EXT_PLAIN: &str = "log";
pub const EXT_GZ: &str = "log.gz";

/// Remote object store fallback for reads. The actual store (S3 or
/// whatever else) lives outside the core; this is the contract it serves.
pub trait RemoteStore: Send + Sync {
    /// Fetches `key` under the archive's hour-granular prefix.
    fn fetch<'a>(
        &'a self,
        key: &'a str,
        hour_path: &'a str,
        timestamp: OffsetDateTime,
    ) -> Pin<Box<dyn Future<Output = io::Result<Bytes>> + Send + 'a>>;
}

/// Snapshot of the archive settings a message needs for path derivation.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub base: String,
    /// Zero disables sharding.
    pub shards: u32,
    pub compress: bool,
}

/// One archived payload.
#[derive(Debug)]
pub struct Msg {
    pub project: String,
    pub key: String,
    pub timestamp: OffsetDateTime,
    pub body: BytesMut,
}

impl Msg {
    pub fn new(project: String, key: String, timestamp: OffsetDateTime, body: BytesMut) -> Self {
        Self {
            project,
            key,
            timestamp,
            body,
        }
    }

    /// `CRC32(key) mod shards`.
    pub fn shard_index(&self, shards: u32) -> u32 {
        crc32fast::hash(self.key.as_bytes()) % shards
    }

    /// Relative path up to the hour: `{project}/YYYY/MM/DD/HH`.
    pub fn hour_path(&self) -> String {
        let t = self.timestamp;
        format!(
            "{}/{}/{:02}/{:02}/{:02}",
            self.project,
            t.year(),
            t.month() as u8,
            t.day(),
            t.hour()
        )
    }

    /// Relative directory, minute-granular, shard-suffixed when sharding
    /// is on and not explicitly disabled for this lookup.
    fn rel_dir(&self, cfg: &ArchiveConfig, sharded: bool) -> String {
        if cfg.shards == 0 || !sharded {
            format!("{}/{:02}", self.hour_path(), self.timestamp.minute())
        } else {
            format!(
                "{}/{:02}/{:02x}",
                self.hour_path(),
                self.timestamp.minute(),
                self.shard_index(cfg.shards)
            )
        }
    }

    /// Absolute directory this message lands in.
    pub fn dir(&self, cfg: &ArchiveConfig) -> String {
        format!("{}/{}", cfg.base, self.rel_dir(cfg, true))
    }

    pub fn filename(&self, compress: bool) -> String {
        if compress {
            format!("{}.{}", self.key, EXT_GZ)
        } else {
            format!("{}.{}", self.key, EXT_PLAIN)
        }
    }

    /// Full path the write side uses, also echoed to the client.
    pub fn full_path(&self, cfg: &ArchiveConfig) -> String {
        format!("{}/{}", self.dir(cfg), self.filename(cfg.compress))
    }

    /// Resolves the archived content: sharded path, then unsharded, then
    /// the remote store. A compressed archive is tried in its gzip form
    /// first; an existing-but-empty gzip file reads as empty content.
    pub async fn read(
        &self,
        cfg: &ArchiveConfig,
        remote: Option<&dyn RemoteStore>,
    ) -> io::Result<Bytes> {
        for sharded in [true, false] {
            if !sharded && cfg.shards == 0 {
                break;
            }
            let dir = format!("{}/{}", cfg.base, self.rel_dir(cfg, sharded));

            if cfg.compress {
                let path = format!("{}/{}", dir, self.filename(true));
                match read_file(&path, true).await {
                    Ok(b) => return Ok(b),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }

            let path = format!("{}/{}", dir, self.filename(false));
            match read_file(&path, false).await {
                Ok(b) => return Ok(b),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(remote) = remote {
            debug!(key = %self.key, "Archive read falling back to remote store");
            return remote.fetch(&self.key, &self.hour_path(), self.timestamp).await;
        }

        Err(io::ErrorKind::NotFound.into())
    }
}

async fn read_file(path: &str, gz: bool) -> io::Result<Bytes> {
    let raw = tokio::fs::read(path).await?;

    if !gz {
        return Ok(Bytes::from(raw));
    }

    // A zero-byte gzip file exists but holds nothing; treat it as empty
    // content rather than a decode error.
    if raw.is_empty() {
        return Ok(Bytes::new());
    }

    let mut decoder = GzDecoder::new(&raw[..]);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(Bytes::from(out))
}
