//! Relay Configuration
//!
//! Configuration for a single relay instance. Loading (CLI flags, config
//! files) happens outside the core; this module only defines the fields the
//! relays consume, their defaults, and the listen/backend address parsing.
//!
//! Numeric fields left at zero take the documented defaults when a relay
//! reloads the config, so a partially-filled struct is always usable.

use std::path::PathBuf;
use std::time::Duration;

/// Dispatch policy for a relay.
///
/// - `Sync`: every reply comes from the backend; the client waits.
/// - `Smart`: whitelisted write commands are acknowledged locally before the
///   backend has seen them (optimistic ack, at-most-once delivery).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Sync,
    Smart,
}

impl Mode {
    pub fn parse(s: &str) -> Mode {
        if s.eq_ignore_ascii_case("smart") {
            Mode::Smart
        } else {
            Mode::Sync
        }
    }
}

/// The wire protocol a relay speaks on its listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// Full RESP relaying to a remote Redis server.
    #[default]
    Redis,
    /// Filesystem archive (`SET project key [ts] value` / `GET project key [ts]`).
    Fs,
    /// Record-building protocol feeding a batching queue sink.
    Queue,
}

impl Protocol {
    pub fn parse(s: &str) -> Option<Protocol> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Some(Protocol::Redis),
            "fs" | "file" => Some(Protocol::Fs),
            "queue" | "sqs" => Some(Protocol::Queue),
            _ => None,
        }
    }
}

/// A parsed listen or backend address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    /// `host:port`
    Tcp(String),
    /// Unix domain socket path
    Unix(PathBuf),
}

impl Addr {
    /// Accepts `tcp://host:port`, `unix:///path`, `/absolute/path` or a bare
    /// `host:port`.
    pub fn parse(s: &str) -> Addr {
        if let Some(rest) = s.strip_prefix("unix://") {
            return Addr::Unix(PathBuf::from(rest));
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            return Addr::Tcp(rest.to_string());
        }
        if let Some(rest) = s.strip_prefix("redis://") {
            return Addr::Tcp(rest.to_string());
        }
        if s.starts_with('/') {
            return Addr::Unix(PathBuf::from(s));
        }
        Addr::Tcp(s.to_string())
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Addr::Tcp(hp) => write!(f, "{}", hp),
            Addr::Unix(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Configuration for one relay.
///
/// Fields mirror what the surrounding tooling supplies; relays normalize
/// zeroes to defaults on reload.
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    /// Local endpoint clients connect to.
    pub listen: String,
    /// Backend endpoint (Redis server address, queue URL, ...).
    pub url: String,
    /// Wire protocol on the listener.
    pub protocol: Protocol,
    /// Dispatch policy.
    pub mode: Mode,
    /// Upper bound on pooled backend connections or batch workers.
    pub max_connections: usize,
    /// How many idle pooled clients are retained.
    pub max_idle_connections: usize,
    /// Per-operation backend timeout (connect/write). Zero means default.
    pub timeout: Duration,
    /// How long a sync dispatch waits for the backend reply. Zero means
    /// default.
    pub response_timeout: Duration,
    /// Intake channel capacity.
    pub buffer: usize,
    /// Records per flushed batch.
    pub max_records: usize,
    /// Gzip archived payloads (fs backend).
    pub compress: bool,
    /// Base directory of the filesystem archive.
    pub path: String,
    /// Shard count for the filesystem archive. Zero or negative disables
    /// sharding (single-shard path).
    pub shards: i32,
    /// Writer tasks per shard.
    pub writers: usize,
    /// Message group for FIFO queue sinks; empty means non-FIFO.
    pub group_id: String,
    /// Credentials profile, handed through to the remote-store collaborator.
    pub profile: String,
    /// Remote-store region.
    pub region: String,
    /// Remote-store bucket for archive read fallback.
    pub s3_bucket: String,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            listen: String::new(),
            url: String::new(),
            protocol: Protocol::Redis,
            mode: Mode::Sync,
            max_connections: 0,
            max_idle_connections: 0,
            timeout: Duration::ZERO,
            response_timeout: Duration::ZERO,
            buffer: 0,
            max_records: 0,
            compress: false,
            path: String::new(),
            shards: 0,
            writers: 0,
            group_id: String::new(),
            profile: String::new(),
            region: String::new(),
            s3_bucket: String::new(),
        }
    }
}

impl RelayerConfig {
    pub fn listen_addr(&self) -> Addr {
        Addr::parse(&self.listen)
    }

    pub fn backend_addr(&self) -> Addr {
        Addr::parse(&self.url)
    }

    /// Backend connect/write timeout with the default applied.
    pub fn op_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            defaults::CONNECT_TIMEOUT
        } else {
            self.timeout
        }
    }

    /// Sync-dispatch reply wait with the default applied.
    pub fn response_timeout(&self) -> Duration {
        if self.response_timeout.is_zero() {
            defaults::RESPONSE_TIMEOUT
        } else {
            self.response_timeout
        }
    }
}

/// Documented defaults shared by the relays.
pub mod defaults {
    use std::time::Duration;

    /// Dial attempts before a backend client gives up on a connect cycle.
    pub const CONNECTION_RETRIES: u32 = 3;
    /// Capacity of a pooled backend client's intake channel.
    pub const REQUEST_BUFFER_SIZE: usize = 1024;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
    /// Backend socket read timeout.
    pub const SERVER_READ_TIMEOUT: Duration = Duration::from_secs(5);
    /// Local clients are allowed long idle periods.
    pub const LOCAL_READ_TIMEOUT: Duration = Duration::from_secs(600);
    /// Pooled clients idle longer than this are reaped at `get()`.
    pub const MAX_IDLE: Duration = Duration::from_secs(10);
    /// How long a sync dispatch waits for a backend reply.
    pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);

    /// Intake capacity for the redis and queue relays.
    pub const BUFFER: usize = 1024;
    /// Intake capacity for the filesystem archive.
    pub const FS_BUFFER: usize = 20_000;
    pub const MAX_CONNECTIONS: usize = 64;
    pub const MAX_IDLE_CONNECTIONS: usize = 8;

    /// Records per batch for queue sinks.
    pub const MAX_RECORDS: usize = 10;
    /// Hard per-record size for queue sinks (256 KiB).
    pub const MAX_RECORD_BYTES: usize = 256 * 1024;
    /// Time-triggered batch flush.
    pub const RECORDS_TIMEOUT: Duration = Duration::from_secs(2);

    pub const MAX_WORKERS: usize = 10;
    /// Queue occupancy ratio above which the scaler warms up.
    pub const THRESHOLD_WARM_UP: f64 = 0.6;
    pub const SCALE_INTERVAL: Duration = Duration::from_millis(500);
    pub const COOL_DOWN_PERIOD: Duration = Duration::from_secs(15);

    pub const FS_WRITERS_PER_SHARD: usize = 16;
    pub const FS_PATH: &str = "/tmp";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_parse_tcp() {
        assert_eq!(
            Addr::parse("127.0.0.1:6389"),
            Addr::Tcp("127.0.0.1:6389".to_string())
        );
        assert_eq!(
            Addr::parse("tcp://10.0.0.1:6379"),
            Addr::Tcp("10.0.0.1:6379".to_string())
        );
        assert_eq!(
            Addr::parse("redis://10.0.0.1:6379"),
            Addr::Tcp("10.0.0.1:6379".to_string())
        );
    }

    #[test]
    fn test_addr_parse_unix() {
        assert_eq!(
            Addr::parse("unix:///tmp/relay.sock"),
            Addr::Unix(PathBuf::from("/tmp/relay.sock"))
        );
        assert_eq!(
            Addr::parse("/var/run/relay.sock"),
            Addr::Unix(PathBuf::from("/var/run/relay.sock"))
        );
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(Mode::parse("smart"), Mode::Smart);
        assert_eq!(Mode::parse("SMART"), Mode::Smart);
        assert_eq!(Mode::parse("sync"), Mode::Sync);
        assert_eq!(Mode::parse("anything-else"), Mode::Sync);
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!(Protocol::parse("redis"), Some(Protocol::Redis));
        assert_eq!(Protocol::parse("fs"), Some(Protocol::Fs));
        assert_eq!(Protocol::parse("queue"), Some(Protocol::Queue));
        assert_eq!(Protocol::parse("http"), None);
    }

    #[test]
    fn test_op_timeout_default() {
        let cfg = RelayerConfig::default();
        assert_eq!(cfg.op_timeout(), defaults::CONNECT_TIMEOUT);

        let cfg = RelayerConfig {
            timeout: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(cfg.op_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_response_timeout_default() {
        let cfg = RelayerConfig::default();
        assert_eq!(cfg.response_timeout(), defaults::RESPONSE_TIMEOUT);

        let cfg = RelayerConfig {
            response_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        assert_eq!(cfg.response_timeout(), Duration::from_millis(300));
    }
}
