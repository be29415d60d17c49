//! # FlashRelay - A Local-Side Redis Protocol Relayer
//!
//! FlashRelay terminates client connections speaking the Redis wire
//! protocol (RESP) on a local endpoint, synthesizes immediate
//! acknowledgements for a whitelisted set of write commands, and forwards
//! the work to a backend: another Redis server, a sharded filesystem
//! archive, or a batching queue sink. The point is to decouple
//! application-facing write latency from backend latency while preserving
//! per-connection ordering.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             FlashRelay                               │
//! │                                                                      │
//! │  ┌──────────┐   ┌────────────┐   ┌───────────────┐                   │
//! │  │ Listener │──>│ Dispatch   │──>│ fast-ack?     │── smart ──┐       │
//! │  │ tcp/unix │   │ loop (per  │   │ (canned reply │           │       │
//! │  └──────────┘   │ connection)│   │  table)       │── sync ─┐ │       │
//! │                 └────────────┘   └───────────────┘         │ │       │
//! │                                                            ▼ ▼       │
//! │   ┌───────────────────┬─────────────────────┬──────────────────┐     │
//! │   │ Redis client pool │ Shard router + fs   │ Batching spooler │     │
//! │   │ (pipelined,       │ writers (CRC32      │ (elastic workers,│     │
//! │   │  SELECT affinity) │  sharded archive)   │  size/time flush)│     │
//! │   └───────────────────┴─────────────────────┴──────────────────┘     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modes
//!
//! - **sync**: every reply comes from the backend; the client waits.
//! - **smart**: whitelisted write commands are acknowledged with a canned
//!   reply before the backend has confirmed anything. That is an explicit
//!   latency/durability trade: on backend failure the write is lost, but
//!   the client never sees a wrong reply.
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP parser, request records, canned replies
//! - [`conn`]: framed connection buffer with deadlines and idle tracking
//! - [`relay`]: the frontends (redis, queue, fs) and their dispatch loops
//! - [`backend`]: the pooled, pipelined Redis client layer
//! - [`spool`]: batching worker fanout with occupancy-driven scaling
//! - [`record`]: structured records for batch sinks
//! - [`config`]: relay configuration and defaults
//!
//! ## Ordering Guarantees
//!
//! Per connection, clients observe replies in request order in both modes.
//! Per backend socket, replies match request FIFO. Across connections,
//! nothing is promised.

pub mod backend;
pub mod bufpool;
pub mod config;
pub mod conn;
pub mod listener;
pub mod protocol;
pub mod record;
pub mod relay;
pub mod spool;

// Re-export commonly used types for convenience
pub use config::{Addr, Mode, Protocol, RelayerConfig};
pub use protocol::{ParseError, Request, RequestParser, RespValue};
pub use record::Record;
pub use relay::fs::FsRelay;
pub use relay::queue::QueueRelay;
pub use relay::redis::RedisRelay;
pub use spool::{BatchEntry, BatchSink, SpoolConfig, Spooler};

/// The default port the relay listens on (one above Redis)
pub const DEFAULT_PORT: u16 = 6389;

/// The default host the relay binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of FlashRelay
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
