//! Redis Backend
//!
//! The pooled, pipelined client layer the redis relay forwards into:
//!
//! - `client`: one task per persistent backend socket, FIFO reply matching,
//!   database affinity via compensating `SELECT`s, reconnect budget
//! - `pool`: lease management, idle retention and reaping, reset on URL
//!   change
//!
//! Ordering: within one socket, replies match request submission order.
//! Across clients nothing is ordered, which is why a dispatch loop pins one
//! lease for its whole connection.

pub(crate) mod client;
pub(crate) mod pool;

pub use pool::PoolError;
