//! Relay Frontends
//!
//! One relay per configured listener, each owning its accept loop, its
//! per-connection dispatch tasks, and its backend plumbing:
//!
//! - `redis`: RESP relaying into a pooled Redis backend, sync or smart
//! - `queue`: record-building protocol into a batching spooler
//! - `fs`: filesystem archive with CRC32 sharding
//!
//! All three share the lifecycle surface: `start`, `reload`, `exit`, and a
//! `done` sender signalled exactly once after the relay has drained.

pub mod fs;
pub mod queue;
pub mod redis;

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Fires the process-level done channel exactly once, no matter how many
/// shutdown paths race into it.
pub struct DoneSignal {
    tx: mpsc::Sender<()>,
    fired: AtomicBool,
}

impl DoneSignal {
    pub fn new(tx: mpsc::Sender<()>) -> Self {
        Self {
            tx,
            fired: AtomicBool::new(false),
        }
    }

    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let _ = self.tx.try_send(());
        }
    }
}
