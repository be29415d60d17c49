//! Framed Connection Buffer
//!
//! Wraps one accepted socket with per-direction deadlines, the incremental
//! read buffer the parser works over, and idle-time tracking. Each dispatch
//! loop owns exactly one of these; nothing here is shared.
//!
//! The read buffer is a reusable slab with a bounded reuse counter: after a
//! large burst has grown it, the next quiet moment reallocates it at the
//! initial size so a one-off peak is not pinned for the connection lifetime.

use crate::protocol::{ParseError, Request, RequestParser};
use bytes::{Buf, BytesMut};
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Reads after which an oversized slab is reallocated instead of reused
const MAX_BUFFER_REUSE: u32 = 1000;

/// Slabs above this capacity are candidates for reallocation
const SHRINK_THRESHOLD: usize = 64 * 1024;

/// Boxed byte stream; TCP and Unix sockets both come through here.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Errors from the connection read path.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Peer closed the socket between requests.
    #[error("client disconnected")]
    Disconnected,

    /// Peer closed the socket mid-frame.
    #[error("unexpected end of stream")]
    UnexpectedEof,
}

/// One buffered, deadline-bound connection.
pub struct Conn {
    stream: Box<dyn Stream>,
    buf: BytesMut,
    read_timeout: Duration,
    write_timeout: Duration,
    last_used: Instant,
    reuse_count: u32,
}

impl Conn {
    pub fn new(stream: Box<dyn Stream>, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            read_timeout,
            write_timeout,
            last_used: Instant::now(),
            reuse_count: 0,
        }
    }

    /// True when nothing has moved on this connection for longer than `idle`.
    pub fn is_stale(&self, idle: Duration) -> bool {
        !idle.is_zero() && self.last_used.elapsed() > idle
    }

    /// Parses the next request off the connection, reading more bytes from
    /// the socket as needed. `parse_command` flows through to the parser.
    pub async fn next_request(
        &mut self,
        parser: &mut RequestParser,
        parse_command: bool,
    ) -> Result<Request, ConnError> {
        loop {
            if !self.buf.is_empty() {
                if let Some((req, consumed)) = parser.parse(&self.buf, parse_command)? {
                    self.buf.advance(consumed);
                    if self.buf.is_empty() {
                        self.maybe_shrink();
                    }
                    return Ok(req);
                }
            }
            self.read_more().await?;
        }
    }

    /// Reads at least one byte into the buffer, honoring the read deadline.
    async fn read_more(&mut self) -> Result<(), ConnError> {
        if self.buf.capacity() - self.buf.len() < 1024 {
            self.buf.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = match timeout(self.read_timeout, self.stream.read_buf(&mut self.buf)).await {
            Ok(res) => res?,
            Err(_) => return Err(ConnError::Io(io::ErrorKind::TimedOut.into())),
        };

        if n == 0 {
            return if self.buf.is_empty() {
                Err(ConnError::Disconnected)
            } else {
                Err(ConnError::UnexpectedEof)
            };
        }

        self.last_used = Instant::now();
        self.reuse_count += 1;
        Ok(())
    }

    /// Writes a full reply, honoring the write deadline.
    pub async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.last_used = Instant::now();
        let deadline = self.write_timeout;
        let stream = &mut self.stream;
        let fut = async move {
            stream.write_all(bytes).await?;
            stream.flush().await
        };
        match timeout(deadline, fut).await {
            Ok(res) => res,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        }
    }

    fn maybe_shrink(&mut self) {
        if self.reuse_count >= MAX_BUFFER_REUSE {
            if self.buf.capacity() > SHRINK_THRESHOLD {
                self.buf = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
            }
            self.reuse_count = 0;
        }
    }
}
