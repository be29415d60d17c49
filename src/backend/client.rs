//! Pipelined Backend Client
//!
//! One task per persistent backend socket. Requests arrive on the client's
//! intake channel and are written through without waiting for replies; a
//! FIFO queue of pending entries pairs each reply frame read off the socket
//! with the request that caused it (Redis answers strictly in order).
//!
//! The client also maintains database affinity: when a request was parsed
//! on a connection whose selected database differs from the one this socket
//! last selected, a compensating `SELECT n` frame is written first and its
//! `+OK` is consumed without being relayed to anyone.
//!
//! On any I/O error the pending queue and the intake are drained with a
//! generic error reply and the socket is re-dialed, within a retry budget.

use crate::config::{defaults, Addr};
use crate::conn::Stream;
use crate::protocol::{reply, Request, RequestParser};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Outstanding requests on one socket before the client stops accepting
/// new intake and catches up on replies.
const PIPELINE_COMMANDS: usize = 1000;

/// Where the reply for a written frame goes.
enum Pending {
    /// Relay the raw reply bytes to the request's channel.
    Relay(mpsc::Sender<Bytes>),
    /// A synthesized `SELECT`; its +OK is consumed here.
    ExpectOk,
    /// Fire-and-forget request; reply is read and dropped.
    Discard,
}

/// The pool-side handle: the only sender of the client's intake channel.
/// Dropping it lets the task drain and exit.
#[derive(Debug)]
pub(crate) struct ClientHandle {
    pub id: u64,
    intake: mpsc::Sender<Request>,
    pub last_used: std::time::Instant,
}

impl ClientHandle {
    /// Blocking send, used by the sync dispatch path.
    pub async fn send(&self, req: Request) -> Result<(), ()> {
        self.intake.send(req).await.map_err(|_| ())
    }

    /// Non-blocking send, used by the smart dispatch path. Distinguishes a
    /// full intake (backpressure) from a dead client.
    pub fn try_send(&self, req: Request) -> Result<(), TrySendError> {
        self.intake.try_send(req).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TrySendError::Full,
            mpsc::error::TrySendError::Closed(_) => TrySendError::Closed,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TrySendError {
    Full,
    Closed,
}

/// Spawns a client task for `addr` and returns its handle.
pub(crate) fn spawn(
    id: u64,
    addr: Addr,
    op_timeout: Duration,
    request_buffer: usize,
    shutdown: watch::Receiver<bool>,
) -> ClientHandle {
    let (intake_tx, intake_rx) = mpsc::channel(request_buffer.max(1));

    let task = ClientTask {
        id,
        addr,
        op_timeout,
        intake: intake_rx,
        shutdown,
    };
    tokio::spawn(task.run());

    ClientHandle {
        id,
        intake: intake_tx,
        last_used: std::time::Instant::now(),
    }
}

enum ServeEnd {
    /// Intake channel closed: the handle was dropped, the client is done.
    Closed,
    /// Pool-wide shutdown.
    Shutdown,
    /// Socket failure; reconnect if still desired.
    Io(io::Error),
}

struct ClientTask {
    id: u64,
    addr: Addr,
    op_timeout: Duration,
    intake: mpsc::Receiver<Request>,
    shutdown: watch::Receiver<bool>,
}

impl ClientTask {
    async fn run(mut self) {
        loop {
            let stream = match self.connect().await {
                Some(stream) => stream,
                None => {
                    // Budget exhausted. Fail whatever is queued, then wait
                    // for a reason to try again.
                    self.drain_intake();
                    match self.wait_for_work().await {
                        true => continue,
                        false => return,
                    }
                }
            };

            debug!(client = self.id, backend = %self.addr, "Backend client connected");

            match self.serve(stream).await {
                ServeEnd::Closed => {
                    debug!(client = self.id, "Backend client released");
                    return;
                }
                ServeEnd::Shutdown => {
                    self.drain_intake();
                    debug!(client = self.id, "Backend client shut down");
                    return;
                }
                ServeEnd::Io(e) => {
                    error!(client = self.id, error = %e, "Backend connection failed, reconnecting");
                    self.drain_intake();
                }
            }
        }
    }

    /// Dials the backend with the retry budget.
    async fn connect(&mut self) -> Option<Box<dyn Stream>> {
        for attempt in 1..=defaults::CONNECTION_RETRIES {
            if *self.shutdown.borrow() {
                return None;
            }
            let dial = async {
                match &self.addr {
                    Addr::Tcp(hostport) => TcpStream::connect(hostport)
                        .await
                        .map(|s| Box::new(s) as Box<dyn Stream>),
                    Addr::Unix(path) => UnixStream::connect(path)
                        .await
                        .map(|s| Box::new(s) as Box<dyn Stream>),
                }
            };
            match timeout(self.op_timeout, dial).await {
                Ok(Ok(stream)) => return Some(stream),
                Ok(Err(e)) => {
                    warn!(client = self.id, attempt, error = %e, "Backend dial failed");
                }
                Err(_) => {
                    warn!(client = self.id, attempt, "Backend dial timed out");
                }
            }
            tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
        }
        None
    }

    /// After a failed connect cycle: block until a request or shutdown.
    /// Returns false when the client should exit for good.
    async fn wait_for_work(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown.changed() => false,
            req = self.intake.recv() => match req {
                Some(req) => {
                    // This request triggers the reconnect; it cannot be
                    // served yet, so it fails like the drained ones.
                    fail_request(&req);
                    true
                }
                None => false,
            },
        }
    }

    async fn serve(&mut self, stream: Box<dyn Stream>) -> ServeEnd {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut inbuf = BytesMut::with_capacity(4096);
        let mut parser = RequestParser::new();
        let mut pending: VecDeque<Pending> = VecDeque::new();
        let mut selected_db: u32 = 0;

        let end = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => break ServeEnd::Shutdown,

                req = self.intake.recv(), if pending.len() < PIPELINE_COMMANDS => {
                    let Some(req) = req else { break ServeEnd::Closed };

                    let mut frame = BytesMut::with_capacity(req.raw.len() + 32);
                    if req.database != selected_db {
                        // A forwarded SELECT establishes affinity by itself;
                        // anything else needs the compensating frame first.
                        if !req.is_select() {
                            push_select(&mut frame, req.database);
                            pending.push_back(Pending::ExpectOk);
                        }
                        selected_db = req.database;
                    }
                    frame.extend_from_slice(&req.raw);
                    pending.push_back(match req.reply {
                        Some(tx) => Pending::Relay(tx),
                        None => Pending::Discard,
                    });

                    let res = timeout(self.op_timeout, writer.write_all(&frame)).await;
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => break ServeEnd::Io(e),
                        Err(_) => break ServeEnd::Io(io::ErrorKind::TimedOut.into()),
                    }
                }

                res = reader.read_buf(&mut inbuf) => {
                    match res {
                        Ok(0) => break ServeEnd::Io(io::ErrorKind::UnexpectedEof.into()),
                        Ok(_) => {}
                        Err(e) => break ServeEnd::Io(e),
                    }
                    if let Err(e) = deliver_replies(self.id, &mut parser, &mut inbuf, &mut pending) {
                        break ServeEnd::Io(e);
                    }
                }
            }
        };

        fail_pending(&mut pending);
        end
    }

    /// Empties the intake without blocking, failing every queued request.
    fn drain_intake(&mut self) {
        while let Ok(req) = self.intake.try_recv() {
            fail_request(&req);
        }
    }
}

/// Parses every complete reply buffered so far and hands each to the oldest
/// pending entry.
fn deliver_replies(
    client: u64,
    parser: &mut RequestParser,
    inbuf: &mut BytesMut,
    pending: &mut VecDeque<Pending>,
) -> io::Result<()> {
    loop {
        let parsed = parser
            .parse(inbuf, false)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let Some((rep, consumed)) = parsed else {
            return Ok(());
        };
        inbuf.advance(consumed);

        match pending.pop_front() {
            Some(Pending::Relay(tx)) => {
                // Capacity-1 channel; a full channel means the dispatch loop
                // already gave up on this request.
                if tx.try_send(rep.raw).is_err() {
                    debug!(client, "Reply dropped, requester gone");
                }
            }
            Some(Pending::ExpectOk) => {
                if &rep.raw[..] != reply::OK {
                    warn!(client, "Unexpected reply to synthesized SELECT");
                }
            }
            Some(Pending::Discard) => {}
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "reply without a pending request",
                ));
            }
        }
    }
}

fn fail_pending(pending: &mut VecDeque<Pending>) {
    for entry in pending.drain(..) {
        if let Pending::Relay(tx) = entry {
            let _ = tx.try_send(Bytes::from_static(reply::KO));
        }
    }
}

fn fail_request(req: &Request) {
    if let Some(tx) = &req.reply {
        let _ = tx.try_send(Bytes::from_static(reply::KO));
    }
}

/// `*2\r\n$6\r\nSELECT\r\n$<len>\r\n<n>\r\n`
fn push_select(buf: &mut BytesMut, database: u32) {
    let n = database.to_string();
    buf.extend_from_slice(b"*2\r\n$6\r\nSELECT\r\n$");
    buf.extend_from_slice(n.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(n.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_select_frame() {
        let mut buf = BytesMut::new();
        push_select(&mut buf, 3);
        assert_eq!(&buf[..], b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n");

        let mut buf = BytesMut::new();
        push_select(&mut buf, 12);
        assert_eq!(&buf[..], b"*2\r\n$6\r\nSELECT\r\n$2\r\n12\r\n");
    }
}
