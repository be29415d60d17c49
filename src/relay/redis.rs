//! Redis Relay
//!
//! The client-facing frontend for a Redis backend. Accepts RESP connections
//! on the configured listener and runs one dispatch loop per connection.
//!
//! ## Dispatch
//!
//! Each loop leases one pooled backend client for the lifetime of its
//! connection (per-connection ordering rides on that) and branches on the
//! relay mode:
//!
//! - **smart**: commands in the fast-ack table get their canned reply
//!   written immediately, then the request is forwarded with a non-blocking
//!   send. A full intake sheds the connection; buffering unboundedly is
//!   never an option. Anything not in the table falls through to sync.
//! - **sync**: the request carries the connection's reusable capacity-1
//!   reply channel, the loop forwards (blocking) and waits for the backend
//!   reply, bounded by the response timeout. On timeout the connection is
//!   closed so a late reply can never reach the next request.
//!
//! `QUIT` answers `+OK` and closes. `SELECT` dispatches like any other
//! fast-ack command: the parser tracks the database index per connection
//! and the frame is forwarded, with the backend client emitting a
//! compensating `SELECT` only when a pooled socket's selected database has
//! drifted from the request's.

use crate::backend::client::{ClientHandle, TrySendError};
use crate::backend::pool::{Pool, PoolConfig};
use crate::config::{defaults, Mode, RelayerConfig};
use crate::conn::{Conn, ConnError};
use crate::listener::Listener;
use crate::protocol::{fast_ack_reply, reply, RequestParser};
use crate::relay::DoneSignal;
use anyhow::Result;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub struct RedisRelay {
    inner: Arc<Inner>,
}

struct Inner {
    config: RwLock<Arc<RelayerConfig>>,
    pool: Pool,
    exiting: AtomicBool,
    shutdown: watch::Sender<bool>,
    done: DoneSignal,
    bound: Mutex<Option<SocketAddr>>,
}

impl Inner {
    fn config(&self) -> Arc<RelayerConfig> {
        Arc::clone(&self.config.read().unwrap())
    }
}

fn pool_config(cfg: &RelayerConfig) -> PoolConfig {
    PoolConfig {
        addr: cfg.backend_addr(),
        max_connections: cfg.max_connections,
        max_idle_connections: cfg.max_idle_connections,
        request_buffer: cfg.buffer,
        op_timeout: cfg.op_timeout(),
        max_idle: defaults::MAX_IDLE,
    }
    .normalized()
}

impl RedisRelay {
    pub fn new(cfg: RelayerConfig, done: mpsc::Sender<()>) -> Self {
        let pool = Pool::new(pool_config(&cfg));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(Arc::new(cfg)),
                pool,
                exiting: AtomicBool::new(false),
                shutdown,
                done: DoneSignal::new(done),
                bound: Mutex::new(None),
            }),
        }
    }

    /// Binds the listener and starts accepting.
    pub async fn start(&self) -> Result<()> {
        let cfg = self.inner.config();
        let listener = Listener::bind(&cfg.listen_addr()).await?;
        *self.inner.bound.lock().unwrap() = listener.local_addr();

        info!(listen = %cfg.listen, backend = %cfg.url, "Starting redis relay");

        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    res = listener.accept() => match res {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "Accepted connection");
                            let inner = Arc::clone(&inner);
                            tokio::spawn(serve_client(inner, stream));
                        }
                        Err(e) => {
                            if inner.exiting.load(Ordering::Relaxed) {
                                break;
                            }
                            warn!(error = %e, "Accept failed");
                        }
                    },
                }
            }
            debug!("Redis relay listener closed");
        });

        Ok(())
    }

    /// Applies a new configuration. A backend URL change tears the pool
    /// down and rebuilds it; anything else adjusts the pool in place.
    pub fn reload(&self, cfg: RelayerConfig) {
        let previous = self.inner.config();
        if !previous.url.is_empty() && previous.url != cfg.url {
            info!(listen = %cfg.listen, backend = %cfg.url, "Reload with backend reset");
            self.inner.pool.reset(pool_config(&cfg));
        } else {
            info!(listen = %cfg.listen, "Reload");
            self.inner.pool.reload(pool_config(&cfg));
        }
        *self.inner.config.write().unwrap() = Arc::new(cfg);
    }

    /// Stops accepting, tears down the pool, signals done.
    pub fn exit(&self) {
        self.inner.exiting.store(true, Ordering::Relaxed);
        let _ = self.inner.shutdown.send(true);
        self.inner.pool.exit();
        self.inner.done.fire();
    }

    /// Bound TCP address, once started (used by tests binding port 0).
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound.lock().unwrap()
    }
}

/// The per-connection dispatch loop.
async fn serve_client(inner: Arc<Inner>, stream: Box<dyn crate::conn::Stream>) {
    let mut conn = Conn::new(
        stream,
        defaults::LOCAL_READ_TIMEOUT,
        defaults::WRITE_TIMEOUT,
    );

    let lease = match inner.pool.get().await {
        Ok(lease) => lease,
        Err(e) => {
            warn!(error = %e, "Redis relay, no clients available from pool");
            return;
        }
    };

    // Reused for every sync request on this connection. Capacity 1: the loop
    // never has more than one outstanding reply, and a timeout closes the
    // connection before the channel could be reused by a later request.
    let (reply_tx, reply_rx) = mpsc::channel::<Bytes>(1);

    let mut session = Session {
        inner: &inner,
        conn: &mut conn,
        lease: &lease,
        reply_tx,
        reply_rx,
    };

    if let Err(e) = session.run().await {
        debug!(error = %e, "Connection closed");
    }

    inner.pool.put(lease);
}

struct Session<'a> {
    inner: &'a Arc<Inner>,
    conn: &'a mut Conn,
    lease: &'a ClientHandle,
    reply_tx: mpsc::Sender<Bytes>,
    reply_rx: mpsc::Receiver<Bytes>,
}

impl Session<'_> {
    async fn run(&mut self) -> Result<(), ConnError> {
        let mut parser = RequestParser::new();

        loop {
            let mut req = match self.conn.next_request(&mut parser, true).await {
                Ok(req) => req,
                Err(ConnError::Disconnected) => return Ok(()),
                Err(e) => return Err(e),
            };

            if req.is_quit() {
                let _ = self.conn.write(reply::OK).await;
                return Ok(());
            }

            if self.inner.exiting.load(Ordering::Relaxed) {
                let _ = self.conn.write(reply::CLOSING).await;
                return Ok(());
            }

            let cfg = self.inner.config();

            if cfg.mode == Mode::Smart {
                if let Some(fast) = fast_ack_reply(&req.command) {
                    // The canned reply goes out before the backend has seen
                    // anything; local latency stays constant.
                    self.conn.write(fast).await?;
                    match self.lease.try_send(req) {
                        Ok(()) => continue,
                        Err(TrySendError::Full) => {
                            warn!("Backend intake full, shedding connection");
                            return Ok(());
                        }
                        Err(TrySendError::Closed) => {
                            warn!("Backend client gone, closing connection");
                            return Ok(());
                        }
                    }
                }
            }

            // Sync path: install the reusable reply channel and wait.
            req.reply = Some(self.reply_tx.clone());
            if self.lease.send(req).await.is_err() {
                let _ = self.conn.write(reply::KO).await;
                return Ok(());
            }

            match timeout(cfg.response_timeout(), self.reply_rx.recv()).await {
                Ok(Some(bytes)) => self.conn.write(&bytes).await?,
                Ok(None) => return Ok(()),
                Err(_) => {
                    warn!("Timeout waiting a response, closing client connection");
                    let _ = self.conn.write(reply::KO).await;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// A scripted backend: parses request frames off its socket, records
    /// their raw bytes, and answers like a compliant Redis.
    struct FakeBackend {
        addr: SocketAddr,
        frames: Arc<StdMutex<Vec<Bytes>>>,
    }

    impl FakeBackend {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let frames: Arc<StdMutex<Vec<Bytes>>> = Arc::new(StdMutex::new(Vec::new()));

            let recorded = Arc::clone(&frames);
            tokio::spawn(async move {
                loop {
                    let Ok((mut socket, _)) = listener.accept().await else {
                        return;
                    };
                    let recorded = Arc::clone(&recorded);
                    tokio::spawn(async move {
                        let mut parser = RequestParser::new();
                        let mut buf = bytes::BytesMut::with_capacity(4096);
                        loop {
                            while let Ok(Some((req, n))) = parser.parse(&buf, true) {
                                bytes::Buf::advance(&mut buf, n);
                                recorded.lock().unwrap().push(req.raw.clone());
                                let answer: &[u8] = match &req.command[..] {
                                    b"SELECT" | b"SET" => b"+OK\r\n",
                                    b"PING" => b"+PONG\r\n",
                                    b"GET" => b"$1\r\nv\r\n",
                                    b"DEL" => b":1\r\n",
                                    _ => b"-ERR unknown\r\n",
                                };
                                if socket.write_all(answer).await.is_err() {
                                    return;
                                }
                            }
                            match socket.read_buf(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(_) => {}
                            }
                        }
                    });
                }
            });

            Self { addr, frames }
        }

        fn frames(&self) -> Vec<Bytes> {
            self.frames.lock().unwrap().clone()
        }
    }

    async fn start_relay(backend: &FakeBackend, mode: Mode) -> (RedisRelay, SocketAddr) {
        let cfg = RelayerConfig {
            listen: "127.0.0.1:0".to_string(),
            url: backend.addr.to_string(),
            protocol: Protocol::Redis,
            mode,
            ..Default::default()
        };
        let (done_tx, _done_rx) = mpsc::channel(1);
        let relay = RedisRelay::new(cfg, done_tx);
        relay.start().await.unwrap();
        let addr = relay.bound_addr().unwrap();
        (relay, addr)
    }

    async fn read_reply(client: &mut TcpStream) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("reply timeout")
            .unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn test_sync_passthrough() {
        let backend = FakeBackend::start().await;
        let (_relay, addr) = start_relay(&backend, Mode::Sync).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
            .await
            .unwrap();

        assert_eq!(read_reply(&mut client).await, b"$1\r\nv\r\n");
    }

    #[tokio::test]
    async fn test_smart_ack_before_backend() {
        let backend = FakeBackend::start().await;
        let (_relay, addr) = start_relay(&backend, Mode::Smart).await;

        let frame = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n";
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(frame).await.unwrap();

        assert_eq!(read_reply(&mut client).await, b"+OK\r\n");

        // The backend eventually receives the identical frame.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if backend.frames().iter().any(|f| &f[..] == &frame[..]) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "frame never forwarded");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_select_affinity() {
        let backend = FakeBackend::start().await;
        let (_relay, addr) = start_relay(&backend, Mode::Sync).await;

        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n")
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, b"+OK\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n")
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, b"$1\r\nv\r\n");

        // Backend sees the forwarded SELECT 3 first, then the GET; the
        // pooled socket's affinity came from the SELECT itself, so no
        // compensating frame appears in between.
        let frames = backend.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n");
        assert_eq!(&frames[1][..], b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n");
    }

    #[tokio::test]
    async fn test_select_affinity_on_reused_client() {
        // Two client connections sharing one pooled backend socket: the
        // second one never sends SELECT, so the compensating frame is what
        // moves the socket back to database 0.
        let backend = FakeBackend::start().await;
        let cfg = RelayerConfig {
            listen: "127.0.0.1:0".to_string(),
            url: backend.addr.to_string(),
            mode: Mode::Sync,
            max_connections: 1,
            ..Default::default()
        };
        let (done_tx, _done_rx) = mpsc::channel(1);
        let relay = RedisRelay::new(cfg, done_tx);
        relay.start().await.unwrap();
        let addr = relay.bound_addr().unwrap();

        {
            let mut first = TcpStream::connect(addr).await.unwrap();
            first
                .write_all(b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n")
                .await
                .unwrap();
            assert_eq!(read_reply(&mut first).await, b"+OK\r\n");
        }
        // Give the relay time to return the lease to the pool.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        second
            .write_all(b"*2\r\n$3\r\nGET\r\n$1\r\ny\r\n")
            .await
            .unwrap();
        assert_eq!(read_reply(&mut second).await, b"$1\r\nv\r\n");

        let frames = backend.frames();
        assert_eq!(&frames[0][..], b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n");
        // The second connection is on database 0, so the reused socket gets
        // a synthesized SELECT 0 before its GET.
        assert_eq!(&frames[1][..], b"*2\r\n$6\r\nSELECT\r\n$1\r\n0\r\n");
        assert_eq!(&frames[2][..], b"*2\r\n$3\r\nGET\r\n$1\r\ny\r\n");
    }

    #[tokio::test]
    async fn test_quit() {
        let backend = FakeBackend::start().await;
        let (_relay, addr) = start_relay(&backend, Mode::Sync).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"*1\r\n$4\r\nQUIT\r\n").await.unwrap();

        assert_eq!(read_reply(&mut client).await, b"+OK\r\n");
        // Relay closes its side.
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("close timeout")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_ping_smart() {
        let backend = FakeBackend::start().await;
        let (_relay, addr) = start_relay(&backend, Mode::Smart).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_smart_select_fast_acked_and_forwarded() {
        // SELECT rides the fast-ack table like SET: canned +OK locally,
        // frame forwarded to the backend.
        let backend = FakeBackend::start().await;
        let (_relay, addr) = start_relay(&backend, Mode::Smart).await;

        let frame = b"*2\r\n$6\r\nSELECT\r\n$1\r\n2\r\n";
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(frame).await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"+OK\r\n");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if backend.frames().iter().any(|f| &f[..] == &frame[..]) {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "SELECT never forwarded"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_sync_select_times_out_on_silent_backend() {
        // A backend that accepts and reads but never replies: a sync-mode
        // SELECT must hit the response timeout and close like any other
        // sync command, not get acknowledged locally.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = silent.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = silent.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                    }
                });
            }
        });

        let cfg = RelayerConfig {
            listen: "127.0.0.1:0".to_string(),
            url: backend_addr.to_string(),
            mode: Mode::Sync,
            response_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let (done_tx, _done_rx) = mpsc::channel(1);
        let relay = RedisRelay::new(cfg, done_tx);
        relay.start().await.unwrap();
        let addr = relay.bound_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n")
            .await
            .unwrap();

        assert_eq!(read_reply(&mut client).await, b"-Error\r\n");

        // And the relay closes the connection after the timeout.
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("close timeout")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_smart_select_sheds_on_full_intake() {
        // Nothing listening at the backend address: the client task burns
        // its dial budget without consuming its intake. With a capacity-1
        // intake the second SELECT hits the full channel and the relay
        // sheds the connection (the canned reply was already written).
        let backend_addr = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap()
        };

        let cfg = RelayerConfig {
            listen: "127.0.0.1:0".to_string(),
            url: backend_addr.to_string(),
            mode: Mode::Smart,
            buffer: 1,
            ..Default::default()
        };
        let (done_tx, _done_rx) = mpsc::channel(1);
        let relay = RedisRelay::new(cfg, done_tx);
        relay.start().await.unwrap();
        let addr = relay.bound_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"*2\r\n$6\r\nSELECT\r\n$1\r\n1\r\n*2\r\n$6\r\nSELECT\r\n$1\r\n2\r\n")
            .await
            .unwrap();

        // Both fast-acks go out (the reply precedes the forward), then the
        // connection closes on the full intake.
        let mut collected = Vec::new();
        loop {
            let mut buf = [0u8; 64];
            let n = timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .expect("read timeout")
                .unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&collected[..], b"+OK\r\n+OK\r\n");
    }

    #[tokio::test]
    async fn test_per_connection_reply_order() {
        let backend = FakeBackend::start().await;
        let (_relay, addr) = start_relay(&backend, Mode::Sync).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Pipelined: replies must come back in request order.
        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n*2\r\n$3\r\nDEL\r\n$1\r\nb\r\n")
            .await
            .unwrap();

        let mut collected = Vec::new();
        while collected.len() < 11 {
            let chunk = read_reply(&mut client).await;
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(&collected[..], b"$1\r\nv\r\n:1\r\n");
    }

    #[tokio::test]
    async fn test_exit_signals_done_once() {
        let backend = FakeBackend::start().await;
        let cfg = RelayerConfig {
            listen: "127.0.0.1:0".to_string(),
            url: backend.addr.to_string(),
            mode: Mode::Sync,
            ..Default::default()
        };
        let (done_tx, mut done_rx) = mpsc::channel(2);
        let relay = RedisRelay::new(cfg, done_tx);
        relay.start().await.unwrap();
        let addr = relay.bound_addr().unwrap();

        relay.exit();
        relay.exit();

        assert!(done_rx.recv().await.is_some());
        assert!(done_rx.try_recv().is_err());

        // Listener no longer accepts.
        tokio::time::sleep(Duration::from_millis(50)).await;
        match TcpStream::connect(addr).await {
            Err(_) => {}
            Ok(mut s) => {
                // Accept loop is gone; the connection must be unusable.
                let _ = s.write_all(b"*1\r\n$4\r\nPING\r\n").await;
                let mut buf = [0u8; 8];
                let n = timeout(Duration::from_secs(1), s.read(&mut buf))
                    .await
                    .unwrap_or(Ok(0))
                    .unwrap_or(0);
                assert_eq!(n, 0);
            }
        }
    }
}
