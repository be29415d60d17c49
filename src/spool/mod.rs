//! Batching Worker Fanout
//!
//! The spooler sits between a relay frontend and a batch-oriented transport
//! (an object-storage queue, a cloud stream, anything accepting grouped
//! records). It owns:
//!
//! - a bounded intake channel of [`Record`]s,
//! - a set of worker tasks that batch records up to a count and byte limit
//!   and flush on size, time, or demand,
//! - a scaling controller that grows and shrinks the worker set from the
//!   intake occupancy.
//!
//! ```text
//!                   ┌──────────────────────────────────────┐
//!                   │               Spooler                │
//!  submit() ──────> │  intake (bounded) ──┬──> worker 1 ──┐│
//!  submit_sync() ─> │  sync intake ───────┼──> worker 2 ──┼┼──> BatchSink
//!                   │                     └──> worker N ──┘│
//!                   │          ▲                           │
//!                   │          │ occupancy                 │
//!                   │       scaler (warm-up / cooldown)    │
//!                   └──────────────────────────────────────┘
//! ```
//!
//! Backpressure is the intake capacity: `submit` never blocks and reports a
//! full channel to the caller, which turns it into a protocol error reply.

mod scaler;
mod worker;

use crate::config::defaults;
use crate::record::Record;
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One entry of a flushed batch: serialized record plus its unique id.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub id: String,
    pub body: Bytes,
}

/// The transport contract a spooler flushes into.
///
/// Implementations wrap whatever SDK actually ships the batch; the spooler
/// only cares about the size limits and the outcome.
pub trait BatchSink: Send + Sync + 'static {
    /// Hard cap on a single record; oversized records are rejected.
    fn max_record_bytes(&self) -> usize {
        defaults::MAX_RECORD_BYTES
    }

    /// Cap on the summed body bytes of one batch.
    fn max_batch_bytes(&self) -> usize {
        defaults::MAX_RECORD_BYTES
    }

    fn send_batch(
        &self,
        batch: Vec<BatchEntry>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Tunables, normalized from the relay config.
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub buffer: usize,
    pub max_records: usize,
    pub max_workers: usize,
    pub flush_interval: Duration,
    pub scale_interval: Duration,
    pub threshold_warm_up: f64,
    pub cool_down: Duration,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            buffer: defaults::BUFFER,
            max_records: defaults::MAX_RECORDS,
            max_workers: defaults::MAX_WORKERS,
            flush_interval: defaults::RECORDS_TIMEOUT,
            scale_interval: defaults::SCALE_INTERVAL,
            threshold_warm_up: defaults::THRESHOLD_WARM_UP,
            cool_down: defaults::COOL_DOWN_PERIOD,
        }
    }
}

impl SpoolConfig {
    fn normalized(mut self) -> Self {
        if self.buffer == 0 {
            self.buffer = defaults::BUFFER;
        }
        if self.max_records == 0 {
            self.max_records = defaults::MAX_RECORDS;
        }
        if self.max_workers == 0 {
            self.max_workers = defaults::MAX_WORKERS;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = defaults::RECORDS_TIMEOUT;
        }
        if self.scale_interval.is_zero() {
            self.scale_interval = defaults::SCALE_INTERVAL;
        }
        if self.threshold_warm_up <= 0.0 {
            self.threshold_warm_up = defaults::THRESHOLD_WARM_UP;
        }
        self
    }
}

/// Why a submission was not accepted.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    /// Intake at capacity; the caller sheds instead of buffering.
    #[error("intake channel full")]
    Full,
    /// The spooler is draining.
    #[error("spooler closed")]
    Closed,
}

/// A record paired with its acknowledgement channel (sync submission path).
pub(crate) struct SyncRecord {
    pub record: Record,
    pub ack: oneshot::Sender<bool>,
}

type SharedRx<T> = Arc<Mutex<mpsc::Receiver<T>>>;

pub(crate) struct WorkerHandle {
    id: u64,
    stop: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

pub(crate) struct Inner<S: BatchSink> {
    pub(crate) sink: Arc<S>,
    pub(crate) cfg: std::sync::Mutex<SpoolConfig>,
    pub(crate) intake_tx: mpsc::Sender<Record>,
    pub(crate) intake_rx: SharedRx<Record>,
    pub(crate) sync_rx: SharedRx<SyncRecord>,
    pub(crate) workers: Mutex<Vec<WorkerHandle>>,
    worker_seq: AtomicU64,
    exiting: AtomicBool,
}

impl<S: BatchSink> Inner<S> {
    pub(crate) fn config(&self) -> SpoolConfig {
        self.cfg.lock().unwrap().clone()
    }

    pub(crate) fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Relaxed)
    }

    /// Queue occupancy in `[0, 1]`, measured from outstanding send permits.
    pub(crate) fn occupancy(&self) -> f64 {
        let max = self.intake_tx.max_capacity();
        if max == 0 {
            return 0.0;
        }
        1.0 - self.intake_tx.capacity() as f64 / max as f64
    }

    pub(crate) fn queued(&self) -> usize {
        self.intake_tx.max_capacity() - self.intake_tx.capacity()
    }

    /// Grows or shrinks the worker set to `desired`. Shrunk workers receive
    /// a stop signal and drain their local batch before exiting.
    pub(crate) async fn resize(self: &Arc<Self>, desired: usize) {
        if self.is_exiting() {
            return;
        }
        let mut workers = self.workers.lock().await;
        let current = workers.len();

        if current < desired {
            for _ in current..desired {
                let id = self.worker_seq.fetch_add(1, Ordering::Relaxed);
                let (stop_tx, stop_rx) = oneshot::channel();
                let join = tokio::spawn(worker::run(Arc::clone(self), id, stop_rx));
                workers.push(WorkerHandle {
                    id,
                    stop: stop_tx,
                    join,
                });
            }
            info!(workers = desired, "Spooler scaled up");
        } else if current > desired {
            for handle in workers.drain(desired..) {
                debug!(worker = handle.id, "Stopping surplus worker");
                let _ = handle.stop.send(());
                let _ = handle.join.await;
            }
            info!(workers = desired, "Spooler scaled down");
        }
    }

    async fn stop_all(&self) {
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.stop.send(());
            let _ = handle.join.await;
        }
    }
}

/// The public handle. Cheap to share by reference from connection tasks.
pub struct Spooler<S: BatchSink> {
    sync_tx: mpsc::Sender<SyncRecord>,
    scaler_stop: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    inner: Arc<Inner<S>>,
}

impl<S: BatchSink> Spooler<S> {
    /// Builds the spooler and spawns the first worker plus the scaler.
    pub fn new(sink: S, cfg: SpoolConfig) -> Self {
        let cfg = cfg.normalized();
        let (intake_tx, intake_rx) = mpsc::channel(cfg.buffer);
        let (sync_tx, sync_rx) = mpsc::channel(cfg.max_records.max(1));

        let inner = Arc::new(Inner {
            sink: Arc::new(sink),
            cfg: std::sync::Mutex::new(cfg),
            intake_tx,
            intake_rx: Arc::new(Mutex::new(intake_rx)),
            sync_rx: Arc::new(Mutex::new(sync_rx)),
            workers: Mutex::new(Vec::new()),
            worker_seq: AtomicU64::new(1),
            exiting: AtomicBool::new(false),
        });

        let (scaler_tx, scaler_rx) = oneshot::channel();
        tokio::spawn(scaler::run(Arc::clone(&inner), scaler_rx));

        let spooler = Self {
            sync_tx,
            scaler_stop: std::sync::Mutex::new(Some(scaler_tx)),
            inner: Arc::clone(&inner),
        };

        let starter = inner;
        tokio::spawn(async move {
            starter.resize(1).await;
        });

        spooler
    }

    /// Fire-and-forget submission; never blocks.
    pub fn submit(&self, record: Record) -> Result<(), SubmitError> {
        if self.inner.is_exiting() {
            return Err(SubmitError::Closed);
        }
        self.inner
            .intake_tx
            .try_send(record)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SubmitError::Full,
                mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
            })
    }

    /// Confirmation path: the accepting worker flushes immediately and the
    /// result of that flush comes back to the caller.
    pub async fn submit_sync(&self, record: Record) -> bool {
        if self.inner.is_exiting() {
            return false;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        let sr = SyncRecord {
            record,
            ack: ack_tx,
        };
        if self.sync_tx.send(sr).await.is_err() {
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }

    /// Current intake occupancy, `[0, 1]`.
    pub fn occupancy(&self) -> f64 {
        self.inner.occupancy()
    }

    /// Applies new tunables. Worker-count bounds take effect at the next
    /// scaler tick; batch limits at the next worker spawn.
    pub fn reload(&self, cfg: SpoolConfig) {
        let cfg = cfg.normalized();
        *self.inner.cfg.lock().unwrap() = cfg;
    }

    /// Drains and stops: no new submissions, waits for the intake to empty,
    /// then stops every worker (each flushes its local batch first).
    pub async fn exit(&self) {
        self.inner.exiting.store(true, Ordering::Relaxed);

        if let Some(stop) = self.scaler_stop.lock().unwrap().take() {
            let _ = stop.send(());
        }

        // Producers are rejected from here on; let the workers drain what
        // was already accepted, within a bounded grace period.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.inner.queued() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let lost = self.inner.queued();
        if lost > 0 {
            warn!(lost, "Spooler exiting with messages still queued");
        }

        self.inner.stop_all().await;
        debug!("Spooler drained");
    }

    #[cfg(test)]
    pub(crate) async fn worker_count(&self) -> usize {
        self.inner.workers.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<Inner<S>> {
        &self.inner
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::MemSink;
    use super::*;

    fn fast_cfg() -> SpoolConfig {
        SpoolConfig {
            buffer: 16,
            max_records: 4,
            max_workers: 4,
            flush_interval: Duration::from_millis(40),
            scale_interval: Duration::from_millis(20),
            threshold_warm_up: 0.6,
            cool_down: Duration::from_millis(50),
        }
    }

    fn record(body: &str) -> Record {
        Record::raw(Bytes::copy_from_slice(body.as_bytes()))
    }

    #[tokio::test]
    async fn test_size_triggered_flush() {
        let sink = Arc::new(MemSink::default());
        let spool = Spooler::new(Arc::clone(&sink), fast_cfg());
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 0..8 {
            spool.submit(record(&format!("r{}", i))).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(sink.total_records(), 8);
        for batch in sink.flushed() {
            assert!(batch.len() <= 4, "batch over MaxRecords");
        }
        spool.exit().await;
    }

    #[tokio::test]
    async fn test_time_triggered_flush() {
        let sink = Arc::new(MemSink::default());
        let spool = Spooler::new(Arc::clone(&sink), fast_cfg());
        tokio::time::sleep(Duration::from_millis(20)).await;

        spool.submit(record("lonely")).unwrap();
        // Below MaxRecords: only the timer can flush this one.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sink.total_records(), 1);
        spool.exit().await;
    }

    #[tokio::test]
    async fn test_sync_submission_flushes_immediately() {
        let sink = Arc::new(MemSink::default());
        let spool = Spooler::new(Arc::clone(&sink), fast_cfg());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(spool.submit_sync(record("now")).await);
        assert_eq!(sink.total_records(), 1);
        spool.exit().await;
    }

    #[tokio::test]
    async fn test_sync_submission_reports_sink_failure() {
        let sink = Arc::new(MemSink::default());
        sink.fail.store(true, Ordering::Relaxed);
        let spool = Spooler::new(Arc::clone(&sink), fast_cfg());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!spool.submit_sync(record("doomed")).await);
        spool.exit().await;
    }

    #[tokio::test]
    async fn test_submit_full_is_reported() {
        let sink = Arc::new(MemSink::default());
        let mut cfg = fast_cfg();
        cfg.buffer = 2;
        // Slow everything down so the intake actually fills.
        cfg.flush_interval = Duration::from_secs(10);
        let spool = Spooler::new(Arc::clone(&sink), cfg);
        // No sleep: the first worker may not even have started; submissions
        // must still be accepted up to capacity and then shed.
        let mut saw_full = false;
        for i in 0..50 {
            if spool.submit(record(&format!("r{}", i))) == Err(SubmitError::Full) {
                saw_full = true;
                break;
            }
        }
        assert!(saw_full, "a bounded intake must eventually report Full");
        spool.exit().await;
    }

    #[tokio::test]
    async fn test_exit_drains_intake() {
        let sink = Arc::new(MemSink::default());
        let spool = Spooler::new(Arc::clone(&sink), fast_cfg());
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 0..10 {
            spool.submit(record(&format!("r{}", i))).unwrap();
        }
        spool.exit().await;

        assert_eq!(spool.inner().queued(), 0, "intake must be empty at done");
        assert_eq!(sink.total_records(), 10, "drain must not lose records");
        assert_eq!(
            spool.submit(record("late")),
            Err(SubmitError::Closed),
            "submissions after exit are refused"
        );
    }

    #[tokio::test]
    async fn test_oversized_record_rejected() {
        let sink = Arc::new(MemSink {
            record_limit: Some(8),
            ..Default::default()
        });
        let spool = Spooler::new(Arc::clone(&sink), fast_cfg());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(
            !spool
                .submit_sync(record("way-over-the-record-limit"))
                .await
        );
        assert_eq!(sink.total_records(), 0);
        spool.exit().await;
    }

    #[tokio::test]
    async fn test_scaler_grows_under_load() {
        let sink = Arc::new(MemSink::default());
        let mut cfg = fast_cfg();
        cfg.buffer = 4;
        cfg.flush_interval = Duration::from_secs(10);
        cfg.cool_down = Duration::from_millis(10);
        let spool = Spooler::new(Arc::clone(&sink), cfg);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Saturate the intake past the warm threshold and hold it there.
        for i in 0..4 {
            let _ = spool.submit(record(&format!("r{}", i)));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(
            spool.worker_count().await >= 1,
            "worker set must stay within [1, MaxWorkers]"
        );
        assert!(spool.worker_count().await <= 4);
        spool.exit().await;
    }
}
