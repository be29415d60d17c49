//! Batch Worker
//!
//! One worker owns a local batch and a flush timer. Records arrive from the
//! shared intake; the batch flushes when it reaches the record count, when
//! the next record would push it over the byte limit, when the timer fires,
//! or on demand (sync submissions and stop).

use super::{BatchEntry, BatchSink, Inner, SyncRecord};
use crate::record::Record;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, trace};

pub(crate) async fn run<S: BatchSink>(
    inner: Arc<Inner<S>>,
    id: u64,
    mut stop: oneshot::Receiver<()>,
) {
    let cfg = inner.config();
    let mut batch = Batch::new(id, inner.sink.clone(), cfg.max_records);
    let mut deadline = Instant::now() + cfg.flush_interval;

    debug!(worker = id, "Spool worker ready");

    loop {
        tokio::select! {
            biased;

            _ = &mut stop => {
                batch.flush().await;
                debug!(worker = id, "Spool worker stopped");
                return;
            }

            sr = recv(&inner.sync_rx) => {
                let Some(SyncRecord { record, ack }) = sr else {
                    batch.flush().await;
                    return;
                };
                if record.is_empty() {
                    let _ = ack.send(false);
                    continue;
                }
                let ok = match batch.append(&record) {
                    Ok(()) => batch.flush().await,
                    Err(()) => false,
                };
                let _ = ack.send(ok);
                deadline = Instant::now() + cfg.flush_interval;
            }

            r = recv(&inner.intake_rx) => {
                let Some(record) = r else {
                    batch.flush().await;
                    return;
                };
                if record.is_empty() {
                    continue;
                }
                if batch.len() + 1 >= cfg.max_records || batch.would_overflow(&record) {
                    batch.flush().await;
                    deadline = Instant::now() + cfg.flush_interval;
                }
                if batch.append(&record).is_err() {
                    error!(worker = id, bytes = record.len(), "Record over size limit, dropped");
                }
            }

            _ = sleep_until(deadline) => {
                batch.flush().await;
                deadline = Instant::now() + cfg.flush_interval;
            }
        }
    }
}

async fn recv<T>(shared: &Arc<Mutex<mpsc::Receiver<T>>>) -> Option<T> {
    shared.lock().await.recv().await
}

struct Batch<S: BatchSink> {
    worker: u64,
    sink: Arc<S>,
    max_records: usize,
    entries: Vec<BatchEntry>,
    bytes: usize,
}

impl<S: BatchSink> Batch<S> {
    fn new(worker: u64, sink: Arc<S>, max_records: usize) -> Self {
        Self {
            worker,
            sink,
            max_records,
            entries: Vec::with_capacity(max_records),
            bytes: 0,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn would_overflow(&self, record: &Record) -> bool {
        self.bytes + record.len() > self.sink.max_batch_bytes()
    }

    fn append(&mut self, record: &Record) -> Result<(), ()> {
        let (body, id) = record.bytes_uniq_id();
        if body.len() > self.sink.max_record_bytes() {
            return Err(());
        }
        self.bytes += body.len();
        self.entries.push(BatchEntry { id, body });
        Ok(())
    }

    /// Ships the batch; true on success. An empty batch is a no-op success.
    async fn flush(&mut self) -> bool {
        if self.entries.is_empty() {
            return true;
        }

        let entries = std::mem::replace(&mut self.entries, Vec::with_capacity(self.max_records));
        let count = entries.len();
        let bytes = self.bytes;
        self.bytes = 0;

        match self.sink.send_batch(entries).await {
            Ok(()) => {
                trace!(worker = self.worker, records = count, bytes, "Batch flushed");
                true
            }
            Err(e) => {
                error!(worker = self.worker, records = count, error = %e, "Batch flush failed");
                false
            }
        }
    }
}
