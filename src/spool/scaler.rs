//! Elastic Worker Scaling
//!
//! Watches the intake occupancy on a fixed interval and nudges the worker
//! count by one in the warm direction, clamped to `[1, MaxWorkers]` and
//! rate-limited by a cooldown so a transient burst does not thrash the set.

use super::{BatchSink, Inner};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{interval, Instant};
use tracing::{debug, trace};

pub(crate) async fn run<S: BatchSink>(inner: Arc<Inner<S>>, mut stop: oneshot::Receiver<()>) {
    let mut ticker = {
        let cfg = inner.config();
        interval(cfg.scale_interval)
    };
    // Allow an immediate first adjustment after startup.
    let mut last_change = Instant::now()
        .checked_sub(inner.config().cool_down)
        .unwrap_or_else(Instant::now);

    loop {
        tokio::select! {
            _ = &mut stop => {
                debug!("Scaler stopped");
                return;
            }
            _ = ticker.tick() => {
                if inner.is_exiting() {
                    return;
                }

                let cfg = inner.config();
                let occupancy = inner.occupancy();
                let warm = occupancy > cfg.threshold_warm_up;

                let current = inner.workers.lock().await.len();
                let desired = if warm {
                    (current + 1).min(cfg.max_workers)
                } else {
                    current.saturating_sub(1).max(1)
                };

                trace!(occupancy, current, desired, "Scaler tick");

                if desired != current && last_change.elapsed() >= cfg.cool_down {
                    debug!(occupancy, from = current, to = desired, "Scaling workers");
                    inner.resize(desired).await;
                    last_change = Instant::now();
                }
            }
        }
    }
}
