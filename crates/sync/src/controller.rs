//! The worker loop: block on the queue, sync, apply the retry policy.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use metrics::{counter, histogram};
use onion_queue::WorkQueue;
use tracing::{debug, error, warn};

use crate::{DaemonControl, StatusSink, Syncer};

pub struct Controller<D, S> {
    queue: Arc<WorkQueue>,
    syncer: Syncer<D, S>,
    max_retries: u32,
}

impl<D: DaemonControl, S: StatusSink> Controller<D, S> {
    pub fn new(queue: Arc<WorkQueue>, syncer: Syncer<D, S>, max_retries: u32) -> Self {
        Self { queue, syncer, max_retries }
    }

    /// Process keys until the queue shuts down. The current item is
    /// always finished before exiting; cancellation never aborts a sync
    /// pass midway.
    pub async fn run_worker(&self) {
        while let Some(key) = self.queue.get().await {
            let started = Instant::now();
            let res = self.syncer.sync(&key).await;
            histogram!("sync_duration_ms", started.elapsed().as_secs_f64() * 1000.0);
            counter!("sync_total", 1u64);
            self.observe(&key, res);
            self.queue.done(&key);
        }
        debug!("worker exiting");
    }

    fn observe(&self, key: &str, res: Result<()>) {
        match res {
            Ok(()) => self.queue.forget(key),
            Err(e) => {
                counter!("sync_errors_total", 1u64);
                if self.queue.num_requeues(key) < self.max_retries {
                    warn!(key, error = ?e, "sync failed; will retry with backoff");
                    self.queue.add_rate_limited(key);
                } else {
                    // Retry ceiling reached: drop the key. It will only be
                    // processed again on the next external notification.
                    self.queue.forget(key);
                    counter!("sync_dropped_total", 1u64);
                    error!(key, error = ?e, "dropping key after repeated sync failures");
                }
            }
        }
    }
}
