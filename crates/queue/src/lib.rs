//! Deduplicating retry queue for controller keys.
//!
//! Pending keys form a set: adding a key that is already pending is a
//! no-op, and a key being processed is parked rather than handed to a
//! second worker. Re-adds during processing mark the key dirty so it
//! comes back once `done` is called. Failed keys are re-enqueued through
//! a per-key exponential rate limiter.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    base: Duration,
    max: Duration,
}

impl RateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        // 2^32 overflows Duration math long before the cap matters.
        let exp = failures.min(32);
        self.base
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
            .min(self.max)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

#[derive(Default)]
struct Inner {
    /// Keys ready to be handed to a worker, FIFO.
    queue: VecDeque<String>,
    /// Keys that need processing: everything queued plus keys re-added
    /// while in flight.
    dirty: FxHashSet<String>,
    /// Keys currently held by a worker.
    processing: FxHashSet<String>,
    /// Failure counts feeding the rate limiter.
    requeues: FxHashMap<String, u32>,
    shut_down: bool,
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    limiter: RateLimiter,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Self::with_rate_limiter(RateLimiter::default())
    }

    pub fn with_rate_limiter(limiter: RateLimiter) -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(Inner::default()), notify: Notify::new(), limiter })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning would mean a panic while holding the guard; the
        // queue holds no invariant worth salvaging past that.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert `key` if it is not already pending. While the key is being
    /// processed it is only marked dirty; `done` re-queues it.
    pub fn add(&self, key: &str) {
        let mut q = self.lock();
        if q.shut_down || q.dirty.contains(key) {
            return;
        }
        q.dirty.insert(key.to_string());
        if q.processing.contains(key) {
            trace!(key, "re-added while in flight");
            return;
        }
        q.queue.push_back(key.to_string());
        drop(q);
        self.notify.notify_one();
    }

    /// Schedule an `add` after `delay`. Used by the watcher to debounce
    /// notification bursts: timers may fire several times but the adds
    /// collapse into one pending key.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if self.lock().shut_down {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Re-enqueue with a delay derived from the key's failure count, then
    /// bump the count.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut q = self.lock();
            if q.shut_down {
                return;
            }
            let failures = q.requeues.entry(key.to_string()).or_insert(0);
            let delay = self.limiter.delay_for(*failures);
            *failures += 1;
            delay
        };
        debug!(key, delay_ms = delay.as_millis() as u64, "requeueing with backoff");
        self.add_after(key, delay);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().requeues.get(key).copied().unwrap_or(0)
    }

    /// Drop the key's backoff history.
    pub fn forget(&self, key: &str) {
        self.lock().requeues.remove(key);
    }

    /// Block until a key is available and mark it in flight. Returns
    /// `None` once the queue has been shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            {
                let mut q = self.lock();
                if q.shut_down {
                    return None;
                }
                if let Some(key) = q.queue.pop_front() {
                    q.dirty.remove(&key);
                    q.processing.insert(key.clone());
                    let more = !q.queue.is_empty();
                    drop(q);
                    if more {
                        // Notify stores a single permit; keep waking
                        // siblings while work remains.
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release the in-flight mark. If the key was re-added while it was
    /// being processed, it becomes available again.
    pub fn done(&self, key: &str) {
        let mut q = self.lock();
        q.processing.remove(key);
        if q.dirty.contains(key) && !q.shut_down {
            q.queue.push_back(key.to_string());
            drop(q);
            self.notify.notify_one();
        }
    }

    /// After shutdown `get` returns `None` immediately and adds become
    /// no-ops. Workers finish their current item and exit.
    pub fn shut_down(&self) {
        {
            let mut q = self.lock();
            q.shut_down = true;
            q.queue.clear();
        }
        self.notify.notify_waiters();
        // Wake a getter that raced its registration past notify_waiters.
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn add_deduplicates_pending_keys() {
        let q = WorkQueue::new();
        q.add("ns/a");
        q.add("ns/a");
        q.add("ns/a");
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("ns/a"));
        q.done("ns/a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn get_blocks_until_add() {
        let q = WorkQueue::new();
        let q2 = Arc::clone(&q);
        let getter = tokio::spawn(async move { q2.get().await });
        tokio::time::sleep(TICK).await;
        q.add("ns/a");
        let got = timeout(TICK * 10, getter).await.unwrap().unwrap();
        assert_eq!(got.as_deref(), Some("ns/a"));
    }

    #[tokio::test]
    async fn readd_while_processing_parks_until_done() {
        let q = WorkQueue::new();
        q.add("ns/a");
        let key = q.get().await.unwrap();

        // Re-add while in flight: nothing becomes available...
        q.add("ns/a");
        assert!(q.is_empty());

        // ...until the first attempt reports done.
        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("ns/a"));
        q.done("ns/a");
    }

    #[tokio::test]
    async fn add_after_coalesces_bursts() {
        let q = WorkQueue::new();
        for _ in 0..5 {
            q.add_after("ns/a", Duration::from_millis(10));
        }
        tokio::time::sleep(TICK).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn rate_limited_requeue_counts_and_forget_resets() {
        let q = WorkQueue::with_rate_limiter(RateLimiter::new(
            Duration::from_millis(1),
            Duration::from_millis(8),
        ));
        assert_eq!(q.num_requeues("ns/a"), 0);
        q.add_rate_limited("ns/a");
        q.add_rate_limited("ns/a");
        assert_eq!(q.num_requeues("ns/a"), 2);
        q.forget("ns/a");
        assert_eq!(q.num_requeues("ns/a"), 0);

        // The deferred adds still land eventually.
        tokio::time::sleep(TICK).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_unblocks_getters() {
        let q = WorkQueue::new();
        let q2 = Arc::clone(&q);
        let getter = tokio::spawn(async move { q2.get().await });
        tokio::time::sleep(TICK).await;
        q.shut_down();
        let got = timeout(TICK * 10, getter).await.unwrap().unwrap();
        assert!(got.is_none());

        // And subsequent gets return immediately.
        assert!(q.get().await.is_none());
        q.add("ns/a");
        assert!(q.get().await.is_none());
    }

    #[test]
    fn limiter_doubles_and_caps() {
        let rl = RateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        assert_eq!(rl.delay_for(0), Duration::from_millis(5));
        assert_eq!(rl.delay_for(1), Duration::from_millis(10));
        assert_eq!(rl.delay_for(4), Duration::from_millis(80));
        assert_eq!(rl.delay_for(40), Duration::from_secs(1000));
    }
}
