//! Keyed counting semaphores with dynamic limits and multi-map acquisition.
//!
//! A [`SemaphoreMap`] is a named collection of counting semaphores shared
//! across workflows, used for global rate limiting of node bodies that
//! declare a `semaphore_key`. Permits are RAII guards in the style of
//! `tokio::sync::OwnedSemaphorePermit`: dropping a [`Permit`] releases the
//! slot, which makes double release unrepresentable.
//!
//! Keys without a configured limit are unlimited: acquiring them returns a
//! no-op permit. Releasing a slot hands it directly to the head of the
//! waiter queue; raising a limit with [`SemaphoreMap::set_limit`] drains
//! waiters FIFO up to the new limit.
//!
//! [`acquire_many`] acquires the same key on several maps at once. All
//! acquisitions start concurrently, and if the composite future is dropped
//! partway (cancellation), every already-granted permit is released, so
//! the observable count on every map returns to its pre-call value.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Default)]
struct Bucket {
    limit: usize,
    in_use: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Default)]
struct SemaphoreState {
    buckets: FxHashMap<String, Bucket>,
}

/// Hand a freed slot to the head waiter, or decrement the count.
fn release_slot(inner: &Arc<Mutex<SemaphoreState>>, key: &str) {
    let mut state = inner.lock();
    if let Some(bucket) = state.buckets.get_mut(key) {
        while let Some(waiter) = bucket.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                // Slot handed over; in_use is unchanged.
                return;
            }
            // Waiter gave up (acquire future dropped); try the next one.
        }
        bucket.in_use = bucket.in_use.saturating_sub(1);
    }
}

/// A named collection of counting semaphores.
///
/// Cloning is cheap and shares the underlying state, so one map can be
/// handed to many runners for global rate limiting.
///
/// # Examples
///
/// ```rust
/// use trellis::semaphores::SemaphoreMap;
///
/// # async fn demo() {
/// let sems = SemaphoreMap::new();
/// sems.set_limit("llm", 2);
///
/// let first = sems.acquire("llm").await;
/// let second = sems.acquire("llm").await;
/// assert_eq!(sems.in_use("llm"), 2);
/// drop(first);
/// assert_eq!(sems.in_use("llm"), 1);
/// # drop(second);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct SemaphoreMap {
    inner: Arc<Mutex<SemaphoreState>>,
}

impl SemaphoreMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a map with initial limits per key.
    #[must_use]
    pub fn with_limits<I, K>(limits: I) -> Self
    where
        I: IntoIterator<Item = (K, usize)>,
        K: Into<String>,
    {
        let map = Self::new();
        for (key, limit) in limits {
            map.set_limit(key, limit);
        }
        map
    }

    /// Acquire one slot for `key`, waiting if the bucket is full.
    ///
    /// Unknown keys have no limit: the returned permit is a no-op. The
    /// returned future is cancel-safe; dropping it while queued (or in the
    /// narrow window where a slot was just granted) releases the slot.
    pub async fn acquire(&self, key: &str) -> Permit {
        let receiver = {
            let mut state = self.inner.lock();
            let Some(bucket) = state.buckets.get_mut(key) else {
                return Permit { slot: None };
            };
            if bucket.in_use < bucket.limit {
                bucket.in_use += 1;
                return Permit {
                    slot: Some((Arc::clone(&self.inner), key.to_string())),
                };
            }
            let (tx, rx) = oneshot::channel();
            bucket.waiters.push_back(tx);
            rx
        };

        let mut wait = WaitSlot {
            receiver: Some(receiver),
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
        };
        let granted = wait.receiver.as_mut().expect("wait slot armed").await;
        wait.receiver = None; // disarm the cancellation guard
        match granted {
            Ok(()) => Permit {
                slot: Some((Arc::clone(&self.inner), key.to_string())),
            },
            // Bucket dropped out from under us; behave like an unknown key.
            Err(_) => Permit { slot: None },
        }
    }

    /// Acquire `key`, run `fut`, release.
    pub async fn run<Fut: Future>(&self, key: &str, fut: Fut) -> Fut::Output {
        let permit = self.acquire(key).await;
        let output = fut.await;
        drop(permit);
        output
    }

    /// Set (or create) the limit for `key`.
    ///
    /// Raising the limit drains queued waiters FIFO until the bucket is at
    /// the new limit. Lowering it never revokes outstanding permits; the
    /// bucket shrinks as they are released.
    pub fn set_limit(&self, key: impl Into<String>, limit: usize) {
        let mut state = self.inner.lock();
        let bucket = state.buckets.entry(key.into()).or_default();
        bucket.limit = limit;
        while bucket.in_use < bucket.limit {
            match bucket.waiters.pop_front() {
                Some(waiter) => {
                    if waiter.send(()).is_ok() {
                        bucket.in_use += 1;
                    }
                }
                None => break,
            }
        }
    }

    /// Outstanding permit count for `key` (0 for unknown keys).
    #[must_use]
    pub fn in_use(&self, key: &str) -> usize {
        self.inner
            .lock()
            .buckets
            .get(key)
            .map_or(0, |bucket| bucket.in_use)
    }

    /// Configured limit for `key`, if any.
    #[must_use]
    pub fn limit(&self, key: &str) -> Option<usize> {
        self.inner.lock().buckets.get(key).map(|bucket| bucket.limit)
    }
}

/// Releases a granted slot if the acquire future is dropped after the slot
/// was handed over but before it was observed.
struct WaitSlot {
    receiver: Option<oneshot::Receiver<()>>,
    inner: Arc<Mutex<SemaphoreState>>,
    key: String,
}

impl Drop for WaitSlot {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            if receiver.try_recv().is_ok() {
                release_slot(&self.inner, &self.key);
            }
        }
    }
}

/// RAII guard for one acquired slot; dropping it releases the slot.
#[must_use = "dropping the permit releases the semaphore slot"]
pub struct Permit {
    slot: Option<(Arc<Mutex<SemaphoreState>>, String)>,
}

impl Permit {
    /// Release explicitly (equivalent to dropping).
    pub fn release(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some((inner, key)) = self.slot.take() {
            release_slot(&inner, &key);
        }
    }
}

/// RAII guard over permits acquired on several maps at once.
#[must_use = "dropping the permits releases every acquired slot"]
pub struct MultiPermit {
    permits: Vec<Permit>,
}

impl MultiPermit {
    /// Release every permit (equivalent to dropping).
    pub fn release(self) {}

    /// Number of maps this guard holds a permit on.
    #[must_use]
    pub fn len(&self) -> usize {
        self.permits.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.permits.is_empty()
    }
}

/// Acquire `key` on every supplied map, returning a guard that releases
/// all of them.
///
/// All acquisitions start concurrently. If the composite future is dropped
/// partway (for example via `tokio::select!` against a cancellation
/// token), every already-granted permit releases itself, restoring each
/// map's `in_use(key)` to its pre-call value.
pub async fn acquire_many(maps: &[SemaphoreMap], key: &str) -> MultiPermit {
    let permits =
        futures_util::future::join_all(maps.iter().map(|map| map.acquire(key))).await;
    MultiPermit { permits }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_unknown_key_is_unlimited() {
        let sems = SemaphoreMap::new();
        let a = sems.acquire("anything").await;
        let b = sems.acquire("anything").await;
        assert_eq!(sems.in_use("anything"), 0);
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn test_release_hands_slot_to_head_waiter() {
        let sems = SemaphoreMap::with_limits([("k", 1)]);
        let held = sems.acquire("k").await;

        let sems2 = sems.clone();
        let waiter = tokio::spawn(async move { sems2.acquire("k").await });
        sleep(Duration::from_millis(10)).await;
        assert_eq!(sems.in_use("k"), 1);

        drop(held);
        let permit = waiter.await.unwrap();
        assert_eq!(sems.in_use("k"), 1);
        drop(permit);
        assert_eq!(sems.in_use("k"), 0);
    }

    #[tokio::test]
    async fn test_set_limit_drains_waiters_fifo() {
        let sems = SemaphoreMap::with_limits([("k", 0)]);
        let (first, second) = (sems.clone(), sems.clone());
        let w1 = tokio::spawn(async move { first.acquire("k").await });
        sleep(Duration::from_millis(5)).await;
        let w2 = tokio::spawn(async move { second.acquire("k").await });
        sleep(Duration::from_millis(5)).await;

        sems.set_limit("k", 1);
        let p1 = w1.await.unwrap();
        assert_eq!(sems.in_use("k"), 1);

        sems.set_limit("k", 2);
        let p2 = w2.await.unwrap();
        assert_eq!(sems.in_use("k"), 2);
        drop(p1);
        drop(p2);
        assert_eq!(sems.in_use("k"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let sems = SemaphoreMap::with_limits([("k", 1)]);
        let held = sems.acquire("k").await;

        let abandoned = sems.clone();
        let doomed = tokio::spawn(async move {
            let _ = abandoned.acquire("k").await;
        });
        sleep(Duration::from_millis(5)).await;
        doomed.abort();
        let _ = doomed.await;

        let survivor = sems.clone();
        let alive = tokio::spawn(async move { survivor.acquire("k").await });
        sleep(Duration::from_millis(5)).await;

        drop(held);
        let permit = alive.await.unwrap();
        assert_eq!(sems.in_use("k"), 1);
        drop(permit);
        assert_eq!(sems.in_use("k"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_multi_acquire_restores_counts() {
        let a = SemaphoreMap::with_limits([("k", 1)]);
        let b = SemaphoreMap::with_limits([("k", 1)]);
        let c = SemaphoreMap::with_limits([("k", 1)]);

        // Fill b so the multi-acquire stalls after grabbing a and c.
        let blocker = b.acquire("k").await;

        let cancel = CancellationToken::new();
        let maps = [a.clone(), b.clone(), c.clone()];
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => None,
                permits = acquire_many(&maps, "k") => Some(permits),
            }
        });

        sleep(Duration::from_millis(10)).await;
        assert_eq!(a.in_use("k"), 1);
        assert_eq!(c.in_use("k"), 1);

        cancel.cancel();
        assert!(task.await.unwrap().is_none());

        // Partial acquisitions must have been rolled back.
        assert_eq!(a.in_use("k"), 0);
        assert_eq!(c.in_use("k"), 0);
        drop(blocker);
        assert_eq!(b.in_use("k"), 0);
    }

    #[tokio::test]
    async fn test_multi_acquire_holds_all_until_released() {
        let a = SemaphoreMap::with_limits([("k", 2)]);
        let b = SemaphoreMap::with_limits([("k", 2)]);
        let permits = acquire_many(&[a.clone(), b.clone()], "k").await;
        assert_eq!(permits.len(), 2);
        assert_eq!(a.in_use("k"), 1);
        assert_eq!(b.in_use("k"), 1);
        permits.release();
        assert_eq!(a.in_use("k"), 0);
        assert_eq!(b.in_use("k"), 0);
    }
}
