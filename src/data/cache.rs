use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use crate::monitoring::metrics;

/// Deterministic hash of the inputs to a cacheable computation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// SHA-256 over length-prefixed parts, so part boundaries are part of the key
    pub fn of(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

/// Returned through `E: From<Cancelled>` when a caller's token fires while it
/// waits on another caller's computation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Sent to subscribers on every `put`
#[derive(Debug, Clone)]
pub struct StoreUpdate {
    pub fingerprint: Fingerprint,
    pub stored_at: DateTime<Utc>,
}

/// A cached value together with the wall-clock time it was stored
#[derive(Debug, Clone)]
pub struct Stored<V> {
    pub value: Arc<V>,
    pub stored_at: DateTime<Utc>,
}

struct CachedEntry<V> {
    value: Arc<V>,
    inserted: Instant,
    stored_at: DateTime<Utc>,
    last_access: AtomicU64,
}

/// Content-addressed cache of evidence and estimates.
///
/// Entries are evicted least-recently-used once `capacity` is exceeded and
/// are treated as absent once older than `ttl`, regardless of capacity.
/// `get_or_try_compute` runs at most one computation per fingerprint at a
/// time; concurrent callers wait and share the stored `Arc`.
pub struct EvidenceStore<V> {
    entries: DashMap<Fingerprint, CachedEntry<V>>,
    inflight: DashMap<Fingerprint, Arc<Mutex<()>>>,
    capacity: usize,
    ttl: Duration,
    clock: AtomicU64,
    updates: broadcast::Sender<StoreUpdate>,
}

impl<V> EvidenceStore<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
            clock: AtomicU64::new(0),
            updates,
        }
    }

    /// Get value if present and not expired (evict on read)
    pub fn get(&self, key: &Fingerprint) -> Option<Arc<V>> {
        self.get_latest(key).map(|stored| stored.value)
    }

    /// Pull the latest value along with when it was stored
    pub fn get_latest(&self, key: &Fingerprint) -> Option<Stored<V>> {
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) if entry.inserted.elapsed() > self.ttl => true,
            Some(entry) => {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                return Some(Stored {
                    value: entry.value.clone(),
                    stored_at: entry.stored_at,
                });
            }
        };

        if expired {
            let ttl = self.ttl;
            self.entries.remove_if(key, |_, e| e.inserted.elapsed() > ttl);
        }
        None
    }

    /// Insert a value, evicting least-recently-used entries past capacity
    pub fn put(&self, key: Fingerprint, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let stored_at = Utc::now();

        self.entries.insert(
            key.clone(),
            CachedEntry {
                value: value.clone(),
                inserted: Instant::now(),
                stored_at,
                last_access: AtomicU64::new(self.tick()),
            },
        );
        self.evict_over_capacity();

        // No subscribers is fine
        let _ = self.updates.send(StoreUpdate {
            fingerprint: key,
            stored_at,
        });

        value
    }

    /// Return the cached value or compute it, at most once concurrently per key.
    ///
    /// Errors and dropped (cancelled) computations store nothing; the next
    /// waiter then runs its own computation. A caller waiting behind another
    /// computation gives up as soon as its own `cancel` fires.
    pub async fn get_or_try_compute<F, Fut, E>(
        &self,
        key: &Fingerprint,
        cancel: &CancellationToken,
        compute: F,
    ) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: From<Cancelled>,
    {
        if let Some(hit) = self.get(key) {
            metrics::record_cache_hit();
            return Ok(hit);
        }

        let gate = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let mut flight = Flight {
            inflight: &self.inflight,
            key,
            gate: gate.clone(),
            permit: None,
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(fingerprint = %key, "Cancelled while waiting on in-flight computation");
                return Err(Cancelled.into());
            }
            permit = gate.lock_owned() => permit,
        };
        flight.permit = Some(permit);

        // Whoever held the gate before us may have filled the slot
        if let Some(hit) = self.get(key) {
            metrics::record_cache_hit();
            return Ok(hit);
        }

        metrics::record_cache_miss();
        debug!(fingerprint = %key, "Evidence store miss, computing");
        let value = compute().await?;
        let stored = self.put(key.clone(), value);
        drop(flight);
        Ok(stored)
    }

    /// Receive a notification for every value stored from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }

    pub fn invalidate(&self, key: &Fingerprint) {
        self.entries.remove(key);
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn evict_over_capacity(&self) {
        if self.entries.len() <= self.capacity {
            return;
        }

        let ttl = self.ttl;
        self.entries.retain(|_, e| e.inserted.elapsed() <= ttl);

        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().last_access.load(Ordering::Relaxed))
                .map(|e| e.key().clone());

            match oldest {
                Some(key) => {
                    debug!(fingerprint = %key, "Evicting least recently used entry");
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// Holds the per-key gate; releases it and prunes the gate map on drop,
/// including when the owning future is cancelled mid-computation.
struct Flight<'a> {
    inflight: &'a DashMap<Fingerprint, Arc<Mutex<()>>>,
    key: &'a Fingerprint,
    gate: Arc<Mutex<()>>,
    permit: Option<OwnedMutexGuard<()>>,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.permit.take();
        let gate = &self.gate;
        // Map + our handle; anything more means another caller is waiting
        self.inflight
            .remove_if(self.key, |_, g| Arc::ptr_eq(g, gate) && Arc::strong_count(g) <= 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::of(&[s])
    }

    #[derive(Debug, PartialEq)]
    enum ComputeError {
        Boom,
        Cancelled,
    }

    impl From<Cancelled> for ComputeError {
        fn from(_: Cancelled) -> Self {
            ComputeError::Cancelled
        }
    }

    #[test]
    fn test_fingerprint_respects_part_boundaries() {
        assert_eq!(Fingerprint::of(&["ab", "c"]), Fingerprint::of(&["ab", "c"]));
        assert_ne!(Fingerprint::of(&["ab", "c"]), Fingerprint::of(&["a", "bc"]));
        assert_eq!(Fingerprint::of(&["x"]).as_str().len(), 64);
    }

    #[test]
    fn test_store_put_and_get() {
        let store = EvidenceStore::new(10, Duration::from_secs(60));
        store.put(fp("a"), 1u32);

        assert_eq!(store.get(&fp("a")).as_deref(), Some(&1));
        assert!(store.get(&fp("b")).is_none());
    }

    #[test]
    fn test_store_ttl_expiration() {
        let store = EvidenceStore::new(10, Duration::from_millis(100));
        store.put(fp("a"), 1u32);
        assert!(store.get(&fp("a")).is_some());

        thread::sleep(Duration::from_millis(150));

        // Expired entries are absent even though capacity was never reached
        assert!(store.get(&fp("a")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_evicts_least_recently_used() {
        let store = EvidenceStore::new(2, Duration::from_secs(60));
        store.put(fp("a"), 1u32);
        store.put(fp("b"), 2u32);

        // Touch a, so b becomes the eviction candidate
        assert!(store.get(&fp("a")).is_some());
        store.put(fp("c"), 3u32);

        assert_eq!(store.len(), 2);
        assert!(store.get(&fp("a")).is_some());
        assert!(store.get(&fp("b")).is_none());
        assert!(store.get(&fp("c")).is_some());
    }

    #[test]
    fn test_get_latest_carries_store_time() {
        let store = EvidenceStore::new(10, Duration::from_secs(60));
        let before = Utc::now();
        store.put(fp("a"), "value".to_string());

        let latest = store.get_latest(&fp("a")).unwrap();
        assert_eq!(latest.value.as_str(), "value");
        assert!(latest.stored_at >= before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_compute_once() {
        let store = Arc::new(EvidenceStore::new(10, Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = fp("shared");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let calls = calls.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                store
                    .get_or_try_compute(&key, &cancel, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, Cancelled>(42u32)
                    })
                    .await
                    .unwrap()
            }));
        }

        let results: Vec<Arc<u32>> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
        assert!(store.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_failed_computation_is_not_cached() {
        let store: EvidenceStore<u32> = EvidenceStore::new(10, Duration::from_secs(60));
        let key = fp("flaky");
        let cancel = CancellationToken::new();

        let first = store
            .get_or_try_compute(&key, &cancel, || async { Err(ComputeError::Boom) })
            .await;
        assert_eq!(first, Err(ComputeError::Boom));
        assert!(store.get(&key).is_none());

        let second = store
            .get_or_try_compute(&key, &cancel, || async { Ok::<_, ComputeError>(7) })
            .await;
        assert_eq!(*second.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancelled_computation_releases_gate() {
        let store: EvidenceStore<u32> = EvidenceStore::new(10, Duration::from_secs(60));
        let key = fp("slow");

        let cancel = CancellationToken::new();

        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            store.get_or_try_compute(&key, &cancel, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, Cancelled>(1)
            }),
        )
        .await;
        assert!(attempt.is_err());
        assert!(store.get(&key).is_none());
        assert!(store.inflight.is_empty());

        let value = store
            .get_or_try_compute(&key, &cancel, || async { Ok::<_, Cancelled>(2) })
            .await
            .unwrap();
        assert_eq!(*value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_honors_its_own_cancellation() {
        let store: EvidenceStore<u32> = EvidenceStore::new(10, Duration::from_secs(60));
        let key = fp("contended");
        let leader_cancel = CancellationToken::new();
        let waiter_cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();

        let leader = store.get_or_try_compute(&key, &leader_cancel, || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, ComputeError>(1)
        });
        let waiter = async {
            let result = store
                .get_or_try_compute(&key, &waiter_cancel, || async { Ok::<_, ComputeError>(2) })
                .await;
            (result, start.elapsed())
        };
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            waiter_cancel.cancel();
        };

        let (leader_result, (waiter_result, waited), ()) = tokio::join!(leader, waiter, trigger);

        assert_eq!(waiter_result, Err(ComputeError::Cancelled));
        assert!(waited < Duration::from_secs(1));
        // The leader is unaffected and its value is stored
        assert_eq!(*leader_result.unwrap(), 1);
        assert_eq!(store.get(&key).as_deref(), Some(&1));
        assert!(store.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_notified_on_put() {
        let store = EvidenceStore::new(10, Duration::from_secs(60));
        let mut updates = store.subscribe();

        store.put(fp("a"), 1u32);

        let update = updates.recv().await.unwrap();
        assert_eq!(update.fingerprint, fp("a"));
    }
}
