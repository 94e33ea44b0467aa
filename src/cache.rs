//! Reactive key-value cache
//!
//! Stores the last value and error per cache key and publishes snapshots to
//! watchers. Features:
//! - At most one in-flight fetch per key; every trigger joins it
//! - Fetch results settle into the cache even when nobody awaits them
//! - Synchronous optimistic writes, with optional revalidation
//! - Mount-time revalidation skipped while an entry is fresh
//! - LRU bound on stored values

use crate::error::{SwrError, SwrResult};
use crate::key::CacheKey;
use crate::metrics::SwrMetrics;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;

/// Fetch closure registered by a mounted request
pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, SwrResult<Value>> + Send + Sync>;

/// Outcome of a fetch as shared between joined callers
pub type FetchOutcome = Result<Value, Arc<SwrError>>;

type InFlight = Shared<BoxFuture<'static, FetchOutcome>>;

/// What a watcher sees for one key
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub data: Option<Value>,
    pub error: Option<Arc<SwrError>>,
    pub is_validating: bool,
}

#[derive(Clone)]
struct CacheEntry {
    data: Option<Value>,
    error: Option<Arc<SwrError>>,
    /// None once invalidated
    updated_at: Option<DateTime<Utc>>,
}

struct KeyState {
    tx: watch::Sender<Snapshot>,
    inflight: Option<(u64, InFlight)>,
    mounts: usize,
    fetch: Option<FetchFn>,
}

struct CacheState {
    entries: LruCache<CacheKey, CacheEntry>,
    live: HashMap<CacheKey, KeyState>,
    next_generation: u64,
}

struct CacheInner {
    state: Mutex<CacheState>,
    metrics: OnceLock<Arc<SwrMetrics>>,
}

/// Shared reactive cache; clones refer to the same storage
#[derive(Clone)]
pub struct SwrCache {
    inner: Arc<CacheInner>,
}

impl SwrCache {
    /// Create a cache holding at most `capacity` values
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    entries: LruCache::new(capacity),
                    live: HashMap::new(),
                    next_generation: 0,
                }),
                metrics: OnceLock::new(),
            }),
        }
    }

    pub fn with_metrics(capacity: usize, metrics: Arc<SwrMetrics>) -> Self {
        let cache = Self::new(capacity);
        cache.attach_metrics(metrics);
        cache
    }

    /// Start recording metrics on this cache and its clones
    ///
    /// The first registry attached is kept.
    pub fn attach_metrics(&self, metrics: Arc<SwrMetrics>) {
        let _ = self.inner.metrics.set(metrics);
    }

    /// Subscribe to snapshots for a key
    pub fn watch(&self, key: &CacheKey) -> watch::Receiver<Snapshot> {
        let mut state = self.inner.state.lock();
        state.live_state(key).tx.subscribe()
    }

    /// Current snapshot for a key
    pub fn snapshot(&self, key: &CacheKey) -> Snapshot {
        let mut state = self.inner.state.lock();
        state.snapshot(key)
    }

    /// Cached value for a key
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.entries.get(key) {
            tracing::trace!(key = %key, "Cache hit");
            return entry.data.clone();
        }
        state
            .live
            .get(key)
            .and_then(|live| live.tx.borrow().data.clone())
    }

    /// Write a value (or only invalidate when `data` is `None`)
    ///
    /// Writes apply synchronously and are visible to the next `get`. With
    /// `revalidate` the mounted fetch runs afterwards, deduplicated.
    pub fn mutate(&self, key: &CacheKey, data: Option<Value>, revalidate: bool) {
        let Some(data) = data else {
            self.invalidate(key, revalidate);
            return;
        };

        {
            let mut state = self.inner.state.lock();
            state.entries.put(
                key.clone(),
                CacheEntry {
                    data: Some(data),
                    error: None,
                    updated_at: Some(Utc::now()),
                },
            );
            tracing::trace!(key = %key, "Cache write");
            state.publish(key);
        }

        if revalidate {
            self.trigger(key);
        }
    }

    /// Mark a key stale; with `revalidate`, re-run its mounted fetch
    pub fn invalidate(&self, key: &CacheKey, revalidate: bool) {
        {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.entries.get_mut(key) {
                entry.updated_at = None;
            }
        }
        if revalidate {
            self.trigger(key);
        }
    }

    /// Run `fetch` for a key, or join the fetch already in flight
    pub async fn revalidate(&self, key: &CacheKey, fetch: FetchFn) -> FetchOutcome {
        self.start(key, fetch).await
    }

    /// Register a mounted request's fetch for a key
    ///
    /// With `revalidate_on_mount`, fetches unless the entry was written within
    /// `dedupe_interval`.
    pub fn mount(
        &self,
        key: &CacheKey,
        fetch: FetchFn,
        revalidate_on_mount: bool,
        dedupe_interval: Duration,
    ) -> watch::Receiver<Snapshot> {
        let (rx, fresh) = {
            let mut state = self.inner.state.lock();
            let fresh = state.is_fresh(key, dedupe_interval);
            let live = state.live_state(key);
            live.mounts += 1;
            live.fetch = Some(fetch.clone());
            (live.tx.subscribe(), fresh)
        };

        if fresh {
            tracing::trace!(key = %key, "Fresh entry on mount");
            if let Some(metrics) = self.inner.metrics.get() {
                metrics.cache_hits.inc();
            }
        } else if revalidate_on_mount {
            drop(self.start(key, fetch));
        }
        rx
    }

    /// Replace the fetch registered for a mounted key
    pub fn replace_fetch(&self, key: &CacheKey, fetch: FetchFn) {
        let mut state = self.inner.state.lock();
        if let Some(live) = state.live.get_mut(key) {
            if live.mounts > 0 {
                live.fetch = Some(fetch);
            }
        }
    }

    /// Release a mount; the fetch is forgotten when the last one goes
    pub fn unmount(&self, key: &CacheKey) {
        let mut state = self.inner.state.lock();
        let Some(live) = state.live.get_mut(key) else {
            return;
        };
        live.mounts = live.mounts.saturating_sub(1);
        if live.mounts > 0 {
            return;
        }
        live.fetch = None;
        if live.inflight.is_none() && live.tx.receiver_count() == 0 {
            state.live.remove(key);
        }
    }

    /// Number of mounts for a key
    pub fn mount_count(&self, key: &CacheKey) -> usize {
        self.inner
            .state
            .lock()
            .live
            .get(key)
            .map(|live| live.mounts)
            .unwrap_or(0)
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn trigger(&self, key: &CacheKey) {
        let fetch = {
            let state = self.inner.state.lock();
            state.live.get(key).and_then(|live| live.fetch.clone())
        };
        match fetch {
            Some(fetch) => drop(self.start(key, fetch)),
            None => tracing::trace!(key = %key, "No mounted fetch to revalidate"),
        }
    }

    fn start(&self, key: &CacheKey, fetch: FetchFn) -> InFlight {
        let mut state = self.inner.state.lock();
        if let Some((_, inflight)) = state.live_state(key).inflight.as_ref() {
            let inflight = inflight.clone();
            tracing::trace!(key = %key, "Joining in-flight fetch");
            if let Some(metrics) = self.inner.metrics.get() {
                metrics.deduplicated.inc();
            }
            return inflight;
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let cache = self.clone();
        let settle_key = key.clone();
        let inflight = async move {
            let outcome = fetch().await.map_err(Arc::new);
            cache.settle(&settle_key, generation, &outcome);
            outcome
        }
        .boxed()
        .shared();

        // only a spawned fetch is shared; an unspawned one runs when its caller awaits it
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %key, "No tokio runtime available, fetch runs only when awaited");
            return inflight;
        };
        state.live_state(key).inflight = Some((generation, inflight.clone()));
        state.publish(key);
        drop(state);

        runtime.spawn(inflight.clone());
        inflight
    }

    fn settle(&self, key: &CacheKey, generation: u64, outcome: &FetchOutcome) {
        let mut state = self.inner.state.lock();
        match outcome {
            Ok(value) => {
                state.entries.put(
                    key.clone(),
                    CacheEntry {
                        data: Some(value.clone()),
                        error: None,
                        updated_at: Some(Utc::now()),
                    },
                );
                tracing::trace!(key = %key, "Fetch settled");
            }
            Err(error) => {
                tracing::debug!(key = %key, error = %error, "Fetch failed");
                let previous = state.entries.pop(key);
                state.entries.put(
                    key.clone(),
                    CacheEntry {
                        data: previous.and_then(|entry| entry.data),
                        error: Some(error.clone()),
                        updated_at: None,
                    },
                );
            }
        }

        if let Some(live) = state.live.get_mut(key) {
            if matches!(live.inflight, Some((current, _)) if current == generation) {
                live.inflight = None;
            }
        }
        state.publish(key);

        let idle = state
            .live
            .get(key)
            .is_some_and(|live| live.mounts == 0 && live.inflight.is_none() && live.tx.receiver_count() == 0);
        if idle {
            state.live.remove(key);
        }
    }
}

impl CacheState {
    fn live_state(&mut self, key: &CacheKey) -> &mut KeyState {
        let entries = &mut self.entries;
        self.live.entry(key.clone()).or_insert_with(|| {
            let (tx, _) = watch::channel(stored_snapshot(entries, key));
            KeyState {
                tx,
                inflight: None,
                mounts: 0,
                fetch: None,
            }
        })
    }

    fn snapshot(&mut self, key: &CacheKey) -> Snapshot {
        let mut snapshot = stored_snapshot(&mut self.entries, key);
        if let Some(live) = self.live.get(key) {
            if snapshot.data.is_none() {
                // value evicted from the LRU while still watched
                snapshot.data = live.tx.borrow().data.clone();
            }
            snapshot.is_validating = live.inflight.is_some();
        }
        snapshot
    }

    fn publish(&mut self, key: &CacheKey) {
        let snapshot = self.snapshot(key);
        if let Some(live) = self.live.get(key) {
            live.tx.send_replace(snapshot);
        }
    }

    fn is_fresh(&mut self, key: &CacheKey, dedupe_interval: Duration) -> bool {
        let Some(updated_at) = self.entries.peek(key).and_then(|entry| entry.updated_at) else {
            return false;
        };
        let Ok(window) = chrono::Duration::from_std(dedupe_interval) else {
            return true;
        };
        Utc::now() - updated_at < window
    }
}

fn stored_snapshot(entries: &mut LruCache<CacheKey, CacheEntry>, key: &CacheKey) -> Snapshot {
    match entries.get(key) {
        Some(entry) => Snapshot {
            data: entry.data.clone(),
            error: entry.error.clone(),
            is_validating: false,
        },
        None => Snapshot::default(),
    }
}
