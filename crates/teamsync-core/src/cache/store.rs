//! In-memory query cache.
//!
//! Entries are keyed by [`CacheKey`] and hold the last applied value, its
//! freshness deadline, and a request lineage. Every request gets a lineage
//! id from a monotonically increasing counter; a response is applied only if
//! its lineage is newer than the one that produced the current value, so
//! late responses from superseded requests never overwrite newer data.
//!
//! Every request runs on its own task, so it completes even if all callers
//! waiting on it go away. Concurrent reads of the same key share one
//! in-flight request. Invalidating a scope marks its entries stale, detaches
//! any in-flight request (so later reads cannot join a request that started
//! before the write), and immediately refetches entries that are currently
//! observed. A refetch aborts the request it replaces, so at most one
//! request per observed key is live; callers waiting on the aborted one
//! join its replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{AbortHandle, Abortable, BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::api::ApiError;
use crate::utils::format_age;

use super::invalidation::Invalidation;
use super::keys::{CacheKey, Scope};

/// Outcome of a read, shared between every caller that joined the request.
pub type FetchResult = Result<Arc<Value>, Arc<ApiError>>;

/// Performs the network read for one key.
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, ApiError>> + Send + Sync>;

/// `None` when the request was aborted in favour of a newer one.
type SharedFetch = Shared<BoxFuture<'static, Option<FetchResult>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
    #[default]
    Idle,
    Fetching,
}

/// Observable value of one cache entry.
#[derive(Debug, Clone, Default)]
pub struct QueryState {
    pub data: Option<Arc<Value>>,
    pub status: FetchStatus,
    /// User-facing message of the last failed fetch, cleared on success.
    pub error: Option<String>,
    /// Explicitly invalidated and not yet refreshed by a newer request.
    pub invalidated: bool,
    /// Invalidated or past its stale-time.
    pub stale: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl QueryState {
    pub fn is_fetching(&self) -> bool {
        self.status == FetchStatus::Fetching
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.data
            .as_ref()
            .map(|value| T::deserialize(value.as_ref()))
    }

    pub fn age_display(&self) -> String {
        self.updated_at
            .map(format_age)
            .unwrap_or_else(|| "never".to_string())
    }
}

/// Per-read overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    pub stale_time: Option<Duration>,
    /// Skip the freshness check and wait for a network response.
    pub force: bool,
}

struct InFlight {
    lineage: u64,
    future: SharedFetch,
    abort: AbortHandle,
}

struct Entry {
    /// Distinguishes this entry from a later one created under the same key.
    id: u64,
    data: Option<Arc<Value>>,
    fetched_at: Option<Instant>,
    updated_at: Option<DateTime<Utc>>,
    stale_time: Duration,
    invalidated: bool,
    /// Requests with a lineage at or below this started before the last
    /// invalidation and cannot clear it.
    invalidated_at: u64,
    applied_lineage: u64,
    in_flight: Option<InFlight>,
    observers: usize,
    fetcher: Option<Fetcher>,
    error: Option<String>,
    tx: watch::Sender<QueryState>,
}

impl Entry {
    fn new(id: u64, stale_time: Duration) -> Self {
        let (tx, _) = watch::channel(QueryState::default());
        Self {
            id,
            data: None,
            fetched_at: None,
            updated_at: None,
            stale_time,
            invalidated: false,
            invalidated_at: 0,
            applied_lineage: 0,
            in_flight: None,
            observers: 0,
            fetcher: None,
            error: None,
            tx,
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        !self.invalidated
            && self
                .fetched_at
                .map(|at| now.duration_since(at) < self.stale_time)
                .unwrap_or(false)
    }

    fn state(&self) -> QueryState {
        QueryState {
            data: self.data.clone(),
            status: if self.in_flight.is_some() {
                FetchStatus::Fetching
            } else {
                FetchStatus::Idle
            },
            error: self.error.clone(),
            invalidated: self.invalidated,
            stale: !self.is_fresh(Instant::now()),
            updated_at: self.updated_at,
        }
    }

    fn publish(&self) {
        self.tx.send_replace(self.state());
    }
}

struct Inner {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    lineage: AtomicU64,
    default_stale_time: Duration,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_lineage(&self) -> u64 {
        self.lineage.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current_lineage(&self) -> u64 {
        self.lineage.load(Ordering::SeqCst)
    }

    /// Begin a request for `key` on its own task; the caller holds the
    /// entries lock. Must be called within a Tokio runtime.
    fn start_fetch(
        self: &Arc<Self>,
        key: &CacheKey,
        entry: &mut Entry,
        fetcher: Fetcher,
    ) -> SharedFetch {
        let lineage = self.next_lineage();
        let inner = Arc::clone(self);
        let owned_key = key.clone();
        let (abort, registration) = AbortHandle::new_pair();
        let request = async move {
            let result = fetcher().await;
            inner.complete(&owned_key, lineage, result)
        };
        let future = Abortable::new(request, registration)
            .map(Result::ok)
            .boxed()
            .shared();

        let driver = future.clone();
        tokio::spawn(async move {
            let _ = driver.await;
        });

        entry.in_flight = Some(InFlight {
            lineage,
            future: future.clone(),
            abort,
        });
        entry.publish();
        debug!(key = %key, lineage, "Fetch started");
        future
    }

    fn complete(
        &self,
        key: &CacheKey,
        lineage: u64,
        result: Result<Value, ApiError>,
    ) -> FetchResult {
        let result = result.map(Arc::new).map_err(Arc::new);

        let mut entries = self.entries();
        // Entry ids come from the lineage counter, so a request older than the
        // entry belongs to one that was removed and recreated since.
        let Some(entry) = entries.get_mut(key).filter(|entry| lineage > entry.id) else {
            debug!(key = %key, lineage, "Discarding response for removed entry");
            return result;
        };

        if entry.in_flight.as_ref().is_some_and(|f| f.lineage == lineage) {
            entry.in_flight = None;
        }

        if lineage <= entry.applied_lineage {
            debug!(
                key = %key,
                lineage,
                applied = entry.applied_lineage,
                "Discarding superseded response"
            );
        } else {
            match &result {
                Ok(value) => {
                    entry.data = Some(Arc::clone(value));
                    entry.applied_lineage = lineage;
                    entry.fetched_at = Some(Instant::now());
                    entry.updated_at = Some(Utc::now());
                    entry.error = None;
                    if lineage > entry.invalidated_at {
                        entry.invalidated = false;
                    }
                    debug!(key = %key, lineage, "Cache entry updated");
                }
                Err(e) => {
                    entry.error = Some(e.user_message());
                    debug!(key = %key, lineage, error = %e, "Fetch failed, keeping last value");
                }
            }
        }

        entry.publish();
        result
    }
}

/// Shared, cheaply cloneable handle to the cache.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    pub fn new(default_stale_time: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                lineage: AtomicU64::new(0),
                default_stale_time,
            }),
        }
    }

    pub fn default_stale_time(&self) -> Duration {
        self.inner.default_stale_time
    }

    /// Read `key`, going to the network only when needed.
    ///
    /// - fresh entry: returned without a request
    /// - entry past its stale-time: returned immediately, refreshed in the background
    /// - missing, invalidated, or forced: waits for a request, joining one
    ///   already in flight for the same key
    ///
    /// Dropping the returned future does not cancel the request.
    pub async fn fetch(
        &self,
        key: &CacheKey,
        options: FetchOptions,
        fetcher: Fetcher,
    ) -> FetchResult {
        loop {
            let request = match self.begin(key, options, &fetcher) {
                Ok(request) => request,
                Err(cached) => return Ok(cached),
            };
            match request.await {
                Some(result) => return result,
                None => debug!(key = %key, "Request superseded, joining its replacement"),
            }
        }
    }

    /// Decide how to serve a read: `Err` carries a value to return as is,
    /// `Ok` a request to wait on.
    fn begin(
        &self,
        key: &CacheKey,
        options: FetchOptions,
        fetcher: &Fetcher,
    ) -> Result<SharedFetch, Arc<Value>> {
        let mut entries = self.inner.entries();
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            Entry::new(self.inner.next_lineage(), self.inner.default_stale_time)
        });
        if let Some(stale_time) = options.stale_time {
            entry.stale_time = stale_time;
        }
        entry.fetcher = Some(Arc::clone(fetcher));

        let fresh = entry.is_fresh(Instant::now());
        match entry.data.clone() {
            Some(data) if !options.force && fresh => {
                debug!(key = %key, "Cache hit");
                Err(data)
            }
            Some(data) if !options.force && !entry.invalidated => {
                if entry.in_flight.is_none() {
                    debug!(key = %key, "Serving stale entry, revalidating");
                    self.inner.start_fetch(key, entry, Arc::clone(fetcher));
                }
                Err(data)
            }
            _ => match entry.in_flight.as_ref() {
                Some(in_flight) => {
                    debug!(key = %key, lineage = in_flight.lineage, "Joining in-flight request");
                    Ok(in_flight.future.clone())
                }
                None => Ok(self.inner.start_fetch(key, entry, Arc::clone(fetcher))),
            },
        }
    }

    /// Register an observer for `key` and return a handle that tracks its value.
    ///
    /// While at least one observer is alive the entry counts as active:
    /// invalidating it triggers an immediate refetch. A missing or stale
    /// entry is fetched in the background when observation starts. Must be
    /// called within a Tokio runtime.
    pub fn observe(
        &self,
        key: &CacheKey,
        options: FetchOptions,
        fetcher: Fetcher,
    ) -> QueryObserver {
        let (entry_id, receiver) = {
            let mut entries = self.inner.entries();
            let entry = entries.entry(key.clone()).or_insert_with(|| {
                Entry::new(self.inner.next_lineage(), self.inner.default_stale_time)
            });
            if let Some(stale_time) = options.stale_time {
                entry.stale_time = stale_time;
            }
            entry.fetcher = Some(Arc::clone(&fetcher));
            entry.observers += 1;

            let needs_fetch = options.force || !entry.is_fresh(Instant::now());
            if needs_fetch && entry.in_flight.is_none() {
                self.inner.start_fetch(key, entry, fetcher);
            }
            (entry.id, entry.tx.subscribe())
        };

        QueryObserver {
            cache: self.clone(),
            key: key.clone(),
            entry_id,
            receiver,
        }
    }

    fn release(&self, key: &CacheKey, entry_id: u64) {
        let mut entries = self.inner.entries();
        if let Some(entry) = entries.get_mut(key) {
            if entry.id == entry_id && entry.observers > 0 {
                entry.observers -= 1;
            }
        }
    }

    /// Mark every entry under `scope` stale and refetch the observed ones.
    /// Returns the number of entries affected.
    pub fn invalidate(&self, scope: &Scope) -> usize {
        let mut entries = self.inner.entries();
        let mark = self.inner.current_lineage();
        let mut affected = 0;
        let mut refetching = 0;
        for (key, entry) in entries.iter_mut().filter(|(key, _)| scope.contains(key)) {
            affected += 1;
            entry.invalidated = true;
            entry.invalidated_at = mark;
            let previous = entry.in_flight.take();

            match entry.fetcher.clone() {
                Some(fetcher) if entry.observers > 0 => {
                    if let Some(previous) = previous {
                        debug!(
                            key = %key,
                            lineage = previous.lineage,
                            "Aborting superseded request"
                        );
                        previous.abort.abort();
                    }
                    self.inner.start_fetch(key, entry, fetcher);
                    refetching += 1;
                }
                _ => entry.publish(),
            }
        }
        drop(entries);

        debug!(
            scope = %scope,
            entries = affected,
            refetching,
            "Scope invalidated"
        );
        affected
    }

    /// Drop every entry under `scope` outright. Observers see an empty state.
    pub fn remove_scope(&self, scope: &Scope) -> usize {
        let mut entries = self.inner.entries();
        let keys: Vec<CacheKey> = entries
            .keys()
            .filter(|key| scope.contains(key))
            .cloned()
            .collect();
        for key in &keys {
            if let Some(entry) = entries.remove(key) {
                entry.tx.send_replace(QueryState::default());
            }
        }
        debug!(scope = %scope, entries = keys.len(), "Scope removed");
        keys.len()
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = self.inner.entries().remove(key);
        match removed {
            Some(entry) => {
                entry.tx.send_replace(QueryState::default());
                true
            }
            None => false,
        }
    }

    /// Drop everything, e.g. when the signed-in identity changes.
    pub fn clear(&self) {
        let drained: Vec<Entry> = self.inner.entries().drain().map(|(_, entry)| entry).collect();
        debug!(entries = drained.len(), "Cache cleared");
        for entry in drained {
            entry.tx.send_replace(QueryState::default());
        }
    }

    /// Apply a resolved invalidation plan.
    pub fn apply(&self, plan: &[Invalidation]) {
        for invalidation in plan {
            match invalidation {
                Invalidation::Stale(scope) => {
                    self.invalidate(scope);
                }
                Invalidation::Remove(scope) => {
                    self.remove_scope(scope);
                }
            }
        }
    }

    pub fn snapshot(&self, key: &CacheKey) -> Option<QueryState> {
        self.inner.entries().get(key).map(Entry::state)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.entries().contains_key(key)
    }

    pub fn is_invalidated(&self, key: &CacheKey) -> bool {
        self.inner
            .entries()
            .get(key)
            .map(|entry| entry.invalidated)
            .unwrap_or(false)
    }

    pub fn observer_count(&self, key: &CacheKey) -> usize {
        self.inner
            .entries()
            .get(key)
            .map(|entry| entry.observers)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries().is_empty()
    }
}

/// Live view of one cache entry. Dropping it makes the entry inactive.
pub struct QueryObserver {
    cache: QueryCache,
    key: CacheKey,
    entry_id: u64,
    receiver: watch::Receiver<QueryState>,
}

impl QueryObserver {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn current(&self) -> QueryState {
        self.receiver.borrow().clone()
    }

    /// Wait for the next published state. `None` once the entry is gone.
    pub async fn changed(&mut self) -> Option<QueryState> {
        self.receiver.changed().await.ok()?;
        Some(self.current())
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&QueryState) -> bool,
    ) -> Option<QueryState> {
        self.receiver
            .wait_for(predicate)
            .await
            .ok()
            .map(|state| state.clone())
    }

    /// Wait for a settled state that carries data.
    pub async fn settled(&mut self) -> Option<QueryState> {
        self.wait_for(|state| state.data.is_some() && !state.is_fetching())
            .await
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.cache.release(&self.key, self.entry_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn key(id: &str) -> CacheKey {
        CacheKey::new("teams", "detail").id(id)
    }

    /// Fetcher returning `{"version": n}` where n counts calls.
    fn counting_fetcher(calls: Arc<AtomicUsize>) -> Fetcher {
        Arc::new(move || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, ApiError>(json!({ "version": n }))
            }
            .boxed()
        })
    }

    /// Like `counting_fetcher`, but call number `blocked` waits on `gate`.
    fn gated_fetcher(calls: Arc<AtomicUsize>, gate: Arc<Notify>, blocked: usize) -> Fetcher {
        Arc::new(move || {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n == blocked {
                    gate.notified().await;
                }
                Ok::<_, ApiError>(json!({ "version": n }))
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_fresh_entry_served_without_request() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls));

        let first = cache
            .fetch(&key("t1"), FetchOptions::default(), Arc::clone(&fetcher))
            .await
            .unwrap();
        let second = cache.fetch(&key("t1"), FetchOptions::default(), fetcher).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_one_request() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let fetcher: Fetcher = {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            Arc::new(move || {
                let calls = Arc::clone(&calls);
                let gate = Arc::clone(&gate);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok::<_, ApiError>(json!({ "id": "t1", "name": "Core" }))
                }
                .boxed()
            })
        };

        let k = key("t1");
        let a = cache.fetch(&k, FetchOptions::default(), Arc::clone(&fetcher));
        let b = cache.fetch(&k, FetchOptions::default(), Arc::clone(&fetcher));
        let release = async {
            tokio::task::yield_now().await;
            gate.notify_one();
        };
        let (a, b, _) = tokio::join!(a, b, release);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a["name"], "Core");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_served_while_revalidating() {
        let cache = QueryCache::new(Duration::from_secs(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls));

        cache.fetch(&key("t1"), FetchOptions::default(), Arc::clone(&fetcher)).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        let stale = cache
            .fetch(&key("t1"), FetchOptions::default(), Arc::clone(&fetcher))
            .await
            .unwrap();
        assert_eq!(stale["version"], 1);

        // Let the background refresh finish.
        while cache.snapshot(&key("t1")).unwrap().is_fetching() {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let fresh = cache.fetch(&key("t1"), FetchOptions::default(), fetcher).await.unwrap();
        assert_eq!(fresh["version"], 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_forced_read_goes_to_network() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls));

        cache.fetch(&key("t1"), FetchOptions::default(), Arc::clone(&fetcher)).await.unwrap();
        let forced = FetchOptions {
            force: true,
            ..Default::default()
        };
        let value = cache.fetch(&key("t1"), forced, fetcher).await.unwrap();
        assert_eq!(value["version"], 2);
    }

    #[tokio::test]
    async fn test_invalidated_unobserved_entry_refetched_on_next_read() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls));

        cache.fetch(&key("t1"), FetchOptions::default(), Arc::clone(&fetcher)).await.unwrap();
        assert_eq!(cache.invalidate(&Scope::of(&["teams"])), 1);
        assert!(cache.is_invalidated(&key("t1")));
        // Inactive: nothing fetched yet.
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let value = cache.fetch(&key("t1"), FetchOptions::default(), fetcher).await.unwrap();
        assert_eq!(value["version"], 2);
        assert!(!cache.is_invalidated(&key("t1")));
    }

    #[tokio::test]
    async fn test_invalidation_refetches_observed_entries() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls));

        let mut observer = cache.observe(&key("t1"), FetchOptions::default(), Arc::clone(&fetcher));
        let state = observer.settled().await.unwrap();
        assert_eq!(state.data.unwrap()["version"], 1);
        assert_eq!(cache.observer_count(&key("t1")), 1);

        cache.invalidate(&Scope::of(&["teams", "detail"]));
        let state = observer
            .wait_for(|s| s.data.as_ref().is_some_and(|d| d["version"] == 2))
            .await
            .unwrap();
        assert!(!state.invalidated);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        drop(observer);
        assert_eq!(cache.observer_count(&key("t1")), 0);
    }

    #[tokio::test]
    async fn test_overlapping_invalidations_share_one_refetch() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls));

        let mut observer = cache.observe(&key("t1"), FetchOptions::default(), fetcher);
        observer.settled().await.unwrap();

        cache.invalidate(&Scope::of(&["teams"]));
        cache.invalidate(&Scope::of(&["teams", "detail"]));
        let state = observer
            .wait_for(|s| !s.invalidated && !s.is_fetching())
            .await
            .unwrap();

        assert_eq!(state.data.unwrap()["version"], 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reader_of_replaced_request_joins_replacement() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        // The second request never finishes on its own.
        let fetcher = gated_fetcher(Arc::clone(&calls), Arc::new(Notify::new()), 2);

        let mut observer = cache.observe(&key("t1"), FetchOptions::default(), Arc::clone(&fetcher));
        observer.settled().await.unwrap();

        let reader = {
            let cache = cache.clone();
            let forced = FetchOptions {
                force: true,
                ..Default::default()
            };
            tokio::spawn(async move { cache.fetch(&key("t1"), forced, fetcher).await })
        };
        while calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }

        cache.invalidate(&Scope::of(&["teams"]));
        let value = reader.await.unwrap().unwrap();
        assert_eq!(value["version"], 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        drop(observer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_read_still_completes() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let fetcher = gated_fetcher(Arc::clone(&calls), Arc::clone(&gate), 1);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cache.fetch(&key("t1"), FetchOptions::default(), Arc::clone(&fetcher)),
        )
        .await;
        assert!(abandoned.is_err());

        gate.notify_one();
        let mut observer = cache.observe(&key("t1"), FetchOptions::default(), fetcher);
        let state = tokio::time::timeout(Duration::from_secs(60), observer.settled())
            .await
            .expect("observer settles")
            .unwrap();

        assert_eq!(state.data.unwrap()["version"], 1);
        assert_eq!(state.status, FetchStatus::Idle);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidation_outside_scope_leaves_entry_alone() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls));

        cache.fetch(&key("t1"), FetchOptions::default(), Arc::clone(&fetcher)).await.unwrap();
        assert_eq!(cache.invalidate(&Scope::of(&["projects"])), 0);
        assert_eq!(cache.invalidate(&Scope::of(&["teams", "detail"]).id("t2")), 0);
        assert!(!cache.is_invalidated(&key("t1")));
    }

    #[tokio::test]
    async fn test_superseded_response_is_discarded() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let slow_gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));

        // First call is slow and returns old data; later calls are immediate.
        let fetcher: Fetcher = {
            let slow_gate = Arc::clone(&slow_gate);
            let calls = Arc::clone(&calls);
            Arc::new(move || {
                let slow_gate = Arc::clone(&slow_gate);
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        slow_gate.notified().await;
                        Ok::<_, ApiError>(json!({ "members": ["ada"] }))
                    } else {
                        Ok(json!({ "members": ["ada", "grace"] }))
                    }
                }
                .boxed()
            })
        };

        let slow = {
            let cache = cache.clone();
            let fetcher = Arc::clone(&fetcher);
            tokio::spawn(
                async move { cache.fetch(&key("t1"), FetchOptions::default(), fetcher).await },
            )
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // A write lands while the first request is outstanding.
        cache.invalidate(&Scope::of(&["teams"]));
        let newer = cache.fetch(&key("t1"), FetchOptions::default(), fetcher).await.unwrap();
        assert_eq!(newer["members"].as_array().unwrap().len(), 2);

        slow_gate.notify_one();
        let old = slow.await.unwrap().unwrap();
        assert_eq!(old["members"].as_array().unwrap().len(), 1);

        let state = cache.snapshot(&key("t1")).unwrap();
        assert_eq!(state.data.unwrap()["members"].as_array().unwrap().len(), 2);
        assert!(!state.invalidated);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_last_value() {
        let cache = QueryCache::new(Duration::from_secs(30));
        cache
            .fetch(
                &key("t1"),
                FetchOptions::default(),
                Arc::new(|| async { Ok::<_, ApiError>(json!({ "name": "Core" })) }.boxed()),
            )
            .await
            .unwrap();

        let failing: Fetcher =
            Arc::new(|| {
            async { Err::<Value, _>(ApiError::ServerError(r#"{"message":"down"}"#.into())) }.boxed()
        });
        let forced = FetchOptions {
            force: true,
            ..Default::default()
        };
        let err = cache.fetch(&key("t1"), forced, failing).await.unwrap_err();
        assert!(matches!(*err, ApiError::ServerError(_)));

        let state = cache.snapshot(&key("t1")).unwrap();
        assert_eq!(state.data.unwrap()["name"], "Core");
        assert_eq!(state.error.as_deref(), Some("down"));
    }

    #[tokio::test]
    async fn test_remove_scope_drops_entries_and_notifies_observers() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls));

        let mut observer = cache.observe(&key("t1"), FetchOptions::default(), Arc::clone(&fetcher));
        observer.settled().await.unwrap();
        cache.fetch(&key("t2"), FetchOptions::default(), fetcher).await.unwrap();

        assert_eq!(cache.remove_scope(&Scope::of(&["teams", "detail"]).id("t1")), 1);
        assert!(!cache.contains(&key("t1")));
        assert!(cache.contains(&key("t2")));
        assert!(observer.current().data.is_none());
    }

    #[tokio::test]
    async fn test_stale_observer_release_does_not_touch_new_entry() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls));

        let mut old = cache.observe(&key("t1"), FetchOptions::default(), Arc::clone(&fetcher));
        old.settled().await.unwrap();
        cache.remove(&key("t1"));

        let mut current = cache.observe(&key("t1"), FetchOptions::default(), fetcher);
        current.settled().await.unwrap();
        drop(old);
        assert_eq!(cache.observer_count(&key("t1")), 1);
    }

    #[tokio::test]
    async fn test_clear_empties_cache() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls));
        cache.fetch(&key("t1"), FetchOptions::default(), Arc::clone(&fetcher)).await.unwrap();
        cache.fetch(&key("t2"), FetchOptions::default(), fetcher).await.unwrap();
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_response_for_removed_entry_is_not_resurrected() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let gate = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));

        let slow: Fetcher = {
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            Arc::new(move || {
                let gate = Arc::clone(&gate);
                started.fetch_add(1, Ordering::SeqCst);
                async move {
                    gate.notified().await;
                    Ok::<_, ApiError>(json!({ "name": "Deleted team" }))
                }
                .boxed()
            })
        };

        let pending = {
            let cache = cache.clone();
            tokio::spawn(
                async move { cache.fetch(&key("t1"), FetchOptions::default(), slow).await },
            )
        };
        while started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        cache.remove(&key("t1"));
        // A new entry appears under the same key before the old response lands.
        let replacement: Fetcher =
            Arc::new(|| async { Ok::<_, ApiError>(json!({ "name": "Replacement" })) }.boxed());
        cache.fetch(&key("t1"), FetchOptions::default(), replacement).await.unwrap();

        gate.notify_one();
        pending.await.unwrap().unwrap();

        let state = cache.snapshot(&key("t1")).unwrap();
        assert_eq!(state.data.unwrap()["name"], "Replacement");
    }

    #[test]
    fn test_query_state_age_display_never() {
        assert_eq!(QueryState::default().age_display(), "never");
    }
}
