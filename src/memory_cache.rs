use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{
    CacheError, CacheListener, CacheSubscription, FetchSource, QueryCache, QueryEntry,
    QueryOptions,
};
use crate::types::{now_millis, FetchStatus, MutationRecord, QueryState, QueryStatus};

pub type QueryFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Stable hash of a query key: canonical JSON, so object field order does not matter.
pub fn hash_query_key(key: &[Value]) -> String {
    serde_jcs::to_string(key)
        .or_else(|_| serde_json::to_string(key))
        .unwrap_or_default()
}

struct Slot {
    order: u64,
    entry: QueryEntry,
}

struct InFlight {
    id: u64,
    token: CancellationToken,
    silent: Arc<AtomicBool>,
}

/// In-process query cache with cancelable fetches and change notifications.
#[derive(Clone)]
pub struct InMemoryQueryCache {
    queries: Arc<DashMap<String, Slot>>,
    query_fns: Arc<DashMap<String, QueryFn>>,
    in_flight: Arc<DashMap<String, InFlight>>,
    mutations: Arc<RwLock<Vec<MutationRecord>>>,
    listeners: Arc<DashMap<u64, CacheListener>>,
    next_id: Arc<AtomicU64>,
    online: Arc<AtomicBool>,
}

impl Default for InMemoryQueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueryCache {
    pub fn new() -> Self {
        Self {
            queries: Arc::new(DashMap::new()),
            query_fns: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            mutations: Arc::new(RwLock::new(Vec::new())),
            listeners: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Adds a query (or replaces its function if the key already exists) and
    /// returns its hash.
    pub fn add_query(&self, key: Vec<Value>, query_fn: QueryFn) -> String {
        let hash = hash_query_key(&key);
        self.query_fns.insert(hash.clone(), query_fn);
        if !self.queries.contains_key(&hash) {
            let order = self.next_id();
            self.queries.insert(
                hash.clone(),
                Slot {
                    order,
                    entry: QueryEntry {
                        hash: hash.clone(),
                        key: key.clone(),
                        state: QueryState::default(),
                        options: QueryOptions::new(key),
                        observer_count: 0,
                    },
                },
            );
            self.notify();
        }
        hash
    }

    pub fn set_observer_count(&self, hash: &str, count: usize) -> Result<(), CacheError> {
        self.update(hash, |entry| entry.observer_count = count)
    }

    pub fn add_mutation(&self, record: MutationRecord) {
        self.mutations.write().push(record);
        self.notify();
    }

    /// Number of fetches that have started and not yet settled or been cancelled.
    pub fn pending_fetches(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_fetching(&self, hash: &str) -> bool {
        self.in_flight.contains_key(hash)
    }

    fn notify(&self) {
        let listeners: Vec<CacheListener> =
            self.listeners.iter().map(|r| r.value().clone()).collect();
        for listener in listeners {
            listener();
        }
    }

    fn update(&self, hash: &str, f: impl FnOnce(&mut QueryEntry)) -> Result<(), CacheError> {
        {
            let mut slot = self
                .queries
                .get_mut(hash)
                .ok_or_else(|| CacheError::QueryNotFound(hash.to_string()))?;
            f(&mut slot.entry);
        }
        self.notify();
        Ok(())
    }

    fn begin_fetch(&self, hash: &str) -> (u64, CancellationToken, Arc<AtomicBool>) {
        let id = self.next_id();
        let token = CancellationToken::new();
        let silent = Arc::new(AtomicBool::new(false));
        let superseded = self.in_flight.insert(
            hash.to_string(),
            InFlight {
                id,
                token: token.clone(),
                silent: silent.clone(),
            },
        );
        if let Some(previous) = superseded {
            previous.silent.store(true, Ordering::SeqCst);
            previous.token.cancel();
        }
        (id, token, silent)
    }

    fn finish_fetch(&self, hash: &str, id: u64) -> bool {
        self.in_flight.remove_if(hash, |_, f| f.id == id).is_some()
    }

    fn settle(&self, hash: &str, result: Result<Value, String>) -> Result<(), CacheError> {
        let now = now_millis();
        match result {
            Ok(data) => {
                let _ = self.update(hash, |entry| {
                    let state = &mut entry.state;
                    state.status = QueryStatus::Success;
                    state.fetch_status = FetchStatus::Idle;
                    state.data = Some(data);
                    state.error = None;
                    state.data_updated_at = now;
                    state.data_update_count += 1;
                    state.fetch_failure_count = 0;
                    state.is_invalidated = false;
                });
                Ok(())
            }
            Err(message) => {
                let _ = self.update(hash, |entry| {
                    let state = &mut entry.state;
                    state.status = QueryStatus::Error;
                    state.fetch_status = FetchStatus::Idle;
                    state.error = Some(Value::String(message.clone()));
                    state.error_updated_at = now;
                    state.error_update_count += 1;
                    state.fetch_failure_count += 1;
                });
                Err(CacheError::Fetch(message))
            }
        }
    }

    fn refetch_if_observed(&self, hash: &str) -> BoxFuture<'static, Result<(), CacheError>> {
        match self.query(hash) {
            Some(entry) if entry.observer_count > 0 => self.fetch(hash, FetchSource::Current),
            Some(_) => future::ready(Ok(())).boxed(),
            None => future::ready(Err(CacheError::QueryNotFound(hash.to_string()))).boxed(),
        }
    }
}

impl QueryCache for InMemoryQueryCache {
    fn queries(&self) -> Vec<QueryEntry> {
        let mut slots: Vec<(u64, QueryEntry)> = self
            .queries
            .iter()
            .map(|r| (r.value().order, r.value().entry.clone()))
            .collect();
        slots.sort_by_key(|(order, _)| *order);
        slots.into_iter().map(|(_, entry)| entry).collect()
    }

    fn mutations(&self) -> Vec<MutationRecord> {
        self.mutations.read().clone()
    }

    fn subscribe(&self, listener: CacheListener) -> CacheSubscription {
        let id = self.next_id();
        self.listeners.insert(id, listener);
        let listeners = self.listeners.clone();
        CacheSubscription::new(move || {
            listeners.remove(&id);
        })
    }

    fn query(&self, hash: &str) -> Option<QueryEntry> {
        self.queries.get(hash).map(|slot| slot.entry.clone())
    }

    fn set_query_data(&self, hash: &str, data: Value, updated_at: i64) -> Result<(), CacheError> {
        self.update(hash, |entry| {
            let state = &mut entry.state;
            state.status = QueryStatus::Success;
            state.data = Some(data);
            state.error = None;
            state.data_updated_at = updated_at;
            state.data_update_count += 1;
            state.is_invalidated = false;
        })
    }

    fn set_query_state(&self, hash: &str, state: QueryState) -> Result<(), CacheError> {
        self.update(hash, |entry| entry.state = state)
    }

    fn fetch(&self, hash: &str, source: FetchSource) -> BoxFuture<'static, Result<(), CacheError>> {
        let Some(entry) = self.query(hash) else {
            return future::ready(Err(CacheError::QueryNotFound(hash.to_string()))).boxed();
        };

        let (id, token, silent) = self.begin_fetch(hash);
        let _ = self.update(hash, |entry| entry.state.fetch_status = FetchStatus::Fetching);

        let cache = self.clone();
        let hash = hash.to_string();

        let query_key = match source {
            FetchSource::Suspended => {
                return async move {
                    token.cancelled().await;
                    cache.finish_fetch(&hash, id);
                    debug!(query_hash = %hash, "suspended fetch cancelled");
                    Err(CacheError::Cancelled {
                        silent: silent.load(Ordering::SeqCst),
                    })
                }
                .boxed();
            }
            FetchSource::Current => entry.options.query_key,
            FetchSource::Options(options) => options.query_key,
        };

        let query_fn = self.query_fns.get(&hash).map(|r| r.value().clone());

        async move {
            let Some(query_fn) = query_fn else {
                cache.finish_fetch(&hash, id);
                let _ = cache.update(&hash, |entry| entry.state.fetch_status = FetchStatus::Idle);
                return Err(CacheError::NoQueryFn(hash));
            };

            tokio::select! {
                _ = token.cancelled() => {
                    cache.finish_fetch(&hash, id);
                    Err(CacheError::Cancelled { silent: silent.load(Ordering::SeqCst) })
                }
                result = query_fn(query_key) => {
                    if !cache.finish_fetch(&hash, id) {
                        // Superseded or cancelled while resolving.
                        return Err(CacheError::Cancelled { silent: true });
                    }
                    cache.settle(&hash, result)
                }
            }
        }
        .boxed()
    }

    fn cancel(&self, hash: &str, silent: bool) {
        if let Some((_, in_flight)) = self.in_flight.remove(hash) {
            in_flight.silent.store(silent, Ordering::SeqCst);
            in_flight.token.cancel();
            if !silent {
                let _ = self.update(hash, |entry| entry.state.fetch_status = FetchStatus::Idle);
            }
        }
    }

    fn reset_query(&self, hash: &str) -> BoxFuture<'static, Result<(), CacheError>> {
        self.cancel(hash, true);
        if let Err(e) = self.update(hash, |entry| entry.state = QueryState::default()) {
            return future::ready(Err(e)).boxed();
        }
        self.refetch_if_observed(hash)
    }

    fn remove_query(&self, hash: &str) {
        self.cancel(hash, true);
        if self.queries.remove(hash).is_some() {
            self.notify();
        }
    }

    fn invalidate_query(&self, hash: &str) -> BoxFuture<'static, Result<(), CacheError>> {
        if let Err(e) = self.update(hash, |entry| entry.state.is_invalidated = true) {
            return future::ready(Err(e)).boxed();
        }
        self.refetch_if_observed(hash)
    }

    fn clear_queries(&self) {
        let hashes: Vec<String> = self.in_flight.iter().map(|r| r.key().clone()).collect();
        for hash in hashes {
            self.cancel(&hash, true);
        }
        self.queries.clear();
        self.notify();
    }

    fn clear_mutations(&self) {
        self.mutations.write().clear();
        self.notify();
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) != online {
            self.notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn constant(value: Value) -> QueryFn {
        Arc::new(move |_| {
            let value = value.clone();
            async move { Ok(value) }.boxed()
        })
    }

    fn failing(message: &'static str) -> QueryFn {
        Arc::new(move |_| async move { Err(message.to_string()) }.boxed())
    }

    #[test]
    fn hash_ignores_object_field_order() {
        let a = hash_query_key(&[json!("todos"), json!({"page": 1, "filter": "done"})]);
        let b = hash_query_key(&[json!("todos"), json!({"filter": "done", "page": 1})]);
        assert_eq!(a, b);
    }

    #[test]
    fn queries_keep_insertion_order() {
        let cache = InMemoryQueryCache::new();
        let h1 = cache.add_query(vec![json!("b")], constant(json!(1)));
        let h2 = cache.add_query(vec![json!("a")], constant(json!(2)));
        let hashes: Vec<String> = cache.queries().into_iter().map(|q| q.hash).collect();
        assert_eq!(hashes, vec![h1, h2]);
    }

    #[test]
    fn listeners_fire_until_unsubscribed() {
        let cache = InMemoryQueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = cache.subscribe(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        cache.add_query(vec![json!("todos")], constant(json!([])));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        cache.clear_queries();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_success_stores_data() {
        let cache = InMemoryQueryCache::new();
        let hash = cache.add_query(vec![json!("todos")], constant(json!(["a"])));

        cache.fetch(&hash, FetchSource::Current).await.unwrap();

        let entry = cache.query(&hash).unwrap();
        assert_eq!(entry.state.status, QueryStatus::Success);
        assert_eq!(entry.state.data, Some(json!(["a"])));
        assert_eq!(entry.state.fetch_status, FetchStatus::Idle);
        assert_eq!(cache.pending_fetches(), 0);
    }

    #[tokio::test]
    async fn fetch_failure_records_error() {
        let cache = InMemoryQueryCache::new();
        let hash = cache.add_query(vec![json!("todos")], failing("boom"));

        let err = cache.fetch(&hash, FetchSource::Current).await.unwrap_err();
        assert_eq!(err, CacheError::Fetch("boom".into()));

        let entry = cache.query(&hash).unwrap();
        assert_eq!(entry.state.status, QueryStatus::Error);
        assert_eq!(entry.state.fetch_failure_count, 1);
    }

    #[tokio::test]
    async fn suspended_fetch_ends_only_on_cancel() {
        let cache = InMemoryQueryCache::new();
        let hash = cache.add_query(vec![json!("todos")], constant(json!(1)));

        let fetch = tokio::spawn(cache.fetch(&hash, FetchSource::Suspended));
        tokio::task::yield_now().await;
        assert!(cache.is_fetching(&hash));

        cache.cancel(&hash, true);
        let result = fetch.await.unwrap();
        assert!(result.unwrap_err().is_silent());
        assert_eq!(cache.pending_fetches(), 0);
    }

    #[tokio::test]
    async fn invalidate_refetches_only_observed_queries() {
        let cache = InMemoryQueryCache::new();
        let hash = cache.add_query(vec![json!("todos")], constant(json!(7)));

        cache.invalidate_query(&hash).await.unwrap();
        assert!(cache.query(&hash).unwrap().state.is_invalidated);

        cache.set_observer_count(&hash, 1).unwrap();
        cache.invalidate_query(&hash).await.unwrap();
        let state = cache.query(&hash).unwrap().state;
        assert!(!state.is_invalidated);
        assert_eq!(state.data, Some(json!(7)));
    }

    #[test]
    fn online_flag_notifies_on_change_only() {
        let cache = InMemoryQueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _sub = cache.subscribe(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        cache.set_online(true);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        cache.set_online(false);
        assert!(!cache.is_online());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
