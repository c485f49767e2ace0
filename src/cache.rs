use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::types::{MutationRecord, QueryState};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CacheError {
    #[error("query not found: {0}")]
    QueryNotFound(String),
    #[error("no query function registered for {0}")]
    NoQueryFn(String),
    #[error("fetch cancelled")]
    Cancelled { silent: bool },
    #[error("fetch failed: {0}")]
    Fetch(String),
}

impl CacheError {
    /// Silent cancellations are expected outcomes, not failures.
    pub fn is_silent(&self) -> bool {
        matches!(self, CacheError::Cancelled { silent: true })
    }
}

/// Plain-data fetch options. The query function itself stays with the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub query_key: Vec<Value>,
    pub retry: u32,
    pub stale_time_ms: i64,
    pub gc_time_ms: i64,
    pub meta: Option<Value>,
}

impl QueryOptions {
    pub fn new(query_key: Vec<Value>) -> Self {
        Self {
            query_key,
            retry: 3,
            stale_time_ms: 0,
            gc_time_ms: 5 * 60 * 1000,
            meta: None,
        }
    }
}

/// Point-in-time view of one live query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEntry {
    pub hash: String,
    pub key: Vec<Value>,
    pub state: QueryState,
    pub options: QueryOptions,
    pub observer_count: usize,
}

/// What drives a fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchSource {
    /// The query's own options.
    Current,
    /// Explicit options, e.g. ones stashed before a forced state.
    Options(QueryOptions),
    /// A fetch that never settles on its own; only `cancel` ends it.
    Suspended,
}

pub type CacheListener = Arc<dyn Fn() + Send + Sync>;

/// Handle for a change listener. Dropping it unsubscribes.
pub struct CacheSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl CacheSubscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for CacheSubscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

pub trait QueryCache: Send + Sync + 'static {
    /// Live queries in cache order.
    fn queries(&self) -> Vec<QueryEntry>;

    fn mutations(&self) -> Vec<MutationRecord>;

    /// Registers a listener fired after any query or mutation is added,
    /// removed, or changes state.
    fn subscribe(&self, listener: CacheListener) -> CacheSubscription;

    fn query(&self, hash: &str) -> Option<QueryEntry>;

    fn set_query_data(&self, hash: &str, data: Value, updated_at: i64) -> Result<(), CacheError>;

    fn set_query_state(&self, hash: &str, state: QueryState) -> Result<(), CacheError>;

    /// Starts a fetch immediately. The returned future resolves when it settles.
    fn fetch(&self, hash: &str, source: FetchSource) -> BoxFuture<'static, Result<(), CacheError>>;

    /// Cancels the in-flight fetch for `hash`, if any. A silent cancel leaves
    /// the query state untouched.
    fn cancel(&self, hash: &str, silent: bool);

    /// Resets to the initial state, then refetches if the query is observed.
    fn reset_query(&self, hash: &str) -> BoxFuture<'static, Result<(), CacheError>>;

    fn remove_query(&self, hash: &str);

    /// Marks stale, then refetches if the query is observed.
    fn invalidate_query(&self, hash: &str) -> BoxFuture<'static, Result<(), CacheError>>;

    fn clear_queries(&self);

    fn clear_mutations(&self);

    fn is_online(&self) -> bool;

    fn set_online(&self, online: bool);
}
