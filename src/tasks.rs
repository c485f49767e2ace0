use std::fmt::Display;
use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::CacheError;

/// Spawns a fire-and-forget task. A failure is logged under `label` and never
/// reaches the caller.
pub fn spawn_detached<F, E>(label: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            warn!(task = label, error = %e, "detached task failed");
        }
    })
}

/// Like [`spawn_detached`] for cache fetches: silent cancellations are
/// expected and only logged at debug.
pub fn spawn_fetch<F>(label: &'static str, query_hash: String, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), CacheError>> + Send + 'static,
{
    tokio::spawn(async move {
        match fut.await {
            Ok(()) => {}
            Err(e) if e.is_silent() => debug!(task = label, %query_hash, "fetch cancelled silently"),
            Err(e) => warn!(task = label, %query_hash, error = %e, "fetch failed"),
        }
    })
}
