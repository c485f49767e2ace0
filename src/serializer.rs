use crate::cache::QueryCache;
use crate::types::{CacheSnapshot, QueryRecord};

/// Produces an immutable snapshot of the live cache. Holds no references past
/// the call.
pub fn dehydrate(cache: &dyn QueryCache) -> CacheSnapshot {
    let queries = cache
        .queries()
        .into_iter()
        .map(|entry| QueryRecord {
            query_hash: entry.hash,
            query_key: entry.key,
            state: entry.state,
            observer_count: entry.observer_count,
        })
        .collect();

    CacheSnapshot {
        queries,
        mutations: cache.mutations(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::FutureExt;
    use serde_json::json;

    use super::*;
    use crate::memory_cache::{InMemoryQueryCache, QueryFn};
    use crate::types::{MutationRecord, MutationState, QueryStatus};

    fn noop() -> QueryFn {
        Arc::new(|_| async { Ok(json!(null)) }.boxed())
    }

    #[test]
    fn snapshot_round_trips_records_in_order() {
        let cache = InMemoryQueryCache::new();
        let keys = [json!("users"), json!("todos"), json!("settings")];
        let hashes: Vec<String> = keys
            .iter()
            .map(|k| cache.add_query(vec![k.clone()], noop()))
            .collect();
        cache.set_observer_count(&hashes[1], 2).unwrap();

        let snapshot = dehydrate(&cache);
        let wire = serde_json::to_string(&snapshot).unwrap();
        let restored: CacheSnapshot = serde_json::from_str(&wire).unwrap();

        assert_eq!(restored.queries.len(), 3);
        for (i, record) in restored.queries.iter().enumerate() {
            assert_eq!(record.query_hash, hashes[i]);
            assert_eq!(record.query_key, vec![keys[i].clone()]);
            assert_eq!(record.state.status, QueryStatus::Pending);
        }
        assert_eq!(restored.queries[1].observer_count, 2);
    }

    #[test]
    fn snapshot_includes_mutations() {
        let cache = InMemoryQueryCache::new();
        cache.add_mutation(MutationRecord {
            mutation_id: 1,
            mutation_key: Some(vec![json!("addTodo")]),
            state: MutationState {
                status: QueryStatus::Success,
                variables: Some(json!({"title": "x"})),
                data: None,
                error: None,
                submitted_at: 10,
            },
        });

        let snapshot = dehydrate(&cache);
        assert_eq!(snapshot.mutations.len(), 1);
        assert_eq!(snapshot.mutations[0].mutation_id, 1);
    }
}
