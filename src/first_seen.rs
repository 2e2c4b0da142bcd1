//! Two-tier first-seen set: a bounded in-memory recency
//! cache in front of a durable `sled` tree, so a restart doesn't replay
//! "new name" events for names already published.
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::metrics::Metrics;

pub struct FirstSeenSet {
    recent: Mutex<LruCache<String, ()>>,
    store: sled::Tree,
    metrics: Metrics,
}

impl FirstSeenSet {
    pub fn open(db: &sled::Db, recent_entries: usize, metrics: Metrics) -> Result<Arc<Self>> {
        let store = db.open_tree("qname_seen")?;
        let recent_entries = std::num::NonZeroUsize::new(recent_entries.max(1)).unwrap();
        Ok(Arc::new(FirstSeenSet {
            recent: Mutex::new(LruCache::new(recent_entries)),
            store,
            metrics,
        }))
    }

    /// `seen(name) -> bool`: `true` if this name has been observed before
    /// (in the recency cache or the durable store), `false` the first
    /// time. Race-tolerant: two concurrent workers racing on the same
    /// brand-new name may both observe `false` and both publish; the
    /// durable write is idempotent either way.
    pub async fn seen(&self, name: &str) -> Result<bool> {
        {
            let mut guard = self.recent.lock().await;
            if guard.put(name.to_string(), ()).is_some() {
                self.metrics.first_seen_cache_hits.inc();
                return Ok(true);
            }
            if guard.len() == guard.cap().get() {
                self.metrics.first_seen_cache_evictions.inc();
            }
        }

        let key = name.as_bytes();
        let was_absent = self.store.insert(key, &[] as &[u8])?.is_none();
        Ok(!was_absent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Metrics {
        Metrics::new_for_test()
    }

    #[tokio::test]
    async fn first_occurrence_is_new() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let set = FirstSeenSet::open(&db, 8, metrics()).unwrap();
        assert!(!set.seen("new.example.").await.unwrap());
        assert!(set.seen("new.example.").await.unwrap());
    }

    #[tokio::test]
    async fn durable_store_survives_recency_eviction() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let set = FirstSeenSet::open(&db, 1, metrics()).unwrap();
        assert!(!set.seen("a.example.").await.unwrap());
        // Evicts "a.example." from the tiny recency cache.
        assert!(!set.seen("b.example.").await.unwrap());
        // Still known via the durable tree.
        assert!(set.seen("a.example.").await.unwrap());
    }
}
