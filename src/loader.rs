use std::collections::HashMap;
use std::hash::Hash;

use async_trait::async_trait;

use crate::error::Result;

/// One grouped backing-store lookup for a set of keys.
///
/// Implementations must return a map keyed by the requested keys; rows may
/// come back from the store in any order, and keys with no backing row are
/// simply left out of the map.
#[async_trait]
pub trait BatchFetch: Send + Sync {
    type Key: Eq + Hash + Clone + Send + Sync;
    type Value: Send + Sync;

    async fn fetch(&self, keys: &[Self::Key]) -> Result<HashMap<Self::Key, Self::Value>>;
}

/// Request-scoped batching loader.
///
/// Built fresh for each response assembly and discarded with it. Keys are
/// queued with [`defer`](Batcher::defer), resolved in one backing fetch by
/// [`flush`](Batcher::flush), and read back with [`get`](Batcher::get).
/// Results are cached for the lifetime of the batcher, so a key is fetched
/// at most once no matter how many times it is deferred.
pub struct Batcher<F: BatchFetch> {
    fetcher: F,
    cache: HashMap<F::Key, Option<F::Value>>,
    pending: Vec<F::Key>,
    fetches: usize,
}

impl<F: BatchFetch> Batcher<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            cache: HashMap::new(),
            pending: Vec::new(),
            fetches: 0,
        }
    }

    /// Queue a key for the next flush. Duplicates of already-cached or
    /// already-pending keys are dropped.
    pub fn defer(&mut self, key: F::Key) {
        if self.cache.contains_key(&key) || self.pending.contains(&key) {
            return;
        }
        self.pending.push(key);
    }

    /// Resolve every pending key with a single backing fetch.
    ///
    /// A key the store has no row for is cached as absent rather than
    /// treated as an error. A failed fetch fails every pending key: the
    /// error is returned and nothing is cached.
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let keys = std::mem::take(&mut self.pending);
        tracing::debug!(keys = keys.len(), "flushing batched fetch");

        let mut fetched = self.fetcher.fetch(&keys).await?;
        self.fetches += 1;

        for key in keys {
            let value = fetched.remove(&key);
            self.cache.insert(key, value);
        }

        Ok(())
    }

    /// Resolved value for a key, or `None` if the store has no row for it.
    /// Only meaningful after the key has been deferred and flushed.
    pub fn get(&self, key: &F::Key) -> Option<&F::Value> {
        self.cache.get(key).and_then(|slot| slot.as_ref())
    }

    /// Whether a key has been resolved (present or absent) by a flush.
    pub fn resolved(&self, key: &F::Key) -> bool {
        self.cache.contains_key(key)
    }

    /// Number of backing fetches issued so far.
    pub fn fetches(&self) -> usize {
        self.fetches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MapFetcher {
        rows: HashMap<u32, String>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl MapFetcher {
        fn new(rows: &[(u32, &str)]) -> Self {
            Self {
                rows: rows
                    .iter()
                    .map(|(k, v)| (*k, v.to_string()))
                    .collect(),
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl BatchFetch for MapFetcher {
        type Key = u32;
        type Value = String;

        async fn fetch(&self, keys: &[u32]) -> Result<HashMap<u32, String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AppError::Internal("backing store down".to_string()));
            }
            Ok(keys
                .iter()
                .filter_map(|k| self.rows.get(k).map(|v| (*k, v.clone())))
                .collect())
        }
    }

    #[tokio::test]
    async fn duplicate_keys_fetch_once() {
        let mut batcher = Batcher::new(MapFetcher::new(&[(1, "alice")]));
        batcher.defer(1);
        batcher.defer(1);
        batcher.flush().await.unwrap();

        assert_eq!(batcher.fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(batcher.get(&1), Some(&"alice".to_string()));
    }

    #[tokio::test]
    async fn distinct_keys_share_one_fetch() {
        let mut batcher = Batcher::new(MapFetcher::new(&[(1, "alice"), (2, "bob"), (3, "carol")]));
        for key in [1, 2, 3] {
            batcher.defer(key);
        }
        batcher.flush().await.unwrap();

        assert_eq!(batcher.fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(batcher.get(&1), Some(&"alice".to_string()));
        assert_eq!(batcher.get(&2), Some(&"bob".to_string()));
        assert_eq!(batcher.get(&3), Some(&"carol".to_string()));
    }

    #[tokio::test]
    async fn missing_key_resolves_absent() {
        let mut batcher = Batcher::new(MapFetcher::new(&[(1, "alice")]));
        batcher.defer(99);
        batcher.flush().await.unwrap();

        assert!(batcher.resolved(&99));
        assert_eq!(batcher.get(&99), None);
    }

    #[tokio::test]
    async fn cached_key_is_not_refetched() {
        let mut batcher = Batcher::new(MapFetcher::new(&[(1, "alice")]));
        batcher.defer(1);
        batcher.flush().await.unwrap();

        batcher.defer(1);
        batcher.flush().await.unwrap();

        assert_eq!(batcher.fetches(), 1);
    }

    #[tokio::test]
    async fn empty_flush_skips_backing_store() {
        let mut batcher = Batcher::new(MapFetcher::new(&[]));
        batcher.flush().await.unwrap();

        assert_eq!(batcher.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fetch_failure_fails_the_whole_batch() {
        let mut fetcher = MapFetcher::new(&[(1, "alice")]);
        fetcher.fail = true;
        let mut batcher = Batcher::new(fetcher);
        batcher.defer(1);
        batcher.defer(2);

        assert!(batcher.flush().await.is_err());
        assert!(!batcher.resolved(&1));
        assert!(!batcher.resolved(&2));
    }
}
