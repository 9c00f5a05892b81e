use std::future::Future;
use std::time::{Duration, Instant};

use moka::future::Cache;

#[derive(Clone)]
struct Stamped<V> {
    value: V,
    stored_at: Instant,
}

/// In-memory cache where each read decides how old is too old.
///
/// moka bounds capacity and drops anything older than `max_ttl`; the per-call
/// `ttl` passed to [`TtlCache::get_or_set`] is checked against the stored
/// timestamp. Failed fetches are never cached.
pub struct TtlCache<V> {
    inner: Cache<String, Stamped<V>>,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_capacity: u64, max_ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(max_ttl)
                .build(),
        }
    }

    /// Cached value for `key` if it is younger than `ttl`.
    pub async fn get(&self, key: &str, ttl: Duration) -> Option<V> {
        self.inner
            .get(key)
            .await
            .filter(|entry| entry.stored_at.elapsed() < ttl)
            .map(|entry| entry.value)
    }

    pub async fn insert(&self, key: String, value: V) {
        self.inner
            .insert(
                key,
                Stamped {
                    value,
                    stored_at: Instant::now(),
                },
            )
            .await;
    }

    /// Return the cached value when fresh, otherwise run `fetch` and store its result.
    ///
    /// Two concurrent misses on the same key may both call `fetch`.
    pub async fn get_or_set<F, Fut, E>(&self, key: &str, fetch: F, ttl: Duration) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key, ttl).await {
            tracing::trace!(key, "cache hit");
            return Ok(value);
        }

        let value = fetch().await?;
        self.insert(key.to_string(), value.clone()).await;
        Ok(value)
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}
