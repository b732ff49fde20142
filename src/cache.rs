use moka::future::Cache;
use std::time::Duration;

/// Process-wide key-value cache, constructed once at startup and injected
/// into every instance's engine. Backs the cache credential backend and
/// any other short-lived shared state.
#[derive(Clone)]
pub struct CacheService {
    entries: Cache<String, Vec<u8>>,
}

impl CacheService {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(100_000)
                .build(),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).await
    }

    pub async fn set(&self, key: &str, value: Vec<u8>) {
        self.entries.insert(key.to_string(), value).await;
    }

    pub async fn delete(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.as_ref().clone())
            .collect()
    }
}

impl Default for CacheService {
    fn default() -> Self {
        Self::new(Duration::from_secs(6 * 3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let cache = CacheService::default();
        cache.set("auth:a", vec![1, 2, 3]).await;
        assert_eq!(cache.get("auth:a").await, Some(vec![1, 2, 3]));

        cache.delete("auth:a").await;
        assert_eq!(cache.get("auth:a").await, None);
    }

    #[tokio::test]
    async fn prefix_listing_only_matches_prefix() {
        let cache = CacheService::default();
        cache.set("auth:a", vec![1]).await;
        cache.set("auth:b", vec![2]).await;
        cache.set("other:c", vec![3]).await;
        // moka applies writes asynchronously; force the pending ops through.
        cache.entries.run_pending_tasks().await;

        let mut keys = cache.keys_with_prefix("auth:");
        keys.sort();
        assert_eq!(keys, vec!["auth:a".to_string(), "auth:b".to_string()]);
    }
}
