use super::{AuthState, CredentialBackend};
use crate::cache::CacheService;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;

const KEY_PREFIX: &str = "auth-state:";

/// Credential backend over the injected cache service. Used when the
/// deployment keeps sessions in a shared cache keyspace instead of the
/// database or filesystem.
pub struct CacheAuthBackend {
    cache: CacheService,
}

impl CacheAuthBackend {
    pub fn new(cache: CacheService) -> Self {
        Self { cache }
    }

    fn key_for(instance_key: &str) -> String {
        format!("{KEY_PREFIX}{instance_key}")
    }
}

#[async_trait]
impl CredentialBackend for CacheAuthBackend {
    async fn load(&self, instance_key: &str) -> StoreResult<Option<AuthState>> {
        match self.cache.get(&Self::key_for(instance_key)).await {
            Some(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn save(&self, instance_key: &str, state: &AuthState) -> StoreResult<()> {
        let data =
            serde_json::to_vec(state).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.cache.set(&Self::key_for(instance_key), data).await;
        Ok(())
    }

    async fn delete(&self, instance_key: &str) -> StoreResult<()> {
        self.cache.delete(&Self::key_for(instance_key)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_through_cache_service() {
        let backend = CacheAuthBackend::new(CacheService::default());

        assert!(backend.load("a").await.unwrap().is_none());

        let mut state = AuthState::bootstrap();
        state.creds.registered = true;
        backend.save("a", &state).await.unwrap();

        let loaded = backend.load("a").await.unwrap().unwrap();
        assert!(loaded.creds.registered);

        backend.delete("a").await.unwrap();
        assert!(backend.load("a").await.unwrap().is_none());
    }
}
