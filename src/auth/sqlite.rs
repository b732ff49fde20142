use super::{AuthState, CredentialBackend};
use crate::error::StoreResult;
use crate::store::sqlite_store::SqliteStore;
use async_trait::async_trait;
use std::sync::Arc;

/// Credential backend over the relational store: one row per instance
/// holding the encoded auth state. The row upsert is a single statement,
/// so a concurrent load sees either the old or the new state, never a
/// partial one.
pub struct DatabaseAuthBackend {
    store: Arc<SqliteStore>,
}

impl DatabaseAuthBackend {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CredentialBackend for DatabaseAuthBackend {
    async fn load(&self, instance_key: &str) -> StoreResult<Option<AuthState>> {
        self.store.load_auth_state(instance_key).await
    }

    async fn save(&self, instance_key: &str, state: &AuthState) -> StoreResult<()> {
        self.store.save_auth_state(instance_key, state).await
    }

    async fn delete(&self, instance_key: &str) -> StoreResult<()> {
        self.store.delete_auth_state(instance_key).await
    }
}
