mod cachestore;
mod filestore;
mod sqlite;

pub use cachestore::CacheAuthBackend;
pub use filestore::FileAuthBackend;
pub use sqlite::DatabaseAuthBackend;

use crate::cache::CacheService;
use crate::config::EngineConfig;
use crate::error::{EngineError, StoreResult};
use crate::store::sqlite_store::SqliteStore;
use crate::types::jid::Jid;
use async_trait::async_trait;
use log::{debug, error};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{Duration, sleep};

/// Account credentials for one instance. The transport owns the meaning
/// of the key material; the engine only persists it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Creds {
    pub registration_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<Jid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_pre_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adv_secret: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<serde_json::Value>,
    #[serde(default)]
    pub registered: bool,
}

impl Creds {
    /// Fresh bootstrap credentials for a first-ever connect.
    pub fn bootstrap() -> Self {
        Self {
            registration_id: rand::rng().random(),
            me: None,
            push_name: None,
            noise_key: None,
            identity_key: None,
            signed_pre_key: None,
            adv_secret: None,
            account: None,
            registered: false,
        }
    }
}

impl Default for Creds {
    fn default() -> Self {
        Self::bootstrap()
    }
}

/// Categories of cryptographic key material the transport stores through
/// us. Closed set: backends persist by category name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyCategory {
    PreKey,
    Session,
    SenderKey,
    AppStateSyncKey,
    AppStateVersion,
}

impl KeyCategory {
    pub const ALL: [KeyCategory; 5] = [
        Self::PreKey,
        Self::Session,
        Self::SenderKey,
        Self::AppStateSyncKey,
        Self::AppStateVersion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreKey => "pre-key",
            Self::Session => "session",
            Self::SenderKey => "sender-key",
            Self::AppStateSyncKey => "app-state-sync-key",
            Self::AppStateVersion => "app-state-version",
        }
    }
}

pub type SignalKeyMap = HashMap<KeyCategory, HashMap<String, Vec<u8>>>;

/// Complete persisted auth state: credentials plus signal key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthState {
    pub creds: Creds,
    #[serde(default)]
    pub keys: SignalKeyMap,
}

impl AuthState {
    pub fn bootstrap() -> Self {
        Self {
            creds: Creds::bootstrap(),
            keys: SignalKeyMap::new(),
        }
    }

    pub fn get_key(&self, category: KeyCategory, id: &str) -> Option<&Vec<u8>> {
        self.keys.get(&category).and_then(|m| m.get(id))
    }

    pub fn set_key(&mut self, category: KeyCategory, id: &str, value: Vec<u8>) {
        self.keys
            .entry(category)
            .or_default()
            .insert(id.to_string(), value);
    }

    pub fn remove_key(&mut self, category: KeyCategory, id: &str) {
        if let Some(map) = self.keys.get_mut(&category) {
            map.remove(id);
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::bootstrap()
    }
}

/// One credential persistence strategy. All backends honor the same
/// semantics: idempotent load, atomic save, absence-tolerant load.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    async fn load(&self, instance_key: &str) -> StoreResult<Option<AuthState>>;
    async fn save(&self, instance_key: &str, state: &AuthState) -> StoreResult<()>;
    async fn delete(&self, instance_key: &str) -> StoreResult<()>;
}

/// Picks the backend for an instance. Priority: externally supplied
/// provider, then cache service, then database, then local files. The
/// choice is made once per connect and never re-evaluated mid-session.
pub fn select_backend(
    config: &EngineConfig,
    provider: Option<Arc<dyn CredentialBackend>>,
    cache: &CacheService,
    database: Option<Arc<SqliteStore>>,
) -> Arc<dyn CredentialBackend> {
    if let Some(provider) = provider {
        debug!(target: "Auth", "Using externally supplied credential provider");
        return provider;
    }

    if config.cache.enabled && config.cache.save_credentials {
        debug!(target: "Auth", "Using cache-service credential backend");
        return Arc::new(CacheAuthBackend::new(cache.clone()));
    }

    if config.database.enabled
        && config.database.save.credentials
        && let Some(store) = database
    {
        debug!(target: "Auth", "Using database credential backend");
        return Arc::new(DatabaseAuthBackend::new(store));
    }

    debug!(target: "Auth", "Using file credential backend");
    Arc::new(FileAuthBackend::new(config.auth_dir.clone()))
}

/// Per-instance handle over the chosen backend. Mutations mark the state
/// dirty; a single background saver serializes writes so saves for one
/// instance never overlap.
pub struct AuthStateStore {
    instance_key: String,
    backend: Arc<dyn CredentialBackend>,
    state: Arc<RwLock<AuthState>>,
    dirty: Arc<Mutex<bool>>,
    save_notify: Arc<Notify>,
}

impl AuthStateStore {
    /// Loads existing state or bootstraps an empty one. A first-ever
    /// connect is not an error.
    pub async fn open(
        instance_key: &str,
        backend: Arc<dyn CredentialBackend>,
    ) -> Result<Arc<Self>, EngineError> {
        let state = match backend
            .load(instance_key)
            .await
            .map_err(EngineError::CredentialLoad)?
        {
            Some(state) => {
                debug!(
                    target: "Auth",
                    "Loaded existing auth state for '{instance_key}' (registered: {})",
                    state.creds.registered
                );
                state
            }
            None => {
                debug!(target: "Auth", "No auth state for '{instance_key}', bootstrapping");
                AuthState::bootstrap()
            }
        };

        Ok(Arc::new(Self {
            instance_key: instance_key.to_string(),
            backend,
            state: Arc::new(RwLock::new(state)),
            dirty: Arc::new(Mutex::new(false)),
            save_notify: Arc::new(Notify::new()),
        }))
    }

    pub fn instance_key(&self) -> &str {
        &self.instance_key
    }

    pub async fn snapshot(&self) -> AuthState {
        self.state.read().await.clone()
    }

    /// Applies a mutation and marks the state dirty for the saver.
    pub async fn modify<F, R>(&self, modifier: F) -> R
    where
        F: FnOnce(&mut AuthState) -> R,
    {
        let mut guard = self.state.write().await;
        let result = modifier(&mut guard);
        drop(guard);

        *self.dirty.lock().await = true;
        self.save_notify.notify_one();
        result
    }

    /// Flushes the state if dirty. The dirty guard is held across the
    /// backend write, so only one save per instance is ever in flight.
    pub async fn flush(&self) -> StoreResult<()> {
        let mut dirty_guard = self.dirty.lock().await;
        if *dirty_guard {
            let snapshot = self.state.read().await.clone();
            self.backend.save(&self.instance_key, &snapshot).await?;
            *dirty_guard = false;
            debug!(target: "Auth", "Auth state saved for '{}'", self.instance_key);
        }
        Ok(())
    }

    pub async fn erase(&self) -> StoreResult<()> {
        self.backend.delete(&self.instance_key).await?;
        *self.state.write().await = AuthState::bootstrap();
        *self.dirty.lock().await = false;
        Ok(())
    }

    /// Background saver: waits for a mutation signal (or the interval)
    /// and flushes. Exits on shutdown.
    pub fn run_background_saver(self: Arc<Self>, interval: Duration, shutdown: Arc<Notify>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.notified() => {
                        if let Err(e) = self.flush().await {
                            error!(target: "Auth", "Final auth state flush failed: {e}");
                        }
                        return;
                    }
                    _ = self.save_notify.notified() => {}
                    _ = sleep(interval) => {}
                }

                if let Err(e) = self.flush().await {
                    error!(target: "Auth", "Error saving auth state in background: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_bootstraps_when_backend_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn CredentialBackend> =
            Arc::new(FileAuthBackend::new(dir.path().to_path_buf()));

        let store = AuthStateStore::open("fresh", backend).await.unwrap();
        let state = store.snapshot().await;
        assert!(!state.creds.registered);
        assert!(state.creds.me.is_none());
        assert!(state.keys.is_empty());
    }

    #[tokio::test]
    async fn modify_marks_dirty_and_flush_persists() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn CredentialBackend> =
            Arc::new(FileAuthBackend::new(dir.path().to_path_buf()));

        let store = AuthStateStore::open("inst", backend.clone()).await.unwrap();
        store
            .modify(|state| {
                state.creds.registered = true;
                state.set_key(KeyCategory::Session, "peer@s.whatsapp.net", vec![9, 9]);
            })
            .await;
        store.flush().await.unwrap();

        let reloaded = backend.load("inst").await.unwrap().unwrap();
        assert!(reloaded.creds.registered);
        assert_eq!(
            reloaded.get_key(KeyCategory::Session, "peer@s.whatsapp.net"),
            Some(&vec![9, 9])
        );
    }

    #[tokio::test]
    async fn flush_without_mutation_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn CredentialBackend> =
            Arc::new(FileAuthBackend::new(dir.path().to_path_buf()));

        let store = AuthStateStore::open("inst", backend.clone()).await.unwrap();
        store.flush().await.unwrap();
        assert!(backend.load("inst").await.unwrap().is_none());
    }
}
