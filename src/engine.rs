use crate::auth::{AuthStateStore, CredentialBackend};
use crate::cache::CacheService;
use crate::config::{EngineConfig, InstanceSettings};
use crate::dispatch::{BotDispatcher, CrmBridge, WebhookSink};
use crate::error::EngineError;
use crate::group_cache::GroupMetadataCache;
use crate::http::HttpClient;
use crate::protocol::{MessageResolver, ProtocolSession, SessionFactory};
use crate::qrcode::QrArtifact;
use crate::recovery::MessageRecoveryCache;
use crate::store::DataStore;
use crate::store::sqlite_store::SqliteStore;
use crate::types::events::{EventBus, EventName, NormalizedEvent};
use crate::types::jid::Jid;
use crate::types::message::MessageKey;
use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::time::{Duration, interval};

/// Connection state as reported to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Close,
    Connecting,
    QrPending,
    PairingPending,
    Open,
    Refused,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StateConnection {
    pub state: InstanceState,
    pub status_reason: u16,
}

impl Default for StateConnection {
    fn default() -> Self {
        Self {
            state: InstanceState::Close,
            status_reason: 200,
        }
    }
}

/// Own-profile snapshot, resolved when the connection opens.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileSnapshot {
    pub wuid: Option<Jid>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub picture_url: Option<String>,
}

/// Signals emitted to the owning instance registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrySignal {
    /// The account was logged out; the registry should tear the
    /// instance down.
    LoggedOut { instance: String },
    /// Pairing was refused after the QR issuance limit.
    Refused { instance: String },
}

pub struct SessionEngineOptions {
    pub instance_id: String,
    pub instance_name: String,
    pub config: EngineConfig,
    pub settings: InstanceSettings,
    pub factory: Arc<dyn SessionFactory>,
    pub store: Arc<dyn DataStore>,
    pub cache: CacheService,
    pub http_client: Arc<dyn HttpClient>,
    /// Externally supplied credential backend; wins over every
    /// configured backend.
    pub auth_provider: Option<Arc<dyn CredentialBackend>>,
    /// Relational store for the database credential backend.
    pub database: Option<Arc<SqliteStore>>,
    pub crm: Option<Arc<dyn CrmBridge>>,
    pub bot: Option<Arc<dyn BotDispatcher>>,
    pub registry: Option<mpsc::UnboundedSender<RegistrySignal>>,
}

/// Composition root for one tenant instance: wires the lifecycle
/// manager, ingestion pipeline, caches and fan-out together around a
/// protocol session.
pub struct SessionEngine {
    pub(crate) instance_id: String,
    pub(crate) instance_name: String,
    pub(crate) config: EngineConfig,
    pub(crate) settings: RwLock<InstanceSettings>,

    pub(crate) factory: Arc<dyn SessionFactory>,
    pub(crate) store: Arc<dyn DataStore>,
    pub(crate) cache: CacheService,
    pub(crate) auth_provider: Option<Arc<dyn CredentialBackend>>,
    pub(crate) database: Option<Arc<SqliteStore>>,

    pub(crate) auth_store: RwLock<Option<Arc<AuthStateStore>>>,
    pub(crate) session: RwLock<Option<Arc<dyn ProtocolSession>>>,

    pub(crate) bus: EventBus,
    pub(crate) crm: Option<Arc<dyn CrmBridge>>,
    pub(crate) bot: Option<Arc<dyn BotDispatcher>>,
    pub(crate) registry: Option<mpsc::UnboundedSender<RegistrySignal>>,

    pub group_cache: Arc<GroupMetadataCache>,
    pub recovery_cache: Arc<MessageRecoveryCache>,

    pub(crate) state: RwLock<StateConnection>,
    pub(crate) qr: RwLock<QrArtifact>,
    pub(crate) profile: RwLock<ProfileSnapshot>,
    pub(crate) phone_number: RwLock<Option<String>>,
    pub(crate) mobile: AtomicBool,

    pub(crate) is_connecting: AtomicBool,
    pub(crate) end_session: AtomicBool,
    pub(crate) reconnect_pending: AtomicBool,
    pub(crate) reconnect_errors: AtomicU32,
    pub(crate) last_connect: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    pub(crate) shutdown_notifier: Arc<Notify>,
}

impl SessionEngine {
    pub fn new(options: SessionEngineOptions) -> Arc<Self> {
        let bus = EventBus::new();
        if let Some(url) = &options.config.webhook.url {
            bus.add_sink(Arc::new(WebhookSink::new(url, options.http_client.clone())));
        }

        let group_cache = GroupMetadataCache::new(options.config.group_metadata_ttl());

        Arc::new(Self {
            instance_id: options.instance_id,
            instance_name: options.instance_name,
            config: options.config,
            settings: RwLock::new(options.settings),
            factory: options.factory,
            store: options.store,
            cache: options.cache,
            auth_provider: options.auth_provider,
            database: options.database,
            auth_store: RwLock::new(None),
            session: RwLock::new(None),
            bus,
            crm: options.crm,
            bot: options.bot,
            registry: options.registry,
            group_cache,
            recovery_cache: MessageRecoveryCache::new(),
            state: RwLock::new(StateConnection::default()),
            qr: RwLock::new(QrArtifact::default()),
            profile: RwLock::new(ProfileSnapshot::default()),
            phone_number: RwLock::new(None),
            mobile: AtomicBool::new(false),
            is_connecting: AtomicBool::new(false),
            end_session: AtomicBool::new(false),
            reconnect_pending: AtomicBool::new(false),
            reconnect_errors: AtomicU32::new(0),
            last_connect: Mutex::new(None),
            shutdown_notifier: Arc::new(Notify::new()),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn connection_status(&self) -> StateConnection {
        *self.state.read().await
    }

    pub async fn qr_code(&self) -> QrArtifact {
        self.qr.read().await.clone()
    }

    pub async fn profile(&self) -> ProfileSnapshot {
        self.profile.read().await.clone()
    }

    pub async fn settings(&self) -> InstanceSettings {
        self.settings.read().await.clone()
    }

    pub async fn update_settings(&self, settings: InstanceSettings) {
        *self.settings.write().await = settings;
    }

    pub async fn current_session(&self) -> Option<Arc<dyn ProtocolSession>> {
        self.session.read().await.clone()
    }

    pub async fn auth_store(&self) -> Option<Arc<AuthStateStore>> {
        self.auth_store.read().await.clone()
    }

    /// Own profile display name: what the open session reported, falling
    /// back to the persisted credentials.
    pub async fn profile_name(&self) -> Option<String> {
        if let Some(name) = self.profile.read().await.name.clone() {
            return Some(name);
        }
        match self.auth_store().await {
            Some(auth) => auth.snapshot().await.creds.push_name,
            None => None,
        }
    }

    /// Own profile status text, fetched through the session.
    pub async fn profile_status(&self) -> Option<String> {
        let session = self.current_session().await?;
        let wuid = self.profile.read().await.wuid.clone()?;
        match session.fetch_status(&wuid).await {
            Ok(status) => status,
            Err(e) => {
                warn!(target: "Engine", "Failed to fetch own profile status: {e}");
                None
            }
        }
    }

    pub async fn profile_picture_url(&self) -> Option<String> {
        self.profile.read().await.picture_url.clone()
    }

    /// Profile-picture lookup that treats "no picture" and lookup errors
    /// the same way: as absent.
    pub(crate) async fn fetch_profile_picture(&self, jid: &Jid) -> Option<String> {
        let session = self.current_session().await?;
        match session.profile_picture_url(jid).await {
            Ok(url) => url,
            Err(e) => {
                debug!(target: "Engine", "Profile picture not found for {jid}: {e}");
                None
            }
        }
    }

    /// Dispatches one normalized event to every registered sink.
    pub(crate) fn emit(&self, event: EventName, payload: serde_json::Value) {
        self.bus.dispatch(&NormalizedEvent {
            instance: self.instance_name.clone(),
            event,
            payload,
        });
    }

    pub(crate) fn signal_registry(&self, signal: RegistrySignal) {
        if let Some(registry) = &self.registry
            && registry.send(signal).is_err()
        {
            debug!(target: "Engine", "Registry receiver dropped");
        }
    }

    /// The `getMessage` callback handed to the transport so it can
    /// resolve stored content for retry re-encryption.
    pub(crate) fn message_resolver(self: &Arc<Self>) -> Arc<dyn MessageResolver> {
        Arc::new(StoreMessageResolver {
            store: self.store.clone(),
            instance_id: self.instance_id.clone(),
        })
    }

    /// Starts the periodic sweeps: recovery retries and the forced
    /// group-metadata refresh. Both run until instance teardown.
    pub fn run_background_tasks(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(engine.config.recovery_sweep_secs));
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = engine.shutdown_notifier.notified() => return,
                    _ = ticker.tick() => {}
                }
                if engine.recovery_cache.is_empty() {
                    continue;
                }
                if let Some(session) = engine.current_session().await {
                    engine.recovery_cache.retry_all(&session).await;
                }
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(engine.config.group_sweep_secs));
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = engine.shutdown_notifier.notified() => return,
                    _ = ticker.tick() => {}
                }
                let ignore_groups = engine.settings.read().await.groups_ignore;
                if ignore_groups {
                    continue;
                }
                if let Some(session) = engine.current_session().await {
                    engine.group_cache.force_refresh_all(&session).await;
                }
            }
        });
    }

    /// Tears the instance down: stops background tasks, closes the
    /// session, flushes credentials.
    pub async fn shutdown(&self) {
        self.end_session.store(true, Ordering::Relaxed);
        self.shutdown_notifier.notify_waiters();

        if let Some(session) = self.session.write().await.take() {
            session.close().await;
        }
        if let Some(auth) = self.auth_store().await
            && let Err(e) = auth.flush().await
        {
            warn!(target: "Engine", "Final credential flush on shutdown failed: {e}");
        }

        let mut state = self.state.write().await;
        state.state = InstanceState::Close;
    }

    /// Current status payload, as used in `connection.update` fan-out.
    pub(crate) async fn state_payload(&self) -> serde_json::Value {
        let state = *self.state.read().await;
        json!({
            "instance": self.instance_name,
            "state": state.state,
            "status_reason": state.status_reason,
        })
    }
}

struct StoreMessageResolver {
    store: Arc<dyn DataStore>,
    instance_id: String,
}

#[async_trait]
impl MessageResolver for StoreMessageResolver {
    async fn get_message(&self, key: &MessageKey) -> Option<serde_json::Value> {
        let record = match self.store.find_message(&self.instance_id, &key.id).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(target: "Engine", "Message lookup for retry failed: {e}");
                return None;
            }
        };

        // Poll creation messages resolve to the secret plus the creation
        // payload; that is all the transport needs to decrypt votes.
        if let Some(poll) = record.content.get("pollCreationMessage") {
            let secret = record
                .content
                .get("messageContextInfo")
                .and_then(|c| c.get("messageSecret"))
                .cloned();
            if let Some(secret) = secret {
                return Some(json!({
                    "messageContextInfo": { "messageSecret": secret },
                    "pollCreationMessage": poll.clone(),
                }));
            }
        }

        Some(record.content)
    }
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("instance_id", &self.instance_id)
            .field("instance_name", &self.instance_name)
            .finish()
    }
}

/// Helper for the `EngineError::EventHandler` wrapper used at the
/// pipeline edge.
pub(crate) fn handler_error(event: &'static str, source: impl Into<anyhow::Error>) -> EngineError {
    EngineError::EventHandler {
        event,
        source: source.into(),
    }
}
