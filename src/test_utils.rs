//! Shared mocks for the test suite: an in-memory protocol session, a
//! factory over it, and an event-capturing fan-out sink.

use crate::cache::CacheService;
use crate::config::{EngineConfig, InstanceSettings};
use crate::engine::{SessionEngine, SessionEngineOptions};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::protocol::{ProtocolSession, SessionFactory, SocketConfig};
use crate::store::memory::MemoryStore;
use crate::types::events::{EventBatch, EventName, EventSink, GroupMetadata, NormalizedEvent};
use crate::types::jid::Jid;
use crate::types::message::{InboundMessage, MessageKey};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
pub struct MockHttpClient;

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse> {
        Ok(HttpResponse {
            status_code: 200,
            body: Vec::new(),
        })
    }
}

/// Scriptable protocol session: records every capability call and can be
/// told to fail specific operations.
#[derive(Default)]
pub struct MockSession {
    pub acks: Mutex<Vec<serde_json::Value>>,
    pub read_keys: Mutex<Vec<MessageKey>>,
    pub sent_texts: Mutex<Vec<(Jid, String)>>,
    pub rejected_calls: Mutex<Vec<String>>,
    pub pairing_requests: Mutex<Vec<String>>,
    pub group_fetches: AtomicU32,
    pub groups: Mutex<Vec<GroupMetadata>>,
    pub fail_group_fetch: AtomicBool,
    pub fail_ack: AtomicBool,
    pub logged_out: AtomicBool,
    pub closed: AtomicBool,
}

impl MockSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_groups(&self, groups: Vec<GroupMetadata>) {
        *self.groups.lock().expect("mutex poisoned") = groups;
    }

    pub fn group_fetch_count(&self) -> u32 {
        self.group_fetches.load(Ordering::Relaxed)
    }

    pub fn ack_count(&self) -> usize {
        self.acks.lock().expect("mutex poisoned").len()
    }
}

#[async_trait]
impl ProtocolSession for MockSession {
    fn own_jid(&self) -> Option<Jid> {
        Some("5544999999999:3@s.whatsapp.net".parse().expect("static jid"))
    }

    async fn send_ack(&self, ack: &serde_json::Value) -> Result<()> {
        if self.fail_ack.load(Ordering::Relaxed) {
            anyhow::bail!("ack rejected");
        }
        self.acks.lock().expect("mutex poisoned").push(ack.clone());
        Ok(())
    }

    async fn fetch_group_metadata(&self, jid: &Jid) -> Result<GroupMetadata> {
        self.group_fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_group_fetch.load(Ordering::Relaxed) {
            anyhow::bail!("metadata query failed");
        }
        let found = self
            .groups
            .lock()
            .expect("mutex poisoned")
            .iter()
            .find(|group| &group.id == jid)
            .cloned();
        Ok(found.unwrap_or_else(|| GroupMetadata {
            id: jid.clone(),
            subject: "Group".to_string(),
            owner: None,
            description: None,
            creation: None,
            participants: Vec::new(),
        }))
    }

    async fn fetch_joined_groups(&self) -> Result<Vec<GroupMetadata>> {
        Ok(self.groups.lock().expect("mutex poisoned").clone())
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String> {
        self.pairing_requests
            .lock()
            .expect("mutex poisoned")
            .push(phone_number.to_string());
        Ok("WZYE-H1T3".to_string())
    }

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<()> {
        self.read_keys
            .lock()
            .expect("mutex poisoned")
            .extend(keys.iter().cloned());
        Ok(())
    }

    async fn download_media(&self, _message: &serde_json::Value) -> Result<Vec<u8>> {
        Ok(b"media-bytes".to_vec())
    }

    async fn profile_picture_url(&self, _jid: &Jid) -> Result<Option<String>> {
        Ok(Some("https://pps.example.net/pic.jpg".to_string()))
    }

    async fn fetch_status(&self, _jid: &Jid) -> Result<Option<String>> {
        Ok(Some("available".to_string()))
    }

    async fn reject_call(&self, call_id: &str, _from: &Jid) -> Result<()> {
        self.rejected_calls
            .lock()
            .expect("mutex poisoned")
            .push(call_id.to_string());
        Ok(())
    }

    async fn send_text(&self, to: &Jid, text: &str) -> Result<()> {
        self.sent_texts
            .lock()
            .expect("mutex poisoned")
            .push((to.clone(), text.to_string()));
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.logged_out.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Factory over [`MockSession`]. Counts created sessions and hands the
/// test the sender side of each session's event channel.
#[derive(Default)]
pub struct MockSessionFactory {
    pub created: AtomicU32,
    pub fail_next: AtomicBool,
    handles: Mutex<Vec<(Arc<MockSession>, Option<mpsc::Sender<EventBatch>>)>>,
}

impl MockSessionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created_count(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    /// Session and event-feed handle of the most recent create.
    pub fn last_handle(&self) -> Option<(Arc<MockSession>, mpsc::Sender<EventBatch>)> {
        self.handles
            .lock()
            .expect("mutex poisoned")
            .last()
            .and_then(|(session, feed)| Some((session.clone(), feed.clone()?)))
    }

    /// Takes the stored feed sender for the most recent session, so
    /// dropping the returned sender ends that session's event stream.
    pub fn take_last_feed(&self) -> Option<mpsc::Sender<EventBatch>> {
        self.handles
            .lock()
            .expect("mutex poisoned")
            .last_mut()
            .and_then(|(_, feed)| feed.take())
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn create(
        &self,
        _config: SocketConfig,
    ) -> Result<(Arc<dyn ProtocolSession>, mpsc::Receiver<EventBatch>)> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("socket construction failed");
        }
        self.created.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(64);
        let session = MockSession::new();
        self.handles
            .lock()
            .expect("mutex poisoned")
            .push((session.clone(), Some(tx)));
        Ok((session, rx))
    }
}

/// Fan-out sink that records every normalized event it sees.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<NormalizedEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<NormalizedEvent> {
        self.events.lock().expect("mutex poisoned").clone()
    }

    pub fn count_of(&self, name: EventName) -> usize {
        self.events
            .lock()
            .expect("mutex poisoned")
            .iter()
            .filter(|event| event.event == name)
            .count()
    }

    pub fn last_of(&self, name: EventName) -> Option<NormalizedEvent> {
        self.events
            .lock()
            .expect("mutex poisoned")
            .iter()
            .rev()
            .find(|event| event.event == name)
            .cloned()
    }

    pub fn clear(&self) {
        self.events.lock().expect("mutex poisoned").clear();
    }
}

impl EventSink for CollectingSink {
    fn deliver(&self, event: &NormalizedEvent) {
        self.events
            .lock()
            .expect("mutex poisoned")
            .push(event.clone());
    }
}

pub struct TestHarness {
    pub engine: Arc<SessionEngine>,
    pub factory: Arc<MockSessionFactory>,
    pub store: Arc<MemoryStore>,
    pub sink: Arc<CollectingSink>,
    pub registry_rx: mpsc::UnboundedReceiver<crate::engine::RegistrySignal>,
}

/// Polls a condition until it holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}

pub fn test_harness() -> TestHarness {
    test_harness_with(EngineConfig::default(), InstanceSettings::default())
}

pub fn test_harness_with(mut config: EngineConfig, settings: InstanceSettings) -> TestHarness {
    let _ = env_logger::builder().is_test(true).try_init();

    // Keep file-backend writes out of the working directory.
    static DIR_COUNTER: AtomicU32 = AtomicU32::new(0);
    config.auth_dir = std::env::temp_dir().join(format!(
        "wasession-test-{}-{}",
        std::process::id(),
        DIR_COUNTER.fetch_add(1, Ordering::SeqCst)
    ));

    let factory = MockSessionFactory::new();
    let store = Arc::new(MemoryStore::new());
    let sink = CollectingSink::new();
    let (registry_tx, registry_rx) = mpsc::unbounded_channel();

    let engine = SessionEngine::new(SessionEngineOptions {
        instance_id: "test-instance-id".to_string(),
        instance_name: "test-instance".to_string(),
        config,
        settings,
        factory: factory.clone(),
        store: store.clone(),
        cache: CacheService::default(),
        http_client: Arc::new(MockHttpClient),
        auth_provider: None,
        database: None,
        crm: None,
        bot: None,
        registry: Some(registry_tx),
    });
    engine.event_bus().add_sink(sink.clone());

    TestHarness {
        engine,
        factory,
        store,
        sink,
        registry_rx,
    }
}

/// A plain live text message, the way the transport would deliver it.
pub fn text_message(id: &str, remote_jid: &str, text: &str, timestamp: i64) -> InboundMessage {
    InboundMessage {
        key: MessageKey::new(id, remote_jid.parse().expect("valid jid"), false),
        push_name: Some("Ann".to_string()),
        content: serde_json::json!({ "conversation": text }),
        timestamp,
        status_code: None,
        stub: None,
    }
}
