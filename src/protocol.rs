use crate::auth::AuthStateStore;
use crate::types::events::{EventBatch, GroupMetadata};
use crate::types::jid::Jid;
use crate::types::message::MessageKey;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Resolves stored message content for the transport, which needs it to
/// re-encrypt messages for retry requests.
#[async_trait]
pub trait MessageResolver: Send + Sync {
    async fn get_message(&self, key: &MessageKey) -> Option<serde_json::Value>;
}

/// Inbound-traffic filter handed to the transport so ignored JIDs are
/// dropped before decryption.
#[derive(Debug, Clone, Copy, Default)]
pub struct JidFilter {
    pub ignore_groups: bool,
    pub ignore_broadcast: bool,
}

impl JidFilter {
    pub fn should_ignore(&self, jid: &Jid) -> bool {
        (self.ignore_groups && jid.is_group()) || (self.ignore_broadcast && jid.is_broadcast())
    }
}

/// Everything the transport needs to build one socket session.
pub struct SocketConfig {
    pub instance_name: String,
    pub auth: Arc<AuthStateStore>,
    pub jid_filter: JidFilter,
    pub sync_full_history: bool,
    pub mark_online_on_connect: bool,
    pub connect_timeout: Duration,
    pub qr_timeout: Duration,
    pub retry_request_delay: Duration,
    pub resolver: Arc<dyn MessageResolver>,
    /// Applied by the transport to every outbound payload right before
    /// transmission (see [`patch_outbound_message`]).
    pub patch_message: fn(serde_json::Value) -> serde_json::Value,
}

/// A live protocol socket session, consumed as a capability. The wire
/// protocol and handshake live behind this interface.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    /// Own account JID once the connection is open.
    fn own_jid(&self) -> Option<Jid>;

    /// Re-submits a raw acknowledgment payload for a message the
    /// transport reported as possibly lost.
    async fn send_ack(&self, ack: &serde_json::Value) -> Result<()>;

    async fn fetch_group_metadata(&self, jid: &Jid) -> Result<GroupMetadata>;

    /// All groups the account participates in, without participant lists.
    async fn fetch_joined_groups(&self) -> Result<Vec<GroupMetadata>>;

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String>;

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<()>;

    async fn download_media(&self, message: &serde_json::Value) -> Result<Vec<u8>>;

    async fn profile_picture_url(&self, jid: &Jid) -> Result<Option<String>>;

    async fn fetch_status(&self, jid: &Jid) -> Result<Option<String>>;

    async fn reject_call(&self, call_id: &str, from: &Jid) -> Result<()>;

    async fn send_text(&self, to: &Jid, text: &str) -> Result<()>;

    /// Clean logout: invalidates the pairing server-side.
    async fn logout(&self) -> Result<()>;

    /// Closes the socket without logging out.
    async fn close(&self);
}

/// Builds socket sessions. The returned receiver is the single
/// consumption point for the session's event batches; the sender side is
/// dropped when the transport closes the socket.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(
        &self,
        config: SocketConfig,
    ) -> Result<(Arc<dyn ProtocolSession>, mpsc::Receiver<EventBatch>)>;
}

/// Patch applied to every outbound message right before transmission.
///
/// Precondition: `content` is a message payload that may carry a
/// `listMessage` (directly or under `deviceSentMessage`). Postcondition:
/// any `listType` of `"PRODUCT_LIST"` is rewritten to `"SINGLE_SELECT"`;
/// everything else is returned untouched. The network rejects product
/// lists from companion devices, single-select renders identically.
pub fn patch_outbound_message(mut content: serde_json::Value) -> serde_json::Value {
    fn rewrite_list_type(message: &mut serde_json::Value) {
        if let Some(list) = message.get_mut("listMessage")
            && list.get("listType").and_then(|t| t.as_str()) == Some("PRODUCT_LIST")
        {
            list["listType"] = serde_json::Value::from("SINGLE_SELECT");
        }
    }

    rewrite_list_type(&mut content);
    if let Some(device_sent) = content
        .get_mut("deviceSentMessage")
        .and_then(|d| d.get_mut("message"))
    {
        rewrite_list_type(device_sent);
    }
    content
}
