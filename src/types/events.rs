use crate::types::jid::Jid;
use crate::types::message::{InboundMessage, MessageKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Why the transport reported a closed connection. Numeric codes follow
/// the protocol's connect-failure space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    LoggedOut,
    Forbidden,
    ConnectionLost,
    MultideviceMismatch,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    ServiceUnavailable,
    RestartRequired,
    Unknown(u16),
}

impl From<u16> for DisconnectReason {
    fn from(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::ConnectionLost,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::ServiceUnavailable,
            515 => Self::RestartRequired,
            _ => Self::Unknown(code),
        }
    }
}

impl DisconnectReason {
    pub fn code(&self) -> u16 {
        match self {
            Self::LoggedOut => 401,
            Self::Forbidden => 403,
            Self::ConnectionLost => 408,
            Self::MultideviceMismatch => 411,
            Self::ConnectionClosed => 428,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::ServiceUnavailable => 503,
            Self::RestartRequired => 515,
            Self::Unknown(code) => *code,
        }
    }

    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }

    /// The reconnect policy: every transport-level closure reconnects
    /// except an explicit logout.
    pub fn should_reconnect(&self) -> bool {
        !self.is_logged_out()
    }

    pub const ALL_KNOWN: [DisconnectReason; 9] = [
        Self::LoggedOut,
        Self::Forbidden,
        Self::ConnectionLost,
        Self::MultideviceMismatch,
        Self::ConnectionClosed,
        Self::ConnectionReplaced,
        Self::BadSession,
        Self::ServiceUnavailable,
        Self::RestartRequired,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Close,
}

/// A `connection.update` event from the transport. Any subset of the
/// fields may be present in one event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_disconnect: Option<DisconnectReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUpsert {
    pub id: Jid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_msg_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUpdate {
    pub id: Jid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_msg_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactUpsert {
    pub id: Jid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_name: Option<String>,
}

impl ContactUpsert {
    /// Display name fallback chain: name, verified name, bare user part.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.verified_name.clone())
            .unwrap_or_else(|| self.id.user.clone())
    }
}

/// Bulk backfill delivered once per newly authorized session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistorySet {
    pub chats: Vec<ChatUpsert>,
    pub contacts: Vec<ContactUpsert>,
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub is_latest: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertType {
    Notify,
    Append,
    Prepend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesUpsert {
    pub messages: Vec<InboundMessage>,
    pub upsert_type: UpsertType,
}

/// One `messages.update` entry. A cleared body with no status code is a
/// hard delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub key: MessageKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    #[serde(default)]
    pub message_cleared: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_updates: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub jid: Jid,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub id: Jid,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Jid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation: Option<i64>,
    #[serde(default)]
    pub participants: Vec<GroupParticipant>,
}

/// Partial group mutation; only present fields changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupUpdate {
    pub id: Jid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantsUpdate {
    pub id: Jid,
    pub participants: Vec<Jid>,
    pub action: ParticipantAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelEdit {
    pub id: String,
    pub name: String,
    pub color: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predefined_id: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssociationType {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelAssociation {
    pub label_id: String,
    pub chat_id: Jid,
    pub association_type: AssociationType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Offer,
    Ringing,
    Accept,
    Reject,
    Timeout,
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    pub id: String,
    pub from: Jid,
    pub status: CallStatus,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub id: Jid,
    pub presences: serde_json::Value,
}

/// One named event kind from the transport. The pipeline matches this
/// exhaustively, so adding a kind is a compile-time-checked change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtocolEvent {
    Connection(ConnectionUpdate),
    CredsUpdate,
    HistorySet(HistorySet),
    MessagesUpsert(MessagesUpsert),
    MessagesUpdate(Vec<MessageUpdate>),
    ChatsUpsert(Vec<ChatUpsert>),
    ChatsUpdate(Vec<ChatUpdate>),
    ChatsDelete(Vec<Jid>),
    ContactsUpsert(Vec<ContactUpsert>),
    ContactsUpdate(Vec<ContactUpsert>),
    GroupsUpsert(Vec<GroupMetadata>),
    GroupsUpdate(Vec<GroupUpdate>),
    GroupParticipantsUpdate(ParticipantsUpdate),
    LabelsEdit(LabelEdit),
    LabelsAssociation(LabelAssociation),
    Call(Vec<CallEvent>),
    Presence(PresenceUpdate),
}

/// Processing order within one batch. Connection and credential events
/// run first, then the data events in the pipeline-defined order:
/// chats, contacts, messages (history, upsert, update), groups, labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IngestStage {
    Connection,
    Credentials,
    Chats,
    Contacts,
    MessagesHistory,
    MessagesUpsert,
    MessagesUpdate,
    Groups,
    Labels,
    Auxiliary,
}

impl ProtocolEvent {
    pub fn stage(&self) -> IngestStage {
        match self {
            Self::Connection(_) => IngestStage::Connection,
            Self::CredsUpdate => IngestStage::Credentials,
            Self::ChatsUpsert(_) | Self::ChatsUpdate(_) | Self::ChatsDelete(_) => {
                IngestStage::Chats
            }
            Self::ContactsUpsert(_) | Self::ContactsUpdate(_) => IngestStage::Contacts,
            Self::HistorySet(_) => IngestStage::MessagesHistory,
            Self::MessagesUpsert(_) => IngestStage::MessagesUpsert,
            Self::MessagesUpdate(_) => IngestStage::MessagesUpdate,
            Self::GroupsUpsert(_) | Self::GroupsUpdate(_) | Self::GroupParticipantsUpdate(_) => {
                IngestStage::Groups
            }
            Self::LabelsEdit(_) | Self::LabelsAssociation(_) => IngestStage::Labels,
            Self::Call(_) | Self::Presence(_) => IngestStage::Auxiliary,
        }
    }

    /// Short name for logging, matching the transport's event naming.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection.update",
            Self::CredsUpdate => "creds.update",
            Self::HistorySet(_) => "messaging-history.set",
            Self::MessagesUpsert(_) => "messages.upsert",
            Self::MessagesUpdate(_) => "messages.update",
            Self::ChatsUpsert(_) => "chats.upsert",
            Self::ChatsUpdate(_) => "chats.update",
            Self::ChatsDelete(_) => "chats.delete",
            Self::ContactsUpsert(_) => "contacts.upsert",
            Self::ContactsUpdate(_) => "contacts.update",
            Self::GroupsUpsert(_) => "groups.upsert",
            Self::GroupsUpdate(_) => "groups.update",
            Self::GroupParticipantsUpdate(_) => "group-participants.update",
            Self::LabelsEdit(_) => "labels.edit",
            Self::LabelsAssociation(_) => "labels.association",
            Self::Call(_) => "call",
            Self::Presence(_) => "presence.update",
        }
    }
}

/// A heterogeneous set of events the transport delivered together. The
/// pipeline processes one batch fully before accepting the next.
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    pub events: Vec<ProtocolEvent>,
}

impl EventBatch {
    pub fn single(event: ProtocolEvent) -> Self {
        Self {
            events: vec![event],
        }
    }
}

/// Names of the normalized events fanned out to external consumers.
/// Serializes as the dotted wire name (`"qrcode.updated"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    ApplicationStartup,
    QrcodeUpdated,
    ConnectionUpdate,
    StatusInstance,
    ChatsSet,
    ChatsUpsert,
    ChatsUpdate,
    ChatsDelete,
    ContactsUpsert,
    ContactsUpdate,
    MessagesSet,
    MessagesUpsert,
    MessagesUpdate,
    MessagesDelete,
    MessagesRead,
    GroupsUpsert,
    GroupsUpdate,
    GroupParticipantsUpdate,
    LabelsEdit,
    LabelsAssociation,
    PresenceUpdate,
    Call,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplicationStartup => "application.startup",
            Self::QrcodeUpdated => "qrcode.updated",
            Self::ConnectionUpdate => "connection.update",
            Self::StatusInstance => "status.instance",
            Self::ChatsSet => "chats.set",
            Self::ChatsUpsert => "chats.upsert",
            Self::ChatsUpdate => "chats.update",
            Self::ChatsDelete => "chats.delete",
            Self::ContactsUpsert => "contacts.upsert",
            Self::ContactsUpdate => "contacts.update",
            Self::MessagesSet => "messages.set",
            Self::MessagesUpsert => "messages.upsert",
            Self::MessagesUpdate => "messages.update",
            Self::MessagesDelete => "messages.delete",
            Self::MessagesRead => "messages.read",
            Self::GroupsUpsert => "groups.upsert",
            Self::GroupsUpdate => "groups.update",
            Self::GroupParticipantsUpdate => "group-participants.update",
            Self::LabelsEdit => "labels.edit",
            Self::LabelsAssociation => "labels.association",
            Self::PresenceUpdate => "presence.update",
            Self::Call => "call",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// A normalized event as delivered to external consumers.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedEvent {
    pub instance: String,
    pub event: EventName,
    pub payload: serde_json::Value,
}

/// A fan-out consumer. Delivery must not block the caller; sinks spawn
/// their own I/O and log their own failures.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &NormalizedEvent);
}

#[derive(Default, Clone)]
pub struct EventBus {
    sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks
            .write()
            .expect("RwLock should not be poisoned")
            .push(sink);
    }

    pub fn has_sinks(&self) -> bool {
        !self
            .sinks
            .read()
            .expect("RwLock should not be poisoned")
            .is_empty()
    }

    pub fn dispatch(&self, event: &NormalizedEvent) {
        for sink in self
            .sinks
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
        {
            sink.deliver(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_reason_except_logout_reconnects() {
        for reason in DisconnectReason::ALL_KNOWN {
            assert_eq!(
                reason.should_reconnect(),
                !matches!(reason, DisconnectReason::LoggedOut),
                "wrong reconnect policy for {reason:?}"
            );
        }
        assert!(DisconnectReason::Unknown(599).should_reconnect());
    }

    #[test]
    fn reason_codes_round_trip() {
        for reason in DisconnectReason::ALL_KNOWN {
            assert_eq!(DisconnectReason::from(reason.code()), reason);
        }
    }

    #[test]
    fn stages_follow_pipeline_order() {
        assert!(IngestStage::Chats < IngestStage::Contacts);
        assert!(IngestStage::Contacts < IngestStage::MessagesHistory);
        assert!(IngestStage::MessagesHistory < IngestStage::MessagesUpsert);
        assert!(IngestStage::MessagesUpsert < IngestStage::MessagesUpdate);
        assert!(IngestStage::MessagesUpdate < IngestStage::Groups);
        assert!(IngestStage::Groups < IngestStage::Labels);
    }
}
