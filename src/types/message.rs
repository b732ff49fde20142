use crate::types::jid::Jid;
use serde::{Deserialize, Serialize};

/// Natural identity of a protocol message: id + chat + direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub id: String,
    pub remote_jid: Jid,
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<Jid>,
}

impl MessageKey {
    pub fn new(id: &str, remote_jid: Jid, from_me: bool) -> Self {
        Self {
            id: id.to_string(),
            remote_jid,
            from_me,
            participant: None,
        }
    }
}

/// Semantic delivery status. The transport reports these as numeric codes
/// (0..=5); `Deleted` is only ever produced locally when an update clears
/// the message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Error,
    Pending,
    ServerAck,
    DeliveryAck,
    Read,
    Played,
    Deleted,
}

impl MessageStatus {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Error),
            1 => Some(Self::Pending),
            2 => Some(Self::ServerAck),
            3 => Some(Self::DeliveryAck),
            4 => Some(Self::Read),
            5 => Some(Self::Played),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Pending => "PENDING",
            Self::ServerAck => "SERVER_ACK",
            Self::DeliveryAck => "DELIVERY_ACK",
            Self::Read => "READ",
            Self::Played => "PLAYED",
            Self::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content classification, derived from the top-level key of the message
/// payload the transport hands us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Conversation,
    ExtendedText,
    Image,
    Video,
    Audio,
    Sticker,
    Document,
    Contact,
    Location,
    Reaction,
    PollCreation,
    PollUpdate,
    Protocol,
    Unknown(String),
}

impl MessageType {
    /// Classifies a raw content payload the way the transport names its
    /// fields: the first recognized top-level key wins.
    pub fn classify(content: &serde_json::Value) -> Self {
        let Some(map) = content.as_object() else {
            return Self::Unknown(String::new());
        };
        for key in map.keys() {
            match key.as_str() {
                "conversation" => return Self::Conversation,
                "extendedTextMessage" => return Self::ExtendedText,
                "imageMessage" => return Self::Image,
                "videoMessage" => return Self::Video,
                "audioMessage" => return Self::Audio,
                "stickerMessage" => return Self::Sticker,
                "documentMessage" => return Self::Document,
                "contactMessage" => return Self::Contact,
                "locationMessage" => return Self::Location,
                "reactionMessage" => return Self::Reaction,
                "pollCreationMessage" => return Self::PollCreation,
                "pollUpdateMessage" => return Self::PollUpdate,
                "protocolMessage" => return Self::Protocol,
                _ => continue,
            }
        }
        Self::Unknown(map.keys().next().cloned().unwrap_or_default())
    }

    pub fn is_media(&self) -> bool {
        matches!(
            self,
            Self::Image | Self::Video | Self::Audio | Self::Sticker | Self::Document
        )
    }

    /// Control messages carry no user-visible content and are never stored.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Protocol | Self::PollUpdate)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Conversation => "conversation",
            Self::ExtendedText => "extendedTextMessage",
            Self::Image => "imageMessage",
            Self::Video => "videoMessage",
            Self::Audio => "audioMessage",
            Self::Sticker => "stickerMessage",
            Self::Document => "documentMessage",
            Self::Contact => "contactMessage",
            Self::Location => "locationMessage",
            Self::Reaction => "reactionMessage",
            Self::PollCreation => "pollCreationMessage",
            Self::PollUpdate => "pollUpdateMessage",
            Self::Protocol => "protocolMessage",
            Self::Unknown(s) => s,
        }
    }
}

/// Device family a message id was minted on. The id shape encodes the
/// originating client.
pub fn device_source(message_id: &str) -> &'static str {
    if message_id.starts_with("3A") && message_id.len() == 20 {
        "ios"
    } else if message_id.starts_with("3E") && message_id.len() == 22 {
        "web"
    } else if message_id.len() == 21 || message_id.len() == 32 {
        "android"
    } else if message_id.starts_with("3F") || message_id.len() == 18 {
        "desktop"
    } else {
        "unknown"
    }
}

/// Transport-level stub signals attached to a message event in place of
/// (or alongside) its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageStub {
    /// The message could not be fully delivered/decrypted; `ack` is the
    /// raw acknowledgment payload the transport needs to retry it.
    AbsentFromNode { ack: serde_json::Value },
}

/// One inbound message event, live or historical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub key: MessageKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    /// Raw content payload as delivered by the transport. Empty object for
    /// stub-only events.
    #[serde(default)]
    pub content: serde_json::Value,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stub: Option<MessageStub>,
}

impl InboundMessage {
    pub fn message_type(&self) -> MessageType {
        MessageType::classify(&self.content)
    }

    pub fn has_content(&self) -> bool {
        self.content.as_object().is_some_and(|m| !m.is_empty())
    }
}
