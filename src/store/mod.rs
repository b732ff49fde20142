pub mod memory;
pub mod schema;
pub mod sqlite_store;

use crate::error::StoreResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One conversation row. At most one per (instance, remote JID).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRecord {
    pub remote_jid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_msg_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

/// One known participant. Upserted, never duplicated per (instance, JID).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactRecord {
    pub remote_jid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_pic_url: Option<String>,
}

/// Immutable record of one message event. Status transitions live in the
/// append-only `MessageUpdateRecord` ledger, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub key_id: String,
    pub remote_jid: String,
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    pub content: serde_json::Value,
    pub message_type: String,
    pub message_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// One entry in the status-change ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageUpdateRecord {
    pub key_id: String,
    pub remote_jid: String,
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    pub status: String,
    /// Unix milliseconds at which the update was observed.
    pub date_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_updates: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelRecord {
    pub label_id: String,
    pub name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predefined_id: Option<String>,
}

/// Durable storage consumed by the ingestion pipeline. Every write is an
/// upsert or skip-duplicate insert keyed by the natural identity of the
/// entity, which is what makes the handlers idempotent.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn chat_jids(&self, instance_id: &str) -> StoreResult<Vec<String>>;

    /// Bulk insert, silently skipping rows whose (instance, JID) already
    /// exists. Returns the number of rows actually written.
    async fn insert_chats(&self, instance_id: &str, chats: &[ChatRecord]) -> StoreResult<usize>;

    async fn update_chat_last_message(
        &self,
        instance_id: &str,
        remote_jid: &str,
        timestamp: i64,
    ) -> StoreResult<()>;

    async fn delete_chat(&self, instance_id: &str, remote_jid: &str) -> StoreResult<()>;

    async fn chat_labels(
        &self,
        instance_id: &str,
        remote_jid: &str,
    ) -> StoreResult<Option<Vec<String>>>;

    async fn set_chat_labels(
        &self,
        instance_id: &str,
        remote_jid: &str,
        labels: &[String],
    ) -> StoreResult<()>;

    async fn find_contact(
        &self,
        instance_id: &str,
        remote_jid: &str,
    ) -> StoreResult<Option<ContactRecord>>;

    /// Bulk insert, silently skipping existing (instance, JID) rows.
    async fn insert_contacts(
        &self,
        instance_id: &str,
        contacts: &[ContactRecord],
    ) -> StoreResult<usize>;

    async fn upsert_contact(&self, instance_id: &str, contact: &ContactRecord) -> StoreResult<()>;

    async fn message_ids(&self, instance_id: &str) -> StoreResult<Vec<String>>;

    async fn find_message(
        &self,
        instance_id: &str,
        key_id: &str,
    ) -> StoreResult<Option<MessageRecord>>;

    /// Bulk insert, silently skipping existing (instance, key id) rows.
    async fn insert_messages(
        &self,
        instance_id: &str,
        messages: &[MessageRecord],
    ) -> StoreResult<usize>;

    async fn append_message_update(
        &self,
        instance_id: &str,
        update: &MessageUpdateRecord,
    ) -> StoreResult<()>;

    async fn message_updates(
        &self,
        instance_id: &str,
        key_id: &str,
    ) -> StoreResult<Vec<MessageUpdateRecord>>;

    async fn find_label(
        &self,
        instance_id: &str,
        label_id: &str,
    ) -> StoreResult<Option<LabelRecord>>;

    async fn upsert_label(&self, instance_id: &str, label: &LabelRecord) -> StoreResult<()>;

    async fn delete_label(&self, instance_id: &str, label_id: &str) -> StoreResult<()>;
}
