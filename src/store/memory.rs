use super::{ChatRecord, ContactRecord, DataStore, LabelRecord, MessageRecord, MessageUpdateRecord};
use crate::error::StoreResult;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

type Key = (String, String);

fn key(instance_id: &str, id: &str) -> Key {
    (instance_id.to_string(), id.to_string())
}

/// In-memory data store. The default backend when no database is
/// configured, and the backend the test suite runs against.
#[derive(Default)]
pub struct MemoryStore {
    chats: RwLock<HashMap<Key, ChatRecord>>,
    contacts: RwLock<HashMap<Key, ContactRecord>>,
    messages: RwLock<HashMap<Key, MessageRecord>>,
    message_updates: RwLock<HashMap<Key, Vec<MessageUpdateRecord>>>,
    labels: RwLock<HashMap<Key, LabelRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn chat_count(&self, instance_id: &str) -> usize {
        self.chats
            .read()
            .await
            .keys()
            .filter(|(inst, _)| inst == instance_id)
            .count()
    }

    pub async fn contact_count(&self, instance_id: &str) -> usize {
        self.contacts
            .read()
            .await
            .keys()
            .filter(|(inst, _)| inst == instance_id)
            .count()
    }

    pub async fn message_count(&self, instance_id: &str) -> usize {
        self.messages
            .read()
            .await
            .keys()
            .filter(|(inst, _)| inst == instance_id)
            .count()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn chat_jids(&self, instance_id: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .chats
            .read()
            .await
            .keys()
            .filter(|(inst, _)| inst == instance_id)
            .map(|(_, jid)| jid.clone())
            .collect())
    }

    async fn insert_chats(&self, instance_id: &str, chats: &[ChatRecord]) -> StoreResult<usize> {
        let mut guard = self.chats.write().await;
        let mut inserted = 0;
        for chat in chats {
            let k = key(instance_id, &chat.remote_jid);
            if !guard.contains_key(&k) {
                guard.insert(k, chat.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn update_chat_last_message(
        &self,
        instance_id: &str,
        remote_jid: &str,
        timestamp: i64,
    ) -> StoreResult<()> {
        if let Some(chat) = self
            .chats
            .write()
            .await
            .get_mut(&key(instance_id, remote_jid))
        {
            chat.last_msg_timestamp = Some(timestamp);
        }
        Ok(())
    }

    async fn delete_chat(&self, instance_id: &str, remote_jid: &str) -> StoreResult<()> {
        self.chats.write().await.remove(&key(instance_id, remote_jid));
        Ok(())
    }

    async fn chat_labels(
        &self,
        instance_id: &str,
        remote_jid: &str,
    ) -> StoreResult<Option<Vec<String>>> {
        Ok(self
            .chats
            .read()
            .await
            .get(&key(instance_id, remote_jid))
            .map(|chat| chat.labels.clone()))
    }

    async fn set_chat_labels(
        &self,
        instance_id: &str,
        remote_jid: &str,
        labels: &[String],
    ) -> StoreResult<()> {
        if let Some(chat) = self
            .chats
            .write()
            .await
            .get_mut(&key(instance_id, remote_jid))
        {
            chat.labels = labels.to_vec();
        }
        Ok(())
    }

    async fn find_contact(
        &self,
        instance_id: &str,
        remote_jid: &str,
    ) -> StoreResult<Option<ContactRecord>> {
        Ok(self
            .contacts
            .read()
            .await
            .get(&key(instance_id, remote_jid))
            .cloned())
    }

    async fn insert_contacts(
        &self,
        instance_id: &str,
        contacts: &[ContactRecord],
    ) -> StoreResult<usize> {
        let mut guard = self.contacts.write().await;
        let mut inserted = 0;
        for contact in contacts {
            let k = key(instance_id, &contact.remote_jid);
            if !guard.contains_key(&k) {
                guard.insert(k, contact.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn upsert_contact(&self, instance_id: &str, contact: &ContactRecord) -> StoreResult<()> {
        self.contacts
            .write()
            .await
            .insert(key(instance_id, &contact.remote_jid), contact.clone());
        Ok(())
    }

    async fn message_ids(&self, instance_id: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .messages
            .read()
            .await
            .keys()
            .filter(|(inst, _)| inst == instance_id)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn find_message(
        &self,
        instance_id: &str,
        key_id: &str,
    ) -> StoreResult<Option<MessageRecord>> {
        Ok(self
            .messages
            .read()
            .await
            .get(&key(instance_id, key_id))
            .cloned())
    }

    async fn insert_messages(
        &self,
        instance_id: &str,
        messages: &[MessageRecord],
    ) -> StoreResult<usize> {
        let mut guard = self.messages.write().await;
        let mut inserted = 0;
        for message in messages {
            let k = key(instance_id, &message.key_id);
            if !guard.contains_key(&k) {
                guard.insert(k, message.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn append_message_update(
        &self,
        instance_id: &str,
        update: &MessageUpdateRecord,
    ) -> StoreResult<()> {
        self.message_updates
            .write()
            .await
            .entry(key(instance_id, &update.key_id))
            .or_default()
            .push(update.clone());
        Ok(())
    }

    async fn message_updates(
        &self,
        instance_id: &str,
        key_id: &str,
    ) -> StoreResult<Vec<MessageUpdateRecord>> {
        Ok(self
            .message_updates
            .read()
            .await
            .get(&key(instance_id, key_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn find_label(
        &self,
        instance_id: &str,
        label_id: &str,
    ) -> StoreResult<Option<LabelRecord>> {
        Ok(self
            .labels
            .read()
            .await
            .get(&key(instance_id, label_id))
            .cloned())
    }

    async fn upsert_label(&self, instance_id: &str, label: &LabelRecord) -> StoreResult<()> {
        self.labels
            .write()
            .await
            .insert(key(instance_id, &label.label_id), label.clone());
        Ok(())
    }

    async fn delete_label(&self, instance_id: &str, label_id: &str) -> StoreResult<()> {
        self.labels.write().await.remove(&key(instance_id, label_id));
        Ok(())
    }
}
