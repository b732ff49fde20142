use crate::error::EngineError;
use crate::protocol::ProtocolSession;
use crate::types::message::MessageKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{info, warn};
use std::sync::Arc;

/// A message event the transport flagged as possibly undelivered
/// ("message absent from node"), held for retry.
#[derive(Debug, Clone)]
pub struct RecoveryEntry {
    pub key: MessageKey,
    /// Raw acknowledgment payload to re-submit through the transport.
    pub ack: serde_json::Value,
    pub stored_at: DateTime<Utc>,
}

/// Short-lived cache of possibly-lost message events. The periodic sweep
/// re-submits each entry's acknowledgment; it never deletes entries, so
/// a retry target survives until a later live event for the same id
/// confirms recovery (`take`).
#[derive(Default)]
pub struct MessageRecoveryCache {
    entries: DashMap<String, RecoveryEntry>,
}

impl MessageRecoveryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, key: MessageKey, ack: serde_json::Value) {
        let id = key.id.clone();
        self.entries.insert(
            id,
            RecoveryEntry {
                key,
                ack,
                stored_at: Utc::now(),
            },
        );
    }

    /// Removes and returns the entry for a message id. Called when a
    /// fresh copy of the message arrives, confirming recovery.
    pub fn take(&self, message_id: &str) -> Option<RecoveryEntry> {
        self.entries.remove(message_id).map(|(_, entry)| entry)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn message_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// One sweep pass: re-submits every pending acknowledgment. Failures
    /// are logged and the entry stays for the next pass. Returns the
    /// number of successful re-submissions.
    pub async fn retry_all(&self, session: &Arc<dyn ProtocolSession>) -> usize {
        let mut resubmitted = 0;
        for id in self.message_ids() {
            let Some(entry) = self.entries.get(&id).map(|e| e.value().clone()) else {
                continue;
            };

            info!(
                target: "Recovery",
                "Message absent from node, retrying to send, key: {id}"
            );
            match session.send_ack(&entry.ack).await {
                Ok(()) => resubmitted += 1,
                Err(e) => {
                    let err = EngineError::RecoveryRetry {
                        message_id: id.clone(),
                        source: e,
                    };
                    warn!(target: "Recovery", "{err}");
                }
            }
        }
        resubmitted
    }
}
