use crate::http::{HttpClient, HttpRequest};
use crate::types::events::{EventName, EventSink, NormalizedEvent};
use crate::types::jid::Jid;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;

/// Delivers every normalized event to a webhook endpoint as one JSON
/// POST. Delivery is fire-and-forget: failures are logged and never
/// block or fail ingestion.
pub struct WebhookSink {
    url: String,
    client: Arc<dyn HttpClient>,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, client: Arc<dyn HttpClient>) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

impl EventSink for WebhookSink {
    fn deliver(&self, event: &NormalizedEvent) {
        let body = match serde_json::to_vec(event) {
            Ok(body) => body,
            Err(e) => {
                warn!(target: "Webhook", "Failed to encode event {}: {e}", event.event);
                return;
            }
        };

        let request = HttpRequest::post_json(&self.url, body);
        let client = self.client.clone();
        let event_name = event.event;
        tokio::spawn(async move {
            match client.execute(request).await {
                Ok(response) if (200..300).contains(&response.status_code) => {
                    debug!(target: "Webhook", "Delivered {event_name}");
                }
                Ok(response) => {
                    warn!(
                        target: "Webhook",
                        "Webhook for {event_name} answered HTTP {}",
                        response.status_code
                    );
                }
                Err(e) => {
                    warn!(target: "Webhook", "Webhook delivery of {event_name} failed: {e}");
                }
            }
        });
    }
}

/// CRM-bridge collaborator. The engine forwards normalized events and
/// side signals; history-import logic lives on the other side of this
/// trait.
#[async_trait]
pub trait CrmBridge: Send + Sync {
    async fn event(&self, instance_name: &str, event: EventName, payload: &serde_json::Value);
}

/// Chatbot collaborator. Receives every accepted live message together
/// with the instance name; the bot-conversation-session lifecycle is
/// owned by the implementation, not the engine.
#[async_trait]
pub trait BotDispatcher: Send + Sync {
    async fn incoming(&self, instance_name: &str, remote_jid: &Jid, message: &serde_json::Value);
}

/// Forwards a side signal to the CRM bridge without blocking the caller.
pub fn notify_crm(
    crm: &Option<Arc<dyn CrmBridge>>,
    instance_name: &str,
    event: EventName,
    payload: serde_json::Value,
) {
    if let Some(crm) = crm {
        let crm = crm.clone();
        let instance_name = instance_name.to_string();
        tokio::spawn(async move {
            crm.event(&instance_name, event, &payload).await;
        });
    }
}

/// Forwards an accepted live message to the bot dispatcher without
/// blocking the caller.
pub fn notify_bot(
    bot: &Option<Arc<dyn BotDispatcher>>,
    instance_name: &str,
    remote_jid: &Jid,
    message: serde_json::Value,
) {
    if let Some(bot) = bot {
        let bot = bot.clone();
        let instance_name = instance_name.to_string();
        let remote_jid = remote_jid.clone();
        tokio::spawn(async move {
            bot.incoming(&instance_name, &remote_jid, &message).await;
        });
    }
}
