//! Inbound webhook ingestion pipeline.
//!
//! Orchestrates identity resolution, conversation resolution, normalization
//! and persistence for every event in a webhook batch. A failure in one event
//! aborts only that event; the rest of the batch is still processed and the
//! platform always gets its fast ack (at-most-once internally, redelivery
//! absorbed by the external message id).

use crate::models::{BroadcastEvent, Platform, StreamEvent};
use crate::normalize::{self, InboundMessage};
use crate::store::{InboundRecord, IngestOutcome, Store, StoreError};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

// === Webhook envelope (WhatsApp Business shape) ===

#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    pub id: Option<String>,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookChange {
    pub value: ChangeValue,
}

#[derive(Debug, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub statuses: Vec<StatusEvent>,
    /// Sender profiles riding along with the messages (display-name hints)
    #[serde(default)]
    pub contacts: Vec<WebhookContact>,
}

/// Delivery/read status update for a previously sent message
#[derive(Debug, Deserialize)]
pub struct StatusEvent {
    /// External id of the message the status refers to
    pub id: String,
    pub status: String,
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookContact {
    pub wa_id: Option<String>,
    pub profile: Option<WebhookProfile>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookProfile {
    pub name: Option<String>,
}

/// Counters for one processed webhook batch
#[derive(Debug, Default)]
pub struct WebhookSummary {
    pub ingested: usize,
    pub duplicates: usize,
    pub statuses_applied: usize,
    pub statuses_dropped: usize,
    pub failed: usize,
}

/// Parse the platform's epoch-seconds string, falling back to now.
fn event_time(timestamp: Option<&str>) -> DateTime<Utc> {
    timestamp
        .and_then(|t| t.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}

/// Process one webhook batch for an already-validated platform.
///
/// Never fails as a whole: per-event errors are logged and counted.
pub async fn process_webhook(
    store: &Store,
    platform: &Platform,
    envelope: &WebhookEnvelope,
    broadcast_tx: &broadcast::Sender<BroadcastEvent>,
) -> WebhookSummary {
    let mut summary = WebhookSummary::default();

    for entry in &envelope.entry {
        for change in &entry.changes {
            for message in &change.value.messages {
                match ingest_one(store, platform, message, &change.value.contacts).await {
                    Ok(IngestOutcome::Created {
                        message,
                        conversation,
                    }) => {
                        summary.ingested += 1;
                        let _ = broadcast_tx.send(BroadcastEvent {
                            user_id: conversation.user_id,
                            event: StreamEvent::MessageReceived {
                                conversation_id: conversation.id,
                                message,
                            },
                        });
                        let _ = broadcast_tx.send(BroadcastEvent {
                            user_id: conversation.user_id,
                            event: StreamEvent::ConversationUpdated { conversation },
                        });
                    }
                    Ok(IngestOutcome::Duplicate) => summary.duplicates += 1,
                    Err(err) => {
                        summary.failed += 1;
                        warn!(
                            platform = %platform.name,
                            error = %err,
                            "Failed to ingest inbound message, continuing batch"
                        );
                    }
                }
            }

            for status in &change.value.statuses {
                match store
                    .apply_status_update(
                        platform.id,
                        &status.id,
                        &status.status,
                        event_time(status.timestamp.as_deref()),
                    )
                    .await
                {
                    Ok(Some(message)) => {
                        summary.statuses_applied += 1;
                        debug!(
                            message_id = message.id,
                            status = %status.status,
                            "Applied status update"
                        );
                    }
                    Ok(None) => {
                        summary.statuses_dropped += 1;
                        info!(
                            status = %status.status,
                            "Status update for untracked message, dropped"
                        );
                    }
                    Err(err) => {
                        summary.failed += 1;
                        warn!(error = %err, "Failed to apply status update, continuing batch");
                    }
                }
            }
        }
    }

    info!(
        platform = %platform.name,
        ingested = summary.ingested,
        duplicates = summary.duplicates,
        statuses_applied = summary.statuses_applied,
        statuses_dropped = summary.statuses_dropped,
        failed = summary.failed,
        "Processed webhook batch"
    );

    summary
}

async fn ingest_one(
    store: &Store,
    platform: &Platform,
    message: &InboundMessage,
    profiles: &[WebhookContact],
) -> Result<IngestOutcome, StoreError> {
    let normalized = normalize::normalize(message);

    let display_name_hint = profiles
        .iter()
        .find(|c| c.wa_id.as_deref() == Some(message.from.as_str()))
        .and_then(|c| c.profile.as_ref())
        .and_then(|p| p.name.as_deref());

    store
        .ingest_message(&InboundRecord {
            platform,
            external_party_id: &message.from,
            display_name_hint,
            external_thread_id: None,
            platform_message_id: &message.id,
            normalized: &normalized,
            // The platform handed the message to us, so it is delivered
            // from its point of view.
            is_delivered: true,
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_messages_and_statuses() {
        let body = serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "entry-1",
                "changes": [{
                    "value": {
                        "contacts": [{ "wa_id": "34600000099", "profile": { "name": "Ana" } }],
                        "messages": [{
                            "id": "wamid.A",
                            "from": "34600000099",
                            "timestamp": "1700000000",
                            "type": "text",
                            "text": { "body": "Hola" }
                        }],
                        "statuses": [{
                            "id": "wamid.B",
                            "status": "read",
                            "timestamp": "1700000100"
                        }]
                    }
                }]
            }]
        });

        let envelope: WebhookEnvelope = serde_json::from_value(body).unwrap();
        assert_eq!(envelope.object.as_deref(), Some("whatsapp_business_account"));
        let value = &envelope.entry[0].changes[0].value;
        assert_eq!(value.messages.len(), 1);
        assert_eq!(value.messages[0].from, "34600000099");
        assert_eq!(value.statuses[0].status, "read");
        assert_eq!(
            value.contacts[0].profile.as_ref().unwrap().name.as_deref(),
            Some("Ana")
        );
    }

    #[test]
    fn event_time_parses_epoch_seconds() {
        let t = event_time(Some("1700000000"));
        assert_eq!(t.timestamp(), 1_700_000_000);

        // Garbage falls back to "now" rather than failing the event.
        let now = Utc::now();
        assert!(event_time(Some("not-a-number")) >= now - chrono::Duration::seconds(5));
        assert!(event_time(None) >= now - chrono::Duration::seconds(5));
    }
}
