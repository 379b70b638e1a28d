//! Outbound delivery to the external platform send API.
//!
//! Best-effort handoff: the message is already persisted locally before this
//! client is involved, and the result of the handoff is recorded on the
//! message's metadata, never surfaced synchronously to the caller.

use crate::config::WhatsAppConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Delivery errors, recorded on message metadata as a failed status
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("platform sender not configured")]
    NotConfigured,

    #[error("platform API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("platform API returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("platform API response missing message id")]
    MalformedResponse,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

/// Client for the WhatsApp Business send API.
///
/// Configuration is passed in explicitly; when credentials are absent the
/// sender is disabled and messages stay local-only.
pub struct PlatformSender {
    http: reqwest::Client,
    config: WhatsAppConfig,
}

impl PlatformSender {
    pub fn new(config: WhatsAppConfig) -> Self {
        if !config.is_configured() {
            warn!("WhatsApp sender not configured - outbound delivery disabled");
        }
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Check if outbound delivery is enabled
    pub fn is_enabled(&self) -> bool {
        self.config.is_configured()
    }

    /// Send a message to an external party. Returns the external message id
    /// used later to correlate status events.
    pub async fn send(
        &self,
        to: &str,
        message_type: &str,
        content: &str,
        metadata: Option<&Value>,
    ) -> Result<String, DeliveryError> {
        let (Some(token), Some(phone_number_id)) = (
            self.config.access_token.as_deref(),
            self.config.phone_number_id.as_deref(),
        ) else {
            return Err(DeliveryError::NotConfigured);
        };

        let payload = build_payload(to, message_type, content, metadata);
        let url = format!("{}/{}/messages", self.config.api_url, phone_number_id);

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: SendResponse = response.json().await?;
        let id = body
            .messages
            .first()
            .map(|m| m.id.clone())
            .ok_or(DeliveryError::MalformedResponse)?;

        debug!(platform_message_id = %id, "Handed message to platform");
        Ok(id)
    }
}

/// Build the platform send payload for a message type. Media and location
/// payloads pull their links/coordinates from the caller's metadata; anything
/// unrecognized falls back to text.
fn build_payload(to: &str, message_type: &str, content: &str, metadata: Option<&Value>) -> Value {
    let meta = |key: &str| -> Option<&Value> { metadata.and_then(|m| m.get(key)) };
    let meta_str =
        |key: &str| -> String { meta(key).and_then(|v| v.as_str()).unwrap_or("").to_string() };

    let mut payload = json!({
        "messaging_product": "whatsapp",
        "to": to,
        "type": message_type,
    });

    match message_type {
        "text" => payload["text"] = json!({ "body": content }),
        "image" => {
            payload["image"] = json!({
                "link": meta("image_url").and_then(|v| v.as_str()).unwrap_or(content),
                "caption": meta_str("caption"),
            });
        }
        "video" => {
            payload["video"] = json!({
                "link": meta("video_url").and_then(|v| v.as_str()).unwrap_or(content),
                "caption": meta_str("caption"),
            });
        }
        "document" => {
            payload["document"] = json!({
                "link": meta("document_url").and_then(|v| v.as_str()).unwrap_or(content),
                "filename": meta("filename").and_then(|v| v.as_str()).unwrap_or("document"),
            });
        }
        "audio" => {
            payload["audio"] = json!({
                "link": meta("audio_url").and_then(|v| v.as_str()).unwrap_or(content),
            });
        }
        "location" => {
            payload["location"] = json!({
                "latitude": meta("latitude").cloned().unwrap_or(Value::Null),
                "longitude": meta("longitude").cloned().unwrap_or(Value::Null),
                "name": meta_str("name"),
                "address": meta_str("address"),
            });
        }
        _ => {
            payload["type"] = json!("text");
            payload["text"] = json!({ "body": content });
        }
    }

    payload
}

/// Create a shared platform sender
pub fn create_sender(config: &WhatsAppConfig) -> Arc<PlatformSender> {
    Arc::new(PlatformSender::new(config.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_shape() {
        let p = build_payload("34600000099", "text", "Hola", None);
        assert_eq!(p["messaging_product"], "whatsapp");
        assert_eq!(p["to"], "34600000099");
        assert_eq!(p["type"], "text");
        assert_eq!(p["text"]["body"], "Hola");
    }

    #[test]
    fn image_payload_pulls_link_from_metadata() {
        let meta = json!({ "image_url": "https://cdn.example/img.jpg", "caption": "Playa" });
        let p = build_payload("34600000099", "image", "ignored", Some(&meta));
        assert_eq!(p["image"]["link"], "https://cdn.example/img.jpg");
        assert_eq!(p["image"]["caption"], "Playa");
    }

    #[test]
    fn unknown_type_falls_back_to_text() {
        let p = build_payload("34600000099", "sticker", "hi", None);
        assert_eq!(p["type"], "text");
        assert_eq!(p["text"]["body"], "hi");
    }

    #[test]
    fn unconfigured_sender_is_disabled() {
        let sender = PlatformSender::new(WhatsAppConfig {
            api_url: "https://graph.facebook.com/v18.0".to_string(),
            access_token: None,
            verify_token: None,
            phone_number_id: None,
        });
        assert!(!sender.is_enabled());
    }
}
