//! Inbound payload normalization.
//!
//! Maps a platform-specific message payload onto the canonical message shape:
//! a type tag, optional plain content, a human-readable preview string used
//! for the conversation's `last_message_text`, and a type-specific metadata
//! object. Pure: no I/O, deterministic for the same payload. Unknown payload
//! kinds fall through to a `[<type>]` preview and never abort ingestion.

use serde::Deserialize;
use serde_json::{json, Value};

/// One inbound message as delivered inside a webhook batch
/// (WhatsApp Business shape; other platforms are mapped into it).
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    /// External message id
    pub id: String,
    /// External party identifier (e.g. phone number)
    pub from: String,
    /// Epoch-seconds timestamp, as the platform sends it
    pub timestamp: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub text: Option<TextPayload>,
    pub image: Option<MediaPayload>,
    pub video: Option<MediaPayload>,
    pub audio: Option<MediaPayload>,
    pub document: Option<DocumentPayload>,
    pub location: Option<LocationPayload>,
    pub contacts: Option<Vec<SharedContact>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextPayload {
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    pub id: Option<String>,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentPayload {
    pub id: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationPayload {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SharedContact {
    pub name: Option<SharedContactName>,
    #[serde(default)]
    pub phones: Vec<SharedContactPhone>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SharedContactName {
    pub formatted_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SharedContactPhone {
    pub phone_number: Option<String>,
}

/// Canonical shape of one normalized message
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    /// Canonical type tag: text/image/document/audio/video/location/contacts,
    /// or the platform's own tag for unrecognized kinds
    pub message_type: String,
    /// Plain content; None for unrecognized kinds
    pub content: Option<String>,
    /// Display string for the conversation's last-message preview
    pub preview: String,
    /// Type-specific payload (external media ids, coordinates, ...)
    pub metadata: Value,
}

/// A label plus an optional suffix: `[Image] caption`, or just `[Image]`.
fn labeled(label: &str, suffix: Option<&str>) -> String {
    match suffix.map(str::trim).filter(|s| !s.is_empty()) {
        Some(suffix) => format!("{label} {suffix}"),
        None => label.to_string(),
    }
}

/// Normalize one inbound message payload.
pub fn normalize(msg: &InboundMessage) -> NormalizedMessage {
    match msg.kind.as_str() {
        "text" => {
            let body = msg.text.as_ref().map(|t| t.body.clone()).unwrap_or_default();
            NormalizedMessage {
                message_type: "text".to_string(),
                preview: body.clone(),
                content: Some(body),
                metadata: json!({}),
            }
        }
        "image" => media(msg.image.as_ref(), "image", "[Image]"),
        "video" => media(msg.video.as_ref(), "video", "[Video]"),
        "audio" => {
            let audio = msg.audio.as_ref();
            let preview = "[Audio]".to_string();
            NormalizedMessage {
                message_type: "audio".to_string(),
                content: Some(preview.clone()),
                preview,
                metadata: json!({
                    "media_id": audio.and_then(|a| a.id.clone()),
                    "mime_type": audio.and_then(|a| a.mime_type.clone()),
                }),
            }
        }
        "document" => {
            let doc = msg.document.as_ref();
            let preview = labeled("[Document]", doc.and_then(|d| d.filename.as_deref()));
            NormalizedMessage {
                message_type: "document".to_string(),
                content: Some(preview.clone()),
                preview,
                metadata: json!({
                    "media_id": doc.and_then(|d| d.id.clone()),
                    "filename": doc.and_then(|d| d.filename.clone()),
                }),
            }
        }
        "location" => {
            let loc = msg.location.as_ref();
            let preview = labeled("[Location]", loc.and_then(|l| l.name.as_deref()));
            NormalizedMessage {
                message_type: "location".to_string(),
                content: Some(preview.clone()),
                preview,
                metadata: json!({
                    "latitude": loc.and_then(|l| l.latitude),
                    "longitude": loc.and_then(|l| l.longitude),
                    "name": loc.and_then(|l| l.name.clone()),
                    "address": loc.and_then(|l| l.address.clone()),
                }),
            }
        }
        "contacts" => {
            let shared: Vec<Value> = msg
                .contacts
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|c| {
                    json!({
                        "name": c.name.as_ref().and_then(|n| n.formatted_name.clone()),
                        "phone": c.phones.first().and_then(|p| p.phone_number.clone()),
                    })
                })
                .collect();
            let preview = "[Shared contacts]".to_string();
            NormalizedMessage {
                message_type: "contacts".to_string(),
                content: Some(preview.clone()),
                preview,
                metadata: json!({ "contacts": shared }),
            }
        }
        // Unknown kinds must not abort ingestion.
        other => NormalizedMessage {
            message_type: other.to_string(),
            content: None,
            preview: format!("[{other}]"),
            metadata: json!({}),
        },
    }
}

fn media(payload: Option<&MediaPayload>, kind: &str, label: &str) -> NormalizedMessage {
    let preview = labeled(label, payload.and_then(|m| m.caption.as_deref()));
    NormalizedMessage {
        message_type: kind.to_string(),
        content: Some(preview.clone()),
        preview,
        metadata: json!({
            "media_id": payload.and_then(|m| m.id.clone()),
            "mime_type": payload.and_then(|m| m.mime_type.clone()),
        }),
    }
}
