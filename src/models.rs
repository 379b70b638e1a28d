//! Data models for the hub backend.
//!
//! Rows mirror the four core tables (platforms, contacts, conversations,
//! messages) plus the thin users table backing the identity collaborator.
//! Messages are append-only facts: after creation only the status flags and
//! metadata may change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

/// Free-form JSON metadata column
pub type Metadata = Json<serde_json::Value>;

// ============================================================================
// Persisted rows
// ============================================================================

/// A registered user account (identity collaborator surface).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    /// SHA-256 hash of the API token, hex-encoded
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub is_verified: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// An external messaging service integrated via its own API/webhook contract.
///
/// Identity (`name`) is immutable once created; only the activation and
/// verification flags may change. Deletion is refused while any contact,
/// conversation or message references the platform.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Platform {
    pub id: i64,
    /// Stable key, e.g. "whatsapp"
    pub name: String,
    pub display_name: String,
    pub is_active: bool,
    pub supports_e2ee: bool,
    pub requires_verification: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical record of an external party.
///
/// `user_id` is nullable: webhook-driven creation happens before any user has
/// claimed the contact. Unique per `(user_id, platform_id, platform_contact_id)`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Contact {
    pub id: i64,
    pub user_id: Option<i64>,
    pub platform_id: i64,
    /// External identifier, e.g. phone number
    pub platform_contact_id: String,
    pub display_name: String,
    pub phone_number: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub is_favorite: bool,
    pub is_blocked: bool,
    pub last_interaction: Option<DateTime<Utc>>,
    pub metadata: Option<Metadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical thread of messages with one external party or group.
///
/// `last_message_text`/`last_message_at` are a denormalized cache of the
/// latest message, recomputed transactionally with every message write.
/// `unread_count` always equals the count of inbound unread messages.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: i64,
    pub user_id: Option<i64>,
    pub platform_id: i64,
    pub contact_id: Option<i64>,
    /// External thread id, when the platform exposes one
    pub platform_conversation_id: Option<String>,
    pub title: String,
    pub is_group: bool,
    pub group_participants: Option<Metadata>,
    pub last_message_text: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
    pub is_archived: bool,
    pub is_pinned: bool,
    pub metadata: Option<Metadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One inbound or outbound communication event.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub platform_id: i64,
    /// External message id; unique per (conversation, platform) when present.
    /// Used for idempotent redelivery and status-update correlation.
    pub platform_message_id: Option<String>,
    pub sender_contact_id: Option<i64>,
    pub message_type: String,
    pub content: Option<String>,
    pub encrypted_content: Option<String>,
    pub is_encrypted: bool,
    pub is_from_user: bool,
    pub is_delivered: bool,
    pub is_read: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub metadata: Option<Metadata>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Pagination
// ============================================================================

/// `limit`/`offset` query parameters for list endpoints
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl PageQuery {
    /// Clamp the requested page against configured defaults.
    pub fn clamp(&self, default_size: i64, max_size: i64) -> (i64, i64) {
        let limit = self.limit.unwrap_or(default_size).clamp(1, max_size);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

/// Pagination envelope included in list responses
#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

impl Pagination {
    pub fn new(total: i64, limit: i64, offset: i64) -> Self {
        Self {
            total,
            limit,
            offset,
            has_more: offset + limit < total,
        }
    }
}

// === API Request/Response Models ===

/// Register user request
#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    pub email: String,
    pub username: String,
}

/// Register user response; `api_token` is shown exactly once
#[derive(Debug, Serialize)]
pub struct RegisterUserResponse {
    pub user_id: i64,
    pub api_token: String,
}

/// Create platform request
#[derive(Debug, Deserialize)]
pub struct CreatePlatformRequest {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub supports_e2ee: bool,
    #[serde(default)]
    pub requires_verification: bool,
}

/// Update platform request (mutable flags only; identity is immutable)
#[derive(Debug, Deserialize)]
pub struct UpdatePlatformRequest {
    pub is_active: Option<bool>,
    pub requires_verification: Option<bool>,
}

/// Create contact request
#[derive(Debug, Deserialize)]
pub struct CreateContactRequest {
    /// Platform name, e.g. "whatsapp"
    pub platform: String,
    pub platform_contact_id: String,
    pub display_name: Option<String>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
}

/// Update contact request. Profile fields and flags only; identity
/// (platform, external id) is immutable. Omitted fields keep their value.
#[derive(Debug, Deserialize)]
pub struct UpdateContactRequest {
    pub display_name: Option<String>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub is_favorite: Option<bool>,
    pub is_blocked: Option<bool>,
}

/// List contacts response
#[derive(Debug, Serialize)]
pub struct ContactListResponse {
    pub contacts: Vec<Contact>,
    pub pagination: Pagination,
}

/// Open (find-or-create) conversation request
#[derive(Debug, Deserialize)]
pub struct OpenConversationRequest {
    /// Platform name, e.g. "whatsapp"
    pub platform: String,
    pub contact_id: i64,
    pub title: Option<String>,
}

/// Update conversation request (archive/pin flags only)
#[derive(Debug, Deserialize)]
pub struct UpdateConversationRequest {
    pub is_archived: Option<bool>,
    pub is_pinned: Option<bool>,
}

/// List conversations response
#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<Conversation>,
    pub pagination: Pagination,
}

/// Conversation messages response. Fetching a page also flips unread inbound
/// messages to read; `marked_read` reports how many were flipped.
#[derive(Debug, Serialize)]
pub struct ConversationMessagesResponse {
    pub conversation_id: i64,
    pub messages: Vec<Message>,
    pub marked_read: u64,
    pub pagination: Pagination,
}

/// Mark-read response
#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub marked_count: u64,
}

/// Send message request
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: i64,
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    pub metadata: Option<serde_json::Value>,
}

fn default_message_type() -> String {
    "text".to_string()
}

/// Send message response
#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message: Message,
    /// False when the platform sender is not configured; the message is still
    /// persisted locally and delivery status arrives via the webhook later.
    pub delivery_dispatched: bool,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

// === SSE Event Models ===

/// Event sent over the per-user SSE stream
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A new inbound message landed in one of the user's conversations
    MessageReceived {
        conversation_id: i64,
        message: Message,
    },
    /// A conversation's aggregates changed (preview, unread count)
    ConversationUpdated { conversation: Conversation },
}

/// Internal broadcast event (owning user + event)
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    /// Owning user; None for events on unclaimed conversations
    pub user_id: Option<i64>,
    pub event: StreamEvent,
}
