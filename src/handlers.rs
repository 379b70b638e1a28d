//! HTTP request handlers for the hub backend API.
//!
//! User-scoped handlers resolve the caller from the bearer token first.
//! Webhook handlers run without a user context and always ack fast: once the
//! envelope parses, per-event failures are logged and consumed.

use crate::auth::{self, AuthError};
use crate::config::Config;
use crate::ingest::{self, WebhookEnvelope};
use crate::models::*;
use crate::outbound::PlatformSender;
use crate::registry::PlatformRegistry;
use crate::store::{Store, StoreError};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

/// Broadcast channel capacity for SSE events
const BROADCAST_CAPACITY: usize = 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub registry: Arc<PlatformRegistry>,
    pub sender: Arc<PlatformSender>,
    pub config: Arc<Config>,
    /// Broadcast channel for SSE events
    pub broadcast_tx: broadcast::Sender<BroadcastEvent>,
}

impl AppState {
    pub fn new(store: Store, sender: Arc<PlatformSender>, config: Config) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            registry: Arc::new(PlatformRegistry::new(store.clone())),
            store,
            sender,
            config: Arc::new(config),
            broadcast_tx,
        }
    }

    fn page(&self, query: &PageQuery) -> (i64, i64) {
        query.clamp(self.config.default_page_size, self.config.max_page_size)
    }
}

// === Health Check ===

/// GET /health - Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// === Identity collaborator surface ===

/// POST /v1/users - Register an account and issue its API token
pub async fn register_user(
    State(state): State<AppState>,
    Json(req): Json<RegisterUserRequest>,
) -> Result<(StatusCode, Json<RegisterUserResponse>), ApiError> {
    if !req.email.contains('@') {
        return Err(ApiError::InvalidInput("invalid email"));
    }
    if req.username.trim().is_empty() {
        return Err(ApiError::InvalidInput("username required"));
    }

    let token = auth::generate_token();
    let user = state
        .store
        .create_user(&req.email, &req.username, &auth::hash_token(&token))
        .await?;

    info!(user_id = user.id, "User registered");

    Ok((
        StatusCode::CREATED,
        Json(RegisterUserResponse {
            user_id: user.id,
            api_token: token,
        }),
    ))
}

// === Platform registry ===

/// GET /v1/platforms - List all platforms
pub async fn list_platforms(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Platform>>, ApiError> {
    auth::authenticate(&state.store, &headers).await?;
    Ok(Json(state.registry.list().await?))
}

/// POST /v1/platforms - Add a platform to the catalog
pub async fn create_platform(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreatePlatformRequest>,
) -> Result<(StatusCode, Json<Platform>), ApiError> {
    auth::authenticate(&state.store, &headers).await?;

    if req.name.trim().is_empty() || req.display_name.trim().is_empty() {
        return Err(ApiError::InvalidInput("name and display_name required"));
    }

    let platform = state.registry.create(&req).await?;
    Ok((StatusCode::CREATED, Json(platform)))
}

/// PUT /v1/platforms/:id - Update activation/verification flags
pub async fn update_platform(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdatePlatformRequest>,
) -> Result<Json<Platform>, ApiError> {
    auth::authenticate(&state.store, &headers).await?;
    Ok(Json(state.registry.update(id, &req).await?))
}

/// DELETE /v1/platforms/:id - Delete a platform.
///
/// Refused with 409 while any contact, conversation or message references it.
pub async fn delete_platform(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    auth::authenticate(&state.store, &headers).await?;
    state.registry.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Contacts ===

/// GET /v1/contacts - List the caller's contacts
pub async fn list_contacts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<ContactListResponse>, ApiError> {
    let user_id = auth::authenticate(&state.store, &headers).await?;
    let (limit, offset) = state.page(&query);

    let (contacts, total) = state.store.list_contacts(user_id, limit, offset).await?;
    Ok(Json(ContactListResponse {
        contacts,
        pagination: Pagination::new(total, limit, offset),
    }))
}

/// POST /v1/contacts - Explicitly create a contact
pub async fn create_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateContactRequest>,
) -> Result<(StatusCode, Json<Contact>), ApiError> {
    let user_id = auth::authenticate(&state.store, &headers).await?;

    if req.platform_contact_id.trim().is_empty() {
        return Err(ApiError::InvalidInput("platform_contact_id required"));
    }

    let platform = state.registry.get_active(&req.platform).await?;
    let contact = state.store.create_contact(user_id, &platform, &req).await?;
    Ok((StatusCode::CREATED, Json(contact)))
}

/// PUT /v1/contacts/:id - Update profile fields and flags.
///
/// Identity (platform, external id) never changes.
pub async fn update_contact(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateContactRequest>,
) -> Result<Json<Contact>, ApiError> {
    let user_id = auth::authenticate(&state.store, &headers).await?;

    if req.display_name.as_deref().is_some_and(|s| s.trim().is_empty()) {
        return Err(ApiError::InvalidInput("display_name must not be empty"));
    }

    Ok(Json(state.store.update_contact(user_id, id, &req).await?))
}

// === Conversations ===

/// GET /v1/conversations - List the caller's conversations, most recent first
pub async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<ConversationListResponse>, ApiError> {
    let user_id = auth::authenticate(&state.store, &headers).await?;
    let (limit, offset) = state.page(&query);

    let (conversations, total) = state
        .store
        .list_conversations(user_id, limit, offset)
        .await?;
    Ok(Json(ConversationListResponse {
        conversations,
        pagination: Pagination::new(total, limit, offset),
    }))
}

/// POST /v1/conversations - Open (find or create) a conversation with a contact
pub async fn open_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<OpenConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let user_id = auth::authenticate(&state.store, &headers).await?;

    let platform = state.registry.get_active(&req.platform).await?;
    let contact = state.store.get_contact(user_id, req.contact_id).await?;

    let conversation = state
        .store
        .resolve_conversation(
            Some(user_id),
            &platform,
            &contact,
            None,
            req.title.as_deref(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(conversation)))
}

/// PUT /v1/conversations/:id - Toggle the archive/pin flags
pub async fn update_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateConversationRequest>,
) -> Result<Json<Conversation>, ApiError> {
    let user_id = auth::authenticate(&state.store, &headers).await?;

    Ok(Json(
        state
            .store
            .update_conversation_flags(user_id, conversation_id, &req)
            .await?,
    ))
}

/// DELETE /v1/conversations/:id - Delete a conversation and all its messages
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user_id = auth::authenticate(&state.store, &headers).await?;

    state
        .store
        .delete_conversation(user_id, conversation_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/conversations/:id/messages - Page of messages, most recent first.
///
/// Fetching a conversation's messages flips its unread inbound messages to
/// read in one transaction; `marked_read` reports how many were flipped.
pub async fn conversation_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<ConversationMessagesResponse>, ApiError> {
    let user_id = auth::authenticate(&state.store, &headers).await?;
    let (limit, offset) = state.page(&query);

    state
        .store
        .get_conversation_for_user(user_id, conversation_id)
        .await?;

    let (messages, total) = state
        .store
        .list_messages(conversation_id, limit, offset)
        .await?;

    let marked_read = state
        .store
        .mark_conversation_read(user_id, conversation_id)
        .await?;

    Ok(Json(ConversationMessagesResponse {
        conversation_id,
        messages,
        marked_read,
        pagination: Pagination::new(total, limit, offset),
    }))
}

/// POST /v1/conversations/:id/read - Mark a whole conversation read
pub async fn mark_conversation_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let user_id = auth::authenticate(&state.store, &headers).await?;

    let marked_count = state
        .store
        .mark_conversation_read(user_id, conversation_id)
        .await?;
    Ok(Json(MarkReadResponse { marked_count }))
}

// === Messages ===

/// POST /v1/messages - Send an outbound message.
///
/// The message is persisted and the conversation preview updated before the
/// platform handoff, which runs in the background; its outcome lands on the
/// message metadata via the delivery-status path.
pub async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<SendMessageResponse>), ApiError> {
    let user_id = auth::authenticate(&state.store, &headers).await?;

    if req.content.trim().is_empty() {
        return Err(ApiError::InvalidInput("content required"));
    }

    let (message, conversation, recipient) =
        state.store.create_outbound(user_id, &req).await?;

    let _ = state.broadcast_tx.send(BroadcastEvent {
        user_id: conversation.user_id,
        event: StreamEvent::ConversationUpdated { conversation },
    });

    let dispatched = state.sender.is_enabled() && recipient.is_some();
    if dispatched {
        let store = state.store.clone();
        let sender = state.sender.clone();
        let message_id = message.id;
        let message_type = req.message_type.clone();
        let content = req.content.clone();
        let metadata = req.metadata.clone();
        let to = recipient.unwrap_or_default();

        tokio::spawn(async move {
            match sender.send(&to, &message_type, &content, metadata.as_ref()).await {
                Ok(platform_message_id) => {
                    if let Err(err) = store
                        .record_delivery_success(message_id, &platform_message_id)
                        .await
                    {
                        error!(message_id, error = %err, "Failed to record delivery success");
                    }
                }
                Err(err) => {
                    warn!(message_id, error = %err, "Platform delivery failed");
                    if let Err(err) = store
                        .record_delivery_failure(message_id, &err.to_string())
                        .await
                    {
                        error!(message_id, error = %err, "Failed to record delivery failure");
                    }
                }
            }
        });
    }

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            message,
            delivery_dispatched: dispatched,
        }),
    ))
}

/// POST /v1/messages/:id/read - Mark a single message read
pub async fn mark_message_read(
    State(state): State<AppState>,
    Path(message_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let user_id = auth::authenticate(&state.store, &headers).await?;

    let newly_marked = state.store.mark_message_read(user_id, message_id).await?;
    Ok(Json(MarkReadResponse {
        marked_count: u64::from(newly_marked),
    }))
}

// === SSE Event Stream ===

/// GET /v1/events - Server-Sent Events stream of the caller's conversation events
pub async fn event_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user_id = auth::authenticate(&state.store, &headers).await?;

    info!(user_id, "SSE client connected");

    let rx = state.broadcast_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |result| match result {
        Ok(event) if event.user_id == Some(user_id) => {
            match serde_json::to_string(&event.event) {
                Ok(json) => Some(Ok(Event::default().data(json))),
                Err(_) => None,
            }
        }
        _ => None,
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

// === Platform Webhooks ===

/// Verification handshake query (`hub.*` parameters)
#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// GET /webhooks/:platform - Verification handshake pass-through
pub async fn webhook_verify(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    let expected = state.config.whatsapp.verify_token.as_deref();

    let verified = query.mode.as_deref() == Some("subscribe")
        && expected.is_some()
        && query.verify_token.as_deref() == expected;

    if verified {
        info!(platform, "Webhook verified");
        (StatusCode::OK, query.challenge.unwrap_or_default()).into_response()
    } else {
        warn!(platform, "Webhook verification failed");
        (StatusCode::FORBIDDEN, "Forbidden").into_response()
    }
}

/// Webhook ack; counters are informational only
#[derive(Debug, serde::Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    pub ingested: usize,
    pub duplicates: usize,
    pub statuses_applied: usize,
    pub statuses_dropped: usize,
    pub failed: usize,
}

/// POST /webhooks/:platform - Inbound event batch.
///
/// Once the envelope parses this always acks 200: per-event failures are
/// logged and the events considered consumed (the platform may redeliver,
/// which the external message id absorbs).
pub async fn webhook_receive(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<WebhookAck>, ApiError> {
    let platform = state.registry.get_active(&platform).await?;

    let envelope: WebhookEnvelope =
        serde_json::from_value(body).map_err(|_| ApiError::MalformedPayload)?;

    // Subscription events for objects we do not track are acked and ignored.
    if envelope
        .object
        .as_deref()
        .is_some_and(|o| o != "whatsapp_business_account")
    {
        return Ok(Json(WebhookAck {
            status: "ignored",
            ingested: 0,
            duplicates: 0,
            statuses_applied: 0,
            statuses_dropped: 0,
            failed: 0,
        }));
    }

    let summary =
        ingest::process_webhook(&state.store, &platform, &envelope, &state.broadcast_tx).await;

    Ok(Json(WebhookAck {
        status: "ok",
        ingested: summary.ingested,
        duplicates: summary.duplicates,
        statuses_applied: summary.statuses_applied,
        statuses_dropped: summary.statuses_dropped,
        failed: summary.failed,
    }))
}

// === Error Handling ===

/// API error types
#[derive(Debug)]
pub enum ApiError {
    InvalidInput(&'static str),
    /// Referenced platform missing or inactive; never retried
    InvalidPlatform,
    NotFound,
    /// Unique constraint conflict that survived the resolver's re-fetch
    Conflict,
    /// Platform still referenced by contacts/conversations/messages
    PlatformInUse,
    /// Inbound platform event with an unrecognized shape
    MalformedPayload,
    Internal,
    /// Authorization error (wraps AuthError)
    Auth(AuthError),
}

/// Implement From<AuthError> to enable ? operator in handlers
impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Auth(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidPlatform => ApiError::InvalidPlatform,
            StoreError::NotFound => ApiError::NotFound,
            StoreError::Conflict => ApiError::Conflict,
            StoreError::PlatformInUse => ApiError::PlatformInUse,
            StoreError::Database(err) => {
                error!(error = %err, "Store failure");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Auth(auth_err) => auth_err.into_response(),
            other => {
                let (status, code, message) = match other {
                    ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", msg),
                    ApiError::InvalidPlatform => (
                        StatusCode::BAD_REQUEST,
                        "INVALID_PLATFORM",
                        "platform missing or inactive",
                    ),
                    ApiError::NotFound => {
                        (StatusCode::NOT_FOUND, "NOT_FOUND", "resource not found")
                    }
                    ApiError::Conflict => {
                        (StatusCode::CONFLICT, "CONFLICT", "resource already exists")
                    }
                    ApiError::PlatformInUse => (
                        StatusCode::CONFLICT,
                        "PLATFORM_IN_USE",
                        "platform is referenced by existing data",
                    ),
                    ApiError::MalformedPayload => (
                        StatusCode::BAD_REQUEST,
                        "MALFORMED_PAYLOAD",
                        "unrecognized event payload",
                    ),
                    ApiError::Internal => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "internal server error",
                    ),
                    ApiError::Auth(_) => unreachable!(),
                };

                let body = Json(ErrorResponse {
                    error: message.to_string(),
                    code,
                });

                (status, body).into_response()
            }
        }
    }
}
