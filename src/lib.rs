//! # Hub Backend
//!
//! Unification hub that aggregates contacts, conversations and messages from
//! multiple external messaging platforms (WhatsApp, Telegram, ...) behind one
//! API for a single user account.
//!
//! ## Design Principles
//!
//! - **Canonical model**: every inbound event is mapped onto a
//!   platform-agnostic contact/conversation/message model
//! - **Idempotent ingestion**: redelivered platform events never duplicate
//!   messages or double-count unread counters
//! - **Derived aggregates**: `last_message_text`/`last_message_at` and
//!   `unread_count` are recomputed transactionally alongside each message
//!   write, never maintained independently
//! - **Fast webhook ack**: per-event processing failures are logged and
//!   consumed, never surfaced back to the external platform
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   webhook    ┌─────────────┐   bearer    ┌──────────┐
//! │   Platform   │─────────────▶│   Backend   │◀────────────│  Client  │
//! │ (WhatsApp..) │◀─────────────│             │             └──────────┘
//! └──────────────┘   send API   └──────┬──────┘
//!                                      │
//!                               ┌──────┴──────┐
//!                               │             │
//!                            SQLite       SSE events
//! ```
//!
//! ## API Overview
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/health` | GET | Health check |
//! | `/v1/users` | POST | Register account, returns API token |
//! | `/v1/platforms` | GET/POST | List / add platforms |
//! | `/v1/platforms/:id` | PUT/DELETE | Update flags / delete (refused while referenced) |
//! | `/v1/contacts` | GET/POST | List / create contacts |
//! | `/v1/contacts/:id` | PUT | Update profile fields and flags |
//! | `/v1/conversations` | GET/POST | List / open conversations |
//! | `/v1/conversations/:id` | PUT/DELETE | Archive/pin flags / delete with messages |
//! | `/v1/conversations/:id/messages` | GET | Page of messages, marks them read |
//! | `/v1/conversations/:id/read` | POST | Mark whole conversation read |
//! | `/v1/messages` | POST | Send outbound message |
//! | `/v1/messages/:id/read` | POST | Mark one message read |
//! | `/v1/events` | GET | SSE stream of conversation events |
//! | `/webhooks/:platform` | GET | Verification handshake |
//! | `/webhooks/:platform` | POST | Inbound event batch |

pub mod auth;
pub mod config;
pub mod handlers;
pub mod ingest;
pub mod models;
pub mod normalize;
pub mod outbound;
pub mod registry;
pub mod store;

pub use config::Config;
pub use handlers::AppState;
pub use store::Store;

use axum::{
    http::{header, Method},
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

/// Maximum request body size (64 KiB). Webhook batches can carry several
/// events per request.
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Build the Axum router with all endpoints and middleware.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health check (unauthenticated)
        .route("/health", get(handlers::health))
        // Identity collaborator surface
        .route("/v1/users", post(handlers::register_user))
        // Platform registry
        .route("/v1/platforms", get(handlers::list_platforms))
        .route("/v1/platforms", post(handlers::create_platform))
        .route(
            "/v1/platforms/:id",
            put(handlers::update_platform).delete(handlers::delete_platform),
        )
        // Contacts
        .route("/v1/contacts", get(handlers::list_contacts))
        .route("/v1/contacts", post(handlers::create_contact))
        .route("/v1/contacts/:id", put(handlers::update_contact))
        // Conversations and messages
        .route("/v1/conversations", get(handlers::list_conversations))
        .route("/v1/conversations", post(handlers::open_conversation))
        .route(
            "/v1/conversations/:id",
            put(handlers::update_conversation).delete(handlers::delete_conversation),
        )
        .route(
            "/v1/conversations/:id/messages",
            get(handlers::conversation_messages),
        )
        .route(
            "/v1/conversations/:id/read",
            post(handlers::mark_conversation_read),
        )
        .route("/v1/messages", post(handlers::send_message))
        .route("/v1/messages/:id/read", post(handlers::mark_message_read))
        .route("/v1/events", get(handlers::event_stream))
        // Inbound platform webhooks (no user context)
        .route(
            "/webhooks/:platform",
            get(handlers::webhook_verify).post(handlers::webhook_receive),
        )
        // Middleware stack (order matters: first added = outermost)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
