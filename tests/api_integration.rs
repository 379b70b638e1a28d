//! Integration tests for the hub backend API endpoints.
//!
//! Tests the full HTTP API including authentication, webhook ingestion and
//! read/unread reconciliation, against an in-memory SQLite store.

use axum::http::{header, StatusCode};
use axum_test::TestServer;
use hub_backend::config::{Config, WhatsAppConfig};
use hub_backend::{build_router, outbound, AppState, Store};
use serde_json::{json, Value};

const VERIFY_TOKEN: &str = "test-verify-secret";

fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
        database_url: "sqlite::memory:".to_string(),
        default_page_size: 50,
        max_page_size: 200,
        whatsapp: WhatsAppConfig {
            api_url: "https://graph.facebook.com/v18.0".to_string(),
            // Outbound sending disabled in tests; verification enabled.
            access_token: None,
            verify_token: Some(VERIFY_TOKEN.to_string()),
            phone_number_id: None,
        },
    }
}

/// Build test server with the application router over an in-memory store.
///
/// Pool size 1: with `sqlite::memory:` every pooled connection would get its
/// own empty database.
async fn build_test_server() -> TestServer {
    let config = test_config();
    let store = Store::connect_with(&config.database_url, 1)
        .await
        .expect("in-memory store");
    let sender = outbound::create_sender(&config.whatsapp);
    let state = AppState::new(store, sender, config);

    let app = build_router(state);
    TestServer::new(app).unwrap()
}

/// Create authorization header value
fn auth_header(token: &str) -> String {
    format!("Bearer {}", token)
}

/// Register a user and return (user_id, api_token)
async fn register_user(server: &TestServer, email: &str, username: &str) -> (i64, String) {
    let response = server
        .post("/v1/users")
        .json(&json!({ "email": email, "username": username }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    (
        body["user_id"].as_i64().unwrap(),
        body["api_token"].as_str().unwrap().to_string(),
    )
}

/// Claim a contact for the user so inbound webhook traffic lands in their
/// conversations.
async fn claim_contact(server: &TestServer, token: &str, external_id: &str) -> i64 {
    let response = server
        .post("/v1/contacts")
        .add_header(header::AUTHORIZATION, auth_header(token))
        .json(&json!({
            "platform": "whatsapp",
            "platform_contact_id": external_id,
            "display_name": "Ana"
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    body["id"].as_i64().unwrap()
}

/// WhatsApp Business webhook envelope carrying one text message
fn text_webhook(wamid: &str, from: &str, body: &str) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "entry-1",
            "changes": [{
                "value": {
                    "contacts": [{ "wa_id": from, "profile": { "name": "Ana" } }],
                    "messages": [{
                        "id": wamid,
                        "from": from,
                        "timestamp": "1700000000",
                        "type": "text",
                        "text": { "body": body }
                    }]
                }
            }]
        }]
    })
}

// =============================================================================
// Health Endpoint Tests
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let server = build_test_server().await;

    let response = server.get("/health").await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

// =============================================================================
// User Registration Tests
// =============================================================================

#[tokio::test]
async fn test_register_user_returns_token_once() {
    let server = build_test_server().await;

    let (user_id, token) = register_user(&server, "ana@example.com", "ana").await;
    assert!(user_id > 0);
    assert!(token.starts_with("hub_"));

    // Token authenticates against a protected endpoint
    let response = server
        .get("/v1/contacts")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    response.assert_status_ok();
}

#[tokio::test]
async fn test_register_user_rejects_bad_email() {
    let server = build_test_server().await;

    let response = server
        .post("/v1/users")
        .json(&json!({ "email": "not-an-email", "username": "ana" }))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_register_user_duplicate_email_conflicts() {
    let server = build_test_server().await;

    register_user(&server, "ana@example.com", "ana").await;

    let response = server
        .post("/v1/users")
        .json(&json!({ "email": "ana@example.com", "username": "ana2" }))
        .await;

    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["code"], "CONFLICT");
}

// =============================================================================
// Authentication Tests
// =============================================================================

#[tokio::test]
async fn test_missing_auth_header() {
    let server = build_test_server().await;

    let response = server.get("/v1/conversations").await;

    response.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["code"], "MISSING_AUTH");
}

#[tokio::test]
async fn test_malformed_auth_header() {
    let server = build_test_server().await;

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, "Basic abc")
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["code"], "INVALID_AUTH");
}

#[tokio::test]
async fn test_unknown_token_unauthorized() {
    let server = build_test_server().await;

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header("hub_deadbeef"))
        .await;

    response.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["code"], "UNAUTHORIZED");
}

// =============================================================================
// Platform Registry Tests
// =============================================================================

#[tokio::test]
async fn test_builtin_platforms_seeded() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;

    let response = server
        .get("/v1/platforms")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"whatsapp"));
    assert!(names.contains(&"telegram"));
}

#[tokio::test]
async fn test_create_and_deactivate_platform() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;

    let response = server
        .post("/v1/platforms")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({ "name": "signal", "display_name": "Signal", "supports_e2ee": true }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let platform: Value = response.json();
    let id = platform["id"].as_i64().unwrap();
    assert_eq!(platform["is_active"], true);

    let response = server
        .put(&format!("/v1/platforms/{id}"))
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({ "is_active": false }))
        .await;
    response.assert_status_ok();
    let platform: Value = response.json();
    assert_eq!(platform["is_active"], false);

    // Deactivated platforms reject new contacts
    let response = server
        .post("/v1/contacts")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({ "platform": "signal", "platform_contact_id": "x1" }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["code"], "INVALID_PLATFORM");
}

#[tokio::test]
async fn test_delete_platform_refused_while_referenced() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;

    // whatsapp has a contact referencing it
    claim_contact(&server, &token, "34600000099").await;

    let response = server
        .get("/v1/platforms")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    let platforms: Value = response.json();
    let whatsapp_id = platforms
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["name"] == "whatsapp")
        .unwrap()["id"]
        .as_i64()
        .unwrap();

    let response = server
        .delete(&format!("/v1/platforms/{whatsapp_id}"))
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["code"], "PLATFORM_IN_USE");

    // An unreferenced platform deletes cleanly
    let response = server
        .post("/v1/platforms")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({ "name": "matrix", "display_name": "Matrix" }))
        .await;
    let id = response.json::<Value>()["id"].as_i64().unwrap();

    let response = server
        .delete(&format!("/v1/platforms/{id}"))
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    response.assert_status(StatusCode::NO_CONTENT);
}

// =============================================================================
// Contact Tests
// =============================================================================

#[tokio::test]
async fn test_duplicate_contact_conflicts() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;

    claim_contact(&server, &token, "34600000099").await;

    let response = server
        .post("/v1/contacts")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({
            "platform": "whatsapp",
            "platform_contact_id": "34600000099"
        }))
        .await;

    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["code"], "CONFLICT");
}

#[tokio::test]
async fn test_contact_display_name_defaults_to_formatted_number() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;

    let response = server
        .post("/v1/contacts")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({
            "platform": "whatsapp",
            "platform_contact_id": "34600000099"
        }))
        .await;

    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["display_name"], "+34600000099");
}

#[tokio::test]
async fn test_update_contact_flags_and_display_name() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;
    let contact_id = claim_contact(&server, &token, "34600000099").await;

    let response = server
        .put(&format!("/v1/contacts/{contact_id}"))
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({ "display_name": "Ana María", "is_favorite": true }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["display_name"], "Ana María");
    assert_eq!(body["is_favorite"], true);
    // Identity untouched, omitted flags keep their value
    assert_eq!(body["platform_contact_id"], "34600000099");
    assert_eq!(body["is_blocked"], false);
}

#[tokio::test]
async fn test_update_foreign_contact_not_found() {
    let server = build_test_server().await;
    let (_, ana_token) = register_user(&server, "ana@example.com", "ana").await;
    let (_, bob_token) = register_user(&server, "bob@example.com", "bob").await;
    let contact_id = claim_contact(&server, &ana_token, "34600000099").await;

    let response = server
        .put(&format!("/v1/contacts/{contact_id}"))
        .add_header(header::AUTHORIZATION, auth_header(&bob_token))
        .json(&json!({ "is_favorite": true }))
        .await;

    response.assert_status(StatusCode::NOT_FOUND);
}

// =============================================================================
// Webhook Verification Tests
// =============================================================================

#[tokio::test]
async fn test_webhook_verify_echoes_challenge() {
    let server = build_test_server().await;

    let response = server
        .get("/webhooks/whatsapp")
        .add_query_param("hub.mode", "subscribe")
        .add_query_param("hub.verify_token", VERIFY_TOKEN)
        .add_query_param("hub.challenge", "challenge-42")
        .await;

    response.assert_status_ok();
    response.assert_text("challenge-42");
}

#[tokio::test]
async fn test_webhook_verify_rejects_bad_token() {
    let server = build_test_server().await;

    let response = server
        .get("/webhooks/whatsapp")
        .add_query_param("hub.mode", "subscribe")
        .add_query_param("hub.verify_token", "wrong")
        .add_query_param("hub.challenge", "challenge-42")
        .await;

    response.assert_status(StatusCode::FORBIDDEN);
}

// =============================================================================
// Webhook Ingestion Tests
// =============================================================================

#[tokio::test]
async fn test_inbound_message_updates_conversation() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;
    claim_contact(&server, &token, "34600000099").await;

    let response = server
        .post("/webhooks/whatsapp")
        .json(&text_webhook("wamid.A1", "34600000099", "Hola"))
        .await;
    response.assert_status_ok();
    let ack: Value = response.json();
    assert_eq!(ack["ingested"], 1);
    assert_eq!(ack["duplicates"], 0);

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    let conversations = body["conversations"].as_array().unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0]["unread_count"], 1);
    assert_eq!(conversations[0]["last_message_text"], "Hola");
}

#[tokio::test]
async fn test_redelivered_message_is_a_noop() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;
    claim_contact(&server, &token, "34600000099").await;

    let payload = text_webhook("wamid.A1", "34600000099", "Hola");
    server.post("/webhooks/whatsapp").json(&payload).await;

    // Redelivery of the exact same event
    let response = server.post("/webhooks/whatsapp").json(&payload).await;
    response.assert_status_ok();
    let ack: Value = response.json();
    assert_eq!(ack["ingested"], 0);
    assert_eq!(ack["duplicates"], 1);

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    let body: Value = response.json();
    let conversations = body["conversations"].as_array().unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0]["unread_count"], 1);
}

#[tokio::test]
async fn test_media_message_preview() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;
    claim_contact(&server, &token, "34600000099").await;

    let payload = json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "changes": [{
                "value": {
                    "messages": [{
                        "id": "wamid.IMG1",
                        "from": "34600000099",
                        "timestamp": "1700000000",
                        "type": "image",
                        "image": { "id": "media-1", "caption": "Playa" }
                    }]
                }
            }]
        }]
    });
    let response = server.post("/webhooks/whatsapp").json(&payload).await;
    response.assert_status_ok();

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    let body: Value = response.json();
    assert_eq!(
        body["conversations"][0]["last_message_text"],
        "[Image] Playa"
    );
}

#[tokio::test]
async fn test_unknown_message_type_still_ingested() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;
    claim_contact(&server, &token, "34600000099").await;

    let payload = json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "changes": [{
                "value": {
                    "messages": [{
                        "id": "wamid.X1",
                        "from": "34600000099",
                        "timestamp": "1700000000",
                        "type": "sticker"
                    }]
                }
            }]
        }]
    });
    let response = server.post("/webhooks/whatsapp").json(&payload).await;
    response.assert_status_ok();
    let ack: Value = response.json();
    assert_eq!(ack["ingested"], 1);

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    let body: Value = response.json();
    assert_eq!(body["conversations"][0]["last_message_text"], "[sticker]");
}

#[tokio::test]
async fn test_webhook_malformed_payload_rejected() {
    let server = build_test_server().await;

    let response = server
        .post("/webhooks/whatsapp")
        .json(&json!({ "entry": "not-an-array" }))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["code"], "MALFORMED_PAYLOAD");
}

#[tokio::test]
async fn test_webhook_unknown_platform_rejected() {
    let server = build_test_server().await;

    let response = server
        .post("/webhooks/carrierpigeon")
        .json(&text_webhook("wamid.A1", "34600000099", "Hola"))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["code"], "INVALID_PLATFORM");
}

#[tokio::test]
async fn test_webhook_foreign_object_ignored() {
    let server = build_test_server().await;

    let response = server
        .post("/webhooks/whatsapp")
        .json(&json!({ "object": "instagram", "entry": [] }))
        .await;

    response.assert_status_ok();
    let ack: Value = response.json();
    assert_eq!(ack["status"], "ignored");
}

// =============================================================================
// Read/Unread Reconciliation Tests
// =============================================================================

#[tokio::test]
async fn test_fetching_messages_marks_them_read() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;
    claim_contact(&server, &token, "34600000099").await;

    server
        .post("/webhooks/whatsapp")
        .json(&text_webhook("wamid.A1", "34600000099", "Hola"))
        .await;
    server
        .post("/webhooks/whatsapp")
        .json(&text_webhook("wamid.A2", "34600000099", "¿Qué tal?"))
        .await;

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    let body: Value = response.json();
    let conversation_id = body["conversations"][0]["id"].as_i64().unwrap();
    assert_eq!(body["conversations"][0]["unread_count"], 2);

    // Fetching the page flips both to read
    let response = server
        .get(&format!("/v1/conversations/{conversation_id}/messages"))
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["marked_read"], 2);
    assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    // Most recent first
    assert_eq!(body["messages"][0]["content"], "¿Qué tal?");

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    let body: Value = response.json();
    assert_eq!(body["conversations"][0]["unread_count"], 0);
}

#[tokio::test]
async fn test_mark_conversation_read_idempotent() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;
    claim_contact(&server, &token, "34600000099").await;

    server
        .post("/webhooks/whatsapp")
        .json(&text_webhook("wamid.A1", "34600000099", "Hola"))
        .await;

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    let conversation_id =
        response.json::<Value>()["conversations"][0]["id"].as_i64().unwrap();

    let response = server
        .post(&format!("/v1/conversations/{conversation_id}/read"))
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["marked_count"], 1);

    // Second call marks nothing and never drives the counter negative
    let response = server
        .post(&format!("/v1/conversations/{conversation_id}/read"))
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["marked_count"], 0);

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    let body: Value = response.json();
    assert_eq!(body["conversations"][0]["unread_count"], 0);
}

#[tokio::test]
async fn test_mark_read_foreign_conversation_not_found() {
    let server = build_test_server().await;
    let (_, ana_token) = register_user(&server, "ana@example.com", "ana").await;
    let (_, bob_token) = register_user(&server, "bob@example.com", "bob").await;
    claim_contact(&server, &ana_token, "34600000099").await;

    server
        .post("/webhooks/whatsapp")
        .json(&text_webhook("wamid.A1", "34600000099", "Hola"))
        .await;

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&ana_token))
        .await;
    let conversation_id =
        response.json::<Value>()["conversations"][0]["id"].as_i64().unwrap();

    // Another user cannot touch it
    let response = server
        .post(&format!("/v1/conversations/{conversation_id}/read"))
        .add_header(header::AUTHORIZATION, auth_header(&bob_token))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
}

// =============================================================================
// Outbound Send Tests
// =============================================================================

#[tokio::test]
async fn test_send_message_updates_preview_not_unread() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;
    let contact_id = claim_contact(&server, &token, "34600000099").await;

    let response = server
        .post("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({ "platform": "whatsapp", "contact_id": contact_id }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let conversation_id = response.json::<Value>()["id"].as_i64().unwrap();

    let response = server
        .post("/v1/messages")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({ "conversation_id": conversation_id, "content": "Nos vemos" }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["message"]["is_from_user"], true);
    // Sender not configured in tests
    assert_eq!(body["delivery_dispatched"], false);

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    let body: Value = response.json();
    assert_eq!(body["conversations"][0]["last_message_text"], "Nos vemos");
    // Own messages never count as unread
    assert_eq!(body["conversations"][0]["unread_count"], 0);
}

#[tokio::test]
async fn test_send_message_to_foreign_conversation_not_found() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;

    let response = server
        .post("/v1/messages")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({ "conversation_id": 9999, "content": "hi" }))
        .await;

    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_open_conversation_find_or_create() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;
    let contact_id = claim_contact(&server, &token, "34600000099").await;

    let response = server
        .post("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({ "platform": "whatsapp", "contact_id": contact_id }))
        .await;
    let first = response.json::<Value>()["id"].as_i64().unwrap();

    // Opening again resolves to the same conversation
    let response = server
        .post("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({ "platform": "whatsapp", "contact_id": contact_id }))
        .await;
    let second = response.json::<Value>()["id"].as_i64().unwrap();
    assert_eq!(first, second);
}

// =============================================================================
// Conversation Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_archive_and_pin_conversation() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;
    let contact_id = claim_contact(&server, &token, "34600000099").await;

    let response = server
        .post("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({ "platform": "whatsapp", "contact_id": contact_id }))
        .await;
    let conversation_id = response.json::<Value>()["id"].as_i64().unwrap();

    let response = server
        .put(&format!("/v1/conversations/{conversation_id}"))
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({ "is_pinned": true }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["is_pinned"], true);
    assert_eq!(body["is_archived"], false);

    let response = server
        .put(&format!("/v1/conversations/{conversation_id}"))
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .json(&json!({ "is_archived": true }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    // Omitted flag keeps its value
    assert_eq!(body["is_pinned"], true);
    assert_eq!(body["is_archived"], true);

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    let body: Value = response.json();
    assert_eq!(body["conversations"][0]["is_pinned"], true);
    assert_eq!(body["conversations"][0]["is_archived"], true);
}

#[tokio::test]
async fn test_delete_conversation_cascades_to_messages() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;
    claim_contact(&server, &token, "34600000099").await;

    server
        .post("/webhooks/whatsapp")
        .json(&text_webhook("wamid.D1", "34600000099", "Hola"))
        .await;
    server
        .post("/webhooks/whatsapp")
        .json(&text_webhook("wamid.D2", "34600000099", "¿Sigues ahí?"))
        .await;

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    let conversation_id =
        response.json::<Value>()["conversations"][0]["id"].as_i64().unwrap();

    let response = server
        .delete(&format!("/v1/conversations/{conversation_id}"))
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    response.assert_status(StatusCode::NO_CONTENT);

    // Conversation and its messages are gone
    let response = server
        .get(&format!("/v1/conversations/{conversation_id}/messages"))
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    let body: Value = response.json();
    assert_eq!(body["conversations"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_delete_foreign_conversation_not_found() {
    let server = build_test_server().await;
    let (_, ana_token) = register_user(&server, "ana@example.com", "ana").await;
    let (_, bob_token) = register_user(&server, "bob@example.com", "bob").await;
    let contact_id = claim_contact(&server, &ana_token, "34600000099").await;

    let response = server
        .post("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&ana_token))
        .json(&json!({ "platform": "whatsapp", "contact_id": contact_id }))
        .await;
    let conversation_id = response.json::<Value>()["id"].as_i64().unwrap();

    let response = server
        .delete(&format!("/v1/conversations/{conversation_id}"))
        .add_header(header::AUTHORIZATION, auth_header(&bob_token))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
}

// =============================================================================
// Pagination Tests
// =============================================================================

#[tokio::test]
async fn test_message_pagination_envelope() {
    let server = build_test_server().await;
    let (_, token) = register_user(&server, "ana@example.com", "ana").await;
    claim_contact(&server, &token, "34600000099").await;

    for i in 0..5 {
        server
            .post("/webhooks/whatsapp")
            .json(&text_webhook(
                &format!("wamid.P{i}"),
                "34600000099",
                &format!("msg {i}"),
            ))
            .await;
    }

    let response = server
        .get("/v1/conversations")
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .await;
    let conversation_id =
        response.json::<Value>()["conversations"][0]["id"].as_i64().unwrap();

    let response = server
        .get(&format!("/v1/conversations/{conversation_id}/messages"))
        .add_header(header::AUTHORIZATION, auth_header(&token))
        .add_query_param("limit", "2")
        .add_query_param("offset", "0")
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    assert_eq!(body["pagination"]["total"], 5);
    assert_eq!(body["pagination"]["limit"], 2);
    assert_eq!(body["pagination"]["has_more"], true);
}
