//! Hub Backend - Messaging Unification Hub
//!
//! Aggregates contacts, conversations and messages from multiple external
//! messaging platforms behind one API:
//! - Inbound platform webhooks are normalized onto a canonical model
//! - Conversation aggregates (previews, unread counts) stay transactionally
//!   consistent with the message log
//! - Redelivered platform events are absorbed by external message ids

use hub_backend::{build_router, AppState, Config, Store};
use hub_backend::outbound;
use tracing::info;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Initialize structured logging
    init_tracing();

    // Load and validate configuration
    let config = Config::from_env();
    log_startup_info(&config);

    // Initialize core components
    let store = Store::connect(&config.database_url)
        .await
        .expect("Failed to initialize store");
    let sender = outbound::create_sender(&config.whatsapp);
    let state = AppState::new(store, sender, config.clone());

    // Build and serve the application
    let app = build_router(state);
    serve(app, &config).await;
}

/// Initialize tracing with environment-based log levels.
fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hub_backend=debug,tower_http=info")),
        )
        .init();
}

/// Log startup configuration (no secrets).
fn log_startup_info(config: &Config) {
    info!(
        bind_addr = %config.bind_addr,
        port = config.port,
        database_url = %config.database_url,
        default_page_size = config.default_page_size,
        whatsapp_sender_enabled = config.whatsapp.is_configured(),
        "Starting hub backend"
    );
}

/// Bind to address and serve the application.
async fn serve(app: axum::Router, config: &Config) {
    let bind_addr = format!("{}:{}", config.bind_addr, config.port);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    info!(addr = %bind_addr, "Server listening");

    axum::serve(listener, app).await.expect("Server error");
}
