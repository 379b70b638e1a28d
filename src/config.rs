//! Configuration for the hub backend server.
//!
//! All configuration is loaded from environment variables.
//! No secrets are logged.

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub bind_addr: String,

    /// Server port
    pub port: u16,

    /// SQLite database URL
    pub database_url: String,

    // === Pagination ===
    /// Default page size for list endpoints
    pub default_page_size: i64,

    /// Maximum page size a client may request
    pub max_page_size: i64,

    // === WhatsApp Business API ===
    pub whatsapp: WhatsAppConfig,
}

/// Credentials and endpoints for the WhatsApp Business send API.
///
/// Passed explicitly into the outbound sender, never read from ambient
/// process state at call time.
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    /// Graph API base URL
    pub api_url: String,

    /// Bearer token for the Graph API
    pub access_token: Option<String>,

    /// Shared secret for the webhook verification handshake
    pub verify_token: Option<String>,

    /// Business phone number id (sender identity)
    pub phone_number_id: Option<String>,
}

impl WhatsAppConfig {
    /// Check if outbound sending is configured
    pub fn is_configured(&self) -> bool {
        self.access_token.is_some() && self.phone_number_id.is_some()
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),

            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:hub.db?mode=rwc".to_string()),

            default_page_size: std::env::var("DEFAULT_PAGE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(50),
            max_page_size: std::env::var("MAX_PAGE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(200),

            whatsapp: WhatsAppConfig {
                api_url: std::env::var("WHATSAPP_API_URL")
                    .unwrap_or_else(|_| "https://graph.facebook.com/v18.0".to_string()),
                access_token: std::env::var("WHATSAPP_ACCESS_TOKEN").ok(),
                verify_token: std::env::var("WHATSAPP_VERIFY_TOKEN").ok(),
                phone_number_id: std::env::var("WHATSAPP_PHONE_NUMBER_ID").ok(),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
