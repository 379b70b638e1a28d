//! SQLite-backed store for the canonical contact/conversation/message model.
//!
//! All multi-row updates (ingestion, reconciliation, outbound send) run in a
//! single transaction so the conversation aggregates are never visible in a
//! half-updated state. Uniqueness invariants live in the schema:
//!
//! - one contact per `(user, platform, external id)`
//! - one conversation per `(user, platform, external thread)` or, for 1:1
//!   threads without an external id, per `(user, platform, contact)`
//! - one message per `(conversation, platform, external message id)` when the
//!   external id is present, which absorbs platform redelivery

use crate::models::*;
use crate::normalize::NormalizedMessage;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::types::Json;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    username TEXT NOT NULL UNIQUE,
    token_hash TEXT NOT NULL,
    is_verified INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_token_hash ON users(token_hash);

CREATE TABLE IF NOT EXISTS platforms (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    supports_e2ee INTEGER NOT NULL DEFAULT 0,
    requires_verification INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS contacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER REFERENCES users(id),
    platform_id INTEGER NOT NULL REFERENCES platforms(id),
    platform_contact_id TEXT NOT NULL,
    display_name TEXT NOT NULL,
    phone_number TEXT,
    email TEXT,
    avatar_url TEXT,
    is_favorite INTEGER NOT NULL DEFAULT 0,
    is_blocked INTEGER NOT NULL DEFAULT 0,
    last_interaction TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(user_id, platform_id, platform_contact_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_unclaimed
    ON contacts(platform_id, platform_contact_id) WHERE user_id IS NULL;
CREATE INDEX IF NOT EXISTS idx_contacts_external
    ON contacts(platform_id, platform_contact_id);
CREATE INDEX IF NOT EXISTS idx_contacts_user ON contacts(user_id);

CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER REFERENCES users(id),
    platform_id INTEGER NOT NULL REFERENCES platforms(id),
    contact_id INTEGER REFERENCES contacts(id),
    platform_conversation_id TEXT,
    title TEXT NOT NULL,
    is_group INTEGER NOT NULL DEFAULT 0,
    group_participants TEXT,
    last_message_text TEXT,
    last_message_at TEXT,
    unread_count INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),
    is_archived INTEGER NOT NULL DEFAULT 0,
    is_pinned INTEGER NOT NULL DEFAULT 0,
    metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_thread
    ON conversations(user_id, platform_id, platform_conversation_id)
    WHERE platform_conversation_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_contact
    ON conversations(user_id, platform_id, contact_id)
    WHERE platform_conversation_id IS NULL;
CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id);
CREATE INDEX IF NOT EXISTS idx_conversations_last_message
    ON conversations(last_message_at);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id),
    platform_id INTEGER NOT NULL REFERENCES platforms(id),
    platform_message_id TEXT,
    sender_contact_id INTEGER REFERENCES contacts(id),
    message_type TEXT NOT NULL DEFAULT 'text',
    content TEXT,
    encrypted_content TEXT,
    is_encrypted INTEGER NOT NULL DEFAULT 0,
    is_from_user INTEGER NOT NULL DEFAULT 0,
    is_delivered INTEGER NOT NULL DEFAULT 0,
    is_read INTEGER NOT NULL DEFAULT 0,
    delivered_at TEXT,
    read_at TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_external
    ON messages(conversation_id, platform_id, platform_message_id)
    WHERE platform_message_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_status_lookup
    ON messages(platform_id, platform_message_id);
"#;

/// Built-in platforms seeded at startup
const SEED_PLATFORMS: &[(&str, &str, bool)] = &[
    ("whatsapp", "WhatsApp", true),
    ("telegram", "Telegram", true),
];

/// Outcome of ingesting one inbound message event
#[derive(Debug)]
pub enum IngestOutcome {
    /// Message persisted; conversation aggregates updated
    Created {
        message: Message,
        conversation: Conversation,
    },
    /// External message id already seen in this conversation; nothing changed
    Duplicate,
}

/// One inbound message event, after normalization
#[derive(Debug)]
pub struct InboundRecord<'a> {
    pub platform: &'a Platform,
    /// External party identifier (e.g. phone number)
    pub external_party_id: &'a str,
    /// Best-effort display name from the platform payload
    pub display_name_hint: Option<&'a str>,
    /// External thread id for group/thread messages
    pub external_thread_id: Option<&'a str>,
    pub platform_message_id: &'a str,
    pub normalized: &'a NormalizedMessage,
    /// Whether the platform already acked delivery to us
    pub is_delivered: bool,
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("platform missing or inactive")]
    InvalidPlatform,

    #[error("not found")]
    NotFound,

    #[error("unique constraint conflict")]
    Conflict,

    #[error("platform is referenced by existing data")]
    PlatformInUse,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Map a sqlx error to `Conflict` when it is a unique violation
fn map_insert_err(err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Conflict
    } else {
        StoreError::Database(err)
    }
}

fn looks_like_phone_number(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_digit())
}

/// Fallback display name when the platform gives us nothing better:
/// a formatted phone number, or the raw external id.
pub fn format_external_id(external_id: &str) -> String {
    if looks_like_phone_number(external_id) {
        format!("+{external_id}")
    } else {
        external_id.to_string()
    }
}

/// SQLite-backed store shared across handlers
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect, apply the schema and seed built-in platforms.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Self::connect_with(database_url, 5).await
    }

    /// Connect with an explicit pool size (tests use 1 with `sqlite::memory:`).
    pub async fn connect_with(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        let store = Self { pool };
        store.seed_platforms().await?;

        debug!("Store initialized");
        Ok(store)
    }

    /// Writes begin IMMEDIATE so concurrent writers queue on the busy
    /// timeout instead of failing the deferred-to-write lock upgrade with
    /// SQLITE_BUSY mid-transaction.
    async fn begin_immediate(&self) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
        self.pool.begin_with("BEGIN IMMEDIATE").await
    }

    async fn seed_platforms(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        for (name, display_name, supports_e2ee) in SEED_PLATFORMS {
            sqlx::query(
                "INSERT INTO platforms
                     (name, display_name, is_active, supports_e2ee, requires_verification,
                      created_at, updated_at)
                 VALUES (?, ?, 1, ?, 0, ?, ?)
                 ON CONFLICT(name) DO NOTHING",
            )
            .bind(name)
            .bind(display_name)
            .bind(supports_e2ee)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Users (identity collaborator surface)
    // ========================================================================

    pub async fn create_user(
        &self,
        email: &str,
        username: &str,
        token_hash: &str,
    ) -> Result<User, StoreError> {
        let res = sqlx::query(
            "INSERT INTO users (email, username, token_hash, is_verified, is_active, created_at)
             VALUES (?, ?, ?, 0, 1, ?)",
        )
        .bind(email)
        .bind(username)
        .bind(token_hash)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(map_insert_err)?;

        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(res.last_insert_rowid())
            .fetch_one(&self.pool)
            .await?;
        Ok(user)
    }

    /// Resolve a bearer token hash to an active user id
    pub async fn user_id_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<i64>, StoreError> {
        let id: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM users WHERE token_hash = ? AND is_active = 1")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id.map(|(id,)| id))
    }

    // ========================================================================
    // Platform registry
    // ========================================================================

    pub async fn list_platforms(&self) -> Result<Vec<Platform>, StoreError> {
        let platforms = sqlx::query_as::<_, Platform>("SELECT * FROM platforms ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(platforms)
    }

    pub async fn get_platform(&self, id: i64) -> Result<Option<Platform>, StoreError> {
        let platform = sqlx::query_as::<_, Platform>("SELECT * FROM platforms WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(platform)
    }

    pub async fn get_platform_by_name(&self, name: &str) -> Result<Option<Platform>, StoreError> {
        let platform = sqlx::query_as::<_, Platform>("SELECT * FROM platforms WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(platform)
    }

    pub async fn create_platform(
        &self,
        req: &CreatePlatformRequest,
    ) -> Result<Platform, StoreError> {
        let now = Utc::now();
        let res = sqlx::query(
            "INSERT INTO platforms
                 (name, display_name, is_active, supports_e2ee, requires_verification,
                  created_at, updated_at)
             VALUES (?, ?, 1, ?, ?, ?, ?)",
        )
        .bind(&req.name)
        .bind(&req.display_name)
        .bind(req.supports_e2ee)
        .bind(req.requires_verification)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_insert_err)?;

        let platform = sqlx::query_as::<_, Platform>("SELECT * FROM platforms WHERE id = ?")
            .bind(res.last_insert_rowid())
            .fetch_one(&self.pool)
            .await?;
        Ok(platform)
    }

    /// Update the mutable flags. Platform identity (`name`) never changes.
    pub async fn update_platform(
        &self,
        id: i64,
        req: &UpdatePlatformRequest,
    ) -> Result<Platform, StoreError> {
        let current = self.get_platform(id).await?.ok_or(StoreError::NotFound)?;

        sqlx::query(
            "UPDATE platforms SET is_active = ?, requires_verification = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(req.is_active.unwrap_or(current.is_active))
        .bind(
            req.requires_verification
                .unwrap_or(current.requires_verification),
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        let platform = sqlx::query_as::<_, Platform>("SELECT * FROM platforms WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(platform)
    }

    /// Delete a platform; refused while any contact, conversation or message
    /// references it.
    pub async fn delete_platform(&self, id: i64) -> Result<(), StoreError> {
        let mut tx = self.begin_immediate().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM platforms WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound);
        }

        let (dependents,): (i64,) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM contacts WHERE platform_id = ?1)
                  + (SELECT COUNT(*) FROM conversations WHERE platform_id = ?1)
                  + (SELECT COUNT(*) FROM messages WHERE platform_id = ?1)",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        if dependents > 0 {
            return Err(StoreError::PlatformInUse);
        }

        sqlx::query("DELETE FROM platforms WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Identity resolver
    // ========================================================================

    /// Find or create the canonical contact for an external party.
    ///
    /// With a user context the lookup is scoped to that user; without one
    /// (webhook ingestion) any contact with the external id matches, claimed
    /// ones preferred, so inbound traffic lands in the claiming user's
    /// conversations. Lookup never mutates identity fields.
    pub async fn resolve_contact(
        &self,
        user_id: Option<i64>,
        platform: &Platform,
        external_party_id: &str,
        display_name_hint: Option<&str>,
    ) -> Result<Contact, StoreError> {
        let mut tx = self.begin_immediate().await?;
        let contact = resolve_contact_in(
            &mut tx,
            user_id,
            platform,
            external_party_id,
            display_name_hint,
        )
        .await?;
        tx.commit().await?;
        Ok(contact)
    }

    /// Explicit contact creation by a user; duplicates are a conflict, not a
    /// silent resolve.
    pub async fn create_contact(
        &self,
        user_id: i64,
        platform: &Platform,
        req: &CreateContactRequest,
    ) -> Result<Contact, StoreError> {
        if !platform.is_active {
            return Err(StoreError::InvalidPlatform);
        }

        let display_name = req
            .display_name
            .clone()
            .unwrap_or_else(|| format_external_id(&req.platform_contact_id));
        let now = Utc::now();

        let res = sqlx::query(
            "INSERT INTO contacts
                 (user_id, platform_id, platform_contact_id, display_name, phone_number,
                  email, is_favorite, is_blocked, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, ?)",
        )
        .bind(user_id)
        .bind(platform.id)
        .bind(&req.platform_contact_id)
        .bind(&display_name)
        .bind(&req.phone_number)
        .bind(&req.email)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_insert_err)?;

        let contact = sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE id = ?")
            .bind(res.last_insert_rowid())
            .fetch_one(&self.pool)
            .await?;
        Ok(contact)
    }

    pub async fn get_contact(&self, user_id: i64, id: i64) -> Result<Contact, StoreError> {
        sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)
    }

    pub async fn list_contacts(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Contact>, i64), StoreError> {
        let contacts = sqlx::query_as::<_, Contact>(
            "SELECT * FROM contacts WHERE user_id = ?
             ORDER BY display_name LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM contacts WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok((contacts, total))
    }

    /// Update a contact's profile fields and flags. Identity (`platform_id`,
    /// `platform_contact_id`) is immutable; omitted fields keep their value.
    pub async fn update_contact(
        &self,
        user_id: i64,
        id: i64,
        req: &UpdateContactRequest,
    ) -> Result<Contact, StoreError> {
        let current = self.get_contact(user_id, id).await?;

        sqlx::query(
            "UPDATE contacts
             SET display_name = ?, phone_number = ?, email = ?, avatar_url = ?,
                 is_favorite = ?, is_blocked = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(
            req.display_name
                .clone()
                .unwrap_or(current.display_name),
        )
        .bind(req.phone_number.clone().or(current.phone_number))
        .bind(req.email.clone().or(current.email))
        .bind(req.avatar_url.clone().or(current.avatar_url))
        .bind(req.is_favorite.unwrap_or(current.is_favorite))
        .bind(req.is_blocked.unwrap_or(current.is_blocked))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        let contact = sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(contact)
    }

    // ========================================================================
    // Conversation resolver
    // ========================================================================

    /// Find or create the canonical conversation for a contact/thread.
    pub async fn resolve_conversation(
        &self,
        user_id: Option<i64>,
        platform: &Platform,
        contact: &Contact,
        external_thread_id: Option<&str>,
        title_hint: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        if !platform.is_active {
            return Err(StoreError::InvalidPlatform);
        }
        let mut tx = self.begin_immediate().await?;
        let conversation = resolve_conversation_in(
            &mut tx,
            user_id,
            platform.id,
            contact,
            external_thread_id,
            title_hint,
        )
        .await?;
        tx.commit().await?;
        Ok(conversation)
    }

    pub async fn get_conversation(&self, id: i64) -> Result<Conversation, StoreError> {
        sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)
    }

    /// Fetch a conversation, requiring ownership by the calling user.
    pub async fn get_conversation_for_user(
        &self,
        user_id: i64,
        id: i64,
    ) -> Result<Conversation, StoreError> {
        sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }

    pub async fn list_conversations(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Conversation>, i64), StoreError> {
        let conversations = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE user_id = ?
             ORDER BY is_pinned DESC, last_message_at IS NULL, last_message_at DESC, id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM conversations WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok((conversations, total))
    }

    /// Update a conversation's archive/pin flags; omitted flags keep their
    /// value.
    pub async fn update_conversation_flags(
        &self,
        user_id: i64,
        id: i64,
        req: &UpdateConversationRequest,
    ) -> Result<Conversation, StoreError> {
        let current = self.get_conversation_for_user(user_id, id).await?;

        sqlx::query(
            "UPDATE conversations SET is_archived = ?, is_pinned = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(req.is_archived.unwrap_or(current.is_archived))
        .bind(req.is_pinned.unwrap_or(current.is_pinned))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        let conversation =
            sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(conversation)
    }

    /// Delete a conversation and all of its messages in one transaction.
    pub async fn delete_conversation(
        &self,
        user_id: i64,
        id: i64,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin_immediate().await?;

        let owned: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM conversations WHERE id = ? AND user_id = ?")
                .bind(id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        if owned.is_none() {
            return Err(StoreError::NotFound);
        }

        let removed = sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(conversation_id = id, messages = removed, "Deleted conversation");
        Ok(())
    }

    // ========================================================================
    // Ingestion pipeline
    // ========================================================================

    /// Ingest one inbound message event: resolve contact and conversation,
    /// persist the normalized message and update the conversation aggregates,
    /// all in one transaction. Redelivery of an already-seen external message
    /// id is a no-op.
    pub async fn ingest_message(
        &self,
        rec: &InboundRecord<'_>,
    ) -> Result<IngestOutcome, StoreError> {
        if !rec.platform.is_active {
            return Err(StoreError::InvalidPlatform);
        }

        let mut tx = self.begin_immediate().await?;

        let contact = resolve_contact_in(
            &mut tx,
            None,
            rec.platform,
            rec.external_party_id,
            rec.display_name_hint,
        )
        .await?;

        // The conversation inherits the contact's owner (None until claimed).
        let conversation = resolve_conversation_in(
            &mut tx,
            contact.user_id,
            rec.platform.id,
            &contact,
            rec.external_thread_id,
            None,
        )
        .await?;

        let now = Utc::now();
        let normalized = rec.normalized;

        let insert = sqlx::query(
            "INSERT INTO messages
                 (conversation_id, platform_id, platform_message_id, sender_contact_id,
                  message_type, content, is_encrypted, is_from_user, is_delivered, is_read,
                  metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, 0, ?, ?)",
        )
        .bind(conversation.id)
        .bind(rec.platform.id)
        .bind(rec.platform_message_id)
        .bind(contact.id)
        .bind(&normalized.message_type)
        .bind(&normalized.content)
        .bind(rec.is_delivered)
        .bind(Json(&normalized.metadata))
        .bind(now)
        .execute(&mut *tx)
        .await;

        let message_id = match insert {
            Ok(res) => res.last_insert_rowid(),
            Err(err) if is_unique_violation(&err) => {
                debug!(
                    platform_message_id = rec.platform_message_id,
                    "Duplicate inbound message, ignoring redelivery"
                );
                return Ok(IngestOutcome::Duplicate);
            }
            Err(err) => return Err(err.into()),
        };

        sqlx::query(
            "UPDATE conversations
             SET last_message_text = ?, last_message_at = ?,
                 unread_count = unread_count + 1, updated_at = ?
             WHERE id = ?",
        )
        .bind(&normalized.preview)
        .bind(now)
        .bind(now)
        .bind(conversation.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE contacts SET last_interaction = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(contact.id)
            .execute(&mut *tx)
            .await?;

        let message = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_one(&mut *tx)
            .await?;
        let conversation =
            sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?")
                .bind(conversation.id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        Ok(IngestOutcome::Created {
            message,
            conversation,
        })
    }

    /// Apply a platform status update (sent/delivered/read/failed) correlated
    /// by external message id. Returns None when no matching message is
    /// tracked; the caller logs and drops the event.
    pub async fn apply_status_update(
        &self,
        platform_id: i64,
        platform_message_id: &str,
        status: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError> {
        let mut tx = self.begin_immediate().await?;

        let message = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE platform_id = ? AND platform_message_id = ?",
        )
        .bind(platform_id)
        .bind(platform_message_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(message) = message else {
            return Ok(None);
        };

        let mut meta = message
            .metadata
            .as_ref()
            .map(|j| j.0.clone())
            .unwrap_or_else(|| json!({}));
        if !meta.is_object() {
            meta = json!({});
        }
        meta["delivery_status"] = json!(status);
        let history = meta
            .as_object_mut()
            .and_then(|o| o.get_mut("status_history"))
            .and_then(|h| h.as_array_mut());
        let entry = json!({ "status": status, "at": occurred_at });
        if let Some(history) = history {
            history.push(entry);
        } else {
            meta["status_history"] = json!([entry]);
        }

        // Delivery/read receipts only move flags forward on outbound
        // messages; unread_count is untouched (it counts inbound only).
        let mut is_delivered = message.is_delivered;
        let mut delivered_at = message.delivered_at;
        let mut is_read = message.is_read;
        let mut read_at = message.read_at;
        if message.is_from_user {
            match status {
                "delivered" => {
                    is_delivered = true;
                    delivered_at = delivered_at.or(Some(occurred_at));
                }
                "read" => {
                    is_delivered = true;
                    delivered_at = delivered_at.or(Some(occurred_at));
                    is_read = true;
                    read_at = read_at.or(Some(occurred_at));
                }
                _ => {}
            }
        }

        sqlx::query(
            "UPDATE messages
             SET metadata = ?, is_delivered = ?, delivered_at = ?, is_read = ?, read_at = ?
             WHERE id = ?",
        )
        .bind(Json(&meta))
        .bind(is_delivered)
        .bind(delivered_at)
        .bind(is_read)
        .bind(read_at)
        .bind(message.id)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?")
            .bind(message.id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(updated))
    }

    // ========================================================================
    // Outbound send
    // ========================================================================

    /// Persist an outbound message and update the conversation preview.
    /// Returns the recipient's external id for the delivery handoff, when the
    /// conversation is linked to a contact.
    pub async fn create_outbound(
        &self,
        user_id: i64,
        req: &SendMessageRequest,
    ) -> Result<(Message, Conversation, Option<String>), StoreError> {
        let mut tx = self.begin_immediate().await?;

        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE id = ? AND user_id = ?",
        )
        .bind(req.conversation_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;

        let now = Utc::now();
        let res = sqlx::query(
            "INSERT INTO messages
                 (conversation_id, platform_id, message_type, content, is_encrypted,
                  is_from_user, is_delivered, is_read, metadata, created_at)
             VALUES (?, ?, ?, ?, 0, 1, 0, 0, ?, ?)",
        )
        .bind(conversation.id)
        .bind(conversation.platform_id)
        .bind(&req.message_type)
        .bind(&req.content)
        .bind(req.metadata.as_ref().map(Json))
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let message_id = res.last_insert_rowid();

        sqlx::query(
            "UPDATE conversations
             SET last_message_text = ?, last_message_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&req.content)
        .bind(now)
        .bind(now)
        .bind(conversation.id)
        .execute(&mut *tx)
        .await?;

        let recipient = match conversation.contact_id {
            Some(contact_id) => {
                let row: Option<(String,)> =
                    sqlx::query_as("SELECT platform_contact_id FROM contacts WHERE id = ?")
                        .bind(contact_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                row.map(|(id,)| id)
            }
            None => None,
        };

        let message = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_one(&mut *tx)
            .await?;
        let conversation =
            sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?")
                .bind(conversation.id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok((message, conversation, recipient))
    }

    /// Record a successful platform handoff: the external message id enables
    /// later status-update correlation.
    pub async fn record_delivery_success(
        &self,
        message_id: i64,
        platform_message_id: &str,
    ) -> Result<(), StoreError> {
        self.merge_delivery_metadata(message_id, "sent", None, Some(platform_message_id))
            .await
    }

    /// Record a failed platform handoff. The message stays persisted locally;
    /// the failure is a status on its metadata, not an error.
    pub async fn record_delivery_failure(
        &self,
        message_id: i64,
        error: &str,
    ) -> Result<(), StoreError> {
        self.merge_delivery_metadata(message_id, "failed", Some(error), None)
            .await
    }

    async fn merge_delivery_metadata(
        &self,
        message_id: i64,
        status: &str,
        error: Option<&str>,
        platform_message_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin_immediate().await?;

        let message = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound)?;

        let mut meta = message
            .metadata
            .as_ref()
            .map(|j| j.0.clone())
            .unwrap_or_else(|| json!({}));
        if !meta.is_object() {
            meta = json!({});
        }
        meta["delivery_status"] = json!(status);
        if let Some(error) = error {
            meta["delivery_error"] = json!(error);
        }

        sqlx::query(
            "UPDATE messages
             SET metadata = ?,
                 platform_message_id = COALESCE(?, platform_message_id)
             WHERE id = ?",
        )
        .bind(Json(&meta))
        .bind(platform_message_id)
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Read/unread reconciliation
    // ========================================================================

    /// Flip every unread inbound message in the conversation to read and
    /// decrement `unread_count` by exactly that number, clamped at zero.
    /// Idempotent: a second call marks nothing.
    pub async fn mark_conversation_read(
        &self,
        user_id: i64,
        conversation_id: i64,
    ) -> Result<u64, StoreError> {
        let mut tx = self.begin_immediate().await?;

        let owned: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM conversations WHERE id = ? AND user_id = ?")
                .bind(conversation_id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        if owned.is_none() {
            return Err(StoreError::NotFound);
        }

        let now = Utc::now();
        let marked = sqlx::query(
            "UPDATE messages SET is_read = 1, read_at = ?
             WHERE conversation_id = ? AND is_from_user = 0 AND is_read = 0",
        )
        .bind(now)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if marked > 0 {
            // Clamped decrement defends against drift from concurrent
            // status events.
            sqlx::query(
                "UPDATE conversations
                 SET unread_count = MAX(unread_count - ?, 0), updated_at = ?
                 WHERE id = ?",
            )
            .bind(i64::try_from(marked).unwrap_or(i64::MAX))
            .bind(now)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(marked)
    }

    /// Single-message variant of [`Store::mark_conversation_read`].
    /// Returns true when the message was newly marked.
    pub async fn mark_message_read(
        &self,
        user_id: i64,
        message_id: i64,
    ) -> Result<bool, StoreError> {
        let mut tx = self.begin_immediate().await?;

        let message = sqlx::query_as::<_, Message>(
            "SELECT m.* FROM messages m
             JOIN conversations c ON m.conversation_id = c.id
             WHERE m.id = ? AND c.user_id = ?",
        )
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;

        if message.is_read {
            return Ok(false);
        }

        let now = Utc::now();
        sqlx::query("UPDATE messages SET is_read = 1, read_at = ? WHERE id = ?")
            .bind(now)
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        // Only inbound messages are counted in unread_count.
        if !message.is_from_user {
            sqlx::query(
                "UPDATE conversations
                 SET unread_count = MAX(unread_count - 1, 0), updated_at = ?
                 WHERE id = ?",
            )
            .bind(now)
            .bind(message.conversation_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    // ========================================================================
    // Message queries
    // ========================================================================

    pub async fn list_messages(
        &self,
        conversation_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Message>, i64), StoreError> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE conversation_id = ?
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
                .bind(conversation_id)
                .fetch_one(&self.pool)
                .await?;
        Ok((messages, total))
    }

    /// Count of unread inbound messages, for invariant checks.
    pub async fn unread_inbound_count(&self, conversation_id: i64) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ? AND is_from_user = 0 AND is_read = 0",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

// ============================================================================
// Transaction-scoped resolver bodies
// ============================================================================

/// Identity resolver body. Runs on the caller's transaction so ingestion can
/// make resolve + insert + aggregate-update one atomic unit.
async fn resolve_contact_in(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: Option<i64>,
    platform: &Platform,
    external_party_id: &str,
    display_name_hint: Option<&str>,
) -> Result<Contact, StoreError> {
    if !platform.is_active {
        return Err(StoreError::InvalidPlatform);
    }

    if let Some(contact) =
        lookup_contact(&mut *tx, user_id, platform.id, external_party_id).await?
    {
        return Ok(contact);
    }

    let display_name = display_name_hint
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format_external_id(external_party_id));
    // Usernames and other non-numeric external ids stay out of the phone
    // column.
    let phone_number = looks_like_phone_number(external_party_id).then_some(external_party_id);
    let now = Utc::now();

    let insert = sqlx::query(
        "INSERT INTO contacts
             (user_id, platform_id, platform_contact_id, display_name, phone_number,
              is_favorite, is_blocked, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, 0, 0, ?, ?)",
    )
    .bind(user_id)
    .bind(platform.id)
    .bind(external_party_id)
    .bind(&display_name)
    .bind(phone_number)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await;

    match insert {
        Ok(res) => {
            let contact = sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE id = ?")
                .bind(res.last_insert_rowid())
                .fetch_one(&mut **tx)
                .await?;
            debug!(contact_id = contact.id, "Created contact");
            Ok(contact)
        }
        // A concurrent insert won the race; the re-fetch is the idempotent
        // recovery mandated for resolver conflicts.
        Err(err) if is_unique_violation(&err) => {
            lookup_contact(&mut *tx, user_id, platform.id, external_party_id)
                .await?
                .ok_or(StoreError::Conflict)
        }
        Err(err) => Err(err.into()),
    }
}

async fn lookup_contact(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: Option<i64>,
    platform_id: i64,
    external_party_id: &str,
) -> Result<Option<Contact>, StoreError> {
    let contact = match user_id {
        Some(user_id) => {
            sqlx::query_as::<_, Contact>(
                "SELECT * FROM contacts
                 WHERE user_id = ? AND platform_id = ? AND platform_contact_id = ?",
            )
            .bind(user_id)
            .bind(platform_id)
            .bind(external_party_id)
            .fetch_optional(&mut **tx)
            .await?
        }
        // No user context yet: match any owner, claimed contacts first.
        None => {
            sqlx::query_as::<_, Contact>(
                "SELECT * FROM contacts
                 WHERE platform_id = ? AND platform_contact_id = ?
                 ORDER BY user_id IS NULL, id LIMIT 1",
            )
            .bind(platform_id)
            .bind(external_party_id)
            .fetch_optional(&mut **tx)
            .await?
        }
    };
    Ok(contact)
}

/// Conversation resolver body; same retry-on-conflict policy as the identity
/// resolver. Prefers the external thread id key when one is supplied.
async fn resolve_conversation_in(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: Option<i64>,
    platform_id: i64,
    contact: &Contact,
    external_thread_id: Option<&str>,
    title_hint: Option<&str>,
) -> Result<Conversation, StoreError> {
    if let Some(conversation) =
        lookup_conversation(&mut *tx, user_id, platform_id, contact.id, external_thread_id)
            .await?
    {
        return Ok(conversation);
    }

    let title = title_hint
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| contact.display_name.clone());
    let now = Utc::now();

    let insert = sqlx::query(
        "INSERT INTO conversations
             (user_id, platform_id, contact_id, platform_conversation_id, title,
              is_group, unread_count, is_archived, is_pinned, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, 0, 0, 0, 0, ?, ?)",
    )
    .bind(user_id)
    .bind(platform_id)
    .bind(contact.id)
    .bind(external_thread_id)
    .bind(&title)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await;

    match insert {
        Ok(res) => {
            let conversation =
                sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?")
                    .bind(res.last_insert_rowid())
                    .fetch_one(&mut **tx)
                    .await?;
            debug!(conversation_id = conversation.id, "Created conversation");
            Ok(conversation)
        }
        Err(err) if is_unique_violation(&err) => {
            lookup_conversation(&mut *tx, user_id, platform_id, contact.id, external_thread_id)
                .await?
                .ok_or(StoreError::Conflict)
        }
        Err(err) => Err(err.into()),
    }
}

async fn lookup_conversation(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: Option<i64>,
    platform_id: i64,
    contact_id: i64,
    external_thread_id: Option<&str>,
) -> Result<Option<Conversation>, StoreError> {
    let conversation = match external_thread_id {
        Some(thread_id) => {
            sqlx::query_as::<_, Conversation>(
                "SELECT * FROM conversations
                 WHERE user_id IS ? AND platform_id = ? AND platform_conversation_id = ?",
            )
            .bind(user_id)
            .bind(platform_id)
            .bind(thread_id)
            .fetch_optional(&mut **tx)
            .await?
        }
        None => {
            sqlx::query_as::<_, Conversation>(
                "SELECT * FROM conversations
                 WHERE user_id IS ? AND platform_id = ? AND contact_id = ?
                   AND platform_conversation_id IS NULL",
            )
            .bind(user_id)
            .bind(platform_id)
            .bind(contact_id)
            .fetch_optional(&mut **tx)
            .await?
        }
    };
    Ok(conversation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_external_id_phone_numbers() {
        assert_eq!(format_external_id("34600000099"), "+34600000099");
        assert_eq!(format_external_id("alice@example"), "alice@example");
        assert_eq!(format_external_id(""), "");
    }
}
