use crate::{
    chat::{self, AppendRequest, Conversation, ConversationSummary, Message, DEFAULT_DISPLAY_NAME},
    entity::{Sender, SessionId},
    error::{SyncError, SyncResult},
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::debug;

/// Authoritative conversation log. Messages are append-only.
///
/// Writes are serialized through `write_lock`. Two deferred transactions
/// upgrading from read to write on separate connections fail with
/// `SQLITE_BUSY` rather than wait.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self::with_pool(pool))
    }

    /// Private in-memory database. One pinned connection, since every
    /// SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;
        Ok(Self::with_pool(pool))
    }

    fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                session_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                last_updated INTEGER NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES conversations(session_id) ON DELETE CASCADE,
                sender TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session_order ON messages(session_id, timestamp, id);
            CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(last_updated DESC);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Appends one message, creating the conversation on first use.
    pub async fn append_message(&self, req: &AppendRequest) -> SyncResult<Message> {
        let text = chat::validate_text(&req.text).map_err(SyncError::Rejected)?;
        let display_name = req
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());

        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(timestamp) FROM messages WHERE session_id = ?")
                .bind(req.session_id.as_str())
                .fetch_one(&mut *tx)
                .await?;

        // Never go below the newest stored message, whatever the wall clock says.
        let now = Utc::now().timestamp_micros();
        let timestamp = last.map_or(now, |last| now.max(last));
        let is_read = req.sender == Sender::Admin;

        sqlx::query(
            r#"
            INSERT INTO conversations (session_id, display_name, last_updated, is_read)
            VALUES (?1, COALESCE(?2, ?3), ?4, ?5)
            ON CONFLICT(session_id) DO UPDATE SET
                display_name = COALESCE(?2, conversations.display_name),
                last_updated = excluded.last_updated,
                is_read = excluded.is_read
            "#,
        )
        .bind(req.session_id.as_str())
        .bind(display_name)
        .bind(DEFAULT_DISPLAY_NAME)
        .bind(timestamp)
        .bind(is_read)
        .execute(&mut *tx)
        .await?;

        let id = sqlx::query(
            r#"
            INSERT INTO messages (session_id, sender, text, timestamp)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(req.session_id.as_str())
        .bind(req.sender.as_str())
        .bind(&text)
        .bind(timestamp)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;

        debug!("Appended message {} to {} ({})", id, req.session_id, req.sender);

        Ok(Message {
            id,
            sender: req.sender,
            text,
            timestamp: from_micros(timestamp)?,
        })
    }

    /// Full ordered log of one conversation.
    /// Returns messages ordered by timestamp ascending (oldest to newest).
    pub async fn get_conversation(&self, session_id: &SessionId) -> SyncResult<Vec<Message>> {
        Ok(self.conversation(session_id).await?.messages)
    }

    /// One conversation with its metadata and full log.
    pub async fn conversation(&self, session_id: &SessionId) -> SyncResult<Conversation> {
        let header = sqlx::query(
            "SELECT display_name, last_updated, is_read FROM conversations WHERE session_id = ?",
        )
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SyncError::not_found(session_id))?;

        let rows = sqlx::query(
            r#"
            SELECT id, sender, text, timestamp
            FROM messages
            WHERE session_id = ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(Conversation {
            session_id: session_id.clone(),
            display_name: header.try_get("display_name")?,
            messages: rows.iter().map(message_from_row).collect::<SyncResult<_>>()?,
            last_updated: from_micros(header.try_get("last_updated")?)?,
            is_read: header.try_get("is_read")?,
        })
    }

    /// Every conversation, most recently updated first.
    pub async fn list_conversations(&self) -> SyncResult<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT c.session_id, c.display_name, c.last_updated, c.is_read,
                   (SELECT m.text FROM messages m
                     WHERE m.session_id = c.session_id
                     ORDER BY m.timestamp DESC, m.id DESC
                     LIMIT 1) AS last_text
            FROM conversations c
            ORDER BY c.last_updated DESC, c.session_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> SyncResult<ConversationSummary> {
                let raw_id: String = row.try_get("session_id")?;
                let session_id = SessionId::parse(&raw_id)
                    .ok_or_else(|| SyncError::Storage(format!("bad session id '{}'", raw_id)))?;
                let last_text: Option<String> = row.try_get("last_text")?;
                Ok(ConversationSummary {
                    session_id,
                    display_name: row.try_get("display_name")?,
                    last_message_preview: last_text.as_deref().map(chat::preview).unwrap_or_default(),
                    last_updated: from_micros(row.try_get("last_updated")?)?,
                    is_read: row.try_get("is_read")?,
                })
            })
            .collect()
    }

    /// Sets `is_read` unless the conversation was updated after `seen`.
    /// Returns whether the flag was set.
    pub async fn mark_read(&self, session_id: &SessionId, seen: DateTime<Utc>) -> SyncResult<bool> {
        let _write = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE conversations SET is_read = 1 WHERE session_id = ?1 AND last_updated <= ?2",
        )
        .bind(session_id.as_str())
        .bind(seen.timestamp_micros())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM conversations WHERE session_id = ?")
            .bind(session_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match found {
            Some(_) => {
                debug!("Read mark for {} is older than its last message, ignored", session_id);
                Ok(false)
            }
            None => Err(SyncError::not_found(session_id)),
        }
    }

    pub async fn delete_conversation(&self, session_id: &SessionId) -> SyncResult<()> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id.as_str())
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM conversations WHERE session_id = ?")
            .bind(session_id.as_str())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::not_found(session_id));
        }

        tx.commit().await?;
        Ok(())
    }
}

fn message_from_row(row: &SqliteRow) -> SyncResult<Message> {
    let sender: String = row.try_get("sender")?;
    Ok(Message {
        id: row.try_get("id")?,
        sender: sender.parse().map_err(SyncError::Storage)?,
        text: row.try_get("text")?,
        timestamp: from_micros(row.try_get("timestamp")?)?,
    })
}

fn from_micros(micros: i64) -> SyncResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| SyncError::Storage(format!("timestamp out of range: {}", micros)))
}
