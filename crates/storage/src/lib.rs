use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ChatId, MessageId, MessageStatus, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub id: UserId,
    pub phone_number: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub push_token: Option<String>,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StoredChat {
    pub id: ChatId,
    pub user_a: UserId,
    pub user_b: UserId,
}

impl StoredChat {
    /// The participant on the other side from `user`. For a self-chat the
    /// peer is the user themself.
    pub fn peer_of(&self, user: UserId) -> UserId {
        if self.user_a == user {
            self.user_b
        } else {
            self.user_a
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub is_deleted: bool,
    pub last_cleared_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub status: MessageStatus,
    pub is_encrypted: bool,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // A :memory: database exists per connection; a second pooled
        // connection would see an empty schema.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    // --- users / identity directory ---

    /// Registration itself belongs to the external auth service; this is the
    /// narrow write interface it (and the tests) go through.
    pub async fn create_user(
        &self,
        phone_number: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (phone_number, first_name, last_name) VALUES (?, ?, ?)
             ON CONFLICT(phone_number) DO UPDATE SET
                first_name = excluded.first_name,
                last_name = excluded.last_name
             RETURNING id",
        )
        .bind(phone_number)
        .bind(first_name)
        .bind(last_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    /// Resolves an active (non-deleted) user's id. Soft-deleted accounts are
    /// invisible here on purpose.
    pub async fn resolve_user_id(&self, phone_number: &str) -> Result<Option<UserId>> {
        let row = sqlx::query("SELECT id FROM users WHERE phone_number = ? AND is_deleted = 0")
            .bind(phone_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserId(r.get::<i64, _>(0))))
    }

    pub async fn resolve_phone_number(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT phone_number FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn user_by_id(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, phone_number, first_name, last_name, push_token, is_deleted
             FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredUser {
            id: UserId(r.get::<i64, _>(0)),
            phone_number: r.get::<String, _>(1),
            first_name: r.get::<Option<String>, _>(2),
            last_name: r.get::<Option<String>, _>(3),
            push_token: r.get::<Option<String>, _>(4),
            is_deleted: r.get::<bool, _>(5),
        }))
    }

    pub async fn set_push_token(&self, user_id: UserId, push_token: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE users SET push_token = ? WHERE id = ?")
            .bind(push_token)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Soft "account deleted" flag. The row stays; the identity directory
    /// stops resolving it.
    pub async fn mark_user_deleted(&self, user_id: UserId) -> Result<bool> {
        let updated = sqlx::query("UPDATE users SET is_deleted = 1 WHERE id = ?")
            .bind(user_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    // --- chat ledger ---

    /// Looks up the chat for the unordered pair, creating it together with
    /// its conversation rows when missing. The unique constraint on the
    /// normalized pair makes concurrent creation collapse into a lookup, so
    /// two racing callers always land on the same row.
    pub async fn find_or_create_chat(&self, a: UserId, b: UserId) -> Result<StoredChat> {
        let (lo, hi) = normalize_pair(a, b);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO chats (user_a_id, user_b_id) VALUES (?, ?)
             ON CONFLICT(user_a_id, user_b_id) DO NOTHING",
        )
        .bind(lo.0)
        .bind(hi.0)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT id FROM chats WHERE user_a_id = ? AND user_b_id = ?")
            .bind(lo.0)
            .bind(hi.0)
            .fetch_one(&mut *tx)
            .await?;
        let chat_id = ChatId(row.get::<i64, _>(0));

        // One conversation row per distinct participant, idempotent.
        sqlx::query(
            "INSERT INTO conversations (chat_id, user_id) VALUES (?, ?)
             ON CONFLICT(chat_id, user_id) DO NOTHING",
        )
        .bind(chat_id.0)
        .bind(lo.0)
        .execute(&mut *tx)
        .await?;
        if hi != lo {
            sqlx::query(
                "INSERT INTO conversations (chat_id, user_id) VALUES (?, ?)
                 ON CONFLICT(chat_id, user_id) DO NOTHING",
            )
            .bind(chat_id.0)
            .bind(hi.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(StoredChat {
            id: chat_id,
            user_a: lo,
            user_b: hi,
        })
    }

    pub async fn find_chat(&self, a: UserId, b: UserId) -> Result<Option<StoredChat>> {
        let (lo, hi) = normalize_pair(a, b);
        let row = sqlx::query(
            "SELECT id, user_a_id, user_b_id FROM chats WHERE user_a_id = ? AND user_b_id = ?",
        )
        .bind(lo.0)
        .bind(hi.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(chat_from_row))
    }

    pub async fn chat_by_id(&self, chat_id: ChatId) -> Result<Option<StoredChat>> {
        let row = sqlx::query("SELECT id, user_a_id, user_b_id FROM chats WHERE id = ?")
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(chat_from_row))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
        status: MessageStatus,
        is_encrypted: bool,
        created_at: DateTime<Utc>,
    ) -> Result<StoredMessage> {
        let rec = sqlx::query(
            "INSERT INTO messages (chat_id, sender_id, receiver_id, content, status, is_encrypted, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(chat_id.0)
        .bind(sender_id.0)
        .bind(receiver_id.0)
        .bind(content)
        .bind(status.as_str())
        .bind(is_encrypted)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .context("message insert rejected")?;

        Ok(StoredMessage {
            id: MessageId(rec.get::<i64, _>(0)),
            chat_id,
            sender_id,
            receiver_id,
            content: content.to_string(),
            status,
            is_encrypted,
            created_at,
        })
    }

    // --- status state machine ---

    /// Bulk conditional transition. Only rows currently at `previous` move,
    /// which is what keeps the state machine monotonic under concurrent
    /// updates; zero matched rows is a valid outcome, not an error.
    pub async fn update_message_status(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        previous: MessageStatus,
        current: MessageStatus,
        at_or_before: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let updated = if let Some(bound) = at_or_before {
            sqlx::query(
                "UPDATE messages SET status = ?
                 WHERE sender_id = ? AND receiver_id = ? AND status = ? AND created_at <= ?",
            )
            .bind(current.as_str())
            .bind(sender_id.0)
            .bind(receiver_id.0)
            .bind(previous.as_str())
            .bind(bound)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE messages SET status = ?
                 WHERE sender_id = ? AND receiver_id = ? AND status = ?",
            )
            .bind(current.as_str())
            .bind(sender_id.0)
            .bind(receiver_id.0)
            .bind(previous.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected()
        };
        Ok(updated)
    }

    /// Connect-time catch-up: everything sent to `receiver_id` while they
    /// were offline becomes delivered, except messages from senders the
    /// receiver currently blocks. Those stay `sent` until the block lifts.
    pub async fn mark_delivered_on_connect(&self, receiver_id: UserId) -> Result<u64> {
        let updated = sqlx::query(
            "UPDATE messages SET status = 'delivered'
             WHERE receiver_id = ? AND status = 'sent'
               AND sender_id NOT IN (SELECT blocked_id FROM blocks WHERE blocker_id = ?)",
        )
        .bind(receiver_id.0)
        .bind(receiver_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated)
    }

    // --- conversation soft-delete ---

    /// Sets the owner's soft-delete horizon on the chat shared with `peer`.
    /// `Ok(None)` means no chat exists between the pair, which is a no-op
    /// success, distinct from "chat exists but nothing changed".
    pub async fn clear_conversation(
        &self,
        owner_id: UserId,
        peer_id: UserId,
        as_of: DateTime<Utc>,
    ) -> Result<Option<u64>> {
        let Some(chat) = self.find_chat(owner_id, peer_id).await? else {
            return Ok(None);
        };

        let updated = sqlx::query(
            "UPDATE conversations SET is_deleted = 1, last_cleared_at = ?
             WHERE chat_id = ? AND user_id = ?",
        )
        .bind(as_of)
        .bind(chat.id.0)
        .bind(owner_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(Some(updated))
    }

    pub async fn conversation_for(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<Option<StoredConversation>> {
        let row = sqlx::query(
            "SELECT chat_id, user_id, is_deleted, last_cleared_at
             FROM conversations WHERE chat_id = ? AND user_id = ?",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(conversation_from_row))
    }

    pub async fn conversations_for_user(&self, user_id: UserId) -> Result<Vec<StoredConversation>> {
        let rows = sqlx::query(
            "SELECT chat_id, user_id, is_deleted, last_cleared_at
             FROM conversations WHERE user_id = ?
             ORDER BY chat_id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(conversation_from_row).collect())
    }

    // --- message views ---

    /// All messages of a chat visible to a viewer whose horizon is
    /// `cleared_before`: messages at or before the horizon are hidden.
    pub async fn visible_messages(
        &self,
        chat_id: ChatId,
        cleared_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = if let Some(horizon) = cleared_before {
            sqlx::query(
                "SELECT id, chat_id, sender_id, receiver_id, content, status, is_encrypted, created_at
                 FROM messages
                 WHERE chat_id = ? AND created_at > ?
                 ORDER BY created_at ASC",
            )
            .bind(chat_id.0)
            .bind(horizon)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, chat_id, sender_id, receiver_id, content, status, is_encrypted, created_at
                 FROM messages
                 WHERE chat_id = ?
                 ORDER BY created_at ASC",
            )
            .bind(chat_id.0)
            .fetch_all(&self.pool)
            .await?
        };
        rows.into_iter().map(message_from_row).collect()
    }

    /// Sync backlog for one conversation: inbound messages from `since`
    /// onward, oldest first. `since` is the max of the soft-delete horizon
    /// and the client's last sync point.
    pub async fn inbound_messages_since(
        &self,
        chat_id: ChatId,
        receiver_id: UserId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = if let Some(since) = since {
            sqlx::query(
                "SELECT id, chat_id, sender_id, receiver_id, content, status, is_encrypted, created_at
                 FROM messages
                 WHERE chat_id = ? AND receiver_id = ? AND created_at >= ?
                 ORDER BY created_at ASC",
            )
            .bind(chat_id.0)
            .bind(receiver_id.0)
            .bind(since)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, chat_id, sender_id, receiver_id, content, status, is_encrypted, created_at
                 FROM messages
                 WHERE chat_id = ? AND receiver_id = ?
                 ORDER BY created_at ASC",
            )
            .bind(chat_id.0)
            .bind(receiver_id.0)
            .fetch_all(&self.pool)
            .await?
        };
        rows.into_iter().map(message_from_row).collect()
    }

    // --- blocks ---

    /// Records a directed block. Returns false when the relation already
    /// exists; the caller decides whether that is a conflict.
    pub async fn add_block(&self, blocker_id: UserId, blocked_id: UserId) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO blocks (blocker_id, blocked_id) VALUES (?, ?)
             ON CONFLICT(blocker_id, blocked_id) DO NOTHING",
        )
        .bind(blocker_id.0)
        .bind(blocked_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted > 0)
    }

    pub async fn remove_block(&self, blocker_id: UserId, blocked_id: UserId) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM blocks WHERE blocker_id = ? AND blocked_id = ?")
            .bind(blocker_id.0)
            .bind(blocked_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    pub async fn is_blocked(&self, blocker_id: UserId, blocked_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM blocks WHERE blocker_id = ? AND blocked_id = ?")
            .bind(blocker_id.0)
            .bind(blocked_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn blocked_user_ids(&self, blocker_id: UserId) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT blocked_id FROM blocks WHERE blocker_id = ?")
            .bind(blocker_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserId(r.get::<i64, _>(0)))
            .collect())
    }
}

fn normalize_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a.0 <= b.0 {
        (a, b)
    } else {
        (b, a)
    }
}

fn chat_from_row(row: SqliteRow) -> StoredChat {
    StoredChat {
        id: ChatId(row.get::<i64, _>(0)),
        user_a: UserId(row.get::<i64, _>(1)),
        user_b: UserId(row.get::<i64, _>(2)),
    }
}

fn conversation_from_row(row: SqliteRow) -> StoredConversation {
    StoredConversation {
        chat_id: ChatId(row.get::<i64, _>(0)),
        user_id: UserId(row.get::<i64, _>(1)),
        is_deleted: row.get::<bool, _>(2),
        last_cleared_at: row.get::<Option<DateTime<Utc>>, _>(3),
    }
}

fn message_from_row(row: SqliteRow) -> Result<StoredMessage> {
    let raw_status = row.get::<String, _>(5);
    let Some(status) = MessageStatus::parse(&raw_status) else {
        bail!("message row carries unknown status '{raw_status}'");
    };
    Ok(StoredMessage {
        id: MessageId(row.get::<i64, _>(0)),
        chat_id: ChatId(row.get::<i64, _>(1)),
        sender_id: UserId(row.get::<i64, _>(2)),
        receiver_id: UserId(row.get::<i64, _>(3)),
        content: row.get::<String, _>(4),
        status,
        is_encrypted: row.get::<bool, _>(6),
        created_at: row.get::<DateTime<Utc>, _>(7),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
