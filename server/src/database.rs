//! Database operations

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parley_shared::{AccountId, MessageContent, MessageEnvelope, Thread};
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::info;
use uuid::Uuid;

type ThreadRow = (String, String, String, i64);
type MessageRow = (String, String, String, String, String, i64);

/// Initialize the database connection pool
pub async fn init(database_url: &str) -> Result<Pool<Sqlite>> {
    if let Some(path) = database_url.strip_prefix("sqlite://") {
        let path = path.split('?').next().unwrap_or(path);
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
    }

    // Create database file if it doesn't exist
    if !sqlx::Sqlite::database_exists(database_url)
        .await
        .unwrap_or(false)
    {
        info!("Creating database at {}", database_url);
        sqlx::Sqlite::create_database(database_url).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            account_id TEXT PRIMARY KEY,
            public_key TEXT NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Members are stored in canonical (sorted) order so the pair is unique
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS threads (
            id TEXT PRIMARY KEY,
            member_a TEXT NOT NULL,
            member_b TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE (member_a, member_b)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            thread_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            receiver_id TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (thread_id) REFERENCES threads(id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_thread_time
        ON messages(thread_id, created_at);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

/// Insert a thread unless one already exists for its member pair
pub async fn insert_thread_if_absent(pool: &Pool<Sqlite>, thread: &Thread) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO threads (id, member_a, member_b, created_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(member_a, member_b) DO NOTHING
        "#,
    )
    .bind(thread.id.to_string())
    .bind(thread.members[0].as_str())
    .bind(thread.members[1].as_str())
    .bind(thread.created_at.timestamp_millis())
    .execute(pool)
    .await?;

    Ok(())
}

/// Look up the thread of a canonical member pair
pub async fn get_thread_by_pair(
    pool: &Pool<Sqlite>,
    pair: &[AccountId; 2],
) -> Result<Option<Thread>> {
    let row: Option<ThreadRow> = sqlx::query_as(
        r#"
        SELECT id, member_a, member_b, created_at
        FROM threads
        WHERE member_a = ? AND member_b = ?
        "#,
    )
    .bind(pair[0].as_str())
    .bind(pair[1].as_str())
    .fetch_optional(pool)
    .await?;

    row.map(thread_from_row).transpose()
}

pub async fn get_thread(pool: &Pool<Sqlite>, thread_id: Uuid) -> Result<Option<Thread>> {
    let row: Option<ThreadRow> = sqlx::query_as(
        "SELECT id, member_a, member_b, created_at FROM threads WHERE id = ?",
    )
    .bind(thread_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(thread_from_row).transpose()
}

/// Threads the account belongs to, newest first
pub async fn list_threads_for_account(
    pool: &Pool<Sqlite>,
    account: &AccountId,
) -> Result<Vec<Thread>> {
    let rows: Vec<ThreadRow> = sqlx::query_as(
        r#"
        SELECT id, member_a, member_b, created_at
        FROM threads
        WHERE member_a = ? OR member_b = ?
        ORDER BY created_at DESC
        "#,
    )
    .bind(account.as_str())
    .bind(account.as_str())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(thread_from_row).collect()
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Insert a message; returns false if the id was already stored
pub async fn insert_message(pool: &Pool<Sqlite>, message: &MessageEnvelope) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO messages (id, thread_id, sender_id, receiver_id, content, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(message.id.to_string())
    .bind(message.thread_id.to_string())
    .bind(message.sender_id.as_str())
    .bind(message.receiver_id.as_str())
    .bind(message.content.to_storage())
    .bind(message.created_at.timestamp_millis())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn get_message(pool: &Pool<Sqlite>, message_id: Uuid) -> Result<Option<MessageEnvelope>> {
    let row: Option<MessageRow> = sqlx::query_as(
        r#"
        SELECT id, thread_id, sender_id, receiver_id, content, created_at
        FROM messages
        WHERE id = ?
        "#,
    )
    .bind(message_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(message_from_row).transpose()
}

/// Messages of a thread, oldest first
pub async fn list_messages(pool: &Pool<Sqlite>, thread_id: Uuid) -> Result<Vec<MessageEnvelope>> {
    let rows: Vec<MessageRow> = sqlx::query_as(
        r#"
        SELECT id, thread_id, sender_id, receiver_id, content, created_at
        FROM messages
        WHERE thread_id = ?
        ORDER BY created_at ASC, rowid ASC
        "#,
    )
    .bind(thread_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(message_from_row).collect()
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

/// Store or replace an account's exported public key
pub async fn upsert_public_key(
    pool: &Pool<Sqlite>,
    account: &AccountId,
    public_key: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO accounts (account_id, public_key)
        VALUES (?, ?)
        ON CONFLICT(account_id) DO UPDATE SET
            public_key = excluded.public_key,
            updated_at = strftime('%s', 'now')
        "#,
    )
    .bind(account.as_str())
    .bind(public_key)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_public_key(pool: &Pool<Sqlite>, account: &AccountId) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT public_key FROM accounts WHERE account_id = ?")
            .bind(account.as_str())
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|(key,)| key))
}

/// Row counts for admin stats: (threads, messages, accounts with keys)
pub async fn counts(pool: &Pool<Sqlite>) -> Result<(i64, i64, i64)> {
    let row: (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM threads),
            (SELECT COUNT(*) FROM messages),
            (SELECT COUNT(*) FROM accounts)
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(row)
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn timestamp(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

fn account(raw: String) -> Result<AccountId> {
    AccountId::new(raw).context("corrupt account id")
}

fn thread_from_row((id, a, b, created_at): ThreadRow) -> Result<Thread> {
    Ok(Thread {
        id: Uuid::parse_str(&id).context("corrupt thread id")?,
        members: [account(a)?, account(b)?],
        created_at: timestamp(created_at)?,
    })
}

fn message_from_row(
    (id, thread_id, sender_id, receiver_id, content, created_at): MessageRow,
) -> Result<MessageEnvelope> {
    Ok(MessageEnvelope {
        id: Uuid::parse_str(&id).context("corrupt message id")?,
        thread_id: Uuid::parse_str(&thread_id).context("corrupt thread id")?,
        sender_id: account(sender_id)?,
        receiver_id: account(receiver_id)?,
        content: MessageContent::from_storage(&content),
        created_at: timestamp(created_at)?,
    })
}
