//! SQLite implementation of the repository traits
//!
//! Wraps the database.rs functions and adds the membership rules the
//! repository contract requires.

use super::{DatabaseBackend, StorageStats};
use crate::database;
use async_trait::async_trait;
use chrono::Utc;
use parley_shared::store::{resolve_existing, validate_message};
use parley_shared::{
    import_public, AccountId, ConversationRepository, MessageEnvelope, ProfileDirectory,
    StoreError, StoreResult, Thread,
};
use sqlx::{Pool, Sqlite};
use tracing::{debug, error};
use uuid::Uuid;

pub struct SqliteBackend {
    pool: Pool<Sqlite>,
}

impl SqliteBackend {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn backend(e: anyhow::Error) -> StoreError {
    error!("Database error: {:#}", e);
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl ConversationRepository for SqliteBackend {
    async fn find_or_create_thread(&self, a: &AccountId, b: &AccountId) -> StoreResult<Thread> {
        let pair = Thread::canonical_pair(a, b)?;
        if let Some(thread) = database::get_thread_by_pair(&self.pool, &pair)
            .await
            .map_err(backend)?
        {
            return Ok(thread);
        }

        let candidate = Thread {
            id: Uuid::new_v4(),
            members: pair.clone(),
            created_at: Utc::now(),
        };
        database::insert_thread_if_absent(&self.pool, &candidate)
            .await
            .map_err(backend)?;

        // A concurrent request may have won the insert; read back the winner
        let thread = database::get_thread_by_pair(&self.pool, &pair)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::Backend("thread vanished after insert".into()))?;
        if thread.id == candidate.id {
            debug!("Created thread {} for {} and {}", thread.id, pair[0].short(), pair[1].short());
        }
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: Uuid) -> StoreResult<Option<Thread>> {
        database::get_thread(&self.pool, thread_id)
            .await
            .map_err(backend)
    }

    async fn list_threads_for_account(&self, account: &AccountId) -> StoreResult<Vec<Thread>> {
        database::list_threads_for_account(&self.pool, account)
            .await
            .map_err(backend)
    }

    async fn append_message(&self, message: MessageEnvelope) -> StoreResult<MessageEnvelope> {
        let thread = database::get_thread(&self.pool, message.thread_id)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("thread {}", message.thread_id)))?;
        validate_message(&thread, &message)?;

        let inserted = database::insert_message(&self.pool, &message)
            .await
            .map_err(backend)?;

        // Return the stored copy so callers see what later reads will see
        let stored = database::get_message(&self.pool, message.id)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::Backend("message vanished after insert".into()))?;
        if inserted {
            return Ok(stored);
        }
        debug!("Message {} already stored", message.id);
        resolve_existing(stored, &message)
    }

    async fn list_messages(&self, thread_id: Uuid) -> StoreResult<Vec<MessageEnvelope>> {
        if database::get_thread(&self.pool, thread_id)
            .await
            .map_err(backend)?
            .is_none()
        {
            return Err(StoreError::NotFound(format!("thread {}", thread_id)));
        }
        database::list_messages(&self.pool, thread_id)
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl ProfileDirectory for SqliteBackend {
    async fn publish_public_key(&self, account: &AccountId, public_key: &str) -> StoreResult<()> {
        import_public(public_key).map_err(|e| StoreError::Invalid(e.to_string()))?;
        database::upsert_public_key(&self.pool, account, public_key)
            .await
            .map_err(backend)
    }

    async fn fetch_public_key(&self, account: &AccountId) -> StoreResult<Option<String>> {
        database::get_public_key(&self.pool, account)
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn run_migrations(&self) -> anyhow::Result<()> {
        database::run_migrations(&self.pool).await
    }

    async fn stats(&self) -> anyhow::Result<Option<StorageStats>> {
        let (threads, messages, published_keys) = database::counts(&self.pool).await?;
        Ok(Some(StorageStats {
            threads,
            messages,
            published_keys,
        }))
    }
}
