//! Conversation and profile repository interfaces
//!
//! The server implements these over SQLite, the client over HTTP.
//! [`InMemoryStore`] backs tests and single-process setups.

use crate::error::{StoreError, StoreResult};
use crate::model::{AccountId, MessageEnvelope, Thread};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

/// Durable thread and message storage
#[async_trait]
pub trait ConversationRepository: Send + Sync + 'static {
    /// Return the thread for the unordered pair `(a, b)`, creating it if needed
    async fn find_or_create_thread(&self, a: &AccountId, b: &AccountId) -> StoreResult<Thread>;

    /// Fetch one thread
    async fn get_thread(&self, thread_id: Uuid) -> StoreResult<Option<Thread>>;

    /// All threads `account` is a member of, newest first
    async fn list_threads_for_account(&self, account: &AccountId) -> StoreResult<Vec<Thread>>;

    /// Persist a message
    ///
    /// Idempotent on `message.id`: storing the same id again returns the
    /// stored copy. Sender and receiver must be the two thread members.
    /// An id already used for another thread or another sender is rejected
    /// as invalid.
    async fn append_message(&self, message: MessageEnvelope) -> StoreResult<MessageEnvelope>;

    /// All messages of a thread, oldest first
    async fn list_messages(&self, thread_id: Uuid) -> StoreResult<Vec<MessageEnvelope>>;
}

/// Account profile lookups used for key distribution
#[async_trait]
pub trait ProfileDirectory: Send + Sync + 'static {
    /// Mirror `account`'s exported public key onto its profile
    async fn publish_public_key(&self, account: &AccountId, public_key: &str) -> StoreResult<()>;

    /// Read an account's exported public key, if it has published one
    async fn fetch_public_key(&self, account: &AccountId) -> StoreResult<Option<String>>;
}

/// Check an outgoing message against its thread
pub fn validate_message(thread: &Thread, message: &MessageEnvelope) -> StoreResult<()> {
    if !thread.has_member(&message.sender_id) {
        return Err(StoreError::Unauthorized);
    }
    if message.sender_id == message.receiver_id || !thread.has_member(&message.receiver_id) {
        return Err(StoreError::Invalid(
            "receiver must be the other thread member".into(),
        ));
    }
    Ok(())
}

/// Resolve an append whose id is already stored
///
/// Only a genuine repeat (same thread, sender and receiver) returns the
/// stored copy.
pub fn resolve_existing(
    existing: MessageEnvelope,
    incoming: &MessageEnvelope,
) -> StoreResult<MessageEnvelope> {
    if existing.thread_id != incoming.thread_id
        || existing.sender_id != incoming.sender_id
        || existing.receiver_id != incoming.receiver_id
    {
        return Err(StoreError::Invalid(format!(
            "message id {} is already in use",
            incoming.id
        )));
    }
    Ok(existing)
}

#[derive(Default)]
struct Inner {
    threads: HashMap<Uuid, Thread>,
    pairs: HashMap<[AccountId; 2], Uuid>,
    messages: HashMap<Uuid, Vec<MessageEnvelope>>,
    public_keys: HashMap<AccountId, String>,
}

/// Process-local repository
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationRepository for InMemoryStore {
    async fn find_or_create_thread(&self, a: &AccountId, b: &AccountId) -> StoreResult<Thread> {
        let pair = Thread::canonical_pair(a, b)?;
        let mut inner = self.inner.lock();
        if let Some(id) = inner.pairs.get(&pair) {
            if let Some(thread) = inner.threads.get(id) {
                return Ok(thread.clone());
            }
        }
        let thread = Thread {
            id: Uuid::new_v4(),
            members: pair.clone(),
            created_at: Utc::now(),
        };
        inner.pairs.insert(pair, thread.id);
        inner.threads.insert(thread.id, thread.clone());
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: Uuid) -> StoreResult<Option<Thread>> {
        Ok(self.inner.lock().threads.get(&thread_id).cloned())
    }

    async fn list_threads_for_account(&self, account: &AccountId) -> StoreResult<Vec<Thread>> {
        let inner = self.inner.lock();
        let mut threads: Vec<Thread> = inner
            .threads
            .values()
            .filter(|t| t.has_member(account))
            .cloned()
            .collect();
        threads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(threads)
    }

    async fn append_message(&self, message: MessageEnvelope) -> StoreResult<MessageEnvelope> {
        let mut inner = self.inner.lock();
        let thread = inner
            .threads
            .get(&message.thread_id)
            .ok_or_else(|| StoreError::NotFound(format!("thread {}", message.thread_id)))?;
        validate_message(thread, &message)?;

        let existing = inner
            .messages
            .values()
            .flatten()
            .find(|m| m.id == message.id)
            .cloned();
        if let Some(existing) = existing {
            return resolve_existing(existing, &message);
        }
        inner
            .messages
            .entry(message.thread_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, thread_id: Uuid) -> StoreResult<Vec<MessageEnvelope>> {
        let inner = self.inner.lock();
        if !inner.threads.contains_key(&thread_id) {
            return Err(StoreError::NotFound(format!("thread {}", thread_id)));
        }
        let mut messages = inner.messages.get(&thread_id).cloned().unwrap_or_default();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }
}

#[async_trait]
impl ProfileDirectory for InMemoryStore {
    async fn publish_public_key(&self, account: &AccountId, public_key: &str) -> StoreResult<()> {
        crate::keys::import_public(public_key)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        self.inner
            .lock()
            .public_keys
            .insert(account.clone(), public_key.to_string());
        Ok(())
    }

    async fn fetch_public_key(&self, account: &AccountId) -> StoreResult<Option<String>> {
        Ok(self.inner.lock().public_keys.get(account).cloned())
    }
}
