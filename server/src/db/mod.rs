//! Storage backends
//!
//! `DatabaseBackend` bundles the conversation repository and the profile
//! directory with the operations only the server needs. SQLite is the
//! durable backend; `memory` keeps everything in process for development.

pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use parley_shared::{ConversationRepository, InMemoryStore, ProfileDirectory};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Row counts reported on the admin endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub threads: i64,
    pub messages: i64,
    pub published_keys: i64,
}

/// Everything the server reads and writes outside the live path
#[async_trait]
pub trait DatabaseBackend: ConversationRepository + ProfileDirectory {
    /// Short backend name for `/info`
    fn name(&self) -> &'static str;

    async fn run_migrations(&self) -> Result<()>;

    /// Row counts, when the backend can report them cheaply
    async fn stats(&self) -> Result<Option<StorageStats>>;
}

#[async_trait]
impl DatabaseBackend for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn run_migrations(&self) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> Result<Option<StorageStats>> {
        Ok(None)
    }
}

/// Open the backend named by `database_url`
///
/// `memory` selects the in-process store, anything else is a SQLite URL.
pub async fn connect(database_url: &str) -> Result<Arc<dyn DatabaseBackend>> {
    if database_url == "memory" {
        warn!("Using in-memory storage; history is lost on restart");
        return Ok(Arc::new(InMemoryStore::new()));
    }
    let pool = crate::database::init(database_url).await?;
    Ok(Arc::new(sqlite::SqliteBackend::new(pool)))
}
