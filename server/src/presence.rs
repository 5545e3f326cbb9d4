//! Presence directory
//!
//! Maps accounts to their live connections. An account may be connected from
//! several devices at once; entries are removed per connection so one device
//! disconnecting never evicts another. All state lives behind one mutex and
//! is rebuilt from scratch when the process restarts.

use parking_lot::Mutex;
use parley_shared::AccountId;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Outbound side of one live connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::Sender<Vec<u8>>,
}

impl ConnectionHandle {
    /// Wrap the outbound queue of a connection
    pub fn new(id: Uuid, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { id, tx }
    }

    /// Connection id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a frame without waiting
    ///
    /// Returns false if the queue is full or the connection is gone; the
    /// frame is dropped in that case.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        self.tx.try_send(frame).is_ok()
    }
}

#[derive(Default)]
struct Directory {
    by_account: BTreeMap<AccountId, HashMap<Uuid, ConnectionHandle>>,
    by_connection: HashMap<Uuid, AccountId>,
}

/// Registry of who is online and through which connections
#[derive(Default)]
pub struct PresenceDirectory {
    inner: Mutex<Directory>,
}

impl PresenceDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` for `account`
    ///
    /// Joining twice with the same handle is a no-op. If the handle was
    /// registered for another account it is moved.
    pub fn join(&self, account: &AccountId, handle: ConnectionHandle) {
        let mut dir = self.inner.lock();
        let conn_id = handle.id();
        if let Some(previous) = dir.by_connection.insert(conn_id, account.clone()) {
            if &previous != account {
                remove_entry(&mut dir.by_account, &previous, conn_id);
            }
        }
        dir.by_account
            .entry(account.clone())
            .or_default()
            .insert(conn_id, handle);
        debug!("presence join {} via {}", account.short(), conn_id);
    }

    /// Remove a connection, returning the account it belonged to
    pub fn leave(&self, connection_id: Uuid) -> Option<AccountId> {
        let mut dir = self.inner.lock();
        let account = dir.by_connection.remove(&connection_id)?;
        remove_entry(&mut dir.by_account, &account, connection_id);
        debug!("presence leave {} via {}", account.short(), connection_id);
        Some(account)
    }

    /// All live connections of `account`; empty when offline
    pub fn lookup(&self, account: &AccountId) -> Vec<ConnectionHandle> {
        self.inner
            .lock()
            .by_account
            .get(account)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every online account, sorted
    pub fn snapshot(&self) -> Vec<AccountId> {
        self.inner.lock().by_account.keys().cloned().collect()
    }

    /// Every registered connection, for broadcasts
    pub fn all_handles(&self) -> Vec<ConnectionHandle> {
        self.inner
            .lock()
            .by_account
            .values()
            .flat_map(|conns| conns.values().cloned())
            .collect()
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.inner.lock().by_connection.len()
    }

    /// Whether `account` has at least one live connection
    pub fn is_online(&self, account: &AccountId) -> bool {
        self.inner.lock().by_account.contains_key(account)
    }
}

fn remove_entry(
    by_account: &mut BTreeMap<AccountId, HashMap<Uuid, ConnectionHandle>>,
    account: &AccountId,
    connection_id: Uuid,
) {
    if let Some(conns) = by_account.get_mut(account) {
        conns.remove(&connection_id);
        if conns.is_empty() {
            by_account.remove(account);
        }
    }
}
