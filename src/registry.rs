//! Live session registry
//!
//! Caches the latest session snapshot next to the set of connections that are
//! currently attached to it. The repository stays authoritative; an entry only
//! answers "who is listening right now". It also hands out the per-session
//! lock that serializes command flows and phase resolutions.

use crate::types::{ConnectionId, Session, SessionId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub snapshot: Session,
    pub connections: HashSet<ConnectionId>,
}

pub type SessionGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: RwLock<HashMap<SessionId, RegistryEntry>>,
    locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection, creating the entry on first use
    pub async fn join(&self, session_id: &str, connection_id: &str, snapshot: Session) {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(session_id.to_string())
            .or_insert_with(|| RegistryEntry {
                snapshot: snapshot.clone(),
                connections: HashSet::new(),
            });
        entry.snapshot = snapshot;
        entry.connections.insert(connection_id.to_string());
    }

    /// Detach a connection. Returns true if the entry was dropped because no
    /// connection is left.
    pub async fn leave(&self, session_id: &str, connection_id: &str) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(session_id) else {
            return false;
        };
        entry.connections.remove(connection_id);
        if entry.connections.is_empty() {
            entries.remove(session_id);
            tracing::debug!("Registry entry for session {} dropped", session_id);
            return true;
        }
        false
    }

    /// Detach a connection from every session it is attached to
    pub async fn leave_all(&self, connection_id: &str) -> Vec<SessionId> {
        let mut entries = self.entries.write().await;
        let affected: Vec<SessionId> = entries
            .iter()
            .filter(|(_, e)| e.connections.contains(connection_id))
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in &affected {
            if let Some(entry) = entries.get_mut(session_id) {
                entry.connections.remove(connection_id);
                if entry.connections.is_empty() {
                    entries.remove(session_id);
                }
            }
        }
        affected
    }

    pub async fn get(&self, session_id: &str) -> Option<RegistryEntry> {
        self.entries.read().await.get(session_id).cloned()
    }

    /// Replace the cached snapshot if the session has an entry
    pub async fn refresh(&self, snapshot: &Session) {
        if let Some(entry) = self.entries.write().await.get_mut(&snapshot.id) {
            entry.snapshot = snapshot.clone();
        }
    }

    /// Tear down the entry. The session's lock outlives it while anyone holds
    /// or waits on it, and is pruned by a later [`SessionRegistry::lock`].
    pub async fn remove(&self, session_id: &str) -> Option<RegistryEntry> {
        self.entries.write().await.remove(session_id)
    }

    pub async fn connections(&self, session_id: &str) -> HashSet<ConnectionId> {
        self.entries
            .read()
            .await
            .get(session_id)
            .map(|e| e.connections.clone())
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Serialize work on one session. Different sessions never contend.
    pub async fn lock(&self, session_id: &str) -> SessionGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop idle locks nobody else references
            locks.retain(|id, l| id == session_id || Arc::strong_count(l) > 1);
            locks.entry(session_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
