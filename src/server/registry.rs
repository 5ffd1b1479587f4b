//! Session registry
//!
//! Maps a player identity to its live connection. At most one entry exists
//! per identity and every visible entry is Open; entries whose connection has
//! started closing are treated as absent and replaced on the next register.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::ws::Connection;

/// Errors that can occur during registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Identity already connected: {0}")]
    AlreadyConnected(String),

    #[error("Connection is not open")]
    NotOpen,
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Identity-keyed registry of live connections
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Connection>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection under `identity`.
    ///
    /// The presence check and the insert happen under one write lock, so two
    /// concurrent registrations for the same identity cannot both succeed.
    pub async fn register(
        &self,
        identity: &str,
        connection: Arc<Connection>,
    ) -> RegistryResult<()> {
        if !connection.is_open() {
            return Err(RegistryError::NotOpen);
        }

        let mut sessions = self.sessions.write().await;
        match sessions.entry(identity.to_string()) {
            Entry::Occupied(existing) if existing.get().is_open() => {
                Err(RegistryError::AlreadyConnected(identity.to_string()))
            }
            Entry::Occupied(mut stale) => {
                debug!(
                    identity,
                    connection = %stale.get().id(),
                    "Replacing registry entry for a closing connection"
                );
                stale.insert(connection);
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(connection);
                Ok(())
            }
        }
    }

    /// Remove the entry for `identity`. No-op if absent.
    pub async fn unregister(&self, identity: &str) -> Option<Arc<Connection>> {
        self.sessions.write().await.remove(identity)
    }

    /// Remove whichever entry points at `connection`.
    ///
    /// An entry that has since been replaced by a newer connection for the
    /// same identity is left alone. Returns `true` if something was removed.
    pub async fn unregister_connection(&self, connection: &Connection) -> bool {
        let mut sessions = self.sessions.write().await;

        let key = match connection.identity() {
            Some(identity) => Some(identity.to_string()),
            None => sessions
                .iter()
                .find(|(_, c)| c.id() == connection.id())
                .map(|(identity, _)| identity.clone()),
        };

        match key {
            Some(key) if sessions.get(&key).map(|c| c.id()) == Some(connection.id()) => {
                sessions.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Live connection for `identity`
    pub async fn lookup(&self, identity: &str) -> Option<Arc<Connection>> {
        self.sessions
            .read()
            .await
            .get(identity)
            .filter(|c| c.is_open())
            .cloned()
    }

    /// Whether `identity` has a live connection
    pub async fn contains(&self, identity: &str) -> bool {
        self.lookup(identity).await.is_some()
    }

    /// Identity registered for `connection`
    pub async fn identity_of(&self, connection: &Connection) -> Option<String> {
        self.sessions
            .read()
            .await
            .iter()
            .find(|(_, c)| c.id() == connection.id() && c.is_open())
            .map(|(identity, _)| identity.clone())
    }

    /// Snapshot of all live entries.
    ///
    /// The returned vector is a copy; later registrations do not affect it.
    pub async fn all(&self) -> Vec<(String, Arc<Connection>)> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.is_open())
            .map(|(identity, c)| (identity.clone(), Arc::clone(c)))
            .collect()
    }

    /// Number of live entries
    pub async fn count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|c| c.is_open())
            .count()
    }

    /// Sorted identities of all live entries
    pub async fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.all().await.into_iter().map(|(i, _)| i).collect();
        identities.sort();
        identities
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
