//! Keyed registry for long-lived clients (peers, notification channels).

use crate::types::{PointGraphError, Result};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Thread-safe map from owner ID to a client handle.
///
/// At most one client is registered per ID. Lookups clone the handle, so
/// `C` is normally an `Arc` or a channel sender.
#[derive(Debug)]
pub struct Registry<C> {
    clients: RwLock<BTreeMap<String, C>>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            clients: RwLock::new(BTreeMap::new()),
        }
    }
}

fn poisoned() -> PointGraphError {
    PointGraphError::Storage("registry lock poisoned".to_string())
}

impl<C: Clone> Registry<C> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. Fails if the ID is taken.
    pub fn register(&self, id: impl Into<String>, client: C) -> Result<()> {
        let id = id.into();
        let mut clients = self.clients.write().map_err(|_| poisoned())?;
        if clients.contains_key(&id) {
            return Err(PointGraphError::DuplicateRegistration(id));
        }
        clients.insert(id, client);
        Ok(())
    }

    /// Remove a client, returning it if present.
    pub fn unregister(&self, id: &str) -> Result<Option<C>> {
        Ok(self.clients.write().map_err(|_| poisoned())?.remove(id))
    }

    /// Look up a client.
    pub fn get(&self, id: &str) -> Result<Option<C>> {
        Ok(self.clients.read().map_err(|_| poisoned())?.get(id).cloned())
    }

    /// Registered IDs, sorted.
    pub fn ids(&self) -> Result<Vec<String>> {
        Ok(self.clients.read().map_err(|_| poisoned())?.keys().cloned().collect())
    }

    /// Snapshot of all clients, sorted by ID.
    pub fn clients(&self) -> Result<Vec<(String, C)>> {
        Ok(self
            .clients
            .read()
            .map_err(|_| poisoned())?
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect())
    }
}
