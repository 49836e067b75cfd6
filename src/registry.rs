//! Registry of currently running routes, keyed by namespace and name.
//!
//! Enumeration hands out snapshots, so callers may cancel or remove
//! entries mid-iteration without holding any lock — concurrent removal is
//! tolerated by design.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use crate::route::RouteHandle;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("already exists")]
    AlreadyExists,
}

/// Concurrent `(namespace, name)` → handle index.
#[derive(Default)]
pub struct ActiveRegistry {
    routes: DashMap<(String, String), Arc<RouteHandle>>,
}

impl ActiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle; at most one route may be active per key.
    pub fn set(&self, handle: Arc<RouteHandle>) -> Result<(), RegistryError> {
        let key = (handle.namespace.clone(), handle.name.clone());
        match self.routes.entry(key) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<RouteHandle>> {
        self.routes
            .get(&(namespace.to_string(), name.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.routes
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Snapshot of every active route in `namespace`, ordered by name.
    pub fn snapshot(&self, namespace: &str) -> Vec<Arc<RouteHandle>> {
        let mut handles: Vec<_> = self
            .routes
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .map(|entry| entry.value().clone())
            .collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        handles
    }

    /// Snapshot of every active route across all namespaces.
    pub fn snapshot_all(&self) -> Vec<Arc<RouteHandle>> {
        let mut handles: Vec<_> = self
            .routes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        handles.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        handles
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
