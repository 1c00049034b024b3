//! Registry of live clusters keyed by scope.

use std::collections::HashMap;
use std::sync::Arc;

use mcluster_core::ScopeKey;
use parking_lot::RwLock;

use crate::error::{ControlError, Result};
use crate::handle::ClusterHandle;
use crate::lifecycle::is_terminal;

/// Maps each [`ScopeKey`] to the cluster serving it.
///
/// At most one handle exists per key. Lookups clone the `Arc`, so the lock is never held
/// across an await point.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    entries: RwLock<HashMap<ScopeKey, Arc<ClusterHandle>>>,
}

impl ScopeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The handle registered for `key`.
    #[must_use]
    pub fn get(&self, key: &ScopeKey) -> Option<Arc<ClusterHandle>> {
        self.entries.read().get(key).cloned()
    }

    /// Register `handle` under `key`, returning any handle it replaced.
    pub fn put(&self, key: ScopeKey, handle: Arc<ClusterHandle>) -> Option<Arc<ClusterHandle>> {
        self.entries.write().insert(key, handle)
    }

    /// Remove the handle registered for `key`.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::StillLive` if the cluster is neither stopped nor failed; the
    /// entry is left in place.
    pub fn remove(&self, key: &ScopeKey) -> Result<Option<Arc<ClusterHandle>>> {
        let mut entries = self.entries.write();
        if let Some(handle) = entries.get(key) {
            let health = handle.health();
            if !is_terminal(health) {
                return Err(ControlError::StillLive {
                    key: key.clone(),
                    health,
                });
            }
        }
        Ok(entries.remove(key))
    }

    /// Whether a cluster is registered for `key`.
    #[must_use]
    pub fn contains(&self, key: &ScopeKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Number of registered clusters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no clusters are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Every registered key.
    #[must_use]
    pub fn keys(&self) -> Vec<ScopeKey> {
        self.entries.read().keys().cloned().collect()
    }
}
