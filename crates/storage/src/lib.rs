//! Scoped key/value persistence for client-side state.
//!
//! Backends implement [`KeyValueBackend`] and are allowed to fail. Callers go
//! through [`PersistenceAdapter`], which logs backend failures and degrades
//! them to "nothing persisted" instead of propagating them.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::warn;

mod sqlite;

pub use sqlite::{normalize_database_url, SqliteBackend};

#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>>;
    async fn set(&self, scope: &str, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, scope: &str, key: &str) -> Result<()>;
    async fn clear(&self, scope: &str) -> Result<()>;

    /// Writes a batch of entries as one logical unit.
    ///
    /// The default writes in order and, if any write fails, removes every key
    /// of the batch so no partial batch survives. Backends with transactions
    /// should override this.
    async fn set_all(&self, scope: &str, entries: &[(&str, &str)]) -> Result<()> {
        for (key, value) in entries {
            if let Err(err) = self.set(scope, key, value).await {
                for (written, _) in entries {
                    let _ = self.remove(scope, written).await;
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Process-local backend. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<(String, String), String>) -> T,
    ) -> Result<T> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory backend lock poisoned"))?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>> {
        self.with_entries(|entries| {
            entries
                .get(&(scope.to_string(), key.to_string()))
                .cloned()
        })
    }

    async fn set(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert((scope.to_string(), key.to_string()), value.to_string());
        })
    }

    async fn remove(&self, scope: &str, key: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.remove(&(scope.to_string(), key.to_string()));
        })
    }

    async fn clear(&self, scope: &str) -> Result<()> {
        self.with_entries(|entries| entries.retain(|(entry_scope, _), _| entry_scope != scope))
    }

    async fn set_all(&self, scope: &str, entries: &[(&str, &str)]) -> Result<()> {
        self.with_entries(|stored| {
            for (key, value) in entries {
                stored.insert((scope.to_string(), key.to_string()), value.to_string());
            }
        })
    }
}

/// Stands in for host storage that has been disabled. Every call fails.
pub struct UnavailableBackend;

#[async_trait]
impl KeyValueBackend for UnavailableBackend {
    async fn get(&self, _scope: &str, _key: &str) -> Result<Option<String>> {
        Err(anyhow!("persistent storage is unavailable"))
    }

    async fn set(&self, _scope: &str, _key: &str, _value: &str) -> Result<()> {
        Err(anyhow!("persistent storage is unavailable"))
    }

    async fn remove(&self, _scope: &str, _key: &str) -> Result<()> {
        Err(anyhow!("persistent storage is unavailable"))
    }

    async fn clear(&self, _scope: &str) -> Result<()> {
        Err(anyhow!("persistent storage is unavailable"))
    }
}

#[derive(Clone)]
pub struct PersistenceAdapter {
    backend: Arc<dyn KeyValueBackend>,
    scope: String,
}

impl PersistenceAdapter {
    pub fn new(backend: Arc<dyn KeyValueBackend>, scope: impl Into<String>) -> Self {
        Self {
            backend,
            scope: scope.into(),
        }
    }

    pub fn in_memory(scope: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), scope)
    }

    pub async fn open_sqlite(database_url: &str, scope: impl Into<String>) -> Result<Self> {
        let backend = SqliteBackend::new(database_url).await?;
        Ok(Self::new(Arc::new(backend), scope))
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        match self.backend.get(&self.scope, key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(scope = %self.scope, key, "storage: read failed: {err:#}");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> bool {
        self.report(key, "write", self.backend.set(&self.scope, key, value).await)
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.report(key, "remove", self.backend.remove(&self.scope, key).await)
    }

    /// Removes every entry in this adapter's scope.
    pub async fn clear(&self) -> bool {
        self.report("*", "clear", self.backend.clear(&self.scope).await)
    }

    /// Writes all entries or none of them.
    pub async fn set_all(&self, entries: &[(&str, &str)]) -> bool {
        let keys = entries
            .iter()
            .map(|(key, _)| *key)
            .collect::<Vec<_>>()
            .join(",");
        self.report(
            &keys,
            "batch write",
            self.backend.set_all(&self.scope, entries).await,
        )
    }

    /// Removes each key, continuing past failures. Returns false if any
    /// removal failed.
    pub async fn remove_all(&self, keys: &[&str]) -> bool {
        let mut all_removed = true;
        for key in keys {
            all_removed &= self.remove(key).await;
        }
        all_removed
    }

    fn report(&self, key: &str, action: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(scope = %self.scope, key, "storage: {action} failed: {err:#}");
                false
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
