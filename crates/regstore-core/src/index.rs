//! The registry-wide package index.
//!
//! One JSON document per bucket+prefix lists every known package name and
//! holds the host's signing secret. [`RegistryIndex`] fetches it lazily on
//! first use, keeps it in memory for the life of the instance, and rewrites
//! the whole remote object after every mutation.
//!
//! There is no version check on write: two processes mutating the same index
//! race, and the last write wins. Within one instance, mutations are
//! serialized by the cache lock and rolled back if the write fails.

use std::sync::Arc;

use bytes::Bytes;
use regstore_store::ObjectStore;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tracing::{debug, info};

use crate::error::{classify, RegistryError, RegistryResult};

/// Persisted shape of the index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Package names in insertion order, without duplicates.
    #[serde(rename = "list", alias = "packageNames", default)]
    pub package_names: Vec<String>,
    /// Opaque signing token; empty until first set.
    #[serde(default)]
    pub secret: String,
}

/// Lazily loaded, write-through cache of the index document.
#[derive(Debug)]
pub struct RegistryIndex {
    store: Arc<dyn ObjectStore>,
    key: String,
    cache: OnceCell<Mutex<IndexDocument>>,
}

impl RegistryIndex {
    /// `key` is the full object key of the index document.
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            cache: OnceCell::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the document has been fetched yet.
    pub fn is_loaded(&self) -> bool {
        self.cache.initialized()
    }

    pub async fn get_secret(&self) -> RegistryResult<String> {
        Ok(self.document().await?.secret.clone())
    }

    pub async fn set_secret(&self, secret: &str) -> RegistryResult<()> {
        let mut doc = self.document().await?;
        let previous = std::mem::replace(&mut doc.secret, secret.to_string());
        if let Err(err) = self.persist(&doc).await {
            doc.secret = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Snapshot of the known package names.
    pub async fn list_packages(&self) -> RegistryResult<Vec<String>> {
        Ok(self.document().await?.package_names.clone())
    }

    /// Add `name`; a no-op if it is already listed.
    pub async fn add_package(&self, name: &str) -> RegistryResult<()> {
        let mut doc = self.document().await?;
        if doc.package_names.iter().any(|n| n == name) {
            return Ok(());
        }
        doc.package_names.push(name.to_string());
        if let Err(err) = self.persist(&doc).await {
            doc.package_names.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Remove `name`; a no-op if it is not listed.
    pub async fn remove_package(&self, name: &str) -> RegistryResult<()> {
        let mut doc = self.document().await?;
        let Some(position) = doc.package_names.iter().position(|n| n == name) else {
            return Ok(());
        };
        let removed = doc.package_names.remove(position);
        if let Err(err) = self.persist(&doc).await {
            doc.package_names.insert(position, removed);
            return Err(err);
        }
        Ok(())
    }

    /// Lock the cached document, loading it on first use.
    ///
    /// Concurrent first calls share a single fetch.
    async fn document(&self) -> RegistryResult<MutexGuard<'_, IndexDocument>> {
        let cell = self.cache.get_or_try_init(|| self.load()).await?;
        Ok(cell.lock().await)
    }

    async fn load(&self) -> RegistryResult<Mutex<IndexDocument>> {
        let doc = match self.store.get_bytes(&self.key).await.map_err(classify) {
            Ok(body) => serde_json::from_slice::<IndexDocument>(&body)
                .map_err(|e| RegistryError::invalid_document(&self.key, e))?,
            Err(err) if err.is_not_found() => {
                info!(key = %self.key, "registry index not found; starting empty");
                IndexDocument::default()
            }
            Err(err) => return Err(err),
        };
        debug!(key = %self.key, packages = doc.package_names.len(), "loaded registry index");
        Ok(Mutex::new(doc))
    }

    async fn persist(&self, doc: &IndexDocument) -> RegistryResult<()> {
        let body = serde_json::to_vec(doc).map_err(|e| RegistryError::invalid_document(&self.key, e))?;
        self.store.put(&self.key, Bytes::from(body)).await?;
        debug!(key = %self.key, packages = doc.package_names.len(), "persisted registry index");
        Ok(())
    }
}
