use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use regstore_store::{ObjectStore, SignedMethod};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::config::StorageConfig;
use crate::error::{classify, RegistryError, RegistryResult};
use crate::keys::KeyLayout;
use crate::purge::PrefixPurger;
use crate::tarball::{TarballReader, TarballWriter};

/// Storage for one package: its metadata document and its files.
///
/// Cheap to clone. Holds no per-package state beyond the name.
#[derive(Clone, Debug)]
pub struct PackageStore {
    store: Arc<dyn ObjectStore>,
    config: Arc<StorageConfig>,
    layout: KeyLayout,
    name: String,
}

impl PackageStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: Arc<StorageConfig>,
        name: impl Into<String>,
    ) -> Self {
        let layout = KeyLayout::new(config.prefix());
        Self {
            store,
            config,
            layout,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata_key(&self) -> String {
        self.layout.metadata_key(&self.name)
    }

    pub fn file_key(&self, file_name: &str) -> String {
        self.layout.file_key(&self.name, file_name)
    }

    /// Fetch and parse the metadata document.
    #[instrument(skip(self), fields(package = %self.name))]
    pub async fn read_metadata(&self) -> RegistryResult<Value> {
        let key = self.metadata_key();
        let body = self.store.get_bytes(&key).await.map_err(classify)?;
        serde_json::from_slice(&body).map_err(|e| RegistryError::invalid_document(key, e))
    }

    /// Store the metadata document only if none exists yet.
    ///
    /// Fails with `Conflict` when the package already has metadata.
    #[instrument(skip(self, doc), fields(package = %self.name))]
    pub async fn create_metadata(&self, doc: &Value) -> RegistryResult<()> {
        let key = self.metadata_key();
        let body = encode(&key, doc)?;
        if self.store.supports_conditional_put() {
            self.store.put_if_absent(&key, body).await?;
        } else {
            match self.store.head(&key).await.map_err(classify) {
                Ok(_) => return Err(RegistryError::conflict(key)),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            self.store.put(&key, body).await?;
        }
        info!(package = %self.name, "created package metadata");
        Ok(())
    }

    /// Store the metadata document unconditionally.
    #[instrument(skip(self, doc), fields(package = %self.name))]
    pub async fn update_metadata(&self, doc: &Value) -> RegistryResult<()> {
        let key = self.metadata_key();
        let body = encode(&key, doc)?;
        self.store.put(&key, body).await?;
        debug!(package = %self.name, "updated package metadata");
        Ok(())
    }

    /// Read the metadata, apply `transform`, and write the result back.
    ///
    /// The transform may reject the document; nothing is written then.
    /// Not atomic against concurrent writers.
    pub async fn update_metadata_with<F>(&self, transform: F) -> RegistryResult<Value>
    where
        F: FnOnce(Value) -> RegistryResult<Value> + Send,
    {
        let current = self.read_metadata().await?;
        let updated = transform(current)?;
        self.update_metadata(&updated).await?;
        Ok(updated)
    }

    /// Delete one file of the package. Missing files are not an error.
    #[instrument(skip(self), fields(package = %self.name))]
    pub async fn delete_file(&self, file_name: &str) -> RegistryResult<()> {
        self.store.delete(&self.file_key(file_name)).await?;
        Ok(())
    }

    /// Delete everything stored under the package. Returns the object count.
    #[instrument(skip(self), fields(package = %self.name))]
    pub async fn remove_package(&self) -> RegistryResult<usize> {
        let removed = PrefixPurger::new(self.store.clone())
            .purge(&self.layout.package_prefix(&self.name))
            .await?;
        info!(package = %self.name, removed, "removed package");
        Ok(removed)
    }

    /// Open a streaming upload for `file_name`.
    ///
    /// Existing tarballs are never overwritten; the handle fails with
    /// `Conflict` instead.
    pub fn write_tarball(&self, file_name: &str) -> TarballWriter {
        TarballWriter::spawn(
            self.store.clone(),
            self.file_key(file_name),
            self.config.part_size,
        )
    }

    /// Open a streaming download for `file_name`.
    pub fn read_tarball(&self, file_name: &str) -> TarballReader {
        TarballReader::spawn(self.store.clone(), self.file_key(file_name))
    }

    /// Presigned URL for fetching or uploading `file_name` directly.
    pub async fn signed_tarball_url(
        &self,
        file_name: &str,
        method: SignedMethod,
    ) -> RegistryResult<String> {
        let ttl = Duration::from_secs(self.config.signed_url_ttl_secs);
        let url = self
            .store
            .signed_url(method, &self.file_key(file_name), ttl)
            .await?;
        Ok(url)
    }
}

fn encode(key: &str, doc: &Value) -> RegistryResult<Bytes> {
    serde_json::to_vec_pretty(doc)
        .map(Bytes::from)
        .map_err(|e| RegistryError::invalid_document(key, e))
}
