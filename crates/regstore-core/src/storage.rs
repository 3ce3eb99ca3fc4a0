use std::path::Path;
use std::sync::Arc;

use regstore_store::{ObjectStore, S3ObjectStore, S3Options, MAX_DELETE_BATCH};
use tracing::info;

use crate::config::{StorageConfig, MIN_PART_SIZE};
use crate::error::{RegistryError, RegistryResult};
use crate::index::RegistryIndex;
use crate::keys::KeyLayout;
use crate::package::PackageStore;
use crate::purge::PrefixPurger;

/// Entry point the registry host constructs once per process.
///
/// Owns the object-store client and the registry index; hands out a
/// [`PackageStore`] per package name.
#[derive(Debug)]
pub struct RegistryStorage {
    config: Arc<StorageConfig>,
    store: Arc<dyn ObjectStore>,
    layout: KeyLayout,
    index: RegistryIndex,
}

impl RegistryStorage {
    /// Build the adapter over an existing object store.
    pub fn new(config: StorageConfig, store: Arc<dyn ObjectStore>) -> RegistryResult<Self> {
        let config = config.validate()?;
        let layout = KeyLayout::new(config.prefix());
        let index = RegistryIndex::new(store.clone(), layout.index_key());
        info!(
            bucket = %config.bucket,
            prefix = %layout.prefix(),
            "registry storage ready"
        );
        Ok(Self {
            config: Arc::new(config),
            store,
            layout,
            index,
        })
    }

    /// Build the adapter with an S3 client derived from `config`.
    ///
    /// S3 rejects non-final multipart parts under 5 MiB, so smaller part
    /// sizes are refused here.
    pub fn connect(config: StorageConfig) -> RegistryResult<Self> {
        let config = config.validate()?;
        if config.part_size < MIN_PART_SIZE {
            return Err(RegistryError::Config(format!(
                "part_size must be at least {MIN_PART_SIZE} bytes for S3"
            )));
        }
        let store = S3ObjectStore::new(S3Options {
            bucket: config.bucket.clone(),
            endpoint: config.endpoint.clone(),
            region: config.region.clone(),
            force_path_style: config.force_path_style,
            conditional_put: config.conditional_put,
            page_size: MAX_DELETE_BATCH,
        })
        .map_err(|e| RegistryError::Config(e.to_string()))?;
        Self::new(config, Arc::new(store))
    }

    /// Read `[store.s3-storage]` from a host config file and connect.
    pub fn from_config_file(path: &Path) -> RegistryResult<Self> {
        Self::connect(StorageConfig::load(path)?)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn index(&self) -> &RegistryIndex {
        &self.index
    }

    pub fn package_store(&self, name: &str) -> PackageStore {
        PackageStore::new(self.store.clone(), self.config.clone(), name)
    }

    /// Purge everything under the configured prefix, index included.
    ///
    /// Only for tearing down a registry; the in-memory index is not reset.
    pub async fn purge_all(&self) -> RegistryResult<usize> {
        PrefixPurger::new(self.store.clone())
            .purge(self.layout.prefix())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::LocalDatabase;
    use bytes::Bytes;
    use regstore_store::InMemoryObjectStore;
    use serde_json::json;

    fn storage(store: &InMemoryObjectStore) -> RegistryStorage {
        let config = StorageConfig::new("registry").with_key_prefix("npm/");
        RegistryStorage::new(config, Arc::new(store.clone())).unwrap()
    }

    #[test]
    fn rejects_missing_bucket() {
        let err = RegistryStorage::new(
            StorageConfig::default(),
            Arc::new(InMemoryObjectStore::new()),
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::Config(_)));
    }

    #[test]
    fn s3_rejects_small_parts() {
        let config = StorageConfig::new("registry").with_part_size(1024);
        let err = RegistryStorage::connect(config).unwrap_err();
        assert!(err.to_string().contains("part_size"));
    }

    #[test]
    fn index_lives_under_prefix() {
        let store = InMemoryObjectStore::new();
        assert_eq!(storage(&store).index().key(), "npm/registry-index.json");
    }

    #[tokio::test]
    async fn host_flow_through_traits() {
        let store = InMemoryObjectStore::new();
        let registry = storage(&store);
        let db: &dyn LocalDatabase = &registry;

        db.add_package("left-pad").await.unwrap();
        let pkg = db.package_storage("left-pad");
        assert_eq!(pkg.package_name(), "left-pad");
        pkg.create_metadata(&json!({"name": "left-pad"})).await.unwrap();

        let mut writer = pkg.write_tarball("left-pad-1.3.0.tgz");
        writer.write(&b"tarball"[..]).await.unwrap();
        writer.finish().await.unwrap();

        let updated = pkg
            .update_metadata_with(Box::new(|mut doc: serde_json::Value| -> RegistryResult<_> {
                doc["dist-tags"] = json!({"latest": "1.3.0"});
                Ok(doc)
            }))
            .await
            .unwrap();
        assert_eq!(updated["dist-tags"]["latest"], "1.3.0");
        assert_eq!(db.list_packages().await.unwrap(), vec!["left-pad"]);

        pkg.remove_package().await.unwrap();
        db.remove_package("left-pad").await.unwrap();
        assert!(db.list_packages().await.unwrap().is_empty());
        assert_eq!(store.keys(), vec!["npm/registry-index.json".to_string()]);
    }

    #[tokio::test]
    async fn removing_from_index_keeps_files() {
        let store = InMemoryObjectStore::new();
        let registry = storage(&store);
        registry.index().add_package("a").await.unwrap();
        store
            .put("npm/a/metadata.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        registry.index().remove_package("a").await.unwrap();
        assert!(store.object("npm/a/metadata.json").is_some());
    }

    #[tokio::test]
    async fn purge_all_clears_prefix() {
        let store = InMemoryObjectStore::new();
        let registry = storage(&store);
        registry.index().add_package("a").await.unwrap();
        registry
            .package_store("a")
            .update_metadata(&json!({}))
            .await
            .unwrap();
        store.put("other/keep", Bytes::new()).await.unwrap();
        assert_eq!(registry.purge_all().await.unwrap(), 2);
        assert_eq!(store.keys(), vec!["other/keep".to_string()]);
    }
}
