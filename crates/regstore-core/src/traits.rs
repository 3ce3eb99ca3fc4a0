//! The storage interface a registry host programs against.

use async_trait::async_trait;
use regstore_store::SignedMethod;
use serde_json::Value;

use crate::error::RegistryResult;
use crate::package::PackageStore;
use crate::storage::RegistryStorage;
use crate::tarball::{TarballReader, TarballWriter};

/// Caller-supplied metadata edit for [`PackageStorage::update_metadata_with`].
pub type MetadataTransform = Box<dyn FnOnce(Value) -> RegistryResult<Value> + Send>;

/// Registry-wide state: the secret and the set of known packages.
#[async_trait]
pub trait LocalDatabase: Send + Sync {
    async fn get_secret(&self) -> RegistryResult<String>;
    async fn set_secret(&self, secret: &str) -> RegistryResult<()>;
    async fn list_packages(&self) -> RegistryResult<Vec<String>>;
    async fn add_package(&self, name: &str) -> RegistryResult<()>;
    /// Forget `name`. Does not touch the package's stored files.
    async fn remove_package(&self, name: &str) -> RegistryResult<()>;
    fn package_storage(&self, name: &str) -> Box<dyn PackageStorage>;
}

/// Per-package storage operations.
#[async_trait]
pub trait PackageStorage: Send + Sync {
    fn package_name(&self) -> &str;
    async fn read_metadata(&self) -> RegistryResult<Value>;
    async fn create_metadata(&self, doc: &Value) -> RegistryResult<()>;
    async fn update_metadata(&self, doc: &Value) -> RegistryResult<()>;
    async fn update_metadata_with(&self, transform: MetadataTransform) -> RegistryResult<Value>;
    async fn delete_file(&self, file_name: &str) -> RegistryResult<()>;
    async fn remove_package(&self) -> RegistryResult<()>;
    fn write_tarball(&self, file_name: &str) -> TarballWriter;
    fn read_tarball(&self, file_name: &str) -> TarballReader;
    async fn signed_tarball_url(
        &self,
        file_name: &str,
        method: SignedMethod,
    ) -> RegistryResult<String>;
}

#[async_trait]
impl LocalDatabase for RegistryStorage {
    async fn get_secret(&self) -> RegistryResult<String> {
        self.index().get_secret().await
    }

    async fn set_secret(&self, secret: &str) -> RegistryResult<()> {
        self.index().set_secret(secret).await
    }

    async fn list_packages(&self) -> RegistryResult<Vec<String>> {
        self.index().list_packages().await
    }

    async fn add_package(&self, name: &str) -> RegistryResult<()> {
        self.index().add_package(name).await
    }

    async fn remove_package(&self, name: &str) -> RegistryResult<()> {
        self.index().remove_package(name).await
    }

    fn package_storage(&self, name: &str) -> Box<dyn PackageStorage> {
        Box::new(self.package_store(name))
    }
}

#[async_trait]
impl PackageStorage for PackageStore {
    fn package_name(&self) -> &str {
        self.name()
    }

    async fn read_metadata(&self) -> RegistryResult<Value> {
        PackageStore::read_metadata(self).await
    }

    async fn create_metadata(&self, doc: &Value) -> RegistryResult<()> {
        PackageStore::create_metadata(self, doc).await
    }

    async fn update_metadata(&self, doc: &Value) -> RegistryResult<()> {
        PackageStore::update_metadata(self, doc).await
    }

    async fn update_metadata_with(&self, transform: MetadataTransform) -> RegistryResult<Value> {
        PackageStore::update_metadata_with(self, transform).await
    }

    async fn delete_file(&self, file_name: &str) -> RegistryResult<()> {
        PackageStore::delete_file(self, file_name).await
    }

    async fn remove_package(&self) -> RegistryResult<()> {
        PackageStore::remove_package(self).await.map(|_| ())
    }

    fn write_tarball(&self, file_name: &str) -> TarballWriter {
        PackageStore::write_tarball(self, file_name)
    }

    fn read_tarball(&self, file_name: &str) -> TarballReader {
        PackageStore::read_tarball(self, file_name)
    }

    async fn signed_tarball_url(
        &self,
        file_name: &str,
        method: SignedMethod,
    ) -> RegistryResult<String> {
        PackageStore::signed_tarball_url(self, file_name, method).await
    }
}
