use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};

/// Smallest part size S3 accepts for every part but the last.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Configuration for the S3 storage adapter.
///
/// This is the `store.s3-storage` table of the registry host's config file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Target bucket. Required.
    pub bucket: String,
    /// Prepended to every object key. Normalized to end with `/`.
    #[serde(alias = "keyPrefix")]
    pub key_prefix: Option<String>,
    /// Custom S3 endpoint (MinIO, Ceph, ...).
    pub endpoint: Option<String>,
    pub region: Option<String>,
    #[serde(alias = "forcePathStyle", alias = "s3ForcePathStyle")]
    pub force_path_style: Option<bool>,
    /// Size of each multipart upload part in bytes.
    #[serde(alias = "partSize")]
    pub part_size: usize,
    /// Use the store's create-if-absent write instead of probing first.
    #[serde(alias = "conditionalPut")]
    pub conditional_put: bool,
    /// Lifetime of pre-signed tarball URLs.
    #[serde(alias = "signedUrlTtlSecs")]
    pub signed_url_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            key_prefix: None,
            endpoint: None,
            region: None,
            force_path_style: None,
            part_size: MIN_PART_SIZE,
            conditional_put: false,
            signed_url_ttl_secs: 900,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct HostConfig {
    #[serde(default)]
    store: HostStoreSection,
}

#[derive(Debug, Default, Deserialize)]
struct HostStoreSection {
    #[serde(rename = "s3-storage")]
    s3_storage: Option<StorageConfig>,
}

impl StorageConfig {
    /// Config for `bucket` with every other setting at its default.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    pub fn with_conditional_put(mut self, enabled: bool) -> Self {
        self.conditional_put = enabled;
        self
    }

    /// Check required fields and normalize the key prefix.
    pub fn validate(mut self) -> RegistryResult<Self> {
        if self.bucket.trim().is_empty() {
            return Err(RegistryError::Config("s3 storage requires a bucket".into()));
        }
        if self.part_size == 0 {
            return Err(RegistryError::Config("part_size must be positive".into()));
        }
        self.key_prefix = Some(normalize_prefix(self.key_prefix.as_deref()));
        Ok(self)
    }

    /// The normalized key prefix; empty when none is configured.
    pub fn prefix(&self) -> String {
        normalize_prefix(self.key_prefix.as_deref())
    }

    /// Parse the `[store.s3-storage]` table out of a host config file.
    pub fn from_host_toml(source: &str) -> RegistryResult<Self> {
        let host: HostConfig = toml::from_str(source)
            .map_err(|e| RegistryError::Config(format!("invalid config file: {e}")))?;
        let config = host.store.s3_storage.ok_or_else(|| {
            RegistryError::Config(
                "s3 storage missing config. Add `store.s3-storage` to your config file".into(),
            )
        })?;
        config.validate()
    }

    /// Read and parse a host config file.
    pub fn load(path: &Path) -> RegistryResult<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            RegistryError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_host_toml(&source)
    }
}

/// `None` -> `""`, `"a"` -> `"a/"`, `"a/"` -> `"a/"`.
pub fn normalize_prefix(prefix: Option<&str>) -> String {
    match prefix {
        None | Some("") => String::new(),
        Some(p) if p.ends_with('/') => p.to_string(),
        Some(p) => format!("{p}/"),
    }
}
