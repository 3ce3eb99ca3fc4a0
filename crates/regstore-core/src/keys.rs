//! Object key layout.
//!
//! ```text
//! <prefix>registry-index.json          index document
//! <prefix><package>/metadata.json      package metadata document
//! <prefix><package>/<file>             tarballs and ancillary files
//! ```

/// Key of the index document, relative to the prefix.
pub const INDEX_FILE: &str = "registry-index.json";

/// Fixed name of the per-package metadata document.
pub const METADATA_FILE: &str = "metadata.json";

/// Builds object keys under one normalized prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    /// `prefix` must already be normalized (empty or ending with `/`).
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn index_key(&self) -> String {
        format!("{}{INDEX_FILE}", self.prefix)
    }

    /// Prefix shared by every object of `package`, trailing `/` included.
    ///
    /// The trailing separator keeps `left-pad` from matching `left-pad-extra`.
    pub fn package_prefix(&self, package: &str) -> String {
        format!("{}{package}/", self.prefix)
    }

    pub fn metadata_key(&self, package: &str) -> String {
        self.file_key(package, METADATA_FILE)
    }

    pub fn file_key(&self, package: &str, file_name: &str) -> String {
        format!("{}{package}/{file_name}", self.prefix)
    }
}
