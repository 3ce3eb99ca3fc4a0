//! Package-registry storage on top of an S3-compatible object store.
//!
//! A registry host keeps three kinds of state here: one index document with
//! the registry secret and the list of known packages, one metadata document
//! per package, and the package's tarballs. All of it lives under a single
//! optional key prefix inside one bucket.
//!
//! # Components
//!
//! - [`RegistryStorage`] -- adapter factory; owns the client and the index
//! - [`RegistryIndex`] -- lazily loaded, write-through cached index document
//! - [`PackageStore`] -- metadata reads and writes, tarball streams, package removal
//! - [`PrefixPurger`] -- paged listing plus capped batch deletes
//! - [`classify`] -- maps raw store failures onto [`ErrorKind`]
//!
//! Hosts that want to stay backend-agnostic program against the
//! [`LocalDatabase`] and [`PackageStorage`] traits.

pub mod config;
pub mod error;
pub mod index;
pub mod keys;
pub mod package;
pub mod purge;
pub mod storage;
pub mod tarball;
pub mod traits;

#[cfg(test)]
mod testing;

pub use config::{normalize_prefix, StorageConfig, MIN_PART_SIZE};
pub use error::{classify, ErrorKind, RegistryError, RegistryResult};
pub use index::{IndexDocument, RegistryIndex};
pub use keys::{KeyLayout, INDEX_FILE, METADATA_FILE};
pub use package::PackageStore;
pub use purge::PrefixPurger;
pub use storage::RegistryStorage;
pub use tarball::{ReadState, TarballReader, TarballWriter, WriteState};
pub use traits::{LocalDatabase, MetadataTransform, PackageStorage};

pub use regstore_store::SignedMethod;
