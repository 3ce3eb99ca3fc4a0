//! Object storage capability for the registry storage adapter.
//!
//! The registry adapter never talks to a vendor SDK directly. It consumes the
//! [`ObjectStore`] trait defined here: whole-object put/get/delete, existence
//! checks, paged prefix listings, capped batch deletes, multipart uploads and
//! pre-signed URLs. Nothing in this crate interprets object contents.
//!
//! # Storage Backends
//!
//! - [`InMemoryObjectStore`] -- `BTreeMap`-based bucket for tests and embedding
//! - [`S3ObjectStore`] -- any S3-compatible endpoint, via the `object_store` crate
//!
//! # Design Rules
//!
//! 1. Keys are full object keys inside one bucket; prefixes are plain strings.
//! 2. Listings are paged. Callers must follow `next_token` until it is `None`.
//! 3. Multipart uploads are invisible until completed.
//! 4. Failures surface as raw [`StoreError`] codes; classification is the caller's job.
//! 5. All I/O errors are propagated, never silently ignored.

pub mod error;
pub mod memory;
pub mod s3;
pub mod traits;

// Re-export primary types at crate root for ergonomic imports.
pub use error::{StoreError, StoreResult};
pub use memory::{InMemoryObjectStore, RequestStats};
pub use s3::{S3ObjectStore, S3Options};
pub use traits::{
    GetObject, ListPage, MultipartUpload, ObjectMeta, ObjectStore, SignedMethod, MAX_DELETE_BATCH,
};
