//! Streaming tarball handles.
//!
//! Both handles are returned synchronously and do their remote work on a
//! spawned Tokio task. Callers observe progress through the handle's state
//! and await the outcome; failures surface as [`RegistryError`](crate::RegistryError)
//! values already mapped to the host taxonomy.

mod reader;
mod writer;

pub use reader::{ReadState, TarballReader};
pub use writer::{TarballWriter, WriteState};
