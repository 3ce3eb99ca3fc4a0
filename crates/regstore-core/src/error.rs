//! Error taxonomy for registry storage operations.
//!
//! Every failure the adapter reports falls into one of four kinds. Raw
//! object-store failures are translated in exactly one place, [`classify`],
//! so the index, the package stores and the tarball handles all report the
//! same thing for the same underlying condition.

use std::sync::Arc;

use regstore_store::StoreError;
use thiserror::Error;

/// The closed set of failure kinds the registry host distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The package or file does not exist.
    NotFound,
    /// The target already exists and will not be overwritten.
    Conflict,
    /// Transient failure; the request may succeed later.
    Unavailable,
    /// Anything else, carried through unchanged.
    Unknown,
}

/// Errors from registry storage operations.
#[derive(Clone, Debug, Error)]
pub enum RegistryError {
    /// The requested object does not exist.
    #[error("no such package available: {key}")]
    NotFound { key: String },

    /// The object already exists.
    #[error("already exists: {key}")]
    Conflict { key: String },

    /// The store could not serve the request right now.
    #[error("resource temporarily unavailable: {message}")]
    Unavailable { message: String },

    /// An object-store failure with no registry-level meaning.
    #[error(transparent)]
    Store(StoreError),

    /// A stored document is not valid JSON.
    #[error("invalid JSON document at {key}: {source}")]
    InvalidDocument {
        key: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// A caller-supplied metadata transform rejected the document.
    #[error("metadata update rejected: {0}")]
    UpdateRejected(String),

    /// The storage configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Bytes were written after the tarball stream was ended.
    #[error("write after end of tarball stream")]
    StreamEnded,
}

impl RegistryError {
    /// Which taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::Store(_)
            | Self::InvalidDocument { .. }
            | Self::UpdateRejected(_)
            | Self::Config(_)
            | Self::StreamEnded => ErrorKind::Unknown,
        }
    }

    /// HTTP status the registry host should answer with.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Unavailable => 503,
            ErrorKind::Unknown => 500,
        }
    }

    /// Registry-host error code.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotFound => "ENOENT",
            ErrorKind::Conflict => "EEXISTS",
            ErrorKind::Unavailable => "EAGAIN",
            ErrorKind::Unknown => "EUNKNOWN",
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub(crate) fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_document(key: impl Into<String>, source: serde_json::Error) -> Self {
        Self::InvalidDocument {
            key: key.into(),
            source: Arc::new(source),
        }
    }
}

/// Translate a raw object-store failure into the registry taxonomy.
///
/// Unrecognised codes are returned unchanged inside [`RegistryError::Store`].
pub fn classify(err: StoreError) -> RegistryError {
    match err {
        StoreError::NoSuchKey { key } => RegistryError::NotFound { key },
        StoreError::PreconditionFailed { key } => RegistryError::Conflict { key },
        StoreError::RequestAborted => RegistryError::unavailable("request aborted"),
        StoreError::ServiceUnavailable { message } => RegistryError::Unavailable { message },
        other => RegistryError::Store(other),
    }
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        classify(err)
    }
}

/// Result alias for registry storage operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
