/// Errors from object store operations.
///
/// These mirror the failure codes an S3-compatible service reports. They are
/// deliberately raw: the registry adapter classifies them into its own
/// taxonomy, and anything it does not recognise is passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The requested key does not exist.
    #[error("the specified key does not exist: {key}")]
    NoSuchKey { key: String },

    /// A conditional write lost: the key already exists.
    #[error("precondition failed for {key}")]
    PreconditionFailed { key: String },

    /// The in-flight request was cancelled before it completed.
    #[error("request aborted")]
    RequestAborted,

    /// The service is throttling or temporarily unavailable.
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String },

    /// The backend does not implement this operation.
    #[error("operation not implemented by this backend: {operation}")]
    NotImplemented { operation: &'static str },

    /// The key cannot be represented by the backend.
    #[error("invalid key {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// The multipart session was already completed or aborted.
    #[error("multipart upload for {key} is no longer active")]
    UploadClosed { key: String },

    /// Any other backend failure, with the backend's message preserved.
    #[error("{message}")]
    Backend { message: String },
}

impl StoreError {
    /// Wire-level error code, as the service would report it.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSuchKey { .. } => "NoSuchKey",
            Self::PreconditionFailed { .. } => "PreconditionFailed",
            Self::RequestAborted => "RequestAbortedError",
            Self::ServiceUnavailable { .. } => "ServiceUnavailable",
            Self::NotImplemented { .. } => "NotImplemented",
            Self::InvalidKey { .. } => "InvalidKey",
            Self::UploadClosed { .. } => "NoSuchUpload",
            Self::Backend { .. } => "InternalError",
        }
    }

    pub(crate) fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
