use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::StoreResult;

/// Batch deletes are capped at this many keys per request.
pub const MAX_DELETE_BATCH: usize = 1000;

/// Metadata returned by an existence check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// One page of a prefix listing.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    /// Keys on this page, in lexicographic order.
    pub keys: Vec<String>,
    /// Token for the next page; `None` once the listing is exhausted.
    pub next_token: Option<String>,
}

/// A streaming object body.
pub struct GetObject {
    /// Value of the `Content-Length` response header.
    pub content_length: u64,
    pub body: BoxStream<'static, StoreResult<Bytes>>,
}

impl fmt::Debug for GetObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetObject")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// HTTP method a pre-signed URL is valid for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignedMethod {
    Get,
    Put,
}

/// An open multipart upload session.
///
/// Parts become visible only after [`complete`](MultipartUpload::complete).
/// An aborted session leaves nothing behind at the target key.
#[async_trait]
pub trait MultipartUpload: Send {
    /// Upload the next part. Parts are committed in call order.
    async fn upload_part(&mut self, part: Bytes) -> StoreResult<()>;

    /// Commit all uploaded parts as a single object.
    async fn complete(&mut self) -> StoreResult<()>;

    /// Discard the session and every uploaded part.
    async fn abort(&mut self) -> StoreResult<()>;
}

/// Bucket-scoped object storage capability.
///
/// All keys are full object keys within the configured bucket. Implementations
/// must be `Send + Sync`; every method is a suspension point and none of them
/// retries internally beyond what the underlying client already does.
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Write an object, overwriting any existing one.
    async fn put(&self, key: &str, body: Bytes) -> StoreResult<()>;

    /// Write an object only if the key does not exist yet.
    ///
    /// Fails with [`StoreError::PreconditionFailed`](crate::StoreError) when
    /// it does. Backends without a conditional write primitive return
    /// `NotImplemented`; check [`supports_conditional_put`](Self::supports_conditional_put).
    async fn put_if_absent(&self, key: &str, body: Bytes) -> StoreResult<()>;

    /// Whether [`put_if_absent`](Self::put_if_absent) is atomic on this backend.
    fn supports_conditional_put(&self) -> bool {
        false
    }

    /// Open a streaming read of an object.
    async fn get(&self, key: &str) -> StoreResult<GetObject>;

    /// Check for an object without fetching its body.
    async fn head(&self, key: &str) -> StoreResult<ObjectMeta>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Delete up to [`max_delete_batch`](Self::max_delete_batch) keys in one request.
    async fn delete_batch(&self, keys: &[String]) -> StoreResult<()>;

    /// Maximum number of keys accepted by [`delete_batch`](Self::delete_batch).
    fn max_delete_batch(&self) -> usize {
        MAX_DELETE_BATCH
    }

    /// List one page of keys starting with `prefix`.
    ///
    /// Pass the previous page's `next_token` to continue.
    async fn list_page(&self, prefix: &str, token: Option<&str>) -> StoreResult<ListPage>;

    /// Start a multipart upload targeting `key`.
    async fn create_multipart(&self, key: &str) -> StoreResult<Box<dyn MultipartUpload>>;

    /// Pre-sign a URL for direct access to `key`.
    async fn signed_url(
        &self,
        method: SignedMethod,
        key: &str,
        expires_in: Duration,
    ) -> StoreResult<String>;

    /// Read an entire object into memory.
    async fn get_bytes(&self, key: &str) -> StoreResult<Bytes> {
        use futures::TryStreamExt;

        let object = self.get(key).await?;
        let chunks: Vec<Bytes> = object.body.try_collect().await?;
        Ok(match chunks.len() {
            1 => chunks.into_iter().next().unwrap_or_default(),
            _ => Bytes::from(chunks.concat()),
        })
    }
}
