//! S3-compatible object storage backend.
//!
//! [`S3ObjectStore`] implements [`ObjectStore`] on top of the `object_store`
//! crate, so it works against AWS S3, MinIO, Ceph and any other endpoint that
//! speaks the S3 API. Retries and connection pooling belong to the client.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3, AmazonS3Builder, S3ConditionalPut};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{ObjectStore as _, PutMode, PutOptions, PutPayload};
use tracing::{debug, instrument};

use crate::error::{StoreError, StoreResult};
use crate::traits::{
    GetObject, ListPage, MultipartUpload, ObjectMeta, ObjectStore, SignedMethod,
};

/// Connection settings for an S3-compatible bucket.
#[derive(Clone, Debug, Default)]
pub struct S3Options {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// Address the bucket as `endpoint/bucket` instead of `bucket.endpoint`.
    pub force_path_style: Option<bool>,
    /// Use `If-None-Match: *` for create-if-absent writes.
    pub conditional_put: bool,
    /// Keys per listing page.
    pub page_size: usize,
}

/// An [`ObjectStore`] backed by any S3-compatible object storage.
pub struct S3ObjectStore {
    store: AmazonS3,
    bucket: String,
    conditional_put: bool,
    page_size: usize,
}

impl S3ObjectStore {
    /// Build a client for `options.bucket`.
    ///
    /// Credentials come from the standard `AWS_*` environment variables.
    pub fn new(options: S3Options) -> StoreResult<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&options.bucket);

        if let Some(region) = &options.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &options.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let Some(path_style) = options.force_path_style {
            builder = builder.with_virtual_hosted_style_request(!path_style);
        }
        if options.conditional_put {
            builder = builder.with_conditional_put(S3ConditionalPut::ETagMatch);
        }

        let store = builder.build().map_err(|e| {
            StoreError::backend(format!(
                "failed to create S3 client for bucket {}: {e}",
                options.bucket
            ))
        })?;

        debug!(bucket = %options.bucket, "S3 object store initialised");

        Ok(Self {
            store,
            bucket: options.bucket,
            conditional_put: options.conditional_put,
            page_size: options.page_size.max(1),
        })
    }

    /// Name of the bucket this client targets.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Convert an object key into an `object_store` path.
///
/// Registry keys never contain empty segments, so parsing is lossless.
fn object_path(key: &str) -> StoreResult<ObjectPath> {
    ObjectPath::parse(key).map_err(|e| StoreError::InvalidKey {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Map an `object_store` failure onto the raw service error codes.
fn map_error(key: &str, err: object_store::Error) -> StoreError {
    match err {
        object_store::Error::NotFound { .. } => StoreError::NoSuchKey {
            key: key.to_string(),
        },
        object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. } => {
            StoreError::PreconditionFailed {
                key: key.to_string(),
            }
        }
        object_store::Error::NotImplemented => StoreError::NotImplemented {
            operation: "conditional put",
        },
        object_store::Error::InvalidPath { source } => StoreError::InvalidKey {
            key: key.to_string(),
            reason: source.to_string(),
        },
        object_store::Error::JoinError { .. } => StoreError::RequestAborted,
        other => {
            let message = other.to_string();
            if is_throttled(&message) {
                StoreError::ServiceUnavailable { message }
            } else {
                StoreError::Backend { message }
            }
        }
    }
}

fn is_throttled(message: &str) -> bool {
    ["SlowDown", "ServiceUnavailable", "503 Service Unavailable", "RequestTimeout"]
        .iter()
        .any(|needle| message.contains(needle))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body), fields(key = %key, size = body.len()))]
    async fn put(&self, key: &str, body: Bytes) -> StoreResult<()> {
        let path = object_path(key)?;
        self.store
            .put(&path, PutPayload::from(body))
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(())
    }

    #[instrument(skip(self, body), fields(key = %key, size = body.len()))]
    async fn put_if_absent(&self, key: &str, body: Bytes) -> StoreResult<()> {
        if !self.conditional_put {
            return Err(StoreError::NotImplemented {
                operation: "conditional put",
            });
        }
        let path = object_path(key)?;
        self.store
            .put_opts(&path, PutPayload::from(body), PutOptions::from(PutMode::Create))
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(())
    }

    fn supports_conditional_put(&self) -> bool {
        self.conditional_put
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &str) -> StoreResult<GetObject> {
        let path = object_path(key)?;
        let result = self.store.get(&path).await.map_err(|e| map_error(key, e))?;
        let content_length = result.meta.size as u64;
        let owned_key = key.to_string();
        let body = result
            .into_stream()
            .map_err(move |e| map_error(&owned_key, e))
            .boxed();
        Ok(GetObject {
            content_length,
            body,
        })
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn head(&self, key: &str) -> StoreResult<ObjectMeta> {
        let path = object_path(key)?;
        let meta = self.store.head(&path).await.map_err(|e| map_error(key, e))?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: meta.size as u64,
            last_modified: meta.last_modified,
        })
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = object_path(key)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_error(key, e)),
        }
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn delete_batch(&self, keys: &[String]) -> StoreResult<()> {
        let paths = keys
            .iter()
            .map(|k| object_path(k))
            .collect::<StoreResult<Vec<_>>>()?;
        let locations = stream::iter(paths.into_iter().map(Ok)).boxed();
        let mut results = self.store.delete_stream(locations);
        while let Some(result) = results.next().await {
            match result {
                Ok(_) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(map_error("<batch>", e)),
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn list_page(&self, prefix: &str, token: Option<&str>) -> StoreResult<ListPage> {
        let prefix_path = object_path(prefix.trim_end_matches('/'))?;
        let mut listing = match token {
            Some(after) => {
                let offset = object_path(after)?;
                self.store.list_with_offset(Some(&prefix_path), &offset)
            }
            None => self.store.list(Some(&prefix_path)),
        };

        let mut keys = Vec::with_capacity(self.page_size);
        let mut more = false;
        while let Some(meta) = listing
            .try_next()
            .await
            .map_err(|e| map_error(prefix, e))?
        {
            if keys.len() == self.page_size {
                more = true;
                break;
            }
            keys.push(meta.location.to_string());
        }
        // Listing order is not guaranteed by every S3-compatible service.
        keys.sort();

        let next_token = if more { keys.last().cloned() } else { None };
        Ok(ListPage { keys, next_token })
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn create_multipart(&self, key: &str) -> StoreResult<Box<dyn MultipartUpload>> {
        let path = object_path(key)?;
        let upload = self
            .store
            .put_multipart(&path)
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(Box::new(S3Upload {
            key: key.to_string(),
            upload,
        }))
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn signed_url(
        &self,
        method: SignedMethod,
        key: &str,
        expires_in: Duration,
    ) -> StoreResult<String> {
        let path = object_path(key)?;
        let method = match method {
            SignedMethod::Get => http::Method::GET,
            SignedMethod::Put => http::Method::PUT,
        };
        let url = self
            .store
            .signed_url(method, &path, expires_in)
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(url.to_string())
    }
}

impl fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("bucket", &self.bucket)
            .field("conditional_put", &self.conditional_put)
            .finish()
    }
}

struct S3Upload {
    key: String,
    upload: Box<dyn object_store::MultipartUpload>,
}

#[async_trait]
impl MultipartUpload for S3Upload {
    async fn upload_part(&mut self, part: Bytes) -> StoreResult<()> {
        self.upload
            .put_part(PutPayload::from(part))
            .await
            .map_err(|e| map_error(&self.key, e))
    }

    async fn complete(&mut self) -> StoreResult<()> {
        self.upload
            .complete()
            .await
            .map_err(|e| map_error(&self.key, e))?;
        Ok(())
    }

    async fn abort(&mut self) -> StoreResult<()> {
        self.upload
            .abort()
            .await
            .map_err(|e| map_error(&self.key, e))
    }
}
