use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};

use crate::error::{StoreError, StoreResult};
use crate::traits::{
    GetObject, ListPage, MultipartUpload, ObjectMeta, ObjectStore, SignedMethod, MAX_DELETE_BATCH,
};

/// Default number of keys returned per listing page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Default size of the chunks a streaming read yields.
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

/// Per-operation request counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestStats {
    pub put: u64,
    pub get: u64,
    pub head: u64,
    pub delete: u64,
    pub delete_batch: u64,
    pub list: u64,
    pub multipart: u64,
}

#[derive(Default)]
struct Counters {
    put: AtomicU64,
    get: AtomicU64,
    head: AtomicU64,
    delete: AtomicU64,
    delete_batch: AtomicU64,
    list: AtomicU64,
    multipart: AtomicU64,
}

struct Inner {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    page_size: usize,
    read_chunk: usize,
    open_uploads: AtomicUsize,
    counters: Counters,
}

impl Inner {
    fn insert(&self, key: &str, data: Bytes) {
        let mut map = self.objects.write().expect("lock poisoned");
        map.insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: Utc::now(),
            },
        );
    }
}

/// In-memory, `BTreeMap`-based object store.
///
/// Intended for tests and embedding. Behaves like a bucket: listings are
/// paged, batch deletes are capped, multipart uploads stay invisible until
/// completed, and `put_if_absent` is atomic. Cloning yields another handle
/// to the same bucket.
#[derive(Clone)]
pub struct InMemoryObjectStore {
    inner: Arc<Inner>,
}

impl InMemoryObjectStore {
    /// Create a new empty store with the default page size.
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Create a new empty store returning at most `page_size` keys per listing page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                objects: RwLock::new(BTreeMap::new()),
                page_size: page_size.max(1),
                read_chunk: DEFAULT_READ_CHUNK,
                open_uploads: AtomicUsize::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.inner.objects.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.objects.read().expect("lock poisoned").is_empty()
    }

    /// Return a sorted list of all keys in the store.
    pub fn keys(&self) -> Vec<String> {
        let map = self.inner.objects.read().expect("lock poisoned");
        map.keys().cloned().collect()
    }

    /// Number of keys starting with `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        let map = self.inner.objects.read().expect("lock poisoned");
        map.keys().filter(|k| k.starts_with(prefix)).count()
    }

    /// Raw object contents, bypassing request accounting.
    pub fn object(&self, key: &str) -> Option<Bytes> {
        let map = self.inner.objects.read().expect("lock poisoned");
        map.get(key).map(|obj| obj.data.clone())
    }

    /// Multipart sessions that were neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.inner.open_uploads.load(Ordering::SeqCst)
    }

    /// Snapshot of the request counters.
    pub fn stats(&self) -> RequestStats {
        let c = &self.inner.counters;
        RequestStats {
            put: c.put.load(Ordering::Relaxed),
            get: c.get.load(Ordering::Relaxed),
            head: c.head.load(Ordering::Relaxed),
            delete: c.delete.load(Ordering::Relaxed),
            delete_batch: c.delete_batch.load(Ordering::Relaxed),
            list: c.list.load(Ordering::Relaxed),
            multipart: c.multipart.load(Ordering::Relaxed),
        }
    }

    /// Remove all objects from the store.
    pub fn clear(&self) {
        self.inner.objects.write().expect("lock poisoned").clear();
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, body: Bytes) -> StoreResult<()> {
        self.inner.counters.put.fetch_add(1, Ordering::Relaxed);
        self.inner.insert(key, body);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, body: Bytes) -> StoreResult<()> {
        self.inner.counters.put.fetch_add(1, Ordering::Relaxed);
        let mut map = self.inner.objects.write().expect("lock poisoned");
        if map.contains_key(key) {
            return Err(StoreError::PreconditionFailed {
                key: key.to_string(),
            });
        }
        map.insert(
            key.to_string(),
            StoredObject {
                data: body,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    fn supports_conditional_put(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> StoreResult<GetObject> {
        self.inner.counters.get.fetch_add(1, Ordering::Relaxed);
        let data = {
            let map = self.inner.objects.read().expect("lock poisoned");
            map.get(key)
                .map(|obj| obj.data.clone())
                .ok_or_else(|| StoreError::NoSuchKey {
                    key: key.to_string(),
                })?
        };

        let chunk = self.inner.read_chunk;
        let content_length = data.len() as u64;
        let chunks: Vec<StoreResult<Bytes>> = (0..data.len())
            .step_by(chunk)
            .map(|start| Ok(data.slice(start..(start + chunk).min(data.len()))))
            .collect();

        Ok(GetObject {
            content_length,
            body: stream::iter(chunks).boxed(),
        })
    }

    async fn head(&self, key: &str) -> StoreResult<ObjectMeta> {
        self.inner.counters.head.fetch_add(1, Ordering::Relaxed);
        let map = self.inner.objects.read().expect("lock poisoned");
        map.get(key)
            .map(|obj| ObjectMeta {
                key: key.to_string(),
                size: obj.data.len() as u64,
                last_modified: obj.last_modified,
            })
            .ok_or_else(|| StoreError::NoSuchKey {
                key: key.to_string(),
            })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.counters.delete.fetch_add(1, Ordering::Relaxed);
        self.inner
            .objects
            .write()
            .expect("lock poisoned")
            .remove(key);
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> StoreResult<()> {
        self.inner.counters.delete_batch.fetch_add(1, Ordering::Relaxed);
        if keys.len() > MAX_DELETE_BATCH {
            return Err(StoreError::backend(format!(
                "batch delete accepts at most {MAX_DELETE_BATCH} keys, got {}",
                keys.len()
            )));
        }
        let mut map = self.inner.objects.write().expect("lock poisoned");
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    async fn list_page(&self, prefix: &str, token: Option<&str>) -> StoreResult<ListPage> {
        self.inner.counters.list.fetch_add(1, Ordering::Relaxed);
        let map = self.inner.objects.read().expect("lock poisoned");
        let start = match token {
            Some(after) => Bound::Excluded(after.to_string()),
            None => Bound::Included(prefix.to_string()),
        };

        let mut matching = map
            .range((start, Bound::Unbounded))
            .map(|(k, _)| k)
            .skip_while(|k| k.as_str() < prefix)
            .take_while(|k| k.starts_with(prefix));

        let keys: Vec<String> = matching
            .by_ref()
            .take(self.inner.page_size)
            .cloned()
            .collect();
        let next_token = match matching.next() {
            Some(_) => keys.last().cloned(),
            None => None,
        };
        Ok(ListPage { keys, next_token })
    }

    async fn create_multipart(&self, key: &str) -> StoreResult<Box<dyn MultipartUpload>> {
        self.inner.counters.multipart.fetch_add(1, Ordering::Relaxed);
        self.inner.open_uploads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryUpload {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            parts: Vec::new(),
            open: true,
        }))
    }

    async fn signed_url(
        &self,
        _method: SignedMethod,
        _key: &str,
        _expires_in: Duration,
    ) -> StoreResult<String> {
        Err(StoreError::NotImplemented {
            operation: "signed_url",
        })
    }
}

impl std::fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.len();
        f.debug_struct("InMemoryObjectStore")
            .field("object_count", &count)
            .field("page_size", &self.inner.page_size)
            .finish()
    }
}

/// Multipart session that buffers parts until completion.
struct MemoryUpload {
    inner: Arc<Inner>,
    key: String,
    parts: Vec<Bytes>,
    open: bool,
}

impl MemoryUpload {
    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.inner.open_uploads.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::UploadClosed {
                key: self.key.clone(),
            })
        }
    }
}

#[async_trait]
impl MultipartUpload for MemoryUpload {
    async fn upload_part(&mut self, part: Bytes) -> StoreResult<()> {
        self.ensure_open()?;
        self.parts.push(part);
        Ok(())
    }

    async fn complete(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        let data = Bytes::from(self.parts.concat());
        self.parts.clear();
        self.inner.insert(&self.key, data);
        self.close();
        Ok(())
    }

    async fn abort(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.parts.clear();
        self.close();
        Ok(())
    }
}

impl Drop for MemoryUpload {
    fn drop(&mut self) {
        self.close();
    }
}
