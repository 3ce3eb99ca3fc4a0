//! Failure injection for adapter tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use regstore_store::{
    GetObject, InMemoryObjectStore, ListPage, MultipartUpload, ObjectMeta, ObjectStore,
    SignedMethod, StoreError, StoreResult,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Put,
    Get,
    Head,
    Delete,
    DeleteBatch,
    List,
    Multipart,
    /// `MultipartUpload::complete` on a session opened through the wrapper.
    Complete,
}

#[derive(Default)]
struct Faults {
    /// Op -> (calls remaining before failing, error).
    pending: HashMap<Op, (usize, StoreError)>,
    delays: HashMap<Op, Duration>,
    stalls: HashMap<Op, Duration>,
}

impl std::fmt::Debug for Faults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Faults")
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Sleep for the configured delay, then fail if `op` is due to fail.
async fn before(faults: &Mutex<Faults>, op: Op) -> StoreResult<()> {
    let (delay, failure) = {
        let mut faults = faults.lock().expect("lock poisoned");
        let delay = faults.delays.get(&op).copied();
        let failure = match faults.pending.get_mut(&op) {
            Some((remaining, _)) if *remaining > 1 => {
                *remaining -= 1;
                None
            }
            Some(_) => faults.pending.remove(&op).map(|(_, err)| err),
            None => None,
        };
        (delay, failure)
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Sleep after `op` has already reached the inner store.
async fn after(faults: &Mutex<Faults>, op: Op) {
    let stall = faults.lock().expect("lock poisoned").stalls.get(&op).copied();
    if let Some(stall) = stall {
        tokio::time::sleep(stall).await;
    }
}

/// Wraps an [`InMemoryObjectStore`] and fails or delays chosen operations.
#[derive(Debug)]
pub struct FaultyStore {
    inner: InMemoryObjectStore,
    faults: Arc<Mutex<Faults>>,
    conditional: bool,
}

impl FaultyStore {
    /// A wrapper that hides the inner store's conditional put.
    pub fn new(inner: InMemoryObjectStore) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(Faults::default())),
            conditional: false,
        }
    }

    /// A wrapper that exposes the inner store's conditional put.
    pub fn conditional(inner: InMemoryObjectStore) -> Self {
        Self {
            conditional: true,
            ..Self::new(inner)
        }
    }

    /// Fail the next call of `op` with `err`.
    pub fn fail_next(&self, op: Op, err: StoreError) {
        self.fail_nth(op, 1, err);
    }

    /// Fail the `n`-th call (1-based) of `op` from now on with `err`.
    pub fn fail_nth(&self, op: Op, n: usize, err: StoreError) {
        let mut faults = self.faults.lock().expect("lock poisoned");
        faults.pending.insert(op, (n.max(1), err));
    }

    /// Sleep before every call of `op`.
    pub fn delay(&self, op: Op, by: Duration) {
        let mut faults = self.faults.lock().expect("lock poisoned");
        faults.delays.insert(op, by);
    }

    /// Sleep after every call of `op` has taken effect, before answering.
    ///
    /// Honoured for `Put` (both plain and conditional) and `Complete`.
    pub fn stall(&self, op: Op, by: Duration) {
        let mut faults = self.faults.lock().expect("lock poisoned");
        faults.stalls.insert(op, by);
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put(&self, key: &str, body: Bytes) -> StoreResult<()> {
        before(&self.faults, Op::Put).await?;
        let result = self.inner.put(key, body).await;
        after(&self.faults, Op::Put).await;
        result
    }

    async fn put_if_absent(&self, key: &str, body: Bytes) -> StoreResult<()> {
        before(&self.faults, Op::Put).await?;
        let result = self.inner.put_if_absent(key, body).await;
        after(&self.faults, Op::Put).await;
        result
    }

    fn supports_conditional_put(&self) -> bool {
        self.conditional
    }

    async fn get(&self, key: &str) -> StoreResult<GetObject> {
        before(&self.faults, Op::Get).await?;
        self.inner.get(key).await
    }

    async fn head(&self, key: &str) -> StoreResult<ObjectMeta> {
        before(&self.faults, Op::Head).await?;
        self.inner.head(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        before(&self.faults, Op::Delete).await?;
        self.inner.delete(key).await
    }

    async fn delete_batch(&self, keys: &[String]) -> StoreResult<()> {
        before(&self.faults, Op::DeleteBatch).await?;
        self.inner.delete_batch(keys).await
    }

    async fn list_page(&self, prefix: &str, token: Option<&str>) -> StoreResult<ListPage> {
        before(&self.faults, Op::List).await?;
        self.inner.list_page(prefix, token).await
    }

    async fn create_multipart(&self, key: &str) -> StoreResult<Box<dyn MultipartUpload>> {
        before(&self.faults, Op::Multipart).await?;
        let inner = self.inner.create_multipart(key).await?;
        Ok(Box::new(FaultyUpload {
            inner,
            faults: self.faults.clone(),
        }))
    }

    async fn signed_url(
        &self,
        method: SignedMethod,
        key: &str,
        expires_in: Duration,
    ) -> StoreResult<String> {
        self.inner.signed_url(method, key, expires_in).await
    }
}

struct FaultyUpload {
    inner: Box<dyn MultipartUpload>,
    faults: Arc<Mutex<Faults>>,
}

#[async_trait]
impl MultipartUpload for FaultyUpload {
    async fn upload_part(&mut self, part: Bytes) -> StoreResult<()> {
        self.inner.upload_part(part).await
    }

    async fn complete(&mut self) -> StoreResult<()> {
        before(&self.faults, Op::Complete).await?;
        let result = self.inner.complete().await;
        after(&self.faults, Op::Complete).await;
        result
    }

    async fn abort(&mut self) -> StoreResult<()> {
        self.inner.abort().await
    }
}
