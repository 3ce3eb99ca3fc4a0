use std::future::Future;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use regstore_store::{MultipartUpload, ObjectStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{classify, RegistryError, RegistryResult};

/// Chunks buffered between the handle and the upload task.
const CHANNEL_DEPTH: usize = 16;

/// Lifecycle of a tarball upload.
#[derive(Clone, Debug)]
pub enum WriteState {
    /// Created, nothing sent yet.
    Idle,
    /// Checking that the target key is free.
    Opening,
    /// Accepting bytes.
    Streaming,
    /// All bytes received; committing the object.
    Committing,
    Succeeded,
    Failed(RegistryError),
    Aborted,
}

impl WriteState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Aborted)
    }

    fn into_result(self) -> RegistryResult<()> {
        match self {
            Self::Succeeded => Ok(()),
            Self::Failed(err) => Err(err),
            Self::Aborted => Err(RegistryError::unavailable("tarball upload aborted")),
            _ => Err(task_gone()),
        }
    }
}

fn task_gone() -> RegistryError {
    RegistryError::unavailable("tarball upload task terminated")
}

/// Caller intent, as seen by the upload task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Signal {
    Pending,
    Commit,
    Abort,
}

/// Why the upload task stopped early.
enum Stop {
    Aborted,
    Failed(RegistryError),
}

impl From<RegistryError> for Stop {
    fn from(err: RegistryError) -> Self {
        Self::Failed(err)
    }
}

/// Streaming write handle for one tarball.
///
/// Returned before any remote call completes. Bytes written through
/// [`write`](Self::write) are buffered into parts and uploaded by a background
/// task; the object is committed once the stream has been [`end`](Self::end)ed
/// and [`done`](Self::done) has been called, in either order. Dropping the
/// handle before both have happened aborts the upload; a stream cut short is
/// never committed.
///
/// Must be created inside a Tokio runtime.
#[derive(Debug)]
pub struct TarballWriter {
    key: String,
    chunks: Option<mpsc::Sender<Bytes>>,
    signal: watch::Sender<Signal>,
    state: watch::Receiver<WriteState>,
    task: Option<JoinHandle<()>>,
}

impl TarballWriter {
    pub(crate) fn spawn(
        store: Arc<dyn ObjectStore>,
        key: String,
        part_size: usize,
    ) -> Self {
        let (chunk_tx, chunk_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (signal_tx, signal_rx) = watch::channel(Signal::Pending);
        let (state_tx, state_rx) = watch::channel(WriteState::Idle);

        let conditional = store.supports_conditional_put();
        let task = UploadTask {
            store,
            key: key.clone(),
            part_size: part_size.max(1),
            conditional,
            checked: false,
            delete_on_abort: false,
            chunks: chunk_rx,
            signal: signal_rx,
            state: state_tx,
            session: None,
        };

        Self {
            key,
            chunks: Some(chunk_tx),
            signal: signal_tx,
            state: state_rx,
            task: Some(tokio::spawn(task.run())),
        }
    }

    /// Full object key being written.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state of the upload.
    pub fn state(&self) -> WriteState {
        self.state.borrow().clone()
    }

    /// Wait until the upload accepts bytes, or report why it never will.
    pub async fn opened(&self) -> RegistryResult<()> {
        let mut state = self.state.clone();
        let reached = match state
            .wait_for(|s| !matches!(s, WriteState::Idle | WriteState::Opening))
            .await
        {
            Ok(s) => s.clone(),
            Err(_) => return Err(task_gone()),
        };
        match reached {
            WriteState::Failed(err) => Err(err),
            WriteState::Aborted => WriteState::Aborted.into_result(),
            _ => Ok(()),
        }
    }

    /// Queue a chunk for upload.
    ///
    /// Fails with the upload's error once it has failed, for example with
    /// `Conflict` when the tarball already exists.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> RegistryResult<()> {
        let Some(tx) = self.chunks.as_ref() else {
            return Err(RegistryError::StreamEnded);
        };
        if let WriteState::Failed(err) = &*self.state.borrow() {
            return Err(err.clone());
        }
        if tx.send(chunk.into()).await.is_err() {
            // The task stopped reading; its final state says why.
            return match self.completion().await {
                Ok(()) => Err(RegistryError::StreamEnded),
                Err(err) => Err(err),
            };
        }
        Ok(())
    }

    /// Signal end of stream. Further writes fail with `StreamEnded`.
    pub fn end(&mut self) {
        self.chunks.take();
    }

    /// Request the commit and return a future that resolves once the object
    /// is stored.
    ///
    /// Safe to call before or after [`end`](Self::end); the commit waits for
    /// both. The returned future owns what it needs and outlives the handle.
    pub fn done(&self) -> impl Future<Output = RegistryResult<()>> + Send + 'static {
        self.signal.send_if_modified(|s| {
            if *s == Signal::Pending {
                *s = Signal::Commit;
                true
            } else {
                false
            }
        });
        self.completion()
    }

    /// End the stream, commit, and wait for the result.
    pub async fn finish(mut self) -> RegistryResult<()> {
        self.end();
        self.done().await
    }

    /// Cancel the upload and wait for cleanup.
    ///
    /// In-flight multipart sessions are aborted. An object this upload may
    /// have written is deleted on a best-effort basis; a create-if-absent
    /// runs to completion first, so an object that already existed is never
    /// touched. A no-op once the upload has succeeded.
    pub async fn abort(mut self) {
        // Signal first so a closed channel is never read as end of stream.
        self.signal.send_if_modified(|s| {
            if *s == Signal::Abort {
                false
            } else {
                *s = Signal::Abort;
                true
            }
        });
        self.chunks.take();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn completion(&self) -> impl Future<Output = RegistryResult<()>> + Send + 'static {
        let mut state = self.state.clone();
        async move {
            let terminal = match state.wait_for(WriteState::is_terminal).await {
                Ok(s) => s.clone(),
                Err(_) => return Err(task_gone()),
            };
            terminal.into_result()
        }
    }
}

impl Drop for TarballWriter {
    fn drop(&mut self) {
        // Runs before `chunks` is dropped, so the task sees the abort no later
        // than the closed channel.
        let ended = self.chunks.is_none();
        self.signal.send_if_modified(|s| {
            let keep = *s == Signal::Abort || (*s == Signal::Commit && ended);
            if !keep {
                *s = Signal::Abort;
            }
            !keep
        });
    }
}

/// Background half of a [`TarballWriter`].
struct UploadTask {
    store: Arc<dyn ObjectStore>,
    key: String,
    part_size: usize,
    /// Commit single-part uploads with an atomic create-if-absent.
    conditional: bool,
    checked: bool,
    /// The key may hold bytes written by this upload.
    delete_on_abort: bool,
    chunks: mpsc::Receiver<Bytes>,
    signal: watch::Receiver<Signal>,
    state: watch::Sender<WriteState>,
    session: Option<Box<dyn MultipartUpload>>,
}

impl UploadTask {
    async fn run(mut self) {
        let outcome = self.drive().await;
        let terminal = match outcome {
            Ok(()) => {
                debug!(key = %self.key, "tarball committed");
                WriteState::Succeeded
            }
            Err(Stop::Aborted) => {
                debug!(key = %self.key, "tarball upload aborted");
                self.cleanup(true).await;
                WriteState::Aborted
            }
            Err(Stop::Failed(err)) => {
                debug!(key = %self.key, error = %err, "tarball upload failed");
                self.cleanup(false).await;
                WriteState::Failed(err)
            }
        };
        self.state.send_replace(terminal);
    }

    async fn drive(&mut self) -> Result<(), Stop> {
        self.state.send_replace(WriteState::Opening);
        if !self.conditional {
            self.check_absent().await?;
        }
        self.state.send_replace(WriteState::Streaming);
        debug!(key = %self.key, "tarball upload open");

        let mut buffer = BytesMut::new();
        while let Some(chunk) = until_abort(&mut self.signal, self.chunks.recv()).await? {
            buffer.extend_from_slice(&chunk);
            while buffer.len() >= self.part_size {
                let part = buffer.split_to(self.part_size).freeze();
                self.upload_part(part).await?;
            }
        }

        self.await_commit().await?;
        self.state.send_replace(WriteState::Committing);
        self.commit(buffer.freeze()).await
    }

    /// Existence check: a missing key is the only outcome that allows the upload.
    async fn check_absent(&mut self) -> Result<(), Stop> {
        let found = until_abort(&mut self.signal, self.store.head(&self.key)).await?;
        self.checked = true;
        match found.map_err(classify) {
            Ok(_) => Err(Stop::Failed(RegistryError::conflict(self.key.as_str()))),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(Stop::Failed(err)),
        }
    }

    async fn upload_part(&mut self, part: Bytes) -> Result<(), Stop> {
        if self.session.is_none() {
            // Multipart sessions cannot be conditional; check even when
            // single-part commits would not need it.
            if !self.checked {
                self.check_absent().await?;
            }
            let session = until_abort(&mut self.signal, self.store.create_multipart(&self.key))
                .await?
                .map_err(classify)?;
            self.session = Some(session);
        }
        if let Some(session) = self.session.as_mut() {
            until_abort(&mut self.signal, session.upload_part(part))
                .await?
                .map_err(classify)?;
        }
        Ok(())
    }

    /// Wait for `done`, which may already have been requested.
    async fn await_commit(&mut self) -> Result<(), Stop> {
        let requested = match self.signal.wait_for(|s| *s != Signal::Pending).await {
            Ok(s) => Some(*s),
            Err(_) => None,
        };
        // Handle dropped: the last value it sent decides.
        let requested = requested.unwrap_or_else(|| *self.signal.borrow());
        match requested {
            Signal::Commit => Ok(()),
            Signal::Pending | Signal::Abort => Err(Stop::Aborted),
        }
    }

    async fn commit(&mut self, rest: Bytes) -> Result<(), Stop> {
        match self.session.as_mut() {
            None if self.conditional => {
                // Not raced against abort: the key is ours only once the
                // create has returned.
                self.store
                    .put_if_absent(&self.key, rest)
                    .await
                    .map_err(classify)?;
                if *self.signal.borrow() == Signal::Abort {
                    self.delete_on_abort = true;
                    return Err(Stop::Aborted);
                }
            }
            None => {
                self.delete_on_abort = true;
                until_abort(&mut self.signal, self.store.put(&self.key, rest))
                    .await?
                    .map_err(classify)?;
            }
            Some(session) => {
                if !rest.is_empty() {
                    until_abort(&mut self.signal, session.upload_part(rest))
                        .await?
                        .map_err(classify)?;
                }
                self.delete_on_abort = true;
                until_abort(&mut self.signal, session.complete())
                    .await?
                    .map_err(classify)?;
                self.session = None;
            }
        }
        Ok(())
    }

    /// Best-effort release of remote resources; failures are logged only.
    async fn cleanup(&mut self, aborted: bool) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.abort().await {
                warn!(key = %self.key, error = %err, "failed to abort multipart upload");
            }
        }
        if aborted && self.delete_on_abort {
            if let Err(err) = self.store.delete(&self.key).await {
                warn!(key = %self.key, error = %err, "failed to delete aborted tarball");
            }
        }
    }
}

/// Run `fut` unless the caller aborts first.
async fn until_abort<F: Future>(
    signal: &mut watch::Receiver<Signal>,
    fut: F,
) -> Result<F::Output, Stop> {
    tokio::select! {
        biased;
        _ = wait_abort(signal) => Err(Stop::Aborted),
        out = fut => Ok(out),
    }
}

async fn wait_abort(signal: &mut watch::Receiver<Signal>) {
    if signal.wait_for(|s| *s == Signal::Abort).await.is_err() {
        // Handle gone without an abort; the chunk channel decides.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{FaultyStore, Op};
    use regstore_store::{InMemoryObjectStore, StoreError};
    use std::time::Duration;

    const KEY: &str = "npm/left-pad/left-pad-1.3.0.tgz";

    fn writer(store: &InMemoryObjectStore, part_size: usize) -> TarballWriter {
        TarballWriter::spawn(Arc::new(store.clone()), KEY.to_string(), part_size)
    }

    /// Complete `w` and abort it while the commit call is held open by `store`.
    async fn abort_while_committing(mut w: TarballWriter) -> RegistryResult<()> {
        let mut state = w.state.clone();
        w.end();
        let completion = w.done();
        state
            .wait_for(|s| matches!(s, WriteState::Committing))
            .await
            .unwrap();
        // let the commit reach the inner store
        tokio::time::sleep(Duration::from_millis(20)).await;
        w.abort().await;
        completion.await
    }

    #[tokio::test]
    async fn small_tarball_single_put() {
        let store = InMemoryObjectStore::new();
        let mut w = writer(&store, 1024);
        w.opened().await.unwrap();
        w.write(&b"hello "[..]).await.unwrap();
        w.write(&b"world"[..]).await.unwrap();
        w.finish().await.unwrap();

        assert_eq!(store.object(KEY).unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(store.stats().multipart, 0);
    }

    #[tokio::test]
    async fn large_tarball_uses_multipart() {
        let store = InMemoryObjectStore::new();
        let mut w = writer(&store, 4);
        for chunk in ["abc", "defgh", "ijklmnop", "q"] {
            w.write(chunk.as_bytes().to_vec()).await.unwrap();
        }
        w.finish().await.unwrap();

        assert_eq!(
            store.object(KEY).unwrap(),
            Bytes::from_static(b"abcdefghijklmnopq")
        );
        assert_eq!(store.stats().multipart, 1);
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn done_before_end_composes() {
        let store = InMemoryObjectStore::new();
        let mut w = writer(&store, 1024);
        let completion = w.done();
        w.write(&b"payload"[..]).await.unwrap();
        assert!(store.object(KEY).is_none());
        w.end();
        completion.await.unwrap();
        assert!(matches!(w.state(), WriteState::Succeeded));
        assert_eq!(store.object(KEY).unwrap(), Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn end_before_done_waits_for_done() {
        let store = InMemoryObjectStore::new();
        let mut w = writer(&store, 1024);
        w.write(&b"payload"[..]).await.unwrap();
        w.end();
        tokio::task::yield_now().await;
        assert!(store.object(KEY).is_none());
        w.done().await.unwrap();
        assert_eq!(store.object(KEY).unwrap(), Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn write_after_end_is_rejected() {
        let store = InMemoryObjectStore::new();
        let mut w = writer(&store, 1024);
        w.end();
        assert!(matches!(
            w.write(&b"late"[..]).await,
            Err(RegistryError::StreamEnded)
        ));
    }

    #[tokio::test]
    async fn existing_tarball_conflicts() {
        let inner = InMemoryObjectStore::new();
        inner.put(KEY, Bytes::from_static(b"original")).await.unwrap();
        // no conditional put: the existence check runs up front
        let store = FaultyStore::new(inner.clone());
        let mut w = TarballWriter::spawn(Arc::new(store), KEY.to_string(), 1024);

        let err = w.opened().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(w.write(&b"new bytes"[..]).await.unwrap_err().is_conflict());
        assert!(w.finish().await.unwrap_err().is_conflict());
        assert_eq!(inner.object(KEY).unwrap(), Bytes::from_static(b"original"));
    }

    #[tokio::test]
    async fn conditional_put_conflicts_at_commit() {
        let store = InMemoryObjectStore::new();
        store.put(KEY, Bytes::from_static(b"original")).await.unwrap();
        let mut w = writer(&store, 1024);
        w.opened().await.unwrap();
        w.write(&b"new"[..]).await.unwrap();
        let err = w.finish().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.stats().head, 0);
        assert_eq!(store.object(KEY).unwrap(), Bytes::from_static(b"original"));
    }

    #[tokio::test]
    async fn conditional_store_checks_before_multipart() {
        let store = InMemoryObjectStore::new();
        store.put(KEY, Bytes::from_static(b"original")).await.unwrap();
        let mut w = writer(&store, 2);
        w.write(&b"0123456789"[..]).await.unwrap_or(());
        let err = w.finish().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.stats().multipart, 0);
        assert_eq!(store.object(KEY).unwrap(), Bytes::from_static(b"original"));
    }

    #[tokio::test]
    async fn existence_check_failure_propagates() {
        let inner = InMemoryObjectStore::new();
        let store = FaultyStore::new(inner.clone());
        store.fail_next(Op::Head, StoreError::ServiceUnavailable {
            message: "SlowDown".into(),
        });
        let w = TarballWriter::spawn(Arc::new(store), KEY.to_string(), 1024);
        let err = w.opened().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(matches!(w.state(), WriteState::Failed(_)));
    }

    #[tokio::test]
    async fn part_failure_aborts_session() {
        let inner = InMemoryObjectStore::new();
        let store = FaultyStore::new(inner.clone());
        store.fail_next(Op::Multipart, StoreError::Backend {
            message: "InternalError".into(),
        });
        let mut w = TarballWriter::spawn(Arc::new(store), KEY.to_string(), 2);
        let _ = w.write(&b"0123456789"[..]).await;
        let err = w.finish().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert!(inner.object(KEY).is_none());
        assert_eq!(inner.open_uploads(), 0);
    }

    #[tokio::test]
    async fn abort_mid_stream_leaves_nothing() {
        let store = InMemoryObjectStore::new();
        let mut w = writer(&store, 4);
        w.opened().await.unwrap();
        w.write(&b"0123456789"[..]).await.unwrap();
        let completion = w.done();
        w.abort().await;

        assert!(completion.await.is_err());
        assert!(store.object(KEY).is_none());
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn abort_reports_aborted_state() {
        let store = InMemoryObjectStore::new();
        let w = writer(&store, 1024);
        let mut state = w.state.clone();
        w.abort().await;
        let last = state.borrow_and_update().clone();
        assert!(matches!(last, WriteState::Aborted));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn abort_after_success_is_noop() {
        let store = InMemoryObjectStore::new();
        let mut w = writer(&store, 1024);
        w.write(&b"kept"[..]).await.unwrap();
        w.end();
        w.done().await.unwrap();
        w.abort().await;
        assert_eq!(store.object(KEY).unwrap(), Bytes::from_static(b"kept"));
    }

    #[tokio::test]
    async fn dropping_handle_aborts() {
        let store = InMemoryObjectStore::new();
        let mut w = writer(&store, 4);
        w.write(&b"0123456789"[..]).await.unwrap();
        let mut state = w.state.clone();
        drop(w);
        let last = state.wait_for(WriteState::is_terminal).await.unwrap().clone();
        assert!(matches!(last, WriteState::Aborted));
        assert!(store.object(KEY).is_none());
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn dropping_after_done_without_end_aborts() {
        let store = InMemoryObjectStore::new();
        let mut w = writer(&store, 1024);
        w.write(&b"trunc"[..]).await.unwrap();
        let completion = w.done();
        drop(w);
        assert!(completion.await.is_err());
        assert!(store.object(KEY).is_none());
        assert_eq!(store.stats().put, 0);
    }

    #[tokio::test]
    async fn dropping_after_done_and_end_commits() {
        let store = InMemoryObjectStore::new();
        let mut w = writer(&store, 1024);
        w.write(&b"whole"[..]).await.unwrap();
        w.end();
        let completion = w.done();
        drop(w);
        completion.await.unwrap();
        assert_eq!(store.object(KEY).unwrap(), Bytes::from_static(b"whole"));
    }

    #[tokio::test]
    async fn abort_during_conditional_put_keeps_existing_object() {
        let inner = InMemoryObjectStore::new();
        inner.put(KEY, Bytes::from_static(b"original")).await.unwrap();
        let store = FaultyStore::conditional(inner.clone());
        store.stall(Op::Put, Duration::from_millis(100));
        let mut w = TarballWriter::spawn(Arc::new(store), KEY.to_string(), 1024);
        w.write(&b"new"[..]).await.unwrap();

        assert!(abort_while_committing(w).await.is_err());
        assert_eq!(inner.object(KEY).unwrap(), Bytes::from_static(b"original"));
        assert_eq!(inner.stats().delete, 0);
    }

    #[tokio::test]
    async fn abort_during_conditional_put_removes_created_object() {
        let inner = InMemoryObjectStore::new();
        let store = FaultyStore::conditional(inner.clone());
        store.stall(Op::Put, Duration::from_millis(100));
        let mut w = TarballWriter::spawn(Arc::new(store), KEY.to_string(), 1024);
        w.write(&b"new"[..]).await.unwrap();

        assert!(abort_while_committing(w).await.is_err());
        assert!(inner.object(KEY).is_none());
        assert_eq!(inner.stats().delete, 1);
    }

    #[tokio::test]
    async fn abort_during_plain_put_removes_object() {
        let inner = InMemoryObjectStore::new();
        let store = FaultyStore::new(inner.clone());
        store.stall(Op::Put, Duration::from_millis(100));
        let mut w = TarballWriter::spawn(Arc::new(store), KEY.to_string(), 1024);
        w.write(&b"new"[..]).await.unwrap();

        assert!(abort_while_committing(w).await.is_err());
        assert!(inner.object(KEY).is_none());
        assert_eq!(inner.stats().delete, 1);
    }

    #[tokio::test]
    async fn abort_during_multipart_complete_removes_object() {
        let inner = InMemoryObjectStore::new();
        let store = FaultyStore::new(inner.clone());
        store.stall(Op::Complete, Duration::from_millis(100));
        let mut w = TarballWriter::spawn(Arc::new(store), KEY.to_string(), 4);
        w.write(&b"0123456789"[..]).await.unwrap();

        assert!(abort_while_committing(w).await.is_err());
        assert!(inner.object(KEY).is_none());
        assert_eq!(inner.stats().delete, 1);
        assert_eq!(inner.open_uploads(), 0);
    }

    #[tokio::test]
    async fn empty_tarball_is_stored() {
        let store = InMemoryObjectStore::new();
        let w = writer(&store, 1024);
        w.finish().await.unwrap();
        assert_eq!(store.object(KEY).unwrap().len(), 0);
    }
}
