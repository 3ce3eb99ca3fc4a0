use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use regstore_store::ObjectStore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{classify, RegistryError, RegistryResult};

const CHANNEL_DEPTH: usize = 8;

/// Lifecycle of a tarball download.
#[derive(Clone, Debug)]
pub enum ReadState {
    /// Fetch issued, headers not seen yet.
    Opening,
    Streaming,
    Finished,
    Failed(RegistryError),
    Aborted,
}

/// Streaming read handle for one tarball.
///
/// The fetch starts as soon as the handle is created. [`open`](Self::open)
/// yields the content length once response headers arrive; body chunks are
/// pulled with [`next_chunk`](Self::next_chunk) or through
/// [`into_stream`](Self::into_stream).
#[derive(Debug)]
pub struct TarballReader {
    key: String,
    state: ReadState,
    head: Option<oneshot::Receiver<RegistryResult<u64>>>,
    content_length: Option<u64>,
    chunks: mpsc::Receiver<RegistryResult<Bytes>>,
    task: JoinHandle<()>,
}

impl TarballReader {
    pub(crate) fn spawn(store: Arc<dyn ObjectStore>, key: String) -> Self {
        let (head_tx, head_rx) = oneshot::channel();
        let (chunk_tx, chunk_rx) = mpsc::channel(CHANNEL_DEPTH);
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            let object = match store.get(&task_key).await {
                Ok(object) => object,
                Err(err) => {
                    let _ = head_tx.send(Err(classify(err)));
                    return;
                }
            };
            let _ = head_tx.send(Ok(object.content_length));
            debug!(key = %task_key, length = object.content_length, "tarball read open");

            let mut body = object.body;
            while let Some(item) = body.next().await {
                let failed = item.is_err();
                if chunk_tx.send(item.map_err(classify)).await.is_err() || failed {
                    break;
                }
            }
        });

        Self {
            key,
            state: ReadState::Opening,
            head: Some(head_rx),
            content_length: None,
            chunks: chunk_rx,
            task,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> &ReadState {
        &self.state
    }

    /// Content length, known once the handle has opened.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Wait for response headers and return the content length.
    ///
    /// A missing tarball fails with `NotFound`.
    pub async fn open(&mut self) -> RegistryResult<u64> {
        if let Some(length) = self.content_length {
            return Ok(length);
        }
        match &self.state {
            ReadState::Failed(err) => return Err(err.clone()),
            ReadState::Aborted => return Err(aborted()),
            _ => {}
        }
        let Some(head) = self.head.take() else {
            return Err(aborted());
        };
        match head.await {
            Ok(Ok(length)) => {
                self.content_length = Some(length);
                self.state = ReadState::Streaming;
                Ok(length)
            }
            Ok(Err(err)) => {
                self.state = ReadState::Failed(err.clone());
                Err(err)
            }
            Err(_) => {
                self.state = ReadState::Aborted;
                Err(aborted())
            }
        }
    }

    /// Next body chunk, or `None` at end of stream or after an abort.
    pub async fn next_chunk(&mut self) -> Option<RegistryResult<Bytes>> {
        if matches!(self.state, ReadState::Opening) {
            if let Err(err) = self.open().await {
                return Some(Err(err));
            }
        }
        if !matches!(self.state, ReadState::Streaming) {
            return None;
        }
        match self.chunks.recv().await {
            Some(Ok(chunk)) => Some(Ok(chunk)),
            Some(Err(err)) => {
                self.state = ReadState::Failed(err.clone());
                Some(Err(err))
            }
            None => {
                self.state = ReadState::Finished;
                None
            }
        }
    }

    /// Collect the whole tarball.
    pub async fn read_to_end(mut self) -> RegistryResult<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }

    pub fn into_stream(self) -> impl Stream<Item = RegistryResult<Bytes>> + Send {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next_chunk().await.map(|item| (item, reader))
        })
    }

    /// Cancel the fetch. Buffered chunks are discarded.
    pub fn abort(&mut self) {
        self.task.abort();
        self.chunks.close();
        self.head = None;
        if !matches!(self.state, ReadState::Finished | ReadState::Failed(_)) {
            self.state = ReadState::Aborted;
        }
    }
}

impl Drop for TarballReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn aborted() -> RegistryError {
    RegistryError::unavailable("tarball read aborted")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{FaultyStore, Op};
    use regstore_store::{InMemoryObjectStore, StoreError};

    const KEY: &str = "left-pad/left-pad-1.3.0.tgz";

    #[tokio::test]
    async fn reads_content_length_then_body() {
        let store = InMemoryObjectStore::new();
        let body = vec![7u8; 200_000];
        store.put(KEY, Bytes::from(body.clone())).await.unwrap();

        let mut reader = TarballReader::spawn(Arc::new(store), KEY.to_string());
        assert_eq!(reader.open().await.unwrap(), 200_000);
        assert_eq!(reader.content_length(), Some(200_000));
        assert_eq!(reader.read_to_end().await.unwrap(), Bytes::from(body));
    }

    #[tokio::test]
    async fn missing_tarball_is_not_found() {
        let store = InMemoryObjectStore::new();
        let mut reader = TarballReader::spawn(Arc::new(store), KEY.to_string());
        let err = reader.open().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.code(), "ENOENT");
        assert!(matches!(reader.state(), ReadState::Failed(_)));
        assert!(reader.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn next_chunk_opens_implicitly() {
        let store = InMemoryObjectStore::new();
        let mut reader = TarballReader::spawn(Arc::new(store), KEY.to_string());
        let first = reader.next_chunk().await.unwrap();
        assert!(first.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn stream_yields_all_chunks() {
        let store = InMemoryObjectStore::new();
        store.put(KEY, Bytes::from(vec![1u8; 150_000])).await.unwrap();
        let reader = TarballReader::spawn(Arc::new(store), KEY.to_string());
        let chunks: Vec<_> = reader.into_stream().collect().await;
        assert!(chunks.len() > 1);
        let total: usize = chunks.into_iter().map(|c| c.unwrap().len()).sum();
        assert_eq!(total, 150_000);
    }

    #[tokio::test]
    async fn abort_stops_delivery() {
        let store = InMemoryObjectStore::new();
        store.put(KEY, Bytes::from(vec![1u8; 500_000])).await.unwrap();
        let mut reader = TarballReader::spawn(Arc::new(store), KEY.to_string());
        reader.open().await.unwrap();
        assert!(reader.next_chunk().await.unwrap().is_ok());
        reader.abort();
        assert!(matches!(reader.state(), ReadState::Aborted));
        assert!(reader.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn transient_failure_is_unavailable() {
        let inner = InMemoryObjectStore::new();
        inner.put(KEY, Bytes::from_static(b"x")).await.unwrap();
        let store = FaultyStore::new(inner);
        store.fail_next(Op::Get, StoreError::RequestAborted);
        let mut reader = TarballReader::spawn(Arc::new(store), KEY.to_string());
        let err = reader.open().await.unwrap_err();
        assert_eq!(err.http_status(), 503);
        assert_eq!(err.code(), "EAGAIN");
    }
}
