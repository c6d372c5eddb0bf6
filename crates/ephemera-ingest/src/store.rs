//! Streaming store: copies an inbound byte stream to disk under a size ceiling.
//!
//! The payload is never buffered whole. A finite ceiling is checked twice: once
//! against the declared length before any file is created, and again against
//! the running byte count, which is authoritative since the declared length may
//! be missing or forged. Every abort path removes the partial file, including
//! the store future being dropped when a request is cancelled.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

/// Byte ceiling for one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeLimit {
    /// At most this many bytes.
    Limited(u64),
    /// No ceiling (premium tier).
    Unbounded,
}

impl SizeLimit {
    /// The ceiling in bytes, if any.
    pub fn ceiling(&self) -> Option<u64> {
        match self {
            SizeLimit::Limited(limit) => Some(*limit),
            SizeLimit::Unbounded => None,
        }
    }
}

/// Terminal state of a stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactState {
    /// Fully written and synced.
    Complete,
    /// Discarded; the file no longer exists.
    Aborted,
}

/// A file written by the streaming store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    /// Random token naming the file inside the storage directory.
    pub token: String,
    /// Absolute or root-relative path of the file.
    pub path: PathBuf,
    /// Bytes written.
    pub size: u64,
    /// Current state.
    pub state: ArtifactState,
}

impl StoredArtifact {
    /// Delete the file and mark the artifact aborted.
    pub async fn discard(&mut self) -> IngestResult<()> {
        discard(&self.path).await?;
        self.state = ArtifactState::Aborted;
        Ok(())
    }
}

/// Writes uploads into a storage directory, one file per upload.
#[derive(Debug, Clone)]
pub struct StreamingStore {
    root: PathBuf,
    chunk_size: usize,
}

impl StreamingStore {
    /// Create a store rooted at `root`, reading `chunk_size` bytes at a time.
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            root: root.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Storage directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a token resolves to.
    pub fn path_for(&self, token: &str) -> PathBuf {
        self.root.join(token)
    }

    /// Stream `reader` to a new file, enforcing `limit`.
    #[instrument(skip(self, reader), fields(root = %self.root.display()))]
    pub async fn store<R>(
        &self,
        reader: R,
        declared_length: Option<u64>,
        limit: SizeLimit,
    ) -> IngestResult<StoredArtifact>
    where
        R: AsyncRead + Unpin,
    {
        if let (Some(ceiling), Some(declared)) = (limit.ceiling(), declared_length) {
            if declared > ceiling {
                debug!(declared, ceiling, "declared length over limit");
                return Err(IngestError::PayloadTooLarge {
                    limit: ceiling,
                    observed: declared,
                });
            }
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let token = Uuid::new_v4().simple().to_string();
        let path = self.path_for(&token);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        let guard = PartialFile::new(path.clone());

        // The file handle is closed when copy_into returns, before the guard runs.
        let size = copy_into(file, reader, self.chunk_size, limit.ceiling()).await?;

        guard.commit();
        debug!(%token, size, "upload stored");
        Ok(StoredArtifact {
            token,
            path,
            size,
            state: ArtifactState::Complete,
        })
    }
}

async fn copy_into<R>(
    mut file: File,
    mut reader: R,
    chunk_size: usize,
    ceiling: Option<u64>,
) -> IngestResult<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    let mut written: u64 = 0;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if is_disconnect(&e) => {
                debug!(received = written, error = %e, "client aborted upload");
                return Err(IngestError::UploadAborted { received: written });
            }
            Err(e) => return Err(e.into()),
        };
        let total = written + n as u64;
        if let Some(limit) = ceiling {
            if total > limit {
                warn!(limit, observed = total, "stream exceeded size limit");
                return Err(IngestError::PayloadTooLarge {
                    limit,
                    observed: total,
                });
            }
        }
        file.write_all(&buf[..n]).await?;
        written = total;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

/// Removes its file on drop unless committed.
pub(crate) struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "partial upload removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove partial upload"),
        }
    }
}

/// Delete a stored file. A file that is already gone is not an error.
pub async fn discard(path: &Path) -> IngestResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "stored file discarded");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Adapt a chunked body stream (the shape HTTP bodies arrive in) into a reader.
pub fn reader_from_stream<S>(stream: S) -> StreamReader<S, Bytes>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    StreamReader::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::ReadBuf;

    fn files_in(dir: &Path) -> usize {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    struct FailingReader(io::ErrorKind);

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(self.0, "stream failed")))
        }
    }

    struct StalledReader;

    impl AsyncRead for StalledReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_overflow_is_rejected_and_removed() {
        let dir = TempDir::new().unwrap();
        let store = StreamingStore::new(dir.path(), 256);
        let data = vec![7u8; 1500];

        let err = store
            .store(&data[..], None, SizeLimit::Limited(1000))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::PayloadTooLarge { limit: 1000, .. }));
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_under_limit_without_declared_length() {
        let dir = TempDir::new().unwrap();
        let store = StreamingStore::new(dir.path(), 100);
        let data = vec![1u8; 999];

        let artifact = store
            .store(&data[..], None, SizeLimit::Limited(1000))
            .await
            .unwrap();

        assert_eq!(artifact.size, 999);
        assert_eq!(artifact.state, ArtifactState::Complete);
        assert_eq!(std::fs::read(&artifact.path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_exact_limit_is_accepted() {
        let dir = TempDir::new().unwrap();
        let store = StreamingStore::new(dir.path(), 64);
        let data = vec![2u8; 1000];
        let artifact = store
            .store(&data[..], Some(1000), SizeLimit::Limited(1000))
            .await
            .unwrap();
        assert_eq!(artifact.size, 1000);
    }

    #[tokio::test]
    async fn test_declared_length_rejected_before_disk() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("never-created");
        let store = StreamingStore::new(&root, 64);

        let err = store
            .store(&b"tiny"[..], Some(5000), SizeLimit::Limited(1000))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::PayloadTooLarge { observed: 5000, .. }));
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_forged_declared_length_still_caught() {
        let dir = TempDir::new().unwrap();
        let store = StreamingStore::new(dir.path(), 64);
        let data = vec![0u8; 2048];
        let err = store
            .store(&data[..], Some(10), SizeLimit::Limited(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::PayloadTooLarge { .. }));
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_unbounded_ignores_declared_length() {
        let dir = TempDir::new().unwrap();
        let store = StreamingStore::new(dir.path(), 64);
        let data = vec![3u8; 4096];
        let artifact = store
            .store(&data[..], Some(1), SizeLimit::Unbounded)
            .await
            .unwrap();
        assert_eq!(artifact.size, 4096);
    }

    #[tokio::test]
    async fn test_broken_pipe_is_client_abort() {
        let dir = TempDir::new().unwrap();
        let store = StreamingStore::new(dir.path(), 4);
        let reader = (&b"partial-data"[..]).chain(FailingReader(io::ErrorKind::BrokenPipe));

        let err = store
            .store(reader, None, SizeLimit::Limited(1000))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::UploadAborted { received: 12 }));
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_other_read_errors_propagate() {
        let dir = TempDir::new().unwrap();
        let store = StreamingStore::new(dir.path(), 4);
        let reader = (&b"abc"[..]).chain(FailingReader(io::ErrorKind::PermissionDenied));

        let err = store
            .store(reader, None, SizeLimit::Unbounded)
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Io(_)));
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_cancelled_store_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let store = StreamingStore::new(dir.path(), 4);
        let reader = (&b"some bytes"[..]).chain(StalledReader);

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            store.store(reader, None, SizeLimit::Unbounded),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_stream_adapter() {
        let dir = TempDir::new().unwrap();
        let store = StreamingStore::new(dir.path(), 8);
        let chunks = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let reader = reader_from_stream(futures::stream::iter(chunks));

        let artifact = store.store(reader, None, SizeLimit::Unbounded).await.unwrap();
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_discard_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = StreamingStore::new(dir.path(), 8);
        let mut artifact = store
            .store(&b"bye"[..], None, SizeLimit::Unbounded)
            .await
            .unwrap();

        artifact.discard().await.unwrap();
        assert_eq!(artifact.state, ArtifactState::Aborted);
        assert!(!artifact.path.exists());
        discard(&artifact.path).await.unwrap();
    }
}
