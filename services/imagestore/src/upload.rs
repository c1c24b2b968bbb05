//! Resumable, chunked blob uploads.
//!
//! A session is prepared with the size (and optionally the digest) of the
//! blob the client intends to send. Chunks are then written at ordinal
//! indices, in any order and as often as needed, until the session is
//! either completed, which promotes the concatenated chunks into a blob,
//! or cancelled. No session state is held in memory: the stored chunks
//! are the only record of progress.

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{ready, Context, Poll};

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::try_join_all;
use sha2::{Digest as _, Sha256};
use storage::{StorageBucket, StorageError, Writer};
use tokio::io::{self, AsyncWrite, AsyncWriteExt as _};
use tokio::task::JoinHandle;
use tracing::Instrument as _;

use crate::blob::BlobStore;
use crate::error::{RegistryError, RegistryResult, StorageResultExt as _};
use crate::paths::{chunk_index, PathSpec};
use crate::reference::{new_session, normalize_name, normalize_session, Digest};
use crate::schema::{BlobDescriptor, UploadInfo, DEFAULT_BLOB_MEDIA_TYPE};

const UPLOAD_ROUTE: &str = "/blobs/uploads/";

/// Where a client resumes an upload: `/<name>/blobs/uploads/<session>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadLocation {
    /// Normalized image name
    pub name: String,
    /// Session id
    pub session: String,
}

impl fmt::Display for UploadLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}{UPLOAD_ROUTE}{}", self.name, self.session)
    }
}

impl FromStr for UploadLocation {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, session) = s
            .strip_prefix('/')
            .and_then(|rest| rest.rsplit_once(UPLOAD_ROUTE))
            .ok_or_else(|| RegistryError::InvalidUpload(s.to_owned()))?;

        Ok(UploadLocation {
            name: normalize_name(name)?,
            session: normalize_session(session)?,
        })
    }
}

/// Handle on the background removal of a cancelled upload.
///
/// Dropping the handle leaves the removal running. Failures are logged
/// either way, and are also returned from [`Cleanup::wait`].
#[derive(Debug)]
pub struct Cleanup {
    handle: JoinHandle<Result<(), StorageError>>,
}

impl Cleanup {
    /// Wait for the removal to finish.
    pub async fn wait(self) -> RegistryResult<()> {
        self.handle
            .await
            .map_err(|error| RegistryError::Internal(format!("upload cleanup task: {error}")))?
            .context("removing cancelled upload")
    }
}

/// Passes writes through to `inner`, hashing and counting the bytes
/// `inner` accepted.
struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W> fmt::Debug for DigestWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestWriter")
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

impl<W> DigestWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (Digest, u64) {
        (Digest::from_hasher(self.hasher), self.written)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for DigestWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let accepted = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.hasher.update(&buf[..accepted]);
        this.written += accepted as u64;
        Poll::Ready(Ok(accepted))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Manages upload sessions and their promotion into blobs.
#[derive(Debug, Clone)]
pub struct UploadSessions {
    storage: StorageBucket,
    blobs: BlobStore,
}

impl UploadSessions {
    pub(crate) fn new(storage: StorageBucket, blobs: BlobStore) -> Self {
        Self { storage, blobs }
    }

    /// Start an upload session for a blob described by `info`.
    #[tracing::instrument(skip(self))]
    pub async fn prepare(&self, name: &str, info: &UploadInfo) -> RegistryResult<UploadLocation> {
        let name = normalize_name(name)?;
        let info = UploadInfo {
            size: info.size,
            digest: info
                .digest
                .as_deref()
                .map(|digest| Digest::parse(digest).map(String::from))
                .transpose()?,
            media_type: info.media_type.clone(),
        };

        let session = new_session();
        self.storage
            .put_content(
                &PathSpec::UploadInfo {
                    name: &name,
                    session: &session,
                }
                .path(),
                serde_json::to_vec(&info)?,
            )
            .await
            .context("recording upload info")?;

        tracing::debug!(%name, %session, size = info.size, "upload prepared");
        Ok(UploadLocation { name, session })
    }

    async fn ensure_session(&self, name: &str, session: &str) -> RegistryResult<()> {
        let present = self
            .storage
            .exists(&PathSpec::UploadInfo { name, session }.path())
            .await
            .context("checking upload session")?;

        if present {
            Ok(())
        } else {
            Err(RegistryError::UploadNotFound(session.to_owned()))
        }
    }

    async fn info(&self, name: &str, session: &str) -> RegistryResult<UploadInfo> {
        let data = self
            .storage
            .get_content(&PathSpec::UploadInfo { name, session }.path())
            .await
            .or_missing(
                || RegistryError::UploadNotFound(session.to_owned()),
                "reading upload info",
            )?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Keys of every chunk in the session, in index order.
    async fn chunks(&self, name: &str, session: &str) -> RegistryResult<Vec<Utf8PathBuf>> {
        let listed = self
            .storage
            .list(Some(&PathSpec::Upload { name, session }.path()))
            .await
            .or_missing(
                || RegistryError::UploadNotFound(session.to_owned()),
                "listing upload chunks",
            )?;

        let mut chunks: Vec<(u32, Utf8PathBuf)> = listed
            .into_iter()
            .map(Utf8PathBuf::from)
            .filter_map(|key| Some((chunk_index(key.file_name()?)?, key)))
            .collect();
        chunks.sort_by_key(|(index, _)| *index);
        Ok(chunks.into_iter().map(|(_, key)| key).collect())
    }

    async fn total_size(&self, chunks: &[Utf8PathBuf]) -> RegistryResult<u64> {
        let sizes = try_join_all(
            chunks
                .iter()
                .map(|chunk| self.storage.metadata(chunk.as_path())),
        )
        .await
        .context("measuring upload chunks")?;
        Ok(sizes.iter().map(|metadata| metadata.size).sum())
    }

    /// Bytes received so far, summed over the chunks currently stored.
    #[tracing::instrument(skip(self))]
    pub async fn uploaded_size(&self, name: &str, session: &str) -> RegistryResult<u64> {
        let name = normalize_name(name)?;
        let session = normalize_session(session)?;
        let chunks = self.chunks(&name, &session).await?;
        self.total_size(&chunks).await
    }

    /// Open chunk `index` of the session for writing.
    ///
    /// Rewriting an index replaces that chunk. Chunk content is only
    /// committed once the writer is shut down.
    #[tracing::instrument(skip(self))]
    pub async fn chunk_writer(
        &self,
        name: &str,
        session: &str,
        index: u32,
    ) -> RegistryResult<Box<Writer<'static>>> {
        let name = normalize_name(name)?;
        let session = normalize_session(session)?;
        self.ensure_session(&name, &session).await?;

        self.storage
            .writer(
                &PathSpec::UploadChunk {
                    name: &name,
                    session: &session,
                    index,
                }
                .path(),
                false,
            )
            .await
            .context("opening upload chunk")
    }

    /// Discard the session. Removal of its chunks happens in the background.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, name: &str, session: &str) -> RegistryResult<Cleanup> {
        let name = normalize_name(name)?;
        let session = normalize_session(session)?;
        self.ensure_session(&name, &session).await?;

        let storage = self.storage.clone();
        let root = PathSpec::Upload {
            name: &name,
            session: &session,
        }
        .path();

        let handle = tokio::spawn(
            async move {
                let result = storage.delete(&root).await;
                match &result {
                    Ok(()) => tracing::debug!("cancelled upload removed"),
                    Err(error) => tracing::warn!(%error, "failed to remove cancelled upload"),
                }
                result
            }
            .in_current_span(),
        );

        Ok(Cleanup { handle })
    }

    /// Check the session is complete, and promote its chunks into a blob.
    ///
    /// The uploaded size must equal the declared size, and the content must
    /// hash to the declared digest if one was given. The session is removed
    /// once the blob is stored.
    ///
    /// Chunks are read exactly once, into a staging object which is hashed
    /// as it is written. Only the staged bytes are promoted, so a chunk
    /// rewritten while completion runs can't change the stored blob.
    #[tracing::instrument(skip(self))]
    pub async fn complete(&self, name: &str, session: &str) -> RegistryResult<BlobDescriptor> {
        let name = normalize_name(name)?;
        let session = normalize_session(session)?;
        let info = self.info(&name, &session).await?;

        let chunks = self.chunks(&name, &session).await?;
        let uploaded = self.total_size(&chunks).await?;
        if uploaded != info.size {
            return Err(RegistryError::SizeMismatch {
                actual: uploaded,
                expected: info.size,
            });
        }

        let attempt = new_session();
        let staging = PathSpec::UploadStaging {
            name: &name,
            session: &session,
            attempt: &attempt,
        }
        .path();

        let descriptor = match self.promote_staged(&info, &chunks, &staging).await {
            Ok(descriptor) => descriptor,
            Err(error) => {
                match self.storage.delete(&staging).await {
                    Err(cleanup) if !cleanup.is_not_found() => {
                        tracing::warn!(error = %cleanup, "failed to remove staged upload");
                    }
                    _ => {}
                }
                return Err(error);
            }
        };

        self.storage
            .delete(
                &PathSpec::Upload {
                    name: &name,
                    session: &session,
                }
                .path(),
            )
            .await
            .context("removing completed upload")?;

        tracing::info!(%name, %session, digest = %descriptor.digest, "upload completed");
        Ok(descriptor)
    }

    async fn promote_staged(
        &self,
        info: &UploadInfo,
        chunks: &[Utf8PathBuf],
        staging: &Utf8Path,
    ) -> RegistryResult<BlobDescriptor> {
        let (digest, staged) = self.stage(chunks, staging).await?;
        if staged != info.size {
            return Err(RegistryError::SizeMismatch {
                actual: staged,
                expected: info.size,
            });
        }

        if let Some(expected) = &info.digest {
            let expected = Digest::parse(expected)?;
            if expected != digest {
                return Err(RegistryError::DigestMismatch {
                    expected: expected.into(),
                    actual: digest.into(),
                });
            }
        }

        let media_type = info
            .media_type
            .as_deref()
            .unwrap_or(DEFAULT_BLOB_MEDIA_TYPE);
        self.blobs
            .promote(&digest, info.size, media_type, &[staging.to_owned()])
            .await
    }

    /// Concatenate `chunks` into `staging`, hashing the bytes on the way.
    async fn stage(
        &self,
        chunks: &[Utf8PathBuf],
        staging: &Utf8Path,
    ) -> RegistryResult<(Digest, u64)> {
        let writer = self
            .storage
            .writer(staging, false)
            .await
            .context("opening staged upload")?;

        let mut writer = DigestWriter::new(writer);
        for chunk in chunks {
            self.storage
                .download(chunk, &mut writer)
                .await
                .context("staging upload chunk")?;
        }
        writer.shutdown().await?;
        Ok(writer.finish())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use bytes::Bytes;
    use storage::{Driver, MemoryStorage, Metadata, Reader, Storage, StorageErrorKind};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;

    fn sessions() -> UploadSessions {
        with_driver(MemoryStorage::new())
    }

    fn with_driver<D: Driver + Send + Sync + 'static>(driver: D) -> UploadSessions {
        let bucket = Storage::new(driver).bucket("registry");
        UploadSessions::new(bucket.clone(), BlobStore::new(bucket))
    }

    #[derive(Debug, Clone, Copy)]
    enum Fault {
        /// Replace every first chunk with other bytes the first time a blob
        /// descriptor is read.
        RewriteFirstChunk,
        /// Fail every delete.
        FailDelete,
    }

    /// An in-memory driver which misbehaves in one specific way.
    #[derive(Debug)]
    struct FaultyDriver {
        inner: MemoryStorage,
        fault: Fault,
        tripped: AtomicBool,
    }

    impl FaultyDriver {
        fn new(fault: Fault) -> Self {
            Self {
                inner: MemoryStorage::new(),
                fault,
                tripped: AtomicBool::new(false),
            }
        }

        async fn rewrite_first_chunks(&self, bucket: &str) -> Result<(), StorageError> {
            for key in self.inner.list(bucket, None).await? {
                let key = Utf8PathBuf::from(key);
                if key.file_name().and_then(chunk_index) == Some(0) {
                    self.inner
                        .put_content(bucket, &key, Bytes::from_static(b"EVIL!"))
                        .await?;
                }
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Driver for FaultyDriver {
        fn name(&self) -> &'static str {
            "faulty"
        }

        async fn put_content(
            &self,
            bucket: &str,
            remote: &Utf8Path,
            content: Bytes,
        ) -> Result<(), StorageError> {
            self.inner.put_content(bucket, remote, content).await
        }

        async fn get_content(
            &self,
            bucket: &str,
            remote: &Utf8Path,
        ) -> Result<Bytes, StorageError> {
            if matches!(self.fault, Fault::RewriteFirstChunk)
                && remote.file_name() == Some("descriptor")
                && !self.tripped.swap(true, Ordering::SeqCst)
            {
                self.rewrite_first_chunks(bucket).await?;
            }
            self.inner.get_content(bucket, remote).await
        }

        async fn metadata(
            &self,
            bucket: &str,
            remote: &Utf8Path,
        ) -> Result<Metadata, StorageError> {
            self.inner.metadata(bucket, remote).await
        }

        async fn list(
            &self,
            bucket: &str,
            prefix: Option<&Utf8Path>,
        ) -> Result<Vec<String>, StorageError> {
            self.inner.list(bucket, prefix).await
        }

        async fn reader(
            &self,
            bucket: &str,
            remote: &Utf8Path,
            offset: u64,
        ) -> Result<Box<Reader<'static>>, StorageError> {
            self.inner.reader(bucket, remote, offset).await
        }

        async fn writer(
            &self,
            bucket: &str,
            remote: &Utf8Path,
            append: bool,
        ) -> Result<Box<Writer<'static>>, StorageError> {
            self.inner.writer(bucket, remote, append).await
        }

        async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
            if matches!(self.fault, Fault::FailDelete) {
                return Err(StorageError::new(
                    self.name(),
                    StorageErrorKind::Io,
                    io::Error::other("device went away"),
                ));
            }
            self.inner.delete(bucket, remote).await
        }
    }

    async fn write_chunk(uploads: &UploadSessions, at: &UploadLocation, index: u32, data: &[u8]) {
        let mut writer = uploads
            .chunk_writer(&at.name, &at.session, index)
            .await
            .unwrap();
        writer.write_all(data).await.unwrap();
        writer.shutdown().await.unwrap();
    }

    #[test]
    fn location_round_trip() {
        let location = UploadLocation {
            name: "library/app".into(),
            session: new_session(),
        };
        let text = location.to_string();
        assert!(text.starts_with("/library/app/blobs/uploads/"));
        assert_eq!(text.parse::<UploadLocation>().unwrap(), location);

        assert!("library/app".parse::<UploadLocation>().is_err());
        assert!("/app/blobs/uploads/not-a-uuid"
            .parse::<UploadLocation>()
            .is_err());
    }

    #[tokio::test]
    async fn size_is_sum_of_chunks() {
        let uploads = sessions();
        let at = uploads.prepare("app", &UploadInfo::new(35)).await.unwrap();
        assert_eq!(uploads.uploaded_size(&at.name, &at.session).await.unwrap(), 0);

        write_chunk(&uploads, &at, 2, &[0; 5]).await;
        write_chunk(&uploads, &at, 0, &[0; 10]).await;
        write_chunk(&uploads, &at, 1, &[0; 20]).await;
        assert_eq!(uploads.uploaded_size(&at.name, &at.session).await.unwrap(), 35);

        // Retrying a chunk replaces it.
        write_chunk(&uploads, &at, 1, &[0; 4]).await;
        assert_eq!(uploads.uploaded_size(&at.name, &at.session).await.unwrap(), 19);
    }

    #[tokio::test]
    async fn unknown_session() {
        let uploads = sessions();
        let session = new_session();
        assert!(matches!(
            uploads.uploaded_size("app", &session).await,
            Err(RegistryError::UploadNotFound(_))
        ));
        assert!(matches!(
            uploads.chunk_writer("app", &session, 0).await.err().unwrap(),
            RegistryError::UploadNotFound(_)
        ));
        assert!(matches!(
            uploads.cancel("app", &session).await,
            Err(RegistryError::UploadNotFound(_))
        ));
        assert!(matches!(
            uploads.complete("app", &session).await,
            Err(RegistryError::UploadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn complete_checks_digest() {
        let uploads = sessions();
        let info = UploadInfo::new(11).with_digest(Digest::of(b"something else").to_string());
        let at = uploads.prepare("app", &info).await.unwrap();
        write_chunk(&uploads, &at, 0, b"hello world").await;

        assert!(matches!(
            uploads.complete(&at.name, &at.session).await,
            Err(RegistryError::DigestMismatch { .. })
        ));
        // The session survives a failed completion.
        assert_eq!(uploads.uploaded_size(&at.name, &at.session).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn prepare_rejects_bad_digest() {
        let uploads = sessions();
        let info = UploadInfo::new(1).with_digest("abc");
        assert!(matches!(
            uploads.prepare("app", &info).await,
            Err(RegistryError::InvalidDigest(_))
        ));
    }

    #[tokio::test]
    async fn complete_in_index_order() {
        let uploads = sessions();
        let at = uploads
            .prepare("app", &UploadInfo::new(11).with_media_type("text/plain"))
            .await
            .unwrap();
        write_chunk(&uploads, &at, 10, b"world").await;
        write_chunk(&uploads, &at, 9, b"hello ").await;

        let descriptor = uploads.complete(&at.name, &at.session).await.unwrap();
        assert_eq!(descriptor.digest, Digest::of(b"hello world"));
        assert_eq!(descriptor.media_type, "text/plain");
        assert!(matches!(
            uploads.uploaded_size(&at.name, &at.session).await,
            Err(RegistryError::UploadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn chunk_rewritten_during_completion() {
        let uploads = with_driver(FaultyDriver::new(Fault::RewriteFirstChunk));
        let expected = Digest::of(b"hello");
        let info = UploadInfo::new(5).with_digest(expected.to_string());
        let at = uploads.prepare("app", &info).await.unwrap();
        write_chunk(&uploads, &at, 0, b"hello").await;

        let descriptor = uploads.complete(&at.name, &at.session).await.unwrap();
        assert_eq!(descriptor.digest, expected);

        let mut reader = uploads
            .blobs
            .chunk_reader("app", expected.as_str(), expected.as_str(), 0)
            .await
            .unwrap();
        let mut stored = Vec::new();
        reader.read_to_end(&mut stored).await.unwrap();
        assert_eq!(stored, b"hello");
        assert_eq!(Digest::of(&stored), descriptor.digest);
    }

    #[tokio::test]
    async fn completion_leaves_no_staging() {
        let uploads = sessions();
        let at = uploads.prepare("app", &UploadInfo::new(5)).await.unwrap();
        write_chunk(&uploads, &at, 0, b"hello").await;
        uploads.complete(&at.name, &at.session).await.unwrap();

        let listed = uploads.storage.list(None).await.unwrap();
        assert!(
            listed.iter().all(|key| !key.contains("/_uploads/")),
            "{listed:?}"
        );
    }

    #[tokio::test]
    async fn failed_cleanup_is_reported() {
        let uploads = with_driver(FaultyDriver::new(Fault::FailDelete));
        let at = uploads.prepare("app", &UploadInfo::new(3)).await.unwrap();
        write_chunk(&uploads, &at, 0, b"abc").await;

        let cleanup = uploads.cancel(&at.name, &at.session).await.unwrap();
        let err = cleanup.wait().await.unwrap_err();
        assert!(matches!(err, RegistryError::Storage { .. }), "{err}");
        assert_eq!(err.status_code(), http::StatusCode::INTERNAL_SERVER_ERROR);

        // Nothing was removed, so the session is still there.
        assert_eq!(uploads.uploaded_size(&at.name, &at.session).await.unwrap(), 3);
    }
}
