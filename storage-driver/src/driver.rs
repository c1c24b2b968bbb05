use std::{fmt, ops::Deref, sync::Arc};

use bytes::Bytes;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use eyre::WrapErr;
use tokio::io::{self, AsyncWriteExt};

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for file contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for file contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// File object metadata, which will be generically provided by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the file in bytes.
    pub size: u64,

    /// The creation timestamp of the file.
    pub created: DateTime<Utc>,
}

/// A storage driver, which provides the ability to interact with a storage backend.
///
/// Keys are `/`-separated relative paths within a bucket. Drivers keep no
/// coordination state of their own beyond what the backend provides: two
/// writes to the same key race, and the later one wins.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Store `content` at `remote`, replacing anything already there.
    async fn put_content(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        content: Bytes,
    ) -> Result<(), StorageError>;

    /// Read the full content stored at `remote`.
    async fn get_content(&self, bucket: &str, remote: &Utf8Path) -> Result<Bytes, StorageError>;

    /// Get the metadata for a file, by path.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// List every key stored beneath `prefix` (or the whole bucket), in
    /// lexicographic order.
    ///
    /// Fails with [`StorageErrorKind::NotFound`] when nothing is stored
    /// beneath the prefix.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError>;

    /// Open a read stream over the file at `remote`, starting `offset` bytes in.
    async fn reader(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
    ) -> Result<Box<Reader<'static>>, StorageError>;

    /// Open a write stream to the file at `remote`.
    ///
    /// With `append`, bytes are added after any existing content, otherwise
    /// the existing content is replaced. Written content is only guaranteed
    /// to be visible once the writer has been shut down.
    async fn writer(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        append: bool,
    ) -> Result<Box<Writer<'static>>, StorageError>;

    /// Delete the file at `remote`, and every file beneath it.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Download a file from storage, into a writer stream.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<u64, StorageError> {
        tracing::trace!(%remote, "Downloading from: {bucket}/{remote}");
        let mut reader = self.reader(bucket, remote, 0).await?;
        let read = io::copy_buf(&mut reader, writer)
            .await
            .wrap_err("copy from reader")
            .map_err(StorageError::with(self.name(), StorageErrorKind::Io))?;
        writer
            .flush()
            .await
            .wrap_err("flush writer")
            .map_err(StorageError::with(self.name(), StorageErrorKind::Io))?;
        Ok(read)
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn put_content(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        content: Bytes,
    ) -> Result<(), StorageError> {
        self.deref().put_content(bucket, remote, content).await
    }

    async fn get_content(&self, bucket: &str, remote: &Utf8Path) -> Result<Bytes, StorageError> {
        self.deref().get_content(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, remote).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.deref().list(bucket, prefix).await
    }

    async fn reader(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
    ) -> Result<Box<Reader<'static>>, StorageError> {
        self.deref().reader(bucket, remote, offset).await
    }

    async fn writer(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        append: bool,
    ) -> Result<Box<Writer<'static>>, StorageError> {
        self.deref().writer(bucket, remote, append).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, remote).await
    }
}

#[async_trait::async_trait]
impl<D> Driver for &D
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn put_content(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        content: Bytes,
    ) -> Result<(), StorageError> {
        (**self).put_content(bucket, remote, content).await
    }

    async fn get_content(&self, bucket: &str, remote: &Utf8Path) -> Result<Bytes, StorageError> {
        (**self).get_content(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        (**self).metadata(bucket, remote).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        (**self).list(bucket, prefix).await
    }

    async fn reader(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
    ) -> Result<Box<Reader<'static>>, StorageError> {
        (**self).reader(bucket, remote, offset).await
    }

    async fn writer(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        append: bool,
    ) -> Result<Box<Writer<'static>>, StorageError> {
        (**self).writer(bucket, remote, append).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        (**self).delete(bucket, remote).await
    }
}
