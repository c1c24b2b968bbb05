use std::{
    collections::{BTreeMap, HashMap},
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::io::AsyncWrite;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

const ENGINE: &str = "memory";

#[derive(Debug, Clone)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Bytes,
}

impl From<Bytes> for MemoryFileItem {
    fn from(data: Bytes) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

type Bucket = BTreeMap<Utf8PathBuf, MemoryFileItem>;
type Buckets = Arc<RwLock<HashMap<String, Bucket>>>;

/// Storage driver that stores files in memory.
///
/// Buckets are created on first write. Keys are kept ordered, so listings
/// come back sorted without extra work.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    buckets: Buckets,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    fn item(&self, bucket: &str, remote: &Utf8Path) -> Result<MemoryFileItem, StorageError> {
        let buckets = self.buckets.read();
        buckets
            .get(bucket)
            .and_then(|files| files.get(remote))
            .cloned()
            .ok_or_else(|| StorageError::not_found(ENGINE, bucket, remote.as_str()))
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn put_content(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        content: Bytes,
    ) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write();
        buckets
            .entry(bucket.to_owned())
            .or_default()
            .insert(remote.to_owned(), content.into());
        Ok(())
    }

    async fn get_content(&self, bucket: &str, remote: &Utf8Path) -> Result<Bytes, StorageError> {
        Ok(self.item(bucket, remote)?.data)
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        Ok((&self.item(bucket, remote)?).into())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read();
        let files = buckets.get(bucket).ok_or_else(|| {
            StorageError::builder(
                ENGINE,
                StorageErrorKind::NotFound,
                io::Error::new(io::ErrorKind::NotFound, format!("bucket not found: {bucket}")),
            )
            .bucket(bucket)
            .build()
        })?;

        let paths: Vec<String> = match prefix {
            Some(prefix) => files
                .keys()
                .filter(|path| path.starts_with(prefix))
                .map(|path| path.to_string())
                .collect(),
            None => files.keys().map(|path| path.to_string()).collect(),
        };

        match prefix {
            Some(prefix) if paths.is_empty() => {
                Err(StorageError::not_found(ENGINE, bucket, prefix.as_str()))
            }
            _ => Ok(paths),
        }
    }

    async fn reader(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
    ) -> Result<Box<Reader<'static>>, StorageError> {
        let data = self.item(bucket, remote)?.data;
        let start = usize::try_from(offset)
            .ok()
            .filter(|start| *start <= data.len())
            .ok_or_else(|| {
                StorageError::builder(
                    ENGINE,
                    StorageErrorKind::InvalidRequest,
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("offset {offset} is past the end of {} bytes", data.len()),
                    ),
                )
                .bucket(bucket)
                .path(remote.as_str())
                .build()
            })?;

        Ok(Box::new(io::Cursor::new(data.slice(start..))))
    }

    async fn writer(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        append: bool,
    ) -> Result<Box<Writer<'static>>, StorageError> {
        let buffer = if append {
            self.item(bucket, remote)
                .map(|item| item.data.to_vec())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok(Box::new(MemoryWriter {
            buckets: self.buckets.clone(),
            bucket: bucket.to_owned(),
            remote: remote.to_owned(),
            buffer,
        }))
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write();
        let files = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::not_found(ENGINE, bucket, remote.as_str()))?;

        let before = files.len();
        files.retain(|path, _| !path.starts_with(remote));
        if files.len() == before {
            return Err(StorageError::not_found(ENGINE, bucket, remote.as_str()));
        }

        Ok(())
    }
}

/// Buffers written bytes, and stores them in the bucket on shutdown.
#[derive(Debug)]
struct MemoryWriter {
    buckets: Buckets,
    bucket: String,
    remote: Utf8PathBuf,
    buffer: Vec<u8>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let data = Bytes::copy_from_slice(&this.buffer);
        this.buckets
            .write()
            .entry(this.bucket.clone())
            .or_default()
            .insert(this.remote.clone(), data.into());
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    const BUCKET: &str = "bucket";

    #[tokio::test]
    async fn put_and_get() {
        let memory = MemoryStorage::new();
        let key = Utf8Path::new("a/b/c");

        memory
            .put_content(BUCKET, key, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(memory.get_content(BUCKET, key).await.unwrap(), "hello");
        assert_eq!(memory.metadata(BUCKET, key).await.unwrap().size, 5);

        let err = memory
            .get_content(BUCKET, Utf8Path::new("a/b/d"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_by_component_prefix() {
        let memory = MemoryStorage::new();
        for key in ["a/b/1", "a/b/2", "a/bc/3", "z"] {
            memory
                .put_content(BUCKET, Utf8Path::new(key), Bytes::new())
                .await
                .unwrap();
        }

        let listed = memory
            .list(BUCKET, Some(Utf8Path::new("a/b")))
            .await
            .unwrap();
        assert_eq!(listed, vec!["a/b/1", "a/b/2"]);

        let all = memory.list(BUCKET, None).await.unwrap();
        assert_eq!(all.len(), 4);

        let err = memory
            .list(BUCKET, Some(Utf8Path::new("missing")))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn reader_at_offset() {
        let memory = MemoryStorage::new();
        let key = Utf8Path::new("blob");
        memory
            .put_content(BUCKET, key, Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let mut reader = memory.reader(BUCKET, key, 4).await.unwrap();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "456789");

        let err = memory.reader(BUCKET, key, 11).await.err().unwrap();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn writer_commits_on_shutdown() {
        let memory = MemoryStorage::new();
        let key = Utf8Path::new("chunk");

        let mut writer = memory.writer(BUCKET, key, false).await.unwrap();
        writer.write_all(b"first").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut writer = memory.writer(BUCKET, key, true).await.unwrap();
        writer.write_all(b"+more").await.unwrap();
        writer.shutdown().await.unwrap();
        assert_eq!(memory.get_content(BUCKET, key).await.unwrap(), "first+more");

        let mut writer = memory.writer(BUCKET, key, false).await.unwrap();
        writer.write_all(b"replaced").await.unwrap();
        writer.shutdown().await.unwrap();
        assert_eq!(memory.get_content(BUCKET, key).await.unwrap(), "replaced");
    }

    #[tokio::test]
    async fn delete_prefix() {
        let memory = MemoryStorage::new();
        for key in ["u/1/info", "u/1/chunk", "u/2/info"] {
            memory
                .put_content(BUCKET, Utf8Path::new(key), Bytes::new())
                .await
                .unwrap();
        }

        memory.delete(BUCKET, Utf8Path::new("u/1")).await.unwrap();
        assert_eq!(memory.list(BUCKET, None).await.unwrap(), vec!["u/2/info"]);

        let err = memory.delete(BUCKET, Utf8Path::new("u/1")).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
