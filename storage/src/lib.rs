//! # Storage backends
//!
//! Configuration and unification for the storage backends.

use std::sync::Arc;

use bytes::Bytes;
use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;
use tokio::io;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Selects and configures a storage backend.
///
/// ```toml
/// [storage.local]
/// path = "/var/lib/imagestore"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep everything in memory, for tests and throwaway instances.
    Memory,

    /// Store files beneath a directory on the local filesystem.
    #[cfg(feature = "local")]
    Local {
        /// Root directory; each bucket is a directory beneath it.
        path: Utf8PathBuf,
    },

    /// Store files in a temporary directory, removed on shutdown.
    #[cfg(feature = "tmp")]
    Temp,
}

impl StorageConfig {
    /// Build the configured storage backend.
    #[tracing::instrument]
    pub fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory => MemoryStorage::new().into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::new()
                .map_err(|err| StorageError::from_io("temp", err))?
                .into(),
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A shared handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// Scope this storage to a single bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }
}

/// A storage driver scoped to one bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    /// The bucket every operation addresses.
    pub bucket: String,
    driver: ArcDriver,
}

impl StorageBucket {
    /// Store `content` at `remote`, replacing anything already there.
    #[tracing::instrument(skip(self, content), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn put_content(
        &self,
        remote: &Utf8Path,
        content: impl Into<Bytes> + Send,
    ) -> Result<(), StorageError> {
        let content = content.into();
        tracing::trace!(%remote, size = content.len(), "Putting content");
        self.driver.put_content(&self.bucket, remote, content).await
    }

    /// Read everything stored at `remote`.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn get_content(&self, remote: &Utf8Path) -> Result<Bytes, StorageError> {
        self.driver.get_content(&self.bucket, remote).await
    }

    /// Size and creation time of the object at `remote`.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, remote).await
    }

    /// Presence check: `Ok(false)` when nothing is stored at `remote`.
    pub async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(remote).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Every key beneath `prefix`, sorted. Fails with `NotFound` when there are none.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.driver.list(&self.bucket, prefix).await
    }

    /// Open a read stream at `remote`, `offset` bytes in.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn reader(
        &self,
        remote: &Utf8Path,
        offset: u64,
    ) -> Result<Box<Reader<'static>>, StorageError> {
        self.driver.reader(&self.bucket, remote, offset).await
    }

    /// Open a write stream at `remote`. Content is committed on shutdown.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn writer(
        &self,
        remote: &Utf8Path,
        append: bool,
    ) -> Result<Box<Writer<'static>>, StorageError> {
        self.driver.writer(&self.bucket, remote, append).await
    }

    /// Copy the object at `remote` into `writer`, returning the bytes copied.
    ///
    /// The writer is flushed but not shut down, so several objects can be
    /// copied into one stream.
    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn download<'d, W>(
        &'d self,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<u64, StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {}/{remote}", self.bucket);
        self.driver.download(&self.bucket, remote, writer).await
    }

    /// Delete `remote` and everything beneath it.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(&self.bucket, remote).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config() {
        let config: StorageConfig = serde_json::from_str(r#""memory""#).unwrap();
        assert!(matches!(config, StorageConfig::Memory));

        #[cfg(feature = "local")]
        {
            let config: StorageConfig =
                serde_json::from_str(r#"{"local": {"path": "/var/lib/store"}}"#).unwrap();
            assert!(
                matches!(config, StorageConfig::Local { path } if path == Utf8Path::new("/var/lib/store"))
            );
        }
    }

    #[tokio::test]
    async fn bucket_exists() {
        let storage = StorageConfig::Memory.build().unwrap();
        let bucket = storage.bucket("bucket");
        let key = Utf8Path::new("present");

        assert!(!bucket.exists(key).await.unwrap());
        bucket.put_content(key, "yes").await.unwrap();
        assert!(bucket.exists(key).await.unwrap());
    }
}
