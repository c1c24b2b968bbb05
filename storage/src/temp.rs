use std::io;

use bytes::Bytes;
use camino::Utf8Path;
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{Driver, Metadata, Reader, StorageError, Writer};

/// A storage driver that stores files in a temporary directory.
///
/// The directory, and everything in it, is removed when the driver is dropped.
#[derive(Debug)]
pub struct TempDriver {
    #[allow(unused)]
    dir: TempDir,
    driver: LocalDriver,
}

impl TempDriver {
    /// Create a new `TempDriver` instance, storing files in a temporary directory.
    pub fn new() -> io::Result<Self> {
        let tmp = TempDir::new()?;
        let root = Utf8Path::from_path(tmp.path())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non utf-8 temp dir"))?
            .to_owned();

        Ok(Self {
            dir: tmp,
            driver: LocalDriver::new(root),
        })
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn put_content(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        content: Bytes,
    ) -> Result<(), StorageError> {
        self.driver.put_content(bucket, remote, content).await
    }

    async fn get_content(&self, bucket: &str, remote: &Utf8Path) -> Result<Bytes, StorageError> {
        self.driver.get_content(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(bucket, remote).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.driver.list(bucket, prefix).await
    }

    async fn reader(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
    ) -> Result<Box<Reader<'static>>, StorageError> {
        self.driver.reader(bucket, remote, offset).await
    }

    async fn writer(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        append: bool,
    ) -> Result<Box<Writer<'static>>, StorageError> {
        self.driver.writer(bucket, remote, append).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(bucket, remote).await
    }
}
