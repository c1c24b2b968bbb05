use std::io::{self, SeekFrom};

use bytes::Bytes;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use tokio::io::{AsyncSeekExt, BufReader, BufWriter};
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

const ENGINE: &str = "local";

/// Storage driver backed by a directory on the local filesystem.
///
/// Each bucket is a directory beneath the root, and each key a file beneath
/// its bucket.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

fn io_error(bucket: &str, remote: &Utf8Path, context: &str) -> impl FnOnce(io::Error) -> StorageError {
    let bucket = bucket.to_owned();
    let remote = remote.to_string();
    let context = context.to_owned();
    move |err| {
        StorageError::builder(ENGINE, err.kind().into(), err)
            .bucket(bucket)
            .path(remote)
            .context(context)
            .build()
    }
}

impl LocalDriver {
    /// Create a driver rooted at `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn bucket_root(&self, bucket: &str) -> Result<Utf8PathBuf, StorageError> {
        let mut components = Utf8Path::new(bucket).components();
        match (components.next(), components.next()) {
            (Some(Utf8Component::Normal(_)), None) => Ok(self.root.join(bucket)),
            _ => Err(invalid_key(bucket, bucket)),
        }
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        if !remote
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)))
        {
            return Err(invalid_key(bucket, remote.as_str()));
        }

        Ok(self.bucket_root(bucket)?.join(remote))
    }
}

fn invalid_key(bucket: &str, remote: &str) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::InvalidRequest,
        io::Error::new(io::ErrorKind::InvalidInput, "key must be a relative path"),
    )
    .bucket(bucket)
    .path(remote)
    .build()
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn put_content(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        content: Bytes,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error(bucket, remote, "create_dir_all"))?;
        }

        tokio::fs::write(&path, &content)
            .await
            .map_err(io_error(bucket, remote, "write"))
    }

    async fn get_content(&self, bucket: &str, remote: &Utf8Path) -> Result<Bytes, StorageError> {
        let path = self.path(bucket, remote)?;
        let content = tokio::fs::read(&path)
            .await
            .map_err(io_error(bucket, remote, "read"))?;
        Ok(content.into())
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(io_error(bucket, remote, "metadata"))?;

        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(io_error(bucket, remote, "created timestamp"))?;

        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let bucket_root = self.bucket_root(bucket)?;
        let target = match prefix {
            Some(prefix) => self.path(bucket, prefix)?,
            None => bucket_root.clone(),
        };

        let listed = prefix.unwrap_or(Utf8Path::new(""));
        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(io_error(bucket, listed, "list"))?;

        if metadata.is_file() {
            return Ok(vec![listed.to_string()]);
        }

        let mut items = tokio::task::spawn_blocking(move || collect_list(&target))
            .in_current_span()
            .await
            .wrap_err("task: walking directory")
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Other))?
            .map_err(io_error(bucket, listed, "walking directory"))?;

        if items.is_empty() && prefix.is_some() {
            return Err(StorageError::not_found(ENGINE, bucket, listed.as_str()));
        }

        tracing::debug!("Found {} entries", items.len());
        items.sort();

        Ok(items
            .into_iter()
            .filter_map(|path| {
                path.strip_prefix(&bucket_root)
                    .ok()
                    .map(|relative| relative.to_string())
            })
            .collect())
    }

    async fn reader(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
    ) -> Result<Box<Reader<'static>>, StorageError> {
        let path = self.path(bucket, remote)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(io_error(bucket, remote, "open for reading"))?;

        let size = file
            .metadata()
            .await
            .map_err(io_error(bucket, remote, "metadata"))?
            .len();
        if offset > size {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("offset {offset} is past the end of {size} bytes"),
                ),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(io_error(bucket, remote, "seek"))?;

        Ok(Box::new(BufReader::new(file)))
    }

    async fn writer(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        append: bool,
    ) -> Result<Box<Writer<'static>>, StorageError> {
        let path = self.path(bucket, remote)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error(bucket, remote, "create_dir_all"))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .await
            .map_err(io_error(bucket, remote, "open for writing"))?;

        Ok(Box::new(BufWriter::new(file)))
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(io_error(bucket, remote, "delete"))?;

        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(io_error(bucket, remote, "remove_dir_all"))
        } else {
            tokio::fs::remove_file(&path)
                .await
                .map_err(io_error(bucket, remote, "remove_file"))
        }
    }
}

#[tracing::instrument(level = "trace")]
fn collect_list(path: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    visit(path, &mut files)?;
    Ok(files)
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> io::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    const BUCKET: &str = "bucket";

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn list_relative_to_bucket() {
        let (_dir, driver) = driver();
        for key in ["a/b/2", "a/b/1", "a/c"] {
            driver
                .put_content(BUCKET, Utf8Path::new(key), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let listed = driver
            .list(BUCKET, Some(Utf8Path::new("a/b")))
            .await
            .unwrap();
        assert_eq!(listed, vec!["a/b/1", "a/b/2"]);

        let err = driver
            .list(BUCKET, Some(Utf8Path::new("a/missing")))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn write_then_read_at_offset() {
        let (_dir, driver) = driver();
        let key = Utf8Path::new("blobs/data");

        let mut writer = driver.writer(BUCKET, key, false).await.unwrap();
        writer.write_all(b"0123456789").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = driver.reader(BUCKET, key, 7).await.unwrap();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "789");

        assert_eq!(driver.metadata(BUCKET, key).await.unwrap().size, 10);
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let (_dir, driver) = driver();
        let err = driver
            .get_content(BUCKET, Utf8Path::new("../outside"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn delete_directory() {
        let (_dir, driver) = driver();
        for key in ["u/1/info", "u/1/chunk-0"] {
            driver
                .put_content(BUCKET, Utf8Path::new(key), Bytes::new())
                .await
                .unwrap();
        }

        driver.delete(BUCKET, Utf8Path::new("u/1")).await.unwrap();
        let err = driver
            .metadata(BUCKET, Utf8Path::new("u/1/info"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
