//! Content-addressed blobs shared by every image name.

use camino::{Utf8Path, Utf8PathBuf};
use storage::{Reader, StorageBucket};
use tokio::io::AsyncWriteExt as _;

use crate::error::{RegistryError, RegistryResult, StorageResultExt as _};
use crate::paths::PathSpec;
use crate::reference::Digest;
use crate::schema::BlobDescriptor;

/// Resolves blob digests to storage and reads blob content.
#[derive(Debug, Clone)]
pub struct BlobStore {
    storage: StorageBucket,
}

impl BlobStore {
    pub(crate) fn new(storage: StorageBucket) -> Self {
        Self { storage }
    }

    /// Storage key of the descriptor for `digest`.
    ///
    /// Only checks the digest syntax. Whether the blob exists is a
    /// separate question, see [`BlobStore::exists`].
    pub fn descriptor_path(&self, digest: &str) -> RegistryResult<Utf8PathBuf> {
        let digest = Digest::parse(digest)?;
        Ok(PathSpec::BlobDescriptor {
            digest: digest.as_str(),
        }
        .path())
    }

    /// Whether a complete blob is stored for `digest`.
    #[tracing::instrument(skip(self))]
    pub async fn exists(&self, digest: &str) -> RegistryResult<bool> {
        let path = self.descriptor_path(digest)?;
        self.storage
            .exists(&path)
            .await
            .context("checking blob descriptor")
    }

    /// Load the descriptor for `digest`.
    #[tracing::instrument(skip(self))]
    pub async fn descriptor(&self, digest: &str) -> RegistryResult<BlobDescriptor> {
        let path = self.descriptor_path(digest)?;
        let data = self
            .storage
            .get_content(&path)
            .await
            .or_missing(
                || RegistryError::BlobNotFound(digest.to_owned()),
                "reading blob descriptor",
            )?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Open one content segment of a blob, starting `offset` bytes in.
    ///
    /// Blobs are shared between image names, so `name` only checks the
    /// caller addressed a valid image.
    #[tracing::instrument(skip(self))]
    pub async fn chunk_reader(
        &self,
        name: &str,
        digest: &str,
        subhash: &str,
        offset: u64,
    ) -> RegistryResult<Box<Reader<'static>>> {
        crate::reference::normalize_name(name)?;
        let digest = Digest::parse(digest)?;
        let subhash = Digest::parse(subhash)?;
        let path = PathSpec::BlobChunk {
            digest: digest.as_str(),
            subhash: subhash.as_str(),
        }
        .path();

        self.storage.reader(&path, offset).await.or_missing(
            || RegistryError::BlobNotFound(digest.to_string()),
            "opening blob chunk",
        )
    }

    /// Copy `sources` in order into a single segment of the blob `digest`,
    /// then record its descriptor.
    ///
    /// The descriptor is written last, so a blob is only visible once its
    /// content is in place. Promoting a digest which is already stored
    /// returns the existing descriptor and copies nothing.
    #[tracing::instrument(skip(self, sources))]
    pub(crate) async fn promote(
        &self,
        digest: &Digest,
        size: u64,
        media_type: &str,
        sources: &[Utf8PathBuf],
    ) -> RegistryResult<BlobDescriptor> {
        match self.descriptor(digest.as_str()).await {
            Ok(existing) => {
                tracing::debug!(%digest, "blob already stored");
                return Ok(existing);
            }
            Err(RegistryError::BlobNotFound(_)) => {}
            Err(error) => return Err(error),
        }

        let target = PathSpec::BlobChunk {
            digest: digest.as_str(),
            subhash: digest.as_str(),
        }
        .path();

        let mut writer = self
            .storage
            .writer(&target, false)
            .await
            .context("opening blob for writing")?;

        for source in sources {
            self.copy_into(source, &mut writer).await?;
        }
        writer.shutdown().await?;

        let descriptor = BlobDescriptor {
            digest: digest.clone(),
            size,
            media_type: media_type.to_owned(),
        };
        self.storage
            .put_content(
                &PathSpec::BlobDescriptor {
                    digest: digest.as_str(),
                }
                .path(),
                serde_json::to_vec(&descriptor)?,
            )
            .await
            .context("writing blob descriptor")?;

        tracing::debug!(%digest, size, "blob promoted");
        Ok(descriptor)
    }

    async fn copy_into(
        &self,
        source: &Utf8Path,
        writer: &mut Box<storage::Writer<'static>>,
    ) -> RegistryResult<u64> {
        self.storage
            .download(source, writer)
            .await
            .context("copying upload chunk")
    }
}

#[cfg(test)]
mod tests {
    use storage::{MemoryStorage, Storage};
    use tokio::io::AsyncReadExt as _;

    use super::*;

    fn store() -> BlobStore {
        BlobStore::new(Storage::new(MemoryStorage::new()).bucket("registry"))
    }

    #[tokio::test]
    async fn missing_blob() {
        let blobs = store();
        let digest = Digest::of(b"nothing");

        assert!(!blobs.exists(digest.as_str()).await.unwrap());
        assert!(matches!(
            blobs.descriptor(digest.as_str()).await,
            Err(RegistryError::BlobNotFound(_))
        ));
        assert!(matches!(
            blobs
                .chunk_reader("app", digest.as_str(), digest.as_str(), 0)
                .await
                .err()
                .unwrap(),
            RegistryError::BlobNotFound(_)
        ));
    }

    #[tokio::test]
    async fn promote_joins_sources() {
        let blobs = store();
        let sources = [Utf8PathBuf::from("staging/1"), Utf8PathBuf::from("staging/2")];
        blobs.storage.put_content(&sources[0], "hello ").await.unwrap();
        blobs.storage.put_content(&sources[1], "world").await.unwrap();

        let digest = Digest::of(b"hello world");
        let descriptor = blobs
            .promote(&digest, 11, "text/plain", &sources)
            .await
            .unwrap();
        assert_eq!(descriptor.size, 11);
        assert!(blobs.exists(&format!("sha256:{digest}")).await.unwrap());

        let mut reader = blobs
            .chunk_reader("app", digest.as_str(), digest.as_str(), 6)
            .await
            .unwrap();
        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "world");

        // Promotion of a stored digest keeps the existing descriptor.
        let again = blobs
            .promote(&digest, 11, "application/other", &[])
            .await
            .unwrap();
        assert_eq!(again, descriptor);
    }

    #[test]
    fn descriptor_path_checks_digest() {
        let blobs = store();
        assert!(matches!(
            blobs.descriptor_path("abc"),
            Err(RegistryError::InvalidDigest(_))
        ));
        let digest = Digest::of(b"x");
        assert_eq!(
            blobs.descriptor_path(digest.as_str()).unwrap(),
            Utf8PathBuf::from(format!("blobs/{digest}/descriptor"))
        );
    }
}
