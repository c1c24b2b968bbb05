//! The operations a registry transport calls into.

use std::fmt;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use storage::{Reader, Storage, StorageBucket, Writer};

use crate::blob::BlobStore;
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::ManifestStore;
use crate::schema::{BlobDescriptor, ImageManifest, UploadInfo};
use crate::upload::{Cleanup, UploadLocation, UploadSessions};

/// Default bucket holding every registry object.
pub const DEFAULT_BUCKET: &str = "registry";

/// Everything a registry transport needs from the image store.
///
/// Operations have no timeouts of their own. Dropping a returned future
/// abandons the operation, so callers wrap calls in `tokio::time::timeout`
/// or similar where they need a deadline.
#[async_trait]
pub trait Searcher: fmt::Debug + Send + Sync {
    /// Search images by free text. Not supported.
    async fn find_images(&self, query: &str) -> RegistryResult<Vec<ImageManifest>>;

    /// Fetch a manifest by tag, full id or unambiguous id prefix.
    async fn get_manifest(&self, name: &str, reference: &str) -> RegistryResult<ImageManifest>;

    /// Store a manifest, tagging it when `reference` is a tag.
    async fn put_manifest(
        &self,
        name: &str,
        reference: &str,
        manifest: &ImageManifest,
    ) -> RegistryResult<()>;

    /// Every tag under `name`.
    async fn list_tags(&self, name: &str) -> RegistryResult<Vec<String>>;

    /// Storage key of a blob's descriptor.
    fn blob_descriptor_path(&self, digest: &str) -> RegistryResult<Utf8PathBuf>;

    /// Load a complete blob's descriptor.
    async fn blob_descriptor(&self, digest: &str) -> RegistryResult<BlobDescriptor>;

    /// Whether a complete blob is stored.
    async fn blob_exists(&self, digest: &str) -> RegistryResult<bool>;

    /// Read one content segment of a blob from `offset`.
    async fn blob_chunk_reader(
        &self,
        name: &str,
        digest: &str,
        subhash: &str,
        offset: u64,
    ) -> RegistryResult<Box<Reader<'static>>>;

    /// Start a resumable upload.
    async fn prepare_blob_upload(
        &self,
        name: &str,
        info: &UploadInfo,
    ) -> RegistryResult<UploadLocation>;

    /// Bytes received by an upload so far.
    async fn uploaded_size(&self, name: &str, session: &str) -> RegistryResult<u64>;

    /// Abandon an upload; its data is removed in the background.
    async fn cancel_upload(&self, name: &str, session: &str) -> RegistryResult<Cleanup>;

    /// Finish an upload, promoting it into a blob.
    async fn complete_upload(&self, name: &str, session: &str) -> RegistryResult<BlobDescriptor>;

    /// Open chunk `index` of an upload for writing.
    async fn chunk_writer(
        &self,
        name: &str,
        session: &str,
        index: u32,
    ) -> RegistryResult<Box<Writer<'static>>>;
}

/// [`Searcher`] over a single storage bucket.
#[derive(Debug, Clone)]
pub struct ImageSearcher {
    manifests: ManifestStore,
    blobs: BlobStore,
    uploads: UploadSessions,
}

impl ImageSearcher {
    /// Serve images from `bucket`.
    pub fn new(bucket: StorageBucket) -> Self {
        let blobs = BlobStore::new(bucket.clone());
        Self {
            manifests: ManifestStore::new(bucket.clone(), blobs.clone()),
            uploads: UploadSessions::new(bucket, blobs.clone()),
            blobs,
        }
    }

    /// Configure a searcher step by step.
    pub fn builder() -> ImageSearcherBuilder {
        ImageSearcherBuilder::default()
    }

    /// Manifest and tag operations.
    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Blob operations.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Upload session operations.
    pub fn uploads(&self) -> &UploadSessions {
        &self.uploads
    }
}

/// Builder for [`ImageSearcher`].
#[derive(Debug, Default)]
pub struct ImageSearcherBuilder {
    storage: Option<Storage>,
    bucket: Option<String>,
}

impl ImageSearcherBuilder {
    /// Set the storage backend
    pub fn storage(mut self, storage: impl Into<Storage>) -> Self {
        self.storage = Some(storage.into());
        self
    }

    /// Set the bucket name, [`DEFAULT_BUCKET`] if unset.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Build the searcher. Fails if no storage was set.
    pub fn build(self) -> RegistryResult<ImageSearcher> {
        let storage = self.storage.ok_or_else(|| {
            RegistryError::Internal("image searcher has no storage backend".into())
        })?;
        let bucket = self.bucket.unwrap_or_else(|| DEFAULT_BUCKET.to_owned());
        tracing::debug!(driver = storage.name(), %bucket, "image searcher ready");
        Ok(ImageSearcher::new(storage.bucket(bucket)))
    }
}

#[async_trait]
impl Searcher for ImageSearcher {
    async fn find_images(&self, _query: &str) -> RegistryResult<Vec<ImageManifest>> {
        tracing::debug!("image search requested");
        Err(RegistryError::Unimplemented("image search"))
    }

    async fn get_manifest(&self, name: &str, reference: &str) -> RegistryResult<ImageManifest> {
        self.manifests.get(name, reference).await
    }

    async fn put_manifest(
        &self,
        name: &str,
        reference: &str,
        manifest: &ImageManifest,
    ) -> RegistryResult<()> {
        self.manifests.put(name, reference, manifest).await
    }

    async fn list_tags(&self, name: &str) -> RegistryResult<Vec<String>> {
        self.manifests.tags(name).await
    }

    fn blob_descriptor_path(&self, digest: &str) -> RegistryResult<Utf8PathBuf> {
        self.blobs.descriptor_path(digest)
    }

    async fn blob_descriptor(&self, digest: &str) -> RegistryResult<BlobDescriptor> {
        self.blobs.descriptor(digest).await
    }

    async fn blob_exists(&self, digest: &str) -> RegistryResult<bool> {
        self.blobs.exists(digest).await
    }

    async fn blob_chunk_reader(
        &self,
        name: &str,
        digest: &str,
        subhash: &str,
        offset: u64,
    ) -> RegistryResult<Box<Reader<'static>>> {
        self.blobs.chunk_reader(name, digest, subhash, offset).await
    }

    async fn prepare_blob_upload(
        &self,
        name: &str,
        info: &UploadInfo,
    ) -> RegistryResult<UploadLocation> {
        self.uploads.prepare(name, info).await
    }

    async fn uploaded_size(&self, name: &str, session: &str) -> RegistryResult<u64> {
        self.uploads.uploaded_size(name, session).await
    }

    async fn cancel_upload(&self, name: &str, session: &str) -> RegistryResult<Cleanup> {
        self.uploads.cancel(name, session).await
    }

    async fn complete_upload(&self, name: &str, session: &str) -> RegistryResult<BlobDescriptor> {
        self.uploads.complete(name, session).await
    }

    async fn chunk_writer(
        &self,
        name: &str,
        session: &str,
        index: u32,
    ) -> RegistryResult<Box<Writer<'static>>> {
        self.uploads.chunk_writer(name, session, index).await
    }
}
