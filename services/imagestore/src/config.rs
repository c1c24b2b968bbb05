//! Image store configuration.

use serde::Deserialize;
use storage::{StorageConfig, StorageError};

use crate::searcher::{ImageSearcher, DEFAULT_BUCKET};

/// Where the image store keeps its data.
///
/// ```toml
/// bucket = "registry"
///
/// [storage.local]
/// path = "/var/lib/imagestore"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Bucket holding every registry object.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Backing store.
    pub storage: StorageConfig,
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_owned()
}

impl RegistryConfig {
    /// Build the configured backing store and an [`ImageSearcher`] over it.
    #[tracing::instrument(skip(self), fields(bucket = %self.bucket))]
    pub fn build(self) -> Result<ImageSearcher, StorageError> {
        let storage = self.storage.build()?;
        Ok(ImageSearcher::new(storage.bucket(self.bucket)))
    }
}
