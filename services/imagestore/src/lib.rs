//! # Image store
//!
//! Storage core of a container image registry: manifests with lineage,
//! tags, content-addressed blobs, and resumable chunked uploads, all kept
//! in a single bucket of a [`storage::Storage`] backend.
//!
//! No state is held in memory between calls, so any number of
//! [`ImageSearcher`]s may share one backing store.
//!
//! ## Example
//!
//! ```no_run
//! use imagestore::{ImageSearcher, Searcher};
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let searcher = ImageSearcher::builder()
//!     .storage(MemoryStorage::new())
//!     .bucket("registry")
//!     .build()?;
//!
//! let tags = searcher.list_tags("library/ubuntu").await?;
//! # Ok(())
//! # }
//! ```

mod blob;
mod config;
mod error;
mod manifest;
pub mod paths;
pub mod reference;
mod schema;
mod searcher;
mod upload;

pub use blob::BlobStore;
pub use config::RegistryConfig;
pub use error::{ErrorKind, RegistryError, RegistryResult};
pub use manifest::ManifestStore;
pub use reference::{Digest, Reference};
pub use schema::{BlobDescriptor, ImageManifest, UploadInfo, DEFAULT_BLOB_MEDIA_TYPE};
pub use searcher::{ImageSearcher, ImageSearcherBuilder, Searcher, DEFAULT_BUCKET};
pub use upload::{Cleanup, UploadLocation, UploadSessions};
