//! Mapping from registry objects to storage keys.
//!
//! ```text
//! repositories/<name>/_manifests/<id>
//! repositories/<name>/_tags/<tag>
//! repositories/<name>/_uploads/<session>/info
//! repositories/<name>/_uploads/<session>/chunk-<index>
//! repositories/<name>/_uploads/<session>/staging-<attempt>
//! blobs/<digest>/descriptor
//! blobs/<digest>/<subhash>
//! ```
//!
//! Names never contain a component starting with `_`, and digests are
//! always hex, so no two objects share a key. Inputs are expected to be
//! normalized already; nothing here touches storage.

use camino::Utf8PathBuf;

const REPOSITORIES: &str = "repositories";
const BLOBS: &str = "blobs";
const MANIFESTS: &str = "_manifests";
const TAGS: &str = "_tags";
const UPLOADS: &str = "_uploads";
const UPLOAD_INFO: &str = "info";
const BLOB_DESCRIPTOR: &str = "descriptor";

/// File name prefix shared by every chunk of an upload session.
pub const CHUNK_PREFIX: &str = "chunk-";

const STAGING_PREFIX: &str = "staging-";

/// A storage location for one registry object, or one namespace of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSpec<'a> {
    /// A manifest, by image name and manifest id.
    Manifest {
        /// Image name
        name: &'a str,
        /// Manifest id
        id: &'a str,
    },
    /// Every manifest stored under an image name.
    Manifests {
        /// Image name
        name: &'a str,
    },
    /// A tag pointer.
    Tag {
        /// Image name
        name: &'a str,
        /// Tag name
        tag: &'a str,
    },
    /// Every tag under an image name.
    Tags {
        /// Image name
        name: &'a str,
    },
    /// The descriptor of a blob.
    BlobDescriptor {
        /// Blob digest
        digest: &'a str,
    },
    /// One content segment of a blob.
    BlobChunk {
        /// Blob digest
        digest: &'a str,
        /// Digest of the segment
        subhash: &'a str,
    },
    /// Everything belonging to an upload session.
    Upload {
        /// Image name
        name: &'a str,
        /// Session id
        session: &'a str,
    },
    /// The declared size and target of an upload session.
    UploadInfo {
        /// Image name
        name: &'a str,
        /// Session id
        session: &'a str,
    },
    /// One chunk of an upload session.
    UploadChunk {
        /// Image name
        name: &'a str,
        /// Session id
        session: &'a str,
        /// Position of the chunk in the upload
        index: u32,
    },
    /// The concatenated chunks of one completion attempt, before they are
    /// promoted into a blob.
    UploadStaging {
        /// Image name
        name: &'a str,
        /// Session id
        session: &'a str,
        /// Id of the completion attempt
        attempt: &'a str,
    },
}

impl PathSpec<'_> {
    /// The storage key for this object.
    pub fn path(&self) -> Utf8PathBuf {
        let mut path = Utf8PathBuf::new();
        match *self {
            PathSpec::Manifest { name, id } => {
                path.extend([REPOSITORIES, name, MANIFESTS, id]);
            }
            PathSpec::Manifests { name } => {
                path.extend([REPOSITORIES, name, MANIFESTS]);
            }
            PathSpec::Tag { name, tag } => {
                path.extend([REPOSITORIES, name, TAGS, tag]);
            }
            PathSpec::Tags { name } => {
                path.extend([REPOSITORIES, name, TAGS]);
            }
            PathSpec::BlobDescriptor { digest } => {
                path.extend([BLOBS, digest, BLOB_DESCRIPTOR]);
            }
            PathSpec::BlobChunk { digest, subhash } => {
                path.extend([BLOBS, digest, subhash]);
            }
            PathSpec::Upload { name, session } => {
                path.extend([REPOSITORIES, name, UPLOADS, session]);
            }
            PathSpec::UploadInfo { name, session } => {
                path.extend([REPOSITORIES, name, UPLOADS, session, UPLOAD_INFO]);
            }
            PathSpec::UploadChunk {
                name,
                session,
                index,
            } => {
                path.extend([REPOSITORIES, name, UPLOADS, session]);
                path.push(chunk_name(index));
            }
            PathSpec::UploadStaging {
                name,
                session,
                attempt,
            } => {
                path.extend([REPOSITORIES, name, UPLOADS, session]);
                path.push(format!("{STAGING_PREFIX}{attempt}"));
            }
        }
        path
    }
}

/// Chunk file names are zero padded so they also sort in index order.
fn chunk_name(index: u32) -> String {
    format!("{CHUNK_PREFIX}{index:010}")
}

/// Recover the index from a chunk file name.
pub fn chunk_index(file_name: &str) -> Option<u32> {
    file_name.strip_prefix(CHUNK_PREFIX)?.parse().ok()
}
