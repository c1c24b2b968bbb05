//! Error types for the image store

use http::StatusCode;
use storage::StorageError;

/// Result type for image store operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Broad categories of failure, for callers which need to pick a protocol
/// status without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A manifest, tag, blob or upload session does not exist.
    NotFound,
    /// A truncated digest matched more than one manifest.
    Ambiguous,
    /// Stored state contradicts an invariant the store maintains.
    Internal,
    /// Content does not match the digest, size or id it claims.
    Integrity,
    /// Input is malformed.
    Validation,
    /// The operation is not supported by this store.
    Unimplemented,
    /// The backing store failed.
    Storage,
}

/// Error types for image store operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Tag not found
    #[error("tag '{tag}' not found in {name}")]
    TagNotFound {
        /// Image name
        name: String,
        /// Requested tag
        tag: String,
    },

    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Upload session not found
    #[error("upload session not found: {0}")]
    UploadNotFound(String),

    /// A parent named by a manifest has not been stored
    #[error("parent manifest missing: {0}")]
    ParentNotFound(String),

    /// A truncated digest matched more than one manifest
    #[error("digest is ambiguous: {0}")]
    Ambiguous(String),

    /// Internal inconsistency
    #[error("internal error: {0}")]
    Internal(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// A tag points at something which is not a manifest id
    #[error("unexpected digest '{id}' for tag '{tag}'")]
    TagIntegrity {
        /// Content of the tag
        id: String,
        /// The tag
        tag: String,
    },

    /// Uploaded byte count disagrees with the declared size
    #[error("blob size ({actual}) mismatch, expecting {expected}")]
    SizeMismatch {
        /// Bytes uploaded
        actual: u64,
        /// Bytes declared when the upload was prepared
        expected: u64,
    },

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid tag format
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Malformed upload session id or location
    #[error("invalid upload session: {0}")]
    InvalidUpload(String),

    /// Not implemented
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),

    /// Stored document could not be decoded, or a document could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage error
    ///
    /// The message names the operation, not the storage key; the full
    /// storage error is available as the source.
    #[error("storage error while {context}")]
    Storage {
        /// What the store was doing
        context: String,
        /// The underlying driver error
        #[source]
        source: StorageError,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Wrap a storage error with what the store was doing at the time.
    pub fn storage(context: impl Into<String>) -> impl FnOnce(StorageError) -> RegistryError {
        let context = context.into();
        move |source| RegistryError::Storage { context, source }
    }

    /// The category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::ManifestNotFound(_)
            | RegistryError::TagNotFound { .. }
            | RegistryError::BlobNotFound(_)
            | RegistryError::UploadNotFound(_)
            | RegistryError::ParentNotFound(_) => ErrorKind::NotFound,
            RegistryError::Ambiguous(_) => ErrorKind::Ambiguous,
            RegistryError::Internal(_) | RegistryError::Serialization(_) => ErrorKind::Internal,
            RegistryError::DigestMismatch { .. }
            | RegistryError::TagIntegrity { .. }
            | RegistryError::SizeMismatch { .. } => ErrorKind::Integrity,
            RegistryError::InvalidManifest(_)
            | RegistryError::InvalidDigest(_)
            | RegistryError::InvalidTag(_)
            | RegistryError::InvalidRepository(_)
            | RegistryError::InvalidUpload(_) => ErrorKind::Validation,
            RegistryError::Unimplemented(_) => ErrorKind::Unimplemented,
            RegistryError::Storage { .. } | RegistryError::Io(_) => ErrorKind::Storage,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::ManifestNotFound(_)
            | RegistryError::TagNotFound { .. }
            | RegistryError::BlobNotFound(_)
            | RegistryError::UploadNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::ParentNotFound(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::SizeMismatch { .. }
            | RegistryError::InvalidManifest(_)
            | RegistryError::InvalidDigest(_)
            | RegistryError::InvalidTag(_)
            | RegistryError::InvalidRepository(_)
            | RegistryError::InvalidUpload(_) => StatusCode::BAD_REQUEST,
            RegistryError::Ambiguous(_) => StatusCode::CONFLICT,
            RegistryError::Unimplemented(_) => StatusCode::NOT_IMPLEMENTED,
            RegistryError::Storage { source, .. } if source.is_client_fault() => {
                StatusCode::BAD_REQUEST
            }
            RegistryError::Internal(_)
            | RegistryError::TagIntegrity { .. }
            | RegistryError::Serialization(_)
            | RegistryError::Storage { .. }
            | RegistryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::ManifestNotFound(_) | RegistryError::TagNotFound { .. } => {
                "MANIFEST_UNKNOWN"
            }
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::UploadNotFound(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::ParentNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::InvalidDigest(_) | RegistryError::DigestMismatch { .. } => {
                "DIGEST_INVALID"
            }
            RegistryError::SizeMismatch { .. } => "SIZE_INVALID",
            RegistryError::InvalidManifest(_) => "MANIFEST_INVALID",
            RegistryError::InvalidTag(_) => "TAG_INVALID",
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::InvalidUpload(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::Unimplemented(_) => "UNSUPPORTED",
            RegistryError::Ambiguous(_)
            | RegistryError::Internal(_)
            | RegistryError::TagIntegrity { .. }
            | RegistryError::Serialization(_)
            | RegistryError::Storage { .. }
            | RegistryError::Io(_) => "UNKNOWN",
        }
    }
}

/// Conversions from storage results which single out a missing key.
pub(crate) trait StorageResultExt<T> {
    /// Map a storage `NotFound` to `missing()`, and wrap any other storage
    /// error with `context`.
    fn or_missing<F>(self, missing: F, context: &str) -> RegistryResult<T>
    where
        F: FnOnce() -> RegistryError;

    /// Wrap a storage error with `context`.
    fn context(self, context: &str) -> RegistryResult<T>;
}

impl<T> StorageResultExt<T> for Result<T, StorageError> {
    fn or_missing<F>(self, missing: F, context: &str) -> RegistryResult<T>
    where
        F: FnOnce() -> RegistryError,
    {
        match self {
            Ok(value) => Ok(value),
            Err(error) if error.is_not_found() => Err(missing()),
            Err(error) => Err(RegistryError::storage(context)(error)),
        }
    }

    fn context(self, context: &str) -> RegistryResult<T> {
        self.map_err(RegistryError::storage(context))
    }
}
