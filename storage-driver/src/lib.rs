//! # Storage driver contract
//!
//! The narrow capability set a backing content store must provide:
//! whole-object put/get, listing, stat, offset reads, streamed writes and
//! recursive delete, all addressed by `(bucket, key)`.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::StorageError;
pub use error::StorageErrorBuilder;
pub use error::StorageErrorKind;
