//! Object storage backends shared by the cursor store and the spool source.

pub mod object_store;
#[cfg(feature = "s3")]
pub mod s3;

pub use object_store::{InMemoryObjectStore, LocalFsObjectStore, ObjectMeta, ObjectStore};
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;
