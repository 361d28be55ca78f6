//! ss-storage: blob upload/download used when a relay transfer cannot open a
//! direct channel

pub mod blob;
pub mod operator;

pub use blob::{BlobStore, OperatorBlobStore};
pub use operator::{fallback_operator, BucketCredentials};
