//! Object store abstraction
//!
//! The transfer engine talks to both buckets through [`ObjectStore`]. Two
//! implementations ship with the crate:
//!
//! - [`S3Store`]: AWS S3 and S3-compatible services (MinIO, LocalStack) through
//!   `aws-sdk-s3`
//! - [`MemoryStore`]: an in-process store with fault injection, used by tests
//!
//! Implementations report raw outcomes only. Classifying a failure into the
//! transfer error taxonomy is the caller's job, so a missing upload id or entity tag
//! comes back as `None` rather than as an error.

pub mod error;
pub mod memory;

#[cfg(feature = "s3-native")]
pub mod s3;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;

#[cfg(feature = "s3-native")]
pub use s3::S3Store;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// A stream of body chunks as delivered by the store
pub type ByteStream = BoxStream<'static, StoreResult<Bytes>>;

/// Metadata returned by a HEAD request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectHead {
    /// Value of `Content-Length`, if the store sent one
    pub content_length: Option<u64>,
}

/// A part reference submitted when completing a multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Operations the transfer engine needs from an object store
///
/// Keys are store-relative; the bucket is part of the implementation's
/// configuration.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch object metadata without the body
    async fn head_object(&self, key: &str) -> StoreResult<ObjectHead>;

    /// Read the inclusive byte range `start..=end`
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StoreResult<ByteStream>;

    /// Read the whole object sequentially
    async fn get_object(&self, key: &str) -> StoreResult<ByteStream>;

    /// Start a multipart upload, returning the upload id if the store sent one
    async fn create_multipart_upload(&self, key: &str) -> StoreResult<Option<String>>;

    /// Upload one part, returning its entity tag if the store sent one
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StoreResult<Option<String>>;

    /// Assemble the uploaded parts into the final object
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<()>;

    /// Discard a multipart upload and its stored parts
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StoreResult<()>;

    /// Single-shot upload
    async fn put_object(&self, key: &str, body: Bytes) -> StoreResult<()>;
}
