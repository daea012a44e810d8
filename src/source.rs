//! Source reader
//!
//! Read-only access to the source bucket: object size, inclusive byte ranges and
//! whole-object streams. Store failures are classified into the source variants of
//! [`TransferError`].

use crate::error::{Result, TransferError};
use crate::store::{ByteStream, ObjectStore, StoreError};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;
use tracing::debug;

/// Reads objects from the source store
#[derive(Clone)]
pub struct SourceReader {
    store: Arc<dyn ObjectStore>,
}

impl SourceReader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Total size of the object in bytes
    ///
    /// Metadata only; no body is transferred.
    pub async fn probe_size(&self, key: &str) -> Result<u64> {
        let head = self
            .store
            .head_object(key)
            .await
            .map_err(|source| TransferError::SizeUnavailable {
                key: key.to_string(),
                source,
            })?;

        let size = head
            .content_length
            .ok_or_else(|| TransferError::SizeUnavailable {
                key: key.to_string(),
                source: StoreError::Incomplete("response carried no Content-Length".to_string()),
            })?;

        debug!(key, size, "Probed source object");
        Ok(size)
    }

    /// Stream the inclusive byte range `start..=end`
    pub async fn read_range(&self, key: &str, start: u64, end: u64) -> Result<ByteStream> {
        self.store
            .get_range(key, start, end)
            .await
            .map_err(|source| TransferError::RangeReadFailed {
                key: key.to_string(),
                start,
                end,
                source,
            })
    }

    /// Read the inclusive byte range `start..=end` into one buffer
    ///
    /// Fails when the body breaks off or its length differs from the range.
    pub async fn fetch_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes> {
        let range_error = |source: StoreError| TransferError::RangeReadFailed {
            key: key.to_string(),
            start,
            end,
            source,
        };

        let expected = end - start + 1;
        let mut stream = self.read_range(key, start, end).await?;
        let mut buffer = BytesMut::with_capacity(expected as usize);

        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk.map_err(range_error)?);
        }

        if buffer.len() as u64 != expected {
            return Err(range_error(StoreError::Incomplete(format!(
                "expected {} bytes, received {}",
                expected,
                buffer.len()
            ))));
        }

        Ok(buffer.freeze())
    }

    /// Stream the whole object sequentially
    ///
    /// Only the request itself is checked here; mid-stream failures surface from the
    /// stream and are classified by whoever consumes it.
    pub async fn read_all(&self, key: &str) -> Result<ByteStream> {
        self.store
            .get_object(key)
            .await
            .map_err(|source| TransferError::DownloadFailed {
                key: key.to_string(),
                source,
            })
    }
}
