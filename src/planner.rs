//! Chunk planning
//!
//! Three ways of dividing an object into multipart parts:
//!
//! - **Range plan**: the size is known up front, parts are inclusive byte ranges read
//!   from the source independently
//! - **Buffer fill**: the object arrives as a stream of arbitrarily sized chunks that
//!   are regrouped into fixed-size parts
//! - **Slice plan**: the object is already in memory and is cut into zero-copy slices
//!
//! Every plan numbers parts from 1, contiguously, in offset order.

use crate::error::{Result, TransferError};
use crate::store::ByteStream;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};

/// S3 rejects part numbers above this
pub const MAX_PARTS: u64 = 10_000;

/// What a part carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartPayload {
    /// Inclusive byte range of the source object
    Range { start: u64, end: u64 },
    /// Bytes already in memory
    Buffer(Bytes),
}

/// One planned part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 1-based part number
    pub part_number: u32,
    pub payload: PartPayload,
}

impl PartDescriptor {
    /// Number of bytes in the part
    pub fn len(&self) -> u64 {
        match &self.payload {
            PartPayload::Range { start, end } => end - start + 1,
            PartPayload::Buffer(bytes) => bytes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Number of parts needed for `size` bytes in parts of `part_size`
pub fn part_count(size: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    size.div_ceil(part_size)
}

fn check_plan(size: u64, part_size: u64) -> Result<u64> {
    if part_size == 0 {
        return Err(TransferError::InvalidPlan(
            "part size must be greater than zero".to_string(),
        ));
    }

    let count = part_count(size, part_size);
    if count > MAX_PARTS {
        return Err(TransferError::InvalidPlan(format!(
            "{} bytes in parts of {} needs {} parts, the limit is {}",
            size, part_size, count, MAX_PARTS
        )));
    }
    Ok(count)
}

/// Plan `ceil(size / part_size)` contiguous inclusive ranges covering `[0, size)`
///
/// The last range may be shorter. An empty object yields no parts.
pub fn plan_ranges(size: u64, part_size: u64) -> Result<Vec<PartDescriptor>> {
    let count = check_plan(size, part_size)?;

    Ok((0..count)
        .map(|index| {
            let start = index * part_size;
            let end = (start + part_size).min(size) - 1;
            PartDescriptor {
                part_number: index as u32 + 1,
                payload: PartPayload::Range { start, end },
            }
        })
        .collect())
}

/// Cut an in-memory object into slices of `part_size`
///
/// Same offsets as [`plan_ranges`]; the slices share the blob's allocation.
pub fn plan_slices(blob: &Bytes, part_size: u64) -> Result<Vec<PartDescriptor>> {
    let ranges = plan_ranges(blob.len() as u64, part_size)?;

    Ok(ranges
        .into_iter()
        .map(|part| {
            let payload = match part.payload {
                PartPayload::Range { start, end } => {
                    PartPayload::Buffer(blob.slice(start as usize..=end as usize))
                }
                buffer => buffer,
            };
            PartDescriptor {
                part_number: part.part_number,
                payload,
            }
        })
        .collect())
}

/// Regroups a chunk stream into parts of exactly `capacity` bytes
///
/// Each emitted part is a full buffer, except possibly the last which holds the
/// residual bytes at end of stream. Upstream chunks larger than the free space are
/// split; the tail is kept for the next part. After a read failure the planner is
/// fused and yields nothing more.
pub struct BufferFill {
    key: String,
    stream: ByteStream,
    capacity: usize,
    buffer: BytesMut,
    pending: Option<Bytes>,
    next_part: u32,
    done: bool,
}

impl BufferFill {
    pub fn new(key: impl Into<String>, stream: ByteStream, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TransferError::InvalidPlan(
                "buffer capacity must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            key: key.into(),
            stream,
            capacity,
            buffer: BytesMut::with_capacity(capacity),
            pending: None,
            next_part: 1,
            done: false,
        })
    }

    fn emit(&mut self) -> Result<PartDescriptor> {
        let part_number = self.next_part;
        if u64::from(part_number) > MAX_PARTS {
            self.done = true;
            return Err(TransferError::InvalidPlan(format!(
                "stream of {} exceeds {} parts of {} bytes",
                self.key, MAX_PARTS, self.capacity
            )));
        }

        self.next_part += 1;
        let data = self.buffer.split().freeze();
        self.buffer.reserve(self.capacity);

        Ok(PartDescriptor {
            part_number,
            payload: PartPayload::Buffer(data),
        })
    }

    /// Pull upstream chunks until a part is ready
    ///
    /// Returns `Ok(None)` once the stream is exhausted and every byte was emitted.
    pub async fn next_part(&mut self) -> Result<Option<PartDescriptor>> {
        if self.done {
            return Ok(None);
        }

        loop {
            let chunk = match self.pending.take() {
                Some(chunk) => chunk,
                None => match self.stream.next().await {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(source)) => {
                        self.done = true;
                        return Err(TransferError::DownloadFailed {
                            key: self.key.clone(),
                            source,
                        });
                    }
                    None => {
                        self.done = true;
                        if self.buffer.is_empty() {
                            return Ok(None);
                        }
                        return self.emit().map(Some);
                    }
                },
            };

            let free = self.capacity - self.buffer.len();
            if chunk.len() < free {
                self.buffer.extend_from_slice(&chunk);
                continue;
            }

            // Fill exactly to capacity and keep the tail for the next part
            let mut chunk = chunk;
            let tail = chunk.split_off(free);
            self.buffer.extend_from_slice(&chunk);
            if !tail.is_empty() {
                self.pending = Some(tail);
            }
            return self.emit().map(Some);
        }
    }

    /// Turn the planner into a stream of parts
    pub fn into_stream(self) -> BoxStream<'static, Result<PartDescriptor>> {
        futures::stream::try_unfold(self, |mut fill| async move {
            let part = fill.next_part().await?;
            Ok::<_, TransferError>(part.map(|part| (part, fill)))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use futures::TryStreamExt;

    fn chunks_of(sizes: &[usize]) -> (ByteStream, Vec<u8>) {
        let mut all = Vec::new();
        let mut chunks = Vec::new();
        let mut value = 0u8;
        for size in sizes {
            let chunk: Vec<u8> = (0..*size)
                .map(|_| {
                    value = value.wrapping_add(1);
                    value
                })
                .collect();
            all.extend_from_slice(&chunk);
            chunks.push(Ok(Bytes::from(chunk)));
        }
        (futures::stream::iter(chunks).boxed(), all)
    }

    #[test]
    fn test_plan_ranges_round_trip_sizes() {
        let parts = plan_ranges(250, 100).unwrap();
        let ranges: Vec<(u32, u64, u64)> = parts
            .iter()
            .map(|p| match p.payload {
                PartPayload::Range { start, end } => (p.part_number, start, end),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ranges, vec![(1, 0, 99), (2, 100, 199), (3, 200, 249)]);
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![100, 100, 50]
        );
    }

    #[test]
    fn test_plan_ranges_is_complete() {
        for (size, part_size) in [(1, 1), (7, 3), (9, 3), (1000, 7), (5, 100), (4096, 1024)] {
            let parts = plan_ranges(size, part_size).unwrap();
            assert_eq!(parts.len() as u64, size.div_ceil(part_size));

            let mut expected_start = 0;
            for (index, part) in parts.iter().enumerate() {
                assert_eq!(part.part_number as usize, index + 1);
                match part.payload {
                    PartPayload::Range { start, end } => {
                        assert_eq!(start, expected_start);
                        assert!(end >= start);
                        expected_start = end + 1;
                    }
                    _ => unreachable!(),
                }
            }
            assert_eq!(expected_start, size);
        }
    }

    #[test]
    fn test_plan_ranges_empty_and_invalid() {
        assert!(plan_ranges(0, 100).unwrap().is_empty());
        assert!(matches!(
            plan_ranges(10, 0),
            Err(TransferError::InvalidPlan(_))
        ));
        assert!(matches!(
            plan_ranges(10_001, 1),
            Err(TransferError::InvalidPlan(_))
        ));
        assert_eq!(plan_ranges(10_000, 1).unwrap().len(), 10_000);
    }

    #[test]
    fn test_plan_slices_share_offsets() {
        let blob = Bytes::from((0..=255u8).collect::<Vec<u8>>());
        let parts = plan_slices(&blob, 100).unwrap();

        assert_eq!(parts.len(), 3);
        let rebuilt: Vec<u8> = parts
            .iter()
            .flat_map(|p| match &p.payload {
                PartPayload::Buffer(b) => b.to_vec(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(rebuilt, blob.to_vec());
        assert_eq!(parts[2].len(), 56);
    }

    #[tokio::test]
    async fn test_buffer_fill_irregular_chunks() {
        let (stream, all) = chunks_of(&[7, 3, 15]);
        let parts: Vec<PartDescriptor> = BufferFill::new("k", stream, 20)
            .unwrap()
            .into_stream()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_number, 1);
        assert_eq!(parts[0].len(), 20);
        assert_eq!(parts[1].part_number, 2);
        assert_eq!(parts[1].len(), 5);

        let rebuilt: Vec<u8> = parts
            .iter()
            .flat_map(|p| match &p.payload {
                PartPayload::Buffer(b) => b.to_vec(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(rebuilt, all);
    }

    #[tokio::test]
    async fn test_buffer_fill_splits_large_chunk() {
        let (stream, _) = chunks_of(&[65]);
        let sizes: Vec<u64> = BufferFill::new("k", stream, 20)
            .unwrap()
            .into_stream()
            .map_ok(|p| p.len())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(sizes, vec![20, 20, 20, 5]);
    }

    #[tokio::test]
    async fn test_buffer_fill_exact_multiple() {
        let (stream, _) = chunks_of(&[10, 10, 10, 10]);
        let sizes: Vec<u64> = BufferFill::new("k", stream, 20)
            .unwrap()
            .into_stream()
            .map_ok(|p| p.len())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(sizes, vec![20, 20]);
    }

    #[tokio::test]
    async fn test_buffer_fill_empty_stream() {
        let (stream, _) = chunks_of(&[]);
        let mut fill = BufferFill::new("k", stream, 20).unwrap();
        assert!(fill.next_part().await.unwrap().is_none());
        assert!(fill.next_part().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_buffer_fill_fuses_after_error() {
        let chunks: Vec<crate::store::StoreResult<Bytes>> = vec![
            Ok(Bytes::from_static(&[1; 25])),
            Err(StoreError::Network("reset".to_string())),
            Ok(Bytes::from_static(&[2; 5])),
        ];
        let mut fill = BufferFill::new("k", futures::stream::iter(chunks).boxed(), 20).unwrap();

        assert_eq!(fill.next_part().await.unwrap().unwrap().len(), 20);
        assert!(matches!(
            fill.next_part().await,
            Err(TransferError::DownloadFailed { .. })
        ));
        assert!(fill.next_part().await.unwrap().is_none());
    }

    #[test]
    fn test_buffer_fill_zero_capacity() {
        let (stream, _) = chunks_of(&[1]);
        assert!(matches!(
            BufferFill::new("k", stream, 0),
            Err(TransferError::InvalidPlan(_))
        ));
    }
}
