//! In-memory object store for testing
//!
//! Implements the S3 multipart protocol closely enough to exercise the transfer
//! engine end to end: uploads get ids, parts get entity tags, completion checks the
//! submitted part list and assembles the object. Faults can be injected per
//! operation and every call is counted.

use super::error::{StoreError, StoreResult};
use super::{ByteStream, CompletedPart, ObjectHead, ObjectStore};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A failure injected for the next `remaining` calls
#[derive(Debug, Clone)]
struct Injected {
    remaining: u32,
    error: StoreError,
}

impl Injected {
    /// Consume one injection, returning the error if it is still armed
    fn take(slot: &mut Option<Injected>) -> Option<StoreError> {
        let injected = slot.as_mut()?;
        if injected.remaining == 0 {
            *slot = None;
            return None;
        }
        injected.remaining -= 1;
        Some(injected.error.clone())
    }
}

#[derive(Debug, Default)]
struct Faults {
    head: Option<Injected>,
    range_reads: Option<Injected>,
    short_range_reads: u32,
    stream_fail_after: Option<usize>,
    initiate: Option<Injected>,
    parts: HashMap<u32, Injected>,
    omit_etag: HashSet<u32>,
    omit_upload_id: bool,
    omit_content_length: bool,
    complete: Option<Injected>,
    lost_complete_responses: u32,
    abort: Option<Injected>,
    stalled: HashSet<u32>,
    delayed: HashMap<u32, Duration>,
    read_chunk_sizes: Vec<usize>,
}

#[derive(Debug)]
struct Upload {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: HashMap<String, Bytes>,
    uploads: HashMap<String, Upload>,
    next_upload: u64,
    faults: Faults,
    initiate_calls: u32,
    upload_calls: HashMap<u32, u32>,
    complete_calls: u32,
    abort_calls: u32,
    put_calls: u32,
    completions: Vec<Vec<u32>>,
}

/// In-memory [`ObjectStore`]
///
/// # Example
///
/// ```rust
/// use bytes::Bytes;
/// use ferry::store::MemoryStore;
///
/// let store = MemoryStore::new();
/// store.insert_object("a.bin", Bytes::from_static(b"hello"));
/// store.fail_part(2, 1);
///
/// assert_eq!(store.object("a.bin").unwrap().len(), 5);
/// assert_eq!(store.initiate_calls(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

/// Entity tag derived from the part number and its content
fn part_etag(part_number: u32, data: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&part_number.to_be_bytes());
    hasher.update(data);
    format!("\"{}\"", &hasher.finalize().to_hex()[..32])
}

fn unavailable(what: &str) -> StoreError {
    StoreError::service(503, "ServiceUnavailable", format!("injected {} failure", what))
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panicking test thread must not take the store down with it
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an object
    pub fn insert_object(&self, key: impl Into<String>, data: Bytes) {
        self.lock().objects.insert(key.into(), data);
    }

    /// Get an object's content
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.lock().objects.get(key).cloned()
    }

    // --- fault injection ---

    /// Fail the next `times` HEAD requests with a retryable error
    pub fn fail_head(&self, times: u32) {
        self.lock().faults.head = Some(Injected {
            remaining: times,
            error: unavailable("head"),
        });
    }

    /// Fail the next `times` range reads with a retryable error
    pub fn fail_range_reads(&self, times: u32) {
        self.lock().faults.range_reads = Some(Injected {
            remaining: times,
            error: unavailable("range read"),
        });
    }

    /// Serve one byte less than asked for on the next `times` range reads
    pub fn short_range_reads(&self, times: u32) {
        self.lock().faults.short_range_reads = times;
    }

    /// Break whole-object reads after `bytes` bytes were delivered
    pub fn fail_stream_after(&self, bytes: usize) {
        self.lock().faults.stream_fail_after = Some(bytes);
    }

    /// Fail the next `times` initiate calls with `error`
    pub fn fail_initiate(&self, times: u32, error: StoreError) {
        self.lock().faults.initiate = Some(Injected {
            remaining: times,
            error,
        });
    }

    /// Fail the next `times` uploads of `part_number` with a retryable error
    pub fn fail_part(&self, part_number: u32, times: u32) {
        self.fail_part_with(part_number, times, unavailable("part upload"));
    }

    /// Fail the next `times` uploads of `part_number` with `error`
    pub fn fail_part_with(&self, part_number: u32, times: u32, error: StoreError) {
        self.lock().faults.parts.insert(
            part_number,
            Injected {
                remaining: times,
                error,
            },
        );
    }

    /// Answer uploads of `part_number` without an entity tag
    pub fn omit_etag(&self, part_number: u32) {
        self.lock().faults.omit_etag.insert(part_number);
    }

    /// Answer initiate calls without an upload id
    pub fn omit_upload_id(&self) {
        self.lock().faults.omit_upload_id = true;
    }

    /// Answer HEAD requests without `Content-Length`
    pub fn omit_content_length(&self) {
        self.lock().faults.omit_content_length = true;
    }

    /// Fail the next `times` complete calls with `error`
    pub fn fail_complete(&self, times: u32, error: StoreError) {
        self.lock().faults.complete = Some(Injected {
            remaining: times,
            error,
        });
    }

    /// Assemble the object on the next `times` complete calls, then answer with a
    /// connection reset as if the response never arrived
    pub fn lose_complete_responses(&self, times: u32) {
        self.lock().faults.lost_complete_responses = times;
    }

    /// Fail every abort call with a non-retryable error
    pub fn fail_abort(&self) {
        self.lock().faults.abort = Some(Injected {
            remaining: u32::MAX,
            error: StoreError::service(403, "AccessDenied", "injected abort failure"),
        });
    }

    /// Make uploads of `part_number` hang forever
    pub fn stall_part(&self, part_number: u32) {
        self.lock().faults.stalled.insert(part_number);
    }

    /// Let stalled parts through again
    pub fn clear_stalls(&self) {
        self.lock().faults.stalled.clear();
    }

    /// Hold uploads of `part_number` for `delay` before storing them
    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.lock().faults.delayed.insert(part_number, delay);
    }

    /// Deliver read bodies in chunks of these sizes, cycling through the list
    pub fn read_chunk_sizes(&self, sizes: Vec<usize>) {
        self.lock().faults.read_chunk_sizes = sizes.into_iter().filter(|s| *s > 0).collect();
    }

    // --- call accounting ---

    /// Number of initiate calls
    pub fn initiate_calls(&self) -> u32 {
        self.lock().initiate_calls
    }

    /// Number of upload calls for `part_number`, failed ones included
    pub fn upload_calls(&self, part_number: u32) -> u32 {
        self.lock()
            .upload_calls
            .get(&part_number)
            .copied()
            .unwrap_or(0)
    }

    /// Number of upload calls across all parts
    pub fn total_upload_calls(&self) -> u32 {
        self.lock().upload_calls.values().sum()
    }

    /// Number of complete calls
    pub fn complete_calls(&self) -> u32 {
        self.lock().complete_calls
    }

    /// Number of abort calls, failed ones included
    pub fn abort_calls(&self) -> u32 {
        self.lock().abort_calls
    }

    /// Number of single-shot puts
    pub fn put_calls(&self) -> u32 {
        self.lock().put_calls
    }

    /// Part numbers submitted by every successful completion, in call order
    pub fn completions(&self) -> Vec<Vec<u32>> {
        self.lock().completions.clone()
    }

    /// Number of multipart uploads neither completed nor aborted
    pub fn open_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    /// Split `data` into a body stream using the configured chunk sizes
    fn chunked(&self, data: Bytes, fail_after: Option<usize>) -> ByteStream {
        let sizes = self.lock().faults.read_chunk_sizes.clone();
        let mut chunks: Vec<StoreResult<Bytes>> = Vec::new();

        let mut offset = 0;
        let mut index = 0;
        while offset < data.len() {
            let size = if sizes.is_empty() {
                data.len()
            } else {
                sizes[index % sizes.len()]
            };
            let end = (offset + size).min(data.len());

            if let Some(limit) = fail_after {
                if end > limit {
                    if limit > offset {
                        chunks.push(Ok(data.slice(offset..limit)));
                    }
                    chunks.push(Err(StoreError::Network(
                        "injected connection reset".to_string(),
                    )));
                    return futures::stream::iter(chunks).boxed();
                }
            }

            chunks.push(Ok(data.slice(offset..end)));
            offset = end;
            index += 1;
        }

        futures::stream::iter(chunks).boxed()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head_object(&self, key: &str) -> StoreResult<ObjectHead> {
        let mut state = self.lock();
        if let Some(err) = Injected::take(&mut state.faults.head) {
            return Err(err);
        }

        let data = state
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        Ok(ObjectHead {
            content_length: if state.faults.omit_content_length {
                None
            } else {
                Some(data.len() as u64)
            },
        })
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> StoreResult<ByteStream> {
        let slice = {
            let mut state = self.lock();
            if let Some(err) = Injected::take(&mut state.faults.range_reads) {
                return Err(err);
            }

            let data = state
                .objects
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

            let len = data.len() as u64;
            if start > end || start >= len {
                return Err(StoreError::service(
                    416,
                    "InvalidRange",
                    format!("bytes={}-{} not satisfiable for {} bytes", start, end, len),
                ));
            }

            // S3 clamps the end of the range to the object size
            let mut stop = end.min(len - 1) as usize + 1;
            if state.faults.short_range_reads > 0 {
                state.faults.short_range_reads -= 1;
                stop -= 1;
            }
            data.slice(start as usize..stop)
        };

        Ok(self.chunked(slice, None))
    }

    async fn get_object(&self, key: &str) -> StoreResult<ByteStream> {
        let (data, fail_after) = {
            let state = self.lock();
            let data = state
                .objects
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            (data, state.faults.stream_fail_after)
        };

        Ok(self.chunked(data, fail_after))
    }

    async fn create_multipart_upload(&self, key: &str) -> StoreResult<Option<String>> {
        let mut state = self.lock();
        state.initiate_calls += 1;
        if let Some(err) = Injected::take(&mut state.faults.initiate) {
            return Err(err);
        }

        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            Upload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );

        if state.faults.omit_upload_id {
            return Ok(None);
        }
        Ok(Some(upload_id))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StoreResult<Option<String>> {
        let (stalled, delay) = {
            let mut state = self.lock();
            *state.upload_calls.entry(part_number).or_insert(0) += 1;

            if let Some(injected) = state.faults.parts.get_mut(&part_number) {
                if injected.remaining > 0 {
                    injected.remaining -= 1;
                    return Err(injected.error.clone());
                }
            }

            (
                state.faults.stalled.contains(&part_number),
                state.faults.delayed.get(&part_number).copied(),
            )
        };

        if stalled {
            futures::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let omit_etag = state.faults.omit_etag.contains(&part_number);
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload(upload_id.to_string()))?;

        if upload.key != key {
            return Err(StoreError::service(
                400,
                "InvalidRequest",
                format!("upload {} belongs to {}", upload_id, upload.key),
            ));
        }

        let etag = part_etag(part_number, &body);
        upload.parts.insert(part_number, (etag.clone(), body));

        if omit_etag {
            return Ok(None);
        }
        Ok(Some(etag))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.complete_calls += 1;
        if let Some(err) = Injected::take(&mut state.faults.complete) {
            return Err(err);
        }

        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload(upload_id.to_string()))?;

        if parts.is_empty() {
            return Err(StoreError::service(
                400,
                "MalformedXML",
                "no parts were submitted",
            ));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StoreError::service(
                400,
                "InvalidPartOrder",
                "part numbers must be ascending",
            ));
        }

        let mut assembled = BytesMut::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, data)) if *etag == part.etag => assembled.extend_from_slice(data),
                _ => {
                    return Err(StoreError::service(
                        400,
                        "InvalidPart",
                        format!("part {} not found or entity tag mismatch", part.part_number),
                    ))
                }
            }
        }

        state.uploads.remove(upload_id);
        state.objects.insert(key.to_string(), assembled.freeze());
        state
            .completions
            .push(parts.iter().map(|p| p.part_number).collect());

        if state.faults.lost_complete_responses > 0 {
            state.faults.lost_complete_responses -= 1;
            return Err(StoreError::Network(
                "injected connection reset".to_string(),
            ));
        }
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> StoreResult<()> {
        let mut state = self.lock();
        state.abort_calls += 1;
        if let Some(err) = Injected::take(&mut state.faults.abort) {
            return Err(err);
        }

        state
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NoSuchUpload(upload_id.to_string()))
    }

    async fn put_object(&self, key: &str, body: Bytes) -> StoreResult<()> {
        let mut state = self.lock();
        state.put_calls += 1;
        state.objects.insert(key.to_string(), body);
        Ok(())
    }
}
