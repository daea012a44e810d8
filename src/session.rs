//! Multipart upload session
//!
//! A session exists only once the destination handed out an upload id. From there it
//! accumulates successful parts in its [`PartLedger`] and is closed by exactly one of
//! [`MultipartSession::complete`] or [`MultipartSession::abort`].

use crate::error::{Result, TransferError};
use crate::store::{CompletedPart, ObjectStore, StoreError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Lifecycle of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initiated,
    Completed,
    Aborted,
}

/// A successfully uploaded part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartResult {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Concurrent-safe collection of uploaded parts, kept ordered by part number
#[derive(Debug, Default)]
pub struct PartLedger {
    parts: Mutex<BTreeMap<u32, PartResult>>,
}

impl PartLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a part; each part number is accepted once
    pub fn accept(&self, result: PartResult) -> Result<()> {
        let mut parts = lock(&self.parts);
        if parts.contains_key(&result.part_number) {
            return Err(TransferError::DuplicatePart {
                part_number: result.part_number,
            });
        }
        parts.insert(result.part_number, result);
        Ok(())
    }

    /// All parts, ascending by part number
    pub fn sorted(&self) -> Vec<PartResult> {
        lock(&self.parts).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.parts).len()
    }

    /// Sum of all part sizes
    pub fn total_bytes(&self) -> u64 {
        lock(&self.parts).values().map(|p| p.size).sum()
    }
}

/// An open multipart upload on the destination
#[derive(Debug)]
pub struct MultipartSession {
    key: String,
    upload_id: String,
    ledger: PartLedger,
    state: Mutex<SessionState>,
}

impl MultipartSession {
    /// Ask the destination for a new upload id
    pub async fn initiate(store: &dyn ObjectStore, key: &str) -> Result<String> {
        let upload_id = store
            .create_multipart_upload(key)
            .await
            .map_err(|source| TransferError::InitiateFailed {
                key: key.to_string(),
                source,
            })?
            .ok_or_else(|| TransferError::UploadIdMissing {
                key: key.to_string(),
            })?;

        info!(key, upload_id = %upload_id, "Initiated multipart upload");
        Ok(upload_id)
    }

    /// Open a session for an upload id obtained from [`MultipartSession::initiate`]
    pub fn open(key: impl Into<String>, upload_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            upload_id: upload_id.into(),
            ledger: PartLedger::new(),
            state: Mutex::new(SessionState::Initiated),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn ledger(&self) -> &PartLedger {
        &self.ledger
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            SessionState::Initiated => Ok(()),
            SessionState::Completed | SessionState::Aborted => Err(TransferError::SessionClosed),
        }
    }

    /// Upload one part
    ///
    /// The result is not added to the ledger; see [`MultipartSession::accept`].
    pub async fn upload_part(
        &self,
        store: &dyn ObjectStore,
        part_number: u32,
        body: Bytes,
    ) -> Result<PartResult> {
        self.ensure_open()?;

        let size = body.len() as u64;
        let etag = store
            .upload_part(&self.key, &self.upload_id, part_number, body)
            .await
            .map_err(|source| TransferError::PartUploadFailed {
                part_number,
                source,
            })?
            .ok_or(TransferError::ETagMissing { part_number })?;

        debug!(part_number, size, etag = %etag, "Uploaded part");
        Ok(PartResult {
            part_number,
            etag,
            size,
        })
    }

    /// Record a successful part in the ledger
    pub fn accept(&self, result: PartResult) -> Result<()> {
        self.ensure_open()?;
        self.ledger.accept(result)
    }

    /// Assemble the object from every accepted part, ascending
    ///
    /// A retry after a lost response finds the upload gone. That counts as done
    /// when the destination object already has the size of every accepted part.
    /// On failure the session stays open so the caller can abort it.
    pub async fn complete(&self, store: &dyn ObjectStore) -> Result<Vec<PartResult>> {
        self.ensure_open()?;

        let parts = self.ledger.sorted();
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect();

        if let Err(source) = store
            .complete_multipart_upload(&self.key, &self.upload_id, &completed)
            .await
        {
            let assembled =
                matches!(source, StoreError::NoSuchUpload(_)) && self.is_assembled(store).await;
            if !assembled {
                return Err(TransferError::CompleteFailed {
                    upload_id: self.upload_id.clone(),
                    source,
                });
            }
            warn!(
                key = %self.key,
                upload_id = %self.upload_id,
                "Upload already gone but the object is in place, treating complete as done"
            );
        }

        *lock(&self.state) = SessionState::Completed;
        info!(
            key = %self.key,
            upload_id = %self.upload_id,
            parts = parts.len(),
            "Completed multipart upload"
        );
        Ok(parts)
    }

    /// Whether the destination key holds an object as large as the ledger
    async fn is_assembled(&self, store: &dyn ObjectStore) -> bool {
        match store.head_object(&self.key).await {
            Ok(head) => head.content_length == Some(self.ledger.total_bytes()),
            Err(e) => {
                debug!(key = %self.key, error = %e, "Cannot inspect destination object");
                false
            }
        }
    }

    /// Discard the upload and every stored part
    ///
    /// An upload the store no longer knows counts as aborted.
    pub async fn abort(&self, store: &dyn ObjectStore) -> Result<()> {
        self.ensure_open()?;

        match store.abort_multipart_upload(&self.key, &self.upload_id).await {
            Ok(()) => {
                info!(key = %self.key, upload_id = %self.upload_id, "Aborted multipart upload");
            }
            Err(StoreError::NoSuchUpload(_)) => {
                warn!(
                    key = %self.key,
                    upload_id = %self.upload_id,
                    "Upload already gone, treating abort as done"
                );
            }
            Err(source) => {
                return Err(TransferError::AbortFailed {
                    upload_id: self.upload_id.clone(),
                    source,
                })
            }
        }

        *lock(&self.state) = SessionState::Aborted;
        Ok(())
    }
}
