//! Error types for ferry

use crate::store::StoreError;
use ferry_journal::{ExecutionId, ExecutionStatus};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

/// Everything that can stop a transfer
#[derive(Error, Debug)]
pub enum TransferError {
    // --- source ---
    #[error("Cannot determine size of {key}: {source}")]
    SizeUnavailable {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Range read {start}-{end} of {key} failed: {source}")]
    RangeReadFailed {
        key: String,
        start: u64,
        end: u64,
        #[source]
        source: StoreError,
    },

    #[error("Download of {key} failed: {source}")]
    DownloadFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    // --- destination ---
    #[error("Initiating multipart upload of {key} failed: {source}")]
    InitiateFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Store returned no upload id for {key}")]
    UploadIdMissing { key: String },

    #[error("Upload of part {part_number} failed: {source}")]
    PartUploadFailed {
        part_number: u32,
        #[source]
        source: StoreError,
    },

    #[error("Store returned no entity tag for part {part_number}")]
    ETagMissing { part_number: u32 },

    #[error("Completing upload {upload_id} failed: {source}")]
    CompleteFailed {
        upload_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Aborting upload {upload_id} failed: {source}")]
    AbortFailed {
        upload_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Single-shot upload of {key} failed: {source}")]
    PutFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    // --- step execution ---
    #[error("Step {step} gave up after {attempts} attempts: {source}")]
    StepExhausted {
        step: String,
        attempts: u32,
        #[source]
        source: Box<TransferError>,
    },

    #[error("Step {step} failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<TransferError>,
    },

    #[error("Step {step} timed out after {timeout:?}")]
    StepTimeout { step: String, timeout: Duration },

    // --- planning and session ---
    #[error("Invalid chunk plan: {0}")]
    InvalidPlan(String),

    #[error("Part {part_number} was already recorded")]
    DuplicatePart { part_number: u32 },

    #[error("Upload session is already closed")]
    SessionClosed,

    // --- execution lifecycle ---
    #[error("Execution {execution_id} was terminated")]
    Terminated { execution_id: ExecutionId },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("Execution {execution_id} already finished with status {status}")]
    ExecutionFinished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },

    #[error("Execution {execution_id} is {status}; only finished executions can be forgotten")]
    ExecutionUnfinished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },

    // --- ambient ---
    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TransferError {
    /// Whether a fresh attempt of the failed operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::SizeUnavailable { source, .. }
            | TransferError::RangeReadFailed { source, .. }
            | TransferError::DownloadFailed { source, .. }
            | TransferError::InitiateFailed { source, .. }
            | TransferError::PartUploadFailed { source, .. }
            | TransferError::CompleteFailed { source, .. }
            | TransferError::AbortFailed { source, .. }
            | TransferError::PutFailed { source, .. } => source.is_retryable(),

            // Some stores occasionally drop response headers
            TransferError::UploadIdMissing { .. } | TransferError::ETagMissing { .. } => true,

            TransferError::StepTimeout { .. } => true,

            _ => false,
        }
    }

    /// Whether the failure comes from the engine's own state rather than a store
    ///
    /// The step executor stops at once on these; every other failure is retried
    /// until the policy's attempts run out.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransferError::InvalidPlan(_)
                | TransferError::DuplicatePart { .. }
                | TransferError::SessionClosed
                | TransferError::Terminated { .. }
                | TransferError::ExecutionNotFound(_)
                | TransferError::ExecutionFinished { .. }
                | TransferError::ExecutionUnfinished { .. }
                | TransferError::StepExhausted { .. }
                | TransferError::StepFailed { .. }
                | TransferError::Journal(_)
                | TransferError::Serialization(_)
                | TransferError::Config(_)
        )
    }

    /// The failure underneath any step execution wrappers
    pub fn root_cause(&self) -> &TransferError {
        match self {
            TransferError::StepExhausted { source, .. } | TransferError::StepFailed { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// Whether this error stopped the execution on an external request
    pub fn is_terminated(&self) -> bool {
        matches!(self.root_cause(), TransferError::Terminated { .. })
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.root_cause() {
            TransferError::Config(_)
            | TransferError::Journal(_)
            | TransferError::ExecutionNotFound(_)
            | TransferError::InvalidPlan(_) => EXIT_FATAL,
            _ => EXIT_FAILED,
        }
    }
}

impl From<anyhow::Error> for TransferError {
    fn from(err: anyhow::Error) -> Self {
        // Alternate form keeps the context chain on one line
        TransferError::Journal(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Serialization(err.to_string())
    }
}
