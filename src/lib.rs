/*!
 * Ferry - durable multipart object transfer between S3-compatible stores
 *
 * An object is read from a source bucket and written to a destination bucket as a
 * multipart upload. Every network step is recorded in a step journal, so a crashed or
 * interrupted transfer resumes where it stopped instead of starting over:
 * - Ranged, streamed, or in-memory part planning
 * - Sequential or bounded-concurrency part uploads
 * - Per-step retry policies with constant or exponential backoff
 * - Abort of the multipart upload on any failure after it was initiated
 */

pub mod config;
pub mod error;
pub mod logging;
pub mod planner;
pub mod progress;
pub mod session;
pub mod source;
pub mod step;
pub mod store;
pub mod transfer;
pub mod uploader;

// Re-export commonly used types
pub use config::{FerryConfig, StoreConfig};
pub use error::{Result, TransferError};
pub use planner::{PartDescriptor, PartPayload};
pub use progress::ProgressReporter;
pub use session::{MultipartSession, PartResult};
pub use step::{BackoffKind, StepContext, StepPolicies, StepPolicy};
pub use store::{MemoryStore, ObjectStore, StoreError};
pub use transfer::{
    forget_execution, ChunkStrategy, TransferEngine, TransferOptions, TransferOutcome,
    TransferRequest,
};
pub use uploader::UploadMode;

pub use ferry_journal::{Execution, ExecutionId, ExecutionStatus, StepJournal, StepRecord};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
