//! Part uploads
//!
//! Each part is uploaded as its own durable step named `upload-part-NNNNN`. A part
//! that was recorded by an earlier run of the execution is replayed from the journal
//! and not sent again. Successful results go into the session's ledger exactly once.

use crate::error::Result;
use crate::planner::{PartDescriptor, PartPayload};
use crate::progress::ProgressReporter;
use crate::session::{MultipartSession, PartResult};
use crate::source::SourceReader;
use crate::step::{StepContext, StepPolicy};
use crate::store::ObjectStore;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// How parts are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// One part at a time, ascending; a failure stops before the next part
    #[default]
    Sequential,
    /// Up to `max_concurrent_parts` uploads in flight
    Concurrent,
}

impl fmt::Display for UploadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadMode::Sequential => write!(f, "sequential"),
            UploadMode::Concurrent => write!(f, "concurrent"),
        }
    }
}

/// Step name of a part upload
///
/// Zero-padded so journal listings sort in part order.
pub fn part_step_name(part_number: u32) -> String {
    format!("upload-part-{:05}", part_number)
}

/// Uploads planned parts into one session
pub struct PartUploader {
    ctx: StepContext,
    destination: Arc<dyn ObjectStore>,
    source: SourceReader,
    session: Arc<MultipartSession>,
    policy: StepPolicy,
    progress: ProgressReporter,
}

impl PartUploader {
    pub fn new(
        ctx: StepContext,
        destination: Arc<dyn ObjectStore>,
        source: SourceReader,
        session: Arc<MultipartSession>,
        policy: StepPolicy,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            ctx,
            destination,
            source,
            session,
            policy,
            progress,
        }
    }

    /// Upload one part as a durable step and add it to the ledger
    pub async fn upload(&self, part: PartDescriptor) -> Result<PartResult> {
        let step = part_step_name(part.part_number);

        let result: PartResult = self
            .ctx
            .run(&step, &self.policy, || {
                let part = part.clone();
                async move {
                    let body = match part.payload {
                        PartPayload::Range { start, end } => {
                            self.source
                                .fetch_range(self.session.key(), start, end)
                                .await?
                        }
                        PartPayload::Buffer(bytes) => bytes,
                    };
                    self.session
                        .upload_part(self.destination.as_ref(), part.part_number, body)
                        .await
                }
            })
            .await?;

        self.session.accept(result.clone())?;
        self.progress.add(result.size);
        Ok(result)
    }

    /// Upload every part of `parts` and return the results ascending by part number
    ///
    /// A planning failure yielded by `parts` counts like a failed upload.
    pub async fn upload_all(
        &self,
        parts: BoxStream<'_, Result<PartDescriptor>>,
        mode: UploadMode,
        max_concurrent_parts: usize,
    ) -> Result<Vec<PartResult>> {
        info!(
            key = %self.session.key(),
            upload_id = %self.session.upload_id(),
            mode = %mode,
            "Uploading parts"
        );

        match mode {
            UploadMode::Sequential => self.upload_sequential(parts).await,
            UploadMode::Concurrent => {
                self.upload_concurrent(parts, max_concurrent_parts.max(1))
                    .await
            }
        }
    }

    async fn upload_sequential(
        &self,
        mut parts: BoxStream<'_, Result<PartDescriptor>>,
    ) -> Result<Vec<PartResult>> {
        let mut results = Vec::new();
        while let Some(part) = parts.next().await {
            results.push(self.upload(part?).await?);
        }
        Ok(results)
    }

    async fn upload_concurrent(
        &self,
        parts: BoxStream<'_, Result<PartDescriptor>>,
        window: usize,
    ) -> Result<Vec<PartResult>> {
        // In-flight uploads always run to completion, even after a failure
        let outcomes: Vec<Result<PartResult>> = parts
            .map(|part| async move { self.upload(part?).await })
            .buffer_unordered(window)
            .collect()
            .await;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut first_error = None;
        let mut failures = 0;

        for outcome in outcomes {
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    failures += 1;
                    if first_error.is_none() {
                        first_error = Some(e);
                    } else {
                        warn!(error = %e, "Additional part failure");
                    }
                }
            }
        }

        if let Some(e) = first_error {
            warn!(
                failures,
                succeeded = results.len(),
                "Concurrent upload finished with failures"
            );
            return Err(e);
        }

        results.sort_by_key(|r| r.part_number);
        Ok(results)
    }
}
