//! Transfer orchestration
//!
//! [`TransferEngine`] drives one execution from start to finish:
//!
//! 1. size probe (ranged) or stream open (streamed)
//! 2. initiate the multipart upload
//! 3. plan and upload the parts
//! 4. complete the upload
//!
//! Every network-facing step runs through the step journal, so calling
//! [`TransferEngine::run`] again on an interrupted execution replays the finished
//! steps and continues with the first unfinished one. Once an upload was initiated,
//! any failure aborts it before the original error is returned.

use crate::error::{Result, TransferError};
use crate::planner::{plan_ranges, plan_slices, BufferFill, PartDescriptor};
use crate::progress::ProgressReporter;
use crate::session::{MultipartSession, PartResult};
use crate::source::SourceReader;
use crate::step::{retry, StepContext, StepPolicies};
use crate::store::ObjectStore;
use crate::uploader::{PartUploader, UploadMode};
use bytes::Bytes;
use ferry_journal::{Execution, ExecutionId, ExecutionStatus, StepJournal, StepRecord};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

/// How the source object is divided into parts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    /// Probe the size, then read each part as an independent byte range
    #[default]
    Ranged,
    /// Read the object once and regroup the stream into fixed-size parts
    Streamed,
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkStrategy::Ranged => write!(f, "ranged"),
            ChunkStrategy::Streamed => write!(f, "streamed"),
        }
    }
}

fn default_part_size() -> u64 {
    8 * 1024 * 1024
}

fn default_max_concurrent_parts() -> usize {
    4
}

/// Per-transfer tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Part size of ranged and blob transfers
    pub part_size: u64,
    /// Buffer size of streamed transfers
    pub buffer_capacity: usize,
    pub mode: UploadMode,
    pub strategy: ChunkStrategy,
    /// Upload window in concurrent mode
    pub max_concurrent_parts: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            buffer_capacity: default_part_size() as usize,
            mode: UploadMode::default(),
            strategy: ChunkStrategy::default(),
            max_concurrent_parts: default_max_concurrent_parts(),
        }
    }
}

/// Object to transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Key in the source bucket, reused in the destination bucket
    pub key: String,
}

impl TransferRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Result of a finished transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub execution_id: ExecutionId,
    pub key: String,
    /// None when the object was written with a single put
    pub upload_id: Option<String>,
    /// Uploaded parts, ascending
    pub parts: Vec<PartResult>,
    pub bytes: u64,
}

/// Drives durable transfers from a source store to a destination store
#[derive(Clone)]
pub struct TransferEngine {
    source: SourceReader,
    destination: Arc<dyn ObjectStore>,
    journal: Arc<dyn StepJournal>,
    options: TransferOptions,
    policies: StepPolicies,
    progress: ProgressReporter,
}

impl TransferEngine {
    pub fn new(
        source: Arc<dyn ObjectStore>,
        destination: Arc<dyn ObjectStore>,
        journal: Arc<dyn StepJournal>,
    ) -> Self {
        Self {
            source: SourceReader::new(source),
            destination,
            journal,
            options: TransferOptions::default(),
            policies: StepPolicies::default(),
            progress: ProgressReporter::silent(),
        }
    }

    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_policies(mut self, policies: StepPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn journal(&self) -> &Arc<dyn StepJournal> {
        &self.journal
    }

    /// Register a new queued execution for `request`
    pub async fn submit(&self, request: TransferRequest) -> Result<ExecutionId> {
        let id = self.journal.create_execution(&request.key).await?;
        info!(execution_id = %id, key = %request.key, "Submitted transfer");
        Ok(id)
    }

    /// Submit and run in one go
    pub async fn transfer(&self, request: TransferRequest) -> Result<TransferOutcome> {
        let id = self.submit(request).await?;
        self.run(id).await
    }

    /// Run, or resume, an execution
    pub async fn run(&self, id: ExecutionId) -> Result<TransferOutcome> {
        self.execute(id, None).await
    }

    /// Run an execution whose object is already in memory, using slices as parts
    pub async fn run_blob(&self, id: ExecutionId, blob: Bytes) -> Result<TransferOutcome> {
        self.execute(id, Some(blob)).await
    }

    /// Current state of an execution
    pub async fn status(&self, id: ExecutionId) -> Result<Execution> {
        self.journal
            .get_execution(id)
            .await?
            .ok_or(TransferError::ExecutionNotFound(id))
    }

    /// Recorded steps of an execution
    pub async fn steps(&self, id: ExecutionId) -> Result<Vec<StepRecord>> {
        self.status(id).await?;
        Ok(self.journal.list_steps(id).await?)
    }

    /// Stop an execution before its next step
    ///
    /// Returns `false` if it had already finished. A terminated execution does not
    /// abort its multipart upload.
    pub async fn terminate(&self, id: ExecutionId) -> Result<bool> {
        self.status(id).await?;
        let terminated = self.journal.terminate(id).await?;
        if terminated {
            warn!(execution_id = %id, "Execution terminated");
        }
        Ok(terminated)
    }

    async fn execute(&self, id: ExecutionId, blob: Option<Bytes>) -> Result<TransferOutcome> {
        let execution = self.status(id).await?;
        match execution.status {
            ExecutionStatus::Queued | ExecutionStatus::Running => {}
            status => {
                return Err(TransferError::ExecutionFinished {
                    execution_id: id,
                    status,
                })
            }
        }

        self.journal
            .set_status(id, ExecutionStatus::Running, None)
            .await?;

        let ctx = StepContext::new(self.journal.clone(), id);
        let span = info_span!("transfer", execution_id = %id, key = %execution.key);
        let result = self
            .drive(&ctx, &execution.key, blob)
            .instrument(span)
            .await;

        match &result {
            Ok(outcome) => {
                self.journal
                    .set_status(id, ExecutionStatus::Completed, None)
                    .await?;
                info!(
                    execution_id = %id,
                    key = %outcome.key,
                    parts = outcome.parts.len(),
                    bytes = outcome.bytes,
                    "Transfer completed"
                );
            }
            Err(e) if e.is_terminated() => {
                warn!(execution_id = %id, "Transfer stopped by termination");
            }
            Err(e) => {
                let cause = e.root_cause().to_string();
                self.journal
                    .set_status(id, ExecutionStatus::Failed, Some(cause.clone()))
                    .await?;
                error!(execution_id = %id, error = %e, cause = %cause, "Transfer failed");
            }
        }

        result
    }

    async fn drive(
        &self,
        ctx: &StepContext,
        key: &str,
        blob: Option<Bytes>,
    ) -> Result<TransferOutcome> {
        if let Some(blob) = blob {
            let part_size = self.recorded_part_size(ctx, self.options.part_size).await?;
            let parts = plan_slices(&blob, part_size)?;
            if parts.is_empty() {
                return self.put_empty(ctx, key).await;
            }
            return self.multipart(ctx, key, ready_parts(parts)).await;
        }

        match self.options.strategy {
            ChunkStrategy::Ranged => {
                let size: u64 = ctx
                    .run("probe-size", &self.policies.probe, || {
                        self.source.probe_size(key)
                    })
                    .await?;

                let part_size = self.recorded_part_size(ctx, self.options.part_size).await?;
                let parts = plan_ranges(size, part_size)?;
                if parts.is_empty() {
                    return self.put_empty(ctx, key).await;
                }
                self.multipart(ctx, key, ready_parts(parts)).await
            }
            ChunkStrategy::Streamed => {
                let capacity = self
                    .recorded_part_size(ctx, self.options.buffer_capacity as u64)
                    .await?;
                let body = retry("open-stream", &self.policies.open_stream, || {
                    self.source.read_all(key)
                })
                .await?;

                let mut fill = BufferFill::new(key, body, capacity as usize)?;

                // An empty stream never opens an upload
                let Some(first) = fill.next_part().await? else {
                    return self.put_empty(ctx, key).await;
                };

                let parts = stream::once(async move { Ok(first) })
                    .chain(fill.into_stream())
                    .boxed();
                self.multipart(ctx, key, parts).await
            }
        }
    }

    /// The part size this execution planned with on its first run
    ///
    /// Recorded so a resumed execution slices the object exactly as before, even if
    /// the configuration changed in between.
    async fn recorded_part_size(&self, ctx: &StepContext, configured: u64) -> Result<u64> {
        ctx.run("plan", &self.policies.probe, || async move { Ok(configured) })
            .await
    }

    async fn put_empty(&self, ctx: &StepContext, key: &str) -> Result<TransferOutcome> {
        ctx.run("put-empty", &self.policies.complete, || async {
            self.destination
                .put_object(key, Bytes::new())
                .await
                .map_err(|source| TransferError::PutFailed {
                    key: key.to_string(),
                    source,
                })
        })
        .await?;

        info!(key, "Source object is empty, written with a single put");
        Ok(TransferOutcome {
            execution_id: ctx.execution_id(),
            key: key.to_string(),
            upload_id: None,
            parts: Vec::new(),
            bytes: 0,
        })
    }

    async fn multipart(
        &self,
        ctx: &StepContext,
        key: &str,
        parts: BoxStream<'_, Result<PartDescriptor>>,
    ) -> Result<TransferOutcome> {
        let upload_id: String = ctx
            .run("initiate", &self.policies.initiate, || {
                MultipartSession::initiate(self.destination.as_ref(), key)
            })
            .await?;

        let session = Arc::new(MultipartSession::open(key, upload_id.clone()));

        match self.upload_and_complete(ctx, &session, parts).await {
            Ok(parts) => Ok(TransferOutcome {
                execution_id: ctx.execution_id(),
                key: key.to_string(),
                upload_id: Some(upload_id),
                bytes: parts.iter().map(|p| p.size).sum(),
                parts,
            }),
            Err(e) if e.is_terminated() => {
                warn!(
                    upload_id = %upload_id,
                    "Execution terminated, multipart upload left open on destination"
                );
                Err(e)
            }
            Err(e) => {
                self.abort(ctx, &session, &e).await;
                Err(e)
            }
        }
    }

    async fn upload_and_complete(
        &self,
        ctx: &StepContext,
        session: &Arc<MultipartSession>,
        parts: BoxStream<'_, Result<PartDescriptor>>,
    ) -> Result<Vec<PartResult>> {
        let uploader = PartUploader::new(
            ctx.clone(),
            self.destination.clone(),
            self.source.clone(),
            session.clone(),
            self.policies.upload_part.clone(),
            self.progress.clone(),
        );

        let results = uploader
            .upload_all(parts, self.options.mode, self.options.max_concurrent_parts)
            .await?;

        ctx.run("complete", &self.policies.complete, || async {
            session
                .complete(self.destination.as_ref())
                .await
                .map(|_| ())
        })
        .await?;

        Ok(results)
    }

    /// Abort the upload after `cause`; failures here are logged, never returned
    async fn abort(&self, ctx: &StepContext, session: &MultipartSession, cause: &TransferError) {
        warn!(
            upload_id = %session.upload_id(),
            error = %cause,
            "Transfer failed, aborting multipart upload"
        );

        let result: Result<()> = ctx
            .run("abort", &self.policies.abort, || {
                session.abort(self.destination.as_ref())
            })
            .await;

        if let Err(abort_error) = result {
            error!(
                upload_id = %session.upload_id(),
                error = %abort_error,
                cause = %cause,
                "Abort failed, multipart upload left open on destination"
            );
        }
    }
}

/// Drop a finished execution and its recorded steps from the journal
///
/// Queued and running executions are kept, since a running one may still be
/// resumed.
pub async fn forget_execution(journal: &dyn StepJournal, id: ExecutionId) -> Result<()> {
    let execution = journal
        .get_execution(id)
        .await?
        .ok_or(TransferError::ExecutionNotFound(id))?;
    if !execution.status.is_terminal() {
        return Err(TransferError::ExecutionUnfinished {
            execution_id: id,
            status: execution.status,
        });
    }

    journal.delete_execution(id).await?;
    info!(execution_id = %id, key = %execution.key, "Forgot execution");
    Ok(())
}

fn ready_parts(parts: Vec<PartDescriptor>) -> BoxStream<'static, Result<PartDescriptor>> {
    stream::iter(parts.into_iter().map(Ok)).boxed()
}
