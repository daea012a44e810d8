//! ferry-journal: durable step records for crash-proof transfers
//!
//! # Overview
//!
//! A transfer execution is a sequence of named steps (size probe, initiate, one
//! step per part, complete, abort). Every step that succeeds has its serialized
//! result recorded under `(execution_id, step)`. A restarted execution consults the
//! journal before running a step and replays the recorded result instead of
//! repeating the side effect.
//!
//! The journal doubles as the execution registry: executions are created, queried
//! and terminated through the same [`StepJournal`] trait.
//!
//! # Features
//!
//! - **Idempotent records**: the first record for a step wins
//! - **Execution lifecycle**: queued → running → completed | failed, or terminated
//! - **Multiple Backends**: SQLite (default), redb (pure Rust) and in-memory
//!
//! # Example
//!
//! ```no_run
//! use ferry_journal::{ExecutionStatus, StepJournal};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let journal = ferry_journal::open("ferry.db").await?;
//!
//!     let id = journal.create_execution("videos/launch.mp4").await?;
//!     journal.set_status(id, ExecutionStatus::Running, None).await?;
//!
//!     if journal.load_step(id, "initiate").await?.is_none() {
//!         journal.record_step(id, "initiate", r#""upload-123""#).await?;
//!     }
//!
//!     journal.set_status(id, ExecutionStatus::Completed, None).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod backends;

pub use backends::memory::MemoryJournal;

#[cfg(feature = "sqlite")]
pub use backends::sqlite::SqliteJournal;

#[cfg(feature = "redb")]
pub use backends::redb::RedbJournal;

/// Unique identifier of a transfer execution
pub type ExecutionId = Uuid;

/// Lifecycle status of an execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Created, no step has run yet
    Queued,
    /// Steps executing, or suspended between steps after a crash
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Stopped by an external caller
    Terminated,
}

impl ExecutionStatus {
    /// Whether no further step may run under this status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Terminated
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Queued => write!(f, "queued"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Terminated => write!(f, "terminated"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(ExecutionStatus::Queued),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "terminated" => Ok(ExecutionStatus::Terminated),
            _ => Err(anyhow::anyhow!("Invalid execution status: {}", s)),
        }
    }
}

/// A durable transfer execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    /// Execution identifier
    pub id: ExecutionId,
    /// Object key the execution transfers
    pub key: String,
    /// Current lifecycle status
    pub status: ExecutionStatus,
    /// Root-cause error message (for Failed status)
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Create a new queued execution for `key`
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            status: ExecutionStatus::Queued,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The recorded result of one successful step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub execution_id: ExecutionId,
    /// Step name, unique within the execution
    pub step: String,
    /// JSON-encoded step output
    pub output: String,
    pub recorded_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(execution_id: ExecutionId, step: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            execution_id,
            step: step.into(),
            output: output.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Core trait for durable step storage backends
///
/// Implementations must make `record_step` atomic and first-write-wins so that
/// concurrent steps of one execution never overwrite each other's results, and
/// must keep records consistent across crashes.
#[async_trait]
pub trait StepJournal: Send + Sync {
    /// Create a new queued execution and return its identifier
    async fn create_execution(&self, key: &str) -> anyhow::Result<ExecutionId>;

    /// Look up an execution
    async fn get_execution(&self, id: ExecutionId) -> anyhow::Result<Option<Execution>>;

    /// Update the status of an execution
    ///
    /// Fails if the execution does not exist.
    async fn set_status(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> anyhow::Result<()>;

    /// Mark an execution as terminated
    ///
    /// Returns `false` when the execution had already reached a terminal status,
    /// in which case nothing changes.
    async fn terminate(&self, id: ExecutionId) -> anyhow::Result<bool> {
        let execution = self
            .get_execution(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Execution not found: {}", id))?;

        if execution.status.is_terminal() {
            return Ok(false);
        }

        self.set_status(id, ExecutionStatus::Terminated, None).await?;
        Ok(true)
    }

    /// Load the recorded result of a step, if it has completed before
    async fn load_step(&self, id: ExecutionId, step: &str) -> anyhow::Result<Option<StepRecord>>;

    /// Record the result of a successful step
    ///
    /// A second record for the same step is ignored.
    async fn record_step(&self, id: ExecutionId, step: &str, output: &str) -> anyhow::Result<()>;

    /// All recorded steps of an execution, ordered by step name
    async fn list_steps(&self, id: ExecutionId) -> anyhow::Result<Vec<StepRecord>>;

    /// Delete an execution and all its step records
    async fn delete_execution(&self, id: ExecutionId) -> anyhow::Result<()>;
}

/// Open a step journal at the specified path
///
/// The backend is selected from the path:
/// - `:memory:`: in-memory, lost on exit
/// - `.redb` / `.journal` extension: redb (requires the `redb` feature)
/// - anything else: SQLite
#[allow(clippy::needless_return)]
pub async fn open(path: &str) -> anyhow::Result<Box<dyn StepJournal>> {
    if path == ":memory:" {
        return Ok(Box::new(MemoryJournal::new()));
    }

    #[cfg(feature = "redb")]
    if path.ends_with(".redb") || path.ends_with(".journal") {
        let journal = RedbJournal::open(path)?;
        return Ok(Box::new(journal));
    }

    #[cfg(feature = "sqlite")]
    {
        let journal = SqliteJournal::open(path).await?;
        return Ok(Box::new(journal));
    }

    #[cfg(not(feature = "sqlite"))]
    Err(anyhow::anyhow!(
        "No backend available for path: {}. Enable 'sqlite' or 'redb' feature.",
        path
    ))
}
