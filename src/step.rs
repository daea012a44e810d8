//! Durable step execution
//!
//! Every network-facing unit of work in a transfer runs as a named step:
//!
//! - **Retry with backoff**: failed attempts are retried up to `max_attempts` times,
//!   waiting a constant delay or one that grows with the attempt number
//! - **Timeout**: `timeout` bounds the unit as a whole, delays included. An optional
//!   `attempt_timeout` bounds each attempt; an attempt that runs over counts as failed
//! - **Checkpointing**: the successful result is serialized to JSON and recorded in
//!   the journal under `(execution_id, step name)`
//!
//! Re-entering a recorded step returns the recorded result without running the unit
//! again, which is what makes a restarted execution resume instead of starting over.
//!
//! # Example
//!
//! ```no_run
//! use ferry::step::{StepContext, StepPolicy};
//! use ferry_journal::{MemoryJournal, StepJournal};
//! use std::sync::Arc;
//!
//! # async fn example() -> ferry::Result<()> {
//! let journal: Arc<dyn StepJournal> = Arc::new(MemoryJournal::new());
//! let execution_id = journal.create_execution("a.bin").await?;
//! let ctx = StepContext::new(journal, execution_id);
//!
//! // Runs once; a second call with the same name replays the recorded 42
//! let answer: u64 = ctx
//!     .run("probe-size", &StepPolicy::probe(), || async { Ok(42) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{duration_ms, duration_ms_opt};
use crate::error::{Result, TransferError};
use ferry_journal::{ExecutionId, ExecutionStatus, StepJournal};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, debug_span, info, warn, Instrument};

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay before every retry
    Constant,
    /// Delay multiplied by the number of the failed attempt
    Exponential,
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

/// Retry, backoff and timeout settings of one step family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,

    pub backoff: BackoffKind,

    /// Bound on the whole unit, every attempt and delay included
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,

    /// Bound on a single attempt (None = only `timeout` applies)
    #[serde(
        rename = "attempt_timeout_ms",
        with = "duration_ms_opt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub attempt_timeout: Option<Duration>,

    /// Upper bound of the growing schedule
    #[serde(
        rename = "max_delay_ms",
        with = "duration_ms",
        default = "default_max_delay"
    )]
    pub max_delay: Duration,
}

impl StepPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff: BackoffKind, timeout: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff,
            timeout,
            attempt_timeout: None,
            max_delay: default_max_delay(),
        }
    }

    /// Bound every attempt separately
    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = Some(attempt_timeout);
        self
    }

    /// Set the cap of the growing schedule
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Constant => self.base_delay,
            BackoffKind::Exponential => self
                .base_delay
                .checked_mul(attempt.max(1))
                .map_or(self.max_delay, |delay| delay.min(self.max_delay)),
        }
    }

    /// Size lookup: 5 attempts, 500 ms exponential, 30 s per attempt, 2 min overall
    pub fn probe() -> Self {
        Self::new(
            5,
            Duration::from_millis(500),
            BackoffKind::Exponential,
            Duration::from_secs(120),
        )
        .with_attempt_timeout(Duration::from_secs(30))
    }

    /// Initiate: 5 attempts, 1 s exponential, 30 s per attempt, 2 min overall
    pub fn initiate() -> Self {
        Self::new(
            5,
            Duration::from_secs(1),
            BackoffKind::Exponential,
            Duration::from_secs(120),
        )
        .with_attempt_timeout(Duration::from_secs(30))
    }

    /// Part upload: 10 attempts, 2 s exponential, 5 min per attempt, 30 min overall
    pub fn upload_part() -> Self {
        Self::new(
            10,
            Duration::from_secs(2),
            BackoffKind::Exponential,
            Duration::from_secs(1800),
        )
        .with_attempt_timeout(Duration::from_secs(300))
    }

    /// Complete: 10 attempts, 1 s exponential, 60 s per attempt, 5 min overall
    pub fn complete() -> Self {
        Self::new(
            10,
            Duration::from_secs(1),
            BackoffKind::Exponential,
            Duration::from_secs(300),
        )
        .with_attempt_timeout(Duration::from_secs(60))
    }

    /// Abort: 3 attempts, 1 s constant, 30 s per attempt, 2 min overall
    pub fn abort() -> Self {
        Self::new(
            3,
            Duration::from_secs(1),
            BackoffKind::Constant,
            Duration::from_secs(120),
        )
        .with_attempt_timeout(Duration::from_secs(30))
    }

    /// Opening the source stream: 5 attempts, 1 s exponential, 60 s per attempt, 5 min overall
    pub fn open_stream() -> Self {
        Self::new(
            5,
            Duration::from_secs(1),
            BackoffKind::Exponential,
            Duration::from_secs(300),
        )
        .with_attempt_timeout(Duration::from_secs(60))
    }
}

/// Policies for every step family of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepPolicies {
    pub probe: StepPolicy,
    pub initiate: StepPolicy,
    pub upload_part: StepPolicy,
    pub complete: StepPolicy,
    pub abort: StepPolicy,
    pub open_stream: StepPolicy,
}

impl Default for StepPolicies {
    fn default() -> Self {
        Self {
            probe: StepPolicy::probe(),
            initiate: StepPolicy::initiate(),
            upload_part: StepPolicy::upload_part(),
            complete: StepPolicy::complete(),
            abort: StepPolicy::abort(),
            open_stream: StepPolicy::open_stream(),
        }
    }
}

impl StepPolicies {
    /// Apply `f` to every policy
    pub fn map(mut self, f: impl Fn(StepPolicy) -> StepPolicy) -> Self {
        self.probe = f(self.probe);
        self.initiate = f(self.initiate);
        self.upload_part = f(self.upload_part);
        self.complete = f(self.complete);
        self.abort = f(self.abort);
        self.open_stream = f(self.open_stream);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &StepPolicy)> {
        [
            ("probe", &self.probe),
            ("initiate", &self.initiate),
            ("upload_part", &self.upload_part),
            ("complete", &self.complete),
            ("abort", &self.abort),
            ("open_stream", &self.open_stream),
        ]
        .into_iter()
    }
}

/// Run `operation` under `policy` without recording anything
///
/// Used directly for work that cannot be checkpointed, such as opening a stream.
pub async fn retry<T, F, Fut>(step: &str, policy: &StepPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(policy.timeout, attempts(step, policy, operation)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(
                step,
                timeout_ms = policy.timeout.as_millis() as u64,
                "Step ran out of time"
            );
            Err(TransferError::StepTimeout {
                step: step.to_string(),
                timeout: policy.timeout,
            })
        }
    }
}

async fn attempts<T, F, Fut>(step: &str, policy: &StepPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome = match policy.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TransferError::StepTimeout {
                    step: step.to_string(),
                    timeout: limit,
                }),
            },
            None => operation().await,
        };

        let error = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    info!(step, attempt, "Step succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if error.is_permanent() {
            return Err(TransferError::StepFailed {
                step: step.to_string(),
                source: Box::new(error),
            });
        }

        if attempt >= max_attempts {
            warn!(step, attempts = attempt, error = %error, "Step exhausted its attempts");
            return Err(TransferError::StepExhausted {
                step: step.to_string(),
                attempts: attempt,
                source: Box::new(error),
            });
        }

        let delay = policy.delay_for(attempt);
        warn!(
            step,
            attempt,
            max_attempts,
            transient = error.is_retryable(),
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Step attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Runs named steps of one execution against the journal
#[derive(Clone)]
pub struct StepContext {
    journal: Arc<dyn StepJournal>,
    execution_id: ExecutionId,
}

impl StepContext {
    pub fn new(journal: Arc<dyn StepJournal>, execution_id: ExecutionId) -> Self {
        Self {
            journal,
            execution_id,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// The recorded result of `step`, if it completed before
    pub async fn replay<T: DeserializeOwned>(&self, step: &str) -> Result<Option<T>> {
        match self.journal.load_step(self.execution_id, step).await? {
            Some(record) => Ok(Some(serde_json::from_str(&record.output)?)),
            None => Ok(None),
        }
    }

    /// Fail with `Terminated` if an external caller stopped the execution
    pub async fn ensure_live(&self) -> Result<()> {
        let execution = self
            .journal
            .get_execution(self.execution_id)
            .await?
            .ok_or(TransferError::ExecutionNotFound(self.execution_id))?;

        if execution.status == ExecutionStatus::Terminated {
            return Err(TransferError::Terminated {
                execution_id: self.execution_id,
            });
        }
        Ok(())
    }

    /// Run `operation` as the durable step `step`
    ///
    /// A recorded result is returned as is. Otherwise the operation runs under
    /// `policy` and its result is recorded before being returned.
    pub async fn run<T, F, Fut>(&self, step: &str, policy: &StepPolicy, operation: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        if let Some(value) = self.replay(step).await? {
            debug!(execution_id = %self.execution_id, step, "Replayed recorded step");
            return Ok(value);
        }

        self.ensure_live().await?;

        let value = retry(step, policy, operation)
            .instrument(debug_span!("step", name = step))
            .await?;

        let output = serde_json::to_string(&value)?;
        self.journal
            .record_step(self.execution_id, step, &output)
            .await?;
        debug!(execution_id = %self.execution_id, step, "Recorded step");

        Ok(value)
    }
}
