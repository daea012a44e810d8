/*!
 * Configuration types for ferry
 */

use crate::error::{Result, TransferError};
use crate::step::StepPolicies;
use crate::transfer::TransferOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Smallest part S3 accepts (except for the last part)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest part S3 accepts
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Upper bound for concurrent part uploads
pub const MAX_CONCURRENT_PARTS: usize = 64;

/// Serialize a `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serialize an optional `Duration` as integer milliseconds
pub(crate) mod duration_ms_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

/// Connection settings for one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bucket name
    pub bucket: String,

    /// AWS region (None = provider chain)
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible services
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Explicit credentials (None = provider chain)
    #[serde(default)]
    pub access_key: Option<String>,

    #[serde(default)]
    pub secret_key: Option<String>,

    #[serde(default)]
    pub session_token: Option<String>,

    /// Path-style addressing (MinIO, LocalStack)
    #[serde(default)]
    pub force_path_style: bool,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    300
}

impl StoreConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: None,
            endpoint: None,
            access_key: None,
            secret_key: None,
            session_token: None,
            force_path_style: false,
            timeout_seconds: default_timeout_seconds(),
        }
    }

    /// Check the settings without contacting the store
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(TransferError::Config(
                "Bucket name cannot be empty".to_string(),
            ));
        }

        if !is_valid_bucket_name(&self.bucket) {
            return Err(TransferError::Config(format!(
                "Invalid bucket name: {}. Bucket names must be 3-63 characters, \
                 lowercase letters, numbers, hyphens, and periods only",
                self.bucket
            )));
        }

        if self.access_key.is_some() != self.secret_key.is_some() {
            return Err(TransferError::Config(format!(
                "Bucket {}: access_key and secret_key must be set together",
                self.bucket
            )));
        }

        if self.timeout_seconds == 0 {
            return Err(TransferError::Config(
                "timeout_seconds must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn is_valid_bucket_name(name: &str) -> bool {
    if !(3..=63).contains(&name.len()) {
        return false;
    }

    // Must start and end with lowercase letter or number
    let edge_ok = |c: Option<char>| matches!(c, Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit());
    if !edge_ok(name.chars().next()) || !edge_ok(name.chars().last()) {
        return false;
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return false;
    }

    if name.contains("..") {
        return false;
    }

    // Cannot be formatted as IP address
    name.parse::<std::net::Ipv4Addr>().is_err()
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn default_journal_path() -> String {
    "ferry.db".to_string()
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FerryConfig {
    /// Step journal location (`:memory:`, `*.redb`, or a SQLite file)
    #[serde(default = "default_journal_path")]
    pub journal_path: String,

    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,

    /// Bucket objects are read from
    pub source: StoreConfig,

    /// Bucket objects are written to
    pub destination: StoreConfig,

    #[serde(default)]
    pub transfer: TransferOptions,

    #[serde(default)]
    pub policies: StepPolicies,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            journal_path: default_journal_path(),
            log_level: LogLevel::Info,
            log_file: None,
            verbose: false,
            source: StoreConfig::new("source-bucket"),
            destination: StoreConfig::new("destination-bucket"),
            transfer: TransferOptions::default(),
            policies: StepPolicies::default(),
        }
    }
}

impl FerryConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TransferError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&contents)
            .map_err(|e| TransferError::Config(format!("Invalid {}: {}", path.display(), e)))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| TransferError::Config(format!("Cannot serialize config: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| {
            TransferError::Config(format!("Cannot write {}: {}", path.display(), e))
        })
    }

    /// Apply logging flags given on the command line
    ///
    /// Flags left out keep the file's settings; `verbose` can only be switched on.
    pub fn apply_log_overrides(
        &mut self,
        log_level: Option<LogLevel>,
        log_file: Option<PathBuf>,
        verbose: bool,
    ) {
        if let Some(level) = log_level {
            self.log_level = level;
        }
        if log_file.is_some() {
            self.log_file = log_file;
        }
        self.verbose |= verbose;
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        self.source.validate()?;
        self.destination.validate()?;

        if self.journal_path.is_empty() {
            return Err(TransferError::Config(
                "journal_path cannot be empty".to_string(),
            ));
        }

        let transfer = &self.transfer;
        for (name, size) in [
            ("part_size", transfer.part_size),
            ("buffer_capacity", transfer.buffer_capacity as u64),
        ] {
            if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&size) {
                return Err(TransferError::Config(format!(
                    "{} {} is outside {}..={}",
                    name, size, MIN_PART_SIZE, MAX_PART_SIZE
                )));
            }
        }

        if !(1..=MAX_CONCURRENT_PARTS).contains(&transfer.max_concurrent_parts) {
            return Err(TransferError::Config(format!(
                "max_concurrent_parts must be between 1 and {}",
                MAX_CONCURRENT_PARTS
            )));
        }

        for (name, policy) in self.policies.iter() {
            if policy.max_attempts == 0 {
                return Err(TransferError::Config(format!(
                    "policies.{}.max_attempts must be at least 1",
                    name
                )));
            }
            if policy.timeout.is_zero() {
                return Err(TransferError::Config(format!(
                    "policies.{}.timeout_ms must be greater than zero",
                    name
                )));
            }
            if policy.attempt_timeout.is_some_and(|limit| limit.is_zero()) {
                return Err(TransferError::Config(format!(
                    "policies.{}.attempt_timeout_ms must be greater than zero",
                    name
                )));
            }
        }

        Ok(())
    }
}
