/*!
 * Ferry CLI - Command Line Interface
 */

use clap::{Parser, Subcommand, ValueEnum};
use ferry::{
    config::{FerryConfig, LogLevel},
    error::{Result, TransferError, EXIT_SUCCESS},
    logging,
    store::{ObjectStore, S3Store},
    forget_execution, ChunkStrategy, ExecutionId, ProgressReporter, StepJournal, TransferEngine,
    TransferRequest, UploadMode,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(version, about = "Durable multipart transfer between S3-compatible buckets", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to this file instead of stderr
    #[arg(long = "log", value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer an object from the source bucket to the destination bucket
    Transfer {
        /// Object key, used on both sides
        key: String,

        /// Part dispatch mode
        #[arg(short = 'm', long, value_enum)]
        mode: Option<UploadModeArg>,

        /// How the source object is divided into parts
        #[arg(short = 's', long, value_enum)]
        strategy: Option<ChunkStrategyArg>,

        /// Part size in MiB (min: 5, max: 5120)
        #[arg(long)]
        part_size: Option<u64>,

        /// Parts uploaded at once in concurrent mode
        #[arg(long)]
        concurrency: Option<usize>,

        /// Show a progress spinner on stderr
        #[arg(long = "show-progress")]
        show_progress: bool,
    },

    /// Resume an interrupted execution
    Resume {
        /// Execution ID
        id: ExecutionId,

        /// Show a progress spinner on stderr
        #[arg(long = "show-progress")]
        show_progress: bool,
    },

    /// Show the state of an execution
    Status {
        /// Execution ID
        id: ExecutionId,
    },

    /// List the recorded steps of an execution
    Steps {
        /// Execution ID
        id: ExecutionId,
    },

    /// Stop an execution before its next step
    Terminate {
        /// Execution ID
        id: ExecutionId,
    },

    /// Remove a finished execution and its recorded steps from the journal
    Forget {
        /// Execution ID
        id: ExecutionId,
    },

    /// Write a configuration file with default settings
    InitConfig {
        /// Output path
        path: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum UploadModeArg {
    Sequential,
    Concurrent,
}

impl From<UploadModeArg> for UploadMode {
    fn from(arg: UploadModeArg) -> Self {
        match arg {
            UploadModeArg::Sequential => UploadMode::Sequential,
            UploadModeArg::Concurrent => UploadMode::Concurrent,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum ChunkStrategyArg {
    Ranged,
    Streamed,
}

impl From<ChunkStrategyArg> for ChunkStrategy {
    fn from(arg: ChunkStrategyArg) -> Self {
        match arg {
            ChunkStrategyArg::Ranged => ChunkStrategy::Ranged,
            ChunkStrategyArg::Streamed => ChunkStrategy::Streamed,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => FerryConfig::from_file(path)?,
        None => FerryConfig::default(),
    };
    config.apply_log_overrides(cli.log_level.map(Into::into), cli.log.clone(), cli.verbose);

    if let Commands::InitConfig { path } = &cli.command {
        config.to_file(path)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    if let Err(e) = logging::init_logging(&config) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| TransferError::Config(format!("Failed to start async runtime: {}", e)))?;

    runtime.block_on(dispatch(cli.command, config))
}

async fn dispatch(command: Commands, mut config: FerryConfig) -> Result<()> {
    match command {
        Commands::Transfer {
            key,
            mode,
            strategy,
            part_size,
            concurrency,
            show_progress,
        } => {
            if let Some(mode) = mode {
                config.transfer.mode = mode.into();
            }
            if let Some(strategy) = strategy {
                config.transfer.strategy = strategy.into();
            }
            if let Some(mib) = part_size {
                config.transfer.part_size = mib * 1024 * 1024;
                config.transfer.buffer_capacity = (mib * 1024 * 1024) as usize;
            }
            if let Some(concurrency) = concurrency {
                config.transfer.max_concurrent_parts = concurrency;
            }

            let (engine, spinner) = build_engine(&config, show_progress).await?;
            let outcome = engine.transfer(TransferRequest::new(key)).await;
            finish_spinner(spinner);
            print_json(&outcome?)
        }
        Commands::Resume { id, show_progress } => {
            let (engine, spinner) = build_engine(&config, show_progress).await?;
            let outcome = engine.run(id).await;
            finish_spinner(spinner);
            print_json(&outcome?)
        }
        Commands::Status { id } => {
            let journal = open_journal(&config).await?;
            let execution = journal
                .get_execution(id)
                .await?
                .ok_or(TransferError::ExecutionNotFound(id))?;
            print_json(&execution)
        }
        Commands::Steps { id } => {
            let journal = open_journal(&config).await?;
            if journal.get_execution(id).await?.is_none() {
                return Err(TransferError::ExecutionNotFound(id));
            }
            print_json(&journal.list_steps(id).await?)
        }
        Commands::Terminate { id } => {
            let journal = open_journal(&config).await?;
            if journal.get_execution(id).await?.is_none() {
                return Err(TransferError::ExecutionNotFound(id));
            }
            if journal.terminate(id).await? {
                println!("Terminated {}", id);
            } else {
                println!("Execution {} had already finished", id);
            }
            Ok(())
        }
        Commands::Forget { id } => {
            let journal = open_journal(&config).await?;
            forget_execution(journal.as_ref(), id).await?;
            println!("Forgot {}", id);
            Ok(())
        }
        Commands::InitConfig { .. } => Ok(()),
    }
}

async fn open_journal(config: &FerryConfig) -> Result<Arc<dyn StepJournal>> {
    let journal = ferry_journal::open(&config.journal_path).await?;
    Ok(Arc::from(journal))
}

async fn build_engine(
    config: &FerryConfig,
    show_progress: bool,
) -> Result<(TransferEngine, Option<ProgressBar>)> {
    config.validate()?;

    let source: Arc<dyn ObjectStore> = Arc::new(
        S3Store::new(&config.source)
            .await
            .map_err(|e| TransferError::Config(format!("Source store: {}", e)))?,
    );
    let destination: Arc<dyn ObjectStore> = Arc::new(
        S3Store::new(&config.destination)
            .await
            .map_err(|e| TransferError::Config(format!("Destination store: {}", e)))?,
    );
    let journal = open_journal(config).await?;

    let mut engine = TransferEngine::new(source, destination, journal)
        .with_options(config.transfer.clone())
        .with_policies(config.policies.clone());

    let spinner = if show_progress {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {bytes} transferred ({bytes_per_sec}, {elapsed})")
                .map_err(|e| TransferError::Config(format!("Invalid progress template: {}", e)))?,
        );
        let sink = pb.clone();
        engine = engine.with_progress(ProgressReporter::new(move |bytes| sink.set_position(bytes)));
        Some(pb)
    } else {
        None
    };

    Ok((engine, spinner))
}

fn finish_spinner(spinner: Option<ProgressBar>) {
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
