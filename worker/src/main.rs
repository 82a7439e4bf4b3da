mod analysis;
mod collective;
mod distributor;
mod processor;
mod report;

use clap::{Parser, ValueEnum};
use collective::{Collective, CollectiveError, LocalCollective, TcpCollective, WorkerContext};
use distributor::DistributeError;
use processor::{FrameProcessor, ProcessError};
use report::ReportWriter;
use spotscan_common::codec::ByteOffsetCodec;
use spotscan_common::config::{Config, ConfigError, OutputFormat};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const COORDINATOR_ENV: &str = "SPOTSCAN_COORDINATOR";

/// Find strong spots in CBF detector frames, sharing the files among a fixed
/// set of workers.
///
/// Worker identity comes from SPOTSCAN_RANK, SPOTSCAN_WORLD_SIZE and
/// SPOTSCAN_COORDINATOR; without them the process runs as a single worker.
#[derive(Parser, Debug)]
#[command(name = "spotscan-worker", version)]
struct Args {
    /// Glob patterns or explicit frame paths
    #[arg(required = true)]
    patterns: Vec<String>,

    /// TOML configuration file [default: config.toml if present]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format, overrides [output] format
    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    /// Analysis threads per worker, 0 for one per core; overrides [runtime] threads
    #[arg(long)]
    threads: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Text,
    Json,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Text => OutputFormat::Text,
            FormatArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum WorkerError {
    #[error(transparent)]
    Collective(#[from] CollectiveError),
    #[error(transparent)]
    Distribute(#[from] DistributeError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[tokio::main]
async fn main() {
    let started = Instant::now();

    let args = match Args::try_parse() {
        Ok(a) => a,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let mut config = match load_config(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(format) = args.format {
        config.output.format = format.into();
    }
    if let Some(threads) = args.threads {
        config.runtime.threads = threads;
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let ctx = match WorkerContext::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid worker identity");
            std::process::exit(1);
        }
    };
    let coordinator =
        std::env::var(COORDINATOR_ENV).unwrap_or_else(|_| config.collective.coordinator.clone());

    info!(
        rank = ctx.rank,
        size = ctx.size,
        coordinator = %coordinator,
        threads = config.runtime.threads,
        format = ?config.output.format,
        "starting spotscan worker"
    );

    let result = if ctx.size == 1 {
        run_worker(LocalCollective::single(), &args.patterns, &config, started).await
    } else {
        let timeout = Duration::from_secs(config.collective.connect_timeout_secs);
        match TcpCollective::establish(ctx, &coordinator, timeout).await {
            Ok(collective) => run_worker(collective, &args.patterns, &config, started).await,
            Err(e) => Err(e.into()),
        }
    };

    if let Err(e) = result {
        error!(rank = ctx.rank, error = %e, "worker failed");
        std::process::exit(1);
    }
}

/// An explicit config path must exist; the default path is optional.
fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Config::load(default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

async fn run_worker<C: Collective>(
    mut collective: C,
    patterns: &[String],
    config: &Config,
    started: Instant,
) -> Result<(), WorkerError> {
    let ctx = collective.context();

    let files = distributor::distribute(&mut collective, patterns).await?;
    let items = distributor::assigned(ctx, &files);
    info!(
        rank = ctx.rank,
        assigned = items.len(),
        total = files.len(),
        "processing assigned frames"
    );

    let processor = FrameProcessor::new(
        ctx,
        Arc::new(ByteOffsetCodec),
        config.detector.clone(),
        config.runtime.threads,
    )?;
    let mut report = ReportWriter::new(BufWriter::new(std::io::stdout()), config.output.format);
    processor.run(&items, &mut report).await?;

    collective.barrier().await?;
    if ctx.is_coordinator() {
        report
            .write_summary(ctx.size, started.elapsed())
            .map_err(ProcessError::Report)?;
    }
    Ok(())
}
