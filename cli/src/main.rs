use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pitr_kernel::{Config, Pitr};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Compact a window of a change log into one net stream per table
#[derive(Parser, Debug)]
#[command(name = "pitr")]
#[command(about = "Point-in-time recovery log compaction", long_about = None)]
struct Cli {
    /// Path to a JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the input log files
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Directory receiving the compacted streams
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Parent directory of the working files
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// First commit ts of the window
    #[arg(long)]
    start_ts: Option<i64>,

    /// Last commit ts of the window (0 = unbounded)
    #[arg(long)]
    stop_ts: Option<i64>,

    /// Bytes of row events one table pass may hold
    #[arg(long)]
    memory_budget: Option<u64>,

    /// Tables compacted in parallel
    #[arg(long)]
    workers: Option<usize>,

    /// JSON array of DDL statements replayed before the run
    #[arg(long)]
    history_ddl: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(dir) = self.dir {
            config.dir = dir;
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if let Some(temp_dir) = self.temp_dir {
            config.temp_dir = temp_dir;
        }
        if let Some(start_ts) = self.start_ts {
            config.start_ts = start_ts;
        }
        if let Some(stop_ts) = self.stop_ts {
            config.stop_ts = stop_ts;
        }
        if let Some(memory_budget) = self.memory_budget {
            config.memory_budget = memory_budget;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.history_ddl.is_some() {
            config.history_ddl = self.history_ddl;
        }

        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries the manifest
    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = cli.into_config()?;
    let pitr = Pitr::new(config).context("failed to set up pitr run")?;
    let manifest = pitr.process().context("pitr run failed")?;
    info!(
        output = %pitr.config().output_dir.display(),
        tables = manifest.tables.len(),
        "compaction complete"
    );

    println!("{}", serde_json::to_string_pretty(&manifest)?);

    Ok(())
}
