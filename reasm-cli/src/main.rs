#![forbid(unsafe_code)]

//! `reasm` command line driver.
//!
//! Replays JSON-lines segment traces through the reassembler. Each trace is an independent
//! capture source; all of them share one flow table, so the same connection captured at
//! several points is reassembled once. `sniff` prints the decoded segments without reassembly.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reasm_capture::{CaptureSource, Pipeline, TraceSource};
use reasm_core::{ReasmConfig, CONFIG_ENV};
use reasm_stream::{LoggingConsumer, Reassembler, SourceId};

mod report;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (falls back to $REASM_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reassemble TCP streams from one or more segment traces
    Replay {
        /// JSON-lines trace files, one capture source each
        #[arg(required = true)]
        traces: Vec<PathBuf>,
        /// Override the ingestion queue capacity
        #[arg(short, long)]
        queue: Option<usize>,
        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print one summary line per segment, in trace order
    Sniff {
        /// JSON-lines trace files, read one after another
        #[arg(required = true)]
        traces: Vec<PathBuf>,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn load_config(explicit: Option<&Path>) -> Result<ReasmConfig> {
    if let Some(path) = explicit {
        return ReasmConfig::from_file(path).with_context(|| format!("loading {}", path.display()));
    }
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => ReasmConfig::from_file(&path)
            .with_context(|| format!("loading {} from ${CONFIG_ENV}", Path::new(&path).display())),
        None => Ok(ReasmConfig::default()),
    }
}

fn init_tracing(cfg: &ReasmConfig) {
    let level = cfg.log_level.clone().unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn cmd_replay(mut cfg: ReasmConfig, traces: &[PathBuf], queue: Option<usize>, json: bool) -> Result<()> {
    if let Some(capacity) = queue {
        cfg.pipeline.queue_capacity = capacity;
        cfg.validate()?;
    }

    let engine = Arc::new(Reassembler::new(cfg.reassembly.clone(), LoggingConsumer)?);
    let mut pipeline = Pipeline::new(Arc::clone(&engine), cfg.pipeline.clone())?;
    for (i, path) in traces.iter().enumerate() {
        let id = u16::try_from(i).context("too many trace files")?;
        let source = TraceSource::open(SourceId(id), path)
            .await
            .with_context(|| format!("opening trace {}", path.display()))?;
        pipeline.add_source(source);
    }
    info!(sources = traces.len(), "replaying traces");

    let report = pipeline
        .start()
        .join_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received"),
                Err(err) => {
                    warn!(%err, "cannot listen for interrupts");
                    future::pending::<()>().await;
                }
            }
        })
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report::render(&report));
    }

    let failed = report.failed_sources().count();
    if failed > 0 {
        bail!("{failed} capture source(s) failed");
    }
    Ok(())
}

async fn cmd_sniff(traces: &[PathBuf]) -> Result<()> {
    for path in traces {
        let mut source = TraceSource::open(SourceId(0), path)
            .await
            .with_context(|| format!("opening trace {}", path.display()))?;
        println!("Reading {}", path.display());
        let mut count = 0u64;
        while let Some(segment) = source
            .next_segment()
            .await
            .with_context(|| format!("reading {}", path.display()))?
        {
            println!("{}", report::segment_line(&segment));
            count += 1;
        }
        info!(trace = %path.display(), segments = count, "trace exhausted");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;
    init_tracing(&cfg);

    match cli.command {
        Commands::Replay { traces, queue, json } => cmd_replay(cfg, &traces, queue, json).await,
        Commands::Sniff { traces } => cmd_sniff(&traces).await,
        Commands::Config => {
            print!("{}", cfg.to_toml_string()?);
            Ok(())
        }
    }
}
