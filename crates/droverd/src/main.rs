//! Drover migration adapter daemon (droverd).
//!
//! Loads the adapter configuration, opens the destination and every
//! legacy source, and runs the migration until shutdown:
//! 1. Import workers copy legacy history to the destination
//! 2. The read router serves whichever side holds each object
//! 3. Optional writeback mirrors live commits into their origin sources
//! 4. The completion detector latches once every source is done
//!
//! Usage:
//!   droverd [OPTIONS] <CONFIG>

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use drover::adapter::Adapter;
use drover::config::AdapterConfig;

/// Drover migration adapter daemon
#[derive(Parser, Debug)]
#[command(name = "droverd", version, about = "Live-migration storage adapter daemon")]
struct Args {
    /// Adapter configuration file (YAML)
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Seconds between import progress reports (0 to disable)
    #[arg(long, default_value_t = 60)]
    progress_interval: u64,

    /// Exit once every source is fully imported
    #[arg(long)]
    exit_on_complete: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("droverd v{} starting", env!("CARGO_PKG_VERSION"));

    let cfg = match AdapterConfig::load(&args.config).await {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("failed to load {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };

    let adapter = match Adapter::open(&cfg).await {
        Ok(adapter) => Arc::new(adapter),
        Err(e) => {
            error!("failed to open adapter: {}", e);
            std::process::exit(1);
        }
    };

    adapter.start().await;

    if args.progress_interval > 0 {
        tokio::spawn(report_progress(
            adapter.clone(),
            Duration::from_secs(args.progress_interval),
        ));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
        _ = adapter.wait_for_completion(), if args.exit_on_complete => {
            info!("every source imported, exiting as requested");
        }
    }

    adapter.shutdown().await;
    info!("droverd stopped");
}

/// Log import progress and writeback health at a fixed interval. Retires
/// once the import is complete and the writeback queue is drained; the
/// workers log their own completion and failures.
async fn report_progress(adapter: Arc<Adapter>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let status = adapter.status().await;
        for src in &status.sources {
            info!(
                "import {}: {}, cursor {} of {} ({:.1}%)",
                src.source, src.state, src.cursor, src.end, src.percent
            );
        }
        if let Some(wb) = &status.writeback {
            info!(
                "writeback: {} delivered, {} pending, {} failed",
                wb.delivered, wb.pending, wb.failed
            );
            for alert in &wb.alerts {
                warn!(
                    "writeback alert: transaction {} to source '{}': {}",
                    alert.tid, alert.source, alert.reason
                );
            }
        }
        let drained = status.writeback.as_ref().map_or(true, |wb| wb.pending == 0);
        if status.complete && drained {
            return;
        }
    }
}
