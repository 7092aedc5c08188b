//! SpareMap Daemon
//!
//! Demo control plane for the remapping engine: builds an in-memory
//! transport, a remap target, and the background scanner from CLI args,
//! runs a synthetic workload with injected faults, then serves until
//! ctrl-c and prints the final health report and statistics.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    SpareMap Daemon                     │
//! ├────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌──────────────┐   ┌──────────────┐   │
//! │  │  Scanner  │──▶│ Remap Target │◀──│  I/O Mapping │   │
//! │  │  (probe)  │   │  (decide)    │   │  (redirect)  │   │
//! │  └───────────┘   └──────────────┘   └──────────────┘   │
//! └────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::stream::{self, StreamExt};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sparemap::{
    DeviceRole, IoRequest, MemTransport, RemapTarget, SectorScanner, SystemClock, TargetConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// SpareMap - bad-sector remapping engine demo daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Size of the monitored main device in sectors
    #[arg(long, env = "MAIN_SECTORS", default_value = "65536")]
    main_sectors: u64,

    /// First sector of the spare area
    #[arg(long, env = "SPARE_START", default_value = "65536")]
    spare_start: u64,

    /// Size of the spare area in sectors
    #[arg(long, env = "SPARE_LEN", default_value = "1024")]
    spare_len: u64,

    /// Errors on one sector before it qualifies for auto-remap
    #[arg(long, env = "ERROR_THRESHOLD", default_value = "3")]
    error_threshold: u32,

    /// Disable automatic remapping
    #[arg(long, env = "NO_AUTO_REMAP")]
    no_auto_remap: bool,

    /// Scan cycle interval in milliseconds
    #[arg(long, env = "SCAN_INTERVAL_MS", default_value = "1000")]
    scan_interval_ms: u64,

    /// Sectors probed per scan cycle
    #[arg(long, env = "SECTORS_PER_SCAN", default_value = "256")]
    sectors_per_scan: u64,

    /// Faulty sectors to inject into the synthetic workload
    #[arg(long, env = "INJECT_FAULTS", default_value = "4")]
    inject_faults: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting SpareMap daemon");
    info!("  Main device: {} sectors", args.main_sectors);
    info!(
        "  Spare area: [{}, {})",
        args.spare_start,
        args.spare_start + args.spare_len
    );
    info!("  Error threshold: {}", args.error_threshold);
    info!("  Auto-remap: {}", !args.no_auto_remap);

    let config = TargetConfig {
        main_sectors: args.main_sectors,
        spare_start: args.spare_start,
        spare_len: args.spare_len,
        error_threshold: args.error_threshold,
        auto_remap_enabled: !args.no_auto_remap,
        scan_interval: Duration::from_millis(args.scan_interval_ms),
        sectors_per_scan: args.sectors_per_scan,
        ..Default::default()
    };

    let transport = Arc::new(MemTransport::new(
        args.main_sectors,
        args.spare_start + args.spare_len,
    ));
    let clock = Arc::new(SystemClock::new());
    let target = RemapTarget::new(config, transport.clone(), clock.clone())
        .context("failed to build remap target")?;

    // Seed some failing sectors so the scanner and auto-remap engine have
    // something to find.
    for i in 0..args.inject_faults {
        let sector = (i + 1) * 1000 % args.main_sectors;
        transport.inject_fault(DeviceRole::Main, sector);
        warn!(sector, "injected fault");
    }

    let scanner = Arc::new(SectorScanner::new(
        target.clone(),
        transport.clone(),
        clock,
    ));
    scanner.start().context("failed to start scanner")?;
    info!("Scanner running");

    run_workload(&target, args.main_sectors).await;

    info!("Daemon ready; press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down");
    scanner.stop().await.context("scanner shutdown")?;
    target.stop().await;

    println!("{}", target.generate_health_report());
    let stats = serde_json::to_string_pretty(&target.get_statistics())
        .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e));
    println!("{}", stats);
    println!(
        "{}",
        serde_json::to_string_pretty(&scanner.progress())
            .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
    );

    info!("Shutdown complete");
    Ok(())
}

/// Synthetic read/write mix over the first part of the device, retrying
/// failed sectors so the error threshold is crossed.
async fn run_workload(target: &Arc<RemapTarget>, main_sectors: u64) {
    let span = main_sectors.min(8192);
    stream::iter(0..span)
        .for_each_concurrent(32, |sector| async move {
            let req = if sector % 4 == 0 {
                IoRequest::write(sector, vec![0xA5; sparemap::SECTOR_SIZE].into())
            } else {
                IoRequest::read(sector)
            };
            if target.submit_io(req).await.is_err() {
                // Hammer the failing sector so auto-remap kicks in.
                for _ in 0..4 {
                    let _ = target.submit_io(IoRequest::read(sector)).await;
                }
            }
        })
        .await;
    info!(span, "synthetic workload complete");
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
