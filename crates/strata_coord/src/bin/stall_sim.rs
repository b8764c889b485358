//! Synthetic stall workload for eyeballing health-monitor hysteresis.
//!
//! Drives a `HealthMonitor` with randomized per-worker stall and
//! queue-stall reports and logs every state transition, so tuning the
//! window thresholds and timer parameters can be done against a live
//! signal instead of unit-test arithmetic.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use strata_coord::{CoordStats, HealthMonitor, HealthMonitorConfig};

/// CLI options for the stall simulator.
#[derive(Parser, Debug)]
#[command(name = "stall-sim")]
struct Args {
    /// Number of simulated workers.
    #[arg(long, env = "STRATA_SIM_WORKERS", default_value_t = 8)]
    workers: usize,

    /// Total simulation runtime.
    #[arg(long, default_value = "30s")]
    duration: humantime::Duration,

    /// Interval between injection rounds.
    #[arg(long, default_value = "20ms")]
    inject_every: humantime::Duration,

    /// Percent chance per round that a worker reports a request stall.
    #[arg(long, env = "STRATA_SIM_STALL_PCT", default_value_t = 5)]
    stall_pct: u8,

    /// Percent chance per round that a worker reports a queue stall.
    #[arg(long, env = "STRATA_SIM_QUEUE_STALL_PCT", default_value_t = 20)]
    queue_stall_pct: u8,

    /// Longest injected stall, in milliseconds.
    #[arg(long, default_value_t = 150)]
    max_stall_ms: u64,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Optional JSON file overriding the default `HealthMonitorConfig`.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,strata_coord=debug".into()),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let raw = std::fs::read(path)
                .with_context(|| format!("read config file {}", path.display()))?;
            serde_json::from_slice::<HealthMonitorConfig>(&raw)
                .with_context(|| format!("parse config file {}", path.display()))?
        }
        None => HealthMonitorConfig::default(),
    };

    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let mut rng = SmallRng::seed_from_u64(seed);
    tracing::info!(
        seed,
        workers = args.workers,
        stall_pct = args.stall_pct,
        queue_stall_pct = args.queue_stall_pct,
        "starting stall simulation"
    );

    let stats = Arc::new(CoordStats::new());
    let monitor = HealthMonitor::start_up(config, args.workers, Arc::clone(&stats));

    let max_stall_ms = args.max_stall_ms.max(1);
    let inject_every = (*args.inject_every).max(Duration::from_millis(1));
    let deadline = tokio::time::Instant::now() + *args.duration;
    let mut ticker = tokio::time::interval(inject_every);
    let mut last_state = monitor.node_state();

    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        for worker in 0..args.workers {
            if rng.gen_range(0..100) < args.stall_pct as u32 {
                let stall = Duration::from_millis(rng.gen_range(1..=max_stall_ms));
                monitor.report_worker_stall(worker, stall);
            }
            if rng.gen_range(0..100) < args.queue_stall_pct as u32 {
                let stall = Duration::from_millis(rng.gen_range(1..=max_stall_ms));
                monitor.report_worker_queue_stall(worker, stall);
            }
        }

        let state = monitor.node_state();
        if state != last_state {
            tracing::info!(previous = ?last_state, current = ?state, "state transition");
            last_state = state;
        }
    }

    monitor.shutdown().await;

    let snapshot = stats.snapshot();
    tracing::info!(
        loops = snapshot.health_monitor_num_loops,
        stalled_ticks = snapshot.health_monitor_stall_indicator,
        overloaded_ticks = snapshot.health_monitor_overload_indicator,
        healthy_ticks = snapshot.health_monitor_state_indicator,
        "simulation finished"
    );
    Ok(())
}
