//! # LOOTFORGE Server
//!
//! Headless drop server. On start it:
//!
//! 1. loads and validates the drop catalog
//! 2. opens the audit log and replays every committed record
//! 3. rebuilds the world drop counters from the audit trail
//! 4. sweeps expired daily/hourly windows on a fixed interval
//! 5. optionally feeds a synthetic kill stream through the coordinator
//!
//! ```bash
//! # Run with the bundled settings
//! ./lootforge_server --config data/server.toml
//!
//! # Check a catalog without starting
//! ./lootforge_server --config data/server.toml check
//!
//! # Balance check: resolve one pool 100k times
//! ./lootforge_server simulate-pool --pool wolf_common --iterations 100000
//! ```

mod logging;
mod settings;
mod simulation;

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use lootforge_drops::{
    DropCatalog, DropConfigSource, DropContext, DropPoolEngine, DropSource, LootGrantCoordinator,
    WalAuditLog, WorldDropLedger, WorldDropLimiter,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use settings::{LogFormat, Settings};

/// The coordinator the server runs.
pub type Coordinator = LootGrantCoordinator<DropCatalog, WalAuditLog>;

/// LOOTFORGE drop server
#[derive(Parser, Debug)]
#[command(name = "lootforge_server", version, about, long_about = None)]
pub struct Cli {
    /// Settings file
    #[arg(short, long, default_value = "data/server.toml")]
    pub config: PathBuf,

    /// Override the catalog path
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Override the audit log path
    #[arg(long)]
    pub audit_log: Option<PathBuf>,

    /// Override the log filter (RUST_LOG still wins)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override the log format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Ignore the [simulation] section
    #[arg(long)]
    pub no_simulation: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server (default)
    Serve,

    /// Load and validate the catalog, then exit
    Check,

    /// Resolve one pool repeatedly and print its drop table
    SimulatePool {
        /// Pool code
        #[arg(long)]
        pool: String,

        /// Player level
        #[arg(long, default_value_t = 30)]
        level: u16,

        /// Number of resolutions
        #[arg(long, default_value_t = 10_000)]
        iterations: u32,

        /// Seed for a reproducible run
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?.with_overrides(&cli);
    logging::init(&settings.logging)?;

    let catalog = Arc::new(
        DropCatalog::from_toml_file(&settings.server.catalog_path)
            .with_context(|| format!("loading catalog {}", settings.server.catalog_path.display()))?,
    );

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings, catalog).await,
        Command::Check => {
            info!(
                path = %settings.server.catalog_path.display(),
                world_drops = catalog.world_drops().len(),
                "catalog ok"
            );
            Ok(())
        }
        Command::SimulatePool { pool, level, iterations, seed } => {
            simulate_pool(&catalog, &pool, level, iterations, seed)
        }
    }
}

async fn serve(settings: Settings, catalog: Arc<DropCatalog>) -> Result<()> {
    let audit = Arc::new(
        WalAuditLog::open(&settings.server.audit_log_path)
            .with_context(|| format!("opening audit log {}", settings.server.audit_log_path.display()))?,
    );
    let ledger = WorldDropLedger::rebuild_from_records(&audit.snapshot(), Utc::now());
    let limiter = Arc::new(WorldDropLimiter::with_ledger(ledger, settings.lock_timeout()));
    let coordinator: Arc<Coordinator> =
        Arc::new(LootGrantCoordinator::new(catalog, limiter, Arc::clone(&audit)));

    let sweeper = tokio::spawn(sweep_windows(Arc::clone(&coordinator), settings.sweep_interval()));
    let simulator = settings
        .simulation
        .clone()
        .map(|sim| tokio::spawn(simulation::run(Arc::clone(&coordinator), sim)));

    info!(
        audit_records = audit.len(),
        sweep_secs = settings.server.sweep_interval_secs,
        simulation = simulator.is_some(),
        "lootforge server running"
    );

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown requested");

    sweeper.abort();
    if let Some(simulator) = simulator {
        simulator.abort();
    }
    audit.compact().context("compacting audit log")?;
    info!(records = audit.len(), "audit log compacted, bye");
    Ok(())
}

async fn sweep_windows(coordinator: Arc<Coordinator>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        // First tick fires immediately, covering windows that lapsed while down.
        ticker.tick().await;
        match tokio::task::block_in_place(|| coordinator.sweep_expired_windows()) {
            Ok(_) => {}
            Err(e) if e.is_retryable() => warn!(error = %e, "window sweep contended"),
            Err(e) => error!(error = %e, "window sweep failed"),
        }
    }
}

fn simulate_pool(
    catalog: &DropCatalog,
    code: &str,
    level: u16,
    iterations: u32,
    seed: Option<u64>,
) -> Result<()> {
    let pool = catalog
        .pool_by_code(code)
        .ok_or_else(|| anyhow!("no active pool with code '{code}'"))?;
    let mut rng = seed.map_or_else(ChaCha20Rng::from_entropy, ChaCha20Rng::seed_from_u64);
    let ctx = DropContext::new(0, 0, DropSource::monster(0), level);
    let stats = DropPoolEngine::new(catalog).simulate(pool, &ctx, &mut rng, iterations)?;

    println!("pool {} ({}) at level {level}, {iterations} resolutions", pool.code, pool.id);
    println!(
        "  grants/resolution: {:.3}   empty: {}",
        stats.grants_per_resolution(),
        stats.empty_resolutions
    );
    println!("  {:>8}  {:<24} {:>10} {:>8}", "item", "name", "count", "share");
    let mut by_count: Vec<_> = stats.item_counts.iter().map(|(&id, &n)| (id, n)).collect();
    by_count.sort_unstable_by_key(|&(id, n)| (Reverse(n), id));
    for (item_id, count) in by_count {
        let name = catalog.item(item_id).map_or("?", |i| i.name.as_str());
        println!(
            "  {item_id:>8}  {name:<24} {count:>10} {:>7.2}%",
            stats.item_share_percent(item_id)
        );
    }
    println!("  quality:");
    let qualities: BTreeMap<_, _> = stats.quality_counts.iter().collect();
    for (quality, count) in qualities {
        println!("    {quality:<10} {count}");
    }
    Ok(())
}
