//! Reservation availability discovery pipeline.
//!
//! A single binary: `serve` runs the scheduler forever; the remaining
//! subcommands are one-shot admin ops against the same database.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reservation_watchdog::pipeline::provider::seated::SeatedProvider;
use reservation_watchdog::pipeline::provider::ProviderRegistry;
use reservation_watchdog::pipeline::{admin, config::Config, db::DbPool, health, scheduler};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "reservation-watchdog", about = "Reservation availability discovery pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the scheduler loop forever (default if no subcommand given).
    Serve,
    /// Refreshes every bucket's baseline in place without emitting events.
    RefreshBaselines,
    /// Deletes all buckets, leases, and drop events; buckets re-create on
    /// the next daily job and re-bootstrap on their next poll.
    ResetBuckets,
    /// Prints the current heartbeat + per-bucket health snapshot as JSON.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;
    let pool = DbPool::open(&config.database_path, config.db_pool_size).context("opening database pool")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(pool, config).await,
        Command::RefreshBaselines => refresh_baselines(pool, config).await,
        Command::ResetBuckets => reset_buckets(pool).await,
        Command::Health => print_health(pool, config).await,
    }
}

fn build_registry(config: &Config) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    let adapter = SeatedProvider::new(
        config.provider_api_key.clone(),
        config.provider_per_page,
        config.provider_max_pages,
        Duration::from_secs(config.provider_timeout_seconds),
    )
    .context("constructing provider adapter")?;
    registry.register(Arc::new(adapter));
    Ok(registry)
}

async fn serve(pool: DbPool, config: Config) -> Result<()> {
    info!(
        database = pool.path(),
        window_days = config.window_days,
        tick_interval_seconds = config.tick_interval_seconds,
        "reservation watchdog starting"
    );

    let registry = build_registry(&config)?;
    let conn = pool.checkout().await?;
    let date_range = reservation_watchdog::pipeline::bucket_registry::rolling_date_range(
        chrono::Utc::now().date_naive(),
        config.window_days,
    );
    let created = reservation_watchdog::pipeline::bucket_registry::ensure_buckets(&conn, &date_range, &config.time_slots)?;
    drop(conn);
    info!(created, "rolling window primed");

    scheduler::run(pool, registry, "seated", config).await;
    Ok(())
}

async fn refresh_baselines(pool: DbPool, config: Config) -> Result<()> {
    let registry = build_registry(&config)?;
    let adapter = registry
        .get("seated")
        .context("seated provider adapter not registered")?;
    let refreshed = admin::refresh_all_baselines(&pool, adapter, &config.party_sizes).await?;
    info!(refreshed, "baseline refresh complete");
    Ok(())
}

async fn reset_buckets(pool: DbPool) -> Result<()> {
    admin::reset_buckets(&pool).await?;
    info!("bucket reset complete");
    Ok(())
}

async fn print_health(pool: DbPool, config: Config) -> Result<()> {
    let conn = pool.checkout().await?;
    let snapshot = health::snapshot(&conn, chrono::Utc::now().timestamp(), config.stale_bucket_hours * 3600)?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reservation_watchdog=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv::dotenv();
    let manifest_dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];
    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
