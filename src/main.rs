#![allow(dead_code)]

mod client;
mod clock;
mod config;
mod db;
mod liquidity;

use crate::client::{LiquidityClient, RestClient};
use crate::clock::SystemClock;
use crate::liquidity::error::LiquidityError;
use crate::liquidity::{Manager, ManagerConfig, Suggestions};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use config::Config;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "autoloop", about = "Liquidity autopilot for lnd and loopd")]
struct Cli {
    /// Path to autoloop.toml config file
    #[arg(short, long, default_value = "autoloop.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as a background daemon (default)
    Daemon,
    /// Compute swap suggestions once, print them and exit
    Suggest,
    /// Print suggestion history from the database
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = config.general.log_level.clone();
    env_logger::Builder::new()
        .filter_level(log_level.parse().unwrap_or(log::LevelFilter::Info))
        .format_timestamp_secs()
        .init();

    info!("autoloop v{} starting", env!("CARGO_PKG_VERSION"));

    let db = db::Database::open(&config.general.database_path)?;
    let command = cli.command.unwrap_or(Commands::Daemon);
    if let Commands::Status = command {
        return print_status(&db);
    }

    if !config.general.enabled {
        warn!("Master switch is OFF -- exiting");
        return Ok(());
    }

    // Initialize components
    let client = Arc::new(RestClient::new(&config)?);
    let manager = Arc::new(Manager::with_parameters(
        ManagerConfig {
            client: client.clone(),
            swaps: client.clone(),
            clock: Arc::new(SystemClock),
        },
        config.liquidity.to_parameters(),
    )?);

    match command {
        Commands::Suggest => run_once(manager, db).await,
        _ => run_daemon(&config, client.as_ref(), manager, db).await,
    }
}

async fn run_daemon(
    config: &Config,
    client: &impl LiquidityClient,
    manager: Arc<Manager>,
    db: db::Database,
) -> anyhow::Result<()> {
    // Startup connectivity check
    info!("Verifying lnd and loopd connectivity...");
    let channels = client.list_channels().await.map_err(|e| {
        error!("Cannot reach lnd: {:#}. Aborting.", e);
        e
    })?;
    let terms = client.loop_out_restrictions().await.map_err(|e| {
        error!("Cannot reach loopd: {:#}. Aborting.", e);
        e
    })?;
    info!(
        "Connected: {} channels, loop out terms {}",
        channels.len(),
        terms
    );

    // Shutdown signal
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("Received shutdown signal, finishing current cycle...");
        signal_token.cancel();
    });

    let loop_task = {
        let manager = manager.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { manager.run(token).await })
    };

    let interval = std::time::Duration::from_secs(config.general.loop_interval_secs);
    info!(
        "Entering main loop (interval: {}s)",
        config.general.loop_interval_secs
    );

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        if let Err(e) = run_cycle(&manager, &db, &shutdown).await {
            error!("Cycle error: {:#}", e);
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = shutdown.cancelled() => break,
        }
    }

    info!("Shutting down gracefully");
    loop_task.await??;
    Ok(())
}

async fn run_once(manager: Arc<Manager>, db: db::Database) -> anyhow::Result<()> {
    info!("Running single cycle...");
    let shutdown = CancellationToken::new();
    let loop_task = {
        let manager = manager.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { manager.run(token).await })
    };

    let result = run_cycle(&manager, &db, &CancellationToken::new()).await;
    shutdown.cancel();
    loop_task.await??;

    if let Some(suggestions) = result? {
        println!("{}", serde_json::to_string_pretty(&suggestions)?);
    }
    info!("Single cycle complete");
    Ok(())
}

/// Ask the manager for suggestions, log them and record the cycle.
/// Returns `None` when the cycle was abandoned or the manager has no rules.
pub async fn run_cycle(
    manager: &Manager,
    db: &db::Database,
    ctx: &CancellationToken,
) -> anyhow::Result<Option<Suggestions>> {
    let outcome = manager.suggest_swaps(ctx).await;

    match &outcome {
        Err(LiquidityError::Cancelled) | Err(LiquidityError::ShuttingDown) => {
            info!("Cycle abandoned: manager stopping");
            return Ok(None);
        }
        Err(LiquidityError::NoRules) => {
            warn!("No liquidity rules configured, nothing to suggest");
        }
        Err(e) => error!("Swap suggestion failed: {}", e),
        Ok(suggestions) => {
            for swap in &suggestions.loop_out {
                info!("Suggested loop out: {}", swap);
            }
            for swap in &suggestions.loop_in {
                info!("Suggested loop in: {}", swap);
            }
            for dropped in &suggestions.dropped {
                info!(
                    "Dropped {} of {}: {}",
                    dropped.action, dropped.recommendation, dropped.reason
                );
            }
        }
    }

    db.record_cycle(Utc::now(), &outcome)?;

    match outcome {
        Ok(suggestions) => Ok(Some(suggestions)),
        Err(LiquidityError::NoRules) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn print_status(db: &db::Database) -> anyhow::Result<()> {
    let all_time = db.summary(chrono::DateTime::<Utc>::MIN_UTC)?;
    let last_day = db.summary(Utc::now() - Duration::hours(24))?;

    println!("autoloop Status");
    println!("===============");
    println!(
        "Suggestion cycles:      {} ({} failed)",
        all_time.cycles, all_time.failed_cycles
    );
    println!(
        "Loop out suggested:     {} ({} sat)",
        all_time.loop_out_count, all_time.loop_out_sats
    );
    println!(
        "Loop in suggested:      {} ({} sat)",
        all_time.loop_in_count, all_time.loop_in_sats
    );
    println!("Dropped suggestions:    {}", all_time.dropped_count);
    println!(
        "Last 24h:               {} cycles, {} loop out, {} loop in",
        last_day.cycles, last_day.loop_out_count, last_day.loop_in_count
    );
    match all_time.last_cycle_at {
        Some(at) => println!("Last cycle at:          {:.0} (unix)", at),
        None => println!("Last cycle at:          never"),
    }
    if let Some(e) = db.last_error()? {
        println!("Last cycle failed:      {}", e);
    }

    Ok(())
}
