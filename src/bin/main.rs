use std::env;

use clap::Parser;
use log::{error, info};
use portal_sniper::config::{load_app_config, LoadArgs};
use portal_sniper::supervisor::PortalEngine;

/// Autonomous per-account trading engine for a gift/NFT marketplace.
///
/// Without `--live` the engine runs in dry-run: all place/cancel/update
/// calls are replaced by local bookkeeping.
#[derive(Parser, Debug)]
#[command(name = "portal-sniper", version)]
struct Cli {
    #[arg(long, env = "PORTAL_API_BASE")]
    api_base: Option<String>,

    #[arg(long, env = "AUTH_FILE")]
    auth_file: Option<String>,

    #[arg(long, env = "STRATEGY_FILE", default_value = "strategy.json")]
    strategy_file: String,

    #[arg(long, env = "PORTAL_ACCOUNTS_FILE")]
    accounts_file: Option<String>,

    #[arg(long, env = "STATE_DB_PATH")]
    state_db: Option<String>,

    /// Disable dry-run; place real offers/orders/listings.
    #[arg(long)]
    live: bool,

    /// Skip the warm-start pass that seeds the seen-cache before trading.
    #[arg(long)]
    no_warm_start: bool,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();

    let load_args = LoadArgs {
        strategy_file: cli.strategy_file,
        accounts_file: cli.accounts_file,
        auth_file: cli.auth_file,
        api_base_override: cli.api_base,
        state_db_override: cli.state_db,
        telegram_token_override: env::var("TELEGRAM_BOT_TOKEN").ok(),
        telegram_chat_ids_override: env::var("TELEGRAM_CHAT_IDS").ok(),
        telegram_enabled_override: env::var("TELEGRAM_ENABLED")
            .ok()
            .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on")),
    };

    let mut config = match load_app_config(load_args) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    config.runtime.dry_run = !cli.live;
    if cli.no_warm_start {
        config.runtime.warm_start = false;
    }

    info!(
        "starting portal-sniper: accounts={} dry_run={} api_base={}",
        config.accounts.len(),
        config.runtime.dry_run,
        config.api_base
    );

    let engine = match PortalEngine::start(config).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("failed to start engine: {e}");
            std::process::exit(1);
        }
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping workers");
    engine.shutdown().await;
    std::process::exit(0);
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
