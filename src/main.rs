use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use perpd::app::{self, RunMode};
use perpd::config::AppConfig;

#[derive(Parser)]
#[command(name = "perpd", about = "Off-chain synchronizer and trigger keepers")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "Perpd.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the global state synchronizer
    Sync,
    /// Run the limit / TP-SL trigger keeper
    OrdersKeeper,
    /// Run the liquidation trigger keeper
    LiquidationsKeeper,
}

fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if let Some(dir) = &config.logging.dir {
        let appender = tracing_appender::rolling::daily(dir, "perpd.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    let _log_guard = init_tracing(&config);

    let mode = match cli.command {
        Command::Sync => RunMode::Sync,
        Command::OrdersKeeper => RunMode::OrdersKeeper,
        Command::LiquidationsKeeper => RunMode::LiquidationsKeeper,
    };

    app::run(config, mode).await.context("process exited with error")?;
    Ok(())
}
