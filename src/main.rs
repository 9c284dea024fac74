use clap::Parser;
use pairscan::adapters::{HttpPairFetcher, LoggingSink};
use pairscan::cli::{self, Cli, Commands};
use pairscan::config::{load_scan_pairs, AppConfig};
use pairscan::error::Result;
use pairscan::logging::{init_logging, init_logging_simple};
use pairscan::PairScanner;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config_dir)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_logging(&config.logging);
            run(config).await?;
        }
        Commands::Pairs => {
            init_logging_simple();
            cli::show_pairs(&config)?;
        }
        Commands::CheckConfig => {
            init_logging_simple();
            cli::check_config(&config)?;
        }
    }

    Ok(())
}

async fn run(config: AppConfig) -> Result<()> {
    config.validate()?;
    let pairs = load_scan_pairs(&config.scan.pairs_path)?;
    info!(
        "Loaded {} pair definitions from {}",
        pairs.len(),
        config.scan.pairs_path.display()
    );

    let fetcher = Arc::new(HttpPairFetcher::from_config(&config.fetcher)?);
    let scanner = PairScanner::build(&config, &pairs, fetcher, Some(Arc::new(LoggingSink))).await?;

    scanner.start().await;
    scanner.scheduler().await_ready().await;
    info!(
        "Scanning {} pairs (Ctrl-C to stop)",
        scanner.store().get_scan_set().await.len()
    );

    shutdown_signal().await;
    info!("Shutdown signal received, stopping scheduler");
    scanner.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
