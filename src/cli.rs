use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{load_scan_pairs, AppConfig};
use crate::error::Result;

#[derive(Parser)]
#[command(name = "pairscan")]
#[command(version)]
#[command(about = "Tiered market-pair scanner with stale-while-revalidate caching", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Directory holding default.toml and environment overrides
    #[arg(short, long, default_value = "config", env = "PAIRSCAN_CONFIG_DIR", global = true)]
    pub config_dir: PathBuf,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the scheduler until Ctrl-C / SIGTERM (default)
    Run,
    /// List the configured scan pairs
    Pairs,
    /// Load and validate the configuration, then print a summary
    CheckConfig,
}

/// Print the pair definitions, marking the ones seeded into the scan set
pub fn show_pairs(config: &AppConfig) -> Result<()> {
    let pairs = load_scan_pairs(&config.scan.pairs_path)?;
    let scan_size = config.effective_scan_size(pairs.len());

    println!(
        "{} pairs in {} ({} seeded into the scan set)",
        pairs.len(),
        config.scan.pairs_path.display(),
        scan_size
    );
    for (idx, pair) in pairs.iter().enumerate() {
        let marker = if idx < scan_size { "*" } else { " " };
        println!(
            "{} {:<32} {:<16} dex={:<12} fees=[{}]",
            marker,
            pair.pair_key,
            pair.symbols,
            pair.dex_id.as_deref().unwrap_or("-"),
            pair.fee_tiers.join(",")
        );
    }
    Ok(())
}

pub fn check_config(config: &AppConfig) -> Result<()> {
    config.validate()?;

    let scheduler = config.scheduler_config();
    println!("Configuration OK");
    println!(
        "  cache:      ttl={:?} stale_window={:?}",
        config.cache_ttl(),
        config.stale_window().unwrap_or(config.cache_ttl() * 2)
    );
    println!(
        "  cadences:   hot={:?} warm={:?} cold={:?}",
        scheduler.cadences.hot, scheduler.cadences.warm, scheduler.cadences.cold
    );
    println!(
        "  rate limit: {} req/min global, hosts {:?}",
        config.rate_limit.global_reqs_per_min, config.rate_limit.hosts
    );
    match config.snapshot_path() {
        Some(path) => println!("  snapshot:   {}", path.display()),
        None => println!("  snapshot:   disabled"),
    }
    println!("  fetcher:    {} (host {})", config.fetcher.url_template, config.fetcher.host);
    Ok(())
}
