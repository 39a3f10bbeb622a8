mod config;
mod enrich;
mod error;
mod loader;
mod models;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::loader::load_commodity_csv;
use crate::models::{CommodityMonthlyRecord, CommodityPrice, YearMonth};
use crate::pipeline::Pipeline;
use crate::storage::Repository;
use crate::storage::listings_csv::{read_listings, write_cleaned, write_merged};

#[derive(Parser)]
#[command(name = "carprice-etl", about = "Used-car listings vs. commodity prices ETL", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Walk the listing result pages and write the listings CSV
    Scrape {
        /// Stop once this many listings are collected
        #[arg(short, long)]
        target: Option<usize>,

        /// Output CSV (default: output.listings_path)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Split car_model into brand/model and write the cleaned CSV
    Clean {
        /// Listings CSV written by `scrape`
        input: PathBuf,

        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Load a daily commodity spot-price CSV into the database
    LoadCommodities {
        /// Spot-price CSV (default: enrich.commodity_path)
        path: Option<PathBuf>,
    },

    /// Join listings to monthly commodity averages and write the analysis CSV
    Merge {
        /// Raw or cleaned listings CSV
        listings: PathBuf,

        #[arg(short, long)]
        commodities: Option<PathBuf>,

        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Show database statistics
    Stats,

    /// Apply schema migrations without loading data
    Migrate,
}

/// Load, gap-fill and average one commodity file.
fn commodity_series(
    path: &Path,
    window: usize,
) -> Result<(Vec<CommodityPrice>, Vec<CommodityMonthlyRecord>)> {
    let mut prices = load_commodity_csv(path)
        .with_context(|| format!("Failed to load commodities from {:?}", path))?;
    let filled = enrich::impute_rolling_mean(&mut prices, window);
    let monthly = enrich::monthly_averages(&prices);
    info!(
        "{} daily prices ({} gaps filled), {} monthly averages",
        prices.len(), filled, monthly.len()
    );
    Ok((prices, monthly))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "carprice_etl=info,warn",
        1 => "carprice_etl=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let mut config = AppConfig::load()?;

    match cli.command {
        Command::Scrape { target, out } => {
            let _t = utils::Timer::start("Scrape");
            if let Some(target) = target {
                config.scraper.target_count = target;
            }
            if let Some(out) = out {
                config.output.listings_path = out;
            }
            let stats = Pipeline::new(config).run().await?;
            info!(
                "Done: {} listings from {} pages ({})",
                stats.records, stats.pages_visited, stats.stop
            );
        }

        Command::Clean { input, out } => {
            let _t = utils::Timer::start("Clean");
            let out = out.unwrap_or(config.output.cleaned_path);
            let cleaned: Vec<_> = read_listings(&input)?
                .into_iter()
                .map(enrich::clean_listing)
                .collect();
            let branded = cleaned.iter().filter(|c| c.brand.is_some()).count();
            write_cleaned(&out, &cleaned)?;
            info!(
                "Done: {} listings, brand found for {} ({})",
                cleaned.len(), branded, utils::fmt_pct(branded, cleaned.len())
            );
        }

        Command::LoadCommodities { path } => {
            let _t = utils::Timer::start("Commodity load");
            let path = path.unwrap_or(config.enrich.commodity_path);
            let (prices, monthly) = commodity_series(&path, config.enrich.rolling_window)?;

            let repo = Repository::open(&config.storage.db_path)?;
            if config.storage.run_migrations {
                repo.run_migrations()?;
            }
            let n = repo.upsert_commodity_prices(&prices)?;
            let m = repo.upsert_monthly(&monthly)?;
            info!("Done: {} prices, {} monthly rows stored", n, m);
        }

        Command::Merge { listings, commodities, out } => {
            let _t = utils::Timer::start("Merge");
            let commodities = commodities.unwrap_or(config.enrich.commodity_path);
            let out = out.unwrap_or(config.output.merged_path);

            let listings = read_listings(&listings)?;
            let (_, monthly) = commodity_series(&commodities, config.enrich.rolling_window)?;
            let reference_month = YearMonth::of(Utc::now().date_naive());
            let rows = enrich::build_analysis_rows(listings, &monthly, reference_month);
            write_merged(&out, &rows)?;
        }

        Command::Stats => {
            let repo = Repository::open(&config.storage.db_path)?;
            let listings = repo.listing_count()?;
            let prices = repo.price_count()?;
            let runs = repo.scrape_run_count()?;
            let commodities = repo.commodity_names()?;
            let (min, max) = repo.price_date_range().unwrap_or((None, None));
            let last_run = repo.last_scrape_run()?;
            println!("─────────────────────────────────");
            println!("  carprice-etl: Database Stats");
            println!("─────────────────────────────────");
            println!("  Listings     : {}", utils::fmt_number(listings));
            println!("  Scrape runs  : {}", utils::fmt_number(runs));
            println!("  Commodities  : {}", commodities.join(", "));
            println!("  Daily prices : {}", utils::fmt_number(prices));
            println!("  From         : {}", min.map(|d| d.to_string()).unwrap_or("—".into()));
            println!("  To           : {}", max.map(|d| d.to_string()).unwrap_or("—".into()));
            if let Some(run) = last_run {
                let took = run
                    .finished_at
                    .map(|f| format!("{}s", (f - run.started_at).num_seconds()))
                    .unwrap_or_else(|| "unfinished".into());
                println!(
                    "  Last run     : #{} {} ({}, {} pages, {} listings, {})",
                    run.id,
                    run.started_at.format("%Y-%m-%d %H:%M"),
                    took,
                    run.pages_visited,
                    run.listings,
                    run.stop_reason.as_deref().unwrap_or("—")
                );
            }
            println!("─────────────────────────────────");
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}
