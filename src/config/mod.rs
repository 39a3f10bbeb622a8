use crate::scraper::parsers::ExtractionRules;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub scraper: ScraperConfig,
    pub output: OutputConfig,
    pub storage: StorageConfig,
    pub enrich: EnrichConfig,
}

/// Scraper / page walker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    #[serde(default = "default_start_url")]
    pub start_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Stop once at least this many listings have been collected.
    #[serde(default = "default_target_count")]
    pub target_count: usize,

    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Base pause between result pages; `jitter_ms` of randomness is added on top.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// Settle time after a navigation before the markup is read.
    #[serde(default = "default_render_wait_ms")]
    pub render_wait_ms: u64,

    #[serde(default = "default_scroll_steps")]
    pub scroll_steps: u32,

    #[serde(default = "default_consent_selector")]
    pub consent_selector: Option<String>,

    #[serde(default = "default_next_page_selectors")]
    pub next_page_selectors: Vec<String>,

    #[serde(default)]
    pub rules: ExtractionRules,
}

/// Output file locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_listings_path")]
    pub listings_path: PathBuf,

    #[serde(default = "default_cleaned_path")]
    pub cleaned_path: PathBuf,

    #[serde(default = "default_merged_path")]
    pub merged_path: PathBuf,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,

    /// Also upsert scraped listings into DuckDB after the CSV is written.
    #[serde(default)]
    pub persist_listings: bool,
}

/// Cleaning / commodity join configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnrichConfig {
    #[serde(default = "default_commodity_path")]
    pub commodity_path: PathBuf,

    #[serde(default = "default_rolling_window")]
    pub rolling_window: usize,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_start_url() -> String {
    "https://www.autoscout24.ch/de/autos/alle-marken".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    "carprice-etl/0.1 (research project; commodity vs. used-car price study)".to_string()
}
fn default_target_count() -> usize {
    30
}
fn default_max_pages() -> u32 {
    200
}
fn default_request_delay_ms() -> u64 {
    3000
}
fn default_jitter_ms() -> u64 {
    4000
}
fn default_render_wait_ms() -> u64 {
    2000
}
fn default_scroll_steps() -> u32 {
    3
}
fn default_consent_selector() -> Option<String> {
    Some("#onetrust-accept-btn-handler".to_string())
}
fn default_next_page_selectors() -> Vec<String> {
    [
        "button[aria-label='next page']",
        "[data-testid='pagination-next']",
        "a[rel='next']",
        "button[aria-label*='next']",
        "button[aria-label*='Next']",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_listings_path() -> PathBuf {
    PathBuf::from("autoscout_data_complete.csv")
}
fn default_cleaned_path() -> PathBuf {
    PathBuf::from("cleaned_autoscout_data_complete.csv")
}
fn default_merged_path() -> PathBuf {
    PathBuf::from("merged_listings_commodities.csv")
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/carprice.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_commodity_path() -> PathBuf {
    PathBuf::from("API_data_pull/yahoo_spot.csv")
}
fn default_rolling_window() -> usize {
    7
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            start_url: default_start_url(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            target_count: default_target_count(),
            max_pages: default_max_pages(),
            request_delay_ms: default_request_delay_ms(),
            jitter_ms: default_jitter_ms(),
            render_wait_ms: default_render_wait_ms(),
            scroll_steps: default_scroll_steps(),
            consent_selector: default_consent_selector(),
            next_page_selectors: default_next_page_selectors(),
            rules: ExtractionRules::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            listings_path: default_listings_path(),
            cleaned_path: default_cleaned_path(),
            merged_path: default_merged_path(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
            persist_listings: false,
        }
    }
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            commodity_path: default_commodity_path(),
            rolling_window: default_rolling_window(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("CARPRICE").separator("__"))
            .build()?;

        cfg.try_deserialize().context("Invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sources_give_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.scraper.target_count, 30);
        assert_eq!(cfg.enrich.rolling_window, 7);
        assert_eq!(cfg.scraper.rules.article_selector, "article");
        assert!(cfg.storage.run_migrations);
    }

    #[test]
    fn test_partial_override() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[scraper]\ntarget_count = 120\njitter_ms = 0\n[output]\nlistings_path = \"out.csv\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.scraper.target_count, 120);
        assert_eq!(cfg.scraper.jitter_ms, 0);
        assert_eq!(cfg.scraper.request_delay_ms, 3000);
        assert_eq!(cfg.output.listings_path, PathBuf::from("out.csv"));
        assert_eq!(cfg.output.merged_path, default_merged_path());
    }
}
