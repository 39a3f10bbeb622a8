//! Page walker and scrape orchestration.
//!
//! ## Walk
//!
//! `FetchingPage → Extracting → Paginating → (FetchingPage | Done | Stalled)`
//!
//! * the walk ends cleanly when the target count is reached, when there is no
//!   usable "next" control, or when a page has no structured listings;
//! * any other failure stalls the walk. Records gathered so far are kept
//!   because they live in the caller's buffer, not in the walker.
//!
//! ## Run
//!
//! [`Pipeline::run`] owns the browser for the duration of one walk, races the
//! walk against Ctrl-C, closes the browser on every path and then writes the
//! listings CSV exactly once.

use crate::config::{AppConfig, ScraperConfig};
use crate::error::PageError;
use crate::models::ListingRecord;
use crate::scraper::merge::merge_page;
use crate::scraper::parsers::ListingExtractor;
use crate::scraper::{Browser, HttpBrowser};
use crate::storage::Repository;
use crate::storage::listings_csv::write_listings;
use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use url::Url;

// ── Walker states ─────────────────────────────────────────────────────────────

#[derive(Debug)]
enum WalkState {
    FetchingPage,
    Extracting(String),
    Paginating,
    Done(StopReason),
    Stalled(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    TargetReached,
    NoMorePages,
    EmptyPage,
    PageLimit,
    Stalled(String),
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::TargetReached => f.write_str("target count reached"),
            StopReason::NoMorePages => f.write_str("no further page"),
            StopReason::EmptyPage => f.write_str("page without structured listings"),
            StopReason::PageLimit => f.write_str("page limit reached"),
            StopReason::Stalled(e) => write!(f, "stalled: {}", e),
            StopReason::Interrupted => f.write_str("interrupted"),
        }
    }
}

// ── Walker ────────────────────────────────────────────────────────────────────

pub struct PageWalker {
    config: ScraperConfig,
    extractor: ListingExtractor,
}

impl PageWalker {
    pub fn new(config: ScraperConfig) -> Result<Self> {
        let extractor = ListingExtractor::new(config.rules.clone())
            .context("Invalid extraction rules")?;
        Ok(Self { config, extractor })
    }

    /// Walk result pages, appending merged records to `records` and counting
    /// visited pages in `pages`. Both survive the walk future being dropped.
    pub async fn walk<B: Browser + ?Sized>(
        &self,
        browser: &mut B,
        records: &mut Vec<ListingRecord>,
        pages: &mut u32,
    ) -> StopReason {
        *pages = 0;
        let mut state = WalkState::FetchingPage;

        loop {
            state = match state {
                WalkState::FetchingPage => {
                    *pages += 1;
                    info!("=== Page {} ===", *pages);
                    match self.fetch_page(browser, *pages).await {
                        Ok(markup) => WalkState::Extracting(markup),
                        Err(e) => WalkState::Stalled(format!("page {}: {:#}", *pages, e)),
                    }
                }

                WalkState::Extracting(markup) => {
                    let base = Url::parse(&self.config.start_url).ok();
                    match self.extract_page(&markup, base.as_ref()) {
                        Ok(merged) if merged.is_empty() => {
                            info!("Page {}: no structured listings, stopping", *pages);
                            WalkState::Done(StopReason::EmptyPage)
                        }
                        Ok(merged) => {
                            records.extend(merged);
                            info!("Total: {}/{}", records.len(), self.config.target_count);
                            if records.len() >= self.config.target_count {
                                WalkState::Done(StopReason::TargetReached)
                            } else {
                                WalkState::Paginating
                            }
                        }
                        Err(e) if e.is_terminal() => {
                            info!("Page {}: {}, stopping", *pages, e);
                            WalkState::Done(StopReason::EmptyPage)
                        }
                        Err(e) => WalkState::Stalled(format!("page {}: {}", *pages, e)),
                    }
                }

                WalkState::Paginating => {
                    if *pages >= self.config.max_pages {
                        warn!("Reached page limit ({}), stopping", self.config.max_pages);
                        WalkState::Done(StopReason::PageLimit)
                    } else {
                        match self.next_page(browser).await {
                            Ok(()) => {
                                self.polite_delay().await;
                                WalkState::FetchingPage
                            }
                            Err(e) => {
                                info!("No further page: {}", e);
                                WalkState::Done(StopReason::NoMorePages)
                            }
                        }
                    }
                }

                WalkState::Stalled(reason) => {
                    error!("Walk aborted, keeping {} records: {}", records.len(), reason);
                    return StopReason::Stalled(reason);
                }

                WalkState::Done(stop) => {
                    info!("Walk done after {} pages: {}", *pages, stop);
                    return stop;
                }
            };
        }
    }

    async fn fetch_page<B: Browser + ?Sized>(&self, browser: &mut B, page: u32) -> Result<String> {
        if page == 1 {
            browser
                .navigate(&self.config.start_url)
                .await
                .with_context(|| format!("Failed to open {}", self.config.start_url))?;
            self.accept_consent(browser).await;
        }
        browser.wait_until_ready().await?;

        // Lazy-loaded cards only render once scrolled into view.
        let steps = self.config.scroll_steps;
        for i in 1..=steps {
            browser.scroll(i as f32 / steps as f32).await?;
        }
        if steps > 0 {
            browser.scroll(0.0).await?;
        }

        browser.rendered_markup().await
    }

    async fn accept_consent<B: Browser + ?Sized>(&self, browser: &mut B) {
        let Some(sel) = self.config.consent_selector.as_deref() else { return };
        match browser.find_elements(sel).await {
            Ok(found) => {
                if let Some(button) = found.first() {
                    if let Err(e) = browser.click(button).await {
                        debug!("Consent click failed: {:#}", e);
                    }
                }
            }
            Err(e) => debug!("Consent lookup failed: {:#}", e),
        }
    }

    fn extract_page(
        &self,
        markup: &str,
        base: Option<&Url>,
    ) -> std::result::Result<Vec<ListingRecord>, PageError> {
        let structured = self.extractor.extract_structured(markup, base)?;
        info!("  Structured data: {} listings", structured.len());
        if structured.is_empty() {
            return Ok(Vec::new());
        }
        let visual = self.extractor.extract_visual(markup, base);
        Ok(merge_page(&structured, &visual))
    }

    /// Find the first enabled "next" control and click it.
    async fn next_page<B: Browser + ?Sized>(
        &self,
        browser: &mut B,
    ) -> std::result::Result<(), PageError> {
        browser.scroll(1.0).await?;

        for sel in &self.config.next_page_selectors {
            let found = match browser.find_elements(sel).await {
                Ok(found) => found,
                Err(e) => {
                    debug!("Selector {:?} failed: {:#}", sel, e);
                    continue;
                }
            };
            let Some(button) = found.into_iter().next() else { continue };

            if button.is_disabled() {
                return Err(PageError::Navigation("next control is disabled".into()));
            }
            debug!("Next control found via {:?}", sel);
            return browser
                .click(&button)
                .await
                .map_err(|e| PageError::Navigation(format!("{:#}", e)));
        }

        Err(PageError::Navigation("no next control".into()))
    }

    async fn polite_delay(&self) {
        let jitter = if self.config.jitter_ms > 0 {
            rand::random_range(0..=self.config.jitter_ms)
        } else {
            0
        };
        let total = Duration::from_millis(self.config.request_delay_ms + jitter);
        debug!("Sleeping {:?} before next page", total);
        sleep(total).await;
    }
}

// ── Run ───────────────────────────────────────────────────────────────────────

pub struct Pipeline {
    config: AppConfig,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> Result<ScrapeStats> {
        let mut browser = HttpBrowser::new(&self.config.scraper)
            .context("Failed to build browser")?;
        self.run_with(&mut browser, self.config.output.listings_path.clone())
            .await
    }

    /// Walk with `browser`, then always close it and write whatever was collected.
    pub async fn run_with<B: Browser + ?Sized>(
        &self,
        browser: &mut B,
        out: PathBuf,
    ) -> Result<ScrapeStats> {
        let walker = match PageWalker::new(self.config.scraper.clone()) {
            Ok(walker) => walker,
            Err(e) => {
                close_browser(browser).await;
                return Err(e);
            }
        };

        let store = self
            .config
            .storage
            .persist_listings
            .then(|| self.open_store());
        let run_id = match &store {
            Some(Ok(repo)) => match repo.begin_scrape_run() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!("Could not log scrape run start: {:#}", e);
                    None
                }
            },
            _ => None,
        };

        let mut records: Vec<ListingRecord> = Vec::new();
        let mut pages = 0u32;

        info!("=== Starting scrape (target {}) ===", self.config.scraper.target_count);

        let stop = tokio::select! {
            stop = walker.walk(browser, &mut records, &mut pages) => stop,
            _ = tokio::signal::ctrl_c() => StopReason::Interrupted,
        };
        if stop == StopReason::Interrupted {
            warn!(
                "Interrupted after {} pages, saving {} records collected so far",
                pages,
                records.len()
            );
        }

        close_browser(browser).await;

        write_listings(&out, &records)
            .with_context(|| format!("Failed to write {:?}", out))?;

        if let Some(store) = store {
            let repo = store?;
            let n = repo.upsert_listings(&records)?;
            if let Some(run_id) = run_id {
                if let Err(e) = repo.finish_scrape_run(run_id, pages, n, &stop.to_string()) {
                    warn!("Could not log scrape run {} finish: {:#}", run_id, e);
                }
            }
            info!("{} listings stored in {:?}", n, self.config.storage.db_path);
        }

        Ok(ScrapeStats {
            pages_visited: pages,
            records: records.len(),
            stop,
        })
    }

    fn open_store(&self) -> Result<Repository> {
        let repo = Repository::open(&self.config.storage.db_path)?;
        if self.config.storage.run_migrations {
            repo.run_migrations()?;
        }
        Ok(repo)
    }
}

async fn close_browser<B: Browser + ?Sized>(browser: &mut B) {
    if let Err(e) = browser.close().await {
        warn!("Browser close failed: {:#}", e);
    }
}

#[derive(Debug)]
pub struct ScrapeStats {
    pub pages_visited: u32,
    pub records: usize,
    pub stop: StopReason,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Transmission;
    use crate::scraper::Element;
    use crate::storage::listings_csv::read_listings;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Serves a fixed sequence of result pages; "next" is enabled on all but the last.
    struct ScriptedBrowser {
        pages: Vec<String>,
        current: Option<usize>,
        fail_on_page: Option<usize>,
        closed: bool,
    }

    impl ScriptedBrowser {
        fn new(pages: Vec<String>) -> Self {
            Self { pages, current: None, fail_on_page: None, closed: false }
        }
    }

    #[async_trait]
    impl Browser for ScriptedBrowser {
        async fn navigate(&mut self, _url: &str) -> Result<()> {
            self.current = Some(0);
            Ok(())
        }

        async fn wait_until_ready(&mut self) -> Result<()> {
            Ok(())
        }

        async fn rendered_markup(&mut self) -> Result<String> {
            let idx = self.current.context("not loaded")?;
            if self.fail_on_page == Some(idx) {
                anyhow::bail!("renderer crashed");
            }
            Ok(self.pages[idx].clone())
        }

        async fn find_elements(&mut self, selector: &str) -> Result<Vec<Element>> {
            let idx = self.current.context("not loaded")?;
            if !selector.contains("next page") {
                return Ok(vec![]);
            }
            let mut attrs = HashMap::new();
            if idx + 1 >= self.pages.len() {
                attrs.insert("aria-disabled".to_string(), "true".to_string());
            }
            Ok(vec![Element {
                selector: selector.to_string(),
                tag: "button".into(),
                attrs,
                text: String::new(),
            }])
        }

        async fn click(&mut self, _element: &Element) -> Result<()> {
            let idx = self.current.context("not loaded")?;
            self.current = Some(idx + 1);
            Ok(())
        }

        async fn scroll(&mut self, _fraction: f32) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    fn page(ids: &[u32]) -> String {
        let items: Vec<String> = ids
            .iter()
            .map(|id| {
                format!(
                    r#"{{"name":"Car {id}","url":"https://www.autoscout24.ch/de/d/car-{id}","offers":{{"price":{price}}}}}"#,
                    price = 10000 + id
                )
            })
            .collect();
        let cards: String = ids
            .iter()
            .map(|id| {
                format!(
                    r#"<article><a href="/de/d/car-{id}">x</a><div><svg><title>Transmission icon</title></svg><p>Automat</p></div></article>"#
                )
            })
            .collect();
        format!(
            r#"<html><head><script type="application/ld+json">{{"mainEntity":{{"offers":{{"itemListElement":[{}]}}}}}}</script></head><body>{}</body></html>"#,
            items.join(","),
            cards
        )
    }

    fn scraper_config(target: usize) -> ScraperConfig {
        ScraperConfig {
            target_count: target,
            request_delay_ms: 0,
            jitter_ms: 0,
            scroll_steps: 1,
            consent_selector: None,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_walk_stops_at_target() {
        let walker = PageWalker::new(scraper_config(3)).unwrap();
        let mut browser = ScriptedBrowser::new(vec![page(&[1, 2]), page(&[3, 4]), page(&[5])]);
        let mut records = Vec::new();
        let mut pages = 0;

        let stop = walker.walk(&mut browser, &mut records, &mut pages).await;
        assert_eq!(stop, StopReason::TargetReached);
        assert_eq!(pages, 2);
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.transmission == Transmission::Automatic));
    }

    #[tokio::test]
    async fn test_walk_stops_on_empty_page() {
        let walker = PageWalker::new(scraper_config(100)).unwrap();
        let mut browser = ScriptedBrowser::new(vec![page(&[1, 2]), page(&[]), page(&[3])]);
        let mut records = Vec::new();
        let mut pages = 0;

        let stop = walker.walk(&mut browser, &mut records, &mut pages).await;
        assert_eq!(stop, StopReason::EmptyPage);
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_walk_stops_when_next_disabled() {
        let walker = PageWalker::new(scraper_config(100)).unwrap();
        let mut browser = ScriptedBrowser::new(vec![page(&[1]), page(&[2])]);
        let mut records = Vec::new();
        let mut pages = 0;

        let stop = walker.walk(&mut browser, &mut records, &mut pages).await;
        assert_eq!(stop, StopReason::NoMorePages);
        assert_eq!(pages, 2);
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_walk_stalls_but_keeps_records() {
        let walker = PageWalker::new(scraper_config(100)).unwrap();
        let mut browser = ScriptedBrowser::new(vec![page(&[1, 2]), page(&[3])]);
        browser.fail_on_page = Some(1);
        let mut records = Vec::new();
        let mut pages = 0;

        let stop = walker.walk(&mut browser, &mut records, &mut pages).await;
        assert!(matches!(stop, StopReason::Stalled(_)));
        assert_eq!(pages, 2);
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_page_count_survives_dropped_walk() {
        let walker = PageWalker::new(ScraperConfig {
            request_delay_ms: 60_000,
            ..scraper_config(100)
        })
        .unwrap();
        let mut browser = ScriptedBrowser::new(vec![page(&[1]), page(&[2]), page(&[3])]);
        let mut records = Vec::new();
        let mut pages = 0;

        // The walk parks in the inter-page delay; the timeout drops it there.
        let walk = walker.walk(&mut browser, &mut records, &mut pages);
        let finished = tokio::time::timeout(Duration::from_millis(50), walk).await;
        assert!(finished.is_err());
        assert_eq!(pages, 1);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_run_writes_prior_pages_after_empty_page() {
        let out = std::env::temp_dir().join(format!("carprice_run_{}.csv", std::process::id()));
        let mut config = AppConfig::default();
        config.scraper = scraper_config(100);

        let pipeline = Pipeline::new(config);
        let mut browser = ScriptedBrowser::new(vec![page(&[1]), page(&[2, 3]), page(&[])]);

        let stats = tokio_test::block_on(pipeline.run_with(&mut browser, out.clone())).unwrap();
        assert_eq!(stats.stop, StopReason::EmptyPage);
        assert_eq!(stats.pages_visited, 3);
        assert_eq!(stats.records, 3);
        assert!(browser.closed);

        let back = read_listings(&out).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[2].car_model.as_deref(), Some("Car 3"));
        std::fs::remove_file(&out).ok();
    }

    #[test]
    fn test_bad_rules_still_close_browser() {
        let mut config = AppConfig::default();
        config.scraper = scraper_config(100);
        config.scraper.rules.article_selector = "[[[".into();

        let pipeline = Pipeline::new(config);
        let mut browser = ScriptedBrowser::new(vec![page(&[1])]);
        let out = std::env::temp_dir().join(format!("carprice_badrules_{}.csv", std::process::id()));

        assert!(tokio_test::block_on(pipeline.run_with(&mut browser, out.clone())).is_err());
        assert!(browser.closed);
        assert!(!out.exists());
    }

    #[test]
    fn test_run_log_brackets_the_walk() {
        let id = std::process::id();
        let out = std::env::temp_dir().join(format!("carprice_runlog_{}.csv", id));
        let db = std::env::temp_dir().join(format!("carprice_runlog_{}.duckdb", id));
        let mut config = AppConfig::default();
        config.scraper = ScraperConfig {
            request_delay_ms: 5,
            ..scraper_config(100)
        };
        config.storage.db_path = db.clone();
        config.storage.persist_listings = true;

        let pipeline = Pipeline::new(config);
        let mut browser = ScriptedBrowser::new(vec![page(&[1]), page(&[2, 3]), page(&[])]);
        tokio_test::block_on(pipeline.run_with(&mut browser, out.clone())).unwrap();

        let repo = Repository::open(&db).unwrap();
        let run = repo.last_scrape_run().unwrap().unwrap();
        assert!(run.started_at < run.finished_at.unwrap());
        assert_eq!(run.pages_visited, 3);
        assert_eq!(run.listings, 3);
        assert_eq!(run.stop_reason.as_deref(), Some("page without structured listings"));
        assert_eq!(repo.listing_count().unwrap(), 3);

        drop(repo);
        std::fs::remove_file(&out).ok();
        std::fs::remove_file(&db).ok();
        std::fs::remove_file(db.with_extension("duckdb.wal")).ok();
    }
}
