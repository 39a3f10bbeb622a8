pub mod listings_csv;

use crate::models::{CommodityMonthlyRecord, CommodityPrice, ListingRecord};
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use duckdb::{Connection, params};
use std::path::Path;
use tracing::info;

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS listing_seq START 1;
CREATE SEQUENCE IF NOT EXISTS scrape_run_seq START 1;

CREATE TABLE IF NOT EXISTS listings (
    id                       BIGINT PRIMARY KEY DEFAULT nextval('listing_seq'),
    listing_url              VARCHAR UNIQUE,
    car_model                VARCHAR,
    price_chf                DOUBLE,
    mileage                  UBIGINT,
    engine_power_hp          UINTEGER,
    power_mode               VARCHAR NOT NULL,
    -- 'MM.YYYY' or 'Neues Fahrzeug'
    production_date          VARCHAR,
    consumption_l_per_100km  DOUBLE,
    transmission             VARCHAR NOT NULL,
    scraped_at               TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS commodity_prices (
    commodity   VARCHAR NOT NULL,
    date        DATE    NOT NULL,
    close       DOUBLE,
    PRIMARY KEY (commodity, date)
);

CREATE TABLE IF NOT EXISTS commodity_monthly (
    commodity     VARCHAR NOT NULL,
    month         DATE    NOT NULL,
    mean_price    DOUBLE  NOT NULL,
    observations  INTEGER NOT NULL,
    PRIMARY KEY (commodity, month)
);

CREATE TABLE IF NOT EXISTS scrape_runs (
    id              BIGINT PRIMARY KEY DEFAULT nextval('scrape_run_seq'),
    started_at      TIMESTAMP NOT NULL,
    finished_at     TIMESTAMP,
    pages_visited   INTEGER DEFAULT 0,
    listings        INTEGER DEFAULT 0,
    stop_reason     VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_prices_date   ON commodity_prices (date);
CREATE INDEX IF NOT EXISTS idx_monthly_month ON commodity_monthly (month);
"#;

// ── Repository ────────────────────────────────────────────────────────────────

/// One row of the scrape-run log.
#[derive(Debug, Clone)]
pub struct ScrapeRun {
    pub id: i64,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub pages_visited: i64,
    pub listings: i64,
    pub stop_reason: Option<String>,
}

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        self.conn.execute_batch(DDL).context("DDL failed")?;
        self.conn.execute_batch(INDEXES).context("Index creation failed")?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Listings ──────────────────────────────────────────────────────────────

    /// Listings with a URL are upserted on it; listings without one are appended.
    pub fn upsert_listings(&self, listings: &[ListingRecord]) -> Result<usize> {
        if listings.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().naive_utc();
        let tx = self.conn.unchecked_transaction()?;
        let sql = r#"
            INSERT INTO listings
                (listing_url, car_model, price_chf, mileage, engine_power_hp, power_mode,
                 production_date, consumption_l_per_100km, transmission, scraped_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (listing_url) DO UPDATE SET
                car_model               = COALESCE(excluded.car_model, listings.car_model),
                price_chf               = COALESCE(excluded.price_chf, listings.price_chf),
                mileage                 = COALESCE(excluded.mileage, listings.mileage),
                engine_power_hp         = COALESCE(excluded.engine_power_hp, listings.engine_power_hp),
                power_mode              = excluded.power_mode,
                production_date         = COALESCE(excluded.production_date, listings.production_date),
                consumption_l_per_100km = COALESCE(excluded.consumption_l_per_100km, listings.consumption_l_per_100km),
                transmission            = excluded.transmission,
                scraped_at              = excluded.scraped_at
        "#;

        for l in listings {
            tx.execute(
                sql,
                params![
                    l.listing_url,
                    l.car_model,
                    l.price_chf,
                    l.mileage,
                    l.engine_power_hp,
                    l.power_mode.as_str(),
                    l.production_date.map(|d| d.to_string()),
                    l.consumption_l_per_100km,
                    l.transmission.as_str(),
                    now,
                ],
            )
            .with_context(|| format!("upsert listing {:?}", l.listing_url))?;
        }
        tx.commit()?;
        Ok(listings.len())
    }

    pub fn listing_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM listings")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    // ── Commodities ───────────────────────────────────────────────────────────

    /// Upsert daily closes; re-running on the same file is a no-op.
    pub fn upsert_commodity_prices(&self, prices: &[CommodityPrice]) -> Result<usize> {
        if prices.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        let sql = r#"
            INSERT INTO commodity_prices (commodity, date, close)
            VALUES (?, ?, ?)
            ON CONFLICT (commodity, date) DO UPDATE SET
                close = COALESCE(excluded.close, commodity_prices.close)
        "#;
        for p in prices {
            tx.execute(sql, params![p.commodity, p.date, p.close])
                .with_context(|| format!("insert price {} {}", p.commodity, p.date))?;
        }
        tx.commit()?;
        Ok(prices.len())
    }

    pub fn upsert_monthly(&self, monthly: &[CommodityMonthlyRecord]) -> Result<usize> {
        if monthly.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        let sql = r#"
            INSERT INTO commodity_monthly (commodity, month, mean_price, observations)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (commodity, month) DO UPDATE SET
                mean_price   = excluded.mean_price,
                observations = excluded.observations
        "#;
        for m in monthly {
            tx.execute(
                sql,
                params![m.commodity, m.month.first_day(), m.mean_price, m.observations as i64],
            )
            .with_context(|| format!("insert monthly {} {}", m.commodity, m.month))?;
        }
        tx.commit()?;
        Ok(monthly.len())
    }

    pub fn commodity_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT commodity FROM commodity_prices ORDER BY commodity")?;
        let names: Vec<String> = stmt
            .query_map([], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(names)
    }

    pub fn price_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM commodity_prices")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn price_date_range(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        let mut s = self
            .conn
            .prepare("SELECT MIN(date), MAX(date) FROM commodity_prices")?;
        Ok(s.query_row([], |r| Ok((r.get(0)?, r.get(1)?)))?)
    }

    // ── Scrape run log ────────────────────────────────────────────────────────

    pub fn begin_scrape_run(&self) -> Result<i64> {
        let id: i64 = self.conn.query_row(
            "INSERT INTO scrape_runs (started_at) VALUES (?) RETURNING id",
            params![Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_scrape_run(
        &self, run_id: i64, pages: u32, listings: usize, stop_reason: &str,
    ) -> Result<()> {
        self.conn.execute(
            r#"UPDATE scrape_runs SET
               finished_at = ?, pages_visited = ?, listings = ?, stop_reason = ?
               WHERE id = ?"#,
            params![Utc::now().naive_utc(), pages, listings as i64, stop_reason, run_id],
        )?;
        Ok(())
    }

    pub fn last_scrape_run(&self) -> Result<Option<ScrapeRun>> {
        let mut s = self.conn.prepare(
            r#"SELECT id, started_at, finished_at,
                      CAST(pages_visited AS BIGINT), CAST(listings AS BIGINT), stop_reason
               FROM scrape_runs ORDER BY id DESC LIMIT 1"#,
        )?;
        let mut rows = s.query_map([], |r| {
            Ok(ScrapeRun {
                id: r.get(0)?,
                started_at: r.get(1)?,
                finished_at: r.get(2)?,
                pages_visited: r.get(3)?,
                listings: r.get(4)?,
                stop_reason: r.get(5)?,
            })
        })?;
        let run = rows.next().transpose()?;
        Ok(run)
    }

    pub fn scrape_run_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM scrape_runs")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PowerMode, YearMonth};

    fn repo() -> Repository {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        repo
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let repo = repo();
        repo.run_migrations().unwrap();
        assert_eq!(repo.listing_count().unwrap(), 0);
        assert!(repo.last_scrape_run().unwrap().is_none());
    }

    #[test]
    fn test_listing_upsert_keys_on_url() {
        let repo = repo();
        let a = ListingRecord {
            listing_url: Some("https://www.autoscout24.ch/de/d/a".into()),
            price_chf: Some(10000.0),
            power_mode: PowerMode::Petrol,
            ..Default::default()
        };
        let no_url = ListingRecord::default();

        repo.upsert_listings(&[a.clone(), no_url.clone()]).unwrap();
        repo.upsert_listings(&[a, no_url]).unwrap();
        // NULL urls never conflict, so only the keyed row is deduplicated.
        assert_eq!(repo.listing_count().unwrap(), 3);
    }

    #[test]
    fn test_commodity_upserts() {
        let repo = repo();
        let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        let prices = vec![
            CommodityPrice { commodity: "WTI_Spot".into(), date: d(2), close: Some(71.65) },
            CommodityPrice { commodity: "WTI_Spot".into(), date: d(3), close: None },
            CommodityPrice { commodity: "Copper_Spot".into(), date: d(2), close: Some(3.89) },
        ];
        repo.upsert_commodity_prices(&prices).unwrap();
        repo.upsert_commodity_prices(&prices).unwrap();
        assert_eq!(repo.price_count().unwrap(), 3);
        assert_eq!(repo.commodity_names().unwrap(), vec!["Copper_Spot", "WTI_Spot"]);
        assert_eq!(repo.price_date_range().unwrap(), (Some(d(2)), Some(d(3))));

        let monthly = vec![CommodityMonthlyRecord {
            commodity: "WTI_Spot".into(),
            month: YearMonth::new(2024, 1).unwrap(),
            mean_price: 71.65,
            observations: 1,
        }];
        assert_eq!(repo.upsert_monthly(&monthly).unwrap(), 1);
        assert_eq!(repo.upsert_monthly(&monthly).unwrap(), 1);
    }

    #[test]
    fn test_scrape_run_log() {
        let repo = repo();
        let id = repo.begin_scrape_run().unwrap();
        repo.finish_scrape_run(id, 3, 60, "target count reached").unwrap();
        assert_eq!(repo.scrape_run_count().unwrap(), 1);

        let run = repo.last_scrape_run().unwrap().unwrap();
        assert_eq!(run.id, id);
        assert_eq!(run.pages_visited, 3);
        assert_eq!(run.listings, 60);
        assert_eq!(run.stop_reason.as_deref(), Some("target count reached"));
        assert!(run.finished_at.is_some());
    }
}
