//! Commodity spot-price loader.
//!
//! Spot files come from a market-data export with a `Date` column
//! and one column per commodity, either comma-separated or in EU format
//! (`;` separator, `,` decimal).

use crate::models::CommodityPrice;
use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};

/// `;` when the header line contains one, else `,`.
pub fn detect_delimiter(header_line: &str) -> u8 {
    if header_line.contains(';') { b';' } else { b',' }
}

/// "2024-03-01" | "2024-03-01 00:00:00" | "01.03.2024"
pub fn parse_price_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let head = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(head, "%d.%m.%Y"))
        .ok()
}

/// Decimal comma or point; blanks and NaN are gaps.
pub fn parse_close(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("nan") || s == "N/A" {
        return None;
    }
    let v: f64 = s.replace(',', ".").parse().ok()?;
    v.is_finite().then_some(v)
}

/// Wide spot-price table → one [`CommodityPrice`] per (commodity, date), gaps kept as `None`.
pub fn load_commodity_csv(path: &Path) -> Result<Vec<CommodityPrice>> {
    let file = std::fs::File::open(path).with_context(|| format!("Could not open {:?}", path))?;
    let mut header_line = String::new();
    BufReader::new(file).read_line(&mut header_line)?;
    if header_line.trim().is_empty() {
        bail!("{:?} is empty", path);
    }
    let delimiter = detect_delimiter(&header_line);
    debug!("{:?}: delimiter {:?}", path, delimiter as char);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;

    let commodities: Vec<(usize, String)> = reader
        .headers()?
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, h)| (i, h.trim().to_string()))
        .filter(|(_, h)| !h.is_empty())
        .collect();

    let mut prices = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Row {} in {:?}: {}", i + 1, path, e);
                continue;
            }
        };
        let Some(date) = record.get(0).and_then(parse_price_date) else {
            warn!("Row {} in {:?}: unparseable date {:?}", i + 1, path, record.get(0));
            continue;
        };
        for (col, name) in &commodities {
            prices.push(CommodityPrice {
                commodity: name.clone(),
                date,
                close: record.get(*col).and_then(parse_close),
            });
        }
    }

    info!("{:?}: {} commodities, {} price cells", path, commodities.len(), prices.len());
    Ok(prices)
}
