//! Listings CSV: fixed column order, `N/A` for anything absent.

use crate::models::{
    CleanedListing, ListingRecord, MergedAnalysisRow, NOT_AVAILABLE, PowerMode, ProductionDate,
    Transmission,
};
use crate::scraper::cleaner::parse_production_date;
use crate::utils::fmt_pct;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

pub const LISTING_COLUMNS: [&str; 9] = [
    "car_model",
    "price_chf",
    "mileage",
    "engine_power_hp",
    "power_mode",
    "production_date",
    "consumption_l_per_100km",
    "transmission",
    "listing_url",
];

fn or_na<T: ToString>(v: Option<T>) -> String {
    v.map(|x| x.to_string()).unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

/// `None` for the marker, otherwise the trimmed cell.
fn cell(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| *s != NOT_AVAILABLE)
}

pub fn listing_fields(r: &ListingRecord) -> [String; 9] {
    [
        or_na(r.car_model.as_deref()),
        or_na(r.price_chf),
        or_na(r.mileage),
        or_na(r.engine_power_hp),
        r.power_mode.to_string(),
        or_na(r.production_date),
        or_na(r.consumption_l_per_100km),
        r.transmission.to_string(),
        or_na(r.listing_url.as_deref()),
    ]
}

/// Parse the nine listing columns starting at `offset`.
fn listing_from_record(record: &csv::StringRecord, offset: usize) -> ListingRecord {
    let get = |i: usize| cell(record.get(offset + i));
    ListingRecord {
        car_model: get(0).map(str::to_string),
        price_chf: get(1).and_then(|s| s.parse().ok()),
        mileage: get(2).and_then(|s| s.parse().ok()),
        engine_power_hp: get(3).and_then(|s| s.parse().ok()),
        power_mode: get(4).map(PowerMode::from_csv).unwrap_or_default(),
        production_date: get(5)
            .and_then(|s| parse_production_date(s, ProductionDate::NEW_VEHICLE_LITERAL)),
        consumption_l_per_100km: get(6).and_then(|s| s.parse().ok()),
        transmission: get(7).map(Transmission::from_csv).unwrap_or_default(),
        listing_url: get(8).map(str::to_string),
    }
}

fn create_writer(path: &Path) -> Result<csv::Writer<std::fs::File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Could not create dir {:?}", parent))?;
    }
    csv::Writer::from_path(path).with_context(|| format!("Could not create {:?}", path))
}

/// Write every record, then log how often each field was populated.
pub fn write_listings(path: &Path, records: &[ListingRecord]) -> Result<()> {
    let mut writer = create_writer(path)?;
    writer.write_record(LISTING_COLUMNS)?;
    for r in records {
        writer.write_record(listing_fields(r))?;
    }
    writer.flush()?;

    info!("Saved {} listings to {:?}", records.len(), path);
    log_fill_rates(records);
    Ok(())
}

/// Listings CSV, with or without leading `brand,model` columns.
pub fn read_listings(path: &Path) -> Result<Vec<ListingRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Could not open {:?}", path))?;

    let offset = reader
        .headers()?
        .iter()
        .position(|h| h.trim() == "car_model")
        .with_context(|| format!("{:?} has no car_model column", path))?;

    let mut records = Vec::new();
    for (i, result) in reader.records().enumerate() {
        match result {
            Ok(row) => records.push(listing_from_record(&row, offset)),
            Err(e) => warn!("Row {} in {:?}: {}", i + 1, path, e),
        }
    }
    info!("{:?}: {} listings loaded", path, records.len());
    Ok(records)
}

/// Listings with `brand,model` prepended.
pub fn write_cleaned(path: &Path, rows: &[CleanedListing]) -> Result<()> {
    let mut writer = create_writer(path)?;

    let mut header = vec!["brand", "model"];
    header.extend(LISTING_COLUMNS);
    writer.write_record(&header)?;

    for row in rows {
        let mut fields = vec![or_na(row.brand.as_deref()), or_na(row.model.as_deref())];
        fields.extend(listing_fields(&row.listing));
        writer.write_record(&fields)?;
    }
    writer.flush()?;
    info!("Saved {} cleaned listings to {:?}", rows.len(), path);
    Ok(())
}

/// Analysis rows: cleaned listing, month, imputation flag, one column per commodity.
pub fn write_merged(path: &Path, rows: &[MergedAnalysisRow]) -> Result<()> {
    let commodities: Vec<&String> = rows
        .first()
        .map(|r| r.commodities.keys().collect())
        .unwrap_or_default();

    let mut writer = create_writer(path)?;

    let mut header: Vec<String> = ["brand", "model"].iter().map(|s| s.to_string()).collect();
    header.extend(LISTING_COLUMNS.iter().map(|s| s.to_string()));
    header.push("month".to_string());
    header.push("consumption_imputed".to_string());
    header.extend(commodities.iter().map(|c| format!("{}_Monthly_Avg", c)));
    writer.write_record(&header)?;

    for row in rows {
        let mut fields = vec![
            or_na(row.cleaned.brand.as_deref()),
            or_na(row.cleaned.model.as_deref()),
        ];
        fields.extend(listing_fields(&row.cleaned.listing));
        fields.push(or_na(row.month));
        fields.push(row.consumption_imputed.to_string());
        for c in &commodities {
            fields.push(or_na(row.commodities.get(*c).copied().flatten()));
        }
        writer.write_record(&fields)?;
    }
    writer.flush()?;
    info!("Saved {} merged rows ({} commodities) to {:?}", rows.len(), commodities.len(), path);
    Ok(())
}

fn log_fill_rates(records: &[ListingRecord]) {
    let total = records.len();
    let count = |f: fn(&ListingRecord) -> bool| records.iter().filter(|r| f(r)).count();

    let rates = [
        ("car_model", count(|r| r.car_model.is_some())),
        ("price_chf", count(|r| r.price_chf.is_some())),
        ("mileage", count(|r| r.mileage.is_some())),
        ("engine_power_hp", count(|r| r.engine_power_hp.is_some())),
        ("power_mode", count(|r| r.power_mode.is_known())),
        ("production_date", count(|r| r.production_date.is_some())),
        ("consumption_l_per_100km", count(|r| r.consumption_l_per_100km.is_some())),
        ("transmission", count(|r| r.transmission.is_known())),
        ("listing_url", count(|r| r.listing_url.is_some())),
    ];
    for (field, n) in rates {
        info!("  {:<24} {}/{} ({})", field, n, total, fmt_pct(n, total));
    }
}
