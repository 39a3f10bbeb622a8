//! Cleaning and commodity join for the analysis stage.
//!
//! Listings get a brand and a top-level model, gaps in consumption are filled
//! from comparable cars, commodity spot series are gap-filled and averaged per
//! calendar month, and every listing is joined to the averages of the month
//! its car was first registered.

use crate::models::{
    CleanedListing, CommodityMonthlyRecord, CommodityPrice, ListingRecord, MergedAnalysisRow,
    PowerMode, ProductionDate, YearMonth,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

// ── Brand / model ─────────────────────────────────────────────────────────────

/// Known brand prefixes. Longer names that share a prefix come first.
const BRANDS: &[&str] = &[
    "Mercedes-Benz", "Mercedes", "Alfa Romeo", "Land Rover", "Range Rover", "BMW", "Audi",
    "VW", "Volkswagen", "Porsche", "Tesla", "Volvo", "Ford", "Toyota", "Honda", "Mazda",
    "Nissan", "Hyundai", "Kia", "Seat", "Skoda", "Peugeot", "Renault", "Citroën", "Citroen",
    "Opel", "Fiat", "Jeep", "Jaguar", "Mini", "Smart", "Subaru", "Suzuki", "Mitsubishi",
    "Lexus", "Infiniti", "Cupra", "DS",
];

/// Substring of the listing title → standard model name, first match wins.
const MODEL_OVERRIDES: &[(&str, &str)] = &[
    ("AUDI e-tron", "e-tron"),
    ("AUDI 2.0 TDI", "2.0 TDI"),
    ("6.0 Double Six", "6.0"),
    ("4x4 Country Club", "4x4 Country Club"),
    ("FORD S-Max", "S-Max"),
    ("FORD C-Max", "C-Max"),
    ("JAGUAR I-Pace", "I-Pace"),
    ("Grand Cherokee", "Grand Cherokee"),
    ("Range Rover Evoque 2.0", "Range Rover Evoque 2.0"),
    ("MERCEDES-BENZ A AMG 45 S 4Matic+ 8G-DCT", "A AMG"),
    ("i MiEV", "i MiEV"),
    ("9-3 2.0i", "9-3 2.0i"),
    ("Smart #5 100kWh", "#5"),
    ("Smart #1 66", "#1"),
    ("TESLA Model Y", "Model Y"),
    ("TESLA TESLA Model 3 Performance, 513 PS", "Model 3"),
    ("TESLA Signature Sport", "Roadster"),
    ("TESLA Model S", "Model S"),
    ("Toyota C-HR", "C-HR"),
    ("T-Cross", "T-Cross"),
    ("VW R-Line 3.0", "R-Line 3.0"),
    ("T-Roc", "T-Roc"),
    ("New Beetle Cabrio", "Beetle Cabrio"),
    ("Käfer Cabriolet", "Beetle Cabrio"),
    ("e-Golf", "e-Golf"),
];

/// "VW Golf 8 GTI" → (VW, Golf 8) | "Peugeot 2008 1.2 PureTech" → (Peugeot, 2008)
pub fn extract_brand_and_model(car_model: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(title) = car_model.map(str::trim).filter(|t| !t.is_empty()) else {
        return (None, None);
    };

    let known = BRANDS.iter().find_map(|brand| {
        let head = title.get(..brand.len())?;
        let rest = &title[brand.len()..];
        (head.eq_ignore_ascii_case(brand) && rest.starts_with(char::is_whitespace))
            .then(|| (brand.to_string(), rest.trim()))
    });

    let (brand, remaining) = match known {
        Some(found) => found,
        None => match title.split_once(char::is_whitespace) {
            Some((first, rest)) => (first.to_string(), rest.trim()),
            None => (title.to_string(), ""),
        },
    };

    let tokens: Vec<&str> = remaining
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|t| !t.is_empty())
        .collect();

    let model = match tokens.as_slice() {
        [] => None,
        [first, second, ..] if second.starts_with(|c: char| c.is_ascii_digit()) => {
            Some(format!("{} {}", first, second))
        }
        [first, ..] => Some(first.to_string()),
    };

    (Some(brand), model)
}

/// Replace the heuristic model with a standard name where the title calls for it.
pub fn standardise_model(car_model: Option<&str>, model: Option<String>) -> Option<String> {
    car_model
        .and_then(|title| {
            MODEL_OVERRIDES
                .iter()
                .find(|(needle, _)| title.contains(needle))
                .map(|(_, standard)| standard.to_string())
        })
        .or(model)
}

pub fn clean_listing(listing: ListingRecord) -> CleanedListing {
    let (brand, model) = extract_brand_and_model(listing.car_model.as_deref());
    let model = standardise_model(listing.car_model.as_deref(), model);
    CleanedListing { brand, model, listing }
}

// ── Commodity series ──────────────────────────────────────────────────────────

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Fill each gap with the mean of up to `window` earlier observed closes of the
/// same commodity, then round every close to two decimals. Returns how many
/// gaps were filled.
pub fn impute_rolling_mean(prices: &mut [CommodityPrice], window: usize) -> usize {
    let mut by_commodity: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, p) in prices.iter().enumerate() {
        by_commodity.entry(p.commodity.clone()).or_default().push(i);
    }

    let mut filled = 0usize;
    for (commodity, mut idxs) in by_commodity {
        idxs.sort_by_key(|&i| prices[i].date);

        let mut observed: Vec<f64> = Vec::new();
        let mut fills: Vec<(usize, f64)> = Vec::new();
        for &i in &idxs {
            match prices[i].close {
                Some(v) => observed.push(v),
                None if window > 0 && !observed.is_empty() => {
                    let recent = &observed[observed.len().saturating_sub(window)..];
                    fills.push((i, recent.iter().sum::<f64>() / recent.len() as f64));
                }
                None => {}
            }
        }

        debug!("{}: {} gaps filled", commodity, fills.len());
        filled += fills.len();
        for (i, v) in fills {
            prices[i].close = Some(v);
        }
    }

    for p in prices.iter_mut() {
        p.close = p.close.map(round2);
    }
    filled
}

/// Mean close per (commodity, month), sorted by commodity then month.
pub fn monthly_averages(prices: &[CommodityPrice]) -> Vec<CommodityMonthlyRecord> {
    let mut acc: BTreeMap<(String, YearMonth), (f64, usize)> = BTreeMap::new();
    for p in prices {
        if let Some(close) = p.close {
            let e = acc.entry((p.commodity.clone(), YearMonth::of(p.date))).or_insert((0.0, 0));
            e.0 += close;
            e.1 += 1;
        }
    }

    acc.into_iter()
        .map(|((commodity, month), (sum, n))| CommodityMonthlyRecord {
            commodity,
            month,
            mean_price: sum / n as f64,
            observations: n,
        })
        .collect()
}

// ── Join ──────────────────────────────────────────────────────────────────────

/// Month used for the commodity join; new vehicles take `reference_month`.
pub fn listing_month(date: Option<ProductionDate>, reference_month: YearMonth) -> Option<YearMonth> {
    match date? {
        ProductionDate::Month(m) => Some(m),
        ProductionDate::NewVehicle => Some(reference_month),
    }
}

/// One row per listing, carrying every commodity's average for the listing's month.
pub fn join_monthly(
    listings: Vec<CleanedListing>,
    monthly: &[CommodityMonthlyRecord],
    reference_month: YearMonth,
) -> Vec<MergedAnalysisRow> {
    let names: BTreeSet<&str> = monthly.iter().map(|m| m.commodity.as_str()).collect();
    let lookup: HashMap<(&str, YearMonth), f64> = monthly
        .iter()
        .map(|m| ((m.commodity.as_str(), m.month), m.mean_price))
        .collect();

    listings
        .into_iter()
        .map(|cleaned| {
            let month = listing_month(cleaned.listing.production_date, reference_month);
            let commodities = names
                .iter()
                .map(|name| {
                    let v = month.and_then(|m| lookup.get(&(*name, m)).copied());
                    (name.to_string(), v)
                })
                .collect();
            MergedAnalysisRow {
                cleaned,
                month,
                consumption_imputed: false,
                commodities,
            }
        })
        .collect()
}

// ── Consumption fill ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Mean {
    sum: f64,
    n: usize,
}

impl Mean {
    fn add(&mut self, v: f64) {
        self.sum += v;
        self.n += 1;
    }

    fn value(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum / self.n as f64)
    }
}

/// Fill absent consumption: 0 for electric cars, otherwise the mean of the
/// same brand+model, then the same brand, then all observed values.
pub fn impute_consumption(rows: &mut [MergedAnalysisRow]) -> usize {
    let mut by_model: HashMap<(String, String), Mean> = HashMap::new();
    let mut by_brand: HashMap<String, Mean> = HashMap::new();
    let mut global = Mean::default();

    for row in rows.iter() {
        let Some(v) = row.cleaned.listing.consumption_l_per_100km else { continue };
        if let Some(brand) = &row.cleaned.brand {
            by_brand.entry(brand.clone()).or_default().add(v);
            if let Some(model) = &row.cleaned.model {
                by_model.entry((brand.clone(), model.clone())).or_default().add(v);
            }
        }
        global.add(v);
    }

    let mut filled = 0usize;
    for row in rows.iter_mut() {
        if row.cleaned.listing.consumption_l_per_100km.is_some() {
            continue;
        }
        let brand = row.cleaned.brand.clone();
        let model = row.cleaned.model.clone();

        let fill = if row.cleaned.listing.power_mode == PowerMode::Electric {
            Some(0.0)
        } else {
            brand
                .as_ref()
                .zip(model)
                .and_then(|(b, m)| by_model.get(&(b.clone(), m)).and_then(Mean::value))
                .or_else(|| brand.as_ref().and_then(|b| by_brand.get(b)).and_then(Mean::value))
                .or_else(|| global.value())
        };

        if let Some(v) = fill {
            row.cleaned.listing.consumption_l_per_100km = Some(round2(v));
            row.consumption_imputed = true;
            filled += 1;
        }
    }
    filled
}

/// Clean, join and fill in one pass.
pub fn build_analysis_rows(
    listings: Vec<ListingRecord>,
    monthly: &[CommodityMonthlyRecord],
    reference_month: YearMonth,
) -> Vec<MergedAnalysisRow> {
    let cleaned: Vec<CleanedListing> = listings.into_iter().map(clean_listing).collect();
    let mut rows = join_monthly(cleaned, monthly, reference_month);
    let filled = impute_consumption(&mut rows);
    let unmatched = rows
        .iter()
        .filter(|r| r.commodities.values().all(Option::is_none))
        .count();
    info!(
        "{} analysis rows | {} consumption values imputed | {} without commodity data",
        rows.len(), filled, unmatched
    );
    rows
}

// ── Tests ─────────────────────────────────────────────────────────────────────
