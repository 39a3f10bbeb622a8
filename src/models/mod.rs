use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Marker written to CSV for any value that could not be determined.
pub const NOT_AVAILABLE: &str = "N/A";

// ── Categorical fields ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum PowerMode {
    Petrol,
    Diesel,
    Electric,
    Hybrid,
    #[default]
    Unknown,
}

impl PowerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerMode::Petrol => "Petrol",
            PowerMode::Diesel => "Diesel",
            PowerMode::Electric => "Electric",
            PowerMode::Hybrid => "Hybrid",
            PowerMode::Unknown => NOT_AVAILABLE,
        }
    }

    pub fn from_csv(s: &str) -> Self {
        match s.trim() {
            "Petrol" => PowerMode::Petrol,
            "Diesel" => PowerMode::Diesel,
            "Electric" => PowerMode::Electric,
            "Hybrid" => PowerMode::Hybrid,
            _ => PowerMode::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        *self != PowerMode::Unknown
    }
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Transmission {
    Automatic,
    SemiAutomatic,
    Manual,
    #[default]
    Unknown,
}

impl Transmission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transmission::Automatic => "Automatic",
            Transmission::SemiAutomatic => "SemiAutomatic",
            Transmission::Manual => "Manual",
            Transmission::Unknown => NOT_AVAILABLE,
        }
    }

    pub fn from_csv(s: &str) -> Self {
        match s.trim() {
            "Automatic" => Transmission::Automatic,
            "SemiAutomatic" => Transmission::SemiAutomatic,
            "Manual" => Transmission::Manual,
            _ => Transmission::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        *self != Transmission::Unknown
    }
}

impl fmt::Display for Transmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Month granularity ─────────────────────────────────────────────────────────

/// A calendar month, ordered chronologically. Rendered as `MM.YYYY`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1)?;
        Some(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self { year: date.year(), month: date.month() }
    }

    pub fn first_day(&self) -> NaiveDate {
        // Constructor guarantees a valid month.
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}.{}", self.month, self.year)
    }
}

/// Registration month of a listing, or the vendor's "new, unregistered" marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProductionDate {
    Month(YearMonth),
    NewVehicle,
}

impl ProductionDate {
    pub const NEW_VEHICLE_LITERAL: &'static str = "Neues Fahrzeug";
}

impl fmt::Display for ProductionDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductionDate::Month(m) => m.fmt(f),
            ProductionDate::NewVehicle => f.write_str(Self::NEW_VEHICLE_LITERAL),
        }
    }
}

// ── Listing record ────────────────────────────────────────────────────────────

/// One used-car listing, as persisted to the listings CSV.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ListingRecord {
    pub car_model: Option<String>,
    pub price_chf: Option<f64>,
    pub mileage: Option<u64>,
    pub engine_power_hp: Option<u32>,
    pub power_mode: PowerMode,
    pub production_date: Option<ProductionDate>,
    pub consumption_l_per_100km: Option<f64>,
    pub transmission: Transmission,
    pub listing_url: Option<String>,
}

impl ListingRecord {
    /// Structured-data fields only; the visual fields start absent.
    pub fn from_structured(row: StructuredListing) -> Self {
        Self {
            car_model: row.car_model,
            price_chf: row.price_chf,
            mileage: row.mileage,
            engine_power_hp: row.engine_power_hp,
            power_mode: row.power_mode,
            listing_url: row.listing_url,
            ..Default::default()
        }
    }
}

// ── Per-path extraction rows ──────────────────────────────────────────────────

/// Fields read from the page's embedded structured-data block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructuredListing {
    pub car_model: Option<String>,
    pub price_chf: Option<f64>,
    pub mileage: Option<u64>,
    pub engine_power_hp: Option<u32>,
    pub power_mode: PowerMode,
    pub listing_url: Option<String>,
}

/// Fields that are only rendered visually next to glyph icons.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VisualListing {
    pub listing_url: Option<String>,
    pub production_date: Option<ProductionDate>,
    pub consumption_l_per_100km: Option<f64>,
    pub transmission: Transmission,
}

// ── Commodities ───────────────────────────────────────────────────────────────

/// One daily closing price; `close` is `None` where the source had a gap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommodityPrice {
    pub commodity: String,
    pub date: NaiveDate,
    pub close: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommodityMonthlyRecord {
    pub commodity: String,
    pub month: YearMonth,
    pub mean_price: f64,
    pub observations: usize,
}

// ── Analysis rows ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanedListing {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub listing: ListingRecord,
}

/// A cleaned listing joined to the commodity averages of its month.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergedAnalysisRow {
    pub cleaned: CleanedListing,
    pub month: Option<YearMonth>,
    pub consumption_imputed: bool,
    pub commodities: BTreeMap<String, Option<f64>>,
}
