use crate::models::{PowerMode, ProductionDate, Transmission, YearMonth};
use chrono::{Datelike, Utc};
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;
use url::Url;

static MONTH_YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(0?[1-9]|1[0-2])\.(\d{4})\b").expect("month.year regex"));

static CONSUMPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+[,.]?\d*)\s*l\s*/?\s*100\s*km").expect("consumption regex")
});

/// Plausible fuel consumption, l/100km.
pub const CONSUMPTION_RANGE: std::ops::RangeInclusive<f64> = 1.0..=50.0;

const EARLIEST_PRODUCTION_YEAR: i32 = 1950;

/// Unmatched vendor text is echoed to logs at most this long.
const RAW_ECHO_LIMIT: usize = 20;

// ── Normalisers ───────────────────────────────────────────────────────────────

/// Fuel type → power mode. "diesel" wins over everything else, then hybrid,
/// then electric, then petrol.
pub fn normalise_power_mode(raw: Option<&str>) -> PowerMode {
    let Some(raw) = raw else { return PowerMode::Unknown };
    let text = raw.to_lowercase();

    if text.contains("diesel") {
        PowerMode::Diesel
    } else if text.contains("hybrid") {
        PowerMode::Hybrid
    } else if text.contains("elektro") || text.contains("electric") {
        PowerMode::Electric
    } else if text.contains("benzin") || text.contains("petrol") || text.contains("gasoline") {
        PowerMode::Petrol
    } else {
        PowerMode::Unknown
    }
}

/// Gearbox label → transmission. "halbautomat…" contains "automat", so the
/// semi-automatic check has to run first.
pub fn normalise_transmission(raw: Option<&str>) -> Transmission {
    let Some(raw) = raw else { return Transmission::Unknown };
    let text = raw.trim().to_lowercase();
    if text.is_empty() || is_dash(&text) {
        return Transmission::Unknown;
    }

    if text.contains("halbautomat") || text.contains("semi-auto") || text.contains("semiauto") {
        Transmission::SemiAutomatic
    } else if text.contains("automat") {
        Transmission::Automatic
    } else if text.contains("manuell") || text.contains("manual") || text.contains("schalt") {
        Transmission::Manual
    } else {
        debug!("Unrecognised transmission {:?}", truncate(raw.trim(), RAW_ECHO_LIMIT));
        Transmission::Unknown
    }
}

// ── Value parsers ─────────────────────────────────────────────────────────────

/// A label consisting only of a dash means the site has no value for it.
pub fn is_dash(s: &str) -> bool {
    matches!(s.trim(), "-" | "–" | "—")
}

/// "CHF 50'000.–" → 50000.0 | "12 900" → 12900.0
pub fn parse_price(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() || s == "N/A" || is_dash(s) {
        return None;
    }
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    cleaned.trim_end_matches('.').parse().ok()
}

/// Digits only: "87'500 km" → 87500
pub fn parse_integer(s: &str) -> Option<u64> {
    let cleaned: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    cleaned.parse().ok()
}

/// Finds `MM.YYYY` (or the new-vehicle literal) anywhere in `text`.
pub fn parse_production_date(text: &str, new_vehicle_literal: &str) -> Option<ProductionDate> {
    if text.to_lowercase().contains(&new_vehicle_literal.to_lowercase()) {
        return Some(ProductionDate::NewVehicle);
    }

    let latest_year = Utc::now().year() + 1;
    MONTH_YEAR_RE.captures_iter(text).find_map(|caps| {
        let month: u32 = caps[1].parse().ok()?;
        let year: i32 = caps[2].parse().ok()?;
        if !(EARLIEST_PRODUCTION_YEAR..=latest_year).contains(&year) {
            return None;
        }
        YearMonth::new(year, month).map(ProductionDate::Month)
    })
}

/// Finds "<number> l/100km" in `text`; values outside [`CONSUMPTION_RANGE`] are rejected.
pub fn parse_consumption(text: &str) -> Option<f64> {
    let caps = CONSUMPTION_RE.captures(text)?;
    let value: f64 = caps[1].replace(',', ".").parse().ok()?;
    if CONSUMPTION_RANGE.contains(&value) {
        Some(value)
    } else {
        debug!("Discarding implausible consumption {} l/100km", value);
        None
    }
}

/// Resolve `href` against `base` and drop the query string and fragment.
pub fn canonical_url(href: &str, base: Option<&Url>) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let mut url = match Url::parse(href) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(href).ok()?,
        Err(_) => return None,
    };
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

pub fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_mode_diesel_wins() {
        for raw in ["Diesel", "DIESEL", "Mild-Hybrid Diesel/Elektro", "Benzin oder diesel", "x-diesel-y"] {
            assert_eq!(normalise_power_mode(Some(raw)), PowerMode::Diesel, "{raw}");
        }
    }

    #[test]
    fn test_power_mode_vocabulary() {
        assert_eq!(normalise_power_mode(Some("Benzin")), PowerMode::Petrol);
        assert_eq!(normalise_power_mode(Some("Petrol")), PowerMode::Petrol);
        assert_eq!(normalise_power_mode(Some("Elektro")), PowerMode::Electric);
        assert_eq!(normalise_power_mode(Some("Electric")), PowerMode::Electric);
        assert_eq!(normalise_power_mode(Some("Vollhybrid Benzin/Elektro")), PowerMode::Hybrid);
        assert_eq!(normalise_power_mode(Some("Wasserstoff")), PowerMode::Unknown);
        assert_eq!(normalise_power_mode(None), PowerMode::Unknown);
    }

    #[test]
    fn test_transmission_semi_automatic_precedence() {
        for raw in [
            "Halbautomatik",
            "halbautomatisches Getriebe",
            "HALBAUTOMATISCH",
            "Automatik (Halbautomatik)",
        ] {
            assert_eq!(normalise_transmission(Some(raw)), Transmission::SemiAutomatic, "{raw}");
        }
    }

    #[test]
    fn test_transmission_vocabulary() {
        assert_eq!(normalise_transmission(Some("Automat")), Transmission::Automatic);
        assert_eq!(normalise_transmission(Some("Automatisches Getriebe")), Transmission::Automatic);
        assert_eq!(normalise_transmission(Some("Schaltgetriebe manuell")), Transmission::Manual);
        assert_eq!(normalise_transmission(Some("Manual")), Transmission::Manual);
        assert_eq!(normalise_transmission(Some("-")), Transmission::Unknown);
        assert_eq!(normalise_transmission(Some("Stufenlos CVT irgendwas sehr lang")), Transmission::Unknown);
        assert_eq!(normalise_transmission(None), Transmission::Unknown);
    }

    #[test]
    fn test_parse_price() {
        assert_eq!(parse_price("CHF 50'000.–"), Some(50000.0));
        assert_eq!(parse_price("12900"), Some(12900.0));
        assert_eq!(parse_price("24’990.50"), Some(24990.5));
        assert_eq!(parse_price("—"), None);
        assert_eq!(parse_price(""), None);
    }

    #[test]
    fn test_parse_production_date() {
        let lit = ProductionDate::NEW_VEHICLE_LITERAL;
        assert_eq!(
            parse_production_date("03.2021", lit),
            Some(ProductionDate::Month(YearMonth { year: 2021, month: 3 }))
        );
        assert_eq!(
            parse_production_date("Erstzulassung 7.2019 · 87'000 km", lit),
            Some(ProductionDate::Month(YearMonth { year: 2019, month: 7 }))
        );
        assert_eq!(parse_production_date("Neues Fahrzeug", lit), Some(ProductionDate::NewVehicle));
        assert_eq!(parse_production_date("13.2021", lit), None);
        assert_eq!(parse_production_date("05.1890", lit), None);
        assert_eq!(parse_production_date("keine Angabe", lit), None);
    }

    #[test]
    fn test_parse_consumption_bounds() {
        assert_eq!(parse_consumption("7.5 l/100km"), Some(7.5));
        assert_eq!(parse_consumption("6,2 l/100 km"), Some(6.2));
        assert_eq!(parse_consumption("1 l/100km"), Some(1.0));
        assert_eq!(parse_consumption("50 l/100km"), Some(50.0));
        assert_eq!(parse_consumption("0.5 l/100km"), None);
        assert_eq!(parse_consumption("75 l/100km"), None);
        assert_eq!(parse_consumption("120,0 L/100KM"), None);
        assert_eq!(parse_consumption("-"), None);
    }

    #[test]
    fn test_canonical_url() {
        let base = Url::parse("https://www.autoscout24.ch/de/autos/alle-marken").unwrap();
        assert_eq!(
            canonical_url("/de/d/bmw-x5-123?utm=abc#top", Some(&base)).as_deref(),
            Some("https://www.autoscout24.ch/de/d/bmw-x5-123")
        );
        assert_eq!(
            canonical_url("https://example.ch/a?b=c", None).as_deref(),
            Some("https://example.ch/a")
        );
        assert_eq!(canonical_url("/de/d/1", None), None);
        assert_eq!(canonical_url("  ", Some(&base)), None);
    }
}
