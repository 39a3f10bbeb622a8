use crate::models::{ListingRecord, StructuredListing, VisualListing};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Join one page's structured rows with its visual rows.
///
/// Rows are matched on listing URL. When a structured row has no URL, or its
/// URL is not among the visual rows, the visual row at the same index is used
/// instead. That positional pairing is only right if both lists enumerate the
/// cards in the same order, which nothing verifies; every use is logged.
///
/// The output always has one record per structured row, in structured order.
pub fn merge_page(structured: &[StructuredListing], visual: &[VisualListing]) -> Vec<ListingRecord> {
    let by_url: HashMap<&str, &VisualListing> = visual
        .iter()
        .filter_map(|v| v.listing_url.as_deref().map(|u| (u, v)))
        .collect();

    let mut positional = 0usize;

    let merged: Vec<ListingRecord> = structured
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            let keyed = row.listing_url.as_deref().and_then(|u| by_url.get(u).copied());
            let matched = keyed.or_else(|| {
                let fallback = visual.get(idx);
                if fallback.is_some() {
                    positional += 1;
                    debug!("Row {}: positional match (url={:?})", idx + 1, row.listing_url);
                }
                fallback
            });

            let mut record = ListingRecord::from_structured(row.clone());
            if let Some(v) = matched {
                record.production_date = v.production_date;
                record.consumption_l_per_100km = v.consumption_l_per_100km;
                record.transmission = v.transmission;
            }
            record
        })
        .collect();

    if positional > 0 {
        warn!(
            "{} of {} rows paired by position, not URL; assumes identical card order",
            positional,
            structured.len()
        );
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProductionDate, Transmission, YearMonth};
    use crate::scraper::cleaner::{normalise_transmission, parse_consumption, parse_production_date};

    fn structured(url: Option<&str>, model: &str, price: f64) -> StructuredListing {
        StructuredListing {
            car_model: Some(model.to_string()),
            price_chf: Some(price),
            listing_url: url.map(str::to_string),
            ..Default::default()
        }
    }

    fn visual(url: Option<&str>, date: &str, trans: &str, cons: &str) -> VisualListing {
        VisualListing {
            listing_url: url.map(str::to_string),
            production_date: parse_production_date(date, ProductionDate::NEW_VEHICLE_LITERAL),
            consumption_l_per_100km: parse_consumption(cons),
            transmission: normalise_transmission(Some(trans)),
        }
    }

    #[test]
    fn test_merge_by_url() {
        let s = vec![structured(Some("A"), "BMW X5", 50000.0)];
        let v = vec![visual(Some("A"), "03.2021", "Automatik", "7.5 l/100km")];

        let merged = merge_page(&s, &v);
        assert_eq!(merged.len(), 1);
        let r = &merged[0];
        assert_eq!(r.car_model.as_deref(), Some("BMW X5"));
        assert_eq!(r.price_chf, Some(50000.0));
        assert_eq!(r.production_date, Some(ProductionDate::Month(YearMonth { year: 2021, month: 3 })));
        assert_eq!(r.production_date.map(|d| d.to_string()).as_deref(), Some("03.2021"));
        assert_eq!(r.transmission, Transmission::Automatic);
        assert_eq!(r.consumption_l_per_100km, Some(7.5));
    }

    #[test]
    fn test_url_match_ignores_order() {
        let s = vec![structured(Some("A"), "a", 1.0), structured(Some("B"), "b", 2.0)];
        let v = vec![
            visual(Some("B"), "01.2020", "Manuell", "5 l/100km"),
            visual(Some("A"), "02.2019", "Automat", "9 l/100km"),
        ];
        let merged = merge_page(&s, &v);
        assert_eq!(merged[0].transmission, Transmission::Automatic);
        assert_eq!(merged[1].transmission, Transmission::Manual);
        assert_eq!(merged[1].consumption_l_per_100km, Some(5.0));
    }

    #[test]
    fn test_positional_fallback_without_url() {
        let s = vec![structured(None, "Audi A4", 20000.0)];
        let v = vec![visual(None, "11.2018", "Schaltgetriebe", "6.0 l/100km")];

        let merged = merge_page(&s, &v);
        assert_eq!(merged[0].production_date, Some(ProductionDate::Month(YearMonth { year: 2018, month: 11 })));
        assert_eq!(merged[0].transmission, Transmission::Manual);
        assert_eq!(merged[0].consumption_l_per_100km, Some(6.0));
    }

    #[test]
    fn test_unmatched_rows_keep_visual_fields_absent() {
        let s = vec![structured(Some("A"), "a", 1.0), structured(Some("Z"), "z", 2.0)];
        let v = vec![visual(Some("A"), "01.2020", "Manuell", "5 l/100km")];
        let merged = merge_page(&s, &v);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].production_date, None);
        assert_eq!(merged[1].transmission, Transmission::Unknown);
        assert_eq!(merged[1].consumption_l_per_100km, None);
    }

    #[test]
    fn test_merge_is_repeatable() {
        let s = vec![structured(Some("A"), "a", 1.0), structured(None, "b", 2.0)];
        let v = vec![
            visual(Some("A"), "01.2020", "Manuell", "5 l/100km"),
            visual(Some("C"), "04.2017", "Automat", "8 l/100km"),
        ];
        let first = merge_page(&s, &v);
        let second = merge_page(&s, &v);
        assert_eq!(first, second);
    }
}
