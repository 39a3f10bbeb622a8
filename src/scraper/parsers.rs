//! Record extraction from a rendered results page.
//!
//! Two independent paths read the same page:
//!
//! * the structured-data block (JSON-LD) yields model, price, mileage, power,
//!   fuel type and the listing URL for every car on the page;
//! * the visual path walks each listing card and reads the production date,
//!   consumption and transmission next to their glyph icons, falling back to
//!   pattern matches over the card's visible text.
//!
//! Which selectors, glyph keywords and literals are used is data
//! ([`ExtractionRules`]), so site tweaks are configuration changes.

use crate::error::PageError;
use crate::models::{ProductionDate, StructuredListing, Transmission, VisualListing};
use crate::scraper::cleaner::{
    canonical_url, is_dash, normalise_power_mode, normalise_transmission, parse_consumption,
    parse_integer, parse_price, parse_production_date,
};
use anyhow::{Context, Result};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

const KW_TO_HP: f64 = 1.359_62;

// ── Rules ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStrategy {
    /// Label next to a glyph whose accessible text contains a keyword.
    Glyph,
    /// Pattern search over the card's full visible text.
    TextPattern,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractionRules {
    pub structured_selectors: Vec<String>,
    pub article_selector: String,
    pub link_selectors: Vec<String>,
    pub date_keywords: Vec<String>,
    pub consumption_keywords: Vec<String>,
    pub transmission_keywords: Vec<String>,
    pub new_vehicle_literal: String,
    /// Tried in order against the card text; keep semi-automatic literals first.
    pub transmission_literals: Vec<String>,
    pub strategies: Vec<FieldStrategy>,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        let strings = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            structured_selectors: strings(&[
                "script[data-testid='structured-schema-srp']",
                "script[type='application/ld+json']",
            ]),
            article_selector: "article".to_string(),
            link_selectors: strings(&["a[href*='/de/d/']", "a[href]"]),
            date_keywords: strings(&["calendar", "kalender"]),
            consumption_keywords: strings(&["fuel", "kraftstoff", "consumption", "verbrauch"]),
            transmission_keywords: strings(&["transmission", "getriebe", "gearbox"]),
            new_vehicle_literal: ProductionDate::NEW_VEHICLE_LITERAL.to_string(),
            transmission_literals: strings(&[
                "Halbautomatisches Getriebe",
                "Halbautomatik",
                "Automatisches Getriebe",
                "Automatik",
                "Automat",
                "Manuelles Getriebe",
                "Schaltgetriebe",
                "Manuell",
            ]),
            strategies: vec![FieldStrategy::Glyph, FieldStrategy::TextPattern],
        }
    }
}

// ── Glyph probe ───────────────────────────────────────────────────────────────

/// Outcome of reading the label next to a glyph.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    Found(String),
    /// The label is a lone dash: the site states there is no value.
    ExplicitlyEmpty,
    NotFound,
}

// ── Extractor ─────────────────────────────────────────────────────────────────

pub struct ListingExtractor {
    rules: ExtractionRules,
    structured: Vec<Selector>,
    article: Selector,
    links: Vec<Selector>,
    svg: Selector,
    title: Selector,
    paragraph: Selector,
    transmission_patterns: Vec<(Regex, String)>,
}

fn selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| anyhow::anyhow!("selector {:?}: {:?}", s, e))
}

impl ListingExtractor {
    pub fn new(rules: ExtractionRules) -> Result<Self> {
        let structured = rules
            .structured_selectors
            .iter()
            .map(|s| selector(s))
            .collect::<Result<Vec<_>>>()?;
        let links = rules
            .link_selectors
            .iter()
            .map(|s| selector(s))
            .collect::<Result<Vec<_>>>()?;
        let transmission_patterns = rules
            .transmission_literals
            .iter()
            .map(|lit| {
                let re = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(lit)))
                    .with_context(|| format!("transmission literal {:?}", lit))?;
                Ok((re, lit.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            article: selector(&rules.article_selector)?,
            structured,
            links,
            svg: selector("svg")?,
            title: selector("title")?,
            paragraph: selector("p")?,
            transmission_patterns,
            rules,
        })
    }

    // ── Structured-data path ──────────────────────────────────────────────────

    /// Every car in the page's structured-data block.
    ///
    /// A page without any block is [`PageError::NoStructuredData`]; a block that
    /// is present but unreadable is [`PageError::MalformedStructuredData`].
    pub fn extract_structured(
        &self,
        html: &str,
        base: Option<&Url>,
    ) -> std::result::Result<Vec<StructuredListing>, PageError> {
        let doc = Html::parse_document(html);
        let mut parse_error: Option<String> = None;

        for sel in &self.structured {
            for script in doc.select(sel) {
                let body = script.text().collect::<String>();
                let json: Value = match serde_json::from_str(body.trim()) {
                    Ok(v) => v,
                    Err(e) => {
                        parse_error.get_or_insert_with(|| e.to_string());
                        continue;
                    }
                };

                let Some(items) = item_list(&json) else { continue };

                let mut listings = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    match structured_item(item, base) {
                        Some(row) => listings.push(row),
                        None => warn!("Structured item {} is not an object, skipping", i + 1),
                    }
                }
                debug!("Structured block: {} listings", listings.len());
                return Ok(listings);
            }
        }

        match parse_error {
            Some(e) => Err(PageError::MalformedStructuredData(e)),
            None => Err(PageError::NoStructuredData),
        }
    }

    // ── Visual path ───────────────────────────────────────────────────────────

    /// One entry per listing card, in page order.
    pub fn extract_visual(&self, html: &str, base: Option<&Url>) -> Vec<VisualListing> {
        let doc = Html::parse_document(html);
        let results: Vec<VisualListing> = doc
            .select(&self.article)
            .enumerate()
            .map(|(idx, article)| self.visual_listing(idx, article, base))
            .collect();

        let n = results.len();
        let dates = results.iter().filter(|r| r.production_date.is_some()).count();
        let trans = results.iter().filter(|r| r.transmission.is_known()).count();
        let cons = results.iter().filter(|r| r.consumption_l_per_100km.is_some()).count();
        info!("  Visual extraction: date={}/{} trans={}/{} cons={}/{}", dates, n, trans, n, cons, n);

        results
    }

    fn visual_listing(&self, idx: usize, article: ElementRef<'_>, base: Option<&Url>) -> VisualListing {
        let listing_url = self.links.iter().find_map(|sel| {
            article
                .select(sel)
                .filter_map(|a| a.value().attr("href"))
                .find_map(|href| canonical_url(href, base))
        });

        let text = visible_text(article);
        let rules = &self.rules;

        let production_date = self.resolve(
            "date",
            idx,
            || self.glyph_label(article, &rules.date_keywords),
            |label| parse_production_date(label, &rules.new_vehicle_literal),
            || parse_production_date(&text, &rules.new_vehicle_literal),
        );

        let consumption_l_per_100km = self.resolve(
            "consumption",
            idx,
            || self.glyph_label(article, &rules.consumption_keywords),
            parse_consumption,
            || parse_consumption(&text),
        );

        let transmission = self
            .resolve(
                "transmission",
                idx,
                || self.glyph_label(article, &rules.transmission_keywords),
                |label| Some(normalise_transmission(Some(label))).filter(Transmission::is_known),
                || self.transmission_from_text(&text),
            )
            .unwrap_or_default();

        debug!(
            "  Card {}: url={:?} date={:?} cons={:?} trans={}",
            idx + 1, listing_url, production_date, consumption_l_per_100km, transmission
        );

        VisualListing {
            listing_url,
            production_date,
            consumption_l_per_100km,
            transmission,
        }
    }

    /// Runs the configured strategies in order until one yields a value.
    fn resolve<T>(
        &self,
        field: &str,
        idx: usize,
        glyph: impl Fn() -> Probe,
        parse_label: impl Fn(&str) -> Option<T>,
        from_text: impl Fn() -> Option<T>,
    ) -> Option<T> {
        for strategy in &self.rules.strategies {
            match strategy {
                FieldStrategy::Glyph => match glyph() {
                    Probe::Found(label) => {
                        if let Some(v) = parse_label(&label) {
                            return Some(v);
                        }
                        debug!("  Card {}: unparseable {} label {:?}", idx + 1, field, label);
                    }
                    Probe::ExplicitlyEmpty => {
                        debug!("  Card {}: {} explicitly empty", idx + 1, field);
                        return None;
                    }
                    Probe::NotFound => {}
                },
                FieldStrategy::TextPattern => {
                    if let Some(v) = from_text() {
                        return Some(v);
                    }
                }
            }
        }
        None
    }

    /// Label text beside the first glyph whose title or aria-label contains a keyword.
    pub fn glyph_label(&self, article: ElementRef<'_>, keywords: &[String]) -> Probe {
        for svg in article.select(&self.svg) {
            let label = svg
                .value()
                .attr("aria-label")
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .or_else(|| svg.select(&self.title).next().map(|t| t.text().collect()))
                .unwrap_or_default()
                .trim()
                .to_lowercase();

            if label.is_empty() || !keywords.iter().any(|k| label.contains(&k.to_lowercase())) {
                continue;
            }

            let sibling = svg
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .find(|el| el.value().name() == "p");
            let value = sibling.or_else(|| {
                svg.parent()
                    .and_then(ElementRef::wrap)
                    .and_then(|parent| parent.select(&self.paragraph).next())
            });

            let Some(value) = value else { return Probe::NotFound };
            let text = value.text().collect::<String>().trim().to_string();
            return if is_dash(&text) {
                Probe::ExplicitlyEmpty
            } else if text.is_empty() {
                Probe::NotFound
            } else {
                Probe::Found(text)
            };
        }
        Probe::NotFound
    }

    fn transmission_from_text(&self, text: &str) -> Option<Transmission> {
        self.transmission_patterns
            .iter()
            .find(|(re, _)| re.is_match(text))
            .map(|(_, lit)| normalise_transmission(Some(lit)))
            .filter(Transmission::is_known)
    }
}

// ── JSON helpers ──────────────────────────────────────────────────────────────

fn item_list(json: &Value) -> Option<&Vec<Value>> {
    if let Value::Array(blocks) = json {
        return blocks.iter().find_map(item_list);
    }
    ["/mainEntity/offers/itemListElement", "/mainEntity/itemListElement", "/itemListElement"]
        .iter()
        .find_map(|p| json.pointer(p))
        .and_then(Value::as_array)
}

fn structured_item(item: &Value, base: Option<&Url>) -> Option<StructuredListing> {
    if !item.is_object() {
        return None;
    }
    // schema.org ListItem wrapper
    let item = item.get("item").filter(|v| v.is_object()).unwrap_or(item);

    let offers = first(item.get("offers"));
    let offered = offers.and_then(|o| first(o.get("itemOffered")));
    let engine = offered.and_then(|o| first(o.get("vehicleEngine")));

    let listing_url = [
        item.get("url"),
        item.get("@id"),
        offers.and_then(|o| o.get("url")),
        offered.and_then(|o| o.get("url")),
    ]
    .into_iter()
    .flatten()
    .filter_map(Value::as_str)
    .find_map(|href| canonical_url(href, base));

    let car_model = item
        .get("name")
        .or_else(|| offered.and_then(|o| o.get("name")))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let price_chf = offers.and_then(|o| o.get("price")).and_then(as_f64);

    let mileage = offered
        .and_then(|o| o.pointer("/mileageFromOdometer/value"))
        .and_then(as_u64);

    let engine_power_hp = engine.and_then(|e| first(e.get("enginePower"))).and_then(|p| {
        let value = p.get("value").and_then(as_f64)?;
        let hp = match p.get("unitCode").and_then(Value::as_str) {
            Some("KWT") => value * KW_TO_HP,
            _ => value,
        };
        Some(hp.round() as u32)
    });

    let fuel = engine
        .and_then(|e| e.get("fuelType"))
        .or_else(|| offered.and_then(|o| o.get("fuelType")))
        .and_then(Value::as_str);

    Some(StructuredListing {
        car_model,
        price_chf,
        mileage,
        engine_power_hp,
        power_mode: normalise_power_mode(fuel),
        listing_url,
    })
}

/// Objects pass through; arrays yield their first element.
fn first(v: Option<&Value>) -> Option<&Value> {
    match v? {
        Value::Array(xs) => xs.first(),
        Value::Null => None,
        other => Some(other),
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_price(s),
        _ => None,
    }
}

fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.round() as u64)),
        Value::String(s) => parse_integer(s),
        _ => None,
    }
}

fn visible_text(el: ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
