pub mod cleaner;
pub mod http_client;
pub mod merge;
pub mod parsers;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

pub use self::http_client::HttpBrowser;

// ── Browser trait ─────────────────────────────────────────────────────────────

/// Page-rendering collaborator. The walker only ever talks to a results page
/// through this, so a headless browser or a plain HTTP fetcher can sit behind it.
#[async_trait]
pub trait Browser: Send {
    async fn navigate(&mut self, url: &str) -> Result<()>;

    /// Block until dynamic content has settled.
    async fn wait_until_ready(&mut self) -> Result<()>;

    async fn rendered_markup(&mut self) -> Result<String>;

    async fn find_elements(&mut self, selector: &str) -> Result<Vec<Element>>;

    async fn click(&mut self, element: &Element) -> Result<()>;

    /// Scroll to a fraction of the page height (0.0 = top, 1.0 = bottom).
    async fn scroll(&mut self, fraction: f32) -> Result<()>;

    /// Release the underlying session. Called once on every exit path.
    async fn close(&mut self) -> Result<()>;
}

/// Snapshot of a matched element at the time of the lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub selector: String,
    pub tag: String,
    pub attrs: HashMap<String, String>,
    pub text: String,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Disabled via the attribute, `aria-disabled`, or a "disabled" class.
    pub fn is_disabled(&self) -> bool {
        self.attrs.contains_key("disabled")
            || self.attr("aria-disabled") == Some("true")
            || self
                .attr("class")
                .map(|c| c.to_lowercase().contains("disabled"))
                .unwrap_or(false)
    }

    pub(crate) fn snapshot(selector: &str, el: scraper::ElementRef<'_>) -> Self {
        Self {
            selector: selector.to_string(),
            tag: el.value().name().to_string(),
            attrs: el
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            text: el.text().collect::<String>().trim().to_string(),
        }
    }
}
