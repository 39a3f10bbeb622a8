use crate::config::ScraperConfig;
use crate::scraper::{Browser, Element};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

/// [`Browser`] over plain HTTP, for result pages that are rendered server-side.
///
/// There is no script engine: `click` follows an `href`, a "next" control
/// without one bumps the `page` query parameter, and any other control is a no-op.
pub struct HttpBrowser {
    inner: reqwest::Client,
    render_wait: Duration,
    current: Option<Url>,
    markup: Option<String>,
}

impl HttpBrowser {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // Consent banners are cookie-based
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            inner,
            render_wait: Duration::from_millis(config.render_wait_ms),
            current: None,
            markup: None,
        })
    }

    async fn get_text(&self, url: &Url) -> Result<String> {
        debug!("GET {}", url);
        let resp = self
            .inner
            .get(url.as_str())
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("HTTP {} for {}", status, url);
        }
        resp.text().await.context("Failed to read response body")
    }
}

fn is_next_control(element: &Element) -> bool {
    let mentions_next = |s: &str| s.to_lowercase().contains("next");
    mentions_next(&element.selector) || element.attrs.values().any(|v| mentions_next(v))
}

/// The URL a click on `element` leads to, relative to `current`.
/// `None` when the control does not navigate without a script engine.
pub fn click_target(current: &Url, element: &Element) -> Result<Option<Url>> {
    if let Some(href) = element.attr("href").filter(|h| !h.trim().is_empty() && !h.starts_with('#')) {
        return current
            .join(href.trim())
            .map(Some)
            .with_context(|| format!("Bad href {:?}", href));
    }
    if !is_next_control(element) {
        return Ok(None);
    }

    let page: u32 = current
        .query_pairs()
        .find(|(k, _)| k == "page")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(1);

    let mut next = current.clone();
    let others: Vec<(String, String)> = current
        .query_pairs()
        .filter(|(k, _)| k != "page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut q = next.query_pairs_mut();
        q.clear();
        for (k, v) in &others {
            q.append_pair(k, v);
        }
        q.append_pair("page", &(page + 1).to_string());
    }
    Ok(Some(next))
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        let url = Url::parse(url).with_context(|| format!("Invalid URL {:?}", url))?;
        let body = self.get_text(&url).await?;
        self.current = Some(url);
        self.markup = Some(body);
        Ok(())
    }

    async fn wait_until_ready(&mut self) -> Result<()> {
        if self.markup.is_none() {
            bail!("No page loaded");
        }
        sleep(self.render_wait).await;
        Ok(())
    }

    async fn rendered_markup(&mut self) -> Result<String> {
        self.markup.clone().context("No page loaded")
    }

    async fn find_elements(&mut self, selector: &str) -> Result<Vec<Element>> {
        let markup = self.markup.as_deref().context("No page loaded")?;
        let sel = Selector::parse(selector)
            .map_err(|e| anyhow::anyhow!("selector {:?}: {:?}", selector, e))?;
        let doc = Html::parse_document(markup);
        Ok(doc.select(&sel).map(|el| Element::snapshot(selector, el)).collect())
    }

    async fn click(&mut self, element: &Element) -> Result<()> {
        let current = self.current.clone().context("No page loaded")?;
        let Some(target) = click_target(&current, element)? else {
            debug!("Click on {:?} has no effect on static markup", element.selector);
            return Ok(());
        };
        if target == current {
            warn!("Click on {:?} leads back to the same page", element.selector);
        }
        self.navigate(target.as_str()).await
    }

    async fn scroll(&mut self, _fraction: f32) -> Result<()> {
        // Static markup has nothing to lazy-load.
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.current = None;
        self.markup = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn button(attrs: &[(&str, &str)]) -> Element {
        Element {
            selector: "[data-testid='pagination-next']".into(),
            tag: "button".into(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            text: "Next".into(),
        }
    }

    #[test]
    fn test_click_follows_relative_href() {
        let current = Url::parse("https://www.autoscout24.ch/de/autos/alle-marken?page=2").unwrap();
        let next = click_target(&current, &button(&[("href", "/de/autos/alle-marken?page=3")]))
            .unwrap()
            .unwrap();
        assert_eq!(next.as_str(), "https://www.autoscout24.ch/de/autos/alle-marken?page=3");
    }

    #[test]
    fn test_click_without_href_advances_page_param() {
        let current = Url::parse("https://example.ch/list?sort=price").unwrap();
        let next = click_target(&current, &button(&[])).unwrap().unwrap();
        assert_eq!(next.as_str(), "https://example.ch/list?sort=price&page=2");

        let next = click_target(&next, &button(&[("href", "#")])).unwrap().unwrap();
        assert_eq!(next.as_str(), "https://example.ch/list?sort=price&page=3");
    }

    #[test]
    fn test_click_on_other_controls_does_not_navigate() {
        let current = Url::parse("https://example.ch/list").unwrap();
        let consent = Element {
            selector: "#onetrust-accept-btn-handler".into(),
            tag: "button".into(),
            attrs: HashMap::from([("id".to_string(), "onetrust-accept-btn-handler".to_string())]),
            text: "Accept".into(),
        };
        assert_eq!(click_target(&current, &consent).unwrap(), None);
    }

    #[tokio::test]
    async fn test_unloaded_browser_reports_errors() {
        let mut browser = HttpBrowser::new(&ScraperConfig::default()).unwrap();
        assert!(browser.rendered_markup().await.is_err());
        assert!(browser.find_elements("article").await.is_err());
        assert!(browser.wait_until_ready().await.is_err());
        assert!(browser.close().await.is_ok());
    }
}
