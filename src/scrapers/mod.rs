//! Generic, configuration-driven news parsers.
//!
//! Each parser implements [`Parser`](crate::ingest::Parser) and follows the
//! same two-phase pattern:
//!
//! 1. **Indexing**: discover article URLs (an RSS document, a dated archive
//!    page, or a search results page)
//! 2. **Fetching**: download and extract each article through the bounded
//!    [`fanout::parse_many`]
//!
//! # Parsers
//!
//! | Parser | Module | Index | Page token |
//! |--------|--------|-------|------------|
//! | Feed | [`feed`] | RSS 2.0 | always empty |
//! | Archive | [`archive`] | HTML page per day | `YYYYMMDD` |
//! | Search | [`search`] | HTML search results | always empty |
//!
//! Scrapers use:
//! - A random desktop User-Agent per request
//! - Graceful error handling (failed article fetches are logged and skipped)
//! - Metadata extraction from `og:` / `article:` meta tags

pub mod archive;
pub mod article;
pub mod fanout;
pub mod feed;
pub mod search;

use crate::error::ParseError;
use crate::utils::resolve_link;
use itertools::Itertools;
use rand::{Rng, rng};
use reqwest::Client;
use reqwest::header::USER_AGENT;
use scraper::{Html, Selector};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

const DESKTOP_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pick a desktop browser User-Agent at random.
pub fn desktop_user_agent() -> &'static str {
    let idx = rng().random_range(0..DESKTOP_USER_AGENTS.len());
    DESKTOP_USER_AGENTS[idx]
}

/// The HTTP client shared by every parser of one process.
pub fn http_client() -> Result<Client, ParseError> {
    Ok(Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

/// Compile a CSS selector from configuration.
pub fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

pub fn parse_url(url: &str) -> Result<Url, ParseError> {
    Url::parse(url).map_err(|source| ParseError::Url {
        url: url.to_string(),
        source,
    })
}

/// GET `url` and return the body, or [`ParseError::Cancelled`] if `cancel`
/// fires first.
#[instrument(level = "debug", skip(client, cancel))]
pub async fn fetch_text(
    client: &Client,
    cancel: &CancellationToken,
    url: &str,
) -> Result<String, ParseError> {
    let request = async {
        let resp = client
            .get(url)
            .header(USER_AGENT, desktop_user_agent())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ParseError::Status {
                code: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp.text().await?)
    };

    let body = tokio::select! {
        res = request => res?,
        _ = cancel.cancelled() => return Err(ParseError::Cancelled),
    };
    debug!(bytes = body.len(), "Fetched");
    Ok(body)
}

/// Collect unique absolute article links from `html`.
///
/// `selector` may match anchors directly or any element containing one.
pub fn collect_links(html: &str, base: &Url, selector: &Selector) -> Vec<String> {
    let document = Html::parse_document(html);
    let anchor = Selector::parse("a[href]").ok();

    document
        .select(selector)
        .filter_map(|element| {
            let href = element.value().attr("href").or_else(|| {
                anchor
                    .as_ref()
                    .and_then(|a| element.select(a).next())
                    .and_then(|a| a.value().attr("href"))
            })?;
            resolve_link(base, href)
        })
        .unique()
        .collect()
}
