//! Article extraction from standard page metadata.
//!
//! Most news sites publish Open Graph and `article:*` meta tags, which is
//! enough to fill a [`NewsItem`] without site-specific code:
//!
//! | Field | Source |
//! |-------|--------|
//! | title | `og:title`, else first `h1`, else `<title>` |
//! | description | `og:description`, else `description` |
//! | published_at | `article:published_time`, else `time[datetime]` |
//! | authors | `author`, `article:author` |
//! | tags | `article:tag`, `news_keywords`, `keywords` |
//! | categories | `article:section` |
//! | content | text of every element matching the content selector |

use super::{fetch_text, selector};
use crate::error::ParseError;
use crate::models::NewsItem;
use crate::utils::collapse_whitespace;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use once_cell::sync::Lazy;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub const DEFAULT_CONTENT_SELECTOR: &str = "article p";

static META: Lazy<Selector> = Lazy::new(|| Selector::parse("meta[content]").expect("static selector"));
static H1: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").expect("static selector"));
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").expect("static selector"));
static TIME: Lazy<Selector> = Lazy::new(|| Selector::parse("time[datetime]").expect("static selector"));

/// Fetches one article page and turns it into a [`NewsItem`].
#[async_trait]
pub trait FetchArticle: Send + Sync {
    async fn fetch(&self, cancel: &CancellationToken, url: &str) -> Result<NewsItem, ParseError>;
}

pub struct ArticleExtractor {
    client: Client,
    source: String,
    content: Selector,
}

impl ArticleExtractor {
    /// # Arguments
    ///
    /// * `client` - Shared HTTP client
    /// * `source` - Stamped into every item's `source`; the worker id
    /// * `content_selector` - CSS selector for body paragraphs
    pub fn new(client: Client, source: impl Into<String>, content_selector: &str) -> Result<Self, ParseError> {
        Ok(Self {
            client,
            source: source.into(),
            content: selector(content_selector)?,
        })
    }

    /// Extract a [`NewsItem`] from an already downloaded page.
    pub fn extract(&self, html: &str, url: &str) -> Result<NewsItem, ParseError> {
        let document = Html::parse_document(html);
        let meta = Meta::collect(&document);

        let title = meta
            .first(&["og:title"])
            .or_else(|| first_text(&document, &H1))
            .or_else(|| first_text(&document, &TITLE))
            .ok_or_else(|| ParseError::Missing {
                field: "title",
                url: url.to_string(),
            })?;

        let published_at = meta
            .first(&["article:published_time"])
            .or_else(|| {
                document
                    .select(&TIME)
                    .find_map(|t| t.value().attr("datetime").map(str::to_string))
            })
            .and_then(|raw| parse_timestamp(&raw))
            .unwrap_or_else(|| {
                debug!(%url, "No publication time; using the Unix epoch");
                DateTime::<Utc>::default()
            });

        let tags = meta
            .all(&["article:tag"])
            .into_iter()
            .chain(
                meta.all(&["news_keywords", "keywords"])
                    .iter()
                    .flat_map(|k| k.split(',').map(collapse_whitespace).collect::<Vec<_>>()),
            )
            .filter(|t| !t.is_empty())
            .unique()
            .collect();

        let content = document
            .select(&self.content)
            .map(|p| collapse_whitespace(&p.text().collect::<String>()))
            .filter(|p| !p.is_empty())
            .join("\n");

        Ok(NewsItem {
            title,
            link: url.to_string(),
            source: self.source.clone(),
            published_at,
            authors: meta.all(&["author", "article:author"]).into_iter().unique().collect(),
            tags,
            categories: meta.all(&["article:section"]).into_iter().unique().collect(),
            content,
            description: meta.first(&["og:description", "description"]),
        })
    }
}

#[async_trait]
impl FetchArticle for ArticleExtractor {
    #[instrument(level = "debug", skip(self, cancel))]
    async fn fetch(&self, cancel: &CancellationToken, url: &str) -> Result<NewsItem, ParseError> {
        let html = fetch_text(&self.client, cancel, url).await?;
        let item = self.extract(&html, url)?;
        debug!(title = %item.title, paragraphs = item.content.lines().count(), "Extracted article");
        Ok(item)
    }
}

/// `(key, content)` pairs of every `<meta>` tag, keyed by `property` or `name`.
struct Meta(Vec<(String, String)>);

impl Meta {
    fn collect(document: &Html) -> Self {
        let pairs = document
            .select(&META)
            .filter_map(|m| {
                let el = m.value();
                let key = el.attr("property").or_else(|| el.attr("name"))?;
                let content = collapse_whitespace(el.attr("content")?);
                (!content.is_empty()).then(|| (key.to_ascii_lowercase(), content))
            })
            .collect();
        Self(pairs)
    }

    /// Value of the first key in `keys` (in key order) that is present.
    fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .find_map(|k| self.0.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone()))
    }

    fn all(&self, keys: &[&str]) -> Vec<String> {
        self.0
            .iter()
            .filter(|(key, _)| keys.contains(&key.as_str()))
            .map(|(_, v)| v.clone())
            .collect()
    }
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .map(|el: ElementRef| collapse_whitespace(&el.text().collect::<String>()))
        .find(|t| !t.is_empty())
}

/// RFC 3339, or RFC 3339 without seconds (`2024-03-01T12:00+03:00`).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M%:z"))
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
