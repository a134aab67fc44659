//! Data models for scraped news and parse requests.
//!
//! This module defines the values that flow through the pipeline:
//! - [`NewsItem`]: one article, serialized to JSON on the broker and in the
//!   fallback list
//! - [`ParseRequest`]: the `(query, page)` pair handed to a parser
//! - [`Parsed`]: what a parser returns for one request
//!
//! Field names on the wire are snake_case and match what the downstream
//! document store reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A news article as scraped from a source.
///
/// `link` together with `source` identifies the same real-world article.
/// Downstream consumers resolve duplicates using `published_at`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NewsItem {
    /// The article headline.
    pub title: String,
    /// Canonical article URL.
    pub link: String,
    /// Identifier of the worker that produced the item (e.g. `"lenta"`).
    pub source: String,
    /// Publication time in UTC.
    pub published_at: DateTime<Utc>,
    /// Authors in byline order.
    pub authors: Vec<String>,
    /// Topic tags, de-duplicated.
    pub tags: Vec<String>,
    /// Site sections or rubrics.
    pub categories: Vec<String>,
    /// Article body text, one paragraph per line.
    pub content: String,
    /// Lead or subtitle, when the page has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl NewsItem {
    /// Serialize to the JSON body used on the broker and in the fallback list.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Input to one parse cycle.
///
/// `page` is opaque to everything except the parser that produced it; an
/// empty string means "start from the beginning".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseRequest {
    pub query: String,
    pub page: String,
}

impl ParseRequest {
    /// A request for the given page with no query (archive and feed workers).
    pub fn page(page: impl Into<String>) -> Self {
        Self {
            query: String::new(),
            page: page.into(),
        }
    }

    /// A request for the first page of a search.
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            page: String::new(),
        }
    }
}

/// Result of one parse cycle: the items found and the token to resume from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parsed {
    pub items: Vec<NewsItem>,
    pub next_page: String,
}

#[cfg(test)]
pub(crate) fn sample_item(n: usize) -> NewsItem {
    use chrono::TimeZone;

    NewsItem {
        title: format!("Item {n}"),
        link: format!("https://example.com/news/{n}"),
        source: "example".to_string(),
        published_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        authors: vec!["Ivan Petrov".to_string()],
        tags: vec!["economy".to_string()],
        categories: vec!["Russia".to_string()],
        content: format!("Body of item {n}"),
        description: None,
    }
}
