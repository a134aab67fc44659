//! RSS feed parser.
//!
//! The feed is re-read every cycle, so the parser remembers which links it
//! has already handled and when they were published:
//!
//! - a link is parsed when it is new, or when its `pubDate` moved forward
//! - links that dropped out of the feed are forgotten
//! - links whose article fetch failed are forgotten too, so the next cycle
//!   retries them

use super::article::FetchArticle;
use super::fanout::parse_many;
use super::fetch_text;
use crate::error::ParseError;
use crate::ingest::Parser;
use crate::models::{ParseRequest, Parsed};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    link: String,
    #[serde(rename = "pubDate")]
    pub_date: String,
}

/// Parse an RSS 2.0 document into `(link, published_at)` pairs.
fn parse_rss(xml: &str) -> Result<Vec<(String, DateTime<Utc>)>, ParseError> {
    let rss: Rss = quick_xml::de::from_str(xml).map_err(|e| ParseError::Feed(e.to_string()))?;
    rss.channel
        .items
        .into_iter()
        .map(|item| {
            let published = DateTime::parse_from_rfc2822(item.pub_date.trim())
                .map_err(|e| ParseError::Feed(format!("bad pubDate {:?}: {e}", item.pub_date)))?;
            Ok((item.link.trim().to_string(), published.with_timezone(&Utc)))
        })
        .collect()
}

pub struct FeedParser {
    client: Client,
    url: String,
    fetcher: Arc<dyn FetchArticle>,
    concurrency: usize,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl FeedParser {
    pub fn new(client: Client, url: impl Into<String>, fetcher: Arc<dyn FetchArticle>, concurrency: usize) -> Self {
        Self {
            client,
            url: url.into(),
            fetcher,
            concurrency,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Links that are new or updated since the last cycle.
    async fn fresh_links(&self, entries: &[(String, DateTime<Utc>)]) -> Vec<String> {
        let mut seen = self.seen.lock().await;
        let mut fresh = Vec::new();
        for (link, published) in entries {
            let updated = seen.get(link).is_none_or(|prev| published > prev);
            if updated {
                seen.insert(link.clone(), *published);
                fresh.push(link.clone());
            }
        }

        let current: HashSet<&str> = entries.iter().map(|(l, _)| l.as_str()).collect();
        seen.retain(|link, _| current.contains(link.as_str()));
        fresh
    }
}

#[async_trait]
impl Parser for FeedParser {
    #[instrument(level = "info", skip_all, fields(url = %self.url))]
    async fn parse(&self, cancel: &CancellationToken, _request: &ParseRequest) -> Result<Parsed, ParseError> {
        let xml = fetch_text(&self.client, cancel, &self.url).await?;
        let entries = parse_rss(&xml)?;
        let links = self.fresh_links(&entries).await;
        debug!(entries = entries.len(), fresh = links.len(), "Feed read");

        let mut items = match parse_many(cancel, Arc::clone(&self.fetcher), links.clone(), self.concurrency).await {
            Ok(items) => items,
            Err(e) => {
                let mut seen = self.seen.lock().await;
                for link in &links {
                    seen.remove(link);
                }
                return Err(e);
            }
        };

        // the feed's pubDate is authoritative
        let published: HashMap<&str, DateTime<Utc>> =
            entries.iter().map(|(l, d)| (l.as_str(), *d)).collect();
        for item in &mut items {
            if let Some(date) = published.get(item.link.as_str()) {
                item.published_at = *date;
            }
        }

        let parsed: HashSet<&str> = items.iter().map(|i| i.link.as_str()).collect();
        {
            let mut seen = self.seen.lock().await;
            for link in links.iter().filter(|l| !parsed.contains(l.as_str())) {
                seen.remove(link);
            }
        }

        info!(count = items.len(), "Feed parsed");
        Ok(Parsed {
            items,
            next_page: String::new(),
        })
    }
}
