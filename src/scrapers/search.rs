//! Site search parser.

use super::article::FetchArticle;
use super::fanout::parse_many;
use super::{collect_links, fetch_text, parse_url};
use crate::error::ParseError;
use crate::ingest::Parser;
use crate::models::{ParseRequest, Parsed};
use async_trait::async_trait;
use reqwest::Client;
use scraper::Selector;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

pub struct SearchParser {
    client: Client,
    url: String,
    links: Selector,
    fetcher: Arc<dyn FetchArticle>,
    concurrency: usize,
}

impl SearchParser {
    /// `url` is a template; `{query}` is replaced by the percent-encoded query.
    pub fn new(
        client: Client,
        url: impl Into<String>,
        links: Selector,
        fetcher: Arc<dyn FetchArticle>,
        concurrency: usize,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            links,
            fetcher,
            concurrency,
        }
    }

    fn search_url(&self, query: &str) -> String {
        self.url.replace("{query}", &urlencoding::encode(query))
    }
}

#[async_trait]
impl Parser for SearchParser {
    #[instrument(level = "info", skip_all, fields(query = %request.query))]
    async fn parse(&self, cancel: &CancellationToken, request: &ParseRequest) -> Result<Parsed, ParseError> {
        let query = request.query.trim();
        if query.is_empty() {
            debug!("Empty query; nothing to search");
            return Ok(Parsed::default());
        }

        let url = self.search_url(query);
        let base = parse_url(&url)?;
        let html = fetch_text(&self.client, cancel, &url).await?;
        let links = collect_links(&html, &base, &self.links);
        debug!(count = links.len(), "Search results indexed");

        let items = parse_many(cancel, Arc::clone(&self.fetcher), links, self.concurrency).await?;
        info!(count = items.len(), "Search parsed");
        Ok(Parsed {
            items,
            next_page: String::new(),
        })
    }
}
