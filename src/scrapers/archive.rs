//! Dated archive parser.
//!
//! The page token is a day in `YYYYMMDD` form (empty means today). Each day's
//! index page is fetched once; its links are then handed out `batch_size` at
//! a time across cycles. Once a day is exhausted the next page token is the
//! previous day, so the worker walks backwards through the archive.

use super::article::FetchArticle;
use super::fanout::parse_many;
use super::{collect_links, fetch_text, parse_url};
use crate::error::ParseError;
use crate::ingest::Parser;
use crate::models::{ParseRequest, Parsed};
use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use reqwest::Client;
use scraper::Selector;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

pub const PAGE_FORMAT: &str = "%Y%m%d";
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Links of the day currently being worked through.
#[derive(Debug, Default)]
struct Pending {
    page: String,
    links: VecDeque<String>,
}

pub struct ArchiveParser {
    client: Client,
    index_url: String,
    links: Selector,
    fetcher: Arc<dyn FetchArticle>,
    concurrency: usize,
    batch_size: usize,
    pending: Mutex<Pending>,
}

impl ArchiveParser {
    /// # Arguments
    ///
    /// * `index_url` - URL template; `{date}` is replaced by the page token
    /// * `links` - Selector for article links on the index page
    /// * `batch_size` - Articles fetched per cycle
    pub fn new(
        client: Client,
        index_url: impl Into<String>,
        links: Selector,
        fetcher: Arc<dyn FetchArticle>,
        concurrency: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            client,
            index_url: index_url.into(),
            links,
            fetcher,
            concurrency,
            batch_size: batch_size.max(1),
            pending: Mutex::new(Pending::default()),
        }
    }

    async fn index(&self, cancel: &CancellationToken, page: &str) -> Result<Vec<String>, ParseError> {
        let url = self.index_url.replace("{date}", page);
        let base = parse_url(&url)?;
        let html = fetch_text(&self.client, cancel, &url).await?;
        let links = collect_links(&html, &base, &self.links);
        debug!(%url, count = links.len(), "Indexed archive page");
        Ok(links)
    }
}

/// Resolve a page token to a day. Empty means today.
pub fn page_date(page: &str) -> Result<NaiveDate, ParseError> {
    if page.is_empty() {
        return Ok(Utc::now().date_naive());
    }
    NaiveDate::parse_from_str(page, PAGE_FORMAT).map_err(|e| ParseError::InvalidPage {
        page: page.to_string(),
        reason: e.to_string(),
    })
}

/// The token of the day before `date`.
pub fn previous_page(date: NaiveDate) -> String {
    date.checked_sub_days(Days::new(1))
        .unwrap_or(date)
        .format(PAGE_FORMAT)
        .to_string()
}

#[async_trait]
impl Parser for ArchiveParser {
    #[instrument(level = "info", skip_all, fields(page = %request.page))]
    async fn parse(&self, cancel: &CancellationToken, request: &ParseRequest) -> Result<Parsed, ParseError> {
        let date = page_date(&request.page)?;
        let page = date.format(PAGE_FORMAT).to_string();

        let mut pending = self.pending.lock().await;
        if pending.page != page || pending.links.is_empty() {
            let links = self.index(cancel, &page).await?;
            *pending = Pending {
                page: page.clone(),
                links: links.into(),
            };
        }

        let take = self.batch_size.min(pending.links.len());
        let batch: Vec<String> = pending.links.drain(..take).collect();
        let next_page = if pending.links.is_empty() {
            previous_page(date)
        } else {
            page.clone()
        };
        let left = pending.links.len();
        drop(pending);

        let items = parse_many(cancel, Arc::clone(&self.fetcher), batch, self.concurrency).await?;
        info!(count = items.len(), left, next_page = %next_page, "Archive batch parsed");
        Ok(Parsed { items, next_page })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewsItem, sample_item};
    use crate::scrapers::selector;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Echo;

    #[async_trait]
    impl FetchArticle for Echo {
        async fn fetch(&self, _: &CancellationToken, url: &str) -> Result<NewsItem, ParseError> {
            Ok(NewsItem {
                link: url.to_string(),
                ..sample_item(0)
            })
        }
    }

    fn index_html(n: usize) -> String {
        let links: String = (0..n)
            .map(|i| format!(r#"<div class="list-item"><a href="/20240301/story-{i}.html">{i}</a></div>"#))
            .collect();
        format!("<html><body>{links}</body></html>")
    }

    #[test]
    fn test_page_tokens() {
        let d = page_date("20240301").unwrap();
        assert_eq!(previous_page(d), "20240229");
        assert!(matches!(page_date("2024-03-01"), Err(ParseError::InvalidPage { .. })));
        assert_eq!(page_date("").unwrap(), Utc::now().date_naive());
    }

    #[tokio::test]
    async fn test_day_is_worked_through_in_batches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/20240301/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(index_html(5)))
            .expect(1)
            .mount(&server)
            .await;

        let parser = ArchiveParser::new(
            Client::new(),
            format!("{}/{{date}}/", server.uri()),
            selector(".list-item").unwrap(),
            Arc::new(Echo),
            2,
            3,
        );
        let cancel = CancellationToken::new();

        let first = parser.parse(&cancel, &ParseRequest::page("20240301")).await.unwrap();
        assert_eq!(first.items.len(), 3);
        assert_eq!(first.next_page, "20240301");

        let second = parser.parse(&cancel, &ParseRequest::page("20240301")).await.unwrap();
        assert_eq!(second.items.len(), 2);
        assert_eq!(second.next_page, "20240229");

        let mut links: Vec<String> = first
            .items
            .iter()
            .chain(second.items.iter())
            .map(|i| i.link.clone())
            .collect();
        links.sort();
        links.dedup();
        assert_eq!(links.len(), 5);
    }

    #[tokio::test]
    async fn test_empty_day_moves_to_previous() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let parser = ArchiveParser::new(
            Client::new(),
            format!("{}/{{date}}/", server.uri()),
            selector(".list-item").unwrap(),
            Arc::new(Echo),
            2,
            20,
        );
        let parsed = parser
            .parse(&CancellationToken::new(), &ParseRequest::page("20240101"))
            .await
            .unwrap();
        assert!(parsed.items.is_empty());
        assert_eq!(parsed.next_page, "20231231");
    }
}
