//! Sources file: which generic parsers a worker runs and how.
//!
//! ```yaml
//! article:
//!   content_selector: "div.article__text"
//! feed:
//!   url: https://lenta.ru/rss/news
//! archive:
//!   index_url: https://ria.ru/{date}/
//!   link_selector: ".list-item__title"
//!   batch_size: 20
//! search:
//!   url: https://ria.ru/search/?query={query}
//!   link_selector: ".list-item__title"
//! ```
//!
//! Every section is optional. A missing section disables that role.

use crate::error::{ConfigError, ParseError};
use crate::ingest::Parser;
use crate::scrapers::archive::{ArchiveParser, DEFAULT_BATCH_SIZE};
use crate::scrapers::article::{ArticleExtractor, DEFAULT_CONTENT_SELECTOR};
use crate::scrapers::feed::FeedParser;
use crate::scrapers::search::SearchParser;
use crate::scrapers::selector;
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub article: ArticleConfig,
    pub feed: Option<FeedConfig>,
    pub archive: Option<ArchiveConfig>,
    pub search: Option<SearchConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArticleConfig {
    #[serde(default = "default_content_selector")]
    pub content_selector: String,
}

impl Default for ArticleConfig {
    fn default() -> Self {
        Self {
            content_selector: default_content_selector(),
        }
    }
}

fn default_content_selector() -> String {
    DEFAULT_CONTENT_SELECTOR.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedConfig {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArchiveConfig {
    /// URL template containing `{date}`.
    pub index_url: String,
    pub link_selector: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SearchConfig {
    /// URL template containing `{query}`.
    pub url: String,
    pub link_selector: String,
}

/// The parsers built from a [`SourcesConfig`], one per enabled role.
#[derive(Default)]
pub struct Parsers {
    pub feed: Option<Arc<dyn Parser>>,
    pub archive: Option<Arc<dyn Parser>>,
    pub search: Option<Arc<dyn Parser>>,
}

impl SourcesConfig {
    /// Load and parse a YAML sources file.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let config = Self::from_yaml(&raw).map_err(|source| ConfigError::Yaml {
            path: display,
            source,
        })?;
        info!(
            feed = config.feed.is_some(),
            archive = config.archive.is_some(),
            search = config.search.is_some(),
            "Loaded sources"
        );
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Build the configured parsers.
    ///
    /// # Arguments
    ///
    /// * `client` - Shared HTTP client
    /// * `source` - Stamped into every item; the worker id
    /// * `concurrency` - Article fetches in flight per parse call
    pub fn parsers(&self, client: &Client, source: &str, concurrency: usize) -> Result<Parsers, ParseError> {
        let extractor = Arc::new(ArticleExtractor::new(
            client.clone(),
            source,
            &self.article.content_selector,
        )?);

        let feed = self.feed.as_ref().map(|f| {
            Arc::new(FeedParser::new(client.clone(), &f.url, extractor.clone(), concurrency)) as Arc<dyn Parser>
        });

        let archive = match &self.archive {
            Some(a) => Some(Arc::new(ArchiveParser::new(
                client.clone(),
                &a.index_url,
                selector(&a.link_selector)?,
                extractor.clone(),
                concurrency,
                a.batch_size,
            )) as Arc<dyn Parser>),
            None => None,
        };

        let search = match &self.search {
            Some(s) => Some(Arc::new(SearchParser::new(
                client.clone(),
                &s.url,
                selector(&s.link_selector)?,
                extractor.clone(),
                concurrency,
            )) as Arc<dyn Parser>),
            None => None,
        };

        Ok(Parsers { feed, archive, search })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
article:
  content_selector: "div.article__text"
feed:
  url: https://lenta.ru/rss/news
archive:
  index_url: https://ria.ru/{date}/
  link_selector: ".list-item__title"
search:
  url: https://ria.ru/search/?query={query}
  link_selector: ".list-item__title"
"#;

    #[test]
    fn test_full_sources_file() {
        let cfg = SourcesConfig::from_yaml(FULL).unwrap();
        assert_eq!(cfg.article.content_selector, "div.article__text");
        assert_eq!(cfg.feed.unwrap().url, "https://lenta.ru/rss/news");
        let archive = cfg.archive.unwrap();
        assert_eq!(archive.index_url, "https://ria.ru/{date}/");
        assert_eq!(archive.batch_size, DEFAULT_BATCH_SIZE);
        assert!(cfg.search.is_some());
    }

    #[test]
    fn test_missing_sections_disable_roles() {
        let cfg = SourcesConfig::from_yaml("feed:\n  url: https://lenta.ru/rss/news\n").unwrap();
        assert_eq!(cfg.article.content_selector, DEFAULT_CONTENT_SELECTOR);
        assert!(cfg.archive.is_none());
        assert!(cfg.search.is_none());

        let parsers = cfg.parsers(&Client::new(), "lenta", 4).unwrap();
        assert!(parsers.feed.is_some());
        assert!(parsers.archive.is_none());
        assert!(parsers.search.is_none());
    }

    #[test]
    fn test_bad_selector_is_rejected() {
        let cfg = SourcesConfig::from_yaml(
            "search:\n  url: https://x/?q={query}\n  link_selector: \"a[\"\n",
        )
        .unwrap();
        assert!(matches!(
            cfg.parsers(&Client::new(), "x", 1),
            Err(ParseError::Selector { .. })
        ));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = SourcesConfig::load("/nonexistent/sources.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
