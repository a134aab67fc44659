//! Self-paced polling for archive and feed sources.
//!
//! An archive worker walks back through dated pages and remembers where it
//! stopped in the [`PageStore`], so a restart resumes from the same page. A
//! feed worker re-reads the same document every cycle and keeps no cursor.

use super::{Backoff, pause};
use crate::error::StoreError;
use crate::ingest::IngestService;
use crate::models::ParseRequest;
use crate::store::PageStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Where a worker persists its page token.
pub struct Cursor {
    pub store: Arc<dyn PageStore>,
    pub key: String,
}

pub struct PollWorker {
    role: &'static str,
    service: Arc<IngestService>,
    cursor: Option<Cursor>,
    backoff: Backoff,
}

impl PollWorker {
    /// An archive worker that resumes from `cursor`.
    pub fn archive(service: Arc<IngestService>, cursor: Cursor, backoff: Backoff) -> Self {
        Self {
            role: "archive",
            service,
            cursor: Some(cursor),
            backoff,
        }
    }

    /// A feed worker that always requests the empty page.
    pub fn feed(service: Arc<IngestService>, backoff: Backoff) -> Self {
        Self {
            role: "feed",
            service,
            cursor: None,
            backoff,
        }
    }

    async fn load_page(&self) -> Result<String, StoreError> {
        let Some(cursor) = &self.cursor else {
            return Ok(String::new());
        };
        match cursor.store.get(&cursor.key).await {
            Ok(page) => Ok(page),
            Err(e) if e.is_not_found() => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Run until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Only a failure to read the initial cursor ends the worker early.
    #[instrument(level = "info", skip_all, fields(role = self.role))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), StoreError> {
        let mut page = self.load_page().await?;
        info!(page = %page, "Worker started");

        loop {
            if !pause(&cancel, self.backoff.delay()).await {
                break;
            }

            match self.service.parse(&cancel, &ParseRequest::page(page.clone())).await {
                Ok(report) => {
                    if let Some(cursor) = &self.cursor {
                        if let Err(e) = cursor.store.set(&cursor.key, &report.next_page).await {
                            error!(next_page = %report.next_page, error = %e, "Failed to store cursor");
                        }
                        page = report.next_page.clone();
                    }
                    let delay = self.backoff.on_success();
                    info!(
                        count = report.count,
                        next_page = %report.next_page,
                        ?delay,
                        "Parsed"
                    );
                }
                Err(e) if e.is_cancelled() || cancel.is_cancelled() => break,
                Err(e) => {
                    let delay = self.backoff.on_failure();
                    warn!(page = %page, error = %e, ?delay, "Parse failed; backing off");
                }
            }
        }

        info!("Worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseError;
    use crate::ingest::testing::ScriptedPublisher;
    use crate::ingest::{Parser, Route};
    use crate::models::{Parsed, sample_item};
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Returns the page after `page` as `page + "-"`, recording each request.
    #[derive(Default)]
    struct StepParser {
        pages: Mutex<Vec<String>>,
        fail_first: Mutex<usize>,
    }

    #[async_trait]
    impl Parser for StepParser {
        async fn parse(&self, _: &CancellationToken, req: &ParseRequest) -> Result<Parsed, ParseError> {
            self.pages.lock().unwrap().push(req.page.clone());
            {
                let mut left = self.fail_first.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(ParseError::Feed("unavailable".into()));
                }
            }
            Ok(Parsed {
                items: vec![sample_item(1)],
                next_page: format!("{}-", req.page),
            })
        }
    }

    fn service(parser: Arc<StepParser>, store: Arc<MemoryStore>) -> Arc<IngestService> {
        Arc::new(IngestService::new(
            Some(parser),
            Arc::new(ScriptedPublisher::default()),
            store,
            Route::queue("news"),
            "test",
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_archive_resumes_from_stored_cursor_and_advances() {
        let store = Arc::new(MemoryStore::new());
        store.set("page.test", "20240301").await.unwrap();
        let parser = Arc::new(StepParser::default());

        let worker = PollWorker::archive(
            service(parser.clone(), store.clone()),
            Cursor {
                store: store.clone(),
                key: "page.test".into(),
            },
            Backoff::new(Duration::from_secs(5), Duration::from_secs(60)),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        // cycles at t=0, 5, 10
        tokio::time::sleep(Duration::from_secs(11)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let pages = parser.pages.lock().unwrap().clone();
        assert_eq!(pages, vec!["20240301", "20240301-", "20240301--"]);
        assert_eq!(store.get("page.test").await.unwrap(), "20240301---");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_cursor_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        let parser = Arc::new(StepParser::default());
        let worker = PollWorker::archive(
            service(parser.clone(), store.clone()),
            Cursor {
                store: store.clone(),
                key: "page.test".into(),
            },
            Backoff::new(Duration::from_secs(5), Duration::from_secs(60)),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(parser.pages.lock().unwrap()[0], "");
        assert_eq!(store.get("page.test").await.unwrap(), "-");
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_backs_off_on_failure_and_keeps_empty_page() {
        let store = Arc::new(MemoryStore::new());
        let parser = Arc::new(StepParser {
            fail_first: Mutex::new(2),
            ..Default::default()
        });
        let worker = PollWorker::feed(
            service(parser.clone(), store),
            Backoff::new(Duration::from_secs(10), Duration::from_secs(600)),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        // t=0 fail (next in 10s), t=10 fail (next in 20s), t=30 ok (next in 10s), t=40 ok
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(parser.pages.lock().unwrap().len(), 2);
        tokio::time::sleep(Duration::from_secs(16)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let pages = parser.pages.lock().unwrap().clone();
        assert_eq!(pages.len(), 4);
        assert!(pages.iter().all(|p| p.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stored_cursor_is_idempotent_for_fixed_parser() {
        use crate::ingest::testing::FixedParser;

        let store = Arc::new(MemoryStore::new());
        let parsed = Parsed {
            items: vec![],
            next_page: "20240229".into(),
        };
        let svc = Arc::new(IngestService::new(
            Some(Arc::new(FixedParser(parsed))),
            Arc::new(ScriptedPublisher::default()),
            store.clone(),
            Route::queue("news"),
            "test",
        ));
        let worker = PollWorker::archive(
            svc,
            Cursor {
                store: store.clone(),
                key: "page.test".into(),
            },
            Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(store.get("page.test").await.unwrap(), "20240229");
    }
}
