//! Bounded-concurrency article fetching.

use super::article::FetchArticle;
use crate::error::ParseError;
use crate::models::NewsItem;
use std::sync::Arc;
use std::thread;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Twice the available parallelism, the default fan-out width.
pub fn default_concurrency() -> usize {
    thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
}

/// Fetch every link with at most `concurrency` requests in flight.
///
/// Items arrive in completion order. Failed links are logged and skipped.
///
/// # Errors
///
/// [`ParseError::Cancelled`] if `cancel` fired before every link was
/// admitted. Fetches already in flight still finish first.
#[instrument(level = "info", skip_all, fields(links = links.len(), concurrency = concurrency))]
pub async fn parse_many(
    cancel: &CancellationToken,
    fetcher: Arc<dyn FetchArticle>,
    links: Vec<String>,
    concurrency: usize,
) -> Result<Vec<NewsItem>, ParseError> {
    let total = links.len();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let (tx, mut rx) = mpsc::channel::<NewsItem>(total.max(1));
    let mut interrupted = false;

    for link in links {
        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = cancel.cancelled() => {
                interrupted = true;
                break;
            }
        };

        let tx = tx.clone();
        let fetcher = Arc::clone(&fetcher);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match fetcher.fetch(&cancel, &link).await {
                Ok(item) => {
                    let _ = tx.send(item).await;
                }
                Err(e) if e.is_cancelled() => debug!(%link, "Fetch cancelled"),
                Err(e) => warn!(%link, error = %e, "Article fetch failed; skipping"),
            }
        });
    }
    drop(tx);

    let mut items = Vec::with_capacity(total);
    while let Some(item) = rx.recv().await {
        items.push(item);
    }

    if interrupted {
        return Err(ParseError::Cancelled);
    }
    debug!(fetched = items.len(), failed = total - items.len(), "Fan-out finished");
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sample_item;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails links containing "bad"; tracks peak concurrency.
    #[derive(Default)]
    struct PeakTracker {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl FetchArticle for PeakTracker {
        async fn fetch(&self, _: &CancellationToken, url: &str) -> Result<NewsItem, ParseError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if url.contains("bad") {
                return Err(ParseError::Feed("boom".into()));
            }
            Ok(NewsItem {
                link: url.to_string(),
                ..sample_item(0)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded_and_failures_skipped() {
        let tracker = Arc::new(PeakTracker::default());
        let links: Vec<String> = (0..10)
            .map(|i| {
                if i % 4 == 0 {
                    format!("https://example.com/bad/{i}")
                } else {
                    format!("https://example.com/ok/{i}")
                }
            })
            .collect();

        let items = parse_many(&CancellationToken::new(), tracker.clone(), links, 3)
            .await
            .unwrap();

        assert_eq!(items.len(), 7);
        assert!(items.iter().all(|i| i.link.contains("/ok/")));
        assert!(tracker.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let items = parse_many(&CancellationToken::new(), Arc::new(PeakTracker::default()), vec![], 4)
            .await
            .unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_admission() {
        let tracker = Arc::new(PeakTracker::default());
        let cancel = CancellationToken::new();
        let links: Vec<String> = (0..10).map(|i| format!("https://example.com/ok/{i}")).collect();

        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            c.cancel();
        });

        let err = parse_many(&cancel, tracker, links, 1).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_default_concurrency_is_positive() {
        assert!(default_concurrency() >= 2);
    }
}
