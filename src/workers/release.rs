//! Periodic drain of the fallback store.

use super::pause;
use crate::ingest::IngestService;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

pub struct ReleaseWorker {
    service: Arc<IngestService>,
    interval: Duration,
}

impl ReleaseWorker {
    pub fn new(service: Arc<IngestService>, interval: Duration) -> Self {
        Self { service, interval }
    }

    /// Release once immediately, then every `interval`, until cancelled.
    #[instrument(level = "info", skip_all, fields(role = "release"))]
    pub async fn run(self, cancel: CancellationToken) {
        let mut delay = Duration::ZERO;
        while pause(&cancel, delay).await {
            match self.service.release().await {
                Ok(count) => info!(count, delay = ?self.interval, "Released"),
                Err(e) => error!(count = e.released, error = %e.source, delay = ?self.interval, "Release stopped early"),
            }
            delay = self.interval;
        }
        info!("Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Route;
    use crate::ingest::testing::ScriptedPublisher;
    use crate::store::FallbackStore;
    use crate::store::memory::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_release_runs_on_fixed_interval() {
        let store = Arc::new(MemoryStore::new());
        store.push(b"R1").await.unwrap();
        // first pass fails, the second one (15 min later) drains
        let publisher = Arc::new(ScriptedPublisher::failing_on(&[1]));
        let svc = Arc::new(IngestService::new(
            None,
            publisher.clone(),
            store.clone(),
            Route::queue("news"),
            "test",
        ));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ReleaseWorker::new(svc, Duration::from_secs(900)).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.len().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(store.len().await.unwrap(), 0);
        assert_eq!(publisher.bodies(), vec![b"R1".to_vec()]);

        cancel.cancel();
        handle.await.unwrap();
    }
}
