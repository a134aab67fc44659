//! # News Ingest
//!
//! A long-running news ingestion worker. It scrapes articles from a
//! configured site and publishes each one as a JSON message to a durable
//! broker queue. Items that cannot be published are buffered in a fallback
//! store and re-published later.
//!
//! ## Usage
//!
//! ```sh
//! news_ingest --id ria --amqp-url amqp://localhost:5672 --config sources/ria.yaml
//! ```
//!
//! ## Architecture
//!
//! One process runs up to four roles against shared infrastructure:
//! 1. **Search**: consumes queries from `query.<id>` and parses search results
//! 2. **Archive**: walks a dated archive backwards, resuming from a stored cursor
//! 3. **Feed**: polls an RSS feed for new or updated links
//! 4. **Release**: periodically drains the fallback store back into the broker
//!
//! All roles stop on SIGINT/SIGTERM; the broker connection is closed last.

use clap::Parser as _;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod broker;
mod cli;
mod config;
mod error;
mod ingest;
mod models;
mod scrapers;
mod store;
mod supervisor;
mod utils;
mod workers;

use broker::amqp::AmqpDialer;
use broker::connection::{Connection, ConnectionConfig};
use broker::producer::{Producer, Publish};
use broker::{Topology, search_queue_name};
use cli::Cli;
use config::SourcesConfig;
use error::{BrokerError, StoreError};
use ingest::{IngestService, Parser, Route};
use scrapers::fanout::default_concurrency;
use store::memory::MemoryStore;
use store::redis::RedisStore;
use store::{FallbackStore, PageStore, page_key};
use supervisor::Supervisor;
use workers::Backoff;
use workers::poll::{Cursor, PollWorker};
use workers::release::ReleaseWorker;
use workers::search::{SearchWorker, search_consumer};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a role needs to build its [`IngestService`].
struct Shared {
    publisher: Arc<dyn Publish>,
    fallback: Arc<dyn FallbackStore>,
    route: Route,
    app_id: String,
}

impl Shared {
    fn service(&self, parser: Option<Arc<dyn Parser>>) -> Arc<IngestService> {
        Arc::new(IngestService::new(
            parser,
            Arc::clone(&self.publisher),
            Arc::clone(&self.fallback),
            self.route.clone(),
            self.app_id.clone(),
        ))
    }
}

/// A startup step's result, with cancellation mapped to `Ok(None)`.
fn unless_cancelled<T, E>(res: Result<T, E>, is_cancelled: fn(&E) -> bool) -> Result<Option<T>, Box<dyn Error>>
where
    E: Error + 'static,
{
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if is_cancelled(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!(version = env!("CARGO_PKG_VERSION"), "news_ingest starting up");

    // Parse CLI
    let args = Cli::parse();
    debug!(id = %args.id, config = ?args.config, "Parsed CLI arguments");

    let sources = match &args.config {
        Some(path) => SourcesConfig::load(path)?,
        None => {
            warn!("No sources file given; running release only");
            SourcesConfig::default()
        }
    };
    let concurrency = args.concurrency.unwrap_or_else(default_concurrency).max(1);
    let client = scrapers::http_client()?;
    let parsers = sources.parsers(&client, &args.id, concurrency)?;

    // --- Shutdown coordination ---
    let sup = Supervisor::new();
    sup.watch_signals();

    // --- Fallback / cursor store ---
    let (fallback, pages): (Arc<dyn FallbackStore>, Arc<dyn PageStore>) = match &args.redis_url {
        Some(url) => {
            let connected = RedisStore::connect(url, args.connect_attempts, args.connect_delay(), &sup.token()).await;
            let Some(store) = unless_cancelled(connected, StoreError::is_cancelled)? else {
                info!(role = "store", "Shutdown requested while connecting; exiting");
                sup.wait().await;
                return Ok(());
            };
            let store = Arc::new(store);
            (store.clone(), store)
        }
        None => {
            warn!("No Redis URL given; fallback store is in-memory and lost on restart");
            let store = Arc::new(MemoryStore::new());
            (store.clone(), store)
        }
    };

    // --- Broker ---
    let topology = Topology::for_worker(&args.id, &args.query_exchange, args.query_routing, &args.news_queue);
    let opened = Connection::open(
        &sup,
        Arc::new(AmqpDialer::new(args.amqp_url.clone())),
        ConnectionConfig {
            attempt_count: args.connect_attempts,
            attempt_delay: args.connect_delay(),
        },
        topology,
    )
    .await;
    let Some(conn) = unless_cancelled(opened, BrokerError::is_cancelled)? else {
        info!(role = "broker", "Shutdown requested while connecting; exiting");
        sup.wait().await;
        return Ok(());
    };
    info!(
        query_exchange = %args.query_exchange,
        query_routing = ?args.query_routing,
        news_queue = %args.news_queue,
        "Broker connection open"
    );

    let shared = Shared {
        publisher: Arc::new(Producer::new(Arc::clone(&conn), args.publish_timeout())),
        fallback,
        route: Route::queue(args.news_queue.clone()),
        app_id: args.id.clone(),
    };
    let token = sup.token();

    // ---- Roles ----
    match parsers.search {
        Some(parser) => {
            let consumer = search_consumer(Arc::clone(&conn), shared.service(Some(parser)));
            let queue = search_queue_name(&args.query_exchange, &args.id);
            let worker = SearchWorker::new(consumer, queue, args.resubscribe_delay());
            sup.spawn(worker.run(token.clone()));
        }
        None => warn!(role = "search", "No search parser configured; search disabled"),
    }

    if let Some(parser) = parsers.archive {
        let cursor = Cursor {
            store: Arc::clone(&pages),
            key: page_key(&args.id),
        };
        let worker = PollWorker::archive(
            shared.service(Some(parser)),
            cursor,
            Backoff::new(args.archive_delay(), args.max_backoff()),
        );
        let cancel = token.clone();
        sup.spawn(async move {
            if let Err(e) = worker.run(cancel).await {
                error!(role = "archive", error = %e, "Archive worker failed");
            }
        });
    }

    if let Some(parser) = parsers.feed {
        let worker = PollWorker::feed(
            shared.service(Some(parser)),
            Backoff::new(args.feed_delay(), args.max_backoff()),
        );
        let cancel = token.clone();
        sup.spawn(async move {
            if let Err(e) = worker.run(cancel).await {
                error!(role = "feed", error = %e, "Feed worker failed");
            }
        });
    }

    let release = ReleaseWorker::new(shared.service(None), args.release_delay());
    sup.spawn(release.run(token.clone()));

    info!("All roles started");
    sup.wait().await;

    // ---- Teardown ----
    info!(state = ?conn.state(), "Closing broker connection");
    match tokio::time::timeout(CLOSE_TIMEOUT, conn.close()).await {
        Ok(Ok(())) => info!("Broker connection closed"),
        Ok(Err(e)) => warn!(error = %e, "Broker close failed"),
        Err(_) => warn!(timeout = ?CLOSE_TIMEOUT, "Broker close timed out"),
    }
    drop(shared);
    drop(pages);

    let elapsed = start_time.elapsed();
    info!(?elapsed, secs = elapsed.as_secs(), "Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_startup_is_not_an_error() {
        let store: Result<(), StoreError> = Err(StoreError::Cancelled);
        assert!(matches!(unless_cancelled(store, StoreError::is_cancelled), Ok(None)));

        let broker: Result<(), BrokerError> = Err(BrokerError::Cancelled);
        assert!(matches!(unless_cancelled(broker, BrokerError::is_cancelled), Ok(None)));
    }

    #[test]
    fn test_startup_faults_still_fail() {
        let exhausted: Result<(), BrokerError> = Err(BrokerError::Exhausted {
            attempts: 5,
            source: Box::new(BrokerError::Transport("connection refused".into())),
        });
        let err = unless_cancelled(exhausted, BrokerError::is_cancelled).unwrap_err();
        assert!(err.to_string().contains("5 connection attempts"));

        assert_eq!(unless_cancelled(Ok::<_, StoreError>(7), StoreError::is_cancelled).unwrap(), Some(7));
    }
}
