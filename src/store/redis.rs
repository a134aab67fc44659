//! Redis-backed fallback list and cursor store.
//!
//! Wire layout:
//!
//! | Key | Type | Operations |
//! |-----|------|------------|
//! | `news` | list of JSON news items | `RPUSH`, `LINDEX 0`, `LPOP`, `LLEN` |
//! | `page.<worker id>` | string | `GET`, `SET` |

use super::{FallbackStore, NEWS_KEY, PageStore};
use crate::error::StoreError;
use ::redis::aio::ConnectionManager;
use ::redis::{Client, cmd};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    list_key: String,
}

impl RedisStore {
    /// Connect and verify the server answers, retrying a bounded number of
    /// times.
    ///
    /// # Arguments
    ///
    /// * `url` - e.g. `redis://127.0.0.1:6379/0`
    /// * `attempts` - Number of connection attempts before giving up
    /// * `delay` - Pause between attempts
    /// * `cancel` - Aborts the retry loop with [`StoreError::Cancelled`]
    #[instrument(level = "info", skip_all, fields(role = "store"))]
    pub async fn connect(
        url: &str,
        attempts: usize,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::InvalidAddress(e.to_string()))?;

        let attempts = attempts.max(1);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let res = tokio::select! {
                res = Self::ping(&client) => res,
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
            };
            match res {
                Ok(conn) => {
                    info!(attempt, "Redis store ready");
                    return Ok(Self {
                        conn,
                        list_key: NEWS_KEY.to_string(),
                    });
                }
                Err(e) if attempt >= attempts => {
                    return Err(StoreError::Exhausted {
                        attempts,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(attempt, left = attempts - attempt, ?delay, error = %e, "Redis not reachable yet");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                    }
                }
            }
        }
    }

    async fn ping(client: &Client) -> Result<ConnectionManager, StoreError> {
        let mut conn = client.get_connection_manager().await?;
        let _: String = cmd("PING").query_async(&mut conn).await?;
        Ok(conn)
    }
}

#[async_trait]
impl FallbackStore for RedisStore {
    async fn push(&self, record: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = cmd("RPUSH")
            .arg(&self.list_key)
            .arg(record)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn peek_first(&self) -> Result<Vec<u8>, StoreError> {
        let mut conn = self.conn.clone();
        let first: Option<Vec<u8>> = cmd("LINDEX")
            .arg(&self.list_key)
            .arg(0)
            .query_async(&mut conn)
            .await?;
        first.ok_or(StoreError::NotFound)
    }

    async fn delete_first(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: Option<Vec<u8>> = cmd("LPOP")
            .arg(&self.list_key)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = cmd("LLEN")
            .arg(&self.list_key)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}

#[async_trait]
impl PageStore for RedisStore {
    async fn get(&self, key: &str) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = cmd("GET").arg(key).query_async(&mut conn).await?;
        value.ok_or(StoreError::NotFound)
    }

    async fn set(&self, key: &str, token: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = cmd("SET").arg(key).arg(token).query_async(&mut conn).await?;
        Ok(())
    }
}
