//! Durable state kept outside the broker.
//!
//! Two concerns share one backend:
//!
//! - [`FallbackStore`]: a FIFO list of serialized news items that could not
//!   be published, drained later by the release worker
//! - [`PageStore`]: one resumable cursor per worker
//!
//! [`redis::RedisStore`] is the production backend; [`memory::MemoryStore`]
//! is used when no Redis URL is configured and in tests.

pub mod memory;
pub mod redis;

use crate::error::StoreError;
use async_trait::async_trait;

/// List key holding buffered news items.
pub const NEWS_KEY: &str = "news";

/// Key under which a worker keeps its cursor.
pub fn page_key(worker_id: &str) -> String {
    format!("page.{worker_id}")
}

#[async_trait]
pub trait FallbackStore: Send + Sync {
    /// Append one record at the tail.
    async fn push(&self, record: &[u8]) -> Result<(), StoreError>;

    /// The oldest record, or [`StoreError::NotFound`] when the list is empty.
    async fn peek_first(&self) -> Result<Vec<u8>, StoreError>;

    /// Remove the oldest record. Removing from an empty list is not an error.
    async fn delete_first(&self) -> Result<(), StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait PageStore: Send + Sync {
    /// The stored cursor, or [`StoreError::NotFound`] if none was ever set.
    async fn get(&self, key: &str) -> Result<String, StoreError>;

    async fn set(&self, key: &str, token: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_key_is_per_worker() {
        assert_eq!(page_key("ria"), "page.ria");
        assert_ne!(page_key("ria"), page_key("lenta"));
    }
}
