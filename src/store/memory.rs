//! Process-local store. Nothing survives a restart.

use super::{FallbackStore, PageStore};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryStore {
    list: Mutex<VecDeque<Vec<u8>>>,
    pages: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FallbackStore for MemoryStore {
    async fn push(&self, record: &[u8]) -> Result<(), StoreError> {
        self.list.lock().await.push_back(record.to_vec());
        Ok(())
    }

    async fn peek_first(&self) -> Result<Vec<u8>, StoreError> {
        self.list
            .lock()
            .await
            .front()
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn delete_first(&self) -> Result<(), StoreError> {
        self.list.lock().await.pop_front();
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.list.lock().await.len())
    }
}

#[async_trait]
impl PageStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<String, StoreError> {
        self.pages
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn set(&self, key: &str, token: &str) -> Result<(), StoreError> {
        self.pages
            .lock()
            .await
            .insert(key.to_string(), token.to_string());
        Ok(())
    }
}
