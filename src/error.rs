//! Error types for each layer of the ingestion pipeline.
//!
//! Every layer returns its own enum so callers can tell the three kinds of
//! failure apart without string matching:
//!
//! - **Cancellation**: the root token was cancelled. This is the normal
//!   shutdown path, never a fault. See the `is_cancelled` helpers.
//! - **Not found**: [`StoreError::NotFound`] for "no cursor yet" or "fallback
//!   list is empty".
//! - **Everything else**: transport or data faults.

use std::time::Duration;
use thiserror::Error;

/// Failures of the broker connection, producer, and consumer.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("invalid broker address: {0}")]
    InvalidAddress(String),

    #[error("broker is not connected")]
    NotConnected,

    #[error("broker operation cancelled")]
    Cancelled,

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("delivery stream closed unexpectedly")]
    StreamClosed,

    #[error("broker rejected the message: {0}")]
    Rejected(String),

    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("gave up after {attempts} connection attempts: {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: Box<BrokerError>,
    },
}

impl BrokerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BrokerError::Cancelled)
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(e: lapin::Error) -> Self {
        BrokerError::Transport(e.to_string())
    }
}

/// Failures of the durable fallback store and the cursor store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No value under the requested key. Not an operational failure.
    #[error("key not found")]
    NotFound,

    #[error("invalid store address: {0}")]
    InvalidAddress(String),

    #[error("store operation cancelled")]
    Cancelled,

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("gave up after {attempts} connection attempts: {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Failures reported by a [`Parser`](crate::ingest::Parser).
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("parse cancelled")]
    Cancelled,

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response status {code} from {url}")]
    Status { code: u16, url: String },

    #[error("no {field} found at {url}")]
    Missing { field: &'static str, url: String },

    #[error("malformed feed: {0}")]
    Feed(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid page token {page:?}: {reason}")]
    InvalidPage { page: String, reason: String },

    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },

    #[error("invalid url {url:?}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

impl ParseError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ParseError::Cancelled)
    }
}

/// Failures of one ingestion call.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("parser failed: {0}")]
    Parse(#[from] ParseError),

    #[error("failed to serialize news item: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("publish failed: {0}")]
    Publish(#[source] BrokerError),

    #[error("fallback store failed: {0}")]
    Store(#[source] StoreError),

    #[error("this service has no parser configured")]
    NoParser,
}

impl IngestError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            IngestError::Parse(e) => e.is_cancelled(),
            IngestError::Publish(e) => e.is_cancelled(),
            IngestError::Store(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// Failures loading the sources file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid sources file {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// A release pass that stopped early. `released` records were already
/// published and removed before `source` occurred.
#[derive(Error, Debug)]
#[error("release stopped after {released} records: {source}")]
pub struct ReleaseError {
    pub released: usize,
    #[source]
    pub source: IngestError,
}
