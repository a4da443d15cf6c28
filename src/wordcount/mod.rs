//! Word-count backend.
//!
//! This is the compute service the proxy balances across. The proxy never
//! looks inside its traffic; the service and its client stub live here so
//! that a full deployment (client -> relaylb -> servers) can be run and
//! tested from one crate.
//!
//! - **`cache`**: TTL cache keyed by document and lowercased keyword
//! - **`service`**: document store and whole-word counting
//! - **`rpc`**: newline-delimited JSON wire format, server loop and client stub

pub mod cache;
pub mod rpc;
pub mod service;

use std::future::Future;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cache::{CacheKey, CountCache};
pub use rpc::WordCountClient;
pub use service::WordCountService;

/// Result of a `count_words` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountWordsResponse {
    pub doc: String,
    /// The keyword as it was counted (lowercased)
    pub keyword: String,
    pub count: u64,
    /// Whether the count came from the cache
    pub cached: bool,
}

#[derive(Debug, Error)]
pub enum WordCountError {
    #[error("invalid document id {0:?}")]
    InvalidDocument(String),

    #[error("document {0} not found")]
    DocumentNotFound(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("server error: {0}")]
    Remote(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// The fixed interface every word-count backend offers.
pub trait WordCount {
    /// Identifiers of the documents that can be searched
    fn list_docs(&self) -> impl Future<Output = Result<Vec<String>, WordCountError>> + Send;

    /// Case-insensitive whole-word occurrences of `keyword` in `doc`
    fn count_words(
        &self,
        doc: &str,
        keyword: &str,
    ) -> impl Future<Output = Result<CountWordsResponse, WordCountError>> + Send;
}
