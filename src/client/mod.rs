//! Command-line client logic.
//!
//! The binary in `src/bin/wordcount-client.rs` only parses arguments; the
//! actual modes live here so they can be driven from tests.

use std::path::Path;
use std::time::{Duration, Instant};

use rand::seq::IndexedRandom;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::wordcount::{CountWordsResponse, WordCount, WordCountClient, WordCountError};

/// Keywords the mock mode picks from.
pub const MOCK_KEYWORDS: &[&str] = &[
    "paul", "duke", "fremen", "sand", "desert", "water", "spice", "leto", "atreides", "arrakis",
    "jessica", "reverend", "mentat", "harkonnen", "baron", "emperor", "sardaukar", "prophet",
    "stilgar", "sietch", "hawat", "duncan", "arrakeen", "sandworm",
];

/// Append-only latency record shared by concurrent writers.
///
/// Each line is `<RFC 3339 timestamp>,<latency in ms>`.
pub struct LatencyLog {
    file: Mutex<File>,
}

impl LatencyLog {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub async fn record(&self, latency: Duration) -> std::io::Result<()> {
        let line = format!(
            "{},{:.3}\n",
            chrono::Local::now().to_rfc3339(),
            latency.as_secs_f64() * 1000.0
        );

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

/// One line summary of a count, as printed by query mode.
pub fn format_count(response: &CountWordsResponse) -> String {
    format!("Word count: {} (cached={})", response.count, response.cached)
}

/// Fetch the document list over a fresh connection.
pub async fn list_docs(addr: &str) -> Result<Vec<String>, WordCountError> {
    let client = WordCountClient::connect(addr).await?;
    let docs = client.list_docs().await?;
    let _ = client.close().await;
    Ok(docs)
}

/// Run one query over a fresh connection and time it.
pub async fn timed_query(
    addr: &str,
    doc: &str,
    keyword: &str,
) -> Result<(CountWordsResponse, Duration), WordCountError> {
    let client = WordCountClient::connect(addr).await?;

    let started = Instant::now();
    let result = client.count_words(doc, keyword).await;
    let elapsed = started.elapsed();

    let _ = client.close().await;
    result.map(|response| (response, elapsed))
}

/// Settings for the unattended query loop.
pub struct MockOptions<'a> {
    pub interval: Duration,
    pub keywords: &'a [&'a str],
    pub latency_log: Option<&'a LatencyLog>,
    /// Stop after this many requests; run forever when `None`
    pub iterations: Option<u64>,
}

/// Issue random queries at a fixed interval. Returns how many succeeded.
///
/// A failed request is reported and the loop carries on; only failing to
/// fetch the document list up front is an error.
pub async fn mock_loop(addr: &str, options: MockOptions<'_>) -> Result<u64, WordCountError> {
    let docs = list_docs(addr).await?;
    if docs.is_empty() || options.keywords.is_empty() {
        return Err(WordCountError::Protocol("nothing to query".into()));
    }

    let mut succeeded = 0;
    let mut i: u64 = 0;

    while options.iterations.is_none_or(|limit| i < limit) {
        i += 1;

        let (doc, keyword) = {
            let mut rng = rand::rng();
            (
                docs.choose(&mut rng).cloned().unwrap_or_default(),
                options.keywords.choose(&mut rng).copied().unwrap_or_default(),
            )
        };

        match timed_query(addr, &doc, keyword).await {
            Ok((response, elapsed)) => {
                succeeded += 1;
                println!(
                    "request #{i}: elapsed={:.3} ms",
                    elapsed.as_secs_f64() * 1000.0
                );
                println!("{response:?}");

                if let Some(log) = options.latency_log {
                    if let Err(e) = log.record(elapsed).await {
                        tracing::warn!(error = %e, "Failed to record latency");
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Mock request failed");
                println!("request failed");
            }
        }

        tokio::time::sleep(options.interval).await;
    }

    Ok(succeeded)
}
