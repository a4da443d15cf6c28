//! Document store and word counting.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::wordcount::cache::{CacheKey, CountCache, DEFAULT_MAX_ENTRIES};
use crate::wordcount::{CountWordsResponse, WordCount, WordCountError};

/// Default cache lifetime: one day
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(86_400);

/// Serves word counts for the files in one directory.
#[derive(Debug)]
pub struct WordCountService {
    docs_dir: PathBuf,
    cache: CountCache,
}

impl WordCountService {
    pub fn new(docs_dir: impl Into<PathBuf>, cache_ttl: Duration) -> Self {
        Self {
            docs_dir: docs_dir.into(),
            cache: CountCache::new(cache_ttl, DEFAULT_MAX_ENTRIES),
        }
    }

    pub fn cache(&self) -> &CountCache {
        &self.cache
    }

    async fn read_document(&self, doc: &str) -> Result<String, WordCountError> {
        if doc.is_empty() || doc == "." || doc == ".." || doc.contains(['/', '\\']) {
            return Err(WordCountError::InvalidDocument(doc.to_string()));
        }

        let path = self.docs_dir.join(doc);

        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(WordCountError::DocumentNotFound(doc.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl WordCount for WordCountService {
    async fn list_docs(&self) -> Result<Vec<String>, WordCountError> {
        let mut entries = tokio::fs::read_dir(&self.docs_dir).await?;
        let mut docs = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                docs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        docs.sort();
        Ok(docs)
    }

    async fn count_words(&self, doc: &str, keyword: &str) -> Result<CountWordsResponse, WordCountError> {
        let key = CacheKey::new(doc, keyword);

        if let Some(count) = self.cache.get(&key).await {
            tracing::debug!(doc, keyword = key.keyword(), count, "Cache hit");
            return Ok(CountWordsResponse {
                doc: doc.to_string(),
                keyword: key.keyword().to_string(),
                count,
                cached: true,
            });
        }

        let text = self.read_document(doc).await?;
        let count = count_whole_words(&text, key.keyword());
        tracing::debug!(doc, keyword = key.keyword(), count, "Counted");

        let response = CountWordsResponse {
            doc: doc.to_string(),
            keyword: key.keyword().to_string(),
            count,
            cached: false,
        };
        self.cache.insert(key, count).await;

        Ok(response)
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Word boundary between `before` and `after`, `None` meaning the edge of
/// the text.
fn is_boundary(before: Option<char>, after: Option<char>) -> bool {
    before.is_some_and(is_word_char) != after.is_some_and(is_word_char)
}

/// Count non-overlapping, case-insensitive occurrences of `keyword` that
/// sit on word boundaries at both ends. An empty keyword counts zero.
pub fn count_whole_words(text: &str, keyword: &str) -> u64 {
    let keyword = keyword.to_lowercase();
    if keyword.is_empty() {
        return 0;
    }

    let text = text.to_lowercase();
    let first = keyword.chars().next();
    let last = keyword.chars().next_back();

    let mut count = 0;
    let mut pos = 0;

    while let Some(offset) = text[pos..].find(&keyword) {
        let start = pos + offset;
        let end = start + keyword.len();

        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();

        if is_boundary(before, first) && is_boundary(last, after) {
            count += 1;
            pos = end;
        } else {
            // Step past one character and retry from there
            pos = start + text[start..].chars().next().map_or(1, char::len_utf8);
        }
    }

    count
}
