//! External feed access.
//!
//! The executor never parses raw storage formats; it requests named
//! record batches from an injected [`FeedSource`]. [`MemoryFeeds`] backs
//! tests and embedding; [`JsonFileFeeds`] backs the CLI.

use crate::error::FeedError;
use crate::record::Batch;
use std::collections::BTreeMap;
use std::path::Path;

/// Injected data-access service providing named, typed record batches.
pub trait FeedSource: Send + Sync {
    /// Names of the feeds this source serves.
    fn feed_names(&self) -> Vec<String>;

    /// Number of records available. The executor never reads past this.
    fn num_records(&self) -> u64;

    /// Fetch one feed's batch for one record.
    ///
    /// A record index past the feed's own length yields an empty batch;
    /// an unknown feed name is an error.
    fn fetch(&self, feed: &str, record: u64) -> Result<Batch, FeedError>;

    fn has_feed(&self, name: &str) -> bool {
        self.feed_names().iter().any(|n| n == name)
    }
}

/// In-memory feed source.
#[derive(Debug, Clone, Default)]
pub struct MemoryFeeds {
    feeds: BTreeMap<String, Vec<Batch>>,
}

impl MemoryFeeds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a feed with its per-record batches.
    pub fn insert(&mut self, name: impl Into<String>, records: Vec<Batch>) -> &mut Self {
        self.feeds.insert(name.into(), records);
        self
    }
}

impl FeedSource for MemoryFeeds {
    fn feed_names(&self) -> Vec<String> {
        self.feeds.keys().cloned().collect()
    }

    fn num_records(&self) -> u64 {
        self.feeds.values().map(|r| r.len() as u64).max().unwrap_or(0)
    }

    fn fetch(&self, feed: &str, record: u64) -> Result<Batch, FeedError> {
        let records = self
            .feeds
            .get(feed)
            .ok_or_else(|| FeedError::UnknownFeed(feed.to_string()))?;
        Ok(records.get(record as usize).cloned().unwrap_or_default())
    }
}

/// Feed source loaded from a JSON document.
///
/// Expected shape: `{"feeds": {"<name>": [[items of record 0], ...]}}`.
#[derive(Debug, Clone)]
pub struct JsonFileFeeds {
    inner: MemoryFeeds,
}

impl JsonFileFeeds {
    pub fn from_file(path: &Path) -> Result<Self, FeedError> {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| FeedError::Io {
            path: display.clone(),
            source,
        })?;
        Self::from_json(&contents, &display)
    }

    pub fn from_json(contents: &str, path: &str) -> Result<Self, FeedError> {
        let doc: serde_json::Value =
            serde_json::from_str(contents).map_err(|e| FeedError::Malformed {
                path: path.to_string(),
                message: e.to_string(),
            })?;

        let feeds = doc
            .get("feeds")
            .and_then(|f| f.as_object())
            .ok_or_else(|| FeedError::Malformed {
                path: path.to_string(),
                message: "missing top-level \"feeds\" object".to_string(),
            })?;

        let mut inner = MemoryFeeds::new();
        for (name, records) in feeds {
            let records = records.as_array().ok_or_else(|| FeedError::Malformed {
                path: path.to_string(),
                message: format!("feed {name}: expected an array of records"),
            })?;

            let mut batches = Vec::with_capacity(records.len());
            for (idx, batch) in records.iter().enumerate() {
                let items = batch.as_array().ok_or_else(|| FeedError::Malformed {
                    path: path.to_string(),
                    message: format!("feed {name}, record {idx}: expected an item array"),
                })?;
                batches.push(items.clone());
            }
            inner.insert(name.clone(), batches);
        }

        Ok(Self { inner })
    }
}

impl FeedSource for JsonFileFeeds {
    fn feed_names(&self) -> Vec<String> {
        self.inner.feed_names()
    }

    fn num_records(&self) -> u64 {
        self.inner.num_records()
    }

    fn fetch(&self, feed: &str, record: u64) -> Result<Batch, FeedError> {
        self.inner.fetch(feed, record)
    }
}
