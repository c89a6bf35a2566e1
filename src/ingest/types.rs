// src/ingest/types.rs
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of guids a cursor remembers.
pub const DEFAULT_SEEN_WINDOW: usize = 500;

/// A registered feed. Never deleted, only deactivated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub feed_url: url::Url,
    pub display_name: String,
    /// "[Marama] - Grist News Scrapper" style label of the pipeline instance.
    #[serde(default)]
    pub instance_name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub cursor: SourceCursor,
}

fn default_active() -> bool {
    true
}

/// Dedup state carried between runs: highest publish timestamp seen plus a
/// bounded FIFO of recently seen identities (newest last).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCursor {
    pub last_published: Option<DateTime<Utc>>,
    pub seen: VecDeque<String>,
    pub capacity: usize,
    /// Run slot whose artifact was written before this cursor was committed.
    #[serde(default)]
    pub committed_run: Option<DateTime<Utc>>,
    /// The cursor that run started from. Never nests more than one level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Box<SourceCursor>>,
}

impl Default for SourceCursor {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SEEN_WINDOW)
    }
}

impl SourceCursor {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            last_published: None,
            seen: VecDeque::new(),
            capacity: capacity.max(1),
            committed_run: None,
            previous: None,
        }
    }

    /// Cursor a run named `run_timestamp` polls from. Re-running the slot
    /// that produced this cursor starts where that slot started, so it
    /// rebuilds the same artifact instead of an empty one.
    pub fn baseline_for(&self, run_timestamp: DateTime<Utc>) -> SourceCursor {
        match (self.committed_run, &self.previous) {
            (Some(ts), Some(prev)) if ts == run_timestamp => prev.as_ref().clone(),
            _ => self.clone(),
        }
    }

    /// Stamp this cursor as the result of `run_timestamp` polled from `baseline`.
    pub fn committed_by(mut self, run_timestamp: DateTime<Utc>, baseline: &SourceCursor) -> SourceCursor {
        let mut start = baseline.clone();
        start.previous = None;
        self.committed_run = Some(run_timestamp);
        self.previous = Some(Box::new(start));
        self
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.seen.iter().any(|s| s == id)
    }

    /// Remember `id`, evicting the oldest entries past capacity.
    pub fn remember(&mut self, id: &str) {
        if self.has_seen(id) {
            return;
        }
        self.seen.push_back(id.to_string());
        while self.seen.len() > self.capacity {
            self.seen.pop_front();
        }
    }

    pub fn observe_published(&mut self, ts: DateTime<Utc>) {
        match self.last_published {
            Some(cur) if cur >= ts => {}
            _ => self.last_published = Some(ts),
        }
    }
}

/// One feed entry after parsing, before dedup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    pub guid: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// `content:encoded` or Atom `content`.
    pub content: Option<String>,
    /// `description` or Atom `summary`.
    pub summary: Option<String>,
}

impl FeedItem {
    /// Richest body available: full content, then summary, then title.
    pub fn raw_body(&self) -> String {
        [&self.content, &self.summary, &self.title]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_default()
    }
}

/// Immutable once fetched; identity is `(source_id, guid)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub source_id: String,
    pub guid: Option<String>,
    pub title: String,
    pub link: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub raw_content: String,
    pub normalized_content: String,
}

impl Article {
    /// Stable identity used for dedup: guid, else link, else title.
    pub fn identity(&self) -> String {
        self.guid
            .clone()
            .or_else(|| self.link.clone())
            .unwrap_or_else(|| self.title.clone())
    }
}
