// src/ingest/mod.rs
pub mod feed;
pub mod fetch;
pub mod normalize;
pub mod types;

use std::collections::HashSet;
use std::sync::Arc;

use metrics::{counter, histogram};

use crate::error::{Classified, ErrorClass};
use crate::ingest::feed::{parse_feed, FeedDocument, ParseError};
use crate::ingest::fetch::{FeedFetcher, FetchError};
use crate::ingest::types::{Article, FeedItem, Source, SourceCursor};
use crate::retry::{RetryError, RetryPolicy, Verdict};

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum PollError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl Classified for PollError {
    fn class(&self) -> ErrorClass {
        match self {
            PollError::Fetch(e) => e.class(),
            PollError::Parse(e) => e.class(),
        }
    }
}

/// New articles since the last committed cursor, plus the cursor that should
/// be committed once this poll's results are durably stored.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub articles: Vec<Article>,
    pub cursor: SourceCursor,
    pub feed_title: Option<String>,
    pub total_items: usize,
    pub duplicates: usize,
    pub retries: u32,
}

pub struct FeedPoller {
    fetcher: Arc<dyn FeedFetcher>,
    retry: RetryPolicy,
    max_chars: usize,
}

impl FeedPoller {
    pub fn new(fetcher: Arc<dyn FeedFetcher>, retry: RetryPolicy, max_chars: usize) -> Self {
        Self {
            fetcher,
            retry,
            max_chars,
        }
    }

    /// Fetch and parse `source`'s feed, retrying both fetch and parse
    /// failures, then keep only items not covered by the source's cursor.
    /// The source's cursor is not modified here.
    pub async fn poll(&self, source: &Source) -> Result<PollOutcome, RetryError<PollError>> {
        let fetcher = &self.fetcher;
        let url = &source.feed_url;
        let attempted = self
            .retry
            .run(
                "feed_poll",
                move |_| async move {
                    let body = fetcher.fetch(url).await?;
                    let t0 = std::time::Instant::now();
                    let doc = parse_feed(&body)?;
                    histogram!("feed_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
                    Ok::<FeedDocument, PollError>(doc)
                },
                |_| Verdict::Retry,
            )
            .await
            .inspect_err(|e| {
                counter!("feed_poll_errors_total").increment(1);
                tracing::warn!(
                    target: "ingest",
                    source_id = %source.id,
                    retries = e.retries(),
                    error = %e,
                    "feed poll failed"
                );
            })?;

        let doc = attempted.value;
        let total_items = doc.items.len();
        let (articles, cursor, duplicates) =
            select_new(&source.id, &source.cursor, doc.items, self.max_chars);

        counter!("feed_items_total").increment(total_items as u64);
        counter!("feed_dedup_total").increment(duplicates as u64);
        tracing::info!(
            target: "ingest",
            source_id = %source.id,
            total = total_items,
            new = articles.len(),
            duplicates,
            retries = attempted.retries,
            "feed polled"
        );

        Ok(PollOutcome {
            articles,
            cursor,
            feed_title: doc.title,
            total_items,
            duplicates,
            retries: attempted.retries,
        })
    }
}

/// Apply the dedup rules to parsed items, in feed order:
/// - with a guid: new iff the guid is outside the seen window;
/// - without a guid but with a timestamp: new iff strictly newer than the
///   previous cursor;
/// - with neither: new iff the link (or title) is outside the seen window.
///
/// A guid repeated within one document keeps its first occurrence.
/// Returns (new articles, proposed cursor, dropped count).
pub fn select_new(
    source_id: &str,
    prev: &SourceCursor,
    items: Vec<FeedItem>,
    max_chars: usize,
) -> (Vec<Article>, SourceCursor, usize) {
    let mut next = prev.clone();
    let mut batch: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    let mut dropped = 0usize;

    for it in items {
        let key = it
            .guid
            .clone()
            .or_else(|| it.link.clone())
            .or_else(|| it.title.clone())
            .unwrap_or_default();

        let is_new = match (&it.guid, it.published_at) {
            (Some(g), _) => !prev.has_seen(g),
            (None, Some(ts)) => match prev.last_published {
                Some(cur) => ts > cur,
                None => true,
            },
            (None, None) => !key.is_empty() && !prev.has_seen(&key),
        };
        if !is_new || !batch.insert(key.clone()) {
            dropped += 1;
            continue;
        }

        next.remember(&key);
        if let Some(ts) = it.published_at {
            next.observe_published(ts);
        }
        let raw = it.raw_body();
        out.push(Article {
            source_id: source_id.to_string(),
            guid: it.guid,
            title: it.title.unwrap_or_default(),
            link: it.link,
            published_at: it.published_at,
            normalized_content: normalize::normalize_with_limit(&raw, max_chars),
            raw_content: raw,
        });
    }

    (out, next, dropped)
}
