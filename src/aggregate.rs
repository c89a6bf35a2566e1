// src/aggregate.rs
//! Folds terminal processing records into one immutable per-source aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::{Classification, DroppedLabel};
use crate::ecosystem::EcosystemMapping;
use crate::ingest::types::Source;
use crate::orchestrator::state::{ArticleState, FailureReason, ProcessingRecord, Stage};
use crate::taxonomy::TAXONOMY_VERSION;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOutcome {
    Aggregated,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryFailure {
    pub stage: Stage,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub position: usize,
    pub guid: Option<String>,
    pub title: String,
    pub link: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub content_chars: usize,
    pub outcome: EntryOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<EntryFailure>,
    pub classifications: Vec<Classification>,
    pub ecosystems: Vec<EcosystemMapping>,
    #[serde(default)]
    pub unmapped: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped_labels: Vec<DroppedLabel>,
    #[serde(default)]
    pub classifier_retries: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Articles that reached `Aggregated`.
    pub processed: usize,
    pub failed: usize,
    /// Aggregated with zero valid classifications.
    pub unclassified: usize,
    /// Aggregated while the lookup store was unreachable.
    pub unmapped: usize,
    pub classifications: usize,
    pub ecosystem_matches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAggregate {
    pub schema_version: u32,
    pub source_id: String,
    pub source_name: String,
    pub run_id: Uuid,
    pub run_timestamp: DateTime<Utc>,
    pub taxonomy_version: String,
    /// Set when a global failure cut the run short.
    pub aborted: bool,
    pub entries: Vec<AggregateEntry>,
    pub counts: RunCounts,
}

/// Append-only assembly of a `RunAggregate`. Records may arrive in any order;
/// `finish` restores feed order.
pub struct AggregateBuilder {
    source_id: String,
    source_name: String,
    run_id: Uuid,
    run_timestamp: DateTime<Utc>,
    aborted: bool,
    entries: Vec<AggregateEntry>,
}

impl AggregateBuilder {
    pub fn new(source: &Source, run_id: Uuid, run_timestamp: DateTime<Utc>) -> Self {
        Self {
            source_id: source.id.clone(),
            source_name: source.display_name.clone(),
            run_id,
            run_timestamp,
            aborted: false,
            entries: Vec::new(),
        }
    }

    pub fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    /// Take a record that finished processing. A record at `Mapped` is moved
    /// to `Aggregated`; anything else that is not terminal is recorded as an
    /// internal failure so nothing disappears from the counts.
    pub fn push(&mut self, mut record: ProcessingRecord) {
        if record.stage() == Stage::Mapped && !record.is_terminal() {
            // Mapped -> Aggregated is always a legal transition
            let _ = record.mark_aggregated();
        } else if !record.is_terminal() {
            let stage = record.stage();
            let _ = record.fail(FailureReason::Internal {
                message: format!("record left at {stage:?}"),
            });
        }

        let (outcome, failure) = match &record.state {
            ArticleState::Failed { stage, reason } => (
                EntryOutcome::Failed,
                Some(EntryFailure {
                    stage: *stage,
                    reason: reason.clone(),
                }),
            ),
            ArticleState::Active { .. } => (EntryOutcome::Aggregated, None),
        };
        let a = record.article;
        self.entries.push(AggregateEntry {
            position: record.position,
            guid: a.guid,
            title: a.title,
            link: a.link,
            published_at: a.published_at,
            content_chars: a.normalized_content.chars().count(),
            outcome,
            failure,
            classifications: record.classifications,
            ecosystems: record.ecosystems,
            unmapped: record.unmapped,
            dropped_labels: record.dropped,
            classifier_retries: record.classifier_retries,
        });
    }

    pub fn finish(mut self) -> RunAggregate {
        self.entries.sort_by_key(|e| e.position);
        let mut counts = RunCounts::default();
        for e in &self.entries {
            match e.outcome {
                EntryOutcome::Aggregated => {
                    counts.processed += 1;
                    if e.classifications.is_empty() {
                        counts.unclassified += 1;
                    }
                    if e.unmapped {
                        counts.unmapped += 1;
                    }
                    counts.classifications += e.classifications.len();
                    counts.ecosystem_matches += e.ecosystems.len();
                }
                EntryOutcome::Failed => counts.failed += 1,
            }
        }
        RunAggregate {
            schema_version: SCHEMA_VERSION,
            source_id: self.source_id,
            source_name: self.source_name,
            run_id: self.run_id,
            run_timestamp: self.run_timestamp,
            taxonomy_version: TAXONOMY_VERSION.to_string(),
            aborted: self.aborted,
            entries: self.entries,
            counts,
        }
    }
}

/// One-shot form of `AggregateBuilder`.
pub fn aggregate(
    source: &Source,
    run_id: Uuid,
    run_timestamp: DateTime<Utc>,
    records: impl IntoIterator<Item = ProcessingRecord>,
) -> RunAggregate {
    let mut b = AggregateBuilder::new(source, run_id, run_timestamp);
    for r in records {
        b.push(r);
    }
    b.finish()
}
