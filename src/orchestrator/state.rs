// src/orchestrator/state.rs
//! Per-article processing state machine.
//!
//! ```text
//! Fetched -> Normalized -> Classified -> Mapped -> Aggregated
//!    \___________\______________\___________\____> Failed(stage, reason)
//! ```

use serde::{Deserialize, Serialize};

use crate::classify::{Classification, ClassificationOutcome, DroppedLabel};
use crate::ecosystem::{EcosystemMapping, MappingOutcome};
use crate::ingest::types::Article;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetched,
    Normalized,
    Classified,
    Mapped,
    Aggregated,
}

impl Stage {
    fn next(self) -> Option<Stage> {
        match self {
            Stage::Fetched => Some(Stage::Normalized),
            Stage::Normalized => Some(Stage::Classified),
            Stage::Classified => Some(Stage::Mapped),
            Stage::Mapped => Some(Stage::Aggregated),
            Stage::Aggregated => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    EmptyContent,
    RateLimited { retries: u32 },
    Transient { message: String, retries: u32 },
    MalformedResponse { reason: String, raw: String },
    Rejected { status: u16, message: String },
    Auth { message: String },
    LookupMisconfigured { message: String },
    Timeout,
    Aborted { cause: String },
    Internal { message: String },
}

impl FailureReason {
    /// Short machine label used for metrics and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            FailureReason::EmptyContent => "empty_content",
            FailureReason::RateLimited { .. } => "rate_limited",
            FailureReason::Transient { .. } => "transient",
            FailureReason::MalformedResponse { .. } => "malformed_response",
            FailureReason::Rejected { .. } => "rejected",
            FailureReason::Auth { .. } => "auth",
            FailureReason::LookupMisconfigured { .. } => "lookup_misconfigured",
            FailureReason::Timeout => "timeout",
            FailureReason::Aborted { .. } => "aborted",
            FailureReason::Internal { .. } => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ArticleState {
    Active { stage: Stage },
    /// `stage` is the last stage the article reached before failing.
    Failed { stage: Stage, reason: FailureReason },
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum TransitionError {
    #[error("cannot move from {from:?} to {to:?}")]
    OutOfOrder { from: Stage, to: Stage },
    #[error("article already in a terminal state")]
    Terminal,
}

/// Progress of one article through a run. Owned by the orchestrator and
/// discarded once the run's aggregate is written.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingRecord {
    /// Position in the feed document; aggregation sorts on it.
    pub position: usize,
    pub article: Article,
    pub state: ArticleState,
    pub classifications: Vec<Classification>,
    pub dropped: Vec<DroppedLabel>,
    pub ecosystems: Vec<EcosystemMapping>,
    pub unmapped: bool,
    pub classifier_retries: u32,
}

impl ProcessingRecord {
    pub fn new(position: usize, article: Article) -> Self {
        Self {
            position,
            article,
            state: ArticleState::Active {
                stage: Stage::Fetched,
            },
            classifications: Vec::new(),
            dropped: Vec::new(),
            ecosystems: Vec::new(),
            unmapped: false,
            classifier_retries: 0,
        }
    }

    pub fn stage(&self) -> Stage {
        match &self.state {
            ArticleState::Active { stage } | ArticleState::Failed { stage, .. } => *stage,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ArticleState::Failed { .. }
                | ArticleState::Active {
                    stage: Stage::Aggregated
                }
        )
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.state {
            ArticleState::Failed { reason, .. } => Some(reason),
            ArticleState::Active { .. } => None,
        }
    }

    fn advance(&mut self, to: Stage) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal);
        }
        let from = self.stage();
        if from.next() != Some(to) {
            return Err(TransitionError::OutOfOrder { from, to });
        }
        self.state = ArticleState::Active { stage: to };
        Ok(())
    }

    pub fn mark_normalized(&mut self) -> Result<(), TransitionError> {
        self.advance(Stage::Normalized)
    }

    pub fn mark_classified(&mut self, outcome: ClassificationOutcome) -> Result<(), TransitionError> {
        self.advance(Stage::Classified)?;
        self.classifications = outcome.classifications;
        self.dropped = outcome.dropped;
        self.classifier_retries = outcome.retries;
        Ok(())
    }

    pub fn mark_mapped(&mut self, outcome: MappingOutcome) -> Result<(), TransitionError> {
        self.advance(Stage::Mapped)?;
        self.ecosystems = outcome.ecosystems;
        self.unmapped = outcome.degraded;
        Ok(())
    }

    pub fn mark_aggregated(&mut self) -> Result<(), TransitionError> {
        self.advance(Stage::Aggregated)
    }

    /// Route to `Failed` from any non-terminal stage.
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal);
        }
        self.state = ArticleState::Failed {
            stage: self.stage(),
            reason,
        };
        Ok(())
    }
}
