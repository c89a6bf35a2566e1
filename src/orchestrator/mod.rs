// src/orchestrator/mod.rs
//! Drives poll → normalize → classify → map → aggregate → write for every
//! active source, with per-article isolation, a shared classification
//! admission gate and a run-wide deadline.

pub mod state;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregate::{AggregateBuilder, RunCounts};
use crate::artifact::{ArtifactReceipt, ArtifactWriter};
use crate::classify::{ClassifierClient, ClassifyError};
use crate::ecosystem::{EcosystemMapper, LookupMisconfigured};
use crate::error::{Classified, ErrorClass};
use crate::ingest::types::Source;
use crate::ingest::FeedPoller;
use crate::registry::SourceRegistry;
use crate::retry::RetryError;
use state::{FailureReason, ProcessingRecord};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub interval: Duration,
    pub run_timeout: Duration,
    pub max_concurrent_sources: usize,
    pub classification_window: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(900),
            run_timeout: Duration::from_secs(600),
            max_concurrent_sources: 4,
            classification_window: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalFailureKind {
    Auth,
    LookupMisconfigured,
    ArtifactStore,
}

/// A failure that makes the rest of the run pointless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalFailure {
    pub kind: GlobalFailureKind,
    pub source_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// Every article aggregated and the artifact written.
    Completed,
    /// Artifact written, some articles failed.
    Partial,
    /// Feed poll or artifact write failed.
    Failed,
    /// Cut short by a global failure; no artifact, cursor unchanged.
    Aborted,
}

/// Where a `Failed` source stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStep {
    Poll,
    Artifact,
    Worker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRunReport {
    pub source_id: String,
    pub status: SourceStatus,
    pub counts: RunCounts,
    pub new_articles: usize,
    pub duplicates: usize,
    pub artifact: Option<ArtifactReceipt>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<FailedStep>,
    /// Failed articles by reason kind.
    pub failures: BTreeMap<String, usize>,
    pub cursor_committed: bool,
}

impl SourceRunReport {
    fn failed(source_id: &str, step: FailedStep, error: String) -> Self {
        let mut r = Self::empty(source_id, SourceStatus::Failed, Some(error));
        r.failed_step = Some(step);
        r
    }

    fn empty(source_id: &str, status: SourceStatus, error: Option<String>) -> Self {
        Self {
            source_id: source_id.to_string(),
            status,
            counts: RunCounts::default(),
            new_articles: 0,
            duplicates: 0,
            artifact: None,
            error,
            failed_step: None,
            failures: BTreeMap::new(),
            cursor_committed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub source_id: Option<String>,
    pub condition: String,
}

/// Summary of one run. Always produced, even when nothing succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub run_timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceRunReport>,
    pub global_failure: Option<GlobalFailure>,
    pub alerts: Vec<Alert>,
}

impl RunReport {
    pub fn processed(&self) -> usize {
        self.sources.iter().map(|s| s.counts.processed).sum()
    }

    pub fn failed(&self) -> usize {
        self.sources.iter().map(|s| s.counts.failed).sum()
    }

    pub fn source(&self, id: &str) -> Option<&SourceRunReport> {
        self.sources.iter().find(|s| s.source_id == id)
    }
}

/// Start of the scheduler slot containing `now`.
pub fn run_slot(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = interval.as_secs().max(1) as i64;
    let secs = now.timestamp().div_euclid(step) * step;
    Utc.timestamp_opt(secs, 0).single().unwrap_or(now)
}

#[derive(Clone)]
struct RunCtx {
    run_id: Uuid,
    cancel: CancellationToken,
    deadline: Instant,
    global: Arc<Mutex<Option<GlobalFailure>>>,
}

impl RunCtx {
    /// Record the first global failure and cancel outstanding work.
    fn trip(&self, failure: GlobalFailure) {
        {
            let mut g = self.global.lock().unwrap_or_else(|p| p.into_inner());
            if g.is_none() {
                tracing::error!(
                    target: "pipeline",
                    run_id = %self.run_id,
                    source_id = %failure.source_id,
                    kind = ?failure.kind,
                    message = %failure.message,
                    "global failure; aborting run"
                );
                counter!("pipeline_global_failures_total").increment(1);
                *g = Some(failure);
            }
        }
        self.cancel.cancel();
    }

    fn global(&self) -> Option<GlobalFailure> {
        self.global.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn abort_reason(&self) -> FailureReason {
        let cause = self
            .global()
            .map(|g| format!("{:?}: {}", g.kind, g.message))
            .unwrap_or_else(|| "run cancelled".to_string());
        FailureReason::Aborted { cause }
    }
}

struct Inner {
    registry: Arc<SourceRegistry>,
    poller: FeedPoller,
    classifier: ClassifierClient,
    mapper: EcosystemMapper,
    writer: ArtifactWriter,
    settings: PipelineSettings,
    classify_gate: Semaphore,
    run_lock: tokio::sync::Mutex<()>,
    last_report: RwLock<Option<RunReport>>,
}

/// Cheap to clone; all clones share the same gate and registry.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(
        registry: Arc<SourceRegistry>,
        poller: FeedPoller,
        classifier: ClassifierClient,
        mapper: EcosystemMapper,
        writer: ArtifactWriter,
        settings: PipelineSettings,
    ) -> Self {
        crate::metrics::ensure_metrics_described();
        let window = settings.classification_window.max(1);
        Self {
            inner: Arc::new(Inner {
                registry,
                poller,
                classifier,
                mapper,
                writer,
                classify_gate: Semaphore::new(window),
                settings,
                run_lock: tokio::sync::Mutex::new(()),
                last_report: RwLock::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.inner.registry
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    pub fn writer(&self) -> &ArtifactWriter {
        &self.inner.writer
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.inner
            .last_report
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Run the slot containing the current time.
    pub async fn run_once(&self) -> RunReport {
        let slot = run_slot(Utc::now(), self.inner.settings.interval);
        self.run_once_at(slot).await
    }

    /// One pass over all active sources. `run_timestamp` names the artifacts,
    /// so calling this twice with the same value overwrites rather than
    /// duplicates them. Runs never overlap.
    pub async fn run_once_at(&self, run_timestamp: DateTime<Utc>) -> RunReport {
        let _running = self.inner.run_lock.lock().await;
        counter!("pipeline_runs_total").increment(1);
        self.inner.mapper.clear_cache();

        let started_at = Utc::now();
        let ctx = RunCtx {
            run_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            deadline: Instant::now() + self.inner.settings.run_timeout,
            global: Arc::new(Mutex::new(None)),
        };
        let sources = self.inner.registry.active_sources();
        tracing::info!(
            target: "pipeline",
            run_id = %ctx.run_id,
            run_ts = %run_timestamp,
            sources = sources.len(),
            "run started"
        );

        let source_gate = Arc::new(Semaphore::new(self.inner.settings.max_concurrent_sources.max(1)));
        let mut handles = Vec::with_capacity(sources.len());
        for src in sources {
            let this = self.clone();
            let ctx = ctx.clone();
            let gate = source_gate.clone();
            let id = src.id.clone();
            let handle = tokio::spawn(async move {
                let Ok(_permit) = gate.acquire_owned().await else {
                    return SourceRunReport::failed(&src.id, FailedStep::Worker, "source gate closed".into());
                };
                this.run_source(src, run_timestamp, ctx).await
            });
            handles.push((id, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            match handle.await {
                Ok(r) => reports.push(r),
                Err(e) => {
                    tracing::error!(target: "pipeline", source_id = %id, error = %e, "source worker crashed");
                    reports.push(SourceRunReport::failed(&id, FailedStep::Worker, e.to_string()));
                }
            }
        }

        let global_failure = ctx.global();
        let alerts = derive_alerts(&reports, global_failure.as_ref());
        let report = RunReport {
            run_id: ctx.run_id,
            run_timestamp,
            started_at,
            finished_at: Utc::now(),
            sources: reports,
            global_failure,
            alerts,
        };

        for a in &report.alerts {
            match a.severity {
                Severity::Critical => tracing::error!(target: "pipeline", source_id = ?a.source_id, condition = %a.condition, "alert"),
                Severity::Warning => tracing::warn!(target: "pipeline", source_id = ?a.source_id, condition = %a.condition, "alert"),
            }
        }
        tracing::info!(
            target: "pipeline",
            run_id = %report.run_id,
            processed = report.processed(),
            failed = report.failed(),
            global_failure = report.global_failure.is_some(),
            "run finished"
        );
        gauge!("pipeline_last_run_ts").set(report.finished_at.timestamp() as f64);

        *self
            .inner
            .last_report
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(report.clone());
        report
    }

    async fn run_source(&self, mut src: Source, run_timestamp: DateTime<Utc>, ctx: RunCtx) -> SourceRunReport {
        if ctx.cancel.is_cancelled() {
            return SourceRunReport::empty(&src.id, SourceStatus::Aborted, Some(abort_text(&ctx)));
        }

        let baseline = src.cursor.baseline_for(run_timestamp);
        if baseline != src.cursor {
            tracing::info!(target: "pipeline", source_id = %src.id, run_ts = %run_timestamp, "slot already committed; re-running it from its starting cursor");
            src.cursor = baseline;
        }

        let polled = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return SourceRunReport::empty(&src.id, SourceStatus::Aborted, Some(abort_text(&ctx)));
            }
            _ = tokio::time::sleep_until(ctx.deadline) => {
                return SourceRunReport::failed(&src.id, FailedStep::Poll, "run timed out while polling".into());
            }
            r = self.inner.poller.poll(&src) => r,
        };
        let poll = match polled {
            Ok(p) => p,
            Err(e) => return SourceRunReport::failed(&src.id, FailedStep::Poll, e.to_string()),
        };

        let records = poll
            .articles
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, a)| ProcessingRecord::new(i, a));
        let finished = join_all(records.map(|r| self.process_article(r, &ctx))).await;

        let mut failures: BTreeMap<String, usize> = BTreeMap::new();
        let mut aborted = false;
        for r in &finished {
            let kind = r.failure().map(|f| f.kind()).unwrap_or("aggregated");
            counter!("pipeline_articles_total", "outcome" => kind).increment(1);
            if let Some(f) = r.failure() {
                *failures.entry(f.kind().to_string()).or_default() += 1;
                aborted |= matches!(
                    f,
                    FailureReason::Aborted { .. } | FailureReason::Auth { .. } | FailureReason::LookupMisconfigured { .. }
                );
            }
        }

        let mut builder = AggregateBuilder::new(&src, ctx.run_id, run_timestamp);
        if aborted {
            builder.mark_aborted();
        }
        for r in finished {
            builder.push(r);
        }
        let agg = builder.finish();

        let mut report = SourceRunReport {
            source_id: src.id.clone(),
            status: SourceStatus::Completed,
            counts: agg.counts,
            new_articles: poll.articles.len(),
            duplicates: poll.duplicates,
            artifact: None,
            error: None,
            failed_step: None,
            failures,
            cursor_committed: false,
        };

        if aborted {
            report.status = SourceStatus::Aborted;
            report.error = Some(abort_text(&ctx));
            tracing::warn!(target: "pipeline", source_id = %src.id, "source aborted; artifact and cursor left untouched");
            return report;
        }

        // not raced against the deadline: a started upload finishes on its own terms
        match self.inner.writer.write(&agg).await {
            Ok(receipt) => {
                report.artifact = Some(receipt);
                let next = poll.cursor.committed_by(run_timestamp, &src.cursor);
                report.cursor_committed = self.inner.registry.advance_cursor(&src.id, next);
                if agg.counts.failed > 0 {
                    report.status = SourceStatus::Partial;
                }
            }
            Err(e) => {
                report.status = SourceStatus::Failed;
                report.failed_step = Some(FailedStep::Artifact);
                report.error = Some(e.to_string());
                if e.inner().class() == ErrorClass::PermanentGlobal {
                    ctx.trip(GlobalFailure {
                        kind: GlobalFailureKind::ArtifactStore,
                        source_id: src.id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            target: "pipeline",
            source_id = %src.id,
            status = ?report.status,
            processed = report.counts.processed,
            failed = report.counts.failed,
            duplicates = report.duplicates,
            "source finished"
        );
        report
    }

    /// Take one article to a terminal state (or `Mapped`, which the
    /// aggregator closes). Never affects sibling articles.
    async fn process_article(&self, mut record: ProcessingRecord, ctx: &RunCtx) -> ProcessingRecord {
        let failure = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Some(ctx.abort_reason()),
            _ = tokio::time::sleep_until(ctx.deadline) => Some(FailureReason::Timeout),
            r = self.drive(&mut record, ctx) => r.err(),
        };
        if let Some(reason) = failure {
            tracing::debug!(
                target: "pipeline",
                source_id = %record.article.source_id,
                guid = ?record.article.guid,
                stage = ?record.stage(),
                reason = reason.kind(),
                "article failed"
            );
            let _ = record.fail(reason);
        }
        record
    }

    async fn drive(&self, record: &mut ProcessingRecord, ctx: &RunCtx) -> Result<(), FailureReason> {
        if record.article.normalized_content.trim().is_empty() {
            return Err(FailureReason::EmptyContent);
        }
        record.mark_normalized().map_err(internal)?;

        let outcome = {
            let _permit = self
                .inner
                .classify_gate
                .acquire()
                .await
                .map_err(|_| FailureReason::Internal {
                    message: "classification gate closed".into(),
                })?;
            if ctx.cancel.is_cancelled() {
                return Err(ctx.abort_reason());
            }
            self.inner
                .classifier
                .classify(&record.article.normalized_content)
                .await
                .map_err(|e| self.classify_failure(e, record, ctx))?
        };
        record.mark_classified(outcome).map_err(internal)?;

        let mapped = self
            .inner
            .mapper
            .map_to_ecosystems(&record.classifications)
            .await
            .map_err(|LookupMisconfigured(message)| {
                ctx.trip(GlobalFailure {
                    kind: GlobalFailureKind::LookupMisconfigured,
                    source_id: record.article.source_id.clone(),
                    message: message.clone(),
                });
                FailureReason::LookupMisconfigured { message }
            })?;
        record.mark_mapped(mapped).map_err(internal)?;
        Ok(())
    }

    fn classify_failure(
        &self,
        e: RetryError<ClassifyError>,
        record: &ProcessingRecord,
        ctx: &RunCtx,
    ) -> FailureReason {
        let retries = e.retries();
        let class = e.inner().class();
        let reason = match e.into_inner() {
            ClassifyError::RateLimited { .. } => FailureReason::RateLimited { retries },
            ClassifyError::Transient(message) => FailureReason::Transient { message, retries },
            ClassifyError::Auth { message } => {
                ctx.trip(GlobalFailure {
                    kind: GlobalFailureKind::Auth,
                    source_id: record.article.source_id.clone(),
                    message: message.clone(),
                });
                FailureReason::Auth { message }
            }
            ClassifyError::Rejected { status, message } => FailureReason::Rejected { status, message },
            ClassifyError::Malformed { reason, raw } => FailureReason::MalformedResponse { reason, raw },
            ClassifyError::EmptyContent => FailureReason::EmptyContent,
        };
        tracing::warn!(
            target: "pipeline",
            source_id = %record.article.source_id,
            guid = ?record.article.guid,
            class = ?class,
            reason = reason.kind(),
            retries,
            "classification failed"
        );
        reason
    }
}

fn internal(e: state::TransitionError) -> FailureReason {
    FailureReason::Internal { message: e.to_string() }
}

fn abort_text(ctx: &RunCtx) -> String {
    match ctx.abort_reason() {
        FailureReason::Aborted { cause } => format!("aborted: {cause}"),
        other => other.kind().to_string(),
    }
}

fn derive_alerts(sources: &[SourceRunReport], global: Option<&GlobalFailure>) -> Vec<Alert> {
    let mut alerts = Vec::new();
    if let Some(g) = global {
        let condition = match g.kind {
            GlobalFailureKind::Auth => "Classification API credentials rejected",
            GlobalFailureKind::LookupMisconfigured => "Ecosystem lookup store misconfigured",
            GlobalFailureKind::ArtifactStore => "Artifact store rejected upload",
        };
        alerts.push(Alert {
            severity: Severity::Critical,
            source_id: Some(g.source_id.clone()),
            condition: condition.to_string(),
        });
    }
    for s in sources {
        let id = Some(s.source_id.clone());
        match s.failed_step {
            Some(FailedStep::Poll) => alerts.push(Alert {
                severity: Severity::Critical,
                source_id: id.clone(),
                condition: "RSS feed unreachable".into(),
            }),
            Some(FailedStep::Artifact) => alerts.push(Alert {
                severity: Severity::Warning,
                source_id: id.clone(),
                condition: "Artifact upload failed".into(),
            }),
            Some(FailedStep::Worker) | None => {}
        }
        let attempted = s.counts.processed + s.counts.failed;
        if attempted > 0 && s.counts.failed * 2 > attempted && s.status != SourceStatus::Aborted {
            alerts.push(Alert {
                severity: Severity::Critical,
                source_id: id.clone(),
                condition: "Classification failure rate > 50%".into(),
            });
        }
        if s.counts.unmapped > 0 {
            alerts.push(Alert {
                severity: Severity::Critical,
                source_id: id,
                condition: "Ecosystem lookup store unavailable".into(),
            });
        }
    }
    alerts
}
