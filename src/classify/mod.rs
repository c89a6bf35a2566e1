// src/classify/mod.rs
//! Classification client: calls a backend with retry, then validates the
//! returned labels against the taxonomy.

pub mod openai;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::error::{truncate_for_log, Classified, ErrorClass};
use crate::retry::{RetryError, RetryPolicy, Verdict};
use crate::taxonomy::Category;

/// A validated label attached to an article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    pub confidence: f64,
    #[serde(default)]
    pub explanation: String,
}

/// One entry as returned by the backend, before validation. Fields are kept
/// as raw JSON so that a wrong type drops the entry rather than the response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawClassification {
    #[serde(default)]
    pub category: serde_json::Value,
    #[serde(default)]
    pub confidence: serde_json::Value,
    #[serde(default)]
    pub explanation: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    UnknownCategory,
    InvalidConfidence,
    BelowThreshold,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedLabel {
    pub category: String,
    pub reason: DropReason,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ClassifyError {
    #[error("classification API rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },
    #[error("classification API rejected credentials: {message}")]
    Auth { message: String },
    #[error("classification API unavailable: {0}")]
    Transient(String),
    #[error("classification request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed classification response: {reason}")]
    Malformed { reason: String, raw: String },
    #[error("article has no content to classify")]
    EmptyContent,
}

impl Classified for ClassifyError {
    fn class(&self) -> ErrorClass {
        match self {
            ClassifyError::RateLimited { .. } | ClassifyError::Transient(_) => ErrorClass::Transient,
            ClassifyError::Auth { .. } => ErrorClass::PermanentGlobal,
            ClassifyError::Rejected { .. }
            | ClassifyError::Malformed { .. }
            | ClassifyError::EmptyContent => ErrorClass::PermanentLocal,
        }
    }
}

/// Remote model that turns content into raw label entries.
#[async_trait]
pub trait ClassificationBackend: Send + Sync {
    async fn classify_raw(
        &self,
        content: &str,
        labels: &[&'static str],
    ) -> Result<Vec<RawClassification>, ClassifyError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationOutcome {
    /// Valid entries, confidence descending. Empty means "unclassified".
    pub classifications: Vec<Classification>,
    pub dropped: Vec<DroppedLabel>,
    pub retries: u32,
}

pub struct ClassifierClient {
    backend: Arc<dyn ClassificationBackend>,
    retry: RetryPolicy,
    min_confidence: f64,
}

impl ClassifierClient {
    pub fn new(backend: Arc<dyn ClassificationBackend>, retry: RetryPolicy, min_confidence: f64) -> Self {
        Self {
            backend,
            retry,
            min_confidence: min_confidence.clamp(0.0, 1.0),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn classify(
        &self,
        content: &str,
    ) -> Result<ClassificationOutcome, RetryError<ClassifyError>> {
        if content.trim().is_empty() {
            return Err(RetryError::Fatal {
                error: ClassifyError::EmptyContent,
                retries: 0,
            });
        }

        let labels = crate::taxonomy::labels();
        let backend = &self.backend;
        let labels_ref = &labels;
        let result = self
            .retry
            .run(
                "classify",
                move |_| async move {
                    counter!("classifier_requests_total").increment(1);
                    let t0 = std::time::Instant::now();
                    let res = backend.classify_raw(content, labels_ref).await;
                    metrics::histogram!("classifier_latency_ms")
                        .record(t0.elapsed().as_secs_f64() * 1_000.0);
                    res
                },
                retry_verdict,
            )
            .await;

        let attempted = match result {
            Ok(a) => a,
            Err(e) => {
                counter!("classifier_retries_total").increment(u64::from(e.retries()));
                if let ClassifyError::Malformed { raw, reason } = e.inner() {
                    tracing::warn!(
                        target: "classify",
                        reason = %reason,
                        raw = %truncate_for_log(raw, 500),
                        "malformed classifier response"
                    );
                }
                return Err(e);
            }
        };
        counter!("classifier_retries_total").increment(u64::from(attempted.retries));

        let (classifications, dropped) = validate(attempted.value, self.min_confidence);
        if !dropped.is_empty() {
            counter!("classifier_dropped_labels_total").increment(dropped.len() as u64);
            for d in dropped.iter().filter(|d| d.reason == DropReason::UnknownCategory) {
                let hint = Category::closest(&d.category).map(|(c, _)| c.label());
                tracing::warn!(
                    target: "classify",
                    label = %d.category,
                    closest = ?hint,
                    "dropped label outside taxonomy"
                );
            }
        }

        Ok(ClassificationOutcome {
            classifications,
            dropped,
            retries: attempted.retries,
        })
    }
}

fn retry_verdict(e: &ClassifyError) -> Verdict {
    match e {
        ClassifyError::RateLimited {
            retry_after: Some(d),
        } => Verdict::RetryAfter(*d),
        ClassifyError::RateLimited { retry_after: None } | ClassifyError::Transient(_) => {
            Verdict::Retry
        }
        _ => Verdict::Fail,
    }
}

/// Keep entries whose label is in the taxonomy and whose confidence is a
/// finite number in `[min_confidence, 1]`. A category returned more than once
/// keeps its highest confidence. Result is sorted by confidence, descending,
/// ties in response order.
pub fn validate(
    raw: Vec<RawClassification>,
    min_confidence: f64,
) -> (Vec<Classification>, Vec<DroppedLabel>) {
    let mut dropped = Vec::new();
    let mut kept: Vec<Classification> = Vec::with_capacity(raw.len());
    let mut index: HashMap<Category, usize> = HashMap::new();

    for entry in raw {
        let label = match &entry.category {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        let dropped_as = |reason| DroppedLabel {
            category: label.clone(),
            reason,
        };

        let Some(category) = Category::parse(&label) else {
            dropped.push(dropped_as(DropReason::UnknownCategory));
            continue;
        };
        let confidence = match entry.confidence.as_f64() {
            Some(c) if c.is_finite() && (0.0..=1.0).contains(&c) => c,
            _ => {
                dropped.push(dropped_as(DropReason::InvalidConfidence));
                continue;
            }
        };
        if confidence < min_confidence {
            dropped.push(dropped_as(DropReason::BelowThreshold));
            continue;
        }
        let explanation = entry
            .explanation
            .as_str()
            .map(str::to_string)
            .unwrap_or_default();

        match index.get(&category) {
            Some(&i) => {
                if confidence > kept[i].confidence {
                    kept[i].confidence = confidence;
                    kept[i].explanation = explanation;
                }
                dropped.push(dropped_as(DropReason::Duplicate));
            }
            None => {
                index.insert(category, kept.len());
                kept.push(Classification {
                    category,
                    confidence,
                    explanation,
                });
            }
        }
    }

    // stable sort keeps response order among equal confidences
    kept.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(v: serde_json::Value) -> Vec<RawClassification> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn unknown_labels_are_dropped_not_fatal() {
        let (kept, dropped) = validate(
            raw(json!([
                {"category": "Climate & Carbon", "confidence": 0.9, "explanation": "emissions"},
                {"category": "Quantum Finance", "confidence": 0.95, "explanation": "?"}
            ])),
            0.0,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].category, Category::ClimateCarbon);
        assert_eq!(dropped[0].reason, DropReason::UnknownCategory);
        assert_eq!(dropped[0].category, "Quantum Finance");
    }

    #[test]
    fn confidence_must_be_numeric_and_bounded() {
        let (kept, dropped) = validate(
            raw(json!([
                {"category": "Nature", "confidence": "high"},
                {"category": "Biodiversity", "confidence": 1.2},
                {"category": "Conservation", "confidence": -0.1},
                {"category": "Ecocide"},
                {"category": "Indigenous", "confidence": 1.0}
            ])),
            0.0,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].category, Category::Indigenous);
        assert!(dropped
            .iter()
            .all(|d| d.reason == DropReason::InvalidConfidence));
        assert_eq!(dropped.len(), 4);
    }

    #[test]
    fn duplicates_keep_highest_and_sort_descending() {
        let (kept, dropped) = validate(
            raw(json!([
                {"category": "Blue Economy", "confidence": 0.4, "explanation": "low"},
                {"category": "Nature", "confidence": 0.7},
                {"category": "Blue Economy", "confidence": 0.8, "explanation": "high"}
            ])),
            0.0,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].category, Category::BlueEconomy);
        assert_eq!(kept[0].confidence, 0.8);
        assert_eq!(kept[0].explanation, "high");
        assert_eq!(kept[1].category, Category::Nature);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].reason, DropReason::Duplicate);
    }

    #[test]
    fn threshold_filters_low_confidence() {
        let (kept, dropped) = validate(
            raw(json!([
                {"category": "Climate & Carbon", "confidence": 0.95},
                {"category": "Indigenous", "confidence": 0.65}
            ])),
            0.7,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(dropped[0].reason, DropReason::BelowThreshold);
    }

    #[test]
    fn error_classes() {
        assert_eq!(
            ClassifyError::RateLimited { retry_after: None }.class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ClassifyError::Auth {
                message: "bad key".into()
            }
            .class(),
            ErrorClass::PermanentGlobal
        );
        assert_eq!(
            ClassifyError::Malformed {
                reason: "x".into(),
                raw: "{".into()
            }
            .class(),
            ErrorClass::PermanentLocal
        );
    }
}
