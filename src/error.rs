// src/error.rs
//! Error classes shared by every pipeline stage.
//!
//! Each stage keeps its own `thiserror` enum; this module only defines how an
//! error is treated by retry logic and by the orchestrator.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network timeout, 429, 5xx. Retried with backoff.
    Transient,
    /// Bad payload for a single article or feed. Fails only that unit.
    PermanentLocal,
    /// Bad credentials or misconfigured collaborator. Aborts the run.
    PermanentGlobal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

/// Implemented by every stage error so callers can route it without matching
/// on concrete variants.
pub trait Classified {
    fn class(&self) -> ErrorClass;
}

/// Shorten a payload for logs and failure reasons, on a char boundary.
pub fn truncate_for_log(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push('…');
    out
}
