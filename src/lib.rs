// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod error;
pub mod retry;
pub mod taxonomy;

pub mod ingest;
pub mod classify;
pub mod ecosystem;
pub mod aggregate;
pub mod artifact;
pub mod orchestrator;

pub mod registry;
pub mod config;
pub mod metrics;
pub mod scheduler;
pub mod bootstrap;
pub mod api;

// ---- Re-exports for stable public API ----
pub use crate::api::create_router;
pub use crate::orchestrator::{Pipeline, PipelineSettings, RunReport, SourceRunReport, SourceStatus};
pub use crate::registry::{Registration, SourceRegistry};
pub use crate::taxonomy::Category;
