use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::ingest::types::Source;
use crate::orchestrator::{Pipeline, RunReport};
use crate::registry::{Registration, RegistrationError, SourceRegistry};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SourceRegistry>,
    pub pipeline: Pipeline,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            registry: pipeline.registry().clone(),
            pipeline,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/sources", get(list_sources).post(register_source))
        .route("/sources/{id}", get(get_source))
        .route("/sources/{id}/deactivate", post(deactivate_source))
        .route("/runs", post(trigger_run))
        .route("/runs/last", get(last_run))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct SourceOut {
    id: String,
    display_name: String,
    instance_name: String,
    feed_url: String,
    active: bool,
    created_at: chrono::DateTime<chrono::Utc>,
    last_published: Option<chrono::DateTime<chrono::Utc>>,
    seen: usize,
}

impl From<Source> for SourceOut {
    fn from(s: Source) -> Self {
        Self {
            id: s.id,
            display_name: s.display_name,
            instance_name: s.instance_name,
            feed_url: s.feed_url.to_string(),
            active: s.active,
            created_at: s.created_at,
            last_published: s.cursor.last_published,
            seen: s.cursor.seen.len(),
        }
    }
}

#[derive(Serialize)]
struct ProblemsOut {
    problems: Vec<String>,
}

async fn list_sources(State(state): State<AppState>) -> Json<Vec<SourceOut>> {
    Json(state.registry.list().into_iter().map(SourceOut::from).collect())
}

async fn get_source(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id) {
        Some(s) => Json(SourceOut::from(s)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn register_source(State(state): State<AppState>, Json(body): Json<Registration>) -> Response {
    match state.registry.register_source(body) {
        Ok(src) => (StatusCode::CREATED, Json(SourceOut::from(src))).into_response(),
        Err(e @ RegistrationError::Invalid { .. }) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ProblemsOut { problems: e.problems() }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(target: "api", error = %e, "registration could not be persisted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ProblemsOut { problems: e.problems() }),
            )
                .into_response()
        }
    }
}

async fn deactivate_source(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.deactivate(&id) {
        Some(s) => Json(SourceOut::from(s)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Runs synchronously; the response is the run's report.
async fn trigger_run(State(state): State<AppState>) -> Json<RunReport> {
    Json(state.pipeline.run_once().await)
}

async fn last_run(State(state): State<AppState>) -> Response {
    match state.pipeline.last_report() {
        Some(r) => Json(r).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
