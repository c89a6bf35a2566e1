// tests/metrics.rs
//
// Installs the global Prometheus recorder, so this file holds a single test.
mod common;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{chat_body, fixture, harness, register, HarnessOpts};
use sustainability_ingest::metrics::Metrics;

#[tokio::test]
async fn metrics_endpoint_contains_pipeline_series() {
    let metrics = Metrics::init(3).expect("recorder installs once per process");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(fixture("sustainability_rss.xml")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(json!([
            { "category": "Nature", "confidence": 0.8 }
        ]))))
        .mount(&server)
        .await;

    let h = harness(&server, HarnessOpts::default());
    register(&h, &server, "Test Sustainability News", "/feed.xml");
    h.pipeline.run_once().await;

    let resp = metrics
        .router()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    // axum::body::to_bytes requires an explicit limit
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    for needle in [
        "pipeline_runs_total",
        "pipeline_articles_total",
        "feed_items_total",
        "classifier_requests_total",
        "classifier_latency_ms",
        "artifact_writes_total",
        "sources_registered_total",
        "pipeline_last_run_ts",
        "pipeline_classification_window",
    ] {
        assert!(text.contains(needle), "missing series {needle} in:\n{text}");
    }
    assert!(text.contains("outcome=\"aggregated\""));
}
