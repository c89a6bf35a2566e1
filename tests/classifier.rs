// tests/classifier.rs
//
// ClassifierClient + OpenAiBackend against a mocked chat-completions API.
mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{chat_body, fast_retry, openai_error};
use sustainability_ingest::classify::openai::OpenAiBackend;
use sustainability_ingest::classify::{ClassifierClient, ClassifyError, DropReason};
use sustainability_ingest::retry::RetryPolicy;
use sustainability_ingest::taxonomy::Category;

const CHAT: &str = "/v1/chat/completions";
const ARTICLE: &str = "Coastal communities replanted mangroves and saw fish stocks recover.";

fn client(server: &MockServer, retry: RetryPolicy, min_confidence: f64) -> ClassifierClient {
    let backend = OpenAiBackend::new(&server.uri(), "sk-test", "gpt-4o-mini", Duration::from_secs(5)).unwrap();
    ClassifierClient::new(Arc::new(backend), retry, min_confidence)
}

#[tokio::test]
async fn sends_taxonomy_and_parses_labels() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_string_contains("Doughnut Economics"))
        .and(body_string_contains("json_object"))
        .and(body_string_contains("replanted mangroves"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(json!([
            { "category": "Conservation", "confidence": 0.71, "explanation": "habitat" },
            { "category": "Blue Economy", "confidence": 0.93, "explanation": "fisheries" }
        ]))))
        .expect(1)
        .mount(&server)
        .await;

    let out = client(&server, fast_retry(0), 0.0).classify(ARTICLE).await.unwrap();
    assert_eq!(out.retries, 0);
    let cats: Vec<_> = out.classifications.iter().map(|c| c.category).collect();
    assert_eq!(cats, vec![Category::BlueEconomy, Category::Conservation]);
    assert_eq!(out.classifications[0].explanation, "fisheries");
}

#[tokio::test]
async fn rate_limit_twice_then_ok_reports_two_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT))
        .respond_with(ResponseTemplate::new(429).set_body_json(openai_error(
            "requests",
            "rate_limit_exceeded",
            "Rate limit reached",
        )))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CHAT))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(json!([
            { "category": "Blue Economy", "confidence": 0.9 }
        ]))))
        .mount(&server)
        .await;

    let out = client(&server, fast_retry(5), 0.0).classify(ARTICLE).await.unwrap();
    assert_eq!(out.retries, 2);
    assert_eq!(out.classifications.len(), 1);
}

#[tokio::test]
async fn retry_after_header_sets_the_minimum_wait() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CHAT))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(json!([]))))
        .mount(&server)
        .await;

    let retry = RetryPolicy {
        max_retries: 2,
        initial_delay_ms: 1,
        max_delay_ms: 2_000,
        multiplier: 2.0,
        max_elapsed_ms: None,
    };
    let t0 = Instant::now();
    let out = client(&server, retry, 0.0).classify(ARTICLE).await.unwrap();
    assert_eq!(out.retries, 1);
    assert!(t0.elapsed() >= Duration::from_millis(950));
    assert!(out.classifications.is_empty());
}

#[tokio::test]
async fn unauthorized_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT))
        .respond_with(ResponseTemplate::new(401).set_body_json(openai_error(
            "invalid_request_error",
            "invalid_api_key",
            "Incorrect API key provided",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server, fast_retry(5), 0.0).classify(ARTICLE).await.unwrap_err();
    assert!(!err.is_exhausted());
    assert_eq!(
        err.into_inner(),
        ClassifyError::Auth {
            message: "Incorrect API key provided".into()
        }
    );
}

#[tokio::test]
async fn server_errors_retry_until_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let err = client(&server, fast_retry(2), 0.0).classify(ARTICLE).await.unwrap_err();
    assert!(err.is_exhausted());
    assert_eq!(err.retries(), 2);
    assert!(matches!(err.inner(), ClassifyError::Transient(_)));
}

#[tokio::test]
async fn malformed_payload_keeps_raw_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "{\"classifications\": [oops" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server, fast_retry(3), 0.0).classify(ARTICLE).await.unwrap_err();
    match err.into_inner() {
        ClassifyError::Malformed { raw, .. } => assert!(raw.contains("oops")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn fenced_json_is_accepted() {
    let server = MockServer::start().await;
    let fenced = "```json\n{\"classifications\":[{\"category\":\"Nature\",\"confidence\":0.8}]}\n```";
    Mock::given(method("POST"))
        .and(path(CHAT))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": fenced } }]
        })))
        .mount(&server)
        .await;

    let out = client(&server, fast_retry(0), 0.0).classify(ARTICLE).await.unwrap();
    assert_eq!(out.classifications[0].category, Category::Nature);
}

#[tokio::test]
async fn validation_drops_unknown_low_and_duplicate_labels() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(json!([
            { "category": "Blue Economy", "confidence": 0.75 },
            { "category": "Ocean Stuff", "confidence": 0.99 },
            { "category": "Conservation", "confidence": 0.4 },
            { "category": "blue economy", "confidence": 0.91, "explanation": "better" },
            { "category": "Nature", "confidence": 1.7 }
        ]))))
        .mount(&server)
        .await;

    let out = client(&server, fast_retry(0), 0.7).classify(ARTICLE).await.unwrap();
    assert_eq!(out.classifications.len(), 1);
    let kept = &out.classifications[0];
    assert_eq!(kept.category, Category::BlueEconomy);
    assert_eq!(kept.confidence, 0.91);
    assert_eq!(kept.explanation, "better");

    let reasons: Vec<_> = out.dropped.iter().map(|d| d.reason).collect();
    assert_eq!(
        reasons,
        vec![
            DropReason::UnknownCategory,
            DropReason::BelowThreshold,
            DropReason::Duplicate,
            DropReason::InvalidConfidence,
        ]
    );
}

#[tokio::test]
async fn empty_content_never_calls_the_api() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = client(&server, fast_retry(3), 0.0).classify("   ").await.unwrap_err();
    assert_eq!(err.into_inner(), ClassifyError::EmptyContent);
}
