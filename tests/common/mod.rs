// tests/common/mod.rs
//
// Shared builders for integration tests: fixtures, fast retry policies,
// canned chat-completions bodies and an in-memory pipeline wired to a
// wiremock server.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use wiremock::MockServer;

use sustainability_ingest::artifact::{ArtifactStore, ArtifactWriter, ObjectStoreArtifacts, StoreError};
use sustainability_ingest::classify::openai::OpenAiBackend;
use sustainability_ingest::classify::ClassifierClient;
use sustainability_ingest::ecosystem::{EcosystemError, EcosystemMapper, EcosystemMapping, EcosystemStore, StaticEcosystemTable};
use sustainability_ingest::ingest::fetch::HttpFeedFetcher;
use sustainability_ingest::ingest::FeedPoller;
use sustainability_ingest::orchestrator::{Pipeline, PipelineSettings};
use sustainability_ingest::registry::{Registration, SourceRegistry, DEFAULT_INSTANCE_PREFIX};
use sustainability_ingest::retry::RetryPolicy;
use sustainability_ingest::taxonomy::Category;

pub fn fixture(name: &str) -> String {
    let path = format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("fixture {path}: {e}"))
}

/// Millisecond-scale retries so failure paths stay fast.
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        multiplier: 2.0,
        max_elapsed_ms: None,
    }
}

/// A chat-completions response whose message content is the given
/// classifications payload.
pub fn chat_body(classifications: serde_json::Value) -> serde_json::Value {
    let content = json!({ "classifications": classifications }).to_string();
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]
    })
}

pub fn openai_error(kind: &str, code: &str, message: &str) -> serde_json::Value {
    json!({ "error": { "message": message, "type": kind, "code": code } })
}

/// Lookup store that is always unreachable.
pub struct DownStore;

#[async_trait]
impl EcosystemStore for DownStore {
    async fn lookup(&self, _category: Category) -> Result<Option<EcosystemMapping>, EcosystemError> {
        Err(EcosystemError::Unavailable("connection refused".into()))
    }

    fn name(&self) -> &'static str {
        "down"
    }
}

/// Artifact store that rejects every upload with the same error.
pub struct RefusingStore(pub StoreError);

#[async_trait]
impl ArtifactStore for RefusingStore {
    async fn put(&self, _key: &str, _body: Bytes) -> Result<String, StoreError> {
        Err(self.0.clone())
    }

    async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(None)
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub registry: Arc<SourceRegistry>,
    pub artifacts: Arc<ObjectStoreArtifacts>,
}

pub struct HarnessOpts {
    pub settings: PipelineSettings,
    pub classifier_retry: RetryPolicy,
    pub min_confidence: f64,
    pub ecosystem: Arc<dyn EcosystemStore>,
    /// Replaces the in-memory store the writer uploads to.
    pub artifact_store: Option<Arc<dyn ArtifactStore>>,
}

impl Default for HarnessOpts {
    fn default() -> Self {
        Self {
            settings: PipelineSettings {
                interval: Duration::from_secs(900),
                run_timeout: Duration::from_secs(30),
                max_concurrent_sources: 4,
                classification_window: 3,
            },
            classifier_retry: fast_retry(3),
            min_confidence: 0.0,
            ecosystem: Arc::new(StaticEcosystemTable::seed()),
            artifact_store: None,
        }
    }
}

/// Pipeline whose feeds and classification API are both served by `server`.
pub fn harness(server: &MockServer, opts: HarnessOpts) -> Harness {
    let registry = Arc::new(SourceRegistry::new(DEFAULT_INSTANCE_PREFIX, 500));
    let fetcher = HttpFeedFetcher::new("ingest-tests", Duration::from_secs(5)).unwrap();
    let poller = FeedPoller::new(Arc::new(fetcher), fast_retry(2), 4000);
    let backend = OpenAiBackend::new(&server.uri(), "sk-test", "gpt-4o-mini", Duration::from_secs(5)).unwrap();
    let classifier = ClassifierClient::new(Arc::new(backend), opts.classifier_retry, opts.min_confidence);
    let mapper = EcosystemMapper::new(opts.ecosystem, fast_retry(1));
    let artifacts = Arc::new(ObjectStoreArtifacts::memory());
    let target: Arc<dyn ArtifactStore> = match opts.artifact_store {
        Some(store) => store,
        None => artifacts.clone(),
    };
    let writer = ArtifactWriter::new(target, fast_retry(2), "");
    let pipeline = Pipeline::new(registry.clone(), poller, classifier, mapper, writer, opts.settings);
    Harness {
        pipeline,
        registry,
        artifacts,
    }
}

pub fn register(h: &Harness, server: &MockServer, name: &str, feed_path: &str) -> String {
    h.registry
        .register_source(Registration {
            source_name: name.into(),
            feed_url: format!("{}{}", server.uri(), feed_path),
        })
        .unwrap()
        .id
}
