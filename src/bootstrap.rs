// src/bootstrap.rs
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tracing::info;

use crate::artifact::{ArtifactStore, ArtifactWriter, ObjectStoreArtifacts};
use crate::classify::openai::OpenAiBackend;
use crate::classify::ClassifierClient;
use crate::config::{ArtifactBackend, EcosystemBackend, PipelineConfig};
use crate::ecosystem::{EcosystemMapper, EcosystemStore, PostgrestEcosystemStore, StaticEcosystemTable};
use crate::ingest::fetch::HttpFeedFetcher;
use crate::ingest::FeedPoller;
use crate::orchestrator::{Pipeline, PipelineSettings};
use crate::registry::SourceRegistry;

/// Everything the binary needs, built from one config.
pub struct Runtime {
    pub cfg: PipelineConfig,
    pub pipeline: Pipeline,
}

impl Runtime {
    pub fn from_config(cfg: PipelineConfig) -> anyhow::Result<Self> {
        // Safe diagnostics: backends and key length only
        info!(
            target: "bootstrap",
            classifier_model = %cfg.classifier.model,
            key_len = cfg.classifier.api_key.len(),
            ecosystem = ?cfg.ecosystem.backend,
            artifacts = ?cfg.artifacts.backend,
            "building pipeline runtime"
        );

        let registry = Arc::new(match &cfg.registry.path {
            Some(p) => SourceRegistry::open(p, &cfg.registry.instance_prefix, cfg.pipeline.seen_window)?,
            None => SourceRegistry::new(&cfg.registry.instance_prefix, cfg.pipeline.seen_window),
        });
        let seeded = registry.seed(&cfg.sources);
        info!(target: "bootstrap", seeded, total = registry.list().len(), "sources ready");

        let fetcher = HttpFeedFetcher::new(&cfg.feed.user_agent, secs(cfg.feed.request_timeout_secs))
            .map_err(|e| anyhow!("feed client: {e}"))?;
        let poller = FeedPoller::new(Arc::new(fetcher), cfg.feed.retry.clone(), cfg.feed.max_content_chars);

        let backend = OpenAiBackend::new(
            &cfg.classifier.base_url,
            &cfg.classifier.api_key,
            &cfg.classifier.model,
            secs(cfg.classifier.request_timeout_secs),
        )
        .map_err(|e| anyhow!("classifier client: {e}"))?;
        let classifier = ClassifierClient::new(
            Arc::new(backend),
            cfg.classifier.retry.clone(),
            cfg.classifier.min_confidence,
        );

        let mapper = EcosystemMapper::new(build_ecosystem_store(&cfg)?, cfg.ecosystem.retry.clone());
        let writer = ArtifactWriter::new(
            build_artifact_store(&cfg)?,
            cfg.artifacts.retry.clone(),
            &cfg.artifacts.prefix,
        );

        let settings = PipelineSettings {
            interval: secs(cfg.pipeline.interval_secs),
            run_timeout: secs(cfg.pipeline.run_timeout_secs),
            max_concurrent_sources: cfg.pipeline.max_concurrent_sources,
            classification_window: cfg.pipeline.classification_window,
        };
        let pipeline = Pipeline::new(registry, poller, classifier, mapper, writer, settings);
        Ok(Self { cfg, pipeline })
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn build_ecosystem_store(cfg: &PipelineConfig) -> anyhow::Result<Arc<dyn EcosystemStore>> {
    let e = &cfg.ecosystem;
    Ok(match e.backend {
        EcosystemBackend::Static => match &e.table_path {
            Some(p) => Arc::new(StaticEcosystemTable::load_from(p)?),
            None => Arc::new(StaticEcosystemTable::seed()),
        },
        EcosystemBackend::Postgrest => {
            let raw = e.url.as_deref().unwrap_or_default();
            let url = url::Url::parse(raw).with_context(|| format!("ecosystem.url {raw:?}"))?;
            let store = PostgrestEcosystemStore::new(url, &e.api_key, &e.table, secs(e.request_timeout_secs))
                .map_err(|err| anyhow!("ecosystem store: {err}"))?;
            Arc::new(store)
        }
    })
}

fn build_artifact_store(cfg: &PipelineConfig) -> anyhow::Result<Arc<dyn ArtifactStore>> {
    let a = &cfg.artifacts;
    let store = match a.backend {
        ArtifactBackend::Memory => ObjectStoreArtifacts::memory(),
        ArtifactBackend::Local => ObjectStoreArtifacts::local(&a.root)?,
        ArtifactBackend::S3 => ObjectStoreArtifacts::s3(&a.s3)?,
    };
    Ok(Arc::new(store))
}
