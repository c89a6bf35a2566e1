// src/config/mod.rs
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::artifact::S3Settings;
use crate::classify::openai::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::ecosystem::DEFAULT_TABLE;
use crate::ingest::normalize::DEFAULT_MAX_CHARS;
use crate::ingest::types::DEFAULT_SEEN_WINDOW;
use crate::registry::{Registration, DEFAULT_INSTANCE_PREFIX};
use crate::retry::RetryPolicy;

pub const ENV_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    pub feed: FeedSection,
    pub classifier: ClassifierSection,
    pub ecosystem: EcosystemSection,
    pub artifacts: ArtifactsSection,
    pub registry: RegistrySection,
    pub http: HttpSection,
    /// Seed sources registered at startup if not already known.
    pub sources: Vec<Registration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub interval_secs: u64,
    /// Wall-clock budget for one run across all sources.
    pub run_timeout_secs: u64,
    pub max_concurrent_sources: usize,
    /// Concurrent classification calls, shared by all sources.
    pub classification_window: usize,
    pub seen_window: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            interval_secs: 900,
            run_timeout_secs: 600,
            max_concurrent_sources: 4,
            classification_window: 3,
            seen_window: DEFAULT_SEEN_WINDOW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSection {
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub max_content_chars: usize,
    pub retry: RetryPolicy,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            user_agent: concat!("sustainability-ingest/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout_secs: 20,
            max_content_chars: DEFAULT_MAX_CHARS,
            retry: RetryPolicy::new(3, 5_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSection {
    pub base_url: String,
    pub model: String,
    /// "ENV" means: read from the variable named by `api_key_env`.
    pub api_key: String,
    pub api_key_env: String,
    pub min_confidence: f64,
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: "ENV".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            min_confidence: 0.0,
            request_timeout_secs: 30,
            retry: RetryPolicy::new(5, 10_000),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcosystemBackend {
    #[default]
    Static,
    Postgrest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcosystemSection {
    pub backend: EcosystemBackend,
    /// JSON rows for the static backend; built-in seed rows when absent.
    pub table_path: Option<PathBuf>,
    pub url: Option<String>,
    pub api_key: String,
    pub api_key_env: String,
    pub table: String,
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for EcosystemSection {
    fn default() -> Self {
        Self {
            backend: EcosystemBackend::Static,
            table_path: None,
            url: None,
            api_key: "ENV".to_string(),
            api_key_env: "POSTGREST_API_KEY".to_string(),
            table: DEFAULT_TABLE.to_string(),
            request_timeout_secs: 10,
            retry: RetryPolicy::new(3, 2_000),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactBackend {
    #[default]
    Local,
    Memory,
    S3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsSection {
    pub backend: ArtifactBackend,
    pub root: PathBuf,
    pub s3: S3Settings,
    pub prefix: String,
    pub retry: RetryPolicy,
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            backend: ArtifactBackend::Local,
            root: PathBuf::from("data/artifacts"),
            s3: S3Settings::default(),
            prefix: String::new(),
            retry: RetryPolicy::new(3, 3_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// JSON file holding registered sources; in-memory only when absent.
    pub path: Option<PathBuf>,
    pub instance_prefix: String,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("state/sources.json")),
            instance_prefix: DEFAULT_INSTANCE_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub bind: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load from an explicit path. Supports TOML or JSON formats.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let cfg: PipelineConfig = if ext == "json" {
            serde_json::from_str(&content).context("parsing pipeline config json")?
        } else {
            toml::from_str(&content).context("parsing pipeline config toml")?
        };
        cfg.finish()
    }

    /// Load using env var + fallbacks:
    /// 1) $PIPELINE_CONFIG_PATH
    /// 2) config/pipeline.toml
    /// 3) config/pipeline.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            } else {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
        }
        let toml_p = PathBuf::from("config/pipeline.toml");
        if toml_p.exists() {
            return Self::load_from(&toml_p);
        }
        let json_p = PathBuf::from("config/pipeline.json");
        if json_p.exists() {
            return Self::load_from(&json_p);
        }
        Self::default().finish()
    }

    fn finish(mut self) -> Result<Self> {
        self.classifier.api_key = resolve_secret(&self.classifier.api_key, &self.classifier.api_key_env)?;
        if self.ecosystem.backend == EcosystemBackend::Postgrest {
            self.ecosystem.api_key = resolve_secret(&self.ecosystem.api_key, &self.ecosystem.api_key_env)?;
            if self.ecosystem.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                return Err(anyhow!("ecosystem.url is required for the postgrest backend"));
            }
        }
        self.clamp();
        Ok(self)
    }

    fn clamp(&mut self) {
        let p = &mut self.pipeline;
        p.interval_secs = p.interval_secs.max(1);
        p.run_timeout_secs = p.run_timeout_secs.max(1);
        p.max_concurrent_sources = p.max_concurrent_sources.clamp(1, 64);
        p.classification_window = p.classification_window.clamp(1, 64);
        p.seen_window = p.seen_window.max(1);
        self.feed.max_content_chars = self.feed.max_content_chars.max(1);
        if !(0.0..=1.0).contains(&self.classifier.min_confidence) {
            self.classifier.min_confidence = self.classifier.min_confidence.clamp(0.0, 1.0);
        }
    }
}

/// `"ENV"` (any case) reads `var`; anything else is taken literally.
fn resolve_secret(value: &str, var: &str) -> Result<String> {
    if value.trim().eq_ignore_ascii_case("env") {
        return env::var(var).map_err(|_| anyhow!("Missing {var} env var"));
    }
    Ok(value.to_string())
}
