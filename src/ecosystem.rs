// src/ecosystem.rs
//! Category → ecosystem reference lookups.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::classify::Classification;
use crate::error::{Classified, ErrorClass};
use crate::retry::{RetryPolicy, Verdict};
use crate::taxonomy::Category;

pub const DEFAULT_TABLE: &str = "Ecosystem Mapping";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcosystemMapping {
    pub index: i64,
    pub ecosystem: String,
    pub category: Category,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum EcosystemError {
    #[error("ecosystem store unavailable: {0}")]
    Unavailable(String),
    #[error("ecosystem store misconfigured: {0}")]
    Misconfigured(String),
}

/// The only failure the mapper surfaces; outages degrade to an unmapped result.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
#[error("ecosystem store misconfigured: {0}")]
pub struct LookupMisconfigured(pub String);

impl Classified for EcosystemError {
    fn class(&self) -> ErrorClass {
        match self {
            EcosystemError::Unavailable(_) => ErrorClass::Transient,
            EcosystemError::Misconfigured(_) => ErrorClass::PermanentGlobal,
        }
    }
}

/// Read-only lookup by category; zero or one row.
#[async_trait]
pub trait EcosystemStore: Send + Sync {
    async fn lookup(&self, category: Category) -> Result<Option<EcosystemMapping>, EcosystemError>;
    fn name(&self) -> &'static str;
}

/// In-process reference table.
#[derive(Debug, Clone)]
pub struct StaticEcosystemTable {
    rows: Vec<EcosystemMapping>,
}

impl StaticEcosystemTable {
    pub fn new(rows: Vec<EcosystemMapping>) -> Self {
        Self { rows }
    }

    /// Reference rows shipped with the workflow.
    pub fn seed() -> Self {
        let rows = [
            (0, "Forest Conservation", Category::Conservation),
            (1, "Marine Protection", Category::BlueEconomy),
            (2, "Urban Sustainability", Category::PlaceBasedCities),
            (3, "Indigenous Stewardship", Category::Indigenous),
            (4, "Renewable Energy", Category::ClimateCarbon),
            (5, "Circular Systems", Category::CircularSpiralEconomy),
            (6, "Social Equity", Category::SocialJusticeDei),
            (7, "Nature-Based Solutions", Category::Biomimicry),
            (8, "Regenerative Practices", Category::RegenerativeThinking),
            (9, "Ecological Restoration", Category::EcologyDeepEcology),
        ]
        .into_iter()
        .map(|(index, ecosystem, category)| EcosystemMapping {
            index,
            ecosystem: ecosystem.to_string(),
            category,
        })
        .collect();
        Self { rows }
    }

    /// Load a JSON array of `{index, ecosystem, category}` rows.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading ecosystem table from {}", path.display()))?;
        let rows: Vec<EcosystemMapping> = serde_json::from_str(&content)
            .with_context(|| format!("parsing ecosystem table {}", path.display()))?;
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[EcosystemMapping] {
        &self.rows
    }
}

#[async_trait]
impl EcosystemStore for StaticEcosystemTable {
    async fn lookup(&self, category: Category) -> Result<Option<EcosystemMapping>, EcosystemError> {
        Ok(self.rows.iter().find(|r| r.category == category).cloned())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Supabase/PostgREST table lookup.
pub struct PostgrestEcosystemStore {
    http: reqwest::Client,
    base_url: url::Url,
    api_key: String,
    table: String,
}

#[derive(Deserialize)]
struct PostgrestRow {
    index: i64,
    ecosystem: String,
    category: String,
}

#[derive(Deserialize, Default)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl PostgrestEcosystemStore {
    pub fn new(
        base_url: url::Url,
        api_key: &str,
        table: &str,
        timeout: Duration,
    ) -> Result<Self, EcosystemError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(4).min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| EcosystemError::Misconfigured(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.to_string(),
            table: table.to_string(),
        })
    }

    fn table_url(&self) -> Result<url::Url, EcosystemError> {
        let mut u = self.base_url.clone();
        u.path_segments_mut()
            .map_err(|_| EcosystemError::Misconfigured(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(["rest", "v1", self.table.as_str()]);
        Ok(u)
    }
}

#[async_trait]
impl EcosystemStore for PostgrestEcosystemStore {
    async fn lookup(&self, category: Category) -> Result<Option<EcosystemMapping>, EcosystemError> {
        let resp = self
            .http
            .get(self.table_url()?)
            .query(&[
                ("category", format!("eq.{}", category.label())),
                ("select", "index,ecosystem,category".to_string()),
                ("limit", "1".to_string()),
            ])
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| EcosystemError::Unavailable(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| EcosystemError::Unavailable(e.to_string()))?;

        if !status.is_success() {
            return Err(map_postgrest_error(status.as_u16(), &body));
        }
        let rows: Vec<PostgrestRow> = serde_json::from_str(&body)
            .map_err(|e| EcosystemError::Unavailable(format!("undecodable lookup response: {e}")))?;
        Ok(rows.into_iter().find_map(|r| {
            Category::parse(&r.category).map(|category| EcosystemMapping {
                index: r.index,
                ecosystem: r.ecosystem,
                category,
            })
        }))
    }

    fn name(&self) -> &'static str {
        "postgrest"
    }
}

/// `42P01` (undefined table) and auth/path failures mean the store is
/// misconfigured; `PGRST301` and 5xx mean it is temporarily unreachable.
fn map_postgrest_error(status: u16, body: &str) -> EcosystemError {
    let err: PostgrestError = serde_json::from_str(body).unwrap_or_default();
    let code = err.code.as_deref().unwrap_or_default();
    let msg = format!(
        "HTTP {status} {code} {}",
        err.message.as_deref().unwrap_or_default()
    )
    .trim()
    .to_string();

    if code == "42P01" || matches!(status, 401 | 403 | 404) {
        return EcosystemError::Misconfigured(msg);
    }
    if code == "PGRST301" || status >= 500 || status == 429 {
        return EcosystemError::Unavailable(msg);
    }
    EcosystemError::Misconfigured(msg)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingOutcome {
    /// Matched ecosystems in classification order, one per index.
    pub ecosystems: Vec<EcosystemMapping>,
    /// The store stayed unreachable; the article is classified but unmapped.
    pub degraded: bool,
}

pub struct EcosystemMapper {
    store: Arc<dyn EcosystemStore>,
    retry: RetryPolicy,
    cache: Mutex<HashMap<Category, Option<EcosystemMapping>>>,
}

impl EcosystemMapper {
    pub fn new(store: Arc<dyn EcosystemStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Forget memoized lookups; called at the start of every run.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn cached(&self, category: Category) -> Option<Option<EcosystemMapping>> {
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&category)
            .cloned()
    }

    /// Resolve each classification's category. Categories without a row are
    /// left out. Only a misconfigured store is an error.
    pub async fn map_to_ecosystems(
        &self,
        classifications: &[Classification],
    ) -> Result<MappingOutcome, LookupMisconfigured> {
        let mut out = MappingOutcome::default();
        for c in classifications {
            let row = match self.cached(c.category) {
                Some(hit) => hit,
                None => match self.lookup_with_retry(c.category).await {
                    Ok(row) => {
                        self.cache
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .insert(c.category, row.clone());
                        row
                    }
                    Err(EcosystemError::Unavailable(reason)) => {
                        counter!("ecosystem_lookup_failures_total").increment(1);
                        tracing::warn!(
                            target: "ecosystem",
                            store = self.store.name(),
                            category = %c.category,
                            reason = %reason,
                            "lookup store unavailable; leaving article unmapped"
                        );
                        return Ok(MappingOutcome {
                            ecosystems: Vec::new(),
                            degraded: true,
                        });
                    }
                    Err(EcosystemError::Misconfigured(reason)) => {
                        counter!("ecosystem_lookup_failures_total").increment(1);
                        return Err(LookupMisconfigured(reason));
                    }
                },
            };
            if let Some(row) = row {
                if !out.ecosystems.iter().any(|e| e.index == row.index) {
                    out.ecosystems.push(row);
                }
            }
        }
        Ok(out)
    }

    async fn lookup_with_retry(
        &self,
        category: Category,
    ) -> Result<Option<EcosystemMapping>, EcosystemError> {
        let store = &self.store;
        self.retry
            .run(
                "ecosystem_lookup",
                move |_| async move { store.lookup(category).await },
                |e: &EcosystemError| {
                    if e.class().is_retryable() {
                        Verdict::Retry
                    } else {
                        Verdict::Fail
                    }
                },
            )
            .await
            .map(|a| a.value)
            .map_err(|e| e.into_inner())
    }
}
