// src/artifact.rs
//! Durable, idempotent persistence of run aggregates.
//!
//! The object key is a pure function of `(source_id, run_timestamp)`, so
//! re-running the same logical run overwrites its artifact.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use metrics::counter;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::aggregate::RunAggregate;
use crate::error::{Classified, ErrorClass};
use crate::retry::{RetryError, RetryPolicy, Verdict};

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("access denied writing {key}: {message}")]
    AccessDenied { key: String, message: String },
    #[error("bucket does not exist: {message}")]
    NoSuchBucket { message: String },
    #[error("transient storage error: {message}")]
    Transient { message: String },
    #[error("artifact store misconfigured: {0}")]
    Config(String),
    #[error("could not serialize aggregate: {0}")]
    Serialize(String),
}

impl StoreError {
    /// Only transient failures may be retried.
    pub fn retryable(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

impl Classified for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::Transient { .. } => ErrorClass::Transient,
            StoreError::Serialize(_) => ErrorClass::PermanentLocal,
            StoreError::AccessDenied { .. } | StoreError::NoSuchBucket { .. } | StoreError::Config(_) => {
                ErrorClass::PermanentGlobal
            }
        }
    }
}

/// Object storage as the pipeline sees it: PUT by key, returning a location.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &str, body: Bytes) -> Result<String, StoreError>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;
    async fn list_keys(&self) -> Result<Vec<String>, StoreError>;
}

/// `object_store`-backed artifacts (in-memory, local filesystem or S3).
pub struct ObjectStoreArtifacts {
    store: Arc<dyn ObjectStore>,
    location_root: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct S3Settings {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl ObjectStoreArtifacts {
    pub fn new(store: Arc<dyn ObjectStore>, location_root: impl Into<String>) -> Self {
        Self {
            store,
            location_root: location_root.into(),
        }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "memory://")
    }

    pub fn local(root: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root).map_err(|e| StoreError::Config(format!("{}: {e}", root.display())))?;
        let canonical = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let store = LocalFileSystem::new_with_prefix(&canonical)
            .map_err(|e| StoreError::Config(format!("local filesystem error: {e}")))?;
        tracing::info!(target: "artifact", root = %canonical.display(), "local artifact store");
        Ok(Self::new(
            Arc::new(store),
            format!("file://{}", canonical.display()),
        ))
    }

    /// Credentials come from the usual `AWS_*` environment variables.
    pub fn s3(settings: &S3Settings) -> Result<Self, StoreError> {
        if settings.bucket.trim().is_empty() {
            return Err(StoreError::Config("S3 bucket not set".into()));
        }
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&settings.bucket);
        if let Some(region) = &settings.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = settings.endpoint.as_deref().filter(|e| !e.is_empty()) {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        let store = builder
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))?;
        tracing::info!(target: "artifact", bucket = %settings.bucket, "s3 artifact store");
        Ok(Self::new(Arc::new(store), format!("s3://{}", settings.bucket)))
    }
}

fn map_object_store_error(key: &str, e: object_store::Error) -> StoreError {
    let message = e.to_string();
    if matches!(e, object_store::Error::NotFound { .. }) || message.contains("NoSuchBucket") {
        return StoreError::NoSuchBucket { message };
    }
    if message.contains("AccessDenied")
        || message.contains("403 Forbidden")
        || message.to_ascii_lowercase().contains("permission denied")
    {
        return StoreError::AccessDenied {
            key: key.to_string(),
            message,
        };
    }
    StoreError::Transient { message }
}

#[async_trait]
impl ArtifactStore for ObjectStoreArtifacts {
    async fn put(&self, key: &str, body: Bytes) -> Result<String, StoreError> {
        let path = ObjectPath::from(key);
        self.store
            .put(&path, body.into())
            .await
            .map_err(|e| map_object_store_error(key, e))?;
        let sep = if self.location_root.ends_with('/') { "" } else { "/" };
        Ok(format!("{}{sep}{key}", self.location_root))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let path = ObjectPath::from(key);
        match self.store.get(&path).await {
            Ok(r) => r
                .bytes()
                .await
                .map(Some)
                .map_err(|e| map_object_store_error(key, e)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(map_object_store_error(key, e)),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let metas: Vec<object_store::ObjectMeta> = self
            .store
            .list(None)
            .try_collect()
            .await
            .map_err(|e| map_object_store_error("", e))?;
        let mut keys: Vec<String> = metas.into_iter().map(|m| m.location.to_string()).collect();
        keys.sort();
        Ok(keys)
    }
}

/// `data-{source_id}-{YYYY-MM-DDTHH-MM-SS}.json`, UTC, optional prefix.
pub fn artifact_key(prefix: &str, source_id: &str, run_timestamp: DateTime<Utc>) -> String {
    format!(
        "{}data-{}-{}.json",
        prefix,
        source_id,
        run_timestamp.format("%Y-%m-%dT%H-%M-%S")
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactReceipt {
    pub key: String,
    pub location: String,
    pub bytes: usize,
    pub sha256: String,
    pub retries: u32,
}

pub struct ArtifactWriter {
    store: Arc<dyn ArtifactStore>,
    retry: RetryPolicy,
    prefix: String,
}

impl ArtifactWriter {
    pub fn new(store: Arc<dyn ArtifactStore>, retry: RetryPolicy, prefix: &str) -> Self {
        let prefix = match prefix.trim_matches('/') {
            "" => String::new(),
            p => format!("{p}/"),
        };
        Self {
            store,
            retry,
            prefix,
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn key_for(&self, source_id: &str, run_timestamp: DateTime<Utc>) -> String {
        artifact_key(&self.prefix, source_id, run_timestamp)
    }

    /// Serialize and upload `agg`. Transient failures are retried; access and
    /// bucket errors are returned immediately.
    pub async fn write(&self, agg: &RunAggregate) -> Result<ArtifactReceipt, RetryError<StoreError>> {
        let key = self.key_for(&agg.source_id, agg.run_timestamp);
        let body = serde_json::to_vec_pretty(agg).map_err(|e| RetryError::Fatal {
            error: StoreError::Serialize(e.to_string()),
            retries: 0,
        })?;
        let sha256 = format!("{:x}", Sha256::digest(&body));
        let size = body.len();
        let body = Bytes::from(body);

        let store = &self.store;
        let key_ref = key.as_str();
        let body_ref = &body;
        let res = self
            .retry
            .run(
                "artifact_put",
                move |_| async move { store.put(key_ref, body_ref.clone()).await },
                |e: &StoreError| {
                    if e.retryable() {
                        Verdict::Retry
                    } else {
                        Verdict::Fail
                    }
                },
            )
            .await;

        match res {
            Ok(done) => {
                counter!("artifact_writes_total").increment(1);
                tracing::info!(
                    target: "artifact",
                    key = %key,
                    location = %done.value,
                    bytes = size,
                    retries = done.retries,
                    "artifact written"
                );
                Ok(ArtifactReceipt {
                    key,
                    location: done.value,
                    bytes: size,
                    sha256,
                    retries: done.retries,
                })
            }
            Err(e) => {
                counter!("artifact_write_errors_total").increment(1);
                tracing::error!(target: "artifact", key = %key, error = %e, "artifact write failed");
                Err(e)
            }
        }
    }
}
