// tests/artifact.rs
mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

use common::fast_retry;
use sustainability_ingest::aggregate::{aggregate, RunAggregate};
use sustainability_ingest::artifact::{ArtifactStore, ArtifactWriter, ObjectStoreArtifacts, StoreError};
use sustainability_ingest::error::{Classified, ErrorClass};
use sustainability_ingest::ingest::types::{Source, SourceCursor};

/// Store that fails with a fixed error a number of times, then accepts.
struct Scripted {
    failures: u32,
    error: StoreError,
    calls: AtomicU32,
}

impl Scripted {
    fn new(failures: u32, error: StoreError) -> Self {
        Self {
            failures,
            error,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ArtifactStore for Scripted {
    async fn put(&self, key: &str, _body: Bytes) -> Result<String, StoreError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(self.error.clone())
        } else {
            Ok(format!("scripted://{key}"))
        }
    }

    async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(None)
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }
}

fn empty_aggregate(source_id: &str) -> RunAggregate {
    let src = Source {
        id: source_id.into(),
        feed_url: url::Url::parse("https://grist.org/feed/").unwrap(),
        display_name: "Grist".into(),
        instance_name: "[Marama] - Grist News Scrapper".into(),
        active: true,
        created_at: Utc::now(),
        cursor: SourceCursor::default(),
    };
    let ts = Utc.with_ymd_and_hms(2024, 1, 10, 10, 0, 0).unwrap();
    aggregate(&src, Uuid::new_v4(), ts, Vec::new())
}

#[tokio::test]
async fn same_run_overwrites_same_key() {
    let store = Arc::new(ObjectStoreArtifacts::memory());
    let writer = ArtifactWriter::new(store.clone(), fast_retry(0), "");

    let first = writer.write(&empty_aggregate("grist")).await.unwrap();
    let second = writer.write(&empty_aggregate("grist")).await.unwrap();
    assert_eq!(first.key, "data-grist-2024-01-10T10-00-00.json");
    assert_eq!(first.key, second.key);
    assert_eq!(first.location, "memory://data-grist-2024-01-10T10-00-00.json");
    assert_eq!(store.list_keys().await.unwrap(), vec![first.key.clone()]);

    // the stored body is what was hashed
    let body = store.get(&second.key).await.unwrap().unwrap();
    assert_eq!(body.len(), second.bytes);
    let back: RunAggregate = serde_json::from_slice(&body).unwrap();
    assert_eq!(back.source_id, "grist");
    assert_eq!(back.schema_version, 1);
}

#[tokio::test]
async fn transient_errors_are_retried() {
    let store = Arc::new(Scripted::new(
        2,
        StoreError::Transient {
            message: "connection reset".into(),
        },
    ));
    let writer = ArtifactWriter::new(store.clone(), fast_retry(3), "runs");
    let receipt = writer.write(&empty_aggregate("grist")).await.unwrap();
    assert_eq!(receipt.retries, 2);
    assert_eq!(receipt.location, "scripted://runs/data-grist-2024-01-10T10-00-00.json");
    assert_eq!(store.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn access_denied_is_not_retried() {
    let store = Arc::new(Scripted::new(
        u32::MAX,
        StoreError::AccessDenied {
            key: "k".into(),
            message: "AccessDenied".into(),
        },
    ));
    let writer = ArtifactWriter::new(store.clone(), fast_retry(5), "");
    let err = writer.write(&empty_aggregate("grist")).await.unwrap_err();
    assert!(!err.is_exhausted());
    assert_eq!(err.inner().class(), ErrorClass::PermanentGlobal);
    assert_eq!(store.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_bucket_is_not_retried() {
    let store = Arc::new(Scripted::new(
        u32::MAX,
        StoreError::NoSuchBucket {
            message: "NoSuchBucket".into(),
        },
    ));
    let writer = ArtifactWriter::new(store.clone(), fast_retry(5), "");
    assert!(writer.write(&empty_aggregate("grist")).await.is_err());
    assert_eq!(store.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn local_store_round_trips_through_the_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ObjectStoreArtifacts::local(dir.path()).unwrap());
    let writer = ArtifactWriter::new(store.clone(), fast_retry(0), "runs/");
    let receipt = writer.write(&empty_aggregate("earth-org")).await.unwrap();
    assert!(dir
        .path()
        .join("runs/data-earth-org-2024-01-10T10-00-00.json")
        .exists());
    assert_eq!(receipt.sha256.len(), 64);
}
