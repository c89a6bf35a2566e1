// src/registry.rs
//! Data-driven source registration. A new feed becomes a new pipeline
//! instance by adding a `Source` record; no code changes or redeploys.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ingest::types::{Source, SourceCursor};

pub const DEFAULT_INSTANCE_PREFIX: &str = "[Marama]";

pub const MSG_NAME_REQUIRED: &str = "News site name is required";
pub const MSG_URL_REQUIRED: &str = "Valid feed URL is required";
pub const MSG_URL_TAKEN: &str = "Feed URL is already registered";

/// Registration form payload. Accepts the form's own field names too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    #[serde(alias = "News Site Name", alias = "sourceName")]
    pub source_name: String,
    #[serde(alias = "Feed URL", alias = "feedURL", alias = "feedUrl")]
    pub feed_url: String,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("invalid registration: {}", problems.join("; "))]
    Invalid { problems: Vec<String> },
    #[error("registry could not be saved: {0}")]
    Persist(String),
}

impl RegistrationError {
    pub fn problems(&self) -> Vec<String> {
        match self {
            RegistrationError::Invalid { problems } => problems.clone(),
            RegistrationError::Persist(e) => vec![e.clone()],
        }
    }
}

/// Check a registration and return the trimmed name and parsed URL, or every
/// problem found.
pub fn validate(reg: &Registration) -> Result<(String, url::Url), Vec<String>> {
    let mut problems = Vec::new();
    let name = reg.source_name.trim().to_string();
    if name.is_empty() {
        problems.push(MSG_NAME_REQUIRED.to_string());
    }
    let url = url::Url::parse(reg.feed_url.trim())
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some_and(|h| !h.is_empty()));
    if url.is_none() {
        problems.push(MSG_URL_REQUIRED.to_string());
    }
    match url {
        Some(u) if problems.is_empty() => Ok((name, u)),
        _ => Err(problems),
    }
}

/// Lowercase ASCII slug: runs of other characters become one `-`.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("source");
    }
    out
}

fn short_hash(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    format!("{:x}", digest)[..8].to_string()
}

pub struct SourceRegistry {
    sources: RwLock<BTreeMap<String, Source>>,
    path: Option<PathBuf>,
    instance_prefix: String,
    seen_window: usize,
}

impl SourceRegistry {
    /// In-memory registry (tests, ephemeral runs).
    pub fn new(instance_prefix: &str, seen_window: usize) -> Self {
        Self {
            sources: RwLock::new(BTreeMap::new()),
            path: None,
            instance_prefix: instance_prefix.to_string(),
            seen_window,
        }
    }

    /// Registry persisted as JSON at `path`; loaded if the file exists.
    pub fn open(path: &Path, instance_prefix: &str, seen_window: usize) -> anyhow::Result<Self> {
        let mut map = BTreeMap::new();
        if path.exists() {
            let s = fs::read_to_string(path)
                .with_context(|| format!("reading source registry {}", path.display()))?;
            let list: Vec<Source> = serde_json::from_str(&s)
                .with_context(|| format!("parsing source registry {}", path.display()))?;
            for src in list {
                map.insert(src.id.clone(), src);
            }
        }
        tracing::info!(target: "registry", path = %path.display(), sources = map.len(), "source registry opened");
        Ok(Self {
            sources: RwLock::new(map),
            path: Some(path.to_path_buf()),
            instance_prefix: instance_prefix.to_string(),
            seen_window,
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Source>> {
        self.sources.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Source>> {
        self.sources.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register_source(&self, reg: Registration) -> Result<Source, RegistrationError> {
        self.register_at(reg, Utc::now())
    }

    pub fn register_at(&self, reg: Registration, now: DateTime<Utc>) -> Result<Source, RegistrationError> {
        let (name, url) = validate(&reg).map_err(|problems| RegistrationError::Invalid { problems })?;

        let source = {
            let mut map = self.write();
            if map.values().any(|s| s.feed_url == url) {
                return Err(RegistrationError::Invalid {
                    problems: vec![MSG_URL_TAKEN.to_string()],
                });
            }
            let mut id = slugify(&name);
            if map.contains_key(&id) {
                id = format!("{id}-{}", short_hash(url.as_str()));
            }
            let source = Source {
                id: id.clone(),
                feed_url: url,
                instance_name: format!("{} - {} News Scrapper", self.instance_prefix, name),
                display_name: name,
                active: true,
                created_at: now,
                cursor: SourceCursor::with_capacity(self.seen_window),
            };
            map.insert(id, source.clone());
            source
        };

        self.persist()
            .map_err(|e| RegistrationError::Persist(format!("{e:#}")))?;
        counter!("sources_registered_total").increment(1);
        tracing::info!(
            target: "registry",
            source_id = %source.id,
            feed_url = %source.feed_url,
            instance = %source.instance_name,
            "source registered"
        );
        Ok(source)
    }

    /// Register seed sources from configuration, skipping ones already known.
    pub fn seed(&self, regs: &[Registration]) -> usize {
        let mut added = 0;
        for reg in regs {
            match self.register_source(reg.clone()) {
                Ok(_) => added += 1,
                Err(RegistrationError::Invalid { problems }) if problems == [MSG_URL_TAKEN] => {}
                Err(e) => tracing::warn!(target: "registry", source = %reg.source_name, error = %e, "seed source rejected"),
            }
        }
        added
    }

    pub fn get(&self, id: &str) -> Option<Source> {
        self.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Source> {
        self.read().values().cloned().collect()
    }

    pub fn active_sources(&self) -> Vec<Source> {
        self.read().values().filter(|s| s.active).cloned().collect()
    }

    /// Sources are never deleted; this stops them being polled.
    pub fn deactivate(&self, id: &str) -> Option<Source> {
        let updated = {
            let mut map = self.write();
            let src = map.get_mut(id)?;
            src.active = false;
            src.clone()
        };
        if let Err(e) = self.persist() {
            tracing::warn!(target: "registry", source_id = %id, error = ?e, "persisting deactivation failed");
        }
        Some(updated)
    }

    /// Commit a source's cursor after its run was durably recorded.
    pub fn advance_cursor(&self, id: &str, cursor: SourceCursor) -> bool {
        {
            let mut map = self.write();
            let Some(src) = map.get_mut(id) else {
                return false;
            };
            src.cursor = cursor;
        }
        if let Err(e) = self.persist() {
            tracing::warn!(target: "registry", source_id = %id, error = ?e, "persisting cursor failed");
        }
        true
    }

    fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let list = self.list();
        let json = serde_json::to_string_pretty(&list).context("serializing source registry")?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(json.as_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}
