//! # Enrichment Cache
//! Versioned, TTL-bounded store of accepted results keyed by normalized
//! subject key.
//!
//! Stored keys are `<version>:<subject key>`, so bumping the version makes
//! every older entry miss without a sweep. Expired and missing entries look
//! the same to callers.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::orchestrator::AcceptedResult;
use crate::subject::SubjectKey;

pub const DEFAULT_CACHE_VERSION: &str = "v1";
pub const DEFAULT_CACHE_TTL_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Full stored key, including the version prefix.
    pub key: String,
    pub subject: SubjectKey,
    pub result: AcceptedResult,
    pub tier: String,
    pub accepted_at: DateTime<Utc>,
    pub version: String,
}

/// Storage backend. Must tolerate concurrent readers and writers;
/// last write wins.
pub trait CacheStore: Send + Sync {
    fn load(&self, key: &str) -> Option<CacheEntry>;
    fn store(&self, entry: CacheEntry) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Vec<String>;
}

/// In-process store guarded by a `RwLock`. A poisoned lock is recovered:
/// each write is a single map insert, so the map is never half-updated.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn load(&self, key: &str) -> Option<CacheEntry> {
        let g = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        g.get(key).cloned()
    }

    fn store(&self, entry: CacheEntry) -> Result<()> {
        let mut g = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        g.insert(entry.key.clone(), entry);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut g = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        g.remove(key);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        let g = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        g.keys().cloned().collect()
    }
}

/// Durable store: one JSON file per key, named by the SHA-256 of the key.
/// Each write gets its own temp file in the same directory and is renamed
/// into place, so concurrent writers to one key never share a temp path.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating cache dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(key.as_bytes());
        let mut name = String::with_capacity(64);
        for b in digest.iter() {
            use std::fmt::Write as _;
            let _ = write!(&mut name, "{:02x}", b);
        }
        self.dir.join(format!("{name}.json"))
    }

    fn read_entry(path: &Path) -> Option<CacheEntry> {
        let s = fs::read_to_string(path).ok()?;
        serde_json::from_str(&s).ok()
    }
}

impl CacheStore for FileStore {
    fn load(&self, key: &str) -> Option<CacheEntry> {
        Self::read_entry(&self.path_for(key)).filter(|e| e.key == key)
    }

    fn store(&self, entry: CacheEntry) -> Result<()> {
        let path = self.path_for(&entry.key);
        let json = serde_json::to_vec(&entry).context("serializing cache entry")?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".entry-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .with_context(|| format!("creating temp file in {}", self.dir.display()))?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("removing cache entry"),
        }
    }

    fn keys(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .filter_map(|p| Self::read_entry(&p))
            .map(|e| e.key)
            .collect()
    }
}

pub struct EnrichmentCache {
    store: Arc<dyn CacheStore>,
    version: String,
    ttl: Duration,
}

impl EnrichmentCache {
    pub fn new(store: Arc<dyn CacheStore>, version: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            version: version.into(),
            ttl,
        }
    }

    /// Memory-backed cache with default version and TTL.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            DEFAULT_CACHE_VERSION,
            Duration::days(DEFAULT_CACHE_TTL_DAYS),
        )
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn versioned_key(&self, key: &SubjectKey) -> String {
        format!("{}:{}", self.version, key)
    }

    pub fn get(&self, key: &SubjectKey) -> Option<CacheEntry> {
        self.get_at(key, Utc::now())
    }

    /// Lookup as of `now`; stale or other-version entries are a miss.
    pub fn get_at(&self, key: &SubjectKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        let entry = self.store.load(&self.versioned_key(key))?;
        if self.is_live(&entry, now) {
            Some(entry)
        } else {
            debug!(target: "waterfall", subject = %key.anon(), "cache entry expired");
            None
        }
    }

    pub fn put(&self, key: &SubjectKey, result: &AcceptedResult) -> Result<CacheEntry> {
        self.put_at(key, result, Utc::now())
    }

    pub fn put_at(&self, key: &SubjectKey, result: &AcceptedResult, accepted_at: DateTime<Utc>) -> Result<CacheEntry> {
        let entry = CacheEntry {
            key: self.versioned_key(key),
            subject: key.clone(),
            result: result.clone(),
            tier: result.tier.clone(),
            accepted_at,
            version: self.version.clone(),
        };
        self.store.store(entry.clone())?;
        Ok(entry)
    }

    pub fn invalidate(&self, key: &SubjectKey) -> Result<()> {
        self.store.remove(&self.versioned_key(key))
    }

    /// Remove expired and other-version entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for k in self.store.keys() {
            let stale = match self.store.load(&k) {
                Some(e) => !self.is_live(&e, now),
                None => false,
            };
            if stale {
                match self.store.remove(&k) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(target: "waterfall", error = ?e, "cache purge failed"),
                }
            }
        }
        removed
    }

    fn is_live(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        entry.version == self.version && now.signed_duration_since(entry.accepted_at) < self.ttl
    }
}
