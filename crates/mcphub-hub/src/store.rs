//! M3: persistent JSON key/value store (spec.md §4 M3).
//!
//! Backs the inbound session manager's (S1) session persistence. Records
//! are namespaced by an ID prefix (e.g. `session:`), carry an optional TTL,
//! and are swept periodically. Every key is validated against path
//! traversal before touching disk, since the key becomes a file name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// A stored record: arbitrary JSON payload plus expiry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirableRecord {
    pub value: Value,
    pub created_at_epoch_ms: u64,
    /// `None` means the record never expires.
    pub expires_at_epoch_ms: Option<u64>,
}

impl ExpirableRecord {
    pub fn new(value: Value, ttl: Option<Duration>) -> Self {
        let now = now_epoch_ms();
        Self {
            value,
            created_at_epoch_ms: now,
            expires_at_epoch_ms: ttl.map(|d| now + d.as_millis() as u64),
        }
    }

    pub fn is_expired(&self, now_epoch_ms: u64) -> bool {
        self.expires_at_epoch_ms.is_some_and(|exp| now_epoch_ms >= exp)
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Validate that `id` is a safe on-disk key: non-empty, no path separators,
/// no `..`, and restricted to an allowed-prefix scheme (e.g. `session:`).
pub fn validate_record_id(id: &str, required_prefix: &str) -> Result<()> {
    if id.is_empty() {
        bail!("record id must not be empty");
    }
    if !id.starts_with(required_prefix) {
        bail!("record id '{id}' must start with '{required_prefix}'");
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") {
        bail!("record id '{id}' contains disallowed path characters");
    }
    Ok(())
}

fn id_to_filename(id: &str) -> String {
    // The validated id is already filesystem-safe after `validate_record_id`;
    // this only avoids a bare `.json` collision with reserved names.
    format!("{id}.json")
}

/// An on-disk, append-free JSON key/value store: one file per record under
/// `root`, an in-memory mirror for fast reads, and a periodic sweep that
/// deletes expired records.
pub struct PersistentStore {
    root: PathBuf,
    required_prefix: String,
    cache: RwLock<HashMap<String, ExpirableRecord>>,
}

impl PersistentStore {
    pub async fn open(root: PathBuf, required_prefix: impl Into<String>) -> Result<Self> {
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating store directory {}", root.display()))?;
        let store = Self {
            root,
            required_prefix: required_prefix.into(),
            cache: RwLock::new(HashMap::new()),
        };
        store.load_all().await?;
        Ok(store)
    }

    async fn load_all(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading store directory {}", self.root.display()))?;
        let mut cache = self.cache.write().await;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match load_record(&path).await {
                Ok(record) => {
                    cache.insert(stem.to_string(), record);
                }
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "skipping unreadable/legacy store record");
                }
            }
        }
        Ok(())
    }

    pub async fn put(&self, id: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        validate_record_id(id, &self.required_prefix)?;
        let record = ExpirableRecord::new(value, ttl);
        self.write_record(id, &record).await?;
        self.cache.write().await.insert(id.to_string(), record);
        Ok(())
    }

    async fn write_record(&self, id: &str, record: &ExpirableRecord) -> Result<()> {
        let path = self.root.join(id_to_filename(id));
        let text = serde_json::to_string_pretty(record).context("serializing store record")?;
        tokio::fs::write(&path, text)
            .await
            .with_context(|| format!("writing store record {}", path.display()))
    }

    pub async fn get(&self, id: &str) -> Option<Value> {
        let now = now_epoch_ms();
        let cache = self.cache.read().await;
        let record = cache.get(id)?;
        if record.is_expired(now) {
            return None;
        }
        Some(record.value.clone())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        validate_record_id(id, &self.required_prefix)?;
        self.cache.write().await.remove(id);
        let path = self.root.join(id_to_filename(id));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing store record {}", path.display())),
        }
    }

    /// Delete every expired record, in memory and on disk. Returns how many
    /// were swept.
    pub async fn sweep(&self) -> usize {
        let now = now_epoch_ms();
        let expired: Vec<String> = {
            let cache = self.cache.read().await;
            cache
                .iter()
                .filter(|(_, record)| record.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &expired {
            let _ = self.remove(id).await;
        }
        expired.len()
    }

    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = now_epoch_ms();
        self.cache
            .read()
            .await
            .iter()
            .filter(|(id, record)| id.starts_with(prefix) && !record.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

async fn load_record(path: &Path) -> Result<ExpirableRecord> {
    let text = tokio::fs::read_to_string(path).await?;
    // Legacy records written before TTL tracking existed lacked the expiry
    // fields entirely; treat them as non-expiring rather than rejecting them.
    match serde_json::from_str::<ExpirableRecord>(&text) {
        Ok(record) => Ok(record),
        Err(_) => {
            let value: Value = serde_json::from_str(&text)?;
            Ok(ExpirableRecord::new(value, None))
        }
    }
}
