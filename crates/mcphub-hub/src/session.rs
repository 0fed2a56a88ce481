//! S1: inbound session manager (spec.md §4 S1).
//!
//! The stdio transport is always exactly one implicit session for the
//! process's lifetime. The streamable-http transport is multi-session:
//! each client gets an `InboundSession` keyed by an opaque id, persisted via
//! M3 so a proxy restart can resume sessions whose `initializeResponse` was
//! saved. Sessions are swept on a TTL like every other M3-backed record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use mcphub_core::{ProxyError, TagFilter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::PersistentStore;

pub const SESSION_ID_PREFIX: &str = "session:";
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub created_at_epoch_ms: u64,
    pub last_seen_epoch_ms: u64,
    pub tag_filter_source: Option<String>,
    pub initialize_response: Option<Value>,
}

impl SessionRecord {
    fn touch(&mut self) {
        self.last_seen_epoch_ms = now_epoch_ms();
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

pub struct InboundSession {
    pub record: SessionRecord,
    pub tag_filter: TagFilter,
}

pub struct SessionManager {
    store: Arc<PersistentStore>,
    live: RwLock<HashMap<String, SessionRecord>>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<PersistentStore>) -> Self {
        Self {
            store,
            live: RwLock::new(HashMap::new()),
            ttl: DEFAULT_SESSION_TTL,
        }
    }

    /// Create a brand-new session (streamable-http `initialize`).
    pub async fn create_session(&self, tag_filter_source: Option<String>) -> InboundSession {
        let id = format!("{SESSION_ID_PREFIX}{}", Uuid::new_v4());
        let now = now_epoch_ms();
        let record = SessionRecord {
            id: id.clone(),
            created_at_epoch_ms: now,
            last_seen_epoch_ms: now,
            tag_filter_source: tag_filter_source.clone(),
            initialize_response: None,
        };
        self.live.write().await.insert(id.clone(), record.clone());
        self.persist(&record).await;

        let tag_filter = tag_filter_source
            .map(|s| TagFilter::parse_simple(&s))
            .unwrap_or(TagFilter::Any);
        InboundSession { record, tag_filter }
    }

    /// The implicit, always-present stdio session.
    pub fn stdio_session() -> InboundSession {
        let now = now_epoch_ms();
        InboundSession {
            record: SessionRecord {
                id: "stdio".to_string(),
                created_at_epoch_ms: now,
                last_seen_epoch_ms: now,
                tag_filter_source: None,
                initialize_response: None,
            },
            tag_filter: TagFilter::Any,
        }
    }

    pub async fn record_initialize_response(&self, id: &str, response: Value) {
        if let Some(record) = self.live.write().await.get_mut(id) {
            record.initialize_response = Some(response);
            record.touch();
            self.persist(record).await;
        }
    }

    pub async fn touch(&self, id: &str) {
        if let Some(record) = self.live.write().await.get_mut(id) {
            record.touch();
            self.persist(record).await;
        }
    }

    /// Restore a session previously persisted by M3. Per spec.md §9 (open
    /// question decision), a record with no saved `initializeResponse` can't
    /// be resumed — the client must re-initialize rather than silently
    /// getting a half-restored session.
    pub async fn restore_session(&self, id: &str) -> std::result::Result<InboundSession, ProxyError> {
        if let Some(record) = self.live.read().await.get(id).cloned() {
            return self.finish_restore(record);
        }
        let Some(value) = self.store.get(id).await else {
            return Err(ProxyError::NotFound(format!("session '{id}'")));
        };
        let record: SessionRecord = serde_json::from_value(value).map_err(|e| ProxyError::StorageFailed {
            reason: format!("corrupt session record '{id}': {e}"),
        })?;
        self.live.write().await.insert(id.to_string(), record.clone());
        self.finish_restore(record)
    }

    fn finish_restore(&self, record: SessionRecord) -> std::result::Result<InboundSession, ProxyError> {
        if record.initialize_response.is_none() {
            return Err(ProxyError::TransportFailed {
                child: record.id.clone(),
                reason: "session has no saved initializeResponse; client must re-initialize".to_string(),
            });
        }
        let tag_filter = record
            .tag_filter_source
            .clone()
            .map(|s| TagFilter::parse_simple(&s))
            .unwrap_or(TagFilter::Any);
        Ok(InboundSession { record, tag_filter })
    }

    pub async fn remove_session(&self, id: &str) -> Result<()> {
        self.live.write().await.remove(id);
        self.store.remove(id).await
    }

    async fn persist(&self, record: &SessionRecord) {
        if let Ok(value) = serde_json::to_value(record) {
            let _ = self.store.put(&record.id, value, Some(self.ttl)).await;
        }
    }

    /// Drop in-memory entries whose TTL has lapsed (the on-disk sweep is M3's
    /// job; this keeps the hot path's `live` map in sync with it).
    pub async fn sweep_expired(&self) -> usize {
        let cutoff = now_epoch_ms().saturating_sub(self.ttl.as_millis() as u64);
        let mut live = self.live.write().await;
        let before = live.len();
        live.retain(|_, record| record.last_seen_epoch_ms >= cutoff);
        before - live.len()
    }

    pub async fn active_count(&self) -> usize {
        self.live.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> SessionManager {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path().to_path_buf(), SESSION_ID_PREFIX).await.unwrap();
        SessionManager::new(Arc::new(store))
    }

    #[tokio::test]
    async fn restoring_without_initialize_response_fails() {
        let mgr = manager().await;
        let session = mgr.create_session(None).await;
        let err = mgr.restore_session(&session.record.id).await.unwrap_err();
        assert!(matches!(err, ProxyError::TransportFailed { .. }));
    }

    #[tokio::test]
    async fn restoring_after_initialize_response_saved_succeeds() {
        let mgr = manager().await;
        let session = mgr.create_session(Some("a,b".to_string())).await;
        mgr.record_initialize_response(&session.record.id, serde_json::json!({"ok": true}))
            .await;
        let restored = mgr.restore_session(&session.record.id).await.unwrap();
        assert_eq!(restored.record.id, session.record.id);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let mgr = manager().await;
        let err = mgr.restore_session("session:nope").await.unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }
}
