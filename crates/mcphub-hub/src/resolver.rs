//! C3: connection resolver (spec.md §4 C3).
//!
//! Maps a `ConnectionKey` — the wire encoding `<child>[:<sessionId-or-hash>]`
//! used in namespaced tool names and routing tables — to a live connection,
//! falling back through `name:sessionId` → `name:hash` → bare `name` so a
//! caller that only knows the child's name still reaches a shareable
//! template instance or its single direct connection.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use mcphub_config::ChildConfig;
use tokio::sync::RwLock;

use crate::connection::OutboundConnection;
use crate::pool::{InstanceKey, TemplateInstancePool};

/// Parsed form of the `<child>[:<suffix>]` wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionKey {
    pub child: String,
    pub suffix: Option<String>,
}

impl ConnectionKey {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((child, suffix)) => ConnectionKey {
                child: child.to_string(),
                suffix: Some(suffix.to_string()),
            },
            None => ConnectionKey {
                child: raw.to_string(),
                suffix: None,
            },
        }
    }

    pub fn encode(&self) -> String {
        match &self.suffix {
            Some(suffix) => format!("{}:{}", self.child, suffix),
            None => self.child.clone(),
        }
    }

    pub fn bare(child: impl Into<String>) -> Self {
        ConnectionKey {
            child: child.into(),
            suffix: None,
        }
    }

    pub fn with_suffix(child: impl Into<String>, suffix: impl Into<String>) -> Self {
        ConnectionKey {
            child: child.into(),
            suffix: Some(suffix.into()),
        }
    }
}

pub enum ResolvedConnection {
    Direct(Arc<OutboundConnection>),
    Pooled(Arc<OutboundConnection>, InstanceKey),
}

impl ResolvedConnection {
    pub fn connection(&self) -> &Arc<OutboundConnection> {
        match self {
            ResolvedConnection::Direct(c) => c,
            ResolvedConnection::Pooled(c, _) => c,
        }
    }
}

/// Holds every configured child's live state: a single direct connection
/// for non-template children, or a warm-instance pool for templates.
///
/// Each map is its own `RwLock` (rather than one lock over a struct) so a
/// config reload adding one child never blocks a `tools/call` resolving a
/// different, unrelated one.
#[derive(Default)]
pub struct ConnectionResolver {
    direct: RwLock<HashMap<String, Arc<OutboundConnection>>>,
    pools: RwLock<HashMap<String, Arc<TemplateInstancePool>>>,
    configs: RwLock<HashMap<String, Arc<ChildConfig>>>,
}

impl ConnectionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_direct(&self, config: Arc<ChildConfig>, connection: Arc<OutboundConnection>) {
        self.configs.write().await.insert(config.name.clone(), config.clone());
        self.direct.write().await.insert(config.name.clone(), connection);
    }

    pub async fn register_template(&self, config: Arc<ChildConfig>, pool: Arc<TemplateInstancePool>) {
        self.configs.write().await.insert(config.name.clone(), config.clone());
        self.pools.write().await.insert(config.name.clone(), pool);
    }

    /// Remove a child entirely, returning whatever live connection/pool it
    /// had so the caller can shut it down outside any lock.
    pub async fn unregister(&self, name: &str) -> (Option<Arc<OutboundConnection>>, Option<Arc<TemplateInstancePool>>) {
        self.configs.write().await.remove(name);
        let direct = self.direct.write().await.remove(name);
        let pool = self.pools.write().await.remove(name);
        (direct, pool)
    }

    /// Swap in a new `ChildConfig` for an already-connected child without
    /// touching its live connection or pool — used for M1's metadata-only
    /// reload path (tags, `disabled`, policy fields that don't require a
    /// restart).
    pub async fn register_metadata_only(&self, config: ChildConfig) {
        self.configs.write().await.insert(config.name.clone(), Arc::new(config));
    }

    pub async fn find_by_server_name(&self, name: &str) -> Option<Arc<OutboundConnection>> {
        self.direct.read().await.get(name).cloned()
    }

    pub async fn config_for(&self, name: &str) -> Option<Arc<ChildConfig>> {
        self.configs.read().await.get(name).cloned()
    }

    /// Resolve a `ConnectionKey`, trying the full `name:suffix` key, falling
    /// back to the bare `name` for templates that allow sharing.
    pub async fn resolve(
        &self,
        key: &ConnectionKey,
        bindings_hash: Option<&str>,
        make_config: impl FnOnce(&ChildConfig) -> Arc<ChildConfig>,
    ) -> Result<ResolvedConnection> {
        if let Some(connection) = self.direct.read().await.get(&key.child) {
            return Ok(ResolvedConnection::Direct(connection.clone()));
        }

        let Some(pool) = self.pools.read().await.get(&key.child).cloned() else {
            return Err(anyhow!("no connection or template registered for '{}'", key.child));
        };
        let Some(base_config) = self.configs.read().await.get(&key.child).cloned() else {
            return Err(anyhow!("no configuration registered for '{}'", key.child));
        };

        let hash = key
            .suffix
            .clone()
            .or_else(|| bindings_hash.map(str::to_string))
            .ok_or_else(|| {
                anyhow!(
                    "template '{}' requires session id or variable-binding hash to resolve",
                    key.child
                )
            })?;

        let instance_key = InstanceKey {
            template_name: key.child.clone(),
            bindings_hash: hash,
        };
        let connection = pool
            .acquire(instance_key.clone(), || make_config(&base_config))
            .await?;
        Ok(ResolvedConnection::Pooled(connection, instance_key))
    }

    pub async fn release(&self, child: &str, instance_key: &InstanceKey) {
        if let Some(pool) = self.pools.read().await.get(child).cloned() {
            pool.release(instance_key).await;
        }
    }

    pub async fn child_names(&self) -> Vec<String> {
        self.configs.read().await.keys().cloned().collect()
    }

    /// Tear down every direct connection and template pool, for graceful
    /// shutdown.
    pub async fn shutdown_all(&self) {
        for connection in self.direct.read().await.values() {
            connection.close().await;
        }
        for pool in self.pools.read().await.values() {
            pool.shutdown_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_name() {
        let key = ConnectionKey::parse("fs");
        assert_eq!(key.child, "fs");
        assert!(key.suffix.is_none());
    }

    #[test]
    fn parses_name_with_suffix() {
        let key = ConnectionKey::parse("fs:session-abc");
        assert_eq!(key.child, "fs");
        assert_eq!(key.suffix.as_deref(), Some("session-abc"));
    }

    #[test]
    fn roundtrips_encode() {
        let key = ConnectionKey::with_suffix("fs", "hash1");
        assert_eq!(ConnectionKey::parse(&key.encode()), key);
    }
}
