//! M2: agent config (spec.md §4 M2).
//!
//! Global, hub-wide settings that aren't per-child (default tag filter,
//! concurrency caps, initial-load timing). Readers take a cheap `Arc` clone
//! under a brief lock rather than holding the lock for the read's duration —
//! "copy-on-read" — so a slow reader never blocks a config reload from
//! publishing a new version.

use std::sync::Arc;

use mcphub_core::TagFilter;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub default_tag_filter: TagFilter,
    pub max_concurrent_calls: usize,
    pub initial_load_timeout_ms: u64,
    pub minimum_servers: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_tag_filter: TagFilter::Any,
            max_concurrent_calls: 32,
            initial_load_timeout_ms: 10_000,
            minimum_servers: 0,
        }
    }
}

/// Singleton handle: readers call `get()` to obtain an `Arc<AgentConfig>`
/// snapshot; writers call `set()` to publish a whole new snapshot.
pub struct AgentConfigHandle(RwLock<Arc<AgentConfig>>);

impl AgentConfigHandle {
    pub fn new(initial: AgentConfig) -> Self {
        Self(RwLock::new(Arc::new(initial)))
    }

    pub async fn get(&self) -> Arc<AgentConfig> {
        Arc::clone(&*self.0.read().await)
    }

    pub async fn set(&self, next: AgentConfig) {
        *self.0.write().await = Arc::new(next);
    }
}

impl Default for AgentConfigHandle {
    fn default() -> Self {
        Self::new(AgentConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_latest_published_snapshot() {
        let handle = AgentConfigHandle::default();
        assert_eq!(handle.get().await.max_concurrent_calls, 32);

        handle
            .set(AgentConfig {
                max_concurrent_calls: 8,
                ..AgentConfig::default()
            })
            .await;
        assert_eq!(handle.get().await.max_concurrent_calls, 8);
    }

    #[tokio::test]
    async fn concurrent_readers_see_a_consistent_snapshot() {
        let handle = Arc::new(AgentConfigHandle::default());
        let h2 = Arc::clone(&handle);
        let reader = tokio::spawn(async move { h2.get().await.minimum_servers });
        handle
            .set(AgentConfig {
                minimum_servers: 3,
                ..AgentConfig::default()
            })
            .await;
        // Either snapshot is a valid consistent read; the point is it never panics/tears.
        let _ = reader.await.unwrap();
    }
}
