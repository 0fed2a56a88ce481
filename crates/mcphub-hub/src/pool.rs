//! C2: template instance pool (spec.md §4 C2).
//!
//! A templated child is expanded per binding-hash (`mcphub_core::template`)
//! into a distinct `OutboundConnection`. Instances are kept warm with a
//! lease-counted idle TTL, evicted under pressure via LRU once the pool
//! exceeds its warm-instance cap, generalizing the teacher's
//! `(project_root, toolchain_hash)`-keyed `StatefulServerPool` to an
//! arbitrary binding-hash key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use mcphub_config::ChildConfig;
use tokio::sync::Mutex;

use crate::connection::OutboundConnection;

pub const DEFAULT_WARM_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_MAX_WARM_INSTANCES: usize = 16;
pub const DEFAULT_MAX_ACTIVE_INSTANCES: usize = 64;

/// Identifies one expanded template instance: the template's name plus the
/// SHA-256 hash of the variable bindings used to expand it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub template_name: String,
    pub bindings_hash: String,
}

pub struct TemplateInstancePool {
    template_name: String,
    max_warm: usize,
    max_active: usize,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    instances: HashMap<InstanceKey, Arc<OutboundConnection>>,
    leases: LeaseTracker,
}

impl TemplateInstancePool {
    pub fn new(template_name: impl Into<String>, warm_ttl: Duration) -> Self {
        Self {
            template_name: template_name.into(),
            max_warm: DEFAULT_MAX_WARM_INSTANCES,
            max_active: DEFAULT_MAX_ACTIVE_INSTANCES,
            inner: Mutex::new(PoolInner {
                instances: HashMap::new(),
                leases: LeaseTracker::new(warm_ttl),
            }),
        }
    }

    /// Acquire (creating if absent) the instance for `key`, expanding a
    /// fresh `OutboundConnection` from `make_config` only on a miss. Returns
    /// the connection and a `Lease` that must be dropped (via `release`)
    /// when the caller is done issuing calls through it.
    pub async fn acquire(
        &self,
        key: InstanceKey,
        make_config: impl FnOnce() -> Arc<ChildConfig>,
    ) -> Result<Arc<OutboundConnection>> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let stale = inner.leases.expire(now);
        let mut to_shutdown = inner.take(&stale);

        let connection = if let Some(existing) = inner.instances.get(&key).cloned() {
            inner.leases.acquire(&key, now);
            existing
        } else {
            if inner.leases.active_count() >= self.max_active {
                return Err(anyhow!(
                    "template '{}' instance limit reached: max_active_instances={}",
                    self.template_name,
                    self.max_active
                ));
            }
            let connection = OutboundConnection::spawn(make_config());
            let connection = Arc::new(connection);
            inner.instances.insert(key.clone(), connection.clone());
            inner.leases.acquire(&key, now);
            connection
        };

        let pressure_evicted =
            inner
                .leases
                .reclaim_for_pressure(inner.instances.len(), self.max_warm, &key);
        to_shutdown.extend(inner.take(&pressure_evicted));
        drop(inner);

        for conn in to_shutdown {
            conn.close().await;
        }

        Ok(connection)
    }

    pub async fn release(&self, key: &InstanceKey) {
        let to_shutdown = {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            inner.leases.release(key, now);
            let expired = inner.leases.expire(now);
            inner.take(&expired)
        };
        for conn in to_shutdown {
            conn.close().await;
        }
    }

    pub async fn shutdown_all(&self) {
        let handles = {
            let mut inner = self.inner.lock().await;
            inner.leases.clear();
            inner.instances.drain().map(|(_, v)| v).collect::<Vec<_>>()
        };
        for conn in handles {
            conn.close().await;
        }
    }

    pub async fn warm_count(&self) -> usize {
        self.inner.lock().await.instances.len()
    }
}

impl PoolInner {
    fn take(&mut self, keys: &[InstanceKey]) -> Vec<Arc<OutboundConnection>> {
        keys.iter().filter_map(|k| self.instances.remove(k)).collect()
    }
}

struct LeaseTracker {
    warm_ttl: Duration,
    leases: HashMap<InstanceKey, LeaseState>,
}

#[derive(Clone, Copy)]
struct LeaseState {
    active: usize,
    last_release: Instant,
}

impl LeaseTracker {
    fn new(warm_ttl: Duration) -> Self {
        Self {
            warm_ttl,
            leases: HashMap::new(),
        }
    }

    fn acquire(&mut self, key: &InstanceKey, now: Instant) {
        let lease = self.leases.entry(key.clone()).or_insert(LeaseState {
            active: 0,
            last_release: now,
        });
        lease.active = lease.active.saturating_add(1);
    }

    fn release(&mut self, key: &InstanceKey, now: Instant) {
        if let Some(lease) = self.leases.get_mut(key) {
            lease.active = lease.active.saturating_sub(1);
            if lease.active == 0 {
                lease.last_release = now;
            }
        }
    }

    fn active_count(&self) -> usize {
        self.leases.values().filter(|l| l.active > 0).count()
    }

    fn expire(&mut self, now: Instant) -> Vec<InstanceKey> {
        let expired: Vec<InstanceKey> = self
            .leases
            .iter()
            .filter(|(_, lease)| {
                lease.active == 0 && now.saturating_duration_since(lease.last_release) >= self.warm_ttl
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.leases.remove(key);
        }
        expired
    }

    fn reclaim_for_pressure(
        &mut self,
        count: usize,
        max_warm: usize,
        protected: &InstanceKey,
    ) -> Vec<InstanceKey> {
        if count <= max_warm {
            return Vec::new();
        }
        let mut candidates: Vec<(InstanceKey, Instant)> = self
            .leases
            .iter()
            .filter(|(k, l)| *k != protected && l.active == 0)
            .map(|(k, l)| (k.clone(), l.last_release))
            .collect();
        candidates.sort_by_key(|(_, last)| *last);

        let to_reclaim = count.saturating_sub(max_warm);
        let reclaimed: Vec<InstanceKey> = candidates.into_iter().take(to_reclaim).map(|(k, _)| k).collect();
        for key in &reclaimed {
            self.leases.remove(key);
        }
        reclaimed
    }

    fn clear(&mut self) {
        self.leases.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(hash: &str) -> InstanceKey {
        InstanceKey {
            template_name: "t".to_string(),
            bindings_hash: hash.to_string(),
        }
    }

    #[test]
    fn lease_tracker_expires_only_idle_past_ttl() {
        let mut tracker = LeaseTracker::new(Duration::from_millis(0));
        let k = key("a");
        let now = Instant::now();
        tracker.acquire(&k, now);
        tracker.release(&k, now);
        // ttl is zero so immediately eligible
        let expired = tracker.expire(now + Duration::from_millis(1));
        assert_eq!(expired, vec![k]);
    }

    #[test]
    fn active_lease_is_never_expired() {
        let mut tracker = LeaseTracker::new(Duration::from_millis(0));
        let k = key("a");
        tracker.acquire(&k, Instant::now());
        let expired = tracker.expire(Instant::now() + Duration::from_secs(1));
        assert!(expired.is_empty());
    }

    #[test]
    fn pressure_reclaim_protects_current_key_and_active_leases() {
        let mut tracker = LeaseTracker::new(Duration::from_secs(600));
        let now = Instant::now();
        let a = key("a");
        let b = key("b");
        tracker.acquire(&a, now);
        tracker.release(&a, now);
        tracker.acquire(&b, now);
        let reclaimed = tracker.reclaim_for_pressure(2, 1, &b);
        assert_eq!(reclaimed, vec![a]);
    }
}
