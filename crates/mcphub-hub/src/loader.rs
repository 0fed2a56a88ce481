//! A2: async loading orchestrator (spec.md §4 A2).
//!
//! Connections to configured children happen concurrently and take however
//! long each child's handshake takes. This module decides when the proxy is
//! "ready enough" to start serving (`wait_for_minimum_servers`, bounded by
//! `initial_load_timeout`) and batches the flurry of individual
//! `listChanged` triggers that a cold start otherwise produces into a single
//! notification once the cohort settles (`mcphub_core::parallel::BatchAccumulator`).

use std::sync::Arc;
use std::time::Duration;

use mcphub_core::BatchAccumulator;
use tokio::sync::{Notify, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    MinimumReached,
    AllConnected,
    TimedOut,
}

pub struct LoadingOrchestrator {
    minimum_servers: usize,
    total_servers: usize,
    initial_load_timeout: Duration,
    ready: Arc<Notify>,
    connected: RwLock<usize>,
    state: RwLock<LoadState>,
}

impl LoadingOrchestrator {
    pub fn new(total_servers: usize, minimum_servers: usize, initial_load_timeout: Duration) -> Self {
        Self {
            minimum_servers: minimum_servers.min(total_servers),
            total_servers,
            initial_load_timeout,
            ready: Arc::new(Notify::new()),
            connected: RwLock::new(0),
            state: RwLock::new(if total_servers == 0 {
                LoadState::AllConnected
            } else {
                LoadState::Loading
            }),
        }
    }

    /// Record one child finishing its initial connection attempt
    /// (successful or not — a permanently failed child still counts toward
    /// "settled" so a dead child doesn't block startup forever).
    pub async fn record_connected(&self) {
        let mut connected = self.connected.write().await;
        *connected += 1;
        let mut state = self.state.write().await;
        if *connected >= self.minimum_servers && *state == LoadState::Loading {
            *state = LoadState::MinimumReached;
            self.ready.notify_waiters();
        }
        if *connected >= self.total_servers {
            *state = LoadState::AllConnected;
            self.ready.notify_waiters();
        }
    }

    /// Block until at least `minimum_servers` have connected, or until
    /// `initial_load_timeout` elapses — whichever comes first. Never errors:
    /// a timeout just means the proxy starts serving with whatever
    /// connected so far, per spec.md's availability-over-completeness stance.
    pub async fn wait_for_minimum_servers(&self) -> LoadState {
        if self.minimum_servers == 0 {
            return *self.state.read().await;
        }
        let already = *self.state.read().await;
        if already != LoadState::Loading {
            return already;
        }

        let notified = self.ready.notified();
        tokio::select! {
            _ = notified => *self.state.read().await,
            _ = tokio::time::sleep(self.initial_load_timeout) => {
                let mut state = self.state.write().await;
                if *state == LoadState::Loading {
                    *state = LoadState::TimedOut;
                }
                *state
            }
        }
    }

    pub async fn state(&self) -> LoadState {
        *self.state.read().await
    }

    pub async fn connected_count(&self) -> usize {
        *self.connected.read().await
    }

    /// Wraps a `BatchAccumulator` so the caller can batch `listChanged`
    /// emissions for a cohort of children that connect in a burst (e.g.
    /// after a config reload adds several new children at once).
    pub fn new_batch(&self, expected: usize) -> BatchAccumulator {
        BatchAccumulator::new(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reaches_minimum_without_waiting_for_all() {
        let orchestrator = LoadingOrchestrator::new(5, 2, Duration::from_secs(5));
        orchestrator.record_connected().await;
        orchestrator.record_connected().await;
        let state = orchestrator.wait_for_minimum_servers().await;
        assert_eq!(state, LoadState::MinimumReached);
    }

    #[tokio::test]
    async fn times_out_when_minimum_never_reached() {
        let orchestrator = LoadingOrchestrator::new(5, 3, Duration::from_millis(20));
        orchestrator.record_connected().await;
        let state = orchestrator.wait_for_minimum_servers().await;
        assert_eq!(state, LoadState::TimedOut);
    }

    #[tokio::test]
    async fn zero_servers_is_immediately_ready() {
        let orchestrator = LoadingOrchestrator::new(0, 0, Duration::from_secs(5));
        let state = orchestrator.wait_for_minimum_servers().await;
        assert_eq!(state, LoadState::AllConnected);
    }
}
