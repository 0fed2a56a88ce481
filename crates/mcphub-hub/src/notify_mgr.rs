//! S2: notification manager (spec.md §4 S2).
//!
//! Fans `*/list_changed` notifications out to every subscribed inbound
//! session. Bursts of individual child changes (e.g. five children finishing
//! a cold-start connect within milliseconds of each other) are debounced
//! into a single notification per kind rather than one per child.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    ToolsListChanged,
    ResourcesListChanged,
    PromptsListChanged,
}

pub struct NotificationManager {
    debounce: Duration,
    sender: broadcast::Sender<NotificationKind>,
    pending: Mutex<Vec<(NotificationKind, JoinHandle<()>)>>,
}

impl NotificationManager {
    pub fn new(debounce: Duration) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            debounce,
            sender,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationKind> {
        self.sender.subscribe()
    }

    /// Request that `kind` be emitted after the debounce window. A second
    /// call for the same kind before the window elapses cancels the first
    /// timer and restarts it, so a burst collapses to one emission.
    pub async fn notify_changed(self: &Arc<Self>, kind: NotificationKind) {
        let mut pending = self.pending.lock().await;
        if let Some(pos) = pending.iter().position(|(k, _)| *k == kind) {
            let (_, handle) = pending.remove(pos);
            handle.abort();
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            let _ = this.sender.send(kind);
            let mut pending = this.pending.lock().await;
            pending.retain(|(k, _)| *k != kind);
        });
        pending.push((kind, handle));
    }

    /// Emit immediately, bypassing debounce — used when the caller already
    /// knows it's the final event in a settled batch (A2's `BatchAccumulator`
    /// reaching done).
    pub fn notify_now(&self, kind: NotificationKind) {
        let _ = self.sender.send(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn debounces_repeated_notifications_into_one() {
        let manager = Arc::new(NotificationManager::new(Duration::from_millis(20)));
        let mut rx = manager.subscribe();

        manager.notify_changed(NotificationKind::ToolsListChanged).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.notify_changed(NotificationKind::ToolsListChanged).await;

        // Should not have fired yet since the second call restarted the timer.
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(rx.try_recv().unwrap(), NotificationKind::ToolsListChanged);
        assert!(rx.try_recv().is_err(), "only one notification should have fired");
    }

    #[tokio::test]
    async fn notify_now_bypasses_debounce() {
        let manager = Arc::new(NotificationManager::new(Duration::from_secs(60)));
        let mut rx = manager.subscribe();
        manager.notify_now(NotificationKind::ResourcesListChanged);
        assert_eq!(rx.try_recv().unwrap(), NotificationKind::ResourcesListChanged);
    }
}
