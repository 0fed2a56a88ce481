//! M1: config manager (spec.md §4 M1).
//!
//! Watches the config file for changes (debounced), diffs the new server map
//! against the previous one field-by-field, and dispatches the minimal
//! action needed per child: a brand-new child is started, a removed child is
//! stopped, a child whose connection-affecting fields changed is restarted,
//! and a child whose only change is metadata (tags, `disabled`) gets an
//! in-place update with no restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mcphub_config::{ChildConfig, ConfigFile};
use notify::{Event, RecursiveMode, Watcher};
use tokio::sync::{RwLock, mpsc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeAction {
    Added,
    Removed,
    /// Connection-affecting fields changed; the child must be restarted.
    /// `fields` lists which ones, for logging.
    Restart { fields: Vec<String> },
    /// Only metadata changed (tags, disabled flag); no restart needed.
    MetadataOnly { fields: Vec<String> },
}

#[derive(Debug, Clone, Default)]
pub struct ConfigDiff {
    pub actions: HashMap<String, ChangeAction>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Field-level diff between two versions of the same named child, or
/// `Added`/`Removed` if one side is absent. Ordering follows spec.md's
/// stated dispatch precedence: removed, then modified, then added.
pub fn diff_servers(
    previous: &HashMap<String, ChildConfig>,
    current: &HashMap<String, ChildConfig>,
) -> ConfigDiff {
    let mut actions = HashMap::new();

    for name in previous.keys() {
        if !current.contains_key(name) {
            actions.insert(name.clone(), ChangeAction::Removed);
        }
    }

    for (name, next) in current {
        let Some(prev) = previous.get(name) else {
            continue;
        };
        if let Some(action) = classify_change(prev, next) {
            actions.insert(name.clone(), action);
        }
    }

    for name in current.keys() {
        if !previous.contains_key(name) {
            actions.insert(name.clone(), ChangeAction::Added);
        }
    }

    ConfigDiff { actions }
}

/// Which fields require a restart vs. are metadata-only, if changed.
fn classify_change(prev: &ChildConfig, next: &ChildConfig) -> Option<ChangeAction> {
    if prev == next {
        return None;
    }

    let mut restart_fields = Vec::new();
    let mut metadata_fields = Vec::new();

    if prev.transport != next.transport {
        restart_fields.push("transport".to_string());
    }
    if prev.connection_timeout_ms != next.connection_timeout_ms {
        restart_fields.push("connectionTimeout".to_string());
    }
    if prev.template != next.template {
        restart_fields.push("template".to_string());
    }
    if prev.tags != next.tags {
        metadata_fields.push("tags".to_string());
    }
    if prev.disabled != next.disabled {
        // A disabled<->enabled flip is effectively start/stop, which the
        // caller already handles via the resolver; treat it as metadata here
        // so the diff doesn't also force an unnecessary process restart.
        metadata_fields.push("disabled".to_string());
    }
    if prev.request_timeout_ms != next.request_timeout_ms
        || prev.restart_on_exit != next.restart_on_exit
        || prev.max_restarts != next.max_restarts
        || prev.restart_delay_ms != next.restart_delay_ms
    {
        metadata_fields.push("policy".to_string());
    }

    if !restart_fields.is_empty() {
        return Some(ChangeAction::Restart { fields: restart_fields });
    }
    if !metadata_fields.is_empty() {
        return Some(ChangeAction::MetadataOnly { fields: metadata_fields });
    }
    None
}

/// Debounced file-watcher that reloads the config and reports a diff.
pub struct ConfigManager {
    path: PathBuf,
    current: RwLock<HashMap<String, ChildConfig>>,
}

impl ConfigManager {
    pub async fn load(path: PathBuf) -> Result<Self> {
        let file = ConfigFile::load(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(file.servers),
        })
    }

    pub async fn snapshot(&self) -> HashMap<String, ChildConfig> {
        self.current.read().await.clone()
    }

    /// Reload from disk and return the diff against the previously held
    /// snapshot, updating the held snapshot to the new state.
    pub async fn reload(&self) -> Result<ConfigDiff> {
        let file = ConfigFile::load(&self.path)
            .with_context(|| format!("reloading config file {}", self.path.display()))?;
        let mut current = self.current.write().await;
        let diff = diff_servers(&current, &file.servers);
        *current = file.servers;
        Ok(diff)
    }

    /// Start a debounced filesystem watch; each settled burst of filesystem
    /// events sends one `()` tick on the returned channel, for the caller to
    /// drive `reload()` + dispatch.
    pub fn watch(self: &Arc<Self>, debounce: Duration) -> Result<(mpsc::Receiver<()>, notify::RecommendedWatcher)> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = raw_tx.send(event);
        })
        .context("creating filesystem watcher")?;
        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching config file {}", self.path.display()))?;

        let (tick_tx, tick_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            loop {
                let Some(event) = raw_rx.recv().await else { return };
                if event.is_err() {
                    continue;
                }
                // Drain any further events that land within the debounce
                // window so a burst of writes collapses into one reload.
                tokio::select! {
                    _ = tokio::time::sleep(debounce) => {}
                    _ = async {
                        while raw_rx.recv().await.is_some() {}
                    } => {}
                }
                if tick_tx.send(()).await.is_err() {
                    return;
                }
            }
        });

        Ok((tick_rx, watcher))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcphub_config::{ChildTransport, StdioEnv};

    fn stdio(name: &str, command: &str, tags: &[&str]) -> ChildConfig {
        ChildConfig {
            name: name.to_string(),
            transport: ChildTransport::Stdio {
                command: command.to_string(),
                args: vec![],
                cwd: None,
                env: StdioEnv::default(),
            },
            tags: tags.iter().map(|s| s.to_string()).collect(),
            disabled: false,
            timeout: None,
            connection_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            restart_on_exit: false,
            max_restarts: 5,
            restart_delay_ms: 100,
            template: None,
        }
    }

    #[test]
    fn detects_added_and_removed() {
        let mut prev = HashMap::new();
        prev.insert("a".to_string(), stdio("a", "echo", &[]));
        let mut next = HashMap::new();
        next.insert("b".to_string(), stdio("b", "echo", &[]));

        let diff = diff_servers(&prev, &next);
        assert_eq!(diff.actions.get("a"), Some(&ChangeAction::Removed));
        assert_eq!(diff.actions.get("b"), Some(&ChangeAction::Added));
    }

    #[test]
    fn command_change_requires_restart() {
        let prev = stdio("a", "echo", &[]);
        let next = stdio("a", "cat", &[]);
        let mut p = HashMap::new();
        p.insert("a".to_string(), prev);
        let mut n = HashMap::new();
        n.insert("a".to_string(), next);

        let diff = diff_servers(&p, &n);
        match diff.actions.get("a") {
            Some(ChangeAction::Restart { fields }) => assert!(fields.contains(&"transport".to_string())),
            other => panic!("expected Restart, got {other:?}"),
        }
    }

    #[test]
    fn tag_only_change_is_metadata_only() {
        let prev = stdio("a", "echo", &["x"]);
        let next = stdio("a", "echo", &["x", "y"]);
        let mut p = HashMap::new();
        p.insert("a".to_string(), prev);
        let mut n = HashMap::new();
        n.insert("a".to_string(), next);

        let diff = diff_servers(&p, &n);
        match diff.actions.get("a") {
            Some(ChangeAction::MetadataOnly { fields }) => assert!(fields.contains(&"tags".to_string())),
            other => panic!("expected MetadataOnly, got {other:?}"),
        }
    }

    #[test]
    fn identical_configs_produce_no_diff() {
        let a = stdio("a", "echo", &["x"]);
        let mut p = HashMap::new();
        p.insert("a".to_string(), a.clone());
        let mut n = HashMap::new();
        n.insert("a".to_string(), a);
        assert!(diff_servers(&p, &n).is_empty());
    }
}
