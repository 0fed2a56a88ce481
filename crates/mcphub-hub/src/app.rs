//! Process-wide bootstrap: wires every component (C1-C3, A1-A2, S1-S2,
//! M1-M3) into one running proxy and drives the M1 config-reload dispatcher
//! that mutates the live C3 resolver when the on-disk config changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mcphub_config::ChildConfig;

use crate::agent_config::AgentConfigHandle;
use crate::aggregator::CapabilityAggregator;
use crate::config_manager::{ChangeAction, ConfigManager};
use crate::connection::OutboundConnection;
use crate::loader::LoadingOrchestrator;
use crate::notify_mgr::{NotificationKind, NotificationManager};
use crate::pool::TemplateInstancePool;
use crate::proxy::ProxyRouter;
use crate::resolver::ConnectionResolver;
use crate::session::SessionManager;
use crate::store::PersistentStore;

const SCHEMA_CACHE_TTL: Duration = Duration::from_secs(60);
const NOTIFICATION_DEBOUNCE: Duration = Duration::from_millis(200);
const CONFIG_RELOAD_DEBOUNCE: Duration = Duration::from_millis(300);

/// Everything a running proxy process needs, assembled once at startup and
/// shared behind `Arc`s with every inbound transport.
pub struct Application {
    pub config_manager: Arc<ConfigManager>,
    pub resolver: Arc<ConnectionResolver>,
    pub aggregator: Arc<CapabilityAggregator>,
    pub orchestrator: Arc<LoadingOrchestrator>,
    pub notifications: Arc<NotificationManager>,
    pub sessions: Arc<SessionManager>,
    pub agent_config: Arc<AgentConfigHandle>,
    pub router: ProxyRouter,
    config_dir: PathBuf,
    _watcher: Option<notify::RecommendedWatcher>,
}

impl Application {
    /// Load `config_path`, connect every enabled child, and start watching
    /// the file for hot-reload. `config_path`'s parent directory is also
    /// where the session store (M3) and PID file live, per spec.md §6.
    pub async fn bootstrap(config_path: PathBuf) -> Result<Self> {
        let config_dir = config_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let config_manager = Arc::new(ConfigManager::load(config_path.clone()).await?);
        let servers = config_manager.snapshot().await;

        let resolver = Arc::new(ConnectionResolver::new());
        let agent_config = Arc::new(AgentConfigHandle::default());
        let defaults = agent_config.get().await;

        let orchestrator = Arc::new(LoadingOrchestrator::new(
            servers.values().filter(|c| !c.disabled && !c.is_template()).count(),
            defaults.minimum_servers,
            Duration::from_millis(defaults.initial_load_timeout_ms),
        ));

        for child in servers.values().filter(|c| !c.disabled) {
            spawn_child(&resolver, child.clone()).await;
            if !child.is_template() {
                orchestrator.record_connected().await;
            }
        }

        let aggregator = Arc::new(CapabilityAggregator::new(
            Arc::clone(&resolver),
            Duration::from_secs(30),
            SCHEMA_CACHE_TTL,
        ));
        let notifications = Arc::new(NotificationManager::new(NOTIFICATION_DEBOUNCE));

        let session_store_root = mcphub_config::session_store_dir().join("streamable");
        let store = Arc::new(PersistentStore::open(session_store_root, crate::session::SESSION_ID_PREFIX).await?);
        let sessions = Arc::new(SessionManager::new(store));

        let router = ProxyRouter::new(
            Arc::clone(&aggregator),
            Arc::clone(&resolver),
            Duration::from_millis(30_000),
            defaults.default_tag_filter.clone(),
        );

        let watcher = match config_manager.watch(CONFIG_RELOAD_DEBOUNCE) {
            Ok((ticks, watcher)) => {
                spawn_reload_dispatcher(
                    Arc::clone(&config_manager),
                    Arc::clone(&resolver),
                    Arc::clone(&aggregator),
                    Arc::clone(&notifications),
                    ticks,
                );
                Some(watcher)
            }
            Err(error) => {
                tracing::warn!(error = %error, "config hot-reload disabled: failed to start file watcher");
                None
            }
        };

        Ok(Self {
            config_manager,
            resolver,
            aggregator,
            orchestrator,
            notifications,
            sessions,
            agent_config,
            router,
            config_dir,
            _watcher: watcher,
        })
    }

    pub fn config_dir(&self) -> &std::path::Path {
        &self.config_dir
    }

    pub async fn shutdown(&self) {
        self.resolver.shutdown_all().await;
    }
}

async fn spawn_child(resolver: &ConnectionResolver, config: ChildConfig) {
    let config = Arc::new(config);
    if config.is_template() {
        let warm_ttl = config
            .template
            .as_ref()
            .map(|t| t.idle_timeout(crate::pool::DEFAULT_WARM_TTL))
            .unwrap_or(crate::pool::DEFAULT_WARM_TTL);
        let pool = Arc::new(TemplateInstancePool::new(config.name.clone(), warm_ttl));
        resolver.register_template(config, pool).await;
    } else {
        let connection = Arc::new(OutboundConnection::spawn(Arc::clone(&config)));
        resolver.register_direct(config, connection).await;
    }
}

/// Drives M1: consumes debounced reload ticks, diffs the config, and applies
/// each child's minimal action to the live resolver/aggregator/notifications.
fn spawn_reload_dispatcher(
    config_manager: Arc<ConfigManager>,
    resolver: Arc<ConnectionResolver>,
    aggregator: Arc<CapabilityAggregator>,
    notifications: Arc<NotificationManager>,
    mut ticks: tokio::sync::mpsc::Receiver<()>,
) {
    tokio::spawn(async move {
        while ticks.recv().await.is_some() {
            let diff = match config_manager.reload().await {
                Ok(diff) => diff,
                Err(error) => {
                    tracing::warn!(error = %error, "config reload failed; keeping previous configuration");
                    continue;
                }
            };
            if diff.is_empty() {
                continue;
            }

            let current = config_manager.snapshot().await;
            let mut any_capability_change = false;

            for (name, action) in &diff.actions {
                match action {
                    ChangeAction::Added => {
                        if let Some(config) = current.get(name) {
                            if !config.disabled {
                                spawn_child(&resolver, config.clone()).await;
                                any_capability_change = true;
                            }
                        }
                        tracing::info!(child = %name, "config reload: added child");
                    }
                    ChangeAction::Removed => {
                        let (direct, pool) = resolver.unregister(name).await;
                        if let Some(connection) = direct {
                            connection.close().await;
                        }
                        if let Some(pool) = pool {
                            pool.shutdown_all().await;
                        }
                        aggregator.invalidate_child(name).await;
                        any_capability_change = true;
                        tracing::info!(child = %name, "config reload: removed child");
                    }
                    ChangeAction::Restart { fields } => {
                        let (direct, pool) = resolver.unregister(name).await;
                        if let Some(connection) = direct {
                            connection.close().await;
                        }
                        if let Some(pool) = pool {
                            pool.shutdown_all().await;
                        }
                        if let Some(config) = current.get(name) {
                            if !config.disabled {
                                spawn_child(&resolver, config.clone()).await;
                            }
                        }
                        aggregator.invalidate_child(name).await;
                        any_capability_change = true;
                        tracing::info!(child = %name, fields = ?fields, "config reload: restarted child");
                    }
                    ChangeAction::MetadataOnly { fields } => {
                        if let Some(config) = current.get(name) {
                            resolver.register_metadata_only(config.clone()).await;
                        }
                        tracing::debug!(child = %name, fields = ?fields, "config reload: metadata-only update");
                        // Per spec.md's stated default (DESIGN.md open-question
                        // decision #3), a tag-only change still invalidates the
                        // capability view since sessions may filter on tags.
                        any_capability_change = true;
                    }
                }
            }

            if any_capability_change {
                notifications.notify_changed(NotificationKind::ToolsListChanged).await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcphub_config::{ChildTransport, StdioEnv};
    use std::io::Write;

    fn write_minimal_config(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("mcphub.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{"mcpServers": {{}}}}"#).unwrap();
        path
    }

    #[tokio::test]
    async fn bootstrap_with_zero_children_is_immediately_ready() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_minimal_config(dir.path());
        let app = Application::bootstrap(config_path).await.unwrap();
        assert_eq!(app.orchestrator.state().await, crate::loader::LoadState::AllConnected);
        app.shutdown().await;
    }

    #[test]
    fn stdio_config_is_never_a_template() {
        let config = ChildConfig {
            name: "a".to_string(),
            transport: ChildTransport::Stdio {
                command: "echo".to_string(),
                args: vec![],
                cwd: None,
                env: StdioEnv::default(),
            },
            tags: vec![],
            disabled: false,
            timeout: None,
            connection_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            restart_on_exit: false,
            max_restarts: 5,
            restart_delay_ms: 100,
            template: None,
        };
        assert!(!config.is_template());
    }
}
