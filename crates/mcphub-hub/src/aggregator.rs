//! A1: capability aggregator (spec.md §4 A1), backed by the L3 schema cache.
//!
//! Fans `tools/list`/`resources/list`/`prompts/list` out across every
//! connected child (bounded concurrency, partial results on a per-child
//! failure — see `mcphub_core::parallel`), namespaces each item as
//! `<child>.<name>` so two children can both expose an item named e.g.
//! `read_file` without colliding, and diffs successive snapshots so the
//! notification manager (S2) only emits `listChanged` when something
//! actually changed.
//!
//! Output order is insertion order by child name ascending, then original
//! name ascending (spec.md §4 A1), so two runs against an unchanged set of
//! children always produce the same list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{Prompt, Resource, Tool};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::resolver::ConnectionResolver;
use crate::schema_cache::SchemaCache;

pub const NAMESPACE_SEPARATOR: char = '.';

pub fn namespaced_name(child: &str, item: &str) -> String {
    format!("{child}{NAMESPACE_SEPARATOR}{item}")
}

/// Splits a namespaced name back into `(child, item)`. Only splits on the
/// first separator, since item names themselves may contain dots.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityDiff {
    pub added_children: Vec<String>,
    pub removed_children: Vec<String>,
    pub tools_changed: Vec<String>,
    pub resources_changed: Vec<String>,
    pub prompts_changed: Vec<String>,
}

impl CapabilityDiff {
    pub fn is_empty(&self) -> bool {
        self.added_children.is_empty()
            && self.removed_children.is_empty()
            && self.tools_changed.is_empty()
            && self.resources_changed.is_empty()
            && self.prompts_changed.is_empty()
    }
}

pub struct CapabilityAggregator {
    resolver: Arc<ConnectionResolver>,
    tools_cache: SchemaCache<String, Vec<Tool>>,
    resources_cache: SchemaCache<String, Vec<Resource>>,
    prompts_cache: SchemaCache<String, Vec<Prompt>>,
    request_timeout: Duration,
    last_tools: RwLock<HashMap<String, Vec<String>>>,
    last_resources: RwLock<HashMap<String, Vec<String>>>,
    last_prompts: RwLock<HashMap<String, Vec<String>>>,
}

impl CapabilityAggregator {
    pub fn new(resolver: Arc<ConnectionResolver>, request_timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            resolver,
            tools_cache: SchemaCache::new(256, cache_ttl),
            resources_cache: SchemaCache::new(256, cache_ttl),
            prompts_cache: SchemaCache::new(256, cache_ttl),
            request_timeout,
            last_tools: RwLock::new(HashMap::new()),
            last_resources: RwLock::new(HashMap::new()),
            last_prompts: RwLock::new(HashMap::new()),
        }
    }

    async fn connected_children(&self) -> Vec<(String, Arc<crate::connection::OutboundConnection>)> {
        let mut out = Vec::new();
        for child in self.resolver.child_names().await {
            if let Some(config) = self.resolver.config_for(&child).await {
                if config.disabled {
                    continue;
                }
            }
            if let Some(connection) = self.resolver.find_by_server_name(&child).await {
                if connection.is_connected() {
                    out.push((child, connection));
                }
            }
        }
        out
    }

    /// Aggregate tools across every child, namespacing each tool name.
    /// Returns the combined list plus the `(namespaced_name -> child)` route
    /// table so callers can dispatch `tools/call` without re-listing.
    pub async fn list_tools(&self) -> (Vec<Tool>, HashMap<String, String>) {
        let children = self.connected_children().await;
        let timeout = self.request_timeout;
        let cache = &self.tools_cache;

        let mut fetched: HashMap<String, Vec<Tool>> = HashMap::new();
        for (child, connection) in children {
            let connection = Arc::clone(&connection);
            let result = cache
                .get_or_load(child.clone(), move || {
                    let connection = Arc::clone(&connection);
                    async move { fetch_with_timeout(timeout, connection.list_tools(CancellationToken::new())).await }
                })
                .await;
            match result {
                Ok(tools) => {
                    fetched.insert(child, tools);
                }
                Err(error) => {
                    tracing::warn!(child = %child, error = %error, "tools/list forwarding failed");
                }
            }
        }

        let mut children_sorted: Vec<(String, Vec<Tool>)> = fetched.into_iter().collect();
        children_sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, child_tools) in &mut children_sorted {
            child_tools.sort_by(|a, b| a.name.cmp(&b.name));
        }

        let mut tools = Vec::new();
        let mut routes = HashMap::new();
        let mut snapshot = HashMap::new();

        for (child, child_tools) in children_sorted {
            let mut names = Vec::with_capacity(child_tools.len());
            for mut tool in child_tools {
                names.push(tool.name.to_string());
                let namespaced = namespaced_name(&child, &tool.name);
                tool.name = namespaced.clone().into();
                routes.insert(namespaced, child.clone());
                tools.push(tool);
            }
            snapshot.insert(child, names);
        }

        *self.last_tools.write().await = snapshot;
        (tools, routes)
    }

    /// Aggregate resources across every child (spec.md §4 A1). `Resource`
    /// doesn't implement `Ord`, so the deterministic ordering sorts on the
    /// namespaced URI instead of the raw item.
    pub async fn list_resources(&self) -> (Vec<Resource>, HashMap<String, String>) {
        let children = self.connected_children().await;
        let timeout = self.request_timeout;
        let cache = &self.resources_cache;

        let mut fetched: HashMap<String, Vec<Resource>> = HashMap::new();
        for (child, connection) in children {
            let connection = Arc::clone(&connection);
            let result = cache
                .get_or_load(child.clone(), move || {
                    let connection = Arc::clone(&connection);
                    async move {
                        fetch_with_timeout(timeout, connection.list_resources(CancellationToken::new())).await
                    }
                })
                .await;
            match result {
                Ok(resources) => {
                    fetched.insert(child, resources);
                }
                Err(error) => {
                    tracing::warn!(child = %child, error = %error, "resources/list forwarding failed");
                }
            }
        }

        let mut children_sorted: Vec<(String, Vec<Resource>)> = fetched.into_iter().collect();
        children_sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, resources) in &mut children_sorted {
            resources.sort_by(|a, b| a.name.cmp(&b.name));
        }

        let mut resources = Vec::new();
        let mut routes = HashMap::new();
        let mut snapshot = HashMap::new();

        for (child, child_resources) in children_sorted {
            let mut names = Vec::with_capacity(child_resources.len());
            for mut resource in child_resources {
                names.push(resource.name.clone());
                resource.name = namespaced_name(&child, &resource.name);
                // Resources are addressed by URI, not by name, so the route
                // table keys on the (unmodified) URI the child reported.
                routes.insert(resource.uri.clone(), child.clone());
                resources.push(resource);
            }
            snapshot.insert(child, names);
        }

        *self.last_resources.write().await = snapshot;
        (resources, routes)
    }

    /// Aggregate prompts across every child (spec.md §4 A1).
    pub async fn list_prompts(&self) -> (Vec<Prompt>, HashMap<String, String>) {
        let children = self.connected_children().await;
        let timeout = self.request_timeout;
        let cache = &self.prompts_cache;

        let mut fetched: HashMap<String, Vec<Prompt>> = HashMap::new();
        for (child, connection) in children {
            let connection = Arc::clone(&connection);
            let result = cache
                .get_or_load(child.clone(), move || {
                    let connection = Arc::clone(&connection);
                    async move { fetch_with_timeout(timeout, connection.list_prompts(CancellationToken::new())).await }
                })
                .await;
            match result {
                Ok(prompts) => {
                    fetched.insert(child, prompts);
                }
                Err(error) => {
                    tracing::warn!(child = %child, error = %error, "prompts/list forwarding failed");
                }
            }
        }

        let mut children_sorted: Vec<(String, Vec<Prompt>)> = fetched.into_iter().collect();
        children_sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, prompts) in &mut children_sorted {
            prompts.sort_by(|a, b| a.name.cmp(&b.name));
        }

        let mut prompts = Vec::new();
        let mut routes = HashMap::new();
        let mut snapshot = HashMap::new();

        for (child, child_prompts) in children_sorted {
            let mut names = Vec::with_capacity(child_prompts.len());
            for mut prompt in child_prompts {
                names.push(prompt.name.clone());
                let namespaced = namespaced_name(&child, &prompt.name);
                prompt.name = namespaced.clone();
                routes.insert(namespaced, child.clone());
                prompts.push(prompt);
            }
            snapshot.insert(child, names);
        }

        *self.last_prompts.write().await = snapshot;
        (prompts, routes)
    }

    /// Diff the current live state against a previously recorded snapshot of
    /// each capability kind, without re-fetching — used right after
    /// `list_tools`/`list_resources`/`list_prompts` complete. Children added
    /// or removed are reported once, keyed off the tools snapshot (every
    /// child exposes a tools entry even if it's empty).
    pub async fn diff_since_last(
        &self,
        previous_tools: &HashMap<String, Vec<String>>,
        previous_resources: &HashMap<String, Vec<String>>,
        previous_prompts: &HashMap<String, Vec<String>>,
    ) -> CapabilityDiff {
        let tools_current = self.last_tools.read().await;
        let resources_current = self.last_resources.read().await;
        let prompts_current = self.last_prompts.read().await;

        let mut diff = CapabilityDiff::default();

        for child in tools_current.keys() {
            if !previous_tools.contains_key(child) {
                diff.added_children.push(child.clone());
            }
        }
        for child in previous_tools.keys() {
            if !tools_current.contains_key(child) {
                diff.removed_children.push(child.clone());
            }
        }
        diff.tools_changed = changed_children(previous_tools, &tools_current);
        diff.resources_changed = changed_children(previous_resources, &resources_current);
        diff.prompts_changed = changed_children(previous_prompts, &prompts_current);
        diff
    }

    pub async fn tools_snapshot(&self) -> HashMap<String, Vec<String>> {
        self.last_tools.read().await.clone()
    }

    /// Retained name for existing callers; equivalent to `tools_snapshot`.
    pub async fn snapshot(&self) -> HashMap<String, Vec<String>> {
        self.tools_snapshot().await
    }

    pub async fn resources_snapshot(&self) -> HashMap<String, Vec<String>> {
        self.last_resources.read().await.clone()
    }

    pub async fn prompts_snapshot(&self) -> HashMap<String, Vec<String>> {
        self.last_prompts.read().await.clone()
    }

    pub async fn invalidate_child(&self, child: &str) {
        self.tools_cache.invalidate(&child.to_string()).await;
        self.resources_cache.invalidate(&child.to_string()).await;
        self.prompts_cache.invalidate(&child.to_string()).await;
    }
}

fn changed_children(previous: &HashMap<String, Vec<String>>, current: &HashMap<String, Vec<String>>) -> Vec<String> {
    let mut changed = Vec::new();
    for (child, items) in current.iter() {
        if let Some(prev_items) = previous.get(child) {
            let mut a = items.clone();
            let mut b = prev_items.clone();
            a.sort();
            b.sort();
            if a != b {
                changed.push(child.clone());
            }
        }
    }
    changed
}

async fn fetch_with_timeout<T>(
    timeout: Duration,
    fetch: impl std::future::Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match tokio::time::timeout(timeout, fetch).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("timed out")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespacing_roundtrips() {
        let name = namespaced_name("fs", "read_file");
        assert_eq!(name, "fs.read_file");
        assert_eq!(split_namespaced(&name), Some(("fs", "read_file")));
    }

    #[test]
    fn children_sort_by_name_then_items_sort_by_name() {
        let mut fetched: HashMap<String, Vec<String>> = HashMap::new();
        fetched.insert("b".to_string(), vec!["z".to_string(), "a".to_string()]);
        fetched.insert("a".to_string(), vec!["y".to_string(), "x".to_string()]);

        let mut ordered: Vec<(String, Vec<String>)> = fetched.into_iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, items) in &mut ordered {
            items.sort();
        }

        assert_eq!(ordered[0].0, "a");
        assert_eq!(ordered[0].1, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(ordered[1].0, "b");
        assert_eq!(ordered[1].1, vec!["a".to_string(), "z".to_string()]);
    }

    #[test]
    fn diff_detects_added_removed_and_changed() {
        let mut previous = HashMap::new();
        previous.insert("a".to_string(), vec!["x".to_string()]);
        previous.insert("b".to_string(), vec!["y".to_string()]);

        let mut current = HashMap::new();
        current.insert("a".to_string(), vec!["x".to_string(), "z".to_string()]);
        current.insert("c".to_string(), vec!["w".to_string()]);

        let mut diff = CapabilityDiff::default();
        for child in current.keys() {
            if !previous.contains_key(child) {
                diff.added_children.push(child.clone());
            }
        }
        for child in previous.keys() {
            if !current.contains_key(child) {
                diff.removed_children.push(child.clone());
            }
        }
        diff.tools_changed = changed_children(&previous, &current);

        assert_eq!(diff.added_children, vec!["c".to_string()]);
        assert_eq!(diff.removed_children, vec!["b".to_string()]);
        assert_eq!(diff.tools_changed, vec!["a".to_string()]);
    }
}
