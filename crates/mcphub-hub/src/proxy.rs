//! Northbound `ServerHandler`: the single `rmcp` server implementation every
//! inbound transport (stdio, streamable-http) serves. Delegates to the
//! capability aggregator (A1) for `tools/list` and the connection resolver
//! (C3) for `tools/call`, applying the caller's tag filter (L1) to narrow
//! which children's tools are visible.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mcphub_core::TagFilter;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, PaginatedRequestParam, ReadResourceRequestParam, ReadResourceResult,
    ServerCapabilities, ServerInfo,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{CapabilityAggregator, split_namespaced};
use crate::resolver::{ConnectionKey, ConnectionResolver};

#[derive(Clone)]
pub struct ProxyRouter {
    aggregator: Arc<CapabilityAggregator>,
    resolver: Arc<ConnectionResolver>,
    tool_routes: Arc<RwLock<HashMap<String, String>>>,
    resource_routes: Arc<RwLock<HashMap<String, String>>>,
    prompt_routes: Arc<RwLock<HashMap<String, String>>>,
    request_timeout: Duration,
    tag_filter: TagFilter,
}

impl ProxyRouter {
    pub fn new(
        aggregator: Arc<CapabilityAggregator>,
        resolver: Arc<ConnectionResolver>,
        request_timeout: Duration,
        tag_filter: TagFilter,
    ) -> Self {
        Self {
            aggregator,
            resolver,
            tool_routes: Arc::new(RwLock::new(HashMap::new())),
            resource_routes: Arc::new(RwLock::new(HashMap::new())),
            prompt_routes: Arc::new(RwLock::new(HashMap::new())),
            request_timeout,
            tag_filter,
        }
    }

    /// A router scoped to a session's own tag filter, sharing the parent's
    /// aggregator/resolver state.
    pub fn with_tag_filter(&self, tag_filter: TagFilter) -> Self {
        Self {
            tag_filter,
            ..self.clone()
        }
    }

    pub async fn status_payload(&self) -> Value {
        let children = self.resolver.child_names().await;
        let tools_cached = self.tool_routes.read().await.len();
        json!({
            "running": true,
            "children": children,
            "toolsCached": tools_cached,
        })
    }

    /// `pub` (rather than purely crate-private) so integration tests and the
    /// HTTP status endpoint can drive a `ProxyRouter` without synthesizing
    /// an rmcp `RequestContext`.
    pub async fn list_tools_internal(&self) -> Result<ListToolsResult, McpError> {
        let (tools, routes) = self.aggregator.list_tools().await;

        let mut child_tags: HashMap<String, Vec<String>> = HashMap::new();
        for child in routes.values() {
            if child_tags.contains_key(child) {
                continue;
            }
            let tags = self
                .resolver
                .config_for(child)
                .await
                .map(|c| c.tags.clone())
                .unwrap_or_default();
            child_tags.insert(child.clone(), tags);
        }

        let visible: Vec<_> = tools
            .into_iter()
            .filter(|tool| {
                let Some(child) = routes.get(tool.name.as_ref()) else {
                    return true;
                };
                let tags = child_tags.get(child).cloned().unwrap_or_default().into_iter().collect();
                self.tag_filter.matches(&tags)
            })
            .collect();

        *self.tool_routes.write().await = routes;
        Ok(ListToolsResult::with_all_items(visible))
    }

    pub async fn call_tool_internal(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult, McpError> {
        let namespaced = request.name.as_ref();
        let mut owner = self.tool_routes.read().await.get(namespaced).cloned();

        if owner.is_none() {
            self.list_tools_internal().await?;
            owner = self.tool_routes.read().await.get(namespaced).cloned();
        }

        let Some(child) = owner.or_else(|| split_namespaced(namespaced).map(|(c, _)| c.to_string())) else {
            return Err(McpError::invalid_params(format!("unknown MCP tool: {namespaced}"), None));
        };

        let cancellation = CancellationToken::new();
        let key = ConnectionKey::bare(child.clone());
        let resolved = self
            .resolver
            .resolve(&key, None, |cfg| Arc::new(cfg.clone()))
            .await
            .map_err(|e| McpError::invalid_params(format!("unknown MCP tool owner '{child}': {e}"), None))?;

        let bare_name = split_namespaced(namespaced).map(|(_, tool)| tool).unwrap_or(namespaced);
        let inner_request = CallToolRequestParam {
            name: bare_name.to_string().into(),
            arguments: request.arguments,
        };

        match timeout(
            self.request_timeout,
            resolved.connection().call_tool(inner_request, cancellation.clone()),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(McpError::internal_error(
                format!("forwarding to '{child}' failed: {error}"),
                None,
            )),
            Err(_) => {
                cancellation.cancel();
                Err(McpError::internal_error(
                    format!(
                        "forwarding to '{child}' timed out after {}s",
                        self.request_timeout.as_secs()
                    ),
                    None,
                ))
            }
        }
    }

    async fn child_tags(&self, routes: &HashMap<String, String>) -> HashMap<String, Vec<String>> {
        let mut child_tags: HashMap<String, Vec<String>> = HashMap::new();
        for child in routes.values() {
            if child_tags.contains_key(child) {
                continue;
            }
            let tags = self
                .resolver
                .config_for(child)
                .await
                .map(|c| c.tags.clone())
                .unwrap_or_default();
            child_tags.insert(child.clone(), tags);
        }
        child_tags
    }

    pub async fn list_resources_internal(&self) -> Result<ListResourcesResult, McpError> {
        let (resources, routes) = self.aggregator.list_resources().await;
        let child_tags = self.child_tags(&routes).await;

        let visible: Vec<_> = resources
            .into_iter()
            .filter(|resource| {
                let Some(child) = routes.get(&resource.uri) else {
                    return true;
                };
                let tags = child_tags.get(child).cloned().unwrap_or_default().into_iter().collect();
                self.tag_filter.matches(&tags)
            })
            .collect();

        *self.resource_routes.write().await = routes;
        Ok(ListResourcesResult::with_all_items(visible))
    }

    pub async fn read_resource_internal(
        &self,
        request: ReadResourceRequestParam,
    ) -> Result<ReadResourceResult, McpError> {
        let uri = request.uri.clone();
        let mut owner = self.resource_routes.read().await.get(&uri).cloned();

        if owner.is_none() {
            self.list_resources_internal().await?;
            owner = self.resource_routes.read().await.get(&uri).cloned();
        }

        let Some(child) = owner else {
            return Err(McpError::invalid_params(format!("unknown MCP resource: {uri}"), None));
        };

        let cancellation = CancellationToken::new();
        let key = ConnectionKey::bare(child.clone());
        let resolved = self
            .resolver
            .resolve(&key, None, |cfg| Arc::new(cfg.clone()))
            .await
            .map_err(|e| McpError::invalid_params(format!("unknown MCP resource owner '{child}': {e}"), None))?;

        let inner_request = ReadResourceRequestParam { uri };

        match timeout(
            self.request_timeout,
            resolved.connection().read_resource(inner_request, cancellation.clone()),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(McpError::internal_error(
                format!("forwarding to '{child}' failed: {error}"),
                None,
            )),
            Err(_) => {
                cancellation.cancel();
                Err(McpError::internal_error(
                    format!(
                        "forwarding to '{child}' timed out after {}s",
                        self.request_timeout.as_secs()
                    ),
                    None,
                ))
            }
        }
    }

    pub async fn list_prompts_internal(&self) -> Result<ListPromptsResult, McpError> {
        let (prompts, routes) = self.aggregator.list_prompts().await;
        let child_tags = self.child_tags(&routes).await;

        let visible: Vec<_> = prompts
            .into_iter()
            .filter(|prompt| {
                let Some(child) = routes.get(&prompt.name) else {
                    return true;
                };
                let tags = child_tags.get(child).cloned().unwrap_or_default().into_iter().collect();
                self.tag_filter.matches(&tags)
            })
            .collect();

        *self.prompt_routes.write().await = routes;
        Ok(ListPromptsResult::with_all_items(visible))
    }

    pub async fn get_prompt_internal(&self, request: GetPromptRequestParam) -> Result<GetPromptResult, McpError> {
        let namespaced = request.name.as_str();
        let mut owner = self.prompt_routes.read().await.get(namespaced).cloned();

        if owner.is_none() {
            self.list_prompts_internal().await?;
            owner = self.prompt_routes.read().await.get(namespaced).cloned();
        }

        let Some(child) = owner.or_else(|| split_namespaced(namespaced).map(|(c, _)| c.to_string())) else {
            return Err(McpError::invalid_params(format!("unknown MCP prompt: {namespaced}"), None));
        };

        let cancellation = CancellationToken::new();
        let key = ConnectionKey::bare(child.clone());
        let resolved = self
            .resolver
            .resolve(&key, None, |cfg| Arc::new(cfg.clone()))
            .await
            .map_err(|e| McpError::invalid_params(format!("unknown MCP prompt owner '{child}': {e}"), None))?;

        let bare_name = split_namespaced(namespaced).map(|(_, name)| name).unwrap_or(namespaced);
        let inner_request = GetPromptRequestParam { name: bare_name.to_string(), arguments: request.arguments };

        match timeout(
            self.request_timeout,
            resolved.connection().get_prompt(inner_request, cancellation.clone()),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(McpError::internal_error(
                format!("forwarding to '{child}' failed: {error}"),
                None,
            )),
            Err(_) => {
                cancellation.cancel();
                Err(McpError::internal_error(
                    format!(
                        "forwarding to '{child}' timed out after {}s",
                        self.request_timeout.as_secs()
                    ),
                    None,
                ))
            }
        }
    }
}

impl ServerHandler for ProxyRouter {
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        self.list_tools_internal().await
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call_tool_internal(request).await
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        self.list_resources_internal().await
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        self.read_resource_internal(request).await
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        self.list_prompts_internal().await
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        self.get_prompt_internal(request).await
    }

    async fn ping(&self, _context: RequestContext<RoleServer>) -> Result<(), McpError> {
        Ok(())
    }

    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.server_info.name = "mcphub".to_string();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.capabilities =
            ServerCapabilities::builder().enable_tools().enable_resources().enable_prompts().build();
        info
    }
}
