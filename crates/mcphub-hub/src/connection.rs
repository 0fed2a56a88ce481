//! C1: outbound connection to a single child MCP server (spec.md §4 C1).
//!
//! Owns the child's transport (stdio subprocess, HTTP, or SSE), serializes
//! calls through it, and restarts it with exponential backoff + jitter when
//! it dies unexpectedly. Every request is queued through a single-task actor
//! (mirroring the teacher's `ServerQueueHandle`) so a child that only
//! supports one in-flight request at a time is never handed concurrent
//! calls by the aggregator. A periodic health probe rides the same actor
//! loop and drives a silently-dead child into `Failed` before any caller
//! notices via a hung request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use mcphub_config::ChildConfig;
use mcphub_config::ChildTransport;
use mcphub_core::ProxyError;
use rand::Rng;
use rmcp::RoleClient;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, Prompt, ReadResourceRequestParam, ReadResourceResult, Resource, Tool,
};
use rmcp::service::{RunningService, ServiceExt};
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

const RESTART_BACKOFF_INITIAL_MS: u64 = 100;
const RESTART_BACKOFF_MAX_MS: u64 = 30_000;
/// After this long running without a crash, the backoff counter resets to
/// the initial delay — a flapping child shouldn't be punished forever for
/// one bad hour.
const HEALTHY_RESET_AFTER: Duration = Duration::from_secs(60);
/// Interval between idle health probes. Spec.md §4 C1 ties this to idle
/// time; a single fixed interval is the simplest policy that still catches
/// a silently-dead child between real calls.
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Restarting,
    /// An HTTP/SSE child reported it needs an OAuth grant. Restarts are
    /// suspended until something external signals completion of that flow
    /// (acquiring tokens is out of scope here — see spec.md §1); the only
    /// way out of this state today is a fresh `spawn`.
    AwaitingOAuth,
    Failed,
    /// The configured child is `disabled`; no connection attempt is made.
    Disabled,
    Closed,
}

enum Request {
    ListTools {
        reply: oneshot::Sender<Result<ListToolsResult>>,
    },
    CallTool {
        params: CallToolRequestParam,
        reply: oneshot::Sender<Result<CallToolResult>>,
    },
    ListResources {
        reply: oneshot::Sender<Result<ListResourcesResult>>,
    },
    ReadResource {
        params: ReadResourceRequestParam,
        reply: oneshot::Sender<Result<ReadResourceResult>>,
    },
    ListPrompts {
        reply: oneshot::Sender<Result<ListPromptsResult>>,
    },
    GetPrompt {
        params: GetPromptRequestParam,
        reply: oneshot::Sender<Result<GetPromptResult>>,
    },
    Shutdown,
}

/// A live, supervised connection to one configured child.
pub struct OutboundConnection {
    name: String,
    queue: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
    tags: watch::Sender<Vec<String>>,
    _actor: tokio::task::JoinHandle<()>,
}

impl OutboundConnection {
    pub fn spawn(config: Arc<ChildConfig>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (tags_tx, _tags_rx) = watch::channel(config.tags.clone());
        let name = config.name.clone();
        let actor = tokio::spawn(run_actor(config, rx, state_tx));
        Self {
            name,
            queue: tx,
            state: state_rx,
            tags: tags_tx,
            _actor: actor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Ready)
    }

    /// Metadata-only tag update (spec.md §4 C1 `setTags`). Does not touch the
    /// live transport; only affects how this connection is reported to
    /// callers that read tags straight off the connection rather than the
    /// resolver's own config copy.
    pub fn set_tags(&self, tags: Vec<String>) {
        let _ = self.tags.send(tags);
    }

    pub fn tags(&self) -> Vec<String> {
        self.tags.borrow().clone()
    }

    pub async fn list_tools(&self, cancellation: CancellationToken) -> Result<Vec<Tool>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue
            .send(Request::ListTools { reply: reply_tx })
            .await
            .map_err(|_| anyhow!("connection '{}' actor has shut down", self.name))?;
        tokio::select! {
            result = reply_rx => result
                .map_err(|_| anyhow!("connection '{}' dropped the reply channel", self.name))?
                .map(|r| r.tools),
            _ = cancellation.cancelled() => Err(anyhow!("tools/list to '{}' cancelled", self.name)),
        }
    }

    pub async fn call_tool(
        &self,
        params: CallToolRequestParam,
        cancellation: CancellationToken,
    ) -> Result<CallToolResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue
            .send(Request::CallTool {
                params,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow!("connection '{}' actor has shut down", self.name))?;
        tokio::select! {
            result = reply_rx => result
                .map_err(|_| anyhow!("connection '{}' dropped the reply channel", self.name))?,
            _ = cancellation.cancelled() => Err(anyhow!("tools/call to '{}' cancelled", self.name)),
        }
    }

    pub async fn list_resources(&self, cancellation: CancellationToken) -> Result<Vec<Resource>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue
            .send(Request::ListResources { reply: reply_tx })
            .await
            .map_err(|_| anyhow!("connection '{}' actor has shut down", self.name))?;
        tokio::select! {
            result = reply_rx => result
                .map_err(|_| anyhow!("connection '{}' dropped the reply channel", self.name))?
                .map(|r| r.resources),
            _ = cancellation.cancelled() => Err(anyhow!("resources/list to '{}' cancelled", self.name)),
        }
    }

    pub async fn read_resource(
        &self,
        params: ReadResourceRequestParam,
        cancellation: CancellationToken,
    ) -> Result<ReadResourceResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue
            .send(Request::ReadResource { params, reply: reply_tx })
            .await
            .map_err(|_| anyhow!("connection '{}' actor has shut down", self.name))?;
        tokio::select! {
            result = reply_rx => result
                .map_err(|_| anyhow!("connection '{}' dropped the reply channel", self.name))?,
            _ = cancellation.cancelled() => Err(anyhow!("resources/read to '{}' cancelled", self.name)),
        }
    }

    pub async fn list_prompts(&self, cancellation: CancellationToken) -> Result<Vec<Prompt>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue
            .send(Request::ListPrompts { reply: reply_tx })
            .await
            .map_err(|_| anyhow!("connection '{}' actor has shut down", self.name))?;
        tokio::select! {
            result = reply_rx => result
                .map_err(|_| anyhow!("connection '{}' dropped the reply channel", self.name))?
                .map(|r| r.prompts),
            _ = cancellation.cancelled() => Err(anyhow!("prompts/list to '{}' cancelled", self.name)),
        }
    }

    pub async fn get_prompt(
        &self,
        params: GetPromptRequestParam,
        cancellation: CancellationToken,
    ) -> Result<GetPromptResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue
            .send(Request::GetPrompt { params, reply: reply_tx })
            .await
            .map_err(|_| anyhow!("connection '{}' actor has shut down", self.name))?;
        tokio::select! {
            result = reply_rx => result
                .map_err(|_| anyhow!("connection '{}' dropped the reply channel", self.name))?,
            _ = cancellation.cancelled() => Err(anyhow!("prompts/get to '{}' cancelled", self.name)),
        }
    }

    /// Tear the connection down permanently (spec.md §4 C1 `close`).
    pub async fn close(&self) {
        let _ = self.queue.send(Request::Shutdown).await;
    }

    /// Same effect as `close()`. The actor has no resumable "disconnected
    /// but reconnectable" state distinct from a full teardown, so the two
    /// names are kept as aliases to match the C1 contract's vocabulary.
    pub async fn disconnect(&self) {
        self.close().await;
    }
}

enum Backend {
    Stdio(RunningService<RoleClient, ()>),
    Remote(RunningService<RoleClient, ()>),
}

impl Backend {
    async fn list_tools(&self) -> Result<ListToolsResult> {
        match self {
            Backend::Stdio(svc) | Backend::Remote(svc) => svc
                .list_tools(Default::default())
                .await
                .context("tools/list request failed"),
        }
    }

    async fn call_tool(&self, params: CallToolRequestParam) -> Result<CallToolResult> {
        match self {
            Backend::Stdio(svc) | Backend::Remote(svc) => {
                svc.call_tool(params).await.context("tools/call request failed")
            }
        }
    }

    async fn list_resources(&self) -> Result<ListResourcesResult> {
        match self {
            Backend::Stdio(svc) | Backend::Remote(svc) => svc
                .list_resources(Default::default())
                .await
                .context("resources/list request failed"),
        }
    }

    async fn read_resource(&self, params: ReadResourceRequestParam) -> Result<ReadResourceResult> {
        match self {
            Backend::Stdio(svc) | Backend::Remote(svc) => {
                svc.read_resource(params).await.context("resources/read request failed")
            }
        }
    }

    async fn list_prompts(&self) -> Result<ListPromptsResult> {
        match self {
            Backend::Stdio(svc) | Backend::Remote(svc) => svc
                .list_prompts(Default::default())
                .await
                .context("prompts/list request failed"),
        }
    }

    async fn get_prompt(&self, params: GetPromptRequestParam) -> Result<GetPromptResult> {
        match self {
            Backend::Stdio(svc) | Backend::Remote(svc) => {
                svc.get_prompt(params).await.context("prompts/get request failed")
            }
        }
    }

    /// Health probe (spec.md §4 C1): an empty `tools/list`, the fallback the
    /// spec names when a child doesn't support a dedicated `ping`.
    async fn probe(&self) -> Result<()> {
        self.list_tools().await.map(|_| ())
    }

    async fn cancel(self) {
        match self {
            Backend::Stdio(svc) | Backend::Remote(svc) => {
                let _ = svc.cancel().await;
            }
        }
    }
}

async fn connect(config: &ChildConfig) -> Result<Backend> {
    match &config.transport {
        ChildTransport::Stdio { command, args, cwd, env } => {
            let command = command.clone();
            let args = args.clone();
            let cwd = cwd.clone();
            let env_vars = env.env.clone();
            let child = TokioChildProcess::new(Command::new(&command).configure(|cmd| {
                cmd.args(&args);
                if let Some(cwd) = &cwd {
                    cmd.current_dir(cwd);
                }
                if !env.inherit_parent_env {
                    cmd.env_clear();
                    for key in &env.env_filter {
                        if let Ok(value) = std::env::var(key) {
                            cmd.env(key, value);
                        }
                    }
                }
                for (key, value) in &env_vars {
                    cmd.env(key, value);
                }
            }))
            .with_context(|| format!("spawning stdio child process '{command}'"))?;
            let service = ().serve(child).await.context("stdio MCP handshake failed")?;
            Ok(Backend::Stdio(service))
        }
        ChildTransport::Http { url, headers, oauth } => {
            let client = remote_http_client(headers, oauth)?;
            let transport_config = StreamableHttpClientTransportConfig::with_uri(url.as_str());
            let transport = StreamableHttpClientTransport::with_client(client, transport_config);
            match ().serve(transport).await {
                Ok(service) => Ok(Backend::Remote(service)),
                Err(error) if oauth.is_some() && looks_like_auth_failure(&error) => {
                    Err(ProxyError::AuthRequired { child: config.name.clone() }.into())
                }
                Err(error) => Err(anyhow::Error::new(error)
                    .context(format!("failed to connect to HTTP MCP server '{}' at {url}", config.name))),
            }
        }
        ChildTransport::Sse { url, headers, oauth } => {
            let client = remote_http_client(headers, oauth)?;
            let sse_config = SseClientConfig {
                sse_endpoint: url.clone().into(),
                ..Default::default()
            };
            let transport = SseClientTransport::start_with_client(client, sse_config)
                .await
                .with_context(|| format!("failed to connect to SSE MCP server '{}' at {url}", config.name))?;
            match ().serve(transport).await {
                Ok(service) => Ok(Backend::Remote(service)),
                Err(error) if oauth.is_some() && looks_like_auth_failure(&error) => {
                    Err(ProxyError::AuthRequired { child: config.name.clone() }.into())
                }
                Err(error) => Err(anyhow::Error::new(error)
                    .context(format!("failed to initialize SSE MCP session '{}' at {url}", config.name))),
            }
        }
    }
}

/// Best-effort detection of an auth-required failure: the handshake error
/// surface doesn't carry a typed HTTP status this far up, so this matches
/// on the handful of phrasings a 401/403 response tends to produce.
fn looks_like_auth_failure(error: &dyn std::error::Error) -> bool {
    let text = error.to_string().to_ascii_lowercase();
    text.contains("401") || text.contains("403") || text.contains("unauthorized") || text.contains("forbidden")
}

/// `headers` carries any pre-obtained auth values (bearer tokens, API keys);
/// acquiring those values via an OAuth 2.1 flow is the external authorization
/// server's job (out of scope here — see spec.md §1), so `oauth` is only
/// consulted for a statically configured client secret to use as a bearer
/// token, never for an interactive grant.
fn remote_http_client(
    headers: &std::collections::HashMap<String, String>,
    oauth: &Option<mcphub_config::OAuthConfig>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
    let mut header_map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let name = reqwest::header::HeaderName::try_from(key.as_str())
            .with_context(|| format!("invalid header name '{key}'"))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for '{key}'"))?;
        header_map.insert(name, value);
    }
    if let Some(token) = bearer_token(oauth) {
        if !header_map.contains_key(reqwest::header::AUTHORIZATION) {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                .context("invalid bearer token")?;
            header_map.insert(reqwest::header::AUTHORIZATION, value);
        }
    }
    builder = builder.default_headers(header_map);
    builder.build().context("building HTTP client for remote MCP child")
}

fn bearer_token(oauth: &Option<mcphub_config::OAuthConfig>) -> Option<String> {
    oauth.as_ref().and_then(|o| o.client_secret.clone())
}

async fn run_actor(
    config: Arc<ChildConfig>,
    mut queue: mpsc::Receiver<Request>,
    state: watch::Sender<ConnectionState>,
) {
    if config.disabled {
        let _ = state.send(ConnectionState::Disabled);
        drain_with_error(&mut queue, &config.name).await;
        return;
    }

    let mut attempts: u32 = 0;
    let mut last_healthy_at = Instant::now();

    'connect: loop {
        let _ = state.send(ConnectionState::Connecting);
        let backend = match connect(&config).await {
            Ok(backend) => backend,
            Err(error) => {
                if matches!(error.downcast_ref::<ProxyError>(), Some(ProxyError::AuthRequired { .. })) {
                    tracing::warn!(child = %config.name, "child requires OAuth; suspending restarts");
                    let _ = state.send(ConnectionState::AwaitingOAuth);
                    drain_with_error(&mut queue, &config.name).await;
                    return;
                }
                tracing::warn!(child = %config.name, error = %error, "connection attempt failed");
                if !config.restart_on_exit || attempts >= config.max_restarts {
                    let _ = state.send(ConnectionState::Failed);
                    drain_with_error(&mut queue, &config.name).await;
                    return;
                }
                attempts += 1;
                let _ = state.send(ConnectionState::Restarting);
                backoff_sleep(attempts).await;
                continue 'connect;
            }
        };
        let _ = state.send(ConnectionState::Ready);
        attempts = 0;
        last_healthy_at = Instant::now();

        loop {
            tokio::select! {
                maybe_request = queue.recv() => {
                    let Some(request) = maybe_request else {
                        backend.cancel().await;
                        return;
                    };
                    match request {
                        Request::ListTools { reply } => {
                            let _ = reply.send(backend.list_tools().await);
                        }
                        Request::CallTool { params, reply } => {
                            let _ = reply.send(backend.call_tool(params).await);
                        }
                        Request::ListResources { reply } => {
                            let _ = reply.send(backend.list_resources().await);
                        }
                        Request::ReadResource { params, reply } => {
                            let _ = reply.send(backend.read_resource(params).await);
                        }
                        Request::ListPrompts { reply } => {
                            let _ = reply.send(backend.list_prompts().await);
                        }
                        Request::GetPrompt { params, reply } => {
                            let _ = reply.send(backend.get_prompt(params).await);
                        }
                        Request::Shutdown => {
                            backend.cancel().await;
                            let _ = state.send(ConnectionState::Closed);
                            return;
                        }
                    }

                    if last_healthy_at.elapsed() >= HEALTHY_RESET_AFTER {
                        attempts = 0;
                        last_healthy_at = Instant::now();
                    }
                }
                _ = tokio::time::sleep(HEALTH_PROBE_INTERVAL) => {
                    if let Err(error) = backend.probe().await {
                        tracing::warn!(child = %config.name, error = %error, "health probe failed");
                        let _ = state.send(ConnectionState::Failed);
                        backend.cancel().await;
                        if !config.restart_on_exit || attempts >= config.max_restarts {
                            drain_with_error(&mut queue, &config.name).await;
                            return;
                        }
                        attempts += 1;
                        let _ = state.send(ConnectionState::Restarting);
                        backoff_sleep(attempts).await;
                        continue 'connect;
                    }
                    last_healthy_at = Instant::now();
                }
            }
        }
    }
}

async fn drain_with_error(queue: &mut mpsc::Receiver<Request>, child: &str) {
    while let Some(request) = queue.recv().await {
        let error = || anyhow!("connection to '{child}' permanently failed");
        match request {
            Request::ListTools { reply } => {
                let _ = reply.send(Err(error()));
            }
            Request::CallTool { reply, .. } => {
                let _ = reply.send(Err(error()));
            }
            Request::ListResources { reply } => {
                let _ = reply.send(Err(error()));
            }
            Request::ReadResource { reply, .. } => {
                let _ = reply.send(Err(error()));
            }
            Request::ListPrompts { reply } => {
                let _ = reply.send(Err(error()));
            }
            Request::GetPrompt { reply, .. } => {
                let _ = reply.send(Err(error()));
            }
            Request::Shutdown => return,
        }
    }
}

async fn backoff_sleep(attempt: u32) {
    let base = RESTART_BACKOFF_INITIAL_MS.saturating_mul(1u64 << attempt.min(20));
    let capped = base.min(RESTART_BACKOFF_MAX_MS);
    let jitter = rand::thread_rng().gen_range(0..=capped / 4 + 1);
    tokio::time::sleep(Duration::from_millis(capped + jitter)).await;
}

/// Serializes concurrent writers against a single connection slot — used by
/// the template instance pool (C2) when multiple sessions briefly race to
/// create the same pooled instance.
pub type ConnectionMutex = Mutex<Option<Arc<OutboundConnection>>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_cap_ignoring_jitter() {
        let base = RESTART_BACKOFF_INITIAL_MS.saturating_mul(1u64 << 30u32.min(20));
        assert!(base.min(RESTART_BACKOFF_MAX_MS) <= RESTART_BACKOFF_MAX_MS);
    }
}
