//! Process entry points: `serve` (long-running HTTP proxy daemon) and
//! `proxy` (a stdio shim that forwards a local stdio MCP session into a
//! running `serve` instance, discovered via the PID file — spec.md §6).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use mcphub_config::ChildConfig;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ListToolsResult, PaginatedRequestParam, ServerCapabilities,
    ServerInfo,
};
use rmcp::service::{RequestContext, ServiceExt};
use rmcp::transport::io::stdio;
use rmcp::transport::{SseServer, sse_server::SseServerConfig};
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::app::Application;
use crate::connection::OutboundConnection;

const SSE_PATH: &str = "/";
const SSE_POST_PATH: &str = "/message";
const DEFAULT_MAX_REQUESTS_PER_SEC: u32 = 200;
const DEFAULT_MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Options accepted by the `serve` CLI subcommand.
pub struct ServeOptions {
    pub config_path: PathBuf,
    pub host: String,
    pub port: u16,
}

/// Start the long-running HTTP proxy daemon: bootstrap the application,
/// bind the streamable-http inbound endpoint, write the PID file, and run
/// until a shutdown signal arrives.
pub async fn handle_serve_command(options: ServeOptions) -> Result<()> {
    let app = Application::bootstrap(options.config_path).await?;
    app.orchestrator.wait_for_minimum_servers().await;

    let http = HttpEndpoint::start(&options.host, options.port, app.router.clone()).await?;
    let pid_file = PidFileGuard::write(app.config_dir(), &http.addr).await?;

    tracing::info!(addr = %http.addr, "mcphub proxy listening");

    shutdown_signal().await;
    tracing::info!("shutdown signal received; draining outbound connections");

    http.shutdown().await;
    app.shutdown().await;
    pid_file.cleanup().await;

    Ok(())
}

/// Options accepted by the `proxy` CLI subcommand.
pub struct ProxyOptions {
    pub config_path: PathBuf,
}

/// The stdio shim: discover a running `serve` instance via its PID file and
/// forward a single stdio MCP session into it over HTTP.
pub async fn handle_proxy_command(options: ProxyOptions) -> Result<()> {
    let config_dir = options
        .config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let record = discover_running_proxy(&config_dir)
        .await
        .context("no running mcphub proxy found; start one with `mcphub serve` first")?;

    let remote = Arc::new(ChildConfig {
        name: "mcphub-proxy".to_string(),
        transport: mcphub_config::ChildTransport::Http {
            url: record.url.clone(),
            headers: Default::default(),
            oauth: None,
        },
        tags: vec![],
        disabled: false,
        timeout: None,
        connection_timeout_ms: 10_000,
        request_timeout_ms: 30_000,
        restart_on_exit: true,
        max_restarts: 5,
        restart_delay_ms: 200,
        template: None,
    });
    let connection = Arc::new(OutboundConnection::spawn(remote));

    let shim = StdioShim { connection: Arc::clone(&connection) };
    let service = shim.serve(stdio()).await.context("failed to start stdio MCP session")?;
    service.waiting().await.context("stdio MCP session ended with an error")?;
    connection.close().await;
    Ok(())
}

/// Forwards every northbound call directly to the single remote connection;
/// unlike `ProxyRouter` there's no namespacing or tag filtering to do here
/// since the upstream `serve` instance already aggregated its children.
#[derive(Clone)]
struct StdioShim {
    connection: Arc<OutboundConnection>,
}

impl ServerHandler for StdioShim {
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let cancellation = CancellationToken::new();
        let tools = self
            .connection
            .list_tools(cancellation)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let cancellation = CancellationToken::new();
        self.connection
            .call_tool(request, cancellation)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))
    }

    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.server_info.name = "mcphub-proxy-shim".to_string();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info
    }
}

struct HttpEndpoint {
    addr: SocketAddr,
    shutdown: CancellationToken,
    server_task: tokio::task::JoinHandle<()>,
}

impl HttpEndpoint {
    async fn start(host: &str, port: u16, router: crate::proxy::ProxyRouter) -> Result<Self> {
        let bind_addr = format!("{host}:{port}")
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid mcphub HTTP bind address '{host}:{port}'"))?;

        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind mcphub HTTP endpoint at {bind_addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("failed to resolve local mcphub HTTP address")?;

        let shutdown = CancellationToken::new();
        let (sse_server, sse_router) = SseServer::new(SseServerConfig {
            bind: local_addr,
            sse_path: SSE_PATH.to_string(),
            post_path: SSE_POST_PATH.to_string(),
            ct: shutdown.clone(),
            sse_keep_alive: None,
        });
        let _server_ct = sse_server.with_service_directly(move || router.clone());

        let limiter = Arc::new(Mutex::new(TokenBucket::new(DEFAULT_MAX_REQUESTS_PER_SEC)));
        let app = sse_router
            .layer(DefaultBodyLimit::max(DEFAULT_MAX_REQUEST_BODY_BYTES))
            .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));

        let server_shutdown = shutdown.clone();
        let server_task = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    server_shutdown.cancelled().await;
                })
                .await
            {
                tracing::warn!(error = %error, "mcphub HTTP server stopped with error");
            }
        });

        Ok(Self {
            addr: local_addr,
            shutdown,
            server_task,
        })
    }

    async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(error) = self.server_task.await {
            tracing::debug!(error = %error, "mcphub HTTP server join failed");
        }
    }
}

/// Rate-limits the inbound HTTP boundary. Generalizes the teacher's
/// Unix-socket-level `ConnectionPolicy`/`TokenBucket` (which guarded its
/// control-socket frames) to guard the streamable-http transport instead.
#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_requests_per_sec: u32) -> Self {
        let refill_per_sec = f64::from(max_requests_per_sec.max(1));
        Self {
            capacity: refill_per_sec,
            tokens: refill_per_sec,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

async fn rate_limit_middleware(
    State(limiter): State<Arc<Mutex<TokenBucket>>>,
    request: Request,
    next: Next,
) -> Response {
    let allowed = limiter.lock().await.try_consume();
    if !allowed {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }
    next.run(request).await
}

/// Exact on-disk shape required by spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PidFileRecord {
    pid: u32,
    url: String,
    port: u16,
    host: String,
    transport: String,
    #[serde(rename = "startedAt")]
    started_at: u64,
    #[serde(rename = "configDir")]
    config_dir: String,
}

struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    async fn write(config_dir: &Path, addr: &SocketAddr) -> Result<Self> {
        tokio::fs::create_dir_all(config_dir)
            .await
            .with_context(|| format!("creating config directory {}", config_dir.display()))?;
        let path = config_dir.join("server.pid");
        let record = PidFileRecord {
            pid: std::process::id(),
            url: format!("http://{addr}{SSE_PATH}"),
            port: addr.port(),
            host: addr.ip().to_string(),
            transport: "streamable-http".to_string(),
            started_at: now_epoch_ms(),
            config_dir: config_dir.display().to_string(),
        };
        let text = serde_json::to_string_pretty(&record).context("serializing PID file")?;
        tokio::fs::write(&path, text)
            .await
            .with_context(|| format!("writing PID file {}", path.display()))?;
        Ok(Self { path })
    }

    async fn cleanup(self) {
        if tokio::fs::metadata(&self.path).await.is_ok() {
            if let Err(error) = tokio::fs::remove_file(&self.path).await {
                tracing::warn!(path = %self.path.display(), error = %error, "failed to remove PID file");
            }
        }
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Read `<configDir>/server.pid` and confirm the recorded process is still
/// alive before trusting its URL.
async fn discover_running_proxy(config_dir: &Path) -> Result<PidFileRecord> {
    let path = config_dir.join("server.pid");
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading PID file {}", path.display()))?;
    let record: PidFileRecord =
        serde_json::from_str(&text).with_context(|| format!("parsing PID file {}", path.display()))?;
    if !process_is_alive(record.pid) {
        bail!("PID file {} refers to a process that is no longer running", path.display());
    }
    Ok(record)
}

fn process_is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs no action beyond existence/permission checks.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
        _ = sighup.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_refills_over_time() {
        let mut limiter = TokenBucket::new(2);
        assert!(limiter.try_consume());
        assert!(limiter.try_consume());
        assert!(!limiter.try_consume());
        std::thread::sleep(Duration::from_millis(600));
        assert!(limiter.try_consume());
    }

    #[tokio::test]
    async fn pid_file_round_trips_through_discover() {
        let dir = tempfile::tempdir().unwrap();
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let guard = PidFileGuard::write(dir.path(), &addr).await.unwrap();
        let record = discover_running_proxy(dir.path()).await.unwrap();
        assert_eq!(record.port, 4000);
        assert_eq!(record.pid, std::process::id());
        guard.cleanup().await;
        assert!(discover_running_proxy(dir.path()).await.is_err());
    }

    #[test]
    fn current_process_is_detected_alive() {
        assert!(process_is_alive(std::process::id()));
    }
}
