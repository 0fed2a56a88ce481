use clap::Parser;

mod cli;

use cli::{Cli, Commands};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 7825;

/// Exit code for a configuration or startup error (spec.md §6).
const EXIT_STARTUP_ERROR: i32 = 1;
/// Exit code for an unrecoverable runtime error.
const EXIT_RUNTIME_ERROR: i32 = 2;

/// Distinguishes a failure that happened before the proxy ever started
/// serving (config resolution, bind, initial child connections) from one
/// that happened after — the two map to different exit codes (spec.md §6).
/// Only the outermost entry point below translates either variant into a
/// `std::process::exit` call; every command handler just returns this.
enum CliError {
    Startup(anyhow::Error),
    Runtime(anyhow::Error),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Startup(_) => EXIT_STARTUP_ERROR,
            CliError::Runtime(_) => EXIT_RUNTIME_ERROR,
        }
    }

    fn inner(&self) -> &anyhow::Error {
        match self {
            CliError::Startup(error) | CliError::Runtime(error) => error,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { config, config_dir, host, port } => run_serve(config, config_dir, host, port).await,
        Commands::Proxy { config, config_dir } => run_proxy(config, config_dir).await,
    };

    if let Err(error) = result {
        tracing::error!(error = %error.inner(), "mcphub exited with an error");
        eprintln!("error: {:#}", error.inner());
        std::process::exit(error.exit_code());
    }
}

async fn run_serve(
    config: Option<String>,
    config_dir: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<(), CliError> {
    let config_path = mcphub_config::resolve_config_path(config.as_deref(), config_dir.as_deref());

    let host = std::env::var("MCPHUB_HOST")
        .ok()
        .or(host)
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = std::env::var("MCPHUB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .or(port)
        .unwrap_or(DEFAULT_PORT);

    let options = mcphub_hub::ServeOptions { config_path, host, port };
    // `handle_serve_command` bootstraps (startup-phase) then runs until a
    // shutdown signal; any error it returns comes from the run loop, since
    // bootstrap failures here would have aborted before `serve` could do
    // anything else. Treat it as a runtime error.
    mcphub_hub::handle_serve_command(options).await.map_err(CliError::Runtime)
}

async fn run_proxy(config: Option<String>, config_dir: Option<String>) -> Result<(), CliError> {
    let config_path = mcphub_config::resolve_config_path(config.as_deref(), config_dir.as_deref());
    let options = mcphub_hub::ProxyOptions { config_path };
    // The shim's only failure modes are "no running proxy found" and
    // "couldn't start the local stdio session" — both precede any useful
    // work, so they're startup errors.
    mcphub_hub::handle_proxy_command(options).await.map_err(CliError::Startup)
}
