//! Command-line surface: `mcphub serve` and `mcphub proxy`.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mcphub", version, about = "Aggregating MCP proxy")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the long-running HTTP proxy that aggregates every configured child.
    Serve {
        /// Path to the config file; overrides --config-dir and the XDG default.
        #[arg(long, conflicts_with = "config_dir")]
        config: Option<String>,

        /// Directory containing mcphub.json; overrides the XDG default.
        #[arg(long)]
        config_dir: Option<String>,

        /// Inbound HTTP bind host. Overridden by $MCPHUB_HOST if set.
        #[arg(long)]
        host: Option<String>,

        /// Inbound HTTP bind port. Overridden by $MCPHUB_PORT if set.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Forward a local stdio MCP session into a running `serve` instance.
    Proxy {
        /// Path to the config file; overrides --config-dir and the XDG default.
        #[arg(long, conflicts_with = "config_dir")]
        config: Option<String>,

        /// Directory containing mcphub.json; overrides the XDG default.
        #[arg(long)]
        config_dir: Option<String>,
    },
}
