//! Child server configuration: on-disk shape, types, and path resolution
//! for the aggregating MCP proxy.

pub mod child;
pub mod file;
pub mod paths;

pub use child::{
    ChildConfig, ChildTransport, OAuthConfig, StdioEnv, TemplateOptions, is_valid_child_name,
};
pub use file::ConfigFile;
pub use paths::{APP_NAME, CONFIG_FILE_NAME, pid_file_path, resolve_config_path, session_store_dir};
