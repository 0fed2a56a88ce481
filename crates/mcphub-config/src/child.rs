//! Per-child configuration (spec.md §3 `ChildConfig`).
//!
//! A child is one MCP "tools/resources/prompts" server the proxy aggregates.
//! Transport is tagged (`type = "stdio" | "http" | "sse"`) but can be
//! inferred from the presence of `command` / `url` for configs that omit it.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Allowed characters in a child name: `[A-Za-z0-9_-]`.
pub fn is_valid_child_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Stdio-only environment inheritance policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StdioEnv {
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Only inherit parent-process variables whose name matches one of these
    /// (exact-match) entries. Empty = inherit nothing beyond `env`.
    #[serde(default)]
    pub env_filter: Vec<String>,
    #[serde(default)]
    pub inherit_parent_env: bool,
}

/// OAuth block for http/sse children (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OAuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub auto_register: bool,
    pub redirect_url: Option<String>,
}

/// Transport-specific configuration, tagged by `type`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ChildTransport {
    #[serde(rename = "stdio")]
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(flatten)]
        env: StdioEnv,
    },
    #[serde(rename = "http")]
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        oauth: Option<OAuthConfig>,
    },
    #[serde(rename = "sse")]
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        oauth: Option<OAuthConfig>,
    },
}

impl ChildTransport {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
        }
    }

    pub fn is_stdio(&self) -> bool {
        matches!(self, Self::Stdio { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Http { .. } | Self::Sse { .. })
    }
}

/// Optional template block (§3): marks a `ChildConfig` as a template to be
/// expanded per-session rather than connected to directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TemplateOptions {
    #[serde(default)]
    pub shareable: bool,
    #[serde(default)]
    pub per_client: bool,
    /// Idle timeout in milliseconds before an unreferenced instance is
    /// evicted. `None` means "use the pool-level default".
    pub idle_timeout_ms: Option<u64>,
}

impl TemplateOptions {
    pub fn idle_timeout(&self, default: Duration) -> Duration {
        self.idle_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
    }
}

/// A single named child, as loaded from the config file (spec.md §3).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChildConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: ChildTransport,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    /// Deprecated alias for `request_timeout`; kept for backward compatible reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub restart_on_exit: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateOptions>,
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_delay_ms() -> u64 {
    100
}

impl ChildConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// `request_timeout`, falling back to the deprecated `timeout` field.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(self.timeout.unwrap_or(0)))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn is_template(&self) -> bool {
        self.template.is_some()
    }

    pub fn is_shareable_template(&self) -> bool {
        self.template.as_ref().is_some_and(|t| t.shareable) && !self.is_per_client_template()
    }

    pub fn is_per_client_template(&self) -> bool {
        self.template.as_ref().is_some_and(|t| t.per_client)
    }

    /// Validate invariants from spec.md §3. Does not validate template
    /// placeholder syntax — that's `mcphub_core::template`'s job.
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_child_name(&self.name) {
            return Err(format!(
                "child '{}': name must be non-empty and match [A-Za-z0-9_-]",
                self.name
            ));
        }
        if self.tags.iter().any(|t| t.is_empty()) {
            return Err(format!("child '{}': tags must be non-empty strings", self.name));
        }
        Ok(())
    }
}

/// Custom deserializer implementing type inference: `command` present implies
/// stdio, `url` present implies http, absent `type` with neither is an error.
impl<'de> Deserialize<'de> for ChildConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            name: String,
            #[serde(rename = "type")]
            transport_type: Option<String>,
            command: Option<String>,
            #[serde(default)]
            args: Vec<String>,
            cwd: Option<String>,
            #[serde(default)]
            env: HashMap<String, String>,
            #[serde(default)]
            env_filter: Vec<String>,
            #[serde(default)]
            inherit_parent_env: bool,
            url: Option<String>,
            #[serde(default)]
            headers: HashMap<String, String>,
            oauth: Option<OAuthConfig>,
            #[serde(default)]
            tags: Vec<String>,
            #[serde(default)]
            disabled: bool,
            timeout: Option<u64>,
            #[serde(default = "default_connection_timeout_ms")]
            connection_timeout_ms: u64,
            #[serde(default = "default_request_timeout_ms")]
            request_timeout_ms: u64,
            #[serde(default)]
            restart_on_exit: bool,
            #[serde(default = "default_max_restarts")]
            max_restarts: u32,
            #[serde(default = "default_restart_delay_ms")]
            restart_delay_ms: u64,
            template: Option<TemplateOptions>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let inferred_type = raw.transport_type.clone().or_else(|| {
            if raw.command.is_some() {
                Some("stdio".to_string())
            } else if raw.url.is_some() {
                Some("http".to_string())
            } else {
                None
            }
        });

        let transport = match inferred_type.as_deref() {
            Some("stdio") => {
                let command = raw.command.ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "child '{}': stdio requires 'command'",
                        raw.name
                    ))
                })?;
                ChildTransport::Stdio {
                    command,
                    args: raw.args,
                    cwd: raw.cwd,
                    env: StdioEnv {
                        env: raw.env,
                        env_filter: raw.env_filter,
                        inherit_parent_env: raw.inherit_parent_env,
                    },
                }
            }
            Some("http") => {
                let url = raw.url.ok_or_else(|| {
                    serde::de::Error::custom(format!("child '{}': http requires 'url'", raw.name))
                })?;
                ChildTransport::Http {
                    url,
                    headers: raw.headers,
                    oauth: raw.oauth,
                }
            }
            Some("sse") => {
                let url = raw.url.ok_or_else(|| {
                    serde::de::Error::custom(format!("child '{}': sse requires 'url'", raw.name))
                })?;
                ChildTransport::Sse {
                    url,
                    headers: raw.headers,
                    oauth: raw.oauth,
                }
            }
            Some(other) => {
                return Err(serde::de::Error::custom(format!(
                    "child '{}': unknown type '{other}' (expected stdio, http, sse)",
                    raw.name
                )));
            }
            None => {
                return Err(serde::de::Error::custom(format!(
                    "child '{}': missing 'type'; add type=\"stdio\" with 'command' or \
                     type=\"http\"/\"sse\" with 'url'",
                    raw.name
                )));
            }
        };

        let config = ChildConfig {
            name: raw.name,
            transport,
            tags: raw.tags,
            disabled: raw.disabled,
            timeout: raw.timeout,
            connection_timeout_ms: raw.connection_timeout_ms,
            request_timeout_ms: raw.request_timeout_ms,
            restart_on_exit: raw.restart_on_exit,
            max_restarts: raw.max_restarts,
            restart_delay_ms: raw.restart_delay_ms,
            template: raw.template,
        };

        config.validate().map_err(serde::de::Error::custom)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio(name: &str) -> ChildConfig {
        ChildConfig {
            name: name.to_string(),
            transport: ChildTransport::Stdio {
                command: "npx".to_string(),
                args: vec![],
                cwd: None,
                env: StdioEnv::default(),
            },
            tags: vec![],
            disabled: false,
            timeout: None,
            connection_timeout_ms: default_connection_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            restart_on_exit: false,
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
            template: None,
        }
    }

    #[test]
    fn infers_stdio_from_command() {
        let json = serde_json::json!({"name": "a", "command": "echo"});
        let cfg: ChildConfig = serde_json::from_value(json).unwrap();
        assert!(cfg.transport.is_stdio());
    }

    #[test]
    fn infers_http_from_url() {
        let json = serde_json::json!({"name": "a", "url": "https://example.com"});
        let cfg: ChildConfig = serde_json::from_value(json).unwrap();
        assert!(cfg.transport.is_remote());
    }

    #[test]
    fn rejects_missing_type_and_command_and_url() {
        let json = serde_json::json!({"name": "a"});
        let err = serde_json::from_value::<ChildConfig>(json).unwrap_err();
        assert!(err.to_string().contains("missing 'type'"));
    }

    #[test]
    fn rejects_invalid_name() {
        let json = serde_json::json!({"name": "bad name!", "command": "echo"});
        let err = serde_json::from_value::<ChildConfig>(json).unwrap_err();
        assert!(err.to_string().contains("must be non-empty"));
    }

    #[test]
    fn explicit_type_wins_over_inference() {
        let json = serde_json::json!({
            "name": "a",
            "type": "http",
            "command": "ignored",
            "url": "https://example.com",
        });
        let cfg: ChildConfig = serde_json::from_value(json).unwrap();
        assert!(cfg.transport.is_remote());
    }

    #[test]
    fn per_client_template_is_not_shareable() {
        let mut cfg = stdio("a");
        cfg.template = Some(TemplateOptions {
            shareable: true,
            per_client: true,
            idle_timeout_ms: None,
        });
        assert!(cfg.is_per_client_template());
        assert!(!cfg.is_shareable_template());
    }
}
