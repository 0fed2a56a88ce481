//! On-disk config file shape (spec.md §6): `{"mcpServers": {"<name>": ChildConfig}}`.
//!
//! Unknown top-level keys are preserved on round-trip so other tools can
//! share the same file without the proxy clobbering fields it doesn't know
//! about (e.g. editor-specific settings living alongside `mcpServers`).

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::child::ChildConfig;

/// A parsed config file: typed `mcpServers` plus any other top-level keys
/// preserved opaquely.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub servers: HashMap<String, ChildConfig>,
    pub extra: Map<String, Value>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut root: Value =
            serde_json::from_str(text).context("config file is not valid JSON")?;
        let Value::Object(mut map) = root.take() else {
            bail!("config file must be a JSON object");
        };

        let servers_value = map.remove("mcpServers").unwrap_or(Value::Object(Map::new()));
        let Value::Object(raw_servers) = servers_value else {
            bail!("'mcpServers' must be a JSON object mapping name to server config");
        };

        let mut servers = HashMap::with_capacity(raw_servers.len());
        for (name, mut value) in raw_servers {
            if let Value::Object(ref mut obj) = value {
                obj.insert("name".to_string(), Value::String(name.clone()));
            }
            let child: ChildConfig = serde_json::from_value(value)
                .with_context(|| format!("invalid config for server '{name}'"))?;
            servers.insert(name, child);
        }

        Ok(ConfigFile {
            servers,
            extra: map,
        })
    }

    /// Serialize back to JSON, re-attaching preserved unknown top-level keys.
    pub fn to_json(&self) -> Result<Value> {
        let mut map = self.extra.clone();
        let mut servers = Map::with_capacity(self.servers.len());
        for (name, child) in &self.servers {
            let mut value = serde_json::to_value(ChildConfigDto::from(child))
                .context("serializing server config")?;
            if let Value::Object(obj) = &mut value {
                obj.remove("name");
            }
            servers.insert(name.clone(), value);
        }
        map.insert("mcpServers".to_string(), Value::Object(servers));
        Ok(Value::Object(map))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        let text = serde_json::to_string_pretty(&json).context("serializing config file")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
        std::fs::write(path, text).with_context(|| format!("writing config file {}", path.display()))
    }

    /// Enabled, non-disabled servers only (§3 `disabled` flag).
    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &ChildConfig)> {
        self.servers.iter().filter(|(_, c)| !c.disabled)
    }
}

/// Thin wrapper so `ChildConfig`'s `Serialize` impl (which includes `name`)
/// can be reused while `to_json` strips the redundant map key.
#[derive(Serialize)]
struct ChildConfigDto<'a>(&'a ChildConfig);

impl<'a> From<&'a ChildConfig> for ChildConfigDto<'a> {
    fn from(c: &'a ChildConfig) -> Self {
        ChildConfigDto(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let text = r#"{
            "mcpServers": {
                "fs": {"type": "stdio", "command": "mcp-fs", "args": ["--root", "/tmp"]}
            }
        }"#;
        let cfg = ConfigFile::parse(text).unwrap();
        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.servers["fs"].name, "fs");
    }

    #[test]
    fn preserves_unknown_top_level_keys() {
        let text = r#"{
            "mcpServers": {},
            "editor": {"theme": "dark"}
        }"#;
        let cfg = ConfigFile::parse(text).unwrap();
        let json = cfg.to_json().unwrap();
        assert_eq!(json["editor"]["theme"], "dark");
    }

    #[test]
    fn rejects_non_object_mcp_servers() {
        let text = r#"{"mcpServers": []}"#;
        assert!(ConfigFile::parse(text).is_err());
    }

    #[test]
    fn roundtrips_server_without_duplicating_name_key() {
        let text = r#"{
            "mcpServers": {
                "fs": {"type": "stdio", "command": "mcp-fs"}
            }
        }"#;
        let cfg = ConfigFile::parse(text).unwrap();
        let json = cfg.to_json().unwrap();
        assert!(json["mcpServers"]["fs"].get("name").is_none());
    }

    #[test]
    fn enabled_servers_excludes_disabled() {
        let text = r#"{
            "mcpServers": {
                "a": {"type": "stdio", "command": "a"},
                "b": {"type": "stdio", "command": "b", "disabled": true}
            }
        }"#;
        let cfg = ConfigFile::parse(text).unwrap();
        let names: Vec<_> = cfg.enabled_servers().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a"]);
    }
}
