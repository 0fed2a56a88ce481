//! L2: template variable expander (spec.md §4 L2).
//!
//! Placeholders look like `{namespace.key}` or `{namespace.key:default}`.
//! Namespaces are resolved from a `ContextData` bundle assembled per-session
//! by the caller (project/user/environment/session/timestamp/version/context).
//! The set of bindings actually used to expand a template is hashed with
//! SHA-256 to produce a stable, shareable instance key for the template
//! instance pool (C2): two sessions that resolve to identical bindings get
//! the same hash and can share a pooled instance when the template allows it.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextData {
    pub project: BTreeMap<String, String>,
    pub user: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
    pub session: BTreeMap<String, String>,
    pub timestamp: BTreeMap<String, String>,
    pub version: BTreeMap<String, String>,
    pub context: BTreeMap<String, String>,
    /// Catch-all bindings, keyed by the full `namespace.key` path as typed in
    /// the template. Placeholders whose namespace isn't one of the fixed set
    /// above are looked up here before falling back to their default.
    pub custom: BTreeMap<String, String>,
}

impl ContextData {
    fn namespace(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        match name {
            "project" => Some(&self.project),
            "user" => Some(&self.user),
            "environment" | "env" => Some(&self.environment),
            "session" => Some(&self.session),
            "timestamp" => Some(&self.timestamp),
            "version" => Some(&self.version),
            "context" => Some(&self.context),
            "custom" => Some(&self.custom),
            _ => None,
        }
    }

    fn lookup(&self, namespace: &str, key: &str) -> Option<&str> {
        self.namespace(namespace)
            .and_then(|ns| ns.get(key))
            .map(String::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unterminated placeholder starting at byte {0}")]
    Unterminated(usize),
    #[error("unknown namespace '{0}' in placeholder '{1}'")]
    UnknownNamespace(String, String),
    #[error("missing variable '{0}' with no default")]
    MissingVariable(String),
    #[error("malformed placeholder '{0}': expected 'namespace.key'")]
    Malformed(String),
}

/// A single resolved `namespace.key -> value` binding, recorded in expansion
/// order for deterministic hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableBinding {
    pub placeholder: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionResult {
    pub text: String,
    pub bindings: Vec<VariableBinding>,
}

impl ExpansionResult {
    /// Stable hex-encoded SHA-256 over the sorted `placeholder=value` pairs.
    /// Used as the template instance pool key for shareable templates.
    pub fn bindings_hash(&self) -> String {
        let mut sorted = self.bindings.clone();
        sorted.sort_by(|a, b| a.placeholder.cmp(&b.placeholder));
        let mut hasher = Sha256::new();
        for binding in &sorted {
            hasher.update(binding.placeholder.as_bytes());
            hasher.update(b"=");
            hasher.update(binding.value.as_bytes());
            hasher.update(b"\n");
        }
        hex_encode(&hasher.finalize())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to String cannot fail");
    }
    out
}

/// Expand all `{namespace.key[:default]}` placeholders in `template` against
/// `ctx`. Escaping: `{{` and `}}` produce literal braces.
pub fn expand(template: &str, ctx: &ContextData) -> Result<ExpansionResult, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut bindings = Vec::new();
    let bytes = template.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                out.push('{');
                i += 2;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                out.push('}');
                i += 2;
            }
            b'{' => {
                let close = template[i..]
                    .find('}')
                    .map(|rel| i + rel)
                    .ok_or(TemplateError::Unterminated(i))?;
                let raw = &template[i + 1..close];
                let (path, default) = match raw.split_once(':') {
                    Some((p, d)) => (p, Some(d)),
                    None => (raw, None),
                };

                let value = match path.split_once('.') {
                    None => {
                        // A bare `{key}` has no namespace to resolve against;
                        // it's only valid when it carries a default.
                        default
                            .map(str::to_string)
                            .ok_or_else(|| TemplateError::Malformed(raw.to_string()))?
                    }
                    Some((namespace, key)) => match ctx.lookup(namespace, key) {
                        Some(v) => v.to_string(),
                        None if ctx.namespace(namespace).is_some() => default
                            .map(str::to_string)
                            .ok_or_else(|| TemplateError::MissingVariable(raw.to_string()))?,
                        None => match ctx.custom.get(path) {
                            Some(v) => v.clone(),
                            None => default.map(str::to_string).ok_or_else(|| {
                                TemplateError::UnknownNamespace(namespace.to_string(), raw.to_string())
                            })?,
                        },
                    },
                };

                out.push_str(&value);
                bindings.push(VariableBinding {
                    placeholder: path.to_string(),
                    value,
                });
                i = close + 1;
            }
            _ => {
                // Advance by full UTF-8 scalar, not by byte, so multi-byte
                // characters preceding a placeholder aren't corrupted.
                let ch = template[i..].chars().next().unwrap();
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }

    Ok(ExpansionResult { text: out, bindings })
}

/// Validate placeholder syntax without a real `ContextData` (used by config
/// loading to reject malformed templates early, per §3 `validate`). Missing
/// variables are tolerated here since no real context is available yet;
/// only unterminated/malformed placeholders are reported.
pub fn validate_syntax(template: &str) -> Result<(), TemplateError> {
    match expand(template, &ContextData::default()) {
        Ok(_) | Err(TemplateError::UnknownNamespace(_, _)) | Err(TemplateError::MissingVariable(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ContextData {
        let mut ctx = ContextData::default();
        ctx.project.insert("root".to_string(), "/repo".to_string());
        ctx.session.insert("id".to_string(), "abc123".to_string());
        ctx
    }

    #[test]
    fn expands_known_placeholder() {
        let result = expand("root={project.root}", &ctx()).unwrap();
        assert_eq!(result.text, "root=/repo");
    }

    #[test]
    fn uses_default_when_key_missing() {
        let result = expand("v={project.version:1.0}", &ctx()).unwrap();
        assert_eq!(result.text, "v=1.0");
    }

    #[test]
    fn errors_when_key_missing_and_no_default() {
        let err = expand("{project.missing}", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::MissingVariable(_)));
    }

    #[test]
    fn errors_on_unknown_namespace() {
        let err = expand("{bogus.key}", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownNamespace(_, _)));
    }

    #[test]
    fn unknown_namespace_falls_back_to_custom() {
        let mut c = ctx();
        c.custom.insert("bogus.key".to_string(), "from-custom".to_string());
        let result = expand("{bogus.key}", &c).unwrap();
        assert_eq!(result.text, "from-custom");
    }

    #[test]
    fn unknown_namespace_with_default_and_no_custom_entry_uses_default() {
        let result = expand("{bogus.key:fallback}", &ctx()).unwrap();
        assert_eq!(result.text, "fallback");
    }

    #[test]
    fn no_dot_placeholder_without_default_is_malformed() {
        let err = expand("{key}", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::Malformed(_)));
    }

    #[test]
    fn no_dot_placeholder_with_default_expands_to_default() {
        let result = expand("{key:fallback}", &ctx()).unwrap();
        assert_eq!(result.text, "fallback");
    }

    #[test]
    fn escaped_braces_are_literal() {
        let result = expand("{{literal}}", &ctx()).unwrap();
        assert_eq!(result.text, "{literal}");
        assert!(result.bindings.is_empty());
    }

    #[test]
    fn identical_bindings_hash_identically_regardless_of_order() {
        let a = ExpansionResult {
            text: String::new(),
            bindings: vec![
                VariableBinding { placeholder: "a.x".into(), value: "1".into() },
                VariableBinding { placeholder: "b.y".into(), value: "2".into() },
            ],
        };
        let b = ExpansionResult {
            text: String::new(),
            bindings: vec![
                VariableBinding { placeholder: "b.y".into(), value: "2".into() },
                VariableBinding { placeholder: "a.x".into(), value: "1".into() },
            ],
        };
        assert_eq!(a.bindings_hash(), b.bindings_hash());
    }

    #[test]
    fn different_bindings_hash_differently() {
        let a = expand("{session.id}", &ctx()).unwrap();
        let mut other = ctx();
        other.session.insert("id".to_string(), "different".to_string());
        let b = expand("{session.id}", &other).unwrap();
        assert_ne!(a.bindings_hash(), b.bindings_hash());
    }
}
