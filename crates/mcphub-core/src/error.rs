//! The closed error taxonomy (spec.md §7). Callers that need to branch on
//! error *kind* (e.g. the config manager deciding whether a reload failure
//! should roll back) match on `ProxyError`; everything else propagates as
//! `anyhow::Error` with `.context(...)`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration for '{child}': {reason}")]
    ConfigInvalid { child: String, reason: String },

    #[error("transport failed for '{child}': {reason}")]
    TransportFailed { child: String, reason: String },

    #[error("handshake failed for '{child}': {reason}")]
    HandshakeFailed { child: String, reason: String },

    #[error("protocol mismatch for '{child}': expected {expected}, got {actual}")]
    ProtocolMismatch {
        child: String,
        expected: String,
        actual: String,
    },

    #[error("authentication required for '{child}'")]
    AuthRequired { child: String },

    #[error("timed out waiting for '{child}' after {after_ms}ms")]
    Timeout { child: String, after_ms: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage operation failed: {reason}")]
    StorageFailed { reason: String },

    #[error("cache miss and reload failed for '{key}': {reason}")]
    CacheMissLoadFailed { key: String, reason: String },
}

impl ProxyError {
    /// Stable machine-readable kind, used in JSON-RPC error `data.kind` and
    /// in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid { .. } => "config_invalid",
            Self::TransportFailed { .. } => "transport_failed",
            Self::HandshakeFailed { .. } => "handshake_failed",
            Self::ProtocolMismatch { .. } => "protocol_mismatch",
            Self::AuthRequired { .. } => "auth_required",
            Self::Timeout { .. } => "timeout",
            Self::NotFound(_) => "not_found",
            Self::StorageFailed { .. } => "storage_failed",
            Self::CacheMissLoadFailed { .. } => "cache_miss_load_failed",
        }
    }

    /// Whether retrying the same operation without intervention could
    /// plausibly succeed (used by the restart-policy and schema-cache
    /// reload paths to decide whether to back off or give up immediately).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportFailed { .. } | Self::Timeout { .. } | Self::CacheMissLoadFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_per_variant() {
        let err = ProxyError::NotFound("tool:x".into());
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn transport_and_timeout_are_retryable_but_config_invalid_is_not() {
        assert!(ProxyError::TransportFailed {
            child: "a".into(),
            reason: "eof".into()
        }
        .is_retryable());
        assert!(!ProxyError::ConfigInvalid {
            child: "a".into(),
            reason: "bad".into()
        }
        .is_retryable());
    }
}
