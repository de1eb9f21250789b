//! Error taxonomy for the gateway core.
//!
//! Component-internal failures are converted into findings or typed result
//! fields close to where they occur; only the variants here cross subsystem
//! boundaries. The orchestrator matches on them to decide between
//! degradation, retry, and terminal refusal.

use thiserror::Error;

/// Errors surfaced by the token vault.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The backing store could not be reached or the write failed. Callers
    /// must fall back to plain `[KIND]` redaction and escalate.
    #[error("vault unavailable: {0}")]
    Unavailable(String),

    /// `resolve` was called with a kind that does not match the stored kind.
    #[error("token kind mismatch: expected {expected}, got {requested}")]
    KindMismatch { expected: String, requested: String },

    /// No active record for the placeholder (unknown, expired, or revoked).
    #[error("unknown or inactive placeholder: {0}")]
    NotFound(String),

    /// Ciphertext failed authentication on decrypt.
    #[error("vault decrypt failed for {0}")]
    Decrypt(String),
}

/// Errors surfaced by LLM providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// 5xx, connect failures, timeouts — retried with backoff.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// 4xx, malformed responses, auth failures — fatal for the request.
    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Returns `true` if the error is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Errors surfaced by the secure data connector and its adapters.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The plan failed gating (violations or risk above the gate).
    #[error("query plan rejected: {0}")]
    PlanRejected(String),

    /// No data source registered under the requested name.
    #[error("unknown data source: {0}")]
    UnknownSource(String),

    /// The adapter could not reach the source.
    #[error("data source unavailable: {0}")]
    SourceUnavailable(String),

    /// Query execution exceeded the source deadline.
    #[error("query timed out after {elapsed_ms} ms on {source_name}")]
    SourceTimeout { source_name: String, elapsed_ms: u64 },

    /// Adapter-level execution failure (bad SQL, protocol error).
    #[error("query execution failed: {0}")]
    Execution(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_transient_classification() {
        assert!(ProviderError::Transient("503".into()).is_transient());
        assert!(!ProviderError::Fatal("401".into()).is_transient());
    }

    #[test]
    fn test_vault_kind_mismatch_display() {
        let err = VaultError::KindMismatch {
            expected: "email".into(),
            requested: "phone".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("email"));
        assert!(msg.contains("phone"));
    }

    #[test]
    fn test_connector_timeout_display() {
        let err = ConnectorError::SourceTimeout {
            source_name: "orders".into(),
            elapsed_ms: 1500,
        };
        assert!(err.to_string().contains("1500"));
    }
}
