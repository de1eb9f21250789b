//! Token remapper — the encrypted, expiring placeholder vault.
//!
//! Sensitive spans are replaced with opaque placeholders of the form
//! `‹KIND_n›`; the original value lives only inside this module's encrypted
//! store. Minting is linearizable on the dedup hash: concurrent mints of the
//! same (kind, original) return the same placeholder. Records expire per
//! their TTL (24 h default) and are removed by `sweep`, which runs
//! opportunistically on every mint.

pub mod crypto;
pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::pii::placeholder_label;
use crate::error::VaultError;
use self::crypto::VaultKeys;

/// Default record lifetime when the caller does not supply one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Fixed-width UTC timestamp format used at rest (lexicographically ordered).
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A stored token mapping. The plaintext never leaves the vault; only the
/// ciphertext is persisted and only the placeholder crosses components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub placeholder: String,
    pub ciphertext: String,
    pub value_hash: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub access_count: u64,
    pub owner_request_id: String,
}

impl TokenRecord {
    /// Active means not revoked and not expired at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }
}

/// A record ready for insertion, before the store assigns its placeholder.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub value_hash: String,
    pub ciphertext: String,
    pub kind: String,
    /// Uppercased label used in the placeholder (`EMAIL` → `‹EMAIL_3›`).
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub owner_request_id: String,
}

/// Vault population summary for the admin surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultStats {
    pub active: usize,
    pub revoked: usize,
    pub expired: usize,
    pub by_kind: BTreeMap<String, usize>,
}

/// Storage contract: an embedded table keyed by placeholder with a
/// secondary index on the dedup hash. `insert_or_get` must be atomic with
/// respect to that index.
#[async_trait]
pub trait VaultStore: Send + Sync {
    /// If an active record with `record.value_hash` exists, bump its access
    /// count and return it; otherwise assign the next per-label sequence
    /// number, insert, and return the new record.
    async fn insert_or_get(&self, record: NewRecord) -> Result<TokenRecord, VaultError>;

    async fn find_by_placeholder(
        &self,
        placeholder: &str,
    ) -> Result<Option<TokenRecord>, VaultError>;

    /// Increment access count on a successful resolve.
    async fn touch_access(&self, placeholder: &str) -> Result<(), VaultError>;

    /// Mark a record revoked. Returns `false` for unknown placeholders.
    async fn revoke(&self, placeholder: &str) -> Result<bool, VaultError>;

    /// Remove expired and revoked records; returns how many were removed.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, VaultError>;

    async fn stats(&self) -> Result<VaultStats, VaultError>;
}

/// The token remapper.
pub struct TokenVault {
    keys: VaultKeys,
    store: Arc<dyn VaultStore>,
}

impl TokenVault {
    pub fn new(keys: VaultKeys, store: Arc<dyn VaultStore>) -> Self {
        Self { keys, store }
    }

    /// Ephemeral vault over the in-memory store with a random key. Used by
    /// the test harness and as the fallback when no durable store is
    /// configured.
    pub fn ephemeral() -> Result<Self, VaultError> {
        Ok(Self::new(
            VaultKeys::random()?,
            Arc::new(memory::MemoryStore::new()),
        ))
    }

    /// Vault keyed from a 64-char hex master key.
    pub fn with_key_hex(hex_key: &str, store: Arc<dyn VaultStore>) -> Result<Self, VaultError> {
        Ok(Self::new(VaultKeys::from_hex(hex_key)?, store))
    }

    /// Replace a sensitive value with a placeholder.
    ///
    /// Identical (kind, original) pairs within an unexpired window reuse the
    /// existing placeholder. Expired and revoked records are swept first.
    pub async fn mint(
        &self,
        original: &str,
        kind: &str,
        ttl: Option<Duration>,
        owner_request_id: &str,
    ) -> Result<String, VaultError> {
        let now = Utc::now();
        // Opportunistic sweep keeps the hash index free of dead entries.
        let _ = self.store.sweep(now).await;

        let ttl = ttl.unwrap_or(DEFAULT_TTL);
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|_| VaultError::Unavailable("ttl out of range".into()))?;

        let record = NewRecord {
            value_hash: self.keys.value_hash(kind, original),
            ciphertext: self.keys.encrypt(original)?,
            kind: kind.to_string(),
            label: placeholder_label(kind).to_string(),
            created_at: now,
            expires_at,
            owner_request_id: owner_request_id.to_string(),
        };

        let stored = self.store.insert_or_get(record).await?;
        Ok(stored.placeholder)
    }

    /// Recover the original value behind a placeholder. The stored kind must
    /// match the requested kind.
    pub async fn resolve(&self, placeholder: &str, kind: &str) -> Result<String, VaultError> {
        let record = self
            .store
            .find_by_placeholder(placeholder)
            .await?
            .ok_or_else(|| VaultError::NotFound(placeholder.to_string()))?;

        if !record.is_active(Utc::now()) {
            return Err(VaultError::NotFound(placeholder.to_string()));
        }
        if record.kind != kind {
            return Err(VaultError::KindMismatch {
                expected: record.kind,
                requested: kind.to_string(),
            });
        }

        let original = self.keys.decrypt(&record.ciphertext)?;
        self.store.touch_access(placeholder).await?;
        Ok(original)
    }

    pub async fn revoke(&self, placeholder: &str) -> Result<bool, VaultError> {
        self.store.revoke(placeholder).await
    }

    pub async fn sweep(&self) -> Result<usize, VaultError> {
        self.store.sweep(Utc::now()).await
    }

    pub async fn stats(&self) -> Result<VaultStats, VaultError> {
        self.store.stats().await
    }

    /// Human-readable partial mask for reports (`a***@e******.com`). Never
    /// used in LLM traffic — placeholders are the only cross-component form.
    pub fn masked_preview(original: &str, kind: &str) -> String {
        match kind {
            "email" => {
                if let Some((user, domain)) = original.split_once('@') {
                    format!("{}@{}", mask_word(user), mask_word(domain))
                } else {
                    mask_word(original)
                }
            }
            "phone_number" | "ssn" | "credit_card" => {
                let digits: String = original.chars().filter(|c| c.is_ascii_digit()).collect();
                let tail: String = digits
                    .chars()
                    .rev()
                    .take(4)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                format!("***{tail}")
            }
            _ => mask_word(original),
        }
    }
}

/// Spawn the periodic sweeper for a shared vault.
///
/// Expired and revoked records are also swept opportunistically on every
/// mint; the timer bounds how long a dead record can linger in an idle
/// vault. Emits a `vault_swept` audit event when records were removed.
pub fn spawn_sweeper(
    vault: Arc<TokenVault>,
    interval: std::time::Duration,
    audit: crate::audit::AuditSink,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match vault.sweep().await {
                Ok(0) => {}
                Ok(removed) => {
                    audit.emit(crate::audit::AuditEvent::VaultSwept { removed });
                }
                Err(err) => tracing::warn!(error = %err, "vault sweep failed"),
            }
        }
    })
}

fn mask_word(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => {
            let rest = chars.as_str();
            // Keep a trailing dot-suffix readable (domain TLDs).
            if let Some(dot) = rest.rfind('.') {
                let masked = "*".repeat(rest[..dot].chars().count());
                format!("{first}{masked}{}", &rest[dot..])
            } else {
                format!("{first}{}", "*".repeat(rest.chars().count()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> TokenVault {
        TokenVault::ephemeral().unwrap()
    }

    #[tokio::test]
    async fn test_mint_resolve_roundtrip() {
        let vault = vault();
        let placeholder = vault
            .mint("alice@example.com", "email", None, "req-1")
            .await
            .unwrap();
        assert_eq!(placeholder, "‹EMAIL_1›");
        let original = vault.resolve(&placeholder, "email").await.unwrap();
        assert_eq!(original, "alice@example.com");
    }

    #[tokio::test]
    async fn test_mint_deduplicates_by_kind_and_value() {
        let vault = vault();
        let a = vault
            .mint("alice@example.com", "email", None, "req-1")
            .await
            .unwrap();
        let b = vault
            .mint("alice@example.com", "email", None, "req-2")
            .await
            .unwrap();
        assert_eq!(a, b);

        // Same value, different kind: a distinct placeholder.
        let c = vault
            .mint("alice@example.com", "person", None, "req-3")
            .await
            .unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_placeholder_sequences_per_kind() {
        let vault = vault();
        let a = vault.mint("a@x.com", "email", None, "r").await.unwrap();
        let b = vault.mint("b@y.com", "email", None, "r").await.unwrap();
        let p = vault
            .mint("555-123-4567", "phone_number", None, "r")
            .await
            .unwrap();
        assert_eq!(a, "‹EMAIL_1›");
        assert_eq!(b, "‹EMAIL_2›");
        assert_eq!(p, "‹PHONE_1›");
    }

    #[tokio::test]
    async fn test_resolve_wrong_kind_fails() {
        let vault = vault();
        let placeholder = vault.mint("a@x.com", "email", None, "r").await.unwrap();
        let err = vault.resolve(&placeholder, "phone_number").await.unwrap_err();
        assert!(matches!(err, VaultError::KindMismatch { .. }));
    }

    #[tokio::test]
    async fn test_resolve_unknown_placeholder_fails() {
        let vault = vault();
        assert!(matches!(
            vault.resolve("‹EMAIL_99›", "email").await.unwrap_err(),
            VaultError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_revoked_record_does_not_resolve() {
        let vault = vault();
        let placeholder = vault.mint("a@x.com", "email", None, "r").await.unwrap();
        assert!(vault.revoke(&placeholder).await.unwrap());
        assert!(vault.resolve(&placeholder, "email").await.is_err());
    }

    #[tokio::test]
    async fn test_expired_record_swept_and_remintable() {
        let vault = vault();
        let placeholder = vault
            .mint("a@x.com", "email", Some(Duration::from_millis(1)), "r")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(vault.resolve(&placeholder, "email").await.is_err());

        // The sweep frees the hash slot; a re-mint allocates a new sequence.
        let again = vault.mint("a@x.com", "email", None, "r").await.unwrap();
        assert_eq!(again, "‹EMAIL_2›");
        assert_eq!(
            vault.resolve(&again, "email").await.unwrap(),
            "a@x.com"
        );
    }

    #[tokio::test]
    async fn test_stats_counts_by_kind() {
        let vault = vault();
        vault.mint("a@x.com", "email", None, "r").await.unwrap();
        vault.mint("b@y.com", "email", None, "r").await.unwrap();
        let stats = vault.stats().await.unwrap();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.by_kind.get("email"), Some(&2));
    }

    #[tokio::test]
    async fn test_concurrent_mints_share_placeholder() {
        let vault = std::sync::Arc::new(vault());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let v = vault.clone();
            handles.push(tokio::spawn(async move {
                v.mint("same@x.com", "email", None, "r").await.unwrap()
            }));
        }
        let mut placeholders = Vec::new();
        for handle in handles {
            placeholders.push(handle.await.unwrap());
        }
        placeholders.dedup();
        assert_eq!(placeholders.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_records() {
        let vault = std::sync::Arc::new(vault());
        vault
            .mint("a@x.com", "email", Some(Duration::from_millis(1)), "r")
            .await
            .unwrap();
        let handle = spawn_sweeper(
            vault.clone(),
            Duration::from_millis(10),
            crate::audit::AuditSink::disabled(),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.abort();

        let stats = vault.stats().await.unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.expired, 0);
    }

    #[test]
    fn test_masked_preview_email() {
        assert_eq!(
            TokenVault::masked_preview("alice@example.com", "email"),
            "a****@e******.com"
        );
    }

    #[test]
    fn test_masked_preview_digits() {
        assert_eq!(
            TokenVault::masked_preview("555-123-4567", "phone_number"),
            "***4567"
        );
    }
}
