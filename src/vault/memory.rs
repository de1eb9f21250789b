//! In-memory vault store.
//!
//! A single mutex over the whole table makes `insert_or_get` trivially
//! linearizable. Required by the test harness; also the fallback when no
//! durable store is configured.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::VaultError;

use super::{NewRecord, TokenRecord, VaultStats, VaultStore};

#[derive(Default)]
struct Inner {
    by_placeholder: HashMap<String, TokenRecord>,
    by_hash: HashMap<String, String>,
    sequences: HashMap<String, u64>,
}

/// Mutex-backed vault store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VaultStore for MemoryStore {
    async fn insert_or_get(&self, record: NewRecord) -> Result<TokenRecord, VaultError> {
        let mut inner = self.inner.lock();

        if let Some(placeholder) = inner.by_hash.get(&record.value_hash).cloned() {
            if let Some(existing) = inner.by_placeholder.get_mut(&placeholder) {
                if existing.is_active(record.created_at) {
                    existing.access_count += 1;
                    return Ok(existing.clone());
                }
            }
        }

        let seq = inner.sequences.entry(record.label.clone()).or_insert(0);
        *seq += 1;
        let placeholder = format!("\u{2039}{}_{}\u{203a}", record.label, seq);

        let stored = TokenRecord {
            placeholder: placeholder.clone(),
            ciphertext: record.ciphertext,
            value_hash: record.value_hash.clone(),
            kind: record.kind,
            created_at: record.created_at,
            expires_at: record.expires_at,
            revoked: false,
            access_count: 0,
            owner_request_id: record.owner_request_id,
        };

        inner.by_hash.insert(record.value_hash, placeholder.clone());
        inner.by_placeholder.insert(placeholder, stored.clone());
        Ok(stored)
    }

    async fn find_by_placeholder(
        &self,
        placeholder: &str,
    ) -> Result<Option<TokenRecord>, VaultError> {
        Ok(self.inner.lock().by_placeholder.get(placeholder).cloned())
    }

    async fn touch_access(&self, placeholder: &str) -> Result<(), VaultError> {
        if let Some(record) = self.inner.lock().by_placeholder.get_mut(placeholder) {
            record.access_count += 1;
        }
        Ok(())
    }

    async fn revoke(&self, placeholder: &str) -> Result<bool, VaultError> {
        let mut inner = self.inner.lock();
        match inner.by_placeholder.get_mut(placeholder) {
            Some(record) => {
                record.revoked = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, VaultError> {
        let mut inner = self.inner.lock();
        let dead: Vec<String> = inner
            .by_placeholder
            .values()
            .filter(|r| !r.is_active(now))
            .map(|r| r.placeholder.clone())
            .collect();
        for placeholder in &dead {
            if let Some(record) = inner.by_placeholder.remove(placeholder) {
                // Only drop the hash slot if it still points at this record.
                if inner.by_hash.get(&record.value_hash) == Some(placeholder) {
                    inner.by_hash.remove(&record.value_hash);
                }
            }
        }
        Ok(dead.len())
    }

    async fn stats(&self) -> Result<VaultStats, VaultError> {
        let inner = self.inner.lock();
        let now = Utc::now();
        let mut stats = VaultStats::default();
        for record in inner.by_placeholder.values() {
            if record.revoked {
                stats.revoked += 1;
            } else if record.expires_at <= now {
                stats.expired += 1;
            } else {
                stats.active += 1;
                *stats.by_kind.entry(record.kind.clone()).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_record(hash: &str, label: &str) -> NewRecord {
        let now = Utc::now();
        NewRecord {
            value_hash: hash.to_string(),
            ciphertext: "ct".to_string(),
            kind: "email".to_string(),
            label: label.to_string(),
            created_at: now,
            expires_at: now + Duration::hours(1),
            owner_request_id: "req".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_then_get_same_hash() {
        let store = MemoryStore::new();
        let first = store.insert_or_get(new_record("h1", "EMAIL")).await.unwrap();
        let second = store.insert_or_get(new_record("h1", "EMAIL")).await.unwrap();
        assert_eq!(first.placeholder, second.placeholder);
        assert_eq!(second.access_count, 1);
    }

    #[tokio::test]
    async fn test_sequences_are_per_label() {
        let store = MemoryStore::new();
        let a = store.insert_or_get(new_record("h1", "EMAIL")).await.unwrap();
        let b = store.insert_or_get(new_record("h2", "PHONE")).await.unwrap();
        let c = store.insert_or_get(new_record("h3", "EMAIL")).await.unwrap();
        assert_eq!(a.placeholder, "‹EMAIL_1›");
        assert_eq!(b.placeholder, "‹PHONE_1›");
        assert_eq!(c.placeholder, "‹EMAIL_2›");
    }

    #[tokio::test]
    async fn test_sweep_removes_revoked() {
        let store = MemoryStore::new();
        let record = store.insert_or_get(new_record("h1", "EMAIL")).await.unwrap();
        store.revoke(&record.placeholder).await.unwrap();
        let removed = store.sweep(Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store
            .find_by_placeholder(&record.placeholder)
            .await
            .unwrap()
            .is_none());
    }
}
