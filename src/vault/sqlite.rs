//! Durable vault store on embedded SQLite.
//!
//! One table keyed by placeholder with a unique index on the dedup hash;
//! `insert_or_get` runs in a single transaction so the hash index stays
//! linearizable under concurrent mints. Timestamps are stored as
//! fixed-width RFC 3339 UTC text, which compares lexicographically.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::error::VaultError;

use super::{format_ts, NewRecord, TokenRecord, VaultStats, VaultStore};

const OP_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed vault store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and run migrations. `url` is a sqlite URL such as
    /// `sqlite:vault.db?mode=rwc` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, VaultError> {
        // A single connection: writes serialize in SQLite anyway, and it
        // keeps `sqlite::memory:` databases coherent across operations.
        let pool = tokio::time::timeout(
            OP_TIMEOUT,
            SqlitePoolOptions::new().max_connections(1).connect(url),
        )
        .await
        .map_err(|_| VaultError::Unavailable("vault store connect timed out".into()))?
        .map_err(storage_err)?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), VaultError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS token_vault (
                placeholder TEXT PRIMARY KEY,
                value_hash TEXT NOT NULL UNIQUE,
                ciphertext TEXT NOT NULL,
                kind TEXT NOT NULL,
                label TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0,
                access_count INTEGER NOT NULL DEFAULT 0,
                owner_request_id TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_token_vault_expiry ON token_vault (expires_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS token_vault_seq (
                label TEXT PRIMARY KEY,
                next INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }
}

fn storage_err(err: sqlx::Error) -> VaultError {
    VaultError::Unavailable(err.to_string())
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, VaultError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| VaultError::Unavailable(format!("bad stored timestamp: {e}")))
}

fn row_to_record(row: &SqliteRow) -> Result<TokenRecord, VaultError> {
    Ok(TokenRecord {
        placeholder: row.try_get("placeholder").map_err(storage_err)?,
        ciphertext: row.try_get("ciphertext").map_err(storage_err)?,
        value_hash: row.try_get("value_hash").map_err(storage_err)?,
        kind: row.try_get("kind").map_err(storage_err)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at").map_err(storage_err)?)?,
        expires_at: parse_ts(&row.try_get::<String, _>("expires_at").map_err(storage_err)?)?,
        revoked: row.try_get::<i64, _>("revoked").map_err(storage_err)? != 0,
        access_count: row.try_get::<i64, _>("access_count").map_err(storage_err)? as u64,
        owner_request_id: row.try_get("owner_request_id").map_err(storage_err)?,
    })
}

#[async_trait]
impl VaultStore for SqliteStore {
    async fn insert_or_get(&self, record: NewRecord) -> Result<TokenRecord, VaultError> {
        tokio::time::timeout(OP_TIMEOUT, async {
            let mut tx = self.pool.begin().await.map_err(storage_err)?;

            let existing = sqlx::query("SELECT * FROM token_vault WHERE value_hash = ?")
                .bind(&record.value_hash)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage_err)?;

            if let Some(row) = existing {
                let stored = row_to_record(&row)?;
                if stored.is_active(record.created_at) {
                    sqlx::query(
                        "UPDATE token_vault SET access_count = access_count + 1
                         WHERE placeholder = ?",
                    )
                    .bind(&stored.placeholder)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
                    tx.commit().await.map_err(storage_err)?;
                    return Ok(TokenRecord {
                        access_count: stored.access_count + 1,
                        ..stored
                    });
                }
                // Dead record still holding the hash slot: clear it.
                sqlx::query("DELETE FROM token_vault WHERE placeholder = ?")
                    .bind(&stored.placeholder)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
            }

            let seq: i64 = sqlx::query_scalar(
                "INSERT INTO token_vault_seq (label, next) VALUES (?, 1)
                 ON CONFLICT(label) DO UPDATE SET next = next + 1
                 RETURNING next",
            )
            .bind(&record.label)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage_err)?;

            let placeholder = format!("\u{2039}{}_{}\u{203a}", record.label, seq);

            sqlx::query(
                "INSERT INTO token_vault (
                    placeholder, value_hash, ciphertext, kind, label,
                    created_at, expires_at, revoked, access_count, owner_request_id
                ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, ?)",
            )
            .bind(&placeholder)
            .bind(&record.value_hash)
            .bind(&record.ciphertext)
            .bind(&record.kind)
            .bind(&record.label)
            .bind(format_ts(record.created_at))
            .bind(format_ts(record.expires_at))
            .bind(&record.owner_request_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

            tx.commit().await.map_err(storage_err)?;

            Ok(TokenRecord {
                placeholder,
                ciphertext: record.ciphertext,
                value_hash: record.value_hash,
                kind: record.kind,
                created_at: record.created_at,
                expires_at: record.expires_at,
                revoked: false,
                access_count: 0,
                owner_request_id: record.owner_request_id,
            })
        })
        .await
        .map_err(|_| VaultError::Unavailable("vault store write timed out".into()))?
    }

    async fn find_by_placeholder(
        &self,
        placeholder: &str,
    ) -> Result<Option<TokenRecord>, VaultError> {
        let row = sqlx::query("SELECT * FROM token_vault WHERE placeholder = ?")
            .bind(placeholder)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|r| row_to_record(&r)).transpose()
    }

    async fn touch_access(&self, placeholder: &str) -> Result<(), VaultError> {
        sqlx::query(
            "UPDATE token_vault SET access_count = access_count + 1 WHERE placeholder = ?",
        )
        .bind(placeholder)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn revoke(&self, placeholder: &str) -> Result<bool, VaultError> {
        let result = sqlx::query("UPDATE token_vault SET revoked = 1 WHERE placeholder = ?")
            .bind(placeholder)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, VaultError> {
        let result =
            sqlx::query("DELETE FROM token_vault WHERE revoked = 1 OR expires_at <= ?")
                .bind(format_ts(now))
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self) -> Result<VaultStats, VaultError> {
        let now = format_ts(Utc::now());
        let rows = sqlx::query(
            "SELECT kind, revoked, expires_at <= ? AS expired, COUNT(*) AS n
             FROM token_vault GROUP BY kind, revoked, expired",
        )
        .bind(&now)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut stats = VaultStats::default();
        for row in rows {
            let kind: String = row.try_get("kind").map_err(storage_err)?;
            let revoked: i64 = row.try_get("revoked").map_err(storage_err)?;
            let expired: i64 = row.try_get("expired").map_err(storage_err)?;
            let n: i64 = row.try_get("n").map_err(storage_err)?;
            if revoked != 0 {
                stats.revoked += n as usize;
            } else if expired != 0 {
                stats.expired += n as usize;
            } else {
                stats.active += n as usize;
                *stats.by_kind.entry(kind).or_insert(0) += n as usize;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn new_record(hash: &str, label: &str) -> NewRecord {
        let now = Utc::now();
        NewRecord {
            value_hash: hash.to_string(),
            ciphertext: "ct".to_string(),
            kind: "email".to_string(),
            label: label.to_string(),
            created_at: now,
            expires_at: now + ChronoDuration::hours(1),
            owner_request_id: "req".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_or_get_dedupes() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let a = store.insert_or_get(new_record("h1", "EMAIL")).await.unwrap();
        let b = store.insert_or_get(new_record("h1", "EMAIL")).await.unwrap();
        assert_eq!(a.placeholder, b.placeholder);
        assert_eq!(b.access_count, 1);
    }

    #[tokio::test]
    async fn test_sequences_survive_in_table() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let a = store.insert_or_get(new_record("h1", "EMAIL")).await.unwrap();
        let b = store.insert_or_get(new_record("h2", "EMAIL")).await.unwrap();
        assert_eq!(a.placeholder, "‹EMAIL_1›");
        assert_eq!(b.placeholder, "‹EMAIL_2›");
    }

    #[tokio::test]
    async fn test_revoke_and_sweep() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let record = store.insert_or_get(new_record("h1", "EMAIL")).await.unwrap();
        assert!(store.revoke(&record.placeholder).await.unwrap());
        assert_eq!(store.sweep(Utc::now()).await.unwrap(), 1);
        assert!(store
            .find_by_placeholder(&record.placeholder)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        store.insert_or_get(new_record("h1", "EMAIL")).await.unwrap();
        store.insert_or_get(new_record("h2", "EMAIL")).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.by_kind.get("email"), Some(&2));
    }
}
