//! On-disk header cache.
//!
//! One SQLite database per account, under the platform cache directory,
//! holding a single key/value table. Keys are ASCII strings
//! `header.<uidvalidity>.<uid>`; values are JSON-encoded [`CachedHeader`]
//! blobs. A `cache.tag` row versions the encoding: when the stored tag
//! does not match [`CACHE_TAG`] the store is cleared and reloaded from the
//! server rather than decoded wrongly.
//!
//! Cache failures are soft everywhere: a read or write error is logged and
//! the affected UID is simply fetched from the server again.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use maildeck_worker::models::{BodyStructure, Envelope, Uid};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::{Error, Result};

/// Bump when the `CachedHeader` encoding changes; a mismatch clears the
/// user's cache instead of misdecoding it.
pub const CACHE_TAG: &str = "0001";

const TAG_KEY: &str = "cache.tag";

/// One cached header record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedHeader {
    /// MIME structure at fetch time.
    pub body_structure: BodyStructure,
    /// Envelope at fetch time.
    pub envelope: Envelope,
    /// Server-reported arrival time.
    pub internal_date: Option<DateTime<Utc>>,
    /// Message UID.
    pub uid: Uid,
    /// Raw header bytes.
    pub header: Vec<u8>,
    /// When the record was written; drives age-based eviction.
    pub created: DateTime<Utc>,
}

/// Handle to one account's header store.
#[derive(Debug, Clone)]
pub struct HeaderCache {
    pool: SqlitePool,
}

impl HeaderCache {
    /// Opens (or creates) the database for `account` under the platform
    /// cache directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created or the
    /// database cannot be opened; the caller treats that as "no cache".
    pub async fn open(account: &str) -> Result<Self> {
        let dir = cache_dir(account)?;
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("headers.db");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await?;
        let cache = Self { pool };
        cache.initialize().await?;
        tracing::debug!(path = %path.display(), "header cache opened");
        Ok(cache)
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema setup fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let cache = Self { pool };
        cache.initialize().await?;
        Ok(cache)
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS headers (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        self.check_tag().await?;
        Ok(())
    }

    async fn check_tag(&self) -> Result<()> {
        let row = sqlx::query("SELECT value FROM headers WHERE key = ?")
            .bind(TAG_KEY)
            .fetch_optional(&self.pool)
            .await?;
        let tag = row.map(|r| r.get::<Vec<u8>, _>("value"));
        if tag.as_deref() == Some(CACHE_TAG.as_bytes()) {
            tracing::trace!("cache tag matches");
            return Ok(());
        }
        tracing::warn!(
            found = ?tag.map(|t| String::from_utf8_lossy(&t).into_owned()),
            expected = CACHE_TAG,
            "cache tag mismatch, clearing store"
        );
        self.clear().await?;
        sqlx::query("INSERT INTO headers (key, value) VALUES (?, ?)")
            .bind(TAG_KEY)
            .bind(CACHE_TAG.as_bytes())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Writes one header record under `header.<uidvalidity>.<uid>`.
    ///
    /// # Errors
    ///
    /// Returns encode or database errors; callers log and move on.
    pub async fn put(&self, uid_validity: u32, header: &CachedHeader) -> Result<()> {
        let value = serde_json::to_vec(header)?;
        sqlx::query(
            r"
            INSERT INTO headers (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(key(uid_validity, header.uid))
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reads the record for one UID. A record that fails to decode is
    /// reported as a miss, since the caller will re-fetch and overwrite
    /// it anyway.
    ///
    /// # Errors
    ///
    /// Returns database errors only.
    pub async fn get(&self, uid_validity: u32, uid: Uid) -> Result<Option<CachedHeader>> {
        let row = sqlx::query("SELECT value FROM headers WHERE key = ?")
            .bind(key(uid_validity, uid))
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let value: Vec<u8> = row.get("value");
        match serde_json::from_slice(&value) {
            Ok(header) => Ok(Some(header)),
            Err(err) => {
                tracing::error!(uid_validity, uid, %err, "cannot decode cached header");
                Ok(None)
            }
        }
    }

    /// Drops every row, including the tag.
    ///
    /// # Errors
    ///
    /// Returns database errors.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM headers").execute(&self.pool).await?;
        Ok(())
    }

    /// Deletes entries whose `created + max_age` has elapsed. Scans the
    /// whole store; meant to run as a fire-and-forget background task.
    /// Returns `(scanned, removed)`.
    ///
    /// # Errors
    ///
    /// Returns database errors; decode failures only skip the affected
    /// row.
    pub async fn sweep(&self, max_age: Duration) -> Result<(usize, usize)> {
        let started = std::time::Instant::now();
        let mut scanned = 0usize;
        let mut removed = 0usize;

        let rows = sqlx::query("SELECT key, value FROM headers WHERE key != ?")
            .bind(TAG_KEY)
            .fetch_all(&self.pool)
            .await?;
        let horizon = chrono::TimeDelta::from_std(max_age)
            .map_err(|e| Error::Config(format!("cache-max-age out of range: {e}")))?;
        for row in rows {
            scanned += 1;
            let value: Vec<u8> = row.get("value");
            let header: CachedHeader = match serde_json::from_slice(&value) {
                Ok(header) => header,
                Err(err) => {
                    tracing::error!(%err, "cannot decode entry during sweep");
                    continue;
                }
            };
            if header.created + horizon < Utc::now() {
                let entry_key: String = row.get("key");
                sqlx::query("DELETE FROM headers WHERE key = ?")
                    .bind(entry_key)
                    .execute(&self.pool)
                    .await?;
                removed += 1;
            }
        }

        tracing::debug!(
            scanned,
            removed,
            elapsed = ?started.elapsed(),
            "header cache sweep finished"
        );
        Ok((scanned, removed))
    }
}

fn key(uid_validity: u32, uid: Uid) -> String {
    format!("header.{uid_validity}.{uid}")
}

fn cache_dir(account: &str) -> Result<PathBuf> {
    let base = dirs::cache_dir()
        .ok_or_else(|| Error::Config("cannot determine platform cache directory".into()))?;
    Ok(base.join("maildeck").join(account))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use maildeck_worker::models::Address;

    use super::*;

    fn sample_header(uid: Uid, created: DateTime<Utc>) -> CachedHeader {
        CachedHeader {
            body_structure: BodyStructure {
                mime_type: "text".into(),
                mime_subtype: "plain".into(),
                params: vec![("charset".into(), "utf-8".into())],
                ..BodyStructure::default()
            },
            envelope: Envelope {
                subject: "cache me".into(),
                from: vec![Address::new(None, "kate", "example.org")],
                message_id: format!("<{uid}@example.org>"),
                ..Envelope::default()
            },
            internal_date: Some(created),
            uid,
            header: b"Subject: cache me\r\n\r\n".to_vec(),
            created,
        }
    }

    #[tokio::test]
    async fn round_trip_is_byte_identical() {
        let cache = HeaderCache::in_memory().await.unwrap();
        let header = sample_header(7, Utc::now());

        cache.put(99, &header).await.unwrap();
        let loaded = cache.get(99, 7).await.unwrap().unwrap();

        assert_eq!(loaded.envelope, header.envelope);
        assert_eq!(loaded.body_structure, header.body_structure);
        assert_eq!(loaded.header, header.header);
        assert_eq!(loaded.uid, 7);
    }

    #[tokio::test]
    async fn uidvalidity_namespaces_keys() {
        let cache = HeaderCache::in_memory().await.unwrap();
        cache.put(1, &sample_header(7, Utc::now())).await.unwrap();

        assert!(cache.get(2, 7).await.unwrap().is_none());
        assert!(cache.get(1, 7).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let cache = HeaderCache::in_memory().await.unwrap();
        let stale = Utc::now() - chrono::TimeDelta::hours(48);
        cache.put(1, &sample_header(1, stale)).await.unwrap();
        cache.put(1, &sample_header(2, Utc::now())).await.unwrap();

        let (scanned, removed) = cache.sweep(Duration::from_secs(24 * 3600)).await.unwrap();
        assert_eq!(scanned, 2);
        assert_eq!(removed, 1);

        assert!(cache.get(1, 1).await.unwrap().is_none());
        assert!(cache.get(1, 2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn undecodable_value_is_a_miss() {
        let cache = HeaderCache::in_memory().await.unwrap();
        sqlx::query("INSERT INTO headers (key, value) VALUES (?, ?)")
            .bind("header.1.5")
            .bind(b"not json".to_vec())
            .execute(&cache.pool)
            .await
            .unwrap();

        assert!(cache.get(1, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tag_mismatch_clears_the_store() {
        let cache = HeaderCache::in_memory().await.unwrap();
        cache.put(1, &sample_header(3, Utc::now())).await.unwrap();

        // Corrupt the tag and re-run the open-time check.
        sqlx::query("UPDATE headers SET value = ? WHERE key = ?")
            .bind(b"0000".to_vec())
            .bind(TAG_KEY)
            .execute(&cache.pool)
            .await
            .unwrap();
        cache.check_tag().await.unwrap();

        assert!(cache.get(1, 3).await.unwrap().is_none());

        // And the tag is rewritten, so the next check keeps data.
        cache.put(1, &sample_header(4, Utc::now())).await.unwrap();
        cache.check_tag().await.unwrap();
        assert!(cache.get(1, 4).await.unwrap().is_some());
    }
}
