//! SQLite implementation of the engine's blob store.
//!
//! One `records` table holds every session and index record. The version
//! column makes conditional writes a single `UPDATE ... WHERE version = ?`.

use async_trait::async_trait;
use docsign_core::{BlobStore, Expect, StoreError, Versioned};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

pub struct SqliteStore {
    pool: SqlitePool,
    max_record_bytes: usize,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, max_record_bytes: usize) -> Self {
        Self {
            pool,
            max_record_bytes,
        }
    }

    /// Create the records table if needed
    pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        tracing::info!("Running database migrations...");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(pool)
        .await?;

        tracing::info!("Migrations complete");
        Ok(())
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    tracing::error!("Database error: {}", e);
    StoreError::Unavailable(e.to_string())
}

fn conflict(key: &str) -> StoreError {
    StoreError::Conflict {
        key: key.to_string(),
    }
}

#[async_trait]
impl BlobStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>, StoreError> {
        let row = sqlx::query("SELECT value, version FROM records WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let value: Vec<u8> = row.try_get("value").map_err(unavailable)?;
        let version: i64 = row.try_get("version").map_err(unavailable)?;
        Ok(Some(Versioned {
            value,
            version: version as u64,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>, expect: Expect) -> Result<u64, StoreError> {
        if value.len() > self.max_record_bytes {
            return Err(StoreError::TooLarge {
                key: key.to_string(),
                size: value.len(),
                limit: self.max_record_bytes,
            });
        }

        match expect {
            Expect::Absent => {
                let result = sqlx::query(
                    "INSERT OR IGNORE INTO records (key, value, version) VALUES (?, ?, 1)",
                )
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
                if result.rows_affected() == 0 {
                    return Err(conflict(key));
                }
                Ok(1)
            }
            Expect::Version(expected) => {
                let result = sqlx::query(
                    r#"
                    UPDATE records
                    SET value = ?, version = version + 1, updated_at = datetime('now')
                    WHERE key = ? AND version = ?
                    "#,
                )
                .bind(value)
                .bind(key)
                .bind(expected as i64)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
                if result.rows_affected() == 0 {
                    return Err(conflict(key));
                }
                Ok(expected + 1)
            }
            Expect::Any => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO records (key, value, version) VALUES (?, ?, 1)
                    ON CONFLICT(key) DO UPDATE
                    SET value = excluded.value,
                        version = records.version + 1,
                        updated_at = datetime('now')
                    RETURNING version
                    "#,
                )
                .bind(key)
                .bind(value)
                .fetch_one(&self.pool)
                .await
                .map_err(unavailable)?;
                let version: i64 = row.try_get("version").map_err(unavailable)?;
                Ok(version as u64)
            }
        }
    }

    fn max_record_bytes(&self) -> usize {
        self.max_record_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store(limit: usize) -> SqliteStore {
        // A single connection keeps the in-memory database alive and shared
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteStore::run_migrations(&pool).await.unwrap();
        SqliteStore::new(pool, limit)
    }

    #[tokio::test]
    async fn test_absent_then_conflict() {
        let store = store(1024).await;
        assert_eq!(store.put("k", b"one".to_vec(), Expect::Absent).await.unwrap(), 1);
        let err = store.put("k", b"two".to_vec(), Expect::Absent).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let got = store.get("k").await.unwrap().unwrap();
        assert_eq!(got.value, b"one");
        assert_eq!(got.version, 1);
    }

    #[tokio::test]
    async fn test_versioned_write_rejects_stale_version() {
        let store = store(1024).await;
        store.put("k", b"v1".to_vec(), Expect::Absent).await.unwrap();
        assert_eq!(
            store.put("k", b"v2".to_vec(), Expect::Version(1)).await.unwrap(),
            2
        );
        let err = store
            .put("k", b"stale".to_vec(), Expect::Version(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"v2");
    }

    #[tokio::test]
    async fn test_versioned_write_on_missing_key_conflicts() {
        let store = store(1024).await;
        let err = store
            .put("missing", b"x".to_vec(), Expect::Version(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unconditional_write_bumps_version() {
        let store = store(1024).await;
        assert_eq!(store.put("k", b"a".to_vec(), Expect::Any).await.unwrap(), 1);
        assert_eq!(store.put("k", b"b".to_vec(), Expect::Any).await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"b");
    }

    #[tokio::test]
    async fn test_record_size_ceiling() {
        let store = store(4).await;
        let err = store
            .put("k", b"too large".to_vec(), Expect::Absent)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TooLarge { size: 9, limit: 4, .. }));
    }
}
