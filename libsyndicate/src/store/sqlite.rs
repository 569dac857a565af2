//! Durable SQLite-backed store
//!
//! Shared between the daemon and operator tooling through the database
//! file. SQLite serializes writers, so each statement (or transaction)
//! below is atomic with respect to concurrent callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use std::path::Path;
use std::time::Duration;

use super::SharedStore;
use crate::error::StoreError;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the store at `db_path`, creating parent
    /// directories and the schema as needed.
    pub async fn new(db_path: &str) -> Result<Self, StoreError> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Use forward slashes for the SQLite URL and mode=rwc so the
        // database file is created on first open.
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));
        let pool = SqlitePool::connect(&db_url).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS list_items (
                seq          INTEGER PRIMARY KEY AUTOINCREMENT,
                list         TEXT NOT NULL,
                item         TEXT NOT NULL,
                available_at INTEGER NOT NULL,
                added_at     INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_list_items_list
             ON list_items (list, available_at, seq)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// Timestamps are stored as Unix milliseconds. Whole seconds are too
// coarse for cutoffs taken moments after an insert, where this store
// must agree with the in-memory one.
fn expiry_ts(ttl: Duration) -> i64 {
    Utc::now().timestamp_millis() + ttl.as_millis() as i64
}

#[async_trait]
impl SharedStore for SqliteStore {
    async fn put_record(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO records (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry_ts(ttl))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT value FROM records WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.0))
    }

    async fn delete_record(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM records WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        // An expired holder counts as absent; the upsert's WHERE clause
        // makes check-and-take a single atomic statement.
        let result = sqlx::query(
            r#"
            INSERT INTO records (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            WHERE records.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry_ts(ttl))
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM records WHERE key = ? AND value = ?")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_push(
        &self,
        list: &str,
        item: &str,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO list_items (list, item, available_at, added_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(list)
        .bind(item)
        .bind(available_at.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_move_first(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<String>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, (i64, String)>(
            "SELECT seq, item FROM list_items
             WHERE list = ? AND available_at <= ?
             ORDER BY seq LIMIT 1",
        )
        .bind(src)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let (seq, item) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        sqlx::query("DELETE FROM list_items WHERE seq = ?")
            .bind(seq)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO list_items (list, item, available_at, added_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(dst)
        .bind(&item)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(item))
    }

    async fn list_move_item(
        &self,
        src: &str,
        dst: &str,
        item: &str,
        available_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT seq FROM list_items WHERE list = ? AND item = ? LIMIT 1",
        )
        .bind(src)
        .bind(item)
        .fetch_optional(&mut *tx)
        .await?;

        let seq = match row {
            Some((seq,)) => seq,
            None => return Ok(false),
        };

        sqlx::query("DELETE FROM list_items WHERE seq = ?")
            .bind(seq)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO list_items (list, item, available_at, added_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(dst)
        .bind(item)
        .bind(available_at.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_remove(&self, list: &str, item: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM list_items
             WHERE seq IN (
                 SELECT seq FROM list_items WHERE list = ? AND item = ? LIMIT 1
             )",
        )
        .bind(list)
        .bind(item)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_len(&self, list: &str) -> Result<u64, StoreError> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM list_items WHERE list = ?",
        )
        .bind(list)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u64)
    }

    async fn list_older_than(
        &self,
        list: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT item FROM list_items
             WHERE list = ? AND added_at < ?
             ORDER BY seq",
        )
        .bind(list)
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn list_items(&self, list: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT item FROM list_items WHERE list = ? ORDER BY seq",
        )
        .bind(list)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}
