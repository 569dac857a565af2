//! Post persistence
//!
//! The dispatcher and workers see posts through [`PostRepository`]; the
//! trait keeps the pipeline testable against an in-memory store and
//! leaves room for a real database behind the same seam. Updates are
//! whole-row: callers mutate a [`Post`] through its guarded transition
//! methods and write it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;

use crate::error::{Result, StoreError};
use crate::types::{Post, PostStatus};

#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn insert(&self, post: &Post) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Post>>;

    /// Write back a post previously loaded from this repository.
    async fn update(&self, post: &Post) -> Result<()>;

    /// Scheduled, non-deleted posts whose scheduled time is at or before
    /// `before`, highest priority first, oldest schedule first within a
    /// priority. At most `limit` rows.
    async fn find_due(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<Post>>;

    /// Non-deleted posts in a given state, for operator tooling.
    async fn find_by_status(&self, status: PostStatus) -> Result<Vec<Post>>;
}

/// In-memory repository for tests and single-process runs.
#[derive(Default)]
pub struct MemoryPostRepository {
    posts: Mutex<HashMap<String, Post>>,
}

impl MemoryPostRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PostRepository for MemoryPostRepository {
    async fn insert(&self, post: &Post) -> Result<()> {
        self.posts
            .lock()
            .await
            .insert(post.id.clone(), post.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Post>> {
        Ok(self.posts.lock().await.get(id).cloned())
    }

    async fn update(&self, post: &Post) -> Result<()> {
        let mut posts = self.posts.lock().await;
        if !posts.contains_key(&post.id) {
            return Err(StoreError::CorruptRecord {
                key: post.id.clone(),
                reason: "update of unknown post".to_string(),
            }
            .into());
        }
        posts.insert(post.id.clone(), post.clone());
        Ok(())
    }

    async fn find_due(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<Post>> {
        let posts = self.posts.lock().await;
        let mut due: Vec<Post> = posts
            .values()
            .filter(|p| {
                p.status == PostStatus::Scheduled
                    && p.deleted_at.is_none()
                    && p.scheduled_at.map(|t| t <= before).unwrap_or(false)
            })
            .cloned()
            .collect();

        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_at.cmp(&b.scheduled_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn find_by_status(&self, status: PostStatus) -> Result<Vec<Post>> {
        let posts = self.posts.lock().await;
        Ok(posts
            .values()
            .filter(|p| p.status == status && p.deleted_at.is_none())
            .cloned()
            .collect())
    }
}

/// SQLite-backed repository. The row keeps the full post as JSON plus
/// the columns `find_due` filters and orders on.
#[derive(Clone)]
pub struct SqlitePostRepository {
    pool: SqlitePool,
}

impl SqlitePostRepository {
    /// Open (or create) the repository at `db_path`, creating parent
    /// directories and the schema as needed.
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::IoError)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));
        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(StoreError::SqlxError)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id           TEXT PRIMARY KEY,
                status       TEXT NOT NULL,
                priority     INTEGER NOT NULL,
                scheduled_at INTEGER,
                deleted      INTEGER NOT NULL DEFAULT 0,
                body         TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(StoreError::SqlxError)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_posts_due
             ON posts (status, deleted, scheduled_at)",
        )
        .execute(&pool)
        .await
        .map_err(StoreError::SqlxError)?;

        Ok(Self { pool })
    }

    fn encode(post: &Post) -> Result<String> {
        serde_json::to_string(post).map_err(|e| {
            StoreError::CorruptRecord {
                key: post.id.clone(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn decode(id: &str, body: &str) -> Result<Post> {
        serde_json::from_str(body).map_err(|e| {
            StoreError::CorruptRecord {
                key: id.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn write_args(post: &Post) -> (String, i64, Option<i64>, i64) {
        (
            post.status.to_string(),
            post.priority as i64,
            post.scheduled_at.map(|t| t.timestamp()),
            post.deleted_at.is_some() as i64,
        )
    }
}

#[async_trait]
impl PostRepository for SqlitePostRepository {
    async fn insert(&self, post: &Post) -> Result<()> {
        let body = Self::encode(post)?;
        let (status, priority, scheduled_at, deleted) = Self::write_args(post);
        sqlx::query(
            "INSERT INTO posts (id, status, priority, scheduled_at, deleted, body)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&post.id)
        .bind(status)
        .bind(priority)
        .bind(scheduled_at)
        .bind(deleted)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Post>> {
        let row = sqlx::query("SELECT body FROM posts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::SqlxError)?;

        match row {
            Some(row) => Ok(Some(Self::decode(id, row.get::<String, _>(0).as_str())?)),
            None => Ok(None),
        }
    }

    async fn update(&self, post: &Post) -> Result<()> {
        let body = Self::encode(post)?;
        let (status, priority, scheduled_at, deleted) = Self::write_args(post);
        let result = sqlx::query(
            "UPDATE posts SET status = ?, priority = ?, scheduled_at = ?, deleted = ?, body = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(priority)
        .bind(scheduled_at)
        .bind(deleted)
        .bind(body)
        .bind(&post.id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::CorruptRecord {
                key: post.id.clone(),
                reason: "update of unknown post".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn find_due(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            "SELECT id, body FROM posts
             WHERE status = ? AND deleted = 0
               AND scheduled_at IS NOT NULL AND scheduled_at <= ?
             ORDER BY priority DESC, scheduled_at ASC
             LIMIT ?",
        )
        .bind(PostStatus::Scheduled.to_string())
        .bind(before.timestamp())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;

        rows.iter()
            .map(|row| Self::decode(&row.get::<String, _>(0), row.get::<String, _>(1).as_str()))
            .collect()
    }

    async fn find_by_status(&self, status: PostStatus) -> Result<Vec<Post>> {
        let rows = sqlx::query("SELECT id, body FROM posts WHERE status = ? AND deleted = 0")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::SqlxError)?;

        rows.iter()
            .map(|row| Self::decode(&row.get::<String, _>(0), row.get::<String, _>(1).as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PlatformTarget, PostContent};
    use chrono::Duration;

    fn scheduled(offset_minutes: i64, priority: i32) -> Post {
        let mut post = Post::new(
            "team-1",
            "author-1",
            PostContent::text("hello"),
            vec![PlatformTarget::new("mastodon", "acct-1")],
        );
        post.status = PostStatus::Scheduled;
        post.scheduled_at = Some(Utc::now() + Duration::minutes(offset_minutes));
        post.priority = priority;
        post
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let repo = MemoryPostRepository::new();
        let post = scheduled(-5, 0);
        repo.insert(&post).await.unwrap();

        let found = repo.find_by_id(&post.id).await.unwrap().unwrap();
        assert_eq!(found.id, post.id);
        assert!(repo.find_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_post_fails() {
        let repo = MemoryPostRepository::new();
        let post = scheduled(-5, 0);
        assert!(repo.update(&post).await.is_err());
    }

    #[tokio::test]
    async fn test_find_due_filters_and_orders() {
        let repo = MemoryPostRepository::new();

        let early_low = scheduled(-30, 0);
        let late_low = scheduled(-5, 0);
        let high = scheduled(-1, 10);
        let future = scheduled(30, 0);
        let mut draft = scheduled(-30, 0);
        draft.status = PostStatus::Draft;
        let mut deleted = scheduled(-30, 0);
        deleted.deleted_at = Some(Utc::now());

        for p in [&early_low, &late_low, &high, &future, &draft, &deleted] {
            repo.insert(p).await.unwrap();
        }

        let due = repo.find_due(Utc::now(), 100).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![&high.id, &early_low.id, &late_low.id]);
    }

    #[tokio::test]
    async fn test_find_due_respects_limit() {
        let repo = MemoryPostRepository::new();
        for _ in 0..5 {
            repo.insert(&scheduled(-5, 0)).await.unwrap();
        }
        assert_eq!(repo.find_due(Utc::now(), 3).await.unwrap().len(), 3);
    }

    async fn sqlite_repo() -> (SqlitePostRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let repo = SqlitePostRepository::new(&dir.path().join("posts.db").to_string_lossy())
            .await
            .unwrap();
        (repo, dir)
    }

    #[tokio::test]
    async fn test_sqlite_insert_update_find() {
        let (repo, _dir) = sqlite_repo().await;
        let mut post = scheduled(-5, 0);
        repo.insert(&post).await.unwrap();

        post.queue().unwrap();
        repo.update(&post).await.unwrap();

        let found = repo.find_by_id(&post.id).await.unwrap().unwrap();
        assert_eq!(found.status, PostStatus::Queued);
        assert_eq!(found.content.text, "hello");
    }

    #[tokio::test]
    async fn test_sqlite_find_due_matches_memory_semantics() {
        let (repo, _dir) = sqlite_repo().await;

        let due = scheduled(-10, 0);
        let high = scheduled(-2, 5);
        let future = scheduled(10, 0);
        let mut deleted = scheduled(-10, 0);
        deleted.deleted_at = Some(Utc::now());

        for p in [&due, &high, &future, &deleted] {
            repo.insert(p).await.unwrap();
        }

        let found = repo.find_due(Utc::now(), 100).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![&high.id, &due.id]);
    }

    #[tokio::test]
    async fn test_sqlite_update_unknown_post_fails() {
        let (repo, _dir) = sqlite_repo().await;
        assert!(repo.update(&scheduled(-5, 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_find_by_status_skips_deleted() {
        let repo = MemoryPostRepository::new();
        let visible = scheduled(-5, 0);
        let mut hidden = scheduled(-5, 0);
        hidden.deleted_at = Some(Utc::now());
        repo.insert(&visible).await.unwrap();
        repo.insert(&hidden).await.unwrap();

        let found = repo.find_by_status(PostStatus::Scheduled).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, visible.id);
    }
}
