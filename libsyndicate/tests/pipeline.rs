//! End-to-end pipeline tests over a SQLite-backed store
//!
//! These exercise the dispatcher, queue, and worker together the way
//! the daemon wires them, with the durable store instead of the
//! in-memory one.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use libsyndicate::config::SchedulerConfig;
use libsyndicate::credentials::{Credential, CredentialManager, CredentialVault, FileVault, RefreshPolicy};
use libsyndicate::dispatcher::{Dispatcher, PUBLISH_JOB};
use libsyndicate::error::AdapterError;
use libsyndicate::events::EventBus;
use libsyndicate::lock::LockService;
use libsyndicate::platforms::mock::MockAdapter;
use libsyndicate::platforms::AdapterRegistry;
use libsyndicate::queue::{JobQueue, QueuePolicy};
use libsyndicate::rate_limiter::{RateLimitConfig, RateLimiter};
use libsyndicate::repository::{MemoryPostRepository, PostRepository};
use libsyndicate::store::{SharedStore, SqliteStore};
use libsyndicate::types::{PlatformTarget, Post, PostContent, PostStatus, MAX_POST_RETRIES};
use libsyndicate::worker::PublishWorker;

struct Pipeline {
    repo: Arc<MemoryPostRepository>,
    queue: JobQueue,
    dispatcher: Dispatcher,
    worker: PublishWorker,
    adapter: Arc<MockAdapter>,
    _dir: TempDir,
}

async fn pipeline(adapter: MockAdapter, limits: HashMap<String, RateLimitConfig>) -> Result<Pipeline> {
    let dir = TempDir::new()?;
    let store: Arc<dyn SharedStore> =
        Arc::new(SqliteStore::new(&dir.path().join("pipeline.db").to_string_lossy()).await?);

    let events = EventBus::new(100);
    let policy = QueuePolicy {
        backoff_base: Duration::from_millis(10),
        ..Default::default()
    };
    let queue = JobQueue::new(store.clone(), policy, events.clone());
    let locks = LockService::new(store.clone(), Duration::from_secs(300));
    let repo = Arc::new(MemoryPostRepository::new());

    let adapter = Arc::new(adapter);
    let mut registry = AdapterRegistry::new();
    registry.register(adapter.clone());

    let vault: Arc<dyn CredentialVault> = Arc::new(FileVault::new(dir.path().join("creds")));
    let credentials = Arc::new(CredentialManager::new(
        vault,
        SecretString::from("pipeline-passphrase".to_string()),
        RefreshPolicy::default(),
        events.clone(),
    ));
    let now = Utc::now();
    credentials
        .save(&Credential::new(
            "acct-1",
            "mock",
            SecretString::from("access".to_string()),
            SecretString::from("refresh".to_string()),
            now,
            now + ChronoDuration::days(60),
        ))
        .await?;

    let limiter = Arc::new(RateLimiter::new(limits, events.clone()));

    let dispatcher = Dispatcher::new(
        repo.clone(),
        queue.clone(),
        locks,
        events.clone(),
        &SchedulerConfig::default(),
    );
    let worker = PublishWorker::new(
        repo.clone(),
        queue.clone(),
        Arc::new(registry),
        credentials,
        limiter,
        events,
    );

    Ok(Pipeline {
        repo,
        queue,
        dispatcher,
        worker,
        adapter,
        _dir: dir,
    })
}

fn due_post() -> Post {
    let mut post = Post::new(
        "team-1",
        "author-1",
        PostContent::text("release announcement"),
        vec![PlatformTarget::new("mock", "acct-1")],
    );
    post.status = PostStatus::Scheduled;
    post.scheduled_at = Some(Utc::now() - ChronoDuration::minutes(1));
    post
}

/// Run the worker until the publish queue is drained.
async fn drain(p: &Pipeline) -> Result<()> {
    loop {
        p.worker.process_one(Duration::from_millis(50)).await?;
        let stats = p.queue.stats(PUBLISH_JOB).await?;
        if stats.ready == 0 && stats.processing == 0 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
}

#[tokio::test]
async fn test_scheduled_post_publishes_in_one_tick() -> Result<()> {
    let p = pipeline(MockAdapter::new("mock"), HashMap::new()).await?;
    let post = due_post();
    p.repo.insert(&post).await?;

    assert_eq!(p.dispatcher.tick().await?, 1);
    assert!(p.worker.process_one(Duration::from_millis(100)).await?);

    let stored = p.repo.find_by_id(&post.id).await?.unwrap();
    assert_eq!(stored.status, PostStatus::Published);
    assert!(stored.published_at.is_some());

    let stats = p.queue.stats(PUBLISH_JOB).await?;
    assert_eq!((stats.ready, stats.processing, stats.dead), (0, 0, 0));
    Ok(())
}

#[tokio::test]
async fn test_transient_failures_exhaust_post_attempts() -> Result<()> {
    let p = pipeline(
        MockAdapter::always_failing("mock", "connection reset"),
        HashMap::new(),
    )
    .await?;
    let post = due_post();
    p.repo.insert(&post).await?;

    p.dispatcher.tick().await?;
    drain(&p).await?;

    let stored = p.repo.find_by_id(&post.id).await?.unwrap();
    assert_eq!(stored.status, PostStatus::Failed);
    assert_eq!(stored.retry_count, MAX_POST_RETRIES);
    assert_eq!(
        *p.adapter.config().publish_calls.lock().unwrap(),
        MAX_POST_RETRIES as usize
    );

    // Dispatcher never re-dispatches a terminally failed post
    assert_eq!(p.dispatcher.tick().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_post_can_be_rescheduled_by_hand() -> Result<()> {
    let p = pipeline(
        MockAdapter::scripted(
            "mock",
            vec![Err(AdapterError::Rejected("too long".to_string()))],
        ),
        HashMap::new(),
    )
    .await?;
    let post = due_post();
    p.repo.insert(&post).await?;

    p.dispatcher.tick().await?;
    drain(&p).await?;
    let mut failed = p.repo.find_by_id(&post.id).await?.unwrap();
    assert_eq!(failed.status, PostStatus::Failed);

    // Operator trims the content and reschedules; the pipeline picks it
    // up again and the now-exhausted script succeeds.
    failed.schedule(Utc::now() + ChronoDuration::milliseconds(5))?;
    p.repo.update(&failed).await?;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(p.dispatcher.tick().await?, 1);
    drain(&p).await?;
    assert_eq!(
        p.repo.find_by_id(&post.id).await?.unwrap().status,
        PostStatus::Published
    );
    Ok(())
}

#[tokio::test]
async fn test_unapproved_post_never_reaches_the_queue() -> Result<()> {
    let p = pipeline(MockAdapter::new("mock"), HashMap::new()).await?;
    let mut post = due_post();
    post.approval.required = true;
    p.repo.insert(&post).await?;

    assert_eq!(p.dispatcher.tick().await?, 0);
    assert_eq!(p.queue.queue_len(PUBLISH_JOB).await?, 0);

    // Approval opens the gate
    let mut stored = p.repo.find_by_id(&post.id).await?.unwrap();
    stored.approve("editor-1");
    p.repo.update(&stored).await?;

    assert_eq!(p.dispatcher.tick().await?, 1);
    drain(&p).await?;
    assert_eq!(
        p.repo.find_by_id(&post.id).await?.unwrap().status,
        PostStatus::Published
    );
    Ok(())
}

#[tokio::test]
async fn test_cancel_between_dispatch_and_publish_is_honored() -> Result<()> {
    let p = pipeline(MockAdapter::new("mock"), HashMap::new()).await?;
    let post = due_post();
    p.repo.insert(&post).await?;

    p.dispatcher.tick().await?;

    let mut stored = p.repo.find_by_id(&post.id).await?.unwrap();
    stored.cancel()?;
    p.repo.update(&stored).await?;

    assert!(p.worker.process_one(Duration::from_millis(100)).await?);
    assert_eq!(*p.adapter.config().publish_calls.lock().unwrap(), 0);
    assert_eq!(
        p.repo.find_by_id(&post.id).await?.unwrap().status,
        PostStatus::Canceled
    );
    Ok(())
}

#[tokio::test]
async fn test_rate_limited_attempt_leaves_post_queued() -> Result<()> {
    let mut limits = HashMap::new();
    limits.insert(
        "mock".to_string(),
        RateLimitConfig {
            posts_per_window: 1,
            window_secs: 86_400,
            burst: 1,
            daily_cap: None,
        },
    );
    let p = pipeline(MockAdapter::new("mock"), limits).await?;

    let first = due_post();
    let second = due_post();
    p.repo.insert(&first).await?;
    p.repo.insert(&second).await?;

    assert_eq!(p.dispatcher.tick().await?, 2);
    p.worker.process_one(Duration::from_millis(100)).await?;
    p.worker.process_one(Duration::from_millis(100)).await?;

    let statuses = [
        p.repo.find_by_id(&first.id).await?.unwrap().status,
        p.repo.find_by_id(&second.id).await?.unwrap().status,
    ];

    // One published, the other refused admission and still queued
    assert!(statuses.contains(&PostStatus::Published));
    assert!(statuses.contains(&PostStatus::Queued));

    // The refused job is parked for redelivery, not dead
    let stats = p.queue.stats(PUBLISH_JOB).await?;
    assert_eq!(stats.ready, 1);
    assert_eq!(stats.dead, 0);
    Ok(())
}

#[tokio::test]
async fn test_two_dispatchers_share_one_store_without_double_enqueue() -> Result<()> {
    let dir = TempDir::new()?;
    let store: Arc<dyn SharedStore> =
        Arc::new(SqliteStore::new(&dir.path().join("shared.db").to_string_lossy()).await?);

    let events = EventBus::new(100);
    let queue = JobQueue::new(store.clone(), QueuePolicy::default(), events.clone());
    let repo = Arc::new(MemoryPostRepository::new());

    let make = |repo: Arc<MemoryPostRepository>, queue: JobQueue, events: EventBus| {
        Dispatcher::new(
            repo,
            queue,
            LockService::new(store.clone(), Duration::from_secs(300)),
            events,
            &SchedulerConfig::default(),
        )
    };
    let a = make(repo.clone(), queue.clone(), events.clone());
    let b = make(repo.clone(), queue.clone(), events);

    for _ in 0..10 {
        repo.insert(&due_post()).await?;
    }

    let (ra, rb) = tokio::join!(a.tick(), b.tick());
    assert_eq!(ra? + rb?, 10, "each due post dispatched exactly once");
    assert_eq!(queue.queue_len(PUBLISH_JOB).await?, 10);
    Ok(())
}
