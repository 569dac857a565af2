//! Due-post dispatcher
//!
//! Each tick finds scheduled posts whose time has arrived, claims a
//! per-post lock so concurrent dispatchers never double-enqueue, moves
//! the post to `Queued`, and hands a publish job to the queue. The lock
//! is released only after the job is durably enqueued; a dispatcher
//! that dies mid-dispatch leaves a lock that expires on its own.
//!
//! Per-post trouble is logged and skipped so one bad row never stalls
//! the batch. Lock contention is not trouble at all: another dispatcher
//! simply got there first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use chrono::Utc;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::lock::LockService;
use crate::queue::JobQueue;
use crate::repository::PostRepository;
use crate::types::{Post, PostStatus};

/// Job type carried on the queue for publish work.
pub const PUBLISH_JOB: &str = "publish_post";

/// Payload key holding the post identifier.
pub const POST_ID_KEY: &str = "post_id";

pub struct Dispatcher {
    repo: Arc<dyn PostRepository>,
    queue: JobQueue,
    locks: LockService,
    events: EventBus,
    batch_size: usize,
    reclaim_after: Duration,
}

impl Dispatcher {
    pub fn new(
        repo: Arc<dyn PostRepository>,
        queue: JobQueue,
        locks: LockService,
        events: EventBus,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            repo,
            queue,
            locks,
            events,
            batch_size: config.batch_size,
            reclaim_after: Duration::from_secs(config.reclaim_after_secs),
        }
    }

    /// One dispatch pass. Returns the number of posts handed to the
    /// queue.
    pub async fn tick(&self) -> Result<usize> {
        let due = self.repo.find_due(Utc::now(), self.batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }

        debug!(count = due.len(), "Found due posts");

        let mut dispatched = 0;
        for post in due {
            match self.dispatch_one(&post.id).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(post_id = %post.id, error = %e, "Failed to dispatch post; skipping");
                }
            }
        }

        if dispatched > 0 {
            info!(dispatched, "Dispatched due posts");
        }
        Ok(dispatched)
    }

    /// Claim, queue, and enqueue a single post. Returns `false` when the
    /// post was skipped (lock contention, or no longer dispatchable by
    /// the time the lock was held).
    async fn dispatch_one(&self, post_id: &str) -> Result<bool> {
        let guard = match self.locks.try_acquire(&format!("post:{}", post_id)).await? {
            Some(guard) => guard,
            None => {
                debug!(post_id, "Post locked by another dispatcher; skipping");
                return Ok(false);
            }
        };

        // Re-read under the lock: another dispatcher may have handled
        // this post between find_due and acquire.
        let result = match self.repo.find_by_id(post_id).await? {
            Some(post) => self.queue_post(post).await,
            None => Ok(false),
        };

        // Enqueue is durable by now; contention on a fresh tick is fine.
        let released = guard.release().await?;
        if !released {
            warn!(post_id, "Dispatch lock expired before release");
        }
        result
    }

    async fn queue_post(&self, mut post: Post) -> Result<bool> {
        if post.status != PostStatus::Scheduled || post.deleted_at.is_some() {
            return Ok(false);
        }
        if !post.approval.satisfied() {
            debug!(post_id = %post.id, "Post awaiting approval; not dispatching");
            return Ok(false);
        }

        post.queue()?;
        self.repo.update(&post).await?;
        self.events.emit(Event::PostTransitioned {
            post_id: post.id.clone(),
            from: PostStatus::Scheduled,
            to: PostStatus::Queued,
        });

        let mut payload = HashMap::new();
        payload.insert(POST_ID_KEY.to_string(), post.id.clone());
        self.queue.enqueue(PUBLISH_JOB, payload).await?;

        Ok(true)
    }

    /// Return in-flight jobs abandoned by crashed workers to the ready
    /// queue.
    pub async fn reclaim(&self) -> Result<u64> {
        self.queue.reclaim_stale(PUBLISH_JOB, self.reclaim_after).await
    }

    /// Daemon loop: tick and reclaim every `poll_interval`, checking the
    /// shutdown flag every second while sleeping.
    pub async fn run(&self, poll_interval: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested, stopping dispatcher loop");
                break;
            }

            if let Err(e) = self.tick().await {
                warn!(error = %e, "Dispatch tick failed");
            }
            match self.reclaim().await {
                Ok(0) => {}
                Ok(n) => warn!(reclaimed = n, "Returned abandoned jobs to the ready queue"),
                Err(e) => warn!(error = %e, "Reclaim pass failed"),
            }

            let mut remaining = poll_interval;
            while !remaining.is_zero() {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let step = remaining.min(Duration::from_secs(1));
                sleep(step).await;
                remaining -= step;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueuePolicy;
    use crate::repository::MemoryPostRepository;
    use crate::store::{MemoryStore, SharedStore};
    use crate::types::{PlatformTarget, PostContent};
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        repo: Arc<MemoryPostRepository>,
        queue: JobQueue,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let events = EventBus::new(100);
        let queue = JobQueue::new(store.clone(), QueuePolicy::default(), events.clone());
        let locks = LockService::new(store, Duration::from_secs(300));
        let repo = Arc::new(MemoryPostRepository::new());
        let dispatcher = Dispatcher::new(
            repo.clone(),
            queue.clone(),
            locks,
            events,
            &SchedulerConfig::default(),
        );
        Fixture {
            repo,
            queue,
            dispatcher,
        }
    }

    fn due_post() -> Post {
        let mut post = Post::new(
            "team-1",
            "author-1",
            PostContent::text("hello"),
            vec![PlatformTarget::new("mastodon", "acct-1")],
        );
        post.status = PostStatus::Scheduled;
        post.scheduled_at = Some(Utc::now() - ChronoDuration::minutes(1));
        post
    }

    #[tokio::test]
    async fn test_tick_queues_due_post_and_enqueues_job() {
        let f = fixture();
        let post = due_post();
        f.repo.insert(&post).await.unwrap();

        assert_eq!(f.dispatcher.tick().await.unwrap(), 1);

        let stored = f.repo.find_by_id(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Queued);

        let job = f
            .queue
            .dequeue(PUBLISH_JOB, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.payload[POST_ID_KEY], post.id);
    }

    #[tokio::test]
    async fn test_tick_ignores_future_posts() {
        let f = fixture();
        let mut post = due_post();
        post.scheduled_at = Some(Utc::now() + ChronoDuration::hours(1));
        f.repo.insert(&post).await.unwrap();

        assert_eq!(f.dispatcher.tick().await.unwrap(), 0);
        assert_eq!(
            f.repo.find_by_id(&post.id).await.unwrap().unwrap().status,
            PostStatus::Scheduled
        );
    }

    #[tokio::test]
    async fn test_unapproved_post_is_not_dispatched() {
        let f = fixture();
        let mut post = due_post();
        post.approval.required = true;
        f.repo.insert(&post).await.unwrap();

        assert_eq!(f.dispatcher.tick().await.unwrap(), 0);
        assert_eq!(
            f.repo.find_by_id(&post.id).await.unwrap().unwrap().status,
            PostStatus::Scheduled
        );
    }

    #[tokio::test]
    async fn test_second_tick_does_not_double_enqueue() {
        let f = fixture();
        f.repo.insert(&due_post()).await.unwrap();

        assert_eq!(f.dispatcher.tick().await.unwrap(), 1);
        assert_eq!(f.dispatcher.tick().await.unwrap(), 0);
        assert_eq!(f.queue.queue_len(PUBLISH_JOB).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_held_lock_skips_post_without_error() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let events = EventBus::new(100);
        let queue = JobQueue::new(store.clone(), QueuePolicy::default(), events.clone());
        let locks = LockService::new(store.clone(), Duration::from_secs(300));
        let repo = Arc::new(MemoryPostRepository::new());
        let dispatcher = Dispatcher::new(
            repo.clone(),
            queue.clone(),
            locks.clone(),
            events,
            &SchedulerConfig::default(),
        );

        let post = due_post();
        repo.insert(&post).await.unwrap();

        // Another dispatcher holds the per-post lock
        let foreign = locks
            .try_acquire(&format!("post:{}", post.id))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(dispatcher.tick().await.unwrap(), 0);
        assert_eq!(
            repo.find_by_id(&post.id).await.unwrap().unwrap().status,
            PostStatus::Scheduled
        );

        // Once the holder releases, the next tick dispatches
        assert!(foreign.release().await.unwrap());
        assert_eq!(dispatcher.tick().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tick_emits_transition_event() {
        let f = fixture();
        let mut receiver = f.dispatcher.events.subscribe();
        f.repo.insert(&due_post()).await.unwrap();
        f.dispatcher.tick().await.unwrap();

        let mut saw_transition = false;
        while let Ok(event) = receiver.try_recv() {
            if matches!(
                event,
                Event::PostTransitioned {
                    from: PostStatus::Scheduled,
                    to: PostStatus::Queued,
                    ..
                }
            ) {
                saw_transition = true;
            }
        }
        assert!(saw_transition);
    }

    #[tokio::test]
    async fn test_batch_size_limits_tick() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let events = EventBus::new(100);
        let queue = JobQueue::new(store.clone(), QueuePolicy::default(), events.clone());
        let locks = LockService::new(store, Duration::from_secs(300));
        let repo = Arc::new(MemoryPostRepository::new());
        let config = SchedulerConfig {
            batch_size: 2,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(repo.clone(), queue, locks, events, &config);

        for _ in 0..5 {
            repo.insert(&due_post()).await.unwrap();
        }

        assert_eq!(dispatcher.tick().await.unwrap(), 2);
        assert_eq!(dispatcher.tick().await.unwrap(), 2);
        assert_eq!(dispatcher.tick().await.unwrap(), 1);
    }
}
