//! Publish worker
//!
//! Claims publish jobs from the queue and drives a post through its
//! publish attempt: admission through the rate limiter, a usable
//! credential per target, the platform adapter call, and the resulting
//! lifecycle transition.
//!
//! Failure handling distinguishes the two retry counters. Transient
//! trouble fails both the post and the job, so the queue's backoff
//! redelivers it and the worker re-activates the post while its own
//! attempt counter lasts. Permanent trouble (rejected content, a
//! credential needing reconnect, an unknown platform) fails the post
//! and completes the job: redelivery could not help. A rate-limiter
//! refusal fails only the job; the post stays `Queued` because no
//! attempt was made.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::credentials::{Credential, CredentialManager};
use crate::dispatcher::{POST_ID_KEY, PUBLISH_JOB};
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::platforms::{AdapterRegistry, PublishAdapter};
use crate::queue::{Job, JobQueue};
use crate::rate_limiter::RateLimiter;
use crate::repository::PostRepository;
use crate::types::{Post, PostStatus};

/// How long a worker blocks on an empty queue per loop pass.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct PublishWorker {
    repo: Arc<dyn PostRepository>,
    queue: JobQueue,
    adapters: Arc<AdapterRegistry>,
    credentials: Arc<CredentialManager>,
    limiter: Arc<RateLimiter>,
    events: EventBus,
}

impl PublishWorker {
    pub fn new(
        repo: Arc<dyn PostRepository>,
        queue: JobQueue,
        adapters: Arc<AdapterRegistry>,
        credentials: Arc<CredentialManager>,
        limiter: Arc<RateLimiter>,
        events: EventBus,
    ) -> Self {
        Self {
            repo,
            queue,
            adapters,
            credentials,
            limiter,
            events,
        }
    }

    /// Claim and handle one job, blocking up to `timeout` on an empty
    /// queue. Returns whether a job was handled.
    pub async fn process_one(&self, timeout: Duration) -> Result<bool> {
        let job = match self.queue.dequeue(PUBLISH_JOB, timeout).await? {
            Some(job) => job,
            None => return Ok(false),
        };

        if let Err(e) = self.handle_job(&job).await {
            // Infrastructure trouble while handling; let the queue's
            // backoff redeliver the job.
            warn!(job_id = %job.id, error = %e, "Job handling failed");
            self.queue.mark_failed(PUBLISH_JOB, &job.id, &e.to_string()).await?;
        }
        Ok(true)
    }

    async fn handle_job(&self, job: &Job) -> Result<()> {
        let post_id = match job.payload.get(POST_ID_KEY) {
            Some(id) => id.clone(),
            None => {
                error!(job_id = %job.id, "Publish job carries no post id; discarding");
                return self.queue.mark_complete(PUBLISH_JOB, &job.id).await;
            }
        };

        let post = match self.repo.find_by_id(&post_id).await? {
            Some(post) => post,
            None => {
                debug!(post_id, "Post no longer exists; completing stale job");
                return self.queue.mark_complete(PUBLISH_JOB, &job.id).await;
            }
        };

        match self.prepare(post, job).await? {
            Some(post) => self.attempt(post, job).await,
            None => Ok(()),
        }
    }

    /// Sort out what a delivered job means for the post right now.
    /// Returns the post ready for a publish attempt, or `None` when the
    /// job was resolved without one.
    async fn prepare(&self, mut post: Post, job: &Job) -> Result<Option<Post>> {
        if post.deleted_at.is_some() || post.status.is_terminal() {
            debug!(post_id = %post.id, status = %post.status, "Post is stale; completing job");
            self.queue.mark_complete(PUBLISH_JOB, &job.id).await?;
            return Ok(None);
        }

        if post.status == PostStatus::Failed {
            if !post.can_retry() {
                debug!(post_id = %post.id, "Post out of attempts; completing job");
                self.queue.mark_complete(PUBLISH_JOB, &job.id).await?;
                return Ok(None);
            }
            // Redelivered after a transient failure: walk the post back
            // into the queue for another attempt.
            post.reactivate()?;
            self.repo.update(&post).await?;
            self.events.emit(Event::PostTransitioned {
                post_id: post.id.clone(),
                from: PostStatus::Failed,
                to: PostStatus::Queued,
            });
        }

        if !post.can_publish() {
            debug!(post_id = %post.id, status = %post.status, "Post not publishable; completing job");
            self.queue.mark_complete(PUBLISH_JOB, &job.id).await?;
            return Ok(None);
        }

        Ok(Some(post))
    }

    async fn attempt(&self, mut post: Post, job: &Job) -> Result<()> {
        // Admission first, across all targets as one unit: a refusal
        // means no attempt happened and no token was consumed, so the
        // post keeps its Queued state and its attempt counter.
        let targets: Vec<(&str, &str)> = post
            .targets
            .iter()
            .map(|t| (t.platform.as_str(), t.account_id.as_str()))
            .collect();
        if !self.limiter.allow_all(&targets).await {
            debug!(post_id = %post.id, "Rate limited; deferring job");
            return self
                .queue
                .mark_failed(PUBLISH_JOB, &job.id, "rate limited")
                .await;
        }

        // A usable credential per target, refreshed when near expiry.
        let mut prepared: Vec<(Arc<dyn PublishAdapter>, Credential)> = Vec::new();
        for target in &post.targets {
            let adapter = match self.adapters.get(&target.platform) {
                Ok(adapter) => adapter,
                Err(e) => return self.fail_post(post, job, e).await,
            };
            match self
                .credentials
                .refresh_if_needed(adapter.as_ref(), &target.account_id)
                .await
            {
                Ok(credential) => prepared.push((adapter, credential)),
                Err(e) => return self.fail_post(post, job, e).await,
            }
        }

        post.mark_publishing()?;
        self.repo.update(&post).await?;
        self.events.emit(Event::PostTransitioned {
            post_id: post.id.clone(),
            from: PostStatus::Queued,
            to: PostStatus::Publishing,
        });

        for (adapter, credential) in &prepared {
            if let Err(e) = adapter.publish(credential, &post.content).await {
                return self.fail_post(post, job, e).await;
            }
        }

        post.mark_published()?;
        self.repo.update(&post).await?;
        self.events.emit(Event::PostTransitioned {
            post_id: post.id.clone(),
            from: PostStatus::Publishing,
            to: PostStatus::Published,
        });
        info!(post_id = %post.id, "Post published");

        self.queue.mark_complete(PUBLISH_JOB, &job.id).await
    }

    /// Record a failed attempt on the post, then resolve the job: fail
    /// it for retryable trouble, complete it when redelivery could not
    /// help.
    async fn fail_post(
        &self,
        mut post: Post,
        job: &Job,
        error: crate::error::SyndicateError,
    ) -> Result<()> {
        let from = post.status;
        let attempts_before = post.retry_count;
        post.mark_failed(error.to_string())?;
        if matches!(error, crate::error::SyndicateError::Credential(_)) {
            // A reconnect is user work, not a publish attempt; don't
            // charge the post's own counter for it.
            post.retry_count = attempts_before;
        }
        self.repo.update(&post).await?;
        self.events.emit(Event::PostTransitioned {
            post_id: post.id.clone(),
            from,
            to: PostStatus::Failed,
        });

        if error.is_retryable() {
            warn!(post_id = %post.id, error = %error, "Publish attempt failed; will retry");
            self.queue
                .mark_failed(PUBLISH_JOB, &job.id, &error.to_string())
                .await
        } else {
            warn!(post_id = %post.id, error = %error, "Publish attempt failed permanently");
            self.queue.mark_complete(PUBLISH_JOB, &job.id).await
        }
    }

    /// Worker loop: drain jobs until the shutdown flag is set. The
    /// dequeue timeout doubles as the shutdown poll interval.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested, stopping worker loop");
                break;
            }
            if let Err(e) = self.process_one(DEQUEUE_TIMEOUT).await {
                warn!(error = %e, "Worker pass failed");
            }
        }
        Ok(())
    }
}
