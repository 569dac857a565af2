//! Durable job queue with retry, backoff and dead-letter semantics
//!
//! Jobs are delivered at least once: every dequeued job is eventually
//! completed, retried, or moved to the dead-letter queue; the queue never
//! silently drops one. Within a named queue delivery is FIFO relative to
//! enqueue order, but retried jobs re-enter at the back with a delay, so
//! no global ordering holds across retries.
//!
//! The queue stores nothing itself; all state lives in the
//! [`SharedStore`], which makes every transition atomic and lets many
//! worker processes pull from the same queues.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::events::{Event, EventBus};
use crate::store::SharedStore;

/// Polling granularity for blocking dequeues.
const DEQUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A unit of deferred work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    /// Opaque payload; the queue never interprets it
    pub payload: HashMap<String, String>,
    pub created_at: chrono::DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl Job {
    fn new(job_type: &str, payload: HashMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.to_string(),
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Counters for one named queue. No side effects.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub ready: u64,
    pub processing: u64,
    pub dead: u64,
}

/// Retry and retention policy for the queue.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    /// Failures beyond this count dead-letter the job
    pub max_retries: u32,
    /// First retry delay; doubles on each subsequent failure
    pub backoff_base: Duration,
    /// How long job records live while ready/in flight
    pub record_ttl: Duration,
    /// How long dead-lettered records are kept for inspection
    pub dead_record_ttl: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(600),
            record_ttl: Duration::from_secs(7 * 24 * 3600),
            dead_record_ttl: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Multi-queue job dispatcher over a [`SharedStore`].
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn SharedStore>,
    policy: QueuePolicy,
    events: EventBus,
}

fn record_key(job_type: &str, job_id: &str) -> String {
    format!("job:{}:{}", job_type, job_id)
}

fn ready_list(job_type: &str) -> String {
    format!("queue:{}:ready", job_type)
}

fn processing_list(job_type: &str) -> String {
    format!("queue:{}:processing", job_type)
}

fn dead_list(job_type: &str) -> String {
    format!("queue:{}:dead", job_type)
}

impl JobQueue {
    pub fn new(store: Arc<dyn SharedStore>, policy: QueuePolicy, events: EventBus) -> Self {
        Self {
            store,
            policy,
            events,
        }
    }

    /// Store a job record and append its identifier to the named ready
    /// queue. Returns the new job's identifier.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: HashMap<String, String>,
    ) -> Result<String> {
        let job = Job::new(job_type, payload);
        let encoded = encode_job(&job)?;

        self.store
            .put_record(&record_key(job_type, &job.id), &encoded, self.policy.record_ttl)
            .await?;
        self.store
            .list_push(&ready_list(job_type), &job.id, Utc::now())
            .await?;

        info!(job_type, job_id = %job.id, "Job enqueued");
        self.events.emit(Event::JobEnqueued {
            job_type: job_type.to_string(),
            job_id: job.id.clone(),
        });
        Ok(job.id)
    }

    /// Atomically claim one job from the named ready queue, blocking up
    /// to `timeout`.
    ///
    /// Returns `None` on timeout rather than an error so callers can poll
    /// in a loop without distinguishing "no work" from "failure". Safe
    /// for many concurrent callers: the underlying list move hands each
    /// identifier to exactly one of them.
    pub async fn dequeue(&self, job_type: &str, timeout: Duration) -> Result<Option<Job>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let ready = ready_list(job_type);
        let processing = processing_list(job_type);

        loop {
            if let Some(job_id) = self.store.list_move_first(&ready, &processing).await? {
                match self.store.get_record(&record_key(job_type, &job_id)).await? {
                    Some(encoded) => {
                        let job = decode_job(&record_key(job_type, &job_id), &encoded)?;
                        return Ok(Some(job));
                    }
                    None => {
                        // Record TTL elapsed while the id was still queued.
                        // Clear the marker without retry and keep pulling.
                        error!(
                            job_type,
                            job_id, "Job record expired before delivery; dropping (data loss)"
                        );
                        self.store.list_remove(&processing, &job_id).await?;
                        self.events.emit(Event::JobRecordLost {
                            job_type: job_type.to_string(),
                            job_id,
                        });
                        continue;
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(DEQUEUE_POLL_INTERVAL.min(timeout)).await;
        }
    }

    /// Remove the in-flight marker and the job record. Idempotent.
    pub async fn mark_complete(&self, job_type: &str, job_id: &str) -> Result<()> {
        self.store
            .list_remove(&processing_list(job_type), job_id)
            .await?;
        self.store.delete_record(&record_key(job_type, job_id)).await?;

        info!(job_type, job_id, "Job completed");
        self.events.emit(Event::JobCompleted {
            job_type: job_type.to_string(),
            job_id: job_id.to_string(),
        });
        Ok(())
    }

    /// Record a failure: re-queue with exponential backoff while the
    /// retry budget lasts, otherwise move the job to the dead-letter
    /// queue. The in-flight marker is cleared on every branch.
    pub async fn mark_failed(&self, job_type: &str, job_id: &str, error: &str) -> Result<()> {
        let key = record_key(job_type, job_id);
        let processing = processing_list(job_type);

        let mut job = match self.store.get_record(&key).await? {
            Some(encoded) => decode_job(&key, &encoded)?,
            None => {
                // Record expired mid-flight; nothing left to retry.
                error!(job_type, job_id, "Job record missing on failure; dropping (data loss)");
                self.store.list_remove(&processing, job_id).await?;
                self.events.emit(Event::JobRecordLost {
                    job_type: job_type.to_string(),
                    job_id: job_id.to_string(),
                });
                return Ok(());
            }
        };

        job.retry_count += 1;
        job.last_error = Some(error.to_string());
        let encoded = encode_job(&job)?;

        if job.retry_count <= self.policy.max_retries {
            let delay = self.policy.backoff_base * 2u32.pow(job.retry_count - 1);
            self.store.put_record(&key, &encoded, self.policy.record_ttl).await?;
            self.store
                .list_move_item(
                    &processing,
                    &ready_list(job_type),
                    job_id,
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
                )
                .await?;

            warn!(
                job_type,
                job_id,
                retry_count = job.retry_count,
                delay_secs = delay.as_secs(),
                error,
                "Job failed; retrying with backoff"
            );
            self.events.emit(Event::JobFailed {
                job_type: job_type.to_string(),
                job_id: job_id.to_string(),
                retry_count: job.retry_count,
                error: error.to_string(),
            });
        } else {
            self.store
                .put_record(&key, &encoded, self.policy.dead_record_ttl)
                .await?;
            self.store
                .list_move_item(&processing, &dead_list(job_type), job_id, Utc::now())
                .await?;

            error!(job_type, job_id, error, "Job exhausted retries; moved to DLQ");
            self.events.emit(Event::JobDeadLettered {
                job_type: job_type.to_string(),
                job_id: job_id.to_string(),
                error: error.to_string(),
            });
        }
        Ok(())
    }

    /// Return in-flight markers older than `max_age` to the ready queue.
    ///
    /// The owning worker is presumed dead. Each marker is reclaimed at
    /// most once even with concurrent sweepers, because the underlying
    /// move reports whether this caller won. Returns how many jobs this
    /// call reclaimed.
    pub async fn reclaim_stale(&self, job_type: &str, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let processing = processing_list(job_type);
        let ready = ready_list(job_type);

        let mut reclaimed = 0;
        for job_id in self.store.list_older_than(&processing, cutoff).await? {
            if self
                .store
                .list_move_item(&processing, &ready, &job_id, Utc::now())
                .await?
            {
                warn!(job_type, job_id = %job_id, "Reclaimed stale in-flight job");
                self.events.emit(Event::JobReclaimed {
                    job_type: job_type.to_string(),
                    job_id,
                });
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Return a dead-lettered job to the ready queue with a fresh
    /// retry count, for operators who have fixed the underlying
    /// problem. Returns `false` when the job is not in the DLQ.
    pub async fn requeue_dead(&self, job_type: &str, job_id: &str) -> Result<bool> {
        let key = record_key(job_type, job_id);
        let mut job = match self.store.get_record(&key).await? {
            Some(encoded) => decode_job(&key, &encoded)?,
            None => return Ok(false),
        };

        let moved = self
            .store
            .list_move_item(&dead_list(job_type), &ready_list(job_type), job_id, Utc::now())
            .await?;
        if !moved {
            return Ok(false);
        }

        job.retry_count = 0;
        job.last_error = None;
        let encoded = encode_job(&job)?;
        self.store.put_record(&key, &encoded, self.policy.record_ttl).await?;

        info!(job_type, job_id, "Dead-lettered job returned to ready queue");
        self.events.emit(Event::JobEnqueued {
            job_type: job_type.to_string(),
            job_id: job_id.to_string(),
        });
        Ok(true)
    }

    /// Jobs currently in the dead-letter queue, oldest first, for
    /// operator inspection.
    pub async fn dead_letter_jobs(&self, job_type: &str) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for job_id in self.store.list_items(&dead_list(job_type)).await? {
            let key = record_key(job_type, &job_id);
            if let Some(encoded) = self.store.get_record(&key).await? {
                jobs.push(decode_job(&key, &encoded)?);
            }
        }
        Ok(jobs)
    }

    pub async fn queue_len(&self, job_type: &str) -> Result<u64> {
        Ok(self.store.list_len(&ready_list(job_type)).await?)
    }

    pub async fn processing_len(&self, job_type: &str) -> Result<u64> {
        Ok(self.store.list_len(&processing_list(job_type)).await?)
    }

    pub async fn dlq_len(&self, job_type: &str) -> Result<u64> {
        Ok(self.store.list_len(&dead_list(job_type)).await?)
    }

    pub async fn stats(&self, job_type: &str) -> Result<QueueStats> {
        Ok(QueueStats {
            ready: self.queue_len(job_type).await?,
            processing: self.processing_len(job_type).await?,
            dead: self.dlq_len(job_type).await?,
        })
    }
}

fn encode_job(job: &Job) -> Result<String> {
    serde_json::to_string(job).map_err(|e| {
        StoreError::CorruptRecord {
            key: record_key(&job.job_type, &job.id),
            reason: e.to_string(),
        }
        .into()
    })
}

fn decode_job(key: &str, encoded: &str) -> Result<Job> {
    serde_json::from_str(encoded).map_err(|e| {
        StoreError::CorruptRecord {
            key: key.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}
