//! Core types for Syndicate
//!
//! The central entity is [`Post`]: the schedulable content unit. A post is
//! owned by a team and moves through a guarded state machine
//! (`Draft → Scheduled → Queued → Publishing → Published`, with `Failed`
//! and `Canceled` branches). Calling code never assigns `status` directly;
//! all mutation goes through the transition methods, which return a typed
//! [`TransitionError`] on illegal moves.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransitionError;

/// Maximum publish attempts a single post gets before it is left in
/// terminal `Failed`. Independent from the job queue's own retry budget.
pub const MAX_POST_RETRIES: u32 = 3;

/// How far in the future a post may be scheduled.
const MAX_SCHEDULE_HORIZON_DAYS: i64 = 366;

/// Post lifecycle states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Queued,
    Publishing,
    Published,
    Failed,
    Canceled,
}

impl PostStatus {
    /// Terminal states admit no further transitions (except `Failed`,
    /// which can re-enter the pipeline while the retry budget lasts).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PostStatus::Published | PostStatus::Canceled
        )
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Queued => "queued",
            PostStatus::Publishing => "publishing",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
            PostStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// A media reference carried by a post. Files live outside the pipeline;
/// the adapter resolves the reference at publish time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRef {
    pub url: String,
    pub alt_text: Option<String>,
}

/// The content payload of a post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostContent {
    pub text: String,
    pub media: Vec<MediaRef>,
}

impl PostContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media: Vec::new(),
        }
    }
}

/// A (platform, account) pair a post should be published to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PlatformTarget {
    /// Lowercase platform identifier (e.g. "mastodon", "bluesky")
    pub platform: String,
    /// Account identifier within the owning team
    pub account_id: String,
}

impl PlatformTarget {
    pub fn new(platform: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            account_id: account_id.into(),
        }
    }
}

/// Approval metadata for teams that gate publishing on review.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Approval {
    /// Whether this post must be approved before it can be queued
    pub required: bool,
    /// Who approved it, if anyone
    pub approved_by: Option<String>,
    /// When it was approved (Unix seconds irrelevant; full timestamp kept)
    pub approved_at: Option<DateTime<Utc>>,
}

impl Approval {
    /// Approval is satisfied when it is not required, or an approver is
    /// recorded.
    pub fn satisfied(&self) -> bool {
        !self.required || self.approved_by.is_some()
    }
}

/// The schedulable content unit.
///
/// Owned exclusively by its team. Soft-deleted via `deleted_at`, never
/// physically removed by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub team_id: String,
    pub author_id: String,
    pub content: PostContent,
    pub targets: Vec<PlatformTarget>,
    pub status: PostStatus,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub approval: Approval,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Post {
    /// Create a new draft post.
    pub fn new(
        team_id: impl Into<String>,
        author_id: impl Into<String>,
        content: PostContent,
        targets: Vec<PlatformTarget>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            team_id: team_id.into(),
            author_id: author_id.into(),
            content,
            targets,
            status: PostStatus::Draft,
            priority: 0,
            scheduled_at: None,
            published_at: None,
            approval: Approval::default(),
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    // ========================================================================
    // Guarded transitions
    // ========================================================================

    /// Schedule the post for publication at `time`.
    ///
    /// Legal from `Draft`, `Scheduled` (reschedule) and `Failed` (retry).
    /// Rejects times in the past or more than a year out.
    pub fn schedule(&mut self, time: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            PostStatus::Draft | PostStatus::Scheduled | PostStatus::Failed => {}
            from => {
                return Err(TransitionError::IllegalTransition {
                    from,
                    to: PostStatus::Scheduled,
                })
            }
        }

        let now = Utc::now();
        if time < now {
            return Err(TransitionError::ScheduleTimeInPast);
        }
        if time > now + Duration::days(MAX_SCHEDULE_HORIZON_DAYS) {
            return Err(TransitionError::ScheduleTimeTooFar);
        }

        self.scheduled_at = Some(time);
        self.status = PostStatus::Scheduled;
        Ok(())
    }

    /// Move a due post into the queue. Legal only from `Scheduled`, and
    /// only when approval (if required) has been recorded.
    pub fn queue(&mut self) -> Result<(), TransitionError> {
        if self.status != PostStatus::Scheduled {
            return Err(TransitionError::IllegalTransition {
                from: self.status,
                to: PostStatus::Queued,
            });
        }
        if !self.approval.satisfied() {
            return Err(TransitionError::ApprovalMissing);
        }
        self.status = PostStatus::Queued;
        Ok(())
    }

    /// Walk a redelivered `Failed` post straight back into the queue for
    /// another attempt, without waiting out a schedule time. The backoff
    /// between attempts is the job queue's; by the time the job comes
    /// back the post is due immediately.
    ///
    /// Legal only from `Failed` while attempts remain; the approval gate
    /// still applies.
    pub fn reactivate(&mut self) -> Result<(), TransitionError> {
        if self.status != PostStatus::Failed {
            return Err(TransitionError::IllegalTransition {
                from: self.status,
                to: PostStatus::Queued,
            });
        }
        if !self.can_retry() {
            return Err(TransitionError::RetriesExhausted);
        }
        if !self.approval.satisfied() {
            return Err(TransitionError::ApprovalMissing);
        }
        self.scheduled_at = Some(Utc::now());
        self.status = PostStatus::Queued;
        Ok(())
    }

    /// Record that a worker has started a publish attempt. Legal only from
    /// `Queued`.
    pub fn mark_publishing(&mut self) -> Result<(), TransitionError> {
        if self.status != PostStatus::Queued {
            return Err(TransitionError::IllegalTransition {
                from: self.status,
                to: PostStatus::Publishing,
            });
        }
        self.status = PostStatus::Publishing;
        Ok(())
    }

    /// Record a successful publish. Legal only from `Publishing`.
    pub fn mark_published(&mut self) -> Result<(), TransitionError> {
        if self.status != PostStatus::Publishing {
            return Err(TransitionError::IllegalTransition {
                from: self.status,
                to: PostStatus::Published,
            });
        }
        self.status = PostStatus::Published;
        self.published_at = Some(Utc::now());
        Ok(())
    }

    /// Record a failed publish attempt. Legal from any non-terminal state.
    ///
    /// Increments the retry counter and stores `reason` as `last_error`.
    /// The caller decides whether to re-[`schedule`](Self::schedule) based
    /// on [`can_retry`](Self::can_retry).
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::IllegalTransition {
                from: self.status,
                to: PostStatus::Failed,
            });
        }
        self.retry_count += 1;
        self.last_error = Some(reason.into());
        self.status = PostStatus::Failed;
        Ok(())
    }

    /// Cancel the post. Illegal once `Published`; a second cancel is
    /// rejected rather than silently accepted.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        match self.status {
            PostStatus::Published => Err(TransitionError::CancelAfterPublish),
            PostStatus::Canceled => Err(TransitionError::AlreadyCanceled),
            _ => {
                self.status = PostStatus::Canceled;
                Ok(())
            }
        }
    }

    /// Record an approver. No state change; satisfies the approval gate
    /// checked by [`queue`](Self::queue).
    pub fn approve(&mut self, approver: impl Into<String>) {
        self.approval.approved_by = Some(approver.into());
        self.approval.approved_at = Some(Utc::now());
    }

    /// Tombstone the post. The pipeline treats deleted posts as stale.
    pub fn soft_delete(&mut self) {
        self.deleted_at = Some(Utc::now());
    }

    // ========================================================================
    // Predicates
    // ========================================================================

    /// A post is due when it is `Scheduled` and its schedule time has
    /// passed.
    pub fn is_due(&self) -> bool {
        self.status == PostStatus::Scheduled
            && self.deleted_at.is_none()
            && matches!(self.scheduled_at, Some(t) if t <= Utc::now())
    }

    /// A post can be published when it is `Queued`, approval is satisfied,
    /// and its schedule time has passed.
    pub fn can_publish(&self) -> bool {
        self.status == PostStatus::Queued
            && self.deleted_at.is_none()
            && self.approval.satisfied()
            && matches!(self.scheduled_at, Some(t) if t <= Utc::now())
    }

    /// Whether the post has publish attempts left in its own budget.
    pub fn can_retry(&self) -> bool {
        self.retry_count < MAX_POST_RETRIES
    }

    /// Whether the approval gate is still open.
    pub fn needs_approval(&self) -> bool {
        !self.approval.satisfied()
    }
}
