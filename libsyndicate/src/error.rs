//! Error types for Syndicate

use thiserror::Error;

use crate::types::PostStatus;

pub type Result<T> = std::result::Result<T, SyndicateError>;

#[derive(Error, Debug)]
pub enum SyndicateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Lock contended: {0}")]
    LockContended(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl SyndicateError {
    /// Whether a publish attempt that hit this error should be retried
    /// through the job queue's backoff, rather than failing terminally.
    ///
    /// Infrastructure trouble and rate limiting are transient. Invalid
    /// transitions are programming/data errors and are never retried.
    /// Credential failures are terminal until the user reconnects.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyndicateError::Store(_) | SyndicateError::RateLimited(_) => true,
            SyndicateError::Adapter(e) => e.is_retryable(),
            SyndicateError::Config(_)
            | SyndicateError::Transition(_)
            | SyndicateError::Credential(_)
            | SyndicateError::LockContended(_)
            | SyndicateError::InvalidInput(_) => false,
        }
    }

    /// Process exit code for CLI frontends.
    pub fn exit_code(&self) -> i32 {
        match self {
            SyndicateError::InvalidInput(_) => 3,
            SyndicateError::Config(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Errors from the shared key/list store backing the queue and locks.
///
/// Every variant means the backing store could not complete an
/// operation; the caller may retry.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record for key {key}: {reason}")]
    CorruptRecord { key: String, reason: String },
}

/// Illegal post state machine transitions.
///
/// These are programming or data errors: they are surfaced to the caller
/// and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Cannot move post from {from} to {to}")]
    IllegalTransition { from: PostStatus, to: PostStatus },

    #[error("Schedule time is in the past")]
    ScheduleTimeInPast,

    #[error("Schedule time is more than a year out")]
    ScheduleTimeTooFar,

    #[error("Post requires approval but none is recorded")]
    ApprovalMissing,

    #[error("Post has no publish attempts left")]
    RetriesExhausted,

    #[error("Post is already canceled")]
    AlreadyCanceled,

    #[error("Published posts cannot be canceled")]
    CancelAfterPublish,
}

#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Platform rejected content: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Platform rate limit: {0}")]
    RateLimit(String),

    #[error("No adapter registered for platform: {0}")]
    UnknownPlatform(String),
}

impl AdapterError {
    /// Transient errors are retried with backoff; rejections burn a post
    /// retry; authentication failures go through the credential lifecycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Network(_) | AdapterError::RateLimit(_))
    }
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Credential not found for account: {0}")]
    NotFound(String),

    #[error("Refresh failed, account requires reconnect: {0}")]
    ReconnectRequired(String),

    #[error("Failed to seal credential: {0}")]
    Seal(String),

    #[error("Failed to unseal credential: {0}")]
    Unseal(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_retryable() {
        let error = SyndicateError::Store(StoreError::Unavailable("connection reset".into()));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_rate_limited_is_retryable() {
        let error = SyndicateError::RateLimited("bucket empty for mastodon/alice".into());
        assert!(error.is_retryable());
    }

    #[test]
    fn test_transition_errors_are_not_retryable() {
        let error = SyndicateError::Transition(TransitionError::ScheduleTimeInPast);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_credential_errors_are_not_retryable() {
        let error =
            SyndicateError::Credential(CredentialError::ReconnectRequired("acct-1".into()));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_adapter_network_is_retryable() {
        let error = SyndicateError::Adapter(AdapterError::Network("timeout".into()));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_adapter_rejection_is_not_retryable() {
        let error = SyndicateError::Adapter(AdapterError::Rejected("policy violation".into()));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_lock_contention_is_not_retryable() {
        // Contention is handled by skipping the tick, not by queue backoff
        let error = SyndicateError::LockContended("post-1".into());
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_transition_error_formatting() {
        let error = TransitionError::IllegalTransition {
            from: PostStatus::Published,
            to: PostStatus::Queued,
        };
        let message = format!("{}", error);
        assert!(message.contains("published"));
        assert!(message.contains("queued"));
    }

    #[test]
    fn test_error_conversion_from_transition_error() {
        let error: SyndicateError = TransitionError::ApprovalMissing.into();
        assert!(matches!(error, SyndicateError::Transition(_)));
    }

    #[test]
    fn test_error_conversion_from_store_error() {
        let error: SyndicateError = StoreError::Unavailable("down".into()).into();
        assert!(matches!(error, SyndicateError::Store(_)));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(SyndicateError::InvalidInput("bad id".into()).exit_code(), 3);
        assert_eq!(
            SyndicateError::Config(ConfigError::MissingField("store".into())).exit_code(),
            2
        );
        assert_eq!(
            SyndicateError::Store(StoreError::Unavailable("down".into())).exit_code(),
            1
        );
    }
}
