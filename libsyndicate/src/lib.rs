//! Syndicate - scheduling core for multi-tenant social publishing
//!
//! This library provides the pieces of a post scheduler: a durable job
//! queue with retry and dead-letter handling, the post lifecycle state
//! machine, a due-post dispatcher with per-post locking, per-account
//! rate limiting, and credential storage with proactive OAuth refresh.

pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod lock;
pub mod platforms;
pub mod queue;
pub mod rate_limiter;
pub mod repository;
pub mod store;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use credentials::{Credential, CredentialManager, CredentialVault};
pub use dispatcher::Dispatcher;
pub use error::{Result, SyndicateError};
pub use events::{Event, EventBus};
pub use queue::{JobQueue, QueuePolicy, QueueStats};
pub use types::{Post, PostStatus};
pub use worker::PublishWorker;
