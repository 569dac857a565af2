//! Publishing adapter abstraction
//!
//! Each social platform is reached through a [`PublishAdapter`]: publish
//! a post's content with an account's credential, and refresh an OAuth
//! token when the credential lifecycle asks for it. Wire formats live
//! entirely inside adapter implementations; the pipeline only sees the
//! trait.
//!
//! Adapters are collected in an [`AdapterRegistry`] constructed once at
//! startup and passed into the dispatcher and workers; there is no
//! process-global lookup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;

use crate::credentials::Credential;
use crate::error::{AdapterError, Result};
use crate::types::PostContent;

pub mod mock;

/// Fresh token material returned by a successful refresh.
pub struct TokenRefresh {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub expires_at: DateTime<Utc>,
}

/// Platform capability consumed by the publish worker and the credential
/// lifecycle manager.
#[async_trait]
pub trait PublishAdapter: Send + Sync {
    /// Lowercase platform identifier (e.g. "mastodon", "bluesky")
    fn name(&self) -> &str;

    /// Publish `content` on behalf of the account holding `credential`.
    /// Returns the platform-specific post identifier.
    ///
    /// # Errors
    ///
    /// - [`AdapterError::Network`] / [`AdapterError::RateLimit`] for
    ///   transient trouble (retried with backoff)
    /// - [`AdapterError::Rejected`] when the platform refuses the
    ///   content (burns a post retry)
    /// - [`AdapterError::Authentication`] when the credential is no
    ///   longer accepted
    async fn publish(&self, credential: &Credential, content: &PostContent) -> Result<String>;

    /// Exchange a refresh secret for fresh token material.
    async fn refresh_token(&self, refresh_token: &SecretString) -> Result<TokenRefresh>;
}

/// Explicit adapter-by-platform lookup, built once at startup.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn PublishAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own [`PublishAdapter::name`].
    pub fn register(&mut self, adapter: Arc<dyn PublishAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Look up the adapter for a platform.
    pub fn get(&self, platform: &str) -> Result<Arc<dyn PublishAdapter>> {
        self.adapters
            .get(platform)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownPlatform(platform.to_string()).into())
    }

    pub fn platforms(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}
