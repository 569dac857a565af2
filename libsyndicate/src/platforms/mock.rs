//! Mock publishing adapter for testing
//!
//! A configurable adapter that simulates publish and token-refresh
//! behavior without touching the network. Outcomes can be scripted per
//! call, so tests can drive exact retry and dead-letter sequences.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use secrecy::SecretString;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::credentials::Credential;
use crate::error::{AdapterError, Result};
use crate::platforms::{PublishAdapter, TokenRefresh};
use crate::types::PostContent;

/// Behavior knobs for [`MockAdapter`].
pub struct MockConfig {
    /// Platform name the adapter answers to
    pub name: String,

    /// Scripted publish outcomes, consumed front to back; once the
    /// script is exhausted every publish succeeds
    pub script: Mutex<VecDeque<std::result::Result<String, AdapterError>>>,

    /// Whether token refresh should succeed
    pub refresh_succeeds: bool,

    /// Lifetime of tokens minted by a successful refresh
    pub refresh_lifetime: ChronoDuration,

    /// Delay before completing operations (simulates network latency)
    pub delay: Duration,

    /// Number of publish calls made
    pub publish_calls: Mutex<usize>,

    /// Number of refresh calls made
    pub refresh_calls: Mutex<usize>,

    /// Text of every successfully published post
    pub published: Mutex<Vec<String>>,
}

impl MockConfig {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            refresh_succeeds: true,
            refresh_lifetime: ChronoDuration::days(60),
            delay: Duration::from_millis(0),
            publish_calls: Mutex::new(0),
            refresh_calls: Mutex::new(0),
            published: Mutex::new(Vec::new()),
        }
    }
}

/// Mock adapter for tests; shares its [`MockConfig`] with the test body
/// so calls can be inspected after the fact.
pub struct MockAdapter {
    config: Arc<MockConfig>,
}

impl MockAdapter {
    /// An adapter whose every operation succeeds.
    pub fn new(name: &str) -> Self {
        Self {
            config: Arc::new(MockConfig::new(name)),
        }
    }

    /// An adapter that plays back `outcomes` one publish at a time,
    /// then succeeds once the script runs out.
    pub fn scripted(
        name: &str,
        outcomes: Vec<std::result::Result<String, AdapterError>>,
    ) -> Self {
        let config = MockConfig::new(name);
        *config.script.lock().unwrap() = outcomes.into();
        Self {
            config: Arc::new(config),
        }
    }

    /// An adapter that fails every publish with `error`-style network
    /// trouble.
    pub fn always_failing(name: &str, error: &str) -> Self {
        let config = MockConfig::new(name);
        // An empty script means success, so keep it permanently failing
        // via a long scripted run instead.
        let failures = (0..64)
            .map(|_| Err(AdapterError::Network(error.to_string())))
            .collect();
        *config.script.lock().unwrap() = failures;
        Self {
            config: Arc::new(config),
        }
    }

    /// An adapter whose token refresh always fails.
    pub fn refresh_failure(name: &str) -> Self {
        let mut config = MockConfig::new(name);
        config.refresh_succeeds = false;
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> Arc<MockConfig> {
        self.config.clone()
    }
}

#[async_trait]
impl PublishAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn publish(&self, _credential: &Credential, content: &PostContent) -> Result<String> {
        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }
        *self.config.publish_calls.lock().unwrap() += 1;

        let scripted = self.config.script.lock().unwrap().pop_front();
        match scripted {
            Some(Err(error)) => Err(error.into()),
            Some(Ok(id)) => {
                self.config
                    .published
                    .lock()
                    .unwrap()
                    .push(content.text.clone());
                Ok(id)
            }
            None => {
                self.config
                    .published
                    .lock()
                    .unwrap()
                    .push(content.text.clone());
                let n = *self.config.publish_calls.lock().unwrap();
                Ok(format!("{}-post-{}", self.config.name, n))
            }
        }
    }

    async fn refresh_token(&self, _refresh_token: &SecretString) -> Result<TokenRefresh> {
        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }
        *self.config.refresh_calls.lock().unwrap() += 1;

        if !self.config.refresh_succeeds {
            return Err(AdapterError::Authentication(
                "refresh token rejected".to_string(),
            )
            .into());
        }

        let n = *self.config.refresh_calls.lock().unwrap();
        Ok(TokenRefresh {
            access_token: SecretString::from(format!("access-{}", n)),
            refresh_token: SecretString::from(format!("refresh-{}", n)),
            expires_at: Utc::now() + self.config.refresh_lifetime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;

    fn credential() -> Credential {
        Credential::new(
            "acct-1",
            "mock",
            SecretString::from("access".to_string()),
            SecretString::from("refresh".to_string()),
            Utc::now(),
            Utc::now() + ChronoDuration::days(60),
        )
    }

    #[tokio::test]
    async fn test_default_mock_succeeds() {
        let adapter = MockAdapter::new("mock");
        let id = adapter
            .publish(&credential(), &PostContent::text("hello"))
            .await
            .unwrap();
        assert_eq!(id, "mock-post-1");
        assert_eq!(adapter.config().published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_outcomes_play_in_order() {
        let adapter = MockAdapter::scripted(
            "mock",
            vec![
                Err(AdapterError::Network("connection reset".to_string())),
                Ok("remote-1".to_string()),
            ],
        );
        let content = PostContent::text("hello");

        assert!(adapter.publish(&credential(), &content).await.is_err());
        let id = adapter.publish(&credential(), &content).await.unwrap();
        assert_eq!(id, "remote-1");
        assert_eq!(*adapter.config().publish_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_reports_authentication() {
        let adapter = MockAdapter::refresh_failure("mock");
        let result = adapter
            .refresh_token(&SecretString::from("refresh".to_string()))
            .await;
        assert!(matches!(
            result,
            Err(crate::error::SyndicateError::Adapter(
                AdapterError::Authentication(_)
            ))
        ));
    }
}
