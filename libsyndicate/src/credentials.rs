//! Credential storage and OAuth refresh lifecycle
//!
//! Token material never crosses a module boundary in the clear: secrets
//! live in [`SecretString`] in memory and are sealed with age passphrase
//! encryption before they reach a vault. A [`CredentialVault`] persists
//! sealed records; the [`CredentialManager`] owns the passphrase and the
//! refresh policy.
//!
//! Refresh is proactive. Before a publish attempt the worker asks for a
//! usable credential, and the manager refreshes it when the remaining
//! validity drops inside a margin sized to the token's lifetime: a week
//! for long-lived tokens, minutes for short-lived ones. A failed refresh
//! flags the account as requiring reconnect, and every later use fails
//! fast until a human re-authorizes the account.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{CredentialError, Result};
use crate::events::{Event, EventBus};
use crate::platforms::PublishAdapter;

/// Decrypted credential for one platform account.
pub struct Credential {
    pub account_id: String,
    pub platform: String,
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    /// When the current token material was issued
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_validated: Option<DateTime<Utc>>,
    /// Set when a refresh failed; cleared only by re-authorization
    pub reconnect_required: bool,
}

impl Credential {
    pub fn new(
        account_id: impl Into<String>,
        platform: impl Into<String>,
        access_token: SecretString,
        refresh_token: SecretString,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            platform: platform.into(),
            access_token,
            refresh_token,
            issued_at,
            expires_at,
            last_validated: None,
            reconnect_required: false,
        }
    }

    /// Total validity window of the current token material.
    pub fn lifetime(&self) -> ChronoDuration {
        self.expires_at - self.issued_at
    }

    pub fn expires_within(&self, margin: ChronoDuration) -> bool {
        self.expires_at - Utc::now() <= margin
    }
}

/// Secret halves of a credential, serialized only transiently inside
/// the age envelope.
#[derive(Serialize, Deserialize)]
struct SecretMaterial {
    access_token: String,
    refresh_token: String,
}

/// Encrypted-at-rest form of a [`Credential`]. Safe to serialize: the
/// token material is an age ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedCredential {
    pub account_id: String,
    pub platform: String,
    /// Base64-encoded age ciphertext of the token material
    pub ciphertext: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_validated: Option<DateTime<Utc>>,
    pub reconnect_required: bool,
}

fn seal_material(credential: &Credential, passphrase: &SecretString) -> Result<String> {
    let material = SecretMaterial {
        access_token: credential.access_token.expose_secret().to_string(),
        refresh_token: credential.refresh_token.expose_secret().to_string(),
    };
    let plaintext = Zeroizing::new(
        serde_json::to_string(&material).map_err(|e| CredentialError::Seal(e.to_string()))?,
    );

    let encryptor = age::Encryptor::with_user_passphrase(age::secrecy::Secret::new(
        passphrase.expose_secret().to_string(),
    ));

    let mut encrypted = vec![];
    let mut writer = encryptor
        .wrap_output(&mut encrypted)
        .map_err(|e| CredentialError::Seal(e.to_string()))?;
    writer
        .write_all(plaintext.as_bytes())
        .map_err(|e| CredentialError::Seal(e.to_string()))?;
    writer
        .finish()
        .map_err(|e| CredentialError::Seal(e.to_string()))?;

    Ok(general_purpose::STANDARD.encode(encrypted))
}

fn unseal_material(
    ciphertext: &str,
    passphrase: &SecretString,
) -> Result<(SecretString, SecretString)> {
    let encrypted = general_purpose::STANDARD
        .decode(ciphertext)
        .map_err(|e| CredentialError::Unseal(e.to_string()))?;

    let decryptor = match age::Decryptor::new(&encrypted[..]) {
        Ok(age::Decryptor::Passphrase(d)) => d,
        Ok(_) => {
            return Err(CredentialError::Unseal(
                "unexpected envelope format (expected passphrase)".to_string(),
            )
            .into())
        }
        Err(e) => return Err(CredentialError::Unseal(e.to_string()).into()),
    };

    let mut decrypted = Zeroizing::new(Vec::new());
    let mut reader = decryptor
        .decrypt(
            &age::secrecy::Secret::new(passphrase.expose_secret().to_string()),
            None,
        )
        .map_err(|e| CredentialError::Unseal(e.to_string()))?;
    reader
        .read_to_end(&mut decrypted)
        .map_err(|e| CredentialError::Unseal(e.to_string()))?;

    let material: SecretMaterial =
        serde_json::from_slice(&decrypted).map_err(|e| CredentialError::Unseal(e.to_string()))?;

    Ok((
        SecretString::from(material.access_token),
        SecretString::from(material.refresh_token),
    ))
}

/// Persistence for sealed credentials.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn store(&self, sealed: &SealedCredential) -> Result<()>;
    async fn load(&self, account_id: &str) -> Result<Option<SealedCredential>>;
    async fn delete(&self, account_id: &str) -> Result<()>;
}

/// In-memory vault for tests and single-process use.
#[derive(Default)]
pub struct MemoryVault {
    records: Mutex<HashMap<String, SealedCredential>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialVault for MemoryVault {
    async fn store(&self, sealed: &SealedCredential) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(sealed.account_id.clone(), sealed.clone());
        Ok(())
    }

    async fn load(&self, account_id: &str) -> Result<Option<SealedCredential>> {
        Ok(self.records.lock().await.get(account_id).cloned())
    }

    async fn delete(&self, account_id: &str) -> Result<()> {
        self.records.lock().await.remove(account_id);
        Ok(())
    }
}

/// Vault keeping one JSON file per account under a base directory.
/// Token material inside the files is age ciphertext, so the files
/// themselves need no further protection beyond 0600 permissions.
pub struct FileVault {
    base_path: PathBuf,
}

impl FileVault {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn file_path(&self, account_id: &str) -> PathBuf {
        self.base_path.join(format!("{}.cred.json", account_id))
    }
}

#[async_trait]
impl CredentialVault for FileVault {
    async fn store(&self, sealed: &SealedCredential) -> Result<()> {
        let path = self.file_path(&sealed.account_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(CredentialError::IoError)?;
        }

        let json =
            serde_json::to_string_pretty(sealed).map_err(|e| CredentialError::Seal(e.to_string()))?;
        std::fs::write(&path, json).map_err(CredentialError::IoError)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, perms).map_err(CredentialError::IoError)?;
        }

        debug!(account_id = %sealed.account_id, ?path, "Stored sealed credential");
        Ok(())
    }

    async fn load(&self, account_id: &str) -> Result<Option<SealedCredential>> {
        let path = self.file_path(account_id);
        if !path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&path).map_err(CredentialError::IoError)?;
        let sealed =
            serde_json::from_str(&json).map_err(|e| CredentialError::Unseal(e.to_string()))?;
        Ok(Some(sealed))
    }

    async fn delete(&self, account_id: &str) -> Result<()> {
        let path = self.file_path(account_id);
        if path.exists() {
            std::fs::remove_file(&path).map_err(CredentialError::IoError)?;
        }
        Ok(())
    }
}

/// When to refresh relative to token expiry.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    /// Tokens living at least this long count as long-lived
    pub long_lived_threshold: ChronoDuration,
    /// Refresh margin for long-lived tokens
    pub long_lived_margin: ChronoDuration,
    /// Refresh margin for short-lived tokens
    pub short_lived_margin: ChronoDuration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            long_lived_threshold: ChronoDuration::days(30),
            long_lived_margin: ChronoDuration::days(7),
            short_lived_margin: ChronoDuration::minutes(5),
        }
    }
}

impl RefreshPolicy {
    fn margin_for(&self, credential: &Credential) -> ChronoDuration {
        if credential.lifetime() >= self.long_lived_threshold {
            self.long_lived_margin
        } else {
            self.short_lived_margin
        }
    }
}

/// Owns the vault passphrase and drives the refresh lifecycle.
pub struct CredentialManager {
    vault: Arc<dyn CredentialVault>,
    passphrase: SecretString,
    policy: RefreshPolicy,
    events: EventBus,
}

impl CredentialManager {
    pub fn new(
        vault: Arc<dyn CredentialVault>,
        passphrase: SecretString,
        policy: RefreshPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            vault,
            passphrase,
            policy,
            events,
        }
    }

    /// Seal `credential` and persist it.
    pub async fn save(&self, credential: &Credential) -> Result<()> {
        let sealed = SealedCredential {
            account_id: credential.account_id.clone(),
            platform: credential.platform.clone(),
            ciphertext: seal_material(credential, &self.passphrase)?,
            issued_at: credential.issued_at,
            expires_at: credential.expires_at,
            last_validated: credential.last_validated,
            reconnect_required: credential.reconnect_required,
        };
        self.vault.store(&sealed).await
    }

    /// Load and unseal the credential for `account_id`.
    pub async fn load(&self, account_id: &str) -> Result<Credential> {
        let sealed = self
            .vault
            .load(account_id)
            .await?
            .ok_or_else(|| CredentialError::NotFound(account_id.to_string()))?;

        let (access_token, refresh_token) =
            unseal_material(&sealed.ciphertext, &self.passphrase)?;

        Ok(Credential {
            account_id: sealed.account_id,
            platform: sealed.platform,
            access_token,
            refresh_token,
            issued_at: sealed.issued_at,
            expires_at: sealed.expires_at,
            last_validated: sealed.last_validated,
            reconnect_required: sealed.reconnect_required,
        })
    }

    /// Flag an account as needing re-authorization. Cleared by the next
    /// [`CredentialManager::save`] of fresh material.
    pub async fn mark_reconnect_required(&self, account_id: &str) -> Result<()> {
        let mut credential = self.load(account_id).await?;
        credential.reconnect_required = true;
        self.save(&credential).await
    }

    /// Return a credential that is usable right now, refreshing it
    /// first when its remaining validity is inside the policy margin.
    ///
    /// # Errors
    ///
    /// [`CredentialError::ReconnectRequired`] when the account is
    /// flagged for reconnect or the refresh attempt fails. A failed
    /// refresh also flags the account, so later calls fail fast.
    pub async fn refresh_if_needed(
        &self,
        adapter: &dyn PublishAdapter,
        account_id: &str,
    ) -> Result<Credential> {
        let credential = self.load(account_id).await?;

        if credential.reconnect_required {
            return Err(CredentialError::ReconnectRequired(account_id.to_string()).into());
        }

        let margin = self.policy.margin_for(&credential);
        if !credential.expires_within(margin) {
            return Ok(credential);
        }

        debug!(
            account_id,
            platform = %credential.platform,
            expires_at = %credential.expires_at,
            "Credential inside refresh margin; refreshing"
        );

        match adapter.refresh_token(&credential.refresh_token).await {
            Ok(fresh) => {
                let now = Utc::now();
                let refreshed = Credential {
                    account_id: credential.account_id,
                    platform: credential.platform,
                    access_token: fresh.access_token,
                    refresh_token: fresh.refresh_token,
                    issued_at: now,
                    expires_at: fresh.expires_at,
                    last_validated: Some(now),
                    reconnect_required: false,
                };
                self.save(&refreshed).await?;
                info!(account_id, platform = %refreshed.platform, "Credential refreshed");
                Ok(refreshed)
            }
            Err(e) => {
                warn!(
                    account_id,
                    platform = %credential.platform,
                    error = %e,
                    "Credential refresh failed; account flagged for reconnect"
                );
                let mut stale = credential;
                stale.reconnect_required = true;
                self.save(&stale).await?;
                self.events.emit(Event::CredentialRefreshFailed {
                    platform: stale.platform.clone(),
                    account_id: account_id.to_string(),
                    error: e.to_string(),
                });
                Err(CredentialError::ReconnectRequired(account_id.to_string()).into())
            }
        }
    }
}
