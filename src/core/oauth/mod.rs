mod google;

pub use google::GoogleIdentityProvider;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::error::{AuthError, CoreError, StoreError, VaultError};
use crate::core::store::{AccountStatus, CredentialStore};
use crate::core::vault::{CipherVault, Envelope};

/// Tokens this close to expiry are refreshed early.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|at| at - Duration::seconds(EXPIRY_SKEW_SECS) <= now)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Value for an `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.can_refresh())
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// External identity provider. The interactive flow is opaque: it either
/// yields a fresh credential or fails.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authorize_interactive(
        &self,
        account: &str,
        scopes: &[String],
    ) -> Result<Credential, AuthError>;

    async fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
    Failed,
}

impl TokenState {
    pub fn as_status(self) -> AccountStatus {
        match self {
            TokenState::Unauthenticated => AccountStatus::Unauthenticated,
            TokenState::Authenticating => AccountStatus::Authenticating,
            TokenState::Authenticated => AccountStatus::Authenticated,
            TokenState::Expired => AccountStatus::Expired,
            TokenState::Failed => AccountStatus::Failed,
        }
    }
}

/// Whether the caller may block on a human. Background loops never may,
/// unless explicitly configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Interactive,
    Background,
}

pub struct TokenLifecycle {
    store: CredentialStore,
    vault: Arc<CipherVault>,
    provider: Arc<dyn IdentityProvider>,
    scopes: Vec<String>,
}

impl TokenLifecycle {
    pub fn new(
        store: CredentialStore,
        vault: Arc<CipherVault>,
        provider: Arc<dyn IdentityProvider>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            store,
            vault,
            provider,
            scopes,
        }
    }

    /// Return a usable credential for `email`, authorizing or refreshing as
    /// needed and persisting the outcome.
    pub async fn obtain(&self, email: &str, mode: AuthMode) -> Result<Credential, CoreError> {
        self.obtain_at(email, mode, Utc::now()).await
    }

    pub async fn obtain_at(
        &self,
        email: &str,
        mode: AuthMode,
        now: DateTime<Utc>,
    ) -> Result<Credential, CoreError> {
        match self.load(email).await? {
            None => self.authorize(email, mode).await,
            Some(credential) if !credential.is_expired(now) => Ok(credential),
            Some(credential) if credential.can_refresh() => self.refresh(email, &credential).await,
            Some(_) => {
                info!(account = %email, "Credential expired without refresh token, re-authorizing");
                self.authorize(email, mode).await
            }
        }
    }

    /// Run the interactive flow regardless of what is stored.
    pub async fn enroll(&self, email: &str) -> Result<Credential, CoreError> {
        self.authorize(email, AuthMode::Interactive).await
    }

    /// Decrypt the stored credential. Anything unreadable counts as absent.
    async fn load(&self, email: &str) -> Result<Option<Credential>, CoreError> {
        let Some(record) = self.store.get(email).await? else {
            return Ok(None);
        };
        if !record.has_credential() {
            return Ok(None);
        }

        let envelope = Envelope::from_stored(record.encrypted_credential);
        let plaintext = match self.vault.open(&envelope)? {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(account = %email, "Stored credential unusable ({}), re-authentication required", e);
                return Ok(None);
            }
        };

        match serde_json::from_slice::<Credential>(&plaintext) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) => {
                warn!(account = %email, "Stored credential could not be decoded: {}", e);
                Ok(None)
            }
        }
    }

    async fn authorize(&self, email: &str, mode: AuthMode) -> Result<Credential, CoreError> {
        if mode == AuthMode::Background {
            warn!(account = %email, "Interactive authorization needed but not allowed in background");
            self.transition(email, TokenState::Failed).await?;
            return Err(AuthError::ReauthRequired(email.to_string()).into());
        }

        self.transition(email, TokenState::Authenticating).await?;
        match self.provider.authorize_interactive(email, &self.scopes).await {
            Ok(credential) => {
                self.store_credential(email, &credential, TokenState::Authenticated)
                    .await?;
                info!(account = %email, "New token generated");
                Ok(credential)
            }
            Err(e) => {
                warn!(account = %email, "Authorization failed: {}", e);
                self.transition(email, TokenState::Failed).await?;
                Err(e.into())
            }
        }
    }

    async fn refresh(&self, email: &str, credential: &Credential) -> Result<Credential, CoreError> {
        self.transition(email, TokenState::Expired).await?;
        self.transition(email, TokenState::Authenticating).await?;

        match self.provider.refresh(credential).await {
            Ok(fresh) => {
                self.store_credential(email, &fresh, TokenState::Authenticated)
                    .await?;
                info!(account = %email, "Token refreshed");
                Ok(fresh)
            }
            Err(e) => {
                warn!(account = %email, "Token refresh failed: {}", e);
                self.transition(email, TokenState::Failed).await?;
                Err(e.into())
            }
        }
    }

    /// The only path by which a credential reaches the store.
    async fn store_credential(
        &self,
        email: &str,
        credential: &Credential,
        state: TokenState,
    ) -> Result<(), CoreError> {
        let json = serde_json::to_vec(credential).map_err(|_| VaultError::Encrypt)?;
        let envelope = self.vault.seal(&json)?;
        self.store
            .upsert(email, envelope.as_str(), state.as_status())
            .await?;
        Ok(())
    }

    async fn transition(&self, email: &str, state: TokenState) -> Result<(), StoreError> {
        match self.store.update_status(email, state.as_status()).await {
            Err(StoreError::NotFound(_)) => self.store.upsert(email, "", state.as_status()).await,
            other => other,
        }
    }
}
