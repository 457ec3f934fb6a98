//! Error taxonomy for the credential and session core.
//!
//! Failures local to one account (`AuthError`, `SessionError`, `PollError`,
//! `DecryptionError`) are recorded against that account and never stop the
//! scheduler. `StoreError` and `VaultError` describe shared infrastructure and
//! are escalated to the caller.

use thiserror::Error;

/// An envelope could not be opened. The credential behind it is unusable and
/// the account must re-authenticate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("authentication tag did not verify")]
    Verification,
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("key file I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("key file {0} does not hold a 256-bit key")]
    InvalidKey(String),

    #[error(
        "key file {0} is missing while encrypted accounts exist; restore it or enable security.reenroll_on_key_loss"
    )]
    KeyMissing(String),

    #[error("encryption failed")]
    Encrypt,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("interactive authorization failed: {0}")]
    Interactive(String),

    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("account {0} needs interactive re-authentication")]
    ReauthRequired(String),

    #[error("identity provider is not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open session: {0}")]
    Open(String),

    #[error("session transport failed: {0}")]
    Transport(String),

    #[error("session closed by remote")]
    Closed,
}

/// A metric query failed. Transient by definition; never a restart trigger.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("metric request failed: {0}")]
    Request(String),

    #[error("metric response could not be decoded: {0}")]
    Decode(String),

    #[error("metric request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("no open session")]
    NoSession,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("unknown account {0}")]
    NotFound(String),

    #[error("invalid stored status '{0}'")]
    InvalidStatus(String),

    #[error("re-encryption aborted: {0}")]
    Reencrypt(String),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("data directory is in use by another grassbot process ({holder}); lock file {path}")]
    Held { path: String, holder: String },

    #[error("lock file I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("account {0} is not managed by this supervisor")]
    UnknownAccount(String),
}

impl CoreError {
    /// Shared-infrastructure failures invalidate every account at once.
    pub fn is_shared_infrastructure(&self) -> bool {
        matches!(self, CoreError::Store(_) | CoreError::Vault(_))
    }
}
