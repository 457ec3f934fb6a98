//! Farming sessions: one long-lived connection per account plus a query for
//! the account's accumulated points.

mod websocket;

pub use websocket::WebSocketSessionClient;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::error::{PollError, SessionError};
use crate::core::oauth::Credential;

/// Identifies one opened session. A restart always produces a new id.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub account: String,
    authorization: String,
}

impl SessionHandle {
    pub fn new(account: &str, credential: &Credential) -> Self {
        Self {
            id: Uuid::new_v4(),
            account: account.to_string(),
            authorization: credential.authorization(),
        }
    }

    /// `Authorization` header value of the credential the session was
    /// opened with.
    pub fn authorization(&self) -> &str {
        &self.authorization
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("account", &self.account)
            .finish()
    }
}

#[async_trait]
pub trait SessionClient: Send + Sync {
    async fn open(&self, account: &str, credential: &Credential)
    -> Result<SessionHandle, SessionError>;

    /// Drive the session until `cancel` fires (`Ok`) or the connection dies.
    async fn run(&self, handle: SessionHandle, cancel: CancellationToken)
    -> Result<(), SessionError>;

    /// Query the account's points. `credential` is the freshest one the
    /// token lifecycle holds, which may be newer than the one `open` saw.
    async fn poll_metric(
        &self,
        handle: &SessionHandle,
        credential: &Credential,
    ) -> Result<f64, PollError>;

    /// Release anything `open` acquired that `run` has not consumed.
    async fn close(&self, handle: &SessionHandle);
}
