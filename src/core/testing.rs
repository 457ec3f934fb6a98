//! Scriptable fakes for the identity provider and session backend.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::core::error::{AuthError, PollError, SessionError};
use crate::core::oauth::{Credential, IdentityProvider};
use crate::core::session::{SessionClient, SessionHandle};
use crate::core::vault::CipherVault;

pub fn credential_expiring_at(
    access: &str,
    refresh: Option<&str>,
    at: DateTime<Utc>,
) -> Credential {
    Credential {
        access_token: access.to_string(),
        refresh_token: refresh.map(str::to_string),
        token_type: "Bearer".to_string(),
        expires_at: Some(at),
        scopes: vec!["email".to_string()],
    }
}

pub fn test_vault(tmp: &tempfile::TempDir) -> Arc<CipherVault> {
    Arc::new(CipherVault::new(tmp.path().join("encryption_key.bin")))
}

/// Queued results are consumed first; once empty, calls succeed with fresh
/// tokens valid for an hour.
#[derive(Default)]
pub struct MockIdentityProvider {
    interactive: Mutex<VecDeque<Result<Credential, AuthError>>>,
    refresh: Mutex<VecDeque<Result<Credential, AuthError>>>,
    interactive_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl MockIdentityProvider {
    pub fn push_interactive(&self, result: Result<Credential, AuthError>) {
        self.interactive.lock().unwrap().push_back(result);
    }

    pub fn push_refresh(&self, result: Result<Credential, AuthError>) {
        self.refresh.lock().unwrap().push_back(result);
    }

    pub fn interactive_calls(&self) -> usize {
        self.interactive_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn authorize_interactive(
        &self,
        _account: &str,
        _scopes: &[String],
    ) -> Result<Credential, AuthError> {
        let n = self.interactive_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(result) = self.interactive.lock().unwrap().pop_front() {
            return result;
        }
        Ok(credential_expiring_at(
            &format!("access-{}", n),
            Some(&format!("refresh-{}", n)),
            Utc::now() + Duration::hours(1),
        ))
    }

    async fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(result) = self.refresh.lock().unwrap().pop_front() {
            return result;
        }
        let mut fresh = credential_expiring_at(
            &format!("refreshed-{}", n),
            None,
            Utc::now() + Duration::hours(1),
        );
        fresh.refresh_token = credential.refresh_token.clone();
        Ok(fresh)
    }
}

/// In-process session backend. Metrics are set per account; a session runs
/// until cancelled or until `fail_session` is called for its account.
#[derive(Default)]
pub struct MockSessionClient {
    metrics: Mutex<HashMap<String, f64>>,
    poll_failures: Mutex<HashMap<String, usize>>,
    open_failures: Mutex<HashMap<String, usize>>,
    failure_signals: Mutex<HashMap<String, Arc<Notify>>>,
    opened: Mutex<HashMap<String, usize>>,
    closed: Mutex<HashMap<String, usize>>,
    hanging_polls: Mutex<HashMap<String, usize>>,
    rejected: Mutex<Vec<String>>,
    poll_authorizations: Mutex<HashMap<String, String>>,
    polls: AtomicUsize,
}

impl MockSessionClient {
    pub fn set_metric(&self, account: &str, value: f64) {
        self.metrics
            .lock()
            .unwrap()
            .insert(account.to_string(), value);
    }

    pub fn fail_next_poll(&self, account: &str) {
        *self
            .poll_failures
            .lock()
            .unwrap()
            .entry(account.to_string())
            .or_default() += 1;
    }

    pub fn fail_next_open(&self, account: &str) {
        *self
            .open_failures
            .lock()
            .unwrap()
            .entry(account.to_string())
            .or_default() += 1;
    }

    /// The next poll for `account` never answers.
    pub fn hang_next_poll(&self, account: &str) {
        *self
            .hanging_polls
            .lock()
            .unwrap()
            .entry(account.to_string())
            .or_default() += 1;
    }

    /// Polls authorized with this access token fail like an HTTP 401.
    pub fn reject_token(&self, access_token: &str) {
        self.rejected
            .lock()
            .unwrap()
            .push(format!("Bearer {}", access_token));
    }

    /// `Authorization` value of the most recent poll for `account`.
    pub fn last_poll_authorization(&self, account: &str) -> Option<String> {
        self.poll_authorizations.lock().unwrap().get(account).cloned()
    }

    /// Make the running session for `account` return a transport error.
    pub fn fail_session(&self, account: &str) {
        self.signal(account).notify_one();
    }

    pub fn opened(&self, account: &str) -> usize {
        self.opened.lock().unwrap().get(account).copied().unwrap_or(0)
    }

    pub fn closed(&self, account: &str) -> usize {
        self.closed.lock().unwrap().get(account).copied().unwrap_or(0)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    fn signal(&self, account: &str) -> Arc<Notify> {
        self.failure_signals
            .lock()
            .unwrap()
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn take_scripted(map: &Mutex<HashMap<String, usize>>, account: &str) -> bool {
        let mut map = map.lock().unwrap();
        match map.get_mut(account) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl SessionClient for MockSessionClient {
    async fn open(
        &self,
        account: &str,
        credential: &Credential,
    ) -> Result<SessionHandle, SessionError> {
        if Self::take_scripted(&self.open_failures, account) {
            return Err(SessionError::Open("connection refused".to_string()));
        }
        *self
            .opened
            .lock()
            .unwrap()
            .entry(account.to_string())
            .or_default() += 1;
        Ok(SessionHandle::new(account, credential))
    }

    async fn run(
        &self,
        handle: SessionHandle,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        let signal = self.signal(&handle.account);
        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            _ = signal.notified() => Err(SessionError::Transport("connection reset".to_string())),
        }
    }

    async fn poll_metric(
        &self,
        handle: &SessionHandle,
        credential: &Credential,
    ) -> Result<f64, PollError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let authorization = credential.authorization();
        self.poll_authorizations
            .lock()
            .unwrap()
            .insert(handle.account.clone(), authorization.clone());

        if Self::take_scripted(&self.hanging_polls, &handle.account) {
            std::future::pending::<()>().await;
        }
        if Self::take_scripted(&self.poll_failures, &handle.account) {
            return Err(PollError::Request("connection reset".to_string()));
        }
        if self.rejected.lock().unwrap().contains(&authorization) {
            return Err(PollError::Request(
                "balance endpoint returned HTTP 401 Unauthorized".to_string(),
            ));
        }
        Ok(self
            .metrics
            .lock()
            .unwrap()
            .get(&handle.account)
            .copied()
            .unwrap_or(0.0))
    }

    async fn close(&self, handle: &SessionHandle) {
        *self
            .closed
            .lock()
            .unwrap()
            .entry(handle.account.clone())
            .or_default() += 1;
    }
}
