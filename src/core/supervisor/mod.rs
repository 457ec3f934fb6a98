//! Session supervision: one live session per account, periodic progress
//! checks, and bounded restarts of sessions that stopped earning.
//!
//! Every operation on an account runs under that account's slot lock, so a
//! check can never race a restart of the same account. Different accounts
//! never block each other.

mod types;

pub use types::{
    Decision, RestartPolicy, SessionState, SupervisorEvent, SupervisorSettings, can_transition,
};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::error::{CoreError, PollError, StoreError};
use crate::core::oauth::{AuthMode, TokenLifecycle};
use crate::core::session::{SessionClient, SessionHandle};
use crate::core::store::{AccountStatus, CredentialStore};

const EVENT_CAPACITY: usize = 64;
const STOP_TIMEOUT: StdDuration = StdDuration::from_secs(5);

struct ActiveSession {
    handle: SessionHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct AccountSlot {
    state: SessionState,
    session: Option<ActiveSession>,
    // The first poll of a fresh session only records a baseline.
    baseline_taken: bool,
    restart_attempts: u32,
    backoff: ExponentialBackoff,
    next_restart_at: Option<DateTime<Utc>>,
}

impl AccountSlot {
    fn new(policy: &RestartPolicy) -> Self {
        Self {
            state: SessionState::Idle,
            session: None,
            baseline_taken: false,
            restart_attempts: 0,
            backoff: policy.backoff(),
            next_restart_at: None,
        }
    }

    fn reset_restarts(&mut self) {
        self.restart_attempts = 0;
        self.backoff.reset();
        self.next_restart_at = None;
    }
}

struct SessionExit {
    account: String,
    session_id: Uuid,
    error: Option<String>,
}

pub struct Supervisor {
    store: CredentialStore,
    tokens: Arc<TokenLifecycle>,
    client: Arc<dyn SessionClient>,
    settings: SupervisorSettings,
    slots: Mutex<HashMap<String, Arc<Mutex<AccountSlot>>>>,
    exits_tx: mpsc::UnboundedSender<SessionExit>,
    exits_rx: Mutex<mpsc::UnboundedReceiver<SessionExit>>,
    events: broadcast::Sender<SupervisorEvent>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        store: CredentialStore,
        tokens: Arc<TokenLifecycle>,
        client: Arc<dyn SessionClient>,
        settings: SupervisorSettings,
    ) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            tokens,
            client,
            settings,
            slots: Mutex::new(HashMap::new()),
            exits_tx,
            exits_rx: Mutex::new(exits_rx),
            events,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self, email: &str) -> Option<SessionState> {
        let slot = self.slots.lock().await.get(email).cloned()?;
        let state = slot.lock().await.state;
        Some(state)
    }

    /// Accounts this supervisor has been asked to start, sorted.
    pub async fn accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self.slots.lock().await.keys().cloned().collect();
        accounts.sort();
        accounts
    }

    /// Foreground start. May run the interactive authorization flow.
    /// Starting an account that is already live is a no-op.
    pub async fn start(&self, email: &str) -> Result<(), CoreError> {
        let slot = self.slot_or_insert(email).await;
        let mut slot = slot.lock().await;
        if slot.state.is_live() {
            return Ok(());
        }
        slot.reset_restarts();

        match self.launch(&mut slot, email, AuthMode::Interactive).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_shared_infrastructure() => Err(e),
            Err(e) => {
                self.mark_failed(&mut slot, email, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    pub async fn check(&self, email: &str) -> Result<Decision, CoreError> {
        self.check_at(email, Utc::now()).await
    }

    /// Poll one account and restart it if it made no progress for a full
    /// check interval.
    pub async fn check_at(&self, email: &str, now: DateTime<Utc>) -> Result<Decision, CoreError> {
        let slot = self
            .slots
            .lock()
            .await
            .get(email)
            .cloned()
            .ok_or_else(|| CoreError::UnknownAccount(email.to_string()))?;
        let mut slot = slot.lock().await;

        match slot.state {
            SessionState::Running => {}
            // A stalled account with no session is waiting for its restart.
            SessionState::Stalled if slot.session.is_none() => {
                return self.restart(&mut slot, email, now, None).await;
            }
            SessionState::Stalled => {}
            _ => return Ok(Decision::NotRunning),
        }

        let Some(handle) = slot.session.as_ref().map(|s| s.handle.clone()) else {
            return Ok(Decision::NotRunning);
        };

        // Tokens expire while the session runs; every poll goes through the
        // lifecycle so it is refreshed before it lapses.
        let credential = match self.tokens.obtain(email, self.background_mode()).await {
            Ok(credential) => credential,
            Err(e) if e.is_shared_infrastructure() => return Err(e),
            Err(e) => {
                let reason = e.to_string();
                self.stop_session(&mut slot).await;
                self.mark_failed(&mut slot, email, &reason).await?;
                return Ok(Decision::Failed(reason));
            }
        };

        let record = self
            .store
            .get(email)
            .await?
            .ok_or_else(|| CoreError::UnknownAccount(email.to_string()))?;
        // A refresh rewrites the token status; the session status wins.
        if let Some(status) = slot.state.as_status() {
            if record.status != status {
                self.store.update_status(email, status).await?;
            }
        }

        let poll = tokio::time::timeout(
            self.settings.poll_timeout,
            self.client.poll_metric(&handle, &credential),
        )
        .await
        .unwrap_or(Err(PollError::Timeout(self.settings.poll_timeout)));
        let metric = match poll {
            Ok(value) => value,
            Err(e) => {
                warn!(account = %email, "Failed to retrieve balance: {}", e);
                return Ok(Decision::PollFailed(e.to_string()));
            }
        };

        let previous = match (slot.baseline_taken, record.last_metric, record.last_check) {
            (true, Some(previous), Some(last_check)) => Some((previous, last_check)),
            _ => None,
        };

        let Some((previous, last_check)) = previous else {
            self.store.update_metric(email, metric, now).await?;
            slot.baseline_taken = true;
            info!(account = %email, "Baseline balance recorded: {}", metric);
            return Ok(Decision::Baseline(metric));
        };

        if metric > previous {
            self.store.update_metric(email, metric, now).await?;
            slot.reset_restarts();
            if slot.state == SessionState::Stalled {
                self.enter(&mut slot, email, SessionState::Running).await?;
            }
            info!(account = %email, "Points still accumulating ({} -> {})", previous, metric);
            self.emit(SupervisorEvent::Healthy {
                account: email.to_string(),
                metric,
            });
            return Ok(Decision::Healthy {
                previous,
                current: metric,
            });
        }

        if now - last_check < self.settings.check_interval {
            return Ok(Decision::Waiting);
        }

        warn!(account = %email, "No points earned. Restarting session.");
        self.restart(&mut slot, email, now, Some(metric)).await
    }

    /// Check every stored account this supervisor manages. Account-local
    /// failures are logged and skipped; shared-infrastructure failures abort
    /// the sweep.
    pub async fn sweep(&self) -> Result<Vec<(String, Decision)>, CoreError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<(String, Decision)>, CoreError> {
        self.drain_exits().await?;

        let mut decisions = Vec::new();
        for record in self.store.list_all().await? {
            match self.check_at(&record.email, now).await {
                Ok(decision) => decisions.push((record.email, decision)),
                Err(CoreError::UnknownAccount(_)) => {}
                Err(e) if e.is_shared_infrastructure() => return Err(e),
                Err(e) => error!(account = %record.email, "Check failed: {}", e),
            }
        }
        Ok(decisions)
    }

    /// Stop every session. Accounts that were live are left `authenticated`
    /// in the store.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let slots: Vec<(String, Arc<Mutex<AccountSlot>>)> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(email, slot)| (email.clone(), slot.clone()))
            .collect();

        for (email, slot) in slots {
            let mut slot = slot.lock().await;
            let was_live = slot.session.is_some();
            self.stop_session(&mut slot).await;
            if slot.state != SessionState::Failed {
                slot.state = SessionState::Idle;
                if was_live {
                    if let Err(e) = self
                        .store
                        .update_status(&email, AccountStatus::Authenticated)
                        .await
                    {
                        warn!(account = %email, "Could not record shutdown: {}", e);
                    }
                }
            }
        }
        info!("All farming sessions stopped");
    }

    async fn slot_or_insert(&self, email: &str) -> Arc<Mutex<AccountSlot>> {
        self.slots
            .lock()
            .await
            .entry(email.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AccountSlot::new(&self.settings.restart))))
            .clone()
    }

    fn background_mode(&self) -> AuthMode {
        if self.settings.background_reauth {
            AuthMode::Interactive
        } else {
            AuthMode::Background
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event); // Ignored if no receivers
    }

    fn set_state(&self, slot: &mut AccountSlot, email: &str, to: SessionState) {
        if !can_transition(slot.state, to) {
            warn!(account = %email, "Unexpected session transition {:?} -> {:?}", slot.state, to);
        }
        slot.state = to;
    }

    async fn enter(
        &self,
        slot: &mut AccountSlot,
        email: &str,
        to: SessionState,
    ) -> Result<(), StoreError> {
        self.set_state(slot, email, to);
        match to.as_status() {
            Some(status) => self.store.update_status(email, status).await,
            None => Ok(()),
        }
    }

    /// Obtain a credential, open a session and hand it to a background task.
    async fn launch(
        &self,
        slot: &mut AccountSlot,
        email: &str,
        mode: AuthMode,
    ) -> Result<(), CoreError> {
        self.set_state(slot, email, SessionState::Starting);
        let credential = self.tokens.obtain(email, mode).await?;
        self.enter(slot, email, SessionState::Starting).await?;

        let handle = self.client.open(email, &credential).await?;
        let cancel = self.shutdown.child_token();
        let task = self.spawn_session(handle.clone(), cancel.clone());

        let session_id = handle.id;
        slot.session = Some(ActiveSession {
            handle,
            cancel,
            task,
        });
        slot.baseline_taken = false;
        self.enter(slot, email, SessionState::Running).await?;

        info!(account = %email, session = %session_id, "Farming session running");
        self.emit(SupervisorEvent::Started {
            account: email.to_string(),
        });
        Ok(())
    }

    fn spawn_session(&self, handle: SessionHandle, cancel: CancellationToken) -> JoinHandle<()> {
        let client = self.client.clone();
        let exits = self.exits_tx.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let account = handle.account.clone();
            let session_id = handle.id;
            let error = client.run(handle, cancel).await.err().map(|e| e.to_string());
            if let Some(e) = &error {
                error!(account = %account, "Farming failed: {}", e);
            }
            let _ = exits.send(SessionExit {
                account: account.clone(),
                session_id,
                error: error.clone(),
            });
            let _ = events.send(SupervisorEvent::SessionExited { account, error });
        })
    }

    async fn stop_session(&self, slot: &mut AccountSlot) {
        let Some(mut session) = slot.session.take() else {
            return;
        };
        session.cancel.cancel();
        self.client.close(&session.handle).await;
        if tokio::time::timeout(STOP_TIMEOUT, &mut session.task)
            .await
            .is_err()
        {
            warn!(account = %session.handle.account, "Session did not stop in time, aborting");
            session.task.abort();
        }
    }

    /// Sessions that died on their own become stalled and wait for the next
    /// check to restart them.
    async fn drain_exits(&self) -> Result<(), CoreError> {
        let exits: Vec<SessionExit> = {
            let mut rx = self.exits_rx.lock().await;
            let mut exits = Vec::new();
            while let Ok(exit) = rx.try_recv() {
                exits.push(exit);
            }
            exits
        };

        for exit in exits {
            let Some(error) = exit.error else {
                continue;
            };
            let Some(slot) = self.slots.lock().await.get(&exit.account).cloned() else {
                continue;
            };
            let mut slot = slot.lock().await;
            let current = slot.session.as_ref().map(|s| s.handle.id);
            if current != Some(exit.session_id) {
                continue;
            }
            slot.session = None;
            warn!(account = %exit.account, "Session exited: {}", error);
            self.enter(&mut slot, &exit.account, SessionState::Stalled)
                .await?;
            self.emit(SupervisorEvent::Stalled {
                account: exit.account.clone(),
                metric: None,
            });
        }
        Ok(())
    }

    async fn restart(
        &self,
        slot: &mut AccountSlot,
        email: &str,
        now: DateTime<Utc>,
        observed: Option<f64>,
    ) -> Result<Decision, CoreError> {
        if self.settings.restart.exhausted(slot.restart_attempts) {
            let reason = format!(
                "no progress after {} restart attempt(s)",
                slot.restart_attempts
            );
            self.stop_session(slot).await;
            self.mark_failed(slot, email, &reason).await?;
            return Ok(Decision::Failed(reason));
        }

        if slot.state == SessionState::Running {
            self.enter(slot, email, SessionState::Stalled).await?;
            self.emit(SupervisorEvent::Stalled {
                account: email.to_string(),
                metric: observed,
            });
        }

        if slot.next_restart_at.is_some_and(|at| now < at) {
            return Ok(Decision::RestartDeferred);
        }

        self.enter(slot, email, SessionState::Restarting).await?;
        self.stop_session(slot).await;

        slot.restart_attempts += 1;
        let attempt = slot.restart_attempts;
        slot.next_restart_at = slot
            .backoff
            .next_backoff()
            .and_then(|delay| chrono::Duration::from_std(delay).ok())
            .map(|delay| now + delay);

        match self.launch(slot, email, self.background_mode()).await {
            Ok(()) => {
                // The restart itself starts a new observation window.
                if let Some(metric) = observed {
                    self.store.update_metric(email, metric, now).await?;
                    slot.baseline_taken = true;
                }
                info!(account = %email, attempt, "Session restarted");
                self.emit(SupervisorEvent::Restarted {
                    account: email.to_string(),
                    attempt,
                });
                Ok(Decision::Restarted { attempt })
            }
            Err(e) if e.is_shared_infrastructure() => Err(e),
            Err(CoreError::Session(e)) => {
                warn!(account = %email, attempt, "Restart failed: {}", e);
                self.enter(slot, email, SessionState::Stalled).await?;
                Ok(Decision::RestartFailed(e.to_string()))
            }
            Err(e) => {
                let reason = e.to_string();
                self.mark_failed(slot, email, &reason).await?;
                Ok(Decision::Failed(reason))
            }
        }
    }

    async fn mark_failed(
        &self,
        slot: &mut AccountSlot,
        email: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.set_state(slot, email, SessionState::Failed);
        match self.store.update_status(email, AccountStatus::Failed).await {
            Err(StoreError::NotFound(_)) => {
                self.store
                    .upsert(email, "", AccountStatus::Failed)
                    .await?
            }
            other => other?,
        }
        error!(account = %email, "Account failed: {}", reason);
        self.emit(SupervisorEvent::Failed {
            account: email.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests;
