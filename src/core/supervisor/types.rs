use chrono::Duration;
use std::time::Duration as StdDuration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;

use crate::core::config::BotConfig;
use crate::core::store::AccountStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stalled,
    Restarting,
    Failed,
}

impl SessionState {
    /// Persisted form. `Idle` is never written; it only exists in memory.
    pub fn as_status(self) -> Option<AccountStatus> {
        match self {
            SessionState::Idle => None,
            SessionState::Starting => Some(AccountStatus::Starting),
            SessionState::Running => Some(AccountStatus::Running),
            SessionState::Stalled => Some(AccountStatus::Stalled),
            SessionState::Restarting => Some(AccountStatus::Restarting),
            SessionState::Failed => Some(AccountStatus::Failed),
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Running | SessionState::Restarting)
    }
}

pub fn can_transition(from: SessionState, to: SessionState) -> bool {
    if from == to {
        return true;
    }
    if to == SessionState::Idle {
        return true;
    }
    match from {
        SessionState::Idle => matches!(to, SessionState::Starting),
        SessionState::Starting => {
            matches!(to, SessionState::Running | SessionState::Stalled | SessionState::Failed)
        }
        SessionState::Running => matches!(to, SessionState::Stalled | SessionState::Failed),
        // A stalled session still holding its connection may recover on
        // its own before the deferred restart is due.
        SessionState::Stalled => matches!(
            to,
            SessionState::Running
                | SessionState::Restarting
                | SessionState::Starting
                | SessionState::Failed
        ),
        SessionState::Restarting => {
            matches!(to, SessionState::Starting | SessionState::Running | SessionState::Failed)
        }
        SessionState::Failed => matches!(to, SessionState::Starting),
    }
}

/// Outcome of checking one account.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// First observation for this session; nothing to compare against yet.
    Baseline(f64),
    Healthy { previous: f64, current: f64 },
    /// No progress, but the check interval has not elapsed yet.
    Waiting,
    Restarted { attempt: u32 },
    /// A restart is due but held back by backoff.
    RestartDeferred,
    /// The replacement session could not be opened; retried on a later check.
    RestartFailed(String),
    /// Metric unavailable this round. State and last-check are untouched.
    PollFailed(String),
    NotRunning,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Started { account: String },
    Healthy { account: String, metric: f64 },
    Stalled { account: String, metric: Option<f64> },
    Restarted { account: String, attempt: u32 },
    Failed { account: String, reason: String },
    SessionExited { account: String, error: Option<String> },
}

impl SupervisorEvent {
    pub fn account(&self) -> &str {
        match self {
            SupervisorEvent::Started { account }
            | SupervisorEvent::Healthy { account, .. }
            | SupervisorEvent::Stalled { account, .. }
            | SupervisorEvent::Restarted { account, .. }
            | SupervisorEvent::Failed { account, .. }
            | SupervisorEvent::SessionExited { account, .. } => account,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Consecutive restarts without progress before giving up. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
    pub initial_backoff: StdDuration,
    pub max_backoff: StdDuration,
    pub multiplier: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: StdDuration::from_secs(60),
            max_backoff: StdDuration::from_secs(3600),
            multiplier: 2.0,
        }
    }
}

impl RestartPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: self.multiplier,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Minimum time without progress before a session counts as stalled.
    pub check_interval: Duration,
    pub restart: RestartPolicy,
    /// Let restarts fall back to the interactive authorization flow.
    pub background_reauth: bool,
    /// A balance query slower than this counts as a failed poll.
    pub poll_timeout: StdDuration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::hours(1),
            restart: RestartPolicy::default(),
            background_reauth: false,
            poll_timeout: StdDuration::from_secs(60),
        }
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            check_interval: Duration::from_std(config.monitor.check_interval())
                .unwrap_or(Duration::MAX),
            restart: RestartPolicy {
                max_attempts: config.restart.max_attempts,
                initial_backoff: StdDuration::from_secs(config.restart.initial_backoff_secs),
                max_backoff: StdDuration::from_secs(config.restart.max_backoff_secs),
                multiplier: config.restart.multiplier,
            },
            background_reauth: config.security.background_reauth,
            poll_timeout: config.monitor.poll_timeout(),
        }
    }
}
