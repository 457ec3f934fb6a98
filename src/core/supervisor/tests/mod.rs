use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::core::oauth::TokenLifecycle;
use crate::core::store::CredentialStore;
use crate::core::supervisor::{RestartPolicy, Supervisor, SupervisorEvent, SupervisorSettings};
use crate::core::testing::{MockIdentityProvider, MockSessionClient, test_vault};


pub(super) struct Harness {
    pub store: CredentialStore,
    pub provider: Arc<MockIdentityProvider>,
    pub client: Arc<MockSessionClient>,
    pub supervisor: Arc<Supervisor>,
    _tmp: tempfile::TempDir,
}

pub(super) async fn harness(settings: SupervisorSettings) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let store = CredentialStore::open_in_memory().await.unwrap();
    let provider = Arc::new(MockIdentityProvider::default());
    let client = Arc::new(MockSessionClient::default());
    let tokens = Arc::new(TokenLifecycle::new(
        store.clone(),
        test_vault(&tmp),
        provider.clone(),
        vec!["email".to_string()],
    ));
    let supervisor = Arc::new(Supervisor::new(
        store.clone(),
        tokens,
        client.clone(),
        settings,
    ));
    Harness {
        store,
        provider,
        client,
        supervisor,
        _tmp: tmp,
    }
}

/// Current time truncated to whole seconds.
pub(super) fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap()
}

pub(super) fn hourly() -> SupervisorSettings {
    SupervisorSettings::default()
}

pub(super) fn with_policy(restart: RestartPolicy) -> SupervisorSettings {
    SupervisorSettings {
        restart,
        ..SupervisorSettings::default()
    }
}

/// Events already delivered to `rx`, without waiting.
pub(super) fn drain(rx: &mut tokio::sync::broadcast::Receiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub(super) async fn wait_for_exit(
    rx: &mut tokio::sync::broadcast::Receiver<SupervisorEvent>,
    account: &str,
) {
    tokio::time::timeout(StdDuration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(SupervisorEvent::SessionExited { account: a, .. }) if a == account => return,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {}", e),
            }
        }
    })
    .await
    .expect("session exit was not reported");
}
