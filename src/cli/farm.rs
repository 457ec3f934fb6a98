use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::RunArgs;
use crate::core::context::AppContext;
use crate::core::error::CoreError;
use crate::core::oauth::GoogleIdentityProvider;
use crate::core::session::WebSocketSessionClient;
use crate::core::supervisor::{Decision, Supervisor};
use crate::core::terminal::{GuideSection, print_error, print_success, print_warn};

/// Accounts to farm: the ones named on the command line, otherwise every
/// configured account followed by any other stored one.
pub(crate) fn select_accounts(
    configured: &[String],
    stored: &[String],
    requested: &[String],
) -> Vec<String> {
    let source: Vec<&String> = if requested.is_empty() {
        configured.iter().chain(stored.iter()).collect()
    } else {
        requested.iter().collect()
    };

    let mut accounts: Vec<String> = Vec::new();
    for email in source {
        let email = email.trim();
        if !email.is_empty() && !accounts.iter().any(|a| a == email) {
            accounts.push(email.to_string());
        }
    }
    accounts
}

/// Start each account, then record a first balance for every running
/// session so the first stagnation verdict comes one check interval after
/// startup. Returns how many accounts started.
pub(crate) async fn start_accounts(
    supervisor: &Supervisor,
    accounts: &[String],
) -> Result<usize, CoreError> {
    let mut started = 0;
    for email in accounts {
        match supervisor.start(email).await {
            Ok(()) => {
                started += 1;
                print_success(&format!("Farming started for {}", email));
            }
            Err(e) if e.is_shared_infrastructure() => return Err(e),
            Err(e) => print_error(&format!("{}: {}", email, e)),
        }
    }
    if started > 0 {
        let baselines = supervisor
            .sweep()
            .await?
            .iter()
            .filter(|(_, d)| matches!(d, Decision::Baseline(_)))
            .count();
        info!(baselines, "Initial balances recorded");
    }
    Ok(started)
}

pub async fn run_farm(ctx: AppContext, args: RunArgs) -> Result<()> {
    let stored: Vec<String> = ctx
        .store
        .list_all()
        .await?
        .into_iter()
        .map(|r| r.email)
        .collect();
    let accounts = select_accounts(&ctx.config.accounts, &stored, &args.accounts);
    if accounts.is_empty() {
        print_warn("No accounts to farm. Add them to grassbot.toml or run `grassbot login <email>`.");
        return Ok(());
    }

    let provider = Arc::new(GoogleIdentityProvider::from_config(&ctx.config.identity)?);
    let tokens = ctx.token_lifecycle(provider);
    let client = Arc::new(WebSocketSessionClient::new(&ctx.config.farming));
    let supervisor = ctx.supervisor(tokens, client);

    info!("Starting grassbot for {} account(s)", accounts.len());
    let started = match start_accounts(&supervisor, &accounts).await {
        Ok(started) => started,
        Err(e) => {
            supervisor.shutdown().await;
            return Err(e.into());
        }
    };
    if started == 0 {
        anyhow::bail!("no account could be started");
    }

    GuideSection::new("grassbot running")
        .status("Accounts", &format!("{} of {}", started, accounts.len()))
        .status(
            "Progress check",
            &format!("every {}s", ctx.config.monitor.check_interval_secs),
        )
        .status("Log file", &ctx.paths.log_file.display().to_string())
        .blank()
        .text("Press Ctrl+C to stop.")
        .print();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            on_signal.cancel();
        }
    });

    let mut scheduler = ctx.scheduler(supervisor.clone());
    let result = scheduler.run_until(ctx.config.monitor.tick(), cancel).await;
    supervisor.shutdown().await;
    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{select_accounts, start_accounts};
    use crate::core::error::AuthError;
    use crate::core::oauth::TokenLifecycle;
    use crate::core::store::CredentialStore;
    use crate::core::supervisor::{Decision, Supervisor, SupervisorSettings};
    use crate::core::testing::{MockIdentityProvider, MockSessionClient, test_vault};
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn configured_accounts_come_first_without_duplicates() {
        let accounts = select_accounts(
            &list(&["user1@example.com", "user2@example.com"]),
            &list(&["a@x.com", "user1@example.com"]),
            &[],
        );
        assert_eq!(
            accounts,
            list(&["user1@example.com", "user2@example.com", "a@x.com"])
        );
    }

    #[test]
    fn requested_accounts_override_everything() {
        let accounts = select_accounts(
            &list(&["user1@example.com"]),
            &list(&["a@x.com"]),
            &list(&["b@x.com", " b@x.com "]),
        );
        assert_eq!(accounts, list(&["b@x.com"]));
    }

    #[tokio::test]
    async fn startup_records_baselines_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::open_in_memory().await.unwrap();
        let provider = Arc::new(MockIdentityProvider::default());
        provider.push_interactive(Ok(crate::core::testing::credential_expiring_at(
            "t",
            Some("r"),
            Utc::now() + Duration::hours(2),
        )));
        provider.push_interactive(Err(AuthError::Interactive("user cancelled".into())));
        let client = Arc::new(MockSessionClient::default());
        client.set_metric("a@x.com", 5.0);
        let tokens = Arc::new(TokenLifecycle::new(
            store.clone(),
            test_vault(&tmp),
            provider,
            vec!["email".to_string()],
        ));
        let supervisor = Supervisor::new(
            store.clone(),
            tokens,
            client.clone(),
            SupervisorSettings::default(),
        );

        let started = start_accounts(&supervisor, &list(&["a@x.com", "b@x.com"]))
            .await
            .unwrap();
        assert_eq!(started, 1);

        let record = store.get("a@x.com").await.unwrap().unwrap();
        assert_eq!(record.last_metric, Some(5.0));
        assert!(record.last_check.is_some());

        // No progress for one interval after startup is already a stall.
        let decision = supervisor
            .check_at("a@x.com", Utc::now() + Duration::hours(1) + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Restarted { attempt: 1 });
    }
}
