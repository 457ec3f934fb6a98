//! Wiring for one bot instance. Everything a component needs is handed to
//! its constructor from here; nothing is global.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::backup::BackupTask;
use crate::core::config::{BotConfig, ResolvedPaths};
use crate::core::error::{CoreError, LockError, VaultError};
use crate::core::lock::DataDirLock;
use crate::core::oauth::{IdentityProvider, TokenLifecycle};
use crate::core::scheduler::{ScheduledTask, Scheduler, TaskError};
use crate::core::session::SessionClient;
use crate::core::store::CredentialStore;
use crate::core::supervisor::{Decision, Supervisor, SupervisorSettings};
use crate::core::vault::CipherVault;
use crate::platform::{NativePlatform, Platform};

pub struct AppContext {
    pub config: BotConfig,
    pub paths: ResolvedPaths,
    pub store: CredentialStore,
    pub vault: Arc<CipherVault>,
    lock: Option<DataDirLock>,
}

impl AppContext {
    /// Open the store and check that the key file still matches it.
    pub async fn bootstrap(config: BotConfig, paths: ResolvedPaths) -> Result<Self> {
        Self::open(config, paths, None).await
    }

    /// Like [`AppContext::bootstrap`], but first takes the data directory
    /// lock and holds it for the lifetime of the context.
    pub async fn bootstrap_exclusive(
        config: BotConfig,
        paths: ResolvedPaths,
        purpose: &str,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&paths.data_dir).await?;
        let lock = DataDirLock::acquire(&paths.data_dir, purpose)?;
        Self::open(config, paths, Some(lock)).await
    }

    async fn open(
        config: BotConfig,
        paths: ResolvedPaths,
        lock: Option<DataDirLock>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&paths.data_dir).await?;
        NativePlatform::restrict_dir_permissions(&paths.data_dir);

        let store = CredentialStore::open(&paths.db_file).await?;
        let vault = Arc::new(CipherVault::new(&paths.key_file));
        recover_rotation(&paths, &store, &vault, lock.is_some()).await?;
        guard_key_loss(&store, &vault, config.security.reenroll_on_key_loss).await?;

        Ok(Self {
            config,
            paths,
            store,
            vault,
            lock,
        })
    }

    pub fn holds_lock(&self) -> bool {
        self.lock.is_some()
    }

    pub fn token_lifecycle(&self, provider: Arc<dyn IdentityProvider>) -> Arc<TokenLifecycle> {
        Arc::new(TokenLifecycle::new(
            self.store.clone(),
            self.vault.clone(),
            provider,
            self.config.identity.scopes.clone(),
        ))
    }

    pub fn supervisor(
        &self,
        tokens: Arc<TokenLifecycle>,
        client: Arc<dyn SessionClient>,
    ) -> Arc<Supervisor> {
        Arc::new(Supervisor::new(
            self.store.clone(),
            tokens,
            client,
            SupervisorSettings::from_config(&self.config),
        ))
    }

    pub fn backup_task(&self) -> BackupTask {
        BackupTask::new(
            self.store.clone(),
            self.paths.backup_dir.clone(),
            self.paths.log_file.clone(),
            &self.paths.db_file,
            self.config.backup.keep,
        )
    }

    /// Monitoring sweep and backup on their configured intervals.
    pub fn scheduler(&self, supervisor: Arc<Supervisor>) -> Scheduler {
        let mut scheduler = Scheduler::new();
        scheduler
            .every(self.config.monitor.check_interval())
            .run("monitor", Arc::new(MonitorTask { supervisor }));
        scheduler
            .every(std::time::Duration::from_secs(
                self.config.backup.interval_secs.max(1),
            ))
            .run("backup", Arc::new(self.backup_task()));
        scheduler
    }
}

/// Settle a key rotation another process left half done. Without the data
/// directory lock the staged key may belong to a rotation still in flight,
/// so recovery is only attempted when the lock can be taken.
async fn recover_rotation(
    paths: &ResolvedPaths,
    store: &CredentialStore,
    vault: &CipherVault,
    locked: bool,
) -> Result<()> {
    if locked {
        vault.recover_rotation(store).await?;
        return Ok(());
    }
    match DataDirLock::acquire(&paths.data_dir, "recovery") {
        Ok(_lock) => {
            vault.recover_rotation(store).await?;
        }
        Err(LockError::Held { holder, .. }) => {
            debug!("Skipping key rotation recovery, data directory held by {}", holder);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// A missing key file while encrypted credentials exist means every stored
/// credential is unreadable. Refuse to continue unless re-enrollment is
/// allowed, in which case the dead envelopes are cleared.
pub async fn guard_key_loss(
    store: &CredentialStore,
    vault: &CipherVault,
    reenroll: bool,
) -> Result<(), CoreError> {
    if vault.key_present() {
        return Ok(());
    }
    let sealed = store
        .list_all()
        .await?
        .iter()
        .filter(|r| r.has_credential())
        .count();
    if sealed == 0 {
        return Ok(());
    }

    let key_path = vault.key_path().display().to_string();
    if !reenroll {
        return Err(VaultError::KeyMissing(key_path).into());
    }
    let cleared = store.reset_credentials().await?;
    warn!(
        "Key file {} is missing; cleared {} credential(s), accounts must log in again",
        key_path, cleared
    );
    Ok(())
}

pub struct MonitorTask {
    supervisor: Arc<Supervisor>,
}

#[async_trait]
impl ScheduledTask for MonitorTask {
    async fn run(&self) -> Result<(), TaskError> {
        let decisions = self.supervisor.sweep().await.map_err(|e| {
            if e.is_shared_infrastructure() {
                TaskError::Fatal(e.into())
            } else {
                TaskError::Failed(e.into())
            }
        })?;

        let restarted = decisions
            .iter()
            .filter(|(_, d)| matches!(d, Decision::Restarted { .. }))
            .count();
        let failed = decisions
            .iter()
            .filter(|(_, d)| matches!(d, Decision::Failed(_)))
            .count();
        info!(
            checked = decisions.len(),
            restarted, failed, "Monitoring sweep finished"
        );
        Ok(())
    }
}
