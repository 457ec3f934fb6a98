use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::scheduler::{ScheduledTask, TaskError};
use crate::core::store::CredentialStore;
use crate::platform::{NativePlatform, Platform};

const BACKUP_PREFIX: &str = "backup_";

/// Snapshots the account database and the log file into
/// `<backup_dir>/backup_<YYYYmmdd_HHMMSS>/`, pruning old snapshots.
pub struct BackupTask {
    store: CredentialStore,
    backup_dir: PathBuf,
    log_file: PathBuf,
    db_name: String,
    keep: usize,
}

impl BackupTask {
    pub fn new(
        store: CredentialStore,
        backup_dir: PathBuf,
        log_file: PathBuf,
        db_file: &Path,
        keep: usize,
    ) -> Self {
        let db_name = db_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "grass_accounts.db".to_string());
        Self {
            store,
            backup_dir,
            log_file,
            db_name,
            keep,
        }
    }

    pub async fn backup_now(&self) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .with_context(|| format!("creating {}", self.backup_dir.display()))?;
        NativePlatform::restrict_dir_permissions(&self.backup_dir);

        let target = self.fresh_target().await;
        tokio::fs::create_dir(&target)
            .await
            .with_context(|| format!("creating {}", target.display()))?;
        NativePlatform::restrict_dir_permissions(&target);

        if tokio::fs::try_exists(&self.log_file).await.unwrap_or(false) {
            if let Some(name) = self.log_file.file_name() {
                tokio::fs::copy(&self.log_file, target.join(name))
                    .await
                    .with_context(|| format!("copying {}", self.log_file.display()))?;
            }
        }

        let db_copy = target.join(&self.db_name);
        self.store.backup_to(&db_copy).await?;
        NativePlatform::restrict_file_permissions(&db_copy);

        info!("Backup completed: {}", target.display());
        self.prune().await?;
        Ok(target)
    }

    async fn fresh_target(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut target = self.backup_dir.join(format!("{}{}", BACKUP_PREFIX, stamp));
        let mut n = 1;
        while tokio::fs::try_exists(&target).await.unwrap_or(false) {
            target = self
                .backup_dir
                .join(format!("{}{}_{}", BACKUP_PREFIX, stamp, n));
            n += 1;
        }
        target
    }

    /// Delete the oldest snapshots beyond `keep`. Zero keeps everything.
    async fn prune(&self) -> Result<usize> {
        if self.keep == 0 {
            return Ok(0);
        }
        let mut snapshots = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.backup_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(BACKUP_PREFIX) && entry.file_type().await?.is_dir() {
                snapshots.push(entry.path());
            }
        }
        snapshots.sort_by_cached_key(|path| snapshot_order(path));

        let excess = snapshots.len().saturating_sub(self.keep);
        for old in snapshots.iter().take(excess) {
            if let Err(e) = tokio::fs::remove_dir_all(old).await {
                warn!("Could not remove old backup {}: {}", old.display(), e);
            }
        }
        Ok(excess)
    }
}

/// Orders `backup_<stamp>` before `backup_<stamp>_1 .. _N`, comparing the
/// collision suffix numerically so `_10` follows `_9`.
fn snapshot_order(path: &Path) -> (String, u64) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stamp = name.strip_prefix(BACKUP_PREFIX).unwrap_or(&name);
    // YYYYmmdd_HHMMSS
    const STAMP_LEN: usize = 15;
    match stamp.split_at_checked(STAMP_LEN) {
        Some((base, "")) => (base.to_string(), 0),
        Some((base, rest)) => match rest.strip_prefix('_').and_then(|n| n.parse().ok()) {
            Some(n) => (base.to_string(), n),
            None => (stamp.to_string(), 0),
        },
        None => (stamp.to_string(), 0),
    }
}

#[async_trait]
impl ScheduledTask for BackupTask {
    async fn run(&self) -> Result<(), TaskError> {
        self.backup_now().await.map(|_| ()).map_err(TaskError::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::AccountStatus;

    async fn task(tmp: &tempfile::TempDir, keep: usize) -> (BackupTask, CredentialStore) {
        let store = CredentialStore::open_in_memory().await.unwrap();
        store
            .upsert("a@x.com", "envelope", AccountStatus::Running)
            .await
            .unwrap();
        let log_file = tmp.path().join("grass_bot.log");
        std::fs::write(&log_file, "2024-01-01 INFO started\n").unwrap();
        let task = BackupTask::new(
            store.clone(),
            tmp.path().join("grass_backups"),
            log_file,
            Path::new("grass_accounts.db"),
            keep,
        );
        (task, store)
    }

    #[tokio::test]
    async fn snapshot_holds_log_and_database() {
        let tmp = tempfile::tempdir().unwrap();
        let (task, _) = task(&tmp, 5).await;
        let target = task.backup_now().await.unwrap();

        let name = target.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("backup_"));
        assert!(target.join("grass_bot.log").exists());

        let copy = CredentialStore::open(&target.join("grass_accounts.db"))
            .await
            .unwrap();
        let record = copy.get("a@x.com").await.unwrap().unwrap();
        assert_eq!(record.encrypted_credential, "envelope");
    }

    #[tokio::test]
    async fn missing_log_file_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let (task, _) = task(&tmp, 5).await;
        std::fs::remove_file(tmp.path().join("grass_bot.log")).unwrap();
        let target = task.backup_now().await.unwrap();
        assert!(target.join("grass_accounts.db").exists());
        assert!(!target.join("grass_bot.log").exists());
    }

    #[tokio::test]
    async fn same_second_backups_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let (task, _) = task(&tmp, 0).await;
        let first = task.backup_now().await.unwrap();
        let second = task.backup_now().await.unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
    }

    #[tokio::test]
    async fn retention_removes_oldest_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let (task, _) = task(&tmp, 2).await;
        let backups = tmp.path().join("grass_backups");
        std::fs::create_dir_all(backups.join("backup_20200101_000000")).unwrap();
        std::fs::create_dir_all(backups.join("backup_20200102_000000")).unwrap();
        std::fs::write(backups.join("notes.txt"), "keep me").unwrap();

        let newest = task.backup_now().await.unwrap();

        assert!(!backups.join("backup_20200101_000000").exists());
        assert!(backups.join("backup_20200102_000000").exists());
        assert!(newest.exists());
        assert!(backups.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn retention_orders_collision_suffixes_numerically() {
        let tmp = tempfile::tempdir().unwrap();
        let (task, _) = task(&tmp, 3).await;
        let backups = tmp.path().join("grass_backups");
        for name in [
            "backup_20200101_000000",
            "backup_20200101_000000_2",
            "backup_20200101_000000_9",
            "backup_20200101_000000_10",
        ] {
            std::fs::create_dir_all(backups.join(name)).unwrap();
        }

        let newest = task.backup_now().await.unwrap();

        assert!(!backups.join("backup_20200101_000000").exists());
        assert!(!backups.join("backup_20200101_000000_2").exists());
        assert!(backups.join("backup_20200101_000000_9").exists());
        assert!(backups.join("backup_20200101_000000_10").exists());
        assert!(newest.exists());
    }

    #[test]
    fn snapshot_order_reads_the_suffix_as_a_number() {
        let key = |name: &str| snapshot_order(Path::new(name));
        assert!(key("backup_20200101_000000") < key("backup_20200101_000000_1"));
        assert!(key("backup_20200101_000000_2") < key("backup_20200101_000000_10"));
        assert!(key("backup_20200101_000000_10") < key("backup_20200101_000001"));
    }
}
