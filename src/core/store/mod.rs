pub mod types;

pub use types::{AccountRecord, AccountStatus};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::error::StoreError;
use crate::platform::{NativePlatform, Platform};

const SELECT_COLUMNS: &str =
    "SELECT email, encrypted_credential, status, last_metric, last_check FROM accounts";

/// Durable account table. Every write is a single statement or a single
/// transaction taken under the connection lock, so a record is never left
/// half-updated.
#[derive(Clone)]
pub struct CredentialStore {
    db: Arc<Mutex<Connection>>,
}

impl CredentialStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Connection::open(path)?;
        NativePlatform::restrict_file_permissions(path);
        let store = Self::from_connection(db)?;
        info!("Credential store opened at {}", path.display());
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(db: Connection) -> Result<Self, StoreError> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                email TEXT PRIMARY KEY,
                encrypted_credential TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                last_metric REAL,
                last_check TEXT
            )",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Insert or replace credential and status. Metric and last-check start
    /// out NULL on insert and are left alone on replace.
    pub async fn upsert(
        &self,
        email: &str,
        encrypted_credential: &str,
        status: AccountStatus,
    ) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO accounts (email, encrypted_credential, status) VALUES (?1, ?2, ?3)
             ON CONFLICT(email) DO UPDATE SET
                encrypted_credential = excluded.encrypted_credential,
                status = excluded.status",
            params![email, encrypted_credential, status],
        )?;
        Ok(())
    }

    pub async fn update_metric(
        &self,
        email: &str,
        value: f64,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE accounts SET last_metric = ?2, last_check = ?3 WHERE email = ?1",
            params![email, value, checked_at],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(email.to_string()));
        }
        Ok(())
    }

    pub async fn update_status(&self, email: &str, status: AccountStatus) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE accounts SET status = ?2 WHERE email = ?1",
            params![email, status],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(email.to_string()));
        }
        Ok(())
    }

    pub async fn get(&self, email: &str) -> Result<Option<AccountRecord>, StoreError> {
        let db = self.db.lock().await;
        Ok(query_record(&db, email)?)
    }

    pub async fn list_all(&self) -> Result<Vec<AccountRecord>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!("{} ORDER BY email", SELECT_COLUMNS))?;
        let rows = stmt.query_map([], map_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub async fn remove(&self, email: &str) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        let rows = db.execute("DELETE FROM accounts WHERE email = ?1", params![email])?;
        Ok(rows > 0)
    }

    /// Read-modify-write one record inside a transaction.
    pub async fn modify<F>(&self, email: &str, f: F) -> Result<AccountRecord, StoreError>
    where
        F: FnOnce(&mut AccountRecord),
    {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let mut record =
            query_record(&tx, email)?.ok_or_else(|| StoreError::NotFound(email.to_string()))?;
        f(&mut record);
        tx.execute(
            "UPDATE accounts SET encrypted_credential = ?2, status = ?3, last_metric = ?4, last_check = ?5
             WHERE email = ?1",
            params![
                record.email,
                record.encrypted_credential,
                record.status,
                record.last_metric,
                record.last_check
            ],
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// Rewrite every stored credential in one transaction. The callback gets
    /// `(email, envelope)` and returns the new envelope, or `None` to clear
    /// the credential and mark the account unauthenticated. Any callback
    /// error rolls the whole batch back.
    pub async fn reencrypt_all<F>(&self, mut f: F) -> Result<usize, StoreError>
    where
        F: FnMut(&str, &str) -> Result<Option<String>, String>,
    {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let rows: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT email, encrypted_credential FROM accounts WHERE encrypted_credential != ''",
            )?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let collected = mapped.collect::<Result<Vec<_>, _>>()?;
            collected
        };

        for (email, stored) in &rows {
            match f(email, stored).map_err(StoreError::Reencrypt)? {
                Some(sealed) => tx.execute(
                    "UPDATE accounts SET encrypted_credential = ?2 WHERE email = ?1",
                    params![email, sealed],
                )?,
                None => tx.execute(
                    "UPDATE accounts SET encrypted_credential = '', status = ?2 WHERE email = ?1",
                    params![email, AccountStatus::Unauthenticated],
                )?,
            };
        }

        tx.commit()?;
        Ok(rows.len())
    }

    /// Forget every credential; used when the key is lost and accounts must
    /// enroll again.
    pub async fn reset_credentials(&self) -> Result<usize, StoreError> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE accounts SET encrypted_credential = '', status = ?1",
            params![AccountStatus::Unauthenticated],
        )?;
        Ok(rows)
    }

    /// Write a consistent snapshot of the database to `target`.
    pub async fn backup_to(&self, target: &Path) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "VACUUM INTO ?1",
            params![target.to_string_lossy().into_owned()],
        )?;
        Ok(())
    }
}

fn query_record(db: &Connection, email: &str) -> rusqlite::Result<Option<AccountRecord>> {
    db.query_row(
        &format!("{} WHERE email = ?1", SELECT_COLUMNS),
        params![email],
        map_record,
    )
    .optional()
}

fn map_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRecord> {
    Ok(AccountRecord {
        email: row.get(0)?,
        encrypted_credential: row.get(1)?,
        status: row.get(2)?,
        last_metric: row.get(3)?,
        last_check: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn upsert_inserts_with_unset_metric() {
        let store = CredentialStore::open_in_memory().await.unwrap();
        store
            .upsert("a@x.com", "blob", AccountStatus::Authenticated)
            .await
            .unwrap();

        let record = store.get("a@x.com").await.unwrap().unwrap();
        assert_eq!(record.encrypted_credential, "blob");
        assert_eq!(record.status, AccountStatus::Authenticated);
        assert_eq!(record.last_metric, None);
        assert_eq!(record.last_check, None);
    }

    #[tokio::test]
    async fn upsert_replay_is_idempotent() {
        let store = CredentialStore::open_in_memory().await.unwrap();
        store
            .upsert("a@x.com", "blob", AccountStatus::Authenticated)
            .await
            .unwrap();
        let once = store.get("a@x.com").await.unwrap();

        store
            .upsert("a@x.com", "blob", AccountStatus::Authenticated)
            .await
            .unwrap();
        let twice = store.get("a@x.com").await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upsert_preserves_metric_on_replace() {
        let store = CredentialStore::open_in_memory().await.unwrap();
        store
            .upsert("a@x.com", "old", AccountStatus::Running)
            .await
            .unwrap();
        store.update_metric("a@x.com", 42.5, at(0)).await.unwrap();
        store
            .upsert("a@x.com", "new", AccountStatus::Authenticated)
            .await
            .unwrap();

        let record = store.get("a@x.com").await.unwrap().unwrap();
        assert_eq!(record.encrypted_credential, "new");
        assert_eq!(record.status, AccountStatus::Authenticated);
        assert_eq!(record.last_metric, Some(42.5));
        assert_eq!(record.last_check, Some(at(0)));
    }

    #[tokio::test]
    async fn update_metric_leaves_credential_and_status() {
        let store = CredentialStore::open_in_memory().await.unwrap();
        store
            .upsert("a@x.com", "blob", AccountStatus::Running)
            .await
            .unwrap();
        store.update_metric("a@x.com", 100.0, at(60)).await.unwrap();

        let record = store.get("a@x.com").await.unwrap().unwrap();
        assert_eq!(record.encrypted_credential, "blob");
        assert_eq!(record.status, AccountStatus::Running);
        assert_eq!(record.last_metric, Some(100.0));
    }

    #[tokio::test]
    async fn updates_on_unknown_account_fail() {
        let store = CredentialStore::open_in_memory().await.unwrap();
        assert!(matches!(
            store.update_metric("ghost@x.com", 1.0, at(0)).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.update_status("ghost@x.com", AccountStatus::Failed).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.modify("ghost@x.com", |_| {}).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_all_is_sorted_snapshot() {
        let store = CredentialStore::open_in_memory().await.unwrap();
        for email in ["c@x.com", "a@x.com", "b@x.com"] {
            store
                .upsert(email, "blob", AccountStatus::Authenticated)
                .await
                .unwrap();
        }
        let emails: Vec<_> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.email)
            .collect();
        assert_eq!(emails, vec!["a@x.com", "b@x.com", "c@x.com"]);
    }

    #[tokio::test]
    async fn modify_applies_read_modify_write() {
        let store = CredentialStore::open_in_memory().await.unwrap();
        store
            .upsert("a@x.com", "blob", AccountStatus::Running)
            .await
            .unwrap();
        store.update_metric("a@x.com", 10.0, at(0)).await.unwrap();

        let updated = store
            .modify("a@x.com", |record| {
                record.last_metric = record.last_metric.map(|m| m + 5.0);
                record.status = AccountStatus::Stalled;
            })
            .await
            .unwrap();
        assert_eq!(updated.last_metric, Some(15.0));
        assert_eq!(store.get("a@x.com").await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn remove_and_reset_credentials() {
        let store = CredentialStore::open_in_memory().await.unwrap();
        store
            .upsert("a@x.com", "blob", AccountStatus::Running)
            .await
            .unwrap();
        store
            .upsert("b@x.com", "blob", AccountStatus::Running)
            .await
            .unwrap();

        assert!(store.remove("b@x.com").await.unwrap());
        assert!(!store.remove("b@x.com").await.unwrap());

        assert_eq!(store.reset_credentials().await.unwrap(), 1);
        let record = store.get("a@x.com").await.unwrap().unwrap();
        assert!(!record.has_credential());
        assert_eq!(record.status, AccountStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn reencrypt_error_rolls_back() {
        let store = CredentialStore::open_in_memory().await.unwrap();
        store
            .upsert("a@x.com", "one", AccountStatus::Running)
            .await
            .unwrap();
        store
            .upsert("b@x.com", "two", AccountStatus::Running)
            .await
            .unwrap();

        let result = store
            .reencrypt_all(|email, _| {
                if email == "b@x.com" {
                    Err("boom".to_string())
                } else {
                    Ok(Some("rewritten".to_string()))
                }
            })
            .await;
        assert!(matches!(result, Err(StoreError::Reencrypt(_))));
        let a = store.get("a@x.com").await.unwrap().unwrap();
        assert_eq!(a.encrypted_credential, "one");
    }

    #[tokio::test]
    async fn on_disk_store_survives_reopen_and_backs_up() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("grass_accounts.db");
        {
            let store = CredentialStore::open(&path).await.unwrap();
            store
                .upsert("a@x.com", "blob", AccountStatus::Running)
                .await
                .unwrap();
            let snapshot = tmp.path().join("snapshot.db");
            store.backup_to(&snapshot).await.unwrap();

            let copy = CredentialStore::open(&snapshot).await.unwrap();
            assert_eq!(copy.count().await.unwrap(), 1);
        }
        let reopened = CredentialStore::open(&path).await.unwrap();
        let record = reopened.get("a@x.com").await.unwrap().unwrap();
        assert_eq!(record.status, AccountStatus::Running);
    }
}
