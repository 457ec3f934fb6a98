use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

use crate::core::error::StoreError;

/// Persisted account status: the union of token and session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
    Starting,
    Running,
    Stalled,
    Restarting,
    Failed,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Unauthenticated => "unauthenticated",
            AccountStatus::Authenticating => "authenticating",
            AccountStatus::Authenticated => "authenticated",
            AccountStatus::Expired => "expired",
            AccountStatus::Starting => "starting",
            AccountStatus::Running => "running",
            AccountStatus::Stalled => "stalled",
            AccountStatus::Restarting => "restarting",
            AccountStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "unauthenticated" => Some(AccountStatus::Unauthenticated),
            "authenticating" => Some(AccountStatus::Authenticating),
            "authenticated" => Some(AccountStatus::Authenticated),
            "expired" => Some(AccountStatus::Expired),
            "starting" => Some(AccountStatus::Starting),
            "running" => Some(AccountStatus::Running),
            "stalled" => Some(AccountStatus::Stalled),
            "restarting" => Some(AccountStatus::Restarting),
            "failed" => Some(AccountStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for AccountStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AccountStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        AccountStatus::from_status(text)
            .ok_or_else(|| FromSqlError::Other(StoreError::InvalidStatus(text.to_string()).to_string().into()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountRecord {
    pub email: String,
    /// Envelope text; empty when the account holds no credential.
    pub encrypted_credential: String,
    pub status: AccountStatus,
    pub last_metric: Option<f64>,
    pub last_check: Option<DateTime<Utc>>,
}

impl AccountRecord {
    pub fn has_credential(&self) -> bool {
        !self.encrypted_credential.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_roundtrip() {
        let all = [
            AccountStatus::Unauthenticated,
            AccountStatus::Authenticating,
            AccountStatus::Authenticated,
            AccountStatus::Expired,
            AccountStatus::Starting,
            AccountStatus::Running,
            AccountStatus::Stalled,
            AccountStatus::Restarting,
            AccountStatus::Failed,
        ];
        for status in all {
            assert_eq!(AccountStatus::from_status(status.as_str()), Some(status));
        }
        assert_eq!(AccountStatus::from_status("SUCCESS"), None);
    }
}
