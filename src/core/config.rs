use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const CONFIG_FILE: &str = "grassbot.toml";

/// Ten years. Keeps every configured duration representable as a timestamp
/// offset.
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BotConfig {
    #[serde(default)]
    pub accounts: Vec<String>,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub restart: RestartConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub farming: FarmingConfig,

    #[serde(default)]
    pub security: SecurityConfig,
}

/// File names are resolved relative to the data directory unless absolute.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_db_file")]
    pub db_file: PathBuf,

    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Minimum time without progress before a session counts as stalled.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Sleep between scheduler passes.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// Upper bound on one balance query; a slower answer counts as a failed
    /// poll.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestartConfig {
    /// Consecutive restarts allowed without observed progress. Unset means
    /// unlimited.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_interval_secs")]
    pub interval_secs: u64,

    /// Number of backup directories to retain; 0 keeps everything.
    #[serde(default = "default_backup_keep")]
    pub keep: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_auth_url")]
    pub auth_url: String,

    #[serde(default = "default_token_url")]
    pub token_url: String,

    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FarmingConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default = "default_balance_url")]
    pub balance_url: String,

    #[serde(default = "default_claim_interval_secs")]
    pub claim_interval_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    /// When the key file is gone but accounts exist, clear their credentials
    /// and let them enroll again instead of refusing to start.
    #[serde(default)]
    pub reenroll_on_key_loss: bool,

    /// Allow the monitoring sweep to open the interactive authorization flow.
    #[serde(default)]
    pub background_reauth: bool,
}

fn default_db_file() -> PathBuf {
    PathBuf::from("grass_accounts.db")
}
fn default_key_file() -> PathBuf {
    PathBuf::from("encryption_key.bin")
}
fn default_log_file() -> PathBuf {
    PathBuf::from("grass_bot.log")
}
fn default_backup_dir() -> PathBuf {
    PathBuf::from("grass_backups")
}
fn default_check_interval_secs() -> u64 {
    3600
}
fn default_tick_secs() -> u64 {
    60
}
fn default_poll_timeout_secs() -> u64 {
    60
}
fn default_initial_backoff_secs() -> u64 {
    60
}
fn default_max_backoff_secs() -> u64 {
    3600
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_backup_interval_secs() -> u64 {
    3600
}
fn default_backup_keep() -> usize {
    24
}
fn default_auth_url() -> String {
    "https://accounts.google.com/o/oauth2/v2/auth".to_string()
}
fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}
fn default_scopes() -> Vec<String> {
    vec!["https://www.googleapis.com/auth/userinfo.email".to_string()]
}
fn default_ws_url() -> String {
    "wss://api.getgrass.io/websocket".to_string()
}
fn default_balance_url() -> String {
    "https://api.getgrass.io/balance".to_string()
}
fn default_claim_interval_secs() -> u64 {
    3600
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db_file: default_db_file(),
            key_file: default_key_file(),
            log_file: default_log_file(),
            backup_dir: default_backup_dir(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            tick_secs: default_tick_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            multiplier: default_multiplier(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_backup_interval_secs(),
            keep: default_backup_keep(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            scopes: default_scopes(),
            client_id: None,
            client_secret: None,
        }
    }
}

impl Default for FarmingConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            balance_url: default_balance_url(),
            claim_interval_secs: default_claim_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs.max(1))
    }
}

impl FarmingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl IdentityConfig {
    pub fn client_id(&self) -> Option<String> {
        self.client_id
            .clone()
            .or_else(|| std::env::var("GRASSBOT_CLIENT_ID").ok())
            .filter(|v| !v.is_empty())
    }

    pub fn client_secret(&self) -> Option<String> {
        self.client_secret
            .clone()
            .or_else(|| std::env::var("GRASSBOT_CLIENT_SECRET").ok())
            .filter(|v| !v.is_empty())
    }
}

/// Resolved on-disk locations.
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub data_dir: PathBuf,
    pub db_file: PathBuf,
    pub key_file: PathBuf,
    pub log_file: PathBuf,
    pub backup_dir: PathBuf,
}

impl BotConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE);
        if !config_path.exists() {
            info!("No {} found, using defaults.", CONFIG_FILE);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: BotConfig = toml::from_str(content)?;
        if config.monitor.check_interval_secs == 0 {
            anyhow::bail!("monitor.check_interval_secs must be greater than zero");
        }
        if config.restart.multiplier < 1.0 {
            anyhow::bail!("restart.multiplier must be at least 1.0");
        }
        let durations = [
            ("monitor.check_interval_secs", config.monitor.check_interval_secs),
            ("monitor.tick_secs", config.monitor.tick_secs),
            ("monitor.poll_timeout_secs", config.monitor.poll_timeout_secs),
            ("restart.initial_backoff_secs", config.restart.initial_backoff_secs),
            ("restart.max_backoff_secs", config.restart.max_backoff_secs),
            ("backup.interval_secs", config.backup.interval_secs),
            ("farming.claim_interval_secs", config.farming.claim_interval_secs),
            ("farming.connect_timeout_secs", config.farming.connect_timeout_secs),
            ("farming.request_timeout_secs", config.farming.request_timeout_secs),
        ];
        for (name, secs) in durations {
            if secs > MAX_DURATION_SECS {
                anyhow::bail!("{} must be at most {} seconds", name, MAX_DURATION_SECS);
            }
        }
        Ok(config)
    }

    pub fn resolve_paths(&self, data_dir: &Path) -> ResolvedPaths {
        let resolve = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                data_dir.join(p)
            }
        };
        ResolvedPaths {
            data_dir: data_dir.to_path_buf(),
            db_file: resolve(&self.paths.db_file),
            key_file: resolve(&self.paths.key_file),
            log_file: resolve(&self.paths.log_file),
            backup_dir: resolve(&self.paths.backup_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = BotConfig::parse("").unwrap();
        assert!(config.accounts.is_empty());
        assert_eq!(config.monitor.check_interval_secs, 3600);
        assert_eq!(config.monitor.tick_secs, 60);
        assert_eq!(config.restart.max_attempts, None);
        assert_eq!(config.backup.keep, 24);
        assert!(!config.security.reenroll_on_key_loss);
        assert_eq!(config.paths.db_file, PathBuf::from("grass_accounts.db"));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = BotConfig::parse(
            r#"
accounts = ["user1@example.com", "user2@example.com"]

[monitor]
check_interval_secs = 900

[restart]
max_attempts = 5
"#,
        )
        .unwrap();
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.monitor.check_interval(), Duration::from_secs(900));
        assert_eq!(config.monitor.tick_secs, 60);
        assert_eq!(config.restart.max_attempts, Some(5));
        assert_eq!(config.restart.initial_backoff_secs, 60);
    }

    #[test]
    fn zero_check_interval_is_rejected() {
        assert!(BotConfig::parse("[monitor]\ncheck_interval_secs = 0").is_err());
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        let err = BotConfig::parse("[monitor]\ncheck_interval_secs = 9223372036854775807")
            .unwrap_err();
        assert!(err.to_string().contains("monitor.check_interval_secs"));
        assert!(BotConfig::parse("[backup]\ninterval_secs = 400000000").is_err());
        assert!(BotConfig::parse(&format!(
            "[monitor]\ncheck_interval_secs = {}",
            MAX_DURATION_SECS
        ))
        .is_ok());
    }

    #[test]
    fn timeouts_default_to_bounded_values() {
        let config = BotConfig::parse("").unwrap();
        assert_eq!(config.monitor.poll_timeout(), Duration::from_secs(60));
        assert_eq!(config.farming.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.farming.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn relative_paths_resolve_under_data_dir() {
        let mut config = BotConfig::default();
        config.paths.key_file = PathBuf::from("/secure/key.bin");
        let resolved = config.resolve_paths(Path::new("/data"));
        assert_eq!(resolved.db_file, PathBuf::from("/data/grass_accounts.db"));
        assert_eq!(resolved.key_file, PathBuf::from("/secure/key.bin"));
        assert_eq!(resolved.backup_dir, PathBuf::from("/data/grass_backups"));
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = BotConfig::load(tmp.path()).await.unwrap();
        assert_eq!(config.farming.claim_interval_secs, 3600);
    }
}
