//! Persisted routing configuration and the keys store
//!
//! The keys file maps client api keys to upstream accounts (single or
//! pooled) and carries the resilience settings. It is the single source of
//! truth for credentials: the login tooling appends accounts, the token
//! refresher writes renewed OAuth fields, and the registry re-reads it on
//! change.
//!
//! All writes use atomic temp-file + rename with 0600 permissions since the
//! file holds api keys and refresh tokens.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rand::RngExt;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default upstream base address.
pub const DEFAULT_BASE_URL: &str = "https://apis.iflow.cn/v1";

/// One upstream account record as persisted.
///
/// `api_key` is the request credential. For OAuth accounts it is minted
/// from the OAuth session and replaced on every refresh; the `oauth_*`
/// fields hold the renewal material. Timestamps are unix millis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountRecord {
    pub api_key: String,
    pub base_url: String,
    /// 0 means unlimited
    pub max_concurrency: usize,
    pub enabled: bool,
    pub label: Option<String>,
    /// "api-key" or "oauth-iflow"
    pub auth_type: Option<String>,
    pub oauth_access_token: Option<String>,
    pub oauth_refresh_token: Option<String>,
    pub oauth_expires_at: Option<u64>,
    pub last_refresh_at: Option<u64>,
    pub refresh_failures: u32,
    pub last_refresh_error: Option<String>,
}

impl Default for AccountRecord {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_concurrency: 0,
            enabled: true,
            label: None,
            auth_type: None,
            oauth_access_token: None,
            oauth_refresh_token: None,
            oauth_expires_at: None,
            last_refresh_at: None,
            refresh_failures: 0,
            last_refresh_error: None,
        }
    }
}

impl AccountRecord {
    /// Whether this account renews its credential via OAuth.
    pub fn is_oauth(&self) -> bool {
        self.oauth_refresh_token.is_some()
    }
}

/// Pool selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastBusy,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::LeastBusy
    }
}

/// Binding from one client api key to upstream account(s).
///
/// Exactly one of `account` (single) or `accounts` (pool) must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteRecord {
    pub account: Option<String>,
    pub accounts: Option<Vec<String>>,
    pub strategy: Strategy,
}

impl RouteRecord {
    fn validate(&self) -> Result<()> {
        match (&self.account, &self.accounts) {
            (Some(_), Some(_)) => Err(Error::Config(
                "route must specify either 'account' or 'accounts', not both".into(),
            )),
            (None, None) => Err(Error::Config(
                "route must specify 'account' or 'accounts'".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Referenced account ids, in binding order.
    pub fn account_ids(&self) -> Vec<&str> {
        match (&self.account, &self.accounts) {
            (Some(id), _) => vec![id.as_str()],
            (None, Some(ids)) => ids.iter().map(|s| s.as_str()).collect(),
            (None, None) => Vec::new(),
        }
    }
}

/// Client authentication policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub required: bool,
}

/// Circuit-breaker and retry settings for multi-account usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub enabled: bool,
    /// Open the breaker after this many consecutive failures (>= 1)
    pub failure_threshold: u32,
    /// How long an opened account stays excluded
    pub cool_down_seconds: u64,
    /// Extra same-account attempts per candidate (0 disables local retry)
    pub retry_attempts: u32,
    /// Fixed delay between local retries
    pub retry_backoff_ms: u64,
    /// Status codes treated as retryable
    pub retry_status_codes: Vec<u16>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
            cool_down_seconds: 30,
            retry_attempts: 1,
            retry_backoff_ms: 200,
            retry_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

/// Root of the persisted keys file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub auth: AuthConfig,
    pub resilience: ResilienceConfig,
    pub accounts: BTreeMap<String, AccountRecord>,
    pub keys: BTreeMap<String, RouteRecord>,
    pub default: Option<RouteRecord>,
    /// Requested model name -> upstream model name. Requests for models not
    /// listed here pass through unchanged.
    pub models: BTreeMap<String, String>,
}

impl RoutingConfig {
    /// Validate route shapes, account references, and resilience bounds.
    pub fn validate(&self) -> Result<()> {
        if self.resilience.failure_threshold == 0 {
            return Err(Error::Config("failure_threshold must be >= 1".into()));
        }

        for (key, route) in &self.keys {
            route.validate().map_err(|e| {
                Error::Config(format!("route for key {}: {e}", common::mask_key(key)))
            })?;
        }
        if let Some(default) = &self.default {
            default.validate()?;
        }

        let mut missing: Vec<&str> = Vec::new();
        let routes = self.keys.values().chain(self.default.iter());
        for route in routes {
            for id in route.account_ids() {
                if !self.accounts.contains_key(id) && !missing.contains(&id) {
                    missing.push(id);
                }
            }
        }
        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(Error::Config(format!(
                "routes reference missing accounts: {missing:?}"
            )));
        }

        for (id, account) in &self.accounts {
            if account.api_key.is_empty() && !account.is_oauth() {
                return Err(Error::Config(format!(
                    "account {id} has neither api_key nor oauth_refresh_token"
                )));
            }
        }

        Ok(())
    }
}

/// Keys-file manager.
///
/// The sole writer of persisted OAuth fields. A tokio Mutex serializes
/// concurrent saves from the refresher and administrative updates.
pub struct KeysStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl KeysStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and validate the routing config.
    ///
    /// A missing file is a cold start: returns the empty config and creates
    /// the file so later saves and mtime checks have a target.
    pub async fn load(&self) -> Result<RoutingConfig> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "keys file not found, starting with empty config");
            let config = RoutingConfig::default();
            self.save(&config).await?;
            return Ok(config);
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Io(format!("reading keys file: {e}")))?;
        let config: RoutingConfig = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("parsing keys file: {e}")))?;
        config.validate()?;
        info!(
            path = %self.path.display(),
            accounts = config.accounts.len(),
            keys = config.keys.len(),
            "loaded routing config"
        );
        Ok(config)
    }

    /// Persist the config atomically (temp file + rename, 0600).
    pub async fn save(&self, config: &RoutingConfig) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let json = serde_json::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("serializing keys file: {e}")))?;

        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::Io("keys path has no parent directory".into()))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Io(format!("creating keys directory: {e}")))?;

        let tmp_path = dir.join(format!(".keys.tmp.{}", std::process::id()));
        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .map_err(|e| Error::Io(format!("writing temp keys file: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp_path, perms)
                .await
                .map_err(|e| Error::Io(format!("setting keys file permissions: {e}")))?;
        }

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| Error::Io(format!("renaming temp keys file: {e}")))?;

        debug!(path = %self.path.display(), "persisted routing config");
        Ok(())
    }

    /// Modification time of the keys file, if it exists.
    pub async fn mtime(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
    }
}

/// Generate a client api key for a new binding (`sk-iflow-...`).
///
/// Called by the account-enrollment tooling when it appends a key entry to
/// the keys file; the gateway never mints keys at runtime.
pub fn generate_client_key() -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("sk-iflow-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(api_key: &str) -> AccountRecord {
        AccountRecord {
            api_key: api_key.into(),
            ..AccountRecord::default()
        }
    }

    fn pool_route(ids: &[&str]) -> RouteRecord {
        RouteRecord {
            accounts: Some(ids.iter().map(|s| s.to_string()).collect()),
            ..RouteRecord::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let resilience = ResilienceConfig::default();
        assert!(resilience.enabled);
        assert_eq!(resilience.failure_threshold, 3);
        assert_eq!(resilience.cool_down_seconds, 30);
        assert_eq!(resilience.retry_attempts, 1);
        assert_eq!(resilience.retry_backoff_ms, 200);
        assert_eq!(resilience.retry_status_codes, vec![429, 500, 502, 503, 504]);

        let record = AccountRecord::default();
        assert_eq!(record.base_url, DEFAULT_BASE_URL);
        assert_eq!(record.max_concurrency, 0);
        assert!(record.enabled);

        assert_eq!(RouteRecord::default().strategy, Strategy::LeastBusy);
    }

    #[test]
    fn parses_full_keys_file() {
        let json = r#"{
            "auth": {"enabled": true, "required": true},
            "resilience": {"failure_threshold": 5, "retry_status_codes": [429, 503]},
            "accounts": {
                "acc1": {"api_key": "sk-a", "max_concurrency": 4, "label": "primary"},
                "acc2": {
                    "api_key": "sk-b",
                    "auth_type": "oauth-iflow",
                    "oauth_refresh_token": "rt_b",
                    "oauth_expires_at": 1700000000000
                }
            },
            "keys": {
                "sk-iflow-client": {"accounts": ["acc1", "acc2"], "strategy": "round_robin"}
            },
            "default": {"account": "acc1"},
            "models": {"deepseek-chat": "deepseek-v3.2"}
        }"#;
        let config: RoutingConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert!(config.auth.required);
        assert_eq!(config.resilience.failure_threshold, 5);
        // Unspecified resilience fields fall back to defaults
        assert_eq!(config.resilience.retry_attempts, 1);
        assert_eq!(config.accounts.len(), 2);
        assert!(config.accounts["acc2"].is_oauth());
        assert_eq!(
            config.keys["sk-iflow-client"].strategy,
            Strategy::RoundRobin
        );
        assert_eq!(config.default.as_ref().unwrap().account_ids(), vec!["acc1"]);
        assert_eq!(config.models["deepseek-chat"], "deepseek-v3.2");
    }

    #[test]
    fn route_with_both_account_and_accounts_rejected() {
        let mut config = RoutingConfig::default();
        config.accounts.insert("acc1".into(), account("sk-a"));
        config.keys.insert(
            "sk-client".into(),
            RouteRecord {
                account: Some("acc1".into()),
                accounts: Some(vec!["acc1".into()]),
                ..RouteRecord::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn route_with_neither_account_nor_accounts_rejected() {
        let mut config = RoutingConfig::default();
        config
            .keys
            .insert("sk-client".into(), RouteRecord::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn route_referencing_missing_account_rejected() {
        let mut config = RoutingConfig::default();
        config.accounts.insert("acc1".into(), account("sk-a"));
        config
            .keys
            .insert("sk-client".into(), pool_route(&["acc1", "ghost"]));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"), "got: {err}");
    }

    #[test]
    fn zero_failure_threshold_rejected() {
        let mut config = RoutingConfig::default();
        config.resilience.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn account_without_any_credential_rejected() {
        let mut config = RoutingConfig::default();
        config
            .accounts
            .insert("acc1".into(), AccountRecord::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn oauth_account_without_api_key_is_valid() {
        // Freshly added OAuth accounts get their api key on first refresh
        let mut config = RoutingConfig::default();
        config.accounts.insert(
            "acc1".into(),
            AccountRecord {
                oauth_refresh_token: Some("rt".into()),
                ..AccountRecord::default()
            },
        );
        config.validate().unwrap();
    }

    #[tokio::test]
    async fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeysStore::new(dir.path().join("keys.json"));

        let mut config = RoutingConfig::default();
        config.accounts.insert("acc1".into(), account("sk-a"));
        config
            .keys
            .insert("sk-client".into(), pool_route(&["acc1"]));
        store.save(&config).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.accounts["acc1"].api_key, "sk-a");
        assert_eq!(loaded.keys["sk-client"].account_ids(), vec!["acc1"]);
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let store = KeysStore::new(path.clone());

        assert!(!path.exists());
        let config = store.load().await.unwrap();
        assert!(config.accounts.is_empty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn corrupt_file_reports_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = KeysStore::new(path).load().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let store = KeysStore::new(path.clone());
        store.save(&RoutingConfig::default()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "keys file must be 0600, got {mode:o}");
    }

    #[test]
    fn generated_client_keys_are_prefixed_and_unique() {
        let a = generate_client_key();
        let b = generate_client_key();
        assert!(a.starts_with("sk-iflow-"));
        assert_eq!(a.len(), "sk-iflow-".len() + 24);
        assert_ne!(a, b);
    }
}
