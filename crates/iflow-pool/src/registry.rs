//! Account registry and route resolution
//!
//! The registry owns the live view of the keys file: runtime [`Account`]
//! handles (credential, in-flight counter, breaker) and the client-key
//! routing table, published as an immutable [`Snapshot`] behind an
//! `RwLock<Arc<_>>`. Readers grab the current snapshot and never block
//! writers; a reload builds a fresh snapshot and swaps it in, which also
//! resets runtime counters and breaker state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use common::{Secret, mask_key};
use tracing::{debug, info, warn};
use upstream::{AccountAuth, RefreshedCredential};

use crate::admission::Admission;
use crate::breaker::{Breaker, BreakerStatus};
use crate::config::{
    AccountRecord, AuthConfig, KeysStore, ResilienceConfig, RouteRecord, RoutingConfig, Strategy,
};
use crate::error::{Error, PoolCounts, Result};

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Request credential plus the OAuth material that renews it.
#[derive(Debug, Clone)]
pub struct Credential {
    pub api_key: String,
    pub oauth: Option<OauthState>,
}

#[derive(Debug, Clone)]
pub struct OauthState {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix millis
    pub expires_at: u64,
}

impl Credential {
    /// Whether the credential expires within `margin_ms` (always false for
    /// plain api-key accounts).
    pub fn expires_within(&self, margin_ms: u64) -> bool {
        match &self.oauth {
            Some(oauth) => oauth.expires_at <= now_millis().saturating_add(margin_ms),
            None => false,
        }
    }
}

/// Runtime handle for one upstream account.
pub struct Account {
    pub id: String,
    pub base_url: String,
    pub label: Option<String>,
    pub enabled: bool,
    pub admission: Arc<Admission>,
    pub breaker: Breaker,
    credential: RwLock<Credential>,
    /// Serializes token refreshes for this account
    pub refresh_lock: tokio::sync::Mutex<()>,
    last_error: Mutex<Option<String>>,
}

impl Account {
    fn from_record(id: &str, record: &AccountRecord, resilience: &ResilienceConfig) -> Arc<Self> {
        let oauth = record.oauth_refresh_token.as_ref().map(|rt| OauthState {
            access_token: record.oauth_access_token.clone().unwrap_or_default(),
            refresh_token: rt.clone(),
            expires_at: record.oauth_expires_at.unwrap_or(0),
        });
        Arc::new(Self {
            id: id.to_string(),
            base_url: record.base_url.clone(),
            label: record.label.clone(),
            enabled: record.enabled,
            admission: Admission::new(record.max_concurrency),
            breaker: Breaker::new(id, resilience.into()),
            credential: RwLock::new(Credential {
                api_key: record.api_key.clone(),
                oauth,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
            last_error: Mutex::new(record.last_refresh_error.clone()),
        })
    }

    pub fn credential(&self) -> Credential {
        self.credential.read().expect("credential lock poisoned").clone()
    }

    /// Swap in a renewed credential.
    pub fn install_credential(&self, refreshed: &RefreshedCredential) {
        let mut guard = self.credential.write().expect("credential lock poisoned");
        let refresh_token = refreshed
            .refresh_token
            .clone()
            .or_else(|| guard.oauth.as_ref().map(|o| o.refresh_token.clone()))
            .unwrap_or_default();
        guard.api_key = refreshed.api_key.clone();
        guard.oauth = Some(OauthState {
            access_token: refreshed.access_token.clone(),
            refresh_token,
            expires_at: refreshed.expires_at_ms,
        });
    }

    pub fn is_oauth(&self) -> bool {
        self.credential
            .read()
            .expect("credential lock poisoned")
            .oauth
            .is_some()
    }

    /// Current request auth for the upstream client.
    pub fn auth(&self) -> AccountAuth {
        let guard = self.credential.read().expect("credential lock poisoned");
        AccountAuth {
            api_key: Secret::new(guard.api_key.clone()),
            base_url: self.base_url.clone(),
        }
    }

    pub fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().expect("last_error lock poisoned") = error;
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .expect("last_error lock poisoned")
            .clone()
    }
}

/// Resolved binding from one client key to its account pool.
pub struct Route {
    pub accounts: Vec<Arc<Account>>,
    pub strategy: Strategy,
    /// Round-robin position, advanced per attempted account
    pub cursor: AtomicUsize,
}

impl Route {
    fn build(record: &RouteRecord, accounts: &BTreeMap<String, Arc<Account>>) -> Arc<Self> {
        let members = record
            .account_ids()
            .iter()
            .filter_map(|id| accounts.get(*id).cloned())
            .collect();
        Arc::new(Self {
            accounts: members,
            strategy: record.strategy,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Pool occupancy breakdown for exhaustion reporting.
    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts {
            total: self.accounts.len(),
            ..PoolCounts::default()
        };
        for account in &self.accounts {
            if !account.enabled {
                counts.disabled += 1;
            } else if !account.breaker.is_selectable() {
                counts.cooling_down += 1;
            } else if account.admission.has_capacity() {
                counts.available += 1;
            }
        }
        counts
    }
}

/// Immutable view of all accounts and routes.
pub struct Snapshot {
    pub accounts: BTreeMap<String, Arc<Account>>,
    routes: BTreeMap<String, Arc<Route>>,
    default_route: Option<Arc<Route>>,
    pub auth: AuthConfig,
    pub resilience: ResilienceConfig,
    pub models: BTreeMap<String, String>,
}

impl Snapshot {
    pub(crate) fn build(config: &RoutingConfig) -> Arc<Self> {
        let accounts: BTreeMap<String, Arc<Account>> = config
            .accounts
            .iter()
            .map(|(id, record)| {
                (
                    id.clone(),
                    Account::from_record(id, record, &config.resilience),
                )
            })
            .collect();
        let routes = config
            .keys
            .iter()
            .map(|(key, record)| (key.clone(), Route::build(record, &accounts)))
            .collect();
        let default_route = config
            .default
            .as_ref()
            .map(|record| Route::build(record, &accounts));
        Arc::new(Self {
            accounts,
            routes,
            default_route,
            auth: config.auth,
            resilience: config.resilience.clone(),
            models: config.models.clone(),
        })
    }

    /// Upstream model for a requested model name, if an alias is bound.
    pub fn resolve_model(&self, requested: &str) -> Option<&str> {
        self.models.get(requested).map(String::as_str)
    }

    /// Map a client bearer token to its route.
    pub fn resolve(&self, bearer: Option<&str>) -> Result<Arc<Route>> {
        if let Some(token) = bearer
            && let Some(route) = self.routes.get(token)
        {
            return Ok(Arc::clone(route));
        }
        if self.auth.enabled && self.auth.required {
            return Err(Error::Unauthorized);
        }
        self.default_route
            .as_ref()
            .map(Arc::clone)
            .ok_or(Error::NoRoute)
    }
}

/// Health view of one account, for the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountHealth {
    pub id: String,
    pub label: Option<String>,
    pub enabled: bool,
    pub api_key: String,
    pub oauth: bool,
    pub in_flight: usize,
    pub max_concurrency: usize,
    pub breaker: BreakerStatus,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cool_down_remaining_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_expires_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Owner of the keys store and the published snapshot.
pub struct Registry {
    store: KeysStore,
    snapshot: RwLock<Arc<Snapshot>>,
    config: tokio::sync::Mutex<RoutingConfig>,
    stored_mtime: Mutex<Option<SystemTime>>,
}

impl Registry {
    pub async fn load(path: PathBuf) -> Result<Self> {
        let store = KeysStore::new(path);
        let config = store.load().await?;
        let snapshot = Snapshot::build(&config);
        let mtime = store.mtime().await;
        Ok(Self {
            store,
            snapshot: RwLock::new(snapshot),
            config: tokio::sync::Mutex::new(config),
            stored_mtime: Mutex::new(mtime),
        })
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read().expect("snapshot lock poisoned"))
    }

    /// Re-read the keys file if its mtime changed since the last load.
    ///
    /// A file that fails to parse or validate keeps the previous snapshot in
    /// place; the new mtime is still recorded so a broken file is not
    /// re-parsed on every request.
    pub async fn maybe_reload(&self) {
        let current = self.store.mtime().await;
        {
            let stored = self.stored_mtime.lock().expect("mtime lock poisoned");
            if current == *stored {
                return;
            }
        }

        let mut config_guard = self.config.lock().await;
        // Re-check under the config lock; another task may have reloaded
        let current = self.store.mtime().await;
        {
            let mut stored = self.stored_mtime.lock().expect("mtime lock poisoned");
            if current == *stored {
                return;
            }
            *stored = current;
        }

        match self.store.load().await {
            Ok(config) => {
                let snapshot = Snapshot::build(&config);
                *config_guard = config;
                *self.snapshot.write().expect("snapshot lock poisoned") = snapshot;
                info!(path = %self.store.path().display(), "keys file changed, routing reloaded");
            }
            Err(e) => {
                warn!(
                    path = %self.store.path().display(),
                    error = %e,
                    "keys file changed but failed to load, keeping previous routing"
                );
            }
        }
    }

    /// Record a successful token refresh: update the live account and
    /// persist the renewed credential.
    pub async fn record_refresh_success(
        &self,
        account: &Account,
        refreshed: &RefreshedCredential,
    ) -> Result<()> {
        account.install_credential(refreshed);
        account.set_last_error(None);

        let mut config = self.config.lock().await;
        let Some(record) = config.accounts.get_mut(&account.id) else {
            // Account removed by a concurrent edit; nothing to persist
            debug!(account_id = %account.id, "refreshed account no longer in keys file");
            return Ok(());
        };
        record.api_key = refreshed.api_key.clone();
        record.oauth_access_token = Some(refreshed.access_token.clone());
        if let Some(rt) = &refreshed.refresh_token {
            record.oauth_refresh_token = Some(rt.clone());
        }
        record.oauth_expires_at = Some(refreshed.expires_at_ms);
        record.last_refresh_at = Some(now_millis());
        record.refresh_failures = 0;
        record.last_refresh_error = None;

        self.save_locked(&config).await
    }

    /// Record a failed token refresh attempt.
    pub async fn record_refresh_failure(&self, account: &Account, error: &str) -> Result<()> {
        account.set_last_error(Some(error.to_string()));

        let mut config = self.config.lock().await;
        let Some(record) = config.accounts.get_mut(&account.id) else {
            return Ok(());
        };
        record.refresh_failures += 1;
        record.last_refresh_error = Some(error.to_string());
        self.save_locked(&config).await
    }

    /// Save while holding the config lock, then sync the stored mtime so
    /// our own write does not look like an external edit.
    async fn save_locked(&self, config: &RoutingConfig) -> Result<()> {
        self.store.save(config).await?;
        let mtime = self.store.mtime().await;
        *self.stored_mtime.lock().expect("mtime lock poisoned") = mtime;
        Ok(())
    }

    /// Per-account health for introspection.
    pub fn introspect(&self) -> Vec<AccountHealth> {
        let snapshot = self.snapshot();
        snapshot
            .accounts
            .values()
            .map(|account| {
                let credential = account.credential();
                AccountHealth {
                    id: account.id.clone(),
                    label: account.label.clone(),
                    enabled: account.enabled,
                    api_key: mask_key(&credential.api_key),
                    oauth: credential.oauth.is_some(),
                    in_flight: account.admission.in_flight(),
                    max_concurrency: account.admission.cap(),
                    breaker: account.breaker.status(),
                    consecutive_failures: account.breaker.consecutive_failures(),
                    cool_down_remaining_ms: account
                        .breaker
                        .open_remaining()
                        .map(|d| d.as_millis() as u64),
                    oauth_expires_at: credential.oauth.as_ref().map(|o| o.expires_at),
                    last_error: account.last_error(),
                }
            })
            .collect()
    }
}
