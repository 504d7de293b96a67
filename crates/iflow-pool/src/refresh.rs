//! OAuth token renewal
//!
//! Credentials are renewed two ways: a background sweep refreshes anything
//! expiring within the configured margin, and the dispatcher refreshes on
//! demand when a request hits an expired token. Both paths funnel through
//! [`Refresher::refresh_account`], which serializes per account and skips
//! the provider call when another task already renewed the credential while
//! we waited for the lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use upstream::OAuthProvider;

use crate::error::{Error, Result};
use crate::registry::{Account, Registry};

pub struct Refresher {
    registry: Arc<Registry>,
    provider: Arc<dyn OAuthProvider>,
    margin_ms: u64,
}

impl Refresher {
    pub fn new(registry: Arc<Registry>, provider: Arc<dyn OAuthProvider>, margin: Duration) -> Self {
        Self {
            registry,
            provider,
            margin_ms: margin.as_millis() as u64,
        }
    }

    /// Renew the account's credential now.
    ///
    /// Single-flight per account: the credential observed before taking the
    /// per-account lock is compared after; if it changed, a concurrent
    /// refresh already did the work.
    pub async fn refresh_account(&self, account: &Account) -> Result<()> {
        let before = account.credential();
        let Some(before_oauth) = before.oauth else {
            return Err(Error::RefreshFailed(format!(
                "account {} has no refresh token",
                account.id
            )));
        };

        let _guard = account.refresh_lock.lock().await;

        let current = account.credential();
        if let Some(current_oauth) = &current.oauth
            && (current.api_key != before.api_key
                || current_oauth.access_token != before_oauth.access_token
                || current_oauth.expires_at != before_oauth.expires_at)
        {
            debug!(account_id = %account.id, "credential already renewed, reusing");
            return Ok(());
        }

        let refresh_token = current
            .oauth
            .map(|o| o.refresh_token)
            .unwrap_or(before_oauth.refresh_token);

        match self.provider.refresh(&refresh_token).await {
            Ok(refreshed) => {
                self.registry
                    .record_refresh_success(account, &refreshed)
                    .await?;
                metrics::counter!("pool_token_refresh_total", "outcome" => "success").increment(1);
                info!(account_id = %account.id, "token refreshed");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                metrics::counter!("pool_token_refresh_total", "outcome" => "failure").increment(1);
                warn!(account_id = %account.id, error = %message, "token refresh failed");
                self.registry
                    .record_refresh_failure(account, &message)
                    .await?;
                Err(Error::RefreshFailed(message))
            }
        }
    }

    /// Refresh only if the credential expires within the margin.
    ///
    /// Returns whether a refresh was performed.
    pub async fn refresh_if_needed(&self, account: &Account) -> Result<bool> {
        if !account.credential().expires_within(self.margin_ms) {
            return Ok(false);
        }
        self.refresh_account(account).await?;
        Ok(true)
    }

    /// One pass over all OAuth accounts, renewing the ones close to expiry.
    /// Individual failures are logged and do not stop the sweep.
    pub async fn sweep(&self) {
        let snapshot = self.registry.snapshot();
        for account in snapshot.accounts.values() {
            if !account.enabled || !account.is_oauth() {
                continue;
            }
            if let Err(e) = self.refresh_if_needed(account).await {
                warn!(account_id = %account.id, error = %e, "background refresh failed");
            }
        }
    }

    /// Periodic sweep task. The immediate first tick is skipped; startup
    /// already loaded whatever the keys file had.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}
