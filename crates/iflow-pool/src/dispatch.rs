//! Request dispatch with failover
//!
//! Ties the pieces together for one completion request: resolve the
//! client's route, rank candidate accounts, then walk them in order. Each
//! account gets a breaker pass and an admission permit before its attempt;
//! a retryable failure burns the account's local retry budget, then we move
//! to the next candidate. Non-retryable upstream responses propagate to the
//! client immediately. When every candidate is refused or fails, the pool
//! is exhausted and the caller sees the occupancy breakdown.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};
use upstream::{Upstream, UpstreamError};

use crate::balance::{note_attempt, ordered_candidates};
use crate::breaker::BreakerPass;
use crate::config::ResilienceConfig;
use crate::error::{Error, Result};
use crate::refresh::Refresher;
use crate::registry::{Account, Registry};

enum Outcome {
    Success(Value),
    /// Non-retryable upstream response; do not try other accounts
    Fatal(UpstreamError),
    /// Retry budget spent on this account
    Exhausted(UpstreamError),
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    upstream: Arc<dyn Upstream>,
    refresher: Arc<Refresher>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        upstream: Arc<dyn Upstream>,
        refresher: Arc<Refresher>,
    ) -> Self {
        Self {
            registry,
            upstream,
            refresher,
        }
    }

    /// Route and execute one completion request.
    pub async fn dispatch(&self, bearer: Option<&str>, body: &Value) -> Result<Value> {
        self.registry.maybe_reload().await;
        let snapshot = self.registry.snapshot();
        let route = snapshot.resolve(bearer)?;

        // Rewrite aliased model names before the body reaches any account
        let rewritten = body
            .get("model")
            .and_then(Value::as_str)
            .and_then(|requested| snapshot.resolve_model(requested))
            .map(|target| {
                debug!(
                    requested = %body["model"], model = %target,
                    "mapped model alias"
                );
                let mut mapped = body.clone();
                mapped["model"] = Value::String(target.to_string());
                mapped
            });
        let body = rewritten.as_ref().unwrap_or(body);

        for (position, account) in ordered_candidates(&route) {
            let Some(pass) = account.breaker.admit() else {
                continue;
            };
            let Some(_permit) = account.admission.try_admit() else {
                continue;
            };
            note_attempt(&route, position);
            debug!(account_id = %account.id, "dispatching to account");

            match self
                .attempt_account(&account, pass, body, &snapshot.resilience)
                .await
            {
                Outcome::Success(response) => {
                    counter!(
                        "pool_upstream_requests_total",
                        "account_id" => account.id.clone(),
                        "outcome" => "success"
                    )
                    .increment(1);
                    return Ok(response);
                }
                Outcome::Fatal(e) => {
                    counter!(
                        "pool_upstream_requests_total",
                        "account_id" => account.id.clone(),
                        "outcome" => "error"
                    )
                    .increment(1);
                    return Err(Error::UpstreamFatal {
                        status: e.status.unwrap_or(502),
                        message: e.message,
                    });
                }
                Outcome::Exhausted(e) => {
                    counter!(
                        "pool_upstream_requests_total",
                        "account_id" => account.id.clone(),
                        "outcome" => "failed"
                    )
                    .increment(1);
                    warn!(
                        account_id = %account.id,
                        error = %e,
                        "account failed, trying next candidate"
                    );
                }
            }
        }

        counter!("pool_exhausted_total").increment(1);
        Err(Error::PoolExhausted(route.counts()))
    }

    /// Run the attempt loop for one account and settle its breaker pass.
    async fn attempt_account(
        &self,
        account: &Account,
        pass: BreakerPass<'_>,
        body: &Value,
        resilience: &ResilienceConfig,
    ) -> Outcome {
        // Renew a credential already past expiry before spending an attempt
        if account.is_oauth() && account.credential().expires_within(0) {
            if let Err(e) = self.refresher.refresh_account(account).await {
                debug!(account_id = %account.id, error = %e, "pre-request refresh failed");
            }
        }

        let retry_budget = if resilience.enabled {
            resilience.retry_attempts
        } else {
            0
        };
        let backoff = Duration::from_millis(resilience.retry_backoff_ms);
        let mut retries = 0u32;
        let mut refreshed_midway = false;

        loop {
            match self.upstream.chat_completions(&account.auth(), body).await {
                Ok(response) => {
                    pass.success();
                    return Outcome::Success(response);
                }
                Err(e) if e.is_token_expired() && account.is_oauth() && !refreshed_midway => {
                    refreshed_midway = true;
                    debug!(account_id = %account.id, "upstream rejected token, refreshing");
                    if self.refresher.refresh_account(account).await.is_ok() {
                        // Renewal does not consume the retry budget
                        continue;
                    }
                    pass.failure();
                    return Outcome::Exhausted(e);
                }
                Err(e) if e.is_retryable(&resilience.retry_status_codes) => {
                    if retries < retry_budget {
                        retries += 1;
                        debug!(
                            account_id = %account.id,
                            retry = retries,
                            error = %e,
                            "retrying after backoff"
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    pass.failure();
                    return Outcome::Exhausted(e);
                }
                Err(e) => {
                    pass.failure();
                    return Outcome::Fatal(e);
                }
            }
        }
    }
}
