//! Per-account circuit breaker
//!
//! Closed counts consecutive failures; at the threshold the breaker opens
//! for the cool-down window. The first admission after the window becomes a
//! half-open probe: its success closes the breaker, its failure re-opens a
//! fresh window. Only one probe runs at a time.
//!
//! Admission hands out a [`BreakerPass`] that must be resolved with
//! `success` or `failure`. A pass dropped without a verdict releases a
//! half-open probe claim without recording an outcome, so a cancelled
//! request never charges the account.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::ResilienceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed {
        consecutive_failures: u32,
    },
    // Open and half-open keep the running failure count so introspection
    // reports the real streak, not the threshold
    Open {
        until: Instant,
        consecutive_failures: u32,
    },
    HalfOpen {
        probing: bool,
        consecutive_failures: u32,
    },
}

/// Breaker state as reported by health introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub cool_down: Duration,
}

impl From<&ResilienceConfig> for BreakerConfig {
    fn from(r: &ResilienceConfig) -> Self {
        Self {
            enabled: r.enabled,
            failure_threshold: r.failure_threshold,
            cool_down: Duration::from_secs(r.cool_down_seconds),
        }
    }
}

/// Circuit breaker guarding one upstream account.
pub struct Breaker {
    config: BreakerConfig,
    state: Mutex<State>,
    account_id: String,
}

impl Breaker {
    pub fn new(account_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
            account_id: account_id.into(),
        }
    }

    /// Whether a request may proceed right now, without claiming anything.
    ///
    /// Used by the balancer to pre-filter candidates. An open breaker whose
    /// window has elapsed reports selectable since admission would grant a
    /// probe.
    pub fn is_selectable(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        match *self.state.lock().expect("breaker lock poisoned") {
            State::Closed { .. } => true,
            State::Open { until, .. } => Instant::now() >= until,
            State::HalfOpen { probing, .. } => !probing,
        }
    }

    /// Try to admit a request, returning a pass on success.
    ///
    /// `None` means the account is cooling down or another probe is already
    /// in flight.
    pub fn admit(&self) -> Option<BreakerPass<'_>> {
        if !self.config.enabled {
            return Some(BreakerPass {
                breaker: self,
                probe: false,
                resolved: true,
            });
        }

        let mut state = self.state.lock().expect("breaker lock poisoned");
        match *state {
            State::Closed { .. } => Some(BreakerPass {
                breaker: self,
                probe: false,
                resolved: false,
            }),
            State::Open {
                until,
                consecutive_failures,
            } => {
                if Instant::now() < until {
                    return None;
                }
                info!(account_id = %self.account_id, "circuit half-open, probing");
                *state = State::HalfOpen {
                    probing: true,
                    consecutive_failures,
                };
                Some(BreakerPass {
                    breaker: self,
                    probe: true,
                    resolved: false,
                })
            }
            State::HalfOpen {
                probing,
                consecutive_failures,
            } => {
                if probing {
                    return None;
                }
                *state = State::HalfOpen {
                    probing: true,
                    consecutive_failures,
                };
                Some(BreakerPass {
                    breaker: self,
                    probe: true,
                    resolved: false,
                })
            }
        }
    }

    pub fn status(&self) -> BreakerStatus {
        if !self.config.enabled {
            return BreakerStatus::Closed;
        }
        match *self.state.lock().expect("breaker lock poisoned") {
            State::Closed { .. } => BreakerStatus::Closed,
            State::Open { .. } => BreakerStatus::Open,
            State::HalfOpen { .. } => BreakerStatus::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        match *self.state.lock().expect("breaker lock poisoned") {
            State::Closed {
                consecutive_failures,
            }
            | State::Open {
                consecutive_failures,
                ..
            }
            | State::HalfOpen {
                consecutive_failures,
                ..
            } => consecutive_failures,
        }
    }

    /// Remaining cool-down, if open.
    pub fn open_remaining(&self) -> Option<Duration> {
        match *self.state.lock().expect("breaker lock poisoned") {
            State::Open { until, .. } => Some(until.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }

    fn record_success(&self, probe: bool) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        if probe {
            info!(account_id = %self.account_id, "probe succeeded, circuit closed");
        }
        *state = State::Closed {
            consecutive_failures: 0,
        };
    }

    fn record_failure(&self, probe: bool) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        let failures = match *state {
            State::Closed {
                consecutive_failures,
            }
            | State::Open {
                consecutive_failures,
                ..
            }
            | State::HalfOpen {
                consecutive_failures,
                ..
            } => consecutive_failures + 1,
        };
        if probe {
            warn!(
                account_id = %self.account_id,
                failures,
                cool_down_seconds = self.config.cool_down.as_secs(),
                "probe failed, circuit re-opened"
            );
            *state = State::Open {
                until: Instant::now() + self.config.cool_down,
                consecutive_failures: failures,
            };
            return;
        }
        match *state {
            State::Closed { .. } => {
                if failures >= self.config.failure_threshold {
                    warn!(
                        account_id = %self.account_id,
                        failures,
                        cool_down_seconds = self.config.cool_down.as_secs(),
                        "failure threshold reached, circuit opened"
                    );
                    *state = State::Open {
                        until: Instant::now() + self.config.cool_down,
                        consecutive_failures: failures,
                    };
                } else {
                    *state = State::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            // A failure reported while open or half-open without a probe
            // pass re-opens the window.
            _ => {
                *state = State::Open {
                    until: Instant::now() + self.config.cool_down,
                    consecutive_failures: failures,
                };
            }
        }
    }

    fn release_probe(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        if let State::HalfOpen {
            probing: true,
            consecutive_failures,
        } = *state
        {
            *state = State::HalfOpen {
                probing: false,
                consecutive_failures,
            };
        }
    }
}

/// Admission ticket from [`Breaker::admit`].
///
/// Resolve with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping without a verdict releases the probe claim silently.
pub struct BreakerPass<'a> {
    breaker: &'a Breaker,
    probe: bool,
    resolved: bool,
}

impl BreakerPass<'_> {
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success(self.probe);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for BreakerPass<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.release_probe();
        }
    }
}
