//! Account selection for pooled routes
//!
//! Produces an ordered candidate list for the dispatcher, filtered to
//! accounts that are enabled, not cooling down, and under their concurrency
//! cap. Both strategies are heuristics over an instantaneous view; the
//! dispatcher re-checks the breaker and the cap when it actually claims an
//! account.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::config::Strategy;
use crate::registry::{Account, Route};

/// Ordered candidates for one request.
///
/// Each entry carries the account's position in the route, which
/// round-robin uses to advance the cursor only for accounts actually
/// attempted.
pub fn ordered_candidates(route: &Route) -> Vec<(usize, Arc<Account>)> {
    let mut candidates: Vec<(usize, Arc<Account>)> = route
        .accounts
        .iter()
        .enumerate()
        .filter(|(_, account)| {
            account.enabled
                && account.breaker.is_selectable()
                && account.admission.has_capacity()
        })
        .map(|(pos, account)| (pos, Arc::clone(account)))
        .collect();

    match route.strategy {
        Strategy::RoundRobin => {
            if route.accounts.is_empty() {
                return candidates;
            }
            let start = route.cursor.load(Ordering::Relaxed) % route.accounts.len();
            // Rotate so positions >= cursor come first, wrapping around
            candidates.sort_by_key(|(pos, _)| (*pos < start, *pos));
        }
        Strategy::LeastBusy => {
            candidates.sort_by(|(_, a), (_, b)| {
                utilization_cmp(a, b).then_with(|| a.id.cmp(&b.id))
            });
        }
    }
    candidates
}

/// Advance the round-robin cursor past an attempted account.
pub fn note_attempt(route: &Route, position: usize) {
    if route.strategy == Strategy::RoundRobin {
        route.cursor.store(position + 1, Ordering::Relaxed);
    }
}

/// Compare in-flight utilization (`in_flight / cap`) without division.
///
/// Unlimited accounts count as utilization 0. Equal ratios compare equal;
/// the caller breaks the tie by account id.
fn utilization_cmp(a: &Account, b: &Account) -> std::cmp::Ordering {
    let (a_num, a_den) = utilization(a);
    let (b_num, b_den) = utilization(b);
    // a_num/a_den vs b_num/b_den via cross multiplication
    let left = a_num as u128 * b_den as u128;
    let right = b_num as u128 * a_den as u128;
    left.cmp(&right)
}

fn utilization(account: &Account) -> (usize, usize) {
    let in_flight = account.admission.in_flight();
    let cap = account.admission.cap();
    if cap == 0 { (0, 1) } else { (in_flight, cap) }
}
