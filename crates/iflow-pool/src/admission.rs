//! In-flight admission control
//!
//! Each account carries an atomic in-flight counter with an optional cap.
//! Admission returns an RAII permit; the count drops when the permit does,
//! which covers early returns and cancelled requests alike.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-flight counter with an optional concurrency cap (0 = unlimited).
pub struct Admission {
    in_flight: AtomicUsize,
    cap: usize,
}

impl Admission {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            in_flight: AtomicUsize::new(0),
            cap,
        })
    }

    /// Claim a slot, or return `None` when the account is at its cap.
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        if self.cap == 0 {
            self.in_flight.fetch_add(1, Ordering::Relaxed);
            return Some(AdmissionPermit {
                admission: Arc::clone(self),
            });
        }
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.cap).then_some(current + 1)
            })
            .ok()
            .map(|_| AdmissionPermit {
                admission: Arc::clone(self),
            })
    }

    /// Whether a claim would succeed right now. Advisory only; admission
    /// can still fail under concurrent claims.
    pub fn has_capacity(&self) -> bool {
        self.cap == 0 || self.in_flight.load(Ordering::Acquire) < self.cap
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

/// Live request slot. Releases the in-flight count on drop.
pub struct AdmissionPermit {
    admission: Arc<Admission>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.admission.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capped_admission_refuses_past_cap() {
        let admission = Admission::new(2);
        let a = admission.try_admit().expect("first");
        let _b = admission.try_admit().expect("second");
        assert!(admission.try_admit().is_none());
        assert!(!admission.has_capacity());

        drop(a);
        assert!(admission.has_capacity());
        assert!(admission.try_admit().is_some());
    }

    #[test]
    fn unlimited_admission_never_refuses() {
        let admission = Admission::new(0);
        let permits: Vec<_> = (0..100)
            .map(|_| admission.try_admit().expect("admit"))
            .collect();
        assert_eq!(admission.in_flight(), 100);
        assert!(admission.has_capacity());
        drop(permits);
        assert_eq!(admission.in_flight(), 0);
    }

    #[test]
    fn permit_drop_releases_exactly_once() {
        let admission = Admission::new(1);
        {
            let _permit = admission.try_admit().expect("admit");
            assert_eq!(admission.in_flight(), 1);
        }
        assert_eq!(admission.in_flight(), 0);
    }
}
