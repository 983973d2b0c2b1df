//! Custody transfer subsystem (§4.6): accepting custody, the retransmission
//! timer, and custody-signal handling.
//!
//! Retry factor and max-retry tunables are grounded on
//! `original_source/servlib/bundling/CustodyTimer.h`: the timer interval is
//! `expiration / custody_retry_factor`, and `custody_max_retries` bounds the
//! number of retransmissions before the bundle is given up as deleted
//! (`0` means unbounded, matching DTN2's default).

use std::collections::HashMap;
use std::time::Duration;

use dtn_core::status::ReasonCode;
use dtn_core::BundleId;

/// Default divisor applied to a bundle's remaining lifetime to compute its
/// custody retransmission timer.
pub const DEFAULT_CUSTODY_RETRY_FACTOR: u32 = 6;

/// Default maximum retransmissions before giving up (`0` = unbounded).
pub const DEFAULT_CUSTODY_MAX_RETRIES: u32 = 0;

#[derive(Clone, Copy, Debug)]
pub struct CustodyParams {
    pub retry_factor: u32,
    pub max_retries: u32,
}

impl Default for CustodyParams {
    fn default() -> Self {
        CustodyParams {
            retry_factor: DEFAULT_CUSTODY_RETRY_FACTOR,
            max_retries: DEFAULT_CUSTODY_MAX_RETRIES,
        }
    }
}

#[derive(Debug)]
struct CustodyEntry {
    lifetime_secs: u64,
    retries: u32,
}

/// Outcome of a custody retransmission timer firing.
#[derive(Debug, Eq, PartialEq)]
pub enum TimerOutcome {
    /// Retransmit and rearm the timer.
    Retransmit,
    /// The retry budget is exhausted; the bundle should be deleted with
    /// reason `NoRouteToDestination`-equivalent give-up status.
    GiveUp,
}

/// Tracks in-custody bundles and their retransmission timers. Does not own
/// the actual `tokio::time` handles — the daemon event loop is responsible
/// for scheduling wakeups at the durations this type returns.
#[derive(Default)]
pub struct CustodyTable {
    params: CustodyParams,
    entries: HashMap<BundleId, CustodyEntry>,
}

impl CustodyTable {
    pub fn new(params: CustodyParams) -> Self {
        CustodyTable { params, entries: HashMap::new() }
    }

    /// Accepts custody of `bundle_id`, returning the initial retransmission
    /// timer duration: `lifetime / retry_factor`.
    pub fn accept(&mut self, bundle_id: BundleId, lifetime_secs: u64) -> Duration {
        self.entries.insert(bundle_id, CustodyEntry { lifetime_secs, retries: 0 });
        self.timer_duration(lifetime_secs)
    }

    fn timer_duration(&self, lifetime_secs: u64) -> Duration {
        let factor = self.params.retry_factor.max(1) as u64;
        Duration::from_secs((lifetime_secs / factor).max(1))
    }

    /// The custody timer for `bundle_id` fired. Returns `None` if custody was
    /// already released (e.g. a signal arrived first).
    pub fn timer_fired(&mut self, bundle_id: BundleId) -> Option<(TimerOutcome, Option<Duration>)> {
        let entry = self.entries.get_mut(&bundle_id)?;
        entry.retries += 1;
        if self.params.max_retries != 0 && entry.retries > self.params.max_retries {
            self.entries.remove(&bundle_id);
            return Some((TimerOutcome::GiveUp, None));
        }
        let next = self.timer_duration(entry.lifetime_secs);
        Some((TimerOutcome::Retransmit, Some(next)))
    }

    /// A custody signal arrived for `bundle_id`. Releases the timer and
    /// returns the reason if the signal reported failure, or `None` if it
    /// succeeded (custody fully released, no further action).
    pub fn signal_received(&mut self, bundle_id: BundleId, succeeded: bool, reason: ReasonCode) -> Option<ReasonCode> {
        self.entries.remove(&bundle_id);
        if succeeded {
            None
        } else {
            Some(reason)
        }
    }

    pub fn is_in_custody(&self, bundle_id: BundleId) -> bool {
        self.entries.contains_key(&bundle_id)
    }

    pub fn release(&mut self, bundle_id: BundleId) {
        self.entries.remove(&bundle_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_computes_timer_from_retry_factor() {
        let mut table = CustodyTable::new(CustodyParams { retry_factor: 4, max_retries: 0 });
        let d = table.accept(1, 400);
        assert_eq!(d, Duration::from_secs(100));
    }

    #[test]
    fn unbounded_retries_never_give_up() {
        let mut table = CustodyTable::new(CustodyParams { retry_factor: 6, max_retries: 0 });
        table.accept(1, 600);
        for _ in 0..50 {
            let (outcome, next) = table.timer_fired(1).unwrap();
            assert_eq!(outcome, TimerOutcome::Retransmit);
            assert!(next.is_some());
        }
    }

    #[test]
    fn bounded_retries_eventually_give_up() {
        let mut table = CustodyTable::new(CustodyParams { retry_factor: 6, max_retries: 2 });
        table.accept(1, 600);
        assert_eq!(table.timer_fired(1).unwrap().0, TimerOutcome::Retransmit);
        assert_eq!(table.timer_fired(1).unwrap().0, TimerOutcome::Retransmit);
        assert_eq!(table.timer_fired(1).unwrap().0, TimerOutcome::GiveUp);
        assert!(!table.is_in_custody(1));
    }

    #[test]
    fn successful_signal_releases_without_reason() {
        let mut table = CustodyTable::default();
        table.accept(1, 600);
        let reason = table.signal_received(1, true, ReasonCode::NoInfo);
        assert_eq!(reason, None);
        assert!(!table.is_in_custody(1));
    }

    #[test]
    fn failed_signal_releases_with_reason() {
        let mut table = CustodyTable::default();
        table.accept(1, 600);
        let reason = table.signal_received(1, false, ReasonCode::DepletedStorage);
        assert_eq!(reason, Some(ReasonCode::DepletedStorage));
    }

    #[test]
    fn timer_fired_on_released_custody_is_none() {
        let mut table = CustodyTable::default();
        table.accept(1, 600);
        table.release(1);
        assert!(table.timer_fired(1).is_none());
    }
}
