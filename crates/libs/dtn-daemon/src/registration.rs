//! Registration table (§4.3): local endpoint subscriptions, their
//! delivery-failure policy, and per-registration bundle FIFOs.

use std::collections::{HashMap, VecDeque};

use dtn_core::{BundleId, EndpointId};

use crate::ids::RegId;

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum FailureAction {
    Drop,
    Defer,
    Exec(String),
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Registration {
    pub regid: RegId,
    pub endpoint_pattern: EndpointId,
    pub failure_action: FailureAction,
    pub expiration_secs: u64,
    pub init_passive: bool,
    /// `Some` while an API session is bound to this registration.
    pub bound_session: Option<u64>,
}

impl Registration {
    pub fn is_active(&self) -> bool {
        self.bound_session.is_some()
    }
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum RegistrationError {
    #[error("registration {0} not found")]
    NotFound(RegId),
    #[error("registration {0} already exists")]
    AlreadyExists(RegId),
}

/// What happened to a bundle offered to a registration that is not
/// actively bound, per §4.3's DROP/DEFER/EXEC semantics.
#[derive(Debug, Eq, PartialEq)]
pub enum OfferOutcome {
    /// Delivered synchronously to a bound session; caller should pop it
    /// immediately.
    DeliveredToSession,
    /// Queued in the registration's FIFO for future `recv`.
    Queued,
    /// `DROP`: the bundle was not queued; caller should emit a deletion
    /// event.
    Dropped,
    /// `EXEC`: the configured script should be invoked with a descriptor
    /// of the bundle; caller owns doing so.
    Exec(String),
}

struct RegistrationEntry {
    reg: Registration,
    fifo: VecDeque<BundleId>,
}

pub struct RegistrationTable {
    entries: HashMap<RegId, RegistrationEntry>,
    next_regid: RegId,
}

impl Default for RegistrationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationTable {
    pub fn new() -> Self {
        RegistrationTable { entries: HashMap::new(), next_regid: 1 }
    }

    /// Allocates the next regid and adds the registration, returning the
    /// assigned id. Regids are globally unique and monotonically
    /// allocated, per §3's invariant.
    pub fn add(&mut self, mut reg: Registration) -> RegId {
        let regid = self.next_regid;
        self.next_regid += 1;
        reg.regid = regid;
        self.entries.insert(regid, RegistrationEntry { reg, fifo: VecDeque::new() });
        regid
    }

    /// Restores a registration with an explicit regid, used when reloading
    /// `DEFER` registrations from the durable store after a restart.
    pub fn restore(&mut self, reg: Registration) -> Result<(), RegistrationError> {
        if self.entries.contains_key(&reg.regid) {
            return Err(RegistrationError::AlreadyExists(reg.regid));
        }
        self.next_regid = self.next_regid.max(reg.regid + 1);
        self.entries.insert(reg.regid, RegistrationEntry { reg, fifo: VecDeque::new() });
        Ok(())
    }

    pub fn remove(&mut self, regid: RegId) -> Result<Registration, RegistrationError> {
        self.entries
            .remove(&regid)
            .map(|e| e.reg)
            .ok_or(RegistrationError::NotFound(regid))
    }

    pub fn get(&self, regid: RegId) -> Option<&Registration> {
        self.entries.get(&regid).map(|e| &e.reg)
    }

    pub fn get_mut(&mut self, regid: RegId) -> Option<&mut Registration> {
        self.entries.get_mut(&regid).map(|e| &mut e.reg)
    }

    pub fn bind(&mut self, regid: RegId, session: u64) -> Result<(), RegistrationError> {
        let entry = self.entries.get_mut(&regid).ok_or(RegistrationError::NotFound(regid))?;
        entry.reg.bound_session = Some(session);
        Ok(())
    }

    pub fn unbind(&mut self, regid: RegId) -> Result<(), RegistrationError> {
        let entry = self.entries.get_mut(&regid).ok_or(RegistrationError::NotFound(regid))?;
        entry.reg.bound_session = None;
        Ok(())
    }

    /// Every registration whose pattern matches `eid`, in no particular
    /// order — `find_matching` delivers to every match, not just the
    /// longest, per §4.3.
    pub fn find_matching(&self, eid: &EndpointId) -> Vec<RegId> {
        self.entries
            .values()
            .filter(|e| e.reg.endpoint_pattern.matches(eid))
            .map(|e| e.reg.regid)
            .collect()
    }

    /// Offers `bundle_id` to `regid`: delivers immediately if bound,
    /// otherwise applies the registration's failure action.
    pub fn offer(&mut self, regid: RegId, bundle_id: BundleId) -> Result<OfferOutcome, RegistrationError> {
        let entry = self.entries.get_mut(&regid).ok_or(RegistrationError::NotFound(regid))?;
        if entry.reg.is_active() {
            entry.fifo.push_back(bundle_id);
            return Ok(OfferOutcome::DeliveredToSession);
        }
        match &entry.reg.failure_action {
            FailureAction::Drop => Ok(OfferOutcome::Dropped),
            FailureAction::Defer => {
                entry.fifo.push_back(bundle_id);
                Ok(OfferOutcome::Queued)
            }
            FailureAction::Exec(script) => Ok(OfferOutcome::Exec(script.clone())),
        }
    }

    /// Pops the next bundle queued for a bound registration (`recv`).
    pub fn pop(&mut self, regid: RegId) -> Result<Option<BundleId>, RegistrationError> {
        let entry = self.entries.get_mut(&regid).ok_or(RegistrationError::NotFound(regid))?;
        Ok(entry.fifo.pop_front())
    }

    pub fn pending_len(&self, regid: RegId) -> usize {
        self.entries.get(&regid).map(|e| e.fifo.len()).unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.entries.values().map(|e| &e.reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(pattern: &str, action: FailureAction) -> Registration {
        Registration {
            regid: 0,
            endpoint_pattern: EndpointId::parse(pattern).unwrap(),
            failure_action: action,
            expiration_secs: 0,
            init_passive: false,
            bound_session: None,
        }
    }

    #[test]
    fn regids_are_monotonic_and_unique() {
        let mut table = RegistrationTable::new();
        let a = table.add(reg("dtn://x/*", FailureAction::Drop));
        let b = table.add(reg("dtn://y/*", FailureAction::Drop));
        assert!(b > a);
    }

    #[test]
    fn find_matching_returns_all_matches() {
        let mut table = RegistrationTable::new();
        let a = table.add(reg("dtn://x/*", FailureAction::Drop));
        let b = table.add(reg("dtn://x/app", FailureAction::Drop));
        table.add(reg("dtn://other/*", FailureAction::Drop));
        let mut matches = table.find_matching(&EndpointId::parse("dtn://x/app").unwrap());
        matches.sort();
        assert_eq!(matches, vec![a, b]);
    }

    #[test]
    fn drop_action_does_not_queue() {
        let mut table = RegistrationTable::new();
        let regid = table.add(reg("dtn://x/*", FailureAction::Drop));
        let outcome = table.offer(regid, 1).unwrap();
        assert_eq!(outcome, OfferOutcome::Dropped);
        assert_eq!(table.pending_len(regid), 0);
    }

    #[test]
    fn defer_action_queues_until_bound() {
        let mut table = RegistrationTable::new();
        let regid = table.add(reg("dtn://x/*", FailureAction::Defer));
        table.offer(regid, 1).unwrap();
        assert_eq!(table.pending_len(regid), 1);
        table.bind(regid, 7).unwrap();
        table.offer(regid, 2).unwrap();
        assert_eq!(table.pop(regid).unwrap(), Some(1));
        assert_eq!(table.pop(regid).unwrap(), Some(2));
        assert_eq!(table.pop(regid).unwrap(), None);
    }

    #[test]
    fn exec_action_does_not_queue_either() {
        let mut table = RegistrationTable::new();
        let regid = table.add(reg("dtn://x/*", FailureAction::Exec("notify.sh".into())));
        let outcome = table.offer(regid, 1).unwrap();
        assert_eq!(outcome, OfferOutcome::Exec("notify.sh".into()));
        assert_eq!(table.pending_len(regid), 0);
    }

    #[test]
    fn restore_preserves_explicit_regid_and_advances_counter() {
        let mut table = RegistrationTable::new();
        let mut restored = reg("dtn://x/*", FailureAction::Defer);
        restored.regid = 50;
        table.restore(restored).unwrap();
        let next = table.add(reg("dtn://y/*", FailureAction::Drop));
        assert_eq!(next, 51);
    }
}
