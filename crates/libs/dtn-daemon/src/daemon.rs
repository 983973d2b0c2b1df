//! `DaemonContext` and the single-task event dispatch loop (§4.8, §9).
//!
//! All daemon-owned tables are reachable only through `DaemonContext`; the
//! dispatch loop in `run` is the sole task that ever mutates them, matching
//! the "one authoritative mutator" rule in §5.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dtn_core::reassembly::ReassemblyBuffer;
use dtn_core::status::{CustodySignal, ReasonCode, StatusReport, Subject};
use dtn_core::{Bundle, BundleId, CreationTimestamp, DeliveryOptions, EndpointId, Payload, PayloadLocation, Priority};
use dtn_store::{PayloadStore, SqliteStore, Table};

use crate::convergence_layer::ConvergenceLayer;
use crate::custody::{CustodyParams, CustodyTable, TimerOutcome};
use crate::event::{ContactDownReason, DaemonStatusReport, Event, EventReceiver, EventSender};
use crate::ids::{LinkId, RegId};
use crate::link::{ContactManager, LinkParams, LinkState, LinkType};
use crate::persist;
use crate::registration::{OfferOutcome, Registration, RegistrationTable};
use crate::router::Router;

/// Mirrors the wall-clock timestamp allocator the API session layer uses
/// for outbound bundles: monotonic `sequence` within a wall-clock second so
/// two administrative records minted in the same second still get distinct
/// `CreationTimestamp`s.
struct TimestampAllocator {
    last_secs: u64,
    seq: u64,
}

impl TimestampAllocator {
    fn new() -> Self {
        TimestampAllocator { last_secs: 0, seq: 0 }
    }

    fn next(&mut self) -> CreationTimestamp {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if secs == self.last_secs {
            self.seq += 1;
        } else {
            self.last_secs = secs;
            self.seq = 0;
        }
        CreationTimestamp { seconds: secs, sequence: self.seq }
    }
}

/// Everything a handler needs, owned by the single dispatch task. Passed by
/// unique `&mut` reference into each handler, per the `DaemonContext`
/// recommendation in §9.
pub struct DaemonContext {
    pub local_eid: EndpointId,
    pub bundles: HashMap<BundleId, Bundle>,
    pub registrations: RegistrationTable,
    pub contacts: ContactManager,
    pub router: Router,
    pub custody: CustodyTable,
    pub store: SqliteStore,
    /// Convergence layers keyed by the name a `Link` names in its `clayer`
    /// field, so a bundle queued on a link can be handed to the right
    /// transport without the dispatcher knowing transport concretely.
    cls: HashMap<String, Arc<dyn ConvergenceLayer>>,
    next_bundle_id: BundleId,
    /// `(source, creation_ts, frag_offset, orig_length, regid)` already
    /// delivered, enforcing the idempotent-delivery law from §8.
    delivered: HashSet<(EndpointId, CreationTimestamp, u64, u64, RegId)>,
    /// In-progress reassembly, keyed by `(source, creation_ts, orig_length)`
    /// per §4.1.
    reassembly: HashMap<(EndpointId, CreationTimestamp, u64), ReassemblyBuffer>,
    /// Bundles not currently claimed by any registration or link queue
    /// because nothing routes to their destination (or the route's link
    /// isn't usable yet); exempted from `try_free` and re-attempted by
    /// `rescan_held_bundles` whenever a new route is configured (§4.7).
    held: HashSet<BundleId>,
    /// The custodian a bundle was received from, so a give-up or an
    /// accept signal can be addressed back once custody is released here.
    custody_origin: HashMap<BundleId, EndpointId>,
    admin_ts: TimestampAllocator,
    events: EventSender,
    payload_store: Option<PayloadStore>,
    payload_mem_threshold: u64,
    shutting_down: bool,
}

impl DaemonContext {
    pub fn new(
        local_eid: EndpointId,
        store: SqliteStore,
        custody_params: CustodyParams,
        events: EventSender,
    ) -> Self {
        DaemonContext {
            local_eid,
            bundles: HashMap::new(),
            registrations: RegistrationTable::new(),
            contacts: ContactManager::new(),
            router: Router::new(),
            custody: CustodyTable::new(custody_params),
            store,
            cls: HashMap::new(),
            next_bundle_id: 1,
            delivered: HashSet::new(),
            reassembly: HashMap::new(),
            held: HashSet::new(),
            custody_origin: HashMap::new(),
            admin_ts: TimestampAllocator::new(),
            events,
            payload_store: None,
            payload_mem_threshold: u64::MAX,
            shutting_down: false,
        }
    }

    /// Registers a convergence layer under the name its links reference in
    /// their `clayer` field. Call before `run` starts; the dispatch loop
    /// only reads this map, never mutates it.
    pub fn register_cl(&mut self, name: impl Into<String>, cl: Arc<dyn ConvergenceLayer>) {
        self.cls.insert(name.into(), cl);
    }

    /// Wires in the directory that holds payloads spilled out of memory,
    /// and the size above which `accept_bundle` spills a new payload to it.
    pub fn set_payload_store(&mut self, store: PayloadStore, mem_threshold: u64) {
        self.payload_store = Some(store);
        self.payload_mem_threshold = mem_threshold;
    }

    /// Reinserts a bundle loaded from the durable store at startup,
    /// re-arming its custody timer and retrying delivery/routing, without
    /// re-emitting the custody-accept signal a restart should not repeat.
    pub fn restore_bundle(&mut self, bundle: Bundle) {
        let bundle_id = bundle.id;
        self.next_bundle_id = self.next_bundle_id.max(bundle_id + 1);
        if bundle.options.contains(DeliveryOptions::CUSTODY) {
            let timer = self.custody.accept(bundle_id, bundle.lifetime_secs);
            self.schedule_custody_timer(bundle_id, timer);
        }
        self.bundles.insert(bundle_id, bundle);
        self.route_and_deliver(bundle_id);
        self.try_free(bundle_id);
    }

    /// Hands a single queued bundle to `link`'s convergence layer,
    /// fire-and-forget; completion comes back as
    /// `BundleTransmitted`/`BundleTransmitFailed` events, which is also
    /// what removes it from `link.pending`.
    fn forward_bundle(&self, link: LinkId, bundle_id: BundleId) {
        let Some(l) = self.contacts.get(link) else { return };
        let Some(contact) = self.contacts.contact(link) else { return };
        let Some(cl) = self.cls.get(&l.clayer) else { return };
        let Some(bundle) = self.bundles.get(&bundle_id) else { return };
        let cl = cl.clone();
        let bundle = bundle.clone();
        let contact_id = contact.contact_id;
        tokio::spawn(async move {
            if let Err(err) = cl.send_bundle(contact_id, bundle).await {
                log::warn!("link {link}: send_bundle failed: {err}");
            }
        });
    }

    /// Hands every bundle currently queued on `link` to its convergence
    /// layer; used right after a contact comes up, when nothing queued
    /// during `Opening` has been forwarded yet.
    fn flush_link_pending(&self, link: LinkId) {
        let Some(l) = self.contacts.get(link) else { return };
        for bundle_id in l.pending.iter().copied().collect::<Vec<_>>() {
            self.forward_bundle(link, bundle_id);
        }
    }

    /// `AVAILABLE -> OPENING`, then asks the link's convergence layer to
    /// dial out. Success/failure comes back as `ContactUp`/
    /// `ContactOpenFailed` through the event queue, save for the rare case
    /// where the CL rejects the attempt outright (e.g. a connection already
    /// exists under its bookkeeping); that leaves the link stuck in
    /// `Opening` until the next external retry.
    fn try_open_link(&mut self, link: LinkId) {
        if self.contacts.begin_opening(link).is_err() {
            return;
        }
        let Some(l) = self.contacts.get(link) else { return };
        let Some(cl) = self.cls.get(&l.clayer) else { return };
        let cl = cl.clone();
        tokio::spawn(async move {
            if let Err(err) = cl.open_contact(link).await {
                log::warn!("link {link}: open_contact failed: {err}");
            }
        });
    }

    /// Schedules `link` to be reopened after `backoff` elapses, replaying
    /// the `UNAVAILABLE -> AVAILABLE -> OPENING` sequence regardless of
    /// which of those the contact-broken path actually left it in.
    fn schedule_reopen(&self, link: LinkId, backoff: Duration) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = events.push(Event::LinkUnavailable { link }).await;
            let _ = events.push(Event::LinkAvailable { link }).await;
            let _ = events.push(Event::LinkStateChangeRequest { link, target: LinkState::Opening }).await;
        });
    }

    fn allocate_bundle_id(&mut self) -> BundleId {
        let id = self.next_bundle_id;
        self.next_bundle_id += 1;
        id
    }

    fn persist_bundle(&mut self, bundle: &Bundle) {
        let key = persist::bundle_key(bundle.id);
        match persist::encode_bundle(bundle) {
            Ok(value) => {
                if let Err(err) = self.store.put(Table::Bundles, &key, &value) {
                    log::warn!("bundle {}: store put failed: {err}", bundle.id);
                }
            }
            Err(err) => log::warn!("bundle {}: encode for store failed: {err}", bundle.id),
        }
    }

    /// Moves a payload larger than `payload_mem_threshold` out to the
    /// payload directory, per §4.2's memory/file split. A no-op if no
    /// payload store is configured or the payload is already small enough.
    fn maybe_spill_to_file(&self, bundle: &mut Bundle) {
        let Some(store) = &self.payload_store else { return };
        if bundle.payload.length <= self.payload_mem_threshold {
            return;
        }
        let PayloadLocation::Memory(bytes) = &bundle.payload.location else { return };
        match store.write_complete(bundle.id, bytes) {
            Ok(path) => bundle.payload.location = PayloadLocation::File(path),
            Err(err) => log::warn!("bundle {}: payload spill to file failed: {err}", bundle.id),
        }
    }

    /// Inserts a freshly received or injected bundle, assigning it a
    /// process-local id, and attempts delivery/forwarding.
    fn accept_bundle(&mut self, bundle: Bundle) {
        if bundle.is_fragment() {
            self.accept_fragment(bundle);
            return;
        }

        let mut bundle = bundle;
        bundle.id = self.allocate_bundle_id();
        let bundle_id = bundle.id;

        self.maybe_spill_to_file(&mut bundle);

        if bundle.destination == self.local_eid && bundle.options.contains(DeliveryOptions::ADMIN_RECORD) {
            self.handle_admin_record(&bundle);
            return;
        }

        if bundle.options.contains(DeliveryOptions::CUSTODY) {
            let previous_custodian = bundle.custodian.clone();
            let timer = self.custody.accept(bundle_id, bundle.lifetime_secs);
            bundle.custodian = self.local_eid.clone();
            log::debug!("bundle {bundle_id}: accepted custody, retransmit in {timer:?}");
            self.schedule_custody_timer(bundle_id, timer);
            if !previous_custodian.is_null() && previous_custodian != self.local_eid {
                self.custody_origin.insert(bundle_id, previous_custodian.clone());
                let subject = Subject {
                    source: bundle.source.clone(),
                    creation_ts: bundle.creation_ts,
                    fragment_offset_len: bundle.fragment.map(|f| (f.offset, f.original_length)),
                };
                self.emit_custody_signal(subject, true, ReasonCode::NoInfo, previous_custodian);
            }
        }

        self.persist_bundle(&bundle);
        self.bundles.insert(bundle_id, bundle);

        self.route_and_deliver(bundle_id);

        self.try_free(bundle_id);
    }

    /// Merges an incoming fragment into its reassembly buffer, keyed by
    /// `(source, creation_ts, orig_length)`; once the buffer holds the
    /// complete original payload, the assembled bundle re-enters
    /// `accept_bundle` as a whole bundle (§4.1).
    fn accept_fragment(&mut self, bundle: Bundle) {
        let Some(frag) = bundle.fragment else { return };
        let key = (bundle.source.clone(), bundle.creation_ts, frag.original_length);
        let buffer = self.reassembly.entry(key.clone()).or_insert_with(|| ReassemblyBuffer::new(frag.original_length));
        if let Err(err) = buffer.add_fragment(&bundle) {
            log::warn!("fragment from {}: rejected: {err}", bundle.source);
            return;
        }
        let complete = self.reassembly.get(&key).map(|b| b.is_complete()).unwrap_or(false);
        if complete {
            let buffer = self.reassembly.remove(&key).expect("just checked present");
            let assembled = buffer.assemble();
            self.accept_bundle(assembled);
        }
    }

    /// Offers a bundle to every matching registration, then, if nothing
    /// claimed it locally, queues it on the link its destination routes to.
    /// Shared by fresh arrivals, restored bundles, reassembly completions,
    /// custody retransmits, and the re-scan that `Event::RouteAdd` triggers.
    fn route_and_deliver(&mut self, bundle_id: BundleId) {
        let (destination, dedup_key) = {
            let Some(bundle) = self.bundles.get(&bundle_id) else { return };
            (bundle.destination.clone(), bundle.dedup_key())
        };

        let matches = self.registrations.find_matching(&destination);
        for regid in &matches {
            let key = (dedup_key.0.clone(), dedup_key.1, dedup_key.2, dedup_key.3, *regid);
            if self.delivered.contains(&key) {
                continue;
            }
            match self.registrations.offer(*regid, bundle_id) {
                Ok(OfferOutcome::DeliveredToSession) | Ok(OfferOutcome::Queued) => {
                    self.delivered.insert(key);
                    if let Some(b) = self.bundles.get_mut(&bundle_id) {
                        b.refcount += 1;
                    }
                }
                Ok(OfferOutcome::Dropped) => {
                    log::debug!("bundle {bundle_id}: dropped by registration {regid} (DROP policy)");
                }
                Ok(OfferOutcome::Exec(script)) => {
                    log::info!("bundle {bundle_id}: would exec '{script}' for registration {regid}");
                }
                Err(err) => log::warn!("bundle {bundle_id}: registration {regid} offer failed: {err}"),
            }
        }

        if !matches.is_empty() || destination == self.local_eid {
            self.held.remove(&bundle_id);
            return;
        }

        let Some(link) = self.router.lookup(&destination).map(|r| r.link) else {
            self.held.insert(bundle_id);
            log::debug!("bundle {bundle_id}: no route to {destination}, held pending");
            return;
        };

        let already_queued = self.contacts.get(link).map(|l| l.pending.contains(&bundle_id)).unwrap_or(false);
        if already_queued {
            self.held.remove(&bundle_id);
            return;
        }

        let queued_state = self.contacts.get_mut(link).and_then(|l| {
            if !l.is_usable_for_routing() {
                return None;
            }
            l.pending.push_back(bundle_id);
            Some(l.state)
        });

        match queued_state {
            Some(state) => {
                self.held.remove(&bundle_id);
                if let Some(b) = self.bundles.get_mut(&bundle_id) {
                    b.refcount += 1;
                }
                let _ = self.contacts.mark_busy_if_needed(link);
                match state {
                    LinkState::Open => self.forward_bundle(link, bundle_id),
                    LinkState::Available => self.try_open_link(link),
                    _ => {}
                }
            }
            None => {
                self.held.insert(bundle_id);
                log::debug!("bundle {bundle_id}: route to {destination} exists but link {link} not usable, held pending");
            }
        }
    }

    /// Re-attempts delivery/routing for every held bundle; called after a
    /// new route is configured so a bundle stuck "no route, held pending"
    /// doesn't stay stranded once a matching route shows up (§4.7).
    fn rescan_held_bundles(&mut self) {
        let ids: Vec<BundleId> = self.held.iter().copied().collect();
        for bundle_id in ids {
            self.route_and_deliver(bundle_id);
            self.try_free(bundle_id);
        }
    }

    /// Removes `bundle_id` from the bundle table once its refcount reaches
    /// zero, nothing still holds it in custody, and it isn't sitting in
    /// `held` awaiting a route, per §3's lifecycle invariant.
    fn try_free(&mut self, bundle_id: BundleId) {
        let freed = matches!(self.bundles.get(&bundle_id), Some(b) if b.refcount == 0)
            && !self.custody.is_in_custody(bundle_id)
            && !self.held.contains(&bundle_id);
        if freed {
            self.bundles.remove(&bundle_id);
            self.custody_origin.remove(&bundle_id);
            let key = persist::bundle_key(bundle_id);
            if let Err(err) = self.store.del(Table::Bundles, &key) {
                log::warn!("bundle {bundle_id}: store delete failed: {err}");
            }
            if let Some(store) = &self.payload_store {
                if let Err(err) = store.remove(bundle_id) {
                    log::warn!("bundle {bundle_id}: payload file removal failed: {err}");
                }
            }
        }
    }

    fn release_ref(&mut self, bundle_id: BundleId) {
        if let Some(b) = self.bundles.get_mut(&bundle_id) {
            b.refcount = b.refcount.saturating_sub(1);
        }
        self.try_free(bundle_id);
    }

    fn schedule_custody_timer(&self, bundle_id: BundleId, duration: Duration) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = events.push(Event::CustodyTimeout { bundle_id }).await;
        });
    }

    /// Re-queues a bundle still held in custody for forwarding; a no-op if
    /// it's still sitting in a link's pending queue from a prior attempt.
    fn retransmit_custody_bundle(&mut self, bundle_id: BundleId) {
        if !self.bundles.contains_key(&bundle_id) {
            return;
        }
        self.route_and_deliver(bundle_id);
    }

    /// Builds and injects an administrative bundle carrying a custody
    /// signal, addressed to `to` (the node custody was received from).
    fn emit_custody_signal(&mut self, subject: Subject, succeeded: bool, reason: ReasonCode, to: EndpointId) {
        let signal = CustodySignal { succeeded, reason, subject };
        let creation_ts = self.admin_ts.next();
        let admin = Bundle {
            id: 0,
            source: self.local_eid.clone(),
            destination: to,
            reply_to: EndpointId::null(),
            custodian: self.local_eid.clone(),
            creation_ts,
            priority: Priority::Expedited,
            options: DeliveryOptions::ADMIN_RECORD,
            lifetime_secs: 3600,
            fragment: None,
            extensions: Vec::new(),
            payload: Payload::complete_in_memory(signal.encode()),
            refcount: 0,
        };
        self.accept_bundle(admin);
    }

    /// Decodes an administrative record addressed to this node and applies
    /// it: a custody signal releases (or fails) the subject bundle's
    /// custody timer; a status report is logged (§4.1, §4.6).
    fn handle_admin_record(&mut self, bundle: &Bundle) {
        let bytes = match &bundle.payload.location {
            PayloadLocation::Memory(bytes) => bytes.clone(),
            _ => {
                log::warn!("admin record with non-memory payload, ignoring");
                return;
            }
        };
        if let Ok(signal) = CustodySignal::decode(&bytes) {
            match self.find_bundle_by_subject(&signal.subject) {
                Some(bundle_id) => {
                    if let Some(reason) = self.custody.signal_received(bundle_id, signal.succeeded, signal.reason) {
                        log::info!("bundle {bundle_id}: custody failed, reason {reason:?}");
                    } else {
                        log::debug!("bundle {bundle_id}: custody signal succeeded, releasing");
                    }
                    self.custody_origin.remove(&bundle_id);
                    self.try_free(bundle_id);
                }
                None => log::debug!("custody signal for unknown bundle from {}", signal.subject.source),
            }
            return;
        }
        if let Ok(report) = StatusReport::decode(&bytes) {
            log::info!(
                "status report from {}: flags {:?} reason {:?}",
                report.subject.source,
                report.flags,
                report.reason
            );
            return;
        }
        log::warn!("admin record: could not decode as status report or custody signal");
    }

    fn find_bundle_by_subject(&self, subject: &Subject) -> Option<BundleId> {
        self.bundles
            .iter()
            .find(|(_, b)| {
                b.source == subject.source
                    && b.creation_ts == subject.creation_ts
                    && match (subject.fragment_offset_len, b.fragment) {
                        (Some((o, l)), Some(f)) => f.offset == o && f.original_length == l,
                        (None, None) => true,
                        _ => false,
                    }
            })
            .map(|(id, _)| *id)
    }

    /// Applies a runtime parameter change to every link using `cl_name`,
    /// then re-initializes the CL's per-link state so the next contact
    /// picks up the new value (§4.5, §4.8).
    fn apply_cl_param(&mut self, cl_name: &str, key: &str, value: &str) {
        let Some(cl) = self.cls.get(cl_name).cloned() else {
            log::warn!("cl {cl_name}: param {key} set but no such convergence layer registered");
            return;
        };
        let links: Vec<LinkId> = self.contacts.iter().filter(|l| l.clayer == cl_name).map(|l| l.id).collect();
        if links.is_empty() {
            log::warn!("cl {cl_name}: param {key} set but no links use this convergence layer");
            return;
        }
        let mut reapply = Vec::new();
        for link in links {
            let Some(l) = self.contacts.get_mut(link) else { continue };
            if !set_link_param(&mut l.params, key, value) {
                log::warn!("cl {cl_name}: unknown or invalid param '{key}={value}' for link {link}");
                continue;
            }
            reapply.push((link, l.nexthop.clone(), l.params.clone()));
        }
        for (link, nexthop, params) in reapply {
            let cl = cl.clone();
            tokio::spawn(async move {
                if let Err(err) = cl.init_link(link, &nexthop, params).await {
                    log::warn!("link {link}: re-applying params failed: {err}");
                }
            });
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::BundleReceived { bundle, .. } => self.accept_bundle(*bundle),
            Event::BundleInject { bundle } => self.accept_bundle(*bundle),
            Event::BundleTransmitted { bundle_id, link, .. } => {
                if let Some(l) = self.contacts.get_mut(link) {
                    l.pending.retain(|b| *b != bundle_id);
                    let _ = self.contacts.mark_unblocked_if_ready(link);
                }
                self.release_ref(bundle_id);
            }
            Event::BundleTransmitFailed { bundle_id, link } => {
                if let Some(l) = self.contacts.get_mut(link) {
                    l.pending.retain(|b| *b != bundle_id);
                }
                self.release_ref(bundle_id);
            }
            Event::BundleDelivered { bundle_id, .. } => self.release_ref(bundle_id),
            Event::BundleExpired { bundle_id } | Event::BundleFreed { bundle_id } => {
                self.bundles.remove(&bundle_id);
                self.held.remove(&bundle_id);
                self.custody_origin.remove(&bundle_id);
            }
            Event::BundleCancel { bundle_id, link } => {
                if let Some(l) = self.contacts.get_mut(link) {
                    l.pending.retain(|b| *b != bundle_id);
                }
            }
            Event::BundleDelete { bundle_id, reason } => {
                log::info!("bundle {bundle_id}: deleted, reason {reason:?}");
                self.bundles.remove(&bundle_id);
                self.held.remove(&bundle_id);
                self.custody_origin.remove(&bundle_id);
            }
            Event::BundleQuery { bundle_id, reply } => {
                if let Some(tx) = reply {
                    let _ = tx.send(self.bundles.get(&bundle_id).cloned());
                }
            }

            Event::RegistrationAdded { regid } => {
                log::debug!("registration {regid} added");
            }
            Event::RegistrationRemoved { regid } | Event::RegistrationExpired { regid } | Event::RegistrationDelete { regid } => {
                let _ = self.registrations.remove(regid);
            }
            Event::RegisterRequest { pattern, failure_action, expiration_secs, init_passive, reply } => {
                let regid = self.registrations.add(Registration {
                    regid: 0,
                    endpoint_pattern: pattern,
                    failure_action,
                    expiration_secs,
                    init_passive,
                    bound_session: None,
                });
                if let Some(tx) = reply {
                    let _ = tx.send(regid);
                }
            }
            Event::UnregisterRequest { regid, reply } => {
                let existed = self.registrations.remove(regid).is_ok();
                if let Some(tx) = reply {
                    let _ = tx.send(existed);
                }
            }
            Event::ChangeRegistrationRequest { regid, failure_action, expiration_secs, reply } => {
                let ok = if let Some(reg) = self.registrations.get_mut(regid) {
                    if let Some(fa) = failure_action {
                        reg.failure_action = fa;
                    }
                    if let Some(exp) = expiration_secs {
                        reg.expiration_secs = exp;
                    }
                    true
                } else {
                    false
                };
                if let Some(tx) = reply {
                    let _ = tx.send(ok);
                }
            }
            Event::FindRegistrationRequest { eid, reply } => {
                let found = self.registrations.find_matching(&eid).into_iter().next();
                if let Some(tx) = reply {
                    let _ = tx.send(found);
                }
            }
            Event::BindRequest { regid, session, reply } => {
                let ok = self.registrations.bind(regid, session).is_ok();
                if let Some(tx) = reply {
                    let _ = tx.send(ok);
                }
            }
            Event::UnbindRequest { regid } => {
                let _ = self.registrations.unbind(regid);
            }
            Event::RecvRequest { regid, reply } => {
                let bundle_id = self.registrations.pop(regid).ok().flatten();
                let bundle = bundle_id.and_then(|id| {
                    let b = self.bundles.get(&id).cloned();
                    self.release_ref(id);
                    b
                });
                if let Some(tx) = reply {
                    let _ = tx.send(bundle);
                }
            }
            Event::LocalEidQuery { reply } => {
                if let Some(tx) = reply {
                    let _ = tx.send(self.local_eid.clone());
                }
            }

            Event::RouteAdd { pattern, link, action } => {
                self.router.add_route(crate::router::Route { pattern, link, action });
                self.rescan_held_bundles();
            }
            Event::RouteDel { pattern, link } => {
                if let Err(err) = self.router.del_route(&pattern, link) {
                    log::warn!("route del failed: {err}");
                }
            }
            Event::RouteQuery { reply } => {
                if let Some(tx) = reply {
                    let routes =
                        self.router.iter().map(|r| (r.pattern.clone(), r.link)).collect();
                    let _ = tx.send(routes);
                }
            }

            Event::LinkCreated { .. } | Event::LinkDeleted { .. } => {}
            Event::LinkAvailable { link } => {
                if let Err(err) = self.contacts.set_available(link) {
                    log::warn!("link {link}: {err}");
                }
            }
            Event::LinkUnavailable { link } => {
                let _ = self.contacts.reset_to_unavailable(link);
            }
            Event::LinkStateChangeRequest { link, target } => {
                if target == LinkState::Opening {
                    self.try_open_link(link);
                }
            }
            Event::LinkReconfigure { .. } => {}
            Event::LinkQuery { link, reply } => {
                if let Some(tx) = reply {
                    let _ = tx.send(self.contacts.get(link).map(|l| l.state));
                }
            }
            Event::ContactUp { link, contact } => {
                match self.contacts.contact_up(link, contact) {
                    Ok(()) => self.flush_link_pending(link),
                    Err(err) => log::warn!("link {link}: {err}"),
                }
            }
            Event::ContactDown { link, reason, .. } => {
                let backoff = self.contacts.contact_broken(link).ok().flatten();
                log::info!("link {link}: contact down ({reason:?}), reconnect in {backoff:?}");
                if let Some(backoff) = backoff {
                    self.schedule_reopen(link, backoff);
                }
            }
            Event::ContactOpenFailed { link } => {
                let backoff = self.contacts.open_failed(link).ok().flatten();
                log::info!("link {link}: failed to open contact, reconnect in {backoff:?}");
                if let Some(backoff) = backoff {
                    self.schedule_reopen(link, backoff);
                }
            }
            Event::ContactAttribChanged { .. } => {}
            Event::LinkCreateOpportunistic { nexthop, clayer, reply } => {
                let link =
                    self.contacts.create_link(format!("opportunistic-{nexthop}"), LinkType::Opportunistic, nexthop, clayer);
                if let Some(tx) = reply {
                    let _ = tx.send(link);
                }
            }
            Event::LinkPrepareInbound { link, reply } => {
                let ok = self.contacts.prepare_inbound(link).is_ok();
                if !ok {
                    log::warn!("link {link}: not ready to accept an inbound contact");
                }
                if let Some(tx) = reply {
                    if ok {
                        let _ = tx.send(());
                    }
                }
            }

            Event::ReassemblyCompleted { bundle } => self.accept_bundle(*bundle),

            Event::CustodySignalReceived { bundle_id, succeeded, reason } => {
                if let Some(failure_reason) = self.custody.signal_received(bundle_id, succeeded, reason) {
                    log::info!("bundle {bundle_id}: custody failed, reason {failure_reason:?}");
                }
                self.custody_origin.remove(&bundle_id);
                self.try_free(bundle_id);
            }
            Event::CustodyTimeout { bundle_id } => {
                if let Some((outcome, next)) = self.custody.timer_fired(bundle_id) {
                    match outcome {
                        TimerOutcome::Retransmit => {
                            log::debug!("bundle {bundle_id}: custody timer fired, retransmitting");
                            self.retransmit_custody_bundle(bundle_id);
                            if let Some(next) = next {
                                self.schedule_custody_timer(bundle_id, next);
                            }
                        }
                        TimerOutcome::GiveUp => {
                            log::info!("bundle {bundle_id}: custody retries exhausted, giving up");
                            let subject = self.bundles.get(&bundle_id).map(|bundle| Subject {
                                source: bundle.source.clone(),
                                creation_ts: bundle.creation_ts,
                                fragment_offset_len: bundle.fragment.map(|f| (f.offset, f.original_length)),
                            });
                            self.bundles.remove(&bundle_id);
                            self.held.remove(&bundle_id);
                            let key = persist::bundle_key(bundle_id);
                            if let Err(err) = self.store.del(Table::Bundles, &key) {
                                log::warn!("bundle {bundle_id}: store delete failed: {err}");
                            }
                            if let (Some(subject), Some(origin)) = (subject, self.custody_origin.remove(&bundle_id)) {
                                self.emit_custody_signal(subject, false, ReasonCode::NoTimelyContact, origin);
                            }
                        }
                    }
                }
            }

            Event::DaemonShutdown => {
                self.shutting_down = true;
            }
            Event::DaemonStatus { reply } => {
                if let Some(tx) = reply {
                    let _ = tx.send(DaemonStatusReport {
                        bundle_count: self.bundles.len(),
                        link_count: self.contacts.iter().count(),
                        registration_count: self.registrations.iter().count(),
                    });
                }
            }

            Event::ClParamSet { cl_name, key, value } => {
                self.apply_cl_param(&cl_name, &key, &value);
            }
            Event::ClQuery { reply, .. } => {
                if let Some(tx) = reply {
                    let _ = tx.send(None);
                }
            }
            Event::ClReport { cl_name, report } => {
                log::debug!("cl {cl_name}: {report}");
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }
}

/// Parses one string-typed `Event::ClParamSet` value into the matching
/// `LinkParams` field. Returns `false` for an unknown key or a value that
/// doesn't parse as that field's type.
fn set_link_param(params: &mut LinkParams, key: &str, value: &str) -> bool {
    match key {
        "busy_queue_depth" => value.parse().map(|v| params.busy_queue_depth = v).is_ok(),
        "idle_close_time_secs" => value.parse().map(|v: u64| params.idle_close_time = Duration::from_secs(v)).is_ok(),
        "min_retry_interval_secs" => {
            value.parse().map(|v: u64| params.min_retry_interval = Duration::from_secs(v)).is_ok()
        }
        "max_retry_interval_secs" => {
            value.parse().map(|v: u64| params.max_retry_interval = Duration::from_secs(v)).is_ok()
        }
        "block_length" => value.parse().map(|v| params.block_length = v).is_ok(),
        "reactive_frag_enabled" => value.parse().map(|v| params.reactive_frag_enabled = v).is_ok(),
        "data_timeout_secs" => value.parse().map(|v: u64| params.data_timeout = Duration::from_secs(v)).is_ok(),
        "keepalive_interval_secs" => {
            value.parse().map(|v: u64| params.keepalive_interval = Duration::from_secs(v)).is_ok()
        }
        _ => false,
    }
}

/// Runs the dispatch loop until `DaemonShutdown` is processed or the event
/// channel is closed. This is the single task that owns `ctx` for its
/// entire lifetime.
pub async fn run(mut ctx: DaemonContext, mut events: EventReceiver) -> DaemonContext {
    while let Some(envelope) = events.recv().await {
        let shutdown = matches!(envelope.event, Event::DaemonShutdown);
        ctx.handle(envelope.event);
        if let Some(done) = envelope.done {
            let _ = done.send(());
        }
        if shutdown {
            break;
        }
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::channel;
    use dtn_core::{CreationTimestamp, Payload, Priority};

    fn sample_bundle(dest: &str) -> Bundle {
        Bundle {
            id: 0,
            source: EndpointId::parse("dtn://a/app").unwrap(),
            destination: EndpointId::parse(dest).unwrap(),
            reply_to: EndpointId::null(),
            custodian: EndpointId::null(),
            creation_ts: CreationTimestamp { seconds: 1, sequence: 0 },
            priority: Priority::Normal,
            options: DeliveryOptions::empty(),
            lifetime_secs: 3600,
            fragment: None,
            extensions: Vec::new(),
            payload: Payload::complete_in_memory(b"hello".to_vec()),
            refcount: 0,
        }
    }

    fn new_ctx() -> DaemonContext {
        let store = SqliteStore::open_in_memory().unwrap();
        let (events, _rx) = channel(16);
        DaemonContext::new(EndpointId::local("n1"), store, CustodyParams::default(), events)
    }

    #[tokio::test]
    async fn bundle_delivered_to_matching_registration_then_freed() {
        let mut ctx = new_ctx();
        let regid = ctx.registrations.add(crate::registration::Registration {
            regid: 0,
            endpoint_pattern: EndpointId::parse("dtn://x/*").unwrap(),
            failure_action: crate::registration::FailureAction::Defer,
            expiration_secs: 0,
            init_passive: false,
            bound_session: None,
        });
        ctx.accept_bundle(sample_bundle("dtn://x/app"));
        assert_eq!(ctx.registrations.pending_len(regid), 1);
        let bundle_id = *ctx.bundles.keys().next().unwrap();
        ctx.handle(Event::BundleDelivered { bundle_id, regid });
        assert!(ctx.bundles.get(&bundle_id).is_none(), "refcount should drop to zero and free the bundle");
    }

    #[tokio::test]
    async fn run_loop_exits_on_shutdown() {
        let ctx = new_ctx();
        let (tx, rx) = channel(4);
        let handle = tokio::spawn(run(ctx, rx));
        tx.push(Event::DaemonShutdown).await.unwrap();
        let ctx = handle.await.unwrap();
        assert!(ctx.is_shutting_down());
    }

    #[tokio::test]
    async fn no_matching_registration_holds_for_route() {
        let mut ctx = new_ctx();
        ctx.contacts.create_link("l1".into(), crate::link::LinkType::OnDemand, "host".into(), "tcp".into());
        let link = ctx.contacts.iter().next().unwrap().id;
        ctx.router.add_route(crate::router::Route {
            pattern: EndpointId::parse("dtn://c/*").unwrap(),
            link,
            action: crate::router::RouteAction::Forward,
        });
        ctx.contacts.set_available(link).unwrap();
        ctx.contacts.begin_opening(link).unwrap();
        ctx.contacts.contact_up(link, 1).unwrap();
        ctx.accept_bundle(sample_bundle("dtn://c/app"));
        assert_eq!(ctx.contacts.get(link).unwrap().pending.len(), 1);
    }

    #[tokio::test]
    async fn bundle_with_no_route_stays_held_until_a_route_is_added() {
        let mut ctx = new_ctx();
        ctx.accept_bundle(sample_bundle("dtn://c/app"));
        let bundle_id = *ctx.bundles.keys().next().unwrap();
        assert_eq!(ctx.bundles.get(&bundle_id).unwrap().refcount, 0, "nothing should claim it yet");
        assert!(ctx.bundles.contains_key(&bundle_id), "held bundle must not be freed just for having refcount 0");

        let link = ctx.contacts.create_link("l1".into(), crate::link::LinkType::OnDemand, "host".into(), "tcp".into());
        ctx.contacts.set_available(link).unwrap();
        ctx.handle(Event::RouteAdd {
            pattern: EndpointId::parse("dtn://c/*").unwrap(),
            link,
            action: crate::router::RouteAction::Forward,
        });

        assert_eq!(
            ctx.contacts.get(link).unwrap().pending.len(),
            1,
            "rescan triggered by RouteAdd should queue the previously stranded bundle"
        );
        assert_eq!(ctx.bundles.get(&bundle_id).unwrap().refcount, 1);
    }

    fn fragment(offset: u64, orig_len: u64, bytes: &[u8]) -> Bundle {
        let mut b = sample_bundle("dtn://c/app");
        b.fragment = Some(dtn_core::FragmentInfo { offset, original_length: orig_len });
        b.payload = Payload::complete_in_memory(bytes.to_vec());
        b
    }

    #[tokio::test]
    async fn fragments_reassemble_and_then_route_as_one_bundle() {
        let mut ctx = new_ctx();
        ctx.accept_bundle(fragment(0, 10, b"01234"));
        assert!(ctx.bundles.is_empty(), "incomplete reassembly should not surface a bundle yet");
        ctx.accept_bundle(fragment(5, 10, b"56789"));
        let bundle_id = *ctx.bundles.keys().next().expect("assembled bundle should now be present");
        let bundle = ctx.bundles.get(&bundle_id).unwrap();
        assert!(!bundle.is_fragment());
        match &bundle.payload.location {
            PayloadLocation::Memory(bytes) => assert_eq!(bytes, b"0123456789"),
            _ => panic!("expected memory payload"),
        }
    }

    #[tokio::test]
    async fn custody_accept_schedules_timer_and_signals_previous_custodian() {
        let mut ctx = new_ctx();
        let mut bundle = sample_bundle("dtn://c/app");
        bundle.options = DeliveryOptions::CUSTODY;
        bundle.custodian = EndpointId::parse("dtn://prev/app").unwrap();
        ctx.accept_bundle(bundle);

        let bundle_id = *ctx
            .bundles
            .iter()
            .find(|(_, b)| b.options.contains(DeliveryOptions::CUSTODY))
            .map(|(id, _)| id)
            .expect("the custody bundle itself should still be present");
        assert!(ctx.custody.is_in_custody(bundle_id));
        assert_eq!(ctx.bundles.get(&bundle_id).unwrap().custodian, ctx.local_eid);

        let admin_count =
            ctx.bundles.values().filter(|b| b.options.contains(DeliveryOptions::ADMIN_RECORD)).count();
        assert_eq!(admin_count, 1, "accepting custody from a real previous custodian should emit one signal");
    }

    #[tokio::test]
    async fn giving_up_custody_removes_the_bundle() {
        let mut ctx = new_ctx();
        ctx.custody = CustodyTable::new(CustodyParams { retry_factor: 6, max_retries: 1 });
        let mut bundle = sample_bundle("dtn://c/app");
        bundle.options = DeliveryOptions::CUSTODY;
        bundle.lifetime_secs = 6;
        ctx.accept_bundle(bundle);
        let bundle_id = *ctx.bundles.keys().next().unwrap();

        ctx.handle(Event::CustodyTimeout { bundle_id });
        assert!(ctx.bundles.get(&bundle_id).is_some(), "first timeout should retransmit, not give up");

        ctx.handle(Event::CustodyTimeout { bundle_id });
        assert!(ctx.bundles.get(&bundle_id).is_none(), "retries exhausted should give up and free the bundle");
    }
}
