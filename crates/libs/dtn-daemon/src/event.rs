//! The tagged-union `Event` type and its queue (§3 "Event", §4.8, §5).
//!
//! Every mutation to daemon-owned state arrives as an `Event` pushed onto a
//! single `EventQueue`; the daemon's dispatch loop is the sole reader and
//! sole mutator, eliminating shared-mutable-state concurrency per §5.

use dtn_core::{Bundle, BundleId, EndpointId};
use tokio::sync::{mpsc, oneshot};

use crate::ids::{ContactId, LinkId, RegId};
use crate::link::{LinkType, LinkState};
use crate::registration::FailureAction;
use crate::router::RouteAction;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContactDownReason {
    Broken,
    Idle,
    User,
    Shutdown,
    Unblocked,
    Discovery,
}

#[derive(Debug)]
pub enum Event {
    // -- Bundle lifecycle --
    BundleReceived { bundle: Box<Bundle>, source_link: Option<LinkId> },
    BundleTransmitted { bundle_id: BundleId, link: LinkId, sent: u64, acked: u64 },
    BundleTransmitFailed { bundle_id: BundleId, link: LinkId },
    BundleDelivered { bundle_id: BundleId, regid: RegId },
    BundleExpired { bundle_id: BundleId },
    BundleFreed { bundle_id: BundleId },
    BundleCancel { bundle_id: BundleId, link: LinkId },
    BundleInject { bundle: Box<Bundle> },
    BundleDelete { bundle_id: BundleId, reason: dtn_core::status::ReasonCode },
    BundleQuery { bundle_id: BundleId, reply: Option<oneshot::Sender<Option<Bundle>>> },

    // -- Registration --
    RegistrationAdded { regid: RegId },
    RegistrationRemoved { regid: RegId },
    RegistrationExpired { regid: RegId },
    RegistrationDelete { regid: RegId },

    /// `register(reg_info) -> regid` from §4.9, realized as a request/reply
    /// event rather than a direct `RegistrationTable` call so the table
    /// remains exclusively owned by the dispatch loop.
    RegisterRequest {
        pattern: EndpointId,
        failure_action: FailureAction,
        expiration_secs: u64,
        init_passive: bool,
        reply: Option<oneshot::Sender<RegId>>,
    },
    /// `unregister(regid)`; reply indicates whether it existed.
    UnregisterRequest { regid: RegId, reply: Option<oneshot::Sender<bool>> },
    /// `dtn_change_registration`: updates failure action and/or expiration
    /// in place, per §4.3.
    ChangeRegistrationRequest {
        regid: RegId,
        failure_action: Option<FailureAction>,
        expiration_secs: Option<u64>,
        reply: Option<oneshot::Sender<bool>>,
    },
    /// `find_registration(eid) -> regid`: first matching registration, or
    /// `None`.
    FindRegistrationRequest { eid: EndpointId, reply: Option<oneshot::Sender<Option<RegId>>> },
    /// `bind(regid)`: associates the calling API session with `regid` so
    /// future offers deliver to it directly instead of queuing.
    BindRequest { regid: RegId, session: u64, reply: Option<oneshot::Sender<bool>> },
    /// Fired when an API session closes (or rebinds), releasing its claim.
    UnbindRequest { regid: RegId },
    /// `recv(timeout) -> bundle`: pops the next bundle queued for `regid`
    /// and releases the daemon's reference to it in the same step.
    RecvRequest { regid: RegId, reply: Option<oneshot::Sender<Option<Bundle>>> },
    /// `local_eid(tag) -> eid`.
    LocalEidQuery { reply: Option<oneshot::Sender<EndpointId>> },

    // -- Routing --
    RouteAdd { pattern: EndpointId, link: LinkId, action: RouteAction },
    RouteDel { pattern: EndpointId, link: LinkId },
    RouteQuery { reply: Option<oneshot::Sender<Vec<(EndpointId, LinkId)>>> },

    // -- Link / Contact --
    LinkCreated { link: LinkId, link_type: LinkType },
    LinkDeleted { link: LinkId },
    LinkAvailable { link: LinkId },
    LinkUnavailable { link: LinkId },
    LinkStateChangeRequest { link: LinkId, target: LinkState },
    LinkReconfigure { link: LinkId },
    LinkQuery { link: LinkId, reply: Option<oneshot::Sender<Option<LinkState>>> },
    ContactUp { link: LinkId, contact: ContactId },
    ContactDown { link: LinkId, contact: ContactId, reason: ContactDownReason },
    ContactOpenFailed { link: LinkId },
    ContactAttribChanged { link: LinkId, contact: ContactId },
    /// An inbound connection arrived for a peer with no pre-configured
    /// link; the CL asks the dispatcher to mint an `Opportunistic` link
    /// before it spawns the connection worker.
    LinkCreateOpportunistic { nexthop: String, clayer: String, reply: Option<oneshot::Sender<LinkId>> },
    /// Primes `link` for an inbound contact that didn't go through
    /// `open_contact`'s `AVAILABLE -> OPENING` dial sequence, so the
    /// `ContactUp` the connection worker is about to emit lands on a link
    /// in `Opening` state instead of being rejected.
    LinkPrepareInbound { link: LinkId, reply: Option<oneshot::Sender<()>> },

    // -- Reassembly --
    ReassemblyCompleted { bundle: Box<Bundle> },

    // -- Custody --
    CustodySignalReceived { bundle_id: BundleId, succeeded: bool, reason: dtn_core::status::ReasonCode },
    CustodyTimeout { bundle_id: BundleId },

    // -- Daemon lifecycle --
    DaemonShutdown,
    DaemonStatus { reply: Option<oneshot::Sender<DaemonStatusReport>> },

    // -- CL management --
    ClParamSet { cl_name: String, key: String, value: String },
    ClQuery { cl_name: String, reply: Option<oneshot::Sender<Option<String>>> },
    ClReport { cl_name: String, report: String },
}

#[derive(Clone, Debug, Default)]
pub struct DaemonStatusReport {
    pub bundle_count: usize,
    pub link_count: usize,
    pub registration_count: usize,
}

/// An event plus its optional completion notifier, for API calls that need
/// a synchronous response (§4.9).
pub struct Envelope {
    pub event: Event,
    pub done: Option<oneshot::Sender<()>>,
}

/// Bounded MPSC queue shared by every event producer (API sessions, CL
/// tasks, timers); the daemon dispatch loop is the single consumer.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Envelope>,
}

pub struct EventReceiver {
    rx: mpsc::Receiver<Envelope>,
}

pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender { tx }, EventReceiver { rx })
}

impl EventSender {
    /// Fire-and-forget push; used by producers that don't need to block on
    /// completion (e.g. a CL task reporting `ContactUp`).
    pub async fn push(&self, event: Event) -> Result<(), mpsc::error::SendError<()>> {
        self.tx
            .send(Envelope { event, done: None })
            .await
            .map_err(|_| mpsc::error::SendError(()))
    }

    /// Pushes an event and waits for the dispatcher to signal completion,
    /// used by the API adapter for synchronous request/response semantics.
    pub async fn push_and_wait(&self, event: Event) -> Result<(), mpsc::error::SendError<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Envelope { event, done: Some(done_tx) })
            .await
            .map_err(|_| mpsc::error::SendError(()))?;
        let _ = done_rx.await;
        Ok(())
    }
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_and_wait_completes_after_dispatcher_signals() {
        let (tx, mut rx) = channel(4);
        let handle = tokio::spawn(async move {
            tx.push_and_wait(Event::DaemonShutdown).await.unwrap();
        });
        let envelope = rx.recv().await.unwrap();
        assert!(matches!(envelope.event, Event::DaemonShutdown));
        if let Some(done) = envelope.done {
            done.send(()).unwrap();
        }
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn fire_and_forget_does_not_block_on_a_reply() {
        let (tx, mut rx) = channel(4);
        tx.push(Event::LinkAvailable { link: 1 }).await.unwrap();
        let envelope = rx.recv().await.unwrap();
        assert!(envelope.done.is_none());
    }
}
