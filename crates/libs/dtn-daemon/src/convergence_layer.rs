//! The `ConvergenceLayer` trait (§4.5, §9): the seam between the daemon and
//! a concrete transport implementation such as `dtn-cl-tcp`.

use async_trait::async_trait;
use dtn_core::{Bundle, DtnResult};

use crate::ids::{ContactId, LinkId};
use crate::link::LinkParams;

/// Implemented once per transport. All methods are async because opening a
/// link or sending a bundle may involve real I/O; the daemon invokes these
/// from its single event-dispatch task and treats them as fire-and-forget
/// (results come back as events through the shared event queue), matching
/// the "CL reports back via events, never by blocking the dispatcher"
/// invariant in §4.8.
#[async_trait]
pub trait ConvergenceLayer: Send + Sync {
    /// Human-readable name, e.g. `"tcp"`.
    fn name(&self) -> &str;

    /// Bring an interface (listening side) up given its config string.
    async fn interface_up(&self, local_spec: &str) -> DtnResult<()>;

    /// Tear an interface down.
    async fn interface_down(&self, local_spec: &str) -> DtnResult<()>;

    /// Initializes per-link CL state ahead of any contact attempt. `params`
    /// carries the link's tunables (block length, keepalive, reactive
    /// fragmentation, ...) so the CL doesn't have to fall back to its own
    /// defaults for a link the daemon already configured.
    async fn init_link(&self, link: LinkId, nexthop: &str, params: LinkParams) -> DtnResult<()>;

    /// Attempts to open a contact for `link`. Success/failure is reported
    /// asynchronously via `ContactUp`/`ContactDown`-equivalent events, not
    /// this call's return value, which only reports whether the attempt was
    /// accepted for processing.
    async fn open_contact(&self, link: LinkId) -> DtnResult<()>;

    /// Requests the contact for `link` be closed.
    async fn close_contact(&self, link: LinkId, contact: ContactId) -> DtnResult<()>;

    /// Hands a bundle to the CL for transmission over an open contact.
    /// Completion (success, failure, or partial send under reactive
    /// fragmentation) is reported via events.
    async fn send_bundle(&self, contact: ContactId, bundle: Bundle) -> DtnResult<()>;

    /// Requests in-flight transmission of `bundle` be cancelled.
    async fn cancel_bundle(&self, contact: ContactId, bundle_id: dtn_core::BundleId) -> DtnResult<()>;
}
