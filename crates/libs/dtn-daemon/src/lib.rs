//! Registration table, link/contact state machine, static router, custody
//! subsystem, `ConvergenceLayer` trait, and the single-task event dispatcher
//! — §4.3, §4.4, §4.6, §4.7, §4.8, and §9's `DaemonContext` recommendation.

pub mod convergence_layer;
pub mod custody;
pub mod daemon;
pub mod event;
pub mod ids;
pub mod link;
pub mod persist;
pub mod registration;
pub mod router;

pub use convergence_layer::ConvergenceLayer;
pub use custody::{CustodyParams, CustodyTable};
pub use daemon::{run, DaemonContext};
pub use event::{channel, ContactDownReason, DaemonStatusReport, Envelope, Event, EventReceiver, EventSender};
pub use ids::{ContactId, LinkId, RegId};
pub use link::{Contact, ContactManager, Link, LinkParams, LinkState, LinkType};
pub use registration::{FailureAction, OfferOutcome, Registration, RegistrationTable};
pub use router::{Route, RouteAction, Router};
