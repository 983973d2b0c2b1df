//! Bundle data model, wire codec, fragmentation/reassembly, and status
//! reports — the core covered by §3 and §4.1 of the router specification.

pub mod bundle;
pub mod codec;
pub mod eid;
pub mod error;
pub mod fragment;
pub mod reassembly;
pub mod sdnv;
pub mod status;

pub use bundle::{
    Block, BlockFlags, BlockType, Bundle, BundleId, CreationTimestamp, DeliveryOptions,
    FragmentInfo, Payload, PayloadLocation, Priority,
};
pub use eid::EndpointId;
pub use error::{DtnError, DtnResult, ParseError};
