//! Wire-level request/response types for the API adapter (§4.9). These are
//! the msgpack payloads framed by [`crate::wire`]; they mirror the daemon's
//! own types but use plain strings/u32s so the protocol doesn't leak
//! internal representations to clients written in other languages.

use dtn_daemon::{FailureAction, RegId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireFailureAction {
    Drop,
    Defer,
    Exec(String),
}

impl From<WireFailureAction> for FailureAction {
    fn from(action: WireFailureAction) -> Self {
        match action {
            WireFailureAction::Drop => FailureAction::Drop,
            WireFailureAction::Defer => FailureAction::Defer,
            WireFailureAction::Exec(script) => FailureAction::Exec(script),
        }
    }
}

impl From<FailureAction> for WireFailureAction {
    fn from(action: FailureAction) -> Self {
        match action {
            FailureAction::Drop => WireFailureAction::Drop,
            FailureAction::Defer => WireFailureAction::Defer,
            FailureAction::Exec(script) => WireFailureAction::Exec(script),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegInfo {
    pub pattern: String,
    pub failure_action: WireFailureAction,
    pub expiration_secs: u64,
    pub init_passive: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum WirePriority {
    Bulk,
    Normal,
    Expedited,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BundleSpec {
    pub destination: String,
    pub reply_to: Option<String>,
    pub lifetime_secs: u64,
    pub priority: WirePriority,
    pub custody: bool,
    pub delivery_receipt: bool,
    pub do_not_fragment: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireBundle {
    pub source: String,
    pub destination: String,
    pub creation_secs: u64,
    pub creation_seq: u64,
    pub is_fragment: bool,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Open,
    Close,
    LocalEid,
    Register(RegInfo),
    Unregister { regid: RegId },
    FindRegistration { eid: String },
    Bind { regid: RegId },
    Send { bundle: BundleSpec, payload: Vec<u8> },
    Recv { timeout_ms: Option<u64> },
    BeginPoll { timeout_ms: Option<u64> },
    CancelPoll,
}

impl Request {
    /// The type code prefixed on the wire ahead of the msgpack payload,
    /// per §4.9's framing.
    pub fn type_code(&self) -> u32 {
        match self {
            Request::Open => 1,
            Request::Close => 2,
            Request::LocalEid => 3,
            Request::Register(_) => 4,
            Request::Unregister { .. } => 5,
            Request::FindRegistration { .. } => 6,
            Request::Bind { .. } => 7,
            Request::Send { .. } => 8,
            Request::Recv { .. } => 9,
            Request::BeginPoll { .. } => 10,
            Request::CancelPoll => 11,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    LocalEid { eid: String },
    Regid { regid: RegId },
    Found { regid: Option<RegId> },
    Bundle { bundle: Option<WireBundle> },
    Error { code: i32, message: String },
}

impl Response {
    pub fn type_code(&self) -> u32 {
        match self {
            Response::Ok => 1,
            Response::LocalEid { .. } => 2,
            Response::Regid { .. } => 3,
            Response::Found { .. } => 4,
            Response::Bundle { .. } => 5,
            Response::Error { .. } => 6,
        }
    }
}
