//! The in-memory bundle record (§3).

use std::path::PathBuf;

use crate::eid::EndpointId;

/// Process-local integer id; never transmitted on the wire.
pub type BundleId = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Priority {
    Bulk,
    Normal,
    Expedited,
    Reserved,
}

impl Priority {
    pub fn wire_bits(self) -> u8 {
        match self {
            Priority::Bulk => 0b00,
            Priority::Normal => 0b01,
            Priority::Expedited => 0b10,
            Priority::Reserved => 0b11,
        }
    }

    pub fn from_wire_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Priority::Bulk,
            0b01 => Priority::Normal,
            0b10 => Priority::Expedited,
            _ => Priority::Reserved,
        }
    }
}

bitflags::bitflags! {
    /// Delivery-option bitset from §3, pinned to the primary-block flag
    /// layout in SPEC_FULL.md's "wire layout pinning" section.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
    pub struct DeliveryOptions: u32 {
        const ADMIN_RECORD          = 1 << 1;
        const CUSTODY               = 1 << 3;
        const DELIVERY_RECEIPT       = 1 << 17;
        const RECEIVE_RECEIPT        = 1 << 15;
        const FORWARD_RECEIPT        = 1 << 16;
        const CUSTODY_RECEIPT        = 1 << 14;
        const DELETION_RECEIPT       = 1 << 18;
        const SINGLETON_DESTINATION  = 1 << 4;
        const DO_NOT_FRAGMENT        = 1 << 2;
    }
}

/// A `(source, creation_timestamp)` pair, the transmitted identity of a
/// bundle (§3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CreationTimestamp {
    pub seconds: u64,
    pub sequence: u64,
}

/// One extension or payload block: type, processing-control flags, opaque
/// bytes (§4.1).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub block_type: BlockType,
    pub flags: BlockFlags,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BlockType {
    Payload,
    Unknown(u8),
}

impl BlockType {
    pub const PAYLOAD_WIRE: u8 = 1;
    pub const UNKNOWN_WIRE: u8 = 0xFF;

    pub fn wire_byte(self) -> u8 {
        match self {
            BlockType::Payload => Self::PAYLOAD_WIRE,
            BlockType::Unknown(_) => Self::UNKNOWN_WIRE,
        }
    }

    pub fn from_wire_byte(byte: u8) -> Self {
        match byte {
            Self::PAYLOAD_WIRE => BlockType::Payload,
            other => BlockType::Unknown(other),
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
    pub struct BlockFlags: u32 {
        const REPLICATE_IN_EVERY_FRAGMENT        = 1 << 0;
        const TRANSMIT_STATUS_IF_CANNOT_PROCESS  = 1 << 1;
        const DELETE_BUNDLE_IF_CANNOT_PROCESS     = 1 << 2;
        const LAST_BLOCK                          = 1 << 3;
        const DISCARD_IF_CANNOT_PROCESS           = 1 << 4;
        const FORWARDED_WITHOUT_BEING_PROCESSED   = 1 << 5;
    }
}

/// Where payload bytes live, per §3's three storage modes.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum PayloadLocation {
    Memory(Vec<u8>),
    File(PathBuf),
    NoData,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Payload {
    /// Declared total length from the header.
    pub length: u64,
    /// Bytes actually received so far; equals `length` once complete.
    pub received_length: u64,
    pub location: PayloadLocation,
}

impl Payload {
    pub fn complete_in_memory(bytes: Vec<u8>) -> Self {
        let length = bytes.len() as u64;
        Payload { length, received_length: length, location: PayloadLocation::Memory(bytes) }
    }

    pub fn is_complete(&self) -> bool {
        self.received_length == self.length
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FragmentInfo {
    pub offset: u64,
    pub original_length: u64,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Bundle {
    pub id: BundleId,
    pub source: EndpointId,
    pub destination: EndpointId,
    pub reply_to: EndpointId,
    pub custodian: EndpointId,
    pub creation_ts: CreationTimestamp,
    pub priority: Priority,
    pub options: DeliveryOptions,
    /// Seconds after `creation_ts.seconds` at which the bundle expires.
    pub lifetime_secs: u64,
    pub fragment: Option<FragmentInfo>,
    pub extensions: Vec<Block>,
    pub payload: Payload,
    /// Count of queues (link pending queues, registration FIFOs) currently
    /// holding a reference to this bundle; it is freed only once this drops
    /// to zero and it has been fully delivered/forwarded.
    pub refcount: u32,
}

impl Bundle {
    pub fn is_fragment(&self) -> bool {
        self.fragment.is_some()
    }

    /// Wall-clock expiry, in the same units as `creation_ts.seconds`.
    pub fn expires_at(&self) -> u64 {
        self.creation_ts.seconds.saturating_add(self.lifetime_secs)
    }

    pub fn is_expired_at(&self, now_secs: u64) -> bool {
        now_secs >= self.expires_at()
    }

    /// Identity used for reassembly and delivery dedup: `(source,
    /// creation_ts, frag_offset, orig_length)` per §8's idempotent-delivery
    /// law. Non-fragments use offset 0 and their own payload length.
    pub fn dedup_key(&self) -> (EndpointId, CreationTimestamp, u64, u64) {
        match self.fragment {
            Some(f) => (self.source.clone(), self.creation_ts, f.offset, f.original_length),
            None => (self.source.clone(), self.creation_ts, 0, self.payload.length),
        }
    }
}
