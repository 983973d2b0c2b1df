//! Contact header negotiation (§4.5): the fixed handshake exchanged by
//! both sides immediately after the socket is established.

use dtn_core::error::ParseError;

pub const MAGIC: [u8; 4] = *b"dtn!";
pub const VERSION: u8 = 1;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ContactHeaderFlags: u8 {
        const BLOCK_ACK_ENABLED      = 1 << 0;
        const REACTIVE_FRAG_ENABLED  = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ContactHeader {
    pub version: u8,
    pub flags: ContactHeaderFlags,
    pub keepalive_interval_secs: u16,
}

impl ContactHeader {
    pub const WIRE_LEN: usize = 4 + 1 + 1 + 2;

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&MAGIC);
        out[4] = self.version;
        out[5] = self.flags.bits();
        out[6..8].copy_from_slice(&self.keepalive_interval_secs.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < Self::WIRE_LEN {
            return Err(ParseError::Short);
        }
        if bytes[0..4] != MAGIC {
            return Err(ParseError::BadFlags);
        }
        let version = bytes[4];
        let flags = ContactHeaderFlags::from_bits(bytes[5]).ok_or(ParseError::BadFlags)?;
        let keepalive_interval_secs = u16::from_be_bytes([bytes[6], bytes[7]]);
        Ok(ContactHeader { version, flags, keepalive_interval_secs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let header = ContactHeader {
            version: VERSION,
            flags: ContactHeaderFlags::BLOCK_ACK_ENABLED | ContactHeaderFlags::REACTIVE_FRAG_ENABLED,
            keepalive_interval_secs: 10,
        };
        let decoded = ContactHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = [0u8; ContactHeader::WIRE_LEN];
        bytes[0..4].copy_from_slice(b"xxxx");
        assert_eq!(ContactHeader::decode(&bytes), Err(ParseError::BadFlags));
    }

    #[test]
    fn rejects_short_input() {
        assert_eq!(ContactHeader::decode(&[0u8; 3]), Err(ParseError::Short));
    }
}
