//! Bundle Protocol wire codec (§4.1): primary block, extension blocks,
//! dictionary-compressed EIDs, and the payload block.

use std::collections::BTreeMap;

use crate::bundle::{
    Block, BlockFlags, BlockType, Bundle, CreationTimestamp, DeliveryOptions, FragmentInfo,
    Payload, PayloadLocation, Priority,
};
use crate::eid::EndpointId;
use crate::error::ParseError;
use crate::sdnv;

const VERSION: u8 = 0x04;

const FLAG_IS_FRAGMENT: u32 = 1 << 0;
const FLAG_ADMIN_RECORD: u32 = 1 << 1;
const FLAG_DO_NOT_FRAGMENT: u32 = 1 << 2;
const FLAG_CUSTODY_REQUESTED: u32 = 1 << 3;
const FLAG_SINGLETON_DESTINATION: u32 = 1 << 4;
const FLAG_ACKED_BY_APP: u32 = 1 << 5;
const PRIORITY_SHIFT: u32 = 9;
const PRIORITY_MASK: u32 = 0b11 << PRIORITY_SHIFT;
const FLAG_CUSTODY_RECEIPT: u32 = 1 << 14;
const FLAG_RECEIVE_RECEIPT: u32 = 1 << 15;
const FLAG_FORWARD_RECEIPT: u32 = 1 << 16;
const FLAG_DELIVERY_RECEIPT: u32 = 1 << 17;
const FLAG_DELETION_RECEIPT: u32 = 1 << 18;

const KNOWN_FLAG_MASK: u32 = FLAG_IS_FRAGMENT
    | FLAG_ADMIN_RECORD
    | FLAG_DO_NOT_FRAGMENT
    | FLAG_CUSTODY_REQUESTED
    | FLAG_SINGLETON_DESTINATION
    | FLAG_ACKED_BY_APP
    | PRIORITY_MASK
    | FLAG_CUSTODY_RECEIPT
    | FLAG_RECEIVE_RECEIPT
    | FLAG_FORWARD_RECEIPT
    | FLAG_DELIVERY_RECEIPT
    | FLAG_DELETION_RECEIPT;

/// A packed, deduplicated byte array of null-terminated `scheme` and `ssp`
/// strings, plus the `(scheme_offset, ssp_offset)` pair for each distinct
/// EID — the dictionary described in §4.1.
struct Dictionary {
    bytes: Vec<u8>,
    offsets: BTreeMap<String, usize>,
}

impl Dictionary {
    fn new() -> Self {
        Dictionary { bytes: Vec::new(), offsets: BTreeMap::new() }
    }

    fn intern(&mut self, s: &str) -> usize {
        if let Some(&off) = self.offsets.get(s) {
            return off;
        }
        let off = self.bytes.len();
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(s.to_string(), off);
        off
    }

    fn eid_offsets(&mut self, eid: &EndpointId) -> (usize, usize) {
        (self.intern(eid.scheme()), self.intern(eid.ssp()))
    }

    fn read_cstr(bytes: &[u8], offset: usize) -> Result<&str, ParseError> {
        let tail = bytes.get(offset..).ok_or(ParseError::BadDict)?;
        let end = tail.iter().position(|&b| b == 0).ok_or(ParseError::BadDict)?;
        std::str::from_utf8(&tail[..end]).map_err(|_| ParseError::BadDict)
    }
}

fn encode_eid_ref(scheme_off: usize, ssp_off: usize, out: &mut Vec<u8>) {
    sdnv::encode(scheme_off as u64, out);
    sdnv::encode(ssp_off as u64, out);
}

fn decode_eid_ref(bytes: &[u8], dict: &[u8]) -> Result<(EndpointId, usize), ParseError> {
    let (scheme_off, n1) = sdnv::decode(bytes)?;
    let (ssp_off, n2) = sdnv::decode(&bytes[n1..])?;
    let scheme = Dictionary::read_cstr(dict, scheme_off as usize)?;
    let ssp = Dictionary::read_cstr(dict, ssp_off as usize)?;
    let eid = EndpointId::parse(&format!("{scheme}:{ssp}")).map_err(|_| ParseError::BadDict)?;
    Ok((eid, n1 + n2))
}

/// Encodes `bundle` into its canonical wire representation.
pub fn format(bundle: &Bundle) -> Vec<u8> {
    let mut dict = Dictionary::new();
    let dest = dict.eid_offsets(&bundle.destination);
    let source = dict.eid_offsets(&bundle.source);
    let reply_to = dict.eid_offsets(&bundle.reply_to);
    let custodian = dict.eid_offsets(&bundle.custodian);

    let mut flags: u32 = 0;
    if bundle.is_fragment() {
        flags |= FLAG_IS_FRAGMENT;
    }
    if bundle.options.contains(DeliveryOptions::ADMIN_RECORD) {
        flags |= FLAG_ADMIN_RECORD;
    }
    if bundle.options.contains(DeliveryOptions::DO_NOT_FRAGMENT) {
        flags |= FLAG_DO_NOT_FRAGMENT;
    }
    if bundle.options.contains(DeliveryOptions::CUSTODY) {
        flags |= FLAG_CUSTODY_REQUESTED;
    }
    if bundle.options.contains(DeliveryOptions::SINGLETON_DESTINATION) {
        flags |= FLAG_SINGLETON_DESTINATION;
    }
    if bundle.options.contains(DeliveryOptions::CUSTODY_RECEIPT) {
        flags |= FLAG_CUSTODY_RECEIPT;
    }
    if bundle.options.contains(DeliveryOptions::RECEIVE_RECEIPT) {
        flags |= FLAG_RECEIVE_RECEIPT;
    }
    if bundle.options.contains(DeliveryOptions::FORWARD_RECEIPT) {
        flags |= FLAG_FORWARD_RECEIPT;
    }
    if bundle.options.contains(DeliveryOptions::DELIVERY_RECEIPT) {
        flags |= FLAG_DELIVERY_RECEIPT;
    }
    if bundle.options.contains(DeliveryOptions::DELETION_RECEIPT) {
        flags |= FLAG_DELETION_RECEIPT;
    }
    flags |= (bundle.priority.wire_bits() as u32) << PRIORITY_SHIFT;

    let mut primary_body = Vec::new();
    sdnv::encode(dict.bytes.len() as u64, &mut primary_body);
    primary_body.extend_from_slice(&dict.bytes);
    encode_eid_ref(dest.0, dest.1, &mut primary_body);
    encode_eid_ref(source.0, source.1, &mut primary_body);
    encode_eid_ref(reply_to.0, reply_to.1, &mut primary_body);
    encode_eid_ref(custodian.0, custodian.1, &mut primary_body);
    sdnv::encode(bundle.creation_ts.seconds, &mut primary_body);
    sdnv::encode(bundle.creation_ts.sequence, &mut primary_body);
    sdnv::encode(bundle.lifetime_secs, &mut primary_body);
    if let Some(frag) = bundle.fragment {
        sdnv::encode(frag.offset, &mut primary_body);
        sdnv::encode(frag.original_length, &mut primary_body);
    }

    let mut out = Vec::new();
    out.push(VERSION);
    sdnv::encode(flags as u64, &mut out);
    sdnv::encode(primary_body.len() as u64, &mut out);
    out.extend_from_slice(&primary_body);

    // Extension blocks, then the payload block last (so it carries
    // `LAST_BLOCK`), matching the encoder contract in §4.1.
    for block in &bundle.extensions {
        encode_block(block.block_type, block.flags, &block.data, &mut out);
    }

    let payload_bytes = match &bundle.payload.location {
        PayloadLocation::Memory(bytes) => bytes.clone(),
        PayloadLocation::File(_) | PayloadLocation::NoData => Vec::new(),
    };
    encode_block(
        BlockType::Payload,
        BlockFlags::LAST_BLOCK,
        &payload_bytes,
        &mut out,
    );

    out
}

fn encode_block(block_type: BlockType, flags: BlockFlags, data: &[u8], out: &mut Vec<u8>) {
    out.push(block_type.wire_byte());
    sdnv::encode(flags.bits() as u64, out);
    sdnv::encode(data.len() as u64, out);
    out.extend_from_slice(data);
}

/// Parses a complete bundle from `bytes`, returning it and the number of
/// bytes consumed (§4.1 decoder contract).
pub fn parse(bytes: &[u8]) -> Result<(Bundle, usize), ParseError> {
    let (header, header_len) = parse_header(bytes)?;
    let rest = &bytes[header_len..];
    let (block_type_byte, flags_bits, data, block_len) = parse_one_block(rest)?;
    if BlockType::from_wire_byte(block_type_byte) != BlockType::Payload {
        return Err(ParseError::BadFlags);
    }
    let _ = flags_bits;
    let bundle = header.into_bundle(Payload::complete_in_memory(data.to_vec()));
    Ok((bundle, header_len + block_len))
}

/// Decoded primary-block fields plus any extension blocks, without
/// requiring the payload to be fully present — the "partial parse" support
/// for streaming receivers described in §4.1.
pub struct BundleHeader {
    pub source: EndpointId,
    pub destination: EndpointId,
    pub reply_to: EndpointId,
    pub custodian: EndpointId,
    pub creation_ts: CreationTimestamp,
    pub priority: Priority,
    pub options: DeliveryOptions,
    pub lifetime_secs: u64,
    pub fragment: Option<FragmentInfo>,
    pub extensions: Vec<Block>,
    /// Declared length of the payload block's data, read from its header
    /// before the data itself has necessarily arrived.
    pub payload_length: u64,
}

impl BundleHeader {
    fn into_bundle(self, payload: Payload) -> Bundle {
        Bundle {
            id: 0,
            source: self.source,
            destination: self.destination,
            reply_to: self.reply_to,
            custodian: self.custodian,
            creation_ts: self.creation_ts,
            priority: self.priority,
            options: self.options,
            lifetime_secs: self.lifetime_secs,
            fragment: self.fragment,
            extensions: self.extensions,
            payload,
            refcount: 0,
        }
    }
}

/// Parses the primary block and any extension blocks, stopping just before
/// the payload block's data bytes. Returns the header plus the number of
/// bytes consumed up to (and including) the payload block's own length
/// prefix, so a caller can start forwarding header+prefix while the payload
/// streams in.
pub fn parse_header(bytes: &[u8]) -> Result<(BundleHeader, usize), ParseError> {
    let version = *bytes.first().ok_or(ParseError::Short)?;
    if version != VERSION {
        return Err(ParseError::BadVersion);
    }
    let mut pos = 1;
    let (flags, n) = sdnv::decode(&bytes[pos..])?;
    pos += n;
    if flags > u32::MAX as u64 || (flags as u32) & !KNOWN_FLAG_MASK != 0 {
        return Err(ParseError::BadFlags);
    }
    let flags = flags as u32;
    let (block_len, n) = sdnv::decode(&bytes[pos..])?;
    pos += n;
    let block_len = block_len as usize;
    let primary_body = bytes.get(pos..pos + block_len).ok_or(ParseError::Short)?;

    let mut bp = 0usize;
    let (dict_len, n) = sdnv::decode(&primary_body[bp..])?;
    bp += n;
    let dict_len = dict_len as usize;
    let dict = primary_body.get(bp..bp + dict_len).ok_or(ParseError::Short)?;
    bp += dict_len;

    let (destination, n) = decode_eid_ref(&primary_body[bp..], dict)?;
    bp += n;
    let (source, n) = decode_eid_ref(&primary_body[bp..], dict)?;
    bp += n;
    let (reply_to, n) = decode_eid_ref(&primary_body[bp..], dict)?;
    bp += n;
    let (custodian, n) = decode_eid_ref(&primary_body[bp..], dict)?;
    bp += n;

    let (creation_secs, n) = sdnv::decode(&primary_body[bp..])?;
    bp += n;
    let (creation_seq, n) = sdnv::decode(&primary_body[bp..])?;
    bp += n;
    let (lifetime_secs, n) = sdnv::decode(&primary_body[bp..])?;
    bp += n;

    let is_fragment = flags & FLAG_IS_FRAGMENT != 0;
    let fragment = if is_fragment {
        let (offset, n) = sdnv::decode(&primary_body[bp..])?;
        bp += n;
        let (original_length, n) = sdnv::decode(&primary_body[bp..])?;
        bp += n;
        Some(FragmentInfo { offset, original_length })
    } else {
        None
    };
    let _ = bp;

    pos += block_len;

    let mut options = DeliveryOptions::empty();
    options.set(DeliveryOptions::ADMIN_RECORD, flags & FLAG_ADMIN_RECORD != 0);
    options.set(DeliveryOptions::DO_NOT_FRAGMENT, flags & FLAG_DO_NOT_FRAGMENT != 0);
    options.set(DeliveryOptions::CUSTODY, flags & FLAG_CUSTODY_REQUESTED != 0);
    options.set(
        DeliveryOptions::SINGLETON_DESTINATION,
        flags & FLAG_SINGLETON_DESTINATION != 0,
    );
    options.set(DeliveryOptions::CUSTODY_RECEIPT, flags & FLAG_CUSTODY_RECEIPT != 0);
    options.set(DeliveryOptions::RECEIVE_RECEIPT, flags & FLAG_RECEIVE_RECEIPT != 0);
    options.set(DeliveryOptions::FORWARD_RECEIPT, flags & FLAG_FORWARD_RECEIPT != 0);
    options.set(DeliveryOptions::DELIVERY_RECEIPT, flags & FLAG_DELIVERY_RECEIPT != 0);
    options.set(DeliveryOptions::DELETION_RECEIPT, flags & FLAG_DELETION_RECEIPT != 0);
    let priority = Priority::from_wire_bits(((flags & PRIORITY_MASK) >> PRIORITY_SHIFT) as u8);

    let mut extensions = Vec::new();
    loop {
        let (type_byte, block_flags_bits, data, consumed) = parse_one_block(&bytes[pos..])?;
        let block_type = BlockType::from_wire_byte(type_byte);
        let block_flags = BlockFlags::from_bits_truncate(block_flags_bits);
        if block_type == BlockType::Payload {
            let payload_length = data.len() as u64;
            return Ok((
                BundleHeader {
                    source,
                    destination,
                    reply_to,
                    custodian,
                    creation_ts: CreationTimestamp { seconds: creation_secs, sequence: creation_seq },
                    priority,
                    options,
                    lifetime_secs,
                    fragment,
                    extensions,
                    payload_length,
                },
                pos,
            ));
        }
        extensions.push(Block { block_type, flags: block_flags, data: data.to_vec() });
        pos += consumed;
        if block_flags.contains(BlockFlags::LAST_BLOCK) {
            return Err(ParseError::BadFlags);
        }
    }
}

/// Parses one `(type, flags, length, data)` block starting at the front of
/// `bytes`. Returns `(type_byte, flags_bits, data_slice, total_consumed)`.
fn parse_one_block(bytes: &[u8]) -> Result<(u8, u32, &[u8], usize), ParseError> {
    let type_byte = *bytes.first().ok_or(ParseError::Short)?;
    let mut pos = 1;
    let (flags, n) = sdnv::decode(&bytes[pos..])?;
    pos += n;
    if flags > u32::MAX as u64 {
        return Err(ParseError::BadFlags);
    }
    let (len, n) = sdnv::decode(&bytes[pos..])?;
    pos += n;
    let len = len as usize;
    let data = bytes.get(pos..pos + len).ok_or(ParseError::Short)?;
    pos += len;
    Ok((type_byte, flags as u32, data, pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Payload;

    fn sample_bundle(payload: &[u8]) -> Bundle {
        Bundle {
            id: 0,
            source: EndpointId::parse("dtn://a/app").unwrap(),
            destination: EndpointId::parse("dtn://b/app").unwrap(),
            reply_to: EndpointId::null(),
            custodian: EndpointId::null(),
            creation_ts: CreationTimestamp { seconds: 1000, sequence: 0 },
            priority: Priority::Expedited,
            options: DeliveryOptions::CUSTODY | DeliveryOptions::SINGLETON_DESTINATION,
            lifetime_secs: 3600,
            fragment: None,
            extensions: Vec::new(),
            payload: Payload::complete_in_memory(payload.to_vec()),
            refcount: 0,
        }
    }

    #[test]
    fn round_trip_preserves_header_fields_and_payload() {
        let bundle = sample_bundle(b"hello");
        let wire = format(&bundle);
        let (decoded, consumed) = parse(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(decoded.source, bundle.source);
        assert_eq!(decoded.destination, bundle.destination);
        assert_eq!(decoded.creation_ts, bundle.creation_ts);
        assert_eq!(decoded.priority, bundle.priority);
        assert_eq!(decoded.options, bundle.options);
        assert_eq!(decoded.lifetime_secs, bundle.lifetime_secs);
        match &decoded.payload.location {
            PayloadLocation::Memory(bytes) => assert_eq!(bytes, b"hello"),
            _ => panic!("expected in-memory payload"),
        }
    }

    #[test]
    fn round_trip_zero_length_payload() {
        let bundle = sample_bundle(b"");
        let wire = format(&bundle);
        let (decoded, _) = parse(&wire).unwrap();
        assert_eq!(decoded.payload.length, 0);
    }

    #[test]
    fn dictionary_dedups_repeated_scheme() {
        let mut bundle = sample_bundle(b"x");
        bundle.destination = EndpointId::parse("dtn://a/other").unwrap();
        let wire = format(&bundle);
        let (decoded, _) = parse(&wire).unwrap();
        assert_eq!(decoded.source.scheme(), "dtn");
        assert_eq!(decoded.destination.scheme(), "dtn");
    }

    #[test]
    fn admin_record_flag_round_trips() {
        let mut bundle = sample_bundle(b"status report bytes");
        bundle.options |= DeliveryOptions::ADMIN_RECORD;
        let wire = format(&bundle);
        let (decoded, _) = parse(&wire).unwrap();
        assert!(decoded.options.contains(DeliveryOptions::ADMIN_RECORD));
    }

    #[test]
    fn fragment_offsets_round_trip() {
        let mut bundle = sample_bundle(b"abcdef");
        bundle.fragment = Some(FragmentInfo { offset: 6, original_length: 12 });
        let wire = format(&bundle);
        let (decoded, _) = parse(&wire).unwrap();
        assert_eq!(decoded.fragment, Some(FragmentInfo { offset: 6, original_length: 12 }));
    }

    #[test]
    fn parse_header_reports_payload_length_before_reading_payload() {
        let bundle = sample_bundle(b"0123456789");
        let wire = format(&bundle);
        let (header, _header_len) = parse_header(&wire).unwrap();
        assert_eq!(header.payload_length, 10);
    }

    #[test]
    fn short_input_is_rejected() {
        let bundle = sample_bundle(b"hello");
        let wire = format(&bundle);
        let truncated = &wire[..wire.len() - 1];
        assert!(parse(truncated).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let bundle = sample_bundle(b"hello");
        let mut wire = format(&bundle);
        wire[0] = 0x99;
        assert_eq!(parse(&wire), Err(ParseError::BadVersion));
    }
}
