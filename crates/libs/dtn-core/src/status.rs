//! Administrative records: status reports and custody signals (§4.1).
//!
//! An administrative record is carried as the payload of a bundle whose
//! `admin_record` processing flag would be set were it represented in the
//! primary-block flag space; this module only concerns itself with the
//! record's own encoding, independent of how the carrying bundle is built
//! (the daemon crate is responsible for wrapping one in a `Bundle`).

use crate::bundle::CreationTimestamp;
use crate::eid::EndpointId;
use crate::error::ParseError;
use crate::sdnv;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReasonCode {
    NoInfo,
    LifetimeExpired,
    ForwardedUnidirLink,
    TransmissionCancelled,
    DepletedStorage,
    EidUnintelligible,
    NoRoute,
    NoTimelyContact,
    BlockUnintelligible,
}

impl ReasonCode {
    fn wire(self) -> u8 {
        match self {
            ReasonCode::NoInfo => 0,
            ReasonCode::LifetimeExpired => 1,
            ReasonCode::ForwardedUnidirLink => 2,
            ReasonCode::TransmissionCancelled => 3,
            ReasonCode::DepletedStorage => 4,
            ReasonCode::EidUnintelligible => 5,
            ReasonCode::NoRoute => 6,
            ReasonCode::NoTimelyContact => 7,
            ReasonCode::BlockUnintelligible => 8,
        }
    }

    fn from_wire(byte: u8) -> Result<Self, ParseError> {
        Ok(match byte {
            0 => ReasonCode::NoInfo,
            1 => ReasonCode::LifetimeExpired,
            2 => ReasonCode::ForwardedUnidirLink,
            3 => ReasonCode::TransmissionCancelled,
            4 => ReasonCode::DepletedStorage,
            5 => ReasonCode::EidUnintelligible,
            6 => ReasonCode::NoRoute,
            7 => ReasonCode::NoTimelyContact,
            8 => ReasonCode::BlockUnintelligible,
            _ => return Err(ParseError::BadFlags),
        })
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct StatusFlags: u8 {
        const RECEIVED          = 1 << 0;
        const CUSTODY_ACCEPTED  = 1 << 1;
        const FORWARDED         = 1 << 2;
        const DELIVERED         = 1 << 3;
        const DELETED           = 1 << 4;
        const ACKED_BY_APP      = 1 << 5;
    }
}

/// One subject-bundle identifier plus optional fragment coordinates, shared
/// by both record kinds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subject {
    pub source: EndpointId,
    pub creation_ts: CreationTimestamp,
    pub fragment_offset_len: Option<(u64, u64)>,
}

#[derive(Clone, Debug)]
pub struct StatusReport {
    pub flags: StatusFlags,
    pub reason: ReasonCode,
    /// One DTN timestamp per set flag, in the fixed order
    /// received/custody-accepted/forwarded/delivered/deleted/acked-by-app.
    pub timestamps: Vec<u64>,
    pub subject: Subject,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CustodySignal {
    pub succeeded: bool,
    pub reason: ReasonCode,
    pub subject: Subject,
}

const RECORD_TYPE_STATUS_REPORT: u8 = 1;
const RECORD_TYPE_CUSTODY_SIGNAL: u8 = 2;

fn encode_subject(subject: &Subject, out: &mut Vec<u8>) {
    let has_fragment = subject.fragment_offset_len.is_some();
    out.push(has_fragment as u8);
    if let Some((offset, len)) = subject.fragment_offset_len {
        sdnv::encode(offset, out);
        sdnv::encode(len, out);
    }
    sdnv::encode(subject.creation_ts.seconds, out);
    sdnv::encode(subject.creation_ts.sequence, out);
    let source = subject.source.to_string();
    sdnv::encode(source.len() as u64, out);
    out.extend_from_slice(source.as_bytes());
}

fn decode_subject(bytes: &[u8]) -> Result<(Subject, usize), ParseError> {
    let has_fragment = *bytes.first().ok_or(ParseError::Short)? != 0;
    let mut pos = 1;
    let fragment_offset_len = if has_fragment {
        let (offset, n) = sdnv::decode(&bytes[pos..])?;
        pos += n;
        let (len, n) = sdnv::decode(&bytes[pos..])?;
        pos += n;
        Some((offset, len))
    } else {
        None
    };
    let (seconds, n) = sdnv::decode(&bytes[pos..])?;
    pos += n;
    let (sequence, n) = sdnv::decode(&bytes[pos..])?;
    pos += n;
    let (source_len, n) = sdnv::decode(&bytes[pos..])?;
    pos += n;
    let source_len = source_len as usize;
    let source_bytes = bytes.get(pos..pos + source_len).ok_or(ParseError::Short)?;
    pos += source_len;
    let source_str = std::str::from_utf8(source_bytes).map_err(|_| ParseError::BadFlags)?;
    let source = EndpointId::parse(source_str).map_err(|_| ParseError::BadFlags)?;
    Ok((
        Subject { source, creation_ts: CreationTimestamp { seconds, sequence }, fragment_offset_len },
        pos,
    ))
}

impl StatusReport {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![RECORD_TYPE_STATUS_REPORT, self.flags.bits(), self.reason.wire()];
        sdnv::encode(self.timestamps.len() as u64, &mut out);
        for ts in &self.timestamps {
            sdnv::encode(*ts, &mut out);
        }
        encode_subject(&self.subject, &mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.first().copied() != Some(RECORD_TYPE_STATUS_REPORT) {
            return Err(ParseError::BadFlags);
        }
        let flags_byte = *bytes.get(1).ok_or(ParseError::Short)?;
        let flags = StatusFlags::from_bits(flags_byte).ok_or(ParseError::BadFlags)?;
        let reason = ReasonCode::from_wire(*bytes.get(2).ok_or(ParseError::Short)?)?;
        let mut pos = 3;
        let (count, n) = sdnv::decode(&bytes[pos..])?;
        pos += n;
        let mut timestamps = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (ts, n) = sdnv::decode(&bytes[pos..])?;
            pos += n;
            timestamps.push(ts);
        }
        let (subject, _) = decode_subject(&bytes[pos..])?;
        Ok(StatusReport { flags, reason, timestamps, subject })
    }
}

impl CustodySignal {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![RECORD_TYPE_CUSTODY_SIGNAL, self.succeeded as u8, self.reason.wire()];
        encode_subject(&self.subject, &mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.first().copied() != Some(RECORD_TYPE_CUSTODY_SIGNAL) {
            return Err(ParseError::BadFlags);
        }
        let succeeded = *bytes.get(1).ok_or(ParseError::Short)? != 0;
        let reason = ReasonCode::from_wire(*bytes.get(2).ok_or(ParseError::Short)?)?;
        let (subject, _) = decode_subject(&bytes[3..])?;
        Ok(CustodySignal { succeeded, reason, subject })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_subject() -> Subject {
        Subject {
            source: EndpointId::parse("dtn://a/app").unwrap(),
            creation_ts: CreationTimestamp { seconds: 42, sequence: 1 },
            fragment_offset_len: None,
        }
    }

    #[test]
    fn status_report_round_trips() {
        let report = StatusReport {
            flags: StatusFlags::DELIVERED | StatusFlags::RECEIVED,
            reason: ReasonCode::NoInfo,
            timestamps: vec![100, 200],
            subject: sample_subject(),
        };
        let encoded = report.encode();
        let decoded = StatusReport::decode(&encoded).unwrap();
        assert_eq!(decoded.flags, report.flags);
        assert_eq!(decoded.timestamps, report.timestamps);
        assert_eq!(decoded.subject.source, report.subject.source);
    }

    #[test]
    fn status_report_with_fragment_subject_round_trips() {
        let mut subject = sample_subject();
        subject.fragment_offset_len = Some((10, 100));
        let report = StatusReport {
            flags: StatusFlags::DELETED,
            reason: ReasonCode::LifetimeExpired,
            timestamps: vec![7],
            subject,
        };
        let decoded = StatusReport::decode(&report.encode()).unwrap();
        assert_eq!(decoded.subject.fragment_offset_len, Some((10, 100)));
    }

    #[test]
    fn custody_signal_round_trips() {
        let signal = CustodySignal { succeeded: true, reason: ReasonCode::NoInfo, subject: sample_subject() };
        let decoded = CustodySignal::decode(&signal.encode()).unwrap();
        assert_eq!(decoded, signal);
    }

    #[test]
    fn custody_signal_failure_carries_reason() {
        let signal =
            CustodySignal { succeeded: false, reason: ReasonCode::DepletedStorage, subject: sample_subject() };
        let decoded = CustodySignal::decode(&signal.encode()).unwrap();
        assert_eq!(decoded.succeeded, false);
        assert_eq!(decoded.reason, ReasonCode::DepletedStorage);
        assert_eq!(decoded.subject.source, signal.subject.source);
    }
}
