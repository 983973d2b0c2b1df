//! Fragment reassembly (§4.1): merging fragments of one original bundle
//! back into a whole, keyed by `(source, creation_ts, orig_length)`.

use crate::bundle::{Bundle, FragmentInfo, Payload, PayloadLocation};
use crate::error::ParseError;

/// A half-open byte range `[start, end)` within the original payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Interval {
    start: u64,
    end: u64,
}

impl Interval {
    fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn adjacent_or_overlapping(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Per-`(source, creation_ts, orig_length)` reassembly state: the set of
/// received byte intervals plus their concatenated bytes.
pub struct ReassemblyBuffer {
    orig_length: u64,
    intervals: Vec<Interval>,
    /// Bytes received so far, sparse-packed in interval order; rebuilt into
    /// a contiguous buffer only once reassembly completes.
    chunks: Vec<(Interval, Vec<u8>)>,
    template: Option<Bundle>,
}

impl ReassemblyBuffer {
    pub fn new(orig_length: u64) -> Self {
        ReassemblyBuffer { orig_length, intervals: Vec::new(), chunks: Vec::new(), template: None }
    }

    /// Merges one fragment's payload into the buffer. Two fragments that
    /// exactly abut are accepted (their union simply extends the covered
    /// range); an overlapping fragment is rejected as malformed, per §8's
    /// boundary cases.
    pub fn add_fragment(&mut self, bundle: &Bundle) -> Result<(), ParseError> {
        let Some(FragmentInfo { offset, original_length }) = bundle.fragment else {
            return Err(ParseError::BadFlags);
        };
        if original_length != self.orig_length {
            return Err(ParseError::BadFlags);
        }
        let bytes = match &bundle.payload.location {
            PayloadLocation::Memory(bytes) => bytes.clone(),
            _ => return Err(ParseError::BadFlags),
        };
        let incoming = Interval { start: offset, end: offset + bytes.len() as u64 };

        for existing in &self.intervals {
            if existing.overlaps(&incoming) {
                return Err(ParseError::OverlappingFragment);
            }
        }

        self.intervals.push(incoming);
        self.chunks.push((incoming, bytes));
        // The head fragment (offset 0) carries the non-replicated extension
        // blocks; prefer it as the template once seen, per §4.1.
        if self.template.is_none() || offset == 0 {
            self.template = Some(bundle.clone());
        }
        self.merge_intervals();
        Ok(())
    }

    fn merge_intervals(&mut self) {
        self.intervals.sort_by_key(|i| i.start);
        let mut merged: Vec<Interval> = Vec::new();
        for iv in &self.intervals {
            if let Some(last) = merged.last_mut() {
                if last.adjacent_or_overlapping(iv) {
                    last.end = last.end.max(iv.end);
                    continue;
                }
            }
            merged.push(*iv);
        }
        self.intervals = merged;
    }

    /// `true` once the union of received intervals is exactly `[0,
    /// orig_length)`.
    pub fn is_complete(&self) -> bool {
        self.intervals.len() == 1
            && self.intervals[0].start == 0
            && self.intervals[0].end == self.orig_length
    }

    /// Assembles the complete payload and a bundle carrying it, consuming
    /// the buffer. Panics (via `expect`) if called before `is_complete()`;
    /// callers are expected to check first, matching the single call site
    /// in the daemon's reassembly-completed handler.
    pub fn assemble(mut self) -> Bundle {
        assert!(self.is_complete(), "assemble called on an incomplete reassembly buffer");
        self.chunks.sort_by_key(|(iv, _)| iv.start);
        let mut out = Vec::with_capacity(self.orig_length as usize);
        for (_, bytes) in self.chunks {
            out.extend_from_slice(&bytes);
        }
        let mut bundle = self.template.take().expect("fragment added before assembly");
        bundle.fragment = None;
        bundle.payload = Payload::complete_in_memory(out);
        bundle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{CreationTimestamp, DeliveryOptions, Priority};
    use crate::eid::EndpointId;

    fn fragment(offset: u64, orig_len: u64, bytes: &[u8]) -> Bundle {
        Bundle {
            id: 0,
            source: EndpointId::parse("dtn://a/app").unwrap(),
            destination: EndpointId::parse("dtn://b/app").unwrap(),
            reply_to: EndpointId::null(),
            custodian: EndpointId::null(),
            creation_ts: CreationTimestamp { seconds: 1, sequence: 0 },
            priority: Priority::Normal,
            options: DeliveryOptions::empty(),
            lifetime_secs: 60,
            fragment: Some(FragmentInfo { offset, original_length: orig_len }),
            extensions: Vec::new(),
            payload: Payload::complete_in_memory(bytes.to_vec()),
            refcount: 1,
        }
    }

    #[test]
    fn two_abutting_fragments_reassemble() {
        let mut buf = ReassemblyBuffer::new(10);
        buf.add_fragment(&fragment(0, 10, b"01234")).unwrap();
        assert!(!buf.is_complete());
        buf.add_fragment(&fragment(5, 10, b"56789")).unwrap();
        assert!(buf.is_complete());
        let assembled = buf.assemble();
        match assembled.payload.location {
            PayloadLocation::Memory(bytes) => assert_eq!(bytes, b"0123456789"),
            _ => panic!("expected memory payload"),
        }
    }

    #[test]
    fn overlapping_fragment_is_rejected() {
        let mut buf = ReassemblyBuffer::new(10);
        buf.add_fragment(&fragment(0, 10, b"01234")).unwrap();
        let err = buf.add_fragment(&fragment(3, 10, b"3456")).unwrap_err();
        assert_eq!(err, ParseError::OverlappingFragment);
    }

    #[test]
    fn three_fragments_out_of_order_reassemble() {
        let mut buf = ReassemblyBuffer::new(9);
        buf.add_fragment(&fragment(6, 9, b"ghi")).unwrap();
        buf.add_fragment(&fragment(0, 9, b"abc")).unwrap();
        buf.add_fragment(&fragment(3, 9, b"def")).unwrap();
        assert!(buf.is_complete());
        match buf.assemble().payload.location {
            PayloadLocation::Memory(bytes) => assert_eq!(bytes, b"abcdefghi"),
            _ => panic!("expected memory payload"),
        }
    }
}
