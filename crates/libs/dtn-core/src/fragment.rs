//! Proactive fragmentation (§4.1): splitting one bundle into a head and
//! tail fragment at a target size.

use crate::bundle::{Block, BlockFlags, Bundle, FragmentInfo, Payload, PayloadLocation};

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum FragmentError {
    #[error("payload not resident in memory; cannot split")]
    NotInMemory,
    #[error("split point must fall strictly inside the payload")]
    SplitOutOfRange,
    #[error("bundle carries do-not-fragment")]
    DoNotFragment,
}

/// Splits `bundle`'s in-memory payload at `split` bytes, returning
/// `(head, tail)`. `split` is relative to the current payload (i.e. to the
/// already-sent/received portion when called on an in-flight bundle).
///
/// Extension blocks flagged `replicate_in_every_fragment` are copied into
/// both fragments; all others travel only with the head, matching §4.1.
/// `orig_length` is taken from an existing fragment's metadata if `bundle`
/// is already a fragment, otherwise set from `bundle`'s own payload length
/// (first split).
pub fn split(bundle: &Bundle, split: u64) -> Result<(Bundle, Bundle), FragmentError> {
    use crate::bundle::DeliveryOptions;
    if bundle.options.contains(DeliveryOptions::DO_NOT_FRAGMENT) {
        return Err(FragmentError::DoNotFragment);
    }
    let bytes = match &bundle.payload.location {
        PayloadLocation::Memory(bytes) => bytes,
        _ => return Err(FragmentError::NotInMemory),
    };
    let split = split as usize;
    if split == 0 || split >= bytes.len() {
        return Err(FragmentError::SplitOutOfRange);
    }

    let base_offset = bundle.fragment.map(|f| f.offset).unwrap_or(0);
    let orig_length = bundle.fragment.map(|f| f.original_length).unwrap_or(bundle.payload.length);

    let (head_bytes, tail_bytes) = bytes.split_at(split);

    let replicated: Vec<Block> = bundle
        .extensions
        .iter()
        .filter(|b| b.flags.contains(BlockFlags::REPLICATE_IN_EVERY_FRAGMENT))
        .cloned()
        .collect();
    let head_only: Vec<Block> = bundle
        .extensions
        .iter()
        .filter(|b| !b.flags.contains(BlockFlags::REPLICATE_IN_EVERY_FRAGMENT))
        .cloned()
        .collect();

    let mut head = bundle.clone();
    head.fragment = Some(FragmentInfo { offset: base_offset, original_length: orig_length });
    head.payload = Payload::complete_in_memory(head_bytes.to_vec());
    head.extensions = replicated.iter().cloned().chain(head_only).collect();
    head.refcount = 0;

    let mut tail = bundle.clone();
    tail.fragment =
        Some(FragmentInfo { offset: base_offset + split as u64, original_length: orig_length });
    tail.payload = Payload::complete_in_memory(tail_bytes.to_vec());
    tail.extensions = replicated;
    tail.refcount = 0;

    Ok((head, tail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{CreationTimestamp, DeliveryOptions, Priority};
    use crate::eid::EndpointId;

    fn sample(payload: &[u8]) -> Bundle {
        Bundle {
            id: 1,
            source: EndpointId::parse("dtn://a/app").unwrap(),
            destination: EndpointId::parse("dtn://b/app").unwrap(),
            reply_to: EndpointId::null(),
            custodian: EndpointId::null(),
            creation_ts: CreationTimestamp { seconds: 1, sequence: 0 },
            priority: Priority::Normal,
            options: DeliveryOptions::empty(),
            lifetime_secs: 60,
            fragment: None,
            extensions: Vec::new(),
            payload: Payload::complete_in_memory(payload.to_vec()),
            refcount: 1,
        }
    }

    #[test]
    fn split_produces_contiguous_abutting_fragments() {
        let bundle = sample(b"0123456789");
        let (head, tail) = split(&bundle, 4).unwrap();
        assert_eq!(head.fragment.unwrap(), FragmentInfo { offset: 0, original_length: 10 });
        assert_eq!(tail.fragment.unwrap(), FragmentInfo { offset: 4, original_length: 10 });
        match (&head.payload.location, &tail.payload.location) {
            (PayloadLocation::Memory(h), PayloadLocation::Memory(t)) => {
                assert_eq!(h, b"0123");
                assert_eq!(t, b"456789");
            }
            _ => panic!("expected in-memory payloads"),
        }
    }

    #[test]
    fn splitting_a_fragment_again_preserves_original_length() {
        let mut bundle = sample(b"0123456789");
        bundle.fragment = Some(FragmentInfo { offset: 20, original_length: 30 });
        let (head, tail) = split(&bundle, 3).unwrap();
        assert_eq!(head.fragment.unwrap().original_length, 30);
        assert_eq!(tail.fragment.unwrap().original_length, 30);
        assert_eq!(head.fragment.unwrap().offset, 20);
        assert_eq!(tail.fragment.unwrap().offset, 23);
    }

    #[test]
    fn do_not_fragment_is_rejected() {
        let mut bundle = sample(b"0123456789");
        bundle.options = DeliveryOptions::DO_NOT_FRAGMENT;
        assert_eq!(split(&bundle, 4), Err(FragmentError::DoNotFragment));
    }

    #[test]
    fn out_of_range_split_is_rejected() {
        let bundle = sample(b"0123456789");
        assert_eq!(split(&bundle, 0), Err(FragmentError::SplitOutOfRange));
        assert_eq!(split(&bundle, 10), Err(FragmentError::SplitOutOfRange));
    }
}
