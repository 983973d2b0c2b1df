//! Durable-store key encoding and row (de)serialization for bundles and
//! registrations (§4.2), mirroring the `rmp-serde` wire convention used
//! elsewhere in the workspace for the daemon's own `Table::Bundles` and
//! `Table::Registrations` rows.

use dtn_core::{Bundle, BundleId};
use dtn_store::StoreError;

use crate::ids::RegId;
use crate::registration::Registration;

pub fn bundle_key(id: BundleId) -> Vec<u8> {
    format!("bundle:{id}").into_bytes()
}

pub fn registration_key(regid: RegId) -> Vec<u8> {
    format!("reg:{regid}").into_bytes()
}

pub fn encode_bundle(bundle: &Bundle) -> Result<Vec<u8>, StoreError> {
    rmp_serde::to_vec_named(bundle).map_err(|err| StoreError::Codec(err.to_string()))
}

pub fn decode_bundle(bytes: &[u8]) -> Result<Bundle, StoreError> {
    rmp_serde::from_slice(bytes).map_err(|err| StoreError::Codec(err.to_string()))
}

pub fn encode_registration(reg: &Registration) -> Result<Vec<u8>, StoreError> {
    rmp_serde::to_vec_named(reg).map_err(|err| StoreError::Codec(err.to_string()))
}

pub fn decode_registration(bytes: &[u8]) -> Result<Registration, StoreError> {
    rmp_serde::from_slice(bytes).map_err(|err| StoreError::Codec(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::FailureAction;
    use dtn_core::{CreationTimestamp, DeliveryOptions, EndpointId, Payload, Priority};

    fn sample_bundle() -> Bundle {
        Bundle {
            id: 7,
            source: EndpointId::parse("dtn://a/app").unwrap(),
            destination: EndpointId::parse("dtn://b/app").unwrap(),
            reply_to: EndpointId::null(),
            custodian: EndpointId::null(),
            creation_ts: CreationTimestamp { seconds: 1, sequence: 0 },
            priority: Priority::Normal,
            options: DeliveryOptions::CUSTODY,
            lifetime_secs: 3600,
            fragment: None,
            extensions: Vec::new(),
            payload: Payload::complete_in_memory(b"hello".to_vec()),
            refcount: 2,
        }
    }

    #[test]
    fn bundle_round_trips() {
        let bundle = sample_bundle();
        let encoded = encode_bundle(&bundle).unwrap();
        let decoded = decode_bundle(&encoded).unwrap();
        assert_eq!(decoded.id, bundle.id);
        assert_eq!(decoded.source, bundle.source);
        assert_eq!(decoded.options, bundle.options);
    }

    #[test]
    fn registration_round_trips() {
        let reg = Registration {
            regid: 3,
            endpoint_pattern: EndpointId::parse("dtn://x/*").unwrap(),
            failure_action: FailureAction::Defer,
            expiration_secs: 0,
            init_passive: false,
            bound_session: None,
        };
        let encoded = encode_registration(&reg).unwrap();
        let decoded = decode_registration(&encoded).unwrap();
        assert_eq!(decoded.regid, reg.regid);
        assert_eq!(decoded.endpoint_pattern, reg.endpoint_pattern);
    }

    #[test]
    fn keys_are_stable_and_distinct() {
        assert_eq!(bundle_key(1), b"bundle:1");
        assert_ne!(bundle_key(1), registration_key(1));
    }
}
