//! Endpoint Identifier: a bounded-length URI naming a source, destination,
//! or registration pattern (§3).

use std::fmt;

use crate::error::ParseError;

/// Canonical form is capped at this many bytes, matching the "≤256 bytes
/// canonical" invariant in §3.
pub const MAX_EID_LEN: usize = 256;

/// A parsed, canonicalized endpoint identifier: `scheme:scheme_specific_part`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct EndpointId {
    scheme: String,
    ssp: String,
}

impl EndpointId {
    /// Parses and canonicalizes a URI-like string into an `EndpointId`.
    ///
    /// Canonicalization lowercases the scheme and strips a trailing `/` from
    /// the scheme-specific part unless the SSP is exactly `/` or ends in a
    /// wildcard, matching the "every stored EID is canonicalized on parse"
    /// invariant.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        if raw.len() > MAX_EID_LEN {
            return Err(ParseError::BadFlags);
        }
        let (scheme, ssp) = raw.split_once(':').ok_or(ParseError::BadFlags)?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
            return Err(ParseError::BadFlags);
        }
        let scheme = scheme.to_ascii_lowercase();
        let mut ssp = ssp.to_string();
        if ssp.len() > 1 && ssp.ends_with('/') && !ssp.ends_with("*/") {
            ssp.pop();
        }
        Ok(EndpointId { scheme, ssp })
    }

    /// The distinguished null EID, `dtn:none`.
    pub fn null() -> Self {
        EndpointId { scheme: "dtn".into(), ssp: "none".into() }
    }

    /// The per-node `local` EID for a given node name, `dtn://<node>`.
    pub fn local(node: &str) -> Self {
        EndpointId { scheme: "dtn".into(), ssp: format!("//{node}") }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn ssp(&self) -> &str {
        &self.ssp
    }

    pub fn is_null(&self) -> bool {
        self.scheme == "dtn" && self.ssp == "none"
    }

    /// Returns `true` if `self` (used as a pattern) matches `candidate`.
    ///
    /// The scheme must agree exactly. The scheme-specific part matches under
    /// a simple suffix-wildcard rule: a pattern SSP ending in `*` matches any
    /// candidate SSP sharing that prefix; otherwise the SSPs must be equal.
    /// This mirrors DTN2's default `dtn` scheme match rule (prefix + `*`).
    pub fn matches(&self, candidate: &EndpointId) -> bool {
        if self.scheme != candidate.scheme {
            return false;
        }
        match self.ssp.strip_suffix('*') {
            Some(prefix) => candidate.ssp.starts_with(prefix),
            None => self.ssp == candidate.ssp,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.ssp)
    }
}

impl std::str::FromStr for EndpointId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_scheme_case_and_trailing_slash() {
        let eid = EndpointId::parse("DTN://host.example/app/").unwrap();
        assert_eq!(eid.scheme(), "dtn");
        assert_eq!(eid.ssp(), "//host.example/app");
    }

    #[test]
    fn null_and_local_are_distinct() {
        assert!(EndpointId::null().is_null());
        assert!(!EndpointId::local("n1").is_null());
    }

    #[test]
    fn wildcard_pattern_matches_prefix() {
        let pattern = EndpointId::parse("dtn://host/app/*").unwrap();
        let concrete = EndpointId::parse("dtn://host/app/inbox").unwrap();
        assert!(pattern.matches(&concrete));
        let other_scheme = EndpointId::parse("ipn://1.2").unwrap();
        assert!(!pattern.matches(&other_scheme));
    }

    #[test]
    fn exact_pattern_requires_equality() {
        let pattern = EndpointId::parse("dtn://host/app").unwrap();
        let same = EndpointId::parse("dtn://host/app").unwrap();
        let different = EndpointId::parse("dtn://host/app2").unwrap();
        assert!(pattern.matches(&same));
        assert!(!pattern.matches(&different));
    }

    #[test]
    fn rejects_oversized_eid() {
        let huge = format!("dtn://{}", "a".repeat(MAX_EID_LEN));
        assert_eq!(EndpointId::parse(&huge), Err(ParseError::BadFlags));
    }

    #[test]
    fn rejects_missing_scheme_separator() {
        assert!(EndpointId::parse("not-a-uri").is_err());
    }
}
