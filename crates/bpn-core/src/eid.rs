//! Endpoint IDs and ipn URI patterns.
//!
//! EIDs are compressed `(node, service)` pairs in the `ipn` scheme. Policy
//! configuration additionally uses wildcard patterns: `ipn:N.*` matches any
//! service of node N, and `ipn:*.*` matches any EID.

use std::fmt;

use crate::cbor;
use crate::error::{BundleError, CborError, EidError};

/// ipn URI scheme code used in BPv7 EID encodings.
pub const URI_SCHEME_IPN: u64 = 2;
/// dtn URI scheme code; only `dtn:none` is accepted, as the null EID.
pub const URI_SCHEME_DTN: u64 = 1;

/// A compressed `ipn` endpoint ID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[must_use]
pub struct Eid {
    pub node: u64,
    pub service: u64,
}

impl Eid {
    /// The null endpoint (`dtn:none` / `ipn:0.0`).
    pub const NULL: Eid = Eid { node: 0, service: 0 };

    pub const fn new(node: u64, service: u64) -> Self {
        Self { node, service }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.node == 0 && self.service == 0
    }

    /// Parse a fully-qualified `ipn:N.S` URI (no wildcards).
    pub fn parse(uri: &str) -> Result<Self, EidError> {
        match EidPattern::parse(uri)? {
            EidPattern::Exact(eid) => Ok(eid),
            _ => Err(EidError::InvalidSyntax(uri.to_string())),
        }
    }

    /// Append the BPv7 CBOR encoding: `[2, [node, service]]`, or `[1, 0]`
    /// for the null endpoint.
    pub fn encode(&self, out: &mut Vec<u8>) {
        cbor::encode_array_head(out, 2);
        if self.is_null() {
            cbor::encode_uint(out, URI_SCHEME_DTN);
            cbor::encode_uint(out, 0);
        } else {
            cbor::encode_uint(out, URI_SCHEME_IPN);
            cbor::encode_array_head(out, 2);
            cbor::encode_uint(out, self.node);
            cbor::encode_uint(out, self.service);
        }
    }

    /// Decode a BPv7 CBOR EID. Accepts the ipn scheme and `dtn:none`.
    pub fn decode(rd: &mut cbor::Reader<'_>) -> Result<Self, BundleError> {
        let n = rd.read_array_head()?;
        if n != 2 {
            return Err(BundleError::Cbor(CborError::WrongMajorType {
                expected: cbor::MAJOR_ARRAY,
                actual: cbor::MAJOR_ARRAY,
            }));
        }
        let scheme = rd.read_uint()?;
        match scheme {
            URI_SCHEME_IPN => {
                let parts = rd.read_array_head()?;
                if parts != 2 {
                    return Err(BundleError::MalformedSecurityBlock("ipn ssp arity"));
                }
                let node = rd.read_uint()?;
                let service = rd.read_uint()?;
                Ok(Eid { node, service })
            }
            URI_SCHEME_DTN => {
                // dtn:none encodes its SSP as the uint 0
                let ssp = rd.read_uint()?;
                if ssp != 0 {
                    return Err(BundleError::Eid(EidError::InvalidSyntax(format!(
                        "dtn scheme ssp {ssp}"
                    ))));
                }
                Ok(Eid::NULL)
            }
            other => Err(BundleError::Eid(EidError::InvalidSyntax(format!(
                "uri scheme {other}"
            )))),
        }
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ipn:{}.{}", self.node, self.service)
    }
}

/// An EID or wildcard pattern from policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub enum EidPattern {
    /// A fully-qualified `ipn:N.S`.
    Exact(Eid),
    /// `ipn:N.*` — any service of one node.
    AnyServiceOfNode(u64),
    /// `ipn:*.*` — any EID.
    Any,
}

impl EidPattern {
    /// Parse an `ipn:` URI with optional `*` wildcards at the node or
    /// service position. A wildcard node requires a wildcard service.
    pub fn parse(uri: &str) -> Result<Self, EidError> {
        let err = || EidError::InvalidSyntax(uri.to_string());
        let ssp = uri.strip_prefix("ipn:").ok_or_else(err)?;
        let (node_str, service_str) = ssp.split_once('.').ok_or_else(err)?;
        match (node_str, service_str) {
            ("*", "*") => Ok(EidPattern::Any),
            ("*", _) => Err(err()),
            (n, "*") => {
                let node = n.parse::<u64>().map_err(|_| err())?;
                Ok(EidPattern::AnyServiceOfNode(node))
            }
            (n, s) => {
                let node = n.parse::<u64>().map_err(|_| err())?;
                let service = s.parse::<u64>().map_err(|_| err())?;
                Ok(EidPattern::Exact(Eid::new(node, service)))
            }
        }
    }

    /// Whether this pattern matches a fully-qualified EID.
    #[must_use]
    pub fn matches(&self, eid: &Eid) -> bool {
        match self {
            EidPattern::Exact(e) => e == eid,
            EidPattern::AnyServiceOfNode(node) => *node == eid.node,
            EidPattern::Any => true,
        }
    }
}

impl fmt::Display for EidPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EidPattern::Exact(e) => write!(f, "{e}"),
            EidPattern::AnyServiceOfNode(n) => write!(f, "ipn:{n}.*"),
            EidPattern::Any => write!(f, "ipn:*.*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exact() {
        assert_eq!(Eid::parse("ipn:10.2").unwrap(), Eid::new(10, 2));
        assert_eq!(
            EidPattern::parse("ipn:10.2").unwrap(),
            EidPattern::Exact(Eid::new(10, 2))
        );
    }

    #[test]
    fn test_parse_wildcards() {
        assert_eq!(
            EidPattern::parse("ipn:7.*").unwrap(),
            EidPattern::AnyServiceOfNode(7)
        );
        assert_eq!(EidPattern::parse("ipn:*.*").unwrap(), EidPattern::Any);
    }

    #[test]
    fn test_parse_invalid() {
        for bad in [
            "ipn:", "ipn:1", "ipn:1.", "ipn:.1", "ipn:*.1", "dtn:1.1", "ipn:a.b", "1.1",
            "ipn:1.1.1",
        ] {
            assert!(
                EidPattern::parse(bad).is_err(),
                "{bad} should fail to parse"
            );
        }
        // exact parse rejects wildcards
        assert!(Eid::parse("ipn:1.*").is_err());
        assert!(Eid::parse("ipn:*.*").is_err());
    }

    #[test]
    fn test_pattern_matching() {
        let eid = Eid::new(3, 9);
        assert!(EidPattern::Exact(eid).matches(&eid));
        assert!(!EidPattern::Exact(Eid::new(3, 1)).matches(&eid));
        assert!(EidPattern::AnyServiceOfNode(3).matches(&eid));
        assert!(!EidPattern::AnyServiceOfNode(4).matches(&eid));
        assert!(EidPattern::Any.matches(&eid));
    }

    #[test]
    fn test_display_roundtrip() {
        for uri in ["ipn:1.1", "ipn:4.*", "ipn:*.*"] {
            let p = EidPattern::parse(uri).unwrap();
            assert_eq!(p.to_string(), uri);
        }
    }

    #[test]
    fn test_cbor_roundtrip() {
        for eid in [Eid::new(1, 1), Eid::new(u64::MAX, 0), Eid::NULL] {
            let mut out = Vec::new();
            eid.encode(&mut out);
            let mut rd = cbor::Reader::new(&out);
            assert_eq!(Eid::decode(&mut rd).unwrap(), eid);
            assert_eq!(rd.remaining(), 0);
        }
    }

    #[test]
    fn test_null_eid_encodes_as_dtn_none() {
        let mut out = Vec::new();
        Eid::NULL.encode(&mut out);
        // [1, 0]
        assert_eq!(out, [0x82, 0x01, 0x00]);
    }
}
