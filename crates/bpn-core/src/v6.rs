//! Legacy BPv6 (RFC 5050) codec: SDNVs, CBHE primary block, canonical
//! blocks, and a minimal re-renderable v6 bundle view.
//!
//! Kept for stores that still relay v6 traffic; the security engine operates
//! on v7 only.

use crate::eid::Eid;
use crate::error::BundleError;

pub const BP_VERSION_6: u8 = 6;

/// Canonical block flag: this is the last block of the bundle.
pub const BLOCK_FLAG_LAST_BLOCK: u64 = 0x08;

/// v6 payload block type code.
pub const BLOCK_TYPE_PAYLOAD: u8 = 1;

/// Append a Self-Delimiting Numeric Value (big-endian, 7 bits per byte,
/// high bit marks continuation).
pub fn sdnv_encode(out: &mut Vec<u8>, mut value: u64) {
    let mut chunks = [0u8; 10];
    let mut n = 0;
    loop {
        chunks[n] = (value & 0x7f) as u8;
        value >>= 7;
        n += 1;
        if value == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let cont = if i == 0 { 0 } else { 0x80 };
        out.push(chunks[i] | cont);
    }
}

/// Decode an SDNV starting at `*offset`, advancing the offset past it.
pub fn sdnv_decode(buf: &[u8], offset: &mut usize) -> Result<u64, BundleError> {
    let mut value: u64 = 0;
    for i in 0..10 {
        let byte = *buf.get(*offset + i).ok_or(BundleError::TooShort {
            min: *offset + i + 1,
            actual: buf.len(),
        })?;
        value = value
            .checked_mul(128)
            .ok_or(BundleError::SdnvOverflow)?
            | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            *offset += i + 1;
            return Ok(value);
        }
    }
    Err(BundleError::SdnvOverflow)
}

/// CBHE (RFC 6260) compressed v6 primary block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct Bpv6PrimaryBlock {
    pub flags: u64,
    pub destination: Eid,
    pub source: Eid,
    pub report_to: Eid,
    pub custodian: Eid,
    pub creation_secs: u64,
    pub sequence: u64,
    pub lifetime_secs: u64,
}

impl Bpv6PrimaryBlock {
    /// Priority index from bits 7..=8 of the processing flags, clamped to 2.
    #[must_use]
    pub fn priority_index(&self) -> u8 {
        (((self.flags >> 7) & 3) as u8).min(2)
    }

    /// Set the two-bit class-of-service field.
    pub fn set_priority_index(&mut self, priority: u8) {
        self.flags = (self.flags & !(3 << 7)) | ((priority.min(2) as u64) << 7);
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::with_capacity(32);
        sdnv_encode(&mut body, self.destination.node);
        sdnv_encode(&mut body, self.destination.service);
        sdnv_encode(&mut body, self.source.node);
        sdnv_encode(&mut body, self.source.service);
        sdnv_encode(&mut body, self.report_to.node);
        sdnv_encode(&mut body, self.report_to.service);
        sdnv_encode(&mut body, self.custodian.node);
        sdnv_encode(&mut body, self.custodian.service);
        sdnv_encode(&mut body, self.creation_secs);
        sdnv_encode(&mut body, self.sequence);
        sdnv_encode(&mut body, self.lifetime_secs);
        sdnv_encode(&mut body, 0); // CBHE: empty dictionary

        out.push(BP_VERSION_6);
        sdnv_encode(out, self.flags);
        sdnv_encode(out, body.len() as u64);
        out.extend_from_slice(&body);
    }

    pub fn decode(buf: &[u8], offset: &mut usize) -> Result<Self, BundleError> {
        let version = *buf.get(*offset).ok_or(BundleError::TooShort {
            min: *offset + 1,
            actual: buf.len(),
        })?;
        if version != BP_VERSION_6 {
            return Err(BundleError::InvalidVersion(version as u64));
        }
        *offset += 1;
        let flags = sdnv_decode(buf, offset)?;
        let block_length = sdnv_decode(buf, offset)?;
        let body_start = *offset;

        let destination = Eid::new(sdnv_decode(buf, offset)?, sdnv_decode(buf, offset)?);
        let source = Eid::new(sdnv_decode(buf, offset)?, sdnv_decode(buf, offset)?);
        let report_to = Eid::new(sdnv_decode(buf, offset)?, sdnv_decode(buf, offset)?);
        let custodian = Eid::new(sdnv_decode(buf, offset)?, sdnv_decode(buf, offset)?);
        let creation_secs = sdnv_decode(buf, offset)?;
        let sequence = sdnv_decode(buf, offset)?;
        let lifetime_secs = sdnv_decode(buf, offset)?;
        let dictionary_length = sdnv_decode(buf, offset)?;
        if dictionary_length != 0 {
            // non-CBHE dictionaries are not relayed
            return Err(BundleError::MalformedBlockData { block_type: 0 });
        }
        if (*offset - body_start) as u64 != block_length {
            return Err(BundleError::MalformedBlockData { block_type: 0 });
        }
        Ok(Bpv6PrimaryBlock {
            flags,
            destination,
            source,
            report_to,
            custodian,
            creation_secs,
            sequence,
            lifetime_secs,
        })
    }
}

/// One v6 canonical block (header plus raw body).
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Bpv6CanonicalBlock {
    pub block_type: u8,
    pub flags: u64,
    pub data: Vec<u8>,
}

impl Bpv6CanonicalBlock {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.block_type);
        sdnv_encode(out, self.flags);
        sdnv_encode(out, self.data.len() as u64);
        out.extend_from_slice(&self.data);
    }

    pub fn decode(buf: &[u8], offset: &mut usize) -> Result<Self, BundleError> {
        let block_type = *buf.get(*offset).ok_or(BundleError::TooShort {
            min: *offset + 1,
            actual: buf.len(),
        })?;
        *offset += 1;
        let flags = sdnv_decode(buf, offset)?;
        let length = sdnv_decode(buf, offset)? as usize;
        if buf.len() < *offset + length {
            return Err(BundleError::TooShort {
                min: *offset + length,
                actual: buf.len(),
            });
        }
        let data = buf[*offset..*offset + length].to_vec();
        *offset += length;
        Ok(Bpv6CanonicalBlock {
            block_type,
            flags,
            data,
        })
    }

    #[must_use]
    pub fn is_last_block(&self) -> bool {
        self.flags & BLOCK_FLAG_LAST_BLOCK != 0
    }
}

/// Minimal mutable view of a v6 bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Bpv6BundleView {
    pub primary: Bpv6PrimaryBlock,
    pub blocks: Vec<Bpv6CanonicalBlock>,
}

impl Bpv6BundleView {
    pub fn parse(bytes: &[u8]) -> Result<Self, BundleError> {
        let mut offset = 0;
        let primary = Bpv6PrimaryBlock::decode(bytes, &mut offset)?;
        let mut blocks = Vec::new();
        loop {
            let block = Bpv6CanonicalBlock::decode(bytes, &mut offset)?;
            let last = block.is_last_block();
            blocks.push(block);
            if last {
                break;
            }
            if offset >= bytes.len() {
                // ran out of input without seeing a last-block flag
                return Err(BundleError::MissingPayload);
            }
        }
        Ok(Bpv6BundleView { primary, blocks })
    }

    /// Serialize the current logical state, fixing up last-block flags.
    #[must_use]
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.primary.encode(&mut out);
        for (i, block) in self.blocks.iter().enumerate() {
            let mut b = block.clone();
            if i + 1 == self.blocks.len() {
                b.flags |= BLOCK_FLAG_LAST_BLOCK;
            } else {
                b.flags &= !BLOCK_FLAG_LAST_BLOCK;
            }
            b.encode(&mut out);
        }
        out
    }

    /// The payload block body, if present.
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        self.blocks
            .iter()
            .find(|b| b.block_type == BLOCK_TYPE_PAYLOAD)
            .map(|b| b.data.as_slice())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn sdnv_roundtrip(value in any::<u64>()) {
            let mut out = Vec::new();
            sdnv_encode(&mut out, value);
            let mut offset = 0;
            prop_assert_eq!(sdnv_decode(&out, &mut offset).unwrap(), value);
            prop_assert_eq!(offset, out.len());
        }

        #[test]
        fn sdnv_never_panics(data in proptest::collection::vec(any::<u8>(), 0..16)) {
            let mut offset = 0;
            let _ = sdnv_decode(&data, &mut offset);
        }
    }
}
