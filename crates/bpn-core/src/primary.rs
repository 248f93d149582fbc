//! BPv7 primary block codec and the decoded head fields the store indexes on.

use crate::block::{append_crc, verify_crc, CrcType};
use crate::cbor;
use crate::eid::Eid;
use crate::error::BundleError;

/// Bundle processing control flags (RFC 9171 §4.2.3).
///
/// Bits 7..=8 carry the two-bit relay priority (bulk / normal / expedited),
/// matching the legacy v6 class-of-service placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use]
pub struct BundleFlags(pub u64);

impl BundleFlags {
    pub const IS_FRAGMENT: u64 = 0x01;
    pub const IS_ADMIN_RECORD: u64 = 0x02;
    pub const MUST_NOT_FRAGMENT: u64 = 0x04;

    #[must_use]
    pub fn contains(&self, flag: u64) -> bool {
        self.0 & flag != 0
    }

    /// Priority index in `0..=2`, reserved value 3 clamped to expedited.
    #[must_use]
    pub fn priority_index(&self) -> u8 {
        (((self.0 >> 7) & 3) as u8).min(2)
    }

    /// Set the two-bit priority field.
    pub fn set_priority_index(&mut self, priority: u8) {
        self.0 = (self.0 & !(3 << 7)) | ((priority.min(2) as u64) << 7);
    }
}

/// `[time-ms, sequence]` creation timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use]
pub struct CreationTimestamp {
    pub time_ms: u64,
    pub sequence: u64,
}

/// The BPv7 primary block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct PrimaryBlock {
    pub flags: BundleFlags,
    pub crc_type: CrcType,
    pub destination: Eid,
    pub source: Eid,
    pub report_to: Eid,
    pub creation: CreationTimestamp,
    pub lifetime_ms: u64,
    pub fragment_offset: Option<u64>,
    pub total_adu_length: Option<u64>,
}

pub const BP_VERSION_7: u64 = 7;

impl PrimaryBlock {
    /// Append the RFC 9171 encoding, computing the CRC if one is requested.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let is_fragment = self.flags.contains(BundleFlags::IS_FRAGMENT);
        let mut field_count = 8;
        if is_fragment {
            field_count += 2;
        }
        if self.crc_type != CrcType::None {
            field_count += 1;
        }
        cbor::encode_array_head(out, field_count);
        cbor::encode_uint(out, BP_VERSION_7);
        cbor::encode_uint(out, self.flags.0);
        cbor::encode_uint(out, self.crc_type.code());
        self.destination.encode(out);
        self.source.encode(out);
        self.report_to.encode(out);
        cbor::encode_array_head(out, 2);
        cbor::encode_uint(out, self.creation.time_ms);
        cbor::encode_uint(out, self.creation.sequence);
        cbor::encode_uint(out, self.lifetime_ms);
        if is_fragment {
            cbor::encode_uint(out, self.fragment_offset.unwrap_or(0));
            cbor::encode_uint(out, self.total_adu_length.unwrap_or(0));
        }
        append_crc(out, start, self.crc_type);
    }

    /// Decode one primary block, verifying its CRC when present.
    pub fn decode(rd: &mut cbor::Reader<'_>, bundle_bytes: &[u8]) -> Result<Self, BundleError> {
        let start = rd.position();
        let field_count = rd.read_array_head()?;
        if !(8..=11).contains(&field_count) {
            return Err(BundleError::MalformedBlockData { block_type: 0 });
        }
        let version = rd.read_uint()?;
        if version != BP_VERSION_7 {
            return Err(BundleError::InvalidVersion(version));
        }
        let flags = BundleFlags(rd.read_uint()?);
        let crc_type = CrcType::from_code(rd.read_uint()?)?;
        let destination = Eid::decode(rd)?;
        let source = Eid::decode(rd)?;
        let report_to = Eid::decode(rd)?;
        if rd.read_array_head()? != 2 {
            return Err(BundleError::MalformedBlockData { block_type: 0 });
        }
        let creation = CreationTimestamp {
            time_ms: rd.read_uint()?,
            sequence: rd.read_uint()?,
        };
        let lifetime_ms = rd.read_uint()?;
        let is_fragment = flags.contains(BundleFlags::IS_FRAGMENT);
        let (fragment_offset, total_adu_length) = if is_fragment {
            (Some(rd.read_uint()?), Some(rd.read_uint()?))
        } else {
            (None, None)
        };
        let expected_fields: u64 =
            8 + if is_fragment { 2 } else { 0 } + if crc_type != CrcType::None { 1 } else { 0 };
        if field_count != expected_fields {
            return Err(BundleError::MalformedBlockData { block_type: 0 });
        }
        if crc_type != CrcType::None {
            let stored = rd.read_bytes()?.to_vec();
            let end = rd.position();
            if !verify_crc(&bundle_bytes[start..end], crc_type, &stored) {
                return Err(BundleError::CrcMismatch { block_number: 0 });
            }
        }
        Ok(PrimaryBlock {
            flags,
            crc_type,
            destination,
            source,
            report_to,
            creation,
            lifetime_ms,
            fragment_offset,
            total_adu_length,
        })
    }

    /// Absolute expiration, in whole seconds since the bundle epoch.
    #[must_use]
    pub fn abs_expiration_secs(&self) -> u64 {
        (self.creation.time_ms.saturating_add(self.lifetime_ms)) / 1000
    }
}

/// The head fields the store indexes a bundle on, decodable from either
/// bundle protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct PrimaryFields {
    pub destination: Eid,
    pub source: Eid,
    pub priority_index: u8,
    pub abs_expiration_secs: u64,
}

impl PrimaryFields {
    pub fn from_v7(primary: &PrimaryBlock) -> Self {
        PrimaryFields {
            destination: primary.destination,
            source: primary.source,
            priority_index: primary.flags.priority_index(),
            abs_expiration_secs: primary.abs_expiration_secs(),
        }
    }

    pub fn from_v6(primary: &crate::v6::Bpv6PrimaryBlock) -> Self {
        PrimaryFields {
            destination: primary.destination,
            source: primary.source,
            priority_index: primary.priority_index(),
            abs_expiration_secs: primary.creation_secs.saturating_add(primary.lifetime_secs),
        }
    }

    /// Decode the head of a serialized bundle of either version.
    ///
    /// A leading `0x06` SDNV is a v6 primary; a CBOR array start is a v7
    /// bundle whose first element is the primary block.
    pub fn decode(bundle_bytes: &[u8]) -> Result<Self, BundleError> {
        let first = *bundle_bytes.first().ok_or(BundleError::TooShort {
            min: 1,
            actual: 0,
        })?;
        if first == 0x06 {
            let mut offset = 0;
            let primary = crate::v6::Bpv6PrimaryBlock::decode(bundle_bytes, &mut offset)?;
            Ok(PrimaryFields::from_v6(&primary))
        } else {
            let mut rd = cbor::Reader::new(bundle_bytes);
            if first == cbor::INDEFINITE_ARRAY_START {
                rd.read_indefinite_array_start()?;
            } else {
                // definite-length bundle array: consume the head
                rd.read_array_head()?;
            }
            let primary = PrimaryBlock::decode(&mut rd, bundle_bytes)?;
            Ok(PrimaryFields::from_v7(&primary))
        }
    }
}
