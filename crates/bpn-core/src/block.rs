//! BPv7 canonical block header, flags, and the typed block-data union.

use crate::cbor;
use crate::crc::{crc16_x25, crc32c};
use crate::eid::Eid;
use crate::error::BundleError;
use crate::security::AbstractSecurityBlock;

/// Block type codes from RFC 9171 and RFC 9172.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub enum BlockType {
    Payload,
    PreviousNode,
    BundleAge,
    HopCount,
    Integrity,
    Confidentiality,
    Other(u64),
}

impl BlockType {
    pub const PAYLOAD_CODE: u64 = 1;
    pub const PREVIOUS_NODE_CODE: u64 = 6;
    pub const BUNDLE_AGE_CODE: u64 = 7;
    pub const HOP_COUNT_CODE: u64 = 10;
    pub const INTEGRITY_CODE: u64 = 11;
    pub const CONFIDENTIALITY_CODE: u64 = 12;

    #[must_use]
    pub fn code(&self) -> u64 {
        match self {
            BlockType::Payload => Self::PAYLOAD_CODE,
            BlockType::PreviousNode => Self::PREVIOUS_NODE_CODE,
            BlockType::BundleAge => Self::BUNDLE_AGE_CODE,
            BlockType::HopCount => Self::HOP_COUNT_CODE,
            BlockType::Integrity => Self::INTEGRITY_CODE,
            BlockType::Confidentiality => Self::CONFIDENTIALITY_CODE,
            BlockType::Other(code) => *code,
        }
    }
}

impl From<u64> for BlockType {
    fn from(code: u64) -> Self {
        match code {
            Self::PAYLOAD_CODE => BlockType::Payload,
            Self::PREVIOUS_NODE_CODE => BlockType::PreviousNode,
            Self::BUNDLE_AGE_CODE => BlockType::BundleAge,
            Self::HOP_COUNT_CODE => BlockType::HopCount,
            Self::INTEGRITY_CODE => BlockType::Integrity,
            Self::CONFIDENTIALITY_CODE => BlockType::Confidentiality,
            other => BlockType::Other(other),
        }
    }
}

/// Block processing control flags (RFC 9171 §4.2.4).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use]
pub struct BlockFlags(pub u64);

impl BlockFlags {
    pub const MUST_BE_REPLICATED: u64 = 0x01;
    pub const STATUS_REPORT_IF_UNPROCESSABLE: u64 = 0x02;
    pub const DELETE_BUNDLE_IF_UNPROCESSABLE: u64 = 0x04;
    pub const DISCARD_BLOCK_IF_UNPROCESSABLE: u64 = 0x10;

    #[must_use]
    pub fn contains(&self, flag: u64) -> bool {
        self.0 & flag != 0
    }
}

/// CRC type field shared by primary and canonical blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use]
pub enum CrcType {
    #[default]
    None,
    Crc16,
    Crc32c,
}

impl CrcType {
    #[must_use]
    pub fn code(&self) -> u64 {
        match self {
            CrcType::None => 0,
            CrcType::Crc16 => 1,
            CrcType::Crc32c => 2,
        }
    }

    pub fn from_code(code: u64) -> Result<Self, BundleError> {
        match code {
            0 => Ok(CrcType::None),
            1 => Ok(CrcType::Crc16),
            2 => Ok(CrcType::Crc32c),
            other => Err(BundleError::InvalidCrcType(other)),
        }
    }

    /// Width in bytes of the CRC byte string, zero when absent.
    #[must_use]
    pub fn width(&self) -> usize {
        match self {
            CrcType::None => 0,
            CrcType::Crc16 => 2,
            CrcType::Crc32c => 4,
        }
    }
}

/// Typed view of a canonical block's type-specific data.
///
/// Canonical blocks keep their data as the raw content of the CBOR byte
/// string so that a confidentiality block can swap plaintext for ciphertext
/// without reinterpreting it; [`CanonicalBlock::decode_data`] produces this
/// union on demand and [`CanonicalBlock::set_data`] re-encodes it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum BlockData {
    Payload(Vec<u8>),
    PreviousNode(Eid),
    BundleAge(u64),
    HopCount { limit: u64, count: u64 },
    Integrity(AbstractSecurityBlock),
    Confidentiality(AbstractSecurityBlock),
    Unknown(Vec<u8>),
}

/// One canonical (non-primary) block.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct CanonicalBlock {
    pub block_type: BlockType,
    pub block_number: u64,
    pub flags: BlockFlags,
    pub crc_type: CrcType,
    /// Content of the block-type-specific-data byte string.
    pub data: Vec<u8>,
}

impl CanonicalBlock {
    /// Append the RFC 9171 encoding, computing the CRC if one is requested.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let field_count = if self.crc_type == CrcType::None { 5 } else { 6 };
        cbor::encode_array_head(out, field_count);
        cbor::encode_uint(out, self.block_type.code());
        cbor::encode_uint(out, self.block_number);
        cbor::encode_uint(out, self.flags.0);
        cbor::encode_uint(out, self.crc_type.code());
        cbor::encode_bytes(out, &self.data);
        append_crc(out, start, self.crc_type);
    }

    /// Decode one canonical block, verifying its CRC when present.
    pub fn decode(rd: &mut cbor::Reader<'_>, block_bytes: &[u8]) -> Result<Self, BundleError> {
        let start = rd.position();
        let field_count = rd.read_array_head()?;
        if !(5..=6).contains(&field_count) {
            return Err(BundleError::MalformedBlockData { block_type: 0 });
        }
        let block_type = BlockType::from(rd.read_uint()?);
        let block_number = rd.read_uint()?;
        let flags = BlockFlags(rd.read_uint()?);
        let crc_type = CrcType::from_code(rd.read_uint()?)?;
        if (field_count == 6) != (crc_type != CrcType::None) {
            return Err(BundleError::MalformedBlockData {
                block_type: block_type.code(),
            });
        }
        let data = rd.read_bytes()?.to_vec();
        if crc_type != CrcType::None {
            let stored = rd.read_bytes()?.to_vec();
            let end = rd.position();
            if !verify_crc(&block_bytes[start..end], crc_type, &stored) {
                return Err(BundleError::CrcMismatch { block_number });
            }
        }
        Ok(CanonicalBlock {
            block_type,
            block_number,
            flags,
            crc_type,
            data,
        })
    }

    /// Interpret the data byte string according to the block type.
    pub fn decode_data(&self) -> Result<BlockData, BundleError> {
        let malformed = || BundleError::MalformedBlockData {
            block_type: self.block_type.code(),
        };
        match self.block_type {
            BlockType::Payload => Ok(BlockData::Payload(self.data.clone())),
            BlockType::PreviousNode => {
                let mut rd = cbor::Reader::new(&self.data);
                let eid = Eid::decode(&mut rd).map_err(|_| malformed())?;
                Ok(BlockData::PreviousNode(eid))
            }
            BlockType::BundleAge => {
                let mut rd = cbor::Reader::new(&self.data);
                let age = rd.read_uint().map_err(|_| malformed())?;
                Ok(BlockData::BundleAge(age))
            }
            BlockType::HopCount => {
                let mut rd = cbor::Reader::new(&self.data);
                if rd.read_array_head().map_err(|_| malformed())? != 2 {
                    return Err(malformed());
                }
                let limit = rd.read_uint().map_err(|_| malformed())?;
                let count = rd.read_uint().map_err(|_| malformed())?;
                Ok(BlockData::HopCount { limit, count })
            }
            BlockType::Integrity => {
                AbstractSecurityBlock::decode(&self.data).map(BlockData::Integrity)
            }
            BlockType::Confidentiality => {
                AbstractSecurityBlock::decode(&self.data).map(BlockData::Confidentiality)
            }
            BlockType::Other(_) => Ok(BlockData::Unknown(self.data.clone())),
        }
    }

    /// Replace the data byte string with the encoding of `data`.
    pub fn set_data(&mut self, data: &BlockData) {
        self.data = encode_block_data(data);
    }

    /// Build a payload block (block number 1, type 1).
    pub fn new_payload(payload: Vec<u8>, crc_type: CrcType) -> Self {
        CanonicalBlock {
            block_type: BlockType::Payload,
            block_number: 1,
            flags: BlockFlags::default(),
            crc_type,
            data: payload,
        }
    }
}

/// Encode a typed block-data union into byte-string content.
#[must_use]
pub fn encode_block_data(data: &BlockData) -> Vec<u8> {
    let mut out = Vec::new();
    match data {
        BlockData::Payload(bytes) | BlockData::Unknown(bytes) => {
            out.extend_from_slice(bytes);
        }
        BlockData::PreviousNode(eid) => eid.encode(&mut out),
        BlockData::BundleAge(age) => cbor::encode_uint(&mut out, *age),
        BlockData::HopCount { limit, count } => {
            cbor::encode_array_head(&mut out, 2);
            cbor::encode_uint(&mut out, *limit);
            cbor::encode_uint(&mut out, *count);
        }
        BlockData::Integrity(asb) | BlockData::Confidentiality(asb) => asb.encode(&mut out),
    }
    out
}

/// Append a CRC byte string covering `out[start..]` with the CRC zeroed.
pub(crate) fn append_crc(out: &mut Vec<u8>, start: usize, crc_type: CrcType) {
    match crc_type {
        CrcType::None => {}
        CrcType::Crc16 => {
            out.push(0x42);
            out.extend_from_slice(&[0, 0]);
            let crc = crc16_x25(&out[start..]);
            let len = out.len();
            out[len - 2..].copy_from_slice(&crc.to_be_bytes());
        }
        CrcType::Crc32c => {
            out.push(0x44);
            out.extend_from_slice(&[0, 0, 0, 0]);
            let crc = crc32c(&out[start..]);
            let len = out.len();
            out[len - 4..].copy_from_slice(&crc.to_be_bytes());
        }
    }
}

/// Check a stored CRC against `block_bytes` (the full block encoding).
pub(crate) fn verify_crc(block_bytes: &[u8], crc_type: CrcType, stored: &[u8]) -> bool {
    let width = crc_type.width();
    if stored.len() != width || block_bytes.len() < width {
        return false;
    }
    let mut copy = block_bytes.to_vec();
    let len = copy.len();
    copy[len - width..].fill(0);
    match crc_type {
        CrcType::None => true,
        CrcType::Crc16 => crc16_x25(&copy) == u16::from_be_bytes([stored[0], stored[1]]),
        CrcType::Crc32c => {
            crc32c(&copy) == u32::from_be_bytes([stored[0], stored[1], stored[2], stored[3]])
        }
    }
}
