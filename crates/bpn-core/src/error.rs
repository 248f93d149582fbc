//! Error types for the bpn-core crate.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CborError {
    #[error("unexpected end of input: need {need} more bytes at offset {offset}")]
    UnexpectedEof { offset: usize, need: usize },

    #[error("expected CBOR major type {expected}, got {actual}")]
    WrongMajorType { expected: u8, actual: u8 },

    #[error("invalid CBOR additional info: {0}")]
    InvalidAdditionalInfo(u8),

    #[error("indefinite length not allowed here")]
    UnexpectedIndefiniteLength,

    #[error("expected break byte")]
    ExpectedBreak,

    #[error("CBOR length {len} exceeds remaining input {remaining}")]
    LengthOverrun { len: u64, remaining: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EidError {
    #[error("invalid ipn EID syntax: {0}")]
    InvalidSyntax(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BundleError {
    #[error("cbor error: {0}")]
    Cbor(#[from] CborError),

    #[error("eid error: {0}")]
    Eid(#[from] EidError),

    #[error("unsupported bundle protocol version: {0}")]
    InvalidVersion(u64),

    #[error("invalid CRC type code: {0}")]
    InvalidCrcType(u64),

    #[error("CRC mismatch on block {block_number}")]
    CrcMismatch { block_number: u64 },

    #[error("duplicate block number: {0}")]
    DuplicateBlockNumber(u64),

    #[error("bundle has no payload block")]
    MissingPayload,

    #[error("payload block is not the last block")]
    PayloadNotLast,

    #[error("block number {0} not found")]
    BlockNotFound(u64),

    #[error("malformed block-type-specific data for block type {block_type}")]
    MalformedBlockData { block_type: u64 },

    #[error("malformed abstract security block: {0}")]
    MalformedSecurityBlock(&'static str),

    #[error("SDNV too long or overflows u64")]
    SdnvOverflow,

    #[error("bundle too short: need at least {min} bytes, got {actual}")]
    TooShort { min: usize, actual: usize },
}
