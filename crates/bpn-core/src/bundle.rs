//! The mutable, re-renderable BPv7 bundle view.
//!
//! A [`BundleView`] owns a parsed primary block and an ordered list of
//! canonical block views. Blocks refer to each other only by block number.
//! After any mutation, [`BundleView::render_in_place`] produces a byte-exact
//! encoding of the current logical state with deleted blocks omitted and the
//! payload block last.

use std::ops::Range;

use crate::block::{BlockType, CanonicalBlock, CrcType};
use crate::cbor;
use crate::error::BundleError;
use crate::primary::PrimaryBlock;

/// One canonical block plus its view bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct CanonicalBlockView {
    pub block: CanonicalBlock,
    /// Set to drop the block on the next render.
    pub marked_for_deletion: bool,
    manually_modified: bool,
    /// Location of this block's encoding within the last render.
    byte_range: Range<usize>,
}

impl CanonicalBlockView {
    pub fn new(block: CanonicalBlock) -> Self {
        CanonicalBlockView {
            block,
            marked_for_deletion: false,
            manually_modified: true,
            byte_range: 0..0,
        }
    }

    /// Flag that the block contents changed since the last render.
    pub fn set_manually_modified(&mut self) {
        self.manually_modified = true;
    }

    #[must_use]
    pub fn is_manually_modified(&self) -> bool {
        self.manually_modified
    }

    /// Byte range of this block in the most recent render.
    #[must_use]
    pub fn byte_range(&self) -> Range<usize> {
        self.byte_range.clone()
    }
}

/// A parsed, mutable bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct BundleView {
    pub primary: PrimaryBlock,
    pub blocks: Vec<CanonicalBlockView>,
    primary_modified: bool,
    primary_range: Range<usize>,
    rendered: Vec<u8>,
}

impl BundleView {
    /// Build a new bundle from a primary block and payload bytes.
    pub fn new(primary: PrimaryBlock, payload: Vec<u8>, payload_crc: CrcType) -> Self {
        let mut view = BundleView {
            primary,
            blocks: vec![CanonicalBlockView::new(CanonicalBlock::new_payload(
                payload,
                payload_crc,
            ))],
            primary_modified: true,
            primary_range: 0..0,
            rendered: Vec::new(),
        };
        view.render_in_place();
        view
    }

    /// Parse a serialized v7 bundle.
    ///
    /// Accepts the RFC 9171 indefinite-length array form and, leniently, a
    /// definite-length array. Enforces unique block numbers and the
    /// payload-last invariant.
    pub fn parse(bytes: &[u8]) -> Result<Self, BundleError> {
        let mut rd = cbor::Reader::new(bytes);
        let definite_count = if rd.peek()? == cbor::INDEFINITE_ARRAY_START {
            rd.read_indefinite_array_start()?;
            None
        } else {
            Some(rd.read_array_head()?)
        };

        let primary_start = rd.position();
        let primary = PrimaryBlock::decode(&mut rd, bytes)?;
        let primary_range = primary_start..rd.position();

        let mut blocks: Vec<CanonicalBlockView> = Vec::new();
        match definite_count {
            None => {
                while !rd.at_break() {
                    let start = rd.position();
                    let block = CanonicalBlock::decode(&mut rd, bytes)?;
                    blocks.push(CanonicalBlockView {
                        block,
                        marked_for_deletion: false,
                        manually_modified: false,
                        byte_range: start..rd.position(),
                    });
                }
                rd.read_break()?;
            }
            Some(count) => {
                for _ in 1..count {
                    let start = rd.position();
                    let block = CanonicalBlock::decode(&mut rd, bytes)?;
                    blocks.push(CanonicalBlockView {
                        block,
                        marked_for_deletion: false,
                        manually_modified: false,
                        byte_range: start..rd.position(),
                    });
                }
            }
        }

        for (i, view) in blocks.iter().enumerate() {
            let number = view.block.block_number;
            if blocks[i + 1..].iter().any(|o| o.block.block_number == number) {
                return Err(BundleError::DuplicateBlockNumber(number));
            }
        }
        let Some(last) = blocks.last() else {
            return Err(BundleError::MissingPayload);
        };
        if blocks
            .iter()
            .all(|v| v.block.block_type != BlockType::Payload)
        {
            return Err(BundleError::MissingPayload);
        }
        if last.block.block_type != BlockType::Payload {
            return Err(BundleError::PayloadNotLast);
        }

        Ok(BundleView {
            primary,
            blocks,
            primary_modified: false,
            primary_range,
            rendered: bytes.to_vec(),
        })
    }

    /// The encoding produced by the last parse or render.
    #[must_use]
    pub fn rendered(&self) -> &[u8] {
        &self.rendered
    }

    /// Encode the current logical state into a fresh buffer, omitting blocks
    /// marked for deletion.
    #[must_use]
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.rendered.len().max(64));
        out.push(cbor::INDEFINITE_ARRAY_START);
        self.primary.encode(&mut out);
        for view in &self.blocks {
            if !view.marked_for_deletion {
                view.block.encode(&mut out);
            }
        }
        out.push(cbor::BREAK);
        out
    }

    /// Re-render into the internal buffer, dropping deleted block views,
    /// refreshing every view's byte range, and clearing modified flags.
    pub fn render_in_place(&mut self) {
        self.blocks.retain(|v| !v.marked_for_deletion);

        let mut out = Vec::with_capacity(self.rendered.len().max(64));
        out.push(cbor::INDEFINITE_ARRAY_START);
        let primary_start = out.len();
        self.primary.encode(&mut out);
        self.primary_range = primary_start..out.len();
        self.primary_modified = false;
        for view in &mut self.blocks {
            let start = out.len();
            view.block.encode(&mut out);
            view.byte_range = start..out.len();
            view.manually_modified = false;
        }
        out.push(cbor::BREAK);
        self.rendered = out;
    }

    /// Flag that the primary block changed since the last render.
    pub fn set_primary_modified(&mut self) {
        self.primary_modified = true;
    }

    /// Byte range of the primary block in the most recent render.
    #[must_use]
    pub fn primary_byte_range(&self) -> Range<usize> {
        self.primary_range.clone()
    }

    /// Index of the block with the given (unique) block number.
    #[must_use]
    pub fn block_index_by_number(&self, block_number: u64) -> Option<usize> {
        self.blocks
            .iter()
            .position(|v| v.block.block_number == block_number)
    }

    #[must_use]
    pub fn block_by_number(&self, block_number: u64) -> Option<&CanonicalBlockView> {
        self.block_index_by_number(block_number)
            .map(|i| &self.blocks[i])
    }

    pub fn block_by_number_mut(&mut self, block_number: u64) -> Option<&mut CanonicalBlockView> {
        self.block_index_by_number(block_number)
            .map(|i| &mut self.blocks[i])
    }

    /// Indices of all blocks of one type, in bundle order.
    #[must_use]
    pub fn block_indices_of_type(&self, block_type: BlockType) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, v)| v.block.block_type == block_type)
            .map(|(i, _)| i)
            .collect()
    }

    /// Smallest block number not yet in use (always ≥ 2; 1 is the payload).
    #[must_use]
    pub fn next_free_block_number(&self) -> u64 {
        let mut n = 2;
        while self.blocks.iter().any(|v| v.block.block_number == n) {
            n += 1;
        }
        n
    }

    /// Insert a block immediately after the primary block.
    pub fn insert_block_after_primary(&mut self, block: CanonicalBlock) -> Result<(), BundleError> {
        if self.block_index_by_number(block.block_number).is_some() {
            return Err(BundleError::DuplicateBlockNumber(block.block_number));
        }
        self.blocks.insert(0, CanonicalBlockView::new(block));
        Ok(())
    }

    /// Append a block, keeping the payload block last.
    pub fn push_block(&mut self, block: CanonicalBlock) -> Result<(), BundleError> {
        if self.block_index_by_number(block.block_number).is_some() {
            return Err(BundleError::DuplicateBlockNumber(block.block_number));
        }
        let insert_at = self
            .blocks
            .iter()
            .position(|v| v.block.block_type == BlockType::Payload)
            .unwrap_or(self.blocks.len());
        self.blocks.insert(insert_at, CanonicalBlockView::new(block));
        Ok(())
    }

    /// The payload block's data bytes.
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        self.blocks
            .iter()
            .find(|v| v.block.block_type == BlockType::Payload && !v.marked_for_deletion)
            .map(|v| v.block.data.as_slice())
    }
}
