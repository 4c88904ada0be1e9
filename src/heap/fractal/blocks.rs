//! Direct and indirect blocks of a fractal heap.
//!
//! ```text
//! direct:   ["FHDB"][version=0][heap header: O][block offset: heap offset size]
//!           [checksum, if the heap checksums direct blocks][objects...]
//! indirect: ["FHIB"][version=0][heap header: O][block offset: heap offset size]
//!           [direct children: address O (+ filtered size L, filter mask u32)]
//!           [indirect children: address O][checksum]
//! ```
//!
//! A direct block checksum covers the whole block with the checksum field
//! zeroed. Filtered direct blocks are stored filtered in full, prefix
//! included.

use super::FractalHeapHeader;
use crate::checksum;
use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::filter::FilterDirection;
use crate::io::{is_defined, FieldCursor, FieldWriter};
use bytes::Bytes;
use std::sync::Arc;

pub(crate) const DIRECT_SIGNATURE: &[u8; 4] = b"FHDB";
pub(crate) const INDIRECT_SIGNATURE: &[u8; 4] = b"FHIB";

/// Stored size and filter mask of a filtered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilteredBlock {
    /// Size of the block as stored.
    pub size: u64,
    /// Skipped filters.
    pub filter_mask: u32,
}

/// One child slot of an indirect block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildBlock {
    /// Child address; undefined when the block is not allocated.
    pub address: u64,
    /// Stored size and mask, direct children of filtered heaps only.
    pub filtered: Option<FilteredBlock>,
}

/// A decoded direct block.
#[derive(Debug, Clone)]
pub struct DirectBlock {
    /// Block address.
    pub address: u64,
    /// Heap offset of the first byte of the block.
    pub block_offset: u64,
    data: Bytes,
}

impl DirectBlock {
    /// Reads (or fetches from cache) the direct block at `address`.
    pub(crate) fn read(
        ctx: &Context,
        header: &FractalHeapHeader,
        address: u64,
        block_size: u64,
        filtered: Option<FilteredBlock>,
    ) -> Result<Arc<Self>> {
        ctx.cached(address, Structure::FractalHeapDirectBlock, || {
            Self::decode(ctx, header, address, block_size, filtered)
        })
    }

    fn decode(
        ctx: &Context,
        header: &FractalHeapHeader,
        address: u64,
        block_size: u64,
        filtered: Option<FilteredBlock>,
    ) -> Result<Self> {
        let structure = Structure::FractalHeapDirectBlock;
        let to_len = |n: u64| {
            usize::try_from(n)
                .map_err(|_| Error::bounds(structure, address, "block size overflows"))
        };
        let full_len = to_len(block_size)?;
        let data = match (&header.pipeline, filtered) {
            (Some(pipeline), Some(stored)) => {
                let raw = ctx.read_bytes(address, to_len(stored.size)?, structure)?;
                ctx.filters().apply_pipeline(
                    pipeline,
                    stored.filter_mask,
                    FilterDirection::Decompress,
                    raw,
                    full_len,
                )?
            }
            _ => ctx.read_bytes(address, full_len, structure)?,
        };
        if data.len() != full_len {
            return Err(Error::format(
                structure,
                address,
                format!("block holds {} bytes, expected {}", data.len(), full_len),
            ));
        }

        let mut c = FieldCursor::new(data.clone(), ctx.sizes(), structure, address);
        c.expect_signature(DIRECT_SIGNATURE)?;
        c.expect_version(&[0])?;
        let heap_address = c.read_offset()?;
        if heap_address != header.address {
            return Err(c.format_error(format!(
                "block belongs to heap {:#x}, not {:#x}",
                heap_address, header.address
            )));
        }
        let block_offset = c.read_uint(header.heap_offset_size())?;
        if header.checksums_direct_blocks() && ctx.options().verify_checksums {
            let at = c.position();
            let expected = c.read_u32()?;
            let mut scratch = data.to_vec();
            scratch[at..at + 4].fill(0);
            let actual = checksum::checksum(&scratch);
            if expected != actual {
                return Err(Error::ChecksumMismatch { structure, address, expected, actual });
            }
        }
        Ok(Self { address, block_offset, data })
    }

    /// Full block contents, prefix included.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// A decoded indirect block.
#[derive(Debug, Clone)]
pub struct IndirectBlock {
    /// Block address.
    pub address: u64,
    /// Heap offset of the first byte covered by the block.
    pub block_offset: u64,
    /// Number of rows.
    pub rows: usize,
    /// Child slots in row-major order.
    pub children: Vec<ChildBlock>,
}

impl IndirectBlock {
    /// Reads (or fetches from cache) the indirect block at `address`.
    pub(crate) fn read(
        ctx: &Context,
        header: &FractalHeapHeader,
        address: u64,
        rows: usize,
    ) -> Result<Arc<Self>> {
        ctx.cached(address, Structure::FractalHeapIndirectBlock, || {
            Self::decode(ctx, header, address, rows)
        })
    }

    /// Encoded size of a block of `rows` rows.
    pub(crate) fn encoded_size(header: &FractalHeapHeader, rows: usize) -> usize {
        let (direct, indirect) = header.child_counts(rows);
        let o = header.sizes.offset_size();
        let direct_entry = if header.pipeline.is_some() {
            o + header.sizes.length_size() + 4
        } else {
            o
        };
        4 + 1 + o + header.heap_offset_size() + direct * direct_entry + indirect * o + 4
    }

    fn decode(
        ctx: &Context,
        header: &FractalHeapHeader,
        address: u64,
        rows: usize,
    ) -> Result<Self> {
        let len = Self::encoded_size(header, rows);
        let mut c = ctx.read_checked(address, len, Structure::FractalHeapIndirectBlock)?;
        c.expect_signature(INDIRECT_SIGNATURE)?;
        c.expect_version(&[0])?;
        let heap_address = c.read_offset()?;
        if heap_address != header.address {
            return Err(c.format_error(format!(
                "block belongs to heap {:#x}, not {:#x}",
                heap_address, header.address
            )));
        }
        let block_offset = c.read_uint(header.heap_offset_size())?;

        let (direct, indirect) = header.child_counts(rows);
        let mut children = Vec::with_capacity(direct + indirect);
        for _ in 0..direct {
            let address = c.read_offset()?;
            let filtered = if header.pipeline.is_some() {
                let size = c.read_length()?;
                let filter_mask = c.read_u32()?;
                is_defined(address).then_some(FilteredBlock { size, filter_mask })
            } else {
                None
            };
            children.push(ChildBlock { address, filtered });
        }
        for _ in 0..indirect {
            children.push(ChildBlock { address: c.read_offset()?, filtered: None });
        }
        Ok(Self { address, block_offset, rows, children })
    }
}

/// Encodes a direct block of `block_size` bytes around `objects`, which
/// start right after the prefix.
pub(crate) fn encode_direct_block(
    header: &FractalHeapHeader,
    block_offset: u64,
    objects: &[u8],
    block_size: usize,
) -> Bytes {
    let mut w = FieldWriter::new(header.sizes);
    w.put_slice(DIRECT_SIGNATURE);
    w.put_u8(0);
    w.put_offset(header.address);
    w.put_uint(block_offset, header.heap_offset_size());
    let checksum_at = header.checksums_direct_blocks().then(|| {
        let at = w.len();
        w.put_u32(0);
        at
    });
    w.put_slice(objects);
    w.pad_to(block_size);
    if let Some(at) = checksum_at {
        let sum = checksum::checksum(w.as_slice());
        w.patch_u32(at, sum);
    }
    w.finish()
}

/// Encodes an indirect block.
pub(crate) fn encode_indirect_block(
    header: &FractalHeapHeader,
    block_offset: u64,
    rows: usize,
    children: &[ChildBlock],
) -> Bytes {
    let (direct, _) = header.child_counts(rows);
    let mut w = FieldWriter::new(header.sizes);
    w.put_slice(INDIRECT_SIGNATURE);
    w.put_u8(0);
    w.put_offset(header.address);
    w.put_uint(block_offset, header.heap_offset_size());
    for (i, child) in children.iter().enumerate() {
        w.put_offset(child.address);
        if i < direct && header.pipeline.is_some() {
            let stored = child.filtered.unwrap_or(FilteredBlock { size: 0, filter_mask: 0 });
            w.put_length(stored.size);
            w.put_u32(stored.filter_mask);
        }
    }
    w.put_checksum();
    w.finish()
}
