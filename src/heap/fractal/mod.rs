//! Fractal heaps: dense storage for links, attributes and shared messages.
//!
//! ```text
//! header: ["FRHP"][version=0][heap id length: u16][filter info length: u16]
//!         [flags][max managed object size: u32]
//!         [next huge id: L][huge object B-tree: O][free space: L]
//!         [free space manager: O][managed space: L][allocated managed space: L]
//!         [allocation iterator offset: L][managed objects: L]
//!         [huge object size: L][huge objects: L][tiny object size: L][tiny objects: L]
//!         [table width: u16][starting block size: L][max direct block size: L]
//!         [max heap size, bits: u16][starting root rows: u16][root block: O]
//!         [root rows: u16]
//!         [filtered root size: L][root filter mask: u32][filter pipeline]  (filtered heaps)
//!         [checksum]
//! ```
//!
//! Objects are addressed by opaque ids (see [`HeapId`]). Managed objects
//! live in direct blocks reached through a tree of indirect blocks laid out
//! by the [`DoublingTable`]; a heap with zero root rows has a single direct
//! block as its root.

mod blocks;
mod builder;
mod id;
pub mod table;

pub use blocks::{ChildBlock, DirectBlock, FilteredBlock, IndirectBlock};
pub use builder::FractalHeapBuilder;
pub use id::HeapId;
pub use table::DoublingTable;

use crate::btree::v2::limit_enc_size;
use crate::btree::{BTreeV2, Record};
use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::filter::FilterDirection;
use crate::io::{is_defined, FieldCursor, FieldWriter, Sizes};
use crate::object::messages::FilterPipelineMessage;
use bytes::Bytes;
use log::debug;
use std::sync::Arc;

pub(crate) const SIGNATURE: &[u8; 4] = b"FRHP";

/// Huge object ids wrap around instead of failing when exhausted.
pub const FLAG_HUGE_IDS_WRAPPED: u8 = 0x01;
/// Direct blocks carry a checksum.
pub const FLAG_CHECKSUM_DIRECT_BLOCKS: u8 = 0x02;

/// Longest tiny object whose length fits in the id's first byte.
const TINY_LEN_SHORT: usize = 16;

/// Decoded fractal heap header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FractalHeapHeader {
    /// Header address.
    pub address: u64,
    /// File field widths.
    pub sizes: Sizes,
    /// Length of every heap id.
    pub heap_id_len: u16,
    /// Heap flags.
    pub flags: u8,
    /// Largest object stored in direct blocks.
    pub max_managed_size: u32,
    /// Next huge object id to hand out.
    pub next_huge_id: u64,
    /// B-tree indexing huge objects.
    pub huge_btree_address: u64,
    /// Free space in managed blocks.
    pub free_space: u64,
    /// Free space manager address.
    pub free_space_manager: u64,
    /// Managed space in the heap.
    pub managed_space: u64,
    /// Managed space allocated in blocks.
    pub allocated_managed_space: u64,
    /// Direct block allocation iterator offset.
    pub iterator_offset: u64,
    /// Managed object count.
    pub managed_count: u64,
    /// Bytes in huge objects.
    pub huge_size: u64,
    /// Huge object count.
    pub huge_count: u64,
    /// Bytes in tiny objects.
    pub tiny_size: u64,
    /// Tiny object count.
    pub tiny_count: u64,
    /// Block geometry.
    pub table: DoublingTable,
    /// Rows in the root indirect block when it was created.
    pub starting_root_rows: u16,
    /// Root block address.
    pub root_address: u64,
    /// Rows in the root indirect block; 0 when the root is a direct block.
    pub root_rows: u16,
    /// Stored size and mask of a filtered root direct block.
    pub filtered_root: Option<FilteredBlock>,
    /// Filters applied to direct blocks and huge objects.
    pub pipeline: Option<FilterPipelineMessage>,
}

impl FractalHeapHeader {
    fn fixed_size(sizes: Sizes) -> usize {
        22 + 12 * sizes.length_size() + 3 * sizes.offset_size()
    }

    /// Encoded size, checksum included.
    pub fn encoded_size(&self) -> usize {
        let filter = match &self.pipeline {
            Some(pipeline) => self.sizes.length_size() + 4 + pipeline.encode().len(),
            None => 0,
        };
        Self::fixed_size(self.sizes) + filter + 4
    }

    fn decode(ctx: &Context, address: u64) -> Result<Self> {
        let sizes = ctx.sizes();
        let fixed = Self::fixed_size(sizes);
        let mut prefix = ctx.read(address, fixed, Structure::FractalHeapHeader)?;
        prefix.seek(7)?;
        let filter_len = prefix.read_u16()? as usize;
        let filter_part = if filter_len > 0 { sizes.length_size() + 4 + filter_len } else { 0 };

        let mut c =
            ctx.read_checked(address, fixed + filter_part + 4, Structure::FractalHeapHeader)?;
        c.expect_signature(SIGNATURE)?;
        c.expect_version(&[0])?;
        let heap_id_len = c.read_u16()?;
        c.skip(2)?;
        let flags = c.read_u8()?;
        let max_managed_size = c.read_u32()?;
        let next_huge_id = c.read_length()?;
        let huge_btree_address = c.read_offset()?;
        let free_space = c.read_length()?;
        let free_space_manager = c.read_offset()?;
        let managed_space = c.read_length()?;
        let allocated_managed_space = c.read_length()?;
        let iterator_offset = c.read_length()?;
        let managed_count = c.read_length()?;
        let huge_size = c.read_length()?;
        let huge_count = c.read_length()?;
        let tiny_size = c.read_length()?;
        let tiny_count = c.read_length()?;
        let width = c.read_u16()?;
        let start_block_size = c.read_length()?;
        let max_direct_block_size = c.read_length()?;
        let max_heap_bits = c.read_u16()?;
        let starting_root_rows = c.read_u16()?;
        let root_address = c.read_offset()?;
        let root_rows = c.read_u16()?;

        let table =
            DoublingTable::new(width, start_block_size, max_direct_block_size, max_heap_bits)
                .ok_or_else(|| {
                    c.format_error(format!(
                        "bad geometry: width {}, start {}, max direct {}, heap bits {}",
                        width, start_block_size, max_direct_block_size, max_heap_bits
                    ))
                })?;
        if root_rows as usize > table.max_root_rows {
            return Err(c.format_error(format!(
                "{} root rows, at most {}",
                root_rows, table.max_root_rows
            )));
        }
        if heap_id_len < 2 {
            return Err(c.format_error(format!("heap id length {}", heap_id_len)));
        }

        let (filtered_root, pipeline) = if filter_len > 0 {
            let size = c.read_length()?;
            let filter_mask = c.read_u32()?;
            let raw = c.read_bytes(filter_len)?;
            let mut pc = FieldCursor::new(raw, sizes, Structure::FractalHeapHeader, address);
            let pipeline = FilterPipelineMessage::decode(&mut pc)?;
            (Some(FilteredBlock { size, filter_mask }), Some(pipeline))
        } else {
            (None, None)
        };

        debug!(
            "Fractal heap at {:#x}: width {}, start {}, max direct {}, {} root rows{}",
            address,
            width,
            start_block_size,
            max_direct_block_size,
            root_rows,
            if pipeline.is_some() { ", filtered" } else { "" }
        );

        Ok(Self {
            address,
            sizes,
            heap_id_len,
            flags,
            max_managed_size,
            next_huge_id,
            huge_btree_address,
            free_space,
            free_space_manager,
            managed_space,
            allocated_managed_space,
            iterator_offset,
            managed_count,
            huge_size,
            huge_count,
            tiny_size,
            tiny_count,
            table,
            starting_root_rows,
            root_address,
            root_rows,
            filtered_root,
            pipeline,
        })
    }

    /// Encodes the header, checksum included.
    pub fn encode(&self) -> Bytes {
        let filter_info = self.pipeline.as_ref().map(|p| p.encode());
        let mut w = FieldWriter::new(self.sizes);
        w.put_slice(SIGNATURE);
        w.put_u8(0);
        w.put_u16(self.heap_id_len);
        w.put_u16(filter_info.as_ref().map_or(0, |f| f.len() as u16));
        w.put_u8(self.flags);
        w.put_u32(self.max_managed_size);
        w.put_length(self.next_huge_id);
        w.put_offset(self.huge_btree_address);
        w.put_length(self.free_space);
        w.put_offset(self.free_space_manager);
        w.put_length(self.managed_space);
        w.put_length(self.allocated_managed_space);
        w.put_length(self.iterator_offset);
        w.put_length(self.managed_count);
        w.put_length(self.huge_size);
        w.put_length(self.huge_count);
        w.put_length(self.tiny_size);
        w.put_length(self.tiny_count);
        w.put_u16(self.table.width as u16);
        w.put_length(self.table.start_block_size);
        w.put_length(self.table.max_direct_block_size);
        w.put_u16(self.table.max_heap_bits);
        w.put_u16(self.starting_root_rows);
        w.put_offset(self.root_address);
        w.put_u16(self.root_rows);
        if let Some(info) = filter_info {
            let root = self.filtered_root.unwrap_or(FilteredBlock { size: 0, filter_mask: 0 });
            w.put_length(root.size);
            w.put_u32(root.filter_mask);
            w.put_slice(&info);
        }
        w.put_checksum();
        w.finish()
    }

    /// Width of heap offsets in ids and block prefixes.
    pub fn heap_offset_size(&self) -> usize {
        self.table.offset_size()
    }

    /// Width of managed object lengths in ids.
    pub fn heap_length_size(&self) -> usize {
        self.table
            .direct_offset_size()
            .min(limit_enc_size(self.max_managed_size as u64))
    }

    /// Tiny ids spend a second byte on the length.
    pub fn tiny_extended(&self) -> bool {
        self.heap_id_len as usize - 1 > TINY_LEN_SHORT + 1
    }

    /// Longest object stored as a tiny id.
    pub fn tiny_max_len(&self) -> usize {
        let room = self.heap_id_len as usize - 1;
        if room <= TINY_LEN_SHORT {
            room
        } else if room == TINY_LEN_SHORT + 1 {
            TINY_LEN_SHORT
        } else {
            room - 1
        }
    }

    /// Huge ids hold the object address instead of a B-tree key.
    pub fn huge_ids_direct(&self) -> bool {
        let o = self.sizes.offset_size();
        let l = self.sizes.length_size();
        let needed = if self.pipeline.is_some() { o + l + 4 + l } else { o + l };
        self.heap_id_len as usize - 1 >= needed
    }

    /// Width of B-tree keyed huge ids.
    pub fn huge_id_size(&self) -> usize {
        (self.heap_id_len as usize - 1).min(8)
    }

    /// Direct blocks carry a checksum.
    pub fn checksums_direct_blocks(&self) -> bool {
        self.flags & FLAG_CHECKSUM_DIRECT_BLOCKS != 0
    }

    /// Size of a direct block's prefix.
    pub fn direct_block_prefix_size(&self) -> usize {
        let checksum = if self.checksums_direct_blocks() { 4 } else { 0 };
        4 + 1 + self.sizes.offset_size() + self.heap_offset_size() + checksum
    }

    /// Direct and indirect child slots of an indirect block of `rows` rows.
    pub fn child_counts(&self, rows: usize) -> (usize, usize) {
        let width = self.table.width as usize;
        let direct = rows.min(self.table.max_direct_rows) * width;
        let indirect = rows.saturating_sub(self.table.max_direct_rows) * width;
        (direct, indirect)
    }
}

/// An open fractal heap.
#[derive(Debug, Clone)]
pub struct FractalHeap {
    ctx: Context,
    header: Arc<FractalHeapHeader>,
}

impl FractalHeap {
    /// Opens the heap whose header is at `address`.
    pub fn open(ctx: &Context, address: u64) -> Result<Self> {
        let header = ctx.cached(address, Structure::FractalHeapHeader, || {
            FractalHeapHeader::decode(ctx, address)
        })?;
        Ok(Self { ctx: ctx.clone(), header })
    }

    /// The decoded header.
    pub fn header(&self) -> &FractalHeapHeader {
        &self.header
    }

    /// Returns the bytes of the object identified by `id`.
    pub fn resolve(&self, id: &[u8]) -> Result<Bytes> {
        match HeapId::parse(id, &self.header)? {
            HeapId::Managed { offset, length } => self.read_managed(offset, length),
            HeapId::Tiny(data) => Ok(data),
            HeapId::HugeDirect { address, length, filtered } => {
                self.read_huge(address, length, filtered)
            }
            HeapId::HugeIndirect { id } => self.read_huge_indexed(id),
        }
    }

    fn read_managed(&self, offset: u64, length: u64) -> Result<Bytes> {
        let block = self.direct_block_for(offset)?;
        let data = block.data();
        let start = offset
            .checked_sub(block.block_offset)
            .and_then(|rel| usize::try_from(rel).ok())
            .filter(|rel| *rel >= self.header.direct_block_prefix_size());
        let range = start.and_then(|start| {
            let end = start.checked_add(usize::try_from(length).ok()?)?;
            (end <= data.len()).then_some(start..end)
        });
        match range {
            Some(range) => Ok(data.slice(range)),
            None => Err(Error::bounds(
                Structure::FractalHeapDirectBlock,
                block.address,
                format!(
                    "object at heap offset {} ({} bytes) outside block at heap offset {}",
                    offset, length, block.block_offset
                ),
            )),
        }
    }

    fn direct_block_for(&self, offset: u64) -> Result<Arc<DirectBlock>> {
        let header = &*self.header;
        let table = &header.table;
        let unallocated = |address: u64| {
            Error::bounds(
                Structure::FractalHeapIndirectBlock,
                address,
                format!("heap offset {} is in an unallocated block", offset),
            )
        };
        if !is_defined(header.root_address) {
            return Err(unallocated(header.address));
        }
        if header.root_rows == 0 {
            return DirectBlock::read(
                &self.ctx,
                header,
                header.root_address,
                table.start_block_size,
                header.filtered_root,
            );
        }

        let mut block =
            IndirectBlock::read(&self.ctx, header, header.root_address, header.root_rows as usize)?;
        let mut relative = offset;
        loop {
            let (row, col) = table.lookup(relative);
            if row >= block.rows {
                return Err(Error::bounds(
                    Structure::FractalHeapIndirectBlock,
                    block.address,
                    format!("heap offset {} beyond {} rows", offset, block.rows),
                ));
            }
            let slot = row * table.width as usize + col as usize;
            let child =
                block.children.get(slot).copied().ok_or_else(|| unallocated(block.address))?;
            if !is_defined(child.address) {
                return Err(unallocated(block.address));
            }
            let (Some(size), Some(row_offset)) =
                (table.row_block_size(row), table.row_block_offset(row))
            else {
                return Err(unallocated(block.address));
            };
            if row < table.max_direct_rows {
                return DirectBlock::read(&self.ctx, header, child.address, size, child.filtered);
            }
            relative -= row_offset + col * size;
            let rows = table.indirect_rows(row);
            block = IndirectBlock::read(&self.ctx, header, child.address, rows)?;
        }
    }

    fn read_huge(&self, address: u64, length: u64, filtered: Option<(u32, u64)>) -> Result<Bytes> {
        let len = usize::try_from(length).map_err(|_| {
            Error::bounds(Structure::FractalHeapHeader, address, "huge object length overflows")
        })?;
        let stored = self.ctx.read_bytes(address, len, Structure::FractalHeapHeader)?;
        match (&self.header.pipeline, filtered) {
            (Some(pipeline), Some((filter_mask, memory_size))) => self.ctx.filters().apply_pipeline(
                pipeline,
                filter_mask,
                FilterDirection::Decompress,
                stored,
                memory_size as usize,
            ),
            _ => Ok(stored),
        }
    }

    fn read_huge_indexed(&self, id: u64) -> Result<Bytes> {
        let tree = BTreeV2::open(&self.ctx, self.header.huge_btree_address)?;
        let record_type = tree.header().record_type;
        if record_type != 1 && record_type != 2 {
            return Err(Error::format(
                Structure::BTreeV2Header,
                self.header.huge_btree_address,
                format!("record type {} indexing huge objects", record_type),
            ));
        }
        let found = tree.find(|record| match record {
            Record::HugeIndirect { id: other, .. }
            | Record::HugeIndirectFiltered { id: other, .. } => id.cmp(other),
            _ => std::cmp::Ordering::Less,
        })?;
        match found {
            Some(Record::HugeIndirect { address, length, .. }) => {
                self.read_huge(address, length, None)
            }
            Some(Record::HugeIndirectFiltered {
                address,
                length,
                filter_mask,
                memory_size,
                ..
            }) => self.read_huge(address, length, Some((filter_mask, memory_size))),
            _ => Err(Error::not_found(format!(
                "huge object {} in heap {:#x}",
                id, self.header.address
            ))),
        }
    }
}
