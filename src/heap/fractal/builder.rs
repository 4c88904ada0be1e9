//! Writes fractal heaps.
//!
//! Managed objects are packed into direct blocks in heap offset order, the
//! way a heap grows by appending: the root direct block first, then row by
//! row through the root indirect block, descending into child indirect
//! blocks for rows past the direct block limit.

use super::blocks::{encode_direct_block, encode_indirect_block, ChildBlock, FilteredBlock};
use super::{DoublingTable, FractalHeapHeader, HeapId, FLAG_CHECKSUM_DIRECT_BLOCKS};
use crate::btree::{BTreeV2Builder, Record, RecordLayout};
use crate::error::{Error, Result};
use crate::filter::{FilterDirection, FilterRegistry};
use crate::io::{FileImage, UNDEFINED_ADDRESS};
use crate::object::messages::FilterPipelineMessage;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// How one inserted object is stored.
enum Placement {
    Tiny,
    Huge,
    Managed { block: usize, position: usize },
}

/// A direct block being filled.
struct PendingBlock {
    heap_offset: u64,
    size: u64,
    contents: Vec<u8>,
}

/// Collects objects and writes them as one fractal heap.
#[derive(Debug, Clone)]
pub struct FractalHeapBuilder {
    heap_id_len: u16,
    table_width: u16,
    start_block_size: u64,
    max_direct_block_size: u64,
    max_heap_bits: u16,
    max_managed_size: u32,
    checksum_direct_blocks: bool,
    filters: Option<(FilterPipelineMessage, Arc<FilterRegistry>)>,
    objects: Vec<Bytes>,
}

impl Default for FractalHeapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FractalHeapBuilder {
    /// A builder with the library's dense storage defaults.
    pub fn new() -> Self {
        Self {
            heap_id_len: 8,
            table_width: 4,
            start_block_size: 512,
            max_direct_block_size: 65_536,
            max_heap_bits: 32,
            max_managed_size: 4096,
            checksum_direct_blocks: false,
            filters: None,
            objects: Vec::new(),
        }
    }

    /// Sets the heap id length.
    pub fn heap_id_len(mut self, len: u16) -> Self {
        self.heap_id_len = len;
        self
    }

    /// Sets the number of blocks per row.
    pub fn table_width(mut self, width: u16) -> Self {
        self.table_width = width;
        self
    }

    /// Sets the size of the smallest direct blocks.
    pub fn start_block_size(mut self, size: u64) -> Self {
        self.start_block_size = size;
        self
    }

    /// Sets the size of the largest direct blocks.
    pub fn max_direct_block_size(mut self, size: u64) -> Self {
        self.max_direct_block_size = size;
        self
    }

    /// Sets the largest object kept in direct blocks.
    pub fn max_managed_size(mut self, size: u32) -> Self {
        self.max_managed_size = size;
        self
    }

    /// Enables direct block checksums.
    pub fn checksum_direct_blocks(mut self, value: bool) -> Self {
        self.checksum_direct_blocks = value;
        self
    }

    /// Filters direct blocks and huge objects with `pipeline`.
    pub fn filters(
        mut self,
        pipeline: FilterPipelineMessage,
        registry: Arc<FilterRegistry>,
    ) -> Self {
        self.filters = Some((pipeline, registry));
        self
    }

    /// Queues an object; ids are returned by [`FractalHeapBuilder::write`]
    /// in insertion order.
    pub fn insert(&mut self, data: &[u8]) -> usize {
        self.objects.push(Bytes::copy_from_slice(data));
        self.objects.len() - 1
    }

    fn header(&self, image: &FileImage) -> Result<FractalHeapHeader> {
        let table = DoublingTable::new(
            self.table_width,
            self.start_block_size,
            self.max_direct_block_size,
            self.max_heap_bits,
        )
        .ok_or_else(|| Error::invalid_argument("inconsistent fractal heap geometry"))?;
        let header = FractalHeapHeader {
            address: UNDEFINED_ADDRESS,
            sizes: image.sizes(),
            heap_id_len: self.heap_id_len,
            flags: if self.checksum_direct_blocks { FLAG_CHECKSUM_DIRECT_BLOCKS } else { 0 },
            max_managed_size: self.max_managed_size,
            next_huge_id: 1,
            huge_btree_address: UNDEFINED_ADDRESS,
            free_space: 0,
            free_space_manager: UNDEFINED_ADDRESS,
            managed_space: 0,
            allocated_managed_space: 0,
            iterator_offset: 0,
            managed_count: 0,
            huge_size: 0,
            huge_count: 0,
            tiny_size: 0,
            tiny_count: 0,
            table,
            starting_root_rows: 1,
            root_address: UNDEFINED_ADDRESS,
            root_rows: 0,
            filtered_root: None,
            pipeline: self.filters.as_ref().map(|(pipeline, _)| pipeline.clone()),
        };
        if self.heap_id_len < 2
            || 1 + header.heap_offset_size() + header.heap_length_size() > self.heap_id_len as usize
        {
            return Err(Error::invalid_argument(format!(
                "heap id length {} cannot hold managed ids",
                self.heap_id_len
            )));
        }
        Ok(header)
    }

    fn filter(&self, data: Bytes, size: usize) -> Result<Bytes> {
        match &self.filters {
            Some((pipeline, registry)) => {
                registry.apply_pipeline(pipeline, 0, FilterDirection::Compress, data, size)
            }
            None => Ok(data),
        }
    }

    /// Writes the heap. Returns the header address and one id per inserted
    /// object.
    pub fn write(&self, image: &mut FileImage) -> Result<(u64, Vec<Bytes>)> {
        let mut header = self.header(image)?;
        header.address = image.allocate(header.encoded_size());
        let table = header.table.clone();
        let prefix = header.direct_block_prefix_size();

        // Place managed objects block by block, generating rows on demand.
        let mut blocks: Vec<PendingBlock> = Vec::new();
        let mut rows = 0usize;
        let mut current = 0usize;
        let mut placements = Vec::with_capacity(self.objects.len());
        for data in &self.objects {
            let len = data.len();
            if len == 0 {
                return Err(Error::invalid_argument("zero-length heap object"));
            }
            if len <= header.tiny_max_len() {
                placements.push(Placement::Tiny);
                continue;
            }
            if len > self.max_managed_size as usize
                || len + prefix > table.max_direct_block_size as usize
            {
                placements.push(Placement::Huge);
                continue;
            }
            loop {
                if current == blocks.len() {
                    if rows >= table.max_root_rows {
                        return Err(Error::invalid_argument("fractal heap is full"));
                    }
                    push_row(&table, rows, 0, &mut blocks);
                    rows += 1;
                    continue;
                }
                let block = &mut blocks[current];
                if prefix + block.contents.len() + len <= block.size as usize {
                    let position = prefix + block.contents.len();
                    block.contents.extend_from_slice(data);
                    placements.push(Placement::Managed { block: current, position });
                    break;
                }
                current += 1;
            }
        }

        let used_blocks = placements
            .iter()
            .filter_map(|p| match p {
                Placement::Managed { block, .. } => Some(*block + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        blocks.truncate(used_blocks);
        let root_is_direct = used_blocks == 1;
        let root_rows = if root_is_direct || used_blocks == 0 {
            0
        } else {
            let last = &blocks[used_blocks - 1];
            (1..=rows).find(|r| table.span(*r) > last.heap_offset).unwrap_or(rows)
        };

        // Direct blocks.
        let mut written: HashMap<u64, ChildBlock> = HashMap::new();
        for block in &blocks {
            let size = block.size as usize;
            let raw = encode_direct_block(&header, block.heap_offset, &block.contents, size);
            let stored = self.filter(raw, size)?;
            let address = image.append(&stored);
            let filtered = header
                .pipeline
                .is_some()
                .then_some(FilteredBlock { size: stored.len() as u64, filter_mask: 0 });
            written.insert(block.heap_offset, ChildBlock { address, filtered });
        }

        if let (true, Some(root)) = (root_is_direct, written.get(&0)) {
            header.root_address = root.address;
            header.filtered_root = root.filtered;
            header.managed_space = table.start_block_size;
        } else if used_blocks > 0 {
            header.root_address = write_indirect(image, &header, root_rows, 0, &written);
            header.root_rows = root_rows as u16;
            header.managed_space = table.span(root_rows);
        }
        if header.pipeline.is_some() && header.filtered_root.is_none() {
            header.filtered_root = Some(FilteredBlock { size: 0, filter_mask: 0 });
        }
        header.allocated_managed_space = blocks.iter().map(|b| b.size).sum();
        header.iterator_offset = blocks.last().map_or(0, |b| b.heap_offset + b.size);
        header.free_space = blocks
            .iter()
            .map(|b| b.size - (prefix + b.contents.len()) as u64)
            .sum();

        // Huge objects, then the ids of everything.
        let huge_direct = header.huge_ids_direct();
        let filtered_huge = header.pipeline.is_some();
        let mut huge_records = Vec::new();
        let mut ids = Vec::with_capacity(self.objects.len());
        for (data, placement) in self.objects.iter().zip(&placements) {
            let id = match placement {
                Placement::Tiny => {
                    header.tiny_count += 1;
                    header.tiny_size += data.len() as u64;
                    HeapId::Tiny(data.clone())
                }
                Placement::Managed { block, position } => {
                    header.managed_count += 1;
                    HeapId::Managed {
                        offset: blocks[*block].heap_offset + *position as u64,
                        length: data.len() as u64,
                    }
                }
                Placement::Huge => {
                    let stored = self.filter(data.clone(), data.len())?;
                    let address = image.append(&stored);
                    let length = stored.len() as u64;
                    header.huge_count += 1;
                    header.huge_size += length;
                    if huge_direct {
                        HeapId::HugeDirect {
                            address,
                            length,
                            filtered: filtered_huge.then_some((0, data.len() as u64)),
                        }
                    } else {
                        let id = header.next_huge_id;
                        header.next_huge_id += 1;
                        huge_records.push(if filtered_huge {
                            Record::HugeIndirectFiltered {
                                address,
                                length,
                                filter_mask: 0,
                                memory_size: data.len() as u64,
                                id,
                            }
                        } else {
                            Record::HugeIndirect { address, length, id }
                        });
                        HeapId::HugeIndirect { id }
                    }
                }
            };
            ids.push(id.encode(&header));
        }
        if !huge_records.is_empty() {
            let record_type = if filtered_huge { 2 } else { 1 };
            let layout = RecordLayout::new(record_type, image.sizes());
            header.huge_btree_address = BTreeV2Builder::new(layout).write(image, &huge_records)?;
        }

        image.write_at(header.address, &header.encode());
        Ok((header.address, ids))
    }
}

/// Appends the direct blocks of `row` of an indirect block covering heap
/// space from `base`, in heap offset order.
fn push_row(table: &DoublingTable, row: usize, base: u64, out: &mut Vec<PendingBlock>) {
    let (Some(size), Some(row_offset)) = (table.row_block_size(row), table.row_block_offset(row))
    else {
        return;
    };
    for col in 0..table.width {
        let heap_offset = base + row_offset + col * size;
        if row < table.max_direct_rows {
            out.push(PendingBlock { heap_offset, size, contents: Vec::new() });
        } else {
            for child_row in 0..table.indirect_rows(row) {
                push_row(table, child_row, heap_offset, out);
            }
        }
    }
}

/// Writes the indirect block covering heap space from `base` and every
/// child indirect block under it that holds written direct blocks.
fn write_indirect(
    image: &mut FileImage,
    header: &FractalHeapHeader,
    rows: usize,
    base: u64,
    written: &HashMap<u64, ChildBlock>,
) -> u64 {
    let table = &header.table;
    let unallocated = ChildBlock { address: UNDEFINED_ADDRESS, filtered: None };
    let mut children = Vec::with_capacity(rows * table.width as usize);
    for row in 0..rows {
        let (Some(size), Some(row_offset)) =
            (table.row_block_size(row), table.row_block_offset(row))
        else {
            break;
        };
        for col in 0..table.width {
            let heap_offset = base + row_offset + col * size;
            let child = if row < table.max_direct_rows {
                written.get(&heap_offset).copied().unwrap_or(unallocated)
            } else if written.keys().any(|k| *k >= heap_offset && *k < heap_offset + size) {
                let child_rows = table.indirect_rows(row);
                let address = write_indirect(image, header, child_rows, heap_offset, written);
                ChildBlock { address, filtered: None }
            } else {
                unallocated
            };
            children.push(child);
        }
    }
    image.append(&encode_indirect_block(header, base, rows, &children))
}
