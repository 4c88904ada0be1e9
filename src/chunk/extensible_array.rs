//! Extensible array chunk index.
//!
//! ```text
//! header:          ["EAHD"][version=0][client id][element size][max index bits]
//!                  [index block elements][data block min elements]
//!                  [secondary block min data pointers][page bits]
//!                  [secondary blocks: L][secondary block bytes: L]
//!                  [data blocks: L][data block bytes: L]
//!                  [max index set: L][elements: L][index block: O][checksum]
//! index block:     ["EAIB"][version=0][client id][header: O][elements]
//!                  [data block addresses: O x 2(m-1)][secondary block addresses: O x n][checksum]
//! secondary block: ["EASB"][version=0][client id][header: O][block offset]
//!                  [page init bitmap, paged only][data block addresses: O x k][checksum]
//! data block:      ["EADB"][version=0][client id][header: O][block offset]
//!                  unpaged: [elements][checksum]
//!                  paged:   [checksum] then pages of [elements][checksum]
//! ```
//!
//! Elements past the index block are grouped into super blocks `s` of
//! `2^(s/2)` data blocks holding `2^((s+1)/2) * min elements` each. The
//! first `2 log2(m)` super blocks keep their data block addresses in the
//! index block; the rest get a secondary block.

use super::{ChunkGeometry, ChunkLocation, EntryFormat};
use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::io::{is_defined, FieldCursor, FileImage, Sizes, UNDEFINED_ADDRESS};
use crate::object::messages::ChunkIndexInfo;
use log::debug;
use std::sync::Arc;

const HEADER_SIGNATURE: &[u8; 4] = b"EAHD";
const INDEX_BLOCK_SIGNATURE: &[u8; 4] = b"EAIB";
const SECONDARY_BLOCK_SIGNATURE: &[u8; 4] = b"EASB";
const DATA_BLOCK_SIGNATURE: &[u8; 4] = b"EADB";

/// Creation parameters of an extensible array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensibleArrayParams {
    /// Bits needed to store the maximum number of elements.
    pub max_bits: u8,
    /// Elements stored directly in the index block.
    pub index_elements: u8,
    /// Minimum data block pointers in a secondary block (a power of two).
    pub min_pointers: u8,
    /// Minimum elements in a data block (a power of two).
    pub min_elements: u8,
    /// log2 of the elements in a data block page.
    pub page_bits: u8,
}

impl Default for ExtensibleArrayParams {
    fn default() -> Self {
        Self { max_bits: 32, index_elements: 4, min_pointers: 4, min_elements: 16, page_bits: 10 }
    }
}

#[derive(Debug, Clone, Copy)]
struct SuperBlockInfo {
    data_blocks: u64,
    block_elements: u64,
    start_index: u64,
    start_block: u64,
}

/// Tier arithmetic derived from the creation parameters.
#[derive(Debug, Clone)]
struct Tiers {
    params: ExtensibleArrayParams,
    super_blocks: Vec<SuperBlockInfo>,
    array_offset_size: usize,
    index_data_blocks: usize,
    direct_super_blocks: usize,
    page_elements: u64,
}

impl Tiers {
    fn new(params: ExtensibleArrayParams) -> std::result::Result<Self, String> {
        let power_of_two = |v: u8| v > 0 && v.is_power_of_two();
        if !power_of_two(params.min_elements) || !power_of_two(params.min_pointers) {
            return Err(format!(
                "minimum elements {} and pointers {} must be powers of two",
                params.min_elements, params.min_pointers
            ));
        }
        let min_elements_bits = params.min_elements.trailing_zeros() as u8;
        if params.max_bits > 64 || params.max_bits < min_elements_bits {
            return Err(format!("max index bits {}", params.max_bits));
        }
        if params.page_bits >= 32 {
            return Err(format!("page bits {}", params.page_bits));
        }

        let count = 1 + (params.max_bits - min_elements_bits) as usize;
        let mut super_blocks = Vec::with_capacity(count);
        let (mut start_index, mut start_block) = (0u64, 0u64);
        for s in 0..count {
            let info = SuperBlockInfo {
                data_blocks: 1 << (s / 2),
                block_elements: (1u64 << ((s + 1) / 2)) * params.min_elements as u64,
                start_index,
                start_block,
            };
            start_index =
                start_index.saturating_add(info.data_blocks.saturating_mul(info.block_elements));
            start_block += info.data_blocks;
            super_blocks.push(info);
        }
        let direct_super_blocks = (2 * params.min_pointers.trailing_zeros() as usize).min(count);
        Ok(Self {
            params,
            super_blocks,
            array_offset_size: (params.max_bits as usize).div_ceil(8),
            index_data_blocks: 2 * (params.min_pointers as usize - 1),
            direct_super_blocks,
            page_elements: 1 << params.page_bits,
        })
    }

    // `index` must be past the index block elements.
    fn super_block_of(&self, index: u64) -> usize {
        let n = (index - self.params.index_elements as u64) / self.params.min_elements as u64;
        (63 - (n + 1).leading_zeros()) as usize
    }

    fn pages_in(&self, block_elements: u64) -> u64 {
        if block_elements > self.page_elements {
            block_elements / self.page_elements
        } else {
            0
        }
    }

    fn secondary_blocks(&self) -> usize {
        self.super_blocks.len() - self.direct_super_blocks
    }

    fn block_prefix_len(&self, sizes: Sizes) -> usize {
        6 + sizes.offset_size() + self.array_offset_size
    }
}

#[derive(Debug)]
struct ExtensibleArrayHeader {
    client_id: u8,
    element_size: u8,
    tiers: Tiers,
    max_index_set: u64,
    index_block: u64,
}

impl ExtensibleArrayHeader {
    fn encoded_size(sizes: Sizes) -> usize {
        12 + 6 * sizes.length_size() + sizes.offset_size() + 4
    }

    fn decode(ctx: &Context, address: u64) -> Result<Self> {
        let len = Self::encoded_size(ctx.sizes());
        let mut c = ctx.read_checked(address, len, Structure::ExtensibleArrayHeader)?;
        c.expect_signature(HEADER_SIGNATURE)?;
        c.expect_version(&[0])?;
        let client_id = c.read_u8()?;
        let element_size = c.read_u8()?;
        let max_bits = c.read_u8()?;
        let index_elements = c.read_u8()?;
        let min_elements = c.read_u8()?;
        let min_pointers = c.read_u8()?;
        let page_bits = c.read_u8()?;
        let params = ExtensibleArrayParams {
            max_bits,
            index_elements,
            min_pointers,
            min_elements,
            page_bits,
        };
        let tiers = Tiers::new(params).map_err(|e| c.format_error(e))?;
        // secondary/data block counts and sizes are statistics only
        c.skip(4 * c.sizes().length_size())?;
        let max_index_set = c.read_length()?;
        c.skip(c.sizes().length_size())?;
        let index_block = c.read_offset()?;
        debug!(
            "Extensible array at {:#x}: {} elements set, {} super blocks",
            address,
            max_index_set,
            tiers.super_blocks.len()
        );
        Ok(Self { client_id, element_size, tiers, max_index_set, index_block })
    }
}

#[derive(Debug)]
struct IndexBlock {
    elements: Vec<Option<ChunkLocation>>,
    data_blocks: Vec<u64>,
    secondary_blocks: Vec<u64>,
}

#[derive(Debug)]
struct SecondaryBlock {
    page_init: Vec<u8>,
    data_blocks: Vec<u64>,
}

#[derive(Debug)]
struct DataBlock(Vec<Option<ChunkLocation>>);

/// An open extensible array index.
#[derive(Debug, Clone)]
pub struct ExtensibleArrayIndex {
    ctx: Context,
    address: u64,
    header: Arc<ExtensibleArrayHeader>,
    format: EntryFormat,
    geometry: ChunkGeometry,
}

impl ExtensibleArrayIndex {
    /// Opens the array whose header is at `address`.
    pub fn open(ctx: &Context, address: u64, geometry: ChunkGeometry) -> Result<Self> {
        let header = ctx.cached(address, Structure::ExtensibleArrayHeader, || {
            ExtensibleArrayHeader::decode(ctx, address)
        })?;
        let filtered = match header.client_id {
            0 => false,
            1 => true,
            other => {
                return Err(Error::format(
                    Structure::ExtensibleArrayHeader,
                    address,
                    format!("client id {}", other),
                ))
            }
        };
        let format = EntryFormat::new(&geometry, filtered);
        if header.element_size as usize != format.size(ctx.sizes()) {
            return Err(Error::format(
                Structure::ExtensibleArrayHeader,
                address,
                format!(
                    "element size {} does not match {}",
                    header.element_size,
                    format.size(ctx.sizes())
                ),
            ));
        }
        Ok(Self { ctx: ctx.clone(), address, header, format, geometry })
    }

    pub(super) fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    /// One past the highest element index ever set.
    pub fn max_index_set(&self) -> u64 {
        self.header.max_index_set
    }

    pub(super) fn locate(&self, scaled: &[u64]) -> Result<Option<ChunkLocation>> {
        let index = self.geometry.linear_index(scaled)?;
        if index >= self.header.max_index_set || !is_defined(self.header.index_block) {
            return Ok(None);
        }
        let tiers = &self.header.tiers;
        let iblock = self
            .ctx
            .cached(self.header.index_block, Structure::ExtensibleArrayIndexBlock, || {
                self.read_index_block()
            })?;
        let index_elements = tiers.params.index_elements as u64;
        if index < index_elements {
            return Ok(iblock.elements[index as usize]);
        }

        let s = tiers.super_block_of(index);
        let info = tiers.super_blocks.get(s).copied().ok_or_else(|| {
            Error::format(
                Structure::ExtensibleArrayIndexBlock,
                self.header.index_block,
                "index beyond the last super block",
            )
        })?;
        let offset = index - index_elements - info.start_index;
        let block = offset / info.block_elements;
        let within = offset % info.block_elements;

        if s < tiers.direct_super_blocks {
            let address = iblock.data_blocks[(info.start_block + block) as usize];
            if !is_defined(address) {
                return Ok(None);
            }
            return self.element(address, info.block_elements, within);
        }

        let sblock_address = iblock.secondary_blocks[s - tiers.direct_super_blocks];
        if !is_defined(sblock_address) {
            return Ok(None);
        }
        let sblock = self.ctx.cached(sblock_address, Structure::ExtensibleArraySecondaryBlock, || {
            self.read_secondary_block(sblock_address, info)
        })?;
        let address = sblock.data_blocks[block as usize];
        if !is_defined(address) {
            return Ok(None);
        }
        let pages = tiers.pages_in(info.block_elements);
        if pages > 0 {
            let bit = block * pages + within / tiers.page_elements;
            if sblock.page_init[(bit / 8) as usize] & (0x80 >> (bit % 8)) == 0 {
                return Ok(None);
            }
        }
        self.element(address, info.block_elements, within)
    }

    fn element(
        &self,
        address: u64,
        block_elements: u64,
        within: u64,
    ) -> Result<Option<ChunkLocation>> {
        let tiers = &self.header.tiers;
        let pages = tiers.pages_in(block_elements);
        let block = self.ctx.cached(address, Structure::ExtensibleArrayDataBlock, || {
            self.read_data_block(address, if pages > 0 { 0 } else { block_elements })
        })?;
        if pages == 0 {
            return Ok(block.0[within as usize]);
        }

        let per_page = tiers.page_elements;
        let element_size = self.header.element_size as u64;
        let prefix_len = (tiers.block_prefix_len(self.ctx.sizes()) + 4) as u64;
        let page = within / per_page;
        let page_address = address + prefix_len + page * (per_page * element_size + 4);
        let entries = self.ctx.cached(page_address, Structure::ExtensibleArrayDataBlock, || {
            let len = (per_page * element_size + 4) as usize;
            let mut c =
                self.ctx.read_checked(page_address, len, Structure::ExtensibleArrayDataBlock)?;
            Ok(DataBlock(self.decode_elements(&mut c, per_page)?))
        })?;
        Ok(entries.0[(within % per_page) as usize])
    }

    fn decode_elements(
        &self,
        c: &mut FieldCursor,
        count: u64,
    ) -> Result<Vec<Option<ChunkLocation>>> {
        (0..count).map(|_| self.format.decode(c)).collect()
    }

    fn check_prefix(&self, c: &mut FieldCursor, signature: &[u8; 4]) -> Result<()> {
        c.expect_signature(signature)?;
        c.expect_version(&[0])?;
        if c.read_u8()? != self.header.client_id {
            return Err(c.format_error("client id differs from the header"));
        }
        let owner = c.read_offset()?;
        if owner != self.address {
            return Err(c.format_error(format!(
                "owned by header {:#x}, not {:#x}",
                owner, self.address
            )));
        }
        Ok(())
    }

    fn read_index_block(&self) -> Result<IndexBlock> {
        let tiers = &self.header.tiers;
        let sizes = self.ctx.sizes();
        let address = self.header.index_block;
        let elements = tiers.params.index_elements as usize;
        let len = 6
            + sizes.offset_size()
            + elements * self.header.element_size as usize
            + (tiers.index_data_blocks + tiers.secondary_blocks()) * sizes.offset_size()
            + 4;
        let mut c = self.ctx.read_checked(address, len, Structure::ExtensibleArrayIndexBlock)?;
        self.check_prefix(&mut c, INDEX_BLOCK_SIGNATURE)?;
        let elements = self.decode_elements(&mut c, elements as u64)?;
        let data_blocks =
            (0..tiers.index_data_blocks).map(|_| c.read_offset()).collect::<Result<_>>()?;
        let secondary_blocks =
            (0..tiers.secondary_blocks()).map(|_| c.read_offset()).collect::<Result<_>>()?;
        Ok(IndexBlock { elements, data_blocks, secondary_blocks })
    }

    fn read_secondary_block(&self, address: u64, info: SuperBlockInfo) -> Result<SecondaryBlock> {
        let tiers = &self.header.tiers;
        let sizes = self.ctx.sizes();
        let pages = tiers.pages_in(info.block_elements);
        let init_len = if pages > 0 { (info.data_blocks * pages.div_ceil(8)) as usize } else { 0 };
        let count = info.data_blocks as usize;
        let len = tiers.block_prefix_len(sizes) + init_len + count * sizes.offset_size() + 4;
        let mut c = self.ctx.read_checked(address, len, Structure::ExtensibleArraySecondaryBlock)?;
        self.check_prefix(&mut c, SECONDARY_BLOCK_SIGNATURE)?;
        c.skip(tiers.array_offset_size)?;
        let page_init = c.read_bytes(init_len)?.to_vec();
        let data_blocks = (0..count).map(|_| c.read_offset()).collect::<Result<_>>()?;
        Ok(SecondaryBlock { page_init, data_blocks })
    }

    // Reads the block prefix and, for unpaged blocks, its `count` elements.
    fn read_data_block(&self, address: u64, count: u64) -> Result<DataBlock> {
        let tiers = &self.header.tiers;
        let len = tiers.block_prefix_len(self.ctx.sizes())
            + count as usize * self.header.element_size as usize
            + 4;
        let mut c = self.ctx.read_checked(address, len, Structure::ExtensibleArrayDataBlock)?;
        self.check_prefix(&mut c, DATA_BLOCK_SIGNATURE)?;
        c.skip(tiers.array_offset_size)?;
        Ok(DataBlock(self.decode_elements(&mut c, count)?))
    }
}

/// Writes an extensible array for a dataset of a given geometry.
#[derive(Debug, Clone)]
pub struct ExtensibleArrayBuilder {
    geometry: ChunkGeometry,
    params: ExtensibleArrayParams,
    filtered: bool,
}

#[derive(Default)]
struct Totals {
    secondary_blocks: u64,
    secondary_bytes: u64,
    data_blocks: u64,
    data_bytes: u64,
}

struct Writer<'a> {
    image: &'a mut FileImage,
    tiers: &'a Tiers,
    format: EntryFormat,
    header: u64,
    entries: &'a [Option<ChunkLocation>],
    totals: Totals,
}

impl Writer<'_> {
    fn entry(&self, index: u64) -> Option<ChunkLocation> {
        self.entries.get(index as usize).copied().flatten()
    }

    fn any_set(&self, start: u64, count: u64) -> bool {
        (start..start.saturating_add(count))
            .take_while(|&i| (i as usize) < self.entries.len())
            .any(|i| self.entry(i).is_some())
    }

    fn prefix(&self, signature: &[u8; 4], block_offset: Option<u64>) -> crate::io::FieldWriter {
        let mut w = self.image.writer();
        w.put_slice(signature);
        w.put_u8(0);
        w.put_u8(self.format.client_id());
        w.put_offset(self.header);
        if let Some(offset) = block_offset {
            w.put_uint(offset, self.tiers.array_offset_size);
        }
        w
    }

    // Writes the data block holding elements `start..start + count`.
    // Returns its address and which of its pages were written.
    fn data_block(&mut self, start: u64, count: u64, all_pages: bool) -> (u64, Vec<bool>) {
        let pages = self.tiers.pages_in(count);
        if !self.any_set(start, count) {
            return (UNDEFINED_ADDRESS, vec![false; pages as usize]);
        }
        let block_offset = start - self.tiers.params.index_elements as u64;
        let mut w = self.prefix(DATA_BLOCK_SIGNATURE, Some(block_offset));
        if pages == 0 {
            for i in start..start + count {
                self.format.encode(self.entry(i).as_ref(), &mut w);
            }
            w.put_checksum();
            let bytes = w.finish();
            self.totals.data_blocks += 1;
            self.totals.data_bytes += bytes.len() as u64;
            return (self.image.append(&bytes), Vec::new());
        }

        w.put_checksum();
        let prefix = w.finish();
        let per_page = self.tiers.page_elements;
        let page_size = per_page as usize * self.format.size(self.image.sizes()) + 4;
        let total = prefix.len() + pages as usize * page_size;
        let address = self.image.allocate(total);
        self.image.write_at(address, &prefix);
        let mut written = Vec::with_capacity(pages as usize);
        for page in 0..pages {
            let first = start + page * per_page;
            let used = all_pages || self.any_set(first, per_page);
            written.push(used);
            if !used {
                continue;
            }
            let mut w = self.image.writer();
            for i in first..first + per_page {
                self.format.encode(self.entry(i).as_ref(), &mut w);
            }
            w.put_checksum();
            let page_address = address + (prefix.len() + page as usize * page_size) as u64;
            self.image.write_at(page_address, &w.finish());
        }
        self.totals.data_blocks += 1;
        self.totals.data_bytes += total as u64;
        (address, written)
    }

    fn secondary_block(&mut self, info: SuperBlockInfo) -> u64 {
        let first = self.tiers.params.index_elements as u64 + info.start_index;
        if !self.any_set(first, info.data_blocks * info.block_elements) {
            return UNDEFINED_ADDRESS;
        }
        let pages = self.tiers.pages_in(info.block_elements);
        let page_init_len =
            if pages > 0 { (info.data_blocks * pages.div_ceil(8)) as usize } else { 0 };
        let mut page_init = vec![0u8; page_init_len];
        let mut addresses = Vec::with_capacity(info.data_blocks as usize);
        for block in 0..info.data_blocks {
            let start = first + block * info.block_elements;
            let (address, written) = self.data_block(start, info.block_elements, false);
            for (page, used) in written.into_iter().enumerate() {
                if used {
                    let bit = (block * pages) as usize + page;
                    page_init[bit / 8] |= 0x80 >> (bit % 8);
                }
            }
            addresses.push(address);
        }
        let mut w = self.prefix(SECONDARY_BLOCK_SIGNATURE, Some(info.start_index));
        w.put_slice(&page_init);
        for address in addresses {
            w.put_offset(address);
        }
        w.put_checksum();
        let bytes = w.finish();
        self.totals.secondary_blocks += 1;
        self.totals.secondary_bytes += bytes.len() as u64;
        self.image.append(&bytes)
    }

    fn index_block(&mut self) -> u64 {
        let tiers = self.tiers;
        let index_elements = tiers.params.index_elements as u64;
        let mut data_blocks = vec![UNDEFINED_ADDRESS; tiers.index_data_blocks];
        let mut secondary_blocks = vec![UNDEFINED_ADDRESS; tiers.secondary_blocks()];
        for (s, info) in tiers.super_blocks.iter().enumerate() {
            let first = index_elements + info.start_index;
            if first >= self.entries.len() as u64 {
                break;
            }
            if s < tiers.direct_super_blocks {
                for block in 0..info.data_blocks {
                    let start = first + block * info.block_elements;
                    let (address, _) = self.data_block(start, info.block_elements, true);
                    data_blocks[(info.start_block + block) as usize] = address;
                }
            } else {
                secondary_blocks[s - tiers.direct_super_blocks] = self.secondary_block(*info);
            }
        }

        let mut w = self.prefix(INDEX_BLOCK_SIGNATURE, None);
        for i in 0..index_elements {
            self.format.encode(self.entry(i).as_ref(), &mut w);
        }
        for address in data_blocks.into_iter().chain(secondary_blocks) {
            w.put_offset(address);
        }
        w.put_checksum();
        self.image.append(&w.finish())
    }
}

impl ExtensibleArrayBuilder {
    /// A builder of unfiltered elements with `params`.
    pub fn new(geometry: &ChunkGeometry, params: ExtensibleArrayParams) -> Self {
        Self { geometry: geometry.clone(), params, filtered: false }
    }

    /// Stores stored sizes and filter masks with each element.
    pub fn filtered(mut self, filtered: bool) -> Self {
        self.filtered = filtered;
        self
    }

    /// Index description for the data layout message.
    pub fn info(&self) -> ChunkIndexInfo {
        ChunkIndexInfo::ExtensibleArray {
            max_bits: self.params.max_bits,
            index_elements: self.params.index_elements,
            min_pointers: self.params.min_pointers,
            min_elements: self.params.min_elements,
            page_bits: self.params.page_bits,
        }
    }

    /// Writes the array and returns the header address.
    ///
    /// `entries` is indexed by linear chunk index; trailing `None`s are
    /// not stored.
    pub fn write(&self, image: &mut FileImage, entries: &[Option<ChunkLocation>]) -> Result<u64> {
        let tiers = Tiers::new(self.params).map_err(Error::invalid_argument)?;
        let max_index_set = entries.iter().rposition(Option::is_some).map_or(0, |i| i + 1);
        if self.params.max_bits < 64 && max_index_set as u64 > 1u64 << self.params.max_bits {
            return Err(Error::invalid_argument(format!(
                "{} elements exceed {} index bits",
                max_index_set, self.params.max_bits
            )));
        }
        let sizes = image.sizes();
        let format = EntryFormat::new(&self.geometry, self.filtered);
        let header = image.allocate(ExtensibleArrayHeader::encoded_size(sizes));

        let mut writer = Writer {
            image,
            tiers: &tiers,
            format,
            header,
            entries: &entries[..max_index_set],
            totals: Totals::default(),
        };
        let index_block = if max_index_set == 0 { UNDEFINED_ADDRESS } else { writer.index_block() };
        let totals = writer.totals;

        let mut w = image.writer();
        w.put_slice(HEADER_SIGNATURE);
        w.put_u8(0);
        w.put_u8(format.client_id());
        w.put_u8(format.size(sizes) as u8);
        w.put_u8(self.params.max_bits);
        w.put_u8(self.params.index_elements);
        w.put_u8(self.params.min_elements);
        w.put_u8(self.params.min_pointers);
        w.put_u8(self.params.page_bits);
        w.put_length(totals.secondary_blocks);
        w.put_length(totals.secondary_bytes);
        w.put_length(totals.data_blocks);
        w.put_length(totals.data_bytes);
        w.put_length(max_index_set as u64);
        w.put_length(max_index_set as u64);
        w.put_offset(index_block);
        w.put_checksum();
        image.write_at(header, &w.finish());
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(
        index_elements: u8,
        min_pointers: u8,
        min_elements: u8,
        page_bits: u8,
    ) -> ExtensibleArrayParams {
        ExtensibleArrayParams {
            max_bits: 16,
            index_elements,
            min_pointers,
            min_elements,
            page_bits,
        }
    }

    #[test]
    fn test_super_block_schedule() {
        let tiers = Tiers::new(params(4, 4, 16, 10)).unwrap();
        assert_eq!(tiers.super_blocks.len(), 13);
        let shape: Vec<(u64, u64)> =
            tiers.super_blocks.iter().take(5).map(|s| (s.data_blocks, s.block_elements)).collect();
        assert_eq!(shape, vec![(1, 16), (1, 32), (2, 32), (2, 64), (4, 64)]);
        assert_eq!(tiers.super_blocks[3].start_index, 16 + 32 + 64);
        assert_eq!(tiers.super_blocks[3].start_block, 4);
        assert_eq!(tiers.index_data_blocks, 6);
        assert_eq!(tiers.direct_super_blocks, 4);
        assert_eq!(tiers.array_offset_size, 2);

        assert_eq!(tiers.super_block_of(4), 0);
        assert_eq!(tiers.super_block_of(4 + 15), 0);
        assert_eq!(tiers.super_block_of(4 + 16), 1);
        assert_eq!(tiers.super_block_of(4 + 48), 2);
        assert_eq!(tiers.super_block_of(4 + 112), 3);
    }

    #[test]
    fn test_invalid_params() {
        assert!(Tiers::new(params(4, 3, 16, 10)).is_err());
        assert!(Tiers::new(params(4, 4, 0, 10)).is_err());
        assert!(Tiers::new(ExtensibleArrayParams { max_bits: 2, ..params(4, 4, 16, 10) }).is_err());
    }

    #[test]
    fn test_every_tier_is_reached() {
        let count = 600u64;
        let g = ChunkGeometry::fixed(vec![count], vec![1], 8).unwrap();
        let sizes = crate::io::Sizes::new(4, 8);
        let mut image = FileImage::with_reserved(sizes, 64);
        let entries: Vec<Option<ChunkLocation>> = (0..count)
            .map(|i| {
                let stored = i % 7 != 3 && !(200..260).contains(&i);
                stored.then(|| ChunkLocation::new(0x10_0000 + i * 8, 8))
            })
            .collect();
        let builder = ExtensibleArrayBuilder::new(&g, params(3, 2, 4, 3));
        let address = builder.write(&mut image, &entries).unwrap();

        let ctx = Context::new(Arc::new(image.into_source()), sizes);
        let index = ExtensibleArrayIndex::open(&ctx, address, g).unwrap();
        assert_eq!(index.max_index_set(), 600);
        for i in 0..count {
            assert_eq!(index.locate(&[i]).unwrap(), entries[i as usize], "element {}", i);
        }
    }

    #[test]
    fn test_empty_array() {
        let g = ChunkGeometry::fixed(vec![10], vec![1], 8).unwrap();
        let sizes = crate::io::Sizes::default();
        let mut image = FileImage::with_reserved(sizes, 64);
        let address = ExtensibleArrayBuilder::new(&g, ExtensibleArrayParams::default())
            .write(&mut image, &[None; 10])
            .unwrap();
        let ctx = Context::new(Arc::new(image.into_source()), sizes);
        let index = ExtensibleArrayIndex::open(&ctx, address, g).unwrap();
        assert_eq!(index.max_index_set(), 0);
        assert_eq!(index.locate(&[3]).unwrap(), None);
    }
}
