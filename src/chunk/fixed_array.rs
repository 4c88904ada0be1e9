//! Fixed array chunk index.
//!
//! ```text
//! header:     ["FAHD"][version=0][client id][entry size][page bits]
//!             [entry count: L][data block: O][checksum]
//! data block: ["FADB"][version=0][client id][header: O]
//!             unpaged: [entries][checksum]
//!             paged:   [page init bitmap][checksum] then pages of
//!                      [2^page bits entries][checksum]
//! ```
//!
//! The array is sized once, to the number of chunks in the maximum extent.
//! Pages whose bit is clear in the bitmap were never written.

use super::{ChunkGeometry, ChunkLocation, EntryFormat};
use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::io::{is_defined, FileImage, FieldCursor, UNDEFINED_ADDRESS};
use log::debug;
use std::sync::Arc;

const HEADER_SIGNATURE: &[u8; 4] = b"FAHD";
const DATA_BLOCK_SIGNATURE: &[u8; 4] = b"FADB";

/// Default log2 of the page size.
pub const DEFAULT_PAGE_BITS: u8 = 10;

#[derive(Debug)]
struct FixedArrayHeader {
    client_id: u8,
    entry_size: u8,
    page_bits: u8,
    entry_count: u64,
    data_block: u64,
}

impl FixedArrayHeader {
    fn decode(ctx: &Context, address: u64) -> Result<Self> {
        let sizes = ctx.sizes();
        let len = 8 + sizes.length_size() + sizes.offset_size() + 4;
        let mut c = ctx.read_checked(address, len, Structure::FixedArrayHeader)?;
        c.expect_signature(HEADER_SIGNATURE)?;
        c.expect_version(&[0])?;
        let header = Self {
            client_id: c.read_u8()?,
            entry_size: c.read_u8()?,
            page_bits: c.read_u8()?,
            entry_count: c.read_length()?,
            data_block: c.read_offset()?,
        };
        if header.page_bits >= 32 {
            return Err(c.format_error(format!("page bits {}", header.page_bits)));
        }
        debug!(
            "Fixed array at {:#x}: {} entries, page bits {}",
            address, header.entry_count, header.page_bits
        );
        Ok(header)
    }

    fn page_elements(&self) -> u64 {
        1 << self.page_bits
    }

    fn page_count(&self) -> u64 {
        if self.entry_count > self.page_elements() {
            self.entry_count.div_ceil(self.page_elements())
        } else {
            0
        }
    }
}

#[derive(Debug)]
struct DataBlock {
    entries: Vec<Option<ChunkLocation>>,
    page_bitmap: Vec<u8>,
    prefix_len: u64,
}

#[derive(Debug)]
struct Page(Vec<Option<ChunkLocation>>);

/// An open fixed array index.
#[derive(Debug, Clone)]
pub struct FixedArrayIndex {
    ctx: Context,
    address: u64,
    header: Arc<FixedArrayHeader>,
    format: EntryFormat,
    geometry: ChunkGeometry,
}

impl FixedArrayIndex {
    /// Opens the array whose header is at `address`.
    pub fn open(ctx: &Context, address: u64, geometry: ChunkGeometry) -> Result<Self> {
        let header = ctx.cached(address, Structure::FixedArrayHeader, || {
            FixedArrayHeader::decode(ctx, address)
        })?;
        let filtered = match header.client_id {
            0 => false,
            1 => true,
            other => {
                return Err(Error::format(
                    Structure::FixedArrayHeader,
                    address,
                    format!("client id {}", other),
                ))
            }
        };
        let format = EntryFormat::new(&geometry, filtered);
        if header.entry_size as usize != format.size(ctx.sizes()) {
            return Err(Error::format(
                Structure::FixedArrayHeader,
                address,
                format!(
                    "entry size {} does not match {}",
                    header.entry_size,
                    format.size(ctx.sizes())
                ),
            ));
        }
        Ok(Self { ctx: ctx.clone(), address, header, format, geometry })
    }

    pub(super) fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    /// Number of entries in the array.
    pub fn len(&self) -> u64 {
        self.header.entry_count
    }

    /// Returns true if the array holds no entries.
    pub fn is_empty(&self) -> bool {
        self.header.entry_count == 0
    }

    pub(super) fn locate(&self, scaled: &[u64]) -> Result<Option<ChunkLocation>> {
        let index = self.geometry.linear_index(scaled)?;
        if index >= self.header.entry_count || !is_defined(self.header.data_block) {
            return Ok(None);
        }
        let block = self.ctx.cached(self.header.data_block, Structure::FixedArrayDataBlock, || {
            self.read_data_block()
        })?;
        if self.header.page_count() == 0 {
            return Ok(block.entries[index as usize]);
        }

        let per_page = self.header.page_elements();
        let page = index / per_page;
        if block.page_bitmap[(page / 8) as usize] & (0x80 >> (page % 8)) == 0 {
            return Ok(None);
        }
        let entry_size = self.header.entry_size as u64;
        let page_address =
            self.header.data_block + block.prefix_len + page * (per_page * entry_size + 4);
        let count = per_page.min(self.header.entry_count - page * per_page);
        let entries = self.ctx.cached(page_address, Structure::FixedArrayDataBlock, || {
            let len = (count * entry_size + 4) as usize;
            let mut c = self.ctx.read_checked(page_address, len, Structure::FixedArrayDataBlock)?;
            Ok(Page(self.decode_entries(&mut c, count)?))
        })?;
        Ok(entries.0[(index % per_page) as usize])
    }

    fn decode_entries(
        &self,
        c: &mut FieldCursor,
        count: u64,
    ) -> Result<Vec<Option<ChunkLocation>>> {
        (0..count).map(|_| self.format.decode(c)).collect()
    }

    fn read_data_block(&self) -> Result<DataBlock> {
        let address = self.header.data_block;
        let sizes = self.ctx.sizes();
        let pages = self.header.page_count();
        let bitmap_len = pages.div_ceil(8) as usize;
        let body = if pages > 0 {
            bitmap_len
        } else {
            self.header.entry_count as usize * self.header.entry_size as usize
        };
        let len = 6 + sizes.offset_size() + body + 4;
        let mut c = self.ctx.read_checked(address, len, Structure::FixedArrayDataBlock)?;
        c.expect_signature(DATA_BLOCK_SIGNATURE)?;
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
        if pages > 0 {
            let page_bitmap = c.read_bytes(bitmap_len)?.to_vec();
            Ok(DataBlock { entries: Vec::new(), page_bitmap, prefix_len: len as u64 })
        } else {
            let entries = self.decode_entries(&mut c, self.header.entry_count)?;
            Ok(DataBlock { entries, page_bitmap: Vec::new(), prefix_len: len as u64 })
        }
    }
}

/// Writes a fixed array for a dataset of a given geometry.
#[derive(Debug, Clone)]
pub struct FixedArrayBuilder {
    geometry: ChunkGeometry,
    filtered: bool,
    page_bits: u8,
}

impl FixedArrayBuilder {
    /// A builder of unfiltered entries with the default page size.
    pub fn new(geometry: &ChunkGeometry) -> Self {
        Self { geometry: geometry.clone(), filtered: false, page_bits: DEFAULT_PAGE_BITS }
    }

    /// Stores stored sizes and filter masks with each entry.
    pub fn filtered(mut self, filtered: bool) -> Self {
        self.filtered = filtered;
        self
    }

    /// Sets log2 of the page size.
    pub fn page_bits(mut self, page_bits: u8) -> Self {
        self.page_bits = page_bits;
        self
    }

    /// Writes the array and returns the header address.
    ///
    /// `entries` holds one slot per chunk of the maximum extent, in linear
    /// chunk order.
    pub fn write(&self, image: &mut FileImage, entries: &[Option<ChunkLocation>]) -> Result<u64> {
        let count = self.geometry.max_chunk_count()?;
        if entries.len() as u64 != count {
            return Err(Error::invalid_argument(format!(
                "{} entries for a grid of {} chunks",
                entries.len(),
                count
            )));
        }
        if self.page_bits >= 32 {
            return Err(Error::invalid_argument(format!("page bits {}", self.page_bits)));
        }
        let sizes = image.sizes();
        let format = EntryFormat::new(&self.geometry, self.filtered);
        let entry_size = format.size(sizes);
        let header_address = image.allocate(8 + sizes.length_size() + sizes.offset_size() + 4);

        let per_page = 1usize << self.page_bits;
        let data_block = if entries.is_empty() {
            UNDEFINED_ADDRESS
        } else if entries.len() <= per_page {
            let mut w = image.writer();
            w.put_slice(DATA_BLOCK_SIGNATURE);
            w.put_u8(0);
            w.put_u8(format.client_id());
            w.put_offset(header_address);
            for entry in entries {
                format.encode(entry.as_ref(), &mut w);
            }
            w.put_checksum();
            image.append(&w.finish())
        } else {
            let pages: Vec<&[Option<ChunkLocation>]> = entries.chunks(per_page).collect();
            let mut bitmap = vec![0u8; pages.len().div_ceil(8)];
            for (i, page) in pages.iter().enumerate() {
                if page.iter().any(Option::is_some) {
                    bitmap[i / 8] |= 0x80 >> (i % 8);
                }
            }
            let prefix_len = 6 + sizes.offset_size() + bitmap.len() + 4;
            let page_size = per_page * entry_size + 4;
            let last = pages.last().map_or(0, |p| p.len());
            let total = prefix_len + (pages.len() - 1) * page_size + last * entry_size + 4;
            let address = image.allocate(total);

            let mut w = image.writer();
            w.put_slice(DATA_BLOCK_SIGNATURE);
            w.put_u8(0);
            w.put_u8(format.client_id());
            w.put_offset(header_address);
            w.put_slice(&bitmap);
            w.put_checksum();
            image.write_at(address, &w.finish());

            for (i, page) in pages.iter().enumerate() {
                if page.iter().all(Option::is_none) {
                    continue;
                }
                let mut w = image.writer();
                for entry in page.iter() {
                    format.encode(entry.as_ref(), &mut w);
                }
                w.put_checksum();
                image.write_at(address + (prefix_len + i * page_size) as u64, &w.finish());
            }
            address
        };

        let mut w = image.writer();
        w.put_slice(HEADER_SIGNATURE);
        w.put_u8(0);
        w.put_u8(format.client_id());
        w.put_u8(entry_size as u8);
        w.put_u8(self.page_bits);
        w.put_length(count);
        w.put_offset(data_block);
        w.put_checksum();
        image.write_at(header_address, &w.finish());
        Ok(header_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Sizes;

    fn setup(page_bits: u8) -> (Context, FixedArrayIndex, Vec<Option<ChunkLocation>>, u64) {
        let g = ChunkGeometry::fixed(vec![12], vec![1], 8).unwrap();
        let sizes = Sizes::default();
        let mut image = FileImage::with_reserved(sizes, 64);
        let entries: Vec<Option<ChunkLocation>> = (0..12u64)
            .map(|i| (i % 3 != 0).then(|| ChunkLocation::new(0x1000 + i * 8, 8)))
            .collect();
        let address =
            FixedArrayBuilder::new(&g).page_bits(page_bits).write(&mut image, &entries).unwrap();
        let ctx = Context::new(Arc::new(image.into_source()), sizes);
        let index = FixedArrayIndex::open(&ctx, address, g).unwrap();
        (ctx, index, entries, address)
    }

    #[test]
    fn test_unpaged_lookup() {
        let (_, index, entries, _) = setup(DEFAULT_PAGE_BITS);
        assert_eq!(index.len(), 12);
        for i in 0..12u64 {
            assert_eq!(index.locate(&[i]).unwrap(), entries[i as usize]);
        }
    }

    #[test]
    fn test_paged_lookup_with_short_last_page() {
        // pages of 8 entries: one full page and one of 4
        let (_, index, entries, _) = setup(3);
        for i in 0..12u64 {
            assert_eq!(index.locate(&[i]).unwrap(), entries[i as usize]);
        }
    }

    #[test]
    fn test_corrupt_page_is_detected() {
        let g = ChunkGeometry::fixed(vec![8], vec![1], 8).unwrap();
        let sizes = Sizes::default();
        let mut image = FileImage::with_reserved(sizes, 64);
        let entries: Vec<Option<ChunkLocation>> =
            (0..8u64).map(|i| Some(ChunkLocation::new(0x800 + i, 8))).collect();
        let address = FixedArrayBuilder::new(&g).page_bits(2).write(&mut image, &entries).unwrap();
        let mut bytes = image.as_slice().to_vec();
        // last byte before the final page checksum
        let end = bytes.len() - 5;
        bytes[end] ^= 0xff;

        let ctx = Context::new(Arc::new(crate::io::MemorySource::new(bytes)), sizes);
        let index = FixedArrayIndex::open(&ctx, address, g).unwrap();
        assert!(index.locate(&[0]).unwrap().is_some());
        assert!(matches!(index.locate(&[7]), Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_entry_size_mismatch() {
        let (ctx, _, _, address) = setup(DEFAULT_PAGE_BITS);
        // same array, but a chunk large enough to need a wider filtered entry
        let g = ChunkGeometry::fixed(vec![12], vec![1], 8).unwrap();
        assert!(FixedArrayIndex::open(&ctx, address, g.clone()).is_ok());
        let mut bytes = ctx.source().read_at(0, ctx.source().len() as usize).unwrap().to_vec();
        bytes[address as usize + 6] = 13;
        let ctx = Context::new(Arc::new(crate::io::MemorySource::new(bytes)), Sizes::default())
            .with_options(crate::config::Options::default().verify_checksums(false));
        assert!(FixedArrayIndex::open(&ctx, address, g).unwrap_err().is_format_error());
    }

    #[test]
    fn test_wrong_entry_count_is_rejected() {
        let g = ChunkGeometry::fixed(vec![4], vec![1], 8).unwrap();
        let mut image = FileImage::new(Sizes::default());
        assert!(FixedArrayBuilder::new(&g).write(&mut image, &[None; 3]).is_err());
    }
}
