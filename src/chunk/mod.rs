//! Chunk index subsystem.
//!
//! Maps the scaled coordinate of a chunk to its on-disk location. The
//! strategy is fixed by the data layout message of the dataset:
//!
//! ```text
//! single chunk      one address, valid for the all-zero coordinate
//! implicit          base + linear index * chunk size, no index structure
//! fixed array       "FAHD" -> "FADB" (optionally paged)
//! extensible array  "EAHD" -> "EAIB" -> "EASB" -> "EADB" (optionally paged)
//! B-tree v2         type 10 (unfiltered) or 11 (filtered) chunk records
//! B-tree v1         chunk keys of layout versions 1 to 3
//! ```
//!
//! Every strategy answers the same [`ChunkIndex::locate`] call, so readers
//! of chunk data never need to know which one is in effect.

mod btree;
mod extensible_array;
mod fixed_array;
mod geometry;

pub use btree::{BTreeV1ChunkIndex, BTreeV2ChunkIndex};
pub use extensible_array::{ExtensibleArrayBuilder, ExtensibleArrayIndex, ExtensibleArrayParams};
pub use fixed_array::{FixedArrayBuilder, FixedArrayIndex};
pub use geometry::ChunkGeometry;

use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::io::{is_defined, FieldCursor, FieldWriter, Sizes, UNDEFINED_ADDRESS};
use crate::object::messages::{ChunkIndexInfo, ChunkedLayout, DataLayoutMessage, DataspaceMessage};
use crate::object::ObjectHeader;
use log::debug;

/// Where a chunk is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkLocation {
    /// File address of the chunk.
    pub address: u64,
    /// Stored (possibly filtered) size in bytes.
    pub size: u64,
    /// Bit `i` set when filter `i` of the pipeline was skipped.
    pub filter_mask: u32,
}

impl ChunkLocation {
    /// An unfiltered chunk of `size` bytes.
    pub fn new(address: u64, size: u64) -> Self {
        Self { address, size, filter_mask: 0 }
    }
}

/// Shape of one array element describing a chunk.
///
/// Unfiltered entries hold only the address; filtered entries add the
/// stored size (`chunk_size_len` bytes) and the filter mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryFormat {
    pub filtered: bool,
    pub chunk_size_len: usize,
    pub chunk_byte_size: u64,
}

impl EntryFormat {
    pub fn new(geometry: &ChunkGeometry, filtered: bool) -> Self {
        Self {
            filtered,
            chunk_size_len: geometry.chunk_size_len(),
            chunk_byte_size: geometry.chunk_byte_size(),
        }
    }

    /// Client id stored in array headers.
    pub fn client_id(&self) -> u8 {
        self.filtered as u8
    }

    pub fn size(&self, sizes: Sizes) -> usize {
        if self.filtered {
            sizes.offset_size() + self.chunk_size_len + 4
        } else {
            sizes.offset_size()
        }
    }

    pub fn decode(&self, c: &mut FieldCursor) -> Result<Option<ChunkLocation>> {
        let address = c.read_offset()?;
        let (size, filter_mask) = if self.filtered {
            (c.read_uint(self.chunk_size_len)?, c.read_u32()?)
        } else {
            (self.chunk_byte_size, 0)
        };
        Ok(is_defined(address).then_some(ChunkLocation { address, size, filter_mask }))
    }

    pub fn encode(&self, entry: Option<&ChunkLocation>, w: &mut FieldWriter) {
        w.put_offset(entry.map_or(UNDEFINED_ADDRESS, |e| e.address));
        if self.filtered {
            w.put_uint(entry.map_or(0, |e| e.size), self.chunk_size_len);
            w.put_u32(entry.map_or(0, |e| e.filter_mask));
        }
    }
}

/// Single chunk index: the whole dataset is one chunk.
#[derive(Debug, Clone)]
pub struct SingleChunkIndex {
    geometry: ChunkGeometry,
    location: Option<ChunkLocation>,
}

impl SingleChunkIndex {
    fn locate(&self, scaled: &[u64]) -> Result<Option<ChunkLocation>> {
        self.geometry.check(scaled)?;
        if scaled.iter().any(|&s| s != 0) {
            return Ok(None);
        }
        Ok(self.location)
    }
}

/// Implicit index: chunks stored back to back in linear order.
#[derive(Debug, Clone)]
pub struct ImplicitIndex {
    geometry: ChunkGeometry,
    address: u64,
}

impl ImplicitIndex {
    fn locate(&self, scaled: &[u64]) -> Result<Option<ChunkLocation>> {
        let index = self.geometry.linear_index(scaled)?;
        if !is_defined(self.address) {
            return Ok(None);
        }
        let size = self.geometry.chunk_byte_size();
        let address = index
            .checked_mul(size)
            .and_then(|offset| self.address.checked_add(offset))
            .ok_or_else(|| {
                Error::bounds(Structure::ChunkIndex, self.address, "chunk address overflows")
            })?;
        Ok(Some(ChunkLocation::new(address, size)))
    }
}

/// A chunk index of any strategy.
#[derive(Debug, Clone)]
pub enum ChunkIndex {
    /// One chunk covering the dataset.
    Single(SingleChunkIndex),
    /// Contiguous chunks without an index structure.
    Implicit(ImplicitIndex),
    /// Fixed array of chunk entries.
    FixedArray(FixedArrayIndex),
    /// Extensible array of chunk entries.
    ExtensibleArray(ExtensibleArrayIndex),
    /// Version 2 B-tree of chunk records.
    BTreeV2(BTreeV2ChunkIndex),
    /// Version 1 B-tree of chunk keys.
    BTreeV1(BTreeV1ChunkIndex),
}

impl ChunkIndex {
    /// Opens the index described by `layout` for a dataset of `geometry`.
    pub fn open(ctx: &Context, layout: &ChunkedLayout, geometry: ChunkGeometry) -> Result<Self> {
        debug!("Opening {:?} chunk index at {:#x}", layout.index, layout.address);
        let index = match layout.index {
            ChunkIndexInfo::SingleChunk { filtered } => {
                let location = is_defined(layout.address).then(|| match filtered {
                    Some((size, filter_mask)) => {
                        ChunkLocation { address: layout.address, size, filter_mask }
                    }
                    None => ChunkLocation::new(layout.address, geometry.chunk_byte_size()),
                });
                ChunkIndex::Single(SingleChunkIndex { geometry, location })
            }
            ChunkIndexInfo::Implicit => {
                ChunkIndex::Implicit(ImplicitIndex { geometry, address: layout.address })
            }
            ChunkIndexInfo::FixedArray { .. } => {
                ChunkIndex::FixedArray(FixedArrayIndex::open(ctx, layout.address, geometry)?)
            }
            ChunkIndexInfo::ExtensibleArray { .. } => {
                let index = ExtensibleArrayIndex::open(ctx, layout.address, geometry)?;
                ChunkIndex::ExtensibleArray(index)
            }
            ChunkIndexInfo::BTreeV2 { .. } => {
                ChunkIndex::BTreeV2(BTreeV2ChunkIndex::open(ctx, layout.address, geometry)?)
            }
            ChunkIndexInfo::BTreeV1 => {
                ChunkIndex::BTreeV1(BTreeV1ChunkIndex::open(ctx, layout.address, geometry))
            }
        };
        Ok(index)
    }

    /// Opens the chunk index of the dataset whose header is `header`.
    pub fn for_dataset(ctx: &Context, header: &ObjectHeader) -> Result<Self> {
        let layout = header
            .get_message::<DataLayoutMessage>()
            .and_then(DataLayoutMessage::chunked)
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "object at {:#x} is not a chunked dataset",
                    header.address
                ))
            })?;
        let dataspace = header.get_message::<DataspaceMessage>().ok_or_else(|| {
            Error::format(
                Structure::ObjectHeader,
                header.address,
                "chunked dataset without a dataspace",
            )
        })?;
        let geometry = ChunkGeometry::from_messages(dataspace, layout)?;
        Self::open(ctx, layout, geometry)
    }

    /// Geometry the index was opened with.
    pub fn geometry(&self) -> &ChunkGeometry {
        match self {
            ChunkIndex::Single(index) => &index.geometry,
            ChunkIndex::Implicit(index) => &index.geometry,
            ChunkIndex::FixedArray(index) => index.geometry(),
            ChunkIndex::ExtensibleArray(index) => index.geometry(),
            ChunkIndex::BTreeV2(index) => index.geometry(),
            ChunkIndex::BTreeV1(index) => index.geometry(),
        }
    }

    /// Location of the chunk at scaled coordinate `scaled`, or `None` if
    /// the chunk was never written.
    pub fn locate(&self, scaled: &[u64]) -> Result<Option<ChunkLocation>> {
        match self {
            ChunkIndex::Single(index) => index.locate(scaled),
            ChunkIndex::Implicit(index) => index.locate(scaled),
            ChunkIndex::FixedArray(index) => index.locate(scaled),
            ChunkIndex::ExtensibleArray(index) => index.locate(scaled),
            ChunkIndex::BTreeV2(index) => index.locate(scaled),
            ChunkIndex::BTreeV1(index) => index.locate(scaled),
        }
    }

    /// Location of the chunk holding element `coordinate`.
    pub fn locate_element(&self, coordinate: &[u64]) -> Result<Option<ChunkLocation>> {
        let scaled = self.geometry().scaled(coordinate)?;
        self.locate(&scaled)
    }

    /// All stored chunks of the current extent, in row-major order.
    pub fn chunks(&self) -> Result<Vec<(Vec<u64>, ChunkLocation)>> {
        let mut out = Vec::new();
        for scaled in self.geometry().scaled_coordinates() {
            if let Some(location) = self.locate(&scaled)? {
                out.push((scaled, location));
            }
        }
        Ok(out)
    }
}
