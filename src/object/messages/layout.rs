//! Data layout message (0x0008).
//!
//! ```text
//! v1/v2: [version][rank][class][reserved:5][address: O, unless compact]
//!        [dims: u32 x rank][element size: u32, chunked][size: u32 + data, compact]
//! v3:    [version=3][class] then
//!          compact:    [size: u16][data]
//!          contiguous: [address: O][size: L]
//!          chunked:    [rank+1][address: O][dims: u32 x (rank+1)]
//! v4:    as v3, except chunked:
//!          [flags][rank+1][dim width][dims: width x (rank+1)]
//!          [index type][index parameters][address: O]
//!        and virtual: [heap address: O][index: u32]
//! ```
//!
//! Chunk dimensions always carry the element size as their last entry.

use crate::error::Result;
use crate::io::{FieldCursor, FieldWriter, Sizes, UNDEFINED_ADDRESS};
use bytes::Bytes;

/// Chunk index type and its creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkIndexInfo {
    /// Version 1 B-tree keyed by chunk offsets (layout versions 1 to 3).
    BTreeV1,
    /// Exactly one chunk covering the dataset.
    SingleChunk {
        /// Stored size and filter mask when the chunk is filtered.
        filtered: Option<(u64, u32)>,
    },
    /// Chunks stored contiguously with no index.
    Implicit,
    /// Fixed array of chunk entries.
    FixedArray {
        /// log2 of the number of entries per data block page.
        page_bits: u8,
    },
    /// Extensible array of chunk entries.
    ExtensibleArray {
        /// Bits needed to store the maximum number of elements.
        max_bits: u8,
        /// Elements stored in the index block.
        index_elements: u8,
        /// Minimum data block pointers in a secondary block.
        min_pointers: u8,
        /// Minimum elements in a data block.
        min_elements: u8,
        /// log2 of the number of elements per data block page.
        page_bits: u8,
    },
    /// Version 2 B-tree of chunk records.
    BTreeV2 {
        /// Node size in bytes.
        node_size: u32,
        /// Split percentage.
        split_percent: u8,
        /// Merge percentage.
        merge_percent: u8,
    },
}

impl ChunkIndexInfo {
    fn type_code(&self) -> u8 {
        match self {
            ChunkIndexInfo::BTreeV1 => 0,
            ChunkIndexInfo::SingleChunk { .. } => 1,
            ChunkIndexInfo::Implicit => 2,
            ChunkIndexInfo::FixedArray { .. } => 3,
            ChunkIndexInfo::ExtensibleArray { .. } => 4,
            ChunkIndexInfo::BTreeV2 { .. } => 5,
        }
    }
}

/// Chunked storage description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedLayout {
    /// Layout flags (version 4 only).
    pub flags: u8,
    /// Chunk dimensions followed by the element size.
    pub dims: Vec<u64>,
    /// Index type and parameters.
    pub index: ChunkIndexInfo,
    /// Address of the index (or of the data for single/implicit).
    pub address: u64,
}

impl ChunkedLayout {
    /// Flag: partial edge chunks are stored unfiltered.
    pub const DONT_FILTER_PARTIAL_BOUND_CHUNKS: u8 = 0x01;
    /// Flag: the single chunk index stores a filtered size and mask.
    pub const SINGLE_INDEX_WITH_FILTER: u8 = 0x02;

    /// Dataset rank.
    pub fn rank(&self) -> usize {
        self.dims.len().saturating_sub(1)
    }

    /// Chunk dimensions in elements.
    pub fn chunk_dims(&self) -> &[u64] {
        &self.dims[..self.rank()]
    }

    /// Element size in bytes.
    pub fn element_size(&self) -> u64 {
        self.dims.last().copied().unwrap_or(0)
    }

    /// Unfiltered chunk size in bytes; `None` if it overflows 64 bits.
    pub fn chunk_byte_size(&self) -> Option<u64> {
        self.dims.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))
    }
}

/// Raw data layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// Data stored inside the message.
    Compact {
        /// The raw data.
        data: Bytes,
    },
    /// Data stored in one contiguous block.
    Contiguous {
        /// Block address.
        address: u64,
        /// Block size; unknown for layout versions 1 and 2.
        size: Option<u64>,
    },
    /// Data stored in chunks located through an index.
    Chunked(ChunkedLayout),
    /// Data mapped from other datasets.
    Virtual {
        /// Global heap collection address of the mapping.
        address: u64,
        /// Object index in the collection.
        index: u32,
    },
}

/// Data layout message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayoutMessage {
    /// Encoding version (1 to 4).
    pub version: u8,
    /// The layout.
    pub layout: Layout,
}

impl DataLayoutMessage {
    /// The chunked layout, if any.
    pub fn chunked(&self) -> Option<&ChunkedLayout> {
        match &self.layout {
            Layout::Chunked(chunked) => Some(chunked),
            _ => None,
        }
    }

    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        let version = c.expect_version(&[1, 2, 3, 4])?;
        let layout = if version < 3 {
            Self::decode_v1(c)?
        } else {
            Self::decode_v3(c, version)?
        };
        Ok(Self { version, layout })
    }

    fn decode_v1(c: &mut FieldCursor) -> Result<Layout> {
        let rank = c.read_u8()? as usize;
        let class = c.read_u8()?;
        c.skip(5)?;
        let address = if class == 0 { UNDEFINED_ADDRESS } else { c.read_offset()? };
        let mut dims = Vec::with_capacity(rank + 1);
        for _ in 0..rank {
            dims.push(c.read_u32()? as u64);
        }
        match class {
            0 => {
                let size = c.read_u32()? as usize;
                Ok(Layout::Compact { data: c.read_bytes(size)? })
            }
            1 => Ok(Layout::Contiguous { address, size: None }),
            2 => {
                dims.push(c.read_u32()? as u64);
                Ok(Layout::Chunked(ChunkedLayout {
                    flags: 0,
                    dims,
                    index: ChunkIndexInfo::BTreeV1,
                    address,
                }))
            }
            other => Err(c.format_error(format!("layout class {}", other))),
        }
    }

    fn decode_v3(c: &mut FieldCursor, version: u8) -> Result<Layout> {
        let class = c.read_u8()?;
        match class {
            0 => {
                let size = c.read_u16()? as usize;
                Ok(Layout::Compact { data: c.read_bytes(size)? })
            }
            1 => {
                let address = c.read_offset()?;
                let size = c.read_length()?;
                Ok(Layout::Contiguous { address, size: Some(size) })
            }
            2 if version == 3 => {
                let rank = c.read_u8()? as usize;
                let address = c.read_offset()?;
                let mut dims = Vec::with_capacity(rank);
                for _ in 0..rank {
                    dims.push(c.read_u32()? as u64);
                }
                Ok(Layout::Chunked(ChunkedLayout {
                    flags: 0,
                    dims,
                    index: ChunkIndexInfo::BTreeV1,
                    address,
                }))
            }
            2 => {
                let flags = c.read_u8()?;
                let rank = c.read_u8()? as usize;
                let width = c.read_u8()? as usize;
                let mut dims = Vec::with_capacity(rank);
                for _ in 0..rank {
                    dims.push(c.read_uint(width)?);
                }
                let index = match c.read_u8()? {
                    1 => {
                        let filtered = if flags & ChunkedLayout::SINGLE_INDEX_WITH_FILTER != 0 {
                            Some((c.read_length()?, c.read_u32()?))
                        } else {
                            None
                        };
                        ChunkIndexInfo::SingleChunk { filtered }
                    }
                    2 => ChunkIndexInfo::Implicit,
                    3 => ChunkIndexInfo::FixedArray { page_bits: c.read_u8()? },
                    4 => ChunkIndexInfo::ExtensibleArray {
                        max_bits: c.read_u8()?,
                        index_elements: c.read_u8()?,
                        min_pointers: c.read_u8()?,
                        min_elements: c.read_u8()?,
                        page_bits: c.read_u8()?,
                    },
                    5 => ChunkIndexInfo::BTreeV2 {
                        node_size: c.read_u32()?,
                        split_percent: c.read_u8()?,
                        merge_percent: c.read_u8()?,
                    },
                    other => return Err(c.format_error(format!("chunk index type {}", other))),
                };
                let address = c.read_offset()?;
                Ok(Layout::Chunked(ChunkedLayout { flags, dims, index, address }))
            }
            3 if version == 4 => {
                let address = c.read_offset()?;
                let index = c.read_u32()?;
                Ok(Layout::Virtual { address, index })
            }
            other => Err(c.format_error(format!("layout class {}", other))),
        }
    }

    pub(crate) fn encode(&self, sizes: Sizes) -> Bytes {
        let mut w = FieldWriter::new(sizes);
        w.put_u8(self.version);
        if self.version < 3 {
            self.encode_v1(&mut w);
            return w.finish();
        }
        match &self.layout {
            Layout::Compact { data } => {
                w.put_u8(0);
                w.put_u16(data.len() as u16);
                w.put_slice(data);
            }
            Layout::Contiguous { address, size } => {
                w.put_u8(1);
                w.put_offset(*address);
                w.put_length(size.unwrap_or(0));
            }
            Layout::Chunked(chunked) if self.version == 3 => {
                w.put_u8(2);
                w.put_u8(chunked.dims.len() as u8);
                w.put_offset(chunked.address);
                for dim in &chunked.dims {
                    w.put_u32(*dim as u32);
                }
            }
            Layout::Chunked(chunked) => {
                w.put_u8(2);
                w.put_u8(chunked.flags);
                w.put_u8(chunked.dims.len() as u8);
                let max = chunked.dims.iter().copied().max().unwrap_or(1);
                let width = (64 - max.leading_zeros()).div_ceil(8).max(1) as usize;
                w.put_u8(width as u8);
                for dim in &chunked.dims {
                    w.put_uint(*dim, width);
                }
                w.put_u8(chunked.index.type_code());
                match chunked.index {
                    ChunkIndexInfo::SingleChunk { filtered: Some((size, mask)) } => {
                        w.put_length(size);
                        w.put_u32(mask);
                    }
                    ChunkIndexInfo::FixedArray { page_bits } => w.put_u8(page_bits),
                    ChunkIndexInfo::ExtensibleArray {
                        max_bits,
                        index_elements,
                        min_pointers,
                        min_elements,
                        page_bits,
                    } => {
                        w.put_slice(&[
                            max_bits,
                            index_elements,
                            min_pointers,
                            min_elements,
                            page_bits,
                        ]);
                    }
                    ChunkIndexInfo::BTreeV2 { node_size, split_percent, merge_percent } => {
                        w.put_u32(node_size);
                        w.put_u8(split_percent);
                        w.put_u8(merge_percent);
                    }
                    _ => {}
                }
                w.put_offset(chunked.address);
            }
            Layout::Virtual { address, index } => {
                w.put_u8(3);
                w.put_offset(*address);
                w.put_u32(*index);
            }
        }
        w.finish()
    }

    fn encode_v1(&self, w: &mut FieldWriter) {
        match &self.layout {
            Layout::Compact { data } => {
                w.put_u8(0);
                w.put_u8(0);
                w.put_zeros(5);
                w.put_u32(data.len() as u32);
                w.put_slice(data);
            }
            Layout::Contiguous { address, .. } => {
                w.put_u8(0);
                w.put_u8(1);
                w.put_zeros(5);
                w.put_offset(*address);
            }
            Layout::Chunked(chunked) => {
                w.put_u8(chunked.rank() as u8);
                w.put_u8(2);
                w.put_zeros(5);
                w.put_offset(chunked.address);
                for dim in &chunked.dims {
                    w.put_u32(*dim as u32);
                }
            }
            Layout::Virtual { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Structure;

    fn round_trip(message: &DataLayoutMessage) -> DataLayoutMessage {
        let sizes = Sizes::default();
        let mut c = FieldCursor::new(message.encode(sizes), sizes, Structure::HeaderMessage, 0);
        DataLayoutMessage::decode(&mut c).unwrap()
    }

    fn chunked(version: u8, index: ChunkIndexInfo) -> DataLayoutMessage {
        DataLayoutMessage {
            version,
            layout: Layout::Chunked(ChunkedLayout {
                flags: 0,
                dims: vec![2, 2, 4],
                index,
                address: 0x800,
            }),
        }
    }

    #[test]
    fn test_chunked_v4_index_types() {
        for index in [
            ChunkIndexInfo::SingleChunk { filtered: None },
            ChunkIndexInfo::Implicit,
            ChunkIndexInfo::FixedArray { page_bits: 10 },
            ChunkIndexInfo::ExtensibleArray {
                max_bits: 32,
                index_elements: 4,
                min_pointers: 4,
                min_elements: 16,
                page_bits: 10,
            },
            ChunkIndexInfo::BTreeV2 { node_size: 2048, split_percent: 100, merge_percent: 40 },
        ] {
            let message = chunked(4, index);
            assert_eq!(round_trip(&message), message);
        }
    }

    #[test]
    fn test_single_chunk_with_filter() {
        let mut message = chunked(4, ChunkIndexInfo::SingleChunk { filtered: Some((13, 0b10)) });
        if let Layout::Chunked(c) = &mut message.layout {
            c.flags = ChunkedLayout::SINGLE_INDEX_WITH_FILTER;
        }
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn test_chunked_v3_and_v1() {
        for version in [1, 3] {
            let message = chunked(version, ChunkIndexInfo::BTreeV1);
            let back = round_trip(&message);
            assert_eq!(back, message);
            let layout = back.chunked().unwrap();
            assert_eq!(layout.rank(), 2);
            assert_eq!(layout.chunk_dims(), &[2, 2]);
            assert_eq!(layout.element_size(), 4);
            assert_eq!(layout.chunk_byte_size(), Some(16));
        }
    }

    #[test]
    fn test_compact_and_contiguous() {
        let compact = DataLayoutMessage {
            version: 3,
            layout: Layout::Compact { data: Bytes::from_static(b"abcd") },
        };
        assert_eq!(round_trip(&compact), compact);

        let contiguous = DataLayoutMessage {
            version: 3,
            layout: Layout::Contiguous { address: 0x400, size: Some(256) },
        };
        assert_eq!(round_trip(&contiguous), contiguous);
    }
}
