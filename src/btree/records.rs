//! Version 2 B-tree record shapes.
//!
//! The record type stored in the tree header selects exactly one shape. All
//! records of one tree have the same size, which depends on the file's field
//! widths and, for chunk records, on the dataset rank.
//!
//! ```text
//!  1  huge object, indirect            [address: O][length: L][id: L]
//!  2  huge object, indirect, filtered  [address: O][length: L][mask: u32][memory size: L][id: L]
//!  3  huge object, direct              [address: O][length: L]
//!  4  huge object, direct, filtered    [address: O][length: L][mask: u32][memory size: L]
//!  5  link name                        [hash: u32][heap id: 7]
//!  6  link creation order              [creation order: u64][heap id: 7]
//!  7  shared object header message     [location][hash: u32][heap or header reference]
//!  8  attribute name                   [heap id: 8][flags][creation order: u32][hash: u32]
//!  9  attribute creation order         [heap id: 8][flags][creation order: u32]
//! 10  chunk                            [address: O][scaled: u64 x rank]
//! 11  chunk, filtered                  [address: O][size: n][mask: u32][scaled: u64 x rank]
//! ```

use crate::error::Result;
use crate::io::{FieldCursor, FieldWriter, Sizes};

/// Heap id length of link records.
pub const LINK_HEAP_ID_SIZE: usize = 7;
/// Heap id length of attribute and shared message records.
pub const HEAP_ID_SIZE: usize = 8;

/// A shared object header message index entry (record type 7, and the
/// entries of a shared message list index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedMessageRecord {
    /// Message stored in the index's fractal heap.
    Heap {
        /// lookup3 hash of the encoded message.
        hash: u32,
        /// Number of objects sharing the message.
        reference_count: u32,
        /// Fractal heap id of the message.
        heap_id: [u8; HEAP_ID_SIZE],
    },
    /// Message stored in an object header.
    ObjectHeader {
        /// lookup3 hash of the encoded message.
        hash: u32,
        /// Type code of the message.
        message_type: u8,
        /// Index of the message within the header.
        creation_index: u16,
        /// Address of the header.
        address: u64,
    },
}

impl SharedMessageRecord {
    /// Encoded size, the larger of the two variants.
    pub fn encoded_size(sizes: Sizes) -> usize {
        1 + 4 + (4 + HEAP_ID_SIZE).max(1 + 1 + 2 + sizes.offset_size())
    }

    /// Hash of the shared message.
    pub fn hash(&self) -> u32 {
        match self {
            SharedMessageRecord::Heap { hash, .. } => *hash,
            SharedMessageRecord::ObjectHeader { hash, .. } => *hash,
        }
    }

    /// Decodes one fixed-size entry.
    pub fn decode(c: &mut FieldCursor) -> Result<Self> {
        let start = c.position();
        let location = c.read_u8()?;
        let hash = c.read_u32()?;
        let record = match location {
            0 => {
                let reference_count = c.read_u32()?;
                let mut heap_id = [0u8; HEAP_ID_SIZE];
                heap_id.copy_from_slice(&c.read_bytes(HEAP_ID_SIZE)?);
                SharedMessageRecord::Heap { hash, reference_count, heap_id }
            }
            1 => {
                c.skip(1)?;
                let message_type = c.read_u8()?;
                let creation_index = c.read_u16()?;
                let address = c.read_offset()?;
                SharedMessageRecord::ObjectHeader { hash, message_type, creation_index, address }
            }
            other => return Err(c.format_error(format!("shared message location {}", other))),
        };
        c.seek(start + Self::encoded_size(c.sizes()))?;
        Ok(record)
    }

    /// Encodes one fixed-size entry.
    pub fn encode(&self, w: &mut FieldWriter) {
        let start = w.len();
        match self {
            SharedMessageRecord::Heap { hash, reference_count, heap_id } => {
                w.put_u8(0);
                w.put_u32(*hash);
                w.put_u32(*reference_count);
                w.put_slice(heap_id);
            }
            SharedMessageRecord::ObjectHeader { hash, message_type, creation_index, address } => {
                w.put_u8(1);
                w.put_u32(*hash);
                w.put_u8(0);
                w.put_u8(*message_type);
                w.put_u16(*creation_index);
                w.put_offset(*address);
            }
        }
        w.pad_to(start + Self::encoded_size(w.sizes()));
    }
}

/// A decoded version 2 B-tree record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Type 1.
    HugeIndirect {
        /// Object address.
        address: u64,
        /// Stored length.
        length: u64,
        /// Huge object id.
        id: u64,
    },
    /// Type 2.
    HugeIndirectFiltered {
        /// Object address.
        address: u64,
        /// Stored (filtered) length.
        length: u64,
        /// Skipped filters.
        filter_mask: u32,
        /// Unfiltered length.
        memory_size: u64,
        /// Huge object id.
        id: u64,
    },
    /// Type 3.
    HugeDirect {
        /// Object address.
        address: u64,
        /// Stored length.
        length: u64,
    },
    /// Type 4.
    HugeDirectFiltered {
        /// Object address.
        address: u64,
        /// Stored (filtered) length.
        length: u64,
        /// Skipped filters.
        filter_mask: u32,
        /// Unfiltered length.
        memory_size: u64,
    },
    /// Type 5.
    LinkName {
        /// lookup3 hash of the link name.
        hash: u32,
        /// Fractal heap id of the link message.
        heap_id: [u8; LINK_HEAP_ID_SIZE],
    },
    /// Type 6.
    LinkCreationOrder {
        /// Creation order of the link.
        creation_order: u64,
        /// Fractal heap id of the link message.
        heap_id: [u8; LINK_HEAP_ID_SIZE],
    },
    /// Type 7.
    SharedMessage(SharedMessageRecord),
    /// Type 8.
    AttributeName {
        /// Fractal heap id of the attribute message.
        heap_id: [u8; HEAP_ID_SIZE],
        /// Header message flags of the attribute.
        flags: u8,
        /// Creation order of the attribute.
        creation_order: u32,
        /// lookup3 hash of the attribute name.
        hash: u32,
    },
    /// Type 9.
    AttributeCreationOrder {
        /// Fractal heap id of the attribute message.
        heap_id: [u8; HEAP_ID_SIZE],
        /// Header message flags of the attribute.
        flags: u8,
        /// Creation order of the attribute.
        creation_order: u32,
    },
    /// Types 10 and 11.
    Chunk {
        /// Chunk address.
        address: u64,
        /// Stored size, filtered chunks only.
        size: Option<u64>,
        /// Skipped filters, filtered chunks only.
        filter_mask: u32,
        /// Chunk coordinate divided by the chunk dimensions.
        scaled: Vec<u64>,
    },
}

/// What a record decoder needs besides the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    /// Record type code.
    pub record_type: u8,
    /// File field widths.
    pub sizes: Sizes,
    /// Dataset rank, chunk records only.
    pub rank: usize,
    /// Width of the stored chunk size, filtered chunk records only.
    pub chunk_size_len: usize,
}

impl RecordLayout {
    /// Layout of a record type that does not depend on a dataset.
    pub fn new(record_type: u8, sizes: Sizes) -> Self {
        Self { record_type, sizes, rank: 0, chunk_size_len: 0 }
    }

    /// Layout of chunk records for a dataset of `rank` dimensions.
    pub fn chunk(filtered: bool, sizes: Sizes, rank: usize, chunk_size_len: usize) -> Self {
        Self { record_type: if filtered { 11 } else { 10 }, sizes, rank, chunk_size_len }
    }

    /// Encoded size of one record, `None` for unknown types.
    pub fn record_size(&self) -> Option<usize> {
        let o = self.sizes.offset_size();
        let l = self.sizes.length_size();
        Some(match self.record_type {
            1 => o + l + l,
            2 => o + l + 4 + l + l,
            3 => o + l,
            4 => o + l + 4 + l,
            5 => 4 + LINK_HEAP_ID_SIZE,
            6 => 8 + LINK_HEAP_ID_SIZE,
            7 => SharedMessageRecord::encoded_size(self.sizes),
            8 => HEAP_ID_SIZE + 1 + 4 + 4,
            9 => HEAP_ID_SIZE + 1 + 4,
            10 => o + 8 * self.rank,
            11 => o + self.chunk_size_len + 4 + 8 * self.rank,
            _ => return None,
        })
    }

    /// Decodes one record.
    pub fn decode(&self, c: &mut FieldCursor) -> Result<Record> {
        let record = match self.record_type {
            1 => Record::HugeIndirect {
                address: c.read_offset()?,
                length: c.read_length()?,
                id: c.read_length()?,
            },
            2 => Record::HugeIndirectFiltered {
                address: c.read_offset()?,
                length: c.read_length()?,
                filter_mask: c.read_u32()?,
                memory_size: c.read_length()?,
                id: c.read_length()?,
            },
            3 => Record::HugeDirect { address: c.read_offset()?, length: c.read_length()? },
            4 => Record::HugeDirectFiltered {
                address: c.read_offset()?,
                length: c.read_length()?,
                filter_mask: c.read_u32()?,
                memory_size: c.read_length()?,
            },
            5 => {
                let hash = c.read_u32()?;
                let mut heap_id = [0u8; LINK_HEAP_ID_SIZE];
                heap_id.copy_from_slice(&c.read_bytes(LINK_HEAP_ID_SIZE)?);
                Record::LinkName { hash, heap_id }
            }
            6 => {
                let creation_order = c.read_u64()?;
                let mut heap_id = [0u8; LINK_HEAP_ID_SIZE];
                heap_id.copy_from_slice(&c.read_bytes(LINK_HEAP_ID_SIZE)?);
                Record::LinkCreationOrder { creation_order, heap_id }
            }
            7 => Record::SharedMessage(SharedMessageRecord::decode(c)?),
            8 | 9 => {
                let mut heap_id = [0u8; HEAP_ID_SIZE];
                heap_id.copy_from_slice(&c.read_bytes(HEAP_ID_SIZE)?);
                let flags = c.read_u8()?;
                let creation_order = c.read_u32()?;
                if self.record_type == 8 {
                    Record::AttributeName { heap_id, flags, creation_order, hash: c.read_u32()? }
                } else {
                    Record::AttributeCreationOrder { heap_id, flags, creation_order }
                }
            }
            10 | 11 => {
                let address = c.read_offset()?;
                let (size, filter_mask) = if self.record_type == 11 {
                    (Some(c.read_uint(self.chunk_size_len)?), c.read_u32()?)
                } else {
                    (None, 0)
                };
                let mut scaled = Vec::with_capacity(self.rank);
                for _ in 0..self.rank {
                    scaled.push(c.read_u64()?);
                }
                Record::Chunk { address, size, filter_mask, scaled }
            }
            other => return Err(c.unsupported(format!("v2 B-tree record type {}", other))),
        };
        Ok(record)
    }

    /// Encodes one record.
    pub fn encode(&self, record: &Record, w: &mut FieldWriter) {
        match record {
            Record::HugeIndirect { address, length, id } => {
                w.put_offset(*address);
                w.put_length(*length);
                w.put_length(*id);
            }
            Record::HugeIndirectFiltered { address, length, filter_mask, memory_size, id } => {
                w.put_offset(*address);
                w.put_length(*length);
                w.put_u32(*filter_mask);
                w.put_length(*memory_size);
                w.put_length(*id);
            }
            Record::HugeDirect { address, length } => {
                w.put_offset(*address);
                w.put_length(*length);
            }
            Record::HugeDirectFiltered { address, length, filter_mask, memory_size } => {
                w.put_offset(*address);
                w.put_length(*length);
                w.put_u32(*filter_mask);
                w.put_length(*memory_size);
            }
            Record::LinkName { hash, heap_id } => {
                w.put_u32(*hash);
                w.put_slice(heap_id);
            }
            Record::LinkCreationOrder { creation_order, heap_id } => {
                w.put_u64(*creation_order);
                w.put_slice(heap_id);
            }
            Record::SharedMessage(shared) => shared.encode(w),
            Record::AttributeName { heap_id, flags, creation_order, hash } => {
                w.put_slice(heap_id);
                w.put_u8(*flags);
                w.put_u32(*creation_order);
                w.put_u32(*hash);
            }
            Record::AttributeCreationOrder { heap_id, flags, creation_order } => {
                w.put_slice(heap_id);
                w.put_u8(*flags);
                w.put_u32(*creation_order);
            }
            Record::Chunk { address, size, filter_mask, scaled } => {
                w.put_offset(*address);
                if self.record_type == 11 {
                    w.put_uint(size.unwrap_or(0), self.chunk_size_len);
                    w.put_u32(*filter_mask);
                }
                for offset in scaled {
                    w.put_u64(*offset);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Structure;

    fn round_trip(layout: RecordLayout, record: &Record) -> Record {
        let mut w = FieldWriter::new(layout.sizes);
        layout.encode(record, &mut w);
        assert_eq!(Some(w.len()), layout.record_size());
        let mut c = FieldCursor::new(w.finish(), layout.sizes, Structure::BTreeV2Node, 0);
        layout.decode(&mut c).unwrap()
    }

    #[test]
    fn test_sizes_follow_field_widths() {
        let narrow = Sizes::new(4, 4);
        assert_eq!(RecordLayout::new(1, narrow).record_size(), Some(12));
        assert_eq!(RecordLayout::new(1, Sizes::default()).record_size(), Some(24));
        assert_eq!(RecordLayout::new(7, narrow).record_size(), Some(17));
        assert_eq!(RecordLayout::chunk(true, narrow, 2, 2).record_size(), Some(26));
        assert_eq!(RecordLayout::new(12, narrow).record_size(), None);
    }

    #[test]
    fn test_record_round_trips() {
        let sizes = Sizes::new(4, 8);
        let cases = vec![
            (RecordLayout::new(2, sizes), Record::HugeIndirectFiltered {
                address: 0x900,
                length: 40,
                filter_mask: 1,
                memory_size: 100,
                id: 3,
            }),
            (RecordLayout::new(5, sizes), Record::LinkName { hash: 0xABCD, heap_id: [1; 7] }),
            (RecordLayout::new(8, sizes), Record::AttributeName {
                heap_id: [2; 8],
                flags: 0,
                creation_order: 4,
                hash: 99,
            }),
            (
                RecordLayout::new(7, sizes),
                Record::SharedMessage(SharedMessageRecord::ObjectHeader {
                    hash: 5,
                    message_type: 3,
                    creation_index: 0,
                    address: 0x300,
                }),
            ),
            (RecordLayout::chunk(true, sizes, 2, 3), Record::Chunk {
                address: 0x1000,
                size: Some(77),
                filter_mask: 0,
                scaled: vec![1, 2],
            }),
        ];
        for (layout, record) in cases {
            assert_eq!(round_trip(layout, &record), record);
        }
    }

    #[test]
    fn test_unknown_record_type_is_unsupported() {
        let layout = RecordLayout::new(12, Sizes::default());
        let bytes = bytes::Bytes::from_static(&[0; 16]);
        let mut c = FieldCursor::new(bytes, Sizes::default(), Structure::BTreeV2Node, 0);
        assert!(layout.decode(&mut c).unwrap_err().is_unsupported());
    }
}
