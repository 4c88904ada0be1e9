//! Fractal heap object ids.
//!
//! ```text
//! byte 0: [version: bits 6-7, must be 0][type: bits 4-5][tiny length: bits 0-3]
//! managed: [offset: heap offset size][length: heap length size]
//! tiny:    [data]               (extended tiny ids use byte 1 for length bits)
//! huge:    [address: O][length: L]                       directly addressed
//!          [address: O][length: L][filter mask][size: L] directly addressed, filtered
//!          [id: huge id size]                            through the huge object B-tree
//! ```

use super::FractalHeapHeader;
use crate::error::{Result, Structure};
use crate::io::{FieldCursor, FieldWriter};
use bytes::Bytes;

const VERSION_MASK: u8 = 0xC0;
const TYPE_MASK: u8 = 0x30;
const TYPE_MANAGED: u8 = 0x00;
const TYPE_HUGE: u8 = 0x10;
const TYPE_TINY: u8 = 0x20;

/// A parsed heap id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapId {
    /// Object stored in a direct block.
    Managed {
        /// Offset in the heap's managed address space.
        offset: u64,
        /// Object length.
        length: u64,
    },
    /// Object stored inside the id itself.
    Tiny(Bytes),
    /// Huge object whose location is stored in the id.
    HugeDirect {
        /// Object address.
        address: u64,
        /// Stored length.
        length: u64,
        /// Filter mask and unfiltered size, for filtered heaps.
        filtered: Option<(u32, u64)>,
    },
    /// Huge object located through the huge object B-tree.
    HugeIndirect {
        /// Huge object id.
        id: u64,
    },
}

impl HeapId {
    /// Parses a raw id for the heap described by `header`.
    pub fn parse(raw: &[u8], header: &FractalHeapHeader) -> Result<Self> {
        let mut c = FieldCursor::new(
            Bytes::copy_from_slice(raw),
            header.sizes,
            Structure::FractalHeapHeader,
            header.address,
        );
        let flags = c.read_u8()?;
        if flags & VERSION_MASK != 0 {
            return Err(c.format_error(format!("heap id version {}", flags >> 6)));
        }
        match flags & TYPE_MASK {
            TYPE_MANAGED => {
                let offset = c.read_uint(header.heap_offset_size())?;
                let length = c.read_uint(header.heap_length_size())?;
                Ok(HeapId::Managed { offset, length })
            }
            TYPE_TINY => {
                let length = if header.tiny_extended() {
                    let low = c.read_u8()? as usize;
                    (((flags & 0x0F) as usize) << 8 | low) + 1
                } else {
                    (flags & 0x0F) as usize + 1
                };
                Ok(HeapId::Tiny(c.read_bytes(length)?))
            }
            TYPE_HUGE => {
                if !header.huge_ids_direct() {
                    let id = c.read_uint(header.huge_id_size())?;
                    return Ok(HeapId::HugeIndirect { id });
                }
                let address = c.read_offset()?;
                let length = c.read_length()?;
                let filtered = if header.pipeline.is_some() {
                    let mask = c.read_u32()?;
                    Some((mask, c.read_length()?))
                } else {
                    None
                };
                Ok(HeapId::HugeDirect { address, length, filtered })
            }
            other => Err(c.format_error(format!("heap id type {}", other >> 4))),
        }
    }

    /// Encodes the id, zero-padded to the heap's id length.
    pub fn encode(&self, header: &FractalHeapHeader) -> Bytes {
        let mut w = FieldWriter::new(header.sizes);
        match self {
            HeapId::Managed { offset, length } => {
                w.put_u8(TYPE_MANAGED);
                w.put_uint(*offset, header.heap_offset_size());
                w.put_uint(*length, header.heap_length_size());
            }
            HeapId::Tiny(data) => {
                let stored = data.len().saturating_sub(1);
                if header.tiny_extended() {
                    w.put_u8(TYPE_TINY | ((stored >> 8) as u8 & 0x0F));
                    w.put_u8(stored as u8);
                } else {
                    w.put_u8(TYPE_TINY | (stored as u8 & 0x0F));
                }
                w.put_slice(data);
            }
            HeapId::HugeDirect { address, length, filtered } => {
                w.put_u8(TYPE_HUGE);
                w.put_offset(*address);
                w.put_length(*length);
                if let Some((mask, size)) = filtered {
                    w.put_u32(*mask);
                    w.put_length(*size);
                }
            }
            HeapId::HugeIndirect { id } => {
                w.put_u8(TYPE_HUGE);
                w.put_uint(*id, header.huge_id_size());
            }
        }
        w.pad_to(header.heap_id_len as usize);
        w.finish()
    }
}
