//! Symbol table entries and nodes of old-style groups.
//!
//! ```text
//! entry: [name offset: L][object header: O][cache type: u32][reserved: u32][scratch: 16]
//!        scratch, cache type 1: [B-tree: O][local heap: O]
//!        scratch, cache type 2: [soft link value offset: u32]
//! node:  ["SNOD"][version=1][reserved][symbol count: u16][entries: 2K]
//! ```

use crate::context::Context;
use crate::error::{Result, Structure};
use crate::io::{FieldCursor, FieldWriter, Sizes, UNDEFINED_ADDRESS};
use std::sync::Arc;

pub(crate) const SIGNATURE: &[u8; 4] = b"SNOD";

/// Cached metadata kept in a symbol table entry's scratch pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchPad {
    /// Nothing cached.
    None,
    /// The entry is a group: its B-tree and local heap.
    Group {
        /// Group B-tree address.
        btree_address: u64,
        /// Local heap address.
        heap_address: u64,
    },
    /// The entry is a soft link; value offset in the local heap.
    SoftLink {
        /// Heap offset of the link value.
        value_offset: u32,
    },
}

/// One symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTableEntry {
    /// Offset of the name in the group's local heap.
    pub name_offset: u64,
    /// Object header address.
    pub object_header: u64,
    /// Scratch pad contents.
    pub scratch: ScratchPad,
}

impl SymbolTableEntry {
    /// An entry pointing at an object header with nothing cached.
    pub fn new(name_offset: u64, object_header: u64) -> Self {
        Self { name_offset, object_header, scratch: ScratchPad::None }
    }

    /// Encoded size.
    pub fn encoded_size(sizes: Sizes) -> usize {
        sizes.length_size() + sizes.offset_size() + 4 + 4 + 16
    }

    /// Decodes one entry.
    pub fn decode(c: &mut FieldCursor) -> Result<Self> {
        let name_offset = c.read_length()?;
        let object_header = c.read_offset()?;
        let cache_type = c.read_u32()?;
        c.skip(4)?;
        let scratch_start = c.position();
        let scratch = match cache_type {
            0 => ScratchPad::None,
            1 => ScratchPad::Group {
                btree_address: c.read_offset()?,
                heap_address: c.read_offset()?,
            },
            2 => ScratchPad::SoftLink { value_offset: c.read_u32()? },
            other => return Err(c.format_error(format!("symbol table cache type {}", other))),
        };
        c.seek(scratch_start + 16)?;
        Ok(Self { name_offset, object_header, scratch })
    }

    /// Encodes one entry.
    pub fn encode(&self, w: &mut FieldWriter) {
        w.put_length(self.name_offset);
        w.put_offset(self.object_header);
        let start = match self.scratch {
            ScratchPad::None => {
                w.put_u32(0);
                w.put_u32(0);
                w.len()
            }
            ScratchPad::Group { btree_address, heap_address } => {
                w.put_u32(1);
                w.put_u32(0);
                let start = w.len();
                w.put_offset(btree_address);
                w.put_offset(heap_address);
                start
            }
            ScratchPad::SoftLink { value_offset } => {
                w.put_u32(2);
                w.put_u32(0);
                let start = w.len();
                w.put_u32(value_offset);
                start
            }
        };
        w.pad_to(start + 16);
    }
}

impl Default for SymbolTableEntry {
    fn default() -> Self {
        Self::new(0, UNDEFINED_ADDRESS)
    }
}

/// A symbol table node: the leaf payload of a group B-tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTableNode {
    /// Entries in name order.
    pub entries: Vec<SymbolTableEntry>,
}

impl SymbolTableNode {
    /// Reads (or fetches from cache) the node at `address`.
    pub fn read(ctx: &Context, address: u64) -> Result<Arc<Self>> {
        ctx.cached(address, Structure::SymbolTableNode, || {
            let sizes = ctx.sizes();
            let mut c = ctx.read(address, 8, Structure::SymbolTableNode)?;
            c.expect_signature(SIGNATURE)?;
            c.expect_version(&[1])?;
            c.skip(1)?;
            let count = c.read_u16()? as usize;
            let entry_size = SymbolTableEntry::encoded_size(sizes);
            let mut c = ctx.read(address + 8, count * entry_size, Structure::SymbolTableNode)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(SymbolTableEntry::decode(&mut c)?);
            }
            Ok(Self { entries })
        })
    }

    /// Encodes the node with room for `capacity` entries.
    pub fn encode(&self, sizes: Sizes, capacity: usize) -> bytes::Bytes {
        let mut w = FieldWriter::new(sizes);
        w.put_slice(SIGNATURE);
        w.put_u8(1);
        w.put_u8(0);
        w.put_u16(self.entries.len() as u16);
        for entry in &self.entries {
            entry.encode(&mut w);
        }
        w.pad_to(8 + capacity.max(self.entries.len()) * SymbolTableEntry::encoded_size(sizes));
        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemorySource;

    #[test]
    fn test_entry_round_trip() {
        let sizes = Sizes::new(4, 4);
        for scratch in [
            ScratchPad::None,
            ScratchPad::Group { btree_address: 0x80, heap_address: 0x200 },
            ScratchPad::SoftLink { value_offset: 24 },
        ] {
            let entry = SymbolTableEntry { name_offset: 8, object_header: 0x400, scratch };
            let mut w = FieldWriter::new(sizes);
            entry.encode(&mut w);
            assert_eq!(w.len(), SymbolTableEntry::encoded_size(sizes));
            let mut c = FieldCursor::new(w.finish(), sizes, Structure::SymbolTableNode, 0);
            assert_eq!(SymbolTableEntry::decode(&mut c).unwrap(), entry);
        }
    }

    #[test]
    fn test_node_round_trip() {
        let sizes = Sizes::default();
        let node = SymbolTableNode {
            entries: vec![SymbolTableEntry::new(8, 0x100), SymbolTableEntry::new(16, 0x200)],
        };
        let bytes = node.encode(sizes, 8);
        assert_eq!(bytes.len(), 8 + 8 * 40);
        let ctx = Context::new(Arc::new(MemorySource::new(bytes)), sizes);
        assert_eq!(*SymbolTableNode::read(&ctx, 0).unwrap(), node);
    }
}
