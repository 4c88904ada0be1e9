//! Group-related messages: Link (0x0006), Link Info (0x0002), Group Info
//! (0x000A) and Symbol Table (0x0011).

use crate::error::Result;
use crate::io::{FieldCursor, FieldWriter, Sizes};
use bytes::Bytes;

const LINK_TYPE_HARD: u8 = 0;
const LINK_TYPE_SOFT: u8 = 1;
const LINK_TYPE_EXTERNAL: u8 = 64;

/// Where a link points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    /// Object header address in this file.
    Hard(u64),
    /// Path in this file.
    Soft(String),
    /// Object in another file.
    External {
        /// File name.
        file: String,
        /// Object path inside that file.
        path: String,
    },
    /// User-defined link class, kept opaque.
    UserDefined {
        /// Link class (65-255).
        link_type: u8,
        /// Class-specific data.
        data: Bytes,
    },
}

/// Link message.
///
/// ```text
/// [version=1][flags][type, bit 3][creation order: u64, bit 2][charset, bit 4]
/// [name length: 1/2/4/8 bytes by bits 0-1][name][target]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMessage {
    /// Link name.
    pub name: String,
    /// Creation order, if tracked.
    pub creation_order: Option<u64>,
    /// Character set of the name (0 ASCII, 1 UTF-8).
    pub charset: u8,
    /// Link target.
    pub target: LinkTarget,
}

impl LinkMessage {
    /// A hard link.
    pub fn hard(name: impl Into<String>, address: u64) -> Self {
        Self {
            name: name.into(),
            creation_order: None,
            charset: 0,
            target: LinkTarget::Hard(address),
        }
    }

    /// A soft link.
    pub fn soft(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            creation_order: None,
            charset: 0,
            target: LinkTarget::Soft(path.into()),
        }
    }

    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        c.expect_version(&[1])?;
        let flags = c.read_u8()?;
        let link_type = if flags & 0x08 != 0 { c.read_u8()? } else { LINK_TYPE_HARD };
        let creation_order = if flags & 0x04 != 0 { Some(c.read_u64()?) } else { None };
        let charset = if flags & 0x10 != 0 { c.read_u8()? } else { 0 };
        let name_len = c.read_uint(1 << (flags & 0x03))? as usize;
        let name = c.read_string(name_len)?;

        let target = match link_type {
            LINK_TYPE_HARD => LinkTarget::Hard(c.read_offset()?),
            LINK_TYPE_SOFT => {
                let len = c.read_u16()? as usize;
                LinkTarget::Soft(c.read_string(len)?)
            }
            LINK_TYPE_EXTERNAL => {
                let len = c.read_u16()? as usize;
                let data = c.read_bytes(len)?;
                let mut inner = FieldCursor::new(data, c.sizes(), c.structure(), c.address());
                // version and flags
                inner.skip(1)?;
                let file = inner.read_cstring()?;
                let path = inner.read_cstring()?;
                LinkTarget::External { file, path }
            }
            other => {
                let len = c.read_u16()? as usize;
                LinkTarget::UserDefined { link_type: other, data: c.read_bytes(len)? }
            }
        };

        Ok(Self { name, creation_order, charset, target })
    }

    pub(crate) fn encode(&self, sizes: Sizes) -> Bytes {
        let mut w = FieldWriter::new(sizes);
        w.put_u8(1);

        let name_len = self.name.len() as u64;
        let width_code: u8 = match name_len {
            0..=0xFF => 0,
            0x100..=0xFFFF => 1,
            0x1_0000..=0xFFFF_FFFF => 2,
            _ => 3,
        };
        let link_type = match &self.target {
            LinkTarget::Hard(_) => LINK_TYPE_HARD,
            LinkTarget::Soft(_) => LINK_TYPE_SOFT,
            LinkTarget::External { .. } => LINK_TYPE_EXTERNAL,
            LinkTarget::UserDefined { link_type, .. } => *link_type,
        };
        let mut flags = width_code;
        if link_type != LINK_TYPE_HARD {
            flags |= 0x08;
        }
        if self.creation_order.is_some() {
            flags |= 0x04;
        }
        if self.charset != 0 {
            flags |= 0x10;
        }
        w.put_u8(flags);
        if link_type != LINK_TYPE_HARD {
            w.put_u8(link_type);
        }
        if let Some(order) = self.creation_order {
            w.put_u64(order);
        }
        if self.charset != 0 {
            w.put_u8(self.charset);
        }
        w.put_uint(name_len, 1 << width_code);
        w.put_slice(self.name.as_bytes());

        match &self.target {
            LinkTarget::Hard(address) => w.put_offset(*address),
            LinkTarget::Soft(path) => {
                w.put_u16(path.len() as u16);
                w.put_slice(path.as_bytes());
            }
            LinkTarget::External { file, path } => {
                w.put_u16((file.len() + path.len() + 3) as u16);
                w.put_u8(0);
                w.put_slice(file.as_bytes());
                w.put_u8(0);
                w.put_slice(path.as_bytes());
                w.put_u8(0);
            }
            LinkTarget::UserDefined { data, .. } => {
                w.put_u16(data.len() as u16);
                w.put_slice(data);
            }
        }
        w.finish()
    }
}

/// Link info message: where a new-style group keeps dense links.
///
/// ```text
/// [version=0][flags][max creation index: u64, bit 0]
/// [fractal heap: O][name index B-tree: O][creation order B-tree: O, bit 1]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfoMessage {
    /// Highest creation index handed out, if tracked.
    pub max_creation_index: Option<u64>,
    /// Fractal heap holding dense links; undefined for compact groups.
    pub fractal_heap_address: u64,
    /// Version 2 B-tree indexing links by name hash.
    pub name_index_address: u64,
    /// Version 2 B-tree indexing links by creation order, if indexed.
    pub creation_order_index_address: Option<u64>,
}

impl LinkInfoMessage {
    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        c.expect_version(&[0])?;
        let flags = c.read_u8()?;
        let max_creation_index = if flags & 0x01 != 0 { Some(c.read_u64()?) } else { None };
        let fractal_heap_address = c.read_offset()?;
        let name_index_address = c.read_offset()?;
        let creation_order_index_address =
            if flags & 0x02 != 0 { Some(c.read_offset()?) } else { None };
        Ok(Self {
            max_creation_index,
            fractal_heap_address,
            name_index_address,
            creation_order_index_address,
        })
    }

    pub(crate) fn encode(&self, sizes: Sizes) -> Bytes {
        let mut w = FieldWriter::new(sizes);
        w.put_u8(0);
        let mut flags = 0;
        if self.max_creation_index.is_some() {
            flags |= 0x01;
        }
        if self.creation_order_index_address.is_some() {
            flags |= 0x02;
        }
        w.put_u8(flags);
        if let Some(max) = self.max_creation_index {
            w.put_u64(max);
        }
        w.put_offset(self.fractal_heap_address);
        w.put_offset(self.name_index_address);
        if let Some(address) = self.creation_order_index_address {
            w.put_offset(address);
        }
        w.finish()
    }
}

/// Group info message: compact/dense thresholds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupInfoMessage {
    /// (max compact links, min dense links), if not default.
    pub link_phase_change: Option<(u16, u16)>,
    /// (estimated entries, estimated name length), if not default.
    pub estimates: Option<(u16, u16)>,
}

impl GroupInfoMessage {
    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        c.expect_version(&[0])?;
        let flags = c.read_u8()?;
        let link_phase_change =
            if flags & 0x01 != 0 { Some((c.read_u16()?, c.read_u16()?)) } else { None };
        let estimates = if flags & 0x02 != 0 { Some((c.read_u16()?, c.read_u16()?)) } else { None };
        Ok(Self { link_phase_change, estimates })
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut w = FieldWriter::new(Sizes::default());
        w.put_u8(0);
        let flags = u8::from(self.link_phase_change.is_some())
            | (u8::from(self.estimates.is_some()) << 1);
        w.put_u8(flags);
        for (a, b) in self.link_phase_change.iter().chain(self.estimates.iter()) {
            w.put_u16(*a);
            w.put_u16(*b);
        }
        w.finish()
    }
}

/// Symbol table message: an old-style group's B-tree and name heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTableMessage {
    /// Version 1 group B-tree.
    pub btree_address: u64,
    /// Local heap holding link names.
    pub heap_address: u64,
}

impl SymbolTableMessage {
    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        Ok(Self { btree_address: c.read_offset()?, heap_address: c.read_offset()? })
    }

    pub(crate) fn encode(&self, sizes: Sizes) -> Bytes {
        let mut w = FieldWriter::new(sizes);
        w.put_offset(self.btree_address);
        w.put_offset(self.heap_address);
        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Structure;
    use crate::io::UNDEFINED_ADDRESS;

    fn cursor(bytes: Bytes, sizes: Sizes) -> FieldCursor {
        FieldCursor::new(bytes, sizes, Structure::HeaderMessage, 0)
    }

    #[test]
    fn test_link_targets_round_trip() {
        let sizes = Sizes::new(4, 4);
        let mut with_order = LinkMessage::hard("data", 0x1234);
        with_order.creation_order = Some(7);
        let links = vec![
            LinkMessage::hard("a", 0x800),
            with_order,
            LinkMessage::soft("alias", "/group/data"),
            LinkMessage {
                name: "ext".into(),
                creation_order: None,
                charset: 1,
                target: LinkTarget::External { file: "other.h5".into(), path: "/x".into() },
            },
            LinkMessage {
                name: "ud".into(),
                creation_order: None,
                charset: 0,
                target: LinkTarget::UserDefined {
                    link_type: 99,
                    data: Bytes::from_static(b"\x01\x02"),
                },
            },
        ];
        for link in links {
            let mut c = cursor(link.encode(sizes), sizes);
            assert_eq!(LinkMessage::decode(&mut c).unwrap(), link);
        }
    }

    #[test]
    fn test_long_link_name() {
        let link = LinkMessage::hard("n".repeat(300), 8);
        let bytes = link.encode(Sizes::default());
        assert_eq!(bytes[1] & 0x03, 1);
        let mut c = cursor(bytes, Sizes::default());
        assert_eq!(LinkMessage::decode(&mut c).unwrap().name.len(), 300);
    }

    #[test]
    fn test_invalid_utf8_link_name() {
        let mut bytes = LinkMessage::hard("abc", 0x800).encode(Sizes::default()).to_vec();
        let at = bytes.windows(3).position(|w| w == b"abc").unwrap();
        bytes[at + 1] = 0xff;
        let mut c = cursor(Bytes::from(bytes), Sizes::default());
        assert!(LinkMessage::decode(&mut c).unwrap_err().is_format_error());
    }

    #[test]
    fn test_link_info_round_trip() {
        let info = LinkInfoMessage {
            max_creation_index: Some(12),
            fractal_heap_address: 0x200,
            name_index_address: 0x300,
            creation_order_index_address: Some(0x400),
        };
        let mut c = cursor(info.encode(Sizes::default()), Sizes::default());
        assert_eq!(LinkInfoMessage::decode(&mut c).unwrap(), info);

        let compact = LinkInfoMessage {
            max_creation_index: None,
            fractal_heap_address: UNDEFINED_ADDRESS,
            name_index_address: UNDEFINED_ADDRESS,
            creation_order_index_address: None,
        };
        let mut c = cursor(compact.encode(Sizes::default()), Sizes::default());
        assert_eq!(LinkInfoMessage::decode(&mut c).unwrap(), compact);
    }

    #[test]
    fn test_group_info_and_symbol_table() {
        let info = GroupInfoMessage { link_phase_change: Some((8, 6)), estimates: None };
        let mut c = cursor(info.encode(), Sizes::default());
        assert_eq!(GroupInfoMessage::decode(&mut c).unwrap(), info);

        let stab = SymbolTableMessage { btree_address: 0x88, heap_address: 0x2a8 };
        let mut c = cursor(stab.encode(Sizes::default()), Sizes::default());
        assert_eq!(SymbolTableMessage::decode(&mut c).unwrap(), stab);
    }
}
