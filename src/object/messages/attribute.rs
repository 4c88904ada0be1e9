//! Attribute (0x000C) and Attribute Info (0x0015) messages.
//!
//! ```text
//! v1: [1][reserved][name len: u16][datatype len: u16][dataspace len: u16]
//!     [name, pad 8][datatype, pad 8][dataspace, pad 8][data]
//! v2: [2][flags][name len][datatype len][dataspace len][name][datatype][dataspace][data]
//! v3: [3][flags][name len][datatype len][dataspace len][charset][name][datatype][dataspace][data]
//! ```
//!
//! Flag bit 0 (bit 1) marks the datatype (dataspace) field as a shared
//! message locator instead of an inline message.

use super::{DataspaceMessage, DatatypeMessage, Message, MessageType};
use crate::error::Result;
use crate::io::{FieldCursor, FieldWriter, Sizes};
use crate::object::shared::{SharedLocator, SharedResolver};
use bytes::Bytes;

const FLAG_SHARED_DATATYPE: u8 = 0x01;
const FLAG_SHARED_DATASPACE: u8 = 0x02;

/// Attribute message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeMessage {
    /// Encoding version (1 to 3).
    pub version: u8,
    /// Attribute name.
    pub name: String,
    /// Name character set (version 3).
    pub charset: u8,
    /// Element type, resolved if it was shared.
    pub datatype: DatatypeMessage,
    /// Shape, resolved if it was shared.
    pub dataspace: DataspaceMessage,
    /// Locator the datatype was resolved through, if shared.
    pub shared_datatype: Option<SharedLocator>,
    /// Locator the dataspace was resolved through, if shared.
    pub shared_dataspace: Option<SharedLocator>,
    /// Raw attribute value.
    pub data: Bytes,
}

impl AttributeMessage {
    /// A version 3 attribute with inline datatype and dataspace.
    pub fn new(
        name: impl Into<String>,
        datatype: DatatypeMessage,
        dataspace: DataspaceMessage,
        data: Bytes,
    ) -> Self {
        Self {
            version: 3,
            name: name.into(),
            charset: 0,
            datatype,
            dataspace,
            shared_datatype: None,
            shared_dataspace: None,
            data,
        }
    }

    pub(crate) fn decode(c: &mut FieldCursor, resolver: &mut dyn SharedResolver) -> Result<Self> {
        let version = c.expect_version(&[1, 2, 3])?;
        let flags = c.read_u8()?;
        let flags = if version == 1 { 0 } else { flags };
        let name_len = c.read_u16()? as usize;
        let datatype_len = c.read_u16()? as usize;
        let dataspace_len = c.read_u16()? as usize;
        let charset = if version == 3 { c.read_u8()? } else { 0 };
        let pad = |len: usize| if version == 1 { len.div_ceil(8) * 8 } else { len };

        let name_bytes = c.read_bytes(pad(name_len))?;
        let name_end = name_bytes[..name_len.min(name_bytes.len())]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(name_len);
        let name = String::from_utf8(name_bytes[..name_end].to_vec())
            .map_err(|_| c.format_error("attribute name is not valid UTF-8"))?;

        let datatype_at = c.address();
        let datatype_bytes = c.read_bytes(pad(datatype_len))?;
        let mut dt = FieldCursor::new(
            datatype_bytes.slice(..datatype_len),
            c.sizes(),
            c.structure(),
            datatype_at,
        );
        let (datatype, shared_datatype) = if flags & FLAG_SHARED_DATATYPE != 0 {
            let locator = SharedLocator::decode(&mut dt)?;
            match resolver.resolve(&locator, MessageType::Datatype)? {
                Message::Datatype(datatype) => (datatype, Some(locator)),
                other => {
                    return Err(c.format_error(format!(
                        "shared datatype resolved to {}",
                        other.message_type()
                    )))
                }
            }
        } else {
            (DatatypeMessage::decode(&mut dt)?, None)
        };

        let dataspace_at = c.address();
        let dataspace_bytes = c.read_bytes(pad(dataspace_len))?;
        let mut ds = FieldCursor::new(
            dataspace_bytes.slice(..dataspace_len),
            c.sizes(),
            c.structure(),
            dataspace_at,
        );
        let (dataspace, shared_dataspace) = if flags & FLAG_SHARED_DATASPACE != 0 {
            let locator = SharedLocator::decode(&mut ds)?;
            match resolver.resolve(&locator, MessageType::Dataspace)? {
                Message::Dataspace(dataspace) => (dataspace, Some(locator)),
                other => {
                    return Err(c.format_error(format!(
                        "shared dataspace resolved to {}",
                        other.message_type()
                    )))
                }
            }
        } else {
            (DataspaceMessage::decode(&mut ds)?, None)
        };

        let data_len = dataspace.element_count().saturating_mul(datatype.size as u64);
        if data_len > c.remaining() as u64 {
            return Err(c.bounds(format!(
                "attribute '{}' needs {} data bytes, {} remain",
                name,
                data_len,
                c.remaining()
            )));
        }
        let data = c.read_bytes(data_len as usize)?;

        Ok(Self {
            version,
            name,
            charset,
            datatype,
            dataspace,
            shared_datatype,
            shared_dataspace,
            data,
        })
    }

    pub(crate) fn encode(&self, sizes: Sizes) -> Bytes {
        let mut name = self.name.as_bytes().to_vec();
        name.push(0);
        let datatype = match &self.shared_datatype {
            Some(locator) => locator.encode(sizes),
            None => self.datatype.encode(),
        };
        let dataspace = match &self.shared_dataspace {
            Some(locator) => locator.encode(sizes),
            None => self.dataspace.encode(sizes),
        };

        let mut w = FieldWriter::new(sizes);
        w.put_u8(self.version);
        let mut flags = 0;
        if self.shared_datatype.is_some() {
            flags |= FLAG_SHARED_DATATYPE;
        }
        if self.shared_dataspace.is_some() {
            flags |= FLAG_SHARED_DATASPACE;
        }
        w.put_u8(if self.version == 1 { 0 } else { flags });
        w.put_u16(name.len() as u16);
        w.put_u16(datatype.len() as u16);
        w.put_u16(dataspace.len() as u16);
        if self.version == 3 {
            w.put_u8(self.charset);
        }
        for field in [&name[..], &datatype[..], &dataspace[..]] {
            w.put_slice(field);
            if self.version == 1 {
                w.put_zeros(field.len().div_ceil(8) * 8 - field.len());
            }
        }
        w.put_slice(&self.data);
        w.finish()
    }
}

/// Attribute info message: where an object keeps dense attributes.
///
/// ```text
/// [version=0][flags][max creation index: u16, bit 0]
/// [fractal heap: O][name index B-tree: O][creation order B-tree: O, bit 1]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeInfoMessage {
    /// Highest creation index handed out, if tracked.
    pub max_creation_index: Option<u16>,
    /// Fractal heap holding dense attributes.
    pub fractal_heap_address: u64,
    /// Version 2 B-tree indexing attributes by name hash.
    pub name_index_address: u64,
    /// Version 2 B-tree indexing attributes by creation order, if indexed.
    pub creation_order_index_address: Option<u64>,
}

impl AttributeInfoMessage {
    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        c.expect_version(&[0])?;
        let flags = c.read_u8()?;
        let max_creation_index = if flags & 0x01 != 0 { Some(c.read_u16()?) } else { None };
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
        let flags = u8::from(self.max_creation_index.is_some())
            | (u8::from(self.creation_order_index_address.is_some()) << 1);
        w.put_u8(flags);
        if let Some(max) = self.max_creation_index {
            w.put_u16(max);
        }
        w.put_offset(self.fractal_heap_address);
        w.put_offset(self.name_index_address);
        if let Some(address) = self.creation_order_index_address {
            w.put_offset(address);
        }
        w.finish()
    }
}
