//! Filter pipeline message (0x000B).
//!
//! ```text
//! v1: [1][filter count][reserved:6] then per filter:
//!     [id: u16][name len: u16][flags: u16][value count: u16]
//!     [name, pad 8][values: u32 x count][pad u32 if count is odd]
//! v2: [2][filter count] then per filter:
//!     [id: u16][name len: u16, only if id >= 256][flags: u16][value count: u16]
//!     [name, only if id >= 256][values: u32 x count]
//! ```

use crate::error::Result;
use crate::io::{FieldCursor, FieldWriter, Sizes};
use bytes::Bytes;

/// One filter of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDescription {
    /// Filter identifier.
    pub id: u16,
    /// Optional filter name.
    pub name: Option<String>,
    /// Filter flags; bit 0 marks the filter optional.
    pub flags: u16,
    /// Client data values.
    pub client_data: Vec<u32>,
}

impl FilterDescription {
    /// A filter is optional when failing to apply it is not an error.
    pub fn is_optional(&self) -> bool {
        self.flags & 0x0001 != 0
    }
}

/// Ordered filter pipeline applied to chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPipelineMessage {
    /// Encoding version (1 or 2).
    pub version: u8,
    /// Filters in application order for writing.
    pub filters: Vec<FilterDescription>,
}

impl FilterPipelineMessage {
    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        let version = c.expect_version(&[1, 2])?;
        let count = c.read_u8()? as usize;
        if version == 1 {
            c.skip(6)?;
        }
        if count > 32 {
            return Err(c.format_error(format!("{} filters in pipeline", count)));
        }

        let mut filters = Vec::with_capacity(count);
        for _ in 0..count {
            let id = c.read_u16()?;
            let name_len =
                if version == 1 || id >= 256 { c.read_u16()? as usize } else { 0 };
            let flags = c.read_u16()?;
            let value_count = c.read_u16()? as usize;
            let name = if name_len > 0 {
                let stored = if version == 1 { name_len.div_ceil(8) * 8 } else { name_len };
                let raw = c.read_bytes(stored)?;
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                Some(String::from_utf8_lossy(&raw[..end]).into_owned())
            } else {
                None
            };
            let mut client_data = Vec::with_capacity(value_count);
            for _ in 0..value_count {
                client_data.push(c.read_u32()?);
            }
            if version == 1 && value_count % 2 == 1 {
                c.skip(4)?;
            }
            filters.push(FilterDescription { id, name, flags, client_data });
        }
        Ok(Self { version, filters })
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut w = FieldWriter::new(Sizes::default());
        w.put_u8(self.version);
        w.put_u8(self.filters.len() as u8);
        if self.version == 1 {
            w.put_zeros(6);
        }
        for filter in &self.filters {
            let name = filter.name.as_ref().map(|n| {
                let mut bytes = n.as_bytes().to_vec();
                bytes.push(0);
                if self.version == 1 {
                    bytes.resize(bytes.len().div_ceil(8) * 8, 0);
                }
                bytes
            });
            let named = self.version == 1 || filter.id >= 256;
            w.put_u16(filter.id);
            if named {
                w.put_u16(name.as_ref().map_or(0, |n| n.len() as u16));
            }
            w.put_u16(filter.flags);
            w.put_u16(filter.client_data.len() as u16);
            if let (true, Some(name)) = (named, &name) {
                w.put_slice(name);
            }
            for value in &filter.client_data {
                w.put_u32(*value);
            }
            if self.version == 1 && filter.client_data.len() % 2 == 1 {
                w.put_zeros(4);
            }
        }
        w.finish()
    }
}
