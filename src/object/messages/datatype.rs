//! Datatype message (0x0003).
//!
//! Only the common prefix is interpreted; class-specific properties stay
//! opaque and are handed to the type marshalling layer as bytes.
//!
//! ```text
//! [class:4 | version:4][class bit field: 3 bytes][size: u32][properties...]
//! ```

use crate::error::Result;
use crate::io::{FieldCursor, FieldWriter, Sizes};
use bytes::Bytes;

/// Datatype class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatatypeClass {
    /// Integers.
    FixedPoint,
    /// IEEE floats.
    FloatingPoint,
    /// Dates and times.
    Time,
    /// Fixed-length strings.
    String,
    /// Bit fields.
    BitField,
    /// Uninterpreted bytes.
    Opaque,
    /// Structs.
    Compound,
    /// Object and region references.
    Reference,
    /// Enumerations.
    Enumerated,
    /// Variable-length sequences and strings.
    VariableLength,
    /// Fixed-size arrays.
    Array,
}

impl DatatypeClass {
    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => DatatypeClass::FixedPoint,
            1 => DatatypeClass::FloatingPoint,
            2 => DatatypeClass::Time,
            3 => DatatypeClass::String,
            4 => DatatypeClass::BitField,
            5 => DatatypeClass::Opaque,
            6 => DatatypeClass::Compound,
            7 => DatatypeClass::Reference,
            8 => DatatypeClass::Enumerated,
            9 => DatatypeClass::VariableLength,
            10 => DatatypeClass::Array,
            _ => return None,
        })
    }

    fn bits(&self) -> u8 {
        match self {
            DatatypeClass::FixedPoint => 0,
            DatatypeClass::FloatingPoint => 1,
            DatatypeClass::Time => 2,
            DatatypeClass::String => 3,
            DatatypeClass::BitField => 4,
            DatatypeClass::Opaque => 5,
            DatatypeClass::Compound => 6,
            DatatypeClass::Reference => 7,
            DatatypeClass::Enumerated => 8,
            DatatypeClass::VariableLength => 9,
            DatatypeClass::Array => 10,
        }
    }
}

/// Datatype message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatatypeMessage {
    /// Encoding version (1 to 4).
    pub version: u8,
    /// Type class.
    pub class: DatatypeClass,
    /// Class-specific bit field.
    pub class_bits: [u8; 3],
    /// Size of one element in bytes.
    pub size: u32,
    /// Class-specific properties.
    pub properties: Bytes,
}

impl DatatypeMessage {
    /// A little-endian integer type of `size` bytes.
    pub fn integer(size: u32, signed: bool) -> Self {
        Self {
            version: 1,
            class: DatatypeClass::FixedPoint,
            class_bits: [if signed { 0x08 } else { 0x00 }, 0, 0],
            size,
            // bit offset, bit precision
            properties: Bytes::from([0u16.to_le_bytes(), (size as u16 * 8).to_le_bytes()].concat()),
        }
    }

    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        let class_and_version = c.read_u8()?;
        let version = class_and_version >> 4;
        if !(1..=4).contains(&version) {
            return Err(c.format_error(format!("datatype version {}", version)));
        }
        let class = DatatypeClass::from_bits(class_and_version & 0x0F).ok_or_else(|| {
            c.format_error(format!("datatype class {}", class_and_version & 0x0F))
        })?;
        let mut class_bits = [0u8; 3];
        for b in &mut class_bits {
            *b = c.read_u8()?;
        }
        let size = c.read_u32()?;
        let properties = c.read_rest();
        Ok(Self { version, class, class_bits, size, properties })
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut w = FieldWriter::new(Sizes::default());
        w.put_u8((self.version << 4) | self.class.bits());
        w.put_slice(&self.class_bits);
        w.put_u32(self.size);
        w.put_slice(&self.properties);
        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Structure;

    #[test]
    fn test_round_trip() {
        let dt = DatatypeMessage::integer(4, true);
        let bytes = dt.encode();
        assert_eq!(bytes[0], 0x10);
        let mut c = FieldCursor::new(bytes, Sizes::default(), Structure::HeaderMessage, 0);
        assert_eq!(DatatypeMessage::decode(&mut c).unwrap(), dt);
    }

    #[test]
    fn test_rejects_bad_class() {
        let bytes = Bytes::from_static(&[0x1F, 0, 0, 0, 4, 0, 0, 0]);
        let mut c = FieldCursor::new(bytes, Sizes::default(), Structure::HeaderMessage, 0);
        assert!(DatatypeMessage::decode(&mut c).unwrap_err().is_format_error());
    }
}
