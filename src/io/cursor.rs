//! Width-aware decoding of structure buffers.

use crate::error::{Error, Result, Structure};
use bytes::Bytes;

/// In-memory representation of the all-ones "undefined address" pattern.
///
/// Decoding normalizes an all-ones offset of any width to this value and
/// encoding writes it back as all ones of the file's offset width.
pub const UNDEFINED_ADDRESS: u64 = u64::MAX;

/// Returns true if `address` points somewhere.
#[inline]
pub fn is_defined(address: u64) -> bool {
    address != UNDEFINED_ADDRESS
}

/// Field widths fixed by the superblock for the lifetime of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sizes {
    /// Width of an address ("offset") field in bytes.
    pub offset: u8,
    /// Width of a length field in bytes.
    pub length: u8,
}

impl Default for Sizes {
    fn default() -> Self {
        Self { offset: 8, length: 8 }
    }
}

impl Sizes {
    /// Creates a field width pair.
    pub const fn new(offset: u8, length: u8) -> Self {
        Self { offset, length }
    }

    /// Both widths are a power of two between 1 and 8.
    pub fn is_valid(&self) -> bool {
        let ok = |w: u8| matches!(w, 1 | 2 | 4 | 8);
        ok(self.offset) && ok(self.length)
    }

    /// Address width as `usize`.
    #[inline]
    pub fn offset_size(&self) -> usize {
        self.offset as usize
    }

    /// Length width as `usize`.
    #[inline]
    pub fn length_size(&self) -> usize {
        self.length as usize
    }
}

/// A bounds-checked little-endian reader over one structure's bytes.
///
/// Every failure is reported against the structure kind and the file address
/// of the byte being decoded.
#[derive(Debug, Clone)]
pub struct FieldCursor {
    data: Bytes,
    pos: usize,
    sizes: Sizes,
    structure: Structure,
    address: u64,
}

impl FieldCursor {
    /// Creates a cursor over `data`, which was read from `address`.
    pub fn new(data: Bytes, sizes: Sizes, structure: Structure, address: u64) -> Self {
        Self { data, pos: 0, sizes, structure, address }
    }

    /// Field widths in effect.
    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    /// Structure kind being decoded.
    pub fn structure(&self) -> Structure {
        self.structure
    }

    /// File address of the first byte of the buffer.
    pub fn base_address(&self) -> u64 {
        self.address
    }

    /// File address of the next byte to be read.
    pub fn address(&self) -> u64 {
        self.address.wrapping_add(self.pos as u64)
    }

    /// Offset of the next byte within the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Total buffer length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if nothing is left to read.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The whole buffer.
    pub fn buffer(&self) -> &Bytes {
        &self.data
    }

    /// Moves to an absolute position within the buffer.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            let len = self.data.len();
            return Err(self.bounds(format!("seek to {} past end of {} bytes", pos, len)));
        }
        self.pos = pos;
        Ok(())
    }

    /// Skips `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if n > self.remaining() {
            return Err(self.bounds(format!(
                "need {} bytes at offset {}, only {} remain",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..start + n])
    }

    /// Reads a `u8`.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_uint(8)
    }

    /// Reads an unsigned little-endian integer of 0 to 8 bytes.
    pub fn read_uint(&mut self, width: usize) -> Result<u64> {
        if width > 8 {
            return Err(self.format_error(format!("integer field of {} bytes", width)));
        }
        let b = self.take(width)?;
        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Reads an address of the file's offset width.
    ///
    /// All ones is returned as [`UNDEFINED_ADDRESS`].
    pub fn read_offset(&mut self) -> Result<u64> {
        let width = self.sizes.offset_size();
        let value = self.read_uint(width)?;
        if width < 8 && value == (1u64 << (width * 8)) - 1 {
            return Ok(UNDEFINED_ADDRESS);
        }
        Ok(value)
    }

    /// Reads a length of the file's length width.
    pub fn read_length(&mut self) -> Result<u64> {
        self.read_uint(self.sizes.length_size())
    }

    /// Reads `n` bytes without copying.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        if n > self.remaining() {
            return Err(self.bounds(format!(
                "need {} bytes at offset {}, only {} remain",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = self.data.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(slice)
    }

    /// Reads everything that is left.
    pub fn read_rest(&mut self) -> Bytes {
        let slice = self.data.slice(self.pos..);
        self.pos = self.data.len();
        slice
    }

    /// Checks a 4-byte structure signature.
    pub fn expect_signature(&mut self, signature: &[u8; 4]) -> Result<()> {
        let at = self.address();
        let found = self.take(4)?;
        if found != signature {
            let found = found.to_vec();
            return Err(Error::format(
                self.structure,
                at,
                format!(
                    "expected signature {:?}, found {:?}",
                    String::from_utf8_lossy(signature),
                    String::from_utf8_lossy(&found)
                ),
            ));
        }
        Ok(())
    }

    /// Checks a version byte against the supported set.
    pub fn expect_version(&mut self, supported: &[u8]) -> Result<u8> {
        let version = self.read_u8()?;
        if !supported.contains(&version) {
            return Err(self.format_error(format!("unsupported version {}", version)));
        }
        Ok(version)
    }

    /// Reads `len` bytes that must be valid UTF-8.
    pub fn read_string(&mut self, len: usize) -> Result<String> {
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| self.format_error(format!("{} byte string is not valid UTF-8", len)))
    }

    /// Reads a null-terminated string; the terminator is consumed.
    pub fn read_cstring(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        let Some(end) = rest.iter().position(|b| *b == 0) else {
            return Err(self.bounds("string is not null-terminated"));
        };
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(s)
    }

    /// Skips forward to the next multiple of `alignment` relative to the
    /// start of the buffer.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = (alignment - self.pos % alignment) % alignment;
        self.skip(padding)
    }

    /// Builds a format error at the current position.
    pub fn format_error(&self, msg: impl Into<String>) -> Error {
        Error::format(self.structure, self.address(), msg)
    }

    /// Builds an unsupported-feature error at the current position.
    pub fn unsupported(&self, msg: impl Into<String>) -> Error {
        Error::unsupported(self.structure, self.address(), msg)
    }

    /// Builds a bounds error at the current position.
    pub fn bounds(&self, msg: impl Into<String>) -> Error {
        Error::bounds(self.structure, self.address(), msg)
    }
}
