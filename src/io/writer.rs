//! Encoding side: field writers and in-memory file assembly.

use super::cursor::{Sizes, UNDEFINED_ADDRESS};
use super::MemorySource;
use crate::checksum;
use bytes::{BufMut, Bytes, BytesMut};

/// A little-endian writer that knows the file's field widths.
#[derive(Debug, Clone)]
pub struct FieldWriter {
    buf: BytesMut,
    sizes: Sizes,
}

impl FieldWriter {
    /// Creates an empty writer.
    pub fn new(sizes: Sizes) -> Self {
        Self { buf: BytesMut::new(), sizes }
    }

    /// Field widths in effect.
    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Writes a `u8`.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Writes a little-endian `u16`.
    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    /// Writes a little-endian `u32`.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    /// Writes a little-endian `u64`.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    /// Writes the low `width` bytes of `v`.
    pub fn put_uint(&mut self, v: u64, width: usize) {
        self.buf.put_slice(&v.to_le_bytes()[..width.min(8)]);
    }

    /// Writes an address; [`UNDEFINED_ADDRESS`] becomes all ones.
    pub fn put_offset(&mut self, address: u64) {
        let width = self.sizes.offset_size();
        if address == UNDEFINED_ADDRESS {
            self.buf.put_bytes(0xff, width);
        } else {
            self.put_uint(address, width);
        }
    }

    /// Writes a length.
    pub fn put_length(&mut self, v: u64) {
        self.put_uint(v, self.sizes.length_size());
    }

    /// Writes raw bytes.
    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Writes `n` zero bytes.
    pub fn put_zeros(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    /// Pads with zeros up to a multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) {
        let padding = (alignment - self.buf.len() % alignment) % alignment;
        self.put_zeros(padding);
    }

    /// Pads with zeros up to `len` bytes total.
    pub fn pad_to(&mut self, len: usize) {
        if self.buf.len() < len {
            self.put_zeros(len - self.buf.len());
        }
    }

    /// Overwrites a `u32` previously written at `pos`.
    pub fn patch_u32(&mut self, pos: usize, v: u32) {
        self.buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Appends the metadata checksum of everything written so far.
    pub fn put_checksum(&mut self) {
        let sum = checksum::checksum(&self.buf);
        self.put_u32(sum);
    }

    /// Freezes the written bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// An in-memory file assembled by bump allocation.
///
/// Builders allocate space for each structure, then write its encoded bytes
/// at the returned address.
#[derive(Debug, Clone)]
pub struct FileImage {
    data: Vec<u8>,
    sizes: Sizes,
}

impl FileImage {
    /// Creates an empty image.
    pub fn new(sizes: Sizes) -> Self {
        Self { data: Vec::new(), sizes }
    }

    /// Creates an image whose first `len` bytes are reserved (e.g. for the
    /// superblock, written last).
    pub fn with_reserved(sizes: Sizes, len: usize) -> Self {
        Self { data: vec![0u8; len], sizes }
    }

    /// Field widths of the image.
    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    /// A field writer using the image's widths.
    pub fn writer(&self) -> FieldWriter {
        FieldWriter::new(self.sizes)
    }

    /// Current end of the image.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Returns true if nothing has been allocated.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Allocates `len` zeroed bytes on an 8-byte boundary.
    pub fn allocate(&mut self, len: usize) -> u64 {
        let start = (self.data.len() + 7) & !7;
        self.data.resize(start + len, 0);
        start as u64
    }

    /// Copies `bytes` into the image at `address`, growing it if needed.
    pub fn write_at(&mut self, address: u64, bytes: &[u8]) {
        let start = address as usize;
        let end = start + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(bytes);
    }

    /// Allocates space for `bytes` and writes them.
    pub fn append(&mut self, bytes: &[u8]) -> u64 {
        let address = self.allocate(bytes.len());
        self.write_at(address, bytes);
        address
    }

    /// The image bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the image.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.data)
    }

    /// Consumes the image into a readable source.
    pub fn into_source(self) -> MemorySource {
        MemorySource::new(self.data)
    }
}
