//! Local heaps: the name segments of old-style groups.
//!
//! ```text
//! ["HEAP"][version=0][reserved:3][data segment size: L]
//! [free list head offset: L][data segment address: O]
//! ```
//!
//! Names are null-terminated strings addressed by their offset into the
//! data segment.

use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::io::FileImage;
use bytes::Bytes;
use std::sync::Arc;

pub(crate) const SIGNATURE: &[u8; 4] = b"HEAP";

/// Free list head value meaning the segment has no free space.
pub const NO_FREE_SPACE: u64 = u64::MAX;

fn all_ones(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * width)) - 1
    }
}

/// A decoded local heap with its data segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHeap {
    /// Address of the heap header.
    pub address: u64,
    /// Offset of the first free block, or [`NO_FREE_SPACE`].
    pub free_list_head: u64,
    /// Address of the data segment.
    pub data_address: u64,
    data: Bytes,
}

impl LocalHeap {
    /// Reads (or fetches from cache) the heap at `address`.
    pub fn read(ctx: &Context, address: u64) -> Result<Arc<Self>> {
        ctx.cached(address, Structure::LocalHeap, || {
            let sizes = ctx.sizes();
            let header_len = 8 + 2 * sizes.length_size() + sizes.offset_size();
            let mut c = ctx.read(address, header_len, Structure::LocalHeap)?;
            c.expect_signature(SIGNATURE)?;
            c.expect_version(&[0])?;
            c.skip(3)?;
            let data_len = c.read_length()?;
            let free_list_head = c.read_length()?;
            let data_address = c.read_offset()?;
            let data_len = usize::try_from(data_len).map_err(|_| {
                Error::bounds(Structure::LocalHeap, address, "data segment size overflows")
            })?;
            let data = ctx.read_bytes(data_address, data_len, Structure::LocalHeap)?;
            let free_list_head = if free_list_head == all_ones(sizes.length_size()) {
                NO_FREE_SPACE
            } else {
                free_list_head
            };
            log::debug!("Local heap at {:#x}: {} byte segment", address, data_len);
            Ok(Self { address, free_list_head, data_address, data })
        })
    }

    /// The data segment.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Returns the null-terminated string starting at `offset`.
    pub fn get_name(&self, offset: u64) -> Result<String> {
        let start = usize::try_from(offset)
            .ok()
            .filter(|start| *start < self.data.len())
            .ok_or_else(|| {
                Error::bounds(
                    Structure::LocalHeap,
                    self.address,
                    format!("name offset {} past {} byte segment", offset, self.data.len()),
                )
            })?;
        let rest = &self.data[start..];
        let len = rest.iter().position(|b| *b == 0).ok_or_else(|| {
            Error::bounds(
                Structure::LocalHeap,
                self.address,
                format!("name at offset {} is not terminated", offset),
            )
        })?;
        String::from_utf8(rest[..len].to_vec()).map_err(|_| {
            Error::format(
                Structure::LocalHeap,
                self.address,
                format!("name at offset {} is not valid UTF-8", offset),
            )
        })
    }
}

/// Accumulates names and writes them out as a local heap.
#[derive(Debug, Clone)]
pub struct LocalHeapBuilder {
    data: Vec<u8>,
}

impl Default for LocalHeapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHeapBuilder {
    /// A heap whose offset 0 holds the empty name.
    pub fn new() -> Self {
        Self { data: vec![0; 8] }
    }

    /// Appends `name` and returns its offset. Entries are 8-byte aligned.
    pub fn add(&mut self, name: &str) -> u64 {
        self.add_bytes(name.as_bytes())
    }

    /// Appends a raw name; it must not contain a null byte.
    pub fn add_bytes(&mut self, name: &[u8]) -> u64 {
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(name);
        self.data.push(0);
        self.data.resize(self.data.len().div_ceil(8) * 8, 0);
        offset
    }

    /// Writes header and segment; returns the header address.
    pub fn write(&self, image: &mut FileImage) -> u64 {
        let sizes = image.sizes();
        let header_len = 8 + 2 * sizes.length_size() + sizes.offset_size();
        let address = image.allocate(header_len);
        let data_address = image.append(&self.data);

        let mut w = image.writer();
        w.put_slice(SIGNATURE);
        w.put_u8(0);
        w.put_zeros(3);
        w.put_length(self.data.len() as u64);
        w.put_length(all_ones(sizes.length_size()));
        w.put_offset(data_address);
        image.write_at(address, &w.finish());
        address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Sizes;

    fn heap_with(names: &[&str], sizes: Sizes) -> (Context, u64, Vec<u64>) {
        let mut image = FileImage::with_reserved(sizes, 16);
        let mut builder = LocalHeapBuilder::new();
        let offsets = names.iter().map(|n| builder.add(n)).collect();
        let address = builder.write(&mut image);
        let ctx = Context::new(Arc::new(image.into_source()), sizes);
        (ctx, address, offsets)
    }

    #[test]
    fn test_get_name() {
        for sizes in [Sizes::new(4, 4), Sizes::default()] {
            let (ctx, address, offsets) = heap_with(&["alpha", "a_much_longer_name"], sizes);
            let heap = LocalHeap::read(&ctx, address).unwrap();
            assert_eq!(heap.get_name(0).unwrap(), "");
            assert_eq!(heap.get_name(offsets[0]).unwrap(), "alpha");
            assert_eq!(heap.get_name(offsets[1]).unwrap(), "a_much_longer_name");
            assert_eq!(heap.free_list_head, NO_FREE_SPACE);
        }
    }

    #[test]
    fn test_offset_past_segment_is_bounds_error() {
        let (ctx, address, _) = heap_with(&["x"], Sizes::default());
        let heap = LocalHeap::read(&ctx, address).unwrap();
        let err = heap.get_name(heap.data().len() as u64).unwrap_err();
        assert!(err.is_bounds_error());
        assert_eq!(err.address(), Some(address));
    }

    #[test]
    fn test_invalid_utf8_name_is_format_error() {
        let sizes = Sizes::default();
        let mut image = FileImage::with_reserved(sizes, 16);
        let mut builder = LocalHeapBuilder::new();
        let valid = builder.add("caf\u{e9}");
        let latin1 = builder.add_bytes(b"caf\xe9");
        let address = builder.write(&mut image);
        let ctx = Context::new(Arc::new(image.into_source()), sizes);
        let heap = LocalHeap::read(&ctx, address).unwrap();

        assert_eq!(heap.get_name(valid).unwrap(), "caf\u{e9}");
        let err = heap.get_name(latin1).unwrap_err();
        assert!(err.is_format_error());
        assert_eq!(err.structure(), Some(Structure::LocalHeap));
    }

    #[test]
    fn test_bad_signature() {
        let mut image = FileImage::new(Sizes::default());
        image.append(b"HEAQ\0\0\0\0");
        image.append(&[0u8; 24]);
        let ctx = Context::new(Arc::new(image.into_source()), Sizes::default());
        assert!(LocalHeap::read(&ctx, 0).unwrap_err().is_format_error());
    }
}
