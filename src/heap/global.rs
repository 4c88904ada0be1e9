//! Global heap collections.
//!
//! ```text
//! collection: ["GCOL"][version=1][reserved:3][collection size: L] objects...
//! object:     [index: u16][reference count: u16][reserved:4][size: L]
//!             [data, padded to 8]
//! ```
//!
//! Index 0 marks the free space at the end of a collection and ends the
//! object scan. Collections are shared by many objects and are cached by
//! address.

use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::io::{FieldCursor, FieldWriter, FileImage, Sizes};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) const SIGNATURE: &[u8; 4] = b"GCOL";

/// Smallest legal collection size.
pub const MIN_COLLECTION_SIZE: u64 = 4096;

/// One object of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalHeapObject {
    /// Number of references to the object.
    pub reference_count: u16,
    /// Object bytes.
    pub data: Bytes,
}

/// A decoded global heap collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalHeapCollection {
    /// Address of the collection.
    pub address: u64,
    /// Declared collection size, header included.
    pub size: u64,
    objects: BTreeMap<u16, GlobalHeapObject>,
}

impl GlobalHeapCollection {
    /// Reads (or fetches from cache) the collection at `address`.
    pub fn read(ctx: &Context, address: u64) -> Result<Arc<Self>> {
        ctx.cached(address, Structure::GlobalHeap, || Self::decode(ctx, address))
    }

    fn decode(ctx: &Context, address: u64) -> Result<Self> {
        let sizes = ctx.sizes();
        let prefix_len = 8 + sizes.length_size();
        let mut c = ctx.read(address, prefix_len, Structure::GlobalHeap)?;
        c.expect_signature(SIGNATURE)?;
        c.expect_version(&[1])?;
        c.skip(3)?;
        let size = c.read_length()?;
        if size < MIN_COLLECTION_SIZE {
            return Err(c.format_error(format!(
                "collection size {} below minimum {}",
                size, MIN_COLLECTION_SIZE
            )));
        }
        let len = usize::try_from(size).map_err(|_| {
            Error::bounds(Structure::GlobalHeap, address, "collection size overflows")
        })?;

        let mut c = ctx.read(address, len, Structure::GlobalHeap)?;
        c.seek(prefix_len)?;
        let object_header_len = 8 + sizes.length_size();
        let mut objects = BTreeMap::new();
        while c.remaining() >= object_header_len {
            let index = c.read_u16()?;
            let reference_count = c.read_u16()?;
            c.skip(4)?;
            let object_size = c.read_length()?;
            if index == 0 {
                break;
            }
            let object_size = usize::try_from(object_size)
                .ok()
                .filter(|n| *n <= c.remaining())
                .ok_or_else(|| {
                    c.bounds(format!(
                        "object {} of {} bytes overruns collection",
                        index, object_size
                    ))
                })?;
            let data = c.read_bytes(object_size)?;
            // The last object's padding may be cut by the collection end.
            let padding = (8 - object_size % 8) % 8;
            c.skip(padding.min(c.remaining()))?;
            if objects.insert(index, GlobalHeapObject { reference_count, data }).is_some() {
                return Err(c.format_error(format!("duplicate object index {}", index)));
            }
        }
        log::debug!("Global heap collection at {:#x}: {} objects", address, objects.len());
        Ok(Self { address, size, objects })
    }

    /// Looks up an object by index.
    pub fn get(&self, index: u16) -> Option<&GlobalHeapObject> {
        self.objects.get(&index)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the collection holds no live objects.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Objects in index order.
    pub fn objects(&self) -> impl Iterator<Item = (u16, &GlobalHeapObject)> {
        self.objects.iter().map(|(index, object)| (*index, object))
    }
}

/// Reference to one global heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalHeapId {
    /// Collection address.
    pub collection: u64,
    /// Object index within the collection.
    pub index: u32,
}

impl GlobalHeapId {
    /// Encoded size: an address and a 4-byte index.
    pub fn encoded_size(sizes: Sizes) -> usize {
        sizes.offset_size() + 4
    }

    /// Decodes an id.
    pub fn decode(c: &mut FieldCursor) -> Result<Self> {
        Ok(Self { collection: c.read_offset()?, index: c.read_u32()? })
    }

    /// Encodes an id.
    pub fn encode(&self, w: &mut FieldWriter) {
        w.put_offset(self.collection);
        w.put_u32(self.index);
    }

    /// Returns the referenced object's bytes.
    pub fn resolve(&self, ctx: &Context) -> Result<Bytes> {
        let collection = GlobalHeapCollection::read(ctx, self.collection)?;
        u16::try_from(self.index)
            .ok()
            .and_then(|index| collection.get(index))
            .map(|object| object.data.clone())
            .ok_or_else(|| {
                Error::not_found(format!(
                    "global heap object {} in collection {:#x}",
                    self.index, self.collection
                ))
            })
    }
}

/// Writes one collection of objects.
#[derive(Debug, Clone, Default)]
pub struct GlobalHeapBuilder {
    objects: Vec<Bytes>,
}

impl GlobalHeapBuilder {
    /// An empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object; returns its index.
    pub fn add(&mut self, data: impl Into<Bytes>) -> u16 {
        self.objects.push(data.into());
        self.objects.len() as u16
    }

    /// Writes the collection, at least [`MIN_COLLECTION_SIZE`] bytes, and
    /// returns its address.
    pub fn write(&self, image: &mut FileImage) -> u64 {
        let sizes = image.sizes();
        let mut w = FieldWriter::new(sizes);
        w.put_slice(SIGNATURE);
        w.put_u8(1);
        w.put_zeros(3);
        let size_pos = w.len();
        w.put_length(0);
        for (i, data) in self.objects.iter().enumerate() {
            w.put_u16(i as u16 + 1);
            w.put_u16(1);
            w.put_u32(0);
            w.put_length(data.len() as u64);
            w.put_slice(data);
            w.align(8);
        }

        let object_header_len = 8 + sizes.length_size();
        let used = w.len() + object_header_len;
        let size = (used as u64).max(MIN_COLLECTION_SIZE);
        let free = size - w.len() as u64;
        w.put_u16(0);
        w.put_u16(0);
        w.put_u32(0);
        w.put_length(free);
        w.pad_to(size as usize);

        let mut bytes = w.finish().to_vec();
        bytes[size_pos..size_pos + sizes.length_size()]
            .copy_from_slice(&size.to_le_bytes()[..sizes.length_size()]);
        image.append(&bytes)
    }
}
