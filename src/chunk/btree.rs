//! B-tree backed chunk indexes.
//!
//! Version 2 trees key chunks by scaled coordinate; version 1 trees key
//! them by element offset, with a trailing zero offset for the element
//! dimension.

use super::{ChunkGeometry, ChunkLocation};
use crate::btree::v1::{chunk_comparator, compare_offsets};
use crate::btree::{BTreeV1, BTreeV2, Record};
use crate::context::Context;
use crate::error::Result;
use std::cmp::Ordering;

/// Chunk index over a version 2 B-tree of type 10 or 11 records.
#[derive(Debug, Clone)]
pub struct BTreeV2ChunkIndex {
    tree: BTreeV2,
    geometry: ChunkGeometry,
}

impl BTreeV2ChunkIndex {
    /// Opens the tree whose header is at `address`.
    pub fn open(ctx: &Context, address: u64, geometry: ChunkGeometry) -> Result<Self> {
        let tree = BTreeV2::open_chunks(ctx, address, geometry.rank(), geometry.chunk_size_len())?;
        Ok(Self { tree, geometry })
    }

    pub(super) fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    /// Number of stored chunks.
    pub fn len(&self) -> u64 {
        self.tree.len()
    }

    /// Returns true if no chunk was ever written.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub(super) fn locate(&self, scaled: &[u64]) -> Result<Option<ChunkLocation>> {
        self.geometry.check(scaled)?;
        let record = self.tree.find(|record| match record {
            Record::Chunk { scaled: stored, .. } => compare_offsets(scaled, stored),
            _ => Ordering::Less,
        })?;
        Ok(match record {
            Some(Record::Chunk { address, size, filter_mask, .. }) => Some(ChunkLocation {
                address,
                size: size.unwrap_or_else(|| self.geometry.chunk_byte_size()),
                filter_mask,
            }),
            _ => None,
        })
    }
}

/// Chunk index over a version 1 B-tree.
#[derive(Debug, Clone)]
pub struct BTreeV1ChunkIndex {
    tree: BTreeV1,
    geometry: ChunkGeometry,
}

impl BTreeV1ChunkIndex {
    /// Opens the tree rooted at `root`; an undefined root is an empty index.
    pub fn open(ctx: &Context, root: u64, geometry: ChunkGeometry) -> Self {
        let tree = BTreeV1::open_chunks(ctx, root, geometry.rank() + 1);
        Self { tree, geometry }
    }

    pub(super) fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    pub(super) fn locate(&self, scaled: &[u64]) -> Result<Option<ChunkLocation>> {
        self.geometry.check(scaled)?;
        let offsets = self.geometry.chunk_offset(scaled);
        let Some(entry) = self.tree.find(chunk_comparator(&offsets))? else {
            return Ok(None);
        };
        // the entry only brackets the offset; the chunk must start there
        let Some(key) = entry.left.as_chunk() else {
            return Ok(None);
        };
        if key.offsets.len() < offsets.len() || key.offsets[..offsets.len()] != offsets[..] {
            return Ok(None);
        }
        Ok(Some(ChunkLocation {
            address: entry.child,
            size: key.size as u64,
            filter_mask: key.filter_mask,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{BTreeV1Builder, BTreeV2Builder, ChunkKey, Key, KeyLayout, RecordLayout};
    use crate::io::{FileImage, Sizes, UNDEFINED_ADDRESS};
    use std::sync::Arc;

    fn chunk_key(offsets: Vec<u64>, size: u32) -> Key {
        Key::Chunk(ChunkKey { size, filter_mask: 0, offsets })
    }

    #[test]
    fn test_v1_offsets_between_keys_are_absent() {
        // 1-D: 100 elements of 1 byte in chunks of 10, only chunks 0, 3, 7 stored
        let g = ChunkGeometry::fixed(vec![100], vec![10], 1).unwrap();
        let sizes = Sizes::default();
        let mut image = FileImage::with_reserved(sizes, 64);
        let entries: Vec<(Key, u64)> = [0u64, 3, 7]
            .iter()
            .map(|&s| (chunk_key(vec![s * 10, 0], 10), 0x1000 + s * 16))
            .collect();
        let root = BTreeV1Builder::new(KeyLayout::chunk(2), 2)
            .write(&mut image, &entries, chunk_key(vec![100, 0], 0))
            .unwrap();
        let ctx = Context::new(Arc::new(image.into_source()), sizes);
        let index = BTreeV1ChunkIndex::open(&ctx, root, g);

        assert_eq!(index.locate(&[3]).unwrap(), Some(ChunkLocation::new(0x1030, 10)));
        assert_eq!(index.locate(&[7]).unwrap(), Some(ChunkLocation::new(0x1070, 10)));
        assert_eq!(index.locate(&[4]).unwrap(), None);
        assert_eq!(index.locate(&[9]).unwrap(), None);
        assert!(index.locate(&[10]).unwrap_err().to_string().contains("outside grid"));
    }

    #[test]
    fn test_v1_undefined_root() {
        let g = ChunkGeometry::fixed(vec![4, 4], vec![2, 2], 4).unwrap();
        let sizes = Sizes::default();
        let image = FileImage::with_reserved(sizes, 64);
        let ctx = Context::new(Arc::new(image.into_source()), sizes);
        let index = BTreeV1ChunkIndex::open(&ctx, UNDEFINED_ADDRESS, g);
        assert_eq!(index.locate(&[1, 1]).unwrap(), None);
    }

    #[test]
    fn test_v2_filtered_sizes() {
        let g = ChunkGeometry::fixed(vec![6, 6], vec![3, 3], 8).unwrap();
        let sizes = Sizes::new(4, 4);
        let mut image = FileImage::with_reserved(sizes, 64);
        let layout = RecordLayout::chunk(true, sizes, 2, g.chunk_size_len());
        let records: Vec<Record> = [[0u64, 0], [0, 1], [1, 1]]
            .iter()
            .enumerate()
            .map(|(i, s)| Record::Chunk {
                address: 0x2000 + i as u64 * 0x100,
                size: Some(40 + i as u64),
                filter_mask: i as u32,
                scaled: s.to_vec(),
            })
            .collect();
        let address = BTreeV2Builder::new(layout).write(&mut image, &records).unwrap();
        let ctx = Context::new(Arc::new(image.into_source()), sizes);
        let index = BTreeV2ChunkIndex::open(&ctx, address, g).unwrap();

        assert_eq!(index.len(), 3);
        assert_eq!(
            index.locate(&[1, 1]).unwrap(),
            Some(ChunkLocation { address: 0x2200, size: 42, filter_mask: 2 })
        );
        assert_eq!(index.locate(&[1, 0]).unwrap(), None);
    }
}
