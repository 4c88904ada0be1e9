//! Writes version 2 B-trees from records already in key order.

use super::records::{Record, RecordLayout};
use super::v2::{
    node_info, BTreeV2Header, NodeInfo, NodePointer, HEADER_SIGNATURE, INTERNAL_SIGNATURE,
    LEAF_SIGNATURE,
};
use crate::error::{Error, Result};
use crate::io::{FileImage, UNDEFINED_ADDRESS};

/// Deepest tree the builder will produce.
const MAX_DEPTH: u16 = 16;

/// Builds a balanced version 2 B-tree bottom-up.
#[derive(Debug, Clone)]
pub struct BTreeV2Builder {
    layout: RecordLayout,
    node_size: u32,
    split_percent: u8,
    merge_percent: u8,
}

impl BTreeV2Builder {
    /// A builder with the library's default 512-byte nodes.
    pub fn new(layout: RecordLayout) -> Self {
        Self { layout, node_size: 512, split_percent: 100, merge_percent: 40 }
    }

    /// Sets the node size; small nodes force deeper trees.
    pub fn node_size(mut self, node_size: u32) -> Self {
        self.node_size = node_size;
        self
    }

    /// Writes the nodes and the header, returning the header address.
    pub fn write(&self, image: &mut FileImage, records: &[Record]) -> Result<u64> {
        let record_size = self.layout.record_size().ok_or_else(|| {
            Error::invalid_argument(format!("record type {}", self.layout.record_type))
        })?;
        let offset_size = image.sizes().offset_size();
        let (info, nrec_size) = node_info(self.node_size, record_size, offset_size, MAX_DEPTH)
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "node size {} too small for {}-byte records",
                    self.node_size, record_size
                ))
            })?;

        let (root, depth) = if records.is_empty() {
            (NodePointer { address: UNDEFINED_ADDRESS, record_count: 0, total_records: 0 }, 0)
        } else {
            let depth = info
                .iter()
                .position(|level| level.cum_max_records >= records.len() as u64)
                .ok_or_else(|| Error::invalid_argument("too many records for the tree depth"))?
                as u16;
            (self.write_subtree(image, records, depth, &info, nrec_size)?, depth)
        };

        let mut w = image.writer();
        w.put_slice(HEADER_SIGNATURE);
        w.put_u8(0);
        w.put_u8(self.layout.record_type);
        w.put_u32(self.node_size);
        w.put_u16(record_size as u16);
        w.put_u16(depth);
        w.put_u8(self.split_percent);
        w.put_u8(self.merge_percent);
        w.put_offset(root.address);
        w.put_u16(root.record_count as u16);
        w.put_length(root.total_records);
        w.put_checksum();
        debug_assert_eq!(
            w.len(),
            BTreeV2Header::encoded_size(offset_size, image.sizes().length_size())
        );
        Ok(image.append(&w.finish()))
    }

    fn write_subtree(
        &self,
        image: &mut FileImage,
        records: &[Record],
        depth: u16,
        info: &[NodeInfo],
        nrec_size: usize,
    ) -> Result<NodePointer> {
        let mut w = image.writer();
        if depth == 0 {
            w.put_slice(LEAF_SIGNATURE);
            w.put_u8(0);
            w.put_u8(self.layout.record_type);
            for record in records {
                self.layout.encode(record, &mut w);
            }
            w.put_checksum();
            w.pad_to(self.node_size as usize);
            let address = image.append(&w.finish());
            let count = records.len() as u64;
            return Ok(NodePointer { address, record_count: count, total_records: count });
        }

        // Split into `children` subtrees separated by one record each.
        let child_capacity = info[depth as usize - 1].cum_max_records;
        let total = records.len() as u64;
        if total == 0 {
            return Err(Error::invalid_argument("empty internal node"));
        }
        let children = (total + 1).div_ceil(child_capacity + 1).max(2);
        if children - 1 > info[depth as usize].max_records {
            return Err(Error::invalid_argument("records do not fit the chosen depth"));
        }
        let in_children = total - (children - 1);
        let base = in_children / children;
        let extra = in_children % children;

        let mut pointers = Vec::with_capacity(children as usize);
        let mut separators = Vec::with_capacity(children as usize - 1);
        let mut start = 0usize;
        for i in 0..children {
            let take = (base + u64::from(i < extra)) as usize;
            let slice = &records[start..start + take];
            pointers.push(self.write_subtree(image, slice, depth - 1, info, nrec_size)?);
            start += take;
            if i + 1 < children {
                separators.push(&records[start]);
                start += 1;
            }
        }

        w.put_slice(INTERNAL_SIGNATURE);
        w.put_u8(0);
        w.put_u8(self.layout.record_type);
        for record in &separators {
            self.layout.encode(record, &mut w);
        }
        let child_total_size = info[depth as usize - 1].cum_max_records_size;
        for pointer in &pointers {
            w.put_offset(pointer.address);
            w.put_uint(pointer.record_count, nrec_size);
            if depth > 1 {
                w.put_uint(pointer.total_records, child_total_size);
            }
        }
        w.put_checksum();
        w.pad_to(self.node_size as usize);
        let address = image.append(&w.finish());
        Ok(NodePointer {
            address,
            record_count: separators.len() as u64,
            total_records: total,
        })
    }
}
