//! Version 2 B-trees.
//!
//! ```text
//! header:   ["BTHD"][version=0][type][node size: u32][record size: u16]
//!           [depth: u16][split %][merge %][root: O][root records: u16]
//!           [total records: L][checksum]
//! internal: ["BTIN"][version=0][type][records][child pointers][checksum]
//! leaf:     ["BTLF"][version=0][type][records][checksum]
//! pointer:  [address: O][records in child: n][records in subtree: m, depth > 1]
//! ```
//!
//! `n` and `m` are the minimal byte widths able to hold the largest record
//! count a node (or subtree) of that depth can have; they are derived from
//! the node size exactly the way writers derive them.

use super::records::{Record, RecordLayout};
use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::io::is_defined;
use log::debug;
use std::cmp::Ordering;
use std::sync::Arc;

pub(crate) const HEADER_SIGNATURE: &[u8; 4] = b"BTHD";
pub(crate) const INTERNAL_SIGNATURE: &[u8; 4] = b"BTIN";
pub(crate) const LEAF_SIGNATURE: &[u8; 4] = b"BTLF";

/// Signature, version, type and checksum.
pub(crate) const NODE_OVERHEAD: usize = 4 + 1 + 1 + 4;

/// Bytes needed to store values up to `n`.
pub(crate) fn limit_enc_size(n: u64) -> usize {
    let log2 = if n == 0 { 0 } else { 63 - n.leading_zeros() as usize };
    log2 / 8 + 1
}

/// Per-depth capacity of nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeInfo {
    /// Records a node at this depth holds at most.
    pub max_records: u64,
    /// Records a subtree rooted at this depth holds at most.
    pub cum_max_records: u64,
    /// Width of the subtree record count stored in pointers to this depth.
    pub cum_max_records_size: usize,
}

/// Node capacities for depths `0..=depth`, plus the width of the child
/// record count field.
pub(crate) fn node_info(
    node_size: u32,
    record_size: usize,
    offset_size: usize,
    depth: u16,
) -> Option<(Vec<NodeInfo>, usize)> {
    let node_size = node_size as usize;
    if record_size == 0 || node_size <= NODE_OVERHEAD {
        return None;
    }
    let leaf_max = ((node_size - NODE_OVERHEAD) / record_size) as u64;
    if leaf_max == 0 {
        return None;
    }
    let max_nrec_size = limit_enc_size(leaf_max);
    let mut info = vec![NodeInfo {
        max_records: leaf_max,
        cum_max_records: leaf_max,
        cum_max_records_size: 0,
    }];
    for d in 1..=depth as usize {
        let pointer_size = offset_size + max_nrec_size + info[d - 1].cum_max_records_size;
        let usable = node_size.checked_sub(NODE_OVERHEAD + pointer_size)?;
        let max_records = (usable / (record_size + pointer_size)) as u64;
        if max_records == 0 {
            return None;
        }
        let cum_max_records = (max_records + 1)
            .saturating_mul(info[d - 1].cum_max_records)
            .saturating_add(max_records);
        info.push(NodeInfo {
            max_records,
            cum_max_records,
            cum_max_records_size: limit_enc_size(cum_max_records),
        });
    }
    Some((info, max_nrec_size))
}

/// Pointer to a child node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePointer {
    /// Node address.
    pub address: u64,
    /// Records stored in the node itself.
    pub record_count: u64,
    /// Records stored in the whole subtree.
    pub total_records: u64,
}

/// Decoded tree header.
#[derive(Debug, Clone)]
pub struct BTreeV2Header {
    /// Header address.
    pub address: u64,
    /// Record type code.
    pub record_type: u8,
    /// Size of every node in bytes.
    pub node_size: u32,
    /// Size of every record in bytes.
    pub record_size: u16,
    /// Depth of the tree; 0 when the root is a leaf.
    pub depth: u16,
    /// Split percentage.
    pub split_percent: u8,
    /// Merge percentage.
    pub merge_percent: u8,
    /// Root node.
    pub root: NodePointer,
    node_info: Vec<NodeInfo>,
    max_nrec_size: usize,
}

impl BTreeV2Header {
    /// Encoded header size.
    pub fn encoded_size(offset_size: usize, length_size: usize) -> usize {
        4 + 1 + 1 + 4 + 2 + 2 + 1 + 1 + offset_size + 2 + length_size + 4
    }

    fn decode(ctx: &Context, address: u64) -> Result<Self> {
        let sizes = ctx.sizes();
        let len = Self::encoded_size(sizes.offset_size(), sizes.length_size());
        let mut c = ctx.read_checked(address, len, Structure::BTreeV2Header)?;
        c.expect_signature(HEADER_SIGNATURE)?;
        c.expect_version(&[0])?;
        let record_type = c.read_u8()?;
        let node_size = c.read_u32()?;
        let record_size = c.read_u16()?;
        let depth = c.read_u16()?;
        let split_percent = c.read_u8()?;
        let merge_percent = c.read_u8()?;
        let root_address = c.read_offset()?;
        let root_records = c.read_u16()? as u64;
        let total_records = c.read_length()?;

        let (node_info, max_nrec_size) =
            node_info(node_size, record_size as usize, sizes.offset_size(), depth).ok_or_else(
                || {
                    c.format_error(format!(
                        "node size {} cannot hold records of {} bytes at depth {}",
                        node_size, record_size, depth
                    ))
                },
            )?;

        debug!(
            "v2 B-tree at {:#x}: type {}, depth {}, {} records",
            address, record_type, depth, total_records
        );

        Ok(Self {
            address,
            record_type,
            node_size,
            record_size,
            depth,
            split_percent,
            merge_percent,
            root: NodePointer {
                address: root_address,
                record_count: root_records,
                total_records,
            },
            node_info,
            max_nrec_size,
        })
    }

    /// Whether the tree holds no records.
    pub fn is_empty(&self) -> bool {
        !is_defined(self.root.address) || self.root.total_records == 0
    }
}

/// A decoded node: leaves have no children.
#[derive(Debug)]
struct Node {
    records: Vec<Record>,
    children: Vec<NodePointer>,
}

/// An open version 2 B-tree.
#[derive(Debug, Clone)]
pub struct BTreeV2 {
    ctx: Context,
    header: Arc<BTreeV2Header>,
    layout: RecordLayout,
}

impl BTreeV2 {
    /// Opens a tree whose record shape depends only on the file.
    pub fn open(ctx: &Context, address: u64) -> Result<Self> {
        let header = Self::read_header(ctx, address)?;
        let layout = RecordLayout::new(header.record_type, ctx.sizes());
        Self::with_layout(ctx, header, layout)
    }

    /// Opens a tree of chunk records for a dataset of `rank` dimensions.
    pub fn open_chunks(
        ctx: &Context,
        address: u64,
        rank: usize,
        chunk_size_len: usize,
    ) -> Result<Self> {
        let header = Self::read_header(ctx, address)?;
        let filtered = match header.record_type {
            10 => false,
            11 => true,
            other => {
                return Err(Error::unsupported(
                    Structure::BTreeV2Header,
                    address,
                    format!("record type {} in a chunk index", other),
                ))
            }
        };
        let layout = RecordLayout::chunk(filtered, ctx.sizes(), rank, chunk_size_len);
        Self::with_layout(ctx, header, layout)
    }

    fn read_header(ctx: &Context, address: u64) -> Result<Arc<BTreeV2Header>> {
        ctx.cached(address, Structure::BTreeV2Header, || BTreeV2Header::decode(ctx, address))
    }

    fn with_layout(
        ctx: &Context,
        header: Arc<BTreeV2Header>,
        layout: RecordLayout,
    ) -> Result<Self> {
        match layout.record_size() {
            Some(size) if size == header.record_size as usize => {}
            Some(size) => {
                return Err(Error::format(
                    Structure::BTreeV2Header,
                    header.address,
                    format!(
                        "record size {} does not match {} for type {}",
                        header.record_size, size, header.record_type
                    ),
                ))
            }
            None => {
                return Err(Error::unsupported(
                    Structure::BTreeV2Header,
                    header.address,
                    format!("record type {}", header.record_type),
                ))
            }
        }
        Ok(Self { ctx: ctx.clone(), header, layout })
    }

    /// The tree header.
    pub fn header(&self) -> &BTreeV2Header {
        &self.header
    }

    /// Total number of records.
    pub fn len(&self) -> u64 {
        if self.header.is_empty() {
            0
        } else {
            self.header.root.total_records
        }
    }

    /// Whether the tree holds no records.
    pub fn is_empty(&self) -> bool {
        self.header.is_empty()
    }

    fn node(&self, pointer: &NodePointer, depth: u16) -> Result<Arc<Node>> {
        self.ctx.cached(pointer.address, Structure::BTreeV2Node, || {
            self.decode_node(pointer, depth)
        })
    }

    fn decode_node(&self, pointer: &NodePointer, depth: u16) -> Result<Node> {
        let header = &self.header;
        let depth_index = depth as usize;
        let info = header.node_info.get(depth_index).ok_or_else(|| {
            Error::format(Structure::BTreeV2Node, pointer.address, "node deeper than tree")
        })?;
        if pointer.record_count > info.max_records {
            return Err(Error::format(
                Structure::BTreeV2Node,
                pointer.address,
                format!(
                    "{} records exceed node capacity {}",
                    pointer.record_count, info.max_records
                ),
            ));
        }

        let mut c =
            self.ctx.read(pointer.address, header.node_size as usize, Structure::BTreeV2Node)?;
        c.expect_signature(if depth == 0 { LEAF_SIGNATURE } else { INTERNAL_SIGNATURE })?;
        c.expect_version(&[0])?;
        let record_type = c.read_u8()?;
        if record_type != header.record_type {
            return Err(c.format_error(format!(
                "node record type {} in a tree of type {}",
                record_type, header.record_type
            )));
        }

        let count = pointer.record_count as usize;
        let record_size = header.record_size as usize;
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let start = c.position();
            records.push(self.layout.decode(&mut c)?);
            c.seek(start + record_size)?;
        }

        let mut children = Vec::new();
        if depth > 0 {
            let child_info = header.node_info[depth_index - 1];
            children.reserve(count + 1);
            for _ in 0..=count {
                let address = c.read_offset()?;
                let record_count = c.read_uint(header.max_nrec_size)?;
                let total_records = if depth > 1 {
                    c.read_uint(child_info.cum_max_records_size)?
                } else {
                    record_count
                };
                children.push(NodePointer { address, record_count, total_records });
            }
        }

        let end = c.position();
        let buffer = c.buffer();
        if end + 4 > buffer.len() {
            return Err(c.bounds("node contents overrun the node size"));
        }
        self.ctx.verify(&buffer[..end + 4], Structure::BTreeV2Node, pointer.address)?;
        Ok(Node { records, children })
    }

    /// Lazily iterates all records in key order.
    pub fn iter(&self) -> Records<'_> {
        let mut stack = Vec::new();
        if !self.header.is_empty() {
            stack.push(Frame::Pending { pointer: self.header.root, depth: self.header.depth });
        }
        Records { tree: self, stack }
    }

    /// Collects all records in key order.
    pub fn records(&self) -> Result<Vec<Record>> {
        self.iter().collect()
    }

    /// Finds the record for which `compare` returns `Equal`.
    ///
    /// `compare` orders the searched key against a record.
    pub fn find<F>(&self, mut compare: F) -> Result<Option<Record>>
    where
        F: FnMut(&Record) -> Ordering,
    {
        if self.header.is_empty() {
            return Ok(None);
        }
        let mut pointer = self.header.root;
        let mut depth = self.header.depth;
        loop {
            let node = self.node(&pointer, depth)?;
            let (index, cmp) = locate(&node.records, &mut compare);
            if cmp == Ordering::Equal {
                return Ok(Some(node.records[index].clone()));
            }
            if depth == 0 {
                return Ok(None);
            }
            let child = if cmp == Ordering::Greater { index + 1 } else { index };
            pointer = node.children[child];
            depth -= 1;
        }
    }
}

// Binary search; returns the last visited index and how the key compared.
fn locate<F>(records: &[Record], compare: &mut F) -> (usize, Ordering)
where
    F: FnMut(&Record) -> Ordering,
{
    let (mut low, mut high) = (0, records.len());
    let mut index = 0;
    let mut cmp = Ordering::Less;
    while low < high {
        index = (low + high) / 2;
        cmp = compare(&records[index]);
        match cmp {
            Ordering::Less => high = index,
            Ordering::Greater => low = index + 1,
            Ordering::Equal => break,
        }
    }
    (index, cmp)
}

enum Frame {
    Pending { pointer: NodePointer, depth: u16 },
    Visiting { node: Arc<Node>, depth: u16, step: usize },
}

/// In-order record iterator over a [`BTreeV2`].
///
/// Stops after yielding the first error.
pub struct Records<'a> {
    tree: &'a BTreeV2,
    stack: Vec<Frame>,
}

impl Iterator for Records<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.stack.pop()? {
                Frame::Pending { pointer, depth } => {
                    let node = match self.tree.node(&pointer, depth) {
                        Ok(node) => node,
                        Err(e) => {
                            self.stack.clear();
                            return Some(Err(e));
                        }
                    };
                    let first = node.children.first().copied();
                    self.stack.push(Frame::Visiting { node, depth, step: 0 });
                    if let Some(first) = first {
                        self.stack.push(Frame::Pending { pointer: first, depth: depth - 1 });
                    }
                }
                Frame::Visiting { node, depth, step } => {
                    let Some(record) = node.records.get(step).cloned() else {
                        continue;
                    };
                    // Child `step` is done: emit record `step`, then child `step + 1`.
                    let next = node.children.get(step + 1).copied();
                    self.stack.push(Frame::Visiting { node, depth, step: step + 1 });
                    if let Some(next) = next {
                        self.stack.push(Frame::Pending { pointer: next, depth: depth - 1 });
                    }
                    return Some(Ok(record));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_enc_size() {
        assert_eq!(limit_enc_size(0), 1);
        assert_eq!(limit_enc_size(255), 1);
        assert_eq!(limit_enc_size(256), 2);
        assert_eq!(limit_enc_size(65_536), 3);
    }

    #[test]
    fn test_node_info_matches_writer_geometry() {
        // 512-byte nodes of 11-byte link name records, 8-byte addresses.
        let (info, nrec_size) = node_info(512, 11, 8, 2).unwrap();
        assert_eq!(info[0].max_records, 45);
        assert_eq!(nrec_size, 1);
        // pointer = 8 + 1 + 0
        assert_eq!(info[1].max_records, (512 - 10 - 9) / (11 + 9));
        assert_eq!(info[1].cum_max_records, (24 + 1) * 45 + 24);
        assert_eq!(info[1].cum_max_records_size, 2);
        // pointer = 8 + 1 + 2
        assert_eq!(info[2].max_records, (512 - 10 - 11) / (11 + 11));
    }

    #[test]
    fn test_node_info_rejects_tiny_nodes() {
        assert!(node_info(16, 11, 8, 0).is_none());
        assert!(node_info(24, 11, 8, 1).is_none());
    }
}
