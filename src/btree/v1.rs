//! Version 1 B-trees.
//!
//! ```text
//! ["TREE"][type: 0 group, 1 chunk][level][entries used: u16]
//! [left sibling: O][right sibling: O]
//! [key 0][child 0][key 1][child 1] ... [child n-1][key n]
//! ```
//!
//! Group keys are name offsets into the group's local heap. Chunk keys are
//! `[stored size: u32][filter mask: u32][element offsets: u64 x (rank + 1)]`;
//! the final offset always refers to the element-size dimension and is zero.
//!
//! Child `i` covers the keys between key `i` and key `i + 1`; the exact
//! boundary semantics belong to the caller's comparator.

use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::heap::LocalHeap;
use crate::io::{is_defined, FieldCursor, FieldWriter, Sizes};
use log::debug;
use std::cmp::Ordering;
use std::sync::Arc;

pub(crate) const SIGNATURE: &[u8; 4] = b"TREE";

/// What a version 1 tree indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Group members; leaves point at symbol table nodes.
    Group,
    /// Raw data chunks; leaves point at chunks.
    Chunk,
}

impl NodeType {
    fn code(&self) -> u8 {
        match self {
            NodeType::Group => 0,
            NodeType::Chunk => 1,
        }
    }
}

/// Key of a chunk tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkKey {
    /// Stored chunk size in bytes.
    pub size: u32,
    /// Skipped filters.
    pub filter_mask: u32,
    /// Element offset of the chunk, one entry per dimension plus one.
    pub offsets: Vec<u64>,
}

/// A version 1 B-tree key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    /// Offset of a name in the group's local heap.
    Group(u64),
    /// Chunk key.
    Chunk(ChunkKey),
}

impl Key {
    /// The chunk key, if this is one.
    pub fn as_chunk(&self) -> Option<&ChunkKey> {
        match self {
            Key::Chunk(key) => Some(key),
            Key::Group(_) => None,
        }
    }

    /// The heap offset, if this is a group key.
    pub fn as_group(&self) -> Option<u64> {
        match self {
            Key::Group(offset) => Some(*offset),
            Key::Chunk(_) => None,
        }
    }
}

/// Shape of keys in one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLayout {
    /// Tree type.
    pub node_type: NodeType,
    /// Number of chunk key offsets (dataset rank + 1); unused for groups.
    pub dims: usize,
}

impl KeyLayout {
    /// Keys of a group tree.
    pub fn group() -> Self {
        Self { node_type: NodeType::Group, dims: 0 }
    }

    /// Keys of a chunk tree with `dims` offsets per key.
    pub fn chunk(dims: usize) -> Self {
        Self { node_type: NodeType::Chunk, dims }
    }

    /// Encoded key size.
    pub fn key_size(&self, sizes: Sizes) -> usize {
        match self.node_type {
            NodeType::Group => sizes.length_size(),
            NodeType::Chunk => 4 + 4 + 8 * self.dims,
        }
    }

    /// Encoded size of a node able to hold `2k` entries.
    pub fn node_size(&self, sizes: Sizes, k: usize) -> usize {
        8 + 2 * sizes.offset_size()
            + (2 * k + 1) * self.key_size(sizes)
            + 2 * k * sizes.offset_size()
    }

    pub(crate) fn decode(&self, c: &mut FieldCursor) -> Result<Key> {
        Ok(match self.node_type {
            NodeType::Group => Key::Group(c.read_length()?),
            NodeType::Chunk => {
                let size = c.read_u32()?;
                let filter_mask = c.read_u32()?;
                let mut offsets = Vec::with_capacity(self.dims);
                for _ in 0..self.dims {
                    offsets.push(c.read_u64()?);
                }
                Key::Chunk(ChunkKey { size, filter_mask, offsets })
            }
        })
    }

    pub(crate) fn encode(&self, key: &Key, w: &mut FieldWriter) {
        match key {
            Key::Group(offset) => w.put_length(*offset),
            Key::Chunk(key) => {
                w.put_u32(key.size);
                w.put_u32(key.filter_mask);
                for offset in &key.offsets {
                    w.put_u64(*offset);
                }
            }
        }
    }
}

/// A decoded version 1 node.
#[derive(Debug, Clone)]
pub struct BTreeV1Node {
    /// Node address.
    pub address: u64,
    /// Distance from the leaves; 0 for leaves.
    pub level: u8,
    /// Left sibling at the same level.
    pub left_sibling: u64,
    /// Right sibling at the same level.
    pub right_sibling: u64,
    /// `children.len() + 1` keys.
    pub keys: Vec<Key>,
    /// Child addresses.
    pub children: Vec<u64>,
}

/// One leaf entry: a child with the keys bounding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    /// Key to the left of the child.
    pub left: Key,
    /// Key to the right of the child.
    pub right: Key,
    /// Child address (symbol table node or chunk).
    pub child: u64,
}

/// An open version 1 B-tree.
#[derive(Debug, Clone)]
pub struct BTreeV1 {
    ctx: Context,
    root: u64,
    layout: KeyLayout,
}

impl BTreeV1 {
    /// Opens a group tree.
    pub fn open_group(ctx: &Context, root: u64) -> Self {
        Self { ctx: ctx.clone(), root, layout: KeyLayout::group() }
    }

    /// Opens a chunk tree whose keys carry `dims` offsets.
    pub fn open_chunks(ctx: &Context, root: u64, dims: usize) -> Self {
        Self { ctx: ctx.clone(), root, layout: KeyLayout::chunk(dims) }
    }

    /// Root node address.
    pub fn root(&self) -> u64 {
        self.root
    }

    /// Reads (or fetches from cache) the node at `address`.
    pub fn node(&self, address: u64) -> Result<Arc<BTreeV1Node>> {
        self.ctx.cached(address, Structure::BTreeV1Node, || self.decode_node(address))
    }

    fn decode_node(&self, address: u64) -> Result<BTreeV1Node> {
        let sizes = self.ctx.sizes();
        let prefix_len = 8 + 2 * sizes.offset_size();
        let mut c = self.ctx.read(address, prefix_len, Structure::BTreeV1Node)?;
        c.expect_signature(SIGNATURE)?;
        let node_type = c.read_u8()?;
        if node_type != self.layout.node_type.code() {
            return Err(c.format_error(format!(
                "node type {} in a {:?} tree",
                node_type, self.layout.node_type
            )));
        }
        let level = c.read_u8()?;
        let entries = c.read_u16()? as usize;
        let left_sibling = c.read_offset()?;
        let right_sibling = c.read_offset()?;

        let key_size = self.layout.key_size(sizes);
        let body_len = entries * (key_size + sizes.offset_size()) + key_size;
        let mut c = self.ctx.read(address + prefix_len as u64, body_len, Structure::BTreeV1Node)?;
        let mut keys = Vec::with_capacity(entries + 1);
        let mut children = Vec::with_capacity(entries);
        for _ in 0..entries {
            keys.push(self.layout.decode(&mut c)?);
            children.push(c.read_offset()?);
        }
        keys.push(self.layout.decode(&mut c)?);

        debug!("v1 B-tree node at {:#x}: level {}, {} entries", address, level, entries);
        Ok(BTreeV1Node { address, level, left_sibling, right_sibling, keys, children })
    }

    /// Descends to the leaf entry whose key range holds the searched key.
    ///
    /// `compare(left, right)` returns `Less` if the searched key lies left
    /// of `left`, `Greater` if it lies right of `right`, and `Equal` if it
    /// falls between them. Returns `None` when the key is outside the tree.
    pub fn find<F>(&self, mut compare: F) -> Result<Option<LeafEntry>>
    where
        F: FnMut(&Key, &Key) -> Result<Ordering>,
    {
        if !is_defined(self.root) {
            return Ok(None);
        }
        let mut address = self.root;
        let mut expected_level: Option<u8> = None;
        loop {
            let node = self.node(address)?;
            if let Some(level) = expected_level {
                if node.level != level {
                    return Err(Error::format(
                        Structure::BTreeV1Node,
                        address,
                        format!("level {} below a level {} node", node.level, level + 1),
                    ));
                }
            }

            let (mut low, mut high) = (0, node.children.len());
            let mut found = None;
            while low < high {
                let mid = (low + high) / 2;
                match compare(&node.keys[mid], &node.keys[mid + 1])? {
                    Ordering::Less => high = mid,
                    Ordering::Greater => low = mid + 1,
                    Ordering::Equal => {
                        found = Some(mid);
                        break;
                    }
                }
            }
            let Some(index) = found else {
                return Ok(None);
            };

            if node.level == 0 {
                return Ok(Some(LeafEntry {
                    left: node.keys[index].clone(),
                    right: node.keys[index + 1].clone(),
                    child: node.children[index],
                }));
            }
            expected_level = Some(node.level - 1);
            address = node.children[index];
        }
    }

    /// Iterates all leaf entries left to right, following sibling pointers.
    pub fn entries(&self) -> LeafEntries<'_> {
        LeafEntries { tree: self, state: LeafState::Start, visited: 0 }
    }

    fn leftmost_leaf(&self) -> Result<Option<Arc<BTreeV1Node>>> {
        if !is_defined(self.root) {
            return Ok(None);
        }
        let mut node = self.node(self.root)?;
        while node.level > 0 {
            let Some(first) = node.children.first() else {
                return Ok(None);
            };
            node = self.node(*first)?;
        }
        Ok(Some(node))
    }
}

enum LeafState {
    Start,
    In(Arc<BTreeV1Node>, usize),
    Done,
}

/// Leaf entry iterator over a [`BTreeV1`].
pub struct LeafEntries<'a> {
    tree: &'a BTreeV1,
    state: LeafState,
    visited: usize,
}

impl Iterator for LeafEntries<'_> {
    type Item = Result<LeafEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match std::mem::replace(&mut self.state, LeafState::Done) {
                LeafState::Done => return None,
                LeafState::Start => match self.tree.leftmost_leaf() {
                    Ok(Some(node)) => self.state = LeafState::In(node, 0),
                    Ok(None) => return None,
                    Err(e) => return Some(Err(e)),
                },
                LeafState::In(node, index) => {
                    if index < node.children.len() {
                        let entry = LeafEntry {
                            left: node.keys[index].clone(),
                            right: node.keys[index + 1].clone(),
                            child: node.children[index],
                        };
                        self.state = LeafState::In(node, index + 1);
                        return Some(Ok(entry));
                    }
                    if !is_defined(node.right_sibling) {
                        return None;
                    }
                    self.visited += 1;
                    if self.visited > self.tree.ctx.options().max_continuation_chunks {
                        return Some(Err(Error::format(
                            Structure::BTreeV1Node,
                            node.right_sibling,
                            "sibling chain does not terminate",
                        )));
                    }
                    match self.tree.node(node.right_sibling) {
                        Ok(next) if next.level == 0 => self.state = LeafState::In(next, 0),
                        Ok(next) => {
                            return Some(Err(Error::format(
                                Structure::BTreeV1Node,
                                next.address,
                                "leaf sibling is not a leaf",
                            )))
                        }
                        Err(e) => return Some(Err(e)),
                    }
                }
            }
        }
    }
}

/// Orders element offsets slowest dimension first.
pub fn compare_offsets(a: &[u64], b: &[u64]) -> Ordering {
    a.iter().cmp(b.iter())
}

/// Comparator locating the chunk holding element offset `offsets`:
/// `left <= offsets < right`.
pub fn chunk_comparator(offsets: &[u64]) -> impl FnMut(&Key, &Key) -> Result<Ordering> + '_ {
    move |left, right| {
        let (Some(left), Some(right)) = (left.as_chunk(), right.as_chunk()) else {
            return Err(Error::format(Structure::BTreeV1Node, 0, "group key in chunk tree"));
        };
        let n = offsets.len();
        if compare_offsets(offsets, &left.offsets[..n.min(left.offsets.len())]) == Ordering::Less {
            Ok(Ordering::Less)
        } else if compare_offsets(offsets, &right.offsets[..n.min(right.offsets.len())])
            != Ordering::Less
        {
            Ok(Ordering::Greater)
        } else {
            Ok(Ordering::Equal)
        }
    }
}

/// Comparator locating the group child that may hold link `name`:
/// `left < name <= right`, with keys resolved through the group's heap.
pub fn name_comparator<'a>(
    heap: &'a LocalHeap,
    name: &'a str,
) -> impl FnMut(&Key, &Key) -> Result<Ordering> + 'a {
    move |left, right| {
        let (Some(left), Some(right)) = (left.as_group(), right.as_group()) else {
            return Err(Error::format(Structure::BTreeV1Node, 0, "chunk key in group tree"));
        };
        if name <= heap.get_name(left)?.as_str() {
            Ok(Ordering::Less)
        } else if name > heap.get_name(right)?.as_str() {
            Ok(Ordering::Greater)
        } else {
            Ok(Ordering::Equal)
        }
    }
}
