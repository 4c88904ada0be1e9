//! Group membership.
//!
//! A group keeps its links in one of three forms:
//!
//! ```text
//! symbol table  Symbol Table message -> v1 group B-tree -> "SNOD" nodes,
//!               names in the group's local heap
//! compact       Link messages in the group's own header
//! dense         Link Info message -> fractal heap of encoded Link messages,
//!               v2 B-tree (type 5) keyed by the lookup3 hash of the name
//! ```

use crate::btree::v1::name_comparator;
use crate::btree::{BTreeV1, BTreeV2, Record, ScratchPad, SymbolTableEntry, SymbolTableNode};
use crate::checksum::lookup3;
use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::heap::{FractalHeap, LocalHeap};
use crate::io::{is_defined, FieldCursor};
use crate::object::messages::{LinkInfoMessage, LinkMessage, SymbolTableMessage};
use crate::object::ObjectHeader;
use bytes::Bytes;
use log::debug;
use std::cmp::Ordering;
use std::sync::Arc;

/// Where a group stores its links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStorage {
    /// Old-style group.
    SymbolTable(SymbolTableMessage),
    /// Link messages in the object header.
    Compact,
    /// Fractal heap and name index.
    Dense(LinkInfoMessage),
}

/// An open group.
#[derive(Debug, Clone)]
pub struct Group {
    ctx: Context,
    header: Arc<ObjectHeader>,
    storage: LinkStorage,
}

impl Group {
    /// Opens the group whose object header is at `address`.
    pub fn open(ctx: &Context, address: u64) -> Result<Self> {
        Self::from_header(ctx, ObjectHeader::read(ctx, address)?)
    }

    /// Wraps an already decoded header; fails if it is not a group.
    pub fn from_header(ctx: &Context, header: Arc<ObjectHeader>) -> Result<Self> {
        let storage = if let Some(table) = header.get_message::<SymbolTableMessage>() {
            LinkStorage::SymbolTable(*table)
        } else if let Some(info) = header
            .get_message::<LinkInfoMessage>()
            .filter(|info| is_defined(info.fractal_heap_address))
        {
            LinkStorage::Dense(info.clone())
        } else if header.get_message::<LinkInfoMessage>().is_some()
            || header.get_message::<LinkMessage>().is_some()
        {
            LinkStorage::Compact
        } else {
            return Err(Error::invalid_argument(format!(
                "object at {:#x} is not a group",
                header.address
            )));
        };
        debug!("Group at {:#x}: {:?} link storage", header.address, storage);
        Ok(Self { ctx: ctx.clone(), header, storage })
    }

    /// Object header address.
    pub fn address(&self) -> u64 {
        self.header.address
    }

    /// The group's object header.
    pub fn header(&self) -> &Arc<ObjectHeader> {
        &self.header
    }

    /// How links are stored.
    pub fn storage(&self) -> &LinkStorage {
        &self.storage
    }

    /// All links, ordered by name.
    pub fn links(&self) -> Result<Vec<LinkMessage>> {
        let mut links = match &self.storage {
            LinkStorage::SymbolTable(table) => self.symbol_table_links(table)?,
            LinkStorage::Compact => self.header.get_messages::<LinkMessage>().cloned().collect(),
            LinkStorage::Dense(info) => self.dense_links(info)?,
        };
        links.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(links)
    }

    /// The link called `name`, if any.
    pub fn link(&self, name: &str) -> Result<Option<LinkMessage>> {
        if name.is_empty() {
            return Ok(None);
        }
        match &self.storage {
            LinkStorage::SymbolTable(table) => self.symbol_table_link(table, name),
            LinkStorage::Compact => {
                let mut compact = self.header.get_messages::<LinkMessage>();
                Ok(compact.find(|link| link.name == name).cloned())
            }
            LinkStorage::Dense(info) => self.dense_link(info, name),
        }
    }

    fn symbol_table_links(&self, table: &SymbolTableMessage) -> Result<Vec<LinkMessage>> {
        let heap = LocalHeap::read(&self.ctx, table.heap_address)?;
        let tree = BTreeV1::open_group(&self.ctx, table.btree_address);
        let mut links = Vec::new();
        for entry in tree.entries() {
            let node = SymbolTableNode::read(&self.ctx, entry?.child)?;
            for entry in &node.entries {
                links.push(symbol_link(&heap, entry)?);
            }
        }
        Ok(links)
    }

    fn symbol_table_link(
        &self,
        table: &SymbolTableMessage,
        name: &str,
    ) -> Result<Option<LinkMessage>> {
        let heap = LocalHeap::read(&self.ctx, table.heap_address)?;
        let tree = BTreeV1::open_group(&self.ctx, table.btree_address);
        // child i holds the names in (key i, key i+1]
        let Some(leaf) = tree.find(name_comparator(&heap, name))? else {
            return Ok(None);
        };
        let node = SymbolTableNode::read(&self.ctx, leaf.child)?;
        for entry in &node.entries {
            if heap.get_name(entry.name_offset)? == name {
                return symbol_link(&heap, entry).map(Some);
            }
        }
        Ok(None)
    }

    fn dense_index(&self, info: &LinkInfoMessage) -> Result<(FractalHeap, BTreeV2)> {
        if !is_defined(info.name_index_address) {
            return Err(Error::format(
                Structure::ObjectHeader,
                self.header.address,
                "dense link storage without a name index",
            ));
        }
        let heap = FractalHeap::open(&self.ctx, info.fractal_heap_address)?;
        let tree = BTreeV2::open(&self.ctx, info.name_index_address)?;
        Ok((heap, tree))
    }

    fn dense_links(&self, info: &LinkInfoMessage) -> Result<Vec<LinkMessage>> {
        let (heap, tree) = self.dense_index(info)?;
        let mut links = Vec::new();
        for record in tree.iter() {
            if let Record::LinkName { heap_id, .. } = record? {
                links.push(self.decode_link(&heap, info, &heap_id)?);
            }
        }
        Ok(links)
    }

    fn dense_link(&self, info: &LinkInfoMessage, name: &str) -> Result<Option<LinkMessage>> {
        let (heap, tree) = self.dense_index(info)?;
        let hash = lookup3(name.as_bytes(), 0);
        let mut failure = None;
        let mut matched = None;
        // equal hashes are ordered by name
        let found = tree.find(|record| match record {
            Record::LinkName { hash: stored, heap_id } => match hash.cmp(stored) {
                Ordering::Equal => match self.decode_link(&heap, info, heap_id) {
                    Ok(link) => {
                        let order = name.cmp(link.name.as_str());
                        if order == Ordering::Equal {
                            matched = Some(link);
                        }
                        order
                    }
                    Err(e) => {
                        failure.get_or_insert(e);
                        Ordering::Equal
                    }
                },
                other => other,
            },
            _ => Ordering::Less,
        })?;
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(found.and(matched))
    }

    fn decode_link(
        &self,
        heap: &FractalHeap,
        info: &LinkInfoMessage,
        heap_id: &[u8],
    ) -> Result<LinkMessage> {
        let bytes: Bytes = heap.resolve(heap_id)?;
        let mut c = FieldCursor::new(
            bytes,
            self.ctx.sizes(),
            Structure::HeaderMessage,
            info.fractal_heap_address,
        );
        LinkMessage::decode(&mut c)
    }
}

fn symbol_link(heap: &LocalHeap, entry: &SymbolTableEntry) -> Result<LinkMessage> {
    let name = heap.get_name(entry.name_offset)?;
    match entry.scratch {
        ScratchPad::SoftLink { value_offset } => {
            Ok(LinkMessage::soft(name, heap.get_name(value_offset as u64)?))
        }
        _ => Ok(LinkMessage::hard(name, entry.object_header)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{BTreeV1Builder, BTreeV2Builder, Key, KeyLayout, RecordLayout};
    use crate::heap::{FractalHeapBuilder, LocalHeapBuilder};
    use crate::io::{FileImage, Sizes, UNDEFINED_ADDRESS};
    use crate::object::messages::{LinkTarget, Message};
    use crate::object::ObjectHeaderBuilder;

    fn names(links: &[LinkMessage]) -> Vec<&str> {
        links.iter().map(|l| l.name.as_str()).collect()
    }

    // Two symbol table nodes: [alpha, beta, gamma] and [delta2, omega, zeta].
    fn symbol_table_group(image: &mut FileImage) -> u64 {
        let sizes = image.sizes();
        let mut heap = LocalHeapBuilder::new();
        let first = ["alpha", "beta", "gamma"];
        let second = ["omega", "soft", "zeta"];
        let mut nodes = Vec::new();
        let mut last_offsets = Vec::new();
        for (i, group) in [first, second].iter().enumerate() {
            let mut entries = Vec::new();
            for (j, name) in group.iter().enumerate() {
                let offset = heap.add(name);
                let mut entry = SymbolTableEntry::new(offset, 0x1000 + (i * 3 + j) as u64 * 0x10);
                if *name == "soft" {
                    let value = heap.add("/alpha");
                    entry.object_header = UNDEFINED_ADDRESS;
                    entry.scratch = ScratchPad::SoftLink { value_offset: value as u32 };
                }
                entries.push(entry);
                if j == group.len() - 1 {
                    last_offsets.push(offset);
                }
            }
            nodes.push(image.append(&SymbolTableNode { entries }.encode(sizes, 8)));
        }
        let heap_address = heap.write(image);
        let btree_address = BTreeV1Builder::new(KeyLayout::group(), 2)
            .write(
                image,
                &[(Key::Group(0), nodes[0]), (Key::Group(last_offsets[0]), nodes[1])],
                Key::Group(last_offsets[1]),
            )
            .unwrap();
        ObjectHeaderBuilder::new(1)
            .message(Message::SymbolTable(SymbolTableMessage { btree_address, heap_address }))
            .write(image)
            .unwrap()
    }

    fn dense_group(image: &mut FileImage, count: usize) -> u64 {
        let sizes = image.sizes();
        let links: Vec<LinkMessage> = (0..count)
            .map(|i| LinkMessage::hard(format!("member{:03}", i), 0x8000 + i as u64 * 8))
            .collect();
        let mut heap = FractalHeapBuilder::new().heap_id_len(7);
        for link in &links {
            heap.insert(&Message::Link(link.clone()).encode(sizes));
        }
        let (heap_address, ids) = heap.write(image).unwrap();
        let mut records: Vec<Record> = links
            .iter()
            .zip(&ids)
            .map(|(link, id)| {
                let mut heap_id = [0u8; 7];
                heap_id.copy_from_slice(&id[..7]);
                Record::LinkName { hash: lookup3(link.name.as_bytes(), 0), heap_id }
            })
            .collect();
        records.sort_by_key(|r| match r {
            Record::LinkName { hash, .. } => *hash,
            _ => 0,
        });
        let name_index_address = BTreeV2Builder::new(RecordLayout::new(5, sizes))
            .node_size(128)
            .write(image, &records)
            .unwrap();
        let info = LinkInfoMessage {
            max_creation_index: None,
            fractal_heap_address: heap_address,
            name_index_address,
            creation_order_index_address: None,
        };
        ObjectHeaderBuilder::new(2).message(Message::LinkInfo(info)).write(image).unwrap()
    }

    fn context(image: FileImage) -> Context {
        let sizes = image.sizes();
        Context::new(Arc::new(image.into_source()), sizes)
    }

    #[test]
    fn test_symbol_table_group() {
        let mut image = FileImage::with_reserved(Sizes::new(4, 4), 64);
        let address = symbol_table_group(&mut image);
        let group = Group::open(&context(image), address).unwrap();
        assert!(matches!(group.storage(), LinkStorage::SymbolTable(_)));

        let links = group.links().unwrap();
        assert_eq!(names(&links), vec!["alpha", "beta", "gamma", "omega", "soft", "zeta"]);
        assert_eq!(group.link("gamma").unwrap().unwrap().target, LinkTarget::Hard(0x1020));
        assert_eq!(group.link("zeta").unwrap().unwrap().target, LinkTarget::Hard(0x1050));
        assert_eq!(group.link("soft").unwrap().unwrap().target, LinkTarget::Soft("/alpha".into()));
        assert_eq!(group.link("delta").unwrap(), None);
        assert_eq!(group.link("zz").unwrap(), None);
        assert_eq!(group.link("").unwrap(), None);
    }

    #[test]
    fn test_compact_group() {
        let mut image = FileImage::with_reserved(Sizes::default(), 64);
        let info = LinkInfoMessage {
            max_creation_index: None,
            fractal_heap_address: UNDEFINED_ADDRESS,
            name_index_address: UNDEFINED_ADDRESS,
            creation_order_index_address: None,
        };
        let address = ObjectHeaderBuilder::new(2)
            .message(Message::LinkInfo(info))
            .message(Message::Link(LinkMessage::soft("b", "/a")))
            .message(Message::Link(LinkMessage::hard("a", 0x400)))
            .write(&mut image)
            .unwrap();
        let group = Group::open(&context(image), address).unwrap();
        assert_eq!(group.storage(), &LinkStorage::Compact);
        assert_eq!(names(&group.links().unwrap()), vec!["a", "b"]);
        assert_eq!(group.link("a").unwrap().unwrap().target, LinkTarget::Hard(0x400));
        assert_eq!(group.link("c").unwrap(), None);
    }

    #[test]
    fn test_dense_group() {
        let mut image = FileImage::with_reserved(Sizes::default(), 64);
        let address = dense_group(&mut image, 40);
        let group = Group::open(&context(image), address).unwrap();
        assert!(matches!(group.storage(), LinkStorage::Dense(_)));

        let links = group.links().unwrap();
        assert_eq!(links.len(), 40);
        assert_eq!(links[0].name, "member000");
        for i in [0usize, 17, 39] {
            let link = group.link(&format!("member{:03}", i)).unwrap().unwrap();
            assert_eq!(link.target, LinkTarget::Hard(0x8000 + i as u64 * 8));
        }
        assert_eq!(group.link("member040").unwrap(), None);
    }

    #[test]
    fn test_not_a_group() {
        let mut image = FileImage::with_reserved(Sizes::default(), 64);
        let address = ObjectHeaderBuilder::new(2)
            .message(Message::Comment(crate::object::messages::CommentMessage { text: "x".into() }))
            .write(&mut image)
            .unwrap();
        let err = Group::open(&context(image), address).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
