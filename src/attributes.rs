//! Attribute enumeration and lookup.
//!
//! Attributes live either as Attribute messages in the object header
//! (compact) or, once an object has many, in a fractal heap indexed by a
//! v2 B-tree of type 8 records keyed by the lookup3 hash of the name
//! (dense). A dense record flagged shared holds a shared message heap id
//! instead of an id into the object's own heap.

use crate::btree::{BTreeV2, Record};
use crate::checksum::lookup3;
use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::heap::FractalHeap;
use crate::io::{is_defined, FieldCursor};
use crate::object::messages::{AttributeInfoMessage, AttributeMessage};
use crate::object::{
    ContextResolver, Message, MessageFlags, MessageType, ObjectHeader, SharedLocator,
    SharedResolver,
};
use std::cmp::Ordering;
use std::sync::Arc;

/// The attributes of one object.
#[derive(Debug, Clone)]
pub struct Attributes {
    ctx: Context,
    header: Arc<ObjectHeader>,
}

impl Attributes {
    /// Attributes of the object whose header is `header`.
    pub fn new(ctx: &Context, header: Arc<ObjectHeader>) -> Self {
        Self { ctx: ctx.clone(), header }
    }

    /// Attributes of the object at `address`.
    pub fn open(ctx: &Context, address: u64) -> Result<Self> {
        Ok(Self::new(ctx, ObjectHeader::read(ctx, address)?))
    }

    fn dense_info(&self) -> Option<&AttributeInfoMessage> {
        self.header
            .get_message::<AttributeInfoMessage>()
            .filter(|info| is_defined(info.fractal_heap_address))
    }

    /// Whether attributes are kept in dense storage.
    pub fn is_dense(&self) -> bool {
        self.dense_info().is_some()
    }

    /// Every attribute: compact ones in stored order, then dense ones in
    /// name index order.
    pub fn all(&self) -> Result<Vec<AttributeMessage>> {
        let mut attributes: Vec<AttributeMessage> =
            self.header.get_messages::<AttributeMessage>().cloned().collect();
        if let Some(info) = self.dense_info() {
            let (heap, tree) = self.dense_index(info)?;
            for record in tree.iter() {
                if let Record::AttributeName { heap_id, flags, .. } = record? {
                    attributes.push(self.decode(&heap, info, &heap_id, flags)?);
                }
            }
        }
        Ok(attributes)
    }

    /// Attribute names, in the order of [`Attributes::all`].
    pub fn names(&self) -> Result<Vec<String>> {
        Ok(self.all()?.into_iter().map(|a| a.name).collect())
    }

    /// The attribute called `name`, if any.
    pub fn get(&self, name: &str) -> Result<Option<AttributeMessage>> {
        let mut compact = self.header.get_messages::<AttributeMessage>();
        if let Some(found) = compact.find(|a| a.name == name) {
            return Ok(Some(found.clone()));
        }
        let Some(info) = self.dense_info() else {
            return Ok(None);
        };
        let (heap, tree) = self.dense_index(info)?;
        let hash = lookup3(name.as_bytes(), 0);
        let mut failure = None;
        let mut matched = None;
        let found = tree.find(|record| match record {
            Record::AttributeName { heap_id, flags, hash: stored, .. } => match hash.cmp(stored) {
                Ordering::Equal => match self.decode(&heap, info, heap_id, *flags) {
                    Ok(attribute) => {
                        let order = name.cmp(attribute.name.as_str());
                        if order == Ordering::Equal {
                            matched = Some(attribute);
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

    fn dense_index(&self, info: &AttributeInfoMessage) -> Result<(FractalHeap, BTreeV2)> {
        if !is_defined(info.name_index_address) {
            return Err(Error::format(
                Structure::ObjectHeader,
                self.header.address,
                "dense attribute storage without a name index",
            ));
        }
        Ok((
            FractalHeap::open(&self.ctx, info.fractal_heap_address)?,
            BTreeV2::open(&self.ctx, info.name_index_address)?,
        ))
    }

    fn decode(
        &self,
        heap: &FractalHeap,
        info: &AttributeInfoMessage,
        heap_id: &[u8; 8],
        flags: u8,
    ) -> Result<AttributeMessage> {
        let mut resolver = ContextResolver::new(&self.ctx);
        let message = if MessageFlags(flags).is_shared() {
            let locator = SharedLocator::Heap { heap_id: *heap_id };
            resolver.resolve(&locator, MessageType::Attribute)?
        } else {
            let bytes = heap.resolve(heap_id)?;
            let mut c = FieldCursor::new(
                bytes,
                self.ctx.sizes(),
                Structure::HeaderMessage,
                info.fractal_heap_address,
            );
            Message::decode(MessageType::Attribute, &mut c, &mut resolver)?
        };
        match message {
            Message::Attribute(attribute) => Ok(attribute),
            other => Err(Error::format(
                Structure::HeaderMessage,
                info.fractal_heap_address,
                format!("dense attribute decoded as {}", other.message_type()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{BTreeV2Builder, RecordLayout};
    use crate::heap::FractalHeapBuilder;
    use crate::io::{FileImage, Sizes};
    use crate::object::messages::{DataspaceMessage, DatatypeMessage};
    use crate::object::ObjectHeaderBuilder;
    use bytes::Bytes;

    fn attribute(name: &str, value: u32) -> AttributeMessage {
        AttributeMessage::new(
            name,
            DatatypeMessage::integer(4, false),
            DataspaceMessage::scalar(),
            Bytes::copy_from_slice(&value.to_le_bytes()),
        )
    }

    fn context(image: FileImage) -> Context {
        let sizes = image.sizes();
        Context::new(Arc::new(image.into_source()), sizes)
    }

    #[test]
    fn test_compact_attributes() {
        let mut image = FileImage::with_reserved(Sizes::default(), 64);
        let address = ObjectHeaderBuilder::new(2)
            .message(Message::Attribute(attribute("units", 1)))
            .message(Message::Attribute(attribute("scale", 2)))
            .write(&mut image)
            .unwrap();
        let attributes = Attributes::open(&context(image), address).unwrap();
        assert!(!attributes.is_dense());
        assert_eq!(attributes.names().unwrap(), vec!["units", "scale"]);
        assert_eq!(&attributes.get("scale").unwrap().unwrap().data[..], &2u32.to_le_bytes());
        assert_eq!(attributes.get("offset").unwrap(), None);
    }

    #[test]
    fn test_dense_attributes() {
        let sizes = Sizes::new(4, 8);
        let mut image = FileImage::with_reserved(sizes, 64);
        let stored: Vec<AttributeMessage> =
            (0..25).map(|i| attribute(&format!("attr{}", i), i)).collect();
        let mut heap = FractalHeapBuilder::new();
        for a in &stored {
            heap.insert(&Message::Attribute(a.clone()).encode(sizes));
        }
        let (heap_address, ids) = heap.write(&mut image).unwrap();
        let mut records: Vec<Record> = stored
            .iter()
            .zip(&ids)
            .enumerate()
            .map(|(i, (a, id))| {
                let mut heap_id = [0u8; 8];
                heap_id.copy_from_slice(&id[..8]);
                Record::AttributeName {
                    heap_id,
                    flags: 0,
                    creation_order: i as u32,
                    hash: lookup3(a.name.as_bytes(), 0),
                }
            })
            .collect();
        records.sort_by_key(|r| match r {
            Record::AttributeName { hash, .. } => *hash,
            _ => 0,
        });
        let name_index_address = BTreeV2Builder::new(RecordLayout::new(8, sizes))
            .node_size(96)
            .write(&mut image, &records)
            .unwrap();
        let info = AttributeInfoMessage {
            max_creation_index: None,
            fractal_heap_address: heap_address,
            name_index_address,
            creation_order_index_address: None,
        };
        let address = ObjectHeaderBuilder::new(2)
            .message(Message::AttributeInfo(info))
            .write(&mut image)
            .unwrap();

        let attributes = Attributes::open(&context(image), address).unwrap();
        assert!(attributes.is_dense());
        assert_eq!(attributes.all().unwrap().len(), 25);
        for i in [0u32, 12, 24] {
            let found = attributes.get(&format!("attr{}", i)).unwrap().unwrap();
            assert_eq!(found, stored[i as usize]);
        }
        assert_eq!(attributes.get("attr25").unwrap(), None);
    }
}
