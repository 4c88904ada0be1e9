//! Shared object header message table.
//!
//! ```text
//! table: ["SMTB"] per index:
//!          [version=0][index type][reserved][message type flags: u16]
//!          [min message size: u32][list cutoff: u16][B-tree cutoff: u16]
//!          [message count: u16][index address: O][fractal heap address: O]
//!        [checksum]
//! list:  ["SMLI"][records x message count][checksum]
//! ```
//!
//! Messages shared through the table live in the fractal heap of the index
//! that covers their type; header locators carry the heap id directly, so
//! reading never needs the list or B-tree index. The indices are exposed for
//! enumeration.

use super::messages::{MessageType, SharedMessageTableMessage};
use crate::btree::{BTreeV2, Record, SharedMessageRecord};
use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::heap::FractalHeap;
use crate::io::{FieldWriter, Sizes};
use bytes::Bytes;
use std::sync::Arc;

pub(crate) const TABLE_SIGNATURE: &[u8; 4] = b"SMTB";
pub(crate) const LIST_SIGNATURE: &[u8; 4] = b"SMLI";

/// How an index stores its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// A `SMLI` list.
    List,
    /// A version 2 B-tree of type 7 records.
    BTree,
}

/// One index of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedMessageIndex {
    /// Storage of the index records.
    pub kind: IndexKind,
    /// Bit `n` set when messages of type code `n` are shared here.
    pub message_types: u16,
    /// Smallest message shared through this index.
    pub min_message_size: u32,
    /// Largest list before conversion to a B-tree.
    pub list_cutoff: u16,
    /// Smallest B-tree before conversion to a list.
    pub btree_cutoff: u16,
    /// Messages in the index.
    pub message_count: u16,
    /// List or B-tree address.
    pub index_address: u64,
    /// Fractal heap holding the messages.
    pub heap_address: u64,
}

impl SharedMessageIndex {
    /// Returns true if messages of `kind` are shared through this index.
    pub fn covers(&self, kind: MessageType) -> bool {
        let code = kind.code();
        code < 16 && self.message_types & (1 << code) != 0
    }

    fn encoded_size(sizes: Sizes) -> usize {
        1 + 1 + 1 + 2 + 4 + 2 + 2 + 2 + 2 * sizes.offset_size()
    }
}

/// A decoded shared message table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMessageTable {
    /// Table address.
    pub address: u64,
    /// Indices in table order.
    pub indices: Vec<SharedMessageIndex>,
}

impl SharedMessageTable {
    /// Reads (or fetches from cache) the table described by `message`.
    pub fn read(ctx: &Context, message: &SharedMessageTableMessage) -> Result<Arc<Self>> {
        let address = message.table_address;
        let count = message.index_count as usize;
        ctx.cached(address, Structure::SharedMessageTable, || {
            let sizes = ctx.sizes();
            let len = 4 + count * SharedMessageIndex::encoded_size(sizes) + 4;
            let mut c = ctx.read_checked(address, len, Structure::SharedMessageTable)?;
            c.expect_signature(TABLE_SIGNATURE)?;
            let mut indices = Vec::with_capacity(count);
            for _ in 0..count {
                c.expect_version(&[0])?;
                let kind = match c.read_u8()? {
                    0 => IndexKind::List,
                    1 => IndexKind::BTree,
                    other => return Err(c.format_error(format!("index type {}", other))),
                };
                c.skip(1)?;
                indices.push(SharedMessageIndex {
                    kind,
                    message_types: c.read_u16()?,
                    min_message_size: c.read_u32()?,
                    list_cutoff: c.read_u16()?,
                    btree_cutoff: c.read_u16()?,
                    message_count: c.read_u16()?,
                    index_address: c.read_offset()?,
                    heap_address: c.read_offset()?,
                });
            }
            log::debug!("Shared message table at {:#x}: {} indices", address, count);
            Ok(Self { address, indices })
        })
    }

    /// Encodes the table.
    pub fn encode(&self, sizes: Sizes) -> Bytes {
        let mut w = FieldWriter::new(sizes);
        w.put_slice(TABLE_SIGNATURE);
        for index in &self.indices {
            w.put_u8(0);
            w.put_u8(match index.kind {
                IndexKind::List => 0,
                IndexKind::BTree => 1,
            });
            w.put_u8(0);
            w.put_u16(index.message_types);
            w.put_u32(index.min_message_size);
            w.put_u16(index.list_cutoff);
            w.put_u16(index.btree_cutoff);
            w.put_u16(index.message_count);
            w.put_offset(index.index_address);
            w.put_offset(index.heap_address);
        }
        w.put_checksum();
        w.finish()
    }

    /// The index sharing messages of `kind`.
    pub fn index_for(&self, kind: MessageType) -> Option<&SharedMessageIndex> {
        self.indices.iter().find(|index| index.covers(kind))
    }

    /// Raw payload of a heap-stored shared message of `kind`.
    pub fn message_bytes(&self, ctx: &Context, kind: MessageType, heap_id: &[u8]) -> Result<Bytes> {
        let index = self.index_for(kind).ok_or_else(|| {
            Error::format(
                Structure::SharedMessageTable,
                self.address,
                format!("no index shares {} messages", kind),
            )
        })?;
        FractalHeap::open(ctx, index.heap_address)?.resolve(heap_id)
    }

    /// All records of `index`.
    pub fn records(
        &self,
        ctx: &Context,
        index: &SharedMessageIndex,
    ) -> Result<Vec<SharedMessageRecord>> {
        match index.kind {
            IndexKind::List => {
                let sizes = ctx.sizes();
                let count = index.message_count as usize;
                let len = 4 + count * SharedMessageRecord::encoded_size(sizes) + 4;
                let mut c =
                    ctx.read_checked(index.index_address, len, Structure::SharedMessageTable)?;
                c.expect_signature(LIST_SIGNATURE)?;
                (0..count).map(|_| SharedMessageRecord::decode(&mut c)).collect()
            }
            IndexKind::BTree => BTreeV2::open(ctx, index.index_address)?
                .iter()
                .map(|record| match record? {
                    Record::SharedMessage(record) => Ok(record),
                    other => Err(Error::format(
                        Structure::SharedMessageTable,
                        index.index_address,
                        format!("unexpected record {:?} in shared message index", other),
                    )),
                })
                .collect(),
        }
    }
}

/// Encodes a `SMLI` list of `records`.
pub fn encode_list(records: &[SharedMessageRecord], sizes: Sizes) -> Bytes {
    let mut w = FieldWriter::new(sizes);
    w.put_slice(LIST_SIGNATURE);
    for record in records {
        record.encode(&mut w);
    }
    w.put_checksum();
    w.finish()
}
