//! Shared message locators and their resolution.
//!
//! A message stored with the shared flag carries a locator instead of its
//! payload:
//!
//! ```text
//! v1: [1][type, ignored][reserved:6][heap address, unused: L][object header address: O]
//! v2: [2][type, ignored][object header address: O]
//! v3: [3][type][heap id: 8 bytes   if type = 1, shared message heap]
//!              [address: O         if type = 2, another object header]
//! ```

use super::messages::{Message, MessageType};
use super::{ObjectHeader, SharedMessageTable};
use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::io::{FieldCursor, FieldWriter, Sizes};
use bytes::Bytes;

/// Locator type code for messages in the shared message heap.
pub const LOCATOR_HEAP: u8 = 1;
/// Locator type code for messages stored in another object header.
pub const LOCATOR_OBJECT_HEADER: u8 = 2;

/// Where a shared message is actually stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedLocator {
    /// In the header of another (or the same) object.
    ObjectHeader {
        /// Locator encoding version.
        version: u8,
        /// Address of the header holding the message.
        address: u64,
    },
    /// In the fractal heap of a shared object header message index.
    Heap {
        /// Fractal heap id of the stored message.
        heap_id: [u8; 8],
    },
}

impl SharedLocator {
    /// Decodes a locator from a message payload.
    pub fn decode(c: &mut FieldCursor) -> Result<Self> {
        let version = c.expect_version(&[1, 2, 3])?;
        let kind = c.read_u8()?;
        match version {
            1 => {
                c.skip(6 + c.sizes().length_size())?;
                Ok(SharedLocator::ObjectHeader { version, address: c.read_offset()? })
            }
            2 => Ok(SharedLocator::ObjectHeader { version, address: c.read_offset()? }),
            _ => match kind {
                LOCATOR_HEAP => {
                    let mut heap_id = [0u8; 8];
                    heap_id.copy_from_slice(&c.read_bytes(8)?);
                    Ok(SharedLocator::Heap { heap_id })
                }
                LOCATOR_OBJECT_HEADER => {
                    Ok(SharedLocator::ObjectHeader { version, address: c.read_offset()? })
                }
                other => Err(c.format_error(format!("shared message location type {}", other))),
            },
        }
    }

    /// Encodes the locator as a message payload.
    pub fn encode(&self, sizes: Sizes) -> Bytes {
        let mut w = FieldWriter::new(sizes);
        match self {
            SharedLocator::ObjectHeader { version, address } => {
                let version = (*version).clamp(1, 3);
                w.put_u8(version);
                w.put_u8(if version == 3 { LOCATOR_OBJECT_HEADER } else { 0 });
                if version == 1 {
                    w.put_zeros(6 + sizes.length_size());
                }
                w.put_offset(*address);
            }
            SharedLocator::Heap { heap_id } => {
                w.put_u8(3);
                w.put_u8(LOCATOR_HEAP);
                w.put_slice(heap_id);
            }
        }
        w.finish()
    }
}

/// Turns a shared message locator into the message it points at.
///
/// Header decoding supplies a resolver that knows which header is being
/// decoded, so self-references and reference cycles can be detected.
pub trait SharedResolver {
    /// Resolves `locator` to a message that must be of type `kind`.
    fn resolve(&mut self, locator: &SharedLocator, kind: MessageType) -> Result<Message>;
}

/// A resolver for contexts where shared messages cannot occur.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSharedMessages;

impl SharedResolver for NoSharedMessages {
    fn resolve(&mut self, _locator: &SharedLocator, kind: MessageType) -> Result<Message> {
        Err(Error::unsupported(
            Structure::SharedMessage,
            0,
            format!("shared {} message outside an object header", kind),
        ))
    }
}

/// Resolves shared messages met outside any object header, such as in
/// attributes stored in a fractal heap.
#[derive(Debug)]
pub struct ContextResolver<'a> {
    ctx: &'a Context,
    depth: usize,
}

impl<'a> ContextResolver<'a> {
    /// A resolver reading through `ctx`.
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx, depth: 0 }
    }
}

impl SharedResolver for ContextResolver<'_> {
    fn resolve(&mut self, locator: &SharedLocator, kind: MessageType) -> Result<Message> {
        let max_depth = self.ctx.options().max_shared_depth;
        if self.depth >= max_depth {
            return Err(Error::format(
                Structure::SharedMessage,
                0,
                format!("shared messages nested deeper than {}", max_depth),
            ));
        }
        let message = match *locator {
            SharedLocator::ObjectHeader { address, .. } => {
                let header = ObjectHeader::read(self.ctx, address)?;
                let found = header.find(kind).ok_or_else(|| {
                    Error::format(
                        Structure::SharedMessage,
                        address,
                        format!("header holds no {} message", kind),
                    )
                })?;
                found.message.clone()
            }
            SharedLocator::Heap { heap_id } => {
                let table_message = self.ctx.shared_message_table().ok_or_else(|| {
                    Error::format(
                        Structure::SharedMessage,
                        0,
                        "shared message heap used without a shared message table",
                    )
                })?;
                let table = SharedMessageTable::read(self.ctx, table_message)?;
                let bytes = table.message_bytes(self.ctx, kind, &heap_id)?;
                let mut c = FieldCursor::new(
                    bytes,
                    self.ctx.sizes(),
                    Structure::SharedMessage,
                    table.address,
                );
                self.depth += 1;
                let message = Message::decode(kind, &mut c, self);
                self.depth -= 1;
                message?
            }
        };
        if message.message_type() != kind {
            return Err(Error::format(
                Structure::SharedMessage,
                0,
                format!("expected a shared {} message, found {}", kind, message.message_type()),
            ));
        }
        Ok(message)
    }
}
