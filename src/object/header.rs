//! Object header decoding.
//!
//! ```text
//! v1 prefix:  [version=1][reserved][message count: u16][reference count: u32]
//!             [chunk 0 size: u32][reserved: 4]
//! v1 message: [type: u16][size: u16][flags][reserved: 3][payload, 8-aligned]
//!
//! v2 prefix:  ["OHDR"][version=2][flags][access/modify/change/birth: 4 x u32, flag 0x20]
//!             [max compact: u16][min dense: u16, flag 0x10][chunk 0 size: 1/2/4/8 bytes]
//!             [messages][gap][checksum]
//! v2 message: [type: u8][size: u16][flags][creation order: u16, flag 0x04][payload]
//!
//! continuation v1: [messages]
//! continuation v2: ["OCHK"][messages][gap][checksum]
//! ```
//!
//! Decoding runs in two passes. The first walks chunk 0 and every
//! continuation chunk in discovery order and collects raw message records.
//! The second decodes payloads, resolving shared messages through the
//! header being decoded (self references), through other headers (cached,
//! guarded against cycles), or through the shared message heap.

use super::messages::{ContinuationMessage, Message, MessageFlags, MessageKind, MessageType};
use super::shared::{SharedLocator, SharedResolver};
use super::sohm::SharedMessageTable;
use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::io::FieldCursor;
use bytes::Bytes;
use log::{debug, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

pub(crate) const HEADER_SIGNATURE: &[u8; 4] = b"OHDR";
pub(crate) const CONTINUATION_SIGNATURE: &[u8; 4] = b"OCHK";

/// Size of the version 1 prefix including its alignment padding.
pub(crate) const V1_PREFIX_SIZE: usize = 16;

/// Chunk 0 size width mask of the version 2 flags.
pub const FLAG_CHUNK0_SIZE_MASK: u8 = 0x03;
/// Attribute creation order is tracked; messages carry a creation order.
pub const FLAG_ATTRIBUTE_CREATION_ORDER_TRACKED: u8 = 0x04;
/// Attribute creation order is indexed.
pub const FLAG_ATTRIBUTE_CREATION_ORDER_INDEXED: u8 = 0x08;
/// Non-default attribute phase change values are stored.
pub const FLAG_ATTRIBUTE_PHASE_CHANGE: u8 = 0x10;
/// Access, modification, change and birth times are stored.
pub const FLAG_TIMES: u8 = 0x20;

/// Object timestamps of a version 2 header, in seconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectTimes {
    /// Last access.
    pub access: u32,
    /// Last modification of the data.
    pub modification: u32,
    /// Last change of the metadata.
    pub change: u32,
    /// Creation.
    pub birth: u32,
}

/// Thresholds between compact and dense attribute storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributePhaseChange {
    /// Most attributes kept in the header.
    pub max_compact: u16,
    /// Fewest attributes kept in dense storage.
    pub min_dense: u16,
}

/// One stored chunk of an object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderChunk {
    /// Address of the chunk (the header address for chunk 0).
    pub address: u64,
    /// Stored length, prefix and checksum included.
    pub length: u64,
}

/// A decoded message with its header-level metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderMessage {
    /// The payload, resolved if it was shared.
    pub message: Message,
    /// Stored flags.
    pub flags: MessageFlags,
    /// Creation order, when the header tracks it.
    pub creation_order: Option<u16>,
    /// Locator the payload was resolved through, if shared.
    pub shared: Option<SharedLocator>,
}

impl HeaderMessage {
    /// The type of the message.
    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }
}

/// What an object header describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// A group.
    Group,
    /// A dataset.
    Dataset,
    /// A committed (named) datatype.
    CommittedDatatype,
    /// None of the above.
    Unknown,
}

/// A decoded object header.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectHeader {
    /// Header address.
    pub address: u64,
    /// Header version (1 or 2).
    pub version: u8,
    /// Version 2 flags; zero for version 1.
    pub flags: u8,
    /// Hard link count stored in a version 1 prefix.
    pub reference_count: u32,
    /// Timestamps, if stored.
    pub times: Option<ObjectTimes>,
    /// Attribute phase change values, if stored.
    pub attribute_phase_change: Option<AttributePhaseChange>,
    /// Chunks in the order they were read.
    pub chunks: Vec<HeaderChunk>,
    messages: Vec<HeaderMessage>,
}

impl ObjectHeader {
    /// Reads (or fetches from cache) the object header at `address`.
    pub fn read(ctx: &Context, address: u64) -> Result<Arc<Self>> {
        Self::read_nested(ctx, address, &mut Vec::new())
    }

    /// Decodes the object header at `address` without consulting the
    /// cache for it.
    pub fn decode(ctx: &Context, address: u64) -> Result<Self> {
        Self::decode_nested(ctx, address, &mut Vec::new())
    }

    fn read_nested(ctx: &Context, address: u64, stack: &mut Vec<u64>) -> Result<Arc<Self>> {
        ctx.cached(address, Structure::ObjectHeader, || Self::decode_nested(ctx, address, stack))
    }

    fn decode_nested(ctx: &Context, address: u64, stack: &mut Vec<u64>) -> Result<Self> {
        if stack.contains(&address) {
            return Err(Error::format(
                Structure::SharedMessage,
                address,
                "shared messages form a cycle through this header",
            ));
        }
        if stack.len() > ctx.options().max_shared_depth {
            return Err(Error::format(
                Structure::SharedMessage,
                address,
                format!("shared messages nested deeper than {}", ctx.options().max_shared_depth),
            ));
        }
        let raw = RawHeader::read(ctx, address)?;
        stack.push(address);
        let header = raw.resolve(ctx, stack);
        stack.pop();
        header
    }

    /// All messages in stored order, continuation and NIL messages
    /// excluded.
    pub fn messages(&self) -> &[HeaderMessage] {
        &self.messages
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if the header holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The first message of type `T`.
    pub fn get_message<T: MessageKind>(&self) -> Option<&T> {
        self.messages.iter().find_map(|m| T::from_message(&m.message))
    }

    /// Every message of type `T`, in stored order.
    pub fn get_messages<'a, T: MessageKind + 'a>(&'a self) -> impl Iterator<Item = &'a T> + 'a {
        self.messages.iter().filter_map(|m| T::from_message(&m.message))
    }

    /// The first message of `kind`.
    pub fn find(&self, kind: MessageType) -> Option<&HeaderMessage> {
        self.messages.iter().find(|m| m.message_type() == kind)
    }

    /// Returns true if a message of `kind` is present.
    pub fn has_message(&self, kind: MessageType) -> bool {
        self.find(kind).is_some()
    }

    /// Whether the header tracks attribute creation order.
    pub fn tracks_attribute_creation_order(&self) -> bool {
        self.flags & FLAG_ATTRIBUTE_CREATION_ORDER_TRACKED != 0
    }

    /// Classifies the object by the messages it carries.
    pub fn kind(&self) -> ObjectKind {
        for m in &self.messages {
            match m.message_type() {
                MessageType::LinkInfo
                | MessageType::Link
                | MessageType::GroupInfo
                | MessageType::SymbolTable => return ObjectKind::Group,
                MessageType::DataLayout => return ObjectKind::Dataset,
                _ => {}
            }
        }
        if self.has_message(MessageType::Datatype) {
            ObjectKind::CommittedDatatype
        } else {
            ObjectKind::Unknown
        }
    }
}

/// A message record before payload decoding.
#[derive(Debug, Clone)]
struct RawMessage {
    kind: MessageType,
    flags: MessageFlags,
    creation_order: Option<u16>,
    payload: Bytes,
    address: u64,
}

impl RawMessage {
    fn cursor(&self, ctx: &Context) -> FieldCursor {
        FieldCursor::new(self.payload.clone(), ctx.sizes(), Structure::HeaderMessage, self.address)
    }
}

/// First pass result: the prefix and every raw message record.
#[derive(Debug)]
struct RawHeader {
    address: u64,
    version: u8,
    flags: u8,
    reference_count: u32,
    times: Option<ObjectTimes>,
    attribute_phase_change: Option<AttributePhaseChange>,
    chunks: Vec<HeaderChunk>,
    records: Vec<RawMessage>,
}

impl RawHeader {
    fn read(ctx: &Context, address: u64) -> Result<Self> {
        let first = ctx.read_bytes(address, 1, Structure::ObjectHeader)?;
        let (mut header, pending) = match first.first() {
            Some(1) => Self::read_v1(ctx, address)?,
            _ => Self::read_v2(ctx, address)?,
        };
        header.follow_continuations(ctx, pending)?;
        debug!(
            "Object header at {:#x}: version {}, {} messages in {} chunks",
            address,
            header.version,
            header.records.len(),
            header.chunks.len()
        );
        Ok(header)
    }

    fn empty(address: u64, version: u8, flags: u8) -> Self {
        Self {
            address,
            version,
            flags,
            reference_count: 1,
            times: None,
            attribute_phase_change: None,
            chunks: Vec::new(),
            records: Vec::new(),
        }
    }

    fn read_v1(ctx: &Context, address: u64) -> Result<(Self, VecDeque<ContinuationMessage>)> {
        let mut c = ctx.read(address, V1_PREFIX_SIZE - 4, Structure::ObjectHeader)?;
        c.expect_version(&[1])?;
        c.skip(1)?;
        let message_count = c.read_u16()?;
        let mut header = Self::empty(address, 1, 0);
        header.reference_count = c.read_u32()?;
        let chunk0_size = c.read_u32()? as usize;
        header.chunks.push(HeaderChunk {
            address,
            length: (V1_PREFIX_SIZE + chunk0_size) as u64,
        });

        let mut pending = VecDeque::new();
        if chunk0_size > 0 {
            let body_address = address + V1_PREFIX_SIZE as u64;
            let mut body = ctx.read(body_address, chunk0_size, Structure::ObjectHeader)?;
            header.parse_messages(&mut body, chunk0_size, &mut pending)?;
        }
        debug!("Version 1 header at {:#x} declares {} messages", address, message_count);
        Ok((header, pending))
    }

    fn read_v2(ctx: &Context, address: u64) -> Result<(Self, VecDeque<ContinuationMessage>)> {
        let structure = Structure::ObjectHeader;
        let mut c = ctx.read(address, 6, structure)?;
        c.expect_signature(HEADER_SIGNATURE)?;
        c.expect_version(&[2])?;
        let flags = c.read_u8()?;

        let size_width = 1usize << (flags & FLAG_CHUNK0_SIZE_MASK);
        let mut prefix_len = 6 + size_width;
        if flags & FLAG_TIMES != 0 {
            prefix_len += 16;
        }
        if flags & FLAG_ATTRIBUTE_PHASE_CHANGE != 0 {
            prefix_len += 4;
        }
        let mut c = ctx.read(address, prefix_len, structure)?;
        c.seek(6)?;

        let mut header = Self::empty(address, 2, flags);
        if flags & FLAG_TIMES != 0 {
            header.times = Some(ObjectTimes {
                access: c.read_u32()?,
                modification: c.read_u32()?,
                change: c.read_u32()?,
                birth: c.read_u32()?,
            });
        }
        if flags & FLAG_ATTRIBUTE_PHASE_CHANGE != 0 {
            header.attribute_phase_change = Some(AttributePhaseChange {
                max_compact: c.read_u16()?,
                min_dense: c.read_u16()?,
            });
        }
        let chunk0_size = usize::try_from(c.read_uint(size_width)?)
            .map_err(|_| Error::bounds(structure, address, "chunk 0 size overflows"))?;
        let end = prefix_len
            .checked_add(chunk0_size)
            .ok_or_else(|| Error::bounds(structure, address, "chunk 0 size overflows"))?;

        let mut c = ctx.read_checked(address, end + 4, structure)?;
        c.seek(prefix_len)?;
        header.chunks.push(HeaderChunk { address, length: (end + 4) as u64 });
        let mut pending = VecDeque::new();
        header.parse_messages(&mut c, end, &mut pending)?;
        Ok((header, pending))
    }

    fn follow_continuations(
        &mut self,
        ctx: &Context,
        mut pending: VecDeque<ContinuationMessage>,
    ) -> Result<()> {
        let structure = Structure::ContinuationBlock;
        let mut visited = HashSet::from([self.address]);
        while let Some(next) = pending.pop_front() {
            if !visited.insert(next.address) {
                return Err(Error::format(
                    structure,
                    next.address,
                    "continuation chain revisits a chunk",
                ));
            }
            let limit = ctx.options().max_continuation_chunks;
            if self.chunks.len() >= limit {
                return Err(Error::format(
                    structure,
                    next.address,
                    format!("header at {:#x} spans more than {} chunks", self.address, limit),
                ));
            }
            let len = usize::try_from(next.length)
                .map_err(|_| Error::bounds(structure, next.address, "chunk length overflows"))?;
            if self.version == 1 {
                let mut c = ctx.read(next.address, len, structure)?;
                self.parse_messages(&mut c, len, &mut pending)?;
            } else {
                if len < 8 {
                    return Err(Error::format(
                        structure,
                        next.address,
                        format!("continuation block of {} bytes", len),
                    ));
                }
                let mut c = ctx.read_checked(next.address, len, structure)?;
                c.expect_signature(CONTINUATION_SIGNATURE)?;
                self.parse_messages(&mut c, len - 4, &mut pending)?;
            }
            self.chunks.push(HeaderChunk { address: next.address, length: next.length });
        }
        Ok(())
    }

    /// Collects message records from the cursor position up to `end`.
    /// Fewer bytes than one record header at the end are a gap.
    fn parse_messages(
        &mut self,
        c: &mut FieldCursor,
        end: usize,
        pending: &mut VecDeque<ContinuationMessage>,
    ) -> Result<()> {
        let creation_order = self.flags & FLAG_ATTRIBUTE_CREATION_ORDER_TRACKED != 0;
        let entry_size = match (self.version, creation_order) {
            (1, _) => 8,
            (_, true) => 6,
            (_, false) => 4,
        };
        while end.saturating_sub(c.position()) >= entry_size {
            let code = if self.version == 1 { c.read_u16()? } else { c.read_u8()? as u16 };
            let size = c.read_u16()? as usize;
            let flags = MessageFlags(c.read_u8()?);
            let order = if self.version == 1 {
                c.skip(3)?;
                None
            } else if creation_order {
                Some(c.read_u16()?)
            } else {
                None
            };
            if c.position() + size > end {
                return Err(c.bounds(format!("{} byte message overruns its chunk", size)));
            }
            let address = c.address();
            let payload = c.read_bytes(size)?;
            let kind = MessageType::from_code(code);
            match kind {
                MessageType::Nil => {}
                MessageType::Continuation => {
                    let mut p =
                        FieldCursor::new(payload, c.sizes(), Structure::HeaderMessage, address);
                    pending.push_back(ContinuationMessage::decode(&mut p)?);
                }
                _ => self.records.push(RawMessage {
                    kind,
                    flags,
                    creation_order: order,
                    payload,
                    address,
                }),
            }
        }
        Ok(())
    }

    fn resolve(self, ctx: &Context, stack: &mut Vec<u64>) -> Result<ObjectHeader> {
        let mut messages = Vec::with_capacity(self.records.len());
        for raw in &self.records {
            messages.push(self.decode_record(ctx, raw, stack)?);
        }
        Ok(ObjectHeader {
            address: self.address,
            version: self.version,
            flags: self.flags,
            reference_count: self.reference_count,
            times: self.times,
            attribute_phase_change: self.attribute_phase_change,
            chunks: self.chunks,
            messages,
        })
    }

    fn decode_record(
        &self,
        ctx: &Context,
        raw: &RawMessage,
        stack: &mut Vec<u64>,
    ) -> Result<HeaderMessage> {
        if let MessageType::Unknown(code) = raw.kind {
            if raw.flags.fail_if_unknown() || ctx.options().strict_unknown_messages {
                return Err(Error::UnsupportedMessage { address: self.address, message_type: code });
            }
            warn!(
                "Object header at {:#x}: keeping unknown message type {:#06x} opaque",
                self.address, code
            );
        }
        let mut c = raw.cursor(ctx);
        let mut resolver = HeaderResolver { ctx, header: self, stack, depth: 0 };
        let (message, shared) = if raw.flags.is_shared() {
            let locator = SharedLocator::decode(&mut c)?;
            (resolver.resolve(&locator, raw.kind)?, Some(locator))
        } else {
            (Message::decode(raw.kind, &mut c, &mut resolver)?, None)
        };
        Ok(HeaderMessage { message, flags: raw.flags, creation_order: raw.creation_order, shared })
    }
}

/// Resolves shared messages met while decoding one header.
struct HeaderResolver<'a> {
    ctx: &'a Context,
    header: &'a RawHeader,
    stack: &'a mut Vec<u64>,
    depth: usize,
}

impl HeaderResolver<'_> {
    fn nested(&mut self) -> HeaderResolver<'_> {
        HeaderResolver {
            ctx: self.ctx,
            header: self.header,
            stack: &mut *self.stack,
            depth: self.depth + 1,
        }
    }
}

impl SharedResolver for HeaderResolver<'_> {
    fn resolve(&mut self, locator: &SharedLocator, kind: MessageType) -> Result<Message> {
        let structure = Structure::SharedMessage;
        let header = self.header;
        let max_depth = self.ctx.options().max_shared_depth;
        if self.depth >= max_depth {
            return Err(Error::format(
                structure,
                header.address,
                format!("shared messages nested deeper than {}", max_depth),
            ));
        }
        let (message, at) = match *locator {
            SharedLocator::ObjectHeader { address, .. } if address == header.address => {
                let raw = header
                    .records
                    .iter()
                    .find(|r| r.kind == kind && !r.flags.is_shared())
                    .ok_or_else(|| {
                        Error::format(
                            structure,
                            address,
                            format!("header holds no unshared {} message", kind),
                        )
                    })?;
                let mut c = raw.cursor(self.ctx);
                (Message::decode(kind, &mut c, &mut self.nested())?, address)
            }
            SharedLocator::ObjectHeader { address, .. } => {
                let target = ObjectHeader::read_nested(self.ctx, address, self.stack)?;
                let found = target.find(kind).ok_or_else(|| {
                    Error::format(structure, address, format!("header holds no {} message", kind))
                })?;
                (found.message.clone(), address)
            }
            SharedLocator::Heap { heap_id } => {
                let table_message = self.ctx.shared_message_table().ok_or_else(|| {
                    Error::format(
                        structure,
                        header.address,
                        "shared message heap used without a shared message table",
                    )
                })?;
                let table = SharedMessageTable::read(self.ctx, table_message)?;
                let bytes = table.message_bytes(self.ctx, kind, &heap_id)?;
                let mut c = FieldCursor::new(bytes, self.ctx.sizes(), structure, table.address);
                (Message::decode(kind, &mut c, &mut self.nested())?, table.address)
            }
        };
        if message.message_type() != kind {
            return Err(Error::format(
                structure,
                at,
                format!("expected a shared {} message, found {}", kind, message.message_type()),
            ));
        }
        Ok(message)
    }
}
