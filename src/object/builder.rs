//! Object header encoder.
//!
//! Messages are laid out in insertion order. Split points move the
//! remaining messages into continuation chunks, each reached through a
//! continuation message appended to the chunk before it.

use super::header::{
    AttributePhaseChange, ObjectTimes, CONTINUATION_SIGNATURE,
    FLAG_ATTRIBUTE_CREATION_ORDER_TRACKED, FLAG_ATTRIBUTE_PHASE_CHANGE, FLAG_TIMES,
    HEADER_SIGNATURE, V1_PREFIX_SIZE,
};
use super::messages::{ContinuationMessage, Message, MessageFlags, MessageType};
use super::shared::SharedLocator;
use crate::error::{Error, Result};
use crate::io::{FieldWriter, FileImage, Sizes};
use bytes::Bytes;

#[derive(Debug, Clone)]
enum Payload {
    Inline(Message),
    Shared(SharedLocator),
    Raw(Bytes),
}

#[derive(Debug, Clone)]
struct PendingMessage {
    kind: MessageType,
    flags: u8,
    payload: Payload,
}

impl PendingMessage {
    fn encode(&self, sizes: Sizes) -> Bytes {
        match &self.payload {
            Payload::Inline(message) => message.encode(sizes),
            Payload::Shared(locator) => locator.encode(sizes),
            Payload::Raw(bytes) => bytes.clone(),
        }
    }
}

/// Builds version 1 or version 2 object headers.
#[derive(Debug, Clone)]
pub struct ObjectHeaderBuilder {
    version: u8,
    flags: u8,
    reference_count: u32,
    times: Option<ObjectTimes>,
    phase_change: Option<AttributePhaseChange>,
    messages: Vec<PendingMessage>,
    splits: Vec<usize>,
}

impl ObjectHeaderBuilder {
    /// A builder for a header of `version` (1 or 2).
    pub fn new(version: u8) -> Self {
        Self {
            version,
            flags: 0,
            reference_count: 1,
            times: None,
            phase_change: None,
            messages: Vec::new(),
            splits: Vec::new(),
        }
    }

    /// Hard link count of a version 1 header.
    pub fn reference_count(mut self, count: u32) -> Self {
        self.reference_count = count;
        self
    }

    /// Stores timestamps (version 2).
    pub fn times(mut self, times: ObjectTimes) -> Self {
        self.times = Some(times);
        self
    }

    /// Stores attribute phase change values (version 2).
    pub fn attribute_phase_change(mut self, max_compact: u16, min_dense: u16) -> Self {
        self.phase_change = Some(AttributePhaseChange { max_compact, min_dense });
        self
    }

    /// Tracks attribute creation order; every message carries its index
    /// (version 2).
    pub fn track_creation_order(mut self) -> Self {
        self.flags |= FLAG_ATTRIBUTE_CREATION_ORDER_TRACKED;
        self
    }

    /// Adds an inline message.
    pub fn message(self, message: Message) -> Self {
        self.message_with_flags(message, 0)
    }

    /// Adds an inline message with explicit flags.
    pub fn message_with_flags(mut self, message: Message, flags: u8) -> Self {
        let kind = message.message_type();
        self.messages.push(PendingMessage {
            kind,
            flags: flags & !MessageFlags::SHARED,
            payload: Payload::Inline(message),
        });
        self
    }

    /// Adds a message of `kind` stored elsewhere and reached through
    /// `locator`.
    pub fn shared_message(mut self, kind: MessageType, locator: SharedLocator) -> Self {
        self.messages.push(PendingMessage {
            kind,
            flags: MessageFlags::SHARED,
            payload: Payload::Shared(locator),
        });
        self
    }

    /// Adds a message with an arbitrary type, flags and payload.
    pub fn raw_message(mut self, kind: MessageType, flags: u8, payload: impl Into<Bytes>) -> Self {
        self.messages.push(PendingMessage { kind, flags, payload: Payload::Raw(payload.into()) });
        self
    }

    /// Starts a new continuation chunk after the first `count` messages.
    pub fn continue_after(mut self, count: usize) -> Self {
        self.splits.push(count);
        self
    }

    /// Number of messages added so far.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if no message was added.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Allocates and writes the header, returning its address.
    pub fn write(&self, image: &mut FileImage) -> Result<u64> {
        let layout = self.layout(image.sizes())?;
        let address = image.allocate(layout.first_len());
        self.write_layout(image, address, layout)?;
        Ok(address)
    }

    /// Size of chunk 0, prefix and checksum included, for callers that
    /// reserve the header address before writing (self references).
    pub fn first_chunk_size(&self, sizes: Sizes) -> Result<usize> {
        Ok(self.layout(sizes)?.first_len())
    }

    /// Writes the header at `address`, which must have room for
    /// [`ObjectHeaderBuilder::first_chunk_size`] bytes. Continuation chunks
    /// are allocated behind the current end of the image.
    pub fn write_at(&self, image: &mut FileImage, address: u64) -> Result<()> {
        let layout = self.layout(image.sizes())?;
        self.write_layout(image, address, layout)
    }

    fn groups(&self) -> Vec<&[PendingMessage]> {
        let mut cuts: Vec<usize> = self
            .splits
            .iter()
            .copied()
            .filter(|&n| n > 0 && n < self.messages.len())
            .collect();
        cuts.sort_unstable();
        cuts.dedup();
        let mut groups = Vec::with_capacity(cuts.len() + 1);
        let mut start = 0;
        for cut in cuts {
            groups.push(&self.messages[start..cut]);
            start = cut;
        }
        groups.push(&self.messages[start..]);
        groups
    }

    fn entry_header_size(&self) -> usize {
        match (self.version, self.flags & FLAG_ATTRIBUTE_CREATION_ORDER_TRACKED != 0) {
            (1, _) => 8,
            (_, true) => 6,
            (_, false) => 4,
        }
    }

    fn stored_payload_len(&self, len: usize) -> usize {
        if self.version == 1 {
            len.div_ceil(8) * 8
        } else {
            len
        }
    }

    fn header_flags(&self, chunk0_size: usize) -> u8 {
        let mut flags = self.flags;
        flags |= match chunk0_size {
            0..=0xFF => 0,
            0x100..=0xFFFF => 1,
            0x1_0000..=0xFFFF_FFFF => 2,
            _ => 3,
        };
        if self.times.is_some() {
            flags |= FLAG_TIMES;
        }
        if self.phase_change.is_some() {
            flags |= FLAG_ATTRIBUTE_PHASE_CHANGE;
        }
        flags
    }

    fn layout(&self, sizes: Sizes) -> Result<Layout> {
        if !matches!(self.version, 1 | 2) {
            return Err(Error::invalid_argument(format!(
                "object header version {}",
                self.version
            )));
        }
        if self.version == 1
            && (self.flags != 0 || self.times.is_some() || self.phase_change.is_some())
        {
            return Err(Error::invalid_argument(
                "version 1 headers store no flags, times or phase change values",
            ));
        }
        let continuation_len = self.entry_header_size()
            + self.stored_payload_len(sizes.offset_size() + sizes.length_size());
        let groups = self.groups();
        let count = groups.len();
        let mut bodies = Vec::with_capacity(count);
        for (i, group) in groups.iter().enumerate() {
            let mut body = 0;
            for m in group.iter() {
                body += self.entry_header_size() + self.stored_payload_len(m.encode(sizes).len());
            }
            if i + 1 < count {
                body += continuation_len;
            }
            bodies.push(body);
        }

        let chunk0_body = bodies.first().copied().unwrap_or(0);
        let prefix_len = if self.version == 1 {
            V1_PREFIX_SIZE
        } else {
            let width = 1usize << (self.header_flags(chunk0_body) & 0x03);
            let mut len = 6 + width;
            if self.times.is_some() {
                len += 16;
            }
            if self.phase_change.is_some() {
                len += 4;
            }
            len
        };
        let chunk_lens = bodies
            .iter()
            .enumerate()
            .map(|(i, body)| match (self.version, i) {
                (1, 0) => prefix_len + body,
                (1, _) => *body,
                (_, 0) => prefix_len + body + 4,
                _ => 4 + body + 4,
            })
            .collect();
        Ok(Layout { prefix_len, bodies, chunk_lens })
    }

    fn write_layout(&self, image: &mut FileImage, address: u64, layout: Layout) -> Result<()> {
        let sizes = image.sizes();
        let mut addresses = vec![address];
        for len in layout.chunk_lens.iter().skip(1) {
            addresses.push(image.allocate(*len));
        }

        let total_messages = self.messages.len() + addresses.len() - 1;
        let groups = self.groups();
        let mut creation_order = 0u16;
        for (i, group) in groups.iter().enumerate() {
            let next = match (addresses.get(i + 1), layout.chunk_lens.get(i + 1)) {
                (Some(&address), Some(&length)) => {
                    Some(ContinuationMessage { address, length: length as u64 })
                }
                _ => None,
            };
            let body = layout.bodies.get(i).copied().unwrap_or(0);
            let mut w = FieldWriter::new(sizes);
            if i == 0 {
                self.put_prefix(&mut w, body, total_messages)?;
            } else if self.version == 2 {
                w.put_slice(CONTINUATION_SIGNATURE);
            }
            for m in group.iter() {
                self.put_entry(&mut w, m.kind, m.flags, &m.encode(sizes), creation_order)?;
                creation_order = creation_order.wrapping_add(1);
            }
            if let Some(next) = next {
                let payload = Message::Continuation(next).encode(sizes);
                self.put_entry(&mut w, MessageType::Continuation, 0, &payload, 0)?;
            }
            if self.version == 2 {
                w.put_checksum();
            }
            if let Some(&at) = addresses.get(i) {
                image.write_at(at, &w.finish());
            }
        }
        Ok(())
    }

    fn put_prefix(
        &self,
        w: &mut FieldWriter,
        chunk0_size: usize,
        message_count: usize,
    ) -> Result<()> {
        if self.version == 1 {
            let count = u16::try_from(message_count).map_err(|_| {
                Error::invalid_argument(format!(
                    "{} messages exceed a version 1 header",
                    message_count
                ))
            })?;
            let size = u32::try_from(chunk0_size)
                .map_err(|_| Error::invalid_argument("version 1 chunk 0 exceeds 4 GiB"))?;
            w.put_u8(1);
            w.put_u8(0);
            w.put_u16(count);
            w.put_u32(self.reference_count);
            w.put_u32(size);
            w.put_zeros(4);
            return Ok(());
        }
        let flags = self.header_flags(chunk0_size);
        w.put_slice(HEADER_SIGNATURE);
        w.put_u8(2);
        w.put_u8(flags);
        if let Some(times) = self.times {
            w.put_u32(times.access);
            w.put_u32(times.modification);
            w.put_u32(times.change);
            w.put_u32(times.birth);
        }
        if let Some(phase) = self.phase_change {
            w.put_u16(phase.max_compact);
            w.put_u16(phase.min_dense);
        }
        w.put_uint(chunk0_size as u64, 1 << (flags & 0x03));
        Ok(())
    }

    fn put_entry(
        &self,
        w: &mut FieldWriter,
        kind: MessageType,
        flags: u8,
        payload: &[u8],
        creation_order: u16,
    ) -> Result<()> {
        let stored = self.stored_payload_len(payload.len());
        let size = u16::try_from(stored).map_err(|_| {
            Error::invalid_argument(format!("{} message of {} bytes is too large", kind, stored))
        })?;
        if self.version == 1 {
            w.put_u16(kind.code());
            w.put_u16(size);
            w.put_u8(flags);
            w.put_zeros(3);
        } else {
            let code = u8::try_from(kind.code()).map_err(|_| {
                Error::invalid_argument(format!("{} does not fit a version 2 header", kind))
            })?;
            w.put_u8(code);
            w.put_u16(size);
            w.put_u8(flags);
            if self.flags & FLAG_ATTRIBUTE_CREATION_ORDER_TRACKED != 0 {
                w.put_u16(creation_order);
            }
        }
        w.put_slice(payload);
        w.put_zeros(stored - payload.len());
        Ok(())
    }
}

#[derive(Debug)]
struct Layout {
    prefix_len: usize,
    bodies: Vec<usize>,
    chunk_lens: Vec<usize>,
}

impl Layout {
    fn first_len(&self) -> usize {
        self.chunk_lens.first().copied().unwrap_or(self.prefix_len)
    }
}
