//! Typed header messages.
//!
//! Each on-disk message type code maps to exactly one [`Message`] variant and
//! one payload decoder, selected in [`Message::decode`]. Codes this crate does
//! not model are preserved as [`Message::Unknown`].

mod attribute;
mod dataspace;
mod datatype;
mod layout;
mod link;
mod misc;
mod pipeline;

pub use attribute::{AttributeInfoMessage, AttributeMessage};
pub use dataspace::{DataspaceKind, DataspaceMessage, UNLIMITED};
pub use datatype::{DatatypeClass, DatatypeMessage};
pub use layout::{ChunkIndexInfo, ChunkedLayout, DataLayoutMessage, Layout};
pub use link::{GroupInfoMessage, LinkInfoMessage, LinkMessage, LinkTarget, SymbolTableMessage};
pub use misc::{
    BTreeKMessage, BogusMessage, CommentMessage, ContinuationMessage, DriverInfoMessage,
    ExternalFileSlot, ExternalFilesMessage, FillValueMessage, ModificationTimeMessage,
    ReferenceCountMessage, SharedMessageTableMessage,
};
pub use pipeline::{FilterDescription, FilterPipelineMessage};

use super::shared::SharedResolver;
use crate::error::Result;
use crate::io::{FieldCursor, Sizes};
use bytes::Bytes;
use std::fmt;

/// Header message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// 0x0000: padding / free space.
    Nil,
    /// 0x0001
    Dataspace,
    /// 0x0002
    LinkInfo,
    /// 0x0003
    Datatype,
    /// 0x0004: fill value, old form.
    OldFillValue,
    /// 0x0005
    FillValue,
    /// 0x0006
    Link,
    /// 0x0007
    ExternalFiles,
    /// 0x0008
    DataLayout,
    /// 0x0009: testing message.
    Bogus,
    /// 0x000A
    GroupInfo,
    /// 0x000B
    FilterPipeline,
    /// 0x000C
    Attribute,
    /// 0x000D
    Comment,
    /// 0x000E: modification time, old form.
    OldModificationTime,
    /// 0x000F
    SharedMessageTable,
    /// 0x0010
    Continuation,
    /// 0x0011
    SymbolTable,
    /// 0x0012
    ModificationTime,
    /// 0x0013
    BTreeK,
    /// 0x0014
    DriverInfo,
    /// 0x0015
    AttributeInfo,
    /// 0x0016
    ReferenceCount,
    /// Any other code.
    Unknown(u16),
}

impl MessageType {
    /// Maps a stored type code.
    pub fn from_code(code: u16) -> Self {
        match code {
            0x00 => MessageType::Nil,
            0x01 => MessageType::Dataspace,
            0x02 => MessageType::LinkInfo,
            0x03 => MessageType::Datatype,
            0x04 => MessageType::OldFillValue,
            0x05 => MessageType::FillValue,
            0x06 => MessageType::Link,
            0x07 => MessageType::ExternalFiles,
            0x08 => MessageType::DataLayout,
            0x09 => MessageType::Bogus,
            0x0A => MessageType::GroupInfo,
            0x0B => MessageType::FilterPipeline,
            0x0C => MessageType::Attribute,
            0x0D => MessageType::Comment,
            0x0E => MessageType::OldModificationTime,
            0x0F => MessageType::SharedMessageTable,
            0x10 => MessageType::Continuation,
            0x11 => MessageType::SymbolTable,
            0x12 => MessageType::ModificationTime,
            0x13 => MessageType::BTreeK,
            0x14 => MessageType::DriverInfo,
            0x15 => MessageType::AttributeInfo,
            0x16 => MessageType::ReferenceCount,
            other => MessageType::Unknown(other),
        }
    }

    /// The stored type code.
    pub fn code(&self) -> u16 {
        match self {
            MessageType::Nil => 0x00,
            MessageType::Dataspace => 0x01,
            MessageType::LinkInfo => 0x02,
            MessageType::Datatype => 0x03,
            MessageType::OldFillValue => 0x04,
            MessageType::FillValue => 0x05,
            MessageType::Link => 0x06,
            MessageType::ExternalFiles => 0x07,
            MessageType::DataLayout => 0x08,
            MessageType::Bogus => 0x09,
            MessageType::GroupInfo => 0x0A,
            MessageType::FilterPipeline => 0x0B,
            MessageType::Attribute => 0x0C,
            MessageType::Comment => 0x0D,
            MessageType::OldModificationTime => 0x0E,
            MessageType::SharedMessageTable => 0x0F,
            MessageType::Continuation => 0x10,
            MessageType::SymbolTable => 0x11,
            MessageType::ModificationTime => 0x12,
            MessageType::BTreeK => 0x13,
            MessageType::DriverInfo => 0x14,
            MessageType::AttributeInfo => 0x15,
            MessageType::ReferenceCount => 0x16,
            MessageType::Unknown(code) => *code,
        }
    }

    /// Whether messages of this type may be stored as shared messages.
    pub fn is_shareable(&self) -> bool {
        matches!(
            self,
            MessageType::Dataspace
                | MessageType::Datatype
                | MessageType::OldFillValue
                | MessageType::FillValue
                | MessageType::FilterPipeline
                | MessageType::Attribute
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Unknown(code) => write!(f, "unknown({:#06x})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Per-message flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(pub u8);

impl MessageFlags {
    /// Message value never changes.
    pub const CONSTANT: u8 = 0x01;
    /// Payload is a shared message locator.
    pub const SHARED: u8 = 0x02;
    /// Message must not be shared.
    pub const DONT_SHARE: u8 = 0x04;
    /// Writers that do not understand the type must fail.
    pub const FAIL_IF_UNKNOWN_AND_WRITING: u8 = 0x08;
    /// Writers that do not understand the type set `WAS_UNKNOWN`.
    pub const MARK_IF_UNKNOWN: u8 = 0x10;
    /// A writer did not understand this type.
    pub const WAS_UNKNOWN: u8 = 0x20;
    /// Message may be shared.
    pub const SHAREABLE: u8 = 0x40;
    /// Any decoder that does not understand the type must fail.
    pub const FAIL_IF_UNKNOWN_ALWAYS: u8 = 0x80;

    /// Raw flag byte.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Constant flag.
    pub fn is_constant(&self) -> bool {
        self.0 & Self::CONSTANT != 0
    }

    /// Shared flag.
    pub fn is_shared(&self) -> bool {
        self.0 & Self::SHARED != 0
    }

    /// Fail-if-unknown flag that applies to readers.
    pub fn fail_if_unknown(&self) -> bool {
        self.0 & Self::FAIL_IF_UNKNOWN_ALWAYS != 0
    }
}

/// A decoded header message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Padding.
    Nil,
    /// Dataset or attribute shape.
    Dataspace(DataspaceMessage),
    /// Dense link storage description.
    LinkInfo(LinkInfoMessage),
    /// Element type.
    Datatype(DatatypeMessage),
    /// Old-form fill value.
    OldFillValue(FillValueMessage),
    /// Fill value.
    FillValue(FillValueMessage),
    /// One link of a compact group.
    Link(LinkMessage),
    /// External raw data files.
    ExternalFiles(ExternalFilesMessage),
    /// Raw data storage description.
    DataLayout(DataLayoutMessage),
    /// Testing message.
    Bogus(BogusMessage),
    /// Group storage tuning.
    GroupInfo(GroupInfoMessage),
    /// Filter pipeline.
    FilterPipeline(FilterPipelineMessage),
    /// Compact attribute.
    Attribute(AttributeMessage),
    /// Object comment.
    Comment(CommentMessage),
    /// Old-form modification time.
    OldModificationTime(ModificationTimeMessage),
    /// Shared object header message table location.
    SharedMessageTable(SharedMessageTableMessage),
    /// Pointer to the next header chunk.
    Continuation(ContinuationMessage),
    /// Old-style group B-tree and name heap.
    SymbolTable(SymbolTableMessage),
    /// Modification time.
    ModificationTime(ModificationTimeMessage),
    /// Non-default B-tree K values.
    BTreeK(BTreeKMessage),
    /// File driver information.
    DriverInfo(DriverInfoMessage),
    /// Dense attribute storage description.
    AttributeInfo(AttributeInfoMessage),
    /// Object reference count.
    ReferenceCount(ReferenceCountMessage),
    /// A type this crate does not model, kept opaque.
    Unknown {
        /// Stored type code.
        code: u16,
        /// Raw payload.
        data: Bytes,
    },
}

impl Message {
    /// Decodes one payload, selecting the decoder by type.
    ///
    /// `resolver` handles shared messages nested inside the payload
    /// (attribute datatypes and dataspaces).
    pub fn decode(
        kind: MessageType,
        payload: &mut FieldCursor,
        resolver: &mut dyn SharedResolver,
    ) -> Result<Message> {
        let message = match kind {
            MessageType::Nil => Message::Nil,
            MessageType::Dataspace => Message::Dataspace(DataspaceMessage::decode(payload)?),
            MessageType::LinkInfo => Message::LinkInfo(LinkInfoMessage::decode(payload)?),
            MessageType::Datatype => Message::Datatype(DatatypeMessage::decode(payload)?),
            MessageType::OldFillValue => {
                Message::OldFillValue(FillValueMessage::decode_old(payload)?)
            }
            MessageType::FillValue => Message::FillValue(FillValueMessage::decode(payload)?),
            MessageType::Link => Message::Link(LinkMessage::decode(payload)?),
            MessageType::ExternalFiles => {
                Message::ExternalFiles(ExternalFilesMessage::decode(payload)?)
            }
            MessageType::DataLayout => Message::DataLayout(DataLayoutMessage::decode(payload)?),
            MessageType::Bogus => Message::Bogus(BogusMessage::decode(payload)?),
            MessageType::GroupInfo => Message::GroupInfo(GroupInfoMessage::decode(payload)?),
            MessageType::FilterPipeline => {
                Message::FilterPipeline(FilterPipelineMessage::decode(payload)?)
            }
            MessageType::Attribute => {
                Message::Attribute(AttributeMessage::decode(payload, resolver)?)
            }
            MessageType::Comment => Message::Comment(CommentMessage::decode(payload)?),
            MessageType::OldModificationTime => {
                Message::OldModificationTime(ModificationTimeMessage::decode_old(payload)?)
            }
            MessageType::SharedMessageTable => {
                Message::SharedMessageTable(SharedMessageTableMessage::decode(payload)?)
            }
            MessageType::Continuation => {
                Message::Continuation(ContinuationMessage::decode(payload)?)
            }
            MessageType::SymbolTable => {
                Message::SymbolTable(SymbolTableMessage::decode(payload)?)
            }
            MessageType::ModificationTime => {
                Message::ModificationTime(ModificationTimeMessage::decode(payload)?)
            }
            MessageType::BTreeK => Message::BTreeK(BTreeKMessage::decode(payload)?),
            MessageType::DriverInfo => Message::DriverInfo(DriverInfoMessage::decode(payload)?),
            MessageType::AttributeInfo => {
                Message::AttributeInfo(AttributeInfoMessage::decode(payload)?)
            }
            MessageType::ReferenceCount => {
                Message::ReferenceCount(ReferenceCountMessage::decode(payload)?)
            }
            MessageType::Unknown(code) => Message::Unknown { code, data: payload.read_rest() },
        };
        Ok(message)
    }

    /// Encodes the payload of this message.
    pub fn encode(&self, sizes: Sizes) -> Bytes {
        match self {
            Message::Nil => Bytes::new(),
            Message::Dataspace(m) => m.encode(sizes),
            Message::LinkInfo(m) => m.encode(sizes),
            Message::Datatype(m) => m.encode(),
            Message::OldFillValue(m) => m.encode_old(),
            Message::FillValue(m) => m.encode(),
            Message::Link(m) => m.encode(sizes),
            Message::ExternalFiles(m) => m.encode(sizes),
            Message::DataLayout(m) => m.encode(sizes),
            Message::Bogus(m) => m.encode(),
            Message::GroupInfo(m) => m.encode(),
            Message::FilterPipeline(m) => m.encode(),
            Message::Attribute(m) => m.encode(sizes),
            Message::Comment(m) => m.encode(),
            Message::OldModificationTime(m) => m.encode_old(),
            Message::SharedMessageTable(m) => m.encode(sizes),
            Message::Continuation(m) => m.encode(sizes),
            Message::SymbolTable(m) => m.encode(sizes),
            Message::ModificationTime(m) => m.encode(),
            Message::BTreeK(m) => m.encode(),
            Message::DriverInfo(m) => m.encode(),
            Message::AttributeInfo(m) => m.encode(sizes),
            Message::ReferenceCount(m) => m.encode(),
            Message::Unknown { data, .. } => data.clone(),
        }
    }

    /// The type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Nil => MessageType::Nil,
            Message::Dataspace(_) => MessageType::Dataspace,
            Message::LinkInfo(_) => MessageType::LinkInfo,
            Message::Datatype(_) => MessageType::Datatype,
            Message::OldFillValue(_) => MessageType::OldFillValue,
            Message::FillValue(_) => MessageType::FillValue,
            Message::Link(_) => MessageType::Link,
            Message::ExternalFiles(_) => MessageType::ExternalFiles,
            Message::DataLayout(_) => MessageType::DataLayout,
            Message::Bogus(_) => MessageType::Bogus,
            Message::GroupInfo(_) => MessageType::GroupInfo,
            Message::FilterPipeline(_) => MessageType::FilterPipeline,
            Message::Attribute(_) => MessageType::Attribute,
            Message::Comment(_) => MessageType::Comment,
            Message::OldModificationTime(_) => MessageType::OldModificationTime,
            Message::SharedMessageTable(_) => MessageType::SharedMessageTable,
            Message::Continuation(_) => MessageType::Continuation,
            Message::SymbolTable(_) => MessageType::SymbolTable,
            Message::ModificationTime(_) => MessageType::ModificationTime,
            Message::BTreeK(_) => MessageType::BTreeK,
            Message::DriverInfo(_) => MessageType::DriverInfo,
            Message::AttributeInfo(_) => MessageType::AttributeInfo,
            Message::ReferenceCount(_) => MessageType::ReferenceCount,
            Message::Unknown { code, .. } => MessageType::Unknown(*code),
        }
    }
}

/// A payload type that can be fetched from a header by type.
pub trait MessageKind: Sized {
    /// The message type holding this payload.
    const TYPE: MessageType;

    /// Borrows the payload if `message` is of this kind.
    fn from_message(message: &Message) -> Option<&Self>;
}

macro_rules! message_kind {
    ($ty:ty, $kind:ident) => {
        impl MessageKind for $ty {
            const TYPE: MessageType = MessageType::$kind;

            fn from_message(message: &Message) -> Option<&Self> {
                match message {
                    Message::$kind(m) => Some(m),
                    _ => None,
                }
            }
        }
    };
}

message_kind!(DataspaceMessage, Dataspace);
message_kind!(LinkInfoMessage, LinkInfo);
message_kind!(DatatypeMessage, Datatype);
message_kind!(FillValueMessage, FillValue);
message_kind!(LinkMessage, Link);
message_kind!(ExternalFilesMessage, ExternalFiles);
message_kind!(DataLayoutMessage, DataLayout);
message_kind!(BogusMessage, Bogus);
message_kind!(GroupInfoMessage, GroupInfo);
message_kind!(FilterPipelineMessage, FilterPipeline);
message_kind!(AttributeMessage, Attribute);
message_kind!(CommentMessage, Comment);
message_kind!(ModificationTimeMessage, ModificationTime);
message_kind!(SharedMessageTableMessage, SharedMessageTable);
message_kind!(ContinuationMessage, Continuation);
message_kind!(SymbolTableMessage, SymbolTable);
message_kind!(BTreeKMessage, BTreeK);
message_kind!(DriverInfoMessage, DriverInfo);
message_kind!(AttributeInfoMessage, AttributeInfo);
message_kind!(ReferenceCountMessage, ReferenceCount);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes_round_trip() {
        for code in 0u16..0x20 {
            assert_eq!(MessageType::from_code(code).code(), code);
        }
        assert_eq!(MessageType::from_code(0x99), MessageType::Unknown(0x99));
    }

    #[test]
    fn test_shareable_types() {
        assert!(MessageType::Datatype.is_shareable());
        assert!(MessageType::Attribute.is_shareable());
        assert!(!MessageType::Link.is_shareable());
        assert!(!MessageType::Continuation.is_shareable());
    }

    #[test]
    fn test_flags() {
        let flags = MessageFlags(MessageFlags::SHARED | MessageFlags::FAIL_IF_UNKNOWN_ALWAYS);
        assert!(flags.is_shared());
        assert!(flags.fail_if_unknown());
        assert!(!flags.is_constant());
        assert!(!MessageFlags(MessageFlags::FAIL_IF_UNKNOWN_AND_WRITING).fail_if_unknown());
    }
}
