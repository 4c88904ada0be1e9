//! Object headers and their messages.
//!
//! ```text
//! header   prefix + chunk 0, continuation chunks, decoded into HeaderMessages
//! messages one typed payload per message type code
//! shared   locators for messages stored elsewhere
//! sohm     shared object header message table and its indices
//! builder  header encoder with continuation splits
//! ```

mod builder;
mod header;
pub mod messages;
pub mod shared;
pub mod sohm;

pub use builder::ObjectHeaderBuilder;
pub use header::{
    AttributePhaseChange, HeaderChunk, HeaderMessage, ObjectHeader, ObjectKind, ObjectTimes,
    FLAG_ATTRIBUTE_CREATION_ORDER_INDEXED, FLAG_ATTRIBUTE_CREATION_ORDER_TRACKED,
    FLAG_ATTRIBUTE_PHASE_CHANGE, FLAG_TIMES,
};
pub use messages::{Message, MessageFlags, MessageKind, MessageType};
pub use shared::{ContextResolver, NoSharedMessages, SharedLocator, SharedResolver};
pub use sohm::{IndexKind, SharedMessageIndex, SharedMessageTable};
