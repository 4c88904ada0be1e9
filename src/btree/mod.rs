//! B-tree engine.
//!
//! Two independent tree generations:
//!
//! - [`v1`]: integer-keyed trees indexing group members (through symbol
//!   table nodes) and, in older datasets, raw data chunks. Searched with a
//!   caller-supplied three-way comparator; leaves are chained by sibling
//!   pointers.
//! - [`v2`]: trees of typed fixed-size records (see [`records`]) used by
//!   dense groups, dense attributes, huge heap objects, shared message
//!   indices and chunk indices.

pub mod records;
pub mod symbol;
pub mod v1;
mod v1_builder;
pub mod v2;
mod v2_builder;

pub use records::{Record, RecordLayout, SharedMessageRecord};
pub use symbol::{ScratchPad, SymbolTableEntry, SymbolTableNode};
pub use v1::{BTreeV1, BTreeV1Node, ChunkKey, Key, KeyLayout, LeafEntry, NodeType};
pub use v1_builder::BTreeV1Builder;
pub use v2::{BTreeV2, BTreeV2Header, NodePointer};
pub use v2_builder::BTreeV2Builder;
