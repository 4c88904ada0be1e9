//! # h5nav - HDF5 container navigation
//!
//! h5nav decodes the structures that connect an HDF5 file together: the
//! superblock, object headers and their messages, version 1 and 2 B-trees,
//! local, global and fractal heaps, and the chunk indexes of chunked
//! datasets. It does not convert element data to native values and does not
//! implement compression codecs; filters are plugged in through
//! [`filter::FilterRegistry`].
//!
//! ## Architecture
//!
//! - **Byte source**: positioned reads from memory or a file
//! - **Superblock**: field widths, base address and the root object
//! - **Object headers**: typed messages, continuation chunks, shared messages
//! - **B-trees**: v1 group and chunk trees, v2 typed-record trees
//! - **Heaps**: local name heaps, global heap collections, fractal heaps
//! - **Chunk indexes**: single chunk, implicit, fixed array, extensible
//!   array, v2 B-tree and v1 B-tree behind one `locate` call
//! - **Decode cache**: every decoded structure is memoized by
//!   (source, address, structure kind)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use h5nav::File;
//!
//! # fn main() -> Result<(), h5nav::Error> {
//! let file = File::open("measurements.h5")?;
//!
//! // Walk the root group
//! for link in file.root_group()?.links()? {
//!     println!("{}: {:?}", link.name, link.target);
//! }
//!
//! // Find where one chunk of a dataset is stored
//! let index = file.chunk_index("/run1/temperature")?;
//! if let Some(chunk) = index.locate_element(&[120, 4])? {
//!     println!("{} bytes at {:#x}", chunk.size, chunk.address);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod attributes;
pub mod btree;
pub mod cache;
pub mod checksum;
pub mod chunk;
pub mod config;
pub mod context;
pub mod error;
pub mod file;
pub mod filter;
pub mod heap;
pub mod io;
pub mod links;
pub mod object;
pub mod superblock;

// Re-exports
pub use attributes::Attributes;
pub use chunk::{ChunkGeometry, ChunkIndex, ChunkLocation};
pub use config::Options;
pub use context::Context;
pub use error::{Error, Result, Structure};
pub use file::File;
pub use io::{ByteSource, FileSource, MemorySource};
pub use links::{Group, LinkStorage};
pub use object::{Message, MessageType, ObjectHeader, ObjectKind};
pub use superblock::Superblock;
