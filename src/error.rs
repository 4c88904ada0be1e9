//! Error types for h5nav.
//!
//! Every decode failure carries the kind of structure being decoded and the
//! file address it was discovered at, so corruption can be diagnosed without
//! re-running the decode.

use std::fmt;
use std::io;
use thiserror::Error;

/// The result type used throughout h5nav.
pub type Result<T> = std::result::Result<T, Error>;

/// The on-disk structure a decode operation was working on.
///
/// Also used as the decoded-type discriminator of the decode cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Structure {
    /// File superblock.
    Superblock,
    /// Driver information block referenced from a v0/v1 superblock.
    DriverInfo,
    /// Object header prefix and first chunk.
    ObjectHeader,
    /// Object header continuation chunk.
    ContinuationBlock,
    /// A single header message payload.
    HeaderMessage,
    /// Shared message locator or shared message heap.
    SharedMessage,
    /// Shared object header message table or one of its list indices.
    SharedMessageTable,
    /// Version 1 B-tree node.
    BTreeV1Node,
    /// Symbol table node referenced from a group B-tree.
    SymbolTableNode,
    /// Version 2 B-tree header.
    BTreeV2Header,
    /// Version 2 B-tree internal or leaf node.
    BTreeV2Node,
    /// Local (name) heap.
    LocalHeap,
    /// Global heap collection.
    GlobalHeap,
    /// Fractal heap header.
    FractalHeapHeader,
    /// Fractal heap direct block.
    FractalHeapDirectBlock,
    /// Fractal heap indirect block.
    FractalHeapIndirectBlock,
    /// Fixed array header.
    FixedArrayHeader,
    /// Fixed array data block or page.
    FixedArrayDataBlock,
    /// Extensible array header.
    ExtensibleArrayHeader,
    /// Extensible array index block.
    ExtensibleArrayIndexBlock,
    /// Extensible array secondary block.
    ExtensibleArraySecondaryBlock,
    /// Extensible array data block or page.
    ExtensibleArrayDataBlock,
    /// Chunk index selection or lookup.
    ChunkIndex,
    /// Filter pipeline application.
    Filter,
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Structure::Superblock => "superblock",
            Structure::DriverInfo => "driver info block",
            Structure::ObjectHeader => "object header",
            Structure::ContinuationBlock => "continuation block",
            Structure::HeaderMessage => "header message",
            Structure::SharedMessage => "shared message",
            Structure::SharedMessageTable => "shared message table",
            Structure::BTreeV1Node => "v1 B-tree node",
            Structure::SymbolTableNode => "symbol table node",
            Structure::BTreeV2Header => "v2 B-tree header",
            Structure::BTreeV2Node => "v2 B-tree node",
            Structure::LocalHeap => "local heap",
            Structure::GlobalHeap => "global heap collection",
            Structure::FractalHeapHeader => "fractal heap header",
            Structure::FractalHeapDirectBlock => "fractal heap direct block",
            Structure::FractalHeapIndirectBlock => "fractal heap indirect block",
            Structure::FixedArrayHeader => "fixed array header",
            Structure::FixedArrayDataBlock => "fixed array data block",
            Structure::ExtensibleArrayHeader => "extensible array header",
            Structure::ExtensibleArrayIndexBlock => "extensible array index block",
            Structure::ExtensibleArraySecondaryBlock => "extensible array secondary block",
            Structure::ExtensibleArrayDataBlock => "extensible array data block",
            Structure::ChunkIndex => "chunk index",
            Structure::Filter => "filter pipeline",
        };
        f.write_str(name)
    }
}

/// The error type for h5nav operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error occurred in the byte source.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A signature, version or structural field did not match the format.
    #[error("Format error in {structure} at {address:#x}: {message}")]
    Format {
        /// Structure being decoded.
        structure: Structure,
        /// Address of the structure.
        address: u64,
        /// What was wrong.
        message: String,
    },

    /// A stored metadata checksum did not match the computed one.
    #[error(
        "Checksum mismatch in {structure} at {address:#x}: expected {expected:#x}, got {actual:#x}"
    )]
    ChecksumMismatch {
        /// Structure being decoded.
        structure: Structure,
        /// Address of the structure.
        address: u64,
        /// Checksum stored in the file.
        expected: u32,
        /// Checksum computed over the bytes read.
        actual: u32,
    },

    /// The structure uses a valid but unimplemented format feature.
    #[error("Unsupported feature in {structure} at {address:#x}: {message}")]
    Unsupported {
        /// Structure being decoded.
        structure: Structure,
        /// Address of the structure.
        address: u64,
        /// The feature that is not supported.
        message: String,
    },

    /// An unknown header message was flagged as fail-on-unknown.
    #[error("Unsupported message type {message_type:#x} in object header at {address:#x}")]
    UnsupportedMessage {
        /// Address of the object header.
        address: u64,
        /// Raw message type code.
        message_type: u16,
    },

    /// An offset or length ran past the segment that owns it.
    #[error("Out of bounds in {structure} at {address:#x}: {message}")]
    Bounds {
        /// Structure being decoded.
        structure: Structure,
        /// Address at which the overrun was detected.
        address: u64,
        /// Description of the overrun.
        message: String,
    },

    /// A lookup by name or key found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A configuration document could not be parsed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Creates a new format error.
    pub fn format(structure: Structure, address: u64, msg: impl Into<String>) -> Self {
        Error::Format { structure, address, message: msg.into() }
    }

    /// Creates a new unsupported feature error.
    pub fn unsupported(structure: Structure, address: u64, msg: impl Into<String>) -> Self {
        Error::Unsupported { structure, address, message: msg.into() }
    }

    /// Creates a new bounds error.
    pub fn bounds(structure: Structure, address: u64, msg: impl Into<String>) -> Self {
        Error::Bounds { structure, address, message: msg.into() }
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Returns true for signature, version and checksum failures.
    pub fn is_format_error(&self) -> bool {
        matches!(self, Error::Format { .. } | Error::ChecksumMismatch { .. })
    }

    /// Returns true for unimplemented features and fail-on-unknown messages.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported { .. } | Error::UnsupportedMessage { .. })
    }

    /// Returns true when an offset exceeded its owning segment.
    pub fn is_bounds_error(&self) -> bool {
        matches!(self, Error::Bounds { .. })
    }

    /// The structure kind this error was raised for, if any.
    pub fn structure(&self) -> Option<Structure> {
        match self {
            Error::Format { structure, .. }
            | Error::ChecksumMismatch { structure, .. }
            | Error::Unsupported { structure, .. }
            | Error::Bounds { structure, .. } => Some(*structure),
            Error::UnsupportedMessage { .. } => Some(Structure::ObjectHeader),
            _ => None,
        }
    }

    /// The file address this error was raised for, if any.
    pub fn address(&self) -> Option<u64> {
        match self {
            Error::Format { address, .. }
            | Error::ChecksumMismatch { address, .. }
            | Error::Unsupported { address, .. }
            | Error::UnsupportedMessage { address, .. }
            | Error::Bounds { address, .. } => Some(*address),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::format(Structure::Superblock, 0, "bad signature");
        assert_eq!(err.to_string(), "Format error in superblock at 0x0: bad signature");

        let err = Error::ChecksumMismatch {
            structure: Structure::ObjectHeader,
            address: 0x60,
            expected: 0x12345678,
            actual: 0x87654321,
        };
        assert!(err.to_string().contains("0x12345678"));
        assert!(err.to_string().contains("object header at 0x60"));
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::format(Structure::LocalHeap, 8, "x").is_format_error());
        assert!(Error::ChecksumMismatch {
            structure: Structure::BTreeV2Node,
            address: 0,
            expected: 1,
            actual: 2
        }
        .is_format_error());
        assert!(Error::UnsupportedMessage { address: 0, message_type: 0x99 }.is_unsupported());
        assert!(Error::bounds(Structure::LocalHeap, 4, "past end").is_bounds_error());
        assert!(!Error::not_found("x").is_format_error());
    }

    #[test]
    fn test_error_context() {
        let err = Error::bounds(Structure::GlobalHeap, 0x1000, "object overruns collection");
        assert_eq!(err.structure(), Some(Structure::GlobalHeap));
        assert_eq!(err.address(), Some(0x1000));
        assert_eq!(Error::invalid_argument("x").address(), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
