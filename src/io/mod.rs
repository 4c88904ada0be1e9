//! Byte sources and field-level codecs.
//!
//! The engine never owns a file. It consumes a [`ByteSource`] that answers
//! absolute-offset reads, and decodes structures out of the returned buffers
//! with a width-aware [`FieldCursor`]. Encoders go the other way through
//! [`FieldWriter`] and assemble whole files in a [`FileImage`].
//!
//! All multi-byte integers are little-endian.

pub mod cursor;
pub mod writer;

pub use cursor::{is_defined, FieldCursor, Sizes, UNDEFINED_ADDRESS};
pub use writer::{FieldWriter, FileImage};

use crate::error::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a byte source, used to key shared decode caches.
pub type SourceId = u64;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique source identity.
pub fn next_source_id() -> SourceId {
    NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// An addressable byte source supporting absolute-offset reads.
///
/// Implementations must allow concurrent `read_at` calls from multiple
/// threads if the engine is used concurrently.
pub trait ByteSource: Send + Sync + fmt::Debug {
    /// Reads exactly `len` bytes starting at absolute `offset`.
    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes>;

    /// Total length of the source in bytes.
    fn len(&self) -> u64;

    /// Returns true if the source holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stable identity of this source.
    fn id(&self) -> SourceId;
}

fn short_read(offset: u64, len: usize, total: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("read of {} bytes at {:#x} past end of source ({} bytes)", len, offset, total),
    )
}

/// A byte source over an in-memory buffer.
#[derive(Debug, Clone)]
pub struct MemorySource {
    id: SourceId,
    data: Bytes,
}

impl MemorySource {
    /// Wraps a buffer.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { id: next_source_id(), data: data.into() }
    }

    /// The underlying buffer.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

impl ByteSource for MemorySource {
    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let total = self.data.len() as u64;
        let end = offset.checked_add(len as u64).filter(|end| *end <= total);
        match end {
            Some(end) => Ok(self.data.slice(offset as usize..end as usize)),
            None => Err(short_read(offset, len, total).into()),
        }
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn id(&self) -> SourceId {
        self.id
    }
}

/// A byte source over a file on disk.
///
/// Reads are serialized through a mutex around the seek position.
#[derive(Debug)]
pub struct FileSource {
    id: SourceId,
    file: Mutex<File>,
    len: u64,
}

impl FileSource {
    /// Opens the file at `path` for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::from_file(file)
    }

    /// Wraps an already opened file.
    pub fn from_file(file: File) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self { id: next_source_id(), file: Mutex::new(file), len })
    }
}

impl ByteSource for FileSource {
    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        if offset.checked_add(len as u64).map_or(true, |end| end > self.len) {
            return Err(short_read(offset, len, self.len).into());
        }
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn id(&self) -> SourceId {
        self.id
    }
}

/// A positioned reader over a byte source.
///
/// Offers the seek / read / position contract used while the field widths of
/// the file are still unknown, during superblock bootstrap.
pub struct SourceReader<'a> {
    source: &'a dyn ByteSource,
    position: u64,
}

impl<'a> SourceReader<'a> {
    /// Creates a reader positioned at offset 0.
    pub fn new(source: &'a dyn ByteSource) -> Self {
        Self { source, position: 0 }
    }

    /// Moves to an absolute offset.
    pub fn seek(&mut self, offset: u64) {
        self.position = offset;
    }

    /// Current absolute offset.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads `count` bytes and advances.
    pub fn read_bytes(&mut self, count: usize) -> Result<Bytes> {
        let bytes = self.source.read_at(self.position, count)?;
        self.position += count as u64;
        Ok(bytes)
    }

    /// Reads a `u8` and advances.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Reads a little-endian `u16` and advances.
    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Reads a little-endian `u32` and advances.
    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a little-endian `u64` and advances.
    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&b);
        Ok(u64::from_le_bytes(raw))
    }
}
