//! Shared decoding context.
//!
//! Every decoder receives a [`Context`]: the byte source, the field widths
//! fixed by the superblock, the base address, options, the decode cache and
//! the filter registry. Contexts are cheap to clone.

use crate::cache::{CacheKey, DecodeCache};
use crate::checksum;
use crate::config::Options;
use crate::error::{Error, Result, Structure};
use crate::filter::FilterRegistry;
use crate::io::{is_defined, ByteSource, FieldCursor, Sizes};
use crate::object::messages::SharedMessageTableMessage;
use bytes::Bytes;
use std::any::Any;
use std::sync::Arc;

/// Everything a decoder needs to read structures from one file.
#[derive(Debug, Clone)]
pub struct Context {
    source: Arc<dyn ByteSource>,
    sizes: Sizes,
    base_address: u64,
    options: Arc<Options>,
    cache: Arc<DecodeCache>,
    filters: Arc<FilterRegistry>,
    shared_table: Option<SharedMessageTableMessage>,
}

impl Context {
    /// Creates a context with default options and a private cache.
    pub fn new(source: Arc<dyn ByteSource>, sizes: Sizes) -> Self {
        let options = Options::default();
        let cache = Arc::new(DecodeCache::new(options.cache_capacity));
        Self {
            source,
            sizes,
            base_address: 0,
            options: Arc::new(options),
            cache,
            filters: Arc::new(FilterRegistry::new()),
            shared_table: None,
        }
    }

    /// Replaces the options; a fresh cache sized by them is created.
    pub fn with_options(mut self, options: Options) -> Self {
        self.cache = Arc::new(DecodeCache::new(options.cache_capacity));
        self.options = Arc::new(options);
        self
    }

    /// Shares an existing cache, e.g. between several files.
    pub fn with_cache(mut self, cache: Arc<DecodeCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Uses the given filter registry.
    pub fn with_filters(mut self, filters: Arc<FilterRegistry>) -> Self {
        self.filters = filters;
        self
    }

    /// Sets the absolute offset that file addresses are relative to.
    pub fn with_base_address(mut self, base_address: u64) -> Self {
        self.base_address = base_address;
        self
    }

    /// Uses the file's shared object header message table for messages
    /// stored in the shared message heap.
    pub fn with_shared_message_table(mut self, table: Option<SharedMessageTableMessage>) -> Self {
        self.shared_table = table;
        self
    }

    /// The byte source.
    pub fn source(&self) -> &Arc<dyn ByteSource> {
        &self.source
    }

    /// Field widths of the file.
    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    /// Absolute offset of address zero.
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// Options in effect.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The decode cache.
    pub fn cache(&self) -> &Arc<DecodeCache> {
        &self.cache
    }

    /// The filter registry.
    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.filters
    }

    /// The shared object header message table, if the file has one.
    pub fn shared_message_table(&self) -> Option<&SharedMessageTableMessage> {
        self.shared_table.as_ref()
    }

    /// Reads `len` bytes of `structure` at file address `address`.
    pub fn read_bytes(&self, address: u64, len: usize, structure: Structure) -> Result<Bytes> {
        if !is_defined(address) {
            return Err(Error::format(structure, address, "undefined address"));
        }
        let absolute = address
            .checked_add(self.base_address)
            .ok_or_else(|| Error::bounds(structure, address, "address overflows"))?;
        let end = absolute.checked_add(len as u64);
        if end.map_or(true, |end| end > self.source.len()) {
            return Err(Error::bounds(
                structure,
                address,
                format!("{} bytes extend past end of file ({} bytes)", len, self.source.len()),
            ));
        }
        self.source.read_at(absolute, len)
    }

    /// Reads `len` bytes of `structure` and returns a cursor over them.
    pub fn read(&self, address: u64, len: usize, structure: Structure) -> Result<FieldCursor> {
        let data = self.read_bytes(address, len, structure)?;
        Ok(FieldCursor::new(data, self.sizes, structure, address))
    }

    /// Like [`Context::read`], also verifying the trailing checksum unless
    /// verification is disabled.
    pub fn read_checked(
        &self,
        address: u64,
        len: usize,
        structure: Structure,
    ) -> Result<FieldCursor> {
        let cursor = self.read(address, len, structure)?;
        self.verify(cursor.buffer(), structure, address)?;
        Ok(cursor)
    }

    /// Verifies a trailing checksum unless verification is disabled.
    pub fn verify(&self, block: &[u8], structure: Structure, address: u64) -> Result<()> {
        if self.options.verify_checksums {
            checksum::verify(block, structure, address)?;
        }
        Ok(())
    }

    /// Cache key for a structure at `address` in this context's source.
    pub fn cache_key(&self, address: u64, structure: Structure) -> CacheKey {
        CacheKey::new(self.source.id(), address, structure)
    }

    /// Returns the cached structure at `address`, decoding it on a miss.
    pub fn cached<T, F>(&self, address: u64, structure: Structure, decode: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T>,
    {
        self.cache.get_or_try_insert_with(self.cache_key(address, structure), decode)
    }
}
