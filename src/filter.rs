//! Pluggable filter pipeline contract.
//!
//! Compression and checksum filters are external collaborators. The engine
//! only reports each chunk's stored size and filter mask; callers register
//! [`Filter`] implementations by numeric identifier and run them through a
//! [`FilterRegistry`]. The fractal heap uses the same registry for filtered
//! direct blocks and huge objects.

use crate::error::{Error, Result, Structure};
use crate::object::messages::FilterPipelineMessage;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identifier of the deflate (zlib) filter.
pub const FILTER_DEFLATE: u16 = 1;
/// Identifier of the byte shuffle filter.
pub const FILTER_SHUFFLE: u16 = 2;
/// Identifier of the Fletcher-32 checksum filter.
pub const FILTER_FLETCHER32: u16 = 3;
/// Identifier of the SZIP filter.
pub const FILTER_SZIP: u16 = 4;
/// Identifier of the N-bit filter.
pub const FILTER_NBIT: u16 = 5;
/// Identifier of the scale-offset filter.
pub const FILTER_SCALEOFFSET: u16 = 6;

/// Which way a filter is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDirection {
    /// Reading: undo the filter.
    Decompress,
    /// Writing: apply the filter.
    Compress,
}

/// A single filter implementation.
pub trait Filter: Send + Sync {
    /// Numeric filter identifier as stored in filter pipeline messages.
    fn id(&self) -> u16;

    /// Transforms `input`.
    ///
    /// `chunk_byte_size` is the unfiltered size of the chunk and
    /// `params` the client data values stored for this filter.
    fn apply(
        &self,
        direction: FilterDirection,
        input: &[u8],
        chunk_byte_size: usize,
        params: &[u32],
    ) -> Result<Vec<u8>>;
}

/// Filters available to a file, keyed by identifier.
#[derive(Default)]
pub struct FilterRegistry {
    filters: RwLock<HashMap<u16, Arc<dyn Filter>>>,
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRegistry").field("ids", &self.ids()).finish()
    }
}

impl FilterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a filter, replacing any previous one with the same id.
    pub fn register(&self, filter: Arc<dyn Filter>) {
        let id = filter.id();
        if self.filters.write().insert(id, filter).is_some() {
            log::debug!("Replaced filter {}", id);
        }
    }

    /// Looks up a filter.
    pub fn get(&self, id: u16) -> Option<Arc<dyn Filter>> {
        self.filters.read().get(&id).cloned()
    }

    /// Returns true if a filter with this id is registered.
    pub fn contains(&self, id: u16) -> bool {
        self.filters.read().contains_key(&id)
    }

    /// Registered identifiers in ascending order.
    pub fn ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.filters.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Runs a whole pipeline over one chunk or block.
    ///
    /// Bit `i` of `filter_mask` set means filter `i` of the pipeline was
    /// skipped when the data was written. Decompression walks the pipeline
    /// in reverse order.
    pub fn apply_pipeline(
        &self,
        pipeline: &FilterPipelineMessage,
        filter_mask: u32,
        direction: FilterDirection,
        input: Bytes,
        chunk_byte_size: usize,
    ) -> Result<Bytes> {
        let order: Vec<usize> = match direction {
            FilterDirection::Compress => (0..pipeline.filters.len()).collect(),
            FilterDirection::Decompress => (0..pipeline.filters.len()).rev().collect(),
        };

        let mut data = input;
        for index in order {
            if index < 32 && filter_mask & (1 << index) != 0 {
                continue;
            }
            let description = &pipeline.filters[index];
            let Some(filter) = self.get(description.id) else {
                return Err(Error::unsupported(
                    Structure::Filter,
                    0,
                    format!("filter {} is not registered", description.id),
                ));
            };
            let out =
                filter.apply(direction, &data, chunk_byte_size, &description.client_data)?;
            data = Bytes::from(out);
        }
        Ok(data)
    }
}
