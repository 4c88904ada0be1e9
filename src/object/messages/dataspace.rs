//! Dataspace message (0x0001).
//!
//! ```text
//! v1: [version=1][rank][flags][reserved:5][dims: L x rank]
//!     [max dims: L x rank, flags bit 0][permutation: L x rank, flags bit 1]
//! v2: [version=2][rank][flags][type][dims: L x rank][max dims: L x rank, flags bit 0]
//! ```

use crate::error::Result;
use crate::io::{FieldCursor, FieldWriter, Sizes};
use bytes::Bytes;

/// Unlimited maximum dimension.
pub const UNLIMITED: u64 = u64::MAX;

/// Shape class of a dataspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataspaceKind {
    /// A single element.
    Scalar,
    /// A regular N-dimensional array.
    Simple,
    /// No elements at all.
    Null,
}

/// Dataspace message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataspaceMessage {
    /// Encoding version (1 or 2).
    pub version: u8,
    /// Shape class.
    pub kind: DataspaceKind,
    /// Current dimension sizes.
    pub dims: Vec<u64>,
    /// Maximum dimension sizes, [`UNLIMITED`] for unlimited.
    pub max_dims: Option<Vec<u64>>,
}

impl DataspaceMessage {
    /// A version 2 simple dataspace.
    pub fn simple(dims: Vec<u64>, max_dims: Option<Vec<u64>>) -> Self {
        Self { version: 2, kind: DataspaceKind::Simple, dims, max_dims }
    }

    /// A version 2 scalar dataspace.
    pub fn scalar() -> Self {
        Self { version: 2, kind: DataspaceKind::Scalar, dims: vec![], max_dims: None }
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements described.
    pub fn element_count(&self) -> u64 {
        match self.kind {
            DataspaceKind::Null => 0,
            DataspaceKind::Scalar => 1,
            DataspaceKind::Simple => self.dims.iter().product(),
        }
    }

    /// Maximum dimensions, falling back to the current ones.
    pub fn max_dims_or_dims(&self) -> &[u64] {
        self.max_dims.as_deref().unwrap_or(&self.dims)
    }

    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        let version = c.expect_version(&[1, 2])?;
        let rank = c.read_u8()? as usize;
        let flags = c.read_u8()?;

        let kind = if version == 1 {
            c.skip(5)?;
            if rank == 0 {
                DataspaceKind::Scalar
            } else {
                DataspaceKind::Simple
            }
        } else {
            match c.read_u8()? {
                0 => DataspaceKind::Scalar,
                1 => DataspaceKind::Simple,
                2 => DataspaceKind::Null,
                other => return Err(c.format_error(format!("dataspace type {}", other))),
            }
        };

        let read_dim = |c: &mut FieldCursor| -> Result<u64> {
            let width = c.sizes().length_size();
            let value = c.read_uint(width)?;
            if width < 8 && value == (1u64 << (width * 8)) - 1 {
                return Ok(UNLIMITED);
            }
            Ok(value)
        };

        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            dims.push(read_dim(c)?);
        }
        let max_dims = if flags & 0x01 != 0 {
            let mut max = Vec::with_capacity(rank);
            for _ in 0..rank {
                max.push(read_dim(c)?);
            }
            Some(max)
        } else {
            None
        };
        if version == 1 && flags & 0x02 != 0 {
            // Permutation indices were never implemented by writers.
            c.skip(rank * c.sizes().length_size())?;
        }

        Ok(Self { version, kind, dims, max_dims })
    }

    pub(crate) fn encode(&self, sizes: Sizes) -> Bytes {
        let mut w = FieldWriter::new(sizes);
        w.put_u8(self.version);
        w.put_u8(self.dims.len() as u8);
        w.put_u8(if self.max_dims.is_some() { 0x01 } else { 0x00 });
        if self.version == 1 {
            w.put_zeros(5);
        } else {
            w.put_u8(match self.kind {
                DataspaceKind::Scalar => 0,
                DataspaceKind::Simple => 1,
                DataspaceKind::Null => 2,
            });
        }
        for dim in &self.dims {
            w.put_length(*dim);
        }
        if let Some(max) = &self.max_dims {
            for dim in max {
                w.put_length(*dim);
            }
        }
        w.finish()
    }
}
