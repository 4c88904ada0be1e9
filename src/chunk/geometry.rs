//! Chunk grid arithmetic shared by every index strategy.

use crate::error::{Error, Result, Structure};
use crate::object::messages::{ChunkedLayout, DataspaceMessage, UNLIMITED};

/// Shape of a chunked dataset: extents, chunk shape and element size.
///
/// Coordinates passed to an index are *scaled*: element coordinates divided
/// element-wise by the chunk dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGeometry {
    dims: Vec<u64>,
    max_dims: Vec<u64>,
    chunk_dims: Vec<u64>,
    element_size: u64,
    chunk_bytes: u64,
}

fn checked_chunk_bytes(chunk_dims: &[u64], element_size: u64) -> Option<u64> {
    chunk_dims.iter().try_fold(element_size, |acc, &d| acc.checked_mul(d))
}

impl ChunkGeometry {
    /// Creates a geometry; `max_dims` entries may be [`UNLIMITED`].
    pub fn new(
        dims: Vec<u64>,
        max_dims: Vec<u64>,
        chunk_dims: Vec<u64>,
        element_size: u64,
    ) -> Result<Self> {
        if dims.len() != max_dims.len() || dims.len() != chunk_dims.len() {
            return Err(Error::invalid_argument(format!(
                "rank mismatch: dims {}, max dims {}, chunk dims {}",
                dims.len(),
                max_dims.len(),
                chunk_dims.len()
            )));
        }
        if chunk_dims.iter().any(|&d| d == 0) || element_size == 0 {
            return Err(Error::invalid_argument(
                "chunk dimensions and element size must be positive",
            ));
        }
        if dims.iter().zip(&max_dims).any(|(d, m)| d > m) {
            return Err(Error::invalid_argument("dimension exceeds its maximum"));
        }
        let chunk_bytes = checked_chunk_bytes(&chunk_dims, element_size).ok_or_else(|| {
            Error::bounds(Structure::ChunkIndex, 0, "chunk byte size overflows 64 bits")
        })?;
        Ok(Self { dims, max_dims, chunk_dims, element_size, chunk_bytes })
    }

    /// A geometry whose maximum extent equals its current extent.
    pub fn fixed(dims: Vec<u64>, chunk_dims: Vec<u64>, element_size: u64) -> Result<Self> {
        let max_dims = dims.clone();
        Self::new(dims, max_dims, chunk_dims, element_size)
    }

    /// Geometry of a dataset from its dataspace and chunked layout.
    pub fn from_messages(dataspace: &DataspaceMessage, layout: &ChunkedLayout) -> Result<Self> {
        if dataspace.rank() != layout.rank() {
            return Err(Error::format(
                Structure::ChunkIndex,
                layout.address,
                format!("dataspace rank {} but chunk rank {}", dataspace.rank(), layout.rank()),
            ));
        }
        if layout.chunk_byte_size().is_none() {
            return Err(Error::bounds(
                Structure::ChunkIndex,
                layout.address,
                format!("chunk of {:?} elements overflows 64 bits", layout.chunk_dims()),
            ));
        }
        Self::new(
            dataspace.dims.clone(),
            dataspace.max_dims_or_dims().to_vec(),
            layout.chunk_dims().to_vec(),
            layout.element_size(),
        )
        .map_err(|e| Error::format(Structure::ChunkIndex, layout.address, e.to_string()))
    }

    /// Dataset rank.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Current extent.
    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    /// Maximum extent.
    pub fn max_dims(&self) -> &[u64] {
        &self.max_dims
    }

    /// Chunk shape in elements.
    pub fn chunk_dims(&self) -> &[u64] {
        &self.chunk_dims
    }

    /// Element size in bytes.
    pub fn element_size(&self) -> u64 {
        self.element_size
    }

    /// Unfiltered chunk size in bytes.
    pub fn chunk_byte_size(&self) -> u64 {
        self.chunk_bytes
    }

    /// Width of the stored size field of a filtered chunk entry.
    pub fn chunk_size_len(&self) -> usize {
        let bits = 63 - self.chunk_byte_size().max(1).leading_zeros() as usize;
        (1 + (bits + 8) / 8).min(8)
    }

    /// Number of chunks along each dimension of the current extent.
    pub fn scaled_dims(&self) -> Vec<u64> {
        self.dims.iter().zip(&self.chunk_dims).map(|(d, c)| d.div_ceil(*c)).collect()
    }

    /// Number of chunks along each dimension of the maximum extent;
    /// unlimited dimensions stay [`UNLIMITED`].
    pub fn scaled_max_dims(&self) -> Vec<u64> {
        self.max_dims
            .iter()
            .zip(&self.chunk_dims)
            .map(|(m, c)| if *m == UNLIMITED { UNLIMITED } else { m.div_ceil(*c) })
            .collect()
    }

    /// The last unlimited dimension, if any.
    pub fn unlimited_dim(&self) -> Option<usize> {
        self.max_dims.iter().rposition(|&m| m == UNLIMITED)
    }

    /// Scaled coordinate of the chunk holding element `coordinate`.
    pub fn scaled(&self, coordinate: &[u64]) -> Result<Vec<u64>> {
        if coordinate.len() != self.rank() {
            return Err(Error::invalid_argument(format!(
                "coordinate of rank {} for a rank {} dataset",
                coordinate.len(),
                self.rank()
            )));
        }
        Ok(coordinate.iter().zip(&self.chunk_dims).map(|(x, c)| x / c).collect())
    }

    /// Element offset of the first element of chunk `scaled`.
    pub fn chunk_offset(&self, scaled: &[u64]) -> Vec<u64> {
        scaled.iter().zip(&self.chunk_dims).map(|(s, c)| s.saturating_mul(*c)).collect()
    }

    /// Rejects coordinates of the wrong rank or beyond the maximum extent.
    pub fn check(&self, scaled: &[u64]) -> Result<()> {
        if scaled.len() != self.rank() {
            return Err(Error::invalid_argument(format!(
                "scaled coordinate of rank {} for a rank {} dataset",
                scaled.len(),
                self.rank()
            )));
        }
        let max = self.scaled_max_dims();
        if let Some(dim) = (0..scaled.len()).find(|&i| max[i] != UNLIMITED && scaled[i] >= max[i]) {
            return Err(Error::invalid_argument(format!(
                "chunk coordinate {:?} outside grid {:?} in dimension {}",
                scaled, max, dim
            )));
        }
        Ok(())
    }

    // Scaled max dims with the unlimited dimension moved to the front, so
    // the linear index grows along it.
    fn swizzled_max(&self) -> (Option<usize>, Vec<u64>) {
        let mut max = self.scaled_max_dims();
        let unlimited = self.unlimited_dim().filter(|&d| d > 0);
        if let Some(dim) = unlimited {
            let value = max.remove(dim);
            max.insert(0, value);
        }
        (unlimited, max)
    }

    fn strides(max: &[u64]) -> Result<Vec<u64>> {
        let mut strides = vec![1u64; max.len()];
        for i in (0..max.len().saturating_sub(1)).rev() {
            if max[i + 1] == UNLIMITED {
                return Err(Error::unsupported(
                    Structure::ChunkIndex,
                    0,
                    "more than one unlimited dimension in a linear chunk index",
                ));
            }
            strides[i] = strides[i + 1]
                .checked_mul(max[i + 1])
                .ok_or_else(|| Error::invalid_argument("chunk grid overflows"))?;
        }
        Ok(strides)
    }

    /// Row-major index of chunk `scaled` in the maximum chunk grid.
    ///
    /// An unlimited dimension other than the first is moved to the front
    /// before linearizing.
    pub fn linear_index(&self, scaled: &[u64]) -> Result<u64> {
        self.check(scaled)?;
        let (unlimited, max) = self.swizzled_max();
        let mut coords = scaled.to_vec();
        if let Some(dim) = unlimited {
            let value = coords.remove(dim);
            coords.insert(0, value);
        }
        let strides = Self::strides(&max)?;
        coords.iter().zip(&strides).try_fold(0u64, |acc, (c, s)| {
            c.checked_mul(*s)
                .and_then(|v| acc.checked_add(v))
                .ok_or_else(|| Error::invalid_argument("chunk index overflows"))
        })
    }

    /// Inverse of [`ChunkGeometry::linear_index`].
    pub fn scaled_from_linear(&self, index: u64) -> Result<Vec<u64>> {
        let (unlimited, max) = self.swizzled_max();
        let strides = Self::strides(&max)?;
        let mut rest = index;
        let mut coords: Vec<u64> = strides
            .iter()
            .map(|s| {
                let c = rest / s;
                rest %= s;
                c
            })
            .collect();
        if let Some(dim) = unlimited {
            let value = coords.remove(0);
            coords.insert(dim, value);
        }
        Ok(coords)
    }

    /// Number of chunks in the maximum grid; fails for unlimited datasets.
    pub fn max_chunk_count(&self) -> Result<u64> {
        self.scaled_max_dims().iter().try_fold(1u64, |acc, &d| {
            if d == UNLIMITED {
                return Err(Error::invalid_argument("unlimited dataset has no fixed chunk count"));
            }
            acc.checked_mul(d).ok_or_else(|| Error::invalid_argument("chunk count overflows"))
        })
    }

    /// Every scaled coordinate of the current extent in row-major order.
    pub fn scaled_coordinates(&self) -> Vec<Vec<u64>> {
        let dims = self.scaled_dims();
        if dims.iter().any(|&d| d == 0) {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut current = vec![0u64; dims.len()];
        loop {
            out.push(current.clone());
            let mut i = dims.len();
            loop {
                if i == 0 {
                    return out;
                }
                i -= 1;
                current[i] += 1;
                if current[i] < dims[i] {
                    break;
                }
                current[i] = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::messages::ChunkIndexInfo;
    use proptest::prelude::*;

    #[test]
    fn test_scaled_arithmetic() {
        let g = ChunkGeometry::fixed(vec![10, 7], vec![4, 3], 8).unwrap();
        assert_eq!(g.scaled_dims(), vec![3, 3]);
        assert_eq!(g.scaled(&[9, 6]).unwrap(), vec![2, 2]);
        assert_eq!(g.chunk_offset(&[2, 1]), vec![8, 3]);
        assert_eq!(g.chunk_byte_size(), 96);
        assert_eq!(g.linear_index(&[1, 2]).unwrap(), 5);
        assert!(g.check(&[3, 0]).is_err());
        assert!(g.scaled(&[1]).is_err());
    }

    #[test]
    fn test_chunk_size_len() {
        let width = |bytes: u64| {
            ChunkGeometry::fixed(vec![bytes], vec![bytes], 1).unwrap().chunk_size_len()
        };
        assert_eq!(width(1), 2);
        assert_eq!(width(255), 2);
        assert_eq!(width(256), 3);
        assert_eq!(width(65535), 3);
        assert_eq!(width(65536), 4);
    }

    #[test]
    fn test_oversized_chunk_is_rejected() {
        let err = ChunkGeometry::fixed(vec![1 << 20; 4], vec![1 << 20; 4], 8).unwrap_err();
        assert!(err.is_bounds_error());
        assert_eq!(err.structure(), Some(Structure::ChunkIndex));

        // the largest chunk that still fits
        let g = ChunkGeometry::fixed(vec![1 << 20; 3], vec![1 << 20; 3], 1 << 3).unwrap();
        assert_eq!(g.chunk_byte_size(), 1 << 63);
        assert_eq!(g.chunk_size_len(), 8);
        assert_eq!(g.chunk_offset(&[u64::MAX, 1, 0]), vec![u64::MAX, 1 << 20, 0]);
    }

    #[test]
    fn test_oversized_chunk_in_layout_message() {
        let dataspace = DataspaceMessage::simple(vec![1 << 20; 4], None);
        let layout = ChunkedLayout {
            flags: 0,
            dims: vec![1 << 20, 1 << 20, 1 << 20, 1 << 20, 8],
            index: ChunkIndexInfo::Implicit,
            address: 0x400,
        };
        let err = ChunkGeometry::from_messages(&dataspace, &layout).unwrap_err();
        assert!(err.is_bounds_error());
        assert_eq!(err.address(), Some(0x400));
    }

    #[test]
    fn test_unlimited_dimension_moves_first() {
        let g = ChunkGeometry::new(vec![4, 6], vec![4, UNLIMITED], vec![2, 2], 1).unwrap();
        assert_eq!(g.unlimited_dim(), Some(1));
        // swizzled grid is [unlimited, 2]
        assert_eq!(g.linear_index(&[0, 0]).unwrap(), 0);
        assert_eq!(g.linear_index(&[1, 0]).unwrap(), 1);
        assert_eq!(g.linear_index(&[0, 1]).unwrap(), 2);
        assert_eq!(g.linear_index(&[1, 5]).unwrap(), 11);
        assert!(g.max_chunk_count().is_err());
    }

    #[test]
    fn test_two_unlimited_dimensions_are_unsupported() {
        let g = ChunkGeometry::new(vec![4, 6], vec![UNLIMITED, UNLIMITED], vec![2, 2], 1).unwrap();
        assert!(g.linear_index(&[0, 0]).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_scaled_coordinates_order() {
        let g = ChunkGeometry::fixed(vec![4, 3], vec![2, 2], 1).unwrap();
        assert_eq!(
            g.scaled_coordinates(),
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
        let empty = ChunkGeometry::new(vec![0, 3], vec![UNLIMITED, 3], vec![2, 2], 1).unwrap();
        assert!(empty.scaled_coordinates().is_empty());
    }

    proptest! {
        #[test]
        fn prop_linear_index_inverts(
            dims in prop::collection::vec(1u64..20, 1..4),
            chunk in 1u64..5,
            unlimited in any::<bool>(),
        ) {
            let chunk_dims = vec![chunk; dims.len()];
            let mut max_dims = dims.clone();
            if unlimited {
                let last = max_dims.len() - 1;
                max_dims[last] = UNLIMITED;
            }
            let g = ChunkGeometry::new(dims, max_dims, chunk_dims, 4).unwrap();
            let mut seen = std::collections::HashSet::new();
            for scaled in g.scaled_coordinates() {
                let index = g.linear_index(&scaled).unwrap();
                prop_assert!(seen.insert(index));
                prop_assert_eq!(g.scaled_from_linear(index).unwrap(), scaled);
            }
        }
    }
}
