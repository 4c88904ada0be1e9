//! Doubling table geometry of a fractal heap.
//!
//! The managed address space is tiled by rows of `width` blocks. Rows 0 and
//! 1 hold blocks of the starting size; every later row doubles the block
//! size. Rows whose blocks do not exceed the maximum direct block size hold
//! direct blocks; later rows hold indirect blocks, each of which tiles its
//! span with the same schedule starting again from row 0.

/// Precomputed row sizes and offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoublingTable {
    /// Blocks per row.
    pub width: u64,
    /// Size of blocks in rows 0 and 1.
    pub start_block_size: u64,
    /// Largest direct block size.
    pub max_direct_block_size: u64,
    /// log2 of the largest heap offset.
    pub max_heap_bits: u16,
    /// log2 of the starting block size.
    pub start_bits: u32,
    /// log2 of the span of row 0.
    pub first_row_bits: u32,
    /// Rows that hold direct blocks.
    pub max_direct_rows: usize,
    /// Rows a root indirect block can have.
    pub max_root_rows: usize,
    row_block_size: Vec<u64>,
    row_block_offset: Vec<u64>,
}

fn log2(n: u64) -> u32 {
    if n == 0 {
        0
    } else {
        63 - n.leading_zeros()
    }
}

impl DoublingTable {
    /// Builds the table; `None` if the parameters are inconsistent.
    pub fn new(
        width: u16,
        start_block_size: u64,
        max_direct_block_size: u64,
        max_heap_bits: u16,
    ) -> Option<Self> {
        let width = width as u64;
        if width == 0
            || !width.is_power_of_two()
            || !start_block_size.is_power_of_two()
            || !max_direct_block_size.is_power_of_two()
            || max_direct_block_size < start_block_size
            || max_heap_bits == 0
            || max_heap_bits > 64
        {
            return None;
        }
        let start_bits = log2(start_block_size);
        let first_row_bits = start_bits + log2(width);
        let max_direct_rows = (log2(max_direct_block_size) - start_bits + 2) as usize;
        // row 0 must span less than the whole 64-bit offset space
        if first_row_bits >= 64 {
            return None;
        }
        start_block_size.checked_mul(width)?;
        let max_root_rows = (max_heap_bits as u32).checked_sub(first_row_bits)? as usize + 1;

        let mut row_block_size = Vec::with_capacity(max_root_rows);
        let mut row_block_offset = Vec::with_capacity(max_root_rows);
        let mut size = start_block_size;
        let mut offset = 0u64;
        for row in 0..max_root_rows {
            row_block_size.push(size);
            row_block_offset.push(offset);
            offset = offset.saturating_add(size.saturating_mul(width));
            if row > 0 {
                size = size.saturating_mul(2);
            }
        }

        Some(Self {
            width,
            start_block_size,
            max_direct_block_size,
            max_heap_bits,
            start_bits,
            first_row_bits,
            max_direct_rows,
            max_root_rows,
            row_block_size,
            row_block_offset,
        })
    }

    /// Block size of `row`.
    pub fn row_block_size(&self, row: usize) -> Option<u64> {
        self.row_block_size.get(row).copied()
    }

    /// Offset of the first block of `row`, relative to its indirect block.
    pub fn row_block_offset(&self, row: usize) -> Option<u64> {
        self.row_block_offset.get(row).copied()
    }

    /// Row and column of the block containing `offset`, relative to the
    /// start of an indirect block.
    pub fn lookup(&self, offset: u64) -> (usize, u64) {
        if offset < self.start_block_size * self.width {
            return (0, offset / self.start_block_size);
        }
        let high_bit = log2(offset);
        let row = (high_bit - self.first_row_bits + 1) as usize;
        let size = self.row_block_size.get(row).copied().unwrap_or(u64::MAX);
        (row, (offset - (1u64 << high_bit)) / size)
    }

    /// Number of rows of an indirect block sitting in `row`.
    pub fn indirect_rows(&self, row: usize) -> usize {
        let size = self.row_block_size(row).unwrap_or(0);
        (log2(size).saturating_sub(self.first_row_bits) + 1) as usize
    }

    /// Span of heap space covered by an indirect block of `rows` rows.
    pub fn span(&self, rows: usize) -> u64 {
        if rows == 0 {
            return 0;
        }
        let last = rows - 1;
        match (self.row_block_offset(last), self.row_block_size(last)) {
            (Some(offset), Some(size)) => offset.saturating_add(size.saturating_mul(self.width)),
            _ => u64::MAX,
        }
    }

    /// Width in bytes of heap offsets.
    pub fn offset_size(&self) -> usize {
        (self.max_heap_bits as usize).div_ceil(8)
    }

    /// Width in bytes of offsets within the largest direct block.
    pub fn direct_offset_size(&self) -> usize {
        (log2(self.max_direct_block_size) as usize).div_ceil(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table() -> DoublingTable {
        // Library defaults: width 4, 512-byte start, 64 KiB direct, 32-bit heap.
        DoublingTable::new(4, 512, 65_536, 32).unwrap()
    }

    #[test]
    fn test_row_schedule() {
        let t = table();
        assert_eq!(t.max_direct_rows, 9);
        assert_eq!(t.row_block_size(0), Some(512));
        assert_eq!(t.row_block_size(1), Some(512));
        assert_eq!(t.row_block_size(2), Some(1024));
        assert_eq!(t.row_block_size(8), Some(65_536));
        assert_eq!(t.row_block_offset(1), Some(2048));
        assert_eq!(t.row_block_offset(2), Some(4096));
        assert_eq!(t.row_block_offset(3), Some(8192));
    }

    #[test]
    fn test_lookup() {
        let t = table();
        assert_eq!(t.lookup(0), (0, 0));
        assert_eq!(t.lookup(1500), (0, 2));
        assert_eq!(t.lookup(2048), (1, 0));
        assert_eq!(t.lookup(4095), (1, 3));
        assert_eq!(t.lookup(4096 + 1024), (2, 1));
    }

    #[test]
    fn test_indirect_rows() {
        let t = table();
        // Row 9 blocks are 128 KiB: 2^17 spans rows 0..=6 of a child.
        assert_eq!(t.row_block_size(9), Some(131_072));
        assert_eq!(t.indirect_rows(9), 7);
        assert_eq!(t.span(7), 131_072);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(DoublingTable::new(3, 512, 65_536, 32).is_none());
        assert!(DoublingTable::new(4, 1024, 512, 32).is_none());
        assert!(DoublingTable::new(4, 512, 65_536, 0).is_none());
        // row 0 spans 2^64 bytes
        assert!(DoublingTable::new(4, 1 << 62, 1 << 62, 64).is_none());
    }

    #[test]
    fn test_widest_accepted_table() {
        let t = DoublingTable::new(4, 1 << 61, 1 << 61, 64).unwrap();
        assert_eq!(t.first_row_bits, 63);
        assert_eq!(t.lookup(0), (0, 0));
        assert_eq!(t.lookup((1 << 61) * 3), (0, 3));
        assert_eq!(t.lookup(u64::MAX).0, 1);
    }

    proptest! {
        #[test]
        fn prop_lookup_lands_inside_block(offset in 0u64..(1u64 << 24)) {
            let t = table();
            let (row, col) = t.lookup(offset);
            let start = t.row_block_offset(row).unwrap() + col * t.row_block_size(row).unwrap();
            prop_assert!(col < t.width);
            prop_assert!(start <= offset);
            prop_assert!(offset < start + t.row_block_size(row).unwrap());
        }
    }
}
