//! Writes version 1 B-trees from leaf entries already in key order.

use super::v1::{Key, KeyLayout, NodeType, SIGNATURE};
use crate::error::{Error, Result};
use crate::io::{FileImage, UNDEFINED_ADDRESS};

/// Bulk-loads a version 1 B-tree, filling nodes left to right.
#[derive(Debug, Clone)]
pub struct BTreeV1Builder {
    layout: KeyLayout,
    k: usize,
}

impl BTreeV1Builder {
    /// A builder for nodes of at most `2k` entries.
    pub fn new(layout: KeyLayout, k: usize) -> Self {
        Self { layout, k: k.max(1) }
    }

    /// Writes the tree and returns the root node address.
    ///
    /// `entries` pairs each child with the key to its left; `last_key`
    /// bounds the final child on the right.
    pub fn write(
        &self,
        image: &mut FileImage,
        entries: &[(Key, u64)],
        last_key: Key,
    ) -> Result<u64> {
        for pair in entries.windows(2) {
            if let (Some(a), Some(b)) = (pair[0].0.as_chunk(), pair[1].0.as_chunk()) {
                if a.offsets >= b.offsets {
                    return Err(Error::invalid_argument("chunk keys out of order"));
                }
            }
        }

        let sizes = image.sizes();
        let node_size = self.layout.node_size(sizes, self.k);
        let fanout = 2 * self.k;
        let mut level: u8 = 0;
        let mut current: Vec<(Key, u64)> = entries.to_vec();

        loop {
            let parents: Vec<(Key, u64)> = {
                let groups: Vec<&[(Key, u64)]> = if current.is_empty() {
                    vec![&current[..]]
                } else {
                    current.chunks(fanout).collect()
                };
                let addresses: Vec<u64> =
                    groups.iter().map(|_| image.allocate(node_size)).collect();

                for (i, group) in groups.iter().enumerate() {
                    let closing = groups
                        .get(i + 1)
                        .and_then(|next| next.first())
                        .map(|(key, _)| key)
                        .unwrap_or(&last_key);
                    let mut w = image.writer();
                    w.put_slice(SIGNATURE);
                    w.put_u8(match self.layout.node_type {
                        NodeType::Group => 0,
                        NodeType::Chunk => 1,
                    });
                    w.put_u8(level);
                    w.put_u16(group.len() as u16);
                    w.put_offset(if i > 0 { addresses[i - 1] } else { UNDEFINED_ADDRESS });
                    w.put_offset(addresses.get(i + 1).copied().unwrap_or(UNDEFINED_ADDRESS));
                    for (key, child) in group.iter() {
                        self.layout.encode(key, &mut w);
                        w.put_offset(*child);
                    }
                    self.layout.encode(closing, &mut w);
                    w.pad_to(node_size);
                    image.write_at(addresses[i], &w.finish());
                }

                if addresses.len() == 1 {
                    return Ok(addresses[0]);
                }
                groups
                    .iter()
                    .zip(&addresses)
                    .map(|(group, address)| (group[0].0.clone(), *address))
                    .collect()
            };
            current = parents;
            level = level
                .checked_add(1)
                .ok_or_else(|| Error::invalid_argument("tree deeper than 255 levels"))?;
        }
    }
}
