//! Metadata checksum.
//!
//! Checksummed structures store Bob Jenkins' lookup3 `hashlittle` of every
//! preceding byte of the structure, with an initial value of zero, as a
//! little-endian `u32` trailer. The same hash (over a link or attribute name)
//! keys the dense-storage name indices.

use crate::error::{Error, Result, Structure};

/// Size of a stored checksum in bytes.
pub const CHECKSUM_SIZE: usize = 4;

#[inline]
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

#[inline]
fn finalize(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

#[inline]
fn word(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Computes lookup3 `hashlittle(data, initval)`.
pub fn lookup3(data: &[u8], initval: u32) -> u32 {
    let init = 0xdead_beefu32.wrapping_add(data.len() as u32).wrapping_add(initval);
    let (mut a, mut b, mut c) = (init, init, init);

    let mut rest = data;
    while rest.len() > 12 {
        a = a.wrapping_add(word(&rest[0..4]));
        b = b.wrapping_add(word(&rest[4..8]));
        c = c.wrapping_add(word(&rest[8..12]));
        mix(&mut a, &mut b, &mut c);
        rest = &rest[12..];
    }

    if rest.is_empty() {
        return c;
    }

    // Zero padding contributes nothing to the tail additions.
    let mut tail = [0u8; 12];
    tail[..rest.len()].copy_from_slice(rest);
    a = a.wrapping_add(word(&tail[0..4]));
    b = b.wrapping_add(word(&tail[4..8]));
    c = c.wrapping_add(word(&tail[8..12]));
    finalize(&mut a, &mut b, &mut c);
    c
}

/// Computes the metadata checksum of `data`.
pub fn checksum(data: &[u8]) -> u32 {
    lookup3(data, 0)
}

/// Verifies a structure whose last four bytes are the checksum of the rest.
pub fn verify(block: &[u8], structure: Structure, address: u64) -> Result<()> {
    if block.len() < CHECKSUM_SIZE {
        return Err(Error::bounds(structure, address, "block too short to hold a checksum"));
    }
    let split = block.len() - CHECKSUM_SIZE;
    let expected = word(&block[split..]);
    let actual = checksum(&block[..split]);
    if expected != actual {
        return Err(Error::ChecksumMismatch { structure, address, expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        assert_eq!(lookup3(b"", 0), 0xdeadbeef);
    }

    #[test]
    fn test_reference_vectors() {
        assert_eq!(lookup3(b"Four score and seven years ago", 0), 0x17770551);
        assert_eq!(lookup3(b"Four score and seven years ago", 1), 0xcd628161);
    }

    #[test]
    fn test_exact_multiple_of_twelve() {
        // A 12-byte key takes the tail path, a 24-byte key mixes once first.
        let twelve = lookup3(&[7u8; 12], 0);
        let twenty_four = lookup3(&[7u8; 24], 0);
        assert_ne!(twelve, twenty_four);
    }

    #[test]
    fn test_verify() {
        let mut block = b"TREE some metadata".to_vec();
        let sum = checksum(&block);
        block.extend_from_slice(&sum.to_le_bytes());
        assert!(verify(&block, Structure::BTreeV2Node, 0x40).is_ok());

        block[2] ^= 0xff;
        let err = verify(&block, Structure::BTreeV2Node, 0x40).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { address: 0x40, .. }));
    }
}
