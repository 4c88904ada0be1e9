// Fault Injection Tests for h5nav
// These tests feed damaged files to the decoder and check that every failure
// is reported as a typed error rather than a panic or a wrong answer.

use bytes::Bytes;
use h5nav::chunk::FixedArrayBuilder;
use h5nav::io::{FileImage, Sizes, UNDEFINED_ADDRESS};
use h5nav::object::messages::{
    ChunkIndexInfo, ChunkedLayout, DataLayoutMessage, DataspaceMessage, Layout, LinkInfoMessage,
    LinkMessage,
};
use h5nav::object::ObjectHeaderBuilder;
use h5nav::{
    ChunkGeometry, ChunkLocation, Error, File, MemorySource, Message, Options, Structure,
    Superblock,
};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::Arc;

struct Built {
    bytes: Vec<u8>,
    fixed_array: u64,
}

// Version 2 file: root -> "values", a 4x4 dataset of 1-byte elements in 2x2
// chunks indexed by a fixed array.
fn build() -> Built {
    let sizes = Sizes::default();
    let mut image = FileImage::with_reserved(sizes, Superblock::encoded_size(2, sizes));
    let g = ChunkGeometry::fixed(vec![4, 4], vec![2, 2], 1).unwrap();
    let entries: Vec<Option<ChunkLocation>> =
        (0..4u8).map(|i| Some(ChunkLocation::new(image.append(&[i; 4]), 4))).collect();
    let fixed_array = FixedArrayBuilder::new(&g).write(&mut image, &entries).unwrap();
    let layout = ChunkedLayout {
        flags: 0,
        dims: vec![2, 2, 1],
        index: ChunkIndexInfo::FixedArray { page_bits: 10 },
        address: fixed_array,
    };
    let values = ObjectHeaderBuilder::new(2)
        .message(Message::Dataspace(DataspaceMessage::simple(vec![4, 4], None)))
        .message(Message::DataLayout(DataLayoutMessage {
            version: 4,
            layout: Layout::Chunked(layout),
        }))
        .write(&mut image)
        .unwrap();
    let info = LinkInfoMessage {
        max_creation_index: None,
        fractal_heap_address: UNDEFINED_ADDRESS,
        name_index_address: UNDEFINED_ADDRESS,
        creation_order_index_address: None,
    };
    let root = ObjectHeaderBuilder::new(2)
        .message(Message::LinkInfo(info))
        .message(Message::Link(LinkMessage::hard("values", values)))
        .write(&mut image)
        .unwrap();

    let mut superblock = Superblock::new(2, sizes);
    superblock.root_address = root;
    superblock.end_of_file_address = image.len();
    image.write_at(0, &superblock.encode().unwrap());
    Built { bytes: image.as_slice().to_vec(), fixed_array }
}

fn open(bytes: Vec<u8>, options: Options) -> h5nav::Result<File> {
    File::from_source(Arc::new(MemorySource::new(Bytes::from(bytes))), options)
}

/// Test that the intact file navigates
#[test]
fn test_intact_file() {
    let built = build();
    let file = open(built.bytes, Options::default()).unwrap();
    let index = file.chunk_index("/values").unwrap();
    assert_eq!(index.chunks().unwrap().len(), 4);
}

/// Test a flipped bit in the superblock checksum
#[test]
fn test_corrupted_superblock_checksum() {
    let mut bytes = build().bytes;
    let last = Superblock::encoded_size(2, Sizes::default()) - 1;
    bytes[last] ^= 0x01;

    let err = open(bytes.clone(), Options::default()).unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { .. }), "{}", err);
    assert_eq!(err.structure(), Some(Structure::Superblock));

    // accepted once verification is off
    let file = open(bytes, Options::default().verify_checksums(false)).unwrap();
    assert!(file.chunk_index("/values").is_ok());
}

/// Test a corrupted fixed array header checksum
#[test]
fn test_corrupted_index_checksum() {
    let built = build();
    let mut bytes = built.bytes;
    // the header checksum is its last 4 of 28 bytes
    bytes[built.fixed_array as usize + 27] ^= 0xff;

    let file = open(bytes.clone(), Options::default()).unwrap();
    let err = file.chunk_index("/values").unwrap_err();
    assert!(err.is_format_error(), "{}", err);
    assert_eq!(err.structure(), Some(Structure::FixedArrayHeader));
    assert_eq!(err.address(), Some(built.fixed_array));

    // the failure is not cached: a second attempt fails the same way
    let again = file.chunk_index("/values").unwrap_err();
    assert_eq!(again.to_string(), err.to_string());

    let lenient = open(bytes, Options::default().verify_checksums(false)).unwrap();
    assert!(lenient.chunk_index("/values").is_ok());
}

/// Test a damaged signature
#[test]
fn test_corrupted_index_signature() {
    let built = build();
    let mut bytes = built.bytes;
    bytes[built.fixed_array as usize] = b'X';
    let file = open(bytes, Options::default().verify_checksums(false)).unwrap();
    let err = file.chunk_index("/values").unwrap_err();
    assert!(err.is_format_error(), "{}", err);
}

/// Test files cut short at various points
#[test]
fn test_truncated_file() {
    let bytes = build().bytes;
    let superblock_len = Superblock::encoded_size(2, Sizes::default());

    // nothing left of the signature
    let err = open(bytes[..4].to_vec(), Options::default()).unwrap_err();
    assert!(err.is_format_error(), "{}", err);

    // signature but no complete superblock
    let err = open(bytes[..superblock_len - 1].to_vec(), Options::default()).unwrap_err();
    assert!(err.is_bounds_error(), "{}", err);

    // superblock intact, every structure after it missing
    let file = open(bytes[..superblock_len].to_vec(), Options::default()).unwrap();
    let err = file.root_group().unwrap_err();
    assert!(err.is_bounds_error(), "{}", err);
    assert_eq!(err.structure(), Some(Structure::ObjectHeader));
}

/// Test that random bytes are rejected
#[test]
fn test_random_garbage() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..50 {
        let len = rng.random_range(0..4096);
        let mut bytes = vec![0u8; len];
        rng.fill_bytes(&mut bytes);
        assert!(open(bytes, Options::default()).is_err());
    }
}

/// Test random single-byte damage after the superblock
#[test]
fn test_random_damage_never_panics() {
    let built = build();
    let start = Superblock::encoded_size(2, Sizes::default());
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..200 {
        let mut bytes = built.bytes.clone();
        let at = rng.random_range(start..bytes.len());
        bytes[at] = rng.random();
        let file = open(bytes, Options::default()).unwrap();
        // any outcome is fine as long as it is a value or a typed error
        if let Ok(index) = file.chunk_index("/values") {
            let _ = index.chunks();
        }
    }
}

proptest! {
    #[test]
    fn prop_arbitrary_bytes_do_not_panic(bytes in proptest::collection::vec(any::<u8>(), 0..1024)) {
        let _ = open(bytes, Options::default());
    }

    #[test]
    fn prop_damaged_root_group_is_an_error_or_a_group(at in 0usize..256, value in any::<u8>()) {
        let built = build();
        let start = Superblock::encoded_size(2, Sizes::default());
        let mut bytes = built.bytes;
        let at = start + at % (bytes.len() - start);
        bytes[at] = value;
        let file = open(bytes, Options::default().verify_checksums(false)).unwrap();
        let _ = file.root_group().and_then(|group| group.links());
    }
}
