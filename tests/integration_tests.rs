// Integration tests for h5nav
// Builds complete files with the crate's encoders and navigates them through
// the public File API, from memory and from disk.

use bytes::Bytes;
use h5nav::btree::{
    BTreeV1Builder, BTreeV2Builder, ChunkKey, Key, KeyLayout, Record, RecordLayout,
    SharedMessageRecord, SymbolTableEntry, SymbolTableNode,
};
use h5nav::checksum::lookup3;
use h5nav::chunk::{ExtensibleArrayBuilder, ExtensibleArrayParams, FixedArrayBuilder};
use h5nav::heap::{FractalHeapBuilder, LocalHeapBuilder};
use h5nav::io::{FileImage, Sizes, UNDEFINED_ADDRESS};
use h5nav::object::messages::{
    AttributeInfoMessage, AttributeMessage, ChunkIndexInfo, ChunkedLayout, DataLayoutMessage,
    DataspaceMessage, DatatypeMessage, Layout, LinkInfoMessage, LinkMessage, LinkTarget,
    SharedMessageTableMessage, SymbolTableMessage, UNLIMITED,
};
use h5nav::object::sohm::encode_list;
use h5nav::object::{
    IndexKind, ObjectHeaderBuilder, SharedLocator, SharedMessageIndex, SharedMessageTable,
};
use h5nav::{
    ChunkGeometry, ChunkIndex, ChunkLocation, Error, File, LinkStorage, MemorySource, Message,
    MessageType, ObjectKind, Options, Superblock,
};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

// Writes every chunk of the current extent and returns the locations in
// row-major order. Chunk `i` is filled with byte `i`.
fn write_chunks(image: &mut FileImage, g: &ChunkGeometry) -> Vec<Option<ChunkLocation>> {
    (0..g.scaled_coordinates().len())
        .map(|i| {
            let data = vec![i as u8; g.chunk_byte_size() as usize];
            Some(ChunkLocation::new(image.append(&data), g.chunk_byte_size()))
        })
        .collect()
}

fn chunked(index: ChunkIndexInfo, dims: Vec<u64>, address: u64) -> DataLayoutMessage {
    let version = if index == ChunkIndexInfo::BTreeV1 { 3 } else { 4 };
    let layout = ChunkedLayout { flags: 0, dims, index, address };
    DataLayoutMessage { version, layout: Layout::Chunked(layout) }
}

fn dataset(
    image: &mut FileImage,
    header_version: u8,
    dataspace: DataspaceMessage,
    layout: DataLayoutMessage,
) -> u64 {
    ObjectHeaderBuilder::new(header_version)
        .message(Message::Dataspace(dataspace))
        .message(Message::Datatype(DatatypeMessage::integer(4, true)))
        .message(Message::DataLayout(layout))
        .write(image)
        .unwrap()
}

fn compact_group(image: &mut FileImage, links: Vec<LinkMessage>) -> u64 {
    let info = LinkInfoMessage {
        max_creation_index: None,
        fractal_heap_address: UNDEFINED_ADDRESS,
        name_index_address: UNDEFINED_ADDRESS,
        creation_order_index_address: None,
    };
    links
        .into_iter()
        .fold(ObjectHeaderBuilder::new(2).message(Message::LinkInfo(info)), |b, l| {
            b.message(Message::Link(l))
        })
        .write(image)
        .unwrap()
}

fn finish(mut image: FileImage, mut superblock: Superblock) -> Bytes {
    superblock.end_of_file_address = image.len();
    image.write_at(0, &superblock.encode().unwrap());
    image.into_bytes()
}

fn open(bytes: Bytes) -> File {
    let _ = env_logger::builder().is_test(true).try_init();
    File::from_source(Arc::new(MemorySource::new(bytes)), Options::default()).unwrap()
}

fn attribute(name: &str, value: u32) -> AttributeMessage {
    AttributeMessage::new(
        name,
        DatatypeMessage::integer(4, false),
        DataspaceMessage::scalar(),
        Bytes::copy_from_slice(&value.to_le_bytes()),
    )
}

/// Version 0 file with 4-byte fields: a symbol table root holding a
/// dataset indexed by a v1 B-tree and a soft link to it.
fn legacy_file() -> (Bytes, Vec<Option<ChunkLocation>>) {
    let sizes = Sizes::new(4, 4);
    let mut image = FileImage::with_reserved(sizes, Superblock::encoded_size(0, sizes));

    // 6x6 elements of 2 bytes in 3x2 chunks: a 2x3 grid
    let g = ChunkGeometry::fixed(vec![6, 6], vec![3, 2], 2).unwrap();
    let chunks = write_chunks(&mut image, &g);
    let keys: Vec<(Key, u64)> = g
        .scaled_coordinates()
        .into_iter()
        .zip(&chunks)
        .map(|(scaled, location)| {
            let mut offsets = g.chunk_offset(&scaled);
            offsets.push(0);
            (Key::Chunk(ChunkKey { size: 12, filter_mask: 0, offsets }), location.unwrap().address)
        })
        .collect();
    let last = Key::Chunk(ChunkKey { size: 0, filter_mask: 0, offsets: vec![6, 0, 0] });
    let root = BTreeV1Builder::new(KeyLayout::chunk(3), 2).write(&mut image, &keys, last).unwrap();
    let grid = dataset(
        &mut image,
        1,
        DataspaceMessage::simple(vec![6, 6], None),
        chunked(ChunkIndexInfo::BTreeV1, vec![3, 2, 2], root),
    );

    let mut heap = LocalHeapBuilder::new();
    let grid_name = heap.add("grid");
    let notes_name = heap.add("notes");
    let target = heap.add("/grid");
    let mut notes = SymbolTableEntry::new(notes_name, UNDEFINED_ADDRESS);
    notes.scratch = h5nav::btree::ScratchPad::SoftLink { value_offset: target as u32 };
    let entries = vec![SymbolTableEntry::new(grid_name, grid), notes];
    let node = image.append(&SymbolTableNode { entries }.encode(sizes, 8));
    let heap_address = heap.write(&mut image);
    let btree_address = BTreeV1Builder::new(KeyLayout::group(), 4)
        .write(&mut image, &[(Key::Group(0), node)], Key::Group(notes_name))
        .unwrap();
    let root_group = ObjectHeaderBuilder::new(1)
        .message(Message::SymbolTable(SymbolTableMessage { btree_address, heap_address }))
        .write(&mut image)
        .unwrap();

    let mut superblock = Superblock::new(0, sizes);
    superblock.root_address = root_group;
    (finish(image, superblock), chunks)
}

struct ModernFile {
    bytes: Bytes,
    fixed: Vec<Option<ChunkLocation>>,
    growing: Vec<Option<ChunkLocation>>,
    tree: Vec<Option<ChunkLocation>>,
}

/// Version 2 file: a compact root with fixed array, extensible array, v2
/// B-tree and single chunk datasets, one of them with dense attributes.
fn modern_file() -> ModernFile {
    let sizes = Sizes::default();
    let mut image = FileImage::with_reserved(sizes, Superblock::encoded_size(2, sizes));

    // fixed array: 8x8 of 4 bytes in 2x2 chunks, chunk 5 never written
    let g = ChunkGeometry::fixed(vec![8, 8], vec![2, 2], 4).unwrap();
    let mut fixed = write_chunks(&mut image, &g);
    fixed[5] = None;
    let fa = FixedArrayBuilder::new(&g).page_bits(2).write(&mut image, &fixed).unwrap();

    let stored: Vec<AttributeMessage> =
        (0..20).map(|i| attribute(&format!("calib{:02}", i), i * 10)).collect();
    let mut heap = FractalHeapBuilder::new();
    for a in &stored {
        heap.insert(&Message::Attribute(a.clone()).encode(sizes));
    }
    let (heap_address, ids) = heap.write(&mut image).unwrap();
    let mut records: Vec<Record> = stored
        .iter()
        .zip(&ids)
        .enumerate()
        .map(|(i, (a, id))| {
            let mut heap_id = [0u8; 8];
            heap_id.copy_from_slice(&id[..8]);
            Record::AttributeName {
                heap_id,
                flags: 0,
                creation_order: i as u32,
                hash: lookup3(a.name.as_bytes(), 0),
            }
        })
        .collect();
    records.sort_by_key(|r| match r {
        Record::AttributeName { hash, .. } => *hash,
        _ => 0,
    });
    let name_index_address = BTreeV2Builder::new(RecordLayout::new(8, sizes))
        .node_size(128)
        .write(&mut image, &records)
        .unwrap();
    let fixed_address = ObjectHeaderBuilder::new(2)
        .message(Message::Dataspace(DataspaceMessage::simple(vec![8, 8], None)))
        .message(Message::Datatype(DatatypeMessage::integer(4, true)))
        .message(Message::DataLayout(chunked(
            ChunkIndexInfo::FixedArray { page_bits: 2 },
            vec![2, 2, 4],
            fa,
        )))
        .message(Message::Attribute(attribute("units", 7)))
        .message(Message::AttributeInfo(AttributeInfoMessage {
            max_creation_index: None,
            fractal_heap_address: heap_address,
            name_index_address,
            creation_order_index_address: None,
        }))
        .write(&mut image)
        .unwrap();

    // extensible array: 40 rows so far of an unlimited 1-D series, 4 per chunk
    let series = ChunkGeometry::new(vec![40], vec![UNLIMITED], vec![4], 8).unwrap();
    let growing = write_chunks(&mut image, &series);
    let params = ExtensibleArrayParams {
        index_elements: 2,
        min_elements: 2,
        min_pointers: 2,
        ..Default::default()
    };
    let ea_builder = ExtensibleArrayBuilder::new(&series, params);
    let ea = ea_builder.write(&mut image, &growing).unwrap();
    let growing_address = dataset(
        &mut image,
        2,
        DataspaceMessage::simple(vec![40], Some(vec![UNLIMITED])),
        chunked(ea_builder.info(), vec![4, 8], ea),
    );

    // v2 B-tree: rows unlimited, every other chunk stored
    let wide = ChunkGeometry::new(vec![6, 12], vec![UNLIMITED, 12], vec![3, 3], 1).unwrap();
    let all = write_chunks(&mut image, &wide);
    let tree: Vec<Option<ChunkLocation>> =
        all.into_iter().enumerate().map(|(i, l)| if i % 2 == 0 { l } else { None }).collect();
    let chunk_records: Vec<Record> = wide
        .scaled_coordinates()
        .into_iter()
        .zip(&tree)
        .filter_map(|(scaled, l)| {
            l.map(|l| Record::Chunk { address: l.address, size: None, filter_mask: 0, scaled })
        })
        .collect();
    let bt2 = BTreeV2Builder::new(RecordLayout::chunk(false, sizes, 2, 0))
        .node_size(96)
        .write(&mut image, &chunk_records)
        .unwrap();
    let tree_address = dataset(
        &mut image,
        2,
        DataspaceMessage::simple(vec![6, 12], Some(vec![UNLIMITED, 12])),
        chunked(
            ChunkIndexInfo::BTreeV2 { node_size: 96, split_percent: 100, merge_percent: 40 },
            vec![3, 3, 1],
            bt2,
        ),
    );

    let single_data = image.append(&[9u8; 24]);
    let single_address = dataset(
        &mut image,
        2,
        DataspaceMessage::simple(vec![2, 3], None),
        chunked(ChunkIndexInfo::SingleChunk { filtered: None }, vec![2, 3, 4], single_data),
    );

    let data = compact_group(
        &mut image,
        vec![
            LinkMessage::hard("fixed", fixed_address),
            LinkMessage::hard("growing", growing_address),
            LinkMessage::hard("tree", tree_address),
            LinkMessage::hard("single", single_address),
        ],
    );
    let root = compact_group(
        &mut image,
        vec![
            LinkMessage::hard("data", data),
            LinkMessage::soft("latest", "data/growing"),
            LinkMessage::hard("ghost", 0x10_0000),
        ],
    );
    let mut superblock = Superblock::new(2, sizes);
    superblock.root_address = root;
    ModernFile { bytes: finish(image, superblock), fixed, growing, tree }
}

/// Version 3 file whose superblock extension carries a shared message
/// table; the dataset's datatype lives in the shared message heap.
fn shared_message_file(datatype: &DatatypeMessage) -> Bytes {
    let sizes = Sizes::default();
    let mut image = FileImage::with_reserved(sizes, Superblock::encoded_size(3, sizes));

    let mut heap = FractalHeapBuilder::new();
    let encoded = Message::Datatype(datatype.clone()).encode(sizes);
    heap.insert(&encoded);
    let (heap_address, ids) = heap.write(&mut image).unwrap();
    let mut heap_id = [0u8; 8];
    heap_id.copy_from_slice(&ids[0][..8]);

    let record =
        SharedMessageRecord::Heap { hash: lookup3(&encoded, 0), reference_count: 1, heap_id };
    let list = image.append(&encode_list(&[record], sizes));
    let table = SharedMessageTable {
        address: 0,
        indices: vec![SharedMessageIndex {
            kind: IndexKind::List,
            message_types: 1 << MessageType::Datatype.code(),
            min_message_size: 0,
            list_cutoff: 50,
            btree_cutoff: 40,
            message_count: 1,
            index_address: list,
            heap_address,
        }],
    };
    let table_address = image.append(&table.encode(sizes));
    let extension = ObjectHeaderBuilder::new(2)
        .message(Message::SharedMessageTable(SharedMessageTableMessage {
            table_address,
            index_count: 1,
        }))
        .write(&mut image)
        .unwrap();

    let g = ChunkGeometry::fixed(vec![4], vec![4], datatype_size(datatype)).unwrap();
    let data = image.append(&vec![1u8; g.chunk_byte_size() as usize]);
    let readings = ObjectHeaderBuilder::new(2)
        .message(Message::Dataspace(DataspaceMessage::simple(vec![4], None)))
        .shared_message(MessageType::Datatype, SharedLocator::Heap { heap_id })
        .message(Message::DataLayout(chunked(
            ChunkIndexInfo::Implicit,
            vec![4, g.element_size()],
            data,
        )))
        .write(&mut image)
        .unwrap();
    let root = compact_group(&mut image, vec![LinkMessage::hard("readings", readings)]);

    let mut superblock = Superblock::new(3, sizes);
    superblock.root_address = root;
    superblock.extension_address = extension;
    finish(image, superblock)
}

fn datatype_size(datatype: &DatatypeMessage) -> u64 {
    datatype.size as u64
}

/// Test navigating a version 0 file with a symbol table root group
#[test]
fn test_legacy_file() {
    let (bytes, chunks) = legacy_file();
    let file = open(bytes);
    assert_eq!(file.superblock().version, 0);
    assert_eq!(file.superblock().sizes, Sizes::new(4, 4));
    assert!(file.driver_info().unwrap().is_none());

    let root = file.root_group().unwrap();
    assert!(matches!(root.storage(), LinkStorage::SymbolTable(_)));
    let names: Vec<String> = root.links().unwrap().into_iter().map(|l| l.name).collect();
    assert_eq!(names, vec!["grid", "notes"]);
    assert_eq!(root.link("notes").unwrap().unwrap().target, LinkTarget::Soft("/grid".into()));

    // the soft link lands on the same dataset
    assert_eq!(file.resolve_path("/notes").unwrap(), file.resolve_path("/grid").unwrap());
    assert_eq!(file.open_path("/grid").unwrap().kind(), ObjectKind::Dataset);

    let index = file.chunk_index("/notes").unwrap();
    assert!(matches!(index, ChunkIndex::BTreeV1(_)));
    let found: Vec<Option<ChunkLocation>> =
        index.chunks().unwrap().into_iter().map(|(_, l)| Some(l)).collect();
    assert_eq!(found, chunks);
    // element (4, 5) is in scaled chunk (1, 2), linear 5
    assert_eq!(index.locate_element(&[4, 5]).unwrap(), chunks[5]);
}

/// Test every chunk index of a version 2 file
#[test]
fn test_modern_file_chunk_indexes() {
    let built = modern_file();
    let file = open(built.bytes);

    let fixed = file.chunk_index("/data/fixed").unwrap();
    assert!(matches!(fixed, ChunkIndex::FixedArray(_)));
    assert_eq!(fixed.chunks().unwrap().len(), 15);
    assert_eq!(fixed.locate(&[1, 1]).unwrap(), None);
    assert_eq!(fixed.locate(&[3, 3]).unwrap(), built.fixed[15]);
    // element (7, 0) is in scaled chunk (3, 0), linear 12
    assert_eq!(fixed.locate_element(&[7, 0]).unwrap(), built.fixed[12]);

    let growing = file.chunk_index("/data/growing").unwrap();
    assert!(matches!(growing, ChunkIndex::ExtensibleArray(_)));
    for (i, expected) in built.growing.iter().enumerate() {
        assert_eq!(&growing.locate(&[i as u64]).unwrap(), expected, "chunk {}", i);
    }
    // beyond the current extent but within the unlimited maximum
    assert_eq!(growing.locate(&[10]).unwrap(), None);
    assert_eq!(growing.locate(&[500]).unwrap(), None);

    let tree = file.chunk_index("/data/tree").unwrap();
    assert!(matches!(tree, ChunkIndex::BTreeV2(_)));
    let stored = tree.chunks().unwrap();
    assert_eq!(stored.len(), built.tree.iter().filter(|l| l.is_some()).count());
    for (scaled, location) in stored {
        let linear = scaled[0] as usize * 4 + scaled[1] as usize;
        assert_eq!(Some(location), built.tree[linear]);
    }
    assert_eq!(tree.locate(&[0, 1]).unwrap(), None);

    let single = file.chunk_index("/data/single").unwrap();
    assert_eq!(single.locate(&[0, 0]).unwrap().map(|l| l.size), Some(24));
    assert!(single.locate(&[0, 1]).is_err());
}

/// Test soft links, attributes and error classification on a version 2 file
#[test]
fn test_modern_file_navigation() {
    let file = open(modern_file().bytes);
    assert!(file.extension().is_none());

    let data = file.group("/data").unwrap();
    assert_eq!(data.storage(), &LinkStorage::Compact);
    assert_eq!(data.links().unwrap().len(), 4);
    assert_eq!(file.resolve_path("/latest").unwrap(), file.resolve_path("/data/growing").unwrap());

    let attributes = file.attributes("/data/fixed").unwrap();
    assert!(attributes.is_dense());
    let names = attributes.names().unwrap();
    assert_eq!(names.len(), 21);
    assert_eq!(names[0], "units");
    let calib = attributes.get("calib07").unwrap().unwrap();
    assert_eq!(&calib.data[..], &70u32.to_le_bytes());
    assert_eq!(attributes.get("calib20").unwrap(), None);

    assert!(matches!(file.resolve_path("/data/missing"), Err(Error::NotFound(_))));
    assert!(matches!(file.chunk_index("/data"), Err(Error::InvalidArgument(_))));
    let err = file.open_path("/ghost").unwrap_err();
    assert!(err.is_bounds_error(), "{}", err);
}

/// Test that a message stored in the shared message heap is resolved
#[test]
fn test_shared_datatype() {
    let datatype = DatatypeMessage::integer(8, false);
    let file = open(shared_message_file(&datatype));
    let extension = file.extension().unwrap();
    assert!(extension.get_message::<SharedMessageTableMessage>().is_some());

    let header = file.open_path("/readings").unwrap();
    assert_eq!(header.get_message::<DatatypeMessage>(), Some(&datatype));
    assert!(header.find(MessageType::Datatype).unwrap().shared.is_some());

    let index = file.chunk_index("/readings").unwrap();
    assert!(matches!(index, ChunkIndex::Implicit(_)));
    assert_eq!(index.locate(&[0]).unwrap().map(|l| l.size), Some(32));
}

/// Test opening the same file from disk
#[test]
fn test_open_from_disk() {
    let built = modern_file();
    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(&built.bytes).unwrap();
    tmp.flush().unwrap();

    let file = File::open(tmp.path()).unwrap();
    let index = file.chunk_index("/latest").unwrap();
    assert_eq!(index.locate_element(&[13]).unwrap(), built.growing[3]);

    let memory = open(built.bytes.clone());
    assert_eq!(
        file.chunk_index("/data/fixed").unwrap().chunks().unwrap(),
        memory.chunk_index("/data/fixed").unwrap().chunks().unwrap()
    );
}

/// Test a file preceded by a user block
#[test]
fn test_user_block() {
    let (bytes, chunks) = legacy_file();
    let mut shifted = vec![0u8; 512];
    shifted.extend_from_slice(&bytes);
    let file = open(Bytes::from(shifted));
    assert_eq!(file.superblock().location, 512);
    assert_eq!(file.superblock().base_address, 512);
    assert_eq!(file.chunk_index("/grid").unwrap().locate(&[0, 0]).unwrap(), chunks[0]);
}

/// Test that repeated lookups are served from the decode cache
#[test]
fn test_decode_cache_reuse() {
    let file = open(modern_file().bytes);
    let index = file.chunk_index("/data/tree").unwrap();
    index.locate(&[0, 0]).unwrap();
    index.locate(&[1, 2]).unwrap();
    let cache = file.context().cache();
    let before = cache.stats();
    for _ in 0..10 {
        index.locate(&[0, 0]).unwrap();
        index.locate(&[1, 2]).unwrap();
    }
    let after = cache.stats();
    assert!(after.hits > before.hits);
    assert_eq!(after.misses, before.misses);
}

/// Test configuration loaded from JSON
#[test]
fn test_options_from_json() {
    let options = Options::from_json(r#"{"cache_capacity": 16, "max_shared_depth": 1}"#).unwrap();
    let source = Arc::new(MemorySource::new(modern_file().bytes));
    let file = File::from_source(source, options).unwrap();
    assert_eq!(file.context().cache().capacity(), 16);
    // "/latest" needs a single soft link hop
    assert!(file.resolve_path("/latest").is_ok());

    assert!(matches!(
        Options::from_json(r#"{"max_shared_depth": 0}"#),
        Err(Error::InvalidArgument(_))
    ));
    assert!(Options::from_json("{not json").is_err());
}
