// Chunk lookup benchmarks for h5nav

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use h5nav::btree::{
    BTreeV1Builder, BTreeV2Builder, ChunkKey, Key, KeyLayout, Record, RecordLayout,
};
use h5nav::chunk::{ExtensibleArrayBuilder, ExtensibleArrayParams, FixedArrayBuilder};
use h5nav::io::{FileImage, Sizes};
use h5nav::object::messages::{ChunkIndexInfo, ChunkedLayout, UNLIMITED};
use h5nav::{ChunkGeometry, ChunkIndex, ChunkLocation, Context, Options};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use std::sync::Arc;

struct Indexes {
    fixed: ChunkIndex,
    extensible: ChunkIndex,
    btree_v2: ChunkIndex,
    btree_v1: ChunkIndex,
}

// One 1-D dataset of `count` chunks indexed by each strategy. The chunk
// addresses are synthetic; chunk data is never read.
fn build(count: u64) -> Indexes {
    let sizes = Sizes::default();
    let mut image = FileImage::with_reserved(sizes, 64);
    let fixed_geometry = ChunkGeometry::fixed(vec![count * 8], vec![8], 4).unwrap();
    let growing_geometry =
        ChunkGeometry::new(vec![count * 8], vec![UNLIMITED], vec![8], 4).unwrap();
    let entries: Vec<Option<ChunkLocation>> =
        (0..count).map(|i| Some(ChunkLocation::new(0x1000_0000 + i * 32, 32))).collect();

    let fixed = FixedArrayBuilder::new(&fixed_geometry).write(&mut image, &entries).unwrap();
    let ea_builder =
        ExtensibleArrayBuilder::new(&growing_geometry, ExtensibleArrayParams::default());
    let extensible = ea_builder.write(&mut image, &entries).unwrap();

    let records: Vec<Record> = entries
        .iter()
        .enumerate()
        .map(|(i, l)| Record::Chunk {
            address: l.unwrap().address,
            size: None,
            filter_mask: 0,
            scaled: vec![i as u64],
        })
        .collect();
    let btree_v2 = BTreeV2Builder::new(RecordLayout::chunk(false, sizes, 1, 0))
        .node_size(4096)
        .write(&mut image, &records)
        .unwrap();

    let keys: Vec<(Key, u64)> = entries
        .iter()
        .enumerate()
        .map(|(i, l)| {
            let key = ChunkKey { size: 32, filter_mask: 0, offsets: vec![i as u64 * 8, 0] };
            (Key::Chunk(key), l.unwrap().address)
        })
        .collect();
    let last = Key::Chunk(ChunkKey { size: 0, filter_mask: 0, offsets: vec![count * 8, 0] });
    let btree_v1 =
        BTreeV1Builder::new(KeyLayout::chunk(2), 32).write(&mut image, &keys, last).unwrap();

    let ctx = Context::new(Arc::new(image.into_source()), sizes)
        .with_options(Options::default().cache_capacity(1 << 16));
    let open = |index, address, geometry: &ChunkGeometry| {
        let layout = ChunkedLayout { flags: 0, dims: vec![8, 4], index, address };
        ChunkIndex::open(&ctx, &layout, geometry.clone()).unwrap()
    };
    Indexes {
        fixed: open(ChunkIndexInfo::FixedArray { page_bits: 10 }, fixed, &fixed_geometry),
        extensible: open(ea_builder.info(), extensible, &growing_geometry),
        btree_v2: open(
            ChunkIndexInfo::BTreeV2 { node_size: 4096, split_percent: 100, merge_percent: 40 },
            btree_v2,
            &fixed_geometry,
        ),
        btree_v1: open(ChunkIndexInfo::BTreeV1, btree_v1, &fixed_geometry),
    }
}

fn benchmark_sequential_locate(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_locate");

    for size in [1_000u64, 10_000].iter() {
        let indexes = build(*size);
        group.throughput(Throughput::Elements(*size));
        for (name, index) in [
            ("fixed_array", &indexes.fixed),
            ("extensible_array", &indexes.extensible),
            ("btree_v2", &indexes.btree_v2),
            ("btree_v1", &indexes.btree_v1),
        ] {
            group.bench_with_input(BenchmarkId::new(name, size), size, |b, &size| {
                b.iter(|| {
                    for i in 0..size {
                        black_box(index.locate(&[i]).unwrap());
                    }
                });
            });
        }
    }

    group.finish();
}

fn benchmark_random_locate(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_locate");
    let size = 10_000u64;
    let indexes = build(size);
    let mut rng = StdRng::seed_from_u64(7);
    let targets: Vec<u64> = (0..1000).map(|_| rng.random_range(0..size)).collect();

    group.throughput(Throughput::Elements(targets.len() as u64));
    for (name, index) in [
        ("fixed_array", &indexes.fixed),
        ("extensible_array", &indexes.extensible),
        ("btree_v2", &indexes.btree_v2),
        ("btree_v1", &indexes.btree_v1),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                for &i in &targets {
                    black_box(index.locate(&[i]).unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_sequential_locate, benchmark_random_locate);
criterion_main!(benches);
