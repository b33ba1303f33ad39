// Integration tests for rechunk: correctness across partitions, the two-stage
// memory proof, and stores backed by the filesystem.

use std::sync::Arc;

use chunkflow::api::{self, ones};
use chunkflow::array::{Array, Context};
use chunkflow::block::Block;
use chunkflow::chunks::Chunks;
use chunkflow::config::Spec;
use chunkflow::dtype::DType;
use chunkflow::error::PlanError;
use chunkflow::ops;
use chunkflow::store::{ArrayMeta, ChunkStore, FsStore, MemoryStore};

fn grid(ctx: &Arc<Context>, chunksize: &[usize]) -> Array {
    let data = Block::from_vec(&[4, 6], (0..24i64).collect()).unwrap();
    api::asarray(ctx, data, chunksize).unwrap()
}

fn expected() -> Block {
    Block::from_vec(&[4, 6], (0..24i64).collect()).unwrap()
}

#[test]
fn rows_to_columns() {
    let ctx = Context::new(Spec::new(100_000)).unwrap();
    let a = grid(&ctx, &[1, 6]);
    let b = ops::rechunk(&a, &[4, 1]).unwrap();

    assert_eq!(b.chunks().dims(), &[vec![4], vec![1; 6]]);
    let plan = b.plan();
    let op = plan.op(b.op()).unwrap();
    assert_eq!(op.kind, "rechunk");
    let primitive = op.primitive.as_ref().unwrap();
    assert_eq!(primitive.num_stages(), 2);
    assert!(!primitive.fusable);
    // 24 intermediate blocks of one element, then 6 target columns.
    assert_eq!(primitive.num_tasks, 30);
    assert_eq!(primitive.projected_mem, 128);
    assert_eq!(b.compute().unwrap(), expected());
}

#[test]
fn irregular_to_regular() {
    let ctx = Context::new(Spec::new(100_000)).unwrap();
    let a = grid(&ctx, &[3, 4]);
    let b = ops::rechunk(&a, &[2, 5]).unwrap();
    assert_eq!(b.chunks().dims(), &[vec![2, 2], vec![5, 1]]);
    assert_eq!(b.compute().unwrap(), expected());
}

#[test]
fn same_chunks_still_copies() {
    let ctx = Context::new(Spec::new(100_000)).unwrap();
    let a = grid(&ctx, &[2, 3]);
    let b = ops::rechunk(&a, &[2, 3]).unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(b.chunks(), a.chunks());
    assert_eq!(b.compute().unwrap(), expected());
}

#[test]
fn round_trip_through_other_partitions() {
    let ctx = Context::new(Spec::new(100_000)).unwrap();
    let a = grid(&ctx, &[2, 3]);
    for via in [[4, 6], [2, 3], [1, 1], [3, 4], [4, 1]] {
        let there = ops::rechunk(&a, &via).unwrap();
        let back = ops::rechunk(&there, &[2, 3]).unwrap();
        assert_eq!(back.chunks(), a.chunks());
        assert_eq!(back.compute().unwrap(), expected(), "via {via:?}");
    }
}

#[test]
fn rechunk_respects_budget() {
    let ctx = Context::new(Spec::new(127)).unwrap();
    let a = grid(&ctx, &[1, 6]);
    let err = ops::rechunk(&a, &[4, 1]).unwrap_err();
    assert_eq!(
        err,
        PlanError::MemoryExceeded {
            kind: "rechunk",
            projected: 128,
            allowed: 127,
            reserved: 0,
        }
    );
}

#[test]
fn rechunk_rank_must_match() {
    let ctx = Context::new(Spec::new(100_000)).unwrap();
    let a = ones(&ctx, &[4, 4], &[2, 2], DType::Int64).unwrap();
    assert_eq!(
        ops::rechunk(&a, &[2]).unwrap_err(),
        PlanError::RankMismatch {
            expected: 2,
            found: 1
        }
    );
}

// ── Stores ──────────────────────────────────────────────────────────────────

#[test]
fn work_dir_stores_match_memory_stores() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::new(Spec::new(100_000).with_work_dir(dir.path())).unwrap();
    let a = grid(&ctx, &[1, 6]);
    let b = ops::rechunk(&a, &[4, 1]).unwrap();
    let c = api::negative(&b).unwrap();
    let result = c.compute().unwrap();

    let negated: Vec<i64> = (0..24).map(|v: i64| -v).collect();
    assert_eq!(result, Block::from_vec(&[4, 6], negated).unwrap());

    let on_disk = FsStore::open(dir.path().join(b.id().to_string())).unwrap();
    assert_eq!(on_disk.meta().chunks, *b.chunks());
    assert_eq!(
        on_disk.read_block(&[0, 2]).unwrap(),
        Block::from_vec(&[4, 1], vec![2i64, 8, 14, 20]).unwrap()
    );
}

#[test]
fn from_store_reads_existing_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let meta = ArrayMeta::new(DType::Int64, Chunks::regular(&[4], &[2]).unwrap());
    let store = FsStore::create(dir.path().join("input"), meta).unwrap();
    store
        .write_block(&[0], Block::from_vec(&[2], vec![1i64, 2]).unwrap())
        .unwrap();
    store
        .write_block(&[1], Block::from_vec(&[2], vec![3i64, 4]).unwrap())
        .unwrap();

    let ctx = Context::new(Spec::new(100_000)).unwrap();
    let a = ops::from_store(&ctx, Arc::new(store));
    let b = ops::rechunk(&a, &[4]).unwrap();
    assert_eq!(
        b.compute().unwrap(),
        Block::from_vec(&[4], vec![1i64, 2, 3, 4]).unwrap()
    );
}

#[test]
fn to_store_writes_every_block() {
    let ctx = Context::new(Spec::new(100_000)).unwrap();
    let a = grid(&ctx, &[1, 6]);
    let meta = ArrayMeta::new(DType::Float64, Chunks::regular(&[4, 6], &[2, 2]).unwrap());
    let store = Arc::new(MemoryStore::new("output", meta));
    let b = ops::to_store(&a, store.clone()).unwrap();

    assert_eq!(b.dtype(), DType::Float64);
    let result = b.compute().unwrap();
    assert_eq!(result, expected().astype(DType::Float64));
    assert_eq!(store.num_written(), 6);
}

#[test]
fn to_store_shape_must_match() {
    let ctx = Context::new(Spec::new(100_000)).unwrap();
    let a = grid(&ctx, &[2, 3]);
    let meta = ArrayMeta::new(DType::Int64, Chunks::regular(&[6, 4], &[2, 2]).unwrap());
    let err = ops::to_store(&a, Arc::new(MemoryStore::new("output", meta))).unwrap_err();
    assert!(matches!(err, PlanError::ShapeMismatch { .. }));
}
