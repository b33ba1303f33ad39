// rechunk.rs — The two-stage rechunk primitive
//
// Rewrites an array from one chunk partition to another through an
// intermediate partition: stage 1 copies source → intermediate, stage 2
// copies intermediate → target. Each stage is a many-to-one merge whose
// tasks read every block overlapping their output block.
//
// Preconditions: source and target chunks describe the same shape.
// Postconditions: two stages; `num_tasks` is their sum and `projected_mem`
//                 their maximum.
// Failure modes: no intermediate fits the budget → `MemoryExceeded`
//                (kind `rechunk`); shape mismatch → `ShapeMismatch`.
// Side effects: none.

use std::sync::Arc;

use crate::blockwise::{build_stage, Source};
use crate::chunks::Chunks;
use crate::error::PlanError;
use crate::func::BlockFunction;
use crate::index::{KeyFunction, OverlapKeys};
use crate::memory::MemoryBudget;
use crate::pipeline::{Pipeline, PrimitiveOp, Stage};
use crate::store::{ArrayMeta, StoreHandle};

/// Plan a rechunk of `source` into `target`.
///
/// `intermediate` allocates the staging store for a chosen partition; it is
/// called once per candidate partition tried.
pub fn rechunk(
    source: &Source,
    target: Arc<StoreHandle>,
    intermediate: impl Fn(ArrayMeta) -> Arc<StoreHandle>,
    budget: MemoryBudget,
) -> Result<PrimitiveOp, PlanError> {
    let src = &source.store.meta().chunks;
    let tgt = &target.meta().chunks;
    if src.shape() != tgt.shape() {
        return Err(PlanError::ShapeMismatch {
            expected: src.shape(),
            got: tgt.shape(),
        });
    }

    let mut first_err = None;
    for chunksize in intermediate_candidates(src, tgt) {
        let chunks = Chunks::regular(&src.shape(), &chunksize)?;
        let meta = ArrayMeta::new(source.store.meta().dtype, chunks);
        let staging = intermediate(meta);
        match plan_stages(source, &staging, &target, &budget) {
            Ok((stages, projected_mem)) => {
                let num_tasks = stages.iter().map(Stage::num_tasks).sum();
                tracing::debug!(
                    source = source.store.name(),
                    intermediate = ?chunksize,
                    num_tasks,
                    projected_mem,
                    "planned rechunk"
                );
                return Ok(PrimitiveOp {
                    pipeline: Pipeline { stages },
                    target,
                    projected_mem,
                    budget,
                    num_tasks,
                    fusable: false,
                    num_input_blocks: vec![],
                });
            }
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }
    Err(first_err.unwrap_or(PlanError::MemoryExceeded {
        kind: "rechunk",
        projected: 0,
        allowed: budget.allowed_mem,
        reserved: budget.reserved_mem,
    }))
}

/// Candidate intermediate chunk shapes, in preference order: the
/// element-wise minimum of source and target chunk sizes, then their gcd.
pub fn intermediate_candidates(source: &Chunks, target: &Chunks) -> Vec<Vec<usize>> {
    let src = max_chunksize(source);
    let tgt = max_chunksize(target);
    let min: Vec<usize> = src.iter().zip(&tgt).map(|(&a, &b)| a.min(b).max(1)).collect();
    let gcd: Vec<usize> = src.iter().zip(&tgt).map(|(&a, &b)| gcd(a, b).max(1)).collect();
    if gcd == min {
        vec![min]
    } else {
        vec![min, gcd]
    }
}

fn max_chunksize(chunks: &Chunks) -> Vec<usize> {
    chunks
        .dims()
        .iter()
        .map(|d| d.iter().copied().max().unwrap_or(0))
        .collect()
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn plan_stages(
    source: &Source,
    staging: &Arc<StoreHandle>,
    target: &Arc<StoreHandle>,
    budget: &MemoryBudget,
) -> Result<(Vec<Stage>, u64), PlanError> {
    let src_chunks = source.store.meta().chunks.clone();
    let mid_chunks = staging.meta().chunks.clone();
    let tgt_chunks = target.meta().chunks.clone();

    let (copy_in, mem_in) = build_stage(
        "rechunk-intermediate",
        BlockFunction::Merge {
            source: src_chunks.clone(),
            target: mid_chunks.clone(),
        },
        KeyFunction::Overlap(OverlapKeys::new(src_chunks, mid_chunks.clone())),
        std::slice::from_ref(source),
        staging.clone(),
        budget,
        0,
        "rechunk",
    )?;

    // The intermediate array has no node of its own; it shares the source id.
    let staged = Source::new(source.array, staging.clone());
    let (copy_out, mem_out) = build_stage(
        "rechunk-target",
        BlockFunction::Merge {
            source: mid_chunks.clone(),
            target: tgt_chunks.clone(),
        },
        KeyFunction::Overlap(OverlapKeys::new(mid_chunks, tgt_chunks)),
        &[staged],
        target.clone(),
        budget,
        0,
        "rechunk",
    )?;
    Ok((vec![copy_in, copy_out], mem_in.max(mem_out)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::dtype::DType;
    use crate::id::ArrayId;
    use crate::store::{InMemoryArrayStore, MemoryStoreFactory};

    fn source_4x6() -> (Source, Block) {
        let data = Block::from_vec(&[4, 6], (0..24i64).collect()).unwrap();
        let store = InMemoryArrayStore::new(data.clone(), Chunks::regular(&[4, 6], &[2, 3]).unwrap()).unwrap();
        (
            Source::new(ArrayId(1), Arc::new(StoreHandle::open("src", Arc::new(store)))),
            data,
        )
    }

    fn lazy(name: &str, meta: ArrayMeta) -> Arc<StoreHandle> {
        Arc::new(StoreHandle::lazy(name, meta, Arc::new(MemoryStoreFactory)))
    }

    fn execute(op: &PrimitiveOp) -> Block {
        for stage in &op.pipeline.stages {
            stage.target.create().unwrap();
            for coord in stage.task_coords() {
                stage.run_task(&coord).unwrap();
            }
        }
        op.target.read_all().unwrap()
    }

    #[test]
    fn intermediate_uses_min_then_gcd() {
        let a = Chunks::regular(&[12], &[4]).unwrap();
        let b = Chunks::regular(&[12], &[6]).unwrap();
        assert_eq!(intermediate_candidates(&a, &b), vec![vec![4], vec![2]]);
        assert_eq!(intermediate_candidates(&a, &a), vec![vec![4]]);
    }

    #[test]
    fn two_stages_with_summed_tasks() {
        let (src, data) = source_4x6();
        let target = lazy(
            "tgt",
            ArrayMeta::new(DType::Int64, Chunks::regular(&[4, 6], &[4, 2]).unwrap()),
        );
        let op = rechunk(
            &src,
            target,
            |meta| lazy("tgt-intermediate", meta),
            MemoryBudget::new(100_000, 0).unwrap(),
        )
        .unwrap();
        assert_eq!(op.num_stages(), 2);
        assert!(!op.fusable);
        // Intermediate chunks (2, 2): 2 x 3 blocks; target: 1 x 3 blocks.
        assert_eq!(op.pipeline.stages[0].target.meta().chunks.chunksize(), vec![2, 2]);
        assert_eq!(op.num_tasks, 6 + 3);
        assert_eq!(execute(&op), data);
    }

    #[test]
    fn same_chunks_still_copies() {
        let (src, data) = source_4x6();
        let target = lazy("tgt", src.store.meta().clone());
        let op = rechunk(
            &src,
            target,
            |meta| lazy("tgt-intermediate", meta),
            MemoryBudget::new(100_000, 0).unwrap(),
        )
        .unwrap();
        assert_eq!(op.num_tasks, 4 + 4);
        assert_eq!(execute(&op), data);
    }

    #[test]
    fn tight_budget_is_rejected() {
        let (src, _) = source_4x6();
        let target = lazy(
            "tgt",
            ArrayMeta::new(DType::Int64, Chunks::regular(&[4, 6], &[4, 6]).unwrap()),
        );
        let err = rechunk(
            &src,
            target,
            |meta| lazy("tgt-intermediate", meta),
            MemoryBudget::new(200, 0).unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::MemoryExceeded { kind: "rechunk", .. }));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let (src, _) = source_4x6();
        let target = lazy(
            "tgt",
            ArrayMeta::new(DType::Int64, Chunks::regular(&[4, 5], &[2, 2]).unwrap()),
        );
        let err = rechunk(&src, target, |meta| lazy("i", meta), MemoryBudget::new(1000, 0).unwrap());
        assert!(matches!(err, Err(PlanError::ShapeMismatch { .. })));
    }
}
