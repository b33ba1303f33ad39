// blockwise.rs — The blockwise primitive
//
// Compiles a block function plus an input-key mapping into a single-stage
// `PrimitiveOp`, after proving every task fits the memory budget.
//
// Preconditions: the target store's chunks are the derived output chunks;
//                source arrays sharing a label have compatible block grids.
// Postconditions: the returned op is fusable and has one task per target
//                 block.
// Failure modes: projected memory above `allowed_mem` → `MemoryExceeded`;
//                operand count mismatch → `OperandCountMismatch`.
// Side effects: none (no store is touched).

use std::sync::Arc;

use crate::error::PlanError;
use crate::func::BlockFunction;
use crate::id::ArrayId;
use crate::index::{BlockwiseKeys, KeyFunction, Label};
use crate::memory::{self, Footprint, MemoryBudget};
use crate::pipeline::{BlockProgram, Operand, Pipeline, PrimitiveOp, Stage};
use crate::store::StoreHandle;

/// A stored array read by a primitive.
#[derive(Debug, Clone)]
pub struct Source {
    pub array: ArrayId,
    pub store: Arc<StoreHandle>,
}

impl Source {
    pub fn new(array: ArrayId, store: Arc<StoreHandle>) -> Self {
        Source { array, store }
    }

    pub(crate) fn footprint(&self) -> Footprint<'_> {
        let meta = self.store.meta();
        Footprint {
            chunks: &meta.chunks,
            itemsize: meta.dtype.itemsize(),
            estimate: self.store.chunk_size_estimate(),
        }
    }

    pub(crate) fn operand(&self) -> Operand {
        Operand::Stored {
            array: self.array,
            store: self.store.clone(),
        }
    }
}

pub(crate) fn target_footprint(target: &StoreHandle) -> Footprint<'_> {
    let meta = target.meta();
    Footprint {
        chunks: &meta.chunks,
        itemsize: meta.dtype.itemsize(),
        estimate: target.chunk_size_estimate(),
    }
}

/// Blockwise operation described by labels: `sources[i]` carries the
/// labels of its dimensions, `out_labels` orders the output dimensions.
pub fn blockwise(
    function: BlockFunction,
    out_labels: &[Label],
    sources: &[(Source, Vec<Label>)],
    target: Arc<StoreHandle>,
    budget: MemoryBudget,
    extra_mem: u64,
) -> Result<PrimitiveOp, PlanError> {
    let grids: Vec<(&[Label], Vec<usize>)> = sources
        .iter()
        .map(|(s, labels)| (labels.as_slice(), s.store.meta().chunks.numblocks()))
        .collect();
    for (labels, numblocks) in &grids {
        if labels.len() != numblocks.len() {
            return Err(PlanError::RankMismatch {
                expected: labels.len(),
                found: numblocks.len(),
            });
        }
    }
    let keys = KeyFunction::Blockwise(BlockwiseKeys::new(out_labels, &grids));
    let sources: Vec<Source> = sources.iter().map(|(s, _)| s.clone()).collect();
    general_blockwise(function, keys, &sources, target, budget, extra_mem)
}

/// Blockwise operation with an arbitrary output-to-input key mapping.
pub fn general_blockwise(
    function: BlockFunction,
    keys: KeyFunction,
    sources: &[Source],
    target: Arc<StoreHandle>,
    budget: MemoryBudget,
    extra_mem: u64,
) -> Result<PrimitiveOp, PlanError> {
    let (stage, projected_mem) = build_stage(
        "blockwise",
        function,
        keys,
        sources,
        target.clone(),
        &budget,
        extra_mem,
        "blockwise",
    )?;
    let num_input_blocks = input_blocks_per_task(&stage.program.keys, sources.len(), &stage);
    let num_tasks = stage.num_tasks();
    Ok(PrimitiveOp {
        pipeline: Pipeline::single(stage),
        target,
        projected_mem,
        budget,
        num_tasks,
        fusable: true,
        num_input_blocks,
    })
}

/// Build one stage and prove its projected memory fits `budget`. Returns
/// the stage with its projected memory.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_stage(
    name: &str,
    function: BlockFunction,
    keys: KeyFunction,
    sources: &[Source],
    target: Arc<StoreHandle>,
    budget: &MemoryBudget,
    extra_mem: u64,
    kind: &'static str,
) -> Result<(Stage, u64), PlanError> {
    let first = target.meta().chunks.grid().next();
    if let Some(coord) = first {
        let found = keys.keys(&coord).len();
        if found != sources.len() {
            return Err(PlanError::OperandCountMismatch {
                expected: sources.len(),
                found,
            });
        }
    }
    let operands = sources.iter().map(Source::operand).collect();
    let stage = Stage {
        name: name.to_string(),
        program: BlockProgram::new(keys, function, operands),
        target,
    };
    let projected = stage_projection(&stage, sources, budget, extra_mem);
    tracing::debug!(
        stage = name,
        target = stage.target.name(),
        projected,
        allowed = budget.allowed_mem,
        "projected task memory"
    );
    budget.check(kind, projected)?;
    Ok((stage, projected))
}

fn stage_projection(
    stage: &Stage,
    sources: &[Source],
    budget: &MemoryBudget,
    extra_mem: u64,
) -> u64 {
    let inputs: Vec<Footprint<'_>> = sources.iter().map(Source::footprint).collect();
    memory::project_op(
        &stage.program.keys,
        &inputs,
        &target_footprint(&stage.target),
        budget.reserved_mem,
        extra_mem,
    )
}

fn input_blocks_per_task(keys: &KeyFunction, n: usize, stage: &Stage) -> Vec<usize> {
    let mut most = vec![0; n];
    for coord in stage.task_coords() {
        for (m, k) in most.iter_mut().zip(keys.keys(&coord)) {
            *m = (*m).max(k.len());
        }
    }
    most
}
