// memory.rs — Per-task memory projection
//
// Every task's worst-case resident memory is computed before the plan runs:
//
//   reserved + Σ inputs (compressed + uncompressed) + output (compressed +
//   uncompressed) + extra
//
// An operation's projected memory is the maximum over its tasks. Exceeding
// the allowed budget is a plan-build error, never a run-time discovery.

use serde::{Deserialize, Serialize};

use crate::chunks::Chunks;
use crate::error::PlanError;
use crate::index::{InputKeys, KeyFunction};
use crate::store::ChunkSizeEstimate;

/// Hard memory limits for a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBudget {
    pub allowed_mem: u64,
    pub reserved_mem: u64,
}

impl MemoryBudget {
    pub fn new(allowed_mem: u64, reserved_mem: u64) -> Result<Self, PlanError> {
        if reserved_mem >= allowed_mem {
            return Err(PlanError::InvalidBudget {
                allowed: allowed_mem,
                reserved: reserved_mem,
            });
        }
        Ok(MemoryBudget {
            allowed_mem,
            reserved_mem,
        })
    }

    /// Memory left for blocks once the reserved overhead is accounted for.
    pub fn available(&self) -> u64 {
        self.allowed_mem.saturating_sub(self.reserved_mem)
    }

    /// Fail unless `projected` (which includes `reserved_mem`) fits.
    pub fn check(&self, kind: &'static str, projected: u64) -> Result<(), PlanError> {
        if projected > self.allowed_mem {
            return Err(PlanError::MemoryExceeded {
                kind,
                projected,
                allowed: self.allowed_mem,
                reserved: self.reserved_mem,
            });
        }
        Ok(())
    }
}

/// Compressed plus uncompressed footprint of one block of `elements`.
pub fn block_footprint(elements: usize, itemsize: usize, estimate: ChunkSizeEstimate) -> u64 {
    let uncompressed = (elements as u128) * (itemsize as u128);
    let compressed = if estimate.uncompressed == 0 {
        uncompressed
    } else {
        uncompressed * estimate.compressed as u128 / estimate.uncompressed as u128
    };
    u64::try_from(uncompressed + compressed).unwrap_or(u64::MAX)
}

/// What the projection needs to know about one array.
#[derive(Debug, Clone, Copy)]
pub struct Footprint<'a> {
    pub chunks: &'a Chunks,
    pub itemsize: usize,
    pub estimate: ChunkSizeEstimate,
}

impl Footprint<'_> {
    fn block(&self, coord: &[usize]) -> u64 {
        block_footprint(self.chunks.block_elements(coord), self.itemsize, self.estimate)
    }

    fn keys(&self, keys: &InputKeys) -> u64 {
        keys.coords().into_iter().map(|c| self.block(c)).sum()
    }
}

/// Projected memory of the task writing output block `out_coord`.
pub fn project_task(
    keys: &KeyFunction,
    out_coord: &[usize],
    inputs: &[Footprint<'_>],
    output: &Footprint<'_>,
    reserved_mem: u64,
    extra_mem: u64,
) -> u64 {
    let read: u64 = keys
        .keys(out_coord)
        .iter()
        .zip(inputs)
        .map(|(k, fp)| fp.keys(k))
        .sum();
    reserved_mem + read + output.block(out_coord) + extra_mem
}

/// Maximum projected memory over every task writing `output`.
pub fn project_op(
    keys: &KeyFunction,
    inputs: &[Footprint<'_>],
    output: &Footprint<'_>,
    reserved_mem: u64,
    extra_mem: u64,
) -> u64 {
    output
        .chunks
        .grid()
        .map(|coord| project_task(keys, &coord, inputs, output, reserved_mem, extra_mem))
        .max()
        .unwrap_or(reserved_mem + extra_mem)
}

/// How many blocks of `chunk_mem` bytes one reduction round may merge.
///
/// A round reads and writes up to `k` blocks, compressed and uncompressed,
/// so `k = available / (4 × chunk_mem)`. Fewer than two blocks per round
/// would never finish.
pub fn merge_factor(budget: &MemoryBudget, chunk_mem: u64) -> Result<usize, PlanError> {
    let per_block = chunk_mem.max(1).saturating_mul(4);
    let k = budget.available() / per_block;
    if k < 2 {
        return Err(PlanError::MemoryExceeded {
            kind: "reduction",
            projected: budget.reserved_mem.saturating_add(per_block.saturating_mul(2)),
            allowed: budget.allowed_mem,
            reserved: budget.reserved_mem,
        });
    }
    Ok(usize::try_from(k).unwrap_or(usize::MAX))
}

/// Split a merge factor across several axes so the product of the
/// per-axis merges never exceeds `factor`.
pub fn split_merge_factor(factor: usize, numblocks: &[usize]) -> Vec<usize> {
    let mut remaining = factor.max(1);
    numblocks
        .iter()
        .map(|&n| {
            let m = n.min(remaining).max(1);
            remaining /= m;
            m
        })
        .collect()
}
