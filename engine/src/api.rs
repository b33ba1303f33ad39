// api.rs — Array-API style functions over lazy arrays
//
// Creation functions record source ops backed by virtual stores; the rest
// are thin wrappers over `ops`.

use std::sync::Arc;

use crate::array::{Array, Context};
use crate::block::{BinaryOp, Block, Reducer};
use crate::chunks::Chunks;
use crate::dtype::{DType, Scalar};
use crate::error::PlanError;
use crate::func::{BlockFunction, Kernel};
use crate::index::Label;
use crate::ops::{self, dim_label, BlockwiseOptions};
use crate::store::{ArrayMeta, FullStore, InMemoryArrayStore};

// ── Creation ────────────────────────────────────────────────────────────────

/// An array of `shape` with every element `value`.
pub fn full(
    ctx: &Arc<Context>,
    shape: &[usize],
    chunksize: &[usize],
    value: Scalar,
    dtype: Option<DType>,
) -> Result<Array, PlanError> {
    full_named(ctx, "full", shape, chunksize, value, dtype)
}

pub fn ones(
    ctx: &Arc<Context>,
    shape: &[usize],
    chunksize: &[usize],
    dtype: DType,
) -> Result<Array, PlanError> {
    full_named(ctx, "ones", shape, chunksize, Scalar::Int(1), Some(dtype))
}

pub fn zeros(
    ctx: &Arc<Context>,
    shape: &[usize],
    chunksize: &[usize],
    dtype: DType,
) -> Result<Array, PlanError> {
    full_named(ctx, "zeros", shape, chunksize, Scalar::Int(0), Some(dtype))
}

/// An array whose contents are unspecified. Blocks read as zeros.
pub fn empty(
    ctx: &Arc<Context>,
    shape: &[usize],
    chunksize: &[usize],
    dtype: DType,
) -> Result<Array, PlanError> {
    full_named(ctx, "empty", shape, chunksize, Scalar::Int(0), Some(dtype))
}

fn full_named(
    ctx: &Arc<Context>,
    kind: &str,
    shape: &[usize],
    chunksize: &[usize],
    value: Scalar,
    dtype: Option<DType>,
) -> Result<Array, PlanError> {
    let dtype = dtype.unwrap_or(value.default_dtype());
    let meta = ArrayMeta::new(dtype, Chunks::regular(shape, chunksize)?);
    Ok(ops::source_array(ctx, kind, Arc::new(FullStore::new(meta, value))))
}

/// A chunked view of an in-memory block.
pub fn asarray(ctx: &Arc<Context>, data: Block, chunksize: &[usize]) -> Result<Array, PlanError> {
    let shape = data.shape().to_vec();
    let chunks = Chunks::regular(&shape, chunksize)?;
    let expected = chunks.shape();
    let store = InMemoryArrayStore::new(data, chunks)
        .map_err(|_| PlanError::ShapeMismatch { expected, got: shape })?;
    Ok(ops::source_array(ctx, "asarray", Arc::new(store)))
}

// ── Elementwise ─────────────────────────────────────────────────────────────

pub fn negative(x: &Array) -> Result<Array, PlanError> {
    ops::elemwise(Kernel::Negative, &[x], None)
}

pub fn positive(x: &Array) -> Result<Array, PlanError> {
    ops::elemwise(Kernel::Positive, &[x], None)
}

pub fn abs(x: &Array) -> Result<Array, PlanError> {
    ops::elemwise(Kernel::Abs, &[x], None)
}

pub fn add(x: &Array, y: &Array) -> Result<Array, PlanError> {
    ops::elemwise(Kernel::Binary(BinaryOp::Add), &[x, y], None)
}

pub fn subtract(x: &Array, y: &Array) -> Result<Array, PlanError> {
    ops::elemwise(Kernel::Binary(BinaryOp::Subtract), &[x, y], None)
}

pub fn multiply(x: &Array, y: &Array) -> Result<Array, PlanError> {
    ops::elemwise(Kernel::Binary(BinaryOp::Multiply), &[x, y], None)
}

pub fn equal(x: &Array, y: &Array) -> Result<Array, PlanError> {
    ops::elemwise(Kernel::Binary(BinaryOp::Equal), &[x, y], Some(DType::Bool))
}

/// `x` converted to `dtype`; `x` itself when it already has that type.
pub fn astype(x: &Array, dtype: DType) -> Result<Array, PlanError> {
    if x.dtype() == dtype {
        return Ok(x.clone());
    }
    ops::elemwise(Kernel::AsType(dtype), &[x], Some(dtype))
}

// ── Layout ──────────────────────────────────────────────────────────────────

/// Reorder the dimensions of `x`; output dimension `i` is input `axes[i]`.
pub fn permute_dims(x: &Array, axes: &[usize]) -> Result<Array, PlanError> {
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();
    if sorted != (0..x.ndim()).collect::<Vec<_>>() {
        return Err(PlanError::InvalidPermutation(axes.to_vec()));
    }
    let labels: Vec<Label> = (0..x.ndim()).map(dim_label).collect();
    let out: Vec<Label> = axes.iter().map(|&a| labels[a]).collect();
    ops::blockwise(
        BlockFunction::Map(Kernel::PermuteDims(axes.to_vec())),
        &out,
        &[(x, labels.as_slice())],
        x.dtype(),
        &BlockwiseOptions::default(),
    )
}

/// Swap the last two dimensions.
pub fn matrix_transpose(x: &Array) -> Result<Array, PlanError> {
    let n = x.ndim();
    if n < 2 {
        return Err(PlanError::RankMismatch {
            expected: 2,
            found: n,
        });
    }
    let mut axes: Vec<usize> = (0..n).collect();
    axes.swap(n - 2, n - 1);
    permute_dims(x, &axes)
}

/// Outer product of two 1-D arrays.
pub fn outer(x: &Array, y: &Array) -> Result<Array, PlanError> {
    for a in [x, y] {
        if a.ndim() != 1 {
            return Err(PlanError::RankMismatch {
                expected: 1,
                found: a.ndim(),
            });
        }
    }
    ops::blockwise(
        BlockFunction::Map(Kernel::Outer),
        &['i', 'j'],
        &[(x, &['i'][..]), (y, &['j'][..])],
        DType::result_type(x.dtype(), y.dtype()),
        &BlockwiseOptions::default(),
    )
}

// ── Reductions ──────────────────────────────────────────────────────────────

pub fn sum(x: &Array, axes: Option<&[isize]>, keepdims: bool) -> Result<Array, PlanError> {
    ops::reduction(x, Reducer::Sum, axes, keepdims, None)
}

pub fn prod(x: &Array, axes: Option<&[isize]>, keepdims: bool) -> Result<Array, PlanError> {
    ops::reduction(x, Reducer::Prod, axes, keepdims, None)
}

pub fn max(x: &Array, axes: Option<&[isize]>, keepdims: bool) -> Result<Array, PlanError> {
    ops::reduction(x, Reducer::Max, axes, keepdims, None)
}

pub fn min(x: &Array, axes: Option<&[isize]>, keepdims: bool) -> Result<Array, PlanError> {
    ops::reduction(x, Reducer::Min, axes, keepdims, None)
}

/// Remove the length-one `axes` of `x`.
pub fn squeeze(x: &Array, axes: &[isize]) -> Result<Array, PlanError> {
    ops::squeeze(x, axes)
}
