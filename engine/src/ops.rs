// ops.rs — Core array operations
//
// Chunk-aware operations over `Array`s. Each call validates its arguments,
// derives output chunks, plans a primitive (which proves the memory budget),
// and records one op in the context's plan graph. Higher-level functions in
// `api` are thin wrappers over these.
//
// Preconditions: arrays passed together share a context.
// Postconditions: the returned array's chunks sum to its shape in every
//                 dimension; no existing node is modified.
// Failure modes: every error is a `PlanError` raised before any task runs.
// Side effects: records op and array nodes in the context's graph.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::api::empty;
use crate::array::{same_context, Array, Context};
use crate::block::Reducer;
use crate::blockwise::{self as primitive, Source};
use crate::chunks::{common_blockdim, Chunks};
use crate::dtype::DType;
use crate::error::PlanError;
use crate::func::{BlockFunction, BlockIdKernel, DirectKernel, Kernel, SideInput};
use crate::id::ArrayId;
use crate::index::{check_output_labels, derive_output_chunks, ChunkAdjust, KeyFunction, Label};
use crate::memory::{merge_factor, split_merge_factor};
use crate::rechunk::rechunk as primitive_rechunk;
use crate::store::{ArrayMeta, ChunkStore, StoreHandle};
use crate::subscripts::parse_subscripts;

/// Label for dimension `i` in generated label sequences.
pub(crate) fn dim_label(i: usize) -> Label {
    match u8::try_from(i) {
        Ok(n) if n < 26 => char::from(b'a' + n),
        _ => char::from_u32(0x100 + i as u32).unwrap_or(char::REPLACEMENT_CHARACTER),
    }
}

/// Normalize possibly negative axes against `ndim`.
pub(crate) fn validate_axes(axes: &[isize], ndim: usize) -> Result<Vec<usize>, PlanError> {
    let n = ndim as isize;
    let mut out = BTreeSet::new();
    for &axis in axes {
        if axis < -n || axis >= n {
            return Err(PlanError::AxisOutOfRange { axis, ndim });
        }
        out.insert(axis.rem_euclid(n.max(1)) as usize);
    }
    Ok(out.into_iter().collect())
}

// ── Sources ─────────────────────────────────────────────────────────────────

/// Record a source op for an existing store.
pub(crate) fn source_array(ctx: &Arc<Context>, kind: &str, store: Arc<dyn ChunkStore>) -> Array {
    let id = ctx.alloc_array();
    let handle = Arc::new(StoreHandle::open(id.to_string(), store));
    ctx.record(kind, id, handle, None, Vec::new())
}

/// An array backed by an existing store. Reading it costs no tasks.
pub fn from_store(ctx: &Arc<Context>, store: Arc<dyn ChunkStore>) -> Array {
    source_array(ctx, "from_store", store)
}

/// Copy `x` into `store`, whose metadata fixes the result's chunks.
pub fn to_store(x: &Array, store: Arc<dyn ChunkStore>) -> Result<Array, PlanError> {
    let meta = store.meta().clone();
    if meta.shape != x.shape() {
        return Err(PlanError::ShapeMismatch {
            expected: x.shape().to_vec(),
            got: meta.shape,
        });
    }
    let x = if meta.dtype == x.dtype() {
        x.clone()
    } else {
        elemwise(Kernel::AsType(meta.dtype), &[x], Some(meta.dtype))?
    };
    let ctx = x.context().clone();
    let id = ctx.alloc_array();
    let target = Arc::new(StoreHandle::open(id.to_string(), store));
    rechunk_into(&ctx, &x, id, target)
}

// ── Blockwise ───────────────────────────────────────────────────────────────

/// Options for `blockwise`.
#[derive(Debug, Clone)]
pub struct BlockwiseOptions {
    /// Rechunk inputs so shared labels have identical chunks.
    pub align: bool,
    /// Output labels not present in any input, with their sizes.
    pub new_axes: BTreeMap<Label, usize>,
    /// Overrides of the derived output chunks, by label.
    pub adjust: BTreeMap<Label, ChunkAdjust>,
    /// Extra per-task memory the function needs beyond its blocks.
    pub extra_mem: u64,
}

impl Default for BlockwiseOptions {
    fn default() -> Self {
        BlockwiseOptions {
            align: true,
            new_axes: BTreeMap::new(),
            adjust: BTreeMap::new(),
            extra_mem: 0,
        }
    }
}

impl BlockwiseOptions {
    pub fn unaligned() -> Self {
        BlockwiseOptions {
            align: false,
            ..BlockwiseOptions::default()
        }
    }
}

/// Apply `function` block by block; `args` pairs each array with the labels
/// of its dimensions, `out_labels` orders the output dimensions.
pub fn blockwise(
    function: BlockFunction,
    out_labels: &[Label],
    args: &[(&Array, &[Label])],
    dtype: DType,
    options: &BlockwiseOptions,
) -> Result<Array, PlanError> {
    let arrays: Vec<&Array> = args.iter().map(|(a, _)| *a).collect();
    let ctx = same_context(&arrays)?.clone();
    let input_labels: Vec<&[Label]> = args.iter().map(|(_, l)| *l).collect();
    check_output_labels(out_labels, &input_labels, &options.new_axes)?;
    for (a, labels) in args {
        if labels.len() != a.ndim() {
            return Err(PlanError::RankMismatch {
                expected: labels.len(),
                found: a.ndim(),
            });
        }
    }

    let side_ids: Vec<ArrayId> = function.side_inputs().iter().map(|s| s.array).collect();
    let aligned = if options.align {
        unify_chunks(args)?.1
    } else {
        arrays.iter().map(|a| (*a).clone()).collect()
    };
    let inputs: Vec<(&[Label], &Chunks)> = aligned
        .iter()
        .zip(&input_labels)
        .map(|(a, l)| (*l, a.chunks()))
        .collect();
    let chunks = derive_output_chunks(out_labels, &inputs, &options.new_axes, &options.adjust)?;

    let id = ctx.alloc_array();
    let target = ctx.lazy_store(id, ArrayMeta::new(dtype, chunks));
    let sources: Vec<(Source, Vec<Label>)> = aligned
        .iter()
        .zip(&input_labels)
        .map(|(a, l)| (Source::new(a.id(), a.store().clone()), l.to_vec()))
        .collect();
    let op = primitive::blockwise(
        function,
        out_labels,
        &sources,
        target.clone(),
        ctx.budget(),
        options.extra_mem,
    )?;
    let source_ids = aligned.iter().map(Array::id).chain(side_ids).collect();
    Ok(ctx.record("blockwise", id, target, Some(op), source_ids))
}

/// `blockwise` with labels given as subscripts, e.g. `"ij,jk->ik"`.
pub fn blockwise_subscripts(
    function: BlockFunction,
    subscripts: &str,
    args: &[&Array],
    dtype: DType,
    options: &BlockwiseOptions,
) -> Result<Array, PlanError> {
    let parsed = parse_subscripts(subscripts)?;
    if parsed.inputs.len() != args.len() {
        return Err(PlanError::OperandCountMismatch {
            expected: parsed.inputs.len(),
            found: args.len(),
        });
    }
    let pairs: Vec<(&Array, &[Label])> = args
        .iter()
        .zip(&parsed.inputs)
        .map(|(a, l)| (*a, l.as_slice()))
        .collect();
    blockwise(function, &parsed.output, &pairs, dtype, options)
}

/// Apply `function` with an arbitrary output-to-input block mapping. The
/// caller supplies the output `chunks`.
pub fn general_blockwise(
    function: BlockFunction,
    keys: KeyFunction,
    args: &[&Array],
    dtype: DType,
    chunks: Chunks,
    extra_mem: u64,
) -> Result<Array, PlanError> {
    let ctx = same_context(args)?.clone();
    let id = ctx.alloc_array();
    let target = ctx.lazy_store(id, ArrayMeta::new(dtype, chunks));
    let sources: Vec<Source> = args
        .iter()
        .map(|a| Source::new(a.id(), a.store().clone()))
        .collect();
    let op = primitive::general_blockwise(function, keys, &sources, target.clone(), ctx.budget(), extra_mem)?;
    let source_ids = args.iter().map(|a| a.id()).collect();
    Ok(ctx.record("blockwise", id, target, Some(op), source_ids))
}

/// Broadcast shape of `shapes`, aligned at their trailing dimensions.
fn broadcast_shapes(shapes: &[&[usize]]) -> Result<Vec<usize>, PlanError> {
    let ndim = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut out = vec![1; ndim];
    for shape in shapes {
        let offset = ndim - shape.len();
        for (i, &n) in shape.iter().enumerate() {
            let cur = &mut out[offset + i];
            if *cur == 1 {
                *cur = n;
            } else if n != 1 && n != *cur {
                return Err(PlanError::ShapeMismatch {
                    expected: out.clone(),
                    got: shape.to_vec(),
                });
            }
        }
    }
    Ok(out)
}

/// Elementwise `kernel` over `args` with numpy broadcasting. `dtype`
/// defaults to the promoted type of the inputs.
pub fn elemwise(kernel: Kernel, args: &[&Array], dtype: Option<DType>) -> Result<Array, PlanError> {
    let shapes: Vec<&[usize]> = args.iter().map(|a| a.shape()).collect();
    let ndim = broadcast_shapes(&shapes)?.len();
    let dtype = match dtype {
        Some(d) => d,
        None => args
            .iter()
            .map(|a| a.dtype())
            .reduce(DType::result_type)
            .ok_or(PlanError::OperandCountMismatch {
                expected: 1,
                found: 0,
            })?,
    };
    let out: Vec<Label> = (0..ndim).rev().map(dim_label).collect();
    let labels: Vec<Vec<Label>> = args
        .iter()
        .map(|a| (0..a.ndim()).rev().map(dim_label).collect())
        .collect();
    let pairs: Vec<(&Array, &[Label])> = args
        .iter()
        .zip(&labels)
        .map(|(a, l)| (*a, l.as_slice()))
        .collect();
    blockwise(
        BlockFunction::Map(kernel),
        &out,
        &pairs,
        dtype,
        &BlockwiseOptions::default(),
    )
}

/// Options for `map_blocks`.
#[derive(Debug, Clone, Default)]
pub struct MapBlocksOptions {
    /// Output chunks, one sequence per output dimension.
    pub chunks: Option<Vec<Vec<usize>>>,
    /// Input dimensions the kernel removes.
    pub drop_axis: Vec<isize>,
    /// Output positions of dimensions the kernel adds.
    pub new_axis: Vec<isize>,
    /// Per-task memory the kernel needs beyond the blocks it is given.
    pub extra_required_mem: u64,
}

/// Apply `kernel` to corresponding blocks of `args` without aligning them.
pub fn map_blocks(
    kernel: Kernel,
    args: &[&Array],
    dtype: DType,
    options: &MapBlocksOptions,
) -> Result<Array, PlanError> {
    map_blocks_function(BlockFunction::Map(kernel), args, dtype, options)
}

/// `map_blocks` for a kernel that also receives each output block's
/// coordinate in the block grid.
pub fn map_blocks_with_block_id(
    kernel: BlockIdKernel,
    args: &[&Array],
    dtype: DType,
    options: &MapBlocksOptions,
) -> Result<Array, PlanError> {
    map_blocks_function(BlockFunction::MapWithBlockId(kernel), args, dtype, options)
}

/// A new array of `shape` whose blocks `kernel` builds by reading `inputs`
/// directly. `extra_required_mem` must cover what the kernel reads, since
/// those reads are not part of the projection.
pub fn map_direct(
    kernel: DirectKernel,
    inputs: &[&Array],
    shape: &[usize],
    dtype: DType,
    chunksize: &[usize],
    extra_required_mem: u64,
) -> Result<Array, PlanError> {
    let ctx = same_context(inputs)?;
    let out = empty(ctx, shape, chunksize, dtype)?;
    let side = inputs
        .iter()
        .map(|a| SideInput::new(a.id(), a.store().clone()))
        .collect();
    map_blocks_function(
        BlockFunction::Direct { kernel, inputs: side },
        &[&out],
        dtype,
        &MapBlocksOptions {
            extra_required_mem,
            ..MapBlocksOptions::default()
        },
    )
}

fn map_blocks_function(
    function: BlockFunction,
    args: &[&Array],
    dtype: DType,
    options: &MapBlocksOptions,
) -> Result<Array, PlanError> {
    let ndim = args.iter().map(|a| a.ndim()).max().unwrap_or(0);
    let mut out: Vec<Label> = (0..ndim).rev().map(dim_label).collect();

    let drop = validate_axes(&options.drop_axis, ndim)?;
    out = out
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !drop.contains(i))
        .map(|(_, l)| l)
        .collect();

    let mut new_axis = options.new_axis.clone();
    if let Some(chunks) = &options.chunks {
        if new_axis.is_empty() && chunks.len() > out.len() {
            new_axis = (0..(chunks.len() - out.len()) as isize).collect();
        }
    }
    new_axis.sort_unstable();
    let mut new_axes = BTreeMap::new();
    for &axis in &new_axis {
        let position = usize::try_from(axis)
            .ok()
            .filter(|&p| p <= out.len())
            .ok_or(PlanError::AxisOutOfRange {
                axis,
                ndim: out.len() + 1,
            })?;
        let label = dim_label(out.len() + drop.len());
        out.insert(position, label);
        let size = options
            .chunks
            .as_ref()
            .and_then(|c| c.get(position))
            .map_or(1, |seq| seq.iter().sum());
        new_axes.insert(label, size);
    }

    let mut adjust = BTreeMap::new();
    if let Some(chunks) = &options.chunks {
        if chunks.len() != out.len() {
            return Err(PlanError::RankMismatch {
                expected: out.len(),
                found: chunks.len(),
            });
        }
        for (label, seq) in out.iter().zip(chunks) {
            adjust.insert(*label, ChunkAdjust::Explicit(seq.clone()));
        }
    }

    let labels: Vec<Vec<Label>> = args
        .iter()
        .map(|a| (0..a.ndim()).rev().map(dim_label).collect())
        .collect();
    let pairs: Vec<(&Array, &[Label])> = args
        .iter()
        .zip(&labels)
        .map(|(a, l)| (*a, l.as_slice()))
        .collect();
    blockwise(
        function,
        &out,
        &pairs,
        dtype,
        &BlockwiseOptions {
            new_axes,
            adjust,
            extra_mem: options.extra_required_mem,
            ..BlockwiseOptions::unaligned()
        },
    )
}

// ── Rechunk ─────────────────────────────────────────────────────────────────

/// Repartition `x` into blocks of `chunksize`.
pub fn rechunk(x: &Array, chunksize: &[usize]) -> Result<Array, PlanError> {
    if chunksize.len() != x.ndim() {
        return Err(PlanError::RankMismatch {
            expected: x.ndim(),
            found: chunksize.len(),
        });
    }
    let ctx = x.context().clone();
    let chunks = Chunks::regular(x.shape(), chunksize)?;
    let id = ctx.alloc_array();
    let target = ctx.lazy_store(id, ArrayMeta::new(x.dtype(), chunks));
    rechunk_into(&ctx, x, id, target)
}

fn rechunk_into(
    ctx: &Arc<Context>,
    x: &Array,
    id: ArrayId,
    target: Arc<StoreHandle>,
) -> Result<Array, PlanError> {
    let source = Source::new(x.id(), x.store().clone());
    let op = primitive_rechunk(
        &source,
        target.clone(),
        |meta| ctx.intermediate_store(id, meta),
        ctx.budget(),
    )?;
    Ok(ctx.record("rechunk", id, target, Some(op), vec![x.id()]))
}

// ── Reconciliation ──────────────────────────────────────────────────────────

/// Rechunk `args` so that every shared label has one chunk sequence.
/// Returns the sequence per label and the (possibly new) arrays, in order.
#[allow(clippy::type_complexity)]
pub fn unify_chunks(
    args: &[(&Array, &[Label])],
) -> Result<(BTreeMap<Label, Vec<usize>>, Vec<Array>), PlanError> {
    let Some((first, first_labels)) = args.first() else {
        return Ok((BTreeMap::new(), Vec::new()));
    };
    if args
        .iter()
        .all(|(a, l)| l == first_labels && a.chunks() == first.chunks())
    {
        let by_label = first_labels
            .iter()
            .copied()
            .zip(first.chunks().dims().iter().cloned())
            .collect();
        return Ok((by_label, args.iter().map(|(a, _)| (*a).clone()).collect()));
    }

    let mut candidates: BTreeMap<Label, Vec<&[usize]>> = BTreeMap::new();
    for (a, labels) in args {
        for (dim, &label) in labels.iter().enumerate() {
            candidates.entry(label).or_default().push(a.chunks().dim(dim));
        }
    }
    let mut by_label = BTreeMap::new();
    for (label, mut seqs) in candidates {
        // Broadcast dimensions of length one give way to any longer one.
        if seqs.iter().any(|s| *s != [1]) {
            seqs.retain(|s| *s != [1]);
        }
        by_label.insert(label, common_blockdim(label, &seqs)?);
    }

    let mut arrays = Vec::with_capacity(args.len());
    for (a, labels) in args {
        let dims: Vec<Vec<usize>> = labels
            .iter()
            .enumerate()
            .map(|(dim, label)| {
                if a.shape()[dim] > 1 {
                    by_label.get(label).cloned().unwrap_or_default()
                } else {
                    vec![a.shape()[dim]]
                }
            })
            .collect();
        if dims.as_slice() == a.chunks().dims() {
            arrays.push((*a).clone());
        } else {
            let chunksize = Chunks::new(dims).to_chunksize()?;
            arrays.push(rechunk(a, &chunksize)?);
        }
    }
    Ok((by_label, arrays))
}

// ── Reductions ──────────────────────────────────────────────────────────────

/// Reduce `x` over `axes` (all axes when `None`) in memory-bounded rounds.
///
/// Blocks are first reduced individually to length one along the axes;
/// rounds of rechunk-then-reduce then merge as many blocks as the budget
/// allows until one block remains along each axis.
pub fn reduction(
    x: &Array,
    reducer: Reducer,
    axes: Option<&[isize]>,
    keepdims: bool,
    dtype: Option<DType>,
) -> Result<Array, PlanError> {
    let ndim = x.ndim();
    let axes = match axes {
        Some(axes) => validate_axes(axes, ndim)?,
        None => (0..ndim).collect(),
    };
    let dtype = dtype.unwrap_or(match reducer {
        Reducer::Sum | Reducer::Prod => x.dtype().accumulator(),
        Reducer::Max | Reducer::Min => x.dtype(),
    });
    let labels: Vec<Label> = (0..ndim).map(dim_label).collect();
    let budget = x.context().budget();

    let reduce_blocks = |arr: &Array| {
        let adjust = axes
            .iter()
            .map(|&a| (labels[a], ChunkAdjust::Constant(1)))
            .collect();
        blockwise(
            BlockFunction::Reduce {
                reducer,
                axes: axes.clone(),
                keepdims: true,
            },
            &labels,
            &[(arr, labels.as_slice())],
            dtype,
            &BlockwiseOptions {
                adjust,
                ..BlockwiseOptions::unaligned()
            },
        )
    };

    let mut result = if x.dtype() == dtype {
        x.clone()
    } else {
        elemwise(Kernel::AsType(dtype), &[x], Some(dtype))?
    };
    if axes
        .iter()
        .any(|&a| result.chunks().dim(a).iter().any(|&s| s != 1))
    {
        result = reduce_blocks(&result)?;
    }

    let mut rounds = 0;
    while axes.iter().any(|&a| result.numblocks()[a] > 1) {
        let chunk_mem = (dtype.itemsize() * result.chunksize().iter().product::<usize>()) as u64;
        let factor = merge_factor(&budget, chunk_mem)?;
        let numblocks = result.numblocks();
        let along: Vec<usize> = axes.iter().map(|&a| numblocks[a]).collect();
        let mut target = result.chunksize();
        for (&a, &m) in axes.iter().zip(&split_merge_factor(factor, &along)) {
            target[a] = m;
        }
        result = rechunk(&result, &target)?;
        result = reduce_blocks(&result)?;
        rounds += 1;
    }
    tracing::debug!(%reducer, axes = ?axes, rounds, "planned reduction");

    if keepdims {
        Ok(result)
    } else {
        let axes: Vec<isize> = axes.iter().map(|&a| a as isize).collect();
        squeeze(&result, &axes)
    }
}

/// Remove length-one `axes`.
pub fn squeeze(x: &Array, axes: &[isize]) -> Result<Array, PlanError> {
    let axes = validate_axes(axes, x.ndim())?;
    if let Some(&axis) = axes.iter().find(|&&a| x.shape()[a] != 1) {
        return Err(PlanError::InvalidSqueeze {
            axis,
            size: x.shape()[axis],
        });
    }
    let chunks: Vec<Vec<usize>> = x
        .chunks()
        .dims()
        .iter()
        .enumerate()
        .filter(|(i, _)| !axes.contains(i))
        .map(|(_, d)| d.clone())
        .collect();
    map_blocks(
        Kernel::Squeeze(axes.clone()),
        &[x],
        x.dtype(),
        &MapBlocksOptions {
            chunks: Some(chunks),
            drop_axis: axes.iter().map(|&a| a as isize).collect(),
            ..MapBlocksOptions::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_labels_are_distinct() {
        let labels: BTreeSet<Label> = (0..60).map(dim_label).collect();
        assert_eq!(labels.len(), 60);
        assert_eq!(dim_label(0), 'a');
        assert_eq!(dim_label(25), 'z');
    }

    #[test]
    fn axes_normalize_and_validate() {
        assert_eq!(validate_axes(&[-1, 0], 3), Ok(vec![0, 2]));
        assert_eq!(
            validate_axes(&[3], 3),
            Err(PlanError::AxisOutOfRange { axis: 3, ndim: 3 })
        );
        assert!(validate_axes(&[-4], 3).is_err());
    }

    #[test]
    fn broadcasting_aligns_trailing_dimensions() {
        assert_eq!(broadcast_shapes(&[&[3, 1], &[4]]), Ok(vec![3, 4]));
        assert_eq!(broadcast_shapes(&[&[2, 3], &[2, 3]]), Ok(vec![2, 3]));
        assert!(broadcast_shapes(&[&[2, 3], &[4]]).is_err());
    }
}
