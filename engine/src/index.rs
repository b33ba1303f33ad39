// index.rs — Index algebra for blockwise operations
//
// Each operand of a blockwise operation carries one label per dimension;
// the output label order fixes the output's dimension order. A label shared
// between an operand and the output selects the same block index; a label
// the output lacks is contracted, and every block along it is read.
//
// Preconditions: operands sharing a label have been reconciled to identical
//                chunk boundaries, or one of them has a single block.
// Postconditions: derived output chunks sum to the output shape.
// Failure modes: unbound output labels, repeated output labels, rank
//                mismatches, and adjust-chunks mismatches return `PlanError`.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::chunks::{Chunks, GridIter};
use crate::error::PlanError;

/// A dimension label.
pub type Label = char;

/// Labels from a string such as `"ij"`.
pub fn labels(s: &str) -> Vec<Label> {
    s.chars().collect()
}

// ── Input keys ──────────────────────────────────────────────────────────────

/// Blocks of one operand that a single task reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKeys {
    /// Exactly one block.
    One(Vec<usize>),
    /// A row-major grid of blocks. `grid[k]` blocks are laid along operand
    /// dimension `axes[k]`; they are joined into one block before use.
    Many {
        coords: Vec<Vec<usize>>,
        grid: Vec<usize>,
        axes: Vec<usize>,
    },
}

impl InputKeys {
    pub fn coords(&self) -> Vec<&[usize]> {
        match self {
            InputKeys::One(c) => vec![c.as_slice()],
            InputKeys::Many { coords, .. } => coords.iter().map(Vec::as_slice).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            InputKeys::One(_) => 1,
            InputKeys::Many { coords, .. } => coords.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys for every block of a row-major grid over `axes`, with the other
    /// dimensions fixed at `base`.
    fn grid_over(base: &[usize], axes: Vec<usize>, grid: Vec<usize>, offsets: &[usize]) -> Self {
        let coords = GridIter::new(grid.clone())
            .map(|local| {
                let mut coord = base.to_vec();
                for (k, &axis) in axes.iter().enumerate() {
                    coord[axis] = offsets[k] + local[k];
                }
                coord
            })
            .collect();
        InputKeys::Many { coords, grid, axes }
    }
}

// ── Key functions ───────────────────────────────────────────────────────────

/// Maps an output block coordinate to the blocks each operand supplies.
#[derive(Debug, Clone)]
pub enum KeyFunction {
    Blockwise(BlockwiseKeys),
    Overlap(OverlapKeys),
    General(GeneralKeys),
}

impl KeyFunction {
    pub fn keys(&self, out_coord: &[usize]) -> Vec<InputKeys> {
        match self {
            KeyFunction::Blockwise(k) => k.keys(out_coord),
            KeyFunction::Overlap(k) => vec![k.keys(out_coord)],
            KeyFunction::General(k) => (k.func)(out_coord),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            KeyFunction::Blockwise(k) => k.describe(),
            KeyFunction::Overlap(_) => "overlap".to_string(),
            KeyFunction::General(k) => k.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OperandIndex {
    labels: Vec<Label>,
    numblocks: Vec<usize>,
}

/// Key function derived from label sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockwiseKeys {
    out_labels: Vec<Label>,
    operands: Vec<OperandIndex>,
}

impl BlockwiseKeys {
    /// `operands` pairs each operand's labels with its blocks per dimension.
    pub fn new(out_labels: &[Label], operands: &[(&[Label], Vec<usize>)]) -> Self {
        BlockwiseKeys {
            out_labels: out_labels.to_vec(),
            operands: operands
                .iter()
                .map(|(labels, numblocks)| OperandIndex {
                    labels: labels.to_vec(),
                    numblocks: numblocks.clone(),
                })
                .collect(),
        }
    }

    pub fn keys(&self, out_coord: &[usize]) -> Vec<InputKeys> {
        self.operands
            .iter()
            .map(|op| {
                let mut base = Vec::with_capacity(op.labels.len());
                let mut contracted = Vec::new();
                for (dim, label) in op.labels.iter().enumerate() {
                    match self.out_labels.iter().position(|l| l == label) {
                        Some(_) if op.numblocks[dim] == 1 => base.push(0),
                        Some(pos) => base.push(out_coord[pos]),
                        None => {
                            base.push(0);
                            contracted.push(dim);
                        }
                    }
                }
                if contracted.is_empty() {
                    InputKeys::One(base)
                } else {
                    let grid = contracted.iter().map(|&d| op.numblocks[d]).collect();
                    let offsets = vec![0; contracted.len()];
                    InputKeys::grid_over(&base, contracted, grid, &offsets)
                }
            })
            .collect()
    }

    fn describe(&self) -> String {
        let ins: Vec<String> = self
            .operands
            .iter()
            .map(|op| op.labels.iter().collect())
            .collect();
        format!("{}->{}", ins.join(","), self.out_labels.iter().collect::<String>())
    }
}

/// Rechunk mapping: every source block whose region intersects the target
/// block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapKeys {
    pub source: Chunks,
    pub target: Chunks,
}

impl OverlapKeys {
    pub fn new(source: Chunks, target: Chunks) -> Self {
        OverlapKeys { source, target }
    }

    pub fn keys(&self, out_coord: &[usize]) -> InputKeys {
        let region = self.target.block_region(out_coord);
        let ranges: Vec<_> = region
            .into_iter()
            .enumerate()
            .map(|(dim, r)| self.source.overlapping(dim, r))
            .collect();
        let axes = (0..ranges.len()).collect();
        let grid = ranges.iter().map(|r| r.end - r.start).collect();
        let offsets: Vec<usize> = ranges.iter().map(|r| r.start).collect();
        InputKeys::grid_over(&offsets, axes, grid, &offsets)
    }
}

type KeysFn = dyn Fn(&[usize]) -> Vec<InputKeys> + Send + Sync;

/// Arbitrary output-to-input block map.
#[derive(Clone)]
pub struct GeneralKeys {
    name: String,
    func: Arc<KeysFn>,
}

impl GeneralKeys {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&[usize]) -> Vec<InputKeys> + Send + Sync + 'static,
    ) -> Self {
        GeneralKeys {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for GeneralKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneralKeys").field("name", &self.name).finish()
    }
}

// ── Output chunk derivation ─────────────────────────────────────────────────

/// Per-dimension override of derived output chunk sizes.
#[derive(Clone)]
pub enum ChunkAdjust {
    /// Every block along the dimension gets this size.
    Constant(usize),
    /// Maps each existing block size to a new one.
    PerBlock(Arc<dyn Fn(usize) -> usize + Send + Sync>),
    /// Explicit sizes; the count must match the existing block count.
    Explicit(Vec<usize>),
}

impl fmt::Debug for ChunkAdjust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkAdjust::Constant(n) => f.debug_tuple("Constant").field(n).finish(),
            ChunkAdjust::PerBlock(_) => f.write_str("PerBlock(..)"),
            ChunkAdjust::Explicit(v) => f.debug_tuple("Explicit").field(v).finish(),
        }
    }
}

/// Every output label is bound by an input or a new axis, and none repeats.
pub fn check_output_labels(
    out_labels: &[Label],
    input_labels: &[&[Label]],
    new_axes: &BTreeMap<Label, usize>,
) -> Result<(), PlanError> {
    let bound: BTreeSet<Label> = input_labels
        .iter()
        .flat_map(|l| l.iter().copied())
        .chain(new_axes.keys().copied())
        .collect();
    let unknown: BTreeSet<Label> = out_labels
        .iter()
        .copied()
        .filter(|l| !bound.contains(l))
        .collect();
    if !unknown.is_empty() {
        return Err(PlanError::UnknownLabels(unknown.into_iter().collect()));
    }
    let mut seen = BTreeSet::new();
    for &label in out_labels {
        if !seen.insert(label) {
            return Err(PlanError::RepeatedOutputLabel(label));
        }
    }
    Ok(())
}

/// Output chunk structure for `out_labels`.
///
/// The sequence for each label comes from the input with the most blocks
/// along it; a new axis contributes one block of its declared size. Adjust
/// overrides then apply by label.
pub fn derive_output_chunks(
    out_labels: &[Label],
    inputs: &[(&[Label], &Chunks)],
    new_axes: &BTreeMap<Label, usize>,
    adjust: &BTreeMap<Label, ChunkAdjust>,
) -> Result<Chunks, PlanError> {
    let input_labels: Vec<&[Label]> = inputs.iter().map(|(l, _)| *l).collect();
    check_output_labels(out_labels, &input_labels, new_axes)?;

    let mut by_label: BTreeMap<Label, &[usize]> = BTreeMap::new();
    for (labels, chunks) in inputs {
        if labels.len() != chunks.ndim() {
            return Err(PlanError::RankMismatch {
                expected: labels.len(),
                found: chunks.ndim(),
            });
        }
        for (dim, &label) in labels.iter().enumerate() {
            let seq = chunks.dim(dim);
            by_label
                .entry(label)
                .and_modify(|cur| {
                    let longer = seq.len() > cur.len()
                        || (seq.len() == cur.len() && seq.iter().sum::<usize>() > cur.iter().sum::<usize>());
                    if longer {
                        *cur = seq;
                    }
                })
                .or_insert(seq);
        }
    }

    let mut dims = Vec::with_capacity(out_labels.len());
    for (dim, label) in out_labels.iter().enumerate() {
        let mut seq = match (new_axes.get(label), by_label.get(label)) {
            (Some(&size), _) => vec![size],
            (None, Some(seq)) => seq.to_vec(),
            (None, None) => return Err(PlanError::UnknownLabels(label.to_string())),
        };
        if let Some(adj) = adjust.get(label) {
            seq = apply_adjust(dim, &seq, adj)?;
        }
        dims.push(seq);
    }
    tracing::debug!(out = %out_labels.iter().collect::<String>(), chunks = ?dims, "derived output chunks");
    Ok(Chunks::new(dims))
}

fn apply_adjust(dim: usize, seq: &[usize], adjust: &ChunkAdjust) -> Result<Vec<usize>, PlanError> {
    match adjust {
        ChunkAdjust::Constant(n) => Ok(vec![*n; seq.len()]),
        ChunkAdjust::PerBlock(f) => Ok(seq.iter().map(|&s| f(s)).collect()),
        ChunkAdjust::Explicit(sizes) if sizes.len() == seq.len() => Ok(sizes.clone()),
        ChunkAdjust::Explicit(sizes) => Err(PlanError::AdjustChunksMismatch {
            dim,
            blocks: seq.len(),
            given: sizes.len(),
        }),
    }
}
