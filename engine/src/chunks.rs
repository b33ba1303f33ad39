// chunks.rs — Chunk structure of an array
//
// A chunk structure lists, per dimension, the ordered sizes of its blocks.
// Block sizes along a dimension always sum to the array's extent; a
// zero-length dimension has a single empty block, and a zero-dimensional
// array has exactly one block with coordinate `[]`.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::PlanError;

/// Per-dimension block sizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunks(Vec<Vec<usize>>);

impl Chunks {
    /// Wrap explicit per-dimension block sizes.
    ///
    /// An empty size list for a dimension is normalised to a single empty
    /// block so every dimension has at least one block.
    pub fn new(dims: Vec<Vec<usize>>) -> Self {
        Chunks(
            dims.into_iter()
                .map(|d| if d.is_empty() { vec![0] } else { d })
                .collect(),
        )
    }

    /// Regular chunks of `chunksize` over `shape`; the last block along a
    /// dimension holds the remainder. Chunk sizes larger than the
    /// dimension are clamped to it.
    pub fn regular(shape: &[usize], chunksize: &[usize]) -> Result<Self, PlanError> {
        if shape.len() != chunksize.len() {
            return Err(PlanError::RankMismatch {
                expected: shape.len(),
                found: chunksize.len(),
            });
        }
        let mut dims = Vec::with_capacity(shape.len());
        for (dim, (&extent, &size)) in shape.iter().zip(chunksize).enumerate() {
            if extent == 0 {
                dims.push(vec![0]);
                continue;
            }
            if size == 0 {
                return Err(PlanError::InvalidChunkSize { dim });
            }
            dims.push(regular_dim(extent, size));
        }
        Ok(Chunks(dims))
    }

    /// One block spanning each whole dimension.
    pub fn single(shape: &[usize]) -> Self {
        Chunks(shape.iter().map(|&s| vec![s]).collect())
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[Vec<usize>] {
        &self.0
    }

    pub fn dim(&self, d: usize) -> &[usize] {
        &self.0[d]
    }

    pub fn into_dims(self) -> Vec<Vec<usize>> {
        self.0
    }

    /// Array extent along each dimension.
    pub fn shape(&self) -> Vec<usize> {
        self.0.iter().map(|d| d.iter().sum()).collect()
    }

    /// Number of blocks along each dimension.
    pub fn numblocks(&self) -> Vec<usize> {
        self.0.iter().map(Vec::len).collect()
    }

    /// Total number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.0.iter().map(Vec::len).product()
    }

    /// Size of the first block along each dimension.
    pub fn chunksize(&self) -> Vec<usize> {
        self.0.iter().map(|d| d[0]).collect()
    }

    /// Largest number of elements in any block.
    pub fn max_block_elements(&self) -> usize {
        self.0
            .iter()
            .map(|d| d.iter().copied().max().unwrap_or(0))
            .product()
    }

    /// All blocks but the last are equal along every dimension, and the
    /// last is no larger than the others.
    pub fn is_regular(&self) -> bool {
        self.0.iter().all(|d| match d.split_last() {
            Some((last, rest)) => {
                rest.iter().all(|&s| s == d[0]) && (rest.is_empty() || *last <= d[0])
            }
            None => true,
        })
    }

    /// The regular chunk size, or an error for irregular chunks.
    pub fn to_chunksize(&self) -> Result<Vec<usize>, PlanError> {
        if self.is_regular() {
            Ok(self.chunksize())
        } else {
            Err(PlanError::IrregularChunks(self.0.clone()))
        }
    }

    /// Start offset of every block along `dim`, followed by the extent.
    pub fn offsets(&self, dim: usize) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.0[dim].len() + 1);
        let mut acc = 0;
        offsets.push(0);
        for &s in &self.0[dim] {
            acc += s;
            offsets.push(acc);
        }
        offsets
    }

    pub fn block_shape(&self, coord: &[usize]) -> Vec<usize> {
        coord
            .iter()
            .zip(&self.0)
            .map(|(&i, d)| d[i])
            .collect()
    }

    pub fn block_elements(&self, coord: &[usize]) -> usize {
        coord.iter().zip(&self.0).map(|(&i, d)| d[i]).product()
    }

    /// Element ranges covered by the block at `coord`.
    pub fn block_region(&self, coord: &[usize]) -> Vec<Range<usize>> {
        coord
            .iter()
            .zip(&self.0)
            .map(|(&i, d)| {
                let start: usize = d[..i].iter().sum();
                start..start + d[i]
            })
            .collect()
    }

    /// Indices of the blocks along `dim` that intersect `range`.
    ///
    /// An empty range selects the single block containing its start.
    pub fn overlapping(&self, dim: usize, range: Range<usize>) -> Range<usize> {
        let offsets = self.offsets(dim);
        let n = self.0[dim].len();
        if range.start >= range.end {
            let i = offsets[..n]
                .partition_point(|&o| o <= range.start)
                .saturating_sub(1);
            return i..i + 1;
        }
        let first = offsets[1..].partition_point(|&end| end <= range.start);
        let last = offsets[..n].partition_point(|&start| start < range.end);
        first..last
    }

    /// Every block coordinate, in row-major order.
    pub fn grid(&self) -> GridIter {
        GridIter::new(self.numblocks())
    }

    pub fn contains_block(&self, coord: &[usize]) -> bool {
        coord.len() == self.0.len() && coord.iter().zip(&self.0).all(|(&i, d)| i < d.len())
    }
}

fn regular_dim(extent: usize, size: usize) -> Vec<usize> {
    let size = size.min(extent);
    let mut blocks = vec![size; extent / size];
    if extent % size != 0 {
        blocks.push(extent % size);
    }
    blocks
}

// ── Block grids ─────────────────────────────────────────────────────────────

/// Row-major iterator over the coordinates of a block grid.
///
/// A grid with no dimensions yields the single coordinate `[]`; a grid with
/// a zero-length dimension yields nothing.
#[derive(Debug, Clone)]
pub struct GridIter {
    shape: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl GridIter {
    pub fn new(shape: Vec<usize>) -> Self {
        let next = if shape.iter().any(|&n| n == 0) {
            None
        } else {
            Some(vec![0; shape.len()])
        };
        GridIter { shape, next }
    }
}

impl Iterator for GridIter {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let current = self.next.take()?;
        let mut advanced = current.clone();
        for d in (0..self.shape.len()).rev() {
            advanced[d] += 1;
            if advanced[d] < self.shape[d] {
                self.next = Some(advanced);
                return Some(current);
            }
            advanced[d] = 0;
        }
        Some(current)
    }
}

// ── Reconciliation ──────────────────────────────────────────────────────────

/// Least-refined block sizes whose boundaries include every boundary of
/// each input sequence. All inputs must cover the same extent.
pub fn common_blockdim(label: char, sequences: &[&[usize]]) -> Result<Vec<usize>, PlanError> {
    let Some(first) = sequences.first() else {
        return Ok(Vec::new());
    };
    let total: usize = first.iter().sum();
    for seq in &sequences[1..] {
        let other: usize = seq.iter().sum();
        if other != total {
            return Err(PlanError::ChunkMismatch {
                label,
                first: total,
                second: other,
            });
        }
    }
    if sequences.iter().all(|s| s == first) {
        return Ok(first.to_vec());
    }
    if total == 0 {
        return Ok(vec![0]);
    }

    let mut boundaries: Vec<usize> = sequences
        .iter()
        .flat_map(|seq| {
            seq.iter().scan(0usize, |acc, &s| {
                *acc += s;
                Some(*acc)
            })
        })
        .collect();
    boundaries.sort_unstable();
    boundaries.dedup();

    let mut prev = 0;
    Ok(boundaries
        .into_iter()
        .filter(|&b| b > 0)
        .map(|b| {
            let size = b - prev;
            prev = b;
            size
        })
        .collect())
}
