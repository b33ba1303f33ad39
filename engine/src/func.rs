// func.rs — Per-block functions
//
// A block function turns the blocks a task reads into the one block it
// writes. The set is closed: plain maps over a kernel, maps that also see
// the output block coordinate, direct maps over side-input stores, keepdims
// reductions, and the region merge used by rechunk. Operand blocks arrive
// already joined, one per operand (see `InputKeys::Many`).

use std::fmt;
use std::sync::Arc;

use crate::block::{BinaryOp, Block, Reducer};
use crate::chunks::Chunks;
use crate::dtype::DType;
use crate::error::{BlockError, TaskError};
use crate::id::ArrayId;
use crate::index::InputKeys;
use crate::store::{ArrayMeta, StoreHandle};

type KernelFn = dyn Fn(&[Block]) -> Result<Block, BlockError> + Send + Sync;
type BlockIdFn = dyn Fn(&[Block], &[usize]) -> Result<Block, BlockError> + Send + Sync;
type DirectFn = dyn Fn(&DirectTask<'_>) -> Result<Block, TaskError> + Send + Sync;

/// A caller-supplied kernel.
#[derive(Clone)]
pub struct CustomKernel {
    name: String,
    func: Arc<KernelFn>,
}

impl CustomKernel {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&[Block]) -> Result<Block, BlockError> + Send + Sync + 'static,
    ) -> Self {
        CustomKernel {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for CustomKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CustomKernel({})", self.name)
    }
}

/// A kernel that also receives the coordinate of the block it computes.
#[derive(Clone)]
pub struct BlockIdKernel {
    name: String,
    func: Arc<BlockIdFn>,
}

impl BlockIdKernel {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&[Block], &[usize]) -> Result<Block, BlockError> + Send + Sync + 'static,
    ) -> Self {
        BlockIdKernel {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for BlockIdKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockIdKernel({})", self.name)
    }
}

// ── Direct maps ─────────────────────────────────────────────────────────────

/// An array a direct kernel reads from its store instead of through keys.
#[derive(Debug, Clone)]
pub struct SideInput {
    pub array: ArrayId,
    pub store: Arc<StoreHandle>,
}

impl SideInput {
    pub fn new(array: ArrayId, store: Arc<StoreHandle>) -> Self {
        SideInput { array, store }
    }
}

/// One output block of a direct map: its coordinate, shape and dtype, and
/// read access to the side inputs.
pub struct DirectTask<'a> {
    pub block_id: &'a [usize],
    pub shape: &'a [usize],
    pub dtype: DType,
    inputs: &'a [SideInput],
}

impl DirectTask<'_> {
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn meta(&self, input: usize) -> Option<&ArrayMeta> {
        self.inputs.get(input).map(|s| s.store.meta())
    }

    /// Block `coord` of side input `input`.
    pub fn read_block(&self, input: usize, coord: &[usize]) -> Result<Block, TaskError> {
        let side = self.inputs.get(input).ok_or(TaskError::SideInput {
            index: input,
            count: self.inputs.len(),
        })?;
        Ok(side.store.read_block(coord)?)
    }
}

/// A kernel that builds each output block from side inputs.
#[derive(Clone)]
pub struct DirectKernel {
    name: String,
    func: Arc<DirectFn>,
}

impl DirectKernel {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&DirectTask<'_>) -> Result<Block, TaskError> + Send + Sync + 'static,
    ) -> Self {
        DirectKernel {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for DirectKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirectKernel({})", self.name)
    }
}

// ── Kernels ─────────────────────────────────────────────────────────────────

/// Block-level kernels applied by `BlockFunction::Map`.
#[derive(Debug, Clone)]
pub enum Kernel {
    Identity,
    Negative,
    Positive,
    Abs,
    Binary(BinaryOp),
    AsType(DType),
    Outer,
    PermuteDims(Vec<usize>),
    Squeeze(Vec<usize>),
    Custom(CustomKernel),
}

impl Kernel {
    pub fn name(&self) -> String {
        match self {
            Kernel::Identity => "identity".to_string(),
            Kernel::Negative => "negative".to_string(),
            Kernel::Positive => "positive".to_string(),
            Kernel::Abs => "abs".to_string(),
            Kernel::Binary(op) => format!("{op:?}").to_lowercase(),
            Kernel::AsType(dtype) => format!("astype[{dtype}]"),
            Kernel::Outer => "outer".to_string(),
            Kernel::PermuteDims(axes) => format!("permute_dims{axes:?}"),
            Kernel::Squeeze(axes) => format!("squeeze{axes:?}"),
            Kernel::Custom(k) => k.name.clone(),
        }
    }

    fn arity(&self) -> Option<usize> {
        match self {
            Kernel::Binary(_) | Kernel::Outer => Some(2),
            Kernel::Custom(_) => None,
            _ => Some(1),
        }
    }

    pub fn apply(&self, blocks: &[Block]) -> Result<Block, BlockError> {
        if let Some(expected) = self.arity() {
            if blocks.len() != expected {
                return Err(BlockError::Arity {
                    kernel: self.static_name(),
                    expected,
                    got: blocks.len(),
                });
            }
        }
        match self {
            Kernel::Identity | Kernel::Positive => Ok(blocks[0].clone()),
            Kernel::Negative => Ok(blocks[0].negative()),
            Kernel::Abs => Ok(blocks[0].abs()),
            Kernel::Binary(op) => Block::binary(*op, &blocks[0], &blocks[1]),
            Kernel::AsType(dtype) => Ok(blocks[0].astype(*dtype)),
            Kernel::Outer => Block::outer(&blocks[0], &blocks[1]),
            Kernel::PermuteDims(axes) => blocks[0].permute(axes),
            Kernel::Squeeze(axes) => blocks[0].squeeze(axes),
            Kernel::Custom(k) => (k.func)(blocks),
        }
    }

    fn static_name(&self) -> &'static str {
        match self {
            Kernel::Identity => "identity",
            Kernel::Negative => "negative",
            Kernel::Positive => "positive",
            Kernel::Abs => "abs",
            Kernel::Binary(_) => "binary",
            Kernel::AsType(_) => "astype",
            Kernel::Outer => "outer",
            Kernel::PermuteDims(_) => "permute_dims",
            Kernel::Squeeze(_) => "squeeze",
            Kernel::Custom(_) => "custom",
        }
    }
}

/// The function a stage applies to produce each output block.
#[derive(Debug, Clone)]
pub enum BlockFunction {
    /// Apply a kernel to the operand blocks.
    Map(Kernel),
    /// Apply a kernel to the operand blocks and the output coordinate.
    MapWithBlockId(BlockIdKernel),
    /// Build each block from `inputs`; operand 0 only fixes its shape.
    Direct {
        kernel: DirectKernel,
        inputs: Vec<SideInput>,
    },
    /// Reduce operand 0 over `axes`.
    Reduce {
        reducer: Reducer,
        axes: Vec<usize>,
        keepdims: bool,
    },
    /// Cut the target block out of the joined source blocks that overlap it.
    Merge { source: Chunks, target: Chunks },
}

impl BlockFunction {
    /// Compute output block `out_coord` from one joined block per operand.
    pub fn apply(
        &self,
        out_coord: &[usize],
        keys: &[InputKeys],
        blocks: Vec<Block>,
    ) -> Result<Block, TaskError> {
        match self {
            BlockFunction::Map(kernel) => Ok(kernel.apply(&blocks)?),
            BlockFunction::MapWithBlockId(kernel) => Ok((kernel.func)(&blocks, out_coord)?),
            BlockFunction::Direct { kernel, inputs } => {
                let Some(template) = blocks.first() else {
                    return Err(BlockError::Arity {
                        kernel: "direct",
                        expected: 1,
                        got: 0,
                    }
                    .into());
                };
                let task = DirectTask {
                    block_id: out_coord,
                    shape: template.shape(),
                    dtype: template.dtype(),
                    inputs,
                };
                (kernel.func)(&task)
            }
            BlockFunction::Reduce {
                reducer,
                axes,
                keepdims,
            } => match blocks.first() {
                Some(block) => Ok(block.reduce(*reducer, axes, *keepdims)?),
                None => Err(BlockError::Arity {
                    kernel: "reduce",
                    expected: 1,
                    got: 0,
                }
                .into()),
            },
            BlockFunction::Merge { source, target } => {
                let (Some(block), Some(key)) = (blocks.into_iter().next(), keys.first()) else {
                    return Err(BlockError::Arity {
                        kernel: "merge",
                        expected: 1,
                        got: 0,
                    }
                    .into());
                };
                Ok(merge_region(source, target, out_coord, key, &block)?)
            }
        }
    }

    /// Arrays read directly from their stores, outside the operand keys.
    pub fn side_inputs(&self) -> &[SideInput] {
        match self {
            BlockFunction::Direct { inputs, .. } => inputs,
            _ => &[],
        }
    }

    pub fn describe(&self) -> String {
        match self {
            BlockFunction::Map(kernel) => kernel.name(),
            BlockFunction::MapWithBlockId(kernel) => format!("{}[block_id]", kernel.name),
            BlockFunction::Direct { kernel, .. } => format!("{}[direct]", kernel.name),
            BlockFunction::Reduce {
                reducer,
                axes,
                keepdims,
            } => format!("{reducer}{axes:?}{}", if *keepdims { "[keepdims]" } else { "" }),
            BlockFunction::Merge { .. } => "merge".to_string(),
        }
    }
}

/// Slice target block `out_coord` out of the joined source blocks named by
/// `key`, whose first coordinate is the joined block's origin.
fn merge_region(
    source: &Chunks,
    target: &Chunks,
    out_coord: &[usize],
    key: &InputKeys,
    joined: &Block,
) -> Result<Block, BlockError> {
    let origin = key.coords().first().map(|c| c.to_vec()).unwrap_or_default();
    let region = target.block_region(out_coord);
    let local: Vec<_> = region
        .into_iter()
        .enumerate()
        .map(|(dim, r)| {
            let start = source.offsets(dim)[origin[dim]];
            r.start - start..r.end - start
        })
        .collect();
    joined.slice(&local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::OverlapKeys;

    fn ints(shape: &[usize], data: Vec<i64>) -> Block {
        Block::from_vec(shape, data).unwrap()
    }

    #[test]
    fn map_checks_arity() {
        let a = ints(&[2], vec![1, 2]);
        assert!(matches!(
            Kernel::Binary(BinaryOp::Add).apply(&[a.clone()]),
            Err(BlockError::Arity { expected: 2, got: 1, .. })
        ));
        assert_eq!(Kernel::Negative.apply(&[a]).unwrap(), ints(&[2], vec![-1, -2]));
    }

    #[test]
    fn custom_kernels_run() {
        let double = CustomKernel::new("double", |bs: &[Block]| {
            Block::binary(BinaryOp::Add, &bs[0], &bs[0])
        });
        let out = Kernel::Custom(double).apply(&[ints(&[1], vec![21])]).unwrap();
        assert_eq!(out, ints(&[1], vec![42]));
    }

    #[test]
    fn reduce_uses_first_operand() {
        let f = BlockFunction::Reduce {
            reducer: Reducer::Sum,
            axes: vec![0],
            keepdims: true,
        };
        let out = f
            .apply(&[0], &[InputKeys::One(vec![0])], vec![ints(&[3], vec![1, 2, 3])])
            .unwrap();
        assert_eq!(out, ints(&[1], vec![6]));
    }

    #[test]
    fn merge_cuts_target_region() {
        let source = Chunks::new(vec![vec![2, 2, 2]]);
        let target = Chunks::new(vec![vec![3, 3]]);
        let key = OverlapKeys::new(source.clone(), target.clone()).keys(&[1]);
        // Source blocks 1 and 2 cover elements 2..6.
        let joined = ints(&[4], vec![2, 3, 4, 5]);
        let f = BlockFunction::Merge { source, target };
        let out = f.apply(&[1], &[key], vec![joined]).unwrap();
        assert_eq!(out, ints(&[3], vec![3, 4, 5]));
    }
}
