// pipeline.rs — Block programs, stages, and primitive operations
//
// A `BlockProgram` computes one output block: it looks up the input keys
// for the coordinate, reads (or recomputes) each operand's blocks, joins
// them, and applies its block function. Fusion nests a producer's program
// in place of the stored operand it used to read.
//
// A stage runs one program over every block of its target store. A
// pipeline is an ordered list of stages separated by barriers.
//
// Preconditions: every stored operand's store exists before a task runs.
// Postconditions: a task writes exactly its own output block.
// Failure modes: store reads/writes and block functions return `TaskError`.
// Side effects: `Stage::run_task` writes one block to the target store.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::block::Block;
use crate::chunks::GridIter;
use crate::error::TaskError;
use crate::func::BlockFunction;
use crate::id::ArrayId;
use crate::index::{InputKeys, KeyFunction};
use crate::memory::MemoryBudget;
use crate::store::StoreHandle;

// ── Block programs ──────────────────────────────────────────────────────────

/// Where a program's operand blocks come from.
#[derive(Debug, Clone)]
pub enum Operand {
    /// Read from an array's store.
    Stored {
        array: ArrayId,
        store: Arc<StoreHandle>,
    },
    /// Recomputed in-process by a fused producer program.
    Fused(Box<BlockProgram>),
}

impl Operand {
    fn read(&self, coord: &[usize]) -> Result<Block, TaskError> {
        match self {
            Operand::Stored { store, .. } => Ok(store.read_block(coord)?),
            Operand::Fused(program) => program.compute(coord),
        }
    }
}

/// Computes output blocks from operand blocks.
#[derive(Debug, Clone)]
pub struct BlockProgram {
    pub keys: KeyFunction,
    pub function: BlockFunction,
    pub operands: Vec<Operand>,
}

impl BlockProgram {
    pub fn new(keys: KeyFunction, function: BlockFunction, operands: Vec<Operand>) -> Self {
        BlockProgram {
            keys,
            function,
            operands,
        }
    }

    /// Compute output block `out_coord`.
    pub fn compute(&self, out_coord: &[usize]) -> Result<Block, TaskError> {
        let keys = self.keys.keys(out_coord);
        if keys.len() != self.operands.len() {
            return Err(TaskError::Keys {
                coord: out_coord.to_vec(),
                expected: self.operands.len(),
                got: keys.len(),
            });
        }
        let mut joined = Vec::with_capacity(keys.len());
        for (key, operand) in keys.iter().zip(&self.operands) {
            joined.push(read_joined(operand, key)?);
        }
        Ok(self.function.apply(out_coord, &keys, joined)?)
    }

    /// Stored arrays this program reads, in operand order, with repeats.
    /// Side inputs follow a program's own operands.
    pub fn leaves(&self) -> Vec<ArrayId> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut Vec<ArrayId>) {
        for operand in &self.operands {
            match operand {
                Operand::Stored { array, .. } => out.push(*array),
                Operand::Fused(p) => p.collect_leaves(out),
            }
        }
        out.extend(self.function.side_inputs().iter().map(|s| s.array));
    }

    /// Side-input arrays read anywhere in this program. They are never
    /// replaced by fusion.
    pub fn side_inputs(&self) -> Vec<ArrayId> {
        let mut out: Vec<ArrayId> = self.function.side_inputs().iter().map(|s| s.array).collect();
        for operand in &self.operands {
            if let Operand::Fused(p) = operand {
                out.extend(p.side_inputs());
            }
        }
        out
    }

    /// Replace every stored operand reading an array in `producers` with
    /// that array's producer program. Inserted programs are not rewritten
    /// again. Returns how many operands were replaced.
    pub fn substitute(&mut self, producers: &BTreeMap<ArrayId, BlockProgram>) -> usize {
        let mut replaced = 0;
        for operand in &mut self.operands {
            match operand {
                Operand::Stored { array, .. } => {
                    if let Some(p) = producers.get(array) {
                        *operand = Operand::Fused(Box::new(p.clone()));
                        replaced += 1;
                    }
                }
                Operand::Fused(inner) => replaced += inner.substitute(producers),
            }
        }
        replaced
    }

    /// Nesting depth: 1 for a program reading only stored arrays.
    pub fn depth(&self) -> usize {
        1 + self
            .operands
            .iter()
            .map(|op| match op {
                Operand::Stored { .. } => 0,
                Operand::Fused(p) => p.depth(),
            })
            .max()
            .unwrap_or(0)
    }

    /// Human-readable composition, e.g. `negative(astype[float32](array-001))`.
    pub fn describe(&self) -> String {
        let args: Vec<String> = self
            .operands
            .iter()
            .map(|op| match op {
                Operand::Stored { array, .. } => array.to_string(),
                Operand::Fused(p) => p.describe(),
            })
            .collect();
        format!("{}({})", self.function.describe(), args.join(", "))
    }
}

fn read_joined(operand: &Operand, key: &InputKeys) -> Result<Block, TaskError> {
    match key {
        InputKeys::One(coord) => operand.read(coord),
        InputKeys::Many { coords, grid, axes } => {
            let parts = coords
                .iter()
                .map(|c| operand.read(c))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Block::assemble(parts, grid, axes)?)
        }
    }
}

// ── Stages and pipelines ────────────────────────────────────────────────────

/// One barrier-delimited stage: a program run for every target block.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub program: BlockProgram,
    pub target: Arc<StoreHandle>,
}

impl Stage {
    pub fn num_tasks(&self) -> usize {
        self.target.meta().chunks.num_blocks()
    }

    /// Output block coordinates, one per task.
    pub fn task_coords(&self) -> GridIter {
        self.target.meta().chunks.grid()
    }

    /// Compute and write one output block. Idempotent.
    pub fn run_task(&self, coord: &[usize]) -> Result<(), TaskError> {
        let block = self.program.compute(coord)?;
        Ok(self.target.write_block(coord, block)?)
    }
}

/// Ordered stages; stage k+1 starts only after stage k completes.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn single(stage: Stage) -> Self {
        Pipeline {
            stages: vec![stage],
        }
    }

    pub fn num_tasks(&self) -> usize {
        self.stages.iter().map(Stage::num_tasks).sum()
    }

    /// Every store a stage writes.
    pub fn targets(&self) -> impl Iterator<Item = &Arc<StoreHandle>> + '_ {
        self.stages.iter().map(|s| &s.target)
    }
}

// ── Primitive operations ────────────────────────────────────────────────────

/// The compiled form of one operation node.
#[derive(Debug, Clone)]
pub struct PrimitiveOp {
    pub pipeline: Pipeline,
    /// Store holding the operation's result.
    pub target: Arc<StoreHandle>,
    /// Worst-case memory of any task, including `budget.reserved_mem`.
    pub projected_mem: u64,
    pub budget: MemoryBudget,
    pub num_tasks: usize,
    /// Only single-stage blockwise operations may be fused.
    pub fusable: bool,
    /// Most blocks one task reads from each leaf operand.
    pub num_input_blocks: Vec<usize>,
}

impl PrimitiveOp {
    pub fn num_stages(&self) -> usize {
        self.pipeline.stages.len()
    }

    /// The program of a single-stage operation.
    pub fn program(&self) -> Option<&BlockProgram> {
        match self.pipeline.stages.as_slice() {
            [stage] => Some(&stage.program),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::Chunks;
    use crate::dtype::DType;
    use crate::func::Kernel;
    use crate::index::BlockwiseKeys;
    use crate::store::{ArrayMeta, InMemoryArrayStore, MemoryStoreFactory};

    fn source(id: u32) -> Operand {
        let data = Block::from_vec(&[4], vec![1i64, 2, 3, 4]).unwrap();
        let chunks = Chunks::regular(&[4], &[2]).unwrap();
        let store = InMemoryArrayStore::new(data, chunks).unwrap();
        Operand::Stored {
            array: ArrayId(id),
            store: Arc::new(StoreHandle::open(format!("src{id}"), Arc::new(store))),
        }
    }

    fn unary(kernel: Kernel, operand: Operand) -> BlockProgram {
        BlockProgram::new(
            KeyFunction::Blockwise(BlockwiseKeys::new(&['i'], &[(&['i'], vec![2])])),
            BlockFunction::Map(kernel),
            vec![operand],
        )
    }

    #[test]
    fn fused_program_recomputes_producer_blocks() {
        let producer = unary(Kernel::Negative, source(1));
        let mut consumer = unary(Kernel::AsType(DType::Float32), source(2));
        assert_eq!(consumer.substitute(&BTreeMap::from([(ArrayId(2), producer)])), 1);
        assert_eq!(consumer.leaves(), vec![ArrayId(1)]);
        assert_eq!(consumer.depth(), 2);
        assert_eq!(consumer.describe(), "astype[float32](negative(array-001))");
        assert_eq!(
            consumer.compute(&[1]).unwrap(),
            Block::from_vec(&[2], vec![-3.0f32, -4.0]).unwrap()
        );
    }

    #[test]
    fn stage_writes_its_target_block() {
        let meta = ArrayMeta::new(DType::Int64, Chunks::regular(&[4], &[2]).unwrap());
        let target = Arc::new(StoreHandle::lazy("t", meta, Arc::new(MemoryStoreFactory)));
        target.create().unwrap();
        let stage = Stage {
            name: "neg".to_string(),
            program: unary(Kernel::Negative, source(1)),
            target: target.clone(),
        };
        assert_eq!(stage.num_tasks(), 2);
        for coord in stage.task_coords() {
            stage.run_task(&coord).unwrap();
        }
        assert_eq!(
            target.read_all().unwrap(),
            Block::from_vec(&[4], vec![-1i64, -2, -3, -4]).unwrap()
        );
    }
}
