// executor.rs — Stage executors and progress callbacks
//
// An executor runs every task of one stage. Tasks within a stage are
// independent; the plan executor (`schedule::execute_plan`) supplies the
// barrier between stages by calling `execute_stage` once per stage.
//
// Preconditions: the stage's target store and every store it reads exist.
// Postconditions: on `Ok`, every output block of the stage has been written.
// Failure modes: a task still failing after `retries` re-runs → `TaskFailure`.
// Side effects: writes blocks; invokes callbacks once per completed task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::warn;

use crate::error::{ExecError, TaskError};
use crate::pipeline::Stage;

// ── Callbacks ───────────────────────────────────────────────────────────────

/// Emitted before the first task of a computation.
#[derive(Debug, Clone)]
pub struct ComputeStartEvent {
    pub num_ops: usize,
    pub num_tasks: usize,
}

/// Emitted after each completed task.
#[derive(Debug, Clone)]
pub struct TaskEndEvent {
    /// Store the task wrote (or created).
    pub array: String,
    /// Stage name, or `create-arrays` for store creation.
    pub stage: String,
    pub num_tasks: usize,
    /// Runs needed, 1 when the first attempt succeeded.
    pub attempts: usize,
    pub elapsed: Duration,
}

/// Emitted once after the last task.
#[derive(Debug, Clone)]
pub struct ComputeEndEvent {
    pub num_tasks: usize,
    pub elapsed: Duration,
}

/// Observer of a running computation. All methods default to no-ops.
pub trait Callback: Send + Sync {
    fn on_compute_start(&self, _event: &ComputeStartEvent) {}
    fn on_task_end(&self, _event: &TaskEndEvent) {}
    fn on_compute_end(&self, _event: &ComputeEndEvent) {}
}

/// Counts completed tasks.
#[derive(Debug, Default)]
pub struct TaskCounter {
    value: AtomicUsize,
}

impl TaskCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }
}

impl Callback for TaskCounter {
    fn on_task_end(&self, event: &TaskEndEvent) {
        self.value.fetch_add(event.num_tasks, Ordering::SeqCst);
    }
}

// ── Executors ───────────────────────────────────────────────────────────────

/// A task that failed on its last attempt.
#[derive(Debug)]
pub struct TaskFailure {
    pub coord: Vec<usize>,
    pub error: TaskError,
}

/// Runs the tasks of one stage.
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run every task of `stage`, returning once all have completed or one
    /// has failed for good.
    fn execute_stage(&self, stage: &Stage, callbacks: &[&dyn Callback]) -> Result<(), TaskFailure>;
}

/// Runs tasks one after another on the calling thread.
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor {
    pub retries: usize,
}

impl SequentialExecutor {
    pub fn new(retries: usize) -> Self {
        SequentialExecutor { retries }
    }
}

impl Executor for SequentialExecutor {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn execute_stage(&self, stage: &Stage, callbacks: &[&dyn Callback]) -> Result<(), TaskFailure> {
        for coord in stage.task_coords() {
            run_task(stage, &coord, self.retries, callbacks)?;
        }
        Ok(())
    }
}

/// Runs a stage's tasks in parallel on a rayon thread pool.
#[derive(Debug)]
pub struct ThreadPoolExecutor {
    pool: rayon::ThreadPool,
    pub retries: usize,
}

impl ThreadPoolExecutor {
    /// `threads: None` uses rayon's default (one per core).
    pub fn new(threads: Option<usize>, retries: usize) -> Result<Self, ExecError> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(n) = threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| ExecError::ThreadPool(e.to_string()))?;
        Ok(ThreadPoolExecutor { pool, retries })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Executor for ThreadPoolExecutor {
    fn name(&self) -> &'static str {
        "threads"
    }

    fn execute_stage(&self, stage: &Stage, callbacks: &[&dyn Callback]) -> Result<(), TaskFailure> {
        let coords: Vec<Vec<usize>> = stage.task_coords().collect();
        self.pool.install(|| {
            coords
                .par_iter()
                .try_for_each(|coord| run_task(stage, coord, self.retries, callbacks))
        })
    }
}

/// Run one task, re-running only it on failure, then report it.
fn run_task(
    stage: &Stage,
    coord: &[usize],
    retries: usize,
    callbacks: &[&dyn Callback],
) -> Result<(), TaskFailure> {
    let start = Instant::now();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match stage.run_task(coord) {
            Ok(()) => break,
            Err(error) if attempt <= retries => {
                warn!(
                    stage = %stage.name,
                    array = stage.target.name(),
                    coord = ?coord,
                    attempt,
                    %error,
                    "task failed, retrying"
                );
            }
            Err(error) => {
                return Err(TaskFailure {
                    coord: coord.to_vec(),
                    error,
                })
            }
        }
    }
    let event = TaskEndEvent {
        array: stage.target.name().to_string(),
        stage: stage.name.clone(),
        num_tasks: 1,
        attempts: attempt,
        elapsed: start.elapsed(),
    };
    for cb in callbacks {
        cb.on_task_end(&event);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use super::*;
    use crate::block::Block;
    use crate::chunks::Chunks;
    use crate::dtype::{DType, Scalar};
    use crate::error::BlockError;
    use crate::func::{BlockFunction, CustomKernel, Kernel};
    use crate::id::ArrayId;
    use crate::index::{BlockwiseKeys, KeyFunction};
    use crate::pipeline::{BlockProgram, Operand};
    use crate::store::{ArrayMeta, FullStore, MemoryStoreFactory, StoreHandle};

    fn stage(kernel: Kernel) -> Stage {
        let meta = ArrayMeta::new(DType::Int64, Chunks::regular(&[6], &[2]).unwrap());
        let source = StoreHandle::open("ones", Arc::new(FullStore::new(meta.clone(), Scalar::Int(1))));
        let target = Arc::new(StoreHandle::lazy("out", meta, Arc::new(MemoryStoreFactory)));
        target.create().unwrap();
        Stage {
            name: "blockwise".to_string(),
            program: BlockProgram::new(
                KeyFunction::Blockwise(BlockwiseKeys::new(&['i'], &[(&['i'], vec![3])])),
                BlockFunction::Map(kernel),
                vec![Operand::Stored {
                    array: ArrayId(1),
                    store: Arc::new(source),
                }],
            ),
            target,
        }
    }

    #[test]
    fn sequential_runs_every_task() {
        let stage = stage(Kernel::Negative);
        let counter = TaskCounter::new();
        SequentialExecutor::new(0)
            .execute_stage(&stage, &[&counter])
            .unwrap();
        assert_eq!(counter.value(), 3);
        assert_eq!(
            stage.target.read_all().unwrap(),
            Block::from_vec(&[6], vec![-1i64; 6]).unwrap()
        );
    }

    #[test]
    fn thread_pool_runs_every_task() {
        let stage = stage(Kernel::Negative);
        let counter = TaskCounter::new();
        let executor = ThreadPoolExecutor::new(Some(2), 0).unwrap();
        assert_eq!(executor.num_threads(), 2);
        executor.execute_stage(&stage, &[&counter]).unwrap();
        assert_eq!(counter.value(), 3);
    }

    fn flaky() -> Kernel {
        let failed = Arc::new(AtomicBool::new(false));
        Kernel::Custom(CustomKernel::new("flaky", move |blocks: &[Block]| {
            if !failed.swap(true, Ordering::SeqCst) {
                return Err(BlockError::Kernel("transient".to_string()));
            }
            Ok(blocks[0].clone())
        }))
    }

    #[test]
    fn failed_task_is_retried() {
        let stage = stage(flaky());
        let counter = TaskCounter::new();
        SequentialExecutor::new(1)
            .execute_stage(&stage, &[&counter])
            .unwrap();
        assert_eq!(counter.value(), 3);
    }

    #[test]
    fn failure_without_retries_names_the_block() {
        let stage = stage(flaky());
        let err = SequentialExecutor::new(0)
            .execute_stage(&stage, &[])
            .unwrap_err();
        assert_eq!(err.coord, vec![0]);
        assert!(err.error.to_string().contains("transient"));
    }
}
