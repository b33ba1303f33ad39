// array.rs — Plan-builder context, lazy arrays, and compute
//
// A `Context` owns the identifier allocator, the growing plan graph, and the
// resource spec. Every array-producing call records an op and its output
// array in the context's graph and returns an `Array` handle; nothing runs
// until `compute`.
//
// Preconditions: arrays passed together come from the same context.
// Postconditions: `compute` returns one block per requested array, in order.
// Failure modes: plan errors at record time; `ExecError` from compute.
// Side effects: `compute` creates stores and runs tasks.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::block::Block;
use crate::chunks::Chunks;
use crate::config::Spec;
use crate::dot;
use crate::dtype::DType;
use crate::error::{ExecError, PlanError};
use crate::executor::{Callback, Executor, SequentialExecutor, ThreadPoolExecutor};
use crate::graph::{ArrayNode, OpNode, PlanGraph};
use crate::id::{ArrayId, IdAllocator, OpId};
use crate::memory::MemoryBudget;
use crate::optimize::{optimize, OptimizePolicy};
use crate::pipeline::PrimitiveOp;
use crate::schedule::execute_plan;
use crate::store::{ArrayMeta, StoreFactory, StoreHandle};

// ── Context ─────────────────────────────────────────────────────────────────

/// Shared state of one plan: ids, the graph, and the resource spec.
pub struct Context {
    ids: IdAllocator,
    graph: Mutex<PlanGraph>,
    spec: Spec,
    budget: MemoryBudget,
    factory: Arc<dyn StoreFactory>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("spec", &self.spec)
            .field("factory", &self.factory)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new(spec: Spec) -> Result<Arc<Self>, PlanError> {
        let factory = spec.store_factory();
        Self::with_factory(spec, factory)
    }

    /// A context whose materialized arrays are created by `factory`.
    pub fn with_factory(spec: Spec, factory: Arc<dyn StoreFactory>) -> Result<Arc<Self>, PlanError> {
        let budget = spec.budget()?;
        Ok(Arc::new(Context {
            ids: IdAllocator::new(),
            graph: Mutex::new(PlanGraph::new()),
            spec,
            budget,
            factory,
        }))
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub fn budget(&self) -> MemoryBudget {
        self.budget
    }

    /// Snapshot of every node recorded so far.
    pub fn graph(&self) -> PlanGraph {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlanGraph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn alloc_array(&self) -> ArrayId {
        self.ids.alloc_array()
    }

    /// A lazily created store for a new array.
    pub(crate) fn lazy_store(&self, id: ArrayId, meta: ArrayMeta) -> Arc<StoreHandle> {
        Arc::new(StoreHandle::lazy(id.to_string(), meta, self.factory.clone()))
    }

    /// Staging store for a rechunk producing `id`.
    pub(crate) fn intermediate_store(&self, id: ArrayId, meta: ArrayMeta) -> Arc<StoreHandle> {
        Arc::new(StoreHandle::lazy(
            format!("{id}-intermediate"),
            meta,
            self.factory.clone(),
        ))
    }

    /// Record an op producing array `id` and return its handle.
    pub(crate) fn record(
        self: &Arc<Self>,
        kind: &str,
        id: ArrayId,
        store: Arc<StoreHandle>,
        primitive: Option<PrimitiveOp>,
        sources: Vec<ArrayId>,
    ) -> Array {
        let op = self.ids.alloc_op();
        let meta = store.meta().clone();
        let array = ArrayNode {
            id,
            meta: meta.clone(),
            store: store.clone(),
            producer: op,
        };
        let node = OpNode {
            id: op,
            kind: kind.to_string(),
            primitive,
            sources,
            output: id,
            fused: Vec::new(),
        };
        tracing::debug!(%op, %id, kind, shape = ?meta.shape, "recorded op");
        self.lock().add_op(node, array);
        Array {
            ctx: self.clone(),
            id,
            op,
            meta,
            store,
        }
    }
}

// ── Array ───────────────────────────────────────────────────────────────────

/// A lazily computed chunked array.
#[derive(Debug, Clone)]
pub struct Array {
    ctx: Arc<Context>,
    id: ArrayId,
    op: OpId,
    meta: ArrayMeta,
    store: Arc<StoreHandle>,
}

impl Array {
    pub fn id(&self) -> ArrayId {
        self.id
    }

    /// The op that produces this array.
    pub fn op(&self) -> OpId {
        self.op
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn meta(&self) -> &ArrayMeta {
        &self.meta
    }

    pub fn store(&self) -> &Arc<StoreHandle> {
        &self.store
    }

    pub fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype
    }

    pub fn chunks(&self) -> &Chunks {
        &self.meta.chunks
    }

    pub fn ndim(&self) -> usize {
        self.meta.ndim()
    }

    pub fn numblocks(&self) -> Vec<usize> {
        self.meta.chunks.numblocks()
    }

    pub fn chunksize(&self) -> Vec<usize> {
        self.meta.chunks.chunksize()
    }

    /// This array and everything it depends on.
    pub fn plan(&self) -> PlanGraph {
        self.ctx.lock().ancestors_of(&[self.id])
    }

    pub fn compute(&self) -> Result<Block, ExecError> {
        self.compute_with(&ComputeOptions::default())
    }

    pub fn compute_with(&self, options: &ComputeOptions) -> Result<Block, ExecError> {
        let mut blocks = compute(&[self], options)?;
        blocks
            .pop()
            .ok_or_else(|| ExecError::Verification("no result".to_string()))
    }

    /// Graphviz rendering of this array's optimized plan.
    pub fn visualize(&self, policy: &OptimizePolicy) -> Result<String, PlanError> {
        visualize(&[self], policy)
    }
}

/// Fail unless every array belongs to the first array's context.
pub(crate) fn same_context<'a>(arrays: &[&'a Array]) -> Result<&'a Arc<Context>, PlanError> {
    let Some(first) = arrays.first() else {
        return Err(PlanError::OperandCountMismatch {
            expected: 1,
            found: 0,
        });
    };
    if arrays.iter().any(|a| !Arc::ptr_eq(&a.ctx, &first.ctx)) {
        return Err(PlanError::ContextMismatch);
    }
    Ok(&first.ctx)
}

// ── Compute ─────────────────────────────────────────────────────────────────

/// How to run a computation.
#[derive(Clone, Default)]
pub struct ComputeOptions {
    pub policy: OptimizePolicy,
    pub callbacks: Vec<Arc<dyn Callback>>,
    /// Overrides the executor chosen from the context's spec.
    pub executor: Option<Arc<dyn Executor>>,
}

impl fmt::Debug for ComputeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeOptions")
            .field("policy", &self.policy)
            .field("callbacks", &self.callbacks.len())
            .field("executor", &self.executor.as_ref().map(|e| e.name()))
            .finish()
    }
}

impl ComputeOptions {
    pub fn with_policy(mut self, policy: OptimizePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }
}

/// The plan needed to produce `arrays`, with them as requested outputs.
pub fn arrays_to_plan(arrays: &[&Array]) -> Result<PlanGraph, PlanError> {
    let ctx = same_context(arrays)?;
    let ids: Vec<ArrayId> = arrays.iter().map(|a| a.id).collect();
    Ok(ctx.lock().ancestors_of(&ids))
}

/// Optimize, execute, and read back every array in `arrays`.
pub fn compute(arrays: &[&Array], options: &ComputeOptions) -> Result<Vec<Block>, ExecError> {
    let ctx = same_context(arrays)?;
    let plan = arrays_to_plan(arrays)?;
    let optimized = optimize(&plan, &options.policy)?;

    let executor: Arc<dyn Executor> = match &options.executor {
        Some(e) => e.clone(),
        None => default_executor(ctx.spec())?,
    };
    let callbacks: Vec<&dyn Callback> = options.callbacks.iter().map(|c| c.as_ref()).collect();
    execute_plan(&optimized, executor.as_ref(), &callbacks)?;

    arrays
        .iter()
        .map(|a| {
            a.store
                .read_all()
                .map_err(|source| ExecError::Read { array: a.id, source })
        })
        .collect()
}

fn default_executor(spec: &Spec) -> Result<Arc<dyn Executor>, ExecError> {
    Ok(match spec.threads {
        Some(n) if n > 1 => Arc::new(ThreadPoolExecutor::new(Some(n), spec.retries)?),
        _ => Arc::new(SequentialExecutor::new(spec.retries)),
    })
}

/// Graphviz rendering of the optimized plan for `arrays`.
pub fn visualize(arrays: &[&Array], policy: &OptimizePolicy) -> Result<String, PlanError> {
    let plan = arrays_to_plan(arrays)?;
    Ok(dot::emit_dot(&optimize(&plan, policy)?))
}
