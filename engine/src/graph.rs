// graph.rs — The plan graph
//
// A directed acyclic multigraph of array nodes and operation nodes. Every
// operation produces exactly one array; an operation reads each of its
// sources once per occurrence, so an op consuming the same array twice has
// two parallel edges. Edges are derived from the op nodes, never stored.
//
// The graph is a value: nodes are shared behind `Arc`, and optimisers take
// `&PlanGraph` and return a new graph.
//
// Preconditions: node ids are unique (allocated by one `IdAllocator`).
// Postconditions: `verify()` certifies the structural invariants (G1-G5).
// Failure modes: cycles and dangling references are reported by
//                `topological_ops` and `verify`.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::cert::StageCert;
use crate::error::PlanError;
use crate::id::{ArrayId, OpId};
use crate::pipeline::PrimitiveOp;
use crate::store::{ArrayMeta, StoreHandle};

// ── Nodes ───────────────────────────────────────────────────────────────────

/// An array: metadata plus the store that holds (or will hold) it.
#[derive(Debug, Clone)]
pub struct ArrayNode {
    pub id: ArrayId,
    pub meta: ArrayMeta,
    pub store: Arc<StoreHandle>,
    pub producer: OpId,
}

impl ArrayNode {
    /// True when executing the plan creates this array's store.
    pub fn is_materialized(&self) -> bool {
        self.store.is_lazy()
    }
}

/// An operation producing one array.
#[derive(Debug, Clone)]
pub struct OpNode {
    pub id: OpId,
    /// Human-readable tag, e.g. `blockwise`, `rechunk`, `asarray`.
    pub kind: String,
    /// `None` for source ops (virtual or externally stored arrays).
    pub primitive: Option<PrimitiveOp>,
    /// Arrays read, in operand order, with repeats.
    pub sources: Vec<ArrayId>,
    pub output: ArrayId,
    /// Producer ops fused into this one, in fusion order.
    pub fused: Vec<OpId>,
}

impl OpNode {
    pub fn is_fusable(&self) -> bool {
        self.primitive.as_ref().is_some_and(|p| p.fusable)
    }

    pub fn num_tasks(&self) -> usize {
        self.primitive.as_ref().map_or(0, |p| p.num_tasks)
    }

    pub fn has_repeated_source(&self) -> bool {
        let distinct: BTreeSet<_> = self.sources.iter().collect();
        distinct.len() != self.sources.len()
    }
}

/// A derived edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Edge {
    /// `array → op`: the op reads the array.
    Read { array: ArrayId, op: OpId },
    /// `op → array`: the op produces the array.
    Write { op: OpId, array: ArrayId },
}

/// Summary of a plan graph, as reported by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStats {
    pub num_ops: usize,
    pub num_primitive_ops: usize,
    pub num_arrays: usize,
    pub num_tasks: usize,
    pub max_projected_mem: u64,
    pub total_nbytes: u64,
    pub fingerprint: String,
}

impl std::fmt::Display for PlanStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "ops:               {}", self.num_ops)?;
        writeln!(f, "primitive ops:     {}", self.num_primitive_ops)?;
        writeln!(f, "arrays:            {}", self.num_arrays)?;
        writeln!(f, "tasks:             {}", self.num_tasks)?;
        writeln!(f, "max projected mem: {}", self.max_projected_mem)?;
        write!(f, "total nbytes:      {}", self.total_nbytes)
    }
}

// ── Graph ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PlanGraph {
    arrays: BTreeMap<ArrayId, Arc<ArrayNode>>,
    ops: BTreeMap<OpId, Arc<OpNode>>,
    outputs: BTreeSet<ArrayId>,
}

impl PlanGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Construction ──

    /// Record an op together with the array it produces.
    pub fn add_op(&mut self, op: OpNode, array: ArrayNode) {
        self.arrays.insert(array.id, Arc::new(array));
        self.ops.insert(op.id, Arc::new(op));
    }

    /// Replace an existing op node (same id).
    pub fn replace_op(&mut self, op: OpNode) {
        self.ops.insert(op.id, Arc::new(op));
    }

    /// Remove an op and the array it produces.
    pub fn remove_op(&mut self, id: OpId) {
        if let Some(op) = self.ops.remove(&id) {
            self.arrays.remove(&op.output);
            self.outputs.remove(&op.output);
        }
    }

    /// Union of two graphs; nodes shared by id are kept once.
    pub fn merge(&mut self, other: &PlanGraph) {
        for (id, a) in &other.arrays {
            self.arrays.entry(*id).or_insert_with(|| a.clone());
        }
        for (id, op) in &other.ops {
            self.ops.entry(*id).or_insert_with(|| op.clone());
        }
        self.outputs.extend(other.outputs.iter().copied());
    }

    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = ArrayId>) -> Self {
        self.outputs = outputs.into_iter().collect();
        self
    }

    /// The subgraph of `outputs` and everything they depend on.
    pub fn ancestors_of(&self, outputs: &[ArrayId]) -> PlanGraph {
        let mut sub = PlanGraph::new();
        let mut stack: Vec<ArrayId> = outputs.to_vec();
        while let Some(id) = stack.pop() {
            if sub.arrays.contains_key(&id) {
                continue;
            }
            let Some(array) = self.arrays.get(&id) else {
                continue;
            };
            sub.arrays.insert(id, array.clone());
            if let Some(op) = self.ops.get(&array.producer) {
                sub.ops.insert(op.id, op.clone());
                stack.extend(op.sources.iter().copied());
            }
        }
        sub.with_outputs(outputs.iter().copied())
    }

    // ── Lookup ──

    pub fn op(&self, id: OpId) -> Option<&OpNode> {
        self.ops.get(&id).map(Arc::as_ref)
    }

    pub fn array(&self, id: ArrayId) -> Option<&ArrayNode> {
        self.arrays.get(&id).map(Arc::as_ref)
    }

    pub fn ops(&self) -> impl Iterator<Item = &OpNode> + '_ {
        self.ops.values().map(Arc::as_ref)
    }

    pub fn arrays(&self) -> impl Iterator<Item = &ArrayNode> + '_ {
        self.arrays.values().map(Arc::as_ref)
    }

    pub fn outputs(&self) -> &BTreeSet<ArrayId> {
        &self.outputs
    }

    pub fn is_output(&self, id: ArrayId) -> bool {
        self.outputs.contains(&id)
    }

    pub fn producer(&self, array: ArrayId) -> Option<OpId> {
        self.arrays.get(&array).map(|a| a.producer)
    }

    /// Ops reading `array`, once per read edge.
    pub fn consumers(&self, array: ArrayId) -> Vec<OpId> {
        self.ops
            .values()
            .flat_map(|op| {
                op.sources
                    .iter()
                    .filter(move |&&s| s == array)
                    .map(move |_| op.id)
            })
            .collect()
    }

    /// Producers of an op's sources, in source order, with repeats.
    pub fn predecessor_ops(&self, id: OpId) -> Vec<OpId> {
        self.op(id)
            .map(|op| op.sources.iter().filter_map(|&s| self.producer(s)).collect())
            .unwrap_or_default()
    }

    pub fn edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        for op in self.ops.values() {
            for &array in &op.sources {
                edges.push(Edge::Read { array, op: op.id });
            }
            edges.push(Edge::Write {
                op: op.id,
                array: op.output,
            });
        }
        edges
    }

    /// Ops in dependency order (Kahn's algorithm, lowest id first among
    /// ready ops).
    pub fn topological_ops(&self) -> Result<Vec<OpId>, PlanError> {
        let mut indegree: BTreeMap<OpId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<OpId, Vec<OpId>> = BTreeMap::new();
        for op in self.ops.values() {
            let preds: BTreeSet<OpId> = op
                .sources
                .iter()
                .filter_map(|&s| self.producer(s))
                .filter(|p| self.ops.contains_key(p))
                .collect();
            indegree.insert(op.id, preds.len());
            for p in preds {
                dependents.entry(p).or_default().push(op.id);
            }
        }
        let mut ready: BTreeSet<OpId> = indegree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.ops.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for &next in dependents.get(&id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(&next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(next);
                    }
                }
            }
        }
        if order.len() != self.ops.len() {
            let stuck = indegree
                .iter()
                .find(|&(id, &d)| d > 0 && !order.contains(id))
                .map(|(&id, _)| id)
                .unwrap_or(OpId(0));
            return Err(PlanError::Cycle(stuck));
        }
        Ok(order)
    }

    // ── Queries ──

    pub fn num_arrays(&self) -> usize {
        self.arrays.len()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn num_primitive_ops(&self) -> usize {
        self.ops.values().filter(|op| op.primitive.is_some()).count()
    }

    /// Stores that executing the plan creates: every lazily allocated stage
    /// target, intermediates included.
    pub fn created_stores(&self) -> Vec<Arc<StoreHandle>> {
        self.ops
            .values()
            .filter_map(|op| op.primitive.as_ref())
            .flat_map(|p| p.pipeline.targets().cloned().collect::<Vec<_>>())
            .filter(|s| s.is_lazy())
            .collect()
    }

    /// Task count: one create task per created store plus every op's tasks.
    pub fn num_tasks(&self) -> usize {
        let op_tasks: usize = self.ops.values().map(|op| op.num_tasks()).sum();
        op_tasks + self.created_stores().len()
    }

    /// Bytes of every created store.
    pub fn total_nbytes(&self) -> u64 {
        self.created_stores().iter().map(|s| s.meta().nbytes()).sum()
    }

    /// Largest projected memory of any op.
    pub fn max_projected_mem(&self) -> u64 {
        self.ops
            .values()
            .filter_map(|op| op.primitive.as_ref())
            .map(|p| p.projected_mem)
            .max()
            .unwrap_or(0)
    }

    /// SHA-256 over a canonical description of the graph structure.
    pub fn fingerprint(&self) -> String {
        let mut canon = String::new();
        for a in self.arrays.values() {
            let _ = writeln!(
                canon,
                "array {} {:?} {} {:?} <- {}",
                a.id,
                a.meta.shape,
                a.meta.dtype,
                a.meta.chunks.dims(),
                a.producer
            );
        }
        for op in self.ops.values() {
            let program = op
                .primitive
                .as_ref()
                .and_then(|p| p.program())
                .map(|p| p.describe())
                .unwrap_or_default();
            let _ = writeln!(
                canon,
                "op {} {} {:?} -> {} tasks={} fused={:?} {}",
                op.id,
                op.kind,
                op.sources,
                op.output,
                op.num_tasks(),
                op.fused,
                program
            );
        }
        for o in &self.outputs {
            let _ = writeln!(canon, "output {o}");
        }
        let mut hasher = Sha256::new();
        hasher.update(canon.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Summary counts of this graph.
    pub fn stats(&self) -> PlanStats {
        PlanStats {
            num_ops: self.num_ops(),
            num_primitive_ops: self.num_primitive_ops(),
            num_arrays: self.num_arrays(),
            num_tasks: self.num_tasks(),
            max_projected_mem: self.max_projected_mem(),
            total_nbytes: self.total_nbytes(),
            fingerprint: self.fingerprint(),
        }
    }

    // ── Verification ──

    pub fn verify(&self) -> GraphCert {
        GraphCert {
            g1_outputs_name_producer: self.ops.values().all(|op| {
                self.arrays
                    .get(&op.output)
                    .is_some_and(|a| a.producer == op.id)
            }),
            g2_sources_exist: self
                .ops
                .values()
                .all(|op| op.sources.iter().all(|s| self.arrays.contains_key(s))),
            g3_acyclic: self.topological_ops().is_ok(),
            g4_arrays_have_producer: self.arrays.values().all(|a| {
                self.ops
                    .get(&a.producer)
                    .is_some_and(|op| op.output == a.id)
            }),
            g5_sources_match_program: self.ops.values().all(|op| {
                match op.primitive.as_ref().and_then(|p| p.program()) {
                    Some(program) => program.leaves() == op.sources,
                    None => true,
                }
            }),
        }
    }
}

// ── Certificate ─────────────────────────────────────────────────────────────

/// Machine-checkable evidence for plan-graph invariants (G1-G5).
#[derive(Debug, Clone)]
pub struct GraphCert {
    /// G1: Every op's output array exists and names the op as producer.
    pub g1_outputs_name_producer: bool,
    /// G2: Every source array an op reads exists.
    pub g2_sources_exist: bool,
    /// G3: The op dependency relation is acyclic.
    pub g3_acyclic: bool,
    /// G4: Every array is the output of an existing op.
    pub g4_arrays_have_producer: bool,
    /// G5: A single-stage op's sources are the leaves of its program.
    pub g5_sources_match_program: bool,
}

impl StageCert for GraphCert {
    fn all_pass(&self) -> bool {
        self.g1_outputs_name_producer
            && self.g2_sources_exist
            && self.g3_acyclic
            && self.g4_arrays_have_producer
            && self.g5_sources_match_program
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("G1_outputs_name_producer", self.g1_outputs_name_producer),
            ("G2_sources_exist", self.g2_sources_exist),
            ("G3_acyclic", self.g3_acyclic),
            ("G4_arrays_have_producer", self.g4_arrays_have_producer),
            ("G5_sources_match_program", self.g5_sources_match_program),
        ]
    }
}
