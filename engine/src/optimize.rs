// optimize.rs — Fusion optimizer
//
// Rewrites a plan graph so that a consumer's tasks recompute eligible
// producer blocks in-process instead of reading them from storage. Every
// policy is built from one step, `fuse_predecessors`, applied to one
// consumer at a time.
//
// Preconditions: the graph verifies (G1-G5).
// Postconditions: observable results are unchanged; requested outputs and
//                 arrays still read by a surviving op are kept.
// Failure modes: a cyclic graph → `PlanError::Cycle`.
// Side effects: none (returns a new graph).

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::error::PlanError;
use crate::graph::{OpNode, PlanGraph};
use crate::id::{ArrayId, OpId};
use crate::pipeline::BlockProgram;

// ── Options and policies ────────────────────────────────────────────────────

/// Limits and overrides for one fusion rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuseOptions {
    /// Most distinct leaf arrays a fused op with several sources may read.
    pub max_total_source_arrays: usize,
    /// Most blocks (summed over leaves) a fused task may read.
    pub max_total_num_input_blocks: Option<usize>,
    /// Consumers fused regardless of the caps.
    pub always_fuse: BTreeSet<OpId>,
    /// Consumers never fused. Takes precedence over `always_fuse`.
    pub never_fuse: BTreeSet<OpId>,
}

impl Default for FuseOptions {
    fn default() -> Self {
        FuseOptions {
            max_total_source_arrays: 4,
            max_total_num_input_blocks: None,
            always_fuse: BTreeSet::new(),
            never_fuse: BTreeSet::new(),
        }
    }
}

impl FuseOptions {
    pub fn with_max_total_source_arrays(mut self, n: usize) -> Self {
        self.max_total_source_arrays = n;
        self
    }
}

/// Which consumers to fuse, and how far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OptimizePolicy {
    /// Leave the graph unchanged.
    None,
    /// Fuse every single-source consumer with its producer, in
    /// topological order, collapsing unary chains.
    #[default]
    Simple,
    /// Fuse the eligible predecessors of one op only.
    FusePredecessors { op: OpId, options: FuseOptions },
    /// Visit every op in topological order, fusing within the caps.
    MultipleInputs(FuseOptions),
    /// Visit every op in topological order, ignoring the caps.
    FuseAll,
    /// Fuse only the named consumers (caps ignored for them).
    FuseOnly(BTreeSet<OpId>),
}

impl OptimizePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizePolicy::None => "none",
            OptimizePolicy::Simple => "simple",
            OptimizePolicy::FusePredecessors { .. } => "fuse-predecessors",
            OptimizePolicy::MultipleInputs(_) => "multiple-inputs",
            OptimizePolicy::FuseAll => "fuse-all",
            OptimizePolicy::FuseOnly(_) => "fuse-only",
        }
    }
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Rewrite `graph` under `policy`.
pub fn optimize(graph: &PlanGraph, policy: &OptimizePolicy) -> Result<PlanGraph, PlanError> {
    let optimized = match policy {
        OptimizePolicy::None => graph.clone(),
        OptimizePolicy::Simple => {
            let options = FuseOptions::default();
            visit_in_order(graph, &options, Sharing::Exclusive, |op| op.sources.len() == 1)?
        }
        OptimizePolicy::FusePredecessors { op, options } => fuse_predecessors(graph, *op, options),
        OptimizePolicy::MultipleInputs(options) => {
            visit_in_order(graph, options, Sharing::Recompute, |_| true)?
        }
        OptimizePolicy::FuseAll => {
            let options = FuseOptions {
                always_fuse: graph.ops().map(|op| op.id).collect(),
                ..FuseOptions::default()
            };
            visit_in_order(graph, &options, Sharing::Recompute, |_| true)?
        }
        OptimizePolicy::FuseOnly(only) => {
            let options = FuseOptions {
                always_fuse: only.clone(),
                never_fuse: graph
                    .ops()
                    .map(|op| op.id)
                    .filter(|id| !only.contains(id))
                    .collect(),
                ..FuseOptions::default()
            };
            visit_in_order(graph, &options, Sharing::Recompute, |_| true)?
        }
    };
    info!(
        policy = policy.name(),
        ops_before = graph.num_ops(),
        ops_after = optimized.num_ops(),
        tasks_before = graph.num_tasks(),
        tasks_after = optimized.num_tasks(),
        "optimized plan"
    );
    Ok(optimized)
}

/// Fuse the eligible producers of `op` into it, one level deep. A producer
/// whose array has other readers is recomputed inside `op` and kept for them.
pub fn fuse_predecessors(graph: &PlanGraph, op: OpId, options: &FuseOptions) -> PlanGraph {
    let mut out = graph.clone();
    fuse_into(&mut out, op, options, Sharing::Recompute);
    out
}

/// How a producer whose array has readers besides the consumer is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sharing {
    /// Fuse only arrays whose every reader is fused in the same rewrite.
    Exclusive,
    /// Fuse anyway; the producer survives while anything still reads it.
    Recompute,
}

fn visit_in_order(
    graph: &PlanGraph,
    options: &FuseOptions,
    sharing: Sharing,
    select: impl Fn(&OpNode) -> bool,
) -> Result<PlanGraph, PlanError> {
    let mut out = graph.clone();
    for id in graph.topological_ops()? {
        let selected = out.op(id).is_some_and(&select);
        if selected {
            fuse_into(&mut out, id, options, sharing);
        }
    }
    Ok(out)
}

// ── The fusion step ─────────────────────────────────────────────────────────

/// Source arrays of `consumer` whose producers may be fused into it.
fn eligible_sources(
    graph: &PlanGraph,
    consumer: &OpNode,
    sharing: Sharing,
) -> BTreeMap<ArrayId, OpId> {
    let side: BTreeSet<ArrayId> = consumer
        .primitive
        .as_ref()
        .and_then(|p| p.program())
        .map(|p| p.side_inputs().into_iter().collect())
        .unwrap_or_default();
    let mut set: BTreeMap<ArrayId, OpId> = consumer
        .sources
        .iter()
        .filter(|&&a| !graph.is_output(a) && !side.contains(&a))
        .filter_map(|&a| {
            let producer = graph.op(graph.producer(a)?)?;
            (producer.is_fusable() && producer.primitive.as_ref()?.program().is_some())
                .then_some((a, producer.id))
        })
        .collect();
    if sharing == Sharing::Recompute {
        return set;
    }

    // An array may go only if every other reader is fused along with it.
    loop {
        let producers: BTreeSet<OpId> = set.values().copied().collect();
        let before = set.len();
        set.retain(|&a, _| {
            graph
                .consumers(a)
                .iter()
                .all(|c| *c == consumer.id || producers.contains(c))
        });
        if set.len() == before {
            return set;
        }
    }
}

/// Fuse into `id` in place. Returns whether the graph changed.
fn fuse_into(graph: &mut PlanGraph, id: OpId, options: &FuseOptions, sharing: Sharing) -> bool {
    let Some(consumer) = graph.op(id).cloned() else {
        return false;
    };
    if options.never_fuse.contains(&id) || !consumer.is_fusable() || consumer.has_repeated_source() {
        return false;
    }
    let Some(primitive) = consumer.primitive.as_ref() else {
        return false;
    };
    let Some(program) = primitive.program() else {
        return false;
    };

    let eligible = eligible_sources(graph, &consumer, sharing);
    if eligible.is_empty() {
        return false;
    }

    let mut producers: BTreeMap<ArrayId, &OpNode> = BTreeMap::new();
    for (&array, &op) in &eligible {
        if let Some(node) = graph.op(op) {
            producers.insert(array, node);
        }
    }
    let replacements: BTreeMap<ArrayId, BlockProgram> = producers
        .iter()
        .filter_map(|(&a, p)| Some((a, p.primitive.as_ref()?.program()?.clone())))
        .collect();

    let mut fused_program = program.clone();
    fused_program.substitute(&replacements);
    let leaves = fused_program.leaves();
    let num_input_blocks = multiply_input_blocks(&consumer, &primitive.num_input_blocks, &producers);

    if !options.always_fuse.contains(&id) {
        let distinct: BTreeSet<ArrayId> = leaves.iter().copied().collect();
        if consumer.sources.len() > 1 && distinct.len() > options.max_total_source_arrays {
            debug!(
                op = %id,
                source_arrays = distinct.len(),
                max = options.max_total_source_arrays,
                "fusion skipped: too many source arrays"
            );
            return false;
        }
        let total_blocks: usize = num_input_blocks.iter().sum();
        if let Some(max) = options.max_total_num_input_blocks {
            if total_blocks > max {
                debug!(op = %id, total_blocks, max, "fusion skipped: too many input blocks");
                return false;
            }
        }
    }

    let projected_mem = producers
        .values()
        .filter_map(|p| p.primitive.as_ref().map(|p| p.projected_mem))
        .fold(primitive.projected_mem, u64::max);

    let mut new_primitive = primitive.clone();
    if let Some(stage) = new_primitive.pipeline.stages.first_mut() {
        stage.program = fused_program;
    }
    new_primitive.projected_mem = projected_mem;
    new_primitive.num_input_blocks = num_input_blocks;

    let mut fused = consumer.fused.clone();
    for p in producers.values() {
        fused.extend(p.fused.iter().copied());
        fused.push(p.id);
    }
    let producer_ids: Vec<(ArrayId, OpId)> = eligible.into_iter().collect();

    info!(
        op = %id,
        kind = %consumer.kind,
        fused = ?producer_ids.iter().map(|(_, p)| p.to_string()).collect::<Vec<_>>(),
        source_arrays = leaves.len(),
        "fused predecessors"
    );

    graph.replace_op(OpNode {
        sources: leaves,
        primitive: Some(new_primitive),
        fused,
        ..consumer
    });
    remove_unread(graph, &producer_ids);
    true
}

/// Per-leaf block reads of the fused op: each replaced operand's count is
/// multiplied into its producer's own per-leaf counts.
fn multiply_input_blocks(
    consumer: &OpNode,
    own: &[usize],
    producers: &BTreeMap<ArrayId, &OpNode>,
) -> Vec<usize> {
    let mut out = Vec::new();
    for (i, array) in consumer.sources.iter().enumerate() {
        let n = own.get(i).copied().unwrap_or(1);
        match producers.get(array).and_then(|p| p.primitive.as_ref()) {
            Some(p) => out.extend(p.num_input_blocks.iter().map(|m| m * n)),
            None => out.push(n),
        }
    }
    out
}

/// Drop fused producers whose arrays nothing reads any more.
fn remove_unread(graph: &mut PlanGraph, fused: &[(ArrayId, OpId)]) {
    loop {
        let removable: Vec<OpId> = fused
            .iter()
            .filter(|&&(a, op)| {
                graph.op(op).is_some() && !graph.is_output(a) && graph.consumers(a).is_empty()
            })
            .map(|&(_, op)| op)
            .collect();
        if removable.is_empty() {
            return;
        }
        for op in removable {
            graph.remove_op(op);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_cap_four_sources() {
        let options = FuseOptions::default();
        assert_eq!(options.max_total_source_arrays, 4);
        assert!(options.max_total_num_input_blocks.is_none());
        assert_eq!(options.with_max_total_source_arrays(8).max_total_source_arrays, 8);
    }

    #[test]
    fn default_policy_is_simple() {
        assert_eq!(OptimizePolicy::default(), OptimizePolicy::Simple);
        assert_eq!(OptimizePolicy::FuseAll.name(), "fuse-all");
    }

    #[test]
    fn empty_graph_is_unchanged() {
        let graph = PlanGraph::new();
        for policy in [OptimizePolicy::None, OptimizePolicy::Simple, OptimizePolicy::FuseAll] {
            let out = optimize(&graph, &policy).unwrap();
            assert_eq!(out.num_ops(), 0);
        }
    }
}
