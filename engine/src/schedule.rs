// schedule.rs — Plan execution order and the plan executor
//
// Orders the primitive ops of an (optimized) plan graph topologically and
// runs them: first one create task per materialized store, then each op's
// pipeline stage by stage. A stage starts only after the previous stage
// (and every producer op) has completed.
//
// Preconditions: `graph` verifies (G1-G5).
// Postconditions: on `Ok`, every requested output's store holds all its
//                 blocks.
// Failure modes: verification failures → `ExecError::Verification`; a task
//                failing for good → `ExecError::Task`; store creation →
//                `ExecError::Create`.
// Side effects: creates stores and writes blocks; invokes callbacks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::cert::StageCert;
use crate::error::{ExecError, PlanError};
use crate::executor::{Callback, ComputeEndEvent, ComputeStartEvent, Executor, TaskEndEvent};
use crate::graph::PlanGraph;
use crate::id::OpId;
use crate::store::StoreHandle;

// ── Public types ────────────────────────────────────────────────────────────

/// What executing a plan does, in order.
#[derive(Debug, Clone)]
pub struct ExecutionSchedule {
    /// Stores created before any op runs.
    pub create: Vec<Arc<StoreHandle>>,
    /// Primitive ops in dependency order.
    pub ops: Vec<OpId>,
}

impl ExecutionSchedule {
    /// Create tasks plus every op's tasks.
    pub fn num_tasks(&self, graph: &PlanGraph) -> usize {
        let op_tasks: usize = self
            .ops
            .iter()
            .filter_map(|&id| graph.op(id))
            .map(|op| op.num_tasks())
            .sum();
        self.create.len() + op_tasks
    }
}

// ── Verification ─────────────────────────────────────────────────────────────

/// Machine-checkable evidence for schedule postconditions (S1-S2).
#[derive(Debug, Clone)]
pub struct ScheduleCert {
    /// S1: Every primitive op is scheduled exactly once.
    pub s1_ops_scheduled_once: bool,
    /// S2: Every op is scheduled after the producers of its sources.
    pub s2_producers_first: bool,
}

impl StageCert for ScheduleCert {
    fn all_pass(&self) -> bool {
        self.s1_ops_scheduled_once && self.s2_producers_first
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("S1_ops_scheduled_once", self.s1_ops_scheduled_once),
            ("S2_producers_first", self.s2_producers_first),
        ]
    }
}

/// Verify schedule postconditions against the graph it was built from.
pub fn verify_schedule(schedule: &ExecutionSchedule, graph: &PlanGraph) -> ScheduleCert {
    ScheduleCert {
        s1_ops_scheduled_once: verify_s1_ops_scheduled_once(schedule, graph),
        s2_producers_first: verify_s2_producers_first(schedule, graph),
    }
}

fn verify_s1_ops_scheduled_once(schedule: &ExecutionSchedule, graph: &PlanGraph) -> bool {
    let mut seen = BTreeSet::new();
    if !schedule.ops.iter().all(|id| seen.insert(*id)) {
        return false;
    }
    let primitive: BTreeSet<OpId> = graph
        .ops()
        .filter(|op| op.primitive.is_some())
        .map(|op| op.id)
        .collect();
    seen == primitive
}

fn verify_s2_producers_first(schedule: &ExecutionSchedule, graph: &PlanGraph) -> bool {
    let position: BTreeMap<OpId, usize> = schedule
        .ops
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();
    schedule.ops.iter().enumerate().all(|(i, &id)| {
        graph
            .predecessor_ops(id)
            .iter()
            .filter_map(|p| position.get(p))
            .all(|&j| j < i)
    })
}

// ── Public entry points ─────────────────────────────────────────────────────

/// Order the plan for execution.
pub fn schedule(graph: &PlanGraph) -> Result<ExecutionSchedule, PlanError> {
    let ops = graph
        .topological_ops()?
        .into_iter()
        .filter(|&id| graph.op(id).is_some_and(|op| op.primitive.is_some()))
        .collect();
    Ok(ExecutionSchedule {
        create: graph.created_stores(),
        ops,
    })
}

/// Verify, schedule and run `graph` on `executor`.
pub fn execute_plan(
    graph: &PlanGraph,
    executor: &dyn Executor,
    callbacks: &[&dyn Callback],
) -> Result<(), ExecError> {
    let cert = graph.verify();
    if !cert.all_pass() {
        return Err(ExecError::Verification(cert.failures().join(", ")));
    }
    let plan = schedule(graph)?;
    let cert = verify_schedule(&plan, graph);
    if !cert.all_pass() {
        return Err(ExecError::Verification(cert.failures().join(", ")));
    }

    let started = Instant::now();
    let num_tasks = plan.num_tasks(graph);
    let start = ComputeStartEvent {
        num_ops: plan.ops.len(),
        num_tasks,
    };
    for cb in callbacks {
        cb.on_compute_start(&start);
    }

    for store in &plan.create {
        let t = Instant::now();
        store.create().map_err(|source| ExecError::Create {
            array: store.name().to_string(),
            source,
        })?;
        let event = TaskEndEvent {
            array: store.name().to_string(),
            stage: "create-arrays".to_string(),
            num_tasks: 1,
            attempts: 1,
            elapsed: t.elapsed(),
        };
        for cb in callbacks {
            cb.on_task_end(&event);
        }
    }

    for &id in &plan.ops {
        let Some(op) = graph.op(id) else {
            continue;
        };
        let Some(primitive) = op.primitive.as_ref() else {
            continue;
        };
        for stage in &primitive.pipeline.stages {
            info!(
                op = %id,
                kind = %op.kind,
                stage = %stage.name,
                tasks = stage.num_tasks(),
                executor = executor.name(),
                "running stage"
            );
            executor
                .execute_stage(stage, callbacks)
                .map_err(|failure| ExecError::Task {
                    op: id,
                    kind: op.kind.clone(),
                    stage: stage.name.clone(),
                    coord: failure.coord,
                    source: failure.error,
                })?;
        }
    }

    let end = ComputeEndEvent {
        num_tasks,
        elapsed: started.elapsed(),
    };
    for cb in callbacks {
        cb.on_compute_end(&end);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_plan_schedules_nothing() {
        let graph = PlanGraph::new();
        let plan = schedule(&graph).unwrap();
        assert!(plan.ops.is_empty());
        assert!(plan.create.is_empty());
        assert!(verify_schedule(&plan, &graph).all_pass());
    }

    #[test]
    fn duplicate_entry_fails_s1() {
        let graph = PlanGraph::new();
        let plan = ExecutionSchedule {
            create: vec![],
            ops: vec![OpId(1), OpId(1)],
        };
        let cert = verify_schedule(&plan, &graph);
        assert_eq!(cert.failures(), vec!["S1_ops_scheduled_once"]);
    }
}
