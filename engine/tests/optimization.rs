// Integration tests for the fusion optimizer.
//
// Each scenario builds a small plan, checks the task and array counts before
// and after optimization, checks which leaf arrays the fused ops read, and
// computes the result to confirm fusion never changes it.

use std::collections::BTreeSet;
use std::sync::Arc;

use chunkflow::api::{self, add, astype, matrix_transpose, negative, ones, positive};
use chunkflow::array::{arrays_to_plan, compute, Array, ComputeOptions, Context};
use chunkflow::block::Block;
use chunkflow::cert::StageCert;
use chunkflow::config::Spec;
use chunkflow::dtype::DType;
use chunkflow::error::BlockError;
use chunkflow::executor::TaskCounter;
use chunkflow::func::{CustomKernel, Kernel};
use chunkflow::graph::PlanGraph;
use chunkflow::id::ArrayId;
use chunkflow::ops;
use chunkflow::optimize::{optimize, FuseOptions, OptimizePolicy};

// ── Helpers ─────────────────────────────────────────────────────────────────

fn ctx() -> Arc<Context> {
    Context::new(Spec::new(100_000)).unwrap()
}

/// A single-block int64 array of ones.
fn one(ctx: &Arc<Context>) -> Array {
    ones(ctx, &[2], &[2], DType::Int64).unwrap()
}

fn plan(x: &Array) -> PlanGraph {
    arrays_to_plan(&[x]).unwrap()
}

fn optimized(x: &Array, policy: &OptimizePolicy) -> PlanGraph {
    let out = optimize(&plan(x), policy).unwrap();
    assert!(out.verify().all_pass(), "{:?}", out.verify().failures());
    out
}

fn multiple_inputs() -> OptimizePolicy {
    OptimizePolicy::MultipleInputs(FuseOptions::default())
}

/// Arrays read by the op producing `x`.
fn sources(graph: &PlanGraph, x: &Array) -> Vec<ArrayId> {
    graph.op(x.op()).unwrap().sources.clone()
}

fn ids(arrays: &[&Array]) -> Vec<ArrayId> {
    arrays.iter().map(|a| a.id()).collect()
}

fn exists(graph: &PlanGraph, x: &Array) -> bool {
    graph.op(x.op()).is_some()
}

fn run(x: &Array, policy: OptimizePolicy) -> Block {
    x.compute_with(&ComputeOptions::default().with_policy(policy))
        .unwrap()
}

fn ints(shape: &[usize], data: Vec<i64>) -> Block {
    Block::from_vec(shape, data).unwrap()
}

/// Adds any number of same-shaped blocks.
fn stack_add() -> Kernel {
    Kernel::Custom(CustomKernel::new("stack_add", |blocks: &[Block]| {
        let mut total = blocks
            .first()
            .cloned()
            .ok_or_else(|| BlockError::Kernel("no operands".to_string()))?;
        for b in &blocks[1..] {
            total = Block::binary(chunkflow::block::BinaryOp::Add, &total, b)?;
        }
        Ok(total)
    }))
}

// ── Unary chains ────────────────────────────────────────────────────────────

#[test]
fn fusion_collapses_unary_chain() {
    let ctx = ctx();
    let a = api::asarray(&ctx, ints(&[3, 3], (1..=9).collect()), &[2, 2]).unwrap();
    let b = negative(&a).unwrap();
    let c = astype(&b, DType::Float32).unwrap();
    let d = negative(&c).unwrap();

    let unfused = plan(&d);
    assert_eq!(unfused.num_tasks(), 3 + 12);
    assert_eq!(unfused.num_arrays(), 4);

    let fused = optimized(&d, &OptimizePolicy::Simple);
    assert_eq!(fused.num_tasks(), 1 + 4);
    assert_eq!(fused.num_arrays(), 2);
    assert_eq!(sources(&fused, &d), ids(&[&a]));
    assert_eq!(fused.op(d.op()).unwrap().fused, vec![b.op(), c.op()]);

    let counter = Arc::new(TaskCounter::new());
    let result = d
        .compute_with(&ComputeOptions::default().with_callback(counter.clone()))
        .unwrap();
    assert_eq!(counter.value(), 5);
    assert_eq!(
        result,
        Block::from_vec(&[3, 3], (1..=9).map(|v| v as f32).collect()).unwrap()
    );
}

#[test]
fn fusion_through_transpose() {
    let ctx = ctx();
    let a = api::asarray(&ctx, ints(&[3, 3], (1..=9).collect()), &[2, 2]).unwrap();
    let b = negative(&a).unwrap();
    let c = astype(&b, DType::Float32).unwrap();
    let d = matrix_transpose(&c).unwrap();

    let fused = optimized(&d, &OptimizePolicy::Simple);
    assert_eq!(fused.num_tasks(), 1 + 4);
    assert_eq!(sources(&fused, &d), ids(&[&a]));

    let expected: Vec<f32> = vec![-1., -4., -7., -2., -5., -8., -3., -6., -9.];
    assert_eq!(
        run(&d, OptimizePolicy::Simple),
        Block::from_vec(&[3, 3], expected).unwrap()
    );
}

#[test]
fn unary_pair_fuses() {
    let ctx = ctx();
    let a = one(&ctx);
    let b = negative(&a).unwrap();
    let c = negative(&b).unwrap();

    assert_eq!(plan(&c).num_tasks(), 2 + 2);
    let fused = optimized(&c, &OptimizePolicy::Simple);
    assert_eq!(fused.num_tasks(), 1 + 1);
    assert!(!exists(&fused, &b));
    assert_eq!(run(&c, OptimizePolicy::Simple), ints(&[2], vec![1, 1]));
}

#[test]
fn none_policy_leaves_plan_unchanged() {
    let ctx = ctx();
    let a = one(&ctx);
    let c = negative(&negative(&a).unwrap()).unwrap();
    let out = optimized(&c, &OptimizePolicy::None);
    assert_eq!(out.fingerprint(), plan(&c).fingerprint());
}

// ── Sharing and parallel edges ──────────────────────────────────────────────

#[test]
fn shared_array_is_not_fused_away() {
    let ctx = ctx();
    let a = one(&ctx);
    let b = positive(&a).unwrap();
    let c = positive(&b).unwrap();
    let d = api::equal(&b, &c).unwrap();

    assert_eq!(plan(&d).num_tasks(), 3 + 3);
    let fused = optimized(&d, &OptimizePolicy::Simple);
    assert_eq!(fused.num_tasks(), 3 + 3);
    assert!(exists(&fused, &b));
    assert_eq!(
        run(&d, OptimizePolicy::Simple),
        Block::from_vec(&[2], vec![true, true]).unwrap()
    );
}

#[test]
fn parallel_edges_are_never_fused() {
    let ctx = ctx();
    let a = one(&ctx);
    let b = negative(&a).unwrap();
    let d = api::equal(&b, &b).unwrap();

    assert_eq!(plan(&d).num_tasks(), 2 + 2);
    for policy in [OptimizePolicy::Simple, multiple_inputs(), OptimizePolicy::FuseAll] {
        let fused = optimized(&d, &policy);
        assert_eq!(fused.num_tasks(), 2 + 2);
        assert_eq!(sources(&fused, &d), ids(&[&b, &b]));
    }
    assert_eq!(
        run(&d, OptimizePolicy::FuseAll),
        Block::from_vec(&[2], vec![true, true]).unwrap()
    );
}

#[test]
fn repeated_argument_is_not_fused() {
    let ctx = ctx();
    let a = one(&ctx);
    let b = negative(&a).unwrap();
    let c = add(&b, &b).unwrap();

    let fused = optimized(&c, &multiple_inputs());
    assert!(exists(&fused, &b));
    assert_eq!(run(&c, multiple_inputs()), ints(&[2], vec![-2, -2]));
}

#[test]
fn requested_outputs_are_kept() {
    let ctx = ctx();
    let a = one(&ctx);
    let b = negative(&a).unwrap();
    let c = negative(&b).unwrap();

    let graph = optimize(&arrays_to_plan(&[&b, &c]).unwrap(), &OptimizePolicy::Simple).unwrap();
    assert!(exists(&graph, &b));
    assert_eq!(sources(&graph, &c), ids(&[&b]));

    let results = compute(&[&b, &c], &ComputeOptions::default()).unwrap();
    assert_eq!(results, vec![ints(&[2], vec![-1, -1]), ints(&[2], vec![1, 1])]);
}

// ── Multiple inputs ─────────────────────────────────────────────────────────

#[test]
fn binary_consumer_fuses_both_inputs() {
    let ctx = ctx();
    let a = one(&ctx);
    let b = one(&ctx);
    let c = negative(&a).unwrap();
    let d = negative(&b).unwrap();
    let e = add(&c, &d).unwrap();

    assert_eq!(plan(&e).num_tasks(), 3 + 3);

    let simple = optimized(&e, &OptimizePolicy::Simple);
    assert_eq!(simple.num_tasks(), 3 + 3);

    let fused = optimized(&e, &multiple_inputs());
    assert_eq!(fused.num_tasks(), 1 + 1);
    assert_eq!(sources(&fused, &e), ids(&[&a, &b]));
    assert_eq!(run(&e, multiple_inputs()), ints(&[2], vec![-2, -2]));
}

#[test]
fn unary_and_binary_producers_fuse() {
    let ctx = ctx();
    let a = one(&ctx);
    let b = one(&ctx);
    let c = one(&ctx);
    let d = add(&a, &b).unwrap();
    let e = negative(&c).unwrap();
    let f = add(&d, &e).unwrap();

    let fused = optimized(&f, &multiple_inputs());
    assert_eq!(fused.num_tasks(), 1 + 1);
    assert_eq!(sources(&fused, &f), ids(&[&a, &b, &c]));
    assert_eq!(run(&f, multiple_inputs()), ints(&[2], vec![1, 1]));
}

#[test]
fn mixed_levels_fuse() {
    let ctx = ctx();
    let a = one(&ctx);
    let b = one(&ctx);
    let c = one(&ctx);
    let d = add(&a, &b).unwrap();
    let e = add(&d, &c).unwrap();

    let fused = optimized(&e, &multiple_inputs());
    assert_eq!(sources(&fused, &e), ids(&[&a, &b, &c]));
    assert!(!exists(&fused, &d));
    assert_eq!(run(&e, multiple_inputs()), ints(&[2], vec![3, 3]));
}

#[test]
fn diamond_fuses_to_repeated_leaf() {
    let ctx = ctx();
    let a = one(&ctx);
    let b = positive(&a).unwrap();
    let c = positive(&a).unwrap();
    let d = add(&b, &c).unwrap();

    let fused = optimized(&d, &multiple_inputs());
    assert_eq!(fused.num_tasks(), 1 + 1);
    assert_eq!(sources(&fused, &d), ids(&[&a, &a]));
    assert_eq!(run(&d, multiple_inputs()), ints(&[2], vec![2, 2]));
}

#[test]
fn mixed_levels_and_diamond() {
    let ctx = ctx();
    let a = one(&ctx);
    let b = positive(&a).unwrap();
    let c = positive(&b).unwrap();
    let d = add(&b, &c).unwrap();

    let one_level = OptimizePolicy::FusePredecessors {
        op: d.op(),
        options: FuseOptions::default(),
    };
    let fused = optimized(&d, &one_level);
    assert!(exists(&fused, &b));
    assert!(!exists(&fused, &c));
    assert_eq!(sources(&fused, &b), ids(&[&a]));
    assert_eq!(sources(&fused, &d), ids(&[&a, &b]));
    assert_eq!(run(&d, one_level), ints(&[2], vec![2, 2]));

    // Visiting c first folds b into it, so d ends up reading only a.
    let fused = optimized(&d, &multiple_inputs());
    assert!(!exists(&fused, &b));
    assert_eq!(sources(&fused, &d), ids(&[&a, &a]));
    assert_eq!(run(&d, multiple_inputs()), ints(&[2], vec![2, 2]));
}

#[test]
fn producer_with_other_dependents_is_recomputed() {
    let ctx = ctx();
    let a = one(&ctx);
    let b = negative(&a).unwrap();
    let c = negative(&b).unwrap();
    let d = negative(&b).unwrap();

    let graph = arrays_to_plan(&[&c, &d]).unwrap();
    let policy = OptimizePolicy::FusePredecessors {
        op: c.op(),
        options: FuseOptions::default(),
    };
    let fused = optimize(&graph, &policy).unwrap();
    assert!(fused.verify().all_pass(), "{:?}", fused.verify().failures());
    assert_eq!(fused.num_ops(), graph.num_ops());
    assert_eq!(sources(&fused, &c), ids(&[&a]));
    assert!(exists(&fused, &b));
    assert_eq!(sources(&fused, &d), ids(&[&b]));

    let options = ComputeOptions::default().with_policy(policy);
    let results = compute(&[&c, &d], &options).unwrap();
    assert_eq!(results, vec![ints(&[2], vec![1, 1]), ints(&[2], vec![1, 1])]);

    // Simple fusion only takes producers no other op reads.
    let simple = optimize(&graph, &OptimizePolicy::Simple).unwrap();
    assert_eq!(sources(&simple, &c), ids(&[&b]));
    assert_eq!(sources(&simple, &d), ids(&[&b]));
}

// ── Fan-in caps ─────────────────────────────────────────────────────────────

#[test]
fn unary_consumer_ignores_fan_in_cap() {
    let ctx = ctx();
    let leaves: Vec<Array> = (0..8).map(|_| one(&ctx)).collect();
    let refs: Vec<&Array> = leaves.iter().collect();
    let i = ops::elemwise(stack_add(), &refs, None).unwrap();
    let j = negative(&i).unwrap();

    let fused = optimized(&j, &OptimizePolicy::Simple);
    assert_eq!(fused.num_tasks(), 1 + 1);
    assert_eq!(sources(&fused, &j), ids(&refs));
    assert_eq!(run(&j, OptimizePolicy::Simple), ints(&[2], vec![-8, -8]));
}

/// Eight leaves summed pairwise in a three-level tree.
fn fan_in_tree(ctx: &Arc<Context>) -> (Vec<Array>, [Array; 3]) {
    let leaves: Vec<Array> = (0..8).map(|_| one(ctx)).collect();
    let pairs: Vec<Array> = leaves
        .chunks(2)
        .map(|p| add(&p[0], &p[1]).unwrap())
        .collect();
    let left = add(&pairs[0], &pairs[1]).unwrap();
    let right = add(&pairs[2], &pairs[3]).unwrap();
    let root = add(&left, &right).unwrap();
    (leaves, [left, right, root])
}

#[test]
fn fan_in_cap_stops_fusion() {
    let ctx = ctx();
    let (leaves, [left, right, root]) = fan_in_tree(&ctx);

    assert_eq!(plan(&root).num_tasks(), 7 + 7);
    let fused = optimized(&root, &multiple_inputs());
    assert_eq!(fused.num_tasks(), 3 + 3);
    assert_eq!(sources(&fused, &left), ids(&leaves[..4].iter().collect::<Vec<_>>()));
    assert_eq!(sources(&fused, &right), ids(&leaves[4..].iter().collect::<Vec<_>>()));
    assert_eq!(sources(&fused, &root), ids(&[&left, &right]));
    assert_eq!(run(&root, multiple_inputs()), ints(&[2], vec![8, 8]));
}

#[test]
fn raised_cap_or_fuse_all_fuses_everything() {
    let ctx = ctx();
    let (leaves, [_, _, root]) = fan_in_tree(&ctx);
    let all: Vec<&Array> = leaves.iter().collect();

    let raised = OptimizePolicy::MultipleInputs(FuseOptions::default().with_max_total_source_arrays(8));
    for policy in [raised, OptimizePolicy::FuseAll] {
        let fused = optimized(&root, &policy);
        assert_eq!(fused.num_tasks(), 1 + 1);
        assert_eq!(sources(&fused, &root), ids(&all));
        assert_eq!(run(&root, policy), ints(&[2], vec![8, 8]));
    }
}

#[test]
fn input_block_cap_stops_fusion() {
    let ctx = ctx();
    let a = one(&ctx);
    let b = one(&ctx);
    let c = add(&negative(&a).unwrap(), &negative(&b).unwrap()).unwrap();

    let options = FuseOptions {
        max_total_num_input_blocks: Some(1),
        ..FuseOptions::default()
    };
    let fused = optimized(&c, &OptimizePolicy::MultipleInputs(options));
    assert_eq!(fused.num_tasks(), 3 + 3);
}

// ── Targeted policies ───────────────────────────────────────────────────────

#[test]
fn fuse_only_named_op() {
    let ctx = ctx();
    let a = one(&ctx);
    let b = negative(&a).unwrap();
    let c = negative(&b).unwrap();
    let d = negative(&c).unwrap();

    let policy = OptimizePolicy::FuseOnly(BTreeSet::from([d.op()]));
    let fused = optimized(&d, &policy);
    assert_eq!(sources(&fused, &b), ids(&[&a]));
    assert_eq!(sources(&fused, &d), ids(&[&b]));
    assert!(!exists(&fused, &c));
    assert_eq!(run(&d, policy), ints(&[2], vec![-1, -1]));
}

#[test]
fn fuse_predecessors_is_one_level() {
    let ctx = ctx();
    let a = one(&ctx);
    let b = negative(&a).unwrap();
    let c = negative(&b).unwrap();
    let d = negative(&c).unwrap();

    let policy = OptimizePolicy::FusePredecessors {
        op: d.op(),
        options: FuseOptions::default(),
    };
    let fused = optimized(&d, &policy);
    assert_eq!(sources(&fused, &d), ids(&[&b]));
    assert!(exists(&fused, &b));
}

// ── Determinism and memory ──────────────────────────────────────────────────

#[test]
fn optimization_is_deterministic() {
    let ctx = ctx();
    let (_, [_, _, root]) = fan_in_tree(&ctx);
    let first = optimized(&root, &multiple_inputs());
    let second = optimized(&root, &multiple_inputs());
    assert_eq!(first.fingerprint(), second.fingerprint());
}

#[test]
fn fused_memory_is_max_of_parts() {
    let ctx = ctx();
    let a = api::asarray(&ctx, ints(&[3, 3], (1..=9).collect()), &[2, 2]).unwrap();
    let b = astype(&a, DType::Int32).unwrap();
    let c = negative(&b).unwrap();

    let unfused = plan(&c);
    let parts = [b.op(), c.op()]
        .iter()
        .map(|&id| unfused.op(id).unwrap().primitive.as_ref().unwrap().projected_mem)
        .max()
        .unwrap();
    let fused = optimized(&c, &OptimizePolicy::Simple);
    assert_eq!(fused.max_projected_mem(), parts);
}
