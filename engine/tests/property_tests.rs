// Property-based tests for planning and execution invariants.
//
// Four categories:
// 1. Chunk algebra: regular partitions and common block dimensions
// 2. Memory projection grows with block size
// 3. Rechunk and reductions reproduce the direct result
// 4. Fusion never changes what a plan computes
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use std::collections::BTreeSet;
use std::sync::Arc;

use chunkflow::api;
use chunkflow::array::{arrays_to_plan, Array, ComputeOptions, Context};
use chunkflow::block::Block;
use chunkflow::cert::StageCert;
use chunkflow::chunks::{common_blockdim, Chunks};
use chunkflow::config::Spec;
use chunkflow::dtype::DType;
use chunkflow::ops;
use chunkflow::optimize::{optimize, FuseOptions, OptimizePolicy};
use proptest::prelude::*;

// ── Test helpers ────────────────────────────────────────────────────────────

fn ctx(allowed_mem: u64) -> Arc<Context> {
    Context::new(Spec::new(allowed_mem)).unwrap()
}

fn boundaries(seq: &[usize]) -> BTreeSet<usize> {
    seq.iter()
        .scan(0, |acc, &s| {
            *acc += s;
            Some(*acc)
        })
        .collect()
}

/// A random partition of `total` into positive block sizes.
fn partition(total: usize) -> impl Strategy<Value = Vec<usize>> {
    proptest::collection::btree_set(1..total.max(2), 0..total).prop_map(move |cuts| {
        let mut sizes = Vec::new();
        let mut prev = 0;
        for cut in cuts.into_iter().filter(|&c| c < total).chain([total]) {
            sizes.push(cut - prev);
            prev = cut;
        }
        sizes
    })
}

fn projected_mem(x: &Array) -> u64 {
    x.plan()
        .op(x.op())
        .and_then(|op| op.primitive.as_ref())
        .map(|p| p.projected_mem)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Negative,
    Abs,
    Positive,
    Double,
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Negative),
        Just(Step::Abs),
        Just(Step::Positive),
        Just(Step::Double),
    ]
}

fn apply(step: Step, x: &Array) -> Array {
    match step {
        Step::Negative => api::negative(x),
        Step::Abs => api::abs(x),
        Step::Positive => api::positive(x),
        Step::Double => api::add(x, x),
    }
    .unwrap()
}

// ── 1. Chunk algebra ────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn regular_chunks_cover_shape(n in 1usize..200, c in 1usize..50) {
        let chunks = Chunks::regular(&[n], &[c]).unwrap();
        let dim = chunks.dim(0);
        prop_assert_eq!(dim.iter().sum::<usize>(), n);
        prop_assert!(dim.iter().all(|&s| s > 0 && s <= c));
        prop_assert!(dim[..dim.len() - 1].iter().all(|&s| s == c));
        prop_assert_eq!(chunks.numblocks(), vec![n.div_ceil(c)]);
    }

    #[test]
    fn common_blockdim_refines_every_input(
        (a, b) in (1usize..40).prop_flat_map(|n| (partition(n), partition(n)))
    ) {
        let common = common_blockdim('i', &[&a, &b]).unwrap();
        prop_assert_eq!(common.iter().sum::<usize>(), a.iter().sum::<usize>());

        let result = boundaries(&common);
        let union: BTreeSet<usize> = boundaries(&a).union(&boundaries(&b)).copied().collect();
        prop_assert_eq!(result, union);
    }
}

// ── 2. Memory projection ────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn projection_is_monotone_in_chunk_size(n in 1usize..64, c in 1usize..32, extra in 0usize..32) {
        let ctx = ctx(1 << 30);
        let small = api::ones(&ctx, &[n, n], &[c, c], DType::Float64).unwrap();
        let large = api::ones(&ctx, &[n, n], &[c + extra, c + extra], DType::Float64).unwrap();
        let small = api::negative(&small).unwrap();
        let large = api::negative(&large).unwrap();
        prop_assert!(projected_mem(&small) <= projected_mem(&large));
        prop_assert!(projected_mem(&small) <= 1 << 30);
    }
}

// ── 3. Rechunk and reductions ───────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn rechunk_preserves_data(
        (rows, cols, src, tgt) in (1usize..8, 1usize..8).prop_flat_map(|(r, c)| {
            (Just(r), Just(c), (1..=r, 1..=c), (1..=r, 1..=c))
        })
    ) {
        let ctx = ctx(1 << 20);
        let data = Block::from_vec(&[rows, cols], (0..(rows * cols) as i64).collect()).unwrap();
        let a = api::asarray(&ctx, data.clone(), &[src.0, src.1]).unwrap();
        let b = ops::rechunk(&a, &[tgt.0, tgt.1]).unwrap();
        prop_assert_eq!(b.chunksize(), vec![tgt.0, tgt.1]);
        prop_assert_eq!(b.compute().unwrap(), data);
    }

    #[test]
    fn bounded_sum_matches_direct_sum(
        values in proptest::collection::vec(-1000i64..1000, 1..40),
        chunk in 1usize..10,
        allowed_mem in 64u64..4096,
    ) {
        let ctx = ctx(allowed_mem);
        let n = values.len();
        let expected: i64 = values.iter().sum();
        let a = api::asarray(&ctx, Block::from_vec(&[n], values).unwrap(), &[chunk.min(n)]).unwrap();
        let planned = api::sum(&a, None, false);
        prop_assume!(planned.is_ok());
        let total = planned.unwrap();
        prop_assert!(total.plan().max_projected_mem() <= allowed_mem);
        prop_assert_eq!(total.compute().unwrap(), Block::from_vec(&[], vec![expected]).unwrap());
    }
}

// ── 4. Fusion ───────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn fusion_preserves_results(
        values in proptest::collection::vec(-100i64..100, 1..30),
        chunk in 1usize..8,
        steps in proptest::collection::vec(arb_step(), 1..6),
    ) {
        let ctx = ctx(1 << 20);
        let n = values.len();
        let mut x = api::asarray(&ctx, Block::from_vec(&[n], values).unwrap(), &[chunk.min(n)]).unwrap();
        for step in steps {
            x = apply(step, &x);
        }

        let policies = [
            OptimizePolicy::Simple,
            OptimizePolicy::MultipleInputs(FuseOptions::default()),
            OptimizePolicy::FuseAll,
        ];
        let plan = arrays_to_plan(&[&x]).unwrap();
        let expected = x
            .compute_with(&ComputeOptions::default().with_policy(OptimizePolicy::None))
            .unwrap();
        for policy in policies {
            let optimized = optimize(&plan, &policy).unwrap();
            prop_assert!(optimized.verify().all_pass(), "{:?}", optimized.verify().failures());
            prop_assert!(optimized.num_tasks() <= plan.num_tasks());
            let result = x
                .compute_with(&ComputeOptions::default().with_policy(policy))
                .unwrap();
            prop_assert_eq!(&result, &expected);
        }
    }
}
