// Integration tests for task failures during compute: the error names the
// op, its kind, the stage and the block, and retries re-run only the task
// that failed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chunkflow::api::{self, negative};
use chunkflow::array::{Array, ComputeOptions, Context};
use chunkflow::block::Block;
use chunkflow::config::Spec;
use chunkflow::error::{BlockError, ExecError, TaskError};
use chunkflow::executor::{SequentialExecutor, ThreadPoolExecutor};
use chunkflow::func::{CustomKernel, Kernel};
use chunkflow::ops;
use chunkflow::optimize::OptimizePolicy;

fn input(ctx: &Arc<Context>) -> Array {
    let data = Block::from_vec(&[4], vec![0i64, 1, 2, 3]).unwrap();
    api::asarray(ctx, data, &[2]).unwrap()
}

fn second_block() -> Block {
    Block::from_vec(&[2], vec![2i64, 3]).unwrap()
}

/// Passes blocks through, except the block holding `[2, 3]`.
fn fails_on_second_block() -> Kernel {
    Kernel::Custom(CustomKernel::new("fails_on_second_block", |blocks: &[Block]| {
        if blocks[0] == second_block() {
            return Err(BlockError::Kernel("bad block".to_string()));
        }
        Ok(blocks[0].clone())
    }))
}

/// Fails the first `failures` calls on the second block, then passes.
fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> Kernel {
    Kernel::Custom(CustomKernel::new("flaky", move |blocks: &[Block]| {
        if blocks[0] == second_block() && calls.fetch_add(1, Ordering::SeqCst) < failures {
            return Err(BlockError::Kernel("transient".to_string()));
        }
        Ok(blocks[0].clone())
    }))
}

#[test]
fn task_failure_names_op_kind_stage_and_block() {
    let ctx = Context::new(Spec::new(100_000)).unwrap();
    let a = input(&ctx);
    let b = ops::elemwise(fails_on_second_block(), &[&a], None).unwrap();

    let err = b.compute().unwrap_err();
    let ExecError::Task {
        op,
        kind,
        stage,
        coord,
        source,
    } = &err
    else {
        panic!("expected a task error, got {err:?}");
    };
    assert_eq!(*op, b.op());
    assert_eq!(kind, "blockwise");
    assert_eq!(stage, "blockwise");
    assert_eq!(coord, &vec![1]);
    assert!(matches!(source, TaskError::Block(BlockError::Kernel(m)) if m == "bad block"));
    assert_eq!(
        err.to_string(),
        format!("{} (blockwise) failed in stage 'blockwise' at block [1]: bad block", b.op())
    );
}

#[test]
fn failure_inside_fused_op_names_the_consumer() {
    let ctx = Context::new(Spec::new(100_000)).unwrap();
    let a = input(&ctx);
    let b = ops::elemwise(fails_on_second_block(), &[&a], None).unwrap();
    let c = negative(&b).unwrap();

    let err = c
        .compute_with(&ComputeOptions::default().with_policy(OptimizePolicy::Simple))
        .unwrap_err();
    assert!(
        matches!(&err, ExecError::Task { op, coord, .. } if *op == c.op() && coord == &vec![1]),
        "{err:?}"
    );

    let err = c
        .compute_with(&ComputeOptions::default().with_policy(OptimizePolicy::None))
        .unwrap_err();
    assert!(
        matches!(&err, ExecError::Task { op, .. } if *op == b.op()),
        "{err:?}"
    );
}

#[test]
fn thread_pool_reports_the_same_failure() {
    let ctx = Context::new(Spec::new(100_000)).unwrap();
    let a = input(&ctx);
    let b = ops::elemwise(fails_on_second_block(), &[&a], None).unwrap();

    let pool = Arc::new(ThreadPoolExecutor::new(Some(2), 0).unwrap());
    let err = b
        .compute_with(&ComputeOptions::default().with_executor(pool))
        .unwrap_err();
    assert!(
        matches!(&err, ExecError::Task { op, kind, coord, .. }
            if *op == b.op() && kind == "blockwise" && coord == &vec![1]),
        "{err:?}"
    );
}

#[test]
fn retries_rerun_only_the_failed_task() {
    let ctx = Context::new(Spec::new(100_000)).unwrap();
    let a = input(&ctx);
    let calls = Arc::new(AtomicUsize::new(0));
    let b = ops::elemwise(flaky(2, calls.clone()), &[&a], None).unwrap();

    let options = ComputeOptions::default().with_executor(Arc::new(SequentialExecutor::new(2)));
    let result = b.compute_with(&options).unwrap();
    assert_eq!(result, Block::from_vec(&[4], vec![0i64, 1, 2, 3]).unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn retries_are_bounded() {
    let ctx = Context::new(Spec::new(100_000)).unwrap();
    let a = input(&ctx);
    let calls = Arc::new(AtomicUsize::new(0));
    let b = ops::elemwise(flaky(5, calls.clone()), &[&a], None).unwrap();

    let options = ComputeOptions::default().with_executor(Arc::new(SequentialExecutor::new(1)));
    let err = b.compute_with(&options).unwrap_err();
    assert!(matches!(err, ExecError::Task { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
