use clap::Parser;
use std::path::PathBuf;

use chunkflow::array::{arrays_to_plan, compute, Array, ComputeOptions};
use chunkflow::graph::PlanGraph;
use chunkflow::optimize::{optimize, FuseOptions, OptimizePolicy};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Policy {
    None,
    Simple,
    MultipleInputs,
    FuseAll,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum EmitStage {
    Stats,
    Dot,
    Json,
    Result,
}

#[derive(Parser, Debug)]
#[command(
    name = "chunkflow",
    version,
    about = "Plan, optimize and run memory-bounded chunked array computations"
)]
struct Cli {
    /// Input .json plan script
    script: PathBuf,

    /// Fusion policy
    #[arg(long, value_enum, default_value_t = Policy::Simple)]
    optimize: Policy,

    /// Fan-in cap for multiple-inputs fusion
    #[arg(long)]
    max_total_source_arrays: Option<usize>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Stats)]
    emit: EmitStage,

    /// Per-task memory limit (e.g. 100MB); overrides the script's spec
    #[arg(long, value_parser = parse_size)]
    allowed_mem: Option<u64>,

    /// Per-task reserved memory; overrides the script's spec
    #[arg(long, value_parser = parse_size)]
    reserved_mem: Option<u64>,

    /// Worker threads for --emit result
    #[arg(long)]
    threads: Option<usize>,

    /// Log planning and execution to stderr
    #[arg(long)]
    verbose: bool,
}

fn parse_size(s: &str) -> Result<u64, String> {
    chunkflow::lexer::parse_size(s).map_err(|e| e.to_string())
}

fn policy(cli: &Cli) -> OptimizePolicy {
    match cli.optimize {
        Policy::None => OptimizePolicy::None,
        Policy::Simple => OptimizePolicy::Simple,
        Policy::MultipleInputs => OptimizePolicy::MultipleInputs(
            cli.max_total_source_arrays
                .map_or_else(FuseOptions::default, |n| {
                    FuseOptions::default().with_max_total_source_arrays(n)
                }),
        ),
        Policy::FuseAll => OptimizePolicy::FuseAll,
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(if cli.verbose { "chunkflow=debug" } else { "warn" })
        .init();

    // ── Read and parse script ──
    let source = match std::fs::read_to_string(&cli.script) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("chunkflow: error: {}: {}", cli.script.display(), e);
            std::process::exit(2);
        }
    };
    let script = match chunkflow::script::parse(&source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("chunkflow: error: {}: {}", cli.script.display(), e);
            std::process::exit(2);
        }
    };

    // ── Resource spec ──
    let mut spec = script.spec.clone().unwrap_or_default();
    if let Some(n) = cli.allowed_mem {
        spec.allowed_mem = n;
    }
    if let Some(n) = cli.reserved_mem {
        spec.reserved_mem = n;
    }
    if cli.threads.is_some() {
        spec.threads = cli.threads;
    }

    // ── Build the plan ──
    let ctx = match chunkflow::array::Context::new(spec) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("chunkflow: error[{}]: {}", e.code(), e);
            std::process::exit(1);
        }
    };
    let env = match script.build(&ctx) {
        Ok(env) => env,
        Err(e) => {
            eprintln!("chunkflow: error: {}", e);
            std::process::exit(1);
        }
    };
    let outputs = match script.outputs(&env) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("chunkflow: error: {}", e);
            std::process::exit(1);
        }
    };

    let policy = policy(&cli);
    match cli.emit {
        EmitStage::Result => {
            let options = ComputeOptions::default().with_policy(policy);
            let blocks = match compute(&outputs, &options) {
                Ok(b) => b,
                Err(e) => {
                    eprintln!("chunkflow: error: {}", e);
                    std::process::exit(1);
                }
            };
            for (name, block) in script.outputs.iter().zip(&blocks) {
                let values: Vec<String> = block.to_scalars().iter().map(|v| v.to_string()).collect();
                println!(
                    "{name}: {} {:?} [{}]",
                    block.dtype(),
                    block.shape(),
                    values.join(", ")
                );
            }
        }
        EmitStage::Stats => {
            let (_, optimized) = plan_and_optimize(&outputs, &policy);
            println!("policy: {}", policy.name());
            println!("{}", optimized.stats());
        }
        EmitStage::Dot => {
            let (_, optimized) = plan_and_optimize(&outputs, &policy);
            print!("{}", chunkflow::dot::emit_dot(&optimized));
        }
        EmitStage::Json => {
            let (plan, optimized) = plan_and_optimize(&outputs, &policy);
            let report = serde_json::json!({
                "policy": policy.name(),
                "plan": plan.stats(),
                "optimized": optimized.stats(),
            });
            match serde_json::to_string_pretty(&report) {
                Ok(s) => println!("{s}"),
                Err(e) => {
                    eprintln!("chunkflow: error: {}", e);
                    std::process::exit(2);
                }
            }
        }
    }
}

/// The requested plan and its optimized form; exits on plan errors.
fn plan_and_optimize(outputs: &[&Array], policy: &OptimizePolicy) -> (PlanGraph, PlanGraph) {
    let result = arrays_to_plan(outputs).and_then(|plan| {
        let optimized = optimize(&plan, policy)?;
        Ok((plan, optimized))
    });
    match result {
        Ok(plans) => plans,
        Err(e) => {
            eprintln!("chunkflow: error[{}]: {}", e.code(), e);
            std::process::exit(1);
        }
    }
}
