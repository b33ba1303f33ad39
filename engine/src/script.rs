// script.rs — JSON plan scripts for the CLI
//
// A script names a sequence of array statements, each built from earlier
// ones, plus the outputs to plan or compute:
//
//     {
//       "spec": {"allowed_mem": "100MB"},
//       "arrays": [
//         {"name": "a", "op": "ones", "shape": [4, 4], "chunks": [2, 2]},
//         {"name": "b", "op": "negative", "x": "a"}
//       ],
//       "outputs": ["b"]
//     }
//
// Preconditions: none.
// Postconditions: `build` records every statement in order and returns the
//                 arrays by name.
// Failure modes: malformed JSON → `ScriptError::Parse`; unknown or
//                duplicate names → `ScriptError::UnknownArray` /
//                `ScriptError::DuplicateArray`; plan errors are wrapped.
// Side effects: records ops in the given context.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::api;
use crate::array::{Array, Context};
use crate::block::Block;
use crate::config::Spec;
use crate::dtype::{DType, Scalar};
use crate::error::PlanError;
use crate::ops;

/// Errors raised while reading or building a script.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("invalid script: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("array '{0}' is not defined")]
    UnknownArray(String),

    #[error("array '{0}' is defined twice")]
    DuplicateArray(String),

    #[error("array '{name}': {source}")]
    Plan {
        name: String,
        #[source]
        source: PlanError,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    #[serde(default)]
    pub spec: Option<Spec>,
    pub arrays: Vec<Statement>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Statement {
    pub name: String,
    #[serde(flatten)]
    pub op: ScriptOp,
}

/// One array-producing call. Array operands are statement names.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptOp {
    Ones {
        shape: Vec<usize>,
        chunks: Vec<usize>,
        #[serde(default)]
        dtype: Option<DType>,
    },
    Zeros {
        shape: Vec<usize>,
        chunks: Vec<usize>,
        #[serde(default)]
        dtype: Option<DType>,
    },
    Full {
        shape: Vec<usize>,
        chunks: Vec<usize>,
        value: Scalar,
        #[serde(default)]
        dtype: Option<DType>,
    },
    /// Row-major `data` of `shape`.
    Asarray {
        shape: Vec<usize>,
        chunks: Vec<usize>,
        data: Vec<Scalar>,
        #[serde(default)]
        dtype: Option<DType>,
    },
    Negative { x: String },
    Positive { x: String },
    Abs { x: String },
    Add { x: String, y: String },
    Subtract { x: String, y: String },
    Multiply { x: String, y: String },
    Equal { x: String, y: String },
    Astype { x: String, dtype: DType },
    /// Reverses the dimensions unless `axes` is given.
    Transpose {
        x: String,
        #[serde(default)]
        axes: Option<Vec<usize>>,
    },
    Rechunk { x: String, chunks: Vec<usize> },
    Sum {
        x: String,
        #[serde(default)]
        axes: Option<Vec<isize>>,
        #[serde(default)]
        keepdims: bool,
    },
    Max {
        x: String,
        #[serde(default)]
        axes: Option<Vec<isize>>,
        #[serde(default)]
        keepdims: bool,
    },
    Min {
        x: String,
        #[serde(default)]
        axes: Option<Vec<isize>>,
        #[serde(default)]
        keepdims: bool,
    },
    Outer { x: String, y: String },
}

pub fn parse(source: &str) -> Result<Script, ScriptError> {
    Ok(serde_json::from_str(source)?)
}

impl Script {
    /// Record every statement in `ctx`.
    pub fn build(&self, ctx: &Arc<Context>) -> Result<BTreeMap<String, Array>, ScriptError> {
        let mut env: BTreeMap<String, Array> = BTreeMap::new();
        for stmt in &self.arrays {
            if env.contains_key(&stmt.name) {
                return Err(ScriptError::DuplicateArray(stmt.name.clone()));
            }
            let array = build_op(ctx, &env, &stmt.op)?.map_err(|source| ScriptError::Plan {
                name: stmt.name.clone(),
                source,
            })?;
            env.insert(stmt.name.clone(), array);
        }
        Ok(env)
    }

    /// The output arrays, in declaration order.
    pub fn outputs<'a>(
        &self,
        env: &'a BTreeMap<String, Array>,
    ) -> Result<Vec<&'a Array>, ScriptError> {
        self.outputs
            .iter()
            .map(|name| {
                env.get(name)
                    .ok_or_else(|| ScriptError::UnknownArray(name.clone()))
            })
            .collect()
    }
}

/// Outer error: unresolved names. Inner: plan errors from the call.
fn build_op(
    ctx: &Arc<Context>,
    env: &BTreeMap<String, Array>,
    op: &ScriptOp,
) -> Result<Result<Array, PlanError>, ScriptError> {
    let get = |name: &String| {
        env.get(name)
            .ok_or_else(|| ScriptError::UnknownArray(name.clone()))
    };
    Ok(match op {
        ScriptOp::Ones {
            shape,
            chunks,
            dtype,
        } => api::ones(ctx, shape, chunks, dtype.unwrap_or(DType::Float64)),
        ScriptOp::Zeros {
            shape,
            chunks,
            dtype,
        } => api::zeros(ctx, shape, chunks, dtype.unwrap_or(DType::Float64)),
        ScriptOp::Full {
            shape,
            chunks,
            value,
            dtype,
        } => api::full(ctx, shape, chunks, *value, *dtype),
        ScriptOp::Asarray {
            shape,
            chunks,
            data,
            dtype,
        } => {
            let dtype = dtype.unwrap_or(data.first().map_or(DType::Float64, |v| v.default_dtype()));
            match Block::from_scalars(dtype, shape, data) {
                Ok(block) => api::asarray(ctx, block, chunks),
                Err(_) => Err(PlanError::ShapeMismatch {
                    expected: vec![shape.iter().product()],
                    got: vec![data.len()],
                }),
            }
        }
        ScriptOp::Negative { x } => api::negative(get(x)?),
        ScriptOp::Positive { x } => api::positive(get(x)?),
        ScriptOp::Abs { x } => api::abs(get(x)?),
        ScriptOp::Add { x, y } => api::add(get(x)?, get(y)?),
        ScriptOp::Subtract { x, y } => api::subtract(get(x)?, get(y)?),
        ScriptOp::Multiply { x, y } => api::multiply(get(x)?, get(y)?),
        ScriptOp::Equal { x, y } => api::equal(get(x)?, get(y)?),
        ScriptOp::Astype { x, dtype } => api::astype(get(x)?, *dtype),
        ScriptOp::Transpose { x, axes } => {
            let x = get(x)?;
            let axes = axes
                .clone()
                .unwrap_or_else(|| (0..x.ndim()).rev().collect());
            api::permute_dims(x, &axes)
        }
        ScriptOp::Rechunk { x, chunks } => ops::rechunk(get(x)?, chunks),
        ScriptOp::Sum { x, axes, keepdims } => api::sum(get(x)?, axes.as_deref(), *keepdims),
        ScriptOp::Max { x, axes, keepdims } => api::max(get(x)?, axes.as_deref(), *keepdims),
        ScriptOp::Min { x, axes, keepdims } => api::min(get(x)?, axes.as_deref(), *keepdims),
        ScriptOp::Outer { x, y } => api::outer(get(x)?, get(y)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: &str = r#"{
        "spec": {"allowed_mem": "1MB"},
        "arrays": [
            {"name": "a", "op": "ones", "shape": [4, 4], "chunks": [2, 2], "dtype": "int64"},
            {"name": "b", "op": "negative", "x": "a"},
            {"name": "c", "op": "sum", "x": "b"}
        ],
        "outputs": ["c"]
    }"#;

    #[test]
    fn builds_statements_in_order() {
        let script = parse(CHAIN).unwrap();
        assert_eq!(script.spec.as_ref().map(|s| s.allowed_mem), Some(1 << 20));
        let ctx = Context::new(script.spec.clone().unwrap_or_default()).unwrap();
        let env = script.build(&ctx).unwrap();
        assert_eq!(env.len(), 3);
        let outputs = script.outputs(&env).unwrap();
        assert_eq!(outputs[0].shape(), &[] as &[usize]);
        assert_eq!(outputs[0].dtype(), DType::Int64);
    }

    #[test]
    fn unknown_operand_is_reported() {
        let script = parse(
            r#"{"arrays": [{"name": "b", "op": "negative", "x": "a"}], "outputs": ["b"]}"#,
        )
        .unwrap();
        let ctx = Context::new(Spec::default()).unwrap();
        let err = script.build(&ctx).unwrap_err();
        assert_eq!(err.to_string(), "array 'a' is not defined");
    }

    #[test]
    fn plan_errors_name_the_statement() {
        let script = parse(
            r#"{"arrays": [
                {"name": "a", "op": "ones", "shape": [4], "chunks": [2]},
                {"name": "b", "op": "sum", "x": "a", "axes": [1]}
            ], "outputs": ["b"]}"#,
        )
        .unwrap();
        let ctx = Context::new(Spec::default()).unwrap();
        let err = script.build(&ctx).unwrap_err();
        assert!(matches!(
            err,
            ScriptError::Plan {
                ref name,
                source: PlanError::AxisOutOfRange { axis: 1, ndim: 1 },
            } if name == "b"
        ));
    }

    #[test]
    fn unknown_op_is_a_parse_error() {
        let err = parse(r#"{"arrays": [{"name": "a", "op": "cholesky"}], "outputs": []}"#)
            .unwrap_err();
        assert!(matches!(err, ScriptError::Parse(_)));
    }
}
