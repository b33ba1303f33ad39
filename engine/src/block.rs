// block.rs — Dense in-memory blocks
//
// A `Block` is one chunk of an array held in memory, backed by an ndarray
// `ArrayD` of the block's dtype. Everything a kernel or a merge needs to do
// to a block lives here: dtype conversion, region slicing and assignment,
// keepdims reductions, broadcasting elementwise arithmetic, and outer
// products.
//
// Preconditions: regions and axes are validated against the block shape.
// Postconditions: results are always in standard (row-major) layout.
// Failure modes: shape, axis, and dtype mismatches return `BlockError`.
// Side effects: none.

use std::borrow::Cow;
use std::fmt;
use std::ops::Range;

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice, Zip};
use serde::{Deserialize, Serialize};

use crate::dtype::{DType, Scalar};
use crate::error::BlockError;

// ── Element trait ───────────────────────────────────────────────────────────

/// A Rust element type that can back a block.
pub trait Element: Copy + PartialEq + PartialOrd + Send + Sync + fmt::Debug + 'static {
    const DTYPE: DType;
    const ZERO: Self;
    const ONE: Self;
    /// Identity for `maximum`.
    const LOWEST: Self;
    /// Identity for `minimum`.
    const HIGHEST: Self;

    fn wrap(array: ArrayD<Self>) -> Block;
    fn unwrap(block: &Block) -> Option<&ArrayD<Self>>;

    fn from_scalar(value: Scalar) -> Self;
    fn to_scalar(self) -> Scalar;

    fn plus(self, other: Self) -> Self;
    fn minus(self, other: Self) -> Self;
    fn times(self, other: Self) -> Self;
    fn negate(self) -> Self;
    fn magnitude(self) -> Self;
    fn maximum(self, other: Self) -> Self;
    fn minimum(self, other: Self) -> Self;
}

macro_rules! int_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;
            const ZERO: Self = 0;
            const ONE: Self = 1;
            const LOWEST: Self = <$t>::MIN;
            const HIGHEST: Self = <$t>::MAX;

            fn wrap(array: ArrayD<Self>) -> Block {
                Block::$variant(array)
            }

            fn unwrap(block: &Block) -> Option<&ArrayD<Self>> {
                match block {
                    Block::$variant(a) => Some(a),
                    _ => None,
                }
            }

            fn from_scalar(value: Scalar) -> Self {
                match value {
                    Scalar::Bool(b) => <$t>::from(b),
                    Scalar::Int(i) => i as $t,
                    Scalar::Float(f) => f as $t,
                }
            }

            fn to_scalar(self) -> Scalar {
                Scalar::Int(self as i64)
            }

            // Integer arithmetic wraps on overflow.
            fn plus(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
            fn minus(self, other: Self) -> Self {
                self.wrapping_sub(other)
            }
            fn times(self, other: Self) -> Self {
                self.wrapping_mul(other)
            }
            fn negate(self) -> Self {
                self.wrapping_neg()
            }
            fn magnitude(self) -> Self {
                self.wrapping_abs()
            }
            fn maximum(self, other: Self) -> Self {
                self.max(other)
            }
            fn minimum(self, other: Self) -> Self {
                self.min(other)
            }
        }
    };
}

macro_rules! float_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;
            const ZERO: Self = 0.0;
            const ONE: Self = 1.0;
            const LOWEST: Self = <$t>::NEG_INFINITY;
            const HIGHEST: Self = <$t>::INFINITY;

            fn wrap(array: ArrayD<Self>) -> Block {
                Block::$variant(array)
            }

            fn unwrap(block: &Block) -> Option<&ArrayD<Self>> {
                match block {
                    Block::$variant(a) => Some(a),
                    _ => None,
                }
            }

            fn from_scalar(value: Scalar) -> Self {
                match value {
                    Scalar::Bool(b) => <$t>::from(u8::from(b)),
                    Scalar::Int(i) => i as $t,
                    Scalar::Float(f) => f as $t,
                }
            }

            fn to_scalar(self) -> Scalar {
                Scalar::Float(self as f64)
            }

            fn plus(self, other: Self) -> Self {
                self + other
            }
            fn minus(self, other: Self) -> Self {
                self - other
            }
            fn times(self, other: Self) -> Self {
                self * other
            }
            fn negate(self) -> Self {
                -self
            }
            fn magnitude(self) -> Self {
                self.abs()
            }
            // NaN propagates through max and min.
            fn maximum(self, other: Self) -> Self {
                if self.is_nan() || other.is_nan() {
                    <$t>::NAN
                } else {
                    self.max(other)
                }
            }
            fn minimum(self, other: Self) -> Self {
                if self.is_nan() || other.is_nan() {
                    <$t>::NAN
                } else {
                    self.min(other)
                }
            }
        }
    };
}

int_element!(i32, Int32);
int_element!(i64, Int64);
float_element!(f32, Float32);
float_element!(f64, Float64);

/// Booleans use logical or/and for plus/times.
impl Element for bool {
    const DTYPE: DType = DType::Bool;
    const ZERO: Self = false;
    const ONE: Self = true;
    const LOWEST: Self = false;
    const HIGHEST: Self = true;

    fn wrap(array: ArrayD<Self>) -> Block {
        Block::Bool(array)
    }

    fn unwrap(block: &Block) -> Option<&ArrayD<Self>> {
        match block {
            Block::Bool(a) => Some(a),
            _ => None,
        }
    }

    fn from_scalar(value: Scalar) -> Self {
        match value {
            Scalar::Bool(b) => b,
            Scalar::Int(i) => i != 0,
            Scalar::Float(f) => f != 0.0,
        }
    }

    fn to_scalar(self) -> Scalar {
        Scalar::Bool(self)
    }

    fn plus(self, other: Self) -> Self {
        self || other
    }
    fn minus(self, other: Self) -> Self {
        self ^ other
    }
    fn times(self, other: Self) -> Self {
        self && other
    }
    fn negate(self) -> Self {
        !self
    }
    fn magnitude(self) -> Self {
        self
    }
    fn maximum(self, other: Self) -> Self {
        self || other
    }
    fn minimum(self, other: Self) -> Self {
        self && other
    }
}

// ── Block ───────────────────────────────────────────────────────────────────

/// One dense block of an array.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Bool(ArrayD<bool>),
    Int32(ArrayD<i32>),
    Int64(ArrayD<i64>),
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
}

/// Run `$body` with `$a` bound to the inner array, whatever its type.
macro_rules! visit {
    ($block:expr, $a:ident => $body:expr) => {
        match $block {
            Block::Bool($a) => $body,
            Block::Int32($a) => $body,
            Block::Int64($a) => $body,
            Block::Float32($a) => $body,
            Block::Float64($a) => $body,
        }
    };
}

/// Run `$body` with the type alias `$t` bound to the element type of `$dtype`.
macro_rules! with_dtype {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            DType::Bool => {
                type $t = bool;
                $body
            }
            DType::Int32 => {
                type $t = i32;
                $body
            }
            DType::Int64 => {
                type $t = i64;
                $body
            }
            DType::Float32 => {
                type $t = f32;
                $body
            }
            DType::Float64 => {
                type $t = f64;
                $body
            }
        }
    };
}

/// Elementwise binary operations with broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Equal,
}

/// Associative, commutative reducers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reducer {
    Sum,
    Prod,
    Max,
    Min,
}

impl fmt::Display for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Reducer::Sum => "sum",
            Reducer::Prod => "prod",
            Reducer::Max => "max",
            Reducer::Min => "min",
        })
    }
}

impl Block {
    // ── Construction ──

    /// A block of `shape` with every element set to `value`.
    pub fn full(dtype: DType, shape: &[usize], value: Scalar) -> Block {
        with_dtype!(dtype, T => T::wrap(ArrayD::from_elem(IxDyn(shape), T::from_scalar(value))))
    }

    pub fn zeros(dtype: DType, shape: &[usize]) -> Block {
        Block::full(dtype, shape, Scalar::Int(0))
    }

    /// A block from row-major data.
    pub fn from_vec<T: Element>(shape: &[usize], data: Vec<T>) -> Result<Block, BlockError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(BlockError::Shape {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(T::wrap)
            .map_err(|e| BlockError::Kernel(e.to_string()))
    }

    /// A block of `dtype` from row-major scalar values.
    pub fn from_scalars(dtype: DType, shape: &[usize], values: &[Scalar]) -> Result<Block, BlockError> {
        with_dtype!(dtype, T => {
            let data: Vec<T> = values.iter().map(|&v| T::from_scalar(v)).collect();
            Block::from_vec(shape, data)
        })
    }

    // ── Queries ──

    pub fn dtype(&self) -> DType {
        match self {
            Block::Bool(_) => DType::Bool,
            Block::Int32(_) => DType::Int32,
            Block::Int64(_) => DType::Int64,
            Block::Float32(_) => DType::Float32,
            Block::Float64(_) => DType::Float64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        visit!(self, a => a.shape())
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        visit!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nbytes(&self) -> usize {
        self.len() * self.dtype().itemsize()
    }

    pub fn as_array<T: Element>(&self) -> Option<&ArrayD<T>> {
        T::unwrap(self)
    }

    /// Elements in row-major order.
    pub fn to_scalars(&self) -> Vec<Scalar> {
        visit!(self, a => a.iter().map(|x| x.to_scalar()).collect())
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        visit!(self, a => a.iter().map(|x| x.to_scalar().as_f64()).collect())
    }

    // ── Conversion ──

    pub fn astype(&self, dtype: DType) -> Block {
        self.cast(dtype).into_owned()
    }

    fn cast(&self, dtype: DType) -> Cow<'_, Block> {
        if self.dtype() == dtype {
            return Cow::Borrowed(self);
        }
        Cow::Owned(visit!(self, a => with_dtype!(dtype, T => {
            T::wrap(a.mapv(|x| T::from_scalar(x.to_scalar())))
        })))
    }

    // ── Regions ──

    /// Copy of the elements inside `region`.
    pub fn slice(&self, region: &[Range<usize>]) -> Result<Block, BlockError> {
        check_region(self.shape(), region)?;
        Ok(visit!(self, a => Element::wrap(
            a.slice_each_axis(|ax| Slice::from(region[ax.axis.index()].clone()))
                .to_owned()
        )))
    }

    /// Overwrite `region` with `src`, which must match its shape and dtype.
    pub fn assign(&mut self, region: &[Range<usize>], src: &Block) -> Result<(), BlockError> {
        check_region(self.shape(), region)?;
        let expected: Vec<usize> = region.iter().map(|r| r.end - r.start).collect();
        if src.shape() != expected.as_slice() {
            return Err(BlockError::Shape {
                expected,
                got: src.shape().to_vec(),
            });
        }
        let found = src.dtype();
        match (self, src) {
            (Block::Bool(d), Block::Bool(s)) => assign_region(d, region, s),
            (Block::Int32(d), Block::Int32(s)) => assign_region(d, region, s),
            (Block::Int64(d), Block::Int64(s)) => assign_region(d, region, s),
            (Block::Float32(d), Block::Float32(s)) => assign_region(d, region, s),
            (Block::Float64(d), Block::Float64(s)) => assign_region(d, region, s),
            (dst, _) => {
                return Err(BlockError::DtypeMismatch {
                    expected: dst.dtype(),
                    found,
                })
            }
        }
        Ok(())
    }

    /// Concatenate blocks of one dtype along `axis`.
    pub fn concat(blocks: &[Block], axis: usize) -> Result<Block, BlockError> {
        let Some(first) = blocks.first() else {
            return Err(BlockError::Arity {
                kernel: "concat",
                expected: 1,
                got: 0,
            });
        };
        if axis >= first.ndim() {
            return Err(BlockError::Axis {
                axis,
                ndim: first.ndim(),
            });
        }
        let dtype = first.dtype();
        with_dtype!(dtype, T => {
            let views = blocks
                .iter()
                .map(|b| {
                    T::unwrap(b).map(|a| a.view()).ok_or(BlockError::DtypeMismatch {
                        expected: dtype,
                        found: b.dtype(),
                    })
                })
                .collect::<Result<Vec<ArrayViewD<'_, T>>, _>>()?;
            ndarray::concatenate(Axis(axis), &views)
                .map(T::wrap)
                .map_err(|e| BlockError::Kernel(format!("concatenate: {e}")))
        })
    }

    /// Join a row-major grid of blocks into one block. `grid[k]` blocks are
    /// laid along block axis `axes[k]`; the first grid axis is outermost.
    pub fn assemble(blocks: Vec<Block>, grid: &[usize], axes: &[usize]) -> Result<Block, BlockError> {
        let expected: usize = grid.iter().product();
        if blocks.len() != expected || grid.len() != axes.len() {
            return Err(BlockError::Arity {
                kernel: "assemble",
                expected,
                got: blocks.len(),
            });
        }
        assemble_grid(blocks, grid, axes)
    }

    // ── Reductions and layout ──

    /// Reduce over `axes`; with `keepdims` the reduced axes stay with length 1.
    pub fn reduce(&self, reducer: Reducer, axes: &[usize], keepdims: bool) -> Result<Block, BlockError> {
        let ndim = self.ndim();
        let mut sorted = axes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if let Some(&axis) = sorted.iter().find(|&&a| a >= ndim) {
            return Err(BlockError::Axis { axis, ndim });
        }
        Ok(visit!(self, a => Element::wrap(reduce_array(a, reducer, &sorted, keepdims))))
    }

    pub fn permute(&self, axes: &[usize]) -> Result<Block, BlockError> {
        let ndim = self.ndim();
        let mut seen = vec![false; ndim];
        for &axis in axes {
            if axis >= ndim || std::mem::replace(&mut seen[axis], true) {
                return Err(BlockError::Axis { axis, ndim });
            }
        }
        if axes.len() != ndim {
            return Err(BlockError::Shape {
                expected: vec![ndim],
                got: vec![axes.len()],
            });
        }
        Ok(visit!(self, a => Element::wrap(
            a.clone()
                .permuted_axes(axes.to_vec())
                .as_standard_layout()
                .into_owned()
        )))
    }

    /// Remove length-1 `axes`.
    pub fn squeeze(&self, axes: &[usize]) -> Result<Block, BlockError> {
        let ndim = self.ndim();
        let mut sorted = axes.to_vec();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        sorted.dedup();
        for &axis in &sorted {
            if axis >= ndim || self.shape()[axis] != 1 {
                return Err(BlockError::Axis { axis, ndim });
            }
        }
        Ok(visit!(self, a => {
            let mut out = a.clone();
            for &axis in &sorted {
                out = out.index_axis_move(Axis(axis), 0);
            }
            Element::wrap(out)
        }))
    }

    // ── Elementwise ──

    pub fn negative(&self) -> Block {
        visit!(self, a => Element::wrap(a.mapv(|x| x.negate())))
    }

    pub fn abs(&self) -> Block {
        visit!(self, a => Element::wrap(a.mapv(|x| x.magnitude())))
    }

    /// Broadcasting binary operation after promoting both sides to a common dtype.
    pub fn binary(op: BinaryOp, lhs: &Block, rhs: &Block) -> Result<Block, BlockError> {
        let dtype = DType::result_type(lhs.dtype(), rhs.dtype());
        let (lhs, rhs) = (lhs.cast(dtype), rhs.cast(dtype));
        match (lhs.as_ref(), rhs.as_ref()) {
            (Block::Bool(x), Block::Bool(y)) => apply_binary(op, x, y),
            (Block::Int32(x), Block::Int32(y)) => apply_binary(op, x, y),
            (Block::Int64(x), Block::Int64(y)) => apply_binary(op, x, y),
            (Block::Float32(x), Block::Float32(y)) => apply_binary(op, x, y),
            (Block::Float64(x), Block::Float64(y)) => apply_binary(op, x, y),
            (x, y) => Err(BlockError::DtypeMismatch {
                expected: x.dtype(),
                found: y.dtype(),
            }),
        }
    }

    /// Outer product: the result has shape `lhs.shape ++ rhs.shape`.
    pub fn outer(lhs: &Block, rhs: &Block) -> Result<Block, BlockError> {
        let dtype = DType::result_type(lhs.dtype(), rhs.dtype());
        let (lhs, rhs) = (lhs.cast(dtype), rhs.cast(dtype));
        match (lhs.as_ref(), rhs.as_ref()) {
            (Block::Bool(x), Block::Bool(y)) => outer_arrays(x, y),
            (Block::Int32(x), Block::Int32(y)) => outer_arrays(x, y),
            (Block::Int64(x), Block::Int64(y)) => outer_arrays(x, y),
            (Block::Float32(x), Block::Float32(y)) => outer_arrays(x, y),
            (Block::Float64(x), Block::Float64(y)) => outer_arrays(x, y),
            (x, y) => Err(BlockError::DtypeMismatch {
                expected: x.dtype(),
                found: y.dtype(),
            }),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn check_region(shape: &[usize], region: &[Range<usize>]) -> Result<(), BlockError> {
    let in_bounds = region.len() == shape.len()
        && region
            .iter()
            .zip(shape)
            .all(|(r, &n)| r.start <= r.end && r.end <= n);
    if in_bounds {
        Ok(())
    } else {
        Err(BlockError::Shape {
            expected: shape.to_vec(),
            got: region.iter().map(|r| r.end).collect(),
        })
    }
}

fn assign_region<T: Element>(dst: &mut ArrayD<T>, region: &[Range<usize>], src: &ArrayD<T>) {
    dst.slice_each_axis_mut(|ax| Slice::from(region[ax.axis.index()].clone()))
        .assign(src);
}

fn assemble_grid(mut blocks: Vec<Block>, grid: &[usize], axes: &[usize]) -> Result<Block, BlockError> {
    let Some((&n, inner)) = grid.split_first() else {
        return blocks.pop().ok_or(BlockError::Arity {
            kernel: "assemble",
            expected: 1,
            got: 0,
        });
    };
    let stride: usize = inner.iter().product();
    let mut remaining = blocks.into_iter();
    let mut parts = Vec::with_capacity(n);
    for _ in 0..n {
        let group: Vec<Block> = remaining.by_ref().take(stride).collect();
        parts.push(assemble_grid(group, inner, &axes[1..])?);
    }
    if parts.len() == 1 {
        return parts.pop().ok_or(BlockError::Arity {
            kernel: "assemble",
            expected: 1,
            got: 0,
        });
    }
    Block::concat(&parts, axes[0])
}

fn reduce_array<T: Element>(a: &ArrayD<T>, reducer: Reducer, axes: &[usize], keepdims: bool) -> ArrayD<T> {
    let (init, step): (T, fn(T, T) -> T) = match reducer {
        Reducer::Sum => (T::ZERO, T::plus),
        Reducer::Prod => (T::ONE, T::times),
        Reducer::Max => (T::LOWEST, T::maximum),
        Reducer::Min => (T::HIGHEST, T::minimum),
    };
    let mut out = a.clone();
    for &axis in axes {
        out = out
            .fold_axis(Axis(axis), init, |acc, &x| step(*acc, x))
            .insert_axis(Axis(axis));
    }
    if !keepdims {
        for &axis in axes.iter().rev() {
            out = out.index_axis_move(Axis(axis), 0);
        }
    }
    out
}

fn broadcast_shape(left: &[usize], right: &[usize]) -> Result<Vec<usize>, BlockError> {
    let ndim = left.len().max(right.len());
    let mut shape = vec![0; ndim];
    for i in 0..ndim {
        let l = if i < ndim - left.len() { 1 } else { left[i - (ndim - left.len())] };
        let r = if i < ndim - right.len() { 1 } else { right[i - (ndim - right.len())] };
        shape[i] = match (l, r) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => {
                return Err(BlockError::Broadcast {
                    left: left.to_vec(),
                    right: right.to_vec(),
                })
            }
        };
    }
    Ok(shape)
}

fn zip_with<T: Element, U>(
    lhs: ArrayViewD<'_, T>,
    rhs: ArrayViewD<'_, T>,
    f: impl Fn(T, T) -> U,
) -> Result<ArrayD<U>, BlockError> {
    let shape = broadcast_shape(lhs.shape(), rhs.shape())?;
    let broadcast_err = || BlockError::Broadcast {
        left: lhs.shape().to_vec(),
        right: rhs.shape().to_vec(),
    };
    let l = lhs.broadcast(IxDyn(&shape)).ok_or_else(broadcast_err)?;
    let r = rhs.broadcast(IxDyn(&shape)).ok_or_else(broadcast_err)?;
    Ok(Zip::from(l).and(r).map_collect(|&x, &y| f(x, y)))
}

fn apply_binary<T: Element>(op: BinaryOp, x: &ArrayD<T>, y: &ArrayD<T>) -> Result<Block, BlockError> {
    Ok(match op {
        BinaryOp::Add => T::wrap(zip_with(x.view(), y.view(), T::plus)?),
        BinaryOp::Subtract => T::wrap(zip_with(x.view(), y.view(), T::minus)?),
        BinaryOp::Multiply => T::wrap(zip_with(x.view(), y.view(), T::times)?),
        BinaryOp::Equal => Block::Bool(zip_with(x.view(), y.view(), |p, q| p == q)?),
    })
}

fn outer_arrays<T: Element>(x: &ArrayD<T>, y: &ArrayD<T>) -> Result<Block, BlockError> {
    let mut lhs = x.view();
    for _ in 0..y.ndim() {
        let n = lhs.ndim();
        lhs = lhs.insert_axis(Axis(n));
    }
    Ok(T::wrap(zip_with(lhs, y.view(), T::times)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(shape: &[usize], data: Vec<i64>) -> Block {
        Block::from_vec(shape, data).unwrap()
    }

    #[test]
    fn slice_and_assign_regions() {
        let b = ints(&[3, 3], (0..9).collect());
        let s = b.slice(&[1..3, 0..2]).unwrap();
        assert_eq!(s, ints(&[2, 2], vec![3, 4, 6, 7]));

        let mut z = Block::zeros(DType::Int64, &[3, 3]);
        z.assign(&[1..3, 0..2], &s).unwrap();
        assert_eq!(z.to_f64_vec(), vec![0., 0., 0., 3., 4., 0., 6., 7., 0.]);
    }

    #[test]
    fn assign_rejects_dtype_mismatch() {
        let mut z = Block::zeros(DType::Int64, &[2]);
        let f = Block::zeros(DType::Float32, &[2]);
        assert!(matches!(
            z.assign(&[0..2], &f),
            Err(BlockError::DtypeMismatch { .. })
        ));
    }

    #[test]
    fn reduce_keepdims_and_drop() {
        let b = ints(&[2, 3], vec![1, 2, 3, 4, 5, 6]);
        let kept = b.reduce(Reducer::Sum, &[1], true).unwrap();
        assert_eq!(kept, ints(&[2, 1], vec![6, 15]));
        let all = b.reduce(Reducer::Max, &[0, 1], false).unwrap();
        assert_eq!(all.shape(), &[] as &[usize]);
        assert_eq!(all.to_f64_vec(), vec![6.0]);
        assert!(b.reduce(Reducer::Sum, &[2], true).is_err());
    }

    #[test]
    fn binary_broadcasts_and_promotes() {
        let a = ints(&[2, 2], vec![1, 2, 3, 4]);
        let b = Block::from_vec(&[2], vec![0.5f32, 1.5]).unwrap();
        let sum = Block::binary(BinaryOp::Add, &a, &b).unwrap();
        assert_eq!(sum.dtype(), DType::Float64);
        assert_eq!(sum.to_f64_vec(), vec![1.5, 3.5, 3.5, 5.5]);

        let eq = Block::binary(BinaryOp::Equal, &a, &a).unwrap();
        assert_eq!(eq, Block::full(DType::Bool, &[2, 2], Scalar::Bool(true)));

        let bad = ints(&[3], vec![1, 2, 3]);
        assert!(matches!(
            Block::binary(BinaryOp::Add, &a, &bad),
            Err(BlockError::Broadcast { .. })
        ));
    }

    #[test]
    fn outer_product() {
        let a = ints(&[2], vec![1, 2]);
        let b = ints(&[3], vec![10, 50, 100]);
        let o = Block::outer(&a, &b).unwrap();
        assert_eq!(o, ints(&[2, 3], vec![10, 50, 100, 20, 100, 200]));
    }

    #[test]
    fn permute_and_squeeze() {
        let b = ints(&[1, 2, 3], (0..6).collect());
        let p = b.permute(&[2, 1, 0]).unwrap();
        assert_eq!(p.shape(), &[3, 2, 1]);
        assert_eq!(p.to_f64_vec(), vec![0., 3., 1., 4., 2., 5.]);
        let s = b.squeeze(&[0]).unwrap();
        assert_eq!(s.shape(), &[2, 3]);
        assert!(b.squeeze(&[1]).is_err());
        assert!(b.permute(&[0, 0, 1]).is_err());
    }

    #[test]
    fn assemble_grid_row_major() {
        let blocks = vec![
            ints(&[1, 1], vec![0]),
            ints(&[1, 2], vec![1, 2]),
            ints(&[2, 1], vec![3, 6]),
            ints(&[2, 2], vec![4, 5, 7, 8]),
        ];
        let whole = Block::assemble(blocks, &[2, 2], &[0, 1]).unwrap();
        assert_eq!(whole, ints(&[3, 3], (0..9).collect()));
    }

    #[test]
    fn astype_truncates_like_numpy() {
        let f = Block::from_vec(&[3], vec![-1.7f64, 0.0, 2.9]).unwrap();
        assert_eq!(f.astype(DType::Int32), Block::from_vec(&[3], vec![-1i32, 0, 2]).unwrap());
        assert_eq!(
            f.astype(DType::Bool),
            Block::from_vec(&[3], vec![true, false, true]).unwrap()
        );
    }
}
