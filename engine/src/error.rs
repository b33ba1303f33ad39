// error.rs — Error types for plan construction, storage, and execution
//
// Plan errors are raised synchronously by the call that introduced the bad
// operation, before any task runs. Each carries a stable code so callers and
// the CLI can match on it without parsing messages.
//
// Execution errors wrap task failures with the operation id and kind so a
// failure can be located in the plan graph.

use std::fmt;

use crate::dtype::DType;
use crate::id::{ArrayId, OpId};

// ── Error code ──────────────────────────────────────────────────────────────

/// A stable error code (e.g., `E0104`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub &'static str);

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::ErrorCode;

    pub const E0101: ErrorCode = ErrorCode("E0101"); // unknown output label
    pub const E0102: ErrorCode = ErrorCode("E0102"); // adjust-chunks block count mismatch
    pub const E0103: ErrorCode = ErrorCode("E0103"); // axis out of range
    pub const E0104: ErrorCode = ErrorCode("E0104"); // projected memory exceeds budget
    pub const E0105: ErrorCode = ErrorCode("E0105"); // shared label with inconsistent sizes
    pub const E0106: ErrorCode = ErrorCode("E0106"); // irregular chunks where regular required
    pub const E0107: ErrorCode = ErrorCode("E0107"); // zero chunk size
    pub const E0108: ErrorCode = ErrorCode("E0108"); // rank mismatch
    pub const E0109: ErrorCode = ErrorCode("E0109"); // squeeze of non-unit axis
    pub const E0110: ErrorCode = ErrorCode("E0110"); // shape mismatch
    pub const E0111: ErrorCode = ErrorCode("E0111"); // repeated output label
    pub const E0112: ErrorCode = ErrorCode("E0112"); // operand count mismatch
    pub const E0113: ErrorCode = ErrorCode("E0113"); // malformed subscripts
    pub const E0114: ErrorCode = ErrorCode("E0114"); // unsupported dtype
    pub const E0115: ErrorCode = ErrorCode("E0115"); // malformed size literal
    pub const E0116: ErrorCode = ErrorCode("E0116"); // cycle in plan graph
    pub const E0117: ErrorCode = ErrorCode("E0117"); // dangling node reference
    pub const E0118: ErrorCode = ErrorCode("E0118"); // axes are not a permutation
    pub const E0119: ErrorCode = ErrorCode("E0119"); // invalid memory configuration
    pub const E0120: ErrorCode = ErrorCode("E0120"); // arrays from different contexts
}

// ── Plan errors ─────────────────────────────────────────────────────────────

/// Configuration errors raised at plan-build time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("unknown dimension(s) '{0}' in output labels, not bound by any input or new axis")]
    UnknownLabels(String),

    #[error("dimension {dim} has {blocks} blocks, adjust_chunks specified with {given} blocks")]
    AdjustChunksMismatch {
        dim: usize,
        blocks: usize,
        given: usize,
    },

    #[error("axis {axis} is out of bounds for array of dimension {ndim}")]
    AxisOutOfRange { axis: isize, ndim: usize },

    #[error(
        "Projected {kind} memory ({projected}) exceeds allowed_mem ({allowed}), including reserved_mem ({reserved})"
    )]
    MemoryExceeded {
        kind: &'static str,
        projected: u64,
        allowed: u64,
        reserved: u64,
    },

    #[error("dimension '{label}' has inconsistent sizes: {first} vs {second}")]
    ChunkMismatch {
        label: char,
        first: usize,
        second: usize,
    },

    #[error("chunks are irregular: {0:?}")]
    IrregularChunks(Vec<Vec<usize>>),

    #[error("chunk size must be positive for non-empty dimension {dim}")]
    InvalidChunkSize { dim: usize },

    #[error("expected {expected} dimensions, found {found}")]
    RankMismatch { expected: usize, found: usize },

    #[error("cannot squeeze axis {axis} with size {size} (must be 1)")]
    InvalidSqueeze { axis: usize, size: usize },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("output label '{0}' appears more than once")]
    RepeatedOutputLabel(char),

    #[error("operand count mismatch: expected {expected}, found {found}")]
    OperandCountMismatch { expected: usize, found: usize },

    #[error("malformed subscripts: {0}")]
    InvalidSubscripts(String),

    #[error("operation '{op}' does not support dtype {dtype}")]
    UnsupportedDtype { op: &'static str, dtype: DType },

    #[error("malformed size literal: {0}")]
    InvalidSize(String),

    #[error("plan graph contains a cycle through {0}")]
    Cycle(OpId),

    #[error("plan graph references missing array {0}")]
    MissingArray(ArrayId),

    #[error("axes {0:?} are not a permutation of the array dimensions")]
    InvalidPermutation(Vec<usize>),

    #[error("reserved_mem ({reserved}) must be less than allowed_mem ({allowed})")]
    InvalidBudget { allowed: u64, reserved: u64 },

    #[error("arrays belong to different plan contexts")]
    ContextMismatch,
}

impl PlanError {
    /// Stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            PlanError::UnknownLabels(_) => codes::E0101,
            PlanError::AdjustChunksMismatch { .. } => codes::E0102,
            PlanError::AxisOutOfRange { .. } => codes::E0103,
            PlanError::MemoryExceeded { .. } => codes::E0104,
            PlanError::ChunkMismatch { .. } => codes::E0105,
            PlanError::IrregularChunks(_) => codes::E0106,
            PlanError::InvalidChunkSize { .. } => codes::E0107,
            PlanError::RankMismatch { .. } => codes::E0108,
            PlanError::InvalidSqueeze { .. } => codes::E0109,
            PlanError::ShapeMismatch { .. } => codes::E0110,
            PlanError::RepeatedOutputLabel(_) => codes::E0111,
            PlanError::OperandCountMismatch { .. } => codes::E0112,
            PlanError::InvalidSubscripts(_) => codes::E0113,
            PlanError::UnsupportedDtype { .. } => codes::E0114,
            PlanError::InvalidSize(_) => codes::E0115,
            PlanError::Cycle(_) => codes::E0116,
            PlanError::MissingArray(_) => codes::E0117,
            PlanError::InvalidPermutation(_) => codes::E0118,
            PlanError::InvalidBudget { .. } => codes::E0119,
            PlanError::ContextMismatch => codes::E0120,
        }
    }
}

// ── Block, store, and task errors ───────────────────────────────────────────

/// Failures of in-memory block operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BlockError {
    #[error("dtype mismatch: expected {expected}, found {found}")]
    DtypeMismatch { expected: DType, found: DType },

    #[error("shapes {left:?} and {right:?} cannot be broadcast together")]
    Broadcast { left: Vec<usize>, right: Vec<usize> },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    Shape { expected: Vec<usize>, got: Vec<usize> },

    #[error("invalid axis {axis} for block of dimension {ndim}")]
    Axis { axis: usize, ndim: usize },

    #[error("kernel '{kernel}' expects {expected} operand(s), got {got}")]
    Arity {
        kernel: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{0}")]
    Kernel(String),
}

/// Failures of a chunk store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("block {coord:?} is outside the block grid {grid:?}")]
    OutOfBounds { coord: Vec<usize>, grid: Vec<usize> },

    #[error("block {0:?} has not been written")]
    MissingBlock(Vec<usize>),

    #[error("store '{0}' is read-only")]
    ReadOnly(String),

    #[error("store '{0}' has not been created")]
    NotCreated(String),

    #[error("invalid block written to {coord:?}: {source}")]
    InvalidBlock {
        coord: Vec<usize>,
        #[source]
        source: BlockError,
    },

    #[error("invalid store metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("zarr array at {0:?} was not written by chunkflow")]
    ForeignArray(std::path::PathBuf),

    #[error(transparent)]
    ZarrArray(#[from] zarrs::array::ArrayError),

    #[error(transparent)]
    ZarrCreate(#[from] zarrs::array::ArrayCreateError),

    #[error(transparent)]
    ZarrStorage(#[from] zarrs::storage::StorageError),

    #[error(transparent)]
    ZarrFilesystem(#[from] zarrs::filesystem::FilesystemStoreCreateError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure of a single task.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error("task for block {coord:?} expected {expected} operand key(s), got {got}")]
    Keys {
        coord: Vec<usize>,
        expected: usize,
        got: usize,
    },

    #[error("side input {index} requested, but the kernel has {count}")]
    SideInput { index: usize, count: usize },
}

// ── Execution errors ────────────────────────────────────────────────────────

/// Errors surfaced when results are materialized.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("{op} ({kind}) failed in stage '{stage}' at block {coord:?}: {source}")]
    Task {
        op: OpId,
        kind: String,
        stage: String,
        coord: Vec<usize>,
        #[source]
        source: TaskError,
    },

    #[error("creating store for {array} failed: {source}")]
    Create {
        array: String,
        #[source]
        source: StoreError,
    },

    #[error("reading result {array} failed: {source}")]
    Read {
        array: ArrayId,
        #[source]
        source: StoreError,
    },

    #[error("plan verification failed: {0}")]
    Verification(String),

    #[error("thread pool: {0}")]
    ThreadPool(String),
}

/// Convenience alias for `Result<T, PlanError>`.
pub type Result<T> = std::result::Result<T, PlanError>;
