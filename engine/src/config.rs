// config.rs — Resource configuration for a plan context
//
// `Spec` carries the memory budget every operation is checked against, the
// storage location for materialized arrays, and execution settings. Sizes
// may be written as integers or as literals such as `"100MB"`.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PlanError;
use crate::lexer;
use crate::memory::MemoryBudget;
use crate::store::{FsStoreFactory, MemoryStoreFactory, StoreFactory};

const DEFAULT_ALLOWED_MEM: u64 = 2 << 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Spec {
    /// Most memory any single task may use, in bytes.
    #[serde(deserialize_with = "size")]
    pub allowed_mem: u64,
    /// Fixed per-task overhead counted against `allowed_mem`.
    #[serde(deserialize_with = "size")]
    pub reserved_mem: u64,
    /// Directory for array stores. `None` keeps arrays in memory.
    pub work_dir: Option<PathBuf>,
    /// Re-runs allowed per failed task.
    pub retries: usize,
    /// Worker threads. `None` runs tasks sequentially.
    pub threads: Option<usize>,
}

impl Default for Spec {
    fn default() -> Self {
        Spec {
            allowed_mem: DEFAULT_ALLOWED_MEM,
            reserved_mem: 0,
            work_dir: None,
            retries: 0,
            threads: None,
        }
    }
}

impl Spec {
    pub fn new(allowed_mem: u64) -> Self {
        Spec {
            allowed_mem,
            ..Spec::default()
        }
    }

    pub fn with_reserved_mem(mut self, reserved_mem: u64) -> Self {
        self.reserved_mem = reserved_mem;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn budget(&self) -> Result<MemoryBudget, PlanError> {
        MemoryBudget::new(self.allowed_mem, self.reserved_mem)
    }

    /// Factory for the stores of materialized arrays.
    pub fn store_factory(&self) -> Arc<dyn StoreFactory> {
        match &self.work_dir {
            Some(dir) => Arc::new(FsStoreFactory::new(dir.clone())),
            None => Arc::new(MemoryStoreFactory),
        }
    }
}

fn size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Literal(String),
    }
    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Literal(s) => lexer::parse_size(&s).map_err(serde::de::Error::custom),
    }
}
