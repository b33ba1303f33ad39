// store.rs — Chunk stores and lazy store handles
//
// A chunk store is an addressable collection of blocks keyed by block
// coordinate, with a fixed dtype, shape, and chunk structure. The engine
// only needs create/read/write of whole blocks plus a per-chunk size
// estimate for memory projection.
//
// Stores backing intermediate and output arrays are created lazily: a
// `StoreHandle` holds the metadata and a factory until the plan executes.
//
// Preconditions: block coordinates lie inside the store's block grid.
// Postconditions: a written block reads back bit-identically.
// Failure modes: out-of-range coordinates, shape/dtype mismatches, missing
//                blocks, and I/O errors return `StoreError`.
// Side effects: `FsStore` writes a zarr v3 array under its directory.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use zarrs::array::{data_type, ArrayBuilder, Element as ZarrElement, ElementOwned, FillValue};
use zarrs::filesystem::FilesystemStore;

use crate::block::{Block, Element};
use crate::chunks::Chunks;
use crate::dtype::{DType, Scalar};
use crate::error::{BlockError, StoreError};

// ── Metadata ────────────────────────────────────────────────────────────────

/// Shape, dtype, and chunk structure of a stored array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayMeta {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub chunks: Chunks,
}

impl ArrayMeta {
    pub fn new(dtype: DType, chunks: Chunks) -> Self {
        ArrayMeta {
            shape: chunks.shape(),
            dtype,
            chunks,
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes of the whole array, uncompressed.
    pub fn nbytes(&self) -> u64 {
        (self.size() * self.dtype.itemsize()) as u64
    }

    /// Bytes of the largest block, uncompressed.
    pub fn chunk_nbytes(&self) -> u64 {
        (self.chunks.max_block_elements() * self.dtype.itemsize()) as u64
    }

    fn check_coord(&self, coord: &[usize]) -> Result<(), StoreError> {
        if self.chunks.contains_block(coord) {
            Ok(())
        } else {
            Err(StoreError::OutOfBounds {
                coord: coord.to_vec(),
                grid: self.chunks.numblocks(),
            })
        }
    }

    fn check_block(&self, coord: &[usize], block: &Block) -> Result<(), StoreError> {
        self.check_coord(coord)?;
        let invalid = |source| StoreError::InvalidBlock {
            coord: coord.to_vec(),
            source,
        };
        if block.dtype() != self.dtype {
            return Err(invalid(BlockError::DtypeMismatch {
                expected: self.dtype,
                found: block.dtype(),
            }));
        }
        let expected = self.chunks.block_shape(coord);
        if block.shape() != expected.as_slice() {
            return Err(invalid(BlockError::Shape {
                expected,
                got: block.shape().to_vec(),
            }));
        }
        Ok(())
    }
}

/// Estimated footprint of one chunk, as reported by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizeEstimate {
    pub compressed: u64,
    pub uncompressed: u64,
}

impl ChunkSizeEstimate {
    /// Uncompressed and compressed sizes are equal (no codec).
    pub fn uncompressed(meta: &ArrayMeta) -> Self {
        let n = meta.chunk_nbytes();
        ChunkSizeEstimate {
            compressed: n,
            uncompressed: n,
        }
    }
}

// ── Store traits ────────────────────────────────────────────────────────────

/// Block-addressed array storage.
pub trait ChunkStore: Send + Sync + fmt::Debug {
    fn meta(&self) -> &ArrayMeta;

    fn read_block(&self, coord: &[usize]) -> Result<Block, StoreError>;

    /// Write (or idempotently overwrite) one block.
    fn write_block(&self, coord: &[usize], block: Block) -> Result<(), StoreError>;

    fn chunk_size_estimate(&self) -> ChunkSizeEstimate {
        ChunkSizeEstimate::uncompressed(self.meta())
    }

    /// Virtual stores compute their blocks and are never created by a plan.
    fn is_virtual(&self) -> bool {
        false
    }
}

/// Creates the physical store behind a lazy handle.
pub trait StoreFactory: Send + Sync + fmt::Debug {
    fn create(&self, name: &str, meta: &ArrayMeta) -> Result<Arc<dyn ChunkStore>, StoreError>;

    /// Size estimate for a store this factory would create.
    fn estimate(&self, meta: &ArrayMeta) -> ChunkSizeEstimate {
        ChunkSizeEstimate::uncompressed(meta)
    }
}

// ── In-memory store ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    meta: ArrayMeta,
    blocks: RwLock<HashMap<Vec<usize>, Block>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>, meta: ArrayMeta) -> Self {
        MemoryStore {
            name: name.into(),
            meta,
            blocks: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_written(&self) -> usize {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ChunkStore for MemoryStore {
    fn meta(&self) -> &ArrayMeta {
        &self.meta
    }

    fn read_block(&self, coord: &[usize]) -> Result<Block, StoreError> {
        self.meta.check_coord(coord)?;
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(coord)
            .cloned()
            .ok_or_else(|| StoreError::MissingBlock(coord.to_vec()))
    }

    fn write_block(&self, coord: &[usize], block: Block) -> Result<(), StoreError> {
        self.meta.check_block(coord, &block)?;
        self.blocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(coord.to_vec(), block);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStoreFactory;

impl StoreFactory for MemoryStoreFactory {
    fn create(&self, name: &str, meta: &ArrayMeta) -> Result<Arc<dyn ChunkStore>, StoreError> {
        Ok(Arc::new(MemoryStore::new(name, meta.clone())))
    }
}

// ── Directory store ─────────────────────────────────────────────────────────

/// Attribute holding the engine's own chunk structure.
const META_ATTR: &str = "chunkflow";

/// Root of the zarr hierarchy inside a store directory.
const ARRAY_PATH: &str = "/";

type ZarrArray = zarrs::array::Array<FilesystemStore>;

/// A zarr v3 array on the local filesystem, one zarr chunk per block.
///
/// Regular chunks map onto the zarr regular grid directly. Irregular or
/// empty chunks use a regular grid of the largest block along each
/// dimension, padded to a whole number of chunks; reads trim each chunk
/// back to its block shape.
/// The exact chunk structure travels in the array attributes.
pub struct FsStore {
    dir: PathBuf,
    meta: ArrayMeta,
    array: ZarrArray,
}

impl fmt::Debug for FsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsStore")
            .field("dir", &self.dir)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl FsStore {
    /// Create (or reinitialise the metadata of) a store at `dir`.
    pub fn create(dir: impl Into<PathBuf>, meta: ArrayMeta) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let storage = Arc::new(FilesystemStore::new(&dir)?);
        let (shape, chunk_shape) = zarr_grid(&meta.chunks);
        let mut array = ArrayBuilder::new(
            shape,
            chunk_shape,
            zarr_data_type(meta.dtype),
            zarr_fill(meta.dtype),
        )
        .build(storage, ARRAY_PATH)?;
        array
            .attributes_mut()
            .insert(META_ATTR.to_string(), serde_json::to_value(&meta)?);
        array.store_metadata()?;
        Ok(FsStore { dir, meta, array })
    }

    /// Open an existing store.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        let storage = Arc::new(FilesystemStore::new(&dir)?);
        let array = ZarrArray::open(storage, ARRAY_PATH)?;
        let value = array
            .attributes()
            .get(META_ATTR)
            .cloned()
            .ok_or_else(|| StoreError::ForeignArray(dir.clone()))?;
        let meta: ArrayMeta = serde_json::from_value(value)?;
        Ok(FsStore { dir, meta, array })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Shape of the zarr chunk stored for `coord`, padding included.
    fn stored_shape(&self, coord: &[u64]) -> Result<Vec<usize>, StoreError> {
        Ok(self.array.chunk_shape_usize(coord)?)
    }
}

/// Zarr array shape and chunk shape for a chunk structure.
fn zarr_grid(chunks: &Chunks) -> (Vec<u64>, Vec<u64>) {
    let chunk_shape: Vec<u64> = chunks
        .dims()
        .iter()
        .map(|d| d.iter().copied().max().unwrap_or(0).max(1) as u64)
        .collect();
    let extent = chunks.shape();
    let shape = if chunks.is_regular() && extent.iter().all(|&n| n > 0) {
        extent.into_iter().map(|n| n as u64).collect()
    } else {
        chunks
            .numblocks()
            .iter()
            .zip(&chunk_shape)
            .map(|(&n, &c)| n as u64 * c)
            .collect()
    };
    (shape, chunk_shape)
}

fn zarr_data_type(dtype: DType) -> zarrs::array::DataType {
    match dtype {
        DType::Bool => data_type::bool(),
        DType::Int32 => data_type::int32(),
        DType::Int64 => data_type::int64(),
        DType::Float32 => data_type::float32(),
        DType::Float64 => data_type::float64(),
    }
}

fn zarr_fill(dtype: DType) -> FillValue {
    match dtype {
        DType::Bool => FillValue::from(false),
        DType::Int32 => FillValue::from(0i32),
        DType::Int64 => FillValue::from(0i64),
        DType::Float32 => FillValue::from(0.0f32),
        DType::Float64 => FillValue::from(0.0f64),
    }
}

fn chunk_indices(coord: &[usize]) -> Vec<u64> {
    coord.iter().map(|&i| i as u64).collect()
}

fn full_region(shape: &[usize]) -> Vec<Range<usize>> {
    shape.iter().map(|&n| 0..n).collect()
}

fn store_elements<T: ZarrElement + Copy>(
    array: &ZarrArray,
    indices: &[u64],
    data: &ArrayD<T>,
) -> Result<(), StoreError> {
    let elements: Vec<T> = data.iter().copied().collect();
    array.store_chunk(indices, elements.as_slice())?;
    Ok(())
}

fn load_elements<T: Element + ElementOwned>(
    array: &ZarrArray,
    indices: &[u64],
    coord: &[usize],
    shape: &[usize],
) -> Result<Option<Block>, StoreError> {
    let Some(elements) = array.retrieve_chunk_if_exists::<Vec<T>>(indices)? else {
        return Ok(None);
    };
    Block::from_vec(shape, elements)
        .map(Some)
        .map_err(|source| StoreError::InvalidBlock {
            coord: coord.to_vec(),
            source,
        })
}

impl ChunkStore for FsStore {
    fn meta(&self) -> &ArrayMeta {
        &self.meta
    }

    fn read_block(&self, coord: &[usize]) -> Result<Block, StoreError> {
        self.meta.check_coord(coord)?;
        let indices = chunk_indices(coord);
        let stored = self.stored_shape(&indices)?;
        let chunk = match self.meta.dtype {
            DType::Bool => load_elements::<bool>(&self.array, &indices, coord, &stored)?,
            DType::Int32 => load_elements::<i32>(&self.array, &indices, coord, &stored)?,
            DType::Int64 => load_elements::<i64>(&self.array, &indices, coord, &stored)?,
            DType::Float32 => load_elements::<f32>(&self.array, &indices, coord, &stored)?,
            DType::Float64 => load_elements::<f64>(&self.array, &indices, coord, &stored)?,
        };
        let chunk = chunk.ok_or_else(|| StoreError::MissingBlock(coord.to_vec()))?;
        let shape = self.meta.chunks.block_shape(coord);
        if shape == stored {
            return Ok(chunk);
        }
        chunk
            .slice(&full_region(&shape))
            .map_err(|source| StoreError::InvalidBlock {
                coord: coord.to_vec(),
                source,
            })
    }

    fn write_block(&self, coord: &[usize], block: Block) -> Result<(), StoreError> {
        self.meta.check_block(coord, &block)?;
        let indices = chunk_indices(coord);
        let stored = self.stored_shape(&indices)?;
        let chunk = if block.shape() == stored.as_slice() {
            block
        } else {
            let mut padded = Block::zeros(self.meta.dtype, &stored);
            padded
                .assign(&full_region(block.shape()), &block)
                .map_err(|source| StoreError::InvalidBlock {
                    coord: coord.to_vec(),
                    source,
                })?;
            padded
        };
        match &chunk {
            Block::Bool(a) => store_elements(&self.array, &indices, a),
            Block::Int32(a) => store_elements(&self.array, &indices, a),
            Block::Int64(a) => store_elements(&self.array, &indices, a),
            Block::Float32(a) => store_elements(&self.array, &indices, a),
            Block::Float64(a) => store_elements(&self.array, &indices, a),
        }
    }

    /// Stored chunks are padded to the zarr chunk shape.
    fn chunk_size_estimate(&self) -> ChunkSizeEstimate {
        let origin = vec![0; self.meta.ndim()];
        match self.array.chunk_shape_usize(&origin) {
            Ok(shape) => {
                let n = (shape.iter().product::<usize>() * self.meta.dtype.itemsize()) as u64;
                ChunkSizeEstimate {
                    compressed: n,
                    uncompressed: n,
                }
            }
            Err(_) => ChunkSizeEstimate::uncompressed(&self.meta),
        }
    }
}

/// Creates `FsStore`s under a root directory, one subdirectory per array.
#[derive(Debug)]
pub struct FsStoreFactory {
    root: PathBuf,
}

impl FsStoreFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsStoreFactory { root: root.into() }
    }
}

impl StoreFactory for FsStoreFactory {
    fn create(&self, name: &str, meta: &ArrayMeta) -> Result<Arc<dyn ChunkStore>, StoreError> {
        Ok(Arc::new(FsStore::create(self.root.join(name), meta.clone())?))
    }
}

// ── Virtual stores ──────────────────────────────────────────────────────────

/// Read-only store whose every element is one fill value.
#[derive(Debug)]
pub struct FullStore {
    meta: ArrayMeta,
    value: Scalar,
}

impl FullStore {
    pub fn new(meta: ArrayMeta, value: Scalar) -> Self {
        FullStore { meta, value }
    }
}

impl ChunkStore for FullStore {
    fn meta(&self) -> &ArrayMeta {
        &self.meta
    }

    fn read_block(&self, coord: &[usize]) -> Result<Block, StoreError> {
        self.meta.check_coord(coord)?;
        Ok(Block::full(
            self.meta.dtype,
            &self.meta.chunks.block_shape(coord),
            self.value,
        ))
    }

    fn write_block(&self, _coord: &[usize], _block: Block) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly("full".to_string()))
    }

    fn is_virtual(&self) -> bool {
        true
    }
}

/// Read-only store serving blocks sliced out of one in-memory array.
#[derive(Debug)]
pub struct InMemoryArrayStore {
    meta: ArrayMeta,
    data: Block,
}

impl InMemoryArrayStore {
    /// `data` must have the shape described by `chunks`.
    pub fn new(data: Block, chunks: Chunks) -> Result<Self, BlockError> {
        let shape = chunks.shape();
        if data.shape() != shape.as_slice() {
            return Err(BlockError::Shape {
                expected: shape,
                got: data.shape().to_vec(),
            });
        }
        Ok(InMemoryArrayStore {
            meta: ArrayMeta::new(data.dtype(), chunks),
            data,
        })
    }
}

impl ChunkStore for InMemoryArrayStore {
    fn meta(&self) -> &ArrayMeta {
        &self.meta
    }

    fn read_block(&self, coord: &[usize]) -> Result<Block, StoreError> {
        self.meta.check_coord(coord)?;
        self.data
            .slice(&self.meta.chunks.block_region(coord))
            .map_err(|source| StoreError::InvalidBlock {
                coord: coord.to_vec(),
                source,
            })
    }

    fn write_block(&self, _coord: &[usize], _block: Block) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly("in-memory array".to_string()))
    }

    fn is_virtual(&self) -> bool {
        true
    }
}

// ── Store handles ───────────────────────────────────────────────────────────

#[derive(Debug)]
enum StoreSource {
    /// Backed by a store that already exists.
    Open,
    /// Created by the factory when the owning operation executes.
    Lazy(Arc<dyn StoreFactory>),
}

/// The store behind an array node: either already open, or created lazily.
#[derive(Debug)]
pub struct StoreHandle {
    name: String,
    meta: ArrayMeta,
    source: StoreSource,
    store: OnceLock<Arc<dyn ChunkStore>>,
}

impl StoreHandle {
    pub fn open(name: impl Into<String>, store: Arc<dyn ChunkStore>) -> Self {
        let cell = OnceLock::new();
        let meta = store.meta().clone();
        let _ = cell.set(store);
        StoreHandle {
            name: name.into(),
            meta,
            source: StoreSource::Open,
            store: cell,
        }
    }

    pub fn lazy(name: impl Into<String>, meta: ArrayMeta, factory: Arc<dyn StoreFactory>) -> Self {
        StoreHandle {
            name: name.into(),
            meta,
            source: StoreSource::Lazy(factory),
            store: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &ArrayMeta {
        &self.meta
    }

    /// True when the plan must create this store before writing to it.
    pub fn is_lazy(&self) -> bool {
        matches!(self.source, StoreSource::Lazy(_))
    }

    pub fn is_created(&self) -> bool {
        self.store.get().is_some()
    }

    pub fn chunk_size_estimate(&self) -> ChunkSizeEstimate {
        match (&self.source, self.store.get()) {
            (_, Some(store)) => store.chunk_size_estimate(),
            (StoreSource::Lazy(factory), None) => factory.estimate(&self.meta),
            (StoreSource::Open, None) => ChunkSizeEstimate::uncompressed(&self.meta),
        }
    }

    /// Materialise the store. Idempotent.
    pub fn create(&self) -> Result<(), StoreError> {
        if self.store.get().is_some() {
            return Ok(());
        }
        if let StoreSource::Lazy(factory) = &self.source {
            let created = factory.create(&self.name, &self.meta)?;
            let _ = self.store.set(created);
        }
        Ok(())
    }

    pub fn store(&self) -> Result<&dyn ChunkStore, StoreError> {
        self.store
            .get()
            .map(|s| s.as_ref())
            .ok_or_else(|| StoreError::NotCreated(self.name.clone()))
    }

    pub fn read_block(&self, coord: &[usize]) -> Result<Block, StoreError> {
        self.store()?.read_block(coord)
    }

    pub fn write_block(&self, coord: &[usize], block: Block) -> Result<(), StoreError> {
        self.store()?.write_block(coord, block)
    }

    /// Read every block and assemble the whole array.
    pub fn read_all(&self) -> Result<Block, StoreError> {
        let store = self.store()?;
        let chunks = &self.meta.chunks;
        let mut out = Block::zeros(self.meta.dtype, &self.meta.shape);
        for coord in chunks.grid() {
            let block = store.read_block(&coord)?;
            out.assign(&chunks.block_region(&coord), &block)
                .map_err(|source| StoreError::InvalidBlock { coord, source })?;
        }
        Ok(out)
    }
}
