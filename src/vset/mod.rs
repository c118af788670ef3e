pub mod lifetime;
pub mod persist;
pub mod projection;
pub mod vector_spec;

pub use lifetime::{BackgroundLease, LifetimeLock};
pub use projection::Projection;

use crate::config::Config;
use crate::hnsw::{
    Hnsw, HnswError, InsertContext, Neighbor, NodeHandle, QuantMode, RawVector, DEFAULT_M,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Element identifier as stored in the graph and the map.
pub type Label = Arc<[u8]>;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum VsetError {
    #[error("ERR invalid vector specification")]
    InvalidVectorSpec,
    #[error("ERR Vector dimension mismatch - got {got} but set has {expected}")]
    DimensionMismatch { got: usize, expected: usize },
    #[error("ERR vector dimension exceeds the maximum of {0}")]
    DimensionTooLarge(usize),
    #[error("ERR use the same quantization of the existing vector set")]
    QuantMismatch,
    #[error("ERR cannot add projection to existing set without projection")]
    ProjectionMissing,
    #[error("ERR projection dimension mismatch with existing set")]
    ProjectionMismatch,
    #[error("ERR invalid EF")]
    InvalidEf,
    #[error("ERR invalid COUNT")]
    InvalidCount,
    #[error("ERR invalid EPSILON")]
    InvalidEpsilon,
    #[error("ERR invalid option after element")]
    InvalidAddOption,
    #[error("ERR invalid option")]
    InvalidOption,
    #[error("ERR syntax error in {0} command")]
    Syntax(&'static str),
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("ERR key does not exist")]
    NoSuchKey,
    #[error("ERR element not found in set")]
    ElementNotFound,
    #[error("ERR Can't start thread")]
    ThreadStart,
    #[error("ERR vector set is being destroyed")]
    Destroying,
    #[error("corrupt vector set encoding: {0}")]
    Corrupt(String),
    #[error("unsupported vector set encoding version {0}")]
    UnsupportedVersion(u32),
}

impl From<HnswError> for VsetError {
    fn from(err: HnswError) -> Self {
        VsetError::Corrupt(err.to_string())
    }
}

/// Hands out the per-set identity tags used to recognize a set that was
/// deleted and recreated under the same key.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    next: AtomicU64,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_identity(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

const DEFAULT_MAX_DIM: usize = 32_768;

/// Graph parameters that are not part of the persisted form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexParams {
    pub m: usize,
    pub read_slots: usize,
    /// Largest dimension accepted when loading a set.
    pub max_dim: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            m: DEFAULT_M,
            read_slots: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_dim: DEFAULT_MAX_DIM,
        }
    }
}

impl IndexParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            m: config.hnsw_m,
            read_slots: config.read_slots,
            max_dim: config.max_vector_dim,
        }
    }
}

/// Identifier → node handle. Handles are non-owning; the graph owns nodes.
#[derive(Debug, Default)]
pub struct IdentifierMap {
    entries: HashMap<Label, NodeHandle>,
}

impl IdentifierMap {
    pub fn get(&self, label: &[u8]) -> Option<NodeHandle> {
        self.entries.get(label).copied()
    }

    pub fn contains(&self, label: &[u8]) -> bool {
        self.entries.contains_key(label)
    }

    pub fn insert(&mut self, label: Label, handle: NodeHandle) -> Option<NodeHandle> {
        self.entries.insert(label, handle)
    }

    pub fn remove(&mut self, label: &[u8]) -> Option<(Label, NodeHandle)> {
        self.entries.remove_entry(label)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Label, &NodeHandle)> {
        self.entries.iter()
    }

    fn heap_bytes(&self) -> usize {
        let table = self.entries.capacity()
            * (std::mem::size_of::<Label>() + std::mem::size_of::<NodeHandle>() + 8);
        table + self.entries.keys().map(|k| k.len() + 16).sum::<usize>()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The element existed; its vector was replaced when updating was
    /// requested and left alone otherwise.
    Updated,
}

/// Which path a prepared insert took at commit time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitPath {
    Optimistic,
    Fallback,
}

/// One vector set value: the graph, the identifier map kept in lockstep
/// with it, an optional input projection and the lifetime lock guarding it
/// against destruction while background work is in flight.
pub struct VectorSet {
    index: Hnsw<Label>,
    map: Mutex<IdentifierMap>,
    projection: Option<Projection>,
    lifetime: LifetimeLock,
    identity: u64,
}

impl std::fmt::Debug for VectorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorSet")
            .field("dim", &self.dim())
            .field("quant", &self.quant())
            .field("len", &self.len())
            .field("identity", &self.identity)
            .finish()
    }
}

impl VectorSet {
    pub fn new(dim: usize, quant: QuantMode, registry: &IdentityRegistry) -> Self {
        Self::with_params(dim, quant, None, IndexParams::default(), registry)
    }

    /// `dim` is the stored dimension; with a projection it must equal the
    /// projection's output dimension.
    pub fn with_params(
        dim: usize,
        quant: QuantMode,
        projection: Option<Projection>,
        params: IndexParams,
        registry: &IdentityRegistry,
    ) -> Self {
        Self {
            index: Hnsw::with_params(dim, quant, params.m, params.read_slots),
            map: Mutex::new(IdentifierMap::default()),
            projection,
            lifetime: LifetimeLock::new(),
            identity: registry.next_identity(),
        }
    }

    pub fn identity(&self) -> u64 {
        self.identity
    }

    pub fn dim(&self) -> usize {
        self.index.dim()
    }

    pub fn quant(&self) -> QuantMode {
        self.index.quant()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn projection(&self) -> Option<&Projection> {
        self.projection.as_ref()
    }

    pub fn index(&self) -> &Hnsw<Label> {
        &self.index
    }

    pub fn contains(&self, label: &[u8]) -> bool {
        self.map.lock().contains(label)
    }

    /// Dimension a caller must supply: the projection input if any, the
    /// stored dimension otherwise.
    pub fn input_dim(&self) -> usize {
        self.projection
            .as_ref()
            .map_or(self.dim(), |p| p.input_dim())
    }

    /// Maps a raw input vector into the stored space. Vectors already in the
    /// stored space pass through.
    pub fn project(&self, vector: Vec<f32>) -> Vec<f32> {
        match &self.projection {
            Some(p) if vector.len() == p.input_dim() && vector.len() != self.dim() => {
                p.apply(&vector)
            }
            _ => vector,
        }
    }

    /// Adds `label` or, when it exists and `update` is set, replaces its
    /// vector. `vector` must already be in the stored space.
    pub fn insert(&self, label: &[u8], vector: &[f32], update: bool, ef: usize) -> InsertOutcome {
        let mut map = self.map.lock();
        match map.get(label) {
            Some(handle) => {
                if update {
                    let mut reclaimed = None;
                    self.index.delete(handle, |payload| reclaimed = Some(payload));
                    let payload = reclaimed.unwrap_or_else(|| Label::from(label));
                    let fresh = self.index.insert(vector, ef, payload.clone());
                    map.insert(payload, fresh);
                }
                InsertOutcome::Updated
            }
            None => {
                let payload = Label::from(label);
                let handle = self.index.insert(vector, ef, payload.clone());
                map.insert(payload, handle);
                InsertOutcome::Inserted
            }
        }
    }

    pub fn remove(&self, label: &[u8]) -> bool {
        let mut map = self.map.lock();
        let Some((_, handle)) = map.remove(label) else {
            return false;
        };
        self.index.delete(handle, drop);
        true
    }

    /// Read-locked half of a background insert; safe to call off the
    /// controlling thread while holding a [`BackgroundLease`].
    pub fn prepare_insert(&self, label: Label, vector: &[f32], ef: usize) -> InsertContext<Label> {
        self.index.prepare_insert(vector, ef, label)
    }

    /// Links a prepared element, falling back to a full insert when the
    /// graph changed since preparation. The caller checks the label is not
    /// already present.
    pub fn commit_prepared(
        &self,
        ctx: InsertContext<Label>,
        vector: &[f32],
        ef: usize,
    ) -> CommitPath {
        let mut map = self.map.lock();
        let label = ctx.payload().clone();
        let (handle, path) = match self.index.try_commit(ctx) {
            Ok(handle) => (handle, CommitPath::Optimistic),
            Err(stale) => (
                self.index.insert(vector, ef, stale.into_payload()),
                CommitPath::Fallback,
            ),
        };
        map.insert(label, handle);
        path
    }

    pub fn search(&self, query: &[f32], ef: usize) -> Vec<Neighbor<Label>> {
        let mut slot = self.index.acquire_read_slot();
        self.index.search(query, ef, &mut slot)
    }

    pub fn embedding(&self, label: &[u8]) -> Option<Vec<f32>> {
        let handle = self.map.lock().get(label)?;
        self.index.get_vector(handle)
    }

    pub fn raw_embedding(&self, label: &[u8]) -> Option<RawVector> {
        let handle = self.map.lock().get(label)?;
        self.index.raw_vector(handle)
    }

    pub fn links(&self, label: &[u8]) -> Option<Vec<Vec<Neighbor<Label>>>> {
        let handle = self.map.lock().get(label)?;
        self.index.links(handle)
    }

    /// Registers background work against this set. `None` once destruction
    /// has started.
    pub fn lease(self: &Arc<Self>) -> Option<BackgroundLease> {
        BackgroundLease::acquire(self)
    }

    pub fn in_flight(&self) -> usize {
        self.lifetime.readers()
    }

    /// Blocks new background work and waits for running work to finish.
    /// Called right before the set is dropped.
    pub fn drain(&self) {
        self.lifetime.acquire_exclusive();
    }

    pub(crate) fn lifetime(&self) -> &LifetimeLock {
        &self.lifetime
    }

    pub(crate) fn with_map<R>(&self, f: impl FnOnce(&IdentifierMap) -> R) -> R {
        f(&self.map.lock())
    }

    pub(crate) fn insert_loaded(&self, label: Label, handle: NodeHandle) -> bool {
        self.map.lock().insert(label, handle).is_none()
    }

    /// Rough heap footprint in bytes.
    pub fn mem_usage(&self) -> usize {
        let projection = self
            .projection
            .as_ref()
            .map_or(0, |p| p.matrix().len() * std::mem::size_of::<f32>());
        std::mem::size_of::<Self>()
            + self.index.storage_bytes()
            + self.map.lock().heap_bytes()
            + projection
    }

    /// Order-independent fingerprint of the dimension, the cardinality and
    /// every stored (vector, label) pair, as lowercase hex.
    pub fn digest(&self) -> String {
        let map = self.map.lock();
        let mut acc = [0u8; 32];
        for (label, &handle) in map.iter() {
            let Some(raw) = self.index.raw_vector(handle) else {
                continue;
            };
            let mut h = Sha256::new();
            h.update(&raw.bytes);
            h.update(raw.l2.to_le_bytes());
            h.update(label);
            for (a, b) in acc.iter_mut().zip(h.finalize()) {
                *a ^= b;
            }
        }
        let mut h = Sha256::new();
        h.update((self.dim() as u64).to_le_bytes());
        h.update((map.len() as u64).to_le_bytes());
        h.update(acc);
        h.finalize().iter().map(|b| format!("{b:02x}")).collect()
    }
}
