//! Layered navigable small-world graph over quantized unit vectors.
//!
//! Nodes live in an arena and are addressed by generation-checked
//! [`NodeHandle`]s, so a handle held after its node was deleted resolves to
//! nothing instead of to whichever node reused the slot. Links are kept
//! bidirectional, which lets deletion find and repair every neighbor.
//!
//! Readers take the graph read lock. Insertion comes in two flavors: a
//! synchronous [`Hnsw::insert`] under the write lock, and a split
//! [`Hnsw::prepare_insert`] / [`Hnsw::try_commit`] pair where the expensive
//! candidate search runs under the read lock and the commit is refused if
//! the graph changed in between.

pub mod quant;
mod slots;

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use parking_lot::RwLock;
use rand::Rng;

pub use quant::{QuantMode, StoredVector};
pub use slots::ReadSlot;
use slots::ReadSlots;

pub const DEFAULT_M: usize = 16;
const MAX_LEVEL: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum HnswError {
    #[error("serialized vector has {got} bytes, expected {expected}")]
    VectorSize { got: usize, expected: usize },
    #[error("malformed node parameters")]
    BadParams,
    #[error("duplicate node uid {0}")]
    DuplicateUid(u64),
    #[error("link to unknown node uid {0}")]
    DanglingLink(u64),
}

#[derive(Clone, Debug)]
pub struct Neighbor<P> {
    pub handle: NodeHandle,
    pub distance: f32,
    pub payload: P,
}

/// Raw stored form of a node vector, as kept in memory.
#[derive(Clone, Debug, PartialEq)]
pub struct RawVector {
    pub quant: QuantMode,
    pub bytes: Vec<u8>,
    pub l2: f32,
    pub range: f32,
}

/// Everything needed to recreate a node: its stored vector bytes and a flat
/// list of parameters (uid, level, norm, range, then per-layer links).
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedNode {
    pub vector: Vec<u8>,
    pub params: Vec<u64>,
}

/// Result of the read-locked half of a two-phase insert.
pub struct InsertContext<P> {
    vector: StoredVector,
    l2: f32,
    level: usize,
    payload: P,
    candidates: Vec<Vec<Candidate>>,
    version: u64,
}

impl<P> InsertContext<P> {
    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    pub fn level(&self) -> usize {
        self.level
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Candidate {
    distance: f32,
    handle: NodeHandle,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.handle.cmp(&other.handle))
    }
}

struct Node<P> {
    uid: u64,
    payload: P,
    vector: StoredVector,
    l2: f32,
    /// `layers[l]` holds the links at layer `l`; the node's level is
    /// `layers.len() - 1`.
    layers: Vec<Vec<NodeHandle>>,
}

impl<P> Node<P> {
    fn level(&self) -> usize {
        self.layers.len().saturating_sub(1)
    }
}

struct Slot<P> {
    generation: u32,
    node: Option<Node<P>>,
}

struct Graph<P> {
    m: usize,
    slots: Vec<Slot<P>>,
    free: Vec<u32>,
    entry: Option<NodeHandle>,
    max_level: usize,
    len: usize,
    last_uid: u64,
    /// Bumped on every structural change; two-phase commits compare it.
    version: u64,
    /// Links read from a serialized node, resolved by `finalize_after_load`.
    pending: Vec<(NodeHandle, Vec<Vec<u64>>)>,
}

pub struct Hnsw<P> {
    dim: usize,
    quant: QuantMode,
    level_mult: f64,
    graph: RwLock<Graph<P>>,
    read_slots: ReadSlots,
}

impl<P: Clone> Hnsw<P> {
    pub fn new(dim: usize, quant: QuantMode) -> Self {
        let slots = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_params(dim, quant, DEFAULT_M, slots)
    }

    pub fn with_params(dim: usize, quant: QuantMode, m: usize, read_slots: usize) -> Self {
        let m = m.max(2);
        Self {
            dim,
            quant,
            level_mult: 1.0 / (m as f64).ln(),
            graph: RwLock::new(Graph {
                m,
                slots: Vec::new(),
                free: Vec::new(),
                entry: None,
                max_level: 0,
                len: 0,
                last_uid: 0,
                version: 0,
                pending: Vec::new(),
            }),
            read_slots: ReadSlots::new(read_slots),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn quant(&self) -> QuantMode {
        self.quant
    }

    pub fn m(&self) -> usize {
        self.graph.read().m
    }

    pub fn len(&self) -> usize {
        self.graph.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_level(&self) -> usize {
        self.graph.read().max_level
    }

    pub fn last_uid(&self) -> u64 {
        self.graph.read().last_uid
    }

    pub fn read_slot_count(&self) -> usize {
        self.read_slots.len()
    }

    pub fn acquire_read_slot(&self) -> ReadSlot<'_> {
        self.read_slots.acquire()
    }

    pub fn release_read_slot(&self, slot: ReadSlot<'_>) {
        drop(slot);
    }

    /// Inserts `vector` under the write lock and returns its handle.
    pub fn insert(&self, vector: &[f32], ef: usize, payload: P) -> NodeHandle {
        let (stored, l2) = self.prepare_vector(vector);
        let level = self.random_level();
        let mut slot = self.read_slots.acquire();
        let mut g = self.graph.write();
        let candidates = g.collect_candidates(&stored, level, ef, &mut slot.scratch().visited);
        g.link_new_node(stored, l2, level, payload, candidates)
    }

    /// Runs the candidate search for a future insert under the read lock.
    /// Nothing in the graph changes until [`Hnsw::try_commit`].
    pub fn prepare_insert(&self, vector: &[f32], ef: usize, payload: P) -> InsertContext<P> {
        let (stored, l2) = self.prepare_vector(vector);
        let level = self.random_level();
        let mut slot = self.read_slots.acquire();
        let g = self.graph.read();
        let candidates = g.collect_candidates(&stored, level, ef, &mut slot.scratch().visited);
        InsertContext {
            vector: stored,
            l2,
            level,
            payload,
            candidates,
            version: g.version,
        }
    }

    /// Links a prepared node if the graph has not changed since
    /// preparation. A stale context is handed back untouched.
    pub fn try_commit(&self, ctx: InsertContext<P>) -> Result<NodeHandle, InsertContext<P>> {
        let mut g = self.graph.write();
        if g.version != ctx.version {
            return Err(ctx);
        }
        let InsertContext {
            vector,
            l2,
            level,
            payload,
            candidates,
            ..
        } = ctx;
        Ok(g.link_new_node(vector, l2, level, payload, candidates))
    }

    /// Unlinks and frees a node, repairing its neighbors' links. The
    /// payload is handed to `release` once the node is gone.
    pub fn delete<F: FnOnce(P)>(&self, handle: NodeHandle, release: F) -> bool {
        let mut g = self.graph.write();
        let Some(node) = g.take_node(handle) else {
            return false;
        };
        for (layer, links) in node.layers.iter().enumerate() {
            for &n in links {
                if let Some(list) = g.node_mut(n).and_then(|nn| nn.layers.get_mut(layer)) {
                    list.retain(|&x| x != handle);
                }
            }
            g.repair(links, layer);
        }
        g.len -= 1;
        g.version += 1;
        if g.entry == Some(handle) {
            g.elect_entry();
        }
        drop(g);
        release(node.payload);
        true
    }

    /// Returns up to `ef` nearest nodes, closest first.
    pub fn search(&self, query: &[f32], ef: usize, slot: &mut ReadSlot<'_>) -> Vec<Neighbor<P>> {
        let (stored, _) = self.prepare_vector(query);
        let ef = ef.max(1);
        let g = self.graph.read();
        let visited = &mut slot.scratch().visited;
        let Some(entry) = g.entry else {
            return Vec::new();
        };
        let Some(entry_node) = g.node(entry) else {
            return Vec::new();
        };
        let mut eps = vec![Candidate {
            distance: quant::distance(&stored, &entry_node.vector),
            handle: entry,
        }];
        for layer in (1..=g.max_level).rev() {
            eps = g.search_layer(&stored, &eps, 1, layer, visited);
        }
        g.search_layer(&stored, &eps, ef, 0, visited)
            .into_iter()
            .filter_map(|c| {
                g.node(c.handle).map(|n| Neighbor {
                    handle: c.handle,
                    distance: c.distance,
                    payload: n.payload.clone(),
                })
            })
            .collect()
    }

    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.graph.read().node(handle).is_some()
    }

    pub fn payload(&self, handle: NodeHandle) -> Option<P> {
        self.graph.read().node(handle).map(|n| n.payload.clone())
    }

    /// Approximate input vector: the dequantized unit vector times the
    /// stored norm.
    pub fn get_vector(&self, handle: NodeHandle) -> Option<Vec<f32>> {
        let g = self.graph.read();
        let node = g.node(handle)?;
        let l2 = node.l2;
        Some(
            quant::dequantize(&node.vector)
                .into_iter()
                .map(|x| x * l2)
                .collect(),
        )
    }

    pub fn raw_vector(&self, handle: NodeHandle) -> Option<RawVector> {
        let g = self.graph.read();
        let node = g.node(handle)?;
        Some(RawVector {
            quant: self.quant,
            bytes: node.vector.to_bytes(),
            l2: node.l2,
            range: node.vector.range(),
        })
    }

    /// Neighbors of a node for every layer it lives on, index 0 being the
    /// bottom layer. Distances are measured from the node itself.
    pub fn links(&self, handle: NodeHandle) -> Option<Vec<Vec<Neighbor<P>>>> {
        let g = self.graph.read();
        let node = g.node(handle)?;
        Some(
            node.layers
                .iter()
                .map(|links| {
                    links
                        .iter()
                        .filter_map(|&n| {
                            g.node(n).map(|nn| Neighbor {
                                handle: n,
                                distance: quant::distance(&node.vector, &nn.vector),
                                payload: nn.payload.clone(),
                            })
                        })
                        .collect()
                })
                .collect(),
        )
    }

    /// Live handles in arena order.
    pub fn handles(&self) -> Vec<NodeHandle> {
        let g = self.graph.read();
        g.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.node.is_some())
            .map(|(i, s)| NodeHandle {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    pub fn serialize_node(&self, handle: NodeHandle) -> Option<SerializedNode> {
        let g = self.graph.read();
        let node = g.node(handle)?;
        let mut params = vec![
            node.uid,
            node.level() as u64,
            node.l2.to_bits() as u64,
            node.vector.range().to_bits() as u64,
        ];
        for links in &node.layers {
            let uids: Vec<u64> = links
                .iter()
                .filter_map(|&n| g.node(n).map(|nn| nn.uid))
                .collect();
            params.push(uids.len() as u64);
            params.extend(uids);
        }
        Some(SerializedNode {
            vector: node.vector.to_bytes(),
            params,
        })
    }

    /// Recreates a node from [`Hnsw::serialize_node`] output. Its links stay
    /// unresolved until [`Hnsw::finalize_after_load`] runs.
    pub fn insert_serialized(
        &self,
        vector: &[u8],
        params: &[u64],
        payload: P,
    ) -> Result<NodeHandle, HnswError> {
        let expected = self.quant.bytes_for(self.dim);
        if vector.len() != expected {
            return Err(HnswError::VectorSize {
                got: vector.len(),
                expected,
            });
        }
        let [uid, level, l2_bits, range_bits, rest @ ..] = params else {
            return Err(HnswError::BadParams);
        };
        let level = usize::try_from(*level).map_err(|_| HnswError::BadParams)?;
        if level > MAX_LEVEL {
            return Err(HnswError::BadParams);
        }
        let l2 = f32::from_bits(*l2_bits as u32);
        let range = f32::from_bits(*range_bits as u32);
        let stored = StoredVector::from_bytes(self.quant, self.dim, vector, range)
            .ok_or(HnswError::BadParams)?;

        let mut layers = Vec::with_capacity(level + 1);
        let mut rest = rest;
        for _ in 0..=level {
            let (count, tail) = rest.split_first().ok_or(HnswError::BadParams)?;
            let count = usize::try_from(*count).map_err(|_| HnswError::BadParams)?;
            if tail.len() < count {
                return Err(HnswError::BadParams);
            }
            layers.push(tail[..count].to_vec());
            rest = &tail[count..];
        }
        if !rest.is_empty() {
            return Err(HnswError::BadParams);
        }

        let mut g = self.graph.write();
        let handle = g.allocate(Node {
            uid: *uid,
            payload,
            vector: stored,
            l2,
            layers: vec![Vec::new(); level + 1],
        });
        g.pending.push((handle, layers));
        g.len += 1;
        g.last_uid = g.last_uid.max(*uid);
        Ok(handle)
    }

    /// Resolves links recorded by [`Hnsw::insert_serialized`] and picks the
    /// entry point.
    pub fn finalize_after_load(&self) -> Result<(), HnswError> {
        let mut g = self.graph.write();
        let mut by_uid = HashMap::with_capacity(g.len);
        for (i, slot) in g.slots.iter().enumerate() {
            if let Some(node) = &slot.node {
                let handle = NodeHandle {
                    index: i as u32,
                    generation: slot.generation,
                };
                if by_uid.insert(node.uid, handle).is_some() {
                    return Err(HnswError::DuplicateUid(node.uid));
                }
            }
        }
        let pending = std::mem::take(&mut g.pending);
        for (handle, layers) in pending {
            let resolved = layers
                .into_iter()
                .map(|uids| {
                    uids.into_iter()
                        .map(|uid| by_uid.get(&uid).copied().ok_or(HnswError::DanglingLink(uid)))
                        .collect::<Result<Vec<_>, _>>()
                })
                .collect::<Result<Vec<_>, _>>()?;
            if let Some(node) = g.node_mut(handle) {
                node.layers = resolved;
            }
        }
        g.elect_entry();
        g.version += 1;
        Ok(())
    }

    /// Heap bytes held by nodes and their links.
    pub fn storage_bytes(&self) -> usize {
        let g = self.graph.read();
        let mut total = g.slots.capacity() * std::mem::size_of::<Slot<P>>()
            + g.free.capacity() * std::mem::size_of::<u32>();
        for node in g.slots.iter().filter_map(|s| s.node.as_ref()) {
            total += node.vector.heap_bytes();
            total += node.layers.capacity() * std::mem::size_of::<Vec<NodeHandle>>();
            total += node
                .layers
                .iter()
                .map(|l| l.capacity() * std::mem::size_of::<NodeHandle>())
                .sum::<usize>();
        }
        total
    }

    fn prepare_vector(&self, vector: &[f32]) -> (StoredVector, f32) {
        let (unit, l2) = quant::normalize(vector);
        (quant::quantize(self.quant, &unit), l2)
    }

    fn random_level(&self) -> usize {
        let r: f64 = rand::thread_rng().gen_range(f64::MIN_POSITIVE..1.0);
        ((-r.ln() * self.level_mult).floor() as usize).min(MAX_LEVEL)
    }
}

impl<P> Graph<P> {
    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m * 2
        } else {
            self.m
        }
    }

    fn node(&self, handle: NodeHandle) -> Option<&Node<P>> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.node.as_ref())
    }

    fn node_mut(&mut self, handle: NodeHandle) -> Option<&mut Node<P>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.node.as_mut())
    }

    fn link_count(&self, handle: NodeHandle, layer: usize) -> usize {
        self.node(handle)
            .and_then(|n| n.layers.get(layer))
            .map_or(0, |l| l.len())
    }

    fn allocate(&mut self, node: Node<P>) -> NodeHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return NodeHandle {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        NodeHandle {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    fn take_node(&mut self, handle: NodeHandle) -> Option<Node<P>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(node)
    }

    fn search_layer(
        &self,
        query: &StoredVector,
        entry: &[Candidate],
        ef: usize,
        layer: usize,
        visited: &mut HashSet<NodeHandle>,
    ) -> Vec<Candidate> {
        visited.clear();
        let mut frontier = BinaryHeap::new();
        let mut best: BinaryHeap<Candidate> = BinaryHeap::new();
        for &c in entry {
            if visited.insert(c.handle) {
                frontier.push(Reverse(c));
                best.push(c);
            }
        }
        while best.len() > ef {
            best.pop();
        }

        while let Some(Reverse(current)) = frontier.pop() {
            if best.len() >= ef && best.peek().is_some_and(|w| current.distance > w.distance) {
                break;
            }
            let Some(links) = self.node(current.handle).and_then(|n| n.layers.get(layer)) else {
                continue;
            };
            for &n in links {
                if !visited.insert(n) {
                    continue;
                }
                let Some(nn) = self.node(n) else {
                    continue;
                };
                let d = quant::distance(query, &nn.vector);
                if best.len() >= ef && best.peek().is_some_and(|w| d >= w.distance) {
                    continue;
                }
                let c = Candidate {
                    distance: d,
                    handle: n,
                };
                frontier.push(Reverse(c));
                best.push(c);
                if best.len() > ef {
                    best.pop();
                }
            }
        }
        best.into_sorted_vec()
    }

    fn collect_candidates(
        &self,
        query: &StoredVector,
        level: usize,
        ef: usize,
        visited: &mut HashSet<NodeHandle>,
    ) -> Vec<Vec<Candidate>> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        let Some(entry_node) = self.node(entry) else {
            return Vec::new();
        };
        let mut eps = vec![Candidate {
            distance: quant::distance(query, &entry_node.vector),
            handle: entry,
        }];
        let top = self.max_level;
        for layer in (level + 1..=top).rev() {
            eps = self.search_layer(query, &eps, 1, layer, visited);
        }
        let reach = level.min(top);
        let mut per_layer = vec![Vec::new(); reach + 1];
        for layer in (0..=reach).rev() {
            let found = self.search_layer(query, &eps, ef.max(1), layer, visited);
            per_layer[layer] = found.clone();
            eps = found;
        }
        per_layer
    }

    /// Picks up to `m` neighbors from `candidates` (closest first), favoring
    /// ones not already covered by a closer pick, then topping up with the
    /// rest.
    fn select_neighbors(&self, candidates: &[Candidate], m: usize) -> Vec<Candidate> {
        let mut selected: Vec<Candidate> = Vec::with_capacity(m);
        let mut pruned = Vec::new();
        for &c in candidates {
            if selected.len() >= m {
                break;
            }
            let Some(cn) = self.node(c.handle) else {
                continue;
            };
            let diverse = selected.iter().all(|s| {
                self.node(s.handle)
                    .map_or(true, |sn| quant::distance(&cn.vector, &sn.vector) > c.distance)
            });
            if diverse {
                selected.push(c);
            } else {
                pruned.push(c);
            }
        }
        for c in pruned {
            if selected.len() >= m {
                break;
            }
            selected.push(c);
        }
        selected
    }

    fn link_new_node(
        &mut self,
        vector: StoredVector,
        l2: f32,
        level: usize,
        payload: P,
        candidates: Vec<Vec<Candidate>>,
    ) -> NodeHandle {
        self.last_uid += 1;
        let handle = self.allocate(Node {
            uid: self.last_uid,
            payload,
            vector,
            l2,
            layers: vec![Vec::new(); level + 1],
        });
        for (layer, found) in candidates.into_iter().enumerate().take(level + 1) {
            let found: Vec<Candidate> = found
                .into_iter()
                .filter(|c| {
                    c.handle != handle && self.node(c.handle).is_some_and(|n| n.layers.len() > layer)
                })
                .collect();
            let chosen = self.select_neighbors(&found, self.max_links(layer));
            for c in chosen {
                self.connect(handle, c.handle, layer);
            }
        }
        if self.entry.is_none() || level > self.max_level {
            self.entry = Some(handle);
            self.max_level = level;
        }
        self.len += 1;
        self.version += 1;
        handle
    }

    fn add_link(&mut self, from: NodeHandle, to: NodeHandle, layer: usize) {
        if let Some(list) = self.node_mut(from).and_then(|n| n.layers.get_mut(layer)) {
            if !list.contains(&to) {
                list.push(to);
            }
        }
    }

    fn remove_link(&mut self, from: NodeHandle, to: NodeHandle, layer: usize) {
        if let Some(list) = self.node_mut(from).and_then(|n| n.layers.get_mut(layer)) {
            list.retain(|&x| x != to);
        }
    }

    fn connect(&mut self, a: NodeHandle, b: NodeHandle, layer: usize) {
        self.add_link(a, b, layer);
        self.add_link(b, a, layer);
        let cap = self.max_links(layer);
        for h in [a, b] {
            if self.link_count(h, layer) > cap {
                self.shrink(h, layer);
            }
        }
    }

    /// Trims a node's links at `layer` back to capacity. Dropped neighbors
    /// lose their back link too.
    fn shrink(&mut self, handle: NodeHandle, layer: usize) {
        let cap = self.max_links(layer);
        let Some(node) = self.node(handle) else {
            return;
        };
        let Some(links) = node.layers.get(layer) else {
            return;
        };
        let mut scored: Vec<Candidate> = links
            .iter()
            .filter_map(|&n| {
                self.node(n).map(|nn| Candidate {
                    distance: quant::distance(&node.vector, &nn.vector),
                    handle: n,
                })
            })
            .collect();
        scored.sort();
        let keep: Vec<NodeHandle> = self
            .select_neighbors(&scored, cap)
            .into_iter()
            .map(|c| c.handle)
            .collect();
        let dropped: Vec<NodeHandle> = links
            .iter()
            .copied()
            .filter(|n| !keep.contains(n))
            .collect();
        for n in dropped {
            self.remove_link(n, handle, layer);
        }
        if let Some(list) = self.node_mut(handle).and_then(|n| n.layers.get_mut(layer)) {
            *list = keep;
        }
    }

    /// Reconnects the former neighbors of a deleted node among themselves,
    /// closest pairs first, without exceeding link capacity.
    fn repair(&mut self, orphans: &[NodeHandle], layer: usize) {
        let cap = self.max_links(layer);
        for &a in orphans {
            let scored = {
                let Some(an) = self.node(a) else {
                    continue;
                };
                let Some(own) = an.layers.get(layer) else {
                    continue;
                };
                if own.len() >= cap {
                    continue;
                }
                let mut scored: Vec<Candidate> = orphans
                    .iter()
                    .filter(|&&b| b != a && !own.contains(&b))
                    .filter_map(|&b| {
                        let bn = self.node(b)?;
                        if bn.layers.len() <= layer {
                            return None;
                        }
                        Some(Candidate {
                            distance: quant::distance(&an.vector, &bn.vector),
                            handle: b,
                        })
                    })
                    .collect();
                scored.sort();
                scored
            };
            for c in scored {
                if self.link_count(a, layer) >= cap {
                    break;
                }
                if self.link_count(c.handle, layer) >= cap {
                    continue;
                }
                self.add_link(a, c.handle, layer);
                self.add_link(c.handle, a, layer);
            }
        }
    }

    /// Makes the highest-level live node the entry point.
    fn elect_entry(&mut self) {
        let mut best: Option<(usize, NodeHandle)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(node) = &slot.node {
                let level = node.level();
                if best.map_or(true, |(l, _)| level > l) {
                    best = Some((
                        level,
                        NodeHandle {
                            index: i as u32,
                            generation: slot.generation,
                        },
                    ));
                }
            }
        }
        match best {
            Some((level, handle)) => {
                self.entry = Some(handle);
                self.max_level = level;
            }
            None => {
                self.entry = None;
                self.max_level = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect()
    }

    fn build(quant: QuantMode, vectors: &[Vec<f32>]) -> (Hnsw<u32>, Vec<NodeHandle>) {
        let index = Hnsw::with_params(vectors[0].len(), quant, 8, 2);
        let handles = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| index.insert(v, 64, i as u32))
            .collect();
        (index, handles)
    }

    fn assert_links_symmetric(index: &Hnsw<u32>) {
        for h in index.handles() {
            let layers = index.links(h).unwrap();
            for (layer, links) in layers.iter().enumerate() {
                for n in links {
                    let back = index.links(n.handle).unwrap();
                    assert!(
                        back[layer].iter().any(|x| x.handle == h),
                        "missing back link at layer {layer}"
                    );
                }
            }
        }
    }

    #[test]
    fn exact_vector_is_its_own_nearest_neighbor() {
        let vectors = random_vectors(200, 16, 1);
        for quant in [QuantMode::F32, QuantMode::Q8] {
            let (index, _) = build(quant, &vectors);
            let mut slot = index.acquire_read_slot();
            for (i, v) in vectors.iter().enumerate().step_by(17) {
                let hits = index.search(v, 50, &mut slot);
                assert_eq!(hits[0].payload, i as u32, "quant={quant:?}");
                assert!(hits[0].distance < 0.01);
            }
        }
    }

    #[test]
    fn results_are_sorted_and_bounded_by_ef() {
        let vectors = random_vectors(100, 8, 2);
        let (index, _) = build(QuantMode::F32, &vectors);
        let mut slot = index.acquire_read_slot();
        let hits = index.search(&vectors[3], 10, &mut slot);
        assert!(hits.len() <= 10);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn empty_graph_returns_nothing() {
        let index: Hnsw<u32> = Hnsw::new(4, QuantMode::Q8);
        let mut slot = index.acquire_read_slot();
        assert!(index.search(&[1.0, 0.0, 0.0, 0.0], 10, &mut slot).is_empty());
        assert_eq!(index.max_level(), 0);
    }

    #[test]
    fn delete_unlinks_node_and_keeps_links_symmetric() {
        let vectors = random_vectors(120, 8, 3);
        let (index, handles) = build(QuantMode::F32, &vectors);
        assert_links_symmetric(&index);

        let mut released = Vec::new();
        for h in handles.iter().step_by(3) {
            assert!(index.delete(*h, |p| released.push(p)));
        }
        assert_eq!(released.len(), 40);
        assert_eq!(index.len(), 80);
        assert!(!index.delete(handles[0], |_| {}));
        assert!(index.get_vector(handles[0]).is_none());
        assert_links_symmetric(&index);

        let mut slot = index.acquire_read_slot();
        let hits = index.search(&vectors[1], 20, &mut slot);
        assert_eq!(hits[0].payload, 1);
        assert!(hits.iter().all(|n| n.payload % 3 != 0));
    }

    #[test]
    fn deleting_every_node_resets_entry() {
        let vectors = random_vectors(10, 4, 4);
        let (index, handles) = build(QuantMode::Q8, &vectors);
        for h in handles {
            index.delete(h, |_| {});
        }
        assert!(index.is_empty());
        let mut slot = index.acquire_read_slot();
        assert!(index.search(&vectors[0], 5, &mut slot).is_empty());
        let h = index.insert(&vectors[0], 16, 99);
        assert_eq!(index.payload(h), Some(99));
    }

    #[test]
    fn stale_handle_does_not_alias_reused_slot() {
        let index: Hnsw<u32> = Hnsw::with_params(2, QuantMode::F32, 4, 1);
        let a = index.insert(&[1.0, 0.0], 8, 1);
        index.delete(a, |_| {});
        let b = index.insert(&[0.0, 1.0], 8, 2);
        assert_ne!(a, b);
        assert_eq!(index.payload(a), None);
        assert_eq!(index.payload(b), Some(2));
    }

    #[test]
    fn two_phase_commit_succeeds_without_interference() {
        let vectors = random_vectors(50, 8, 5);
        let (index, _) = build(QuantMode::Q8, &vectors);
        let probe = vec![0.5; 8];
        let ctx = index.prepare_insert(&probe, 64, 1000);
        let handle = index.try_commit(ctx).ok().unwrap();
        assert_eq!(index.len(), 51);
        let mut slot = index.acquire_read_slot();
        let hits = index.search(&probe, 10, &mut slot);
        assert_eq!(hits[0].handle, handle);
    }

    #[test]
    fn two_phase_commit_is_refused_after_a_write() {
        let vectors = random_vectors(30, 8, 6);
        let (index, _) = build(QuantMode::F32, &vectors);
        let ctx = index.prepare_insert(&vectors[0], 64, 500);
        index.insert(&vectors[1], 64, 501);
        let stale = match index.try_commit(ctx) {
            Ok(_) => panic!("commit should have been refused"),
            Err(ctx) => ctx,
        };
        assert_eq!(index.len(), 31);
        assert_eq!(stale.into_payload(), 500);
    }

    #[test]
    fn serialized_nodes_reload_with_identical_links() {
        let vectors = random_vectors(60, 6, 7);
        let (index, handles) = build(QuantMode::Q8, &vectors);
        let saved: Vec<(u32, SerializedNode)> = handles
            .iter()
            .map(|&h| (index.payload(h).unwrap(), index.serialize_node(h).unwrap()))
            .collect();

        let restored: Hnsw<u32> = Hnsw::with_params(6, QuantMode::Q8, 8, 2);
        let mut by_payload = HashMap::new();
        for (payload, node) in &saved {
            let h = restored
                .insert_serialized(&node.vector, &node.params, *payload)
                .unwrap();
            by_payload.insert(*payload, h);
        }
        restored.finalize_after_load().unwrap();
        assert_eq!(restored.max_level(), index.max_level());
        assert_eq!(restored.last_uid(), index.last_uid());

        for (i, &h) in handles.iter().enumerate() {
            let original: Vec<Vec<u32>> = index
                .links(h)
                .unwrap()
                .into_iter()
                .map(|l| l.into_iter().map(|n| n.payload).collect())
                .collect();
            let reloaded: Vec<Vec<u32>> = restored
                .links(by_payload[&(i as u32)])
                .unwrap()
                .into_iter()
                .map(|l| l.into_iter().map(|n| n.payload).collect())
                .collect();
            assert_eq!(original, reloaded);
            assert_eq!(
                index.raw_vector(h),
                restored.raw_vector(by_payload[&(i as u32)])
            );
        }
    }

    #[test]
    fn dangling_link_fails_finalize() {
        let index: Hnsw<u32> = Hnsw::with_params(2, QuantMode::F32, 4, 1);
        let bytes = StoredVector::F32(vec![1.0, 0.0]).to_bytes();
        let params = [1, 0, 1.0f32.to_bits() as u64, 0, 1, 42];
        index.insert_serialized(&bytes, &params, 1).unwrap();
        assert_eq!(index.finalize_after_load(), Err(HnswError::DanglingLink(42)));
    }

    #[test]
    fn malformed_params_are_rejected() {
        let index: Hnsw<u32> = Hnsw::with_params(2, QuantMode::F32, 4, 1);
        let bytes = StoredVector::F32(vec![1.0, 0.0]).to_bytes();
        assert_eq!(
            index.insert_serialized(&bytes, &[1, 0, 0], 1),
            Err(HnswError::BadParams)
        );
        assert_eq!(
            index.insert_serialized(&bytes[..4], &[1, 0, 0, 0, 0], 1),
            Err(HnswError::VectorSize {
                got: 4,
                expected: 8
            })
        );
    }

    #[test]
    fn get_vector_restores_norm() {
        let index: Hnsw<u32> = Hnsw::with_params(3, QuantMode::F32, 4, 1);
        let h = index.insert(&[3.0, 0.0, 4.0], 8, 0);
        let v = index.get_vector(h).unwrap();
        assert!((v[0] - 3.0).abs() < 1e-5 && (v[2] - 4.0).abs() < 1e-5);
        assert_eq!(index.raw_vector(h).unwrap().l2, 5.0);
    }
}
