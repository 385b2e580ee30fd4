//! Spatial index over element bounding boxes.
//!
//! [`SpatialIndex`] maps element ids to dense slots and delegates the spatial
//! work to a [`SpatialBackend`]: an R-tree when the `rtree` feature is built,
//! otherwise a linear scan. Both answer the same queries; only speed differs.

mod backend;
mod linear;
#[cfg(feature = "rtree")]
mod rtree;

pub use backend::SpatialBackend;
pub use linear::LinearScan;
#[cfg(feature = "rtree")]
pub use rtree::RTree;

use crate::element::{ElementBounds, ElementId, ElementRecord, expand_rect, rect_contains};
use crate::error::IndexError;
use kurbo::{Point, Rect};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Number of recent query latencies averaged for diagnostics.
const LATENCY_WINDOW: usize = 128;

/// Which spatial structure backs an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Balanced bounding-box tree.
    #[default]
    Tree,
    /// Linear scan over every stored box.
    Linear,
}

/// Construct the requested backend, or explain why it cannot be built.
pub fn create_backend(kind: BackendKind) -> Result<Box<dyn SpatialBackend>, IndexError> {
    match kind {
        BackendKind::Linear => Ok(Box::new(LinearScan::default())),
        #[cfg(feature = "rtree")]
        BackendKind::Tree => Ok(Box::new(RTree::default())),
        #[cfg(not(feature = "rtree"))]
        BackendKind::Tree => Err(IndexError::BackendUnavailable(
            "built without the `rtree` feature",
        )),
    }
}

/// Build `kind`, downgrading to a linear scan if it is unavailable.
fn backend_or_fallback(kind: BackendKind) -> Box<dyn SpatialBackend> {
    create_backend(kind).unwrap_or_else(|err| {
        log::warn!("{}; falling back to linear-scan spatial index", err);
        Box::new(LinearScan::default())
    })
}

/// Query counters shared by the index and the hit-test optimizer.
///
/// Counters are atomic so that a snapshot behind an `Arc` can be queried from
/// any thread.
#[derive(Debug, Default)]
pub(crate) struct QueryStats {
    queries: AtomicU64,
    hits: AtomicU64,
    latencies_ms: Mutex<VecDeque<f64>>,
}

impl QueryStats {
    pub(crate) fn record(&self, started: Instant, hit: bool) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.queries.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        let mut window = self
            .latencies_ms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(elapsed_ms);
    }

    pub(crate) fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub(crate) fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub(crate) fn hit_ratio(&self) -> f64 {
        ratio(self.hit_count(), self.query_count())
    }

    pub(crate) fn avg_query_time_ms(&self) -> f64 {
        let window = self
            .latencies_ms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if window.is_empty() {
            0.0
        } else {
            window.iter().sum::<f64>() / window.len() as f64
        }
    }
}

impl Clone for QueryStats {
    fn clone(&self) -> Self {
        let window = self
            .latencies_ms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        Self {
            queries: AtomicU64::new(self.query_count()),
            hits: AtomicU64::new(self.hit_count()),
            latencies_ms: Mutex::new(window),
        }
    }
}

pub(crate) fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}

/// Diagnostics snapshot for a [`SpatialIndex`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetrics {
    pub backend: BackendKind,
    pub element_count: usize,
    pub query_count: u64,
    /// Queries that returned at least one element.
    pub hit_count: u64,
    pub hit_ratio: f64,
    pub avg_query_time_ms: f64,
    pub memory_usage_bytes: usize,
}

/// Bounding-box index over document elements.
#[derive(Debug)]
pub struct SpatialIndex {
    backend: Box<dyn SpatialBackend>,
    requested: BackendKind,
    slots: Vec<Option<ElementBounds>>,
    free_slots: Vec<usize>,
    by_id: HashMap<ElementId, usize>,
    next_sequence: u64,
    dirty: bool,
    stats: QueryStats,
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new(BackendKind::default())
    }
}

impl Clone for SpatialIndex {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone_box(),
            requested: self.requested,
            slots: self.slots.clone(),
            free_slots: self.free_slots.clone(),
            by_id: self.by_id.clone(),
            next_sequence: self.next_sequence,
            dirty: self.dirty,
            stats: self.stats.clone(),
        }
    }
}

impl SpatialIndex {
    /// Create an empty index. A `Tree` request silently becomes `Linear`
    /// when the tree backend is not available.
    pub fn new(kind: BackendKind) -> Self {
        Self {
            backend: backend_or_fallback(kind),
            requested: kind,
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_id: HashMap::new(),
            next_sequence: 0,
            dirty: false,
            stats: QueryStats::default(),
        }
    }

    /// Build an optimized index from a snapshot. Invalid or duplicate records
    /// are skipped and returned alongside the index.
    pub fn from_records(kind: BackendKind, records: &[ElementRecord]) -> (Self, Vec<IndexError>) {
        let mut index = Self::new(kind);
        let mut rejected = Vec::new();
        let mut items = Vec::with_capacity(records.len());

        for record in records {
            if index.by_id.contains_key(&record.id) {
                rejected.push(IndexError::DuplicateElementId(record.id));
                continue;
            }
            match ElementBounds::from_record(record, index.next_sequence) {
                Ok(bounds) => {
                    let slot = index.slots.len();
                    index.next_sequence += 1;
                    index.by_id.insert(bounds.id, slot);
                    items.push((slot, bounds.rect));
                    index.slots.push(Some(bounds));
                }
                Err(err) => rejected.push(err),
            }
        }

        index.backend.bulk_load(&items);
        (index, rejected)
    }

    /// Backend requested at construction.
    pub fn requested_backend(&self) -> BackendKind {
        self.requested
    }

    /// Backend actually serving queries.
    pub fn active_backend(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Number of indexed elements.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Whether mutations happened since the last [`optimize`](Self::optimize).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Look up an element by id.
    pub fn get(&self, id: ElementId) -> Option<&ElementBounds> {
        self.by_id.get(&id).and_then(|&slot| self.slots[slot].as_ref())
    }

    /// Whether `id` is indexed.
    pub fn contains(&self, id: ElementId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// All indexed elements, in slot order.
    pub fn elements(&self) -> impl Iterator<Item = &ElementBounds> {
        self.slots.iter().flatten()
    }

    /// Insert an element. Rejects invalid bounds and duplicate ids without
    /// changing the index.
    pub fn insert(&mut self, record: &ElementRecord) -> Result<ElementId, IndexError> {
        if self.by_id.contains_key(&record.id) {
            return Err(IndexError::DuplicateElementId(record.id));
        }
        let bounds = ElementBounds::from_record(record, self.next_sequence)?;
        self.next_sequence += 1;

        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.backend.insert(slot, bounds.rect);
        self.by_id.insert(bounds.id, slot);
        self.slots[slot] = Some(bounds);
        self.dirty = true;
        Ok(record.id)
    }

    /// Remove an element. Returns false for unknown ids.
    pub fn remove(&mut self, id: ElementId) -> bool {
        let Some(slot) = self.by_id.remove(&id) else {
            return false;
        };
        if let Some(bounds) = self.slots[slot].take() {
            self.backend.remove(slot, bounds.rect);
        }
        self.free_slots.push(slot);
        self.dirty = true;
        true
    }

    /// Drop every element.
    pub fn clear(&mut self) {
        self.backend.clear();
        self.slots.clear();
        self.free_slots.clear();
        self.by_id.clear();
        self.dirty = false;
    }

    /// Rebuild the backend from scratch if it was mutated since the last call.
    /// Returns true when a rebuild happened.
    pub fn optimize(&mut self) -> bool {
        if !self.dirty {
            return false;
        }
        self.dirty = false;
        if !self.backend.benefits_from_rebuild() {
            return false;
        }

        let items: Vec<(usize, Rect)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, b)| b.as_ref().map(|b| (slot, b.rect)))
            .collect();
        self.backend.bulk_load(&items);
        log::debug!(
            "Rebuilt {:?} spatial index with {} elements",
            self.active_backend(),
            items.len()
        );
        true
    }

    /// Elements whose bounds, expanded by `tolerance`, contain `point`.
    /// Ordered by z-order, highest first; equal z-orders put the most
    /// recently inserted element first.
    pub fn point_query(&self, point: Point, tolerance: f64) -> Vec<ElementId> {
        let started = Instant::now();
        let mut hits = self.point_candidates(point, tolerance);
        hits.sort_by(|a, b| {
            b.z_order
                .cmp(&a.z_order)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        let ids: Vec<ElementId> = hits.into_iter().map(|b| b.id).collect();
        self.stats.record(started, !ids.is_empty());
        ids
    }

    /// Ids of elements whose bounds intersect `rect`, in no particular order.
    pub fn rect_query(&self, rect: Rect) -> Vec<ElementId> {
        self.elements_in_rect(rect).into_iter().map(|b| b.id).collect()
    }

    /// Elements whose bounds intersect `rect`, in no particular order.
    pub fn elements_in_rect(&self, rect: Rect) -> Vec<&ElementBounds> {
        let started = Instant::now();
        let hits = if is_finite_rect(&rect) {
            self.resolve(self.broad_phase(rect.abs()))
        } else {
            Vec::new()
        };
        self.stats.record(started, !hits.is_empty());
        hits
    }

    fn point_candidates(&self, point: Point, tolerance: f64) -> Vec<&ElementBounds> {
        if !point.is_finite() || !tolerance.is_finite() {
            return Vec::new();
        }
        let tolerance = tolerance.max(0.0);
        let probe = expand_rect(Rect::from_points(point, point), tolerance);
        self.resolve(self.broad_phase(probe))
            .into_iter()
            .filter(|b| rect_contains(&expand_rect(b.rect, tolerance), point))
            .collect()
    }

    fn broad_phase(&self, rect: Rect) -> Vec<usize> {
        let mut slots = Vec::new();
        self.backend.query_rect(rect, &mut slots);
        slots
    }

    fn resolve(&self, slots: Vec<usize>) -> Vec<&ElementBounds> {
        slots
            .into_iter()
            .filter_map(|slot| self.slots.get(slot).and_then(Option::as_ref))
            .collect()
    }

    /// Approximate memory held by the index.
    pub fn memory_usage_bytes(&self) -> usize {
        let slots: usize = self
            .slots
            .iter()
            .map(|s| {
                s.as_ref().map_or(
                    std::mem::size_of::<Option<ElementBounds>>(),
                    ElementBounds::estimated_size,
                )
            })
            .sum();
        let id_entry = std::mem::size_of::<ElementId>() + std::mem::size_of::<usize>();
        let ids = self.by_id.capacity() * id_entry;
        let free = self.free_slots.capacity() * std::mem::size_of::<usize>();
        slots + ids + free + self.backend.memory_usage()
    }

    /// Diagnostics snapshot.
    pub fn metrics(&self) -> IndexMetrics {
        IndexMetrics {
            backend: self.active_backend(),
            element_count: self.len(),
            query_count: self.stats.query_count(),
            hit_count: self.stats.hit_count(),
            hit_ratio: self.stats.hit_ratio(),
            avg_query_time_ms: self.stats.avg_query_time_ms(),
            memory_usage_bytes: self.memory_usage_bytes(),
        }
    }
}

fn is_finite_rect(rect: &Rect) -> bool {
    rect.x0.is_finite() && rect.y0.is_finite() && rect.x1.is_finite() && rect.y1.is_finite()
}
