//! Hit-testing front end: a spatial index snapshot plus a point-query cache.
//!
//! The index is held behind an [`Arc`] and replaced wholesale on rebuild, so a
//! reader holding a [`snapshot`](HitTestOptimizer::snapshot) never sees a
//! partially rebuilt index. Every replacement or mutation bumps a generation
//! counter; a background rebuild started against an older generation is
//! refused by [`install`](HitTestOptimizer::install).

mod cache;

pub use cache::{CacheKey, KEY_QUANTUM, QueryCache};

use crate::config::IndexConfig;
use crate::element::{ElementBounds, ElementId, ElementRecord};
use crate::error::IndexError;
use crate::index::{BackendKind, IndexMetrics, QueryStats, SpatialIndex};
use kurbo::{Point, Rect};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread::JoinHandle;
use std::time::Instant;

/// Outcome of building an index from a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebuildReport {
    /// Elements that made it into the index.
    pub indexed: usize,
    /// Records skipped because of invalid bounds or duplicate ids.
    pub rejected: Vec<IndexError>,
}

/// An index built off-thread, waiting to be installed.
#[derive(Debug)]
pub struct RebuiltIndex {
    generation: u64,
    index: SpatialIndex,
    report: RebuildReport,
}

impl RebuiltIndex {
    pub fn report(&self) -> &RebuildReport {
        &self.report
    }

    /// Generation of the optimizer when the rebuild started.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Handle to a rebuild running on a worker thread.
#[derive(Debug)]
pub struct PendingRebuild {
    receiver: Receiver<RebuiltIndex>,
    worker: Option<JoinHandle<()>>,
}

impl PendingRebuild {
    /// The rebuilt index if the worker has finished.
    pub fn try_take(&mut self) -> Option<RebuiltIndex> {
        let rebuilt = self.receiver.try_recv().ok()?;
        self.join();
        Some(rebuilt)
    }

    /// Block until the worker finishes. `None` if it died without a result.
    pub fn wait(mut self) -> Option<RebuiltIndex> {
        let rebuilt = self.receiver.recv().ok();
        self.join();
        rebuilt
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("Index rebuild worker panicked");
            }
        }
    }
}

/// Metrics snapshot for a [`HitTestOptimizer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitTestMetrics {
    pub query_count: u64,
    pub hit_count: u64,
    pub hit_ratio: f64,
    pub avg_query_time_ms: f64,
    pub cache_hit_ratio: f64,
    pub memory_usage_bytes: usize,
    pub cache_entries: usize,
    pub element_count: usize,
    /// Metrics of the index currently installed.
    pub index: IndexMetrics,
}

fn build_index(backend: BackendKind, records: &[ElementRecord]) -> (SpatialIndex, RebuildReport) {
    let (index, rejected) = SpatialIndex::from_records(backend, records);
    for err in &rejected {
        log::warn!("Skipping element during index rebuild: {}", err);
    }
    let report = RebuildReport {
        indexed: index.len(),
        rejected,
    };
    (index, report)
}

/// Cached hit-testing over an element snapshot.
#[derive(Debug)]
pub struct HitTestOptimizer {
    index: Arc<SpatialIndex>,
    backend: BackendKind,
    cache: QueryCache,
    generation: u64,
    stats: QueryStats,
}

impl Default for HitTestOptimizer {
    fn default() -> Self {
        Self::new(&IndexConfig::default())
    }
}

impl HitTestOptimizer {
    /// Create an optimizer with an empty index.
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            index: Arc::new(SpatialIndex::new(config.backend)),
            backend: config.backend,
            cache: QueryCache::new(config.cache_capacity),
            generation: 0,
            stats: QueryStats::default(),
        }
    }

    /// Replace the index with one built from `records` and drop the cache.
    pub fn optimize(&mut self, records: &[ElementRecord]) -> RebuildReport {
        let (index, report) = build_index(self.backend, records);
        self.replace_index(index);
        log::debug!(
            "Hit-test index rebuilt: {} indexed, {} rejected",
            report.indexed,
            report.rejected.len()
        );
        report
    }

    /// Start building an index from `records` on a worker thread.
    ///
    /// Queries keep using the current index until the result is passed to
    /// [`install`](Self::install).
    pub fn rebuild_in_background(&self, records: Vec<ElementRecord>) -> PendingRebuild {
        let (sender, receiver) = mpsc::channel();
        let generation = self.generation;
        let backend = self.backend;
        let worker = std::thread::spawn(move || {
            let (index, report) = build_index(backend, &records);
            // The receiver may already be gone; the result is simply dropped.
            let _ = sender.send(RebuiltIndex {
                generation,
                index,
                report,
            });
        });
        PendingRebuild {
            receiver,
            worker: Some(worker),
        }
    }

    /// Swap in a background-built index. Returns false, leaving the current
    /// index in place, if anything replaced or mutated the index since the
    /// rebuild started.
    pub fn install(&mut self, rebuilt: RebuiltIndex) -> bool {
        if rebuilt.generation != self.generation {
            log::warn!(
                "Discarding stale index rebuild (generation {} != {})",
                rebuilt.generation,
                self.generation
            );
            return false;
        }
        self.replace_index(rebuilt.index);
        true
    }

    fn replace_index(&mut self, index: SpatialIndex) {
        self.index = Arc::new(index);
        self.bump();
    }

    fn bump(&mut self) {
        self.generation += 1;
        self.cache.clear();
    }

    /// Insert one element into the live index.
    ///
    /// Readers holding a snapshot keep the index they had.
    pub fn insert_element(&mut self, record: &ElementRecord) -> Result<ElementId, IndexError> {
        let id = Arc::make_mut(&mut self.index).insert(record)?;
        self.bump();
        Ok(id)
    }

    /// Remove one element from the live index. Returns false for unknown ids.
    pub fn remove_element(&mut self, id: ElementId) -> bool {
        if !self.index.contains(id) {
            return false;
        }
        let removed = Arc::make_mut(&mut self.index).remove(id);
        if removed {
            self.bump();
        }
        removed
    }

    /// Rebuild the live index's tree after incremental edits.
    pub fn optimize_index(&mut self) -> bool {
        if !self.index.is_dirty() {
            return false;
        }
        let rebuilt = Arc::make_mut(&mut self.index).optimize();
        if rebuilt {
            self.cache.clear();
        }
        rebuilt
    }

    /// Drop every cached query result.
    pub fn invalidate_cache(&mut self) {
        log::debug!("Hit-test cache invalidated ({} entries)", self.cache.len());
        self.cache.clear();
    }

    /// Elements under `point`, topmost first.
    pub fn find_at_point(&mut self, point: Point, tolerance: f64) -> Vec<ElementId> {
        let started = Instant::now();
        let key = CacheKey::new(point, tolerance);

        let cached = key
            .as_ref()
            .and_then(|k| self.cache.get(k).map(<[ElementId]>::to_vec));
        if let Some(ids) = cached {
            let total = ids.len();
            let resolved: Vec<ElementId> =
                ids.into_iter().filter(|&id| self.index.contains(id)).collect();
            if resolved.len() != total {
                log::debug!("Cached hit referenced removed elements; invalidating cache");
                self.cache.clear();
            }
            self.stats.record(started, !resolved.is_empty());
            return resolved;
        }

        let ids = self.index.point_query(point, tolerance);
        if let Some(key) = key {
            self.cache.insert(key, ids.clone());
        }
        self.stats.record(started, !ids.is_empty());
        ids
    }

    /// Ids of elements intersecting `rect`. Never cached.
    pub fn find_in_rect(&self, rect: Rect) -> Vec<ElementId> {
        let started = Instant::now();
        let ids = self.index.rect_query(rect);
        self.stats.record(started, !ids.is_empty());
        ids
    }

    /// Elements intersecting `rect`, with their bounds.
    pub fn elements_in_rect(&self, rect: Rect) -> Vec<&ElementBounds> {
        self.index.elements_in_rect(rect)
    }

    /// Look up an indexed element.
    pub fn element(&self, id: ElementId) -> Option<&ElementBounds> {
        self.index.get(id)
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.index.contains(id)
    }

    /// Number of indexed elements.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Shared handle to the current index.
    pub fn snapshot(&self) -> Arc<SpatialIndex> {
        Arc::clone(&self.index)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn metrics(&self) -> HitTestMetrics {
        let index = self.index.metrics();
        HitTestMetrics {
            query_count: self.stats.query_count(),
            hit_count: self.stats.hit_count(),
            hit_ratio: self.stats.hit_ratio(),
            avg_query_time_ms: self.stats.avg_query_time_ms(),
            cache_hit_ratio: self.cache.hit_ratio(),
            memory_usage_bytes: index.memory_usage_bytes + self.cache.memory_usage(),
            cache_entries: self.cache.len(),
            element_count: index.element_count,
            index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(x0: f64, y0: f64, x1: f64, y1: f64, z: i32) -> ElementRecord {
        ElementRecord::new(Rect::new(x0, y0, x1, y1), "block", z)
    }

    fn optimizer_with(records: &[ElementRecord]) -> HitTestOptimizer {
        let mut optimizer = HitTestOptimizer::default();
        optimizer.optimize(records);
        optimizer
    }

    #[test]
    fn test_cache_hit_returns_identical_results() {
        let a = record(0.0, 0.0, 10.0, 10.0, 1);
        let b = record(5.0, 5.0, 15.0, 15.0, 2);
        let mut optimizer = optimizer_with(&[a.clone(), b.clone()]);

        let first = optimizer.find_at_point(Point::new(6.0, 6.0), 0.0);
        let second = optimizer.find_at_point(Point::new(6.0, 6.0), 0.0);
        assert_eq!(first, vec![b.id, a.id]);
        assert_eq!(first, second);

        let metrics = optimizer.metrics();
        assert_eq!(metrics.query_count, 2);
        assert!((metrics.cache_hit_ratio - 0.5).abs() < 1e-12);
        // Only the miss reached the index.
        assert_eq!(metrics.index.query_count, 1);
        assert_eq!(metrics.cache_entries, 1);
    }

    #[test]
    fn test_optimize_invalidates_cache() {
        let a = record(0.0, 0.0, 10.0, 10.0, 0);
        let mut optimizer = optimizer_with(&[a.clone()]);
        assert_eq!(optimizer.find_at_point(Point::new(1.0, 1.0), 0.0), vec![a.id]);

        let b = record(0.0, 0.0, 2.0, 2.0, 0);
        let report = optimizer.optimize(&[b.clone()]);
        assert_eq!(report.indexed, 1);
        assert_eq!(optimizer.cache_len(), 0);
        assert_eq!(optimizer.find_at_point(Point::new(1.0, 1.0), 0.0), vec![b.id]);
    }

    #[test]
    fn test_mutation_invalidates_cache() {
        let a = record(0.0, 0.0, 10.0, 10.0, 0);
        let mut optimizer = optimizer_with(&[a.clone()]);
        optimizer.find_at_point(Point::new(1.0, 1.0), 0.0);

        let b = record(0.0, 0.0, 5.0, 5.0, 3);
        optimizer.insert_element(&b).unwrap();
        assert_eq!(optimizer.find_at_point(Point::new(1.0, 1.0), 0.0), vec![b.id, a.id]);

        assert!(optimizer.remove_element(b.id));
        assert_eq!(optimizer.find_at_point(Point::new(1.0, 1.0), 0.0), vec![a.id]);
        assert!(!optimizer.remove_element(b.id));
    }

    #[test]
    fn test_failed_insert_keeps_cache() {
        let a = record(0.0, 0.0, 10.0, 10.0, 0);
        let mut optimizer = optimizer_with(&[a.clone()]);
        optimizer.find_at_point(Point::new(1.0, 1.0), 0.0);
        let generation = optimizer.generation();

        assert!(optimizer.insert_element(&a).is_err());
        assert!(optimizer.insert_element(&record(3.0, 0.0, 1.0, 1.0, 0)).is_err());
        assert_eq!(optimizer.cache_len(), 1);
        assert_eq!(optimizer.generation(), generation);
        assert_eq!(optimizer.len(), 1);
    }

    #[test]
    fn test_find_in_rect_is_uncached() {
        let a = record(0.0, 0.0, 10.0, 10.0, 0);
        let optimizer = optimizer_with(&[a.clone()]);
        assert_eq!(optimizer.find_in_rect(Rect::new(9.0, 9.0, 20.0, 20.0)), vec![a.id]);
        assert_eq!(optimizer.cache_len(), 0);
        assert!(optimizer.find_in_rect(Rect::new(11.0, 11.0, 20.0, 20.0)).is_empty());
    }

    #[test]
    fn test_snapshot_survives_rebuild() {
        let a = record(0.0, 0.0, 10.0, 10.0, 0);
        let mut optimizer = optimizer_with(&[a.clone()]);
        let before = optimizer.snapshot();

        optimizer.optimize(&[]);
        assert!(optimizer.is_empty());
        assert_eq!(before.point_query(Point::new(1.0, 1.0), 0.0), vec![a.id]);
    }

    #[test]
    fn test_snapshot_unaffected_by_single_mutation() {
        let a = record(0.0, 0.0, 10.0, 10.0, 0);
        let mut optimizer = optimizer_with(&[a.clone()]);
        let before = optimizer.snapshot();
        assert!(optimizer.remove_element(a.id));
        assert!(before.contains(a.id));
        assert!(!optimizer.contains(a.id));
    }

    #[test]
    fn test_background_rebuild_installs() {
        let mut optimizer = optimizer_with(&[record(0.0, 0.0, 1.0, 1.0, 0)]);
        optimizer.find_at_point(Point::new(0.5, 0.5), 0.0);

        let records: Vec<_> = (0..200)
            .map(|i| record(i as f64 * 2.0, 0.0, i as f64 * 2.0 + 1.0, 1.0, 0))
            .collect();
        let pending = optimizer.rebuild_in_background(records.clone());
        let rebuilt = pending.wait().unwrap();
        assert_eq!(rebuilt.report().indexed, 200);

        assert!(optimizer.install(rebuilt));
        assert_eq!(optimizer.len(), 200);
        assert_eq!(optimizer.cache_len(), 0);
        assert_eq!(
            optimizer.find_at_point(Point::new(20.5, 0.5), 0.0),
            vec![records[10].id]
        );
    }

    #[test]
    fn test_stale_background_rebuild_rejected() {
        let mut optimizer = HitTestOptimizer::default();
        let pending = optimizer.rebuild_in_background(vec![record(0.0, 0.0, 1.0, 1.0, 0)]);

        let newer = record(5.0, 5.0, 6.0, 6.0, 0);
        optimizer.optimize(&[newer.clone()]);

        let rebuilt = pending.wait().unwrap();
        assert!(!optimizer.install(rebuilt));
        assert_eq!(optimizer.len(), 1);
        assert!(optimizer.contains(newer.id));
    }

    #[test]
    fn test_rebuild_report_lists_rejections() {
        let good = record(0.0, 0.0, 1.0, 1.0, 0);
        let mut optimizer = HitTestOptimizer::default();
        let report = optimizer.optimize(&[good.clone(), good, record(0.0, 0.0, f64::NAN, 1.0, 0)]);
        assert_eq!(report.indexed, 1);
        assert_eq!(report.rejected.len(), 2);
    }

    #[test]
    fn test_far_coordinates_do_not_share_cache_entries() {
        let far = record(1e13, 0.0, 1e13 + 10.0, 10.0, 0);
        let mut optimizer = optimizer_with(&[far.clone()]);

        assert_eq!(optimizer.find_at_point(Point::new(1e13 + 1.0, 1.0), 0.0), vec![far.id]);
        assert!(optimizer.find_at_point(Point::new(5e13, 1.0), 0.0).is_empty());
        assert!(optimizer.find_at_point(Point::new(-5e13, 1.0), 0.0).is_empty());
        assert_eq!(optimizer.cache_len(), 0);
    }

    #[test]
    fn test_disabled_cache_still_answers() {
        let config = IndexConfig {
            cache_capacity: 0,
            ..IndexConfig::default()
        };
        let mut optimizer = HitTestOptimizer::new(&config);
        let a = record(0.0, 0.0, 10.0, 10.0, 0);
        optimizer.optimize(&[a.clone()]);
        assert_eq!(optimizer.find_at_point(Point::new(1.0, 1.0), 0.0), vec![a.id]);
        assert_eq!(optimizer.find_at_point(Point::new(1.0, 1.0), 0.0), vec![a.id]);
        assert_eq!(optimizer.metrics().cache_hit_ratio, 0.0);
    }
}
