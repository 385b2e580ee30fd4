//! Magnetic snapping of pointer positions to the grid, guides and elements.
//!
//! Every enabled category contributes candidates and the nearest one within
//! `snap_distance` wins. Categories only describe where the result came from;
//! none of them takes priority over a closer candidate.

use crate::element::now_millis;
use kurbo::{Point, Rect};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Grid size for snapping (matches the visual grid).
pub const GRID_SIZE: f64 = 20.0;

/// Distance threshold for snapping (in world units).
pub const SNAP_DISTANCE: f64 = 10.0;

/// Number of successful snaps remembered by [`MagneticSnapping::recent_snaps`].
pub const RECENT_SNAPS: usize = 10;

/// Snapping configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapConfig {
    /// Maximum distance a point may move when snapped.
    pub snap_distance: f64,
    /// Grid spacing. Zero or negative disables grid snapping.
    pub grid_size: f64,
    pub snap_to_grid: bool,
    pub snap_to_guides: bool,
    pub snap_to_elements: bool,
    /// How long a cached result stays valid.
    pub cache_ttl_ms: u64,
    /// Maximum number of cached results.
    pub cache_capacity: usize,
}

impl Default for SnapConfig {
    fn default() -> Self {
        Self {
            snap_distance: SNAP_DISTANCE,
            grid_size: GRID_SIZE,
            snap_to_grid: true,
            snap_to_guides: true,
            snap_to_elements: true,
            cache_ttl_ms: 250,
            cache_capacity: 32,
        }
    }
}

/// Orientation of a guide line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuideAxis {
    /// Line of constant y.
    Horizontal,
    /// Line of constant x.
    Vertical,
}

/// Identifier of a guide line.
pub type GuideId = Uuid;

/// A user-placed alignment guide.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuideLine {
    pub id: GuideId,
    pub axis: GuideAxis,
    pub position: f64,
    pub created_at_ms: u64,
}

impl GuideLine {
    /// The point moved onto this guide.
    fn project(&self, point: Point) -> Point {
        match self.axis {
            GuideAxis::Horizontal => Point::new(point.x, self.position),
            GuideAxis::Vertical => Point::new(self.position, point.y),
        }
    }
}

/// Where a snapped point came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapProvenance {
    /// Not snapped.
    #[default]
    None,
    Grid,
    Guide,
    Element,
}

/// Type of snap target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapTargetKind {
    /// Grid intersection.
    Grid,
    /// Guide line.
    Guide,
    /// Point on an element edge.
    Edge,
    /// Corner of an element.
    Corner,
    /// Crossing of an element's horizontal or vertical center line.
    AxisCenter,
    /// Center of an element.
    Center,
}

/// A point that can be snapped to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapTarget {
    /// The snap point location.
    pub point: Point,
    /// Type of snap target for visual feedback.
    pub kind: SnapTargetKind,
}

/// Result of a snap operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SnapResult {
    /// The snapped point.
    pub point: Point,
    pub provenance: SnapProvenance,
    /// Distance moved from the input point.
    pub distance: f64,
    pub target: Option<SnapTargetKind>,
}

impl SnapResult {
    /// Create a result with no snapping.
    pub fn none(point: Point) -> Self {
        Self {
            point,
            provenance: SnapProvenance::None,
            distance: 0.0,
            target: None,
        }
    }

    /// Check if any snapping occurred.
    pub fn is_snapped(&self) -> bool {
        self.provenance != SnapProvenance::None
    }
}

/// Snap a point to the nearest grid intersection.
pub fn snap_to_grid(point: Point, grid_size: f64) -> Point {
    Point::new(
        (point.x / grid_size).round() * grid_size,
        (point.y / grid_size).round() * grid_size,
    )
}

/// Collect the eleven snap targets an element offers to `point`.
///
/// Edge targets are the point projected onto each edge line along its free
/// axis, so a point beside or beyond an element can align with its extended
/// edges. Axis-center targets move the point onto the element's vertical and
/// horizontal center lines. Corners and the center come first so that they
/// win ties with a projection landing on the same spot.
pub fn snap_targets_from_bounds(point: Point, bounds: Rect) -> [SnapTarget; 11] {
    let center = bounds.center();
    let (px, py) = (point.x, point.y);
    let target = |x, y, kind| SnapTarget {
        point: Point::new(x, y),
        kind,
    };

    [
        target(bounds.x0, bounds.y0, SnapTargetKind::Corner),
        target(bounds.x1, bounds.y0, SnapTargetKind::Corner),
        target(bounds.x1, bounds.y1, SnapTargetKind::Corner),
        target(bounds.x0, bounds.y1, SnapTargetKind::Corner),
        target(center.x, center.y, SnapTargetKind::Center),
        target(bounds.x0, py, SnapTargetKind::Edge),
        target(bounds.x1, py, SnapTargetKind::Edge),
        target(px, bounds.y0, SnapTargetKind::Edge),
        target(px, bounds.y1, SnapTargetKind::Edge),
        target(center.x, py, SnapTargetKind::AxisCenter),
        target(px, center.y, SnapTargetKind::AxisCenter),
    ]
}

/// Whether any target of `bounds` can lie within `limit` of `point`.
///
/// Each target has its x within `[x0, x1]` or its y within `[y0, y1]`, so
/// its distance is at least the point's gap to that span.
fn within_axis_reach(point: Point, bounds: Rect, limit: f64) -> bool {
    let x_reach = point.x >= bounds.x0 - limit && point.x <= bounds.x1 + limit;
    let y_reach = point.y >= bounds.y0 - limit && point.y <= bounds.y1 + limit;
    x_reach || y_reach
}

/// Running nearest-candidate selection. Ties keep the earlier candidate.
struct Nearest {
    origin: Point,
    limit: f64,
    best: SnapResult,
}

impl Nearest {
    fn new(origin: Point, limit: f64) -> Self {
        Self {
            origin,
            limit,
            best: SnapResult::none(origin),
        }
    }

    fn offer(&mut self, point: Point, provenance: SnapProvenance, kind: SnapTargetKind) {
        let distance = self.origin.distance(point);
        if distance > self.limit {
            return;
        }
        if self.best.is_snapped() && distance >= self.best.distance {
            return;
        }
        self.best = SnapResult {
            point,
            provenance,
            distance,
            target: Some(kind),
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SnapCacheKey {
    x: u64,
    y: u64,
    elements: usize,
}

#[derive(Debug, Clone)]
struct CachedSnap {
    key: SnapCacheKey,
    result: SnapResult,
    stored_at: Instant,
}

/// Recent-snap state captured by [`MagneticSnapping::checkpoint`].
#[derive(Debug, Clone)]
pub struct SnapCheckpoint {
    recent: VecDeque<SnapResult>,
}

/// Magnetic snapping state: configuration, guides, a short-lived result cache
/// and the most recent successful snaps.
#[derive(Debug, Clone, Default)]
pub struct MagneticSnapping {
    config: SnapConfig,
    guides: Vec<GuideLine>,
    cache: VecDeque<CachedSnap>,
    recent: VecDeque<SnapResult>,
}

impl MagneticSnapping {
    pub fn new(config: SnapConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &SnapConfig {
        &self.config
    }

    /// Replace the configuration. Cached results are dropped.
    pub fn set_config(&mut self, config: SnapConfig) {
        self.config = config;
        self.clear_cache();
    }

    /// Adjust `point` toward the nearest grid intersection, guide or element
    /// target within `snap_distance`. Returns the point unchanged when nothing
    /// is in range.
    pub fn snap(&mut self, point: Point, elements: &[Rect]) -> SnapResult {
        if !point.is_finite() {
            return SnapResult::none(point);
        }

        let key = SnapCacheKey {
            x: point.x.to_bits(),
            y: point.y.to_bits(),
            elements: elements.len(),
        };
        let result = match self.cached(key) {
            Some(result) => result,
            None => {
                let result = self.compute(point, elements);
                self.store(key, result);
                result
            }
        };

        if result.is_snapped() {
            if self.recent.len() == RECENT_SNAPS {
                self.recent.pop_front();
            }
            self.recent.push_back(result);
        }
        result
    }

    fn compute(&self, point: Point, elements: &[Rect]) -> SnapResult {
        let limit = self.config.snap_distance;
        if !limit.is_finite() || limit < 0.0 {
            return SnapResult::none(point);
        }
        let mut nearest = Nearest::new(point, limit);

        let grid = self.config.grid_size;
        if self.config.snap_to_grid && grid.is_finite() && grid > 0.0 {
            nearest.offer(snap_to_grid(point, grid), SnapProvenance::Grid, SnapTargetKind::Grid);
        }

        if self.config.snap_to_guides {
            for guide in &self.guides {
                nearest.offer(guide.project(point), SnapProvenance::Guide, SnapTargetKind::Guide);
            }
        }

        if self.config.snap_to_elements {
            for bounds in elements {
                if !within_axis_reach(point, *bounds, limit) {
                    continue;
                }
                for target in snap_targets_from_bounds(point, *bounds) {
                    nearest.offer(target.point, SnapProvenance::Element, target.kind);
                }
            }
        }

        nearest.best
    }

    fn cached(&mut self, key: SnapCacheKey) -> Option<SnapResult> {
        let ttl = Duration::from_millis(self.config.cache_ttl_ms);
        self.cache.retain(|entry| entry.stored_at.elapsed() < ttl);
        self.cache.iter().find(|entry| entry.key == key).map(|entry| entry.result)
    }

    fn store(&mut self, key: SnapCacheKey, result: SnapResult) {
        if self.config.cache_capacity == 0 || self.config.cache_ttl_ms == 0 {
            return;
        }
        while self.cache.len() >= self.config.cache_capacity {
            self.cache.pop_front();
        }
        self.cache.push_back(CachedSnap {
            key,
            result,
            stored_at: Instant::now(),
        });
    }

    /// Number of live cached results.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Drop every cached result.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Add a guide line and return its id.
    pub fn add_guide(&mut self, axis: GuideAxis, position: f64) -> GuideId {
        let guide = GuideLine {
            id: Uuid::new_v4(),
            axis,
            position,
            created_at_ms: now_millis(),
        };
        self.guides.push(guide);
        self.clear_cache();
        guide.id
    }

    /// Remove a guide line. Returns false if no guide has that id.
    pub fn remove_guide(&mut self, id: GuideId) -> bool {
        let before = self.guides.len();
        self.guides.retain(|g| g.id != id);
        let removed = self.guides.len() != before;
        if removed {
            self.clear_cache();
        }
        removed
    }

    /// Guide lines in insertion order.
    pub fn guides(&self) -> &[GuideLine] {
        &self.guides
    }

    pub fn clear_guides(&mut self) {
        self.guides.clear();
        self.clear_cache();
    }

    /// The most recent successful snaps, oldest first.
    pub fn recent_snaps(&self) -> impl Iterator<Item = &SnapResult> {
        self.recent.iter()
    }

    /// Capture the recent-snap buffer so a cancelled gesture can undo its snaps.
    pub fn checkpoint(&self) -> SnapCheckpoint {
        SnapCheckpoint {
            recent: self.recent.clone(),
        }
    }

    /// Return to a checkpoint and drop cached results.
    pub fn restore(&mut self, checkpoint: SnapCheckpoint) {
        self.recent = checkpoint.recent;
        self.clear_cache();
    }
}
