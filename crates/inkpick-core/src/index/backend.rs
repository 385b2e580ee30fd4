//! Backend abstraction shared by the tree and linear spatial structures.

use super::BackendKind;
use kurbo::Rect;
use std::fmt::Debug;

/// Spatial structure over `(slot, rect)` pairs.
///
/// Slots are dense indices owned by [`SpatialIndex`](super::SpatialIndex);
/// backends never see element ids.
pub trait SpatialBackend: Debug + Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> BackendKind;

    /// Insert a slot with its bounding box.
    fn insert(&mut self, slot: usize, rect: Rect);

    /// Remove a slot. `rect` is the box it was inserted with.
    /// Returns false if the slot was not present.
    fn remove(&mut self, slot: usize, rect: Rect) -> bool;

    /// Remove everything.
    fn clear(&mut self);

    /// Push every slot whose box intersects `rect` (edges inclusive) onto `out`.
    fn query_rect(&self, rect: Rect, out: &mut Vec<usize>);

    /// Replace the contents with `items` in one pass.
    fn bulk_load(&mut self, items: &[(usize, Rect)]);

    /// Whether `bulk_load` after incremental edits improves query performance.
    fn benefits_from_rebuild(&self) -> bool;

    /// Approximate bytes held by the structure.
    fn memory_usage(&self) -> usize;

    /// Clone into a new boxed backend (used for copy-on-write snapshots).
    fn clone_box(&self) -> Box<dyn SpatialBackend>;
}
