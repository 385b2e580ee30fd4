//! Linear-scan backend. Always available; used when the tree backend is not built.

use super::BackendKind;
use super::backend::SpatialBackend;
use crate::element::rects_intersect;
use kurbo::Rect;

/// Flat slot vector scanned on every query.
#[derive(Debug, Clone, Default)]
pub struct LinearScan {
    entries: Vec<Option<Rect>>,
}

impl SpatialBackend for LinearScan {
    fn kind(&self) -> BackendKind {
        BackendKind::Linear
    }

    fn insert(&mut self, slot: usize, rect: Rect) {
        if self.entries.len() <= slot {
            self.entries.resize(slot + 1, None);
        }
        self.entries[slot] = Some(rect);
    }

    fn remove(&mut self, slot: usize, _rect: Rect) -> bool {
        match self.entries.get_mut(slot) {
            Some(entry) => entry.take().is_some(),
            None => false,
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn query_rect(&self, rect: Rect, out: &mut Vec<usize>) {
        for (slot, entry) in self.entries.iter().enumerate() {
            if let Some(bounds) = entry {
                if rects_intersect(bounds, &rect) {
                    out.push(slot);
                }
            }
        }
    }

    fn bulk_load(&mut self, items: &[(usize, Rect)]) {
        self.entries.clear();
        for &(slot, rect) in items {
            self.insert(slot, rect);
        }
    }

    fn benefits_from_rebuild(&self) -> bool {
        false
    }

    fn memory_usage(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Option<Rect>>()
    }

    fn clone_box(&self) -> Box<dyn SpatialBackend> {
        Box::new(self.clone())
    }
}
