//! Positioned document elements as seen by the selection engine.

use crate::error::IndexError;
use kurbo::{Point, Rect};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for a document element.
pub type ElementId = Uuid;

/// Element snapshot record supplied by the document collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    /// Stable element identifier.
    pub id: ElementId,
    /// Axis-aligned bounding box in document coordinates.
    pub bounds: Rect,
    /// Opaque type tag ("text", "image", ...).
    #[serde(default)]
    pub kind: String,
    /// Stacking order; higher values are drawn on top.
    #[serde(default)]
    pub z_order: i32,
}

impl ElementRecord {
    /// Create a record with a fresh id.
    pub fn new(bounds: Rect, kind: impl Into<String>, z_order: i32) -> Self {
        Self::with_id(Uuid::new_v4(), bounds, kind, z_order)
    }

    /// Create a record with a caller-provided id.
    pub fn with_id(id: ElementId, bounds: Rect, kind: impl Into<String>, z_order: i32) -> Self {
        Self {
            id,
            bounds,
            kind: kind.into(),
            z_order,
        }
    }
}

/// Bounds of an indexed element. Created on insert and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementBounds {
    pub id: ElementId,
    pub rect: Rect,
    pub kind: String,
    pub z_order: i32,
    /// Wall-clock time the element entered the index (ms since the Unix epoch).
    pub updated_at_ms: u64,
    /// Insertion sequence, used to order equal z-orders.
    pub(crate) sequence: u64,
}

impl ElementBounds {
    /// Validate a record and stamp it for insertion.
    pub(crate) fn from_record(record: &ElementRecord, sequence: u64) -> Result<Self, IndexError> {
        validate_rect(record.id, record.bounds)?;
        Ok(Self {
            id: record.id,
            rect: record.bounds,
            kind: record.kind.clone(),
            z_order: record.z_order,
            updated_at_ms: now_millis(),
            sequence,
        })
    }

    /// Convert back into a snapshot record.
    pub fn to_record(&self) -> ElementRecord {
        ElementRecord::with_id(self.id, self.rect, self.kind.clone(), self.z_order)
    }

    /// Center of the bounding box.
    pub fn center(&self) -> Point {
        self.rect.center()
    }

    /// Rough heap + inline footprint, used for memory metrics.
    pub(crate) fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.kind.capacity()
    }
}

/// Reject rectangles with non-finite or inverted coordinates.
pub(crate) fn validate_rect(id: ElementId, rect: Rect) -> Result<(), IndexError> {
    let coords = [rect.x0, rect.y0, rect.x1, rect.y1];
    if coords.iter().any(|c| !c.is_finite()) {
        return Err(IndexError::InvalidBounds {
            id,
            reason: format!("non-finite coordinates {:?}", coords),
        });
    }
    if rect.x0 > rect.x1 || rect.y0 > rect.y1 {
        return Err(IndexError::InvalidBounds {
            id,
            reason: format!(
                "inverted rectangle ({}, {}) - ({}, {})",
                rect.x0, rect.y0, rect.x1, rect.y1
            ),
        });
    }
    Ok(())
}

/// Grow a rectangle by `amount` on every side.
pub(crate) fn expand_rect(rect: Rect, amount: f64) -> Rect {
    Rect::new(
        rect.x0 - amount,
        rect.y0 - amount,
        rect.x1 + amount,
        rect.y1 + amount,
    )
}

/// Edge-inclusive containment test.
pub(crate) fn rect_contains(rect: &Rect, point: Point) -> bool {
    point.x >= rect.x0 && point.x <= rect.x1 && point.y >= rect.y0 && point.y <= rect.y1
}

/// Edge-inclusive overlap test; rectangles sharing an edge intersect.
pub(crate) fn rects_intersect(a: &Rect, b: &Rect) -> bool {
    a.x0 <= b.x1 && b.x0 <= a.x1 && a.y0 <= b.y1 && b.y0 <= a.y1
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
