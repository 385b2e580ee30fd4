//! Per-session glue between hit-testing, snapping and history.
//!
//! A [`SelectionToolCoordinator`] owns everything one document-viewing
//! session needs. Every committed selection change is written to the history
//! before listeners hear about it.

use crate::config::EngineConfig;
use crate::element::{ElementId, ElementRecord};
use crate::error::{Result, SelectionError};
use crate::hit_test::{HitTestMetrics, HitTestOptimizer, RebuildReport};
use crate::history::{ActionKind, HistoryAction, HistorySummaryEntry, SelectionHistory};
use crate::snap::{MagneticSnapping, SnapCheckpoint, SnapResult};
use kurbo::{Point, Rect};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use uuid::Uuid;

/// Identifier returned by [`SelectionToolCoordinator::subscribe`].
pub type ListenerId = Uuid;

/// Notification sent to session listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionEvent {
    /// A selection action was committed and recorded.
    SelectionChanged {
        kind: ActionKind,
        selection: Vec<ElementId>,
    },
    /// Undo, redo or import moved to another history entry.
    Restored {
        index: usize,
        selection: Vec<ElementId>,
    },
    /// The spatial index was rebuilt from a new element snapshot.
    IndexRebuilt { element_count: usize },
}

type Listener = Box<dyn FnMut(&SelectionEvent) + Send>;

#[derive(Debug)]
struct DragState {
    origin: Point,
    current: Point,
    checkpoint: SnapCheckpoint,
}

impl DragState {
    fn marquee(&self) -> Rect {
        Rect::from_points(self.origin, self.current)
    }
}

/// Selection tool state for one session.
pub struct SelectionToolCoordinator {
    session_id: Uuid,
    optimizer: HitTestOptimizer,
    snapping: MagneticSnapping,
    history: SelectionHistory,
    tool: String,
    selection: Vec<ElementId>,
    drag: Option<DragState>,
    listeners: Vec<(ListenerId, Listener)>,
}

impl fmt::Debug for SelectionToolCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionToolCoordinator")
            .field("session_id", &self.session_id)
            .field("tool", &self.tool)
            .field("selection", &self.selection)
            .field("elements", &self.optimizer.len())
            .field("history", &self.history.len())
            .field("dragging", &self.drag.is_some())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Default for SelectionToolCoordinator {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl SelectionToolCoordinator {
    /// Start a session.
    pub fn new(config: EngineConfig) -> Self {
        let session_id = Uuid::new_v4();
        log::debug!("Selection session {} created", session_id);
        Self {
            session_id,
            optimizer: HitTestOptimizer::new(&config.index),
            snapping: MagneticSnapping::new(config.snapping),
            history: SelectionHistory::new(config.history),
            tool: String::new(),
            selection: Vec::new(),
            drag: None,
            listeners: Vec::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Name of the active tool; empty before the first activation.
    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Current selection, in selection order.
    pub fn selection(&self) -> &[ElementId] {
        &self.selection
    }

    pub fn optimizer(&self) -> &HitTestOptimizer {
        &self.optimizer
    }

    pub fn history(&self) -> &SelectionHistory {
        &self.history
    }

    pub fn snapping(&self) -> &MagneticSnapping {
        &self.snapping
    }

    /// Mutable snapping state, for guide management.
    pub fn snapping_mut(&mut self) -> &mut MagneticSnapping {
        &mut self.snapping
    }

    /// Register a listener for session events.
    pub fn subscribe(
        &mut self,
        listener: impl FnMut(&SelectionEvent) + Send + 'static,
    ) -> ListenerId {
        let id = Uuid::new_v4();
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns false for unknown ids.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    fn publish(&mut self, event: SelectionEvent) {
        for (_, listener) in &mut self.listeners {
            listener(&event);
        }
    }

    /// Record the new selection, then tell listeners.
    fn commit(&mut self, kind: ActionKind, selection: Vec<ElementId>) {
        self.selection = selection;
        let action = HistoryAction::new(kind, self.selection.clone(), self.tool.clone())
            .with_metadata("session", self.session_id.to_string());
        self.history.record(action);
        self.publish(SelectionEvent::SelectionChanged {
            kind,
            selection: self.selection.clone(),
        });
    }

    fn rebuild(&mut self, elements: &[ElementRecord]) -> RebuildReport {
        self.cancel_drag();
        let report = self.optimizer.optimize(elements);
        let optimizer = &self.optimizer;
        self.selection.retain(|&id| optimizer.contains(id));
        self.publish(SelectionEvent::IndexRebuilt {
            element_count: report.indexed,
        });
        report
    }

    /// Switch to `tool` and index `elements`. Records a tool change carrying
    /// the current selection.
    pub fn activate_tool(
        &mut self,
        tool: impl Into<String>,
        elements: &[ElementRecord],
    ) -> RebuildReport {
        self.tool = tool.into();
        let report = self.rebuild(elements);
        log::info!(
            "Activated tool '{}' over {} elements ({} rejected)",
            self.tool,
            report.indexed,
            report.rejected.len()
        );
        let selection = self.selection.clone();
        self.commit(ActionKind::ToolChange, selection);
        report
    }

    /// Re-index after the document changed under the active tool. Selected
    /// elements that disappeared are dropped from the selection without
    /// recording an action.
    pub fn refresh_elements(&mut self, elements: &[ElementRecord]) -> RebuildReport {
        self.rebuild(elements)
    }

    /// Topmost element under `point`.
    pub fn hit(&mut self, point: Point, tolerance: f64) -> Option<ElementId> {
        self.optimizer.find_at_point(point, tolerance).first().copied()
    }

    /// Click selection. A hit selects the topmost element; with `additive` it
    /// toggles that element instead. A plain miss clears the selection.
    /// Returns the recorded action, if the selection changed.
    pub fn click(&mut self, point: Point, tolerance: f64, additive: bool) -> Option<ActionKind> {
        let hit = self.hit(point, tolerance);
        let mut selection = self.selection.clone();
        let kind = match (hit, additive) {
            (Some(id), false) => {
                selection = vec![id];
                ActionKind::Select
            }
            (Some(id), true) => {
                if let Some(pos) = selection.iter().position(|&s| s == id) {
                    selection.remove(pos);
                    ActionKind::Deselect
                } else {
                    selection.push(id);
                    ActionKind::Select
                }
            }
            (None, false) => {
                selection.clear();
                ActionKind::Clear
            }
            (None, true) => return None,
        };

        if selection == self.selection {
            return None;
        }
        self.commit(kind, selection);
        Some(kind)
    }

    fn check_known(&self, ids: &[ElementId]) -> Result<()> {
        match ids.iter().find(|&&id| !self.optimizer.contains(id)) {
            Some(&missing) => Err(SelectionError::UnknownElementId(missing)),
            None => Ok(()),
        }
    }

    /// Replace the selection with `ids`.
    pub fn select(&mut self, ids: &[ElementId]) -> Result<()> {
        self.check_known(ids)?;
        let mut selection = Vec::with_capacity(ids.len());
        for &id in ids {
            if !selection.contains(&id) {
                selection.push(id);
            }
        }
        if selection == self.selection {
            return Ok(());
        }
        let kind = if selection.len() > 1 {
            ActionKind::MultiSelect
        } else if selection.is_empty() {
            ActionKind::Clear
        } else {
            ActionKind::Select
        };
        self.commit(kind, selection);
        Ok(())
    }

    /// Remove `ids` from the selection.
    pub fn deselect(&mut self, ids: &[ElementId]) -> Result<()> {
        self.check_known(ids)?;
        let selection: Vec<ElementId> = self
            .selection
            .iter()
            .copied()
            .filter(|id| !ids.contains(id))
            .collect();
        if selection.len() != self.selection.len() {
            self.commit(ActionKind::Deselect, selection);
        }
        Ok(())
    }

    /// Clear the selection. Returns false if it was already empty.
    pub fn clear_selection(&mut self) -> bool {
        if self.selection.is_empty() {
            return false;
        }
        self.commit(ActionKind::Clear, Vec::new());
        true
    }

    /// Snap `point` against the grid, guides and nearby indexed elements.
    pub fn snap_pointer(&mut self, point: Point) -> SnapResult {
        let reach = self.snapping.config().snap_distance;
        // Extended edges can align from afar, so gather both bands through
        // the pointer rather than a box around it.
        let rows = Rect::new(f64::MIN, point.y - reach, f64::MAX, point.y + reach);
        let columns = Rect::new(point.x - reach, f64::MIN, point.x + reach, f64::MAX);
        let mut seen = HashSet::new();
        let nearby: Vec<Rect> = self
            .optimizer
            .elements_in_rect(rows)
            .into_iter()
            .chain(self.optimizer.elements_in_rect(columns))
            .filter(|b| seen.insert(b.id))
            .map(|b| b.rect)
            .collect();
        self.snapping.snap(point, &nearby)
    }

    /// Start a marquee drag at `point` (snapped). Cancels a drag in progress.
    pub fn begin_drag(&mut self, point: Point) -> Point {
        self.cancel_drag();
        let checkpoint = self.snapping.checkpoint();
        let origin = self.snap_pointer(point).point;
        self.drag = Some(DragState {
            origin,
            current: origin,
            checkpoint,
        });
        origin
    }

    /// Move the drag to `point` (snapped) and return the marquee.
    pub fn update_drag(&mut self, point: Point) -> Option<Rect> {
        self.drag.as_ref()?;
        let snapped = self.snap_pointer(point).point;
        let drag = self.drag.as_mut()?;
        drag.current = snapped;
        Some(drag.marquee())
    }

    /// Current marquee, if dragging.
    pub fn drag_rect(&self) -> Option<Rect> {
        self.drag.as_ref().map(DragState::marquee)
    }

    /// Select the elements inside the marquee, topmost first. With
    /// `additive` they are added to the current selection.
    pub fn finish_drag(&mut self, additive: bool) -> Option<ActionKind> {
        let drag = self.drag.take()?;
        let mut hits = self.optimizer.find_in_rect(drag.marquee());
        let optimizer = &self.optimizer;
        hits.sort_by_key(|&id| Reverse(optimizer.element(id).map_or(i32::MIN, |b| b.z_order)));

        let mut selection = if additive { self.selection.clone() } else { Vec::new() };
        for id in hits {
            if !selection.contains(&id) {
                selection.push(id);
            }
        }
        if selection == self.selection {
            return None;
        }
        self.commit(ActionKind::MultiSelect, selection);
        Some(ActionKind::MultiSelect)
    }

    /// Abort a drag. Snaps made during the drag are forgotten and the snap
    /// cache is emptied. Returns false if no drag was active.
    pub fn cancel_drag(&mut self) -> bool {
        match self.drag.take() {
            Some(drag) => {
                self.snapping.restore(drag.checkpoint);
                log::debug!("Drag cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_dragging(&self) -> bool {
        self.drag.is_some()
    }

    fn restore_current(&mut self) -> Option<Vec<ElementId>> {
        let action = self.history.current()?;
        let optimizer = &self.optimizer;
        let selection: Vec<ElementId> = action
            .selection
            .iter()
            .copied()
            .filter(|&id| optimizer.contains(id))
            .collect();
        let index = usize::try_from(self.history.current_index()).ok()?;
        self.selection = selection.clone();
        self.publish(SelectionEvent::Restored {
            index,
            selection: selection.clone(),
        });
        Some(selection)
    }

    /// Step back and restore the previous selection.
    pub fn undo(&mut self) -> Option<Vec<ElementId>> {
        self.cancel_drag();
        self.history.undo()?;
        self.restore_current()
    }

    /// Step forward and restore the next selection.
    pub fn redo(&mut self) -> Option<Vec<ElementId>> {
        self.cancel_drag();
        self.history.redo()?;
        self.restore_current()
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn history_summary(&self) -> Vec<HistorySummaryEntry> {
        self.history.history_summary()
    }

    pub fn export_history(&self, path: impl AsRef<Path>) -> Result<()> {
        self.history.export_history(path)
    }

    /// Load a history export and restore its current selection.
    pub fn import_history(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.cancel_drag();
        self.history.import_history(path)?;
        self.restore_current();
        Ok(())
    }

    pub fn metrics(&self) -> HitTestMetrics {
        self.optimizer.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn record(x0: f64, y0: f64, x1: f64, y1: f64, z: i32) -> ElementRecord {
        ElementRecord::new(Rect::new(x0, y0, x1, y1), "block", z)
    }

    struct Fixture {
        session: SelectionToolCoordinator,
        a: ElementRecord,
        b: ElementRecord,
        c: ElementRecord,
        events: Arc<Mutex<Vec<SelectionEvent>>>,
    }

    fn fixture() -> Fixture {
        let a = record(0.0, 0.0, 10.0, 10.0, 1);
        let b = record(5.0, 5.0, 15.0, 15.0, 2);
        let c = record(100.0, 100.0, 110.0, 110.0, 0);
        let mut session = SelectionToolCoordinator::default();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        session.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        session.activate_tool("select", &[a.clone(), b.clone(), c.clone()]);
        events.lock().unwrap().clear();
        Fixture {
            session,
            a,
            b,
            c,
            events,
        }
    }

    #[test]
    fn test_activation_records_tool_change() {
        let f = fixture();
        assert_eq!(f.session.tool(), "select");
        assert_eq!(f.session.optimizer().len(), 3);
        let current = f.session.history().current().unwrap();
        assert_eq!(current.kind, ActionKind::ToolChange);
        assert_eq!(current.tool, "select");
        assert_eq!(
            current.metadata.get("session").and_then(|v| v.as_str()),
            Some(f.session.session_id().to_string().as_str())
        );
    }

    #[test]
    fn test_click_selects_topmost() {
        let mut f = fixture();
        assert_eq!(f.session.click(Point::new(6.0, 6.0), 0.0, false), Some(ActionKind::Select));
        assert_eq!(f.session.selection(), [f.b.id]);

        let events = f.events.lock().unwrap();
        assert_eq!(
            *events,
            vec![SelectionEvent::SelectionChanged {
                kind: ActionKind::Select,
                selection: vec![f.b.id],
            }]
        );
        assert_eq!(f.session.history().len(), 2);
    }

    #[test]
    fn test_additive_click_toggles() {
        let mut f = fixture();
        f.session.click(Point::new(1.0, 1.0), 0.0, false);
        assert_eq!(f.session.click(Point::new(105.0, 105.0), 0.0, true), Some(ActionKind::Select));
        assert_eq!(f.session.selection(), [f.a.id, f.c.id]);
        assert_eq!(f.session.click(Point::new(1.0, 1.0), 0.0, true), Some(ActionKind::Deselect));
        assert_eq!(f.session.selection(), [f.c.id]);
    }

    #[test]
    fn test_miss_clears_only_when_something_selected() {
        let mut f = fixture();
        let recorded = f.session.history().len();
        assert_eq!(f.session.click(Point::new(50.0, 50.0), 0.0, false), None);
        assert_eq!(f.session.history().len(), recorded);

        f.session.click(Point::new(1.0, 1.0), 0.0, false);
        assert_eq!(f.session.click(Point::new(50.0, 50.0), 0.0, false), Some(ActionKind::Clear));
        assert!(f.session.selection().is_empty());
        assert_eq!(f.session.click(Point::new(50.0, 50.0), 0.0, true), None);
    }

    #[test]
    fn test_repeated_click_records_once() {
        let mut f = fixture();
        f.session.click(Point::new(1.0, 1.0), 0.0, false);
        let recorded = f.session.history().len();
        assert_eq!(f.session.click(Point::new(2.0, 2.0), 0.0, false), None);
        assert_eq!(f.session.history().len(), recorded);
    }

    #[test]
    fn test_select_unknown_id_fails_without_recording() {
        let mut f = fixture();
        let recorded = f.session.history().len();
        let unknown = Uuid::new_v4();
        let err = f.session.select(&[f.a.id, unknown]).unwrap_err();
        assert!(matches!(err, SelectionError::UnknownElementId(id) if id == unknown));
        assert!(f.session.selection().is_empty());
        assert_eq!(f.session.history().len(), recorded);
        assert!(f.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_select_and_deselect() {
        let mut f = fixture();
        f.session.select(&[f.a.id, f.b.id, f.a.id]).unwrap();
        assert_eq!(f.session.selection(), [f.a.id, f.b.id]);
        assert_eq!(f.session.history().current().unwrap().kind, ActionKind::MultiSelect);

        f.session.deselect(&[f.a.id]).unwrap();
        assert_eq!(f.session.selection(), [f.b.id]);
        assert_eq!(f.session.history().current().unwrap().kind, ActionKind::Deselect);

        assert!(f.session.clear_selection());
        assert!(!f.session.clear_selection());
    }

    #[test]
    fn test_drag_selects_marquee() {
        let mut f = fixture();
        // The left edge line of `a` (3 away) beats the grid corner (about 4.2).
        assert_eq!(f.session.begin_drag(Point::new(-3.0, -3.0)), Point::new(0.0, -3.0));
        let marquee = f.session.update_drag(Point::new(13.0, 13.0)).unwrap();
        assert_eq!(marquee.x0, 0.0);
        assert!(marquee.x1 >= 10.0);

        assert_eq!(f.session.finish_drag(false), Some(ActionKind::MultiSelect));
        assert_eq!(f.session.selection(), [f.b.id, f.a.id]);
        assert!(!f.session.is_dragging());
    }

    #[test]
    fn test_cancel_drag_leaves_no_trace() {
        let mut f = fixture();
        let recorded = f.session.history().len();
        let recent = f.session.snapping().recent_snaps().count();
        let elements = f.session.optimizer().len();

        f.session.begin_drag(Point::new(1.0, 1.0));
        f.session.update_drag(Point::new(39.0, 39.0));
        assert!(f.session.cancel_drag());

        assert_eq!(f.session.history().len(), recorded);
        assert_eq!(f.session.snapping().recent_snaps().count(), recent);
        assert_eq!(f.session.snapping().cache_len(), 0);
        assert_eq!(f.session.optimizer().len(), elements);
        assert!(f.session.selection().is_empty());
        assert!(f.session.finish_drag(false).is_none());
        assert!(!f.session.cancel_drag());
    }

    #[test]
    fn test_snap_pointer_uses_nearby_elements() {
        let mut f = fixture();
        let result = f.session.snap_pointer(Point::new(108.0, 103.0));
        assert_eq!(result.provenance, crate::snap::SnapProvenance::Element);
        assert_eq!(result.point, Point::new(110.0, 103.0));
    }

    #[test]
    fn test_snap_pointer_aligns_with_distant_edges() {
        let mut f = fixture();
        f.session.snapping_mut().set_config(crate::snap::SnapConfig {
            snap_to_grid: false,
            ..crate::snap::SnapConfig::default()
        });
        let result = f.session.snap_pointer(Point::new(400.0, 108.0));
        assert_eq!(result.provenance, crate::snap::SnapProvenance::Element);
        assert_eq!(result.point, Point::new(400.0, 110.0));
    }

    #[test]
    fn test_undo_redo_restore_selection() {
        let mut f = fixture();
        f.session.click(Point::new(1.0, 1.0), 0.0, false);
        f.session.click(Point::new(105.0, 105.0), 0.0, false);
        f.events.lock().unwrap().clear();

        assert_eq!(f.session.undo(), Some(vec![f.a.id]));
        assert_eq!(f.session.selection(), [f.a.id]);
        assert_eq!(f.session.undo(), Some(vec![]));
        assert!(!f.session.can_undo());
        assert_eq!(f.session.undo(), None);

        assert_eq!(f.session.redo(), Some(vec![f.a.id]));
        assert!(f.session.can_redo());
        let events = f.events.lock().unwrap();
        assert_eq!(
            events.last(),
            Some(&SelectionEvent::Restored {
                index: 1,
                selection: vec![f.a.id],
            })
        );
    }

    #[test]
    fn test_refresh_prunes_selection_without_recording() {
        let mut f = fixture();
        f.session.select(&[f.a.id, f.c.id]).unwrap();
        let recorded = f.session.history().len();

        f.session.refresh_elements(&[f.a.clone(), f.b.clone()]);
        assert_eq!(f.session.selection(), [f.a.id]);
        assert_eq!(f.session.history().len(), recorded);
        assert_eq!(
            f.events.lock().unwrap().last(),
            Some(&SelectionEvent::IndexRebuilt { element_count: 2 })
        );
    }

    #[test]
    fn test_unsubscribe_stops_events() {
        let mut f = fixture();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let id = f.session.subscribe(move |_| *counter.lock().unwrap() += 1);
        f.session.click(Point::new(1.0, 1.0), 0.0, false);
        assert!(f.session.unsubscribe(id));
        assert!(!f.session.unsubscribe(id));
        f.session.click(Point::new(105.0, 105.0), 0.0, false);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_history_export_import_restores_selection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let mut f = fixture();
        f.session.select(&[f.a.id, f.b.id]).unwrap();
        f.session.export_history(&path).unwrap();

        let mut other = SelectionToolCoordinator::default();
        other.activate_tool("select", &[f.a.clone(), f.b.clone()]);
        other.import_history(&path).unwrap();
        let restored: HashSet<_> = other.selection().iter().copied().collect();
        assert_eq!(restored, HashSet::from([f.a.id, f.b.id]));
        assert_eq!(other.history_summary().len(), 2);
    }

    #[test]
    fn test_metrics_reflect_queries() {
        let mut f = fixture();
        f.session.click(Point::new(1.0, 1.0), 0.0, false);
        f.session.click(Point::new(1.0, 1.0), 0.0, false);
        let metrics = f.session.metrics();
        assert_eq!(metrics.element_count, 3);
        assert_eq!(metrics.query_count, 2);
        assert!(metrics.cache_hit_ratio > 0.0);
    }
}
