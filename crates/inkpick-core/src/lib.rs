//! InkPick Core Library
//!
//! Interactive spatial selection for document viewers: hit-testing over a
//! spatial index with a point-query cache, magnetic snapping to grid, guides
//! and elements, and a bounded undo/redo log of selection actions.

pub mod config;
pub mod coordinator;
pub mod element;
pub mod error;
pub mod hit_test;
pub mod history;
pub mod index;
pub mod snap;
pub mod storage;

pub use config::{EngineConfig, IndexConfig};
pub use coordinator::{ListenerId, SelectionEvent, SelectionToolCoordinator};
pub use element::{ElementBounds, ElementId, ElementRecord};
pub use error::{IndexError, Result, SelectionError};
pub use hit_test::{HitTestMetrics, HitTestOptimizer, PendingRebuild, RebuildReport, RebuiltIndex};
pub use history::{
    ActionKind, HistoryAction, HistoryConfig, HistoryExport, HistorySummaryEntry, SelectionHistory,
};
pub use index::{BackendKind, IndexMetrics, SpatialIndex};
pub use snap::{
    GRID_SIZE, GuideAxis, GuideId, GuideLine, MagneticSnapping, SnapConfig, SnapProvenance,
    SnapResult, SnapTarget, SnapTargetKind, snap_to_grid,
};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError, StorageHandle};
