//! Linear undo/redo log of selection actions.
//!
//! The log is a list with a cursor pointing at the current action. Recording
//! after an undo discards everything past the cursor. The log is bounded by
//! entry count and by an estimate of its serialized size; crossing the size
//! limit thins out the older part of the log.

use crate::element::{ElementId, now_millis};
use crate::error::{Result, SelectionError};
use crate::storage::{FileStorage, Storage, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::path::Path;

/// Maximum number of history entries kept by default.
const MAX_HISTORY: usize = 50;

/// Version written into, and required from, history exports.
pub const EXPORT_VERSION: u32 = 1;

/// What a history entry did to the selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Select,
    Deselect,
    MultiSelect,
    Clear,
    ToolChange,
}

/// A committed selection action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryAction {
    pub kind: ActionKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Selection after the action, in selection order.
    pub selection: Vec<ElementId>,
    /// Tool that produced the action.
    pub tool: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl HistoryAction {
    /// Create an action stamped with the current time.
    pub fn new(kind: ActionKind, selection: Vec<ElementId>, tool: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp_ms: now_millis(),
            selection,
            tool: tool.into(),
            metadata: Map::new(),
        }
    }

    /// Attach a metadata value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Length of the JSON encoding, used as the memory estimate.
    fn encoded_size(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |bytes| bytes.len())
    }
}

/// Bounds applied to a [`SelectionHistory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum entries. Zero is treated as one.
    pub max_history: usize,
    /// Estimated byte size above which older entries are thinned out.
    pub memory_limit_bytes: usize,
    /// Most recent entries never touched by compression.
    pub keep_recent: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_history: MAX_HISTORY,
            memory_limit_bytes: 512 * 1024,
            keep_recent: 20,
        }
    }
}

/// One row of [`SelectionHistory::history_summary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySummaryEntry {
    pub index: usize,
    pub kind: ActionKind,
    pub tool: String,
    pub timestamp_ms: u64,
    pub is_current: bool,
}

/// Versioned export document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryExport {
    pub version: u32,
    pub exported_at: u64,
    pub history: Vec<HistoryAction>,
    /// Cursor position; -1 for an empty history.
    pub current_index: i64,
}

#[derive(Debug, Clone)]
struct Entry {
    action: HistoryAction,
    size: usize,
}

impl Entry {
    fn new(action: HistoryAction) -> Self {
        let size = action.encoded_size();
        Self { action, size }
    }
}

/// Cursor-addressed selection history.
#[derive(Debug, Clone, Default)]
pub struct SelectionHistory {
    config: HistoryConfig,
    entries: VecDeque<Entry>,
    /// `None` exactly when `entries` is empty.
    cursor: Option<usize>,
    memory_bytes: usize,
}

impl SelectionHistory {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Append an action after the cursor, discarding any redo tail.
    pub fn record(&mut self, action: HistoryAction) {
        let keep = self.cursor.map_or(0, |c| c + 1);
        while self.entries.len() > keep {
            if let Some(dropped) = self.entries.pop_back() {
                self.memory_bytes -= dropped.size;
            }
        }

        let entry = Entry::new(action);
        self.memory_bytes += entry.size;
        self.entries.push_back(entry);
        self.cursor = Some(self.entries.len() - 1);

        self.enforce_capacity();
        if self.memory_bytes > self.config.memory_limit_bytes {
            self.compress();
        }
    }

    fn enforce_capacity(&mut self) {
        let max = self.config.max_history.max(1);
        while self.entries.len() > max {
            if let Some(dropped) = self.entries.pop_front() {
                self.memory_bytes -= dropped.size;
            }
            self.cursor = self.cursor.map(|c| c.saturating_sub(1));
        }
    }

    /// Drop every other entry of the part older than the `keep_recent`
    /// newest entries. The oldest entry and the current entry always survive.
    fn compress(&mut self) {
        let len = self.entries.len();
        let older = len.saturating_sub(self.config.keep_recent);
        if older < 2 {
            return;
        }

        let before = self.memory_bytes;
        let mut kept = VecDeque::with_capacity(len);
        let mut cursor = None;
        for (i, entry) in std::mem::take(&mut self.entries).into_iter().enumerate() {
            let is_current = self.cursor == Some(i);
            if i >= older || i % 2 == 0 || is_current {
                if is_current {
                    cursor = Some(kept.len());
                }
                kept.push_back(entry);
            } else {
                self.memory_bytes -= entry.size;
            }
        }
        self.entries = kept;
        self.cursor = cursor;
        log::debug!(
            "Compressed selection history: {} -> {} entries, {} -> {} bytes",
            len,
            self.entries.len(),
            before,
            self.memory_bytes
        );
    }

    /// Step back one action and return the new current action.
    pub fn undo(&mut self) -> Option<&HistoryAction> {
        match self.cursor {
            Some(c) if c > 0 => {
                self.cursor = Some(c - 1);
                self.current()
            }
            _ => None,
        }
    }

    /// Step forward one action and return the new current action.
    pub fn redo(&mut self) -> Option<&HistoryAction> {
        match self.cursor {
            Some(c) if c + 1 < self.entries.len() => {
                self.cursor = Some(c + 1);
                self.current()
            }
            _ => None,
        }
    }

    pub fn can_undo(&self) -> bool {
        self.cursor.is_some_and(|c| c > 0)
    }

    pub fn can_redo(&self) -> bool {
        self.cursor.is_some_and(|c| c + 1 < self.entries.len())
    }

    /// The action under the cursor.
    pub fn current(&self) -> Option<&HistoryAction> {
        self.cursor
            .and_then(|c| self.entries.get(c))
            .map(|e| &e.action)
    }

    /// Cursor position, -1 when empty.
    pub fn current_index(&self) -> isize {
        self.cursor.map_or(-1, |c| c as isize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Actions from oldest to newest.
    pub fn actions(&self) -> impl Iterator<Item = &HistoryAction> {
        self.entries.iter().map(|e| &e.action)
    }

    /// Estimated serialized size of the log.
    pub fn memory_usage_bytes(&self) -> usize {
        self.memory_bytes
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = None;
        self.memory_bytes = 0;
    }

    pub fn history_summary(&self) -> Vec<HistorySummaryEntry> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, e)| HistorySummaryEntry {
                index,
                kind: e.action.kind,
                tool: e.action.tool.clone(),
                timestamp_ms: e.action.timestamp_ms,
                is_current: self.cursor == Some(index),
            })
            .collect()
    }

    /// Snapshot of the log in export form.
    pub fn export(&self) -> HistoryExport {
        HistoryExport {
            version: EXPORT_VERSION,
            exported_at: now_millis(),
            history: self.actions().cloned().collect(),
            current_index: self.current_index() as i64,
        }
    }

    /// Write the export JSON under `key`. The storage lease is released on
    /// every path out of this call.
    pub fn export_to(&self, storage: &dyn Storage, key: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.export())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let mut handle = storage.acquire()?;
        handle.write(key, &json)?;
        log::info!("Exported {} history entries to {}", self.len(), key);
        Ok(())
    }

    /// Replace the log with the export stored under `key`. On any failure the
    /// in-memory log is left untouched.
    pub fn import_from(&mut self, storage: &dyn Storage, key: &str) -> Result<()> {
        let json = {
            let handle = storage.acquire()?;
            handle.read(key)?
        };
        self.import_json(&json).inspect_err(|e| {
            log::warn!("Rejected history import from {}: {}", key, e);
        })?;
        log::info!("Imported {} history entries from {}", self.len(), key);
        Ok(())
    }

    /// Write the export to a file, replacing it atomically. Missing parent
    /// directories are created.
    pub fn export_history(&self, path: impl AsRef<Path>) -> Result<()> {
        let (storage, key) = FileStorage::for_path(path.as_ref())?;
        storage.create_dir()?;
        self.export_to(&storage, &key)
    }

    /// Load an export file.
    pub fn import_history(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let (storage, key) = FileStorage::for_path(path.as_ref())?;
        self.import_from(&storage, &key)
    }

    /// Replace the log with a JSON export.
    pub fn import_json(&mut self, json: &str) -> Result<()> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| SelectionError::HistoryCorrupt(e.to_string()))?;
        match value.get("version").and_then(Value::as_u64) {
            Some(v) if v == u64::from(EXPORT_VERSION) => {}
            Some(v) => {
                return Err(SelectionError::HistoryCorrupt(format!(
                    "unsupported export version {}",
                    v
                )));
            }
            None => {
                return Err(SelectionError::HistoryCorrupt(
                    "missing export version".to_string(),
                ));
            }
        }
        let export: HistoryExport = serde_json::from_value(value)
            .map_err(|e| SelectionError::HistoryCorrupt(e.to_string()))?;
        self.import(export)
    }

    /// Replace the log with a parsed export after validating its cursor.
    pub fn import(&mut self, export: HistoryExport) -> Result<()> {
        if export.version != EXPORT_VERSION {
            return Err(SelectionError::HistoryCorrupt(format!(
                "unsupported export version {}",
                export.version
            )));
        }
        let len = export.history.len() as i64;
        let cursor = export.current_index;
        let valid = if len == 0 { cursor == -1 } else { (0..len).contains(&cursor) };
        if !valid {
            return Err(SelectionError::HistoryCorrupt(format!(
                "current_index {} out of range for {} entries",
                cursor, len
            )));
        }

        let mut entries: VecDeque<Entry> = export.history.into_iter().map(Entry::new).collect();
        let mut cursor = usize::try_from(cursor).ok();
        // Trim to capacity around the cursor: oldest entries first, then the
        // redo tail, so the current action always survives.
        let excess = entries.len().saturating_sub(self.config.max_history.max(1));
        if excess > 0 {
            let front = excess.min(cursor.unwrap_or(0));
            entries.drain(..front);
            entries.truncate(entries.len() - (excess - front));
            cursor = cursor.map(|c| c - front);
            log::debug!(
                "Trimmed imported history: {} older and {} redo entries dropped",
                front,
                excess - front
            );
        }

        self.memory_bytes = entries.iter().map(|e| e.size).sum();
        self.cursor = cursor;
        self.entries = entries;
        Ok(())
    }
}
