//! Read-only views over the operation log.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use umlsync_core::OpKind;

use super::{DiagramId, LogEntry, OperationBatch, OperationLog};

/// Per-diagram aggregate, `None` from [`OperationLog::summary`] when empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSummary {
    pub diagram_id: DiagramId,
    pub total_operations: usize,
    pub last_operation_at: u64,
    pub last_user_id: String,
    pub current_version: u64,
    pub operations_by_user: BTreeMap<String, usize>,
    pub operations_by_kind: BTreeMap<OpKind, usize>,
}

/// One row of [`OperationLog::version_history`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: u64,
    pub recorded_at: u64,
    pub entry_id: uuid::Uuid,
}

/// Filter for [`OperationLog::search`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct OperationQuery {
    pub diagram_id: Option<DiagramId>,
    pub user_id: Option<String>,
    pub op: Option<OpKind>,
    /// Inclusive lower bound on `recorded_at`.
    pub from_time: Option<u64>,
    /// Inclusive upper bound on `recorded_at`.
    pub to_time: Option<u64>,
    pub path_contains: Option<String>,
}

impl OperationQuery {
    fn matches(&self, entry: &LogEntry) -> bool {
        self.diagram_id.is_none_or(|d| entry.diagram_id == d)
            && self.user_id.as_deref().is_none_or(|u| entry.user_id == u)
            && self.op.is_none_or(|op| entry.operation.op == op)
            && self.from_time.is_none_or(|t| entry.recorded_at >= t)
            && self.to_time.is_none_or(|t| entry.recorded_at <= t)
            && self
                .path_contains
                .as_deref()
                .is_none_or(|p| entry.operation.path.contains(p))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub total_operations: usize,
    pub total_diagrams: usize,
    pub total_batches: usize,
    pub operations_by_kind: BTreeMap<OpKind, usize>,
    pub operations_by_user: BTreeMap<String, usize>,
    pub versions_by_diagram: BTreeMap<DiagramId, u64>,
    pub average_operations_per_diagram: f64,
    pub average_versions_per_diagram: f64,
}

fn sorted(mut entries: Vec<Arc<LogEntry>>) -> Vec<Arc<LogEntry>> {
    entries.sort_by(|a, b| {
        (a.recorded_at, a.diagram_id, a.diagram_sequence_number)
            .cmp(&(b.recorded_at, b.diagram_id, b.diagram_sequence_number))
    });
    entries
}

impl OperationLog {
    pub(super) fn filtered<F>(&self, diagram_id: DiagramId, keep: F) -> Vec<Arc<LogEntry>>
    where
        F: Fn(&LogEntry) -> bool,
    {
        self.history(diagram_id)
            .map(|h| {
                h.by_sequence
                    .values()
                    .filter(|e| keep(e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All retained entries of a diagram, ascending by sequence number.
    pub fn operations_for_diagram(&self, diagram_id: DiagramId) -> Vec<Arc<LogEntry>> {
        self.filtered(diagram_id, |_| true)
    }

    pub fn operations_up_to_version(&self, diagram_id: DiagramId, version: u64) -> Vec<Arc<LogEntry>> {
        self.filtered(diagram_id, |e| e.resulting_version <= version)
    }

    pub fn operations_since_version(&self, diagram_id: DiagramId, version: u64) -> Vec<Arc<LogEntry>> {
        self.filtered(diagram_id, |e| e.resulting_version > version)
    }

    /// Entries with `from <= sequence` and, if given, `sequence <= to`.
    pub fn operations_in_range(
        &self,
        diagram_id: DiagramId,
        from: u64,
        to: Option<u64>,
    ) -> Vec<Arc<LogEntry>> {
        let Some(history) = self.history(diagram_id) else {
            return Vec::new();
        };
        let upper = to.unwrap_or(u64::MAX);
        if from > upper {
            return Vec::new();
        }
        history
            .by_sequence
            .range(from..=upper)
            .map(|(_, e)| Arc::clone(e))
            .collect()
    }

    pub fn last_operation(&self, diagram_id: DiagramId) -> Option<Arc<LogEntry>> {
        self.history(diagram_id)?
            .by_sequence
            .last_key_value()
            .map(|(_, e)| Arc::clone(e))
    }

    pub fn has_version(&self, diagram_id: DiagramId, version: u64) -> bool {
        self.operation_for_version(diagram_id, version).is_some()
    }

    /// The entry that produced `version`, if still retained.
    pub fn operation_for_version(&self, diagram_id: DiagramId, version: u64) -> Option<Arc<LogEntry>> {
        self.history(diagram_id)?
            .by_sequence
            .values()
            .find(|e| e.resulting_version == version)
            .cloned()
    }

    pub fn version_history(&self, diagram_id: DiagramId) -> Vec<VersionInfo> {
        self.filtered(diagram_id, |_| true)
            .iter()
            .map(|e| VersionInfo {
                version: e.resulting_version,
                recorded_at: e.recorded_at,
                entry_id: e.id,
            })
            .collect()
    }

    pub fn operations_by_user(&self, user_id: &str) -> Vec<Arc<LogEntry>> {
        sorted(
            self.entries
                .values()
                .filter(|e| e.user_id == user_id)
                .cloned()
                .collect(),
        )
    }

    pub fn operations_by_user_in_diagram(&self, user_id: &str, diagram_id: DiagramId) -> Vec<Arc<LogEntry>> {
        self.filtered(diagram_id, |e| e.user_id == user_id)
    }

    pub fn summary(&self, diagram_id: DiagramId) -> Option<LogSummary> {
        let history = self.history(diagram_id)?;
        let (_, last) = history.by_sequence.last_key_value()?;

        let mut operations_by_user = BTreeMap::new();
        let mut operations_by_kind = BTreeMap::new();
        for entry in history.by_sequence.values() {
            *operations_by_user.entry(entry.user_id.clone()).or_insert(0) += 1;
            *operations_by_kind.entry(entry.operation.op).or_insert(0) += 1;
        }

        Some(LogSummary {
            diagram_id,
            total_operations: history.by_sequence.len(),
            last_operation_at: last.recorded_at,
            last_user_id: last.user_id.clone(),
            current_version: history.version,
            operations_by_user,
            operations_by_kind,
        })
    }

    pub fn search(&self, query: &OperationQuery) -> Vec<Arc<LogEntry>> {
        sorted(
            self.entries
                .values()
                .filter(|e| query.matches(e))
                .cloned()
                .collect(),
        )
    }

    pub fn global_stats(&self) -> GlobalStats {
        let mut operations_by_kind = BTreeMap::new();
        let mut operations_by_user = BTreeMap::new();
        for entry in self.entries.values() {
            *operations_by_kind.entry(entry.operation.op).or_insert(0) += 1;
            *operations_by_user.entry(entry.user_id.clone()).or_insert(0) += 1;
        }
        let versions_by_diagram: BTreeMap<DiagramId, u64> = self
            .diagrams
            .iter()
            .map(|(id, h)| (*id, h.version))
            .collect();

        let total_diagrams = self.diagrams.len();
        let average = |total: f64| {
            if total_diagrams == 0 {
                0.0
            } else {
                total / total_diagrams as f64
            }
        };

        GlobalStats {
            total_operations: self.entries.len(),
            total_diagrams,
            total_batches: self.batches.len(),
            average_operations_per_diagram: average(self.entries.len() as f64),
            average_versions_per_diagram: average(versions_by_diagram.values().sum::<u64>() as f64),
            operations_by_kind,
            operations_by_user,
            versions_by_diagram,
        }
    }

    /// Every retained entry across diagrams.
    pub fn all(&self) -> Vec<Arc<LogEntry>> {
        sorted(self.entries.values().cloned().collect())
    }

    pub fn batches(&self) -> Vec<Arc<OperationBatch>> {
        let mut batches: Vec<Arc<OperationBatch>> = self.batches.values().cloned().collect();
        batches.sort_by_key(|b| (b.batch_timestamp, b.entries.first().map(|e| e.diagram_sequence_number)));
        batches
    }
}
