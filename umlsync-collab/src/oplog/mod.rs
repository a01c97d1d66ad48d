//! Append-only operation history, indexed per diagram.
//!
//! ```text
//!   entries:  id ──────────────► Arc<LogEntry>      (flat index)
//!   diagrams: diagram ─► seq ──► Arc<LogEntry>      (ordered, per diagram)
//!                      └► version counter, next sequence, pruned watermark
//!   batches:  id ──────────────► Arc<OperationBatch>
//! ```
//!
//! Entries are ordered by their diagram-local sequence number, never by wall
//! clock. Retention prunes both indices together; the version counter is
//! never reset.

mod query;
mod rollback;

pub use query::{GlobalStats, LogSummary, OperationQuery, VersionInfo};
pub use rollback::ROLLBACK_CLIENT;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use umlsync_core::{now_millis, ApplyError, ChangeRecord, PatchOperation};
use uuid::Uuid;

/// Identifier of one diagram.
pub type DiagramId = Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogError {
    #[error("version {version} for diagram {diagram_id} is not after current version {current}")]
    VersionRegression {
        diagram_id: DiagramId,
        version: u64,
        current: u64,
    },
    #[error("history of diagram {diagram_id} before version {version} has been pruned")]
    HistoryPruned { diagram_id: DiagramId, version: u64 },
    #[error("operation #{sequence} cannot be reversed: no change record")]
    IrreversibleOperation { sequence: u64 },
    #[error("invalid version range {from}..={to}")]
    InvalidRange { from: u64, to: u64 },
    #[error("batch contains no operations")]
    EmptyBatch,
    #[error("batch entries must belong to diagram {0}")]
    MixedBatch(DiagramId),
    #[error("batch versions must be contiguous: expected {expected}, found {found}")]
    NonContiguousBatch { expected: u64, found: u64 },
    #[error("replay of operation #{sequence} failed: {source}")]
    Replay {
        sequence: u64,
        #[source]
        source: ApplyError,
    },
}

/// A committed operation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: Uuid,
    pub diagram_id: DiagramId,
    pub operation: PatchOperation,
    pub user_id: String,
    pub client_id: String,
    /// Position within this diagram's history, starting at 1.
    pub diagram_sequence_number: u64,
    pub resulting_version: u64,
    /// Milliseconds since epoch.
    pub recorded_at: u64,
    /// What the operation overwrote, captured at commit time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<ChangeRecord>,
}

/// Input for [`OperationLog::add_operation`].
#[derive(Debug, Clone)]
pub struct OperationInput {
    pub diagram_id: DiagramId,
    pub operation: PatchOperation,
    pub user_id: String,
    pub client_id: String,
    /// Version produced by the operation; `None` means current + 1.
    pub resulting_version: Option<u64>,
    pub change: Option<ChangeRecord>,
}

impl OperationInput {
    pub fn new(diagram_id: DiagramId, operation: PatchOperation, user_id: impl Into<String>) -> Self {
        Self {
            diagram_id,
            client_id: operation.client_id.clone(),
            operation,
            user_id: user_id.into(),
            resulting_version: None,
            change: None,
        }
    }

    pub fn at_version(mut self, version: u64) -> Self {
        self.resulting_version = Some(version);
        self
    }

    pub fn with_change(mut self, change: ChangeRecord) -> Self {
        self.change = Some(change);
        self
    }
}

/// An ordered group of entries committed together.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationBatch {
    pub id: Uuid,
    pub diagram_id: DiagramId,
    pub user_id: String,
    pub reason: String,
    pub batch_timestamp: u64,
    pub entries: Vec<Arc<LogEntry>>,
}

/// Input for [`OperationLog::add_batch`].
#[derive(Debug, Clone)]
pub struct BatchInput {
    pub diagram_id: DiagramId,
    pub user_id: String,
    pub reason: String,
    pub operations: Vec<OperationInput>,
}

/// How much history [`OperationLog::cleanup`] keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// The most recent N entries.
    KeepLast(usize),
    /// Entries whose resulting version is within the last K versions.
    KeepVersions(u64),
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::KeepLast(100)
    }
}

#[derive(Debug, Default)]
struct DiagramHistory {
    by_sequence: BTreeMap<u64, Arc<LogEntry>>,
    version: u64,
    last_sequence: u64,
    /// Highest version whose entry is no longer available.
    pruned_through: u64,
}

/// Operation history for any number of diagrams.
#[derive(Debug, Default)]
pub struct OperationLog {
    entries: HashMap<Uuid, Arc<LogEntry>>,
    diagrams: HashMap<DiagramId, DiagramHistory>,
    batches: HashMap<Uuid, Arc<OperationBatch>>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a diagram whose history before `version` is unknown,
    /// for example one restored from a snapshot.
    pub fn start_at(&mut self, diagram_id: DiagramId, version: u64) {
        let history = self.diagrams.entry(diagram_id).or_default();
        history.version = history.version.max(version);
        history.pruned_through = history.pruned_through.max(version);
    }

    pub fn current_version(&self, diagram_id: DiagramId) -> u64 {
        self.diagrams.get(&diagram_id).map_or(0, |h| h.version)
    }

    /// Highest version of a diagram whose entry is no longer retained.
    pub fn pruned_through(&self, diagram_id: DiagramId) -> u64 {
        self.diagrams.get(&diagram_id).map_or(0, |h| h.pruned_through)
    }

    /// Append one committed operation.
    pub fn add_operation(&mut self, input: OperationInput) -> Result<Arc<LogEntry>, LogError> {
        let current = self.current_version(input.diagram_id);
        let version = input.resulting_version.unwrap_or(current + 1);
        if version <= current {
            return Err(LogError::VersionRegression {
                diagram_id: input.diagram_id,
                version,
                current,
            });
        }
        Ok(self.insert(input, version, now_millis()))
    }

    /// Append a group of operations with contiguous versions starting right
    /// after the diagram's current version. Nothing is appended on error.
    pub fn add_batch(&mut self, input: BatchInput) -> Result<Arc<OperationBatch>, LogError> {
        if input.operations.is_empty() {
            return Err(LogError::EmptyBatch);
        }
        if input.operations.iter().any(|op| op.diagram_id != input.diagram_id) {
            return Err(LogError::MixedBatch(input.diagram_id));
        }

        let current = self.current_version(input.diagram_id);
        let first = input.operations[0].resulting_version.unwrap_or(current + 1);
        if first <= current {
            return Err(LogError::VersionRegression {
                diagram_id: input.diagram_id,
                version: first,
                current,
            });
        }
        for (offset, op) in (0u64..).zip(&input.operations) {
            let expected = first + offset;
            if let Some(found) = op.resulting_version {
                if found != expected {
                    return Err(LogError::NonContiguousBatch { expected, found });
                }
            }
        }

        let timestamp = now_millis();
        let entries = (0u64..)
            .zip(input.operations)
            .map(|(offset, op)| self.insert(op, first + offset, timestamp))
            .collect();

        let batch = Arc::new(OperationBatch {
            id: Uuid::new_v4(),
            diagram_id: input.diagram_id,
            user_id: input.user_id,
            reason: input.reason,
            batch_timestamp: timestamp,
            entries,
        });
        self.batches.insert(batch.id, Arc::clone(&batch));
        Ok(batch)
    }

    fn insert(&mut self, input: OperationInput, version: u64, recorded_at: u64) -> Arc<LogEntry> {
        let history = self.diagrams.entry(input.diagram_id).or_default();
        history.last_sequence += 1;
        history.version = version;

        let entry = Arc::new(LogEntry {
            id: Uuid::new_v4(),
            diagram_id: input.diagram_id,
            operation: input.operation,
            user_id: input.user_id,
            client_id: input.client_id,
            diagram_sequence_number: history.last_sequence,
            resulting_version: version,
            recorded_at,
            change: input.change,
        });
        history
            .by_sequence
            .insert(entry.diagram_sequence_number, Arc::clone(&entry));
        self.entries.insert(entry.id, Arc::clone(&entry));
        entry
    }

    /// Prune old entries of one diagram. Returns how many were removed.
    pub fn cleanup(&mut self, diagram_id: DiagramId, policy: RetentionPolicy) -> usize {
        let Some(history) = self.diagrams.get_mut(&diagram_id) else {
            return 0;
        };

        let doomed: Vec<u64> = match policy {
            RetentionPolicy::KeepLast(keep) => {
                let excess = history.by_sequence.len().saturating_sub(keep);
                history.by_sequence.keys().take(excess).copied().collect()
            }
            RetentionPolicy::KeepVersions(keep) => {
                let min_version = history.version.saturating_sub(keep) + 1;
                history
                    .by_sequence
                    .iter()
                    .filter(|(_, e)| e.resulting_version < min_version)
                    .map(|(seq, _)| *seq)
                    .collect()
            }
        };

        for seq in &doomed {
            if let Some(entry) = history.by_sequence.remove(seq) {
                history.pruned_through = history.pruned_through.max(entry.resulting_version);
                self.entries.remove(&entry.id);
            }
        }

        let entries = &self.entries;
        self.batches.retain(|_, batch| {
            batch.diagram_id != diagram_id || batch.entries.iter().any(|e| entries.contains_key(&e.id))
        });

        if !doomed.is_empty() {
            log::debug!(
                "pruned {} log entries of diagram {diagram_id} (through version {})",
                doomed.len(),
                history.pruned_through
            );
        }
        doomed.len()
    }

    fn history(&self, diagram_id: DiagramId) -> Option<&DiagramHistory> {
        self.diagrams.get(&diagram_id)
    }
}
