//! Inverse operations and state reconstruction by replay.

use serde_json::Value;
use std::sync::Arc;
use umlsync_core::{
    Collection, DiagramState, OpKind, PatchOperation, PatchPath, Relationship,
};

use super::{DiagramId, LogEntry, LogError, OperationLog};

/// `clientId` stamped on generated inverse operations.
pub const ROLLBACK_CLIENT: &str = "rollback";

impl OperationLog {
    /// Operations that take the diagram from version `to` back to version
    /// `from`, newest first.
    ///
    /// Fails if any entry in `(from, to]` was pruned or lacks the change
    /// record needed to reverse it.
    pub fn rollback_operations(
        &self,
        diagram_id: DiagramId,
        from: u64,
        to: u64,
    ) -> Result<Vec<PatchOperation>, LogError> {
        let current = self.current_version(diagram_id);
        if from > to || to > current {
            return Err(LogError::InvalidRange { from, to });
        }
        let pruned_through = self.pruned_through(diagram_id);
        if from < pruned_through {
            return Err(LogError::HistoryPruned {
                diagram_id,
                version: pruned_through,
            });
        }

        let entries = self.filtered(diagram_id, |e| e.resulting_version > from && e.resulting_version <= to);
        let mut inverse = Vec::new();
        for entry in entries.iter().rev() {
            inverse.extend(inverse_of(entry)?);
        }
        Ok(inverse)
    }

    /// Rebuild the diagram as it was at `version` by replaying history onto
    /// an empty diagram.
    pub fn reconstruct_state(&self, diagram_id: DiagramId, version: u64) -> Result<DiagramState, LogError> {
        let mut state = DiagramState::new();
        state.last_modified_at = 0;
        self.replay_onto(diagram_id, state, version)
    }

    /// Bring an older snapshot of a diagram up to the log's current version.
    pub fn catch_up(&self, diagram_id: DiagramId, state: DiagramState) -> Result<DiagramState, LogError> {
        let current = self.current_version(diagram_id);
        self.replay_onto(diagram_id, state, current)
    }

    fn replay_onto(&self, diagram_id: DiagramId, mut state: DiagramState, version: u64) -> Result<DiagramState, LogError> {
        if version < state.version || version > self.current_version(diagram_id) {
            return Err(LogError::InvalidRange {
                from: state.version,
                to: version,
            });
        }
        let pruned_through = self.pruned_through(diagram_id);
        if pruned_through > state.version {
            return Err(LogError::HistoryPruned {
                diagram_id,
                version: pruned_through,
            });
        }

        let from = state.version;
        let entries = self.filtered(diagram_id, |e| e.resulting_version > from && e.resulting_version <= version);
        for entry in entries {
            state
                .apply_patch(&entry.operation)
                .map_err(|source| LogError::Replay {
                    sequence: entry.diagram_sequence_number,
                    source,
                })?;
            state.version = entry.resulting_version;
            state.last_modified_at = entry.recorded_at;
        }
        Ok(state)
    }
}

fn inverse_op(kind: OpKind, path: String, value: Option<Value>, entry: &LogEntry) -> PatchOperation {
    let base = match kind {
        OpKind::Remove => PatchOperation::remove(path),
        OpKind::Add => PatchOperation::add(path, value.unwrap_or(Value::Null)),
        _ => PatchOperation::replace(path, value.unwrap_or(Value::Null)),
    };
    base.with_client(ROLLBACK_CLIENT, entry.diagram_sequence_number)
        .with_description(format!(
            "revert #{} ({} {})",
            entry.diagram_sequence_number, entry.operation.op, entry.operation.path
        ))
}

/// Operations undoing one entry, in the order they must be applied.
fn inverse_of(entry: &Arc<LogEntry>) -> Result<Vec<PatchOperation>, LogError> {
    let irreversible = || LogError::IrreversibleOperation {
        sequence: entry.diagram_sequence_number,
    };
    let op = &entry.operation;

    let Some(change) = &entry.change else {
        // Without a change record only a whole-entity add can be undone.
        let path = PatchPath::parse(&op.path).map_err(|_| irreversible())?;
        return match (op.op, path.is_entity(), path.id()) {
            (OpKind::Add, true, Some(_)) => Ok(vec![inverse_op(OpKind::Remove, op.path.clone(), None, entry)]),
            (OpKind::Test, _, _) => Ok(Vec::new()),
            _ => Err(irreversible()),
        };
    };

    let path = PatchPath::parse(&change.path).map_err(|_| irreversible())?;
    let restore = |value: &Option<Value>| -> Result<PatchOperation, LogError> {
        let previous = value.clone().ok_or_else(irreversible)?;
        Ok(inverse_op(OpKind::Replace, change.path.clone(), Some(previous), entry))
    };

    let ops = match op.op {
        OpKind::Test => Vec::new(),
        OpKind::Add | OpKind::Copy if path.is_entity() => {
            vec![inverse_op(OpKind::Remove, change.path.clone(), None, entry)]
        }
        OpKind::Add | OpKind::Copy | OpKind::Replace => vec![restore(&change.previous)?],
        OpKind::Remove if path.is_entity() => {
            let previous = change.previous.clone().ok_or_else(irreversible)?;
            let mut ops = vec![inverse_op(OpKind::Add, change.path.clone(), Some(previous), entry)];
            ops.extend(change.detached_relationships.iter().map(|rel| restore_relationship(rel, entry)));
            ops
        }
        OpKind::Remove => vec![restore(&change.previous)?],
        OpKind::Move => {
            let from = change.from.clone().ok_or_else(irreversible)?;
            vec![PatchOperation::move_from(change.path.clone(), from)
                .with_client(ROLLBACK_CLIENT, entry.diagram_sequence_number)
                .with_description(format!("revert #{} (move)", entry.diagram_sequence_number))]
        }
    };
    Ok(ops)
}

fn restore_relationship(rel: &Relationship, entry: &LogEntry) -> PatchOperation {
    let path = PatchPath::entity(Collection::Relationships, &rel.id).to_string();
    let value = serde_json::to_value(rel).unwrap_or(Value::Null);
    inverse_op(OpKind::Add, path, Some(value), entry)
}
