//! Rule Validator.
//!
//! [`validate_operation`] decides whether a patch may commit against a given
//! snapshot. It never touches the snapshot: the operation is trial-applied to
//! a private copy and the resulting entities are checked there.
//!
//! ```text
//!   operation ──► structural checks ──► per-op checks ──► trial apply
//!                                                            │
//!                         entity rules (touched ids) ◄───────┤
//!                         integrity sweep + cycles   ◄───────┘
//! ```
//!
//! Errors make the result invalid; warnings are advisory and ride along with
//! a successful commit.

mod integrity;
mod rules;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::DiagramState;
use crate::patch::{Collection, OpKind, PatchOperation, PatchPath};

pub use integrity::generalization_cycles;

/// Outcome of validating one operation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Error/warning accumulator shared by the rule functions.
#[derive(Debug, Default)]
pub(crate) struct Report {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl Report {
    pub(crate) fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub(crate) fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    fn finish(self) -> ValidationResult {
        ValidationResult {
            valid: self.errors.is_empty(),
            errors: self.errors,
            warnings: self.warnings,
        }
    }
}

/// Validate `operation` against `snapshot`.
///
/// Deterministic: an unresolved append without an id is checked under a
/// fixed placeholder id, so repeated calls yield identical results.
pub fn validate_operation(operation: &PatchOperation, snapshot: &DiagramState) -> ValidationResult {
    let mut report = Report::default();
    let op = operation
        .clone()
        .resolve_append(|| Uuid::nil().to_string());

    if op.client_id.trim().is_empty() {
        report.error("clientId is required");
    }

    let path = match PatchPath::parse(&op.path) {
        Ok(path) => Some(path),
        Err(e) => {
            report.error(e.to_string());
            None
        }
    };
    let from = match (op.op, op.from.as_deref()) {
        (OpKind::Move | OpKind::Copy, None) => {
            report.error(format!("'{}' requires a 'from' path", op.op));
            None
        }
        (OpKind::Move | OpKind::Copy, Some(from)) => match PatchPath::parse(from) {
            Ok(from) => Some(from),
            Err(e) => {
                report.error(format!("invalid 'from': {e}"));
                None
            }
        },
        _ => None,
    };

    let mut trial = None;
    if let Some(path) = &path {
        rules::check_preconditions(&op, path, snapshot, &mut report);

        if !report.has_errors() {
            let mut state = snapshot.clone();
            match state.apply_patch(&op) {
                Ok(_) => {
                    check_touched(&op, path, from.as_ref(), &state, &mut report);
                    trial = Some(state);
                }
                Err(e) => report.error(e.to_string()),
            }
        }
    }

    integrity::sweep(trial.as_ref().unwrap_or(snapshot), &mut report);

    let result = report.finish();
    if !result.valid {
        log::trace!("{} {} invalid: {:?}", op.op, op.path, result.errors);
    }
    result
}

/// Run entity rules on whatever the operation created or changed.
fn check_touched(
    op: &PatchOperation,
    path: &PatchPath,
    from: Option<&PatchPath>,
    state: &DiagramState,
    report: &mut Report,
) {
    if matches!(op.op, OpKind::Remove | OpKind::Test) {
        return;
    }
    // Same-id moves leave the source in place.
    if op.op == OpKind::Move && from.and_then(PatchPath::id) == path.id() {
        return;
    }
    let Some(id) = path.id() else {
        return;
    };

    match path.collection {
        Collection::Elements => {
            if let Some(element) = state.element(id) {
                rules::check_element(element, state, report);
                if op.op == OpKind::Replace && path.is_entity() {
                    for rel in state.relationships_touching(id) {
                        rules::check_relationship(rel, state, report);
                    }
                }
            }
        }
        Collection::Relationships => {
            if let Some(rel) = state.relationship(id) {
                rules::check_relationship(rel, state, report);
            }
        }
    }
}
