//! Authoritative state for one diagram.
//!
//! ```text
//!  apply_operation(op)
//!      │
//!      ├─ resolve "/-" append ids
//!      ├─ validate against current snapshot ──► Rejected (no change)
//!      ├─ apply to a copy, version + 1
//!      ├─ swap in new Arc<DiagramState>
//!      └─ notify subscribers (synchronously, new snapshot)
//! ```
//!
//! Mutation takes `&mut self`; the controller wraps the store in a
//! per-diagram mutex so operations are applied strictly one at a time.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use thiserror::Error;
use umlsync_core::{
    now_millis, validate_operation, ChangeRecord, DiagramState, PatchOperation,
};
use uuid::Uuid;

/// Why an operation did not commit.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperationError {
    /// Domain rejection: the client should fix its input.
    #[error("operation rejected: {}", errors.join("; "))]
    Rejected {
        /// Findings that blocked the commit.
        errors: Vec<String>,
        /// Advisory findings collected alongside.
        warnings: Vec<String>,
    },
    /// Internal fault: state is untouched, retrying may help.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OperationError {
    /// Rejection with a single error and no warnings.
    pub fn rejected(error: impl Into<String>) -> Self {
        OperationError::Rejected {
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }

    /// True for client-fixable rejections, false for internal faults.
    pub fn is_rejection(&self) -> bool {
        matches!(self, OperationError::Rejected { .. })
    }
}

/// Result of a committed operation.
#[derive(Debug, Clone)]
pub struct Commit {
    /// Snapshot produced by this commit.
    pub state: Arc<DiagramState>,
    /// The operation as applied (append paths resolved to ids).
    pub operation: PatchOperation,
    /// What the operation added, changed or removed.
    pub change: ChangeRecord,
    /// Advisory validation findings.
    pub warnings: Vec<String>,
}

impl Commit {
    /// Version produced by this commit.
    pub fn version(&self) -> u64 {
        self.state.version
    }
}

type Callback = Arc<dyn Fn(&Arc<DiagramState>) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: HashMap<u64, Callback>,
}

fn lock(registry: &Mutex<Subscribers>) -> MutexGuard<'_, Subscribers> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle returned by [`DiagramStore::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    /// Stop receiving snapshots. Same as dropping the handle.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).callbacks.remove(&self.id);
        }
    }
}

/// Owns the canonical [`DiagramState`] of one diagram.
pub struct DiagramStore {
    state: Arc<DiagramState>,
    subscribers: Arc<Mutex<Subscribers>>,
}

impl Default for DiagramStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagramStore {
    /// Empty diagram at version 0.
    pub fn new() -> Self {
        Self::from_state(DiagramState::new())
    }

    /// Resume from a previously saved state.
    pub fn from_state(state: DiagramState) -> Self {
        Self {
            state: Arc::new(state),
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
        }
    }

    /// Current immutable snapshot.
    pub fn state(&self) -> Arc<DiagramState> {
        Arc::clone(&self.state)
    }

    /// Version of the current snapshot.
    pub fn version(&self) -> u64 {
        self.state.version
    }

    /// Register `callback` to receive every new snapshot after a commit.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<DiagramState>) + Send + Sync + 'static,
    {
        let mut subscribers = lock(&self.subscribers);
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.callbacks.insert(id, Arc::new(callback));
        Subscription {
            id,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).callbacks.len()
    }

    /// Validate and commit one operation.
    pub fn apply_operation(&mut self, operation: PatchOperation) -> Result<Commit, OperationError> {
        let operation = operation.resolve_append(|| Uuid::new_v4().to_string());
        let result = validate_operation(&operation, &self.state);
        if !result.valid {
            log::warn!(
                "rejected {} {} from {}: {}",
                operation.op,
                operation.path,
                operation.client_id,
                result.errors.join("; ")
            );
            return Err(OperationError::Rejected {
                errors: result.errors,
                warnings: result.warnings,
            });
        }
        self.commit(operation, result.warnings)
    }

    /// Validate every operation in order against a scratch copy, then
    /// commit them all. Nothing is committed if any one is invalid.
    pub fn apply_batch(
        &mut self,
        operations: Vec<PatchOperation>,
    ) -> Result<Vec<Commit>, OperationError> {
        let operations: Vec<PatchOperation> = operations
            .into_iter()
            .map(|op| op.resolve_append(|| Uuid::new_v4().to_string()))
            .collect();

        let mut scratch = (*self.state).clone();
        let mut warnings = Vec::with_capacity(operations.len());
        for (index, operation) in operations.iter().enumerate() {
            let result = validate_operation(operation, &scratch);
            if !result.valid {
                log::warn!(
                    "rejected batch at operation {index} ({} {})",
                    operation.op,
                    operation.path
                );
                return Err(OperationError::Rejected {
                    errors: result
                        .errors
                        .into_iter()
                        .map(|e| format!("operation {index}: {e}"))
                        .collect(),
                    warnings: result.warnings,
                });
            }
            scratch
                .apply_patch(operation)
                .map_err(|e| internal(operation, e))?;
            warnings.push(result.warnings);
        }

        operations
            .into_iter()
            .zip(warnings)
            .map(|(operation, warnings)| self.commit(operation, warnings))
            .collect()
    }

    fn commit(
        &mut self,
        operation: PatchOperation,
        warnings: Vec<String>,
    ) -> Result<Commit, OperationError> {
        let mut next = (*self.state).clone();
        let change = apply_guarded(&mut next, &operation)?;
        next.version = self
            .state
            .version
            .checked_add(1)
            .ok_or_else(|| OperationError::Internal("version counter overflow".into()))?;
        next.last_modified_at = now_millis().max(self.state.last_modified_at);

        let next = Arc::new(next);
        self.state = Arc::clone(&next);
        self.notify(&next);

        Ok(Commit {
            state: next,
            operation,
            change,
            warnings,
        })
    }

    fn notify(&self, state: &Arc<DiagramState>) {
        // Callbacks run outside the registry lock so they may subscribe.
        let callbacks: Vec<Callback> = lock(&self.subscribers).callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(state);
        }
    }
}

/// Apply to the working copy, turning a panic into an internal fault.
/// Only effective in builds that unwind.
fn apply_guarded(
    next: &mut DiagramState,
    operation: &PatchOperation,
) -> Result<ChangeRecord, OperationError> {
    match panic::catch_unwind(AssertUnwindSafe(|| next.apply_patch(operation))) {
        Ok(result) => result.map_err(|e| internal(operation, e)),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(internal(operation, format_args!("panicked: {message}")))
        }
    }
}

fn internal(operation: &PatchOperation, error: impl std::fmt::Display) -> OperationError {
    log::error!(
        "failed to apply validated {} {}: {error}",
        operation.op,
        operation.path
    );
    OperationError::Internal(format!("could not apply {}: {error}", operation.path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn add_class(id: &str, name: &str) -> PatchOperation {
        PatchOperation::add(
            format!("/elements/{id}"),
            json!({"displayName": name, "kind": "class"}),
        )
        .with_client("client-1", 1)
    }

    #[test]
    fn test_commit_bumps_version() {
        let mut store = DiagramStore::new();
        let commit = store.apply_operation(add_class("c1", "Person")).unwrap();

        assert_eq!(commit.version(), 1);
        assert_eq!(store.version(), 1);
        assert!(store.state().element("c1").is_some());
    }

    #[test]
    fn test_rejection_leaves_state_untouched() {
        let mut store = DiagramStore::new();
        store.apply_operation(add_class("c1", "Person")).unwrap();
        let before = store.state();

        let err = store.apply_operation(add_class("c1", "Again")).unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(store.version(), 1);
        assert_eq!(*store.state(), *before);
    }

    #[test]
    fn test_append_resolves_generated_id() {
        let mut store = DiagramStore::new();
        let op = PatchOperation::add("/elements/-", json!({"displayName": "Anon", "kind": "note"}))
            .with_client("client-1", 1);
        let commit = store.apply_operation(op).unwrap();

        let id = commit.operation.path.trim_start_matches("/elements/").to_owned();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(store.state().element(&id).unwrap().id, id);
    }

    #[test]
    fn test_passing_test_op_consumes_version() {
        let mut store = DiagramStore::new();
        store.apply_operation(add_class("c1", "Person")).unwrap();
        let op = PatchOperation::test("/elements/c1/displayName", json!("Person")).with_client("c", 2);
        let commit = store.apply_operation(op).unwrap();
        assert_eq!(commit.version(), 2);
    }

    #[test]
    fn test_subscribers_see_new_snapshot() {
        let mut store = DiagramStore::new();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);
        let _sub = store.subscribe(move |state| {
            seen_clone.store(state.version, Ordering::SeqCst);
        });

        store.apply_operation(add_class("c1", "Person")).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let _ = store.apply_operation(add_class("c1", "Person"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_and_drop() {
        let mut store = DiagramStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&calls);
        let explicit = store.subscribe(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&calls);
        let scoped = store.subscribe(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(store.subscriber_count(), 2);

        explicit.unsubscribe();
        drop(scoped);
        assert_eq!(store.subscriber_count(), 0);

        store.apply_operation(add_class("c1", "Person")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_batch_all_or_nothing() {
        let mut store = DiagramStore::new();
        let err = store
            .apply_batch(vec![add_class("a", "A"), add_class("b", "B"), add_class("a", "Dup")])
            .unwrap_err();

        match err {
            OperationError::Rejected { errors, .. } => {
                assert!(errors[0].starts_with("operation 2:"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.version(), 0);
        assert_eq!(store.state().element_count(), 0);
    }

    #[test]
    fn test_batch_validates_against_earlier_ops() {
        let mut store = DiagramStore::new();
        let commits = store
            .apply_batch(vec![
                add_class("a", "A"),
                add_class("b", "B"),
                PatchOperation::add(
                    "/relationships/r1",
                    json!({"sourceId": "a", "targetId": "b", "kind": "association"}),
                )
                .with_client("client-1", 3),
            ])
            .unwrap();

        let versions: Vec<u64> = commits.iter().map(Commit::version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(store.state().relationship_count(), 1);
    }

    #[test]
    fn test_from_state_keeps_version() {
        let mut state = DiagramState::new();
        state.version = 41;
        let mut store = DiagramStore::from_state(state);
        let commit = store.apply_operation(add_class("c1", "Person")).unwrap();
        assert_eq!(commit.version(), 42);
    }
}
