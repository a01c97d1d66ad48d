//! Per-diagram synchronization controller.
//!
//! ```text
//!  View ──process_operation──► [store mutex]
//!                                  │ view registered?
//!                                  │ log in step with store?
//!                                  │ DiagramStore::apply_operation ──► Rejected / Internal (caller only)
//!                                  │ OperationLog::add_operation
//!                                  │ BroadcastGroup::broadcast(StateReplaced)
//!                                  └ retention
//!
//!  BroadcastGroup ──► receiver ──► delivery task ──► ViewObserver::notify   (one per view)
//! ```
//!
//! Everything from validation to broadcast happens while the diagram's store
//! mutex is held, so every view sees committed states in version order.
//! Delivery is asynchronous: a slow observer only delays its own task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use umlsync_core::{DiagramState, PatchOperation};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, ViewEvent, ViewInfo};
use crate::oplog::{BatchInput, DiagramId, LogError, OperationInput, OperationLog, RetentionPolicy};
use crate::snapshot::{SnapshotError, SnapshotInfo, SnapshotStore};
use crate::store::{Commit, DiagramStore, OperationError, Subscription};

/// Operation log shared by every controller of a process.
pub type SharedLog = Arc<RwLock<OperationLog>>;

/// `reason` recorded on batches produced by [`SyncController::revert_to_version`].
pub const ROLLBACK_REASON: &str = "rollback";

/// Empty log ready to be shared between controllers.
pub fn shared_log() -> SharedLog {
    Arc::new(RwLock::new(OperationLog::new()))
}

pub(crate) fn read_log(log: &SharedLog) -> RwLockReadGuard<'_, OperationLog> {
    log.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write_log(log: &SharedLog) -> RwLockWriteGuard<'_, OperationLog> {
    log.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Receives events for one registered view.
pub trait ViewObserver: Send + Sync + 'static {
    /// Called from the view's delivery task, in commit order.
    fn notify(&self, event: &ViewEvent);
}

impl<F> ViewObserver for F
where
    F: Fn(&ViewEvent) + Send + Sync + 'static,
{
    fn notify(&self, event: &ViewEvent) {
        self(event)
    }
}

/// Controller tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Per-view event backlog before a slow view starts skipping.
    pub broadcast_capacity: usize,
    /// Log pruning applied after each commit.
    pub retention: Option<RetentionPolicy>,
    /// Save a snapshot whenever the version is a multiple of this.
    pub snapshot_every: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
            retention: None,
            snapshot_every: Some(100),
        }
    }
}

impl ControllerConfig {
    /// Small buffers, no retention, no automatic snapshots.
    pub fn for_testing() -> Self {
        Self {
            broadcast_capacity: 16,
            retention: None,
            snapshot_every: None,
        }
    }
}

/// Returned to the originator of a committed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    /// Diagram version produced by the operation.
    pub version: u64,
    /// Diagram-local log sequence number of the entry.
    pub sequence: u64,
    /// Echo of the submitter's own counter.
    pub client_sequence_number: u64,
    /// Advisory findings from validation.
    pub warnings: Vec<String>,
    /// The operation as committed, append paths resolved.
    pub operation: PatchOperation,
}

impl Confirmation {
    fn new(commit: Commit, sequence: u64) -> Self {
        Self {
            version: commit.version(),
            sequence,
            client_sequence_number: commit.operation.client_sequence_number,
            warnings: commit.warnings,
            operation: commit.operation,
        }
    }
}

/// Point-in-time counters for one diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramStatistics {
    pub element_count: usize,
    pub relationship_count: usize,
    pub version: u64,
    pub active_view_count: usize,
    /// Unix milliseconds of the last commit.
    pub last_modified_at: u64,
}

/// Why a view could not be registered.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    /// The controller was closed by its registry; fetch a fresh one.
    #[error("diagram {0} has been closed")]
    Closed(DiagramId),
    /// Another live view already uses this id.
    #[error("view {0} is already registered")]
    DuplicateView(Uuid),
}

/// Why a controller could not be opened from persisted state.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("cannot bring snapshot up to date: {0}")]
    Log(#[from] LogError),
}

/// Handle for one registered view. Unregisters on drop if not done
/// explicitly.
#[derive(Debug)]
pub struct ViewRegistration {
    view_id: Uuid,
    controller: Weak<SyncController>,
    active: bool,
}

impl ViewRegistration {
    /// Id the view was registered under.
    pub fn view_id(&self) -> Uuid {
        self.view_id
    }

    /// Leave the diagram and tell the remaining views.
    pub async fn unregister(mut self) {
        self.active = false;
        if let Some(controller) = self.controller.upgrade() {
            controller.unregister_view(self.view_id).await;
        }
    }
}

impl Drop for ViewRegistration {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let Some(controller) = self.controller.upgrade() else {
            return;
        };
        controller.stop_delivery(self.view_id);
        let view_id = self.view_id;
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    controller.unregister_view(view_id).await;
                });
            }
            Err(_) => log::warn!("view {view_id} dropped outside a runtime; peers not told"),
        }
    }
}

/// Mediates between the views of one diagram and its store and log.
pub struct SyncController {
    diagram_id: DiagramId,
    store: Mutex<DiagramStore>,
    log: SharedLog,
    group: Arc<BroadcastGroup>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    config: ControllerConfig,
    deliveries: std::sync::Mutex<HashMap<Uuid, JoinHandle<()>>>,
    /// Set under the store lock once the registry has let go of this controller.
    closed: AtomicBool,
    _autosave: Option<Subscription>,
}

impl SyncController {
    /// Controller for a diagram with no prior history.
    pub fn new(diagram_id: DiagramId, log: SharedLog, config: ControllerConfig) -> Self {
        Self::build(diagram_id, DiagramState::new(), log, None, config)
    }

    /// Fresh diagram whose snapshots go to `snapshots`.
    pub fn with_snapshot_store(
        diagram_id: DiagramId,
        log: SharedLog,
        snapshots: Arc<dyn SnapshotStore>,
        config: ControllerConfig,
    ) -> Self {
        Self::build(diagram_id, DiagramState::new(), log, Some(snapshots), config)
    }

    /// Rebuild a controller from the last saved snapshot, replaying any
    /// newer log entries on top of it.
    pub async fn restore(
        diagram_id: DiagramId,
        log: SharedLog,
        snapshots: Arc<dyn SnapshotStore>,
        config: ControllerConfig,
    ) -> Result<Self, RestoreError> {
        Self::open(diagram_id, log, Some(snapshots), config).await
    }

    /// Start from the latest snapshot if any, else an empty diagram, and
    /// reconcile with whatever the log already holds for this diagram.
    pub async fn open(
        diagram_id: DiagramId,
        log: SharedLog,
        snapshots: Option<Arc<dyn SnapshotStore>>,
        config: ControllerConfig,
    ) -> Result<Self, RestoreError> {
        let saved = match &snapshots {
            Some(store) => {
                let store = Arc::clone(store);
                tokio::task::spawn_blocking(move || store.load_latest(diagram_id))
                    .await
                    .map_err(|e| SnapshotError::Task(e.to_string()))??
            }
            None => None,
        };
        let restored = saved.is_some();
        let mut state = saved.unwrap_or_else(DiagramState::new);

        {
            let mut log = write_log(&log);
            let logged = log.current_version(diagram_id);
            if logged > state.version {
                state = log.catch_up(diagram_id, state)?;
            } else if state.version > logged {
                log.start_at(diagram_id, state.version);
            }
        }

        if restored || state.version > 0 {
            log::info!("restored diagram {diagram_id} at version {}", state.version);
        }
        Ok(Self::build(diagram_id, state, log, snapshots, config))
    }

    fn build(
        diagram_id: DiagramId,
        state: DiagramState,
        log: SharedLog,
        snapshots: Option<Arc<dyn SnapshotStore>>,
        config: ControllerConfig,
    ) -> Self {
        let store = DiagramStore::from_state(state);
        let autosave = match (&snapshots, config.snapshot_every) {
            (Some(snapshots), Some(every)) if every > 0 => {
                spawn_autosave(diagram_id, &store, Arc::clone(snapshots), every)
            }
            _ => None,
        };
        Self {
            diagram_id,
            store: Mutex::new(store),
            log,
            group: Arc::new(BroadcastGroup::new(config.broadcast_capacity)),
            snapshots,
            config,
            deliveries: std::sync::Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            _autosave: autosave,
        }
    }

    /// Diagram this controller owns.
    pub fn diagram_id(&self) -> DiagramId {
        self.diagram_id
    }

    /// The operation log this controller appends to.
    pub fn log(&self) -> &SharedLog {
        &self.log
    }

    /// Settings the controller was built with.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Current committed snapshot.
    pub async fn state(&self) -> Arc<DiagramState> {
        self.store.lock().await.state()
    }

    /// Version of the current committed snapshot.
    pub async fn version(&self) -> u64 {
        self.store.lock().await.version()
    }

    /// True once the registry has closed this controller. A closed
    /// controller accepts no new views.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the controller if no view is registered. Registration takes
    /// the same lock, so no view can slip in after the check.
    pub(crate) async fn close_if_idle(&self) -> bool {
        let _store = self.store.lock().await;
        if self.group.view_count().await > 0 {
            return false;
        }
        self.closed.store(true, Ordering::Release);
        true
    }

    /// Undo [`close_if_idle`](Self::close_if_idle) when the registry keeps
    /// the controller after all.
    pub(crate) async fn reopen(&self) {
        let _store = self.store.lock().await;
        self.closed.store(false, Ordering::Release);
    }

    /// Add a view to the fan-out set. The observer first receives the
    /// current state, then every event after it.
    pub async fn register_view<O>(
        self: &Arc<Self>,
        info: ViewInfo,
        observer: O,
    ) -> Result<ViewRegistration, RegistrationError>
    where
        O: ViewObserver,
    {
        self.register_shared(info, Arc::new(observer)).await
    }

    pub(crate) async fn register_shared(
        self: &Arc<Self>,
        info: ViewInfo,
        observer: Arc<dyn ViewObserver>,
    ) -> Result<ViewRegistration, RegistrationError> {
        let view_id = info.view_id;

        // Subscribing under the store lock pins the initial state to the
        // first event this receiver will see.
        let (initial, receiver) = {
            let store = self.store.lock().await;
            if self.is_closed() {
                return Err(RegistrationError::Closed(self.diagram_id));
            }
            if self.group.has_view(&view_id).await {
                return Err(RegistrationError::DuplicateView(view_id));
            }
            let receiver = self.group.add_view(info.clone()).await;
            (store.state(), receiver)
        };

        let task = tokio::spawn(deliver(
            view_id,
            self.diagram_id,
            initial,
            receiver,
            observer,
            Arc::clone(&self.group),
        ));
        if let Some(previous) = self.lock_deliveries().insert(view_id, task) {
            previous.abort();
        }

        self.group.broadcast(ViewEvent::PeerJoined(info.clone()));
        log::info!(
            "view {view_id} ({}) joined diagram {}",
            info.display_name,
            self.diagram_id
        );

        Ok(ViewRegistration {
            view_id,
            controller: Arc::downgrade(self),
            active: true,
        })
    }

    /// Remove a view from the fan-out set. Returns false if it was not
    /// registered.
    pub async fn unregister_view(&self, view_id: Uuid) -> bool {
        self.stop_delivery(view_id);
        match self.group.remove_view(&view_id).await {
            Some(info) => {
                log::info!("view {view_id} left diagram {}", self.diagram_id);
                self.group.broadcast(ViewEvent::PeerLeft(info));
                true
            }
            None => false,
        }
    }

    fn stop_delivery(&self, view_id: Uuid) {
        if let Some(task) = self.lock_deliveries().remove(&view_id) {
            task.abort();
        }
    }

    fn lock_deliveries(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, JoinHandle<()>>> {
        self.deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Views currently registered.
    pub async fn views(&self) -> Vec<ViewInfo> {
        self.group.views().await
    }

    /// Number of registered views.
    pub async fn view_count(&self) -> usize {
        self.group.view_count().await
    }

    /// Fan-out counters, including skipped events of lagging views.
    pub async fn broadcast_stats(&self) -> BroadcastStats {
        self.group.stats().await
    }

    /// Validate, commit, log and broadcast one operation from `view_id`.
    pub async fn process_operation(
        &self,
        view_id: Uuid,
        operation: PatchOperation,
    ) -> Result<Confirmation, OperationError> {
        let view = self.registered(view_id).await?;
        let mut store = self.store.lock().await;
        self.check_log_in_step(store.version())?;

        log::debug!(
            "diagram {}: {} {} from view {view_id}",
            self.diagram_id,
            operation.op,
            operation.path
        );
        let commit = store.apply_operation(operation)?;

        let entry = write_log(&self.log)
            .add_operation(
                OperationInput::new(self.diagram_id, commit.operation.clone(), view.user_id)
                    .at_version(commit.version())
                    .with_change(commit.change.clone()),
            )
            .map_err(|e| self.log_fault(e))?;

        self.group
            .broadcast(ViewEvent::StateReplaced(Arc::clone(&commit.state)));
        self.apply_retention();
        Ok(Confirmation::new(commit, entry.diagram_sequence_number))
    }

    /// Commit `operations` all-or-nothing as one logged batch.
    pub async fn process_batch(
        &self,
        view_id: Uuid,
        operations: Vec<PatchOperation>,
        reason: impl Into<String>,
    ) -> Result<Vec<Confirmation>, OperationError> {
        let view = self.registered(view_id).await?;
        let mut store = self.store.lock().await;
        self.commit_batch(&mut store, view, operations, reason.into())
    }

    /// Bring elements and relationships back to how they were at `version`.
    /// The undo is committed forward as a batch, so the version still grows.
    pub async fn revert_to_version(
        &self,
        view_id: Uuid,
        version: u64,
    ) -> Result<Vec<Confirmation>, OperationError> {
        let view = self.registered(view_id).await?;
        let mut store = self.store.lock().await;
        let current = store.version();
        let operations = read_log(&self.log)
            .rollback_operations(self.diagram_id, version, current)
            .map_err(|e| OperationError::rejected(e.to_string()))?;
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        log::info!(
            "view {view_id} reverts diagram {} from version {current} to {version}",
            self.diagram_id
        );
        self.commit_batch(&mut store, view, operations, ROLLBACK_REASON.to_owned())
    }

    fn commit_batch(
        &self,
        store: &mut DiagramStore,
        view: ViewInfo,
        operations: Vec<PatchOperation>,
        reason: String,
    ) -> Result<Vec<Confirmation>, OperationError> {
        if operations.is_empty() {
            return Err(OperationError::rejected("batch contains no operations"));
        }
        self.check_log_in_step(store.version())?;

        let commits = store.apply_batch(operations)?;
        let inputs = commits
            .iter()
            .map(|commit| {
                OperationInput::new(self.diagram_id, commit.operation.clone(), view.user_id.clone())
                    .at_version(commit.version())
                    .with_change(commit.change.clone())
            })
            .collect();
        let batch = write_log(&self.log)
            .add_batch(BatchInput {
                diagram_id: self.diagram_id,
                user_id: view.user_id,
                reason,
                operations: inputs,
            })
            .map_err(|e| self.log_fault(e))?;

        for commit in &commits {
            self.group
                .broadcast(ViewEvent::StateReplaced(Arc::clone(&commit.state)));
        }
        self.apply_retention();

        Ok(commits
            .into_iter()
            .zip(&batch.entries)
            .map(|(commit, entry)| Confirmation::new(commit, entry.diagram_sequence_number))
            .collect())
    }

    async fn registered(&self, view_id: Uuid) -> Result<ViewInfo, OperationError> {
        self.group.view(&view_id).await.ok_or_else(|| {
            OperationError::rejected(format!(
                "view {view_id} is not registered with diagram {}",
                self.diagram_id
            ))
        })
    }

    fn check_log_in_step(&self, version: u64) -> Result<(), OperationError> {
        let logged = read_log(&self.log).current_version(self.diagram_id);
        if logged == version {
            return Ok(());
        }
        log::error!(
            "diagram {} is at version {version} but its log is at {logged}",
            self.diagram_id
        );
        Err(OperationError::Internal(format!(
            "log out of step with diagram (store {version}, log {logged})"
        )))
    }

    fn log_fault(&self, error: LogError) -> OperationError {
        log::error!("failed to log commit on diagram {}: {error}", self.diagram_id);
        OperationError::Internal(error.to_string())
    }

    fn apply_retention(&self) {
        if let Some(policy) = self.config.retention {
            write_log(&self.log).cleanup(self.diagram_id, policy);
        }
    }

    /// Element and relationship counts, version and active views.
    pub async fn statistics(&self) -> DiagramStatistics {
        let state = self.state().await;
        DiagramStatistics {
            element_count: state.element_count(),
            relationship_count: state.relationship_count(),
            version: state.version,
            active_view_count: self.group.view_count().await,
            last_modified_at: state.last_modified_at,
        }
    }

    /// Save the current state to the snapshot store.
    pub async fn save_snapshot(&self) -> Result<SnapshotInfo, SnapshotError> {
        let snapshots = self.snapshots.clone().ok_or(SnapshotError::NotConfigured)?;
        let state = self.state().await;
        let diagram_id = self.diagram_id;
        let info = tokio::task::spawn_blocking(move || snapshots.save(diagram_id, &state))
            .await
            .map_err(|e| SnapshotError::Task(e.to_string()))??;
        log::info!(
            "saved snapshot v{} of diagram {diagram_id} ({} bytes)",
            info.version,
            info.compressed_size
        );
        Ok(info)
    }

    /// Whether [`save_snapshot`](Self::save_snapshot) has somewhere to write.
    pub fn has_snapshot_store(&self) -> bool {
        self.snapshots.is_some()
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        for (_, task) in self.lock_deliveries().drain() {
            task.abort();
        }
    }
}

async fn deliver(
    view_id: Uuid,
    diagram_id: DiagramId,
    initial: Arc<DiagramState>,
    mut receiver: broadcast::Receiver<ViewEvent>,
    observer: Arc<dyn ViewObserver>,
    group: Arc<BroadcastGroup>,
) {
    observer.notify(&ViewEvent::StateReplaced(initial));
    loop {
        match receiver.recv().await {
            Ok(event) if event.subject() == Some(view_id) => {}
            Ok(event) => observer.notify(&event),
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("view {view_id} on diagram {diagram_id} lagged; skipped {skipped} events");
                group.record_lag(skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Subscribe to the store and save every `every`-th version off the write
/// path. Needs a running tokio runtime.
fn spawn_autosave(
    diagram_id: DiagramId,
    store: &DiagramStore,
    snapshots: Arc<dyn SnapshotStore>,
    every: u64,
) -> Option<Subscription> {
    let Ok(handle) = Handle::try_current() else {
        log::warn!("no async runtime; automatic snapshots of diagram {diagram_id} disabled");
        return None;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<DiagramState>>();
    handle.spawn(async move {
        while let Some(state) = rx.recv().await {
            let version = state.version;
            let snapshots = Arc::clone(&snapshots);
            match tokio::task::spawn_blocking(move || snapshots.save(diagram_id, &state)).await {
                Ok(Ok(info)) => log::info!(
                    "saved snapshot v{version} of diagram {diagram_id} ({} bytes)",
                    info.compressed_size
                ),
                Ok(Err(e)) => log::warn!("snapshot v{version} of diagram {diagram_id} failed: {e}"),
                Err(e) => log::error!("snapshot task for diagram {diagram_id} failed: {e}"),
            }
        }
    });

    Some(store.subscribe(move |state| {
        if state.version % every == 0 && tx.send(Arc::clone(state)).is_err() {
            log::warn!("snapshot task for diagram {diagram_id} is gone");
        }
    }))
}
