//! Maps diagram ids to their controllers, one per diagram.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::broadcast::ViewInfo;
use crate::controller::{
    read_log, shared_log, ControllerConfig, RegistrationError, RestoreError, SharedLog,
    SyncController, ViewObserver, ViewRegistration,
};
use crate::oplog::DiagramId;
use crate::snapshot::SnapshotStore;

/// Why a view could not join a diagram.
#[derive(Error, Debug)]
pub enum JoinError {
    #[error("cannot open diagram: {0}")]
    Restore(#[from] RestoreError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Every open diagram of the process, sharing one operation log.
pub struct DiagramRegistry {
    controllers: RwLock<HashMap<DiagramId, Arc<SyncController>>>,
    log: SharedLog,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    config: ControllerConfig,
}

impl DiagramRegistry {
    /// Registry without persistence; diagrams live as long as the process.
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            controllers: RwLock::new(HashMap::new()),
            log: shared_log(),
            snapshots: None,
            config,
        }
    }

    /// Persist diagrams to `snapshots` and restore them from it.
    pub fn with_snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// The log shared by every controller of this registry.
    pub fn log(&self) -> &SharedLog {
        &self.log
    }

    /// Controller for `diagram_id`, opened from the latest snapshot on
    /// first use.
    pub async fn get_or_create(&self, diagram_id: DiagramId) -> Result<Arc<SyncController>, RestoreError> {
        {
            let controllers = self.controllers.read().await;
            if let Some(controller) = controllers.get(&diagram_id) {
                return Ok(Arc::clone(controller));
            }
        }

        let mut controllers = self.controllers.write().await;
        if let Some(controller) = controllers.get(&diagram_id) {
            return Ok(Arc::clone(controller));
        }

        let controller = Arc::new(
            SyncController::open(
                diagram_id,
                Arc::clone(&self.log),
                self.snapshots.clone(),
                self.config.clone(),
            )
            .await?,
        );
        controllers.insert(diagram_id, Arc::clone(&controller));
        log::info!("opened diagram {diagram_id}");
        Ok(controller)
    }

    /// Controller for `diagram_id` if it is open.
    pub async fn get(&self, diagram_id: DiagramId) -> Option<Arc<SyncController>> {
        self.controllers.read().await.get(&diagram_id).cloned()
    }

    /// Register a view on `diagram_id`, opening the diagram if needed. A
    /// controller closed between lookup and registration is fetched again.
    pub async fn join<O>(
        &self,
        diagram_id: DiagramId,
        info: ViewInfo,
        observer: O,
    ) -> Result<(Arc<SyncController>, ViewRegistration), JoinError>
    where
        O: ViewObserver,
    {
        let observer: Arc<dyn ViewObserver> = Arc::new(observer);
        loop {
            let controller = self.get_or_create(diagram_id).await?;
            match controller
                .register_shared(info.clone(), Arc::clone(&observer))
                .await
            {
                Ok(registration) => return Ok((controller, registration)),
                Err(RegistrationError::Closed(_)) => {
                    log::debug!("diagram {diagram_id} closed during join; opening it again");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drop the controller of a diagram nobody is viewing, saving a final
    /// snapshot first when a store is configured.
    ///
    /// A diagram stays open when its state could not be rebuilt later: the
    /// final snapshot failed, or there is no snapshot store and the log has
    /// been pruned.
    pub async fn remove_if_idle(&self, diagram_id: DiagramId) -> bool {
        let mut controllers = self.controllers.write().await;
        let Some(controller) = controllers.get(&diagram_id).cloned() else {
            return false;
        };
        if !controller.close_if_idle().await {
            return false;
        }
        if !self.can_release(&controller).await {
            controller.reopen().await;
            return false;
        }
        controllers.remove(&diagram_id);
        log::info!("closed idle diagram {diagram_id}");
        true
    }

    async fn can_release(&self, controller: &SyncController) -> bool {
        let diagram_id = controller.diagram_id();
        if controller.has_snapshot_store() {
            if controller.version().await == 0 {
                return true;
            }
            return match controller.save_snapshot().await {
                Ok(_) => true,
                Err(e) => {
                    log::warn!("final snapshot of diagram {diagram_id} failed; keeping it open: {e}");
                    false
                }
            };
        }
        let pruned_through = read_log(&self.log).pruned_through(diagram_id);
        if pruned_through > 0 {
            log::debug!(
                "diagram {diagram_id} has no snapshot and history pruned through v{pruned_through}; keeping it open"
            );
            return false;
        }
        true
    }

    /// Snapshot every open diagram. Returns how many were saved.
    pub async fn save_all(&self) -> usize {
        let controllers: Vec<Arc<SyncController>> =
            self.controllers.read().await.values().cloned().collect();
        let mut saved = 0;
        for controller in controllers {
            match controller.save_snapshot().await {
                Ok(_) => saved += 1,
                Err(e) => log::warn!(
                    "snapshot of diagram {} failed: {e}",
                    controller.diagram_id()
                ),
            }
        }
        saved
    }

    pub async fn diagram_count(&self) -> usize {
        self.controllers.read().await.len()
    }

    pub async fn active_diagrams(&self) -> Vec<DiagramId> {
        self.controllers.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ViewEvent;
    use crate::oplog::RetentionPolicy;
    use crate::snapshot::MemorySnapshotStore;
    use serde_json::json;
    use umlsync_core::PatchOperation;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_get_or_create_returns_same_controller() {
        let registry = DiagramRegistry::new(ControllerConfig::for_testing());
        let id = Uuid::new_v4();

        let first = registry.get_or_create(id).await.unwrap();
        let second = registry.get_or_create(id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.diagram_count().await, 1);
    }

    #[tokio::test]
    async fn test_diagrams_are_isolated() {
        let registry = DiagramRegistry::new(ControllerConfig::for_testing());
        let a = registry.get_or_create(Uuid::new_v4()).await.unwrap();
        let b = registry.get_or_create(Uuid::new_v4()).await.unwrap();

        let view = a
            .register_view(ViewInfo::new("alice", "Alice"), |_: &ViewEvent| {})
            .await
            .unwrap();
        a.process_operation(
            view.view_id(),
            PatchOperation::add("/elements/c1", json!({"displayName": "C", "kind": "class"}))
                .with_client("client-1", 1),
        )
        .await
        .unwrap();

        assert_eq!(a.version().await, 1);
        assert_eq!(b.version().await, 0);
        let active = registry.active_diagrams().await;
        assert!(active.contains(&a.diagram_id()) && active.contains(&b.diagram_id()));
    }

    #[tokio::test]
    async fn test_idle_diagram_survives_reopen() {
        let registry = DiagramRegistry::new(ControllerConfig::for_testing())
            .with_snapshot_store(Arc::new(MemorySnapshotStore::new()));
        let id = Uuid::new_v4();
        let controller = registry.get_or_create(id).await.unwrap();

        let view = controller
            .register_view(ViewInfo::new("alice", "Alice"), |_: &ViewEvent| {})
            .await
            .unwrap();
        controller
            .process_operation(
                view.view_id(),
                PatchOperation::add("/elements/c1", json!({"displayName": "C", "kind": "class"}))
                    .with_client("client-1", 1),
            )
            .await
            .unwrap();
        assert!(!registry.remove_if_idle(id).await);

        view.unregister().await;
        assert!(registry.remove_if_idle(id).await);
        assert_eq!(registry.diagram_count().await, 0);
        drop(controller);

        let reopened = registry.get_or_create(id).await.unwrap();
        assert_eq!(reopened.version().await, 1);
        assert!(reopened.state().await.element("c1").is_some());
    }

    fn add_class(id: &str, seq: u64) -> PatchOperation {
        PatchOperation::add(
            format!("/elements/{id}"),
            json!({"displayName": id.to_uppercase(), "kind": "class"}),
        )
        .with_client("client-1", seq)
    }

    #[tokio::test]
    async fn test_join_after_close_uses_one_controller() {
        let registry = DiagramRegistry::new(ControllerConfig::for_testing());
        let id = Uuid::new_v4();

        // A joiner looked the controller up just before it was closed.
        let stale = registry.get_or_create(id).await.unwrap();
        assert!(registry.remove_if_idle(id).await);
        let err = stale
            .register_view(ViewInfo::new("alice", "Alice"), |_: &ViewEvent| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Closed(_)));

        let (alice_controller, alice) = registry
            .join(id, ViewInfo::new("alice", "Alice"), |_: &ViewEvent| {})
            .await
            .unwrap();
        let (bob_controller, bob) = registry
            .join(id, ViewInfo::new("bob", "Bob"), |_: &ViewEvent| {})
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&stale, &alice_controller));
        assert!(Arc::ptr_eq(&alice_controller, &bob_controller));

        alice_controller
            .process_operation(alice.view_id(), add_class("a", 1))
            .await
            .unwrap();
        let confirmation = bob_controller
            .process_operation(bob.view_id(), add_class("b", 2))
            .await
            .unwrap();
        assert_eq!(confirmation.version, 2);
        assert_eq!(stale.version().await, 0);
    }

    #[tokio::test]
    async fn test_pruned_diagram_without_snapshots_stays_open() {
        let registry = DiagramRegistry::new(ControllerConfig {
            retention: Some(RetentionPolicy::KeepLast(2)),
            ..ControllerConfig::for_testing()
        });
        let id = Uuid::new_v4();
        let (controller, view) = registry
            .join(id, ViewInfo::new("alice", "Alice"), |_: &ViewEvent| {})
            .await
            .unwrap();
        for n in 0..5 {
            controller
                .process_operation(view.view_id(), add_class(&format!("c{n}"), n + 1))
                .await
                .unwrap();
        }
        view.unregister().await;

        assert!(!registry.remove_if_idle(id).await);
        assert!(!controller.is_closed());
        assert_eq!(registry.diagram_count().await, 1);

        let (again, view) = registry
            .join(id, ViewInfo::new("alice", "Alice"), |_: &ViewEvent| {})
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&controller, &again));
        let confirmation = again
            .process_operation(view.view_id(), add_class("c5", 6))
            .await
            .unwrap();
        assert_eq!(confirmation.version, 6);
    }

    #[tokio::test]
    async fn test_pruned_diagram_with_snapshots_reopens() {
        let registry = DiagramRegistry::new(ControllerConfig {
            retention: Some(RetentionPolicy::KeepLast(2)),
            ..ControllerConfig::for_testing()
        })
        .with_snapshot_store(Arc::new(MemorySnapshotStore::new()));
        let id = Uuid::new_v4();
        let (controller, view) = registry
            .join(id, ViewInfo::new("alice", "Alice"), |_: &ViewEvent| {})
            .await
            .unwrap();
        for n in 0..5 {
            controller
                .process_operation(view.view_id(), add_class(&format!("c{n}"), n + 1))
                .await
                .unwrap();
        }
        view.unregister().await;
        drop(controller);

        assert!(registry.remove_if_idle(id).await);
        let (reopened, _view) = registry
            .join(id, ViewInfo::new("bob", "Bob"), |_: &ViewEvent| {})
            .await
            .unwrap();
        assert_eq!(reopened.version().await, 5);
        assert_eq!(reopened.state().await.element_count(), 5);
    }

    #[tokio::test]
    async fn test_remove_unknown_diagram() {
        let registry = DiagramRegistry::new(ControllerConfig::for_testing());
        assert!(!registry.remove_if_idle(Uuid::new_v4()).await);
    }
}
