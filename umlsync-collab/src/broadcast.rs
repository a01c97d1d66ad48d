//! Fan-out of diagram events to every registered view.
//!
//! One tokio broadcast channel per diagram: a send is O(1) regardless of the
//! number of views, and each view owns an independent receiver buffering up
//! to `capacity` events. A view that falls further behind than that sees
//! `RecvError::Lagged` and skips to the oldest retained event.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use umlsync_core::DiagramState;
use uuid::Uuid;

/// Identity of a registered view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewInfo {
    /// Unique per registration, not per user.
    pub view_id: Uuid,
    pub user_id: String,
    /// Name shown to peers.
    pub display_name: String,
}

impl ViewInfo {
    /// Identity with a fresh random view id.
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), user_id, display_name)
    }

    /// Identity with a caller-chosen view id.
    pub fn with_id(view_id: Uuid, user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            view_id,
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// What a view is told about.
#[derive(Debug, Clone)]
pub enum ViewEvent {
    /// Full state after a commit, or on registration.
    StateReplaced(Arc<DiagramState>),
    /// Another view registered.
    PeerJoined(ViewInfo),
    /// Another view left.
    PeerLeft(ViewInfo),
}

impl ViewEvent {
    /// The view a peer event is about, if any.
    pub fn subject(&self) -> Option<Uuid> {
        match self {
            ViewEvent::StateReplaced(_) => None,
            ViewEvent::PeerJoined(info) | ViewEvent::PeerLeft(info) => Some(info.view_id),
        }
    }
}

/// Fan-out counters of one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Events handed to the channel.
    pub events_sent: u64,
    /// Events skipped by lagging receivers.
    pub events_lagged: u64,
    /// Views registered right now.
    pub active_views: usize,
}

#[derive(Default)]
struct AtomicStats {
    events_sent: AtomicU64,
    events_lagged: AtomicU64,
}

/// Broadcast group for one diagram.
pub struct BroadcastGroup {
    sender: broadcast::Sender<ViewEvent>,
    views: Arc<RwLock<HashMap<Uuid, ViewInfo>>>,
    capacity: usize,
    stats: Arc<AtomicStats>,
}

impl BroadcastGroup {
    /// `capacity` is the per-view backlog before events are skipped.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            views: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicStats::default()),
        }
    }

    /// Add a view and return its receiver. Only events sent after this call
    /// are delivered to it.
    pub async fn add_view(&self, info: ViewInfo) -> broadcast::Receiver<ViewEvent> {
        let mut views = self.views.write().await;
        views.insert(info.view_id, info);
        self.sender.subscribe()
    }

    /// Forget a view. Its receiver sees no further events.
    pub async fn remove_view(&self, view_id: &Uuid) -> Option<ViewInfo> {
        self.views.write().await.remove(view_id)
    }

    /// Send an event to every receiver. Returns how many receivers exist.
    pub fn broadcast(&self, event: ViewEvent) -> usize {
        let count = self.sender.send(event).unwrap_or(0);
        self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record events a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.events_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    /// Number of registered views.
    pub async fn view_count(&self) -> usize {
        self.views.read().await.len()
    }

    /// Registered views, in no particular order.
    pub async fn views(&self) -> Vec<ViewInfo> {
        self.views.read().await.values().cloned().collect()
    }

    /// Identity of one registered view.
    pub async fn view(&self, view_id: &Uuid) -> Option<ViewInfo> {
        self.views.read().await.get(view_id).cloned()
    }

    /// Whether `view_id` is registered.
    pub async fn has_view(&self, view_id: &Uuid) -> bool {
        self.views.read().await.contains_key(view_id)
    }

    /// Current counters.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            events_lagged: self.stats.events_lagged.load(Ordering::Relaxed),
            active_views: self.views.read().await.len(),
        }
    }

    /// Per-view backlog this group was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
