//! # UmlSync Collab
//!
//! Server side of collaborative diagram editing: one authoritative store per
//! diagram, an append-only operation log, and a controller that serializes
//! submissions and fans committed state out to every registered view.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌──────────────┐
//! │ View (local  │────►│ SyncController │────►│ DiagramStore │──► validate_operation
//! │ or WebSocket)│◄────│  per diagram   │     └──────────────┘    (umlsync-core)
//! └──────────────┘     └───────┬────────┘
//!        ▲                     │
//!        │ StateReplaced       ├──► OperationLog (shared, per-diagram sequence)
//!        │ PeerJoined/Left     ├──► BroadcastGroup (tokio broadcast)
//!        └─────────────────────┘──► SnapshotStore (LZ4 JSON, optional)
//! ```
//!
//! ## Modules
//!
//! - [`store`]: Diagram Store, validated commits and subscriptions
//! - [`oplog`]: Operation Log, queries, retention and rollback
//! - [`controller`]: Synchronization Controller
//! - [`registry`]: one controller per diagram
//! - [`broadcast`]: fan-out channel per diagram
//! - [`snapshot`]: snapshot persistence
//! - [`protocol`]: binary wire envelope
//! - [`server`]: WebSocket server

pub mod broadcast;
pub mod controller;
pub mod oplog;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod snapshot;
pub mod store;

pub use broadcast::{BroadcastGroup, BroadcastStats, ViewEvent, ViewInfo};
pub use controller::{
    shared_log, Confirmation, ControllerConfig, DiagramStatistics, RegistrationError, RestoreError,
    SharedLog, SyncController, ViewObserver, ViewRegistration, ROLLBACK_REASON,
};
pub use oplog::{
    BatchInput, DiagramId, LogEntry, LogError, OperationBatch, OperationInput, OperationLog,
    OperationQuery, RetentionPolicy, ROLLBACK_CLIENT,
};
pub use protocol::{JoinRequest, MessageType, ProtocolError, Rejection, SyncMessage};
pub use registry::{DiagramRegistry, JoinError};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotError, SnapshotInfo, SnapshotStore};
pub use store::{Commit, DiagramStore, OperationError, Subscription};
