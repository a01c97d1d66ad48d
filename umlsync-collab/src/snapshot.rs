//! Snapshot persistence for diagram state.
//!
//! Snapshots are JSON-serialized [`DiagramState`]s, LZ4-compressed with a
//! size prefix. Two backends share that encoding:
//!
//! ```text
//! MemorySnapshotStore   diagram ─► version ─► bytes
//! FileSnapshotStore     <root>/<diagram-uuid>/<version, zero padded>.snap
//! ```
//!
//! The synchronization core does not need durability to be correct; a
//! snapshot store only lets a diagram survive a process restart.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use umlsync_core::DiagramState;
use uuid::Uuid;

use crate::oplog::DiagramId;

const SNAPSHOT_EXTENSION: &str = "snap";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("snapshot decompression failed: {0}")]
    Decompression(String),
    #[error("no snapshot of diagram {diagram_id} at version {version}")]
    NotFound { diagram_id: DiagramId, version: u64 },
    #[error("no snapshot store configured")]
    NotConfigured,
    #[error("snapshot task failed: {0}")]
    Task(String),
}

/// Facts about one saved snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub diagram_id: DiagramId,
    pub version: u64,
    pub original_size: usize,
    pub compressed_size: usize,
}

/// Durable home for diagram snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Persist `state` under its own version.
    fn save(&self, diagram_id: DiagramId, state: &DiagramState) -> Result<SnapshotInfo, SnapshotError>;

    /// Saved versions of one diagram, ascending.
    fn versions(&self, diagram_id: DiagramId) -> Result<Vec<u64>, SnapshotError>;

    fn load_version(&self, diagram_id: DiagramId, version: u64) -> Result<DiagramState, SnapshotError>;

    /// Diagrams with at least one snapshot.
    fn diagrams(&self) -> Result<Vec<DiagramId>, SnapshotError>;

    /// Most recent snapshot, if any.
    fn load_latest(&self, diagram_id: DiagramId) -> Result<Option<DiagramState>, SnapshotError> {
        match self.versions(diagram_id)?.last() {
            Some(&version) => self.load_version(diagram_id, version).map(Some),
            None => Ok(None),
        }
    }
}

/// Serialize and compress a state.
pub fn encode_snapshot(state: &DiagramState) -> Result<(Vec<u8>, usize), SnapshotError> {
    let json = serde_json::to_vec(state)?;
    Ok((lz4_flex::compress_prepend_size(&json), json.len()))
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<DiagramState, SnapshotError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| SnapshotError::Decompression(e.to_string()))?;
    Ok(serde_json::from_slice(&json)?)
}

/// In-process snapshot store, mainly for tests and ephemeral servers.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<DiagramId, BTreeMap<u64, Vec<u8>>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DiagramId, BTreeMap<u64, Vec<u8>>>> {
        self.snapshots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, diagram_id: DiagramId, state: &DiagramState) -> Result<SnapshotInfo, SnapshotError> {
        let (bytes, original_size) = encode_snapshot(state)?;
        let info = SnapshotInfo {
            diagram_id,
            version: state.version,
            original_size,
            compressed_size: bytes.len(),
        };
        self.lock()
            .entry(diagram_id)
            .or_default()
            .insert(state.version, bytes);
        Ok(info)
    }

    fn versions(&self, diagram_id: DiagramId) -> Result<Vec<u64>, SnapshotError> {
        Ok(self
            .lock()
            .get(&diagram_id)
            .map(|v| v.keys().copied().collect())
            .unwrap_or_default())
    }

    fn load_version(&self, diagram_id: DiagramId, version: u64) -> Result<DiagramState, SnapshotError> {
        let snapshots = self.lock();
        let bytes = snapshots
            .get(&diagram_id)
            .and_then(|v| v.get(&version))
            .ok_or(SnapshotError::NotFound { diagram_id, version })?;
        decode_snapshot(bytes)
    }

    fn diagrams(&self) -> Result<Vec<DiagramId>, SnapshotError> {
        let mut ids: Vec<DiagramId> = self.lock().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Snapshot store backed by a directory tree.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    /// Open (creating if needed) a snapshot directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        log::info!("snapshot store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn diagram_dir(&self, diagram_id: DiagramId) -> PathBuf {
        self.root.join(diagram_id.to_string())
    }

    fn snapshot_path(&self, diagram_id: DiagramId, version: u64) -> PathBuf {
        self.diagram_dir(diagram_id)
            .join(format!("{version:020}.{SNAPSHOT_EXTENSION}"))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, diagram_id: DiagramId, state: &DiagramState) -> Result<SnapshotInfo, SnapshotError> {
        let (bytes, original_size) = encode_snapshot(state)?;
        fs::create_dir_all(self.diagram_dir(diagram_id))?;

        // Write then rename so a crash never leaves a truncated snapshot.
        let path = self.snapshot_path(diagram_id, state.version);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;

        log::debug!(
            "saved snapshot v{} of {diagram_id} ({} -> {} bytes)",
            state.version,
            original_size,
            bytes.len()
        );
        Ok(SnapshotInfo {
            diagram_id,
            version: state.version,
            original_size,
            compressed_size: bytes.len(),
        })
    }

    fn versions(&self, diagram_id: DiagramId) -> Result<Vec<u64>, SnapshotError> {
        let dir = self.diagram_dir(diagram_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            if let Some(version) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    fn load_version(&self, diagram_id: DiagramId, version: u64) -> Result<DiagramState, SnapshotError> {
        let path = self.snapshot_path(diagram_id, version);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound { diagram_id, version })
            }
            Err(e) => return Err(e.into()),
        };
        decode_snapshot(&bytes)
    }

    fn diagrams(&self) -> Result<Vec<DiagramId>, SnapshotError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().to_str().map(Uuid::parse_str) {
                Some(Ok(id)) => ids.push(id),
                _ => log::warn!("ignoring unexpected entry {:?} in snapshot store", entry.path()),
            }
        }
        ids.sort();
        Ok(ids)
    }
}
