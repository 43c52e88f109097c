//! Container runtime interface.
//!
//! The communication core never runs containers itself: it carries action
//! names, parameters, and results between client and daemon. This module
//! defines the seam to the actual runtime plus an in-memory
//! implementation used by the default wiring and the tests.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::api::{ContainerAction, ContainerInfo, ContainerStatus, SourceSpec};
use crate::BoxFuture;

/// Errors from the container runtime, carried into operation results.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("container already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state for {action}: container is {status:?}")]
    InvalidState {
        action: &'static str,
        status: ContainerStatus,
    },

    #[error("no such file in container: {0}")]
    FileNotFound(String),

    #[error("snapshot already exists: {0}")]
    SnapshotExists(String),
}

/// File content plus ownership and permission metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub uid: u32,
    pub gid: u32,
    /// Permission bits, e.g. `0o640`.
    pub mode: u32,
    pub content: Vec<u8>,
}

/// The runtime operations the daemon dispatches to.
///
/// Implementations decide how containers actually run; the daemon only
/// schedules these calls inside operations and relays their errors.
pub trait ContainerBackend: Send + Sync {
    /// Ordered list of container names.
    fn list(&self) -> BoxFuture<'_, Vec<String>>;

    /// Descriptor of one container.
    fn status(&self, name: &str) -> BoxFuture<'_, Result<ContainerInfo, BackendError>>;

    fn create(&self, name: String, source: SourceSpec)
        -> BoxFuture<'_, Result<(), BackendError>>;

    fn delete(&self, name: String) -> BoxFuture<'_, Result<(), BackendError>>;

    fn set_state(
        &self,
        name: String,
        action: ContainerAction,
        timeout: i64,
        force: bool,
    ) -> BoxFuture<'_, Result<(), BackendError>>;

    fn snapshot(
        &self,
        name: String,
        snapshot: String,
        stateful: bool,
    ) -> BoxFuture<'_, Result<(), BackendError>>;

    fn write_file(
        &self,
        name: String,
        path: String,
        file: FileRecord,
    ) -> BoxFuture<'_, Result<(), BackendError>>;

    fn read_file(&self, name: String, path: String)
        -> BoxFuture<'_, Result<FileRecord, BackendError>>;
}

struct MemContainer {
    status: ContainerStatus,
    created_at: DateTime<Utc>,
    snapshots: Vec<String>,
    files: HashMap<String, FileRecord>,
}

/// In-memory backend: containers are bookkeeping entries, files live in a
/// map. The ordered container set comes from the `BTreeMap` keys.
#[derive(Default)]
pub struct MemBackend {
    containers: RwLock<BTreeMap<String, MemContainer>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContainerBackend for MemBackend {
    fn list(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async { self.containers.read().await.keys().cloned().collect() })
    }

    fn status(&self, name: &str) -> BoxFuture<'_, Result<ContainerInfo, BackendError>> {
        let name = name.to_string();
        Box::pin(async move {
            let containers = self.containers.read().await;
            let ct = containers
                .get(&name)
                .ok_or_else(|| BackendError::NotFound(name.clone()))?;
            Ok(ContainerInfo {
                name,
                status: ct.status,
                created_at: ct.created_at,
                snapshots: ct.snapshots.clone(),
            })
        })
    }

    fn create(
        &self,
        name: String,
        _source: SourceSpec,
    ) -> BoxFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            let mut containers = self.containers.write().await;
            if containers.contains_key(&name) {
                return Err(BackendError::AlreadyExists(name));
            }
            containers.insert(
                name,
                MemContainer {
                    status: ContainerStatus::Stopped,
                    created_at: Utc::now(),
                    snapshots: Vec::new(),
                    files: HashMap::new(),
                },
            );
            Ok(())
        })
    }

    fn delete(&self, name: String) -> BoxFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            let mut containers = self.containers.write().await;
            let ct = containers
                .get(&name)
                .ok_or_else(|| BackendError::NotFound(name.clone()))?;
            if ct.status != ContainerStatus::Stopped {
                return Err(BackendError::InvalidState {
                    action: "delete",
                    status: ct.status,
                });
            }
            containers.remove(&name);
            Ok(())
        })
    }

    fn set_state(
        &self,
        name: String,
        action: ContainerAction,
        _timeout: i64,
        force: bool,
    ) -> BoxFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            let mut containers = self.containers.write().await;
            let ct = containers
                .get_mut(&name)
                .ok_or_else(|| BackendError::NotFound(name.clone()))?;

            let next = match (action, ct.status) {
                (ContainerAction::Start, ContainerStatus::Stopped) => ContainerStatus::Running,
                (ContainerAction::Stop, ContainerStatus::Running)
                | (ContainerAction::Stop, ContainerStatus::Frozen) => ContainerStatus::Stopped,
                (ContainerAction::Restart, ContainerStatus::Running) => ContainerStatus::Running,
                (ContainerAction::Freeze, ContainerStatus::Running) => ContainerStatus::Frozen,
                (ContainerAction::Unfreeze, ContainerStatus::Frozen) => ContainerStatus::Running,
                // Forcing coerces the container into the target state.
                (ContainerAction::Stop, _) if force => ContainerStatus::Stopped,
                (_, status) => {
                    return Err(BackendError::InvalidState {
                        action: action_name(action),
                        status,
                    });
                }
            };
            ct.status = next;
            Ok(())
        })
    }

    fn snapshot(
        &self,
        name: String,
        snapshot: String,
        _stateful: bool,
    ) -> BoxFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            let mut containers = self.containers.write().await;
            let ct = containers
                .get_mut(&name)
                .ok_or_else(|| BackendError::NotFound(name.clone()))?;
            if ct.snapshots.contains(&snapshot) {
                return Err(BackendError::SnapshotExists(snapshot));
            }
            ct.snapshots.push(snapshot);
            Ok(())
        })
    }

    fn write_file(
        &self,
        name: String,
        path: String,
        file: FileRecord,
    ) -> BoxFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            let mut containers = self.containers.write().await;
            let ct = containers
                .get_mut(&name)
                .ok_or_else(|| BackendError::NotFound(name.clone()))?;
            ct.files.insert(path, file);
            Ok(())
        })
    }

    fn read_file(
        &self,
        name: String,
        path: String,
    ) -> BoxFuture<'_, Result<FileRecord, BackendError>> {
        Box::pin(async move {
            let containers = self.containers.read().await;
            let ct = containers
                .get(&name)
                .ok_or_else(|| BackendError::NotFound(name.clone()))?;
            ct.files
                .get(&path)
                .cloned()
                .ok_or(BackendError::FileNotFound(path))
        })
    }
}

fn action_name(action: ContainerAction) -> &'static str {
    match action {
        ContainerAction::Start => "start",
        ContainerAction::Stop => "stop",
        ContainerAction::Restart => "restart",
        ContainerAction::Freeze => "freeze",
        ContainerAction::Unfreeze => "unfreeze",
    }
}
