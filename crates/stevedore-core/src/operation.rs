//! Asynchronous operation lifecycle.
//!
//! Every accepted request that triggers background work is tracked by an
//! [`Operation`]: a small state machine the daemon drives from `Pending`
//! through `Running` to a terminal status, and that clients poll through
//! the wait endpoint. The daemon-resident side lives in
//! [`OperationRegistry`]; the serializable descriptor travels inside
//! envelope metadata.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, warn};

use crate::api::API_VERSION;
use crate::BoxFuture;

/// Errors from the daemon-side operation registry.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("no such operation: {0}")]
    NotFound(String),

    #[error("operation already has a waiter")]
    WaiterClaimed,

    #[error("operation has already completed")]
    AlreadyCompleted,
}

/// Operation status, ordered: Pending < Running < {Done, Cancelling} and
/// Cancelling < Cancelled. Status never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Done,
    Cancelling,
    Cancelled,
}

impl OperationStatus {
    /// Compact numeric code used on the wire.
    pub fn code(self) -> u8 {
        match self {
            OperationStatus::Pending => 0,
            OperationStatus::Running => 1,
            OperationStatus::Done => 2,
            OperationStatus::Cancelling => 3,
            OperationStatus::Cancelled => 4,
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Done | OperationStatus::Cancelled)
    }
}

/// Outcome of a completed operation. Meaningful only once the status is
/// `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationResult {
    Failure,
    Success,
}

impl OperationResult {
    pub fn code(self) -> u8 {
        match self {
            OperationResult::Failure => 0,
            OperationResult::Success => 1,
        }
    }
}

/// The serializable operation descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: OperationStatus,
    pub status_code: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,
    #[serde(default)]
    pub result_code: u8,
    pub resource_url: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub may_cancel: bool,
}

impl Operation {
    /// Create a fresh descriptor in `Pending`.
    pub fn new(resource_url: impl Into<String>, may_cancel: bool) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            status: OperationStatus::Pending,
            status_code: OperationStatus::Pending.code(),
            result: None,
            result_code: 0,
            resource_url: resource_url.into(),
            metadata: serde_json::Value::Null,
            may_cancel,
        }
    }

    /// Transition to a new status: refresh `updated_at`, recompute the
    /// numeric code, and clear `may_cancel` once past the point of no
    /// return.
    pub fn set_status(&mut self, status: OperationStatus) {
        self.status = status;
        self.status_code = status.code();
        self.updated_at = Utc::now();
        if matches!(
            status,
            OperationStatus::Done | OperationStatus::Cancelling | OperationStatus::Cancelled
        ) {
            self.may_cancel = false;
        }
    }

    /// Record the outcome of the unit of work. Called exactly once, when
    /// the work completes. An error becomes `Failure` with the error text
    /// JSON-encoded into `metadata`.
    pub fn set_result(&mut self, err: Option<&str>) {
        match err {
            None => {
                self.result = Some(OperationResult::Success);
                self.result_code = OperationResult::Success.code();
            }
            Some(text) => {
                self.result = Some(OperationResult::Failure);
                self.result_code = OperationResult::Failure.code();
                match serde_json::to_value(text) {
                    Ok(md) => self.metadata = md,
                    // Not fatal, just annoying for users.
                    Err(e) => warn!(error = %e, "failed to encode operation error text"),
                }
            }
        }
        self.updated_at = Utc::now();
    }

    /// Decode the failure text, if the operation failed.
    pub fn get_error(&self) -> Option<String> {
        if self.result != Some(OperationResult::Failure) {
            return None;
        }
        match serde_json::from_value::<String>(self.metadata.clone()) {
            Ok(s) => Some(s),
            Err(_) => Some("operation failed".to_string()),
        }
    }
}

/// Locator of an operation resource under the versioned prefix.
pub fn operation_path(id: &str) -> String {
    format!("/{API_VERSION}/operations/{id}")
}

/// The unit of work an operation executes. Invoked exactly once.
pub type RunFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send>;

/// Cooperative cancellation hook: requests cancellation, the work unit
/// decides when and whether to honor it.
pub type CancelFn = Box<dyn Fn() + Send + Sync>;

/// Daemon-resident record: the descriptor plus the synchronization state
/// the runner and the cancel handler share.
pub struct OperationRecord {
    pub op: Operation,
    cancel: Option<CancelFn>,
    /// Fired exactly once, after the terminal status is committed.
    completion_tx: Option<oneshot::Sender<()>>,
    /// Claimed by at most one waiter at a time.
    completion_rx: Option<oneshot::Receiver<()>>,
}

type SharedRecord = Arc<Mutex<OperationRecord>>;

/// Daemon-side registry of in-flight operations.
///
/// Owned by the daemon context object; the registry map and each record
/// have their own locks, so independent operations proceed concurrently
/// while the runner task and the cancel handler serialize per record.
#[derive(Default)]
pub struct OperationRegistry {
    ops: RwLock<HashMap<String, SharedRecord>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a unit of background work: create the operation in
    /// `Pending`, launch the runner task, and return the operation id.
    pub async fn spawn(
        &self,
        resource_url: impl Into<String>,
        run: RunFn,
        cancel: Option<CancelFn>,
    ) -> (String, Operation) {
        let id = new_operation_id();
        let (tx, rx) = oneshot::channel();
        let record = Arc::new(Mutex::new(OperationRecord {
            op: Operation::new(resource_url, cancel.is_some()),
            cancel,
            completion_tx: Some(tx),
            completion_rx: Some(rx),
        }));
        let descriptor = record.lock().await.op.clone();

        self.ops
            .write()
            .await
            .insert(id.clone(), Arc::clone(&record));

        let task_id = id.clone();
        tokio::spawn(async move {
            run_operation(task_id, record, run).await;
        });

        (id, descriptor)
    }

    /// Snapshot an operation's current descriptor.
    pub async fn get(&self, id: &str) -> Result<Operation, OperationError> {
        let record = self.lookup(id).await?;
        let guard = record.lock().await;
        Ok(guard.op.clone())
    }

    /// Long-poll until the operation reaches a terminal status or the
    /// bound elapses; returns the descriptor either way. The completion
    /// signal is single-slot: a second concurrent waiter is rejected.
    pub async fn wait(&self, id: &str, bound: Duration) -> Result<Operation, OperationError> {
        let record = self.lookup(id).await?;

        let rx = {
            let mut guard = record.lock().await;
            if guard.op.status.is_terminal() {
                return Ok(guard.op.clone());
            }
            guard
                .completion_rx
                .take()
                .ok_or(OperationError::WaiterClaimed)?
        };

        match tokio::time::timeout(bound, rx).await {
            // Signal observed: the terminal status is committed.
            Ok(_) => Ok(record.lock().await.op.clone()),
            Err(_elapsed) => {
                let mut guard = record.lock().await;
                // Hand the slot back so the caller can re-issue the wait.
                if !guard.op.status.is_terminal() {
                    let (tx, rx) = oneshot::channel();
                    guard.completion_tx = Some(tx);
                    guard.completion_rx = Some(rx);
                }
                Ok(guard.op.clone())
            }
        }
    }

    /// Request cancellation. Honored only while `may_cancel` holds; a
    /// request arriving after completion is rejected.
    pub async fn cancel(&self, id: &str) -> Result<Operation, OperationError> {
        let record = self.lookup(id).await?;
        let mut guard = record.lock().await;
        if !guard.op.may_cancel {
            return Err(OperationError::AlreadyCompleted);
        }
        guard.op.set_status(OperationStatus::Cancelling);
        if let Some(hook) = guard.cancel.as_ref() {
            hook();
        }
        debug!(id, "operation cancelling");
        Ok(guard.op.clone())
    }

    async fn lookup(&self, id: &str) -> Result<SharedRecord, OperationError> {
        self.ops
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| OperationError::NotFound(id.to_string()))
    }
}

/// Drive one operation to its terminal state.
///
/// The work unit's own errors never cross the operation boundary: they
/// are captured into the result and metadata. The completion signal fires
/// exactly once, after the terminal status and result are committed.
async fn run_operation(id: String, record: SharedRecord, run: RunFn) {
    let fut = {
        let mut guard = record.lock().await;
        // A cancel may already have landed while the record was Pending.
        if guard.op.status == OperationStatus::Pending {
            guard.op.set_status(OperationStatus::Running);
        }
        run()
    };

    let outcome = fut.await;

    let mut guard = record.lock().await;
    guard.op.set_result(outcome.as_ref().err().map(String::as_str));
    let terminal = if guard.op.status == OperationStatus::Cancelling {
        OperationStatus::Cancelled
    } else {
        OperationStatus::Done
    };
    guard.op.set_status(terminal);
    debug!(id, status = ?terminal, "operation finished");

    if let Some(tx) = guard.completion_tx.take() {
        // The waiter may have gone away; that is fine.
        let _ = tx.send(());
    }
}

fn new_operation_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_codes() {
        assert_eq!(OperationStatus::Pending.code(), 0);
        assert_eq!(OperationStatus::Running.code(), 1);
        assert_eq!(OperationStatus::Done.code(), 2);
        assert_eq!(OperationStatus::Cancelling.code(), 3);
        assert_eq!(OperationStatus::Cancelled.code(), 4);
        assert_eq!(OperationResult::Failure.code(), 0);
        assert_eq!(OperationResult::Success.code(), 1);
    }

    #[test]
    fn test_set_status_clears_may_cancel() {
        let mut op = Operation::new("/1.0/containers/web1", true);
        assert!(op.may_cancel);

        op.set_status(OperationStatus::Running);
        assert!(op.may_cancel);

        op.set_status(OperationStatus::Done);
        assert!(!op.may_cancel);
        assert_eq!(op.status_code, 2);
    }

    #[test]
    fn test_updated_at_advances() {
        let mut op = Operation::new("/1.0/containers/web1", false);
        let t0 = op.updated_at;
        op.set_status(OperationStatus::Running);
        assert!(op.updated_at >= t0);
        let t1 = op.updated_at;
        op.set_result(None);
        assert!(op.updated_at >= t1);
    }

    #[test]
    fn test_set_result_success() {
        let mut op = Operation::new("/1.0/containers/web1", false);
        op.set_result(None);
        assert_eq!(op.result, Some(OperationResult::Success));
        assert_eq!(op.result_code, 1);
        assert!(op.get_error().is_none());
    }

    #[test]
    fn test_set_result_failure_encodes_error_text() {
        let mut op = Operation::new("/1.0/containers/web1", false);
        op.set_result(Some("image not found"));
        assert_eq!(op.result, Some(OperationResult::Failure));
        assert_eq!(op.result_code, 0);
        assert_eq!(op.get_error().unwrap(), "image not found");
        assert_eq!(op.metadata, serde_json::json!("image not found"));
    }

    #[test]
    fn test_descriptor_round_trip() {
        let mut op = Operation::new("/1.0/containers/web1", true);
        op.set_status(OperationStatus::Running);
        let body = serde_json::to_vec(&op).unwrap();
        let decoded: Operation = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded.status, OperationStatus::Running);
        assert_eq!(decoded.resource_url, "/1.0/containers/web1");
        assert!(decoded.may_cancel);
    }

    #[test]
    fn test_operation_path() {
        assert_eq!(operation_path("abc123"), "/1.0/operations/abc123");
    }

    #[tokio::test]
    async fn test_spawn_and_wait_success() {
        let registry = OperationRegistry::new();
        let (id, descriptor) = registry
            .spawn(
                "/1.0/containers/web1",
                Box::new(|| Box::pin(async { Ok(()) })),
                None,
            )
            .await;
        assert_eq!(descriptor.status, OperationStatus::Pending);

        let op = registry.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(op.status, OperationStatus::Done);
        assert_eq!(op.result, Some(OperationResult::Success));
        assert_eq!(op.resource_url, "/1.0/containers/web1");
    }

    #[tokio::test]
    async fn test_spawn_and_wait_failure() {
        let registry = OperationRegistry::new();
        let (id, _) = registry
            .spawn(
                "/1.0/containers/web1",
                Box::new(|| Box::pin(async { Err("disk full".to_string()) })),
                None,
            )
            .await;

        let op = registry.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(op.status, OperationStatus::Done);
        assert_eq!(op.result, Some(OperationResult::Failure));
        assert_eq!(op.get_error().unwrap(), "disk full");
    }

    #[tokio::test]
    async fn test_wait_after_terminal_returns_immediately() {
        let registry = OperationRegistry::new();
        let (id, _) = registry
            .spawn(
                "/1.0/containers/web1",
                Box::new(|| Box::pin(async { Ok(()) })),
                None,
            )
            .await;

        let first = registry.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert!(first.status.is_terminal());

        // Repeated waits on a finished operation need no signal slot.
        let second = registry.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(second.status, OperationStatus::Done);
    }

    #[tokio::test]
    async fn test_second_concurrent_waiter_rejected() {
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let registry = Arc::new(OperationRegistry::new());
        let (id, _) = registry
            .spawn(
                "/1.0/containers/web1",
                Box::new(move || {
                    Box::pin(async move {
                        let _ = hold_rx.await;
                        Ok(())
                    })
                }),
                None,
            )
            .await;

        let waiter = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            tokio::spawn(async move { registry.wait(&id, Duration::from_secs(10)).await })
        };

        // Give the first waiter time to claim the slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = registry.wait(&id, Duration::from_secs(1)).await;
        assert!(matches!(second, Err(OperationError::WaiterClaimed)));

        hold_tx.send(()).unwrap();
        let op = waiter.await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Done);
    }

    #[tokio::test]
    async fn test_bounded_wait_returns_current_status() {
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let registry = OperationRegistry::new();
        let (id, _) = registry
            .spawn(
                "/1.0/containers/web1",
                Box::new(move || {
                    Box::pin(async move {
                        let _ = hold_rx.await;
                        Ok(())
                    })
                }),
                None,
            )
            .await;

        let op = registry.wait(&id, Duration::from_millis(50)).await.unwrap();
        assert_eq!(op.status, OperationStatus::Running);

        // The slot was handed back; a later wait sees completion.
        hold_tx.send(()).unwrap();
        let op = registry.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(op.status, OperationStatus::Done);
    }

    #[tokio::test]
    async fn test_cancel_running_operation() {
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let hold_tx = Arc::new(std::sync::Mutex::new(Some(hold_tx)));
        let cancel_tx = Arc::clone(&hold_tx);

        let registry = OperationRegistry::new();
        let (id, _) = registry
            .spawn(
                "/1.0/containers/web1",
                Box::new(move || {
                    Box::pin(async move {
                        let _ = hold_rx.await;
                        Ok(())
                    })
                }),
                // The hook releases the work unit, which then observes
                // Cancelling and lands in Cancelled.
                Some(Box::new(move || {
                    if let Some(tx) = cancel_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                })),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let op = registry.cancel(&id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Cancelling);
        assert!(!op.may_cancel);

        let op = registry.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(op.status, OperationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_after_done_rejected() {
        let registry = OperationRegistry::new();
        let (id, _) = registry
            .spawn(
                "/1.0/containers/web1",
                Box::new(|| Box::pin(async { Ok(()) })),
                Some(Box::new(|| {})),
            )
            .await;

        registry.wait(&id, Duration::from_secs(5)).await.unwrap();
        let result = registry.cancel(&id).await;
        assert!(matches!(result, Err(OperationError::AlreadyCompleted)));
    }

    #[tokio::test]
    async fn test_cancel_without_hook_rejected() {
        let (_hold_tx, hold_rx) = oneshot::channel::<()>();
        let registry = OperationRegistry::new();
        let (id, _) = registry
            .spawn(
                "/1.0/containers/web1",
                Box::new(move || {
                    Box::pin(async move {
                        let _ = hold_rx.await;
                        Ok(())
                    })
                }),
                None,
            )
            .await;

        // No cancellation hook means may_cancel never held.
        let result = registry.cancel(&id).await;
        assert!(matches!(result, Err(OperationError::AlreadyCompleted)));
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let registry = OperationRegistry::new();
        assert!(matches!(
            registry.get("missing").await,
            Err(OperationError::NotFound(_))
        ));
        assert!(matches!(
            registry.wait("missing", Duration::from_secs(1)).await,
            Err(OperationError::NotFound(_))
        ));
    }

    #[test]
    fn test_operation_ids_are_unique() {
        let a = new_operation_id();
        let b = new_operation_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
