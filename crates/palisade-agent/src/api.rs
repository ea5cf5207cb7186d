use std::sync::Arc;
use std::time::Duration;

use palisade_instance::{
    ArchiveRecord, EventLogEntry, IncrementInfo, InstanceDefinition, InstanceStateView,
    OperationId, OperationKind, StatusReport,
};
use tokio::sync::broadcast;

use crate::backup::RetentionPolicy;
use crate::error::Result;
use crate::lifecycle::LifecycleEngine;
use crate::registry::InstanceRegistry;

/// A state-changing request as submitted by an external collaborator.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum OperationRequest {
    Start,
    Stop {
        #[serde(default)]
        graceful_timeout_ms: Option<u64>,
    },
    Backup,
    Archive,
    Restore {
        target_seq: u64,
    },
    RestoreArchive {
        file_name: String,
    },
    StopAndBackup,
    Prune {
        keep_last: usize,
    },
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Start => OperationKind::Start,
            Self::Stop { .. } => OperationKind::Stop,
            Self::Backup => OperationKind::Backup,
            Self::Archive => OperationKind::Archive,
            Self::Restore { .. } | Self::RestoreArchive { .. } => OperationKind::Restore,
            Self::StopAndBackup => OperationKind::StopAndBackup,
            Self::Prune { .. } => OperationKind::Prune,
        }
    }
}

/// Outcome of submitting an operation request.
///
/// `Accepted` means the operation has begun under the instance's exclusive
/// lock, not that it finished; completion is observed by polling state or
/// following the event log.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum RequestDisposition {
    Accepted {
        operation_id: OperationId,
    },
    Rejected {
        code: String,
        reason: String,
    },
}

/// The narrow command/query interface the core exposes to its out-of-scope
/// web/CLI collaborators.
#[derive(Clone)]
pub struct Manager {
    engine: Arc<LifecycleEngine>,
}

impl Manager {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        Self { engine }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        self.engine.registry()
    }

    pub fn list_instances(&self) -> Vec<InstanceDefinition> {
        self.engine.registry().list()
    }

    pub fn get_instance_state(&self, name: &str) -> Result<InstanceStateView> {
        self.engine.view(name)
    }

    pub fn list_instance_states(&self) -> Vec<InstanceStateView> {
        self.engine.registry().views()
    }

    pub async fn get_status_snapshot(&self, name: &str) -> Result<StatusReport> {
        self.engine.status(name).await
    }

    /// Submit a state-changing operation.
    ///
    /// The instance lock is taken here, synchronously; on acceptance the
    /// operation body runs on its own task and the lock is released when it
    /// resolves to a stable state.
    pub fn request_operation(&self, name: &str, request: OperationRequest) -> RequestDisposition {
        let (runtime, guard) = match self.engine.begin(name, request.kind()) {
            Ok(pair) => pair,
            Err(err) => {
                return RequestDisposition::Rejected {
                    code: err.code().to_string(),
                    reason: err.to_string(),
                };
            }
        };

        let operation_id = OperationId::new();
        let engine = self.engine.clone();
        let op_id = operation_id.clone();
        tokio::spawn(async move {
            // The guard lives for the whole operation body.
            let _guard = guard;
            let result: Result<()> = match request {
                OperationRequest::Start => engine.start_locked(&runtime).await.map(drop),
                OperationRequest::Stop {
                    graceful_timeout_ms,
                } => engine
                    .stop_locked(&runtime, graceful_timeout_ms.map(Duration::from_millis))
                    .await
                    .map(drop),
                OperationRequest::Backup => engine.backup_locked(&runtime).await.map(drop),
                OperationRequest::Archive => engine.archive_locked(&runtime).await.map(drop),
                OperationRequest::Restore { target_seq } => engine
                    .restore_locked(&runtime, target_seq)
                    .await
                    .map(drop),
                OperationRequest::RestoreArchive { file_name } => engine
                    .restore_archive_locked(&runtime, &file_name)
                    .await
                    .map(drop),
                OperationRequest::StopAndBackup => {
                    engine.stop_and_backup_locked(&runtime).await.map(drop)
                }
                OperationRequest::Prune { keep_last } => {
                    engine
                        .prune_locked(&runtime, RetentionPolicy::KeepLast(keep_last))
                        .await
                }
            };
            match result {
                Ok(()) => {
                    tracing::debug!(instance = %runtime.name, operation_id = %op_id, "operation resolved");
                }
                Err(err) => {
                    tracing::warn!(instance = %runtime.name, operation_id = %op_id, %err, "operation failed");
                }
            }
        });

        RequestDisposition::Accepted { operation_id }
    }

    /// Ask the in-flight backup/archive/restore on `name` to cancel.
    pub fn cancel_operation(&self, name: &str) -> Result<bool> {
        self.engine.cancel(name)
    }

    /// Append-ordered event history after `cursor`, plus a live receiver
    /// for tail-following. Finite when replayed historically, effectively
    /// unbounded when followed live.
    pub fn stream_event_log(
        &self,
        name: &str,
        cursor: u64,
    ) -> Result<(Vec<EventLogEntry>, broadcast::Receiver<EventLogEntry>)> {
        self.engine.subscribe_events(name, cursor)
    }

    pub fn replay_event_log(&self, name: &str, cursor: u64) -> Result<Vec<EventLogEntry>> {
        self.engine.events_after(name, cursor)
    }

    pub async fn list_snapshots(&self, name: &str) -> Result<Vec<IncrementInfo>> {
        self.engine.list_increments(name).await
    }

    pub async fn list_archives(&self, name: &str) -> Result<Vec<ArchiveRecord>> {
        self.engine.list_archives(name).await
    }

    pub async fn tail_console(
        &self,
        name: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<String>, u64)> {
        self.engine.tail_console(name, cursor, limit).await
    }

    pub async fn send_console(&self, name: &str, line: &str) -> Result<()> {
        self.engine.send_console(name, line).await
    }
}
