use palisade_instance::{InstanceState, OperationKind};

pub type Result<T> = std::result::Result<T, Error>;

/// Operation-level error taxonomy.
///
/// Every variant carries a message suitable for direct display; operation
/// failures are always resolved to a stable instance state plus one logged
/// outcome before they surface here.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Rejected before any lock is taken; no state change occurred.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no such instance: {0}")]
    NotFound(String),

    /// The definition disappeared across a registry reload.
    #[error("instance '{0}' is orphaned; its definition was removed")]
    Orphaned(String),

    /// Another state-changing operation holds the instance lock.
    #[error("operation {operation} rejected: {in_flight} already in progress on '{name}'")]
    OperationInProgress {
        name: String,
        operation: OperationKind,
        in_flight: OperationKind,
    },

    /// A session for this instance already exists.
    #[error("session already running for '{0}'")]
    AlreadyRunning(String),

    /// The session no longer exists; callers should re-check liveness.
    #[error("session unreachable: {0}")]
    SessionUnreachable(String),

    #[error("start failed: {0}")]
    StartFailure(String),

    #[error("stop failed: {0}")]
    StopFailure(String),

    #[error("backup failed: {0}")]
    BackupFailure(String),

    #[error("archive failed: {0}")]
    ArchiveFailure(String),

    /// Restore failed; the destination directory was left untouched.
    #[error("restore failed: {0}")]
    RestoreFailure(String),

    /// An increment required for reconstruction is missing or unlinked.
    #[error("snapshot chain broken: {0}")]
    ChainBroken(String),

    /// Archive integrity marker mismatch; nothing was extracted.
    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),

    /// The in-flight operation was cancelled; prior state was restored.
    #[error("operation {operation} cancelled on '{name}'")]
    Cancelled {
        name: String,
        operation: OperationKind,
    },

    #[error("operation {operation} not valid while '{name}' is {state}")]
    InvalidState {
        name: String,
        operation: OperationKind,
        state: InstanceState,
    },
}

impl Error {
    /// Stable machine-readable code, mirrored into event log details.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Orphaned(_) => "orphaned",
            Self::OperationInProgress { .. } => "operation_in_progress",
            Self::AlreadyRunning(_) => "already_running",
            Self::SessionUnreachable(_) => "session_unreachable",
            Self::StartFailure(_) => "start_failure",
            Self::StopFailure(_) => "stop_failure",
            Self::BackupFailure(_) => "backup_failure",
            Self::ArchiveFailure(_) => "archive_failure",
            Self::RestoreFailure(_) => "restore_failure",
            Self::ChainBroken(_) => "chain_broken",
            Self::ArchiveCorrupt(_) => "archive_corrupt",
            Self::Cancelled { .. } => "cancelled",
            Self::InvalidState { .. } => "invalid_state",
        }
    }

    /// Recoverable errors leave the caller free to retry immediately or
    /// after the in-flight operation resolves.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound(_) | Self::OperationInProgress { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_presentable() {
        let err = Error::OperationInProgress {
            name: "survival1".to_string(),
            operation: OperationKind::Backup,
            in_flight: OperationKind::Start,
        };
        assert_eq!(
            err.to_string(),
            "operation backup rejected: start already in progress on 'survival1'"
        );
        assert_eq!(err.code(), "operation_in_progress");
        assert!(err.is_recoverable());
    }

    #[test]
    fn integrity_errors_are_not_recoverable() {
        assert!(!Error::ChainBroken("missing increment 2".to_string()).is_recoverable());
        assert!(!Error::ArchiveCorrupt("sha mismatch".to_string()).is_recoverable());
    }
}
