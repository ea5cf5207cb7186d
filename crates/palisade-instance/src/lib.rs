//! Shared plain-data types for the Palisade instance manager.
//!
//! Everything here is serializable state passed between the engine and its
//! callers; behavior lives in `palisade-agent`.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Identifier for one accepted state-changing operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of one instance.
///
/// `Down` and `Up` are the stable states; everything else is transient and
/// must resolve back to a stable state before another operation is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InstanceState {
    Down,
    Starting,
    Up,
    Stopping,
    BackingUp,
    Archiving,
    Restoring,
}

impl InstanceState {
    pub fn is_stable(self) -> bool {
        matches!(self, Self::Down | Self::Up)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Starting => "starting",
            Self::Up => "up",
            Self::Stopping => "stopping",
            Self::BackingUp => "backing_up",
            Self::Archiving => "archiving",
            Self::Restoring => "restoring",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stop resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StopMode {
    Graceful,
    Forced,
}

/// The state-changing operations the engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OperationKind {
    Start,
    Stop,
    Backup,
    Archive,
    Restore,
    StopAndBackup,
    Prune,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Backup => "backup",
            Self::Archive => "archive",
            Self::Restore => "restore",
            Self::StopAndBackup => "stop_and_backup",
            Self::Prune => "prune",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EventOutcome {
    Success,
    /// Succeeded, but something worth surfacing happened (e.g. forced kill).
    Warning,
    Failure,
    Cancelled,
}

/// One append-only event log record. Never rewritten once appended.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EventLogEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub operation: OperationKind,
    pub outcome: EventOutcome,
    pub detail: String,
}

/// Result of the most recent operation, kept on the runtime state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OperationResult {
    pub operation: OperationKind,
    pub outcome: EventOutcome,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Why a status query failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QueryFailureReason {
    Timeout,
    Refused,
    ProtocolError,
}

impl QueryFailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Refused => "refused",
            Self::ProtocolError => "protocol_error",
        }
    }
}

/// A successful status/ping exchange with a running server.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StatusSnapshot {
    pub players_online: u32,
    pub players_max: u32,
    pub motd: String,
    pub server_version: String,
    pub latency_ms: u64,
    pub observed_at: DateTime<Utc>,
    /// Lifecycle state the instance was in when this snapshot was taken.
    /// A snapshot never silently outlives a state transition unlabeled.
    pub observed_state: InstanceState,
}

/// Reconciled view of "is this instance reachable": the query result and the
/// process-presence signal are both exposed, never conflated.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum StatusReport {
    Online(StatusSnapshot),
    Unreachable {
        reason: QueryFailureReason,
        /// Whether the session process is still present. A live process with
        /// an unreachable protocol usually means "still starting up".
        process_alive: bool,
        /// Most recent successful snapshot, if any (stale, labeled as such).
        last_known: Option<StatusSnapshot>,
    },
}

/// One entry in an instance's incremental snapshot chain.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IncrementInfo {
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    /// Sequence number of the immediate predecessor; `None` for the base.
    pub parent: Option<u64>,
    pub files_changed: usize,
    pub files_removed: usize,
    pub bytes_added: u64,
}

/// One self-contained full archive, independent of the incremental chain.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ArchiveRecord {
    pub file_name: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    /// Integrity marker: hex sha256 of the archive file.
    pub sha256: String,
}

fn default_query_host() -> String {
    "127.0.0.1".to_string()
}

fn default_stop_command() -> String {
    "stop".to_string()
}

fn default_graceful_timeout_ms() -> u64 {
    30_000
}

fn default_startup_confirm_ms() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}

/// Immutable per-instance definition, produced by the definition source at
/// registry load time and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InstanceDefinition {
    pub name: String,
    pub data_dir: PathBuf,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default = "default_query_host")]
    pub query_host: String,
    pub query_port: u16,
    /// Console line that asks the server to shut down cleanly.
    #[serde(default = "default_stop_command")]
    pub stop_command: String,
    #[serde(default = "default_graceful_timeout_ms")]
    pub graceful_timeout_ms: u64,
    /// How long a freshly spawned process must stay alive before the start
    /// operation resolves to `Up`.
    #[serde(default = "default_startup_confirm_ms")]
    pub startup_confirm_ms: u64,
    /// Send save-off/save-on console commands around live snapshots.
    #[serde(default = "default_true")]
    pub pause_writes_on_live_backup: bool,
}

impl InstanceDefinition {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    pub fn startup_confirm(&self) -> Duration {
        Duration::from_millis(self.startup_confirm_ms)
    }
}

/// Point-in-time view of one instance's runtime state, as returned to
/// external callers.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InstanceStateView {
    pub name: String,
    pub state: InstanceState,
    pub session_pid: Option<u32>,
    pub last_status: Option<StatusSnapshot>,
    pub last_result: Option<OperationResult>,
    /// Set when the definition disappeared across a registry reload; no
    /// further operations are accepted.
    pub orphaned: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_id_is_non_empty() {
        let id = OperationId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn stable_states() {
        assert!(InstanceState::Down.is_stable());
        assert!(InstanceState::Up.is_stable());
        assert!(!InstanceState::BackingUp.is_stable());
        assert!(!InstanceState::Restoring.is_stable());
    }

    #[test]
    fn definition_defaults_deserialize() {
        let def: InstanceDefinition = serde_json::from_str(
            r#"{"name":"survival1","data_dir":"/srv/survival1","command":"java","query_port":25565}"#,
        )
        .unwrap();
        assert_eq!(def.query_host, "127.0.0.1");
        assert_eq!(def.stop_command, "stop");
        assert_eq!(def.graceful_timeout(), Duration::from_secs(30));
        assert!(def.pause_writes_on_live_backup);
    }
}
