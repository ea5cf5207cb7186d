use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use palisade_instance::{
    ArchiveRecord, EventOutcome, IncrementInfo, InstanceDefinition, InstanceState,
    InstanceStateView, OperationKind, OperationResult, StatusReport, StatusSnapshot, StopMode,
};

use crate::archive::ArchiveEngine;
use crate::backup::{BackupEngine, RetentionPolicy};
use crate::error::{Error, Result};
use crate::registry::{self, InstanceRegistry, InstanceRuntime};
use crate::session::ProcessSession;
use crate::status::StatusMonitor;
use crate::support;

/// Releases the in-flight marker when an operation's lock guard drops.
pub(crate) struct OpGuard {
    runtime: Arc<InstanceRuntime>,
    _lock: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        *self
            .runtime
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// The state machine and concurrency gate over all other components.
///
/// Exactly one state-changing operation per instance at a time, enforced by
/// an exclusive per-instance lock held from acceptance until the transient
/// state resolves back to `Down` or `Up`. Status reads never take the lock.
pub struct LifecycleEngine {
    registry: Arc<InstanceRegistry>,
    sessions: ProcessSession,
    backups: BackupEngine,
    archives: ArchiveEngine,
    monitor: StatusMonitor,
}

impl LifecycleEngine {
    /// `storage_root` holds the `backups/` and `archives/` working
    /// directories; instance data directories live wherever their
    /// definitions point.
    pub fn new(registry: Arc<InstanceRegistry>, storage_root: impl Into<PathBuf>) -> Self {
        let root = storage_root.into();
        Self {
            registry,
            sessions: ProcessSession::default(),
            backups: BackupEngine::new(root.join("backups")),
            archives: ArchiveEngine::new(root.join("archives")),
            monitor: StatusMonitor,
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Validate, resolve and lock: every state-changing operation funnels
    /// through here. Rejections happen before any state is touched.
    pub(crate) fn begin(
        &self,
        name: &str,
        op: OperationKind,
    ) -> Result<(Arc<InstanceRuntime>, OpGuard)> {
        registry::validate_instance_name(name)?;
        let runtime = self.registry.runtime(name)?;
        if runtime.lock_state().orphaned {
            return Err(Error::Orphaned(name.to_string()));
        }

        let lock = runtime.op_lock.clone().try_lock_owned().map_err(|_| {
            let in_flight = runtime
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .unwrap_or(op);
            Error::OperationInProgress {
                name: name.to_string(),
                operation: op,
                in_flight,
            }
        })?;

        *runtime
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(op);
        runtime.cancel.reset();

        let guard = OpGuard {
            runtime: runtime.clone(),
            _lock: lock,
        };
        Ok((runtime, guard))
    }

    /// A session that died underneath an `Up` state is folded back to
    /// `Down` before the next decision is made.
    fn reconcile_crashed(&self, runtime: &InstanceRuntime) {
        let mut state = runtime.lock_state();
        if state.state == InstanceState::Up {
            let alive = state
                .session
                .as_ref()
                .is_some_and(|s| self.sessions.is_alive(s));
            if !alive {
                tracing::warn!(instance = %runtime.name, "session died outside a stop; marking down");
                state.state = InstanceState::Down;
                state.session = None;
            }
        }
    }

    fn set_state(&self, runtime: &InstanceRuntime, state: InstanceState) {
        runtime.lock_state().state = state;
    }

    /// The one terminal event per operation outcome, mirrored into
    /// `last_result`.
    fn finish(
        &self,
        runtime: &InstanceRuntime,
        op: OperationKind,
        outcome: EventOutcome,
        detail: impl Into<String>,
    ) {
        let detail = detail.into();
        let entry = runtime.events.append(op, outcome, detail.clone());
        runtime.lock_state().last_result = Some(OperationResult {
            operation: op,
            outcome,
            detail,
            at: entry.at,
        });
    }

    fn outcome_of(err: &Error) -> EventOutcome {
        match err {
            Error::Cancelled { .. } => EventOutcome::Cancelled,
            _ => EventOutcome::Failure,
        }
    }

    /// Start the instance's server process.
    ///
    /// Idempotent when already `Up` (no new session, no event). Resolves to
    /// `Up` once the process has survived the definition's startup
    /// confirmation window, or back to `Down` with a `StartFailure`.
    pub async fn start(&self, name: &str) -> Result<InstanceStateView> {
        let (runtime, _guard) = self.begin(name, OperationKind::Start)?;
        self.start_locked(&runtime).await
    }

    pub(crate) async fn start_locked(
        &self,
        runtime: &Arc<InstanceRuntime>,
    ) -> Result<InstanceStateView> {
        let name = runtime.name.as_str();
        self.reconcile_crashed(runtime);

        {
            let state = runtime.lock_state();
            match state.state {
                InstanceState::Up => return Ok(runtime.view()),
                InstanceState::Down => {}
                other => {
                    return Err(Error::InvalidState {
                        name: name.to_string(),
                        operation: OperationKind::Start,
                        state: other,
                    });
                }
            }
        }

        let def = self.registry.get(name)?;
        self.set_state(&runtime, InstanceState::Starting);

        let handle = match self.sessions.start(&def).await {
            Ok(handle) => handle,
            Err(Error::AlreadyRunning(_)) => {
                // A live session we did not know about; adopt it.
                let handle = self.sessions.get(name).await;
                let mut state = runtime.lock_state();
                state.state = InstanceState::Up;
                state.session = handle;
                return Ok(runtime.view());
            }
            Err(err) => {
                self.set_state(&runtime, InstanceState::Down);
                let reason = err.to_string();
                self.finish(&runtime, OperationKind::Start, EventOutcome::Failure, &reason);
                return Err(Error::StartFailure(reason));
            }
        };

        // The process must outlive the confirmation window before the start
        // counts; an early exit is a start failure, not a crash.
        let deadline = tokio::time::Instant::now() + def.startup_confirm();
        let poll = support::liveness_poll_interval();
        while tokio::time::Instant::now() < deadline {
            if !self.sessions.is_alive(&handle) {
                break;
            }
            tokio::time::sleep(poll).await;
        }

        if !self.sessions.is_alive(&handle) {
            let (tail, _) = self.sessions.tail_output(&handle, 0, 5).await;
            self.sessions.forget(name).await;
            self.set_state(&runtime, InstanceState::Down);
            let reason = format!(
                "process exited during startup (code {:?}); last output: {}",
                handle.exit_code().flatten(),
                tail.join(" | ")
            );
            self.finish(&runtime, OperationKind::Start, EventOutcome::Failure, &reason);
            return Err(Error::StartFailure(reason));
        }

        {
            let mut state = runtime.lock_state();
            state.state = InstanceState::Up;
            state.session = Some(handle.clone());
        }
        self.finish(
            &runtime,
            OperationKind::Start,
            EventOutcome::Success,
            format!("session up (pid {})", handle.pid()),
        );
        Ok(runtime.view())
    }

    /// Stop the instance, gracefully first, forced after the timeout.
    ///
    /// Idempotent when already `Down` (no event). A forced kill still
    /// resolves to `Down` and counts as success-with-warning.
    pub async fn stop(&self, name: &str, timeout: Option<Duration>) -> Result<InstanceStateView> {
        let (runtime, _guard) = self.begin(name, OperationKind::Stop)?;
        self.stop_locked(&runtime, timeout).await
    }

    pub(crate) async fn stop_locked(
        &self,
        runtime: &Arc<InstanceRuntime>,
        timeout: Option<Duration>,
    ) -> Result<InstanceStateView> {
        self.reconcile_crashed(runtime);

        match self.stop_phase(runtime, OperationKind::Stop, timeout).await {
            Ok(None) => {} // already down, acknowledged idempotently
            Ok(Some(StopMode::Graceful)) => {
                self.finish(
                    &runtime,
                    OperationKind::Stop,
                    EventOutcome::Success,
                    "stopped gracefully",
                );
            }
            Ok(Some(StopMode::Forced)) => {
                self.finish(
                    &runtime,
                    OperationKind::Stop,
                    EventOutcome::Warning,
                    "forced kill after graceful timeout",
                );
            }
            Err(err) => {
                self.finish(&runtime, OperationKind::Stop, EventOutcome::Failure, err.to_string());
                return Err(err);
            }
        }
        Ok(runtime.view())
    }

    /// Append an increment to the instance's snapshot chain.
    ///
    /// Permitted while `Up`: the server keeps running and a best-effort
    /// write pause is requested around the walk. Consistency of a live
    /// capture is best-effort by design.
    pub async fn backup(&self, name: &str) -> Result<IncrementInfo> {
        let (runtime, _guard) = self.begin(name, OperationKind::Backup)?;
        self.backup_locked(&runtime).await
    }

    pub(crate) async fn backup_locked(
        &self,
        runtime: &Arc<InstanceRuntime>,
    ) -> Result<IncrementInfo> {
        let name = runtime.name.as_str();
        self.reconcile_crashed(runtime);
        let def = self.registry.get(name)?;

        let prior = self.enter_snapshot_state(&runtime, OperationKind::Backup, InstanceState::BackingUp)?;
        let paused = if prior == InstanceState::Up {
            self.pause_writes(&runtime, &def).await
        } else {
            false
        };

        let result = self
            .backups
            .create_increment(name, &def.data_dir, &runtime.cancel)
            .await;

        if paused {
            self.resume_writes(&runtime).await;
        }
        self.set_state(&runtime, prior);

        match result {
            Ok(info) => {
                self.finish(
                    &runtime,
                    OperationKind::Backup,
                    EventOutcome::Success,
                    format!(
                        "increment {} created ({} changed, {} removed)",
                        info.seq, info.files_changed, info.files_removed
                    ),
                );
                Ok(info)
            }
            Err(err) => {
                self.finish(&runtime, OperationKind::Backup, Self::outcome_of(&err), err.to_string());
                Err(err)
            }
        }
    }

    /// Produce a self-contained archive of the data directory. Permitted
    /// while `Up`, same live-capture caveats as backup.
    pub async fn archive(&self, name: &str) -> Result<ArchiveRecord> {
        let (runtime, _guard) = self.begin(name, OperationKind::Archive)?;
        self.archive_locked(&runtime).await
    }

    pub(crate) async fn archive_locked(
        &self,
        runtime: &Arc<InstanceRuntime>,
    ) -> Result<ArchiveRecord> {
        let name = runtime.name.as_str();
        self.reconcile_crashed(runtime);
        let def = self.registry.get(name)?;

        let prior = self.enter_snapshot_state(&runtime, OperationKind::Archive, InstanceState::Archiving)?;
        let paused = if prior == InstanceState::Up {
            self.pause_writes(&runtime, &def).await
        } else {
            false
        };

        let result = self
            .archives
            .create(name, &def.data_dir, &runtime.cancel)
            .await;

        if paused {
            self.resume_writes(&runtime).await;
        }
        self.set_state(&runtime, prior);

        match result {
            Ok(record) => {
                self.finish(
                    &runtime,
                    OperationKind::Archive,
                    EventOutcome::Success,
                    format!("archive {} created ({} bytes)", record.file_name, record.size_bytes),
                );
                Ok(record)
            }
            Err(err) => {
                self.finish(&runtime, OperationKind::Archive, Self::outcome_of(&err), err.to_string());
                Err(err)
            }
        }
    }

    /// Roll the data directory back to increment `target_seq`. Only from
    /// `Down`; on any failure the data directory is left untouched.
    pub async fn restore(&self, name: &str, target_seq: u64) -> Result<InstanceStateView> {
        let (runtime, _guard) = self.begin(name, OperationKind::Restore)?;
        self.restore_locked(&runtime, target_seq).await
    }

    pub(crate) async fn restore_locked(
        &self,
        runtime: &Arc<InstanceRuntime>,
        target_seq: u64,
    ) -> Result<InstanceStateView> {
        let name = runtime.name.as_str();
        self.reconcile_crashed(runtime);
        let def = self.registry.get(name)?;
        self.require_down(runtime, OperationKind::Restore)?;

        self.set_state(&runtime, InstanceState::Restoring);
        let result = self
            .backups
            .restore(name, target_seq, &def.data_dir, &runtime.cancel)
            .await;
        self.set_state(&runtime, InstanceState::Down);

        match result {
            Ok(()) => {
                self.finish(
                    &runtime,
                    OperationKind::Restore,
                    EventOutcome::Success,
                    format!("restored to increment {target_seq}"),
                );
                Ok(runtime.view())
            }
            Err(err) => {
                self.finish(&runtime, OperationKind::Restore, Self::outcome_of(&err), err.to_string());
                Err(err)
            }
        }
    }

    /// Roll the data directory back to a named archive. Only from `Down`.
    pub async fn restore_archive(&self, name: &str, file_name: &str) -> Result<InstanceStateView> {
        let (runtime, _guard) = self.begin(name, OperationKind::Restore)?;
        self.restore_archive_locked(&runtime, file_name).await
    }

    pub(crate) async fn restore_archive_locked(
        &self,
        runtime: &Arc<InstanceRuntime>,
        file_name: &str,
    ) -> Result<InstanceStateView> {
        let name = runtime.name.as_str();
        self.reconcile_crashed(runtime);
        let def = self.registry.get(name)?;
        self.require_down(runtime, OperationKind::Restore)?;

        self.set_state(&runtime, InstanceState::Restoring);
        let result = self
            .archives
            .extract(name, file_name, &def.data_dir, &runtime.cancel)
            .await;
        self.set_state(&runtime, InstanceState::Down);

        match result {
            Ok(()) => {
                self.finish(
                    &runtime,
                    OperationKind::Restore,
                    EventOutcome::Success,
                    format!("restored from archive {file_name}"),
                );
                Ok(runtime.view())
            }
            Err(err) => {
                self.finish(&runtime, OperationKind::Restore, Self::outcome_of(&err), err.to_string());
                Err(err)
            }
        }
    }

    /// Graceful stop followed by an increment, under one lock acquisition.
    pub async fn stop_and_backup(&self, name: &str) -> Result<IncrementInfo> {
        let (runtime, _guard) = self.begin(name, OperationKind::StopAndBackup)?;
        self.stop_and_backup_locked(&runtime).await
    }

    pub(crate) async fn stop_and_backup_locked(
        &self,
        runtime: &Arc<InstanceRuntime>,
    ) -> Result<IncrementInfo> {
        let name = runtime.name.as_str();
        self.reconcile_crashed(runtime);
        let def = self.registry.get(name)?;

        // Stop phase failures surface as the composite's failure.
        let stop_mode = match self.stop_phase(&runtime, OperationKind::StopAndBackup, None).await {
            Ok(mode) => mode,
            Err(err) => {
                self.finish(
                    &runtime,
                    OperationKind::StopAndBackup,
                    Self::outcome_of(&err),
                    err.to_string(),
                );
                return Err(err);
            }
        };

        self.set_state(&runtime, InstanceState::BackingUp);
        let result = self
            .backups
            .create_increment(name, &def.data_dir, &runtime.cancel)
            .await;
        self.set_state(&runtime, InstanceState::Down);

        match result {
            Ok(info) => {
                let outcome = match stop_mode {
                    Some(StopMode::Forced) => EventOutcome::Warning,
                    _ => EventOutcome::Success,
                };
                let stopped = match stop_mode {
                    None => "already down",
                    Some(StopMode::Graceful) => "stopped gracefully",
                    Some(StopMode::Forced) => "forced kill",
                };
                self.finish(
                    &runtime,
                    OperationKind::StopAndBackup,
                    outcome,
                    format!("{stopped}; increment {} created", info.seq),
                );
                Ok(info)
            }
            Err(err) => {
                self.finish(
                    &runtime,
                    OperationKind::StopAndBackup,
                    Self::outcome_of(&err),
                    err.to_string(),
                );
                Err(err)
            }
        }
    }

    /// Stop body without event emission; `stop` and the composite own their
    /// terminal events. `Ok(None)` means the instance was already down.
    async fn stop_phase(
        &self,
        runtime: &InstanceRuntime,
        op: OperationKind,
        timeout: Option<Duration>,
    ) -> Result<Option<StopMode>> {
        let handle = {
            let state = runtime.lock_state();
            match state.state {
                InstanceState::Down => return Ok(None),
                InstanceState::Up => state.session.clone(),
                other => {
                    return Err(Error::InvalidState {
                        name: runtime.name.clone(),
                        operation: op,
                        state: other,
                    });
                }
            }
        };
        let Some(handle) = handle else {
            // Up without a session cannot survive reconcile; resolve to
            // down rather than wedge the instance.
            self.set_state(runtime, InstanceState::Down);
            return Ok(None);
        };

        let def = self.registry.get(&runtime.name)?;
        let timeout = timeout.unwrap_or_else(|| def.graceful_timeout());
        self.set_state(runtime, InstanceState::Stopping);
        let result = self.sessions.stop(&handle, &def.stop_command, timeout).await;

        // Whatever happened, the session is no longer ours; resolve to down.
        {
            let mut state = runtime.lock_state();
            state.state = InstanceState::Down;
            state.session = None;
        }
        self.sessions.forget(&runtime.name).await;

        match result {
            Ok(mode) => Ok(Some(mode)),
            Err(e) => Err(Error::StopFailure(e.to_string())),
        }
    }

    /// Retire old increments per the retention policy.
    pub async fn prune(&self, name: &str, policy: RetentionPolicy) -> Result<()> {
        let (runtime, _guard) = self.begin(name, OperationKind::Prune)?;
        self.prune_locked(&runtime, policy).await
    }

    pub(crate) async fn prune_locked(
        &self,
        runtime: &Arc<InstanceRuntime>,
        policy: RetentionPolicy,
    ) -> Result<()> {
        let name = runtime.name.as_str();
        let report = match self.backups.prune(name, policy).await {
            Ok(report) => report,
            Err(err) => {
                self.finish(&runtime, OperationKind::Prune, Self::outcome_of(&err), err.to_string());
                return Err(err);
            }
        };
        self.finish(
            &runtime,
            OperationKind::Prune,
            EventOutcome::Success,
            format!(
                "retired {} increment(s), removed {} object(s)",
                report.retired.len(),
                report.objects_removed
            ),
        );
        Ok(())
    }

    /// Ask the in-flight backup/archive/restore to cancel. Returns whether
    /// an operation was in flight to receive the request.
    pub fn cancel(&self, name: &str) -> Result<bool> {
        let runtime = self.registry.runtime(name)?;
        let in_flight = runtime
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        if in_flight {
            runtime.cancel.cancel();
        }
        Ok(in_flight)
    }

    /// Read-only status: query the server's status protocol and reconcile
    /// with process presence. Never takes the operation lock; the snapshot
    /// carries the lifecycle state it was observed under.
    pub async fn status(&self, name: &str) -> Result<StatusReport> {
        let runtime = self.registry.runtime(name)?;
        let (observed_state, session, orphaned) = {
            let state = runtime.lock_state();
            (state.state, state.session.clone(), state.orphaned)
        };
        if orphaned {
            return Err(Error::Orphaned(name.to_string()));
        }
        let def = self.registry.get(name)?;

        let process_alive = session.as_ref().is_some_and(|s| self.sessions.is_alive(s));
        if !process_alive {
            let last_known = runtime.lock_state().last_status.clone();
            return Ok(StatusReport::Unreachable {
                reason: palisade_instance::QueryFailureReason::Refused,
                process_alive: false,
                last_known,
            });
        }

        match self
            .monitor
            .query(&def.query_host, def.query_port, support::query_timeout())
            .await
        {
            Ok(raw) => {
                let snapshot = StatusSnapshot {
                    players_online: raw.players_online,
                    players_max: raw.players_max,
                    motd: raw.motd,
                    server_version: raw.server_version,
                    latency_ms: raw.latency_ms,
                    observed_at: Utc::now(),
                    observed_state,
                };
                runtime.lock_state().last_status = Some(snapshot.clone());
                Ok(StatusReport::Online(snapshot))
            }
            Err(reason) => {
                let last_known = runtime.lock_state().last_status.clone();
                Ok(StatusReport::Unreachable {
                    reason,
                    // Re-probe: the process may have died during the query.
                    process_alive: session.as_ref().is_some_and(|s| self.sessions.is_alive(s)),
                    last_known,
                })
            }
        }
    }

    pub fn view(&self, name: &str) -> Result<InstanceStateView> {
        Ok(self.registry.runtime(name)?.view())
    }

    /// Replay the instance's event log after `cursor` (0 = from the start).
    pub fn events_after(
        &self,
        name: &str,
        cursor: u64,
    ) -> Result<Vec<palisade_instance::EventLogEntry>> {
        Ok(self.registry.runtime(name)?.events.replay_after(cursor))
    }

    /// Replay plus a live receiver for tail-following; see
    /// [`crate::events::EventLog::subscribe`].
    pub fn subscribe_events(
        &self,
        name: &str,
        cursor: u64,
    ) -> Result<(
        Vec<palisade_instance::EventLogEntry>,
        tokio::sync::broadcast::Receiver<palisade_instance::EventLogEntry>,
    )> {
        Ok(self.registry.runtime(name)?.events.subscribe(cursor))
    }

    pub async fn list_increments(&self, name: &str) -> Result<Vec<IncrementInfo>> {
        registry::validate_instance_name(name)?;
        self.registry.runtime(name)?;
        self.backups.list_increments(name).await
    }

    pub async fn list_archives(&self, name: &str) -> Result<Vec<ArchiveRecord>> {
        registry::validate_instance_name(name)?;
        self.registry.runtime(name)?;
        self.archives.list(name).await
    }

    /// Delete one archive by filename.
    pub async fn prune_archive(&self, name: &str, file_name: &str) -> Result<()> {
        let (runtime, _guard) = self.begin(name, OperationKind::Prune)?;
        match self.archives.prune(name, file_name).await {
            Ok(()) => {
                self.finish(
                    &runtime,
                    OperationKind::Prune,
                    EventOutcome::Success,
                    format!("archive {file_name} removed"),
                );
                Ok(())
            }
            Err(err) => {
                self.finish(&runtime, OperationKind::Prune, Self::outcome_of(&err), err.to_string());
                Err(err)
            }
        }
    }

    /// Recent console output of the instance's session.
    pub async fn tail_console(
        &self,
        name: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<String>, u64)> {
        let runtime = self.registry.runtime(name)?;
        let session = runtime.lock_state().session.clone();
        let Some(handle) = session else {
            return Err(Error::SessionUnreachable(format!(
                "instance '{name}' has no session"
            )));
        };
        Ok(self.sessions.tail_output(&handle, cursor, limit).await)
    }

    /// Write one console line to the running server.
    pub async fn send_console(&self, name: &str, line: &str) -> Result<()> {
        let runtime = self.registry.runtime(name)?;
        let session = runtime.lock_state().session.clone();
        let Some(handle) = session else {
            return Err(Error::SessionUnreachable(format!(
                "instance '{name}' has no session"
            )));
        };
        self.sessions.send_line(&handle, line).await
    }

    fn require_down(&self, runtime: &InstanceRuntime, op: OperationKind) -> Result<()> {
        let state = runtime.lock_state();
        if state.state != InstanceState::Down {
            return Err(Error::InvalidState {
                name: runtime.name.clone(),
                operation: op,
                state: state.state,
            });
        }
        Ok(())
    }

    /// Backup/archive run from either stable state; remember which one so
    /// the instance resolves back to it.
    fn enter_snapshot_state(
        &self,
        runtime: &InstanceRuntime,
        op: OperationKind,
        transient: InstanceState,
    ) -> Result<InstanceState> {
        let mut state = runtime.lock_state();
        match state.state {
            prior @ (InstanceState::Down | InstanceState::Up) => {
                state.state = transient;
                Ok(prior)
            }
            other => Err(Error::InvalidState {
                name: runtime.name.clone(),
                operation: op,
                state: other,
            }),
        }
    }

    /// Best-effort write pause before a live snapshot (save-off, save-all).
    /// Failure degrades to a plain live capture, never aborts the snapshot.
    async fn pause_writes(&self, runtime: &InstanceRuntime, def: &InstanceDefinition) -> bool {
        if !def.pause_writes_on_live_backup {
            return false;
        }
        let session = runtime.lock_state().session.clone();
        let Some(handle) = session else {
            return false;
        };
        for cmd in ["save-off", "save-all"] {
            if let Err(e) = self.sessions.send_line(&handle, cmd).await {
                tracing::debug!(instance = %runtime.name, cmd, %e, "write pause not delivered");
                return false;
            }
        }
        true
    }

    async fn resume_writes(&self, runtime: &InstanceRuntime) {
        let session = runtime.lock_state().session.clone();
        if let Some(handle) = session
            && let Err(e) = self.sessions.send_line(&handle, "save-on").await
        {
            tracing::debug!(instance = %runtime.name, %e, "write resume not delivered");
        }
    }
}
