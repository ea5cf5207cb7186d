use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use palisade_instance::{InstanceDefinition, StopMode};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::support;

const DEFAULT_OUTPUT_MAX_LINES: usize = 1000;

fn output_max_lines() -> usize {
    support::env_usize("PALISADE_OUTPUT_MAX_LINES")
        .map(|v| v.clamp(100, 50_000))
        .unwrap_or(DEFAULT_OUTPUT_MAX_LINES)
}

/// Ring buffer of recent console output, sequence-numbered so callers can
/// tail incrementally with a cursor.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self {
            next_seq: 1,
            max_lines: output_max_lines(),
            lines: VecDeque::new(),
        }
    }
}

impl OutputBuffer {
    fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        // Cursor 0 means "the most recent lines".
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

#[derive(Debug)]
struct SessionShared {
    instance: String,
    pid: u32,
    pgid: i32,
    started_at: DateTime<Utc>,
    stdin: Mutex<Option<ChildStdin>>,
    output: Mutex<OutputBuffer>,
    exit_code: std::sync::Mutex<Option<Option<i32>>>,
}

/// Handle to one detached session. Cheap to clone; the underlying process
/// keeps running regardless of how many handles exist.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.shared.started_at
    }

    pub fn instance(&self) -> &str {
        &self.shared.instance
    }

    /// Exit code once the process has been reaped; `Some(None)` means it was
    /// terminated by a signal.
    pub fn exit_code(&self) -> Option<Option<i32>> {
        *self
            .shared
            .exit_code
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the supervisor dies, don't leave the server process orphaned.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0: existence probe only, never blocks.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) {}

/// Spawns and controls detached sessions, one per instance name.
///
/// A session is a process group of its own (`setsid`), so the server keeps
/// running independent of any attached controller and can be terminated as
/// a unit.
#[derive(Clone, Debug, Default)]
pub struct ProcessSession {
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl ProcessSession {
    /// Spawn a new session for `def`.
    ///
    /// Fails with [`Error::AlreadyRunning`] if a live session for the
    /// instance already exists; a dead leftover handle is replaced.
    pub async fn start(&self, def: &InstanceDefinition) -> Result<SessionHandle> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(existing) = sessions.get(&def.name)
                && self.is_alive(existing)
            {
                return Err(Error::AlreadyRunning(def.name.clone()));
            }
        }

        std::fs::create_dir_all(&def.data_dir)
            .map_err(|e| Error::StartFailure(format!("create data dir: {e}")))?;
        support::ensure_min_free_space(&def.data_dir)
            .map_err(|e| Error::StartFailure(support::format_error_chain(&e)))?;

        let mut cmd = Command::new(&def.command);
        cmd.args(&def.args)
            .current_dir(&def.data_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::StartFailure(format!(
                "spawn {} (cwd {}): {e}",
                def.command,
                def.data_dir.display()
            ))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::StartFailure("spawned process has no pid".to_string()))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let shared = Arc::new(SessionShared {
            instance: def.name.clone(),
            pid,
            pgid: pid as i32,
            started_at: Utc::now(),
            stdin: Mutex::new(stdin),
            output: Mutex::new(OutputBuffer::default()),
            exit_code: std::sync::Mutex::new(None),
        });
        let handle = SessionHandle {
            shared: shared.clone(),
        };

        if let Some(out) = stdout {
            let shared = shared.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    shared.output.lock().await.push_line(format!("[stdout] {line}"));
                }
            });
        }
        if let Some(err) = stderr {
            let shared = shared.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    shared.output.lock().await.push_line(format!("[stderr] {line}"));
                }
            });
        }

        // Reap the child and record how it exited.
        {
            let shared = shared.clone();
            tokio::spawn(async move {
                let res = child.wait().await;
                let code = match &res {
                    Ok(status) => status.code(),
                    Err(_) => None,
                };
                *shared.stdin.lock().await = None;
                *shared
                    .exit_code
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(code);
                shared
                    .output
                    .lock()
                    .await
                    .push_line(format!("[palisade] process exited: code={code:?}"));
            });
        }

        tracing::info!(instance = %def.name, pid, "session spawned");

        let mut sessions = self.sessions.lock().await;
        sessions.insert(def.name.clone(), handle.clone());
        Ok(handle)
    }

    /// Bounded liveness probe; never blocks.
    pub fn is_alive(&self, handle: &SessionHandle) -> bool {
        if handle.exit_code().is_some() {
            return false;
        }
        pid_alive(handle.shared.pid)
    }

    /// Write one console line to the session's stdin, best-effort.
    pub async fn send_line(&self, handle: &SessionHandle, text: &str) -> Result<()> {
        if !self.is_alive(handle) {
            return Err(Error::SessionUnreachable(format!(
                "instance '{}' has no live session",
                handle.shared.instance
            )));
        }

        let mut stdin = handle.shared.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(Error::SessionUnreachable(format!(
                "stdin for '{}' is closed",
                handle.shared.instance
            )));
        };

        let mut line = text.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        if let Err(e) = pipe.write_all(line.as_bytes()).await {
            *stdin = None;
            return Err(Error::SessionUnreachable(format!("write stdin: {e}")));
        }
        if let Err(e) = pipe.flush().await {
            *stdin = None;
            return Err(Error::SessionUnreachable(format!("flush stdin: {e}")));
        }
        Ok(())
    }

    /// Graceful stop: send `stop_command`, poll liveness until
    /// `graceful_timeout`, then force-kill the process group.
    pub async fn stop(
        &self,
        handle: &SessionHandle,
        stop_command: &str,
        graceful_timeout: Duration,
    ) -> Result<StopMode> {
        if !self.is_alive(handle) {
            return Ok(StopMode::Graceful);
        }

        // Best-effort: an unreachable stdin just means we skip straight to
        // the liveness wait and the kill escalation.
        if let Err(e) = self.send_line(handle, stop_command).await {
            tracing::debug!(instance = %handle.shared.instance, %e, "graceful stop line not delivered");
        }

        let deadline = tokio::time::Instant::now() + graceful_timeout;
        let poll = support::liveness_poll_interval();
        while tokio::time::Instant::now() < deadline {
            if !self.is_alive(handle) {
                tracing::info!(instance = %handle.shared.instance, "session stopped gracefully");
                return Ok(StopMode::Graceful);
            }
            tokio::time::sleep(poll).await;
        }

        self.kill(handle).await;
        tracing::warn!(instance = %handle.shared.instance, "session force-killed after graceful timeout");
        Ok(StopMode::Forced)
    }

    /// Immediate forced termination of the whole process group. Idempotent:
    /// a session that is already gone is not an error.
    pub async fn kill(&self, handle: &SessionHandle) {
        if self.is_alive(handle) {
            kill_group(handle.shared.pgid);
        }

        // Wait (bounded) for the reaper so callers observe a dead session.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let poll = support::liveness_poll_interval();
        while self.is_alive(handle) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(poll).await;
        }
    }

    /// Recent console output after `cursor`; returns the new cursor.
    pub async fn tail_output(
        &self,
        handle: &SessionHandle,
        cursor: u64,
        limit: usize,
    ) -> (Vec<String>, u64) {
        handle.shared.output.lock().await.tail_after(cursor, limit)
    }

    /// Currently tracked session for an instance, if any (may be dead).
    pub async fn get(&self, instance: &str) -> Option<SessionHandle> {
        self.sessions.lock().await.get(instance).cloned()
    }

    /// Drop the tracked handle for an instance (the process, if any, is
    /// untouched).
    pub async fn forget(&self, instance: &str) {
        self.sessions.lock().await.remove(instance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sh_definition(name: &str, dir: &Path, script: &str) -> InstanceDefinition {
        InstanceDefinition {
            name: name.to_string(),
            data_dir: dir.to_path_buf(),
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            memory_mb: None,
            query_host: "127.0.0.1".to_string(),
            query_port: 25565,
            stop_command: "stop".to_string(),
            graceful_timeout_ms: 2_000,
            startup_confirm_ms: 100,
            pause_writes_on_live_backup: false,
        }
    }

    #[tokio::test]
    async fn start_is_rejected_while_alive() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = ProcessSession::default();
        let def = sh_definition("dup", dir.path(), "sleep 30");

        let handle = sessions.start(&def).await.unwrap();
        assert!(sessions.is_alive(&handle));

        let err = sessions.start(&def).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));

        sessions.kill(&handle).await;
        assert!(!sessions.is_alive(&handle));
    }

    #[tokio::test]
    async fn stop_resolves_graceful_when_command_honored() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = ProcessSession::default();
        let def = sh_definition(
            "graceful",
            dir.path(),
            r#"while read line; do [ "$line" = stop ] && exit 0; done"#,
        );

        let handle = sessions.start(&def).await.unwrap();
        let mode = sessions
            .stop(&handle, &def.stop_command, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(mode, StopMode::Graceful);
        assert!(!sessions.is_alive(&handle));
    }

    #[tokio::test]
    async fn stop_escalates_to_forced_kill() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = ProcessSession::default();
        // Ignores console input entirely.
        let def = sh_definition("stubborn", dir.path(), "while true; do sleep 1; done");

        let handle = sessions.start(&def).await.unwrap();
        let mode = sessions
            .stop(&handle, &def.stop_command, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(mode, StopMode::Forced);
        assert!(!sessions.is_alive(&handle));
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = ProcessSession::default();
        let def = sh_definition("kill-twice", dir.path(), "sleep 30");

        let handle = sessions.start(&def).await.unwrap();
        sessions.kill(&handle).await;
        sessions.kill(&handle).await;
        assert!(!sessions.is_alive(&handle));
    }

    #[tokio::test]
    async fn send_line_to_dead_session_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = ProcessSession::default();
        let def = sh_definition("dead", dir.path(), "exit 0");

        let handle = sessions.start(&def).await.unwrap();
        // Let the reaper observe the exit.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while sessions.is_alive(&handle) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let err = sessions.send_line(&handle, "hello").await.unwrap_err();
        assert!(matches!(err, Error::SessionUnreachable(_)));
    }

    #[tokio::test]
    async fn tail_output_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = ProcessSession::default();
        let def = sh_definition("chatty", dir.path(), "echo ready; sleep 30");

        let handle = sessions.start(&def).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut lines = Vec::new();
        while tokio::time::Instant::now() < deadline {
            let (tail, _) = sessions.tail_output(&handle, 0, 100).await;
            if !tail.is_empty() {
                lines = tail;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(lines.iter().any(|l| l == "[stdout] ready"), "got {lines:?}");

        sessions.kill(&handle).await;
    }

    #[test]
    fn output_buffer_tail_semantics() {
        let mut buf = OutputBuffer {
            next_seq: 1,
            max_lines: 3,
            lines: VecDeque::new(),
        };
        for i in 1..=5 {
            buf.push_line(format!("line {i}"));
        }
        // Capacity 3: lines 3..=5 retained.
        let (tail, cursor) = buf.tail_after(0, 10);
        assert_eq!(tail, vec!["line 3", "line 4", "line 5"]);
        assert_eq!(cursor, 5);

        let (tail, cursor) = buf.tail_after(4, 10);
        assert_eq!(tail, vec!["line 5"]);
        assert_eq!(cursor, 5);
    }
}
