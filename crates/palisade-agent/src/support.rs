use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const DEFAULT_LIVENESS_POLL_MS: u64 = 100;
const DEFAULT_EVENTS_MAX: usize = 100_000;
const DEFAULT_MIN_FREE_SPACE_BYTES: u64 = 1024 * 1024 * 1024; // 1 GiB

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

/// Interval at which stop/startup loops re-probe process liveness.
pub(crate) fn liveness_poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("PALISADE_LIVENESS_POLL_MS")
            .map(|v| v.clamp(10, 5_000))
            .unwrap_or(DEFAULT_LIVENESS_POLL_MS),
    )
}

/// Upper bound on retained event log entries per instance. Retention beyond
/// this is an external policy concern; the cap only guards a long-lived
/// daemon against unbounded growth.
pub(crate) fn events_max() -> usize {
    env_usize("PALISADE_EVENTS_MAX")
        .map(|v| v.clamp(1_000, 10_000_000))
        .unwrap_or(DEFAULT_EVENTS_MAX)
}

/// Bound on one status/ping exchange.
pub(crate) fn query_timeout() -> Duration {
    Duration::from_millis(
        env_u64("PALISADE_QUERY_TIMEOUT_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(3_000),
    )
}

pub(crate) fn min_free_space_bytes() -> u64 {
    env_u64("PALISADE_MIN_FREE_SPACE_BYTES")
        .map(|v| v.clamp(0, 1024_u64 * 1024 * 1024 * 1024))
        .unwrap_or(DEFAULT_MIN_FREE_SPACE_BYTES)
}

#[cfg(unix)]
pub(crate) fn free_bytes(p: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c = CString::new(p.as_os_str().as_bytes()).ok()?;
    let mut s: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut s) };
    if rc != 0 {
        return None;
    }
    Some(s.f_bsize.saturating_mul(s.f_bavail))
}

#[cfg(not(unix))]
pub(crate) fn free_bytes(_p: &Path) -> Option<u64> {
    None
}

pub(crate) fn ensure_min_free_space(path: &Path) -> anyhow::Result<()> {
    let min = min_free_space_bytes();
    if min == 0 {
        return Ok(());
    }

    let Some(free) = free_bytes(path) else {
        return Ok(());
    };
    if free < min {
        anyhow::bail!(
            "insufficient disk space: free {} bytes < required {} bytes at {} (set PALISADE_MIN_FREE_SPACE_BYTES=0 to disable)",
            free,
            min,
            path.display()
        );
    }
    Ok(())
}

/// Cooperative cancellation for an in-flight backup/archive/restore.
///
/// Engines check the flag between files; on observation they unwind their
/// staging area and return a cancelled outcome, leaving the target in its
/// prior valid state.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Atomically replace `dest` with the fully staged directory `staging`.
///
/// `staging` must live next to `dest` (same filesystem). On failure the
/// previous `dest`, if any, is put back; the destination is never left as a
/// mix of old and new.
pub(crate) fn swap_dir_into_place(staging: &Path, dest: &Path) -> anyhow::Result<()> {
    use anyhow::Context;

    let dest_name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("invalid destination {}", dest.display()))?;
    let parent = dest
        .parent()
        .with_context(|| format!("destination {} has no parent", dest.display()))?;

    let old = parent.join(format!(".{dest_name}.swap-old"));
    let _ = std::fs::remove_dir_all(&old);
    let had_dest = dest.exists();
    if had_dest {
        std::fs::rename(dest, &old).context("stage out old data")?;
    }
    if let Err(e) = std::fs::rename(staging, dest) {
        if had_dest {
            let _ = std::fs::rename(&old, dest);
        }
        return Err(anyhow::Error::new(e).context("swap in staged data"));
    }
    let _ = std::fs::remove_dir_all(&old);
    Ok(())
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_dedups_adjacent_messages() {
        let inner = anyhow::anyhow!("disk full");
        let err = inner.context("disk full").context("write manifest");
        assert_eq!(format_error_chain(&err), "write manifest: disk full");
    }

    #[test]
    fn error_chain_handles_empty() {
        let err = anyhow::anyhow!("");
        assert_eq!(format_error_chain(&err), "unknown error");
    }
}
