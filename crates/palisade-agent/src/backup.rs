use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use palisade_instance::{IncrementInfo, OperationKind};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::support::CancelFlag;

const HASH_CHUNK_BYTES: usize = 1024 * 1024;

/// One file as captured by an increment.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct FileEntry {
    hash: String,
    size: u64,
    mode: u32,
    mtime: i64,
}

/// Delta manifest against the immediate predecessor; the base entry (seq 0,
/// `parent: None`) carries the full tree. Manifests are written atomically
/// and never rewritten except when prune collapses the chain base.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Manifest {
    seq: u64,
    parent: Option<u64>,
    created_at: DateTime<Utc>,
    changed: BTreeMap<String, FileEntry>,
    removed: Vec<String>,
    /// Files skipped because they vanished or could not be read mid-walk
    /// (live backup tolerance).
    #[serde(default)]
    skipped: u64,
}

/// What to keep when pruning. The newest entry always survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    KeepLast(usize),
    KeepNewerThan(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub retired: Vec<u64>,
    pub objects_removed: usize,
}

/// Incremental, deduplicated snapshots of instance data directories.
///
/// Layout per instance under the backup root:
/// `increments/NNNNNN.json` delta manifests and `objects/<sha256>` payload
/// blobs shared across the chain. Reading a live data directory is safe for
/// the chain's own metadata; individual files may be captured torn, which is
/// a documented limitation of live backups.
#[derive(Debug, Clone)]
pub struct BackupEngine {
    root: PathBuf,
}

impl BackupEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn instance_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Capture the difference against the chain tip (full copy when the
    /// chain is empty) as the next increment.
    pub async fn create_increment(
        &self,
        name: &str,
        data_dir: &Path,
        cancel: &CancelFlag,
    ) -> Result<IncrementInfo> {
        let dir = self.instance_dir(name);
        let data_dir = data_dir.to_path_buf();
        let cancel = cancel.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || create_increment_sync(&name, &dir, &data_dir, &cancel))
            .await
            .map_err(|e| Error::BackupFailure(format!("backup task panicked: {e}")))?
    }

    /// Reconstruct the directory state as of `target_seq` into `dest`.
    ///
    /// Validates the whole chain `0..=target_seq` (including object
    /// presence) before mutating anything; the swap into `dest` is atomic.
    pub async fn restore(
        &self,
        name: &str,
        target_seq: u64,
        dest: &Path,
        cancel: &CancelFlag,
    ) -> Result<()> {
        let dir = self.instance_dir(name);
        let dest = dest.to_path_buf();
        let cancel = cancel.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || restore_sync(&name, &dir, target_seq, &dest, &cancel))
            .await
            .map_err(|e| Error::RestoreFailure(format!("restore task panicked: {e}")))?
    }

    /// Retire entries the policy no longer wants, collapsing them into the
    /// oldest survivor so every retained entry stays reconstructable, then
    /// garbage-collect unreferenced objects.
    pub async fn prune(&self, name: &str, policy: RetentionPolicy) -> Result<PruneReport> {
        let dir = self.instance_dir(name);
        tokio::task::spawn_blocking(move || prune_sync(&dir, policy))
            .await
            .map_err(|e| Error::BackupFailure(format!("prune task panicked: {e}")))?
    }

    /// Ordered chain listing.
    pub async fn list_increments(&self, name: &str) -> Result<Vec<IncrementInfo>> {
        let dir = self.instance_dir(name);
        tokio::task::spawn_blocking(move || {
            let manifests = load_manifests(&dir).map_err(to_backup_failure)?;
            Ok(manifests.iter().map(increment_info).collect())
        })
        .await
        .map_err(|e| Error::BackupFailure(format!("list task panicked: {e}")))?
    }
}

fn to_backup_failure(e: anyhow::Error) -> Error {
    Error::BackupFailure(crate::support::format_error_chain(&e))
}

fn increments_dir(dir: &Path) -> PathBuf {
    dir.join("increments")
}

fn objects_dir(dir: &Path) -> PathBuf {
    dir.join("objects")
}

fn manifest_path(dir: &Path, seq: u64) -> PathBuf {
    increments_dir(dir).join(format!("{seq:06}.json"))
}

fn increment_info(m: &Manifest) -> IncrementInfo {
    IncrementInfo {
        seq: m.seq,
        created_at: m.created_at,
        parent: m.parent,
        files_changed: m.changed.len(),
        files_removed: m.removed.len(),
        bytes_added: m.changed.values().map(|e| e.size).sum(),
    }
}

fn write_manifest(dir: &Path, m: &Manifest) -> anyhow::Result<()> {
    let path = manifest_path(dir, m.seq);
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(m).context("serialize manifest")?;
    fs::write(&tmp, data).context("write manifest tmp")?;
    fs::rename(&tmp, &path).context("persist manifest")?;
    Ok(())
}

fn load_manifests(dir: &Path) -> anyhow::Result<Vec<Manifest>> {
    let inc_dir = increments_dir(dir);
    if !inc_dir.exists() {
        return Ok(Vec::new());
    }

    let mut manifests = Vec::new();
    for entry in fs::read_dir(&inc_dir).context("read increments dir")? {
        let entry = entry.context("read increments entry")?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let m: Manifest = serde_json::from_slice(&raw)
            .with_context(|| format!("parse {}", path.display()))?;
        manifests.push(m);
    }
    manifests.sort_by_key(|m| m.seq);
    Ok(manifests)
}

/// The chain base `target` reconstructs from: the newest full entry
/// (`parent: None`) at or before it. Entries older than the base have been
/// collapsed away by prune.
fn chain_base(manifests: &[Manifest], target: u64) -> Result<u64> {
    manifests
        .iter()
        .filter(|m| m.parent.is_none() && m.seq <= target)
        .map(|m| m.seq)
        .max()
        .ok_or_else(|| {
            Error::ChainBroken(format!("no base increment at or before {target}"))
        })
}

/// Every entry from the base up to `target` present and linked to its
/// predecessor. Returns the base sequence number.
fn validate_chain(manifests: &[Manifest], target: u64) -> Result<u64> {
    let base = chain_base(manifests, target)?;
    let mut expected_parent: Option<u64> = None;
    for seq in base..=target {
        let Some(m) = manifests.iter().find(|m| m.seq == seq) else {
            return Err(Error::ChainBroken(format!("increment {seq} is missing")));
        };
        if m.parent != expected_parent {
            return Err(Error::ChainBroken(format!(
                "increment {seq} references parent {:?}, expected {:?}",
                m.parent, expected_parent
            )));
        }
        expected_parent = Some(seq);
    }
    Ok(base)
}

/// Fold manifests `base..=target` into the full tree view at `target`.
fn view_at(manifests: &[Manifest], base: u64, target: u64) -> BTreeMap<String, FileEntry> {
    let mut view = BTreeMap::new();
    for m in manifests.iter().filter(|m| m.seq >= base && m.seq <= target) {
        for path in &m.removed {
            view.remove(path);
        }
        for (path, entry) in &m.changed {
            view.insert(path.clone(), entry.clone());
        }
    }
    view
}

fn walk_files(base: &Path, dir: &Path, out: &mut Vec<(String, fs::Metadata)>) -> anyhow::Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.context("read dir entry")?;
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            walk_files(base, &path, out)?;
        } else if file_type.is_file() {
            let Ok(meta) = entry.metadata() else {
                // Vanished mid-walk; the caller counts it as skipped.
                continue;
            };
            let rel = path
                .strip_prefix(base)
                .context("strip data dir prefix")?
                .to_string_lossy()
                .replace('\\', "/");
            out.push((rel, meta));
        }
        // Symlinks and special files are not captured.
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

fn file_mtime(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Stream `src` into the object store, hashing on the way. Returns the
/// content hash and byte count, or `None` if the file vanished mid-read.
fn store_object(objects: &Path, src: &Path) -> anyhow::Result<Option<(String, u64)>> {
    let Ok(mut file) = fs::File::open(src) else {
        return Ok(None);
    };

    let tmp = objects.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    let mut out = fs::File::create(&tmp).context("create object tmp")?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];
    let mut total = 0u64;
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => {
                // Torn read on a live file: drop the partial object.
                drop(out);
                let _ = fs::remove_file(&tmp);
                return Ok(None);
            }
        };
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n]).context("write object tmp")?;
        total += n as u64;
    }
    out.flush().context("flush object tmp")?;
    drop(out);

    let hash = hex::encode(hasher.finalize());
    let dest = objects.join(&hash);
    if dest.exists() {
        let _ = fs::remove_file(&tmp);
    } else {
        fs::rename(&tmp, &dest).context("persist object")?;
    }
    Ok(Some((hash, total)))
}

fn cancelled(name: &str, operation: OperationKind) -> Error {
    Error::Cancelled {
        name: name.to_string(),
        operation,
    }
}

fn create_increment_sync(
    name: &str,
    dir: &Path,
    data_dir: &Path,
    cancel: &CancelFlag,
) -> Result<IncrementInfo> {
    fs::create_dir_all(increments_dir(dir)).map_err(|e| Error::BackupFailure(e.to_string()))?;
    fs::create_dir_all(objects_dir(dir)).map_err(|e| Error::BackupFailure(e.to_string()))?;

    let manifests = load_manifests(dir).map_err(to_backup_failure)?;
    let (seq, parent, tip_view) = match manifests.last() {
        Some(tip) => {
            let base = validate_chain(&manifests, tip.seq)?;
            (
                tip.seq + 1,
                Some(tip.seq),
                view_at(&manifests, base, tip.seq),
            )
        }
        None => (0, None, BTreeMap::new()),
    };

    let mut files = Vec::new();
    walk_files(data_dir, data_dir, &mut files).map_err(to_backup_failure)?;

    let objects = objects_dir(dir);
    let mut changed = BTreeMap::new();
    let mut seen = BTreeSet::new();
    let mut skipped = 0u64;

    for (rel, meta) in files {
        if cancel.is_cancelled() {
            return Err(cancelled(name, OperationKind::Backup));
        }
        seen.insert(rel.clone());

        let mode = file_mode(&meta);
        let mtime = file_mtime(&meta);

        // Quick check: same size and mtime as the tip means same content.
        if let Some(prev) = tip_view.get(&rel)
            && prev.size == meta.len()
            && prev.mtime == mtime
        {
            if prev.mode != mode {
                changed.insert(rel, FileEntry { mode, ..prev.clone() });
            }
            continue;
        }

        match store_object(&objects, &data_dir.join(&rel)).map_err(to_backup_failure)? {
            Some((hash, size)) => {
                let entry = FileEntry { hash, size, mode, mtime };
                if tip_view.get(&rel) != Some(&entry) {
                    changed.insert(rel, entry);
                }
            }
            None => skipped += 1,
        }
    }

    let removed: Vec<String> = tip_view
        .keys()
        .filter(|path| !seen.contains(*path))
        .cloned()
        .collect();

    let manifest = Manifest {
        seq,
        parent,
        created_at: Utc::now(),
        changed,
        removed,
        skipped,
    };
    write_manifest(dir, &manifest).map_err(to_backup_failure)?;

    if skipped > 0 {
        tracing::warn!(instance = %name, seq, skipped, "live backup skipped unreadable files");
    }
    tracing::info!(
        instance = %name,
        seq,
        changed = manifest.changed.len(),
        removed = manifest.removed.len(),
        "increment created"
    );
    Ok(increment_info(&manifest))
}

fn restore_sync(
    name: &str,
    dir: &Path,
    target_seq: u64,
    dest: &Path,
    cancel: &CancelFlag,
) -> Result<()> {
    let manifests = load_manifests(dir).map_err(|e| Error::RestoreFailure(e.to_string()))?;
    let base = validate_chain(&manifests, target_seq)?;
    let view = view_at(&manifests, base, target_seq);

    // All objects must exist before anything is staged; restore never
    // partially overwrites the destination.
    let objects = objects_dir(dir);
    for (rel, entry) in &view {
        if !objects.join(&entry.hash).exists() {
            return Err(Error::ChainBroken(format!(
                "object {} for '{}' is missing",
                entry.hash, rel
            )));
        }
    }

    let dest_name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::RestoreFailure(format!("invalid destination {}", dest.display())))?;
    let parent_dir = dest
        .parent()
        .ok_or_else(|| Error::RestoreFailure(format!("destination {} has no parent", dest.display())))?;
    fs::create_dir_all(parent_dir).map_err(|e| Error::RestoreFailure(e.to_string()))?;

    let staging = parent_dir.join(format!(".{dest_name}.restore-tmp"));
    let _ = fs::remove_dir_all(&staging);
    if let Err(e) = stage_view(&objects, &view, &staging, cancel, name) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    // Atomic swap: the destination is either its prior state or the
    // restored state, never a mix.
    if let Err(e) = crate::support::swap_dir_into_place(&staging, dest) {
        let _ = fs::remove_dir_all(&staging);
        return Err(Error::RestoreFailure(crate::support::format_error_chain(&e)));
    }

    tracing::info!(instance = %name, target_seq, files = view.len(), "restore complete");
    Ok(())
}

fn stage_view(
    objects: &Path,
    view: &BTreeMap<String, FileEntry>,
    staging: &Path,
    cancel: &CancelFlag,
    name: &str,
) -> Result<()> {
    fs::create_dir_all(staging).map_err(|e| Error::RestoreFailure(e.to_string()))?;
    for (rel, entry) in view {
        if cancel.is_cancelled() {
            return Err(cancelled(name, OperationKind::Restore));
        }

        let target = staging.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::RestoreFailure(e.to_string()))?;
        }
        fs::copy(objects.join(&entry.hash), &target)
            .map_err(|e| Error::RestoreFailure(format!("stage '{rel}': {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&target, fs::Permissions::from_mode(entry.mode));
        }
    }
    Ok(())
}

fn prune_sync(dir: &Path, policy: RetentionPolicy) -> Result<PruneReport> {
    let manifests = load_manifests(dir).map_err(to_backup_failure)?;
    let Some(tip) = manifests.last() else {
        return Ok(PruneReport {
            retired: Vec::new(),
            objects_removed: 0,
        });
    };
    let base = validate_chain(&manifests, tip.seq)?;

    // The first surviving entry; the newest always survives.
    let keep_from = match policy {
        RetentionPolicy::KeepLast(n) => {
            let n = n.max(1);
            manifests.len().saturating_sub(n)
        }
        RetentionPolicy::KeepNewerThan(cutoff) => manifests
            .iter()
            .position(|m| m.created_at >= cutoff)
            .unwrap_or(manifests.len() - 1),
    };
    if keep_from == 0 {
        return Ok(PruneReport {
            retired: Vec::new(),
            objects_removed: 0,
        });
    }

    // Collapse retired deltas into the oldest survivor: it becomes the new
    // base carrying the full tree as of its sequence number.
    let survivor = &manifests[keep_from];
    let collapsed = Manifest {
        seq: survivor.seq,
        parent: None,
        created_at: survivor.created_at,
        changed: view_at(&manifests, base, survivor.seq),
        removed: Vec::new(),
        skipped: survivor.skipped,
    };
    write_manifest(dir, &collapsed).map_err(to_backup_failure)?;

    let mut retired = Vec::new();
    for m in &manifests[..keep_from] {
        fs::remove_file(manifest_path(dir, m.seq)).map_err(|e| {
            Error::BackupFailure(format!("remove retired increment {}: {e}", m.seq))
        })?;
        retired.push(m.seq);
    }

    // Collapsed survivors are no longer deltas, so every surviving manifest
    // after the new base must chain off it unchanged; only objects can be
    // orphaned. Collect live hashes, then sweep.
    let survivors = load_manifests(dir).map_err(to_backup_failure)?;
    let mut live = BTreeSet::new();
    for m in &survivors {
        for entry in m.changed.values() {
            live.insert(entry.hash.clone());
        }
    }

    let mut objects_removed = 0usize;
    let objects = objects_dir(dir);
    if objects.exists() {
        for entry in fs::read_dir(&objects).map_err(|e| Error::BackupFailure(e.to_string()))? {
            let entry = entry.map_err(|e| Error::BackupFailure(e.to_string()))?;
            let Some(hash) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if hash.starts_with(".tmp-") {
                continue;
            }
            if !live.contains(&hash) {
                let _ = fs::remove_file(entry.path());
                objects_removed += 1;
            }
        }
    }

    Ok(PruneReport {
        retired,
        objects_removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(base: &Path, rel: &str, contents: &[u8]) {
        let path = base.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn read_tree(base: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut files = Vec::new();
        walk_files(base, base, &mut files).unwrap();
        files
            .into_iter()
            .map(|(rel, _)| {
                let data = fs::read(base.join(&rel)).unwrap();
                (rel, data)
            })
            .collect()
    }

    async fn seed_chain(engine: &BackupEngine, data: &Path) -> CancelFlag {
        let cancel = CancelFlag::default();
        // seq 0: base
        write_file(data, "world/level.dat", b"level-v1");
        write_file(data, "server.properties", b"motd=hello");
        engine
            .create_increment("survival1", data, &cancel)
            .await
            .unwrap();

        // seq 1: change + add
        write_file(data, "world/level.dat", b"level-v2 with more bytes");
        write_file(data, "world/region.mca", b"region-data");
        engine
            .create_increment("survival1", data, &cancel)
            .await
            .unwrap();

        // seq 2: remove
        fs::remove_file(data.join("server.properties")).unwrap();
        engine
            .create_increment("survival1", data, &cancel)
            .await
            .unwrap();
        cancel
    }

    #[tokio::test]
    async fn increment_restore_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let engine = BackupEngine::new(tmp.path().join("backups"));
        let cancel = seed_chain(&engine, &data).await;

        let chain = engine.list_increments("survival1").await.unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].seq, 0);
        assert_eq!(chain[0].parent, None);
        assert_eq!(chain[2].parent, Some(1));

        // Restore each point-in-time and compare trees exactly.
        let at0 = tmp.path().join("restore0");
        engine.restore("survival1", 0, &at0, &cancel).await.unwrap();
        let tree0 = read_tree(&at0);
        assert_eq!(tree0.len(), 2);
        assert_eq!(tree0["world/level.dat"], b"level-v1");
        assert_eq!(tree0["server.properties"], b"motd=hello");

        let at1 = tmp.path().join("restore1");
        engine.restore("survival1", 1, &at1, &cancel).await.unwrap();
        let tree1 = read_tree(&at1);
        assert_eq!(tree1.len(), 3);
        assert_eq!(tree1["world/level.dat"], b"level-v2 with more bytes");

        let at2 = tmp.path().join("restore2");
        engine.restore("survival1", 2, &at2, &cancel).await.unwrap();
        assert_eq!(read_tree(&at2), read_tree(&data));
    }

    #[tokio::test]
    async fn unchanged_files_are_deduplicated() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let engine = BackupEngine::new(tmp.path().join("backups"));
        let cancel = CancelFlag::default();

        write_file(&data, "a.txt", b"same");
        write_file(&data, "b.txt", b"same");
        let base = engine.create_increment("survival1", &data, &cancel).await.unwrap();
        assert_eq!(base.files_changed, 2);

        // Identical content is stored once.
        let objects = tmp.path().join("backups/survival1/objects");
        assert_eq!(fs::read_dir(&objects).unwrap().count(), 1);

        // A no-change increment still extends the chain, with an empty delta.
        let next = engine.create_increment("survival1", &data, &cancel).await.unwrap();
        assert_eq!(next.seq, 1);
        assert_eq!(next.files_changed, 0);
        assert_eq!(next.files_removed, 0);
    }

    #[tokio::test]
    async fn restore_rejects_broken_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let engine = BackupEngine::new(tmp.path().join("backups"));
        let cancel = seed_chain(&engine, &data).await;

        fs::remove_file(tmp.path().join("backups/survival1/increments/000001.json")).unwrap();

        let dest = tmp.path().join("restore");
        let err = engine
            .restore("survival1", 2, &dest, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChainBroken(_)), "got {err}");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn restore_missing_object_leaves_destination_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let engine = BackupEngine::new(tmp.path().join("backups"));
        let cancel = seed_chain(&engine, &data).await;

        // Corrupt the object store.
        let objects = tmp.path().join("backups/survival1/objects");
        for entry in fs::read_dir(&objects).unwrap() {
            fs::remove_file(entry.unwrap().path()).unwrap();
        }

        let dest = tmp.path().join("dest");
        write_file(&dest, "precious.txt", b"do not clobber");
        let err = engine
            .restore("survival1", 2, &dest, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChainBroken(_)));
        assert_eq!(read_tree(&dest)["precious.txt"], b"do not clobber");
    }

    #[tokio::test]
    async fn prune_collapses_base_and_keeps_chain_restorable() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let engine = BackupEngine::new(tmp.path().join("backups"));
        let cancel = seed_chain(&engine, &data).await;

        let report = engine
            .prune("survival1", RetentionPolicy::KeepLast(2))
            .await
            .unwrap();
        assert_eq!(report.retired, vec![0]);

        let chain = engine.list_increments("survival1").await.unwrap();
        assert_eq!(chain.len(), 2);
        // The oldest survivor is the new base; nothing references seq 0.
        assert_eq!(chain[0].seq, 1);
        assert_eq!(chain[0].parent, None);
        assert_eq!(chain[1].parent, Some(1));

        // Both surviving points in time still restore exactly.
        let at1 = tmp.path().join("restore1");
        engine.restore("survival1", 1, &at1, &cancel).await.unwrap();
        assert_eq!(read_tree(&at1)["world/level.dat"], b"level-v2 with more bytes");
        assert!(read_tree(&at1).contains_key("server.properties"));

        let at2 = tmp.path().join("restore2");
        engine.restore("survival1", 2, &at2, &cancel).await.unwrap();
        assert_eq!(read_tree(&at2), read_tree(&data));

        // Restoring the retired entry is a broken-chain error, not a panic.
        let err = engine
            .restore("survival1", 0, &tmp.path().join("restore0"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChainBroken(_)));
    }

    #[tokio::test]
    async fn prune_sweeps_orphaned_objects() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let engine = BackupEngine::new(tmp.path().join("backups"));
        let cancel = CancelFlag::default();

        write_file(&data, "world.dat", b"generation-1");
        engine.create_increment("survival1", &data, &cancel).await.unwrap();
        write_file(&data, "world.dat", b"generation-2");
        engine.create_increment("survival1", &data, &cancel).await.unwrap();

        let report = engine
            .prune("survival1", RetentionPolicy::KeepLast(1))
            .await
            .unwrap();
        assert_eq!(report.retired, vec![0]);
        assert_eq!(report.objects_removed, 1);

        let objects = tmp.path().join("backups/survival1/objects");
        assert_eq!(fs::read_dir(&objects).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn cancelled_backup_leaves_chain_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let engine = BackupEngine::new(tmp.path().join("backups"));

        write_file(&data, "world.dat", b"state");
        let before = read_tree(&data);

        let cancel = CancelFlag::default();
        cancel.cancel();
        let err = engine
            .create_increment("survival1", &data, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));

        assert_eq!(read_tree(&data), before);
        assert!(engine.list_increments("survival1").await.unwrap().is_empty());
    }
}
