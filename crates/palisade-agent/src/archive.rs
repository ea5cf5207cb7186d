use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use palisade_instance::{ArchiveRecord, OperationKind};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::support::CancelFlag;

const ZSTD_LEVEL: i32 = 3;
const HASH_CHUNK_BYTES: usize = 1024 * 1024;

/// Self-contained compressed full snapshots, independent of the incremental
/// chain. One `.tar.zst` per archive plus a `.json` sidecar carrying the
/// integrity marker; extraction verifies the marker and stages before
/// swapping, so a live destination is never partially overwritten.
#[derive(Debug, Clone)]
pub struct ArchiveEngine {
    root: PathBuf,
}

impl ArchiveEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn instance_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub async fn create(
        &self,
        name: &str,
        data_dir: &Path,
        cancel: &CancelFlag,
    ) -> Result<ArchiveRecord> {
        let dir = self.instance_dir(name);
        let data_dir = data_dir.to_path_buf();
        let cancel = cancel.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || create_sync(&name, &dir, &data_dir, &cancel))
            .await
            .map_err(|e| Error::ArchiveFailure(format!("archive task panicked: {e}")))?
    }

    pub async fn extract(
        &self,
        name: &str,
        file_name: &str,
        dest: &Path,
        cancel: &CancelFlag,
    ) -> Result<()> {
        let dir = self.instance_dir(name);
        let dest = dest.to_path_buf();
        let cancel = cancel.clone();
        let name = name.to_string();
        let file_name = file_name.to_string();
        tokio::task::spawn_blocking(move || extract_sync(&name, &dir, &file_name, &dest, &cancel))
            .await
            .map_err(|e| Error::ArchiveFailure(format!("extract task panicked: {e}")))?
    }

    /// All archives for an instance, oldest first. Archives have no ordering
    /// dependency between each other.
    pub async fn list(&self, name: &str) -> Result<Vec<ArchiveRecord>> {
        let dir = self.instance_dir(name);
        tokio::task::spawn_blocking(move || list_sync(&dir))
            .await
            .map_err(|e| Error::ArchiveFailure(format!("list task panicked: {e}")))?
    }

    /// Delete one archive and its sidecar by filename.
    pub async fn prune(&self, name: &str, file_name: &str) -> Result<()> {
        let dir = self.instance_dir(name);
        let file_name = validate_file_name(file_name)?;
        tokio::task::spawn_blocking(move || {
            let path = dir.join(&file_name);
            if !path.exists() {
                return Err(Error::NotFound(format!("archive {file_name}")));
            }
            fs::remove_file(&path).map_err(|e| Error::ArchiveFailure(e.to_string()))?;
            let _ = fs::remove_file(sidecar_path(&dir, &file_name));
            Ok(())
        })
        .await
        .map_err(|e| Error::ArchiveFailure(format!("prune task panicked: {e}")))?
    }
}

fn validate_file_name(file_name: &str) -> Result<String> {
    if file_name.is_empty()
        || file_name.contains('/')
        || file_name.contains('\\')
        || file_name.starts_with('.')
    {
        return Err(Error::Validation(format!("invalid archive name: {file_name}")));
    }
    Ok(file_name.to_string())
}

fn sidecar_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!("{file_name}.json"))
}

fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];
    loop {
        let n = file.read(&mut buf).context("read archive")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn walk_files(base: &Path, dir: &Path, out: &mut Vec<String>) -> anyhow::Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.context("read dir entry")?;
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            walk_files(base, &path, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(base)
                .context("strip data dir prefix")?
                .to_string_lossy()
                .replace('\\', "/");
            out.push(rel);
        }
    }
    Ok(())
}

fn create_sync(
    name: &str,
    dir: &Path,
    data_dir: &Path,
    cancel: &CancelFlag,
) -> Result<ArchiveRecord> {
    fs::create_dir_all(dir).map_err(|e| Error::ArchiveFailure(e.to_string()))?;

    let created_at = Utc::now();
    // Deterministic name from instance + timestamp; bump a counter in the
    // unlikely same-second collision.
    let stamp = created_at.format("%Y%m%d-%H%M%S");
    let mut file_name = format!("{name}-{stamp}.tar.zst");
    let mut counter = 1;
    while dir.join(&file_name).exists() {
        counter += 1;
        file_name = format!("{name}-{stamp}-{counter}.tar.zst");
    }

    let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    let result = write_archive(&tmp, name, data_dir, cancel);
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    let sha256 = sha256_file(&tmp).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::ArchiveFailure(crate::support::format_error_chain(&e))
    })?;
    let size_bytes = fs::metadata(&tmp)
        .map(|m| m.len())
        .map_err(|e| Error::ArchiveFailure(e.to_string()))?;

    let path = dir.join(&file_name);
    fs::rename(&tmp, &path).map_err(|e| Error::ArchiveFailure(format!("persist archive: {e}")))?;

    let record = ArchiveRecord {
        file_name: file_name.clone(),
        size_bytes,
        created_at,
        sha256,
    };
    let sidecar = sidecar_path(dir, &file_name);
    let sidecar_tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    let data = serde_json::to_vec_pretty(&record)
        .map_err(|e| Error::ArchiveFailure(format!("serialize record: {e}")))?;
    fs::write(&sidecar_tmp, data).map_err(|e| Error::ArchiveFailure(e.to_string()))?;
    fs::rename(&sidecar_tmp, &sidecar).map_err(|e| Error::ArchiveFailure(e.to_string()))?;

    tracing::info!(instance = %name, file = %file_name, bytes = size_bytes, "archive created");
    Ok(record)
}

fn write_archive(tmp: &Path, name: &str, data_dir: &Path, cancel: &CancelFlag) -> Result<()> {
    let file = fs::File::create(tmp).map_err(|e| Error::ArchiveFailure(e.to_string()))?;
    let encoder = zstd::Encoder::new(file, ZSTD_LEVEL)
        .map_err(|e| Error::ArchiveFailure(format!("init compressor: {e}")))?;
    let mut builder = tar::Builder::new(encoder);

    let mut files = Vec::new();
    walk_files(data_dir, data_dir, &mut files)
        .map_err(|e| Error::ArchiveFailure(crate::support::format_error_chain(&e)))?;

    for rel in files {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                name: name.to_string(),
                operation: OperationKind::Archive,
            });
        }
        let src = data_dir.join(&rel);
        // Files can vanish under a live archive; skip them like the backup
        // walk does.
        if let Err(e) = builder.append_path_with_name(&src, &rel) {
            if e.kind() == std::io::ErrorKind::NotFound {
                tracing::warn!(instance = %name, file = %rel, "file vanished during archive");
                continue;
            }
            return Err(Error::ArchiveFailure(format!("append '{rel}': {e}")));
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::ArchiveFailure(format!("finish tar: {e}")))?;
    let mut file = encoder
        .finish()
        .map_err(|e| Error::ArchiveFailure(format!("finish compressor: {e}")))?;
    file.flush()
        .map_err(|e| Error::ArchiveFailure(format!("flush archive: {e}")))?;
    Ok(())
}

fn load_record(dir: &Path, file_name: &str) -> Result<ArchiveRecord> {
    let raw = fs::read(sidecar_path(dir, file_name))
        .map_err(|_| Error::NotFound(format!("archive record for {file_name}")))?;
    serde_json::from_slice(&raw)
        .map_err(|e| Error::ArchiveFailure(format!("parse record for {file_name}: {e}")))
}

fn extract_sync(
    name: &str,
    dir: &Path,
    file_name: &str,
    dest: &Path,
    cancel: &CancelFlag,
) -> Result<()> {
    let file_name = validate_file_name(file_name)?;
    let record = load_record(dir, &file_name)?;
    let path = dir.join(&file_name);
    if !path.exists() {
        return Err(Error::NotFound(format!("archive {file_name}")));
    }

    // Integrity gate before anything is unpacked.
    let actual = sha256_file(&path)
        .map_err(|e| Error::ArchiveFailure(crate::support::format_error_chain(&e)))?;
    if actual != record.sha256 {
        return Err(Error::ArchiveCorrupt(format!(
            "{file_name}: sha256 {actual} does not match recorded {}",
            record.sha256
        )));
    }

    let dest_name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::ArchiveFailure(format!("invalid destination {}", dest.display())))?;
    let parent = dest
        .parent()
        .ok_or_else(|| Error::ArchiveFailure(format!("destination {} has no parent", dest.display())))?;
    fs::create_dir_all(parent).map_err(|e| Error::ArchiveFailure(e.to_string()))?;

    let staging = parent.join(format!(".{dest_name}.extract-tmp"));
    let _ = fs::remove_dir_all(&staging);
    if let Err(e) = unpack_into(&path, &staging, name, cancel) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    if let Err(e) = crate::support::swap_dir_into_place(&staging, dest) {
        let _ = fs::remove_dir_all(&staging);
        return Err(Error::ArchiveFailure(crate::support::format_error_chain(&e)));
    }

    tracing::info!(instance = %name, file = %file_name, "archive extracted");
    Ok(())
}

fn unpack_into(archive: &Path, staging: &Path, name: &str, cancel: &CancelFlag) -> Result<()> {
    fs::create_dir_all(staging).map_err(|e| Error::ArchiveFailure(e.to_string()))?;

    let file = fs::File::open(archive).map_err(|e| Error::ArchiveFailure(e.to_string()))?;
    let decoder =
        zstd::Decoder::new(file).map_err(|e| Error::ArchiveFailure(format!("init decompressor: {e}")))?;
    let mut tar = tar::Archive::new(decoder);

    let entries = tar
        .entries()
        .map_err(|e| Error::ArchiveCorrupt(format!("read entries: {e}")))?;
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                name: name.to_string(),
                operation: OperationKind::Restore,
            });
        }
        let mut entry = entry.map_err(|e| Error::ArchiveCorrupt(format!("read entry: {e}")))?;

        // Absolute or parent-escaping members never touch the filesystem.
        let entry_path = entry
            .path()
            .map_err(|e| Error::ArchiveCorrupt(format!("entry path: {e}")))?
            .into_owned();
        let escapes = entry_path.is_absolute()
            || entry_path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir));
        if escapes {
            return Err(Error::ArchiveCorrupt(format!(
                "entry '{}' escapes the destination",
                entry_path.display()
            )));
        }

        let unpacked = entry
            .unpack_in(staging)
            .map_err(|e| Error::ArchiveFailure(format!("unpack '{}': {e}", entry_path.display())))?;
        if !unpacked {
            return Err(Error::ArchiveCorrupt(format!(
                "entry '{}' was rejected during unpack",
                entry_path.display()
            )));
        }
    }
    Ok(())
}

fn list_sync(dir: &Path) -> Result<Vec<ArchiveRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::ArchiveFailure(e.to_string()))? {
        let entry = entry.map_err(|e| Error::ArchiveFailure(e.to_string()))?;
        let path = entry.path();
        let Some(fname) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !fname.ends_with(".tar.zst.json") {
            continue;
        }
        let raw = fs::read(&path).map_err(|e| Error::ArchiveFailure(e.to_string()))?;
        match serde_json::from_slice::<ArchiveRecord>(&raw) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), %e, "skipping unreadable archive record");
            }
        }
    }
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

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
            .map(|rel| {
                let data = fs::read(base.join(&rel)).unwrap();
                (rel, data)
            })
            .collect()
    }

    #[tokio::test]
    async fn create_extract_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        write_file(&data, "world/level.dat", b"level bytes");
        write_file(&data, "server.properties", b"motd=archive me");

        let engine = ArchiveEngine::new(tmp.path().join("archives"));
        let cancel = CancelFlag::default();
        let record = engine.create("survival1", &data, &cancel).await.unwrap();
        assert!(record.file_name.starts_with("survival1-"));
        assert!(record.file_name.ends_with(".tar.zst"));
        assert!(record.size_bytes > 0);

        let dest = tmp.path().join("restored");
        engine
            .extract("survival1", &record.file_name, &dest, &cancel)
            .await
            .unwrap();
        assert_eq!(read_tree(&dest), read_tree(&data));
    }

    #[tokio::test]
    async fn extract_rejects_tampered_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        write_file(&data, "world.dat", b"original");

        let engine = ArchiveEngine::new(tmp.path().join("archives"));
        let cancel = CancelFlag::default();
        let record = engine.create("survival1", &data, &cancel).await.unwrap();

        // Flip bytes in the stored archive.
        let path = tmp.path().join("archives/survival1").join(&record.file_name);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let dest = tmp.path().join("restored");
        write_file(&dest, "keep.txt", b"untouched");
        let err = engine
            .extract("survival1", &record.file_name, &dest, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArchiveCorrupt(_)), "got {err}");
        assert_eq!(read_tree(&dest)["keep.txt"], b"untouched");
    }

    #[tokio::test]
    async fn list_orders_by_creation_and_prune_removes() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        write_file(&data, "world.dat", b"state");

        let engine = ArchiveEngine::new(tmp.path().join("archives"));
        let cancel = CancelFlag::default();
        let first = engine.create("survival1", &data, &cancel).await.unwrap();
        let second = engine.create("survival1", &data, &cancel).await.unwrap();
        // Same-second collision handling keeps names unique.
        assert_ne!(first.file_name, second.file_name);

        let listed = engine.list("survival1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].created_at <= listed[1].created_at);

        engine.prune("survival1", &first.file_name).await.unwrap();
        let listed = engine.list("survival1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_name, second.file_name);

        let err = engine.prune("survival1", &first.file_name).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn cancelled_create_leaves_no_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        write_file(&data, "world.dat", b"state");

        let engine = ArchiveEngine::new(tmp.path().join("archives"));
        let cancel = CancelFlag::default();
        cancel.cancel();
        let err = engine.create("survival1", &data, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(engine.list("survival1").await.unwrap().is_empty());
    }

    #[test]
    fn file_name_validation() {
        assert!(validate_file_name("survival1-20260807-120000.tar.zst").is_ok());
        assert!(validate_file_name("../escape.tar.zst").is_err());
        assert!(validate_file_name("a/b.tar.zst").is_err());
        assert!(validate_file_name(".hidden").is_err());
        assert!(validate_file_name("").is_err());
    }
}
