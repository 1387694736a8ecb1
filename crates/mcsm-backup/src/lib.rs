//! Backup and restore of server data directories.
//!
//! Archives are gzip-compressed tarballs. Creation writes to a `.partial`
//! path and renames into place only on success, so the archive directory
//! never holds a truncated file under a final name. Restoration extracts
//! into a staging directory next to the target and swaps it in atomically;
//! a corrupt archive leaves the target exactly as it was.

mod codec;

pub use codec::{ArchiveCodec, TarGzCodec};

use chrono::Utc;
use mcsm_common::{ManagerError, Result, ServerId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// True when the I/O error means the filesystem ran out of space.
pub(crate) fn is_disk_full(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(nix::errno::Errno::ENOSPC as i32)
    }
    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}

/// Map a write-side I/O error, reporting exhausted disk space distinctly.
pub(crate) fn classify_write_error(e: std::io::Error, path: &Path) -> ManagerError {
    if is_disk_full(&e) {
        ManagerError::DiskFull {
            path: path.to_path_buf(),
        }
    } else {
        ManagerError::Io(e)
    }
}

/// Creates and restores archives of server data directories.
pub struct BackupArchiver {
    backup_dir: PathBuf,
    codec: Arc<dyn ArchiveCodec>,
}

impl BackupArchiver {
    pub fn new(backup_dir: impl Into<PathBuf>, codec: Arc<dyn ArchiveCodec>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            codec,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Archive `source_dir` into the backup directory.
    ///
    /// Returns the path of the finished archive. On any failure the
    /// partial file is deleted; disk exhaustion is reported as `DiskFull`.
    ///
    /// Archive I/O is blocking, so the work runs on the blocking pool.
    pub async fn create_backup(&self, server_id: &ServerId, source_dir: &Path) -> Result<PathBuf> {
        let codec = Arc::clone(&self.codec);
        let backup_dir = self.backup_dir.clone();
        let server_id = server_id.clone();
        let source_dir = source_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            create_backup_blocking(&*codec, &backup_dir, &server_id, &source_dir)
        })
        .await
        .map_err(|e| ManagerError::internal(format!("Backup task panicked: {}", e)))?
    }

    /// Replace `target_dir` with the contents of `archive_path`.
    ///
    /// The archive is extracted into a staging directory first; the target
    /// is only touched once extraction has fully succeeded.
    pub async fn restore_backup(&self, archive_path: &Path, target_dir: &Path) -> Result<()> {
        let codec = Arc::clone(&self.codec);
        let archive_path = archive_path.to_path_buf();
        let target_dir = target_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            restore_backup_blocking(&*codec, &archive_path, &target_dir)
        })
        .await
        .map_err(|e| ManagerError::internal(format!("Restore task panicked: {}", e)))?
    }

    /// Archives for one server, newest first.
    pub fn list_backups(&self, server_id: &ServerId) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}-", server_id);
        let mut archives = Vec::new();

        let entries = match std::fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(archives),
            Err(e) => return Err(ManagerError::Io(e)),
        };

        for entry in entries {
            let entry = entry.map_err(ManagerError::Io)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".tar.gz") {
                archives.push(entry.path());
            }
        }

        // Timestamped names sort chronologically; newest first.
        archives.sort();
        archives.reverse();
        Ok(archives)
    }
}

fn create_backup_blocking(
    codec: &dyn ArchiveCodec,
    backup_dir: &Path,
    server_id: &ServerId,
    source_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(backup_dir)
        .map_err(|e| classify_write_error(e, backup_dir))?;

    let archive_path = next_archive_path(backup_dir, server_id);
    let partial_path = archive_path.with_extension("gz.partial");

    if let Err(e) = codec.pack(source_dir, &partial_path) {
        if let Err(cleanup) = std::fs::remove_file(&partial_path) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to delete partial archive {}: {}",
                    partial_path.display(),
                    cleanup
                );
            }
        }
        return Err(e);
    }

    std::fs::rename(&partial_path, &archive_path)
        .map_err(|e| classify_write_error(e, &archive_path))?;

    info!(
        "Backup of {} written to {}",
        server_id,
        archive_path.display()
    );
    Ok(archive_path)
}

/// Timestamped archive name; a numeric suffix disambiguates two backups
/// taken within the same second.
fn next_archive_path(backup_dir: &Path, server_id: &ServerId) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let base = format!("{}-{}", server_id, stamp);

    let candidate = backup_dir.join(format!("{}.tar.gz", base));
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 1;
    loop {
        let candidate = backup_dir.join(format!("{}-{}.tar.gz", base, n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn restore_backup_blocking(
    codec: &dyn ArchiveCodec,
    archive_path: &Path,
    target_dir: &Path,
) -> Result<()> {
    let parent = target_dir.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| classify_write_error(e, parent))?;

    let staging = tempfile::Builder::new()
        .prefix(".restore-")
        .tempdir_in(parent)
        .map_err(ManagerError::Io)?;

    codec.unpack(archive_path, staging.path())?;

    // Extraction succeeded in full; now swap the staging tree in.
    let aside = parent.join(format!(
        ".{}-replaced",
        target_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "restore".to_string())
    ));

    let had_previous = target_dir.exists();
    if had_previous {
        if aside.exists() {
            std::fs::remove_dir_all(&aside).map_err(ManagerError::Io)?;
        }
        std::fs::rename(target_dir, &aside).map_err(ManagerError::Io)?;
    }

    if let Err(e) = std::fs::rename(staging.path(), target_dir) {
        // Put the previous tree back before reporting.
        if had_previous {
            if let Err(undo) = std::fs::rename(&aside, target_dir) {
                warn!(
                    "Failed to restore previous contents of {}: {}",
                    target_dir.display(),
                    undo
                );
            }
        }
        return Err(classify_write_error(e, target_dir));
    }

    if had_previous {
        if let Err(e) = std::fs::remove_dir_all(&aside) {
            warn!("Failed to clean up {}: {}", aside.display(), e);
        }
    }

    info!(
        "Restored {} into {}",
        archive_path.display(),
        target_dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_tree(root: &Path) {
        fs::create_dir_all(root.join("world/region")).unwrap();
        fs::write(root.join("server.properties"), "motd=hello\n").unwrap();
        fs::write(root.join("world/level.dat"), b"\x0a\x00\x01binary").unwrap();
        fs::write(root.join("world/region/r.0.0.mca"), vec![7u8; 4096]).unwrap();
    }

    fn read_sorted(root: &Path) -> Vec<(String, Vec<u8>)> {
        let mut files = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                    files.push((rel, fs::read(&path).unwrap()));
                }
            }
        }
        files.sort();
        files
    }

    fn archiver(backup_dir: &Path) -> BackupArchiver {
        BackupArchiver::new(backup_dir, Arc::new(TarGzCodec))
    }

    #[tokio::test]
    async fn test_backup_restore_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("data");
        write_tree(&source);

        let archiver = archiver(&tmp.path().join("backups"));
        let id = ServerId::from("alpha");

        let archive = archiver.create_backup(&id, &source).await.unwrap();
        assert!(archive.exists());

        let restored = tmp.path().join("restored");
        archiver.restore_backup(&archive, &restored).await.unwrap();

        assert_eq!(read_sorted(&source), read_sorted(&restored));
    }

    #[tokio::test]
    async fn test_restore_replaces_existing_target() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("data");
        write_tree(&source);

        let archiver = archiver(&tmp.path().join("backups"));
        let id = ServerId::from("alpha");
        let archive = archiver.create_backup(&id, &source).await.unwrap();

        let target = tmp.path().join("target");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale.txt"), "old contents").unwrap();

        archiver.restore_backup(&archive, &target).await.unwrap();

        assert!(!target.join("stale.txt").exists());
        assert_eq!(read_sorted(&source), read_sorted(&target));
    }

    #[tokio::test]
    async fn test_corrupt_archive_leaves_target_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let garbage = tmp.path().join("broken.tar.gz");
        fs::write(&garbage, b"this is not a gzip stream").unwrap();

        let target = tmp.path().join("target");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("keep.txt"), "precious").unwrap();

        let archiver = archiver(&tmp.path().join("backups"));
        let err = archiver
            .restore_backup(&garbage, &target)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::CorruptArchive { .. }));

        assert_eq!(fs::read_to_string(target.join("keep.txt")).unwrap(), "precious");
    }

    #[tokio::test]
    async fn test_truncated_archive_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("data");
        write_tree(&source);

        let archiver = archiver(&tmp.path().join("backups"));
        let id = ServerId::from("alpha");
        let archive = archiver.create_backup(&id, &source).await.unwrap();

        let bytes = fs::read(&archive).unwrap();
        let truncated = tmp.path().join("truncated.tar.gz");
        fs::write(&truncated, &bytes[..bytes.len() / 2]).unwrap();

        let restored = tmp.path().join("restored");
        let err = archiver
            .restore_backup(&truncated, &restored)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::CorruptArchive { .. }));
        assert!(!restored.exists());
    }

    #[tokio::test]
    async fn test_missing_source_reports_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let archiver = archiver(&tmp.path().join("backups"));

        let err = archiver
            .create_backup(&ServerId::from("alpha"), &tmp.path().join("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Io(_)));

        // No partial file left behind.
        let leftovers: Vec<_> = fs::read_dir(tmp.path().join("backups"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_list_backups_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let backups = tmp.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        fs::write(backups.join("alpha-20260101-000000.tar.gz"), b"").unwrap();
        fs::write(backups.join("alpha-20260301-120000.tar.gz"), b"").unwrap();
        fs::write(backups.join("beta-20260201-000000.tar.gz"), b"").unwrap();

        let archiver = archiver(&backups);
        let listed = archiver.list_backups(&ServerId::from("alpha")).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0]
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains("20260301"));
    }
}
