//! Archive packing and unpacking behind a narrow trait.
//!
//! The archiver's staging/swap logic is codec-agnostic; the trait exists
//! so tests can substitute a scripted codec without touching real tar
//! streams.

use crate::{classify_write_error, is_disk_full};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use mcsm_common::{ManagerError, Result};
use std::fs::File;
use std::path::{Component, Path};

/// Packs a directory tree into an archive file and back.
pub trait ArchiveCodec: Send + Sync {
    /// Write an archive of `source_dir` (recursively) to `archive_path`.
    fn pack(&self, source_dir: &Path, archive_path: &Path) -> Result<()>;

    /// Extract `archive_path` into `target_dir`, which must already exist
    /// and is expected to be empty.
    fn unpack(&self, archive_path: &Path, target_dir: &Path) -> Result<()>;
}

/// gzip-compressed tarball codec.
pub struct TarGzCodec;

impl ArchiveCodec for TarGzCodec {
    fn pack(&self, source_dir: &Path, archive_path: &Path) -> Result<()> {
        let file =
            File::create(archive_path).map_err(|e| classify_write_error(e, archive_path))?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        builder
            .append_dir_all(".", source_dir)
            .map_err(|e| classify_write_error(e, archive_path))?;

        let encoder = builder
            .into_inner()
            .map_err(|e| classify_write_error(e, archive_path))?;
        encoder
            .finish()
            .map_err(|e| classify_write_error(e, archive_path))?;
        Ok(())
    }

    fn unpack(&self, archive_path: &Path, target_dir: &Path) -> Result<()> {
        let file = File::open(archive_path).map_err(ManagerError::Io)?;
        let decoder = GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);

        let entries = archive
            .entries()
            .map_err(|e| ManagerError::corrupt_archive(format!("unreadable archive: {}", e)))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| {
                ManagerError::corrupt_archive(format!("malformed entry: {}", e))
            })?;

            let path = entry
                .path()
                .map_err(|e| ManagerError::corrupt_archive(format!("bad entry path: {}", e)))?
                .into_owned();

            // A hostile archive must not write outside the target.
            if path.is_absolute()
                || path
                    .components()
                    .any(|c| matches!(c, Component::ParentDir))
            {
                return Err(ManagerError::corrupt_archive(format!(
                    "entry path escapes the target directory: {}",
                    path.display()
                )));
            }

            let unpacked = entry.unpack_in(target_dir).map_err(|e| {
                if is_disk_full(&e) {
                    classify_write_error(e, target_dir)
                } else if e.kind() == std::io::ErrorKind::UnexpectedEof
                    || e.kind() == std::io::ErrorKind::InvalidData
                {
                    ManagerError::corrupt_archive(format!(
                        "failed extracting {}: {}",
                        path.display(),
                        e
                    ))
                } else {
                    ManagerError::Io(e)
                }
            })?;

            if !unpacked {
                return Err(ManagerError::corrupt_archive(format!(
                    "entry refused by extractor: {}",
                    path.display()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_pack_then_unpack_preserves_file_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("src");
        fs::create_dir_all(source.join("nested")).unwrap();
        fs::write(source.join("a.txt"), "alpha").unwrap();
        fs::write(source.join("nested/b.bin"), [0u8, 159, 146, 150]).unwrap();

        let archive = tmp.path().join("out.tar.gz");
        TarGzCodec.pack(&source, &archive).unwrap();

        let target = tmp.path().join("dst");
        fs::create_dir_all(&target).unwrap();
        TarGzCodec.unpack(&archive, &target).unwrap();

        assert_eq!(fs::read_to_string(target.join("a.txt")).unwrap(), "alpha");
        assert_eq!(
            fs::read(target.join("nested/b.bin")).unwrap(),
            vec![0u8, 159, 146, 150]
        );
    }

    #[test]
    fn test_unpack_garbage_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("garbage.tar.gz");
        fs::write(&archive, b"\x1f\x8b but then nonsense").unwrap();

        let target = tmp.path().join("dst");
        fs::create_dir_all(&target).unwrap();

        let err = TarGzCodec.unpack(&archive, &target).unwrap_err();
        assert!(matches!(err, ManagerError::CorruptArchive { .. }));
    }
}
