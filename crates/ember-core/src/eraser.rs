//! Multi-pass secure erase.
//!
//! Each file is overwritten in place with random bytes `passes` times, then
//! once with zeros, with an fsync after every pass, and finally unlinked.
//! The size written on every pass is the size observed on the open handle,
//! so a file resized mid-erase does not change how much gets overwritten.
//!
//! Failures are never swallowed: a file that might still hold plaintext
//! surfaces as `SecureDeleteError` and is retried by the caller.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::SecureDeleteError;

pub const DEFAULT_PASSES: u32 = 3;
const CHUNK: usize = 64 * 1024;

/// What one erase did to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraseReport {
    pub path: PathBuf,
    /// Size captured when the file was opened.
    pub size: u64,
    /// Random passes plus the final zero pass.
    pub passes_written: u32,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EraseTreeReport {
    pub files: usize,
    pub bytes_written: u64,
    pub dirs_removed: usize,
}

/// Erase seam used by the sweep orchestrator.
pub trait FileEraser: Send + Sync {
    /// Returns `Ok(None)` when the path is already gone.
    fn erase(&self, path: &Path) -> Result<Option<EraseReport>, SecureDeleteError>;
}

#[derive(Debug, Clone)]
pub struct SecureEraser {
    passes: u32,
}

#[derive(Clone, Copy)]
enum Fill {
    Random,
    Zero,
}

impl SecureEraser {
    pub fn new(passes: u32) -> Self {
        Self { passes }
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    pub fn erase_file(&self, path: &Path) -> Result<Option<EraseReport>, SecureDeleteError> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "secure erase: already absent");
                return Ok(None);
            }
            Err(source) => {
                return Err(SecureDeleteError::Open {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        // Never overwrite through a link: the target is not ours.
        if meta.file_type().is_symlink() {
            warn!(path = %path.display(), "secure erase: removing symlink without following");
            fs::remove_file(path).map_err(|source| SecureDeleteError::Remove {
                path: path.to_path_buf(),
                source,
            })?;
            return Ok(Some(EraseReport {
                path: path.to_path_buf(),
                size: 0,
                passes_written: 0,
                bytes_written: 0,
            }));
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|source| SecureDeleteError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        let size = file
            .metadata()
            .map_err(|source| SecureDeleteError::Open {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        let mut buf = vec![0u8; CHUNK.min(size as usize).max(1)];
        let mut bytes_written = 0u64;
        for pass in 1..=self.passes {
            bytes_written += overwrite(&mut file, path, size, pass, Fill::Random, &mut buf)?;
        }
        bytes_written += overwrite(&mut file, path, size, self.passes + 1, Fill::Zero, &mut buf)?;
        drop(file);

        fs::remove_file(path).map_err(|source| SecureDeleteError::Remove {
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = %path.display(), size, passes = self.passes + 1, "securely erased");
        Ok(Some(EraseReport {
            path: path.to_path_buf(),
            size,
            passes_written: self.passes + 1,
            bytes_written,
        }))
    }

    /// Erase every file below `root`, then remove the directories themselves.
    pub fn erase_dir(&self, root: &Path) -> Result<EraseTreeReport, SecureDeleteError> {
        let mut report = EraseTreeReport::default();
        if !root.exists() {
            return Ok(report);
        }
        for entry in WalkDir::new(root).contents_first(true).follow_links(false) {
            let entry = entry.map_err(|e| SecureDeleteError::Walk {
                path: root.to_path_buf(),
                message: e.to_string(),
            })?;
            let path = entry.path();
            if entry.file_type().is_dir() {
                fs::remove_dir(path).map_err(|source| SecureDeleteError::Remove {
                    path: path.to_path_buf(),
                    source,
                })?;
                report.dirs_removed += 1;
            } else if let Some(file) = self.erase_file(path)? {
                report.files += 1;
                report.bytes_written += file.bytes_written;
            }
        }
        info!(
            path = %root.display(),
            files = report.files,
            dirs = report.dirs_removed,
            "securely erased directory"
        );
        Ok(report)
    }
}

impl Default for SecureEraser {
    fn default() -> Self {
        Self::new(DEFAULT_PASSES)
    }
}

impl FileEraser for SecureEraser {
    fn erase(&self, path: &Path) -> Result<Option<EraseReport>, SecureDeleteError> {
        self.erase_file(path)
    }
}

fn overwrite(
    file: &mut File,
    path: &Path,
    size: u64,
    pass: u32,
    fill: Fill,
    buf: &mut [u8],
) -> Result<u64, SecureDeleteError> {
    let write_err = |source| SecureDeleteError::Write {
        path: path.to_path_buf(),
        pass,
        source,
    };

    file.seek(SeekFrom::Start(0)).map_err(write_err)?;
    if let Fill::Zero = fill {
        buf.fill(0);
    }

    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(buf.len() as u64) as usize;
        if let Fill::Random = fill {
            OsRng.fill_bytes(&mut buf[..n]);
        }
        file.write_all(&buf[..n]).map_err(write_err)?;
        remaining -= n as u64;
    }

    file.sync_all().map_err(|source| SecureDeleteError::Flush {
        path: path.to_path_buf(),
        pass,
        source,
    })?;
    Ok(size)
}
