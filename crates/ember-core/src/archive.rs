//! Export archive construction.
//!
//! One gzip-compressed tar per group holding `transcript.txt`, the readable
//! attachments under `files/`, and a `manifest.json`. The transcript is
//! spooled to disk page by page. Each attachment is copied to a staging file
//! first so its exact length is known before the tar header is written. Both
//! scratch files, and any partial archive, are securely erased.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cipher::ContentCipher;
use crate::eraser::FileEraser;
use crate::error::{ArchiveError, SecureDeleteError};
use crate::models::{Attachment, Group};
use crate::retry::Backoff;
use crate::store::LifecycleStore;

pub const TRANSCRIPT_ENTRY: &str = "transcript.txt";
pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const FILES_DIR: &str = "files";

pub const UNREADABLE_PLACEHOLDER: &str = "[unable to decrypt message]";
pub const EMPTY_BODY_PLACEHOLDER: &str = "[file/media]";

const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct SkippedAttachment {
    pub attachment_id: String,
    pub file_name: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub path: PathBuf,
    /// SHA-256 hex of the final archive bytes on disk.
    pub digest: String,
    pub size_bytes: u64,
    pub transcript_lines: usize,
    pub files_added: usize,
    pub skipped: Vec<SkippedAttachment>,
}

#[derive(Serialize)]
struct Manifest<'a> {
    group_id: &'a str,
    group_name: &'a str,
    description: Option<&'a str>,
    created_at: DateTime<Utc>,
    expiry_time: DateTime<Utc>,
    exported_at: DateTime<Utc>,
    message_count: usize,
    file_count: usize,
    skipped: &'a [SkippedAttachment],
}

pub struct ArchiveBuilder {
    store: Arc<dyn LifecycleStore>,
    cipher: Arc<ContentCipher>,
    eraser: Arc<dyn FileEraser>,
    exports_dir: PathBuf,
    page_size: usize,
    backoff: Backoff,
}

impl ArchiveBuilder {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        cipher: Arc<ContentCipher>,
        eraser: Arc<dyn FileEraser>,
        exports_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            cipher,
            eraser,
            exports_dir: exports_dir.into(),
            page_size: DEFAULT_PAGE_SIZE,
            backoff: Backoff::default(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn exports_dir(&self) -> &Path {
        &self.exports_dir
    }

    /// Build the export archive for `group_id`.
    ///
    /// Store failures abort the build and leave nothing behind. Unreadable
    /// attachments are skipped and listed in the manifest.
    pub fn build(&self, group_id: &str, now: DateTime<Utc>) -> Result<BuiltArchive, ArchiveError> {
        let group = self
            .backoff
            .run("load group", || self.store.group(group_id))?
            .ok_or_else(|| ArchiveError::GroupNotFound(group_id.to_string()))?;

        fs::create_dir_all(&self.exports_dir).map_err(|source| ArchiveError::Io {
            path: self.exports_dir.clone(),
            source,
        })?;

        let final_path = self.exports_dir.join(archive_file_name(&group, now));
        let partial_path = with_suffix(&final_path, ".partial");
        let spool_path = self.exports_dir.join(format!(".{}.transcript.spool", group.id));
        let stage_path = self.exports_dir.join(format!(".{}.attachment.stage", group.id));

        self.erase_leftovers(&group.id).map_err(ArchiveError::Scratch)?;

        let outcome = self.write_archive(&group, now, &spool_path, &stage_path, &partial_path);

        // Scratch files hold plaintext whatever happened above.
        let scratch_erased = self.erase_scratch(&[&spool_path, &stage_path]);

        let (transcript_lines, files_added, skipped) = match outcome {
            Ok(counts) => counts,
            Err(err) => {
                self.discard_partial(&partial_path);
                if let Err(erase_err) = scratch_erased {
                    warn!(group_id = %group.id, error = %erase_err, "export scratch file not erased");
                }
                return Err(err);
            }
        };
        if let Err(err) = scratch_erased {
            self.discard_partial(&partial_path);
            return Err(ArchiveError::Scratch(err));
        }

        fs::rename(&partial_path, &final_path).map_err(|source| ArchiveError::Io {
            path: final_path.clone(),
            source,
        })?;

        let digest = hash_file(&final_path).map_err(|source| ArchiveError::Io {
            path: final_path.clone(),
            source,
        })?;
        let size_bytes = fs::metadata(&final_path)
            .map_err(|source| ArchiveError::Io {
                path: final_path.clone(),
                source,
            })?
            .len();

        info!(
            group_id = %group.id,
            path = %final_path.display(),
            transcript_lines,
            files_added,
            skipped = skipped.len(),
            size_bytes,
            "export archive written"
        );

        Ok(BuiltArchive {
            path: final_path,
            digest,
            size_bytes,
            transcript_lines,
            files_added,
            skipped,
        })
    }

    fn write_archive(
        &self,
        group: &Group,
        now: DateTime<Utc>,
        spool_path: &Path,
        stage_path: &Path,
        partial_path: &Path,
    ) -> Result<(usize, usize, Vec<SkippedAttachment>), ArchiveError> {
        let transcript_lines = self.spool_transcript(&group.id, spool_path)?;
        let attachments = self
            .backoff
            .run("load attachments", || self.store.attachments(&group.id))?;

        let io_err = |source: io::Error| ArchiveError::Io {
            path: partial_path.to_path_buf(),
            source,
        };

        let file = File::create(partial_path).map_err(io_err)?;
        let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));

        let mut spool = File::open(spool_path).map_err(|source| ArchiveError::Io {
            path: spool_path.to_path_buf(),
            source,
        })?;
        let spool_len = spool.metadata().map_err(io_err)?.len();
        append_entry(&mut tar, TRANSCRIPT_ENTRY, spool_len, now, &mut spool).map_err(io_err)?;

        let stage_err = |source: io::Error| ArchiveError::Io {
            path: stage_path.to_path_buf(),
            source,
        };
        let mut stage = if attachments.is_empty() {
            None
        } else {
            Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(stage_path)
                    .map_err(stage_err)?,
            )
        };

        let mut used_names = HashSet::new();
        let mut files_added = 0;
        let mut skipped = Vec::new();
        for attachment in &attachments {
            let Some(stage_file) = stage.as_mut() else { break };
            let staged = match self.open_attachment(attachment) {
                Ok((source, len)) => stage_attachment(source, len, stage_file)
                    .map_err(stage_err)?
                    .map(|()| len),
                Err(reason) => Err(reason),
            };
            let len = match staged {
                Ok(len) => len,
                Err(reason) => {
                    warn!(
                        group_id = %group.id,
                        attachment_id = %attachment.id,
                        file_name = %attachment.file_name,
                        reason = %reason,
                        "attachment skipped in export"
                    );
                    skipped.push(SkippedAttachment {
                        attachment_id: attachment.id.clone(),
                        file_name: attachment.file_name.clone(),
                        reason,
                    });
                    continue;
                }
            };
            let name = unique_entry_name(&attachment.file_name, &mut used_names);
            append_entry(&mut tar, &format!("{FILES_DIR}/{name}"), len, now, stage_file.take(len))
                .map_err(io_err)?;
            files_added += 1;
        }

        let manifest = Manifest {
            group_id: &group.id,
            group_name: &group.name,
            description: group.description.as_deref(),
            created_at: group.created_at,
            expiry_time: group.expiry_time,
            exported_at: now,
            message_count: transcript_lines,
            file_count: files_added,
            skipped: &skipped,
        };
        let manifest = serde_json::to_vec_pretty(&manifest)?;
        append_entry(&mut tar, MANIFEST_ENTRY, manifest.len() as u64, now, manifest.as_slice())
            .map_err(io_err)?;

        let file = tar.into_inner().map_err(io_err)?.finish().map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        Ok((transcript_lines, files_added, skipped))
    }

    /// Write one escaped line per message to the spool, in creation order.
    fn spool_transcript(&self, group_id: &str, spool_path: &Path) -> Result<usize, ArchiveError> {
        let io_err = |source: io::Error| ArchiveError::Io {
            path: spool_path.to_path_buf(),
            source,
        };
        let mut out = BufWriter::new(File::create(spool_path).map_err(io_err)?);
        let mut cursor = None;
        let mut lines = 0;
        loop {
            let page = self.backoff.run("load messages", || {
                self.store.messages_page(group_id, cursor, self.page_size)
            })?;
            let Some(last) = page.last() else { break };
            cursor = Some((last.created_at, last.seq));

            for message in &page {
                let body = match self.cipher.decrypt_str(&message.content_enc) {
                    Ok(text) if text.is_empty() => EMPTY_BODY_PLACEHOLDER.to_string(),
                    Ok(text) => escape_line(&text),
                    Err(err) => {
                        debug!(message_id = %message.id, error = %err, "message undecryptable");
                        UNREADABLE_PLACEHOLDER.to_string()
                    }
                };
                writeln!(
                    out,
                    "[{}] {}: {}",
                    message.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    escape_line(&message.author_name),
                    body
                )
                .map_err(io_err)?;
                lines += 1;
            }
            if page.len() < self.page_size {
                break;
            }
        }
        out.flush().map_err(io_err)?;
        Ok(lines)
    }

    /// Securely erase scratch files and partial archives a crashed build of
    /// this group left behind.
    fn erase_leftovers(&self, group_id: &str) -> Result<(), SecureDeleteError> {
        let Ok(entries) = fs::read_dir(&self.exports_dir) else {
            return Ok(());
        };
        let scratch = [
            format!(".{group_id}.transcript.spool"),
            format!(".{group_id}.attachment.stage"),
        ];
        let partial_marker = format!("_{group_id}_");
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let stale = scratch.contains(&name)
                || (name.ends_with(".tar.gz.partial") && name.contains(&partial_marker));
            if stale {
                warn!(group_id, file = %name, "erasing leftover from an interrupted export");
                self.eraser.erase(&entry.path())?;
            }
        }
        Ok(())
    }

    /// Erase every path that exists, reporting the first failure.
    fn erase_scratch(&self, paths: &[&Path]) -> Result<(), SecureDeleteError> {
        let mut first_err = None;
        for path in paths.iter().filter(|p| fs::symlink_metadata(p).is_ok()) {
            if let Err(err) = self.eraser.erase(path) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn discard_partial(&self, partial_path: &Path) {
        if fs::symlink_metadata(partial_path).is_err() {
            return;
        }
        if let Err(err) = self.eraser.erase(partial_path) {
            warn!(path = %partial_path.display(), error = %err, "partial archive not erased");
        }
    }

    fn open_attachment(&self, attachment: &Attachment) -> Result<(File, u64), String> {
        let path = self
            .cipher
            .decrypt_str(&attachment.path_enc)
            .map_err(|e| format!("path unreadable: {e}"))?;
        let file = File::open(&path).map_err(|e| format!("cannot open: {e}"))?;
        let meta = file.metadata().map_err(|e| format!("cannot stat: {e}"))?;
        if !meta.is_file() {
            return Err("not a regular file".into());
        }
        Ok((file, meta.len()))
    }
}

/// Copy `source` to the start of `stage` and check it yielded exactly `len`
/// bytes. Read failures and size changes come back as a skip reason; errors
/// on the stage file itself are returned as `Err`. The stage is never
/// truncated so the final erase covers the largest copy.
fn stage_attachment(mut source: File, len: u64, stage: &mut File) -> io::Result<Result<(), String>> {
    stage.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; 8192];
    let mut copied = 0u64;
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Ok(Err(format!("read failed: {e}"))),
        };
        copied += n as u64;
        if copied > len {
            return Ok(Err(format!("size changed while reading: expected {len} bytes, got more")));
        }
        stage.write_all(&buf[..n])?;
    }
    if copied != len {
        return Ok(Err(format!("size changed while reading: expected {len} bytes, got {copied}")));
    }
    stage.flush()?;
    stage.seek(SeekFrom::Start(0))?;
    Ok(Ok(()))
}

fn append_entry<W: Write, R: Read>(
    tar: &mut tar::Builder<W>,
    name: &str,
    size: u64,
    mtime: DateTime<Utc>,
    data: R,
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(mtime.timestamp().max(0) as u64);
    header.set_cksum();
    tar.append_data(&mut header, name, data)
}

/// `<group-name>_<group-id>_<timestamp>.tar.gz`, with the name reduced to a
/// filesystem-safe form.
pub fn archive_file_name(group: &Group, now: DateTime<Utc>) -> String {
    let safe: String = group
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let safe = if safe.is_empty() { "group".to_string() } else { safe };
    format!("{}_{}_{}.tar.gz", safe, group.id, now.format("%Y%m%dT%H%M%S%.3fZ"))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Escape backslashes and line breaks so a message is exactly one line.
pub fn escape_line(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

/// Basename of `file_name`, suffixed with ` (n)` when already taken.
fn unique_entry_name(file_name: &str, used: &mut HashSet<String>) -> String {
    let base = Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && n != "..")
        .unwrap_or_else(|| "attachment".to_string());
    if used.insert(base.clone()) {
        return base;
    }
    let (stem, ext) = match base.rfind('.') {
        Some(idx) if idx > 0 => (&base[..idx], &base[idx..]),
        _ => (base.as_str(), ""),
    };
    let mut n = 1;
    loop {
        let candidate = format!("{stem} ({n}){ext}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Recompute the digest of the archive at `path` and compare it with the
/// recorded one.
pub fn verify_archive_digest(path: &Path, recorded: &str) -> Result<(), ArchiveError> {
    let actual = hash_file(path).map_err(|source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if actual.eq_ignore_ascii_case(recorded) {
        Ok(())
    } else {
        Err(ArchiveError::DigestMismatch {
            path: path.to_path_buf(),
            recorded: recorded.to_string(),
            actual,
        })
    }
}

/// True when `digest` is the recorded digest of the group's export and the
/// archive on disk still hashes to it. Pruned or missing archives verify
/// as false.
pub fn verify_export(
    store: &dyn LifecycleStore,
    group_id: &str,
    digest: &str,
) -> Result<bool, ArchiveError> {
    let Some(artifact) = store.export_artifact(group_id)? else {
        return Ok(false);
    };
    if artifact.pruned_at.is_some() || !artifact.digest.eq_ignore_ascii_case(digest) {
        return Ok(false);
    }
    match verify_archive_digest(Path::new(&artifact.archive_path), &artifact.digest) {
        Ok(()) => Ok(true),
        Err(ArchiveError::DigestMismatch { .. }) => Ok(false),
        Err(ArchiveError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
