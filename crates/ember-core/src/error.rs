use std::path::PathBuf;

use thiserror::Error;

use crate::models::SweepStatus;

/// Startup configuration failures. Fatal: the service refuses to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Encryption key missing (set {0})")]
    MissingKey(String),

    #[error("Encryption key too short: {len} bytes, {required} required")]
    KeyTooShort { len: usize, required: usize },

    #[error("Unknown cipher algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Cannot determine data directory")]
    NoDataDir,

    #[error("Config IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Field encryption failures. Never carries partial plaintext.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed (authentication tag mismatch or wrong key)")]
    Decrypt,

    #[error("Malformed ciphertext blob: {0}")]
    MalformedBlob(&'static str),

    #[error("Wrong IV length: expected {expected} bytes, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Decrypted content is not valid UTF-8")]
    Utf8,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Sweep status transition {from} -> {to} rejected for group {group_id}")]
    InvalidTransition {
        group_id: String,
        from: SweepStatus,
        to: SweepStatus,
    },

    #[error("Refusing to purge group {0}: no verified export artifact")]
    ExportMissing(String),

    #[error("Refusing to purge group {group_id}: {remaining} attachment file(s) not erased")]
    ErasePending { group_id: String, remaining: i64 },

    #[error("Sweep claim on group {0} lost")]
    ClaimLost(String),
}

impl StoreError {
    /// Busy/locked database and disk I/O errors clear up on their own and are
    /// retried with backoff. Everything else is surfaced immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}

/// Group-scoped export failure. The sweep stays retryable and nothing is erased.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Store error while exporting: {0}")]
    Store(#[from] StoreError),

    #[error("Archive IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Manifest serialisation error: {0}")]
    Manifest(#[from] serde_json::Error),

    /// The transcript spool, attachment staging copy or a stale partial
    /// archive could not be securely erased.
    #[error("Scratch file could not be erased: {0}")]
    Scratch(#[source] SecureDeleteError),

    #[error("Archive digest mismatch for {path}: recorded={recorded} actual={actual}")]
    DigestMismatch {
        path: PathBuf,
        recorded: String,
        actual: String,
    },
}

/// File-scoped erase failure. The file may still hold plaintext and must be
/// retried; it is never treated as erased.
#[derive(Debug, Error)]
pub enum SecureDeleteError {
    #[error("Cannot open {path} for overwrite: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Overwrite pass {pass} failed on {path}: {source}")]
    Write {
        path: PathBuf,
        pass: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Flush after pass {pass} failed on {path}: {source}")]
    Flush {
        path: PathBuf,
        pass: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Unlink failed on {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot walk {path}: {message}")]
    Walk { path: PathBuf, message: String },
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Delivery to {recipient} failed: {reason}")]
    Delivery { recipient: String, reason: String },

    #[error("Outbox IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Envelope serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

/// Failure of one pipeline stage for one group, as recorded on the sweep run.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Export failed: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Erase of attachment {attachment_id} failed: {source}")]
    Erase {
        attachment_id: String,
        #[source]
        source: SecureDeleteError,
    },

    #[error("Attachment {attachment_id} path unreadable: {source}")]
    AttachmentPath {
        attachment_id: String,
        #[source]
        source: CryptoError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
