//! Ephemeral data lifecycle engine.
//!
//! Expired groups are exported to a durable archive, their members are
//! notified, attachment files are securely erased and finally every row is
//! purged. Each step is persisted so an interrupted sweep resumes where it
//! stopped.

pub mod archive;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod eraser;
pub mod error;
pub mod models;
pub mod notifier;
pub mod paths;
pub mod retry;
pub mod store;
pub mod sweep;

pub use archive::{ArchiveBuilder, BuiltArchive};
pub use cipher::{CipherAlgorithm, ContentCipher};
pub use clock::{Clock, SystemClock};
pub use config::EmberConfig;
pub use eraser::{FileEraser, SecureEraser};
pub use error::*;
pub use models::*;
pub use notifier::{Notifier, OutboxNotifier};
pub use store::{LifecycleStore, SqliteStore};
pub use sweep::{
    spawn_sweep_scheduler, GroupOutcome, LifecycleEvent, SweepDeps, SweepOptions, SweepReport,
    SweepSchedulerHandle, Sweeper,
};
