//! Expiry sweep: per-group pipeline plus the timer that drives it.

pub mod orchestrator;
pub mod scheduler;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::cipher::ContentCipher;
use crate::clock::Clock;
use crate::config::EmberConfig;
use crate::eraser::FileEraser;
use crate::models::SweepStatus;
use crate::notifier::Notifier;
use crate::retry::Backoff;
use crate::store::LifecycleStore;

pub use orchestrator::{GroupOutcome, SweepOrchestrator};
pub use scheduler::{spawn_sweep_scheduler, SweepReport, SweepSchedulerHandle, Sweeper};
pub use state::{Stage, VerifiedExport};

const EVENT_CAPACITY: usize = 256;

/// Published on the sweeper's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    ExportCreated {
        group_id: String,
        archive_path: PathBuf,
        digest: String,
    },
    GroupPurged {
        group_id: String,
    },
    /// A run exhausted its attempts and is now FAILED.
    SweepFailed {
        group_id: String,
        stage: SweepStatus,
        error: String,
    },
}

/// Collaborators shared by the orchestrator and the scheduler.
#[derive(Clone)]
pub struct SweepDeps {
    pub store: Arc<dyn LifecycleStore>,
    pub cipher: Arc<ContentCipher>,
    pub notifier: Arc<dyn Notifier>,
    pub eraser: Arc<dyn FileEraser>,
    pub clock: Arc<dyn Clock>,
    pub events: broadcast::Sender<LifecycleEvent>,
}

impl SweepDeps {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        cipher: Arc<ContentCipher>,
        notifier: Arc<dyn Notifier>,
        eraser: Arc<dyn FileEraser>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            cipher,
            notifier,
            eraser,
            clock,
            events,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub exports_dir: PathBuf,
    pub max_parallel_groups: usize,
    pub max_attempts: u32,
    pub claim_ttl: Duration,
    pub batch_limit: usize,
    pub export_retention: Option<Duration>,
    pub backoff: Backoff,
}

impl SweepOptions {
    pub fn from_config(config: &EmberConfig) -> Self {
        let sweep = &config.sweep;
        Self {
            exports_dir: config.storage.exports_dir.clone(),
            max_parallel_groups: sweep.max_parallel_groups,
            max_attempts: sweep.max_attempts,
            claim_ttl: Duration::from_secs(sweep.claim_ttl_secs),
            batch_limit: sweep.batch_limit,
            export_retention: sweep
                .export_retention_days
                .map(|days| Duration::from_secs(u64::from(days) * 24 * 60 * 60)),
            backoff: sweep.backoff(),
        }
    }
}
