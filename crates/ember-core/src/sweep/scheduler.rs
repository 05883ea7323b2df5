//! Sweep-once execution and the timer loop that drives it.
//!
//! `Sweeper::sweep_once` is synchronous and single-flight: a call made while
//! another is running returns a skipped report immediately. The tokio loop
//! only decides *when* to sweep and hands the work to a blocking thread.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rayon::prelude::*;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::orchestrator::{GroupOutcome, SweepOrchestrator};
use super::{LifecycleEvent, SweepDeps, SweepOptions};
use crate::archive::verify_export;
use crate::error::{ArchiveError, ConfigError, StoreError};
use crate::models::{ExportArtifact, SweepRun, SweepStatus};
use crate::retry::Backoff;

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Another sweep was already running; nothing was attempted.
    pub skipped: bool,
    /// Groups selected as due.
    pub due: usize,
    pub outcomes: Vec<(String, GroupOutcome)>,
    /// Set when due groups could not be selected.
    pub error: Option<String>,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn claimed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o != GroupOutcome::NotClaimed)
            .count()
    }

    pub fn purged(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, GroupOutcome::Purged(_)))
            .count()
    }

    pub fn stalled(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, GroupOutcome::Stalled { .. }))
            .count()
    }
}

pub struct Sweeper {
    deps: SweepDeps,
    orchestrator: SweepOrchestrator,
    pool: rayon::ThreadPool,
    in_flight: Mutex<()>,
    cancel: AtomicBool,
    batch_limit: usize,
    export_retention: Option<Duration>,
    backoff: Backoff,
}

impl Sweeper {
    pub fn new(deps: SweepDeps, options: &SweepOptions) -> Result<Self, ConfigError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.max_parallel_groups.max(1))
            .thread_name(|i| format!("ember-sweep-{i}"))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("sweep worker pool: {e}")))?;
        Ok(Self {
            orchestrator: SweepOrchestrator::new(deps.clone(), options),
            deps,
            pool,
            in_flight: Mutex::new(()),
            cancel: AtomicBool::new(false),
            batch_limit: options.batch_limit.max(1),
            export_retention: options.export_retention,
            backoff: options.backoff.clone(),
        })
    }

    pub fn orchestrator(&self) -> &SweepOrchestrator {
        &self.orchestrator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.deps.events.subscribe()
    }

    /// Run the pipeline for every due group, at most one sweep at a time.
    pub fn sweep_once(&self) -> SweepReport {
        let Some(_guard) = self.in_flight.try_lock() else {
            debug!("sweep already in flight, skipping");
            return SweepReport::skipped();
        };
        if self.cancel.load(Ordering::SeqCst) {
            return SweepReport::default();
        }

        let now = self.deps.clock.now();
        let due = match self
            .backoff
            .run("select due groups", || self.deps.store.due_groups(now, self.batch_limit))
        {
            Ok(due) => due,
            Err(err) => {
                error!(error = %err, "due group selection failed");
                return SweepReport {
                    error: Some(err.to_string()),
                    ..SweepReport::default()
                };
            }
        };
        if due.is_empty() {
            debug!("no expired groups due");
            return SweepReport::default();
        }

        info!(due = due.len(), "sweep started");
        let outcomes: Vec<(String, GroupOutcome)> = self.pool.install(|| {
            due.par_iter()
                .map(|group| {
                    let outcome = self.orchestrator.run_group(&group.id, &self.cancel);
                    (group.id.clone(), outcome)
                })
                .collect()
        });

        let report = SweepReport {
            skipped: false,
            due: due.len(),
            outcomes,
            error: None,
        };
        info!(
            due = report.due,
            claimed = report.claimed(),
            purged = report.purged(),
            stalled = report.stalled(),
            "sweep finished"
        );
        report
    }

    /// Securely erase archives of purged groups older than the retention
    /// window. Returns the number pruned; a no-op when retention is off.
    pub fn prune_exports(&self) -> usize {
        let Some(retention) = self.export_retention else {
            return 0;
        };
        let now = self.deps.clock.now();
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let candidates = match self.deps.store.prunable_exports(now - retention) {
            Ok(c) => c,
            Err(err) => {
                error!(error = %err, "export retention query failed");
                return 0;
            }
        };

        let mut pruned = 0;
        for artifact in candidates {
            match self.deps.eraser.erase(Path::new(&artifact.archive_path)) {
                Ok(_) => {
                    if let Err(err) = self.deps.store.mark_export_pruned(&artifact.id, now) {
                        warn!(group_id = %artifact.group_id, error = %err, "pruned export not recorded");
                        continue;
                    }
                    pruned += 1;
                }
                Err(err) => {
                    warn!(group_id = %artifact.group_id, error = %err, "export archive not pruned");
                }
            }
        }
        if pruned > 0 {
            info!(pruned, "expired export archives erased");
        }
        pruned
    }

    pub fn export_artifact(&self, group_id: &str) -> Result<Option<ExportArtifact>, StoreError> {
        self.deps.store.export_artifact(group_id)
    }

    pub fn verify_export(&self, group_id: &str, digest: &str) -> Result<bool, ArchiveError> {
        verify_export(self.deps.store.as_ref(), group_id, digest)
    }

    pub fn runs_with_status(&self, statuses: &[SweepStatus]) -> Result<Vec<SweepRun>, StoreError> {
        self.deps.store.runs_with_status(statuses)
    }

    /// Ask running pipelines to stop at their next stage boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Cancel and block until any in-flight sweep has returned.
    pub fn shutdown(&self) {
        self.cancel();
        let _wait = self.in_flight.lock();
    }
}

/// Control handle for the spawned scheduler task.
pub struct SweepSchedulerHandle {
    pub wake: mpsc::Sender<()>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl SweepSchedulerHandle {
    /// Run a sweep now instead of waiting for the next tick. Ignored while a
    /// sweep is already running.
    pub fn trigger_sweep_now(&self) {
        let _ = self.wake.try_send(());
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Spawn the sweep loop. It sweeps immediately, then on every `every` tick,
/// on each wake-up, and on the `safety_net` tick (which also prunes old
/// exports). Ticks and wake-ups that arrive while a sweep runs are dropped.
pub fn spawn_sweep_scheduler(
    sweeper: Arc<Sweeper>,
    every: Duration,
    safety_net: Duration,
) -> (tokio::task::JoinHandle<()>, SweepSchedulerHandle) {
    let (wake, mut wake_rx) = mpsc::channel(1);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = every.as_secs(),
            safety_net_secs = safety_net.as_secs(),
            "sweep scheduler started"
        );
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut daily = interval_at(Instant::now() + safety_net, safety_net);
        daily.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let full = tokio::select! {
                _ = tick.tick() => false,
                _ = daily.tick() => {
                    info!("safety-net sweep");
                    true
                }
                Some(()) = wake_rx.recv() => {
                    debug!("sweep scheduler woken early");
                    false
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let worker = sweeper.clone();
            let mut task = tokio::task::spawn_blocking(move || {
                let report = worker.sweep_once();
                if full {
                    worker.prune_exports();
                }
                report
            });

            tokio::select! {
                joined = &mut task => {
                    match joined {
                        Ok(report) if report.skipped => debug!("tick skipped, sweep in flight"),
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "sweep worker panicked"),
                    }
                    while wake_rx.try_recv().is_ok() {
                        debug!("wake-up during sweep dropped");
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("shutdown requested, waiting for in-flight sweep");
                    sweeper.cancel();
                    if let Err(err) = task.await {
                        error!(error = %err, "sweep worker panicked");
                    }
                    break;
                }
            }
        }

        sweeper.cancel();
        info!("sweep scheduler stopped");
    });

    (
        handle,
        SweepSchedulerHandle {
            wake,
            shutdown_tx,
        },
    )
}
