//! Per-group lifecycle pipeline: export, notify, erase, purge.
//!
//! Every stage boundary is persisted on the group's sweep run, so a crash or
//! shutdown resumes at the last completed stage. Stages never run without
//! the claim, and erase/purge only run with a [`VerifiedExport`] in hand.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::state::{resume_point, Stage, VerifiedExport};
use super::{LifecycleEvent, SweepDeps, SweepOptions};
use crate::archive::ArchiveBuilder;
use crate::error::{StoreError, SweepError};
use crate::models::{
    DeliveryOutcome, ExportArtifact, GroupFootprint, NotificationRecord, SweepStatus,
};
use crate::notifier::{export_body, export_subject};
use crate::retry::Backoff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    /// Another worker holds the claim, or the run is already purged.
    NotClaimed,
    Purged(GroupFootprint),
    /// Stopped between stages by shutdown.
    Interrupted(SweepStatus),
    /// A stage failed; the run is left at `status` for a later tick.
    Stalled { status: SweepStatus, error: String },
}

/// Shared between a running pipeline and the thread that keeps its claim
/// alive.
#[derive(Default)]
struct Lease {
    lost: AtomicBool,
    done: Mutex<bool>,
    wake: Condvar,
}

impl Lease {
    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn finish(&self) {
        *self.done.lock() = true;
        self.wake.notify_all();
    }
}

pub struct SweepOrchestrator {
    deps: SweepDeps,
    archive: ArchiveBuilder,
    owner: String,
    max_attempts: u32,
    claim_ttl: Duration,
    backoff: Backoff,
}

impl SweepOrchestrator {
    pub fn new(deps: SweepDeps, options: &SweepOptions) -> Self {
        let archive = ArchiveBuilder::new(
            deps.store.clone(),
            deps.cipher.clone(),
            deps.eraser.clone(),
            options.exports_dir.clone(),
        )
        .with_backoff(options.backoff.clone());
        let owner = format!(
            "ember-{}-{}",
            std::process::id(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            deps,
            archive,
            owner,
            max_attempts: options.max_attempts.max(1),
            claim_ttl: options.claim_ttl,
            backoff: options.backoff.clone(),
        }
    }

    /// Claim owner id written on every run this orchestrator drives.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn archive_builder(&self) -> &ArchiveBuilder {
        &self.archive
    }

    /// Drive one group as far as it will go this tick.
    pub fn run_group(&self, group_id: &str, cancel: &AtomicBool) -> GroupOutcome {
        let now = self.deps.clock.now();
        let claimed = self.backoff.run("claim group", || {
            self.deps.store.claim(group_id, &self.owner, now, self.claim_ttl)
        });
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                debug!(group_id, "group claimed elsewhere, skipping");
                return GroupOutcome::NotClaimed;
            }
            Err(err) => {
                error!(group_id, error = %err, "claim failed");
                return GroupOutcome::Stalled {
                    status: SweepStatus::Pending,
                    error: err.to_string(),
                };
            }
        }

        let lease = Lease::default();
        let outcome = std::thread::scope(|scope| {
            scope.spawn(|| self.keep_alive(group_id, &lease));
            let outcome = self.drive(group_id, cancel, &lease);
            lease.finish();
            outcome
        });

        if !matches!(outcome, GroupOutcome::Purged(_)) {
            if let Err(err) = self.deps.store.release(group_id, &self.owner) {
                warn!(group_id, error = %err, "claim release failed; lease will expire");
            }
        }
        outcome
    }

    /// Renew the claim every third of its lease until the pipeline finishes.
    /// Raises `lease.lost` if another owner took the run over meanwhile.
    fn keep_alive(&self, group_id: &str, lease: &Lease) {
        let every = (self.claim_ttl / 3).max(Duration::from_millis(10));
        let mut done = lease.done.lock();
        while !*done {
            if !lease.wake.wait_for(&mut done, every).timed_out() {
                continue;
            }
            let now = self.deps.clock.now();
            match self.deps.store.renew(group_id, &self.owner, now, self.claim_ttl) {
                Ok(()) => {}
                Err(StoreError::ClaimLost(_)) => {
                    warn!(group_id, "sweep claim taken over by another worker");
                    lease.lost.store(true, Ordering::SeqCst);
                    return;
                }
                Err(err) => warn!(group_id, error = %err, "claim renewal failed"),
            }
        }
    }

    fn drive(&self, group_id: &str, cancel: &AtomicBool, lease: &Lease) -> GroupOutcome {
        let mut stage = match self.entry_stage(group_id) {
            Ok(Some(stage)) => stage,
            Ok(None) => return GroupOutcome::NotClaimed,
            Err((status, err)) => return self.fail(group_id, status, err),
        };

        loop {
            let status = stage.status();
            if cancel.load(Ordering::SeqCst) {
                info!(group_id, stage = %status, "sweep interrupted by shutdown");
                return GroupOutcome::Interrupted(status);
            }
            if lease.is_lost() {
                return GroupOutcome::Stalled {
                    status,
                    error: StoreError::ClaimLost(group_id.to_string()).to_string(),
                };
            }
            let next = match stage {
                Stage::Export => self.export(group_id),
                Stage::Notify(proof) => self.notify(group_id, proof, lease),
                Stage::Erase(proof) => self.erase(group_id, proof, lease),
                Stage::Purge(proof) => {
                    return match self.purge(group_id, proof) {
                        Ok(footprint) => GroupOutcome::Purged(footprint),
                        Err(err) => self.fail(group_id, status, err),
                    };
                }
            };
            match next {
                Ok(next) => stage = next,
                Err(err) => return self.fail(group_id, status, err),
            }
        }
    }

    /// Work out where a claimed run resumes. Stages past export need the
    /// stored artifact to re-establish the proof.
    fn entry_stage(&self, group_id: &str) -> Result<Option<Stage>, (SweepStatus, SweepError)> {
        let run = self
            .deps
            .store
            .sweep_run(group_id)
            .map_err(|e| (SweepStatus::Pending, SweepError::from(e)))?
            .ok_or_else(|| {
                let missing = StoreError::NotFound(format!("sweep run {group_id}"));
                (SweepStatus::Pending, SweepError::Store(missing))
            })?;
        let status = resume_point(&run);
        let proof = || -> Result<VerifiedExport, (SweepStatus, SweepError)> {
            let artifact = self
                .deps
                .store
                .export_artifact(group_id)
                .map_err(|e| (status, SweepError::from(e)))?
                .ok_or_else(|| {
                    let missing = StoreError::ExportMissing(group_id.to_string());
                    (status, SweepError::Store(missing))
                })?;
            VerifiedExport::verify(artifact).map_err(|e| (status, SweepError::from(e)))
        };
        Ok(match status {
            SweepStatus::Exporting => Some(Stage::Export),
            SweepStatus::Notifying => Some(Stage::Notify(proof()?)),
            SweepStatus::Erasing => Some(Stage::Erase(proof()?)),
            _ => None,
        })
    }

    /// Persist entry into `status` unless the run is already there.
    fn enter(&self, group_id: &str, status: SweepStatus) -> Result<(), SweepError> {
        let current = self
            .deps
            .store
            .sweep_run(group_id)?
            .map(|run| run.status)
            .ok_or_else(|| StoreError::NotFound(format!("sweep run {group_id}")))?;
        if current != status {
            let now = self.deps.clock.now();
            self.backoff.run("advance status", || {
                self.deps.store.advance(group_id, &self.owner, status, now)
            })?;
            debug!(group_id, from = %current, to = %status, "sweep run advanced");
        }
        Ok(())
    }

    fn export(&self, group_id: &str) -> Result<Stage, SweepError> {
        self.enter(group_id, SweepStatus::Exporting)?;

        let artifact = match self.deps.store.export_artifact(group_id)? {
            Some(existing) => {
                info!(group_id, path = %existing.archive_path, "export already recorded, not rebuilding");
                existing
            }
            None => self.build_and_record(group_id)?,
        };
        let proof = VerifiedExport::verify(artifact)?;
        Ok(Stage::Notify(proof))
    }

    fn build_and_record(&self, group_id: &str) -> Result<ExportArtifact, SweepError> {
        let now = self.deps.clock.now();
        let built = self.archive.build(group_id, now)?;
        let artifact = ExportArtifact {
            id: Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            archive_path: built.path.to_string_lossy().into_owned(),
            digest: built.digest.clone(),
            created_at: now,
            pruned_at: None,
        };
        let recorded = self.backoff.run("record export", || {
            self.deps.store.insert_export_artifact(&artifact)
        });
        if let Err(err) = recorded {
            // Unrecorded archives are never referenced again.
            if let Err(erase_err) = self.deps.eraser.erase(&built.path) {
                warn!(group_id, path = %built.path.display(), error = %erase_err, "orphaned archive not erased");
            }
            return Err(err.into());
        }
        let _ = self.deps.events.send(LifecycleEvent::ExportCreated {
            group_id: group_id.to_string(),
            archive_path: built.path,
            digest: built.digest,
        });
        Ok(artifact)
    }

    fn notify(
        &self,
        group_id: &str,
        proof: VerifiedExport,
        lease: &Lease,
    ) -> Result<Stage, SweepError> {
        self.enter(group_id, SweepStatus::Notifying)?;

        let group = self
            .deps
            .store
            .group(group_id)?
            .ok_or_else(|| StoreError::NotFound(format!("group {group_id}")))?;
        let members = self.backoff.run("load members", || self.deps.store.members(group_id))?;
        let already: HashSet<String> = self
            .deps
            .store
            .notifications(group_id)?
            .into_iter()
            .map(|record| record.recipient)
            .collect();

        let subject = export_subject(&group.name);
        let exported_at = proof.artifact().created_at;
        let (mut sent, mut failed) = (0usize, 0usize);
        for member in members.iter().filter(|m| !already.contains(&m.email)) {
            if lease.is_lost() {
                return Err(StoreError::ClaimLost(group_id.to_string()).into());
            }
            let body = export_body(&member.name, &group.name, exported_at);
            let result = self
                .deps
                .notifier
                .send(member, &subject, &body, Some(proof.archive_path()));
            let (outcome, error) = match result {
                Ok(()) => {
                    sent += 1;
                    (DeliveryOutcome::Sent, None)
                }
                Err(err) => {
                    failed += 1;
                    warn!(group_id, recipient = %member.email, error = %err, "export notification failed");
                    (DeliveryOutcome::Failed, Some(err.to_string()))
                }
            };
            let record = NotificationRecord {
                group_id: group_id.to_string(),
                recipient: member.email.clone(),
                outcome,
                error,
                attempted_at: self.deps.clock.now(),
            };
            self.backoff.run("record notification", || {
                self.deps.store.record_notification(&record, &self.owner)
            })?;
        }
        info!(group_id, sent, failed, resumed_past = already.len(), "members notified");
        Ok(Stage::Erase(proof))
    }

    fn erase(
        &self,
        group_id: &str,
        proof: VerifiedExport,
        lease: &Lease,
    ) -> Result<Stage, SweepError> {
        self.enter(group_id, SweepStatus::Erasing)?;
        let proof = proof.reverify()?;

        let attachments = self
            .backoff
            .run("load attachments", || self.deps.store.attachments(group_id))?;
        let mut erased = 0usize;
        for attachment in attachments.iter().filter(|a| a.erased_at.is_none()) {
            if lease.is_lost() {
                return Err(StoreError::ClaimLost(group_id.to_string()).into());
            }
            let path = self
                .deps
                .cipher
                .decrypt_str(&attachment.path_enc)
                .map_err(|source| SweepError::AttachmentPath {
                    attachment_id: attachment.id.clone(),
                    source,
                })?;
            self.deps
                .eraser
                .erase(Path::new(&path))
                .map_err(|source| SweepError::Erase {
                    attachment_id: attachment.id.clone(),
                    source,
                })?;
            let now = self.deps.clock.now();
            self.backoff.run("mark attachment erased", || {
                self.deps
                    .store
                    .mark_attachment_erased(&attachment.id, &self.owner, now)
            })?;
            erased += 1;
        }
        info!(group_id, erased, total = attachments.len(), "attachment files erased");
        Ok(Stage::Purge(proof))
    }

    fn purge(&self, group_id: &str, proof: VerifiedExport) -> Result<GroupFootprint, SweepError> {
        let now = self.deps.clock.now();
        let deleted = self.backoff.run("purge group", || {
            self.deps.store.purge_group(group_id, &self.owner, now)
        })?;
        info!(
            group_id,
            archive = %proof.archive_path().display(),
            messages = deleted.messages,
            attachments = deleted.attachments,
            members = deleted.members,
            "group purged"
        );
        let _ = self.deps.events.send(LifecycleEvent::GroupPurged {
            group_id: group_id.to_string(),
        });
        Ok(deleted)
    }

    fn fail(&self, group_id: &str, stage: SweepStatus, err: SweepError) -> GroupOutcome {
        let message = err.to_string();
        let now = self.deps.clock.now();
        let recorded = self.backoff.run("record failure", || {
            self.deps
                .store
                .record_failure(group_id, &self.owner, stage, &message, self.max_attempts, now)
        });
        match recorded {
            Ok(run) => {
                error!(
                    group_id,
                    stage = %stage,
                    status = %run.status,
                    attempts = run.attempts,
                    error = %message,
                    "sweep stage failed"
                );
                if run.status == SweepStatus::Failed {
                    let _ = self.deps.events.send(LifecycleEvent::SweepFailed {
                        group_id: group_id.to_string(),
                        stage,
                        error: message.clone(),
                    });
                }
                GroupOutcome::Stalled {
                    status: run.status,
                    error: message,
                }
            }
            Err(store_err) => {
                error!(group_id, stage = %stage, error = %message, record_error = %store_err, "sweep failure not recorded");
                GroupOutcome::Stalled {
                    status: stage,
                    error: message,
                }
            }
        }
    }
}
