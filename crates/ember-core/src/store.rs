//! SQLite persistence for the lifecycle engine.
//!
//! The sweep talks to storage only through [`LifecycleStore`]. The SQLite
//! implementation also carries the small amount of CRUD the surrounding
//! application uses to create users, groups, messages and attachments.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text (microsecond
//! precision, `Z` suffix) so lexical order equals chronological order.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::*;

const SCHEMA_VERSION: i32 = 1;

/// Storage operations consumed by the sweep orchestrator and scheduler.
pub trait LifecycleStore: Send + Sync {
    /// Groups with `expiry_time <= now` whose run is neither PURGED nor held
    /// by a live claim, oldest expiry first.
    fn due_groups(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Group>, StoreError>;

    /// Atomically take the sweep claim on a group. Creates the PENDING run
    /// row on first sight. Returns false when someone else holds a live claim
    /// or the run is already PURGED.
    fn claim(
        &self,
        group_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    fn release(&self, group_id: &str, owner: &str) -> Result<(), StoreError>;

    /// Push the claim's expiry to `now + lease`. Fails with `ClaimLost` once
    /// another owner has taken the run over.
    fn renew(
        &self,
        group_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<(), StoreError>;

    fn sweep_run(&self, group_id: &str) -> Result<Option<SweepRun>, StoreError>;

    /// Move a claimed run forward to `to`. The failure counter carries over
    /// when the run re-enters the stage that failed and resets otherwise.
    fn advance(
        &self,
        group_id: &str,
        owner: &str,
        to: SweepStatus,
        now: DateTime<Utc>,
    ) -> Result<SweepRun, StoreError>;

    /// Record a failed attempt at `stage`. The run returns to PENDING for a
    /// failed export, stays at `stage` otherwise, and becomes FAILED once
    /// `max_attempts` consecutive failures have been recorded.
    fn record_failure(
        &self,
        group_id: &str,
        owner: &str,
        stage: SweepStatus,
        error: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<SweepRun, StoreError>;

    fn group(&self, group_id: &str) -> Result<Option<Group>, StoreError>;

    /// One keyset page of messages in creation order, strictly after
    /// `after` (`created_at`, `seq`).
    fn messages_page(
        &self,
        group_id: &str,
        after: Option<(DateTime<Utc>, i64)>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// All attachments of the group in message order.
    fn attachments(&self, group_id: &str) -> Result<Vec<Attachment>, StoreError>;

    /// Set the erase marker. Only the current claim owner of the attachment's
    /// group may do so.
    fn mark_attachment_erased(
        &self,
        attachment_id: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn members(&self, group_id: &str) -> Result<Vec<Member>, StoreError>;

    fn insert_export_artifact(&self, artifact: &ExportArtifact) -> Result<(), StoreError>;

    fn export_artifact(&self, group_id: &str) -> Result<Option<ExportArtifact>, StoreError>;

    fn notifications(&self, group_id: &str) -> Result<Vec<NotificationRecord>, StoreError>;

    /// Upsert a recipient's outcome, checked against the claim like
    /// [`LifecycleStore::mark_attachment_erased`].
    fn record_notification(
        &self,
        record: &NotificationRecord,
        owner: &str,
    ) -> Result<(), StoreError>;

    /// Delete attachments, messages, members and the group in one
    /// transaction and mark the run PURGED. Refuses unless the run is
    /// claimed by `owner`, an export artifact with a digest exists, and
    /// every attachment has been erased. Returns the deleted row counts.
    fn purge_group(
        &self,
        group_id: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<GroupFootprint, StoreError>;

    fn footprint(&self, group_id: &str) -> Result<GroupFootprint, StoreError>;

    fn runs_with_status(&self, statuses: &[SweepStatus]) -> Result<Vec<SweepRun>, StoreError>;

    /// Unpruned artifacts of PURGED groups created at or before `cutoff`.
    fn prunable_exports(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExportArtifact>, StoreError>;

    fn mark_export_pruned(&self, artifact_id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        info!(path = %path.display(), "lifecycle store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        if current < 1 {
            migrate_v1(&conn)?;
        }
        debug!(version = SCHEMA_VERSION, "schema up to date");
        Ok(())
    }

    // ── Collaborator CRUD ────────────────────────────────────────────────────

    pub fn create_user(&self, name: &str, email: &str, now: DateTime<Utc>) -> Result<User, StoreError> {
        let user = User {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            email: email.to_string(),
        };
        self.conn.lock().execute(
            "INSERT INTO users (id, name, email, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user.id, user.name, user.email, ts(now)],
        )?;
        Ok(user)
    }

    /// Create a group; the creator becomes its first (admin) member.
    pub fn create_group(
        &self,
        name: &str,
        description: Option<&str>,
        creator_id: &str,
        access: AccessPolicy,
        expiry_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Group, StoreError> {
        let group = Group {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.map(str::to_owned),
            creator_id: creator_id.to_string(),
            access,
            expiry_time,
            created_at: now,
        };
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO chat_groups (id, name, description, creator_id, access, expiry_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                group.id,
                group.name,
                group.description,
                group.creator_id,
                group.access.as_str(),
                ts(group.expiry_time),
                ts(group.created_at)
            ],
        )?;
        tx.execute(
            "INSERT INTO group_members (group_id, user_id, role, joined_at) VALUES (?1, ?2, 'admin', ?3)",
            params![group.id, group.creator_id, ts(now)],
        )?;
        tx.commit()?;
        Ok(group)
    }

    pub fn add_member(
        &self,
        group_id: &str,
        user_id: &str,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)",
            params![group_id, user_id, role, ts(now)],
        )?;
        Ok(())
    }

    /// `content_enc` must already be a cipher blob.
    pub fn insert_message(
        &self,
        group_id: &str,
        author_id: &str,
        content_enc: &str,
        kind: MessageKind,
        reply_to: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.conn.lock().execute(
            "INSERT INTO messages (id, group_id, author_id, content_enc, kind, reply_to, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, group_id, author_id, content_enc, kind.as_str(), reply_to, ts(created_at)],
        )?;
        Ok(id)
    }

    /// `path_enc` must already be a cipher blob.
    pub fn insert_attachment(
        &self,
        message_id: &str,
        path_enc: &str,
        file_name: &str,
        size_bytes: i64,
        mime_type: &str,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.conn.lock().execute(
            "INSERT INTO attachments (id, message_id, path_enc, file_name, size_bytes, mime_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, message_id, path_enc, file_name, size_bytes, mime_type],
        )?;
        Ok(id)
    }
}

impl LifecycleStore for SqliteStore {
    fn due_groups(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Group>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT g.id, g.name, g.description, g.creator_id, g.access, g.expiry_time, g.created_at
             FROM chat_groups g
             LEFT JOIN sweep_runs r ON r.group_id = g.id
             WHERE g.expiry_time <= ?1
               AND (r.group_id IS NULL
                    OR (r.status != 'PURGED'
                        AND (r.claimed_by IS NULL OR r.claim_expires_at <= ?1)))
             ORDER BY g.expiry_time, g.id
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![ts(now), limit as i64], group_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn claim(
        &self,
        group_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let lease = lease_span(lease);
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO sweep_runs (group_id, status, attempts, updated_at)
             VALUES (?1, 'PENDING', 0, ?2)",
            params![group_id, ts(now)],
        )?;
        let changed = tx.execute(
            "UPDATE sweep_runs SET claimed_by = ?2, claim_expires_at = ?3
             WHERE group_id = ?1
               AND status != 'PURGED'
               AND (claimed_by IS NULL OR claim_expires_at <= ?4)",
            params![group_id, owner, ts(now + lease), ts(now)],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    }

    fn release(&self, group_id: &str, owner: &str) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "UPDATE sweep_runs SET claimed_by = NULL, claim_expires_at = NULL
             WHERE group_id = ?1 AND claimed_by = ?2",
            params![group_id, owner],
        )?;
        Ok(())
    }

    fn renew(
        &self,
        group_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<(), StoreError> {
        let changed = self.conn.lock().execute(
            "UPDATE sweep_runs SET claim_expires_at = ?3
             WHERE group_id = ?1 AND claimed_by = ?2",
            params![group_id, owner, ts(now + lease_span(lease))],
        )?;
        if changed == 0 {
            return Err(StoreError::ClaimLost(group_id.to_string()));
        }
        Ok(())
    }

    fn sweep_run(&self, group_id: &str) -> Result<Option<SweepRun>, StoreError> {
        let conn = self.conn.lock();
        load_run(&conn, group_id)
    }

    fn advance(
        &self,
        group_id: &str,
        owner: &str,
        to: SweepStatus,
        now: DateTime<Utc>,
    ) -> Result<SweepRun, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let run = owned_run(&tx, group_id, owner)?;
        if !run.status.can_transition_to(to) || to == SweepStatus::Failed {
            return Err(StoreError::InvalidTransition {
                group_id: group_id.to_string(),
                from: run.status,
                to,
            });
        }
        // Re-entering the stage that failed keeps its count; moving past it
        // starts the next stage at zero.
        let reentry = run.status == SweepStatus::Failed
            || (run.status == SweepStatus::Pending && to == SweepStatus::Exporting);
        let attempts = if reentry { run.attempts } else { 0 };
        tx.execute(
            "UPDATE sweep_runs
             SET status = ?2, attempts = ?3, failed_stage = NULL,
                 started_at = COALESCE(started_at, ?4), updated_at = ?4
             WHERE group_id = ?1",
            params![group_id, to.as_str(), attempts, ts(now)],
        )?;
        let updated = load_run(&tx, group_id)?
            .ok_or_else(|| StoreError::NotFound(format!("sweep run {group_id}")))?;
        tx.commit()?;
        Ok(updated)
    }

    fn record_failure(
        &self,
        group_id: &str,
        owner: &str,
        stage: SweepStatus,
        error: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<SweepRun, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let run = owned_run(&tx, group_id, owner)?;
        let attempts = run.attempts.saturating_add(1);
        let next = if attempts >= max_attempts {
            SweepStatus::Failed
        } else if stage == SweepStatus::Exporting {
            SweepStatus::Pending
        } else {
            stage
        };
        if next != run.status && !run.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                group_id: group_id.to_string(),
                from: run.status,
                to: next,
            });
        }
        let failed_stage = (next == SweepStatus::Failed).then(|| stage.as_str());
        tx.execute(
            "UPDATE sweep_runs
             SET status = ?2, attempts = ?3, failed_stage = ?4, last_error = ?5,
                 started_at = COALESCE(started_at, ?6), updated_at = ?6
             WHERE group_id = ?1",
            params![group_id, next.as_str(), attempts, failed_stage, error, ts(now)],
        )?;
        let updated = load_run(&tx, group_id)?
            .ok_or_else(|| StoreError::NotFound(format!("sweep run {group_id}")))?;
        tx.commit()?;
        Ok(updated)
    }

    fn group(&self, group_id: &str) -> Result<Option<Group>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, name, description, creator_id, access, expiry_time, created_at
                 FROM chat_groups WHERE id = ?1",
                params![group_id],
                group_from_row,
            )
            .optional()?)
    }

    fn messages_page(
        &self,
        group_id: &str,
        after: Option<(DateTime<Utc>, i64)>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        // An empty timestamp sorts before every stored one, so the first page
        // needs no separate query.
        let (after_ts, after_seq) = match after {
            Some((t, seq)) => (ts(t), seq),
            None => (String::new(), 0),
        };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT m.seq, m.id, m.group_id, m.author_id, COALESCE(u.name, m.author_id),
                    m.content_enc, m.kind, m.reply_to, m.created_at
             FROM messages m
             LEFT JOIN users u ON u.id = m.author_id
             WHERE m.group_id = ?1
               AND (m.created_at > ?2 OR (m.created_at = ?2 AND m.seq > ?3))
             ORDER BY m.created_at, m.seq
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![group_id, after_ts, after_seq, limit as i64],
            |row| {
                Ok(Message {
                    seq: row.get(0)?,
                    id: row.get(1)?,
                    group_id: row.get(2)?,
                    author_id: row.get(3)?,
                    author_name: row.get(4)?,
                    content_enc: row.get(5)?,
                    kind: get_parsed(row, 6)?,
                    reply_to: row.get(7)?,
                    created_at: get_ts(row, 8)?,
                })
            },
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn attachments(&self, group_id: &str) -> Result<Vec<Attachment>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.message_id, a.path_enc, a.file_name, a.size_bytes, a.mime_type, a.erased_at
             FROM attachments a
             JOIN messages m ON m.id = a.message_id
             WHERE m.group_id = ?1
             ORDER BY m.created_at, m.seq, a.id",
        )?;
        let rows = stmt.query_map(params![group_id], |row| {
            Ok(Attachment {
                id: row.get(0)?,
                message_id: row.get(1)?,
                path_enc: row.get(2)?,
                file_name: row.get(3)?,
                size_bytes: row.get(4)?,
                mime_type: row.get(5)?,
                erased_at: get_opt_ts(row, 6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn mark_attachment_erased(
        &self,
        attachment_id: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let group_id: String = tx
            .query_row(
                "SELECT m.group_id FROM attachments a
                 JOIN messages m ON m.id = a.message_id
                 WHERE a.id = ?1",
                params![attachment_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("attachment {attachment_id}")))?;
        owned_run(&tx, &group_id, owner)?;
        tx.execute(
            "UPDATE attachments SET erased_at = ?2 WHERE id = ?1 AND erased_at IS NULL",
            params![attachment_id, ts(now)],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn members(&self, group_id: &str) -> Result<Vec<Member>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT u.id, u.name, u.email, gm.role
             FROM group_members gm
             JOIN users u ON u.id = gm.user_id
             WHERE gm.group_id = ?1
             ORDER BY gm.joined_at, u.id",
        )?;
        let rows = stmt.query_map(params![group_id], |row| {
            Ok(Member {
                user_id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                role: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_export_artifact(&self, artifact: &ExportArtifact) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO export_artifacts (id, group_id, archive_path, digest, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                artifact.id,
                artifact.group_id,
                artifact.archive_path,
                artifact.digest,
                ts(artifact.created_at)
            ],
        )?;
        Ok(())
    }

    fn export_artifact(&self, group_id: &str) -> Result<Option<ExportArtifact>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, group_id, archive_path, digest, created_at, pruned_at
                 FROM export_artifacts WHERE group_id = ?1",
                params![group_id],
                artifact_from_row,
            )
            .optional()?)
    }

    fn notifications(&self, group_id: &str) -> Result<Vec<NotificationRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT group_id, recipient, outcome, error, attempted_at
             FROM notification_log WHERE group_id = ?1 ORDER BY attempted_at, recipient",
        )?;
        let rows = stmt.query_map(params![group_id], |row| {
            Ok(NotificationRecord {
                group_id: row.get(0)?,
                recipient: row.get(1)?,
                outcome: get_parsed(row, 2)?,
                error: row.get(3)?,
                attempted_at: get_ts(row, 4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn record_notification(
        &self,
        record: &NotificationRecord,
        owner: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        owned_run(&tx, &record.group_id, owner)?;
        tx.execute(
            "INSERT OR REPLACE INTO notification_log (group_id, recipient, outcome, error, attempted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.group_id,
                record.recipient,
                record.outcome.as_str(),
                record.error,
                ts(record.attempted_at)
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn purge_group(
        &self,
        group_id: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<GroupFootprint, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let run = owned_run(&tx, group_id, owner)?;
        if !run.status.can_transition_to(SweepStatus::Purged) {
            return Err(StoreError::InvalidTransition {
                group_id: group_id.to_string(),
                from: run.status,
                to: SweepStatus::Purged,
            });
        }

        let has_export: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM export_artifacts WHERE group_id = ?1 AND length(digest) > 0)",
            params![group_id],
            |row| row.get(0),
        )?;
        if !has_export {
            return Err(StoreError::ExportMissing(group_id.to_string()));
        }

        let remaining: i64 = tx.query_row(
            "SELECT COUNT(*) FROM attachments a JOIN messages m ON m.id = a.message_id
             WHERE m.group_id = ?1 AND a.erased_at IS NULL",
            params![group_id],
            |row| row.get(0),
        )?;
        if remaining > 0 {
            return Err(StoreError::ErasePending {
                group_id: group_id.to_string(),
                remaining,
            });
        }

        let attachments = tx.execute(
            "DELETE FROM attachments WHERE message_id IN (SELECT id FROM messages WHERE group_id = ?1)",
            params![group_id],
        )?;
        let messages = tx.execute("DELETE FROM messages WHERE group_id = ?1", params![group_id])?;
        let members = tx.execute("DELETE FROM group_members WHERE group_id = ?1", params![group_id])?;
        let groups = tx.execute("DELETE FROM chat_groups WHERE id = ?1", params![group_id])?;
        tx.execute(
            "UPDATE sweep_runs
             SET status = 'PURGED', attempts = 0, failed_stage = NULL, last_error = NULL,
                 claimed_by = NULL, claim_expires_at = NULL, updated_at = ?2
             WHERE group_id = ?1",
            params![group_id, ts(now)],
        )?;
        tx.commit()?;

        Ok(GroupFootprint {
            groups: groups as i64,
            members: members as i64,
            messages: messages as i64,
            attachments: attachments as i64,
        })
    }

    fn footprint(&self, group_id: &str) -> Result<GroupFootprint, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM chat_groups WHERE id = ?1),
                (SELECT COUNT(*) FROM group_members WHERE group_id = ?1),
                (SELECT COUNT(*) FROM messages WHERE group_id = ?1),
                (SELECT COUNT(*) FROM attachments a JOIN messages m ON m.id = a.message_id
                  WHERE m.group_id = ?1)",
            params![group_id],
            |row| {
                Ok(GroupFootprint {
                    groups: row.get(0)?,
                    members: row.get(1)?,
                    messages: row.get(2)?,
                    attachments: row.get(3)?,
                })
            },
        )?)
    }

    fn runs_with_status(&self, statuses: &[SweepStatus]) -> Result<Vec<SweepRun>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM sweep_runs ORDER BY updated_at DESC, group_id"
        ))?;
        let rows = stmt.query_map([], run_from_row)?;
        let mut out = Vec::new();
        for run in rows {
            let run = run?;
            if statuses.is_empty() || statuses.contains(&run.status) {
                out.push(run);
            }
        }
        Ok(out)
    }

    fn prunable_exports(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExportArtifact>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.group_id, e.archive_path, e.digest, e.created_at, e.pruned_at
             FROM export_artifacts e
             JOIN sweep_runs r ON r.group_id = e.group_id
             WHERE r.status = 'PURGED' AND e.pruned_at IS NULL AND e.created_at <= ?1
             ORDER BY e.created_at",
        )?;
        let rows = stmt.query_map(params![ts(cutoff)], artifact_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn mark_export_pruned(&self, artifact_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "UPDATE export_artifacts SET pruned_at = ?2 WHERE id = ?1 AND pruned_at IS NULL",
            params![artifact_id, ts(now)],
        )?;
        Ok(())
    }
}

fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chat_groups (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            creator_id TEXT NOT NULL REFERENCES users(id),
            access TEXT NOT NULL DEFAULT 'public',
            expiry_time TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chat_groups_expiry ON chat_groups(expiry_time);

        CREATE TABLE IF NOT EXISTS group_members (
            group_id TEXT NOT NULL REFERENCES chat_groups(id),
            user_id TEXT NOT NULL REFERENCES users(id),
            role TEXT NOT NULL DEFAULT 'member',
            joined_at TEXT NOT NULL,
            PRIMARY KEY (group_id, user_id)
        );

        -- content_enc holds iv_hex:cipher_hex, never plaintext
        CREATE TABLE IF NOT EXISTS messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            group_id TEXT NOT NULL REFERENCES chat_groups(id),
            author_id TEXT NOT NULL REFERENCES users(id),
            content_enc TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'text',
            reply_to TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_group_order ON messages(group_id, created_at, seq);

        CREATE TABLE IF NOT EXISTS attachments (
            id TEXT PRIMARY KEY,
            message_id TEXT NOT NULL REFERENCES messages(id),
            path_enc TEXT NOT NULL,
            file_name TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            mime_type TEXT NOT NULL,
            erased_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);

        -- No foreign key to chat_groups: artifacts and runs outlive the purge.
        CREATE TABLE IF NOT EXISTS export_artifacts (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL UNIQUE,
            archive_path TEXT NOT NULL,
            digest TEXT NOT NULL CHECK (length(digest) > 0),
            created_at TEXT NOT NULL,
            pruned_at TEXT
        );

        CREATE TABLE IF NOT EXISTS sweep_runs (
            group_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            failed_stage TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            started_at TEXT,
            updated_at TEXT NOT NULL,
            last_error TEXT,
            claimed_by TEXT,
            claim_expires_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sweep_runs_status ON sweep_runs(status);

        CREATE TABLE IF NOT EXISTS notification_log (
            group_id TEXT NOT NULL,
            recipient TEXT NOT NULL,
            outcome TEXT NOT NULL,
            error TEXT,
            attempted_at TEXT NOT NULL,
            PRIMARY KEY (group_id, recipient)
        );

        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )?;
    info!("applied schema v1");
    Ok(())
}

const RUN_COLUMNS: &str = "group_id, status, failed_stage, attempts, started_at, updated_at, \
                           last_error, claimed_by, claim_expires_at";

fn load_run(conn: &Connection, group_id: &str) -> Result<Option<SweepRun>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM sweep_runs WHERE group_id = ?1"),
            params![group_id],
            run_from_row,
        )
        .optional()?)
}

/// Load a run and confirm `owner` still holds its claim.
fn owned_run(conn: &Connection, group_id: &str, owner: &str) -> Result<SweepRun, StoreError> {
    let run = load_run(conn, group_id)?
        .ok_or_else(|| StoreError::NotFound(format!("sweep run {group_id}")))?;
    if run.claimed_by.as_deref() != Some(owner) {
        return Err(StoreError::ClaimLost(group_id.to_string()));
    }
    Ok(run)
}

fn lease_span(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(15))
}

pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognised value '{0}'")]
struct UnknownValue(String);

fn get_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|v| conversion_err(idx, UnknownValue(v)))
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        creator_id: row.get(3)?,
        access: get_parsed(row, 4)?,
        expiry_time: get_ts(row, 5)?,
        created_at: get_ts(row, 6)?,
    })
}

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<ExportArtifact> {
    Ok(ExportArtifact {
        id: row.get(0)?,
        group_id: row.get(1)?,
        archive_path: row.get(2)?,
        digest: row.get(3)?,
        created_at: get_ts(row, 4)?,
        pruned_at: get_opt_ts(row, 5)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<SweepRun> {
    let failed_stage: Option<String> = row.get(2)?;
    let failed_stage = failed_stage
        .map(|s| s.parse::<SweepStatus>().map_err(|v| conversion_err(2, UnknownValue(v))))
        .transpose()?;
    let attempts: i64 = row.get(3)?;
    Ok(SweepRun {
        group_id: row.get(0)?,
        status: get_parsed(row, 1)?,
        failed_stage,
        attempts: attempts.max(0) as u32,
        started_at: get_opt_ts(row, 4)?,
        updated_at: get_ts(row, 5)?,
        last_error: row.get(6)?,
        claimed_by: row.get(7)?,
        claim_expires_at: get_opt_ts(row, 8)?,
    })
}
