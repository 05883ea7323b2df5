//! Row models for the lifecycle tables.
//!
//! Timestamps are UTC. Content and storage paths stay in their ciphertext
//! blob form here; only the cipher turns them back into plaintext.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPolicy {
    Public,
    Private,
    Approval,
}

impl AccessPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessPolicy::Public => "public",
            AccessPolicy::Private => "private",
            AccessPolicy::Approval => "approval",
        }
    }
}

impl FromStr for AccessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(AccessPolicy::Public),
            "private" => Ok(AccessPolicy::Private),
            "approval" => Ok(AccessPolicy::Approval),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
    Poll,
    Reply,
    Code,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
            MessageKind::Poll => "poll",
            MessageKind::Reply => "reply",
            MessageKind::Code => "code",
        }
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "file" => Ok(MessageKind::File),
            "poll" => Ok(MessageKind::Poll),
            "reply" => Ok(MessageKind::Reply),
            "code" => Ok(MessageKind::Code),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub creator_id: String,
    pub access: AccessPolicy,
    pub expiry_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A current member joined with the user's contact details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub group_id: String,
    pub author_id: String,
    /// Display name of the author, joined from users.
    pub author_name: String,
    /// `iv_hex:cipher_hex` blob.
    pub content_enc: String,
    pub kind: MessageKind,
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Insertion sequence, used as the keyset tiebreaker.
    pub seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub message_id: String,
    /// Storage path, encrypted like message content.
    pub path_enc: String,
    pub file_name: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub erased_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub id: String,
    pub group_id: String,
    pub archive_path: String,
    /// SHA-256 hex of the archive bytes on disk.
    pub digest: String,
    pub created_at: DateTime<Utc>,
    pub pruned_at: Option<DateTime<Utc>>,
}

/// Persisted lifecycle state of a group's sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SweepStatus {
    Pending,
    Exporting,
    Notifying,
    Erasing,
    Purged,
    Failed,
}

impl SweepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepStatus::Pending => "PENDING",
            SweepStatus::Exporting => "EXPORTING",
            SweepStatus::Notifying => "NOTIFYING",
            SweepStatus::Erasing => "ERASING",
            SweepStatus::Purged => "PURGED",
            SweepStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SweepStatus::Purged)
    }

    fn rank(&self) -> Option<u8> {
        match self {
            SweepStatus::Pending => Some(0),
            SweepStatus::Exporting => Some(1),
            SweepStatus::Notifying => Some(2),
            SweepStatus::Erasing => Some(3),
            SweepStatus::Purged => Some(4),
            SweepStatus::Failed => None,
        }
    }

    /// Whether a run may move from `self` to `next`.
    ///
    /// Forward moves along the pipeline are allowed. FAILED is reachable from
    /// every non-terminal state and may re-enter any stage before PURGED.
    /// EXPORTING may fall back to PENDING because an aborted export leaves
    /// nothing durable behind.
    pub fn can_transition_to(&self, next: SweepStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (None, Some(to)) => to < 4,
            (Some(from), Some(to)) => {
                to > from || (*self == SweepStatus::Exporting && next == SweepStatus::Pending)
            }
        }
    }
}

impl fmt::Display for SweepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SweepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SweepStatus::Pending),
            "EXPORTING" => Ok(SweepStatus::Exporting),
            "NOTIFYING" => Ok(SweepStatus::Notifying),
            "ERASING" => Ok(SweepStatus::Erasing),
            "PURGED" => Ok(SweepStatus::Purged),
            "FAILED" => Ok(SweepStatus::Failed),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepRun {
    pub group_id: String,
    pub status: SweepStatus,
    /// Stage a FAILED run re-enters on its next attempt.
    pub failed_stage: Option<SweepStatus>,
    /// Consecutive failures of the current stage.
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Sent,
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Sent => "sent",
            DeliveryOutcome::Failed => "failed",
        }
    }
}

impl FromStr for DeliveryOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(DeliveryOutcome::Sent),
            "failed" => Ok(DeliveryOutcome::Failed),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub group_id: String,
    pub recipient: String,
    pub outcome: DeliveryOutcome,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Row counts still present for a group; all zero after a purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFootprint {
    pub groups: i64,
    pub members: i64,
    pub messages: i64,
    pub attachments: i64,
}

impl GroupFootprint {
    pub fn is_empty(&self) -> bool {
        self.groups == 0 && self.members == 0 && self.messages == 0 && self.attachments == 0
    }
}

#[cfg(test)]
mod tests {
    use super::SweepStatus::*;

    #[test]
    fn forward_transitions_allowed() {
        assert!(Pending.can_transition_to(Exporting));
        assert!(Exporting.can_transition_to(Notifying));
        assert!(Notifying.can_transition_to(Erasing));
        assert!(Erasing.can_transition_to(Purged));
    }

    #[test]
    fn purged_is_final() {
        for next in [Pending, Exporting, Notifying, Erasing, Failed] {
            assert!(!Purged.can_transition_to(next));
        }
    }

    #[test]
    fn backward_moves_rejected_except_export_abort() {
        assert!(Exporting.can_transition_to(Pending));
        assert!(!Erasing.can_transition_to(Notifying));
        assert!(!Notifying.can_transition_to(Pending));
        assert!(!Erasing.can_transition_to(Exporting));
    }

    #[test]
    fn failed_reachable_and_retryable() {
        for from in [Pending, Exporting, Notifying, Erasing] {
            assert!(from.can_transition_to(Failed));
        }
        assert!(Failed.can_transition_to(Exporting));
        assert!(Failed.can_transition_to(Erasing));
        assert!(!Failed.can_transition_to(Purged));
    }

    #[test]
    fn status_round_trips_through_text() {
        assert_eq!("ERASING".parse::<super::SweepStatus>(), Ok(Erasing));
        assert!("DONE".parse::<super::SweepStatus>().is_err());
    }
}
