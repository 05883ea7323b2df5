//! Member notification for finished exports.
//!
//! The engine only knows the [`Notifier`] contract. [`OutboxNotifier`] drops
//! one JSON envelope per recipient into a spool directory picked up by an
//! external mail relay.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::NotifyError;
use crate::models::Member;

pub trait Notifier: Send + Sync {
    /// Deliver one message. A failure only concerns this recipient.
    fn send(
        &self,
        recipient: &Member,
        subject: &str,
        body: &str,
        attachment: Option<&Path>,
    ) -> Result<(), NotifyError>;
}

pub fn export_subject(group_name: &str) -> String {
    format!("Your {group_name} group export is ready")
}

pub fn export_body(recipient_name: &str, group_name: &str, exported_at: DateTime<Utc>) -> String {
    format!(
        "Hi {recipient_name},\n\n\
         The group \"{group_name}\" has reached its expiry time. All of its messages and files \
         have been permanently deleted.\n\n\
         The attached archive, created {}, is the only remaining copy of the conversation.\n",
        exported_at.format("%Y-%m-%d %H:%M UTC")
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub to_name: String,
    pub to_email: String,
    pub subject: String,
    pub body: String,
    pub attachment: Option<PathBuf>,
}

pub struct OutboxNotifier {
    outbox: PathBuf,
}

impl OutboxNotifier {
    pub fn new(outbox: impl Into<PathBuf>) -> Result<Self, NotifyError> {
        let outbox = outbox.into();
        fs::create_dir_all(outbox.join(".staging"))?;
        Ok(Self { outbox })
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    /// Envelopes currently waiting in the outbox, oldest first.
    pub fn pending(&self) -> Result<Vec<Envelope>, NotifyError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.outbox)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        paths
            .iter()
            .map(|p| -> Result<Envelope, NotifyError> { Ok(serde_json::from_slice(&fs::read(p)?)?) })
            .collect()
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, NotifyError> {
        let staging = self.outbox.join(".staging").join(name);
        {
            let mut file = File::create(&staging)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        let dest = self.outbox.join(name);
        fs::rename(&staging, &dest)?;
        Ok(dest)
    }
}

impl Notifier for OutboxNotifier {
    fn send(
        &self,
        recipient: &Member,
        subject: &str,
        body: &str,
        attachment: Option<&Path>,
    ) -> Result<(), NotifyError> {
        if recipient.email.trim().is_empty() || !recipient.email.contains('@') {
            return Err(NotifyError::Delivery {
                recipient: recipient.email.clone(),
                reason: "no deliverable address".into(),
            });
        }
        if let Some(path) = attachment {
            if !path.is_file() {
                return Err(NotifyError::Delivery {
                    recipient: recipient.email.clone(),
                    reason: format!("attachment {} missing", path.display()),
                });
            }
        }

        let envelope = Envelope {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            to_name: recipient.name.clone(),
            to_email: recipient.email.clone(),
            subject: subject.to_string(),
            body: body.to_string(),
            attachment: attachment.map(Path::to_path_buf),
        };
        let name = format!(
            "{}-{}.json",
            envelope.created_at.format("%Y%m%dT%H%M%S%6f"),
            envelope.id
        );
        let dest = self.write_atomic(&name, &serde_json::to_vec_pretty(&envelope)?)?;
        debug!(recipient = %recipient.email, path = %dest.display(), "envelope queued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn member(email: &str) -> Member {
        Member {
            user_id: "u1".into(),
            name: "Alice".into(),
            email: email.into(),
            role: "member".into(),
        }
    }

    #[test]
    fn envelope_lands_in_outbox() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("a.tar.gz");
        fs::write(&archive, b"x").unwrap();
        let notifier = OutboxNotifier::new(dir.path().join("outbox")).unwrap();

        notifier
            .send(&member("alice@example.com"), &export_subject("Trip"), "body", Some(&archive))
            .unwrap();

        let pending = notifier.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].subject, "Your Trip group export is ready");
        assert_eq!(pending[0].attachment.as_deref(), Some(archive.as_path()));
        assert!(fs::read_dir(notifier.outbox().join(".staging")).unwrap().next().is_none());
    }

    #[test]
    fn undeliverable_recipient_fails_alone() {
        let dir = tempdir().unwrap();
        let notifier = OutboxNotifier::new(dir.path()).unwrap();
        assert!(matches!(
            notifier.send(&member(""), "s", "b", None),
            Err(NotifyError::Delivery { .. })
        ));
        notifier.send(&member("bob@example.com"), "s", "b", None).unwrap();
        assert_eq!(notifier.pending().unwrap().len(), 1);
    }

    #[test]
    fn body_says_data_is_gone() {
        let body = export_body("Alice", "Trip", Utc::now());
        assert!(body.contains("permanently deleted"));
        assert!(body.starts_with("Hi Alice,"));
    }
}
