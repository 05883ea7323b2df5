//! In-memory pipeline position for one group.

use std::path::{Path, PathBuf};

use crate::archive::verify_archive_digest;
use crate::error::ArchiveError;
use crate::models::{ExportArtifact, SweepRun, SweepStatus};

/// Proof that a recorded export artifact exists and its archive on disk still
/// matches the recorded digest. Only obtainable through [`VerifiedExport::verify`],
/// so no erase or purge step can be reached without one.
#[derive(Debug, Clone)]
pub struct VerifiedExport {
    artifact: ExportArtifact,
}

impl VerifiedExport {
    pub fn verify(artifact: ExportArtifact) -> Result<Self, ArchiveError> {
        let path = PathBuf::from(&artifact.archive_path);
        if artifact.digest.is_empty() {
            return Err(ArchiveError::DigestMismatch {
                path,
                recorded: String::new(),
                actual: String::new(),
            });
        }
        verify_archive_digest(&path, &artifact.digest)?;
        Ok(Self { artifact })
    }

    /// Recompute the digest against the archive as it is now.
    pub fn reverify(self) -> Result<Self, ArchiveError> {
        Self::verify(self.artifact)
    }

    pub fn artifact(&self) -> &ExportArtifact {
        &self.artifact
    }

    pub fn archive_path(&self) -> &Path {
        Path::new(&self.artifact.archive_path)
    }
}

#[derive(Debug, Clone)]
pub enum Stage {
    Export,
    Notify(VerifiedExport),
    Erase(VerifiedExport),
    Purge(VerifiedExport),
}

impl Stage {
    /// Persisted status recorded while this stage runs.
    pub fn status(&self) -> SweepStatus {
        match self {
            Stage::Export => SweepStatus::Exporting,
            Stage::Notify(_) => SweepStatus::Notifying,
            Stage::Erase(_) | Stage::Purge(_) => SweepStatus::Erasing,
        }
    }
}

/// Stage a run picks up at. An interrupted export restarts from EXPORTING;
/// a FAILED run re-enters the stage that failed.
pub fn resume_point(run: &SweepRun) -> SweepStatus {
    match run.status {
        SweepStatus::Pending | SweepStatus::Exporting => SweepStatus::Exporting,
        SweepStatus::Failed => match run.failed_stage {
            Some(SweepStatus::Notifying) => SweepStatus::Notifying,
            Some(SweepStatus::Erasing) => SweepStatus::Erasing,
            _ => SweepStatus::Exporting,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use tempfile::tempdir;

    fn run(status: SweepStatus, failed_stage: Option<SweepStatus>) -> SweepRun {
        SweepRun {
            group_id: "g".into(),
            status,
            failed_stage,
            attempts: 0,
            started_at: None,
            updated_at: Utc::now(),
            last_error: None,
            claimed_by: None,
            claim_expires_at: None,
        }
    }

    #[test]
    fn resume_points() {
        use SweepStatus::*;
        assert_eq!(resume_point(&run(Pending, None)), Exporting);
        assert_eq!(resume_point(&run(Exporting, None)), Exporting);
        assert_eq!(resume_point(&run(Notifying, None)), Notifying);
        assert_eq!(resume_point(&run(Erasing, None)), Erasing);
        assert_eq!(resume_point(&run(Failed, Some(Erasing))), Erasing);
        assert_eq!(resume_point(&run(Failed, None)), Exporting);
        assert_eq!(resume_point(&run(Purged, None)), Purged);
    }

    #[test]
    fn proof_requires_matching_archive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("g.tar.gz");
        fs::write(&path, b"archive").unwrap();
        let digest = crate::archive::hash_file(&path).unwrap();
        let artifact = ExportArtifact {
            id: "e".into(),
            group_id: "g".into(),
            archive_path: path.to_string_lossy().into_owned(),
            digest,
            created_at: Utc::now(),
            pruned_at: None,
        };

        let proof = VerifiedExport::verify(artifact.clone()).unwrap();
        assert_eq!(proof.archive_path(), path.as_path());

        fs::write(&path, b"tampered").unwrap();
        assert!(proof.reverify().is_err());

        let empty = ExportArtifact {
            digest: String::new(),
            ..artifact
        };
        assert!(VerifiedExport::verify(empty).is_err());
    }
}
