#![allow(dead_code)]

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use ember_core::eraser::EraseReport;
use ember_core::error::{NotifyError, SecureDeleteError};
use ember_core::retry::Backoff;
use ember_core::sweep::{SweepDeps, SweepOptions, Sweeper};
use ember_core::*;
use parking_lot::Mutex;
use tempfile::TempDir;
use uuid::Uuid;

pub const KEY: &str = "0123456789abcdef0123456789abcdef";

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(Mutex::new(at))
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.lock();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub to: String,
    pub subject: String,
    pub attachment: Option<PathBuf>,
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Sent>>,
    pub reject: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    pub fn recipients(&self) -> Vec<String> {
        self.sent.lock().iter().map(|s| s.to.clone()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn send(
        &self,
        recipient: &Member,
        subject: &str,
        _body: &str,
        attachment: Option<&Path>,
    ) -> Result<(), NotifyError> {
        if self.reject.lock().contains(&recipient.email) {
            return Err(NotifyError::Delivery {
                recipient: recipient.email.clone(),
                reason: "mailbox full".into(),
            });
        }
        self.sent.lock().push(Sent {
            to: recipient.email.clone(),
            subject: subject.to_string(),
            attachment: attachment.map(Path::to_path_buf),
        });
        Ok(())
    }
}

/// Notifier that parks inside its first `send` until the test releases it.
/// Later sends go straight through.
pub struct ParkingNotifier {
    entered: Mutex<Option<mpsc::Sender<()>>>,
    gate: Barrier,
    pub sends: AtomicUsize,
}

impl ParkingNotifier {
    /// The receiver fires once the first `send` is parked.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel();
        let notifier = Arc::new(Self {
            entered: Mutex::new(Some(tx)),
            gate: Barrier::new(2),
            sends: AtomicUsize::new(0),
        });
        (notifier, rx)
    }

    pub fn release(&self) {
        self.gate.wait();
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

impl Notifier for ParkingNotifier {
    fn send(
        &self,
        _recipient: &Member,
        _subject: &str,
        _body: &str,
        _attachment: Option<&Path>,
    ) -> Result<(), NotifyError> {
        let parked = self.entered.lock().take();
        if let Some(tx) = parked {
            tx.send(()).unwrap();
            self.gate.wait();
        }
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Real eraser that remembers every call and its report.
pub struct CountingEraser {
    inner: SecureEraser,
    pub calls: Mutex<Vec<(PathBuf, Option<EraseReport>)>>,
    /// Paths ending with this suffix fail to erase.
    pub fail_suffix: Mutex<Option<String>>,
}

impl CountingEraser {
    pub fn new(passes: u32) -> Self {
        Self {
            inner: SecureEraser::new(passes),
            calls: Mutex::new(Vec::new()),
            fail_suffix: Mutex::new(None),
        }
    }

    pub fn calls_for(&self, path: &Path) -> Vec<Option<EraseReport>> {
        self.calls
            .lock()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

impl FileEraser for CountingEraser {
    fn erase(&self, path: &Path) -> Result<Option<EraseReport>, SecureDeleteError> {
        if let Some(suffix) = self.fail_suffix.lock().as_deref() {
            if path.to_string_lossy().ends_with(suffix) {
                return Err(SecureDeleteError::Remove {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
                });
            }
        }
        let report = self.inner.erase(path)?;
        self.calls.lock().push((path.to_path_buf(), report.clone()));
        Ok(report)
    }
}

pub struct SeededGroup {
    pub group: Group,
    pub member_emails: Vec<String>,
    pub attachment_ids: Vec<String>,
    pub attachment_paths: Vec<PathBuf>,
}

pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<SqliteStore>,
    pub cipher: Arc<ContentCipher>,
    pub clock: Arc<FixedClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub eraser: Arc<CountingEraser>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(&dir.path().join("ember.db")).unwrap());
        let cipher = Arc::new(ContentCipher::new(CipherAlgorithm::Aes256Gcm, KEY).unwrap());
        fs::create_dir_all(dir.path().join("uploads")).unwrap();
        Self {
            dir,
            store,
            cipher,
            clock: Arc::new(FixedClock::new(base_time())),
            notifier: Arc::new(RecordingNotifier::default()),
            eraser: Arc::new(CountingEraser::new(3)),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("ember.db")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.dir.path().join("exports")
    }

    pub fn deps(&self) -> SweepDeps {
        self.deps_with(self.notifier.clone(), self.clock.clone())
    }

    pub fn deps_with(&self, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> SweepDeps {
        SweepDeps::new(
            self.store.clone(),
            self.cipher.clone(),
            notifier,
            self.eraser.clone(),
            clock,
        )
    }

    pub fn options(&self) -> SweepOptions {
        SweepOptions {
            exports_dir: self.exports_dir(),
            max_parallel_groups: 2,
            max_attempts: 5,
            claim_ttl: Duration::from_secs(600),
            batch_limit: 50,
            export_retention: None,
            backoff: Backoff::none(),
        }
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.deps(), &self.options()).unwrap()
    }

    pub fn sweeper_with(&self, options: SweepOptions) -> Sweeper {
        Sweeper::new(self.deps(), &options).unwrap()
    }

    /// Seed a group with one extra member, `messages` text messages and one
    /// file message per attachment, all one second apart.
    pub fn seed_group(
        &self,
        name: &str,
        expiry: DateTime<Utc>,
        messages: &[&str],
        attachments: &[(&str, &[u8])],
    ) -> SeededGroup {
        let start = base_time() - chrono::Duration::hours(1);
        let creator = self.user("creator");
        let guest = self.user("guest");
        let group = self
            .store
            .create_group(name, Some("seeded"), &creator.id, AccessPolicy::Private, expiry, start)
            .unwrap();
        self.store.add_member(&group.id, &guest.id, "member", start).unwrap();

        let mut at = start;
        for (i, text) in messages.iter().enumerate() {
            at += chrono::Duration::seconds(1);
            let author = if i % 2 == 0 { &creator.id } else { &guest.id };
            let blob = self.cipher.encrypt_str(text).unwrap();
            self.store
                .insert_message(&group.id, author, &blob, MessageKind::Text, None, at)
                .unwrap();
        }

        let mut attachment_ids = Vec::new();
        let mut attachment_paths = Vec::new();
        for (file_name, bytes) in attachments {
            at += chrono::Duration::seconds(1);
            let path = self
                .dir
                .path()
                .join("uploads")
                .join(format!("{}-{}", Uuid::new_v4(), file_name));
            fs::write(&path, bytes).unwrap();
            let msg = self
                .store
                .insert_message(
                    &group.id,
                    &creator.id,
                    &self.cipher.encrypt_str("").unwrap(),
                    MessageKind::File,
                    None,
                    at,
                )
                .unwrap();
            let path_enc = self.cipher.encrypt_str(path.to_str().unwrap()).unwrap();
            let id = self
                .store
                .insert_attachment(&msg, &path_enc, file_name, bytes.len() as i64, "application/octet-stream")
                .unwrap();
            attachment_ids.push(id);
            attachment_paths.push(path);
        }

        SeededGroup {
            group,
            member_emails: vec![creator.email, guest.email],
            attachment_ids,
            attachment_paths,
        }
    }

    fn user(&self, role: &str) -> User {
        let email = format!("{role}-{}@example.com", Uuid::new_v4().simple());
        self.store.create_user(role, &email, base_time()).unwrap()
    }

    pub fn run(&self, group_id: &str) -> Option<SweepRun> {
        self.store.sweep_run(group_id).unwrap()
    }

    /// Names of files currently in the exports directory.
    pub fn export_files(&self) -> Vec<String> {
        match fs::read_dir(self.exports_dir()) {
            Ok(entries) => {
                let mut names: Vec<String> = entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect();
                names.sort();
                names
            }
            Err(_) => Vec::new(),
        }
    }

    /// Rename a table behind the store's back to make its queries fail.
    pub fn rename_table(&self, from: &str, to: &str) {
        let conn = rusqlite::Connection::open(self.db_path()).unwrap();
        conn.execute_batch(&format!("ALTER TABLE {from} RENAME TO {to}")).unwrap();
    }
}
