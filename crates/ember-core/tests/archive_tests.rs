mod common;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use common::*;
use ember_core::archive::{hash_file, ArchiveBuilder, EMPTY_BODY_PLACEHOLDER, UNREADABLE_PLACEHOLDER};
use ember_core::error::ArchiveError;
use ember_core::{CipherAlgorithm, ContentCipher, LifecycleStore, MessageKind};
use flate2::read::GzDecoder;

fn unpack(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
    let mut out = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        out.insert(name, data);
    }
    out
}

fn builder(fx: &Fixture) -> ArchiveBuilder {
    ArchiveBuilder::new(fx.store.clone(), fx.cipher.clone(), fx.eraser.clone(), fx.exports_dir())
        .with_page_size(2)
}

#[test]
fn archive_holds_one_line_per_message_and_readable_files() {
    let fx = Fixture::new();
    let seeded = fx.seed_group(
        "Weekend Trip",
        base_time(),
        &["hello", "line one\nline two", "bye"],
        &[("notes.txt", b"first"), ("notes.txt", b"second"), ("gone.png", b"x")],
    );
    // Third attachment disappears before export.
    fs::remove_file(&seeded.attachment_paths[2]).unwrap();

    // A message encrypted under another key cannot be read back.
    let stranger = ContentCipher::new(CipherAlgorithm::Aes256Gcm, &"z".repeat(32)).unwrap();
    fx.store
        .insert_message(
            &seeded.group.id,
            &seeded.group.creator_id,
            &stranger.encrypt_str("secret").unwrap(),
            MessageKind::Text,
            None,
            base_time(),
        )
        .unwrap();

    let built = builder(&fx).build(&seeded.group.id, base_time()).unwrap();

    // 3 text + 3 file messages + 1 unreadable.
    assert_eq!(built.transcript_lines, 7);
    assert_eq!(built.files_added, 2);
    assert_eq!(built.skipped.len(), 1);
    assert_eq!(built.skipped[0].file_name, "gone.png");

    assert_eq!(built.digest, hash_file(&built.path).unwrap());
    assert_eq!(built.size_bytes, fs::metadata(&built.path).unwrap().len());

    let entries = unpack(&built.path);
    let transcript = String::from_utf8(entries["transcript.txt"].clone()).unwrap();
    let lines: Vec<&str> = transcript.lines().collect();
    assert_eq!(lines.len(), 7);
    assert!(lines[0].ends_with(": hello"));
    assert!(lines[1].ends_with(": line one\\nline two"));
    assert_eq!(lines.iter().filter(|l| l.ends_with(EMPTY_BODY_PLACEHOLDER)).count(), 3);
    assert!(lines[6].ends_with(UNREADABLE_PLACEHOLDER));
    assert!(lines[0].starts_with("[2024-06-01 11:00:01 UTC] creator: "));

    assert_eq!(entries["files/notes.txt"], b"first");
    assert_eq!(entries["files/notes (1).txt"], b"second");
    assert!(!entries.keys().any(|k| k.contains("gone.png")));

    let manifest: serde_json::Value = serde_json::from_slice(&entries["manifest.json"]).unwrap();
    assert_eq!(manifest["group_name"], "Weekend Trip");
    assert_eq!(manifest["message_count"], 7);
    assert_eq!(manifest["file_count"], 2);
    assert_eq!(manifest["skipped"][0]["file_name"], "gone.png");

    // Only the finished archive is left behind: no spool, no partial file.
    let files = fx.export_files();
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("Weekend_Trip_"));
    assert!(files[0].ends_with(".tar.gz"));
}

#[test]
fn transcript_spool_is_securely_erased() {
    let fx = Fixture::new();
    let seeded = fx.seed_group("Spool", base_time(), &["a", "b"], &[]);

    builder(&fx).build(&seeded.group.id, base_time()).unwrap();

    let calls = fx.eraser.calls.lock();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].0.to_string_lossy().ends_with(".transcript.spool"));
    assert!(calls[0].1.is_some());
    assert!(!calls[0].0.exists());
}

#[test]
fn unknown_group_is_an_error() {
    let fx = Fixture::new();
    assert!(matches!(
        builder(&fx).build("missing", base_time()),
        Err(ArchiveError::GroupNotFound(_))
    ));
}

#[test]
fn message_store_failure_aborts_without_leftovers() {
    let fx = Fixture::new();
    let seeded = fx.seed_group("Broken", base_time(), &["a"], &[("f.bin", b"data")]);
    fx.rename_table("messages", "messages_moved");

    let err = builder(&fx).build(&seeded.group.id, base_time()).unwrap_err();
    assert!(matches!(err, ArchiveError::Store(_)));
    assert!(fx.export_files().is_empty());
    assert!(seeded.attachment_paths[0].exists());

    fx.rename_table("messages_moved", "messages");
    assert!(fx.store.footprint(&seeded.group.id).unwrap().messages == 2);
}

#[cfg(target_os = "linux")]
#[test]
fn attachment_that_changes_size_while_read_is_skipped() {
    let fx = Fixture::new();
    let seeded = fx.seed_group(
        "Shifting",
        base_time(),
        &["m"],
        &[("a.txt", b"alpha"), ("b.txt", b"bravo")],
    );
    // procfs files stat as empty but yield data, so what is read never
    // matches what was stat'ed.
    let msg = fx
        .store
        .insert_message(
            &seeded.group.id,
            &seeded.group.creator_id,
            &fx.cipher.encrypt_str("").unwrap(),
            MessageKind::File,
            None,
            base_time() - chrono::Duration::hours(1) + chrono::Duration::seconds(2),
        )
        .unwrap();
    let shifting = fx
        .store
        .insert_attachment(
            &msg,
            &fx.cipher.encrypt_str("/proc/self/status").unwrap(),
            "status",
            0,
            "text/plain",
        )
        .unwrap();

    let built = builder(&fx).build(&seeded.group.id, base_time()).unwrap();

    assert_eq!(built.files_added, 2);
    assert_eq!(built.skipped.len(), 1);
    assert_eq!(built.skipped[0].attachment_id, shifting);
    assert!(built.skipped[0].reason.contains("size changed"));

    // Every entry after the skipped one is intact.
    let entries = unpack(&built.path);
    assert_eq!(entries["files/a.txt"], b"alpha");
    assert_eq!(entries["files/b.txt"], b"bravo");
    let manifest: serde_json::Value = serde_json::from_slice(&entries["manifest.json"]).unwrap();
    assert_eq!(manifest["file_count"], 2);
    assert_eq!(manifest["skipped"][0]["file_name"], "status");

    // The staging copy is erased along with the spool.
    assert_eq!(fx.export_files().len(), 1);
    let calls = fx.eraser.calls.lock();
    assert!(calls
        .iter()
        .any(|(p, r)| p.to_string_lossy().ends_with(".attachment.stage") && r.is_some()));
}

#[test]
fn leftovers_of_an_interrupted_build_are_securely_erased() {
    let fx = Fixture::new();
    let seeded = fx.seed_group("Crashed", base_time(), &["a"], &[]);
    let other = fx.seed_group("Neighbour", base_time(), &["b"], &[]);
    fs::create_dir_all(fx.exports_dir()).unwrap();
    let stale_partial = fx
        .exports_dir()
        .join(format!("Crashed_{}_20240101T000000.000Z.tar.gz.partial", seeded.group.id));
    let stale_spool = fx.exports_dir().join(format!(".{}.transcript.spool", seeded.group.id));
    let unrelated = fx
        .exports_dir()
        .join(format!("Neighbour_{}_20240101T000000.000Z.tar.gz.partial", other.group.id));
    for path in [&stale_partial, &stale_spool, &unrelated] {
        fs::write(path, b"plaintext from before the crash").unwrap();
    }

    builder(&fx).build(&seeded.group.id, base_time()).unwrap();

    assert!(!stale_partial.exists());
    assert!(unrelated.exists());
    assert_eq!(fx.eraser.calls_for(&stale_partial).len(), 1);
    // Erased once as a leftover, then once more after the new spool was used.
    assert_eq!(fx.eraser.calls_for(&stale_spool).len(), 2);
}

#[test]
fn failed_build_erases_its_partial_archive() {
    let fx = Fixture::new();
    let seeded = fx.seed_group("Half", base_time(), &["a"], &[("f.bin", b"secret")]);
    *fx.eraser.fail_suffix.lock() = Some(".transcript.spool".into());

    let err = builder(&fx).build(&seeded.group.id, base_time()).unwrap_err();
    assert!(matches!(err, ArchiveError::Scratch(_)));

    let calls = fx.eraser.calls.lock();
    assert!(calls
        .iter()
        .any(|(p, r)| p.to_string_lossy().ends_with(".tar.gz.partial") && r.is_some()));
    drop(calls);
    assert!(!fx
        .export_files()
        .iter()
        .any(|name| name.ends_with(".partial") || name.ends_with(".tar.gz")));
    assert!(seeded.attachment_paths[0].exists());
}
