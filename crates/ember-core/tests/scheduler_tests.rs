mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use ember_core::sweep::{spawn_sweep_scheduler, Sweeper};
use ember_core::{LifecycleStore, SweepStatus};

async fn wait_for_status(fx: &Fixture, group_id: &str, status: SweepStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if fx.run(group_id).map(|r| r.status) == Some(status) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "group {group_id} never reached {status}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_sweeps_on_start_and_on_wake() {
    let fx = Fixture::new();
    let first = fx.seed_group("First", base_time(), &["a"], &[("a.txt", b"a")]);
    let sweeper = Arc::new(fx.sweeper());

    let (handle, control) = spawn_sweep_scheduler(
        sweeper.clone(),
        Duration::from_secs(3600),
        Duration::from_secs(86_400),
    );
    wait_for_status(&fx, &first.group.id, SweepStatus::Purged).await;

    // Nothing else would fire for an hour; a manual trigger sweeps now. The
    // first sweep may still be returning, so keep asking.
    let second = fx.seed_group("Second", base_time(), &["b"], &[]);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while fx.run(&second.group.id).map(|r| r.status) != Some(SweepStatus::Purged) {
        assert!(tokio::time::Instant::now() < deadline, "manual trigger never swept");
        control.trigger_sweep_now();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    control.shutdown();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
    assert!(sweeper.is_cancelled());
    assert!(fx.store.footprint(&second.group.id).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_sweeper_leaves_expired_groups_alone() {
    let fx = Fixture::new();
    let sweeper = Arc::new(fx.sweeper());
    sweeper.cancel();

    let later = fx.seed_group("Later", base_time(), &["a"], &[]);
    let report = tokio::task::spawn_blocking({
        let sweeper = sweeper.clone();
        move || sweeper.sweep_once()
    })
    .await
    .unwrap();

    assert_eq!(report.due, 0);
    assert!(fx.run(&later.group.id).is_none());
    assert_eq!(fx.store.footprint(&later.group.id).unwrap().messages, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_during_a_sweep_waits_for_the_stage_and_keeps_progress() {
    let fx = Fixture::new();
    let seeded = fx.seed_group("Draining", base_time(), &["a"], &[("f.txt", b"f")]);
    let (notifier, parked) = ParkingNotifier::new();
    let sweeper = Arc::new(
        Sweeper::new(fx.deps_with(notifier.clone(), fx.clock.clone()), &fx.options()).unwrap(),
    );

    let (handle, control) = spawn_sweep_scheduler(
        sweeper.clone(),
        Duration::from_secs(3600),
        Duration::from_secs(86_400),
    );
    tokio::task::spawn_blocking(move || parked.recv_timeout(Duration::from_secs(10)))
        .await
        .unwrap()
        .expect("sweep never reached the notify stage");

    control.shutdown();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !sweeper.is_cancelled() {
        assert!(tokio::time::Instant::now() < deadline, "shutdown never cancelled the sweep");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // The scheduler must still be waiting on the parked stage.
    assert!(!handle.is_finished());

    let gate = notifier.clone();
    tokio::task::spawn_blocking(move || gate.release()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();

    let run = fx.run(&seeded.group.id).unwrap();
    assert_eq!(run.status, SweepStatus::Notifying);
    assert!(run.claimed_by.is_none());
    assert_eq!(notifier.sends(), 2);
    assert!(seeded.attachment_paths[0].exists());

    // A fresh process picks up after the notify stage.
    let restarted = fx.sweeper();
    let report = tokio::task::spawn_blocking(move || restarted.sweep_once())
        .await
        .unwrap();
    assert_eq!(report.purged(), 1);
    assert!(fx.notifier.sent.lock().is_empty());
    assert_eq!(fx.export_files().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trigger_during_a_running_sweep_is_dropped() {
    let fx = Fixture::new();
    let first = fx.seed_group("Running", base_time(), &["a"], &[]);
    let (notifier, parked) = ParkingNotifier::new();
    let sweeper = Arc::new(
        Sweeper::new(fx.deps_with(notifier.clone(), fx.clock.clone()), &fx.options()).unwrap(),
    );

    let (handle, control) = spawn_sweep_scheduler(
        sweeper.clone(),
        Duration::from_secs(3600),
        Duration::from_secs(86_400),
    );
    tokio::task::spawn_blocking(move || parked.recv_timeout(Duration::from_secs(10)))
        .await
        .unwrap()
        .expect("sweep never reached the notify stage");

    let late = fx.seed_group("Late", base_time(), &["b"], &[]);
    control.trigger_sweep_now();
    let gate = notifier.clone();
    tokio::task::spawn_blocking(move || gate.release()).await.unwrap();
    wait_for_status(&fx, &first.group.id, SweepStatus::Purged).await;

    // No queued sweep follows the one that was running.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fx.run(&late.group.id).is_none());

    control.trigger_sweep_now();
    wait_for_status(&fx, &late.group.id, SweepStatus::Purged).await;

    control.shutdown();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
}
