//! Skip signalling, mutual exclusion and scheduler triggers.

use std::time::Duration;

use chrono::Utc;
use market_ingest::control::{ControlChannel, ControlError};
use market_ingest::schedule::{Scheduler, TriggerOutcome};
use market_ingest::storage::Storage;
use market_ingest::{IngestError, RunMode, RunStatus};
use tokio::time::sleep;
use wiremock::MockServer;

use crate::integration::common::{
    allow_all_robots, coordinator, fast_settings, html, listing, memory_storage, mount_page,
    mount_page_expect, run_logs, test_config, transition_entry,
};

#[tokio::test]
async fn test_skip_takes_effect_at_next_page_boundary() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page(
        &server,
        1,
        html(listing(&[1, 2, 3], true)).set_delay(Duration::from_millis(400)),
    )
    .await;
    mount_page_expect(&server, 2, html(listing(&[4, 5, 6], true)), 0).await;

    let storage = memory_storage(&fast_settings());
    let control = ControlChannel::new(storage.clone());
    let coordinator = coordinator(storage.clone(), test_config(&server));

    let operator = async {
        let run_id = loop {
            if let Some(run) = control.active_run().unwrap() {
                break run.run_id;
            }
            sleep(Duration::from_millis(10)).await;
        };
        // Page 1 is still in flight at this point
        sleep(Duration::from_millis(50)).await;
        control
            .request_skip(&run_id, "tester", "site maintenance")
            .unwrap();
    };

    let (run, ()) = tokio::join!(coordinator.start(RunMode::NewScan), operator);
    let run = run.unwrap();

    assert_eq!(run.status, RunStatus::Skipped);
    assert!(run.skip_requested);
    assert_eq!(run.counters.pages_processed, 1);
    assert_eq!(run.counters.products_created, 3);
    assert_eq!(
        transition_entry(&storage, &run.run_id),
        "RUNNING -> SKIPPED: skip requested"
    );
    assert!(run_logs(&storage, &run.run_id)
        .iter()
        .any(|entry| entry.message == "Skip requested by tester: site maintenance"));
}

#[tokio::test]
async fn test_skip_after_completion_is_rejected() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page(&server, 1, html(listing(&[1], false))).await;

    let storage = memory_storage(&fast_settings());
    let run = coordinator(storage.clone(), test_config(&server))
        .start(RunMode::NewScan)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let control = ControlChannel::new(storage.clone());
    let err = control
        .request_skip(&run.run_id, "tester", "too late")
        .unwrap_err();
    assert!(matches!(err, ControlError::NotRunning { .. }));

    let stored = storage.lock().unwrap().get_run(&run.run_id).unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert!(!stored.skip_requested);
}

#[tokio::test]
async fn test_concurrent_starts_admit_one_run() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page(&server, 1, html(listing(&[1, 2], false))).await;

    let storage = memory_storage(&fast_settings());
    let config = test_config(&server);
    let first = coordinator(storage.clone(), config.clone());
    let second = coordinator(storage.clone(), config);

    let (a, b) = tokio::join!(first.start(RunMode::NewScan), second.start(RunMode::Backfill));

    let (finished, rejected) = match (a, b) {
        (Ok(run), Err(e)) | (Err(e), Ok(run)) => (run, e),
        (a, b) => panic!("expected exactly one run, got {:?} and {:?}", a, b),
    };
    assert_eq!(finished.status, RunStatus::Completed);
    match rejected {
        IngestError::AlreadyRunning { run_id } => assert_eq!(run_id, finished.run_id),
        other => panic!("expected AlreadyRunning, got {:?}", other),
    }
    assert_eq!(storage.lock().unwrap().list_recent_runs(10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_scheduler_reaps_stale_run_then_starts() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page(&server, 1, html(listing(&[1], false))).await;

    let storage = memory_storage(&fast_settings());
    let stale = storage
        .lock()
        .unwrap()
        .create_run_at(
            RunMode::Backfill,
            "old-hash",
            Utc::now() - chrono::Duration::hours(3),
        )
        .unwrap();

    let scheduler = Scheduler::new(coordinator(storage.clone(), test_config(&server)));
    let outcome = scheduler.trigger(RunMode::NewScan).await.unwrap();

    let TriggerOutcome::Finished(run) = outcome else {
        panic!("expected a finished run, got {:?}", outcome);
    };
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.products_created, 1);

    let reaped = storage.lock().unwrap().get_run(&stale.run_id).unwrap().unwrap();
    assert_eq!(reaped.status, RunStatus::Failed);
    assert_eq!(
        transition_entry(&storage, &stale.run_id),
        "RUNNING -> FAILED: reaped: no progress before threshold"
    );
}

#[tokio::test]
async fn test_trigger_while_running_is_a_logged_no_op() {
    let server = MockServer::start().await;
    let storage = memory_storage(&fast_settings());
    let busy = storage
        .lock()
        .unwrap()
        .create_run(RunMode::Backfill, "h")
        .unwrap();

    let scheduler = Scheduler::new(coordinator(storage.clone(), test_config(&server)));
    let outcome = scheduler.trigger(RunMode::NewScan).await.unwrap();

    assert_eq!(
        outcome,
        TriggerOutcome::AlreadyRunning {
            run_id: busy.run_id.clone()
        }
    );
    let runs = storage.lock().unwrap().list_recent_runs(10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Running);
}
