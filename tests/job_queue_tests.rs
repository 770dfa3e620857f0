//! Integration tests for the job queue
//!
//! These tests verify that:
//! 1. Jobs run in order on the worker thread and stop at the first failure
//! 2. Overall progress is weighted and never moves backwards
//! 3. Cancellation takes effect between jobs
//! 4. A panicking job is reported as a failure

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use installer_core::{
    FnJob, GlobalStore, Job, JobContext, JobList, JobQueue, JobResult, QueueEvent, QueueOutcome,
};

fn recording_job(name: &str, log: &Arc<Mutex<Vec<String>>>, result: JobResult) -> Box<dyn Job> {
    let log = Arc::clone(log);
    let label = name.to_string();
    FnJob::new(name, move |_: &JobContext| {
        log.lock().unwrap().push(label.clone());
        result.clone()
    })
    .boxed()
}

#[test]
fn test_fail_fast() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut queue = JobQueue::new(Arc::new(GlobalStore::new()));
    queue.enqueue(vec![
        recording_job("one", &log, JobResult::ok()),
        recording_job("two", &log, JobResult::ok()),
        recording_job("three", &log, JobResult::error("disk full", "no space left on /mnt")),
        recording_job("four", &log, JobResult::ok()),
    ]);

    let outcome = queue.run().unwrap();

    assert_eq!(*log.lock().unwrap(), ["one", "two", "three"]);
    assert_eq!(
        outcome,
        QueueOutcome::Failed {
            index: 2,
            job: "three".to_string(),
            message: "disk full".to_string(),
            details: "no space left on /mnt".to_string(),
        }
    );
}

#[test]
fn test_event_sequence() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut queue = JobQueue::new(Arc::new(GlobalStore::new()));
    queue.enqueue(vec![
        recording_job("a", &log, JobResult::ok()),
        recording_job("b", &log, JobResult::ok()),
    ]);

    let handle = queue.start().unwrap();
    let events: Vec<QueueEvent> = handle.events().iter().collect();
    assert!(handle.wait().is_success());

    let started: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            QueueEvent::JobStarted { name, total, .. } => Some((name.as_str(), *total)),
            _ => None,
        })
        .collect();
    assert_eq!(started, [("a", 2), ("b", 2)]);
    assert_eq!(events.last(), Some(&QueueEvent::Finished));
}

#[test]
fn test_progress_is_weighted_and_monotonic() {
    let mut queue = JobQueue::new(Arc::new(GlobalStore::new()));
    let jobs: JobList = vec![
        FnJob::new("light", |ctx: &JobContext| {
            ctx.report_progress(0.5);
            JobResult::ok()
        })
        .boxed(),
        FnJob::new("heavy", |ctx: &JobContext| {
            ctx.report_progress(0.8);
            ctx.report_progress(0.2);
            JobResult::ok()
        })
        .with_weight(3.0)
        .boxed(),
    ];
    queue.enqueue(jobs);

    let handle = queue.start().unwrap();
    let percents: Vec<f64> = handle
        .events()
        .iter()
        .filter_map(|e| match e {
            QueueEvent::Progress { percent, .. } => Some(percent),
            _ => None,
        })
        .collect();
    assert!(handle.wait().is_success());

    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
    assert!(percents.iter().any(|p| (p - 0.125).abs() < 1e-9), "{:?}", percents);
    assert!((percents.last().copied().unwrap_or_default() - 1.0).abs() < 1e-9);
}

#[test]
fn test_status_reaches_progress_events() {
    let mut queue = JobQueue::new(Arc::new(GlobalStore::new()));
    queue.enqueue(vec![FnJob::new("partition", |ctx: &JobContext| {
        ctx.set_status("Creating partitions");
        JobResult::ok()
    })
    .boxed()]);

    let handle = queue.start().unwrap();
    let statuses: Vec<String> = handle
        .events()
        .iter()
        .filter_map(|e| match e {
            QueueEvent::Progress { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    handle.wait();

    assert!(statuses.iter().any(|s| s == "Creating partitions"), "{:?}", statuses);
}

#[test]
fn test_cancel_between_jobs() {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let ran = Arc::new(AtomicUsize::new(0));

    let mut queue = JobQueue::new(Arc::new(GlobalStore::new()));
    let counter = Arc::clone(&ran);
    queue.enqueue(vec![
        FnJob::new("blocking", move |_: &JobContext| {
            started_tx.send(()).unwrap();
            release_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            JobResult::ok()
        })
        .boxed(),
        FnJob::new("never", move |_: &JobContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            JobResult::ok()
        })
        .boxed(),
    ]);

    let handle = queue.start().unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    handle.cancel();
    release_tx.send(()).unwrap();

    assert_eq!(handle.wait(), QueueOutcome::Cancelled { completed: 1 });
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_jobs_share_the_store() {
    let storage = Arc::new(GlobalStore::new());
    let mut queue = JobQueue::new(Arc::clone(&storage));
    queue.enqueue(vec![
        FnJob::new("writer", |ctx: &JobContext| {
            ctx.storage().insert("hostname", "archbox");
            JobResult::ok()
        })
        .boxed(),
        FnJob::new("reader", |ctx: &JobContext| match ctx.storage().value("hostname").as_str() {
            Some("archbox") => JobResult::ok(),
            other => JobResult::error("hostname missing", format!("{:?}", other)),
        })
        .boxed(),
    ]);

    assert!(queue.run().unwrap().is_success());
    assert_eq!(storage.value("hostname").as_str(), Some("archbox"));
}

#[test]
fn test_panicking_job_fails_queue() {
    let mut queue = JobQueue::new(Arc::new(GlobalStore::new()));
    queue.enqueue(vec![FnJob::new("explodes", |_: &JobContext| -> JobResult {
        panic!("boom");
    })
    .boxed()]);

    match queue.run().unwrap() {
        QueueOutcome::Failed { job, details, .. } => {
            assert_eq!(job, "explodes");
            assert!(details.contains("boom"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[test]
fn test_empty_queue_finishes() {
    let queue = JobQueue::new(Arc::new(GlobalStore::new()));
    assert!(queue.is_empty());
    assert_eq!(queue.run().unwrap(), QueueOutcome::Finished);
}
