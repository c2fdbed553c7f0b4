//! Integration tests for the job queue: lifecycle, ordering, isolation.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;

use common::{harness, harness_with_config, test_queue_config, CallLog, FakeImage, FakeText};
use genqueue_core::error::JobError;
use genqueue_core::job::{JobKind, JobStatus, NewJob};
use genqueue_worker::QueueError;

fn text_job(prompt: &str) -> NewJob {
    NewJob::new(JobKind::TextGeneration, json!({"prompt": prompt}))
}

// ---------------------------------------------------------------------------
// Test: every job's events run queued -> started -> terminal, exactly once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn job_events_follow_the_status_lifecycle() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log).loaded(), FakeImage::new(&log));
    h.queue.start();

    let ok = h.run(text_job("hello")).await;
    let bad = h.run(text_job("PANIC please")).await;

    assert_eq!(ok.status, JobStatus::Completed);
    assert_eq!(bad.status, JobStatus::Failed);

    let lifecycle = |id| -> Vec<String> {
        h.event_names(Some(id))
            .into_iter()
            .filter(|n| n != "generation.update")
            .collect()
    };
    assert_eq!(
        lifecycle(ok.id),
        vec!["queue.job_queued", "generation.started", "generation.completed"]
    );
    assert_eq!(
        lifecycle(bad.id),
        vec!["queue.job_queued", "generation.started", "generation.failed"]
    );
    assert!(ok.started_at.is_some() && ok.completed_at.is_some());
    assert!(ok.result.is_some() && ok.error.is_none());

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: lower priority value is served first regardless of submit order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lower_priority_value_starts_first() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log).loaded(), FakeImage::new(&log));

    let a = h.queue.submit(text_job("a").with_priority(5)).await.unwrap();
    let b = h.queue.submit(text_job("b").with_priority(1)).await.unwrap();
    assert_eq!(h.queue.queue_depth(), 2);

    h.queue.start();
    h.queue.wait_for(a, Duration::from_secs(10)).await.unwrap();
    h.queue.wait_for(b, Duration::from_secs(10)).await.unwrap();

    let started: Vec<i64> = h
        .events_named("generation.started")
        .iter()
        .map(|e| e["job_id"].as_i64().unwrap())
        .collect();
    assert_eq!(started, vec![b, a]);

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: one lane never runs two jobs at once
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lane_runs_one_job_at_a_time() {
    let log = CallLog::default();
    let h = harness(
        FakeText::new(&log)
            .loaded()
            .with_delay(Duration::from_millis(20)),
        FakeImage::new(&log),
    );
    h.queue.start();

    let submissions = (0..6).map(|i| {
        let queue = h.queue.clone();
        async move {
            queue
                .submit_and_wait(text_job(&format!("job {i}")), Some(Duration::from_secs(10)))
                .await
                .unwrap()
        }
    });
    let jobs = futures::future::join_all(submissions).await;

    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
    assert_eq!(h.text.max_in_flight(), 1);

    let mut spans: Vec<_> = jobs
        .iter()
        .map(|j| (j.started_at.unwrap(), j.completed_at.unwrap()))
        .collect();
    spans.sort();
    for pair in spans.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "jobs overlapped: {pair:?}");
    }

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: a panicking handler fails its job and the lane keeps going
// ---------------------------------------------------------------------------

#[tokio::test]
async fn panicking_handler_does_not_stop_the_lane() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log).loaded(), FakeImage::new(&log));
    h.queue.start();

    let crashed = h.run(text_job("PANIC")).await;
    assert_eq!(crashed.status, JobStatus::Failed);
    let error = crashed.error.unwrap();
    assert!(error.contains("backend exploded"), "{error}");

    let next = h.run(text_job("still alive?")).await;
    assert_eq!(next.status, JobStatus::Completed);

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: wait timeout abandons the wait, not the job
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wait_timeout_leaves_the_job_running() {
    let log = CallLog::default();
    let h = harness(
        FakeText::new(&log)
            .loaded()
            .with_delay(Duration::from_millis(300)),
        FakeImage::new(&log),
    );
    h.queue.start();

    let id = h.queue.submit(text_job("slow")).await.unwrap();
    let err = h
        .queue
        .wait_for(id, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        QueueError::Job(JobError::WaitTimeout { job_id, .. }) if job_id == id
    );

    let job = h.queue.wait_for(id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: waiting on a finished job returns immediately
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wait_on_terminal_job_returns_stored_record() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log).loaded(), FakeImage::new(&log));
    h.queue.start();

    let done = h.run(text_job("once")).await;
    let again = h
        .queue
        .wait_for(done.id, Duration::from_millis(1))
        .await
        .unwrap();
    assert_eq!(again, done);

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: unknown ids are JobNotFound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_job_is_not_found() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log), FakeImage::new(&log));

    assert_matches!(
        h.queue.get(404).await,
        Err(QueueError::Job(JobError::JobNotFound(404)))
    );
    assert_matches!(
        h.queue.wait_for(404, Duration::from_secs(1)).await,
        Err(QueueError::Job(JobError::JobNotFound(404)))
    );
}

// ---------------------------------------------------------------------------
// Test: submissions get the configured attempt budget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_applies_default_attempt_budget() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log), FakeImage::new(&log));

    let defaulted = h.queue.submit(text_job("x")).await.unwrap();
    let explicit = h
        .queue
        .submit(text_job("y").with_max_attempts(5))
        .await
        .unwrap();

    assert_eq!(h.queue.get(defaulted).await.unwrap().max_attempts, 3);
    assert_eq!(h.queue.get(explicit).await.unwrap().max_attempts, 5);
    assert_eq!(h.queue.get(defaulted).await.unwrap().status, JobStatus::Pending);
}

// ---------------------------------------------------------------------------
// Test: shutdown stops accepting and wakes waiters; start is idempotent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_rejects_new_submissions() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log).loaded(), FakeImage::new(&log));
    h.queue.start();
    h.queue.start();

    h.run(text_job("before")).await;
    h.queue.shutdown().await;

    assert!(!h.queue.is_accepting());
    assert_matches!(
        h.queue.submit(text_job("after")).await,
        Err(QueueError::NotAccepting)
    );
}

#[tokio::test]
async fn shutdown_leaves_queued_jobs_pending() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log).loaded(), FakeImage::new(&log));

    let id = h.queue.submit(text_job("never run")).await.unwrap();
    let waiter = {
        let queue = h.queue.clone();
        tokio::spawn(async move { queue.wait_for(id, Duration::from_secs(30)).await })
    };
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.queue.shutdown().await;

    assert_matches!(
        waiter.await.unwrap(),
        Err(QueueError::Job(JobError::ResourceUnavailable(_)))
    );
    assert_eq!(h.queue.get(id).await.unwrap().status, JobStatus::Pending);
}

// ---------------------------------------------------------------------------
// Test: a job still running when its lane is aborted ends up failed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_fails_the_job_its_lane_abandons() {
    let log = CallLog::default();
    let config = genqueue_worker::QueueConfig {
        lane_shutdown_timeout: Duration::from_millis(50),
        ..test_queue_config()
    };
    let h = harness_with_config(
        FakeText::new(&log)
            .loaded()
            .with_delay(Duration::from_secs(30)),
        FakeImage::new(&log),
        config,
    );
    h.queue.start();

    let id = h.queue.submit(text_job("endless")).await.unwrap();
    let waiter = {
        let queue = h.queue.clone();
        tokio::spawn(async move { queue.wait_for(id, Duration::from_secs(30)).await })
    };
    for _ in 0..100 {
        if h.queue.get(id).await.unwrap().status == JobStatus::Processing {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.queue.get(id).await.unwrap().status, JobStatus::Processing);

    h.queue.shutdown().await;

    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("Interrupted by shutdown"));
    assert!(job.completed_at.is_some());

    let woken = waiter.await.unwrap().unwrap();
    assert_eq!(woken.status, JobStatus::Failed);
    assert_eq!(
        h.event_names(Some(id)).last().map(String::as_str),
        Some("generation.failed")
    );
}
