//! Integration tests for the image pipeline and accelerator handoff.

mod common;

use std::time::{Duration, Instant};

use serde_json::json;

use common::{count, harness, position, CallLog, FakeImage, FakeText};
use genqueue_core::backend::PromptStatus;
use genqueue_core::job::{JobKind, JobStatus, NewJob};

fn image_job(payload: serde_json::Value) -> NewJob {
    NewJob::new(JobKind::ImageGeneration, payload)
}

fn cave() -> NewJob {
    image_job(json!({
        "workflow": "txt2img",
        "prompt": "a glowing cave",
        "seed": 1234,
        "category": "scenes",
        "filename_prefix": "cave"
    }))
}

// ---------------------------------------------------------------------------
// Test: the text model is unloaded strictly before the workflow is submitted
// ---------------------------------------------------------------------------

#[tokio::test]
async fn text_unload_happens_before_image_submit() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log).loaded(), FakeImage::new(&log));
    h.queue.start();

    let job = h.run(cave()).await;

    assert_eq!(job.status, JobStatus::Completed);
    let unload = position(&log, "text.unload").expect("text model was never unloaded");
    let submit = position(&log, "image.submit").unwrap();
    assert!(unload < submit, "log: {:?}", log.lock().unwrap());
    assert!(!h.text.is_resident());

    h.queue.shutdown().await;
}

#[tokio::test]
async fn switching_kinds_publishes_a_handoff() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log).loaded(), FakeImage::new(&log));
    h.queue.start();

    h.run(NewJob::new(JobKind::TextGeneration, json!({"prompt": "first"})))
        .await;
    h.run(NewJob::new(JobKind::TextGeneration, json!({"prompt": "second"})))
        .await;
    assert_eq!(count(&log, "text.unload"), 0);

    h.run(cave()).await;

    let handoffs = h.events_named("resource.handoff");
    assert_eq!(handoffs.len(), 1);
    assert_eq!(handoffs[0]["from"], "text_backend");
    assert_eq!(handoffs[0]["to"], "image_backend");
    assert_eq!(handoffs[0]["release_ok"], true);
    assert_eq!(count(&log, "text.unload"), 1);

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: a finished workflow is downloaded into a sequential file
// ---------------------------------------------------------------------------

#[tokio::test]
async fn artifact_is_saved_under_kind_and_category() {
    let log = CallLog::default();
    let h = harness(
        FakeText::new(&log),
        FakeImage::new(&log).with_progress(&[(1, 20), (20, 20)]),
    );
    h.queue.start();

    let first = h.run(cave()).await;
    let second = h.run(cave()).await;

    assert_eq!(first.status, JobStatus::Completed);
    let result = first.result.unwrap();
    assert_eq!(result["filename"], "cave_00001.png");
    assert_eq!(result["seed"], 1234);
    assert_eq!(result["workflow"], "txt2img");
    assert_eq!(second.result.unwrap()["filename"], "cave_00002.png");

    let expected = h
        .artifact_dir
        .path()
        .join("image_generation")
        .join("scenes")
        .join("cave_00001.png");
    assert_eq!(result["path"], expected.to_string_lossy().as_ref());
    assert_eq!(std::fs::read(&expected).unwrap(), b"\x89PNG fake");

    let graph = &h.image.submitted()[0];
    assert_eq!(graph["6"]["inputs"]["text"], "a glowing cave");
    assert_eq!(graph["3"]["inputs"]["seed"], 1234);

    h.queue.shutdown().await;
}

#[tokio::test]
async fn random_seed_is_recorded_when_unset() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log), FakeImage::new(&log));
    h.queue.start();

    let job = h
        .run(image_job(json!({"workflow": "txt2img", "prompt": "fog"})))
        .await;

    let seed = job.result.unwrap()["seed"].as_u64().unwrap();
    assert_eq!(h.image.submitted()[0]["3"]["inputs"]["seed"], seed);

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: memory is freed whatever the outcome
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backend_reported_failure_still_frees_memory() {
    let log = CallLog::default();
    let h = harness(
        FakeText::new(&log),
        FakeImage::new(&log).ending_with(PromptStatus::Failed("CUDA out of memory".into())),
    );
    h.queue.start();

    let job = h.run(cave()).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("CUDA out of memory"));
    let submit = position(&log, "image.submit").unwrap();
    assert!(log.lock().unwrap()[submit..].iter().any(|c| c == "image.free"));
    assert_eq!(count(&log, "image.fetch"), 0);

    h.queue.shutdown().await;
}

#[tokio::test]
async fn poll_timeout_interrupts_and_fails() {
    let log = CallLog::default();
    let h = harness(
        FakeText::new(&log),
        FakeImage::new(&log).ending_with(PromptStatus::Running),
    );
    h.queue.start();

    let job = h.run(cave()).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("timed out"));
    let interrupt = position(&log, "image.interrupt").unwrap();
    assert!(log.lock().unwrap()[interrupt..].iter().any(|c| c == "image.free"));

    h.queue.shutdown().await;
}

#[tokio::test]
async fn stalled_progress_relay_counts_against_the_timeout() {
    let log = CallLog::default();
    let h = harness(
        FakeText::new(&log),
        FakeImage::new(&log)
            .ending_with(PromptStatus::Running)
            .with_slow_watch(Duration::from_secs(30)),
    );
    h.queue.start();

    let started = Instant::now();
    let job = h.run(cave()).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(count(&log, "image.interrupt") >= 1);
    assert!(count(&log, "image.free") >= 1);

    h.queue.shutdown().await;
}

#[tokio::test]
async fn empty_output_fails_the_job() {
    let log = CallLog::default();
    let h = harness(
        FakeText::new(&log),
        FakeImage::new(&log).ending_with(PromptStatus::Done(Vec::new())),
    );
    h.queue.start();

    let job = h.run(cave()).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("without producing an artifact"));

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: fail fast before submitting anything
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreachable_backend_fails_fast() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log), FakeImage::new(&log).unreachable());
    h.queue.start();

    let job = h.run(cave()).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().starts_with("Resource unavailable"));
    assert_eq!(count(&log, "image.submit"), 0);

    h.queue.shutdown().await;
}

#[tokio::test]
async fn unknown_workflow_template_fails() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log), FakeImage::new(&log));
    h.queue.start();

    let job = h
        .run(image_job(json!({"workflow": "inpaint", "prompt": "x"})))
        .await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error.as_deref(),
        Some("Invalid payload: Unknown workflow 'inpaint'")
    );
    assert_eq!(count(&log, "image.submit"), 0);

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: early payload failures still release backend memory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_workflow_template_still_frees_memory() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log), FakeImage::new(&log));
    h.queue.start();

    let job = h
        .run(image_job(json!({"workflow": "inpaint", "prompt": "x"})))
        .await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(count(&log, "image.submit"), 0);
    assert!(count(&log, "image.free") >= 1, "log: {:?}", log.lock().unwrap());

    h.queue.shutdown().await;
}
