//! Integration tests for the text generation pipeline.

mod common;

use serde_json::json;

use common::{count, harness, position, CallLog, FakeImage, FakeText};
use genqueue_core::backend::BackendError;
use genqueue_core::job::{JobKind, JobStatus, NewJob};

fn text_job(payload: serde_json::Value) -> NewJob {
    NewJob::new(JobKind::TextGeneration, payload)
}

// ---------------------------------------------------------------------------
// Test: without a parser the first generation is the result
// ---------------------------------------------------------------------------

#[tokio::test]
async fn raw_text_completes_after_one_attempt() {
    let log = CallLog::default();
    let h = harness(
        FakeText::new(&log)
            .loaded()
            .with_responses(["Once upon a time"]),
        FakeImage::new(&log),
    );
    h.queue.start();

    let job = h.run(text_job(json!({"prompt": "Tell a story"}))).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempt, 1);
    let result = job.result.unwrap();
    assert_eq!(result["text"], "Once upon a time");
    assert_eq!(result["attempts"], 1);
    assert_eq!(result["tokens"], 4);
    assert!(result.get("parsing_success").is_none());
    assert_eq!(count(&log, "text.generate"), 1);

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: streamed chunks are relayed as generation.update events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streamed_chunks_are_published() {
    let log = CallLog::default();
    let h = harness(
        FakeText::new(&log).loaded().with_responses(["a b c"]),
        FakeImage::new(&log),
    );
    h.queue.start();

    let job = h.run(text_job(json!({"prompt": "abc"}))).await;

    let chunks: Vec<String> = h
        .events_named("generation.update")
        .iter()
        .filter(|e| e["job_id"] == job.id)
        .map(|e| e["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(chunks.concat(), "a b c");
    assert_eq!(chunks.len(), 3);

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: exhausted parse retries complete with the LAST text
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_retries_complete_with_last_text() {
    let log = CallLog::default();
    let h = harness(
        FakeText::new(&log)
            .loaded()
            .with_responses(["first try", "second try", "third try"]),
        FakeImage::new(&log),
    );
    h.queue.start();

    let job = h
        .run(
            text_job(json!({"prompt": "json please", "parser": {"name": "reject"}}))
                .with_max_attempts(3),
        )
        .await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempt, 3);
    let result = job.result.unwrap();
    assert_eq!(result["parsing_success"], false);
    assert_eq!(result["text"], "third try");
    assert_eq!(result["attempts"], 3);
    assert!(result.get("parsed").is_none());
    assert_eq!(count(&log, "text.generate"), 3);

    let retries = h.events_named("generation.retry");
    let attempts: Vec<_> = retries.iter().map(|e| e["attempt"].clone()).collect();
    assert_eq!(attempts, vec![json!(2), json!(3)]);
    assert!(retries.iter().all(|e| e["max_attempts"] == 3));

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: a parse failure regenerates and can then succeed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn regeneration_recovers_structured_output() {
    let log = CallLog::default();
    let h = harness(
        FakeText::new(&log).loaded().with_responses([
            "Sure! Here is the goblin.",
            "```json\n{\"name\": \"Grik\", \"hp\": 7}\n```",
        ]),
        FakeImage::new(&log),
    );
    h.queue.start();

    let job = h
        .run(text_job(json!({
            "prompt": "A goblin as JSON",
            "parser": {"name": "json_object", "required_fields": ["name", "hp"]}
        })))
        .await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempt, 2);
    let result = job.result.unwrap();
    assert_eq!(result["parsing_success"], true);
    assert_eq!(result["parsed"], json!({"name": "Grik", "hp": 7}));
    assert_eq!(h.events_named("generation.retry").len(), 1);

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: backend failures fail the job without retrying
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backend_failure_is_not_retried() {
    let log = CallLog::default();
    let h = harness(
        FakeText::new(&log)
            .loaded()
            .failing(BackendError::Timeout(std::time::Duration::from_secs(600))),
        FakeImage::new(&log),
    );
    h.queue.start();

    let job = h
        .run(text_job(json!({"prompt": "x", "parser": {"name": "json"}})))
        .await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().starts_with("Generation failed"));
    assert_eq!(count(&log, "text.generate"), 1);
    assert!(h.events_named("generation.retry").is_empty());

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: the model is loaded on demand before generating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unloaded_model_is_loaded_first() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log), FakeImage::new(&log));
    h.queue.start();

    let job = h.run(text_job(json!({"prompt": "x"}))).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert!(position(&log, "text.load").unwrap() < position(&log, "text.generate").unwrap());
    assert!(h.text.is_resident());

    h.queue.shutdown().await;
}

#[tokio::test]
async fn failed_load_is_resource_unavailable() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log).failing_load(), FakeImage::new(&log));
    h.queue.start();

    let job = h.run(text_job(json!({"prompt": "x"}))).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().starts_with("Resource unavailable"));
    assert_eq!(count(&log, "text.generate"), 0);

    h.queue.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: bad payloads fail before any generation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_parser_fails_without_generating() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log).loaded(), FakeImage::new(&log));
    h.queue.start();

    let job = h
        .run(text_job(json!({"prompt": "x", "parser": {"name": "yaml"}})))
        .await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("Invalid payload: Unknown parser 'yaml'"));
    assert_eq!(count(&log, "text.generate"), 0);

    h.queue.shutdown().await;
}

#[tokio::test]
async fn missing_prompt_fails_the_job() {
    let log = CallLog::default();
    let h = harness(FakeText::new(&log).loaded(), FakeImage::new(&log));
    h.queue.start();

    let job = h.run(text_job(json!({"params": {}}))).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().starts_with("Invalid payload"));
    assert_eq!(count(&log, "text.generate"), 0);

    h.queue.shutdown().await;
}
