#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use genqueue_api::config::ServerConfig;
use genqueue_api::state::AppState;
use genqueue_comfyui::WorkflowLibrary;
use genqueue_core::backend::{
    ArtifactRef, BackendError, ImageBackend, ImageProgress, PromptStatus, TextBackend,
    TextGeneration,
};
use genqueue_core::parsing::ParserRegistry;
use genqueue_core::payload::InferenceParams;
use genqueue_core::store::InMemoryJobStore;
use genqueue_events::{EventBus, StreamFanOut};
use genqueue_worker::{
    Handlers, ImageGenerationHandler, ImagePipelineConfig, JobQueue, QueueConfig, QueueDeps,
    ResourceArbiter, TextGenerationHandler, WorkflowHandler, WorkflowRegistry,
};

// ---------------------------------------------------------------------------
// Fake backends
// ---------------------------------------------------------------------------

/// Always-loaded text backend that echoes the prompt after `delay`.
pub struct EchoText {
    pub delay: Duration,
}

#[async_trait]
impl TextBackend for EchoText {
    async fn is_loaded(&self) -> bool {
        true
    }

    async fn load(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn unload(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        _params: &InferenceParams,
        on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<TextGeneration, BackendError> {
        tokio::time::sleep(self.delay).await;
        let text = format!("echo: {prompt}");
        on_token(&text);
        Ok(TextGeneration {
            token_count: 2,
            text,
            duration: self.delay,
        })
    }
}

/// Image backend that finishes every prompt immediately.
pub struct InstantImage;

#[async_trait]
impl ImageBackend for InstantImage {
    async fn is_reachable(&self) -> bool {
        true
    }

    async fn submit_workflow(&self, _graph: &Value) -> Result<String, BackendError> {
        Ok("prompt-1".into())
    }

    async fn poll_status(&self, _prompt_id: &str) -> Result<PromptStatus, BackendError> {
        Ok(PromptStatus::Done(vec![ArtifactRef {
            filename: "ComfyUI_00001_.png".into(),
            subfolder: String::new(),
            kind: "output".into(),
        }]))
    }

    async fn fetch_artifact(&self, _artifact: &ArtifactRef) -> Result<Vec<u8>, BackendError> {
        Ok(b"\x89PNG".to_vec())
    }

    async fn free_memory(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn watch_progress(
        &self,
        _prompt_id: &str,
    ) -> Option<tokio::sync::mpsc::Receiver<ImageProgress>> {
        None
    }
}

// ---------------------------------------------------------------------------
// App builder
// ---------------------------------------------------------------------------

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        stream_keepalive_secs: 30,
        stream_queue_capacity: 64,
    }
}

pub struct TestApp {
    pub app: Router,
    pub queue: JobQueue,
    pub events: Arc<EventBus>,
    pub fanout: Arc<StreamFanOut>,
    _artifacts: tempfile::TempDir,
}

/// Full application over fake backends with the lanes running.
pub fn build_test_app() -> TestApp {
    build_test_app_with(test_config(), Duration::ZERO)
}

/// Like [`build_test_app`] with a custom config and text generation delay.
///
/// Uses the same router and middleware stack as the binary.
pub fn build_test_app_with(config: ServerConfig, text_delay: Duration) -> TestApp {
    let artifacts = tempfile::tempdir().unwrap();
    let events = Arc::new(EventBus::with_builtin_schemas());
    let fanout = StreamFanOut::attach(&events, config.stream_queue_capacity);

    let text = Arc::new(EchoText { delay: text_delay });
    let image = Arc::new(InstantImage);
    let image_config = ImagePipelineConfig {
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
        artifact_dir: artifacts.path().to_path_buf(),
        workflow_dir: None,
    };

    let handlers = Handlers {
        text: Arc::new(TextGenerationHandler::new(
            text.clone(),
            ParserRegistry::with_builtins(),
        )),
        image: Arc::new(ImageGenerationHandler::new(
            image.clone(),
            Arc::new(WorkflowLibrary::with_builtin().unwrap()),
            image_config,
        )),
        workflow: Arc::new(WorkflowHandler::new(WorkflowRegistry::with_builtins())),
    };
    let queue = JobQueue::new(
        QueueDeps {
            store: Arc::new(InMemoryJobStore::new()),
            events: events.clone(),
            arbiter: Arc::new(ResourceArbiter::new(text, image, events.clone())),
            handlers,
        },
        QueueConfig {
            poll_interval: Duration::from_millis(20),
            lane_shutdown_timeout: Duration::from_secs(2),
            ..QueueConfig::default()
        },
    )
    .unwrap();
    queue.start();

    let state = AppState {
        config: Arc::new(config),
        queue: queue.clone(),
        fanout: Arc::clone(&fanout),
    };

    TestApp {
        app: genqueue_api::build_app(state).unwrap(),
        queue,
        events,
        fanout,
        _artifacts: artifacts,
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    app.clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn post_json(app: &Router, uri: &str, body: Value) -> Response<Body> {
    app.clone()
        .oneshot(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Submit a job and return its id, asserting a 201.
pub async fn submit(app: &Router, body: Value) -> i64 {
    let response = post_json(app, "/api/v1/jobs", body).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["data"]["job_id"].as_i64().unwrap()
}
