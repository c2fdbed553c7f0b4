#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use genqueue_comfyui::WorkflowLibrary;
use genqueue_core::backend::{
    ArtifactRef, BackendError, ImageBackend, ImageProgress, PromptStatus, TextBackend,
    TextGeneration,
};
use genqueue_core::job::{Job, NewJob};
use genqueue_core::parsing::{OutputParser, ParseError, ParserRegistry};
use genqueue_core::payload::InferenceParams;
use genqueue_core::store::InMemoryJobStore;
use genqueue_core::types::JobId;
use genqueue_events::event::builtin_schemas;
use genqueue_events::EventBus;
use genqueue_worker::{
    Handlers, ImageGenerationHandler, ImagePipelineConfig, JobQueue, QueueConfig, QueueDeps,
    ResourceArbiter, TextGenerationHandler, WorkflowHandler, WorkflowRegistry,
};

/// Shared, ordered log of backend calls across both fakes.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn position(log: &CallLog, call: &str) -> Option<usize> {
    log.lock().unwrap().iter().position(|c| c == call)
}

pub fn count(log: &CallLog, call: &str) -> usize {
    log.lock().unwrap().iter().filter(|c| *c == call).count()
}

// ---------------------------------------------------------------------------
// Fake text backend
// ---------------------------------------------------------------------------

/// Scripted text backend.
///
/// Returns scripted responses in order, then repeats the last one. A prompt
/// containing `PANIC` panics inside the call.
pub struct FakeText {
    loaded: AtomicBool,
    responses: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    fail: Option<BackendError>,
    fail_load: bool,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    log: CallLog,
}

impl FakeText {
    pub fn new(log: &CallLog) -> Self {
        Self {
            loaded: AtomicBool::new(false),
            responses: Mutex::new(VecDeque::new()),
            last: Mutex::new("generated text".to_string()),
            fail: None,
            fail_load: false,
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            log: Arc::clone(log),
        }
    }

    pub fn loaded(self) -> Self {
        self.loaded.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_responses<I, S>(self, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.responses.lock().unwrap() = responses.into_iter().map(Into::into).collect();
        self
    }

    pub fn failing(mut self, err: BackendError) -> Self {
        self.fail = Some(err);
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn is_resident(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: &str) {
        self.log.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl TextBackend for FakeText {
    async fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn load(&self) -> Result<(), BackendError> {
        self.record("text.load");
        if self.fail_load {
            return Err(BackendError::Unreachable("connection refused".into()));
        }
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unload(&self) -> Result<(), BackendError> {
        self.record("text.unload");
        self.loaded.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        _params: &InferenceParams,
        on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<TextGeneration, BackendError> {
        self.record("text.generate");
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if prompt.contains("PANIC") {
            panic!("backend exploded");
        }
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }

        let text = {
            let next = self.responses.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            if let Some(next) = next {
                *last = next;
            }
            last.clone()
        };
        for piece in text.split_inclusive(' ') {
            on_token(piece);
        }
        Ok(TextGeneration {
            token_count: text.split_whitespace().count() as u32,
            text,
            duration: Duration::from_millis(5),
        })
    }
}

// ---------------------------------------------------------------------------
// Fake image backend
// ---------------------------------------------------------------------------

pub fn sample_artifact() -> ArtifactRef {
    ArtifactRef {
        filename: "ComfyUI_00001_.png".into(),
        subfolder: String::new(),
        kind: "output".into(),
    }
}

/// Scripted image backend.
///
/// `poll_status` walks the script, then keeps returning the final status.
pub struct FakeImage {
    reachable: bool,
    script: Mutex<VecDeque<PromptStatus>>,
    final_status: PromptStatus,
    progress: Vec<ImageProgress>,
    watch_delay: Option<Duration>,
    submitted: Mutex<Vec<Value>>,
    log: CallLog,
}

impl FakeImage {
    pub fn new(log: &CallLog) -> Self {
        Self {
            reachable: true,
            script: Mutex::new(VecDeque::from([PromptStatus::Pending, PromptStatus::Running])),
            final_status: PromptStatus::Done(vec![sample_artifact()]),
            progress: Vec::new(),
            watch_delay: None,
            submitted: Mutex::new(Vec::new()),
            log: Arc::clone(log),
        }
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn ending_with(mut self, status: PromptStatus) -> Self {
        self.final_status = status;
        self
    }

    pub fn with_progress(mut self, steps: &[(u32, u32)]) -> Self {
        self.progress = steps
            .iter()
            .map(|&(value, max)| ImageProgress { value, max })
            .collect();
        self
    }

    /// `watch_progress` hangs for `delay` before giving up.
    pub fn with_slow_watch(mut self, delay: Duration) -> Self {
        self.watch_delay = Some(delay);
        self
    }

    pub fn submitted(&self) -> Vec<Value> {
        self.submitted.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.log.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl ImageBackend for FakeImage {
    async fn is_reachable(&self) -> bool {
        self.reachable
    }

    async fn submit_workflow(&self, graph: &Value) -> Result<String, BackendError> {
        self.record("image.submit");
        self.submitted.lock().unwrap().push(graph.clone());
        Ok(format!("prompt-{}", self.submitted.lock().unwrap().len()))
    }

    async fn poll_status(&self, _prompt_id: &str) -> Result<PromptStatus, BackendError> {
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.final_status.clone()))
    }

    async fn fetch_artifact(&self, _artifact: &ArtifactRef) -> Result<Vec<u8>, BackendError> {
        self.record("image.fetch");
        Ok(b"\x89PNG fake".to_vec())
    }

    async fn free_memory(&self) -> Result<(), BackendError> {
        self.record("image.free");
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        self.record("image.interrupt");
        Ok(())
    }

    async fn watch_progress(
        &self,
        _prompt_id: &str,
    ) -> Option<tokio::sync::mpsc::Receiver<ImageProgress>> {
        if let Some(delay) = self.watch_delay {
            tokio::time::sleep(delay).await;
            return None;
        }
        if self.progress.is_empty() {
            return None;
        }
        let (tx, rx) = tokio::sync::mpsc::channel(self.progress.len());
        for step in &self.progress {
            let _ = tx.try_send(*step);
        }
        Some(rx)
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// Rejects every input.
pub struct AlwaysReject;

impl OutputParser for AlwaysReject {
    fn parse(&self, _raw: &str) -> Result<Value, ParseError> {
        Err(ParseError::Rejected("never good enough".into()))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub queue: JobQueue,
    pub store: Arc<InMemoryJobStore>,
    pub events: Arc<EventBus>,
    pub text: Arc<FakeText>,
    pub image: Arc<FakeImage>,
    pub recorded: Arc<Mutex<Vec<(String, Map<String, Value>)>>>,
    pub artifact_dir: tempfile::TempDir,
}

pub fn test_queue_config() -> QueueConfig {
    QueueConfig {
        poll_interval: Duration::from_millis(20),
        lane_shutdown_timeout: Duration::from_secs(2),
        ..QueueConfig::default()
    }
}

/// Build a queue over the given fakes. Lanes are not started.
pub fn harness(text: FakeText, image: FakeImage) -> Harness {
    harness_with_config(text, image, test_queue_config())
}

pub fn harness_with_config(text: FakeText, image: FakeImage, config: QueueConfig) -> Harness {
    let artifact_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryJobStore::new());
    let events = Arc::new(EventBus::with_builtin_schemas());
    let text = Arc::new(text);
    let image = Arc::new(image);

    let recorded = Arc::new(Mutex::new(Vec::new()));
    for schema in builtin_schemas() {
        let recorded = Arc::clone(&recorded);
        events.subscribe(&schema.event_name, move |event| {
            recorded
                .lock()
                .unwrap()
                .push((event.name.clone(), event.data.clone()));
            Ok(())
        });
    }

    let mut parsers = ParserRegistry::with_builtins();
    parsers.register("reject", Arc::new(AlwaysReject));

    let image_config = ImagePipelineConfig {
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_millis(500),
        artifact_dir: artifact_dir.path().to_path_buf(),
        workflow_dir: None,
    };

    let handlers = Handlers {
        text: Arc::new(TextGenerationHandler::new(text.clone(), parsers)),
        image: Arc::new(ImageGenerationHandler::new(
            image.clone(),
            Arc::new(WorkflowLibrary::with_builtin().unwrap()),
            image_config,
        )),
        workflow: Arc::new(WorkflowHandler::new(WorkflowRegistry::with_builtins())),
    };
    let arbiter = Arc::new(ResourceArbiter::new(
        text.clone(),
        image.clone(),
        events.clone(),
    ));

    let queue = JobQueue::new(
        QueueDeps {
            store: store.clone(),
            events: events.clone(),
            arbiter,
            handlers,
        },
        config,
    )
    .unwrap();

    Harness {
        queue,
        store,
        events,
        text,
        image,
        recorded,
        artifact_dir,
    }
}

impl Harness {
    pub async fn run(&self, new: NewJob) -> Job {
        self.queue
            .submit_and_wait(new, Some(Duration::from_secs(10)))
            .await
            .unwrap()
    }

    /// Names of recorded events, optionally only those about `job_id`.
    pub fn event_names(&self, job_id: Option<JobId>) -> Vec<String> {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, data)| job_id.map_or(true, |id| data.get("job_id") == Some(&Value::from(id))))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn events_named(&self, name: &str) -> Vec<Map<String, Value>> {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, data)| data.clone())
            .collect()
    }
}
