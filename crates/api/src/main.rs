use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genqueue_api::config::ServerConfig;
use genqueue_api::state::AppState;
use genqueue_comfyui::{ComfyUIBackend, ComfyUIConfig, WorkflowLibrary};
use genqueue_core::parsing::ParserRegistry;
use genqueue_core::store::InMemoryJobStore;
use genqueue_events::{EventBus, StreamFanOut};
use genqueue_llm::{GuardedTextBackend, OllamaBackend, OllamaConfig};
use genqueue_worker::{
    Handlers, ImageGenerationHandler, ImagePipelineConfig, JobQueue, QueueConfig, QueueDeps,
    ResourceArbiter, TextGenerationHandler, WorkflowHandler, WorkflowRegistry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "genqueue_api=debug,genqueue_worker=debug,tower_http=debug".into()
    });
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env().context("Invalid server configuration")?;
    let queue_config = QueueConfig::from_env().context("Invalid queue configuration")?;
    let image_config = ImagePipelineConfig::from_env().context("Invalid image configuration")?;
    let ollama_config = OllamaConfig::from_env().context("Invalid Ollama configuration")?;
    let comfyui_config = ComfyUIConfig::from_env().context("Invalid ComfyUI configuration")?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Backends ---
    let text = Arc::new(GuardedTextBackend::new(
        OllamaBackend::new(ollama_config).context("Failed to build Ollama client")?,
    ));
    let image = Arc::new(
        ComfyUIBackend::new(&comfyui_config).context("Failed to build ComfyUI client")?,
    );

    let mut workflows =
        WorkflowLibrary::with_builtin().context("Built-in workflow template is invalid")?;
    if let Some(dir) = &image_config.workflow_dir {
        let loaded = workflows
            .load_dir(dir)
            .with_context(|| format!("Failed to load workflow templates from {}", dir.display()))?;
        tracing::info!(loaded, dir = %dir.display(), "Loaded workflow templates");
    }

    // --- Event bus and stream fan-out ---
    let events = Arc::new(EventBus::with_builtin_schemas());
    let fanout = StreamFanOut::attach(&events, config.stream_queue_capacity);

    // --- Job queue ---
    let handlers = Handlers {
        text: Arc::new(TextGenerationHandler::new(
            text.clone(),
            ParserRegistry::with_builtins(),
        )),
        image: Arc::new(ImageGenerationHandler::new(
            image.clone(),
            Arc::new(workflows),
            image_config,
        )),
        workflow: Arc::new(WorkflowHandler::new(WorkflowRegistry::with_builtins())),
    };
    let arbiter = Arc::new(ResourceArbiter::new(text, image, events.clone()));
    let queue = JobQueue::new(
        QueueDeps {
            store: Arc::new(InMemoryJobStore::new()),
            events,
            arbiter,
            handlers,
        },
        queue_config,
    )
    .context("Invalid lane configuration")?;
    queue.start();
    tracing::info!("Job queue started");

    // --- App state and router ---
    let state = AppState {
        config: Arc::new(config.clone()),
        queue: queue.clone(),
        fanout: Arc::clone(&fanout),
    };
    let app = genqueue_api::build_app(state).context("Failed to build router")?;

    // --- Start server ---
    let host = config
        .host
        .parse::<std::net::IpAddr>()
        .with_context(|| format!("Invalid HOST address '{}'", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    if tokio::time::timeout(config.shutdown_timeout(), queue.shutdown())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = config.shutdown_timeout_secs,
            "Job queue did not stop within the shutdown timeout"
        );
    } else {
        tracing::info!("Job queue shut down");
    }

    tracing::info!(
        connections = fanout.connection_count(),
        "Closing remaining event stream connections"
    );
    fanout.shutdown_all();

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
