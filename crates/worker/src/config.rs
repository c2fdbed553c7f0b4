use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use genqueue_core::env;
use genqueue_core::error::CoreError;
use genqueue_core::job::JobKind;

/// One single-worker processing line and the job kinds it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneConfig {
    pub name: String,
    pub kinds: Vec<JobKind>,
}

impl LaneConfig {
    pub fn new(name: impl Into<String>, kinds: impl IntoIterator<Item = JobKind>) -> Self {
        Self {
            name: name.into(),
            kinds: kinds.into_iter().collect(),
        }
    }
}

/// Check that every kind is served by exactly one lane and that workflow
/// jobs have a lane to themselves.
///
/// Workflows wait on child generation jobs, so sharing a lane with them
/// would deadlock.
pub fn validate_lanes(lanes: &[LaneConfig]) -> Result<(), CoreError> {
    let mut owners: HashMap<JobKind, &str> = HashMap::new();
    for lane in lanes {
        if lane.kinds.is_empty() {
            return Err(CoreError::Validation(format!(
                "Lane '{}' serves no job kinds",
                lane.name
            )));
        }
        for kind in &lane.kinds {
            if let Some(other) = owners.insert(*kind, &lane.name) {
                return Err(CoreError::Validation(format!(
                    "Job kind {kind} is served by both '{other}' and '{}'",
                    lane.name
                )));
            }
        }
        if lane.kinds.contains(&JobKind::Workflow) && lane.kinds.len() > 1 {
            return Err(CoreError::Validation(format!(
                "Lane '{}' mixes workflow jobs with generation jobs",
                lane.name
            )));
        }
    }
    for kind in JobKind::ALL {
        if !owners.contains_key(&kind) {
            return Err(CoreError::Validation(format!(
                "No lane serves job kind {kind}"
            )));
        }
    }
    Ok(())
}

/// Job queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long an idle lane waits on its queue before rechecking for shutdown.
    pub poll_interval: Duration,
    /// How long shutdown waits for each lane task to exit.
    pub lane_shutdown_timeout: Duration,
    pub text_max_attempts: u32,
    pub image_max_attempts: u32,
    /// Run image jobs on their own lane instead of sharing the text lane.
    pub separate_image_lane: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            lane_shutdown_timeout: Duration::from_secs(5),
            text_max_attempts: JobKind::TextGeneration.default_max_attempts(),
            image_max_attempts: JobKind::ImageGeneration.default_max_attempts(),
            separate_image_lane: false,
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default |
    /// |------------------------------|---------|
    /// | `QUEUE_POLL_INTERVAL_MS`     | `1000`  |
    /// | `LANE_SHUTDOWN_TIMEOUT_SECS` | `5`     |
    /// | `TEXT_MAX_ATTEMPTS`          | `3`     |
    /// | `IMAGE_MAX_ATTEMPTS`         | `1`     |
    /// | `SEPARATE_IMAGE_LANE`        | `false` |
    pub fn from_env() -> Result<Self, CoreError> {
        let defaults = Self::default();
        let poll_ms: u64 = env::parse_or("QUEUE_POLL_INTERVAL_MS", 1000)?;
        let shutdown_secs: u64 = env::parse_or("LANE_SHUTDOWN_TIMEOUT_SECS", 5)?;
        let text_max_attempts = env::parse_or("TEXT_MAX_ATTEMPTS", defaults.text_max_attempts)?;
        let image_max_attempts = env::parse_or("IMAGE_MAX_ATTEMPTS", defaults.image_max_attempts)?;
        let separate_image_lane = env::parse_or("SEPARATE_IMAGE_LANE", false)?;

        if poll_ms == 0 {
            return Err(CoreError::Validation(
                "QUEUE_POLL_INTERVAL_MS must be positive".into(),
            ));
        }
        if text_max_attempts == 0 || image_max_attempts == 0 {
            return Err(CoreError::Validation(
                "TEXT_MAX_ATTEMPTS and IMAGE_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }

        Ok(Self {
            poll_interval: Duration::from_millis(poll_ms),
            lane_shutdown_timeout: Duration::from_secs(shutdown_secs),
            text_max_attempts,
            image_max_attempts,
            separate_image_lane,
        })
    }

    /// Attempt budget for jobs submitted without one.
    pub fn max_attempts_for(&self, kind: JobKind) -> u32 {
        match kind {
            JobKind::TextGeneration => self.text_max_attempts,
            JobKind::ImageGeneration => self.image_max_attempts,
            JobKind::Workflow => kind.default_max_attempts(),
        }
    }

    /// Lane topology.
    ///
    /// Text and image jobs share the `generation` lane unless
    /// `separate_image_lane` is set; workflows always get their own lane.
    pub fn lanes(&self) -> Vec<LaneConfig> {
        let mut lanes = if self.separate_image_lane {
            vec![
                LaneConfig::new("text", [JobKind::TextGeneration]),
                LaneConfig::new("image", [JobKind::ImageGeneration]),
            ]
        } else {
            vec![LaneConfig::new(
                "generation",
                [JobKind::TextGeneration, JobKind::ImageGeneration],
            )]
        };
        lanes.push(LaneConfig::new("workflow", [JobKind::Workflow]));
        lanes
    }
}

/// Image pipeline configuration.
#[derive(Debug, Clone)]
pub struct ImagePipelineConfig {
    /// Delay between status polls of a submitted workflow.
    pub poll_interval: Duration,
    /// Give up on a submitted workflow after this long.
    pub timeout: Duration,
    /// Root directory for downloaded artifacts.
    pub artifact_dir: PathBuf,
    /// Extra workflow templates loaded at startup.
    pub workflow_dir: Option<PathBuf>,
}

impl Default for ImagePipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            timeout: Duration::from_secs(300),
            artifact_dir: PathBuf::from("./artifacts"),
            workflow_dir: None,
        }
    }
}

impl ImagePipelineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default       |
    /// |--------------------------|---------------|
    /// | `IMAGE_POLL_INTERVAL_MS` | `1000`        |
    /// | `IMAGE_TIMEOUT_SECS`     | `300`         |
    /// | `ARTIFACT_DIR`           | `./artifacts` |
    /// | `WORKFLOW_DIR`           | unset         |
    pub fn from_env() -> Result<Self, CoreError> {
        let poll_ms: u64 = env::parse_or("IMAGE_POLL_INTERVAL_MS", 1000)?;
        let timeout_secs: u64 = env::parse_or("IMAGE_TIMEOUT_SECS", 300)?;
        let artifact_dir = PathBuf::from(env::string_or("ARTIFACT_DIR", "./artifacts"));
        let workflow_dir = std::env::var("WORKFLOW_DIR")
            .ok()
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            poll_interval: Duration::from_millis(poll_ms.max(1)),
            timeout: Duration::from_secs(timeout_secs),
            artifact_dir,
            workflow_dir,
        })
    }
}
