//! Runner configuration.
//!
//! Settings come from an optional TOML file, then `PIPELINE__*` environment
//! variables, then command line overrides. The result is validated into an
//! immutable [`PipelineConfig`] that the runner receives at construction.

use config::{Config, Environment, File, Map};
use serde::{Deserialize, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::error::FailureKind;
use crate::pipeline::{Pipeline, StepKind};

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "pipeline.toml";

/// Prefix for environment overrides, e.g. `PIPELINE__RETRY__MAX_ATTEMPTS=5`.
pub const ENV_PREFIX: &str = "PIPELINE";

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested configuration file does not exist.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// The configuration sources could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The configuration parsed but holds unusable values.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Retry section as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub delay_secs: u64,
    pub fail_fast_on_missing: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_secs: 60,
            fail_fast_on_missing: false,
        }
    }
}

/// Delay section as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelaySettings {
    pub between_steps_secs: u64,
    pub cycle_cooldown_secs: u64,
    pub recovery_secs: u64,
}

impl Default for DelaySettings {
    fn default() -> Self {
        Self {
            between_steps_secs: 60,
            cycle_cooldown_secs: 6 * 60 * 60,
            recovery_secs: 5 * 60,
        }
    }
}

/// Program run by each step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSettings {
    pub fetch: String,
    pub process: String,
    pub convert: String,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            fetch: StepKind::Fetch.default_program().to_string(),
            process: StepKind::Process.default_program().to_string(),
            convert: StepKind::Convert.default_program().to_string(),
        }
    }
}

/// Raw, file-shaped settings before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Directory the step programs run in
    pub working_dir: PathBuf,
    /// Interpreter that runs each step program; empty runs programs directly
    pub interpreter: String,
    pub retry: RetrySettings,
    pub delays: DelaySettings,
    pub steps: StepSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            interpreter: "python".to_string(),
            retry: RetrySettings::default(),
            delays: DelaySettings::default(),
            steps: StepSettings::default(),
        }
    }
}

/// Values given on the command line; they win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub retry_count: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub wait_between_steps_secs: Option<u64>,
}

impl ConfigOverrides {
    pub fn apply(&self, settings: &mut PipelineSettings) {
        if let Some(count) = self.retry_count {
            settings.retry.max_attempts = count;
        }
        if let Some(delay) = self.retry_delay_secs {
            settings.retry.delay_secs = delay;
        }
        if let Some(wait) = self.wait_between_steps_secs {
            settings.delays.between_steps_secs = wait;
        }
    }
}

impl PipelineSettings {
    /// Load settings for a runner rooted at `dir`.
    ///
    /// When `path` is `None`, `dir/pipeline.toml` is used if it exists and
    /// defaults apply otherwise. An explicit `path` must exist.
    ///
    /// # Environment Variable Overrides
    ///
    /// `PIPELINE__<SECTION>__<KEY>` overrides a file value, for example
    /// `PIPELINE__DELAYS__RECOVERY_SECS=30`.
    pub fn load(path: Option<&Path>, dir: &Path) -> Result<Self, ConfigError> {
        Self::load_from_sources(path, dir, None)
    }

    /// Same as [`load`](Self::load) but reads environment overrides from
    /// `env` instead of the process environment when given.
    pub fn load_from_sources(
        path: Option<&Path>,
        dir: &Path,
        env: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::FileNotFound(path.display().to_string()));
                }
                File::from(path)
            }
            None => File::from(dir.join(DEFAULT_CONFIG_FILE)).required(false),
        };

        let config = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let mut settings: PipelineSettings = config.try_deserialize()?;
        if settings.working_dir.is_relative() {
            settings.working_dir = dir.join(&settings.working_dir);
        }

        Ok(settings)
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_secs())
}

/// How a step is retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Total attempts per step, including the first. Always at least 1.
    pub max_attempts: u32,
    /// Wait between two attempts of the same step
    #[serde(rename = "delay_secs", serialize_with = "serialize_secs")]
    pub delay: Duration,
    /// Stop retrying a step whose program cannot be found
    pub fail_fast_on_missing: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let settings = RetrySettings::default();
        Self {
            max_attempts: settings.max_attempts,
            delay: Duration::from_secs(settings.delay_secs),
            fail_fast_on_missing: settings.fail_fast_on_missing,
        }
    }
}

impl RetryPolicy {
    /// Decide whether a step gets another attempt after attempt number
    /// `attempt` (1-based) failed with `kind`.
    pub fn should_retry(&self, attempt: u32, kind: FailureKind) -> bool {
        if !kind.is_retryable() {
            return false;
        }
        if self.fail_fast_on_missing && kind == FailureKind::Missing {
            return false;
        }
        attempt < self.max_attempts
    }
}

/// Fixed pauses around steps and cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delays {
    /// Pause between two steps of the same cycle
    #[serde(rename = "between_steps_secs", serialize_with = "serialize_secs")]
    pub between_steps: Duration,
    /// Pause after a successful cycle
    #[serde(rename = "cycle_cooldown_secs", serialize_with = "serialize_secs")]
    pub cycle_cooldown: Duration,
    /// Pause after a failed cycle
    #[serde(rename = "recovery_secs", serialize_with = "serialize_secs")]
    pub recovery: Duration,
}

impl Default for Delays {
    fn default() -> Self {
        let settings = DelaySettings::default();
        Self {
            between_steps: Duration::from_secs(settings.between_steps_secs),
            cycle_cooldown: Duration::from_secs(settings.cycle_cooldown_secs),
            recovery: Duration::from_secs(settings.recovery_secs),
        }
    }
}

/// Validated runner configuration.
///
/// Serializes with the same section names as the config file, delays in
/// whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineConfig {
    pub working_dir: PathBuf,
    pub interpreter: Option<String>,
    pub retry: RetryPolicy,
    pub delays: Delays,
    #[serde(flatten)]
    pub pipeline: Pipeline,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            interpreter: Some("python".to_string()),
            retry: RetryPolicy::default(),
            delays: Delays::default(),
            pipeline: Pipeline::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempt limit and the wait between attempts.
    pub fn with_retry(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.retry.max_attempts = max_attempts;
        self.retry.delay = delay;
        self
    }

    pub fn with_fail_fast_on_missing(mut self, enabled: bool) -> Self {
        self.retry.fail_fast_on_missing = enabled;
        self
    }

    pub fn with_between_steps(mut self, delay: Duration) -> Self {
        self.delays.between_steps = delay;
        self
    }

    pub fn with_cycle_cooldown(mut self, delay: Duration) -> Self {
        self.delays.cycle_cooldown = delay;
        self
    }

    pub fn with_recovery_delay(mut self, delay: Duration) -> Self {
        self.delays.recovery = delay;
        self
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_interpreter(mut self, interpreter: Option<String>) -> Self {
        self.interpreter = interpreter;
        self
    }

    /// Check the invariants the runner relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        for step in self.pipeline.steps() {
            if step.program.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "steps.{} must name a program",
                    step.name()
                )));
            }
        }
        if matches!(self.interpreter.as_deref(), Some(i) if i.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "interpreter must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

impl TryFrom<PipelineSettings> for PipelineConfig {
    type Error = ConfigError;

    fn try_from(settings: PipelineSettings) -> Result<Self, Self::Error> {
        let interpreter = match settings.interpreter.trim() {
            "" => None,
            other => Some(other.to_string()),
        };

        let config = PipelineConfig {
            working_dir: settings.working_dir,
            interpreter,
            retry: RetryPolicy {
                max_attempts: settings.retry.max_attempts,
                delay: Duration::from_secs(settings.retry.delay_secs),
                fail_fast_on_missing: settings.retry.fail_fast_on_missing,
            },
            delays: Delays {
                between_steps: Duration::from_secs(settings.delays.between_steps_secs),
                cycle_cooldown: Duration::from_secs(settings.delays.cycle_cooldown_secs),
                recovery: Duration::from_secs(settings.delays.recovery_secs),
            },
            pipeline: Pipeline::new(
                settings.steps.fetch,
                settings.steps.process,
                settings.steps.convert,
            ),
        };

        config.validate()?;
        Ok(config)
    }
}
