//! pipeline-runner - keep a fetch, process and convert pipeline alive
//!
//! The runner invokes three external programs in a fixed order, retries each
//! one a bounded number of times, and starts over after a cooldown. Nothing
//! short of a signal stops it.

pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod pipeline;
pub mod runner;

pub use clock::{Sleeper, TokioSleeper};
pub use config::{ConfigError, ConfigOverrides, PipelineConfig, PipelineSettings, RetryPolicy};
pub use error::{CycleError, FailureKind, StepError, StepResult};
pub use executor::{ProcessExecutor, StepExecutor};
pub use pipeline::{Pipeline, Step, StepKind};
pub use runner::{LoopState, Runner};
