//! Error types for step execution and pipeline cycles.
//!
//! A single attempt fails with a [`StepError`]. Once a step runs out of
//! attempts the runner wraps the last attempt's error in
//! [`StepError::Exhausted`], and the cycle reports it as a [`CycleError`].

pub mod classification;

use std::io;
use thiserror::Error;

use crate::pipeline::StepKind;

pub use classification::FailureKind;

/// Result type for a single step.
pub type StepResult<T = ()> = Result<T, StepError>;

/// Errors produced while running a step.
#[derive(Debug, Error)]
pub enum StepError {
    /// The process could not be started.
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The process ran and exited with a non-zero status.
    #[error("{program} exited with status {code}")]
    ExitStatus { program: String, code: i32 },

    /// The process was killed by a signal before exiting.
    #[error("{program} was terminated by a signal")]
    Signal { program: String },

    /// A failure that is not a process outcome.
    #[error("unexpected failure: {0}")]
    Unexpected(String),

    /// Every allowed attempt failed.
    #[error("{step} failed after {attempts} attempt(s): {last}")]
    Exhausted {
        step: StepKind,
        attempts: u32,
        last: Box<StepError>,
    },
}

impl StepError {
    pub fn launch(program: impl Into<String>, source: io::Error) -> Self {
        Self::Launch {
            program: program.into(),
            source,
        }
    }

    pub fn exit_status(program: impl Into<String>, code: i32) -> Self {
        Self::ExitStatus {
            program: program.into(),
            code,
        }
    }

    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Classify the error. An exhausted step takes the kind of its last attempt.
    pub fn kind(&self) -> FailureKind {
        match self {
            StepError::Launch { source, .. } => FailureKind::from_spawn_error(source),
            StepError::ExitStatus { .. } | StepError::Signal { .. } => FailureKind::Runtime,
            StepError::Unexpected(_) => FailureKind::Unexpected,
            StepError::Exhausted { last, .. } => last.kind(),
        }
    }

    /// Returns true if the step ran out of attempts.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, StepError::Exhausted { .. })
    }
}

/// Errors that abort a pipeline cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    /// A step could not be completed; later steps were not started.
    #[error("step {step} aborted the cycle: {source}")]
    Step {
        step: StepKind,
        #[source]
        source: StepError,
    },
}

impl CycleError {
    pub fn step(&self) -> StepKind {
        match self {
            CycleError::Step { step, .. } => *step,
        }
    }
}
