//! Step execution.
//!
//! The runner only needs to know whether a step succeeded. [`StepExecutor`]
//! is that capability; [`ProcessExecutor`] implements it by spawning the
//! step's program and waiting for its exit status.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{StepError, StepResult};
use crate::pipeline::Step;

/// Runs one attempt of a step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run the step to completion. `Ok(())` means the program exited with 0.
    async fn execute(&self, step: &Step) -> StepResult;
}

#[async_trait]
impl<T: StepExecutor + ?Sized> StepExecutor for std::sync::Arc<T> {
    async fn execute(&self, step: &Step) -> StepResult {
        (**self).execute(step).await
    }
}

/// Spawns each step as a child process.
///
/// With an interpreter configured the step program is passed to it as the
/// only argument (`python fetch.py`); otherwise the program is run directly
/// with no arguments. stdout and stderr are inherited and never inspected.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    working_dir: PathBuf,
    interpreter: Option<String>,
}

impl ProcessExecutor {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            interpreter: None,
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            working_dir: config.working_dir.clone(),
            interpreter: config.interpreter.clone(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// The executable that is actually spawned for `step`.
    fn launcher<'a>(&'a self, step: &'a Step) -> &'a str {
        self.interpreter.as_deref().unwrap_or(&step.program)
    }

    fn command(&self, step: &Step) -> Command {
        let mut command = Command::new(self.launcher(step));
        if self.interpreter.is_some() {
            command.arg(&step.program);
        }
        command
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl StepExecutor for ProcessExecutor {
    async fn execute(&self, step: &Step) -> StepResult {
        debug!(
            program = %step.program,
            launcher = self.launcher(step),
            dir = %self.working_dir.display(),
            "spawning step"
        );

        let status = self
            .command(step)
            .status()
            .await
            .map_err(|e| StepError::launch(self.launcher(step), e))?;

        if status.success() {
            return Ok(());
        }

        match status.code() {
            Some(code) => Err(StepError::exit_status(&step.program, code)),
            None => Err(StepError::Signal {
                program: step.program.clone(),
            }),
        }
    }
}
