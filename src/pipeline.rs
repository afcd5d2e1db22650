//! Pipeline step definitions.
//!
//! A pipeline is always the same three steps in the same order:
//! fetch highlights, process one video, then hand the result to the
//! media converter. Only the program each step runs is configurable.

use serde::Serialize;
use std::fmt;

/// Identity of a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Fetch new highlights
    Fetch,
    /// Process a single video
    Process,
    /// Submit the processed media for conversion
    Convert,
}

impl StepKind {
    /// All steps in execution order.
    pub const ORDER: [StepKind; 3] = [StepKind::Fetch, StepKind::Process, StepKind::Convert];

    /// Short name used in logs and config keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Fetch => "fetch",
            StepKind::Process => "process",
            StepKind::Convert => "convert",
        }
    }

    /// Script run for this step when the config does not override it.
    pub fn default_program(&self) -> &'static str {
        match self {
            StepKind::Fetch => "fetch.py",
            StepKind::Process => "process_one_video.py",
            StepKind::Convert => "mediaconvert_process.py",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step bound to the program it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub kind: StepKind,
    /// Program (or script, when an interpreter is configured) to execute
    pub program: String,
}

impl Step {
    pub fn new(kind: StepKind, program: impl Into<String>) -> Self {
        Self {
            kind,
            program: program.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.program)
    }
}

/// The ordered fetch → process → convert sequence.
///
/// The order is fixed by construction; there is no way to build a pipeline
/// with steps missing, duplicated or reordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pipeline {
    steps: [Step; 3],
}

impl Pipeline {
    /// Build a pipeline from the program each step should run.
    pub fn new(
        fetch: impl Into<String>,
        process: impl Into<String>,
        convert: impl Into<String>,
    ) -> Self {
        Self {
            steps: [
                Step::new(StepKind::Fetch, fetch),
                Step::new(StepKind::Process, process),
                Step::new(StepKind::Convert, convert),
            ],
        }
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Look up the step for a given kind.
    pub fn step(&self, kind: StepKind) -> &Step {
        match kind {
            StepKind::Fetch => &self.steps[0],
            StepKind::Process => &self.steps[1],
            StepKind::Convert => &self.steps[2],
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(
            StepKind::Fetch.default_program(),
            StepKind::Process.default_program(),
            StepKind::Convert.default_program(),
        )
    }
}
