//! Failure classification for step errors.
//!
//! Every step failure falls into one of a few categories that decide how
//! the runner reacts: retry it, stop retrying it early, or hand it straight
//! to the outer loop.

use std::fmt;
use std::io;

/// The category of a failed step attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The program ran and reported failure (non-zero exit or signal).
    Runtime,
    /// The program or its interpreter could not be found.
    Missing,
    /// The program exists but could not be started (permissions, resources).
    Launch,
    /// Anything a step executor reports that is not a process outcome.
    Unexpected,
}

impl FailureKind {
    /// Classify an I/O error returned while spawning a process.
    pub fn from_spawn_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => FailureKind::Missing,
            _ => FailureKind::Launch,
        }
    }

    /// Returns true if the retry policy applies to this kind at all.
    ///
    /// Unexpected failures skip the per-step retries and go straight to the
    /// outer loop's recovery delay.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Unexpected)
    }

    /// Returns true if the process never started.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, FailureKind::Missing | FailureKind::Launch)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Runtime => "runtime",
            FailureKind::Missing => "missing",
            FailureKind::Launch => "launch",
            FailureKind::Unexpected => "unexpected",
        };
        f.write_str(label)
    }
}
