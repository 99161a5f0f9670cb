//! Error taxonomy for the loop.
//!
//! Only two conditions abort the process: a configuration error before any
//! cycle runs, and a corrupt state file on resume. Everything else is
//! absorbed into the cycle record as a [`CycleFault`] and influences only
//! the stop policy's next verdict.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal errors. These propagate out of the orchestrator and cause a
/// nonzero process exit.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("state file at {path} is corrupt: {reason}")]
    StateCorrupt { path: PathBuf, reason: String },
}

/// Non-fatal conditions recorded on a cycle snapshot.
///
/// A cycle may carry several of these (e.g. a training timeout followed by
/// unavailable metrics). None of them terminate the loop directly; the
/// stop policy sees their effects through the metric history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleFault {
    /// A phase subprocess hit the wall-clock limit and was killed.
    ProcessTimeout { phase: String, limit_secs: u64 },
    /// A phase subprocess exited nonzero (or was signalled).
    ProcessFailure {
        phase: String,
        exit_code: Option<i32>,
    },
    /// No target-metric value could be extracted from any source.
    MetricsUnavailable,
    /// An analysis document existed but could not be parsed; a synthesized
    /// default was used instead.
    AnalysisMalformed { reason: String },
    /// No model file was found in any candidate location.
    ArtifactMissing,
}

impl CycleFault {
    /// True for the fault kinds that mean the cycle's subprocess work was
    /// cut short by the per-phase time limit.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CycleFault::ProcessTimeout { .. })
    }
}
