//! Resumable run state.
//!
//! The state file is the single shared mutable resource of the system:
//! written only by the orchestrator, read by status/report tooling. Writes
//! go through a temp-file-then-rename so a reader never observes a partial
//! document; readers treat a missing file as "no state yet".

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Direction;
use crate::error::{CycleFault, FatalError};

/// Lifecycle status of a run. Terminal states are absorbing and always
/// distinguishable by cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    StoppedSafeguard,
    StoppedPlateau,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Idle | RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::StoppedSafeguard => "stopped_safeguard",
            RunStatus::StoppedPlateau => "stopped_plateau",
            RunStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Metrics extracted for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub cycle: u32,
    /// Name of the target metric this report was parsed for.
    pub metric: String,
    /// Parsed target-metric value; `None` means unavailable (never zero).
    pub value: Option<f64>,
    /// Raw metrics payload as produced by training, for audit.
    pub raw: serde_json::Value,
    /// Optional budget usage reported by the training run.
    pub budget_units: Option<f64>,
    pub train_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: String,
    /// Informational only; never gates continuation.
    pub confidence: String,
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionAction {
    Continue,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleAnalysis {
    pub summary: String,
    pub recommendations: Vec<Recommendation>,
    pub decision: Decision,
}

/// References to what the artifact manager captured for a cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleArtifacts {
    pub snapshot_dir: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
}

/// Phases within a cycle. The derived ordering follows execution order,
/// so a checkpoint at a later phase implies the earlier ones completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Codegen,
    Train,
    Analyze,
}

/// Intra-cycle checkpoint written after each completed phase, so a crash
/// loses at most the in-flight phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCheckpoint {
    pub cycle: u32,
    pub completed: Phase,
    pub at: DateTime<Utc>,
}

/// One completed cycle. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSnapshot {
    pub cycle: u32,
    pub metrics: MetricsReport,
    pub analysis: CycleAnalysis,
    #[serde(default)]
    pub faults: Vec<CycleFault>,
    #[serde(default)]
    pub artifacts: CycleArtifacts,
    /// Wall clock for the whole cycle, all phases included.
    pub wall_seconds: f64,
    pub recorded_at: DateTime<Utc>,
}

/// The resumable record for one run.
///
/// Invariants: `current_cycle` never decreases; `history.len()` equals
/// `current_cycle` after each completed cycle; `best_metric`/`best_cycle`
/// track the strict-improvement winner under the configured direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub current_cycle: u32,
    pub status: RunStatus,
    /// `null` in the JSON when no cycle has produced a metric yet.
    pub best_metric: Option<f64>,
    pub best_cycle: u32,
    pub history: Vec<CycleSnapshot>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phase_checkpoint: Option<PhaseCheckpoint>,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            current_cycle: 0,
            status: RunStatus::Idle,
            best_metric: None,
            best_cycle: 0,
            history: Vec::new(),
            started_at: None,
            updated_at: None,
            phase_checkpoint: None,
        }
    }

    /// Append a completed cycle and update the best-metric bookkeeping.
    /// Strict comparison only: a tie with the current best is not an
    /// improvement.
    pub fn record_cycle(&mut self, snapshot: CycleSnapshot, direction: Direction) {
        debug_assert!(snapshot.cycle > self.current_cycle, "cycles must advance");

        if let Some(value) = snapshot.metrics.value {
            let improved = match self.best_metric {
                None => true,
                Some(best) => direction.improves(value, best),
            };
            if improved {
                self.best_metric = Some(value);
                self.best_cycle = snapshot.cycle;
            }
        }

        self.current_cycle = snapshot.cycle;
        self.phase_checkpoint = None;
        self.history.push(snapshot);
        self.updated_at = Some(Utc::now());
    }

    /// Ordered target-metric history, one entry per cycle, `None` for
    /// cycles whose metric was unavailable.
    pub fn metric_history(&self) -> Vec<Option<f64>> {
        self.history.iter().map(|s| s.metrics.value).collect()
    }

    /// Persist atomically: serialize to a sibling temp file, then rename
    /// over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state directory {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(self).context("failed to serialize state")?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, json.as_bytes())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename {} over {}", tmp.display(), path.display()))?;
        Ok(())
    }

    /// Load the state file. `Ok(None)` when the file does not exist ("no
    /// state yet"); `FatalError::StateCorrupt` when it exists but cannot
    /// be parsed. Callers decide whether corruption is fatal: `resume`
    /// propagates it, a fresh `start` ignores it.
    pub fn load(path: &Path) -> Result<Option<Self>, FatalError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(FatalError::StateCorrupt {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        };
        let state: RunState =
            serde_json::from_str(&contents).map_err(|e| FatalError::StateCorrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(Some(state))
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cycle: u32, value: Option<f64>) -> CycleSnapshot {
        CycleSnapshot {
            cycle,
            metrics: MetricsReport {
                cycle,
                metric: "test_accuracy".to_string(),
                value,
                raw: serde_json::Value::Null,
                budget_units: None,
                train_seconds: 1.0,
            },
            analysis: CycleAnalysis {
                summary: "s".to_string(),
                recommendations: vec![],
                decision: Decision {
                    action: DecisionAction::Continue,
                    rationale: "r".to_string(),
                },
            },
            faults: vec![],
            artifacts: CycleArtifacts::default(),
            wall_seconds: 1.0,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn record_cycle_tracks_strict_best_maximize() {
        let mut state = RunState::new();
        state.record_cycle(snapshot(1, Some(0.80)), Direction::Maximize);
        state.record_cycle(snapshot(2, Some(0.85)), Direction::Maximize);
        state.record_cycle(snapshot(3, Some(0.85)), Direction::Maximize); // tie
        state.record_cycle(snapshot(4, Some(0.84)), Direction::Maximize);

        assert_eq!(state.current_cycle, 4);
        assert_eq!(state.history.len(), 4);
        assert_eq!(state.best_metric, Some(0.85));
        assert_eq!(state.best_cycle, 2, "tie must not steal best_cycle");
    }

    #[test]
    fn record_cycle_tracks_best_minimize() {
        let mut state = RunState::new();
        state.record_cycle(snapshot(1, Some(0.5)), Direction::Minimize);
        state.record_cycle(snapshot(2, Some(0.3)), Direction::Minimize);
        state.record_cycle(snapshot(3, Some(0.4)), Direction::Minimize);
        assert_eq!(state.best_metric, Some(0.3));
        assert_eq!(state.best_cycle, 2);
    }

    #[test]
    fn unavailable_metric_never_becomes_best() {
        let mut state = RunState::new();
        state.record_cycle(snapshot(1, None), Direction::Maximize);
        assert_eq!(state.best_metric, None);
        assert_eq!(state.best_cycle, 0);
        assert_eq!(state.metric_history(), vec![None]);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state/loop_state.json");

        let mut state = RunState::new();
        state.status = RunStatus::Running;
        state.record_cycle(snapshot(1, Some(0.9)), Direction::Maximize);
        state.save(&path).unwrap();

        let loaded = RunState::load(&path).unwrap().expect("state should exist");
        assert_eq!(loaded.run_id, state.run_id);
        assert_eq!(loaded.current_cycle, 1);
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.best_metric, Some(0.9));

        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn absent_best_metric_serializes_as_null() {
        let state = RunState::new();
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("best_metric").unwrap().is_null());
    }

    #[test]
    fn load_missing_file_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded = RunState::load(&tmp.path().join("nope.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn load_corrupt_file_is_state_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("loop_state.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = RunState::load(&path).unwrap_err();
        assert!(matches!(err, FatalError::StateCorrupt { .. }));
    }

    #[test]
    fn status_display_is_stable() {
        assert_eq!(RunStatus::StoppedSafeguard.to_string(), "stopped_safeguard");
        assert_eq!(RunStatus::StoppedPlateau.to_string(), "stopped_plateau");
        assert!(RunStatus::Completed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
