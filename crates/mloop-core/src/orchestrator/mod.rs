//! Cycle sequencing.
//!
//! The orchestrator owns the state machine: it runs codegen, training,
//! and analysis in order, records one immutable snapshot per cycle, and
//! asks the stop policy for a verdict after every cycle. It is the only
//! writer of the state file. Cancellation between or during phases
//! leaves the run in `Running`, so `resume` picks up at the next cycle;
//! completed cycles are never replayed.

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{CodeAgent, CommandAgent};
use crate::artifacts::{self, BestModelIndex, FingerprintManifest, MANIFEST_FILE};
use crate::config::{split_command, LoopConfig, ResolvedPaths, TargetMetric};
use crate::error::CycleFault;
use crate::phases::{analysis, training};
use crate::runner::{self, CommandSpec, ExitKind, Observe};
use crate::state::{
    CycleArtifacts, CycleSnapshot, DecisionAction, MetricsReport, Phase, PhaseCheckpoint,
    RunState, RunStatus,
};
use crate::stopping::{self, PolicyInputs, Verdict};

pub const METRICS_FILE: &str = "metrics.json";

pub struct Orchestrator {
    config: LoopConfig,
    paths: ResolvedPaths,
    codegen: Option<Box<dyn CodeAgent>>,
    analysis: Option<Box<dyn CodeAgent>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Build with agents taken from the configured command lines; an
    /// empty command line disables that agent phase.
    pub fn new(config: LoopConfig, paths: ResolvedPaths, cancel: CancellationToken) -> Self {
        let codegen = CommandAgent::from_command(
            "codegen",
            &config.execution.codegen_cmd,
            &config.safeguards,
            &config.execution,
        )
        .map(|a| Box::new(a) as Box<dyn CodeAgent>);
        let analysis = CommandAgent::from_command(
            "analysis",
            &config.execution.analysis_cmd,
            &config.safeguards,
            &config.execution,
        )
        .map(|a| Box::new(a) as Box<dyn CodeAgent>);

        Self {
            config,
            paths,
            codegen,
            analysis,
            cancel,
        }
    }

    pub fn with_codegen_agent(mut self, agent: Box<dyn CodeAgent>) -> Self {
        self.codegen = Some(agent);
        self
    }

    pub fn with_analysis_agent(mut self, agent: Box<dyn CodeAgent>) -> Self {
        self.analysis = Some(agent);
        self
    }

    /// Begin a fresh run from cycle 1, discarding any previous state
    /// file.
    pub async fn start(&self, prompt: &str) -> Result<RunState> {
        self.paths
            .create_directories()
            .context("failed to create run directories")?;

        let mut state = RunState::new();
        state.status = RunStatus::Running;
        state.started_at = Some(Utc::now());
        state.save(&self.paths.state_file)?;
        info!(run_id = %state.run_id, project = %self.config.project.name, "starting new run");

        self.run_loop(&mut state, prompt).await?;
        Ok(state)
    }

    /// Continue an interrupted run at `current_cycle + 1`. A corrupt
    /// state file is fatal here; a missing one means there is nothing to
    /// resume.
    pub async fn resume(&self, prompt: &str) -> Result<RunState> {
        let mut state = RunState::load(&self.paths.state_file)?
            .with_context(|| format!("no state at {}; run `start` first", self.paths.state_file.display()))?;

        if state.status.is_terminal() {
            bail!("run {} already finished with status {}", state.run_id, state.status);
        }

        self.paths
            .create_directories()
            .context("failed to create run directories")?;
        state.status = RunStatus::Running;
        state.save(&self.paths.state_file)?;
        info!(
            run_id = %state.run_id,
            next_cycle = state.current_cycle + 1,
            "resuming run"
        );

        self.run_loop(&mut state, prompt).await?;
        Ok(state)
    }

    async fn run_loop(&self, state: &mut RunState, prompt: &str) -> Result<()> {
        // A checkpoint pointing at the next cycle means an earlier
        // process died mid-cycle; its completed phases are reused, not
        // re-run. Checkpoints for already-recorded cycles are stale.
        let mut resume_from = state
            .phase_checkpoint
            .as_ref()
            .filter(|c| c.cycle == state.current_cycle + 1)
            .map(|c| c.completed);

        loop {
            // A resumed history may already warrant stopping.
            let verdict = self.evaluate(state, false);
            if verdict.stops() {
                return self.finish(state, verdict);
            }

            if self.cancel.is_cancelled() {
                info!(cycle = state.current_cycle, "interrupted; run stays resumable");
                return state.save(&self.paths.state_file);
            }

            let cycle = state.current_cycle + 1;
            match self.run_cycle(cycle, state, prompt, resume_from.take()).await {
                Ok(Some(snapshot)) => {
                    let decision = snapshot.analysis.decision.clone();
                    let budget_exceeded = budget_exceeded(
                        self.config.safeguards.budget_units_per_cycle,
                        snapshot.metrics.budget_units,
                    );

                    state.record_cycle(snapshot, self.config.project.target.direction);
                    state.save(&self.paths.state_file)?;
                    self.update_best_index(state)?;

                    let verdict = self.evaluate(state, budget_exceeded);
                    info!(cycle, verdict = ?verdict, "policy verdict");
                    if verdict.stops() {
                        return self.finish(state, verdict);
                    }

                    // Advisory only: the analysis can stop the loop
                    // early but never extend it past a safeguard.
                    if decision.action == DecisionAction::Stop {
                        info!(cycle, rationale = %decision.rationale, "analysis requested stop");
                        state.status = RunStatus::StoppedSafeguard;
                        return state.save(&self.paths.state_file);
                    }
                }
                Ok(None) => {
                    info!(cycle, "cancelled mid-cycle; run stays resumable");
                    return state.save(&self.paths.state_file);
                }
                Err(e) => {
                    state.status = RunStatus::Error;
                    if let Err(save_err) = state.save(&self.paths.state_file) {
                        warn!(error = %save_err, "failed to persist error status");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Run one full cycle. `Ok(None)` means cancellation interrupted a
    /// phase; nothing is recorded and the caller leaves the run
    /// resumable. `resume_from` is the last phase a previous process
    /// checkpointed for this cycle; everything up to and including it is
    /// skipped and its on-disk outputs reused.
    async fn run_cycle(
        &self,
        cycle: u32,
        state: &mut RunState,
        prompt: &str,
        resume_from: Option<Phase>,
    ) -> Result<Option<CycleSnapshot>> {
        let started = Instant::now();
        let cycle_dir = self.paths.cycle_dir(cycle);
        std::fs::create_dir_all(&cycle_dir)
            .with_context(|| format!("failed to create {}", cycle_dir.display()))?;

        info!(cycle, "cycle starting");
        let mut faults = Vec::new();
        let target = &self.config.project.target;
        let done = |phase: Phase| resume_from.is_some_and(|completed| completed >= phase);

        if done(Phase::Codegen) {
            info!(cycle, "codegen already checkpointed, skipping");
        } else {
            if let Some(agent) = &self.codegen {
                let agent_prompt = codegen_prompt(prompt, cycle, state, target);
                let outcome = agent
                    .run(&agent_prompt, &self.paths.workspace, &self.cancel)
                    .await?;
                match outcome.kind {
                    ExitKind::Cancelled => return Ok(None),
                    ExitKind::TimedOut => faults.push(self.timeout_fault("codegen")),
                    ExitKind::Failed => {
                        warn!(cycle, exit_code = ?outcome.exit_code, "codegen agent failed");
                        faults.push(CycleFault::ProcessFailure {
                            phase: "codegen".to_string(),
                            exit_code: outcome.exit_code,
                        });
                    }
                    ExitKind::Clean => {}
                }
            }
            self.checkpoint(state, cycle, Phase::Codegen)?;
        }

        let metrics_path = self.paths.workspace.join(METRICS_FILE);
        let (manifest_path, snapshot_dir, train_seconds, scan_text) = if done(Phase::Train) {
            info!(cycle, "training already checkpointed, reusing its outputs");
            (
                cycle_dir.join(MANIFEST_FILE),
                cycle_dir.join(artifacts::SNAPSHOT_DIR),
                0.0,
                String::new(),
            )
        } else {
            let previous = (cycle > 1)
                .then(|| {
                    FingerprintManifest::load(&self.paths.cycle_dir(cycle - 1).join(MANIFEST_FILE))
                })
                .flatten();
            let (manifest_path, snapshot_dir) = artifacts::snapshot_sources(
                &self.paths.workspace,
                &self.config.tracked_files,
                cycle,
                &cycle_dir,
                previous.as_ref(),
            )?;

            // A stale metrics file from a previous cycle must never be
            // mistaken for this cycle's output.
            match std::fs::remove_file(&metrics_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(error = %e, "failed to remove stale metrics file"),
            }

            let train = {
                let (program, args) = split_command(&self.config.execution.train_cmd)
                    .ok_or_else(|| anyhow!("execution.train_cmd is empty"))?;
                let spec = self.phase_spec(program, args, "train");
                runner::run(&spec, &self.cancel).await?
            };
            let mut scan_text = train.stdout.clone();
            match train.kind {
                ExitKind::Cancelled => return Ok(None),
                ExitKind::TimedOut => faults.push(self.timeout_fault("train")),
                ExitKind::Failed => {
                    warn!(cycle, exit_code = ?train.exit_code, "training exited nonzero");
                    faults.push(CycleFault::ProcessFailure {
                        phase: "train".to_string(),
                        exit_code: train.exit_code,
                    });
                }
                ExitKind::Clean => {}
            }

            if let Some((program, args)) = split_command(&self.config.execution.eval_cmd) {
                let spec = self.phase_spec(program, args, "eval");
                let eval = runner::run(&spec, &self.cancel).await?;
                scan_text.push_str(&eval.stdout);
                match eval.kind {
                    ExitKind::Cancelled => return Ok(None),
                    ExitKind::TimedOut => faults.push(self.timeout_fault("eval")),
                    ExitKind::Failed => {
                        warn!(cycle, exit_code = ?eval.exit_code, "eval exited nonzero");
                        faults.push(CycleFault::ProcessFailure {
                            phase: "eval".to_string(),
                            exit_code: eval.exit_code,
                        });
                    }
                    ExitKind::Clean => {}
                }
            }

            self.checkpoint(state, cycle, Phase::Train)?;
            (
                manifest_path,
                snapshot_dir,
                train.elapsed.as_secs_f64(),
                scan_text,
            )
        };

        let collected = training::collect(&metrics_path, &scan_text, &target.metric);
        if let Some(fault) = collected.fault.clone() {
            faults.push(fault);
        }

        let model_path = artifacts::capture_model(&self.paths.workspace, &cycle_dir)?;
        if model_path.is_none() {
            faults.push(CycleFault::ArtifactMissing);
        }

        if done(Phase::Analyze) {
            info!(cycle, "analysis already checkpointed, skipping agent");
        } else if let Some(agent) = &self.analysis {
            let agent_prompt = analysis_prompt(cycle, collected.value, target);
            let outcome = agent
                .run(&agent_prompt, &self.paths.workspace, &self.cancel)
                .await?;
            match outcome.kind {
                ExitKind::Cancelled => return Ok(None),
                ExitKind::TimedOut => faults.push(self.timeout_fault("analysis")),
                ExitKind::Failed => {
                    warn!(cycle, exit_code = ?outcome.exit_code, "analysis agent failed");
                    faults.push(CycleFault::ProcessFailure {
                        phase: "analysis".to_string(),
                        exit_code: outcome.exit_code,
                    });
                }
                ExitKind::Clean => {}
            }
        }

        let (cycle_analysis, analysis_faults) =
            analysis::load(&self.paths.workspace, cycle, collected.value, target);
        faults.extend(analysis_faults);
        self.checkpoint(state, cycle, Phase::Analyze)?;

        let metrics = MetricsReport {
            cycle,
            metric: target.metric.clone(),
            value: collected.value,
            raw: collected.raw,
            budget_units: collected.budget_units,
            train_seconds,
        };

        // Audit copy alongside the other cycle artifacts.
        let audit = serde_json::to_string_pretty(&metrics).context("failed to serialize metrics")?;
        std::fs::write(cycle_dir.join(METRICS_FILE), audit)
            .with_context(|| format!("failed to write metrics to {}", cycle_dir.display()))?;

        info!(
            cycle,
            metric = %target.metric,
            value = ?collected.value,
            faults = faults.len(),
            "cycle finished"
        );

        Ok(Some(CycleSnapshot {
            cycle,
            metrics,
            analysis: cycle_analysis,
            faults,
            artifacts: CycleArtifacts {
                snapshot_dir: Some(snapshot_dir),
                manifest_path: Some(manifest_path),
                model_path,
            },
            wall_seconds: started.elapsed().as_secs_f64(),
            recorded_at: Utc::now(),
        }))
    }

    fn phase_spec(&self, program: String, args: Vec<String>, phase: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(program, args, &self.paths.workspace);
        spec.timeout = Duration::from_secs(self.config.safeguards.cycle_time_limit_secs);
        spec.kill_grace = Duration::from_secs(self.config.safeguards.kill_grace_secs);
        spec.heartbeat = Duration::from_secs(self.config.execution.heartbeat_secs);
        spec.observe = Observe::LiveLog {
            label: phase.to_string(),
        };
        spec.phase = phase.to_string();
        spec
    }

    fn timeout_fault(&self, phase: &str) -> CycleFault {
        CycleFault::ProcessTimeout {
            phase: phase.to_string(),
            limit_secs: self.config.safeguards.cycle_time_limit_secs,
        }
    }

    fn checkpoint(&self, state: &mut RunState, cycle: u32, phase: Phase) -> Result<()> {
        state.phase_checkpoint = Some(PhaseCheckpoint {
            cycle,
            completed: phase,
            at: Utc::now(),
        });
        state.save(&self.paths.state_file)
    }

    fn evaluate(&self, state: &RunState, budget_exceeded: bool) -> Verdict {
        let history = state.metric_history();
        stopping::evaluate(&PolicyInputs {
            history: &history,
            direction: self.config.project.target.direction,
            target: self.config.project.target.value,
            min_delta: self.config.safeguards.min_delta,
            window: self.config.safeguards.no_improvement_window as usize,
            max_cycles: self.config.safeguards.max_cycles,
            current_cycle: state.current_cycle,
            budget_exceeded,
        })
    }

    fn finish(&self, state: &mut RunState, verdict: Verdict) -> Result<()> {
        let status = status_for(verdict);
        info!(
            cycle = state.current_cycle,
            verdict = ?verdict,
            status = %status,
            best_metric = ?state.best_metric,
            best_cycle = state.best_cycle,
            "run finished"
        );
        state.status = status;
        state.save(&self.paths.state_file)
    }

    /// Re-point the best-model index when the cycle just recorded
    /// strictly improves on whatever the on-disk index holds. The index
    /// is global across runs: a fresh run that falls short of an earlier
    /// run's best leaves it untouched.
    fn update_best_index(&self, state: &RunState) -> Result<()> {
        let Some(last) = state.history.last() else {
            return Ok(());
        };
        let Some(value) = last.metrics.value else {
            return Ok(());
        };
        let Some(model) = &last.artifacts.model_path else {
            debug!(cycle = last.cycle, "cycle produced no model, index unchanged");
            return Ok(());
        };

        let direction = self.config.project.target.direction;
        if let Some(existing) = BestModelIndex::load(&self.paths.best_index) {
            if !direction.improves(value, existing.metric_value) {
                debug!(
                    cycle = last.cycle,
                    value,
                    incumbent = existing.metric_value,
                    "index keeps the incumbent best"
                );
                return Ok(());
            }
        }

        BestModelIndex {
            run_id: state.run_id,
            cycle: last.cycle,
            path: model.clone(),
            metric_value: value,
            updated_at: Utc::now(),
        }
        .save(&self.paths.best_index)
    }
}

/// Terminal status for each stopping verdict.
fn status_for(verdict: Verdict) -> RunStatus {
    match verdict {
        Verdict::TargetMet => RunStatus::Completed,
        Verdict::MaxCyclesReached | Verdict::BudgetExceeded => RunStatus::StoppedSafeguard,
        Verdict::Plateau => RunStatus::StoppedPlateau,
        Verdict::Continue => RunStatus::Running,
    }
}

fn budget_exceeded(limit: Option<f64>, used: Option<f64>) -> bool {
    match (limit, used) {
        (Some(limit), Some(used)) => used > limit,
        _ => false,
    }
}

fn codegen_prompt(base: &str, cycle: u32, state: &RunState, target: &TargetMetric) -> String {
    let mut prompt = String::new();
    prompt.push_str(base.trim());
    prompt.push_str(&format!(
        "\n\nCycle {cycle}. Target: {} {} {}.\n",
        target.metric,
        target.direction.comparator(),
        target.value
    ));

    if let Some(last) = state.history.last() {
        match last.metrics.value {
            Some(v) => prompt.push_str(&format!("Previous cycle achieved {} = {v}.\n", target.metric)),
            None => prompt.push_str("Previous cycle produced no usable metric.\n"),
        }
        if let Some(best) = state.best_metric {
            prompt.push_str(&format!("Best so far: {best} (cycle {}).\n", state.best_cycle));
        }
        if !last.analysis.summary.is_empty() {
            prompt.push_str(&format!("\nPrevious analysis:\n{}\n", last.analysis.summary));
        }
        if !last.analysis.recommendations.is_empty() {
            prompt.push_str("\nRecommendations from the previous cycle:\n");
            for rec in &last.analysis.recommendations {
                prompt.push_str(&format!(
                    "- {} ({}): {}\n",
                    rec.action, rec.confidence, rec.rationale
                ));
            }
        }
    }
    prompt
}

fn analysis_prompt(cycle: u32, achieved: Option<f64>, target: &TargetMetric) -> String {
    let achieved = match achieved {
        Some(v) => v.to_string(),
        None => "unavailable".to_string(),
    };
    format!(
        "Cycle {cycle} finished with {} = {achieved}; the target is {} {} {}.\n\
         Review the training results in this workspace and write analysis.md, \
         recommendations.json, and decision.json.",
        target.metric,
        target.metric,
        target.direction.comparator(),
        target.value
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdicts_map_to_terminal_statuses() {
        assert_eq!(status_for(Verdict::TargetMet), RunStatus::Completed);
        assert_eq!(status_for(Verdict::MaxCyclesReached), RunStatus::StoppedSafeguard);
        assert_eq!(status_for(Verdict::BudgetExceeded), RunStatus::StoppedSafeguard);
        assert_eq!(status_for(Verdict::Plateau), RunStatus::StoppedPlateau);
    }

    #[test]
    fn budget_check_requires_both_sides() {
        assert!(budget_exceeded(Some(100.0), Some(150.0)));
        assert!(!budget_exceeded(Some(100.0), Some(100.0)));
        assert!(!budget_exceeded(Some(100.0), None));
        assert!(!budget_exceeded(None, Some(1e9)));
    }

    #[test]
    fn codegen_prompt_carries_previous_cycle_context() {
        use crate::config::Direction;
        use crate::state::{CycleAnalysis, Decision, Recommendation};

        let target = TargetMetric {
            metric: "test_accuracy".to_string(),
            value: 0.92,
            direction: Direction::Maximize,
        };

        let mut state = RunState::new();
        let fresh = codegen_prompt("improve the model", 1, &state, &target);
        assert!(fresh.contains("Cycle 1"));
        assert!(fresh.contains("test_accuracy >= 0.92"));
        assert!(!fresh.contains("Previous"));

        let mut snapshot = crate::state::CycleSnapshot {
            cycle: 1,
            metrics: MetricsReport {
                cycle: 1,
                metric: "test_accuracy".to_string(),
                value: Some(0.85),
                raw: serde_json::Value::Null,
                budget_units: None,
                train_seconds: 1.0,
            },
            analysis: CycleAnalysis {
                summary: "underfitting".to_string(),
                recommendations: vec![Recommendation {
                    action: "add capacity".to_string(),
                    confidence: "high".to_string(),
                    rationale: "loss still dropping".to_string(),
                }],
                decision: Decision {
                    action: DecisionAction::Continue,
                    rationale: "keep going".to_string(),
                },
            },
            faults: vec![],
            artifacts: CycleArtifacts::default(),
            wall_seconds: 1.0,
            recorded_at: Utc::now(),
        };
        snapshot.metrics.value = Some(0.85);
        state.record_cycle(snapshot, Direction::Maximize);

        let next = codegen_prompt("improve the model", 2, &state, &target);
        assert!(next.contains("Previous cycle achieved test_accuracy = 0.85"));
        assert!(next.contains("Best so far: 0.85"));
        assert!(next.contains("add capacity"));
        assert!(next.contains("underfitting"));
    }
}
