//! Markdown run report.

use std::fmt::Write as _;

use mloop_core::config::LoopConfig;
use mloop_core::state::RunState;

/// Render the full run history as a markdown document.
pub fn render(config: &LoopConfig, state: &RunState) -> String {
    let target = &config.project.target;
    let mut out = String::new();

    let _ = writeln!(out, "# Run report: {}", config.project.name);
    let _ = writeln!(out);
    let _ = writeln!(out, "- run id: `{}`", state.run_id);
    let _ = writeln!(out, "- status: **{}**", state.status);
    let _ = writeln!(
        out,
        "- target: `{}` {} {}",
        target.metric,
        target.direction.comparator(),
        target.value
    );
    match state.best_metric {
        Some(best) => {
            let _ = writeln!(out, "- best: {best} (cycle {})", state.best_cycle);
        }
        None => {
            let _ = writeln!(out, "- best: none recorded");
        }
    }
    if let Some(started) = state.started_at {
        let _ = writeln!(out, "- started: {started}");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "| cycle | {} | wall (s) | faults | decision |", target.metric);
    let _ = writeln!(out, "|------:|------:|---------:|--------|----------|");
    for snapshot in &state.history {
        let value = snapshot
            .metrics
            .value
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        let faults = if snapshot.faults.is_empty() {
            "-".to_string()
        } else {
            snapshot
                .faults
                .iter()
                .map(fault_label)
                .collect::<Vec<_>>()
                .join(", ")
        };
        let _ = writeln!(
            out,
            "| {} | {} | {:.1} | {} | {:?} |",
            snapshot.cycle, value, snapshot.wall_seconds, faults, snapshot.analysis.decision.action
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Cycle notes");
    for snapshot in &state.history {
        let _ = writeln!(out);
        let _ = writeln!(out, "### Cycle {}", snapshot.cycle);
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", snapshot.analysis.summary);
        for rec in &snapshot.analysis.recommendations {
            let _ = writeln!(out, "- {} ({}): {}", rec.action, rec.confidence, rec.rationale);
        }
    }

    out
}

fn fault_label(fault: &mloop_core::error::CycleFault) -> String {
    use mloop_core::error::CycleFault;
    match fault {
        CycleFault::ProcessTimeout { phase, .. } => format!("{phase} timeout"),
        CycleFault::ProcessFailure { phase, exit_code } => match exit_code {
            Some(code) => format!("{phase} exit {code}"),
            None => format!("{phase} killed"),
        },
        CycleFault::MetricsUnavailable => "metrics unavailable".to_string(),
        CycleFault::AnalysisMalformed { .. } => "analysis malformed".to_string(),
        CycleFault::ArtifactMissing => "no model artifact".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mloop_core::config::Direction;
    use mloop_core::error::CycleFault;
    use mloop_core::state::{
        CycleAnalysis, CycleArtifacts, CycleSnapshot, Decision, DecisionAction, MetricsReport,
    };

    fn config() -> LoopConfig {
        let toml_str = r#"
[project]
name = "demo"

[project.target]
metric = "test_accuracy"
value = 0.92
"#;
        toml::from_str(toml_str).unwrap()
    }

    fn snapshot(cycle: u32, value: Option<f64>, faults: Vec<CycleFault>) -> CycleSnapshot {
        CycleSnapshot {
            cycle,
            metrics: MetricsReport {
                cycle,
                metric: "test_accuracy".to_string(),
                value,
                raw: serde_json::Value::Null,
                budget_units: None,
                train_seconds: 2.0,
            },
            analysis: CycleAnalysis {
                summary: format!("notes for cycle {cycle}"),
                recommendations: vec![],
                decision: Decision {
                    action: DecisionAction::Continue,
                    rationale: String::new(),
                },
            },
            faults,
            artifacts: CycleArtifacts::default(),
            wall_seconds: 3.5,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn report_lists_every_cycle() {
        let mut state = RunState::new();
        state.record_cycle(snapshot(1, Some(0.8), vec![]), Direction::Maximize);
        state.record_cycle(
            snapshot(
                2,
                None,
                vec![CycleFault::ProcessTimeout {
                    phase: "train".to_string(),
                    limit_secs: 60,
                }],
            ),
            Direction::Maximize,
        );

        let rendered = render(&config(), &state);
        assert!(rendered.contains("# Run report: demo"));
        assert!(rendered.contains("| 1 | 0.8 |"));
        assert!(rendered.contains("| 2 | - |"));
        assert!(rendered.contains("train timeout"));
        assert!(rendered.contains("best: 0.8 (cycle 1)"));
        assert!(rendered.contains("notes for cycle 2"));
    }

    #[test]
    fn report_handles_an_empty_run() {
        let state = RunState::new();
        let rendered = render(&config(), &state);
        assert!(rendered.contains("best: none recorded"));
        assert!(rendered.contains("status: **idle**"));
    }
}
