//! Analysis ingestion.
//!
//! After the analysis agent runs, the workspace may contain up to three
//! documents: `analysis.md` (free-form summary), `recommendations.json`,
//! and `decision.json`. All three are optional and all are ingested
//! tolerantly: a missing document is synthesized from the metrics, a
//! malformed one is recorded as a fault and replaced by the synthesized
//! default. Analysis output can advise stopping but can never force the
//! loop past its safeguards.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::config::TargetMetric;
use crate::error::CycleFault;
use crate::state::{CycleAnalysis, Decision, DecisionAction, Recommendation};

pub const ANALYSIS_FILE: &str = "analysis.md";
pub const RECOMMENDATIONS_FILE: &str = "recommendations.json";
pub const DECISION_FILE: &str = "decision.json";

#[derive(Debug, Deserialize)]
struct RawRecommendation {
    #[serde(default)]
    action: String,
    #[serde(default = "default_confidence")]
    confidence: String,
    #[serde(default)]
    rationale: String,
}

fn default_confidence() -> String {
    "unknown".to_string()
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    action: String,
    #[serde(default)]
    rationale: String,
}

/// Read all analysis documents for a cycle, synthesizing whatever is
/// missing and recording a fault for whatever is malformed.
pub fn load(
    workspace: &Path,
    cycle: u32,
    achieved: Option<f64>,
    target: &TargetMetric,
) -> (CycleAnalysis, Vec<CycleFault>) {
    let mut faults = Vec::new();

    let summary = match read_summary(&workspace.join(ANALYSIS_FILE)) {
        Some(text) => text,
        None => synthesize_summary(cycle, achieved, target),
    };

    let decision = match read_decision(&workspace.join(DECISION_FILE), &mut faults) {
        Some(decision) => decision,
        None => synthesize_decision(achieved, target),
    };

    let recommendations =
        match read_recommendations(&workspace.join(RECOMMENDATIONS_FILE), &mut faults) {
            Some(recs) => recs,
            None => vec![synthesize_recommendation(&decision)],
        };

    (
        CycleAnalysis {
            summary,
            recommendations,
            decision,
        },
        faults,
    )
}

fn read_summary(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Accepts either a bare JSON list or an object with a
/// `recommendations` list. Entries with unknown extra fields are fine;
/// entries that are not objects are skipped.
fn read_recommendations(path: &Path, faults: &mut Vec<CycleFault>) -> Option<Vec<Recommendation>> {
    let contents = std::fs::read_to_string(path).ok()?;
    let doc: Value = match serde_json::from_str(&contents) {
        Ok(doc) => doc,
        Err(e) => {
            malformed(faults, path, &format!("invalid JSON: {e}"));
            return None;
        }
    };

    let items = match &doc {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get("recommendations").and_then(Value::as_array) {
            Some(items) => items.clone(),
            None => {
                malformed(faults, path, "no recommendations list found");
                return None;
            }
        },
        _ => {
            malformed(faults, path, "expected a list or an object");
            return None;
        }
    };

    let recs = items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<RawRecommendation>(item).ok())
        .map(|raw| Recommendation {
            action: raw.action,
            confidence: raw.confidence,
            rationale: raw.rationale,
        })
        .collect();
    Some(recs)
}

/// Accepts `{"action": ..}` either at the top level or nested under a
/// `decision` key. Actions are matched case-insensitively; anything
/// other than continue/stop is malformed.
fn read_decision(path: &Path, faults: &mut Vec<CycleFault>) -> Option<Decision> {
    let contents = std::fs::read_to_string(path).ok()?;
    let doc: Value = match serde_json::from_str(&contents) {
        Ok(doc) => doc,
        Err(e) => {
            malformed(faults, path, &format!("invalid JSON: {e}"));
            return None;
        }
    };

    let node = doc.get("decision").cloned().unwrap_or(doc);
    let raw: RawDecision = match serde_json::from_value(node) {
        Ok(raw) => raw,
        Err(e) => {
            malformed(faults, path, &format!("unexpected shape: {e}"));
            return None;
        }
    };

    let action = match raw.action.trim().to_lowercase().as_str() {
        "continue" => DecisionAction::Continue,
        "stop" => DecisionAction::Stop,
        other => {
            malformed(faults, path, &format!("unknown action '{other}'"));
            return None;
        }
    };

    Some(Decision {
        action,
        rationale: raw.rationale,
    })
}

fn malformed(faults: &mut Vec<CycleFault>, path: &Path, reason: &str) {
    warn!(path = %path.display(), reason, "malformed analysis document, using synthesized default");
    faults.push(CycleFault::AnalysisMalformed {
        reason: format!("{}: {reason}", path.display()),
    });
}

fn synthesize_summary(cycle: u32, achieved: Option<f64>, target: &TargetMetric) -> String {
    let achieved = match achieved {
        Some(v) => format!("{v}"),
        None => "unavailable".to_string(),
    };
    format!(
        "Cycle {cycle}: {} = {achieved} (target {} {})",
        target.metric,
        target.direction.comparator(),
        target.value
    )
}

/// Placeholder recommendation mirroring the decision, used when the
/// agent produced none.
fn synthesize_recommendation(decision: &Decision) -> Recommendation {
    let action = match decision.action {
        DecisionAction::Continue => "continue training",
        DecisionAction::Stop => "stop training",
    };
    Recommendation {
        action: action.to_string(),
        confidence: "low".to_string(),
        rationale: decision.rationale.clone(),
    }
}

fn synthesize_decision(achieved: Option<f64>, target: &TargetMetric) -> Decision {
    let met = achieved.is_some_and(|v| target.direction.meets(v, target.value));
    if met {
        Decision {
            action: DecisionAction::Stop,
            rationale: format!(
                "{} reached the target of {}",
                target.metric, target.value
            ),
        }
    } else {
        Decision {
            action: DecisionAction::Continue,
            rationale: format!("{} has not reached {}", target.metric, target.value),
        }
    }
}
