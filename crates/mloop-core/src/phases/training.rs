//! Metrics collection after a training run.
//!
//! Training scripts in the wild disagree about where they put their
//! numbers. Extraction is tolerant by design: several known document
//! shapes are probed in a fixed order, then the captured stdout is
//! scanned as a last resort. A value that cannot be found anywhere is
//! reported as unavailable, never defaulted to zero.

use std::path::Path;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::CycleFault;

/// Result of metrics collection for one cycle.
#[derive(Debug, Clone)]
pub struct CollectedMetrics {
    /// Parsed target-metric value, `None` when unavailable.
    pub value: Option<f64>,
    /// The raw metrics document, `Value::Null` when none could be read.
    pub raw: Value,
    /// Budget usage reported by training, when present.
    pub budget_units: Option<f64>,
    pub fault: Option<CycleFault>,
}

/// Probe a metrics document for `name`, in order:
/// `result.<name>`, top-level `<name>`, `final_epoch.<name>`, then the
/// last entry of a `history` array. First numeric hit wins.
pub fn probe_document(doc: &Value, name: &str) -> Option<f64> {
    let numeric = |v: &Value| v.as_f64();

    if let Some(v) = doc.get("result").and_then(|r| r.get(name)).and_then(numeric) {
        return Some(v);
    }
    if let Some(v) = doc.get(name).and_then(numeric) {
        return Some(v);
    }
    if let Some(v) = doc
        .get("final_epoch")
        .and_then(|e| e.get(name))
        .and_then(numeric)
    {
        return Some(v);
    }
    if let Some(v) = doc
        .get("history")
        .and_then(Value::as_array)
        .and_then(|h| h.last())
        .and_then(|e| e.get(name))
        .and_then(numeric)
    {
        return Some(v);
    }
    None
}

/// Scan captured stdout for lines like `test_accuracy: 0.91` or
/// `test_accuracy=0.91` (case-insensitive). The last occurrence wins,
/// since training scripts typically print per-epoch values and finish
/// with the final one.
pub fn scan_output(text: &str, name: &str) -> Option<f64> {
    let pattern = format!(
        r"(?i){}\s*[:=]\s*(-?[0-9]+(?:\.[0-9]+)?)",
        regex::escape(name)
    );
    // The pattern is built from an escaped literal; it always compiles.
    let re = Regex::new(&pattern).ok()?;
    re.captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Collect metrics for a cycle: read `metrics_path` if it exists, probe
/// it for the target metric and budget usage, and fall back to scanning
/// `stdout`.
pub fn collect(metrics_path: &Path, stdout: &str, metric: &str) -> CollectedMetrics {
    let raw = match std::fs::read_to_string(metrics_path) {
        Ok(contents) => match serde_json::from_str::<Value>(&contents) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    path = %metrics_path.display(),
                    error = %e,
                    "metrics file is not valid JSON, falling back to stdout scan"
                );
                Value::Null
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %metrics_path.display(), "no metrics file produced");
            Value::Null
        }
        Err(e) => {
            warn!(path = %metrics_path.display(), error = %e, "failed to read metrics file");
            Value::Null
        }
    };

    let mut value = probe_document(&raw, metric);
    if value.is_none() {
        value = scan_output(stdout, metric);
        if value.is_some() {
            debug!(metric, "metric recovered from training stdout");
        }
    }
    let budget_units = probe_document(&raw, "budget_units");

    let fault = if value.is_none() {
        warn!(metric, "target metric unavailable this cycle");
        Some(CycleFault::MetricsUnavailable)
    } else {
        None
    };

    CollectedMetrics {
        value,
        raw,
        budget_units,
        fault,
    }
}
