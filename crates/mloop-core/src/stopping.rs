//! Stop policy: pure functions over the metric history.
//!
//! Improvement is always strict (`>` / `<` under the direction); equal
//! values never count, so a noisy flat metric cannot keep the loop alive
//! forever. Cycles with an unavailable metric are non-improving.

use serde::{Deserialize, Serialize};

use crate::config::Direction;

/// Outcome of evaluating the policy after a cycle, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The latest cycle met the configured target.
    TargetMet,
    /// The max-cycles safeguard tripped.
    MaxCyclesReached,
    /// The per-cycle budget safeguard tripped.
    BudgetExceeded,
    /// No improvement >= min_delta within the window.
    Plateau,
    Continue,
}

impl Verdict {
    pub fn stops(self) -> bool {
        self != Verdict::Continue
    }
}

/// Everything the policy looks at. All inputs are explicit; the policy
/// holds no state of its own.
#[derive(Debug, Clone)]
pub struct PolicyInputs<'a> {
    /// Target-metric value per completed cycle, in order. `None` means
    /// the metric was unavailable that cycle.
    pub history: &'a [Option<f64>],
    pub direction: Direction,
    pub target: f64,
    pub min_delta: f64,
    pub window: usize,
    pub max_cycles: u32,
    /// Cycle number of the most recently completed cycle.
    pub current_cycle: u32,
    /// The just-completed cycle blew its budget safeguard.
    pub budget_exceeded: bool,
}

/// Whether `value` meets the target under the direction. Unavailable
/// values never meet a target.
pub fn target_met(value: Option<f64>, direction: Direction, target: f64) -> bool {
    match value {
        Some(v) => direction.meets(v, target),
        None => false,
    }
}

/// True iff, over the last `window` entries, no entry improved the
/// running best-so-far (computed over the whole history) by at least
/// `min_delta`. The first metric value ever seen counts as an
/// improvement. Histories shorter than the window never plateau.
pub fn plateau(
    history: &[Option<f64>],
    direction: Direction,
    min_delta: f64,
    window: usize,
) -> bool {
    if window == 0 || history.len() < window {
        return false;
    }

    let start = history.len() - window;
    let mut best: Option<f64> = None;
    let mut improved_in_window = false;

    for (i, entry) in history.iter().enumerate() {
        let Some(value) = entry else { continue };

        let (improves, gain) = match best {
            None => (true, f64::INFINITY),
            Some(b) => (direction.improves(*value, b), direction.gain(*value, b)),
        };

        if improves {
            if i >= start && gain >= min_delta {
                improved_in_window = true;
            }
            best = Some(*value);
        }
    }

    !improved_in_window
}

/// Apply the full stop policy in its fixed precedence order:
/// target met, then max cycles, then budget, then plateau.
pub fn evaluate(inputs: &PolicyInputs<'_>) -> Verdict {
    let latest = inputs.history.last().copied().flatten();

    if target_met(latest, inputs.direction, inputs.target) {
        return Verdict::TargetMet;
    }
    if inputs.current_cycle >= inputs.max_cycles {
        return Verdict::MaxCyclesReached;
    }
    if inputs.budget_exceeded {
        return Verdict::BudgetExceeded;
    }
    if plateau(inputs.history, inputs.direction, inputs.min_delta, inputs.window) {
        return Verdict::Plateau;
    }
    Verdict::Continue
}
