//! Run configuration.
//!
//! Loaded once from a TOML file (`mloop.toml` by default) and passed down
//! immutably. Paths are resolved to absolute directories at load time so a
//! resumed run sees the same layout regardless of the invoking directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FatalError;

/// Optimization direction for the target metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Maximize,
    Minimize,
}

impl Direction {
    /// Comparator symbol for display: how achieved relates to target.
    pub fn comparator(self) -> &'static str {
        match self {
            Direction::Maximize => ">=",
            Direction::Minimize => "<=",
        }
    }

    /// Whether `value` meets the configured target.
    pub fn meets(self, value: f64, target: f64) -> bool {
        match self {
            Direction::Maximize => value >= target,
            Direction::Minimize => value <= target,
        }
    }

    /// Strict improvement: ties are never improvements.
    pub fn improves(self, candidate: f64, best: f64) -> bool {
        match self {
            Direction::Maximize => candidate > best,
            Direction::Minimize => candidate < best,
        }
    }

    /// Signed gain of `candidate` over `best`, positive when improving.
    pub fn gain(self, candidate: f64, best: f64) -> f64 {
        match self {
            Direction::Maximize => candidate - best,
            Direction::Minimize => best - candidate,
        }
    }
}

/// The single scalar the loop optimizes toward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetMetric {
    /// Metric name as it appears in metrics documents (e.g. `test_accuracy`).
    pub metric: String,
    /// Target value to reach.
    pub value: f64,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub target: TargetMetric,
}

/// Hard caps that unconditionally stop the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeguardsConfig {
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Stop after this many cycles without improvement >= `min_delta`.
    #[serde(default = "default_window")]
    pub no_improvement_window: u32,
    /// Minimum best-so-far gain that counts as progress.
    #[serde(default = "default_min_delta")]
    pub min_delta: f64,
    /// Wall-clock limit per phase subprocess.
    #[serde(default = "default_cycle_time_limit")]
    pub cycle_time_limit_secs: u64,
    /// Grace period between SIGTERM and SIGKILL on timeout or cancellation.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
    /// Optional per-cycle budget, compared against a `budget_units` field
    /// reported in the metrics document. Disabled when absent.
    #[serde(default)]
    pub budget_units_per_cycle: Option<f64>,
}

fn default_max_cycles() -> u32 {
    10
}
fn default_window() -> u32 {
    3
}
fn default_min_delta() -> f64 {
    0.002
}
fn default_cycle_time_limit() -> u64 {
    1800
}
fn default_kill_grace() -> u64 {
    5
}

impl Default for SafeguardsConfig {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            no_improvement_window: default_window(),
            min_delta: default_min_delta(),
            cycle_time_limit_secs: default_cycle_time_limit(),
            kill_grace_secs: default_kill_grace(),
            budget_units_per_cycle: None,
        }
    }
}

/// External command lines. Agent commands may be empty to disable that
/// phase (useful when the workspace is prepared by hand).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_train_cmd")]
    pub train_cmd: String,
    #[serde(default)]
    pub eval_cmd: String,
    #[serde(default)]
    pub codegen_cmd: String,
    #[serde(default)]
    pub analysis_cmd: String,
    /// Interval between liveness log lines for long-running phases.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

fn default_train_cmd() -> String {
    "python train.py --config config.json".to_string()
}
fn default_heartbeat() -> u64 {
    10
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            train_cmd: default_train_cmd(),
            eval_cmd: String::new(),
            codegen_cmd: String::new(),
            analysis_cmd: String::new(),
            heartbeat_secs: default_heartbeat(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_runs")]
    pub runs: String,
    #[serde(default = "default_reports")]
    pub reports: String,
    #[serde(default = "default_state")]
    pub state: String,
}

fn default_workspace() -> String {
    "./workspace".to_string()
}
fn default_runs() -> String {
    "./runs".to_string()
}
fn default_reports() -> String {
    "./reports".to_string()
}
fn default_state() -> String {
    "./state".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            runs: default_runs(),
            reports: default_reports(),
            state: default_state(),
        }
    }
}

fn default_tracked_files() -> Vec<String> {
    ["model.py", "train.py", "eval.py", "data.py", "config.json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// The full, immutable run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub project: ProjectConfig,
    #[serde(default)]
    pub safeguards: SafeguardsConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Workspace files fingerprinted and snapshotted each cycle.
    #[serde(default = "default_tracked_files")]
    pub tracked_files: Vec<String>,
}

impl LoopConfig {
    /// Read and parse the config file. Parse failures are fatal.
    pub fn load(path: &Path) -> Result<Self, FatalError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            FatalError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: LoopConfig = toml::from_str(&contents).map_err(|e| {
            FatalError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the type-shape-valid config for semantic mistakes.
    pub fn validate(&self) -> Result<(), FatalError> {
        if self.project.target.metric.trim().is_empty() {
            return Err(FatalError::Config("target metric name is empty".into()));
        }
        if self.safeguards.max_cycles == 0 {
            return Err(FatalError::Config("safeguards.max_cycles must be >= 1".into()));
        }
        if self.safeguards.no_improvement_window == 0 {
            return Err(FatalError::Config(
                "safeguards.no_improvement_window must be >= 1".into(),
            ));
        }
        if self.safeguards.min_delta < 0.0 {
            return Err(FatalError::Config(
                "safeguards.min_delta must be non-negative".into(),
            ));
        }
        if split_command(&self.execution.train_cmd).is_none() {
            return Err(FatalError::Config("execution.train_cmd is empty".into()));
        }
        Ok(())
    }

    /// Resolve all configured paths against `base` (the config file's
    /// directory), once, at startup.
    pub fn resolved_paths(&self, base: &Path) -> ResolvedPaths {
        let join = |rel: &str| -> PathBuf {
            let p = PathBuf::from(rel);
            if p.is_absolute() { p } else { base.join(p) }
        };
        let state_dir = join(&self.paths.state);
        ResolvedPaths {
            workspace: join(&self.paths.workspace),
            runs: join(&self.paths.runs),
            reports: join(&self.paths.reports),
            state_file: state_dir.join("loop_state.json"),
            best_index: base.join("best_model_index.json"),
            state_dir,
        }
    }

    /// Commented template written by `mloop init`.
    pub fn example_toml() -> &'static str {
        r#"[project]
name = "my-experiment"

[project.target]
metric = "test_accuracy"
value = 0.92
direction = "maximize"   # or "minimize"

[safeguards]
max_cycles = 10
no_improvement_window = 3
min_delta = 0.002
cycle_time_limit_secs = 1800
kill_grace_secs = 5
# budget_units_per_cycle = 100000.0

[execution]
train_cmd = "python train.py --config config.json"
eval_cmd = ""
codegen_cmd = ""
analysis_cmd = ""
heartbeat_secs = 10

[paths]
workspace = "./workspace"
runs = "./runs"
reports = "./reports"
state = "./state"
"#
    }
}

/// Fully resolved filesystem layout for one run.
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub workspace: PathBuf,
    pub runs: PathBuf,
    pub reports: PathBuf,
    pub state_dir: PathBuf,
    pub state_file: PathBuf,
    pub best_index: PathBuf,
}

impl ResolvedPaths {
    /// Create every directory the run needs.
    pub fn create_directories(&self) -> anyhow::Result<()> {
        for dir in [&self.workspace, &self.runs, &self.reports, &self.state_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Directory for one cycle's artifacts, e.g. `runs/cycle_0003`.
    pub fn cycle_dir(&self, cycle: u32) -> PathBuf {
        self.runs.join(format!("cycle_{cycle:04}"))
    }
}

/// Split a whitespace-delimited command line into program + args.
/// Returns `None` for an empty or all-whitespace string.
pub fn split_command(cmdline: &str) -> Option<(String, Vec<String>)> {
    let mut parts = cmdline.split_whitespace();
    let program = parts.next()?.to_string();
    Some((program, parts.map(|s| s.to_string()).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[project]
name = "test"

[project.target]
metric = "test_accuracy"
value = 0.92
"#
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config: LoopConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.project.target.direction, Direction::Maximize);
        assert_eq!(config.safeguards.max_cycles, 10);
        assert_eq!(config.safeguards.no_improvement_window, 3);
        assert!((config.safeguards.min_delta - 0.002).abs() < 1e-12);
        assert_eq!(config.safeguards.budget_units_per_cycle, None);
        assert_eq!(config.tracked_files.len(), 5);
        config.validate().unwrap();
    }

    #[test]
    fn example_toml_parses_and_validates() {
        let config: LoopConfig = toml::from_str(LoopConfig::example_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.project.target.metric, "test_accuracy");
    }

    #[test]
    fn direction_minimize_parses() {
        let toml_str = r#"
[project]
name = "test"

[project.target]
metric = "val_loss"
value = 0.1
direction = "minimize"
"#;
        let config: LoopConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.project.target.direction, Direction::Minimize);
    }

    #[test]
    fn empty_metric_name_is_rejected() {
        let toml_str = r#"
[project]
name = "test"

[project.target]
metric = "  "
value = 0.5
"#;
        let config: LoopConfig = toml::from_str(toml_str).unwrap();
        assert!(matches!(config.validate(), Err(FatalError::Config(_))));
    }

    #[test]
    fn zero_max_cycles_is_rejected() {
        let mut config: LoopConfig = toml::from_str(minimal_toml()).unwrap();
        config.safeguards.max_cycles = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_train_cmd_is_rejected() {
        let mut config: LoopConfig = toml::from_str(minimal_toml()).unwrap();
        config.execution.train_cmd = "   ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn direction_comparisons() {
        assert!(Direction::Maximize.meets(0.92, 0.92));
        assert!(!Direction::Maximize.meets(0.919, 0.92));
        assert!(Direction::Minimize.meets(0.1, 0.1));
        assert!(!Direction::Minimize.meets(0.11, 0.1));

        // Strict: ties never improve.
        assert!(!Direction::Maximize.improves(0.5, 0.5));
        assert!(Direction::Maximize.improves(0.51, 0.5));
        assert!(!Direction::Minimize.improves(0.5, 0.5));
        assert!(Direction::Minimize.improves(0.49, 0.5));

        assert!((Direction::Minimize.gain(0.4, 0.5) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn resolved_paths_are_absolute_under_base() {
        let config: LoopConfig = toml::from_str(minimal_toml()).unwrap();
        let paths = config.resolved_paths(Path::new("/proj"));
        assert_eq!(paths.workspace, Path::new("/proj/./workspace"));
        assert_eq!(paths.state_file, Path::new("/proj/./state/loop_state.json"));
        assert_eq!(paths.cycle_dir(3), Path::new("/proj/./runs/cycle_0003"));
    }

    #[test]
    fn split_command_handles_args_and_empty() {
        let (prog, args) = split_command("python train.py --config config.json").unwrap();
        assert_eq!(prog, "python");
        assert_eq!(args, vec!["train.py", "--config", "config.json"]);
        assert!(split_command("").is_none());
        assert!(split_command("   ").is_none());
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = LoopConfig::load(Path::new("/nonexistent/mloop.toml")).unwrap_err();
        assert!(matches!(err, FatalError::Config(_)));
    }
}
