//! Code-modifying agent abstraction.
//!
//! Codegen and analysis are performed by an external agent command that
//! receives its prompt on stdin and edits the workspace in place. The
//! trait keeps the orchestrator testable with scripted fakes.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{split_command, ExecutionConfig, SafeguardsConfig};
use crate::runner::{self, CommandSpec, Observe, RunOutcome};

/// An agent that can act on the workspace given a prompt.
#[async_trait]
pub trait CodeAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Run the agent against `workspace` with `prompt` on stdin.
    /// Spawn failures are `Err`; everything the process does, including
    /// timing out, comes back as a [`RunOutcome`].
    async fn run(
        &self,
        prompt: &str,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome>;
}

/// Agent backed by a configured command line.
pub struct CommandAgent {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
    kill_grace: Duration,
    heartbeat: Duration,
}

impl CommandAgent {
    /// Build from a config command line. `None` when the command line is
    /// empty, which disables the phase.
    pub fn from_command(
        name: &str,
        cmdline: &str,
        safeguards: &SafeguardsConfig,
        execution: &ExecutionConfig,
    ) -> Option<Self> {
        let (program, args) = split_command(cmdline)?;
        Some(Self {
            name: name.to_string(),
            program,
            args,
            timeout: Duration::from_secs(safeguards.cycle_time_limit_secs),
            kill_grace: Duration::from_secs(safeguards.kill_grace_secs),
            heartbeat: Duration::from_secs(execution.heartbeat_secs),
        })
    }
}

#[async_trait]
impl CodeAgent for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        prompt: &str,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let mut spec = CommandSpec::new(&self.program, self.args.clone(), workspace);
        spec.stdin = Some(prompt.to_string());
        spec.timeout = self.timeout;
        spec.kill_grace = self.kill_grace;
        spec.heartbeat = self.heartbeat;
        spec.observe = Observe::Heartbeat;
        spec.phase = self.name.clone();
        runner::run(&spec, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs() -> (SafeguardsConfig, ExecutionConfig) {
        (SafeguardsConfig::default(), ExecutionConfig::default())
    }

    #[test]
    fn empty_command_disables_the_agent() {
        let (safeguards, execution) = configs();
        assert!(CommandAgent::from_command("codegen", "", &safeguards, &execution).is_none());
        assert!(CommandAgent::from_command("codegen", "  ", &safeguards, &execution).is_none());
    }

    #[tokio::test]
    async fn agent_receives_prompt_on_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        let (safeguards, execution) = configs();
        let agent =
            CommandAgent::from_command("codegen", "sh -c cat", &safeguards, &execution).unwrap();

        let outcome = agent
            .run("improve the model", tmp.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout, "improve the model\n");
        assert_eq!(agent.name(), "codegen");
    }

    #[tokio::test]
    async fn agent_runs_in_the_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let (safeguards, execution) = configs();
        let agent = CommandAgent::from_command("codegen", "pwd", &safeguards, &execution).unwrap();

        let outcome = agent
            .run("", tmp.path(), &CancellationToken::new())
            .await
            .unwrap();
        let reported = outcome.stdout.trim();
        assert_eq!(
            std::fs::canonicalize(reported).unwrap(),
            std::fs::canonicalize(tmp.path()).unwrap()
        );
    }
}
