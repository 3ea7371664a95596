//! Worker transport abstraction.
//!
//! The [`WorkerTransport`] trait decouples invocation logic from the actual
//! model backend. [`CommandTransport`] spawns one configured CLI per worker,
//! feeding the conversation on stdin and reading the reply from stdout. Tests
//! use scripted transports that return predetermined turns.

use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::types::{ConversationTurn, SpeakerRole, WorkerRole};
use crate::io::config::PipelineConfig;
use crate::io::process::run_command_with_timeout;

/// Transport-level failures.
///
/// A timeout is an ordinary unusable reply; an unreachable worker ends the run.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("worker {worker} did not answer within {timeout:?}")]
    TimedOut {
        worker: WorkerRole,
        timeout: Duration,
    },
    #[error("worker {worker} is unreachable: {reason}")]
    Unreachable { worker: WorkerRole, reason: String },
}

/// Sends a conversation to a worker and returns the turns it produced.
pub trait WorkerTransport {
    fn send(
        &self,
        worker: WorkerRole,
        conversation: &[ConversationTurn],
        timeout: Duration,
    ) -> Result<Vec<ConversationTurn>, TransportError>;
}

/// Transport that runs a CLI per worker (`ollama run <model>` by default).
#[derive(Debug, Clone)]
pub struct CommandTransport {
    commands: BTreeMap<WorkerRole, Vec<String>>,
    output_limit_bytes: usize,
}

impl CommandTransport {
    pub fn new(config: &PipelineConfig) -> Self {
        let commands = WorkerRole::ALL
            .into_iter()
            .map(|role| (role, config.workers.get(role).command.clone()))
            .collect();
        Self {
            commands,
            output_limit_bytes: config.invoker.reply_limit_bytes,
        }
    }
}

impl WorkerTransport for CommandTransport {
    #[instrument(skip_all, fields(worker = %worker, turns = conversation.len(), timeout_secs = timeout.as_secs()))]
    fn send(
        &self,
        worker: WorkerRole,
        conversation: &[ConversationTurn],
        timeout: Duration,
    ) -> Result<Vec<ConversationTurn>, TransportError> {
        let argv = self
            .commands
            .get(&worker)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| TransportError::Unreachable {
                worker,
                reason: "no command configured".to_string(),
            })?;
        info!(program = %argv[0], "sending conversation to worker");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        let transcript = render_transcript(conversation);

        let output = run_command_with_timeout(
            cmd,
            Some(transcript.as_bytes()),
            timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| TransportError::Unreachable {
            worker,
            reason: format!("{err:#}"),
        })?;

        if output.timed_out {
            return Err(TransportError::TimedOut { worker, timeout });
        }
        if !output.status.success() {
            warn!(
                exit_code = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "worker command failed, treating reply as empty"
            );
            return Ok(vec![ConversationTurn::worker(String::new())]);
        }

        let reply = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(reply_bytes = reply.len(), "worker replied");
        Ok(vec![ConversationTurn::worker(reply)])
    }
}

/// Flatten a conversation into the text fed to a stateless CLI.
///
/// A single orchestrator turn is sent verbatim; longer conversations are
/// rendered as labelled sections.
pub fn render_transcript(conversation: &[ConversationTurn]) -> String {
    if let [only] = conversation
        && only.speaker == SpeakerRole::Orchestrator
    {
        return only.content.clone();
    }
    conversation
        .iter()
        .map(|turn| {
            let label = match (turn.speaker, turn.tool_call) {
                (SpeakerRole::Orchestrator, _) => "orchestrator",
                (SpeakerRole::Worker, true) => "worker (tool call)",
                (SpeakerRole::Worker, false) => "worker",
            };
            format!("### {label}\n{}", turn.content.trim())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_prompt_is_sent_verbatim() {
        let conversation = vec![ConversationTurn::orchestrator("Plan this task.")];
        assert_eq!(render_transcript(&conversation), "Plan this task.");
    }

    #[test]
    fn multi_turn_conversation_is_labelled() {
        let conversation = vec![
            ConversationTurn::orchestrator("Find the price."),
            ConversationTurn::tool_request("search(\"phone\")"),
            ConversationTurn::orchestrator("Result: 139 990 руб"),
        ];
        let text = render_transcript(&conversation);
        assert_eq!(
            text,
            "### orchestrator\nFind the price.\n\n### worker (tool call)\nsearch(\"phone\")\n\n### orchestrator\nResult: 139 990 руб"
        );
    }

    #[cfg(unix)]
    fn transport_with(coder: &[&str]) -> CommandTransport {
        let mut config = PipelineConfig::default();
        config.workers.coder.command = coder.iter().map(ToString::to_string).collect();
        CommandTransport::new(&config)
    }

    #[cfg(unix)]
    #[test]
    fn command_stdout_becomes_worker_turn() {
        let transport = transport_with(&["sh", "-c", "read line; echo \"got: $line\""]);
        let turns = transport
            .send(
                WorkerRole::Coder,
                &[ConversationTurn::orchestrator("hello")],
                Duration::from_secs(10),
            )
            .expect("send");
        assert_eq!(turns, vec![ConversationTurn::worker("got: hello")]);
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_yields_empty_turn() {
        let transport = transport_with(&["sh", "-c", "echo partial; exit 3"]);
        let turns = transport
            .send(
                WorkerRole::Coder,
                &[ConversationTurn::orchestrator("hello")],
                Duration::from_secs(10),
            )
            .expect("send");
        assert_eq!(turns, vec![ConversationTurn::worker("")]);
    }

    #[cfg(unix)]
    #[test]
    fn slow_command_times_out() {
        let transport = transport_with(&["sh", "-c", "exec sleep 5"]);
        let err = transport
            .send(
                WorkerRole::Coder,
                &[ConversationTurn::orchestrator("hello")],
                Duration::from_millis(200),
            )
            .expect_err("timeout");
        assert!(matches!(err, TransportError::TimedOut { worker: WorkerRole::Coder, .. }));
    }

    #[test]
    fn missing_binary_is_unreachable() {
        let mut config = PipelineConfig::default();
        config.workers.planner.command = vec!["definitely-not-a-real-binary-xyz".to_string()];
        let transport = CommandTransport::new(&config);
        let err = transport
            .send(
                WorkerRole::Planner,
                &[ConversationTurn::orchestrator("hello")],
                Duration::from_secs(1),
            )
            .expect_err("unreachable");
        assert!(matches!(err, TransportError::Unreachable { worker: WorkerRole::Planner, .. }));
    }
}
