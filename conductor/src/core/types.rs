//! Shared types for worker conversations and invocation attempts.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a pipeline worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Planner,
    Extractor,
    Coder,
    Reviewer,
    Writer,
    Arbiter,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 6] = [
        WorkerRole::Planner,
        WorkerRole::Extractor,
        WorkerRole::Coder,
        WorkerRole::Reviewer,
        WorkerRole::Writer,
        WorkerRole::Arbiter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerRole::Planner => "planner",
            WorkerRole::Extractor => "extractor",
            WorkerRole::Coder => "coder",
            WorkerRole::Reviewer => "reviewer",
            WorkerRole::Writer => "writer",
            WorkerRole::Arbiter => "arbiter",
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerRole {
    Orchestrator,
    Worker,
}

/// One recorded message in a worker conversation.
///
/// Turns are appended in order and never edited once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub speaker: SpeakerRole,
    pub content: String,
    /// The turn requests (or carries) an external tool invocation.
    #[serde(default)]
    pub tool_call: bool,
}

impl ConversationTurn {
    pub fn orchestrator(content: impl Into<String>) -> Self {
        Self {
            speaker: SpeakerRole::Orchestrator,
            content: content.into(),
            tool_call: false,
        }
    }

    pub fn worker(content: impl Into<String>) -> Self {
        Self {
            speaker: SpeakerRole::Worker,
            content: content.into(),
            tool_call: false,
        }
    }

    /// A worker turn that asks for a tool and expects a result turn next.
    pub fn tool_request(content: impl Into<String>) -> Self {
        Self {
            speaker: SpeakerRole::Worker,
            content: content.into(),
            tool_call: true,
        }
    }
}

/// Result classification for a single invocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Validated,
    /// No structurally valid candidate was found in the reply.
    ParseFailed,
    /// A candidate parsed but failed field validation.
    SchemaInvalid,
    Empty,
    /// The reply contains reasoning-leak markers.
    ThinkingLeak,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Validated => "validated",
            AttemptOutcome::ParseFailed => "parse_failed",
            AttemptOutcome::SchemaInvalid => "schema_invalid",
            AttemptOutcome::Empty => "empty",
            AttemptOutcome::ThinkingLeak => "thinking_leak",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one attempt inside a validating invocation.
///
/// Owned by the invocation that produced it and dropped when the call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationAttempt {
    /// 1-based attempt number.
    pub index: u32,
    pub prompt: String,
    pub raw_reply: String,
    pub candidate: Option<String>,
    pub outcome: AttemptOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_roles_serialize_lowercase() {
        let json = serde_json::to_string(&WorkerRole::Arbiter).expect("serialize");
        assert_eq!(json, "\"arbiter\"");
        for role in WorkerRole::ALL {
            let parsed: WorkerRole =
                serde_json::from_str(&format!("\"{}\"", role.as_str())).expect("parse");
            assert_eq!(parsed, role);
        }
    }

    #[test]
    fn tool_request_turns_are_worker_turns() {
        let turn = ConversationTurn::tool_request("search for prices");
        assert_eq!(turn.speaker, SpeakerRole::Worker);
        assert!(turn.tool_call);
        assert!(!ConversationTurn::worker("done").tool_call);
    }
}
