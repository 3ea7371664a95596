//! Decide when a worker's message stream has produced its final answer.

use serde_json::Value;

use crate::core::extract::{balanced_object, strip_reasoning};
use crate::core::schema::SchemaKind;
use crate::core::types::ConversationTurn;

const TOOL_CALL_MARKERS: [&str; 2] = ["tool call", "tool_calls"];

/// Fixed inputs for the termination rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationRules {
    /// Content that ends a conversation outright.
    pub end_token: String,
    /// Turns shorter than this (in chars, after trimming) end the conversation.
    pub min_reply_chars: usize,
    /// Stripped before looking for a schema signature.
    pub leak_markers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    AwaitingReply,
    /// A tool was requested; the next turn is its result, not an answer.
    ToolPending,
    Done,
}

/// State machine over one worker conversation.
#[derive(Debug, Clone)]
pub struct TerminationDetector<'a> {
    rules: &'a TerminationRules,
    state: TerminationState,
}

impl<'a> TerminationDetector<'a> {
    pub fn new(rules: &'a TerminationRules) -> Self {
        Self {
            rules,
            state: TerminationState::AwaitingReply,
        }
    }

    pub fn state(&self) -> TerminationState {
        self.state
    }

    /// Feed the next turn and return the new state.
    pub fn observe(&mut self, turn: &ConversationTurn) -> TerminationState {
        self.state = match self.state {
            TerminationState::Done => TerminationState::Done,
            _ if mentions_tool_call(turn) => TerminationState::ToolPending,
            TerminationState::ToolPending => TerminationState::AwaitingReply,
            TerminationState::AwaitingReply if self.is_final(turn) => TerminationState::Done,
            TerminationState::AwaitingReply => TerminationState::AwaitingReply,
        };
        self.state
    }

    fn is_final(&self, turn: &ConversationTurn) -> bool {
        let content = turn.content.trim();
        content == self.rules.end_token
            || content.chars().count() < self.rules.min_reply_chars
            || carries_schema_signature(content, &self.rules.leak_markers)
    }
}

/// Whether a turn requests or reports an external tool invocation.
pub fn mentions_tool_call(turn: &ConversationTurn) -> bool {
    if turn.tool_call {
        return true;
    }
    let lowered = turn.content.to_lowercase();
    TOOL_CALL_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn carries_schema_signature(content: &str, leak_markers: &[String]) -> bool {
    let mut cleaned = strip_reasoning(content).into_owned();
    for marker in leak_markers {
        cleaned = cleaned.replace(marker.as_str(), "");
    }
    let Some(object) = balanced_object(&cleaned)
        .and_then(|candidate| serde_json::from_str::<Value>(candidate).ok())
    else {
        return false;
    };
    let Some(fields) = object.as_object() else {
        return false;
    };
    SchemaKind::ALL.iter().any(|kind| {
        kind.signature()
            .iter()
            .all(|field| fields.contains_key(*field))
    })
}
