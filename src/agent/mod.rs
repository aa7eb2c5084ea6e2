//! Tool-calling conversation orchestration.
//!
//! Each user turn runs a bounded finite-state machine rather than a
//! free-form agent loop:
//!
//! ```text
//!        Start ──text──▶ DirectAnswer ─────────┐
//!          │                                   │
//!          └─retrieveDocument─▶ Retrieving     ▼
//!                 │                │         Done
//!                 │           text │           ▲
//!                 │                ▼           │
//!                 │            Answering ──────┤
//!                 │                            │
//!                 └─transferToSupport─▶ Escalated
//! ```
//!
//! The model sees exactly two tools. A per-turn tool budget, a single
//! LLM retry, and a fixed hand-off message guarantee every turn ends in
//! `Done` with either an answer or an escalation, never a raw error.
//!
//! Callers receive progress over a [`flume`] channel: zero or more
//! [`AgentEvent::TokenDelta`] and [`AgentEvent::ToolNotice`] events in
//! order, then exactly one [`AgentEvent::Final`]. A dropped receiver
//! stops forwarding but never aborts the turn.

mod orchestrator;
pub mod tools;

pub use orchestrator::AgentOrchestrator;
pub use tools::ToolInvocation;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;
use crate::rewrite::RewrittenQuery;

/// Tuning knobs for the orchestrator.
#[derive(Clone, Copy, Debug)]
pub struct AgentOptions {
    /// Tool invocations allowed per turn before a forced escalation.
    pub tool_call_budget: usize,
    /// Character width of streamed token delta slices.
    pub stream_slice_chars: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            tool_call_budget: 4,
            stream_slice_chars: 60,
        }
    }
}

/// FSM states for one conversation turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    Start,
    DirectAnswer,
    Retrieving,
    Answering,
    Escalated,
    Done,
}

/// How the turn concluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDecision {
    Answered,
    Escalated,
}

/// A reference to a retrieved chunk, for attribution payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub chunk_id: String,
    pub document_id: String,
}

/// Direction of a tool log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRecordKind {
    Call,
    Return,
}

/// One entry in the per-turn tool log. Every invocation produces a
/// `Call` record and, if it executed, a matching `Return` record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub kind: ToolRecordKind,
    pub tool_name: String,
    /// Arguments for calls, `Null` for returns.
    pub arguments: serde_json::Value,
    /// Result summary for returns, `None` for calls.
    pub result: Option<serde_json::Value>,
}

impl ToolCallRecord {
    pub fn call(tool_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            kind: ToolRecordKind::Call,
            tool_name: tool_name.into(),
            arguments,
            result: None,
        }
    }

    pub fn ret(tool_name: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            kind: ToolRecordKind::Return,
            tool_name: tool_name.into(),
            arguments: serde_json::Value::Null,
            result: Some(result),
        }
    }
}

/// The structured outcome of a completed turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub session_id: String,
    pub user_message: String,
    /// The bilingual rewrite used for retrieval, when retrieval ran.
    pub rewritten_query: Option<RewrittenQuery>,
    pub assistant_message: String,
    pub decision: TurnDecision,
    /// Distinct documents surfaced by retrieval, first-seen order.
    pub cited_documents: Vec<String>,
    /// Tool names invoked this turn, sorted.
    pub tools_used: Vec<String>,
    /// Deduplicated chunk references backing the answer.
    pub cited_chunks: Vec<ChunkRef>,
    pub tool_log: Vec<ToolCallRecord>,
}

/// Progress events for one turn, in emission order.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A slice of assistant text.
    TokenDelta { token: String },
    /// The running tool log plus current attributions, emitted after
    /// every tool call and return.
    ToolNotice {
        log: Vec<ToolCallRecord>,
        document_ids: Vec<String>,
        chunks: Vec<ChunkRef>,
    },
    /// The completed turn. Emitted exactly once, last.
    Final(ConversationTurn),
}

/// Creates the event channel for [`AgentOrchestrator::run_turn`].
pub fn event_channel() -> (flume::Sender<AgentEvent>, flume::Receiver<AgentEvent>) {
    flume::unbounded()
}

/// Input to one conversation turn.
#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub user_message: String,
    /// Reused when set, otherwise a fresh id is minted for the turn.
    pub session_id: Option<String>,
    /// Prior turns, oldest first. User and assistant roles only.
    pub history: Vec<Message>,
}

impl TurnRequest {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            session_id: None,
            history: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub(crate) fn session_or_new(&self) -> String {
        self.session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_request_mints_session_when_unset() {
        let request = TurnRequest::new("hello");
        assert!(!request.session_or_new().is_empty());
        let pinned = TurnRequest::new("hello").with_session("s-1");
        assert_eq!(pinned.session_or_new(), "s-1");
    }

    #[test]
    fn events_serialize_with_type_tags() {
        let event = AgentEvent::TokenDelta {
            token: "hi".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "token_delta");
        assert_eq!(json["token"], "hi");
    }

    #[test]
    fn tool_log_records_pair_up() {
        let call = ToolCallRecord::call("retrieveDocument", serde_json::json!({"query": "q"}));
        let ret = ToolCallRecord::ret("retrieveDocument", serde_json::json!({"chunks_count": 2}));
        assert_eq!(call.kind, ToolRecordKind::Call);
        assert!(call.result.is_none());
        assert_eq!(ret.kind, ToolRecordKind::Return);
        assert_eq!(ret.arguments, serde_json::Value::Null);
    }
}
