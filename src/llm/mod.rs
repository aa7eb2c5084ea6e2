//! Chat model seam for the agent loop and query rewriter.
//!
//! [`ChatModel`] is the one suspension point of a conversation turn: given
//! the context so far and a closed set of callable tools, the model answers
//! with either plain text or exactly one tool invocation. The production
//! implementation is [`OpenAiChatModel`]; [`ScriptedChatModel`] drives the
//! deterministic tests.

pub mod openai;

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::Message;

pub use openai::OpenAiChatModel;

/// Errors raised by chat model calls.
///
/// A malformed tool payload is deliberately an error rather than a reply
/// variant: the orchestrator treats it exactly like a transport failure
/// (retry once, then escalate).
#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    /// Transport-level failure reaching the endpoint.
    #[error("chat request failed: {0}")]
    #[diagnostic(code(ragbridge::llm::transport))]
    Transport(String),

    /// The endpoint answered with a non-success status.
    #[error("chat endpoint returned {status}: {body}")]
    #[diagnostic(code(ragbridge::llm::status))]
    Status { status: u16, body: String },

    /// The response carried neither text nor a parseable tool call.
    #[error("chat response malformed: {0}")]
    #[diagnostic(code(ragbridge::llm::malformed))]
    Malformed(String),
}

/// Wire description of a callable tool, in function-calling form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool arguments.
    pub parameters: serde_json::Value,
}

/// A tool invocation as returned by the model, before validation against
/// the closed tool set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One model reply: plain text or one tool invocation.
#[derive(Clone, Debug, Default)]
pub struct ChatReply {
    pub text: Option<String>,
    pub tool_call: Option<RawToolCall>,
}

impl ChatReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            text: Some(content.into()),
            tool_call: None,
        }
    }

    pub fn tool(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            text: None,
            tool_call: Some(RawToolCall {
                name: name.into(),
                arguments,
            }),
        }
    }
}

/// An LLM that converses and may invoke one tool per reply.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Produces the next reply for `messages`, optionally choosing from
    /// `tools`. Pass an empty tool slice for plain completions.
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChatReply, LlmError>;
}

/// A pre-programmed reply for [`ScriptedChatModel`].
#[derive(Clone, Debug)]
pub enum ScriptedReply {
    /// Answer with plain text.
    Text(String),
    /// Invoke a tool with the given arguments.
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    /// Fail the call with a transport error.
    Fail(String),
}

/// Deterministic chat model for tests and offline demos.
///
/// Replies are consumed front-to-back; running out of script is a
/// transport error, which exercises the orchestrator's failure path.
/// Every observed request is recorded for assertions.
#[derive(Default)]
pub struct ScriptedChatModel {
    replies: Mutex<std::collections::VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedChatModel {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of calls observed so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Snapshot of the message context of each observed call.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<ChatReply, LlmError> {
        self.requests.lock().push(messages.to_vec());
        let next = self.replies.lock().pop_front();
        match next {
            Some(ScriptedReply::Text(text)) => Ok(ChatReply::text(text)),
            Some(ScriptedReply::ToolCall { name, arguments }) => {
                Ok(ChatReply::tool(name, arguments))
            }
            Some(ScriptedReply::Fail(reason)) => Err(LlmError::Transport(reason)),
            None => Err(LlmError::Transport("script exhausted".to_string())),
        }
    }
}
