//! The turn-driving state machine.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::llm::{ChatModel, ChatReply, ToolDefinition};
use crate::message::Message;
use crate::retrieval::{ResultSet, RetrievalEngine};
use crate::rewrite::RewrittenQuery;

use super::tools::{self, ToolInvocation};
use super::{
    AgentEvent, AgentOptions, ChunkRef, ConversationTurn, ToolCallRecord, TurnDecision,
    TurnRequest, TurnState,
};

const SYSTEM_PROMPT: &str = "\
You are a bilingual assistant (English and Japanese) helping users with questions about \
uploaded documents.

Tools available:
- retrieveDocument (query): call when the user asks for information that could be contained \
in documents.
- transferToSupport (reason): call when retrieval is empty or irrelevant.

Flow for document questions:
1) Always call retrieveDocument first.
2) Inspect results:
   - If no documents or chunks, call transferToSupport immediately with a short reason.
   - If chunks exist but do not clearly answer the user's exact ask, call transferToSupport. \
Do not answer from guesswork or general knowledge.
   - Never respond with \"the documents do not contain...\" or other apologies; escalate via \
transferToSupport instead.
   - When escalating, issue an actual transferToSupport tool call with a concise reason. \
Do not just write the reason in plain text.
3) Only when chunks directly answer the question, reply succinctly using that content.
4) After tool calls, give a concise final text message.

Guidelines:
- Always prioritize document content over general knowledge.
- If unsure about document relevance, prefer transferToSupport.
- Keep responses concise and to the point.";

/// Final message when the model (or the budget) hands the turn off.
const HANDOFF_NOTICE: &str =
    "I've handed your question to our support team. Someone will follow up with you shortly.";

/// Final message when the model itself stops responding.
const APOLOGY_NOTICE: &str = "Sorry, I ran into a problem answering that. \
I've handed your question to our support team instead.";

/// What the model asked for next, post-validation.
enum NextAction {
    Say(String),
    Invoke(ToolInvocation),
}

/// Best-effort event forwarding with text slicing.
///
/// The first failed send marks the receiver gone; later events are
/// dropped silently and the turn runs to completion regardless.
struct EventSink {
    sender: flume::Sender<AgentEvent>,
    open: bool,
    slice_chars: usize,
}

impl EventSink {
    fn emit(&mut self, event: AgentEvent) {
        if !self.open {
            return;
        }
        if self.sender.send(event).is_err() {
            debug!("event receiver dropped, continuing without streaming");
            self.open = false;
        }
    }

    /// Streams `text` as fixed-width character slices.
    fn stream_text(&mut self, text: &str) {
        let width = self.slice_chars.max(1);
        let mut slice = String::with_capacity(width);
        let mut len = 0usize;
        for ch in text.chars() {
            slice.push(ch);
            len += 1;
            if len == width {
                self.emit(AgentEvent::TokenDelta {
                    token: std::mem::take(&mut slice),
                });
                len = 0;
            }
        }
        if !slice.is_empty() {
            self.emit(AgentEvent::TokenDelta { token: slice });
        }
    }
}

/// Running per-turn bookkeeping: log, attributions, tools used.
#[derive(Default)]
struct TurnLedger {
    tool_log: Vec<ToolCallRecord>,
    tools_used: Vec<String>,
    document_ids: Vec<String>,
    chunks: Vec<ChunkRef>,
    rewritten: Option<RewrittenQuery>,
}

impl TurnLedger {
    fn record_use(&mut self, tool_name: &str) {
        if !self.tools_used.iter().any(|name| name == tool_name) {
            self.tools_used.push(tool_name.to_string());
        }
    }

    fn absorb(&mut self, result: &ResultSet) {
        if self.rewritten.is_none() {
            self.rewritten = result.rewritten.clone();
        }
        for doc_id in &result.document_ids {
            if !self.document_ids.contains(doc_id) {
                self.document_ids.push(doc_id.clone());
            }
        }
        for chunk in &result.chunks {
            if !self.chunks.iter().any(|c| c.chunk_id == chunk.chunk_id) {
                self.chunks.push(ChunkRef {
                    chunk_id: chunk.chunk_id.clone(),
                    document_id: chunk.document_id.clone(),
                });
            }
        }
    }

    fn notice(&self) -> AgentEvent {
        AgentEvent::ToolNotice {
            log: self.tool_log.clone(),
            document_ids: self.document_ids.clone(),
            chunks: self.chunks.clone(),
        }
    }
}

/// Runs conversation turns against the chat model and retrieval engine.
///
/// Stateless across turns; safe to share and call concurrently.
pub struct AgentOrchestrator {
    model: Arc<dyn ChatModel>,
    engine: RetrievalEngine,
    options: AgentOptions,
    tool_defs: Vec<ToolDefinition>,
}

impl AgentOrchestrator {
    pub fn new(model: Arc<dyn ChatModel>, engine: RetrievalEngine, options: AgentOptions) -> Self {
        Self {
            model,
            engine,
            options,
            tool_defs: tools::tool_definitions(),
        }
    }

    /// Drives one turn to completion.
    ///
    /// Emits ordered progress events on `events` and always returns a
    /// completed [`ConversationTurn`]; internal failures surface as an
    /// escalation, never an error.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        events: flume::Sender<AgentEvent>,
    ) -> ConversationTurn {
        let session_id = request.session_or_new();
        info!(session_id, message = %request.user_message, "turn started");

        let mut sink = EventSink {
            sender: events,
            open: true,
            slice_chars: self.options.stream_slice_chars,
        };
        let mut ledger = TurnLedger::default();
        let mut state = TurnState::Start;

        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(Message::system(SYSTEM_PROMPT));
        messages.extend(request.history.iter().cloned());
        messages.push(Message::user(&request.user_message));

        let mut tool_invocations = 0usize;
        let (assistant_message, decision) = loop {
            let action = match self.next_action(&messages).await {
                Some(action) => action,
                None => {
                    // Two consecutive model failures. Hand off instead of
                    // surfacing an internal error.
                    state = TurnState::Escalated;
                    break (APOLOGY_NOTICE.to_string(), TurnDecision::Escalated);
                }
            };

            match action {
                NextAction::Say(text) => {
                    state = match state {
                        TurnState::Start => TurnState::DirectAnswer,
                        _ => TurnState::Answering,
                    };
                    break (text, TurnDecision::Answered);
                }
                NextAction::Invoke(invocation) => {
                    if tool_invocations >= self.options.tool_call_budget {
                        warn!(
                            session_id,
                            budget = self.options.tool_call_budget,
                            "tool budget exhausted, forcing escalation"
                        );
                        state = TurnState::Escalated;
                        break (HANDOFF_NOTICE.to_string(), TurnDecision::Escalated);
                    }
                    tool_invocations += 1;
                    ledger.record_use(invocation.name());

                    match invocation {
                        ToolInvocation::RetrieveDocument { query } => {
                            state = TurnState::Retrieving;
                            ledger
                                .tool_log
                                .push(ToolCallRecord::call(tools::RETRIEVE_DOCUMENT, json!({ "query": query })));
                            sink.emit(ledger.notice());

                            let result = self.engine.retrieve(&query).await;
                            ledger.absorb(&result);

                            let payload = retrieval_payload(&result);
                            ledger.tool_log.push(ToolCallRecord::ret(
                                tools::RETRIEVE_DOCUMENT,
                                json!({
                                    "document_ids": result.document_ids,
                                    "chunks_count": result.chunks.len(),
                                }),
                            ));
                            sink.emit(ledger.notice());
                            messages.push(Message::tool(&payload.to_string()));
                        }
                        ToolInvocation::TransferToSupport { reason } => {
                            state = TurnState::Escalated;
                            ledger
                                .tool_log
                                .push(ToolCallRecord::call(tools::TRANSFER_TO_SUPPORT, json!({ "reason": reason })));
                            sink.emit(ledger.notice());

                            let handoff = format!("Call support with reason: {reason}");
                            info!(session_id, reason = %reason, "escalating to support");
                            ledger.tool_log.push(ToolCallRecord::ret(
                                tools::TRANSFER_TO_SUPPORT,
                                json!(handoff),
                            ));
                            sink.emit(ledger.notice());
                            break (HANDOFF_NOTICE.to_string(), TurnDecision::Escalated);
                        }
                    }
                }
            }
        };

        sink.stream_text(&assistant_message);
        debug!(session_id, resolved = ?state, ?decision, "turn entering Done");

        ledger.tools_used.sort();
        let turn = ConversationTurn {
            session_id,
            user_message: request.user_message,
            rewritten_query: ledger.rewritten,
            assistant_message,
            decision,
            cited_documents: ledger.document_ids,
            tools_used: ledger.tools_used,
            cited_chunks: ledger.chunks,
            tool_log: ledger.tool_log,
        };
        sink.emit(AgentEvent::Final(turn.clone()));
        info!(
            session_id = %turn.session_id,
            decision = ?turn.decision,
            tools = turn.tools_used.len(),
            "turn finished"
        );
        turn
    }

    /// Asks the model for its next move, retrying once.
    ///
    /// A transport error, an empty reply, or an invalid tool call all
    /// count as a failed attempt. `None` after the retry means forced
    /// escalation.
    async fn next_action(&self, messages: &[Message]) -> Option<NextAction> {
        for attempt in 0..2 {
            match self.model.complete(messages, &self.tool_defs).await {
                Ok(reply) => match validate_reply(reply) {
                    Ok(action) => return Some(action),
                    Err(reason) => {
                        warn!(attempt, reason, "model reply rejected");
                    }
                },
                Err(err) => {
                    warn!(attempt, error = %err, "model call failed");
                }
            }
        }
        None
    }
}

fn validate_reply(reply: ChatReply) -> Result<NextAction, &'static str> {
    if let Some(call) = reply.tool_call {
        return match ToolInvocation::parse(&call) {
            Ok(invocation) => Ok(NextAction::Invoke(invocation)),
            Err(_) => Err("unparseable tool call"),
        };
    }
    match reply.text {
        Some(text) if !text.trim().is_empty() => {
            if narrates_transfer(&text) {
                return Err("transfer narrated in text instead of a tool call");
            }
            Ok(NextAction::Say(text))
        }
        _ => Err("empty reply"),
    }
}

/// A hand-off must go through the transferToSupport tool; free text that
/// merely talks about transferring the user is not an escalation. The
/// tool's own return phrase is exempt so a final message echoing it
/// passes.
fn narrates_transfer(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("transfer")
        && lowered.contains("support")
        && !lowered.contains("call support with reason")
}

/// The full tool return appended to the conversation: everything the
/// model needs to ground or reject its answer.
fn retrieval_payload(result: &ResultSet) -> serde_json::Value {
    json!({
        "document_ids": result.document_ids,
        "chunks": result
            .chunks
            .iter()
            .map(|chunk| {
                json!({
                    "chunk_id": chunk.chunk_id,
                    "document_id": chunk.document_id,
                    "text": chunk.text,
                    "score": chunk.score,
                })
            })
            .collect::<Vec<_>>(),
    })
}
