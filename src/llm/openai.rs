//! Chat client for OpenAI-compatible `/chat/completions` endpoints.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Settings;
use crate::embeddings::join_endpoint;
use crate::message::Message;

use super::{ChatModel, ChatReply, LlmError, RawToolCall, ToolDefinition};

/// Client for an OpenAI-compatible chat endpoint with function calling.
///
/// Requests pin temperature and nucleus sampling to zero and disable
/// parallel tool calls so each reply carries at most one invocation, which
/// is what the orchestrator's state machine consumes.
pub struct OpenAiChatModel {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    temperature: f32,
    top_p: f32,
    parallel_tool_calls: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolDefinition,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Default)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    function: WireFunctionCall,
}

#[derive(Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON-encoded argument object, per the function-calling wire format.
    arguments: String,
}

impl OpenAiChatModel {
    /// Creates a client from settings.
    pub fn new(settings: &Settings) -> Result<Self, LlmError> {
        Self::with_endpoint(
            &settings.openai_base_url,
            &settings.openai_api_key,
            &settings.chat_model,
        )
    }

    /// Creates a client against an explicit base URL.
    pub fn with_endpoint(base_url: &Url, api_key: &str, model: &str) -> Result<Self, LlmError> {
        let endpoint = join_endpoint(base_url, "chat/completions")
            .map_err(|err| LlmError::Transport(err.to_string()))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| LlmError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    fn wire_messages(messages: &[Message]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|message| {
                // Tool returns are replayed as user content; the ChatModel
                // seam does not carry tool-call ids across turns.
                if message.has_role(Message::TOOL) {
                    WireMessage {
                        role: Message::USER.to_string(),
                        content: format!("[tool result] {}", message.content),
                    }
                } else {
                    WireMessage {
                        role: message.role.clone(),
                        content: message.content.clone(),
                    }
                }
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChatReply, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: Self::wire_messages(messages),
            temperature: 0.0,
            top_p: 0.0,
            parallel_tool_calls: false,
            tools: tools
                .iter()
                .map(|tool| WireTool {
                    kind: "function",
                    function: tool,
                })
                .collect(),
        };

        let mut builder = self.client.post(self.endpoint.clone()).json(&request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|err| LlmError::Malformed(err.to_string()))?;
        let choice = payload
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Malformed("response carried no choices".to_string()))?;

        if let Some(call) = choice.message.tool_calls.into_iter().next() {
            let arguments: serde_json::Value = serde_json::from_str(&call.function.arguments)
                .map_err(|err| {
                    LlmError::Malformed(format!(
                        "tool arguments for {} are not valid JSON: {err}",
                        call.function.name
                    ))
                })?;
            return Ok(ChatReply {
                text: choice.message.content.filter(|text| !text.is_empty()),
                tool_call: Some(RawToolCall {
                    name: call.function.name,
                    arguments,
                }),
            });
        }

        match choice.message.content {
            Some(text) if !text.is_empty() => Ok(ChatReply::text(text)),
            _ => Err(LlmError::Malformed(
                "response carried neither text nor a tool call".to_string(),
            )),
        }
    }
}
