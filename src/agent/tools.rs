//! The closed tool set exposed to the chat model.

use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

use crate::llm::{RawToolCall, ToolDefinition};

pub const RETRIEVE_DOCUMENT: &str = "retrieveDocument";
pub const TRANSFER_TO_SUPPORT: &str = "transferToSupport";

/// A tool call the model may make, parsed and validated.
///
/// The set is closed on purpose: the orchestrator matches on this enum
/// instead of dispatching through a tool registry.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolInvocation {
    RetrieveDocument { query: String },
    TransferToSupport { reason: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum ToolParseError {
    #[error("model requested unknown tool '{name}'")]
    #[diagnostic(code(ragbridge::agent::unknown_tool))]
    UnknownTool { name: String },

    #[error("bad arguments for tool '{name}': {reason}")]
    #[diagnostic(code(ragbridge::agent::bad_tool_arguments))]
    BadArguments { name: String, reason: String },
}

impl ToolInvocation {
    /// Validates a raw model tool call against the closed tool set.
    pub fn parse(call: &RawToolCall) -> Result<Self, ToolParseError> {
        match call.name.as_str() {
            RETRIEVE_DOCUMENT => {
                let query = required_string(call, "query")?;
                Ok(Self::RetrieveDocument { query })
            }
            TRANSFER_TO_SUPPORT => {
                let reason = required_string(call, "reason")?;
                Ok(Self::TransferToSupport { reason })
            }
            other => Err(ToolParseError::UnknownTool {
                name: other.to_string(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RetrieveDocument { .. } => RETRIEVE_DOCUMENT,
            Self::TransferToSupport { .. } => TRANSFER_TO_SUPPORT,
        }
    }
}

fn required_string(call: &RawToolCall, field: &str) -> Result<String, ToolParseError> {
    match call.arguments.get(field).and_then(|v| v.as_str()) {
        Some(value) if !value.trim().is_empty() => Ok(value.to_string()),
        Some(_) => Err(ToolParseError::BadArguments {
            name: call.name.clone(),
            reason: format!("'{field}' is empty"),
        }),
        None => Err(ToolParseError::BadArguments {
            name: call.name.clone(),
            reason: format!("missing string field '{field}'"),
        }),
    }
}

/// Definitions advertised to the model on every completion call.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: RETRIEVE_DOCUMENT.to_string(),
            description: "Search the uploaded documents for passages relevant to a query. \
                          Call this before answering any factual question about documents."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query, in the user's words."
                    }
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: TRANSFER_TO_SUPPORT.to_string(),
            description: "Hand the conversation to human support. Call this when retrieval \
                          finds nothing relevant or the documents do not answer the question."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "A short reason for the hand-off."
                    }
                },
                "required": ["reason"]
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retrieve_document() {
        let call = RawToolCall {
            name: RETRIEVE_DOCUMENT.to_string(),
            arguments: json!({"query": "reset password"}),
        };
        assert_eq!(
            ToolInvocation::parse(&call).unwrap(),
            ToolInvocation::RetrieveDocument {
                query: "reset password".to_string()
            }
        );
    }

    #[test]
    fn parses_transfer_to_support() {
        let call = RawToolCall {
            name: TRANSFER_TO_SUPPORT.to_string(),
            arguments: json!({"reason": "no relevant documents"}),
        };
        assert_eq!(
            ToolInvocation::parse(&call).unwrap(),
            ToolInvocation::TransferToSupport {
                reason: "no relevant documents".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_tool() {
        let call = RawToolCall {
            name: "deleteEverything".to_string(),
            arguments: json!({}),
        };
        assert!(matches!(
            ToolInvocation::parse(&call),
            Err(ToolParseError::UnknownTool { .. })
        ));
    }

    #[test]
    fn rejects_missing_or_empty_arguments() {
        let missing = RawToolCall {
            name: RETRIEVE_DOCUMENT.to_string(),
            arguments: json!({}),
        };
        assert!(matches!(
            ToolInvocation::parse(&missing),
            Err(ToolParseError::BadArguments { .. })
        ));
        let empty = RawToolCall {
            name: TRANSFER_TO_SUPPORT.to_string(),
            arguments: json!({"reason": "  "}),
        };
        assert!(matches!(
            ToolInvocation::parse(&empty),
            Err(ToolParseError::BadArguments { .. })
        ));
    }

    #[test]
    fn advertises_both_tools() {
        let defs = tool_definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec![RETRIEVE_DOCUMENT, TRANSFER_TO_SUPPORT]);
    }
}
