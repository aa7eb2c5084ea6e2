use serde::{Deserialize, Serialize};

/// A message in a conversation, containing a role and text content.
///
/// Messages carry the chat history handed to the [`crate::llm::ChatModel`]
/// on each orchestrator step. Tool returns are replayed into the history
/// with the [`Message::TOOL`] role.
///
/// # Examples
///
/// ```
/// use ragbridge::message::Message;
///
/// let user_msg = Message::user("経費精算の締め切りはいつですか？");
/// let assistant_msg = Message::assistant("The deadline is the 25th.");
/// let system_msg = Message::system("You are a bilingual assistant.");
/// assert!(user_msg.has_role(Message::USER));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender (e.g., "user", "assistant", "system", "tool").
    pub role: String,
    /// The text content of the message.
    pub content: String,
}

impl Message {
    /// User input message role.
    pub const USER: &'static str = "user";
    /// AI assistant response message role.
    pub const ASSISTANT: &'static str = "assistant";
    /// System prompt or instruction message role.
    pub const SYSTEM: &'static str = "system";
    /// Tool return message role.
    pub const TOOL: &'static str = "tool";

    /// Creates a new message with the specified role and content.
    #[must_use]
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    /// Creates a user message with the specified content.
    #[must_use]
    pub fn user(content: &str) -> Self {
        Self::new(Self::USER, content)
    }

    /// Creates an assistant message with the specified content.
    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self::new(Self::ASSISTANT, content)
    }

    /// Creates a system message with the specified content.
    #[must_use]
    pub fn system(content: &str) -> Self {
        Self::new(Self::SYSTEM, content)
    }

    /// Creates a tool-return message with the specified content.
    #[must_use]
    pub fn tool(content: &str) -> Self {
        Self::new(Self::TOOL, content)
    }

    /// Returns true if this message has the specified role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }
}
