//! Message and Conversation domain types.
//!
//! These are the core value objects that flow through the entire system:
//! device input becomes a user message → Agent Loop appends it → Backend
//! generates → tool results are appended as `tool` messages.
//!
//! History is append-only: nothing in this crate exposes removal or in-place
//! edits of a pushed message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::Modality;
use crate::tool::ToolResult;

/// Unique identifier for a conversation (session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions and retrieved context
    System,
    /// Tool execution result
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// One part of a multimodal message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Base64-encoded image bytes.
    Image { mime_type: String, data: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn modality(&self) -> Modality {
        match self {
            ContentPart::Text { .. } => Modality::Text,
            ContentPart::Image { .. } => Modality::Image,
        }
    }

    /// `data:` URL form used by OpenAI-style `image_url` parts.
    pub fn data_url(&self) -> Option<String> {
        match self {
            ContentPart::Image { mime_type, data } => Some(format!("data:{mime_type};base64,{data}")),
            ContentPart::Text { .. } => None,
        }
    }
}

/// Message body: plain text, or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// All text in the body, parts joined with a newline.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// The modalities present, in first-seen order without duplicates.
    pub fn modalities(&self) -> Vec<Modality> {
        match self {
            MessageContent::Text(_) => vec![Modality::Text],
            MessageContent::Parts(parts) => {
                let mut seen = Vec::new();
                for part in parts {
                    let m = part.modality();
                    if !seen.contains(&m) {
                        seen.push(m);
                    }
                }
                seen
            }
        }
    }

    pub fn images(&self) -> impl Iterator<Item = &ContentPart> {
        let parts: &[ContentPart] = match self {
            MessageContent::Parts(parts) => parts,
            MessageContent::Text(_) => &[],
        };
        parts.iter().filter(|p| matches!(p, ContentPart::Image { .. }))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(t) => t.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

impl From<Vec<ContentPart>> for MessageContent {
    fn from(parts: Vec<ContentPart>) -> Self {
        MessageContent::Parts(parts)
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// Text or multimodal content
    pub content: MessageContent,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Optional metadata (strategy, error flags, retrieval info)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    fn with_role(role: Role, content: MessageContent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::User, content.into())
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, MessageContent::Text(content.into()))
    }

    /// Create an assistant message carrying tool calls.
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<MessageToolCall>) -> Self {
        let mut msg = Self::assistant(content);
        msg.tool_calls = calls;
        msg
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, MessageContent::Text(content.into()))
    }

    /// Create a tool message from an execution result.
    pub fn tool_result(result: &ToolResult) -> Self {
        let mut msg = Self::with_role(Role::Tool, MessageContent::Text(result.content.clone()));
        msg.tool_call_id = Some(result.tool_call_id.clone());
        if result.is_error {
            msg.metadata.insert("is_error".into(), serde_json::Value::Bool(true));
        }
        msg
    }

    /// Attach a metadata entry, builder style.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Plain text of the content.
    pub fn text(&self) -> String {
        self.content.text()
    }

    /// Whether this is a tool message flagged as a failure.
    pub fn is_error(&self) -> bool {
        self.metadata.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false)
    }
}

/// A tool call embedded in an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageToolCall {
    /// Unique ID for this tool call
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as JSON string
    pub arguments: String,
}

/// A conversation is an ordered sequence of messages with shared context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: ConversationId,

    /// Ordered messages
    messages: Vec<Message>,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// When the last message was added
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new empty conversation.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message. There is no way to remove one.
    pub fn push(&mut self, message: Message) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Get the total token count estimate (rough: 4 chars ≈ 1 token).
    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.text().len() / 4).sum()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "Hello, agent!");
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn conversation_tracks_updates() {
        let mut conv = Conversation::new();
        let created = conv.created_at;

        conv.push(Message::user("First message"));
        assert_eq!(conv.len(), 1);
        assert!(conv.updated_at >= created);
    }

    #[test]
    fn multimodal_content_serializes_as_array() {
        let msg = Message::user(vec![
            ContentPart::text("look here"),
            ContentPart::Image { mime_type: "image/jpeg".into(), data: "AAAA".into() },
        ]);
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["content"].is_array());
        assert_eq!(json["content"][1]["type"], "image");

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.content.modalities(), vec![Modality::Text, Modality::Image]);
    }

    #[test]
    fn text_content_deserializes_from_string() {
        let msg: Message = serde_json::from_value(serde_json::json!({
            "id": "m1",
            "role": "assistant",
            "content": "plain",
            "timestamp": "2025-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(msg.content, MessageContent::Text("plain".into()));
    }

    #[test]
    fn tool_result_message_carries_error_flag() {
        let result = ToolResult::error("call_0", "boom");
        let msg = Message::tool_result(&result);
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_0"));
        assert!(msg.is_error());
    }

    #[test]
    fn image_part_data_url() {
        let part = ContentPart::Image { mime_type: "image/png".into(), data: "Zm9v".into() };
        assert_eq!(part.data_url().as_deref(), Some("data:image/png;base64,Zm9v"));
    }

    #[test]
    fn conversation_token_estimate() {
        let mut conv = Conversation::new();
        // 20 chars ≈ 5 tokens
        conv.push(Message::user("12345678901234567890"));
        assert_eq!(conv.estimated_tokens(), 5);
    }
}
