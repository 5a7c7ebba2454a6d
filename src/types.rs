//! Core types for the chat core

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// One completed exchange from the conversation store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// What the user asked
    pub user_text: String,

    /// What the assistant answered
    pub assistant_text: String,
}

impl Turn {
    pub fn new(user_text: impl Into<String>, assistant_text: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
            assistant_text: assistant_text.into(),
        }
    }
}

/// Message role in the conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Content segment types that can appear in messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentSegment {
    /// Answer text
    Text { text: String },

    /// The model's intermediate thinking trace.
    ///
    /// `signature` is the provider's seal over the trace; only signed traces can be
    /// sent back to the model.
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    /// A tool invocation requested by the model
    ToolUse {
        id: String,
        name: String,
        arguments: Value,
    },

    /// The outcome of a tool invocation, fed back to the model
    ToolResult {
        id: String,
        payload: Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentSegment {
    pub fn text(text: impl Into<String>) -> Self {
        ContentSegment::Text { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        ContentSegment::Reasoning {
            text: text.into(),
            signature: None,
        }
    }

    pub fn signed_reasoning(text: impl Into<String>, signature: impl Into<String>) -> Self {
        ContentSegment::Reasoning {
            text: text.into(),
            signature: Some(signature.into()),
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        ContentSegment::ToolUse {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    pub fn tool_result(id: impl Into<String>, payload: Value, is_error: bool) -> Self {
        ContentSegment::ToolResult {
            id: id.into(),
            payload,
            is_error,
        }
    }
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub segments: Vec<ContentSegment>,
}

impl Message {
    pub fn new(role: Role, segments: Vec<ContentSegment>) -> Self {
        Self { role, segments }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            segments: vec![ContentSegment::text(text)],
        }
    }

    /// Create an assistant message holding a single text segment
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            segments: vec![ContentSegment::text(text)],
        }
    }

    pub fn assistant(segments: Vec<ContentSegment>) -> Self {
        Self {
            role: Role::Assistant,
            segments,
        }
    }

    /// Create a `tool` message carrying one tool result
    pub fn tool_result(id: impl Into<String>, payload: Value, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            segments: vec![ContentSegment::tool_result(id, payload, is_error)],
        }
    }

    /// Concatenation of every text segment in order
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                ContentSegment::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// A fully assembled tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Why the model stopped generating.
///
/// Provider values the crate does not know about are carried through verbatim
/// in [`StopReason::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other(String),
}

impl StopReason {
    pub fn from_provider(value: &str) -> Self {
        match value {
            "end_turn" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            other => StopReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::Other(value) => value,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, StopReason::ToolUse)
    }
}

impl Serialize for StopReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything one round produced, folded from its event stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedResponse {
    /// Concatenated text deltas, in arrival order
    pub text: String,

    /// Concatenated reasoning deltas, kept apart from the answer text
    pub reasoning: String,

    /// Signature sealing the reasoning trace, if the provider sent one
    pub reasoning_signature: Option<String>,

    /// Tool calls completed during the round, in stream order
    pub tool_calls: Vec<ToolCall>,

    /// The stop reason from the terminal fragment, if one arrived
    pub stop_reason: Option<StopReason>,
}

impl AggregatedResponse {
    /// True when the round ended asking for tools
    pub fn requests_tools(&self) -> bool {
        self.stop_reason
            .as_ref()
            .is_some_and(StopReason::is_tool_use)
    }

    /// The round's output as an assistant message, for replay to the model
    pub fn to_assistant_message(&self) -> Message {
        let mut segments = Vec::new();
        if !self.reasoning.is_empty() || self.reasoning_signature.is_some() {
            segments.push(ContentSegment::Reasoning {
                text: self.reasoning.clone(),
                signature: self.reasoning_signature.clone(),
            });
        }
        if !self.text.is_empty() {
            segments.push(ContentSegment::text(self.text.clone()));
        }
        for call in &self.tool_calls {
            segments.push(ContentSegment::tool_use(
                call.id.clone(),
                call.name.clone(),
                call.arguments.clone(),
            ));
        }
        Message::assistant(segments)
    }
}
