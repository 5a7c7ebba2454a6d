//! Stream fragment classification.
//!
//! The provider streams a sequence of loosely-typed JSON records, each tagged by a
//! nested `type` field. This module decodes every record exactly once into the closed
//! [`StreamEvent`] enum so the rest of the crate never inspects raw JSON:
//!
//! ```text
//! {"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}
//!     → StreamEvent::TextDelta("Hi")
//!
//! {"type":"content_block_start","index":1,
//!  "content_block":{"type":"tool_use","id":"toolu_1","name":"query_db","input":{}}}
//!     → StreamEvent::BlockStart { index: 1, seed: BlockSeed::ToolUse { .. } }
//!
//! {"type":"content_block_delta","index":1,
//!  "delta":{"type":"input_json_delta","partial_json":"{\"qu"}}
//!     → StreamEvent::ToolArgumentDelta { index: 1, partial_json: "{\"qu" }
//!
//! {"type":"message_delta","delta":{"stop_reason":"tool_use"}}
//!     → StreamEvent::TurnEnd(Some(StopReason::ToolUse))
//!
//! {"type":"ping"}                                  → None
//! ```
//!
//! Records of a shape the parser does not recognise (new block kinds, new delta
//! kinds, pings, `message_start`, `content_block_stop`, …) yield `None`. The provider
//! adds kinds over time and an unknown one must never fail the stream.

use crate::types::StopReason;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A normalized event from one model invocation's stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A fragment of answer text
    TextDelta(String),

    /// A fragment of the model's thinking trace
    ReasoningDelta(String),

    /// The signature closing the thinking trace
    ReasoningSignature(String),

    /// A fragment of a tool call's JSON arguments
    ToolArgumentDelta { index: usize, partial_json: String },

    /// A tool-use or reasoning block opened
    BlockStart { index: usize, seed: BlockSeed },

    /// The model finished the round
    TurnEnd(Option<StopReason>),
}

/// Which kind of block a [`StreamEvent::BlockStart`] opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    ToolUse,
    Reasoning,
}

/// What the start fragment told us about the block
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockSeed {
    ToolUse { id: String, name: String },
    Reasoning { thinking: String },
}

impl BlockSeed {
    pub fn kind(&self) -> BlockKind {
        match self {
            BlockSeed::ToolUse { .. } => BlockKind::ToolUse,
            BlockSeed::Reasoning { .. } => BlockKind::Reasoning,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawFragment {
    ContentBlockStart {
        #[serde(default)]
        index: usize,
        content_block: RawBlock,
    },
    ContentBlockDelta {
        #[serde(default)]
        index: usize,
        delta: RawDelta,
    },
    MessageDelta {
        delta: RawMessageDelta,
    },
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawBlock {
    ToolUse {
        id: String,
        name: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Deserialize)]
struct RawMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

/// Classify one raw fragment.
///
/// Returns `None` when the fragment carries nothing the engine acts on, including
/// fragments whose shape does not match any known kind.
pub fn parse_fragment(fragment: &Value) -> Option<StreamEvent> {
    let raw = match RawFragment::deserialize(fragment) {
        Ok(raw) => raw,
        Err(e) => {
            log::debug!("Dropping malformed stream fragment: {}", e);
            return None;
        }
    };

    match raw {
        RawFragment::ContentBlockDelta { index, delta } => match delta {
            RawDelta::TextDelta { text } => Some(StreamEvent::TextDelta(text)),
            RawDelta::InputJsonDelta { partial_json } => Some(StreamEvent::ToolArgumentDelta {
                index,
                partial_json,
            }),
            RawDelta::ThinkingDelta { thinking } => Some(StreamEvent::ReasoningDelta(thinking)),
            RawDelta::SignatureDelta { signature } => {
                Some(StreamEvent::ReasoningSignature(signature))
            }
            RawDelta::Unrecognized => None,
        },
        RawFragment::ContentBlockStart {
            index,
            content_block,
        } => match content_block {
            RawBlock::ToolUse { id, name } => Some(StreamEvent::BlockStart {
                index,
                seed: BlockSeed::ToolUse { id, name },
            }),
            RawBlock::Thinking { thinking } => Some(StreamEvent::BlockStart {
                index,
                seed: BlockSeed::Reasoning { thinking },
            }),
            RawBlock::Unrecognized => None,
        },
        RawFragment::MessageDelta { delta } => Some(StreamEvent::TurnEnd(
            delta.stop_reason.as_deref().map(StopReason::from_provider),
        )),
        RawFragment::Unrecognized => None,
    }
}
