//! Tool call reassembly from fragmented argument deltas.
//!
//! A tool call arrives as one block-start fragment followed by any number of
//! argument fragments that together spell out a single JSON document:
//!
//! ```text
//! BlockStart { index: 1, ToolUse { id: "toolu_1", name: "query_db" } }
//! ToolArgumentDelta { index: 1, "{\"qu" }
//! ToolArgumentDelta { index: 1, "ery\":\"abc" }
//! ToolArgumentDelta { index: 1, "\"}" }
//! TurnEnd(ToolUse)
//!     → ToolCall { id: "toolu_1", name: "query_db", arguments: {"query": "abc"} }
//! ```
//!
//! The provider sends no reliable block-end marker the engine depends on, so the
//! *next* block start, the terminal event, or the end of the stream closes the open
//! block. Only then is the buffer parsed.
//!
//! At most one tool-use block is open at a time. An argument fragment addressed to
//! any other block is a protocol violation.

use crate::stream::{BlockSeed, StreamEvent};
use crate::types::ToolCall;
use crate::{Error, Result};
use serde_json::Value;

/// A tool call whose arguments are still arriving.
#[derive(Debug)]
pub struct PendingToolCall {
    /// Block position in the stream
    index: usize,

    id: String,

    name: String,

    /// Raw argument JSON, concatenated verbatim
    argument_buffer: String,
}

impl PendingToolCall {
    fn new(index: usize, id: &str, name: &str) -> Self {
        Self {
            index,
            id: id.to_string(),
            name: name.to_string(),
            argument_buffer: String::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn argument_buffer(&self) -> &str {
        &self.argument_buffer
    }

    /// Parse the buffer. An empty buffer means a call with no arguments.
    fn into_tool_call(self) -> Result<ToolCall> {
        let raw = self.argument_buffer.trim();
        if raw.is_empty() {
            return Ok(ToolCall::new(
                self.id,
                self.name,
                Value::Object(Default::default()),
            ));
        }

        let arguments: Value = serde_json::from_str(raw)
            .map_err(|e| Error::malformed_tool_call(&self.id, &self.name, e.to_string()))?;

        if !arguments.is_object() {
            return Err(Error::malformed_tool_call(
                &self.id,
                &self.name,
                format!("arguments must be a JSON object, got `{}`", raw),
            ));
        }

        Ok(ToolCall::new(self.id, self.name, arguments))
    }
}

/// Accumulates argument fragments and emits complete [`ToolCall`]s.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    open: Option<PendingToolCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event.
    ///
    /// Returns the call this event closed, if any.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedToolCall`] when a closed block's arguments do not parse to an object
    /// - [`Error::Protocol`] when an argument fragment does not belong to the open block
    pub fn process(&mut self, event: &StreamEvent) -> Result<Option<ToolCall>> {
        match event {
            StreamEvent::BlockStart { index, seed } => {
                if let Some(open) = &self.open {
                    if open.index == *index {
                        return Err(Error::protocol(format!(
                            "block {} started twice (tool '{}' still open)",
                            index, open.name
                        )));
                    }
                }

                let completed = self.close()?;
                if let BlockSeed::ToolUse { id, name } = seed {
                    log::debug!("Tool block {} opened: {} ({})", index, name, id);
                    self.open = Some(PendingToolCall::new(*index, id, name));
                }
                Ok(completed)
            }
            StreamEvent::ToolArgumentDelta {
                index,
                partial_json,
            } => match self.open.as_mut() {
                Some(open) if open.index == *index => {
                    open.argument_buffer.push_str(partial_json);
                    Ok(None)
                }
                Some(open) => Err(Error::protocol(format!(
                    "argument fragment for block {} while tool block {} ('{}') is open",
                    index, open.index, open.name
                ))),
                None => Err(Error::protocol(format!(
                    "argument fragment for block {} with no open tool block",
                    index
                ))),
            },
            StreamEvent::TurnEnd(_) => self.close(),
            StreamEvent::TextDelta(_)
            | StreamEvent::ReasoningDelta(_)
            | StreamEvent::ReasoningSignature(_) => Ok(None),
        }
    }

    /// Close the open block, if any, and parse its arguments.
    ///
    /// Called implicitly by [`process`](Self::process) and by the round when the
    /// stream ends without a terminal event.
    pub fn close(&mut self) -> Result<Option<ToolCall>> {
        match self.open.take() {
            Some(pending) => pending.into_tool_call().map(Some),
            None => Ok(None),
        }
    }

    /// The call currently collecting arguments, if any
    pub fn pending(&self) -> Option<&PendingToolCall> {
        self.open.as_ref()
    }
}
