//! Context window helpers.
//!
//! The engine replays the whole conversation on every round, so long conversations
//! grow the request without bound. These helpers let the caller estimate the size of
//! a request and drop the oldest turns before it gets too large:
//!
//! ```rust
//! use kb_chat::{Turn, assemble_history, estimate_tokens, is_approaching_limit, truncate_turns};
//!
//! let history: Vec<Turn> = (0..50)
//!     .map(|i| Turn::new(format!("question {}", i), "a fairly long answer ".repeat(40)))
//!     .collect();
//!
//! let mut recent = truncate_turns(&history, 50);
//! while is_approaching_limit(&assemble_history(recent, "next question"), 4_000, 0.9) {
//!     recent = truncate_turns(recent, recent.len() / 2);
//! }
//! assert!(recent.len() < history.len());
//! ```
//!
//! The estimate is a character heuristic (about 4 characters per token), not a
//! tokenizer. Expect it to be off by 10-20% either way.

use crate::types::{ContentSegment, Message, Turn};

/// Approximate the token count of a message list.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    if messages.is_empty() {
        return 0;
    }

    let mut total_chars = 0;

    for message in messages {
        // role formatting
        total_chars += 8;

        for segment in &message.segments {
            total_chars += match segment {
                ContentSegment::Text { text } | ContentSegment::Reasoning { text, .. } => text.len(),
                ContentSegment::ToolUse {
                    id,
                    name,
                    arguments,
                } => id.len() + name.len() + arguments.to_string().len(),
                ContentSegment::ToolResult { id, payload, .. } => {
                    id.len() + payload.to_string().len()
                }
            };
        }
    }

    total_chars += 16;

    total_chars.div_ceil(4)
}

/// The most recent `keep` turns.
///
/// Turns are dropped whole, so user/assistant pairs are never split.
pub fn truncate_turns(history: &[Turn], keep: usize) -> &[Turn] {
    let start = history.len().saturating_sub(keep);
    &history[start..]
}

/// True when the estimate exceeds `margin` (0.0 to 1.0) of `limit`.
pub fn is_approaching_limit(messages: &[Message], limit: usize, margin: f32) -> bool {
    let estimated = estimate_tokens(messages);
    let threshold = (limit as f32 * margin) as usize;
    estimated > threshold
}
