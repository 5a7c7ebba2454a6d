//! History assembly: stored turns plus a new prompt become the model's message list.
//!
//! Each stored [`Turn`] expands to a `user` message followed by an `assistant`
//! message, in the order the turns were stored, and the new prompt is appended as
//! the final `user` message:
//!
//! ```text
//! [Turn(u1, a1), Turn(u2, a2)] + "p"
//!     → [user(u1), assistant(a1), user(u2), assistant(a2), user(p)]
//! ```
//!
//! Nothing is reordered, deduplicated or dropped. Windowing a long history is up to
//! the caller (see [`crate::truncate_turns`]).

use crate::types::{Message, Turn};

/// Build the ordered message list for one model invocation.
///
/// Always returns `2 * history.len() + 1` messages alternating user/assistant and
/// ending with the prompt.
///
/// # Examples
///
/// ```rust
/// use kb_chat::{assemble_history, Role, Turn};
///
/// let history = vec![Turn::new("What is the deadline?", "March 1st.")];
/// let messages = assemble_history(&history, "And for renewals?");
///
/// assert_eq!(messages.len(), 3);
/// assert_eq!(messages[2].role, Role::User);
/// assert_eq!(messages[2].text(), "And for renewals?");
/// ```
pub fn assemble_history(history: &[Turn], prompt: &str) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() * 2 + 1);

    for turn in history {
        messages.push(Message::user(turn.user_text.clone()));
        messages.push(Message::assistant_text(turn.assistant_text.clone()));
    }

    messages.push(Message::user(prompt));
    messages
}
