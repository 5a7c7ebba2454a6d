//! Error types for the chat core

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The model endpoint rejected or failed the invocation
    #[error("Model invocation failed: {0}")]
    Invocation(String),

    /// Accumulated tool arguments did not form a JSON object
    #[error("Malformed arguments for tool call {name} ({id}): {reason}")]
    MalformedToolCall {
        id: String,
        name: String,
        reason: String,
    },

    /// The fragment stream broke an ordering rule (e.g. two open tool blocks)
    #[error("Stream protocol violation: {0}")]
    Protocol(String),

    /// A single-shot request came back with a tool call instead of text
    #[error("Expected a text response but the model requested tool '{name}'")]
    UnexpectedToolUse { name: String },

    /// Tool execution error
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The turn was cancelled by the caller
    #[error("Turn cancelled")]
    Cancelled,

    /// Timeout error
    #[error("Request timeout")]
    Timeout,

    /// A turn stopped early; carries whatever text had been streamed so far
    #[error("Turn aborted: {cause}")]
    TurnAborted {
        cause: Box<Error>,
        partial_text: String,
    },

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new invocation error
    pub fn invocation(msg: impl Into<String>) -> Self {
        Error::Invocation(msg.into())
    }

    /// Create a new malformed tool call error
    pub fn malformed_tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::MalformedToolCall {
            id: id.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a new protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Wrap `cause` together with the text produced before the turn stopped.
    pub fn turn_aborted(cause: Error, partial_text: impl Into<String>) -> Self {
        Error::TurnAborted {
            cause: Box::new(cause),
            partial_text: partial_text.into(),
        }
    }

    /// The underlying error, looking through [`Error::TurnAborted`].
    pub fn cause(&self) -> &Error {
        match self {
            Error::TurnAborted { cause, .. } => cause.cause(),
            other => other,
        }
    }

    /// Text streamed before the failure, if the error came out of a turn.
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            Error::TurnAborted { partial_text, .. } => Some(partial_text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_config() {
        let err = Error::config("model id is required");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(
            err.to_string(),
            "Invalid configuration: model id is required"
        );
    }

    #[test]
    fn test_error_invocation() {
        let err = Error::invocation("ThrottlingException");
        assert!(matches!(err, Error::Invocation(_)));
        assert_eq!(err.to_string(), "Model invocation failed: ThrottlingException");
    }

    #[test]
    fn test_error_malformed_tool_call() {
        let err = Error::malformed_tool_call("toolu_1", "query_db", "EOF while parsing");
        assert_eq!(
            err.to_string(),
            "Malformed arguments for tool call query_db (toolu_1): EOF while parsing"
        );
    }

    #[test]
    fn test_error_unexpected_tool_use() {
        let err = Error::UnexpectedToolUse {
            name: "query_db".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Expected a text response but the model requested tool 'query_db'"
        );
    }

    #[test]
    fn test_turn_aborted_exposes_cause_and_partial_text() {
        let err = Error::turn_aborted(Error::protocol("two open blocks"), "Hello");
        assert!(matches!(err.cause(), Error::Protocol(_)));
        assert_eq!(err.partial_text(), Some("Hello"));
        assert_eq!(
            err.to_string(),
            "Turn aborted: Stream protocol violation: two open blocks"
        );
    }

    #[test]
    fn test_cause_of_plain_error_is_itself() {
        let err = Error::Cancelled;
        assert!(matches!(err.cause(), Error::Cancelled));
        assert_eq!(err.partial_text(), None);
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
