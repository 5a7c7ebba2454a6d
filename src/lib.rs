//! # kb-chat-core
//!
//! The streaming and tool-orchestration core of a knowledge-base chatbot backed by a
//! hosted Claude model.
//!
//! ## Overview
//!
//! Given the stored turns of a conversation and a new prompt, the crate:
//!
//! 1. assembles the message history the model expects,
//! 2. invokes the model and classifies its streamed fragments into typed events,
//! 3. reassembles tool calls whose JSON arguments arrive in pieces,
//! 4. runs the requested tools (`query_db`, `fetch_metadata`, or any registered tool)
//!    and feeds results back until the model produces a final answer,
//! 5. streams text to the caller as it arrives, and returns the aggregated answer.
//!
//! ```text
//! Turns + prompt ──▶ assemble_history ──▶ ModelBackend::invoke_stream
//!                                               │ raw fragments
//!                                               ▼
//!                                         parse_fragment ──▶ StreamEvent
//!                                               │
//!                          ┌────────────────────┴───────────────────┐
//!                          ▼                                        ▼
//!                  ToolCallAssembler                        ResponseAggregator
//!                          │                                        │
//!                          └──────────▶ ToolOrchestrationLoop ◀─────┘
//!                                        │           │
//!                               ToolRegistry     TurnOutcome
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use kb_chat::{ChatOptions, Client, ToolRegistry, Turn, query_db};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ChatOptions::builder()
//!         .system_prompt("You answer questions about the grant program.")
//!         .max_rounds(5)
//!         .build()?;
//!
//!     let registry = ToolRegistry::new().with(query_db(|args| async move {
//!         Ok(json!({"passages": [format!("Passages matching {}", args["query"])]}))
//!     }));
//!
//!     let client = Client::new(options, registry)?;
//!
//!     let history = vec![Turn::new("Who can apply?", "Any registered nonprofit.")];
//!     let outcome = client.run_turn(&history, "When is the deadline?").await?;
//!     println!("{}", outcome.text);
//!     Ok(())
//! }
//! ```
//!
//! ## Errors
//!
//! Unknown tools and failing tool handlers are reported to the model in-band and
//! never end a turn. Everything else that ends a turn early surfaces as
//! [`Error::TurnAborted`], which still carries the text produced before the failure.
//! Reaching the round limit is not an error: the outcome's
//! [`termination`](TurnOutcome::termination) says so.

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Live per-round event stream and the fold into an aggregated response.
mod aggregator;

/// Reassembly of tool calls from fragmented argument deltas.
mod assembler;

/// The model invocation seam, request encoding and the HTTP/SSE transport.
mod backend;

/// Caller-facing client: full turns, streamed turns, and the single-shot path.
mod client;

/// Options, defaults and environment resolution.
mod config;

/// Token estimation and history windowing helpers.
mod context;

/// The crate's error type.
mod error;

/// Message history assembly from stored turns.
mod history;

/// The round-by-round tool-use loop.
mod orchestrator;

/// Classification of raw provider fragments into typed events.
mod stream;

/// Tool definitions, schemas and the dispatch registry.
mod tools;

/// Conversation and response data types.
mod types;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

// --- Client ---

pub use client::{Client, TurnHandle};

// --- Orchestration ---

pub use orchestrator::{
    ConversationState, LoopState, Termination, ToolOrchestrationLoop, TurnEvent, TurnOutcome,
};

// --- Streaming ---

pub use aggregator::{ResponseAggregator, RoundStream};
pub use assembler::{PendingToolCall, ToolCallAssembler};
pub use stream::{BlockKind, BlockSeed, StreamEvent, parse_fragment};

// --- History and context ---

pub use context::{estimate_tokens, is_approaching_limit, truncate_turns};
pub use history::assemble_history;

// --- Model invocation ---

pub use backend::{FragmentStream, HttpBackend, ModelBackend, ModelRequest};

// --- Configuration ---

pub use config::{
    ANTHROPIC_VERSION, ChatOptions, ChatOptionsBuilder, ContentPolicy, DEFAULT_MAX_OUTPUT_TOKENS,
    DEFAULT_MAX_ROUNDS, DEFAULT_MODEL_ID, DEFAULT_REGION, DEFAULT_TEMPERATURE, ENV_API_KEY,
    ENV_ENDPOINT, ENV_MODEL_ID, ENV_REGION, default_endpoint,
};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Tool System ---

pub use tools::{
    Tool, ToolBuilder, ToolError, ToolHandler, ToolRegistry, fetch_metadata, query_db, tool,
};

// --- Core Types ---

pub use types::{AggregatedResponse, ContentSegment, Message, Role, StopReason, ToolCall, Turn};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The types most callers need.
///
/// ```rust
/// use kb_chat::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        ChatOptions, Client, Error, Message, Result, StreamEvent, Termination, Tool,
        ToolRegistry, Turn, TurnEvent, TurnOutcome, fetch_metadata, query_db, tool,
    };
}
