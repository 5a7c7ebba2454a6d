//! The tool-use loop.
//!
//! One prompt may take several model invocations. Each invocation is a *round*:
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!     AwaitingModel ──▶ StreamingResponse ──tool_use──▶ DispatchingTools
//!                              │
//!                              └── any other stop, or round limit ──▶ Done
//! ```
//!
//! While streaming, every event is forwarded to the caller as it arrives. When the
//! model stops to ask for tools, the round's output is appended as an `assistant`
//! message, every requested tool runs concurrently, each result is appended as a
//! `tool` message, and the model is invoked again with the same system prompt.
//!
//! Tool failures never end the turn: an unknown tool or a failing handler becomes
//! an error payload the model can read. Transport failures, malformed tool calls,
//! protocol violations and cancellation do end it, as [`Error::TurnAborted`] carrying
//! whatever text had been produced.

use crate::aggregator::RoundStream;
use crate::backend::{ModelBackend, ModelRequest};
use crate::config::ChatOptions;
use crate::history::assemble_history;
use crate::stream::StreamEvent;
use crate::tools::ToolRegistry;
use crate::types::{AggregatedResponse, ContentSegment, Message, StopReason, ToolCall, Turn};
use crate::{Error, Result};
use futures::StreamExt;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Working state for one prompt.
#[derive(Debug, Clone)]
pub struct ConversationState {
    pub system_prompt: String,
    pub history: Vec<Turn>,
    /// Messages sent on the next invocation; grows as rounds complete
    pub current_messages: Vec<Message>,
    /// Model invocations made so far
    pub round: u32,
}

impl ConversationState {
    pub fn new(system_prompt: impl Into<String>, history: Vec<Turn>, prompt: &str) -> Self {
        let current_messages = assemble_history(&history, prompt);
        Self {
            system_prompt: system_prompt.into(),
            history,
            current_messages,
            round: 0,
        }
    }
}

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingModel,
    StreamingResponse,
    DispatchingTools,
    Done,
}

/// How a turn that produced an answer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The model stopped for a reason other than tool use
    Completed,
    /// The model still wanted tools when the round limit was reached
    RoundLimitExceeded,
}

/// The result of a finished turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Answer text of every round, concatenated.
    ///
    /// Rounds are joined as-is with no separator, so text that preceded a tool
    /// call runs straight into the next round's answer.
    pub text: String,
    pub reasoning: String,
    /// Stop reason of the last round
    pub stop_reason: Option<StopReason>,
    pub rounds: u32,
    pub termination: Termination,
    /// Full transcript, ending with the final assistant message
    pub messages: Vec<Message>,
}

impl TurnOutcome {
    pub fn round_limit_exceeded(&self) -> bool {
        self.termination == Termination::RoundLimitExceeded
    }

    /// The exchange as it should be stored for later turns
    pub fn to_turn(&self, prompt: impl Into<String>) -> Turn {
        Turn::new(prompt, self.text.clone())
    }
}

/// Progress notifications emitted while a turn runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// A classified stream event from the model
    Stream { round: u32, event: StreamEvent },
    /// A tool is about to run
    ToolDispatched { round: u32, call: ToolCall },
    /// A tool finished; failures carry `is_error`
    ToolResult {
        round: u32,
        id: String,
        name: String,
        payload: Value,
        is_error: bool,
    },
    /// The turn ended with an answer
    Finished { termination: Termination, rounds: u32 },
}

/// Drives one prompt through as many rounds as the model needs.
pub struct ToolOrchestrationLoop {
    backend: Arc<dyn ModelBackend>,
    registry: Arc<ToolRegistry>,
    options: Arc<ChatOptions>,
    cancellation: CancellationToken,
    state: LoopState,
}

impl ToolOrchestrationLoop {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        registry: Arc<ToolRegistry>,
        options: Arc<ChatOptions>,
    ) -> Self {
        Self {
            backend,
            registry,
            options,
            cancellation: CancellationToken::new(),
            state: LoopState::AwaitingModel,
        }
    }

    /// Abort the turn when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run the turn to completion without observing progress.
    pub async fn run(&mut self, conversation: ConversationState) -> Result<TurnOutcome> {
        self.run_with_events(conversation, |_| {}).await
    }

    /// Run the turn, reporting every event to `on_event` as it happens.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TurnAborted`] wrapping the cause, with the text produced
    /// before the failure.
    pub async fn run_with_events<F>(
        &mut self,
        mut conversation: ConversationState,
        mut on_event: F,
    ) -> Result<TurnOutcome>
    where
        F: FnMut(TurnEvent) + Send,
    {
        let cancellation = self.cancellation.clone();
        let max_rounds = self.options.max_rounds;
        let mut text = String::new();
        let mut reasoning = String::new();

        loop {
            self.state = LoopState::AwaitingModel;
            conversation.round += 1;
            let round = conversation.round;

            let mut request =
                ModelRequest::from_options(&self.options, conversation.current_messages.clone())
                    .with_tools(self.registry.schemas());
            request.system = conversation.system_prompt.clone();

            log::debug!(
                "Invoking {} (round {}/{}, {} messages)",
                self.options.model_id,
                round,
                max_rounds,
                request.messages.len()
            );

            let invoked = tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(Error::Cancelled),
                result = self.backend.invoke_stream(&request) => result,
            };
            let fragments = match invoked {
                Ok(fragments) => fragments,
                Err(e) => return Err(self.abort(e, text)),
            };

            self.state = LoopState::StreamingResponse;
            let mut round_stream = RoundStream::new(fragments);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => Err(Error::Cancelled),
                    next = round_stream.next() => Ok(next),
                };
                match next {
                    Ok(None) => break,
                    Ok(Some(Ok(event))) => on_event(TurnEvent::Stream { round, event }),
                    Err(e) | Ok(Some(Err(e))) => {
                        text.push_str(round_stream.text());
                        return Err(self.abort(e, text));
                    }
                }
            }

            let round_text = round_stream.text().to_string();
            let response = match round_stream.finish() {
                Ok(response) => response,
                Err(e) => {
                    text.push_str(&round_text);
                    return Err(self.abort(e, text));
                }
            };
            text.push_str(&response.text);
            reasoning.push_str(&response.reasoning);

            if !response.requests_tools() {
                conversation.current_messages.push(response.to_assistant_message());
                return Ok(self.finish(
                    conversation,
                    response,
                    text,
                    reasoning,
                    Termination::Completed,
                    &mut on_event,
                ));
            }

            if round >= max_rounds {
                log::warn!(
                    "Round limit ({}) reached with {} tool call(s) outstanding",
                    max_rounds,
                    response.tool_calls.len()
                );
                conversation.current_messages.push(answer_only(&response));
                return Ok(self.finish(
                    conversation,
                    response,
                    text,
                    reasoning,
                    Termination::RoundLimitExceeded,
                    &mut on_event,
                ));
            }

            if response.tool_calls.is_empty() {
                let e = Error::protocol("stopped for tool use without requesting a tool");
                return Err(self.abort(e, text));
            }

            self.state = LoopState::DispatchingTools;
            conversation.current_messages.push(response.to_assistant_message());

            for call in &response.tool_calls {
                log::info!("Dispatching tool '{}' ({})", call.name, call.id);
                on_event(TurnEvent::ToolDispatched {
                    round,
                    call: call.clone(),
                });
            }

            let dispatches = join_all(
                response
                    .tool_calls
                    .iter()
                    .map(|call| dispatch(&self.registry, call)),
            );
            let results = tokio::select! {
                biased;
                _ = cancellation.cancelled() => None,
                results = dispatches => Some(results),
            };
            let Some(results) = results else {
                return Err(self.abort(Error::Cancelled, text));
            };

            for (call, (payload, is_error)) in response.tool_calls.iter().zip(results) {
                on_event(TurnEvent::ToolResult {
                    round,
                    id: call.id.clone(),
                    name: call.name.clone(),
                    payload: payload.clone(),
                    is_error,
                });
                conversation
                    .current_messages
                    .push(Message::tool_result(call.id.clone(), payload, is_error));
            }
        }
    }

    fn finish<F>(
        &mut self,
        conversation: ConversationState,
        response: AggregatedResponse,
        text: String,
        reasoning: String,
        termination: Termination,
        on_event: &mut F,
    ) -> TurnOutcome
    where
        F: FnMut(TurnEvent),
    {
        self.state = LoopState::Done;
        log::debug!(
            "Turn finished after {} round(s): {:?}",
            conversation.round,
            termination
        );
        on_event(TurnEvent::Finished {
            termination,
            rounds: conversation.round,
        });

        TurnOutcome {
            text,
            reasoning,
            stop_reason: response.stop_reason,
            rounds: conversation.round,
            termination,
            messages: conversation.current_messages,
        }
    }

    fn abort(&mut self, cause: Error, partial_text: String) -> Error {
        self.state = LoopState::Done;
        match &cause {
            Error::Cancelled => log::info!("Turn cancelled"),
            Error::Http(_) | Error::Invocation(_) => {
                log::error!("Model invocation failed: {}", cause)
            }
            _ => log::error!("Turn aborted: {}", cause),
        }
        Error::turn_aborted(cause, partial_text)
    }
}

/// Run one tool call, folding any failure into an error payload.
async fn dispatch(registry: &ToolRegistry, call: &ToolCall) -> (Value, bool) {
    match registry.invoke(&call.name, call.arguments.clone()).await {
        Ok(payload) => (payload, false),
        Err(e) => {
            log::warn!("Tool '{}' ({}) failed: {}", call.name, call.id, e);
            (e.to_payload(), true)
        }
    }
}

/// The round's output without the tool requests nobody will answer.
fn answer_only(response: &AggregatedResponse) -> Message {
    let mut message = response.to_assistant_message();
    message
        .segments
        .retain(|segment| !matches!(segment, ContentSegment::ToolUse { .. }));
    message
}
