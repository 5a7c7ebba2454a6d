//! The caller-facing entry point.
//!
//! [`Client`] ties a [`ModelBackend`], a [`ToolRegistry`] and [`ChatOptions`]
//! together and exposes the three ways of asking a question:
//!
//! - [`Client::run_turn`] runs the full tool loop and returns the final
//!   [`TurnOutcome`].
//! - [`Client::stream_turn`] runs the same loop on a background task and hands
//!   back a [`TurnHandle`], a live stream of [`TurnEvent`]s for forwarding text
//!   to a client as it is generated.
//! - [`Client::complete`] is the single-shot path used for evaluation: no tools,
//!   deterministic sampling, only the first text segment of the answer.
//!
//! The client holds no conversation state. Callers pass in the stored turns each
//! time, so one `Client` serves any number of conversations concurrently.
//!
//! # Examples
//!
//! ```rust,no_run
//! use kb_chat::{ChatOptions, Client, ToolRegistry, TurnEvent, StreamEvent, query_db, fetch_metadata};
//! use futures::StreamExt;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ChatOptions::builder()
//!     .system_prompt("You answer questions using the knowledge base.")
//!     .build()?;
//!
//! let registry = ToolRegistry::new()
//!     .with(query_db(|args| async move {
//!         Ok(json!({"passages": [format!("results for {}", args["query"])]}))
//!     }))
//!     .with(fetch_metadata(|_| async move { Ok(json!({"year": "2024"})) }));
//!
//! let client = Client::new(options, registry)?;
//!
//! let mut turn = client.stream_turn(&[], "When is the application deadline?")?;
//! while let Some(event) = turn.next().await {
//!     if let TurnEvent::Stream { event: StreamEvent::TextDelta(text), .. } = event {
//!         print!("{}", text);
//!     }
//! }
//! let outcome = turn.outcome().await?;
//! println!("\n({} rounds)", outcome.rounds);
//! # Ok(())
//! # }
//! ```

use crate::backend::{HttpBackend, ModelBackend, ModelRequest};
use crate::config::ChatOptions;
use crate::context::truncate_turns;
use crate::history::assemble_history;
use crate::orchestrator::{ConversationState, ToolOrchestrationLoop, TurnEvent, TurnOutcome};
use crate::tools::ToolRegistry;
use crate::types::Turn;
use crate::{Error, Result};
use futures::stream::{FusedStream, Stream};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// Runs prompts against the model with the registered tools.
#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn ModelBackend>,
    registry: Arc<ToolRegistry>,
    options: Arc<ChatOptions>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client talking to the runtime endpoint in `options`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(options: ChatOptions, registry: ToolRegistry) -> Result<Self> {
        let backend = HttpBackend::new(&options)?;
        Ok(Self::with_backend(Arc::new(backend), registry, options))
    }

    /// Create a client over any backend.
    pub fn with_backend(
        backend: Arc<dyn ModelBackend>,
        registry: ToolRegistry,
        options: ChatOptions,
    ) -> Self {
        Self {
            backend,
            registry: Arc::new(registry),
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    fn conversation(&self, history: &[Turn], prompt: &str) -> Result<ConversationState> {
        check_prompt(prompt)?;
        Ok(ConversationState::new(
            self.options.system_prompt.clone(),
            self.replayed(history).to_vec(),
            prompt,
        ))
    }

    fn replayed<'a>(&self, history: &'a [Turn]) -> &'a [Turn] {
        match self.options.max_history_turns {
            Some(keep) => truncate_turns(history, keep),
            None => history,
        }
    }

    fn engine(&self, cancellation: CancellationToken) -> ToolOrchestrationLoop {
        ToolOrchestrationLoop::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.registry),
            Arc::clone(&self.options),
        )
        .with_cancellation(cancellation)
    }

    /// Answer `prompt` given the prior `history`, running tools as requested.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TurnAborted`] if the model cannot be reached, a tool call
    /// is malformed, or the stream breaks protocol. Hitting the round limit is not
    /// an error; check [`TurnOutcome::termination`].
    pub async fn run_turn(&self, history: &[Turn], prompt: &str) -> Result<TurnOutcome> {
        self.run_turn_with_cancellation(history, prompt, CancellationToken::new())
            .await
    }

    /// [`run_turn`](Self::run_turn) that gives up as soon as `cancellation` fires.
    pub async fn run_turn_with_cancellation(
        &self,
        history: &[Turn],
        prompt: &str,
        cancellation: CancellationToken,
    ) -> Result<TurnOutcome> {
        let conversation = self.conversation(history, prompt)?;
        self.engine(cancellation).run(conversation).await
    }

    /// Start a turn on a background task and stream its events.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty prompt. Failures during the turn
    /// are reported by [`TurnHandle::outcome`].
    pub fn stream_turn(&self, history: &[Turn], prompt: &str) -> Result<TurnHandle> {
        let conversation = self.conversation(history, prompt)?;
        let cancellation = CancellationToken::new();
        let mut engine = self.engine(cancellation.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            engine
                .run_with_events(conversation, move |event| {
                    // The receiver may be gone; the turn still completes.
                    let _ = tx.send(event);
                })
                .await
        });

        Ok(TurnHandle {
            events: UnboundedReceiverStream::new(rx),
            task,
            cancellation,
            finished: false,
        })
    }

    /// Single-shot answer without tools.
    ///
    /// Sends one request at the evaluation temperature, with the configured content
    /// policy, and returns the text of the first content segment.
    ///
    /// # Errors
    ///
    /// - [`Error::UnexpectedToolUse`] if the model answered with a tool request
    /// - [`Error::Invocation`] if the response has no content
    /// - [`Error::InvalidInput`] for an empty prompt
    pub async fn complete(&self, history: &[Turn], prompt: &str) -> Result<String> {
        check_prompt(prompt)?;
        let messages = assemble_history(self.replayed(history), prompt);
        let mut request = ModelRequest::new(
            self.options.system_prompt.clone(),
            messages,
            self.options.max_output_tokens,
        )
        .with_temperature(self.options.evaluation_temperature);
        request.content_policy = self.options.content_policy.clone();

        log::debug!(
            "Invoking {} without tools ({} messages)",
            self.options.model_id,
            request.messages.len()
        );
        let response = self.backend.invoke(&request).await.inspect_err(|e| {
            log::error!("Model invocation failed: {}", e);
        })?;

        first_text(&response)
    }
}

fn check_prompt(prompt: &str) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(Error::invalid_input("prompt must not be empty"));
    }
    Ok(())
}

/// Text of the first content segment of a response document.
fn first_text(response: &Value) -> Result<String> {
    let first = response
        .get("content")
        .and_then(Value::as_array)
        .and_then(|content| content.first())
        .ok_or_else(|| Error::invocation("response contained no content"))?;

    match first.get("type").and_then(Value::as_str) {
        Some("text") => Ok(first
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()),
        Some("tool_use") => Err(Error::UnexpectedToolUse {
            name: first
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        }),
        other => Err(Error::protocol(format!(
            "unexpected first content segment type: {}",
            other.unwrap_or("none")
        ))),
    }
}

/// A turn running in the background.
///
/// Poll it as a [`Stream`] for live [`TurnEvent`]s, then call
/// [`outcome`](Self::outcome) for the result. The event stream ends when the turn
/// ends, successfully or not.
pub struct TurnHandle {
    events: UnboundedReceiverStream<TurnEvent>,
    task: JoinHandle<Result<TurnOutcome>>,
    cancellation: CancellationToken,
    finished: bool,
}

impl TurnHandle {
    /// Stop the turn. No events follow the cancellation.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Wait for the turn to end.
    ///
    /// Events not yet consumed are discarded.
    pub async fn outcome(self) -> Result<TurnOutcome> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::other(format!("turn task failed: {}", e))),
        }
    }
}

impl Stream for TurnHandle {
    type Item = TurnEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.events).poll_next(cx) {
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl FusedStream for TurnHandle {
    fn is_terminated(&self) -> bool {
        self.finished
    }
}
