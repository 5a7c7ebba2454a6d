//! Folding a round's events into its final response.
//!
//! [`RoundStream`] wraps the raw fragment stream of one model invocation. Polling it
//! yields each classified [`StreamEvent`] as soon as its fragment arrives, so a caller
//! can forward text to a client live, while the same pass folds every event into an
//! [`AggregatedResponse`]:
//!
//! ```text
//! FragmentStream ──parse_fragment──▶ StreamEvent ──▶ caller (live)
//!                                        │
//!                                        └──▶ ResponseAggregator
//!                                              ├─ text       (TextDelta)
//!                                              ├─ reasoning  (ReasoningDelta, ReasoningSignature)
//!                                              ├─ tool_calls (ToolCallAssembler)
//!                                              └─ stop_reason (TurnEnd)
//! ```
//!
//! A round stream is single-pass: once it returns `None` (or an error) it stays
//! finished, and the next round gets a fresh stream.

use crate::assembler::ToolCallAssembler;
use crate::backend::FragmentStream;
use crate::stream::{BlockSeed, StreamEvent, parse_fragment};
use crate::types::AggregatedResponse;
use crate::Result;
use futures::stream::{FusedStream, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Stateful fold over one round's events.
#[derive(Debug, Default)]
pub struct ResponseAggregator {
    response: AggregatedResponse,
    assembler: ToolCallAssembler,
}

impl ResponseAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the response.
    ///
    /// # Errors
    ///
    /// Propagates tool-call assembly failures (malformed arguments, protocol
    /// violations). The aggregator should not be fed further after an error.
    pub fn apply(&mut self, event: &StreamEvent) -> Result<()> {
        if let Some(call) = self.assembler.process(event)? {
            log::debug!("Tool call assembled: {} ({})", call.name, call.id);
            self.response.tool_calls.push(call);
        }

        match event {
            StreamEvent::TextDelta(text) => self.response.text.push_str(text),
            StreamEvent::ReasoningDelta(text) => self.response.reasoning.push_str(text),
            StreamEvent::ReasoningSignature(signature) => {
                self.response.reasoning_signature = Some(signature.clone())
            }
            StreamEvent::BlockStart {
                seed: BlockSeed::Reasoning { thinking },
                ..
            } => self.response.reasoning.push_str(thinking),
            StreamEvent::TurnEnd(stop_reason) => self.response.stop_reason = stop_reason.clone(),
            StreamEvent::BlockStart { .. } | StreamEvent::ToolArgumentDelta { .. } => {}
        }

        Ok(())
    }

    /// Text folded so far
    pub fn text(&self) -> &str {
        &self.response.text
    }

    /// Close any block still open and return the folded response.
    pub fn finish(mut self) -> Result<AggregatedResponse> {
        if let Some(call) = self.assembler.close()? {
            self.response.tool_calls.push(call);
        }
        Ok(self.response)
    }
}

/// Live, single-pass event feed for one model invocation.
pub struct RoundStream {
    fragments: FragmentStream,
    aggregator: ResponseAggregator,
    done: bool,
}

impl RoundStream {
    pub fn new(fragments: FragmentStream) -> Self {
        Self {
            fragments,
            aggregator: ResponseAggregator::new(),
            done: false,
        }
    }

    /// Text folded from the events yielded so far
    pub fn text(&self) -> &str {
        self.aggregator.text()
    }

    /// Fold whatever has been consumed into the round's response.
    ///
    /// Normally called after the stream returned `None`.
    pub fn finish(self) -> Result<AggregatedResponse> {
        self.aggregator.finish()
    }

    /// Drain the remaining events and return the round's response.
    pub async fn collect_response(mut self) -> Result<AggregatedResponse> {
        while let Some(event) = self.next().await {
            event?;
        }
        self.finish()
    }
}

impl Stream for RoundStream {
    type Item = Result<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        loop {
            match this.fragments.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(Some(Ok(fragment))) => {
                    // Non-actionable fragments are skipped without yielding.
                    let Some(event) = parse_fragment(&fragment) else {
                        continue;
                    };
                    if let Err(e) = this.aggregator.apply(&event) {
                        this.done = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                    return Poll::Ready(Some(Ok(event)));
                }
            }
        }
    }
}

impl FusedStream for RoundStream {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StopReason;
    use crate::Error;
    use serde_json::{Value, json};

    fn text(t: &str) -> Value {
        json!({"type": "content_block_delta", "index": 0,
               "delta": {"type": "text_delta", "text": t}})
    }

    fn fragments(items: Vec<Value>) -> FragmentStream {
        Box::pin(futures::stream::iter(items.into_iter().map(Ok)))
    }

    #[tokio::test]
    async fn test_text_concatenates_in_arrival_order() {
        let parts = ["The ", "deadline ", "is ", "March 1st."];
        let stream = RoundStream::new(fragments(parts.iter().map(|p| text(p)).collect()));

        let response = stream.collect_response().await.unwrap();
        assert_eq!(response.text, "The deadline is March 1st.");
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.stop_reason, None);
    }

    #[tokio::test]
    async fn test_order_matters() {
        let forward = RoundStream::new(fragments(vec![text("ab"), text("cd")]))
            .collect_response()
            .await
            .unwrap();
        let reverse = RoundStream::new(fragments(vec![text("cd"), text("ab")]))
            .collect_response()
            .await
            .unwrap();
        assert_eq!(forward.text, "abcd");
        assert_eq!(reverse.text, "cdab");
    }

    #[tokio::test]
    async fn test_live_events_skip_non_actionable_fragments() {
        let mut stream = RoundStream::new(fragments(vec![
            json!({"type": "message_start", "message": {}}),
            json!({"type": "content_block_start", "index": 0,
                   "content_block": {"type": "text", "text": ""}}),
            text("Hi"),
            json!({"type": "ping"}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}}),
            json!({"type": "message_stop"}),
        ]));

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }

        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Hi".to_string()),
                StreamEvent::TurnEnd(Some(StopReason::EndTurn)),
            ]
        );
        assert!(stream.is_terminated());
        assert!(stream.next().await.is_none(), "stream must stay finished");

        let response = stream.finish().unwrap();
        assert_eq!(response.text, "Hi");
        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
    }

    #[tokio::test]
    async fn test_reasoning_is_kept_apart_from_text() {
        let stream = RoundStream::new(fragments(vec![
            json!({"type": "content_block_start", "index": 0,
                   "content_block": {"type": "thinking", "thinking": ""}}),
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "thinking_delta", "thinking": "Look up "}}),
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "thinking_delta", "thinking": "the index."}}),
            text("Answer."),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}}),
        ]));

        let response = stream.collect_response().await.unwrap();
        assert_eq!(response.reasoning, "Look up the index.");
        assert_eq!(response.text, "Answer.");
    }

    #[tokio::test]
    async fn test_tool_call_round() {
        let stream = RoundStream::new(fragments(vec![
            text("Let me check."),
            json!({"type": "content_block_start", "index": 1,
                   "content_block": {"type": "tool_use", "id": "toolu_1",
                                     "name": "query_db", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1,
                   "delta": {"type": "input_json_delta", "partial_json": "{\"qu"}}),
            json!({"type": "content_block_delta", "index": 1,
                   "delta": {"type": "input_json_delta", "partial_json": "ery\":\"abc"}}),
            json!({"type": "content_block_delta", "index": 1,
                   "delta": {"type": "input_json_delta", "partial_json": "\"}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}}),
        ]));

        let response = stream.collect_response().await.unwrap();
        assert!(response.requests_tools());
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments, json!({"query": "abc"}));
        assert_eq!(response.text, "Let me check.");
    }

    #[tokio::test]
    async fn test_malformed_arguments_end_the_stream() {
        let mut stream = RoundStream::new(fragments(vec![
            json!({"type": "content_block_start", "index": 0,
                   "content_block": {"type": "tool_use", "id": "toolu_1", "name": "query_db"}}),
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "input_json_delta", "partial_json": "{\"query\":\"abc\""}}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}}),
            text("never seen"),
        ]));

        let mut saw_error = false;
        while let Some(event) = stream.next().await {
            if let Err(e) = event {
                assert!(matches!(e, Error::MalformedToolCall { .. }));
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert_eq!(stream.text(), "");
    }

    #[tokio::test]
    async fn test_transport_error_ends_the_stream() {
        let items: Vec<Result<Value>> = vec![
            Ok(text("partial ")),
            Err(Error::invocation("connection reset")),
            Ok(text("never seen")),
        ];
        let mut stream = RoundStream::new(Box::pin(futures::stream::iter(items)));

        assert!(matches!(stream.next().await, Some(Ok(StreamEvent::TextDelta(_)))));
        assert!(matches!(stream.next().await, Some(Err(Error::Invocation(_)))));
        assert!(stream.next().await.is_none());
        assert_eq!(stream.text(), "partial ");
    }

    #[test]
    fn test_waits_on_a_quiet_source() {
        use tokio_test::{assert_pending, task};

        let mut stream = RoundStream::new(Box::pin(futures::stream::pending::<Result<Value>>()));
        let mut next = task::spawn(stream.next());
        assert_pending!(next.poll());
        drop(next);

        assert!(!stream.is_terminated());
    }

    #[tokio::test]
    async fn test_stream_end_closes_open_tool_block() {
        let stream = RoundStream::new(fragments(vec![
            json!({"type": "content_block_start", "index": 0,
                   "content_block": {"type": "tool_use", "id": "toolu_1", "name": "fetch_metadata"}}),
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "input_json_delta", "partial_json": "{\"filter_key\":\"year\"}"}}),
        ]));

        let response = stream.collect_response().await.unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.stop_reason, None);
    }
}
