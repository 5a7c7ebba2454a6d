//! Shared fixtures for integration tests: a scripted model backend and builders
//! for provider stream fragments.

#![allow(dead_code)]

use async_trait::async_trait;
use kb_chat::{ChatOptions, Error, FragmentStream, ModelBackend, ModelRequest, Result};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// What the backend does for one streamed invocation
pub enum Round {
    /// Yield these fragments, then end the stream
    Fragments(Vec<Value>),
    /// Yield these fragments, then never finish
    Stall(Vec<Value>),
    /// Yield these fragments, then fail mid-stream
    Break(Vec<Value>, String),
    /// Refuse the invocation outright
    Refuse(String),
}

/// A [`ModelBackend`] that replays scripted rounds and records every request.
pub struct ScriptedBackend {
    rounds: Mutex<VecDeque<Round>>,
    responses: Mutex<VecDeque<Value>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedBackend {
    pub fn new(rounds: Vec<Round>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Backend for the single-shot path
    pub fn with_responses(responses: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(VecDeque::new()),
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn invocations(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn invoke_stream(&self, request: &ModelRequest) -> Result<FragmentStream> {
        self.requests.lock().unwrap().push(request.clone());
        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::invocation("script exhausted"))?;

        use futures::StreamExt;
        let stream: FragmentStream = match round {
            Round::Fragments(items) => Box::pin(futures::stream::iter(items.into_iter().map(Ok))),
            Round::Stall(items) => Box::pin(
                futures::stream::iter(items.into_iter().map(Ok)).chain(futures::stream::pending()),
            ),
            Round::Break(items, message) => Box::pin(
                futures::stream::iter(items.into_iter().map(Ok))
                    .chain(futures::stream::once(async move { Err(Error::invocation(message)) })),
            ),
            Round::Refuse(message) => return Err(Error::invocation(message)),
        };
        Ok(stream)
    }

    async fn invoke(&self, request: &ModelRequest) -> Result<Value> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::invocation("script exhausted"))
    }
}

pub fn options(max_rounds: u32) -> ChatOptions {
    ChatOptions::builder()
        .system_prompt("You answer questions using the knowledge base.")
        .endpoint("http://localhost:0")
        .model_id("test-model")
        .max_rounds(max_rounds)
        .build()
        .unwrap()
}

pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

// --- fragment builders ---

pub fn message_start() -> Value {
    json!({"type": "message_start", "message": {"role": "assistant", "content": []}})
}

pub fn text(t: &str) -> Value {
    json!({"type": "content_block_delta", "index": 0,
           "delta": {"type": "text_delta", "text": t}})
}

pub fn thinking_start(index: usize) -> Value {
    json!({"type": "content_block_start", "index": index,
           "content_block": {"type": "thinking", "thinking": ""}})
}

pub fn thinking(index: usize, t: &str) -> Value {
    json!({"type": "content_block_delta", "index": index,
           "delta": {"type": "thinking_delta", "thinking": t}})
}

pub fn signature(index: usize, sig: &str) -> Value {
    json!({"type": "content_block_delta", "index": index,
           "delta": {"type": "signature_delta", "signature": sig}})
}

pub fn tool_start(index: usize, id: &str, name: &str) -> Value {
    json!({"type": "content_block_start", "index": index,
           "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}})
}

pub fn args(index: usize, partial: &str) -> Value {
    json!({"type": "content_block_delta", "index": index,
           "delta": {"type": "input_json_delta", "partial_json": partial}})
}

pub fn block_stop(index: usize) -> Value {
    json!({"type": "content_block_stop", "index": index})
}

pub fn stop(reason: &str) -> Value {
    json!({"type": "message_delta", "delta": {"stop_reason": reason},
           "usage": {"output_tokens": 12}})
}

pub fn message_stop() -> Value {
    json!({"type": "message_stop"})
}

/// A complete round that answers with text
pub fn answer(parts: &[&str]) -> Round {
    let mut fragments = vec![message_start()];
    fragments.extend(parts.iter().map(|p| text(p)));
    fragments.push(block_stop(0));
    fragments.push(stop("end_turn"));
    fragments.push(message_stop());
    Round::Fragments(fragments)
}

/// A complete round that requests one tool with the given argument JSON
pub fn tool_request(id: &str, name: &str, arguments: &str) -> Round {
    Round::Fragments(vec![
        message_start(),
        tool_start(1, id, name),
        args(1, arguments),
        block_stop(1),
        stop("tool_use"),
        message_stop(),
    ])
}
