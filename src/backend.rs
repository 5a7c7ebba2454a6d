//! Model invocation.
//!
//! [`ModelBackend`] is the seam between the engine and the hosted model. The engine
//! builds a [`ModelRequest`] from the conversation and hands it to a backend, which
//! returns either a stream of raw provider fragments or a single response document.
//! Classification of fragments happens downstream in [`parse_fragment`](crate::parse_fragment),
//! so a backend only moves JSON.
//!
//! [`HttpBackend`] posts the request body to the runtime endpoint:
//!
//! ```text
//! POST {endpoint}/model/{model_id}/invoke-with-response-stream   (streamed, SSE)
//! POST {endpoint}/model/{model_id}/invoke                        (single document)
//! ```
//!
//! The streamed response must be framed as server-sent events whose `data` field is
//! one provider fragment.

use crate::config::{ANTHROPIC_VERSION, ChatOptions, ContentPolicy};
use crate::types::{ContentSegment, Message, Role};
use crate::{Error, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use serde_json::{Value, json};
use std::pin::Pin;
use std::time::Duration;

/// Raw provider fragments of one streamed invocation
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// A hosted model that can be invoked streamed or in one shot.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Start a streamed invocation.
    ///
    /// Failures before the first fragment (connection, authentication, throttling)
    /// are returned here; failures mid-stream arrive as `Err` items.
    async fn invoke_stream(&self, request: &ModelRequest) -> Result<FragmentStream>;

    /// Invoke the model and wait for the complete response document.
    async fn invoke(&self, request: &ModelRequest) -> Result<Value>;
}

/// Everything one invocation sends to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    /// Tool schemas as produced by [`ToolRegistry::schemas`](crate::ToolRegistry::schemas)
    pub tools: Vec<Value>,
    pub thinking_budget: Option<u32>,
    pub content_policy: Option<ContentPolicy>,
}

impl ModelRequest {
    pub fn new(system: impl Into<String>, messages: Vec<Message>, max_tokens: u32) -> Self {
        Self {
            system: system.into(),
            messages,
            max_tokens,
            temperature: None,
            tools: Vec::new(),
            thinking_budget: None,
            content_policy: None,
        }
    }

    /// Request for a streamed round, carrying the configured sampling settings.
    pub fn from_options(options: &ChatOptions, messages: Vec<Message>) -> Self {
        Self {
            system: options.system_prompt.clone(),
            messages,
            max_tokens: options.max_output_tokens,
            temperature: Some(options.temperature),
            tools: Vec::new(),
            thinking_budget: options.thinking_budget,
            content_policy: options.content_policy.clone(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// The JSON body sent to the runtime.
    ///
    /// Only signed reasoning segments are replayed. Tool results travel in `user` messages,
    /// and consecutive messages that land on the same wire role are merged.
    pub fn body(&self) -> Value {
        let mut body = json!({
            "anthropic_version": ANTHROPIC_VERSION,
            "max_tokens": self.max_tokens,
            "messages": encode_messages(&self.messages),
        });

        if !self.system.is_empty() {
            body["system"] = json!(self.system);
        }
        if !self.tools.is_empty() {
            body["tools"] = json!(self.tools);
        }
        match self.thinking_budget {
            // The provider rejects sampling overrides while reasoning is enabled.
            Some(budget) => {
                body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
            }
            None => {
                if let Some(temperature) = self.temperature {
                    body["temperature"] = json!(temperature);
                }
            }
        }
        if let Some(policy) = &self.content_policy {
            body["amazon-bedrock-guardrailDetails"] = json!({
                "guardrailId": policy.guardrail_id,
                "guardrailVersion": policy.guardrail_version,
            });
        }

        body
    }
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "assistant",
        Role::User | Role::Tool => "user",
    }
}

fn encode_segment(segment: &ContentSegment) -> Option<Value> {
    match segment {
        ContentSegment::Text { text } if text.is_empty() => None,
        ContentSegment::Text { text } => Some(json!({"type": "text", "text": text})),
        ContentSegment::Reasoning {
            text,
            signature: Some(signature),
        } => Some(json!({"type": "thinking", "thinking": text, "signature": signature})),
        ContentSegment::Reasoning { signature: None, .. } => None,
        ContentSegment::ToolUse {
            id,
            name,
            arguments,
        } => Some(json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": arguments,
        })),
        ContentSegment::ToolResult {
            id,
            payload,
            is_error,
        } => {
            let content = match payload {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some(json!({
                "type": "tool_result",
                "tool_use_id": id,
                "content": content,
                "is_error": is_error,
            }))
        }
    }
}

fn encode_messages(messages: &[Message]) -> Vec<Value> {
    let mut wire: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for message in messages {
        let blocks: Vec<Value> = message.segments.iter().filter_map(encode_segment).collect();
        if blocks.is_empty() {
            continue;
        }

        let role = wire_role(message.role);
        match wire.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => wire.push((role, blocks)),
        }
    }

    wire.into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect()
}

/// Decode one server-sent event into a provider fragment.
///
/// Returns `Ok(None)` for events without a usable payload.
fn decode_event(event_type: &str, data: &str) -> Result<Option<Value>> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            log::debug!("Skipping undecodable event data: {} ({})", data, e);
            return Ok(None);
        }
    };

    if event_type == "error" || is_error_document(&value) {
        return Err(provider_error(&value));
    }

    Ok(Some(value))
}

fn is_error_document(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("error")
}

fn provider_error(value: &Value) -> Error {
    let message = value
        .pointer("/error/message")
        .and_then(Value::as_str)
        .or_else(|| value.get("message").and_then(Value::as_str))
        .unwrap_or("unknown provider error");
    Error::invocation(format!("provider error: {}", message))
}

/// Backend speaking to the model runtime over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http_client: reqwest::Client,
    endpoint: String,
    model_id: String,
    api_key: Option<String>,
}

impl HttpBackend {
    /// Create a backend for the endpoint and model in `options`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be built.
    pub fn new(options: &ChatOptions) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(options.timeout))
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            http_client,
            endpoint: options.endpoint.clone(),
            model_id: options.model_id.clone(),
            api_key: options.api_key.clone(),
        })
    }

    fn url(&self, action: &str) -> String {
        format!("{}/model/{}/{}", self.endpoint, self.model_id, action)
    }

    async fn post(
        &self,
        action: &str,
        request: &ModelRequest,
        accept: &str,
    ) -> Result<reqwest::Response> {
        let url = self.url(action);
        log::debug!(
            "Invoking {} ({} messages, {} tools)",
            url,
            request.messages.len(),
            request.tools.len()
        );

        let mut builder = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", accept)
            .json(&request.body());
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout()
            } else {
                Error::Http(e)
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|e| {
                log::warn!("Failed to read error response body: {}", e);
                "Unknown error (failed to read response body)".to_string()
            });
            log::error!("Model invocation failed with {}: {}", status, body);
            return Err(Error::invocation(format!("{}: {}", status, body)));
        }

        Ok(response)
    }
}

#[async_trait]
impl ModelBackend for HttpBackend {
    async fn invoke_stream(&self, request: &ModelRequest) -> Result<FragmentStream> {
        let response = self
            .post("invoke-with-response-stream", request, "text/event-stream")
            .await?;

        let fragments = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| async move {
                match event {
                    Ok(event) => decode_event(&event.event, &event.data).transpose(),
                    Err(e) => {
                        log::error!("Event stream failed: {}", e);
                        Some(Err(Error::invocation(format!("event stream failed: {}", e))))
                    }
                }
            });

        Ok(Box::pin(fragments))
    }

    async fn invoke(&self, request: &ModelRequest) -> Result<Value> {
        let response = self.post("invoke", request, "application/json").await?;
        let value: Value = response.json().await.map_err(Error::Http)?;

        if is_error_document(&value) {
            return Err(provider_error(&value));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ChatOptions {
        ChatOptions::builder()
            .system_prompt("You answer from the knowledge base.")
            .endpoint("http://localhost:1234")
            .model_id("anthropic.claude-3-7-sonnet-20250219-v1:0")
            .api_key("test-key")
            .build()
            .unwrap()
    }

    #[test]
    fn test_body_carries_configured_fields() {
        let request = ModelRequest::from_options(&options(), vec![Message::user("Hi")])
            .with_tools(vec![json!({"name": "query_db"})]);
        let body = request.body();

        assert_eq!(body["anthropic_version"], "bedrock-2023-05-31");
        assert_eq!(body["system"], "You answer from the knowledge base.");
        assert_eq!(body["max_tokens"], 2048);
        assert!((body["temperature"].as_f64().unwrap() - 0.01).abs() < 1e-6);
        assert_eq!(body["tools"][0]["name"], "query_db");
        assert!(body.get("thinking").is_none());
        assert!(body.get("amazon-bedrock-guardrailDetails").is_none());
        assert_eq!(
            body["messages"],
            json!([{"role": "user", "content": [{"type": "text", "text": "Hi"}]}])
        );
    }

    #[test]
    fn test_body_omits_empty_tools_and_system() {
        let body = ModelRequest::new("", vec![Message::user("Hi")], 100).body();
        assert!(body.get("tools").is_none());
        assert!(body.get("system").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_thinking_replaces_temperature() {
        let mut request = ModelRequest::new("", vec![Message::user("Hi")], 4096).with_temperature(0.3);
        request.thinking_budget = Some(2048);
        let body = request.body();

        assert_eq!(body["thinking"], json!({"type": "enabled", "budget_tokens": 2048}));
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_guardrail_details() {
        let mut request = ModelRequest::new("", vec![Message::user("Hi")], 100);
        request.content_policy = Some(ContentPolicy::new("gr-1", "2"));
        assert_eq!(
            request.body()["amazon-bedrock-guardrailDetails"],
            json!({"guardrailId": "gr-1", "guardrailVersion": "2"})
        );
    }

    #[test]
    fn test_signed_reasoning_leads_the_assistant_message() {
        let messages = vec![
            Message::user("When is the deadline?"),
            Message::assistant(vec![
                ContentSegment::signed_reasoning("Need the index.", "sig_1"),
                ContentSegment::tool_use("toolu_1", "query_db", json!({"query": "deadline"})),
            ]),
        ];

        let wire = encode_messages(&messages);
        assert_eq!(
            wire[1]["content"][0],
            json!({"type": "thinking", "thinking": "Need the index.", "signature": "sig_1"})
        );
        assert_eq!(wire[1]["content"][1]["type"], "tool_use");
    }

    #[test]
    fn test_tool_exchange_encoding() {
        let messages = vec![
            Message::user("When is the deadline?"),
            Message::assistant(vec![
                ContentSegment::reasoning("Need the index."),
                ContentSegment::text("Let me check."),
                ContentSegment::tool_use("toolu_1", "query_db", json!({"query": "deadline"})),
                ContentSegment::tool_use("toolu_2", "fetch_metadata", json!({"filter_key": "year"})),
            ]),
            Message::tool_result("toolu_1", json!({"hits": ["March 1st"]}), false),
            Message::tool_result("toolu_2", json!({"error": "Unknown tool"}), true),
        ];

        let wire = encode_messages(&messages);
        assert_eq!(wire.len(), 3, "tool results merge into one user message");

        let assistant = &wire[1];
        assert_eq!(assistant["role"], "assistant");
        assert_eq!(assistant["content"].as_array().unwrap().len(), 3);
        assert_eq!(assistant["content"][1]["input"], json!({"query": "deadline"}));

        let results = &wire[2];
        assert_eq!(results["role"], "user");
        assert_eq!(
            results["content"][0],
            json!({
                "type": "tool_result",
                "tool_use_id": "toolu_1",
                "content": "{\"hits\":[\"March 1st\"]}",
                "is_error": false,
            })
        );
        assert_eq!(results["content"][1]["is_error"], true);
    }

    #[test]
    fn test_empty_turns_are_skipped() {
        let messages = vec![
            Message::user("first"),
            Message::assistant_text(""),
            Message::user("second"),
        ];
        let wire = encode_messages(&messages);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["content"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_string_payload_is_sent_verbatim() {
        let wire = encode_messages(&[Message::tool_result("toolu_1", json!("plain text"), false)]);
        assert_eq!(wire[0]["content"][0]["content"], "plain text");
    }

    #[test]
    fn test_decode_event() {
        let fragment = decode_event("content_block_delta", r#"{"type":"ping"}"#).unwrap();
        assert_eq!(fragment, Some(json!({"type": "ping"})));

        assert_eq!(decode_event("message", "  ").unwrap(), None);
        assert_eq!(decode_event("message", "not json").unwrap(), None);

        let err = decode_event(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )
        .unwrap_err();
        match err {
            Error::Invocation(msg) => assert!(msg.contains("Overloaded")),
            other => panic!("Expected Invocation, got {:?}", other),
        }
    }

    #[test]
    fn test_http_backend_urls() {
        let backend = HttpBackend::new(&options()).unwrap();
        assert_eq!(
            backend.url("invoke"),
            "http://localhost:1234/model/anthropic.claude-3-7-sonnet-20250219-v1:0/invoke"
        );
    }
}
