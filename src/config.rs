//! Configuration for model invocation.
//!
//! [`ChatOptions`] carries everything an invocation needs (model, endpoint, sampling,
//! round limit, content policy) as plain data, so the engine itself holds no client
//! state. Values can come from code, from the environment, or from defaults:
//!
//! | setting   | environment variable | default                                      |
//! |-----------|----------------------|----------------------------------------------|
//! | endpoint  | `KB_CHAT_ENDPOINT`   | `https://bedrock-runtime.{region}.amazonaws.com` |
//! | model id  | `KB_CHAT_MODEL_ID`   | [`DEFAULT_MODEL_ID`]                         |
//! | region    | `KB_CHAT_REGION`     | [`DEFAULT_REGION`]                           |
//! | api key   | `KB_CHAT_API_KEY`    | none                                         |

use crate::{Error, Result};
use std::env;

/// Model used when none is configured
pub const DEFAULT_MODEL_ID: &str = "anthropic.claude-3-7-sonnet-20250219-v1:0";

/// Region used when none is configured
pub const DEFAULT_REGION: &str = "us-east-1";

/// Request body version tag expected by the runtime
pub const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// Output ceiling per invocation
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 2048;

/// Sampling temperature for interactive turns
pub const DEFAULT_TEMPERATURE: f32 = 0.01;

/// Tool-use rounds allowed per prompt before the loop gives up
pub const DEFAULT_MAX_ROUNDS: u32 = 5;

/// Smallest reasoning budget the provider accepts
pub const MIN_THINKING_BUDGET: u32 = 1024;

pub const ENV_ENDPOINT: &str = "KB_CHAT_ENDPOINT";
pub const ENV_MODEL_ID: &str = "KB_CHAT_MODEL_ID";
pub const ENV_REGION: &str = "KB_CHAT_REGION";
pub const ENV_API_KEY: &str = "KB_CHAT_API_KEY";

/// A content-safety policy (guardrail) applied by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPolicy {
    pub guardrail_id: String,
    pub guardrail_version: String,
}

impl ContentPolicy {
    pub fn new(guardrail_id: impl Into<String>, guardrail_version: impl Into<String>) -> Self {
        Self {
            guardrail_id: guardrail_id.into(),
            guardrail_version: guardrail_version.into(),
        }
    }
}

/// Options for model invocation and the tool loop
#[derive(Clone)]
pub struct ChatOptions {
    /// System prompt sent with every round
    pub system_prompt: String,

    /// Provider model identifier
    pub model_id: String,

    /// Provider region
    pub region: String,

    /// Base URL of the runtime endpoint
    pub endpoint: String,

    /// Bearer token, if the endpoint wants one
    pub api_key: Option<String>,

    /// Maximum tokens generated per invocation
    pub max_output_tokens: u32,

    /// Sampling temperature for streamed turns
    pub temperature: f32,

    /// Sampling temperature for the single-shot path
    pub evaluation_temperature: f32,

    /// Upper bound on model invocations per prompt
    pub max_rounds: u32,

    /// Request timeout in seconds
    pub timeout: u64,

    /// Reasoning token budget; `None` disables extended reasoning
    pub thinking_budget: Option<u32>,

    /// Guardrail reference sent with requests
    pub content_policy: Option<ContentPolicy>,

    /// Replay only this many of the most recent turns; `None` replays all
    pub max_history_turns: Option<usize>,
}

impl std::fmt::Debug for ChatOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatOptions")
            .field("system_prompt", &self.system_prompt)
            .field("model_id", &self.model_id)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("max_output_tokens", &self.max_output_tokens)
            .field("temperature", &self.temperature)
            .field("evaluation_temperature", &self.evaluation_temperature)
            .field("max_rounds", &self.max_rounds)
            .field("timeout", &self.timeout)
            .field("thinking_budget", &self.thinking_budget)
            .field("content_policy", &self.content_policy)
            .field("max_history_turns", &self.max_history_turns)
            .finish()
    }
}

impl ChatOptions {
    /// Create a new builder for ChatOptions
    pub fn builder() -> ChatOptionsBuilder {
        ChatOptionsBuilder::default()
    }

    /// Options resolved entirely from the environment and defaults
    pub fn from_env() -> Result<Self> {
        Self::builder().build()
    }
}

/// Builder for ChatOptions
#[derive(Debug, Default)]
pub struct ChatOptionsBuilder {
    system_prompt: Option<String>,
    model_id: Option<String>,
    region: Option<String>,
    endpoint: Option<String>,
    api_key: Option<String>,
    max_output_tokens: Option<u32>,
    temperature: Option<f32>,
    evaluation_temperature: Option<f32>,
    max_rounds: Option<u32>,
    timeout: Option<u64>,
    thinking_budget: Option<u32>,
    content_policy: Option<ContentPolicy>,
    max_history_turns: Option<usize>,
}

impl ChatOptionsBuilder {
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn evaluation_temperature(mut self, temp: f32) -> Self {
        self.evaluation_temperature = Some(temp);
        self
    }

    pub fn max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    pub fn timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn thinking_budget(mut self, budget: u32) -> Self {
        self.thinking_budget = Some(budget);
        self
    }

    pub fn content_policy(mut self, policy: ContentPolicy) -> Self {
        self.content_policy = Some(policy);
        self
    }

    pub fn max_history_turns(mut self, turns: usize) -> Self {
        self.max_history_turns = Some(turns);
        self
    }

    /// Validate and build. Unset endpoint, model and region fall back to the
    /// environment, then to defaults.
    pub fn build(self) -> Result<ChatOptions> {
        self.build_with(|key| env::var(key).ok())
    }

    fn build_with(self, lookup: impl Fn(&str) -> Option<String>) -> Result<ChatOptions> {
        let region = self
            .region
            .or_else(|| lookup(ENV_REGION))
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let endpoint = self
            .endpoint
            .or_else(|| lookup(ENV_ENDPOINT))
            .unwrap_or_else(|| default_endpoint(&region));
        let model_id = self
            .model_id
            .or_else(|| lookup(ENV_MODEL_ID))
            .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string());
        let api_key = self.api_key.or_else(|| lookup(ENV_API_KEY));

        let max_output_tokens = self.max_output_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS);
        let temperature = self.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        let evaluation_temperature = self.evaluation_temperature.unwrap_or(0.0);
        let max_rounds = self.max_rounds.unwrap_or(DEFAULT_MAX_ROUNDS);

        if model_id.trim().is_empty() {
            return Err(Error::config("model_id must not be empty"));
        }
        if endpoint.trim().is_empty() {
            return Err(Error::config("endpoint must not be empty"));
        }
        if max_output_tokens == 0 {
            return Err(Error::config("max_output_tokens must be positive"));
        }
        if max_rounds == 0 {
            return Err(Error::config("max_rounds must be at least 1"));
        }
        for (name, value) in [
            ("temperature", temperature),
            ("evaluation_temperature", evaluation_temperature),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::config(format!(
                    "{} must be between 0.0 and 1.0, got {}",
                    name, value
                )));
            }
        }
        if let Some(budget) = self.thinking_budget {
            if budget < MIN_THINKING_BUDGET || budget >= max_output_tokens {
                return Err(Error::config(format!(
                    "thinking_budget must be at least {} and below max_output_tokens ({}), got {}",
                    MIN_THINKING_BUDGET, max_output_tokens, budget
                )));
            }
        }

        Ok(ChatOptions {
            system_prompt: self.system_prompt.unwrap_or_default(),
            model_id,
            region,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            max_output_tokens,
            temperature,
            evaluation_temperature,
            max_rounds,
            timeout: self.timeout.unwrap_or(60),
            thinking_budget: self.thinking_budget,
            content_policy: self.content_policy,
            max_history_turns: self.max_history_turns,
        })
    }
}

/// Runtime endpoint for a region
pub fn default_endpoint(region: &str) -> String {
    format!("https://bedrock-runtime.{}.amazonaws.com", region)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_builder_defaults() {
        let options = ChatOptions::builder().build_with(no_env).unwrap();

        assert_eq!(options.system_prompt, "");
        assert_eq!(options.model_id, DEFAULT_MODEL_ID);
        assert_eq!(options.region, "us-east-1");
        assert_eq!(
            options.endpoint,
            "https://bedrock-runtime.us-east-1.amazonaws.com"
        );
        assert_eq!(options.api_key, None);
        assert_eq!(options.max_output_tokens, 2048);
        assert_eq!(options.temperature, 0.01);
        assert_eq!(options.evaluation_temperature, 0.0);
        assert_eq!(options.max_rounds, 5);
        assert_eq!(options.timeout, 60);
        assert_eq!(options.thinking_budget, None);
        assert_eq!(options.content_policy, None);
        assert_eq!(options.max_history_turns, None);
    }

    #[test]
    fn test_builder_explicit_values() {
        let options = ChatOptions::builder()
            .system_prompt("You answer questions about the grant program.")
            .model_id("anthropic.claude-3-5-sonnet-20240620-v1:0")
            .region("us-west-2")
            .endpoint("http://localhost:9000/")
            .api_key("secret")
            .max_output_tokens(4096)
            .temperature(0.2)
            .max_rounds(3)
            .timeout(30)
            .thinking_budget(2048)
            .content_policy(ContentPolicy::new("ii43q6095rvh", "Version 1"))
            .build_with(no_env)
            .unwrap();

        assert_eq!(options.region, "us-west-2");
        assert_eq!(options.endpoint, "http://localhost:9000");
        assert_eq!(options.api_key.as_deref(), Some("secret"));
        assert_eq!(options.max_rounds, 3);
        assert_eq!(options.thinking_budget, Some(2048));
        assert_eq!(
            options.content_policy.unwrap().guardrail_version,
            "Version 1"
        );
    }

    #[test]
    fn test_environment_fills_unset_values() {
        let env: HashMap<&str, &str> = [
            (ENV_REGION, "eu-central-1"),
            (ENV_MODEL_ID, "anthropic.claude-3-haiku-20240307-v1:0"),
            (ENV_API_KEY, "from-env"),
        ]
        .into_iter()
        .collect();

        let options = ChatOptions::builder()
            .build_with(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(options.region, "eu-central-1");
        assert_eq!(
            options.endpoint,
            "https://bedrock-runtime.eu-central-1.amazonaws.com"
        );
        assert_eq!(options.model_id, "anthropic.claude-3-haiku-20240307-v1:0");
        assert_eq!(options.api_key.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_explicit_values_beat_environment() {
        let options = ChatOptions::builder()
            .endpoint("http://explicit")
            .build_with(|key| (key == ENV_ENDPOINT).then(|| "http://from-env".to_string()))
            .unwrap();
        assert_eq!(options.endpoint, "http://explicit");
    }

    #[test]
    fn test_builder_rejects_invalid_values() {
        assert!(ChatOptions::builder().max_rounds(0).build_with(no_env).is_err());
        assert!(ChatOptions::builder().temperature(1.5).build_with(no_env).is_err());
        assert!(ChatOptions::builder().max_output_tokens(0).build_with(no_env).is_err());
        assert!(ChatOptions::builder().model_id("  ").build_with(no_env).is_err());
        assert!(ChatOptions::builder().thinking_budget(512).build_with(no_env).is_err());
        assert!(
            ChatOptions::builder()
                .max_output_tokens(2048)
                .thinking_budget(4096)
                .build_with(no_env)
                .is_err()
        );
    }

    #[test]
    fn test_debug_masks_api_key() {
        let options = ChatOptions::builder()
            .api_key("super-secret")
            .build_with(no_env)
            .unwrap();
        let debug = format!("{:?}", options);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("***"));
    }
}
