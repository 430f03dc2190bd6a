// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Model client adapter: synchronous request/response with token and cost
//! accounting, errors classified for retry decisions.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;

use mc_core::ErrorTag;

/// One model invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub provider: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Model output with usage accounting
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

impl Default for ModelResponse {
    fn default() -> Self {
        Self { text: "ok".to_string(), tokens_used: 10, cost_usd: 0.0001 }
    }
}

/// Model call failures, classified into
/// `{timeout, rate_limited, 4xx, 5xx, other}`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider rate limited the request")]
    RateLimited,
    #[error("provider client error: status {status}")]
    Client { status: u16 },
    #[error("provider server error: status {status}")]
    Server { status: u16 },
    #[error("model call failed: {0}")]
    Other(String),
}

impl ModelError {
    /// Map onto the pipeline error taxonomy. 408 behaves like a timeout and
    /// 429 like provider back-pressure; unclassified transport failures are
    /// treated as retryable server trouble.
    pub fn tag(&self) -> ErrorTag {
        match self {
            ModelError::Timeout(_) => ErrorTag::ModelTimeout,
            ModelError::RateLimited => ErrorTag::ModelRateLimited,
            ModelError::Client { status: 408 } => ErrorTag::ModelTimeout,
            ModelError::Client { status: 429 } => ErrorTag::ModelRateLimited,
            ModelError::Client { .. } => ErrorTag::Model4xx,
            ModelError::Server { .. } => ErrorTag::Model5xx,
            ModelError::Other(_) => ErrorTag::Model5xx,
        }
    }
}

/// A synchronous model provider
#[async_trait]
pub trait ModelClient: Send + Sync + 'static {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// Per-provider endpoint and pricing
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub usd_per_1k_input: f64,
    pub usd_per_1k_output: f64,
}

/// HTTP model client speaking a chat-completions wire shape.
///
/// Providers are routed by name; unknown providers fail the call rather
/// than guessing an endpoint.
pub struct HttpModelClient {
    client: reqwest::Client,
    providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct WireChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: WireUsage,
}

impl HttpModelClient {
    pub fn new(providers: HashMap<String, ProviderConfig>) -> Self {
        Self { client: reqwest::Client::new(), providers }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let provider = self
            .providers
            .get(&request.provider)
            .ok_or_else(|| ModelError::Other(format!("unknown provider {:?}", request.provider)))?;
        tracing::debug!(provider = %request.provider, model = %request.model, "invoking model");

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system_prompt {
            messages.push(WireMessage { role: "system", content: system });
        }
        messages.push(WireMessage { role: "user", content: &request.prompt });
        let body = WireRequest {
            model: &request.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let send = self
            .client
            .post(format!("{}/chat/completions", provider.base_url))
            .bearer_auth(&provider.api_key)
            .json(&body)
            .timeout(request.timeout)
            .send();
        let response = send.await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout(request.timeout)
            } else {
                ModelError::Other(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        match status {
            200..=299 => {}
            429 => return Err(ModelError::RateLimited),
            400..=499 => return Err(ModelError::Client { status }),
            _ => return Err(ModelError::Server { status }),
        }

        let wire: WireResponse =
            response.json().await.map_err(|e| ModelError::Other(e.to_string()))?;
        let text = wire
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ModelError::Other("response carried no choices".to_string()))?;
        let tokens_used = wire.usage.prompt_tokens + wire.usage.completion_tokens;
        let cost_usd = (wire.usage.prompt_tokens as f64 / 1000.0) * provider.usd_per_1k_input
            + (wire.usage.completion_tokens as f64 / 1000.0) * provider.usd_per_1k_output;
        Ok(ModelResponse { text, tokens_used, cost_usd })
    }
}

/// Scripted client for tests: pops canned outcomes in order, then falls
/// back to a default response. Records every request it sees.
#[derive(Default)]
pub struct ScriptedModelClient {
    outcomes: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
    requests: Mutex<Vec<ModelRequest>>,
    fallback: Mutex<ModelResponse>,
}

impl ScriptedModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the response used when the script runs dry.
    pub fn respond_with(&self, response: ModelResponse) {
        *self.fallback.lock() = response;
    }

    /// Queue one scripted outcome.
    pub fn push(&self, outcome: Result<ModelResponse, ModelError>) {
        self.outcomes.lock().push_back(outcome);
    }

    /// Queue `n` copies of an error outcome.
    pub fn push_errors(&self, error: ModelError, n: usize) {
        let mut outcomes = self.outcomes.lock();
        for _ in 0..n {
            outcomes.push_back(Err(error.clone()));
        }
    }

    /// All requests seen so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        self.requests.lock().push(request);
        if let Some(outcome) = self.outcomes.lock().pop_front() {
            return outcome;
        }
        Ok(self.fallback.lock().clone())
    }
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
