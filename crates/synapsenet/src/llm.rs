//! LLM transport — one operation: `generate(role, prompt, temperature)`.
//!
//! The production client speaks the OpenAI-compatible chat-completions
//! protocol over HTTP. The role selects a system preamble and a canonical
//! sampling temperature; everything else about the model is opaque to the
//! repair loop.
//!
//! Transient transport failures (429/502/503, connection errors, timeouts)
//! are retried with capped exponential backoff and jitter. Non-retryable
//! errors propagate and fail the run.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LlmEndpoint;
use crate::prompts;

/// LLM roles and their canonical sampling temperatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Planner,
    Executor,
    Critic,
    Mediator,
}

impl Role {
    /// Canonical per-role temperature.
    ///
    /// PLANNER  0.2 — structured JSON output; low creativity
    /// EXECUTOR 0.1 — deterministic tool calls
    /// CRITIC   0.4 — analytical reasoning; moderate variance
    /// MEDIATOR 0.0 — rule-based; fully deterministic
    pub fn temperature(self) -> f64 {
        match self {
            Self::Planner => 0.2,
            Self::Executor => 0.1,
            Self::Critic => 0.4,
            Self::Mediator => 0.0,
        }
    }

    /// System preamble prepended by the transport.
    pub fn preamble(self) -> &'static str {
        match self {
            Self::Planner => prompts::PLANNER_PREAMBLE,
            Self::Executor => prompts::EXECUTOR_PREAMBLE,
            Self::Critic => prompts::CRITIC_PREAMBLE,
            Self::Mediator => prompts::MEDIATOR_PREAMBLE,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planner => write!(f, "planner"),
            Self::Executor => write!(f, "executor"),
            Self::Critic => write!(f, "critic"),
            Self::Mediator => write!(f, "mediator"),
        }
    }
}

/// Transport errors. `Transient` is retried internally; anything that
/// escapes this module is final.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Transport(String),

    #[error("LLM returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("LLM response malformed: {0}")]
    Malformed(String),

    #[error("LLM retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// The single LLM operation the repair loop depends on.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate text for `prompt` under the given role and temperature.
    /// Returns the raw model text; never panics on empty output.
    async fn generate(&self, role: Role, prompt: &str, temperature: f64)
        -> Result<String, LlmError>;
}

// ---------------------------------------------------------------------------
// Backoff policy
// ---------------------------------------------------------------------------

/// Exponential backoff with jitter for transient transport failures.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_retries: u32,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_retries: 3,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (1-based; attempt 0 is the first try).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32 - 1);
        let delay = delay.min(self.max_delay_ms as f64);
        let delay = if self.jitter {
            // Up to 25% jitter
            delay + delay * 0.25 * subsec_unit()
        } else {
            delay
        };
        Duration::from_millis(delay as u64)
    }
}

/// Cheap uniform-ish value in [0, 1) from the clock's sub-second nanos.
fn subsec_unit() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos as f64) / (u32::MAX as f64)
}

/// Classify whether a transport error is transient (connection failures,
/// rate limits, proxy hiccups) and worth retrying, vs permanent (auth
/// errors, schema mismatches).
pub fn is_transient_error(err: &str) -> bool {
    let lower = err.to_ascii_lowercase();
    err.contains("429")
        || err.contains("502")
        || err.contains("503")
        || lower.contains("connection")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("error sending request")
        || lower.contains("broken pipe")
        || lower.contains("reset by peer")
}

// ---------------------------------------------------------------------------
// HTTP client (OpenAI-compatible chat completions)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Production client over an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpLlmClient {
    pub fn new(endpoint: &LlmEndpoint) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(endpoint.timeout)
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            model: endpoint.model.clone(),
            api_key: endpoint.api_key.clone(),
            backoff: BackoffPolicy {
                max_retries: endpoint.max_retries,
                ..BackoffPolicy::default()
            },
        })
    }

    async fn call_once(
        &self,
        role: Role,
        prompt: &str,
        temperature: f64,
    ) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: role.preamble().to_string(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: prompt.to_string(),
                },
            ],
            temperature,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.http.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;

        let content = chat
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        debug!(role = %role, response_len = content.len(), "LLM response received");
        Ok(content)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(
        &self,
        role: Role,
        prompt: &str,
        temperature: f64,
    ) -> Result<String, LlmError> {
        let mut last_err = String::new();
        for attempt in 0..=self.backoff.max_retries {
            if attempt > 0 {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(
                    role = %role,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %last_err,
                    "Transient LLM error — retrying"
                );
                tokio::time::sleep(delay).await;
            }

            match self.call_once(role, prompt, temperature).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    let err_str = e.to_string();
                    if !is_transient_error(&err_str) {
                        return Err(e);
                    }
                    last_err = err_str;
                }
            }
        }
        Err(LlmError::Exhausted {
            attempts: self.backoff.max_retries + 1,
            last: last_err,
        })
    }
}

// ---------------------------------------------------------------------------
// Scripted client (test double)
// ---------------------------------------------------------------------------

/// Deterministic client that replays a queue of canned responses.
///
/// Pops one response per `generate` call regardless of role; returns the
/// empty string once the queue is drained, which downstream parsers treat
/// as malformed output and resolve to their fallbacks.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
        }
    }

    /// Number of unconsumed responses.
    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(
        &self,
        role: Role,
        _prompt: &str,
        _temperature: f64,
    ) -> Result<String, LlmError> {
        let next = self
            .responses
            .lock()
            .map(|mut q| q.pop_front())
            .unwrap_or(None)
            .unwrap_or_default();
        debug!(role = %role, response_len = next.len(), "Scripted LLM response");
        Ok(next)
    }
}
