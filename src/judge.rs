use crate::types::{PipelineError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// An opaque text-completion backend. One user-role prompt per call; an
/// empty completion counts as a failure.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn complete(&self, prompt: &str, model: &str, max_tokens: u32) -> Result<String>;
}

/// OpenRouter-compatible chat-completions client.
pub struct OpenRouterJudge {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenRouterJudge {
    pub const DEFAULT_ENDPOINT: &'static str = "https://openrouter.ai/api/v1/chat/completions";

    pub fn new(api_key: String) -> Self {
        Self::with_endpoint(api_key, Self::DEFAULT_ENDPOINT.to_string())
    }

    pub fn with_endpoint(api_key: String, endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl Judge for OpenRouterJudge {
    async fn complete(&self, prompt: &str, model: &str, max_tokens: u32) -> Result<String> {
        debug!("Calling judge model {}", model);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": model,
                "messages": [{ "role": "user", "content": prompt }],
                "max_tokens": max_tokens,
                "temperature": 0.3,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Judge(format!(
                "{} returned HTTP {}: {}",
                model,
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let data: serde_json::Value = response.json().await?;
        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();

        if content.is_empty() {
            return Err(PipelineError::Judge(format!("{} returned empty content", model)));
        }

        Ok(content)
    }
}

/// Ordered fallback chain over one judge backend. Each pipeline stage holds
/// its own chain; a stage only fails once every model in its list has.
#[derive(Clone)]
pub struct JudgeChain {
    judge: Arc<dyn Judge>,
    models: Vec<String>,
    max_tokens: u32,
}

impl JudgeChain {
    pub fn new(judge: Arc<dyn Judge>, models: Vec<String>, max_tokens: u32) -> Self {
        Self {
            judge,
            models,
            max_tokens,
        }
    }

    /// Try each model in order, returning the first non-empty completion.
    pub async fn invoke(&self, prompt: &str) -> Result<String> {
        let mut last_error = PipelineError::Judge("no models configured".to_string());

        for model in &self.models {
            match self.judge.complete(prompt, model, self.max_tokens).await {
                Ok(text) if !text.trim().is_empty() => return Ok(text),
                Ok(_) => {
                    warn!("Model {} returned empty output, trying next", model);
                    last_error = PipelineError::Judge(format!("{} returned empty output", model));
                }
                Err(e) => {
                    warn!("Model {} failed: {}, trying next", model, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Like `invoke`, but a completion that does not parse as a single JSON
    /// object also advances the chain.
    pub async fn invoke_json<T: DeserializeOwned>(&self, prompt: &str) -> Result<T> {
        let mut last_error = PipelineError::Judge("no models configured".to_string());

        for model in &self.models {
            let text = match self.judge.complete(prompt, model, self.max_tokens).await {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) => {
                    warn!("Model {} returned empty output, trying next", model);
                    last_error = PipelineError::Judge(format!("{} returned empty output", model));
                    continue;
                }
                Err(e) => {
                    warn!("Model {} failed: {}, trying next", model, e);
                    last_error = e;
                    continue;
                }
            };

            match serde_json::from_str(strip_code_fences(&text)) {
                Ok(parsed) => return Ok(parsed),
                Err(e) => {
                    warn!("Model {} returned unparseable JSON: {}, trying next", model, e);
                    last_error = PipelineError::Judge(format!("{} unparseable output: {}", model, e));
                }
            }
        }

        Err(last_error)
    }
}

/// Models wrap JSON in markdown fences often enough that we strip them
/// before parsing.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

type Script = VecDeque<std::result::Result<String, String>>;

/// Scripted judge for tests: per-model response queues plus call counters,
/// so tests can assert which stage touched which backend.
#[derive(Default)]
pub struct MockJudge {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, usize>>,
    fail_unscripted: bool,
    default_response: Option<String>,
}

impl MockJudge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call on every model fails, exercising the fallback paths.
    pub fn failing() -> Self {
        Self {
            fail_unscripted: true,
            ..Self::default()
        }
    }

    /// Responses for unscripted models fall back to this text.
    pub fn with_default(default_response: impl Into<String>) -> Self {
        Self {
            default_response: Some(default_response.into()),
            ..Self::default()
        }
    }

    /// Queue a successful response for one model.
    pub fn script(&self, model: &str, response: impl Into<String>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(Ok(response.into()));
    }

    /// Queue a failure for one model.
    pub fn script_err(&self, model: &str, message: impl Into<String>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(Err(message.into()));
    }

    /// Number of completions requested from one model so far.
    pub fn calls(&self, model: &str) -> usize {
        *self.calls.lock().unwrap().get(model).unwrap_or(&0)
    }
}

#[async_trait]
impl Judge for MockJudge {
    async fn complete(&self, _prompt: &str, model: &str, _max_tokens: u32) -> Result<String> {
        *self.calls.lock().unwrap().entry(model.to_string()).or_insert(0) += 1;

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(model)
            .and_then(|queue| queue.pop_front());

        match scripted {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(PipelineError::Judge(message)),
            None => {
                if self.fail_unscripted {
                    Err(PipelineError::Judge(format!("{} is scripted to fail", model)))
                } else if let Some(default) = &self.default_response {
                    Ok(default.clone())
                } else {
                    Err(PipelineError::Judge(format!("no script for model {}", model)))
                }
            }
        }
    }
}
