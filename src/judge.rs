use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{JudgeSettings, RetryPolicy};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JudgeError {
    #[error("rate limited by judge service")]
    RateLimited { retry_after: Option<Duration> },
    #[error("judge call timed out")]
    Timeout,
    #[error("judge transport error: {0}")]
    Transport(String),
    #[error("judge returned http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed judge reply: {0}")]
    Malformed(String),
}

impl JudgeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout | Self::Transport(_) => true,
            Self::Http { status, .. } => (500..=599).contains(status),
            Self::Malformed(_) => false,
        }
    }
}

/// A text-in, text-out model endpoint.
#[async_trait]
pub trait JudgeService: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, JudgeError>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Value]>,
}

fn chat_request<'a>(settings: &'a JudgeSettings, prompt: &'a str) -> ChatRequest<'a> {
    ChatRequest {
        model: &settings.model,
        messages: vec![ChatMessage {
            role: "user",
            content: prompt,
        }],
        temperature: settings.temperature,
        seed: settings.seed,
        max_tokens: settings.max_tokens,
        tools: settings.tools.as_deref(),
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiCompatJudge {
    client: reqwest::Client,
    settings: JudgeSettings,
    endpoint: String,
}

impl OpenAiCompatJudge {
    pub fn new(settings: JudgeSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("failed to build judge client")?;
        let endpoint = format!("{}/chat/completions", settings.base_url);

        Ok(Self {
            client,
            settings,
            endpoint,
        })
    }
}

#[async_trait]
impl JudgeService for OpenAiCompatJudge {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn complete(&self, prompt: &str) -> Result<String, JudgeError> {
        let request = chat_request(&self.settings, prompt);

        let response = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.settings.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    JudgeError::Timeout
                } else {
                    JudgeError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(JudgeError::RateLimited {
                retry_after: parse_retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JudgeError::Http {
                status: status.as_u16(),
                body: crate::util::truncate_chars(&body, 300).to_string(),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| JudgeError::Malformed(format!("invalid response body: {err}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| JudgeError::Malformed("response carried no message content".to_string()))
    }
}

pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers
        .get("retry-after")
        .or_else(|| headers.get("x-ratelimit-reset-requests"))
        .and_then(|value| value.to_str().ok())?
        .trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Some(stripped) = value.strip_suffix('s')
        && let Ok(secs) = stripped.parse::<f64>()
        && secs.is_finite()
        && secs >= 0.0
    {
        return Some(Duration::from_secs_f64(secs));
    }

    Some(Duration::from_secs(5))
}

/// Wraps a judge with an in-flight cap, bounded retries and the run deadline.
pub struct GuardedJudge {
    inner: Arc<dyn JudgeService>,
    limiter: Arc<Semaphore>,
    retry: RetryPolicy,
    deadline: Option<Instant>,
}

impl GuardedJudge {
    pub fn new(inner: Arc<dyn JudgeService>, limiter: Arc<Semaphore>, retry: RetryPolicy) -> Self {
        Self {
            inner,
            limiter,
            retry,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    async fn attempt(&self, prompt: &str) -> Result<String, JudgeError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| JudgeError::Transport("judge limiter closed".to_string()))?;
        self.inner.complete(prompt).await
    }

    async fn complete_with_retry(&self, prompt: &str) -> Result<String, JudgeError> {
        let mut attempt = 0;
        loop {
            match self.attempt(prompt).await {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let mut wait = self.retry.delay_for(attempt);
                    if let JudgeError::RateLimited {
                        retry_after: Some(retry_after),
                    } = &err
                    {
                        wait = wait.max(*retry_after).min(self.retry.max_delay);
                    }
                    debug!(
                        judge = %self.inner.name(),
                        attempt = attempt + 1,
                        backoff_ms = wait.as_millis() as u64,
                        error = %err,
                        "retrying judge call"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(
                        judge = %self.inner.name(),
                        attempts = attempt + 1,
                        error = %err,
                        "judge call failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl JudgeService for GuardedJudge {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, prompt: &str) -> Result<String, JudgeError> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.complete_with_retry(prompt))
                .await
                .unwrap_or(Err(JudgeError::Timeout)),
            None => self.complete_with_retry(prompt).await,
        }
    }
}

/// Recovers a JSON object from a model reply that may carry code fences,
/// prose around the object, or broken JSON.
pub fn parse_json_object(raw: &str) -> Result<Map<String, Value>, JudgeError> {
    let cleaned = strip_code_fence(raw);

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(cleaned) {
        return Ok(map);
    }

    if let Some(candidate) = first_balanced_object(cleaned)
        && let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate)
    {
        return Ok(map);
    }

    salvage_fields(cleaned).ok_or_else(|| {
        JudgeError::Malformed(format!(
            "no json object in reply: {}",
            crate::util::truncate_chars(raw.trim(), 120)
        ))
    })
}

/// Reads a boolean verdict from the first present key. Accepts JSON booleans
/// and the usual string spellings.
pub fn verdict_flag(map: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::Bool(value) => Some(*value),
        Value::String(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "supported" | "support" | "correct" | "aligned" => Some(true),
            "false" | "no" | "unsupported" | "not supported" | "incorrect" | "misaligned" => {
                Some(false)
            }
            _ => None,
        },
        _ => None,
    })
}

pub fn reason_text(map: &Map<String, Value>) -> String {
    map.get("reason")
        .and_then(Value::as_str)
        .map(|reason| reason.trim().to_string())
        .unwrap_or_default()
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.strip_prefix("json").unwrap_or(rest);
    body.strip_suffix("```").unwrap_or(body).trim()
}

fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    None
}

static VERDICT_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(match|decision|supported|is_academic_paper)"\s*:\s*"?(true|false)"?"#)
        .expect("verdict field regex is valid")
});

static REASON_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""reason"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("reason field regex is valid")
});

fn salvage_fields(text: &str) -> Option<Map<String, Value>> {
    let mut map = Map::new();
    for captures in VERDICT_FIELD_RE.captures_iter(text) {
        map.insert(
            captures[1].to_string(),
            Value::Bool(&captures[2] == "true"),
        );
    }
    if map.is_empty() {
        return None;
    }
    if let Some(captures) = REASON_FIELD_RE.captures(text) {
        map.insert("reason".to_string(), Value::String(captures[1].to_string()));
    }

    Some(map)
}
