//! Relay LLM Providers
//!
//! OpenAI-compatible chat completion client, speech-to-text and billing

pub mod billing;
pub mod transcription;

pub use billing::{BillingError, BillingSource, CreditGrants, OpenAIBilling};
pub use transcription::{Transcriber, WhisperTranscriber};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::time::sleep;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call sampling knobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub model: String,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

impl ChatResponse {
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub window_secs: u64,
    pub initial_delay_secs: u64,
    pub backoff_factor: u32,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            window_secs: 60,
            initial_delay_secs: 2,
            backoff_factor: 2,
            max_delay_secs: 10,
        }
    }
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> Result<ChatResponse>;
}

#[derive(Deserialize)]
struct CompletionWire {
    model: Option<String>,
    choices: Option<Vec<ChoiceWire>>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChoiceWire {
    message: Option<MessageWire>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct MessageWire {
    content: Option<String>,
}

/// Outcome of one HTTP round trip.
enum Attempt {
    Done(Result<ChatResponse>),
    Transient {
        error: anyhow::Error,
        headers: HeaderMap,
    },
}

pub struct OpenAICompatibleProvider {
    client: Client,
    name: String,
    api_key: String,
    base_url: String,
    retry_policy: RetryPolicy,
}

impl OpenAICompatibleProvider {
    pub fn new(
        name: String,
        api_key: String,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            name,
            api_key,
            base_url: base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            retry_policy: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn truncate_for_error(text: &str, max_chars: usize) -> String {
        if text.chars().count() <= max_chars {
            text.to_string()
        } else {
            let truncated: String = text.chars().take(max_chars).collect();
            format!("{}...", truncated)
        }
    }

    fn request_body(
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
        });
        if let Some(temperature) = options.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }

    async fn attempt(&self, url: &str, model: &str, body: &serde_json::Value) -> Attempt {
        let response = match self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if Self::is_retryable_reqwest(&err) => {
                return Attempt::Transient {
                    error: err.into(),
                    headers: HeaderMap::new(),
                }
            }
            Err(err) => return Attempt::Done(Err(err.into())),
        };

        let status = response.status();
        let headers = response.headers().clone();
        let raw_body = match response.text().await {
            Ok(text) => text,
            Err(err) => return Attempt::Done(Err(err.into())),
        };

        if status.is_success() {
            let parsed = serde_json::from_str(&raw_body)
                .map_err(|e| {
                    anyhow!(
                        "Provider response decode failed at {}: {} | body={}",
                        url,
                        e,
                        Self::truncate_for_error(&raw_body, 600)
                    )
                })
                .and_then(|value| Self::parse_response(value, model));
            return Attempt::Done(parsed);
        }

        let error = anyhow!(
            "Provider HTTP {} at {}: {}",
            status,
            url,
            Self::truncate_for_error(&raw_body, 600)
        );
        if Self::is_retryable_status(status.as_u16()) {
            Attempt::Transient { error, headers }
        } else {
            Attempt::Done(Err(error))
        }
    }

    /// Retries transient failures until the policy window is used up.
    async fn request_chat(&self, model: &str, body: serde_json::Value) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let start = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            match self.attempt(&url, model, &body).await {
                Attempt::Done(result) => return result,
                Attempt::Transient { error, headers } => {
                    let Some(delay) = Self::next_retry_delay(
                        &self.retry_policy,
                        attempt,
                        &headers,
                        start.elapsed(),
                    ) else {
                        return Err(error);
                    };
                    tracing::warn!(
                        provider = %self.name,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying provider request after transient failure"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn parse_response(response: serde_json::Value, requested_model: &str) -> Result<ChatResponse> {
        if let Some(error) = response.get("error") {
            return Err(anyhow!("API error: {}", error));
        }

        let wire: CompletionWire = serde_json::from_value(response)
            .map_err(|e| anyhow!("Malformed provider response: {}", e))?;
        let choice = wire
            .choices
            .ok_or_else(|| anyhow!("Missing 'choices' array in provider response"))?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty 'choices' array in provider response"))?;
        let message = choice
            .message
            .ok_or_else(|| anyhow!("Missing 'message' object in provider response"))?;

        Ok(ChatResponse {
            content: message.content,
            model: wire.model.unwrap_or_else(|| requested_model.to_string()),
            usage: wire.usage,
            finish_reason: choice.finish_reason,
        })
    }

    fn is_retryable_status(status: u16) -> bool {
        matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
    }

    fn is_retryable_reqwest(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect()
    }

    /// `None` once the retry window is spent.
    fn next_retry_delay(
        policy: &RetryPolicy,
        attempt: u32,
        headers: &HeaderMap,
        elapsed: Duration,
    ) -> Option<Duration> {
        let window = Duration::from_secs(policy.window_secs.max(1));
        let remaining = window.checked_sub(elapsed).filter(|r| !r.is_zero())?;

        let delay = Self::parse_retry_after_headers(headers)
            .unwrap_or_else(|| Self::exponential_delay(policy, attempt))
            .min(remaining);
        Some(delay.max(Duration::from_millis(1)))
    }

    fn exponential_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let step = (policy.backoff_factor.max(1) as u64).saturating_pow(exponent);
        let secs = policy
            .initial_delay_secs
            .max(1)
            .saturating_mul(step)
            .min(policy.max_delay_secs.max(1));
        Duration::from_secs(secs)
    }

    /// `retry-after-ms` wins over `retry-after`, which may be seconds or an
    /// HTTP date.
    fn parse_retry_after_headers(headers: &HeaderMap) -> Option<Duration> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
        };

        if let Some(ms) = header("retry-after-ms").and_then(|v| v.parse::<u64>().ok()) {
            if ms > 0 {
                return Some(Duration::from_millis(ms));
            }
        }

        let value = header("retry-after")?;
        match value.parse::<u64>() {
            Ok(0) => None,
            Ok(secs) => Some(Duration::from_secs(secs)),
            Err(_) => {
                let target = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
                let millis = (target - Utc::now()).num_milliseconds();
                (millis > 0).then(|| Duration::from_millis(millis as u64))
            }
        }
    }
}

#[async_trait::async_trait]
impl Provider for OpenAICompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> Result<ChatResponse> {
        let body = Self::request_body(model, &messages, options);
        self.request_chat(model, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::{ChatMessage, ChatOptions, OpenAICompatibleProvider, RetryPolicy};
    use reqwest::header::{HeaderMap, HeaderValue};
    use std::time::Duration;

    #[test]
    fn parse_response_errors_on_missing_choices() {
        let response = serde_json::json!({ "id": "x" });
        assert!(OpenAICompatibleProvider::parse_response(response, "model").is_err());
    }

    #[test]
    fn parse_response_surfaces_api_error_object() {
        let response = serde_json::json!({
            "error": { "message": "Incorrect API key provided", "type": "invalid_request_error" }
        });
        let err = OpenAICompatibleProvider::parse_response(response, "model")
            .expect_err("api error must fail");
        assert!(err.to_string().contains("Incorrect API key"));
    }

    #[test]
    fn parse_response_reads_content_and_model() {
        let response = serde_json::json!({
            "model": "real-model",
            "choices": [
                {
                    "message": { "role": "assistant", "content": "hello" },
                    "finish_reason": "stop"
                }
            ],
            "usage": {
                "prompt_tokens": 1,
                "completion_tokens": 2,
                "total_tokens": 3
            }
        });

        let parsed = OpenAICompatibleProvider::parse_response(response, "fallback-model")
            .expect("expected parse success");
        assert_eq!(parsed.text(), "hello");
        assert_eq!(parsed.model, "real-model");
        assert_eq!(parsed.finish_reason.as_deref(), Some("stop"));
        assert_eq!(parsed.usage.map(|u| u.total_tokens), Some(3));
    }

    #[test]
    fn parse_response_defaults_model_to_requested() {
        let response = serde_json::json!({
            "choices": [ { "message": { "content": null } } ]
        });
        let parsed = OpenAICompatibleProvider::parse_response(response, "gpt-x")
            .expect("expected parse success");
        assert_eq!(parsed.model, "gpt-x");
        assert_eq!(parsed.text(), "");
    }

    #[test]
    fn request_body_includes_only_set_options() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let plain =
            OpenAICompatibleProvider::request_body("gpt-4o", &messages, &ChatOptions::default());
        assert_eq!(plain["model"], "gpt-4o");
        assert_eq!(plain["messages"][0]["role"], "system");
        assert_eq!(plain["messages"][1]["content"], "hi");
        assert!(plain.get("temperature").is_none());
        assert!(plain.get("max_tokens").is_none());

        let tuned = OpenAICompatibleProvider::request_body(
            "gpt-4o",
            &messages,
            &ChatOptions {
                temperature: Some(0.5),
                max_tokens: Some(3),
            },
        );
        assert_eq!(tuned["max_tokens"], 3);
        assert_eq!(tuned["temperature"], 0.5);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let provider = OpenAICompatibleProvider::new(
            "test".to_string(),
            "key".to_string(),
            Some("https://proxy.local/v1/".to_string()),
            Duration::from_secs(5),
        )
        .expect("client");
        assert_eq!(provider.base_url(), "https://proxy.local/v1");
    }

    #[test]
    fn retry_header_precedence_prefers_retry_after_ms() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after-ms", HeaderValue::from_static("1500"));
        headers.insert("retry-after", HeaderValue::from_static("99"));

        let delay =
            OpenAICompatibleProvider::parse_retry_after_headers(&headers).expect("expected delay");
        assert_eq!(delay, Duration::from_millis(1500));
    }

    #[test]
    fn retry_delay_is_capped_by_remaining_window() {
        let policy = RetryPolicy {
            window_secs: 5,
            ..RetryPolicy::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("30"));
        let delay = OpenAICompatibleProvider::next_retry_delay(
            &policy,
            1,
            &headers,
            Duration::from_secs(3),
        )
        .expect("delay within window");
        assert_eq!(delay, Duration::from_secs(2));

        assert!(OpenAICompatibleProvider::next_retry_delay(
            &policy,
            1,
            &HeaderMap::new(),
            Duration::from_secs(6)
        )
        .is_none());
    }

    #[test]
    fn retry_fallback_sequence_has_exponential_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(
            OpenAICompatibleProvider::exponential_delay(&policy, 1),
            Duration::from_secs(2)
        );
        assert_eq!(
            OpenAICompatibleProvider::exponential_delay(&policy, 2),
            Duration::from_secs(4)
        );
        assert_eq!(
            OpenAICompatibleProvider::exponential_delay(&policy, 4),
            Duration::from_secs(10)
        );
    }
}
