//! Chat-completions client used to obtain participant decisions.
//!
//! The endpoint is stateless: every call carries the full conversation.
//! Transient failures (429, 5xx, timeouts) are retried with exponential
//! backoff, honoring a server-suggested delay when the response carries one.
//! Exhausted retries and non-retryable failures come back as
//! `SendOutcome::Failed`, never as an error.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// A chat message with role and content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Final result of a `send` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Text of the first completion
    Delivered(String),
    /// No text could be obtained; the reason is for logs only
    Failed(String),
}

impl SendOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }

    /// The delivered text, or the empty string on failure.
    pub fn text(&self) -> &str {
        match self {
            Self::Delivered(text) => text,
            Self::Failed(_) => "",
        }
    }
}

/// Result of a single HTTP attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Success(String),
    /// Transient failure; `Some` carries the server-suggested delay
    RetryAfter(Option<Duration>),
    NoRetry(String),
}

/// Anything that can turn a conversation into the participant's next reply.
#[async_trait]
pub trait DecisionClient: Send + Sync {
    async fn send(&self, conversation: &[ChatMessage]) -> SendOutcome;
}

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    /// Upper bound on any single wait, server hints included
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            multiplier: 3,
            max_delay: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt `attempt` (0-based): base * multiplier^attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(self.multiplier.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// Wait before the next attempt: the server hint when present, capped.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) => hint.min(self.max_delay),
            None => self.backoff(attempt),
        }
    }
}

/// Request body for chat completions.
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible chat-completions endpoint (OpenRouter by default).
#[derive(Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    policy: RetryPolicy,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("policy", &self.policy)
            .finish()
    }
}

impl OpenRouterClient {
    /// Create a client bound to one model.
    ///
    /// Fails when the credential is empty or the HTTP client cannot be built.
    pub fn new(
        endpoint: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
        policy: RetryPolicy,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            anyhow::bail!("No API key provided for model {}", model);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            policy,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn attempt(&self, conversation: &[ChatMessage]) -> AttemptResult {
        let request = ChatRequest {
            model: &self.model,
            messages: conversation,
            stream: false,
        };

        let response = match self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("X-Title", "BART LLM Experiment")
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return AttemptResult::RetryAfter(None),
            Err(e) => return AttemptResult::NoRetry(format!("request failed: {e}")),
        };

        let status = response.status();
        if !status.is_success() {
            let header_hint = retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            if is_retryable(status) {
                return AttemptResult::RetryAfter(header_hint.or_else(|| retry_delay_hint(&body)));
            }
            return AttemptResult::NoRetry(format!("status {status}: {body}"));
        }

        match response.json::<ChatResponse>().await {
            Ok(parsed) => match parsed.choices.into_iter().next() {
                Some(choice) => AttemptResult::Success(choice.message.content.unwrap_or_default()),
                None => AttemptResult::NoRetry("no choices in response".to_string()),
            },
            Err(e) if e.is_timeout() => AttemptResult::RetryAfter(None),
            Err(e) => AttemptResult::NoRetry(format!("malformed response: {e}")),
        }
    }
}

#[async_trait]
impl DecisionClient for OpenRouterClient {
    async fn send(&self, conversation: &[ChatMessage]) -> SendOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 0..max_attempts {
            match self.attempt(conversation).await {
                AttemptResult::Success(text) => return SendOutcome::Delivered(text),
                AttemptResult::NoRetry(reason) => {
                    warn!(model = %self.model, reason = %reason, "Chat request failed");
                    return SendOutcome::Failed(reason);
                }
                AttemptResult::RetryAfter(hint) => {
                    if attempt + 1 >= max_attempts {
                        break;
                    }
                    let delay = self.policy.delay(attempt, hint);
                    warn!(
                        model = %self.model,
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs_f64(),
                        "Transient chat failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        debug!(model = %self.model, attempts = max_attempts, "Retries exhausted");
        SendOutcome::Failed(format!("retries exhausted after {max_attempts} attempts"))
    }
}

/// 429 and 5xx are worth retrying.
pub fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_seconds)
}

/// Find a retry delay inside an error body, e.g. `"retryDelay": "7s"` or
/// `"retry_after": 12`.
pub fn retry_delay_hint(body: &str) -> Option<Duration> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| {
            Regex::new(r#"(?i)"retry_?(?:after|delay)"\s*:\s*"?(\d+(?:\.\d+)?)s?"?"#).ok()
        })
        .as_ref()?;
    re.captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| parse_seconds(m.as_str()))
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().trim_end_matches('s').parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(5));
        assert_eq!(policy.backoff(1), Duration::from_secs(15));
        assert_eq!(policy.backoff(2), Duration::from_secs(45));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_retry_delay_hint() {
        assert_eq!(
            retry_delay_hint(r#"{"error":{"details":[{"retryDelay":"7s"}]}}"#),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            retry_delay_hint(r#"{"error":{"metadata":{"retry_after": 12}}}"#),
            Some(Duration::from_secs(12))
        );
        assert_eq!(
            retry_delay_hint(r#"{"retryAfter":"1.5"}"#),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(retry_delay_hint(r#"{"error":"rate limited"}"#), None);
    }

    #[test]
    fn test_oversized_hints_are_ignored() {
        assert_eq!(
            retry_delay_hint(r#"{"retry_after": 99999999999999999999999}"#),
            None
        );
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "1e30".parse().unwrap());
        assert_eq!(retry_after_header(&headers), None);
    }

    #[test]
    fn test_hinted_delay_is_capped() {
        let policy = RetryPolicy::default();
        let day = retry_delay_hint(r#"{"retry_after": 86400}"#);
        assert_eq!(policy.delay(0, day), policy.max_delay);
        assert_eq!(
            policy.delay(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(policy.delay(1, None), Duration::from_secs(15));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "30".parse().unwrap());
        assert_eq!(retry_after_header(&headers), Some(Duration::from_secs(30)));
        assert_eq!(retry_after_header(&HeaderMap::new()), None);
    }

    #[test]
    fn test_client_requires_credential() {
        let result = OpenRouterClient::new(
            "http://localhost:8000",
            "  ",
            "openai/gpt-4o",
            Duration::from_secs(60),
            RetryPolicy::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_endpoint_trailing_slash() {
        let client = OpenRouterClient::new(
            "http://localhost:8000/v1/chat/completions/",
            "key",
            "openai/gpt-4o",
            Duration::from_secs(60),
            RetryPolicy::default(),
        )
        .unwrap();
        assert_eq!(client.endpoint, "http://localhost:8000/v1/chat/completions");
        assert_eq!(client.model(), "openai/gpt-4o");
    }

    #[test]
    fn test_request_serialization() {
        let messages = vec![
            ChatMessage::new(Role::System, "rules"),
            ChatMessage::new(Role::User, "go"),
        ];
        let request = ChatRequest {
            model: "m",
            messages: &messages,
            stream: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "go");
    }

    #[test]
    fn test_response_parsing_null_content() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert_eq!(parsed.choices[0].message.content, None);
    }

    /// Serves the canned responses in order, one per connection; the last
    /// one repeats. Returns the endpoint URL and a request counter.
    async fn stub_server(responses: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                read_request(&mut socket).await;
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let response = &responses[n.min(responses.len() - 1)];
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/v1/chat/completions"), hits)
    }

    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    fn http_response(status: &str, headers: &[&str], body: &str) -> String {
        let mut out = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n",
            body.len()
        );
        for header in headers {
            out.push_str(header);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(body);
        out
    }

    fn completion(text: &str) -> String {
        http_response(
            "200 OK",
            &[],
            &serde_json::json!({"choices": [{"message": {"content": text}}]}).to_string(),
        )
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            multiplier: 3,
            max_delay: Duration::from_millis(100),
        }
    }

    fn client_for(endpoint: &str, policy: RetryPolicy) -> OpenRouterClient {
        OpenRouterClient::new(endpoint, "key", "m", Duration::from_secs(5), policy).unwrap()
    }

    fn prompt() -> Vec<ChatMessage> {
        vec![ChatMessage::new(Role::User, "Pump or Cash Out?")]
    }

    #[tokio::test]
    async fn test_rate_limit_then_success() {
        let limited = http_response("429 Too Many Requests", &["retry-after: 0"], "{}");
        let (endpoint, hits) =
            stub_server(vec![limited.clone(), limited, completion("Pump")]).await;

        // Default 5 s base; the zero hint must win
        let client = client_for(&endpoint, RetryPolicy::default());
        let started = Instant::now();
        let outcome = client.send(&prompt()).await;

        assert_eq!(outcome, SendOutcome::Delivered("Pump".to_string()));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_attempts() {
        let (endpoint, hits) =
            stub_server(vec![http_response("503 Service Unavailable", &[], "{}")]).await;

        let outcome = client_for(&endpoint, fast_policy()).send(&prompt()).await;

        assert!(!outcome.is_ok());
        assert_eq!(outcome.text(), "");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let (endpoint, hits) = stub_server(vec![
            http_response("401 Unauthorized", &[], r#"{"error":"bad key"}"#),
            completion("Pump"),
        ])
        .await;

        let outcome = client_for(&endpoint, fast_policy()).send(&prompt()).await;

        assert!(matches!(outcome, SendOutcome::Failed(ref reason) if reason.contains("401")));
        assert_eq!(outcome.text(), "");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversized_body_hint_falls_back_to_backoff() {
        let (endpoint, hits) = stub_server(vec![
            http_response(
                "429 Too Many Requests",
                &[],
                r#"{"error":{"metadata":{"retry_after": 99999999999999999999999}}}"#,
            ),
            completion("Cash Out"),
        ])
        .await;

        let outcome = client_for(&endpoint, fast_policy()).send(&prompt()).await;

        assert_eq!(outcome, SendOutcome::Delivered("Cash Out".to_string()));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_without_retry() {
        let client = OpenRouterClient::new(
            "http://127.0.0.1:1/v1/chat/completions",
            "key",
            "m",
            Duration::from_secs(5),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                multiplier: 3,
                max_delay: Duration::from_millis(100),
            },
        )
        .unwrap();
        let outcome = client
            .send(&[ChatMessage::new(Role::User, "Pump or Cash Out?")])
            .await;
        assert!(!outcome.is_ok());
        assert_eq!(outcome.text(), "");
    }
}
