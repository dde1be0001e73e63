use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("HTTP {status} client error: {message}")]
    Http4xx { status: u16, message: String },

    #[error("HTTP {status} server error: {message}")]
    Http5xx { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Other error: {0}")]
    Other(String),
}

impl ClientError {
    /// Connection failures, timeouts and server errors are worth retrying.
    pub fn is_retriable(&self) -> bool {
        match self {
            ClientError::Connection(_) => true,
            ClientError::Timeout(_) => true,
            ClientError::Http5xx { .. } => true,
            ClientError::Http4xx { .. } => false,
            ClientError::Parse(_) => false,
            ClientError::Cancelled => false,
            ClientError::Other(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    Single(String),
    Multiple(Vec<String>),
}

/// Optional sampling and generation parameters.
///
/// Only fields that are set are sent with the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<BTreeMap<String, i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
}

/// One item of a streamed completion. Role-only and finish chunks carry no
/// content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextChunk {
    pub content: Option<String>,
}

impl TextChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
        }
    }

    pub fn empty() -> Self {
        Self { content: None }
    }
}

pub type FragmentStream = BoxStream<'static, Result<TextChunk, ClientError>>;

/// Anything that can issue a streamed chat completion.
///
/// An error from `issue` or an error item in the stream both mean the
/// request failed; the end of the stream means the response is complete.
#[async_trait]
pub trait StreamingCompletionClient: Send + Sync {
    async fn issue(
        &self,
        model: &str,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<FragmentStream, ClientError>;
}

#[async_trait]
impl<T: StreamingCompletionClient + ?Sized> StreamingCompletionClient for Arc<T> {
    async fn issue(
        &self,
        model: &str,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<FragmentStream, ClientError> {
        (**self).issue(model, messages, options).await
    }
}

// Request body for the OpenAI Chat Completions API
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub stream: bool,
    #[serde(flatten)]
    pub options: &'a GenerationOptions,
}

// Streaming response types
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    /// Set by some servers when generation fails after the stream opened.
    /// `null` deserializes to `None`.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta {
    pub role: Option<String>,
    pub content: Option<String>,
}

/// Configuration for creating an OpenAI client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the OpenAI-compatible API endpoint
    pub base_url: String,
    /// Optional API key for authentication
    pub api_key: Option<String>,
    /// Request timeout duration
    pub timeout: Duration,
    /// Maximum number of retry attempts for transient failures
    pub max_retries: u32,
    /// Initial delay in milliseconds for exponential backoff
    pub retry_initial_delay_ms: u64,
    /// Maximum delay in milliseconds for exponential backoff
    pub retry_max_delay_ms: u64,
    /// Connection pool size (should match concurrency for optimal performance)
    pub pool_size: usize,
}

/// `StreamingCompletionClient` over HTTP with server-sent events.
#[derive(Debug, Clone)]
pub struct OpenAIClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    max_retries: u32,
    retry_initial_delay_ms: u64,
    retry_max_delay_ms: u64,
}

impl OpenAIClient {
    /// Creates a new OpenAI-compatible HTTP client with retry logic and connection pooling.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use llm_perf::client::{ClientConfig, OpenAIClient};
    /// use std::time::Duration;
    ///
    /// let config = ClientConfig {
    ///     base_url: "http://localhost:11434/v1".to_string(),
    ///     api_key: None,
    ///     timeout: Duration::from_secs(60),
    ///     max_retries: 3,
    ///     retry_initial_delay_ms: 100,
    ///     retry_max_delay_ms: 10000,
    ///     pool_size: 10,
    /// };
    ///
    /// let client = OpenAIClient::new(config).unwrap();
    /// ```
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_size)
            .pool_idle_timeout(Duration::from_secs(300))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| ClientError::Other(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            timeout: config.timeout,
            max_retries: config.max_retries,
            retry_initial_delay_ms: config.retry_initial_delay_ms,
            retry_max_delay_ms: config.retry_max_delay_ms,
        })
    }

    /// Open the event stream, retrying transient failures with backoff.
    ///
    /// Only opening the stream is retried. Once content has started flowing a
    /// failure ends the request.
    pub async fn open_stream(
        &self,
        request: &ChatCompletionRequest<'_>,
    ) -> Result<SseStream, ClientError> {
        let mut attempt = 0;

        loop {
            match self.open_stream_once(request).await {
                Ok(stream) => {
                    if attempt > 0 {
                        log::debug!("Request succeeded after {} retries", attempt);
                    }
                    return Ok(stream);
                }
                Err(e) if attempt < self.max_retries && e.is_retriable() => {
                    let delay = self.calculate_backoff_delay(attempt);
                    log::debug!(
                        "Request failed (attempt {}/{}): {}. Retrying in {:?}",
                        attempt + 1,
                        self.max_retries + 1,
                        e,
                        delay
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 0 {
                        log::debug!("Request failed after {} retries: {}", attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn open_stream_once(
        &self,
        request: &ChatCompletionRequest<'_>,
    ) -> Result<SseStream, ClientError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut req = self
            .client
            .post(&url)
            .json(request)
            .header("Accept", "text/event-stream");

        if let Some(api_key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req.send().await.map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            let status_code = response.status().as_u16();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());

            return Err(if (400..500).contains(&status_code) {
                ClientError::Http4xx {
                    status: status_code,
                    message: text,
                }
            } else if (500..600).contains(&status_code) {
                ClientError::Http5xx {
                    status: status_code,
                    message: text,
                }
            } else {
                ClientError::Other(format!("HTTP {}: {}", status_code, text))
            });
        }

        Ok(SseStream::new(response, self.timeout))
    }

    fn classify(&self, e: reqwest::Error) -> ClientError {
        classify_transport_error(e, self.timeout)
    }

    /// Calculate exponential backoff delay with jitter
    fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let base_delay_ms = self
            .retry_initial_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        let capped_delay_ms = base_delay_ms.min(self.retry_max_delay_ms);

        // Random value between 50% and 100% of the capped delay
        let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_millis((capped_delay_ms as f64 * jitter_factor) as u64)
    }
}

#[async_trait]
impl StreamingCompletionClient for OpenAIClient {
    async fn issue(
        &self,
        model: &str,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<FragmentStream, ClientError> {
        let request = ChatCompletionRequest {
            model,
            messages,
            stream: true,
            options,
        };

        let sse = self.open_stream(&request).await?;
        Ok(sse.into_stream())
    }
}

fn classify_transport_error(e: reqwest::Error, timeout: Duration) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout(timeout)
    } else if e.is_connect() {
        ClientError::Connection(e.to_string())
    } else if e.is_request() || e.is_body() {
        let err_msg = e.to_string();
        if err_msg.contains("connection closed")
            || err_msg.contains("connection reset")
            || err_msg.contains("broken pipe")
            || err_msg.contains("connection refused")
        {
            ClientError::Connection(format!("Request error: {}", e))
        } else {
            ClientError::Other(format!("Request error: {}", e))
        }
    } else {
        ClientError::Other(e.to_string())
    }
}

/// Incremental parser over an SSE response body.
///
/// Network chunks do not line up with events, so partial lines are carried
/// over between reads.
pub struct SseStream {
    response: reqwest::Response,
    timeout: Duration,
    buffer: Vec<u8>,
    pending: VecDeque<TextChunk>,
    failure: Option<ClientError>,
    done: bool,
}

impl SseStream {
    fn new(response: reqwest::Response, timeout: Duration) -> Self {
        Self {
            response,
            timeout,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            failure: None,
            done: false,
        }
    }

    pub async fn next_chunk(&mut self) -> Result<Option<TextChunk>, ClientError> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Ok(Some(chunk));
            }
            // Content parsed before a failure is still delivered first.
            if let Some(e) = self.failure.take() {
                return Err(e);
            }
            if self.done {
                return Ok(None);
            }

            let bytes = match self.response.chunk().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.done = true;
                    return Err(classify_transport_error(e, self.timeout));
                }
            };

            match bytes {
                Some(bytes) => {
                    self.buffer.extend_from_slice(&bytes);
                    while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                        self.handle_line(&line);
                    }
                }
                None => {
                    // Body ended without [DONE]; flush a trailing unterminated line.
                    let rest = std::mem::take(&mut self.buffer);
                    self.handle_line(&rest);
                    self.done = true;
                }
            }
        }
    }

    fn handle_line(&mut self, raw: &[u8]) {
        if self.done {
            return;
        }

        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);

        let Some(data) = line.strip_prefix("data:") else {
            // Blank separators, comments, and event/id fields carry no content.
            return;
        };
        let data = data.trim_start();

        if data == "[DONE]" {
            self.done = true;
            return;
        }
        if data.is_empty() {
            return;
        }

        match parse_chunk(data) {
            Ok(chunk) => self.pending.push_back(chunk),
            Err(e) => {
                self.failure = Some(e);
                self.done = true;
            }
        }
    }

    pub fn into_stream(self) -> FragmentStream {
        Box::pin(stream::unfold(self, |mut sse| async move {
            match sse.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), sse)),
                Ok(None) => None,
                Err(e) => Some((Err(e), sse)),
            }
        }))
    }
}

/// Parse one `data:` payload into the content of the first choice.
///
/// A payload carrying a non-null `error` and no choices fails the stream.
fn parse_chunk(data: &str) -> Result<TextChunk, ClientError> {
    let chunk: ChatCompletionChunk = serde_json::from_str(data)
        .map_err(|e| ClientError::Parse(format!("{}: {}", e, data)))?;

    if chunk.choices.is_empty()
        && let Some(error) = chunk.error
    {
        return Err(ClientError::Other(format!("Server error in stream: {}", error)));
    }

    Ok(TextChunk {
        content: chunk
            .choices
            .into_iter()
            .find(|choice| choice.index == 0)
            .and_then(|choice| choice.delta.content),
    })
}
