use futures::StreamExt;
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::client::{ClientError, GenerationOptions, Message, StreamingCompletionClient};
use crate::metrics::RequestRecord;
use crate::stats::BatchSummary;
use crate::tokenizer::{TokenCounter, WhitespaceTokenizer};

/// Monotonic time source, in seconds from an arbitrary origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Seconds elapsed since the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    records: Vec<RequestRecord>,
    batch_start: Option<f64>,
}

/// A consistent view of the tracker at one instant.
#[derive(Debug, Clone)]
pub struct TrackerSnapshot {
    pub records: Vec<RequestRecord>,
    pub batch_start: Option<f64>,
    pub taken_at: f64,
    pub summary: BatchSummary,
}

impl TrackerSnapshot {
    pub fn batch_duration(&self) -> Option<f64> {
        self.batch_start.map(|start| self.taken_at - start)
    }
}

/// Wraps a [`StreamingCompletionClient`] and records timing for every
/// streamed completion issued through it.
///
/// The batch clock starts with the first request and keeps running until
/// [`reset`](Self::reset). The tracker can be shared between tasks (for
/// example behind an `Arc`); it does not limit concurrency itself.
///
/// # Examples
///
/// ```no_run
/// use llm_perf::client::{ClientConfig, GenerationOptions, Message, OpenAIClient};
/// use llm_perf::RequestTracker;
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let client = OpenAIClient::new(ClientConfig {
///     base_url: "http://localhost:11434/v1".to_string(),
///     api_key: None,
///     timeout: Duration::from_secs(60),
///     max_retries: 0,
///     retry_initial_delay_ms: 100,
///     retry_max_delay_ms: 10000,
///     pool_size: 10,
/// })?;
/// let tracker = RequestTracker::new(client);
///
/// let reply = tracker
///     .chat_completion("llama3", &[Message::user("Hello!")], &GenerationOptions::default())
///     .await?;
/// println!("{reply}");
/// println!("{:?}", tracker.summary().ttft);
/// # Ok(())
/// # }
/// ```
pub struct RequestTracker<C> {
    client: C,
    clock: Arc<dyn Clock>,
    tokenizer: Arc<dyn TokenCounter>,
    request_timeout: Option<Duration>,
    state: Mutex<TrackerState>,
}

impl<C: StreamingCompletionClient> RequestTracker<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            clock: Arc::new(MonotonicClock::new()),
            tokenizer: Arc::new(WhitespaceTokenizer),
            request_timeout: None,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn TokenCounter>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    /// Fail any request whose stream has not finished within `timeout`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Issue one streamed completion and return the concatenated output.
    ///
    /// A record is appended whether the request succeeds or fails. Errors
    /// from the client, including a configured timeout, are recorded and
    /// then returned unchanged. Dropping the returned future before it
    /// completes also records a failure.
    pub async fn chat_completion(
        &self,
        model: &str,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<String, ClientError> {
        let input_tokens = self.count_input_tokens(messages);
        let request_start = self.begin_request();
        let in_flight = InFlight::new(self, request_start, input_tokens);

        debug!(
            "Issuing request - model: {}, messages: {}, input_tokens: {}",
            model,
            messages.len(),
            input_tokens
        );

        let outcome = match self.request_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.consume(model, messages, options)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ClientError::Timeout(limit)),
                }
            }
            None => self.consume(model, messages, options).await,
        };

        match outcome {
            Ok(streamed) => {
                let output_tokens = self.tokenizer.count_tokens(&streamed.text);
                let record = RequestRecord::completed(
                    request_start,
                    streamed.first_token_time,
                    streamed.request_end,
                    input_tokens,
                    output_tokens,
                );

                debug!(
                    "Request completed - input_tokens: {}, output_tokens: {}, ttft_ms: {:.1}, total_ms: {:.1}",
                    input_tokens,
                    output_tokens,
                    record.ttft().unwrap_or_default() * 1000.0,
                    record.e2e_latency() * 1000.0
                );

                in_flight.settle(record);
                Ok(streamed.text)
            }
            Err(e) => {
                let record = RequestRecord::failed(request_start, self.clock.now(), input_tokens);
                debug!("Request failed: {}", e);
                in_flight.settle(record);
                Err(e)
            }
        }
    }

    /// Drive the client's stream to exhaustion.
    async fn consume(
        &self,
        model: &str,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<Streamed, ClientError> {
        let mut stream = self.client.issue(model, messages, options).await?;

        let mut first_token_time = None;
        let mut text = String::new();

        while let Some(chunk) = stream.next().await {
            let Some(content) = chunk?.content else {
                continue;
            };
            if content.is_empty() {
                continue;
            }
            if first_token_time.is_none() {
                first_token_time = Some(self.clock.now());
            }
            text.push_str(&content);
        }

        Ok(Streamed {
            first_token_time,
            request_end: self.clock.now(),
            text,
        })
    }

    fn count_input_tokens(&self, messages: &[Message]) -> u64 {
        let joined = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        self.tokenizer.count_tokens(&joined)
    }
}

impl<C> RequestTracker<C> {
    /// Stamp the request start, starting the batch clock if this is the
    /// first request since creation or the last reset.
    fn begin_request(&self) -> f64 {
        let mut state = self.state.lock();
        let now = self.clock.now();
        state.batch_start.get_or_insert(now);
        now
    }

    fn push(&self, record: RequestRecord) {
        self.state.lock().records.push(record);
    }

    /// All records so far, in completion order.
    pub fn records(&self) -> Vec<RequestRecord> {
        self.state.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Start of the batch, or `None` before the first request.
    pub fn batch_start(&self) -> Option<f64> {
        self.state.lock().batch_start
    }

    /// Aggregate statistics over everything recorded so far, using the time
    /// since the first request as the batch duration.
    pub fn summary(&self) -> BatchSummary {
        self.snapshot().summary
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let (records, batch_start) = {
            let state = self.state.lock();
            (state.records.clone(), state.batch_start)
        };
        let taken_at = self.clock.now();

        let summary = match batch_start {
            Some(start) => BatchSummary::compute(&records, taken_at - start),
            None => BatchSummary::default(),
        };

        TrackerSnapshot {
            records,
            batch_start,
            taken_at,
            summary,
        }
    }

    /// Drop all records and stop the batch clock.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.records.clear();
        state.batch_start = None;
    }
}

struct Streamed {
    first_token_time: Option<f64>,
    request_end: f64,
    text: String,
}

/// Guarantees one record per started request: if the request future is
/// dropped before settling, a failed record is written on drop.
struct InFlight<'a, C> {
    tracker: &'a RequestTracker<C>,
    request_start: f64,
    input_tokens: u64,
    settled: bool,
}

impl<'a, C> InFlight<'a, C> {
    fn new(tracker: &'a RequestTracker<C>, request_start: f64, input_tokens: u64) -> Self {
        Self {
            tracker,
            request_start,
            input_tokens,
            settled: false,
        }
    }

    fn settle(mut self, record: RequestRecord) {
        self.settled = true;
        self.tracker.push(record);
    }
}

impl<C> Drop for InFlight<'_, C> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        debug!("Request dropped before completion");
        let record = RequestRecord::failed(
            self.request_start,
            self.tracker.clock.now(),
            self.input_tokens,
        );
        self.tracker.push(record);
    }
}
