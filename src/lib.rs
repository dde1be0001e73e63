pub mod cli;
pub mod client;
pub mod config;
pub mod metrics;
pub mod report;
pub mod stats;
pub mod tokenizer;
pub mod tracker;

pub use cli::Cli;
pub use client::{
    ClientConfig, ClientError, GenerationOptions, Message, OpenAIClient,
    StreamingCompletionClient, TextChunk,
};
pub use config::Config;
pub use metrics::{RequestRecord, RequestStats, RequestStatus};
pub use report::{MetricsReport, PersistError, load_metrics_from_json, save_metrics_to_json};
pub use stats::{BatchSummary, LatencyStats, ThroughputStats, percentile};
pub use tokenizer::{TokenCounter, TokenizerKind, WhitespaceTokenizer};
pub use tracker::{Clock, MonotonicClock, RequestTracker, TrackerSnapshot};
