use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{ClientConfig, GenerationOptions};
use crate::tokenizer::TokenizerKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub generation: GenerationOptions,
    #[serde(default)]
    pub tracker: TrackerConfig,
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64, // seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Upper bound on a whole request, issue through end of stream (e.g. "30s")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<String>,
    #[serde(default)]
    pub tokenizer: TokenizerKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub prompts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_format")]
    pub format: OutputFormat,
    /// Directory the JSON report is written to
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
    /// Report file name; timestamped when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default = "default_save")]
    pub save: bool,
    #[serde(default)]
    pub quiet: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// Per-module log level overrides (e.g., ["hyper=info", "h2=warn"])
    #[serde(default)]
    pub filter: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Console,
    Json,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_output_format(),
            directory: default_output_directory(),
            file: None,
            save: default_save(),
            quiet: false,
            trace_log: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: Vec::new(),
        }
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_retry_initial_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    10000 // 10 seconds
}

fn default_concurrency() -> usize {
    10
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Console
}

fn default_output_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_save() -> bool {
    true
}

fn default_worker_threads() -> usize {
    num_cpus::get()
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoint.model.trim().is_empty() {
            anyhow::bail!("endpoint.model must not be empty");
        }

        if self.workload.prompts.is_empty() {
            anyhow::bail!("workload.prompts must contain at least one prompt");
        }

        if self.workload.concurrency == 0 {
            anyhow::bail!("concurrency must be greater than 0");
        }

        if self.runtime.worker_threads == 0 {
            anyhow::bail!("worker_threads must be greater than 0");
        }

        if let Some(timeout) = self.request_timeout()?
            && timeout.is_zero()
        {
            anyhow::bail!("request_timeout must be greater than 0");
        }

        if let Some(temperature) = self.generation.temperature
            && !(0.0..=2.0).contains(&temperature)
        {
            anyhow::bail!("temperature must be between 0 and 2");
        }

        Ok(())
    }

    /// The parsed `[tracker] request_timeout`, if configured.
    pub fn request_timeout(&self) -> anyhow::Result<Option<Duration>> {
        match &self.tracker.request_timeout {
            Some(value) => humantime::parse_duration(value)
                .map(Some)
                .map_err(|e| anyhow::anyhow!("invalid request_timeout {:?}: {}", value, e)),
            None => Ok(None),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.endpoint.base_url.clone(),
            api_key: self.endpoint.api_key.clone(),
            timeout: Duration::from_secs(self.endpoint.timeout),
            max_retries: self.endpoint.max_retries,
            retry_initial_delay_ms: self.endpoint.retry_initial_delay_ms,
            retry_max_delay_ms: self.endpoint.retry_max_delay_ms,
            pool_size: self.workload.concurrency,
        }
    }
}
